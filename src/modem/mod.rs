//! Cellular modem control: USB AT transport, call state machine, SMS.

pub mod controller;
pub mod transport;
pub mod urc;

pub use controller::ModemController;
pub use transport::{AtTransport, UsbTransport};

use crate::phone::PhoneNumber;
use std::time::Instant;

/// Call direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Lifecycle state of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    /// Dial command issued, waiting for the network.
    Dialing,
    /// Outgoing call alerting at the far end.
    Ringing,
    /// Incoming call waiting to be answered.
    Incoming,
    Connected,
    Ended,
    Failed,
}

impl CallState {
    /// Terminal states absorb for the lifetime of the call.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Failed)
    }

    /// Lowercase name for logs and call records.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Dialing => "dialing",
            Self::Ringing => "ringing",
            Self::Incoming => "incoming",
            Self::Connected => "connected",
            Self::Ended => "ended",
            Self::Failed => "failed",
        }
    }
}

/// Whether `from -> to` is a legal step along the call lifecycle.
///
/// The machine only moves forward; terminal states never leave.
#[must_use]
pub fn can_transition(from: CallState, to: CallState) -> bool {
    use CallState::*;
    if from == to || from.is_terminal() {
        return false;
    }
    matches!(
        (from, to),
        (Idle, Dialing | Incoming | Connected)
            | (Dialing, Ringing | Connected | Ended | Failed)
            | (Ringing, Connected | Ended | Failed)
            | (Incoming, Connected | Ended)
            | (Connected, Ended)
    )
}

/// Snapshot of the current call. Mutated only by the modem controller;
/// everything else observes clones.
#[derive(Debug, Clone)]
pub struct CallInfo {
    pub number: PhoneNumber,
    pub direction: CallDirection,
    pub state: CallState,
    pub start_time: Instant,
    pub connect_time: Option<Instant>,
    pub end_time: Option<Instant>,
}

impl CallInfo {
    /// Start tracking a call in the given initial state.
    #[must_use]
    pub fn new(number: PhoneNumber, direction: CallDirection, state: CallState) -> Self {
        Self {
            number,
            direction,
            state,
            start_time: Instant::now(),
            connect_time: None,
            end_time: None,
        }
    }

    /// Apply a state transition, stamping connect/end times.
    ///
    /// Illegal transitions are ignored and return `false`.
    pub fn advance(&mut self, to: CallState) -> bool {
        if !can_transition(self.state, to) {
            return false;
        }
        if to == CallState::Connected && self.connect_time.is_none() {
            self.connect_time = Some(Instant::now());
        }
        if to.is_terminal() && self.end_time.is_none() {
            self.end_time = Some(Instant::now());
        }
        self.state = to;
        true
    }

    /// Seconds since connect, or zero when never connected.
    #[must_use]
    pub fn connected_secs(&self) -> f64 {
        match self.connect_time {
            Some(t) => self.end_time.unwrap_or_else(Instant::now).duration_since(t).as_secs_f64(),
            None => 0.0,
        }
    }
}

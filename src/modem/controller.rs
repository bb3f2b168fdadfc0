//! Modem controller: AT serialization, call state machine, SMS, reconnect.
//!
//! One mutex serializes every AT exchange. A background monitor polls
//! `AT+CLCC` twice a second, folds unsolicited result codes into the call
//! state machine, and dispatches inbound SMS. A USB "no such device" error
//! marks the transport dead and kicks off a single asynchronous reconnect.

use crate::config::ModemConfig;
use crate::error::{AgentError, Result};
use crate::modem::transport::{AtTransport, TransportFactory};
use crate::modem::urc::{self, clcc_stat};
use crate::modem::{CallDirection, CallInfo, CallState};
use crate::phone::PhoneNumber;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

type StateCallback = Box<dyn Fn(CallState) + Send + Sync>;
type SmsCallback = Box<dyn Fn(&str, &str) + Send + Sync>;

/// Cellular modem controller.
///
/// Cloneable handle; all clones share the transport, the call state, and
/// the monitor task. Exactly one call is active at a time.
#[derive(Clone)]
pub struct ModemController {
    inner: Arc<Inner>,
}

struct Inner {
    config: ModemConfig,
    factory: TransportFactory,
    transport: Mutex<Option<Box<dyn AtTransport>>>,
    call: Mutex<Option<CallInfo>>,
    state_callbacks: Mutex<Vec<StateCallback>>,
    sms_callbacks: Mutex<Vec<SmsCallback>>,
    /// Pauses the monitor poll while a multi-step SMS exchange owns the
    /// transport.
    sms_in_progress: AtomicBool,
    /// At most one reconnect attempt in flight.
    reconnecting: AtomicBool,
    running: AtomicBool,
    monitor: Mutex<Option<std::thread::JoinHandle<()>>>,
    weak_self: Weak<Inner>,
}

impl ModemController {
    /// Create a controller over a transport factory.
    #[must_use]
    pub fn new(config: ModemConfig, factory: TransportFactory) -> Self {
        let inner = Arc::new_cyclic(|weak| Inner {
            config,
            factory,
            transport: Mutex::new(None),
            call: Mutex::new(None),
            state_callbacks: Mutex::new(Vec::new()),
            sms_callbacks: Mutex::new(Vec::new()),
            sms_in_progress: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            running: AtomicBool::new(false),
            monitor: Mutex::new(None),
            weak_self: weak.clone(),
        });
        Self { inner }
    }

    /// Create a controller over the USB transport.
    #[must_use]
    pub fn over_usb(config: ModemConfig) -> Self {
        Self::new(config, Box::new(crate::modem::transport::UsbTransport::open))
    }

    /// Connect to the modem and start the monitor task.
    ///
    /// # Errors
    ///
    /// Returns an error when no modem is found or the SIM never becomes
    /// ready.
    pub fn connect(&self) -> Result<()> {
        let mut last_err = AgentError::Modem("modem not found".into());
        for attempt in 1..=3u32 {
            match (self.inner.factory)() {
                Ok(transport) => {
                    *self.inner.lock_transport()? = Some(transport);
                    match self.inner.init_sequence() {
                        Ok(()) => {
                            Inner::start_monitor(&self.inner);
                            return Ok(());
                        }
                        Err(e) => {
                            warn!("modem init failed (attempt {attempt}/3): {e}");
                            *self.inner.lock_transport()? = None;
                            last_err = e;
                        }
                    }
                }
                Err(e) => {
                    debug!("modem not found, retrying (attempt {attempt}/3)");
                    last_err = e;
                }
            }
            std::thread::sleep(Duration::from_millis(
                self.inner.config.reconnect_backoff_ms / 2,
            ));
        }
        Err(last_err)
    }

    /// Hang up anything in flight, stop the monitor, release the device.
    pub fn disconnect(&self) {
        self.inner.stop_monitor();
        if let Ok(mut guard) = self.inner.call.lock() {
            *guard = None;
        }
        let _ = self
            .inner
            .send_at_timeout("AT+CHUP", Duration::from_millis(1000));
        if let Ok(mut guard) = self.inner.transport.lock() {
            *guard = None;
        }
        info!("disconnected from modem");
    }

    /// Whether the transport currently holds a live device.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner
            .transport
            .lock()
            .map(|g| g.is_some())
            .unwrap_or(false)
    }

    /// Register a call-state callback. Invoked on the monitor task; must
    /// not block.
    pub fn on_state_change(&self, callback: StateCallback) {
        if let Ok(mut guard) = self.inner.state_callbacks.lock() {
            guard.push(callback);
        }
    }

    /// Register an inbound SMS callback `(sender, decoded_body)`.
    pub fn on_sms(&self, callback: SmsCallback) {
        if let Ok(mut guard) = self.inner.sms_callbacks.lock() {
            guard.push(callback);
        }
    }

    /// Snapshot of the current call.
    #[must_use]
    pub fn call_info(&self) -> Option<CallInfo> {
        self.inner.call.lock().ok().and_then(|g| g.clone())
    }

    /// Drop the finished call record so the next call starts clean.
    pub fn clear_call(&self) {
        if let Ok(mut guard) = self.inner.call.lock() {
            *guard = None;
        }
    }

    /// Initiate an outbound voice call.
    ///
    /// Routes audio to the headset path, then dials. On `OK` the call sits
    /// in RINGING until the monitor observes an active CLCC row.
    ///
    /// # Errors
    ///
    /// Returns an error if the dial command is rejected.
    pub fn dial(&self, number: &PhoneNumber) -> Result<()> {
        info!("dialing {number}");

        {
            let mut guard = self.inner.lock_call()?;
            *guard = Some(CallInfo::new(
                number.clone(),
                CallDirection::Outgoing,
                CallState::Dialing,
            ));
        }
        self.inner.notify_state(CallState::Dialing);

        self.inner.setup_call_audio();

        let response = self.inner.send_at_timeout(
            &format!("ATD{};", number.digits()),
            Duration::from_millis(5000),
        )?;

        if response.contains("OK") {
            self.inner.set_call_state(CallState::Ringing);
            Ok(())
        } else {
            self.inner.set_call_state(CallState::Failed);
            Err(AgentError::Call(format!(
                "dial rejected: {}",
                response.trim()
            )))
        }
    }

    /// Answer the waiting incoming call.
    ///
    /// # Errors
    ///
    /// Returns an error if the modem rejects `ATA`.
    pub fn answer(&self) -> Result<()> {
        self.inner.setup_call_audio();
        let response = self.inner.send_at("ATA")?;
        if response.contains("OK") {
            self.inner.set_call_state(CallState::Connected);
            Ok(())
        } else {
            Err(AgentError::Call(format!(
                "answer failed: {}",
                response.trim()
            )))
        }
    }

    /// End the current call.
    pub fn hangup(&self) {
        let _ = self.inner.send_at("AT+CHUP");
        self.inner.set_call_state(CallState::Ended);
    }

    /// Reject the waiting incoming call.
    pub fn reject(&self) {
        let _ = self.inner.send_at("AT+CHUP");
        self.inner.set_call_state(CallState::Ended);
    }

    /// Send a DTMF digit into the active call.
    pub fn send_dtmf(&self, digit: char) {
        let _ = self.inner.send_at(&format!("AT+VTS={digit}"));
    }

    /// Put the active call on hold.
    ///
    /// # Errors
    ///
    /// Returns an error if the network rejects the request.
    pub fn hold(&self) -> Result<()> {
        let response = self.inner.send_at("AT+CHLD=2")?;
        if response.contains("OK") {
            info!("call placed on hold");
            Ok(())
        } else {
            Err(AgentError::Call(format!("hold failed: {}", response.trim())))
        }
    }

    /// Resume the held call.
    ///
    /// # Errors
    ///
    /// Returns an error if the network rejects the request.
    pub fn resume(&self) -> Result<()> {
        let response = self.inner.send_at("AT+CHLD=2")?;
        if response.contains("OK") {
            info!("call resumed");
            Ok(())
        } else {
            Err(AgentError::Call(format!("resume failed: {}", response.trim())))
        }
    }

    /// Block until an incoming call arrives, or `timeout` elapses.
    ///
    /// Enables caller-id presentation first. Returns the caller's number;
    /// an empty number means the network withheld it.
    #[must_use]
    pub fn wait_for_incoming_call(&self, timeout: Option<Duration>) -> Option<PhoneNumber> {
        let _ = self.inner.send_at("AT+CLIP=1");
        let start = Instant::now();

        loop {
            if let Some(limit) = timeout {
                if start.elapsed() > limit {
                    return None;
                }
            }
            if let Some(call) = self.call_info() {
                if call.state == CallState::Incoming {
                    return Some(call.number);
                }
            }
            std::thread::sleep(Duration::from_millis(200));
        }
    }

    /// Raw AT exchange; response text accumulated until OK/ERROR.
    ///
    /// # Errors
    ///
    /// Returns an error when the transport is gone or the device fails.
    pub fn send_at(&self, cmd: &str) -> Result<String> {
        self.inner.send_at(cmd)
    }

    /// Signal strength (0-31, 99 unknown).
    #[must_use]
    pub fn signal_strength(&self) -> Option<i32> {
        let response = self.inner.send_at("AT+CSQ").ok()?;
        urc::parse_csq(&response)
    }

    /// Operator name and approximate signal level in dBm.
    #[must_use]
    pub fn network_info(&self) -> Option<(String, i32)> {
        let operator = self
            .inner
            .send_at("AT+COPS?")
            .ok()
            .and_then(|r| urc::parse_cops_operator(&r))?;
        let rssi = self.signal_strength().unwrap_or(99);
        let dbm = if rssi < 99 { -113 + rssi * 2 } else { 0 };
        Some((operator, dbm))
    }

    /// Send an SMS.
    ///
    /// The monitor is paused for the duration so its CLCC polls cannot
    /// interleave with the multi-step `CMGS` exchange.
    ///
    /// # Errors
    ///
    /// Returns an error if the prompt never arrives or the network
    /// rejects the message.
    pub fn send_sms(&self, number: &PhoneNumber, body: &str) -> Result<()> {
        info!("sending SMS to {number} ({} chars)", body.len());

        self.inner.sms_in_progress.store(true, Ordering::SeqCst);
        // Let the monitor finish its current iteration before taking over.
        std::thread::sleep(Duration::from_millis(
            self.inner.config.command_pacing_ms * 2,
        ));

        let result = self.inner.send_sms_locked(number, body);
        self.inner.sms_in_progress.store(false, Ordering::SeqCst);
        result
    }

    /// Transfer the active call to another number.
    ///
    /// Tries Explicit Call Transfer first, then the 3-way path: dial the
    /// target, wait for it to answer, merge with `CHLD=3`. A failed merge
    /// resumes the original call.
    ///
    /// # Errors
    ///
    /// Returns an error when every method fails.
    pub fn transfer_to(&self, number: &PhoneNumber) -> Result<()> {
        let inner = &self.inner;
        info!("initiating transfer to {number}");

        let _ = inner.send_at("AT+CCWA=1");
        let _ = inner.send_at("AT+CSSN=1,1");
        std::thread::sleep(Duration::from_millis(inner.config.command_pacing_ms));

        // Explicit Call Transfer, with and without quotes, then the blind
        // ATD> form some firmwares accept.
        for cmd in [
            format!("AT+CTFR=\"{}\"", number.digits()),
            format!("AT+CTFR={}", number.digits()),
            format!("ATD>{};", number.digits()),
        ] {
            if let Ok(response) = inner.send_at(&cmd) {
                if response.contains("OK") && !response.contains("ERROR") {
                    info!("explicit call transfer accepted ({cmd})");
                    return Ok(());
                }
            }
        }

        info!("ECT not supported, trying 3-way merge");

        let response = inner.send_at_timeout(
            &format!("ATD{};", number.digits()),
            Duration::from_millis(5000),
        )?;
        if !response.contains("OK") {
            let _ = inner.send_at("AT+CHLD=2");
            return Err(AgentError::Call(format!(
                "transfer target dial rejected: {}",
                response.trim()
            )));
        }

        // Wait up to 30s for the target leg to go active.
        let poll = Duration::from_millis(inner.config.poll_interval_ms);
        let mut answered = false;
        for _ in 0..60 {
            std::thread::sleep(poll);
            let clcc = inner.send_at("AT+CLCC")?;
            let stats = urc::parse_clcc_stats(&clcc);
            if stats.len() >= 2 && stats.contains(&clcc_stat::ACTIVE) {
                answered = true;
                break;
            }
        }
        if !answered {
            warn!("transfer target did not answer");
            let _ = inner.send_at("AT+CHLD=2");
            return Err(AgentError::Call("transfer target did not answer".into()));
        }

        // Let the second leg stabilize before merging.
        std::thread::sleep(poll * 4);

        let merge = inner.send_at_timeout("AT+CHLD=3", Duration::from_millis(5000))?;
        if merge.contains("+CME ERROR")
            || merge.contains("ERROR")
            || merge.contains("VOICE CALL: END")
        {
            warn!("merge failed: {}", merge.trim());
            let _ = inner.send_at("AT+CHLD=2");
            return Err(AgentError::Call(format!("merge failed: {}", merge.trim())));
        }

        info!("3-way merge accepted, transfer complete");
        Ok(())
    }

    /// Attempt to reconnect after a USB disconnect (blocking).
    ///
    /// Only one attempt runs at a time; concurrent callers return `false`
    /// immediately.
    pub fn reconnect(&self) -> bool {
        Inner::do_reconnect(&self.inner)
    }

    #[cfg(test)]
    fn monitor_tick(&self) {
        self.inner.monitor_tick();
    }
}

impl Inner {
    fn lock_transport(&self) -> Result<std::sync::MutexGuard<'_, Option<Box<dyn AtTransport>>>> {
        self.transport
            .lock()
            .map_err(|e| AgentError::Modem(format!("transport lock poisoned: {e}")))
    }

    fn lock_call(&self) -> Result<std::sync::MutexGuard<'_, Option<CallInfo>>> {
        self.call
            .lock()
            .map_err(|e| AgentError::Modem(format!("call lock poisoned: {e}")))
    }

    fn send_at(&self, cmd: &str) -> Result<String> {
        self.send_at_timeout(cmd, Duration::from_millis(self.config.at_timeout_ms))
    }

    /// One serialized AT exchange: write, then read 512-byte chunks until
    /// OK/ERROR appears or the device stops producing data.
    fn send_at_timeout(&self, cmd: &str, timeout: Duration) -> Result<String> {
        let mut guard = self.lock_transport()?;
        let transport = guard
            .as_mut()
            .ok_or_else(|| AgentError::Modem("not connected".into()))?;

        match Self::exchange(transport.as_mut(), cmd, timeout) {
            Ok(response) => Ok(response),
            Err(e) => {
                let message = e.to_string();
                error!("AT command failed: {message}");
                if message.contains("no such device") {
                    // Device is gone; dispose the handle and reconnect in
                    // the background while this caller fails fast.
                    *guard = None;
                    drop(guard);
                    self.spawn_reconnect();
                }
                Err(e)
            }
        }
    }

    fn exchange(transport: &mut dyn AtTransport, cmd: &str, timeout: Duration) -> Result<String> {
        transport.write(format!("{cmd}\r\n").as_bytes(), timeout)?;
        std::thread::sleep(Duration::from_millis(100));

        let mut response = Vec::new();
        let mut buf = [0u8; 512];
        for _ in 0..20 {
            let n = transport.read(&mut buf, Duration::from_millis(200))?;
            if n == 0 {
                break;
            }
            response.extend_from_slice(&buf[..n]);
            if contains_subslice(&response, b"OK") || contains_subslice(&response, b"ERROR") {
                break;
            }
        }

        Ok(String::from_utf8_lossy(&response).into_owned())
    }

    /// Route call audio to the headset jack, set a non-clipping volume,
    /// enable the modem's echo suppression and TDD noise control.
    fn setup_call_audio(&self) {
        for cmd in ["AT+CSDVC=1", "AT+CLVL=1", "AT+CECM=1", "AT^PWRCTL=0,1,3"] {
            match self.send_at(cmd) {
                Ok(response) => debug!("{cmd}: {}", response.trim()),
                Err(e) => warn!("{cmd} failed: {e}"),
            }
        }
    }

    fn init_sequence(&self) -> Result<()> {
        let mut sim_ready = false;
        for attempt in 1..=3u32 {
            std::thread::sleep(Duration::from_millis(self.config.command_pacing_ms));
            let response = self.send_at_timeout("AT+CPIN?", Duration::from_millis(3000))?;
            if response.contains("READY") {
                sim_ready = true;
                break;
            }
            if response.contains("ERROR") {
                warn!("SIM error: {}", response.trim());
                break;
            }
            info!("SIM check attempt {attempt}: {}", response.trim());
        }

        if !sim_ready {
            // The SIM may report nothing useful while the modem itself
            // responds; a bare probe decides.
            let probe = self.send_at("AT")?;
            if probe.contains("OK") {
                warn!("SIM status unclear but modem responds, continuing");
            } else {
                return Err(AgentError::Modem("SIM not ready after retries".into()));
            }
        }

        if let Ok(csq) = self.send_at("AT+CSQ") {
            info!("signal: {}", csq.trim());
        }

        // Buffer URCs during AT exchanges, raise +CMTI on new SMS, text mode.
        self.send_at("AT+CNMI=2,1,0,0,0")?;
        self.send_at("AT+CMGF=1")?;
        info!("SMS notifications enabled (+CMTI)");
        Ok(())
    }

    fn notify_state(&self, state: CallState) {
        if let Ok(callbacks) = self.state_callbacks.lock() {
            for callback in callbacks.iter() {
                callback(state);
            }
        }
    }

    /// Advance the call state machine; illegal transitions are dropped.
    fn set_call_state(&self, to: CallState) {
        let advanced = {
            let mut guard = match self.call.lock() {
                Ok(g) => g,
                Err(_) => return,
            };
            match guard.as_mut() {
                Some(info) => info.advance(to),
                None => false,
            }
        };
        if advanced {
            info!("call state: {}", to.as_str());
            self.notify_state(to);
        }
    }

    fn start_monitor(inner: &Arc<Inner>) {
        inner.running.store(true, Ordering::SeqCst);
        let task = Arc::clone(inner);
        let handle = std::thread::Builder::new()
            .name("modem-monitor".into())
            .spawn(move || {
                while task.running.load(Ordering::SeqCst) {
                    if !task.sms_in_progress.load(Ordering::SeqCst) {
                        task.monitor_tick();
                    }
                    std::thread::sleep(Duration::from_millis(task.config.poll_interval_ms));
                }
            });
        match handle {
            Ok(h) => {
                if let Ok(mut guard) = inner.monitor.lock() {
                    *guard = Some(h);
                }
            }
            Err(e) => error!("failed to spawn modem monitor: {e}"),
        }
    }

    fn stop_monitor(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Ok(mut guard) = self.monitor.lock() {
            if let Some(handle) = guard.take() {
                let _ = handle.join();
            }
        }
    }

    /// One monitor iteration: poll CLCC, fold URCs into the state machine,
    /// pick up new-SMS notifications.
    fn monitor_tick(&self) {
        let response = match self.send_at("AT+CLCC") {
            Ok(r) => r,
            Err(e) => {
                debug!("monitor poll failed: {e}");
                return;
            }
        };

        let snapshot = self.call.lock().ok().and_then(|g| g.clone());

        if let Some(call) = &snapshot {
            if !call.state.is_terminal() {
                match urc::parse_clcc_stat(&response) {
                    Some(clcc_stat::ACTIVE) => {
                        if call.state != CallState::Connected {
                            info!("call answered (CLCC stat=0)");
                            self.set_call_state(CallState::Connected);
                        }
                    }
                    Some(clcc_stat::ALERTING) => {
                        if call.state != CallState::Ringing {
                            self.set_call_state(CallState::Ringing);
                        }
                    }
                    Some(clcc_stat::INCOMING) => {
                        self.set_call_state(CallState::Incoming);
                    }
                    Some(_) => {}
                    None => {
                        // No rows while connected means the far end hung
                        // up. A ringing call may legitimately report
                        // nothing until answered, so only CONNECTED ends
                        // here.
                        if call.state == CallState::Connected {
                            self.set_call_state(CallState::Ended);
                        }
                    }
                }
            }
        }

        // A RING (with optional caller id) while idle opens an incoming
        // call.
        let idle = snapshot
            .as_ref()
            .map_or(true, |c| c.state == CallState::Idle || c.state.is_terminal());
        if idle && (response.contains("RING") || response.contains("+CLIP:")) {
            let number = urc::parse_clip_number(&response)
                .map(|n| PhoneNumber::normalize(&n))
                .unwrap_or_else(|| PhoneNumber::normalize(""));
            if let Ok(mut guard) = self.call.lock() {
                *guard = Some(CallInfo::new(
                    number.clone(),
                    CallDirection::Incoming,
                    CallState::Incoming,
                ));
            }
            info!("incoming call from {}", display_number(&number));
            self.notify_state(CallState::Incoming);
        }

        if response.contains("+CMTI:") {
            if let Some(index) = urc::parse_cmti_index(&response) {
                info!("new SMS at index {index}");
                self.read_sms_by_index(&index);
            }
        }
    }

    /// Read, dispatch, and delete one stored SMS.
    fn read_sms_by_index(&self, index: &str) {
        let response =
            match self.send_at_timeout(&format!("AT+CMGR={index}"), Duration::from_millis(3000)) {
                Ok(r) => r,
                Err(e) => {
                    error!("failed to read SMS {index}: {e}");
                    return;
                }
            };

        if let Some((sender, body)) = urc::parse_cmgr(&response) {
            info!("SMS from {sender}: {}", truncate_for_log(&body, 50));
            if let Ok(callbacks) = self.sms_callbacks.lock() {
                for callback in callbacks.iter() {
                    callback(&sender, &body);
                }
            }
        }

        let _ = self.send_at(&format!("AT+CMGD={index}"));
    }

    /// The multi-step CMGS exchange, holding the transport lock throughout.
    fn send_sms_locked(&self, number: &PhoneNumber, body: &str) -> Result<()> {
        let pacing = Duration::from_millis(self.config.command_pacing_ms);
        let mut guard = self.lock_transport()?;
        let transport = guard
            .as_mut()
            .ok_or_else(|| AgentError::Modem("not connected".into()))?;
        let t = transport.as_mut();

        let mut buf = [0u8; 512];

        // Flush whatever the monitor left unread.
        for _ in 0..5 {
            if t.read(&mut buf, Duration::from_millis(100))? == 0 {
                break;
            }
        }

        // Probe, then text mode.
        t.write(b"AT\r\n", Duration::from_millis(2000))?;
        std::thread::sleep(pacing);
        let _ = t.read(&mut buf, Duration::from_millis(500))?;

        t.write(b"AT+CMGF=1\r\n", Duration::from_millis(2000))?;
        std::thread::sleep(pacing);
        let _ = t.read(&mut buf, Duration::from_millis(300))?;

        t.write(
            format!("AT+CMGS=\"{}\"\r\n", number.digits()).as_bytes(),
            Duration::from_millis(2000),
        )?;
        std::thread::sleep(pacing);

        let mut prompt = false;
        for _ in 0..5 {
            let n = t.read(&mut buf, Duration::from_millis(1000))?;
            if n > 0 && buf[..n].contains(&b'>') {
                prompt = true;
                break;
            }
        }
        if !prompt {
            // Escape the half-open send so the modem returns to command
            // mode.
            let _ = t.write(&[0x1b], Duration::from_millis(1000));
            return Err(AgentError::Sms("no prompt after CMGS".into()));
        }

        let mut payload = body.as_bytes().to_vec();
        payload.push(0x1a);
        t.write(&payload, Duration::from_millis(5000))?;

        std::thread::sleep(Duration::from_millis(self.config.sms_settle_ms));

        let mut response = Vec::new();
        for _ in 0..10 {
            let n = t.read(&mut buf, Duration::from_millis(1000))?;
            response.extend_from_slice(&buf[..n]);
            if contains_subslice(&response, b"OK") || contains_subslice(&response, b"ERROR") {
                break;
            }
            if n == 0 {
                continue;
            }
        }

        if contains_subslice(&response, b"OK") {
            info!("SMS sent to {number}");
            Ok(())
        } else {
            Err(AgentError::Sms(format!(
                "send failed: {}",
                String::from_utf8_lossy(&response).trim()
            )))
        }
    }

    fn spawn_reconnect(&self) {
        if self.reconnecting.load(Ordering::SeqCst) {
            return;
        }
        if let Some(inner) = self.weak_self.upgrade() {
            let _ = std::thread::Builder::new()
                .name("modem-reconnect".into())
                .spawn(move || {
                    let _ = Inner::do_reconnect(&inner);
                });
        }
    }

    /// Dispose the dead handle, settle, retry the factory with back-off.
    fn do_reconnect(inner: &Arc<Inner>) -> bool {
        if inner
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("reconnection already in progress");
            return false;
        }

        warn!("modem disconnected, attempting to reconnect");
        let was_running = inner.running.load(Ordering::SeqCst);
        inner.stop_monitor();

        if let Ok(mut guard) = inner.transport.lock() {
            *guard = None;
        }

        let backoff = Duration::from_millis(inner.config.reconnect_backoff_ms);
        std::thread::sleep(backoff);

        let mut reconnected = false;
        for attempt in 1..=inner.config.reconnect_attempts {
            info!(
                "reconnection attempt {attempt}/{}",
                inner.config.reconnect_attempts
            );
            match (inner.factory)() {
                Ok(transport) => {
                    if let Ok(mut guard) = inner.transport.lock() {
                        *guard = Some(transport);
                    }
                    if inner.init_sequence().is_ok() {
                        reconnected = true;
                        break;
                    }
                    if let Ok(mut guard) = inner.transport.lock() {
                        *guard = None;
                    }
                }
                Err(e) => debug!("factory failed: {e}"),
            }
            std::thread::sleep(backoff);
        }

        if reconnected {
            info!("modem reconnected");
            if was_running {
                Inner::start_monitor(inner);
            }
        } else {
            error!(
                "failed to reconnect after {} attempts",
                inner.config.reconnect_attempts
            );
        }
        inner.reconnecting.store(false, Ordering::SeqCst);
        reconnected
    }
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn display_number(number: &PhoneNumber) -> String {
    if number.is_empty() {
        "Unknown".to_owned()
    } else {
        number.digits().to_owned()
    }
}

fn truncate_for_log(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// Transport that answers commands from a closure and records writes.
    /// Writing `DIE` simulates the cable being pulled.
    struct ScriptedTransport {
        responder: Box<dyn FnMut(&str) -> String + Send>,
        pending: VecDeque<u8>,
        log: Arc<StdMutex<Vec<String>>>,
        dead: bool,
    }

    impl ScriptedTransport {
        fn boxed(
            log: Arc<StdMutex<Vec<String>>>,
            responder: impl FnMut(&str) -> String + Send + 'static,
        ) -> Box<dyn AtTransport> {
            Box::new(Self {
                responder: Box::new(responder),
                pending: VecDeque::new(),
                log,
                dead: false,
            })
        }
    }

    impl AtTransport for ScriptedTransport {
        fn write(&mut self, data: &[u8], _timeout: Duration) -> Result<()> {
            if self.dead {
                return Err(AgentError::Modem("no such device: unplugged".into()));
            }
            let text = String::from_utf8_lossy(data);
            let cmd = text.trim_end_matches(['\r', '\n']).to_owned();
            if cmd == "DIE" {
                self.dead = true;
                return Err(AgentError::Modem("no such device: unplugged".into()));
            }
            self.log.lock().unwrap().push(cmd.clone());
            self.pending.extend((self.responder)(&cmd).into_bytes());
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
            if self.dead {
                return Err(AgentError::Modem("no such device: unplugged".into()));
            }
            let mut n = 0;
            while n < buf.len() {
                match self.pending.pop_front() {
                    Some(byte) => {
                        buf[n] = byte;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(n)
        }
    }

    fn fast_config() -> ModemConfig {
        ModemConfig {
            at_timeout_ms: 200,
            poll_interval_ms: 1,
            reconnect_attempts: 3,
            reconnect_backoff_ms: 1,
            command_pacing_ms: 1,
            sms_settle_ms: 1,
            answer_hint: false,
        }
    }

    fn ok_everything(cmd: &str) -> String {
        if cmd == "AT+CPIN?" {
            "+CPIN: READY\r\nOK\r\n".to_owned()
        } else {
            "\r\nOK\r\n".to_owned()
        }
    }

    fn controller_with(
        responder: impl FnMut(&str) -> String + Send + Sync + Clone + 'static,
    ) -> (ModemController, Arc<StdMutex<Vec<String>>>) {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let log_clone = Arc::clone(&log);
        let controller = ModemController::new(
            fast_config(),
            Box::new(move || {
                Ok(ScriptedTransport::boxed(
                    Arc::clone(&log_clone),
                    responder.clone(),
                ))
            }),
        );
        // Install the transport directly; the monitor thread stays off so
        // tests drive ticks deterministically.
        *controller.inner.transport.lock().unwrap() = Some((controller.inner.factory)().unwrap());
        (controller, log)
    }

    #[test]
    fn dial_sets_up_audio_then_rings() {
        let (controller, log) = controller_with(ok_everything);
        let number = PhoneNumber::normalize("7025551234");

        controller.dial(&number).expect("dial");
        assert_eq!(controller.call_info().unwrap().state, CallState::Ringing);

        let commands = log.lock().unwrap().clone();
        let dial_idx = commands
            .iter()
            .position(|c| c == "ATD17025551234;")
            .expect("ATD issued");
        for audio_cmd in ["AT+CSDVC=1", "AT+CLVL=1", "AT+CECM=1"] {
            let idx = commands
                .iter()
                .position(|c| c == audio_cmd)
                .unwrap_or_else(|| panic!("{audio_cmd} missing"));
            assert!(idx < dial_idx, "{audio_cmd} must precede ATD");
        }
    }

    #[test]
    fn rejected_dial_fails_the_call() {
        let (controller, _log) = controller_with(|cmd: &str| {
            if cmd.starts_with("ATD") {
                "\r\nERROR\r\n".to_owned()
            } else {
                "\r\nOK\r\n".to_owned()
            }
        });
        let number = PhoneNumber::normalize("7025551234");

        assert!(controller.dial(&number).is_err());
        assert_eq!(controller.call_info().unwrap().state, CallState::Failed);
    }

    #[test]
    fn clcc_active_row_connects_and_empty_row_ends() {
        use std::sync::atomic::AtomicU32;
        let phase = Arc::new(AtomicU32::new(0));
        let phase_clone = Arc::clone(&phase);

        let (controller, _log) = controller_with(move |cmd: &str| {
            if cmd == "AT+CLCC" {
                match phase_clone.load(Ordering::SeqCst) {
                    0 => "+CLCC: 1,0,3,0,0,\"17025551234\",129\r\nOK\r\n".to_owned(),
                    1 => "+CLCC: 1,0,0,0,0,\"17025551234\",129\r\nOK\r\n".to_owned(),
                    _ => "\r\nOK\r\n".to_owned(),
                }
            } else {
                "\r\nOK\r\n".to_owned()
            }
        });

        controller
            .dial(&PhoneNumber::normalize("7025551234"))
            .unwrap();

        controller.monitor_tick();
        assert_eq!(controller.call_info().unwrap().state, CallState::Ringing);

        phase.store(1, Ordering::SeqCst);
        controller.monitor_tick();
        let info = controller.call_info().unwrap();
        assert_eq!(info.state, CallState::Connected);
        assert!(info.connect_time.is_some());

        phase.store(2, Ordering::SeqCst);
        controller.monitor_tick();
        let info = controller.call_info().unwrap();
        assert_eq!(info.state, CallState::Ended);
        assert!(info.end_time.is_some());
    }

    #[test]
    fn ringing_call_survives_empty_clcc() {
        let (controller, _log) = controller_with(ok_everything);
        controller
            .dial(&PhoneNumber::normalize("7025551234"))
            .unwrap();

        // CLCC often reports nothing until the call is answered.
        controller.monitor_tick();
        assert_eq!(controller.call_info().unwrap().state, CallState::Ringing);
    }

    #[test]
    fn ring_with_clip_opens_incoming_call() {
        let (controller, _log) = controller_with(|cmd: &str| {
            if cmd == "AT+CLCC" {
                "RING\r\n+CLIP: \"7025559876\",129\r\nOK\r\n".to_owned()
            } else {
                "\r\nOK\r\n".to_owned()
            }
        });

        controller.monitor_tick();
        let info = controller.call_info().unwrap();
        assert_eq!(info.state, CallState::Incoming);
        assert_eq!(info.number.digits(), "17025559876");
        assert_eq!(info.direction, CallDirection::Incoming);
    }

    #[test]
    fn answer_connects_incoming_call() {
        let (controller, _log) = controller_with(|cmd: &str| {
            if cmd == "AT+CLCC" {
                "RING\r\n+CLIP: \"7025559876\",129\r\nOK\r\n".to_owned()
            } else {
                "\r\nOK\r\n".to_owned()
            }
        });

        controller.monitor_tick();
        controller.answer().expect("answer");
        let info = controller.call_info().unwrap();
        assert_eq!(info.state, CallState::Connected);
        assert!(info.connect_time.is_some());
    }

    #[test]
    fn state_callbacks_observe_the_lifecycle() {
        let states = Arc::new(StdMutex::new(Vec::new()));
        let states_clone = Arc::clone(&states);

        let (controller, _log) = controller_with(ok_everything);
        controller.on_state_change(Box::new(move |state| {
            states_clone.lock().unwrap().push(state);
        }));

        controller
            .dial(&PhoneNumber::normalize("7025551234"))
            .unwrap();
        controller.hangup();

        let seen = states.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![CallState::Dialing, CallState::Ringing, CallState::Ended]
        );
    }

    #[test]
    fn cmti_triggers_read_decode_delete_and_callback() {
        use std::sync::atomic::AtomicU32;
        let seen = Arc::new(StdMutex::new(Vec::<(String, String)>::new()));
        let seen_clone = Arc::clone(&seen);
        let ticks = Arc::new(AtomicU32::new(0));
        let ticks_clone = Arc::clone(&ticks);

        let (controller, log) = controller_with(move |cmd: &str| {
            if cmd == "AT+CLCC" {
                if ticks_clone.fetch_add(1, Ordering::SeqCst) == 0 {
                    return "\r\n+CMTI: \"SM\",3\r\nOK\r\n".to_owned();
                }
                return "\r\nOK\r\n".to_owned();
            }
            if cmd == "AT+CMGR=3" {
                // "Call" in UCS-2 hex.
                return "+CMGR: \"REC UNREAD\",\"+17025559876\",,\"ts\"\r\n00430061006C006C\r\nOK\r\n"
                    .to_owned();
            }
            "\r\nOK\r\n".to_owned()
        });

        controller.on_sms(Box::new(move |sender, body| {
            seen_clone
                .lock()
                .unwrap()
                .push((sender.to_owned(), body.to_owned()));
        }));

        controller.monitor_tick();

        let messages = seen.lock().unwrap().clone();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, "+17025559876");
        assert_eq!(messages[0].1, "Call");

        let commands = log.lock().unwrap().clone();
        assert!(commands.iter().any(|c| c == "AT+CMGR=3"));
        assert!(commands.iter().any(|c| c == "AT+CMGD=3"));
    }

    #[test]
    fn sms_send_waits_for_prompt_and_ctrl_z() {
        let (controller, log) = controller_with(|cmd: &str| {
            if cmd.starts_with("AT+CMGS=") {
                "\r\n> ".to_owned()
            } else if cmd.ends_with('\u{1a}') {
                "\r\n+CMGS: 12\r\nOK\r\n".to_owned()
            } else {
                "\r\nOK\r\n".to_owned()
            }
        });

        let number = PhoneNumber::normalize("7025559876");
        controller.send_sms(&number, "Meeting at 3").expect("send");

        let commands = log.lock().unwrap().clone();
        assert!(commands.iter().any(|c| c == "AT+CMGF=1"));
        assert!(commands.iter().any(|c| c == "AT+CMGS=\"17025559876\""));
        assert!(
            commands.iter().any(|c| c.starts_with("Meeting at 3")),
            "body write missing from {commands:?}"
        );
    }

    #[test]
    fn sms_send_without_prompt_fails() {
        let (controller, _log) = controller_with(|cmd: &str| {
            if cmd.starts_with("AT+CMGS=") {
                String::new()
            } else {
                "\r\nOK\r\n".to_owned()
            }
        });

        let number = PhoneNumber::normalize("7025559876");
        assert!(controller.send_sms(&number, "hello").is_err());
    }

    #[test]
    fn device_loss_triggers_async_reconnect() {
        let (controller, _log) = controller_with(ok_everything);

        // Kill the transport; the failed exchange clears the handle and
        // spawns the reconnect thread.
        controller.send_at("DIE").unwrap_err();

        // The factory hands out a fresh healthy transport; the modem must
        // be usable again within a few seconds for the next call.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if controller.is_connected() {
                if let Ok(response) = controller.send_at("AT") {
                    if response.contains("OK") {
                        break;
                    }
                }
            }
            assert!(Instant::now() < deadline, "reconnect never completed");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn concurrent_reconnects_are_rejected() {
        let (controller, _log) = controller_with(ok_everything);
        controller.inner.reconnecting.store(true, Ordering::SeqCst);
        assert!(!controller.reconnect());
    }

    #[test]
    fn transfer_merges_after_target_answers() {
        let (controller, log) = controller_with(|cmd: &str| {
            if cmd.starts_with("AT+CTFR") || cmd.starts_with("ATD>") {
                "\r\nERROR\r\n".to_owned()
            } else if cmd == "AT+CLCC" {
                "+CLCC: 1,0,1,0,0,\"17025551234\",129\r\n+CLCC: 2,0,0,0,0,\"17025559999\",129\r\nOK\r\n"
                    .to_owned()
            } else {
                "\r\nOK\r\n".to_owned()
            }
        });

        controller
            .transfer_to(&PhoneNumber::normalize("7025559999"))
            .expect("transfer");

        let commands = log.lock().unwrap().clone();
        assert!(commands.iter().any(|c| c == "ATD17025559999;"));
        assert!(commands.iter().any(|c| c == "AT+CHLD=3"));
    }

    #[test]
    fn failed_merge_resumes_original_call() {
        let (controller, log) = controller_with(|cmd: &str| {
            if cmd.starts_with("AT+CTFR") || cmd.starts_with("ATD>") {
                "\r\nERROR\r\n".to_owned()
            } else if cmd == "AT+CLCC" {
                "+CLCC: 1,0,1,0,0,\"a\",129\r\n+CLCC: 2,0,0,0,0,\"b\",129\r\nOK\r\n".to_owned()
            } else if cmd == "AT+CHLD=3" {
                "\r\nVOICE CALL: END\r\n".to_owned()
            } else {
                "\r\nOK\r\n".to_owned()
            }
        });

        assert!(controller
            .transfer_to(&PhoneNumber::normalize("7025559999"))
            .is_err());

        let commands = log.lock().unwrap().clone();
        let merge_idx = commands.iter().position(|c| c == "AT+CHLD=3").unwrap();
        let resume_idx = commands.iter().rposition(|c| c == "AT+CHLD=2").unwrap();
        assert!(resume_idx > merge_idx, "resume must follow the failed merge");
    }

    #[test]
    fn ect_success_skips_the_three_way_path() {
        let (controller, log) = controller_with(ok_everything);

        controller
            .transfer_to(&PhoneNumber::normalize("7025559999"))
            .expect("transfer");

        let commands = log.lock().unwrap().clone();
        assert!(commands.iter().any(|c| c.starts_with("AT+CTFR=")));
        assert!(!commands.iter().any(|c| c == "AT+CHLD=3"));
    }
}

//! Modem lifecycle scenarios with the live monitor task over a scripted
//! transport.

use ringline::config::ModemConfig;
use ringline::error::{AgentError, Result};
use ringline::modem::transport::AtTransport;
use ringline::modem::{CallState, ModemController};
use ringline::phone::PhoneNumber;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Scripted modem: CLCC responses follow a shared phase counter.
/// Phase 0 = no call rows, 1 = alerting, 2 = active, 3 = rows gone.
struct PhasedModem {
    phase: Arc<AtomicU32>,
    dead: Arc<AtomicU32>,
    pending: VecDeque<u8>,
}

impl PhasedModem {
    fn factory(
        phase: Arc<AtomicU32>,
        dead: Arc<AtomicU32>,
    ) -> impl Fn() -> Result<Box<dyn AtTransport>> + Send + Sync {
        move || {
            Ok(Box::new(PhasedModem {
                phase: Arc::clone(&phase),
                dead: Arc::clone(&dead),
                pending: VecDeque::new(),
            }))
        }
    }
}

impl AtTransport for PhasedModem {
    fn write(&mut self, data: &[u8], _timeout: Duration) -> Result<()> {
        if self.dead.load(Ordering::SeqCst) == 1 {
            return Err(AgentError::Modem("no such device: unplugged".into()));
        }
        let cmd = String::from_utf8_lossy(data);
        let cmd = cmd.trim_end_matches(['\r', '\n']);

        let response = if cmd == "AT+CLCC" {
            match self.phase.load(Ordering::SeqCst) {
                0 => "\r\nOK\r\n".to_owned(),
                1 => "+CLCC: 1,0,3,0,0,\"17025551234\",129\r\nOK\r\n".to_owned(),
                2 => "+CLCC: 1,0,0,0,0,\"17025551234\",129\r\nOK\r\n".to_owned(),
                _ => "\r\nOK\r\n".to_owned(),
            }
        } else if cmd == "AT+CPIN?" {
            "+CPIN: READY\r\nOK\r\n".to_owned()
        } else {
            "\r\nOK\r\n".to_owned()
        };
        self.pending.extend(response.into_bytes());
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        if self.dead.load(Ordering::SeqCst) == 1 {
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
        poll_interval_ms: 2,
        reconnect_attempts: 3,
        // Wide enough that the test flips its failure flag back before
        // the first reconnect attempt runs.
        reconnect_backoff_ms: 50,
        command_pacing_ms: 1,
        sms_settle_ms: 1,
        answer_hint: false,
    }
}

fn wait_for_state(controller: &ModemController, want: CallState, budget: Duration) {
    let deadline = Instant::now() + budget;
    loop {
        if let Some(info) = controller.call_info() {
            if info.state == want {
                return;
            }
        }
        assert!(
            Instant::now() < deadline,
            "never reached {want:?}; currently {:?}",
            controller.call_info().map(|c| c.state)
        );
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn outbound_call_walks_the_state_machine_forward() {
    let phase = Arc::new(AtomicU32::new(0));
    let dead = Arc::new(AtomicU32::new(0));
    let controller = ModemController::new(
        fast_config(),
        Box::new(PhasedModem::factory(Arc::clone(&phase), Arc::clone(&dead))),
    );

    controller.connect().expect("connect");
    controller
        .dial(&PhoneNumber::normalize("7025551234"))
        .expect("dial");

    // Track every observed state; the sequence must only move forward.
    let observed = Arc::new(Mutex::new(Vec::new()));
    let observed_clone = Arc::clone(&observed);
    controller.on_state_change(Box::new(move |state| {
        observed_clone.lock().unwrap().push(state);
    }));

    phase.store(1, Ordering::SeqCst);
    wait_for_state(&controller, CallState::Ringing, Duration::from_secs(2));

    phase.store(2, Ordering::SeqCst);
    wait_for_state(&controller, CallState::Connected, Duration::from_secs(2));
    let info = controller.call_info().unwrap();
    assert!(info.connect_time.is_some());

    phase.store(3, Ordering::SeqCst);
    wait_for_state(&controller, CallState::Ended, Duration::from_secs(2));
    let info = controller.call_info().unwrap();
    assert!(info.end_time.is_some());

    // Terminal stays terminal even if stale rows reappear.
    phase.store(2, Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(controller.call_info().unwrap().state, CallState::Ended);

    controller.disconnect();

    let order = |s: CallState| match s {
        CallState::Idle => 0,
        CallState::Dialing => 1,
        CallState::Ringing | CallState::Incoming => 2,
        CallState::Connected => 3,
        CallState::Ended | CallState::Failed => 4,
    };
    let seen = observed.lock().unwrap().clone();
    for pair in seen.windows(2) {
        assert!(
            order(pair[1]) >= order(pair[0]),
            "state went backward: {seen:?}"
        );
    }
}

#[test]
fn mid_call_device_loss_recovers_for_the_next_call() {
    let phase = Arc::new(AtomicU32::new(2));
    let dead = Arc::new(AtomicU32::new(0));
    let controller = ModemController::new(
        fast_config(),
        Box::new(PhasedModem::factory(Arc::clone(&phase), Arc::clone(&dead))),
    );

    controller.connect().expect("connect");
    controller
        .dial(&PhoneNumber::normalize("7025551234"))
        .expect("dial");
    wait_for_state(&controller, CallState::Connected, Duration::from_secs(2));

    // Pull the cable: the next exchange fails and kicks off the
    // background reconnect. New transports from the factory are healthy.
    dead.store(1, Ordering::SeqCst);
    assert!(controller.send_at("AT").is_err());
    dead.store(0, Ordering::SeqCst);

    // The modem must be usable again within a few seconds.
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

    // And a fresh call can be placed.
    controller.clear_call();
    phase.store(0, Ordering::SeqCst);
    controller
        .dial(&PhoneNumber::normalize("7025559999"))
        .expect("dial after reconnect");
    assert_eq!(controller.call_info().unwrap().state, CallState::Ringing);

    controller.disconnect();
}

//! Call agent: binds the modem, the audio router, and the conversation
//! engine into one outbound or inbound call lifecycle.
//!
//! Per call, three loops run concurrently: the input loop feeds router
//! frames through the engine, the output loop plays synthesized replies
//! (owning the speaking flag and the input-buffer clear), and the main
//! thread watches the modem for the far end hanging up. Cleanup order is
//! fixed regardless of which step failed: hang up, stop recording, stop
//! the engine, stop audio, write the log.

use crate::config::AgentConfig;
use crate::engine::{ConversationEngine, ConversationOutcome, ConversationSettings, ConversationState};
use crate::error::{AgentError, Result};
use crate::knowledge::KnowledgeStore;
use crate::modem::{CallState, ModemController};
use crate::models::{Turn, TurnRole};
use crate::phone::PhoneNumber;
use crate::audio::{router::AudioRouter, AudioFrame};
use crate::settings::Settings;
use crate::store::{Interaction, Lead, LeadUpdate, Store};
use chrono::Local;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// A request to place an outbound call.
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub phone: PhoneNumber,
    pub objective: String,
    pub context: Vec<(String, String)>,
}

/// The outcome of one call, persisted to the call log.
#[derive(Debug, Clone)]
pub struct CallResult {
    pub success: bool,
    pub summary: String,
    pub collected_info: Map<String, Value>,
    pub transcript: Vec<Turn>,
    pub recording_path: Option<PathBuf>,
    pub duration_seconds: f64,
    pub phone: PhoneNumber,
    pub objective: String,
    pub context: Vec<(String, String)>,
    pub transfer_to: Option<PhoneNumber>,
}

/// UI-facing events, delivered over a bounded channel so neither the
/// audio path nor the modem monitor ever blocks on a slow consumer.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    CallState(String),
    ConversationState(String),
    Transcript { role: String, text: String },
}

/// One-call-at-a-time agent over a modem, an audio router, and a
/// conversation engine.
pub struct CallAgent {
    config: AgentConfig,
    settings: Settings,
    modem: ModemController,
    router: Arc<AudioRouter>,
    engine: Arc<Mutex<ConversationEngine>>,
    store: Store,
    knowledge: KnowledgeStore,
    events: Mutex<Option<SyncSender<AgentEvent>>>,
    listening: AtomicBool,
}

impl CallAgent {
    /// Assemble an agent.
    #[must_use]
    pub fn new(
        config: AgentConfig,
        settings: Settings,
        modem: ModemController,
        router: Arc<AudioRouter>,
        engine: ConversationEngine,
        store: Store,
    ) -> Self {
        let knowledge = KnowledgeStore::open(&config.knowledge_dir);
        Self {
            config,
            settings,
            modem,
            router,
            engine: Arc::new(Mutex::new(engine)),
            store,
            knowledge,
            events: Mutex::new(None),
            listening: AtomicBool::new(false),
        }
    }

    /// Subscribe to agent events. Returns the receiving end of a bounded
    /// channel; events are dropped, never blocked on, when it falls
    /// behind.
    pub fn subscribe(&self) -> Receiver<AgentEvent> {
        let (tx, rx) = sync_channel(64);
        if let Ok(mut guard) = self.events.lock() {
            *guard = Some(tx.clone());
        }
        let forward = tx;
        self.modem.on_state_change(Box::new(move |state| {
            let _ = forward.try_send(AgentEvent::CallState(state.as_str().to_owned()));
        }));
        rx
    }

    fn emit(&self, event: AgentEvent) {
        if let Ok(guard) = self.events.lock() {
            if let Some(tx) = guard.as_ref() {
                let _ = tx.try_send(event);
            }
        }
    }

    /// Place an outbound call and run the conversation to completion.
    ///
    /// Never panics out of a half-open call: every failure path runs the
    /// same cleanup ladder and produces a `CallResult`.
    pub fn call(&self, request: &CallRequest) -> CallResult {
        info!("starting call to {}: {}", request.phone, request.objective);
        let started = Instant::now();

        match self.run_outbound(request) {
            Ok(result) => result,
            Err(e) => {
                error!("call failed: {e}");
                self.cleanup();
                CallResult {
                    success: false,
                    summary: format!("Call failed: {e}"),
                    collected_info: Map::new(),
                    transcript: Vec::new(),
                    recording_path: None,
                    duration_seconds: started.elapsed().as_secs_f64(),
                    phone: request.phone.clone(),
                    objective: request.objective.clone(),
                    context: request.context.clone(),
                    transfer_to: None,
                }
            }
        }
    }

    fn run_outbound(&self, request: &CallRequest) -> Result<CallResult> {
        let started = Instant::now();

        if !self.modem.is_connected() {
            self.modem.connect()?;
        }
        self.modem.clear_call();

        let knowledge = {
            let text = self.knowledge.knowledge_for_prompt(&request.objective, 2000);
            if text.is_empty() { None } else { Some(text) }
        };
        {
            let mut engine = self.lock_engine()?;
            engine.start(ConversationSettings {
                objective: request.objective.clone(),
                context: request.context.clone(),
                greeting: None,
                knowledge,
                max_duration: Duration::from_secs(self.config.conversation.max_duration_secs),
            });
        }

        self.router.start()?;
        self.router.start_recording();

        if let Err(e) = self.modem.dial(&request.phone) {
            self.cleanup();
            return Err(e);
        }

        if let Err(e) = self.wait_for_connect() {
            let result = self.finish_call(
                request.phone.clone(),
                &request.objective,
                &request.context,
                started,
                None,
            );
            return Ok(CallResult {
                success: false,
                summary: e.to_string(),
                transcript: Vec::new(),
                ..result
            });
        }

        info!("call connected, opening the conversation");

        // Outbound calls open with a generated greeting once the callee
        // is on the line; the first-turn fallback in the engine covers
        // callees whose hello the model cannot transcribe.
        match self.lock_engine()?.outbound_greeting() {
            Ok(audio) => self.play_reply(&audio)?,
            Err(e) => warn!("greeting synthesis failed: {e}"),
        }

        self.conversation_loop()?;

        let lead = self.store.get_lead_by_phone(&request.phone).ok().flatten();
        let result = self.finish_call(
            request.phone.clone(),
            &request.objective,
            &request.context,
            started,
            lead,
        );
        Ok(result)
    }

    /// Listen for incoming calls and answer each with the configured
    /// persona until `stop_listening` is called.
    ///
    /// # Errors
    ///
    /// Returns an error when the modem cannot be reached at all.
    pub fn listen(&self) -> Result<()> {
        if !self.settings.incoming.enabled {
            info!("incoming calls disabled in settings");
            return Ok(());
        }
        if !self.modem.is_connected() {
            self.modem.connect()?;
        }

        self.listening.store(true, Ordering::SeqCst);
        info!("waiting for incoming calls");

        while self.listening.load(Ordering::SeqCst) {
            self.modem.clear_call();
            let Some(caller) = self
                .modem
                .wait_for_incoming_call(Some(Duration::from_secs(5)))
            else {
                continue;
            };

            let result = self.handle_incoming(&caller);
            match result {
                Ok(result) => info!(
                    "incoming call finished (success={}): {}",
                    result.success, result.summary
                ),
                Err(e) => error!("incoming call failed: {e}"),
            }
        }
        Ok(())
    }

    /// Stop the incoming-call loop after the current call.
    pub fn stop_listening(&self) {
        self.listening.store(false, Ordering::SeqCst);
    }

    fn handle_incoming(&self, caller: &PhoneNumber) -> Result<CallResult> {
        let started = Instant::now();
        info!("handling incoming call from {caller}");

        let lead = self.store.get_lead_by_phone(caller).ok().flatten();
        let lead_pairs = lead
            .as_ref()
            .map(Lead::context_pairs)
            .unwrap_or_default();

        let persona = self
            .settings
            .substitute(&self.settings.incoming.persona, &lead_pairs);
        let greeting = self
            .settings
            .substitute(&self.settings.incoming.greeting, &lead_pairs);

        let mut context = vec![
            ("caller_id".to_owned(), caller.digits().to_owned()),
            ("my_name".to_owned(), self.settings.my_name.clone()),
            (
                "callback_number".to_owned(),
                self.settings.callback_number.clone(),
            ),
            ("direction".to_owned(), "incoming".to_owned()),
        ];
        context.extend(lead_pairs);

        {
            let mut engine = self.lock_engine()?;
            engine.start(ConversationSettings {
                objective: format!("Answer this incoming call professionally. {persona}"),
                context: context.clone(),
                greeting: Some(greeting.clone()),
                knowledge: None,
                max_duration: Duration::from_secs(self.config.conversation.max_duration_secs),
            });
        }

        self.router.start()?;
        self.router.start_recording();

        if let Err(e) = self.modem.answer() {
            self.cleanup();
            return Err(e);
        }

        // Let the audio path settle, then greet.
        std::thread::sleep(Duration::from_millis(200));
        let greeting_audio = self.lock_engine()?.synthesize_greeting(&greeting);
        match greeting_audio {
            Ok(audio) if !audio.is_empty() => self.play_reply(&audio)?,
            Ok(_) => {}
            Err(e) => warn!("greeting synthesis failed: {e}"),
        }

        self.conversation_loop()?;

        let result = self.finish_call(caller.clone(), "Incoming call", &context, started, lead);

        // Give the modem a moment to return to command mode, then text
        // the owner a summary.
        std::thread::sleep(Duration::from_secs(2));
        self.send_sms_summary(caller, &result);

        Ok(result)
    }

    /// Poll CallInfo until CONNECTED, or fail on a terminal state or the
    /// connect timeout.
    ///
    /// CLCC is authoritative for the CONNECTED transition. With
    /// `modem.answer_hint` enabled, ringback cessation followed by voice
    /// is accepted as an early hint to stop waiting; the state machine is
    /// never touched by it.
    fn wait_for_connect(&self) -> Result<()> {
        let deadline =
            Instant::now() + Duration::from_secs(self.config.conversation.connect_timeout_secs);
        let mut ringback = self
            .config
            .modem
            .answer_hint
            .then(|| crate::dsp::RingbackDetector::new(self.config.audio.pipeline_sample_rate));

        loop {
            match self.modem.call_info() {
                Some(info) if info.state == CallState::Connected => return Ok(()),
                Some(info) if info.state.is_terminal() => {
                    return Err(AgentError::Call(
                        "call failed or ended before connecting".into(),
                    ));
                }
                _ => {}
            }

            if let Some(detector) = ringback.as_mut() {
                while let Some(frame) = self.router.read_audio() {
                    if detector.process(&frame.samples).answered {
                        info!("ringback hint: callee answered, proceeding early");
                        return Ok(());
                    }
                }
            }

            if Instant::now() > deadline {
                return Err(AgentError::Call("call connection timeout".into()));
            }
            std::thread::sleep(Duration::from_millis(
                if ringback.is_some() { 50 } else { 500 },
            ));
        }
    }

    /// The per-call loops: input, output, and modem watch.
    fn conversation_loop(&self) -> Result<()> {
        let running = Arc::new(AtomicBool::new(true));
        let queued = Arc::new(AtomicUsize::new(0));
        let (reply_tx, reply_rx) = sync_channel::<Vec<i16>>(4);

        std::thread::scope(|scope| {
            // Input: router frames through VAD/STT/LLM/TTS.
            let input_running = Arc::clone(&running);
            let input_queued = Arc::clone(&queued);
            scope.spawn(move || {
                let mut seen_turns = 0usize;
                while input_running.load(Ordering::SeqCst) {
                    let frame = self.router.read_audio();
                    match frame {
                        Some(frame) => {
                            let reply = {
                                let mut engine = match self.engine.lock() {
                                    Ok(g) => g,
                                    Err(_) => break,
                                };
                                let reply = engine.process_audio(&frame.samples);
                                seen_turns =
                                    self.emit_new_turns(engine.transcript(), seen_turns);
                                reply
                            };
                            if let Some(audio) = reply {
                                input_queued.fetch_add(1, Ordering::SeqCst);
                                if reply_tx.send(audio).is_err() {
                                    break;
                                }
                            }
                        }
                        None => std::thread::sleep(Duration::from_millis(10)),
                    }
                }
            });

            // Output: play replies, own the speaking flag and the
            // post-playback input flush.
            let output_running = Arc::clone(&running);
            let output_queued = Arc::clone(&queued);
            scope.spawn(move || {
                while output_running.load(Ordering::SeqCst) {
                    match reply_rx.recv_timeout(Duration::from_millis(100)) {
                        Ok(audio) => {
                            self.play_queued_reply(&audio);
                            output_queued.fetch_sub(1, Ordering::SeqCst);

                            let state = self
                                .engine
                                .lock()
                                .map(|e| e.state())
                                .unwrap_or(ConversationState::Failed);
                            if state == ConversationState::Completed {
                                // Leave room for the goodbye to land.
                                std::thread::sleep(Duration::from_secs(1));
                                output_running.store(false, Ordering::SeqCst);
                            } else if state == ConversationState::Transferring {
                                output_running.store(false, Ordering::SeqCst);
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            });

            // Main thread: modem watch and end-of-call detection.
            while running.load(Ordering::SeqCst) {
                match self.modem.call_info() {
                    None => {
                        info!("call record gone, ending");
                        running.store(false, Ordering::SeqCst);
                    }
                    Some(info) if info.state.is_terminal() => {
                        info!("modem reports call ended");
                        running.store(false, Ordering::SeqCst);
                    }
                    _ => {}
                }

                let state = self
                    .engine
                    .lock()
                    .map(|e| e.state())
                    .unwrap_or(ConversationState::Failed);
                let idle = queued.load(Ordering::SeqCst) == 0;
                if idle
                    && matches!(
                        state,
                        ConversationState::Completed
                            | ConversationState::Transferring
                            | ConversationState::Failed
                    )
                {
                    running.store(false, Ordering::SeqCst);
                }

                std::thread::sleep(Duration::from_millis(
                    self.config.modem.poll_interval_ms,
                ));
            }
        });

        Ok(())
    }

    /// Play a reply with the full echo-suppression ritual.
    fn play_reply(&self, audio: &[i16]) -> Result<()> {
        if audio.is_empty() {
            return Ok(());
        }
        if let Ok(mut engine) = self.engine.lock() {
            engine.set_speaking(true);
        }
        let frame = AudioFrame::new(audio.to_vec(), self.config.audio.pipeline_sample_rate);
        let result = self.router.write_audio(&frame);
        self.router.clear_input_buffer();
        if let Ok(mut engine) = self.engine.lock() {
            engine.set_speaking(false);
        }
        result
    }

    fn play_queued_reply(&self, audio: &[i16]) {
        if let Err(e) = self.play_reply(audio) {
            warn!("playback failed: {e}");
        }
    }

    fn emit_new_turns(&self, transcript: &[Turn], seen: usize) -> usize {
        for turn in &transcript[seen.min(transcript.len())..] {
            let role = match turn.role {
                TurnRole::User => "user",
                TurnRole::Assistant => "assistant",
                TurnRole::ToolResult => "tool_result",
            };
            self.emit(AgentEvent::Transcript {
                role: role.to_owned(),
                text: turn.text.clone(),
            });
        }
        transcript.len()
    }

    /// Execute a requested transfer; failure falls back to hanging up.
    fn execute_transfer(&self, target: &PhoneNumber) -> bool {
        info!("conversation requested transfer to {target}");
        match self.modem.transfer_to(target) {
            Ok(()) => true,
            Err(e) => {
                warn!("transfer failed: {e}");
                false
            }
        }
    }

    /// The fixed teardown ladder plus result assembly.
    fn finish_call(
        &self,
        phone: PhoneNumber,
        objective: &str,
        context: &[(String, String)],
        started: Instant,
        lead: Option<Lead>,
    ) -> CallResult {
        let outcome = self
            .engine
            .lock()
            .map(|engine| engine.outcome())
            .unwrap_or_else(|_| ConversationOutcome {
                success: false,
                summary: String::new(),
                transcript: Vec::new(),
                collected_info: Map::new(),
                duration: started.elapsed(),
                transfer_to: None,
            });

        let mut success = outcome.success;
        if let Some(target) = &outcome.transfer_to {
            success = self.execute_transfer(target) && success;
        }

        // Teardown order is fixed regardless of which step failed: hang
        // up, stop recording, stop the engine, stop audio, write the log.
        self.modem.hangup();
        let recording_path = self.cleanup_recording();
        if let Ok(mut engine) = self.engine.lock() {
            engine.stop();
        }
        self.router.stop();

        let direction = self
            .modem
            .call_info()
            .map(|c| c.direction)
            .unwrap_or(crate::modem::CallDirection::Outgoing);
        self.modem.clear_call();

        let result = CallResult {
            success,
            summary: outcome.summary,
            collected_info: outcome.collected_info,
            transcript: outcome.transcript,
            recording_path,
            duration_seconds: started.elapsed().as_secs_f64(),
            phone,
            objective: objective.to_owned(),
            context: context.to_vec(),
            transfer_to: outcome.transfer_to,
        };

        let incoming = direction == crate::modem::CallDirection::Incoming;
        if let Err(e) = self.write_call_log(&result, incoming) {
            error!("failed to write call log: {e}");
        }
        if let Some(lead) = lead {
            self.log_interaction(&lead, &result, incoming);
        }

        result
    }

    fn cleanup_recording(&self) -> Option<PathBuf> {
        let path = self
            .config
            .calls_dir
            .join(format!("call_{}.wav", Local::now().format("%Y%m%d_%H%M%S")));
        match self.router.stop_recording(&path) {
            Ok(saved) => saved,
            Err(e) => {
                warn!("failed to save recording: {e}");
                None
            }
        }
    }

    /// Teardown in fixed order: hang up, stop the engine, stop audio.
    fn cleanup(&self) {
        self.modem.hangup();
        if let Ok(mut engine) = self.engine.lock() {
            engine.stop();
        }
        self.router.stop();
    }

    fn lock_engine(&self) -> Result<std::sync::MutexGuard<'_, ConversationEngine>> {
        self.engine
            .lock()
            .map_err(|e| AgentError::Call(format!("engine lock poisoned: {e}")))
    }

    /// One JSON file per call, append-only by construction.
    fn write_call_log(&self, result: &CallResult, incoming: bool) -> Result<()> {
        std::fs::create_dir_all(&self.config.calls_dir)?;
        let prefix = if incoming { "incoming" } else { "log" };
        let path = self.config.calls_dir.join(format!(
            "{prefix}_{}.json",
            Local::now().format("%Y%m%d_%H%M%S")
        ));

        let record = call_log_record(result, incoming);
        std::fs::write(&path, serde_json::to_string_pretty(&record).unwrap_or_default())?;
        info!("call log saved to {}", path.display());
        Ok(())
    }

    fn log_interaction(&self, lead: &Lead, result: &CallResult, incoming: bool) {
        let outcome = classify_outcome(result.success, &result.summary);
        let interaction = Interaction {
            channel: "call".to_owned(),
            direction: if incoming { "inbound" } else { "outbound" }.to_owned(),
            duration_seconds: result.duration_seconds as i64,
            recording_path: result
                .recording_path
                .as_ref()
                .map(|p| p.display().to_string()),
            transcript: serde_json::to_string(&result.transcript).ok(),
            summary: Some(result.summary.clone()),
            objective: Some(result.objective.clone()),
            outcome: outcome.to_owned(),
        };
        if let Err(e) = self.store.log_interaction(lead.id, &interaction) {
            warn!("failed to log interaction: {e}");
        }

        let mut update = LeadUpdate {
            last_contacted_at: Some(chrono::Utc::now().to_rfc3339()),
            ..LeadUpdate::default()
        };
        if outcome == "booked" {
            update.status = Some("MEETING_BOOKED".to_owned());
        } else if incoming && matches!(lead.status.as_str(), "NEW" | "CONTACTED") {
            // They called us: engaged.
            update.status = Some("ENGAGED".to_owned());
        }
        if let Err(e) = self.store.update_lead(lead.id, &update) {
            warn!("failed to update lead: {e}");
        }
    }

    fn send_sms_summary(&self, caller: &PhoneNumber, result: &CallResult) {
        if !self.settings.incoming.sms_enabled {
            return;
        }
        let callback = PhoneNumber::normalize(&self.settings.callback_number);
        if callback.is_empty() {
            warn!("no callback number configured, skipping SMS summary");
            return;
        }

        let message = sms_summary_text(caller, result);
        match self.modem.send_sms(&callback, &message) {
            Ok(()) => info!("SMS summary sent"),
            Err(e) => error!("failed to send SMS summary: {e}"),
        }
    }
}

/// Serialize a call result as the on-disk log record.
#[must_use]
pub fn call_log_record(result: &CallResult, incoming: bool) -> Value {
    let context: Map<String, Value> = result
        .context
        .iter()
        .map(|(k, v)| (k.clone(), json!(v)))
        .collect();
    json!({
        "timestamp": Local::now().to_rfc3339(),
        "phone": result.phone.digits(),
        "direction": if incoming { "incoming" } else { "outgoing" },
        "objective": result.objective,
        "context": context,
        "success": result.success,
        "summary": result.summary,
        "collected_info": result.collected_info,
        "transcript": result.transcript,
        "recording_path": result.recording_path.as_ref().map(|p| p.display().to_string()),
        "duration_seconds": result.duration_seconds,
        "transfer_to": result.transfer_to.as_ref().map(|n| n.digits().to_owned()),
        "engine": "local",
    })
}

/// Classify a finished call for lead tracking.
#[must_use]
pub fn classify_outcome(success: bool, summary: &str) -> &'static str {
    if !success {
        return "failed";
    }
    let lower = summary.to_lowercase();
    if lower.contains("booked") || lower.contains("scheduled") || lower.contains("meeting") {
        "booked"
    } else if lower.contains("callback") {
        "callback"
    } else if lower.contains("not interested") {
        "not_interested"
    } else {
        "completed"
    }
}

/// Compose the owner's post-call SMS summary, within one message.
#[must_use]
pub fn sms_summary_text(caller: &PhoneNumber, result: &CallResult) -> String {
    let caller_text = if caller.is_empty() {
        "Unknown".to_owned()
    } else {
        caller.digits().to_owned()
    };

    let mut message = if result.success {
        let summary: String = result.summary.chars().take(100).collect();
        let summary = if summary.is_empty() {
            "Call completed".to_owned()
        } else {
            summary
        };
        format!("Incoming call from {caller_text}: {summary}")
    } else {
        let summary: String = result.summary.chars().take(80).collect();
        format!("Incoming call from {caller_text} ended. {summary}")
    };

    if message.chars().count() > 160 {
        message = message.chars().take(157).collect::<String>() + "...";
    }
    message
}

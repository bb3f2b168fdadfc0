//! Conversation engine: the per-call STT -> LLM -> TTS loop.
//!
//! Drives a single connected call. Incoming frames pass through the VAD;
//! a completed utterance is transcribed, answered, and synthesized, then
//! handed back for playback. Turn-taking is strict: while the assistant
//! is processing or speaking, new utterances are dropped, and the caller
//! clears the input queue after each playback before the VAD re-arms.

use crate::audio::rms;
use crate::config::{ConversationConfig, VadConfig};
use crate::dsp::ToneDetector;
use crate::models::llm::{APOLOGY, TRANSFER_MARKER};
use crate::models::{LanguageModel, SpeechToText, TextToSpeech, Turn, TurnRole};
use crate::phone::PhoneNumber;
use crate::vad::{Utterance, VoiceActivityDetector};
use regex::Regex;
use serde_json::{json, Map, Value};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Marker the model emits when its objective has been achieved.
pub const OBJECTIVE_COMPLETE: &str = "OBJECTIVE_COMPLETE";

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    Idle,
    /// Waiting for the remote party to speak.
    Listening,
    /// Transcribing and generating a reply.
    Processing,
    /// Playing synthesized audio into the call.
    Speaking,
    Completed,
    Failed,
    /// A transfer was requested; the agent takes over.
    Transferring,
}

/// Per-call conversation settings.
#[derive(Debug, Clone)]
pub struct ConversationSettings {
    /// What the assistant is trying to accomplish.
    pub objective: String,
    /// Context pairs injected into the system prompt.
    pub context: Vec<(String, String)>,
    /// Pre-rendered greeting for inbound calls. When set, the greeting is
    /// synthesized directly and the model is told not to re-introduce
    /// itself.
    pub greeting: Option<String>,
    /// Knowledge text retrieved for this objective, if any.
    pub knowledge: Option<String>,
    /// Hard call duration limit.
    pub max_duration: Duration,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            objective: String::new(),
            context: Vec::new(),
            greeting: None,
            knowledge: None,
            max_duration: Duration::from_secs(300),
        }
    }
}

/// Outcome of a finished conversation.
#[derive(Debug, Clone)]
pub struct ConversationOutcome {
    pub success: bool,
    pub summary: String,
    pub transcript: Vec<Turn>,
    pub collected_info: Map<String, Value>,
    pub duration: Duration,
    pub transfer_to: Option<PhoneNumber>,
}

/// The conversation engine for one call.
pub struct ConversationEngine {
    vad: VoiceActivityDetector,
    tones: ToneDetector,
    stt: Box<dyn SpeechToText>,
    tts: Box<dyn TextToSpeech>,
    llm: Box<dyn LanguageModel>,

    conversation: ConversationConfig,

    state: ConversationState,
    transcript: Vec<Turn>,
    settings: ConversationSettings,
    started_at: Instant,
    running: bool,
    speaking: bool,
    /// An empty transcription counts as "callee is present" exactly once,
    /// at the start of the call.
    first_turn: bool,
    timed_out: bool,
    transfer_to: Option<PhoneNumber>,

    action_re: Regex,
}

impl ConversationEngine {
    /// Assemble an engine from its adapters.
    #[must_use]
    pub fn new(
        vad_config: &VadConfig,
        conversation: ConversationConfig,
        sample_rate: u32,
        stt: Box<dyn SpeechToText>,
        tts: Box<dyn TextToSpeech>,
        llm: Box<dyn LanguageModel>,
    ) -> Self {
        Self {
            vad: VoiceActivityDetector::new(vad_config, sample_rate),
            tones: ToneDetector::new(sample_rate),
            stt,
            tts,
            llm,
            conversation,
            state: ConversationState::Idle,
            transcript: Vec::new(),
            settings: ConversationSettings::default(),
            started_at: Instant::now(),
            running: false,
            speaking: false,
            first_turn: true,
            timed_out: false,
            transfer_to: None,
            action_re: Regex::new(r"\*[^*]+\*").expect("action regex"),
        }
    }

    /// Begin a conversation: install the objective, reset per-call state.
    pub fn start(&mut self, settings: ConversationSettings) {
        let objective = if settings.greeting.is_some() {
            // The greeting is played separately; the model must not say
            // hello twice.
            format!(
                "{}\n\nIMPORTANT: A greeting has ALREADY been played to the caller. \
                 Do NOT introduce yourself again or say hello. Just respond directly \
                 to what they say.",
                settings.objective
            )
        } else {
            settings.objective.clone()
        };

        self.llm
            .set_objective(&objective, &settings.context, settings.knowledge.as_deref());
        self.vad.reset();
        self.tones.reset();
        self.transcript.clear();
        self.settings = settings;
        self.started_at = Instant::now();
        self.running = true;
        self.speaking = false;
        self.first_turn = true;
        self.timed_out = false;
        self.transfer_to = None;
        self.set_state(ConversationState::Listening);
        info!("conversation started, listening");
    }

    /// Stop processing further audio. Terminal states are preserved.
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConversationState {
        self.state
    }

    /// The transcript so far.
    #[must_use]
    pub fn transcript(&self) -> &[Turn] {
        &self.transcript
    }

    /// Mark the start/end of assistant playback.
    ///
    /// While speaking, every incoming frame is dropped at the engine
    /// boundary. The caller must clear the router's input queue after
    /// playback before unsetting the flag.
    pub fn set_speaking(&mut self, speaking: bool) {
        self.speaking = speaking;
        if !speaking && self.state == ConversationState::Speaking {
            self.set_state(ConversationState::Listening);
        }
    }

    /// Generate and synthesize the opening line for an outbound call.
    ///
    /// # Errors
    ///
    /// Returns an error when synthesis fails.
    pub fn outbound_greeting(&mut self) -> crate::error::Result<Vec<i16>> {
        let greeting = self.llm.initial_greeting();
        self.transcript.push(Turn::user("Hello?"));
        self.transcript.push(Turn::assistant(greeting.clone()));
        self.first_turn = false;
        self.tts.synthesize(&greeting)
    }

    /// Synthesize a pre-written greeting (inbound calls).
    ///
    /// The greeting is not part of the transcript; the conversation
    /// starts with the caller's first utterance.
    ///
    /// # Errors
    ///
    /// Returns an error when synthesis fails.
    pub fn synthesize_greeting(&mut self, greeting: &str) -> crate::error::Result<Vec<i16>> {
        self.tts.synthesize(greeting)
    }

    /// Feed a frame of call audio. Returns synthesized reply audio when a
    /// complete utterance produced one.
    pub fn process_audio(&mut self, samples: &[i16]) -> Option<Vec<i16>> {
        if !self.running {
            return None;
        }

        // Echo suppression: our own playback never reaches the VAD.
        if self.speaking {
            return None;
        }

        if self.started_at.elapsed() > self.settings.max_duration {
            info!("max call duration reached");
            self.timed_out = true;
            self.set_state(ConversationState::Completed);
            self.running = false;
            return None;
        }

        // New utterances while a reply is in flight are dropped, not
        // queued; the turn-taking contract.
        if self.state == ConversationState::Processing {
            return None;
        }

        let update = self.vad.process_chunk(samples);
        if update.speech_started {
            debug!("speech started");
        }
        if update.speech_ended {
            if let Some(utterance) = update.utterance {
                return self.process_utterance(&utterance);
            }
        }
        None
    }

    /// One full turn: gate, transcribe, respond, synthesize.
    fn process_utterance(&mut self, utterance: &Utterance) -> Option<Vec<i16>> {
        if !utterance.energy_qualifies(self.conversation.utterance_rms_floor) {
            info!("skipping low-energy audio (RMS={:.0})", utterance.rms);
            self.set_state(ConversationState::Listening);
            return None;
        }

        if self.is_tone_only(&utterance.samples) {
            info!("utterance is call-progress tone, suppressing");
            self.set_state(ConversationState::Listening);
            return None;
        }

        self.set_state(ConversationState::Processing);

        let user_text = match self.stt.transcribe(
            &utterance.samples,
            utterance.sample_rate,
            "en",
        ) {
            Ok(text) => text,
            Err(e) => {
                warn!("transcription failed: {e}");
                return self.speak_apology();
            }
        };

        let user_text = if user_text.trim().is_empty() {
            if self.first_turn {
                // The callee said something we could not transcribe; they
                // are present, so open the conversation anyway.
                info!("empty first transcription, treating as greeting");
                "Hello?".to_owned()
            } else {
                debug!("empty transcription, dropping");
                self.set_state(ConversationState::Listening);
                return None;
            }
        } else {
            user_text
        };

        info!("user: {user_text}");
        self.transcript.push(Turn::user(user_text.clone()));
        self.first_turn = false;

        let response = match self.llm.generate_response(&user_text) {
            Ok(text) if !text.is_empty() => text,
            Ok(_) => {
                self.set_state(ConversationState::Listening);
                return None;
            }
            Err(e) => {
                warn!("response generation failed: {e}");
                return self.speak_apology();
            }
        };
        self.transcript.push(Turn::assistant(response.clone()));

        // Strip stage directions and control markers before synthesis.
        let clean = self.spoken_text(&response);
        if clean.is_empty() {
            self.set_state(ConversationState::Listening);
            return None;
        }

        let audio = match self.tts.synthesize(&clean) {
            Ok(audio) if !audio.is_empty() => audio,
            Ok(_) => {
                self.set_state(ConversationState::Listening);
                return None;
            }
            Err(e) => {
                warn!("synthesis failed: {e}");
                self.set_state(ConversationState::Listening);
                return None;
            }
        };

        if self.llm.should_transfer(&response) {
            self.transfer_to = self.llm.transfer_number();
            self.set_state(ConversationState::Transferring);
        } else if response.contains(OBJECTIVE_COMPLETE) || self.llm.should_end_call(&response) {
            self.set_state(ConversationState::Completed);
        } else {
            self.set_state(ConversationState::Speaking);
        }

        Some(audio)
    }

    fn speak_apology(&mut self) -> Option<Vec<i16>> {
        self.transcript.push(Turn::assistant(APOLOGY));
        match self.tts.synthesize(APOLOGY) {
            Ok(audio) if !audio.is_empty() => {
                self.set_state(ConversationState::Speaking);
                Some(audio)
            }
            _ => {
                self.set_state(ConversationState::Listening);
                None
            }
        }
    }

    fn spoken_text(&self, response: &str) -> String {
        let without_actions = self.action_re.replace_all(response, "");
        let cleaned = without_actions
            .replace(TRANSFER_MARKER, "")
            .replace(OBJECTIVE_COMPLETE, "");
        cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// Majority vote over FFT windows: a tone-only utterance never
    /// reaches the transcription model.
    fn is_tone_only(&mut self, samples: &[i16]) -> bool {
        const WINDOW: usize = 4096;
        let mut tone_windows = 0usize;
        let mut total = 0usize;
        for window in samples.chunks(WINDOW) {
            if window.len() < 512 || rms(window) < 100.0 {
                continue;
            }
            total += 1;
            if self.tones.detect(window).is_tone() {
                tone_windows += 1;
            }
        }
        total > 0 && tone_windows * 2 > total
    }

    fn set_state(&mut self, state: ConversationState) {
        if self.state != state {
            debug!("conversation state: {state:?}");
            self.state = state;
        }
    }

    /// Final outcome for the call record.
    #[must_use]
    pub fn outcome(&self) -> ConversationOutcome {
        let summary = self
            .transcript
            .iter()
            .rev()
            .find(|turn| turn.role == TurnRole::Assistant)
            .map(|turn| turn.text.clone())
            .unwrap_or_default();

        // A conversation with real back-and-forth counts even when the
        // model never said a formal goodbye. A timed-out call only counts
        // on that ground.
        let reached_goal = matches!(
            self.state,
            ConversationState::Completed | ConversationState::Transferring
        ) && !self.timed_out;
        let has_conversation = self.transcript.len() >= 4;
        let success = reached_goal || has_conversation;

        ConversationOutcome {
            success,
            summary,
            transcript: self.transcript.clone(),
            collected_info: extract_collected_info(&self.transcript),
            duration: self.started_at.elapsed(),
            transfer_to: self.transfer_to.clone(),
        }
    }
}

/// Pull structured facts out of a transcript: prices, schedule mentions,
/// confirmation numbers.
#[must_use]
pub fn extract_collected_info(transcript: &[Turn]) -> Map<String, Value> {
    let text: String = transcript
        .iter()
        .map(|turn| turn.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    let mut info = Map::new();

    let price_re = Regex::new(r"\$[\d,]+\.?\d*").expect("price regex");
    if let Some(m) = price_re.find(&text) {
        info.insert("price".to_owned(), json!(m.as_str()));
    }

    let schedule_res = [
        Regex::new(r"(?i)\d{1,2}:\d{2}\s*(?:AM|PM)?").expect("time regex"),
        Regex::new(r"(?i)\b(?:Monday|Tuesday|Wednesday|Thursday|Friday|Saturday|Sunday)\b")
            .expect("weekday regex"),
        Regex::new(r"(?i)\b(?:tomorrow|today|next week)\b").expect("relative regex"),
    ];
    let mut schedule: Vec<Value> = Vec::new();
    for re in &schedule_res {
        if let Some(m) = re.find(&text) {
            let hit = m.as_str().trim().to_owned();
            if !schedule.iter().any(|v| v == &json!(hit)) {
                schedule.push(json!(hit));
            }
        }
    }
    if !schedule.is_empty() {
        info.insert("schedule".to_owned(), Value::Array(schedule));
    }

    let conf_re =
        Regex::new(r"(?i)confirmation\s*(?:number|#|num)?\s*(?:is)?[:\s#]*([A-Z0-9-]{3,})")
            .expect("confirmation regex");
    if let Some(caps) = conf_re.captures(&text) {
        info.insert("confirmation".to_owned(), json!(&caps[1]));
    }

    info
}

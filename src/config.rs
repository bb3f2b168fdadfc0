//! Configuration types for the phone agent.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for the agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Audio routing settings (host devices bridging the modem's audio jack).
    pub audio: AudioConfig,
    /// Voice activity detection settings.
    pub vad: VadConfig,
    /// Cellular modem settings.
    pub modem: ModemConfig,
    /// Speech-to-text settings.
    pub stt: SttConfig,
    /// Text-to-speech settings.
    pub tts: TtsConfig,
    /// Language model settings.
    pub llm: LlmConfig,
    /// Per-call conversation settings.
    pub conversation: ConversationConfig,
    /// SMS routing settings.
    pub sms: SmsConfig,
    /// Directory for call logs and recordings.
    pub calls_dir: PathBuf,
    /// Path to the SQLite lead / message store.
    pub store_path: PathBuf,
    /// Directory holding knowledge bases for prompt augmentation.
    pub knowledge_dir: PathBuf,
}

impl AgentConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &std::path::Path) -> crate::error::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| crate::error::AgentError::Config(format!("{}: {e}", path.display())))
    }
}

/// Audio I/O configuration.
///
/// Call audio travels through a pair of host audio devices wired to the
/// modem's 3.5mm jack: the input device captures the remote party, the
/// output device carries synthesized speech back into the call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Substring matched against host input device names.
    pub input_device: String,
    /// Substring matched against host output device names.
    pub output_device: String,
    /// Pipeline sample rate in Hz. All frames crossing component
    /// boundaries carry this rate; device-native rates are converted
    /// at the edge.
    pub pipeline_sample_rate: u32,
    /// Maximum queued input frames before drop-newest kicks in.
    pub input_queue_frames: usize,
    /// Record both sides of the call into the WAV capture.
    pub record_both_sides: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_device: "USB Audio".to_owned(),
            output_device: "USB Audio".to_owned(),
            pipeline_sample_rate: 24_000,
            input_queue_frames: 64,
            record_both_sides: true,
        }
    }
}

/// Voice activity detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Analysis frame length in ms. Must be 10, 20, or 30.
    pub frame_duration_ms: u32,
    /// Minimum RMS (int16 scale) for a frame to count as voiced.
    ///
    /// Call audio through the modem jack carries line noise well above a
    /// quiet room; real speech lands around 7000-12000 RMS.
    pub energy_threshold: f32,
    /// Consecutive voiced audio needed to open an utterance.
    pub min_speech_ms: u32,
    /// Consecutive silence needed to close an utterance.
    pub min_silence_ms: u32,
    /// Hard cap on utterance length before a forced close.
    pub max_speech_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            frame_duration_ms: 30,
            energy_threshold: 500.0,
            min_speech_ms: 250,
            min_silence_ms: 600,
            max_speech_ms: 15_000,
        }
    }
}

/// Cellular modem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModemConfig {
    /// AT command timeout in ms.
    pub at_timeout_ms: u64,
    /// Call-state poll interval for the monitor task in ms.
    pub poll_interval_ms: u64,
    /// Reconnect attempts after a USB disconnect.
    pub reconnect_attempts: u32,
    /// Delay between reconnect attempts in ms (also the settle time after
    /// disposing a dead handle).
    pub reconnect_backoff_ms: u64,
    /// Inter-command pacing during multi-step exchanges (SMS send) in ms.
    pub command_pacing_ms: u64,
    /// Wait for the network to accept an SMS body before reading the
    /// final result, in ms.
    pub sms_settle_ms: u64,
    /// Treat ringback cessation as an early answered hint.
    ///
    /// CLCC remains authoritative for the CONNECTED transition; the hint
    /// only shortens the wait before conversation audio starts flowing.
    pub answer_hint: bool,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            at_timeout_ms: 2_000,
            poll_interval_ms: 500,
            reconnect_attempts: 5,
            reconnect_backoff_ms: 2_000,
            command_pacing_ms: 300,
            sms_settle_ms: 3_000,
            answer_hint: false,
        }
    }
}

/// Speech-to-text configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Transcription server URL (whisper-compatible HTTP endpoint).
    pub server_url: String,
    /// Language hint passed to the model.
    pub language: String,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8178/transcribe".to_owned(),
            language: "en".to_owned(),
        }
    }
}

/// Text-to-speech configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Synthesis server URL (returns mono int16 WAV).
    pub server_url: String,
    /// Voice identifier passed to the server.
    pub voice: String,
    /// Output sample rate in Hz.
    pub output_sample_rate: u32,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8179/synthesize".to_owned(),
            voice: "en_US-lessac-medium".to_owned(),
            output_sample_rate: 24_000,
        }
    }
}

/// Language model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Messages API base URL.
    pub api_url: String,
    /// API key (may also come from the settings store's `api_keys` section).
    pub api_key: String,
    /// Model for the fast tier.
    pub fast_model: String,
    /// Model for the smart tier.
    pub smart_model: String,
    /// Model for the reasoning tier.
    pub reasoning_model: String,
    /// Maximum tokens per voice response. Kept short; this is a phone call.
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.anthropic.com/v1/messages".to_owned(),
            api_key: String::new(),
            fast_model: "claude-3-5-haiku-latest".to_owned(),
            smart_model: "claude-sonnet-4-20250514".to_owned(),
            reasoning_model: "claude-opus-4-20250514".to_owned(),
            max_tokens: 150,
        }
    }
}

/// Per-call conversation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Hard call duration limit in seconds.
    pub max_duration_secs: u64,
    /// Minimum utterance RMS before transcription is attempted.
    pub utterance_rms_floor: f32,
    /// Timeout waiting for an outbound call to connect, in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: 300,
            utterance_rms_floor: 3_000.0,
            connect_timeout_secs: 60,
        }
    }
}

/// SMS routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmsConfig {
    /// Messages of history included per thread.
    pub history_limit: usize,
    /// Maximum reply length in characters.
    pub reply_limit: usize,
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            history_limit: 5,
            reply_limit: 300,
        }
    }
}

//! Speech and language model adapters.
//!
//! The pipeline talks to STT, TTS, and the LLM through the traits here;
//! each ships with one HTTP-backed implementation. Swapping in a different
//! backend (an in-process model, a different provider) means implementing
//! the trait, nothing else.

pub mod llm;
pub mod normalize;
pub mod stt;
pub mod tts;

pub use llm::{
    AnthropicClient, AnthropicLlm, ContentBlock, LanguageModel, ToolChat, Turn, TurnRole, APOLOGY,
};
pub use stt::{HttpStt, SpeechToText};
pub use tts::{HttpTts, TextToSpeech};

use serde::{Deserialize, Serialize};

/// Model capability tiers, mapped to concrete model ids by `LlmConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    /// Cheap and quick; receptionist replies, live call turns.
    Fast,
    /// Balanced; sales conversations.
    Smart,
    /// Best judgment; the owner's personal assistant.
    Reasoning,
}

impl ModelTier {
    /// Resolve the tier to a configured model id.
    #[must_use]
    pub fn model_id<'a>(&self, config: &'a crate::config::LlmConfig) -> &'a str {
        match self {
            Self::Fast => &config.fast_model,
            Self::Smart => &config.smart_model,
            Self::Reasoning => &config.reasoning_model,
        }
    }
}

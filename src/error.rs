//! Error types for the phone agent.

/// Top-level error type for the telephony agent.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Audio device or stream error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Voice activity detection error.
    #[error("VAD error: {0}")]
    Vad(String),

    /// Speech-to-text transcription error.
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech synthesis error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Language model error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Modem transport or AT command error.
    #[error("modem error: {0}")]
    Modem(String),

    /// Call setup or lifecycle error.
    #[error("call error: {0}")]
    Call(String),

    /// SMS send/receive error.
    #[error("SMS error: {0}")]
    Sms(String),

    /// Lead / message store error.
    #[error("store error: {0}")]
    Store(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AgentError>;

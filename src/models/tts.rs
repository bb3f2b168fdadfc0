//! Text-to-speech adapter.

use crate::audio::resample;
use crate::config::TtsConfig;
use crate::error::{AgentError, Result};
use crate::models::normalize::SpokenFormNormalizer;
use std::io::{Cursor, Read};
use tracing::debug;

/// Synthesizes text to int16 PCM at a fixed output rate.
pub trait TextToSpeech: Send {
    /// Synthesize speech. Empty or whitespace-only input yields an empty
    /// buffer, not an error.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend is unreachable or produces
    /// unusable audio.
    fn synthesize(&mut self, text: &str) -> Result<Vec<i16>>;

    /// Sample rate of synthesized audio.
    fn output_rate(&self) -> u32;
}

/// HTTP synthesis backend (piper-server style endpoint).
///
/// Applies spoken-form normalization, posts the text, and expects a mono
/// int16 WAV back; the result is resampled to the configured output rate.
pub struct HttpTts {
    config: TtsConfig,
    agent: ureq::Agent,
    normalizer: SpokenFormNormalizer,
}

impl HttpTts {
    /// Create the backend.
    #[must_use]
    pub fn new(config: TtsConfig) -> Self {
        Self {
            config,
            agent: ureq::agent(),
            normalizer: SpokenFormNormalizer::new(),
        }
    }
}

impl TextToSpeech for HttpTts {
    fn synthesize(&mut self, text: &str) -> Result<Vec<i16>> {
        let spoken = self.normalizer.normalize(text);
        if spoken.is_empty() {
            return Ok(Vec::new());
        }
        if spoken != text {
            debug!("spoken form: '{text}' -> '{spoken}'");
        }

        let response = self
            .agent
            .post(&self.config.server_url)
            .send_json(serde_json::json!({
                "text": spoken,
                "voice": self.config.voice,
            }))
            .map_err(|e| AgentError::Tts(format!("synthesis request failed: {e}")))?;

        let mut wav = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut wav)
            .map_err(|e| AgentError::Tts(format!("synthesis read failed: {e}")))?;

        let reader = hound::WavReader::new(Cursor::new(wav))
            .map_err(|e| AgentError::Tts(format!("bad synthesis WAV: {e}")))?;
        let native_rate = reader.spec().sample_rate;
        let samples: Vec<i16> = reader
            .into_samples::<i16>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| AgentError::Tts(format!("bad synthesis samples: {e}")))?;

        Ok(resample::resample(
            &samples,
            native_rate,
            self.config.output_sample_rate,
        ))
    }

    fn output_rate(&self) -> u32 {
        self.config.output_sample_rate
    }
}

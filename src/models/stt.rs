//! Speech-to-text adapter.

use crate::audio::resample;
use crate::config::SttConfig;
use crate::error::{AgentError, Result};
use std::io::Cursor;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Rate the transcription model expects.
const MODEL_RATE: u32 = 16_000;

/// Transcribes a complete utterance of int16 PCM to final text.
pub trait SpeechToText: Send {
    /// Transcribe audio at the given rate. Resamples internally when the
    /// rate differs from the model's.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend is unreachable or rejects the
    /// audio.
    fn transcribe(&mut self, audio: &[i16], sample_rate: u32, language: &str) -> Result<String>;
}

/// HTTP transcription backend (whisper-server style endpoint).
///
/// Posts a mono 16kHz WAV and expects `{"text": "..."}` back.
pub struct HttpStt {
    config: SttConfig,
    agent: ureq::Agent,
}

impl HttpStt {
    /// Create the backend and warm it with a second of silence so the
    /// first real utterance is not served by a cold model.
    #[must_use]
    pub fn new(config: SttConfig) -> Self {
        let mut stt = Self {
            config,
            agent: ureq::agent(),
        };

        let silence = vec![0i16; MODEL_RATE as usize];
        let warmup_lang = stt.config.language.clone();
        match stt.transcribe(&silence, MODEL_RATE, &warmup_lang) {
            Ok(_) => info!("STT warmup complete"),
            Err(e) => warn!("STT warmup failed (first call will be cold): {e}"),
        }
        stt
    }
}

impl SpeechToText for HttpStt {
    fn transcribe(&mut self, audio: &[i16], sample_rate: u32, language: &str) -> Result<String> {
        if audio.is_empty() {
            return Ok(String::new());
        }

        let samples = resample::resample(audio, sample_rate, MODEL_RATE);
        let wav = encode_wav(&samples, MODEL_RATE)?;

        let started = Instant::now();
        let response = self
            .agent
            .post(&self.config.server_url)
            .query("language", language)
            .set("Content-Type", "audio/wav")
            .send_bytes(&wav)
            .map_err(|e| AgentError::Stt(format!("transcription request failed: {e}")))?;

        let body: serde_json::Value = response
            .into_json()
            .map_err(|e| AgentError::Stt(format!("bad transcription response: {e}")))?;

        let text = body
            .get("text")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("")
            .trim()
            .to_owned();

        if !text.is_empty() {
            debug!(
                "transcribed {} samples in {:.2}s: {text}",
                samples.len(),
                started.elapsed().as_secs_f64()
            );
        }
        Ok(text)
    }
}

/// Encode int16 mono samples as an in-memory WAV file.
fn encode_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| AgentError::Stt(format!("WAV encode failed: {e}")))?;
        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| AgentError::Stt(format!("WAV encode failed: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| AgentError::Stt(format!("WAV encode failed: {e}")))?;
    }
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_header_is_valid() {
        let wav = encode_wav(&[0, 100, -100, 32767], 16_000).expect("encode");
        let reader = hound::WavReader::new(Cursor::new(wav)).expect("decode");
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, 16_000);
        assert_eq!(spec.bits_per_sample, 16);
        assert_eq!(reader.len(), 4);
    }
}

//! Voice activity detection with utterance assembly.
//!
//! Frames are classified at 16kHz in fixed 10/20/30ms windows; an
//! utterance opens after enough consecutive voiced frames and closes on
//! sustained silence or the max-speech cap. The emitted buffer is always
//! the ORIGINAL-rate audio accumulated since the last emit (leading
//! context included, through the frame that closed the utterance), never
//! the resampled analysis copy.

use crate::audio::{resample, rms};
use crate::config::VadConfig;
use crate::error::Result;
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Rate the frame classifier operates at.
const CLASSIFIER_RATE: u32 = 16_000;
/// Cap on buffered utterance audio, in seconds of original-rate samples.
const BUFFER_CAP_SECS: usize = 30;

/// Frame-level speech/non-speech decision.
///
/// The seam where a model-backed classifier can replace the built-in
/// heuristic. Classifier failure is treated as "unvoiced" by the detector.
pub trait FrameClassifier: Send {
    /// Whether a single fixed-size frame at 16kHz contains speech.
    ///
    /// # Errors
    ///
    /// May fail if the underlying classifier cannot process the frame.
    fn is_speech(&mut self, frame: &[i16], sample_rate: u32) -> Result<bool>;
}

/// Built-in classifier: zero-crossing rate plus band-energy shape.
///
/// Voiced speech concentrates energy below ~1kHz and crosses zero far less
/// often than line hiss or static does.
#[derive(Debug, Default)]
pub struct BandEnergyClassifier;

impl FrameClassifier for BandEnergyClassifier {
    fn is_speech(&mut self, frame: &[i16], _sample_rate: u32) -> Result<bool> {
        if frame.is_empty() {
            return Ok(false);
        }

        let crossings = frame
            .windows(2)
            .filter(|pair| (pair[0] >= 0) != (pair[1] >= 0))
            .count();
        let zcr = crossings as f32 / frame.len() as f32;

        // Speech ZCR sits well under white noise's ~0.5; pure DC hum sits
        // near zero but fails the energy gate upstream anyway.
        Ok(zcr < 0.35)
    }
}

/// A completed utterance: original-rate audio between VAD edges.
#[derive(Debug, Clone)]
pub struct Utterance {
    /// Accumulated samples at the original input rate.
    pub samples: Vec<i16>,
    /// Sample rate of `samples`.
    pub sample_rate: u32,
    /// RMS of the accumulated audio, int16 scale.
    pub rms: f32,
}

impl Utterance {
    /// Whether the utterance clears the given energy floor.
    #[must_use]
    pub fn energy_qualifies(&self, floor: f32) -> bool {
        self.rms >= floor
    }
}

/// Per-chunk VAD output.
#[derive(Debug, Default)]
pub struct VadUpdate {
    /// Any frame in this chunk was voiced.
    pub is_speech: bool,
    /// An utterance opened on this chunk.
    pub speech_started: bool,
    /// An utterance closed on this chunk.
    pub speech_ended: bool,
    /// The closed utterance, present iff `speech_ended`.
    pub utterance: Option<Utterance>,
}

/// Energy-gated voice activity detector.
pub struct VoiceActivityDetector {
    frame_duration_ms: u32,
    frame_size: usize,
    energy_threshold: f32,
    native_rate: u32,

    speech_frames_needed: u32,
    silence_frames_needed: u32,
    max_speech_frames: u32,

    classifier: Box<dyn FrameClassifier>,

    in_speech: bool,
    speech_frames: u32,
    silence_frames: u32,
    total_frames: u32,

    /// Original-rate audio since the last emit.
    audio_buffer: VecDeque<i16>,
    /// Pending 16kHz samples not yet forming a whole frame.
    frame_buffer: Vec<i16>,
}

impl VoiceActivityDetector {
    /// Create a detector for input at `native_rate` with the built-in
    /// classifier.
    #[must_use]
    pub fn new(config: &VadConfig, native_rate: u32) -> Self {
        Self::with_classifier(config, native_rate, Box::new(BandEnergyClassifier))
    }

    /// Create a detector with a custom frame classifier.
    #[must_use]
    pub fn with_classifier(
        config: &VadConfig,
        native_rate: u32,
        classifier: Box<dyn FrameClassifier>,
    ) -> Self {
        let frame_ms = match config.frame_duration_ms {
            10 | 20 | 30 => config.frame_duration_ms,
            other => {
                warn!("unsupported VAD frame duration {other}ms, using 30ms");
                30
            }
        };
        let frame_size = (CLASSIFIER_RATE * frame_ms / 1000) as usize;

        info!(
            "VAD initialized: frame={}ms, energy>={}, speech>={}ms, silence>={}ms, cap={}ms",
            frame_ms,
            config.energy_threshold,
            config.min_speech_ms,
            config.min_silence_ms,
            config.max_speech_ms
        );

        Self {
            frame_duration_ms: frame_ms,
            frame_size,
            energy_threshold: config.energy_threshold,
            native_rate,
            speech_frames_needed: (config.min_speech_ms / frame_ms).max(1),
            silence_frames_needed: (config.min_silence_ms / frame_ms).max(1),
            max_speech_frames: (config.max_speech_ms / frame_ms).max(1),
            classifier,
            in_speech: false,
            speech_frames: 0,
            silence_frames: 0,
            total_frames: 0,
            audio_buffer: VecDeque::with_capacity(native_rate as usize),
            frame_buffer: Vec::new(),
        }
    }

    /// Frame duration in ms actually in use.
    #[must_use]
    pub fn frame_duration_ms(&self) -> u32 {
        self.frame_duration_ms
    }

    /// Whether an utterance is currently open.
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.in_speech
    }

    /// Reset all state for a new call.
    pub fn reset(&mut self) {
        self.in_speech = false;
        self.speech_frames = 0;
        self.silence_frames = 0;
        self.total_frames = 0;
        self.audio_buffer.clear();
        self.frame_buffer.clear();
    }

    /// Feed a chunk of original-rate audio through the detector.
    pub fn process_chunk(&mut self, chunk: &[i16]) -> VadUpdate {
        let mut update = VadUpdate::default();
        if chunk.is_empty() {
            return update;
        }

        // Keep the original audio for transcription.
        self.audio_buffer.extend(chunk.iter().copied());
        let cap = self.native_rate as usize * BUFFER_CAP_SECS;
        while self.audio_buffer.len() > cap {
            let _ = self.audio_buffer.pop_front();
        }

        // Analysis copy at the classifier rate.
        let analysis = resample::resample(chunk, self.native_rate, CLASSIFIER_RATE);
        self.frame_buffer.extend_from_slice(&analysis);

        while self.frame_buffer.len() >= self.frame_size {
            let frame: Vec<i16> = self.frame_buffer.drain(..self.frame_size).collect();
            self.step_frame(&frame, &mut update);
        }

        update
    }

    fn step_frame(&mut self, frame: &[i16], update: &mut VadUpdate) {
        let energy = rms(frame);
        let voiced = if energy >= self.energy_threshold {
            match self.classifier.is_speech(frame, CLASSIFIER_RATE) {
                Ok(decision) => decision,
                Err(e) => {
                    warn!("frame classifier failed, treating as unvoiced: {e}");
                    false
                }
            }
        } else {
            false
        };

        if voiced {
            update.is_speech = true;
            self.speech_frames += 1;
            self.silence_frames = 0;

            if !self.in_speech && self.speech_frames >= self.speech_frames_needed {
                self.in_speech = true;
                self.total_frames = 0;
                update.speech_started = true;
                debug!("speech started");
            } else if self.in_speech {
                self.total_frames += 1;
                if self.total_frames >= self.max_speech_frames {
                    info!("max speech duration reached, forcing utterance end");
                    self.emit(update);
                }
            }
        } else {
            self.speech_frames = 0;

            if self.in_speech {
                self.silence_frames += 1;
                self.total_frames += 1;

                if self.total_frames >= self.max_speech_frames {
                    info!("max speech duration reached, forcing utterance end");
                    self.emit(update);
                } else if self.silence_frames >= self.silence_frames_needed {
                    debug!("speech ended ({} buffered samples)", self.audio_buffer.len());
                    self.emit(update);
                }
            }
        }
    }

    fn emit(&mut self, update: &mut VadUpdate) {
        self.in_speech = false;
        self.silence_frames = 0;
        self.total_frames = 0;

        let samples: Vec<i16> = self.audio_buffer.drain(..).collect();
        let energy = rms(&samples);
        update.speech_ended = true;
        update.utterance = Some(Utterance {
            samples,
            sample_rate: self.native_rate,
            rms: energy,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 16_000;
    const FRAME_MS: usize = 30;
    const FRAME: usize = RATE as usize * FRAME_MS / 1000;

    fn config() -> VadConfig {
        VadConfig {
            frame_duration_ms: 30,
            energy_threshold: 500.0,
            min_speech_ms: 240,
            min_silence_ms: 600,
            max_speech_ms: 15_000,
        }
    }

    /// A 300Hz tone frame: low ZCR, high energy, reads as voiced.
    fn voiced_ms(ms: usize) -> Vec<i16> {
        let len = RATE as usize * ms / 1000;
        (0..len)
            .map(|i| {
                let t = i as f64 / f64::from(RATE);
                (8000.0 * (2.0 * std::f64::consts::PI * 300.0 * t).sin()) as i16
            })
            .collect()
    }

    fn silence_ms(ms: usize) -> Vec<i16> {
        vec![0i16; RATE as usize * ms / 1000]
    }

    fn feed(vad: &mut VoiceActivityDetector, samples: &[i16]) -> (u32, u32, Option<Utterance>) {
        let mut started = 0;
        let mut ended = 0;
        let mut utterance = None;
        for chunk in samples.chunks(FRAME) {
            let update = vad.process_chunk(chunk);
            if update.speech_started {
                started += 1;
            }
            if update.speech_ended {
                ended += 1;
                utterance = update.utterance;
            }
        }
        (started, ended, utterance)
    }

    #[test]
    fn silence_speech_silence_yields_one_utterance() {
        let mut vad = VoiceActivityDetector::new(&config(), RATE);

        let mut signal = silence_ms(300);
        signal.extend(voiced_ms(900));
        signal.extend(silence_ms(900));

        let (started, ended, utterance) = feed(&mut vad, &signal);
        assert_eq!(started, 1);
        assert_eq!(ended, 1);

        // Buffer spans everything from the start through the closing
        // frame: leading silence + speech + the min-silence tail.
        let utterance = utterance.expect("utterance");
        assert_eq!(utterance.sample_rate, RATE);
        let expected = (300 + 900 + 600) * RATE as usize / 1000;
        let slack = FRAME * 2;
        assert!(
            utterance.samples.len() >= expected - slack
                && utterance.samples.len() <= expected + slack,
            "buffer len {} vs expected {expected}",
            utterance.samples.len()
        );
    }

    #[test]
    fn too_short_speech_never_triggers() {
        let mut vad = VoiceActivityDetector::new(&config(), RATE);

        // 120ms of voiced audio is under the 240ms minimum.
        let mut signal = voiced_ms(120);
        signal.extend(silence_ms(900));

        let (started, ended, _) = feed(&mut vad, &signal);
        assert_eq!(started, 0);
        assert_eq!(ended, 0);
    }

    #[test]
    fn quiet_audio_fails_the_energy_gate() {
        let mut vad = VoiceActivityDetector::new(&config(), RATE);

        // Same waveform, scaled below the energy threshold.
        let quiet: Vec<i16> = voiced_ms(900).iter().map(|&s| s / 100).collect();
        let (started, _, _) = feed(&mut vad, &quiet);
        assert_eq!(started, 0);
    }

    #[test]
    fn max_speech_cap_forces_an_end() {
        let mut vad = VoiceActivityDetector::new(&config(), RATE);

        // 30s of continuous speech against a 15s cap.
        let signal = voiced_ms(30_000);
        let mut started_at = None;
        let mut ended_at = None;
        for (i, chunk) in signal.chunks(FRAME).enumerate() {
            let update = vad.process_chunk(chunk);
            if update.speech_started && started_at.is_none() {
                started_at = Some(i);
            }
            if update.speech_ended && ended_at.is_none() {
                ended_at = Some(i);
            }
        }

        let started_at = started_at.expect("speech_started");
        let ended_at = ended_at.expect("speech_ended");
        let frames_between = ended_at - started_at;
        let cap_frames = 15_000 / FRAME_MS;
        assert!(
            frames_between.abs_diff(cap_frames) <= 1,
            "cap fired after {frames_between} frames, expected ~{cap_frames}"
        );
    }

    #[test]
    fn second_utterance_does_not_contain_the_first() {
        let mut vad = VoiceActivityDetector::new(&config(), RATE);

        let mut first = silence_ms(60);
        first.extend(voiced_ms(1200));
        first.extend(silence_ms(900));
        let (_, _, utterance_one) = feed(&mut vad, &first);
        let len_one = utterance_one.expect("first utterance").samples.len();

        let mut second = voiced_ms(600);
        second.extend(silence_ms(900));
        let (_, _, utterance_two) = feed(&mut vad, &second);
        let len_two = utterance_two.expect("second utterance").samples.len();

        // The second buffer restarts from the first emit point: leftover
        // tail silence (300ms) + speech (600ms) + min-silence (600ms).
        let expected_two = (300 + 600 + 600) * RATE as usize / 1000;
        assert!(
            len_two.abs_diff(expected_two) <= FRAME * 2,
            "second utterance {len_two} vs expected {expected_two}"
        );
        assert!(len_two < len_one);
    }

    #[test]
    fn classifier_failure_is_unvoiced() {
        struct FailingClassifier;
        impl FrameClassifier for FailingClassifier {
            fn is_speech(&mut self, _frame: &[i16], _rate: u32) -> Result<bool> {
                Err(crate::error::AgentError::Vad("model gone".into()))
            }
        }

        let mut vad =
            VoiceActivityDetector::with_classifier(&config(), RATE, Box::new(FailingClassifier));
        let (started, _, _) = feed(&mut vad, &voiced_ms(900));
        assert_eq!(started, 0);
    }

    #[test]
    fn resamples_non_classifier_rates() {
        let mut vad = VoiceActivityDetector::new(&config(), 24_000);

        let len = 24_000 * 900 / 1000;
        let voiced: Vec<i16> = (0..len)
            .map(|i| {
                let t = i as f64 / 24_000.0;
                (8000.0 * (2.0 * std::f64::consts::PI * 300.0 * t).sin()) as i16
            })
            .collect();
        let mut signal = voiced;
        signal.extend(vec![0i16; 24_000 * 900 / 1000]);

        let mut started = 0;
        let mut utterance = None;
        for chunk in signal.chunks(720) {
            let update = vad.process_chunk(chunk);
            if update.speech_started {
                started += 1;
            }
            if update.utterance.is_some() {
                utterance = update.utterance;
            }
        }
        assert_eq!(started, 1);
        // Emitted buffer is the original 24kHz audio, not the 16kHz copy.
        assert_eq!(utterance.expect("utterance").sample_rate, 24_000);
    }
}

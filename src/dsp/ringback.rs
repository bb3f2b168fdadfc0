//! Ringback tone detection and answer inference.
//!
//! US ringback is a 440Hz + 480Hz dual tone, 2s on / 4s off. While an
//! outbound call is ringing, the caller hears ringback; when it stops and
//! voice energy appears instead, the remote party has most likely picked
//! up. The modem's CLCC transition stays authoritative for CONNECTED; this
//! detector only supplies the early hint.

use crate::dsp::goertzel::goertzel_magnitude;
use std::collections::VecDeque;
use tracing::{debug, info};

const FREQ_LOW: f64 = 440.0;
const FREQ_HIGH: f64 = 480.0;

/// Minimum Goertzel magnitude for a tone leg to count as present.
const TONE_THRESHOLD: f64 = 500.0;
/// RMS (int16 scale) above which non-ringback audio counts as voice.
const VOICE_FLOOR: f64 = 200.0;
/// Frames of tone history kept for the answer heuristic.
const HISTORY_LEN: usize = 100;

/// Per-frame detection status.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RingbackStatus {
    /// Both ringback legs present in this frame.
    pub is_ringback: bool,
    /// Audio present but not ringback.
    pub is_voice: bool,
    /// The call has been inferred answered (latched once).
    pub answered: bool,
    /// Frame RMS on the int16 scale.
    pub rms: f64,
}

/// Goertzel-based ringback detector with a sliding tone history.
pub struct RingbackDetector {
    sample_rate: u32,
    history: VecDeque<bool>,
    answered: bool,
}

impl RingbackDetector {
    /// Create a detector for the given sample rate.
    #[must_use]
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            history: VecDeque::with_capacity(HISTORY_LEN),
            answered: false,
        }
    }

    /// Whether a frame contains the dual ringback tone.
    ///
    /// Frames shorter than 100 samples lack the frequency resolution to
    /// separate 440 from 480Hz and are never classified as ringback.
    #[must_use]
    pub fn is_ringback(&self, samples: &[i16]) -> bool {
        if samples.len() < 100 {
            return false;
        }
        let mag_low = goertzel_magnitude(samples, FREQ_LOW, self.sample_rate);
        let mag_high = goertzel_magnitude(samples, FREQ_HIGH, self.sample_rate);

        if mag_low > 100.0 || mag_high > 100.0 {
            debug!("tone magnitudes: 440Hz={mag_low:.0}, 480Hz={mag_high:.0}");
        }

        mag_low > TONE_THRESHOLD && mag_high > TONE_THRESHOLD
    }

    /// Process one frame and update the answer inference.
    pub fn process(&mut self, samples: &[i16]) -> RingbackStatus {
        let ringback_now = self.is_ringback(samples);

        if self.history.len() >= HISTORY_LEN {
            let _ = self.history.pop_front();
        }
        self.history.push_back(ringback_now);

        let rms = f64::from(crate::audio::rms(samples));
        let is_voice = rms > VOICE_FLOOR && !ringback_now;

        // Answer = sustained ringback earlier, none recently, voice now.
        if !self.answered && self.history.len() > 10 {
            let split = self.history.len() - 10;
            let older: usize = self.history.iter().take(split).filter(|&&b| b).count();
            let recent: usize = self.history.iter().skip(split).filter(|&&b| b).count();

            if older > 5 && recent < 2 && is_voice {
                info!("call answered (ringback stopped, voice started)");
                self.answered = true;
            }
        }

        RingbackStatus {
            is_ringback: ringback_now,
            is_voice,
            answered: self.answered,
            rms,
        }
    }

    /// Reset for a new call.
    pub fn reset(&mut self) {
        self.history.clear();
        self.answered = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 24_000;
    const FRAME: usize = 2400;

    fn ringback_frame() -> Vec<i16> {
        (0..FRAME)
            .map(|i| {
                let t = i as f64 / f64::from(RATE);
                let v = 16_000.0 * (2.0 * std::f64::consts::PI * 440.0 * t).sin()
                    + 16_000.0 * (2.0 * std::f64::consts::PI * 480.0 * t).sin();
                v.clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
            })
            .collect()
    }

    fn noise_frame(seed: u64) -> Vec<i16> {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        (0..FRAME).map(|_| rng.gen_range(-3000i16..3000)).collect()
    }

    #[test]
    fn synthetic_ringback_is_detected() {
        let detector = RingbackDetector::new(RATE);
        assert!(detector.is_ringback(&ringback_frame()));
    }

    #[test]
    fn noise_is_not_ringback() {
        let detector = RingbackDetector::new(RATE);
        assert!(!detector.is_ringback(&noise_frame(7)));
    }

    #[test]
    fn silence_is_neither_ringback_nor_voice() {
        let mut detector = RingbackDetector::new(RATE);
        let status = detector.process(&vec![0i16; FRAME]);
        assert!(!status.is_ringback);
        assert!(!status.is_voice);
        assert!(!status.answered);
    }

    #[test]
    fn answer_fires_once_after_ringback_then_voice() {
        let mut detector = RingbackDetector::new(RATE);

        // Sustained ringing.
        for _ in 0..20 {
            let status = detector.process(&ringback_frame());
            assert!(!status.answered);
        }
        // Line goes quiet, then the callee speaks.
        for _ in 0..10 {
            detector.process(&vec![0i16; FRAME]);
        }
        let status = detector.process(&noise_frame(3));
        assert!(status.answered, "voice after ringback should infer answer");

        // Latched: later ringback-free frames keep reporting answered.
        let again = detector.process(&noise_frame(4));
        assert!(again.answered);
    }

    #[test]
    fn voice_without_prior_ringback_is_not_an_answer() {
        let mut detector = RingbackDetector::new(RATE);
        for seed in 0..30 {
            let status = detector.process(&noise_frame(seed));
            assert!(!status.answered);
        }
    }

    #[test]
    fn reset_clears_the_latch() {
        let mut detector = RingbackDetector::new(RATE);
        for _ in 0..20 {
            detector.process(&ringback_frame());
        }
        for _ in 0..10 {
            detector.process(&vec![0i16; FRAME]);
        }
        assert!(detector.process(&noise_frame(9)).answered);

        detector.reset();
        assert!(!detector.process(&noise_frame(10)).answered);
    }

    #[test]
    fn short_frames_are_ignored() {
        let detector = RingbackDetector::new(RATE);
        assert!(!detector.is_ringback(&[1000i16; 50]));
    }
}

//! Standard US call-progress and DTMF tone classification.
//!
//! Phone tones carry two to four discrete frequencies; speech spreads its
//! energy across the spectrum. A short windowed FFT plus local-maxima peak
//! picking separates the two, and the surviving peaks are matched against
//! the US tone templates.

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use tracing::info;

/// Matching tolerance around template frequencies, in Hz.
const TOLERANCE_HZ: f64 = 20.0;
/// Frequency band considered for peaks, in Hz.
const BAND: (f64, f64) = (300.0, 3000.0);
/// More distinct peaks than this means speech, not a tone.
const MAX_TONE_PEAKS: usize = 6;

const DTMF_LOW: [f64; 4] = [697.0, 770.0, 852.0, 941.0];
const DTMF_HIGH: [f64; 4] = [1209.0, 1336.0, 1477.0, 1633.0];

/// A recognized US phone tone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToneKind {
    /// 350 + 440Hz, continuous.
    Dial,
    /// 440 + 480Hz, 2s on / 4s off.
    Ringback,
    /// 480 + 620Hz, slow or fast cadence (busy / reorder share frequencies).
    Busy,
    /// 1400 / 2060 / 2450 / 2600Hz off-hook warning.
    OffHook,
    /// One low + one high DTMF leg.
    Dtmf,
}

impl ToneKind {
    fn template(self) -> &'static [f64] {
        match self {
            Self::Dial => &[350.0, 440.0],
            Self::Ringback => &[440.0, 480.0],
            Self::Busy => &[480.0, 620.0],
            Self::OffHook => &[1400.0, 2060.0, 2450.0, 2600.0],
            Self::Dtmf => &[],
        }
    }
}

/// Analysis result for one frame.
#[derive(Debug, Clone, Default)]
pub struct ToneReport {
    /// A known tone was recognized.
    pub tone: Option<ToneKind>,
    /// Ringback recognized in this frame.
    pub is_ringback: bool,
    /// Ringback just stopped after a sustained run (fires once per call).
    pub ringback_ended: bool,
    /// Dominant peak frequencies found in the 300-3000Hz band.
    pub dominant_freqs: Vec<f64>,
}

impl ToneReport {
    /// The frame is a recognized tone rather than speech or silence.
    #[must_use]
    pub fn is_tone(&self) -> bool {
        self.tone.is_some()
    }
}

/// FFT-based tone classifier with per-call ringback edge state.
pub struct ToneDetector {
    sample_rate: u32,
    planner: FftPlanner<f32>,
    was_ringback: bool,
    ringback_count: u32,
    ringback_ended_fired: bool,
}

impl ToneDetector {
    /// Create a detector for the given sample rate.
    #[must_use]
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            planner: FftPlanner::new(),
            was_ringback: false,
            ringback_count: 0,
            ringback_ended_fired: false,
        }
    }

    /// Classify one frame of audio.
    ///
    /// Frames shorter than 512 samples lack the frequency resolution for
    /// template matching and report nothing.
    pub fn detect(&mut self, samples: &[i16]) -> ToneReport {
        let mut report = ToneReport::default();
        if samples.len() < 512 {
            return report;
        }

        let peaks = self.dominant_peaks(samples);
        if peaks.is_empty() {
            self.track_ringback_edge(&mut report);
            return report;
        }
        report.dominant_freqs = peaks.clone();

        // Many peaks across the band means speech.
        if peaks.len() > MAX_TONE_PEAKS {
            self.track_ringback_edge(&mut report);
            return report;
        }

        for kind in [
            ToneKind::Dial,
            ToneKind::Ringback,
            ToneKind::Busy,
            ToneKind::OffHook,
        ] {
            if matches_template(&peaks, kind.template()) {
                report.tone = Some(kind);
                if kind == ToneKind::Ringback {
                    report.is_ringback = true;
                    self.ringback_count += 1;
                }
                break;
            }
        }

        if report.tone.is_none() && peaks.len() <= 3 && is_dtmf(&peaks) {
            report.tone = Some(ToneKind::Dtmf);
        }

        self.track_ringback_edge(&mut report);
        report
    }

    /// Reset per-call state.
    pub fn reset(&mut self) {
        self.was_ringback = false;
        self.ringback_count = 0;
        self.ringback_ended_fired = false;
    }

    fn track_ringback_edge(&mut self, report: &mut ToneReport) {
        if !self.ringback_ended_fired
            && self.was_ringback
            && !report.is_ringback
            && self.ringback_count >= 2
        {
            report.ringback_ended = true;
            self.ringback_ended_fired = true;
            info!("ringback ended, call likely answered");
        }
        self.was_ringback = report.is_ringback;
    }

    /// Local spectral maxima above 50% of the peak, inside the tone band.
    fn dominant_peaks(&mut self, samples: &[i16]) -> Vec<f64> {
        let n = samples.len();
        let mut buffer: Vec<Complex<f32>> = samples
            .iter()
            .enumerate()
            .map(|(i, &s)| {
                let hann = 0.5
                    * (1.0
                        - (2.0 * std::f32::consts::PI * i as f32 / (n - 1) as f32).cos());
                Complex::new(f32::from(s) / 32768.0 * hann, 0.0)
            })
            .collect();

        let fft = self.planner.plan_fft_forward(n);
        fft.process(&mut buffer);

        let half = n / 2;
        let magnitudes: Vec<f32> = buffer[..=half].iter().map(|c| c.norm()).collect();
        let max_mag = magnitudes.iter().copied().fold(0.0f32, f32::max);
        if max_mag <= 0.0 {
            return Vec::new();
        }
        let threshold = max_mag * 0.5;
        let bin_hz = f64::from(self.sample_rate) / n as f64;

        let mut peaks = Vec::new();
        for i in 1..magnitudes.len() - 1 {
            let freq = i as f64 * bin_hz;
            if freq < BAND.0 || freq > BAND.1 {
                continue;
            }
            if magnitudes[i] > threshold
                && magnitudes[i] > magnitudes[i - 1]
                && magnitudes[i] > magnitudes[i + 1]
            {
                peaks.push(freq);
            }
        }
        peaks
    }
}

/// Every template frequency must have a detected peak within tolerance.
fn matches_template(peaks: &[f64], template: &[f64]) -> bool {
    if peaks.len() < template.len() {
        return false;
    }
    template
        .iter()
        .all(|&t| peaks.iter().any(|&p| (p - t).abs() <= TOLERANCE_HZ))
}

/// DTMF is exactly one low-group leg plus one high-group leg.
fn is_dtmf(peaks: &[f64]) -> bool {
    let has_low = peaks
        .iter()
        .any(|&p| DTMF_LOW.iter().any(|&f| (p - f).abs() <= TOLERANCE_HZ));
    let has_high = peaks
        .iter()
        .any(|&p| DTMF_HIGH.iter().any(|&f| (p - f).abs() <= TOLERANCE_HZ));
    has_low && has_high
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 24_000;

    fn dual_tone(f1: f64, f2: f64, len: usize) -> Vec<i16> {
        (0..len)
            .map(|i| {
                let t = i as f64 / f64::from(RATE);
                let v = 12_000.0 * (2.0 * std::f64::consts::PI * f1 * t).sin()
                    + 12_000.0 * (2.0 * std::f64::consts::PI * f2 * t).sin();
                v.clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
            })
            .collect()
    }

    #[test]
    fn classifies_standard_tones() {
        let mut detector = ToneDetector::new(RATE);
        assert_eq!(
            detector.detect(&dual_tone(350.0, 440.0, 4096)).tone,
            Some(ToneKind::Dial)
        );
        assert_eq!(
            detector.detect(&dual_tone(440.0, 480.0, 4096)).tone,
            Some(ToneKind::Ringback)
        );
        assert_eq!(
            detector.detect(&dual_tone(480.0, 620.0, 4096)).tone,
            Some(ToneKind::Busy)
        );
    }

    #[test]
    fn classifies_dtmf_digit() {
        // DTMF '5' = 770 + 1336Hz.
        let mut detector = ToneDetector::new(RATE);
        let report = detector.detect(&dual_tone(770.0, 1336.0, 4096));
        assert_eq!(report.tone, Some(ToneKind::Dtmf));
    }

    #[test]
    fn harmonic_rich_speech_is_not_a_tone() {
        // A voiced phoneme has harmonics all over the band; more than six
        // peaks means speech regardless of which templates they graze.
        let harmonics = [400.0, 800.0, 1200.0, 1600.0, 2000.0, 2400.0, 2800.0, 600.0];
        let speech: Vec<i16> = (0..4096)
            .map(|i| {
                let t = i as f64 / f64::from(RATE);
                let v: f64 = harmonics
                    .iter()
                    .map(|&f| 3000.0 * (2.0 * std::f64::consts::PI * f * t).sin())
                    .sum();
                v.clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
            })
            .collect();

        let mut detector = ToneDetector::new(RATE);
        let report = detector.detect(&speech);
        assert!(report.tone.is_none(), "speech classified as {:?}", report.tone);
        assert!(report.dominant_freqs.len() > MAX_TONE_PEAKS);
    }

    #[test]
    fn white_noise_is_not_ringback() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let noise: Vec<i16> = (0..4096).map(|_| rng.gen_range(-8000i16..8000)).collect();

        let mut detector = ToneDetector::new(RATE);
        let report = detector.detect(&noise);
        assert!(!report.is_ringback);
    }

    #[test]
    fn silence_reports_nothing() {
        let mut detector = ToneDetector::new(RATE);
        let report = detector.detect(&vec![0i16; 4096]);
        assert!(report.tone.is_none());
        assert!(report.dominant_freqs.is_empty());
    }

    #[test]
    fn short_frames_are_skipped() {
        let mut detector = ToneDetector::new(RATE);
        let report = detector.detect(&dual_tone(440.0, 480.0, 256));
        assert!(report.tone.is_none());
    }

    #[test]
    fn ringback_ended_fires_once() {
        let mut detector = ToneDetector::new(RATE);
        let ring = dual_tone(440.0, 480.0, 4096);
        let silence = vec![0i16; 4096];

        detector.detect(&ring);
        detector.detect(&ring);
        let ended = detector.detect(&silence);
        assert!(ended.ringback_ended);

        // Subsequent transitions stay quiet until reset.
        detector.detect(&ring);
        let again = detector.detect(&silence);
        assert!(!again.ringback_ended);

        detector.reset();
        detector.detect(&ring);
        detector.detect(&ring);
        assert!(detector.detect(&silence).ringback_ended);
    }

    #[test]
    fn single_ringback_blip_does_not_count_as_answer() {
        let mut detector = ToneDetector::new(RATE);
        detector.detect(&dual_tone(440.0, 480.0, 4096));
        let report = detector.detect(&vec![0i16; 4096]);
        assert!(!report.ringback_ended);
    }
}

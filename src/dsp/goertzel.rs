//! Goertzel single-frequency magnitude detection.
//!
//! Cheaper than an FFT when only a couple of bins matter, which is exactly
//! the ringback case (440Hz + 480Hz).

/// Magnitude of `target_freq` in `samples` at `sample_rate`.
///
/// Samples are normalized to [-1, 1] before the recurrence so magnitudes
/// are comparable across frame lengths and input levels.
#[must_use]
pub fn goertzel_magnitude(samples: &[i16], target_freq: f64, sample_rate: u32) -> f64 {
    let n = samples.len();
    if n == 0 || sample_rate == 0 {
        return 0.0;
    }

    let k = (0.5 + n as f64 * target_freq / f64::from(sample_rate)).floor();
    let omega = 2.0 * std::f64::consts::PI * k / n as f64;
    let coeff = 2.0 * omega.cos();

    let (mut s1, mut s2) = (0.0f64, 0.0f64);
    for &sample in samples {
        let x = f64::from(sample) / 32768.0;
        let s0 = x + coeff * s1 - s2;
        s2 = s1;
        s1 = s0;
    }

    (s1 * s1 + s2 * s2 - coeff * s1 * s2).max(0.0).sqrt()
}

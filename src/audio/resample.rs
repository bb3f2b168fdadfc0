//! Sample-rate conversion between device rates and the pipeline rate.
//!
//! The 2x paths are the hot paths (48kHz devices, 24kHz pipeline) and are
//! explicit. The downsampler low-pass filters before decimating; naive
//! decimation folds high-frequency call-progress energy into the voice band
//! and confuses the VAD.

/// 5-tap symmetric low-pass FIR applied before 2x decimation.
/// Weights sum to 1; rejection at 15kHz (48kHz input) is better than 20dB
/// relative to the 1kHz passband.
const DOWNSAMPLE_KERNEL: [f32; 5] = [0.15, 0.2, 0.3, 0.2, 0.15];

/// Convert between arbitrary rates.
///
/// Dispatches to the filtered 2x downsample or the 2x upsample when the
/// ratio is exact; everything else is linear interpolation.
#[must_use]
pub fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    if from_rate == to_rate * 2 {
        return downsample_2x(samples);
    }
    if to_rate == from_rate * 2 {
        return upsample_2x(samples);
    }
    resample_linear(samples, from_rate, to_rate)
}

/// 2x downsample: low-pass FIR, then take every other sample.
#[must_use]
pub fn downsample_2x(samples: &[i16]) -> Vec<i16> {
    if samples.is_empty() {
        return Vec::new();
    }

    // Same-length convolution with edge samples clamped.
    let n = samples.len();
    let half = DOWNSAMPLE_KERNEL.len() / 2;
    let mut out = Vec::with_capacity(n.div_ceil(2));

    for i in (0..n).step_by(2) {
        let mut acc = 0.0f32;
        for (k, &coeff) in DOWNSAMPLE_KERNEL.iter().enumerate() {
            let idx = (i + k).saturating_sub(half).min(n - 1);
            acc += f32::from(samples[idx]) * coeff;
        }
        out.push(clip_i16(acc));
    }
    out
}

/// 2x upsample: linear midpoints between originals, final sample duplicated.
#[must_use]
pub fn upsample_2x(samples: &[i16]) -> Vec<i16> {
    if samples.is_empty() {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(samples.len() * 2);
    for pair in samples.windows(2) {
        out.push(pair[0]);
        let mid = (f32::from(pair[0]) + f32::from(pair[1])) / 2.0;
        out.push(clip_i16(mid));
    }
    let last = samples[samples.len() - 1];
    out.push(last);
    out.push(last);
    out
}

/// Generic linear-interpolation resampler over fractional sample indices.
#[must_use]
pub fn resample_linear(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return Vec::new();
    }

    let ratio = f64::from(from_rate) / f64::from(to_rate);
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut out = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let value = if idx + 1 < samples.len() {
            f64::from(samples[idx]) * (1.0 - frac) + f64::from(samples[idx + 1]) * frac
        } else {
            f64::from(samples[idx.min(samples.len() - 1)])
        };
        out.push(clip_i16(value as f32));
    }
    out
}

fn clip_i16(value: f32) -> i16 {
    value.round().clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
}

//! Full-duplex audio routing between host devices and the call pipeline.
//!
//! Call audio reaches the host through a pair of audio devices wired to the
//! modem's 3.5mm jack: the input device carries the remote party, the output
//! device feeds synthesized speech into the call. The router captures at the
//! device's native rate, converts to the 24kHz pipeline rate at the edge,
//! and never blocks the device callback.

use crate::audio::{resample, rms, AudioFrame};
use crate::config::AudioConfig;
use crate::error::{AgentError, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Audio captured/played alongside the call for the WAV recording.
#[derive(Default)]
struct RecordingState {
    armed: bool,
    both_sides: bool,
    input: Vec<i16>,
    output: Vec<i16>,
}

/// Full-duplex router between named host devices and 24kHz call frames.
pub struct AudioRouter {
    config: AudioConfig,
    input_rx: Mutex<Option<mpsc::Receiver<AudioFrame>>>,
    recording: Arc<Mutex<RecordingState>>,
    stop: Arc<AtomicBool>,
    capture_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    output_rate: Mutex<Option<u32>>,
}

impl AudioRouter {
    /// Create a router bound to the configured device names.
    #[must_use]
    pub fn new(config: AudioConfig) -> Self {
        Self {
            config,
            input_rx: Mutex::new(None),
            recording: Arc::new(Mutex::new(RecordingState::default())),
            stop: Arc::new(AtomicBool::new(false)),
            capture_thread: Mutex::new(None),
            output_rate: Mutex::new(None),
        }
    }

    /// Open both streams and start the capture callback.
    ///
    /// # Errors
    ///
    /// Returns an error if either device cannot be found or the input
    /// stream cannot be created.
    pub fn start(&self) -> Result<()> {
        let input_device = find_device(&self.config.input_device, true)?;
        let output_device = find_device(&self.config.output_device, false)?;

        let output_rate = output_device
            .default_output_config()
            .map_err(|e| AgentError::Audio(format!("no default output config: {e}")))?
            .sample_rate()
            .0;
        *lock_or_audio_err(&self.output_rate)? = Some(output_rate);

        let input_config = input_device
            .default_input_config()
            .map_err(|e| AgentError::Audio(format!("no default input config: {e}")))?;
        let native_rate = input_config.sample_rate().0;
        let native_channels = input_config.channels();

        info!(
            "audio routing: in '{}' @{}Hz ({}ch) / out '{}' @{}Hz -> pipeline {}Hz",
            device_name(&input_device),
            native_rate,
            native_channels,
            device_name(&output_device),
            output_rate,
            self.config.pipeline_sample_rate
        );

        let (tx, rx) = mpsc::channel::<AudioFrame>(self.config.input_queue_frames);
        *lock_or_audio_err(&self.input_rx)? = Some(rx);

        self.stop.store(false, Ordering::Relaxed);
        let stop = Arc::clone(&self.stop);
        let recording = Arc::clone(&self.recording);
        let pipeline_rate = self.config.pipeline_sample_rate;

        // The cpal stream is not Send; it lives on its own thread for the
        // duration of the call.
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();
        let handle = std::thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                capture_thread_main(
                    &input_device,
                    native_rate,
                    native_channels,
                    pipeline_rate,
                    tx,
                    recording,
                    stop,
                    &ready_tx,
                );
            })
            .map_err(|e| AgentError::Audio(format!("failed to spawn capture thread: {e}")))?;

        *lock_or_audio_err(&self.capture_thread)? = Some(handle);

        match ready_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(result) => result,
            Err(_) => Err(AgentError::Audio(
                "input stream did not start within 5s".into(),
            )),
        }
    }

    /// Non-blocking dequeue of the next 24kHz input frame.
    #[must_use]
    pub fn read_audio(&self) -> Option<AudioFrame> {
        let mut guard = self.input_rx.lock().ok()?;
        guard.as_mut()?.try_recv().ok()
    }

    /// Drop all queued input frames.
    ///
    /// Called after TTS playback completes, before the VAD is re-armed, so
    /// the agent does not transcribe its own voice.
    pub fn clear_input_buffer(&self) {
        if let Ok(mut guard) = self.input_rx.lock() {
            if let Some(rx) = guard.as_mut() {
                let mut cleared = 0usize;
                while rx.try_recv().is_ok() {
                    cleared += 1;
                }
                if cleared > 0 {
                    debug!("cleared {cleared} buffered input frames");
                }
            }
        }
    }

    /// Play a 24kHz frame through the output device, blocking until the
    /// device has drained it.
    ///
    /// # Errors
    ///
    /// Returns an error if the output stream cannot be created or started.
    pub fn write_audio(&self, frame: &AudioFrame) -> Result<()> {
        let output_rate = lock_or_audio_err(&self.output_rate)?
            .ok_or_else(|| AgentError::Audio("router not started".into()))?;

        if let Ok(mut rec) = self.recording.lock() {
            if rec.armed && rec.both_sides {
                rec.output.extend_from_slice(&frame.samples);
            }
        }

        let samples = resample::resample(&frame.samples, frame.sample_rate, output_rate);
        let device = find_device(&self.config.output_device, false)?;
        play_blocking(&device, output_rate, &samples)
    }

    /// Start buffering call audio for the WAV capture.
    pub fn start_recording(&self) {
        if let Ok(mut rec) = self.recording.lock() {
            rec.input.clear();
            rec.output.clear();
            rec.armed = true;
            rec.both_sides = self.config.record_both_sides;
            info!("recording started");
        }
    }

    /// Stop recording and write the mixed WAV.
    ///
    /// Input and output are added sample-by-sample with saturation; the
    /// shorter side is zero-padded. Returns the written path, or `None`
    /// when nothing was captured.
    ///
    /// # Errors
    ///
    /// Returns an error if the WAV file cannot be written.
    pub fn stop_recording(&self, path: &Path) -> Result<Option<PathBuf>> {
        let (input, output) = {
            let mut rec = lock_or_audio_err(&self.recording)?;
            rec.armed = false;
            (std::mem::take(&mut rec.input), std::mem::take(&mut rec.output))
        };

        if input.is_empty() && output.is_empty() {
            return Ok(None);
        }

        let mixed = mix_saturating(&input, &output);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.config.pipeline_sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec)
            .map_err(|e| AgentError::Audio(format!("cannot create recording: {e}")))?;
        for sample in mixed {
            writer
                .write_sample(sample)
                .map_err(|e| AgentError::Audio(format!("recording write failed: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| AgentError::Audio(format!("recording finalize failed: {e}")))?;

        info!("recording saved to {}", path.display());
        Ok(Some(path.to_path_buf()))
    }

    /// Stop the capture stream and release both devices.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Ok(mut guard) = self.capture_thread.lock() {
            if let Some(handle) = guard.take() {
                let _ = handle.join();
            }
        }
        if let Ok(mut guard) = self.input_rx.lock() {
            *guard = None;
        }
        info!("audio routing stopped");
    }
}

fn lock_or_audio_err<T>(mutex: &Mutex<T>) -> Result<std::sync::MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|e| AgentError::Audio(format!("router lock poisoned: {e}")))
}

/// Body of the capture thread: owns the cpal input stream until stopped.
#[allow(clippy::too_many_arguments)]
fn capture_thread_main(
    device: &cpal::Device,
    native_rate: u32,
    native_channels: u16,
    pipeline_rate: u32,
    tx: mpsc::Sender<AudioFrame>,
    recording: Arc<Mutex<RecordingState>>,
    stop: Arc<AtomicBool>,
    ready_tx: &std::sync::mpsc::Sender<Result<()>>,
) {
    let stream_config = StreamConfig {
        channels: native_channels,
        sample_rate: cpal::SampleRate(native_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    // Rate-limited reporting from the audio callback thread.
    let dropped_full = AtomicU64::new(0);
    let last_report_ms = AtomicU64::new(0);

    let stream = device.build_input_stream(
        &stream_config,
        move |data: &[f32], _info: &cpal::InputCallbackInfo| {
            let mono = if native_channels > 1 {
                to_mono_i16(data, native_channels)
            } else {
                data.iter().map(|&s| f32_to_i16(s)).collect()
            };

            let samples = resample::resample(&mono, native_rate, pipeline_rate);
            let level = rms(&samples);
            let peak = samples.iter().map(|s| s.saturating_abs()).max().unwrap_or(0);

            if let Ok(mut rec) = recording.lock() {
                if rec.armed {
                    rec.input.extend_from_slice(&samples);
                }
            }

            let frame = AudioFrame::new(samples, pipeline_rate);
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(frame) {
                dropped_full.fetch_add(1, Ordering::Relaxed);
            }

            let now_ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            let last = last_report_ms.load(Ordering::Relaxed);
            if now_ms.saturating_sub(last) >= 2_000
                && last_report_ms
                    .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
            {
                let n = dropped_full.swap(0, Ordering::Relaxed);
                if n > 0 {
                    warn!("input queue full, dropped {n} frames (last 2s)");
                }
                debug!("call audio levels: RMS {level:.0}, peak {peak}");
            }
        },
        move |err| {
            error!("audio input stream error: {err}");
        },
        None,
    );

    let stream = match stream {
        Ok(s) => s,
        Err(e) => {
            let _ = ready_tx.send(Err(AgentError::Audio(format!(
                "failed to build input stream: {e}"
            ))));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(AgentError::Audio(format!(
            "failed to start input stream: {e}"
        ))));
        return;
    }
    let _ = ready_tx.send(Ok(()));

    while !stop.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(50));
    }
    drop(stream);
}

/// Play mono int16 samples through a device at its native rate, blocking
/// until the device reports the buffer drained.
fn play_blocking(device: &cpal::Device, sample_rate: u32, samples: &[i16]) -> Result<()> {
    if samples.is_empty() {
        return Ok(());
    }

    struct PlaybackBuffer {
        samples: Vec<i16>,
        position: usize,
        finished: bool,
    }

    let buffer = Arc::new(Mutex::new(PlaybackBuffer {
        samples: samples.to_vec(),
        position: 0,
        finished: false,
    }));
    let buffer_clone = Arc::clone(&buffer);

    let stream_config = StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let mut buf = match buffer_clone.lock() {
                    Ok(b) => b,
                    Err(_) => return,
                };
                for sample in data.iter_mut() {
                    if buf.position < buf.samples.len() {
                        *sample = f32::from(buf.samples[buf.position]) / 32768.0;
                        buf.position += 1;
                    } else {
                        *sample = 0.0;
                        buf.finished = true;
                    }
                }
            },
            move |err| {
                error!("audio output stream error: {err}");
            },
            None,
        )
        .map_err(|e| AgentError::Audio(format!("failed to build output stream: {e}")))?;

    stream
        .play()
        .map_err(|e| AgentError::Audio(format!("failed to start output stream: {e}")))?;

    loop {
        std::thread::sleep(Duration::from_millis(10));
        let buf = buffer
            .lock()
            .map_err(|e| AgentError::Audio(format!("playback buffer lock poisoned: {e}")))?;
        if buf.finished {
            break;
        }
    }

    drop(stream);
    Ok(())
}

/// Find a device whose name contains `needle` (case-insensitive).
fn find_device(needle: &str, for_input: bool) -> Result<cpal::Device> {
    let host = cpal::default_host();
    let needle_lower = needle.to_lowercase();

    let devices = if for_input {
        host.input_devices()
    } else {
        host.output_devices()
    }
    .map_err(|e| AgentError::Audio(format!("cannot enumerate devices: {e}")))?;

    let mut names = Vec::new();
    for device in devices {
        let name = device_name(&device);
        if name.to_lowercase().contains(&needle_lower) {
            return Ok(device);
        }
        names.push(name);
    }

    let kind = if for_input { "input" } else { "output" };
    debug!("available {kind} devices: {names:?}");
    Err(AgentError::Audio(format!(
        "{kind} device matching '{needle}' not found"
    )))
}

fn device_name(device: &cpal::Device) -> String {
    device.name().unwrap_or_else(|_| "<unknown>".into())
}

/// Convert interleaved multi-channel f32 audio to mono int16 by averaging.
fn to_mono_i16(data: &[f32], channels: u16) -> Vec<i16> {
    let ch = usize::from(channels);
    data.chunks_exact(ch)
        .map(|frame| f32_to_i16(frame.iter().sum::<f32>() / ch as f32))
        .collect()
}

fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
}

/// Add two int16 tracks with saturation, zero-padding the shorter one.
fn mix_saturating(a: &[i16], b: &[i16]) -> Vec<i16> {
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| {
            let x = i32::from(a.get(i).copied().unwrap_or(0));
            let y = i32::from(b.get(i).copied().unwrap_or(0));
            (x + y).clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mix_pads_shorter_side_with_zeros() {
        let mixed = mix_saturating(&[100, 200, 300], &[10]);
        assert_eq!(mixed, vec![110, 200, 300]);
    }

    #[test]
    fn mix_saturates_instead_of_wrapping() {
        let mixed = mix_saturating(&[i16::MAX, i16::MIN], &[i16::MAX, i16::MIN]);
        assert_eq!(mixed, vec![i16::MAX, i16::MIN]);
    }

    #[test]
    fn mono_downmix_averages_channels() {
        let stereo = [0.5f32, -0.5, 1.0, 1.0];
        let mono = to_mono_i16(&stereo, 2);
        assert_eq!(mono.len(), 2);
        assert_eq!(mono[0], 0);
        assert_eq!(mono[1], 32767);
    }
}

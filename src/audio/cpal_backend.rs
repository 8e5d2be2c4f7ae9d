//! Hardware capture and playback via cpal.
//!
//! Capture opens the device at its native format, down-mixes to mono and
//! resamples to the configured rate in the callback. Playback feeds a shared
//! sample queue drained by the output callback.

use crate::audio::capture::{CaptureSignals, CaptureSink};
use crate::audio::device::{
    CaptureDevice, CaptureStream, DeviceConfig, PlaybackDevice, PlaybackStream,
};
use crate::audio::dsp;
use crate::error::{DeviceDirection, Result, VoiceError};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Callback gaps longer than the expected period by this factor count as
/// dropped audio.
const GAP_TOLERANCE: f64 = 1.5;

/// Frames of audio the playback queue may hold ahead of the device.
const PLAYBACK_LEAD_FRAMES: usize = 3;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

fn select_device(
    host: &cpal::Host,
    direction: DeviceDirection,
    name: Option<&str>,
) -> Result<cpal::Device> {
    let unavailable = |msg: String| VoiceError::device(direction, msg);
    match (direction, name) {
        (DeviceDirection::Input, Some(name)) => host
            .input_devices()
            .map_err(|e| unavailable(format!("cannot enumerate devices: {e}")))?
            .find(|d| d.description().ok().is_some_and(|desc| desc.name() == name))
            .ok_or_else(|| unavailable(format!("input device '{name}' not found"))),
        (DeviceDirection::Input, None) => host
            .default_input_device()
            .ok_or_else(|| unavailable("no default input device".into())),
        (DeviceDirection::Output, Some(name)) => host
            .output_devices()
            .map_err(|e| unavailable(format!("cannot enumerate devices: {e}")))?
            .find(|d| d.description().ok().is_some_and(|desc| desc.name() == name))
            .ok_or_else(|| unavailable(format!("output device '{name}' not found"))),
        (DeviceDirection::Output, None) => host
            .default_output_device()
            .ok_or_else(|| unavailable("no default output device".into())),
    }
}

fn device_label(device: &cpal::Device) -> String {
    device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into())
}

/// System microphone.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalCaptureDevice;

impl CaptureDevice for CpalCaptureDevice {
    fn open(&self, config: &DeviceConfig, sink: CaptureSink) -> Result<Box<dyn CaptureStream>> {
        let host = cpal::default_host();
        let device = select_device(&host, DeviceDirection::Input, config.device_name.as_deref())?;
        info!("using input device: {}", device_label(&device));

        let default_config = device.default_input_config().map_err(|e| {
            VoiceError::device(
                DeviceDirection::Input,
                format!("no default input config: {e}"),
            )
        })?;
        let native_rate = default_config.sample_rate();
        let native_channels = default_config.channels();
        let stream_config = StreamConfig {
            channels: native_channels,
            sample_rate: native_rate,
            buffer_size: cpal::BufferSize::Default,
        };
        info!(
            native_rate,
            native_channels,
            target_rate = config.sample_rate,
            "native input config"
        );

        let signals: CaptureSignals = sink.signals();
        let mut callback = InputCallback {
            sink,
            native_rate,
            native_channels,
            target_rate: config.sample_rate,
            target_channels: config.channels,
            frame_period: Duration::from_millis(u64::from(config.frame_size_ms.max(1))),
            last: None,
        };

        let stream = device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], info: &cpal::InputCallbackInfo| {
                    callback.on_data(data, info);
                },
                move |err| {
                    error!("audio input stream error: {err}");
                    signals.device_lost(err.to_string());
                },
                None,
            )
            .map_err(|e| {
                VoiceError::device(
                    DeviceDirection::Input,
                    format!("failed to build input stream: {e}"),
                )
            })?;
        stream.play().map_err(|e| {
            VoiceError::device(
                DeviceDirection::Input,
                format!("failed to start input stream: {e}"),
            )
        })?;

        Ok(Box::new(CpalCaptureStream { stream }))
    }
}

struct InputCallback {
    sink: CaptureSink,
    native_rate: u32,
    native_channels: u16,
    target_rate: u32,
    target_channels: u16,
    frame_period: Duration,
    /// Capture instant and expected length of the previous callback.
    last: Option<(cpal::StreamInstant, Duration)>,
}

impl InputCallback {
    fn on_data(&mut self, data: &[f32], info: &cpal::InputCallbackInfo) {
        let channels = self.native_channels.max(1);
        let period = Duration::from_secs_f64(
            (data.len() / channels as usize) as f64 / f64::from(self.native_rate.max(1)),
        );
        let captured = info.timestamp().capture;
        if let Some((prev, prev_period)) = self.last {
            if let Some(gap) = captured.duration_since(&prev) {
                if gap.as_secs_f64() > prev_period.as_secs_f64() * GAP_TOLERANCE {
                    let missing = gap.saturating_sub(prev_period);
                    let frames = (missing.as_secs_f64() / self.frame_period.as_secs_f64()) as u64;
                    if frames > 0 {
                        self.sink.report_gap(frames);
                    }
                }
            }
        }
        self.last = Some((captured, period));

        let mono = dsp::to_mono(data, channels);
        let resampled = dsp::resample_linear(&mono, self.native_rate, self.target_rate);
        let out = dsp::from_mono(&resampled, self.target_channels);
        self.sink.push(&out);
    }
}

struct CpalCaptureStream {
    stream: cpal::Stream,
}

impl CaptureStream for CpalCaptureStream {
    fn close(self: Box<Self>) -> Result<()> {
        if let Err(e) = self.stream.pause() {
            debug!("input stream pause failed: {e}");
        }
        drop(self.stream);
        Ok(())
    }
}

/// System speakers.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalPlaybackDevice;

#[derive(Default)]
struct OutputState {
    queue: VecDeque<f32>,
    failure: Option<String>,
}

impl PlaybackDevice for CpalPlaybackDevice {
    fn open(&self, config: &DeviceConfig) -> Result<Box<dyn PlaybackStream>> {
        let host = cpal::default_host();
        let device =
            select_device(&host, DeviceDirection::Output, config.device_name.as_deref())?;
        info!("using output device: {}", device_label(&device));

        let stream_config = StreamConfig {
            channels: 1,
            sample_rate: config.sample_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let state = Arc::new(Mutex::new(OutputState::default()));
        let render_state = Arc::clone(&state);
        let error_state = Arc::clone(&state);

        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    let mut st = match render_state.lock() {
                        Ok(s) => s,
                        Err(_) => return,
                    };
                    for sample in data.iter_mut() {
                        *sample = st.queue.pop_front().unwrap_or(0.0);
                    }
                },
                move |err| {
                    error!("audio output stream error: {err}");
                    let mut st = error_state.lock().unwrap_or_else(PoisonError::into_inner);
                    st.failure = Some(err.to_string());
                },
                None,
            )
            .map_err(|e| {
                VoiceError::device(
                    DeviceDirection::Output,
                    format!("failed to build output stream: {e}"),
                )
            })?;
        stream.play().map_err(|e| {
            VoiceError::device(
                DeviceDirection::Output,
                format!("failed to start output stream: {e}"),
            )
        })?;

        let frame_samples = config.frame_samples().max(1) / config.channels.max(1) as usize;
        Ok(Box::new(CpalPlaybackStream {
            stream,
            state,
            lead_samples: frame_samples * PLAYBACK_LEAD_FRAMES,
            frame_period: Duration::from_millis(u64::from(config.frame_size_ms.max(1))),
        }))
    }
}

struct CpalPlaybackStream {
    stream: cpal::Stream,
    state: Arc<Mutex<OutputState>>,
    lead_samples: usize,
    frame_period: Duration,
}

impl CpalPlaybackStream {
    fn queued(&self) -> Result<usize> {
        let st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(failure) = &st.failure {
            return Err(VoiceError::device(DeviceDirection::Output, failure.clone()));
        }
        Ok(st.queue.len())
    }
}

impl PlaybackStream for CpalPlaybackStream {
    fn write_frame(&mut self, samples: &[f32]) -> Result<()> {
        // Wait for the device to drain below the lead before queueing more.
        let deadline = Instant::now() + self.frame_period * (PLAYBACK_LEAD_FRAMES as u32 * 4);
        while self.queued()? > self.lead_samples {
            if Instant::now() >= deadline {
                return Err(VoiceError::device(
                    DeviceDirection::Output,
                    "output device stopped consuming audio",
                ));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        st.queue.extend(samples.iter().copied());
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        let deadline = Instant::now() + self.frame_period * (PLAYBACK_LEAD_FRAMES as u32 * 4);
        while self.queued()? > 0 && Instant::now() < deadline {
            std::thread::sleep(POLL_INTERVAL);
        }
        if let Err(e) = self.stream.pause() {
            debug!("output stream pause failed: {e}");
        }
        Ok(())
    }
}

/// Names of available input devices.
///
/// # Errors
///
/// Returns an error if devices cannot be enumerated.
pub fn list_input_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host.input_devices().map_err(|e| {
        VoiceError::device(
            DeviceDirection::Input,
            format!("cannot enumerate devices: {e}"),
        )
    })?;
    Ok(devices
        .filter_map(|d| d.description().ok().map(|desc| desc.name().to_owned()))
        .collect())
}

/// Names of available output devices.
///
/// # Errors
///
/// Returns an error if devices cannot be enumerated.
pub fn list_output_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host.output_devices().map_err(|e| {
        VoiceError::device(
            DeviceDirection::Output,
            format!("cannot enumerate devices: {e}"),
        )
    })?;
    Ok(devices
        .filter_map(|d| d.description().ok().map(|desc| desc.name().to_owned()))
        .collect())
}

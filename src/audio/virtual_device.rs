//! In-memory capture and playback devices.
//!
//! Used by tests and by headless runs: a [`VirtualMic`] pushes samples into
//! an open capture stream from any thread, and a [`PlaybackRecorder`]
//! inspects what the pipeline rendered.

use crate::audio::capture::CaptureSink;
use crate::audio::device::{
    CaptureDevice, CaptureStream, DeviceConfig, PlaybackDevice, PlaybackStream,
};
use crate::error::{DeviceDirection, Result, VoiceError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

type SinkSlot = Arc<Mutex<Option<CaptureSink>>>;

/// Capture device fed by hand through [`VirtualMic`].
#[derive(Clone, Default)]
pub struct VirtualCaptureDevice {
    slot: SinkSlot,
    open_error: Option<String>,
    opened: Arc<Mutex<Vec<DeviceConfig>>>,
}

impl VirtualCaptureDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// A device whose `open` always fails with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            open_error: Some(message.into()),
            ..Self::default()
        }
    }

    /// Handle for injecting audio.
    pub fn mic(&self) -> VirtualMic {
        VirtualMic {
            slot: Arc::clone(&self.slot),
        }
    }

    /// Configs passed to every successful `open`.
    pub fn open_history(&self) -> Vec<DeviceConfig> {
        lock(&self.opened).clone()
    }
}

impl CaptureDevice for VirtualCaptureDevice {
    fn open(&self, config: &DeviceConfig, sink: CaptureSink) -> Result<Box<dyn CaptureStream>> {
        if let Some(message) = &self.open_error {
            return Err(VoiceError::device(DeviceDirection::Input, message.clone()));
        }
        lock(&self.opened).push(config.clone());
        *lock(&self.slot) = Some(sink);
        Ok(Box::new(VirtualCaptureStream {
            slot: Arc::clone(&self.slot),
        }))
    }
}

struct VirtualCaptureStream {
    slot: SinkSlot,
}

impl CaptureStream for VirtualCaptureStream {
    fn close(self: Box<Self>) -> Result<()> {
        lock(&self.slot).take();
        Ok(())
    }
}

/// Pushes samples into the open virtual capture stream.
#[derive(Clone)]
pub struct VirtualMic {
    slot: SinkSlot,
}

impl VirtualMic {
    /// Deliver samples as a device callback would.
    ///
    /// Returns false if no stream is open.
    pub fn push(&self, samples: &[f32]) -> bool {
        match lock(&self.slot).as_mut() {
            Some(sink) => {
                sink.push(samples);
                true
            }
            None => false,
        }
    }

    /// Deliver `count` frames filled with `amplitude`.
    pub fn push_frames(&self, count: usize, amplitude: f32) -> bool {
        let mut guard = lock(&self.slot);
        let Some(sink) = guard.as_mut() else {
            return false;
        };
        let frame = vec![amplitude; sink.frame_samples()];
        for _ in 0..count {
            sink.push(&frame);
        }
        true
    }

    /// Simulate a callback timing gap of `frames` frames.
    pub fn report_gap(&self, frames: u64) -> bool {
        match lock(&self.slot).as_mut() {
            Some(sink) => {
                sink.report_gap(frames);
                true
            }
            None => false,
        }
    }

    /// Simulate the device disappearing.
    pub fn lose_device(&self, message: &str) -> bool {
        match lock(&self.slot).as_ref() {
            Some(sink) => {
                sink.signals().device_lost(message);
                true
            }
            None => false,
        }
    }

    pub fn is_open(&self) -> bool {
        lock(&self.slot).is_some()
    }
}

#[derive(Default)]
struct PlaybackLog {
    frames: Vec<Vec<f32>>,
    opens: usize,
    closes: usize,
}

/// Playback device that records every frame written to it.
#[derive(Clone, Default)]
pub struct VirtualPlaybackDevice {
    log: Arc<Mutex<PlaybackLog>>,
    open_error: Option<String>,
    fail_after_frames: Option<usize>,
    frame_delay: Option<Duration>,
}

impl VirtualPlaybackDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// A device whose `open` always fails with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            open_error: Some(message.into()),
            ..Self::default()
        }
    }

    /// Fail every write once `frames` frames have been accepted in total.
    pub fn fail_after(mut self, frames: usize) -> Self {
        self.fail_after_frames = Some(frames);
        self
    }

    /// Sleep this long per written frame to mimic device pacing.
    pub fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = Some(delay);
        self
    }

    pub fn recorder(&self) -> PlaybackRecorder {
        PlaybackRecorder {
            log: Arc::clone(&self.log),
        }
    }
}

impl PlaybackDevice for VirtualPlaybackDevice {
    fn open(&self, _config: &DeviceConfig) -> Result<Box<dyn PlaybackStream>> {
        if let Some(message) = &self.open_error {
            return Err(VoiceError::device(DeviceDirection::Output, message.clone()));
        }
        lock(&self.log).opens += 1;
        Ok(Box::new(VirtualPlaybackStream {
            log: Arc::clone(&self.log),
            fail_after_frames: self.fail_after_frames,
            frame_delay: self.frame_delay,
        }))
    }
}

struct VirtualPlaybackStream {
    log: Arc<Mutex<PlaybackLog>>,
    fail_after_frames: Option<usize>,
    frame_delay: Option<Duration>,
}

impl PlaybackStream for VirtualPlaybackStream {
    fn write_frame(&mut self, samples: &[f32]) -> Result<()> {
        {
            let mut log = lock(&self.log);
            if self
                .fail_after_frames
                .is_some_and(|limit| log.frames.len() >= limit)
            {
                return Err(VoiceError::device(
                    DeviceDirection::Output,
                    "virtual playback device failed",
                ));
            }
            log.frames.push(samples.to_vec());
        }
        if let Some(delay) = self.frame_delay {
            std::thread::sleep(delay);
        }
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        lock(&self.log).closes += 1;
        Ok(())
    }
}

/// Read access to what a [`VirtualPlaybackDevice`] rendered.
#[derive(Clone)]
pub struct PlaybackRecorder {
    log: Arc<Mutex<PlaybackLog>>,
}

impl PlaybackRecorder {
    pub fn frames(&self) -> Vec<Vec<f32>> {
        lock(&self.log).frames.clone()
    }

    pub fn frame_count(&self) -> usize {
        lock(&self.log).frames.len()
    }

    /// All rendered samples in order.
    pub fn samples(&self) -> Vec<f32> {
        lock(&self.log).frames.concat()
    }

    pub fn open_count(&self) -> usize {
        lock(&self.log).opens
    }

    pub fn close_count(&self) -> usize {
        lock(&self.log).closes
    }
}

//! Device boundary between the pipeline and audio hardware.
//!
//! Streams returned by `open` may be `!Send` (cpal streams are on some
//! hosts), so capture and playback open their device on the thread that
//! will own the stream.

use crate::audio::capture::CaptureSink;
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Format negotiated with a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
    pub frame_size_ms: u32,
    /// Device name to open; `None` selects the system default.
    pub device_name: Option<String>,
}

impl DeviceConfig {
    /// Interleaved samples per frame.
    pub fn frame_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_size_ms as usize / 1000) * self.channels as usize
    }
}

/// Source of captured audio.
pub trait CaptureDevice: Send + Sync {
    /// Open the device and start delivering samples into `sink`.
    ///
    /// Samples handed to the sink must already be at `config.sample_rate`
    /// with `config.channels` interleaved channels.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::VoiceError::DeviceUnavailable`] if the device
    /// cannot be opened.
    fn open(&self, config: &DeviceConfig, sink: CaptureSink) -> Result<Box<dyn CaptureStream>>;
}

/// A running capture stream.
pub trait CaptureStream {
    /// Stop delivery. No samples reach the sink after this returns.
    ///
    /// # Errors
    ///
    /// Returns an error if the device reports a failure while stopping.
    fn close(self: Box<Self>) -> Result<()>;
}

/// Sink for synthesized audio.
pub trait PlaybackDevice: Send + Sync {
    /// Open the device for mono output at `config.sample_rate`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::VoiceError::DeviceUnavailable`] if the device
    /// cannot be opened.
    fn open(&self, config: &DeviceConfig) -> Result<Box<dyn PlaybackStream>>;
}

/// A running playback stream.
pub trait PlaybackStream {
    /// Write one frame of mono samples, blocking at device pacing.
    ///
    /// # Errors
    ///
    /// Returns an error if the device failed or was lost.
    fn write_frame(&mut self, samples: &[f32]) -> Result<()>;

    /// Wait for buffered audio to play out, then release the device.
    ///
    /// # Errors
    ///
    /// Returns an error if the device reports a failure while stopping.
    fn close(self: Box<Self>) -> Result<()>;
}

//! Fixed-length audio frames and the utterances built from them.

use crate::audio::dsp;
use crate::error::{Result, VoiceError};
use std::sync::Arc;
use std::time::Duration;

/// One fixed-length block of captured audio.
///
/// Frames are immutable once produced; cloning shares the sample storage.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Arc<[f32]>,
    sample_rate: u32,
    channels: u16,
    /// Monotonic sequence number assigned at capture.
    sequence: u64,
    /// Offset of the first sample since capture started.
    timestamp: Duration,
}

impl AudioFrame {
    pub fn new(
        samples: impl Into<Arc<[f32]>>,
        sample_rate: u32,
        channels: u16,
        sequence: u64,
        timestamp: Duration,
    ) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
            channels,
            sequence,
            timestamp,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback duration of this frame.
    pub fn duration(&self) -> Duration {
        samples_to_duration(self.samples.len(), self.sample_rate, self.channels)
    }

    /// RMS energy of the frame.
    pub fn rms(&self) -> f32 {
        dsp::rms(&self.samples)
    }

    /// Signed 16-bit PCM copy of the samples.
    pub fn to_pcm16(&self) -> Vec<i16> {
        self.samples.iter().copied().map(dsp::f32_to_i16).collect()
    }
}

/// Duration covered by `len` interleaved samples.
pub fn samples_to_duration(len: usize, sample_rate: u32, channels: u16) -> Duration {
    let per_second = u64::from(sample_rate) * u64::from(channels.max(1));
    if per_second == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(len as u64 * 1_000_000_000 / per_second)
}

/// Why the VAD closed an utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtteranceEnd {
    /// Trailing silence met the release hangover.
    Silence,
    /// The maximum utterance duration was reached.
    MaxDuration,
}

/// A span of speech delimited by VAD boundaries.
///
/// Owned by the detector until emitted; moved by value into the exchange
/// client afterwards.
#[derive(Debug, Clone)]
pub struct Utterance {
    frames: Vec<AudioFrame>,
    end: UtteranceEnd,
}

impl Utterance {
    pub fn new(frames: Vec<AudioFrame>, end: UtteranceEnd) -> Self {
        Self { frames, end }
    }

    pub fn frames(&self) -> &[AudioFrame] {
        &self.frames
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn end(&self) -> UtteranceEnd {
        self.end
    }

    pub fn sample_rate(&self) -> u32 {
        self.frames.first().map_or(0, AudioFrame::sample_rate)
    }

    pub fn channels(&self) -> u16 {
        self.frames.first().map_or(1, AudioFrame::channels)
    }

    /// Capture offset of the first frame.
    pub fn started_at(&self) -> Duration {
        self.frames.first().map_or(Duration::ZERO, AudioFrame::timestamp)
    }

    pub fn duration(&self) -> Duration {
        self.frames.iter().map(AudioFrame::duration).sum()
    }

    /// All samples concatenated in capture order.
    pub fn samples(&self) -> Vec<f32> {
        let total = self.frames.iter().map(AudioFrame::len).sum();
        let mut out = Vec::with_capacity(total);
        for frame in &self.frames {
            out.extend_from_slice(frame.samples());
        }
        out
    }

    /// Encode as a 16-bit PCM WAV file.
    ///
    /// # Errors
    ///
    /// Returns an error if the utterance is empty or WAV encoding fails.
    pub fn to_wav(&self) -> Result<Vec<u8>> {
        if self.frames.is_empty() {
            return Err(VoiceError::Audio("cannot encode an empty utterance".into()));
        }
        crate::audio::wav::encode_pcm16(&self.samples(), self.sample_rate(), self.channels())
    }
}

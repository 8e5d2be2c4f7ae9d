//! Voice activity detection using energy-based analysis.
//!
//! Frame RMS is compared against two thresholds: `threshold` to enter speech
//! and `floor` to count a frame as silent once speaking. Both transitions
//! need a run of consecutive frames (the hangovers) before they are taken.

use crate::audio::frame::{AudioFrame, Utterance, UtteranceEnd};
use crate::config::VadConfig;
use tracing::{debug, info};

/// Detector tuning expressed in frames.
#[derive(Debug, Clone, PartialEq)]
pub struct VadParams {
    pub threshold: f32,
    pub floor: f32,
    pub hangover_on_frames: usize,
    pub hangover_off_frames: usize,
    pub max_utterance_frames: usize,
    pub min_utterance_frames: usize,
}

impl VadParams {
    /// Convert millisecond settings using the capture frame length.
    ///
    /// Hangovers and the minimum round up to whole frames; the maximum
    /// rounds down. Every count is at least one frame.
    pub fn from_config(config: &VadConfig, frame_ms: u32) -> Self {
        let frame_ms = frame_ms.max(1);
        let ceil = |ms: u32| (ms.div_ceil(frame_ms) as usize).max(1);
        Self {
            threshold: config.threshold,
            floor: config.floor.min(config.threshold),
            hangover_on_frames: ceil(config.hangover_on_ms),
            hangover_off_frames: ceil(config.hangover_off_ms),
            max_utterance_frames: ((config.max_utterance_ms / frame_ms) as usize).max(1),
            min_utterance_frames: config.min_utterance_ms.div_ceil(frame_ms) as usize,
        }
    }
}

/// Detector state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    Silence,
    Speaking,
}

/// Output of [`VoiceActivityDetector::process_frame`].
#[derive(Debug, Clone)]
pub enum VadEvent {
    /// The attack hangover was met; an utterance is in progress.
    SpeechStarted,
    /// A complete utterance, trailing silence removed.
    UtteranceReady(Utterance),
    /// An utterance shorter than the minimum was dropped.
    UtteranceDiscarded { frames: usize },
}

/// Energy VAD with hysteresis and independent attack/release hangovers.
pub struct VoiceActivityDetector {
    params: VadParams,
    state: VadState,
    /// Loud frames seen while silent, not yet enough to start.
    onset: Vec<AudioFrame>,
    /// Frames of the utterance in progress.
    current: Vec<AudioFrame>,
    /// Consecutive frames below `floor` at the end of `current`.
    quiet_run: usize,
    emitted: u64,
    discarded: u64,
}

impl VoiceActivityDetector {
    pub fn new(params: VadParams) -> Self {
        info!(
            threshold = params.threshold,
            floor = params.floor,
            on_frames = params.hangover_on_frames,
            off_frames = params.hangover_off_frames,
            max_frames = params.max_utterance_frames,
            min_frames = params.min_utterance_frames,
            "VAD initialized"
        );
        Self {
            params,
            state: VadState::Silence,
            onset: Vec::new(),
            current: Vec::new(),
            quiet_run: 0,
            emitted: 0,
            discarded: 0,
        }
    }

    pub fn from_config(config: &VadConfig, frame_ms: u32) -> Self {
        Self::new(VadParams::from_config(config, frame_ms))
    }

    pub fn state(&self) -> VadState {
        self.state
    }

    pub fn params(&self) -> &VadParams {
        &self.params
    }

    /// Frames buffered for the utterance in progress.
    pub fn buffered_frames(&self) -> usize {
        self.current.len()
    }

    /// Utterances emitted since creation.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Utterances discarded as too short since creation.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Feed one frame.
    pub fn process_frame(&mut self, frame: AudioFrame) -> Option<VadEvent> {
        let energy = frame.rms();
        match self.state {
            VadState::Silence => {
                if energy > self.params.threshold {
                    self.onset.push(frame);
                    if self.onset.len() >= self.params.hangover_on_frames {
                        self.state = VadState::Speaking;
                        self.current = std::mem::take(&mut self.onset);
                        self.quiet_run = 0;
                        debug!(frames = self.current.len(), "speech started");
                        return Some(VadEvent::SpeechStarted);
                    }
                } else {
                    self.onset.clear();
                }
                None
            }
            VadState::Speaking => {
                self.current.push(frame);
                if energy < self.params.floor {
                    self.quiet_run += 1;
                } else {
                    self.quiet_run = 0;
                }

                if self.quiet_run >= self.params.hangover_off_frames {
                    let keep = self.current.len() - self.quiet_run;
                    self.current.truncate(keep);
                    self.state = VadState::Silence;
                    self.quiet_run = 0;
                    return Some(self.finish(UtteranceEnd::Silence));
                }
                if self.current.len() >= self.params.max_utterance_frames {
                    // Stay in Speaking; the next frame opens a fresh utterance.
                    self.quiet_run = 0;
                    return Some(self.finish(UtteranceEnd::MaxDuration));
                }
                None
            }
        }
    }

    fn finish(&mut self, end: UtteranceEnd) -> VadEvent {
        let frames = std::mem::take(&mut self.current);
        if frames.len() < self.params.min_utterance_frames || frames.is_empty() {
            self.discarded += 1;
            debug!(frames = frames.len(), "utterance too short, discarded");
            return VadEvent::UtteranceDiscarded {
                frames: frames.len(),
            };
        }
        self.emitted += 1;
        debug!(frames = frames.len(), ?end, "utterance ready");
        VadEvent::UtteranceReady(Utterance::new(frames, end))
    }

    /// Drop all buffered audio and return to silence.
    pub fn reset(&mut self) {
        self.state = VadState::Silence;
        self.onset.clear();
        self.current.clear();
        self.quiet_run = 0;
    }
}

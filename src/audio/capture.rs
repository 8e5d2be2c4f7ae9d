//! Capture source: device samples into fixed-length frames in the ring.
//!
//! The device runs on a dedicated thread. Everything reachable from the
//! device callback ([`CaptureSink`]) is non-blocking: ring writes take a
//! short mutex section, events go out through `try_send`, and dropped frames
//! are counted instead of retried.

use crate::audio::device::{CaptureDevice, DeviceConfig};
use crate::audio::frame::{AudioFrame, samples_to_duration};
use crate::audio::ring_buffer::RingProducer;
use crate::error::{DeviceDirection, Result, VoiceError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Minimum spacing between drop warnings.
const DROP_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Notifications from the capture thread to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// Frames were lost since the previous report.
    Underrun { dropped_frames: u64 },
    /// The device failed while running.
    DeviceLost { message: String },
}

/// Running totals, shared between the capture thread and its owner.
#[derive(Debug, Default)]
pub struct CaptureStats {
    frames_written: AtomicU64,
    frames_rejected: AtomicU64,
    frames_missed: AtomicU64,
    samples_overwritten: AtomicU64,
}

/// Point-in-time copy of [`CaptureStats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CaptureStatsSnapshot {
    /// Frames written into the ring.
    pub frames_written: u64,
    /// Frames the ring refused (reject overflow policy).
    pub frames_rejected: u64,
    /// Frames the device never delivered (callback timing gaps).
    pub frames_missed: u64,
    /// Unread samples replaced under the overwrite policy.
    pub samples_overwritten: u64,
}

impl CaptureStats {
    pub fn snapshot(&self) -> CaptureStatsSnapshot {
        CaptureStatsSnapshot {
            frames_written: self.frames_written.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            frames_missed: self.frames_missed.load(Ordering::Relaxed),
            samples_overwritten: self.samples_overwritten.load(Ordering::Relaxed),
        }
    }
}

/// Cloneable side channel for device error callbacks.
#[derive(Clone)]
pub struct CaptureSignals {
    events: mpsc::Sender<CaptureEvent>,
    stopped: Arc<AtomicBool>,
}

impl CaptureSignals {
    /// Report that the device stopped working.
    pub fn device_lost(&self, message: impl Into<String>) {
        let message = message.into();
        if self.stopped.load(Ordering::Acquire) {
            debug!(%message, "capture device error after stop");
            return;
        }
        warn!(%message, "capture device lost");
        if self
            .events
            .try_send(CaptureEvent::DeviceLost { message })
            .is_err()
        {
            debug!("capture event queue full, dropping device-lost event");
        }
    }
}

/// Receives samples from a device backend inside its callback.
///
/// Assembles incoming chunks into frames of exactly `frame_samples` and
/// writes each completed frame into the ring.
pub struct CaptureSink {
    producer: RingProducer,
    signals: CaptureSignals,
    stats: Arc<CaptureStats>,
    sample_rate: u32,
    channels: u16,
    frame_samples: usize,
    pending: Vec<f32>,
    sequence: u64,
    samples_seen: u64,
    unreported_drops: u64,
    last_drop_log: Option<Instant>,
}

impl CaptureSink {
    fn new(
        producer: RingProducer,
        config: &DeviceConfig,
        signals: CaptureSignals,
        stats: Arc<CaptureStats>,
    ) -> Self {
        let frame_samples = config.frame_samples().max(1);
        Self {
            producer,
            signals,
            stats,
            sample_rate: config.sample_rate,
            channels: config.channels,
            frame_samples,
            pending: Vec::with_capacity(frame_samples),
            sequence: 0,
            samples_seen: 0,
            unreported_drops: 0,
            last_drop_log: None,
        }
    }

    /// Handle for the device's error callback.
    pub fn signals(&self) -> CaptureSignals {
        self.signals.clone()
    }

    /// Samples per assembled frame.
    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    /// Accept interleaved samples at the configured format.
    pub fn push(&mut self, mut samples: &[f32]) {
        if self.signals.stopped.load(Ordering::Acquire) {
            return;
        }
        while !samples.is_empty() {
            let need = self.frame_samples - self.pending.len();
            let take = need.min(samples.len());
            self.pending.extend_from_slice(&samples[..take]);
            samples = &samples[take..];
            if self.pending.len() == self.frame_samples {
                self.flush_frame();
            }
        }
    }

    /// Record `frames` frames lost before reaching the sink.
    ///
    /// Any partially assembled frame is discarded so the next frame starts
    /// on fresh audio.
    pub fn report_gap(&mut self, frames: u64) {
        if frames == 0 {
            return;
        }
        self.pending.clear();
        self.samples_seen += frames * self.frame_samples as u64;
        self.sequence += frames;
        self.stats.frames_missed.fetch_add(frames, Ordering::Relaxed);
        self.note_drop(frames);
    }

    fn flush_frame(&mut self) {
        let timestamp = samples_to_duration(
            self.samples_seen as usize,
            self.sample_rate,
            self.channels,
        );
        let frame = AudioFrame::new(
            std::mem::take(&mut self.pending),
            self.sample_rate,
            self.channels,
            self.sequence,
            timestamp,
        );
        self.pending.reserve(self.frame_samples);
        self.sequence += 1;
        self.samples_seen += self.frame_samples as u64;

        match self.producer.write(&frame) {
            Ok(overwritten) => {
                self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
                if overwritten > 0 {
                    self.stats
                        .samples_overwritten
                        .fetch_add(overwritten as u64, Ordering::Relaxed);
                }
            }
            Err(VoiceError::Overflow { .. }) => {
                self.stats.frames_rejected.fetch_add(1, Ordering::Relaxed);
                self.note_drop(1);
            }
            Err(e) => {
                warn!(error = %e, "unexpected ring write failure");
                self.note_drop(1);
            }
        }
    }

    fn note_drop(&mut self, frames: u64) {
        self.unreported_drops += frames;
        let due = self
            .last_drop_log
            .is_none_or(|at| at.elapsed() >= DROP_LOG_INTERVAL);
        if !due {
            return;
        }
        let dropped_frames = std::mem::take(&mut self.unreported_drops);
        self.last_drop_log = Some(Instant::now());
        warn!(dropped_frames, "capture underrun");
        if self
            .signals
            .events
            .try_send(CaptureEvent::Underrun { dropped_frames })
            .is_err()
        {
            debug!("capture event queue full, dropping underrun event");
        }
    }
}

struct CaptureWorker {
    stop_tx: std::sync::mpsc::Sender<()>,
    stopped: Arc<AtomicBool>,
    thread: JoinHandle<Result<()>>,
}

/// Owns a capture device and the thread that runs it.
pub struct CaptureSource {
    device: Arc<dyn CaptureDevice>,
    config: DeviceConfig,
    stats: Arc<CaptureStats>,
    worker: Option<CaptureWorker>,
}

impl CaptureSource {
    pub fn new(device: Arc<dyn CaptureDevice>, config: DeviceConfig) -> Self {
        Self {
            device,
            config,
            stats: Arc::new(CaptureStats::default()),
            worker: None,
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    pub fn stats(&self) -> CaptureStatsSnapshot {
        self.stats.snapshot()
    }

    /// Open the device on a capture thread, writing frames into `producer`.
    ///
    /// Returns once the device has opened (or failed to).
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::DeviceUnavailable`] if the device cannot be
    /// opened or the capture thread cannot be spawned.
    pub fn start(
        &mut self,
        producer: RingProducer,
        events: mpsc::Sender<CaptureEvent>,
    ) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        let stopped = Arc::new(AtomicBool::new(false));
        let signals = CaptureSignals {
            events,
            stopped: Arc::clone(&stopped),
        };
        let sink = CaptureSink::new(producer, &self.config, signals, Arc::clone(&self.stats));

        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<()>>(1);
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let device = Arc::clone(&self.device);
        let config = self.config.clone();

        let thread = std::thread::Builder::new()
            .name("concierge-capture".into())
            .spawn(move || -> Result<()> {
                let stream = match device.open(&config, sink) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return Ok(());
                    }
                };
                // Park until stop() or the owner is dropped.
                let _ = stop_rx.recv();
                stream.close()
            })
            .map_err(|e| {
                VoiceError::device(
                    DeviceDirection::Input,
                    format!("failed to spawn capture thread: {e}"),
                )
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(VoiceError::device(
                    DeviceDirection::Input,
                    "capture thread exited before opening the device",
                ));
            }
        }

        info!(
            sample_rate = self.config.sample_rate,
            channels = self.config.channels,
            frame_ms = self.config.frame_size_ms,
            "audio capture started"
        );
        self.worker = Some(CaptureWorker {
            stop_tx,
            stopped,
            thread,
        });
        Ok(())
    }

    /// Close the device and join the capture thread.
    ///
    /// No frames are written after this returns. Stopping a source that is
    /// not running is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the device failed while closing or the capture
    /// thread panicked.
    pub fn stop(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        worker.stopped.store(true, Ordering::Release);
        let _ = worker.stop_tx.send(());
        let result = worker.thread.join().map_err(|_| {
            VoiceError::device(DeviceDirection::Input, "capture thread panicked")
        })?;
        let stats = self.stats.snapshot();
        info!(
            frames_written = stats.frames_written,
            frames_rejected = stats.frames_rejected,
            frames_missed = stats.frames_missed,
            "audio capture stopped"
        );
        result
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "capture stop failed during drop");
        }
    }
}

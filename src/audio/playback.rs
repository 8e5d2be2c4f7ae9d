//! Playback sink: ordered response audio rendered on a dedicated thread.
//!
//! Segments enter a [`PlaybackQueue`] either directly ([`PlaybackSink::enqueue`])
//! or through a reserved slot that is filled later. The render thread only
//! plays the head slot, so a slot reserved earlier holds back everything
//! behind it until it is filled or abandoned.

use crate::audio::device::{DeviceConfig, PlaybackDevice};
use crate::audio::dsp;
use crate::error::{DeviceDirection, Result, VoiceError};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Decoded response audio ready for the device.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSegment {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioSegment {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }
}

/// Handle to a reserved queue slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlaybackTicket(u64);

/// Events from the render thread.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    /// Rendering began after the queue had been idle.
    Started,
    /// One segment played to completion.
    SegmentFinished,
    /// RMS level of the frame just written.
    Level { rms: f32 },
    /// The queue emptied after being non-empty.
    Drained,
    /// The device failed; the queue was cleared. `Drained` follows.
    Failed { message: String },
}

#[derive(Debug)]
enum Slot {
    Reserved,
    Filled(AudioSegment),
    Abandoned,
}

/// FIFO of reserved and filled segments.
#[derive(Debug, Default)]
pub struct PlaybackQueue {
    slots: VecDeque<(u64, Slot)>,
    next_ticket: u64,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the next position in playback order.
    pub fn reserve(&mut self) -> PlaybackTicket {
        let id = self.next_ticket;
        self.next_ticket += 1;
        self.slots.push_back((id, Slot::Reserved));
        PlaybackTicket(id)
    }

    /// Supply audio for a reserved slot.
    ///
    /// Returns false if the ticket is unknown (filled already, abandoned, or
    /// cleared by a flush).
    pub fn fill(&mut self, ticket: PlaybackTicket, segment: AudioSegment) -> bool {
        match self.slot_mut(ticket) {
            Some(slot @ Slot::Reserved) => {
                *slot = Slot::Filled(segment);
                true
            }
            _ => false,
        }
    }

    /// Give up a reserved slot so later slots can play.
    pub fn abandon(&mut self, ticket: PlaybackTicket) -> bool {
        match self.slot_mut(ticket) {
            Some(slot @ Slot::Reserved) => {
                *slot = Slot::Abandoned;
                true
            }
            _ => false,
        }
    }

    /// Append a segment behind every existing slot.
    pub fn enqueue(&mut self, segment: AudioSegment) -> PlaybackTicket {
        let ticket = self.reserve();
        self.fill(ticket, segment);
        ticket
    }

    /// Pop the head segment if it is ready to play.
    pub fn pop_ready(&mut self) -> Option<AudioSegment> {
        while matches!(self.slots.front(), Some((_, Slot::Abandoned))) {
            self.slots.pop_front();
        }
        if matches!(self.slots.front(), Some((_, Slot::Filled(_)))) {
            if let Some((_, Slot::Filled(segment))) = self.slots.pop_front() {
                return Some(segment);
            }
        }
        None
    }

    /// Slots not yet played, including reserved and abandoned ones.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drop every slot. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let n = self.slots.len();
        self.slots.clear();
        n
    }

    fn slot_mut(&mut self, ticket: PlaybackTicket) -> Option<&mut Slot> {
        self.slots
            .iter_mut()
            .find(|(id, _)| *id == ticket.0)
            .map(|(_, slot)| slot)
    }
}

struct SinkState {
    queue: PlaybackQueue,
    /// Bumped by flush so the render thread abandons its current segment.
    generation: u64,
    /// True between `Started` and `Drained`.
    active: bool,
    shutdown: bool,
}

struct Shared {
    state: Mutex<SinkState>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Output side of the pipeline.
pub struct PlaybackSink {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl PlaybackSink {
    /// Open `device` on a render thread.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::DeviceUnavailable`] if the device cannot be
    /// opened.
    pub fn open(
        device: Arc<dyn PlaybackDevice>,
        config: DeviceConfig,
        events: mpsc::UnboundedSender<PlaybackEvent>,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(SinkState {
                queue: PlaybackQueue::new(),
                generation: 0,
                active: false,
                shutdown: false,
            }),
            wake: Condvar::new(),
        });

        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<()>>(1);
        let render_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("concierge-playback".into())
            .spawn(move || -> Result<()> {
                let stream = match device.open(&config) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return Ok(());
                    }
                };
                let mut renderer = Renderer {
                    shared: render_shared,
                    stream,
                    events,
                    device_rate: config.sample_rate,
                    frame_samples: (config.frame_samples() / config.channels.max(1) as usize)
                        .max(1),
                };
                renderer.run();
                renderer.stream.close()
            })
            .map_err(|e| {
                VoiceError::device(
                    DeviceDirection::Output,
                    format!("failed to spawn playback thread: {e}"),
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
                    DeviceDirection::Output,
                    "playback thread exited before opening the device",
                ));
            }
        }
        info!("audio playback opened");

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    fn with_queue<T>(&self, f: impl FnOnce(&mut PlaybackQueue) -> T) -> T {
        let out = {
            let mut st = self.shared.lock();
            f(&mut st.queue)
        };
        self.shared.wake.notify_all();
        out
    }

    pub fn enqueue(&self, segment: AudioSegment) -> PlaybackTicket {
        self.with_queue(|q| q.enqueue(segment))
    }

    pub fn reserve(&self) -> PlaybackTicket {
        self.with_queue(PlaybackQueue::reserve)
    }

    pub fn fill(&self, ticket: PlaybackTicket, segment: AudioSegment) -> bool {
        self.with_queue(|q| q.fill(ticket, segment))
    }

    pub fn abandon(&self, ticket: PlaybackTicket) -> bool {
        self.with_queue(|q| q.abandon(ticket))
    }

    /// Queued slots not yet started.
    pub fn pending(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// True while audio is rendering or waiting on a reserved slot.
    pub fn is_active(&self) -> bool {
        self.shared.lock().active
    }

    /// Drop queued and in-progress audio without emitting `Drained`.
    pub fn flush(&self) {
        let dropped = {
            let mut st = self.shared.lock();
            st.generation += 1;
            st.active = false;
            st.queue.clear()
        };
        self.shared.wake.notify_all();
        debug!(dropped, "playback flushed");
    }

    /// Stop rendering, close the device and join the render thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the device failed while closing or the render
    /// thread panicked.
    pub fn close(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        {
            let mut st = self.shared.lock();
            st.shutdown = true;
            st.generation += 1;
            st.queue.clear();
        }
        self.shared.wake.notify_all();
        let result = thread.join().map_err(|_| {
            VoiceError::device(DeviceDirection::Output, "playback thread panicked")
        })?;
        info!("audio playback closed");
        result
    }
}

impl Drop for PlaybackSink {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "playback close failed during drop");
        }
    }
}

struct Renderer {
    shared: Arc<Shared>,
    stream: Box<dyn crate::audio::device::PlaybackStream>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    device_rate: u32,
    frame_samples: usize,
}

impl Renderer {
    fn emit(&self, event: PlaybackEvent) {
        // The receiver only goes away during shutdown.
        let _ = self.events.send(event);
    }

    fn run(&mut self) {
        while let Some((segment, generation)) = self.next_segment() {
            self.play(segment, generation);
        }
    }

    /// Block until the head slot is ready or shutdown is requested.
    fn next_segment(&self) -> Option<(AudioSegment, u64)> {
        let mut st = self.shared.lock();
        loop {
            if st.shutdown {
                return None;
            }
            if let Some(segment) = st.queue.pop_ready() {
                if !st.active {
                    st.active = true;
                    self.emit(PlaybackEvent::Started);
                }
                return Some((segment, st.generation));
            }
            if st.active && st.queue.is_empty() {
                st.active = false;
                self.emit(PlaybackEvent::Drained);
            }
            st = self
                .shared
                .wake
                .wait(st)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn play(&mut self, segment: AudioSegment, generation: u64) {
        let samples = if segment.sample_rate == self.device_rate {
            segment.samples
        } else {
            dsp::resample_linear(&segment.samples, segment.sample_rate, self.device_rate)
        };

        for chunk in samples.chunks(self.frame_samples) {
            if self.shared.lock().generation != generation {
                debug!("segment interrupted by flush");
                return;
            }
            if let Err(e) = self.stream.write_frame(chunk) {
                error!(error = %e, "playback write failed");
                let dropped = {
                    let mut st = self.shared.lock();
                    st.active = false;
                    st.generation += 1;
                    st.queue.clear()
                };
                if dropped > 0 {
                    warn!(dropped, "discarding queued playback after device failure");
                }
                self.emit(PlaybackEvent::Failed {
                    message: e.to_string(),
                });
                self.emit(PlaybackEvent::Drained);
                return;
            }
            self.emit(PlaybackEvent::Level {
                rms: dsp::rms(chunk),
            });
        }
        self.emit(PlaybackEvent::SegmentFinished);
    }
}

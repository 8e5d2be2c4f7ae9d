//! Fixed-capacity single-producer/single-consumer sample ring.
//!
//! The capture thread owns the [`RingProducer`] and the coordinator owns the
//! [`RingConsumer`]. Both sides take a short mutex section per call; the
//! producer never waits for the consumer and wakes it through a
//! [`tokio::sync::Notify`] permit.
//!
//! Cursors are monotonic `u64` sample counts. The physical index is
//! `cursor % capacity`, and `read <= write <= read + capacity` always holds.
//!
//! Frames written with [`RingProducer::write`] keep their capture sequence
//! and timestamp: the ring records one mark per frame start and
//! [`RingConsumer::read_frame`] hands it back when a read begins there.

use crate::audio::frame::{AudioFrame, samples_to_duration};
use crate::error::{Result, VoiceError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

/// What a write does when the ring lacks space for the whole frame.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Fail with [`VoiceError::Overflow`] and write nothing.
    #[default]
    Reject,
    /// Write everything, discarding the oldest unread samples.
    OverwriteOldest,
}

/// Counter snapshot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RingStats {
    pub written_samples: u64,
    pub read_samples: u64,
    pub overwritten_samples: u64,
    pub rejected_writes: u64,
}

/// Capture metadata of a frame starting at `cursor`.
#[derive(Debug, Clone, Copy)]
struct FrameMark {
    cursor: u64,
    sequence: u64,
    timestamp: Duration,
}

struct Inner {
    buf: Vec<f32>,
    write: u64,
    read: u64,
    marks: VecDeque<FrameMark>,
    stats: RingStats,
}

impl Inner {
    fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn available(&self) -> usize {
        (self.write - self.read) as usize
    }

    fn free(&self) -> usize {
        self.capacity() - self.available()
    }

    fn push(&mut self, samples: &[f32]) {
        let cap = self.capacity();
        for &s in samples {
            let idx = (self.write % cap as u64) as usize;
            self.buf[idx] = s;
            self.write += 1;
        }
    }

    fn pop_into(&mut self, out: &mut Vec<f32>, n: usize) {
        let cap = self.capacity() as u64;
        for _ in 0..n {
            out.push(self.buf[(self.read % cap) as usize]);
            self.read += 1;
        }
        self.stats.read_samples += n as u64;
    }

    /// Forget marks of frames that start before the read cursor.
    fn prune_marks(&mut self) {
        while self.marks.front().is_some_and(|m| m.cursor < self.read) {
            self.marks.pop_front();
        }
    }

    /// Take the mark of the frame starting exactly at `cursor`, if any.
    fn take_mark(&mut self, cursor: u64) -> Option<FrameMark> {
        while self.marks.front().is_some_and(|m| m.cursor < cursor) {
            self.marks.pop_front();
        }
        if self.marks.front().is_some_and(|m| m.cursor == cursor) {
            self.marks.pop_front()
        } else {
            None
        }
    }
}

struct Shared {
    inner: Mutex<Inner>,
    notify: Notify,
    policy: OverflowPolicy,
    sample_rate: u32,
    channels: u16,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave the cursors inconsistent
        // (each mutation is a single increment), so keep going with the data.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Capture ring buffer, split into its two endpoints before use.
pub struct AudioRingBuffer {
    shared: Arc<Shared>,
}

impl AudioRingBuffer {
    /// Create a ring holding `capacity` samples of `sample_rate`/`channels` audio.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Config`] if `capacity` is zero.
    pub fn new(
        capacity: usize,
        policy: OverflowPolicy,
        sample_rate: u32,
        channels: u16,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(VoiceError::Config(
                "ring buffer capacity must be non-zero".into(),
            ));
        }
        Ok(Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    buf: vec![0.0; capacity],
                    write: 0,
                    read: 0,
                    marks: VecDeque::new(),
                    stats: RingStats::default(),
                }),
                notify: Notify::new(),
                policy,
                sample_rate,
                channels,
            }),
        })
    }

    /// Split into the producer and consumer endpoints.
    pub fn split(self) -> (RingProducer, RingConsumer) {
        (
            RingProducer {
                shared: Arc::clone(&self.shared),
            },
            RingConsumer {
                shared: self.shared,
                next_sequence: 0,
            },
        )
    }
}

/// Write endpoint. Not cloneable.
pub struct RingProducer {
    shared: Arc<Shared>,
}

impl RingProducer {
    /// Append a frame's samples, keeping its sequence and timestamp.
    ///
    /// Returns the number of unread samples overwritten (always 0 under
    /// [`OverflowPolicy::Reject`]).
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Overflow`] under the reject policy when the
    /// frame does not fit; nothing is written in that case.
    pub fn write(&self, frame: &AudioFrame) -> Result<usize> {
        self.append(frame.samples(), Some((frame.sequence(), frame.timestamp())))
    }

    /// Append raw samples. See [`RingProducer::write`].
    ///
    /// Frames read back from raw samples are numbered and timed by their
    /// read position.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Overflow`] under the reject policy when the
    /// samples do not fit.
    pub fn write_samples(&self, samples: &[f32]) -> Result<usize> {
        self.append(samples, None)
    }

    fn append(&self, samples: &[f32], mark: Option<(u64, Duration)>) -> Result<usize> {
        if samples.is_empty() {
            return Ok(0);
        }
        let overwritten = {
            let mut inner = self.shared.lock();
            let start = inner.write;
            let whole = samples.len() <= inner.capacity();
            let free = inner.free();
            let overwritten = match self.shared.policy {
                OverflowPolicy::Reject => {
                    if samples.len() > free {
                        inner.stats.rejected_writes += 1;
                        return Err(VoiceError::Overflow {
                            requested: samples.len(),
                            free,
                        });
                    }
                    inner.push(samples);
                    0
                }
                OverflowPolicy::OverwriteOldest => {
                    let cap = inner.capacity();
                    // Only the newest `cap` samples can survive the write.
                    let tail = &samples[samples.len().saturating_sub(cap)..];
                    let skipped = samples.len() - tail.len();
                    let dropped_unread = tail.len().saturating_sub(inner.free());
                    inner.push(tail);
                    let min_read = inner.write - cap as u64;
                    if inner.read < min_read {
                        inner.read = min_read;
                    }
                    let overwritten = dropped_unread + skipped;
                    inner.stats.overwritten_samples += overwritten as u64;
                    inner.prune_marks();
                    overwritten
                }
            };
            // A frame cut down to the ring's tail no longer starts at `start`.
            if let Some((sequence, timestamp)) = mark {
                if whole {
                    inner.marks.push_back(FrameMark {
                        cursor: start,
                        sequence,
                        timestamp,
                    });
                }
            }
            inner.stats.written_samples += samples.len() as u64;
            overwritten
        };
        self.shared.notify.notify_one();
        Ok(overwritten)
    }

    pub fn capacity(&self) -> usize {
        self.shared.lock().capacity()
    }

    pub fn stats(&self) -> RingStats {
        self.shared.lock().stats
    }
}

/// Read endpoint. Not cloneable.
pub struct RingConsumer {
    shared: Arc<Shared>,
    next_sequence: u64,
}

impl RingConsumer {
    /// Read up to `n` samples without blocking.
    pub fn read(&mut self, n: usize) -> Vec<f32> {
        let mut inner = self.shared.lock();
        let take = n.min(inner.available());
        let mut out = Vec::with_capacity(take);
        inner.pop_into(&mut out, take);
        inner.prune_marks();
        out
    }

    /// Read exactly `n` samples as a frame, or nothing if fewer are buffered.
    ///
    /// A read that starts on a frame written with [`RingProducer::write`]
    /// keeps that frame's capture sequence and timestamp, so rejected or
    /// overwritten frames show up as gaps. Otherwise the sequence continues
    /// from the last frame read and the timestamp is the read position.
    pub fn read_frame(&mut self, n: usize) -> Option<AudioFrame> {
        if n == 0 {
            return None;
        }
        let (samples, start, mark) = {
            let mut inner = self.shared.lock();
            if inner.available() < n {
                return None;
            }
            let start = inner.read;
            let mark = inner.take_mark(start);
            let mut out = Vec::with_capacity(n);
            inner.pop_into(&mut out, n);
            (out, start, mark)
        };
        let (sequence, timestamp) = match mark {
            Some(m) => (m.sequence, m.timestamp),
            None => (
                self.next_sequence,
                samples_to_duration(start as usize, self.shared.sample_rate, self.shared.channels),
            ),
        };
        self.next_sequence = sequence + 1;
        Some(AudioFrame::new(
            samples,
            self.shared.sample_rate,
            self.shared.channels,
            sequence,
            timestamp,
        ))
    }

    /// Wait until the producer has written since the last wakeup.
    ///
    /// Wakeups can be spurious; callers re-check with [`RingConsumer::read_frame`].
    pub async fn readable(&self) {
        self.shared.notify.notified().await;
    }

    pub fn available(&self) -> usize {
        self.shared.lock().available()
    }

    pub fn capacity(&self) -> usize {
        self.shared.lock().capacity()
    }

    /// Drop all unread samples.
    pub fn clear(&mut self) {
        let mut inner = self.shared.lock();
        inner.read = inner.write;
        inner.marks.clear();
    }

    pub fn stats(&self) -> RingStats {
        self.shared.lock().stats
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::time::Duration;

    fn ring(capacity: usize, policy: OverflowPolicy) -> (RingProducer, RingConsumer) {
        AudioRingBuffer::new(capacity, policy, 16_000, 1)
            .expect("ring")
            .split()
    }

    fn ramp(start: usize, len: usize) -> Vec<f32> {
        (start..start + len).map(|i| i as f32).collect()
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(AudioRingBuffer::new(0, OverflowPolicy::Reject, 16_000, 1).is_err());
    }

    #[test]
    fn reads_come_back_in_write_order() {
        let (tx, mut rx) = ring(8, OverflowPolicy::Reject);
        tx.write_samples(&ramp(0, 5)).unwrap();
        assert_eq!(rx.read(3), ramp(0, 3));
        tx.write_samples(&ramp(5, 5)).unwrap();
        assert_eq!(rx.available(), 7);
        assert_eq!(rx.read(100), ramp(3, 7));
        assert!(rx.read(1).is_empty());
    }

    #[test]
    fn reject_policy_writes_nothing_on_overflow() {
        let (tx, mut rx) = ring(8, OverflowPolicy::Reject);
        tx.write_samples(&ramp(0, 6)).unwrap();
        let err = tx.write_samples(&ramp(6, 4)).unwrap_err();
        assert!(matches!(
            err,
            VoiceError::Overflow {
                requested: 4,
                free: 2
            }
        ));
        assert_eq!(rx.available(), 6);
        assert_eq!(rx.read(8), ramp(0, 6));
        assert_eq!(tx.stats().rejected_writes, 1);
        assert_eq!(tx.stats().written_samples, 6);
    }

    #[test]
    fn overwrite_policy_keeps_newest_samples() {
        let (tx, mut rx) = ring(8, OverflowPolicy::OverwriteOldest);
        tx.write_samples(&ramp(0, 6)).unwrap();
        let overwritten = tx.write_samples(&ramp(6, 5)).unwrap();
        assert_eq!(overwritten, 3);
        assert_eq!(rx.available(), 8);
        assert_eq!(rx.read(8), ramp(3, 8));
        assert_eq!(rx.stats().overwritten_samples, 3);
    }

    #[test]
    fn overwrite_with_oversized_write_keeps_last_capacity_samples() {
        let (tx, mut rx) = ring(4, OverflowPolicy::OverwriteOldest);
        tx.write_samples(&ramp(0, 2)).unwrap();
        let overwritten = tx.write_samples(&ramp(2, 10)).unwrap();
        assert_eq!(overwritten, 8);
        assert_eq!(rx.read(4), ramp(8, 4));
    }

    #[test]
    fn read_frame_requires_full_frame() {
        let (tx, mut rx) = ring(1_000, OverflowPolicy::Reject);
        tx.write_samples(&[0.1; 300]).unwrap();
        assert!(rx.read_frame(320).is_none());
        assert_eq!(rx.available(), 300);
        tx.write_samples(&[0.1; 340]).unwrap();

        let first = rx.read_frame(320).expect("first frame");
        let second = rx.read_frame(320).expect("second frame");
        assert_eq!(first.sequence(), 0);
        assert_eq!(second.sequence(), 1);
        assert_eq!(first.timestamp(), Duration::ZERO);
        assert_eq!(second.timestamp(), Duration::from_millis(20));
        assert!(rx.read_frame(320).is_none());
    }

    fn frame(sequence: u64) -> AudioFrame {
        AudioFrame::new(
            vec![0.1; 320],
            16_000,
            1,
            sequence,
            Duration::from_millis(20 * sequence),
        )
    }

    #[test]
    fn captured_frames_keep_their_timestamps_across_rejects() {
        let (tx, mut rx) = ring(640, OverflowPolicy::Reject);
        tx.write(&frame(0)).unwrap();
        tx.write(&frame(1)).unwrap();
        assert!(tx.write(&frame(2)).is_err());

        assert_eq!(rx.read_frame(320).unwrap().sequence(), 0);
        tx.write(&frame(3)).unwrap();
        let second = rx.read_frame(320).unwrap();
        assert_eq!(second.sequence(), 1);
        assert_eq!(second.timestamp(), Duration::from_millis(20));

        // The rejected frame is a gap, not a shift.
        let after_gap = rx.read_frame(320).unwrap();
        assert_eq!(after_gap.sequence(), 3);
        assert_eq!(after_gap.timestamp(), Duration::from_millis(60));
    }

    #[test]
    fn overwritten_frames_leave_a_gap_in_sequence() {
        let (tx, mut rx) = ring(640, OverflowPolicy::OverwriteOldest);
        for sequence in 0..4 {
            tx.write(&frame(sequence)).unwrap();
        }
        let oldest = rx.read_frame(320).unwrap();
        assert_eq!(oldest.sequence(), 2);
        assert_eq!(oldest.timestamp(), Duration::from_millis(40));
        assert_eq!(rx.read_frame(320).unwrap().sequence(), 3);
    }

    #[test]
    fn clear_discards_unread() {
        let (tx, mut rx) = ring(16, OverflowPolicy::Reject);
        tx.write_samples(&ramp(0, 10)).unwrap();
        rx.clear();
        assert_eq!(rx.available(), 0);
        tx.write_samples(&ramp(10, 16)).unwrap();
        assert_eq!(rx.read(16), ramp(10, 16));
    }

    #[test]
    fn occupancy_never_exceeds_capacity() {
        for policy in [OverflowPolicy::Reject, OverflowPolicy::OverwriteOldest] {
            let mut rng = StdRng::seed_from_u64(7);
            let capacity = 97;
            let (tx, mut rx) = ring(capacity, policy);
            let mut next_value = 0usize;
            let mut expected_front = 0usize;

            for _ in 0..5_000 {
                if rng.gen_bool(0.55) {
                    let len = rng.gen_range(1..=40);
                    let before = rx.available();
                    match tx.write_samples(&ramp(next_value, len)) {
                        Ok(overwritten) => {
                            next_value += len;
                            expected_front += overwritten;
                        }
                        Err(VoiceError::Overflow { requested, free }) => {
                            assert_eq!(policy, OverflowPolicy::Reject);
                            assert_eq!(requested, len);
                            assert_eq!(free, capacity - before);
                            assert_eq!(rx.available(), before);
                        }
                        Err(other) => panic!("unexpected error {other}"),
                    }
                } else {
                    let n = rng.gen_range(0..=50);
                    let got = rx.read(n);
                    for (i, v) in got.iter().enumerate() {
                        assert_eq!(*v as usize, expected_front + i, "samples out of order");
                    }
                    expected_front += got.len();
                }
                assert!(rx.available() <= capacity);
                let stats = rx.stats();
                assert_eq!(
                    stats.written_samples,
                    stats.read_samples + stats.overwritten_samples + rx.available() as u64
                );
            }
        }
    }

    #[tokio::test]
    async fn writes_wake_the_consumer() {
        let (tx, mut rx) = ring(640, OverflowPolicy::Reject);
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            tx.write_samples(&[0.2; 320]).unwrap();
        });
        tokio::time::timeout(Duration::from_secs(2), rx.readable())
            .await
            .expect("woken");
        assert!(rx.read_frame(320).is_some());
        writer.join().unwrap();
    }
}

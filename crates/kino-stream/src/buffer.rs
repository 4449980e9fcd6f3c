//! Fragment ring buffer
//!
//! Each track owns a fixed number of fragment slots shared between exactly
//! one producer (the fetch loop) and one consumer (the inject loop):
//! - Producer blocks while every slot is occupied (backpressure)
//! - Consumer blocks while no slot is occupied
//! - A slot only becomes visible to the consumer after its write commit
//! - Slot payload allocations are reused across fills

use crate::{
    types::{MediaType, TrackType},
    Error, Result,
};
use bytes::BytesMut;
use chrono::{DateTime, Utc};
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard, Notify, RwLock, RwLockReadGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// One downloaded media unit stored in a ring slot
#[derive(Debug, Clone)]
pub struct Fragment {
    /// Fragment bytes, cleared and refilled on reuse
    pub payload: BytesMut,
    /// Track-relative start position in seconds
    pub position: f64,
    /// Duration in seconds
    pub duration: f64,
    pub is_init: bool,
    pub is_discontinuity: bool,
    /// Set once the discontinuity has been paired with the sibling track
    pub discontinuity_paired: bool,
    pub profile_index: usize,
    pub media_type: MediaType,
    /// Offset applied to timestamps on hand-off (seconds)
    pub pts_offset: f64,
    pub download_started: Option<Instant>,
    /// Source clock units per second for boxed formats (0 if unboxed)
    pub timescale: u32,
    pub sequence: u64,
    pub source_date_time: Option<DateTime<Utc>>,
}

impl Fragment {
    fn empty(media_type: MediaType) -> Self {
        Self {
            payload: BytesMut::new(),
            position: 0.0,
            duration: 0.0,
            is_init: false,
            is_discontinuity: false,
            discontinuity_paired: false,
            profile_index: 0,
            media_type,
            pts_offset: 0.0,
            download_started: None,
            timescale: 0,
            sequence: 0,
            source_date_time: None,
        }
    }

    /// Reset metadata and payload length while keeping the allocation
    pub fn clear(&mut self) {
        let media_type = self.media_type;
        let mut payload = std::mem::take(&mut self.payload);
        payload.clear();
        *self = Self {
            payload,
            ..Self::empty(media_type)
        };
    }
}

#[derive(Debug, Default)]
struct RingState {
    write_index: usize,
    read_index: usize,
    occupied: usize,
    end_of_stream: bool,
}

/// Fixed-capacity circular array of fragment slots
#[derive(Debug)]
pub struct FragmentBuffer {
    track: TrackType,
    slots: Vec<Mutex<Fragment>>,
    ring: Mutex<RingState>,
    /// Held shared by every in-flight acquire, exclusively by flush
    gate: RwLock<()>,
    fragment_committed: Notify,
    slot_freed: Notify,
}

impl FragmentBuffer {
    /// Create a ring with `capacity` slots
    pub fn new(track: TrackType, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let media_type = track.media_type(false);
        Self {
            track,
            slots: (0..capacity)
                .map(|_| Mutex::new(Fragment::empty(media_type)))
                .collect(),
            ring: Mutex::new(RingState::default()),
            gate: RwLock::new(()),
            fragment_committed: Notify::new(),
            slot_freed: Notify::new(),
        }
    }

    pub fn track(&self) -> TrackType {
        self.track
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of committed, not yet consumed fragments
    pub async fn occupied(&self) -> usize {
        self.ring.lock().await.occupied
    }

    /// Sum of the durations of committed, not yet consumed media fragments
    pub async fn cached_duration(&self) -> f64 {
        let ring = self.ring.lock().await;
        let mut total = 0.0;
        for offset in 0..ring.occupied {
            let index = (ring.read_index + offset) % self.slots.len();
            // Occupied slots are only locked by the consumer at read_index
            if let Ok(fragment) = self.slots[index].try_lock() {
                if !fragment.is_init {
                    total += fragment.duration;
                }
            }
        }
        total
    }

    /// Wait for a free slot and return exclusive access to it.
    ///
    /// Fails with [`Error::Aborted`] once `cancel` fires.
    pub async fn acquire_write_slot(&self, timeout: Duration, cancel: &CancellationToken) -> Result<WriteSlot<'_>> {
        let gate = self.gate.read().await;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.slot_freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if cancel.is_cancelled() {
                return Err(Error::Aborted);
            }

            let index = {
                let ring = self.ring.lock().await;
                (ring.occupied < self.slots.len()).then_some(ring.write_index)
            };

            if let Some(index) = index {
                let mut fragment = self.slots[index].lock().await;
                fragment.clear();
                trace!(track = %self.track, slot = index, "Write slot acquired");
                return Ok(WriteSlot {
                    buffer: self,
                    fragment,
                    _gate: gate,
                });
            }

            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => return Err(Error::Aborted),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(Error::WaitTimeout {
                        track: self.track,
                        what: "free fragment slot",
                    });
                }
            }
        }
    }

    /// Wait for a committed fragment and return access to it
    pub async fn acquire_read_slot(&self, timeout: Duration, cancel: &CancellationToken) -> Result<ReadSlot<'_>> {
        let gate = self.gate.read().await;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.fragment_committed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if cancel.is_cancelled() {
                return Err(Error::Aborted);
            }

            let index = {
                let ring = self.ring.lock().await;
                if ring.occupied == 0 && ring.end_of_stream {
                    return Err(Error::EndOfStream { track: self.track });
                }
                (ring.occupied > 0).then_some(ring.read_index)
            };

            if let Some(index) = index {
                let fragment = self.slots[index].lock().await;
                trace!(track = %self.track, slot = index, "Read slot acquired");
                return Ok(ReadSlot {
                    buffer: self,
                    fragment,
                    _gate: gate,
                });
            }

            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => return Err(Error::Aborted),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(Error::WaitTimeout {
                        track: self.track,
                        what: "cached fragment",
                    });
                }
            }
        }
    }

    async fn commit_write(&self) -> Result<()> {
        let mut ring = self.ring.lock().await;
        if ring.occupied >= self.slots.len() {
            debug_assert!(false, "write commit on a full ring");
            return Err(Error::sequencing(format!(
                "write commit on full {} ring (occupied {})",
                self.track, ring.occupied
            )));
        }
        ring.write_index = (ring.write_index + 1) % self.slots.len();
        ring.occupied += 1;
        let occupied = ring.occupied;
        drop(ring);

        self.fragment_committed.notify_one();
        trace!(track = %self.track, occupied, "Fragment committed");
        Ok(())
    }

    async fn commit_read(&self) -> Result<()> {
        let mut ring = self.ring.lock().await;
        if ring.occupied == 0 {
            debug_assert!(false, "read commit on an empty ring");
            return Err(Error::sequencing(format!(
                "read commit on empty {} ring",
                self.track
            )));
        }
        ring.read_index = (ring.read_index + 1) % self.slots.len();
        ring.occupied -= 1;
        let occupied = ring.occupied;
        drop(ring);

        self.slot_freed.notify_one();
        trace!(track = %self.track, occupied, "Fragment consumed");
        Ok(())
    }

    /// Drop every cached fragment.
    ///
    /// Waits for in-flight slot guards to be released, so callers stop both
    /// loops first.
    pub async fn flush(&self) {
        let _gate = self.gate.write().await;
        let mut ring = self.ring.lock().await;
        let dropped = ring.occupied;
        *ring = RingState::default();
        drop(ring);

        self.slot_freed.notify_waiters();
        debug!(track = %self.track, dropped, "Fragment buffer flushed");
    }

    /// The producer has no more fragments; the consumer drains and then sees EndOfStream
    pub async fn mark_end_of_stream(&self) {
        self.ring.lock().await.end_of_stream = true;
        self.fragment_committed.notify_waiters();
    }

    pub async fn is_end_of_stream(&self) -> bool {
        self.ring.lock().await.end_of_stream
    }
}

/// Exclusive access to the slot at the write index.
///
/// Dropping the guard without [`WriteSlot::commit`] abandons the fill.
#[derive(Debug)]
pub struct WriteSlot<'a> {
    buffer: &'a FragmentBuffer,
    fragment: MutexGuard<'a, Fragment>,
    _gate: RwLockReadGuard<'a, ()>,
}

impl WriteSlot<'_> {
    /// Publish the filled slot to the consumer
    pub async fn commit(self) -> Result<()> {
        let WriteSlot {
            buffer,
            fragment,
            _gate,
        } = self;
        drop(fragment);
        buffer.commit_write().await
    }
}

impl Deref for WriteSlot<'_> {
    type Target = Fragment;

    fn deref(&self) -> &Fragment {
        &self.fragment
    }
}

impl DerefMut for WriteSlot<'_> {
    fn deref_mut(&mut self) -> &mut Fragment {
        &mut self.fragment
    }
}

/// Access to the slot at the read index.
///
/// Dropping the guard without [`ReadSlot::commit`] leaves the fragment cached.
#[derive(Debug)]
pub struct ReadSlot<'a> {
    buffer: &'a FragmentBuffer,
    fragment: MutexGuard<'a, Fragment>,
    _gate: RwLockReadGuard<'a, ()>,
}

impl ReadSlot<'_> {
    /// Release the slot back to the producer
    pub async fn commit(self) -> Result<()> {
        let ReadSlot {
            buffer,
            fragment,
            _gate,
        } = self;
        drop(fragment);
        buffer.commit_read().await
    }
}

impl Deref for ReadSlot<'_> {
    type Target = Fragment;

    fn deref(&self) -> &Fragment {
        &self.fragment
    }
}

impl DerefMut for ReadSlot<'_> {
    fn deref_mut(&mut self) -> &mut Fragment {
        &mut self.fragment
    }
}

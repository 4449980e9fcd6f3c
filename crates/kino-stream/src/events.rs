//! Pipeline event emission
//!
//! Conditions the host must react to are published once per episode:
//! - Buffer health transitions and stalls
//! - Profile changes
//! - Discontinuities that could not be paired across tracks
//! - Fatal track failures

use crate::{
    abr::ProfileChangeReason,
    types::{BufferHealth, SessionId, TrackType},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, error};
use uuid::Uuid;

/// Fatal condition classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FatalKind {
    /// Consecutive download failures crossed the threshold
    PersistentDownload,
    /// Consecutive decrypt failures crossed the threshold
    DecryptFailure,
    /// License never arrived
    LicenseTimeout,
    /// Init fragment failed with no lower profile to fall back to
    InitFragmentDownload,
    /// Media sink refused a sample
    Sink,
    /// Ring buffer invariant violated
    Sequencing,
}

/// Pipeline event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// Buffer health classification changed
    BufferHealthChanged {
        track: TrackType,
        from: BufferHealth,
        to: BufferHealth,
        buffered: f64,
    },

    /// Buffer stayed Red past the stall timeout
    PlaybackStalled {
        track: TrackType,
        buffered: f64,
        red_for_ms: u64,
    },

    /// Video profile changed
    ProfileChanged {
        from: usize,
        to: usize,
        bandwidth: u64,
        reason: ProfileChangeReason,
    },

    /// Discontinuity could not be matched with the sibling track
    DiscontinuityUnpaired {
        track: TrackType,
        position: f64,
    },

    /// Track delivered its last fragment
    EndOfStream {
        track: TrackType,
    },

    /// Track stopped on an unrecoverable condition
    Fatal {
        track: TrackType,
        kind: FatalKind,
        code: String,
        message: String,
    },
}

/// Event with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// Unique event ID
    pub id: Uuid,
    /// Session ID
    pub session_id: SessionId,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
    /// Sequence number
    pub sequence: u64,
    /// The event
    #[serde(flatten)]
    pub event: PipelineEvent,
}

/// Broadcasts pipeline events to any number of subscribers
#[derive(Debug)]
pub struct EventBus {
    session_id: SessionId,
    sequence: AtomicU64,
    tx: broadcast::Sender<EventRecord>,
}

impl EventBus {
    pub fn new(session_id: SessionId, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            session_id,
            sequence: AtomicU64::new(0),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.tx.subscribe()
    }

    /// Publish an event; dropped silently when nobody listens
    pub fn emit(&self, event: PipelineEvent) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let record = EventRecord {
            id: Uuid::new_v4(),
            session_id: self.session_id,
            timestamp: Utc::now(),
            sequence,
            event,
        };

        if let PipelineEvent::Fatal { track, kind, message, .. } = &record.event {
            error!(track = %track, kind = ?kind, message = %message, "Fatal pipeline condition");
        } else {
            debug!(event_id = %record.id, event = ?record.event, "Pipeline event");
        }
        let _ = self.tx.send(record);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(SessionId::new(), 256)
    }
}

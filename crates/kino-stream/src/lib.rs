//! Kino Stream - Adaptive Streaming Pipeline for Kino
//!
//! This crate provides the fragment cache/inject engine behind playback:
//! - Per-track fragment ring buffers with backpressure
//! - Fetch and inject loops with retry, rampdown and skip handling
//! - Adaptive bitrate (ABR) decisions from throughput and buffer health
//! - Buffer health monitoring and stall detection
//! - Cross-track synchronization and discontinuity pairing
//! - Trick play timestamp restamping (ISO-BMFF)
//! - Pipeline event emission
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Kino Stream                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │   Playlist   │  │  Downloader  │  │  Decryptor   │           │
//! │  │   Resolver   │  │    (HTTP)    │  │              │           │
//! │  └──────┬───────┘  └──────┬───────┘  └──────┬───────┘           │
//! │         └─────────────────┼─────────────────┘                   │
//! │                    ┌──────┴──────┐      ┌──────────────┐        │
//! │                    │ Fetch Loop  │──────│  ABR Engine  │        │
//! │                    └──────┬──────┘      └──────┬───────┘        │
//! │                    ┌──────┴──────┐      ┌──────┴───────┐        │
//! │                    │  Fragment   │──────│    Health    │        │
//! │                    │   Buffer    │      │   Monitor    │        │
//! │                    └──────┬──────┘      └──────────────┘        │
//! │                    ┌──────┴──────┐      ┌──────────────┐        │
//! │                    │ Inject Loop │──────│  Cross-Track │        │
//! │                    │ (restamp)   │      │ Synchronizer │        │
//! │                    └──────┬──────┘      └──────────────┘        │
//! │  ┌──────────────┐  ┌──────┴──────┐                              │
//! │  │    Event     │  │    Media    │                              │
//! │  │     Bus      │  │    Sink     │                              │
//! │  └──────────────┘  └─────────────┘                              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod abr;
pub mod buffer;
pub mod config;
pub mod drm;
pub mod error;
pub mod events;
pub mod health;
pub mod isobmff;
pub mod net;
pub mod playlist;
pub mod restamp;
pub mod session;
pub mod sink;
pub mod sync;
pub mod track;
pub mod types;

pub use abr::{AbrEngine, BandwidthEstimator, EwmaBandwidthEstimator, ProfileChangeReason, ProfileSet};
pub use buffer::{Fragment, FragmentBuffer};
pub use config::PipelineConfig;
pub use drm::{ClearDecryptor, DecryptError, Decryptor};
pub use error::{Error, Result};
pub use events::{EventBus, EventRecord, FatalKind, PipelineEvent};
pub use health::BufferHealthMonitor;
pub use isobmff::{IsoBmffTimestampWriter, TimestampWriter};
pub use net::{DownloadError, DownloadErrorKind, Downloaded, Downloader, HttpDownloader};
pub use playlist::{FragmentLookup, PlaylistKind, PlaylistResolver, PlaylistUpdate, SegmentList};
pub use restamp::TrickModeRestamper;
pub use session::{SessionStats, StreamSession};
pub use sink::{ChannelSink, MediaSink, SinkEvent};
pub use sync::CrossTrackSynchronizer;
pub use track::{Collaborators, TrackPipeline};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the streaming library
pub fn init() {
    tracing::info!(version = VERSION, "Kino Stream initialized");
}

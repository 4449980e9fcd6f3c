//! Core types for Kino Stream

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

/// Unique identifier for a streaming session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Elementary track handled by one pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackType {
    Video,
    Audio,
    Subtitle,
    AuxAudio,
}

impl TrackType {
    /// Media type of the fragments this track carries at the given play rate
    pub fn media_type(&self, trickplay: bool) -> MediaType {
        match self {
            TrackType::Video if trickplay => MediaType::Iframe,
            TrackType::Video => MediaType::Video,
            TrackType::Audio => MediaType::Audio,
            TrackType::Subtitle => MediaType::Subtitle,
            TrackType::AuxAudio => MediaType::AuxAudio,
        }
    }

    /// Sibling track used for discontinuity pairing
    pub fn discontinuity_peer(&self) -> Option<TrackType> {
        match self {
            TrackType::Video => Some(TrackType::Audio),
            TrackType::Audio => Some(TrackType::Video),
            TrackType::Subtitle | TrackType::AuxAudio => None,
        }
    }
}

impl std::fmt::Display for TrackType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackType::Video => write!(f, "video"),
            TrackType::Audio => write!(f, "audio"),
            TrackType::Subtitle => write!(f, "subtitle"),
            TrackType::AuxAudio => write!(f, "aux-audio"),
        }
    }
}

/// Media type of a fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Video,
    Audio,
    Subtitle,
    AuxAudio,
    /// I-frame only video used for trick play
    Iframe,
}

/// Video resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A bitrate tier in the ABR ladder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// Unique identifier for this profile
    pub id: String,
    /// Bandwidth in bits per second
    pub bandwidth: u64,
    /// Video resolution (if video track)
    pub resolution: Option<Resolution>,
    /// Disabled profiles are never selected
    pub enabled: bool,
}

impl Profile {
    /// Create an enabled profile with the given bandwidth
    pub fn new(id: impl Into<String>, bandwidth: u64) -> Self {
        Self {
            id: id.into(),
            bandwidth,
            resolution: None,
            enabled: true,
        }
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Some(Resolution::new(width, height));
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Byte range for partial fragment requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub length: u64,
}

impl ByteRange {
    /// Inclusive last byte, `None` for an empty range
    pub fn end(&self) -> Option<u64> {
        self.length
            .checked_sub(1)
            .and_then(|last| self.start.checked_add(last))
    }
}

/// Fragment descriptor handed out by a playlist resolver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentDescriptor {
    /// Resolver sequence number
    pub sequence: u64,
    /// Fragment location
    pub uri: Url,
    /// Byte range (if applicable)
    pub byte_range: Option<ByteRange>,
    /// Track-relative start position in seconds
    pub position: f64,
    /// Duration in seconds
    pub duration: f64,
    /// Initialization fragment (no media samples)
    pub is_init: bool,
    /// First fragment after a timeline discontinuity
    pub is_discontinuity: bool,
    /// Profile the fragment was resolved for
    pub profile_index: usize,
    /// Source clock units per second for boxed formats (0 if unboxed)
    pub timescale: u32,
    /// Wall clock anchor (program date time)
    pub source_date_time: Option<DateTime<Utc>>,
    /// Fragment needs decryption
    pub encrypted: bool,
}

impl FragmentDescriptor {
    /// Create a media fragment descriptor
    pub fn media(sequence: u64, uri: Url, position: f64, duration: f64) -> Self {
        Self {
            sequence,
            uri,
            byte_range: None,
            position,
            duration,
            is_init: false,
            is_discontinuity: false,
            profile_index: 0,
            timescale: 0,
            source_date_time: None,
            encrypted: false,
        }
    }

    /// Create an initialization fragment descriptor
    pub fn init(sequence: u64, uri: Url, position: f64) -> Self {
        Self {
            is_init: true,
            ..Self::media(sequence, uri, position, 0.0)
        }
    }

    pub fn with_discontinuity(mut self) -> Self {
        self.is_discontinuity = true;
        self
    }

    pub fn with_date_time(mut self, date_time: DateTime<Utc>) -> Self {
        self.source_date_time = Some(date_time);
        self
    }

    pub fn with_timescale(mut self, timescale: u32) -> Self {
        self.timescale = timescale;
        self
    }
}

/// Discontinuity boundary observed in a track's segment list
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiscontinuityMark {
    /// Track the mark was recorded on
    pub track: TrackType,
    /// Position of the boundary in seconds
    pub position: f64,
    /// Wall clock of the boundary, if the playlist carries one
    pub source_date_time: Option<DateTime<Utc>>,
    /// Seconds culled from the head of the playlist when the mark was recorded
    pub culled_seconds: f64,
}

impl DiscontinuityMark {
    pub fn new(track: TrackType, position: f64) -> Self {
        Self {
            track,
            position,
            source_date_time: None,
            culled_seconds: 0.0,
        }
    }

    pub fn with_date_time(mut self, date_time: DateTime<Utc>) -> Self {
        self.source_date_time = Some(date_time);
        self
    }
}

/// Buffer health classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferHealth {
    Green,
    Yellow,
    Red,
}

impl std::fmt::Display for BufferHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BufferHealth::Green => write!(f, "green"),
            BufferHealth::Yellow => write!(f, "yellow"),
            BufferHealth::Red => write!(f, "red"),
        }
    }
}

/// Sample handed to the media sink
#[derive(Debug, Clone)]
pub struct SinkSample {
    pub track: TrackType,
    pub media_type: MediaType,
    pub payload: Bytes,
    /// Presentation time in seconds
    pub pts: f64,
    /// Decode time in seconds
    pub dts: f64,
    pub duration: f64,
    pub is_init: bool,
    pub is_discontinuity: bool,
}

/// Snapshot of a track pipeline's counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackStats {
    pub fragments_fetched: u64,
    pub fragments_injected: u64,
    pub total_fetched_duration: f64,
    pub total_injected_duration: f64,
    pub last_injected_position: f64,
    pub current_profile_index: usize,
    pub consecutive_download_failures: u32,
    pub consecutive_decrypt_failures: u32,
    pub rampdown_count: u32,
    pub end_of_track: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_range_end() {
        assert_eq!(ByteRange { start: 100, length: 50 }.end(), Some(149));
        assert_eq!(ByteRange { start: 0, length: 1 }.end(), Some(0));
        assert_eq!(ByteRange { start: 100, length: 0 }.end(), None);
        assert_eq!(ByteRange { start: u64::MAX, length: 2 }.end(), None);
    }

    #[test]
    fn test_track_media_type() {
        assert_eq!(TrackType::Video.media_type(false), MediaType::Video);
        assert_eq!(TrackType::Video.media_type(true), MediaType::Iframe);
        assert_eq!(TrackType::Audio.media_type(true), MediaType::Audio);
    }

    #[test]
    fn test_discontinuity_peer() {
        assert_eq!(TrackType::Video.discontinuity_peer(), Some(TrackType::Audio));
        assert_eq!(TrackType::Audio.discontinuity_peer(), Some(TrackType::Video));
        assert_eq!(TrackType::Subtitle.discontinuity_peer(), None);
    }

    #[test]
    fn test_track_serde_names() {
        let json = serde_json::to_string(&TrackType::AuxAudio).unwrap();
        assert_eq!(json, "\"aux_audio\"");
        assert_eq!(TrackType::AuxAudio.to_string(), "aux-audio");
    }
}

//! Playlist resolution seam
//!
//! Manifest grammar is handled by the host. The pipeline only asks for the
//! descriptor at a sequence number and for the discontinuities a refresh
//! revealed.

use crate::{
    types::{DiscontinuityMark, FragmentDescriptor, TrackType},
    Error, Result,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Playlist flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaylistKind {
    /// Complete, immutable segment list
    Vod,
    /// Sliding live window
    Live,
    /// Growing live playlist (event or time-shift buffer)
    Event,
}

impl PlaylistKind {
    pub fn is_live(&self) -> bool {
        !matches!(self, PlaylistKind::Vod)
    }
}

/// Answer to a fragment lookup
#[derive(Debug, Clone)]
pub enum FragmentLookup {
    Available(FragmentDescriptor),
    /// Live playlist has not published this sequence yet
    NotYetAvailable,
    EndOfTrack,
}

/// Result of a playlist refresh
#[derive(Debug, Clone, Default)]
pub struct PlaylistUpdate {
    /// Discontinuities present in the refreshed list
    pub discontinuities: Vec<DiscontinuityMark>,
    /// Seconds culled from the head since the previous refresh
    pub culled_seconds: f64,
    /// The playlist has ended
    pub ended: bool,
}

/// Resolves fragment descriptors for every track of a presentation
#[async_trait]
pub trait PlaylistResolver: Send + Sync {
    /// Sequence number the track starts at
    async fn first_sequence(&self, track: TrackType) -> Result<u64>;

    /// Descriptor at `sequence` for the given profile
    async fn fragment(&self, track: TrackType, sequence: u64, profile: usize) -> Result<FragmentLookup>;

    /// Sequence of the fragment covering `position` seconds.
    ///
    /// A position past the last published fragment maps to the sequence after
    /// it; `None` when the track has no fragments.
    async fn sequence_at(&self, track: TrackType, position: f64) -> Result<Option<u64>>;

    /// Initialization fragment for `profile`, if the format has one
    async fn init_fragment(&self, _track: TrackType, _profile: usize) -> Result<Option<FragmentDescriptor>> {
        Ok(None)
    }

    /// Re-read the track's playlist
    async fn refresh(&self, track: TrackType) -> Result<PlaylistUpdate>;

    fn kind(&self) -> PlaylistKind;

    /// Target fragment duration in seconds
    fn target_duration(&self) -> f64;

    fn is_live(&self) -> bool {
        self.kind().is_live()
    }
}

#[derive(Debug, Default)]
struct TrackSegments {
    init: Option<FragmentDescriptor>,
    segments: Vec<FragmentDescriptor>,
    culled_seconds: f64,
    pending_culled: f64,
    ended: bool,
}

/// In-memory resolver over pre-built descriptor lists.
///
/// Live behaviour is emulated with [`SegmentList::append`],
/// [`SegmentList::cull`] and [`SegmentList::end`].
pub struct SegmentList {
    kind: PlaylistKind,
    target_duration: f64,
    tracks: RwLock<HashMap<TrackType, TrackSegments>>,
}

impl SegmentList {
    pub fn new(kind: PlaylistKind, target_duration: f64) -> Self {
        Self {
            kind,
            target_duration,
            tracks: RwLock::new(HashMap::new()),
        }
    }

    /// Complete VOD list for one track
    pub fn vod(target_duration: f64, track: TrackType, segments: Vec<FragmentDescriptor>) -> Self {
        let mut tracks = HashMap::new();
        tracks.insert(
            track,
            TrackSegments {
                segments,
                ended: true,
                ..Default::default()
            },
        );
        Self {
            kind: PlaylistKind::Vod,
            target_duration,
            tracks: RwLock::new(tracks),
        }
    }

    /// Replace a track's segments
    pub async fn set_track(&self, track: TrackType, segments: Vec<FragmentDescriptor>) {
        let mut tracks = self.tracks.write().await;
        let entry = tracks.entry(track).or_default();
        entry.segments = segments;
        entry.ended = !self.kind.is_live();
    }

    /// Set the initialization fragment served for every profile
    pub async fn set_init(&self, track: TrackType, init: FragmentDescriptor) {
        let mut tracks = self.tracks.write().await;
        tracks.entry(track).or_default().init = Some(init);
    }

    /// Publish more segments on a live track
    pub async fn append(&self, track: TrackType, segments: impl IntoIterator<Item = FragmentDescriptor>) {
        let mut tracks = self.tracks.write().await;
        tracks.entry(track).or_default().segments.extend(segments);
    }

    /// Drop segments from the head of a live window
    pub async fn cull(&self, track: TrackType, count: usize) {
        let mut tracks = self.tracks.write().await;
        let entry = tracks.entry(track).or_default();
        let count = count.min(entry.segments.len());
        let culled: f64 = entry.segments.drain(..count).map(|s| s.duration).sum();
        entry.culled_seconds += culled;
        entry.pending_culled += culled;
    }

    /// Mark a live track as finished
    pub async fn end(&self, track: TrackType) {
        let mut tracks = self.tracks.write().await;
        tracks.entry(track).or_default().ended = true;
    }
}

#[async_trait]
impl PlaylistResolver for SegmentList {
    async fn first_sequence(&self, track: TrackType) -> Result<u64> {
        let tracks = self.tracks.read().await;
        let entry = tracks.get(&track).ok_or(Error::UnknownTrack(track))?;
        Ok(entry.segments.first().map(|s| s.sequence).unwrap_or(0))
    }

    async fn fragment(&self, track: TrackType, sequence: u64, profile: usize) -> Result<FragmentLookup> {
        let tracks = self.tracks.read().await;
        let entry = tracks.get(&track).ok_or(Error::UnknownTrack(track))?;

        let found = entry
            .segments
            .iter()
            .find(|s| s.sequence >= sequence)
            .cloned();
        Ok(match found {
            Some(mut descriptor) => {
                if descriptor.sequence != sequence {
                    debug!(track = %track, requested = sequence, resumed = descriptor.sequence, "Sequence culled, resuming at window head");
                }
                descriptor.profile_index = profile;
                FragmentLookup::Available(descriptor)
            }
            None if entry.ended => FragmentLookup::EndOfTrack,
            None => FragmentLookup::NotYetAvailable,
        })
    }

    async fn sequence_at(&self, track: TrackType, position: f64) -> Result<Option<u64>> {
        let tracks = self.tracks.read().await;
        let entry = tracks.get(&track).ok_or(Error::UnknownTrack(track))?;
        let covering = entry
            .segments
            .iter()
            .find(|s| s.position + s.duration > position)
            .map(|s| s.sequence);
        Ok(covering.or_else(|| entry.segments.last().map(|s| s.sequence + 1)))
    }

    async fn init_fragment(&self, track: TrackType, profile: usize) -> Result<Option<FragmentDescriptor>> {
        let tracks = self.tracks.read().await;
        let entry = tracks.get(&track).ok_or(Error::UnknownTrack(track))?;
        Ok(entry.init.clone().map(|mut init| {
            init.profile_index = profile;
            init
        }))
    }

    async fn refresh(&self, track: TrackType) -> Result<PlaylistUpdate> {
        let mut tracks = self.tracks.write().await;
        let entry = tracks.get_mut(&track).ok_or(Error::UnknownTrack(track))?;
        let culled = std::mem::take(&mut entry.pending_culled);
        let discontinuities = entry
            .segments
            .iter()
            .filter(|s| s.is_discontinuity)
            .map(|s| DiscontinuityMark {
                track,
                position: s.position,
                source_date_time: s.source_date_time,
                culled_seconds: entry.culled_seconds,
            })
            .collect();
        Ok(PlaylistUpdate {
            discontinuities,
            culled_seconds: culled,
            ended: entry.ended,
        })
    }

    fn kind(&self) -> PlaylistKind {
        self.kind
    }

    fn target_duration(&self) -> f64 {
        self.target_duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn create_test_segment(track: &str, num: u64) -> FragmentDescriptor {
        let uri = Url::parse(&format!("https://cdn.example.com/{}/seg{}.m4s", track, num)).unwrap();
        FragmentDescriptor::media(num, uri, num as f64 * 2.0, 2.0)
    }

    #[tokio::test]
    async fn test_vod_lookup() {
        let list = SegmentList::vod(
            2.0,
            TrackType::Video,
            (0..3).map(|n| create_test_segment("video", n)).collect(),
        );

        assert_eq!(list.first_sequence(TrackType::Video).await.unwrap(), 0);
        match list.fragment(TrackType::Video, 1, 2).await.unwrap() {
            FragmentLookup::Available(d) => {
                assert_eq!(d.position, 2.0);
                assert_eq!(d.profile_index, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            list.fragment(TrackType::Video, 3, 0).await.unwrap(),
            FragmentLookup::EndOfTrack
        ));
        assert!(matches!(
            list.fragment(TrackType::Audio, 0, 0).await,
            Err(Error::UnknownTrack(TrackType::Audio))
        ));
    }

    #[tokio::test]
    async fn test_sequence_at_position() {
        let list = SegmentList::new(PlaylistKind::Vod, 2.0);
        list.set_track(TrackType::Video, (0..5).map(|n| create_test_segment("video", n)).collect())
            .await;
        // Audio fragments straddle the video boundaries
        list.set_track(
            TrackType::Audio,
            (0..4)
                .map(|n| {
                    let uri = Url::parse(&format!("https://cdn.example.com/audio/seg{}.m4s", n)).unwrap();
                    FragmentDescriptor::media(n, uri, n as f64 * 2.5, 2.5)
                })
                .collect(),
        )
        .await;

        assert_eq!(list.sequence_at(TrackType::Video, 0.0).await.unwrap(), Some(0));
        assert_eq!(list.sequence_at(TrackType::Video, 6.0).await.unwrap(), Some(3));
        assert_eq!(list.sequence_at(TrackType::Video, 7.9).await.unwrap(), Some(3));
        assert_eq!(list.sequence_at(TrackType::Audio, 6.0).await.unwrap(), Some(2));
        assert_eq!(list.sequence_at(TrackType::Video, 10.0).await.unwrap(), Some(5));

        list.set_track(TrackType::Subtitle, Vec::new()).await;
        assert_eq!(list.sequence_at(TrackType::Subtitle, 4.0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_live_window() {
        let list = SegmentList::new(PlaylistKind::Live, 2.0);
        list.set_track(TrackType::Audio, vec![create_test_segment("audio", 10)]).await;

        assert!(matches!(
            list.fragment(TrackType::Audio, 11, 0).await.unwrap(),
            FragmentLookup::NotYetAvailable
        ));

        let mut disc = create_test_segment("audio", 11);
        disc.is_discontinuity = true;
        list.append(TrackType::Audio, [disc, create_test_segment("audio", 12)]).await;
        list.cull(TrackType::Audio, 1).await;

        let update = list.refresh(TrackType::Audio).await.unwrap();
        assert_eq!(update.culled_seconds, 2.0);
        assert_eq!(update.discontinuities.len(), 1);
        assert_eq!(update.discontinuities[0].position, 22.0);

        // Culled sequence resumes at the head of the window
        match list.fragment(TrackType::Audio, 10, 0).await.unwrap() {
            FragmentLookup::Available(d) => assert_eq!(d.sequence, 11),
            other => panic!("unexpected {:?}", other),
        }

        list.end(TrackType::Audio).await;
        assert!(matches!(
            list.fragment(TrackType::Audio, 13, 0).await.unwrap(),
            FragmentLookup::EndOfTrack
        ));
    }
}

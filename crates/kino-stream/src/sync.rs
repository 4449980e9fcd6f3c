//! Cross-track synchronization
//!
//! Keeps sibling pipelines aligned:
//! - Audio, auxiliary audio and subtitles never run ahead of video beyond a
//!   tolerance window
//! - Discontinuity marks are paired between video and audio
//! - Both sides of a paired discontinuity are consumed before either proceeds
//!
//! Each track's record is written only by its own pipeline. Waits snapshot the
//! records they compare, release every lock, then sleep on a notification.

use crate::{
    config::SyncConfig,
    events::{EventBus, PipelineEvent},
    playlist::PlaylistKind,
    types::{DiscontinuityMark, TrackType},
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Progress of one track as seen by its siblings
#[derive(Debug, Clone, Default)]
pub struct TrackProgress {
    pub enabled: bool,
    pub last_injected_position: f64,
    pub total_injected_duration: f64,
    pub at_end: bool,
    pub injection_aborted: bool,
    pub in_discontinuity: bool,
    pub marks: Vec<DiscontinuityMark>,
    pub culled_seconds: f64,
    pub refresh_count: u64,
}

impl TrackProgress {
    /// Still able to make progress
    fn is_active(&self) -> bool {
        self.enabled && !self.at_end && !self.injection_aborted
    }
}

/// Result of a catch-up wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchupOutcome {
    /// Video is within tolerance
    Ready,
    /// Video is absent, disabled, finished or aborted
    VideoInactive,
    /// Video is crossing a discontinuity and must not be waited on
    VideoInDiscontinuity,
    Aborted,
}

/// Result of discontinuity pairing
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DiscontinuityMatch {
    Matched { peer_position: f64 },
    /// Track does not take part in pairing
    Bypassed,
    /// No matching mark; proceed unsynchronized
    Unpaired,
    Aborted,
}

/// Result of the discontinuity rendezvous
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousOutcome {
    Paired,
    Bypassed,
    TimedOut,
    Aborted,
}

#[derive(Debug, Default)]
struct DiscontinuityGate {
    video_waiting: bool,
    audio_waiting: bool,
    generation: u64,
}

impl DiscontinuityGate {
    fn set(&mut self, track: TrackType, waiting: bool) {
        match track {
            TrackType::Video => self.video_waiting = waiting,
            TrackType::Audio => self.audio_waiting = waiting,
            TrackType::Subtitle | TrackType::AuxAudio => {}
        }
    }
}

/// Coordinates playback position and discontinuity boundaries across tracks
pub struct CrossTrackSynchronizer {
    config: SyncConfig,
    target_duration: f64,
    tracks: RwLock<HashMap<TrackType, Arc<RwLock<TrackProgress>>>>,
    progress: Notify,
    gate: Mutex<DiscontinuityGate>,
    gate_released: Notify,
    events: Arc<EventBus>,
}

impl CrossTrackSynchronizer {
    pub fn new(config: SyncConfig, target_duration: f64, events: Arc<EventBus>) -> Self {
        Self {
            config,
            target_duration,
            tracks: RwLock::new(HashMap::new()),
            progress: Notify::new(),
            gate: Mutex::new(DiscontinuityGate::default()),
            gate_released: Notify::new(),
            events,
        }
    }

    pub fn target_duration(&self) -> f64 {
        self.target_duration
    }

    /// Audio/aux lag allowed behind video
    pub fn catchup_tolerance(&self) -> f64 {
        self.config.catchup_tolerance_factor * self.target_duration()
    }

    /// Register a track; registering again resets its record
    pub async fn register(&self, track: TrackType) {
        let record = TrackProgress {
            enabled: true,
            ..Default::default()
        };
        let mut tracks = self.tracks.write().await;
        match tracks.get(&track) {
            Some(existing) => *existing.write().await = record,
            None => {
                tracks.insert(track, Arc::new(RwLock::new(record)));
            }
        }
    }

    async fn record(&self, track: TrackType) -> Option<Arc<RwLock<TrackProgress>>> {
        self.tracks.read().await.get(&track).cloned()
    }

    /// Copy of a track's progress
    pub async fn snapshot(&self, track: TrackType) -> Option<TrackProgress> {
        let record = self.record(track).await?;
        let snapshot = record.read().await.clone();
        Some(snapshot)
    }

    async fn update(&self, track: TrackType, f: impl FnOnce(&mut TrackProgress)) {
        if let Some(record) = self.record(track).await {
            f(&mut *record.write().await);
        }
        self.progress.notify_waiters();
        self.gate_released.notify_waiters();
    }

    /// Record an injected fragment
    pub async fn report_injected(&self, track: TrackType, position: f64, duration: f64) {
        self.update(track, |p| {
            p.last_injected_position = position;
            p.total_injected_duration += duration;
        })
        .await;
    }

    pub async fn set_track_enabled(&self, track: TrackType, enabled: bool) {
        self.update(track, |p| p.enabled = enabled).await;
    }

    pub async fn set_end_of_track(&self, track: TrackType, at_end: bool) {
        self.update(track, |p| p.at_end = at_end).await;
    }

    pub async fn set_injection_aborted(&self, track: TrackType, aborted: bool) {
        self.update(track, |p| p.injection_aborted = aborted).await;
    }

    /// Publish the discontinuities revealed by a playlist refresh
    pub async fn record_marks(&self, track: TrackType, marks: Vec<DiscontinuityMark>, culled_seconds: f64) {
        debug!(track = %track, marks = marks.len(), culled_seconds, "Discontinuity marks recorded");
        self.update(track, |p| {
            p.marks = marks;
            p.culled_seconds += culled_seconds;
            p.refresh_count += 1;
        })
        .await;
    }

    /// Block a non-video track while it is ahead of video.
    ///
    /// Returns as soon as video is within tolerance, inactive, or crossing a
    /// discontinuity, or when `cancel` fires.
    #[instrument(skip(self, cancel))]
    pub async fn wait_for_video_catchup(&self, track: TrackType, cancel: &CancellationToken) -> CatchupOutcome {
        if track == TrackType::Video {
            return CatchupOutcome::Ready;
        }
        let slack = if track == TrackType::Subtitle {
            self.config.subtitle_lead_secs
        } else {
            0.0
        };

        let mut waited = false;
        loop {
            let notified = self.progress.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if cancel.is_cancelled() {
                return CatchupOutcome::Aborted;
            }

            let (Some(me), Some(video)) = (self.snapshot(track).await, self.snapshot(TrackType::Video).await) else {
                return CatchupOutcome::VideoInactive;
            };
            if !video.is_active() {
                return CatchupOutcome::VideoInactive;
            }
            if video.in_discontinuity {
                return CatchupOutcome::VideoInDiscontinuity;
            }

            let threshold = me.last_injected_position - self.catchup_tolerance() - slack;
            if video.last_injected_position >= threshold {
                if waited {
                    debug!(track = %track, video = video.last_injected_position, position = me.last_injected_position, "Video caught up");
                }
                return CatchupOutcome::Ready;
            }

            if !waited {
                debug!(
                    track = %track,
                    video = video.last_injected_position,
                    position = me.last_injected_position,
                    "Waiting for video to catch up"
                );
                waited = true;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return CatchupOutcome::Aborted,
                _ = tokio::time::sleep(self.config.wait_interval()) => {}
            }
        }
    }

    fn matches(&self, mark: &DiscontinuityMark, candidate: &DiscontinuityMark, culled_delta: f64) -> bool {
        let target = self.target_duration();
        match (mark.source_date_time, candidate.source_date_time) {
            (Some(a), Some(b)) => {
                let diff = (a - b).num_milliseconds().abs() as f64 / 1000.0;
                diff <= target
            }
            _ => {
                let window = self.config.discontinuity_tolerance_factor * target + culled_delta.abs();
                (mark.position - candidate.position).abs() <= window
            }
        }
    }

    /// Find the sibling discontinuity corresponding to `mark`.
    ///
    /// Live playlists may not list the sibling boundary yet, so the search is
    /// retried after each sibling refresh up to the configured bound.
    #[instrument(skip(self, cancel), fields(track = %mark.track, position = mark.position))]
    pub async fn resolve_discontinuity(
        &self,
        mark: &DiscontinuityMark,
        kind: PlaylistKind,
        cancel: &CancellationToken,
    ) -> DiscontinuityMatch {
        let Some(peer) = mark.track.discontinuity_peer() else {
            return DiscontinuityMatch::Bypassed;
        };
        let Some(initial) = self.snapshot(peer).await else {
            return DiscontinuityMatch::Bypassed;
        };
        if !initial.enabled {
            return DiscontinuityMatch::Bypassed;
        }

        let max_refreshes = match kind {
            PlaylistKind::Vod => 0,
            PlaylistKind::Live => self.config.max_discontinuity_refreshes,
            PlaylistKind::Event => self.config.max_discontinuity_refreshes_event,
        } as u64;
        let own_culled = self
            .snapshot(mark.track)
            .await
            .map(|p| p.culled_seconds)
            .unwrap_or(mark.culled_seconds);
        let start_refresh = initial.refresh_count;

        loop {
            let notified = self.progress.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if cancel.is_cancelled() {
                return DiscontinuityMatch::Aborted;
            }

            let Some(peer_state) = self.snapshot(peer).await else {
                return DiscontinuityMatch::Bypassed;
            };
            let culled_delta = own_culled - peer_state.culled_seconds;

            let best = peer_state
                .marks
                .iter()
                .filter(|candidate| self.matches(mark, candidate, culled_delta))
                .min_by(|a, b| {
                    let da = (a.position - mark.position).abs();
                    let db = (b.position - mark.position).abs();
                    da.total_cmp(&db)
                });
            if let Some(found) = best {
                info!(peer = %peer, peer_position = found.position, "Discontinuity paired");
                return DiscontinuityMatch::Matched {
                    peer_position: found.position,
                };
            }

            let refreshes = peer_state.refresh_count.saturating_sub(start_refresh);
            if !kind.is_live() || refreshes >= max_refreshes || !peer_state.is_active() {
                warn!(peer = %peer, refreshes, "No matching discontinuity on sibling track");
                self.events.emit(PipelineEvent::DiscontinuityUnpaired {
                    track: mark.track,
                    position: mark.position,
                });
                return DiscontinuityMatch::Unpaired;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return DiscontinuityMatch::Aborted,
                _ = tokio::time::sleep(self.config.wait_interval()) => {}
            }
        }
    }

    async fn leave_gate(&self, track: TrackType) {
        self.gate.lock().await.set(track, false);
        self.update(track, |p| p.in_discontinuity = false).await;
    }

    /// Rendezvous at a paired discontinuity.
    ///
    /// The first track to arrive waits for its sibling, bounded by the
    /// discontinuity timeout. A sibling that already advanced more than two
    /// target durations past the boundary releases the waiter.
    #[instrument(skip(self, cancel))]
    pub async fn enter_discontinuity(&self, track: TrackType, position: f64, cancel: &CancellationToken) -> RendezvousOutcome {
        let Some(peer) = track.discontinuity_peer() else {
            return RendezvousOutcome::Bypassed;
        };
        match self.snapshot(peer).await {
            Some(p) if p.is_active() => {}
            _ => return RendezvousOutcome::Bypassed,
        }

        let generation = {
            let mut gate = self.gate.lock().await;
            gate.set(track, true);
            if gate.video_waiting && gate.audio_waiting {
                gate.video_waiting = false;
                gate.audio_waiting = false;
                gate.generation += 1;
                drop(gate);
                self.update(peer, |p| p.in_discontinuity = false).await;
                info!(track = %track, position, "Discontinuity rendezvous complete");
                return RendezvousOutcome::Paired;
            }
            gate.generation
        };
        self.update(track, |p| p.in_discontinuity = true).await;

        let deadline = tokio::time::Instant::now() + self.config.discontinuity_timeout();
        loop {
            let notified = self.gate_released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.gate.lock().await.generation != generation {
                self.update(track, |p| p.in_discontinuity = false).await;
                return RendezvousOutcome::Paired;
            }
            if cancel.is_cancelled() {
                self.leave_gate(track).await;
                return RendezvousOutcome::Aborted;
            }
            match self.snapshot(peer).await {
                Some(p) if !p.is_active() => {
                    self.leave_gate(track).await;
                    return RendezvousOutcome::Bypassed;
                }
                Some(p) if p.last_injected_position > position + 2.0 * self.target_duration() => {
                    warn!(track = %track, peer = %peer, peer_position = p.last_injected_position, "Sibling passed the discontinuity, releasing");
                    self.leave_gate(track).await;
                    return RendezvousOutcome::Bypassed;
                }
                None => {
                    self.leave_gate(track).await;
                    return RendezvousOutcome::Bypassed;
                }
                Some(_) => {}
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(track = %track, position, "Sibling never reached the discontinuity");
                self.leave_gate(track).await;
                self.events.emit(PipelineEvent::DiscontinuityUnpaired { track, position });
                return RendezvousOutcome::TimedOut;
            }

            let wake = deadline.min(tokio::time::Instant::now() + self.config.wait_interval());
            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn synchronizer(target_duration: f64) -> Arc<CrossTrackSynchronizer> {
        let config = SyncConfig {
            wait_interval_ms: 10,
            discontinuity_timeout_ms: 200,
            ..Default::default()
        };
        Arc::new(CrossTrackSynchronizer::new(
            config,
            target_duration,
            Arc::new(EventBus::default()),
        ))
    }

    #[tokio::test]
    async fn test_audio_waits_for_video() {
        // tolerance = 1.0 * 0.5
        let sync = synchronizer(0.5);
        sync.register(TrackType::Video).await;
        sync.register(TrackType::Audio).await;
        sync.report_injected(TrackType::Video, 10.0, 0.5).await;
        sync.report_injected(TrackType::Audio, 10.6, 0.5).await;

        let cancel = CancellationToken::new();
        let waiter = {
            let sync = sync.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { sync.wait_for_video_catchup(TrackType::Audio, &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        sync.report_injected(TrackType::Video, 10.2, 0.5).await;
        let outcome = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("released after video progress")
            .unwrap();
        assert_eq!(outcome, CatchupOutcome::Ready);
    }

    #[tokio::test]
    async fn test_catchup_abort_liveness() {
        let sync = synchronizer(0.5);
        sync.register(TrackType::Video).await;
        sync.register(TrackType::Audio).await;
        sync.report_injected(TrackType::Audio, 30.0, 2.0).await;

        let cancel = CancellationToken::new();
        let waiter = {
            let sync = sync.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { sync.wait_for_video_catchup(TrackType::Audio, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("released on abort")
            .unwrap();
        assert_eq!(outcome, CatchupOutcome::Aborted);
    }

    #[tokio::test]
    async fn test_catchup_releases_when_video_ends_or_in_discontinuity() {
        let sync = synchronizer(2.0);
        let cancel = CancellationToken::new();
        sync.register(TrackType::Video).await;
        sync.register(TrackType::Subtitle).await;

        // Subtitles get extra lead
        sync.report_injected(TrackType::Subtitle, 14.0, 2.0).await;
        assert_eq!(
            sync.wait_for_video_catchup(TrackType::Subtitle, &cancel).await,
            CatchupOutcome::Ready
        );

        sync.register(TrackType::Audio).await;
        sync.report_injected(TrackType::Audio, 40.0, 2.0).await;
        sync.update(TrackType::Video, |p| p.in_discontinuity = true).await;
        assert_eq!(
            sync.wait_for_video_catchup(TrackType::Audio, &cancel).await,
            CatchupOutcome::VideoInDiscontinuity
        );

        sync.update(TrackType::Video, |p| p.in_discontinuity = false).await;
        sync.set_end_of_track(TrackType::Video, true).await;
        assert_eq!(
            sync.wait_for_video_catchup(TrackType::Audio, &cancel).await,
            CatchupOutcome::VideoInactive
        );
    }

    #[tokio::test]
    async fn test_pairing_prefers_date_time() {
        let sync = synchronizer(6.0);
        sync.register(TrackType::Video).await;
        sync.register(TrackType::Audio).await;

        let at = |secs: i64| Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
        sync.record_marks(
            TrackType::Audio,
            vec![
                DiscontinuityMark::new(TrackType::Audio, 60.0).with_date_time(at(600)),
                DiscontinuityMark::new(TrackType::Audio, 120.0).with_date_time(at(120)),
            ],
            0.0,
        )
        .await;

        // Position alone would pick 60.0; the wall clock points at 120.0
        let mark = DiscontinuityMark::new(TrackType::Video, 61.0).with_date_time(at(121));
        let result = sync
            .resolve_discontinuity(&mark, PlaylistKind::Vod, &CancellationToken::new())
            .await;
        assert_eq!(result, DiscontinuityMatch::Matched { peer_position: 120.0 });

        let mark = DiscontinuityMark::new(TrackType::Video, 62.0);
        let result = sync
            .resolve_discontinuity(&mark, PlaylistKind::Vod, &CancellationToken::new())
            .await;
        assert_eq!(result, DiscontinuityMatch::Matched { peer_position: 60.0 });
    }

    #[tokio::test]
    async fn test_live_pairing_waits_for_refresh_then_gives_up() {
        let sync = synchronizer(2.0);
        sync.register(TrackType::Video).await;
        sync.register(TrackType::Audio).await;
        let mut events = sync.events.subscribe();

        let mark = DiscontinuityMark::new(TrackType::Video, 100.0);
        let resolver = {
            let sync = sync.clone();
            tokio::spawn(async move {
                sync.resolve_discontinuity(&mark, PlaylistKind::Live, &CancellationToken::new())
                    .await
            })
        };

        // Refresh that reveals the sibling mark
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!resolver.is_finished());
        sync.record_marks(TrackType::Audio, vec![DiscontinuityMark::new(TrackType::Audio, 101.0)], 0.0)
            .await;
        let result = tokio::time::timeout(Duration::from_secs(1), resolver).await.unwrap().unwrap();
        assert_eq!(result, DiscontinuityMatch::Matched { peer_position: 101.0 });

        // Never listed: give up after the refresh bound
        let mark = DiscontinuityMark::new(TrackType::Video, 500.0);
        let resolver = {
            let sync = sync.clone();
            tokio::spawn(async move {
                sync.resolve_discontinuity(&mark, PlaylistKind::Live, &CancellationToken::new())
                    .await
            })
        };
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            sync.record_marks(TrackType::Audio, vec![], 0.0).await;
        }
        let result = tokio::time::timeout(Duration::from_secs(1), resolver).await.unwrap().unwrap();
        assert_eq!(result, DiscontinuityMatch::Unpaired);

        let record = events.recv().await.unwrap();
        assert!(matches!(
            record.event,
            PipelineEvent::DiscontinuityUnpaired { track: TrackType::Video, .. }
        ));
    }

    #[tokio::test]
    async fn test_rendezvous_pairs_both_sides() {
        let sync = synchronizer(2.0);
        sync.register(TrackType::Video).await;
        sync.register(TrackType::Audio).await;
        let cancel = CancellationToken::new();

        let video = {
            let sync = sync.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { sync.enter_discontinuity(TrackType::Video, 20.0, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!video.is_finished());
        assert!(sync.snapshot(TrackType::Video).await.unwrap().in_discontinuity);

        let audio = sync.enter_discontinuity(TrackType::Audio, 20.0, &cancel).await;
        assert_eq!(audio, RendezvousOutcome::Paired);
        let video = tokio::time::timeout(Duration::from_secs(1), video).await.unwrap().unwrap();
        assert_eq!(video, RendezvousOutcome::Paired);
        assert!(!sync.snapshot(TrackType::Video).await.unwrap().in_discontinuity);
    }

    #[tokio::test]
    async fn test_rendezvous_timeout_and_abort() {
        let sync = synchronizer(2.0);
        sync.register(TrackType::Video).await;
        sync.register(TrackType::Audio).await;

        let outcome = sync
            .enter_discontinuity(TrackType::Video, 20.0, &CancellationToken::new())
            .await;
        assert_eq!(outcome, RendezvousOutcome::TimedOut);

        let cancel = CancellationToken::new();
        let waiter = {
            let sync = sync.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { sync.enter_discontinuity(TrackType::Audio, 40.0, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(outcome, RendezvousOutcome::Aborted);
        assert!(!sync.snapshot(TrackType::Audio).await.unwrap().in_discontinuity);
    }
}

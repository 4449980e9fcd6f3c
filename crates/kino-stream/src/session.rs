//! Stream Session - Orchestrator for the per-track pipelines
//!
//! Coordinates:
//! - Track pipeline lifecycle (start, stop, abort)
//! - Trick play rate changes
//! - Host-driven profile changes
//! - Buffer level and health queries
//! - Event subscription

use crate::{
    abr::{AbrEngine, BandwidthEstimator, EwmaBandwidthEstimator, ProfileChangeReason, ProfileSet},
    config::PipelineConfig,
    drm::{ClearDecryptor, Decryptor},
    events::{EventBus, EventRecord},
    isobmff::{IsoBmffTimestampWriter, TimestampWriter},
    net::Downloader,
    playlist::PlaylistResolver,
    sink::MediaSink,
    sync::CrossTrackSynchronizer,
    track::{Collaborators, TrackPipeline},
    types::{BufferHealth, SessionId, TrackStats, TrackType},
    Error, Result,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, instrument};

impl Collaborators {
    /// Collaborators with clear-content decryption, an EWMA bandwidth
    /// estimator and ISO-BMFF timestamp rewriting
    pub fn new(
        playlist: Arc<dyn PlaylistResolver>,
        downloader: Arc<dyn Downloader>,
        sink: Arc<dyn MediaSink>,
    ) -> Self {
        Self {
            playlist,
            downloader,
            decryptor: Arc::new(ClearDecryptor),
            sink,
            estimator: Arc::new(EwmaBandwidthEstimator::default()),
            timestamp_writer: Arc::new(IsoBmffTimestampWriter),
        }
    }

    pub fn with_decryptor(mut self, decryptor: Arc<dyn Decryptor>) -> Self {
        self.decryptor = decryptor;
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn BandwidthEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_timestamp_writer(mut self, writer: Arc<dyn TimestampWriter>) -> Self {
        self.timestamp_writer = writer;
        self
    }
}

/// Session-wide statistics
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub session_id: SessionId,
    pub uptime_secs: f64,
    pub playback_rate: f64,
    pub tracks: BTreeMap<TrackType, TrackStats>,
}

/// Streaming session owning one pipeline per track
pub struct StreamSession {
    /// Unique session ID
    id: SessionId,
    config: Arc<PipelineConfig>,
    collab: Collaborators,
    abr: Arc<AbrEngine>,
    sync: Arc<CrossTrackSynchronizer>,
    events: Arc<EventBus>,
    tracks: RwLock<BTreeMap<TrackType, Arc<TrackPipeline>>>,
    playback_rate: RwLock<f64>,
    /// Session start time
    start_time: Instant,
}

impl StreamSession {
    /// Create a session over a validated configuration
    pub fn new(config: PipelineConfig, profiles: ProfileSet, collab: Collaborators) -> Result<Self> {
        config.validate()?;
        let id = SessionId::new();
        let events = Arc::new(EventBus::new(id, 256));
        let sync = Arc::new(CrossTrackSynchronizer::new(
            config.sync.clone(),
            collab.playlist.target_duration(),
            events.clone(),
        ));
        let abr = Arc::new(AbrEngine::new(config.abr.clone(), profiles));

        info!(session_id = %id, live = collab.playlist.is_live(), "Stream session created");
        Ok(Self {
            id,
            config: Arc::new(config),
            collab,
            abr,
            sync,
            events,
            tracks: RwLock::new(BTreeMap::new()),
            playback_rate: RwLock::new(1.0),
            start_time: Instant::now(),
        })
    }

    /// Get session ID
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn abr(&self) -> &AbrEngine {
        &self.abr
    }

    pub fn synchronizer(&self) -> &CrossTrackSynchronizer {
        &self.sync
    }

    /// Subscribe to pipeline events
    pub fn subscribe_events(&self) -> broadcast::Receiver<EventRecord> {
        self.events.subscribe()
    }

    /// Add a track pipeline; video starts at the ABR initial profile
    #[instrument(skip(self))]
    pub async fn add_track(&self, track: TrackType) -> Result<()> {
        let mut tracks = self.tracks.write().await;
        if tracks.contains_key(&track) {
            return Err(Error::AlreadyRunning(track));
        }

        let initial_profile = if track == TrackType::Video {
            self.abr.initial_profile(self.collab.estimator.current_estimate())?
        } else {
            0
        };
        self.sync.register(track).await;

        let pipeline = TrackPipeline::new(
            track,
            self.config.clone(),
            self.abr.clone(),
            self.sync.clone(),
            self.events.clone(),
            self.collab.clone(),
            initial_profile,
        );
        tracks.insert(track, Arc::new(pipeline));
        info!(track = %track, profile = initial_profile, "Track added");
        Ok(())
    }

    async fn pipeline(&self, track: TrackType) -> Result<Arc<TrackPipeline>> {
        self.tracks
            .read()
            .await
            .get(&track)
            .cloned()
            .ok_or(Error::UnknownTrack(track))
    }

    async fn pipelines(&self) -> Vec<Arc<TrackPipeline>> {
        self.tracks.read().await.values().cloned().collect()
    }

    /// Start every track pipeline.
    ///
    /// Every playlist is read first so each track's discontinuities are
    /// known to its siblings before the first fragment is resolved.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub async fn start(&self) -> Result<()> {
        let pipelines = self.pipelines().await;
        for pipeline in &pipelines {
            pipeline.refresh_playlist().await;
        }
        for pipeline in &pipelines {
            pipeline.start().await?;
        }
        info!("Stream session started");
        Ok(())
    }

    /// Stop every pipeline, then release the decryptor
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub async fn stop(&self) {
        for pipeline in self.pipelines().await {
            pipeline.stop().await;
        }
        self.collab.decryptor.release().await;
        info!(uptime_secs = self.start_time.elapsed().as_secs_f64(), "Stream session stopped");
    }

    /// Signal every pipeline to stop without waiting.
    ///
    /// With `immediate` unset, fetching stops but cached fragments are still
    /// delivered.
    pub async fn abort_all(&self, immediate: bool) {
        for pipeline in self.pipelines().await {
            pipeline.abort(immediate).await;
        }
        info!(immediate, "All tracks aborted");
    }

    /// Change the playback rate.
    ///
    /// Running pipelines are stopped, flushed and restarted together. Every
    /// track resumes at the position video reached, so tracks muted during
    /// trick play come back in step with it. The video track is restamped
    /// for trick play while the other tracks stay muted.
    #[instrument(skip(self))]
    pub async fn set_trickplay_rate(&self, rate: f64) -> Result<()> {
        if !rate.is_finite() || rate == 0.0 {
            return Err(Error::InvalidConfig(format!("unsupported playback rate {}", rate)));
        }
        {
            let mut current = self.playback_rate.write().await;
            if *current == rate {
                return Ok(());
            }
            *current = rate;
        }

        let pipelines = self.pipelines().await;
        let mut running = Vec::with_capacity(pipelines.len());
        for pipeline in &pipelines {
            running.push(pipeline.is_running().await);
            pipeline.stop().await;
        }

        let resume_at = match self.pipeline(TrackType::Video).await {
            Ok(video) => video.resume_point(rate).await,
            Err(_) => None,
        };
        for (pipeline, was_running) in pipelines.iter().zip(running) {
            pipeline.set_rate(rate, resume_at).await;
            if was_running {
                pipeline.start().await?;
            }
        }
        info!(rate, resume_at, "Playback rate changed");
        Ok(())
    }

    pub async fn playback_rate(&self) -> f64 {
        *self.playback_rate.read().await
    }

    /// Host-requested video profile change, clamped to the bounds and enabled set
    #[instrument(skip(self))]
    pub async fn notify_profile_changed(&self, index: usize) -> Result<usize> {
        let pipeline = self.pipeline(TrackType::Video).await?;
        let index = self.abr.constrain(index)?;
        pipeline.set_profile(index, ProfileChangeReason::Manual).await;
        Ok(index)
    }

    /// Flush a track and restart it after the host switched its rendition
    #[instrument(skip(self))]
    pub async fn switch_track(&self, track: TrackType) -> Result<()> {
        let pipeline = self.pipeline(track).await?;
        if pipeline.is_running().await {
            pipeline.restart().await?;
        } else {
            let rate = pipeline.playback_rate().await;
            pipeline.set_rate(rate, None).await;
        }
        info!(track = %track, "Track switched");
        Ok(())
    }

    pub async fn set_track_enabled(&self, track: TrackType, enabled: bool) -> Result<()> {
        self.pipeline(track).await?.set_enabled(enabled).await;
        Ok(())
    }

    /// Seconds buffered ahead of the playhead on a track
    pub async fn buffered_duration(&self, track: TrackType) -> Result<f64> {
        Ok(self.pipeline(track).await?.buffered_duration().await)
    }

    /// Most recent health classification of a track
    pub async fn buffer_health(&self, track: TrackType) -> Result<BufferHealth> {
        Ok(self.pipeline(track).await?.buffer_health().await)
    }

    pub async fn current_profile(&self) -> Result<usize> {
        Ok(self.pipeline(TrackType::Video).await?.current_profile().await)
    }

    pub async fn track_stats(&self, track: TrackType) -> Result<TrackStats> {
        Ok(self.pipeline(track).await?.stats().await)
    }

    pub async fn stats(&self) -> SessionStats {
        let mut tracks = BTreeMap::new();
        for pipeline in self.pipelines().await {
            tracks.insert(pipeline.track(), pipeline.stats().await);
        }
        SessionStats {
            session_id: self.id,
            uptime_secs: self.start_time.elapsed().as_secs_f64(),
            playback_rate: self.playback_rate().await,
            tracks,
        }
    }
}

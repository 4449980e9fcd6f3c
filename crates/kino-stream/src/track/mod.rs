//! Per-track streaming pipeline
//!
//! Every track runs four cooperating tasks around its fragment ring:
//! - fetch: resolve, download, decrypt and cache fragments
//! - inject: hand cached fragments to the media sink in order
//! - refresh: re-read live playlists
//! - monitor: sample buffer health and detect stalls

mod fetch;
mod inject;
mod monitor;
mod refresh;
mod state;

pub use state::TrackPipelineState;

use crate::{
    abr::{AbrEngine, AbrInput, BandwidthEstimator, ProfileChangeReason, ProfileSwitch},
    buffer::FragmentBuffer,
    config::PipelineConfig,
    drm::Decryptor,
    events::{EventBus, FatalKind, PipelineEvent},
    health::BufferHealthMonitor,
    isobmff::TimestampWriter,
    net::Downloader,
    playlist::PlaylistResolver,
    restamp::{is_trick_rate, TrickModeRestamper},
    sink::MediaSink,
    sync::CrossTrackSynchronizer,
    types::{BufferHealth, TrackStats, TrackType},
    Error, Result,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// External services a pipeline talks to
#[derive(Clone)]
pub struct Collaborators {
    pub playlist: Arc<dyn PlaylistResolver>,
    pub downloader: Arc<dyn Downloader>,
    pub decryptor: Arc<dyn Decryptor>,
    pub sink: Arc<dyn MediaSink>,
    pub estimator: Arc<dyn BandwidthEstimator>,
    pub timestamp_writer: Arc<dyn TimestampWriter>,
}

/// Cancellation scope of one run of a track's tasks.
///
/// `fetch` is a child of `inject`: an immediate stop releases everything, a
/// graceful one only the producer side.
#[derive(Clone)]
pub(crate) struct RunTokens {
    /// Stops fetch, refresh and monitor
    pub(crate) fetch: CancellationToken,
    pub(crate) inject: CancellationToken,
}

impl RunTokens {
    fn new() -> Self {
        let inject = CancellationToken::new();
        Self {
            fetch: inject.child_token(),
            inject,
        }
    }
}

/// State shared between a pipeline handle and its tasks
pub(crate) struct TrackShared {
    pub(crate) track: TrackType,
    pub(crate) config: Arc<PipelineConfig>,
    pub(crate) buffer: FragmentBuffer,
    pub(crate) state: Mutex<TrackPipelineState>,
    pub(crate) restamper: Mutex<TrickModeRestamper>,
    pub(crate) monitor: Mutex<BufferHealthMonitor>,
    pub(crate) refreshed: Notify,
    pub(crate) abr: Arc<AbrEngine>,
    pub(crate) sync: Arc<CrossTrackSynchronizer>,
    pub(crate) events: Arc<EventBus>,
    pub(crate) collab: Collaborators,
}

impl TrackShared {
    /// Seconds of media delivered but not yet played.
    ///
    /// Falls back to the fetched-but-not-injected duration when the sink does
    /// not report a playback position.
    pub(crate) async fn buffered_duration(&self) -> f64 {
        let (injected_end, fetched, injected) = {
            let state = self.state.lock().await;
            (
                state.injected_end_position,
                state.total_fetched_duration,
                state.total_injected_duration,
            )
        };
        match self.collab.sink.playback_position(self.track) {
            Some(position) => (injected_end - position).max(0.0),
            None => (fetched - injected).max(0.0),
        }
    }

    /// False once the track has fetched and delivered everything
    pub(crate) async fn content_remaining(&self) -> bool {
        let end_of_track = self.state.lock().await.end_of_track;
        !end_of_track || self.buffer.occupied().await > 0
    }

    pub(crate) async fn playback_rate(&self) -> f64 {
        self.state.lock().await.playback_rate
    }

    /// Emit the track's fatal event (once) and stop its loops
    pub(crate) async fn report_fatal(&self, run: &RunTokens, kind: FatalKind, error: Error) {
        {
            let mut state = self.state.lock().await;
            if state.fatal_reported {
                return;
            }
            state.fatal_reported = true;
        }
        self.events.emit(PipelineEvent::Fatal {
            track: self.track,
            kind,
            code: error.error_code().to_string(),
            message: error.to_string(),
        });
        run.inject.cancel();
        self.sync.set_injection_aborted(self.track, true).await;
    }

    /// Apply a profile change and announce it
    pub(crate) async fn switch_profile(&self, switch: ProfileSwitch) {
        {
            let mut state = self.state.lock().await;
            if state.current_profile_index == switch.to {
                return;
            }
            state.current_profile_index = switch.to;
            state.init_pending = true;
        }
        let bandwidth = self
            .abr
            .profiles()
            .get(switch.to)
            .map(|p| p.bandwidth)
            .unwrap_or(0);
        info!(
            track = %self.track,
            from = switch.from,
            to = switch.to,
            bandwidth,
            reason = ?switch.reason,
            "Profile changed"
        );
        self.events.emit(PipelineEvent::ProfileChanged {
            from: switch.from,
            to: switch.to,
            bandwidth,
            reason: switch.reason,
        });
    }

    /// Run a steady-state ABR decision for the video track
    pub(crate) async fn evaluate_abr(&self, stalled: bool) {
        if self.track != TrackType::Video || !self.abr.is_enabled() {
            return;
        }
        let buffered = self.buffered_duration().await;
        let input = {
            let state = self.state.lock().await;
            if is_trick_rate(state.playback_rate) {
                return;
            }
            AbrInput {
                current_profile: state.current_profile_index,
                bandwidth_estimate: self.collab.estimator.current_estimate(),
                health: state.buffer_health,
                health_run_length: state.health_run_length,
                buffered,
                stalled,
            }
        };
        match self.abr.decide(&input) {
            Ok(Some(switch)) => self.switch_profile(switch).await,
            Ok(None) => {}
            Err(err) => warn!(track = %self.track, error = %err, "ABR decision failed"),
        }
    }

    /// Re-read the playlist and publish its discontinuities
    pub(crate) async fn refresh_playlist(&self) {
        match self.collab.playlist.refresh(self.track).await {
            Ok(update) => {
                debug!(
                    track = %self.track,
                    discontinuities = update.discontinuities.len(),
                    culled = update.culled_seconds,
                    ended = update.ended,
                    "Playlist refreshed"
                );
                self.sync
                    .record_marks(self.track, update.discontinuities, update.culled_seconds)
                    .await;
                self.refreshed.notify_waiters();
            }
            Err(err) => warn!(track = %self.track, error = %err, "Playlist refresh failed"),
        }
    }

    /// Wait for the next playlist refresh, bounded by the refresh wait
    pub(crate) async fn wait_for_refresh(&self, cancel: &CancellationToken) {
        tokio::select! {
            _ = self.refreshed.notified() => {}
            _ = tokio::time::sleep(self.config.fetch.refresh_wait()) => {}
            _ = cancel.cancelled() => {}
        }
    }

    /// Interval between live playlist refreshes
    pub(crate) async fn refresh_interval(&self) -> Duration {
        let target = self.collab.playlist.target_duration();
        let interval = if target > 0.0 {
            Duration::from_secs_f64(target)
        } else {
            Duration::from_millis(self.config.fetch.default_refresh_interval_ms)
        };
        if self.state.lock().await.buffer_health == BufferHealth::Red {
            interval / 2
        } else {
            interval
        }
    }
}

struct TrackTasks {
    run: RunTokens,
    inject: JoinHandle<()>,
    fetch: JoinHandle<()>,
    refresh: Option<JoinHandle<()>>,
    monitor: JoinHandle<()>,
}

/// Handle to one track's pipeline
pub struct TrackPipeline {
    shared: Arc<TrackShared>,
    tasks: Mutex<Option<TrackTasks>>,
}

impl TrackPipeline {
    pub(crate) fn new(
        track: TrackType,
        config: Arc<PipelineConfig>,
        abr: Arc<AbrEngine>,
        sync: Arc<CrossTrackSynchronizer>,
        events: Arc<EventBus>,
        collab: Collaborators,
        initial_profile: usize,
    ) -> Self {
        let shared = TrackShared {
            track,
            buffer: FragmentBuffer::new(track, config.buffer.capacity),
            state: Mutex::new(TrackPipelineState::new(initial_profile)),
            restamper: Mutex::new(TrickModeRestamper::new(
                config.trickplay.fps,
                config.trickplay.timescale,
            )),
            monitor: Mutex::new(BufferHealthMonitor::new(config.health.clone())),
            refreshed: Notify::new(),
            config,
            abr,
            sync,
            events,
            collab,
        };
        Self {
            shared: Arc::new(shared),
            tasks: Mutex::new(None),
        }
    }

    pub fn track(&self) -> TrackType {
        self.shared.track
    }

    pub async fn is_running(&self) -> bool {
        self.tasks.lock().await.is_some()
    }

    /// Spawn the track's tasks under a fresh cancellation scope
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_some() {
            return Err(Error::AlreadyRunning(self.shared.track));
        }

        let shared = &self.shared;
        shared.sync.set_injection_aborted(shared.track, false).await;
        shared.sync.set_end_of_track(shared.track, false).await;

        let run = RunTokens::new();
        let refresh = shared
            .collab
            .playlist
            .is_live()
            .then(|| tokio::spawn(refresh::run(shared.clone(), run.fetch.clone())));
        *tasks = Some(TrackTasks {
            inject: tokio::spawn(inject::run(shared.clone(), run.clone())),
            fetch: tokio::spawn(fetch::run(shared.clone(), run.clone())),
            refresh,
            monitor: tokio::spawn(monitor::run(shared.clone(), run.fetch.clone())),
            run,
        });

        info!(track = %shared.track, live = shared.collab.playlist.is_live(), "Track pipeline started");
        Ok(())
    }

    /// Signal the loops to stop.
    ///
    /// `immediate` releases both loops at once; otherwise fetching stops and
    /// the inject loop drains what is already cached.
    pub async fn abort(&self, immediate: bool) {
        let run = self.tasks.lock().await.as_ref().map(|tasks| tasks.run.clone());
        if let Some(run) = run {
            self.cancel_run(&run, immediate).await;
        }
    }

    async fn cancel_run(&self, run: &RunTokens, immediate: bool) {
        let shared = &self.shared;
        run.fetch.cancel();
        if immediate {
            run.inject.cancel();
            shared.sync.set_injection_aborted(shared.track, true).await;
        } else {
            shared.buffer.mark_end_of_stream().await;
        }
        debug!(track = %shared.track, immediate, "Track pipeline aborted");
    }

    /// Re-read the playlist so sibling tracks see this track's discontinuities
    pub(crate) async fn refresh_playlist(&self) {
        self.shared.refresh_playlist().await;
    }

    /// Stop and join every task: inject, fetch, refresh, then monitor
    pub async fn stop(&self) {
        let Some(tasks) = self.tasks.lock().await.take() else {
            return;
        };
        let track = self.shared.track;
        self.cancel_run(&tasks.run, true).await;

        let ordered = [
            ("inject", Some(tasks.inject)),
            ("fetch", Some(tasks.fetch)),
            ("refresh", tasks.refresh),
            ("monitor", Some(tasks.monitor)),
        ];
        for (name, handle) in ordered {
            let Some(handle) = handle else { continue };
            if let Err(err) = handle.await {
                warn!(track = %track, task = name, error = %err, "Track task ended abnormally");
            }
        }
        info!(track = %track, "Track pipeline stopped");
    }

    /// Flush and restart at the current rate, e.g. after a track switch.
    ///
    /// Fetching resumes after the last delivered fragment.
    pub async fn restart(&self) -> Result<()> {
        self.stop().await;
        let rate = self.shared.playback_rate().await;
        self.set_rate(rate, None).await;
        self.shared.refresh_playlist().await;
        self.start().await
    }

    /// Flush a stopped pipeline and apply a new playback rate.
    ///
    /// With `resume_at` the next run starts at the fragment covering that
    /// position; the trick play timeline starts over either way.
    pub async fn set_rate(&self, rate: f64, resume_at: Option<f64>) {
        self.shared.buffer.flush().await;
        {
            let mut state = self.shared.state.lock().await;
            state.playback_rate = rate;
            state.reset_for_restart(resume_at);
        }
        self.shared.restamper.lock().await.reset();
        self.shared.monitor.lock().await.reset();
    }

    /// Host-requested profile change
    pub async fn set_profile(&self, index: usize, reason: ProfileChangeReason) {
        let from = self.shared.state.lock().await.current_profile_index;
        self.shared
            .switch_profile(ProfileSwitch { from, to: index, reason })
            .await;
    }

    pub async fn set_enabled(&self, enabled: bool) {
        self.shared.state.lock().await.enabled = enabled;
        self.shared.sync.set_track_enabled(self.shared.track, enabled).await;
    }

    pub async fn buffered_duration(&self) -> f64 {
        self.shared.buffered_duration().await
    }

    pub async fn buffer_health(&self) -> BufferHealth {
        self.shared.state.lock().await.buffer_health
    }

    pub async fn playback_rate(&self) -> f64 {
        self.shared.playback_rate().await
    }

    pub async fn current_profile(&self) -> usize {
        self.shared.state.lock().await.current_profile_index
    }

    /// Where a switch to `rate` should resume, from this track's delivery progress
    pub async fn resume_point(&self, rate: f64) -> Option<f64> {
        self.shared.state.lock().await.resume_point(rate)
    }

    pub async fn stats(&self) -> TrackStats {
        self.shared.state.lock().await.stats()
    }
}

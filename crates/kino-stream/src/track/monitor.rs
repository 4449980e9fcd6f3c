//! Buffer health sampling loop

use super::TrackShared;
use crate::{events::PipelineEvent, types::TrackType};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub(super) async fn run(shared: Arc<TrackShared>, cancel: CancellationToken) {
    let track = shared.track;
    let config = &shared.config.health;

    tokio::select! {
        _ = tokio::time::sleep(config.initial_delay()) => {}
        _ = cancel.cancelled() => return,
    }

    let mut ticker = tokio::time::interval(config.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => break,
        }

        let buffered = shared.buffered_duration().await;
        let content_remaining = shared.content_remaining().await;
        let sample = shared
            .monitor
            .lock()
            .await
            .record(buffered, content_remaining, Instant::now());

        {
            let mut state = shared.state.lock().await;
            state.buffer_health = sample.health;
            state.health_run_length = sample.run_length;
        }

        if let Some(from) = sample.changed_from {
            shared.events.emit(PipelineEvent::BufferHealthChanged {
                track,
                from,
                to: sample.health,
                buffered,
            });
        }

        if sample.stall_detected {
            shared.events.emit(PipelineEvent::PlaybackStalled {
                track,
                buffered,
                red_for_ms: sample.red_for.as_millis() as u64,
            });
            if track == TrackType::Video {
                shared.evaluate_abr(true).await;
            }
        }
    }

    debug!(track = %track, "Buffer monitor exited");
}

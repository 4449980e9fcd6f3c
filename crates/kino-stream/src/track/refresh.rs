//! Live playlist refresh loop

use super::TrackShared;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub(super) async fn run(shared: Arc<TrackShared>, cancel: CancellationToken) {
    info!(track = %shared.track, "Playlist refresh loop started");

    loop {
        let interval = shared.refresh_interval().await;
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => break,
        }
        shared.refresh_playlist().await;

        if shared.state.lock().await.end_of_track {
            break;
        }
    }

    debug!(track = %shared.track, "Playlist refresh loop exited");
}

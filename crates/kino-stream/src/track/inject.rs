//! Inject loop: hand cached fragments to the media sink in order

use super::{RunTokens, TrackShared};
use crate::{
    events::{FatalKind, PipelineEvent},
    restamp::is_trick_rate,
    sync::{CatchupOutcome, RendezvousOutcome},
    types::{SinkSample, TrackType},
    Error,
};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Media-specific hand-off behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Injectable {
    Video,
    Audio,
    Subtitle,
    AuxAudio,
}

impl From<TrackType> for Injectable {
    fn from(track: TrackType) -> Self {
        match track {
            TrackType::Video => Injectable::Video,
            TrackType::Audio => Injectable::Audio,
            TrackType::Subtitle => Injectable::Subtitle,
            TrackType::AuxAudio => Injectable::AuxAudio,
        }
    }
}

impl Injectable {
    /// Timestamps are rewritten at trick rates
    pub(crate) fn restamps(&self, trick: bool) -> bool {
        trick && *self == Injectable::Video
    }

    /// Fragments reach the sink; only video is presented during trick play
    pub(crate) fn delivers(&self, trick: bool) -> bool {
        !trick || *self == Injectable::Video
    }

    /// Injection is gated on video progress
    pub(crate) fn follows_video(&self, trick: bool) -> bool {
        !trick && *self != Injectable::Video
    }
}

pub(super) async fn run(shared: Arc<TrackShared>, run: RunTokens) {
    let track = shared.track;
    let cancel = &run.inject;
    let injectable = Injectable::from(track);
    let wait = shared.config.buffer.wait_timeout();
    info!(track = %track, "Inject loop started");

    loop {
        let mut slot = match shared.buffer.acquire_read_slot(wait, cancel).await {
            Ok(slot) => slot,
            Err(Error::WaitTimeout { .. }) => continue,
            Err(Error::EndOfStream { .. }) => {
                finish_injection(&shared).await;
                break;
            }
            Err(_) => break,
        };

        let rate = shared.playback_rate().await;
        let trick = is_trick_rate(rate);

        if slot.is_discontinuity && slot.discontinuity_paired && !trick {
            let outcome = shared
                .sync
                .enter_discontinuity(track, slot.position, cancel)
                .await;
            if outcome == RendezvousOutcome::Aborted {
                break;
            }
        }

        let sequence = slot.sequence;
        let is_init = slot.is_init;
        let source_position = slot.position;
        let source_duration = slot.duration;

        if injectable.restamps(trick) {
            let mut restamper = shared.restamper.lock().await;
            if let Err(err) = restamper.restamp(&mut slot, rate, shared.collab.timestamp_writer.as_ref()) {
                warn!(track = %track, sequence, error = %err, "Restamp failed, delivering source timing");
            }
        }

        if injectable.delivers(trick) {
            let pts = slot.position + slot.pts_offset;
            let sample = SinkSample {
                track,
                media_type: slot.media_type,
                pts,
                dts: pts,
                duration: slot.duration,
                is_init,
                is_discontinuity: slot.is_discontinuity,
                payload: slot.payload.split().freeze(),
            };
            let pushed = tokio::select! {
                result = shared.collab.sink.push(sample) => result,
                _ = cancel.cancelled() => break,
            };
            if let Err(err) = pushed {
                warn!(track = %track, sequence, error = %err, "Sink rejected sample");
                shared.report_fatal(&run, FatalKind::Sink, err).await;
                break;
            }
        }

        let output_position = slot.position;
        let output_duration = slot.duration;
        if let Err(err) = slot.commit().await {
            shared.report_fatal(&run, FatalKind::Sequencing, err).await;
            break;
        }

        if !is_init {
            {
                let mut state = shared.state.lock().await;
                state.fragments_injected += 1;
                state.total_injected_duration += output_duration;
                state.last_injected_position = source_position;
                state.last_source_end_position = source_position + source_duration;
                state.injected_end_position = output_position + output_duration;
                state.last_injected_sequence = Some(sequence);
            }
            shared
                .sync
                .report_injected(track, source_position, source_duration)
                .await;
            trace!(track = %track, sequence, position = source_position, "Fragment injected");
        }

        if injectable.follows_video(trick)
            && shared.sync.wait_for_video_catchup(track, cancel).await == CatchupOutcome::Aborted
        {
            break;
        }
    }

    debug!(track = %track, "Inject loop exited");
}

async fn finish_injection(shared: &TrackShared) {
    let track = shared.track;
    shared.collab.sink.end_of_stream(track).await;
    shared.sync.set_end_of_track(track, true).await;
    shared.events.emit(PipelineEvent::EndOfStream { track });
    info!(track = %track, "End of stream delivered");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_injectable_behaviour() {
        let video = Injectable::from(TrackType::Video);
        let audio = Injectable::from(TrackType::Audio);
        let subtitle = Injectable::from(TrackType::Subtitle);

        assert!(video.restamps(true));
        assert!(!video.restamps(false));
        assert!(!audio.restamps(true));

        assert!(video.delivers(true));
        assert!(!audio.delivers(true));
        assert!(!subtitle.delivers(true));
        assert!(audio.delivers(false));

        assert!(!video.follows_video(false));
        assert!(audio.follows_video(false));
        assert!(subtitle.follows_video(false));
        assert!(!audio.follows_video(true));
        assert_eq!(Injectable::from(TrackType::AuxAudio), Injectable::AuxAudio);
    }
}

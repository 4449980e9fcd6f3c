//! Fetch loop: resolve, download, decrypt and cache fragments

use super::{RunTokens, TrackShared};
use crate::{
    abr::{FailureAction, FailureInput, ProfileChangeReason, ProfileSwitch},
    drm::DecryptError,
    events::FatalKind,
    net::DownloadError,
    playlist::{FragmentLookup, PlaylistKind},
    restamp::is_trick_rate,
    sync::DiscontinuityMatch,
    types::{DiscontinuityMark, FragmentDescriptor, TrackType},
    Error,
};
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Substituted for subtitle fragments the server does not have
const EMPTY_WEBVTT: &[u8] = b"WEBVTT\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchOutcome {
    Cached,
    /// Fragment dropped; move to the next one
    Skipped,
    /// Fetch the same fragment again (profile was lowered)
    Retry,
    Stop,
}

pub(super) async fn run(shared: Arc<TrackShared>, run: RunTokens) {
    let track = shared.track;
    let cancel = &run.fetch;
    let playlist = shared.collab.playlist.clone();
    let rate = shared.playback_rate().await;

    if track != TrackType::Video && is_trick_rate(rate) {
        info!(track = %track, rate, "Track muted during trick play");
        cancel.cancelled().await;
        return;
    }

    let first = match playlist.first_sequence(track).await {
        Ok(first) => first,
        Err(err) => {
            warn!(track = %track, error = %err, "Playlist has no sequence for track");
            return;
        }
    };
    let rewind = rate < 0.0;
    let mut sequence = start_sequence(&shared, first, rewind).await;
    let kind = playlist.kind();
    info!(track = %track, sequence, rewind, "Fetch loop started");

    while !cancel.is_cancelled() {
        if take_init_pending(&shared).await {
            let profile = shared.state.lock().await.current_profile_index;
            match playlist.init_fragment(track, profile).await {
                Ok(Some(init)) => {
                    let outcome = fetch_fragment(&shared, &run, &init, kind).await;
                    if outcome != FetchOutcome::Cached {
                        shared.state.lock().await.init_pending = true;
                    }
                    match outcome {
                        FetchOutcome::Cached | FetchOutcome::Skipped => {}
                        FetchOutcome::Retry => continue,
                        FetchOutcome::Stop => break,
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(track = %track, error = %err, "Init fragment lookup failed");
                    shared.state.lock().await.init_pending = true;
                    shared.wait_for_refresh(cancel).await;
                    continue;
                }
            }
        }

        let profile = shared.state.lock().await.current_profile_index;
        let lookup = tokio::select! {
            lookup = playlist.fragment(track, sequence, profile) => lookup,
            _ = cancel.cancelled() => break,
        };
        let descriptor = match lookup {
            Ok(FragmentLookup::Available(descriptor)) => descriptor,
            Ok(FragmentLookup::NotYetAvailable) => {
                shared.wait_for_refresh(cancel).await;
                continue;
            }
            Ok(FragmentLookup::EndOfTrack) => {
                finish_track(&shared).await;
                break;
            }
            Err(err) => {
                warn!(track = %track, sequence, error = %err, "Fragment lookup failed");
                shared.wait_for_refresh(cancel).await;
                continue;
            }
        };
        sequence = descriptor.sequence;

        match fetch_fragment(&shared, &run, &descriptor, kind).await {
            FetchOutcome::Cached | FetchOutcome::Skipped => {
                let next = if rewind {
                    (sequence > first).then(|| sequence - 1)
                } else {
                    Some(sequence + 1)
                };
                match next {
                    Some(next) => sequence = next,
                    None => {
                        finish_track(&shared).await;
                        break;
                    }
                }
            }
            FetchOutcome::Retry => {}
            FetchOutcome::Stop => break,
        }
    }

    shared.state.lock().await.resume_sequence = Some(sequence);
    debug!(track = %track, sequence, "Fetch loop exited");
}

/// Sequence a run starts at: the fragment covering a requested resume
/// position, else the one after the last delivered fragment, else the head
async fn start_sequence(shared: &TrackShared, first: u64, rewind: bool) -> u64 {
    let (position, resume) = {
        let mut state = shared.state.lock().await;
        (state.resume_position.take(), state.resume_sequence)
    };
    if let Some(position) = position {
        match shared.collab.playlist.sequence_at(shared.track, position).await {
            // Rewind resumes before the fragment that was on screen
            Ok(Some(covering)) if rewind => return covering.saturating_sub(1).max(first),
            Ok(Some(covering)) => return covering,
            Ok(None) => {}
            Err(err) => warn!(track = %shared.track, position, error = %err, "Resume position lookup failed"),
        }
    }
    resume.unwrap_or(first)
}

async fn take_init_pending(shared: &TrackShared) -> bool {
    std::mem::take(&mut shared.state.lock().await.init_pending)
}

async fn finish_track(shared: &TrackShared) {
    shared.state.lock().await.end_of_track = true;
    shared.buffer.mark_end_of_stream().await;
    info!(track = %shared.track, "All fragments fetched");
}

#[instrument(skip_all, fields(track = %shared.track, sequence = descriptor.sequence, init = descriptor.is_init))]
async fn fetch_fragment(
    shared: &TrackShared,
    run: &RunTokens,
    descriptor: &FragmentDescriptor,
    kind: PlaylistKind,
) -> FetchOutcome {
    let track = shared.track;
    let cancel = &run.fetch;

    let paired = if descriptor.is_discontinuity && !descriptor.is_init {
        let mark = DiscontinuityMark {
            track,
            position: descriptor.position,
            source_date_time: descriptor.source_date_time,
            culled_seconds: 0.0,
        };
        match shared.sync.resolve_discontinuity(&mark, kind, cancel).await {
            DiscontinuityMatch::Matched { .. } => true,
            DiscontinuityMatch::Bypassed | DiscontinuityMatch::Unpaired => false,
            DiscontinuityMatch::Aborted => return FetchOutcome::Stop,
        }
    } else {
        false
    };

    let mut slot = loop {
        match shared.buffer.acquire_write_slot(shared.config.buffer.wait_timeout(), cancel).await {
            Ok(slot) => break slot,
            Err(Error::WaitTimeout { .. }) => continue,
            Err(_) => return FetchOutcome::Stop,
        }
    };

    let downloaded = tokio::select! {
        result = shared.collab.downloader.fetch(descriptor) => result,
        _ = cancel.cancelled() => return FetchOutcome::Stop,
    };
    let (bytes, download_time) = match downloaded {
        Ok(downloaded) => (downloaded.bytes, downloaded.download_time),
        Err(err) if track == TrackType::Subtitle && err.is_not_found() => {
            debug!("Subtitle fragment missing, substituting an empty cue list");
            (Bytes::from_static(EMPTY_WEBVTT), Duration::ZERO)
        }
        Err(err) => {
            drop(slot);
            return on_download_failure(shared, run, descriptor, err).await;
        }
    };

    let bytes = if descriptor.encrypted {
        let decrypted = tokio::select! {
            result = shared.collab.decryptor.decrypt(bytes, descriptor) => result,
            _ = cancel.cancelled() => return FetchOutcome::Stop,
        };
        match decrypted {
            Ok(clear) => clear,
            Err(DecryptError::KeyAcquisitionTimeout) => {
                drop(slot);
                shared.report_fatal(run, FatalKind::LicenseTimeout, Error::LicenseTimeout).await;
                return FetchOutcome::Stop;
            }
            Err(DecryptError::Failure(message)) => {
                drop(slot);
                return on_decrypt_failure(shared, run, descriptor, message).await;
            }
        }
    } else {
        bytes
    };

    let trick = is_trick_rate(shared.playback_rate().await);
    slot.payload.extend_from_slice(&bytes);
    slot.position = descriptor.position;
    slot.duration = descriptor.duration;
    slot.is_init = descriptor.is_init;
    slot.is_discontinuity = descriptor.is_discontinuity;
    slot.discontinuity_paired = paired;
    slot.profile_index = descriptor.profile_index;
    slot.media_type = track.media_type(trick);
    slot.download_started = Instant::now().checked_sub(download_time);
    slot.timescale = descriptor.timescale;
    slot.sequence = descriptor.sequence;
    slot.source_date_time = descriptor.source_date_time;

    if let Err(err) = slot.commit().await {
        shared.report_fatal(run, FatalKind::Sequencing, err).await;
        return FetchOutcome::Stop;
    }

    if track != TrackType::Subtitle && download_time > Duration::ZERO {
        shared.collab.estimator.record(bytes.len(), download_time);
    }
    {
        let mut state = shared.state.lock().await;
        if !descriptor.is_init {
            state.total_fetched_duration += descriptor.duration;
        }
        state.fragments_fetched += 1;
        state.consecutive_download_failures = 0;
        state.consecutive_decrypt_failures = 0;
        state.rampdown_count = 0;
        state.last_fetch_at = Some(Instant::now());
    }
    debug!(bytes = bytes.len(), position = descriptor.position, "Fragment cached");

    if !descriptor.is_init {
        shared.evaluate_abr(false).await;
    }
    FetchOutcome::Cached
}

async fn on_download_failure(
    shared: &TrackShared,
    run: &RunTokens,
    descriptor: &FragmentDescriptor,
    err: DownloadError,
) -> FetchOutcome {
    let track = shared.track;
    let buffered = shared.buffered_duration().await;
    let trick = is_trick_rate(shared.playback_rate().await);

    let mut state = shared.state.lock().await;
    state.consecutive_download_failures += 1;
    let failures = state.consecutive_download_failures;
    warn!(
        track = %track,
        sequence = descriptor.sequence,
        url = %descriptor.uri,
        error = %err,
        failures,
        "Fragment download failed"
    );

    // Subtitles never take playback down
    if track != TrackType::Subtitle && failures >= shared.config.fetch.download_failure_threshold {
        drop(state);
        shared
            .report_fatal(run, FatalKind::PersistentDownload, Error::PersistentDownload { track, failures })
            .await;
        return FetchOutcome::Stop;
    }

    // Media cannot be decoded without its init fragment
    let init_lost = |reason: String| Error::InitFragment {
        track,
        profile: descriptor.profile_index,
        reason,
    };
    if descriptor.is_init && track == TrackType::Subtitle {
        return FetchOutcome::Skipped;
    }
    if track != TrackType::Video || trick {
        if descriptor.is_init {
            drop(state);
            shared
                .report_fatal(run, FatalKind::InitFragmentDownload, init_lost(err.to_string()))
                .await;
            return FetchOutcome::Stop;
        }
        return FetchOutcome::Skipped;
    }

    let current = state.current_profile_index;
    let action = shared.abr.on_fragment_failure(&FailureInput {
        current_profile: current,
        error: &err,
        bandwidth_estimate: shared.collab.estimator.current_estimate(),
        health: state.buffer_health,
        buffered,
        rampdown_count: state.rampdown_count,
    });
    match action {
        Ok(FailureAction::RampDown { to }) => {
            state.rampdown_count += 1;
            drop(state);
            shared
                .switch_profile(ProfileSwitch {
                    from: current,
                    to,
                    reason: ProfileChangeReason::RampDown,
                })
                .await;
            FetchOutcome::Retry
        }
        Ok(FailureAction::Skip { reason }) if descriptor.is_init => {
            drop(state);
            let reason = format!("{} ({:?})", err, reason);
            shared
                .report_fatal(run, FatalKind::InitFragmentDownload, init_lost(reason))
                .await;
            FetchOutcome::Stop
        }
        Ok(FailureAction::Skip { reason }) => {
            debug!(track = %track, sequence = descriptor.sequence, reason = ?reason, "Skipping failed fragment");
            FetchOutcome::Skipped
        }
        Err(abr_err) if descriptor.is_init => {
            drop(state);
            shared
                .report_fatal(run, FatalKind::InitFragmentDownload, init_lost(abr_err.to_string()))
                .await;
            FetchOutcome::Stop
        }
        Err(abr_err) => {
            warn!(track = %track, error = %abr_err, "No profile to ramp down to");
            FetchOutcome::Skipped
        }
    }
}

async fn on_decrypt_failure(
    shared: &TrackShared,
    run: &RunTokens,
    descriptor: &FragmentDescriptor,
    message: String,
) -> FetchOutcome {
    let track = shared.track;
    let failures = {
        let mut state = shared.state.lock().await;
        state.consecutive_decrypt_failures += 1;
        state.consecutive_decrypt_failures
    };
    warn!(track = %track, sequence = descriptor.sequence, error = %message, failures, "Fragment decryption failed");

    if failures >= shared.config.fetch.decrypt_failure_threshold {
        shared
            .report_fatal(run, FatalKind::DecryptFailure, Error::Decryption(message))
            .await;
        return FetchOutcome::Stop;
    }
    FetchOutcome::Skipped
}

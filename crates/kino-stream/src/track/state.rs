//! Mutable per-track pipeline state

use crate::types::{BufferHealth, TrackStats};
use std::time::Instant;

/// Counters and flags owned by one track pipeline.
///
/// Guarded by the track's own lock; sibling tracks only ever see the
/// progress published through the synchronizer.
#[derive(Debug, Clone)]
pub struct TrackPipelineState {
    pub enabled: bool,
    pub playback_rate: f64,
    pub current_profile_index: usize,
    /// An init fragment must precede the next media fragment
    pub init_pending: bool,

    pub total_fetched_duration: f64,
    pub total_injected_duration: f64,
    pub fragments_fetched: u64,
    pub fragments_injected: u64,
    pub last_injected_position: f64,
    /// Source end (position + duration) of the last injected media fragment
    pub last_source_end_position: f64,
    /// End of the last injected media fragment in track time
    pub injected_end_position: f64,
    pub last_injected_sequence: Option<u64>,
    /// Sequence the fetch loop resumes at after a restart
    pub resume_sequence: Option<u64>,
    /// Presentation position the fetch loop resumes at; wins over `resume_sequence`
    pub resume_position: Option<f64>,
    pub last_fetch_at: Option<Instant>,

    pub buffer_health: BufferHealth,
    pub health_run_length: u32,

    pub consecutive_download_failures: u32,
    pub consecutive_decrypt_failures: u32,
    pub rampdown_count: u32,
    /// A fatal event has already been emitted for this track
    pub fatal_reported: bool,
    pub end_of_track: bool,
}

impl TrackPipelineState {
    pub fn new(profile: usize) -> Self {
        Self {
            enabled: true,
            playback_rate: 1.0,
            current_profile_index: profile,
            init_pending: true,
            total_fetched_duration: 0.0,
            total_injected_duration: 0.0,
            fragments_fetched: 0,
            fragments_injected: 0,
            last_injected_position: 0.0,
            last_source_end_position: 0.0,
            injected_end_position: 0.0,
            last_injected_sequence: None,
            resume_sequence: None,
            resume_position: None,
            last_fetch_at: None,
            buffer_health: BufferHealth::Green,
            health_run_length: 0,
            consecutive_download_failures: 0,
            consecutive_decrypt_failures: 0,
            rampdown_count: 0,
            fatal_reported: false,
            end_of_track: false,
        }
    }

    /// Position every track should resume at when switching to `rate`.
    ///
    /// Forward play continues after the last delivered fragment, rewind from
    /// its start. `None` until something was delivered.
    pub fn resume_point(&self, rate: f64) -> Option<f64> {
        self.last_injected_sequence.map(|_| {
            if rate < 0.0 {
                self.last_injected_position
            } else {
                self.last_source_end_position
            }
        })
    }

    /// Prepare for a restart after the ring was flushed.
    ///
    /// Fetching resumes at `resume_at` when given, otherwise right after the
    /// last delivered fragment. A new init fragment is required either way.
    pub fn reset_for_restart(&mut self, resume_at: Option<f64>) {
        self.resume_position = resume_at;
        self.resume_sequence = self.last_injected_sequence.map(|s| {
            if self.playback_rate < 0.0 {
                s.saturating_sub(1)
            } else {
                s + 1
            }
        });
        self.total_fetched_duration = self.total_injected_duration;
        self.init_pending = true;
        self.consecutive_download_failures = 0;
        self.consecutive_decrypt_failures = 0;
        self.rampdown_count = 0;
        self.fatal_reported = false;
        self.end_of_track = false;
        self.buffer_health = BufferHealth::Green;
        self.health_run_length = 0;
    }

    pub fn stats(&self) -> TrackStats {
        TrackStats {
            fragments_fetched: self.fragments_fetched,
            fragments_injected: self.fragments_injected,
            total_fetched_duration: self.total_fetched_duration,
            total_injected_duration: self.total_injected_duration,
            last_injected_position: self.last_injected_position,
            current_profile_index: self.current_profile_index,
            consecutive_download_failures: self.consecutive_download_failures,
            consecutive_decrypt_failures: self.consecutive_decrypt_failures,
            rampdown_count: self.rampdown_count,
            end_of_track: self.end_of_track,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_resumes_after_last_injected() {
        let mut state = TrackPipelineState::new(2);
        state.last_injected_sequence = Some(7);
        state.total_fetched_duration = 20.0;
        state.total_injected_duration = 14.0;
        state.consecutive_download_failures = 3;
        state.init_pending = false;

        state.reset_for_restart(None);
        assert_eq!(state.resume_sequence, Some(8));
        assert_eq!(state.resume_position, None);
        assert_eq!(state.total_fetched_duration, 14.0);
        assert_eq!(state.consecutive_download_failures, 0);
        assert!(state.init_pending);

        state.playback_rate = -4.0;
        state.reset_for_restart(None);
        assert_eq!(state.resume_sequence, Some(6));
    }

    #[test]
    fn test_resume_point_follows_direction() {
        let mut state = TrackPipelineState::new(0);
        assert_eq!(state.resume_point(1.0), None);

        state.last_injected_sequence = Some(11);
        state.last_injected_position = 22.0;
        state.last_source_end_position = 24.0;
        assert_eq!(state.resume_point(1.0), Some(24.0));
        assert_eq!(state.resume_point(16.0), Some(24.0));
        assert_eq!(state.resume_point(-8.0), Some(22.0));

        state.reset_for_restart(Some(24.0));
        assert_eq!(state.resume_position, Some(24.0));
    }
}

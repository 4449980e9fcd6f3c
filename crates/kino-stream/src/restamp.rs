//! Trick play timestamp restamping
//!
//! I-frame fragments fetched for fast-forward/rewind carry source timestamps
//! that are far apart. Restamping rewrites them into a continuous, monotonic
//! output timeline played at the trick frame rate.

use crate::{buffer::Fragment, isobmff::TimestampWriter, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Continuity state of the restamper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrickmodeState {
    #[default]
    Undefined,
    FirstFragment,
    Discontinuity,
    Steady,
}

/// Output timing of one restamped fragment
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Restamped {
    pub position: f64,
    pub duration: f64,
}

/// Rates that are restamped: fast forward above 1x and any rewind
pub fn is_trick_rate(rate: f64) -> bool {
    rate > 1.0 || rate < 0.0
}

#[derive(Debug, Clone)]
pub struct TrickModeRestamper {
    fps: f64,
    timescale: u32,
    state: TrickmodeState,
    last_source_position: f64,
    restamped_position: f64,
    restamped_duration: f64,
}

impl TrickModeRestamper {
    pub fn new(fps: u32, timescale: u32) -> Self {
        Self {
            fps: f64::from(fps.max(1)),
            timescale,
            state: TrickmodeState::Undefined,
            last_source_position: 0.0,
            restamped_position: 0.0,
            restamped_duration: 0.0,
        }
    }

    pub fn state(&self) -> TrickmodeState {
        self.state
    }

    /// Start a fresh output timeline
    pub fn reset(&mut self) {
        self.state = TrickmodeState::Undefined;
        self.last_source_position = 0.0;
        self.restamped_position = 0.0;
        self.restamped_duration = 0.0;
    }

    /// Compute the output timing of the next fragment.
    ///
    /// Returns `None` for init fragments and for rates that are not restamped.
    pub fn next_timing(
        &mut self,
        position: f64,
        duration: f64,
        is_init: bool,
        is_discontinuity: bool,
        rate: f64,
    ) -> Option<Restamped> {
        if !is_trick_rate(rate) {
            warn!(rate, "Restamping not supported for rate");
            return None;
        }
        let speed = rate.abs();

        if is_init {
            if is_discontinuity {
                self.restamped_position += self.restamped_duration;
                self.state = TrickmodeState::Discontinuity;
            } else if self.state == TrickmodeState::Undefined {
                self.state = TrickmodeState::FirstFragment;
            }
            return None;
        }

        match self.state {
            TrickmodeState::Undefined | TrickmodeState::FirstFragment => {
                self.restamped_duration = (duration / speed).max(1.0 / self.fps);
            }
            TrickmodeState::Discontinuity => {
                // Duration carried over, position already advanced by the init
            }
            TrickmodeState::Steady if is_discontinuity => {
                self.restamped_position += self.restamped_duration;
            }
            TrickmodeState::Steady => {
                let delta = (position - self.last_source_position).abs();
                self.restamped_duration = delta / speed;
                self.restamped_position += self.restamped_duration;
            }
        }

        self.state = TrickmodeState::Steady;
        self.last_source_position = position;

        debug!(
            source = position,
            position = self.restamped_position,
            duration = self.restamped_duration,
            rate,
            "Fragment restamped"
        );
        Some(Restamped {
            position: self.restamped_position,
            duration: self.restamped_duration,
        })
    }

    /// Restamp a cached fragment in place.
    ///
    /// Boxed payloads have their timing boxes rewritten through `writer`.
    pub fn restamp(
        &mut self,
        fragment: &mut Fragment,
        rate: f64,
        writer: &dyn TimestampWriter,
    ) -> Result<Option<Restamped>> {
        let boxed = fragment.timescale > 0;

        if fragment.is_init && boxed && is_trick_rate(rate) {
            writer.set_timescale(&mut fragment.payload, self.timescale)?;
            writer.clear_media_header_duration(&mut fragment.payload)?;
            fragment.timescale = self.timescale;
        }

        let Some(timing) = self.next_timing(
            fragment.position,
            fragment.duration,
            fragment.is_init,
            fragment.is_discontinuity,
            rate,
        ) else {
            return Ok(None);
        };

        if boxed {
            let scale = f64::from(self.timescale);
            writer.set_pts_and_duration(
                &mut fragment.payload,
                (timing.position * scale).round() as u64,
                (timing.duration * scale).round() as u64,
            )?;
            fragment.timescale = self.timescale;
        }
        fragment.position = timing.position;
        fragment.duration = timing.duration;
        Ok(Some(timing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_fast_forward_16x_at_4fps() {
        let mut restamper = TrickModeRestamper::new(4, 100_000);
        let out: Vec<_> = [0.0, 2.0, 4.0]
            .iter()
            .map(|&pos| restamper.next_timing(pos, 2.0, false, false, 16.0).unwrap())
            .collect();

        let durations: Vec<_> = out.iter().map(|r| r.duration).collect();
        let positions: Vec<_> = out.iter().map(|r| r.position).collect();
        assert!(approx(durations[0], 0.25));
        assert!(approx(durations[1], 0.125));
        assert!(approx(durations[2], 0.125));
        assert!(approx(positions[0], 0.0));
        assert!(approx(positions[1], 0.125));
        assert!(approx(positions[2], 0.25));
        assert_eq!(restamper.state(), TrickmodeState::Steady);
    }

    #[test]
    fn test_rewind_is_monotonic() {
        let mut restamper = TrickModeRestamper::new(4, 100_000);
        let mut last = f64::MIN;
        for pos in [40.0, 36.0, 32.0, 28.0, 24.0] {
            let out = restamper.next_timing(pos, 2.0, false, false, -8.0).unwrap();
            assert!(out.position >= last);
            assert!(out.duration > 0.0);
            last = out.position;
        }
        assert!(approx(last, 2.0));
    }

    #[test]
    fn test_discontinuity_resets_baseline_without_gap() {
        let mut restamper = TrickModeRestamper::new(4, 100_000);
        restamper.next_timing(0.0, 0.0, true, false, 4.0);
        assert_eq!(restamper.state(), TrickmodeState::FirstFragment);

        let a = restamper.next_timing(0.0, 2.0, false, false, 4.0).unwrap();
        let b = restamper.next_timing(2.0, 2.0, false, false, 4.0).unwrap();
        assert!(approx(b.position - a.position, 0.5));

        // New period starts at source position 1000
        restamper.next_timing(1000.0, 0.0, true, true, 4.0);
        assert_eq!(restamper.state(), TrickmodeState::Discontinuity);
        let c = restamper.next_timing(1000.0, 2.0, false, false, 4.0).unwrap();
        assert!(approx(c.position, b.position + b.duration));
        assert!(approx(c.duration, b.duration));

        let d = restamper.next_timing(1002.0, 2.0, false, false, 4.0).unwrap();
        assert!(approx(d.position, c.position + 0.5));
    }

    #[test]
    fn test_media_discontinuity_in_steady_state() {
        let mut restamper = TrickModeRestamper::new(4, 100_000);
        restamper.next_timing(0.0, 2.0, false, false, 8.0);
        let b = restamper.next_timing(4.0, 2.0, false, false, 8.0).unwrap();
        let c = restamper.next_timing(500.0, 2.0, false, true, 8.0).unwrap();
        assert!(approx(c.position, b.position + b.duration));
        let d = restamper.next_timing(504.0, 2.0, false, false, 8.0).unwrap();
        assert!(approx(d.duration, 0.5));
    }

    #[test]
    fn test_unsupported_rates_untouched() {
        let mut restamper = TrickModeRestamper::new(4, 100_000);
        assert!(restamper.next_timing(0.0, 2.0, false, false, 1.0).is_none());
        assert!(restamper.next_timing(0.0, 2.0, false, false, 0.5).is_none());
        assert!(restamper.next_timing(0.0, 2.0, false, false, 0.0).is_none());
        assert_eq!(restamper.state(), TrickmodeState::Undefined);
    }
}

//! Buffer health classification and stall detection

use crate::{config::HealthConfig, types::BufferHealth};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Result of recording one buffer sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthSample {
    /// Buffered seconds at sample time
    pub buffered: f64,
    pub health: BufferHealth,
    /// Previous classification, if it differs from `health`
    pub changed_from: Option<BufferHealth>,
    /// Consecutive samples at the current classification
    pub run_length: u32,
    /// Set on the single sample that crosses the stall timeout
    pub stall_detected: bool,
    /// Time spent Red in the current episode
    pub red_for: Duration,
}

/// Periodic sampler state for one track
#[derive(Debug, Clone)]
pub struct BufferHealthMonitor {
    config: HealthConfig,
    current: Option<BufferHealth>,
    run_length: u32,
    red_since: Option<Instant>,
    stall_reported: bool,
}

impl BufferHealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            current: None,
            run_length: 0,
            red_since: None,
            stall_reported: false,
        }
    }

    /// Classify a buffered duration.
    ///
    /// A track with nothing left to deliver is Green regardless of level.
    pub fn classify(&self, buffered: f64, content_remaining: bool) -> BufferHealth {
        if !content_remaining || buffered > self.config.high_water_secs {
            BufferHealth::Green
        } else if buffered <= self.config.low_water_secs {
            BufferHealth::Red
        } else {
            BufferHealth::Yellow
        }
    }

    /// Record a sample taken at `now`
    pub fn record(&mut self, buffered: f64, content_remaining: bool, now: Instant) -> HealthSample {
        let health = self.classify(buffered, content_remaining);
        let changed_from = match self.current {
            Some(previous) if previous == health => {
                self.run_length = self.run_length.saturating_add(1);
                None
            }
            previous => {
                self.run_length = 1;
                self.current = Some(health);
                if let Some(previous) = previous {
                    info!(from = %previous, to = %health, buffered, "Buffer health changed");
                }
                previous
            }
        };

        let mut stall_detected = false;
        let red_for = if health == BufferHealth::Red {
            let since = *self.red_since.get_or_insert(now);
            let red_for = now.saturating_duration_since(since);
            if red_for > self.config.stall_timeout() && !self.stall_reported {
                self.stall_reported = true;
                stall_detected = true;
                warn!(
                    buffered,
                    red_for_ms = red_for.as_millis() as u64,
                    "Playback stall detected"
                );
            }
            red_for
        } else {
            self.red_since = None;
            self.stall_reported = false;
            Duration::ZERO
        };

        HealthSample {
            buffered,
            health,
            changed_from,
            run_length: self.run_length,
            stall_detected,
            red_for,
        }
    }

    /// Current classification (Green before the first sample)
    pub fn current(&self) -> BufferHealth {
        self.current.unwrap_or(BufferHealth::Green)
    }

    pub fn run_length(&self) -> u32 {
        self.run_length
    }

    /// Forget history, e.g. after a flush
    pub fn reset(&mut self) {
        self.current = None;
        self.run_length = 0;
        self.red_since = None;
        self.stall_reported = false;
    }
}

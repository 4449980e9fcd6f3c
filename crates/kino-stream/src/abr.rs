//! Adaptive Bitrate (ABR) decisions
//!
//! Profile selection is driven by two independent signals:
//! - Network throughput (EWMA bandwidth estimate)
//! - Buffer occupancy (health classification and its run length)
//!
//! The engine itself is stateless; counters live with the track that owns them.

use crate::{
    config::{AbrConfig, InitialProfile},
    net::DownloadError,
    types::{BufferHealth, Profile},
    Error, Result,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument};

/// Source of the current network bandwidth estimate
pub trait BandwidthEstimator: Send + Sync {
    /// Feed a completed transfer
    fn record(&self, bytes: usize, duration: Duration);

    /// Current estimate in bits per second, if any sample was recorded
    fn current_estimate(&self) -> Option<u64>;
}

/// Bandwidth measurement sample
#[derive(Debug, Clone)]
pub struct BandwidthMeasurement {
    /// Bytes downloaded
    pub bytes: usize,
    /// Time taken
    pub duration: Duration,
    /// Timestamp
    pub timestamp: Instant,
}

impl BandwidthMeasurement {
    /// Calculate throughput in bits per second
    pub fn throughput_bps(&self) -> u64 {
        if self.duration.as_secs_f64() > 0.0 {
            ((self.bytes as f64 * 8.0) / self.duration.as_secs_f64()) as u64
        } else {
            0
        }
    }
}

/// Exponentially weighted throughput estimate
#[derive(Debug)]
pub struct EwmaBandwidthEstimator {
    alpha: f64,
    estimate: AtomicU64,
    samples: AtomicU64,
}

impl EwmaBandwidthEstimator {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.01, 1.0),
            estimate: AtomicU64::new(0),
            samples: AtomicU64::new(0),
        }
    }

    pub fn sample_count(&self) -> u64 {
        self.samples.load(Ordering::SeqCst)
    }
}

impl Default for EwmaBandwidthEstimator {
    fn default() -> Self {
        Self::new(0.2)
    }
}

impl BandwidthEstimator for EwmaBandwidthEstimator {
    fn record(&self, bytes: usize, duration: Duration) {
        let measurement = BandwidthMeasurement {
            bytes,
            duration,
            timestamp: Instant::now(),
        };
        let sample = measurement.throughput_bps();
        if sample == 0 {
            return;
        }

        let first = self.samples.fetch_add(1, Ordering::SeqCst) == 0;
        let alpha = self.alpha;
        let _ = self
            .estimate
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                if first || current == 0 {
                    Some(sample)
                } else {
                    Some(((current as f64 * (1.0 - alpha)) + (sample as f64 * alpha)) as u64)
                }
            });

        debug!(
            bytes,
            duration_ms = duration.as_millis() as u64,
            throughput_mbps = sample as f64 / 1_000_000.0,
            estimate_mbps = self.estimate.load(Ordering::SeqCst) as f64 / 1_000_000.0,
            "Bandwidth measurement recorded"
        );
    }

    fn current_estimate(&self) -> Option<u64> {
        (self.samples.load(Ordering::SeqCst) > 0).then(|| self.estimate.load(Ordering::SeqCst))
    }
}

/// Ordered bitrate ladder (ascending bandwidth)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileSet {
    profiles: Vec<Profile>,
}

impl ProfileSet {
    pub fn new(mut profiles: Vec<Profile>) -> Self {
        profiles.sort_by_key(|p| p.bandwidth);
        Self { profiles }
    }

    pub fn get(&self, index: usize) -> Option<&Profile> {
        self.profiles.get(index)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Profile> {
        self.profiles.iter()
    }

    /// Indices of enabled profiles within the bitrate bounds, ascending
    pub fn candidates(&self, min_bitrate: u64, max_bitrate: u64) -> Vec<usize> {
        self.profiles
            .iter()
            .enumerate()
            .filter(|(_, p)| {
                p.enabled
                    && p.bandwidth >= min_bitrate
                    && (max_bitrate == 0 || p.bandwidth <= max_bitrate)
            })
            .map(|(i, _)| i)
            .collect()
    }
}

/// Reason for a profile change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileChangeReason {
    /// Initial selection
    Initial,
    /// Steady-state ramp up on a healthy buffer
    Abr,
    /// Sustained Yellow/Red buffer
    Buffer,
    /// Throughput below the current tier
    Bandwidth,
    /// Stall or empty buffer
    Stall,
    /// Fragment download failure
    RampDown,
    /// Host-requested change
    Manual,
    /// Current profile fell outside the bounds or enabled set
    Bounds,
}

/// Inputs to a steady-state decision
#[derive(Debug, Clone, Copy)]
pub struct AbrInput {
    pub current_profile: usize,
    pub bandwidth_estimate: Option<u64>,
    pub health: BufferHealth,
    pub health_run_length: u32,
    pub buffered: f64,
    pub stalled: bool,
}

/// A profile change chosen by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileSwitch {
    pub from: usize,
    pub to: usize,
    pub reason: ProfileChangeReason,
}

/// Why a failed fragment is skipped instead of retried lower
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AbrDisabled,
    LimitReached,
    LowestProfile,
    NotRampable,
}

/// Outcome of a fragment failure on the primary video track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Retry the same fragment at a lower profile
    RampDown { to: usize },
    /// Advance past the fragment
    Skip { reason: SkipReason },
}

/// Inputs to a failure decision
#[derive(Debug, Clone, Copy)]
pub struct FailureInput<'a> {
    pub current_profile: usize,
    pub error: &'a DownloadError,
    pub bandwidth_estimate: Option<u64>,
    pub health: BufferHealth,
    pub buffered: f64,
    pub rampdown_count: u32,
}

/// ABR decision engine for one profile ladder
#[derive(Debug, Clone)]
pub struct AbrEngine {
    config: AbrConfig,
    profiles: ProfileSet,
}

impl AbrEngine {
    pub fn new(config: AbrConfig, profiles: ProfileSet) -> Self {
        Self { config, profiles }
    }

    pub fn config(&self) -> &AbrConfig {
        &self.config
    }

    pub fn profiles(&self) -> &ProfileSet {
        &self.profiles
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn candidates(&self) -> Result<Vec<usize>> {
        let candidates = self
            .profiles
            .candidates(self.config.min_bitrate, self.config.max_bitrate);
        if candidates.is_empty() {
            Err(Error::NoSuitableProfile)
        } else {
            Ok(candidates)
        }
    }

    fn bandwidth_at(&self, index: usize) -> u64 {
        self.profiles.get(index).map(|p| p.bandwidth).unwrap_or(0)
    }

    /// Position of `index` in the candidate list, snapping outsiders to the
    /// highest candidate not above their bandwidth
    fn position_of(&self, candidates: &[usize], index: usize) -> (usize, bool) {
        if let Some(pos) = candidates.iter().position(|&c| c == index) {
            return (pos, true);
        }
        let bandwidth = self.bandwidth_at(index);
        let pos = candidates
            .iter()
            .rposition(|&c| self.bandwidth_at(c) <= bandwidth)
            .unwrap_or(0);
        (pos, false)
    }

    /// Highest candidate position whose bandwidth fits `usable`
    fn highest_fitting(&self, candidates: &[usize], usable: u64) -> usize {
        candidates
            .iter()
            .rposition(|&c| self.bandwidth_at(c) <= usable)
            .unwrap_or(0)
    }

    fn usable_bandwidth(&self, estimate: u64) -> u64 {
        (estimate as f64 * self.config.bandwidth_safety_factor) as u64
    }

    /// Profile to start with
    pub fn initial_profile(&self, bandwidth_estimate: Option<u64>) -> Result<usize> {
        let candidates = self.candidates()?;
        let pos = match bandwidth_estimate {
            Some(estimate) => self.highest_fitting(&candidates, self.usable_bandwidth(estimate)),
            None => match self.config.initial_profile {
                InitialProfile::Lowest => 0,
                InitialProfile::Middle => candidates.len() / 2,
                InitialProfile::Highest => candidates.len() - 1,
            },
        };
        let index = candidates[pos];
        info!(
            profile = index,
            bandwidth = self.bandwidth_at(index),
            "Initial profile selected"
        );
        Ok(index)
    }

    /// Validate a host-requested profile against the bounds and enabled set
    pub fn constrain(&self, index: usize) -> Result<usize> {
        if index >= self.profiles.len() {
            return Err(Error::ProfileOutOfRange {
                index,
                count: self.profiles.len(),
            });
        }
        let candidates = self.candidates()?;
        let (pos, _) = self.position_of(&candidates, index);
        Ok(candidates[pos])
    }

    /// Steady-state decision after a fragment fetch or a health sample
    #[instrument(skip(self))]
    pub fn decide(&self, input: &AbrInput) -> Result<Option<ProfileSwitch>> {
        let candidates = self.candidates()?;
        let (pos, in_candidates) = self.position_of(&candidates, input.current_profile);
        let usable = input.bandwidth_estimate.map(|e| self.usable_bandwidth(e));

        let (target, reason) = if input.stalled {
            (0, ProfileChangeReason::Stall)
        } else if input.health == BufferHealth::Red && input.buffered <= 0.0 {
            (0, ProfileChangeReason::Stall)
        } else if input.health != BufferHealth::Green
            && input.health_run_length >= self.config.rampdown_samples
            && pos > 0
        {
            (pos - 1, ProfileChangeReason::Buffer)
        } else if let Some(usable) = usable.filter(|&u| {
            input.health != BufferHealth::Green && pos > 0 && u < self.bandwidth_at(candidates[pos])
        }) {
            let fitting = self.highest_fitting(&candidates, usable);
            (fitting.min(pos - 1), ProfileChangeReason::Bandwidth)
        } else if input.health == BufferHealth::Green
            && input.health_run_length >= self.config.rampup_samples
            && pos + 1 < candidates.len()
            && usable.is_some_and(|u| self.bandwidth_at(candidates[pos + 1]) <= u)
        {
            (pos + 1, ProfileChangeReason::Abr)
        } else {
            (pos, ProfileChangeReason::Bounds)
        };

        let to = candidates[target];
        if to == input.current_profile {
            return Ok(None);
        }
        let reason = if target == pos && !in_candidates {
            ProfileChangeReason::Bounds
        } else {
            reason
        };

        debug!(
            from = input.current_profile,
            to,
            reason = ?reason,
            bandwidth = self.bandwidth_at(to),
            "Profile decision"
        );
        Ok(Some(ProfileSwitch {
            from: input.current_profile,
            to,
            reason,
        }))
    }

    /// Decide between a lower-profile retry and a skip after a failed download
    pub fn on_fragment_failure(&self, input: &FailureInput<'_>) -> Result<FailureAction> {
        if !self.config.enabled {
            return Ok(FailureAction::Skip {
                reason: SkipReason::AbrDisabled,
            });
        }
        if self
            .config
            .rampdown_limit
            .is_some_and(|limit| input.rampdown_count >= limit)
        {
            return Ok(FailureAction::Skip {
                reason: SkipReason::LimitReached,
            });
        }
        if !input.error.allows_rampdown() {
            return Ok(FailureAction::Skip {
                reason: SkipReason::NotRampable,
            });
        }

        let candidates = self.candidates()?;
        let (pos, _) = self.position_of(&candidates, input.current_profile);
        if pos == 0 {
            return Ok(FailureAction::Skip {
                reason: SkipReason::LowestProfile,
            });
        }

        // Empty buffer: rebuild at the bottom. Draining buffer: the tier the
        // measured throughput can sustain.
        let target = if input.buffered <= 0.0 {
            0
        } else if let Some(usable) = input
            .bandwidth_estimate
            .map(|e| self.usable_bandwidth(e))
            .filter(|_| input.health != BufferHealth::Green)
        {
            self.highest_fitting(&candidates, usable).min(pos - 1)
        } else {
            pos - 1
        };
        let to = candidates[target];
        info!(
            from = input.current_profile,
            to,
            status = ?input.error.http_status,
            rampdown_count = input.rampdown_count + 1,
            "Ramping down after fragment failure"
        );
        Ok(FailureAction::RampDown { to })
    }
}

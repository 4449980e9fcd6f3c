//! Pipeline configuration

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration shared by every track pipeline of a session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Fragment ring settings
    pub buffer: BufferConfig,
    /// Fetch loop failure handling
    pub fetch: FetchConfig,
    /// Adaptive bitrate settings
    pub abr: AbrConfig,
    /// Buffer health sampling
    pub health: HealthConfig,
    /// Cross-track synchronization
    pub sync: SyncConfig,
    /// Trick play restamping
    pub trickplay: TrickplayConfig,
}

impl PipelineConfig {
    /// Parse a configuration from a JSON document, filling missing fields with defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: PipelineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        if self.buffer.capacity == 0 {
            return Err(Error::InvalidConfig("buffer.capacity must be at least 1".into()));
        }
        if self.buffer.wait_timeout_ms == 0 {
            return Err(Error::InvalidConfig("buffer.wait_timeout_ms must be positive".into()));
        }
        if self.abr.max_bitrate != 0 && self.abr.max_bitrate < self.abr.min_bitrate {
            return Err(Error::InvalidConfig(format!(
                "abr.max_bitrate {} is below abr.min_bitrate {}",
                self.abr.max_bitrate, self.abr.min_bitrate
            )));
        }
        if !(0.0..=1.0).contains(&self.abr.bandwidth_safety_factor)
            || self.abr.bandwidth_safety_factor == 0.0
        {
            return Err(Error::InvalidConfig(
                "abr.bandwidth_safety_factor must be in (0, 1]".into(),
            ));
        }
        if self.health.low_water_secs > self.health.high_water_secs {
            return Err(Error::InvalidConfig(
                "health.low_water_secs must not exceed health.high_water_secs".into(),
            ));
        }
        if self.health.interval_ms == 0 {
            return Err(Error::InvalidConfig("health.interval_ms must be positive".into()));
        }
        if self.trickplay.fps == 0 || self.trickplay.timescale == 0 {
            return Err(Error::InvalidConfig(
                "trickplay.fps and trickplay.timescale must be positive".into(),
            ));
        }
        if self.fetch.download_failure_threshold == 0 || self.fetch.decrypt_failure_threshold == 0 {
            return Err(Error::InvalidConfig("failure thresholds must be positive".into()));
        }
        Ok(())
    }
}

/// Fragment ring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Number of fragment slots per track
    pub capacity: usize,
    /// Bounded wait for a free or filled slot (milliseconds)
    pub wait_timeout_ms: u64,
}

impl BufferConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 4,
            wait_timeout_ms: 100,
        }
    }
}

/// Fetch loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Consecutive download failures before the track is reported as failed
    pub download_failure_threshold: u32,
    /// Consecutive decrypt failures before the track is reported as failed
    pub decrypt_failure_threshold: u32,
    /// Bounded wait for a playlist refresh when the next fragment is not yet available (milliseconds)
    pub refresh_wait_ms: u64,
    /// Playlist refresh interval when the resolver reports no target duration (milliseconds)
    pub default_refresh_interval_ms: u64,
}

impl FetchConfig {
    pub fn refresh_wait(&self) -> Duration {
        Duration::from_millis(self.refresh_wait_ms)
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            download_failure_threshold: 10,
            decrypt_failure_threshold: 10,
            refresh_wait_ms: 1000,
            default_refresh_interval_ms: 6000,
        }
    }
}

/// Initial profile selection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialProfile {
    Lowest,
    Middle,
    Highest,
}

/// Adaptive bitrate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AbrConfig {
    /// Enable ABR decisions on the video track
    pub enabled: bool,
    /// Minimum bitrate bound (bits per second)
    pub min_bitrate: u64,
    /// Maximum bitrate bound (0 = unbounded)
    pub max_bitrate: u64,
    /// Consecutive Green samples required before stepping up
    pub rampup_samples: u32,
    /// Consecutive Yellow/Red samples required before stepping down
    pub rampdown_samples: u32,
    /// Fraction of the bandwidth estimate considered usable
    pub bandwidth_safety_factor: f64,
    /// Consecutive failure-driven rampdowns allowed (None = unlimited)
    pub rampdown_limit: Option<u32>,
    /// Profile used before any measurement exists
    pub initial_profile: InitialProfile,
}

impl Default for AbrConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_bitrate: 0,
            max_bitrate: 0,
            rampup_samples: 4,
            rampdown_samples: 2,
            bandwidth_safety_factor: 0.8,
            rampdown_limit: Some(3),
            initial_profile: InitialProfile::Lowest,
        }
    }
}

/// Buffer health monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Delay before the first sample (milliseconds)
    pub initial_delay_ms: u64,
    /// Sampling interval (milliseconds)
    pub interval_ms: u64,
    /// Buffered seconds at or below which the track is Red
    pub low_water_secs: f64,
    /// Buffered seconds above which the track is Green
    pub high_water_secs: f64,
    /// Continuous Red time reported as a stall (milliseconds)
    pub stall_timeout_ms: u64,
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 2000,
            interval_ms: 1000,
            low_water_secs: 1.0,
            high_water_secs: 4.0,
            stall_timeout_ms: 10_000,
        }
    }
}

/// Cross-track synchronization configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Catch-up tolerance as a multiple of the target duration
    pub catchup_tolerance_factor: f64,
    /// Extra lead subtitles may keep over video (seconds)
    pub subtitle_lead_secs: f64,
    /// Re-check interval for cross-track waits (milliseconds)
    pub wait_interval_ms: u64,
    /// Bounded wait for the sibling side of a discontinuity (milliseconds)
    pub discontinuity_timeout_ms: u64,
    /// Pairing window as a multiple of the target duration
    pub discontinuity_tolerance_factor: f64,
    /// Sibling playlist refreshes to wait for before giving up on a live discontinuity
    pub max_discontinuity_refreshes: u32,
    /// Refresh bound for event/time-shift playlists
    pub max_discontinuity_refreshes_event: u32,
}

impl SyncConfig {
    pub fn wait_interval(&self) -> Duration {
        Duration::from_millis(self.wait_interval_ms)
    }

    pub fn discontinuity_timeout(&self) -> Duration {
        Duration::from_millis(self.discontinuity_timeout_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            catchup_tolerance_factor: 1.0,
            subtitle_lead_secs: 15.0,
            wait_interval_ms: 100,
            discontinuity_timeout_ms: 3000,
            discontinuity_tolerance_factor: 3.0,
            max_discontinuity_refreshes: 3,
            max_discontinuity_refreshes_event: 5,
        }
    }
}

/// Trick play configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrickplayConfig {
    /// Output frame rate of restamped I-frames
    pub fps: u32,
    /// Timescale written into restamped boxed fragments
    pub timescale: u32,
}

impl Default for TrickplayConfig {
    fn default() -> Self {
        Self {
            fps: 4,
            timescale: 100_000,
        }
    }
}

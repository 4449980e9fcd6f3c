//! Error types for Kino Stream

use crate::types::TrackType;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline error types
#[derive(Error, Debug)]
pub enum Error {
    // Wait errors
    #[error("Timed out waiting for {what} on {track} track")]
    WaitTimeout { track: TrackType, what: &'static str },

    #[error("Operation aborted")]
    Aborted,

    #[error("End of stream reached on {track} track")]
    EndOfStream { track: TrackType },

    // Buffer errors
    #[error("Fragment buffer sequencing error: {0}")]
    Sequencing(String),

    // Profile errors
    #[error("No suitable profile found")]
    NoSuitableProfile,

    #[error("Profile index {index} out of range (ladder has {count} profiles)")]
    ProfileOutOfRange { index: usize, count: usize },

    // Fragment errors
    #[error("Init fragment for profile {profile} on {track} track could not be downloaded: {reason}")]
    InitFragment { track: TrackType, profile: usize, reason: String },

    #[error("Persistent download failure on {track} track after {failures} consecutive failures")]
    PersistentDownload { track: TrackType, failures: u32 },

    #[error("Fragment decryption failed: {0}")]
    Decryption(String),

    #[error("License acquisition timed out")]
    LicenseTimeout,

    // Container errors
    #[error("Malformed container: {0}")]
    MalformedContainer(String),

    // Sink errors
    #[error("Media sink rejected sample: {0}")]
    Sink(String),

    // Track errors
    #[error("Track not registered: {0}")]
    UnknownTrack(TrackType),

    #[error("Track {0} is already running")]
    AlreadyRunning(TrackType),

    // Network errors
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

impl Error {
    /// Create a sequencing error
    pub fn sequencing(msg: impl Into<String>) -> Self {
        Error::Sequencing(msg.into())
    }

    /// Returns true if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::WaitTimeout { .. } | Error::Decryption(_) | Error::Network(_)
        )
    }

    /// Returns true if this error ends the track
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::PersistentDownload { .. }
                | Error::InitFragment { .. }
                | Error::LicenseTimeout
                | Error::Sequencing(_)
                | Error::Sink(_)
        )
    }

    /// Returns the error code for event reporting
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::WaitTimeout { .. } => "WAIT_TIMEOUT",
            Error::Aborted => "ABORTED",
            Error::EndOfStream { .. } => "END_OF_STREAM",
            Error::Sequencing(_) => "SEQUENCING",
            Error::NoSuitableProfile => "NO_PROFILE",
            Error::ProfileOutOfRange { .. } => "PROFILE_RANGE",
            Error::InitFragment { .. } => "INIT_FRAGMENT",
            Error::PersistentDownload { .. } => "PERSISTENT_DOWNLOAD",
            Error::Decryption(_) => "FRAGMENT_DECRYPT",
            Error::LicenseTimeout => "LICENSE_TIMEOUT",
            Error::MalformedContainer(_) => "MALFORMED_CONTAINER",
            Error::Sink(_) => "SINK",
            Error::UnknownTrack(_) => "UNKNOWN_TRACK",
            Error::AlreadyRunning(_) => "ALREADY_RUNNING",
            Error::Network(_) => "NETWORK",
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::ConfigParse(_) => "CONFIG_PARSE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = Error::WaitTimeout {
            track: TrackType::Video,
            what: "free slot",
        };
        assert!(err.is_recoverable());
        assert!(!err.is_fatal());
        assert_eq!(err.error_code(), "WAIT_TIMEOUT");

        let err = Error::PersistentDownload {
            track: TrackType::Audio,
            failures: 10,
        };
        assert!(err.is_fatal());
        assert!(!err.is_recoverable());
        assert_eq!(
            err.to_string(),
            "Persistent download failure on audio track after 10 consecutive failures"
        );

        assert!(Error::LicenseTimeout.is_fatal());
        assert_eq!(Error::LicenseTimeout.error_code(), "LICENSE_TIMEOUT");

        let err = Error::InitFragment {
            track: TrackType::Video,
            profile: 0,
            reason: "404 not found".into(),
        };
        assert!(err.is_fatal());
        assert_eq!(err.error_code(), "INIT_FRAGMENT");
        assert!(Error::Sink("receiver dropped".into()).is_fatal());
    }
}

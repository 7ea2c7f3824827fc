//! Error types for tile acquisition.

use crate::executor::SourceAttempt;
use chrono::{DateTime, Utc};
use relief_dem::{DemError, Resolution};
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the acquisition pipeline.
#[derive(Debug, Error)]
pub enum FetchError {
    /// No available resolution satisfies the sampling rule and degraded
    /// output was not permitted.
    #[error(
        "Insufficient resolution: visible pixel size {visible_pixel_m:.1} m, available [{}]",
        join_resolutions(.available)
    )]
    InsufficientResolution {
        /// Ground size of one output pixel in meters.
        visible_pixel_m: f64,
        /// Resolutions that were considered.
        available: Vec<Resolution>,
    },

    /// The shared rate limiter is in backoff or over its daily ceiling.
    #[error("Rate limited: {reason}")]
    RateLimited {
        /// Why the limiter refused.
        reason: String,
        /// Earliest time a retry can succeed, when known.
        retry_at: Option<DateTime<Utc>>,
        /// Attempts made before the limiter refused.
        attempts: Vec<SourceAttempt>,
    },

    /// Every candidate source failed for a tile.
    #[error("All sources exhausted for tile {tile}: {}", summarize_attempts(.attempts))]
    AllSourcesExhausted {
        /// Canonical tile name.
        tile: String,
        /// One entry per attempted source, in the order tried.
        attempts: Vec<SourceAttempt>,
    },

    /// No registered source serves this resolution over the region.
    #[error("No source serves tile {tile} at {resolution}")]
    NoCandidateSources {
        /// Canonical tile name.
        tile: String,
        /// Requested resolution class.
        resolution: Resolution,
    },

    /// A cached artifact is out of date and must be regenerated.
    #[error("Stale artifact {}: {reason}", .path.display())]
    StaleCache {
        /// Artifact path.
        path: PathBuf,
        /// Version or hash mismatch description.
        reason: String,
    },

    /// The rate-limit state file lock could not be acquired in time.
    #[error("Timed out after {waited_ms} ms waiting for lock on {}", .path.display())]
    LockTimeout {
        /// State file guarded by the lock.
        path: PathBuf,
        /// How long acquisition was attempted.
        waited_ms: u64,
    },

    /// Refused to clear an active backoff without `force`.
    #[error("Backoff is active until {until}; use force to clear it")]
    BackoffActive {
        /// End of the active backoff window.
        until: DateTime<Utc>,
    },

    /// No credential is configured for a provider.
    #[error("Missing credential: {provider}")]
    MissingCredential {
        /// Credential name (e.g. an environment variable).
        provider: String,
    },

    /// The acquisition was cancelled between tiles.
    #[error("Acquisition cancelled")]
    Cancelled,

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML (de)serialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP client construction error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Raster, grid or mosaic error, including partial coverage.
    #[error(transparent)]
    Dem(#[from] DemError),
}

impl FetchError {
    /// Whether retrying later may succeed without changing inputs.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::RateLimited { .. }
                | FetchError::LockTimeout { .. }
                | FetchError::AllSourcesExhausted { .. }
        )
    }
}

fn join_resolutions(resolutions: &[Resolution]) -> String {
    resolutions
        .iter()
        .map(|r| r.label())
        .collect::<Vec<_>>()
        .join(", ")
}

fn summarize_attempts(attempts: &[SourceAttempt]) -> String {
    attempts
        .iter()
        .map(|a| match &a.error {
            Some(e) => format!("{} ({})", a.source_id, e),
            None => a.source_id.clone(),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SourceUnavailable;

    #[test]
    fn test_exhausted_message_lists_every_source() {
        let err = FetchError::AllSourcesExhausted {
            tile: "N47_W123_10m.tif".to_string(),
            attempts: vec![
                SourceAttempt::failed("usgs_3dep_13", SourceUnavailable::NotFound),
                SourceAttempt::failed(
                    "opentopo_srtmgl1",
                    SourceUnavailable::Rejected { status: 401 }
                ),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("N47_W123_10m.tif"));
        assert!(msg.contains("usgs_3dep_13 (not found)"));
        assert!(msg.contains("opentopo_srtmgl1 (rejected with HTTP 401)"));
    }

    #[test]
    fn test_insufficient_message() {
        let err = FetchError::InsufficientResolution {
            visible_pixel_m: 4.31,
            available: vec![Resolution::M10, Resolution::M30],
        };
        assert_eq!(
            err.to_string(),
            "Insufficient resolution: visible pixel size 4.3 m, available [10m, 30m]"
        );
    }
}

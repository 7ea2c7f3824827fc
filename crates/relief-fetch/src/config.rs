//! Acquisition configuration loaded from YAML.
//!
//! Every section has defaults, so an empty document is a valid config:
//!
//! ```yaml
//! cache_root: dem_cache
//! output_root: regions
//! workers: 4
//! source_priority: [copernicus_glo30]
//! rate_limit:
//!   state_path: dem_cache/rate_limit.json
//!   initial_backoff_secs: 3600
//!   backoff_multiplier: 2.0
//!   max_backoff_secs: 12600
//!   daily_ceiling: 1000
//!   min_interval_ms: 1000
//!   lock_timeout_ms: 5000
//! fetch:
//!   timeout_secs: 60
//!   min_tile_bytes: 1024
//!   patience: { mode: wait, max_wait_secs: 30 }
//!   quota_policy: halt_run
//! ```

use crate::{FetchError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level acquisition settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Root of the per-source tile cache.
    pub cache_root: PathBuf,
    /// Root under which region artifacts are written.
    pub output_root: PathBuf,
    /// Size of the tile fetch worker pool (1 = sequential).
    pub workers: usize,
    /// Source ids tried before the registry's own ranking.
    pub source_priority: Vec<String>,
    /// Shared rate limiter settings.
    pub rate_limit: RateLimitConfig,
    /// Per-request settings.
    pub fetch: FetchConfig,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from("dem_cache"),
            output_root: PathBuf::from("regions"),
            workers: 4,
            source_priority: Vec::new(),
            rate_limit: RateLimitConfig::default(),
            fetch: FetchConfig::default(),
        }
    }
}

impl AcquisitionConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&text)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(FetchError::Config("workers must be at least 1".to_string()));
        }
        self.rate_limit.validate()?;
        self.fetch.validate()
    }
}

/// Settings for the cross-process rate limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Shared JSON state file; its lock lives next to it with a `.lock` extension.
    pub state_path: PathBuf,
    /// Backoff after the first violation.
    pub initial_backoff_secs: u64,
    /// Growth factor per further consecutive violation.
    pub backoff_multiplier: f64,
    /// Cap on a single backoff window.
    pub max_backoff_secs: u64,
    /// Requests allowed per local day.
    pub daily_ceiling: u32,
    /// Minimum spacing between requests.
    pub min_interval_ms: u64,
    /// How long to wait for the state file lock.
    pub lock_timeout_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("dem_cache/rate_limit.json"),
            initial_backoff_secs: 3600,
            backoff_multiplier: 2.0,
            max_backoff_secs: 12_600,
            daily_ceiling: 1000,
            min_interval_ms: 1000,
            lock_timeout_ms: 5000,
        }
    }
}

impl RateLimitConfig {
    /// Backoff window for the given count of consecutive violations:
    /// `min(initial * multiplier^(violations - 1), max)`.
    pub fn backoff_for(&self, violations: u32) -> chrono::Duration {
        let exponent = violations.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = (self.initial_backoff_secs as f64 * self.backoff_multiplier.powi(exponent))
            .min(self.max_backoff_secs as f64);
        chrono::Duration::milliseconds((secs * 1000.0) as i64)
    }

    /// Minimum spacing between requests.
    pub fn min_interval(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.min_interval_ms as i64)
    }

    /// State file lock timeout.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if !(self.backoff_multiplier.is_finite() && self.backoff_multiplier > 0.0) {
            return Err(FetchError::Config(format!(
                "backoff_multiplier must be positive, got {}",
                self.backoff_multiplier
            )));
        }
        if self.initial_backoff_secs == 0 || self.max_backoff_secs == 0 {
            return Err(FetchError::Config("backoff durations must be positive".to_string()));
        }
        if self.lock_timeout_ms == 0 {
            return Err(FetchError::Config("lock_timeout_ms must be positive".to_string()));
        }
        Ok(())
    }
}

/// What to do when the rate limiter refuses a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Patience {
    /// Block until the limiter allows a request, up to a bound.
    Wait {
        /// Longest acceptable wait.
        max_wait_secs: u64,
    },
    /// Fail the tile immediately with `RateLimited`.
    Abort,
}

impl Default for Patience {
    fn default() -> Self {
        Patience::Wait { max_wait_secs: 30 }
    }
}

/// How an auth or quota rejection affects the rest of the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaPolicy {
    /// Stop trying every source for the remainder of the run.
    #[default]
    HaltRun,
    /// Record the violation and move on to the next source.
    NextSource,
}

/// Per-request fetch settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Network timeout for one request.
    pub timeout_secs: u64,
    /// Smallest file accepted as a tile.
    pub min_tile_bytes: u64,
    /// User-Agent header for HTTP requests.
    pub user_agent: String,
    /// Behaviour when the limiter refuses.
    pub patience: Patience,
    /// Behaviour after an auth or quota rejection.
    pub quota_policy: QuotaPolicy,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            min_tile_bytes: 1024,
            user_agent: concat!("relief-fetch/", env!("CARGO_PKG_VERSION")).to_string(),
            patience: Patience::default(),
            quota_policy: QuotaPolicy::default(),
        }
    }
}

impl FetchConfig {
    /// Network timeout for one request.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(FetchError::Config("timeout_secs must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = AcquisitionConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, AcquisitionConfig::default());
        assert_eq!(config.rate_limit.initial_backoff_secs, 3600);
        assert_eq!(config.fetch.patience, Patience::Wait { max_wait_secs: 30 });
        assert_eq!(config.fetch.quota_policy, QuotaPolicy::HaltRun);
    }

    #[test]
    fn test_partial_document() {
        let yaml = r#"
workers: 2
source_priority: [copernicus_glo30, usgs_3dep_1]
rate_limit:
  daily_ceiling: 50
fetch:
  patience: { mode: abort }
  quota_policy: next_source
"#;
        let config = AcquisitionConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.source_priority, vec!["copernicus_glo30", "usgs_3dep_1"]);
        assert_eq!(config.rate_limit.daily_ceiling, 50);
        assert_eq!(config.rate_limit.min_interval_ms, 1000);
        assert_eq!(config.fetch.patience, Patience::Abort);
        assert_eq!(config.fetch.quota_policy, QuotaPolicy::NextSource);
    }

    #[test]
    fn test_validation() {
        assert!(matches!(
            AcquisitionConfig::from_yaml_str("workers: 0"),
            Err(FetchError::Config(_))
        ));
        assert!(matches!(
            AcquisitionConfig::from_yaml_str("rate_limit: { backoff_multiplier: -1.0 }"),
            Err(FetchError::Config(_))
        ));
        assert!(matches!(
            AcquisitionConfig::from_yaml_str("fetch: { timeout_secs: 0 }"),
            Err(FetchError::Config(_))
        ));
        assert!(matches!(
            AcquisitionConfig::from_yaml_str("workers: [1"),
            Err(FetchError::Yaml(_))
        ));
    }

    #[test]
    fn test_backoff_schedule() {
        let config = RateLimitConfig::default();
        assert_eq!(config.backoff_for(1), chrono::Duration::seconds(3600));
        assert_eq!(config.backoff_for(2), chrono::Duration::seconds(7200));
        assert_eq!(config.backoff_for(3), chrono::Duration::seconds(12_600));
        assert_eq!(config.backoff_for(40), chrono::Duration::seconds(12_600));
    }
}

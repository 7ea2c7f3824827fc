use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Shared limiter state, persisted as JSON.
///
/// Unknown or missing fields fall back to defaults so a partially written or
/// older file still parses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitState {
    /// Violations since the last successful request.
    pub consecutive_violations: u32,
    /// No requests before this instant.
    pub backoff_until: Option<DateTime<Utc>>,
    /// Successful requests since `day_started`.
    pub requests_today: u32,
    /// Start of the local day `requests_today` counts.
    pub day_started: DateTime<Utc>,
    /// Most recent (or reserved) request time, for spacing.
    pub last_request_time: Option<DateTime<Utc>>,
    /// HTTP status of the last violation.
    pub last_violation_status: Option<u16>,
}

impl RateLimitState {
    /// Whether a backoff window is open at `now`.
    pub fn backoff_active(&self, now: DateTime<Utc>) -> bool {
        self.backoff_until.is_some_and(|until| now < until)
    }
}

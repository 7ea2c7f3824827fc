//! Cross-process rate limiting and backoff.
//!
//! All processes on a host share one [`RateLimitState`] through a
//! [`StateStore`]. Every operation re-reads and rewrites the persisted state
//! inside the store's critical section; nothing is cached in memory.
//!
//! If the store cannot be locked in time, `check` and the `record_*` calls
//! log the degradation and proceed as if no limit were active. Only the
//! administrative [`RateLimiter::clear`] surfaces [`FetchError::LockTimeout`].

mod state;
mod store;

pub use state::RateLimitState;
pub use store::{FileStateStore, MemoryStateStore, StateStore};

use crate::clock::Clock;
use crate::config::RateLimitConfig;
use crate::{FetchError, Result};
use chrono::{DateTime, Utc};
use relief_metrics::metric_defs;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Answer from [`RateLimiter::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Permit {
    /// A request may be issued now.
    Ready,
    /// No request may be issued yet.
    Blocked {
        /// Human-readable cause.
        reason: String,
        /// When the block lifts, if known.
        retry_at: Option<DateTime<Utc>>,
    },
}

impl Permit {
    /// Whether a request may proceed.
    pub fn is_ok(&self) -> bool {
        matches!(self, Permit::Ready)
    }

    /// Why the request is blocked.
    pub fn wait_reason(&self) -> Option<&str> {
        match self {
            Permit::Ready => None,
            Permit::Blocked { reason, .. } => Some(reason),
        }
    }
}

/// Shared backoff and quota coordinator.
pub struct RateLimiter {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    config: RateLimitConfig,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("clock", &self.clock)
            .field("config", &self.config)
            .finish()
    }
}

impl RateLimiter {
    /// Create a limiter over a state store.
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>, config: RateLimitConfig) -> Self {
        Self { store, clock, config }
    }

    /// A limiter backed by the configured state file.
    pub fn from_config(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let store = FileStateStore::new(&config.state_path, config.lock_timeout());
        Self::new(Arc::new(store), clock, config.clone())
    }

    /// Limiter settings.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Reset the daily counter when `now` falls in a later local day.
    fn roll_day(&self, state: &mut RateLimitState, now: DateTime<Utc>) {
        let today = self.clock.day_start(now);
        if state.day_started != today {
            state.day_started = today;
            state.requests_today = 0;
        }
    }

    fn degraded(&self, op: &str, err: &FetchError) {
        if matches!(err, FetchError::LockTimeout { .. }) {
            metrics::counter!(metric_defs::LOCK_TIMEOUTS.name).increment(1);
        }
        warn!(operation = op, error = %err, "Rate limiter degraded, proceeding without limit");
    }

    /// Ask whether a request may be issued now.
    ///
    /// Refuses during backoff and once the daily ceiling is reached. Otherwise
    /// reserves the next request slot and sleeps out the minimum spacing
    /// before returning [`Permit::Ready`].
    pub fn check(&self) -> Permit {
        let now = self.clock.now();
        let mut permit = Permit::Ready;
        let mut wait = chrono::Duration::zero();

        let result = self.store.update(&mut |state| {
            self.roll_day(state, now);

            if let Some(until) = state.backoff_until {
                if now < until {
                    permit = Permit::Blocked {
                        reason: format!(
                            "backoff active after {} consecutive violation(s)",
                            state.consecutive_violations
                        ),
                        retry_at: Some(until),
                    };
                    return;
                }
                // Window elapsed
                state.backoff_until = None;
            }

            if state.requests_today >= self.config.daily_ceiling {
                permit = Permit::Blocked {
                    reason: format!(
                        "daily ceiling of {} requests reached",
                        self.config.daily_ceiling
                    ),
                    retry_at: Some(self.clock.next_day_start(now)),
                };
                return;
            }

            let slot = match state.last_request_time {
                Some(last) => (last + self.config.min_interval()).max(now),
                None => now,
            };
            wait = slot - now;
            state.last_request_time = Some(slot);
            permit = Permit::Ready;
        });

        if let Err(e) = result {
            self.degraded("check", &e);
            return Permit::Ready;
        }

        if permit.is_ok() && wait > chrono::Duration::zero() {
            if let Ok(wait) = wait.to_std() {
                debug!(wait_ms = wait.as_millis() as u64, "Spacing request");
                metrics::histogram!(metric_defs::RATE_LIMIT_WAIT_TIME.name)
                    .record(wait.as_secs_f64());
                self.clock.sleep(wait);
            }
        }
        permit
    }

    /// Record an auth or quota rejection and extend the backoff window.
    ///
    /// Returns the new end of the window, or `None` if the state could not
    /// be updated.
    pub fn record_violation(&self, status: u16) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        let result = self.store.update(&mut |state| {
            self.roll_day(state, now);
            state.consecutive_violations = state.consecutive_violations.saturating_add(1);
            let until = now + self.config.backoff_for(state.consecutive_violations);
            state.backoff_until = Some(state.backoff_until.map_or(until, |prev| prev.max(until)));
            state.last_violation_status = Some(status);
            state.last_request_time = Some(now);
        });

        match result {
            Ok(state) => {
                metrics::counter!(
                    metric_defs::RATE_LIMIT_VIOLATIONS.name,
                    "status" => status.to_string()
                )
                .increment(1);
                let until = state.backoff_until;
                if let Some(until) = until {
                    let secs = (until - now).num_seconds();
                    metrics::gauge!(metric_defs::RATE_LIMIT_BACKOFF.name).set(secs as f64);
                    warn!(
                        status,
                        violations = state.consecutive_violations,
                        backoff_secs = secs,
                        until = %until,
                        "Rate limit violation, backing off"
                    );
                }
                until
            }
            Err(e) => {
                self.degraded("record_violation", &e);
                None
            }
        }
    }

    /// Record a successful request: clears violations and backoff and counts
    /// the request against today's ceiling.
    pub fn record_success(&self) {
        let now = self.clock.now();
        let result = self.store.update(&mut |state| {
            self.roll_day(state, now);
            state.consecutive_violations = 0;
            state.backoff_until = None;
            state.last_request_time = Some(now);
            state.requests_today = state.requests_today.saturating_add(1);
        });

        match result {
            Ok(_) => metrics::gauge!(metric_defs::RATE_LIMIT_BACKOFF.name).set(0.0),
            Err(e) => self.degraded("record_success", &e),
        }
    }

    /// Administrative reset of violations and backoff.
    ///
    /// Refuses with [`FetchError::BackoffActive`] while a backoff window is
    /// open unless `force` is set.
    pub fn clear(&self, force: bool) -> Result<RateLimitState> {
        let now = self.clock.now();
        let mut refused = None;

        let state = self.store.update(&mut |state| {
            if let Some(until) = state.backoff_until.filter(|until| now < *until) {
                if !force {
                    refused = Some(until);
                    return;
                }
            }
            state.consecutive_violations = 0;
            state.backoff_until = None;
        })?;

        if let Some(until) = refused {
            return Err(FetchError::BackoffActive { until });
        }
        info!(force, "Rate limit state cleared");
        Ok(state)
    }

    /// Current state, read without locking.
    pub fn status(&self) -> RateLimitState {
        self.store.peek()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn limiter(config: RateLimitConfig) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()));
        let limiter = RateLimiter::new(Arc::new(MemoryStateStore::new()), clock.clone(), config);
        (limiter, clock)
    }

    #[test]
    fn test_spacing_sleeps_between_requests() {
        let (limiter, clock) = limiter(RateLimitConfig::default());
        let start = clock.now();

        assert!(limiter.check().is_ok());
        assert_eq!(clock.now(), start);

        // Second request in the same instant waits out the interval
        assert!(limiter.check().is_ok());
        assert_eq!(clock.now(), start + chrono::Duration::seconds(1));
    }

    #[test]
    fn test_daily_ceiling_resets_next_day() {
        let config = RateLimitConfig {
            daily_ceiling: 2,
            min_interval_ms: 0,
            ..RateLimitConfig::default()
        };
        let (limiter, clock) = limiter(config);

        limiter.record_success();
        limiter.record_success();
        let permit = limiter.check();
        assert!(!permit.is_ok());
        assert!(permit.wait_reason().unwrap().contains("daily ceiling"));
        assert_eq!(
            permit,
            Permit::Blocked {
                reason: "daily ceiling of 2 requests reached".to_string(),
                retry_at: Some(Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap()),
            }
        );

        clock.set(Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 1).unwrap());
        assert!(limiter.check().is_ok());
        assert_eq!(limiter.status().requests_today, 0);
    }

    #[test]
    fn test_violation_does_not_count_as_request() {
        let (limiter, _clock) = limiter(RateLimitConfig::default());
        limiter.record_violation(429);
        let state = limiter.status();
        assert_eq!(state.requests_today, 0);
        assert_eq!(state.consecutive_violations, 1);
        assert_eq!(state.last_violation_status, Some(429));
    }

    #[test]
    fn test_backoff_never_shrinks() {
        let config = RateLimitConfig {
            initial_backoff_secs: 100,
            backoff_multiplier: 0.5,
            ..RateLimitConfig::default()
        };
        let (limiter, clock) = limiter(config);
        let first = limiter.record_violation(429).unwrap();
        let second = limiter.record_violation(429).unwrap();
        assert_eq!(first, clock.now() + chrono::Duration::seconds(100));
        assert_eq!(second, first);
    }

    #[test]
    fn test_clear_requires_force_during_backoff() {
        let (limiter, clock) = limiter(RateLimitConfig::default());
        limiter.record_violation(403);

        assert!(matches!(limiter.clear(false), Err(FetchError::BackoffActive { .. })));
        assert_eq!(limiter.status().consecutive_violations, 1);

        let state = limiter.clear(true).unwrap();
        assert_eq!(state.consecutive_violations, 0);
        assert!(state.backoff_until.is_none());
        assert!(limiter.check().is_ok());

        // Nothing active: plain clear succeeds
        limiter.record_violation(403);
        clock.advance(chrono::Duration::hours(2));
        assert!(limiter.clear(false).is_ok());
    }
}

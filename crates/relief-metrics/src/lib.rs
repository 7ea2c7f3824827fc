//! Metrics for DEM tile acquisition.
//!
//! Every metric emitted by the acquisition pipeline is declared here as a
//! [`Metric`] constant so names, units and label keys live in one place.
//! Emission goes through the `metrics` facade, so nothing is recorded unless
//! the application installs a recorder.
//!
//! # Example
//!
//! ```rust
//! use relief_metrics::{describe_metrics, metric_defs, SourceLabels};
//!
//! // Once at startup, after installing a recorder
//! describe_metrics();
//!
//! let labels = SourceLabels::new("copernicus_glo30").with_resolution("30m");
//! metrics::counter!(metric_defs::TILE_DOWNLOADS.name, &labels.to_labels()).increment(1);
//! ```

pub use metrics;

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

/// The kind of metric (counter, gauge, or histogram).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// A monotonically increasing counter.
    Counter,
    /// A gauge that can go up and down.
    Gauge,
    /// A histogram for recording distributions.
    Histogram,
}

impl MetricKind {
    /// Returns the kind as a lowercase string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A metric declaration with its metadata.
///
/// ```rust
/// use relief_metrics::{Metric, MetricKind};
/// use metrics::Unit;
///
/// const RETRIES: Metric = Metric::counter("relief.fetch.retries")
///     .with_description("Fetch retries")
///     .with_unit(Unit::Count)
///     .with_labels(&["source"]);
///
/// assert_eq!(RETRIES.kind, MetricKind::Counter);
/// ```
#[derive(Debug, Clone)]
pub struct Metric {
    /// The metric name (e.g., "relief.tiles.downloads").
    pub name: &'static str,
    /// The kind of metric.
    pub kind: MetricKind,
    /// Human-readable description.
    pub description: &'static str,
    /// The unit of measurement, if any.
    pub unit: Option<Unit>,
    /// Expected label keys.
    pub labels: &'static [&'static str],
}

impl Metric {
    const fn with_kind(name: &'static str, kind: MetricKind) -> Self {
        Self {
            name,
            kind,
            description: "",
            unit: None,
            labels: &[],
        }
    }

    /// Creates a new counter metric with the given name.
    pub const fn counter(name: &'static str) -> Self {
        Self::with_kind(name, MetricKind::Counter)
    }

    /// Creates a new gauge metric with the given name.
    pub const fn gauge(name: &'static str) -> Self {
        Self::with_kind(name, MetricKind::Gauge)
    }

    /// Creates a new histogram metric with the given name.
    pub const fn histogram(name: &'static str) -> Self {
        Self::with_kind(name, MetricKind::Histogram)
    }

    /// Sets the description for the metric.
    pub const fn with_description(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    /// Sets the unit for the metric.
    pub const fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Sets the expected label keys for the metric.
    pub const fn with_labels(mut self, labels: &'static [&'static str]) -> Self {
        self.labels = labels;
        self
    }

    /// Registers this metric's description with the installed recorder.
    pub fn describe(&self) {
        match (self.kind, self.unit) {
            (MetricKind::Counter, Some(unit)) => {
                describe_counter!(self.name, unit, self.description);
            }
            (MetricKind::Counter, None) => {
                describe_counter!(self.name, self.description);
            }
            (MetricKind::Gauge, Some(unit)) => {
                describe_gauge!(self.name, unit, self.description);
            }
            (MetricKind::Gauge, None) => {
                describe_gauge!(self.name, self.description);
            }
            (MetricKind::Histogram, Some(unit)) => {
                describe_histogram!(self.name, unit, self.description);
            }
            (MetricKind::Histogram, None) => {
                describe_histogram!(self.name, self.description);
            }
        }
    }
}

/// All metric definitions for tile acquisition.
pub mod metric_defs {
    use super::{Metric, Unit};

    // ========================================================================
    // Tile Cache
    // ========================================================================

    /// Tiles served from the on-disk cache without a network call.
    ///
    /// Labels: resolution
    pub const TILE_CACHE_HITS: Metric = Metric::counter("relief.tiles.cache_hits")
        .with_description("Tiles served from the local cache")
        .with_unit(Unit::Count)
        .with_labels(&["resolution"]);

    /// Tiles downloaded, verified and persisted.
    ///
    /// Labels: source, resolution
    pub const TILE_DOWNLOADS: Metric = Metric::counter("relief.tiles.downloads")
        .with_description("Tiles downloaded and persisted")
        .with_unit(Unit::Count)
        .with_labels(&["source", "resolution"]);

    /// Bytes written for downloaded tiles.
    ///
    /// Labels: source
    pub const TILE_DOWNLOAD_BYTES: Metric = Metric::counter("relief.tiles.download_bytes")
        .with_description("Bytes of verified tile data written")
        .with_unit(Unit::Bytes)
        .with_labels(&["source"]);

    /// Wall-clock time of a single source request.
    ///
    /// Labels: source
    pub const TILE_DOWNLOAD_TIME: Metric = Metric::histogram("relief.tiles.download_time")
        .with_description("Duration of one tile request")
        .with_unit(Unit::Seconds)
        .with_labels(&["source"]);

    /// Failed attempts against one source for one tile.
    ///
    /// Labels: source, kind (not_found, rejected, transient, invalid,
    /// missing_credential, rate_limited)
    pub const SOURCE_FAILURES: Metric = Metric::counter("relief.sources.failures")
        .with_description("Per-source fetch failures")
        .with_unit(Unit::Count)
        .with_labels(&["source", "kind"]);

    // ========================================================================
    // Rate Limiter
    // ========================================================================

    /// Auth or quota rejections recorded against the shared limiter.
    ///
    /// Labels: status
    pub const RATE_LIMIT_VIOLATIONS: Metric = Metric::counter("relief.rate_limit.violations")
        .with_description("Quota or auth rejections recorded")
        .with_unit(Unit::Count)
        .with_labels(&["status"]);

    /// Length of the backoff window set by the latest violation.
    pub const RATE_LIMIT_BACKOFF: Metric = Metric::gauge("relief.rate_limit.backoff")
        .with_description("Current backoff window length")
        .with_unit(Unit::Seconds);

    /// Time spent waiting on the limiter before a request.
    pub const RATE_LIMIT_WAIT_TIME: Metric = Metric::histogram("relief.rate_limit.wait_time")
        .with_description("Time blocked on request spacing or backoff")
        .with_unit(Unit::Seconds);

    /// Lock acquisitions on the shared state file that timed out.
    pub const LOCK_TIMEOUTS: Metric = Metric::counter("relief.rate_limit.lock_timeouts")
        .with_description("State file lock timeouts (limiter degraded)")
        .with_unit(Unit::Count);

    // ========================================================================
    // Regions and Artifacts
    // ========================================================================

    /// Region acquisitions by outcome.
    ///
    /// Labels: outcome (reused, assembled, failed, cancelled)
    pub const REGION_ACQUISITIONS: Metric = Metric::counter("relief.regions.acquisitions")
        .with_description("Region acquisitions")
        .with_unit(Unit::Count)
        .with_labels(&["outcome"]);

    /// Cached artifacts found stale and invalidated.
    ///
    /// Labels: stage
    pub const STALE_ARTIFACTS: Metric = Metric::counter("relief.artifacts.stale")
        .with_description("Artifacts invalidated as stale")
        .with_unit(Unit::Count)
        .with_labels(&["stage"]);

    /// Returns a slice of all defined metrics.
    pub const ALL: &[&Metric] = &[
        &TILE_CACHE_HITS,
        &TILE_DOWNLOADS,
        &TILE_DOWNLOAD_BYTES,
        &TILE_DOWNLOAD_TIME,
        &SOURCE_FAILURES,
        &RATE_LIMIT_VIOLATIONS,
        &RATE_LIMIT_BACKOFF,
        &RATE_LIMIT_WAIT_TIME,
        &LOCK_TIMEOUTS,
        &REGION_ACQUISITIONS,
        &STALE_ARTIFACTS,
    ];
}

/// Labels for source-scoped metrics.
///
/// ```rust
/// use relief_metrics::SourceLabels;
///
/// let labels = SourceLabels::new("usgs_3dep_13").with_resolution("10m");
/// assert_eq!(labels.to_labels().len(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct SourceLabels {
    /// Source identifier from the registry.
    pub source: String,
    /// Resolution label, when relevant.
    pub resolution: Option<String>,
}

impl SourceLabels {
    /// Labels for one source.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            resolution: None,
        }
    }

    /// Adds the resolution label.
    pub fn with_resolution(mut self, resolution: impl Into<String>) -> Self {
        self.resolution = Some(resolution.into());
        self
    }

    /// Converts the labels to the metrics crate label format.
    pub fn to_labels(&self) -> Vec<(&'static str, String)> {
        let mut labels = vec![("source", self.source.clone())];
        if let Some(resolution) = &self.resolution {
            labels.push(("resolution", resolution.clone()));
        }
        labels
    }

    /// Returns labels with additional key-value pairs.
    pub fn with(&self, extra: &[(&'static str, String)]) -> Vec<(&'static str, String)> {
        let mut labels = self.to_labels();
        labels.extend_from_slice(extra);
        labels
    }
}

/// Describes all acquisition metrics.
///
/// Call once at startup after installing a recorder.
pub fn describe_metrics() {
    for metric in metric_defs::ALL {
        metric.describe();
    }
}

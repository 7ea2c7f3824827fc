//! Fallback-aware tile downloads.
//!
//! [`FetchExecutor::fetch_tile`] resolves one canonical tile: serve it from
//! the on-disk cache if a structurally sound copy exists, otherwise try each
//! candidate source in priority order under the shared rate limiter. Every
//! attempt is recorded; if all of them fail the caller gets every reason.

use crate::clock::Clock;
use crate::config::{FetchConfig, Patience, QuotaPolicy};
use crate::credentials::CredentialProvider;
use crate::rate_limit::{Permit, RateLimiter};
use crate::registry::{SourceCapability, SourceRegistry};
use crate::transport::{TileRequest, TileTransport, TransportResponse};
use crate::version;
use crate::{FetchError, Result};
use parking_lot::{Condvar, Mutex};
use relief_dem::{check_tile_header, verify_raster_bytes, GeoBounds, Resolution, TileId};
use relief_metrics::{metric_defs, SourceLabels};
use std::collections::HashSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Layout of the per-source tile cache:
/// `<root>/<source_id>/tiles/<canonical_tile_name>`.
#[derive(Debug, Clone)]
pub struct TileStore {
    root: PathBuf,
}

impl TileStore {
    /// Cache rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Cache root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one source's tiles.
    pub fn tile_dir(&self, source_id: &str) -> PathBuf {
        self.root.join(source_id).join("tiles")
    }

    /// Canonical location of a tile from a source.
    pub fn tile_path(&self, source_id: &str, tile: TileId, resolution: Resolution) -> PathBuf {
        self.tile_dir(source_id).join(tile.canonical_name(resolution))
    }
}

/// Why one source could not supply one tile.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceUnavailable {
    /// The source has no data for this tile.
    #[error("not found")]
    NotFound,
    /// Auth or quota rejection.
    #[error("rejected with HTTP {status}")]
    Rejected {
        /// HTTP status.
        status: u16,
    },
    /// Timeout, connection failure or server error.
    #[error("{reason}")]
    Transient {
        /// HTTP status, if a response arrived.
        status: Option<u16>,
        /// Description.
        reason: String,
    },
    /// The payload did not verify as a raster.
    #[error("invalid raster: {0}")]
    Invalid(String),
    /// The source needs a key that is not configured.
    #[error("missing credential {0}")]
    MissingCredential(String),
}

impl SourceUnavailable {
    /// Metric label for the failure kind.
    pub fn kind(&self) -> &'static str {
        match self {
            SourceUnavailable::NotFound => "not_found",
            SourceUnavailable::Rejected { .. } => "rejected",
            SourceUnavailable::Transient { .. } => "transient",
            SourceUnavailable::Invalid(_) => "invalid",
            SourceUnavailable::MissingCredential(_) => "missing_credential",
        }
    }
}

/// Outcome of trying one source for one tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceAttempt {
    /// Source tried.
    pub source_id: String,
    /// Whether the tile was persisted from this source.
    pub succeeded: bool,
    /// Failure reason, when not succeeded.
    pub error: Option<SourceUnavailable>,
    /// Bytes written to the cache.
    pub bytes_written: u64,
    /// Whether the payload passed raster verification.
    pub verified: bool,
}

impl SourceAttempt {
    /// A failed attempt.
    pub fn failed(source_id: impl Into<String>, error: SourceUnavailable) -> Self {
        Self {
            source_id: source_id.into(),
            succeeded: false,
            error: Some(error),
            bytes_written: 0,
            verified: false,
        }
    }

    /// A verified, persisted download.
    pub fn succeeded(source_id: impl Into<String>, bytes_written: u64) -> Self {
        Self {
            source_id: source_id.into(),
            succeeded: true,
            error: None,
            bytes_written,
            verified: true,
        }
    }
}

/// A tile available on disk.
#[derive(Debug, Clone)]
pub struct FetchedTile {
    /// Grid cell.
    pub tile: TileId,
    /// Resolution class.
    pub resolution: Resolution,
    /// Source whose cache directory holds the file.
    pub source_id: String,
    /// Canonical file path.
    pub path: PathBuf,
    /// Served from cache without a network call.
    pub cache_hit: bool,
    /// Attempts made (empty for cache hits).
    pub attempts: Vec<SourceAttempt>,
}

/// Counters for this executor's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchStats {
    /// Requests handed to the transport.
    pub network_requests: u64,
    /// Tiles downloaded and persisted.
    pub downloads: u64,
    /// Tiles served from cache.
    pub cache_hits: u64,
    /// Verified bytes written.
    pub bytes_downloaded: u64,
}

/// Downloads tiles through the registry, limiter and transport.
///
/// Safe to share between threads. Concurrent calls for the same
/// `(tile, resolution)` are coalesced: one thread downloads, the rest wait
/// and then re-check the cache.
pub struct FetchExecutor {
    registry: Arc<SourceRegistry>,
    limiter: Arc<RateLimiter>,
    transport: Arc<dyn TileTransport>,
    credentials: Arc<dyn CredentialProvider>,
    clock: Arc<dyn Clock>,
    store: TileStore,
    config: FetchConfig,
    source_priority: Vec<String>,
    /// Set after a quota rejection under [`QuotaPolicy::HaltRun`].
    halted: AtomicBool,
    in_flight: Mutex<HashSet<(TileId, Resolution)>>,
    flight_done: Condvar,
    network_requests: AtomicU64,
    downloads: AtomicU64,
    cache_hits: AtomicU64,
    bytes_downloaded: AtomicU64,
}

impl std::fmt::Debug for FetchExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchExecutor")
            .field("store", &self.store)
            .field("config", &self.config)
            .field("source_priority", &self.source_priority)
            .field("halted", &self.is_halted())
            .finish()
    }
}

/// Removes the in-flight marker and wakes waiters, on success, error or panic.
struct FlightGuard<'a> {
    executor: &'a FetchExecutor,
    key: (TileId, Resolution),
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.executor.in_flight.lock().remove(&self.key);
        self.executor.flight_done.notify_all();
    }
}

impl FetchExecutor {
    /// Create an executor writing under `cache_root`.
    pub fn new(
        registry: Arc<SourceRegistry>,
        limiter: Arc<RateLimiter>,
        transport: Arc<dyn TileTransport>,
        credentials: Arc<dyn CredentialProvider>,
        clock: Arc<dyn Clock>,
        cache_root: impl Into<PathBuf>,
        config: FetchConfig,
    ) -> Self {
        Self {
            registry,
            limiter,
            transport,
            credentials,
            clock,
            store: TileStore::new(cache_root),
            config,
            source_priority: Vec::new(),
            halted: AtomicBool::new(false),
            in_flight: Mutex::new(HashSet::new()),
            flight_done: Condvar::new(),
            network_requests: AtomicU64::new(0),
            downloads: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            bytes_downloaded: AtomicU64::new(0),
        }
    }

    /// Source ids to try ahead of the registry ranking.
    pub fn with_source_priority(mut self, source_priority: Vec<String>) -> Self {
        self.source_priority = source_priority;
        self
    }

    /// The source registry.
    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// The shared limiter.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Cache layout.
    pub fn store(&self) -> &TileStore {
        &self.store
    }

    /// Counters since creation.
    pub fn stats(&self) -> FetchStats {
        FetchStats {
            network_requests: self.network_requests.load(Ordering::Relaxed),
            downloads: self.downloads.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
        }
    }

    /// Whether a quota rejection stopped all further downloads.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Make one tile available on disk.
    ///
    /// `region_bounds` selects the candidate sources: only sources whose
    /// coverage contains the whole region are considered.
    pub fn fetch_tile(
        &self,
        tile: TileId,
        resolution: Resolution,
        region_bounds: &GeoBounds,
    ) -> Result<FetchedTile> {
        let candidates = self
            .registry
            .select(resolution, region_bounds, &self.source_priority);
        if candidates.is_empty() {
            return Err(FetchError::NoCandidateSources {
                tile: tile.canonical_name(resolution),
                resolution,
            });
        }

        if let Some(hit) = self.cached(tile, resolution, &candidates) {
            return Ok(hit);
        }

        let _flight = self.enter_flight(tile, resolution);
        // Another thread may have finished it while we waited
        if let Some(hit) = self.cached(tile, resolution, &candidates) {
            return Ok(hit);
        }

        self.download(tile, resolution, &candidates)
    }

    fn enter_flight(&self, tile: TileId, resolution: Resolution) -> FlightGuard<'_> {
        let key = (tile, resolution);
        let mut in_flight = self.in_flight.lock();
        while in_flight.contains(&key) {
            debug!(tile = %tile, "Waiting for in-flight download");
            self.flight_done.wait(&mut in_flight);
        }
        in_flight.insert(key);
        FlightGuard { executor: self, key }
    }

    /// First candidate with a structurally sound cached file.
    ///
    /// Corrupt files are invalidated so a later download can replace them.
    fn cached(
        &self,
        tile: TileId,
        resolution: Resolution,
        candidates: &[&SourceCapability],
    ) -> Option<FetchedTile> {
        for source in candidates {
            let path = self.store.tile_path(&source.source_id, tile, resolution);
            if !path.exists() {
                continue;
            }
            match check_tile_header(&path, self.config.min_tile_bytes) {
                Ok(_) => {
                    self.cache_hits.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!(
                        metric_defs::TILE_CACHE_HITS.name,
                        "resolution" => resolution.label()
                    )
                    .increment(1);
                    debug!(tile = %tile, source = %source.source_id, "Tile cache hit");
                    return Some(FetchedTile {
                        tile,
                        resolution,
                        source_id: source.source_id.clone(),
                        path,
                        cache_hit: true,
                        attempts: Vec::new(),
                    });
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "Cached tile failed integrity check, discarding"
                    );
                    if let Err(e) = version::invalidate(&path) {
                        warn!(path = %path.display(), error = %e, "Could not remove corrupt tile");
                    }
                }
            }
        }
        None
    }

    fn download(
        &self,
        tile: TileId,
        resolution: Resolution,
        candidates: &[&SourceCapability],
    ) -> Result<FetchedTile> {
        let name = tile.canonical_name(resolution);
        let mut attempts: Vec<SourceAttempt> = Vec::new();

        for source in candidates {
            let id = source.source_id.as_str();
            if self.is_halted() {
                return Err(self.halted_error(attempts));
            }

            let api_key = match self.api_key(source) {
                Ok(key) => key,
                Err(unavailable) => {
                    self.note_failure(&name, id, &unavailable);
                    attempts.push(SourceAttempt::failed(id, unavailable));
                    continue;
                }
            };

            if let Permit::Blocked { reason, retry_at } = self.await_permit() {
                warn!(tile = %name, source = %id, %reason, "Rate limiter refused request");
                return Err(FetchError::RateLimited {
                    reason,
                    retry_at,
                    attempts,
                });
            }

            let url = source.endpoint.url(tile, api_key.as_deref());
            let request = TileRequest {
                source_id: id,
                tile,
                resolution,
                url: &url,
            };

            debug!(tile = %name, source = %id, "Requesting tile");
            let started = Instant::now();
            let response = self.transport.get(&request);
            self.network_requests.fetch_add(1, Ordering::Relaxed);
            metrics::histogram!(metric_defs::TILE_DOWNLOAD_TIME.name, "source" => id.to_string())
                .record(started.elapsed().as_secs_f64());

            let unavailable = match response {
                TransportResponse::Body(bytes) => {
                    match verify_raster_bytes(&bytes, self.config.min_tile_bytes, tile) {
                        Ok(summary) => {
                            self.limiter.record_success();
                            let path = self.persist(id, tile, resolution, &bytes)?;
                            let written = bytes.len() as u64;

                            self.downloads.fetch_add(1, Ordering::Relaxed);
                            self.bytes_downloaded.fetch_add(written, Ordering::Relaxed);
                            let labels = SourceLabels::new(id).with_resolution(resolution.label());
                            metrics::counter!(metric_defs::TILE_DOWNLOADS.name, &labels.to_labels())
                                .increment(1);
                            metrics::counter!(
                                metric_defs::TILE_DOWNLOAD_BYTES.name,
                                "source" => id.to_string()
                            )
                            .increment(written);
                            info!(
                                tile = %name,
                                source = %id,
                                bytes = written,
                                width = summary.width,
                                height = summary.height,
                                "Downloaded tile"
                            );

                            attempts.push(SourceAttempt::succeeded(id, written));
                            return Ok(FetchedTile {
                                tile,
                                resolution,
                                source_id: id.to_string(),
                                path,
                                cache_hit: false,
                                attempts,
                            });
                        }
                        Err(e) => SourceUnavailable::Invalid(e.to_string()),
                    }
                }
                TransportResponse::NotFound => SourceUnavailable::NotFound,
                TransportResponse::Rejected { status } => {
                    let retry_at = self.limiter.record_violation(status);
                    let unavailable = SourceUnavailable::Rejected { status };
                    self.note_failure(&name, id, &unavailable);
                    attempts.push(SourceAttempt::failed(id, unavailable));

                    if self.config.quota_policy == QuotaPolicy::HaltRun {
                        self.halted.store(true, Ordering::SeqCst);
                        warn!(
                            tile = %name,
                            source = %id,
                            status,
                            "Quota rejection, halting downloads for this run"
                        );
                        return Err(FetchError::RateLimited {
                            reason: format!("{id} rejected with HTTP {status}"),
                            retry_at,
                            attempts,
                        });
                    }
                    continue;
                }
                TransportResponse::Failed { status, reason } => {
                    SourceUnavailable::Transient { status, reason }
                }
            };

            self.note_failure(&name, id, &unavailable);
            attempts.push(SourceAttempt::failed(id, unavailable));
        }

        Err(FetchError::AllSourcesExhausted { tile: name, attempts })
    }

    fn api_key(
        &self,
        source: &SourceCapability,
    ) -> std::result::Result<Option<String>, SourceUnavailable> {
        if !source.requires_auth {
            return Ok(None);
        }
        let key_name = source.auth_key_name.as_deref().unwrap_or(source.source_id.as_str());
        self.credentials
            .get_api_key(key_name)
            .map(Some)
            .map_err(|_| SourceUnavailable::MissingCredential(key_name.to_string()))
    }

    /// Ask the limiter for a permit, waiting per the patience policy.
    fn await_permit(&self) -> Permit {
        let max_wait = match self.config.patience {
            Patience::Abort => return self.limiter.check(),
            Patience::Wait { max_wait_secs } => chrono::Duration::seconds(max_wait_secs as i64),
        };
        let deadline = self.clock.now() + max_wait;

        loop {
            let permit = self.limiter.check();
            let retry_at = match &permit {
                Permit::Ready => return permit,
                Permit::Blocked { retry_at: Some(at), .. } if *at <= deadline => *at,
                Permit::Blocked { .. } => return permit,
            };

            let wait = (retry_at - self.clock.now()).max(chrono::Duration::milliseconds(1));
            debug!(wait_ms = wait.num_milliseconds(), "Waiting for rate limiter");
            let wait = wait.to_std().unwrap_or_default();
            metrics::histogram!(metric_defs::RATE_LIMIT_WAIT_TIME.name).record(wait.as_secs_f64());
            self.clock.sleep(wait);
        }
    }

    fn halted_error(&self, attempts: Vec<SourceAttempt>) -> FetchError {
        FetchError::RateLimited {
            reason: "downloads halted after a quota rejection".to_string(),
            retry_at: self.limiter.status().backoff_until,
            attempts,
        }
    }

    fn note_failure(&self, tile: &str, source_id: &str, unavailable: &SourceUnavailable) {
        let labels = SourceLabels::new(source_id).with(&[("kind", unavailable.kind().to_string())]);
        metrics::counter!(metric_defs::SOURCE_FAILURES.name, &labels).increment(1);
        match unavailable {
            SourceUnavailable::NotFound => {
                debug!(tile, source = source_id, "Source has no data for tile")
            }
            _ => warn!(tile, source = source_id, error = %unavailable, "Source failed"),
        }
    }

    /// Write verified bytes under the canonical name without clobbering.
    ///
    /// If another process already produced the file, its copy is kept.
    fn persist(
        &self,
        source_id: &str,
        tile: TileId,
        resolution: Resolution,
        bytes: &[u8],
    ) -> Result<PathBuf> {
        let dir = self.store.tile_dir(source_id);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(tile.canonical_name(resolution));

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(bytes)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        match tmp.persist_noclobber(&path) {
            Ok(_) => Ok(path),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                debug!(path = %path.display(), "Tile already written by another process");
                Ok(path)
            }
            Err(e) => Err(e.error.into()),
        }
    }
}

//! Region acquisition.
//!
//! Turns a region request into one assembled raster: pick the resolution,
//! reuse a fresh artifact if one exists, otherwise fetch every covering tile
//! on a bounded worker pool and mosaic them. Each completed region also gets
//! a `region.json` record for downstream manifest writers.

use crate::clock::Clock;
use crate::config::AcquisitionConfig;
use crate::credentials::CredentialProvider;
use crate::executor::{FetchExecutor, FetchedTile};
use crate::rate_limit::RateLimiter;
use crate::registry::SourceRegistry;
use crate::resolution::{choose_for_region, RegionClass, ResolutionChoice};
use crate::transport::TileTransport;
use crate::version::{write_json_atomic, CacheValidator, Stage, StageVersions};
use crate::{FetchError, Result};
use rayon::prelude::*;
use relief_dem::{decompose, GeoBounds, Mosaic, Resolution};
use relief_metrics::metric_defs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// What to acquire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionRequest {
    /// Identifier used for output paths. Must be a single path component.
    pub region_id: String,
    /// Region extent.
    pub bounds: GeoBounds,
    /// Which resolutions the region can reach.
    pub region_class: RegionClass,
    /// Output pixels along the longer side.
    pub max_dimension: u32,
    /// Accept the finest available resolution when none is acceptable.
    pub allow_degraded: bool,
    /// Also consider 250/500/1000 m sources.
    pub coarse_fallbacks: bool,
}

impl RegionRequest {
    /// A request with degradation and coarse fallbacks disabled.
    pub fn new(
        region_id: impl Into<String>,
        bounds: GeoBounds,
        region_class: RegionClass,
        max_dimension: u32,
    ) -> Self {
        Self {
            region_id: region_id.into(),
            bounds,
            region_class,
            max_dimension,
            allow_degraded: false,
            coarse_fallbacks: false,
        }
    }

    /// Permit degraded output.
    pub fn with_degraded(mut self, allow: bool) -> Self {
        self.allow_degraded = allow;
        self
    }

    /// Consider coarse fallback resolutions.
    pub fn with_coarse_fallbacks(mut self, enabled: bool) -> Self {
        self.coarse_fallbacks = enabled;
        self
    }
}

/// Per-region record consumed by manifest writers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionRecord {
    /// Region identifier.
    pub region_id: String,
    /// Assembled raster.
    pub artifact_path: PathBuf,
    /// Requested bounds.
    pub bounds: GeoBounds,
    /// Resolution class the raster was built from.
    pub resolution_used: Resolution,
    /// Whether quality below the sampling rule was accepted.
    pub degraded: bool,
}

/// Result of one acquisition.
#[derive(Debug, Clone)]
pub struct Acquisition {
    /// Manifest record.
    pub record: RegionRecord,
    /// Resolution decision.
    pub choice: ResolutionChoice,
    /// Tiles covering the region.
    pub tiles_total: usize,
    /// Tiles downloaded during this call.
    pub tiles_downloaded: usize,
    /// Tiles served from the tile cache.
    pub cache_hits: usize,
    /// A fresh region artifact was reused and no tile was touched.
    pub reused_artifact: bool,
}

/// Cooperative cancellation flag, checked between tiles.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Drives resolution selection, tile fetching and assembly for regions.
pub struct RegionAcquirer {
    executor: Arc<FetchExecutor>,
    validator: CacheValidator,
    output_root: PathBuf,
    pool: rayon::ThreadPool,
}

impl std::fmt::Debug for RegionAcquirer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionAcquirer")
            .field("executor", &self.executor)
            .field("output_root", &self.output_root)
            .field("workers", &self.pool.current_num_threads())
            .finish()
    }
}

impl RegionAcquirer {
    /// Create an acquirer fetching on `workers` threads.
    pub fn new(
        executor: Arc<FetchExecutor>,
        validator: CacheValidator,
        output_root: impl Into<PathBuf>,
        workers: usize,
    ) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("relief-fetch-{i}"))
            .build()
            .map_err(|e| FetchError::Config(format!("cannot build worker pool: {e}")))?;
        Ok(Self {
            executor,
            validator,
            output_root: output_root.into(),
            pool,
        })
    }

    /// Wire up the built-in registry, a file-backed rate limiter and the
    /// built-in stage versions from a configuration.
    pub fn from_config(
        config: &AcquisitionConfig,
        transport: Arc<dyn TileTransport>,
        credentials: Arc<dyn CredentialProvider>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let limiter = RateLimiter::from_config(&config.rate_limit, clock.clone());
        let executor = FetchExecutor::new(
            Arc::new(SourceRegistry::builtin()),
            Arc::new(limiter),
            transport,
            credentials,
            clock.clone(),
            &config.cache_root,
            config.fetch.clone(),
        )
        .with_source_priority(config.source_priority.clone());
        let validator = CacheValidator::new(StageVersions::builtin(), clock);
        Self::new(Arc::new(executor), validator, &config.output_root, config.workers)
    }

    /// The tile executor.
    pub fn executor(&self) -> &FetchExecutor {
        &self.executor
    }

    /// The artifact validator.
    pub fn validator(&self) -> &CacheValidator {
        &self.validator
    }

    /// Raw region raster location:
    /// `<output_root>/<region_id>/raw/<region_id>_<resolution>.tif`.
    pub fn artifact_path(&self, region_id: &str, resolution: Resolution) -> PathBuf {
        self.output_root
            .join(region_id)
            .join(Stage::Raw.as_str())
            .join(format!("{region_id}_{}.tif", resolution.label()))
    }

    /// Region record location: `<output_root>/<region_id>/region.json`.
    pub fn record_path(&self, region_id: &str) -> PathBuf {
        self.output_root.join(region_id).join("region.json")
    }

    /// Acquire a region.
    pub fn acquire(&self, request: &RegionRequest) -> Result<Acquisition> {
        self.acquire_with_cancel(request, &CancelToken::new())
    }

    /// Acquire a region, stopping between tiles once `cancel` is set.
    ///
    /// Tiles completed before cancellation stay in the cache.
    pub fn acquire_with_cancel(
        &self,
        request: &RegionRequest,
        cancel: &CancelToken,
    ) -> Result<Acquisition> {
        let result = self.run(request, cancel);
        let outcome = match &result {
            Ok(a) if a.reused_artifact => "reused",
            Ok(_) => "assembled",
            Err(FetchError::Cancelled) => "cancelled",
            Err(_) => "failed",
        };
        metrics::counter!(metric_defs::REGION_ACQUISITIONS.name, "outcome" => outcome).increment(1);
        if let Err(e) = &result {
            warn!(region = %request.region_id, error = %e, "Region acquisition did not complete");
        }
        result
    }

    fn run(&self, request: &RegionRequest, cancel: &CancelToken) -> Result<Acquisition> {
        check_region_id(&request.region_id)?;

        let covering = self.executor.registry().resolutions_covering(&request.bounds);
        let available: Vec<Resolution> = request
            .region_class
            .resolutions(request.coarse_fallbacks)
            .into_iter()
            .filter(|r| covering.contains(r))
            .collect();
        let choice = choose_for_region(
            &request.bounds,
            request.max_dimension,
            &available,
            request.allow_degraded,
        )?;
        if choice.degraded {
            warn!(
                region = %request.region_id,
                resolution = choice.resolution.label(),
                visible_pixel_m = choice.visible_pixel_m,
                "Proceeding with degraded resolution"
            );
        }

        let artifact = self.artifact_path(&request.region_id, choice.resolution);
        let record = RegionRecord {
            region_id: request.region_id.clone(),
            artifact_path: artifact.clone(),
            bounds: request.bounds,
            resolution_used: choice.resolution,
            degraded: choice.degraded,
        };
        let tiles = decompose(&request.bounds);

        if self
            .validator
            .ensure_fresh_for(&artifact, Stage::Raw, Some(&request.bounds))?
            .is_some()
        {
            info!(
                region = %request.region_id,
                path = %artifact.display(),
                "Reusing region artifact"
            );
            write_json_atomic(&self.record_path(&request.region_id), &record)?;
            return Ok(Acquisition {
                record,
                choice,
                tiles_total: tiles.len(),
                tiles_downloaded: 0,
                cache_hits: 0,
                reused_artifact: true,
            });
        }

        info!(
            region = %request.region_id,
            resolution = choice.resolution.label(),
            tiles = tiles.len(),
            "Acquiring region"
        );
        let fetched = self.fetch_all(&tiles, choice.resolution, &request.bounds, cancel)?;

        let mut mosaic = Mosaic::new(choice.resolution);
        for tile in &fetched {
            mosaic.insert(tile.tile, tile.path.clone());
        }
        mosaic.assemble_to(&tiles, &artifact)?;
        self.validator.record(
            &artifact,
            Stage::Raw,
            &request.region_id,
            None,
            Some(request.bounds),
        )?;
        write_json_atomic(&self.record_path(&request.region_id), &record)?;

        let cache_hits = fetched.iter().filter(|t| t.cache_hit).count();
        info!(
            region = %request.region_id,
            path = %artifact.display(),
            tiles = tiles.len(),
            cache_hits,
            "Region assembled"
        );
        Ok(Acquisition {
            record,
            choice,
            tiles_total: tiles.len(),
            tiles_downloaded: fetched.len() - cache_hits,
            cache_hits,
            reused_artifact: false,
        })
    }

    /// Fetch every tile on the pool. After the first failure, tiles not yet
    /// started are skipped.
    fn fetch_all(
        &self,
        tiles: &[relief_dem::TileId],
        resolution: Resolution,
        bounds: &GeoBounds,
        cancel: &CancelToken,
    ) -> Result<Vec<FetchedTile>> {
        let failed = AtomicBool::new(false);
        let results: Vec<Option<Result<FetchedTile>>> = self.pool.install(|| {
            tiles
                .par_iter()
                .map(|tile| {
                    if cancel.is_cancelled() {
                        return Some(Err(FetchError::Cancelled));
                    }
                    if failed.load(Ordering::SeqCst) {
                        return None;
                    }
                    let result = self.executor.fetch_tile(*tile, resolution, bounds);
                    if result.is_err() {
                        failed.store(true, Ordering::SeqCst);
                    }
                    Some(result)
                })
                .collect()
        });

        let mut fetched = Vec::with_capacity(tiles.len());
        let mut cancelled = false;
        for result in results.into_iter().flatten() {
            match result {
                Ok(tile) => fetched.push(tile),
                Err(FetchError::Cancelled) => cancelled = true,
                Err(e) => return Err(e),
            }
        }
        if cancelled {
            return Err(FetchError::Cancelled);
        }
        Ok(fetched)
    }
}

fn check_region_id(region_id: &str) -> Result<()> {
    let mut components = Path::new(region_id).components();
    match (components.next(), components.next()) {
        (Some(std::path::Component::Normal(_)), None) => Ok(()),
        _ => Err(FetchError::Config(format!(
            "region id {region_id:?} must be a single path component"
        ))),
    }
}

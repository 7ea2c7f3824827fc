//! # relief-fetch
//!
//! Multi-source DEM tile acquisition with shared rate limiting and cache
//! validation.
//!
//! ## Overview
//!
//! A region request flows through these pieces:
//!
//! - [`choose_for_region`] picks the coarsest resolution that still samples
//!   the requested output well, or fails with
//!   [`FetchError::InsufficientResolution`]
//! - [`CacheValidator`] decides whether an existing region artifact can be
//!   reused
//! - [`SourceRegistry`] orders the sources that can serve each tile
//! - [`FetchExecutor`] serves tiles from the on-disk cache or downloads them,
//!   falling back across sources under a [`RateLimiter`] shared by every
//!   process on the host
//! - [`RegionAcquirer`] ties it together and assembles the region raster
//!
//! ## Cache Layout
//!
//! ```text
//! <cache_root>/<source_id>/tiles/N47_W123_10m.tif
//! <cache_root>/rate_limit.json
//! <output_root>/<region_id>/raw/<region_id>_10m.tif
//! <output_root>/<region_id>/raw/<region_id>_10m.tif.meta.json
//! <output_root>/<region_id>/region.json
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use relief_fetch::{
//!     AcquisitionConfig, EnvCredentials, HttpTransport, RegionAcquirer, RegionClass,
//!     RegionRequest, SystemClock,
//! };
//! use relief_dem::GeoBounds;
//! use std::sync::Arc;
//!
//! let config = AcquisitionConfig::from_yaml_file("relief.yaml")?;
//! let acquirer = RegionAcquirer::from_config(
//!     &config,
//!     Arc::new(HttpTransport::new(&config.fetch)?),
//!     Arc::new(EnvCredentials),
//!     Arc::new(SystemClock),
//! )?;
//!
//! let bounds = GeoBounds::new(-121.9, 46.7, -121.6, 47.0)?;
//! let request = RegionRequest::new("mount_rainier", bounds, RegionClass::Domestic, 2048);
//! let result = acquirer.acquire(&request)?;
//! println!("{} at {}", result.record.artifact_path.display(), result.record.resolution_used);
//! # Ok::<(), relief_fetch::FetchError>(())
//! ```

mod acquire;
mod clock;
mod config;
mod credentials;
mod error;
mod executor;
pub mod rate_limit;
mod registry;
mod resolution;
mod transport;
pub mod version;

pub use acquire::{Acquisition, CancelToken, RegionAcquirer, RegionRecord, RegionRequest};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AcquisitionConfig, FetchConfig, Patience, QuotaPolicy, RateLimitConfig};
pub use credentials::{CredentialProvider, EnvCredentials, StaticCredentials};
pub use error::FetchError;
pub use executor::{
    FetchExecutor, FetchStats, FetchedTile, SourceAttempt, SourceUnavailable, TileStore,
};
pub use rate_limit::{Permit, RateLimitState, RateLimiter};
pub use registry::{Coverage, SourceCapability, SourceEndpoint, SourceRegistry, OPENTOPOGRAPHY_KEY};
pub use resolution::{
    choose_for_region, is_acceptable, select_resolution, visible_pixel_size, RegionClass,
    ResolutionChoice, METERS_PER_DEGREE, NATIVE_BAND, NYQUIST_FACTOR,
};
pub use transport::{classify_status, HttpTransport, TileRequest, TileTransport, TransportResponse};
pub use version::{CacheValidator, Freshness, Stage, StageVersions};

/// Result type for acquisition operations.
pub type Result<T> = std::result::Result<T, FetchError>;

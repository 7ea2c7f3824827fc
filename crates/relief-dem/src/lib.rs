//! # relief-dem
//!
//! Canonical tile grid and raster handling for DEM acquisition.
//!
//! This crate provides:
//! - [`GeoBounds`], a validated geographic bounding box
//! - the 1°×1° tile grid ([`TileId`], [`snap_to_grid`], [`decompose`],
//!   [`canonical_name`]) that gives every cached tile a deterministic name
//! - GeoTIFF decoding, header checks and full verification of tiles
//!   ([`DemTile`], [`check_tile_header`], [`verify_raster_bytes`])
//! - region assembly from cached tiles ([`Mosaic`])
//!
//! ## Tile Grid
//!
//! Tiles are named after their southwest corner and resolution class, e.g.
//! `N47_W123_10m.tif` covers 47°N to 48°N and 123°W to 122°W at ~10 m.
//! Two regions that overlap the same cell always map to the same name.
//!
//! ```
//! use relief_dem::{decompose, GeoBounds, Resolution};
//!
//! let region = GeoBounds::new(-122.6, 47.2, -121.4, 47.9)?;
//! let names: Vec<String> = decompose(&region)
//!     .iter()
//!     .map(|t| t.canonical_name(Resolution::M10))
//!     .collect();
//! assert_eq!(names, ["N47_W123_10m.tif", "N47_W122_10m.tif"]);
//! # Ok::<(), relief_dem::DemError>(())
//! ```

mod bounds;
mod error;
mod grid;
mod mosaic;
mod tile;

pub use bounds::GeoBounds;
pub use error::DemError;
pub use grid::{canonical_name, decompose, snap_to_grid, Resolution, TileId, TILE_EXTENSION};
pub use mosaic::{write_geotiff_atomic, Mosaic};
pub use tile::{check_tile_header, verify_raster_bytes, DemTile, RasterSummary, DEFAULT_NODATA};

/// Result type for DEM operations.
pub type Result<T> = std::result::Result<T, DemError>;

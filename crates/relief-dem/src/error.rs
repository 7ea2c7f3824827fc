//! Error types for the DEM crate.

use thiserror::Error;

/// Failures in tile decoding, grid arithmetic and mosaic assembly.
#[derive(Debug, Error)]
pub enum DemError {
    /// I/O error reading or writing a file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TIFF decoding or encoding error.
    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    /// Invalid GeoTIFF - missing or inconsistent georeferencing.
    #[error("Invalid GeoTIFF: {0}")]
    InvalidGeoTiff(String),

    /// Bounds violate `west < east`, `south < north` or leave the globe.
    #[error("Invalid bounds (west={west}, south={south}, east={east}, north={north})")]
    InvalidBounds {
        /// West edge in degrees.
        west: f64,
        /// South edge in degrees.
        south: f64,
        /// East edge in degrees.
        east: f64,
        /// North edge in degrees.
        north: f64,
    },

    /// Tile cell corner outside the valid grid.
    #[error("Tile cell ({south}, {west}) is outside the 1-degree grid")]
    InvalidCell {
        /// Southwest corner latitude.
        south: i32,
        /// Southwest corner longitude.
        west: i32,
    },

    /// Filename does not follow the canonical tile naming scheme.
    #[error("Invalid tile filename: {0}")]
    InvalidFilename(String),

    /// Unrecognised resolution class.
    #[error("Unsupported resolution: {0}")]
    UnsupportedResolution(String),

    /// Raster failed structural verification.
    #[error("Raster failed verification: {0}")]
    Verification(String),

    /// One or more required tiles are absent from the mosaic.
    #[error("Partial coverage: missing tile(s) {}", .missing.join(", "))]
    PartialCoverage {
        /// Canonical names of the missing tiles.
        missing: Vec<String>,
    },

    /// A tile does not match the mosaic's resolution class.
    #[error("Tile {tile} is {found}, mosaic expects {expected}")]
    ResolutionMismatch {
        /// Offending tile's canonical name.
        tile: String,
        /// Resolution the mosaic was built for.
        expected: crate::Resolution,
        /// Resolution of the offending tile.
        found: crate::Resolution,
    },

    /// Asked to assemble an empty tile set.
    #[error("No tiles to assemble")]
    EmptyMosaic,
}

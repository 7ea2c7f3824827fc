//! Region assembly from cached 1°×1° tiles.

use crate::tile::{probe_pixel_size, DEFAULT_NODATA};
use crate::{DemError, DemTile, GeoBounds, Resolution, Result, TileId, TILE_EXTENSION};
use std::collections::BTreeMap;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// A set of tile files at one resolution class, ready to be mosaicked.
///
/// Tiles are indexed by cell; nothing is decoded until [`Mosaic::assemble`].
/// Assembly never produces a raster with a hole: any required cell that has
/// no tile fails the whole operation with [`DemError::PartialCoverage`].
///
/// # Example
///
/// ```no_run
/// use relief_dem::{decompose, GeoBounds, Mosaic, Resolution};
///
/// let region = GeoBounds::new(-122.6, 47.2, -121.4, 47.9)?;
/// let mut mosaic = Mosaic::new(Resolution::M30);
/// mosaic.add_directory("cache/usgs_3dep_1/tiles")?;
/// mosaic.assemble_to(&decompose(&region), "out/seattle_30m.tif")?;
/// # Ok::<(), relief_dem::DemError>(())
/// ```
#[derive(Debug, Clone)]
pub struct Mosaic {
    resolution: Resolution,
    tiles: BTreeMap<TileId, PathBuf>,
}

impl Mosaic {
    /// Create an empty mosaic for one resolution class.
    pub fn new(resolution: Resolution) -> Self {
        Self {
            resolution,
            tiles: BTreeMap::new(),
        }
    }

    /// Resolution class of every tile in this mosaic.
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Register a tile file for a cell. A later registration for the same
    /// cell replaces the earlier one.
    pub fn insert(&mut self, tile: TileId, path: impl Into<PathBuf>) {
        self.tiles.insert(tile, path.into());
    }

    /// Register a tile file by its canonical filename.
    pub fn add_file<P: AsRef<Path>>(&mut self, path: P) -> Result<TileId> {
        let path = path.as_ref();
        let filename = path
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| DemError::InvalidFilename(path.display().to_string()))?;

        let (tile, resolution) = TileId::from_canonical_name(filename)?;
        if resolution != self.resolution {
            return Err(DemError::ResolutionMismatch {
                tile: filename.to_string(),
                expected: self.resolution,
                found: resolution,
            });
        }

        self.insert(tile, path);
        Ok(tile)
    }

    /// Index every canonically named tile of this resolution in a directory.
    ///
    /// Files at other resolutions or with foreign names are skipped.
    /// Returns the number of tiles indexed.
    pub fn add_directory<P: AsRef<Path>>(&mut self, dir: P) -> Result<usize> {
        let mut count = 0;

        for entry in std::fs::read_dir(dir.as_ref())? {
            let path = entry?.path();
            if !path.extension().is_some_and(|ext| ext == TILE_EXTENSION) {
                continue;
            }
            match self.add_file(&path) {
                Ok(_) => count += 1,
                Err(e) => debug!(path = %path.display(), error = %e, "Skipping file"),
            }
        }

        Ok(count)
    }

    /// Number of indexed tiles.
    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    /// Canonical names of required cells that have no tile.
    pub fn missing(&self, required: &[TileId]) -> Vec<String> {
        required
            .iter()
            .filter(|tile| !self.tiles.contains_key(*tile))
            .map(|tile| tile.canonical_name(self.resolution))
            .collect()
    }

    /// Bounds covered by a set of cells.
    fn coverage(required: &[TileId]) -> Option<GeoBounds> {
        let mut iter = required.iter();
        let first = iter.next()?.bounds();
        Some(iter.fold(first, |acc, tile| acc.union(&tile.bounds())))
    }

    /// Mosaic the required cells into one raster.
    ///
    /// The output covers the union of the required cells at the finest input
    /// pixel size. Each output pixel takes the nearest sample from the tile
    /// whose cell contains the pixel centre.
    pub fn assemble(&self, required: &[TileId]) -> Result<DemTile> {
        let bounds = Self::coverage(required).ok_or(DemError::EmptyMosaic)?;

        let missing = self.missing(required);
        if !missing.is_empty() {
            return Err(DemError::PartialCoverage { missing });
        }

        // Finest pixel size across inputs
        let mut scale_x = f64::INFINITY;
        let mut scale_y = f64::INFINITY;
        for tile in required {
            let (sx, sy) = probe_pixel_size(&self.tiles[tile], *tile)?;
            scale_x = scale_x.min(sx);
            scale_y = scale_y.min(sy);
        }

        let width = ((bounds.width_deg() / scale_x).round() as u32).max(1);
        let height = ((bounds.height_deg() / scale_y).round() as u32).max(1);
        let px = bounds.width_deg() / width as f64;
        let py = bounds.height_deg() / height as f64;

        debug!(
            tiles = required.len(),
            width,
            height,
            resolution = %self.resolution,
            "Assembling mosaic"
        );

        let mut data = vec![DEFAULT_NODATA; width as usize * height as usize];

        // One tile in memory at a time
        for tile in required {
            let cell = tile.bounds();
            let raster = DemTile::from_file_in_cell(&self.tiles[tile], *tile)?;

            let cols: Vec<(usize, f64)> = (0..width as usize)
                .map(|c| (c, bounds.west() + (c as f64 + 0.5) * px))
                .filter(|(_, lon)| *lon >= cell.west() && *lon < cell.east())
                .collect();

            for r in 0..height as usize {
                let lat = bounds.north() - (r as f64 + 0.5) * py;
                if lat < cell.south() || lat >= cell.north() {
                    continue;
                }
                let row = &mut data[r * width as usize..(r + 1) * width as usize];
                for &(c, lon) in &cols {
                    if let Some(value) = raster.sample_nearest(lat, lon) {
                        row[c] = value;
                    }
                }
            }
        }

        DemTile::new(data, width, height, bounds, Some(DEFAULT_NODATA))
    }

    /// Assemble and write the result as a GeoTIFF at `output`.
    ///
    /// The file appears atomically; on any failure (including partial
    /// coverage) nothing is written at `output`.
    pub fn assemble_to<P: AsRef<Path>>(&self, required: &[TileId], output: P) -> Result<DemTile> {
        let raster = self.assemble(required)?;
        write_geotiff_atomic(&raster, output.as_ref())?;
        Ok(raster)
    }
}

/// Write a raster through a temporary file in the destination directory and
/// rename it into place.
pub fn write_geotiff_atomic(raster: &DemTile, output: &Path) -> Result<()> {
    let dir = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let bytes = raster.to_geotiff_bytes()?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        writer.write_all(&bytes)?;
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(output).map_err(|e| DemError::Io(e.error))?;

    debug!(path = %output.display(), bytes = bytes.len(), "Wrote raster");
    Ok(())
}

//! The canonical 1°×1° tile grid.
//!
//! Every cached elevation tile is addressed by the integer southwest corner of
//! the 1°×1° cell it covers plus a resolution class. Any two regions whose
//! footprints touch the same cell resolve to the same [`TileId`] and therefore
//! the same canonical filename, which is what lets overlapping regions share
//! cached downloads.
//!
//! ## Canonical Names
//!
//! `N47_W123_10m.tif` is the cell from 47°N to 48°N and 123°W to 122°W at the
//! 10 m resolution class:
//! - hemisphere letter (`N`/`S`) + two-digit absolute latitude
//! - hemisphere letter (`E`/`W`) + three-digit absolute longitude
//! - resolution label
//!
//! All functions here are pure; nothing touches the filesystem.

use crate::{DemError, GeoBounds, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// File extension used for cached tiles.
pub const TILE_EXTENSION: &str = "tif";

/// Resolution classes served by elevation sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Resolution {
    /// 1/3 arc-second class (~10 m).
    M10,
    /// 1 arc-second class (~30 m).
    M30,
    /// 3 arc-second class (~90 m).
    M90,
    /// Coarse fallback (~250 m).
    M250,
    /// Coarse fallback (~500 m).
    M500,
    /// Coarse fallback (~1 km).
    M1000,
}

impl Resolution {
    /// Every class, finest first.
    pub const ALL: [Resolution; 6] = [
        Resolution::M10,
        Resolution::M30,
        Resolution::M90,
        Resolution::M250,
        Resolution::M500,
        Resolution::M1000,
    ];

    /// Nominal ground sample distance in meters.
    pub const fn meters(self) -> u32 {
        match self {
            Resolution::M10 => 10,
            Resolution::M30 => 30,
            Resolution::M90 => 90,
            Resolution::M250 => 250,
            Resolution::M500 => 500,
            Resolution::M1000 => 1000,
        }
    }

    /// Label used in canonical filenames (e.g. `"30m"`).
    pub const fn label(self) -> &'static str {
        match self {
            Resolution::M10 => "10m",
            Resolution::M30 => "30m",
            Resolution::M90 => "90m",
            Resolution::M250 => "250m",
            Resolution::M500 => "500m",
            Resolution::M1000 => "1000m",
        }
    }

    /// Look up a class by its nominal meters.
    pub fn from_meters(meters: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.meters() == meters)
    }

    /// Look up a class by its filename label.
    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.label() == label)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl TryFrom<u32> for Resolution {
    type Error = DemError;

    fn try_from(meters: u32) -> Result<Self> {
        Self::from_meters(meters)
            .ok_or_else(|| DemError::UnsupportedResolution(format!("{meters} m")))
    }
}

impl From<Resolution> for u32 {
    fn from(r: Resolution) -> u32 {
        r.meters()
    }
}

/// A 1°×1° grid cell identified by its integer southwest corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileId {
    /// Latitude of the south edge (-90 to 89).
    pub south: i32,
    /// Longitude of the west edge (-180 to 179).
    pub west: i32,
}

impl TileId {
    /// Create a tile id, rejecting corners off the grid.
    pub fn new(south: i32, west: i32) -> Result<Self> {
        if !(-90..90).contains(&south) || !(-180..180).contains(&west) {
            return Err(DemError::InvalidCell { south, west });
        }
        Ok(Self { south, west })
    }

    /// The cell containing a coordinate.
    ///
    /// Points on the north or east edge of the globe fall into the last cell.
    pub fn containing(lat: f64, lon: f64) -> Self {
        let south = (lat.floor() as i32).clamp(-90, 89);
        let west = (lon.floor() as i32).clamp(-180, 179);
        Self { south, west }
    }

    /// Geographic bounds of the cell (always exactly 1°×1°).
    pub fn bounds(&self) -> GeoBounds {
        GeoBounds::from_valid(
            self.west as f64,
            self.south as f64,
            (self.west + 1) as f64,
            (self.south + 1) as f64,
        )
    }

    /// Canonical cache filename for this cell at a resolution class.
    pub fn canonical_name(&self, resolution: Resolution) -> String {
        canonical_name(*self, resolution)
    }

    /// Parse a canonical filename like `S05_E120_30m.tif`.
    pub fn from_canonical_name(name: &str) -> Result<(TileId, Resolution)> {
        let invalid = || DemError::InvalidFilename(name.to_string());

        let stem = name
            .strip_suffix(TILE_EXTENSION)
            .and_then(|s| s.strip_suffix('.'))
            .ok_or_else(invalid)?;

        let mut parts = stem.split('_');
        let (lat_part, lon_part, res_part) =
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(a), Some(b), Some(c), None) => (a, b, c),
                _ => return Err(invalid()),
            };

        let south = parse_hemisphere(lat_part, 'N', 'S', 2).ok_or_else(invalid)?;
        let west = parse_hemisphere(lon_part, 'E', 'W', 3).ok_or_else(invalid)?;
        let resolution = Resolution::from_label(res_part).ok_or_else(invalid)?;

        let tile = TileId::new(south, west).map_err(|_| invalid())?;
        Ok((tile, resolution))
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (lat_hemi, lon_hemi) = hemispheres(*self);
        write!(
            f,
            "{}{:02}{}{:03}",
            lat_hemi,
            self.south.unsigned_abs(),
            lon_hemi,
            self.west.unsigned_abs()
        )
    }
}

/// Parse `N47` / `W123` style components with a fixed digit count.
fn parse_hemisphere(part: &str, positive: char, negative: char, digits: usize) -> Option<i32> {
    let mut chars = part.chars();
    let sign = match chars.next()? {
        c if c == positive => 1,
        c if c == negative => -1,
        _ => return None,
    };
    let number = chars.as_str();
    if number.len() != digits || !number.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let value: i32 = number.parse().ok()?;
    // "S00" / "W000" are never produced; reject them so names stay unique.
    if sign < 0 && value == 0 {
        return None;
    }
    Some(sign * value)
}

fn hemispheres(tile: TileId) -> (char, char) {
    let lat = if tile.south >= 0 { 'N' } else { 'S' };
    let lon = if tile.west >= 0 { 'E' } else { 'W' };
    (lat, lon)
}

/// Expand bounds outward to whole degrees.
///
/// West/south are floored and east/north are ceiled, so the result always
/// contains the input.
pub fn snap_to_grid(bounds: &GeoBounds) -> GeoBounds {
    GeoBounds::from_valid(
        bounds.west().floor(),
        bounds.south().floor(),
        bounds.east().ceil(),
        bounds.north().ceil(),
    )
}

/// Enumerate every 1°×1° cell touched by `bounds`.
///
/// Cells are ordered south to north, then west to east. The result is never
/// empty for valid bounds.
pub fn decompose(bounds: &GeoBounds) -> Vec<TileId> {
    let snapped = snap_to_grid(bounds);
    let south = snapped.south() as i32;
    let north = snapped.north() as i32;
    let west = snapped.west() as i32;
    let east = snapped.east() as i32;

    let mut tiles = Vec::with_capacity(((north - south) * (east - west)) as usize);
    for lat in south..north {
        for lon in west..east {
            tiles.push(TileId { south: lat, west: lon });
        }
    }
    tiles
}

/// Deterministic, collision-free cache filename for a tile.
pub fn canonical_name(tile: TileId, resolution: Resolution) -> String {
    let (lat_hemi, lon_hemi) = hemispheres(tile);
    format!(
        "{}{:02}_{}{:03}_{}.{}",
        lat_hemi,
        tile.south.unsigned_abs(),
        lon_hemi,
        tile.west.unsigned_abs(),
        resolution.label(),
        TILE_EXTENSION
    )
}

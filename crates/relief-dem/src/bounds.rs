//! Geographic bounding boxes.

use crate::{DemError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An immutable `(west, south, east, north)` box in decimal degrees.
///
/// Construction enforces `west < east` and `south < north`, finite values,
/// latitudes within ±90° and longitudes within ±180°.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawBounds")]
pub struct GeoBounds {
    west: f64,
    south: f64,
    east: f64,
    north: f64,
}

/// Unvalidated wire form, checked through `TryFrom`.
#[derive(Deserialize)]
struct RawBounds {
    west: f64,
    south: f64,
    east: f64,
    north: f64,
}

impl TryFrom<RawBounds> for GeoBounds {
    type Error = DemError;

    fn try_from(raw: RawBounds) -> Result<Self> {
        GeoBounds::new(raw.west, raw.south, raw.east, raw.north)
    }
}

impl GeoBounds {
    /// Create a bounding box, validating its invariants.
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Result<Self> {
        let finite = [west, south, east, north].iter().all(|v| v.is_finite());
        let on_globe = (-180.0..=180.0).contains(&west)
            && (-180.0..=180.0).contains(&east)
            && (-90.0..=90.0).contains(&south)
            && (-90.0..=90.0).contains(&north);

        if !finite || !on_globe || west >= east || south >= north {
            return Err(DemError::InvalidBounds {
                west,
                south,
                east,
                north,
            });
        }

        Ok(Self {
            west,
            south,
            east,
            north,
        })
    }

    /// Create a bounding box after clamping its edges to the globe.
    ///
    /// Fails only when the clamped box is empty or a value is not finite.
    pub fn clamped(west: f64, south: f64, east: f64, north: f64) -> Result<Self> {
        if ![west, south, east, north].iter().all(|v| v.is_finite()) {
            return Err(DemError::InvalidBounds {
                west,
                south,
                east,
                north,
            });
        }
        Self::new(
            west.max(-180.0),
            south.max(-90.0),
            east.min(180.0),
            north.min(90.0),
        )
    }

    /// West edge (minimum longitude).
    pub fn west(&self) -> f64 {
        self.west
    }

    /// South edge (minimum latitude).
    pub fn south(&self) -> f64 {
        self.south
    }

    /// East edge (maximum longitude).
    pub fn east(&self) -> f64 {
        self.east
    }

    /// North edge (maximum latitude).
    pub fn north(&self) -> f64 {
        self.north
    }

    /// Longitude span in degrees.
    pub fn width_deg(&self) -> f64 {
        self.east - self.west
    }

    /// Latitude span in degrees.
    pub fn height_deg(&self) -> f64 {
        self.north - self.south
    }

    /// Centre point as `(lat, lon)`.
    pub fn center(&self) -> (f64, f64) {
        (
            (self.south + self.north) / 2.0,
            (self.west + self.east) / 2.0,
        )
    }

    /// Check if a coordinate is within the bounds (edges inclusive).
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.south && lat <= self.north && lon >= self.west && lon <= self.east
    }

    /// Check if `other` lies entirely inside these bounds.
    pub fn contains_bounds(&self, other: &GeoBounds) -> bool {
        other.west >= self.west
            && other.east <= self.east
            && other.south >= self.south
            && other.north <= self.north
    }

    /// Check if the two boxes share any interior area.
    pub fn intersects(&self, other: &GeoBounds) -> bool {
        self.west < other.east
            && other.west < self.east
            && self.south < other.north
            && other.south < self.north
    }

    /// Smallest box covering both inputs.
    pub fn union(&self, other: &GeoBounds) -> GeoBounds {
        GeoBounds {
            west: self.west.min(other.west),
            south: self.south.min(other.south),
            east: self.east.max(other.east),
            north: self.north.max(other.north),
        }
    }

    /// Build from values already known to satisfy the invariants.
    pub(crate) fn from_valid(west: f64, south: f64, east: f64, north: f64) -> Self {
        debug_assert!(west < east && south < north);
        Self {
            west,
            south,
            east,
            north,
        }
    }
}

impl fmt::Display for GeoBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[W {:.4}, S {:.4}, E {:.4}, N {:.4}]",
            self.west, self.south, self.east, self.north
        )
    }
}

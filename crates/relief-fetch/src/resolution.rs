//! Resolution selection.
//!
//! Picks the coarsest source resolution that still samples the requested
//! output well. A resolution `r` is acceptable for a visible pixel size `V`
//! when the source oversamples the output at least 2× (`V / r >= 2`), or when
//! `r` sits within 0.8×–1.2× of `V` and so matches the output directly.
//! Anything in between (e.g. 1.5× oversampling) is rejected and selection
//! falls through to a finer resolution.

use crate::{FetchError, Result};
use relief_dem::{GeoBounds, Resolution};
use serde::{Deserialize, Serialize};

/// Meters per degree of latitude (and of longitude at the equator).
pub const METERS_PER_DEGREE: f64 = 111_320.0;

/// Minimum oversampling ratio for the Nyquist rule.
pub const NYQUIST_FACTOR: f64 = 2.0;

/// `r / V` band treated as a native match.
pub const NATIVE_BAND: (f64, f64) = (0.8, 1.2);

/// Which resolutions a region can reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionClass {
    /// Covered by national high-resolution programs (10, 30, 90 m).
    Domestic,
    /// Global sources only (30, 90 m).
    International,
}

impl RegionClass {
    /// Reachable resolutions, finest first.
    pub fn resolutions(self, coarse_fallbacks: bool) -> Vec<Resolution> {
        let mut resolutions = match self {
            RegionClass::Domestic => vec![Resolution::M10, Resolution::M30, Resolution::M90],
            RegionClass::International => vec![Resolution::M30, Resolution::M90],
        };
        if coarse_fallbacks {
            resolutions.extend([Resolution::M250, Resolution::M500, Resolution::M1000]);
        }
        resolutions
    }
}

/// Outcome of resolution selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolutionChoice {
    /// Selected resolution class.
    pub resolution: Resolution,
    /// Whether the selection satisfies the sampling rule.
    pub acceptable: bool,
    /// Whether the caller accepted reduced quality to get this result.
    pub degraded: bool,
    /// Ground size of one output pixel in meters.
    pub visible_pixel_m: f64,
    /// `visible_pixel_m / resolution`.
    pub oversampling: f64,
}

/// Ground size in meters of one output pixel for a region rendered with
/// `max_dimension` pixels along its longer side.
///
/// Longitude spans are scaled by the cosine of the centre latitude.
/// `max_dimension` is clamped to at least 1.
pub fn visible_pixel_size(bounds: &GeoBounds, max_dimension: u32) -> f64 {
    let (center_lat, _) = bounds.center();
    let width_m = bounds.width_deg() * METERS_PER_DEGREE * center_lat.to_radians().cos();
    let height_m = bounds.height_deg() * METERS_PER_DEGREE;
    width_m.max(height_m) / max_dimension.max(1) as f64
}

/// Whether a source resolution samples the given visible pixel size well.
pub fn is_acceptable(visible_pixel_m: f64, resolution: Resolution) -> bool {
    let r = resolution.meters() as f64;
    let ratio = r / visible_pixel_m;
    visible_pixel_m / r >= NYQUIST_FACTOR || (NATIVE_BAND.0..=NATIVE_BAND.1).contains(&ratio)
}

/// Select a resolution for a visible pixel size.
///
/// Returns the coarsest acceptable resolution. When none is acceptable,
/// fails with [`FetchError::InsufficientResolution`] unless `allow_degraded`,
/// in which case the finest available resolution is returned and tagged.
pub fn select_resolution(
    visible_pixel_m: f64,
    available: &[Resolution],
    allow_degraded: bool,
) -> Result<ResolutionChoice> {
    let mut sorted = available.to_vec();
    sorted.sort();
    sorted.dedup();

    let choice = |resolution: Resolution, acceptable: bool| ResolutionChoice {
        resolution,
        acceptable,
        degraded: !acceptable,
        visible_pixel_m,
        oversampling: visible_pixel_m / resolution.meters() as f64,
    };

    if let Some(&coarsest) = sorted.iter().rev().find(|r| is_acceptable(visible_pixel_m, **r)) {
        return Ok(choice(coarsest, true));
    }

    match sorted.first() {
        Some(&finest) if allow_degraded => Ok(choice(finest, false)),
        _ => Err(FetchError::InsufficientResolution {
            visible_pixel_m,
            available: sorted,
        }),
    }
}

/// Select a resolution for a region and output pixel budget.
pub fn choose_for_region(
    bounds: &GeoBounds,
    max_dimension: u32,
    available: &[Resolution],
    allow_degraded: bool,
) -> Result<ResolutionChoice> {
    select_resolution(visible_pixel_size(bounds, max_dimension), available, allow_degraded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const STANDARD: [Resolution; 3] = [Resolution::M10, Resolution::M30, Resolution::M90];

    #[test]
    fn test_native_band_match() {
        let choice = select_resolution(9.6, &STANDARD, false).unwrap();
        assert_eq!(choice.resolution, Resolution::M10);
        assert!(choice.acceptable && !choice.degraded);
    }

    #[test]
    fn test_nyquist_prefers_coarsest_acceptable() {
        // 30 m only oversamples 1.37x, so 10 m wins
        let choice = select_resolution(41.0, &STANDARD, false).unwrap();
        assert_eq!(choice.resolution, Resolution::M10);
        assert_relative_eq!(choice.oversampling, 4.1);
    }

    #[test]
    fn test_large_pixels_select_coarsest() {
        let choice = select_resolution(1000.0, &STANDARD, false).unwrap();
        assert_eq!(choice.resolution, Resolution::M90);
        assert!(choice.acceptable);
        assert!(!choice.degraded);
    }

    #[test]
    fn test_one_and_a_half_times_falls_through() {
        // 45 m visible against 30 m is 1.5x: neither rule holds
        assert!(!is_acceptable(45.0, Resolution::M30));
        let choice = select_resolution(45.0, &STANDARD, false).unwrap();
        assert_eq!(choice.resolution, Resolution::M10);
    }

    #[test]
    fn test_insufficient_and_degraded() {
        let err = select_resolution(5.0, &STANDARD, false).unwrap_err();
        assert!(matches!(err, FetchError::InsufficientResolution { .. }));

        let choice = select_resolution(5.0, &STANDARD, true).unwrap();
        assert_eq!(choice.resolution, Resolution::M10);
        assert!(!choice.acceptable);
        assert!(choice.degraded);

        assert!(select_resolution(5.0, &[], true).is_err());
    }

    #[test]
    fn test_visible_pixel_size() {
        // 1° of latitude over 1000 px at the equator
        let bounds = GeoBounds::new(0.0, -0.5, 0.5, 0.5).unwrap();
        assert_relative_eq!(visible_pixel_size(&bounds, 1000), 111.32, epsilon = 1e-6);

        // Zero budget clamps to one pixel
        let tiny = GeoBounds::new(10.0, 10.0, 10.0001, 10.0001).unwrap();
        let v = visible_pixel_size(&tiny, 0);
        assert!(v > 0.0 && v.is_finite());
        let choice = select_resolution(v, &STANDARD, true).unwrap();
        assert!(choice.oversampling > 0.0);
    }

    #[test]
    fn test_region_class_resolutions() {
        assert_eq!(
            RegionClass::International.resolutions(false),
            vec![Resolution::M30, Resolution::M90]
        );
        assert_eq!(RegionClass::Domestic.resolutions(true).len(), 6);
    }
}

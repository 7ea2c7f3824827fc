//! Source capability registry.
//!
//! A closed table of elevation providers: what resolution each serves, where
//! it has coverage, whether it needs an API key, and how to address one tile.
//! Selection is a pure filter and sort over these records.

use relief_dem::{GeoBounds, Resolution, TileId};
use serde::Serialize;
use std::cmp::Reverse;

/// Geographic extent a source can serve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Coverage {
    /// Whole globe.
    Global,
    /// Inclusive latitude and longitude ranges in degrees.
    Bounded {
        /// `(min, max)` latitude.
        lat: (f64, f64),
        /// `(min, max)` longitude.
        lon: (f64, f64),
    },
}

impl Coverage {
    /// Whether the whole of `bounds` lies inside the coverage.
    pub fn contains(&self, bounds: &GeoBounds) -> bool {
        match *self {
            Coverage::Global => true,
            Coverage::Bounded { lat, lon } => {
                bounds.south() >= lat.0
                    && bounds.north() <= lat.1
                    && bounds.west() >= lon.0
                    && bounds.east() <= lon.1
            }
        }
    }
}

/// How to build a request URL for one tile.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceEndpoint {
    /// USGS 3DEP staged products on S3, one file per 1°×1° cell named by its
    /// northwest corner (e.g. `USGS_13_n48w123.tif`).
    UsgsStaged {
        /// Product code (`"13"` for 1/3 arc-second, `"1"` for 1 arc-second).
        product: String,
    },
    /// Copernicus DEM cloud-optimised GeoTIFFs on S3, named by southwest corner.
    CopernicusCog {
        /// Arc-second sampling (10 for GLO-30, 30 for GLO-90).
        arc_seconds: u32,
    },
    /// OpenTopography global DEM API, queried with the cell's bounds.
    OpenTopography {
        /// `demtype` query parameter.
        dem_type: String,
    },
}

impl SourceEndpoint {
    /// Request URL for a tile. `api_key` is only embedded for endpoints that
    /// take one; such URLs must not be logged.
    pub fn url(&self, tile: TileId, api_key: Option<&str>) -> String {
        match self {
            SourceEndpoint::UsgsStaged { product } => {
                let north = tile.south + 1;
                let cell = format!(
                    "{}{:02}{}{:03}",
                    if north >= 0 { 'n' } else { 's' },
                    north.unsigned_abs(),
                    if tile.west < 0 { 'w' } else { 'e' },
                    tile.west.unsigned_abs()
                );
                format!(
                    "https://prd-tnm.s3.amazonaws.com/StagedProducts/Elevation/{product}/TIFF/current/{cell}/USGS_{product}_{cell}.tif"
                )
            }
            SourceEndpoint::CopernicusCog { arc_seconds } => {
                let bucket = if *arc_seconds >= 30 { "90m" } else { "30m" };
                let name = format!(
                    "Copernicus_DSM_COG_{}_{}{:02}_00_{}{:03}_00_DEM",
                    arc_seconds,
                    if tile.south >= 0 { 'N' } else { 'S' },
                    tile.south.unsigned_abs(),
                    if tile.west >= 0 { 'E' } else { 'W' },
                    tile.west.unsigned_abs()
                );
                format!("https://copernicus-dem-{bucket}.s3.amazonaws.com/{name}/{name}.tif")
            }
            SourceEndpoint::OpenTopography { dem_type } => {
                let mut url = format!(
                    "https://portal.opentopography.org/API/globaldem?demtype={}&south={}&north={}&west={}&east={}&outputFormat=GTiff",
                    dem_type,
                    tile.south,
                    tile.south + 1,
                    tile.west,
                    tile.west + 1
                );
                if let Some(key) = api_key {
                    url.push_str("&API_Key=");
                    url.push_str(key);
                }
                url
            }
        }
    }
}

/// Declared capabilities of one elevation source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceCapability {
    /// Stable identifier, also the cache subdirectory name.
    pub source_id: String,
    /// Resolution class served.
    pub resolution: Resolution,
    /// Where the source has data.
    pub coverage: Coverage,
    /// Whether requests need an API key.
    pub requires_auth: bool,
    /// Credential name passed to the credential provider.
    pub auth_key_name: Option<String>,
    /// Lower ranks are tried first.
    pub priority_rank: u32,
    /// Request addressing.
    pub endpoint: SourceEndpoint,
}

impl SourceCapability {
    /// A keyless source with rank 0.
    pub fn new(
        source_id: impl Into<String>,
        resolution: Resolution,
        coverage: Coverage,
        endpoint: SourceEndpoint,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            resolution,
            coverage,
            requires_auth: false,
            auth_key_name: None,
            priority_rank: 0,
            endpoint,
        }
    }

    /// Set the priority rank.
    pub fn with_rank(mut self, rank: u32) -> Self {
        self.priority_rank = rank;
        self
    }

    /// Require an API key under the given credential name.
    pub fn with_auth(mut self, key_name: impl Into<String>) -> Self {
        self.requires_auth = true;
        self.auth_key_name = Some(key_name.into());
        self
    }
}

/// Credential name used by every OpenTopography source.
pub const OPENTOPOGRAPHY_KEY: &str = "OPENTOPOGRAPHY_API_KEY";

/// The set of known sources.
#[derive(Debug, Clone)]
pub struct SourceRegistry {
    sources: Vec<SourceCapability>,
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl SourceRegistry {
    /// A registry over an explicit table.
    pub fn new(sources: Vec<SourceCapability>) -> Self {
        Self { sources }
    }

    /// The built-in provider table.
    ///
    /// Keyless object-storage sources rank ahead of keyed API sources.
    pub fn builtin() -> Self {
        let usgs = |product: &str| SourceEndpoint::UsgsStaged {
            product: product.to_string(),
        };
        let opentopo = |dem_type: &str| SourceEndpoint::OpenTopography {
            dem_type: dem_type.to_string(),
        };
        let srtm_band = Coverage::Bounded {
            lat: (-56.0, 60.0),
            lon: (-180.0, 180.0),
        };

        Self::new(vec![
            SourceCapability::new(
                "usgs_3dep_13",
                Resolution::M10,
                Coverage::Bounded {
                    lat: (24.0, 50.0),
                    lon: (-125.0, -66.0),
                },
                usgs("13"),
            )
            .with_rank(10),
            SourceCapability::new(
                "usgs_3dep_1",
                Resolution::M30,
                Coverage::Bounded {
                    lat: (17.0, 72.0),
                    lon: (-180.0, -64.0),
                },
                usgs("1"),
            )
            .with_rank(10),
            SourceCapability::new(
                "copernicus_glo30",
                Resolution::M30,
                Coverage::Global,
                SourceEndpoint::CopernicusCog { arc_seconds: 10 },
            )
            .with_rank(20),
            SourceCapability::new(
                "copernicus_glo90",
                Resolution::M90,
                Coverage::Global,
                SourceEndpoint::CopernicusCog { arc_seconds: 30 },
            )
            .with_rank(20),
            SourceCapability::new(
                "opentopo_srtmgl1",
                Resolution::M30,
                srtm_band,
                opentopo("SRTMGL1"),
            )
            .with_rank(30)
            .with_auth(OPENTOPOGRAPHY_KEY),
            SourceCapability::new(
                "opentopo_srtmgl3",
                Resolution::M90,
                srtm_band,
                opentopo("SRTMGL3"),
            )
            .with_rank(30)
            .with_auth(OPENTOPOGRAPHY_KEY),
            SourceCapability::new(
                "opentopo_srtm15plus",
                Resolution::M500,
                Coverage::Global,
                opentopo("SRTM15Plus"),
            )
            .with_rank(40)
            .with_auth(OPENTOPOGRAPHY_KEY),
            SourceCapability::new(
                "opentopo_gedi_l3",
                Resolution::M1000,
                Coverage::Bounded {
                    lat: (-52.0, 52.0),
                    lon: (-180.0, 180.0),
                },
                opentopo("GEDI_L3"),
            )
            .with_rank(40)
            .with_auth(OPENTOPOGRAPHY_KEY),
        ])
    }

    /// All registered sources.
    pub fn sources(&self) -> &[SourceCapability] {
        &self.sources
    }

    /// Look up a source by id.
    pub fn get(&self, source_id: &str) -> Option<&SourceCapability> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    /// Sources that serve `resolution` over all of `bounds`, in the order they
    /// should be tried.
    ///
    /// Ids listed in `overrides` come first in list order; the rest follow by
    /// `priority_rank`, ties broken by id.
    pub fn select(
        &self,
        resolution: Resolution,
        bounds: &GeoBounds,
        overrides: &[String],
    ) -> Vec<&SourceCapability> {
        let mut candidates: Vec<&SourceCapability> = self
            .sources
            .iter()
            .filter(|s| s.resolution == resolution && s.coverage.contains(bounds))
            .collect();

        candidates.sort_by_key(|s| {
            let pinned = overrides.iter().position(|id| *id == s.source_id);
            (Reverse(pinned.is_some()), pinned, s.priority_rank, s.source_id.clone())
        });
        candidates
    }

    /// Distinct resolutions some source can serve over all of `bounds`,
    /// finest first.
    pub fn resolutions_covering(&self, bounds: &GeoBounds) -> Vec<Resolution> {
        let mut resolutions: Vec<Resolution> = self
            .sources
            .iter()
            .filter(|s| s.coverage.contains(bounds))
            .map(|s| s.resolution)
            .collect();
        resolutions.sort();
        resolutions.dedup();
        resolutions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seattle() -> GeoBounds {
        GeoBounds::new(-122.6, 47.2, -121.4, 47.9).unwrap()
    }

    fn ids(sources: &[&SourceCapability]) -> Vec<String> {
        sources.iter().map(|s| s.source_id.clone()).collect()
    }

    #[test]
    fn test_select_filters_by_resolution_and_coverage() {
        let registry = SourceRegistry::builtin();

        assert_eq!(
            ids(&registry.select(Resolution::M10, &seattle(), &[])),
            vec!["usgs_3dep_13"]
        );
        assert_eq!(
            ids(&registry.select(Resolution::M30, &seattle(), &[])),
            vec!["usgs_3dep_1", "copernicus_glo30", "opentopo_srtmgl1"]
        );

        // Alps: no USGS coverage
        let alps = GeoBounds::new(7.0, 45.5, 8.5, 46.5).unwrap();
        assert!(registry.select(Resolution::M10, &alps, &[]).is_empty());
        assert_eq!(
            ids(&registry.select(Resolution::M30, &alps, &[])),
            vec!["copernicus_glo30", "opentopo_srtmgl1"]
        );
    }

    #[test]
    fn test_region_must_be_fully_covered() {
        let registry = SourceRegistry::builtin();
        // Straddles the 60°N limit of SRTM
        let north = GeoBounds::new(10.0, 59.5, 11.0, 60.5).unwrap();
        assert_eq!(
            ids(&registry.select(Resolution::M30, &north, &[])),
            vec!["copernicus_glo30"]
        );
    }

    #[test]
    fn test_override_order_wins() {
        let registry = SourceRegistry::builtin();
        let overrides = vec!["opentopo_srtmgl1".to_string(), "copernicus_glo30".to_string()];
        assert_eq!(
            ids(&registry.select(Resolution::M30, &seattle(), &overrides)),
            vec!["opentopo_srtmgl1", "copernicus_glo30", "usgs_3dep_1"]
        );
    }

    #[test]
    fn test_resolutions_covering() {
        let registry = SourceRegistry::builtin();
        assert_eq!(
            registry.resolutions_covering(&seattle()),
            vec![
                Resolution::M10,
                Resolution::M30,
                Resolution::M90,
                Resolution::M500,
                Resolution::M1000,
            ]
        );
    }

    #[test]
    fn test_endpoint_urls() {
        let tile = TileId::new(47, -123).unwrap();
        let registry = SourceRegistry::builtin();

        let usgs = registry.get("usgs_3dep_13").unwrap();
        assert_eq!(
            usgs.endpoint.url(tile, None),
            "https://prd-tnm.s3.amazonaws.com/StagedProducts/Elevation/13/TIFF/current/n48w123/USGS_13_n48w123.tif"
        );

        let glo30 = registry.get("copernicus_glo30").unwrap();
        assert_eq!(
            glo30.endpoint.url(TileId::new(50, 12).unwrap(), None),
            "https://copernicus-dem-30m.s3.amazonaws.com/Copernicus_DSM_COG_10_N50_00_E012_00_DEM/Copernicus_DSM_COG_10_N50_00_E012_00_DEM.tif"
        );

        let srtm = registry.get("opentopo_srtmgl1").unwrap();
        assert!(srtm.requires_auth);
        let url = srtm.endpoint.url(tile, Some("secret"));
        assert!(url.contains("demtype=SRTMGL1&south=47&north=48&west=-123&east=-122"));
        assert!(url.ends_with("&API_Key=secret"));
    }
}

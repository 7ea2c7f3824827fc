//! Shared fixtures: a scripted in-memory transport and executor wiring.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use relief_dem::{DemTile, Resolution, TileId, DEFAULT_NODATA};
use relief_fetch::rate_limit::MemoryStateStore;
use relief_fetch::{
    Coverage, FetchConfig, FetchExecutor, ManualClock, RateLimitConfig, RateLimiter,
    SourceCapability, SourceEndpoint, SourceRegistry, StaticCredentials, TileRequest, TileTransport,
    TransportResponse,
};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Pixels per side of served tiles.
pub const TILE_SIZE: u32 = 32;

/// How a source answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    NotFound,
    Reject(u16),
    Fail,
    Serve,
    Garbage,
}

type Hook = Box<dyn Fn(&TileRequest<'_>) + Send + Sync>;

/// Answers per source id and counts every request.
pub struct ScriptedTransport {
    replies: Mutex<HashMap<String, Reply>>,
    missing: HashSet<TileId>,
    delay: Option<Duration>,
    hook: Option<Hook>,
    requests: AtomicUsize,
    log: Mutex<Vec<(String, TileId, String)>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(HashMap::new()),
            missing: HashSet::new(),
            delay: None,
            hook: None,
            requests: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Script a source. Unscripted sources answer `NotFound`.
    pub fn reply(self, source_id: &str, reply: Reply) -> Self {
        self.replies.lock().insert(source_id.to_string(), reply);
        self
    }

    /// Every source answers `NotFound` for this tile.
    pub fn missing_tile(mut self, tile: TileId) -> Self {
        self.missing.insert(tile);
        self
    }

    /// Sleep for real before answering.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Run a callback on every request.
    pub fn on_request(mut self, hook: impl Fn(&TileRequest<'_>) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    /// Change a source's script mid-test.
    pub fn set_reply(&self, source_id: &str, reply: Reply) {
        self.replies.lock().insert(source_id.to_string(), reply);
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// `(source_id, tile, url)` per request, in arrival order.
    pub fn log(&self) -> Vec<(String, TileId, String)> {
        self.log.lock().clone()
    }
}

impl TileTransport for ScriptedTransport {
    fn get(&self, request: &TileRequest<'_>) -> TransportResponse {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.log
            .lock()
            .push((request.source_id.to_string(), request.tile, request.url.to_string()));
        if let Some(hook) = &self.hook {
            hook(request);
        }
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }

        if self.missing.contains(&request.tile) {
            return TransportResponse::NotFound;
        }
        let reply = self
            .replies
            .lock()
            .get(request.source_id)
            .copied()
            .unwrap_or(Reply::NotFound);
        match reply {
            Reply::NotFound => TransportResponse::NotFound,
            Reply::Reject(status) => TransportResponse::Rejected { status },
            Reply::Fail => TransportResponse::Failed {
                status: Some(503),
                reason: "HTTP 503".to_string(),
            },
            Reply::Serve => TransportResponse::Body(tile_bytes(request.tile)),
            Reply::Garbage => TransportResponse::Body(vec![0x42; 4096]),
        }
    }
}

/// Elevation written into every pixel of a served tile.
pub fn tile_value(tile: TileId) -> f32 {
    (tile.south * 100 + tile.west) as f32
}

/// A valid GeoTIFF for a tile's cell.
pub fn tile_bytes(tile: TileId) -> Vec<u8> {
    DemTile::new(
        vec![tile_value(tile); (TILE_SIZE * TILE_SIZE) as usize],
        TILE_SIZE,
        TILE_SIZE,
        tile.bounds(),
        Some(DEFAULT_NODATA),
    )
    .unwrap()
    .to_geotiff_bytes()
    .unwrap()
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()
}

/// Three keyless global 30 m sources ranked alpha, bravo, charlie.
pub fn test_sources() -> Vec<SourceCapability> {
    ["alpha", "bravo", "charlie"]
        .iter()
        .enumerate()
        .map(|(rank, id)| {
            SourceCapability::new(
                *id,
                Resolution::M30,
                Coverage::Global,
                SourceEndpoint::CopernicusCog { arc_seconds: 10 },
            )
            .with_rank(rank as u32)
        })
        .collect()
}

/// A keyed 30 m source.
pub fn keyed_source() -> SourceCapability {
    SourceCapability::new(
        "delta",
        Resolution::M30,
        Coverage::Global,
        SourceEndpoint::OpenTopography {
            dem_type: "COP30".to_string(),
        },
    )
    .with_rank(10)
    .with_auth("DELTA_KEY")
}

/// Executor settings.
pub struct Setup {
    pub sources: Vec<SourceCapability>,
    pub fetch: FetchConfig,
    pub rate_limit: RateLimitConfig,
    pub credentials: StaticCredentials,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            sources: test_sources(),
            fetch: FetchConfig::default(),
            rate_limit: RateLimitConfig::default(),
            credentials: StaticCredentials::new(),
        }
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub clock: Arc<ManualClock>,
    pub transport: Arc<ScriptedTransport>,
    pub limiter: Arc<RateLimiter>,
    pub executor: Arc<FetchExecutor>,
}

impl Harness {
    pub fn new(setup: Setup, transport: ScriptedTransport) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(start_time()));
        let transport = Arc::new(transport);
        let limiter = Arc::new(RateLimiter::new(
            Arc::new(MemoryStateStore::new()),
            clock.clone(),
            setup.rate_limit,
        ));
        let executor = Arc::new(FetchExecutor::new(
            Arc::new(SourceRegistry::new(setup.sources)),
            limiter.clone(),
            transport.clone(),
            Arc::new(setup.credentials),
            clock.clone(),
            dir.path().join("cache"),
            setup.fetch,
        ));
        Self {
            dir,
            clock,
            transport,
            limiter,
            executor,
        }
    }

    pub fn with_transport(transport: ScriptedTransport) -> Self {
        Self::new(Setup::default(), transport)
    }

    pub fn cache_root(&self) -> PathBuf {
        self.dir.path().join("cache")
    }

    pub fn output_root(&self) -> PathBuf {
        self.dir.path().join("regions")
    }
}

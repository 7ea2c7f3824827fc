//! End-to-end region acquisition against a scripted transport.

mod common;

use common::{tile_value, Harness, Reply, ScriptedTransport};
use relief_dem::{check_tile_header, decompose, DemTile, GeoBounds, Resolution, TileId};
use relief_fetch::version::{invalidate, VersionEntry};
use relief_fetch::{
    CacheValidator, CancelToken, Clock, FetchError, RegionAcquirer, RegionClass, RegionRecord,
    RegionRequest, Stage, StageVersions,
};
use std::sync::Arc;

fn quad() -> GeoBounds {
    GeoBounds::new(10.2, 45.3, 11.7, 46.8).unwrap()
}

fn request() -> RegionRequest {
    RegionRequest::new("alps", quad(), RegionClass::International, 512)
}

fn acquirer(h: &Harness, versions: StageVersions, workers: usize) -> RegionAcquirer {
    let clock: Arc<dyn Clock> = h.clock.clone();
    RegionAcquirer::new(
        h.executor.clone(),
        CacheValidator::new(versions, clock),
        h.output_root(),
        workers,
    )
    .unwrap()
}

#[test]
fn test_second_acquisition_is_free_and_identical() {
    let h = Harness::with_transport(ScriptedTransport::new().reply("alpha", Reply::Serve));
    let acquirer = acquirer(&h, StageVersions::builtin(), 4);

    let first = acquirer.acquire(&request()).unwrap();
    assert!(!first.reused_artifact);
    assert_eq!(first.tiles_total, 4);
    assert_eq!(first.tiles_downloaded, 4);
    assert_eq!(first.record.resolution_used, Resolution::M30);
    assert!(!first.record.degraded);
    assert_eq!(
        first.record.artifact_path,
        h.output_root().join("alps").join("raw").join("alps_30m.tif")
    );
    let requests = h.transport.requests();
    assert_eq!(requests, 4);
    let bytes = std::fs::read(&first.record.artifact_path).unwrap();

    let second = acquirer.acquire(&request()).unwrap();
    assert!(second.reused_artifact);
    assert_eq!(h.transport.requests(), requests);
    assert_eq!(std::fs::read(&second.record.artifact_path).unwrap(), bytes);

    let record: RegionRecord =
        serde_json::from_slice(&std::fs::read(acquirer.record_path("alps")).unwrap()).unwrap();
    assert_eq!(record, second.record);
}

#[test]
fn test_assembled_raster_matches_tiles() {
    let h = Harness::with_transport(ScriptedTransport::new().reply("bravo", Reply::Serve));
    let acquirer = acquirer(&h, StageVersions::builtin(), 2);

    let result = acquirer.acquire(&request()).unwrap();
    let raster = DemTile::from_file(&result.record.artifact_path).unwrap();
    assert_eq!(raster.dimensions(), (64, 64));
    for tile in decompose(&quad()) {
        let (lat, lon) = tile.bounds().center();
        assert_eq!(raster.sample_nearest(lat, lon), Some(tile_value(tile)));
    }
}

#[test]
fn test_rebuild_from_tile_cache() {
    let h = Harness::with_transport(ScriptedTransport::new().reply("alpha", Reply::Serve));
    let acquirer = acquirer(&h, StageVersions::builtin(), 4);

    let first = acquirer.acquire(&request()).unwrap();
    let bytes = std::fs::read(&first.record.artifact_path).unwrap();
    invalidate(&first.record.artifact_path).unwrap();

    let rebuilt = acquirer.acquire(&request()).unwrap();
    assert!(!rebuilt.reused_artifact);
    assert_eq!(rebuilt.cache_hits, 4);
    assert_eq!(rebuilt.tiles_downloaded, 0);
    assert_eq!(h.transport.requests(), 4);
    assert_eq!(std::fs::read(&rebuilt.record.artifact_path).unwrap(), bytes);
}

#[test]
fn test_breaking_version_forces_reassembly() {
    let h = Harness::with_transport(ScriptedTransport::new().reply("alpha", Reply::Serve));
    acquirer(&h, StageVersions::builtin(), 4).acquire(&request()).unwrap();

    let bumped = StageVersions::builtin().with_history(
        Stage::Raw,
        vec![
            VersionEntry::breaking("1.0"),
            VersionEntry::compatible("1.1"),
            VersionEntry::breaking("2.0"),
        ],
    );
    let acquirer = acquirer(&h, bumped, 4);
    let result = acquirer.acquire(&request()).unwrap();
    assert!(!result.reused_artifact);
    assert_eq!(result.cache_hits, 4);
    assert_eq!(h.transport.requests(), 4);

    let meta = CacheValidator::read_meta(&result.record.artifact_path)
        .unwrap()
        .unwrap();
    assert_eq!(meta.version_tag, "2.0");
    assert_eq!(meta.region_id, "alps");
}

#[test]
fn test_moved_bounds_reassemble_under_same_region_id() {
    let h = Harness::with_transport(ScriptedTransport::new().reply("alpha", Reply::Serve));
    let acquirer = acquirer(&h, StageVersions::builtin(), 4);
    let first = acquirer.acquire(&request()).unwrap();
    assert_eq!(h.transport.requests(), 4);

    let moved = GeoBounds::new(20.2, 45.3, 21.7, 46.8).unwrap();
    let second = acquirer
        .acquire(&RegionRequest::new("alps", moved, RegionClass::International, 512))
        .unwrap();
    assert!(!second.reused_artifact);
    assert_eq!(second.tiles_downloaded, 4);
    assert_eq!(h.transport.requests(), 8);
    assert_eq!(second.record.artifact_path, first.record.artifact_path);
    assert_eq!(second.record.bounds, moved);

    let raster = DemTile::from_file(&second.record.artifact_path).unwrap();
    for tile in decompose(&moved) {
        let (lat, lon) = tile.bounds().center();
        assert_eq!(raster.sample_nearest(lat, lon), Some(tile_value(tile)));
    }
    let meta = CacheValidator::read_meta(&second.record.artifact_path).unwrap().unwrap();
    assert_eq!(meta.bounds, Some(moved));

    // Same bounds again is a reuse
    let third = acquirer
        .acquire(&RegionRequest::new("alps", moved, RegionClass::International, 512))
        .unwrap();
    assert!(third.reused_artifact);
    assert_eq!(h.transport.requests(), 8);
}

#[test]
fn test_missing_tile_fails_region_without_artifact() {
    let missing = TileId::new(46, 11).unwrap();
    let transport = ScriptedTransport::new()
        .reply("alpha", Reply::Serve)
        .missing_tile(missing);
    let h = Harness::with_transport(transport);
    let acquirer = acquirer(&h, StageVersions::builtin(), 1);

    match acquirer.acquire(&request()) {
        Err(FetchError::AllSourcesExhausted { tile, attempts }) => {
            assert_eq!(tile, "N46_E011_30m.tif");
            assert_eq!(attempts.len(), 3);
        }
        other => panic!("expected AllSourcesExhausted, got {other:?}"),
    }
    assert!(!acquirer.artifact_path("alps", Resolution::M30).exists());
    assert!(!acquirer.record_path("alps").exists());
}

#[test]
fn test_cancel_between_tiles_keeps_completed_tiles() {
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    let transport = ScriptedTransport::new()
        .reply("alpha", Reply::Serve)
        .on_request(move |_| trigger.cancel());
    let h = Harness::with_transport(transport);
    let acquirer = acquirer(&h, StageVersions::builtin(), 1);

    assert!(matches!(
        acquirer.acquire_with_cancel(&request(), &cancel),
        Err(FetchError::Cancelled)
    ));
    assert_eq!(h.transport.requests(), 1);
    assert!(!acquirer.artifact_path("alps", Resolution::M30).exists());

    let (_, fetched_tile, _) = h.transport.log()[0].clone();
    let cached = h.executor.store().tile_path("alpha", fetched_tile, Resolution::M30);
    assert!(check_tile_header(&cached, 1024).is_ok());
}

#[test]
fn test_insufficient_resolution_unless_degraded() {
    let h = Harness::with_transport(ScriptedTransport::new().reply("alpha", Reply::Serve));
    let acquirer = acquirer(&h, StageVersions::builtin(), 4);
    let sharp = RegionRequest::new("alps", quad(), RegionClass::International, 100_000);

    assert!(matches!(
        acquirer.acquire(&sharp),
        Err(FetchError::InsufficientResolution { .. })
    ));
    assert_eq!(h.transport.requests(), 0);

    let result = acquirer.acquire(&sharp.with_degraded(true)).unwrap();
    assert!(result.record.degraded);
    assert!(!result.choice.acceptable);
    assert_eq!(result.record.resolution_used, Resolution::M30);
}

#[test]
fn test_invalid_region_id() {
    let h = Harness::with_transport(ScriptedTransport::new());
    let acquirer = acquirer(&h, StageVersions::builtin(), 1);
    let request = RegionRequest::new("../alps", quad(), RegionClass::International, 512);
    assert!(matches!(acquirer.acquire(&request), Err(FetchError::Config(_))));
}

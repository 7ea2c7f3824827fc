//! Artifact versioning and cache validation.
//!
//! Every pipeline artifact has a JSON sidecar (`<artifact>.meta.json`)
//! recording the stage version that produced it and, for derived stages, the
//! SHA-256 of the upstream file it was built from. Region artifacts also
//! record the bounds they were assembled for. An artifact may be reused only
//! while all of these still match; otherwise it is deleted and regenerated.
//! Nothing is ever migrated in place.

use crate::clock::Clock;
use crate::{FetchError, Result};
use chrono::{DateTime, Utc};
use relief_dem::GeoBounds;
use relief_metrics::metric_defs;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Pipeline stages that produce artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Assembled region raster.
    Raw,
    /// Raster cropped to a boundary.
    Clipped,
    /// Reprojected and post-processed raster.
    Processed,
    /// Final exported product.
    Export,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 4] = [Stage::Raw, Stage::Clipped, Stage::Processed, Stage::Export];

    /// Lowercase name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Stage::Raw => "raw",
            Stage::Clipped => "clipped",
            Stage::Processed => "processed",
            Stage::Export => "export",
        }
    }

    /// Whether artifacts of this stage are built from an upstream file.
    pub const fn is_derived(self) -> bool {
        !matches!(self, Stage::Raw)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One released version of a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionEntry {
    /// Version tag.
    pub version: String,
    /// Artifacts from earlier versions cannot be reused once this one ships.
    pub breaking: bool,
}

impl VersionEntry {
    /// A version that keeps earlier artifacts valid.
    pub fn compatible(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            breaking: false,
        }
    }

    /// A version that invalidates earlier artifacts.
    pub fn breaking(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            breaking: true,
        }
    }
}

/// How a recorded version relates to the current one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compatibility {
    /// Same as the current version.
    Current,
    /// Older, with no breaking version since.
    Compatible,
    /// Older, superseded by a breaking version.
    Breaking {
        /// First breaking version after the recorded one.
        since: String,
    },
    /// Not in the stage's history.
    Unknown,
}

impl Compatibility {
    /// Whether an artifact at this version may be reused.
    pub fn is_reusable(&self) -> bool {
        matches!(self, Compatibility::Current | Compatibility::Compatible)
    }
}

/// Ordered version history per stage, oldest first; the last entry is current.
#[derive(Debug, Clone)]
pub struct StageVersions {
    histories: HashMap<Stage, Vec<VersionEntry>>,
}

impl Default for StageVersions {
    fn default() -> Self {
        Self::builtin()
    }
}

impl StageVersions {
    /// The versions shipped with this crate.
    pub fn builtin() -> Self {
        Self::empty()
            .with_history(
                Stage::Raw,
                vec![VersionEntry::breaking("1.0"), VersionEntry::compatible("1.1")],
            )
            .with_history(Stage::Clipped, vec![VersionEntry::breaking("1.0")])
            .with_history(
                Stage::Processed,
                vec![VersionEntry::breaking("1.0"), VersionEntry::breaking("2.0")],
            )
            .with_history(Stage::Export, vec![VersionEntry::breaking("1.0")])
    }

    /// No histories at all.
    pub fn empty() -> Self {
        Self {
            histories: HashMap::new(),
        }
    }

    /// Replace the history of one stage.
    pub fn with_history(mut self, stage: Stage, history: Vec<VersionEntry>) -> Self {
        self.histories.insert(stage, history);
        self
    }

    /// Current version of a stage.
    pub fn current(&self, stage: Stage) -> Option<&str> {
        self.histories
            .get(&stage)
            .and_then(|h| h.last())
            .map(|e| e.version.as_str())
    }

    /// Classify a recorded version against the stage's history.
    pub fn compatibility(&self, stage: Stage, recorded: &str) -> Compatibility {
        let Some(history) = self.histories.get(&stage) else {
            return Compatibility::Unknown;
        };
        let Some(index) = history.iter().position(|e| e.version == recorded) else {
            return Compatibility::Unknown;
        };
        if index + 1 == history.len() {
            return Compatibility::Current;
        }
        match history[index + 1..].iter().find(|e| e.breaking) {
            Some(entry) => Compatibility::Breaking {
                since: entry.version.clone(),
            },
            None => Compatibility::Compatible,
        }
    }
}

/// Sidecar metadata for one artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    /// Producing stage.
    pub stage: Stage,
    /// Stage version at production time.
    pub version_tag: String,
    /// Region the artifact belongs to.
    pub region_id: String,
    /// Bounds the artifact was produced for, when it covers a region.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<GeoBounds>,
    /// Upstream file, for derived stages.
    pub source_file_reference: Option<PathBuf>,
    /// SHA-256 (hex) of the upstream file at production time.
    pub source_file_hash: Option<String>,
    /// Production time.
    pub produced_at: DateTime<Utc>,
}

/// Result of validating an artifact.
#[derive(Debug, Clone, PartialEq)]
pub enum Freshness {
    /// Reusable as is.
    Fresh(ArtifactMeta),
    /// Must be regenerated.
    Stale(String),
    /// No artifact on disk.
    Missing,
}

/// Decides whether cached artifacts may be reused.
#[derive(Debug, Clone)]
pub struct CacheValidator {
    versions: StageVersions,
    clock: Arc<dyn Clock>,
}

impl CacheValidator {
    /// Validator over a set of stage histories.
    pub fn new(versions: StageVersions, clock: Arc<dyn Clock>) -> Self {
        Self { versions, clock }
    }

    /// Stage histories in use.
    pub fn versions(&self) -> &StageVersions {
        &self.versions
    }

    /// Sidecar location for an artifact.
    pub fn sidecar_path(artifact: &Path) -> PathBuf {
        let mut name = artifact.as_os_str().to_owned();
        name.push(".meta.json");
        PathBuf::from(name)
    }

    /// Read an artifact's sidecar, `None` if absent.
    pub fn read_meta(artifact: &Path) -> Result<Option<ArtifactMeta>> {
        match std::fs::read(Self::sidecar_path(artifact)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Check an artifact against the current version of `stage` and, when it
    /// declares one, the live hash of its upstream file.
    pub fn validate(&self, artifact: &Path, stage: Stage) -> Freshness {
        self.validate_for(artifact, stage, None)
    }

    /// Like [`validate`](Self::validate), additionally requiring the artifact
    /// to have been produced for exactly `bounds`.
    pub fn validate_for(
        &self,
        artifact: &Path,
        stage: Stage,
        bounds: Option<&GeoBounds>,
    ) -> Freshness {
        if !artifact.exists() {
            return Freshness::Missing;
        }

        let meta = match Self::read_meta(artifact) {
            Ok(Some(meta)) => meta,
            Ok(None) => return Freshness::Stale("no metadata sidecar".to_string()),
            Err(e) => return Freshness::Stale(format!("unreadable metadata: {e}")),
        };

        if meta.stage != stage {
            return Freshness::Stale(format!(
                "recorded as {} artifact, expected {}",
                meta.stage, stage
            ));
        }

        match self.versions.compatibility(stage, &meta.version_tag) {
            Compatibility::Current | Compatibility::Compatible => {}
            Compatibility::Breaking { since } => {
                return Freshness::Stale(format!(
                    "{stage} version {} superseded by breaking version {since}",
                    meta.version_tag
                ))
            }
            Compatibility::Unknown => {
                return Freshness::Stale(format!("unknown {stage} version {}", meta.version_tag))
            }
        }

        if let Some(expected) = bounds {
            match &meta.bounds {
                Some(recorded) if recorded == expected => {}
                Some(recorded) => {
                    return Freshness::Stale(format!(
                        "produced for bounds {recorded}, requested {expected}"
                    ))
                }
                None => return Freshness::Stale("no bounds recorded".to_string()),
            }
        }

        match (&meta.source_file_reference, &meta.source_file_hash) {
            (Some(source), Some(recorded)) => match file_sha256(source) {
                Ok(live) if live == *recorded => {}
                Ok(_) => return Freshness::Stale(format!("source {} changed", source.display())),
                Err(e) => {
                    return Freshness::Stale(format!("source {} unreadable: {e}", source.display()))
                }
            },
            (Some(source), None) => {
                return Freshness::Stale(format!("no hash recorded for source {}", source.display()))
            }
            (None, _) if stage.is_derived() => {
                return Freshness::Stale(format!("{stage} artifact has no source reference"))
            }
            (None, _) => {}
        }

        Freshness::Fresh(meta)
    }

    /// Write the sidecar for a freshly produced artifact.
    pub fn record(
        &self,
        artifact: &Path,
        stage: Stage,
        region_id: &str,
        source: Option<&Path>,
        bounds: Option<GeoBounds>,
    ) -> Result<ArtifactMeta> {
        let version_tag = self
            .versions
            .current(stage)
            .ok_or_else(|| FetchError::Config(format!("no version declared for stage {stage}")))?
            .to_string();
        let source_file_hash = source.map(file_sha256).transpose()?;

        let meta = ArtifactMeta {
            stage,
            version_tag,
            region_id: region_id.to_string(),
            bounds,
            source_file_reference: source.map(Path::to_path_buf),
            source_file_hash,
            produced_at: self.clock.now(),
        };
        write_json_atomic(&Self::sidecar_path(artifact), &meta)?;
        debug!(
            artifact = %artifact.display(),
            %stage,
            version = %meta.version_tag,
            "Recorded artifact metadata"
        );
        Ok(meta)
    }

    /// Reuse an artifact if fresh; if stale, delete it and its sidecar.
    ///
    /// Returns `None` whenever the caller must regenerate.
    pub fn ensure_fresh(&self, artifact: &Path, stage: Stage) -> Result<Option<ArtifactMeta>> {
        self.ensure_fresh_for(artifact, stage, None)
    }

    /// [`ensure_fresh`](Self::ensure_fresh) with the bounds check of
    /// [`validate_for`](Self::validate_for).
    pub fn ensure_fresh_for(
        &self,
        artifact: &Path,
        stage: Stage,
        bounds: Option<&GeoBounds>,
    ) -> Result<Option<ArtifactMeta>> {
        match self.validate_for(artifact, stage, bounds) {
            Freshness::Fresh(meta) => Ok(Some(meta)),
            Freshness::Missing => Ok(None),
            Freshness::Stale(reason) => {
                warn!(
                    artifact = %artifact.display(),
                    %stage,
                    %reason,
                    "Stale artifact, regenerating"
                );
                metrics::counter!(metric_defs::STALE_ARTIFACTS.name, "stage" => stage.as_str())
                    .increment(1);
                invalidate(artifact)?;
                Ok(None)
            }
        }
    }

    /// Like [`validate`](Self::validate) but as an error for callers that
    /// cannot regenerate.
    pub fn require_fresh(&self, artifact: &Path, stage: Stage) -> Result<ArtifactMeta> {
        match self.validate(artifact, stage) {
            Freshness::Fresh(meta) => Ok(meta),
            Freshness::Stale(reason) => Err(FetchError::StaleCache {
                path: artifact.to_path_buf(),
                reason,
            }),
            Freshness::Missing => Err(FetchError::StaleCache {
                path: artifact.to_path_buf(),
                reason: "artifact missing".to_string(),
            }),
        }
    }
}

/// SHA-256 of a file's contents, hex encoded.
pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Delete an artifact and its sidecar. Missing files are not an error.
pub fn invalidate(artifact: &Path) -> Result<()> {
    for path in [artifact.to_path_buf(), CacheValidator::sidecar_path(artifact)] {
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "Removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Serialize to a temporary file beside `path` and rename it into place.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let json = serde_json::to_vec_pretty(value)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&json)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| FetchError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn validator(versions: StageVersions) -> CacheValidator {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        CacheValidator::new(versions, Arc::new(clock))
    }

    #[test]
    fn test_compatibility_rules() {
        let versions = StageVersions::empty().with_history(
            Stage::Processed,
            vec![
                VersionEntry::breaking("1.0"),
                VersionEntry::compatible("1.1"),
                VersionEntry::breaking("2.0"),
                VersionEntry::compatible("2.1"),
            ],
        );

        assert_eq!(versions.current(Stage::Processed), Some("2.1"));
        assert_eq!(versions.compatibility(Stage::Processed, "2.1"), Compatibility::Current);
        assert_eq!(versions.compatibility(Stage::Processed, "2.0"), Compatibility::Compatible);
        assert_eq!(
            versions.compatibility(Stage::Processed, "1.1"),
            Compatibility::Breaking {
                since: "2.0".to_string()
            }
        );
        assert_eq!(versions.compatibility(Stage::Processed, "0.9"), Compatibility::Unknown);
        assert_eq!(versions.compatibility(Stage::Raw, "1.0"), Compatibility::Unknown);
    }

    #[test]
    fn test_sidecar_path() {
        assert_eq!(
            CacheValidator::sidecar_path(Path::new("out/r1/raw/r1_30m.tif")),
            PathBuf::from("out/r1/raw/r1_30m.tif.meta.json")
        );
    }

    #[test]
    fn test_record_then_validate() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("r1_30m.tif");
        std::fs::write(&artifact, b"raster").unwrap();

        let validator = validator(StageVersions::builtin());
        assert!(matches!(validator.validate(&artifact, Stage::Raw), Freshness::Stale(_)));

        let meta = validator.record(&artifact, Stage::Raw, "r1", None, None).unwrap();
        assert_eq!(meta.version_tag, "1.1");
        assert_eq!(validator.validate(&artifact, Stage::Raw), Freshness::Fresh(meta));
        assert!(matches!(validator.validate(&artifact, Stage::Export), Freshness::Stale(_)));
    }

    #[test]
    fn test_source_hash_change_makes_derived_stale() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("raw.tif");
        let clipped = dir.path().join("clipped.tif");
        std::fs::write(&source, b"v1").unwrap();
        std::fs::write(&clipped, b"clipped").unwrap();

        let validator = validator(StageVersions::builtin());
        let meta = validator.record(&clipped, Stage::Clipped, "r1", Some(&source), None).unwrap();
        assert_eq!(meta.source_file_hash.as_deref(), Some(file_sha256(&source).unwrap().as_str()));
        assert!(matches!(validator.validate(&clipped, Stage::Clipped), Freshness::Fresh(_)));

        std::fs::write(&source, b"v2").unwrap();
        match validator.validate(&clipped, Stage::Clipped) {
            Freshness::Stale(reason) => assert!(reason.contains("changed")),
            other => panic!("expected stale, got {other:?}"),
        }
        assert!(matches!(
            validator.require_fresh(&clipped, Stage::Clipped),
            Err(FetchError::StaleCache { .. })
        ));
    }

    #[test]
    fn test_derived_without_source_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("p.tif");
        std::fs::write(&artifact, b"x").unwrap();

        let validator = validator(StageVersions::builtin());
        validator.record(&artifact, Stage::Processed, "r1", None, None).unwrap();
        assert!(matches!(validator.validate(&artifact, Stage::Processed), Freshness::Stale(_)));
    }

    #[test]
    fn test_breaking_bump_invalidates_on_ensure() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("r.tif");
        std::fs::write(&artifact, b"x").unwrap();

        let old = validator(
            StageVersions::empty().with_history(Stage::Raw, vec![VersionEntry::breaking("1.0")]),
        );
        old.record(&artifact, Stage::Raw, "r", None, None).unwrap();

        let compatible = validator(StageVersions::empty().with_history(
            Stage::Raw,
            vec![VersionEntry::breaking("1.0"), VersionEntry::compatible("1.1")],
        ));
        assert!(compatible.ensure_fresh(&artifact, Stage::Raw).unwrap().is_some());

        let breaking = validator(StageVersions::empty().with_history(
            Stage::Raw,
            vec![VersionEntry::breaking("1.0"), VersionEntry::breaking("2.0")],
        ));
        assert!(breaking.ensure_fresh(&artifact, Stage::Raw).unwrap().is_none());
        assert!(!artifact.exists());
        assert!(!CacheValidator::sidecar_path(&artifact).exists());
        assert_eq!(breaking.validate(&artifact, Stage::Raw), Freshness::Missing);
    }

    #[test]
    fn test_bounds_mismatch_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("r_30m.tif");
        std::fs::write(&artifact, b"x").unwrap();
        let recorded = GeoBounds::new(10.2, 45.3, 11.7, 46.8).unwrap();
        let moved = GeoBounds::new(20.2, 45.3, 21.7, 46.8).unwrap();

        let validator = validator(StageVersions::builtin());
        let meta = validator
            .record(&artifact, Stage::Raw, "r", None, Some(recorded))
            .unwrap();
        assert_eq!(meta.bounds, Some(recorded));
        assert!(matches!(
            validator.validate_for(&artifact, Stage::Raw, Some(&recorded)),
            Freshness::Fresh(_)
        ));
        match validator.validate_for(&artifact, Stage::Raw, Some(&moved)) {
            Freshness::Stale(reason) => assert!(reason.contains("bounds")),
            other => panic!("expected stale, got {other:?}"),
        }

        // Sidecars written without bounds cannot vouch for a region
        validator.record(&artifact, Stage::Raw, "r", None, None).unwrap();
        assert!(matches!(
            validator.validate_for(&artifact, Stage::Raw, Some(&recorded)),
            Freshness::Stale(_)
        ));
        assert!(validator
            .ensure_fresh_for(&artifact, Stage::Raw, Some(&moved))
            .unwrap()
            .is_none());
        assert!(!artifact.exists());
    }

    #[test]
    fn test_invalidate_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(invalidate(&dir.path().join("absent.tif")).is_ok());
    }
}

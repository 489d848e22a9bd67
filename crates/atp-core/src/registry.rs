//! Model registry with manifest hashing and copy-on-write snapshots.
//!
//! The registry file is a JSON array of records. Each record's
//! `manifest_hash` is recomputed on load from the canonical JSON of the
//! record minus the hash field; a mismatch at startup is fatal, while a
//! mismatch during a runtime refresh isolates the offending record.
//!
//! Readers hold a cheap `Arc` to an immutable snapshot; writers build a new
//! snapshot and publish it atomically.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use ring::digest;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::custody::CustodyLog;
use crate::error::RouterError;
use crate::types::{Candidate, ModelStatus, SafetyGrade};

/// Share of estimated tokens attributed to input when blending per-token
/// prices into a per-1k figure.
const INPUT_TOKEN_SHARE: f64 = 0.7;

// ---------------------------------------------------------------------------
// RegistryRecord
// ---------------------------------------------------------------------------

/// One registered model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryRecord {
    pub name: String,
    pub provider: String,
    pub status: ModelStatus,
    pub safety_grade: SafetyGrade,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub latency_p50_ms: u64,
    pub latency_p95_ms: u64,
    pub quality_score: f64,
    pub cost_per_input_token: f64,
    pub cost_per_output_token: f64,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_hash: Option<String>,
}

fn default_region() -> String {
    "us-west".to_string()
}

impl RegistryRecord {
    /// Derive the routing candidate for this record. Per-token prices are
    /// blended 70/30 input/output into a per-1k-token figure.
    pub fn to_candidate(&self) -> Candidate {
        let blended_per_token = INPUT_TOKEN_SHARE * self.cost_per_input_token
            + (1.0 - INPUT_TOKEN_SHARE) * self.cost_per_output_token;
        Candidate {
            name: self.name.clone(),
            provider: self.provider.clone(),
            cost_per_1k_tokens: blended_per_token * 1000.0,
            quality_pred: self.quality_score,
            latency_p95_ms: self.latency_p95_ms,
            region: self.region.clone(),
        }
    }
}

/// Compute the manifest hash: hex SHA-256 over the canonical (sorted-key)
/// JSON of the record with `manifest_hash` removed, truncated to 16 chars.
pub fn compute_manifest_hash(record: &RegistryRecord) -> Result<String, RouterError> {
    let mut value = serde_json::to_value(record)
        .map_err(|e| RouterError::Internal(format!("record serialization failed: {e}")))?;
    if let serde_json::Value::Object(ref mut map) = value {
        map.remove("manifest_hash");
    }
    let canonical = value.to_string();
    let hash = digest::digest(&digest::SHA256, canonical.as_bytes());
    Ok(hex_encode(hash.as_ref())[..16].to_string())
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

// ---------------------------------------------------------------------------
// RegistrySnapshot
// ---------------------------------------------------------------------------

/// Immutable view of the registry at a point in time.
#[derive(Debug)]
pub struct RegistrySnapshot {
    records: HashMap<String, RegistryRecord>,
    candidates: Vec<Candidate>,
    pub loaded_at: DateTime<Utc>,
}

impl RegistrySnapshot {
    fn build(records: Vec<RegistryRecord>, loaded_at: DateTime<Utc>) -> Self {
        // Shadow models stay in the candidate list; the selection engine is
        // responsible for excluding them from the primary plan.
        let mut candidates: Vec<Candidate> = records
            .iter()
            .filter(|r| !matches!(r.status, ModelStatus::Sunset))
            .map(RegistryRecord::to_candidate)
            .collect();
        candidates.sort_by(|a, b| a.name.cmp(&b.name));
        let records = records.into_iter().map(|r| (r.name.clone(), r)).collect();
        Self {
            records,
            candidates,
            loaded_at,
        }
    }

    pub fn get(&self, name: &str) -> Option<&RegistryRecord> {
        self.records.get(name)
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn records(&self) -> impl Iterator<Item = &RegistryRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// ---------------------------------------------------------------------------
// ModelRegistry
// ---------------------------------------------------------------------------

/// Registry handle. Cheap to clone; all clones share the published snapshot.
#[derive(Clone)]
pub struct ModelRegistry {
    snapshot: Arc<RwLock<Arc<RegistrySnapshot>>>,
    path: Option<PathBuf>,
    custody: Option<Arc<CustodyLog>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("snapshot", &self.snapshot)
            .field("path", &self.path)
            .field("custody", &self.custody)
            .finish_non_exhaustive()
    }
}

impl ModelRegistry {
    /// Build a registry from in-memory records (tests, embedded catalogs).
    /// Hashes are computed; records arriving with a mismatched hash are
    /// rejected as corrupt.
    pub fn from_records(
        records: Vec<RegistryRecord>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RouterError> {
        let verified = verify_all(records)?;
        let now = clock.now();
        Ok(Self {
            snapshot: Arc::new(RwLock::new(Arc::new(RegistrySnapshot::build(verified, now)))),
            path: None,
            custody: None,
            clock,
        })
    }

    /// Load the registry from a JSON file. Any hash mismatch is fatal here;
    /// use [`ModelRegistry::refresh`] for the isolating runtime path.
    pub fn load(
        path: impl Into<PathBuf>,
        custody: Option<Arc<CustodyLog>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RouterError> {
        let path = path.into();
        let records = read_records(&path)?;
        let verified = verify_all(records)?;
        info!(path = %path.display(), models = verified.len(), "registry loaded");
        let now = clock.now();
        Ok(Self {
            snapshot: Arc::new(RwLock::new(Arc::new(RegistrySnapshot::build(verified, now)))),
            path: Some(path),
            custody,
            clock,
        })
    }

    /// Current snapshot. Readers hold the returned `Arc` for the duration of
    /// a decision; hot reloads never mutate it under them.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Re-read the registry file, isolating corrupt records instead of
    /// failing. Returns the number of records skipped.
    pub fn refresh(&self) -> Result<usize, RouterError> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| RouterError::Internal("registry has no backing file".into()))?;
        let records = read_records(path)?;

        let mut kept = Vec::with_capacity(records.len());
        let mut skipped = 0usize;
        for mut record in records {
            let computed = compute_manifest_hash(&record)?;
            match &record.manifest_hash {
                Some(stored) if *stored != computed => {
                    warn!(model = %record.name, "manifest hash mismatch, record isolated");
                    skipped += 1;
                }
                _ => {
                    record.manifest_hash = Some(computed);
                    kept.push(record);
                }
            }
        }

        self.publish(kept);
        Ok(skipped)
    }

    /// Replace the published snapshot with `records` (hashes recomputed).
    pub fn publish(&self, mut records: Vec<RegistryRecord>) {
        for record in &mut records {
            if let Ok(hash) = compute_manifest_hash(record) {
                record.manifest_hash = Some(hash);
            }
        }
        let next = Arc::new(RegistrySnapshot::build(records, self.clock.now()));
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        *guard = next;
    }

    /// Persist the current snapshot: hashes stripped, records sorted by
    /// name, written via temp file + atomic rename, custody event appended.
    pub fn save(&self) -> Result<(), RouterError> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| RouterError::Internal("registry has no backing file".into()))?;
        let snapshot = self.snapshot();

        let mut out: Vec<RegistryRecord> = snapshot
            .records()
            .map(|r| {
                let mut r = r.clone();
                r.manifest_hash = None;
                r
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));

        let json = serde_json::to_string_pretty(&out)
            .map_err(|e| RouterError::Internal(format!("registry serialization failed: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .map_err(|e| RouterError::RepositoryUnavailable(format!("registry write: {e}")))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| RouterError::RepositoryUnavailable(format!("registry rename: {e}")))?;

        if let Some(custody) = &self.custody {
            let names: Vec<&str> = out.iter().map(|r| r.name.as_str()).collect();
            custody.append(
                "registry_update",
                "model_registry",
                serde_json::json!({ "models_count": out.len(), "models": names }),
            )?;
        }
        Ok(())
    }
}

fn read_records(path: &Path) -> Result<Vec<RegistryRecord>, RouterError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| RouterError::RegistryCorruption(format!("read {}: {e}", path.display())))?;
    serde_json::from_str(&text)
        .map_err(|e| RouterError::RegistryCorruption(format!("parse {}: {e}", path.display())))
}

fn verify_all(records: Vec<RegistryRecord>) -> Result<Vec<RegistryRecord>, RouterError> {
    let mut verified = Vec::with_capacity(records.len());
    for mut record in records {
        let computed = compute_manifest_hash(&record)?;
        if let Some(stored) = &record.manifest_hash {
            if *stored != computed {
                return Err(RouterError::RegistryCorruption(format!(
                    "manifest hash mismatch for model {}",
                    record.name
                )));
            }
        }
        record.manifest_hash = Some(computed);
        verified.push(record);
    }
    Ok(verified)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn record(name: &str, status: ModelStatus) -> RegistryRecord {
        RegistryRecord {
            name: name.to_string(),
            provider: "openai".to_string(),
            status,
            safety_grade: SafetyGrade::A,
            tags: BTreeSet::new(),
            latency_p50_ms: 400,
            latency_p95_ms: 900,
            quality_score: 0.8,
            cost_per_input_token: 0.000_4,
            cost_per_output_token: 0.000_4,
            region: "us-west".to_string(),
            manifest_hash: None,
        }
    }

    fn clock() -> Arc<dyn Clock> {
        Arc::new(SystemClock)
    }

    #[test]
    fn manifest_hash_is_deterministic_and_ignores_stored_hash() {
        let mut rec = record("m1", ModelStatus::Active);
        let h1 = compute_manifest_hash(&rec).unwrap();
        rec.manifest_hash = Some("bogus".to_string());
        let h2 = compute_manifest_hash(&rec).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 16);
    }

    #[test]
    fn manifest_hash_changes_with_content() {
        let a = compute_manifest_hash(&record("m1", ModelStatus::Active)).unwrap();
        let mut changed = record("m1", ModelStatus::Active);
        changed.quality_score = 0.9;
        let b = compute_manifest_hash(&changed).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn candidate_blends_per_token_prices() {
        let mut rec = record("m1", ModelStatus::Active);
        rec.cost_per_input_token = 0.001;
        rec.cost_per_output_token = 0.003;
        let c = rec.to_candidate();
        // 0.7 * 0.001 + 0.3 * 0.003 = 0.0016 per token -> 1.6 per 1k
        assert!((c.cost_per_1k_tokens - 1.6).abs() < 1e-9);
    }

    #[test]
    fn from_records_rejects_mismatched_hash() {
        let mut rec = record("m1", ModelStatus::Active);
        rec.manifest_hash = Some("deadbeefdeadbeef".to_string());
        let err = ModelRegistry::from_records(vec![rec], clock()).unwrap_err();
        assert!(matches!(err, RouterError::RegistryCorruption(_)));
    }

    #[test]
    fn snapshot_excludes_sunset_candidates() {
        let registry = ModelRegistry::from_records(
            vec![
                record("live", ModelStatus::Active),
                record("shadowed", ModelStatus::Shadow),
                record("gone", ModelStatus::Sunset),
            ],
            clock(),
        )
        .unwrap();
        let snap = registry.snapshot();
        let names: Vec<&str> = snap.candidates().iter().map(|c| c.name.as_str()).collect();
        assert!(names.contains(&"live"));
        assert!(names.contains(&"shadowed")); // shadow stays listed, excluded later
        assert!(!names.contains(&"gone"));
        assert_eq!(snap.len(), 3); // record itself is still retrievable
    }

    #[test]
    fn load_save_load_preserves_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let initial = vec![record("b-model", ModelStatus::Active), record("a-model", ModelStatus::Shadow)];
        std::fs::write(&path, serde_json::to_string(&initial).unwrap()).unwrap();

        let registry = ModelRegistry::load(&path, None, clock()).unwrap();
        let before: HashMap<String, String> = registry
            .snapshot()
            .records()
            .map(|r| (r.name.clone(), r.manifest_hash.clone().unwrap()))
            .collect();

        registry.save().unwrap();
        let reloaded = ModelRegistry::load(&path, None, clock()).unwrap();
        for rec in reloaded.snapshot().records() {
            assert_eq!(rec.manifest_hash.as_ref().unwrap(), &before[&rec.name]);
        }
    }

    #[test]
    fn load_fails_on_corrupt_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let mut rec = record("m1", ModelStatus::Active);
        rec.manifest_hash = Some("0000000000000000".to_string());
        std::fs::write(&path, serde_json::to_string(&vec![rec]).unwrap()).unwrap();

        let err = ModelRegistry::load(&path, None, clock()).unwrap_err();
        assert!(err.is_fatal_at_startup());
    }

    #[test]
    fn refresh_isolates_corrupt_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(
            &path,
            serde_json::to_string(&vec![record("good", ModelStatus::Active)]).unwrap(),
        )
        .unwrap();
        let registry = ModelRegistry::load(&path, None, clock()).unwrap();

        let mut bad = record("bad", ModelStatus::Active);
        bad.manifest_hash = Some("0000000000000000".to_string());
        std::fs::write(
            &path,
            serde_json::to_string(&vec![record("good", ModelStatus::Active), bad]).unwrap(),
        )
        .unwrap();

        let skipped = registry.refresh().unwrap();
        assert_eq!(skipped, 1);
        let snap = registry.snapshot();
        assert!(snap.get("good").is_some());
        assert!(snap.get("bad").is_none());
    }

    #[test]
    fn publish_swaps_snapshot_under_readers() {
        let registry =
            ModelRegistry::from_records(vec![record("old", ModelStatus::Active)], clock()).unwrap();
        let held = registry.snapshot();

        registry.publish(vec![record("new", ModelStatus::Active)]);

        // The held reference still sees the old world.
        assert!(held.get("old").is_some());
        // New readers see the new world.
        let fresh = registry.snapshot();
        assert!(fresh.get("new").is_some());
        assert!(fresh.get("old").is_none());
    }
}

//! JSON-file persistence for plans, runs, and events.
//!
//! Layout under the state directory:
//!
//! ```text
//! plans/<planId>.json     immutable intent
//! runs/<planId>.json      mutable run record (checkpointed)
//! runs/<planId>.lock      exclusive coordinator lock
//! runs/<planId>.cancel    cancel/pause request marker
//! events/<planId>.ndjson  append-only audit log
//! ```
//!
//! Documents are wrapped in a versioned envelope so fields can be added
//! without breaking older state. Writes go to a temp file and are renamed
//! into place; the run file always holds one consistent snapshot.

use crate::error::BackfillError;
use crate::event::BackfillEvent;
use crate::plan::{BackfillPlanState, PlanId};
use crate::state::BackfillRunState;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// On-disk schema version for plan and run documents.
pub const STATE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    version: u32,
    data: T,
}

/// Requested stop behavior, recorded in the cancel marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelMode {
    /// Stop and mark the run cancelled (terminal).
    Cancel,
    /// Stop and mark the run paused (resumable).
    Pause,
}

#[derive(Serialize, Deserialize)]
struct CancelMarker {
    mode: CancelMode,
}

/// Exclusive ownership of a run while a coordinator executes it.
///
/// Dropping the guard releases the lock. A crashed coordinator leaves the
/// lock file behind; `doctor` surfaces it.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release run lock");
        }
    }
}

/// Document store for backfill state.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    /// Open a store rooted at the given state directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The state directory root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a plan document.
    pub fn plan_path(&self, plan_id: &PlanId) -> PathBuf {
        self.root.join("plans").join(format!("{}.json", plan_id))
    }

    /// Path of a run document.
    pub fn run_path(&self, plan_id: &PlanId) -> PathBuf {
        self.root.join("runs").join(format!("{}.json", plan_id))
    }

    /// Path of an event log.
    pub fn events_path(&self, plan_id: &PlanId) -> PathBuf {
        self.root.join("events").join(format!("{}.ndjson", plan_id))
    }

    fn lock_path(&self, plan_id: &PlanId) -> PathBuf {
        self.root.join("runs").join(format!("{}.lock", plan_id))
    }

    fn cancel_path(&self, plan_id: &PlanId) -> PathBuf {
        self.root.join("runs").join(format!("{}.cancel", plan_id))
    }

    /// Persist a plan document.
    pub fn save_plan(&self, plan: &BackfillPlanState) -> Result<PathBuf, BackfillError> {
        let path = self.plan_path(&plan.plan_id);
        self.write_document(&path, plan)?;
        Ok(path)
    }

    /// Load a plan document.
    pub fn load_plan(&self, plan_id: &PlanId) -> Result<BackfillPlanState, BackfillError> {
        let path = self.plan_path(plan_id);
        if !path.exists() {
            return Err(BackfillError::PlanNotFound {
                plan_id: plan_id.clone(),
            });
        }
        self.read_document(&path)
    }

    /// Whether a plan document exists.
    pub fn plan_exists(&self, plan_id: &PlanId) -> bool {
        self.plan_path(plan_id).exists()
    }

    /// Load every persisted plan, sorted by plan id.
    pub fn list_plans(&self) -> Result<Vec<BackfillPlanState>, BackfillError> {
        let dir = self.root.join("plans");
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&dir).map_err(|e| BackfillError::Persistence {
            path: dir.clone(),
            reason: e.to_string(),
        })?;

        let mut plans = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| BackfillError::Persistence {
                path: dir.clone(),
                reason: e.to_string(),
            })?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                plans.push(self.read_document::<BackfillPlanState>(&path)?);
            }
        }
        plans.sort_by(|a, b| a.plan_id.cmp(&b.plan_id));
        Ok(plans)
    }

    /// Persist a run document (the durable checkpoint).
    pub fn save_run(&self, run: &BackfillRunState) -> Result<PathBuf, BackfillError> {
        let path = self.run_path(&run.plan_id);
        self.write_document(&path, run)?;
        Ok(path)
    }

    /// Load a run document.
    pub fn load_run(&self, plan_id: &PlanId) -> Result<BackfillRunState, BackfillError> {
        let path = self.run_path(plan_id);
        if !path.exists() {
            return Err(BackfillError::RunNotFound {
                plan_id: plan_id.clone(),
            });
        }
        self.read_document(&path)
    }

    /// Load a run document if one exists.
    pub fn try_load_run(&self, plan_id: &PlanId) -> Result<Option<BackfillRunState>, BackfillError> {
        if self.run_path(plan_id).exists() {
            Ok(Some(self.load_run(plan_id)?))
        } else {
            Ok(None)
        }
    }

    /// Append one event to the plan's audit log.
    pub fn append_event(
        &self,
        plan_id: &PlanId,
        event: &BackfillEvent,
    ) -> Result<(), BackfillError> {
        let path = self.events_path(plan_id);
        self.ensure_parent(&path)?;
        let mut line = serde_json::to_string(event).map_err(|e| BackfillError::Persistence {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        line.push('\n');
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| f.write_all(line.as_bytes()))
            .map_err(|e| BackfillError::Persistence {
                path,
                reason: e.to_string(),
            })
    }

    /// Read the full event log for a plan. Missing log reads as empty.
    pub fn read_events(&self, plan_id: &PlanId) -> Result<Vec<BackfillEvent>, BackfillError> {
        let path = self.events_path(plan_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&path).map_err(|e| BackfillError::Persistence {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        raw.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| {
                serde_json::from_str(l).map_err(|e| BackfillError::Persistence {
                    path: path.clone(),
                    reason: format!("bad event line: {}", e),
                })
            })
            .collect()
    }

    /// Take exclusive ownership of a run. Fails if another coordinator holds
    /// the lock.
    pub fn acquire_run_lock(&self, plan_id: &PlanId) -> Result<RunLock, BackfillError> {
        let path = self.lock_path(plan_id);
        self.ensure_parent(&path)?;
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut f) => {
                let _ = writeln!(f, "{}", std::process::id());
                Ok(RunLock { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(BackfillError::RunLockHeld {
                    plan_id: plan_id.clone(),
                    path,
                })
            }
            Err(e) => Err(BackfillError::Persistence {
                path,
                reason: e.to_string(),
            }),
        }
    }

    /// Whether a run lock file is present.
    pub fn run_lock_present(&self, plan_id: &PlanId) -> bool {
        self.lock_path(plan_id).exists()
    }

    /// Record a cancel/pause request for a running coordinator to pick up.
    pub fn request_cancel(&self, plan_id: &PlanId, mode: CancelMode) -> Result<(), BackfillError> {
        let path = self.cancel_path(plan_id);
        self.ensure_parent(&path)?;
        let marker = CancelMarker { mode };
        let raw = serde_json::to_string(&marker).map_err(|e| BackfillError::Persistence {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        fs::write(&path, raw).map_err(|e| BackfillError::Persistence {
            path,
            reason: e.to_string(),
        })
    }

    /// Read a pending cancel/pause request, if any.
    pub fn cancel_requested(&self, plan_id: &PlanId) -> Option<CancelMode> {
        let path = self.cancel_path(plan_id);
        let raw = fs::read_to_string(&path).ok()?;
        serde_json::from_str::<CancelMarker>(&raw)
            .ok()
            .map(|m| m.mode)
    }

    /// Remove a consumed cancel/pause request.
    pub fn clear_cancel(&self, plan_id: &PlanId) {
        let _ = fs::remove_file(self.cancel_path(plan_id));
    }

    fn ensure_parent(&self, path: &Path) -> Result<(), BackfillError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| BackfillError::Persistence {
                path: parent.to_path_buf(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    fn write_document<T: Serialize>(&self, path: &Path, data: &T) -> Result<(), BackfillError> {
        self.ensure_parent(path)?;
        let envelope = Envelope {
            version: STATE_VERSION,
            data,
        };
        let raw =
            serde_json::to_string_pretty(&envelope).map_err(|e| BackfillError::Persistence {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, raw).map_err(|e| BackfillError::Persistence {
            path: tmp.clone(),
            reason: e.to_string(),
        })?;
        fs::rename(&tmp, path).map_err(|e| BackfillError::Persistence {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    fn read_document<T: DeserializeOwned>(&self, path: &Path) -> Result<T, BackfillError> {
        let raw = fs::read_to_string(path).map_err(|e| BackfillError::Persistence {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let envelope: Envelope<T> =
            serde_json::from_str(&raw).map_err(|e| BackfillError::Persistence {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        if envelope.version > STATE_VERSION {
            return Err(BackfillError::UnsupportedVersion {
                path: path.to_path_buf(),
                found: envelope.version,
                supported: STATE_VERSION,
            });
        }
        Ok(envelope.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::options::ResolvedBackfill;
    use crate::plan::PlanBuilder;
    use chrono::{DateTime, Utc};

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn sample_plan() -> BackfillPlanState {
        let resolved = ResolvedBackfill::default();
        PlanBuilder::new("events", &resolved)
            .window(ts("2024-01-01T00:00:00Z"), ts("2024-01-03T00:00:00Z"), true)
            .sql_template("INSERT /* {token} */")
            .build()
            .unwrap()
    }

    #[test]
    fn test_plan_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let plan = sample_plan();

        let path = store.save_plan(&plan).unwrap();
        assert!(path.ends_with(format!("plans/{}.json", plan.plan_id)));

        let loaded = store.load_plan(&plan.plan_id).unwrap();
        assert_eq!(loaded.plan_id, plan.plan_id);
        assert_eq!(loaded.chunks, plan.chunks);

        // The envelope carries the schema version.
        let raw = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["version"], 1);
    }

    #[test]
    fn test_missing_plan_is_a_distinct_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let result = store.load_plan(&PlanId::parse("bf-nope"));
        assert!(matches!(result, Err(BackfillError::PlanNotFound { .. })));
    }

    #[test]
    fn test_run_roundtrip_and_try_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let plan = sample_plan();
        assert!(store.try_load_run(&plan.plan_id).unwrap().is_none());

        let run = BackfillRunState::new(&plan, ts("2024-01-05T00:00:00Z"));
        store.save_run(&run).unwrap();

        let loaded = store.try_load_run(&plan.plan_id).unwrap().unwrap();
        assert_eq!(loaded.plan_id, plan.plan_id);
        assert_eq!(loaded.chunks.len(), 2);
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let plan = sample_plan();
        let path = store.save_plan(&plan).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let bumped = raw.replacen("\"version\": 1", "\"version\": 99", 1);
        std::fs::write(&path, bumped).unwrap();

        let result = store.load_plan(&plan.plan_id);
        assert!(matches!(
            result,
            Err(BackfillError::UnsupportedVersion { found: 99, .. })
        ));
    }

    #[test]
    fn test_list_plans() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        assert!(store.list_plans().unwrap().is_empty());

        let resolved = ResolvedBackfill::default();
        for target in ["events", "users"] {
            let plan = PlanBuilder::new(target, &resolved)
                .window(ts("2024-01-01T00:00:00Z"), ts("2024-01-02T00:00:00Z"), true)
                .sql_template("{token}")
                .build()
                .unwrap();
            store.save_plan(&plan).unwrap();
        }
        assert_eq!(store.list_plans().unwrap().len(), 2);
    }

    #[test]
    fn test_event_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let plan = sample_plan();

        let at = ts("2024-01-05T00:00:00Z");
        store
            .append_event(&plan.plan_id, &BackfillEvent::run(EventKind::RunStarted, at))
            .unwrap();
        store
            .append_event(
                &plan.plan_id,
                &BackfillEvent::chunk(EventKind::ChunkDone, 0, at).with_attempts(1),
            )
            .unwrap();

        let events = store.read_events(&plan.plan_id).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::RunStarted);
        assert_eq!(events[1].chunk_id, Some(0));
    }

    #[test]
    fn test_run_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let plan_id = PlanId::parse("bf-abc");

        let lock = store.acquire_run_lock(&plan_id).unwrap();
        assert!(store.run_lock_present(&plan_id));
        assert!(matches!(
            store.acquire_run_lock(&plan_id),
            Err(BackfillError::RunLockHeld { .. })
        ));

        drop(lock);
        assert!(!store.run_lock_present(&plan_id));
        // Reacquire after release.
        let _lock = store.acquire_run_lock(&plan_id).unwrap();
    }

    #[test]
    fn test_cancel_marker_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let plan_id = PlanId::parse("bf-abc");

        assert!(store.cancel_requested(&plan_id).is_none());
        store.request_cancel(&plan_id, CancelMode::Pause).unwrap();
        assert_eq!(store.cancel_requested(&plan_id), Some(CancelMode::Pause));
        store.clear_cancel(&plan_id);
        assert!(store.cancel_requested(&plan_id).is_none());
    }
}

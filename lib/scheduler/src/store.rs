//! Schedule persistence to a single JSON file.
//!
//! The file holds `{"schedules": [...]}`. The whole set is cached in memory
//! and every mutation rewrites the file atomically (temp file + rename).
//! Entries that cannot be read as a [`ScheduleRecord`] are quarantined: they
//! are left out of scheduling but written back untouched.

use crate::error::StoreError;
use crate::record::{SchedulePatch, ScheduleRecord};
use cadence_core::{Result, ScheduleId};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const SCHEDULES_KEY: &str = "schedules";

/// Store for schedule records.
#[derive(Clone)]
pub struct ScheduleStore {
    inner: Arc<RwLock<StoreState>>,
    /// Path of the schedules file.
    path: PathBuf,
}

#[derive(Default)]
struct StoreState {
    records: Vec<ScheduleRecord>,
    /// Raw entries that failed to deserialize, kept for rewrite.
    quarantined: Vec<Value>,
    /// Top-level keys other than `schedules`.
    other: Map<String, Value>,
    /// Modification time observed at the last load or save.
    last_synced: Option<SystemTime>,
}

/// Summary of a load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Records available for scheduling.
    pub loaded: usize,
    /// Entries set aside because they could not be read.
    pub quarantined: usize,
}

impl ScheduleStore {
    /// Creates a store backed by the file at `path`. Nothing is read until
    /// [`load`](Self::load).
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreState::default())),
            path: path.into(),
        }
    }

    /// Returns the schedules file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the record set, creating an empty file on first use.
    ///
    /// If the file exists but cannot be parsed, the previously loaded set is
    /// kept and an error is returned.
    pub async fn load(&self) -> Result<LoadReport, StoreError> {
        let mut state = self.inner.write().await;

        if !fs::try_exists(&self.path).await.unwrap_or(false) {
            *state = StoreState::default();
            self.persist(&mut state).await?;
            info!(path = %self.path.display(), "Created empty schedules file");
            return Ok(LoadReport::default());
        }

        let content = fs::read_to_string(&self.path)
            .await
            .map_err(|e| self.io_error(e))?;
        let parsed = parse_document(&content).map_err(|reason| StoreError::Parse {
            path: self.path.clone(),
            reason,
        })?;

        let report = LoadReport {
            loaded: parsed.records.len(),
            quarantined: parsed.quarantined.len(),
        };
        *state = parsed;
        state.last_synced = self.modified().await;

        info!(
            path = %self.path.display(),
            loaded = report.loaded,
            quarantined = report.quarantined,
            "Loaded schedules"
        );
        Ok(report)
    }

    /// Re-reads the file. Same semantics as [`load`](Self::load).
    pub async fn reload(&self) -> Result<LoadReport, StoreError> {
        self.load().await
    }

    /// Returns all readable records in file order.
    pub async fn records(&self) -> Vec<ScheduleRecord> {
        self.inner.read().await.records.clone()
    }

    /// Gets a record by ID.
    pub async fn get(&self, id: &ScheduleId) -> Option<ScheduleRecord> {
        let state = self.inner.read().await;
        state.records.iter().find(|r| &r.id == id).cloned()
    }

    /// Counts records not explicitly deactivated.
    pub async fn active_count(&self) -> usize {
        let state = self.inner.read().await;
        state.records.iter().filter(|r| r.active).count()
    }

    /// Applies a patch to one record and persists the set.
    ///
    /// Returns the updated record. The file is only rewritten when the patch
    /// changed something. If the write fails the in-memory change is kept and
    /// the error is returned.
    pub async fn update_one(
        &self,
        id: &ScheduleId,
        patch: SchedulePatch,
    ) -> Result<ScheduleRecord, StoreError> {
        let mut state = self.inner.write().await;
        let record = state
            .records
            .iter_mut()
            .find(|r| &r.id == id)
            .ok_or_else(|| StoreError::NotFound { id: id.clone() })?;

        if !patch.apply(record) {
            return Ok(record.clone());
        }
        let updated = record.clone();

        self.persist(&mut state).await?;
        debug!(schedule_id = %id, "Updated schedule");
        Ok(updated)
    }

    /// Sets the active flag. Returns whether the value changed.
    pub async fn set_active(&self, id: &ScheduleId, active: bool) -> Result<bool, StoreError> {
        let before = self
            .get(id)
            .await
            .ok_or_else(|| StoreError::NotFound { id: id.clone() })?;
        if before.active == active {
            return Ok(false);
        }
        let after = self
            .update_one(id, SchedulePatch::default().with_active(active))
            .await?;
        Ok(after.active != before.active)
    }

    /// Returns whether the file was modified since it was last loaded or
    /// written by this store.
    pub async fn has_external_changes(&self) -> bool {
        let current = self.modified().await;
        let state = self.inner.read().await;
        current != state.last_synced
    }

    async fn persist(&self, state: &mut StoreState) -> Result<(), StoreError> {
        let mut document = state.other.clone();
        let mut entries = Vec::with_capacity(state.records.len() + state.quarantined.len());
        for record in &state.records {
            let value = serde_json::to_value(record).map_err(|e| StoreError::Serialize {
                reason: e.to_string(),
            })?;
            entries.push(value);
        }
        entries.extend(state.quarantined.iter().cloned());
        document.insert(SCHEDULES_KEY.to_string(), Value::Array(entries));

        let content =
            serde_json::to_string_pretty(&document).map_err(|e| StoreError::Serialize {
                reason: e.to_string(),
            })?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, content)
            .await
            .map_err(|e| self.io_error(e))?;
        fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| self.io_error(e))?;

        state.last_synced = self.modified().await;
        Ok(())
    }

    async fn modified(&self) -> Option<SystemTime> {
        fs::metadata(&self.path).await.ok()?.modified().ok()
    }

    fn io_error(&self, error: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            reason: error.to_string(),
        }
    }
}

fn parse_document(content: &str) -> std::result::Result<StoreState, String> {
    if content.trim().is_empty() {
        return Ok(StoreState::default());
    }

    let value: Value = serde_json::from_str(content).map_err(|e| e.to_string())?;
    let Value::Object(mut other) = value else {
        return Err("top level is not an object".to_string());
    };
    let entries = match other.remove(SCHEDULES_KEY) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(entries)) => entries,
        Some(_) => return Err(format!("'{SCHEDULES_KEY}' is not an array")),
    };

    let mut state = StoreState {
        other,
        ..StoreState::default()
    };
    let mut seen = HashSet::new();
    for entry in entries {
        match serde_json::from_value::<ScheduleRecord>(entry.clone()) {
            Ok(record) if seen.insert(record.id.clone()) => state.records.push(record),
            Ok(record) => {
                warn!(schedule_id = %record.id, "Duplicate schedule id, quarantining entry");
                state.quarantined.push(entry);
            }
            Err(e) => {
                let id = entry.get("id").and_then(Value::as_str).unwrap_or("<missing>");
                warn!(schedule_id = id, error = %e, "Unreadable schedule, quarantining entry");
                state.quarantined.push(entry);
            }
        }
    }
    Ok(state)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::TimeUnit;
    use chrono::Utc;
    use serde_json::json;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> ScheduleStore {
        ScheduleStore::new(dir.path().join("nested").join("schedules.json"))
    }

    async fn write_json(store: &ScheduleStore, value: Value) {
        if let Some(parent) = store.path().parent() {
            fs::create_dir_all(parent).await.unwrap();
        }
        fs::write(store.path(), serde_json::to_string(&value).unwrap())
            .await
            .unwrap();
    }

    async fn read_json(store: &ScheduleStore) -> Value {
        serde_json::from_str(&fs::read_to_string(store.path()).await.unwrap()).unwrap()
    }

    fn id(s: &str) -> ScheduleId {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn first_load_creates_empty_file() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let report = store.load().await.expect("load");
        assert_eq!(report, LoadReport::default());
        assert_eq!(read_json(&store).await, json!({"schedules": []}));
        assert!(!store.has_external_changes().await);
    }

    #[tokio::test]
    async fn quarantines_unreadable_and_duplicate_entries() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        write_json(
            &store,
            json!({
                "schedules": [
                    {"id": "a", "timeInterval": "5", "timeUnit": "minute"},
                    {"name": "no id"},
                    {"id": "a", "name": "duplicate"},
                    {"id": "b", "timeInterval": "never"}
                ],
                "version": 2
            }),
        )
        .await;

        let report = store.load().await.expect("load");
        assert_eq!(report.loaded, 1);
        assert_eq!(report.quarantined, 3);

        store
            .update_one(&id("a"), SchedulePatch::default().with_active(false))
            .await
            .expect("update");

        let written = read_json(&store).await;
        let entries = written["schedules"].as_array().unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0]["active"], false);
        assert_eq!(entries[1], json!({"name": "no id"}));
        assert_eq!(entries[3], json!({"id": "b", "timeInterval": "never"}));
        assert_eq!(written["version"], 2);
    }

    #[tokio::test]
    async fn parse_failure_keeps_previous_records() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        write_json(&store, json!({"schedules": [{"id": "a"}]})).await;
        store.load().await.expect("load");

        fs::write(store.path(), "{ not json").await.unwrap();
        assert!(store.reload().await.is_err());
        assert!(store.get(&id("a")).await.is_some());
    }

    #[tokio::test]
    async fn update_one_persists_and_returns_record() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.load().await.unwrap();
        write_json(
            &store,
            json!({"schedules": [{"id": "a", "timeInterval": 1, "timeUnit": "hour"}]}),
        )
        .await;
        store.reload().await.unwrap();

        let now = Utc::now();
        let updated = store
            .update_one(&id("a"), SchedulePatch::default().with_last_skipped_time(now))
            .await
            .expect("update");
        assert_eq!(updated.last_skipped_time, Some(now));

        let reloaded = ScheduleStore::new(store.path());
        reloaded.load().await.unwrap();
        let record = reloaded.get(&id("a")).await.unwrap();
        assert_eq!(record.last_skipped_time, Some(now));
        assert_eq!(record.time_unit.as_deref(), Some("hour"));
    }

    #[tokio::test]
    async fn update_missing_record_fails() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.load().await.unwrap();

        let result = store
            .update_one(&id("ghost"), SchedulePatch::default().with_active(false))
            .await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn set_active_reports_change() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        write_json(&store, json!({"schedules": [{"id": "a"}, {"id": "b", "active": false}]})).await;
        store.load().await.unwrap();

        assert_eq!(store.active_count().await, 1);
        assert!(!store.set_active(&id("a"), true).await.unwrap());
        assert!(store.set_active(&id("b"), true).await.unwrap());
        assert_eq!(store.active_count().await, 2);
    }

    #[tokio::test]
    async fn detects_external_edits() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.load().await.unwrap();
        assert!(!store.has_external_changes().await);

        // Make sure the modification time moves even on coarse filesystems.
        let record = ScheduleRecord::new(id("x"), "external", 1, TimeUnit::Day);
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        write_json(&store, json!({"schedules": [record]})).await;

        assert!(store.has_external_changes().await);
        store.reload().await.unwrap();
        assert!(!store.has_external_changes().await);
        assert_eq!(store.records().await.len(), 1);
    }
}

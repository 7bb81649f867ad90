//! JSON-file record store
//!
//! Keeps every record in memory and, when backed by a file, rewrites the whole
//! file on each change (temp file + rename).

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::{AudioRecord, NewRecord, RecordStore, StoreError};
use crate::analysis::AnalysisOutcome;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct StoreData {
    next_id: i64,
    records: Vec<AudioRecord>,
}

pub struct JsonRecordStore {
    path: Option<PathBuf>,
    data: Mutex<StoreData>,
    records_tx: watch::Sender<Vec<AudioRecord>>,
}

impl JsonRecordStore {
    /// Store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self::with_data(None, StoreData::default())
    }

    /// Open (or start) a store persisted at `path`.
    ///
    /// A missing file is an empty store. A file that cannot be parsed is an
    /// error rather than silently discarded.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let data = match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str::<StoreData>(&contents)
                .map_err(|e| StoreError::Serialize(format!("parse {:?}: {}", path, e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreData::default(),
            Err(e) => return Err(StoreError::Io(format!("read {:?}: {}", path, e))),
        };
        log::info!(
            "Record store opened: {:?} ({} records)",
            path,
            data.records.len()
        );
        Ok(Self::with_data(Some(path.to_path_buf()), data))
    }

    /// Default location: `<local data dir>/pathology-detector/records.json`.
    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pathology-detector")
            .join("records.json")
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn with_data(path: Option<PathBuf>, data: StoreData) -> Self {
        let (records_tx, _) = watch::channel(sorted(&data.records));
        Self {
            path,
            data: Mutex::new(data),
            records_tx,
        }
    }

    /// Apply `change` to a copy of the data, persist the copy, then commit it
    /// and notify observers. Nothing changes when persisting fails.
    fn mutate<T>(
        &self,
        change: impl FnOnce(&mut StoreData) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self
            .data
            .lock()
            .map_err(|_| StoreError::Io("record store lock poisoned".to_string()))?;

        let mut next = guard.clone();
        let result = change(&mut next)?;
        if let Some(path) = &self.path {
            write_atomically(path, &next)?;
        }
        *guard = next;
        self.records_tx.send_replace(sorted(&guard.records));
        Ok(result)
    }
}

impl RecordStore for JsonRecordStore {
    fn insert(&self, record: NewRecord) -> Result<i64, StoreError> {
        let id = self.mutate(|data| {
            data.next_id += 1;
            let id = data.next_id;
            data.records.push(AudioRecord {
                id,
                created_at: record.created_at,
                duration_ms: record.duration_ms,
                file_name: record.file_name,
                file_path: record.file_path,
                status: AnalysisOutcome::NotProcessed,
            });
            Ok(id)
        })?;
        log::info!("Record {} inserted", id);
        Ok(id)
    }

    fn update(&self, record: &AudioRecord) -> Result<(), StoreError> {
        self.mutate(|data| {
            let slot = data
                .records
                .iter_mut()
                .find(|r| r.id == record.id)
                .ok_or(StoreError::NotFound(record.id))?;
            *slot = record.clone();
            Ok(())
        })?;
        log::debug!("Record {} updated: {:?}", record.id, record.status);
        Ok(())
    }

    fn delete(&self, id: i64) -> Result<Option<AudioRecord>, StoreError> {
        let removed = self.mutate(|data| {
            let index = data.records.iter().position(|r| r.id == id);
            Ok(index.map(|i| data.records.remove(i)))
        })?;
        if removed.is_some() {
            log::info!("Record {} deleted", id);
        }
        Ok(removed)
    }

    fn get(&self, id: i64) -> Result<Option<AudioRecord>, StoreError> {
        let guard = self
            .data
            .lock()
            .map_err(|_| StoreError::Io("record store lock poisoned".to_string()))?;
        Ok(guard.records.iter().find(|r| r.id == id).cloned())
    }

    fn observe_all(&self) -> watch::Receiver<Vec<AudioRecord>> {
        self.records_tx.subscribe()
    }
}

fn sorted(records: &[AudioRecord]) -> Vec<AudioRecord> {
    let mut records = records.to_vec();
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
    records
}

fn write_atomically(path: &Path, data: &StoreData) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| StoreError::Io(format!("create {:?}: {}", parent, e)))?;
    }

    let contents =
        serde_json::to_string_pretty(data).map_err(|e| StoreError::Serialize(e.to_string()))?;

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, contents)
        .map_err(|e| StoreError::Io(format!("write {:?}: {}", tmp_path, e)))?;

    // Windows refuses to rename over an existing file.
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(StoreError::Io(format!("remove {:?}: {}", path, e)));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| StoreError::Io(format!("rename {:?} to {:?}: {}", tmp_path, path, e)))
}

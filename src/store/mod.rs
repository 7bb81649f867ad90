//! Record store
//!
//! Saved recordings and their durable analysis outcomes. Observers get the
//! full list, newest first, every time it changes.

mod json;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::analysis::AnalysisOutcome;

pub use json::JsonRecordStore;

/// A saved recording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioRecord {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Display name, also used as the upload file name.
    pub file_name: String,
    pub file_path: PathBuf,
    #[serde(default)]
    pub status: AnalysisOutcome,
}

/// A recording about to be inserted; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRecord {
    pub created_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub file_name: String,
    pub file_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Record {0} not found")]
    NotFound(i64),
    #[error("Record store I/O error: {0}")]
    Io(String),
    #[error("Record store serialization error: {0}")]
    Serialize(String),
}

pub trait RecordStore: Send + Sync + 'static {
    /// Insert with status `NotProcessed` and return the new id.
    fn insert(&self, record: NewRecord) -> Result<i64, StoreError>;

    /// Replace the stored row with the same id.
    fn update(&self, record: &AudioRecord) -> Result<(), StoreError>;

    /// Remove a row, returning it if it existed.
    fn delete(&self, id: i64) -> Result<Option<AudioRecord>, StoreError>;

    fn get(&self, id: i64) -> Result<Option<AudioRecord>, StoreError>;

    /// All records ordered by descending creation time.
    fn observe_all(&self) -> watch::Receiver<Vec<AudioRecord>>;

    /// Persist a new outcome for one record.
    fn set_status(&self, id: i64, status: AnalysisOutcome) -> Result<AudioRecord, StoreError> {
        let mut record = self.get(id)?.ok_or(StoreError::NotFound(id))?;
        record.status = status;
        self.update(&record)?;
        Ok(record)
    }
}

/// Run a store operation on the blocking pool so file I/O stays off the
/// async workers.
pub async fn run_blocking<T, F>(store: &Arc<dyn RecordStore>, op: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&dyn RecordStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || op(store.as_ref()))
        .await
        .map_err(|e| StoreError::Io(format!("store task failed: {}", e)))?
}

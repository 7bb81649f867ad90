//! XDG path helpers for recordings
//!
//! Recordings are stored in: ~/.local/share/pathology-detector/recordings/
//! unless `Settings::recordings_dir` points elsewhere.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Default recordings directory.
pub fn default_recordings_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pathology-detector")
        .join("recordings")
}

/// Generate a unique WAV path for a recording inside `dir`, creating `dir`.
/// Format: <unix millis>_<uuid>.wav
pub fn generate_wav_path(dir: &Path, recording_id: Uuid) -> std::io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    Ok(dir.join(format!("{}_{}.wav", millis, recording_id)))
}

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::analysis::AnalysisModel;
use crate::audio::{default_recordings_dir, PcmFormat, SessionConfig, DEFAULT_SAMPLE_RATE};

const SETTINGS_FILE_NAME: &str = "settings.json";

/// Overrides `server_url` when set and non-empty.
pub const SERVER_URL_ENV: &str = "PATHOLOGY_DETECTOR_SERVER";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Base URL of the classifier server; requests go to `<server_url>/upload`.
    pub server_url: String,

    /// Recordings shorter than this are discarded with a "record a longer input" error.
    pub min_recording_ms: u64,

    /// Interval between recording progress updates.
    pub progress_interval_ms: u64,

    /// Wait between attempts when the classifier is unreachable or returns 5xx.
    pub retry_backoff_ms: u64,

    /// Sample rate requested from the microphone. The device may pick another.
    pub sample_rate: u32,

    /// Where new recordings are written. Defaults to the local data directory.
    pub recordings_dir: Option<PathBuf>,

    /// Model used when none is given.
    pub default_model: AnalysisModel,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:5000".to_string(),
            min_recording_ms: 2000,
            progress_interval_ms: 100,
            retry_backoff_ms: 5000,
            sample_rate: DEFAULT_SAMPLE_RATE,
            recordings_dir: None,
            default_model: AnalysisModel::Model3,
        }
    }
}

impl Settings {
    pub fn recordings_dir(&self) -> PathBuf {
        self.recordings_dir
            .clone()
            .unwrap_or_else(default_recordings_dir)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            format: PcmFormat::mono(self.sample_rate),
            progress_interval: Duration::from_millis(self.progress_interval_ms.max(1)),
        }
    }

    /// Set one field from its JSON key name and a textual value.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), String> {
        let value = value.trim();
        match key {
            "server_url" => self.server_url = value.to_string(),
            "min_recording_ms" => self.min_recording_ms = parse_number(key, value)?,
            "progress_interval_ms" => self.progress_interval_ms = parse_number(key, value)?,
            "retry_backoff_ms" => self.retry_backoff_ms = parse_number(key, value)?,
            "sample_rate" => self.sample_rate = parse_number(key, value)?,
            "recordings_dir" => {
                self.recordings_dir = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            "default_model" => self.default_model = value.parse()?,
            other => return Err(format!("Unknown setting '{}'", other)),
        }
        Ok(())
    }

    /// Apply environment overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var(SERVER_URL_ENV) {
            if !url.trim().is_empty() {
                self.server_url = url.trim().to_string();
            }
        }
        self
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("Invalid value '{}' for {}", value, key))
}

/// `<config dir>/pathology-detector/settings.json`
pub fn settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or_else(|| "Could not determine config directory".to_string())?;
    Ok(dir.join("pathology-detector").join(SETTINGS_FILE_NAME))
}

/// Load settings, falling back to defaults when the file is missing or unreadable.
pub fn load_settings(path: &Path) -> Settings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<Settings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                Settings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Settings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            Settings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &Settings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write to a temp file in the same directory, then rename over the original.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // Windows refuses to rename over an existing file.
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}

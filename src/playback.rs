//! Playback collaborator
//!
//! The coordinator only needs to load a file, toggle play/pause, seek and
//! observe the player. `DetachedPlayer` implements that contract without an
//! audio output, for the CLI and tests.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;

use crate::audio::probe_duration;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaybackSnapshot {
    /// Loaded file, used as the media id.
    pub media: Option<PathBuf>,
    pub is_playing: bool,
    pub position: Duration,
    pub duration: Duration,
}

impl PlaybackSnapshot {
    /// Position as a fraction of the duration, never negative.
    pub fn progress(&self) -> f32 {
        if self.duration.is_zero() {
            return 0.0;
        }
        (self.position.as_secs_f32() / self.duration.as_secs_f32()).clamp(0.0, 1.0)
    }

    pub fn is_current(&self, path: &Path) -> bool {
        self.media.as_deref() == Some(path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaybackError {
    #[error("Failed to load {path:?}: {message}")]
    Load { path: PathBuf, message: String },
}

pub trait Player: Send + Sync + 'static {
    /// Make `path` the current media, paused at the start.
    fn load(&self, path: &Path) -> Result<(), PlaybackError>;

    fn set_playing(&self, playing: bool);

    fn seek(&self, position: Duration);

    fn snapshot(&self) -> PlaybackSnapshot;

    fn subscribe(&self) -> watch::Receiver<PlaybackSnapshot>;
}

/// Player that tracks commands but produces no sound.
pub struct DetachedPlayer {
    state: watch::Sender<PlaybackSnapshot>,
}

impl DetachedPlayer {
    pub fn new() -> Self {
        let (state, _) = watch::channel(PlaybackSnapshot::default());
        Self { state }
    }
}

impl Default for DetachedPlayer {
    fn default() -> Self {
        Self::new()
    }
}

impl Player for DetachedPlayer {
    fn load(&self, path: &Path) -> Result<(), PlaybackError> {
        let duration = probe_duration(path).map_err(|e| PlaybackError::Load {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        log::debug!("Player loaded {:?} ({:?})", path, duration);
        self.state.send_replace(PlaybackSnapshot {
            media: Some(path.to_path_buf()),
            is_playing: false,
            position: Duration::ZERO,
            duration,
        });
        Ok(())
    }

    fn set_playing(&self, playing: bool) {
        self.state.send_if_modified(|s| {
            let playing = playing && s.media.is_some();
            let changed = s.is_playing != playing;
            s.is_playing = playing;
            changed
        });
    }

    fn seek(&self, position: Duration) {
        self.state.send_modify(|s| {
            s.position = position.min(s.duration);
        });
    }

    fn snapshot(&self) -> PlaybackSnapshot {
        self.state.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<PlaybackSnapshot> {
        self.state.subscribe()
    }
}

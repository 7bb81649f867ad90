//! Audio capture module for Pathology Detector
//!
//! This module handles microphone input capture and WAV container writing.
//! Uses CPAL for audio capture and hound to read finished files back.

mod format;
mod paths;
pub mod session;
mod source;
mod writer;

pub use format::{AudioFrame, ContainerHeader, PcmFormat, DEFAULT_SAMPLE_RATE, HEADER_LEN};
pub use paths::{default_recordings_dir, generate_wav_path};
pub use session::{
    RecordingSession, SessionConfig, SessionError, SessionEvent, SessionStatus, StopOutcome,
};
pub use source::{AudioError, CaptureHandle, CaptureSource, CpalSource};
pub use writer::{probe_duration, remove_recording, ContainerWriter};

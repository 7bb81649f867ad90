//! Streaming container writer
//!
//! Writes a placeholder header, appends PCM payload frame by frame, then seeks
//! back and rewrites the header once the payload length is known.

use std::fs::{self, File};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::format::{AudioFrame, ContainerHeader, PcmFormat, HEADER_LEN};
use super::AudioError;

/// Writer for a single container file.
///
/// `finalize` and `abandon` both consume the open file; any call after that
/// fails with [`AudioError::AlreadyFinalized`].
pub struct ContainerWriter {
    file: Option<BufWriter<File>>,
    path: PathBuf,
    format: PcmFormat,
    payload_len: u64,
}

impl ContainerWriter {
    /// Create (or truncate) `path` and write the placeholder header.
    pub fn create(path: &Path, format: PcmFormat) -> Result<Self, AudioError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| AudioError::Io(format!("create {:?}: {}", parent, e)))?;
        }

        let file = File::create(path)
            .map_err(|e| AudioError::Io(format!("create {:?}: {}", path, e)))?;
        let mut file = BufWriter::new(file);
        file.write_all(&ContainerHeader::placeholder(format).encode())
            .map_err(|e| AudioError::Io(format!("write header {:?}: {}", path, e)))?;

        log::debug!("Container opened: {:?} ({} Hz mono)", path, format.sample_rate);

        Ok(Self {
            file: Some(file),
            path: path.to_path_buf(),
            format,
            payload_len: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> PcmFormat {
        self.format
    }

    /// Payload bytes written so far (header excluded).
    pub fn payload_len(&self) -> u64 {
        self.payload_len
    }

    pub fn write_frame(&mut self, frame: AudioFrame) -> Result<(), AudioError> {
        let file = self.file.as_mut().ok_or(AudioError::AlreadyFinalized)?;
        file.write_all(frame.as_bytes())
            .map_err(|e| AudioError::Io(format!("write {:?}: {}", self.path, e)))?;
        self.payload_len += frame.byte_len() as u64;
        Ok(())
    }

    /// Rewrite the header with the real payload length and sync to disk.
    ///
    /// `elapsed` is the wall-clock capture time; it is only compared against
    /// the payload-derived duration for diagnostics.
    pub fn finalize(&mut self, elapsed: Duration) -> Result<u64, AudioError> {
        let Some(file) = self.file.take() else {
            log::error!("Container {:?} finalized twice", self.path);
            return Err(AudioError::AlreadyFinalized);
        };

        let header = ContainerHeader::new(self.format, self.payload_len)?;
        let mut file = file
            .into_inner()
            .map_err(|e| AudioError::Io(format!("flush {:?}: {}", self.path, e.error())))?;

        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.write_all(&header.encode()))
            .and_then(|_| file.flush())
            .and_then(|_| file.sync_all())
            .map_err(|e| AudioError::Io(format!("finalize {:?}: {}", self.path, e)))?;

        let payload_duration = self.format.duration_of(self.payload_len);
        log::info!(
            "Container finalized: {:?} ({} payload bytes, {:?} audio, {:?} wall clock)",
            self.path,
            self.payload_len,
            payload_duration,
            elapsed
        );

        Ok(self.payload_len)
    }

    /// Close and delete the partially written file.
    pub fn abandon(&mut self) -> Result<(), AudioError> {
        if self.file.take().is_none() {
            return Err(AudioError::AlreadyFinalized);
        }
        remove_recording(&self.path);
        Ok(())
    }
}

impl Drop for ContainerWriter {
    fn drop(&mut self) {
        if self.file.is_some() {
            log::warn!(
                "Container {:?} dropped without finalize, removing partial file",
                self.path
            );
            self.file = None;
            remove_recording(&self.path);
        }
    }
}

/// Delete a recording file, logging instead of failing.
pub fn remove_recording(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => log::debug!("Removed recording {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Failed to remove recording {:?}: {}", path, e),
    }
}

/// Read the duration recorded in a finalized container's own header.
pub fn probe_duration(path: &Path) -> Result<Duration, AudioError> {
    let reader =
        hound::WavReader::open(path).map_err(|e| AudioError::Probe(format!("{:?}: {}", path, e)))?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return Err(AudioError::Probe(format!("{:?}: zero sample rate", path)));
    }

    let frames = reader.duration() as u64;
    Ok(Duration::from_millis(frames * 1000 / spec.sample_rate as u64))
}

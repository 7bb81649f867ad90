//! Recording session
//!
//! A session owns one capture handle and one container writer for the
//! lifetime of a single recording. Two activities run while recording:
//!
//! ```text
//! capture thread (blocking)            sampler task (tokio)
//! ┌──────────────────────────┐         ┌───────────────────────┐
//! │ read_frame ─▶ write_frame│         │ every interval:       │
//! │ until status != Recording│         │   Progress { elapsed }│
//! │ then finalize / abandon  │         └───────────────────────┘
//! └──────────────────────────┘
//! ```
//!
//! The `watch` status value is the only gate for loop continuation and is
//! re-checked before every write.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::format::PcmFormat;
use super::source::{AudioError, CaptureHandle, CaptureSource};
use super::writer::{probe_duration, remove_recording, ContainerWriter};

const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Recording,
    Finalizing,
    Stopped,
    Canceled,
    Failed,
}

impl SessionStatus {
    /// Recording or finalizing; a new start is refused.
    pub fn is_busy(&self) -> bool {
        matches!(self, SessionStatus::Recording | SessionStatus::Finalizing)
    }
}

/// Events emitted by a session, tagged with the recording id.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Started {
        id: Uuid,
        path: PathBuf,
    },
    /// Periodic tick while recording. Peak amplitude is not measured and is
    /// always reported as zero.
    Progress {
        id: Uuid,
        elapsed: Duration,
        amplitude: u16,
    },
    /// File finalized; `duration` is read back from the file itself.
    Stopped {
        id: Uuid,
        path: PathBuf,
        duration: Duration,
    },
    /// Canceled before finalize; the file has been deleted.
    Canceled {
        id: Uuid,
        path: PathBuf,
    },
    Failed {
        id: Uuid,
        message: String,
    },
}

impl SessionEvent {
    pub fn id(&self) -> Uuid {
        match self {
            SessionEvent::Started { id, .. }
            | SessionEvent::Progress { id, .. }
            | SessionEvent::Stopped { id, .. }
            | SessionEvent::Canceled { id, .. }
            | SessionEvent::Failed { id, .. } => *id,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("A recording is already in progress")]
    AlreadyRecording,
    #[error("No recording in progress")]
    NotRecording,
    #[error(transparent)]
    Audio(#[from] AudioError),
    #[error("Recording task failed: {0}")]
    TaskFailed(String),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Format requested from the capture source.
    pub format: PcmFormat,
    /// Interval between progress events.
    pub progress_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            format: PcmFormat::default(),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

/// Result of a successful `stop`.
#[derive(Debug, Clone, PartialEq)]
pub enum StopOutcome {
    Stopped { path: PathBuf, duration: Duration },
    Canceled { path: PathBuf },
}

/// How the capture thread ended.
#[derive(Debug)]
enum CaptureExit {
    Finalized,
    Abandoned,
    Failed(AudioError),
}

struct ActiveCapture {
    id: Uuid,
    path: PathBuf,
    capture: JoinHandle<CaptureExit>,
    sampler: JoinHandle<()>,
    payload_len: Arc<AtomicU64>,
}

/// Everything the capture thread needs besides the handle and writer.
struct CaptureContext {
    id: Uuid,
    started_at: Instant,
    status: Arc<watch::Sender<SessionStatus>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    payload_len: Arc<AtomicU64>,
}

pub struct RecordingSession {
    source: Arc<dyn CaptureSource>,
    config: SessionConfig,
    events: mpsc::UnboundedSender<SessionEvent>,
    status: Arc<watch::Sender<SessionStatus>>,
    active: Option<ActiveCapture>,
}

impl RecordingSession {
    pub fn new(
        source: Arc<dyn CaptureSource>,
        config: SessionConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus::Idle);
        Self {
            source,
            config,
            events,
            status: Arc::new(status),
            active: None,
        }
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Id of the recording currently owned by this session, if any.
    pub fn current_id(&self) -> Option<Uuid> {
        self.active.as_ref().map(|a| a.id)
    }

    /// Payload bytes written so far by the active capture.
    pub fn bytes_written(&self) -> u64 {
        self.active
            .as_ref()
            .map(|a| a.payload_len.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Open the device and output file and start capturing into `path`.
    ///
    /// Refused with `AlreadyRecording` (and no side effects) while a capture
    /// is recording or finalizing.
    pub async fn start(&mut self, id: Uuid, path: PathBuf) -> Result<(), SessionError> {
        if self.status().is_busy() {
            log::warn!(
                "Start ignored for {}: recording {:?} already in progress",
                id,
                self.current_id()
            );
            return Err(SessionError::AlreadyRecording);
        }

        self.reap().await;
        self.status.send_replace(SessionStatus::Idle);

        let payload_len = Arc::new(AtomicU64::new(0));
        let started_at = Instant::now();
        let ctx = CaptureContext {
            id,
            started_at,
            status: self.status.clone(),
            events: self.events.clone(),
            payload_len: payload_len.clone(),
        };

        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), AudioError>>();
        let source = self.source.clone();
        let requested = self.config.format;
        let capture_path = path.clone();

        let capture = tokio::task::spawn_blocking(move || {
            let (handle, writer) = match open_pipeline(source.as_ref(), requested, &capture_path) {
                Ok(opened) => opened,
                Err(e) => {
                    ctx.status.send_replace(SessionStatus::Failed);
                    let _ = ready_tx.send(Err(e.clone()));
                    return CaptureExit::Failed(e);
                }
            };
            ctx.status.send_replace(SessionStatus::Recording);
            let _ = ready_tx.send(Ok(()));
            run_capture(ctx, handle, writer)
        });

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = capture.await;
                log::error!("Failed to start recording {}: {}", id, e);
                return Err(e.into());
            }
            Err(_) => {
                let joined = capture.await;
                self.status.send_replace(SessionStatus::Failed);
                remove_recording(&path);
                return Err(SessionError::TaskFailed(format!(
                    "capture thread exited during open: {:?}",
                    joined.err()
                )));
            }
        }

        let sampler = tokio::spawn(run_sampler(
            id,
            started_at,
            self.config.progress_interval,
            self.status.subscribe(),
            self.events.clone(),
        ));

        self.active = Some(ActiveCapture {
            id,
            path: path.clone(),
            capture,
            sampler,
            payload_len,
        });

        log::info!("Recording {} started: {:?}", id, path);
        self.emit(SessionEvent::Started { id, path });
        Ok(())
    }

    /// Stop the active recording.
    ///
    /// With `canceled` the capture is torn down without finalizing and the
    /// partial file is deleted. Otherwise any frame already read is written,
    /// the container is finalized and its duration probed from the file.
    pub async fn stop(&mut self, canceled: bool) -> Result<StopOutcome, SessionError> {
        let Some(active) = self.active.take() else {
            return Err(SessionError::NotRecording);
        };

        if self.status() != SessionStatus::Recording {
            // Capture already ended on its own (device or file failure).
            active.sampler.abort();
            return match active.capture.await {
                Ok(CaptureExit::Failed(e)) => Err(SessionError::Audio(e)),
                _ => Err(SessionError::NotRecording),
            };
        }

        let next = if canceled {
            SessionStatus::Canceled
        } else {
            SessionStatus::Finalizing
        };
        self.status.send_replace(next);
        log::info!("Recording {} stopping (canceled={})", active.id, canceled);

        let _ = active.sampler.await;
        let exit = active.capture.await;

        match exit {
            Ok(CaptureExit::Finalized) => {
                let probe_path = active.path.clone();
                let probed = tokio::task::spawn_blocking(move || probe_duration(&probe_path))
                    .await
                    .map_err(|e| AudioError::Probe(e.to_string()))
                    .and_then(|r| r);

                match probed {
                    Ok(duration) => {
                        self.status.send_replace(SessionStatus::Stopped);
                        log::info!(
                            "Recording {} stopped: {:?} ({:?})",
                            active.id,
                            active.path,
                            duration
                        );
                        self.emit(SessionEvent::Stopped {
                            id: active.id,
                            path: active.path.clone(),
                            duration,
                        });
                        Ok(StopOutcome::Stopped {
                            path: active.path,
                            duration,
                        })
                    }
                    Err(e) => {
                        remove_recording(&active.path);
                        self.fail(active.id, &e.to_string());
                        Err(e.into())
                    }
                }
            }
            Ok(CaptureExit::Abandoned) => {
                self.status.send_replace(SessionStatus::Canceled);
                log::info!("Recording {} canceled, file removed", active.id);
                self.emit(SessionEvent::Canceled {
                    id: active.id,
                    path: active.path.clone(),
                });
                Ok(StopOutcome::Canceled { path: active.path })
            }
            Ok(CaptureExit::Failed(e)) => {
                // The capture thread already reported the failure.
                self.status.send_replace(SessionStatus::Failed);
                Err(e.into())
            }
            Err(join_err) => {
                remove_recording(&active.path);
                let message = format!("capture task panicked: {}", join_err);
                self.fail(active.id, &message);
                Err(SessionError::TaskFailed(message))
            }
        }
    }

    /// Cancel anything in progress and return to Idle.
    pub async fn reset(&mut self) {
        if self.status() == SessionStatus::Recording {
            if let Err(e) = self.stop(true).await {
                log::warn!("Cancel during reset failed: {}", e);
            }
        }
        self.reap().await;
        self.status.send_replace(SessionStatus::Idle);
    }

    /// Join a capture that already ended without a stop call.
    async fn reap(&mut self) {
        if let Some(active) = self.active.take() {
            active.sampler.abort();
            if let Ok(CaptureExit::Failed(e)) = active.capture.await {
                log::debug!("Reaped failed capture {}: {}", active.id, e);
            }
        }
    }

    fn fail(&self, id: Uuid, message: &str) {
        log::error!("Recording {} failed: {}", id, message);
        self.status.send_replace(SessionStatus::Failed);
        self.emit(SessionEvent::Failed {
            id,
            message: message.to_string(),
        });
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            log::debug!("Session event dropped: receiver closed");
        }
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.sampler.abort();
            if self.status().is_busy() {
                log::info!("Session dropped while recording {}, canceling", active.id);
                self.status.send_replace(SessionStatus::Canceled);
            }
        }
    }
}

fn open_pipeline(
    source: &dyn CaptureSource,
    requested: PcmFormat,
    path: &Path,
) -> Result<(Box<dyn CaptureHandle>, ContainerWriter), AudioError> {
    let mut handle = source.open(requested)?;
    match ContainerWriter::create(path, handle.format()) {
        Ok(writer) => Ok((handle, writer)),
        Err(e) => {
            handle.close();
            remove_recording(path);
            Err(e)
        }
    }
}

fn run_capture(
    ctx: CaptureContext,
    mut handle: Box<dyn CaptureHandle>,
    mut writer: ContainerWriter,
) -> CaptureExit {
    let status = ctx.status.subscribe();

    let loop_result = loop {
        if *status.borrow() != SessionStatus::Recording {
            break Ok(());
        }
        let frame = match handle.read_frame() {
            Ok(frame) => frame,
            Err(e) => break Err(e),
        };
        // Canceled means teardown has begun: nothing more reaches the file.
        if *status.borrow() == SessionStatus::Canceled {
            break Ok(());
        }
        if let Err(e) = writer.write_frame(frame) {
            break Err(e);
        }
        ctx.payload_len.store(writer.payload_len(), Ordering::Relaxed);
    };

    handle.close();

    let fault = match loop_result {
        Err(e) if *status.borrow() == SessionStatus::Recording => Some(e),
        Err(e) => {
            log::debug!("Capture {} read error after stop ignored: {}", ctx.id, e);
            None
        }
        Ok(()) => None,
    };

    let exit = match fault {
        Some(e) => {
            let _ = writer.abandon();
            CaptureExit::Failed(e)
        }
        None if *status.borrow() == SessionStatus::Finalizing => {
            match writer.finalize(ctx.started_at.elapsed()) {
                Ok(_) => CaptureExit::Finalized,
                Err(e) => {
                    remove_recording(writer.path());
                    CaptureExit::Failed(e)
                }
            }
        }
        None => {
            let _ = writer.abandon();
            CaptureExit::Abandoned
        }
    };

    if let CaptureExit::Failed(e) = &exit {
        log::error!("Recording {} failed: {}", ctx.id, e);
        ctx.status.send_replace(SessionStatus::Failed);
        let _ = ctx.events.send(SessionEvent::Failed {
            id: ctx.id,
            message: e.to_string(),
        });
    }

    exit
}

async fn run_sampler(
    id: Uuid,
    started_at: Instant,
    interval: Duration,
    mut status: watch::Receiver<SessionStatus>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if *status.borrow() != SessionStatus::Recording {
                    break;
                }
                let progress = SessionEvent::Progress {
                    id,
                    elapsed: started_at.elapsed(),
                    amplitude: 0,
                };
                if events.send(progress).is_err() {
                    break;
                }
            }
            changed = status.changed() => {
                if changed.is_err() || *status.borrow() != SessionStatus::Recording {
                    break;
                }
            }
        }
    }
    log::debug!("Progress sampler for {} stopped", id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::AudioFrame;
    use std::sync::atomic::AtomicUsize;

    /// Source whose handle produces 10 ms silent frames at 8 kHz.
    struct TestMic {
        opens: Arc<AtomicUsize>,
        fail_open: bool,
    }

    struct TestHandle {
        closes: usize,
    }

    impl CaptureSource for TestMic {
        fn open(&self, format: PcmFormat) -> Result<Box<dyn CaptureHandle>, AudioError> {
            if self.fail_open {
                return Err(AudioError::DeviceUnavailable("unplugged".to_string()));
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            assert_eq!(format.channels, 1);
            Ok(Box::new(TestHandle { closes: 0 }))
        }
    }

    impl CaptureHandle for TestHandle {
        fn format(&self) -> PcmFormat {
            PcmFormat::mono(8_000)
        }

        fn read_frame(&mut self) -> Result<AudioFrame, AudioError> {
            std::thread::sleep(Duration::from_millis(10));
            Ok(AudioFrame::silence(80))
        }

        fn close(&mut self) {
            self.closes += 1;
        }
    }

    fn session(fail_open: bool) -> (RecordingSession, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let source = Arc::new(TestMic {
            opens: Arc::new(AtomicUsize::new(0)),
            fail_open,
        });
        let config = SessionConfig {
            format: PcmFormat::mono(8_000),
            progress_interval: Duration::from_millis(20),
        };
        (RecordingSession::new(source, config, tx), rx)
    }

    #[tokio::test]
    async fn stop_without_start_is_not_recording() {
        let (mut session, _rx) = session(false);
        assert!(matches!(
            session.stop(false).await,
            Err(SessionError::NotRecording)
        ));
        assert_eq!(session.status(), SessionStatus::Idle);
    }

    #[tokio::test]
    async fn open_failure_marks_session_failed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.wav");
        let (mut session, _rx) = session(true);

        let result = session.start(Uuid::new_v4(), path.clone()).await;
        assert!(matches!(
            result,
            Err(SessionError::Audio(AudioError::DeviceUnavailable(_)))
        ));
        assert_eq!(session.status(), SessionStatus::Failed);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn progress_events_report_zero_amplitude() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, mut rx) = session(false);
        let id = Uuid::new_v4();

        session.start(id, dir.path().join("p.wav")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        session.stop(false).await.unwrap();

        let mut progress = 0;
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::Progress { id: eid, amplitude, .. } = event {
                assert_eq!(eid, id);
                assert_eq!(amplitude, 0);
                progress += 1;
            }
        }
        assert!(progress >= 2, "expected progress ticks, got {}", progress);
    }

    #[tokio::test]
    async fn reset_returns_to_idle_and_allows_restart() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, _rx) = session(false);

        session
            .start(Uuid::new_v4(), dir.path().join("a.wav"))
            .await
            .unwrap();
        session.stop(false).await.unwrap();
        assert_eq!(session.status(), SessionStatus::Stopped);

        session.reset().await;
        assert_eq!(session.status(), SessionStatus::Idle);

        session
            .start(Uuid::new_v4(), dir.path().join("b.wav"))
            .await
            .unwrap();
        assert_eq!(session.status(), SessionStatus::Recording);
        session.stop(true).await.unwrap();
    }
}

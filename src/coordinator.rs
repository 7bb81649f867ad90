//! Recording/processing coordinator
//!
//! A single task owns the recording session, the active analysis jobs and the
//! recorder state machine. Everything else talks to it through
//! [`CoordinatorHandle`] and observes it through the published [`ViewState`].
//!
//! ```text
//!   commands ──┐
//!   session ───┤                 ┌─▶ reduce() ─▶ effects
//!   job reports┼─▶ coordinator ──┤
//!   store ─────┤                 └─▶ merge_view() ─▶ watch<ViewState>
//!   player ────┘
//! ```

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::analysis::{
    AnalysisModel, Classifier, JobEngine, JobHandle, JobReport, JobResult, DEFAULT_RETRY_BACKOFF,
};
use crate::audio::{
    default_recordings_dir, generate_wav_path, probe_duration, remove_recording, AudioError,
    CaptureSource, RecordingSession, SessionConfig, SessionError, SessionEvent,
};
use crate::playback::{PlaybackError, PlaybackSnapshot, Player};
use crate::settings::Settings;
use crate::state_machine::{reduce, Effect, Event, RecorderPolicy, State};
use crate::store::{self, AudioRecord, NewRecord, RecordStore, StoreError};
use crate::view::{merge_view, ViewInputs, ViewState};

/// Shown once when an analysis job fails for a reason retrying cannot fix.
pub const ANALYSIS_FAILED_NOTICE: &str = "An error occurred, please try later.";

pub const PERMISSION_REQUIRED_NOTICE: &str = "Microphone permission is required to record.";

const COMMAND_BUFFER: usize = 32;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Microphone permission has not been granted")]
    PermissionDenied,
    #[error("A recording is already in progress")]
    AlreadyRecording,
    #[error("No recording in progress")]
    NotRecording,
    #[error("Failed to start recording: {0}")]
    StartFailed(String),
    #[error("Record {0} not found")]
    RecordNotFound(i64),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Audio(#[from] AudioError),
    #[error(transparent)]
    Playback(#[from] PlaybackError),
    #[error("Failed to prepare recording file: {0}")]
    Io(String),
    #[error("Coordinator is not running")]
    Stopped,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub recordings_dir: PathBuf,
    pub session: SessionConfig,
    pub policy: RecorderPolicy,
    pub retry_backoff: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            recordings_dir: default_recordings_dir(),
            session: SessionConfig::default(),
            policy: RecorderPolicy::default(),
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

impl From<&Settings> for CoordinatorConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            recordings_dir: settings.recordings_dir(),
            session: settings.session_config(),
            policy: RecorderPolicy {
                min_duration: Duration::from_millis(settings.min_recording_ms),
            },
            retry_backoff: Duration::from_millis(settings.retry_backoff_ms),
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, CoordinatorError>>;

enum Command {
    PermissionGranted {
        reply: Reply<()>,
    },
    StartRecording {
        reply: Reply<PathBuf>,
    },
    StopRecording {
        reply: Reply<()>,
    },
    CancelRecording {
        wav_path: PathBuf,
        reply: Reply<()>,
    },
    SaveRecording {
        name: String,
        wav_path: PathBuf,
        duration: Option<Duration>,
        reply: Reply<i64>,
    },
    DeleteRecord {
        id: i64,
        reply: Reply<()>,
    },
    RequestAnalysis {
        id: i64,
        model: AnalysisModel,
        reply: Reply<bool>,
    },
    CancelAnalysis {
        id: i64,
        reply: Reply<bool>,
    },
    TogglePlayback {
        wav_path: PathBuf,
        reply: Reply<()>,
    },
    Seek {
        wav_path: PathBuf,
        position: Duration,
        reply: Reply<()>,
    },
    DismissNotice {
        reply: Reply<()>,
    },
    DismissError {
        reply: Reply<()>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Cloneable handle to a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Command>,
    view: watch::Receiver<ViewState>,
}

impl CoordinatorHandle {
    /// Latest published view.
    pub fn view(&self) -> ViewState {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewState> {
        self.view.clone()
    }

    pub async fn permission_granted(&self) -> Result<(), CoordinatorError> {
        self.request(|reply| Command::PermissionGranted { reply })
            .await
    }

    /// Start recording into a new file and return its path.
    pub async fn start_recording(&self) -> Result<PathBuf, CoordinatorError> {
        self.request(|reply| Command::StartRecording { reply }).await
    }

    /// Stop and finalize the current recording.
    pub async fn stop_recording(&self) -> Result<(), CoordinatorError> {
        self.request(|reply| Command::StopRecording { reply }).await
    }

    /// Cancel the take stored at `wav_path`, in progress or finished.
    pub async fn cancel_recording(&self, wav_path: PathBuf) -> Result<(), CoordinatorError> {
        self.request(|reply| Command::CancelRecording { wav_path, reply })
            .await
    }

    /// Store a finished take and return its record id. The duration is read
    /// from the file when not given.
    pub async fn save_recording(
        &self,
        name: String,
        wav_path: PathBuf,
        duration: Option<Duration>,
    ) -> Result<i64, CoordinatorError> {
        self.request(|reply| Command::SaveRecording {
            name,
            wav_path,
            duration,
            reply,
        })
        .await
    }

    pub async fn delete_record(&self, id: i64) -> Result<(), CoordinatorError> {
        self.request(|reply| Command::DeleteRecord { id, reply })
            .await
    }

    /// Submit a record for analysis. Returns false when nothing was started
    /// because a job is already active or the record already has a verdict.
    pub async fn request_analysis(
        &self,
        id: i64,
        model: AnalysisModel,
    ) -> Result<bool, CoordinatorError> {
        self.request(|reply| Command::RequestAnalysis { id, model, reply })
            .await
    }

    /// Cancel the active job for a record. Returns false when there was none.
    pub async fn cancel_analysis(&self, id: i64) -> Result<bool, CoordinatorError> {
        self.request(|reply| Command::CancelAnalysis { id, reply })
            .await
    }

    pub async fn toggle_playback(&self, wav_path: PathBuf) -> Result<(), CoordinatorError> {
        self.request(|reply| Command::TogglePlayback { wav_path, reply })
            .await
    }

    pub async fn seek(&self, wav_path: PathBuf, position: Duration) -> Result<(), CoordinatorError> {
        self.request(|reply| Command::Seek {
            wav_path,
            position,
            reply,
        })
        .await
    }

    pub async fn dismiss_notice(&self) -> Result<(), CoordinatorError> {
        self.request(|reply| Command::DismissNotice { reply }).await
    }

    /// Clear a recorder error and return to idle.
    pub async fn dismiss_error(&self) -> Result<(), CoordinatorError> {
        self.request(|reply| Command::DismissError { reply }).await
    }

    /// Cancel all jobs and any recording, then stop the coordinator.
    pub async fn shutdown(&self) -> Result<(), CoordinatorError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| CoordinatorError::Stopped)?;
        rx.await.map_err(|_| CoordinatorError::Stopped)?
    }
}

/// Spawn the coordinator on the current tokio runtime.
pub fn spawn(
    config: CoordinatorConfig,
    source: Arc<dyn CaptureSource>,
    classifier: Arc<dyn Classifier>,
    store: Arc<dyn RecordStore>,
    player: Arc<dyn Player>,
) -> CoordinatorHandle {
    let (tx, commands) = mpsc::channel(COMMAND_BUFFER);
    let (session_tx, session_events) = mpsc::unbounded_channel();
    let (report_tx, reports) = mpsc::unbounded_channel();
    let (view_tx, view_rx) = watch::channel(ViewState::default());

    let session = RecordingSession::new(source, config.session.clone(), session_tx);
    let engine = JobEngine::new(classifier, store.clone(), config.retry_backoff, report_tx);

    let coordinator = Coordinator {
        records_rx: store.observe_all(),
        playback_rx: player.subscribe(),
        config,
        state: State::default(),
        permission_granted: false,
        notice: None,
        session,
        engine,
        jobs: HashMap::new(),
        retiring: HashMap::new(),
        store,
        player,
        view_tx,
    };

    tokio::spawn(coordinator.run(commands, session_events, reports));

    CoordinatorHandle { tx, view: view_rx }
}

struct Coordinator {
    config: CoordinatorConfig,
    state: State,
    permission_granted: bool,
    notice: Option<String>,
    session: RecordingSession,
    engine: JobEngine,
    /// At most one active job per record id.
    jobs: HashMap<i64, JobHandle>,
    /// Canceled jobs whose report has not arrived yet.
    retiring: HashMap<i64, JobHandle>,
    store: Arc<dyn RecordStore>,
    player: Arc<dyn Player>,
    records_rx: watch::Receiver<Vec<AudioRecord>>,
    playback_rx: watch::Receiver<PlaybackSnapshot>,
    view_tx: watch::Sender<ViewState>,
}

impl From<SessionEvent> for Event {
    fn from(event: SessionEvent) -> Self {
        match event {
            SessionEvent::Started { id, path } => Event::AudioStarted { id, wav_path: path },
            SessionEvent::Progress {
                id,
                elapsed,
                amplitude,
            } => Event::AudioProgress {
                id,
                elapsed,
                amplitude,
            },
            SessionEvent::Stopped { id, path, duration } => Event::AudioStopped {
                id,
                wav_path: path,
                duration,
            },
            SessionEvent::Canceled { id, .. } => Event::AudioCanceled { id },
            SessionEvent::Failed { id, message } => Event::AudioFailed { id, err: message },
        }
    }
}

impl Coordinator {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut session_events: mpsc::UnboundedReceiver<SessionEvent>,
        mut reports: mpsc::UnboundedReceiver<JobReport>,
    ) {
        self.publish();
        log::info!("Coordinator started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(Ok(()));
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        log::info!("All coordinator handles dropped");
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = session_events.recv() => {
                    self.dispatch(event.into()).await;
                }
                Some(report) = reports.recv() => self.handle_report(report),
                Ok(()) = self.records_rx.changed() => self.publish(),
                Ok(()) = self.playback_rx.changed() => self.publish(),
            }
        }

        log::info!("Coordinator ended");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::PermissionGranted { reply } => {
                self.permission_granted = true;
                self.publish();
                let _ = reply.send(Ok(()));
            }
            Command::StartRecording { reply } => {
                let result = self.start_recording().await;
                let _ = reply.send(result);
            }
            Command::StopRecording { reply } => {
                let result = if self.state.is_capturing() {
                    self.dispatch(Event::Stop).await;
                    Ok(())
                } else {
                    Err(CoordinatorError::NotRecording)
                };
                let _ = reply.send(result);
            }
            Command::CancelRecording { wav_path, reply } => {
                self.dispatch(Event::Cancel { wav_path }).await;
                let _ = reply.send(Ok(()));
            }
            Command::SaveRecording {
                name,
                wav_path,
                duration,
                reply,
            } => {
                let result = self.save_recording(name, wav_path, duration).await;
                let _ = reply.send(result);
            }
            Command::DeleteRecord { id, reply } => {
                let result = self.delete_record(id).await;
                let _ = reply.send(result);
            }
            Command::RequestAnalysis { id, model, reply } => {
                let result = self.request_analysis(id, model).await;
                let _ = reply.send(result);
            }
            Command::CancelAnalysis { id, reply } => {
                let canceled = self.cancel_analysis(id);
                let _ = reply.send(Ok(canceled));
            }
            Command::TogglePlayback { wav_path, reply } => {
                let result = self.toggle_playback(wav_path);
                let _ = reply.send(result);
            }
            Command::Seek {
                wav_path,
                position,
                reply,
            } => {
                let result = self.seek(wav_path, position);
                let _ = reply.send(result);
            }
            Command::DismissNotice { reply } => {
                self.notice = None;
                self.publish();
                let _ = reply.send(Ok(()));
            }
            Command::DismissError { reply } => {
                self.dispatch(Event::Dismiss).await;
                let _ = reply.send(Ok(()));
            }
            // Handled by the run loop
            Command::Shutdown { reply } => {
                let _ = reply.send(Ok(()));
            }
        }
    }

    // -----------------
    // Recorder
    // -----------------

    async fn start_recording(&mut self) -> Result<PathBuf, CoordinatorError> {
        if !self.permission_granted {
            self.notice = Some(PERMISSION_REQUIRED_NOTICE.to_string());
            self.publish();
            return Err(CoordinatorError::PermissionDenied);
        }
        if self.state.is_capturing() {
            return Err(CoordinatorError::AlreadyRecording);
        }

        let id = Uuid::new_v4();
        let wav_path = generate_wav_path(&self.config.recordings_dir, id)
            .map_err(|e| CoordinatorError::Io(e.to_string()))?;

        self.dispatch(Event::Start {
            id,
            wav_path: wav_path.clone(),
        })
        .await;

        match &self.state {
            State::Error { message } => Err(CoordinatorError::StartFailed(message.clone())),
            _ => Ok(wav_path),
        }
    }

    async fn save_recording(
        &mut self,
        name: String,
        wav_path: PathBuf,
        duration: Option<Duration>,
    ) -> Result<i64, CoordinatorError> {
        self.dispatch(Event::Saved {
            wav_path: wav_path.clone(),
        })
        .await;

        let duration = match duration {
            Some(duration) => duration,
            None => {
                let probe_path = wav_path.clone();
                tokio::task::spawn_blocking(move || probe_duration(&probe_path))
                    .await
                    .map_err(|e| AudioError::Probe(e.to_string()))??
            }
        };

        let record = NewRecord {
            created_at: chrono::Utc::now(),
            duration_ms: duration.as_millis() as u64,
            file_name: name,
            file_path: wav_path,
        };
        let id = store::run_blocking(&self.store, move |s| s.insert(record)).await?;
        Ok(id)
    }

    /// Run the recorder reducer on `event` and execute its effects. Effects
    /// that fail feed a follow-up event back into the reducer.
    async fn dispatch(&mut self, event: Event) {
        let mut pending = VecDeque::from([event]);

        while let Some(event) = pending.pop_front() {
            log::debug!("Recorder event: {:?}", event);

            let old_discriminant = std::mem::discriminant(&self.state);
            let (next, effects) = reduce(&self.state, event, &self.config.policy);
            if old_discriminant != std::mem::discriminant(&next) {
                log::info!("Recorder transition: {:?} -> {:?}", self.state, next);
            }
            self.state = next;

            for effect in effects {
                match effect {
                    Effect::EmitUi => self.publish(),
                    Effect::StartAudio { id, wav_path } => {
                        if let Err(e) = self.session.start(id, wav_path).await {
                            pending.push_back(Event::AudioStartFailed {
                                id,
                                err: e.to_string(),
                            });
                        }
                    }
                    Effect::StopAudio { id, canceled } => {
                        match self.session.stop(canceled).await {
                            Ok(outcome) => log::debug!("Session stopped: {:?}", outcome),
                            Err(SessionError::NotRecording) if canceled => {
                                log::debug!("Recording {} already ended before cancel", id)
                            }
                            Err(e) if canceled => {
                                log::warn!("Cancel of recording {} failed: {}", id, e)
                            }
                            Err(SessionError::NotRecording) if !self.state.is_capturing() => {}
                            Err(e) => pending.push_back(Event::AudioFailed {
                                id,
                                err: e.to_string(),
                            }),
                        }
                    }
                    Effect::ResetAudio => self.session.reset().await,
                    Effect::DeleteFile { wav_path } => remove_recording(&wav_path),
                }
            }
        }
    }

    // -----------------
    // Records and analysis
    // -----------------

    async fn delete_record(&mut self, id: i64) -> Result<(), CoordinatorError> {
        self.cancel_analysis(id);
        let record = store::run_blocking(&self.store, move |s| s.delete(id))
            .await?
            .ok_or(CoordinatorError::RecordNotFound(id))?;
        remove_recording(&record.file_path);
        Ok(())
    }

    async fn request_analysis(
        &mut self,
        id: i64,
        model: AnalysisModel,
    ) -> Result<bool, CoordinatorError> {
        if self.jobs.contains_key(&id) {
            log::debug!("Record {} already has an active job", id);
            return Ok(false);
        }
        // A canceled job may still be mid-request; never run two for one record.
        if let Some(previous) = self.retiring.remove(&id) {
            log::debug!("Waiting for canceled job {} to end", previous.job_id());
            previous.join().await;
        }

        let record = store::run_blocking(&self.store, move |s| s.get(id))
            .await?
            .ok_or(CoordinatorError::RecordNotFound(id))?;

        if !record.status.is_submittable() {
            log::debug!(
                "Record {} already analyzed ({:?}), ignoring request",
                id,
                record.status
            );
            return Ok(false);
        }

        let job = self.engine.submit(record, model);
        self.jobs.insert(id, job);
        self.publish();
        Ok(true)
    }

    fn cancel_analysis(&mut self, id: i64) -> bool {
        match self.jobs.remove(&id) {
            Some(job) => {
                job.cancel();
                log::info!("Analysis of record {} canceled", id);
                self.retiring.insert(id, job);
                self.publish();
                true
            }
            None => false,
        }
    }

    fn handle_report(&mut self, report: JobReport) {
        let is_retiring = self
            .retiring
            .get(&report.record_id)
            .is_some_and(|job| job.job_id() == report.job_id);
        if is_retiring {
            self.retiring.remove(&report.record_id);
            log::debug!(
                "Canceled job {} for record {} ended: {:?}",
                report.job_id,
                report.record_id,
                report.result
            );
            return;
        }

        let is_active = self
            .jobs
            .get(&report.record_id)
            .is_some_and(|job| job.job_id() == report.job_id);
        if !is_active {
            log::debug!(
                "Ignoring report from inactive job {} (record {})",
                report.job_id,
                report.record_id
            );
            return;
        }

        self.jobs.remove(&report.record_id);
        log::info!(
            "Analysis of record {} ended after {} attempt(s): {:?}",
            report.record_id,
            report.attempts,
            report.result
        );
        if let JobResult::Failed(message) = &report.result {
            log::error!("Analysis of record {} failed: {}", report.record_id, message);
            self.notice = Some(ANALYSIS_FAILED_NOTICE.to_string());
        }
        self.publish();
    }

    // -----------------
    // Playback
    // -----------------

    fn toggle_playback(&mut self, wav_path: PathBuf) -> Result<(), CoordinatorError> {
        let snapshot = self.player.snapshot();
        if snapshot.is_current(&wav_path) {
            self.player.set_playing(!snapshot.is_playing);
        } else {
            self.player.load(&wav_path)?;
            self.player.set_playing(true);
        }
        Ok(())
    }

    fn seek(&mut self, wav_path: PathBuf, position: Duration) -> Result<(), CoordinatorError> {
        if !self.player.snapshot().is_current(&wav_path) {
            self.player.load(&wav_path)?;
            self.player.set_playing(true);
        }
        self.player.seek(position);
        Ok(())
    }

    // -----------------
    // Lifecycle
    // -----------------

    async fn shutdown(&mut self) {
        for (id, job) in self.jobs.drain() {
            log::debug!("Canceling analysis of record {} for shutdown", id);
            job.cancel();
        }
        self.retiring.clear();
        self.dispatch(Event::Exit).await;
        self.session.reset().await;
        self.publish();
    }

    /// Recompute the view from the current inputs.
    fn publish(&self) {
        let records = self.records_rx.borrow().clone();
        let playback = self.playback_rx.borrow().clone();
        let active_jobs: HashMap<i64, AnalysisModel> = self
            .jobs
            .iter()
            .map(|(id, job)| (*id, job.model()))
            .collect();

        let view = merge_view(&ViewInputs {
            permission_granted: self.permission_granted,
            recorder: &self.state,
            playback: &playback,
            records: &records,
            active_jobs: &active_jobs,
            notice: self.notice.as_deref(),
        });

        self.view_tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }
}

//! Merged view
//!
//! `merge_view` is a pure function of its inputs. The coordinator calls it
//! again whenever any input changes and publishes the result as a whole.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::analysis::{AnalysisModel, RecordStatus};
use crate::playback::PlaybackSnapshot;
use crate::state_machine::State;
use crate::store::AudioRecord;

/// Recorder status as presented.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RecorderView {
    #[default]
    Idle,
    Recording {
        elapsed: Duration,
        amplitude: u16,
    },
    Recorded {
        wav_path: PathBuf,
        duration: Duration,
        suggested_name: String,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordView {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub file_name: String,
    pub file_path: PathBuf,
    pub status: RecordStatus,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewState {
    pub permission_granted: bool,
    pub recorder: RecorderView,
    pub playback: PlaybackSnapshot,
    pub records: Vec<RecordView>,
    /// One-shot message for the user, cleared on dismiss.
    pub notice: Option<String>,
}

impl ViewState {
    pub fn record(&self, id: i64) -> Option<&RecordView> {
        self.records.iter().find(|r| r.id == id)
    }
}

/// Current value of every input the view depends on.
pub struct ViewInputs<'a> {
    pub permission_granted: bool,
    pub recorder: &'a State,
    pub playback: &'a PlaybackSnapshot,
    pub records: &'a [AudioRecord],
    /// Model of the active job, by record id.
    pub active_jobs: &'a HashMap<i64, AnalysisModel>,
    pub notice: Option<&'a str>,
}

/// Convert the recorder state machine state to its presented form.
pub fn state_to_view(state: &State) -> RecorderView {
    match state {
        State::Idle => RecorderView::Idle,
        State::Arming { .. } => RecorderView::Recording {
            elapsed: Duration::ZERO,
            amplitude: 0,
        },
        State::Recording {
            elapsed, amplitude, ..
        } => RecorderView::Recording {
            elapsed: *elapsed,
            amplitude: *amplitude,
        },
        State::Stopping { elapsed, .. } => RecorderView::Recording {
            elapsed: *elapsed,
            amplitude: 0,
        },
        State::Recorded {
            wav_path,
            duration,
            suggested_name,
            ..
        } => RecorderView::Recorded {
            wav_path: wav_path.clone(),
            duration: *duration,
            suggested_name: suggested_name.clone(),
        },
        State::Error { message } => RecorderView::Error {
            message: message.clone(),
        },
    }
}

pub fn merge_view(inputs: &ViewInputs<'_>) -> ViewState {
    let records = inputs
        .records
        .iter()
        .map(|record| RecordView {
            id: record.id,
            created_at: record.created_at,
            duration_ms: record.duration_ms,
            file_name: record.file_name.clone(),
            file_path: record.file_path.clone(),
            status: RecordStatus::overlay(
                &record.status,
                inputs.active_jobs.get(&record.id).copied(),
            ),
        })
        .collect();

    ViewState {
        permission_granted: inputs.permission_granted,
        recorder: state_to_view(inputs.recorder),
        playback: inputs.playback.clone(),
        records,
        notice: inputs.notice.map(str::to_string),
    }
}

/// `mm:ss.d`
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    let minutes = (millis / 60_000) % 60;
    let seconds = (millis / 1000) % 60;
    let tenths = (millis % 1000) / 100;
    format!("{:02}:{:02}.{}", minutes, seconds, tenths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisOutcome;
    use uuid::Uuid;

    fn record(id: i64, status: AnalysisOutcome) -> AudioRecord {
        AudioRecord {
            id,
            created_at: Utc::now(),
            duration_ms: 3_000,
            file_name: format!("Voice {}", id),
            file_path: PathBuf::from(format!("/tmp/{}.wav", id)),
            status,
        }
    }

    #[test]
    fn active_job_overlays_processing() {
        let records = vec![
            record(1, AnalysisOutcome::NotProcessed),
            record(
                2,
                AnalysisOutcome::Healthy {
                    model: AnalysisModel::Model2,
                },
            ),
        ];
        let mut jobs = HashMap::new();
        jobs.insert(1, AnalysisModel::Model3);

        let view = merge_view(&ViewInputs {
            permission_granted: true,
            recorder: &State::Idle,
            playback: &PlaybackSnapshot::default(),
            records: &records,
            active_jobs: &jobs,
            notice: None,
        });

        assert_eq!(
            view.record(1).unwrap().status,
            RecordStatus::Processing(AnalysisModel::Model3)
        );
        assert_eq!(
            view.record(2).unwrap().status,
            RecordStatus::Healthy(AnalysisModel::Model2)
        );
        assert!(view.permission_granted);
    }

    #[test]
    fn recorder_states_map_to_view() {
        let id = Uuid::new_v4();
        let arming = State::Arming {
            recording_id: id,
            wav_path: PathBuf::from("/tmp/a.wav"),
        };
        assert_eq!(
            state_to_view(&arming),
            RecorderView::Recording {
                elapsed: Duration::ZERO,
                amplitude: 0
            }
        );

        let stopping = State::Stopping {
            recording_id: id,
            wav_path: PathBuf::from("/tmp/a.wav"),
            elapsed: Duration::from_secs(4),
        };
        assert!(matches!(
            state_to_view(&stopping),
            RecorderView::Recording { elapsed, .. } if elapsed == Duration::from_secs(4)
        ));
        assert_eq!(state_to_view(&State::Idle), RecorderView::Idle);
    }

    #[test]
    fn notice_is_copied() {
        let view = merge_view(&ViewInputs {
            permission_granted: false,
            recorder: &State::Idle,
            playback: &PlaybackSnapshot::default(),
            records: &[],
            active_jobs: &HashMap::new(),
            notice: Some("An error occurred, please try later."),
        });
        assert_eq!(
            view.notice.as_deref(),
            Some("An error occurred, please try later.")
        );
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(0)), "00:00.0");
        assert_eq!(format_duration(Duration::from_millis(2_345)), "00:02.3");
        assert_eq!(format_duration(Duration::from_millis(61_900)), "01:01.9");
    }
}

//! Recorder state machine for Pathology Detector
//!
//! This module implements the recorder workflow using a single-writer pattern.
//! All state transitions go through the `reduce()` function, which returns
//! a new state and a list of effects to execute.
//!
//! A state other than `Idle` means a file is associated with the workflow.
//! Events whose recording id does not match that file are stale and dropped.

use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Message shown when a take is canceled or too short to keep.
pub const RECORD_LONGER_MESSAGE: &str = "Please record a longer input!!";

pub const DEFAULT_MIN_RECORDING: Duration = Duration::from_millis(2000);

/// Rules applied when a recording finishes.
#[derive(Debug, Clone)]
pub struct RecorderPolicy {
    /// Recordings shorter than this are discarded.
    pub min_duration: Duration,
}

impl Default for RecorderPolicy {
    fn default() -> Self {
        Self {
            min_duration: DEFAULT_MIN_RECORDING,
        }
    }
}

/// Internal state of the recording workflow.
/// This is the authoritative state - all transitions go through the reducer.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum State {
    #[default]
    Idle,
    Arming {
        recording_id: Uuid,
        wav_path: PathBuf,
    },
    Recording {
        recording_id: Uuid,
        wav_path: PathBuf,
        elapsed: Duration,
        amplitude: u16,
    },
    Stopping {
        recording_id: Uuid,
        wav_path: PathBuf,
        elapsed: Duration,
    },
    /// Finished take waiting to be saved or discarded.
    Recorded {
        recording_id: Uuid,
        wav_path: PathBuf,
        duration: Duration,
        suggested_name: String,
    },
    Error {
        message: String,
    },
}

impl State {
    /// File associated with the workflow, if any.
    pub fn wav_path(&self) -> Option<&PathBuf> {
        match self {
            State::Arming { wav_path, .. }
            | State::Recording { wav_path, .. }
            | State::Stopping { wav_path, .. }
            | State::Recorded { wav_path, .. } => Some(wav_path),
            State::Idle | State::Error { .. } => None,
        }
    }

    /// True while the capture pipeline is starting, running or finalizing.
    pub fn is_capturing(&self) -> bool {
        matches!(
            self,
            State::Arming { .. } | State::Recording { .. } | State::Stopping { .. }
        )
    }
}

/// Events that can trigger state transitions.
/// These come from user commands and from the recording session.
#[derive(Debug, Clone)]
pub enum Event {
    /// User asked to record into `wav_path`
    Start {
        id: Uuid,
        wav_path: PathBuf,
    },
    /// User asked to stop and keep the take
    Stop,
    /// User canceled the take stored at `wav_path`
    Cancel {
        wav_path: PathBuf,
    },
    /// Take at `wav_path` was handed to the record store
    Saved {
        wav_path: PathBuf,
    },
    /// User dismissed an error
    Dismiss,
    /// Application exit requested
    Exit,

    // Session events
    AudioStarted {
        id: Uuid,
        wav_path: PathBuf,
    },
    AudioStartFailed {
        id: Uuid,
        err: String,
    },
    AudioProgress {
        id: Uuid,
        elapsed: Duration,
        amplitude: u16,
    },
    AudioStopped {
        id: Uuid,
        wav_path: PathBuf,
        duration: Duration,
    },
    AudioCanceled {
        id: Uuid,
    },
    AudioFailed {
        id: Uuid,
        err: String,
    },
}

/// Effects to be executed after a state transition.
/// The coordinator runs these against the recording session and filesystem.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    StartAudio { id: Uuid, wav_path: PathBuf },
    StopAudio { id: Uuid, canceled: bool },
    /// Return the session to Idle
    ResetAudio,
    DeleteFile { wav_path: PathBuf },
    /// Signal to recompute the view
    EmitUi,
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore events with stale recording IDs
/// - Always emit EmitUi after state changes
pub fn reduce(state: &State, event: Event, policy: &RecorderPolicy) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use State::*;

    // Helper: extract current recording_id (if any)
    let current_id: Option<Uuid> = match state {
        Idle | Error { .. } => None,
        Arming { recording_id, .. }
        | Recording { recording_id, .. }
        | Stopping { recording_id, .. }
        | Recorded { recording_id, .. } => Some(*recording_id),
    };

    // Helper: session events only count for the current recording
    let is_current = |eid: Uuid| current_id == Some(eid);

    match (state, event) {
        // -----------------
        // Start
        // -----------------
        (Idle | Error { .. }, Start { id, wav_path }) => (
            Arming {
                recording_id: id,
                wav_path: wav_path.clone(),
            },
            vec![StartAudio { id, wav_path }, EmitUi],
        ),
        // An unsaved take is discarded by a new recording
        (
            Recorded {
                wav_path: old_path, ..
            },
            Start { id, wav_path },
        ) => (
            Arming {
                recording_id: id,
                wav_path: wav_path.clone(),
            },
            vec![
                ResetAudio,
                DeleteFile {
                    wav_path: old_path.clone(),
                },
                StartAudio { id, wav_path },
                EmitUi,
            ],
        ),
        // Already capturing: a second start is a no-op
        (Arming { .. } | Recording { .. } | Stopping { .. }, Start { .. }) => {
            (state.clone(), vec![])
        }

        // -----------------
        // Arming
        // -----------------
        (Arming { recording_id, .. }, AudioStarted { id, wav_path }) if *recording_id == id => (
            Recording {
                recording_id: id,
                wav_path,
                elapsed: Duration::ZERO,
                amplitude: 0,
            },
            vec![EmitUi],
        ),
        (Arming { recording_id, .. }, AudioStartFailed { id, err }) if *recording_id == id => {
            (Error { message: err }, vec![ResetAudio, EmitUi])
        }
        (Arming { recording_id, .. }, Stop) => (
            state.clone(),
            vec![StopAudio {
                id: *recording_id,
                canceled: false,
            }],
        ),

        // -----------------
        // Recording
        // -----------------
        (
            Recording {
                recording_id,
                wav_path,
                ..
            },
            AudioProgress {
                id,
                elapsed,
                amplitude,
            },
        ) if *recording_id == id => (
            Recording {
                recording_id: id,
                wav_path: wav_path.clone(),
                elapsed,
                amplitude,
            },
            vec![EmitUi],
        ),
        (
            Recording {
                recording_id,
                wav_path,
                elapsed,
                ..
            },
            Stop,
        ) => (
            Stopping {
                recording_id: *recording_id,
                wav_path: wav_path.clone(),
                elapsed: *elapsed,
            },
            vec![
                StopAudio {
                    id: *recording_id,
                    canceled: false,
                },
                EmitUi,
            ],
        ),

        // -----------------
        // Cancel (dissociates the file when it matches)
        // -----------------
        (
            Arming {
                recording_id,
                wav_path: current,
            }
            | Recording {
                recording_id,
                wav_path: current,
                ..
            }
            | Stopping {
                recording_id,
                wav_path: current,
                ..
            },
            Cancel { wav_path },
        ) if *current == wav_path => (
            Idle,
            vec![
                StopAudio {
                    id: *recording_id,
                    canceled: true,
                },
                // A stop may already have finalized the file
                DeleteFile { wav_path },
                EmitUi,
            ],
        ),
        (
            Recorded {
                wav_path: current, ..
            },
            Cancel { wav_path },
        ) if *current == wav_path => (
            Idle,
            vec![ResetAudio, DeleteFile { wav_path }, EmitUi],
        ),

        // -----------------
        // Stopping
        // -----------------
        (
            Arming { recording_id, .. } | Recording { recording_id, .. } | Stopping { recording_id, .. },
            AudioStopped {
                id,
                wav_path,
                duration,
            },
        ) if *recording_id == id => {
            if duration < policy.min_duration {
                log::info!(
                    "Recording {} too short ({:?} < {:?}), discarding",
                    id,
                    duration,
                    policy.min_duration
                );
                (
                    Error {
                        message: RECORD_LONGER_MESSAGE.to_string(),
                    },
                    vec![DeleteFile { wav_path }, EmitUi],
                )
            } else {
                (
                    Recorded {
                        recording_id: id,
                        wav_path,
                        duration,
                        suggested_name: suggested_name(),
                    },
                    vec![EmitUi],
                )
            }
        }
        (
            Arming { recording_id, .. } | Recording { recording_id, .. } | Stopping { recording_id, .. },
            AudioCanceled { id },
        ) if *recording_id == id => (
            Error {
                message: RECORD_LONGER_MESSAGE.to_string(),
            },
            vec![EmitUi],
        ),
        (
            Arming { recording_id, .. } | Recording { recording_id, .. } | Stopping { recording_id, .. },
            AudioFailed { id, err },
        ) if *recording_id == id => (Error { message: err }, vec![EmitUi]),

        // -----------------
        // Saved
        // -----------------
        (_, Saved { wav_path }) => {
            if state.wav_path() == Some(&wav_path) {
                (Idle, vec![ResetAudio, EmitUi])
            } else if state.is_capturing() {
                // Saving an older take must not disturb the one in progress
                (state.clone(), vec![])
            } else {
                (state.clone(), vec![ResetAudio])
            }
        }

        // -----------------
        // Error
        // -----------------
        (Error { .. }, Dismiss) => (Idle, vec![EmitUi]),

        // -----------------
        // Exit
        // -----------------
        (Arming { recording_id, .. } | Recording { recording_id, .. } | Stopping { recording_id, .. }, Exit) => (
            Idle,
            vec![
                StopAudio {
                    id: *recording_id,
                    canceled: true,
                },
                EmitUi,
            ],
        ),
        (_, Exit) => (state.clone(), vec![]),

        // -----------------
        // Stale session events (drop silently)
        // -----------------
        (_, AudioStarted { id, .. }) if !is_current(id) => (state.clone(), vec![]),
        (_, AudioProgress { id, .. }) if !is_current(id) => (state.clone(), vec![]),
        (_, AudioStopped { id, .. }) if !is_current(id) => (state.clone(), vec![]),
        (_, AudioCanceled { id }) if !is_current(id) => (state.clone(), vec![]),
        (_, AudioFailed { id, .. }) if !is_current(id) => (state.clone(), vec![]),

        // -----------------
        // Unhandled: no transition
        // -----------------
        _ => (state.clone(), vec![]),
    }
}

/// Default display name for a new take.
fn suggested_name() -> String {
    format!("Voice {}", chrono::Utc::now().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RecorderPolicy {
        RecorderPolicy::default()
    }

    fn recording(id: Uuid) -> State {
        State::Recording {
            recording_id: id,
            wav_path: PathBuf::from("/tmp/take.wav"),
            elapsed: Duration::from_millis(300),
            amplitude: 0,
        }
    }

    #[test]
    fn idle_start_transitions_to_arming() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(
            &State::Idle,
            Event::Start {
                id,
                wav_path: PathBuf::from("/tmp/take.wav"),
            },
            &policy(),
        );
        assert!(matches!(next, State::Arming { recording_id, .. } if recording_id == id));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::StartAudio { .. })));
        assert!(effects.iter().any(|e| matches!(e, Effect::EmitUi)));
    }

    #[test]
    fn second_start_while_recording_is_noop() {
        let id = Uuid::new_v4();
        let state = recording(id);
        let (next, effects) = reduce(
            &state,
            Event::Start {
                id: Uuid::new_v4(),
                wav_path: PathBuf::from("/tmp/other.wav"),
            },
            &policy(),
        );
        assert_eq!(next, state);
        assert!(effects.is_empty());
    }

    #[test]
    fn progress_updates_elapsed() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(
            &recording(id),
            Event::AudioProgress {
                id,
                elapsed: Duration::from_millis(900),
                amplitude: 0,
            },
            &policy(),
        );
        assert!(matches!(
            next,
            State::Recording { elapsed, .. } if elapsed == Duration::from_millis(900)
        ));
        assert_eq!(effects, vec![Effect::EmitUi]);
    }

    #[test]
    fn stale_event_is_ignored() {
        let id = Uuid::new_v4();
        let state = recording(id);
        let (next, effects) = reduce(
            &state,
            Event::AudioStopped {
                id: Uuid::new_v4(),
                wav_path: PathBuf::from("/tmp/take.wav"),
                duration: Duration::from_secs(5),
            },
            &policy(),
        );
        assert_eq!(next, state);
        assert!(effects.is_empty());
    }

    #[test]
    fn late_event_after_cancel_is_ignored() {
        let id = Uuid::new_v4();
        let (next, _) = reduce(
            &recording(id),
            Event::Cancel {
                wav_path: PathBuf::from("/tmp/take.wav"),
            },
            &policy(),
        );
        assert_eq!(next, State::Idle);

        let (after, effects) = reduce(&next, Event::AudioCanceled { id }, &policy());
        assert_eq!(after, State::Idle);
        assert!(effects.is_empty());
    }

    // =========================================================================
    // Minimum duration policy
    // =========================================================================

    #[test]
    fn short_recording_becomes_error_and_deletes_file() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(
            &recording(id),
            Event::AudioStopped {
                id,
                wav_path: PathBuf::from("/tmp/take.wav"),
                duration: Duration::from_millis(1999),
            },
            &policy(),
        );
        assert_eq!(
            next,
            State::Error {
                message: RECORD_LONGER_MESSAGE.to_string()
            }
        );
        assert!(effects.contains(&Effect::DeleteFile {
            wav_path: PathBuf::from("/tmp/take.wav")
        }));
    }

    #[test]
    fn long_enough_recording_is_recorded() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(
            &recording(id),
            Event::AudioStopped {
                id,
                wav_path: PathBuf::from("/tmp/take.wav"),
                duration: Duration::from_millis(2000),
            },
            &policy(),
        );
        match next {
            State::Recorded {
                wav_path,
                duration,
                suggested_name,
                ..
            } => {
                assert_eq!(wav_path, PathBuf::from("/tmp/take.wav"));
                assert_eq!(duration, Duration::from_millis(2000));
                assert!(suggested_name.starts_with("Voice "));
            }
            other => panic!("expected Recorded, got {:?}", other),
        }
        assert!(!effects
            .iter()
            .any(|e| matches!(e, Effect::DeleteFile { .. })));
    }

    #[test]
    fn session_cancel_surfaces_record_longer_message() {
        let id = Uuid::new_v4();
        let (next, _) = reduce(&recording(id), Event::AudioCanceled { id }, &policy());
        assert!(matches!(next, State::Error { message } if message == RECORD_LONGER_MESSAGE));
    }

    // =========================================================================
    // Cancel / save semantics
    // =========================================================================

    #[test]
    fn cancel_during_recording_stops_audio_canceled() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(
            &recording(id),
            Event::Cancel {
                wav_path: PathBuf::from("/tmp/take.wav"),
            },
            &policy(),
        );
        assert_eq!(next, State::Idle);
        assert!(effects.contains(&Effect::StopAudio { id, canceled: true }));
    }

    #[test]
    fn cancel_while_stopping_deletes_finalized_file() {
        let id = Uuid::new_v4();
        let wav_path = PathBuf::from("/tmp/take.wav");
        let stopping = State::Stopping {
            recording_id: id,
            wav_path: wav_path.clone(),
            elapsed: Duration::from_millis(900),
        };

        let (next, effects) = reduce(
            &stopping,
            Event::Cancel {
                wav_path: wav_path.clone(),
            },
            &policy(),
        );
        assert_eq!(next, State::Idle);

        let stop = effects
            .iter()
            .position(|e| *e == Effect::StopAudio { id, canceled: true })
            .unwrap();
        let delete = effects
            .iter()
            .position(|e| *e == Effect::DeleteFile { wav_path: wav_path.clone() })
            .unwrap();
        assert!(stop < delete);

        // The Stopped event that was already queued arrives late and is dropped.
        let (after, effects) = reduce(
            &next,
            Event::AudioStopped {
                id,
                wav_path,
                duration: Duration::from_millis(900),
            },
            &policy(),
        );
        assert_eq!(after, State::Idle);
        assert!(effects.is_empty());
    }

    #[test]
    fn cancel_for_other_file_is_ignored() {
        let id = Uuid::new_v4();
        let state = recording(id);
        let (next, effects) = reduce(
            &state,
            Event::Cancel {
                wav_path: PathBuf::from("/tmp/elsewhere.wav"),
            },
            &policy(),
        );
        assert_eq!(next, state);
        assert!(effects.is_empty());
    }

    #[test]
    fn saving_recorded_take_returns_to_idle() {
        let state = State::Recorded {
            recording_id: Uuid::new_v4(),
            wav_path: PathBuf::from("/tmp/take.wav"),
            duration: Duration::from_secs(3),
            suggested_name: "Voice 1".to_string(),
        };
        let (next, effects) = reduce(
            &state,
            Event::Saved {
                wav_path: PathBuf::from("/tmp/take.wav"),
            },
            &policy(),
        );
        assert_eq!(next, State::Idle);
        assert!(effects.contains(&Effect::ResetAudio));
        assert!(!effects
            .iter()
            .any(|e| matches!(e, Effect::DeleteFile { .. })));
    }

    #[test]
    fn discarding_recorded_take_deletes_file() {
        let state = State::Recorded {
            recording_id: Uuid::new_v4(),
            wav_path: PathBuf::from("/tmp/take.wav"),
            duration: Duration::from_secs(3),
            suggested_name: "Voice 1".to_string(),
        };
        let (next, effects) = reduce(
            &state,
            Event::Cancel {
                wav_path: PathBuf::from("/tmp/take.wav"),
            },
            &policy(),
        );
        assert_eq!(next, State::Idle);
        assert!(effects.contains(&Effect::DeleteFile {
            wav_path: PathBuf::from("/tmp/take.wav")
        }));
    }

    #[test]
    fn error_dismiss_returns_to_idle() {
        let state = State::Error {
            message: "mic unplugged".to_string(),
        };
        let (next, effects) = reduce(&state, Event::Dismiss, &policy());
        assert_eq!(next, State::Idle);
        assert_eq!(effects, vec![Effect::EmitUi]);
    }

    #[test]
    fn exit_while_recording_cancels_capture() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(&recording(id), Event::Exit, &policy());
        assert_eq!(next, State::Idle);
        assert!(effects.contains(&Effect::StopAudio { id, canceled: true }));
    }
}

//! Fakes shared by the integration tests.
//!
//! These implement the crate's collaborator traits so the pipeline can be
//! exercised without a microphone or a classifier server.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pathology_detector::analysis::{AnalysisModel, Classifier, ClassifierReply, ClassifyError};
use pathology_detector::audio::{
    AudioError, AudioFrame, CaptureHandle, CaptureSource, ContainerWriter, PcmFormat,
};
use pathology_detector::store::{AudioRecord, NewRecord, RecordStore};

pub const FAKE_RATE: u32 = 8_000;

/// 10 ms of audio at 8 kHz.
pub const FRAME_SAMPLES: usize = 80;

// ============================================================================
// Capture
// ============================================================================

/// Counters shared between a `FakeMic` and the test.
#[derive(Default)]
pub struct MicStats {
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub frames: AtomicUsize,
    pub bytes: AtomicUsize,
}

/// Microphone that produces a 10 ms frame every 10 ms.
pub struct FakeMic {
    pub stats: Arc<MicStats>,
    /// Device stops after this many frames.
    pub fail_after: Option<usize>,
}

impl FakeMic {
    pub fn new() -> Self {
        Self {
            stats: Arc::new(MicStats::default()),
            fail_after: None,
        }
    }

    pub fn failing_after(frames: usize) -> Self {
        Self {
            stats: Arc::new(MicStats::default()),
            fail_after: Some(frames),
        }
    }
}

struct FakeHandle {
    stats: Arc<MicStats>,
    fail_after: Option<usize>,
    produced: usize,
    closed: bool,
}

impl CaptureSource for FakeMic {
    fn open(&self, _format: PcmFormat) -> Result<Box<dyn CaptureHandle>, AudioError> {
        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeHandle {
            stats: self.stats.clone(),
            fail_after: self.fail_after,
            produced: 0,
            closed: false,
        }))
    }
}

impl CaptureHandle for FakeHandle {
    fn format(&self) -> PcmFormat {
        PcmFormat::mono(FAKE_RATE)
    }

    fn read_frame(&mut self) -> Result<AudioFrame, AudioError> {
        if self.closed {
            return Err(AudioError::DeviceStopped("closed".to_string()));
        }
        std::thread::sleep(Duration::from_millis(10));
        if self.fail_after.is_some_and(|limit| self.produced >= limit) {
            return Err(AudioError::DeviceStopped("unplugged".to_string()));
        }

        self.produced += 1;
        let samples: Vec<i16> = (0..FRAME_SAMPLES)
            .map(|i| ((i as i32 * 400) % 8000 - 4000) as i16)
            .collect();
        let frame = AudioFrame::from_samples(&samples);
        self.stats.frames.fetch_add(1, Ordering::SeqCst);
        self.stats.bytes.fetch_add(frame.byte_len(), Ordering::SeqCst);
        Ok(frame)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.stats.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// ============================================================================
// Classifier
// ============================================================================

/// Classifier that plays back a script of replies, one per request.
/// Once the script is exhausted every request hangs until canceled.
pub struct ScriptedClassifier {
    script: Mutex<VecDeque<Result<ClassifierReply, ClassifyError>>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Counts a request as in flight until its future completes or is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedClassifier {
    pub fn new(script: Vec<Result<ClassifierReply, ClassifyError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// `n` transport failures followed by `last`.
    pub fn failing_then(n: usize, last: Result<ClassifierReply, ClassifyError>) -> Self {
        let mut script: Vec<_> = (0..n)
            .map(|i| Err(ClassifyError::Transport(format!("connection refused #{}", i))))
            .collect();
        script.push(last);
        Self::new(script)
    }

    /// Same transport failure forever.
    pub fn always_unreachable() -> Self {
        Self::new((0..10_000).map(|_| Err(ClassifyError::Transport("down".into()))).collect())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most requests ever outstanding at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(
        &self,
        _audio: &Path,
        _file_name: &str,
        _model: AnalysisModel,
    ) -> Result<ClassifierReply, ClassifyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(reply) => reply,
            None => std::future::pending().await,
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// Write a finalized take of `millis` of silence at 8 kHz.
pub fn write_take(dir: &Path, name: &str, millis: u64) -> PathBuf {
    let path = dir.join(format!("{}.wav", name));
    let mut writer = ContainerWriter::create(&path, PcmFormat::mono(FAKE_RATE)).unwrap();
    let frames = millis / 10;
    for _ in 0..frames {
        writer.write_frame(AudioFrame::silence(FRAME_SAMPLES)).unwrap();
    }
    writer.finalize(Duration::from_millis(millis)).unwrap();
    path
}

/// Insert a record backed by a real file and return it.
pub fn insert_take(store: &dyn RecordStore, dir: &Path, name: &str) -> AudioRecord {
    let path = write_take(dir, name, 2_500);
    let id = store
        .insert(NewRecord {
            created_at: chrono::Utc::now(),
            duration_ms: 2_500,
            file_name: name.to_string(),
            file_path: path,
        })
        .unwrap();
    store.get(id).unwrap().unwrap()
}

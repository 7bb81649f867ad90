//! Microphone capture source
//!
//! `CpalSource` opens the default input device through CPAL. A CPAL stream
//! cannot leave the thread that built it, so each open handle owns a
//! dedicated audio thread that keeps the stream alive and forwards converted
//! samples over a channel that holds one frame. The handle itself is `Send`
//! and can be driven from the recording session's capture thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfig};
use thiserror::Error;

use super::format::{downmix_to_mono, sample_to_i16, AudioFrame, PcmFormat};

/// At most one callback buffer waits for the reader; newer ones are dropped
/// and counted until it is taken.
const FRAME_BACKLOG: usize = 1;

/// How long `read_frame` waits for the device before declaring it stopped.
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors from the capture device and the container file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AudioError {
    #[error("Audio input device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("Audio input device stopped: {0}")]
    DeviceStopped(String),
    #[error("Audio file error: {0}")]
    Io(String),
    #[error("Audio container already finalized")]
    AlreadyFinalized,
    #[error("Failed to read audio metadata: {0}")]
    Probe(String),
}

/// A microphone that can be opened for one recording at a time.
pub trait CaptureSource: Send + Sync + 'static {
    /// Open the device, asking for `format`. The returned handle reports the
    /// format actually negotiated.
    fn open(&self, format: PcmFormat) -> Result<Box<dyn CaptureHandle>, AudioError>;
}

/// An open device producing PCM frames on demand.
pub trait CaptureHandle: Send {
    fn format(&self) -> PcmFormat;

    /// Block until the next frame is available.
    fn read_frame(&mut self) -> Result<AudioFrame, AudioError>;

    /// Release the device. Safe to call any number of times.
    fn close(&mut self);
}

/// Capture source backed by the host's default input device.
pub struct CpalSource {
    read_timeout: Duration,
}

impl CpalSource {
    pub fn new() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

impl Default for CpalSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSource for CpalSource {
    fn open(&self, format: PcmFormat) -> Result<Box<dyn CaptureHandle>, AudioError> {
        let (frame_tx, frame_rx) = mpsc::sync_channel::<Vec<i16>>(FRAME_BACKLOG);
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<PcmFormat, AudioError>>(1);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let dropped = Arc::new(AtomicU64::new(0));

        let thread_dropped = dropped.clone();
        let thread = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || run_device_thread(format, frame_tx, ready_tx, stop_rx, thread_dropped))
            .map_err(|e| AudioError::DeviceUnavailable(format!("spawn audio thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(negotiated)) => Ok(Box::new(CpalHandle {
                format: negotiated,
                frames: frame_rx,
                stop: Some(stop_tx),
                thread: Some(thread),
                dropped,
                read_timeout: self.read_timeout,
            })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AudioError::DeviceUnavailable(
                    "audio thread exited before the stream started".to_string(),
                ))
            }
        }
    }
}

/// Body of the dedicated audio thread: build and play the stream, then park
/// until the handle asks us to stop (or is dropped).
fn run_device_thread(
    requested: PcmFormat,
    frame_tx: SyncSender<Vec<i16>>,
    ready_tx: SyncSender<Result<PcmFormat, AudioError>>,
    stop_rx: Receiver<()>,
    dropped: Arc<AtomicU64>,
) {
    let stream = match start_stream(requested, frame_tx, dropped) {
        Ok((stream, negotiated)) => {
            let _ = ready_tx.send(Ok(negotiated));
            stream
        }
        Err(e) => {
            log::error!("Failed to open audio input: {}", e);
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    // Either an explicit stop or the sender being dropped ends the wait.
    let _ = stop_rx.recv();
    drop(stream);
    log::debug!("Audio thread released input stream");
}

fn start_stream(
    requested: PcmFormat,
    frame_tx: SyncSender<Vec<i16>>,
    dropped: Arc<AtomicU64>,
) -> Result<(Stream, PcmFormat), AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| AudioError::DeviceUnavailable("No audio input device found".to_string()))?;

    log::info!("Using audio input device: {:?}", device.name());

    let supported = choose_config(&device, requested.sample_rate)?;
    log::info!(
        "Audio config: {} Hz, {} channels, {:?}",
        supported.sample_rate().0,
        supported.channels(),
        supported.sample_format()
    );

    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let negotiated = PcmFormat::mono(config.sample_rate.0);

    let stream = match sample_format {
        SampleFormat::I16 => build_stream_typed::<i16>(&device, &config, frame_tx, dropped),
        SampleFormat::U16 => build_stream_typed::<u16>(&device, &config, frame_tx, dropped),
        SampleFormat::F32 => build_stream_typed::<f32>(&device, &config, frame_tx, dropped),
        other => Err(AudioError::DeviceUnavailable(format!(
            "Unsupported sample format {:?}",
            other
        ))),
    }?;

    stream
        .play()
        .map_err(|e| AudioError::DeviceUnavailable(format!("Failed to start stream: {}", e)))?;

    Ok((stream, negotiated))
}

/// Prefer a config that runs at the requested rate with the fewest channels,
/// falling back to the device default.
fn choose_config(device: &Device, sample_rate: u32) -> Result<SupportedStreamConfig, AudioError> {
    let exact = device.supported_input_configs().ok().and_then(|configs| {
        configs
            .filter(|c| {
                matches!(
                    c.sample_format(),
                    SampleFormat::I16 | SampleFormat::U16 | SampleFormat::F32
                )
            })
            .filter(|c| c.min_sample_rate().0 <= sample_rate && c.max_sample_rate().0 >= sample_rate)
            .min_by_key(|c| c.channels())
            .map(|c| c.with_sample_rate(cpal::SampleRate(sample_rate)))
    });

    match exact {
        Some(config) => Ok(config),
        None => {
            log::warn!(
                "Input device does not support {} Hz, using its default config",
                sample_rate
            );
            device
                .default_input_config()
                .map_err(|e| AudioError::DeviceUnavailable(format!("No supported config: {}", e)))
        }
    }
}

fn build_stream_typed<T>(
    device: &Device,
    config: &StreamConfig,
    frame_tx: SyncSender<Vec<i16>>,
    dropped: Arc<AtomicU64>,
) -> Result<Stream, AudioError>
where
    T: cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let channels = config.channels as usize;
    let err_fn = |err| log::error!("Audio stream error: {}", err);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let samples: Vec<i16> = data.iter().map(|&s| sample_to_i16(s)).collect();
                forward_frame(&frame_tx, downmix_to_mono(&samples, channels), &dropped);
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::DeviceUnavailable(format!("Failed to create audio stream: {}", e)))
}

/// Hand one callback buffer to the reader, dropping it when the reader has
/// not taken the previous one yet.
fn forward_frame(frame_tx: &SyncSender<Vec<i16>>, samples: Vec<i16>, dropped: &AtomicU64) {
    match frame_tx.try_send(samples) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            dropped.fetch_add(1, Ordering::Relaxed);
        }
        // Handle closed; the stream is about to be dropped.
        Err(TrySendError::Disconnected(_)) => {}
    }
}

/// Open CPAL input. Dropping the handle releases the device.
struct CpalHandle {
    format: PcmFormat,
    frames: Receiver<Vec<i16>>,
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
    dropped: Arc<AtomicU64>,
    read_timeout: Duration,
}

impl CaptureHandle for CpalHandle {
    fn format(&self) -> PcmFormat {
        self.format
    }

    fn read_frame(&mut self) -> Result<AudioFrame, AudioError> {
        if self.stop.is_none() {
            return Err(AudioError::DeviceStopped("handle closed".to_string()));
        }
        match self.frames.recv_timeout(self.read_timeout) {
            Ok(samples) => Ok(AudioFrame::from_samples(&samples)),
            Err(RecvTimeoutError::Timeout) => Err(AudioError::DeviceStopped(format!(
                "no audio received for {:?}",
                self.read_timeout
            ))),
            Err(RecvTimeoutError::Disconnected) => {
                Err(AudioError::DeviceStopped("input stream ended".to_string()))
            }
        }
    }

    fn close(&mut self) {
        let Some(stop) = self.stop.take() else {
            return;
        };
        let _ = stop.send(());

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("Audio thread panicked while releasing the device");
            }
        }

        let dropped = self.dropped.load(Ordering::Relaxed);
        if dropped > 0 {
            log::warn!("Capture backlog overflowed, {} buffers dropped", dropped);
        }
        log::debug!("Audio input released");
    }
}

impl Drop for CpalHandle {
    fn drop(&mut self) {
        self.close();
    }
}

//! PCM frame and container header types
//!
//! Every recording is mono, 16-bit signed little-endian PCM. The container
//! is a canonical 44-byte RIFF/WAVE header followed by the raw payload.

use std::time::Duration;

use super::AudioError;

/// Size of the container header that precedes the payload.
pub const HEADER_LEN: usize = 44;

/// Sample rate requested from the capture device unless configured otherwise.
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

const BITS_PER_SAMPLE: u16 = 16;
const BYTES_PER_SAMPLE: u16 = BITS_PER_SAMPLE / 8;
const FMT_CHUNK_LEN: u32 = 16;
const PCM_FORMAT_TAG: u16 = 1;

/// Fixed PCM layout shared by the capture source and the container writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmFormat {
    /// Mono 16-bit at the given sample rate.
    pub fn mono(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
        }
    }

    pub fn bits_per_sample(&self) -> u16 {
        BITS_PER_SAMPLE
    }

    pub fn block_align(&self) -> u16 {
        self.channels * BYTES_PER_SAMPLE
    }

    pub fn byte_rate(&self) -> u32 {
        self.sample_rate * self.block_align() as u32
    }

    /// Playback duration of `bytes` payload bytes in this format.
    pub fn duration_of(&self, bytes: u64) -> Duration {
        let byte_rate = self.byte_rate() as u64;
        if byte_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(bytes * 1000 / byte_rate)
    }
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self::mono(DEFAULT_SAMPLE_RATE)
    }
}

/// One chunk of captured audio, already converted to mono i16 LE bytes.
///
/// Frames are moved into the writer, so each one is consumed exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    bytes: Vec<u8>,
}

impl AudioFrame {
    pub fn from_samples(samples: &[i16]) -> Self {
        let mut bytes = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE as usize);
        for sample in samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        Self { bytes }
    }

    /// A frame of `samples` zero-valued samples.
    pub fn silence(samples: usize) -> Self {
        Self {
            bytes: vec![0; samples * BYTES_PER_SAMPLE as usize],
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn sample_count(&self) -> usize {
        self.bytes.len() / BYTES_PER_SAMPLE as usize
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// The 44-byte metadata block at the start of every container file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    pub channels: u16,
    pub sample_rate: u32,
    pub byte_rate: u32,
    pub block_align: u16,
    pub bits_per_sample: u16,
    pub payload_len: u32,
}

impl ContainerHeader {
    /// Header describing `payload_len` bytes of `format` audio.
    ///
    /// Fails when the payload cannot be described by the 32-bit size fields.
    pub fn new(format: PcmFormat, payload_len: u64) -> Result<Self, AudioError> {
        let max_payload = (u32::MAX - (HEADER_LEN as u32 - 8)) as u64;
        if payload_len > max_payload {
            return Err(AudioError::Io(format!(
                "payload of {} bytes exceeds container limit of {} bytes",
                payload_len, max_payload
            )));
        }

        Ok(Self {
            channels: format.channels,
            sample_rate: format.sample_rate,
            byte_rate: format.byte_rate(),
            block_align: format.block_align(),
            bits_per_sample: format.bits_per_sample(),
            payload_len: payload_len as u32,
        })
    }

    /// Header written before any payload exists.
    pub fn placeholder(format: PcmFormat) -> Self {
        Self {
            channels: format.channels,
            sample_rate: format.sample_rate,
            byte_rate: format.byte_rate(),
            block_align: format.block_align(),
            bits_per_sample: format.bits_per_sample(),
            payload_len: 0,
        }
    }

    /// Serialize in RIFF field order:
    ///
    /// ```text
    /// [0-3]    "RIFF"
    /// [4-7]    total size - 8
    /// [8-11]   "WAVE"
    /// [12-15]  "fmt "
    /// [16-19]  16
    /// [20-21]  1 (PCM)
    /// [22-23]  channels
    /// [24-27]  sample rate
    /// [28-31]  byte rate
    /// [32-33]  block align
    /// [34-35]  bits per sample
    /// [36-39]  "data"
    /// [40-43]  payload size
    /// ```
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let riff_len = (HEADER_LEN as u32 - 8) + self.payload_len;
        let mut header = [0u8; HEADER_LEN];

        header[0..4].copy_from_slice(b"RIFF");
        header[4..8].copy_from_slice(&riff_len.to_le_bytes());
        header[8..12].copy_from_slice(b"WAVE");

        header[12..16].copy_from_slice(b"fmt ");
        header[16..20].copy_from_slice(&FMT_CHUNK_LEN.to_le_bytes());
        header[20..22].copy_from_slice(&PCM_FORMAT_TAG.to_le_bytes());
        header[22..24].copy_from_slice(&self.channels.to_le_bytes());
        header[24..28].copy_from_slice(&self.sample_rate.to_le_bytes());
        header[28..32].copy_from_slice(&self.byte_rate.to_le_bytes());
        header[32..34].copy_from_slice(&self.block_align.to_le_bytes());
        header[34..36].copy_from_slice(&self.bits_per_sample.to_le_bytes());

        header[36..40].copy_from_slice(b"data");
        header[40..44].copy_from_slice(&self.payload_len.to_le_bytes());

        header
    }
}

/// Convert any cpal sample type to i16.
pub(crate) fn sample_to_i16<T>(sample: T) -> i16
where
    T: cpal::Sample,
    f32: cpal::FromSample<T>,
{
    let f32_sample: f32 = sample.to_sample::<f32>();
    let clamped = f32_sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}

/// Average interleaved channels down to one.
pub(crate) fn downmix_to_mono(samples: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u16_at(header: &[u8], offset: usize) -> u16 {
        u16::from_le_bytes([header[offset], header[offset + 1]])
    }

    fn u32_at(header: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes([
            header[offset],
            header[offset + 1],
            header[offset + 2],
            header[offset + 3],
        ])
    }

    #[test]
    fn header_layout_matches_riff_pcm() {
        let header = ContainerHeader::new(PcmFormat::mono(48_000), 9600)
            .unwrap()
            .encode();

        assert_eq!(&header[0..4], b"RIFF");
        assert_eq!(u32_at(&header, 4), 36 + 9600);
        assert_eq!(&header[8..12], b"WAVE");
        assert_eq!(&header[12..16], b"fmt ");
        assert_eq!(u32_at(&header, 16), 16);
        assert_eq!(u16_at(&header, 20), 1);
        assert_eq!(u16_at(&header, 22), 1);
        assert_eq!(u32_at(&header, 24), 48_000);
        assert_eq!(u32_at(&header, 28), 96_000);
        assert_eq!(u16_at(&header, 32), 2);
        assert_eq!(u16_at(&header, 34), 16);
        assert_eq!(&header[36..40], b"data");
        assert_eq!(u32_at(&header, 40), 9600);
    }

    #[test]
    fn placeholder_has_zero_payload() {
        let header = ContainerHeader::placeholder(PcmFormat::default()).encode();
        assert_eq!(u32_at(&header, 40), 0);
        assert_eq!(u32_at(&header, 4), 36);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let result = ContainerHeader::new(PcmFormat::default(), u32::MAX as u64);
        assert!(matches!(result, Err(AudioError::Io(_))));
    }

    #[test]
    fn frame_bytes_are_little_endian() {
        let frame = AudioFrame::from_samples(&[1, -2]);
        assert_eq!(frame.as_bytes(), &[0x01, 0x00, 0xFE, 0xFF]);
        assert_eq!(frame.sample_count(), 2);
        assert_eq!(frame.byte_len(), 4);
    }

    #[test]
    fn duration_uses_byte_rate() {
        let format = PcmFormat::mono(16_000);
        assert_eq!(format.duration_of(32_000), Duration::from_secs(1));
        assert_eq!(format.duration_of(16_000), Duration::from_millis(500));
    }

    #[test]
    fn test_sample_to_i16() {
        assert_eq!(sample_to_i16(0.0f32), 0);
        assert_eq!(sample_to_i16(1.0f32), i16::MAX);
        assert_eq!(sample_to_i16(-1.0f32), -i16::MAX);

        assert_eq!(sample_to_i16(2.0f32), i16::MAX);
        assert_eq!(sample_to_i16(-2.0f32), -i16::MAX);
    }

    #[test]
    fn downmix_averages_channel_pairs() {
        assert_eq!(downmix_to_mono(&[100, 300, -50, 50], 2), vec![200, 0]);
        assert_eq!(downmix_to_mono(&[1, 2, 3], 1), vec![1, 2, 3]);
    }
}

//! Decode & resample pipeline
//!
//! Turns an arbitrary encoded byte stream into interleaved 16-bit stereo PCM
//! at the engine sample rate, stored in an `AlignedBuffer`.
//!
//! ```text
//! bytes → probe → decoder ─┬─ (s16 stereo @ target) ────────────→ PcmWriter
//!                          └─ f32 → stereo → rubato sinc → s16 → PcmWriter
//! ```
//!
//! The destination starts at an estimated capacity and doubles whenever a
//! chunk would overflow, so the result is byte-identical no matter how good
//! the estimate was.

mod convert;
mod writer;

use std::io::Cursor;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL, CODEC_TYPE_PCM_S16LE};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;

use crate::buffer::{AlignedBuffer, BufferError};
use crate::types::WaveFormat;

use convert::ConvertStage;
pub use writer::PcmWriter;

/// Errors from the decode pipeline
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("No audio track found")]
    NoAudioTrack,

    #[error("Unknown sample rate")]
    UnknownSampleRate,

    #[error("Failed to create decoder: {0}")]
    DecoderInit(String),

    #[error("Resampler error: {0}")]
    Resampler(String),

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

impl DecodeError {
    /// Allocation failures are not retried or degraded to silence
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DecodeError::Buffer(BufferError::AllocationFailed { .. })
        )
    }
}

/// Format of the decoded source stream before conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceFormat {
    pub sample_rate: u32,
    pub channels: usize,
    pub bits_per_sample: u32,
}

/// Initial destination capacity in bytes
///
/// `input_len × (target rate / source rate) × (target frame size / source frame size)`,
/// rounded up to whole target frames.
pub fn estimate_capacity(input_len: usize, source: &SourceFormat, target: &WaveFormat) -> usize {
    let source_frame = source.channels.max(1) * (source.bits_per_sample.max(8) as usize / 8);
    let rate_ratio = target.sample_rate as f64 / source.sample_rate.max(1) as f64;
    let size_ratio = target.block_align() as f64 / source_frame as f64;
    let estimate = (input_len as f64 * rate_ratio * size_ratio).ceil() as usize;
    let align = target.block_align().max(1);
    estimate.div_ceil(align) * align
}

/// Decode `bytes` to 16-bit stereo PCM at `target.sample_rate`
///
/// `hint` is a file extension used to speed up probing.
pub fn decode(
    bytes: Vec<u8>,
    target: WaveFormat,
    hint: Option<&str>,
) -> Result<AlignedBuffer, DecodeError> {
    decode_with_capacity(bytes, target, hint, None)
}

/// Like [`decode`], starting the destination at `initial_capacity` bytes
/// instead of the estimate
pub fn decode_with_capacity(
    bytes: Vec<u8>,
    target: WaveFormat,
    hint: Option<&str>,
    initial_capacity: Option<usize>,
) -> Result<AlignedBuffer, DecodeError> {
    let input_len = bytes.len();
    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());

    let mut probe_hint = Hint::new();
    if let Some(ext) = hint {
        probe_hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&probe_hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| DecodeError::UnsupportedFormat(e.to_string()))?;

    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(DecodeError::NoAudioTrack)?;

    let track_id = track.id;
    let params = track.codec_params.clone();

    let source = SourceFormat {
        sample_rate: params.sample_rate.ok_or(DecodeError::UnknownSampleRate)?,
        channels: params.channels.map(|c| c.count()).unwrap_or(2),
        bits_per_sample: params.bits_per_sample.unwrap_or(16),
    };

    let mut decoder = symphonia::default::get_codecs()
        .make(&params, &DecoderOptions::default())
        .map_err(|e| DecodeError::DecoderInit(e.to_string()))?;

    let capacity =
        initial_capacity.unwrap_or_else(|| estimate_capacity(input_len, &source, &target));
    let mut writer = PcmWriter::with_capacity(capacity)?;

    let passthrough = params.codec == CODEC_TYPE_PCM_S16LE
        && source.channels == target.channels as usize
        && source.sample_rate == target.sample_rate;

    let mut stage = if passthrough {
        None
    } else {
        Some(ConvertStage::new(source.channels, source.sample_rate, target.sample_rate)?)
    };

    let mut pcm_buf: Option<SampleBuffer<i16>> = None;
    let mut float_buf: Option<SampleBuffer<f32>> = None;
    let mut buf_frames = 0u64;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => {
                log::warn!("Error reading packet: {}", e);
                break;
            }
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                log::warn!("Skipping corrupt packet: {}", e);
                continue;
            }
            Err(e) => {
                log::warn!("Error decoding packet: {}", e);
                break;
            }
        };

        // (Re)size the sample buffers when a packet is larger than any before
        let frames = decoded.capacity() as u64;
        if frames > buf_frames {
            let spec = *decoded.spec();
            pcm_buf = passthrough.then(|| SampleBuffer::new(frames, spec));
            float_buf = (!passthrough).then(|| SampleBuffer::new(frames, spec));
            buf_frames = frames;
        }

        match (stage.as_mut(), pcm_buf.as_mut(), float_buf.as_mut()) {
            (None, Some(buf), _) => {
                buf.copy_interleaved_ref(decoded);
                writer.write_samples(buf.samples())?;
            }
            (Some(stage), _, Some(buf)) => {
                buf.copy_interleaved_ref(decoded);
                stage.push(buf.samples(), &mut writer)?;
            }
            _ => {}
        }
    }

    if let Some(stage) = stage {
        stage.finish(&mut writer)?;
    }

    writer.finish()
}

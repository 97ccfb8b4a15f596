//! Common types for Keysound
//!
//! Fundamental audio types shared by the decode cache, the DSP stages and the
//! mixer: the PCM wave format stored in the cache, the `f32` stereo frame used
//! on the mixing path, and a few lock-free helpers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Default engine sample rate (48kHz)
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

/// The engine always mixes interleaved stereo
pub const ENGINE_CHANNELS: u16 = 2;

/// Largest callback buffer the renderer pre-allocates for, in frames.
/// Covers every common host configuration (64 .. 4096).
pub const MAX_BUFFER_FRAMES: usize = 8192;

/// Scale for converting 16-bit PCM to `f32` in [-1, 1)
pub const PCM16_SCALE: f32 = 1.0 / 32768.0;

/// Audio sample type on the mixing path
pub type Sample = f32;

/// PCM wave format of decoded, cached audio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaveFormat {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of interleaved channels
    pub channels: u16,
    /// Bits per sample (always 16 after decode)
    pub bits_per_sample: u16,
}

impl WaveFormat {
    /// 16-bit PCM with the given rate and channel count
    pub const fn pcm16(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample: 16,
        }
    }

    /// 16-bit stereo PCM, the cache storage format
    pub const fn stereo16(sample_rate: u32) -> Self {
        Self::pcm16(sample_rate, ENGINE_CHANNELS)
    }

    /// Bytes per sample frame (channels * bits_per_sample / 8)
    #[inline]
    pub fn block_align(&self) -> usize {
        self.channels as usize * (self.bits_per_sample as usize / 8)
    }

    /// Bytes consumed by one second of audio
    #[inline]
    pub fn average_bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.block_align()
    }

    /// Number of whole frames held by `byte_len` bytes
    pub fn frames_in(&self, byte_len: usize) -> usize {
        match self.block_align() {
            0 => 0,
            align => byte_len / align,
        }
    }

    /// Playback duration of `byte_len` bytes
    pub fn duration_of(&self, byte_len: usize) -> Duration {
        match self.average_bytes_per_second() {
            0 => Duration::ZERO,
            rate => Duration::from_secs_f64(byte_len as f64 / rate as f64),
        }
    }
}

impl Default for WaveFormat {
    fn default() -> Self {
        Self::stereo16(DEFAULT_SAMPLE_RATE)
    }
}

/// A single stereo frame (left and right channels)
///
/// `#[repr(C)]` keeps the layout `[left, right]`, so an interleaved `&mut [f32]`
/// callback buffer can be viewed as `&mut [StereoSample]` without copying.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct StereoSample {
    pub left: Sample,
    pub right: Sample,
}

impl StereoSample {
    #[inline]
    pub fn new(left: Sample, right: Sample) -> Self {
        Self { left, right }
    }

    #[inline]
    pub fn silence() -> Self {
        Self::default()
    }

    /// Peak amplitude (max of abs(left), abs(right))
    #[inline]
    pub fn peak(&self) -> Sample {
        self.left.abs().max(self.right.abs())
    }
}

impl std::ops::Mul<Sample> for StereoSample {
    type Output = Self;

    #[inline]
    fn mul(self, factor: Sample) -> Self {
        Self {
            left: self.left * factor,
            right: self.right * factor,
        }
    }
}

/// View an interleaved buffer as stereo frames
///
/// A trailing odd sample (malformed host buffer) is left out of the view.
#[inline]
pub fn frames_mut(interleaved: &mut [Sample]) -> &mut [StereoSample] {
    let even = interleaved.len() & !1;
    bytemuck::cast_slice_mut(&mut interleaved[..even])
}

/// `f32` stored in an `AtomicU32` for lock-free parameter sharing
#[derive(Debug)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    #[inline]
    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

impl Default for AtomicF32 {
    fn default() -> Self {
        Self::new(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wave_format_math() {
        let format = WaveFormat::stereo16(44100);
        assert_eq!(format.block_align(), 4);
        assert_eq!(format.average_bytes_per_second(), 176_400);
        assert_eq!(format.frames_in(176_400), 44100);

        let duration = format.duration_of(176_400);
        assert!((duration.as_secs_f64() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_frames_view_skips_odd_tail() {
        let mut interleaved = [1.0, 2.0, 3.0, 4.0, 5.0];
        let frames = frames_mut(&mut interleaved);

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1], StereoSample::new(3.0, 4.0));

        frames[0].left = 9.0;
        assert_eq!(interleaved[0], 9.0);
    }

    #[test]
    fn test_atomic_f32() {
        let value = AtomicF32::new(0.25);
        assert_eq!(value.load(), 0.25);
        value.store(-1.5);
        assert_eq!(value.load(), -1.5);
    }
}

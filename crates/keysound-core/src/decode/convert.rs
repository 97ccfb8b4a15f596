//! Float conversion stage: channel mapping and sample rate conversion
//!
//! Used whenever the decoded stream is not already 16-bit stereo at the target
//! rate. Samples arrive interleaved as `f32`, are mapped to planar stereo
//! (mono duplicated, extra channels dropped), optionally resampled and written
//! back out as interleaved 16-bit PCM.

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use super::writer::PcmWriter;
use super::DecodeError;

/// Input frames per resampler call
const RESAMPLER_CHUNK: usize = 1024;

/// Upper bound on flush calls after the input ended (guards against a
/// resampler that never reaches the expected length)
const MAX_FLUSH_CALLS: usize = 16;

/// Convert a float sample to 16-bit PCM (inverse of symphonia's `i16 → f32`)
#[inline]
fn to_pcm16(sample: f32) -> i16 {
    (sample * 32768.0).round().clamp(-32768.0, 32767.0) as i16
}

/// Output side of the stage: latency trimming and PCM writing
struct PcmOutput {
    /// Interleaved PCM scratch for the writer
    scratch: Vec<i16>,
    /// Leading resampler output frames still to discard
    delay_remaining: usize,
    frames: u64,
}

impl PcmOutput {
    /// Skip resampler latency, cap at `limit` frames and write interleaved PCM
    fn emit(
        &mut self,
        limit: Option<u64>,
        left: &[f32],
        right: &[f32],
        writer: &mut PcmWriter,
    ) -> Result<(), DecodeError> {
        let available = left.len().min(right.len());
        let skip = self.delay_remaining.min(available);
        self.delay_remaining -= skip;

        let mut take = available - skip;
        if let Some(limit) = limit {
            take = take.min(limit.saturating_sub(self.frames) as usize);
        }
        if take == 0 {
            return Ok(());
        }

        self.scratch.clear();
        for (&l, &r) in left[skip..skip + take].iter().zip(&right[skip..skip + take]) {
            self.scratch.push(to_pcm16(l));
            self.scratch.push(to_pcm16(r));
        }
        self.frames += take as u64;
        writer.write_samples(&self.scratch)
    }
}

pub(super) struct ConvertStage {
    source_channels: usize,
    resampler: Option<SincFixedIn<f32>>,
    /// Planar stereo frames waiting for a full resampler chunk
    pending: [Vec<f32>; 2],
    out: PcmOutput,
    ratio: f64,
    input_frames: u64,
}

impl ConvertStage {
    pub(super) fn new(
        source_channels: usize,
        source_rate: u32,
        target_rate: u32,
    ) -> Result<Self, DecodeError> {
        let ratio = target_rate as f64 / source_rate as f64;

        let resampler = if source_rate != target_rate {
            let params = SincInterpolationParameters {
                sinc_len: 256,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 256,
                window: WindowFunction::BlackmanHarris2,
            };
            let resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, RESAMPLER_CHUNK, 2)
                .map_err(|e| DecodeError::Resampler(e.to_string()))?;
            Some(resampler)
        } else {
            None
        };

        let delay_remaining = resampler.as_ref().map_or(0, |r| r.output_delay());

        Ok(Self {
            source_channels: source_channels.max(1),
            resampler,
            pending: [
                Vec::with_capacity(RESAMPLER_CHUNK * 2),
                Vec::with_capacity(RESAMPLER_CHUNK * 2),
            ],
            out: PcmOutput {
                scratch: Vec::with_capacity(RESAMPLER_CHUNK * 4),
                delay_remaining,
                frames: 0,
            },
            ratio,
            input_frames: 0,
        })
    }

    /// Feed one decoded chunk of interleaved float samples
    pub(super) fn push(
        &mut self,
        interleaved: &[f32],
        writer: &mut PcmWriter,
    ) -> Result<(), DecodeError> {
        for frame in interleaved.chunks_exact(self.source_channels) {
            let left = frame[0];
            let right = frame.get(1).copied().unwrap_or(left);
            self.pending[0].push(left);
            self.pending[1].push(right);
        }
        self.input_frames += (interleaved.len() / self.source_channels) as u64;

        let Some(resampler) = self.resampler.as_mut() else {
            let [left, right] = &self.pending;
            self.out.emit(None, left, right, writer)?;
            self.pending[0].clear();
            self.pending[1].clear();
            return Ok(());
        };

        while self.pending[0].len() >= resampler.input_frames_next() {
            let needed = resampler.input_frames_next();
            let output = resampler
                .process(&[&self.pending[0][..needed], &self.pending[1][..needed]], None)
                .map_err(|e| DecodeError::Resampler(e.to_string()))?;
            self.pending[0].drain(..needed);
            self.pending[1].drain(..needed);
            self.out.emit(None, &output[0], &output[1], writer)?;
        }
        Ok(())
    }

    /// Flush the resampler tail so the output holds `round(input × ratio)` frames
    pub(super) fn finish(mut self, writer: &mut PcmWriter) -> Result<(), DecodeError> {
        let Some(mut resampler) = self.resampler.take() else {
            return Ok(());
        };
        let expected = (self.input_frames as f64 * self.ratio).round() as u64;

        if !self.pending[0].is_empty() {
            let tail: [&[f32]; 2] = [&self.pending[0], &self.pending[1]];
            let output = resampler
                .process_partial(Some(&tail[..]), None)
                .map_err(|e| DecodeError::Resampler(e.to_string()))?;
            self.out.emit(Some(expected), &output[0], &output[1], writer)?;
        }

        let mut flushes = 0;
        while self.out.frames < expected && flushes < MAX_FLUSH_CALLS {
            let output = resampler
                .process_partial::<Vec<f32>>(None, None)
                .map_err(|e| DecodeError::Resampler(e.to_string()))?;
            self.out.emit(Some(expected), &output[0], &output[1], writer)?;
            flushes += 1;
        }

        if self.out.frames < expected {
            log::warn!(
                "Resampler flush produced {} of {} expected frames",
                self.out.frames,
                expected
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm16_conversion_is_symmetric() {
        for value in [-32768i16, -1, 0, 1, 12345, 32767] {
            assert_eq!(to_pcm16(value as f32 / 32768.0), value);
        }
        assert_eq!(to_pcm16(2.0), 32767);
        assert_eq!(to_pcm16(-2.0), -32768);
    }

    #[test]
    fn test_mono_is_duplicated_without_resampling() {
        let mut stage = ConvertStage::new(1, 48000, 48000).unwrap();
        let mut writer = PcmWriter::with_capacity(0).unwrap();

        stage.push(&[0.5, -0.25], &mut writer).unwrap();
        stage.finish(&mut writer).unwrap();

        let buffer = writer.finish().unwrap();
        assert_eq!(buffer.as_samples(), &[16384, 16384, -8192, -8192]);
    }

    #[test]
    fn test_surround_keeps_front_pair() {
        let mut stage = ConvertStage::new(6, 44100, 44100).unwrap();
        let mut writer = PcmWriter::with_capacity(0).unwrap();

        stage
            .push(&[0.5, -0.5, 0.9, 0.9, 0.9, 0.9], &mut writer)
            .unwrap();
        stage.finish(&mut writer).unwrap();

        let buffer = writer.finish().unwrap();
        assert_eq!(buffer.as_samples(), &[16384, -16384]);
    }
}

//! In-memory WAV fixtures for tests

use std::io::Cursor;

/// Encode a 16-bit PCM WAV in memory; `sample(frame, channel)` supplies values
pub fn wav_bytes(
    sample_rate: u32,
    channels: u16,
    frames: usize,
    sample: impl Fn(usize, u16) -> i16,
) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut bytes = Vec::new();
    {
        let mut writer = hound::WavWriter::new(Cursor::new(&mut bytes), spec).unwrap();
        for frame in 0..frames {
            for ch in 0..channels {
                writer.write_sample(sample(frame, ch)).unwrap();
            }
        }
        writer.finalize().unwrap();
    }
    bytes
}

/// Sine tone WAV with the same signal on every channel
pub fn sine_wav(
    sample_rate: u32,
    channels: u16,
    frames: usize,
    freq: f32,
    amplitude: f32,
) -> Vec<u8> {
    wav_bytes(sample_rate, channels, frames, |frame, _| {
        let phase = 2.0 * std::f32::consts::PI * freq * frame as f32 / sample_rate as f32;
        (phase.sin() * amplitude * 32767.0) as i16
    })
}

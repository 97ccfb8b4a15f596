//! Canonical empty asset payload
//!
//! A minimal RIFF/WAVE file: 16-bit stereo PCM at 44.1kHz holding eight
//! frames of silence. Decoded once per cache at the engine format and handed
//! out whenever a keysound fails to load.

/// Key under which the empty asset is reported in logs
pub const EMPTY_ASSET_KEY: &str = "<empty>";

#[rustfmt::skip]
pub const EMPTY_WAV: &[u8] = &[
    // RIFF header, chunk size 68
    b'R', b'I', b'F', b'F', 0x44, 0x00, 0x00, 0x00, b'W', b'A', b'V', b'E',
    // fmt chunk: PCM, 2 channels, 44100 Hz, 176400 B/s, block align 4, 16 bits
    b'f', b'm', b't', b' ', 0x10, 0x00, 0x00, 0x00,
    0x01, 0x00, 0x02, 0x00, 0x44, 0xAC, 0x00, 0x00,
    0x10, 0xB1, 0x02, 0x00, 0x04, 0x00, 0x10, 0x00,
    // data chunk: 32 bytes of silence
    b'd', b'a', b't', b'a', 0x20, 0x00, 0x00, 0x00,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_wav_is_valid() {
        let reader = hound::WavReader::new(std::io::Cursor::new(EMPTY_WAV)).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 2);
        assert_eq!(spec.sample_rate, 44100);
        assert_eq!(spec.bits_per_sample, 16);
        assert_eq!(reader.duration(), 8);
    }
}

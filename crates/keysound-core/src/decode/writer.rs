//! Growable PCM destination
//!
//! Writes land in an `AlignedBuffer` whose capacity doubles (repeatedly, until
//! the chunk fits) when a write would overflow. `finish` shrinks the buffer to
//! the bytes actually written.

use crate::buffer::AlignedBuffer;

use super::DecodeError;

/// Capacity used when the estimate is smaller
const MIN_CAPACITY: usize = 4096;

pub struct PcmWriter {
    buffer: AlignedBuffer,
    written: usize,
}

impl PcmWriter {
    pub fn with_capacity(capacity: usize) -> Result<Self, DecodeError> {
        Ok(Self {
            buffer: AlignedBuffer::allocate(capacity)?,
            written: 0,
        })
    }

    /// Bytes written so far
    pub fn written(&self) -> usize {
        self.written
    }

    /// Current capacity in bytes
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn write_samples(&mut self, samples: &[i16]) -> Result<(), DecodeError> {
        let bytes: &[u8] = bytemuck::cast_slice(samples);
        let needed = self.written + bytes.len();

        if needed > self.buffer.len() {
            let mut capacity = self.buffer.len().max(MIN_CAPACITY);
            while capacity < needed {
                capacity *= 2;
            }
            self.buffer.resize(capacity)?;
        }

        self.buffer.as_bytes_mut()[self.written..needed].copy_from_slice(bytes);
        self.written = needed;
        Ok(())
    }

    /// Shrink to the written length and hand over the buffer
    pub fn finish(mut self) -> Result<AlignedBuffer, DecodeError> {
        self.buffer.resize(self.written)?;
        Ok(self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_growth_doubles_until_fit() {
        let mut writer = PcmWriter::with_capacity(8).unwrap();
        writer.write_samples(&[1; 4]).unwrap();
        assert_eq!(writer.capacity(), 8);

        // 8 + 10000 bytes: 4096 → 8192 → 16384
        writer.write_samples(&[2; 5000]).unwrap();
        assert_eq!(writer.capacity(), 16384);
        assert_eq!(writer.written(), 10008);

        let buffer = writer.finish().unwrap();
        assert_eq!(buffer.len(), 10008);
        assert_eq!(&buffer.as_samples()[..5], &[1, 1, 1, 1, 2]);
    }
}

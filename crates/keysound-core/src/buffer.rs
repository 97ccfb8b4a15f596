//! Aligned, resizable raw memory for decoded audio
//!
//! Decoded PCM lives outside the regular `Vec` machinery so the decode step can
//! grow it geometrically, seal it into an asset, and hand raw pointers to
//! consumers that expect a stable, 64-byte aligned block (AVX-512 loads and
//! cache-line boundaries).
//!
//! # Ownership
//!
//! An `AlignedBuffer` is the single owner of its block. It is never aliased by
//! another buffer, and the block is released exactly once: `free()` is
//! idempotent and `Drop` calls it.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use thiserror::Error;

/// Alignment of every audio block, in bytes
pub const BUFFER_ALIGNMENT: usize = 64;

/// Errors from raw buffer management
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("Failed to allocate {size} bytes of audio memory")]
    AllocationFailed { size: usize },

    #[error("Invalid audio buffer size: {size} bytes")]
    InvalidLayout { size: usize },

    #[error("Audio buffer was already freed")]
    Freed,
}

/// Owned, 64-byte aligned raw memory block
pub struct AlignedBuffer {
    /// `None` for zero-length buffers (no block held)
    ptr: Option<NonNull<u8>>,
    len: usize,
    freed: bool,
}

// The buffer exclusively owns its block; shared references only read it.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// An empty buffer holding no block
    pub const fn new() -> Self {
        Self {
            ptr: None,
            len: 0,
            freed: false,
        }
    }

    /// Allocate a zeroed block of `len` bytes
    pub fn allocate(len: usize) -> Result<Self, BufferError> {
        let mut buffer = Self::new();
        buffer.resize(len)?;
        Ok(buffer)
    }

    fn layout(len: usize) -> Result<Layout, BufferError> {
        Layout::from_size_align(len, BUFFER_ALIGNMENT)
            .map_err(|_| BufferError::InvalidLayout { size: len })
    }

    /// Resize to `new_len` bytes
    ///
    /// Bytes up to `min(old, new)` are preserved and newly exposed bytes are
    /// zeroed. The block may move: pointers obtained before the call are
    /// invalid afterwards.
    pub fn resize(&mut self, new_len: usize) -> Result<(), BufferError> {
        if self.freed {
            return Err(BufferError::Freed);
        }
        if new_len == self.len {
            return Ok(());
        }

        match self.ptr {
            None => {
                let layout = Self::layout(new_len)?;
                // SAFETY: new_len != len == 0, so the layout is non-zero sized.
                let raw = unsafe { alloc::alloc_zeroed(layout) };
                let ptr = NonNull::new(raw)
                    .ok_or(BufferError::AllocationFailed { size: new_len })?;
                self.ptr = Some(ptr);
            }
            Some(ptr) if new_len == 0 => {
                // SAFETY: ptr was allocated with the layout for self.len.
                unsafe { alloc::dealloc(ptr.as_ptr(), Self::layout(self.len)?) };
                self.ptr = None;
            }
            Some(ptr) => {
                // Validate the new size before handing it to realloc
                Self::layout(new_len)?;
                let old_layout = Self::layout(self.len)?;
                // SAFETY: ptr came from this allocator with old_layout and
                // new_len is non-zero and fits the alignment (checked above).
                let raw = unsafe { alloc::realloc(ptr.as_ptr(), old_layout, new_len) };
                let ptr =
                    NonNull::new(raw).ok_or(BufferError::AllocationFailed { size: new_len })?;
                if new_len > self.len {
                    // SAFETY: the range [len, new_len) lies inside the new block.
                    unsafe {
                        std::ptr::write_bytes(ptr.as_ptr().add(self.len), 0, new_len - self.len)
                    };
                }
                self.ptr = Some(ptr);
            }
        }

        self.len = new_len;
        Ok(())
    }

    /// Release the block. Calling this again is a no-op.
    pub fn free(&mut self) {
        if let Some(ptr) = self.ptr.take() {
            if let Ok(layout) = Self::layout(self.len) {
                // SAFETY: ptr was allocated with exactly this layout.
                unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
            }
        }
        self.len = 0;
        self.freed = true;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_freed(&self) -> bool {
        self.freed
    }

    /// Raw pointer to the block (null when no block is held)
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.map_or(std::ptr::null(), |p| p.as_ptr() as *const u8)
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.map_or(std::ptr::null_mut(), |p| p.as_ptr())
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self.ptr {
            // SAFETY: the block is `len` initialized (zeroed or written) bytes.
            Some(ptr) => unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.len) },
            None => &[],
        }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        match self.ptr {
            // SAFETY: as above, and &mut self guarantees exclusive access.
            Some(ptr) => unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.len) },
            None => &mut [],
        }
    }

    /// The block as native-endian 16-bit samples (a trailing odd byte is ignored)
    pub fn as_samples(&self) -> &[i16] {
        match self.ptr {
            Some(_) => bytemuck::cast_slice(&self.as_bytes()[..self.len & !1]),
            None => &[],
        }
    }
}

impl Default for AlignedBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        self.free();
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("len", &self.len)
            .field("freed", &self.freed)
            .finish()
    }
}

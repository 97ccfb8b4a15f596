//! Cached audio assets with reader-counted access
//!
//! A `CachedAsset` wraps one decoded `AlignedBuffer`. Once published it is
//! immutable; the only state change is the irreversible transition to
//! "disposed", which frees the buffer.
//!
//! # Access protocol
//!
//! Readers (voices on the audio thread) never lock. They bump one of two reader
//! counters through an RAII guard:
//!
//! ```text
//! acquire:  disposing? → fail
//!           counter += 1
//!           disposing? → counter -= 1, fail      (lost the race with dispose)
//! release:  counter -= 1                          (guard drop)
//! dispose:  disposing = true
//!           spin until both counters == 0
//!           free buffer
//! ```
//!
//! Both the flag and the counters use `SeqCst`, so either the reader sees the
//! flag or the disposer sees the incremented counter.
//!
//! # Deadlock freedom
//!
//! A thread that holds a guard and then disposes would spin forever. The same
//! goes for the audio thread, which must never wait. Both cases are caught by
//! thread-local accounting and `dispose()` returns an error instead.

use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::buffer::AlignedBuffer;
use crate::types::WaveFormat;

/// Busy-wait iterations before `dispose` starts yielding the thread
const SPIN_BUDGET: u32 = 1 << 12;

thread_local! {
    /// Number of guards currently held by this thread (all assets)
    static HELD_GUARDS: Cell<usize> = const { Cell::new(0) };
    /// Set while this thread runs the audio callback
    static REALTIME: Cell<bool> = const { Cell::new(false) };
}

/// Errors returned when disposal is refused
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AssetError {
    #[error("Refusing to dispose asset {hash} on the real-time audio thread")]
    RealtimeThread { hash: String },

    #[error("Refusing to dispose asset {hash}: this thread still holds {held} acquisition(s)")]
    HeldByCurrentThread { hash: String, held: usize },
}

/// Marks the current thread as real-time until dropped
///
/// Created by the audio renderer at the top of every callback.
pub struct RealtimeScope {
    previous: bool,
    _not_send: PhantomData<*const ()>,
}

impl RealtimeScope {
    pub fn enter() -> Self {
        let previous = REALTIME.with(|rt| rt.replace(true));
        Self {
            previous,
            _not_send: PhantomData,
        }
    }
}

impl Drop for RealtimeScope {
    fn drop(&mut self) {
        REALTIME.with(|rt| rt.set(self.previous));
    }
}

/// Whether the current thread is inside a real-time callback
pub fn is_realtime_thread() -> bool {
    REALTIME.with(|rt| rt.get())
}

/// Immutable decoded audio shared between the cache and voices
pub struct CachedAsset {
    hash: String,
    format: WaveFormat,
    byte_len: usize,
    created_at: Instant,
    buffer: UnsafeCell<AlignedBuffer>,
    pointer_readers: AtomicUsize,
    span_readers: AtomicUsize,
    disposing: AtomicBool,
    disposed: AtomicBool,
}

// The buffer is only mutated by `dispose`, after every reader has left and no
// new reader can enter.
unsafe impl Sync for CachedAsset {}

impl CachedAsset {
    /// Seal a decoded buffer into an asset
    pub fn new(hash: impl Into<String>, format: WaveFormat, buffer: AlignedBuffer) -> Self {
        Self {
            hash: hash.into(),
            format,
            byte_len: buffer.len(),
            created_at: Instant::now(),
            buffer: UnsafeCell::new(buffer),
            pointer_readers: AtomicUsize::new(0),
            span_readers: AtomicUsize::new(0),
            disposing: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    /// Lowercase hex BLAKE3 hash of the source bytes
    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn format(&self) -> WaveFormat {
        self.format
    }

    /// Decoded size in bytes (unchanged by disposal)
    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    pub fn frame_count(&self) -> usize {
        self.format.frames_in(self.byte_len)
    }

    pub fn duration(&self) -> Duration {
        self.format.duration_of(self.byte_len)
    }

    /// When the decode finished
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Current number of outstanding acquisitions (pointer + samples)
    pub fn reader_count(&self) -> usize {
        self.pointer_readers.load(Ordering::SeqCst) + self.span_readers.load(Ordering::SeqCst)
    }

    fn try_enter(&self, counter: &AtomicUsize) -> bool {
        if self.disposing.load(Ordering::SeqCst) {
            return false;
        }
        counter.fetch_add(1, Ordering::SeqCst);
        if self.disposing.load(Ordering::SeqCst) {
            counter.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        HELD_GUARDS.with(|held| held.set(held.get() + 1));
        true
    }

    fn leave(&self, counter: &AtomicUsize) {
        counter.fetch_sub(1, Ordering::SeqCst);
        HELD_GUARDS.with(|held| held.set(held.get().saturating_sub(1)));
    }

    /// Acquire raw pointer access to the PCM bytes
    ///
    /// Returns `None` once disposal has started.
    pub fn try_acquire_pointer(&self) -> Option<PointerGuard<'_>> {
        if !self.try_enter(&self.pointer_readers) {
            return None;
        }
        // SAFETY: the reader count is held, so dispose cannot free the buffer.
        let buffer = unsafe { &*self.buffer.get() };
        Some(PointerGuard {
            asset: self,
            ptr: buffer.as_ptr(),
            len: buffer.len(),
        })
    }

    /// Acquire bounds-checked access to the interleaved 16-bit samples
    ///
    /// Returns `None` once disposal has started.
    pub fn try_acquire_samples(&self) -> Option<SamplesGuard<'_>> {
        if !self.try_enter(&self.span_readers) {
            return None;
        }
        // SAFETY: as in try_acquire_pointer.
        let buffer = unsafe { &*self.buffer.get() };
        Some(SamplesGuard {
            asset: self,
            samples: buffer.as_samples(),
            _not_send: PhantomData,
        })
    }

    /// Free the PCM buffer once every reader has left
    ///
    /// Blocks (spinning, then yielding) while acquisitions are outstanding.
    /// Refuses on the real-time thread and on a thread that still holds a
    /// guard. Disposing twice is a no-op.
    pub fn dispose(&self) -> Result<(), AssetError> {
        if is_realtime_thread() {
            return Err(AssetError::RealtimeThread {
                hash: self.hash.clone(),
            });
        }
        let held = HELD_GUARDS.with(|held| held.get());
        if held > 0 {
            return Err(AssetError::HeldByCurrentThread {
                hash: self.hash.clone(),
                held,
            });
        }

        if self.disposing.swap(true, Ordering::SeqCst) {
            // Another thread is disposing; wait for it to finish
            let mut spins = 0;
            while !self.disposed.load(Ordering::Acquire) {
                backoff(&mut spins);
            }
            return Ok(());
        }

        let mut spins = 0;
        while self.pointer_readers.load(Ordering::SeqCst) != 0
            || self.span_readers.load(Ordering::SeqCst) != 0
        {
            backoff(&mut spins);
        }

        // SAFETY: disposing is set and both counters are zero, so no reader
        // holds a reference into the buffer and none can acquire a new one.
        unsafe { (*self.buffer.get()).free() };
        self.disposed.store(true, Ordering::Release);
        log::debug!("Disposed asset {} ({} bytes)", self.hash, self.byte_len);
        Ok(())
    }
}

#[inline]
fn backoff(spins: &mut u32) {
    if *spins < SPIN_BUDGET {
        *spins += 1;
        std::hint::spin_loop();
    } else {
        std::thread::yield_now();
    }
}

impl std::fmt::Debug for CachedAsset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedAsset")
            .field("hash", &self.hash)
            .field("format", &self.format)
            .field("byte_len", &self.byte_len)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Raw pointer acquisition; released on drop
pub struct PointerGuard<'a> {
    asset: &'a CachedAsset,
    ptr: *const u8,
    len: usize,
}

impl PointerGuard<'_> {
    /// Start of the PCM block (null for an empty asset)
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// Length of the block in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for PointerGuard<'_> {
    fn drop(&mut self) {
        self.asset.leave(&self.asset.pointer_readers);
    }
}

/// Sample slice acquisition; released on drop
pub struct SamplesGuard<'a> {
    asset: &'a CachedAsset,
    samples: &'a [i16],
    // Guard accounting is per thread
    _not_send: PhantomData<*const ()>,
}

impl Deref for SamplesGuard<'_> {
    type Target = [i16];

    fn deref(&self) -> &[i16] {
        self.samples
    }
}

impl Drop for SamplesGuard<'_> {
    fn drop(&mut self) {
        self.asset.leave(&self.asset.span_readers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{mpsc, Arc};
    use std::thread;

    fn make_asset(samples: &[i16]) -> CachedAsset {
        let bytes: &[u8] = bytemuck::cast_slice(samples);
        let mut buffer = AlignedBuffer::allocate(bytes.len()).unwrap();
        buffer.as_bytes_mut().copy_from_slice(bytes);
        CachedAsset::new("abc123", WaveFormat::stereo16(48000), buffer)
    }

    #[test]
    fn test_acquire_and_release() {
        let asset = make_asset(&[1, 2, 3, 4]);
        {
            let samples = asset.try_acquire_samples().unwrap();
            let pointer = asset.try_acquire_pointer().unwrap();
            assert_eq!(&*samples, &[1, 2, 3, 4]);
            assert_eq!(pointer.len(), 8);
            assert_eq!(asset.reader_count(), 2);
        }
        assert_eq!(asset.reader_count(), 0);
        assert_eq!(asset.frame_count(), 2);
    }

    #[test]
    fn test_acquisition_fails_after_dispose() {
        let asset = make_asset(&[0; 8]);
        asset.dispose().unwrap();

        assert!(asset.is_disposed());
        assert!(asset.try_acquire_samples().is_none());
        assert!(asset.try_acquire_pointer().is_none());
        assert_eq!(asset.reader_count(), 0);

        // Second dispose is a no-op
        asset.dispose().unwrap();
    }

    #[test]
    fn test_dispose_waits_for_reader_on_other_thread() {
        let asset = Arc::new(make_asset(&[7; 64]));
        let (acquired_tx, acquired_rx) = mpsc::channel();

        let reader = {
            let asset = Arc::clone(&asset);
            thread::spawn(move || {
                let samples = asset.try_acquire_samples().unwrap();
                acquired_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
                // Still readable: dispose must be waiting on us
                assert!(samples.iter().all(|&s| s == 7));
            })
        };

        acquired_rx.recv().unwrap();
        let start = Instant::now();
        asset.dispose().unwrap();
        assert!(
            start.elapsed() >= Duration::from_millis(30),
            "dispose returned after {:?} while a span was held",
            start.elapsed()
        );

        reader.join().unwrap();
        assert!(asset.try_acquire_samples().is_none());
    }

    #[test]
    fn test_dispose_refused_while_holding() {
        let asset = make_asset(&[0; 4]);
        let guard = asset.try_acquire_samples().unwrap();

        match asset.dispose() {
            Err(AssetError::HeldByCurrentThread { held, .. }) => assert_eq!(held, 1),
            other => panic!("expected HeldByCurrentThread, got {:?}", other),
        }
        assert!(!asset.is_disposed());

        drop(guard);
        asset.dispose().unwrap();
    }

    #[test]
    fn test_dispose_refused_on_realtime_thread() {
        let asset = make_asset(&[0; 4]);
        {
            let _rt = RealtimeScope::enter();
            assert!(is_realtime_thread());
            assert!(matches!(
                asset.dispose(),
                Err(AssetError::RealtimeThread { .. })
            ));
        }
        assert!(!is_realtime_thread());
        asset.dispose().unwrap();
    }
}

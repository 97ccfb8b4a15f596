//! Summing mixer with lock-free topology changes
//!
//! The audio thread owns a [`MixingGraph`] and pulls audio from it. Any other
//! thread changes the set of voices through a cloneable [`MixerHandle`]:
//!
//! ```text
//! MixerHandle (any thread)            MixingGraph (audio thread)
//!   try_add(voice) ──► to_add  ─┐
//!   remove(id)     ──► to_remove├──► drained at the top of read()
//!   clear()        ──► flag    ─┘
//!   pop_retired()  ◄── retired ◄──── exhausted / removed voices
//! ```
//!
//! All queues are bounded `crossbeam::queue::ArrayQueue`s allocated up front,
//! so neither side allocates or blocks. Retired voices are handed back to a
//! background thread for recycling instead of being dropped in the callback:
//! `try_add` refuses once the voices not yet taken back through `pop_retired`
//! would exceed the retired queue's capacity, so retiring never overflows.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;

use super::voice::VoiceId;
use crate::dsp::simd::{self, SimdLevel};

/// Something the mixer can pull interleaved stereo audio from
pub trait MixerInput: Send {
    fn id(&self) -> VoiceId;

    /// Fill `out` and return the number of samples written
    ///
    /// Writing fewer samples than requested marks the input as exhausted.
    fn read(&mut self, out: &mut [f32]) -> usize;
}

impl<T: MixerInput + ?Sized> MixerInput for Box<T> {
    fn id(&self) -> VoiceId {
        (**self).id()
    }

    fn read(&mut self, out: &mut [f32]) -> usize {
        (**self).read(out)
    }
}

struct MixerShared<I> {
    to_add: ArrayQueue<I>,
    to_remove: ArrayQueue<VoiceId>,
    retired: ArrayQueue<I>,
    clear_requested: AtomicBool,
    active: AtomicUsize,
    pending: AtomicUsize,
    /// Added and not yet popped from `retired`; bounded by its capacity
    unreclaimed: AtomicUsize,
    max_voices: usize,
}

/// Control-side handle to a [`MixingGraph`]
pub struct MixerHandle<I> {
    shared: Arc<MixerShared<I>>,
}

impl<I> Clone for MixerHandle<I> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<I: MixerInput> MixerHandle<I> {
    /// Queue `input` for the next callback
    ///
    /// Refused (input handed back) when active plus pending voices already
    /// reach the cap, or when retired voices are not being reclaimed.
    pub fn try_add(&self, input: I) -> Result<(), I> {
        let shared = &self.shared;
        let unreclaimed = shared.unreclaimed.fetch_add(1, Ordering::AcqRel) + 1;
        if unreclaimed > shared.retired.capacity() {
            shared.unreclaimed.fetch_sub(1, Ordering::AcqRel);
            return Err(input);
        }
        let pending = shared.pending.fetch_add(1, Ordering::AcqRel) + 1;
        if shared.active.load(Ordering::Acquire) + pending > shared.max_voices {
            shared.pending.fetch_sub(1, Ordering::AcqRel);
            shared.unreclaimed.fetch_sub(1, Ordering::AcqRel);
            return Err(input);
        }
        shared.to_add.push(input).map_err(|input| {
            shared.pending.fetch_sub(1, Ordering::AcqRel);
            shared.unreclaimed.fetch_sub(1, Ordering::AcqRel);
            input
        })
    }

    /// Queue removal of voice `id`; returns false if the queue is full
    pub fn remove(&self, id: VoiceId) -> bool {
        self.shared.to_remove.push(id).is_ok()
    }

    /// Drop every active and pending voice at the next callback
    pub fn clear(&self) {
        self.shared.clear_requested.store(true, Ordering::Release);
    }

    /// Voices playing as of the last callback
    pub fn active_count(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Voices queued but not yet picked up
    pub fn pending_count(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    pub fn max_voices(&self) -> usize {
        self.shared.max_voices
    }

    /// Take one voice the graph no longer uses
    pub fn pop_retired(&self) -> Option<I> {
        let voice = self.shared.retired.pop()?;
        self.shared.unreclaimed.fetch_sub(1, Ordering::AcqRel);
        Some(voice)
    }

    /// Take every voice retired so far
    pub fn drain_retired(&self) -> impl Iterator<Item = I> + '_ {
        std::iter::from_fn(move || self.pop_retired())
    }

    /// Voices added and not yet taken back with [`pop_retired`](Self::pop_retired)
    pub fn unreclaimed_count(&self) -> usize {
        self.shared.unreclaimed.load(Ordering::Acquire)
    }
}

/// Audio-thread side of the mixer
pub struct MixingGraph<I> {
    shared: Arc<MixerShared<I>>,
    voices: Vec<I>,
    scratch: Vec<f32>,
    /// Removals whose voice was still in `to_add` when they arrived
    orphan_removals: Vec<VoiceId>,
    read_fully: bool,
    simd: SimdLevel,
}

impl<I: MixerInput> MixingGraph<I> {
    /// Create a graph for up to `max_voices` voices and callback buffers of
    /// up to `max_samples` interleaved samples
    pub fn new(max_voices: usize, max_samples: usize, read_fully: bool) -> (Self, MixerHandle<I>) {
        let max_voices = max_voices.max(1);
        let shared = Arc::new(MixerShared {
            to_add: ArrayQueue::new(max_voices),
            to_remove: ArrayQueue::new(max_voices * 2),
            retired: ArrayQueue::new(max_voices * 2),
            clear_requested: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            unreclaimed: AtomicUsize::new(0),
            max_voices,
        });

        let graph = Self {
            shared: Arc::clone(&shared),
            voices: Vec::with_capacity(max_voices),
            scratch: vec![0.0; max_samples.max(2)],
            orphan_removals: Vec::with_capacity(max_voices * 2),
            read_fully,
            simd: simd::detect(),
        };
        (graph, MixerHandle { shared })
    }

    pub fn active_voices(&self) -> usize {
        self.voices.len()
    }

    /// Mix all voices into `out` (overwritten)
    ///
    /// Returns `out.len()` with `read_fully`, otherwise the most samples any
    /// voice produced.
    pub fn read(&mut self, out: &mut [f32]) -> usize {
        self.apply_topology_changes();

        let mut produced = 0;
        let block = self.scratch.len();
        let mut offset = 0;
        while offset < out.len() {
            let end = (offset + block).min(out.len());
            let n = self.mix_block(&mut out[offset..end]);
            produced = offset + n;
            offset = end;
            if self.voices.is_empty() {
                out[offset..].fill(0.0);
                break;
            }
        }

        self.shared.active.store(self.voices.len(), Ordering::Release);

        if self.read_fully {
            out.len()
        } else {
            produced
        }
    }

    fn apply_topology_changes(&mut self) {
        let shared = Arc::clone(&self.shared);

        if shared.clear_requested.swap(false, Ordering::AcqRel) {
            while let Some(voice) = self.voices.pop() {
                self.retire(voice);
            }
            while let Some(voice) = shared.to_add.pop() {
                shared.pending.fetch_sub(1, Ordering::AcqRel);
                self.retire(voice);
            }
            while shared.to_remove.pop().is_some() {}
            shared.active.store(0, Ordering::Release);
        }

        self.orphan_removals.clear();
        while let Some(id) = shared.to_remove.pop() {
            match self.voices.iter().position(|v| v.id() == id) {
                Some(index) => {
                    let voice = self.voices.swap_remove(index);
                    self.retire(voice);
                }
                None => {
                    if self.orphan_removals.len() < self.orphan_removals.capacity() {
                        self.orphan_removals.push(id);
                    }
                }
            }
        }

        while let Some(voice) = shared.to_add.pop() {
            shared.pending.fetch_sub(1, Ordering::AcqRel);
            let orphaned = self.orphan_removals.contains(&voice.id());
            if orphaned || self.voices.len() >= shared.max_voices {
                self.retire(voice);
            } else {
                self.voices.push(voice);
            }
        }
    }

    fn mix_block(&mut self, out: &mut [f32]) -> usize {
        out.fill(0.0);
        let len = out.len();
        let mut max_produced = 0;

        let mut i = 0;
        while i < self.voices.len() {
            let scratch = &mut self.scratch[..len];
            let n = self.voices[i].read(scratch).min(len);
            simd::add_into(self.simd, &mut out[..n], &scratch[..n]);
            max_produced = max_produced.max(n);

            if n < len {
                let voice = self.voices.swap_remove(i);
                self.retire(voice);
            } else {
                i += 1;
            }
        }

        max_produced
    }

    fn retire(&self, voice: I) {
        // Cannot fail: try_add keeps unreclaimed voices within capacity
        let pushed = self.shared.retired.push(voice).is_ok();
        debug_assert!(pushed, "retired queue overflow");
    }
}

//! Voice recycling
//!
//! Triggers arrive at hundreds per second; allocating a voice (and its balance
//! state) for each would churn the allocator. The pool keeps disarmed voices
//! in a lock-free queue and re-arms them on demand. Voices the mixer retires
//! come back through [`VoicePool::reclaim`], called off the audio thread.

use std::sync::atomic::{AtomicUsize, Ordering};

use basedrop::Shared;
use crossbeam::queue::ArrayQueue;

use super::mixer::MixerHandle;
use super::voice::{Voice, VoiceParams};
use crate::asset::CachedAsset;
use crate::config::BalanceConfig;

pub struct VoicePool {
    free: ArrayQueue<Box<Voice>>,
    balance: BalanceConfig,
    sample_rate: u32,
    /// Voices created because the pool was empty
    overflow_allocations: AtomicUsize,
}

impl VoicePool {
    /// Pool holding up to `capacity` idle voices, pre-filled
    pub fn new(capacity: usize, balance: &BalanceConfig, sample_rate: u32) -> Self {
        let capacity = capacity.max(1);
        let free = ArrayQueue::new(capacity);
        for _ in 0..capacity {
            let _ = free.push(Box::new(Voice::new(balance, sample_rate)));
        }
        Self {
            free,
            balance: balance.clone(),
            sample_rate,
            overflow_allocations: AtomicUsize::new(0),
        }
    }

    /// Take an idle voice (or allocate one) armed with `asset`
    pub fn acquire(&self, asset: Shared<CachedAsset>, params: VoiceParams) -> Box<Voice> {
        let mut voice = self.free.pop().unwrap_or_else(|| {
            self.overflow_allocations.fetch_add(1, Ordering::Relaxed);
            Box::new(Voice::new(&self.balance, self.sample_rate))
        });
        voice.arm(asset, params);
        voice
    }

    /// Disarm `voice` and keep it for reuse (dropped if the pool is full)
    pub fn release(&self, mut voice: Box<Voice>) {
        voice.disarm();
        let _ = self.free.push(voice);
    }

    /// Move every voice the mixer retired back into the pool
    pub fn reclaim(&self, mixer: &MixerHandle<Box<Voice>>) -> usize {
        let mut count = 0;
        for voice in mixer.drain_retired() {
            self.release(voice);
            count += 1;
        }
        count
    }

    /// Idle voices ready for reuse
    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.free.capacity()
    }

    pub fn overflow_allocations(&self) -> usize {
        self.overflow_allocations.load(Ordering::Relaxed)
    }
}

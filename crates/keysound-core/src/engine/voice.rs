//! Voices: one playing keysound
//!
//! A voice is a fixed chain of providers around a cached asset:
//!
//! ```text
//! AssetReader (i16 → f32, cursor, looping) → Volume → Balance → mixer
//! ```
//!
//! Voices are pooled and re-armed for each trigger, so every piece of state
//! (cursor, DSP state, control block) is reset in [`Voice::arm`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use basedrop::Shared;

use super::mixer::MixerInput;
use crate::asset::CachedAsset;
use crate::config::BalanceConfig;
use crate::dsp::BalanceProcessor;
use crate::types::{AtomicF32, PCM16_SCALE};

/// Unique id of one voice activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoiceId(u64);

impl VoiceId {
    /// Allocate a fresh id (never reused within the process)
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Parameters of one trigger
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceParams {
    pub volume: f32,
    pub balance: f32,
    pub looping: bool,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            volume: 1.0,
            balance: 0.0,
            looping: false,
        }
    }
}

/// Parameters that may change while a voice plays
///
/// Shared between the voice (read on the audio thread) and the control side.
#[derive(Debug, Default)]
pub struct VoiceControl {
    volume: AtomicF32,
    balance: AtomicF32,
}

impl VoiceControl {
    pub fn new(volume: f32, balance: f32) -> Self {
        Self {
            volume: AtomicF32::new(volume),
            balance: AtomicF32::new(balance),
        }
    }

    pub fn volume(&self) -> f32 {
        self.volume.load()
    }

    pub fn set_volume(&self, volume: f32) {
        self.volume.store(volume.max(0.0));
    }

    pub fn balance(&self) -> f32 {
        self.balance.load()
    }

    pub fn set_balance(&self, balance: f32) {
        self.balance.store(balance.clamp(-1.0, 1.0));
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Providers
// ═══════════════════════════════════════════════════════════════════════════════

/// Reads an asset's 16-bit samples as `f32`
#[derive(Default)]
pub struct AssetReader {
    asset: Option<Shared<CachedAsset>>,
    /// Position in interleaved samples
    cursor: usize,
    looping: bool,
}

impl AssetReader {
    pub fn open(&mut self, asset: Shared<CachedAsset>, looping: bool) {
        self.asset = Some(asset);
        self.cursor = 0;
        self.looping = looping;
    }

    /// Release the asset reference
    pub fn close(&mut self) -> Option<Shared<CachedAsset>> {
        self.cursor = 0;
        self.looping = false;
        self.asset.take()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Returns samples written; a disposed asset reads as exhausted
    pub fn read(&mut self, out: &mut [f32]) -> usize {
        let Some(asset) = self.asset.as_ref() else {
            return 0;
        };
        let Some(samples) = asset.try_acquire_samples() else {
            return 0;
        };

        let mut written = 0;
        while written < out.len() {
            if self.cursor >= samples.len() {
                if self.looping && !samples.is_empty() {
                    self.cursor = 0;
                } else {
                    break;
                }
            }
            let n = (out.len() - written).min(samples.len() - self.cursor);
            for (dst, &src) in out[written..written + n]
                .iter_mut()
                .zip(&samples[self.cursor..self.cursor + n])
            {
                *dst = src as f32 * PCM16_SCALE;
            }
            written += n;
            self.cursor += n;
        }
        written
    }
}

/// Applies the live volume
pub struct VolumeProvider;

impl VolumeProvider {
    #[inline]
    pub fn process(samples: &mut [f32], volume: f32) {
        if volume == 1.0 {
            return;
        }
        for s in samples {
            *s *= volume;
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Voice
// ═══════════════════════════════════════════════════════════════════════════════

/// One playing keysound, owned by a mixing graph while active
pub struct Voice {
    id: VoiceId,
    reader: AssetReader,
    balance: BalanceProcessor,
    control: Arc<VoiceControl>,
}

impl Voice {
    /// An idle voice (reads nothing until armed)
    pub fn new(balance: &BalanceConfig, sample_rate: u32) -> Self {
        Self {
            id: VoiceId::next(),
            reader: AssetReader::default(),
            balance: BalanceProcessor::new(balance, sample_rate),
            control: Arc::new(VoiceControl::new(1.0, 0.0)),
        }
    }

    /// Prepare for a new trigger: fresh id, fresh control block, reset DSP
    pub fn arm(&mut self, asset: Shared<CachedAsset>, params: VoiceParams) {
        self.id = VoiceId::next();
        self.reader.open(asset, params.looping);
        self.balance.reset();
        self.control = Arc::new(VoiceControl::new(
            params.volume.max(0.0),
            params.balance.clamp(-1.0, 1.0),
        ));
    }

    /// Drop the asset reference and DSP state
    pub fn disarm(&mut self) {
        self.reader.close();
        self.balance.reset();
    }

    pub fn control(&self) -> Arc<VoiceControl> {
        Arc::clone(&self.control)
    }

    pub fn is_armed(&self) -> bool {
        self.reader.asset.is_some()
    }

    pub fn balance_processor(&self) -> &BalanceProcessor {
        &self.balance
    }
}

impl MixerInput for Voice {
    fn id(&self) -> VoiceId {
        self.id
    }

    fn read(&mut self, out: &mut [f32]) -> usize {
        let n = self.reader.read(out);
        let produced = &mut out[..n];
        VolumeProvider::process(produced, self.control.volume());
        self.balance.process(produced, self.control.balance());
        n
    }
}

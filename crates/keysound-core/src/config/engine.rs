//! Engine configuration
//!
//! Everything the engine needs to know up front: output format, voice limits,
//! bus volumes and the settings of the two DSP stages (per-voice balance and
//! the master limiter). Loaded from YAML with [`load_config`](super::load_config).

use serde::{Deserialize, Serialize};

use crate::dsp::{AntiClip, BalanceMode};
use crate::types::{WaveFormat, DEFAULT_SAMPLE_RATE, ENGINE_CHANNELS, MAX_BUFFER_FRAMES};

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Output and cache sample rate in Hz
    /// Default: 48000
    pub sample_rate: u32,

    /// Output channel count (the mixer is stereo)
    /// Default: 2
    pub channels: u16,

    /// Largest callback buffer in frames; scratch buffers are sized for it
    /// Default: 8192
    pub max_buffer_frames: usize,

    /// Voice cap of the effects bus
    /// Default: 256
    pub max_voices: usize,

    /// Voice cap of the music bus
    /// Default: 4
    pub music_max_voices: usize,

    /// Report a full buffer even when no voice is playing
    /// Default: true
    pub read_fully: bool,

    /// Linear master volume
    pub master_volume: f32,

    /// Linear effects bus volume
    pub effects_volume: f32,

    /// Linear music bus volume
    pub music_volume: f32,

    /// Voices pre-allocated in the pool
    /// Default: 128
    pub voice_pool_size: usize,

    pub limiter: LimiterConfig,

    pub balance: BalanceConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: ENGINE_CHANNELS,
            max_buffer_frames: MAX_BUFFER_FRAMES,
            max_voices: 256,
            music_max_voices: 4,
            read_fully: true,
            master_volume: 1.0,
            effects_volume: 1.0,
            music_volume: 1.0,
            voice_pool_size: 128,
            limiter: LimiterConfig::default(),
            balance: BalanceConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Storage format of cached assets
    pub fn wave_format(&self) -> WaveFormat {
        WaveFormat::stereo16(self.sample_rate)
    }

    /// Largest callback buffer in interleaved samples
    pub fn max_buffer_samples(&self) -> usize {
        self.max_buffer_frames.max(1) * ENGINE_CHANNELS as usize
    }
}

/// Master limiter settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    pub enabled: bool,

    /// Level above which gain reduction starts, in dBFS
    /// Default: -1.0
    pub threshold_db: f32,

    /// Absolute output ceiling, in dBFS
    /// Default: -0.1
    pub ceiling_db: f32,

    /// Lookahead window in milliseconds (adds this much latency)
    /// Default: 5.0
    pub lookahead_ms: f32,

    /// Default: 1.0
    pub attack_ms: f32,

    /// Default: 60.0
    pub release_ms: f32,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_db: -1.0,
            ceiling_db: -0.1,
            lookahead_ms: 5.0,
            attack_ms: 1.0,
            release_ms: 60.0,
        }
    }
}

impl LimiterConfig {
    /// Threshold as linear amplitude
    pub fn threshold(&self) -> f32 {
        db_to_linear(self.threshold_db)
    }

    /// Ceiling as linear amplitude
    pub fn ceiling(&self) -> f32 {
        db_to_linear(self.ceiling_db)
    }
}

/// Per-voice stereo balance settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalanceConfig {
    pub mode: BalanceMode,

    pub anti_clip: AntiClip,

    /// Fraction of the far channel bled into the near one at full balance
    /// (CrossMix). Default: 0.5
    pub cross_amount: f32,

    /// Overall gain at full balance in CrossMix mode. Default: 0.8
    pub crossmix_safety: f32,

    /// Peak level held by DynamicGain. Default: 0.98
    pub dynamic_threshold: f32,

    /// DynamicGain release time in milliseconds. Default: 50
    pub dynamic_release_ms: f32,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            mode: BalanceMode::default(),
            anti_clip: AntiClip::default(),
            cross_amount: 0.5,
            crossmix_safety: 0.8,
            dynamic_threshold: 0.98,
            dynamic_release_ms: 50.0,
        }
    }
}

#[inline]
pub fn db_to_linear(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

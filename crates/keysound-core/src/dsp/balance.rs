//! Stereo balance with anti-clipping
//!
//! Every balance mode collapses to one 2×2 gain matrix per buffer (see
//! [`StereoMatrix`]), applied by the vector kernels in [`super::simd`]. The
//! anti-clip stage then runs on the result.
//!
//! | Anti-clip              | Path                                   |
//! |------------------------|----------------------------------------|
//! | None                   | vector matrix                          |
//! | PreventiveAttenuation  | vector matrix (attenuation folded in)  |
//! | HardLimit              | vector matrix + vector clamp           |
//! | SoftClipper            | vector matrix + scalar tanh            |
//! | DynamicGain            | vector matrix + scalar gain follower   |
//!
//! Balance is in [-1, 1]; negative pans left.

use std::f32::consts::{FRAC_PI_2, SQRT_2};

use serde::{Deserialize, Serialize};

use super::simd::{self, SimdLevel, StereoMatrix};
use crate::config::BalanceConfig;

/// Crossfeed always present in BinauralMix
const BINAURAL_CROSSFEED: f32 = 0.25;

/// Extra bleed into the near channel at full balance in BinauralMix
const BINAURAL_BLEED: f32 = 0.6;

/// How balance moves the stereo image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BalanceMode {
    /// Sin/cos pan law, +3dB at the extremes
    #[default]
    ConstantPower,
    /// Attenuate the far channel and bleed it into the near one
    CrossMix,
    /// Pan the mid signal, narrow the side signal
    MidSide,
    /// Constant crossfeed plus balance-dependent bleed; never neutral
    BinauralMix,
    /// Pass-through
    Off,
}

/// What keeps a panned voice from clipping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AntiClip {
    None,
    /// Scale the matrix so no output row exceeds unity gain
    #[default]
    PreventiveAttenuation,
    /// `tanh(x · 0.9)`
    SoftClipper,
    /// Clamp to [-1, 1]
    HardLimit,
    /// Peak-following gain with exponential release
    DynamicGain,
}

impl AntiClip {
    /// Whether the whole buffer runs on the vector path
    pub fn is_vectorized(self) -> bool {
        matches!(
            self,
            AntiClip::None | AntiClip::PreventiveAttenuation | AntiClip::HardLimit
        )
    }
}

/// Forces a code path (used to compare paths in tests and benchmarks)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessPath {
    /// Best vector path for this CPU
    #[default]
    Auto,
    /// Portable scalar code only
    Scalar,
}

/// Per-voice balance stage
#[derive(Debug, Clone)]
pub struct BalanceProcessor {
    mode: BalanceMode,
    anti_clip: AntiClip,
    cross_amount: f32,
    crossmix_safety: f32,
    dynamic_threshold: f32,
    release_coeff: f32,
    /// DynamicGain state, persists across buffers
    dynamic_gain: f32,
    simd: SimdLevel,
}

impl BalanceProcessor {
    pub fn new(config: &BalanceConfig, sample_rate: u32) -> Self {
        let release_samples = (config.dynamic_release_ms.max(0.01) / 1000.0) * sample_rate as f32;
        Self {
            mode: config.mode,
            anti_clip: config.anti_clip,
            cross_amount: config.cross_amount.clamp(0.0, 1.0),
            crossmix_safety: config.crossmix_safety.clamp(0.0, 1.0),
            dynamic_threshold: config.dynamic_threshold.clamp(0.01, 1.0),
            release_coeff: (-1.0 / release_samples).exp(),
            dynamic_gain: 1.0,
            simd: simd::detect(),
        }
    }

    pub fn mode(&self) -> BalanceMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: BalanceMode) {
        self.mode = mode;
    }

    pub fn anti_clip(&self) -> AntiClip {
        self.anti_clip
    }

    pub fn set_anti_clip(&mut self, anti_clip: AntiClip) {
        self.anti_clip = anti_clip;
        self.dynamic_gain = 1.0;
    }

    /// Current DynamicGain gain (1.0 when idle)
    pub fn dynamic_gain(&self) -> f32 {
        self.dynamic_gain
    }

    /// Forget DynamicGain state
    pub fn reset(&mut self) {
        self.dynamic_gain = 1.0;
    }

    /// Gain matrix for `balance`, including preventive attenuation
    pub fn matrix(&self, balance: f32) -> StereoMatrix {
        let b = if balance.is_finite() {
            balance.clamp(-1.0, 1.0)
        } else {
            0.0
        };
        let magnitude = b.abs();

        let matrix = match self.mode {
            BalanceMode::Off => return StereoMatrix::IDENTITY,
            BalanceMode::ConstantPower | BalanceMode::CrossMix | BalanceMode::MidSide
                if b == 0.0 =>
            {
                return StereoMatrix::IDENTITY
            }
            BalanceMode::ConstantPower => {
                let half_theta = (b + 1.0) * FRAC_PI_2 * 0.5;
                StereoMatrix::diagonal(half_theta.cos() * SQRT_2, half_theta.sin() * SQRT_2)
            }
            BalanceMode::CrossMix => {
                let bleed = magnitude * self.cross_amount;
                let m = if b > 0.0 {
                    StereoMatrix {
                        ll: 1.0 - bleed,
                        rl: 0.0,
                        lr: bleed,
                        rr: 1.0,
                    }
                } else {
                    StereoMatrix {
                        ll: 1.0,
                        rl: bleed,
                        lr: 0.0,
                        rr: 1.0 - bleed,
                    }
                };
                m.scaled(1.0 + (self.crossmix_safety - 1.0) * magnitude)
            }
            BalanceMode::MidSide => {
                // L' = mid·gmL + side·s, R' = mid·gmR − side·s
                let (mid_l, mid_r) = (1.0 - b, 1.0 + b);
                let side = 1.0 - magnitude;
                StereoMatrix {
                    ll: (mid_l + side) * 0.5,
                    rl: (mid_l - side) * 0.5,
                    lr: (mid_r - side) * 0.5,
                    rr: (mid_r + side) * 0.5,
                }
            }
            BalanceMode::BinauralMix => {
                let bleed = BINAURAL_CROSSFEED + BINAURAL_BLEED * magnitude;
                let far = 1.0 - 0.5 * magnitude;
                let m = if b >= 0.0 {
                    StereoMatrix {
                        ll: far,
                        rl: BINAURAL_CROSSFEED,
                        lr: bleed,
                        rr: 1.0,
                    }
                } else {
                    StereoMatrix {
                        ll: 1.0,
                        rl: bleed,
                        lr: BINAURAL_CROSSFEED,
                        rr: far,
                    }
                };
                return m.scaled(1.0 / m.max_row_sum().max(1.0));
            }
        };

        if self.anti_clip == AntiClip::PreventiveAttenuation {
            matrix.scaled(1.0 / matrix.max_row_sum().max(1.0))
        } else {
            matrix
        }
    }

    /// Pan `frames` (interleaved stereo) in place
    pub fn process(&mut self, frames: &mut [f32], balance: f32) {
        self.process_with(frames, balance, ProcessPath::Auto);
    }

    /// Like [`process`](Self::process) on an explicit code path
    pub fn process_with(&mut self, frames: &mut [f32], balance: f32, path: ProcessPath) {
        if self.mode == BalanceMode::Off {
            return;
        }

        let level = match path {
            ProcessPath::Auto => self.simd,
            ProcessPath::Scalar => SimdLevel::Scalar,
        };

        let matrix = self.matrix(balance);
        if !matrix.is_identity() {
            simd::apply_matrix(level, frames, &matrix);
        }

        if self.anti_clip.is_vectorized() {
            if self.anti_clip == AntiClip::HardLimit {
                simd::hard_limit(level, frames);
            }
            return;
        }

        // Hybrid path: scalar anti-clip after the vector matrix
        match self.anti_clip {
            AntiClip::SoftClipper => {
                for s in frames.iter_mut() {
                    *s = (*s * 0.9).tanh();
                }
            }
            AntiClip::DynamicGain => self.follow_peaks(frames),
            AntiClip::None | AntiClip::PreventiveAttenuation | AntiClip::HardLimit => {}
        }
    }

    fn follow_peaks(&mut self, frames: &mut [f32]) {
        let threshold = self.dynamic_threshold;
        for frame in frames.chunks_exact_mut(2) {
            let peak = frame[0].abs().max(frame[1].abs());
            if peak > threshold {
                let needed = threshold / peak;
                if needed < self.dynamic_gain {
                    self.dynamic_gain = needed;
                }
            } else {
                self.dynamic_gain = 1.0 + (self.dynamic_gain - 1.0) * self.release_coeff;
            }
            frame[0] *= self.dynamic_gain;
            frame[1] *= self.dynamic_gain;
        }
    }
}

//! Vector kernels for interleaved stereo buffers
//!
//! Every kernel has a portable scalar version and x86_64 versions for SSE2
//! (always available on x86_64) and AVX (runtime detected). The vector code
//! uses plain multiply and add, never FMA, in the same order as the scalar
//! code, so all paths produce identical results on finite input.
//!
//! # Stereo matrix trick
//!
//! Interleaved frames `[L0 R0 L1 R1 ...]` are processed as
//!
//! ```text
//! x       = [L0  R0  L1  R1 ...]
//! swapped = [R0  L0  R1  L1 ...]      (pairwise lane swap)
//! out     = x * [ll rr ll rr ...] + swapped * [rl lr rl lr ...]
//! ```
//!
//! which yields `L' = L·ll + R·rl` and `R' = R·rr + L·lr` per frame.

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::*;
use std::sync::OnceLock;

/// Instruction set used for a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimdLevel {
    Scalar,
    Sse2,
    Avx,
}

/// Best level supported by this CPU (detected once)
pub fn detect() -> SimdLevel {
    static LEVEL: OnceLock<SimdLevel> = OnceLock::new();
    *LEVEL.get_or_init(|| {
        #[cfg(target_arch = "x86_64")]
        {
            if is_x86_feature_detected!("avx") {
                SimdLevel::Avx
            } else {
                SimdLevel::Sse2
            }
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            SimdLevel::Scalar
        }
    })
}

/// 2×2 stereo gain matrix
///
/// `L' = L·ll + R·rl`, `R' = L·lr + R·rr`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StereoMatrix {
    pub ll: f32,
    pub rl: f32,
    pub lr: f32,
    pub rr: f32,
}

impl StereoMatrix {
    pub const IDENTITY: Self = Self {
        ll: 1.0,
        rl: 0.0,
        lr: 0.0,
        rr: 1.0,
    };

    /// Independent channel gains
    pub fn diagonal(left: f32, right: f32) -> Self {
        Self {
            ll: left,
            rl: 0.0,
            lr: 0.0,
            rr: right,
        }
    }

    pub fn scaled(self, k: f32) -> Self {
        Self {
            ll: self.ll * k,
            rl: self.rl * k,
            lr: self.lr * k,
            rr: self.rr * k,
        }
    }

    /// Largest output row gain sum (worst-case output for full-scale input)
    pub fn max_row_sum(&self) -> f32 {
        (self.ll.abs() + self.rl.abs()).max(self.lr.abs() + self.rr.abs())
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Dispatch
// ═══════════════════════════════════════════════════════════════════════════════

/// Apply `matrix` to every frame of `frames` in place
pub fn apply_matrix(level: SimdLevel, frames: &mut [f32], matrix: &StereoMatrix) {
    let frames_len = frames.len() & !1;
    let frames = &mut frames[..frames_len];
    match level {
        #[cfg(target_arch = "x86_64")]
        // SAFETY: Avx is only reported by `detect` when the CPU supports it
        SimdLevel::Avx => unsafe { apply_matrix_avx(frames, matrix) },
        #[cfg(target_arch = "x86_64")]
        // SAFETY: SSE2 is part of the x86_64 baseline
        SimdLevel::Sse2 => unsafe { apply_matrix_sse2(frames, matrix) },
        _ => apply_matrix_scalar(frames, matrix),
    }
}

/// Clamp every sample to [-1, 1]
pub fn hard_limit(level: SimdLevel, samples: &mut [f32]) {
    match level {
        #[cfg(target_arch = "x86_64")]
        // SAFETY: Avx is only reported by `detect` when the CPU supports it
        SimdLevel::Avx => unsafe { hard_limit_avx(samples) },
        #[cfg(target_arch = "x86_64")]
        // SAFETY: SSE2 is part of the x86_64 baseline
        SimdLevel::Sse2 => unsafe { hard_limit_sse2(samples) },
        _ => hard_limit_scalar(samples),
    }
}

/// `dst[i] += src[i]` over the common length
pub fn add_into(level: SimdLevel, dst: &mut [f32], src: &[f32]) {
    let len = dst.len().min(src.len());
    let (dst, src) = (&mut dst[..len], &src[..len]);
    match level {
        #[cfg(target_arch = "x86_64")]
        // SAFETY: Avx is only reported by `detect` when the CPU supports it
        SimdLevel::Avx => unsafe { add_into_avx(dst, src) },
        #[cfg(target_arch = "x86_64")]
        // SAFETY: SSE2 is part of the x86_64 baseline
        SimdLevel::Sse2 => unsafe { add_into_sse2(dst, src) },
        _ => add_into_scalar(dst, src),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scalar reference
// ═══════════════════════════════════════════════════════════════════════════════

pub fn apply_matrix_scalar(frames: &mut [f32], m: &StereoMatrix) {
    for frame in frames.chunks_exact_mut(2) {
        let (l, r) = (frame[0], frame[1]);
        frame[0] = l * m.ll + r * m.rl;
        frame[1] = r * m.rr + l * m.lr;
    }
}

pub fn hard_limit_scalar(samples: &mut [f32]) {
    for s in samples {
        *s = s.max(-1.0).min(1.0);
    }
}

pub fn add_into_scalar(dst: &mut [f32], src: &[f32]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d += *s;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// x86_64
// ═══════════════════════════════════════════════════════════════════════════════

/// Pairwise lane swap: [a0 a1 a2 a3] → [a1 a0 a3 a2]
#[cfg(target_arch = "x86_64")]
const SWAP_PAIRS: i32 = 0b10_11_00_01;

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx")]
unsafe fn apply_matrix_avx(frames: &mut [f32], m: &StereoMatrix) {
    let direct = _mm256_setr_ps(m.ll, m.rr, m.ll, m.rr, m.ll, m.rr, m.ll, m.rr);
    let cross = _mm256_setr_ps(m.rl, m.lr, m.rl, m.lr, m.rl, m.lr, m.rl, m.lr);

    let mut chunks = frames.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let x = _mm256_loadu_ps(chunk.as_ptr());
        let swapped = _mm256_permute_ps::<SWAP_PAIRS>(x);
        let out = _mm256_add_ps(_mm256_mul_ps(x, direct), _mm256_mul_ps(swapped, cross));
        _mm256_storeu_ps(chunk.as_mut_ptr(), out);
    }
    apply_matrix_scalar(chunks.into_remainder(), m);
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse2")]
unsafe fn apply_matrix_sse2(frames: &mut [f32], m: &StereoMatrix) {
    let direct = _mm_setr_ps(m.ll, m.rr, m.ll, m.rr);
    let cross = _mm_setr_ps(m.rl, m.lr, m.rl, m.lr);

    let mut chunks = frames.chunks_exact_mut(4);
    for chunk in &mut chunks {
        let x = _mm_loadu_ps(chunk.as_ptr());
        let swapped = _mm_shuffle_ps::<SWAP_PAIRS>(x, x);
        let out = _mm_add_ps(_mm_mul_ps(x, direct), _mm_mul_ps(swapped, cross));
        _mm_storeu_ps(chunk.as_mut_ptr(), out);
    }
    apply_matrix_scalar(chunks.into_remainder(), m);
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx")]
unsafe fn hard_limit_avx(samples: &mut [f32]) {
    let lo = _mm256_set1_ps(-1.0);
    let hi = _mm256_set1_ps(1.0);

    let mut chunks = samples.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let x = _mm256_loadu_ps(chunk.as_ptr());
        _mm256_storeu_ps(chunk.as_mut_ptr(), _mm256_min_ps(_mm256_max_ps(x, lo), hi));
    }
    hard_limit_scalar(chunks.into_remainder());
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse2")]
unsafe fn hard_limit_sse2(samples: &mut [f32]) {
    let lo = _mm_set1_ps(-1.0);
    let hi = _mm_set1_ps(1.0);

    let mut chunks = samples.chunks_exact_mut(4);
    for chunk in &mut chunks {
        let x = _mm_loadu_ps(chunk.as_ptr());
        _mm_storeu_ps(chunk.as_mut_ptr(), _mm_min_ps(_mm_max_ps(x, lo), hi));
    }
    hard_limit_scalar(chunks.into_remainder());
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx")]
unsafe fn add_into_avx(dst: &mut [f32], src: &[f32]) {
    let mut dst_chunks = dst.chunks_exact_mut(8);
    let mut src_chunks = src.chunks_exact(8);
    for (d, s) in (&mut dst_chunks).zip(&mut src_chunks) {
        let sum = _mm256_add_ps(_mm256_loadu_ps(d.as_ptr()), _mm256_loadu_ps(s.as_ptr()));
        _mm256_storeu_ps(d.as_mut_ptr(), sum);
    }
    add_into_scalar(dst_chunks.into_remainder(), src_chunks.remainder());
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse2")]
unsafe fn add_into_sse2(dst: &mut [f32], src: &[f32]) {
    let mut dst_chunks = dst.chunks_exact_mut(4);
    let mut src_chunks = src.chunks_exact(4);
    for (d, s) in (&mut dst_chunks).zip(&mut src_chunks) {
        let sum = _mm_add_ps(_mm_loadu_ps(d.as_ptr()), _mm_loadu_ps(s.as_ptr()));
        _mm_storeu_ps(d.as_mut_ptr(), sum);
    }
    add_into_scalar(dst_chunks.into_remainder(), src_chunks.remainder());
}

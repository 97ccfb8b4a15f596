//! Real-time DSP stages
//!
//! - [`balance`]: per-voice stereo balance with anti-clipping
//! - [`limiter`]: lookahead peak limiter on the master bus
//! - [`simd`]: vector kernels with runtime CPU dispatch
//!
//! Nothing in here allocates or locks after construction.

pub mod balance;
pub mod limiter;
pub mod simd;

pub use balance::{AntiClip, BalanceMode, BalanceProcessor, ProcessPath};
pub use limiter::LookaheadLimiter;
pub use simd::{SimdLevel, StereoMatrix};

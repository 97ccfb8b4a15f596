//! Audio engine - voices, mixing graphs, real-time rendering
//!
//! This module contains the playback side of keysound:
//! - Voice: one triggered asset with volume and balance
//! - VoicePool: recycled voices so triggers do not allocate
//! - MixingGraph: lock-free topology changes, summed on the audio thread
//! - KeysoundEngine / AudioRenderer: control handle and audio callback half

mod engine;
pub mod gc;
mod looping;
mod mixer;
mod pool;
mod voice;

pub use engine::*;
pub use looping::*;
pub use mixer::*;
pub use pool::*;
pub use voice::*;

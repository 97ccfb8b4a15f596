//! Keysound Core - decode cache and real-time mixer for short sound assets
//!
//! Assets are decoded once into 16-bit PCM at the engine format, deduplicated
//! by content hash, and shared with the audio thread through [`asset`] guards
//! that make disposal safe while a voice is still reading.

pub mod asset;
pub mod buffer;
pub mod cache;
pub mod config;
pub mod decode;
pub mod dsp;
pub mod engine;
pub mod types;

#[cfg(test)]
mod test_util;

pub use types::*;

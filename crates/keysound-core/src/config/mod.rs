//! Configuration for keysound applications
//!
//! - Generic YAML config loading/saving
//! - `EngineConfig` with its limiter and balance sections
//!
//! # Usage
//!
//! ```ignore
//! use keysound_core::config::{load_config, save_config, EngineConfig};
//!
//! let config: EngineConfig = load_config(&config_path);
//! save_config(&config, &config_path)?;
//! ```

mod engine;
mod io;

pub use engine::{db_to_linear, BalanceConfig, EngineConfig, LimiterConfig};
pub use io::{load_config, save_config};

//! Karma Configuration Module
//!
//! Provides pipeline configuration loaded from TOML files.
//!
//! ## Loading Order
//!
//! 1. `KARMA_CONFIG` environment variable (path to TOML file)
//! 2. `karma_config.toml` in the current working directory
//! 3. Built-in defaults
//!
//! ## Usage
//!
//! The binary calls `config::init()` once at startup and reads it with
//! `config::get()`. Library stages take explicit config references so they
//! can be exercised without the global.
//!
//! ```ignore
//! config::init(KarmaConfig::load());
//! let alpha = config::get().karma.smoothing;
//! ```

mod karma_config;
pub mod defaults;
pub mod validation;

pub use karma_config::*;

use std::sync::OnceLock;

/// Global configuration, initialized once at startup.
static KARMA_CONFIG: OnceLock<KarmaConfig> = OnceLock::new();

/// Initialize the global configuration. Later calls are ignored.
pub fn init(config: KarmaConfig) {
    if KARMA_CONFIG.set(config).is_err() {
        tracing::warn!("config::init() called more than once, ignoring");
    }
}

/// Get the global configuration, falling back to built-in defaults when
/// `init()` was never called.
pub fn get() -> &'static KarmaConfig {
    KARMA_CONFIG.get_or_init(KarmaConfig::default)
}

/// Check whether the config has been initialized.
pub fn is_initialized() -> bool {
    KARMA_CONFIG.get().is_some()
}

//! Farm Configuration Module
//!
//! Provides deployment configuration loaded from TOML files, replacing
//! hardcoded detection and agronomic thresholds with operator-tunable values.
//!
//! ## Loading Order
//!
//! 1. `CROPWATCH_CONFIG` environment variable (path to TOML file)
//! 2. `farm_config.toml` in the current working directory
//! 3. Built-in defaults
//!
//! ## Usage
//!
//! Call `config::init()` once at startup, then `config::get()` anywhere:
//!
//! ```ignore
//! // In main():
//! config::init(FarmConfig::load());
//!
//! // Anywhere in the codebase:
//! let low = config::get().thresholds.moisture.critical_low;
//! ```

mod farm_config;

pub use farm_config::*;

use std::sync::OnceLock;

/// Global farm configuration, initialized once at startup.
static FARM_CONFIG: OnceLock<FarmConfig> = OnceLock::new();

/// Initialize the global farm configuration.
///
/// Should be called exactly once before any calls to `get()`. Repeated calls
/// are ignored with a warning.
pub fn init(config: FarmConfig) {
    if FARM_CONFIG.set(config).is_err() {
        tracing::warn!("config::init() called more than once, ignoring");
    }
}

/// Get a reference to the global farm configuration.
///
/// Panics if `init()` has not been called. A missing config is a fatal
/// startup error, not a recoverable condition.
pub fn get() -> &'static FarmConfig {
    FARM_CONFIG
        .get()
        .expect("config::get() called before config::init(), startup bug")
}

/// Check whether the config has been initialized.
///
/// Library components fall back to built-in defaults when it has not, so unit
/// tests do not need to touch the global.
pub fn is_initialized() -> bool {
    FARM_CONFIG.get().is_some()
}

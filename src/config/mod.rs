//! Configuration module for cookbridge
//!
//! This module handles:
//! - Engine settings (session transport, cook policy, worker pool), stored as TOML
//! - Per-node parameter presets, stored as JSON
//!
//! # Data Location
//!
//! Settings live in the platform data directory:
//! - **Linux**: `~/.local/share/dev.hxyulin.cookbridge/`
//! - **macOS**: `~/Library/Application Support/dev.hxyulin.cookbridge/`
//! - **Windows**: `%APPDATA%\dev.hxyulin.cookbridge\`
//!
//! # Example
//!
//! ```ignore
//! use cookbridge::config::EngineSettings;
//!
//! let mut settings = EngineSettings::load_or_default();
//! settings.verbose = true;
//! settings.save()?;
//! ```

pub mod preset;
pub mod settings;

pub use preset::Preset;
pub use settings::EngineSettings;

use crate::error::{CookError, Result};
use std::path::PathBuf;

/// Application identifier for data directories
pub const APP_ID: &str = "dev.hxyulin.cookbridge";

/// Settings filename
pub const SETTINGS_FILE: &str = "settings.toml";

/// Preset file extension
pub const PRESET_FILE_EXTENSION: &str = "preset.json";

/// Default shared memory buffer size in megabytes
pub const DEFAULT_SHARED_MEMORY_BUFFER_MB: u32 = 512;

/// Default frame rate cap while a cook is running
pub const DEFAULT_MAX_FPS_WHILE_COOKING: f32 = 12.0;

/// Default session liveness probe interval in milliseconds
pub const DEFAULT_LIVENESS_INTERVAL_MS: u64 = 1000;

/// Default server connection timeout in milliseconds
pub const DEFAULT_SERVER_TIMEOUT_MS: u64 = 3000;

/// Default number of attempts when attaching to an interactive engine
pub const DEFAULT_SYNC_CONNECT_ATTEMPTS: u32 = 300;

/// Default delay between attach attempts in milliseconds
pub const DEFAULT_SYNC_RETRY_INTERVAL_MS: u64 = 1000;

/// Default worker pool size
pub const DEFAULT_WORKER_THREADS: usize = 2;

// ==================== App Data Directory ====================

/// Get the application data directory path
pub fn app_data_dir() -> Option<PathBuf> {
    dirs_next::data_dir().map(|p| p.join(APP_ID))
}

/// Ensure the app data directory exists
pub fn ensure_app_data_dir() -> Result<PathBuf> {
    let dir = app_data_dir().ok_or_else(|| {
        CookError::Configuration("Could not determine app data directory".to_string())
    })?;

    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| {
            CookError::Configuration(format!("Failed to create app data directory: {}", e))
        })?;
    }

    Ok(dir)
}

/// Get the path to the settings file
pub fn settings_path() -> Option<PathBuf> {
    app_data_dir().map(|p| p.join(SETTINGS_FILE))
}

//! Engine settings
//!
//! One flat struct covering the session transport, the cook policy and the
//! worker pool. Missing fields fall back to their defaults so older settings
//! files keep loading.

use super::{
    ensure_app_data_dir, settings_path, DEFAULT_LIVENESS_INTERVAL_MS,
    DEFAULT_MAX_FPS_WHILE_COOKING, DEFAULT_SERVER_TIMEOUT_MS, DEFAULT_SHARED_MEMORY_BUFFER_MB,
    DEFAULT_SYNC_CONNECT_ATTEMPTS, DEFAULT_SYNC_RETRY_INTERVAL_MS, DEFAULT_WORKER_THREADS,
    SETTINGS_FILE,
};
use crate::engine::SessionKind;
use crate::error::{CookError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings for sessions and cooking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Transport used for launched sessions
    pub session_kind: SessionKind,

    /// Shared memory buffer size in megabytes
    pub shared_memory_buffer_mb: u32,

    /// Poll the engine while cooking and forward its status text
    pub verbose: bool,

    /// Whether editing an input triggers a cook
    pub cook_on_input_changed: bool,

    /// Ask the host to cap its frame rate while cooking
    pub limit_fps_while_cooking: bool,

    /// Frame rate cap while cooking
    pub max_fps_while_cooking: f32,

    /// Session liveness probe interval in milliseconds
    pub liveness_interval_ms: u64,

    /// Timeout for launched servers in milliseconds
    pub server_timeout_ms: u64,

    /// Attach attempts when starting in sync mode
    pub sync_connect_attempts: u32,

    /// Delay between attach attempts in milliseconds
    pub sync_retry_interval_ms: u64,

    /// Number of worker threads for remote calls
    pub worker_threads: usize,

    /// Directory for rolling log files
    pub log_dir: Option<PathBuf>,

    /// Environment strings pushed to the server after initialize
    pub server_env: BTreeMap<String, String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            session_kind: SessionKind::SharedMemory,
            shared_memory_buffer_mb: DEFAULT_SHARED_MEMORY_BUFFER_MB,
            verbose: false,
            cook_on_input_changed: true,
            limit_fps_while_cooking: true,
            max_fps_while_cooking: DEFAULT_MAX_FPS_WHILE_COOKING,
            liveness_interval_ms: DEFAULT_LIVENESS_INTERVAL_MS,
            server_timeout_ms: DEFAULT_SERVER_TIMEOUT_MS,
            sync_connect_attempts: DEFAULT_SYNC_CONNECT_ATTEMPTS,
            sync_retry_interval_ms: DEFAULT_SYNC_RETRY_INTERVAL_MS,
            worker_threads: DEFAULT_WORKER_THREADS,
            log_dir: None,
            server_env: BTreeMap::new(),
        }
    }
}

impl EngineSettings {
    /// Load settings from the default location
    pub fn load() -> Result<Self> {
        let path = settings_path().ok_or_else(|| {
            CookError::Configuration("Could not determine settings path".to_string())
        })?;

        if !path.exists() {
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load settings, returning defaults on any error
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_else(|e| {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            Self::default()
        })
    }

    /// Load settings from an explicit file
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CookError::Configuration(format!("Failed to read settings {:?}: {}", path, e))
        })?;

        let settings: Self = toml::from_str(&content).map_err(|e| {
            CookError::Configuration(format!("Failed to parse settings {:?}: {}", path, e))
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Save settings to the default location
    pub fn save(&self) -> Result<()> {
        let dir = ensure_app_data_dir()?;
        self.save_to(dir.join(SETTINGS_FILE))
    }

    /// Save settings to an explicit file
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CookError::Configuration(format!("Failed to create settings directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| CookError::Serialization(format!("Failed to serialize settings: {}", e)))?;

        std::fs::write(path, content).map_err(|e| {
            CookError::Configuration(format!("Failed to write settings {:?}: {}", path, e))
        })
    }

    /// Reject values the scheduler cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(CookError::Configuration(
                "worker_threads must be at least 1".to_string(),
            ));
        }
        if self.sync_connect_attempts == 0 {
            return Err(CookError::Configuration(
                "sync_connect_attempts must be at least 1".to_string(),
            ));
        }
        if self.limit_fps_while_cooking && self.max_fps_while_cooking <= 0.0 {
            return Err(CookError::Configuration(format!(
                "max_fps_while_cooking must be positive, got {}",
                self.max_fps_while_cooking
            )));
        }
        Ok(())
    }

    /// Liveness probe cadence
    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    /// Delay between attach attempts in sync mode
    pub fn sync_retry_interval(&self) -> Duration {
        Duration::from_millis(self.sync_retry_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let settings = EngineSettings::default();
        assert_eq!(settings.session_kind, SessionKind::SharedMemory);
        assert_eq!(settings.shared_memory_buffer_mb, 512);
        assert!(settings.cook_on_input_changed);
        assert_eq!(settings.liveness_interval(), Duration::from_secs(1));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("settings.toml");

        let mut settings = EngineSettings::default();
        settings.session_kind = SessionKind::NamedPipe;
        settings.verbose = true;
        settings
            .server_env
            .insert("ASSET_ROOT".to_string(), "/srv/assets".to_string());
        settings.save_to(&path).unwrap();

        let loaded = EngineSettings::load_from(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "verbose = true\nworker_threads = 4\n").unwrap();

        let loaded = EngineSettings::load_from(&path).unwrap();
        assert!(loaded.verbose);
        assert_eq!(loaded.worker_threads, 4);
        assert_eq!(loaded.sync_connect_attempts, 300);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "worker_threads = 0\n").unwrap();

        let err = EngineSettings::load_from(&path).unwrap_err();
        assert!(matches!(err, CookError::Configuration(_)));
    }

    #[test]
    fn test_parse_error_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "verbose = \"maybe\"\n").unwrap();

        assert!(EngineSettings::load_from(&path).is_err());
    }
}

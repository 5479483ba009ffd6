//! Session connector
//!
//! Opens a connection in one of two ways:
//!
//! - **Launch**: start a private server under a fresh name and connect to it
//! - **Sync**: attach to the interactive engine publishing [`SYNC_SESSION_NAME`],
//!   launching one and retrying once per interval if nobody publishes it yet
//!
//! Both paths finish with the handshake (initialize + server environment).
//! A failure after connecting closes the half-open session before returning.

use crate::bridge::HostSender;
use crate::config::EngineSettings;
use crate::engine::status::{to_error, RemoteResultExt, Step};
use crate::engine::strings::identifier;
use crate::engine::{RemoteEngine, ResultCode, ServerOptions, SessionHandle, SessionKind};
use crate::error::{CookError, Result};
use crate::session::StartMode;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Session name published by interactive engines for sync mode
pub const SYNC_SESSION_NAME: &str = "cookbridge_session_sync";

static LAUNCH_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Connection parameters taken from [`EngineSettings`]
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    pub kind: SessionKind,
    pub server: ServerOptions,
    pub server_env: Vec<(String, String)>,
    pub sync_attempts: u32,
    pub sync_retry_interval: Duration,
}

impl ConnectOptions {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            kind: settings.session_kind,
            server: ServerOptions {
                auto_close: true,
                timeout_ms: settings.server_timeout_ms,
                shared_memory_buffer_mb: settings.shared_memory_buffer_mb,
            },
            server_env: settings
                .server_env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            sync_attempts: settings.sync_connect_attempts.max(1),
            sync_retry_interval: settings.sync_retry_interval(),
        }
    }
}

/// Fresh `cookbridge_XXXXXXXX` name for a launched server
pub fn launch_session_name() -> String {
    let seed = std::process::id().wrapping_mul(31).wrapping_add(LAUNCH_COUNTER.fetch_add(1, Ordering::Relaxed));
    format!("cookbridge_{}", identifier(seed))
}

/// Open a session. Blocks for the whole connect sequence.
pub fn connect(
    engine: &dyn RemoteEngine,
    options: &ConnectOptions,
    mode: StartMode,
    progress: &HostSender,
) -> Result<SessionHandle> {
    if !engine.is_library_loaded() {
        return Err(CookError::Configuration(
            "compute engine client library is not available".to_string(),
        ));
    }
    match mode {
        StartMode::Launch => launch(engine, options),
        StartMode::Sync => attach(engine, options, progress),
    }
}

fn launch(engine: &dyn RemoteEngine, options: &ConnectOptions) -> Result<SessionHandle> {
    let name = launch_session_name();
    tracing::debug!("Launching {} server '{}'", options.kind, name);
    engine
        .start_server(options.kind, &name, &options.server)
        .step(Step::StartServer)?;
    let session = engine.create_session(options.kind, &name).step(Step::Connect)?;
    handshake(engine, &session, options)?;
    Ok(session)
}

fn attach(engine: &dyn RemoteEngine, options: &ConnectOptions, progress: &HostSender) -> Result<SessionHandle> {
    if let Ok(session) = engine.create_session(options.kind, SYNC_SESSION_NAME) {
        handshake(engine, &session, options)?;
        return Ok(session);
    }

    tracing::info!("No interactive engine published, launching one");
    engine
        .launch_interactive(SYNC_SESSION_NAME)
        .step(Step::StartServer)?;

    let attempts = options.sync_attempts;
    for attempt in 1..=attempts {
        progress.main_progress(Some((
            attempt as f32 / attempts as f32,
            format!("Waiting for engine ({}/{})", attempt, attempts),
        )));
        std::thread::sleep(options.sync_retry_interval);

        if let Ok(session) = engine.create_session(options.kind, SYNC_SESSION_NAME) {
            progress.main_progress(None);
            handshake(engine, &session, options)?;
            return Ok(session);
        }
    }

    progress.main_progress(None);
    Err(CookError::Remote {
        step: Step::Connect,
        code: ResultCode::Failure,
    }
    .with_context(format!(
        "no engine published '{}' after {} attempts",
        SYNC_SESSION_NAME, attempts
    )))
}

/// Initialize and push the server environment, closing the session on failure
fn handshake(engine: &dyn RemoteEngine, session: &SessionHandle, options: &ConnectOptions) -> Result<()> {
    let result = initialize(engine, session, options);
    if result.is_err() {
        let _ = engine.close_session(session);
    }
    result
}

fn initialize(engine: &dyn RemoteEngine, session: &SessionHandle, options: &ConnectOptions) -> Result<()> {
    match engine.initialize(session) {
        Ok(()) | Err(ResultCode::AlreadyInitialized) => {}
        Err(code) => return Err(to_error(code, Step::Initialize)),
    }
    for (key, value) in &options.server_env {
        engine
            .set_server_env(session, key, value)
            .step(Step::ServerEnv)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::HostMessage;
    use crate::engine::mock::{MockCall, MockEngine};
    use crossbeam_channel::bounded;

    fn options(attempts: u32) -> ConnectOptions {
        let mut settings = EngineSettings::default();
        settings.sync_connect_attempts = attempts;
        settings.sync_retry_interval_ms = 1;
        settings
            .server_env
            .insert("ASSET_ROOT".to_string(), "/srv/assets".to_string());
        ConnectOptions::from_settings(&settings)
    }

    #[test]
    fn test_launch_session_names_are_unique() {
        let a = launch_session_name();
        let b = launch_session_name();
        assert_ne!(a, b);
        assert!(a.starts_with("cookbridge_"));
        assert_eq!(a.len(), "cookbridge_".len() + 8);
    }

    #[test]
    fn test_launch_pushes_server_env() {
        let engine = MockEngine::new();
        let (tx, _rx) = bounded(16);
        connect(&engine, &options(1), StartMode::Launch, &HostSender::new(tx)).unwrap();
        assert_eq!(engine.server_env("ASSET_ROOT").as_deref(), Some("/srv/assets"));
    }

    #[test]
    fn test_already_initialized_is_success() {
        let engine = MockEngine::new();
        engine.fail_next(MockCall::Initialize, ResultCode::AlreadyInitialized);
        let (tx, _rx) = bounded(16);
        assert!(connect(&engine, &options(1), StartMode::Launch, &HostSender::new(tx)).is_ok());
    }

    #[test]
    fn test_missing_library_is_configuration_error() {
        let engine = MockEngine::new();
        engine.set_library_loaded(false);
        let (tx, _rx) = bounded(16);
        let err = connect(&engine, &options(1), StartMode::Launch, &HostSender::new(tx)).unwrap_err();
        assert!(matches!(err, CookError::Configuration(_)));
        assert!(engine.calls().is_empty());
    }

    #[test]
    fn test_sync_retries_until_published() {
        let engine = MockEngine::new().with_sync_ready_after(2);
        let (tx, rx) = bounded(64);
        connect(&engine, &options(5), StartMode::Sync, &HostSender::new(tx)).unwrap();

        assert_eq!(engine.call_count(MockCall::LaunchInteractive), 1);
        assert_eq!(engine.call_count(MockCall::CreateSession), 4);
        let progress: Vec<_> = rx.try_iter().collect();
        assert_eq!(progress.last(), Some(&HostMessage::MainProgress(None)));
    }

    #[test]
    fn test_sync_gives_up() {
        let engine = MockEngine::new().with_sync_ready_after(10);
        let (tx, _rx) = bounded(64);
        let err = connect(&engine, &options(3), StartMode::Sync, &HostSender::new(tx)).unwrap_err();
        assert_eq!(err.step(), Some(Step::Connect));
        assert!(!engine.has_session());
    }
}

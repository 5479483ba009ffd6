//! Session management
//!
//! The [`SessionManager`] owns the single connection to the remote engine.
//! It starts and stops sessions, probes liveness on a fixed cadence and runs
//! the invalidation sweep when the session is lost.
//!
//! # Session lifecycle
//!
//! ```text
//! no session --start(Launch | Sync)--> session --stop / invalidate--> no session
//! ```
//!
//! A new session always replaces the old one: the old handle is closed and
//! every node is invalidated before connecting again. A failed start leaves
//! no session behind.
//!
//! # Working tasks
//!
//! [`WorkingTasks`] counts asynchronous remote operations in flight. Edits
//! and pipeline admission are only allowed while it is zero.

pub mod connect;

pub use connect::{connect, launch_session_name, ConnectOptions, SYNC_SESSION_NAME};

use crate::asset::AssetId;
use crate::bridge::{HostMessage, HostSender, SessionStatus};
use crate::engine::status::{RemoteResultExt, Step};
use crate::engine::{RemoteEngine, SessionHandle};
use crate::error::Result;
use crate::node::NodeRegistry;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// How a session is started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StartMode {
    /// Launch a private server process
    #[default]
    Launch,
    /// Attach to an interactive engine, launching one if none is published
    Sync,
}

/// Result of a liveness poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// The probe interval has not elapsed yet
    NotDue,
    Alive,
    /// The probe failed; the caller must invalidate
    Lost,
    NoSession,
}

/// Count of asynchronous remote operations in flight
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkingTasks {
    count: u32,
    peak: u32,
}

impl WorkingTasks {
    pub fn start(&mut self) {
        self.count += 1;
        self.peak = self.peak.max(self.count);
    }

    pub fn finish(&mut self) {
        if self.count == 0 {
            tracing::warn!("Working task finished with no task running");
            return;
        }
        self.count -= 1;
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Highest count observed since creation
    pub fn peak(&self) -> u32 {
        self.peak
    }

    pub fn is_idle(&self) -> bool {
        self.count == 0
    }
}

/// Owner of the one live session
pub struct SessionManager {
    engine: Arc<dyn RemoteEngine>,
    session: Option<SessionHandle>,
    is_sync: bool,
    /// Result of the most recent liveness probe
    probe_ok: bool,
    loaded_assets: HashSet<AssetId>,
    tasks: WorkingTasks,
    since_probe: Duration,
    liveness_interval: Duration,
    /// Bumped on every invalidation; continuations from older epochs are dropped
    epoch: u64,
    invalidations: u64,
    frame_limited: bool,
    host: HostSender,
}

impl SessionManager {
    pub fn new(engine: Arc<dyn RemoteEngine>, liveness_interval: Duration, host: HostSender) -> Self {
        Self {
            engine,
            session: None,
            is_sync: false,
            probe_ok: false,
            loaded_assets: HashSet::new(),
            tasks: WorkingTasks::default(),
            since_probe: Duration::ZERO,
            liveness_interval,
            epoch: 0,
            invalidations: 0,
            frame_limited: false,
            host,
        }
    }

    pub fn engine(&self) -> &Arc<dyn RemoteEngine> {
        &self.engine
    }

    pub fn handle(&self) -> Option<SessionHandle> {
        self.session
    }

    pub fn is_sync(&self) -> bool {
        self.is_sync
    }

    /// A session exists and the last probe succeeded
    pub fn is_usable(&self) -> bool {
        self.session.is_some() && self.probe_ok
    }

    /// No remote work in flight and the engine library is available
    pub fn allow_edit(&self) -> bool {
        self.tasks.is_idle() && self.engine.is_library_loaded()
    }

    pub fn tasks(&self) -> WorkingTasks {
        self.tasks
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Number of invalidation sweeps run so far
    pub fn invalidations(&self) -> u64 {
        self.invalidations
    }

    pub fn host(&self) -> &HostSender {
        &self.host
    }

    /// Adopt a freshly connected session
    pub fn install(&mut self, session: SessionHandle, sync: bool) {
        if let Some(old) = self.session.take() {
            tracing::warn!("Replacing open session {:?}", old);
            let _ = self.engine.close_session(&old);
        }
        tracing::info!(
            "Session {} started ({}, {})",
            session.id,
            session.kind,
            if sync { "sync" } else { "launched" }
        );
        self.session = Some(session);
        self.is_sync = sync;
        self.probe_ok = true;
        self.since_probe = Duration::ZERO;
        self.loaded_assets.clear();
        self.host.session_status(SessionStatus::Connected { sync });
    }

    /// Start a session on the calling thread.
    ///
    /// In sync mode an existing valid sync session is kept. Any other open
    /// session is stopped and all nodes are invalidated first.
    pub fn start(&mut self, mode: StartMode, options: &ConnectOptions, nodes: &mut NodeRegistry) -> Result<()> {
        if mode == StartMode::Sync && self.is_sync {
            if let Some(session) = self.session {
                if self.engine.is_session_valid(&session).is_ok() {
                    return Ok(());
                }
            }
        }
        if self.session.is_some() {
            self.invalidate(nodes);
        }

        self.host.session_status(SessionStatus::Connecting);
        match connect(self.engine.as_ref(), options, mode, &self.host) {
            Ok(session) => {
                self.install(session, mode == StartMode::Sync);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to start session: {}", e);
                self.host.session_status(SessionStatus::Disconnected);
                Err(e)
            }
        }
    }

    /// Close the connection if one is open
    pub fn stop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        if let Err(e) = self.engine.close_session(&session).step(Step::CloseSession) {
            tracing::debug!("Closing session {} failed: {}", session.id, e);
        }
        self.is_sync = false;
        self.probe_ok = false;
        self.loaded_assets.clear();
        tracing::info!("Session {} stopped", session.id);
        self.host.session_status(SessionStatus::Disconnected);
    }

    /// Tear down all per-session state and reset every node.
    ///
    /// Safe to repeat: a second call finds no session and no running tasks
    /// and leaves the same end state.
    pub fn invalidate(&mut self, nodes: &mut NodeRegistry) {
        self.restore_frame_rate();
        self.host.async_status(None);
        self.host.main_progress(None);

        if let Some(session) = self.session.take() {
            let _ = self.engine.close_session(&session);
            tracing::info!("Session {} invalidated", session.id);
        }
        self.is_sync = false;
        self.probe_ok = false;
        self.loaded_assets.clear();
        self.tasks.reset();
        self.since_probe = Duration::ZERO;

        self.epoch += 1;
        self.invalidations += 1;
        nodes.invalidate_all();
        self.host.session_status(SessionStatus::Disconnected);
    }

    /// Probe the session if the liveness interval elapsed
    pub fn poll_liveness(&mut self, elapsed: Duration) -> Liveness {
        let Some(session) = self.session else {
            return Liveness::NoSession;
        };
        self.since_probe += elapsed;
        if self.since_probe < self.liveness_interval {
            return Liveness::NotDue;
        }
        self.since_probe = Duration::ZERO;

        // Any failing probe means the session is gone, whatever the code
        match self.engine.is_session_valid(&session).step(Step::Probe) {
            Ok(()) => {
                self.probe_ok = true;
                Liveness::Alive
            }
            Err(e) => {
                tracing::error!("Session {} failed its liveness probe: {}", session.id, e);
                self.probe_ok = false;
                Liveness::Lost
            }
        }
    }

    pub fn mark_loaded(&mut self, asset: AssetId) {
        self.loaded_assets.insert(asset);
    }

    pub fn is_loaded(&self, asset: AssetId) -> bool {
        self.loaded_assets.contains(&asset)
    }

    /// Count an asynchronous operation and show its status line
    pub fn begin_task(&mut self, status: impl Into<String>) {
        self.tasks.start();
        self.host.async_status(Some(status.into()));
    }

    pub fn finish_task(&mut self) {
        self.tasks.finish();
        if self.tasks.is_idle() {
            self.host.async_status(None);
        }
    }

    pub fn limit_frame_rate(&mut self, max_fps: f32) {
        if self.frame_limited {
            return;
        }
        self.frame_limited = true;
        self.host.send(HostMessage::LimitFrameRate(max_fps));
    }

    pub fn restore_frame_rate(&mut self) {
        if !self.frame_limited {
            return;
        }
        self.frame_limited = false;
        self.host.send(HostMessage::RestoreFrameRate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineSettings;
    use crate::engine::mock::{MockCall, MockEngine};
    use crate::engine::ResultCode;
    use crossbeam_channel::{bounded, Receiver};

    fn manager(engine: Arc<MockEngine>) -> (SessionManager, Receiver<HostMessage>) {
        let (tx, rx) = bounded(256);
        let manager = SessionManager::new(engine, Duration::from_secs(1), HostSender::new(tx));
        (manager, rx)
    }

    fn options() -> ConnectOptions {
        let mut settings = EngineSettings::default();
        settings.sync_retry_interval_ms = 1;
        ConnectOptions::from_settings(&settings)
    }

    #[test]
    fn test_start_launch_and_stop() {
        let engine = Arc::new(MockEngine::new());
        let (mut session, _rx) = manager(engine.clone());
        let mut nodes = NodeRegistry::new();

        session.start(StartMode::Launch, &options(), &mut nodes).unwrap();
        assert!(session.is_usable());
        assert!(!session.is_sync());

        session.stop();
        session.stop();
        assert!(!session.is_usable());
        assert!(!engine.has_session());
        assert_eq!(engine.call_count(MockCall::CloseSession), 1);
    }

    #[test]
    fn test_sync_start_is_noop_when_valid() {
        let engine = Arc::new(MockEngine::new());
        engine.publish_session(SYNC_SESSION_NAME);
        let (mut session, _rx) = manager(engine.clone());
        let mut nodes = NodeRegistry::new();

        session.start(StartMode::Sync, &options(), &mut nodes).unwrap();
        let first = session.handle();
        session.start(StartMode::Sync, &options(), &mut nodes).unwrap();
        assert_eq!(session.handle(), first);
        assert_eq!(session.invalidations(), 0);
    }

    #[test]
    fn test_restart_invalidates_nodes() {
        let engine = Arc::new(MockEngine::new());
        let (mut session, _rx) = manager(engine.clone());
        let mut nodes = NodeRegistry::new();
        let key = nodes.register("rock", AssetId(0));

        session.start(StartMode::Launch, &options(), &mut nodes).unwrap();
        nodes.get_mut(key).unwrap().remote_id = crate::engine::RemoteNodeId(3);
        session.start(StartMode::Launch, &options(), &mut nodes).unwrap();
        assert!(!nodes.get(key).unwrap().is_instantiated());
        assert_eq!(session.invalidations(), 1);
    }

    #[test]
    fn test_failed_start_leaves_no_session() {
        let engine = Arc::new(MockEngine::new());
        engine.fail_next(MockCall::Initialize, ResultCode::Failure);
        let (mut session, _rx) = manager(engine.clone());
        let mut nodes = NodeRegistry::new();

        let err = session.start(StartMode::Launch, &options(), &mut nodes).unwrap_err();
        assert_eq!(err.step(), Some(Step::Initialize));
        assert!(session.handle().is_none());
        assert!(!engine.has_session());
    }

    #[test]
    fn test_invalidate_twice_same_state() {
        let engine = Arc::new(MockEngine::new());
        let (mut session, _rx) = manager(engine);
        let mut nodes = NodeRegistry::new();
        session.start(StartMode::Launch, &options(), &mut nodes).unwrap();
        session.begin_task("busy");
        session.mark_loaded(AssetId(0));

        session.invalidate(&mut nodes);
        let tasks = session.tasks().count();
        let loaded = session.is_loaded(AssetId(0));
        session.invalidate(&mut nodes);
        assert_eq!(session.tasks().count(), tasks);
        assert_eq!(session.tasks().count(), 0);
        assert_eq!(session.is_loaded(AssetId(0)), loaded);
        assert!(session.handle().is_none());
    }

    #[test]
    fn test_liveness_cadence() {
        let engine = Arc::new(MockEngine::new());
        let (mut session, _rx) = manager(engine.clone());
        let mut nodes = NodeRegistry::new();
        assert_eq!(session.poll_liveness(Duration::from_secs(5)), Liveness::NoSession);

        session.start(StartMode::Launch, &options(), &mut nodes).unwrap();
        assert_eq!(session.poll_liveness(Duration::from_millis(400)), Liveness::NotDue);
        assert_eq!(session.poll_liveness(Duration::from_millis(400)), Liveness::NotDue);
        assert_eq!(engine.call_count(MockCall::ProbeSession), 0);
        assert_eq!(session.poll_liveness(Duration::from_millis(400)), Liveness::Alive);

        engine.kill_session();
        assert_eq!(session.poll_liveness(Duration::from_secs(1)), Liveness::Lost);
        assert!(!session.is_usable());
    }

    #[test]
    fn test_frame_rate_limit_is_paired() {
        let engine = Arc::new(MockEngine::new());
        let (mut session, rx) = manager(engine);
        session.limit_frame_rate(12.0);
        session.limit_frame_rate(12.0);
        session.restore_frame_rate();
        session.restore_frame_rate();
        let messages: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            messages,
            vec![HostMessage::LimitFrameRate(12.0), HostMessage::RestoreFrameRate]
        );
    }

    #[test]
    fn test_allow_edit_requires_library_and_idle() {
        let engine = Arc::new(MockEngine::new());
        let (mut session, _rx) = manager(engine.clone());
        assert!(session.allow_edit());
        session.begin_task("Start Cook");
        assert!(!session.allow_edit());
        session.finish_task();
        session.finish_task();
        assert!(session.allow_edit());
        engine.set_library_loaded(false);
        assert!(!session.allow_edit());
    }
}

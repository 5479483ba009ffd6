//! Cook scheduler
//!
//! The [`Scheduler`] is driven by the host's per-frame tick. Each tick it
//!
//! 1. applies finished worker jobs,
//! 2. returns early while any remote task is in flight,
//! 3. probes session liveness on its own cadence,
//! 4. picks the first node (in registration order) with a cook request and
//!    either starts a session or admits that node's pipeline.
//!
//! At most one pipeline is in flight at any time, and edits are refused with
//! [`CookError::Busy`] while one is.
//!
//! [`CookBackend`] wraps a scheduler in a command loop for hosts that would
//! rather talk to it over channels from another thread.

pub mod backend;
pub mod pool;

pub use backend::CookBackend;
pub use pool::WorkerPool;

use crate::asset::AssetId;
use crate::bridge::{HostMessage, HostSender, NodeEvent, SessionStatus};
use crate::config::{EngineSettings, Preset};
use crate::context::CookContext;
use crate::engine::status::{RemoteResultExt, Step};
use crate::engine::{ParmValue, RemoteEngine, SessionHandle, Transform};
use crate::error::{CookError, Result};
use crate::node::delta::{trigger_by_input, trigger_by_parameter};
use crate::node::input::{InputBuilders, InputSource};
use crate::node::{CookRequest, Node, NodeKey, NodeRegistry};
use crate::output::{HostScene, OutputBuilders};
use crate::pipeline::{self, Continuation, Dispatch, Job, JobOutput};
use crate::session::{ConnectOptions, Liveness, SessionManager, StartMode};
use crossbeam_channel::{bounded, Receiver};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Capacity of the scheduler to host message queue
pub const HOST_QUEUE_CAPACITY: usize = 10_000;

/// Wait before retrying a failed automatic session start
pub const SESSION_RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Capacity of the worker result queue; at most one job is in flight
const RESULT_QUEUE_CAPACITY: usize = 16;

pub struct Scheduler {
    ctx: CookContext,
    pool: WorkerPool,
    continuations: Receiver<Continuation>,
    connect: ConnectOptions,
    /// Mode used when a cook request starts a session
    auto_start: StartMode,
    /// Set when the engine cannot be used at all; blocks automatic starts
    configuration_error: Option<String>,
    start_backoff: Duration,
}

impl Scheduler {
    /// Create a scheduler and the receiver for its host messages
    pub fn new(
        engine: Arc<dyn RemoteEngine>,
        settings: EngineSettings,
        scene: Box<dyn HostScene>,
    ) -> Result<(Self, Receiver<HostMessage>)> {
        let (tx, rx) = bounded(HOST_QUEUE_CAPACITY);
        let scheduler = Self::with_host(engine, settings, scene, HostSender::new(tx))?;
        Ok((scheduler, rx))
    }

    /// Create a scheduler that reports through an existing host sender
    pub fn with_host(
        engine: Arc<dyn RemoteEngine>,
        settings: EngineSettings,
        scene: Box<dyn HostScene>,
        host: HostSender,
    ) -> Result<Self> {
        settings.validate()?;
        let (results_tx, results_rx) = bounded(RESULT_QUEUE_CAPACITY);
        let pool = WorkerPool::new(Arc::clone(&engine), settings.worker_threads, results_tx)?;
        let connect = ConnectOptions::from_settings(&settings);
        Ok(Self {
            ctx: CookContext::new(engine, settings, scene, host),
            pool,
            continuations: results_rx,
            connect,
            auto_start: StartMode::Launch,
            configuration_error: None,
            start_backoff: Duration::ZERO,
        })
    }

    // Registration and queries

    pub fn register_asset(&mut self, name: &str, path: Option<PathBuf>, buffer: Vec<u8>) -> AssetId {
        let id = self.ctx.assets.register(name, path, buffer);
        tracing::debug!("Registered asset library '{}' as {:?}", name, id);
        id
    }

    /// Register a node backed by the library named `asset`
    pub fn register_node(&mut self, name: &str, asset: &str, operator: Option<&str>) -> Result<NodeKey> {
        let asset_id = self.ctx.assets.find_by_name(asset).ok_or_else(|| {
            CookError::Configuration(format!("unknown asset library '{}'", asset))
        })?;
        let key = self.ctx.nodes.register(name, asset_id);
        if let Some(operator) = operator {
            self.ctx.nodes.node_mut(key)?.operator = operator.to_string();
        }
        tracing::debug!("Registered node '{}' as {}", name, key);
        Ok(key)
    }

    pub fn node(&self, key: NodeKey) -> Option<&Node> {
        self.ctx.nodes.get(key)
    }

    pub fn find_node(&self, name: &str) -> Option<NodeKey> {
        self.ctx.nodes.find_by_name(name)
    }

    pub fn nodes(&self) -> &NodeRegistry {
        &self.ctx.nodes
    }

    pub fn context(&self) -> &CookContext {
        &self.ctx
    }

    pub fn session(&self) -> &SessionManager {
        &self.ctx.session
    }

    pub fn host(&self) -> &HostSender {
        self.ctx.host()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.ctx.settings
    }

    pub fn input_builders_mut(&mut self) -> &mut InputBuilders {
        &mut self.ctx.inputs
    }

    pub fn output_builders_mut(&mut self) -> &mut OutputBuilders {
        &mut self.ctx.outputs
    }

    /// Session mode used when a cook request finds no session
    pub fn set_auto_start(&mut self, mode: StartMode) {
        self.auto_start = mode;
    }

    pub fn configuration_error(&self) -> Option<&str> {
        self.configuration_error.as_deref()
    }

    /// No remote work in flight and the engine library is available
    pub fn allow_edit(&self) -> bool {
        self.ctx.session.allow_edit()
    }

    pub fn is_session_valid(&self) -> bool {
        self.ctx.session.is_usable()
    }

    // Edits

    fn ensure_edit(&self, what: &str) -> Result<()> {
        if !self.ctx.session.engine().is_library_loaded() {
            return Err(CookError::Configuration(
                "compute engine client library is not available".to_string(),
            ));
        }
        if !self.ctx.session.allow_edit() {
            return Err(CookError::Busy(what.to_string()));
        }
        Ok(())
    }

    pub fn request_cook(&mut self, key: NodeKey, method: CookRequest) -> Result<()> {
        let node = self.ctx.nodes.node_mut(key)?;
        match method {
            CookRequest::None => node.cook_request = CookRequest::None,
            CookRequest::Requested => node.request_cook(),
            CookRequest::Forced => node.force_cook(),
        }
        Ok(())
    }

    /// Edit a parameter. Returns false when the value is unchanged.
    ///
    /// Values for nodes that are not instantiated yet are kept and pushed on
    /// the first pipeline run.
    pub fn set_parameter(&mut self, key: NodeKey, name: &str, value: ParmValue) -> Result<bool> {
        self.ensure_edit("set parameter")?;
        let node = self.ctx.nodes.node_mut(key)?;

        let previous = match node.parameters.iter_mut().find(|p| p.name == name) {
            Some(parm) if parm.value == value => return Ok(false),
            Some(parm) => {
                parm.dirty = true;
                Some(std::mem::replace(&mut parm.value, value.clone()))
            }
            None => None,
        };

        match previous {
            Some(previous) => trigger_by_parameter(node, name, &previous, &value),
            None if !node.is_instantiated() => {
                node.pending_preset
                    .get_or_insert_with(Preset::new)
                    .values
                    .insert(name.to_string(), value);
                node.request_cook();
            }
            None => {
                return Err(CookError::ParameterNotFound {
                    node: node.label.clone(),
                    name: name.to_string(),
                })
            }
        }
        Ok(true)
    }

    /// Bind a source to a named input. Returns false when it was already bound.
    pub fn bind_input(&mut self, key: NodeKey, input: &str, source: InputSource) -> Result<bool> {
        self.ensure_edit("bind input")?;
        if !self.ctx.nodes.bind_input(key, input, source)? {
            return Ok(false);
        }
        let cook_on_input_changed = self.ctx.settings.cook_on_input_changed;
        let node = self.ctx.nodes.node_mut(key)?;
        match node.find_input(input) {
            Some(index) => trigger_by_input(node, index, cook_on_input_changed),
            None if cook_on_input_changed => node.request_cook(),
            None => {}
        }
        Ok(true)
    }

    /// Pick another operator from the node's library. Rebuilds on the next run.
    pub fn select_operator(&mut self, key: NodeKey, operator: &str) -> Result<bool> {
        self.ensure_edit("select operator")?;
        let node = self.ctx.nodes.node_mut(key)?;
        if !node.available_operators.is_empty() && !node.available_operators.iter().any(|op| op == operator) {
            return Err(CookError::UnknownOperator(operator.to_string()));
        }
        Ok(node.select_operator(operator))
    }

    /// Move a node. Returns false when the transform is unchanged.
    pub fn set_transform(&mut self, key: NodeKey, transform: Transform) -> Result<bool> {
        self.ensure_edit("set transform")?;
        let node = self.ctx.nodes.node_mut(key)?;
        if node.last_transform == transform {
            return Ok(false);
        }
        node.last_transform = transform;
        let object = node.object_id();

        if let (Some(session), true) = (self.ctx.session.handle(), object.is_valid()) {
            let pushed = self
                .ctx
                .session
                .engine()
                .set_object_transform(&session, object, &transform)
                .step(Step::Transform);
            if let Err(e) = pushed {
                return Err(self.remote_failure(e));
            }
        }
        Ok(true)
    }

    /// Apply a preset; values are pushed on the next pipeline run
    pub fn apply_preset(&mut self, key: NodeKey, preset: Preset) -> Result<()> {
        self.ensure_edit("apply preset")?;
        self.ctx.nodes.node_mut(key)?.apply_preset(preset);
        Ok(())
    }

    /// Save the node's operator and parameter values to `dir`
    pub fn save_preset(&self, key: NodeKey, dir: &Path) -> Result<PathBuf> {
        let node = self.ctx.nodes.node(key)?;
        let mut preset = Preset::new();
        if !node.operator.is_empty() {
            preset.operator = Some(node.operator.clone());
        }
        for parm in &node.parameters {
            preset.values.insert(parm.name.clone(), parm.value.clone());
        }
        let path = Preset::path_for(dir, &node.name);
        preset.save(&path)?;
        tracing::debug!("{}: saved preset to {}", node.label, path.display());
        Ok(path)
    }

    /// Load the node's preset from `dir` and apply it
    pub fn load_preset(&mut self, key: NodeKey, dir: &Path) -> Result<()> {
        let name = self.ctx.nodes.node(key)?.name.clone();
        let preset = Preset::load(Preset::path_for(dir, &name))?;
        self.apply_preset(key, preset)
    }

    /// Unregister a node and delete its remote resources
    pub fn destroy_node(&mut self, key: NodeKey) -> Result<()> {
        self.ensure_edit("destroy node")?;
        let mut node = self
            .ctx
            .nodes
            .unregister(key)
            .ok_or(CookError::NodeNotFound(key))?;
        self.ctx.host().node_event(key, &node.name, NodeEvent::Destroy);
        if let Ok(asset) = self.ctx.assets.get_mut(node.asset) {
            asset.unregister(key);
        }

        if let Some(session) = self.ctx.session.handle() {
            let mut doomed = node.input_node_ids();
            if node.deletion_root().is_valid() {
                doomed.insert(0, node.deletion_root());
            }
            let engine = self.ctx.engine();
            for remote in doomed {
                if let Err(e) = engine.delete_node(&session, remote).step(Step::DeleteNode) {
                    if e.is_session_lost() {
                        self.remote_failure(e);
                        break;
                    }
                    tracing::warn!("{}: could not delete {}: {}", node.label, remote, e);
                }
            }
        }

        for entity in node.split_instances.values() {
            self.ctx.scene.destroy_entity(entity);
        }
        node.invalidate();
        tracing::debug!("Destroyed node '{}'", node.name);
        Ok(())
    }

    pub fn set_cook_on_parameter_changed(&mut self, key: NodeKey, enabled: bool) -> Result<()> {
        let node = self.ctx.nodes.node_mut(key)?;
        if node.set_cook_on_parameter_changed(enabled) {
            let name = node.name.clone();
            self.ctx.host().node_event(key, &name, NodeEvent::RefreshUiOnly);
        }
        Ok(())
    }

    pub fn set_cook_on_upstream_changed(&mut self, key: NodeKey, enabled: bool) -> Result<()> {
        let node = self.ctx.nodes.node_mut(key)?;
        if node.set_cook_on_upstream_changed(enabled) {
            let name = node.name.clone();
            self.ctx.host().node_event(key, &name, NodeEvent::RefreshUiOnly);
        }
        Ok(())
    }

    // Session control

    /// Start a session on the calling thread. Clears a recorded configuration error.
    pub fn start_session(&mut self, mode: StartMode) -> Result<()> {
        self.configuration_error = None;
        self.start_backoff = Duration::ZERO;
        let result = self
            .ctx
            .session
            .start(mode, &self.connect, &mut self.ctx.nodes);
        if let Err(CookError::Configuration(msg)) = &result {
            self.configuration_error = Some(msg.clone());
        }
        result
    }

    /// Close the session and reset every node
    pub fn stop_session(&mut self) {
        if self.ctx.session.handle().is_some() {
            self.ctx.invalidate();
        }
    }

    /// Run the invalidation sweep
    pub fn invalidate(&mut self) {
        self.ctx.invalidate();
    }

    /// Allow automatic session starts again after a configuration error
    pub fn clear_configuration_error(&mut self) {
        self.configuration_error = None;
    }

    /// Close the session on the way out
    pub fn shutdown(&mut self) {
        self.ctx.session.restore_frame_rate();
        self.ctx.session.stop();
    }

    // Tick

    /// Advance the scheduler by `dt` of wall time. Never blocks on the engine
    /// beyond the liveness probe.
    pub fn tick(&mut self, dt: Duration) {
        self.drain_continuations();
        if !self.ctx.session.tasks().is_idle() {
            return;
        }

        if self.ctx.session.poll_liveness(dt) == Liveness::Lost {
            self.session_lost("the engine stopped responding");
            return;
        }

        let Some(key) = self.ctx.nodes.first_needing_cook() else {
            return;
        };
        if self.ctx.session.handle().is_none() {
            self.request_session(dt);
            return;
        }
        pipeline::admit(&mut self.ctx, &self.pool, key);
    }

    /// Nothing in flight and nothing that could start
    pub fn is_idle(&self) -> bool {
        self.ctx.session.tasks().is_idle()
            && (self.configuration_error.is_some() || self.ctx.nodes.first_needing_cook().is_none())
    }

    /// Tick until idle or until `timeout` passes. Returns true when idle.
    pub fn run_until_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut last = Instant::now();
        loop {
            let now = Instant::now();
            self.tick(now - last);
            last = now;
            if self.is_idle() {
                return true;
            }
            if now >= deadline {
                tracing::warn!("Scheduler still busy after {:?}", timeout);
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn drain_continuations(&mut self) {
        while let Ok(continuation) = self.continuations.try_recv() {
            let Continuation { node, epoch, output } = continuation;
            match output {
                JobOutput::Session { mode, result } => self.on_session(epoch, mode, result),
                output => pipeline::resume(&mut self.ctx, &self.pool, Continuation { node, epoch, output }),
            }
        }
    }

    fn request_session(&mut self, dt: Duration) {
        if self.configuration_error.is_some() {
            return;
        }
        if self.start_backoff > dt {
            self.start_backoff -= dt;
            return;
        }
        self.start_backoff = Duration::ZERO;

        if !self.ctx.session.engine().is_library_loaded() {
            self.configuration_failed("compute engine client library is not available".to_string());
            return;
        }

        let epoch = self.ctx.session.epoch();
        self.ctx.session.begin_task("Starting session");
        self.ctx.host().session_status(SessionStatus::Connecting);
        let job = Job::StartSession {
            mode: self.auto_start,
            options: self.connect.clone(),
            host: self.ctx.host().clone(),
        };
        self.pool.dispatch(None, epoch, job);
    }

    fn on_session(&mut self, epoch: u64, mode: StartMode, result: Result<SessionHandle>) {
        if epoch != self.ctx.session.epoch() {
            if let Ok(session) = result {
                tracing::debug!("Closing session {} started before an invalidation", session.id);
                let _ = self.ctx.session.engine().close_session(&session);
            }
            return;
        }
        self.ctx.session.finish_task();

        match result {
            Ok(session) => self.ctx.session.install(session, mode == StartMode::Sync),
            Err(CookError::Configuration(msg)) => self.configuration_failed(msg),
            Err(e) => {
                tracing::error!("Failed to start session: {}", e);
                self.ctx.host().session_status(SessionStatus::Disconnected);
                self.ctx.host().notify(format!("Failed to start session: {}", e));
                self.start_backoff = SESSION_RETRY_BACKOFF;
            }
        }
    }

    fn configuration_failed(&mut self, msg: String) {
        tracing::error!("Configuration error: {}", msg);
        self.ctx.host().notify(format!("Configuration error: {}", msg));
        self.ctx.host().session_status(SessionStatus::Disconnected);
        self.configuration_error = Some(msg);
    }

    fn session_lost(&mut self, reason: &str) {
        tracing::error!("Session lost: {}", reason);
        self.ctx.host().notify(format!("Session lost: {}", reason));
        self.ctx.invalidate();
        self.ctx.host().session_status(SessionStatus::Lost);
    }

    /// Invalidate on session loss and hand the error back
    fn remote_failure(&mut self, err: CookError) -> CookError {
        if err.is_session_lost() {
            self.session_lost(&err.to_string());
        }
        err
    }
}

//! Worker-side pipeline jobs
//!
//! A [`Job`] carries owned copies of everything its remote calls need, so it
//! can run on any worker thread without touching node or session state. The
//! result comes back as a [`Continuation`] that the driver applies on the
//! scheduling thread.

use crate::asset::{load_library, LibrarySource, LoadedLibrary};
use crate::bridge::HostSender;
use crate::engine::status::{RemoteResultExt, Step};
use crate::engine::strings::{remote_node_name, resolve_batch, resolve_ordered};
use crate::engine::{
    RemoteCookState, RemoteEngine, RemoteNodeId, ResultCode, SessionHandle, StringHandle,
    Transform,
};
use crate::error::{CookError, Result};
use crate::node::NodeKey;
use crate::output::PartDesc;
use crate::session::{connect, ConnectOptions, StartMode};
use std::time::{Duration, Instant};

/// Delay between cook state polls
const COOK_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Blocking remote work dispatched to a worker
#[derive(Debug)]
pub enum Job {
    StartSession {
        mode: StartMode,
        options: ConnectOptions,
        host: HostSender,
    },
    Instantiate(InstantiateJob),
    Cook(CookJob),
}

impl Job {
    /// Run the job to completion. Never panics on remote failure.
    pub fn run(self, engine: &dyn RemoteEngine) -> JobOutput {
        match self {
            Job::StartSession { mode, options, host } => JobOutput::Session {
                mode,
                result: connect(engine, &options, mode, &host),
            },
            Job::Instantiate(job) => {
                let (result, released_previous) = job.run_tracked(engine);
                JobOutput::Instantiated {
                    result,
                    released_previous,
                }
            }
            Job::Cook(job) => {
                let round = job.round;
                JobOutput::Cooked {
                    round,
                    result: job.run(engine),
                }
            }
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            Job::StartSession { mode, .. } => JobKind::StartSession(*mode),
            Job::Instantiate(_) => JobKind::Instantiate,
            Job::Cook(job) => JobKind::Cook(job.round),
        }
    }
}

/// Shape of a job, kept by the dispatcher in case the job never reports back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    StartSession(StartMode),
    Instantiate,
    Cook(u8),
}

impl JobKind {
    /// Output reporting that a job of this kind failed with `err`
    pub fn failed(self, err: CookError) -> JobOutput {
        match self {
            JobKind::StartSession(mode) => JobOutput::Session {
                mode,
                result: Err(err),
            },
            JobKind::Instantiate => JobOutput::Instantiated {
                result: Err(err),
                released_previous: false,
            },
            JobKind::Cook(round) => JobOutput::Cooked {
                round,
                result: Err(err),
            },
        }
    }
}

/// Result of a job, failures included
#[derive(Debug)]
pub enum JobOutput {
    Session {
        mode: StartMode,
        result: Result<SessionHandle>,
    },
    Instantiated {
        result: Result<Instantiated>,
        /// The previous instantiation was deleted before the job stopped
        released_previous: bool,
    },
    Cooked {
        /// 0 for the first cook of a run, 1 for the re-cook after new inputs
        round: u8,
        result: Result<Cooked>,
    },
}

/// A finished job on its way back to the scheduling thread
#[derive(Debug)]
pub struct Continuation {
    /// Node the job ran for. `None` for session jobs.
    pub node: Option<NodeKey>,
    /// Session epoch at dispatch time
    pub epoch: u64,
    pub output: JobOutput,
}

/// Everything needed to (re)create a node's remote instantiation
#[derive(Debug, Clone)]
pub struct InstantiateJob {
    pub session: SessionHandle,
    pub sync: bool,
    pub label: String,
    pub key: NodeKey,
    /// Set when the library must be loaded first
    pub library: Option<LibrarySource>,
    pub available_operators: Vec<String>,
    pub operator: String,
    /// Remote nodes of the previous instantiation, deleted first
    pub previous_roots: Vec<RemoteNodeId>,
    pub transform: Transform,
}

/// Successful instantiation
#[derive(Debug, Clone, PartialEq)]
pub struct Instantiated {
    pub loaded: Option<LoadedLibrary>,
    pub operator: String,
    pub remote_id: RemoteNodeId,
    pub geo_id: RemoteNodeId,
    pub label: String,
    pub help: String,
    pub help_url: String,
    pub geo_input_count: u32,
    pub elapsed: Duration,
}

impl InstantiateJob {
    pub fn run(self, engine: &dyn RemoteEngine) -> Result<Instantiated> {
        self.run_tracked(engine).0
    }

    /// Run the job and report whether the previous roots were deleted.
    ///
    /// Library loading and operator selection happen first; a failure there
    /// leaves the previous instantiation untouched.
    pub fn run_tracked(self, engine: &dyn RemoteEngine) -> (Result<Instantiated>, bool) {
        let started = Instant::now();
        match self.prepare(engine) {
            Ok((loaded, operator)) => (self.create(engine, loaded, operator, started), true),
            Err(e) => (Err(e), false),
        }
    }

    /// Load the library if needed and pick the operator to create
    fn prepare(&self, engine: &dyn RemoteEngine) -> Result<(Option<LoadedLibrary>, String)> {
        let loaded = match &self.library {
            Some(source) => Some(load_library(engine, &self.session, source)?),
            None => None,
        };
        let operators = loaded
            .as_ref()
            .map(|l| l.operators.as_slice())
            .unwrap_or(self.available_operators.as_slice());

        let operator = if operators.iter().any(|op| *op == self.operator) {
            self.operator.clone()
        } else {
            let Some(first) = operators.first() else {
                let library = self.library.as_ref().map(|l| l.name.as_str()).unwrap_or("");
                return Err(CookError::NoOperators(library.to_string()));
            };
            if !self.operator.is_empty() {
                tracing::warn!(
                    "{}: operator '{}' not found, using '{}'",
                    self.label,
                    self.operator,
                    first
                );
            }
            first.clone()
        };
        Ok((loaded, operator))
    }

    /// Delete the previous roots and create the new instantiation
    fn create(
        &self,
        engine: &dyn RemoteEngine,
        loaded: Option<LoadedLibrary>,
        operator: String,
        started: Instant,
    ) -> Result<Instantiated> {
        let session = self.session;
        for root in &self.previous_roots {
            match engine.delete_node(&session, *root).step(Step::DeleteNode) {
                Ok(()) => {}
                Err(e) if e.is_session_lost() => return Err(e),
                Err(e) => tracing::warn!("{}: could not delete {}: {}", self.label, root, e),
            }
        }

        let name = remote_node_name(&operator, self.key.0);
        let remote_id = engine
            .create_node(&session, &operator, &name)
            .step(Step::Instantiate)?;

        let info = match engine.asset_info(&session, remote_id).step(Step::AssetInfo) {
            Ok(info) => info,
            Err(e) => {
                if !e.is_session_lost() {
                    // The container was created but the node is unusable
                    if let Ok(orphan) = engine.node_by_path(&session, &format!("/obj/{}", name)) {
                        let _ = engine.delete_node(&session, orphan);
                    }
                }
                return Err(e.with_context(format!("{} ({})", self.label, operator)));
            }
        };

        let geo_id = if info.is_geometry_operator {
            info.object_node_id
        } else {
            RemoteNodeId::NONE
        };
        let object = if geo_id.is_valid() { geo_id } else { remote_id };

        match self.finish(engine, object, &info.label, &info.help, &info.help_url) {
            Ok((label, help, help_url)) => {
                let elapsed = started.elapsed();
                tracing::info!("{}: INSTANTIATE {:.3} (s)", self.label, elapsed.as_secs_f64());
                Ok(Instantiated {
                    loaded,
                    operator,
                    remote_id,
                    geo_id,
                    label,
                    help,
                    help_url,
                    geo_input_count: info.geo_input_count,
                    elapsed,
                })
            }
            Err(e) => {
                if !e.is_session_lost() {
                    let _ = engine.delete_node(&session, object);
                }
                Err(e)
            }
        }
    }

    /// Display flag, metadata and transform of the fresh instantiation
    fn finish(
        &self,
        engine: &dyn RemoteEngine,
        object: RemoteNodeId,
        label: &StringHandle,
        help: &StringHandle,
        help_url: &StringHandle,
    ) -> Result<(String, String, String)> {
        if self.sync {
            engine
                .set_display(&self.session, object, false)
                .step(Step::Display)?;
        }

        let mut texts = resolve_ordered(engine, &self.session, &[*label, *help, *help_url])?.into_iter();
        let mut next = || texts.next().unwrap_or_default();
        let resolved = (next(), next(), next());

        if !self.transform.is_identity() {
            engine
                .set_object_transform(&self.session, object, &self.transform)
                .step(Step::Transform)?;
        }
        Ok(resolved)
    }
}

/// One cook round of an instantiated node
#[derive(Debug, Clone)]
pub struct CookJob {
    pub session: SessionHandle,
    pub label: String,
    pub node: RemoteNodeId,
    /// Forward the engine status text while polling
    pub verbose: bool,
    pub host: HostSender,
    pub round: u8,
}

/// Successful cook with its output parts
#[derive(Debug, Clone, PartialEq)]
pub struct Cooked {
    pub parts: Vec<PartDesc>,
    pub elapsed: Duration,
}

impl CookJob {
    pub fn run(self, engine: &dyn RemoteEngine) -> Result<Cooked> {
        let started = Instant::now();
        let session = self.session;

        let mut targets = engine
            .cook_targets(&session, self.node)
            .step(Step::Cook)?;
        if targets.is_empty() {
            targets.push(self.node);
        }
        for target in &targets {
            engine.cook_node(&session, *target).step(Step::Cook)?;
        }

        self.wait(engine)?;
        let parts = self.read_outputs(engine)?;

        let elapsed = started.elapsed();
        tracing::info!("{}: COOK {:.3} (s)", self.label, elapsed.as_secs_f64());
        Ok(Cooked { parts, elapsed })
    }

    fn wait(&self, engine: &dyn RemoteEngine) -> Result<()> {
        loop {
            let state = engine.cook_state(&self.session).step(Step::Cook)?;
            match state {
                RemoteCookState::Ready => return Ok(()),
                RemoteCookState::ReadyWithErrors => {
                    let status = engine.status_text(&self.session).unwrap_or_default();
                    tracing::warn!("{}: cooked with errors: {}", self.label, status);
                    return Ok(());
                }
                RemoteCookState::ReadyWithFatalErrors => {
                    let status = engine.status_text(&self.session).unwrap_or_default();
                    return Err(CookError::Remote {
                        step: Step::Cook,
                        code: ResultCode::Failure,
                    }
                    .with_context(format!("{}: {}", self.label, status)));
                }
                RemoteCookState::Cooking | RemoteCookState::Loading => {
                    if self.verbose {
                        if let Ok(status) = engine.status_text(&self.session) {
                            if !status.is_empty() {
                                self.host
                                    .async_status(Some(format!("{}: {}", self.label, status)));
                            }
                        }
                    }
                    std::thread::sleep(COOK_POLL_INTERVAL);
                }
            }
        }
    }

    fn read_outputs(&self, engine: &dyn RemoteEngine) -> Result<Vec<PartDesc>> {
        let geos = engine
            .output_geos(&self.session, self.node)
            .step(Step::ReadOutputs)?;

        let mut raw = Vec::new();
        for geo in &geos {
            for index in 0..geo.part_count {
                let part = engine
                    .part_info(&self.session, geo.node_id, index)
                    .step(Step::ReadOutputs)?;
                raw.push((geo, part));
            }
        }

        let mut handles: Vec<StringHandle> = geos.iter().map(|g| g.name).collect();
        for (_, part) in &raw {
            handles.push(part.name);
            handles.push(part.split_value);
        }
        let names = resolve_batch(engine, &self.session, &handles)?;
        let text = |h: &StringHandle| names.get(h).cloned().unwrap_or_default();

        Ok(raw
            .into_iter()
            .map(|(geo, part)| PartDesc {
                geo: geo.node_id,
                geo_name: text(&geo.name),
                index: part.index,
                name: text(&part.name),
                kind: part.kind,
                point_count: part.point_count,
                split_value: (!part.split_value.is_null()).then(|| text(&part.split_value)),
            })
            .collect())
    }
}

//! Mock Engine Implementation for Testing
//!
//! This module provides a simulated compute engine that runs in process. It
//! keeps a small node graph, a string table and a call log, and lets tests
//! inject failures, kill the session, or make cooks discover new inputs.
//!
//! # Features
//!
//! - **Operator definitions**: parameters, geometry inputs and output parts per operator
//! - **Asset libraries**: registered by file path or by buffer contents
//! - **Failure injection**: fail the next call of a kind with any [`ResultCode`]
//! - **Session loss**: [`MockEngine::kill_session`] drops the remote state like a crashed process
//! - **Late-bound inputs**: a cook can set an operator-path parameter on its node
//! - **Concurrency tracking**: the peak number of overlapping instantiate/cook calls
//!
//! # Example
//!
//! ```ignore
//! use cookbridge::engine::mock::{MockEngine, MockOperator};
//!
//! let engine = MockEngine::new()
//!     .with_library_file("/assets/shapes.lib", vec![MockOperator::new("Sop/sphere")]);
//! ```

use super::{
    AssetInfo, GeoInfo, LibraryId, ParmInfo, ParmValue, PartInfo, PartKind, RemoteCookState,
    RemoteEngine, RemoteNodeId, RemoteResult, ResultCode, ServerOptions, SessionHandle,
    SessionKind, StringHandle, SubPipelineInfo, Transform,
};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Kinds of calls recorded by the mock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockCall {
    StartServer,
    LaunchInteractive,
    CreateSession,
    Initialize,
    ServerEnv,
    CloseSession,
    ProbeSession,
    LoadLibraryFile,
    LoadLibraryBuffer,
    ListOperators,
    CreateNode,
    DeleteNode,
    NodeByPath,
    AssetInfo,
    SetDisplay,
    SetTransform,
    SubPipelines,
    Parameters,
    SetParameter,
    ConnectInput,
    DisconnectInput,
    CreateInputNode,
    SetInputPayload,
    SetDelta,
    CookTargets,
    CookNode,
    CookState,
    StatusText,
    OutputGeos,
    PartInfo,
    ResolveStrings,
}

/// Output part produced by a mock operator
#[derive(Debug, Clone, PartialEq)]
pub struct MockPart {
    pub name: String,
    pub kind: PartKind,
    pub point_count: u32,
    pub split_value: Option<String>,
}

impl MockPart {
    pub fn mesh(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: PartKind::Mesh,
            point_count: 8,
            split_value: None,
        }
    }

    pub fn split(mut self, value: &str) -> Self {
        self.split_value = Some(value.to_string());
        self
    }
}

/// Operator definition inside a mock asset library
#[derive(Debug, Clone, PartialEq)]
pub struct MockOperator {
    pub name: String,
    pub parms: Vec<(String, ParmValue)>,
    pub geo_inputs: u32,
    pub geometry_operator: bool,
    pub parts: Vec<MockPart>,
    pub sub_pipelines: Vec<String>,
}

impl MockOperator {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            parms: Vec::new(),
            geo_inputs: 0,
            geometry_operator: true,
            parts: vec![MockPart::mesh("main")],
            sub_pipelines: Vec::new(),
        }
    }

    pub fn parm(mut self, name: &str, value: ParmValue) -> Self {
        self.parms.push((name.to_string(), value));
        self
    }

    /// Operator-path parameter, which the host sees as a node-typed input
    pub fn node_parm(self, name: &str) -> Self {
        self.parm(name, ParmValue::Node(RemoteNodeId::NONE))
    }

    pub fn geo_inputs(mut self, count: u32) -> Self {
        self.geo_inputs = count;
        self
    }

    /// Object-level operator that is not wrapped in a geometry container
    pub fn object_level(mut self) -> Self {
        self.geometry_operator = false;
        self
    }

    pub fn parts(mut self, parts: Vec<MockPart>) -> Self {
        self.parts = parts;
        self
    }

    pub fn sub_pipeline(mut self, name: &str) -> Self {
        self.sub_pipelines.push(name.to_string());
        self
    }
}

#[derive(Debug, Clone)]
struct MockParm {
    id: i32,
    name: String,
    value: ParmValue,
    default: ParmValue,
}

#[derive(Debug, Clone)]
struct MockNode {
    name: String,
    operator: Option<MockOperator>,
    parent: Option<i32>,
    parms: Vec<MockParm>,
    inputs: BTreeMap<u32, RemoteNodeId>,
    payload: Vec<u8>,
    transform: Transform,
    visible: bool,
    cook_count: u32,
    deltas: Vec<String>,
}

#[derive(Debug, Clone)]
struct LateBinding {
    operator: String,
    parm: String,
    target: String,
}

#[derive(Debug, Default)]
struct MockState {
    next_session: u64,
    session: Option<SessionHandle>,
    servers: Vec<String>,
    interactive: HashMap<String, u32>,
    sync_ready_after: u32,
    env: HashMap<String, String>,

    file_libraries: HashMap<PathBuf, Vec<MockOperator>>,
    buffer_libraries: Vec<(Vec<u8>, Vec<MockOperator>)>,
    loaded: HashMap<i32, Vec<MockOperator>>,
    next_library: i32,

    strings: Vec<String>,
    string_ids: HashMap<String, i32>,

    nodes: BTreeMap<i32, MockNode>,
    next_node: i32,
    next_parm: i32,

    late_bindings: Vec<LateBinding>,
    failures: Vec<(MockCall, ResultCode)>,
    calls: Vec<MockCall>,
    cook_log: Vec<String>,

    cook_polls: u32,
    pending_polls: u32,
    cook_errors: Option<String>,
    last_status: String,
}

impl MockState {
    fn intern(&mut self, text: &str) -> StringHandle {
        if let Some(id) = self.string_ids.get(text) {
            return StringHandle(*id);
        }
        self.strings.push(text.to_string());
        let id = self.strings.len() as i32;
        self.string_ids.insert(text.to_string(), id);
        StringHandle(id)
    }

    fn node(&self, id: RemoteNodeId) -> RemoteResult<&MockNode> {
        self.nodes.get(&id.0).ok_or(ResultCode::NodeInvalid)
    }

    fn node_mut(&mut self, id: RemoteNodeId) -> RemoteResult<&mut MockNode> {
        self.nodes.get_mut(&id.0).ok_or(ResultCode::NodeInvalid)
    }

    fn find_by_name(&self, name: &str) -> Option<i32> {
        self.nodes
            .iter()
            .find(|(_, node)| node.name == name && node.operator.is_some())
            .map(|(id, _)| *id)
    }

    fn add_node(&mut self, name: &str, operator: Option<MockOperator>, parent: Option<i32>) -> i32 {
        let id = self.next_node;
        self.next_node += 1;
        let mut parms = Vec::new();
        if let Some(op) = &operator {
            for (parm_name, value) in &op.parms {
                self.next_parm += 1;
                parms.push(MockParm {
                    id: self.next_parm,
                    name: parm_name.clone(),
                    value: value.clone(),
                    default: value.clone(),
                });
            }
        }
        self.nodes.insert(
            id,
            MockNode {
                name: name.to_string(),
                operator,
                parent,
                parms,
                inputs: BTreeMap::new(),
                payload: Vec::new(),
                transform: Transform::IDENTITY,
                visible: true,
                cook_count: 0,
                deltas: Vec::new(),
            },
        );
        id
    }

    fn drop_remote_state(&mut self) {
        self.session = None;
        self.loaded.clear();
        self.nodes.clear();
        self.servers.clear();
    }
}

/// Simulated compute engine
pub struct MockEngine {
    state: Mutex<MockState>,
    library_loaded: AtomicBool,
    call_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    /// Create an engine with no libraries
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                next_session: 1,
                next_library: 1,
                next_node: 0,
                ..MockState::default()
            }),
            library_loaded: AtomicBool::new(true),
            call_delay: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Register a library that can be loaded from `path`
    pub fn with_library_file(self, path: impl Into<PathBuf>, operators: Vec<MockOperator>) -> Self {
        self.lock().file_libraries.insert(path.into(), operators);
        self
    }

    /// Register a library that can be loaded from an in-memory buffer
    pub fn with_library_buffer(self, bytes: Vec<u8>, operators: Vec<MockOperator>) -> Self {
        self.lock().buffer_libraries.push((bytes, operators));
        self
    }

    /// Sleep this long inside instantiate and cook calls
    pub fn with_call_delay(self, delay: Duration) -> Self {
        *self.call_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
        self
    }

    /// Report `Cooking` for this many polls after each cook starts
    pub fn with_cook_polls(self, polls: u32) -> Self {
        self.lock().cook_polls = polls;
        self
    }

    /// Interactive sessions become connectable after this many failed attempts
    pub fn with_sync_ready_after(self, attempts: u32) -> Self {
        self.lock().sync_ready_after = attempts;
        self
    }

    /// Pretend the engine client library is missing
    pub fn set_library_loaded(&self, loaded: bool) {
        self.library_loaded.store(loaded, Ordering::SeqCst);
    }

    /// Make an already running interactive engine publish `name`
    pub fn publish_session(&self, name: &str) {
        self.lock().interactive.insert(name.to_string(), 0);
    }

    /// Simulate a crashed engine process: the session and all remote nodes vanish
    pub fn kill_session(&self) {
        self.lock().drop_remote_state();
    }

    /// Fail the next call of `call` with `code`
    pub fn fail_next(&self, call: MockCall, code: ResultCode) {
        self.lock().failures.push((call, code));
    }

    /// The next cook reports errors with this status text
    pub fn cook_with_errors(&self, status: &str) {
        self.lock().cook_errors = Some(status.to_string());
    }

    /// After the first cook of `operator`, point its `parm` at the node named `target`
    pub fn late_bind(&self, operator: &str, parm: &str, target: &str) {
        self.lock().late_bindings.push(LateBinding {
            operator: operator.to_string(),
            parm: parm.to_string(),
            target: target.to_string(),
        });
    }

    /// Every call made so far
    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    /// Number of calls of one kind
    pub fn call_count(&self, call: MockCall) -> usize {
        self.lock().calls.iter().filter(|c| **c == call).count()
    }

    /// Names of cooked nodes, in cook order
    pub fn cook_log(&self) -> Vec<String> {
        self.lock().cook_log.clone()
    }

    /// Whether a session is currently open
    pub fn has_session(&self) -> bool {
        self.lock().session.is_some()
    }

    /// Names of remote nodes that carry an operator
    pub fn node_names(&self) -> Vec<String> {
        self.lock()
            .nodes
            .values()
            .filter(|n| n.operator.is_some())
            .map(|n| n.name.clone())
            .collect()
    }

    /// Number of remote nodes, containers and input nodes included
    pub fn node_count(&self) -> usize {
        self.lock().nodes.len()
    }

    /// Current value of a parameter on the node named `node`
    pub fn parm_value(&self, node: &str, parm: &str) -> Option<ParmValue> {
        let state = self.lock();
        let id = state.find_by_name(node)?;
        state.nodes[&id]
            .parms
            .iter()
            .find(|p| p.name == parm)
            .map(|p| p.value.clone())
    }

    /// Delta tokens received by the node named `node`
    pub fn delta_tokens(&self, node: &str) -> Vec<String> {
        let state = self.lock();
        state
            .find_by_name(node)
            .map(|id| state.nodes[&id].deltas.clone())
            .unwrap_or_default()
    }

    /// Upstream remote node connected to geometry input `index` of `node`
    pub fn connected_input(&self, node: &str, index: u32) -> Option<RemoteNodeId> {
        let state = self.lock();
        let id = state.find_by_name(node)?;
        state.nodes[&id].inputs.get(&index).copied()
    }

    /// Object transform currently applied to the node named `node`
    pub fn transform_of(&self, node: &str) -> Option<Transform> {
        let state = self.lock();
        let id = state.find_by_name(node)?;
        let object = state.nodes[&id].parent.unwrap_or(id);
        state.nodes.get(&object).map(|n| n.transform)
    }

    /// Whether the object node of `node` is displayed
    pub fn is_visible(&self, node: &str) -> Option<bool> {
        let state = self.lock();
        let id = state.find_by_name(node)?;
        let object = state.nodes[&id].parent.unwrap_or(id);
        state.nodes.get(&object).map(|n| n.visible)
    }

    /// Payload uploaded to the input node named `name`
    pub fn input_payload(&self, name: &str) -> Option<Vec<u8>> {
        self.lock()
            .nodes
            .values()
            .find(|n| n.name == name && n.operator.is_none())
            .map(|n| n.payload.clone())
    }

    /// Server environment pushed by the client
    pub fn server_env(&self, key: &str) -> Option<String> {
        self.lock().env.get(key).cloned()
    }

    /// Peak number of overlapping instantiate/cook calls
    pub fn max_concurrent_calls(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a call, apply injected failures and validate the session
    fn enter(&self, call: MockCall, session: Option<&SessionHandle>) -> RemoteResult<MutexGuard<'_, MockState>> {
        let mut state = self.lock();
        state.calls.push(call);
        if let Some(pos) = state.failures.iter().position(|(c, _)| *c == call) {
            let (_, code) = state.failures.remove(pos);
            return Err(code);
        }
        if let Some(session) = session {
            if state.session.as_ref() != Some(session) {
                return Err(ResultCode::InvalidSession);
            }
        }
        Ok(state)
    }

    /// Simulate a long remote call while tracking overlap
    fn busy(&self) {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let delay = *self.call_delay.lock().unwrap_or_else(|e| e.into_inner());
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn load_operators(&self, state: &mut MockState, operators: Vec<MockOperator>) -> LibraryId {
        let id = state.next_library;
        state.next_library += 1;
        state.loaded.insert(id, operators);
        LibraryId(id)
    }

    fn find_operator(state: &MockState, name: &str) -> Option<MockOperator> {
        state
            .loaded
            .values()
            .flat_map(|ops| ops.iter())
            .find(|op| op.name == name)
            .cloned()
    }
}

impl RemoteEngine for MockEngine {
    fn is_library_loaded(&self) -> bool {
        self.library_loaded.load(Ordering::SeqCst)
    }

    fn start_server(&self, _kind: SessionKind, name: &str, _options: &ServerOptions) -> RemoteResult<()> {
        let mut state = self.enter(MockCall::StartServer, None)?;
        state.servers.push(name.to_string());
        Ok(())
    }

    fn launch_interactive(&self, name: &str) -> RemoteResult<()> {
        let mut state = self.enter(MockCall::LaunchInteractive, None)?;
        let ready_after = state.sync_ready_after;
        state.interactive.insert(name.to_string(), ready_after);
        Ok(())
    }

    fn create_session(&self, kind: SessionKind, name: &str) -> RemoteResult<SessionHandle> {
        let mut state = self.enter(MockCall::CreateSession, None)?;
        let reachable = if state.servers.iter().any(|s| s == name) {
            true
        } else if let Some(remaining) = state.interactive.get_mut(name) {
            if *remaining == 0 {
                true
            } else {
                *remaining -= 1;
                false
            }
        } else {
            false
        };
        if !reachable {
            return Err(ResultCode::Failure);
        }
        let handle = SessionHandle {
            kind,
            id: state.next_session,
        };
        state.next_session += 1;
        state.session = Some(handle);
        Ok(handle)
    }

    fn initialize(&self, session: &SessionHandle) -> RemoteResult<()> {
        self.enter(MockCall::Initialize, Some(session)).map(|_| ())
    }

    fn set_server_env(&self, session: &SessionHandle, key: &str, value: &str) -> RemoteResult<()> {
        let mut state = self.enter(MockCall::ServerEnv, Some(session))?;
        state.env.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn close_session(&self, session: &SessionHandle) -> RemoteResult<()> {
        let mut state = self.enter(MockCall::CloseSession, None)?;
        if state.session.as_ref() == Some(session) {
            state.drop_remote_state();
        }
        Ok(())
    }

    fn is_session_valid(&self, session: &SessionHandle) -> RemoteResult<()> {
        self.enter(MockCall::ProbeSession, Some(session)).map(|_| ())
    }

    fn load_library_from_file(&self, session: &SessionHandle, path: &Path) -> RemoteResult<LibraryId> {
        let mut state = self.enter(MockCall::LoadLibraryFile, Some(session))?;
        let operators = state
            .file_libraries
            .get(path)
            .cloned()
            .ok_or(ResultCode::CantLoadFile)?;
        Ok(self.load_operators(&mut state, operators))
    }

    fn load_library_from_buffer(&self, session: &SessionHandle, bytes: &[u8]) -> RemoteResult<LibraryId> {
        let mut state = self.enter(MockCall::LoadLibraryBuffer, Some(session))?;
        let operators = state
            .buffer_libraries
            .iter()
            .find(|(b, _)| b.as_slice() == bytes)
            .map(|(_, ops)| ops.clone())
            .ok_or(ResultCode::CantLoadFile)?;
        Ok(self.load_operators(&mut state, operators))
    }

    fn available_operators(&self, session: &SessionHandle, library: LibraryId) -> RemoteResult<Vec<StringHandle>> {
        let mut state = self.enter(MockCall::ListOperators, Some(session))?;
        let names: Vec<String> = state
            .loaded
            .get(&library.0)
            .ok_or(ResultCode::AssetInvalid)?
            .iter()
            .map(|op| op.name.clone())
            .collect();
        Ok(names.iter().map(|n| state.intern(n)).collect())
    }

    fn create_node(&self, session: &SessionHandle, operator: &str, name: &str) -> RemoteResult<RemoteNodeId> {
        {
            let state = self.enter(MockCall::CreateNode, Some(session))?;
            drop(state);
        }
        self.busy();
        let mut state = self.lock();
        if state.session.as_ref() != Some(session) {
            return Err(ResultCode::InvalidSession);
        }
        let op = Self::find_operator(&state, operator).ok_or(ResultCode::InvalidArgument)?;
        let parent = if op.geometry_operator {
            Some(state.add_node(name, None, None))
        } else {
            None
        };
        let sub_pipelines = op.sub_pipelines.clone();
        let id = state.add_node(name, Some(op), parent);
        for sub in sub_pipelines {
            state.add_node(&sub, None, Some(id));
        }
        Ok(RemoteNodeId(id))
    }

    fn delete_node(&self, session: &SessionHandle, node: RemoteNodeId) -> RemoteResult<()> {
        let mut state = self.enter(MockCall::DeleteNode, Some(session))?;
        state.nodes.remove(&node.0).ok_or(ResultCode::NodeInvalid)?;
        let mut doomed = vec![node.0];
        while let Some(parent) = doomed.pop() {
            let children: Vec<i32> = state
                .nodes
                .iter()
                .filter(|(_, n)| n.parent == Some(parent))
                .map(|(id, _)| *id)
                .collect();
            for child in children {
                state.nodes.remove(&child);
                doomed.push(child);
            }
        }
        Ok(())
    }

    fn node_by_path(&self, session: &SessionHandle, path: &str) -> RemoteResult<RemoteNodeId> {
        let state = self.enter(MockCall::NodeByPath, Some(session))?;
        let name = path.trim_start_matches("/obj/");
        state
            .nodes
            .iter()
            .find(|(_, n)| n.name == name && n.parent.is_none())
            .map(|(id, _)| RemoteNodeId(*id))
            .ok_or(ResultCode::NodeInvalid)
    }

    fn asset_info(&self, session: &SessionHandle, node: RemoteNodeId) -> RemoteResult<AssetInfo> {
        let mut state = self.enter(MockCall::AssetInfo, Some(session))?;
        let record = state.node(node)?.clone();
        let op = record.operator.ok_or(ResultCode::NodeInvalid)?;
        let label = state.intern(&op.name);
        let help = state.intern(&format!("Help for {}", op.name));
        Ok(AssetInfo {
            object_node_id: RemoteNodeId(record.parent.unwrap_or(node.0)),
            is_geometry_operator: op.geometry_operator,
            label,
            help,
            help_url: StringHandle::NULL,
            geo_input_count: op.geo_inputs,
        })
    }

    fn set_display(&self, session: &SessionHandle, node: RemoteNodeId, visible: bool) -> RemoteResult<()> {
        let mut state = self.enter(MockCall::SetDisplay, Some(session))?;
        state.node_mut(node)?.visible = visible;
        Ok(())
    }

    fn set_object_transform(&self, session: &SessionHandle, node: RemoteNodeId, transform: &Transform) -> RemoteResult<()> {
        let mut state = self.enter(MockCall::SetTransform, Some(session))?;
        state.node_mut(node)?.transform = *transform;
        Ok(())
    }

    fn sub_pipelines(&self, session: &SessionHandle, node: RemoteNodeId) -> RemoteResult<Vec<SubPipelineInfo>> {
        let mut state = self.enter(MockCall::SubPipelines, Some(session))?;
        state.node(node)?;
        let subs: Vec<(i32, String)> = state
            .nodes
            .iter()
            .filter(|(_, n)| n.parent == Some(node.0) && n.operator.is_none())
            .map(|(id, n)| (*id, n.name.clone()))
            .collect();
        Ok(subs
            .into_iter()
            .map(|(id, name)| SubPipelineInfo {
                node_id: RemoteNodeId(id),
                name: state.intern(&name),
            })
            .collect())
    }

    fn parameters(&self, session: &SessionHandle, node: RemoteNodeId) -> RemoteResult<Vec<ParmInfo>> {
        let mut state = self.enter(MockCall::Parameters, Some(session))?;
        let parms = state.node(node)?.parms.clone();
        Ok(parms
            .into_iter()
            .map(|p| ParmInfo {
                id: p.id,
                name: state.intern(&p.name),
                value: p.value,
                default: p.default,
                tags: Vec::new(),
            })
            .collect())
    }

    fn set_parameter(&self, session: &SessionHandle, node: RemoteNodeId, name: &str, value: &ParmValue) -> RemoteResult<()> {
        let mut state = self.enter(MockCall::SetParameter, Some(session))?;
        if let ParmValue::Node(target) = value {
            if target.is_valid() {
                state.node(*target)?;
            }
        }
        let parm = state
            .node_mut(node)?
            .parms
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or(ResultCode::ParmSetFailed)?;
        parm.value = value.clone();
        Ok(())
    }

    fn connect_input(&self, session: &SessionHandle, node: RemoteNodeId, index: u32, upstream: RemoteNodeId) -> RemoteResult<()> {
        let mut state = self.enter(MockCall::ConnectInput, Some(session))?;
        state.node(upstream)?;
        state.node_mut(node)?.inputs.insert(index, upstream);
        Ok(())
    }

    fn disconnect_input(&self, session: &SessionHandle, node: RemoteNodeId, index: u32) -> RemoteResult<()> {
        let mut state = self.enter(MockCall::DisconnectInput, Some(session))?;
        state.node_mut(node)?.inputs.remove(&index);
        Ok(())
    }

    fn create_input_node(&self, session: &SessionHandle, name: &str) -> RemoteResult<RemoteNodeId> {
        let mut state = self.enter(MockCall::CreateInputNode, Some(session))?;
        Ok(RemoteNodeId(state.add_node(name, None, None)))
    }

    fn set_input_payload(&self, session: &SessionHandle, node: RemoteNodeId, payload: &[u8]) -> RemoteResult<()> {
        let mut state = self.enter(MockCall::SetInputPayload, Some(session))?;
        state.node_mut(node)?.payload = payload.to_vec();
        Ok(())
    }

    fn set_delta_info(&self, session: &SessionHandle, node: RemoteNodeId, token: &str) -> RemoteResult<()> {
        let mut state = self.enter(MockCall::SetDelta, Some(session))?;
        state.node_mut(node)?.deltas.push(token.to_string());
        Ok(())
    }

    fn cook_targets(&self, session: &SessionHandle, node: RemoteNodeId) -> RemoteResult<Vec<RemoteNodeId>> {
        let state = self.enter(MockCall::CookTargets, Some(session))?;
        state.node(node)?;
        Ok(vec![node])
    }

    fn cook_node(&self, session: &SessionHandle, node: RemoteNodeId) -> RemoteResult<()> {
        {
            let state = self.enter(MockCall::CookNode, Some(session))?;
            state.node(node)?;
        }
        self.busy();
        let mut state = self.lock();
        if state.session.as_ref() != Some(session) {
            return Err(ResultCode::InvalidSession);
        }
        let (name, operator, first_cook) = {
            let record = state.node_mut(node)?;
            record.cook_count += 1;
            (
                record.name.clone(),
                record.operator.as_ref().map(|op| op.name.clone()),
                record.cook_count == 1,
            )
        };
        state.cook_log.push(name);

        if first_cook {
            let bindings: Vec<LateBinding> = state
                .late_bindings
                .iter()
                .filter(|b| Some(&b.operator) == operator.as_ref())
                .cloned()
                .collect();
            for binding in bindings {
                let target = state
                    .find_by_name(&binding.target)
                    .map(RemoteNodeId)
                    .unwrap_or(RemoteNodeId::NONE);
                state.next_parm += 1;
                let id = state.next_parm;
                let record = state.node_mut(node)?;
                match record.parms.iter_mut().find(|p| p.name == binding.parm) {
                    Some(parm) => parm.value = ParmValue::Node(target),
                    None => record.parms.push(MockParm {
                        id,
                        name: binding.parm.clone(),
                        value: ParmValue::Node(target),
                        default: ParmValue::Node(RemoteNodeId::NONE),
                    }),
                }
            }
        }

        state.pending_polls = state.cook_polls;
        let status = state.cook_errors.take().unwrap_or_default();
        state.last_status = status;
        Ok(())
    }

    fn cook_state(&self, session: &SessionHandle) -> RemoteResult<RemoteCookState> {
        let mut state = self.enter(MockCall::CookState, Some(session))?;
        if state.pending_polls > 0 {
            state.pending_polls -= 1;
            return Ok(RemoteCookState::Cooking);
        }
        if state.last_status.is_empty() {
            Ok(RemoteCookState::Ready)
        } else {
            Ok(RemoteCookState::ReadyWithErrors)
        }
    }

    fn status_text(&self, session: &SessionHandle) -> RemoteResult<String> {
        let state = self.enter(MockCall::StatusText, Some(session))?;
        if state.pending_polls > 0 {
            Ok(format!("Cooking ({} steps left)", state.pending_polls))
        } else {
            Ok(state.last_status.clone())
        }
    }

    fn output_geos(&self, session: &SessionHandle, node: RemoteNodeId) -> RemoteResult<Vec<GeoInfo>> {
        let mut state = self.enter(MockCall::OutputGeos, Some(session))?;
        let record = state.node(node)?.clone();
        let part_count = record
            .operator
            .as_ref()
            .map(|op| op.parts.len() as u32)
            .unwrap_or(0);
        if part_count == 0 {
            return Ok(Vec::new());
        }
        let name = state.intern(&record.name);
        Ok(vec![GeoInfo {
            node_id: node,
            name,
            part_count,
        }])
    }

    fn part_info(&self, session: &SessionHandle, geo: RemoteNodeId, part: u32) -> RemoteResult<PartInfo> {
        let mut state = self.enter(MockCall::PartInfo, Some(session))?;
        let spec = state
            .node(geo)?
            .operator
            .as_ref()
            .and_then(|op| op.parts.get(part as usize))
            .cloned()
            .ok_or(ResultCode::InvalidArgument)?;
        let name = state.intern(&spec.name);
        let split_value = match &spec.split_value {
            Some(value) => state.intern(value),
            None => StringHandle::NULL,
        };
        Ok(PartInfo {
            index: part,
            name,
            kind: spec.kind,
            point_count: spec.point_count,
            split_value,
        })
    }

    fn resolve_strings(&self, session: &SessionHandle, handles: &[StringHandle]) -> RemoteResult<Vec<String>> {
        let state = self.enter(MockCall::ResolveStrings, Some(session))?;
        handles
            .iter()
            .map(|h| {
                if h.is_null() {
                    Ok(String::new())
                } else {
                    state
                        .strings
                        .get((h.0 - 1) as usize)
                        .cloned()
                        .ok_or(ResultCode::InvalidArgument)
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::strings;

    fn open(engine: &MockEngine) -> SessionHandle {
        let options = ServerOptions {
            auto_close: true,
            timeout_ms: 3000,
            shared_memory_buffer_mb: 512,
        };
        engine
            .start_server(SessionKind::NamedPipe, "test", &options)
            .unwrap();
        engine.create_session(SessionKind::NamedPipe, "test").unwrap()
    }

    #[test]
    fn test_create_session_requires_server() {
        let engine = MockEngine::new();
        assert_eq!(
            engine.create_session(SessionKind::NamedPipe, "missing"),
            Err(ResultCode::Failure)
        );
        let session = open(&engine);
        assert!(engine.is_session_valid(&session).is_ok());
    }

    #[test]
    fn test_kill_session_invalidates_calls() {
        let engine = MockEngine::new();
        let session = open(&engine);
        engine.kill_session();
        assert_eq!(
            engine.is_session_valid(&session),
            Err(ResultCode::InvalidSession)
        );
    }

    #[test]
    fn test_fail_next_is_one_shot() {
        let engine = MockEngine::new();
        let session = open(&engine);
        engine.fail_next(MockCall::ProbeSession, ResultCode::Failure);
        assert_eq!(engine.is_session_valid(&session), Err(ResultCode::Failure));
        assert!(engine.is_session_valid(&session).is_ok());
    }

    #[test]
    fn test_geometry_operator_gets_container() {
        let engine = MockEngine::new()
            .with_library_file("/lib/a.lib", vec![MockOperator::new("Sop/box")]);
        let session = open(&engine);
        let lib = engine
            .load_library_from_file(&session, Path::new("/lib/a.lib"))
            .unwrap();
        assert_eq!(engine.available_operators(&session, lib).unwrap().len(), 1);

        let node = engine.create_node(&session, "Sop/box", "box_1").unwrap();
        let info = engine.asset_info(&session, node).unwrap();
        assert!(info.is_geometry_operator);
        assert_ne!(info.object_node_id, node);

        engine.delete_node(&session, info.object_node_id).unwrap();
        assert_eq!(engine.node_count(), 0);
    }

    #[test]
    fn test_batch_resolve_skips_null_and_duplicates() {
        let engine = MockEngine::new()
            .with_library_file("/lib/a.lib", vec![MockOperator::new("Sop/box")]);
        let session = open(&engine);
        let lib = engine
            .load_library_from_file(&session, Path::new("/lib/a.lib"))
            .unwrap();
        let handles = engine.available_operators(&session, lib).unwrap();
        let query = vec![handles[0], StringHandle::NULL, handles[0]];

        let texts = strings::resolve_ordered(&engine, &session, &query).unwrap();
        assert_eq!(texts, vec!["Sop/box", "", "Sop/box"]);
        assert_eq!(engine.call_count(MockCall::ResolveStrings), 1);
    }
}

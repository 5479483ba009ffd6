//! Host-side nodes
//!
//! A [`Node`] is the host's handle to one operator graph instantiated in the
//! remote engine. It owns everything the pipeline needs between runs: the
//! remote ids, the cook request, parameters, inputs, outputs and the live
//! delta token.
//!
//! All remote-resource fields are reset together by [`Node::invalidate`]. A
//! node with `remote_id < 0` holds no remote resources.

pub mod delta;
pub mod input;
pub mod registry;

pub use delta::DeltaInfo;
pub use input::{Input, InputBinding, InputHolder, InputKind, InputSource};
pub use registry::NodeRegistry;

use crate::asset::AssetId;
use crate::config::Preset;
use crate::engine::{ParmValue, RemoteNodeId, Transform};
use crate::output::OutputRecord;
use crate::pipeline::{CookState, Signal};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

/// Number of state transitions kept per node
const STATE_HISTORY_LEN: usize = 64;

/// Stable host-side node identity
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct NodeKey(pub u32);

impl NodeKey {
    pub const INVALID: NodeKey = NodeKey(u32::MAX);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "NodeKey(INVALID)")
        } else {
            write!(f, "NodeKey({})", self.0)
        }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How a cook was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CookRequest {
    /// Nothing pending
    #[default]
    None,
    /// Cook if the node's policy allows it
    Requested,
    /// Cook even if `cook_on_parameter_changed` is off
    Forced,
}

/// Local copy of a remote parameter
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub id: i32,
    pub name: String,
    pub value: ParmValue,
    pub default: ParmValue,
    pub tags: Vec<String>,
    /// Edited locally and not yet uploaded
    pub dirty: bool,
}

/// Top-level sub-pipeline found inside an instantiation
#[derive(Debug, Clone, PartialEq)]
pub struct SubPipeline {
    pub name: String,
    pub remote_id: RemoteNodeId,
}

/// A unit of procedural work bound to a host entity
#[derive(Debug, Clone)]
pub struct Node {
    pub key: NodeKey,
    /// Stable host entity name
    pub name: String,
    pub asset: AssetId,

    pub remote_id: RemoteNodeId,
    /// Geometry container of geometry-level operators
    pub geo_id: RemoteNodeId,
    pub operator: String,
    pub available_operators: Vec<String>,

    pub label: String,
    pub help: String,
    pub help_url: String,

    pub needs_rebuild: bool,
    pub cook_request: CookRequest,
    cook_on_parameter_changed: bool,
    cook_on_upstream_changed: bool,
    pub last_transform: Transform,

    pub parameters: Vec<Parameter>,
    pub pending_preset: Option<Preset>,
    pub inputs: Vec<Input>,
    /// Bindings for inputs the node does not expose yet, applied after instantiation
    pub pending_bindings: BTreeMap<String, InputSource>,
    pub outputs: Vec<OutputRecord>,
    /// Split value to host entity name
    pub split_instances: BTreeMap<String, String>,
    pub sub_pipelines: Vec<SubPipeline>,

    pub delta: DeltaInfo,
    /// Inverse token of the last consumed delta, replayed after a rebuild
    pub redelta: String,
    /// Set by a fresh instantiation until the next upload
    pub replay_redelta: bool,

    state: CookState,
    history: VecDeque<CookState>,
    /// Message of the last failed pipeline run, cleared by the next trigger
    pub last_failure: Option<String>,
    /// Global cook sequence number of the last finished run
    pub last_cook_serial: Option<u64>,
    pub last_cooked_at: Option<DateTime<Utc>>,
    pub finished_cooks: u64,
}

impl Node {
    pub fn new(key: NodeKey, name: impl Into<String>, asset: AssetId) -> Self {
        let name = name.into();
        let mut history = VecDeque::with_capacity(STATE_HISTORY_LEN);
        history.push_back(CookState::Idle);
        Self {
            key,
            label: name.clone(),
            name,
            asset,
            remote_id: RemoteNodeId::NONE,
            geo_id: RemoteNodeId::NONE,
            operator: String::new(),
            available_operators: Vec::new(),
            help: String::new(),
            help_url: String::new(),
            needs_rebuild: true,
            cook_request: CookRequest::None,
            cook_on_parameter_changed: true,
            cook_on_upstream_changed: true,
            last_transform: Transform::IDENTITY,
            parameters: Vec::new(),
            pending_preset: None,
            inputs: Vec::new(),
            pending_bindings: BTreeMap::new(),
            outputs: Vec::new(),
            split_instances: BTreeMap::new(),
            sub_pipelines: Vec::new(),
            delta: DeltaInfo::default(),
            redelta: String::new(),
            replay_redelta: false,
            state: CookState::Idle,
            history,
            last_failure: None,
            last_cook_serial: None,
            last_cooked_at: None,
            finished_cooks: 0,
        }
    }

    #[inline]
    pub fn is_instantiated(&self) -> bool {
        self.remote_id.is_valid()
    }

    #[inline]
    pub fn needs_cook(&self) -> bool {
        self.cook_request != CookRequest::None
    }

    /// Either cook-on flag is off, so edits wait for an explicit cook
    pub fn deferred_cook(&self) -> bool {
        !self.cook_on_parameter_changed || !self.cook_on_upstream_changed
    }

    pub fn cook_on_parameter_changed(&self) -> bool {
        self.cook_on_parameter_changed
    }

    pub fn cook_on_upstream_changed(&self) -> bool {
        self.cook_on_upstream_changed
    }

    /// Returns true when [`Node::deferred_cook`] flipped
    pub fn set_cook_on_parameter_changed(&mut self, enabled: bool) -> bool {
        let before = self.deferred_cook();
        self.cook_on_parameter_changed = enabled;
        before != self.deferred_cook()
    }

    /// Returns true when [`Node::deferred_cook`] flipped
    pub fn set_cook_on_upstream_changed(&mut self, enabled: bool) -> bool {
        let before = self.deferred_cook();
        self.cook_on_upstream_changed = enabled;
        before != self.deferred_cook()
    }

    pub fn request_cook(&mut self) {
        if self.cook_request == CookRequest::None {
            self.cook_request = CookRequest::Requested;
        }
        self.last_failure = None;
    }

    pub fn force_cook(&mut self) {
        self.cook_request = CookRequest::Forced;
        self.last_failure = None;
    }

    /// Re-instantiate on the next pipeline run
    pub fn request_rebuild(&mut self) {
        self.needs_rebuild = true;
        self.request_cook();
    }

    /// Switch operators. Returns false when `operator` is already selected.
    pub fn select_operator(&mut self, operator: &str) -> bool {
        if self.operator == operator {
            return false;
        }
        self.operator = operator.to_string();
        self.request_rebuild();
        true
    }

    /// Object-level node that carries the transform
    pub fn object_id(&self) -> RemoteNodeId {
        if self.geo_id.is_valid() {
            self.geo_id
        } else {
            self.remote_id
        }
    }

    /// Remote node to delete when tearing the instantiation down
    pub fn deletion_root(&self) -> RemoteNodeId {
        self.object_id()
    }

    /// Remote input nodes created for data inputs
    pub fn input_node_ids(&self) -> Vec<RemoteNodeId> {
        self.inputs
            .iter()
            .flat_map(|input| input.holders.iter())
            .filter(|holder| !matches!(holder.source, InputSource::Node(_)))
            .map(|holder| holder.remote_id)
            .filter(|id| id.is_valid())
            .collect()
    }

    /// Upstream nodes named by inputs and by pending bindings, in that order
    pub fn upstream_keys(&self) -> impl Iterator<Item = NodeKey> + '_ {
        let bound = self.inputs.iter().filter_map(|input| input.upstream());
        let pending = self.pending_bindings.values().filter_map(|source| match source {
            InputSource::Node(key) => Some(*key),
            _ => None,
        });
        bound.chain(pending)
    }

    /// Forget every remote resource at once and cancel the pending request
    pub fn invalidate(&mut self) {
        self.needs_rebuild = true;
        self.cook_request = CookRequest::None;
        if self.state != CookState::Idle {
            self.apply(Signal::SessionLost);
            self.apply(Signal::Reset);
        }
        self.clear_remote();
    }

    /// Reset all remote ids together. The node then holds no remote resources.
    pub fn clear_remote(&mut self) {
        self.needs_rebuild = true;
        if !self.remote_id.is_valid() && !self.geo_id.is_valid() {
            return;
        }

        self.remote_id = RemoteNodeId::NONE;
        self.geo_id = RemoteNodeId::NONE;
        for input in &mut self.inputs {
            input.invalidate();
        }
        for sub in &mut self.sub_pipelines {
            sub.remote_id = RemoteNodeId::NONE;
        }
    }

    pub fn state(&self) -> CookState {
        self.state
    }

    /// States this node went through, oldest first
    pub fn state_history(&self) -> impl Iterator<Item = CookState> + '_ {
        self.history.iter().copied()
    }

    pub fn clear_state_history(&mut self) {
        self.history.clear();
        self.history.push_back(self.state);
    }

    /// Feed a signal through the transition function.
    ///
    /// Signals that are not valid in the current state are logged and
    /// ignored, leaving the state unchanged.
    pub fn apply(&mut self, signal: Signal) -> CookState {
        match self.state.next(signal) {
            Some(next) => {
                tracing::trace!("{}: {:?} --{:?}--> {:?}", self.label, self.state, signal, next);
                self.state = next;
                self.history.push_back(next);
                if self.history.len() > STATE_HISTORY_LEN {
                    self.history.pop_front();
                }
            }
            None => {
                tracing::debug!(
                    "{}: ignoring {:?} in state {:?}",
                    self.label,
                    signal,
                    self.state
                );
            }
        }
        self.state
    }

    pub fn find_input(&self, name: &str) -> Option<usize> {
        self.inputs.iter().position(|input| input.name == name)
    }

    /// Apply a preset: operator choice now, values on the next pipeline run
    pub fn apply_preset(&mut self, preset: Preset) {
        if let Some(operator) = &preset.operator {
            self.select_operator(operator);
        }
        self.pending_preset = Some(preset);
        self.request_cook();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> Node {
        Node::new(NodeKey(1), "rock", AssetId(0))
    }

    #[test]
    fn test_new_node_defaults() {
        let node = node();
        assert!(!node.is_instantiated());
        assert!(!node.needs_cook());
        assert!(node.needs_rebuild);
        assert!(!node.deferred_cook());
        assert_eq!(node.state(), CookState::Idle);
    }

    #[test]
    fn test_request_and_force() {
        let mut node = node();
        node.request_cook();
        assert_eq!(node.cook_request, CookRequest::Requested);
        node.force_cook();
        node.request_cook();
        assert_eq!(node.cook_request, CookRequest::Forced);
    }

    #[test]
    fn test_deferred_cook_flip() {
        let mut node = node();
        assert!(node.set_cook_on_parameter_changed(false));
        assert!(!node.set_cook_on_upstream_changed(false));
        assert!(!node.set_cook_on_parameter_changed(true));
        assert!(node.set_cook_on_upstream_changed(true));
    }

    #[test]
    fn test_select_operator_requests_rebuild() {
        let mut node = node();
        node.needs_rebuild = false;
        assert!(node.select_operator("Sop/sphere"));
        assert!(node.needs_rebuild);
        assert!(node.needs_cook());
        assert!(!node.select_operator("Sop/sphere"));
    }

    #[test]
    fn test_invalidate_resets_remote_fields_together() {
        let mut node = node();
        node.remote_id = RemoteNodeId(4);
        node.geo_id = RemoteNodeId(3);
        node.needs_rebuild = false;
        node.cook_request = CookRequest::Requested;
        node.sub_pipelines.push(SubPipeline {
            name: "tasks".to_string(),
            remote_id: RemoteNodeId(5),
        });

        node.invalidate();
        assert_eq!(node.remote_id, RemoteNodeId::NONE);
        assert_eq!(node.geo_id, RemoteNodeId::NONE);
        assert_eq!(node.sub_pipelines[0].remote_id, RemoteNodeId::NONE);
        assert!(node.needs_rebuild);
        assert!(!node.needs_cook());
    }

    #[test]
    fn test_upstream_keys_include_pending_bindings() {
        let mut node = node();
        let mut input = Input::new("input0", InputKind::Node, InputBinding::Geometry(0));
        input.bind(InputSource::Node(NodeKey(7)));
        node.inputs.push(input);
        node.pending_bindings
            .insert("guide".to_string(), InputSource::Node(NodeKey(9)));
        assert_eq!(node.upstream_keys().collect::<Vec<_>>(), vec![NodeKey(7), NodeKey(9)]);
    }

    #[test]
    fn test_object_id_prefers_container() {
        let mut node = node();
        node.remote_id = RemoteNodeId(4);
        assert_eq!(node.object_id(), RemoteNodeId(4));
        node.geo_id = RemoteNodeId(3);
        assert_eq!(node.object_id(), RemoteNodeId(3));
    }

    #[test]
    fn test_invalid_signal_is_ignored() {
        let mut node = node();
        assert_eq!(node.apply(Signal::CookSucceeded), CookState::Idle);
        assert_eq!(node.state_history().count(), 1);
    }
}

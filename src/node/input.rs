//! Node inputs and input builders
//!
//! An [`Input`] is a typed slot on a node. It is bound either to a geometry
//! input index or to an operator-path parameter, and holds one or more
//! [`InputHolder`]s describing where the data comes from. Only the first
//! holder of an input is connected.
//!
//! Node-typed sources are wired directly to the upstream node's remote id.
//! Every other source is turned into a remote input node by the first
//! matching [`InputBuilder`] in registration order.

use super::NodeKey;
use crate::engine::status::{RemoteResultExt, Step};
use crate::engine::strings::sanitize_name;
use crate::engine::{RemoteEngine, RemoteNodeId, SessionHandle};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What an input carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InputKind {
    /// Output of another registered node
    Node,
    /// Host content such as meshes
    Content,
    /// Host component data
    Component,
    Curves,
    Mask,
}

impl fmt::Display for InputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            InputKind::Node => "node",
            InputKind::Content => "content",
            InputKind::Component => "component",
            InputKind::Curves => "curves",
            InputKind::Mask => "mask",
        };
        write!(f, "{}", text)
    }
}

/// Opaque host data handed to the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    pub name: String,
    pub payload: Vec<u8>,
}

impl DataSource {
    pub fn new(name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// Where an input holder takes its data from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InputSource {
    Node(NodeKey),
    Content(DataSource),
    Component(DataSource),
    Curves(DataSource),
    Mask(DataSource),
}

impl InputSource {
    pub fn kind(&self) -> InputKind {
        match self {
            InputSource::Node(_) => InputKind::Node,
            InputSource::Content(_) => InputKind::Content,
            InputSource::Component(_) => InputKind::Component,
            InputSource::Curves(_) => InputKind::Curves,
            InputSource::Mask(_) => InputKind::Mask,
        }
    }

    pub fn data(&self) -> Option<&DataSource> {
        match self {
            InputSource::Node(_) => None,
            InputSource::Content(d)
            | InputSource::Component(d)
            | InputSource::Curves(d)
            | InputSource::Mask(d) => Some(d),
        }
    }
}

/// One bound source of an input
#[derive(Debug, Clone, PartialEq)]
pub struct InputHolder {
    pub source: InputSource,
    /// Remote input node built for data sources
    pub remote_id: RemoteNodeId,
    /// Needs uploading
    pub changed: bool,
}

impl InputHolder {
    pub fn new(source: InputSource) -> Self {
        Self {
            source,
            remote_id: RemoteNodeId::NONE,
            changed: true,
        }
    }

    pub fn mark_changed(&mut self) {
        self.changed = true;
    }

    pub fn invalidate(&mut self) {
        self.remote_id = RemoteNodeId::NONE;
        self.changed = true;
    }
}

/// How an input is wired on the remote node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputBinding {
    /// Geometry input slot
    Geometry(u32),
    /// Operator-path parameter, identified by its parameter id
    Parameter(i32),
}

/// A typed input slot
#[derive(Debug, Clone, PartialEq)]
pub struct Input {
    pub name: String,
    pub kind: InputKind,
    pub binding: InputBinding,
    pub holders: Vec<InputHolder>,
    /// Changes on the upstream side should trigger this node
    pub check_changed: bool,
    /// Something is currently connected remotely
    pub connected: bool,
}

impl Input {
    pub fn new(name: impl Into<String>, kind: InputKind, binding: InputBinding) -> Self {
        Self {
            name: name.into(),
            kind,
            binding,
            holders: Vec::new(),
            check_changed: true,
            connected: false,
        }
    }

    pub fn is_parameter(&self) -> bool {
        matches!(self.binding, InputBinding::Parameter(_))
    }

    /// Upstream node referenced by a node-typed input
    pub fn upstream(&self) -> Option<NodeKey> {
        if self.kind != InputKind::Node {
            return None;
        }
        match self.holders.first().map(|h| &h.source) {
            Some(InputSource::Node(key)) => Some(*key),
            _ => None,
        }
    }

    /// Replace the bound source. Returns false if it was already bound.
    pub fn bind(&mut self, source: InputSource) -> bool {
        if self.holders.first().map(|h| &h.source) == Some(&source) {
            return false;
        }
        self.kind = source.kind();
        self.holders.clear();
        self.holders.push(InputHolder::new(source));
        true
    }

    pub fn mark_changed(&mut self) {
        if let Some(holder) = self.holders.first_mut() {
            holder.mark_changed();
        }
    }

    /// Needs an upload before the next cook
    pub fn has_pending_upload(&self) -> bool {
        match self.holders.first() {
            Some(holder) => holder.changed,
            None => self.connected,
        }
    }

    pub fn invalidate(&mut self) {
        for holder in &mut self.holders {
            holder.invalidate();
        }
        self.connected = false;
    }
}

/// Turns non-node input sources into remote input nodes
pub trait InputBuilder: Send {
    /// Unique name used for registration
    fn name(&self) -> &str;

    fn matches(&self, source: &InputSource) -> bool;

    /// Create or refresh the remote input node for `holder`
    fn build(
        &self,
        engine: &dyn RemoteEngine,
        session: &SessionHandle,
        owner_label: &str,
        holder: &InputHolder,
    ) -> Result<RemoteNodeId>;
}

/// Uploads the raw payload of any data source into a dedicated input node
pub struct PayloadInputBuilder;

impl InputBuilder for PayloadInputBuilder {
    fn name(&self) -> &str {
        "payload"
    }

    fn matches(&self, source: &InputSource) -> bool {
        source.data().is_some()
    }

    fn build(
        &self,
        engine: &dyn RemoteEngine,
        session: &SessionHandle,
        owner_label: &str,
        holder: &InputHolder,
    ) -> Result<RemoteNodeId> {
        let Some(data) = holder.source.data() else {
            return Ok(RemoteNodeId::NONE);
        };
        let node = if holder.remote_id.is_valid() {
            holder.remote_id
        } else {
            let name = format!(
                "{}_{}_{}",
                sanitize_name(owner_label),
                holder.source.kind(),
                sanitize_name(&data.name)
            );
            engine
                .create_input_node(session, &name)
                .step(Step::UploadInputs)?
        };
        engine
            .set_input_payload(session, node, &data.payload)
            .step(Step::UploadInputs)?;
        Ok(node)
    }
}

/// Ordered input builder list. The first match wins.
pub struct InputBuilders {
    builders: Vec<Box<dyn InputBuilder>>,
}

impl Default for InputBuilders {
    fn default() -> Self {
        let mut builders = Self::empty();
        builders.register(Box::new(PayloadInputBuilder));
        builders
    }
}

impl InputBuilders {
    pub fn empty() -> Self {
        Self {
            builders: Vec::new(),
        }
    }

    /// Register a builder unless one with the same name exists
    pub fn register(&mut self, builder: Box<dyn InputBuilder>) -> bool {
        if self.builders.iter().any(|b| b.name() == builder.name()) {
            return false;
        }
        self.builders.push(builder);
        true
    }

    /// Register ahead of the existing builders
    pub fn register_first(&mut self, builder: Box<dyn InputBuilder>) -> bool {
        if self.builders.iter().any(|b| b.name() == builder.name()) {
            return false;
        }
        self.builders.insert(0, builder);
        true
    }

    pub fn find(&self, source: &InputSource) -> Option<&dyn InputBuilder> {
        self.builders
            .iter()
            .find(|b| b.matches(source))
            .map(|b| b.as_ref())
    }

    pub fn len(&self) -> usize {
        self.builders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CurvesOnly;

    impl InputBuilder for CurvesOnly {
        fn name(&self) -> &str {
            "curves"
        }

        fn matches(&self, source: &InputSource) -> bool {
            source.kind() == InputKind::Curves
        }

        fn build(
            &self,
            _engine: &dyn RemoteEngine,
            _session: &SessionHandle,
            _owner_label: &str,
            _holder: &InputHolder,
        ) -> Result<RemoteNodeId> {
            Ok(RemoteNodeId(99))
        }
    }

    fn curves() -> InputSource {
        InputSource::Curves(DataSource::new("path", vec![1, 2, 3]))
    }

    #[test]
    fn test_upstream_only_for_node_inputs() {
        let mut input = Input::new("input0", InputKind::Node, InputBinding::Geometry(0));
        assert_eq!(input.upstream(), None);
        input.bind(InputSource::Node(NodeKey(3)));
        assert_eq!(input.upstream(), Some(NodeKey(3)));
        input.bind(curves());
        assert_eq!(input.kind, InputKind::Curves);
        assert_eq!(input.upstream(), None);
    }

    #[test]
    fn test_bind_same_source_is_noop() {
        let mut input = Input::new("input0", InputKind::Node, InputBinding::Geometry(0));
        assert!(input.bind(InputSource::Node(NodeKey(1))));
        input.holders[0].changed = false;
        assert!(!input.bind(InputSource::Node(NodeKey(1))));
        assert!(!input.has_pending_upload());
    }

    #[test]
    fn test_invalidate_marks_holders_changed() {
        let mut input = Input::new("input0", InputKind::Node, InputBinding::Geometry(0));
        input.bind(curves());
        input.holders[0].remote_id = RemoteNodeId(8);
        input.holders[0].changed = false;
        input.connected = true;

        input.invalidate();
        assert_eq!(input.holders[0].remote_id, RemoteNodeId::NONE);
        assert!(input.has_pending_upload());
        assert!(!input.connected);
    }

    #[test]
    fn test_builders_registration_order() {
        let mut builders = InputBuilders::default();
        assert_eq!(builders.find(&curves()).unwrap().name(), "payload");

        assert!(builders.register_first(Box::new(CurvesOnly)));
        assert!(!builders.register(Box::new(CurvesOnly)));
        assert_eq!(builders.len(), 2);
        assert_eq!(builders.find(&curves()).unwrap().name(), "curves");
        assert!(builders.find(&InputSource::Node(NodeKey(1))).is_none());
    }
}

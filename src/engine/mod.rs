//! Remote engine RPC boundary
//!
//! The compute engine runs out of process. Everything this crate knows about
//! it goes through the [`RemoteEngine`] trait: plain call-ins that return a
//! [`ResultCode`] on failure. Names and labels come back as [`StringHandle`]s
//! which have to be resolved in a batch (see [`strings::resolve_batch`]).
//!
//! # Implementations
//!
//! - [`mock::MockEngine`] - in-process simulated engine for tests and the demo binary
//!
//! A production transport (named pipe or shared memory) implements the same
//! trait; the wire protocol itself lives outside this crate.

pub mod mock;
pub mod status;
pub mod strings;

pub use mock::MockEngine;
pub use status::{classify, Outcome, RemoteResultExt, Step};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Result of a single remote call
pub type RemoteResult<T> = std::result::Result<T, ResultCode>;

/// Result codes reported by the remote engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    Success,
    Failure,
    AlreadyInitialized,
    NotInitialized,
    CantLoadFile,
    ParmSetFailed,
    InvalidArgument,
    AssetInvalid,
    NodeInvalid,
    UserInterrupted,
    InvalidSession,
}

impl ResultCode {
    /// Every code, in declaration order
    pub const ALL: [ResultCode; 11] = [
        ResultCode::Success,
        ResultCode::Failure,
        ResultCode::AlreadyInitialized,
        ResultCode::NotInitialized,
        ResultCode::CantLoadFile,
        ResultCode::ParmSetFailed,
        ResultCode::InvalidArgument,
        ResultCode::AssetInvalid,
        ResultCode::NodeInvalid,
        ResultCode::UserInterrupted,
        ResultCode::InvalidSession,
    ];
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ResultCode::Success => "success",
            ResultCode::Failure => "failure",
            ResultCode::AlreadyInitialized => "already initialized",
            ResultCode::NotInitialized => "not initialized",
            ResultCode::CantLoadFile => "cannot load file",
            ResultCode::ParmSetFailed => "parameter set failed",
            ResultCode::InvalidArgument => "invalid argument",
            ResultCode::AssetInvalid => "asset invalid",
            ResultCode::NodeInvalid => "node invalid",
            ResultCode::UserInterrupted => "user interrupted",
            ResultCode::InvalidSession => "invalid session",
        };
        write!(f, "{}", text)
    }
}

/// Transport used to talk to the engine process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SessionKind {
    NamedPipe,
    #[default]
    SharedMemory,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::NamedPipe => write!(f, "named pipe"),
            SessionKind::SharedMemory => write!(f, "shared memory"),
        }
    }
}

/// Opaque connection handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    pub kind: SessionKind,
    pub id: u64,
}

/// Options for launching an engine server process
#[derive(Debug, Clone, PartialEq)]
pub struct ServerOptions {
    /// Shut the server down when the last client disconnects
    pub auto_close: bool,
    /// Connection timeout in milliseconds
    pub timeout_ms: u64,
    /// Buffer size for shared memory transports
    pub shared_memory_buffer_mb: u32,
}

/// Handle to a string owned by the remote engine. `0` is the null handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StringHandle(pub i32);

impl StringHandle {
    pub const NULL: StringHandle = StringHandle(0);

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for StringHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StringHandle({})", self.0)
    }
}

/// Id of an asset library loaded into a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LibraryId(pub i32);

/// Remote node id. Negative ids mean "no remote node".
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteNodeId(pub i32);

impl RemoteNodeId {
    pub const NONE: RemoteNodeId = RemoteNodeId(-1);

    #[inline]
    pub fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl Default for RemoteNodeId {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Debug for RemoteNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "RemoteNodeId({})", self.0)
        } else {
            write!(f, "RemoteNodeId(NONE)")
        }
    }
}

impl fmt::Display for RemoteNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Translate / rotate (degrees) / scale of an object node
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub translate: [f64; 3],
    pub rotate: [f64; 3],
    pub scale: [f64; 3],
}

impl Transform {
    pub const IDENTITY: Transform = Transform {
        translate: [0.0; 3],
        rotate: [0.0; 3],
        scale: [1.0; 3],
    };

    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }

    pub fn from_translation(x: f64, y: f64, z: f64) -> Self {
        Self {
            translate: [x, y, z],
            ..Self::IDENTITY
        }
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Information about an instantiated asset node
#[derive(Debug, Clone, PartialEq)]
pub struct AssetInfo {
    /// Object-level node that carries the transform
    pub object_node_id: RemoteNodeId,
    /// True when the asset is a geometry-level operator living in a container
    pub is_geometry_operator: bool,
    pub label: StringHandle,
    pub help: StringHandle,
    pub help_url: StringHandle,
    /// Number of geometry input slots
    pub geo_input_count: u32,
}

/// Parameter value as exchanged with the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParmValue {
    Int(i64),
    Float(f64),
    Text(String),
    /// Operator-path parameter pointing at another remote node
    Node(RemoteNodeId),
}

impl fmt::Display for ParmValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParmValue::Int(v) => write!(f, "{}", v),
            ParmValue::Float(v) => write!(f, "{}", v),
            ParmValue::Text(v) => write!(f, "{}", v),
            ParmValue::Node(id) => write!(f, "{}", id),
        }
    }
}

/// Parameter description returned by the engine
#[derive(Debug, Clone, PartialEq)]
pub struct ParmInfo {
    /// Stable parameter identity within one instantiation
    pub id: i32,
    pub name: StringHandle,
    pub value: ParmValue,
    pub default: ParmValue,
    pub tags: Vec<String>,
}

impl ParmInfo {
    /// Operator-path parameters become node-typed inputs
    pub fn is_node_ref(&self) -> bool {
        matches!(self.default, ParmValue::Node(_))
    }
}

/// Cook progress as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCookState {
    Ready,
    ReadyWithErrors,
    ReadyWithFatalErrors,
    Cooking,
    Loading,
}

/// Output geometry container
#[derive(Debug, Clone, PartialEq)]
pub struct GeoInfo {
    pub node_id: RemoteNodeId,
    pub name: StringHandle,
    pub part_count: u32,
}

/// Part classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartKind {
    Mesh,
    Curve,
    Points,
    Instancer,
    Volume,
}

/// One part of an output geometry
#[derive(Debug, Clone, PartialEq)]
pub struct PartInfo {
    pub index: u32,
    pub name: StringHandle,
    pub kind: PartKind,
    pub point_count: u32,
    /// Partition value the host splits outputs by. Null when unsplit.
    pub split_value: StringHandle,
}

/// Top-level sub-pipeline node inside an asset
#[derive(Debug, Clone, PartialEq)]
pub struct SubPipelineInfo {
    pub node_id: RemoteNodeId,
    pub name: StringHandle,
}

/// Call-in surface of the remote compute engine.
///
/// Every method may block for the duration of a round trip. Implementations
/// must be shareable with worker threads.
pub trait RemoteEngine: Send + Sync {
    /// Whether the client library for the engine is available at all
    fn is_library_loaded(&self) -> bool;

    // Session management

    /// Launch a server process listening on `name`
    fn start_server(&self, kind: SessionKind, name: &str, options: &ServerOptions)
        -> RemoteResult<()>;

    /// Launch an interactive engine process that publishes a session named `name`
    fn launch_interactive(&self, name: &str) -> RemoteResult<()>;

    /// Connect to a server listening on `name`
    fn create_session(&self, kind: SessionKind, name: &str) -> RemoteResult<SessionHandle>;

    /// Handshake after connecting. `AlreadyInitialized` is not an error for callers.
    fn initialize(&self, session: &SessionHandle) -> RemoteResult<()>;

    fn set_server_env(&self, session: &SessionHandle, key: &str, value: &str) -> RemoteResult<()>;

    fn close_session(&self, session: &SessionHandle) -> RemoteResult<()>;

    /// Liveness probe
    fn is_session_valid(&self, session: &SessionHandle) -> RemoteResult<()>;

    // Asset libraries

    fn load_library_from_file(&self, session: &SessionHandle, path: &Path)
        -> RemoteResult<LibraryId>;

    fn load_library_from_buffer(&self, session: &SessionHandle, bytes: &[u8])
        -> RemoteResult<LibraryId>;

    fn available_operators(&self, session: &SessionHandle, library: LibraryId)
        -> RemoteResult<Vec<StringHandle>>;

    // Nodes

    fn create_node(&self, session: &SessionHandle, operator: &str, name: &str)
        -> RemoteResult<RemoteNodeId>;

    fn delete_node(&self, session: &SessionHandle, node: RemoteNodeId) -> RemoteResult<()>;

    fn node_by_path(&self, session: &SessionHandle, path: &str) -> RemoteResult<RemoteNodeId>;

    fn asset_info(&self, session: &SessionHandle, node: RemoteNodeId) -> RemoteResult<AssetInfo>;

    fn set_display(&self, session: &SessionHandle, node: RemoteNodeId, visible: bool)
        -> RemoteResult<()>;

    fn set_object_transform(
        &self,
        session: &SessionHandle,
        node: RemoteNodeId,
        transform: &Transform,
    ) -> RemoteResult<()>;

    fn sub_pipelines(&self, session: &SessionHandle, node: RemoteNodeId)
        -> RemoteResult<Vec<SubPipelineInfo>>;

    // Parameters and inputs

    fn parameters(&self, session: &SessionHandle, node: RemoteNodeId)
        -> RemoteResult<Vec<ParmInfo>>;

    fn set_parameter(
        &self,
        session: &SessionHandle,
        node: RemoteNodeId,
        name: &str,
        value: &ParmValue,
    ) -> RemoteResult<()>;

    fn connect_input(
        &self,
        session: &SessionHandle,
        node: RemoteNodeId,
        index: u32,
        upstream: RemoteNodeId,
    ) -> RemoteResult<()>;

    fn disconnect_input(&self, session: &SessionHandle, node: RemoteNodeId, index: u32)
        -> RemoteResult<()>;

    /// Create a standalone node that receives host-provided data
    fn create_input_node(&self, session: &SessionHandle, name: &str) -> RemoteResult<RemoteNodeId>;

    fn set_input_payload(&self, session: &SessionHandle, node: RemoteNodeId, payload: &[u8])
        -> RemoteResult<()>;

    /// Hand the engine a change token for partial re-evaluation
    fn set_delta_info(&self, session: &SessionHandle, node: RemoteNodeId, token: &str)
        -> RemoteResult<()>;

    // Cooking

    /// Nodes whose cook produces this node's outputs
    fn cook_targets(&self, session: &SessionHandle, node: RemoteNodeId)
        -> RemoteResult<Vec<RemoteNodeId>>;

    /// Start cooking `node`. Completion is observed through [`RemoteEngine::cook_state`].
    fn cook_node(&self, session: &SessionHandle, node: RemoteNodeId) -> RemoteResult<()>;

    fn cook_state(&self, session: &SessionHandle) -> RemoteResult<RemoteCookState>;

    /// Human readable status of the last cook
    fn status_text(&self, session: &SessionHandle) -> RemoteResult<String>;

    fn output_geos(&self, session: &SessionHandle, node: RemoteNodeId)
        -> RemoteResult<Vec<GeoInfo>>;

    fn part_info(&self, session: &SessionHandle, geo: RemoteNodeId, part: u32)
        -> RemoteResult<PartInfo>;

    // Strings

    /// Resolve handles to text, one string per handle, in order
    fn resolve_strings(&self, session: &SessionHandle, handles: &[StringHandle])
        -> RemoteResult<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_node_id_validity() {
        assert!(!RemoteNodeId::NONE.is_valid());
        assert!(!RemoteNodeId::default().is_valid());
        assert!(RemoteNodeId(0).is_valid());
        assert_eq!(format!("{:?}", RemoteNodeId::NONE), "RemoteNodeId(NONE)");
    }

    #[test]
    fn test_transform_identity() {
        assert!(Transform::default().is_identity());
        assert!(!Transform::from_translation(1.0, 0.0, 0.0).is_identity());
    }

    #[test]
    fn test_node_ref_parameter() {
        let parm = ParmInfo {
            id: 3,
            name: StringHandle(7),
            value: ParmValue::Node(RemoteNodeId::NONE),
            default: ParmValue::Node(RemoteNodeId::NONE),
            tags: Vec::new(),
        };
        assert!(parm.is_node_ref());
    }
}

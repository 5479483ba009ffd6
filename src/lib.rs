//! # cookbridge: session manager and cook scheduler for a remote compute engine
//!
//! A host application (an editor, a game runtime) describes procedural nodes
//! and edits their parameters and inputs. The actual geometry work happens in
//! an out-of-process compute engine reached through the [`RemoteEngine`]
//! trait. This crate keeps the two in step:
//!
//! - **Session**: one engine session per process, started on demand, probed
//!   for liveness, and torn down cleanly when it dies
//! - **Pipeline**: per-node instantiate / upload / cook / read-outputs runs,
//!   driven one at a time from the host tick
//! - **Workers**: blocking remote calls run on a tokio blocking pool and come
//!   back as continuations applied on the scheduling thread
//! - **Communication**: crossbeam channels between the host and the
//!   scheduler thread
//!
//! ## Configuration
//!
//! Engine settings are stored in the platform data directory under
//! `dev.hxyulin.cookbridge` (see [`config`]).
//!
//! ## Example
//!
//! ```ignore
//! use cookbridge::{CookBackend, EngineSettings, MockEngine, RecordingScene};
//! use std::sync::Arc;
//!
//! let engine = Arc::new(MockEngine::new());
//! let (backend, handle) = CookBackend::new(
//!     engine,
//!     EngineSettings::load_or_default(),
//!     Box::new(RecordingScene::new()),
//! )?;
//! std::thread::spawn(move || backend.run());
//!
//! handle.register_asset("shapes", Some("/assets/shapes.lib".into()), Vec::new());
//! handle.register_node("rock", "shapes", None);
//! handle.request_cook("rock", CookRequest::Requested);
//! for msg in handle.drain() {
//!     println!("{:?}", msg);
//! }
//! ```

pub mod asset;
pub mod bridge;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod node;
pub mod output;
pub mod pipeline;
pub mod resolver;
pub mod scheduler;
pub mod session;

// Re-export commonly used types
pub use bridge::{HostHandle, HostMessage, NodeEvent, SchedulerCommand, SessionStatus};
pub use config::{EngineSettings, Preset};
pub use engine::{MockEngine, ParmValue, RemoteEngine, Transform};
pub use error::{CookError, Result};
pub use node::{CookRequest, Node, NodeKey};
pub use output::{HostScene, RecordingScene};
pub use scheduler::{CookBackend, Scheduler};
pub use session::StartMode;

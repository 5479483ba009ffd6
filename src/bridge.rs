//! Host-facing channels
//!
//! The scheduler talks to the host application through two crossbeam
//! channels:
//!
//! - [`SchedulerCommand`] - host to scheduler (register nodes, edit, cook, session control)
//! - [`HostMessage`] - scheduler to host (node events, status text, progress, frame rate)
//!
//! [`HostSender`] is the write side used inside the crate. It never blocks:
//! when the host stops draining, messages are dropped and counted.
//! [`HostHandle`] is the host side returned by [`crate::scheduler::CookBackend::new`].
//!
//! # Example
//!
//! ```ignore
//! let (backend, host) = CookBackend::new(engine, settings, scene)?;
//! std::thread::spawn(move || backend.run());
//!
//! host.register_asset("shapes", Some("/assets/shapes.lib".into()), Vec::new());
//! host.register_node("rock_1", "shapes", None);
//! host.request_cook("rock_1", CookRequest::Requested);
//!
//! for msg in host.drain() {
//!     if let HostMessage::Node { name, event: NodeEvent::FinishCook, .. } = msg {
//!         println!("{} cooked", name);
//!     }
//! }
//! ```

use crate::engine::{ParmValue, Transform};
use crate::node::input::InputSource;
use crate::node::{CookRequest, NodeKey};
use crate::session::StartMode;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Per-node lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeEvent {
    /// Only UI state changed (for example the deferred-cook flag)
    RefreshUiOnly,
    /// A pipeline run started for the node
    StartCook,
    /// The node has a fresh remote instantiation
    FinishInstantiate,
    /// The pipeline run finished and outputs are current
    FinishCook,
    /// The node was unregistered
    Destroy,
}

/// Session state as shown to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionStatus {
    /// No session
    #[default]
    Disconnected,
    /// A session start is in flight
    Connecting,
    /// Connected and ready
    Connected { sync: bool },
    /// The session was lost and has been invalidated
    Lost,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Disconnected => write!(f, "Disconnected"),
            SessionStatus::Connecting => write!(f, "Connecting..."),
            SessionStatus::Connected { sync: true } => write!(f, "Connected (sync)"),
            SessionStatus::Connected { sync: false } => write!(f, "Connected"),
            SessionStatus::Lost => write!(f, "Session lost"),
        }
    }
}

/// Message sent from the scheduler to the host
#[derive(Debug, Clone, PartialEq)]
pub enum HostMessage {
    /// Per-node event
    Node {
        node: NodeKey,
        name: String,
        event: NodeEvent,
    },
    /// Async status line. `None` fades the line out.
    AsyncStatus(Option<String>),
    /// Main task progress in `0.0..=1.0`. `None` closes the progress display.
    MainProgress(Option<(f32, String)>),
    /// Cap the host frame rate while a cook runs
    LimitFrameRate(f32),
    /// Undo [`HostMessage::LimitFrameRate`]
    RestoreFrameRate,
    /// Session status changed
    Session(SessionStatus),
    /// User-facing notification
    Notification(String),
    /// The scheduler loop is exiting
    Shutdown,
}

/// Write side of the host message channel
#[derive(Debug, Clone)]
pub struct HostSender {
    sender: Sender<HostMessage>,
    dropped: Arc<AtomicU64>,
}

impl HostSender {
    pub fn new(sender: Sender<HostMessage>) -> Self {
        Self {
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Send without blocking. Returns false if the message was dropped.
    pub fn send(&self, msg: HostMessage) -> bool {
        match self.sender.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let count = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if count % 1000 == 1 {
                    tracing::warn!("Host message queue full, {} messages dropped so far", count);
                }
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Number of messages dropped because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn node_event(&self, node: NodeKey, name: &str, event: NodeEvent) {
        self.send(HostMessage::Node {
            node,
            name: name.to_string(),
            event,
        });
    }

    pub fn async_status(&self, text: Option<String>) {
        self.send(HostMessage::AsyncStatus(text));
    }

    pub fn main_progress(&self, progress: Option<(f32, String)>) {
        self.send(HostMessage::MainProgress(progress));
    }

    pub fn session_status(&self, status: SessionStatus) {
        self.send(HostMessage::Session(status));
    }

    pub fn notify(&self, text: impl Into<String>) {
        self.send(HostMessage::Notification(text.into()));
    }
}

/// Message sent from the host to the scheduler
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerCommand {
    /// Register an asset library by file path and/or in-memory buffer
    RegisterAsset {
        name: String,
        path: Option<PathBuf>,
        buffer: Vec<u8>,
    },
    /// Register a node backed by an asset library
    RegisterNode {
        name: String,
        asset: String,
        operator: Option<String>,
    },
    /// Request or force a cook
    RequestCook { node: String, method: CookRequest },
    /// Edit a parameter value
    SetParameter {
        node: String,
        parameter: String,
        value: ParmValue,
    },
    /// Bind a source to a named input
    BindInput {
        node: String,
        input: String,
        source: InputSource,
    },
    /// Choose a different operator from the asset library
    SelectOperator { node: String, operator: String },
    /// Move the node
    SetTransform { node: String, transform: Transform },
    /// Destroy the node and its remote resources
    DestroyNode { node: String },
    /// Start a session explicitly
    StartSession(StartMode),
    /// Close the session and invalidate all nodes
    StopSession,
    /// Exit the scheduler loop
    Shutdown,
}

/// Host side of the scheduler channels
pub struct HostHandle {
    /// Receiver for scheduler messages
    pub receiver: Receiver<HostMessage>,
    /// Sender for commands to the scheduler
    pub command_sender: Sender<SchedulerCommand>,
    /// Cleared to stop the scheduler loop
    pub running: Arc<AtomicBool>,
}

impl HostHandle {
    /// Try to receive a message without blocking
    pub fn try_recv(&self) -> Option<HostMessage> {
        self.receiver.try_recv().ok()
    }

    /// Receive all pending messages
    pub fn drain(&self) -> Vec<HostMessage> {
        let mut messages = Vec::new();
        while let Ok(msg) = self.receiver.try_recv() {
            messages.push(msg);
        }
        messages
    }

    /// Send a command to the scheduler
    pub fn send_command(&self, cmd: SchedulerCommand) -> bool {
        self.command_sender.send(cmd).is_ok()
    }

    pub fn register_asset(&self, name: &str, path: Option<PathBuf>, buffer: Vec<u8>) {
        let _ = self.command_sender.send(SchedulerCommand::RegisterAsset {
            name: name.to_string(),
            path,
            buffer,
        });
    }

    pub fn register_node(&self, name: &str, asset: &str, operator: Option<&str>) {
        let _ = self.command_sender.send(SchedulerCommand::RegisterNode {
            name: name.to_string(),
            asset: asset.to_string(),
            operator: operator.map(str::to_string),
        });
    }

    pub fn request_cook(&self, node: &str, method: CookRequest) {
        let _ = self.command_sender.send(SchedulerCommand::RequestCook {
            node: node.to_string(),
            method,
        });
    }

    pub fn set_parameter(&self, node: &str, parameter: &str, value: ParmValue) {
        let _ = self.command_sender.send(SchedulerCommand::SetParameter {
            node: node.to_string(),
            parameter: parameter.to_string(),
            value,
        });
    }

    pub fn bind_input(&self, node: &str, input: &str, source: InputSource) {
        let _ = self.command_sender.send(SchedulerCommand::BindInput {
            node: node.to_string(),
            input: input.to_string(),
            source,
        });
    }

    pub fn start_session(&self, mode: StartMode) {
        let _ = self
            .command_sender
            .send(SchedulerCommand::StartSession(mode));
    }

    /// Request shutdown
    pub fn shutdown(&self) {
        let _ = self.command_sender.send(SchedulerCommand::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn test_sender_counts_drops() {
        let (tx, rx) = bounded(1);
        let sender = HostSender::new(tx);
        assert!(sender.send(HostMessage::RestoreFrameRate));
        assert!(!sender.send(HostMessage::RestoreFrameRate));
        assert_eq!(sender.dropped(), 1);
        assert_eq!(rx.try_recv().unwrap(), HostMessage::RestoreFrameRate);
    }

    #[test]
    fn test_handle_drain_and_commands() {
        let (msg_tx, msg_rx) = bounded(16);
        let (cmd_tx, cmd_rx) = bounded(16);
        let handle = HostHandle {
            receiver: msg_rx,
            command_sender: cmd_tx,
            running: Arc::new(AtomicBool::new(true)),
        };

        let sender = HostSender::new(msg_tx);
        sender.async_status(Some("rock: Start Cook".to_string()));
        sender.async_status(None);
        assert_eq!(handle.drain().len(), 2);
        assert!(handle.try_recv().is_none());

        handle.request_cook("rock", CookRequest::Forced);
        assert_eq!(
            cmd_rx.try_recv().unwrap(),
            SchedulerCommand::RequestCook {
                node: "rock".to_string(),
                method: CookRequest::Forced,
            }
        );
    }

    #[test]
    fn test_session_status_display() {
        assert_eq!(SessionStatus::default().to_string(), "Disconnected");
        assert_eq!(
            SessionStatus::Connected { sync: true }.to_string(),
            "Connected (sync)"
        );
    }
}

//! Threaded scheduler loop
//!
//! [`CookBackend`] owns a [`Scheduler`] on its own thread and talks to the
//! host over two bounded crossbeam channels: [`SchedulerCommand`]s in,
//! [`HostMessage`]s out. Edits that arrive while a pipeline is in flight are
//! held back and replayed in arrival order once edits are allowed again.

use super::{Scheduler, HOST_QUEUE_CAPACITY};
use crate::bridge::{HostHandle, HostMessage, HostSender, SchedulerCommand};
use crate::config::EngineSettings;
use crate::engine::RemoteEngine;
use crate::error::{CookError, Result};
use crate::node::NodeKey;
use crate::output::HostScene;
use crossbeam_channel::{bounded, Receiver, TryRecvError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Capacity of the host to scheduler command queue
const COMMAND_QUEUE_CAPACITY: usize = 256;

/// Loop period, roughly one host frame
const TICK_INTERVAL: Duration = Duration::from_millis(16);

pub struct CookBackend {
    scheduler: Scheduler,
    command_rx: Receiver<SchedulerCommand>,
    running: Arc<AtomicBool>,
    /// Commands refused with [`CookError::Busy`], oldest first
    deferred: VecDeque<SchedulerCommand>,
    last_tick: Instant,
}

impl CookBackend {
    /// Create a backend with its communication channels
    pub fn new(
        engine: Arc<dyn RemoteEngine>,
        settings: EngineSettings,
        scene: Box<dyn HostScene>,
    ) -> Result<(Self, HostHandle)> {
        let (cmd_tx, cmd_rx) = bounded(COMMAND_QUEUE_CAPACITY);
        let (msg_tx, msg_rx) = bounded(HOST_QUEUE_CAPACITY);
        let scheduler = Scheduler::with_host(engine, settings, scene, HostSender::new(msg_tx))?;
        let running = Arc::new(AtomicBool::new(true));

        let backend = Self {
            scheduler,
            command_rx: cmd_rx,
            running: running.clone(),
            deferred: VecDeque::new(),
            last_tick: Instant::now(),
        };
        let handle = HostHandle {
            receiver: msg_rx,
            command_sender: cmd_tx,
            running,
        };
        Ok((backend, handle))
    }

    /// Get a handle to stop the loop
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Run the loop until shutdown. Call this from a dedicated thread.
    pub fn run(mut self) {
        tracing::info!("Cook scheduler started");

        while self.running.load(Ordering::SeqCst) {
            self.process_commands();

            let now = Instant::now();
            self.scheduler.tick(now - self.last_tick);
            self.last_tick = now;

            std::thread::sleep(TICK_INTERVAL);
        }

        self.scheduler.shutdown();
        self.scheduler.host().send(HostMessage::Shutdown);
        tracing::info!("Cook scheduler stopped");
    }

    /// Process pending commands from the host
    fn process_commands(&mut self) {
        if self.scheduler.allow_edit() {
            while let Some(cmd) = self.deferred.pop_front() {
                if self.handle_command(cmd, true) || !self.scheduler.allow_edit() {
                    break;
                }
            }
        }

        loop {
            match self.command_rx.try_recv() {
                Ok(cmd) if !self.deferred.is_empty() => self.deferred.push_back(cmd),
                Ok(cmd) => {
                    self.handle_command(cmd, false);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.running.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }
    }

    /// Handle a single command. Returns true when it was deferred.
    ///
    /// A `replayed` command that is refused again goes back to the front of
    /// the queue so later commands stay behind it.
    fn handle_command(&mut self, cmd: SchedulerCommand, replayed: bool) -> bool {
        match self.execute(cmd.clone()) {
            Ok(()) => false,
            Err(CookError::Busy(what)) => {
                tracing::debug!("Deferring {} until the engine is idle", what);
                if replayed {
                    self.deferred.push_front(cmd);
                } else {
                    self.deferred.push_back(cmd);
                }
                true
            }
            Err(e) => {
                tracing::warn!("Command failed: {}", e);
                self.scheduler.host().notify(e.to_string());
                false
            }
        }
    }

    fn execute(&mut self, cmd: SchedulerCommand) -> Result<()> {
        match cmd {
            SchedulerCommand::RegisterAsset { name, path, buffer } => {
                self.scheduler.register_asset(&name, path, buffer);
            }
            SchedulerCommand::RegisterNode {
                name,
                asset,
                operator,
            } => {
                self.scheduler.register_node(&name, &asset, operator.as_deref())?;
            }
            SchedulerCommand::RequestCook { node, method } => {
                let key = self.lookup(&node)?;
                self.scheduler.request_cook(key, method)?;
            }
            SchedulerCommand::SetParameter {
                node,
                parameter,
                value,
            } => {
                let key = self.lookup(&node)?;
                self.scheduler.set_parameter(key, &parameter, value)?;
            }
            SchedulerCommand::BindInput { node, input, source } => {
                let key = self.lookup(&node)?;
                self.scheduler.bind_input(key, &input, source)?;
            }
            SchedulerCommand::SelectOperator { node, operator } => {
                let key = self.lookup(&node)?;
                self.scheduler.select_operator(key, &operator)?;
            }
            SchedulerCommand::SetTransform { node, transform } => {
                let key = self.lookup(&node)?;
                self.scheduler.set_transform(key, transform)?;
            }
            SchedulerCommand::DestroyNode { node } => {
                let key = self.lookup(&node)?;
                self.scheduler.destroy_node(key)?;
            }
            SchedulerCommand::StartSession(mode) => {
                self.scheduler.start_session(mode)?;
            }
            SchedulerCommand::StopSession => {
                self.scheduler.stop_session();
            }
            SchedulerCommand::Shutdown => {
                self.running.store(false, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<NodeKey> {
        self.scheduler
            .find_node(name)
            .ok_or(CookError::NodeNotFound(NodeKey::INVALID))
            .map_err(|e| e.with_context(format!("no node named '{}'", name)))
    }
}

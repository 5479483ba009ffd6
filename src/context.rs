//! Scheduling context
//!
//! [`CookContext`] bundles the state the scheduling thread owns: the session,
//! the node and asset registries, the builder registries and the host scene.
//! It is passed explicitly to the pipeline driver instead of living in
//! globals, which keeps the single-session invariant visible in the types.

use crate::asset::AssetRegistry;
use crate::bridge::HostSender;
use crate::config::EngineSettings;
use crate::engine::RemoteEngine;
use crate::node::input::InputBuilders;
use crate::node::NodeRegistry;
use crate::output::{HostScene, OutputBuilders};
use crate::session::SessionManager;
use std::sync::Arc;

pub struct CookContext {
    pub settings: EngineSettings,
    pub session: SessionManager,
    pub nodes: NodeRegistry,
    pub assets: AssetRegistry,
    pub inputs: InputBuilders,
    pub outputs: OutputBuilders,
    pub scene: Box<dyn HostScene>,
    /// Sequence number of the last finished cook
    pub cook_serial: u64,
}

impl CookContext {
    pub fn new(
        engine: Arc<dyn RemoteEngine>,
        settings: EngineSettings,
        scene: Box<dyn HostScene>,
        host: HostSender,
    ) -> Self {
        let session = SessionManager::new(engine, settings.liveness_interval(), host);
        Self {
            settings,
            session,
            nodes: NodeRegistry::new(),
            assets: AssetRegistry::new(),
            inputs: InputBuilders::default(),
            outputs: OutputBuilders::default(),
            scene,
            cook_serial: 0,
        }
    }

    pub fn engine(&self) -> Arc<dyn RemoteEngine> {
        Arc::clone(self.session.engine())
    }

    pub fn host(&self) -> &HostSender {
        self.session.host()
    }

    /// Run the session invalidation sweep over every node
    pub fn invalidate(&mut self) {
        self.session.invalidate(&mut self.nodes);
    }
}

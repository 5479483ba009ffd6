//! Mock construction and inspection helpers

use super::builders::{Harness, SHAPES};
use super::settle_timeout;
use cookbridge::engine::strings::remote_node_name;
use cookbridge::{CookRequest, HostMessage, NodeEvent, NodeKey};

/// Name the engine gives the remote node of `key` running `operator`
pub fn remote_name(operator: &str, key: NodeKey) -> String {
    remote_node_name(operator, key.0)
}

impl Harness {
    /// Register a node on the standard library
    pub fn add(&mut self, name: &str, operator: &str) -> NodeKey {
        self.scheduler
            .register_node(name, SHAPES, Some(operator))
            .expect("register node")
    }

    /// Request a cook and tick until nothing is left to do
    pub fn cook(&mut self, key: NodeKey) {
        self.scheduler
            .request_cook(key, CookRequest::Requested)
            .expect("request cook");
        self.settle();
    }

    pub fn settle(&mut self) {
        assert!(
            self.scheduler.run_until_idle(settle_timeout()),
            "scheduler did not settle"
        );
    }

    /// Every host message sent so far
    pub fn drain(&self) -> Vec<HostMessage> {
        self.messages.try_iter().collect()
    }

    /// Per-node events for `key`, in order
    pub fn events_for(messages: &[HostMessage], key: NodeKey) -> Vec<NodeEvent> {
        messages
            .iter()
            .filter_map(|m| match m {
                HostMessage::Node { node, event, .. } if *node == key => Some(*event),
                _ => None,
            })
            .collect()
    }
}

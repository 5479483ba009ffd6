//! Delta tracking and downstream propagation
//!
//! Every state-changing trigger leaves a forward/inverse token pair on the
//! node. The forward token is handed to the engine for partial re-evaluation
//! on the next cook. Tokens are cleared when that cook finishes; the inverse
//! survives as the node's rebuild token and is replayed to a freshly
//! instantiated node that has no live delta.
//!
//! A second trigger before the cook overwrites the first (last writer wins).

use super::{Node, NodeKey, NodeRegistry};
use crate::engine::ParmValue;

/// Most recent change on a node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaInfo {
    pub forward: String,
    pub inverse: String,
}

impl DeltaInfo {
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty() && self.inverse.is_empty()
    }

    pub fn clear(&mut self) {
        self.forward.clear();
        self.inverse.clear();
    }

    /// Clear the pair after its cook, moving a non-empty inverse into `redelta`
    pub fn consume_into(&mut self, redelta: &mut String) {
        if !self.inverse.is_empty() {
            *redelta = std::mem::take(&mut self.inverse);
        }
        self.clear();
    }
}

/// Overwrite the live delta of `node`
pub fn record_trigger(node: &mut Node, forward: impl Into<String>, inverse: impl Into<String>) {
    let forward = forward.into();
    if !node.delta.is_empty() && node.delta.forward != forward {
        tracing::debug!(
            "{}: delta '{}' replaced by '{}' before it was cooked",
            node.label,
            node.delta.forward,
            forward
        );
    }
    node.delta.forward = forward;
    node.delta.inverse = inverse.into();
}

/// A parameter value changed from `previous` to `current`
pub fn trigger_by_parameter(node: &mut Node, name: &str, previous: &ParmValue, current: &ParmValue) {
    let prefix = format!("{}/parameter/{}/", node.label, name);
    record_trigger(
        node,
        format!("{}{}", prefix, current),
        format!("{}{}", prefix, previous),
    );
    node.request_cook();
}

/// The input at `index` changed. Ignored when input-triggered cooks are disabled.
pub fn trigger_by_input(node: &mut Node, index: usize, cook_on_input_changed: bool) {
    if !cook_on_input_changed {
        return;
    }
    let Some(input) = node.inputs.get(index) else {
        return;
    };
    let prefix = format!(
        "{}/{}/{}/",
        node.label,
        if input.is_parameter() { "parameter" } else { "input" },
        input.name
    );
    record_trigger(node, format!("{}1", prefix), format!("{}0", prefix));
    node.request_cook();
}

/// Schedule cooks on every node that consumes `upstream`.
///
/// For each downstream node that opted into upstream-triggered cooks, the
/// first node-typed input naming `upstream` with change checking enabled is
/// marked changed. If `upstream` carries no live delta the downstream node is
/// simply requested to cook; otherwise the change is forwarded as an input
/// trigger so the downstream cook carries its own token.
///
/// Returns the downstream nodes that were scheduled, in registration order.
pub fn notify_downstream(
    registry: &mut NodeRegistry,
    upstream: NodeKey,
    cook_on_input_changed: bool,
) -> Vec<NodeKey> {
    let upstream_has_delta = match registry.get(upstream) {
        Some(node) => !node.delta.is_empty(),
        None => return Vec::new(),
    };

    let mut scheduled = Vec::new();
    for key in registry.downstream_of(upstream) {
        let Some(node) = registry.get_mut(key) else {
            continue;
        };
        if !node.cook_on_upstream_changed() {
            continue;
        }
        let Some(index) = node
            .inputs
            .iter()
            .position(|input| input.upstream() == Some(upstream) && input.check_changed)
        else {
            continue;
        };

        node.inputs[index].mark_changed();
        if upstream_has_delta {
            trigger_by_input(node, index, cook_on_input_changed);
        } else {
            node.request_cook();
        }
        if node.needs_cook() {
            scheduled.push(key);
        }
    }
    scheduled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::AssetId;
    use crate::node::{CookRequest, InputBinding, InputKind, InputSource};
    use crate::node::input::Input;

    fn linked_registry() -> (NodeRegistry, NodeKey, NodeKey) {
        let mut registry = NodeRegistry::new();
        let up = registry.register("terrain", AssetId(0));
        let down = registry.register("scatter", AssetId(0));
        let mut input = Input::new("input0", InputKind::Node, InputBinding::Geometry(0));
        input.bind(InputSource::Node(up));
        input.holders[0].changed = false;
        registry.add_input(down, input);
        (registry, up, down)
    }

    #[test]
    fn test_record_trigger_last_writer_wins() {
        let mut node = Node::new(NodeKey(0), "rock", AssetId(0));
        record_trigger(&mut node, "a", "a0");
        record_trigger(&mut node, "b", "b0");
        assert_eq!(node.delta.forward, "b");
        assert_eq!(node.delta.inverse, "b0");
    }

    #[test]
    fn test_parameter_trigger_tokens() {
        let mut node = Node::new(NodeKey(0), "rock", AssetId(0));
        trigger_by_parameter(
            &mut node,
            "radius",
            &ParmValue::Float(1.0),
            &ParmValue::Float(2.5),
        );
        assert_eq!(node.delta.forward, "rock/parameter/radius/2.5");
        assert_eq!(node.delta.inverse, "rock/parameter/radius/1");
        assert!(node.needs_cook());
    }

    #[test]
    fn test_input_trigger_respects_global_flag() {
        let (mut registry, _, down) = linked_registry();
        let node = registry.get_mut(down).unwrap();

        trigger_by_input(node, 0, false);
        assert!(node.delta.is_empty());
        assert!(!node.needs_cook());

        trigger_by_input(node, 0, true);
        assert_eq!(node.delta.forward, "scatter/input/input0/1");
        assert_eq!(node.delta.inverse, "scatter/input/input0/0");
        assert!(node.needs_cook());
    }

    #[test]
    fn test_notify_without_delta_requests_cook() {
        let (mut registry, up, down) = linked_registry();
        assert_eq!(notify_downstream(&mut registry, up, true), vec![down]);

        let node = registry.get(down).unwrap();
        assert_eq!(node.cook_request, CookRequest::Requested);
        assert!(node.delta.is_empty());
        assert!(node.inputs[0].has_pending_upload());
    }

    #[test]
    fn test_notify_with_delta_forwards_trigger() {
        let (mut registry, up, down) = linked_registry();
        record_trigger(registry.get_mut(up).unwrap(), "terrain/x", "terrain/y");

        notify_downstream(&mut registry, up, true);
        assert_eq!(
            registry.get(down).unwrap().delta.forward,
            "scatter/input/input0/1"
        );
    }

    #[test]
    fn test_notify_with_delta_and_input_cooks_disabled_schedules_nothing() {
        let (mut registry, up, down) = linked_registry();
        record_trigger(registry.get_mut(up).unwrap(), "terrain/x", "terrain/y");

        assert!(notify_downstream(&mut registry, up, false).is_empty());
        let node = registry.get(down).unwrap();
        assert!(!node.needs_cook());
        assert!(node.inputs[0].has_pending_upload());
    }

    #[test]
    fn test_finish_keeps_inverse_for_rebuild() {
        let mut node = Node::new(NodeKey(0), "rock", AssetId(0));
        record_trigger(&mut node, "rock/parameter/radius/2", "rock/parameter/radius/1");
        node.delta.consume_into(&mut node.redelta);

        assert!(node.delta.is_empty());
        assert_eq!(node.redelta, "rock/parameter/radius/1");

        // A cook without a trigger leaves the rebuild token alone
        node.delta.consume_into(&mut node.redelta);
        assert_eq!(node.redelta, "rock/parameter/radius/1");
    }

    #[test]
    fn test_notify_respects_opt_out() {
        let (mut registry, up, down) = linked_registry();
        registry.get_mut(down).unwrap().set_cook_on_upstream_changed(false);
        assert!(notify_downstream(&mut registry, up, true).is_empty());

        registry.get_mut(down).unwrap().set_cook_on_upstream_changed(true);
        registry.get_mut(down).unwrap().inputs[0].check_changed = false;
        assert!(notify_downstream(&mut registry, up, true).is_empty());
        assert!(!registry.get(down).unwrap().needs_cook());
    }
}

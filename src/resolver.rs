//! Upstream dependency resolution
//!
//! Before a node cooks, every node feeding one of its node-typed inputs must
//! be instantiated and have no pending cook. [`needs_upstream_cook`] answers
//! that for a single hop: it returns the first offending upstream in input
//! declaration order.
//!
//! [`resolve`] follows those hops until it reaches a node that can run. The
//! visited chain doubles as cycle detection, so a cyclic input graph is
//! reported instead of bouncing the scheduler between two nodes forever.

use crate::node::{NodeKey, NodeRegistry};

/// Outcome of resolving a cook request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Run `target`. `waiting` are the downstream nodes redirected to it,
    /// starting with the requested node.
    Proceed {
        target: NodeKey,
        waiting: Vec<NodeKey>,
    },
    /// The redirect chain came back to a node already on it
    Cycle(Vec<NodeKey>),
    /// `failed` has an unresolved failure and no new trigger
    Blocked {
        failed: NodeKey,
        waiting: Vec<NodeKey>,
    },
}

/// First upstream of `key` that must run before it, in input order.
///
/// An upstream qualifies when it has a pending cook request or has never
/// been instantiated. Unregistered upstreams are skipped. Bindings still
/// pending instantiation are scanned after the node's inputs.
pub fn needs_upstream_cook(registry: &NodeRegistry, key: NodeKey) -> Option<NodeKey> {
    let node = registry.get(key)?;
    node.upstream_keys()
        .find(|upstream| {
            registry
                .get(*upstream)
                .is_some_and(|up| up.needs_cook() || !up.is_instantiated())
        })
}

/// Follow upstream redirects from `key` to the node that should run now
pub fn resolve(registry: &NodeRegistry, key: NodeKey) -> Resolution {
    let mut chain = vec![key];
    let mut current = key;

    while let Some(upstream) = needs_upstream_cook(registry, current) {
        if let Some(pos) = chain.iter().position(|k| *k == upstream) {
            return Resolution::Cycle(chain.split_off(pos));
        }
        let blocked = registry
            .get(upstream)
            .is_some_and(|up| !up.needs_cook() && up.last_failure.is_some());
        if blocked {
            return Resolution::Blocked {
                failed: upstream,
                waiting: chain,
            };
        }
        tracing::trace!("{} waits for upstream {}", current, upstream);
        chain.push(upstream);
        current = upstream;
    }

    chain.pop();
    Resolution::Proceed {
        target: current,
        waiting: chain,
    }
}

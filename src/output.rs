//! Output building and split-instance cleanup
//!
//! After a cook, the parts of every output geometry are described as
//! [`PartDesc`]s and handed to the first [`OutputBuilder`] that accepts them,
//! in registration order. Builders turn parts into [`OutputRecord`]s the host
//! renders.
//!
//! Parts carrying a split value are shown on their own host entity. The node
//! keeps a split value to entity map; entities whose split value no longer
//! appears in the outputs are destroyed through the [`HostScene`].

use crate::engine::{PartKind, RemoteNodeId, Transform};
use crate::error::Result;
use crate::node::Node;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

/// A part of an output geometry, names already resolved
#[derive(Debug, Clone, PartialEq)]
pub struct PartDesc {
    pub geo: RemoteNodeId,
    pub geo_name: String,
    pub index: u32,
    pub name: String,
    pub kind: PartKind,
    pub point_count: u32,
    pub split_value: Option<String>,
}

/// Host-side representation of one built part
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRecord {
    /// Name of the builder that produced it
    pub builder: String,
    pub geo: RemoteNodeId,
    pub part: u32,
    pub name: String,
    pub kind: PartKind,
    pub point_count: u32,
    pub split_value: Option<String>,
    /// Host entity showing this part, for split parts
    pub entity: Option<String>,
}

/// Host scene collaborator
#[cfg_attr(test, mockall::automock)]
pub trait HostScene: Send {
    /// Create an entity and return its stable name
    fn spawn_entity(&mut self, name: &str) -> String;

    /// Destroy an entity. Returns false if it did not exist.
    fn destroy_entity(&mut self, name: &str) -> bool;

    /// Current transform of the entity with this name
    fn entity_transform(&self, name: &str) -> Option<Transform>;
}

/// Builds host outputs for matching parts
pub trait OutputBuilder: Send {
    /// Unique name used for registration
    fn name(&self) -> &str;

    fn matches(&self, part: &PartDesc) -> bool;

    fn build(&self, node_name: &str, part: &PartDesc) -> Result<OutputRecord>;

    /// Split values referenced by `record`
    fn collect_split_values(&self, record: &OutputRecord, out: &mut BTreeSet<String>) {
        if let Some(value) = &record.split_value {
            out.insert(value.clone());
        }
    }
}

fn record(builder: &str, part: &PartDesc) -> OutputRecord {
    OutputRecord {
        builder: builder.to_string(),
        geo: part.geo,
        part: part.index,
        name: part.name.clone(),
        kind: part.kind,
        point_count: part.point_count,
        split_value: part.split_value.clone(),
        entity: None,
    }
}

/// Meshes, curves and point clouds
pub struct MeshOutputBuilder;

impl OutputBuilder for MeshOutputBuilder {
    fn name(&self) -> &str {
        "mesh"
    }

    fn matches(&self, part: &PartDesc) -> bool {
        matches!(part.kind, PartKind::Mesh | PartKind::Curve | PartKind::Points)
    }

    fn build(&self, _node_name: &str, part: &PartDesc) -> Result<OutputRecord> {
        Ok(record(self.name(), part))
    }
}

/// Instancer parts. Empty instancers produce nothing to show.
pub struct InstancerOutputBuilder;

impl OutputBuilder for InstancerOutputBuilder {
    fn name(&self) -> &str {
        "instancer"
    }

    fn matches(&self, part: &PartDesc) -> bool {
        part.kind == PartKind::Instancer && part.point_count > 0
    }

    fn build(&self, node_name: &str, part: &PartDesc) -> Result<OutputRecord> {
        tracing::trace!("{}: {} instances in {}", node_name, part.point_count, part.name);
        Ok(record(self.name(), part))
    }
}

/// Ordered output builder list. The first match wins.
pub struct OutputBuilders {
    builders: Vec<Box<dyn OutputBuilder>>,
}

impl Default for OutputBuilders {
    fn default() -> Self {
        let mut builders = Self::empty();
        builders.register(Box::new(MeshOutputBuilder));
        builders.register(Box::new(InstancerOutputBuilder));
        builders
    }
}

impl OutputBuilders {
    pub fn empty() -> Self {
        Self {
            builders: Vec::new(),
        }
    }

    /// Register a builder unless one with the same name exists
    pub fn register(&mut self, builder: Box<dyn OutputBuilder>) -> bool {
        if self.builders.iter().any(|b| b.name() == builder.name()) {
            return false;
        }
        self.builders.push(builder);
        true
    }

    pub fn find(&self, part: &PartDesc) -> Option<&dyn OutputBuilder> {
        self.builders
            .iter()
            .find(|b| b.matches(part))
            .map(|b| b.as_ref())
    }

    fn by_name(&self, name: &str) -> Option<&dyn OutputBuilder> {
        self.builders
            .iter()
            .find(|b| b.name() == name)
            .map(|b| b.as_ref())
    }

    /// Build every part that some builder accepts
    pub fn build_all(&self, node_name: &str, parts: &[PartDesc]) -> Result<Vec<OutputRecord>> {
        let mut records = Vec::with_capacity(parts.len());
        for part in parts {
            match self.find(part) {
                Some(builder) => records.push(builder.build(node_name, part)?),
                None => tracing::debug!("{}: no output builder for {:?} part '{}'", node_name, part.kind, part.name),
            }
        }
        Ok(records)
    }

    /// Split values referenced by `records`
    pub fn collect_split_values(&self, records: &[OutputRecord]) -> BTreeSet<String> {
        let mut values = BTreeSet::new();
        for record in records {
            if let Some(builder) = self.by_name(&record.builder) {
                builder.collect_split_values(record, &mut values);
            }
        }
        values
    }

    pub fn len(&self) -> usize {
        self.builders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }
}

/// Store freshly built outputs on `node`.
///
/// Split parts are attached to the node's entity for their split value,
/// spawning entities for new values. Entities for values that disappeared
/// are destroyed.
pub fn apply_outputs(
    node: &mut Node,
    mut records: Vec<OutputRecord>,
    builders: &OutputBuilders,
    scene: &mut dyn HostScene,
) -> Vec<String> {
    for record in &mut records {
        let Some(value) = &record.split_value else {
            continue;
        };
        let entity = node
            .split_instances
            .entry(value.clone())
            .or_insert_with(|| scene.spawn_entity(&format!("{}_{}", node.name, value)));
        record.entity = Some(entity.clone());
    }

    let produced = builders.collect_split_values(&records);
    node.outputs = records;
    cleanup_split_instances(&mut node.split_instances, &produced, scene)
}

/// Destroy entities whose split value is not in `produced`. Returns their names.
pub fn cleanup_split_instances(
    instances: &mut BTreeMap<String, String>,
    produced: &BTreeSet<String>,
    scene: &mut dyn HostScene,
) -> Vec<String> {
    let stale: Vec<String> = instances
        .keys()
        .filter(|value| !produced.contains(*value))
        .cloned()
        .collect();

    let mut destroyed = Vec::with_capacity(stale.len());
    for value in stale {
        if let Some(entity) = instances.remove(&value) {
            if !scene.destroy_entity(&entity) {
                tracing::debug!("Split entity '{}' was already gone", entity);
            }
            destroyed.push(entity);
        }
    }
    destroyed
}

/// What a [`RecordingScene`] has seen
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SceneLog {
    pub live: BTreeSet<String>,
    pub spawned: Vec<String>,
    pub destroyed: Vec<String>,
    pub transforms: BTreeMap<String, Transform>,
}

/// In-memory host scene. Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct RecordingScene {
    log: Arc<Mutex<SceneLog>>,
}

impl RecordingScene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far
    pub fn log(&self) -> SceneLog {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Place a host entity, as if the user moved it
    pub fn set_transform(&self, name: &str, transform: Transform) {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .transforms
            .insert(name.to_string(), transform);
    }
}

impl HostScene for RecordingScene {
    fn spawn_entity(&mut self, name: &str) -> String {
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        log.live.insert(name.to_string());
        log.spawned.push(name.to_string());
        name.to_string()
    }

    fn destroy_entity(&mut self, name: &str) -> bool {
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        log.destroyed.push(name.to_string());
        log.live.remove(name)
    }

    fn entity_transform(&self, name: &str) -> Option<Transform> {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .transforms
            .get(name)
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::AssetId;
    use crate::node::NodeKey;
    use mockall::predicate::eq;

    fn part(name: &str, kind: PartKind, split: Option<&str>) -> PartDesc {
        PartDesc {
            geo: RemoteNodeId(2),
            geo_name: "geo".to_string(),
            index: 0,
            name: name.to_string(),
            kind,
            point_count: 4,
            split_value: split.map(str::to_string),
        }
    }

    #[test]
    fn test_registration_order_and_fallthrough() {
        let builders = OutputBuilders::default();
        assert_eq!(builders.len(), 2);
        assert_eq!(builders.find(&part("a", PartKind::Curve, None)).unwrap().name(), "mesh");
        assert_eq!(
            builders.find(&part("b", PartKind::Instancer, None)).unwrap().name(),
            "instancer"
        );
        assert!(builders.find(&part("c", PartKind::Volume, None)).is_none());

        let records = builders
            .build_all(
                "rock",
                &[part("a", PartKind::Mesh, None), part("c", PartKind::Volume, None)],
            )
            .unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_collect_split_values() {
        let builders = OutputBuilders::default();
        let records = builders
            .build_all(
                "rock",
                &[
                    part("a", PartKind::Mesh, Some("red")),
                    part("b", PartKind::Mesh, Some("blue")),
                    part("c", PartKind::Mesh, None),
                ],
            )
            .unwrap();
        let values: Vec<_> = builders.collect_split_values(&records).into_iter().collect();
        assert_eq!(values, vec!["blue", "red"]);
    }

    #[test]
    fn test_cleanup_destroys_stale_entities() {
        let mut instances = BTreeMap::new();
        instances.insert("red".to_string(), "rock_red".to_string());
        instances.insert("blue".to_string(), "rock_blue".to_string());
        let produced: BTreeSet<String> = ["red".to_string()].into_iter().collect();

        let mut scene = MockHostScene::new();
        scene
            .expect_destroy_entity()
            .with(eq("rock_blue"))
            .times(1)
            .return_const(true);

        let destroyed = cleanup_split_instances(&mut instances, &produced, &mut scene);
        assert_eq!(destroyed, vec!["rock_blue"]);
        assert_eq!(instances.len(), 1);
    }

    #[test]
    fn test_apply_outputs_reuses_entities() {
        let builders = OutputBuilders::default();
        let mut scene = RecordingScene::new();
        let mut node = Node::new(NodeKey(0), "rock", AssetId(0));

        let first = builders
            .build_all("rock", &[part("a", PartKind::Mesh, Some("red"))])
            .unwrap();
        apply_outputs(&mut node, first, &builders, &mut scene);
        let second = builders
            .build_all(
                "rock",
                &[
                    part("a", PartKind::Mesh, Some("red")),
                    part("b", PartKind::Mesh, Some("blue")),
                ],
            )
            .unwrap();
        apply_outputs(&mut node, second, &builders, &mut scene);

        let log = scene.log();
        assert_eq!(log.spawned, vec!["rock_red", "rock_blue"]);
        assert_eq!(node.outputs[0].entity.as_deref(), Some("rock_red"));

        let third = builders.build_all("rock", &[part("a", PartKind::Mesh, None)]).unwrap();
        let destroyed = apply_outputs(&mut node, third, &builders, &mut scene);
        assert_eq!(destroyed, vec!["rock_blue", "rock_red"]);
        assert!(scene.log().live.is_empty());
    }
}

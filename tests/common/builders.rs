//! Test data builders for creating schedulers over the mock engine

use cookbridge::engine::mock::{MockEngine, MockOperator, MockPart};
use cookbridge::{EngineSettings, HostMessage, ParmValue, RecordingScene, Scheduler};
use crossbeam_channel::Receiver;
use std::sync::Arc;

/// Path the standard test library is registered under
pub const SHAPES_LIBRARY: &str = "/assets/shapes.lib";

/// Asset name the standard test library is registered as
pub const SHAPES: &str = "shapes";

/// Operators of the standard test library
pub fn shape_operators() -> Vec<MockOperator> {
    vec![
        MockOperator::new("Sop/sphere").parm("radius", ParmValue::Float(1.0)),
        MockOperator::new("Sop/subdivide")
            .parm("iterations", ParmValue::Int(1))
            .geo_inputs(1),
        MockOperator::new("Sop/copy")
            .parm("count", ParmValue::Int(2))
            .node_parm("source"),
        MockOperator::new("Sop/scatter").parts(vec![
            MockPart::mesh("scatter").split("red"),
            MockPart::mesh("scatter").split("blue"),
        ]),
        MockOperator::new("Sop/terrain").sub_pipeline("erosion"),
        MockOperator::new("Obj/camera").object_level(),
    ]
}

/// A scheduler plus everything a test wants to look at
pub struct Harness {
    pub scheduler: Scheduler,
    pub engine: Arc<MockEngine>,
    pub scene: RecordingScene,
    pub messages: Receiver<HostMessage>,
}

/// Builder for test harnesses
pub struct HarnessBuilder {
    engine: MockEngine,
    settings: EngineSettings,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        let mut settings = EngineSettings::default();
        settings.worker_threads = 2;
        settings.sync_retry_interval_ms = 1;
        Self {
            engine: MockEngine::new().with_library_file(SHAPES_LIBRARY, shape_operators()),
            settings,
        }
    }

    pub fn engine(mut self, f: impl FnOnce(MockEngine) -> MockEngine) -> Self {
        self.engine = f(self.engine);
        self
    }

    pub fn settings(mut self, f: impl FnOnce(&mut EngineSettings)) -> Self {
        f(&mut self.settings);
        self
    }

    pub fn build(self) -> Harness {
        let engine = Arc::new(self.engine);
        let scene = RecordingScene::new();
        let (mut scheduler, messages) =
            Scheduler::new(engine.clone(), self.settings, Box::new(scene.clone()))
                .expect("scheduler");
        scheduler.register_asset(SHAPES, Some(SHAPES_LIBRARY.into()), Vec::new());
        Harness {
            scheduler,
            engine,
            scene,
            messages,
        }
    }
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_harness_builder() {
        let harness = HarnessBuilder::new()
            .settings(|s| s.verbose = true)
            .build();

        assert!(harness.scheduler.settings().verbose);
        assert!(harness.scheduler.nodes().is_empty());
        assert!(!harness.engine.has_session());
    }
}

//! Scheduler-wide properties
//!
//! - At most one instantiate or cook is in flight at any time
//! - Upstream nodes finish before the downstream cooks they trigger
//! - Repeated invalidation leaves the same end state
//! - Session loss at any pipeline or rebuild step clears the node's remote ids
//! - The live delta reaches the engine once and is cleared by the cook
//! - A rebuild replays the inverse token of the last consumed delta

mod common;

use common::builders::HarnessBuilder;
use common::mock_helpers::remote_name;
use cookbridge::engine::mock::MockCall;
use cookbridge::engine::{RemoteNodeId, ResultCode};
use cookbridge::node::input::InputSource;
use cookbridge::{CookRequest, ParmValue};
use proptest::prelude::*;
use serial_test::serial;
use std::time::Duration;

#[test]
#[serial]
fn test_cooks_never_overlap() {
    let mut h = HarnessBuilder::new()
        .engine(|e| e.with_call_delay(Duration::from_millis(5)).with_cook_polls(2))
        .settings(|s| s.worker_threads = 4)
        .build();
    let keys: Vec<_> = (0..4).map(|i| h.add(&format!("n{}", i), "Sop/sphere")).collect();
    for key in &keys {
        h.scheduler.request_cook(*key, CookRequest::Forced).unwrap();
    }

    h.settle();

    assert_eq!(h.engine.max_concurrent_calls(), 1);
    assert!(h.scheduler.session().tasks().peak() <= 1);
    for key in keys {
        assert_eq!(h.scheduler.node(key).unwrap().finished_cooks, 1);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_cooks_never_overlap(triggers in prop::collection::vec((0usize..3, any::<bool>()), 1..12)) {
        let mut h = HarnessBuilder::new()
            .engine(|e| e.with_call_delay(Duration::from_millis(1)))
            .settings(|s| s.worker_threads = 3)
            .build();
        let keys: Vec<_> = (0..3).map(|i| h.add(&format!("n{}", i), "Sop/sphere")).collect();

        for (index, force) in triggers {
            let method = if force { CookRequest::Forced } else { CookRequest::Requested };
            h.scheduler.request_cook(keys[index], method).unwrap();
            h.scheduler.tick(Duration::from_millis(1));
            prop_assert!(h.scheduler.session().tasks().count() <= 1);
        }
        h.settle();

        prop_assert!(h.engine.max_concurrent_calls() <= 1);
        prop_assert!(h.scheduler.session().tasks().peak() <= 1);
    }
}

#[test]
fn test_upstream_finishes_before_downstream() {
    let mut h = HarnessBuilder::new().build();
    let a = h.add("a", "Sop/sphere");
    let b = h.add("b", "Sop/subdivide");
    let c = h.add("c", "Sop/subdivide");
    h.scheduler.bind_input(b, "input0", InputSource::Node(a)).unwrap();
    h.scheduler.bind_input(c, "input0", InputSource::Node(b)).unwrap();
    h.settle();

    h.scheduler
        .set_parameter(a, "radius", ParmValue::Float(4.0))
        .unwrap();
    h.settle();

    let serial = |key| h.scheduler.node(key).unwrap().last_cook_serial.unwrap();
    assert!(serial(a) < serial(b));
    assert!(serial(b) < serial(c));

    let cooked_at = |key| h.scheduler.node(key).unwrap().last_cooked_at.unwrap();
    assert!(cooked_at(a) <= cooked_at(b));
    assert!(cooked_at(b) <= cooked_at(c));

    for key in [a, b, c] {
        assert_eq!(h.scheduler.node(key).unwrap().finished_cooks, 2);
    }
}

#[test]
fn test_invalidate_is_idempotent() {
    let mut h = HarnessBuilder::new().build();
    let a = h.add("a", "Sop/sphere");
    let b = h.add("b", "Sop/scatter");
    h.cook(a);
    h.cook(b);

    let snapshot = |h: &common::builders::Harness| {
        let session = h.scheduler.session();
        let ids: Vec<_> = h
            .scheduler
            .nodes()
            .iter()
            .map(|n| (n.remote_id, n.geo_id, n.state()))
            .collect();
        (session.handle(), session.tasks().count(), session.is_usable(), ids)
    };

    h.scheduler.invalidate();
    let once = snapshot(&h);
    h.scheduler.invalidate();
    let twice = snapshot(&h);

    assert_eq!(once, twice);
    assert_eq!(once.0, None);
    assert_eq!(once.1, 0);
    for (remote, geo, _) in once.3 {
        assert_eq!(remote, RemoteNodeId::NONE);
        assert_eq!(geo, RemoteNodeId::NONE);
    }
    assert!(!h.engine.has_session());
}

#[test]
fn test_session_loss_at_any_step_clears_remote_ids() {
    let steps = [
        MockCall::SetParameter,
        MockCall::SetDelta,
        MockCall::CookNode,
        MockCall::CookState,
        MockCall::Parameters,
        MockCall::OutputGeos,
        MockCall::PartInfo,
    ];
    for step in steps {
        let mut h = HarnessBuilder::new().build();
        let x = h.add("x", "Sop/sphere");
        h.cook(x);
        assert!(h.scheduler.node(x).unwrap().is_instantiated());

        h.engine.fail_next(step, ResultCode::InvalidSession);
        h.scheduler
            .set_parameter(x, "radius", ParmValue::Float(2.0))
            .unwrap();
        h.settle();

        let node = h.scheduler.node(x).unwrap();
        assert_eq!(node.remote_id, RemoteNodeId::NONE, "after {:?}", step);
        assert_eq!(node.geo_id, RemoteNodeId::NONE, "after {:?}", step);
        assert_eq!(h.scheduler.session().invalidations(), 1, "after {:?}", step);
        assert!(h.scheduler.session().tasks().is_idle());
    }
}

#[test]
fn test_session_loss_during_rebuild_clears_remote_ids() {
    let steps = [
        MockCall::DeleteNode,
        MockCall::CreateNode,
        MockCall::AssetInfo,
        MockCall::ResolveStrings,
        MockCall::SubPipelines,
    ];
    for step in steps {
        let mut h = HarnessBuilder::new().build();
        let x = h.add("x", "Sop/sphere");
        h.cook(x);
        assert!(h.scheduler.node(x).unwrap().is_instantiated());

        h.engine.fail_next(step, ResultCode::InvalidSession);
        assert!(h.scheduler.select_operator(x, "Sop/subdivide").unwrap());
        h.settle();

        let node = h.scheduler.node(x).unwrap();
        assert_eq!(node.remote_id, RemoteNodeId::NONE, "after {:?}", step);
        assert_eq!(node.geo_id, RemoteNodeId::NONE, "after {:?}", step);
        assert_eq!(h.scheduler.session().invalidations(), 1, "after {:?}", step);
        assert!(h.scheduler.session().tasks().is_idle());
    }
}

#[test]
fn test_delta_reaches_engine_and_clears() {
    let mut h = HarnessBuilder::new().build();
    let x = h.add("x", "Sop/sphere");
    h.cook(x);

    h.scheduler
        .set_parameter(x, "radius", ParmValue::Float(1.5))
        .unwrap();
    assert_eq!(
        h.scheduler.node(x).unwrap().delta.forward,
        "Sop/sphere/parameter/radius/1.5"
    );
    h.settle();

    assert!(h.scheduler.node(x).unwrap().delta.is_empty());
    assert_eq!(
        h.engine.delta_tokens(&remote_name("Sop/sphere", x)),
        vec!["Sop/sphere/parameter/radius/1.5".to_string()]
    );
}

#[test]
fn test_second_edit_before_cook_replaces_delta() {
    let mut h = HarnessBuilder::new().build();
    let x = h.add("x", "Sop/sphere");
    h.cook(x);

    h.scheduler.set_parameter(x, "radius", ParmValue::Float(2.0)).unwrap();
    h.scheduler.set_parameter(x, "radius", ParmValue::Float(3.0)).unwrap();
    let delta = &h.scheduler.node(x).unwrap().delta;
    assert_eq!(delta.forward, "Sop/sphere/parameter/radius/3");
    assert_eq!(delta.inverse, "Sop/sphere/parameter/radius/2");
    h.settle();

    assert_eq!(h.engine.delta_tokens(&remote_name("Sop/sphere", x)).len(), 1);
    assert_eq!(
        h.engine.parm_value(&remote_name("Sop/sphere", x), "radius"),
        Some(ParmValue::Float(3.0))
    );
}

#[test]
fn test_rebuild_replays_last_inverse_token() {
    let mut h = HarnessBuilder::new().build();
    let x = h.add("x", "Sop/sphere");
    h.cook(x);

    h.scheduler.set_parameter(x, "radius", ParmValue::Float(2.0)).unwrap();
    h.settle();
    let node = h.scheduler.node(x).unwrap();
    assert!(node.delta.is_empty());
    assert_eq!(node.redelta, "Sop/sphere/parameter/radius/1");

    h.scheduler.stop_session();
    h.cook(x);

    assert!(h.scheduler.node(x).unwrap().is_instantiated());
    assert_eq!(
        h.engine.delta_tokens(&remote_name("Sop/sphere", x)),
        vec!["Sop/sphere/parameter/radius/1".to_string()]
    );

    // Only the first upload after the rebuild replays it
    h.scheduler.request_cook(x, CookRequest::Forced).unwrap();
    h.settle();
    assert_eq!(h.engine.delta_tokens(&remote_name("Sop/sphere", x)).len(), 1);
}

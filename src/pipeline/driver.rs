//! Scheduling-thread side of the pipeline
//!
//! [`admit`] starts a run for one node: it resolves upstream redirects, then
//! either dispatches an instantiation or uploads and dispatches a cook.
//! [`resume`] applies a finished job's [`Continuation`], moving the node to
//! its next state and dispatching the next job when there is one.
//!
//! Everything here runs on the scheduling thread and must not block on the
//! engine for longer than a single short call. Instantiate and cook go
//! through [`Dispatch`].

use super::job::{CookJob, Cooked, InstantiateJob, Instantiated, Job, JobOutput};
use super::{Continuation, Signal};
use crate::bridge::{NodeEvent, SessionStatus};
use crate::context::CookContext;
use crate::engine::status::{RemoteResultExt, Step};
use crate::engine::strings::resolve_ordered;
use crate::engine::{ParmInfo, ParmValue, RemoteEngine, RemoteNodeId, SessionHandle};
use crate::error::{CookError, Result, ResultExt};
use crate::node::delta::notify_downstream;
use crate::node::{
    CookRequest, Input, InputBinding, InputKind, InputSource, Node, NodeKey, Parameter,
    SubPipeline,
};
use crate::output::apply_outputs;
use crate::resolver::{needs_upstream_cook, resolve, Resolution};
use chrono::Utc;

/// Hands jobs to whatever runs them
pub trait Dispatch {
    /// Run `job` off the scheduling thread and deliver its continuation later
    fn dispatch(&self, node: Option<NodeKey>, epoch: u64, job: Job);
}

/// Start a pipeline run for `key`, redirecting to upstream nodes first.
///
/// The caller guarantees a session exists and no task is in flight.
pub fn admit(ctx: &mut CookContext, dispatcher: &dyn Dispatch, key: NodeKey) {
    match resolve(&ctx.nodes, key) {
        Resolution::Proceed { target, waiting } => {
            for k in &waiting {
                if let Some(node) = ctx.nodes.get_mut(*k) {
                    node.apply(Signal::UpstreamPending);
                }
            }
            if let Some(node) = ctx.nodes.get_mut(target) {
                if !node.needs_cook() {
                    node.request_cook();
                }
            }
            process(ctx, dispatcher, target, false);
        }
        Resolution::Cycle(members) => {
            let chain: Vec<String> = members
                .iter()
                .filter_map(|k| ctx.nodes.get(*k))
                .map(|n| n.label.clone())
                .collect();
            let err = CookError::DependencyCycle(chain.join(" -> "));
            tracing::warn!("{}: {}", label_of(ctx, key), err);

            let mut affected = members;
            if !affected.contains(&key) {
                affected.push(key);
            }
            for k in affected {
                if let Some(node) = ctx.nodes.get_mut(k) {
                    node.cook_request = CookRequest::None;
                    node.last_failure = Some(err.to_string());
                    node.apply(Signal::Failed);
                }
            }
        }
        Resolution::Blocked { failed, waiting } => {
            let upstream = label_of(ctx, failed);
            for k in waiting {
                handle_failure(ctx, k, CookError::UpstreamFailed(upstream.clone()));
            }
        }
    }
}

/// Apply a finished job on the scheduling thread
pub fn resume(ctx: &mut CookContext, dispatcher: &dyn Dispatch, continuation: Continuation) {
    if continuation.epoch != ctx.session.epoch() {
        tracing::debug!(
            "Dropping result from session epoch {} (now {})",
            continuation.epoch,
            ctx.session.epoch()
        );
        return;
    }
    let Some(key) = continuation.node else {
        tracing::warn!("Pipeline continuation without a node");
        return;
    };

    match continuation.output {
        JobOutput::Instantiated { result: Ok(done), .. } => on_instantiated(ctx, dispatcher, key, done),
        JobOutput::Instantiated {
            result: Err(e),
            released_previous,
        } => {
            ctx.session.finish_task();
            if released_previous {
                if let Some(node) = ctx.nodes.get_mut(key) {
                    node.clear_remote();
                }
            } else {
                tracing::debug!("{}: keeping previous instantiation", label_of(ctx, key));
            }
            handle_failure(ctx, key, e);
        }
        JobOutput::Cooked {
            round,
            result: Ok(cooked),
        } => on_cooked(ctx, dispatcher, key, round, cooked),
        JobOutput::Cooked { result: Err(e), .. } => {
            ctx.session.restore_frame_rate();
            ctx.session.finish_task();
            handle_failure(ctx, key, e);
        }
        JobOutput::Session { .. } => {
            tracing::warn!("{}: session result routed to the pipeline", key);
        }
    }
}

fn label_of(ctx: &CookContext, key: NodeKey) -> String {
    ctx.nodes
        .get(key)
        .map(|n| n.label.clone())
        .unwrap_or_else(|| key.to_string())
}

/// Instantiate if needed, otherwise upload and cook
fn process(ctx: &mut CookContext, dispatcher: &dyn Dispatch, key: NodeKey, after_instantiate: bool) {
    let Some(session) = ctx.session.handle() else {
        tracing::debug!("{}: no session, run postponed", key);
        return;
    };
    let epoch = ctx.session.epoch();

    if !after_instantiate {
        let Some(node) = ctx.nodes.get(key) else {
            return;
        };
        ctx.session.host().node_event(key, &node.name, NodeEvent::StartCook);

        let job = match plan_instantiate(ctx, key, session) {
            Ok(job) => job,
            Err(e) => return handle_failure(ctx, key, e),
        };
        if let Some(job) = job {
            if let Some(node) = ctx.nodes.get_mut(key) {
                node.last_transform = job.transform;
                node.apply(Signal::InstantiateDispatched);
            }
            ctx.session.begin_task(format!("{}: Start Instantiate", job.label));
            dispatcher.dispatch(Some(key), epoch, Job::Instantiate(job));
            return;
        }
    }

    if let Some(node) = ctx.nodes.get_mut(key) {
        node.apply(if after_instantiate {
            Signal::ParametersSynced
        } else {
            Signal::AlreadyInstantiated
        });
    }

    let engine = ctx.engine();
    if let Err(e) = upload(ctx, engine.as_ref(), &session, key) {
        return handle_failure(ctx, key, e);
    }

    let Some(node) = ctx.nodes.get(key) else {
        return;
    };
    if node.cook_on_parameter_changed() || node.cook_request == CookRequest::Forced {
        dispatch_cook(ctx, dispatcher, key, session, epoch, 0);
    } else {
        tracing::debug!("{}: uploaded without cooking", node.label);
        finish(ctx, key, false);
    }
}

/// Build the instantiate job when the node has to be (re)created
fn plan_instantiate(ctx: &CookContext, key: NodeKey, session: SessionHandle) -> Result<Option<InstantiateJob>> {
    let node = ctx.nodes.node(key)?;
    let asset = ctx.assets.get(node.asset)?;
    let sync = ctx.session.is_sync();
    let needs_load = asset.needs_load(ctx.session.is_loaded(node.asset), sync);

    let needed = !node.is_instantiated()
        || node.needs_rebuild
        || needs_load
        || !asset.is_instantiated(key);
    if !needed {
        return Ok(None);
    }

    let mut previous_roots = Vec::new();
    if node.deletion_root().is_valid() {
        previous_roots.push(node.deletion_root());
    }
    previous_roots.extend(node.input_node_ids());

    Ok(Some(InstantiateJob {
        session,
        sync,
        label: node.label.clone(),
        key,
        library: needs_load.then(|| asset.source()),
        available_operators: asset.available_operators.clone(),
        operator: node.operator.clone(),
        previous_roots,
        transform: ctx
            .scene
            .entity_transform(&node.name)
            .unwrap_or(node.last_transform),
    }))
}

fn dispatch_cook(
    ctx: &mut CookContext,
    dispatcher: &dyn Dispatch,
    key: NodeKey,
    session: SessionHandle,
    epoch: u64,
    round: u8,
) {
    let Some(node) = ctx.nodes.get_mut(key) else {
        return;
    };
    node.apply(Signal::CookDispatched);
    let job = CookJob {
        session,
        label: node.label.clone(),
        node: node.remote_id,
        verbose: ctx.settings.verbose,
        host: ctx.session.host().clone(),
        round,
    };

    ctx.session.begin_task(format!("{}: Start Cook", job.label));
    if ctx.settings.limit_fps_while_cooking {
        ctx.session.limit_frame_rate(ctx.settings.max_fps_while_cooking);
    }
    dispatcher.dispatch(Some(key), epoch, Job::Cook(job));
}

fn on_instantiated(ctx: &mut CookContext, dispatcher: &dyn Dispatch, key: NodeKey, done: Instantiated) {
    ctx.session.finish_task();
    let Some(session) = ctx.session.handle() else {
        return;
    };
    let engine = ctx.engine();

    let Some(asset_id) = ctx.nodes.get(key).map(|n| n.asset) else {
        // Destroyed while the job ran
        let root = if done.geo_id.is_valid() { done.geo_id } else { done.remote_id };
        if let Err(e) = engine.delete_node(&session, root).step(Step::DeleteNode) {
            tracing::debug!("Could not delete orphaned {}: {}", root, e);
        }
        return;
    };

    if let Some(loaded) = done.loaded {
        ctx.session.mark_loaded(asset_id);
        if let Ok(asset) = ctx.assets.get_mut(asset_id) {
            asset.apply_loaded(loaded);
        }
    }
    let available = ctx
        .assets
        .get(asset_id)
        .map(|a| a.available_operators.clone())
        .unwrap_or_default();

    if let Some(node) = ctx.nodes.get_mut(key) {
        node.remote_id = done.remote_id;
        node.geo_id = done.geo_id;
        node.operator = done.operator;
        node.available_operators = available;
        if !done.label.is_empty() {
            node.label = done.label;
        }
        node.help = done.help;
        node.help_url = done.help_url;
        node.needs_rebuild = false;
        node.replay_redelta = true;
        for input in &mut node.inputs {
            input.invalidate();
        }
        node.apply(Signal::InstantiateSucceeded);
    }
    if let Ok(asset) = ctx.assets.get_mut(asset_id) {
        asset.register(key);
    }

    let new_inputs = match refresh_instantiation(ctx, engine.as_ref(), &session, key, done.geo_input_count) {
        Ok(new_inputs) => new_inputs,
        Err(e) => return handle_failure(ctx, key, e),
    };
    if let Some(node) = ctx.nodes.get(key) {
        ctx.session
            .host()
            .node_event(key, &node.name, NodeEvent::FinishInstantiate);
    }

    if new_inputs && needs_upstream_cook(&ctx.nodes, key).is_some() {
        if let Some(node) = ctx.nodes.get_mut(key) {
            node.apply(Signal::UpstreamPending);
        }
        admit(ctx, dispatcher, key);
    } else {
        process(ctx, dispatcher, key, true);
    }
}

/// Re-read everything that belongs to a fresh instantiation.
/// Returns true when new inputs appeared.
fn refresh_instantiation(
    ctx: &mut CookContext,
    engine: &dyn RemoteEngine,
    session: &SessionHandle,
    key: NodeKey,
    geo_input_count: u32,
) -> Result<bool> {
    let remote = ctx.nodes.node(key)?.remote_id;
    let subs = engine.sub_pipelines(session, remote).step(Step::SubPipelines)?;
    let names = resolve_ordered(engine, session, &subs.iter().map(|s| s.name).collect::<Vec<_>>())?;

    let mut new_inputs = sync_parameters(ctx, engine, session, key, true)?;

    let node = ctx.nodes.node_mut(key)?;
    node.sub_pipelines = subs
        .iter()
        .zip(names)
        .map(|(sub, name)| SubPipeline {
            name,
            remote_id: sub.node_id,
        })
        .collect();

    for slot in 0..geo_input_count {
        let name = format!("input{}", slot);
        if node.find_input(&name).is_none() {
            node.inputs
                .push(Input::new(name, InputKind::Node, InputBinding::Geometry(slot)));
            new_inputs = true;
        }
    }

    let pending = std::mem::take(&mut node.pending_bindings);
    for (name, source) in pending {
        match node.find_input(&name) {
            Some(index) => new_inputs |= node.inputs[index].bind(source),
            None => {
                tracing::warn!("{}: has no input named '{}'", node.label, name);
                node.pending_bindings.insert(name, source);
            }
        }
    }

    if let Some(preset) = node.pending_preset.take() {
        apply_preset_values(node, preset.values);
    }

    ctx.nodes.mark_topology_dirty();
    Ok(new_inputs)
}

/// Copy preset values onto known parameters, marking changed ones dirty
fn apply_preset_values(node: &mut Node, values: impl IntoIterator<Item = (String, ParmValue)>) {
    for (name, value) in values {
        match node.parameters.iter_mut().find(|p| p.name == name) {
            Some(parm) if parm.value != value => {
                parm.value = value;
                parm.dirty = true;
            }
            Some(_) => {}
            None => tracing::debug!("{}: preset value for unknown parameter '{}'", node.label, name),
        }
    }
}

/// Refresh the local parameter copy from the engine.
///
/// `fresh` is set right after instantiation: local values that differ from
/// the engine's are kept and re-uploaded. Otherwise only locally edited
/// values survive. Operator-path parameters are resolved to node inputs,
/// first by parameter id, then by name. Returns true when an input was
/// created or bound.
fn sync_parameters(
    ctx: &mut CookContext,
    engine: &dyn RemoteEngine,
    session: &SessionHandle,
    key: NodeKey,
    fresh: bool,
) -> Result<bool> {
    let remote = ctx.nodes.node(key)?.remote_id;
    let infos = engine.parameters(session, remote).step(Step::UpdateParameters)?;
    let names = resolve_ordered(engine, session, &infos.iter().map(|p| p.name).collect::<Vec<_>>())?;
    let targets: Vec<Option<NodeKey>> = infos
        .iter()
        .map(|info| match info.value {
            ParmValue::Node(id) => ctx.nodes.find_by_remote(id),
            _ => None,
        })
        .collect();

    let node = ctx.nodes.node_mut(key)?;
    let mut new_inputs = false;
    let mut parameters = Vec::with_capacity(infos.len());
    for ((info, name), target) in infos.into_iter().zip(names).zip(targets) {
        if info.is_node_ref() {
            new_inputs |= sync_node_input(node, &info, &name, target);
            continue;
        }
        let local = node
            .parameters
            .iter()
            .find(|p| p.id == info.id || p.name == name);
        let (value, dirty) = match local {
            Some(p) if p.dirty || (fresh && p.value != info.value) => (p.value.clone(), true),
            _ => (info.value, false),
        };
        parameters.push(Parameter {
            id: info.id,
            name,
            value,
            default: info.default,
            tags: info.tags,
            dirty,
        });
    }
    node.parameters = parameters;

    if new_inputs {
        ctx.nodes.mark_topology_dirty();
    }
    Ok(new_inputs)
}

/// Match an operator-path parameter to its node input
fn sync_node_input(node: &mut Node, info: &ParmInfo, name: &str, target: Option<NodeKey>) -> bool {
    let binding = InputBinding::Parameter(info.id);
    let found = node
        .inputs
        .iter()
        .position(|i| i.binding == binding)
        .or_else(|| node.inputs.iter().position(|i| i.is_parameter() && i.name == name));

    let (index, mut changed) = match found {
        Some(index) => {
            let input = &mut node.inputs[index];
            input.binding = binding;
            input.name = name.to_string();
            (index, false)
        }
        None => {
            node.inputs.push(Input::new(name, InputKind::Node, binding));
            (node.inputs.len() - 1, true)
        }
    };

    // Bound by the engine during a cook; a host binding takes precedence
    if let Some(upstream) = target {
        let input = &mut node.inputs[index];
        if input.holders.is_empty() {
            tracing::debug!("{}: input '{}' bound to {} by the engine", node.label, name, upstream);
            changed |= input.bind(InputSource::Node(upstream));
        }
    }
    changed
}

/// Upload dirty parameters, changed inputs and the delta token.
///
/// The first upload after an instantiation sends the rebuild token when no
/// live delta is pending.
fn upload(ctx: &mut CookContext, engine: &dyn RemoteEngine, session: &SessionHandle, key: NodeKey) -> Result<()> {
    let node = ctx.nodes.node_mut(key)?;
    let label = node.label.clone();
    let remote = node.remote_id;

    if let Some(preset) = node.pending_preset.take() {
        apply_preset_values(node, preset.values);
    }
    for parm in node.parameters.iter_mut().filter(|p| p.dirty) {
        engine
            .set_parameter(session, remote, &parm.name, &parm.value)
            .step(Step::UploadParameters)
            .with_context(|| format!("{}: parameter '{}'", label, parm.name))?;
        parm.dirty = false;
    }

    let pending: Vec<usize> = node
        .inputs
        .iter()
        .enumerate()
        .filter(|(_, input)| input.has_pending_upload())
        .map(|(index, _)| index)
        .collect();
    for index in pending {
        upload_input(ctx, engine, session, key, index)
            .with_context(|| format!("{}: input {}", label, index))?;
    }

    let node = ctx.nodes.node_mut(key)?;
    let replay = std::mem::take(&mut node.replay_redelta);
    let token = if node.delta.forward.is_empty() && replay {
        &node.redelta
    } else {
        &node.delta.forward
    };
    if !token.is_empty() {
        engine
            .set_delta_info(session, remote, token)
            .step(Step::Delta)?;
    }
    Ok(())
}

fn upload_input(
    ctx: &mut CookContext,
    engine: &dyn RemoteEngine,
    session: &SessionHandle,
    key: NodeKey,
    index: usize,
) -> Result<()> {
    let node = ctx.nodes.node(key)?;
    let (label, remote) = (node.label.clone(), node.remote_id);
    let Some(input) = node.inputs.get(index).cloned() else {
        return Ok(());
    };

    let mut built = None;
    let source = match input.holders.first() {
        None => None,
        Some(holder) => match &holder.source {
            InputSource::Node(upstream) => {
                let id = ctx
                    .nodes
                    .get(*upstream)
                    .map(|n| n.remote_id)
                    .unwrap_or(RemoteNodeId::NONE);
                if !id.is_valid() {
                    tracing::warn!("{}: upstream of '{}' is not instantiated", label, input.name);
                    return Ok(());
                }
                Some(id)
            }
            other => {
                let Some(builder) = ctx.inputs.find(other) else {
                    tracing::warn!("{}: no input builder for {} input '{}'", label, other.kind(), input.name);
                    return Ok(());
                };
                let id = builder.build(engine, session, &label, holder)?;
                built = Some(id);
                Some(id)
            }
        },
    };

    match (source, input.binding) {
        (Some(id), InputBinding::Geometry(slot)) => engine
            .connect_input(session, remote, slot, id)
            .step(Step::UploadInputs)?,
        (Some(id), InputBinding::Parameter(_)) => engine
            .set_parameter(session, remote, &input.name, &ParmValue::Node(id))
            .step(Step::UploadInputs)?,
        (None, InputBinding::Geometry(slot)) if input.connected => engine
            .disconnect_input(session, remote, slot)
            .step(Step::UploadInputs)?,
        (None, InputBinding::Parameter(_)) if input.connected => engine
            .set_parameter(session, remote, &input.name, &ParmValue::Node(RemoteNodeId::NONE))
            .step(Step::UploadInputs)?,
        (None, _) => {}
    }

    let node = ctx.nodes.node_mut(key)?;
    if let Some(input) = node.inputs.get_mut(index) {
        if let Some(holder) = input.holders.first_mut() {
            holder.changed = false;
            if let Some(id) = built {
                holder.remote_id = id;
            }
        }
        input.connected = source.is_some();
    }
    Ok(())
}

fn on_cooked(ctx: &mut CookContext, dispatcher: &dyn Dispatch, key: NodeKey, round: u8, cooked: Cooked) {
    ctx.session.restore_frame_rate();
    ctx.session.finish_task();
    let Some(session) = ctx.session.handle() else {
        return;
    };
    if !ctx.nodes.contains(key) {
        return;
    }
    let engine = ctx.engine();

    let new_inputs = match sync_parameters(ctx, engine.as_ref(), &session, key, false) {
        Ok(new_inputs) => new_inputs,
        Err(e) => return handle_failure(ctx, key, e),
    };
    if new_inputs {
        if round == 0 {
            if let Some(node) = ctx.nodes.get_mut(key) {
                tracing::debug!("{}: cook discovered new inputs, cooking once more", node.label);
                node.apply(Signal::NewInputsDiscovered);
            }
            if let Err(e) = upload(ctx, engine.as_ref(), &session, key) {
                return handle_failure(ctx, key, e);
            }
            let epoch = ctx.session.epoch();
            dispatch_cook(ctx, dispatcher, key, session, epoch, 1);
            return;
        }
        tracing::debug!("{}: inputs changed again after the extra cook", label_of(ctx, key));
    }

    let Some(node) = ctx.nodes.get_mut(key) else {
        return;
    };
    node.apply(Signal::CookSucceeded);
    let name = node.name.clone();

    let records = match ctx.outputs.build_all(&name, &cooked.parts) {
        Ok(records) => records,
        Err(e) => return handle_failure(ctx, key, e),
    };
    if let Some(node) = ctx.nodes.get_mut(key) {
        let destroyed = apply_outputs(node, records, &ctx.outputs, ctx.scene.as_mut());
        if !destroyed.is_empty() {
            tracing::debug!("{}: removed split instances {:?}", node.label, destroyed);
        }
    }
    finish(ctx, key, true);
}

/// Close the run: clear the request, notify downstream, clear the delta
fn finish(ctx: &mut CookContext, key: NodeKey, cooked: bool) {
    let serial = if cooked {
        ctx.cook_serial += 1;
        Some(ctx.cook_serial)
    } else {
        None
    };
    let Some(node) = ctx.nodes.get_mut(key) else {
        return;
    };
    node.needs_rebuild = false;
    node.cook_request = CookRequest::None;
    node.last_failure = None;
    if let Some(serial) = serial {
        node.last_cook_serial = Some(serial);
        node.last_cooked_at = Some(Utc::now());
        node.finished_cooks += 1;
    }
    ctx.session
        .host()
        .node_event(key, &node.name, NodeEvent::FinishCook);

    if cooked {
        let scheduled = notify_downstream(&mut ctx.nodes, key, ctx.settings.cook_on_input_changed);
        if !scheduled.is_empty() {
            tracing::debug!("{}: scheduled downstream {:?}", key, scheduled);
        }
    }
    if let Some(node) = ctx.nodes.get_mut(key) {
        node.delta.consume_into(&mut node.redelta);
        node.apply(Signal::Finished);
    }
}

/// React to a failed step.
///
/// Session loss aborts the run and invalidates everything. Any other failure
/// stops this run only; the node keeps its last good instantiation.
pub(crate) fn handle_failure(ctx: &mut CookContext, key: NodeKey, err: CookError) {
    let label = label_of(ctx, key);
    if err.is_session_lost() {
        tracing::error!("{}: {}", label, err);
        ctx.host().notify(format!("Session lost: {}", err));
        ctx.invalidate();
        ctx.host().session_status(SessionStatus::Lost);
        return;
    }

    ctx.session.restore_frame_rate();
    let step = err
        .step()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "pipeline".to_string());
    tracing::warn!("{}: {} failed: {}", label, step, err);
    if let Some(node) = ctx.nodes.get_mut(key) {
        node.last_failure = Some(err.to_string());
        node.cook_request = CookRequest::None;
        node.apply(Signal::Failed);
    }
}

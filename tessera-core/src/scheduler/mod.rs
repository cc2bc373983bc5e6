//! Render-Cone Scheduler
//!
//! The scheduler decides which nodes run, runs them in dependency order and
//! publishes the results.
//!
//! # Overview
//!
//! Only the render cone is ever computed: the active render target plus
//! every node it transitively reads from. A change anywhere else is
//! recorded (params are stored, inputs are kept) but causes no work until
//! the node enters the cone.
//!
//! ```text
//!     A ──► B ──► C (target)        cone = {A, B, C}
//!     │
//!     └──► D                        D is stored, never computed
//! ```
//!
//! # How It Works
//!
//! 1. A mutation inside the cone marks the node and its cone-resident
//!    successors dirty (through the [`ComputeQueue`]) and schedules a pass.
//!
//! 2. A pass intersects the dirty set with the cone, sorts it
//!    topologically and computes each node in turn. Before calling the
//!    node type's compute function the scheduler consults the
//!    [`ContentCache`]; a hit skips the call entirely.
//!
//! 3. A successful computation stores the outputs, clears the dirty flag
//!    and delivers each output into the connected downstream input slots.
//!
//! 4. Recomputing a node cancels any earlier computation of it that is
//!    still in flight. The cancelled result is discarded without an event
//!    and the node stays dirty.
//!
//! # Failures
//!
//! A failing node keeps its last good outputs, reports the error through a
//! [`EngineEvent::NodeComputed`] event and is parked: it and everything
//! downstream of it sit out later passes until a new mutation touches it.

mod registry;
mod state;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures_util::future::{self, BoxFuture, FutureExt};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, trace, warn, Instrument};

pub use registry::{
    ComputeContext, ComputeFuture, InputPolicy, NodeCompute, NodeRegistry, NodeType, ParamSpec,
};
pub use state::NodeStatus;

use state::NodeState;

use crate::cache::{ContentCache, KeyMaterial};
use crate::error::{ComputeError, EngineError, GraphError, HookError};
use crate::events::{EngineEvent, EventBus};
use crate::graph::{DependencyGraph, NodeId, TypeTag, DEFAULT_OUTPUT};
use crate::queue::{ComputeDelegate, ComputeQueue};
use crate::value::{ParamValue, Params, TypedValue, Value, ValueMap};

/// What happened to one [`RenderConeScheduler::compute_node`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum ComputeOutcome {
    /// The compute function ran and succeeded.
    Computed,
    /// The outputs came from the cache.
    CacheHit,
    /// A newer computation superseded this one, or the cone changed under
    /// it. Nothing was stored.
    Cancelled,
    Failed(ComputeError),
    /// The node is unknown or outside the cone.
    Skipped,
}

impl ComputeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ComputeOutcome::Computed | ComputeOutcome::CacheHit)
    }
}

/// Tally of one or more passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub passes: usize,
    pub computed: usize,
    pub cache_hits: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Nodes held back because something upstream failed or was cancelled
    /// in the same pass.
    pub skipped: usize,
}

impl PassReport {
    fn record(&mut self, outcome: &ComputeOutcome) {
        match outcome {
            ComputeOutcome::Computed => self.computed += 1,
            ComputeOutcome::CacheHit => self.cache_hits += 1,
            ComputeOutcome::Cancelled => self.cancelled += 1,
            ComputeOutcome::Failed(_) => self.failed += 1,
            ComputeOutcome::Skipped => self.skipped += 1,
        }
    }

    fn absorb(&mut self, other: PassReport) {
        self.passes += other.passes;
        self.computed += other.computed;
        self.cache_hits += other.cache_hits;
        self.failed += other.failed;
        self.cancelled += other.cancelled;
        self.skipped += other.skipped;
    }
}

struct InFlight {
    generation: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct SchedulerState {
    nodes: HashMap<NodeId, NodeState>,
    target: Option<NodeId>,
    cone: HashSet<NodeId>,
    /// Failed nodes waiting for a mutation before they are retried.
    parked: HashSet<NodeId>,
    in_flight: HashMap<NodeId, InFlight>,
    next_generation: u64,
    pass_pending: bool,
    passes_scheduled: u64,
    passes: u64,
    invocations: u64,
}

struct SchedulerInner {
    graph: Arc<RwLock<DependencyGraph>>,
    registry: Arc<NodeRegistry>,
    cache: Arc<ContentCache>,
    queue: ComputeQueue,
    events: Arc<EventBus>,
    state: Mutex<SchedulerState>,
    /// At most one pass runs at a time.
    pass_lock: tokio::sync::Mutex<()>,
}

/// Snapshot of everything one computation reads, taken under the lock.
struct Job {
    node_id: NodeId,
    generation: u64,
    token: CancellationToken,
    type_tag: TypeTag,
    params: Params,
    resources: Params,
    inputs: ValueMap,
    sources: IndexMap<String, NodeId>,
    render_target: Option<NodeId>,
}

impl Job {
    fn material(&self) -> KeyMaterial<'_> {
        KeyMaterial {
            node_id: self.node_id,
            params: &self.params,
            inputs: &self.inputs,
            sources: &self.sources,
            resources: &self.resources,
        }
    }
}

/// Forwards the queue's compute steps into scheduled passes.
struct PassTrigger(Weak<SchedulerInner>);

impl ComputeDelegate for PassTrigger {
    fn compute_step(&self, _node_id: NodeId) -> BoxFuture<'static, ()> {
        if let Some(inner) = self.0.upgrade() {
            RenderConeScheduler { inner }.schedule_computation();
        }
        future::ready(()).boxed()
    }
}

/// Cone-gated scheduler over one dependency graph. Cheap to clone; clones
/// share state.
#[derive(Clone)]
pub struct RenderConeScheduler {
    inner: Arc<SchedulerInner>,
}

impl RenderConeScheduler {
    /// Create a scheduler with an empty graph, computing nodes from
    /// `registry` and caching results in `cache`.
    pub fn new(registry: Arc<NodeRegistry>, cache: Arc<ContentCache>) -> Self {
        let graph = Arc::new(RwLock::new(DependencyGraph::new()));
        let queue = ComputeQueue::new(Arc::clone(&graph));

        let inner = Arc::new(SchedulerInner {
            graph,
            registry,
            cache,
            queue,
            events: Arc::new(EventBus::new()),
            state: Mutex::new(SchedulerState::default()),
            pass_lock: tokio::sync::Mutex::new(()),
        });
        inner
            .queue
            .set_delegate(Arc::new(PassTrigger(Arc::downgrade(&inner))));

        Self { inner }
    }

    // ------------------------------------------------------------------
    // Graph mutation
    // ------------------------------------------------------------------

    /// Add a node of a registered type, with the type's default params.
    pub fn add_node(&self, type_tag: impl Into<TypeTag>) -> Result<NodeId, EngineError> {
        let type_tag = type_tag.into();
        let node_type = self
            .inner
            .registry
            .get(&type_tag)
            .ok_or_else(|| EngineError::UnknownNodeType(type_tag.clone()))?;

        let node_id = self.inner.graph.write().add_node(type_tag.clone());
        self.inner
            .state
            .lock()
            .nodes
            .insert(node_id, NodeState::new(type_tag, node_type.default_params()));

        debug!(node = %node_id, type_tag = %node_type.tag(), "added node");
        Ok(node_id)
    }

    /// Remove a node and its edges. Downstream nodes lose the inputs it fed.
    /// Removing the render target halts the scheduler.
    pub fn remove_node(&self, node_id: NodeId) -> Result<(), GraphError> {
        let (_, edges) = self
            .inner
            .graph
            .write()
            .remove_node(node_id)
            .ok_or(GraphError::UnknownNode(node_id))?;

        let was_target = {
            let mut state = self.inner.state.lock();
            if let Some(flight) = state.in_flight.remove(&node_id) {
                flight.token.cancel();
            }
            state.nodes.remove(&node_id);
            state.parked.remove(&node_id);
            for edge in edges.iter().filter(|edge| edge.source == node_id) {
                if let Some(target) = state.nodes.get_mut(&edge.target) {
                    target.inputs.shift_remove(&edge.target_slot);
                }
            }
            state.target == Some(node_id)
        };
        self.inner.queue.forget(node_id);
        self.inner.cache.invalidate(node_id);
        debug!(node = %node_id, edges = edges.len(), "removed node");

        let orphaned: Vec<_> = edges
            .into_iter()
            .filter(|edge| edge.source == node_id)
            .collect();
        for edge in &orphaned {
            self.emit(EngineEvent::InputDisconnected {
                node_id: edge.target,
                input_key: edge.target_slot.clone(),
                source_node_id: node_id,
            });
        }

        if was_target {
            self.set_render_target(None)?;
        } else {
            self.refresh_cone();
            for edge in &orphaned {
                self.touch(edge.target);
            }
        }
        Ok(())
    }

    /// Connect `source`'s default output to `target`'s input `slot`.
    pub fn connect(&self, source: NodeId, target: NodeId, slot: &str) -> Result<(), GraphError> {
        self.connect_output(source, DEFAULT_OUTPUT, target, slot)
    }

    /// Connect a named output of `source` to `target`'s input `slot`.
    ///
    /// Fails, leaving everything unchanged, if the slot is taken or the edge
    /// would close a cycle.
    pub fn connect_output(
        &self,
        source: NodeId,
        output: &str,
        target: NodeId,
        slot: &str,
    ) -> Result<(), GraphError> {
        let edge = self
            .inner
            .graph
            .write()
            .connect_output(source, output, target, slot)?;

        {
            let mut state = self.inner.state.lock();
            let current = state
                .nodes
                .get(&source)
                .and_then(|node| node.outputs.clone())
                .and_then(|outputs| select_output(&outputs, &edge.source_output));
            if let (Some(value), Some(node)) = (current, state.nodes.get_mut(&target)) {
                node.inputs.insert(edge.target_slot.clone(), value);
            }
        }

        self.emit(EngineEvent::InputConnected {
            node_id: target,
            input_key: edge.target_slot,
            source_node_id: source,
        });
        self.on_connection_change(target);
        Ok(())
    }

    /// Remove the edge feeding `target`'s input `slot`.
    pub fn disconnect(&self, target: NodeId, slot: &str) -> Result<(), GraphError> {
        let edge = self.inner.graph.write().disconnect(target, slot)?;

        if let Some(node) = self.inner.state.lock().nodes.get_mut(&target) {
            node.inputs.shift_remove(slot);
        }

        self.emit(EngineEvent::InputDisconnected {
            node_id: target,
            input_key: edge.target_slot,
            source_node_id: edge.source,
        });
        self.on_connection_change(target);
        Ok(())
    }

    /// Set a parameter, validated against the node type's schema.
    ///
    /// Returns whether the change scheduled work (`false` outside the cone).
    pub fn set_param(
        &self,
        node_id: NodeId,
        name: &str,
        value: impl Into<ParamValue>,
    ) -> Result<bool, EngineError> {
        let value = value.into();
        let type_tag = self.type_tag(node_id)?;
        let node_type = self
            .inner
            .registry
            .get(&type_tag)
            .ok_or(EngineError::UnknownNodeType(type_tag))?;
        node_type.validate_param(name, &value)?;

        if let Some(node) = self.inner.state.lock().nodes.get_mut(&node_id) {
            node.params.insert(name.to_string(), value);
        }
        Ok(self.on_parameter_change(node_id))
    }

    /// Set an input value directly. Meant for unconnected slots; a connected
    /// slot is overwritten again when its source next computes.
    pub fn set_input(&self, node_id: NodeId, slot: &str, value: Value) -> Result<bool, GraphError> {
        self.inner
            .state
            .lock()
            .nodes
            .get_mut(&node_id)
            .ok_or(GraphError::UnknownNode(node_id))?
            .inputs
            .insert(slot.to_string(), value);
        Ok(self.on_input_change(node_id))
    }

    /// Remove a directly set input value.
    pub fn clear_input(&self, node_id: NodeId, slot: &str) -> Result<bool, GraphError> {
        let removed = self
            .inner
            .state
            .lock()
            .nodes
            .get_mut(&node_id)
            .ok_or(GraphError::UnknownNode(node_id))?
            .inputs
            .shift_remove(slot)
            .is_some();
        Ok(removed && self.on_input_change(node_id))
    }

    /// Set an external resource fingerprint (asset hash, file stamp, ...).
    /// Resources take part in the cache key but are not passed to the
    /// compute function.
    pub fn set_resource(
        &self,
        node_id: NodeId,
        name: &str,
        value: impl Into<ParamValue>,
    ) -> Result<bool, GraphError> {
        self.inner
            .state
            .lock()
            .nodes
            .get_mut(&node_id)
            .ok_or(GraphError::UnknownNode(node_id))?
            .resources
            .insert(name.to_string(), value.into());
        Ok(self.on_parameter_change(node_id))
    }

    /// Drop every cache entry recorded against `node_id` and mark it dirty.
    /// Returns the number of entries removed.
    pub fn invalidate(&self, node_id: NodeId) -> usize {
        let removed = self.inner.cache.invalidate(node_id);
        self.touch(node_id);
        removed
    }

    // ------------------------------------------------------------------
    // Change notifications
    // ------------------------------------------------------------------

    /// A parameter of `node_id` changed. Returns whether work was scheduled.
    pub fn on_parameter_change(&self, node_id: NodeId) -> bool {
        self.touch(node_id)
    }

    /// An input value of `node_id` changed.
    pub fn on_input_change(&self, node_id: NodeId) -> bool {
        self.touch(node_id)
    }

    /// An edge into `node_id` was added or removed. The cone is recomputed
    /// first, since the structure changed.
    pub fn on_connection_change(&self, node_id: NodeId) -> bool {
        self.refresh_cone();
        self.touch(node_id)
    }

    /// Mark `node_id` and its cone-resident successors dirty, if `node_id`
    /// is in the cone.
    fn touch(&self, node_id: NodeId) -> bool {
        let cone = {
            let mut state = self.inner.state.lock();
            if !state.cone.contains(&node_id) {
                trace!(node = %node_id, "change outside render cone ignored");
                return false;
            }
            state.parked.remove(&node_id);
            // A running computation of this node read the old state.
            if let Some(flight) = state.in_flight.get(&node_id) {
                flight.token.cancel();
            }
            state.cone.clone()
        };

        self.inner.queue.mark_dirty_within(node_id, &cone);
        self.schedule_computation();
        true
    }

    // ------------------------------------------------------------------
    // Render target
    // ------------------------------------------------------------------

    /// Select the node whose cone is computed, or `None` to halt.
    ///
    /// Nodes that enter the cone are marked dirty; nodes that leave it keep
    /// their state and cache entries.
    pub fn set_render_target(&self, target: Option<NodeId>) -> Result<(), GraphError> {
        let cone = {
            let graph = self.inner.graph.read();
            match target {
                Some(id) if !graph.contains(id) => return Err(GraphError::UnknownNode(id)),
                Some(id) => cone_of(&graph, id),
                None => HashSet::new(),
            }
        };

        let entered = self.install_cone(target, &cone);
        match target {
            Some(id) => debug!(target = %id, cone = cone.len(), entered = entered.len(), "render target set"),
            None => debug!("render target cleared; scheduler halted"),
        }
        self.mark_entered(&entered, &cone);

        self.emit(EngineEvent::RenderTargetChanged { node_id: target });
        self.emit(EngineEvent::ConeUpdated { node_id: target });
        self.schedule_computation();
        Ok(())
    }

    /// Recompute the cone after a structural change.
    fn refresh_cone(&self) {
        let Some(target) = self.render_target() else {
            return;
        };
        let cone = cone_of(&self.inner.graph.read(), target);
        if self.inner.state.lock().cone == cone {
            return;
        }

        let entered = self.install_cone(Some(target), &cone);
        debug!(target = %target, cone = cone.len(), entered = entered.len(), "render cone updated");
        self.mark_entered(&entered, &cone);

        self.emit(EngineEvent::ConeUpdated {
            node_id: Some(target),
        });
    }

    /// Swap in a new cone. Work in flight for nodes that left it is
    /// cancelled; nodes that entered it get a fresh chance if parked.
    /// Returns the entered nodes.
    fn install_cone(&self, target: Option<NodeId>, cone: &HashSet<NodeId>) -> Vec<NodeId> {
        let mut state = self.inner.state.lock();

        let entered: Vec<NodeId> = cone
            .iter()
            .filter(|id| !state.cone.contains(id))
            .copied()
            .collect();
        let left: Vec<NodeId> = state
            .cone
            .iter()
            .filter(|id| !cone.contains(id))
            .copied()
            .collect();

        for id in &left {
            if let Some(flight) = state.in_flight.remove(id) {
                flight.token.cancel();
            }
        }
        for id in &entered {
            state.parked.remove(id);
        }
        state.target = target;
        state.cone = cone.clone();
        entered
    }

    fn mark_entered(&self, entered: &[NodeId], cone: &HashSet<NodeId>) {
        let _batch = self.inner.queue.block();
        for id in entered {
            self.inner.queue.mark_dirty_within(*id, cone);
        }
    }

    // ------------------------------------------------------------------
    // Computation
    // ------------------------------------------------------------------

    /// Arrange for a pass on the next tick. Calls made while a pass is
    /// already pending coalesce; calls while halted do nothing.
    pub fn schedule_computation(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.target.is_none() || state.pass_pending {
                return;
            }
            state.pass_pending = true;
            state.passes_scheduled += 1;
        }

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let scheduler = self.clone();
            handle.spawn(async move {
                tokio::task::yield_now().await;
                scheduler.process_computation().await;
            });
        }
    }

    /// Run one pass over the dirty nodes of the cone, in topological order.
    /// Schedules a follow-up pass if dirty work remains afterwards.
    pub async fn process_computation(&self) -> PassReport {
        let _running = self.inner.pass_lock.lock().await;

        let pass = {
            let mut state = self.inner.state.lock();
            state.pass_pending = false;
            state.passes += 1;
            state.passes
        };

        let runnable = self.runnable_nodes();
        if runnable.is_empty() {
            return PassReport::default();
        }
        let order = self.inner.graph.read().topological_sort(runnable);

        let span = debug_span!("pass", pass, nodes = order.len());
        let report = self.run_pass(order).instrument(span).await;

        if !self.runnable_nodes().is_empty() {
            self.schedule_computation();
        }
        report
    }

    async fn run_pass(&self, order: Vec<NodeId>) -> PassReport {
        let mut report = PassReport {
            passes: 1,
            ..PassReport::default()
        };
        let mut held_back: HashSet<NodeId> = HashSet::new();

        for node_id in order {
            if held_back.contains(&node_id) {
                report.skipped += 1;
                continue;
            }
            // The cone or the node may have changed while earlier nodes ran.
            if !self.in_cone(node_id) || !self.inner.queue.is_dirty(node_id) {
                continue;
            }

            let outcome = self.compute_node(node_id).await;
            report.record(&outcome);
            if !outcome.is_success() {
                held_back.extend(self.inner.graph.read().descendants(node_id));
            }
        }

        debug!(
            computed = report.computed,
            cache_hits = report.cache_hits,
            failed = report.failed,
            cancelled = report.cancelled,
            "pass finished"
        );
        report
    }

    /// Drain the queue and run passes until nothing in the cone is dirty
    /// (parked nodes and their descendants excepted).
    pub async fn settle(&self) -> PassReport {
        let mut total = PassReport::default();
        loop {
            self.inner.queue.drain().await;
            total.absorb(self.process_computation().await);

            if !self.inner.queue.has_pending() && self.runnable_nodes().is_empty() {
                return total;
            }
        }
    }

    /// Compute one node now, consulting the cache first.
    ///
    /// Any earlier computation of the same node still in flight is
    /// cancelled.
    pub async fn compute_node(&self, node_id: NodeId) -> ComputeOutcome {
        let Some(job) = self.begin(node_id) else {
            return ComputeOutcome::Skipped;
        };

        let key = self.inner.cache.compute_key(job.material());
        if let Some(outputs) = self.inner.cache.get(&key) {
            return if self.finish_success(&job, outputs, true, Duration::ZERO) {
                ComputeOutcome::CacheHit
            } else {
                ComputeOutcome::Cancelled
            };
        }

        let Some(node_type) = self.inner.registry.get(&job.type_tag) else {
            let error = ComputeError::UnknownType(job.type_tag.clone());
            self.finish_failure(&job, error.clone(), Duration::ZERO);
            return ComputeOutcome::Failed(error);
        };

        let inputs = match node_type.input_policy() {
            InputPolicy::Shared => job.inputs.clone(),
            InputPolicy::Isolated => job
                .inputs
                .iter()
                .map(|(slot, value)| (slot.clone(), value.deep_clone()))
                .collect(),
        };

        if job.token.is_cancelled() {
            self.finish_cancelled(&job);
            return ComputeOutcome::Cancelled;
        }

        let context = ComputeContext {
            node_id,
            render_target: job.render_target,
            cancellation: job.token.clone(),
        };
        {
            let mut state = self.inner.state.lock();
            state.invocations += 1;
            if let Some(node) = state.nodes.get_mut(&node_id) {
                node.compute_count += 1;
            }
        }

        let span = debug_span!("compute", node = %node_id, type_tag = %job.type_tag);
        let started = Instant::now();
        let result = node_type
            .compute(job.params.clone(), inputs, context)
            .instrument(span)
            .await;
        let elapsed = started.elapsed();

        if job.token.is_cancelled() {
            self.finish_cancelled(&job);
            return ComputeOutcome::Cancelled;
        }

        match result.and_then(validate_outputs) {
            Ok(outputs) => {
                let outputs = self.inner.cache.put(&key, outputs);
                if self.finish_success(&job, outputs, false, elapsed) {
                    ComputeOutcome::Computed
                } else {
                    ComputeOutcome::Cancelled
                }
            }
            Err(error) => {
                self.finish_failure(&job, error.clone(), elapsed);
                ComputeOutcome::Failed(error)
            }
        }
    }

    /// Bring a node up to date from the cache alone, without running its
    /// compute function. Returns `false` on a miss, when the node is not in
    /// the cone, or while anything upstream of it in the cone is dirty (its
    /// inputs are about to change).
    pub fn resolve_from_cache(&self, node_id: NodeId) -> bool {
        if self.has_dirty_ancestor(node_id) {
            trace!(node = %node_id, "cache resolve deferred; upstream is dirty");
            return false;
        }
        let Some(probe) = self.snapshot(node_id) else {
            return false;
        };
        let key = self.inner.cache.compute_key(probe.material());
        let Some(outputs) = self.inner.cache.get(&key) else {
            return false;
        };

        let Some(job) = self.begin(node_id) else {
            return false;
        };
        self.finish_success(&job, outputs, true, Duration::ZERO)
    }

    fn has_dirty_ancestor(&self, node_id: NodeId) -> bool {
        let ancestors = self.inner.graph.read().ancestors(node_id);
        let cone = self.cone();
        ancestors
            .into_iter()
            .any(|id| cone.contains(&id) && self.inner.queue.is_dirty(id))
    }

    /// Read the node's current state without registering a computation.
    fn snapshot(&self, node_id: NodeId) -> Option<Job> {
        let sources: IndexMap<String, NodeId> = self
            .inner
            .graph
            .read()
            .node(node_id)?
            .inputs()
            .map(|edge| (edge.target_slot.clone(), edge.source))
            .collect();

        let state = self.inner.state.lock();
        if !state.cone.contains(&node_id) {
            return None;
        }
        let node = state.nodes.get(&node_id)?;
        Some(Job {
            node_id,
            generation: 0,
            token: CancellationToken::new(),
            type_tag: node.type_tag.clone(),
            params: node.params.clone(),
            resources: node.resources.clone(),
            inputs: node.inputs.clone(),
            sources,
            render_target: state.target,
        })
    }

    /// Snapshot the node and register the computation as the current one,
    /// superseding any earlier one.
    fn begin(&self, node_id: NodeId) -> Option<Job> {
        let mut job = self.snapshot(node_id)?;

        let mut state = self.inner.state.lock();
        state.next_generation += 1;
        job.generation = state.next_generation;
        let previous = state.in_flight.insert(
            node_id,
            InFlight {
                generation: job.generation,
                token: job.token.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.token.cancel();
            debug!(node = %node_id, "superseded in-flight computation");
        }
        Some(job)
    }

    /// Remove the in-flight record if it still belongs to `job`.
    fn retire(state: &mut SchedulerState, job: &Job) -> bool {
        let current = state
            .in_flight
            .get(&job.node_id)
            .is_some_and(|flight| flight.generation == job.generation);
        if current {
            state.in_flight.remove(&job.node_id);
        }
        current
    }

    fn finish_success(
        &self,
        job: &Job,
        outputs: Arc<ValueMap>,
        cached: bool,
        elapsed: Duration,
    ) -> bool {
        {
            let mut state = self.inner.state.lock();
            if !Self::retire(&mut state, job) {
                return false;
            }
            let Some(node) = state.nodes.get_mut(&job.node_id) else {
                return false;
            };
            node.outputs = Some(Arc::clone(&outputs));
            node.last_error = None;
        }
        self.inner.queue.clear_dirty(job.node_id);
        trace!(node = %job.node_id, cached, ?elapsed, "node computed");

        self.propagate(job.node_id, &outputs);
        self.emit(EngineEvent::NodeComputed {
            node_id: job.node_id,
            outputs: Some(outputs),
            error: None,
            cached,
            elapsed,
        });
        true
    }

    fn finish_failure(&self, job: &Job, error: ComputeError, elapsed: Duration) {
        {
            let mut state = self.inner.state.lock();
            if !Self::retire(&mut state, job) {
                return;
            }
            if let Some(node) = state.nodes.get_mut(&job.node_id) {
                node.last_error = Some(error.clone());
            }
            state.parked.insert(job.node_id);
        }
        warn!(node = %job.node_id, type_tag = %job.type_tag, error = %error, "node computation failed");

        self.emit(EngineEvent::NodeComputed {
            node_id: job.node_id,
            outputs: None,
            error: Some(error),
            cached: false,
            elapsed,
        });
    }

    fn finish_cancelled(&self, job: &Job) {
        Self::retire(&mut self.inner.state.lock(), job);
        debug!(node = %job.node_id, "discarded cancelled computation");
    }

    /// Deliver fresh outputs into every connected downstream input and mark
    /// the targets whose input content actually changed.
    fn propagate(&self, node_id: NodeId, outputs: &ValueMap) {
        let edges = self.inner.graph.read().outgoing(node_id).to_vec();
        if edges.is_empty() {
            return;
        }

        let mut changed = Vec::new();
        {
            let mut state = self.inner.state.lock();
            for edge in &edges {
                let Some(target) = state.nodes.get_mut(&edge.target) else {
                    continue;
                };
                let next = select_output(outputs, &edge.source_output);
                let differs = match (target.inputs.get(&edge.target_slot), &next) {
                    (Some(old), Some(new)) => old.content_hash() != new.content_hash(),
                    (None, None) => false,
                    _ => true,
                };
                match next {
                    Some(value) => {
                        target.inputs.insert(edge.target_slot.clone(), value);
                    }
                    None => {
                        target.inputs.shift_remove(&edge.target_slot);
                    }
                }
                if differs {
                    changed.push(edge.target);
                }
            }
        }

        let _batch = self.inner.queue.block();
        for target in changed {
            self.on_input_change(target);
        }
    }

    /// Dirty cone members, minus parked nodes and everything below them.
    fn runnable_nodes(&self) -> Vec<NodeId> {
        let (cone, parked) = {
            let state = self.inner.state.lock();
            (state.cone.clone(), state.parked.clone())
        };
        if cone.is_empty() {
            return Vec::new();
        }

        let mut blocked = HashSet::new();
        {
            let graph = self.inner.graph.read();
            for id in parked.iter().filter(|id| cone.contains(id)) {
                blocked.insert(*id);
                blocked.extend(graph.descendants(*id));
            }
        }

        self.inner
            .queue
            .dirty_nodes()
            .into_iter()
            .filter(|id| cone.contains(id) && !blocked.contains(id))
            .collect()
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn render_target(&self) -> Option<NodeId> {
        self.inner.state.lock().target
    }

    /// Current cone: the render target and all of its ancestors.
    pub fn cone(&self) -> HashSet<NodeId> {
        self.inner.state.lock().cone.clone()
    }

    pub fn in_cone(&self, node_id: NodeId) -> bool {
        self.inner.state.lock().cone.contains(&node_id)
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.inner.state.lock().nodes.contains_key(&node_id)
    }

    /// Last good outputs of a node.
    pub fn outputs(&self, node_id: NodeId) -> Option<Arc<ValueMap>> {
        self.inner
            .state
            .lock()
            .nodes
            .get(&node_id)
            .and_then(|node| node.outputs.clone())
    }

    /// One output of a node (the sole output if `slot` is absent and the
    /// node produced exactly one).
    pub fn output(&self, node_id: NodeId, slot: &str) -> Option<Value> {
        self.outputs(node_id)
            .and_then(|outputs| select_output(&outputs, slot))
    }

    pub fn status(&self, node_id: NodeId) -> Option<NodeStatus> {
        let (in_flight, failed) = {
            let state = self.inner.state.lock();
            let node = state.nodes.get(&node_id)?;
            (
                state.in_flight.contains_key(&node_id),
                node.last_error.is_some(),
            )
        };
        Some(NodeStatus::derive(
            in_flight,
            failed,
            self.inner.queue.is_dirty(node_id),
        ))
    }

    pub fn last_error(&self, node_id: NodeId) -> Option<ComputeError> {
        self.inner
            .state
            .lock()
            .nodes
            .get(&node_id)
            .and_then(|node| node.last_error.clone())
    }

    /// How many times the node's compute function actually ran.
    pub fn compute_count(&self, node_id: NodeId) -> u64 {
        self.inner
            .state
            .lock()
            .nodes
            .get(&node_id)
            .map_or(0, |node| node.compute_count)
    }

    /// Compute function invocations across all nodes.
    pub fn total_computations(&self) -> u64 {
        self.inner.state.lock().invocations
    }

    /// Number of passes scheduled since creation (coalesced requests count
    /// once).
    pub fn passes_scheduled(&self) -> u64 {
        self.inner.state.lock().passes_scheduled
    }

    pub fn is_dirty(&self, node_id: NodeId) -> bool {
        self.inner.queue.is_dirty(node_id)
    }

    /// Whether nothing in the cone is waiting to compute.
    pub fn is_idle(&self) -> bool {
        let in_flight = !self.inner.state.lock().in_flight.is_empty();
        !in_flight && !self.inner.queue.has_pending() && self.runnable_nodes().is_empty()
    }

    pub fn params(&self, node_id: NodeId) -> Option<Params> {
        self.inner
            .state
            .lock()
            .nodes
            .get(&node_id)
            .map(|node| node.params.clone())
    }

    pub fn param(&self, node_id: NodeId, name: &str) -> Option<ParamValue> {
        self.inner
            .state
            .lock()
            .nodes
            .get(&node_id)
            .and_then(|node| node.params.get(name).cloned())
    }

    pub fn input(&self, node_id: NodeId, slot: &str) -> Option<Value> {
        self.inner
            .state
            .lock()
            .nodes
            .get(&node_id)
            .and_then(|node| node.inputs.get(slot).cloned())
    }

    fn type_tag(&self, node_id: NodeId) -> Result<TypeTag, GraphError> {
        self.inner
            .state
            .lock()
            .nodes
            .get(&node_id)
            .map(|node| node.type_tag.clone())
            .ok_or(GraphError::UnknownNode(node_id))
    }

    /// Run `f` against the dependency graph. Do not call back into the
    /// scheduler from `f`.
    pub fn with_graph<R>(&self, f: impl FnOnce(&DependencyGraph) -> R) -> R {
        f(&self.inner.graph.read())
    }

    pub fn node_count(&self) -> usize {
        self.inner.graph.read().node_count()
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.inner.cache
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.inner.registry
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    /// Attach a post-dirty hook to a node.
    pub fn add_hook<F>(&self, node_id: NodeId, name: impl Into<String>, hook: F)
    where
        F: Fn(NodeId) -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.inner.queue.add_hook(node_id, name, hook);
    }

    pub fn remove_hook(&self, node_id: NodeId, name: &str) -> bool {
        self.inner.queue.remove_hook(node_id, name)
    }

    /// Cancel everything in flight and drop all nodes, edges and dirty
    /// state. The cache is shared and left alone.
    pub fn clear(&self) {
        {
            let mut state = self.inner.state.lock();
            for (_, flight) in state.in_flight.drain() {
                flight.token.cancel();
            }
            *state = SchedulerState::default();
        }
        self.inner.graph.write().clear();
        self.inner.queue.clear();
        debug!("scheduler cleared");
    }

    fn emit(&self, event: EngineEvent) {
        self.inner.events.emit(&event);
    }
}

impl std::fmt::Debug for RenderConeScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("RenderConeScheduler")
            .field("nodes", &state.nodes.len())
            .field("target", &state.target)
            .field("cone", &state.cone.len())
            .field("in_flight", &state.in_flight.len())
            .finish()
    }
}

fn cone_of(graph: &DependencyGraph, target: NodeId) -> HashSet<NodeId> {
    let mut cone = graph.ancestors(target);
    cone.insert(target);
    cone
}

/// The named output, or the sole output of a single-output node.
fn select_output(outputs: &ValueMap, slot: &str) -> Option<Value> {
    outputs
        .get(slot)
        .or_else(|| {
            if outputs.len() == 1 {
                outputs.values().next()
            } else {
                None
            }
        })
        .cloned()
}

fn validate_outputs(outputs: ValueMap) -> Result<ValueMap, ComputeError> {
    match outputs.iter().find(|(_, value)| !value.is_valid()) {
        Some((slot, value)) => Err(ComputeError::InvalidOutput(format!(
            "output '{slot}' holds an invalid {}",
            value.kind_name()
        ))),
        None => Ok(outputs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ParamKind;

    /// `value` param passed through; `in` input added to it when present.
    fn registry() -> Arc<NodeRegistry> {
        let registry = NodeRegistry::new();
        registry.register(
            NodeType::sync("num", |params, inputs, _| {
                let own = params.get("value").and_then(ParamValue::as_f64).unwrap_or(0.0);
                let upstream = inputs.get("in").and_then(Value::as_number).unwrap_or(0.0);
                Ok(ValueMap::from([("out".to_string(), Value::Number(own + upstream))]))
            })
            .with_param_kind("value", ParamKind::Number, 0.0),
        );
        registry.register(NodeType::sync("fail", |_, _, _| {
            Err(ComputeError::failed("boom"))
        }));
        registry.register(NodeType::sync("nan", |_, _, _| {
            Ok(ValueMap::from([("out".to_string(), Value::Number(f64::NAN))]))
        }));
        registry.register(
            NodeType::sync("mutate", |_, inputs, _| {
                let mut geometry = inputs
                    .get("in")
                    .and_then(Value::as_geometry)
                    .cloned()
                    .ok_or_else(|| ComputeError::MissingInput("in".into()))?;
                geometry.positions_mut()[0][0] += 1.0;
                Ok(ValueMap::from([("out".to_string(), Value::Geometry(geometry))]))
            })
            .with_input_policy(InputPolicy::Isolated),
        );
        Arc::new(registry)
    }

    fn scheduler() -> RenderConeScheduler {
        RenderConeScheduler::new(registry(), Arc::new(ContentCache::new(64)))
    }

    fn chain(scheduler: &RenderConeScheduler, len: usize) -> Vec<NodeId> {
        let ids: Vec<_> = (0..len).map(|_| scheduler.add_node("num").unwrap()).collect();
        for pair in ids.windows(2) {
            scheduler.connect(pair[0], pair[1], "in").unwrap();
        }
        ids
    }

    #[tokio::test]
    async fn computes_cone_in_order() {
        let scheduler = scheduler();
        let ids = chain(&scheduler, 3);
        scheduler.set_param(ids[0], "value", 2.0).unwrap();

        scheduler.set_render_target(Some(ids[2])).unwrap();
        let report = scheduler.settle().await;

        assert_eq!(report.computed, 3);
        assert_eq!(scheduler.output(ids[2], "out"), Some(Value::Number(2.0)));
        for id in &ids {
            assert_eq!(scheduler.status(*id), Some(NodeStatus::Clean));
        }
    }

    #[tokio::test]
    async fn mutations_before_a_pass_coalesce() {
        let scheduler = scheduler();
        let ids = chain(&scheduler, 3);
        scheduler.set_render_target(Some(ids[2])).unwrap();
        scheduler.settle().await;
        // Let the follow-up passes spawned during the first settle run out.
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        let before = scheduler.passes_scheduled();

        for (i, id) in ids.iter().enumerate() {
            assert!(scheduler.set_param(*id, "value", i as f64 + 1.0).unwrap());
        }
        assert_eq!(scheduler.passes_scheduled(), before + 1);

        let report = scheduler.settle().await;
        assert_eq!(report.passes, 1);
        for id in &ids {
            assert_eq!(scheduler.compute_count(*id), 2);
        }
        assert_eq!(scheduler.output(ids[2], "out"), Some(Value::Number(6.0)));
    }

    #[tokio::test]
    async fn no_target_means_no_work() {
        let scheduler = scheduler();
        let ids = chain(&scheduler, 2);

        assert!(!scheduler.set_param(ids[0], "value", 1.0).unwrap());
        scheduler.settle().await;

        assert_eq!(scheduler.total_computations(), 0);
        assert!(scheduler.outputs(ids[1]).is_none());
    }

    #[tokio::test]
    async fn out_of_cone_node_is_not_computed() {
        let scheduler = scheduler();
        let ids = chain(&scheduler, 2);
        let side = scheduler.add_node("num").unwrap();
        scheduler.connect(ids[0], side, "in").unwrap();

        scheduler.set_render_target(Some(ids[1])).unwrap();
        scheduler.settle().await;
        let before = scheduler.total_computations();

        assert!(!scheduler.set_param(side, "value", 5.0).unwrap());
        scheduler.settle().await;

        assert_eq!(scheduler.total_computations(), before);
        assert_eq!(scheduler.compute_count(side), 0);
    }

    #[tokio::test]
    async fn unchanged_output_stops_recompute_downstream() {
        let scheduler = scheduler();
        let ids = chain(&scheduler, 2);
        scheduler.set_render_target(Some(ids[1])).unwrap();
        scheduler.settle().await;

        // Same value again: the key is unchanged, so both nodes hit the cache.
        scheduler.set_param(ids[0], "value", 0.0).unwrap();
        let report = scheduler.settle().await;

        assert_eq!(report.computed, 0);
        assert_eq!(report.cache_hits, 2);
        assert_eq!(scheduler.compute_count(ids[0]), 1);
    }

    #[tokio::test]
    async fn failure_keeps_last_outputs_and_parks() {
        let scheduler = scheduler();
        let bad = scheduler.add_node("fail").unwrap();
        let down = scheduler.add_node("num").unwrap();
        scheduler.connect(bad, down, "in").unwrap();
        scheduler.set_render_target(Some(down)).unwrap();

        let report = scheduler.settle().await;

        assert_eq!(report.failed, 1);
        assert_eq!(scheduler.status(bad), Some(NodeStatus::Error));
        assert_eq!(scheduler.last_error(bad), Some(ComputeError::failed("boom")));
        // Held back behind the failure, still dirty.
        assert_eq!(scheduler.status(down), Some(NodeStatus::Dirty));
        assert!(scheduler.is_idle());
    }

    #[tokio::test]
    async fn invalid_output_is_a_failure() {
        let scheduler = scheduler();
        let id = scheduler.add_node("nan").unwrap();
        scheduler.set_render_target(Some(id)).unwrap();
        scheduler.settle().await;

        assert!(matches!(
            scheduler.last_error(id),
            Some(ComputeError::InvalidOutput(_))
        ));
        assert!(scheduler.outputs(id).is_none());
        assert!(scheduler.cache().is_empty());
    }

    #[tokio::test]
    async fn isolated_inputs_do_not_touch_upstream() {
        use crate::value::Geometry;

        let scheduler = scheduler();
        let id = scheduler.add_node("mutate").unwrap();
        let original = Geometry::new(vec![[0.0; 3]; 3], vec![0, 1, 2]);
        scheduler
            .set_input(id, "in", Value::Geometry(original.clone()))
            .unwrap();
        scheduler.set_render_target(Some(id)).unwrap();
        scheduler.settle().await;

        let out = scheduler.output(id, "out").unwrap();
        assert_eq!(out.as_geometry().unwrap().positions()[0][0], 1.0);
        let input = scheduler.input(id, "in").unwrap();
        assert_eq!(input.as_geometry().unwrap().positions()[0][0], 0.0);
        assert!(!out.as_geometry().unwrap().shares_buffers_with(&original));
    }

    #[tokio::test]
    async fn connect_rejects_cycles() {
        let scheduler = scheduler();
        let ids = chain(&scheduler, 3);

        let err = scheduler.connect(ids[2], ids[0], "in").unwrap_err();
        assert!(matches!(err, GraphError::SlotOccupied { .. } | GraphError::Cycle { .. }));
        assert!(matches!(
            scheduler.connect(ids[2], ids[0], "other"),
            Err(GraphError::Cycle { .. })
        ));
        assert_eq!(scheduler.with_graph(DependencyGraph::edge_count), 2);
    }

    #[tokio::test]
    async fn switching_target_computes_only_new_nodes() {
        let scheduler = scheduler();
        let root = scheduler.add_node("num").unwrap();
        let left = scheduler.add_node("num").unwrap();
        let right = scheduler.add_node("num").unwrap();
        scheduler.connect(root, left, "in").unwrap();
        scheduler.connect(root, right, "in").unwrap();

        scheduler.set_render_target(Some(left)).unwrap();
        scheduler.settle().await;
        scheduler.set_render_target(Some(right)).unwrap();
        let report = scheduler.settle().await;

        assert_eq!(report.computed, 1);
        assert_eq!(scheduler.compute_count(root), 1);
        assert_eq!(scheduler.compute_count(right), 1);
    }

    #[tokio::test]
    async fn removing_target_halts() {
        let scheduler = scheduler();
        let ids = chain(&scheduler, 2);
        scheduler.set_render_target(Some(ids[1])).unwrap();
        scheduler.settle().await;

        scheduler.remove_node(ids[1]).unwrap();

        assert_eq!(scheduler.render_target(), None);
        assert!(scheduler.cone().is_empty());
        assert!(!scheduler.set_param(ids[0], "value", 3.0).unwrap());
    }

    #[tokio::test]
    async fn unknown_type_and_param_are_rejected() {
        let scheduler = scheduler();
        assert!(matches!(
            scheduler.add_node("nope"),
            Err(EngineError::UnknownNodeType(_))
        ));

        let id = scheduler.add_node("num").unwrap();
        assert!(matches!(
            scheduler.set_param(id, "value", "text"),
            Err(EngineError::Param(_))
        ));
        assert!(matches!(
            scheduler.set_param(id, "missing", 1.0),
            Err(EngineError::Param(_))
        ));
    }
}

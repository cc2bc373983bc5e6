//! Compute Queue
//!
//! The queue owns every node's dirty state and turns bursts of dirty
//! marking into batched work.
//!
//! # How It Works
//!
//! 1. [`ComputeQueue::mark_dirty`] sets a node's flag, records two pending
//!    tasks for it (run its post-dirty hooks, and a compute step) and
//!    recurses into its successors.
//!
//! 2. The recursion happens while a reference-counted block is held, so a
//!    single root change that dirties a whole subtree schedules exactly one
//!    drain, not one per edge.
//!
//! 3. When the block count returns to zero, a drain is scheduled on the next
//!    tick of the tokio runtime (if one is running; otherwise it stays
//!    pending until someone awaits [`ComputeQueue::drain`]).
//!
//! 4. A drain snapshots the pending tasks, orders them topologically and
//!    runs them one at a time. Compute steps are handed to the registered
//!    [`ComputeDelegate`] (the scheduler). A failing task is logged and the
//!    batch continues.

mod dirty;

use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::BoxFuture;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

pub use dirty::{DirtyState, PostDirtyHook};

use crate::error::HookError;
use crate::graph::{DependencyGraph, NodeId};

/// Receives the compute steps the queue drains.
pub trait ComputeDelegate: Send + Sync {
    fn compute_step(&self, node_id: NodeId) -> BoxFuture<'static, ()>;
}

/// Work recorded for one node between drains.
#[derive(Debug, Clone, Copy, Default)]
struct PendingWork {
    hooks: bool,
    compute: bool,
}

/// Outcome of one [`ComputeQueue::drain`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub nodes: usize,
    pub hooks_run: usize,
    pub compute_steps: usize,
    pub failures: usize,
}

#[derive(Default)]
struct QueueState {
    states: HashMap<NodeId, DirtyState>,
    pending: IndexMap<NodeId, PendingWork>,
    block_depth: usize,
    drain_scheduled: bool,
    drains_scheduled: u64,
}

struct QueueInner {
    graph: Arc<RwLock<DependencyGraph>>,
    state: Mutex<QueueState>,
    delegate: RwLock<Option<Arc<dyn ComputeDelegate>>>,
    /// At most one drain runs at a time.
    drain_lock: tokio::sync::Mutex<()>,
}

/// Dirty-state owner and batching queue. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ComputeQueue {
    inner: Arc<QueueInner>,
}

/// Holds the queue blocked until dropped.
pub struct BlockGuard {
    queue: ComputeQueue,
}

impl Drop for BlockGuard {
    fn drop(&mut self) {
        self.queue.unblock();
    }
}

impl ComputeQueue {
    pub fn new(graph: Arc<RwLock<DependencyGraph>>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                graph,
                state: Mutex::new(QueueState::default()),
                delegate: RwLock::new(None),
                drain_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Route compute steps to `delegate`. Without a delegate they are
    /// dropped during the drain.
    pub fn set_delegate(&self, delegate: Arc<dyn ComputeDelegate>) {
        *self.inner.delegate.write() = Some(delegate);
    }

    /// Mark a node and, transitively, everything downstream of it.
    ///
    /// Returns the number of nodes that changed from clean to dirty.
    pub fn mark_dirty(&self, node_id: NodeId) -> usize {
        self.mark(node_id, None)
    }

    /// Like [`mark_dirty`](Self::mark_dirty), but nodes outside `scope` are
    /// neither marked nor traversed.
    pub fn mark_dirty_within(&self, node_id: NodeId, scope: &HashSet<NodeId>) -> usize {
        self.mark(node_id, Some(scope))
    }

    fn mark(&self, node_id: NodeId, scope: Option<&HashSet<NodeId>>) -> usize {
        if scope.is_some_and(|scope| !scope.contains(&node_id)) {
            return 0;
        }

        {
            let mut state = self.inner.state.lock();
            let dirty = state.states.entry(node_id).or_default();
            if !dirty.mark() {
                return 0;
            }
            let hooks = dirty.has_hooks();
            let work = state.pending.entry(node_id).or_default();
            work.hooks |= hooks;
            work.compute = true;
        }
        trace!(node = %node_id, "marked dirty");

        let _batch = self.block();
        let successors = self.inner.graph.read().successors(node_id);
        let mut marked = 1;
        for successor in successors {
            marked += self.mark(successor, scope);
        }
        marked
    }

    /// Hold draining until the returned guard (and every other guard) drops.
    pub fn block(&self) -> BlockGuard {
        self.inner.state.lock().block_depth += 1;
        BlockGuard {
            queue: self.clone(),
        }
    }

    fn unblock(&self) {
        let should_drain = {
            let mut state = self.inner.state.lock();
            state.block_depth = state.block_depth.saturating_sub(1);
            state.block_depth == 0 && !state.pending.is_empty()
        };
        if should_drain {
            self.schedule_drain();
        }
    }

    /// Arrange for a drain on the next tick. Repeated calls before the drain
    /// starts coalesce.
    pub fn schedule_drain(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.drain_scheduled {
                return;
            }
            state.drain_scheduled = true;
            state.drains_scheduled += 1;
        }

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let queue = self.clone();
            handle.spawn(async move {
                tokio::task::yield_now().await;
                queue.drain().await;
            });
        }
    }

    /// Run every pending task in topological order.
    pub async fn drain(&self) -> DrainReport {
        let _running = self.inner.drain_lock.lock().await;

        let batch = {
            let mut state = self.inner.state.lock();
            state.drain_scheduled = false;
            std::mem::take(&mut state.pending)
        };
        let mut report = DrainReport {
            nodes: batch.len(),
            ..DrainReport::default()
        };
        if batch.is_empty() {
            return report;
        }

        let mut order = self.inner.graph.read().topological_sort(batch.keys().copied());
        // Nodes removed from the graph since they were queued still get
        // their hooks, after everything else.
        if order.len() < batch.len() {
            let sorted: HashSet<NodeId> = order.iter().copied().collect();
            order.extend(batch.keys().copied().filter(|id| !sorted.contains(id)));
        }
        debug!(nodes = order.len(), "draining compute queue");

        let delegate = self.inner.delegate.read().clone();
        for node_id in order {
            let work = batch[&node_id];

            if work.hooks {
                let hooks = self
                    .inner
                    .state
                    .lock()
                    .states
                    .get(&node_id)
                    .map(DirtyState::hooks)
                    .unwrap_or_default();

                for (name, hook) in hooks {
                    match panic::catch_unwind(AssertUnwindSafe(|| hook(node_id))) {
                        Ok(Ok(())) => report.hooks_run += 1,
                        Ok(Err(err)) => {
                            report.failures += 1;
                            warn!(node = %node_id, hook = %name, error = %err, "post-dirty hook failed");
                        }
                        Err(_) => {
                            report.failures += 1;
                            warn!(node = %node_id, hook = %name, "post-dirty hook panicked");
                        }
                    }
                }
            }

            if work.compute {
                if let Some(delegate) = &delegate {
                    delegate.compute_step(node_id).await;
                    report.compute_steps += 1;
                }
            }
        }

        let more = !self.inner.state.lock().pending.is_empty();
        if more {
            self.schedule_drain();
        }
        report
    }

    pub fn is_dirty(&self, node_id: NodeId) -> bool {
        self.inner
            .state
            .lock()
            .states
            .get(&node_id)
            .is_some_and(DirtyState::is_dirty)
    }

    /// When `node_id` became dirty, if it is dirty.
    pub fn dirty_since(&self, node_id: NodeId) -> Option<Instant> {
        self.inner
            .state
            .lock()
            .states
            .get(&node_id)
            .and_then(DirtyState::since)
    }

    /// All currently dirty nodes (unordered).
    pub fn dirty_nodes(&self) -> Vec<NodeId> {
        self.inner
            .state
            .lock()
            .states
            .iter()
            .filter(|(_, state)| state.is_dirty())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Clear a node's flag after a successful recompute. Hooks stay attached.
    pub fn clear_dirty(&self, node_id: NodeId) {
        if let Some(state) = self.inner.state.lock().states.get_mut(&node_id) {
            state.clear();
        }
    }

    /// Attach a named post-dirty hook, replacing any hook with that name.
    pub fn add_hook<F>(&self, node_id: NodeId, name: impl Into<String>, hook: F)
    where
        F: Fn(NodeId) -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.inner
            .state
            .lock()
            .states
            .entry(node_id)
            .or_default()
            .add_hook(name.into(), Arc::new(hook));
    }

    pub fn remove_hook(&self, node_id: NodeId, name: &str) -> bool {
        self.inner
            .state
            .lock()
            .states
            .get_mut(&node_id)
            .is_some_and(|state| state.remove_hook(name))
    }

    /// Drop all state kept for a removed node.
    pub fn forget(&self, node_id: NodeId) {
        let mut state = self.inner.state.lock();
        state.states.remove(&node_id);
        state.pending.shift_remove(&node_id);
    }

    /// Drop all dirty state, hooks and pending work.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        state.states.clear();
        state.pending.clear();
    }

    /// Whether tasks are waiting for a drain.
    pub fn has_pending(&self) -> bool {
        !self.inner.state.lock().pending.is_empty()
    }

    /// Number of drains scheduled since creation.
    pub fn drains_scheduled(&self) -> u64 {
        self.inner.state.lock().drains_scheduled
    }
}

impl std::fmt::Debug for ComputeQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ComputeQueue")
            .field("tracked", &state.states.len())
            .field("pending", &state.pending.len())
            .field("block_depth", &state.block_depth)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::TypeTag;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn chain(len: usize) -> (Arc<RwLock<DependencyGraph>>, Vec<NodeId>) {
        let mut graph = DependencyGraph::new();
        let ids: Vec<_> = (0..len).map(|_| graph.add_node(TypeTag::from("t"))).collect();
        for pair in ids.windows(2) {
            graph.connect(pair[0], pair[1], "in").unwrap();
        }
        (Arc::new(RwLock::new(graph)), ids)
    }

    struct CountingDelegate(Arc<Mutex<Vec<NodeId>>>);

    impl ComputeDelegate for CountingDelegate {
        fn compute_step(&self, node_id: NodeId) -> BoxFuture<'static, ()> {
            self.0.lock().push(node_id);
            Box::pin(async {})
        }
    }

    #[test]
    fn mark_dirty_propagates_downstream() {
        let (graph, ids) = chain(3);
        let queue = ComputeQueue::new(graph);

        assert_eq!(queue.mark_dirty(ids[1]), 2);
        assert!(!queue.is_dirty(ids[0]));
        assert!(queue.is_dirty(ids[1]));
        assert!(queue.is_dirty(ids[2]));

        // Already dirty: no-op.
        assert_eq!(queue.mark_dirty(ids[1]), 0);
    }

    #[test]
    fn scoped_marking_stops_at_scope_boundary() {
        let (graph, ids) = chain(3);
        let queue = ComputeQueue::new(graph);
        let scope = HashSet::from([ids[0], ids[1]]);

        assert_eq!(queue.mark_dirty_within(ids[0], &scope), 2);
        assert!(!queue.is_dirty(ids[2]));
        assert_eq!(queue.mark_dirty_within(ids[2], &scope), 0);
    }

    #[test]
    fn one_root_change_schedules_one_drain() {
        let (graph, ids) = chain(5);
        let queue = ComputeQueue::new(graph);

        queue.mark_dirty(ids[0]);

        assert_eq!(queue.drains_scheduled(), 1);
        assert!(queue.has_pending());
    }

    #[test]
    fn explicit_block_defers_drain() {
        let (graph, ids) = chain(2);
        let queue = ComputeQueue::new(graph);

        let guard = queue.block();
        queue.mark_dirty(ids[0]);
        assert_eq!(queue.drains_scheduled(), 0);

        drop(guard);
        assert_eq!(queue.drains_scheduled(), 1);
    }

    #[tokio::test]
    async fn drain_runs_hooks_in_topological_order() {
        let (graph, ids) = chain(3);
        let queue = ComputeQueue::new(graph);
        let order = Arc::new(Mutex::new(Vec::new()));

        // Register in reverse to make sure ordering comes from the graph.
        for id in ids.iter().rev() {
            let sink = order.clone();
            queue.add_hook(*id, "record", move |node| {
                sink.lock().push(node);
                Ok(())
            });
        }
        let steps = Arc::new(Mutex::new(Vec::new()));
        queue.set_delegate(Arc::new(CountingDelegate(steps.clone())));

        queue.mark_dirty(ids[0]);
        let report = queue.drain().await;

        assert_eq!(*order.lock(), ids);
        assert_eq!(*steps.lock(), ids);
        assert_eq!(report.hooks_run, 3);
        assert_eq!(report.compute_steps, 3);
        assert!(!queue.has_pending());
    }

    #[tokio::test]
    async fn failing_hook_does_not_abort_batch() {
        let (graph, ids) = chain(3);
        let queue = ComputeQueue::new(graph);
        let ran = Arc::new(AtomicUsize::new(0));

        queue.add_hook(ids[0], "broken", |_| Err("badge offline".into()));
        queue.add_hook(ids[1], "panics", |_| panic!("hook bug"));
        let counter = ran.clone();
        queue.add_hook(ids[2], "ok", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        queue.mark_dirty(ids[0]);
        let report = queue.drain().await;

        assert_eq!(report.failures, 2);
        assert_eq!(report.hooks_run, 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn scheduled_drain_runs_on_next_tick() {
        let (graph, ids) = chain(2);
        let queue = ComputeQueue::new(graph);
        let steps = Arc::new(Mutex::new(Vec::new()));
        queue.set_delegate(Arc::new(CountingDelegate(steps.clone())));

        queue.mark_dirty(ids[0]);
        assert!(steps.lock().is_empty());

        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*steps.lock(), ids);
    }

    #[test]
    fn clear_dirty_and_forget() {
        let (graph, ids) = chain(2);
        let queue = ComputeQueue::new(graph);
        queue.mark_dirty(ids[0]);
        assert!(queue.dirty_since(ids[0]).is_some());

        queue.clear_dirty(ids[0]);
        assert!(!queue.is_dirty(ids[0]));
        assert_eq!(queue.dirty_nodes(), vec![ids[1]]);

        queue.forget(ids[1]);
        assert!(queue.dirty_nodes().is_empty());
    }
}

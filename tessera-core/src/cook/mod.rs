//! Cook-on-Demand
//!
//! A façade over a [`RenderConeScheduler`] that collaborators (property
//! panels, the canvas, scripting) talk to instead of mutating the scheduler
//! directly.
//!
//! # How It Works
//!
//! 1. [`CookOnDemandSystem::submit`] queues a reason-tagged
//!    [`CookRequest`]. Requests are deduplicated by node: within one batch
//!    the last request for a node wins.
//!
//! 2. [`CookOnDemandSystem::flush`] walks the batch. A request that would
//!    not change anything (same value, or a numeric delta below the
//!    configured epsilon) is dropped and counted as a redundant cook. The
//!    rest are applied to the scheduler; for value changes the cache is
//!    consulted right away so a previously seen state resolves without
//!    running the node.
//!
//! 3. [`CookOnDemandSystem::cook`] is submit + flush + settle.
//!
//! Every scheduler event is republished on the system's own bus, and feeds
//! the rolling [`CookStats`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::cache::ContentCache;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::{EngineEvent, EventBus, ListenerId};
use crate::graph::{NodeId, DEFAULT_OUTPUT};
use crate::scheduler::{NodeRegistry, PassReport, RenderConeScheduler};
use crate::value::{ParamValue, TypedValue, Value};

/// Why a cook was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CookReason {
    ParameterChange,
    InputChange,
    ConnectionChange,
    RenderTargetChange,
}

/// The mutation a request carries.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Parameter { name: String, value: ParamValue },
    /// Set (`Some`) or clear (`None`) a directly supplied input value.
    Input { slot: String, value: Option<Value> },
    Connect {
        source: NodeId,
        output: String,
        slot: String,
    },
    Disconnect { slot: String },
    /// Make the request's node the render target.
    RenderTarget,
}

/// One change request against one node.
#[derive(Debug, Clone, PartialEq)]
pub struct CookRequest {
    pub node_id: NodeId,
    pub change: Change,
}

impl CookRequest {
    pub fn parameter(node_id: NodeId, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        Self {
            node_id,
            change: Change::Parameter {
                name: name.into(),
                value: value.into(),
            },
        }
    }

    pub fn input(node_id: NodeId, slot: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            node_id,
            change: Change::Input {
                slot: slot.into(),
                value: Some(value.into()),
            },
        }
    }

    pub fn clear_input(node_id: NodeId, slot: impl Into<String>) -> Self {
        Self {
            node_id,
            change: Change::Input {
                slot: slot.into(),
                value: None,
            },
        }
    }

    /// Connect `source`'s default output to `target`'s `slot`.
    pub fn connect(source: NodeId, target: NodeId, slot: impl Into<String>) -> Self {
        Self {
            node_id: target,
            change: Change::Connect {
                source,
                output: DEFAULT_OUTPUT.to_string(),
                slot: slot.into(),
            },
        }
    }

    pub fn disconnect(target: NodeId, slot: impl Into<String>) -> Self {
        Self {
            node_id: target,
            change: Change::Disconnect { slot: slot.into() },
        }
    }

    pub fn render_target(node_id: NodeId) -> Self {
        Self {
            node_id,
            change: Change::RenderTarget,
        }
    }

    pub fn reason(&self) -> CookReason {
        match self.change {
            Change::Parameter { .. } => CookReason::ParameterChange,
            Change::Input { .. } => CookReason::InputChange,
            Change::Connect { .. } | Change::Disconnect { .. } => CookReason::ConnectionChange,
            Change::RenderTarget => CookReason::RenderTargetChange,
        }
    }
}

/// Outcome of one [`CookOnDemandSystem::flush`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Requests applied to the scheduler.
    pub applied: usize,
    /// Requests dropped as insignificant.
    pub redundant: usize,
    /// Nodes brought up to date from the cache during the flush.
    pub resolved_from_cache: usize,
}

/// Outcome of one [`CookOnDemandSystem::cook`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CookReport {
    pub flush: FlushReport,
    pub passes: PassReport,
}

/// Rolling efficiency metrics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CookStats {
    /// Requests submitted.
    pub requests: u64,
    /// Requests replaced by a later request for the same node in the same
    /// batch.
    pub superseded: u64,
    /// Requests dropped as insignificant.
    pub redundant: u64,
    /// Compute function invocations observed.
    pub nodes_cooked: u64,
    /// Node results served from the cache.
    pub cache_hits: u64,
    pub failures: u64,
    /// Mean compute time over the most recent computations.
    pub average_compute_time: Duration,
}

impl CookStats {
    /// Fraction of node results that came from the cache.
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.nodes_cooked;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }

    /// Fraction of submitted requests dropped as insignificant.
    pub fn redundant_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.redundant as f64 / self.requests as f64
        }
    }
}

#[derive(Debug, Default)]
struct Metrics {
    requests: u64,
    superseded: u64,
    redundant: u64,
    nodes_cooked: u64,
    cache_hits: u64,
    failures: u64,
    recent: VecDeque<Duration>,
}

impl Metrics {
    fn observe(&mut self, event: &EngineEvent, window: usize) {
        let EngineEvent::NodeComputed {
            error,
            cached,
            elapsed,
            ..
        } = event
        else {
            return;
        };

        if error.is_some() {
            self.failures += 1;
        } else if *cached {
            self.cache_hits += 1;
        } else {
            self.nodes_cooked += 1;
            self.recent.push_back(*elapsed);
            while self.recent.len() > window {
                self.recent.pop_front();
            }
        }
    }

    fn snapshot(&self) -> CookStats {
        let average_compute_time = match self.recent.len() {
            0 => Duration::ZERO,
            n => self.recent.iter().sum::<Duration>() / n as u32,
        };
        CookStats {
            requests: self.requests,
            superseded: self.superseded,
            redundant: self.redundant,
            nodes_cooked: self.nodes_cooked,
            cache_hits: self.cache_hits,
            failures: self.failures,
            average_compute_time,
        }
    }
}

/// Batching, filtering front end to a scheduler.
pub struct CookOnDemandSystem {
    scheduler: RenderConeScheduler,
    config: EngineConfig,
    pending: Mutex<IndexMap<NodeId, CookRequest>>,
    metrics: Arc<Mutex<Metrics>>,
    events: Arc<EventBus>,
    relay: ListenerId,
}

impl CookOnDemandSystem {
    /// Build a scheduler and cache sized from `config`.
    pub fn new(registry: Arc<NodeRegistry>, config: EngineConfig) -> Self {
        let cache = Arc::new(ContentCache::new(config.cache_capacity));
        Self::with_scheduler(RenderConeScheduler::new(registry, cache), config)
    }

    /// Wrap an existing scheduler.
    pub fn with_scheduler(scheduler: RenderConeScheduler, config: EngineConfig) -> Self {
        let metrics = Arc::new(Mutex::new(Metrics::default()));
        let events = Arc::new(EventBus::new());

        let relay = {
            let metrics = Arc::clone(&metrics);
            let events = Arc::clone(&events);
            let window = config.stats_window.max(1);
            scheduler.events().subscribe(move |event| {
                metrics.lock().observe(event, window);
                events.emit(event);
            })
        };

        Self {
            scheduler,
            config,
            pending: Mutex::new(IndexMap::new()),
            metrics,
            events,
            relay,
        }
    }

    pub fn scheduler(&self) -> &RenderConeScheduler {
        &self.scheduler
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Queue a request. A pending request for the same node is replaced.
    pub fn submit(&self, request: CookRequest) {
        let replaced = self
            .pending
            .lock()
            .insert(request.node_id, request)
            .is_some();

        let mut metrics = self.metrics.lock();
        metrics.requests += 1;
        if replaced {
            metrics.superseded += 1;
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Apply every pending request, in submission order.
    ///
    /// Stops at the first request the scheduler rejects; requests after it
    /// stay pending.
    pub fn flush(&self) -> Result<FlushReport, EngineError> {
        let mut report = FlushReport::default();

        loop {
            let Some((node_id, request)) = self.pending.lock().shift_remove_index(0) else {
                break;
            };

            if !self.is_significant(&request) {
                self.metrics.lock().redundant += 1;
                report.redundant += 1;
                trace!(node = %node_id, reason = ?request.reason(), "dropped redundant cook request");
                continue;
            }

            let scheduled = match self.apply(&request) {
                Ok(scheduled) => scheduled,
                Err(err) => {
                    debug!(node = %node_id, error = %err, "cook request rejected");
                    return Err(err);
                }
            };
            report.applied += 1;

            let value_change = matches!(
                request.reason(),
                CookReason::ParameterChange | CookReason::InputChange
            );
            if scheduled && value_change && self.scheduler.resolve_from_cache(node_id) {
                report.resolved_from_cache += 1;
            }
        }

        if report.applied + report.redundant > 0 {
            debug!(
                applied = report.applied,
                redundant = report.redundant,
                resolved = report.resolved_from_cache,
                "flushed cook requests"
            );
        }
        Ok(report)
    }

    /// Submit one request, flush, and wait for the scheduler to settle.
    pub async fn cook(&self, request: CookRequest) -> Result<CookReport, EngineError> {
        self.submit(request);
        self.cook_pending().await
    }

    /// Flush whatever is pending and wait for the scheduler to settle.
    pub async fn cook_pending(&self) -> Result<CookReport, EngineError> {
        let flush = self.flush()?;
        let passes = self.scheduler.settle().await;
        Ok(CookReport { flush, passes })
    }

    /// Halt the scheduler: clear the render target.
    pub fn clear_render_target(&self) -> Result<(), EngineError> {
        self.pending
            .lock()
            .retain(|_, request| request.reason() != CookReason::RenderTargetChange);
        Ok(self.scheduler.set_render_target(None)?)
    }

    fn is_significant(&self, request: &CookRequest) -> bool {
        let node_id = request.node_id;
        match &request.change {
            Change::Parameter { name, value } => match self.scheduler.param(node_id, name) {
                Some(current) => current.differs_significantly(value, self.config.significance_epsilon),
                None => true,
            },
            Change::Input { slot, value } => {
                let current = self.scheduler.input(node_id, slot);
                match (current, value) {
                    (Some(current), Some(next)) => current.content_hash() != next.content_hash(),
                    (None, None) => false,
                    _ => true,
                }
            }
            Change::Connect {
                source,
                output,
                slot,
            } => !self.scheduler.with_graph(|graph| {
                graph
                    .node(node_id)
                    .and_then(|node| node.input(slot))
                    .is_some_and(|edge| edge.source == *source && edge.source_output == *output)
            }),
            Change::Disconnect { slot } => self.scheduler.with_graph(|graph| {
                graph
                    .node(node_id)
                    .is_some_and(|node| node.input(slot).is_some())
            }),
            Change::RenderTarget => self.scheduler.render_target() != Some(node_id),
        }
    }

    fn apply(&self, request: &CookRequest) -> Result<bool, EngineError> {
        let node_id = request.node_id;
        let scheduled = match &request.change {
            Change::Parameter { name, value } => {
                self.scheduler.set_param(node_id, name, value.clone())?
            }
            Change::Input {
                slot,
                value: Some(value),
            } => self.scheduler.set_input(node_id, slot, value.clone())?,
            Change::Input { slot, value: None } => self.scheduler.clear_input(node_id, slot)?,
            Change::Connect {
                source,
                output,
                slot,
            } => {
                self.scheduler
                    .connect_output(*source, output, node_id, slot)?;
                self.scheduler.in_cone(node_id)
            }
            Change::Disconnect { slot } => {
                self.scheduler.disconnect(node_id, slot)?;
                self.scheduler.in_cone(node_id)
            }
            Change::RenderTarget => {
                self.scheduler.set_render_target(Some(node_id))?;
                true
            }
        };
        Ok(scheduled)
    }

    /// Listen to every scheduler event, republished.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.events.unsubscribe(id)
    }

    pub fn stats(&self) -> CookStats {
        self.metrics.lock().snapshot()
    }

    pub fn reset_stats(&self) {
        *self.metrics.lock() = Metrics::default();
        self.scheduler.cache().reset_stats();
    }

    /// Periodic housekeeping: sweep aged cache entries if configured.
    /// Returns the number of entries removed.
    pub fn maintain(&self) -> usize {
        match self.config.prune_max_age() {
            Some(max_age) => self.scheduler.cache().prune(max_age),
            None => 0,
        }
    }
}

impl Drop for CookOnDemandSystem {
    fn drop(&mut self) {
        self.scheduler.events().unsubscribe(self.relay);
    }
}

impl std::fmt::Debug for CookOnDemandSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookOnDemandSystem")
            .field("scheduler", &self.scheduler)
            .field("pending", &self.pending())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ComputeError;
    use crate::scheduler::NodeType;
    use crate::value::{ParamKind, ValueMap};

    fn system() -> CookOnDemandSystem {
        let registry = NodeRegistry::new();
        registry.register(
            NodeType::sync("add", |params, inputs, _| {
                let own = params.get("value").and_then(ParamValue::as_f64).unwrap_or(0.0);
                let upstream = inputs.get("in").and_then(Value::as_number).unwrap_or(0.0);
                Ok(ValueMap::from([("out".to_string(), Value::Number(own + upstream))]))
            })
            .with_param_kind("value", ParamKind::Number, 0.0),
        );
        registry.register(NodeType::sync("broken", |_, _, _| {
            Err(ComputeError::failed("no luck"))
        }));
        CookOnDemandSystem::new(Arc::new(registry), EngineConfig::default())
    }

    #[test]
    fn last_request_per_node_wins() {
        let system = system();
        let id = system.scheduler().add_node("add").unwrap();

        system.submit(CookRequest::parameter(id, "value", 1.0));
        system.submit(CookRequest::parameter(id, "value", 2.0));
        assert_eq!(system.pending(), 1);

        let report = system.flush().unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(
            system.scheduler().param(id, "value"),
            Some(ParamValue::Number(2.0))
        );
        assert_eq!(system.stats().superseded, 1);
    }

    #[test]
    fn tiny_numeric_changes_are_redundant() {
        let system = system();
        let id = system.scheduler().add_node("add").unwrap();

        system.submit(CookRequest::parameter(id, "value", 1e-9));
        let report = system.flush().unwrap();

        assert_eq!(report.redundant, 1);
        assert_eq!(report.applied, 0);
        assert_eq!(system.stats().redundant_rate(), 1.0);
    }

    #[tokio::test]
    async fn cache_resolves_previously_seen_state() {
        let system = system();
        let id = system.scheduler().add_node("add").unwrap();
        system.cook(CookRequest::render_target(id)).await.unwrap();

        system.cook(CookRequest::parameter(id, "value", 5.0)).await.unwrap();
        let back = system
            .cook(CookRequest::parameter(id, "value", 0.0))
            .await
            .unwrap();

        assert_eq!(back.flush.resolved_from_cache, 1);
        assert_eq!(back.passes.computed, 0);
        assert_eq!(system.scheduler().compute_count(id), 2);

        let stats = system.stats();
        assert_eq!(stats.nodes_cooked, 2);
        assert_eq!(stats.cache_hits, 1);
        assert!((stats.hit_rate() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn batched_upstream_change_defers_cache_resolve() {
        let system = system();
        let scheduler = system.scheduler().clone();
        let a = scheduler.add_node("add").unwrap();
        let b = scheduler.add_node("add").unwrap();
        let c = scheduler.add_node("add").unwrap();
        scheduler.connect(a, b, "in").unwrap();
        scheduler.connect(b, c, "in").unwrap();
        system.cook(CookRequest::render_target(c)).await.unwrap();

        // Leave an entry for B at value 5 with a zero input behind.
        system.cook(CookRequest::parameter(b, "value", 5.0)).await.unwrap();
        system.cook(CookRequest::parameter(b, "value", 0.0)).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        system.subscribe(move |event| {
            if let EngineEvent::NodeComputed {
                node_id,
                outputs: Some(outputs),
                ..
            } = event
            {
                sink.lock().push((*node_id, outputs["out"].clone()));
            }
        });

        system.submit(CookRequest::parameter(a, "value", 1.0));
        system.submit(CookRequest::parameter(b, "value", 5.0));
        let report = system.cook_pending().await.unwrap();

        assert_eq!(report.flush.resolved_from_cache, 0);
        assert_eq!(
            *seen.lock(),
            vec![
                (a, Value::Number(1.0)),
                (b, Value::Number(6.0)),
                (c, Value::Number(6.0)),
            ]
        );
    }

    #[tokio::test]
    async fn events_are_republished() {
        let system = system();
        let id = system.scheduler().add_node("add").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        system.subscribe(move |event| sink.lock().push(event.clone()));

        system.cook(CookRequest::render_target(id)).await.unwrap();

        let seen = seen.lock();
        assert!(matches!(seen[0], EngineEvent::RenderTargetChanged { .. }));
        assert!(seen.iter().any(|event| matches!(
            event,
            EngineEvent::NodeComputed { node_id, error: None, .. } if *node_id == id
        )));
    }

    #[tokio::test]
    async fn failures_are_counted() {
        let system = system();
        let id = system.scheduler().add_node("broken").unwrap();

        system.cook(CookRequest::render_target(id)).await.unwrap();

        assert_eq!(system.stats().failures, 1);
        assert_eq!(system.stats().nodes_cooked, 0);
    }

    #[test]
    fn rejected_request_surfaces_error() {
        let system = system();
        let id = system.scheduler().add_node("add").unwrap();

        system.submit(CookRequest::parameter(id, "value", "not a number"));
        assert!(matches!(system.flush(), Err(EngineError::Param(_))));
    }

    #[test]
    fn maintain_without_max_age_is_a_no_op() {
        let system = system();
        assert_eq!(system.maintain(), 0);
    }
}

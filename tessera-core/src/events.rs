//! Engine Events
//!
//! The scheduler reports what it did through an ordered stream of
//! [`EngineEvent`]s. Rendering and UI collaborators subscribe to the stream
//! instead of polling node state.
//!
//! # Delivery
//!
//! Events are delivered synchronously, in emission order, to every listener
//! registered at the time of emission. A listener that panics is logged and
//! skipped; the remaining listeners still receive the event.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::warn;

use crate::error::ComputeError;
use crate::graph::NodeId;
use crate::value::ValueMap;

/// Something observable happened in a scheduler.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A node finished a computation, successfully or not. Cancelled
    /// computations produce no event.
    NodeComputed {
        node_id: NodeId,
        outputs: Option<Arc<ValueMap>>,
        error: Option<ComputeError>,
        /// The outputs came from the cache; no compute function ran.
        cached: bool,
        /// Wall time spent in the compute function (zero for cache hits).
        elapsed: Duration,
    },

    /// The render cone was recomputed. Carries the render target.
    ConeUpdated { node_id: Option<NodeId> },

    RenderTargetChanged { node_id: Option<NodeId> },

    InputConnected {
        node_id: NodeId,
        input_key: String,
        source_node_id: NodeId,
    },

    InputDisconnected {
        node_id: NodeId,
        input_key: String,
        source_node_id: NodeId,
    },
}

impl EngineEvent {
    /// The node the event is about, if any.
    pub fn node_id(&self) -> Option<NodeId> {
        match self {
            EngineEvent::NodeComputed { node_id, .. }
            | EngineEvent::InputConnected { node_id, .. }
            | EngineEvent::InputDisconnected { node_id, .. } => Some(*node_id),
            EngineEvent::ConeUpdated { node_id } | EngineEvent::RenderTargetChanged { node_id } => {
                *node_id
            }
        }
    }
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

/// Publish/subscribe fan-out for [`EngineEvent`]s.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. It receives every event emitted after this call.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Deliver `event` to every listener.
    pub fn emit(&self, event: &EngineEvent) {
        // Snapshot so listeners may (un)subscribe while being called.
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!(node = ?event.node_id(), "event listener panicked; continuing delivery");
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn target_changed(id: u64) -> EngineEvent {
        EngineEvent::RenderTargetChanged {
            node_id: Some(NodeId::from(id)),
        }
    }

    #[test]
    fn listeners_receive_events_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(move |event| sink.lock().push(event.node_id()));

        bus.emit(&target_changed(1));
        bus.emit(&target_changed(2));

        assert_eq!(
            *seen.lock(),
            vec![Some(NodeId::from(1)), Some(NodeId::from(2))]
        );
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));
        let counter = count.clone();
        let id = bus.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&target_changed(1));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(&target_changed(2));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));

        bus.subscribe(|_| panic!("listener failure"));
        let counter = count.clone();
        bus.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&target_changed(1));
        bus.emit(&target_changed(2));

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}

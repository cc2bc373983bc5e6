//! Tessera Core
//!
//! This crate provides the recompute engine behind the Tessera node-graph
//! editor. Given a directed acyclic graph of computation nodes it decides
//! which nodes must re-run when something changes, runs them in dependency
//! order, caches their results by content, and isolates nested sub-graphs.
//!
//! It implements:
//!
//! - A dependency graph with cycle rejection and subset topological order
//! - A content-addressed cache with targeted invalidation and LRU eviction
//! - Dirty propagation with batched, deferred draining
//! - A render-cone scheduler with per-node cancellation
//! - A cook-on-demand front end that filters redundant changes
//! - Subflow contexts with single-active-output cone isolation
//!
//! Node types (the actual geometry, lighting and so on) are external: they
//! register a compute function `(params, inputs, context) -> outputs` with
//! a [`NodeRegistry`] and the engine treats it as a black box.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `graph`: node ids, edges and the [`DependencyGraph`]
//! - `value`: parameter and value types, content hashing
//! - `cache`: cache keys and the [`ContentCache`]
//! - `queue`: dirty state, post-dirty hooks and the [`ComputeQueue`]
//! - `scheduler`: node types and the [`RenderConeScheduler`]
//! - `events`: the [`EngineEvent`] stream
//! - `cook`: the [`CookOnDemandSystem`]
//! - `subflow`: the [`SubflowManager`]
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tessera_core::{CookOnDemandSystem, CookRequest, EngineConfig, NodeRegistry, NodeType};
//! use tessera_core::value::{Value, ValueMap};
//!
//! let registry = NodeRegistry::new();
//! registry.register(
//!     NodeType::sync("scale", |params, inputs, _| {
//!         let factor = params["factor"].as_f64().unwrap_or(1.0);
//!         let x = inputs.get("in").and_then(Value::as_number).unwrap_or(1.0);
//!         Ok(ValueMap::from([("out".into(), Value::Number(x * factor))]))
//!     })
//!     .with_param("factor", 2.0),
//! );
//!
//! let system = CookOnDemandSystem::new(Arc::new(registry), EngineConfig::default());
//! let node = system.scheduler().add_node("scale")?;
//!
//! system.cook(CookRequest::render_target(node)).await?;
//! system.cook(CookRequest::parameter(node, "factor", 3.0)).await?;
//! // Same value again: filtered, nothing recomputes.
//! system.cook(CookRequest::parameter(node, "factor", 3.0)).await?;
//! assert_eq!(system.stats().redundant, 1);
//! ```

pub mod cache;
pub mod config;
pub mod cook;
pub mod error;
pub mod events;
pub mod graph;
pub mod queue;
pub mod scheduler;
pub mod subflow;
pub mod value;

pub use cache::{CacheStats, ContentCache};
pub use config::EngineConfig;
pub use cook::{CookOnDemandSystem, CookReason, CookRequest, CookStats};
pub use error::{ComputeError, EngineError, GraphError, ParamError};
pub use events::{EngineEvent, EventBus, ListenerId};
pub use graph::{DependencyGraph, NodeId, TypeTag};
pub use queue::ComputeQueue;
pub use scheduler::{
    ComputeContext, InputPolicy, NodeRegistry, NodeStatus, NodeType, RenderConeScheduler,
};
pub use subflow::SubflowManager;

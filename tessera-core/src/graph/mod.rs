//! Dependency Graph
//!
//! This module implements the graph of computation nodes that the rest of
//! the engine schedules over.
//!
//! # Overview
//!
//! The dependency graph is a directed acyclic graph (DAG) where:
//!
//! - Nodes are instances of a node type (a primitive generator, a light, a
//!   merge, a subflow container, ...)
//! - Edges carry one output of a node into one input slot of another: if B
//!   reads from A, there is an edge from A to B
//!
//! When something changes, the scheduler asks the graph for the ancestor
//! closure of the render target (the cone), for the successors to mark dirty,
//! and for a topological order of the nodes it is about to run.
//!
//! # Design Decisions
//!
//! 1. The graph is the single source of truth for structure. Everything else
//!    refers to nodes by [`NodeId`].
//!
//! 2. The graph is indexed by node ID for O(1) lookups.
//!
//! 3. We maintain both forward (outputs) and reverse (inputs) edges so that
//!    ancestor and descendant walks are equally cheap.

mod dag;
mod node;

pub use dag::DependencyGraph;
pub use node::{Edge, Node, NodeId, TypeTag, DEFAULT_OUTPUT};

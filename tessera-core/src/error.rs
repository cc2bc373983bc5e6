//! Error Types
//!
//! Failures in the engine are always local to the node or the mutation that
//! produced them. Structural errors are returned synchronously from the graph
//! mutation that caused them, compute errors travel inside events and node
//! state, and nothing here is ever escalated to a panic.

use thiserror::Error;

use crate::graph::{NodeId, TypeTag};
use crate::value::ParamKind;

/// A rejected graph mutation. The graph is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("node {0} does not exist")]
    UnknownNode(NodeId),

    #[error("node {0} cannot be connected to itself")]
    SelfLoop(NodeId),

    #[error("connecting {from} -> {to} would create a cycle")]
    Cycle { from: NodeId, to: NodeId },

    #[error("input '{slot}' of node {target} is already connected")]
    SlotOccupied { target: NodeId, slot: String },

    #[error("input '{slot}' of node {target} is not connected")]
    NotConnected { target: NodeId, slot: String },
}

/// A parameter that does not fit its node type's schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamError {
    #[error("node type '{type_tag}' has no parameter '{name}'")]
    UnknownParam { type_tag: TypeTag, name: String },

    #[error("parameter '{name}' expects {expected:?}, got {found:?}")]
    KindMismatch {
        name: String,
        expected: ParamKind,
        found: ParamKind,
    },
}

/// Failure of a single node computation.
///
/// Cloneable so the same error can be stored on the node and carried by the
/// `NodeComputed` event.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ComputeError {
    #[error("no compute function registered for node type '{0}'")]
    UnknownType(TypeTag),

    #[error("required input '{0}' has no value")]
    MissingInput(String),

    #[error("output '{0}' is not a valid value")]
    InvalidOutput(String),

    #[error("{0}")]
    Failed(String),
}

impl ComputeError {
    /// Convenience constructor for node implementations.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Error returned by a post-dirty hook. Logged, never propagated.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Umbrella error for engine-level operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Param(#[from] ParamError),

    #[error(transparent)]
    Compute(#[from] ComputeError),

    #[error("node type '{0}' is not registered")]
    UnknownNodeType(TypeTag),

    #[error("node {0} is not a subflow container")]
    UnknownSubflow(NodeId),

    #[error("node {member} is not a member of subflow {container}")]
    NotAMember { container: NodeId, member: NodeId },

    #[error("invalid engine configuration: {0}")]
    Config(#[from] serde_json::Error),
}

//! Per-node scheduler state.

use std::sync::Arc;

use crate::error::ComputeError;
use crate::graph::TypeTag;
use crate::value::{Params, ValueMap};

/// Where a node is in its compute lifecycle.
///
/// ```text
/// Clean -> Dirty -> Computing -> Clean
///                            \-> Error (still dirty until a later success)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// Outputs are up to date.
    Clean,

    /// Something the node depends on changed since its last success.
    Dirty,

    /// A computation is in flight.
    Computing,

    /// The last computation failed. The node keeps its last good outputs
    /// and stays dirty.
    Error,
}

impl NodeStatus {
    pub(crate) fn derive(in_flight: bool, failed: bool, dirty: bool) -> Self {
        if in_flight {
            NodeStatus::Computing
        } else if failed && dirty {
            NodeStatus::Error
        } else if dirty {
            NodeStatus::Dirty
        } else {
            NodeStatus::Clean
        }
    }
}

/// Everything the scheduler knows about one node besides its structure.
#[derive(Debug, Clone)]
pub(crate) struct NodeState {
    pub type_tag: TypeTag,
    pub params: Params,
    pub resources: Params,
    /// Current input values by slot: delivered by upstream outputs or set
    /// directly for unconnected slots.
    pub inputs: ValueMap,
    /// Last good outputs.
    pub outputs: Option<Arc<ValueMap>>,
    pub last_error: Option<ComputeError>,
    /// Times the compute function was actually invoked.
    pub compute_count: u64,
}

impl NodeState {
    pub fn new(type_tag: TypeTag, params: Params) -> Self {
        Self {
            type_tag,
            params,
            resources: Params::new(),
            inputs: ValueMap::new(),
            outputs: None,
            last_error: None,
            compute_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions() {
        // Fresh node, never marked.
        assert_eq!(NodeStatus::derive(false, false, false), NodeStatus::Clean);

        // Marked dirty.
        assert_eq!(NodeStatus::derive(false, false, true), NodeStatus::Dirty);

        // Running.
        assert_eq!(NodeStatus::derive(true, false, true), NodeStatus::Computing);

        // Failed: still dirty, reported as error.
        assert_eq!(NodeStatus::derive(false, true, true), NodeStatus::Error);

        // A later success clears both.
        assert_eq!(NodeStatus::derive(false, false, false), NodeStatus::Clean);
    }

    #[test]
    fn new_state_has_no_outputs() {
        let state = NodeState::new(TypeTag::from("sphere"), Params::new());
        assert!(state.outputs.is_none());
        assert_eq!(state.compute_count, 0);
    }
}

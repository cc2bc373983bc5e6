//! Dependency Graph
//!
//! The graph owns every node and edge. All other components refer to nodes
//! by [`NodeId`] only, so removing a node here is the single point where a
//! node stops existing.
//!
//! # Invariants
//!
//! - The graph is acyclic. [`DependencyGraph::connect`] checks reachability
//!   before mutating and rejects edges that would close a cycle.
//! - Each input slot is written by at most one edge.
//! - Forward (`outputs`) and reverse (`inputs`) adjacency are kept in sync so
//!   both directions can be walked without a scan.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::trace;

use super::node::{Edge, Node, NodeId, TypeTag, DEFAULT_OUTPUT};
use crate::error::GraphError;

/// A directed acyclic graph of computation nodes.
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    /// All nodes in the graph, indexed by ID.
    nodes: HashMap<NodeId, Node>,

    /// Total edge count, maintained on connect/disconnect.
    edge_count: usize,
}

impl DependencyGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node of the given type and return its freshly generated id.
    pub fn add_node(&mut self, type_tag: TypeTag) -> NodeId {
        let node = Node::new(type_tag);
        let id = node.id();
        self.nodes.insert(id, node);
        id
    }

    /// Insert a node with a caller-chosen id. An existing node with the same
    /// id is replaced together with its edges.
    pub fn insert_node(&mut self, id: NodeId, type_tag: TypeTag) {
        if self.nodes.contains_key(&id) {
            self.remove_node(id);
        }
        self.nodes.insert(id, Node::with_id(id, type_tag));
    }

    /// Remove a node from the graph.
    ///
    /// Also removes all edges involving this node. Returns the detached edges
    /// so callers can report disconnections.
    pub fn remove_node(&mut self, node_id: NodeId) -> Option<(Node, Vec<Edge>)> {
        let node = self.nodes.remove(&node_id)?;
        let mut detached = Vec::new();

        for edge in node.inputs() {
            if let Some(source) = self.nodes.get_mut(&edge.source) {
                source.detach_output(edge);
            }
            detached.push(edge.clone());
        }

        for edge in node.outputs() {
            if let Some(target) = self.nodes.get_mut(&edge.target) {
                target.detach_input(&edge.target_slot);
            }
            detached.push(edge.clone());
        }

        self.edge_count -= detached.len();
        Some((node, detached))
    }

    /// Get a reference to a node.
    pub fn node(&self, node_id: NodeId) -> Option<&Node> {
        self.nodes.get(&node_id)
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.nodes.contains_key(&node_id)
    }

    /// Iterate over all node ids (unordered).
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    /// Connect the default output of `source` into `slot` of `target`.
    pub fn connect(
        &mut self,
        source: NodeId,
        target: NodeId,
        slot: impl Into<String>,
    ) -> Result<Edge, GraphError> {
        self.connect_output(source, DEFAULT_OUTPUT, target, slot)
    }

    /// Connect a named output of `source` into `slot` of `target`.
    ///
    /// Fails, leaving the graph untouched, when either node is missing, the
    /// slot already has a writer, or the edge would create a cycle.
    pub fn connect_output(
        &mut self,
        source: NodeId,
        output: impl Into<String>,
        target: NodeId,
        slot: impl Into<String>,
    ) -> Result<Edge, GraphError> {
        let slot = slot.into();

        if !self.nodes.contains_key(&source) {
            return Err(GraphError::UnknownNode(source));
        }
        let target_node = self
            .nodes
            .get(&target)
            .ok_or(GraphError::UnknownNode(target))?;

        if source == target {
            return Err(GraphError::SelfLoop(source));
        }
        if target_node.input(&slot).is_some() {
            return Err(GraphError::SlotOccupied { target, slot });
        }
        if self.reaches(target, source) {
            return Err(GraphError::Cycle {
                from: source,
                to: target,
            });
        }

        let edge = Edge::new(source, output, target, slot);
        if let Some(node) = self.nodes.get_mut(&source) {
            node.attach_output(edge.clone());
        }
        if let Some(node) = self.nodes.get_mut(&target) {
            node.attach_input(edge.clone());
        }
        self.edge_count += 1;

        trace!(%source, %target, slot = %edge.target_slot, "connected");
        Ok(edge)
    }

    /// Remove the edge occupying `slot` of `target`.
    pub fn disconnect(&mut self, target: NodeId, slot: &str) -> Result<Edge, GraphError> {
        let edge = self
            .nodes
            .get_mut(&target)
            .ok_or(GraphError::UnknownNode(target))?
            .detach_input(slot)
            .ok_or_else(|| GraphError::NotConnected {
                target,
                slot: slot.to_string(),
            })?;

        if let Some(source) = self.nodes.get_mut(&edge.source) {
            source.detach_output(&edge);
        }
        self.edge_count -= 1;

        trace!(source = %edge.source, %target, slot, "disconnected");
        Ok(edge)
    }

    /// Whether `to` is reachable from `from` by following edges downstream.
    ///
    /// A node reaches itself.
    pub fn reaches(&self, from: NodeId, to: NodeId) -> bool {
        if from == to {
            return true;
        }

        let mut visited = HashSet::new();
        let mut stack = vec![from];

        while let Some(node_id) = stack.pop() {
            if !visited.insert(node_id) {
                continue;
            }
            let Some(node) = self.nodes.get(&node_id) else {
                continue;
            };
            for dependent in node.dependents() {
                if dependent == to {
                    return true;
                }
                stack.push(dependent);
            }
        }

        false
    }

    /// Direct upstream nodes of `node_id`.
    pub fn predecessors(&self, node_id: NodeId) -> Vec<NodeId> {
        self.nodes
            .get(&node_id)
            .map(|node| node.dependencies().collect())
            .unwrap_or_default()
    }

    /// Direct downstream nodes of `node_id`.
    pub fn successors(&self, node_id: NodeId) -> Vec<NodeId> {
        self.nodes
            .get(&node_id)
            .map(|node| node.dependents().collect())
            .unwrap_or_default()
    }

    /// Outgoing edges of `node_id`.
    pub fn outgoing(&self, node_id: NodeId) -> &[Edge] {
        self.nodes
            .get(&node_id)
            .map(|node| node.outputs())
            .unwrap_or(&[])
    }

    /// Every node `node_id` transitively depends on. Excludes the node itself.
    pub fn ancestors(&self, node_id: NodeId) -> HashSet<NodeId> {
        self.walk(node_id, |node| node.dependencies().collect())
    }

    /// Every node that transitively depends on `node_id`. Excludes the node
    /// itself.
    pub fn descendants(&self, node_id: NodeId) -> HashSet<NodeId> {
        self.walk(node_id, |node| node.dependents().collect())
    }

    fn walk(&self, start: NodeId, next: impl Fn(&Node) -> Vec<NodeId>) -> HashSet<NodeId> {
        let mut found = HashSet::new();
        let mut queue = VecDeque::new();

        if let Some(node) = self.nodes.get(&start) {
            queue.extend(next(node));
        }

        while let Some(node_id) = queue.pop_front() {
            if node_id == start || !found.insert(node_id) {
                continue;
            }
            if let Some(node) = self.nodes.get(&node_id) {
                queue.extend(next(node));
            }
        }

        found
    }

    /// Perform a topological sort of the given nodes.
    ///
    /// Returns the subset in an order such that every node comes after all of
    /// its ancestors that are also in the subset, even when the connection
    /// between two subset members runs through nodes outside the subset.
    /// Ids not present in the graph are dropped.
    pub fn topological_sort(&self, subset: impl IntoIterator<Item = NodeId>) -> Vec<NodeId> {
        let mut wanted: Vec<NodeId> = Vec::new();
        let mut wanted_set = HashSet::new();
        for node_id in subset {
            if self.nodes.contains_key(&node_id) && wanted_set.insert(node_id) {
                wanted.push(node_id);
            }
        }
        if wanted.len() <= 1 {
            return wanted;
        }

        // Run Kahn over the ancestor closure so paths through non-members
        // still constrain the order, then keep only the requested ids.
        let mut closure = wanted_set.clone();
        let mut order: Vec<NodeId> = wanted.clone();
        for &node_id in &wanted {
            for ancestor in self.ancestors(node_id) {
                if closure.insert(ancestor) {
                    order.push(ancestor);
                }
            }
        }

        let mut in_degree: HashMap<NodeId, usize> = HashMap::new();
        let mut queue = VecDeque::new();
        let mut result = Vec::with_capacity(wanted.len());

        // In-degrees count only edges inside the closure.
        for &node_id in &order {
            let degree = self.nodes[&node_id]
                .dependencies()
                .filter(|d| closure.contains(d))
                .count();
            in_degree.insert(node_id, degree);
            if degree == 0 {
                queue.push_back(node_id);
            }
        }

        while let Some(node_id) = queue.pop_front() {
            if wanted_set.contains(&node_id) {
                result.push(node_id);
            }

            for dependent_id in self.nodes[&node_id].dependents() {
                if let Some(degree) = in_degree.get_mut(&dependent_id) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        queue.push_back(dependent_id);
                    }
                }
            }
        }

        result
    }

    /// Get the total number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Get the total number of edges in the graph.
    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    /// Drop every node and edge.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.edge_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag() -> TypeTag {
        TypeTag::from("test")
    }

    fn chain(graph: &mut DependencyGraph, len: usize) -> Vec<NodeId> {
        let ids: Vec<_> = (0..len).map(|_| graph.add_node(tag())).collect();
        for pair in ids.windows(2) {
            graph.connect(pair[0], pair[1], "in").unwrap();
        }
        ids
    }

    #[test]
    fn add_and_remove_nodes() {
        let mut graph = DependencyGraph::new();

        let id1 = graph.add_node(tag());
        let id2 = graph.add_node(tag());

        assert_eq!(graph.node_count(), 2);

        graph.remove_node(id1);
        assert_eq!(graph.node_count(), 1);
        assert!(graph.node(id1).is_none());
        assert!(graph.node(id2).is_some());
    }

    #[test]
    fn remove_node_detaches_edges() {
        let mut graph = DependencyGraph::new();
        let ids = chain(&mut graph, 3);

        let (_, detached) = graph.remove_node(ids[1]).unwrap();

        assert_eq!(detached.len(), 2);
        assert_eq!(graph.edge_count(), 0);
        assert!(graph.successors(ids[0]).is_empty());
        assert!(graph.node(ids[2]).unwrap().input("in").is_none());
    }

    #[test]
    fn connect_and_disconnect() {
        let mut graph = DependencyGraph::new();
        let source = graph.add_node(tag());
        let target = graph.add_node(tag());

        graph.connect(source, target, "in").unwrap();
        assert_eq!(graph.successors(source), vec![target]);
        assert_eq!(graph.predecessors(target), vec![source]);

        let edge = graph.disconnect(target, "in").unwrap();
        assert_eq!(edge.source, source);
        assert!(graph.successors(source).is_empty());
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn occupied_slot_is_rejected() {
        let mut graph = DependencyGraph::new();
        let a = graph.add_node(tag());
        let b = graph.add_node(tag());
        let c = graph.add_node(tag());

        graph.connect(a, c, "in").unwrap();
        let err = graph.connect(b, c, "in").unwrap_err();

        assert!(matches!(err, GraphError::SlotOccupied { .. }));
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.node(c).unwrap().input("in").unwrap().source, a);
    }

    #[test]
    fn cycles_are_rejected_without_mutation() {
        let mut graph = DependencyGraph::new();
        let ids = chain(&mut graph, 4);

        let err = graph.connect(ids[3], ids[0], "back").unwrap_err();
        assert_eq!(
            err,
            GraphError::Cycle {
                from: ids[3],
                to: ids[0]
            }
        );
        assert_eq!(graph.edge_count(), 3);
        assert!(graph.successors(ids[3]).is_empty());

        assert_eq!(
            graph.connect(ids[2], ids[2], "self").unwrap_err(),
            GraphError::SelfLoop(ids[2])
        );
    }

    #[test]
    fn unknown_nodes_are_rejected() {
        let mut graph = DependencyGraph::new();
        let a = graph.add_node(tag());
        let ghost = NodeId::new();

        assert_eq!(
            graph.connect(a, ghost, "in").unwrap_err(),
            GraphError::UnknownNode(ghost)
        );
        assert!(matches!(
            graph.disconnect(a, "in").unwrap_err(),
            GraphError::NotConnected { .. }
        ));
    }

    #[test]
    fn ancestors_and_descendants() {
        // a -> b -> d, a -> c -> d
        let mut graph = DependencyGraph::new();
        let a = graph.add_node(tag());
        let b = graph.add_node(tag());
        let c = graph.add_node(tag());
        let d = graph.add_node(tag());
        graph.connect(a, b, "in").unwrap();
        graph.connect(a, c, "in").unwrap();
        graph.connect(b, d, "left").unwrap();
        graph.connect(c, d, "right").unwrap();

        assert_eq!(graph.ancestors(d), HashSet::from([a, b, c]));
        assert_eq!(graph.descendants(a), HashSet::from([b, c, d]));
        assert!(graph.ancestors(a).is_empty());
        assert!(graph.descendants(d).is_empty());
    }

    #[test]
    fn topological_sort_orders_chain() {
        let mut graph = DependencyGraph::new();
        let ids = chain(&mut graph, 4);

        let reversed: Vec<_> = ids.iter().rev().copied().collect();
        assert_eq!(graph.topological_sort(reversed), ids);
    }

    #[test]
    fn topological_sort_respects_paths_through_non_members() {
        let mut graph = DependencyGraph::new();
        let ids = chain(&mut graph, 3);

        // Only the two ends are requested; the middle node still orders them.
        let order = graph.topological_sort([ids[2], ids[0]]);
        assert_eq!(order, vec![ids[0], ids[2]]);
    }

    #[test]
    fn topological_sort_drops_unknown_ids() {
        let mut graph = DependencyGraph::new();
        let a = graph.add_node(tag());

        let order = graph.topological_sort([NodeId::new(), a]);
        assert_eq!(order, vec![a]);
    }

    #[test]
    fn reaches_follows_edges_downstream() {
        let mut graph = DependencyGraph::new();
        let ids = chain(&mut graph, 3);

        assert!(graph.reaches(ids[0], ids[2]));
        assert!(!graph.reaches(ids[2], ids[0]));
    }
}

//! Subflows
//!
//! A subflow is a nested graph living inside a container node of the
//! parent graph. Each container gets its own [`SubflowContext`]: a private
//! dependency graph, scheduler, dirty state and cache. Nothing inside a
//! subflow is visible to the parent except its boundary output.
//!
//! # Cone Isolation
//!
//! A subflow has at most one active output member. That member is the
//! internal scheduler's render target, so a member computes if and only if
//! the active output reads from it (directly or transitively). With no
//! active output nothing inside computes at all.
//!
//! ```text
//!   parent:   P ──► [container] ──► Q
//!                      │
//!   subflow:           ├─ A ──► B1   (active)
//!                      └─ A ──► B2   (stored, not computed)
//! ```
//!
//! Switching the active output only computes the members that were not
//! already in the old cone. Members exclusive to the old cone keep their
//! cache entries, so switching back is cheap.
//!
//! # Parent Integration
//!
//! [`SubflowManager::container_node_type`] produces a node type for the
//! parent graph. Its compute function feeds the container's inputs into
//! the bound member slots, settles the subflow and returns the boundary
//! output. When a parent scheduler is attached, every internal mutation
//! invalidates the container node there, so the parent never serves a
//! stale cached boundary value.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures_util::future::FutureExt;
use indexmap::{IndexMap, IndexSet};
use tracing::debug;

use crate::cache::ContentCache;
use crate::error::{ComputeError, EngineError};
use crate::graph::{NodeId, TypeTag};
use crate::scheduler::{NodeRegistry, NodeType, PassReport, RenderConeScheduler};
use crate::value::{ParamValue, ValueMap};

/// Where a container input is delivered inside the subflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputBinding {
    pub member: NodeId,
    pub slot: String,
}

/// Internal state of one container node.
#[derive(Debug)]
pub struct SubflowContext {
    container: NodeId,
    scheduler: RenderConeScheduler,
    members: IndexSet<NodeId>,
    active_output: Option<NodeId>,
    /// Container input slot → member input.
    bindings: IndexMap<String, InputBinding>,
}

impl SubflowContext {
    pub fn container(&self) -> NodeId {
        self.container
    }

    pub fn scheduler(&self) -> &RenderConeScheduler {
        &self.scheduler
    }

    pub fn members(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members.iter().copied()
    }

    pub fn active_output(&self) -> Option<NodeId> {
        self.active_output
    }

    pub fn bindings(&self) -> &IndexMap<String, InputBinding> {
        &self.bindings
    }

    fn ensure_member(&self, member: NodeId) -> Result<(), EngineError> {
        if self.members.contains(&member) {
            Ok(())
        } else {
            Err(EngineError::NotAMember {
                container: self.container,
                member,
            })
        }
    }
}

/// Owner of every subflow context, keyed by container node.
pub struct SubflowManager {
    registry: Arc<NodeRegistry>,
    cache_capacity: usize,
    contexts: DashMap<NodeId, SubflowContext>,
    parent: Option<RenderConeScheduler>,
}

impl SubflowManager {
    /// Contexts compute member nodes from `registry`; each gets a private
    /// cache of `cache_capacity` entries.
    pub fn new(registry: Arc<NodeRegistry>, cache_capacity: usize) -> Self {
        Self {
            registry,
            cache_capacity,
            contexts: DashMap::new(),
            parent: None,
        }
    }

    /// Invalidate container nodes in `parent` whenever their subflow
    /// changes.
    pub fn with_parent(mut self, parent: RenderConeScheduler) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Create the context for `container`. Returns `false` if it already
    /// exists.
    pub fn create(&self, container: NodeId) -> bool {
        if self.contexts.contains_key(&container) {
            return false;
        }

        let cache = Arc::new(ContentCache::new(self.cache_capacity));
        let scheduler = RenderConeScheduler::new(Arc::clone(&self.registry), cache);
        self.contexts.insert(
            container,
            SubflowContext {
                container,
                scheduler,
                members: IndexSet::new(),
                active_output: None,
                bindings: IndexMap::new(),
            },
        );
        debug!(container = %container, "created subflow");
        true
    }

    /// Tear down a context: cancel in-flight work and drop its graph,
    /// dirty state and cache.
    pub fn remove(&self, container: NodeId) -> Result<(), EngineError> {
        let (_, context) = self
            .contexts
            .remove(&container)
            .ok_or(EngineError::UnknownSubflow(container))?;

        context.scheduler.set_render_target(None)?;
        context.scheduler.clear();
        context.scheduler.cache().clear();
        debug!(container = %container, members = context.members.len(), "removed subflow");
        self.changed(container);
        Ok(())
    }

    pub fn contains(&self, container: NodeId) -> bool {
        self.contexts.contains_key(&container)
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// The context's scheduler, for inspection.
    pub fn scheduler(&self, container: NodeId) -> Result<RenderConeScheduler, EngineError> {
        self.contexts
            .get(&container)
            .map(|context| context.scheduler.clone())
            .ok_or(EngineError::UnknownSubflow(container))
    }

    pub fn members(&self, container: NodeId) -> Result<Vec<NodeId>, EngineError> {
        self.contexts
            .get(&container)
            .map(|context| context.members().collect())
            .ok_or(EngineError::UnknownSubflow(container))
    }

    /// Add a member node of a registered type.
    pub fn add_member(
        &self,
        container: NodeId,
        type_tag: impl Into<TypeTag>,
    ) -> Result<NodeId, EngineError> {
        let member = self.scheduler(container)?.add_node(type_tag)?;
        if let Some(mut context) = self.contexts.get_mut(&container) {
            context.members.insert(member);
        }
        self.changed(container);
        Ok(member)
    }

    /// Remove a member. If it was the active output the subflow goes idle;
    /// bindings into it are dropped.
    pub fn remove_member(&self, container: NodeId, member: NodeId) -> Result<(), EngineError> {
        let scheduler = self.member_scheduler(container, &[member])?;
        scheduler.remove_node(member)?;

        if let Some(mut context) = self.contexts.get_mut(&container) {
            context.members.shift_remove(&member);
            context.bindings.retain(|_, binding| binding.member != member);
            if context.active_output == Some(member) {
                context.active_output = None;
            }
        }
        self.changed(container);
        Ok(())
    }

    /// Connect two members.
    pub fn connect(
        &self,
        container: NodeId,
        source: NodeId,
        target: NodeId,
        slot: &str,
    ) -> Result<(), EngineError> {
        self.member_scheduler(container, &[source, target])?
            .connect(source, target, slot)?;
        self.changed(container);
        Ok(())
    }

    pub fn set_param(
        &self,
        container: NodeId,
        member: NodeId,
        name: &str,
        value: impl Into<ParamValue>,
    ) -> Result<bool, EngineError> {
        let scheduled = self
            .member_scheduler(container, &[member])?
            .set_param(member, name, value)?;
        self.changed(container);
        Ok(scheduled)
    }

    /// Select the member whose value the container exposes, or `None` to
    /// idle the subflow.
    pub fn set_active_output(
        &self,
        container: NodeId,
        member: Option<NodeId>,
    ) -> Result<(), EngineError> {
        let (scheduler, previous) = {
            let mut context = self
                .contexts
                .get_mut(&container)
                .ok_or(EngineError::UnknownSubflow(container))?;
            if let Some(member) = member {
                context.ensure_member(member)?;
            }
            if context.active_output == member {
                return Ok(());
            }
            let previous = context.active_output;
            context.active_output = member;
            (context.scheduler.clone(), previous)
        };

        // No map guard may be held while the scheduler emits events.
        if let Err(err) = scheduler.set_render_target(member) {
            if let Some(mut context) = self.contexts.get_mut(&container) {
                context.active_output = previous;
            }
            return Err(err.into());
        }
        debug!(container = %container, active = ?member, "subflow active output changed");
        self.changed(container);
        Ok(())
    }

    pub fn active_output(&self, container: NodeId) -> Result<Option<NodeId>, EngineError> {
        self.contexts
            .get(&container)
            .map(|context| context.active_output)
            .ok_or(EngineError::UnknownSubflow(container))
    }

    /// Route the container's input `container_slot` into `member`'s input
    /// `slot`.
    pub fn bind_input(
        &self,
        container: NodeId,
        container_slot: impl Into<String>,
        member: NodeId,
        slot: impl Into<String>,
    ) -> Result<(), EngineError> {
        {
            let mut context = self
                .contexts
                .get_mut(&container)
                .ok_or(EngineError::UnknownSubflow(container))?;
            context.ensure_member(member)?;
            context.bindings.insert(
                container_slot.into(),
                InputBinding {
                    member,
                    slot: slot.into(),
                },
            );
        }
        self.changed(container);
        Ok(())
    }

    /// Deliver container input values to their bound member slots. Bound
    /// slots missing from `inputs` are cleared.
    pub fn feed_inputs(&self, container: NodeId, inputs: &ValueMap) -> Result<(), EngineError> {
        let (scheduler, bindings) = {
            let context = self
                .contexts
                .get(&container)
                .ok_or(EngineError::UnknownSubflow(container))?;
            (context.scheduler.clone(), context.bindings.clone())
        };

        for (container_slot, binding) in &bindings {
            match inputs.get(container_slot) {
                Some(value) => {
                    let unchanged = scheduler
                        .input(binding.member, &binding.slot)
                        .is_some_and(|current| current == *value);
                    if !unchanged {
                        scheduler.set_input(binding.member, &binding.slot, value.clone())?;
                    }
                }
                None => {
                    scheduler.clear_input(binding.member, &binding.slot)?;
                }
            }
        }
        Ok(())
    }

    /// The container's visible output: the active member's current
    /// outputs, or an empty map when there is no active output or it has
    /// not produced a value yet.
    pub fn boundary_output(&self, container: NodeId) -> Result<ValueMap, EngineError> {
        let context = self
            .contexts
            .get(&container)
            .ok_or(EngineError::UnknownSubflow(container))?;

        Ok(context
            .active_output
            .and_then(|member| context.scheduler.outputs(member))
            .map(|outputs| (*outputs).clone())
            .unwrap_or_default())
    }

    /// The context's scheduler, after checking that every node in `members`
    /// belongs to it. The map guard is released before returning.
    fn member_scheduler(
        &self,
        container: NodeId,
        members: &[NodeId],
    ) -> Result<RenderConeScheduler, EngineError> {
        let context = self
            .contexts
            .get(&container)
            .ok_or(EngineError::UnknownSubflow(container))?;
        for member in members {
            context.ensure_member(*member)?;
        }
        Ok(context.scheduler.clone())
    }

    /// Run the subflow's scheduler until its cone is up to date.
    pub async fn settle(&self, container: NodeId) -> Result<PassReport, EngineError> {
        let scheduler = self.scheduler(container)?;
        Ok(scheduler.settle().await)
    }

    /// Feed inputs, settle, and read the boundary output.
    pub async fn evaluate(
        &self,
        container: NodeId,
        inputs: &ValueMap,
    ) -> Result<ValueMap, EngineError> {
        self.feed_inputs(container, inputs)?;
        self.settle(container).await?;

        let active = self.active_output(container)?;
        if let Some(error) = active.and_then(|member| {
            self.scheduler(container)
                .ok()
                .and_then(|scheduler| scheduler.last_error(member))
        }) {
            return Err(error.into());
        }
        self.boundary_output(container)
    }

    /// A node type for the parent graph whose compute function evaluates
    /// the subflow of the node being computed.
    ///
    /// The manager must have a context for every container node of this
    /// type; computing one without a context fails with
    /// [`EngineError::UnknownSubflow`] surfaced as a compute error.
    pub fn container_node_type(self: &Arc<Self>, tag: impl Into<TypeTag>) -> NodeType {
        let manager: Weak<Self> = Arc::downgrade(self);
        NodeType::new(tag, move |_params, inputs, context| {
            let manager = manager.clone();
            async move {
                let manager = manager
                    .upgrade()
                    .ok_or_else(|| ComputeError::failed("subflow manager dropped"))?;
                manager
                    .evaluate(context.node_id, &inputs)
                    .await
                    .map_err(|err| match err {
                        EngineError::Compute(err) => err,
                        other => ComputeError::failed(other.to_string()),
                    })
            }
            .boxed()
        })
    }

    fn changed(&self, container: NodeId) {
        if let Some(parent) = &self.parent {
            if parent.contains(container) {
                parent.invalidate(container);
            }
        }
    }
}

impl std::fmt::Debug for SubflowManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubflowManager")
            .field("contexts", &self.contexts.len())
            .field("cache_capacity", &self.cache_capacity)
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}

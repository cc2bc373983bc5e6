//! Node Types
//!
//! A node type is the external collaborator that knows how to compute one
//! kind of node. The engine treats it as a black box with a fixed
//! signature:
//!
//! ```text
//! (params, inputs, context) -> outputs
//! ```
//!
//! The function may be synchronous ([`NodeType::sync`]) or asynchronous
//! ([`NodeType::new`] with a boxed future). It must not have side effects
//! beyond its return value and reads of the context.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::{self, BoxFuture, FutureExt};
use indexmap::IndexMap;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::{ComputeError, ParamError};
use crate::graph::{NodeId, TypeTag};
use crate::value::{ParamKind, ParamValue, Params, ValueMap};

/// Future returned by a compute function.
pub type ComputeFuture = BoxFuture<'static, Result<ValueMap, ComputeError>>;

/// Read-only context handed to a compute function.
#[derive(Debug, Clone)]
pub struct ComputeContext {
    pub node_id: NodeId,
    pub render_target: Option<NodeId>,
    /// Cancelled when a newer computation of the same node supersedes this
    /// one. Long-running functions may poll it and bail out early.
    pub cancellation: CancellationToken,
}

/// The compute function of a node type.
pub trait NodeCompute: Send + Sync {
    fn compute(&self, params: Params, inputs: ValueMap, context: ComputeContext) -> ComputeFuture;
}

impl<F> NodeCompute for F
where
    F: Fn(Params, ValueMap, ComputeContext) -> ComputeFuture + Send + Sync,
{
    fn compute(&self, params: Params, inputs: ValueMap, context: ComputeContext) -> ComputeFuture {
        self(params, inputs, context)
    }
}

/// How inputs are handed to the compute function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputPolicy {
    /// Inputs share their buffers with the upstream outputs. The node must
    /// not mutate them in place.
    #[default]
    Shared,
    /// Inputs are deep-cloned first, for nodes that mutate what they read.
    Isolated,
}

/// Declared kind and default of one parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub kind: ParamKind,
    pub default: ParamValue,
}

/// A registered node type.
#[derive(Clone)]
pub struct NodeType {
    tag: TypeTag,
    compute: Arc<dyn NodeCompute>,
    input_policy: InputPolicy,
    params: IndexMap<String, ParamSpec>,
}

impl NodeType {
    /// A node type with an asynchronous compute function.
    pub fn new<F>(tag: impl Into<TypeTag>, compute: F) -> Self
    where
        F: Fn(Params, ValueMap, ComputeContext) -> ComputeFuture + Send + Sync + 'static,
    {
        Self::from_compute(tag, Arc::new(compute))
    }

    /// A node type backed by any [`NodeCompute`] implementation.
    pub fn from_compute(tag: impl Into<TypeTag>, compute: Arc<dyn NodeCompute>) -> Self {
        Self {
            tag: tag.into(),
            compute,
            input_policy: InputPolicy::default(),
            params: IndexMap::new(),
        }
    }

    /// A node type with a synchronous compute function.
    pub fn sync<F>(tag: impl Into<TypeTag>, compute: F) -> Self
    where
        F: Fn(&Params, &ValueMap, &ComputeContext) -> Result<ValueMap, ComputeError>
            + Send
            + Sync
            + 'static,
    {
        Self::new(tag, move |params: Params, inputs: ValueMap, context: ComputeContext| {
            future::ready(compute(&params, &inputs, &context)).boxed()
        })
    }

    /// Declare a parameter; its kind is taken from the default.
    pub fn with_param(self, name: impl Into<String>, default: impl Into<ParamValue>) -> Self {
        let default = default.into();
        let kind = default.kind();
        self.with_param_kind(name, kind, default)
    }

    /// Declare a parameter whose kind is wider than its default (e.g. a
    /// number parameter defaulting to an integer).
    pub fn with_param_kind(
        mut self,
        name: impl Into<String>,
        kind: ParamKind,
        default: impl Into<ParamValue>,
    ) -> Self {
        self.params.insert(
            name.into(),
            ParamSpec {
                kind,
                default: default.into(),
            },
        );
        self
    }

    pub fn with_input_policy(mut self, policy: InputPolicy) -> Self {
        self.input_policy = policy;
        self
    }

    pub fn tag(&self) -> &TypeTag {
        &self.tag
    }

    pub fn input_policy(&self) -> InputPolicy {
        self.input_policy
    }

    pub fn param_specs(&self) -> &IndexMap<String, ParamSpec> {
        &self.params
    }

    /// Fresh parameter set with every declared default.
    pub fn default_params(&self) -> Params {
        self.params
            .iter()
            .map(|(name, spec)| (name.clone(), spec.default.clone()))
            .collect()
    }

    /// Check `value` against the schema entry for `name`.
    pub fn validate_param(&self, name: &str, value: &ParamValue) -> Result<(), ParamError> {
        let spec = self.params.get(name).ok_or_else(|| ParamError::UnknownParam {
            type_tag: self.tag.clone(),
            name: name.to_string(),
        })?;

        if spec.kind.accepts(value.kind()) {
            Ok(())
        } else {
            Err(ParamError::KindMismatch {
                name: name.to_string(),
                expected: spec.kind,
                found: value.kind(),
            })
        }
    }

    pub fn compute(&self, params: Params, inputs: ValueMap, context: ComputeContext) -> ComputeFuture {
        self.compute.compute(params, inputs, context)
    }
}

impl std::fmt::Debug for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeType")
            .field("tag", &self.tag)
            .field("input_policy", &self.input_policy)
            .field("params", &self.params.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Lookup table from type tag to node type.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    types: RwLock<HashMap<TypeTag, NodeType>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node type, returning the one it replaced.
    pub fn register(&self, node_type: NodeType) -> Option<NodeType> {
        self.types
            .write()
            .insert(node_type.tag().clone(), node_type)
    }

    pub fn get(&self, tag: &TypeTag) -> Option<NodeType> {
        self.types.read().get(tag).cloned()
    }

    pub fn contains(&self, tag: &TypeTag) -> bool {
        self.types.read().contains_key(tag)
    }

    pub fn tags(&self) -> Vec<TypeTag> {
        let mut tags: Vec<_> = self.types.read().keys().cloned().collect();
        tags.sort();
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn context() -> ComputeContext {
        ComputeContext {
            node_id: NodeId::from(1),
            render_target: None,
            cancellation: CancellationToken::new(),
        }
    }

    fn doubler() -> NodeType {
        NodeType::sync("double", |params, inputs, _| {
            let factor = params.get("factor").and_then(ParamValue::as_f64).unwrap_or(2.0);
            let value = inputs
                .get("in")
                .and_then(Value::as_number)
                .ok_or_else(|| ComputeError::MissingInput("in".into()))?;
            Ok(ValueMap::from([("out".to_string(), Value::Number(value * factor))]))
        })
        .with_param("factor", 2.0)
    }

    #[tokio::test]
    async fn sync_compute_runs() {
        let node_type = doubler();
        let inputs = ValueMap::from([("in".to_string(), Value::Number(4.0))]);

        let out = node_type
            .compute(node_type.default_params(), inputs, context())
            .await
            .unwrap();
        assert_eq!(out["out"], Value::Number(8.0));

        let err = node_type
            .compute(node_type.default_params(), ValueMap::new(), context())
            .await
            .unwrap_err();
        assert_eq!(err, ComputeError::MissingInput("in".into()));
    }

    #[tokio::test]
    async fn async_compute_runs() {
        let node_type = NodeType::new("const", |_, _, ctx| {
            async move {
                tokio::task::yield_now().await;
                Ok(ValueMap::from([(
                    "out".to_string(),
                    Value::Number(ctx.node_id.raw() as f64),
                )]))
            }
            .boxed()
        });

        let out = node_type
            .compute(Params::new(), ValueMap::new(), context())
            .await
            .unwrap();
        assert_eq!(out["out"], Value::Number(1.0));
    }

    #[test]
    fn param_validation() {
        let node_type = doubler().with_param_kind("count", ParamKind::Number, 3i64);

        assert!(node_type.validate_param("factor", &ParamValue::Number(3.0)).is_ok());
        assert!(node_type.validate_param("factor", &ParamValue::Integer(3)).is_ok());
        assert!(matches!(
            node_type.validate_param("factor", &"big".into()),
            Err(ParamError::KindMismatch { .. })
        ));
        assert!(matches!(
            node_type.validate_param("missing", &ParamValue::Bool(true)),
            Err(ParamError::UnknownParam { .. })
        ));
        assert_eq!(node_type.default_params().len(), 2);
    }

    #[test]
    fn registry_lookup() {
        let registry = NodeRegistry::new();
        assert!(registry.register(doubler()).is_none());
        assert!(registry.register(doubler()).is_some());

        assert!(registry.contains(&TypeTag::from("double")));
        assert!(registry.get(&TypeTag::from("nope")).is_none());
        assert_eq!(registry.tags(), vec![TypeTag::from("double")]);
    }
}

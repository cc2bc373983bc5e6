//! Value Containers
//!
//! Inputs and outputs of nodes are [`Value`]s: a closed set of typed
//! containers. Every container can report a content hash that depends only
//! on its semantic payload, never on where or when it was produced, so the
//! cache can recognise a node that was recomputed but produced the same
//! result.
//!
//! # Sharing
//!
//! Large payloads (geometry buffers) live behind `Arc`. Cloning a [`Value`]
//! shares the buffers; [`TypedValue::deep_clone`] produces a fully
//! independent copy for node types that declare they mutate their inputs.
//! Mutation through [`Geometry::positions_mut`] is copy-on-write, so a
//! shared buffer is never changed underneath another holder.

use std::sync::Arc;

use indexmap::IndexMap;

use super::hash::ContentHash;
use super::params::ParamValue;

/// Values keyed by slot name. Used for both the inputs handed to a compute
/// function and the outputs it returns.
pub type ValueMap = IndexMap<String, Value>;

/// Capability interface shared by every container.
pub trait TypedValue {
    /// Deterministic hash of the semantic payload.
    fn content_hash(&self) -> ContentHash;

    /// A copy that shares no buffers with `self`.
    fn deep_clone(&self) -> Self
    where
        Self: Sized;

    /// Whether the payload is well formed (finite numbers, indices in range,
    /// ...). Invalid outputs are rejected by the scheduler.
    fn is_valid(&self) -> bool;
}

/// Indexed triangle geometry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Geometry {
    positions: Arc<Vec<[f32; 3]>>,
    indices: Arc<Vec<u32>>,
}

impl Geometry {
    pub fn new(positions: Vec<[f32; 3]>, indices: Vec<u32>) -> Self {
        Self {
            positions: Arc::new(positions),
            indices: Arc::new(indices),
        }
    }

    pub fn positions(&self) -> &[[f32; 3]] {
        &self.positions
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Axis-aligned bounding box as `(min, max)`. `None` for empty geometry.
    pub fn bounds(&self) -> Option<([f32; 3], [f32; 3])> {
        let first = *self.positions.first()?;
        Some(self.positions.iter().fold((first, first), |(mut lo, mut hi), p| {
            for axis in 0..3 {
                lo[axis] = lo[axis].min(p[axis]);
                hi[axis] = hi[axis].max(p[axis]);
            }
            (lo, hi)
        }))
    }

    /// Mutable positions. Clones the buffer first if it is shared.
    pub fn positions_mut(&mut self) -> &mut Vec<[f32; 3]> {
        Arc::make_mut(&mut self.positions)
    }

    /// Mutable indices. Clones the buffer first if it is shared.
    pub fn indices_mut(&mut self) -> &mut Vec<u32> {
        Arc::make_mut(&mut self.indices)
    }

    /// Whether both geometries point at the same position buffer.
    pub fn shares_buffers_with(&self, other: &Geometry) -> bool {
        Arc::ptr_eq(&self.positions, &other.positions)
    }
}

impl TypedValue for Geometry {
    fn content_hash(&self) -> ContentHash {
        let mut hasher = ContentHash::builder("geometry");
        hasher
            .u64(self.vertex_count() as u64)
            .u64(self.triangle_count() as u64);

        if let Some((lo, hi)) = self.bounds() {
            for c in lo.iter().chain(hi.iter()) {
                hasher.f64(f64::from(*c));
            }
        }
        for p in self.positions.iter() {
            for c in p {
                hasher.f64(f64::from(*c));
            }
        }
        for i in self.indices.iter() {
            hasher.u64(u64::from(*i));
        }

        hasher.finish()
    }

    fn deep_clone(&self) -> Self {
        Self::new(self.positions.to_vec(), self.indices.to_vec())
    }

    fn is_valid(&self) -> bool {
        let vertex_count = self.vertex_count() as u64;
        self.indices.len() % 3 == 0
            && self.indices.iter().all(|&i| u64::from(i) < vertex_count)
            && self.positions.iter().flatten().all(|c| c.is_finite())
    }
}

/// A node input or output.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Geometry(Geometry),
    Number(f64),
    Vector([f64; 3]),
    /// Linear RGBA, each channel in `0.0..=1.0`.
    Color([f32; 4]),
    Text(String),
    Boolean(bool),
    /// Unstructured payload handed over by a collaborator. Hashed
    /// structurally.
    Raw(ParamValue),
}

impl Value {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Geometry(_) => "geometry",
            Value::Number(_) => "number",
            Value::Vector(_) => "vector",
            Value::Color(_) => "color",
            Value::Text(_) => "text",
            Value::Boolean(_) => "boolean",
            Value::Raw(_) => "raw",
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_geometry(&self) -> Option<&Geometry> {
        match self {
            Value::Geometry(g) => Some(g),
            _ => None,
        }
    }
}

impl TypedValue for Value {
    fn content_hash(&self) -> ContentHash {
        match self {
            Value::Geometry(g) => g.content_hash(),
            Value::Number(v) => ContentHash::builder("number").f64(*v).finish(),
            Value::Vector(v) => {
                let mut hasher = ContentHash::builder("vector");
                for c in v {
                    hasher.f64(*c);
                }
                hasher.finish()
            }
            Value::Color(v) => {
                let mut hasher = ContentHash::builder("color");
                for c in v {
                    hasher.f64(f64::from(*c));
                }
                hasher.finish()
            }
            Value::Text(v) => ContentHash::builder("text").str(v).finish(),
            Value::Boolean(v) => ContentHash::builder("boolean").u64(u64::from(*v)).finish(),
            Value::Raw(v) => v.structural_hash(),
        }
    }

    fn deep_clone(&self) -> Self {
        match self {
            Value::Geometry(g) => Value::Geometry(g.deep_clone()),
            other => other.clone(),
        }
    }

    fn is_valid(&self) -> bool {
        match self {
            Value::Geometry(g) => g.is_valid(),
            Value::Number(v) => v.is_finite(),
            Value::Vector(v) => v.iter().all(|c| c.is_finite()),
            Value::Color(v) => v.iter().all(|c| (0.0..=1.0).contains(c)),
            Value::Text(_) | Value::Boolean(_) | Value::Raw(_) => true,
        }
    }
}

impl From<Geometry> for Value {
    fn from(g: Geometry) -> Self {
        Value::Geometry(g)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> Geometry {
        Geometry::new(
            vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            vec![0, 1, 2],
        )
    }

    #[test]
    fn identical_payloads_hash_equal() {
        // Built independently, never shared.
        let a = Value::Geometry(triangle());
        let b = Value::Geometry(triangle());
        assert_eq!(a.content_hash(), b.content_hash());

        assert_eq!(Value::Number(2.0).content_hash(), Value::Number(2.0).content_hash());
    }

    #[test]
    fn different_payloads_hash_differently() {
        let mut moved = triangle();
        moved.positions_mut()[2] = [0.0, 2.0, 0.0];

        assert_ne!(triangle().content_hash(), moved.content_hash());
        assert_ne!(
            Value::Number(1.0).content_hash(),
            Value::Boolean(true).content_hash()
        );
    }

    #[test]
    fn bounds_cover_all_points() {
        let (lo, hi) = triangle().bounds().unwrap();
        assert_eq!(lo, [0.0, 0.0, 0.0]);
        assert_eq!(hi, [1.0, 1.0, 0.0]);
        assert!(Geometry::default().bounds().is_none());
    }

    #[test]
    fn clone_shares_and_deep_clone_detaches() {
        let original = triangle();
        let shared = original.clone();
        let detached = original.deep_clone();

        assert!(shared.shares_buffers_with(&original));
        assert!(!detached.shares_buffers_with(&original));
        assert_eq!(detached, original);
    }

    #[test]
    fn mutation_is_copy_on_write() {
        let original = triangle();
        let mut copy = original.clone();

        copy.positions_mut().push([5.0, 5.0, 5.0]);

        assert_eq!(original.vertex_count(), 3);
        assert_eq!(copy.vertex_count(), 4);
        assert!(!copy.shares_buffers_with(&original));
    }

    #[test]
    fn validity_checks() {
        assert!(triangle().is_valid());
        assert!(!Geometry::new(vec![[0.0; 3]], vec![0, 1, 2]).is_valid());
        assert!(!Geometry::new(vec![[f32::NAN, 0.0, 0.0]], vec![]).is_valid());
        assert!(!Value::Number(f64::INFINITY).is_valid());
        assert!(!Value::Color([1.5, 0.0, 0.0, 1.0]).is_valid());
        assert!(Value::Color([1.0, 0.5, 0.0, 1.0]).is_valid());
    }

    #[test]
    fn raw_values_hash_structurally() {
        let a = Value::Raw(ParamValue::List(vec![1i64.into(), "x".into()]));
        let b = Value::Raw(ParamValue::List(vec![1i64.into(), "x".into()]));
        assert_eq!(a.content_hash(), b.content_hash());
    }
}

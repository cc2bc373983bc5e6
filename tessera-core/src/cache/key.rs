//! Cache Keys
//!
//! A cache key is derived from everything that can influence a node's
//! output:
//!
//! - the node id (two nodes with identical settings still cache separately,
//!   so invalidating one never touches the other)
//! - its parameters, normalised so key order is irrelevant
//! - the content hash of every input value
//! - external resources (asset fingerprints and similar)
//! - a per-node logical version that [`invalidate`] bumps, so identical
//!   future inputs still miss after an explicit invalidation
//!
//! [`invalidate`]: super::ContentCache::invalidate

use std::collections::BTreeSet;

use indexmap::IndexMap;

use crate::graph::NodeId;
use crate::value::{hash_params, ContentHash, Params, TypedValue, ValueMap};

/// Everything needed to look up or store one node result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    /// Combined hash; the cache is keyed by this.
    pub validity_hash: ContentHash,

    /// Content hash of each input at key time, by slot. Re-checked on every
    /// hit.
    pub input_hashes: IndexMap<String, ContentHash>,

    /// Nodes whose change must evict entries stored under this key: the node
    /// itself plus the upstream sources of its connected inputs.
    pub depends_on: BTreeSet<NodeId>,
}

/// Borrowed description of a node's current state, as handed to
/// [`ContentCache::compute_key`](super::ContentCache::compute_key).
#[derive(Debug, Clone, Copy)]
pub struct KeyMaterial<'a> {
    pub node_id: NodeId,
    pub params: &'a Params,
    pub inputs: &'a ValueMap,
    /// Which node feeds each connected input slot.
    pub sources: &'a IndexMap<String, NodeId>,
    pub resources: &'a Params,
}

pub(crate) fn build_key(material: KeyMaterial<'_>, version: u64) -> CacheKey {
    let mut input_hashes: IndexMap<String, ContentHash> = material
        .inputs
        .iter()
        .map(|(slot, value)| (slot.clone(), value.content_hash()))
        .collect();
    input_hashes.sort_keys();

    let mut hasher = ContentHash::builder("cache-key");
    hasher
        .u64(material.node_id.raw())
        .u64(version)
        .hash(hash_params(material.params))
        .hash(hash_params(material.resources))
        .u64(input_hashes.len() as u64);
    for (slot, hash) in &input_hashes {
        hasher.str(slot).hash(*hash);
    }

    let mut depends_on = BTreeSet::new();
    depends_on.insert(material.node_id);
    depends_on.extend(material.sources.values().copied());

    CacheKey {
        validity_hash: hasher.finish(),
        input_hashes,
        depends_on,
    }
}

//! Content-Addressed Cache
//!
//! Node results are stored under a validity hash derived from the node's
//! id, parameters, input content hashes, resources and logical version. A
//! recomputation that would see exactly the same material is answered from
//! the cache instead of calling the node's compute function.
//!
//! See [`key`] for what goes into a key and [`ContentCache`] for lookup,
//! invalidation and eviction rules.

pub mod key;
mod store;

pub use key::{CacheKey, KeyMaterial};
pub use store::{CacheEntry, CacheStats, ContentCache};

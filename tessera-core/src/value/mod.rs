//! Values and Parameters
//!
//! Two kinds of data flow through the engine:
//!
//! - **Parameters** ([`ParamValue`]) are set by the user on a node and
//!   validated against the node type's schema.
//! - **Values** ([`Value`]) are what compute functions consume and produce.
//!   They travel along edges from outputs to inputs.
//!
//! Both can be reduced to a [`ContentHash`] that depends only on their
//! payload. The cache builds its keys from these hashes.

mod container;
mod hash;
mod params;

pub use container::{Geometry, TypedValue, Value, ValueMap};
pub use hash::{ContentHash, ContentHasher};
pub use params::{hash_params, ParamKind, ParamValue, Params};

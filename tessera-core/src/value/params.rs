//! Node Parameters
//!
//! Parameters are the user-editable settings of a node (radius, segment
//! count, light color, ...). They are a closed, serde-serialisable tagged
//! union so that each node type can validate them against a schema and so
//! the cache can hash them canonically.
//!
//! # Canonical form
//!
//! Two parameter sets that differ only in map key order, or in the sign of a
//! zero, describe the same node state. [`ParamValue::normalized`] rewrites a
//! value into its canonical form (maps sorted by key, recursively; `-0.0`
//! folded into `0.0`) and [`ParamValue::structural_hash`] hashes the
//! MessagePack encoding of that canonical form.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::hash::{canonical_f64, ContentHash};

/// Named parameters of a node, in declaration order.
pub type Params = IndexMap<String, ParamValue>;

/// A single parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum ParamValue {
    Bool(bool),
    Integer(i64),
    Number(f64),
    Text(String),
    Vector([f64; 3]),
    Color([f32; 4]),
    List(Vec<ParamValue>),
    Map(IndexMap<String, ParamValue>),
}

/// The kind of a [`ParamValue`], used by parameter schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Bool,
    Integer,
    Number,
    Text,
    Vector,
    Color,
    List,
    Map,
}

impl ParamKind {
    /// Whether a value of kind `found` may be stored in a slot of this kind.
    /// Integers widen into numbers; nothing else converts.
    pub fn accepts(self, found: ParamKind) -> bool {
        self == found || (self == ParamKind::Number && found == ParamKind::Integer)
    }
}

impl ParamValue {
    pub fn kind(&self) -> ParamKind {
        match self {
            ParamValue::Bool(_) => ParamKind::Bool,
            ParamValue::Integer(_) => ParamKind::Integer,
            ParamValue::Number(_) => ParamKind::Number,
            ParamValue::Text(_) => ParamKind::Text,
            ParamValue::Vector(_) => ParamKind::Vector,
            ParamValue::Color(_) => ParamKind::Color,
            ParamValue::List(_) => ParamKind::List,
            ParamValue::Map(_) => ParamKind::Map,
        }
    }

    /// Numeric view of integers and numbers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Integer(v) => Some(*v as f64),
            ParamValue::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Canonical copy: maps sorted by key (recursively), signed zeros folded.
    pub fn normalized(&self) -> ParamValue {
        match self {
            ParamValue::Number(v) => ParamValue::Number(canonical_f64(*v)),
            ParamValue::Vector(v) => ParamValue::Vector(v.map(canonical_f64)),
            ParamValue::Color(v) => {
                ParamValue::Color(v.map(|c| if c == 0.0 { 0.0 } else { c }))
            }
            ParamValue::List(items) => {
                ParamValue::List(items.iter().map(ParamValue::normalized).collect())
            }
            ParamValue::Map(map) => ParamValue::Map(normalize_map(map)),
            other => other.clone(),
        }
    }

    /// Hash of the canonical form. Independent of map key order.
    pub fn structural_hash(&self) -> ContentHash {
        encode_hash("param", &self.normalized())
    }

    /// Whether replacing `self` with `other` is a change worth recomputing
    /// for. Numeric components closer than `epsilon` count as unchanged.
    pub fn differs_significantly(&self, other: &ParamValue, epsilon: f64) -> bool {
        if let (Some(a), Some(b)) = (self.as_f64(), other.as_f64()) {
            return numbers_differ(a, b, epsilon);
        }

        match (self, other) {
            (ParamValue::Vector(a), ParamValue::Vector(b)) => a
                .iter()
                .zip(b)
                .any(|(x, y)| numbers_differ(*x, *y, epsilon)),
            (ParamValue::Color(a), ParamValue::Color(b)) => a
                .iter()
                .zip(b)
                .any(|(x, y)| numbers_differ(f64::from(*x), f64::from(*y), epsilon)),
            (ParamValue::List(a), ParamValue::List(b)) => {
                a.len() != b.len()
                    || a.iter()
                        .zip(b)
                        .any(|(x, y)| x.differs_significantly(y, epsilon))
            }
            (ParamValue::Map(a), ParamValue::Map(b)) => {
                a.len() != b.len()
                    || a.iter().any(|(key, x)| match b.get(key) {
                        Some(y) => x.differs_significantly(y, epsilon),
                        None => true,
                    })
            }
            (a, b) => a != b,
        }
    }
}

/// NaN only equals NaN; a move to or from NaN is always significant.
fn numbers_differ(a: f64, b: f64, epsilon: f64) -> bool {
    if a == b {
        return false;
    }
    if a.is_nan() || b.is_nan() {
        return !(a.is_nan() && b.is_nan());
    }
    !((a - b).abs() < epsilon)
}

fn normalize_map(map: &IndexMap<String, ParamValue>) -> IndexMap<String, ParamValue> {
    let mut sorted: IndexMap<String, ParamValue> = map
        .iter()
        .map(|(key, value)| (key.clone(), value.normalized()))
        .collect();
    sorted.sort_keys();
    sorted
}

/// Hash of a whole parameter set, independent of key order.
pub fn hash_params(params: &Params) -> ContentHash {
    encode_hash("params", &normalize_map(params))
}

fn encode_hash<T: Serialize>(domain: &str, value: &T) -> ContentHash {
    // Plain data of these shapes always encodes.
    let bytes = rmp_serde::to_vec(value).expect("parameter values encode to msgpack");
    ContentHash::builder(domain).bytes(&bytes).finish()
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Integer(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Number(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}

impl From<[f64; 3]> for ParamValue {
    fn from(v: [f64; 3]) -> Self {
        ParamValue::Vector(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, ParamValue)]) -> IndexMap<String, ParamValue> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn key_order_does_not_affect_hash() {
        let a = map(&[("radius", 1.0.into()), ("segments", 16i64.into())]);
        let b = map(&[("segments", 16i64.into()), ("radius", 1.0.into())]);

        assert_eq!(hash_params(&a), hash_params(&b));
    }

    #[test]
    fn nested_key_order_does_not_affect_hash() {
        let a = ParamValue::Map(map(&[
            ("x", ParamValue::Map(map(&[("p", 1i64.into()), ("q", 2i64.into())]))),
            ("y", true.into()),
        ]));
        let b = ParamValue::Map(map(&[
            ("y", true.into()),
            ("x", ParamValue::Map(map(&[("q", 2i64.into()), ("p", 1i64.into())]))),
        ]));

        assert_eq!(a.structural_hash(), b.structural_hash());
    }

    #[test]
    fn value_changes_change_hash() {
        let a = map(&[("radius", 1.0.into())]);
        let b = map(&[("radius", 1.5.into())]);
        assert_ne!(hash_params(&a), hash_params(&b));
    }

    #[test]
    fn integer_and_number_hash_differently() {
        assert_ne!(
            ParamValue::Integer(1).structural_hash(),
            ParamValue::Number(1.0).structural_hash()
        );
    }

    #[test]
    fn numeric_significance_uses_epsilon() {
        let a = ParamValue::Number(1.0);
        assert!(!a.differs_significantly(&ParamValue::Number(1.0 + 1e-9), 1e-6));
        assert!(a.differs_significantly(&ParamValue::Number(1.1), 1e-6));
        assert!(!a.differs_significantly(&ParamValue::Integer(1), 1e-6));
    }

    #[test]
    fn nan_transitions_are_significant() {
        let one = ParamValue::Number(1.0);
        let nan = ParamValue::Number(f64::NAN);
        assert!(one.differs_significantly(&nan, 1e-6));
        assert!(nan.differs_significantly(&one, 1e-6));
        assert!(!nan.differs_significantly(&ParamValue::Number(f64::NAN), 1e-6));
        assert!(ParamValue::Vector([0.0, 1.0, 2.0])
            .differs_significantly(&ParamValue::Vector([0.0, f64::NAN, 2.0]), 1e-6));
        assert!(!ParamValue::Number(f64::INFINITY)
            .differs_significantly(&ParamValue::Number(f64::INFINITY), 1e-6));
    }

    #[test]
    fn structural_significance() {
        let a = ParamValue::Vector([0.0, 1.0, 2.0]);
        assert!(!a.differs_significantly(&ParamValue::Vector([0.0, 1.0, 2.0]), 1e-6));
        assert!(a.differs_significantly(&ParamValue::Vector([0.0, 1.0, 2.5]), 1e-6));
        assert!(ParamValue::from("a").differs_significantly(&"b".into(), 1e-6));
        assert!(ParamValue::Bool(true).differs_significantly(&ParamValue::Integer(1), 1e-6));
    }

    #[test]
    fn number_kind_accepts_integers() {
        assert!(ParamKind::Number.accepts(ParamKind::Integer));
        assert!(!ParamKind::Integer.accepts(ParamKind::Number));
        assert!(ParamKind::Text.accepts(ParamKind::Text));
    }

    #[test]
    fn params_roundtrip_through_json() {
        let value = ParamValue::Map(map(&[("radius", 2.5.into()), ("label", "ball".into())]));
        let json = serde_json::to_string(&value).unwrap();
        let back: ParamValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }
}

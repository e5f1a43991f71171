//! Value types for tide documents
//!
//! This module defines:
//! - Value: unified enum for all document field types
//! - Collation: total order over values, used for index keys
//!
//! ## Value Model
//!
//! The Value enum has exactly 6 variants: Null, Bool, Number, String,
//! Array, Object. Numbers are IEEE-754 doubles; integers written through
//! the `From<i64>` impl are stored as doubles, matching the document
//! model this layer indexes.
//!
//! ## Collation Order
//!
//! Index keys are compared with the store's collation order:
//!
//! ```text
//! Null < Bool < Number < String < Array < Object
//! ```
//!
//! Within a type: `false < true`, numbers by `total_cmp`, strings by
//! byte order, arrays element-wise, objects by sorted entries.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Canonical document field value
///
/// Objects use `BTreeMap` so that serialized forms are deterministic;
/// the index descriptor id is a content hash over serialized values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Null value
    Null,
    /// Boolean value
    Bool(bool),
    /// 64-bit floating point (IEEE-754)
    Number(f64),
    /// UTF-8 string
    String(String),
    /// Array of values
    Array(Vec<Value>),
    /// Object with string keys
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Get the type name as a string (used in validation errors)
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    /// Check if this is a null value
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Borrow as string, if this is a String
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Extract a number, if this is a Number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Extract a bool, if this is a Bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// True for the values the sort-key generator treats as "empty":
    /// null and the empty string
    pub fn is_empty_for_sorting(&self) -> bool {
        match self {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            _ => false,
        }
    }

    /// Collation rank of the type, the primary sort criterion
    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    /// Compare two values in collation order
    ///
    /// This is a total order (unlike `PartialOrd` on `f64`): NaN sorts
    /// after all other numbers via `total_cmp`.
    pub fn collate(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => a.total_cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.collate(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Object(a), Value::Object(b)) => {
                for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                    let ord = ka.cmp(kb).then_with(|| va.collate(vb));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_type_order() {
        let ordered = [
            Value::Null,
            Value::Bool(false),
            Value::Number(1.0),
            Value::String("a".into()),
            Value::Array(vec![]),
            Value::Object(BTreeMap::new()),
        ];
        for pair in ordered.windows(2) {
            assert_eq!(pair[0].collate(&pair[1]), Ordering::Less);
        }
    }

    #[test]
    fn test_bool_and_number_order() {
        assert_eq!(
            Value::Bool(false).collate(&Value::Bool(true)),
            Ordering::Less
        );
        assert_eq!(
            Value::Number(1.0).collate(&Value::Number(2.0)),
            Ordering::Less
        );
        assert_eq!(
            Value::Number(2.0).collate(&Value::Number(2.0)),
            Ordering::Equal
        );
    }

    #[test]
    fn test_string_order_is_case_sensitive() {
        // Case folding happens in the sort-key generator, not here.
        assert_eq!(
            Value::String("CCC".into()).collate(&Value::String("bbb".into())),
            Ordering::Less
        );
    }

    #[test]
    fn test_array_order() {
        let a = Value::Array(vec![Value::Number(1.0)]);
        let b = Value::Array(vec![Value::Number(1.0), Value::Null]);
        assert_eq!(a.collate(&b), Ordering::Less);
    }

    #[test]
    fn test_empty_for_sorting() {
        assert!(Value::Null.is_empty_for_sorting());
        assert!(Value::String(String::new()).is_empty_for_sorting());
        assert!(!Value::String("x".into()).is_empty_for_sorting());
        assert!(!Value::Number(0.0).is_empty_for_sorting());
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<f64>().prop_map(Value::Number),
            "[a-z]{0,8}".prop_map(Value::String),
        ]
    }

    proptest! {
        #[test]
        fn prop_collate_is_total_and_antisymmetric(a in arb_value(), b in arb_value()) {
            let ab = a.collate(&b);
            let ba = b.collate(&a);
            prop_assert_eq!(ab, ba.reverse());
            prop_assert_eq!(a.collate(&a), Ordering::Equal);
        }
    }
}

//! Primary key values.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The primary key of one row: one value per key column, in declaration order.
///
/// Hashing and equality are structural over `Value`, so a key read back as
/// `Int(5)` matches a key built from `BigInt(5)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrimaryKey(pub Vec<Value>);

impl PrimaryKey {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// A key over a single column.
    pub fn single(value: impl Into<Value>) -> Self {
        Self(vec![value.into()])
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// A key is complete when no component is NULL.
    pub fn is_complete(&self) -> bool {
        !self.0.is_empty() && self.0.iter().all(|v| !v.is_null())
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{value}")?;
        }
        f.write_str(")")
    }
}

impl From<i32> for PrimaryKey {
    fn from(v: i32) -> Self {
        Self::single(v)
    }
}

impl From<i64> for PrimaryKey {
    fn from(v: i64) -> Self {
        Self::single(v)
    }
}

impl From<&str> for PrimaryKey {
    fn from(v: &str) -> Self {
        Self::single(v)
    }
}

impl From<Vec<Value>> for PrimaryKey {
    fn from(v: Vec<Value>) -> Self {
        Self(v)
    }
}

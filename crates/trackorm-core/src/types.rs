//! Declared column types.

use crate::value::Value;

/// The SQL type a column is declared with.
///
/// Stores with few storage classes hand some values back in a different
/// representation than they were written in: SQLite returns booleans as
/// integers and decimals or JSON as text. A field that declares its type
/// gets those values converted back on read, so a reloaded record holds
/// the same variants the entity wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlType {
    Integer,
    BigInt,
    Double,
    Decimal,
    Boolean,
    Text,
    Blob,
    Json,
}

impl SqlType {
    pub const fn sql_name(self) -> &'static str {
        match self {
            SqlType::Integer => "INTEGER",
            SqlType::BigInt => "BIGINT",
            SqlType::Double => "DOUBLE PRECISION",
            SqlType::Decimal => "DECIMAL",
            SqlType::Boolean => "BOOLEAN",
            SqlType::Text => "TEXT",
            SqlType::Blob => "BLOB",
            SqlType::Json => "JSON",
        }
    }

    /// Convert a value to this type's variant.
    ///
    /// NULL, values already of the right variant and values that do not
    /// convert (text that is not JSON, say) are returned unchanged.
    pub fn coerce(self, value: Value) -> Value {
        match (self, value) {
            (SqlType::Boolean, Value::Int(v)) => Value::Bool(v != 0),
            (SqlType::Boolean, Value::BigInt(v)) => Value::Bool(v != 0),
            (SqlType::BigInt, Value::Int(v)) => Value::BigInt(i64::from(v)),
            (SqlType::Double, Value::Int(v)) => Value::Double(f64::from(v)),
            (SqlType::Double, Value::BigInt(v)) => Value::Double(v as f64),
            (SqlType::Decimal, Value::Text(s)) => Value::Decimal(s),
            (SqlType::Decimal, Value::Int(v)) => Value::Decimal(v.to_string()),
            (SqlType::Decimal, Value::BigInt(v)) => Value::Decimal(v.to_string()),
            (SqlType::Decimal, Value::Double(v)) => Value::Decimal(v.to_string()),
            (SqlType::Text, Value::Decimal(s)) => Value::Text(s),
            (SqlType::Blob, Value::Text(s)) => Value::Bytes(s.into_bytes()),
            (SqlType::Json, Value::Text(s)) => match serde_json::from_str(&s) {
                Ok(json) => Value::Json(json),
                Err(_) => Value::Text(s),
            },
            (_, value) => value,
        }
    }
}

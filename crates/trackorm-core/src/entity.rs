//! Entity mapping: the `Entity` trait, column metadata and field value sets.

use crate::error::{Error, Result, TypeError, ValidationError, ValidationErrorKind};
use crate::key::PrimaryKey;
use crate::relationship::NavigationInfo;
use crate::row::{FromValue, Row};
use crate::types::SqlType;
use crate::value::Value;
use serde::ser::{Serialize, SerializeMap, Serializer};

/// Metadata about one column of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldInfo {
    /// Column name
    pub name: &'static str,
    pub primary_key: bool,
    /// Value is assigned by the store on insert (auto-increment key)
    pub store_generated: bool,
    pub nullable: bool,
    /// Foreign key reference (`table.column`)
    pub foreign_key: Option<&'static str>,
    /// Declared type; stored values are converted to it on read
    pub sql_type: Option<SqlType>,
}

impl FieldInfo {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            primary_key: false,
            store_generated: false,
            nullable: false,
            foreign_key: None,
            sql_type: None,
        }
    }

    pub const fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub const fn store_generated(mut self) -> Self {
        self.store_generated = true;
        self
    }

    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub const fn foreign_key(mut self, reference: &'static str) -> Self {
        self.foreign_key = Some(reference);
        self
    }

    pub const fn sql_type(mut self, sql_type: SqlType) -> Self {
        self.sql_type = Some(sql_type);
        self
    }

    /// Convert `value` to the declared type, if any.
    pub fn coerce(&self, value: Value) -> Value {
        match self.sql_type {
            Some(sql_type) => sql_type.coerce(value),
            None => value,
        }
    }

    /// A non-nullable foreign key must be set (or linked) before insert.
    pub const fn is_required_reference(&self) -> bool {
        self.foreign_key.is_some() && !self.nullable
    }

    /// Split the foreign key reference into `(table, column)`.
    pub fn references(&self) -> Option<(&'static str, &'static str)> {
        self.foreign_key.and_then(|r| r.split_once('.'))
    }
}

/// An ordered set of column values for one record.
///
/// Field order follows the entity's `fields()` declaration. Names are the
/// static column names of the entity, so values can be moved between
/// snapshots without allocation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldValues {
    values: Vec<(&'static str, Value)>,
}

impl FieldValues {
    pub fn new() -> Self {
        Self { values: Vec::new() }
    }

    /// Builder form of `set`.
    pub fn with(mut self, name: &'static str, value: impl Into<Value>) -> Self {
        self.set(name, value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    /// Get a typed value by column name.
    pub fn get_as<T: FromValue>(&self, name: &str) -> Result<T> {
        let value = self.get(name).ok_or_else(|| {
            Error::Type(TypeError {
                expected: std::any::type_name::<T>(),
                actual: format!("field '{}' not present", name),
                column: Some(name.to_string()),
            })
        })?;
        T::from_value(value).map_err(|e| match e {
            Error::Type(mut te) => {
                te.column = Some(name.to_string());
                Error::Type(te)
            }
            e => e,
        })
    }

    /// Set a value, returning the previous one.
    pub fn set(&mut self, name: &'static str, value: Value) -> Option<Value> {
        match self.values.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.values.push((name, value));
                None
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.iter().any(|(n, _)| *n == name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Value)> {
        self.values.iter().map(|(n, v)| (*n, v))
    }

    /// The key formed by `columns`, or `None` when any component is missing.
    pub fn key(&self, columns: &[&str]) -> Option<PrimaryKey> {
        columns
            .iter()
            .map(|c| self.get(c).cloned())
            .collect::<Option<Vec<_>>>()
            .map(PrimaryKey::new)
    }

    /// Read the declared `fields` out of a result row.
    ///
    /// With a `prefix`, columns are looked up under their join alias
    /// (`t1__name`). Missing columns are an error; NULLs are kept. Values are
    /// converted to each field's declared type.
    pub fn from_row(fields: &[FieldInfo], row: &Row, prefix: Option<&str>) -> Result<Self> {
        let mut values = Vec::with_capacity(fields.len());
        for field in fields {
            let value = match prefix {
                Some(p) => row.get_prefixed(p, field.name),
                None => row.get_by_name(field.name),
            };
            let value = value.ok_or_else(|| {
                Error::Type(TypeError {
                    expected: "column",
                    actual: "missing from result row".to_string(),
                    column: Some(field.name.to_string()),
                })
            })?;
            values.push((field.name, field.coerce(value.clone())));
        }
        Ok(Self { values })
    }

    /// Reorder to declaration order, filling absent fields with NULL and
    /// converting values to each field's declared type.
    ///
    /// A value for an undeclared field is a validation error.
    pub fn conform(mut self, table: &str, fields: &[FieldInfo]) -> Result<Self> {
        if let Some((name, _)) = self
            .values
            .iter()
            .find(|(n, _)| !fields.iter().any(|f| f.name == *n))
        {
            return Err(Error::Validation(
                ValidationError::new(
                    ValidationErrorKind::UnknownField,
                    table,
                    "field is not declared on the entity",
                )
                .with_field(*name),
            ));
        }
        let mut ordered = Vec::with_capacity(fields.len());
        for field in fields {
            let value = self
                .values
                .iter_mut()
                .find(|(n, _)| *n == field.name)
                .map_or(Value::Null, |(_, v)| std::mem::replace(v, Value::Null));
            ordered.push((field.name, field.coerce(value)));
        }
        self.values = ordered;
        Ok(self)
    }

    /// Dump as a JSON object, for logs and debugging.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl Serialize for FieldValues {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (name, value) in &self.values {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'a> IntoIterator for &'a FieldValues {
    type Item = &'a (&'static str, Value);
    type IntoIter = std::slice::Iter<'a, (&'static str, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}

/// A typed record mapped to a table row.
///
/// The entity type is identified by its `TABLE_NAME`, which need not match
/// the Rust type name.
pub trait Entity: Sized + Send + Sync + 'static {
    const TABLE_NAME: &'static str;

    /// Primary key columns, in order.
    const PRIMARY_KEY: &'static [&'static str];

    fn fields() -> &'static [FieldInfo];

    fn navigations() -> &'static [NavigationInfo] {
        &[]
    }

    fn to_values(&self) -> FieldValues;

    fn from_values(values: &FieldValues) -> Result<Self>;
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIELDS: &[FieldInfo] = &[
        FieldInfo::new("invoice_id").primary_key().store_generated(),
        FieldInfo::new("customer_id").foreign_key("customer.customer_id"),
        FieldInfo::new("note").nullable(),
    ];

    #[test]
    fn test_field_builders() {
        assert!(FIELDS[0].primary_key && FIELDS[0].store_generated);
        assert!(FIELDS[1].is_required_reference());
        assert_eq!(FIELDS[1].references(), Some(("customer", "customer_id")));
        assert!(!FIELDS[2].is_required_reference());
    }

    #[test]
    fn test_set_returns_previous() {
        let mut values = FieldValues::new().with("note", "a");
        assert_eq!(values.set("note", Value::from("b")), Some(Value::from("a")));
        assert_eq!(values.set("customer_id", Value::BigInt(1)), None);
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn test_from_row_with_prefix() {
        let row = Row::new(
            vec![
                "t1__invoice_id".to_string(),
                "t1__customer_id".to_string(),
                "t1__note".to_string(),
            ],
            vec![Value::Int(4), Value::Int(9), Value::Null],
        );
        let values = FieldValues::from_row(FIELDS, &row, Some("t1")).unwrap();
        assert_eq!(values.key(&["invoice_id"]), Some(PrimaryKey::from(4)));
        assert_eq!(values.get_as::<Option<String>>("note").unwrap(), None);
    }

    #[test]
    fn test_from_row_applies_declared_types() {
        const FLAGS: &[FieldInfo] = &[
            FieldInfo::new("promotion_id").primary_key(),
            FieldInfo::new("active").sql_type(SqlType::Boolean),
            FieldInfo::new("discount").sql_type(SqlType::Decimal),
        ];
        let row = Row::new(
            vec!["promotion_id".to_string(), "active".to_string(), "discount".to_string()],
            vec![Value::Int(1), Value::Int(1), Value::Text("10.25".to_string())],
        );
        let values = FieldValues::from_row(FLAGS, &row, None).unwrap();
        assert!(matches!(values.get("active"), Some(Value::Bool(true))));
        assert!(matches!(values.get("discount"), Some(Value::Decimal(d)) if d == "10.25"));
        assert!(matches!(values.get("promotion_id"), Some(Value::Int(1))));
    }

    #[test]
    fn test_from_row_missing_column() {
        let row = Row::new(vec!["invoice_id".to_string()], vec![Value::Int(4)]);
        assert!(FieldValues::from_row(FIELDS, &row, None).is_err());
    }

    #[test]
    fn test_conform_orders_and_fills() {
        let values = FieldValues::new()
            .with("note", "x")
            .with("customer_id", 2_i64)
            .conform("invoice", FIELDS)
            .unwrap();
        let names: Vec<_> = values.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["invoice_id", "customer_id", "note"]);
        assert_eq!(values.get("invoice_id"), Some(&Value::Null));
    }

    #[test]
    fn test_conform_rejects_unknown() {
        let err = FieldValues::new()
            .with("nickname", "x")
            .conform("invoice", FIELDS)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(v) if v.kind == ValidationErrorKind::UnknownField));
    }

    #[test]
    fn test_json_dump() {
        let values = FieldValues::new().with("note", "x").with("customer_id", 2_i64);
        let json = values.to_json();
        assert_eq!(json["note"]["Text"], "x");
    }
}

//! Shared fixtures for the unit tests of this crate.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use trackorm_core::{
    EntityMeta, EntityRegistry, Error, FieldInfo, FieldValues, NavigationInfo, QueryError,
    QueryErrorKind, Result, Row, StoreDriver, Value,
};

const CUSTOMER_FIELDS: &[FieldInfo] = &[
    FieldInfo::new("customer_id").primary_key().store_generated(),
    FieldInfo::new("legal_name"),
    FieldInfo::new("gstin").nullable(),
];

const CUSTOMER_NAVS: &[NavigationInfo] = &[NavigationInfo::one_to_many(
    "invoices",
    "invoice",
    &["customer_id"],
    &["customer_id"],
)];

const INVOICE_FIELDS: &[FieldInfo] = &[
    FieldInfo::new("invoice_id").primary_key().store_generated(),
    FieldInfo::new("customer_id").foreign_key("customer.customer_id"),
    FieldInfo::new("total"),
];

const INVOICE_NAVS: &[NavigationInfo] = &[NavigationInfo::many_to_one(
    "customer",
    "customer",
    &["customer_id"],
    &["customer_id"],
)];

const LINE_ITEM_FIELDS: &[FieldInfo] = &[
    FieldInfo::new("invoice_id").primary_key().foreign_key("invoice.invoice_id"),
    FieldInfo::new("line_no").primary_key(),
    FieldInfo::new("product_id"),
    FieldInfo::new("quantity"),
];

const LINE_NOTE_FIELDS: &[FieldInfo] = &[
    FieldInfo::new("note_id").primary_key().store_generated(),
    FieldInfo::new("invoice_id").foreign_key("line_item.invoice_id"),
    FieldInfo::new("line_no").foreign_key("line_item.line_no"),
    FieldInfo::new("body"),
];

pub fn customer_meta() -> EntityMeta {
    EntityMeta {
        table: "customer",
        primary_key: &["customer_id"],
        fields: CUSTOMER_FIELDS,
        navigations: CUSTOMER_NAVS,
    }
}

pub fn invoice_meta() -> EntityMeta {
    EntityMeta {
        table: "invoice",
        primary_key: &["invoice_id"],
        fields: INVOICE_FIELDS,
        navigations: INVOICE_NAVS,
    }
}

pub fn line_item_meta() -> EntityMeta {
    EntityMeta {
        table: "line_item",
        primary_key: &["invoice_id", "line_no"],
        fields: LINE_ITEM_FIELDS,
        navigations: &[],
    }
}

pub fn line_note_meta() -> EntityMeta {
    EntityMeta {
        table: "line_note",
        primary_key: &["note_id"],
        fields: LINE_NOTE_FIELDS,
        navigations: &[],
    }
}

pub fn registry() -> EntityRegistry {
    let mut registry = EntityRegistry::new();
    registry.register_meta(customer_meta()).unwrap();
    registry.register_meta(invoice_meta()).unwrap();
    registry.register_meta(line_item_meta()).unwrap();
    registry.register_meta(line_note_meta()).unwrap();
    registry
}

pub fn customer_values(id: i64, name: &str) -> FieldValues {
    FieldValues::new()
        .with("customer_id", id)
        .with("legal_name", name)
        .with("gstin", Value::Null)
}

pub fn invoice_values(id: i64, customer_id: i64, total: f64) -> FieldValues {
    FieldValues::new()
        .with("invoice_id", id)
        .with("customer_id", customer_id)
        .with("total", total)
}

pub fn line_item_values(invoice_id: i64, line_no: i64) -> FieldValues {
    FieldValues::new()
        .with("invoice_id", invoice_id)
        .with("line_no", line_no)
        .with("product_id", 1_i64)
        .with("quantity", 1_i64)
}

pub fn line_note_values(id: i64, invoice_id: i64, line_no: i64) -> FieldValues {
    FieldValues::new()
        .with("note_id", id)
        .with("invoice_id", invoice_id)
        .with("line_no", line_no)
        .with("body", "fragile")
}

/// A driver that serves seeded rows and records every statement.
///
/// SELECTs are answered from the seeded rows of the table named after
/// `FROM`, filtered by the `"col" = ?n` conditions of the WHERE clause.
#[derive(Default)]
pub struct MockDriver {
    tables: Mutex<HashMap<String, Vec<FieldValues>>>,
    log: Mutex<Vec<String>>,
    fail_on: Mutex<Option<String>>,
    affected: Mutex<Option<u64>>,
    next_id: AtomicI64,
    queries: AtomicU64,
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(100),
            ..Self::default()
        }
    }

    pub fn seed(&self, table: &str, values: FieldValues) {
        self.tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .push(values);
    }

    /// Fail every statement whose SQL contains `pattern`.
    pub fn fail_on(&self, pattern: &str) {
        *self.fail_on.lock().unwrap() = Some(pattern.to_string());
    }

    /// Report `rows` affected for every UPDATE and DELETE.
    pub fn set_affected(&self, rows: u64) {
        *self.affected.lock().unwrap() = Some(rows);
    }

    /// Every statement sent, including BEGIN, COMMIT and ROLLBACK.
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Statements that write rows.
    pub fn writes(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter(|s| s.starts_with("INSERT") || s.starts_with("UPDATE") || s.starts_with("DELETE"))
            .collect()
    }

    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }

    fn record(&self, sql: &str) -> Result<()> {
        self.log.lock().unwrap().push(sql.to_string());
        if let Some(pattern) = self.fail_on.lock().unwrap().as_deref() {
            if sql.contains(pattern) {
                return Err(Error::Query(QueryError {
                    kind: QueryErrorKind::Constraint,
                    sql: Some(sql.to_string()),
                    message: "injected failure".to_string(),
                    source: None,
                }));
            }
        }
        Ok(())
    }
}

/// `"col" = ?n` pairs of a WHERE clause, with any `t0.` qualifier dropped.
fn conditions(sql: &str) -> Vec<(String, usize)> {
    let Some((_, clause)) = sql.split_once(" WHERE ") else {
        return Vec::new();
    };
    clause
        .split(" AND ")
        .filter_map(|part| {
            let (column, placeholder) = part.split_once(" = ?")?;
            let column = column.rsplit('.').next()?.trim_matches('"');
            Some((column.to_string(), placeholder.trim().parse().ok()?))
        })
        .collect()
}

fn table_of(sql: &str) -> Option<&str> {
    let (_, rest) = sql.split_once(" FROM \"")?;
    rest.split('"').next()
}

impl StoreDriver for MockDriver {
    fn execute_query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.record(sql)?;
        let Some(table) = table_of(sql) else {
            return Ok(Vec::new());
        };
        let tables = self.tables.lock().unwrap();
        let seeded = tables.get(table).map(Vec::as_slice).unwrap_or_default();
        let filters = conditions(sql);
        let matching: Vec<&FieldValues> = seeded
            .iter()
            .filter(|values| {
                filters
                    .iter()
                    .all(|(column, n)| values.get(column) == params.get(n - 1))
            })
            .collect();
        if sql.starts_with("SELECT COUNT(*)") {
            let count = i64::try_from(matching.len()).unwrap();
            return Ok(vec![Row::new(vec!["count".to_string()], vec![Value::BigInt(count)])]);
        }
        Ok(matching
            .into_iter()
            .map(|values| {
                let (names, values): (Vec<String>, Vec<Value>) = values
                    .iter()
                    .map(|(name, value)| (name.to_string(), value.clone()))
                    .unzip();
                Row::new(names, values)
            })
            .collect())
    }

    fn execute_non_query(&self, sql: &str, _params: &[Value]) -> Result<u64> {
        self.record(sql)?;
        Ok(self.affected.lock().unwrap().unwrap_or(1))
    }

    fn execute_insert(&self, sql: &str, _params: &[Value]) -> Result<Option<i64>> {
        self.record(sql)?;
        Ok(Some(self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    fn begin_transaction(&self) -> Result<()> {
        self.record("BEGIN")
    }

    fn commit(&self) -> Result<()> {
        self.record("COMMIT")
    }

    fn rollback(&self) -> Result<()> {
        self.record("ROLLBACK")
    }
}

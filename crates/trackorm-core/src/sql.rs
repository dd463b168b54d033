//! SQL statement builders.
//!
//! Identifiers are ANSI double-quoted and every value is passed as a bound
//! parameter; no value is ever spliced into SQL text.

use crate::driver::Dialect;
use crate::entity::FieldValues;
use crate::key::PrimaryKey;
use crate::registry::EntityMeta;
use crate::relationship::NavigationInfo;
use crate::value::Value;

/// Quote a SQL identifier using ANSI double-quoting.
///
/// Embedded double-quotes are escaped by doubling them (`"` → `""`).
#[inline]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// A SQL statement with its bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Append `col = ?n AND ...` for `filters`, numbering placeholders after `params`.
///
/// A NULL filter value becomes `IS NULL` and binds nothing.
fn push_conditions(
    sql: &mut String,
    params: &mut Vec<Value>,
    dialect: Dialect,
    qualifier: Option<&str>,
    filters: &[(&str, &Value)],
) {
    for (i, (column, value)) in filters.iter().enumerate() {
        if i > 0 {
            sql.push_str(" AND ");
        }
        if let Some(q) = qualifier {
            sql.push_str(q);
            sql.push('.');
        }
        sql.push_str(&quote_ident(column));
        if value.is_null() {
            sql.push_str(" IS NULL");
        } else {
            params.push((*value).clone());
            sql.push_str(" = ");
            sql.push_str(&dialect.placeholder(params.len()));
        }
    }
}

fn column_list(meta: &EntityMeta) -> String {
    meta.fields
        .iter()
        .map(|f| quote_ident(f.name))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `SELECT <all columns> FROM table [WHERE col = ? AND ...]`.
pub fn select_where(dialect: Dialect, meta: &EntityMeta, filters: &[(&str, &Value)]) -> Statement {
    let mut sql = format!("SELECT {} FROM {}", column_list(meta), quote_ident(meta.table));
    let mut params = Vec::new();
    if !filters.is_empty() {
        sql.push_str(" WHERE ");
        push_conditions(&mut sql, &mut params, dialect, None, filters);
    }
    Statement { sql, params }
}

/// `SELECT` of the owner aliased `t0` joined with each navigation target.
///
/// Target `i` is aliased `t{i+1}`; every column is returned as
/// `t{n}__column`. Each join is a `LEFT JOIN` on the navigation's paired
/// columns, so owners without related rows still come back once.
pub fn select_joined(
    dialect: Dialect,
    owner: &EntityMeta,
    joins: &[(&NavigationInfo, &EntityMeta)],
    filters: &[(&str, &Value)],
) -> Statement {
    let mut columns = aliased_columns("t0", owner);
    for (i, (_, target)) in joins.iter().enumerate() {
        columns.extend(aliased_columns(&format!("t{}", i + 1), target));
    }
    let mut sql = format!(
        "SELECT {} FROM {} AS t0",
        columns.join(", "),
        quote_ident(owner.table)
    );
    for (i, (nav, target)) in joins.iter().enumerate() {
        let alias = format!("t{}", i + 1);
        let on = nav
            .local_columns
            .iter()
            .zip(nav.remote_columns.iter())
            .map(|(local, remote)| {
                format!(
                    "{alias}.{} = t0.{}",
                    quote_ident(remote),
                    quote_ident(local)
                )
            })
            .collect::<Vec<_>>()
            .join(" AND ");
        sql.push_str(&format!(
            " LEFT JOIN {} AS {alias} ON {on}",
            quote_ident(target.table)
        ));
    }
    let mut params = Vec::new();
    if !filters.is_empty() {
        sql.push_str(" WHERE ");
        push_conditions(&mut sql, &mut params, dialect, Some("t0"), filters);
    }
    Statement { sql, params }
}

fn aliased_columns(alias: &str, meta: &EntityMeta) -> Vec<String> {
    meta.fields
        .iter()
        .map(|f| format!("{alias}.{} AS {alias}__{}", quote_ident(f.name), f.name))
        .collect()
}

/// `INSERT INTO table (...) VALUES (...)`.
///
/// A store-generated column whose value is still NULL is left out so the
/// store assigns it.
pub fn insert(dialect: Dialect, meta: &EntityMeta, values: &FieldValues) -> Statement {
    let mut columns = Vec::new();
    let mut params = Vec::new();
    for field in meta.fields {
        let value = values.get(field.name).cloned().unwrap_or(Value::Null);
        if field.store_generated && value.is_null() {
            continue;
        }
        columns.push(quote_ident(field.name));
        params.push(value);
    }
    let sql = if columns.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES", quote_ident(meta.table))
    } else {
        let placeholders: Vec<_> = (1..=params.len()).map(|i| dialect.placeholder(i)).collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(meta.table),
            columns.join(", "),
            placeholders.join(", ")
        )
    };
    Statement { sql, params }
}

fn key_filters<'a>(meta: &EntityMeta, key: &'a PrimaryKey) -> Vec<(&'static str, &'a Value)> {
    meta.primary_key
        .iter()
        .copied()
        .zip(key.values().iter())
        .collect()
}

/// `UPDATE table SET col = ?, ... WHERE <key>`.
pub fn update(
    dialect: Dialect,
    meta: &EntityMeta,
    assignments: &[(&str, Value)],
    key: &PrimaryKey,
) -> Statement {
    let mut params = Vec::with_capacity(assignments.len() + key.values().len());
    let mut sets = Vec::with_capacity(assignments.len());
    for (column, value) in assignments {
        params.push(value.clone());
        sets.push(format!(
            "{} = {}",
            quote_ident(column),
            dialect.placeholder(params.len())
        ));
    }
    let mut sql = format!(
        "UPDATE {} SET {} WHERE ",
        quote_ident(meta.table),
        sets.join(", ")
    );
    push_conditions(&mut sql, &mut params, dialect, None, &key_filters(meta, key));
    Statement { sql, params }
}

/// `DELETE FROM table WHERE <key>`.
pub fn delete(dialect: Dialect, meta: &EntityMeta, key: &PrimaryKey) -> Statement {
    let mut sql = format!("DELETE FROM {} WHERE ", quote_ident(meta.table));
    let mut params = Vec::new();
    push_conditions(&mut sql, &mut params, dialect, None, &key_filters(meta, key));
    Statement { sql, params }
}

/// `SELECT COUNT(*) FROM table [WHERE ...]`, with the count in column `count`.
pub fn count(dialect: Dialect, table: &str, filters: &[(&str, &Value)]) -> Statement {
    let mut sql = format!(
        "SELECT COUNT(*) AS {} FROM {}",
        quote_ident("count"),
        quote_ident(table)
    );
    let mut params = Vec::new();
    if !filters.is_empty() {
        sql.push_str(" WHERE ");
        push_conditions(&mut sql, &mut params, dialect, None, filters);
    }
    Statement { sql, params }
}

//! Value binding and column decoding.
//!
//! SQLite has five storage classes: INTEGER, REAL, TEXT, BLOB and NULL.
//! Booleans go in as 0/1 integers, decimals and JSON as text. On the way back
//! every INTEGER becomes `Int` when it fits in 32 bits and `BigInt` otherwise,
//! and TEXT stays `Text`. Fields declaring a `SqlType` convert these back to
//! `Bool`, `Decimal` or `Json` when the record is read.

use libsqlite3_sys as raw;
use std::ffi::{CStr, c_int};
use trackorm_core::Value;

/// Bind a Value to a prepared statement parameter.
///
/// # Safety
/// - `stmt` must be a valid, non-null prepared statement handle
/// - `index` must be a valid 1-based parameter index
pub unsafe fn bind_value(stmt: *mut raw::sqlite3_stmt, index: c_int, value: &Value) -> c_int {
    // SAFETY: caller guarantees stmt and index; text and blob are copied by
    // SQLite because of SQLITE_TRANSIENT
    unsafe {
        match value {
            Value::Null => raw::sqlite3_bind_null(stmt, index),
            Value::Bool(b) => raw::sqlite3_bind_int(stmt, index, c_int::from(*b)),
            Value::Int(v) => raw::sqlite3_bind_int(stmt, index, *v),
            Value::BigInt(v) => raw::sqlite3_bind_int64(stmt, index, *v),
            Value::Double(v) => raw::sqlite3_bind_double(stmt, index, *v),
            Value::Decimal(s) | Value::Text(s) => bind_text(stmt, index, s),
            Value::Json(json) => bind_text(stmt, index, &json.to_string()),
            Value::Bytes(b) => match c_int::try_from(b.len()) {
                Ok(len) => raw::sqlite3_bind_blob(
                    stmt,
                    index,
                    b.as_ptr().cast(),
                    len,
                    raw::SQLITE_TRANSIENT(),
                ),
                Err(_) => raw::SQLITE_TOOBIG,
            },
        }
    }
}

unsafe fn bind_text(stmt: *mut raw::sqlite3_stmt, index: c_int, text: &str) -> c_int {
    let Ok(len) = c_int::try_from(text.len()) else {
        return raw::SQLITE_TOOBIG;
    };
    // SAFETY: forwarded from bind_value
    unsafe {
        raw::sqlite3_bind_text(
            stmt,
            index,
            text.as_ptr().cast(),
            len,
            raw::SQLITE_TRANSIENT(),
        )
    }
}

/// Read a column value from a result row.
///
/// # Safety
/// - `stmt` must be a valid prepared statement that has just returned `SQLITE_ROW`
/// - `index` must be a valid 0-based column index
pub unsafe fn read_column(stmt: *mut raw::sqlite3_stmt, index: c_int) -> Value {
    // SAFETY: caller guarantees stmt is positioned on a row
    unsafe {
        match raw::sqlite3_column_type(stmt, index) {
            raw::SQLITE_INTEGER => {
                let v = raw::sqlite3_column_int64(stmt, index);
                i32::try_from(v).map_or(Value::BigInt(v), Value::Int)
            }
            raw::SQLITE_FLOAT => Value::Double(raw::sqlite3_column_double(stmt, index)),
            raw::SQLITE_TEXT => {
                let ptr = raw::sqlite3_column_text(stmt, index);
                let len = usize::try_from(raw::sqlite3_column_bytes(stmt, index)).unwrap_or(0);
                if ptr.is_null() {
                    Value::Null
                } else {
                    let slice = std::slice::from_raw_parts(ptr, len);
                    Value::Text(String::from_utf8_lossy(slice).into_owned())
                }
            }
            raw::SQLITE_BLOB => {
                let ptr = raw::sqlite3_column_blob(stmt, index);
                let len = usize::try_from(raw::sqlite3_column_bytes(stmt, index)).unwrap_or(0);
                if ptr.is_null() || len == 0 {
                    Value::Bytes(Vec::new())
                } else {
                    Value::Bytes(std::slice::from_raw_parts(ptr.cast::<u8>(), len).to_vec())
                }
            }
            _ => Value::Null,
        }
    }
}

/// Get the column name from a result.
///
/// # Safety
/// - `stmt` must be a valid prepared statement
/// - `index` must be a valid 0-based column index
pub unsafe fn column_name(stmt: *mut raw::sqlite3_stmt, index: c_int) -> Option<String> {
    // SAFETY: caller guarantees stmt and index; the name outlives this call
    unsafe {
        let ptr = raw::sqlite3_column_name(stmt, index);
        if ptr.is_null() {
            None
        } else {
            CStr::from_ptr(ptr).to_str().ok().map(String::from)
        }
    }
}

//! SQLite store driver for trackorm.
//!
// The driver talks to libsqlite3 through raw FFI
#![allow(unsafe_code)]
//!
//! [`SqliteDriver`] implements `StoreDriver` from trackorm-core on top of the
//! `libsqlite3-sys` bindings, with SQLite compiled in from the bundled
//! amalgamation.
//!
//! # Example
//!
//! ```rust,ignore
//! use trackorm_core::{StoreDriver, Value};
//! use trackorm_sqlite::SqliteDriver;
//!
//! let driver = SqliteDriver::open_memory()?;
//! driver.execute_raw("CREATE TABLE customer (customer_id INTEGER PRIMARY KEY, legal_name TEXT)")?;
//! let id = driver.execute_insert(
//!     "INSERT INTO customer (legal_name) VALUES (?1)",
//!     &[Value::from("Acme Traders")],
//! )?;
//! ```
//!
//! # Type Mapping
//!
//! | Value | SQLite Type |
//! |-------|-------------|
//! | `Bool` | INTEGER (0/1) |
//! | `Int`, `BigInt` | INTEGER |
//! | `Double` | REAL |
//! | `Text`, `Decimal`, `Json` | TEXT |
//! | `Bytes` | BLOB |
//! | `Null` | NULL |
//!
//! # Thread Safety
//!
//! `SqliteDriver` is `Send` and `Sync`; every call locks the connection for
//! its duration. Foreign key enforcement is switched on at open unless
//! [`SqliteConfig::foreign_keys`] turns it off.

pub mod connection;
pub mod ffi;
pub mod types;

pub use connection::{OpenFlags, SqliteConfig, SqliteDriver};

/// The SQLite library version.
pub fn sqlite_version() -> &'static str {
    ffi::version()
}

/// The SQLite library version number.
pub fn sqlite_version_number() -> i32 {
    ffi::version_number()
}

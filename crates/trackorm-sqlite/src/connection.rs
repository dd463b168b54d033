//! SQLite store driver.
//!
//! [`SqliteDriver`] owns one database handle behind a mutex and implements
//! [`StoreDriver`]. Statements are prepared, bound, stepped and finalized per
//! call; there is no statement cache.

// Casts between usize and c_int are checked or bounded by SQLite limits
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::borrow_as_ptr)]

use crate::ffi;
use crate::types;
/// `libsqlite3-sys` leaves `sqlite3_close_v2` out of its generated bindings,
/// so it is declared here against the linked SQLite library.
mod raw {
    pub use libsqlite3_sys::*;

    unsafe extern "C" {
        pub fn sqlite3_close_v2(db: *mut sqlite3) -> std::ffi::c_int;
    }
}
use std::ffi::{CStr, CString, c_int};
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::{debug, trace};
use trackorm_core::{
    ColumnInfo, ConnectionError, ConnectionErrorKind, Dialect, Error, QueryError, QueryErrorKind,
    Result, Row, StoreDriver, TransactionError, TransactionErrorKind, Value,
};

/// Configuration for opening a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Path to the database file, or ":memory:" for an in-memory database.
    pub path: String,
    /// Open flags (read-only, read-write, create, etc.)
    pub flags: OpenFlags,
    /// Busy timeout in milliseconds.
    pub busy_timeout_ms: u32,
    /// Run `PRAGMA foreign_keys = ON` after opening.
    pub foreign_keys: bool,
}

/// Flags controlling how the database is opened.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    /// Open for reading only.
    pub read_only: bool,
    /// Open for reading and writing.
    pub read_write: bool,
    /// Create the database if it doesn't exist.
    pub create: bool,
    /// Enable URI filename interpretation.
    pub uri: bool,
    /// Open in serialized mode.
    pub full_mutex: bool,
}

impl OpenFlags {
    /// Create flags for read-only access.
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Default::default()
        }
    }

    /// Create flags for read-write access (database must exist).
    pub fn read_write() -> Self {
        Self {
            read_write: true,
            ..Default::default()
        }
    }

    /// Create flags for read-write access with creation if needed.
    pub fn create_read_write() -> Self {
        Self {
            read_write: true,
            create: true,
            ..Default::default()
        }
    }

    fn to_sqlite_flags(self) -> c_int {
        let mut flags = 0;
        if self.read_only {
            flags |= raw::SQLITE_OPEN_READONLY;
        }
        if self.read_write {
            flags |= raw::SQLITE_OPEN_READWRITE;
        }
        if self.create {
            flags |= raw::SQLITE_OPEN_CREATE;
        }
        if self.uri {
            flags |= raw::SQLITE_OPEN_URI;
        }
        if self.full_mutex {
            flags |= raw::SQLITE_OPEN_FULLMUTEX;
        }
        // Default to read-write if no mode specified
        if flags & (raw::SQLITE_OPEN_READONLY | raw::SQLITE_OPEN_READWRITE) == 0 {
            flags |= raw::SQLITE_OPEN_READWRITE | raw::SQLITE_OPEN_CREATE;
        }
        flags
    }
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: ":memory:".to_string(),
            flags: OpenFlags::create_read_write(),
            busy_timeout_ms: 5000,
            foreign_keys: true,
        }
    }
}

impl SqliteConfig {
    /// Create a new config for a file-based database.
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create a new config for an in-memory database.
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn flags(mut self, flags: OpenFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn busy_timeout(mut self, ms: u32) -> Self {
        self.busy_timeout_ms = ms;
        self
    }

    pub fn foreign_keys(mut self, enabled: bool) -> Self {
        self.foreign_keys = enabled;
        self
    }
}

struct SqliteInner {
    db: *mut raw::sqlite3,
    in_transaction: bool,
}

// SAFETY: the handle is only touched while the driver's mutex is held
unsafe impl Send for SqliteInner {}

/// A [`StoreDriver`] over one SQLite connection.
pub struct SqliteDriver {
    inner: Mutex<SqliteInner>,
    path: String,
}

impl std::fmt::Debug for SqliteDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDriver")
            .field("path", &self.path)
            .field("in_transaction", &self.in_transaction())
            .finish()
    }
}

impl SqliteDriver {
    /// Open a database with the given configuration.
    pub fn open(config: &SqliteConfig) -> Result<Self> {
        let c_path = CString::new(config.path.as_str())
            .map_err(|_| connect_error("invalid path: contains null byte".to_string()))?;

        let mut db: *mut raw::sqlite3 = ptr::null_mut();
        let flags = config.flags.to_sqlite_flags();

        // SAFETY: valid pointers; the return code is checked below
        let rc = unsafe { raw::sqlite3_open_v2(c_path.as_ptr(), &mut db, flags, ptr::null()) };

        if rc != raw::SQLITE_OK {
            let msg = if db.is_null() {
                ffi::error_string(rc).to_string()
            } else {
                // SAFETY: db was allocated by sqlite3_open_v2 and is closed here
                unsafe {
                    let (_, msg) = ffi::last_error(db);
                    raw::sqlite3_close(db);
                    msg
                }
            };
            return Err(connect_error(format!("failed to open database: {msg}")));
        }

        if config.busy_timeout_ms > 0 {
            let ms = c_int::try_from(config.busy_timeout_ms).unwrap_or(c_int::MAX);
            // SAFETY: db is valid
            unsafe {
                raw::sqlite3_busy_timeout(db, ms);
            }
        }

        let driver = Self {
            inner: Mutex::new(SqliteInner {
                db,
                in_transaction: false,
            }),
            path: config.path.clone(),
        };
        if config.foreign_keys {
            driver.execute_raw("PRAGMA foreign_keys = ON")?;
        }
        debug!(path = %driver.path, version = ffi::version(), "opened sqlite database");
        Ok(driver)
    }

    /// Open an in-memory database.
    pub fn open_memory() -> Result<Self> {
        Self::open(&SqliteConfig::memory())
    }

    /// Open a file-based database.
    pub fn open_file(path: impl Into<String>) -> Result<Self> {
        Self::open(&SqliteConfig::file(path))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn in_transaction(&self) -> bool {
        self.lock().in_transaction
    }

    /// Execute SQL directly without preparing (for DDL, pragmas, scripts).
    pub fn execute_raw(&self, sql: &str) -> Result<()> {
        let inner = self.lock();
        exec(inner.db, sql)
    }

    /// Get the last insert rowid.
    pub fn last_insert_rowid(&self) -> i64 {
        let inner = self.lock();
        // SAFETY: db is valid
        unsafe { raw::sqlite3_last_insert_rowid(inner.db) }
    }

    /// Get the number of rows changed by the last statement.
    pub fn changes(&self) -> i32 {
        let inner = self.lock();
        // SAFETY: db is valid
        unsafe { raw::sqlite3_changes(inner.db) }
    }

    fn lock(&self) -> MutexGuard<'_, SqliteInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Prepare and execute a query, returning all rows.
    fn query_sync(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let start = Instant::now();
        let inner = self.lock();
        let stmt = Statement::prepare(inner.db, sql)?;
        stmt.bind_all(params)?;

        // SAFETY: stmt is valid
        let col_count = unsafe { raw::sqlite3_column_count(stmt.raw) };
        let col_names: Vec<String> = (0..col_count)
            // SAFETY: i is within column_count
            .map(|i| unsafe { types::column_name(stmt.raw, i) }.unwrap_or_else(|| format!("col{i}")))
            .collect();
        let columns = Arc::new(ColumnInfo::new(col_names));

        let mut rows = Vec::new();
        loop {
            match stmt.step() {
                raw::SQLITE_ROW => {
                    let values = (0..col_count)
                        // SAFETY: the statement is positioned on a row
                        .map(|i| unsafe { types::read_column(stmt.raw, i) })
                        .collect();
                    rows.push(Row::with_columns(Arc::clone(&columns), values));
                }
                raw::SQLITE_DONE => break,
                _ => return Err(step_error(inner.db, sql)),
            }
        }

        trace!(
            sql,
            rows = rows.len(),
            elapsed_us = start.elapsed().as_micros() as u64,
            "query"
        );
        Ok(rows)
    }

    /// Prepare and execute a statement, returning rows affected and the
    /// rowid of the last insert.
    fn execute_sync(&self, sql: &str, params: &[Value]) -> Result<(u64, i64)> {
        let start = Instant::now();
        let inner = self.lock();
        let stmt = Statement::prepare(inner.db, sql)?;
        stmt.bind_all(params)?;

        match stmt.step() {
            raw::SQLITE_DONE | raw::SQLITE_ROW => {
                drop(stmt);
                // SAFETY: db is valid
                let (changes, rowid) = unsafe {
                    (
                        raw::sqlite3_changes(inner.db),
                        raw::sqlite3_last_insert_rowid(inner.db),
                    )
                };
                let changes = u64::try_from(changes).unwrap_or(0);
                trace!(
                    sql,
                    changes,
                    elapsed_us = start.elapsed().as_micros() as u64,
                    "execute"
                );
                Ok((changes, rowid))
            }
            _ => Err(step_error(inner.db, sql)),
        }
    }
}

impl StoreDriver for SqliteDriver {
    fn execute_query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.query_sync(sql, params)
    }

    fn execute_non_query(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.execute_sync(sql, params).map(|(changes, _)| changes)
    }

    fn execute_insert(&self, sql: &str, params: &[Value]) -> Result<Option<i64>> {
        self.execute_sync(sql, params).map(|(_, rowid)| Some(rowid))
    }

    fn begin_transaction(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.in_transaction {
            return Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::NestedNotSupported,
                message: "a transaction is already open on this connection".to_string(),
            }));
        }
        exec(inner.db, "BEGIN")?;
        inner.in_transaction = true;
        debug!(path = %self.path, "BEGIN");
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let mut inner = self.lock();
        if !inner.in_transaction {
            return Err(not_in_transaction("COMMIT"));
        }
        exec(inner.db, "COMMIT")?;
        inner.in_transaction = false;
        debug!(path = %self.path, "COMMIT");
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        let mut inner = self.lock();
        if !inner.in_transaction {
            return Err(not_in_transaction("ROLLBACK"));
        }
        // A failed ROLLBACK still ends the transaction from our side.
        inner.in_transaction = false;
        exec(inner.db, "ROLLBACK")?;
        debug!(path = %self.path, "ROLLBACK");
        Ok(())
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }
}

impl Drop for SqliteDriver {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !inner.db.is_null() {
            // SAFETY: db is valid and no statements outlive their call
            unsafe {
                raw::sqlite3_close_v2(inner.db);
            }
            inner.db = ptr::null_mut();
        }
    }
}

/// A prepared statement, finalized on drop.
struct Statement {
    raw: *mut raw::sqlite3_stmt,
    db: *mut raw::sqlite3,
    sql: String,
}

impl Statement {
    fn prepare(db: *mut raw::sqlite3, sql: &str) -> Result<Self> {
        let c_sql = CString::new(sql).map_err(|_| null_byte(sql))?;
        let len = c_int::try_from(c_sql.as_bytes().len()).map_err(|_| {
            query_error(
                QueryErrorKind::DataTruncation,
                sql,
                "statement too long".to_string(),
            )
        })?;
        let mut stmt: *mut raw::sqlite3_stmt = ptr::null_mut();

        // SAFETY: all pointers are valid
        let rc =
            unsafe { raw::sqlite3_prepare_v2(db, c_sql.as_ptr(), len, &mut stmt, ptr::null_mut()) };
        if rc != raw::SQLITE_OK {
            return Err(step_error(db, sql));
        }
        Ok(Self {
            raw: stmt,
            db,
            sql: sql.to_string(),
        })
    }

    fn bind_all(&self, params: &[Value]) -> Result<()> {
        for (i, param) in params.iter().enumerate() {
            let index = c_int::try_from(i + 1).unwrap_or(c_int::MAX);
            // SAFETY: stmt is valid, index is 1-based
            let rc = unsafe { types::bind_value(self.raw, index, param) };
            if rc != raw::SQLITE_OK {
                // SAFETY: db is valid
                let (_, msg) = unsafe { ffi::last_error(self.db) };
                return Err(query_error(
                    QueryErrorKind::Database,
                    &self.sql,
                    format!("failed to bind parameter {}: {msg}", i + 1),
                ));
            }
        }
        Ok(())
    }

    fn step(&self) -> c_int {
        // SAFETY: stmt is valid
        unsafe { raw::sqlite3_step(self.raw) }
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        // SAFETY: stmt came from sqlite3_prepare_v2 and is finalized once
        unsafe {
            raw::sqlite3_finalize(self.raw);
        }
    }
}

fn exec(db: *mut raw::sqlite3, sql: &str) -> Result<()> {
    let c_sql = CString::new(sql).map_err(|_| null_byte(sql))?;
    let mut errmsg: *mut std::ffi::c_char = ptr::null_mut();

    // SAFETY: all pointers are valid
    let rc = unsafe { raw::sqlite3_exec(db, c_sql.as_ptr(), None, ptr::null_mut(), &mut errmsg) };

    if rc != raw::SQLITE_OK {
        let msg = if errmsg.is_null() {
            ffi::error_string(rc).to_string()
        } else {
            // SAFETY: errmsg was allocated by SQLite and is freed once
            unsafe {
                let msg = CStr::from_ptr(errmsg).to_string_lossy().into_owned();
                raw::sqlite3_free(errmsg.cast());
                msg
            }
        };
        return Err(query_error(error_code_to_kind(rc & 0xff), sql, msg));
    }
    Ok(())
}

fn step_error(db: *mut raw::sqlite3, sql: &str) -> Error {
    // SAFETY: db is valid
    let (code, msg) = unsafe { ffi::last_error(db) };
    query_error(error_code_to_kind(code), sql, msg)
}

fn query_error(kind: QueryErrorKind, sql: &str, message: String) -> Error {
    Error::Query(QueryError {
        kind,
        sql: Some(sql.to_string()),
        message,
        source: None,
    })
}

fn null_byte(sql: &str) -> Error {
    query_error(QueryErrorKind::Syntax, sql, "SQL contains null byte".to_string())
}

fn not_in_transaction(sql: &str) -> Error {
    query_error(QueryErrorKind::Database, sql, "not in a transaction".to_string())
}

fn connect_error(message: String) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Connect,
        message,
        source: None,
    })
}

fn error_code_to_kind(code: c_int) -> QueryErrorKind {
    match code {
        raw::SQLITE_CONSTRAINT => QueryErrorKind::Constraint,
        raw::SQLITE_BUSY | raw::SQLITE_LOCKED => QueryErrorKind::Deadlock,
        raw::SQLITE_PERM | raw::SQLITE_AUTH | raw::SQLITE_READONLY => QueryErrorKind::Permission,
        raw::SQLITE_NOTFOUND => QueryErrorKind::NotFound,
        raw::SQLITE_TOOBIG => QueryErrorKind::DataTruncation,
        raw::SQLITE_INTERRUPT => QueryErrorKind::Timeout,
        _ => QueryErrorKind::Database,
    }
}

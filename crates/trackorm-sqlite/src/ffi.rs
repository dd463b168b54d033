//! Small safe helpers over `libsqlite3-sys`.
//!
//! The raw bindings come from `libsqlite3-sys`; this module only wraps the
//! handful of calls that return static strings or read the last error of a
//! connection.

use libsqlite3_sys as raw;
use std::ffi::{CStr, c_int};

/// Get the SQLite library version string.
pub fn version() -> &'static str {
    // SAFETY: sqlite3_libversion returns a pointer to a static string
    unsafe {
        let ptr = raw::sqlite3_libversion();
        CStr::from_ptr(ptr).to_str().unwrap_or("unknown")
    }
}

/// Get the SQLite library version as a number, e.g. `3046001`.
pub fn version_number() -> i32 {
    // SAFETY: no arguments, no state
    unsafe { raw::sqlite3_libversion_number() }
}

/// Convert an SQLite result code to a human-readable string.
pub fn error_string(code: c_int) -> &'static str {
    // SAFETY: sqlite3_errstr returns a static string for any code
    unsafe {
        let ptr = raw::sqlite3_errstr(code);
        if ptr.is_null() {
            return "unknown error";
        }
        CStr::from_ptr(ptr).to_str().unwrap_or("unknown error")
    }
}

/// The message and primary result code of the last failed call on `db`.
///
/// # Safety
/// `db` must be a valid, open connection handle.
pub unsafe fn last_error(db: *mut raw::sqlite3) -> (c_int, String) {
    // SAFETY: caller guarantees db is valid; errmsg is owned by SQLite
    unsafe {
        let code = raw::sqlite3_errcode(db) & 0xff;
        let ptr = raw::sqlite3_errmsg(db);
        let message = if ptr.is_null() {
            error_string(code).to_string()
        } else {
            CStr::from_ptr(ptr).to_string_lossy().into_owned()
        };
        (code, message)
    }
}

//! Core types for trackorm.
//!
//! This crate holds everything the unit of work and the drivers share:
//!
//! - `Value`, `Row` and `PrimaryKey` for data moving to and from a store
//! - `Entity`, `FieldInfo`, `SqlType` and `NavigationInfo` for mapping metadata
//! - `EntityRegistry` for metadata lookup by table name
//! - `StoreDriver`, the contract a backing store implements
//! - the `Error` taxonomy

pub mod cancel;
pub mod driver;
pub mod entity;
pub mod error;
pub mod key;
pub mod registry;
pub mod relationship;
pub mod row;
pub mod sql;
pub mod types;
pub mod value;

pub use cancel::CancellationToken;
pub use driver::{Dialect, StoreDriver};
pub use entity::{Entity, FieldInfo, FieldValues};
pub use error::{
    ConfigError, ConflictError, ConnectionError, ConnectionErrorKind, DetachedAccessError, Error,
    PersistOperation, PersistenceError, QueryError, QueryErrorKind, Result, TransactionError,
    TransactionErrorKind, TypeError, ValidationError, ValidationErrorKind,
};
pub use key::PrimaryKey;
pub use registry::{Dependent, EntityMeta, EntityRegistry, ForeignKey};
pub use relationship::{LoadStrategy, NavigationInfo, NavigationKind};
pub use row::{ColumnInfo, FromValue, Row};
pub use sql::{Statement, quote_ident};
pub use types::SqlType;
pub use value::Value;

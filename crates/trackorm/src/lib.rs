//! trackorm: a change-tracking unit of work over SQL stores.
//!
//! Load records through a [`UnitOfWork`], edit them in memory, add and
//! delete records, and commit. The unit of work keeps one instance per
//! primary key, remembers what changed, resolves navigations lazily or
//! eagerly and writes the difference in dependency order inside one
//! transaction.
//!
//! # Quick Start
//!
//! ```ignore
//! use trackorm::prelude::*;
//!
//! struct Customer {
//!     customer_id: Option<i64>,
//!     legal_name: String,
//! }
//!
//! impl Entity for Customer {
//!     const TABLE_NAME: &'static str = "customer";
//!     const PRIMARY_KEY: &'static [&'static str] = &["customer_id"];
//!
//!     fn fields() -> &'static [FieldInfo] {
//!         const FIELDS: &[FieldInfo] = &[
//!             FieldInfo::new("customer_id").primary_key().store_generated(),
//!             FieldInfo::new("legal_name"),
//!         ];
//!         FIELDS
//!     }
//!
//!     fn to_values(&self) -> FieldValues {
//!         FieldValues::new()
//!             .with("customer_id", self.customer_id)
//!             .with("legal_name", self.legal_name.as_str())
//!     }
//!
//!     fn from_values(values: &FieldValues) -> Result<Self> {
//!         Ok(Self {
//!             customer_id: values.get_as("customer_id")?,
//!             legal_name: values.get_as("legal_name")?,
//!         })
//!     }
//! }
//!
//! let mut sessions = SessionBuilder::new().register::<Customer>()?;
//! let driver = Arc::new(SqliteDriver::open_memory()?);
//! let uow = sessions.open(Arc::clone(&driver));
//!
//! let acme = uow.add_entity(&Customer { customer_id: None, legal_name: "Acme".into() })?;
//! uow.commit()?;
//! assert!(read_record(&acme).get_as::<i64>("customer_id").is_ok());
//! ```
//!
//! # Crates
//!
//! - `trackorm-core`: values, rows, metadata, the registry, the driver trait and errors
//! - `trackorm-session`: identity map, change tracker, relationship loading, commit
//! - `trackorm-sqlite`: the SQLite driver

pub use trackorm_core::{
    CancellationToken, ColumnInfo, ConfigError, ConflictError, ConnectionError,
    ConnectionErrorKind, Dependent, DetachedAccessError, Dialect, Entity, EntityMeta,
    EntityRegistry, Error, FieldInfo, FieldValues, ForeignKey, FromValue, LoadStrategy,
    NavigationInfo, NavigationKind, PersistOperation, PersistenceError, PrimaryKey, QueryError,
    QueryErrorKind, Result, Row, SqlType, StoreDriver, TransactionError, TransactionErrorKind,
    TypeError, ValidationError, ValidationErrorKind, Value,
};

pub use trackorm_session::{
    CommitResult, IdentityMap, MergePolicy, Navigated, NavigationLoader, NavigationSlot,
    RecordId, RecordKey, RecordRef, RecordState, SessionConfig, TrackedRecord, UnitOfWork,
    UpdateMode, navigate, read_record, related, related_one, write_record,
};

pub use trackorm_sqlite::{OpenFlags, SqliteConfig, SqliteDriver, sqlite_version};

pub mod session;
pub use session::SessionBuilder;

/// Everything needed to map entities and run a unit of work.
pub mod prelude {
    pub use crate::{
        // Mapping
        Entity,
        FieldInfo,
        FieldValues,
        NavigationInfo,
        PrimaryKey,
        SqlType,
        Value,
        // Tracking
        CommitResult,
        MergePolicy,
        RecordRef,
        RecordState,
        UnitOfWork,
        read_record,
        related,
        related_one,
        write_record,
        // Session
        SessionBuilder,
        SessionConfig,
        UpdateMode,
        // Driver
        SqliteConfig,
        SqliteDriver,
        StoreDriver,
        // Errors
        Error,
        Result,
    };
    // Records and drivers are shared through `Arc`.
    pub use std::sync::Arc;
}

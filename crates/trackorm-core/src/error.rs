//! Error types for change tracking and persistence.

use std::fmt;

/// The primary error type for all trackorm operations.
#[derive(Debug)]
pub enum Error {
    /// A record being attached collides with a diverging tracked record
    Conflict(ConflictError),
    /// A lazy navigation was read after its unit of work ended
    DetachedAccess(DetachedAccessError),
    /// A statement failed while committing
    Persistence(PersistenceError),
    /// Invalid field access or an invalid pending change set
    Validation(ValidationError),
    /// Query execution errors reported by a driver
    Query(QueryError),
    /// Connection-related errors (open, close)
    Connection(ConnectionError),
    /// Type conversion errors
    Type(TypeError),
    /// Transaction errors
    Transaction(TransactionError),
    /// Configuration errors (bad metadata, bad driver settings)
    Config(ConfigError),
    /// Operation was cancelled before it started
    Cancelled,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug, Clone)]
pub struct ConflictError {
    pub table: String,
    pub key: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct DetachedAccessError {
    pub table: String,
    pub navigation: String,
}

/// The statement kind that was running when a commit failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOperation {
    Insert,
    Update,
    Delete,
    Begin,
    Commit,
}

impl PersistOperation {
    pub const fn as_str(self) -> &'static str {
        match self {
            PersistOperation::Insert => "INSERT",
            PersistOperation::Update => "UPDATE",
            PersistOperation::Delete => "DELETE",
            PersistOperation::Begin => "BEGIN",
            PersistOperation::Commit => "COMMIT",
        }
    }
}

#[derive(Debug)]
pub struct PersistenceError {
    /// Table of the record whose statement failed (empty for BEGIN/COMMIT)
    pub table: String,
    /// Display form of the record key
    pub key: String,
    pub operation: PersistOperation,
    /// The driver error, or `None` when no row was affected
    pub cause: Option<Box<Error>>,
}

/// The kind of rule an invalid change set broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// Field is not declared on the entity
    UnknownField,
    /// Record is Deleted or Detached and cannot be written
    InvalidState,
    /// Required foreign key is neither set nor linked
    Required,
    /// Record being deleted still has live dependents
    LiveDependents,
    /// Inserts reference each other in a cycle
    Cycle,
    /// Unknown entity type or navigation
    Unknown,
    /// Record key cannot be derived from its values
    Key,
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub kind: ValidationErrorKind,
    pub table: String,
    /// Field or navigation involved, if any
    pub field: Option<String>,
    pub message: String,
}

impl ValidationError {
    pub fn new(kind: ValidationErrorKind, table: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            table: table.into(),
            field: None,
            message: message.into(),
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Permission denied
    Permission,
    /// Data too large for column
    DataTruncation,
    /// Deadlock or lock contention
    Deadlock,
    /// Statement timeout
    Timeout,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection lost or already closed
    Disconnected,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// Already committed
    AlreadyCommitted,
    /// Already rolled back
    AlreadyRolledBack,
    /// Nested transaction not supported
    NestedNotSupported,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }
}

impl Error {
    /// Is this a transient error (deadlock, busy, timeout) that a caller may retry?
    ///
    /// A persistence error is classified by its cause.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(q.kind, QueryErrorKind::Deadlock | QueryErrorKind::Timeout),
            Error::Persistence(p) => p.cause.as_deref().is_some_and(Error::is_retryable),
            _ => false,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            Error::Persistence(p) => p.cause.as_deref().and_then(Error::sql),
            _ => None,
        }
    }

    pub fn validation(
        kind: ValidationErrorKind,
        table: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Validation(ValidationError::new(kind, table, message))
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{}.{}: {}", self.table, field, self.message),
            None => write!(f, "{}: {}", self.table, self.message),
        }
    }
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed", self.operation.as_str())?;
        if !self.table.is_empty() {
            write!(f, " for {}[{}]", self.table, self.key)?;
        }
        match &self.cause {
            Some(cause) => write!(f, ": {cause}"),
            None => f.write_str(": no rows affected"),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Conflict(e) => write!(f, "Conflict on {}[{}]: {}", e.table, e.key, e.message),
            Error::DetachedAccess(e) => write!(
                f,
                "Navigation '{}' on {} accessed after its unit of work ended",
                e.navigation, e.table
            ),
            Error::Persistence(e) => write!(f, "Persistence error: {e}"),
            Error::Validation(e) => write!(f, "Validation error: {e}"),
            Error::Query(e) => write!(f, "Query error: {}", e.message),
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Type(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type error in column '{}': expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Persistence(e) => e
                .cause
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Validation(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

/// Result type alias for trackorm operations.
pub type Result<T> = std::result::Result<T, Error>;

//! Error types for unit-of-work operations.

use std::fmt;

use crate::value::Value;

/// The primary error type for all unit-of-work operations.
#[derive(Debug)]
pub enum Error {
    /// Caller misuse: malformed keys, missing transactions, re-entrant commits
    Validation(ValidationError),
    /// Lost update detected through a version column
    OptimisticLock(OptimisticLockError),
    /// Normalized backend failure
    Driver(DriverError),
    /// Transaction lifecycle errors
    Transaction(TransactionError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message, typically raised by lifecycle hooks
    Custom(String),
}

/// Misuse of the unit of work that is never retried.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub kind: ValidationErrorKind,
    pub message: String,
    /// Entity type involved, when known
    pub entity: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// An entity that needs an identity has no primary key value
    MissingPrimaryKey,
    /// Composite key supplied with the wrong arity
    InvalidCompositeKey,
    /// Operation requires an active transaction
    TransactionRequired,
    /// `commit()` invoked while a flush is running on the same instance
    ReentrantCommit,
    /// Entity type is not registered in the metadata storage
    UnknownEntity,
    /// Property is not declared on the entity type
    UnknownProperty,
    /// Entity is not managed by this unit of work
    NotManaged,
    /// Entity metadata is inconsistent
    InvalidMetadata,
    /// Entity was already removed in this unit of work
    EntityRemoved,
}

impl ValidationError {
    pub fn new(kind: ValidationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            entity: None,
        }
    }

    /// Attach the entity type name.
    pub fn with_entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    pub fn missing_primary_key(entity: &str) -> Self {
        Self::new(
            ValidationErrorKind::MissingPrimaryKey,
            format!("entity '{entity}' has no primary key value"),
        )
        .with_entity(entity)
    }

    pub fn invalid_composite_key(entity: &str, expected: usize, actual: usize) -> Self {
        Self::new(
            ValidationErrorKind::InvalidCompositeKey,
            format!("entity '{entity}' has a {expected}-part primary key, got {actual} value(s)"),
        )
        .with_entity(entity)
    }

    pub fn transaction_required(operation: &str) -> Self {
        Self::new(
            ValidationErrorKind::TransactionRequired,
            format!("{operation} requires an active transaction"),
        )
    }

    pub fn reentrant_commit() -> Self {
        Self::new(
            ValidationErrorKind::ReentrantCommit,
            "commit() called while a flush is already in progress",
        )
    }

    pub fn unknown_entity(entity: &str) -> Self {
        Self::new(
            ValidationErrorKind::UnknownEntity,
            format!("entity '{entity}' is not registered"),
        )
        .with_entity(entity)
    }

    pub fn unknown_property(entity: &str, property: &str) -> Self {
        Self::new(
            ValidationErrorKind::UnknownProperty,
            format!("entity '{entity}' has no property '{property}'"),
        )
        .with_entity(entity)
    }

    pub fn not_managed(entity: &str) -> Self {
        Self::new(
            ValidationErrorKind::NotManaged,
            format!("entity '{entity}' is not managed by this unit of work"),
        )
        .with_entity(entity)
    }

    pub fn entity_removed(entity: &str) -> Self {
        Self::new(
            ValidationErrorKind::EntityRemoved,
            format!("entity '{entity}' was removed in this unit of work"),
        )
        .with_entity(entity)
    }

    pub fn invalid_metadata(entity: &str, message: impl Into<String>) -> Self {
        Self::new(ValidationErrorKind::InvalidMetadata, message).with_entity(entity)
    }
}

/// Concurrency failure detected through a version column.
#[derive(Debug, Clone)]
pub struct OptimisticLockError {
    pub kind: OptimisticLockErrorKind,
    pub entity: String,
    /// Serialized primary key of the row
    pub primary_key: String,
    pub expected: Option<Value>,
    pub actual: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimisticLockErrorKind {
    /// Versioned update matched zero rows
    LockFailed,
    /// Held version differs from the version the caller expected
    VersionMismatch,
}

impl OptimisticLockError {
    pub fn lock_failed(entity: &str, primary_key: impl Into<String>, held: Value) -> Self {
        Self {
            kind: OptimisticLockErrorKind::LockFailed,
            entity: entity.to_string(),
            primary_key: primary_key.into(),
            expected: Some(held),
            actual: None,
        }
    }

    pub fn version_mismatch(
        entity: &str,
        primary_key: impl Into<String>,
        expected: Value,
        actual: Value,
    ) -> Self {
        Self {
            kind: OptimisticLockErrorKind::VersionMismatch,
            entity: entity.to_string(),
            primary_key: primary_key.into(),
            expected: Some(expected),
            actual: Some(actual),
        }
    }
}

/// Backend failure translated into the normalized taxonomy.
#[derive(Debug)]
pub struct DriverError {
    pub kind: DriverErrorKind,
    /// Backend-specific code (SQLSTATE, errno, ...)
    pub code: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    UniqueConstraintViolation,
    ForeignKeyConstraintViolation,
    NotNullConstraintViolation,
    TableNotFound,
    ColumnNotFound,
    Deadlock,
    LockWaitTimeout,
    Syntax,
    ReadOnly,
    Connection,
    Other,
}

impl DriverErrorKind {
    pub const fn is_constraint_violation(self) -> bool {
        matches!(
            self,
            DriverErrorKind::UniqueConstraintViolation
                | DriverErrorKind::ForeignKeyConstraintViolation
                | DriverErrorKind::NotNullConstraintViolation
        )
    }
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Translates raw backend errors into [`DriverErrorKind`].
///
/// Drivers own an implementation and call it when a statement fails;
/// the unit of work only ever sees the normalized kind.
pub trait ExceptionConverter: Send + Sync {
    fn convert(&self, code: Option<&str>, message: &str) -> DriverErrorKind;

    fn to_error(&self, code: Option<&str>, message: &str) -> DriverError {
        DriverError {
            kind: self.convert(code, message),
            code: code.map(str::to_string),
            message: message.to_string(),
            source: None,
        }
    }
}

/// SQLSTATE-based converter shared by ANSI-ish backends.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlStateConverter;

impl ExceptionConverter for SqlStateConverter {
    fn convert(&self, code: Option<&str>, message: &str) -> DriverErrorKind {
        match code {
            Some("23505") => DriverErrorKind::UniqueConstraintViolation,
            Some("23503") => DriverErrorKind::ForeignKeyConstraintViolation,
            Some("23502") => DriverErrorKind::NotNullConstraintViolation,
            Some("42P01") => DriverErrorKind::TableNotFound,
            Some("42703") => DriverErrorKind::ColumnNotFound,
            Some("40P01") => DriverErrorKind::Deadlock,
            Some("55P03") => DriverErrorKind::LockWaitTimeout,
            Some("42601") => DriverErrorKind::Syntax,
            Some("25006") => DriverErrorKind::ReadOnly,
            Some(c) if c.starts_with("08") => DriverErrorKind::Connection,
            _ => {
                let lower = message.to_ascii_lowercase();
                if lower.contains("unique") {
                    DriverErrorKind::UniqueConstraintViolation
                } else if lower.contains("deadlock") {
                    DriverErrorKind::Deadlock
                } else {
                    DriverErrorKind::Other
                }
            }
        }
    }
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// A transaction is already open on this unit of work
    AlreadyActive,
    /// No transaction is open
    NotActive,
}

impl TransactionError {
    pub fn already_active() -> Self {
        Self {
            kind: TransactionErrorKind::AlreadyActive,
            message: "a transaction is already active".to_string(),
        }
    }

    pub fn not_active() -> Self {
        Self {
            kind: TransactionErrorKind::NotActive,
            message: "no active transaction".to_string(),
        }
    }
}

impl Error {
    /// Was this a transient lock conflict (deadlock or lock wait timeout)?
    /// The engine itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Driver(d)
                if matches!(d.kind, DriverErrorKind::Deadlock | DriverErrorKind::LockWaitTimeout)
        )
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Error::Driver(d) if d.kind == DriverErrorKind::UniqueConstraintViolation)
    }

    pub fn is_optimistic_lock(&self) -> bool {
        matches!(self, Error::OptimisticLock(_))
    }

    pub fn validation_kind(&self) -> Option<ValidationErrorKind> {
        match self {
            Error::Validation(v) => Some(v.kind),
            _ => None,
        }
    }

    pub fn driver_kind(&self) -> Option<DriverErrorKind> {
        match self {
            Error::Driver(d) => Some(d.kind),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Validation(e) => write!(f, "Validation error: {}", e),
            Error::OptimisticLock(e) => write!(f, "Optimistic lock error: {}", e),
            Error::Driver(e) => {
                if let Some(code) = &e.code {
                    write!(f, "Driver error ({}): {}", code, e.message)
                } else {
                    write!(f, "Driver error: {}", e.message)
                }
            }
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Driver(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Validation(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ValidationError {}

impl fmt::Display for OptimisticLockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            OptimisticLockErrorKind::LockFailed => write!(
                f,
                "the optimistic lock on entity {}({}) failed",
                self.entity, self.primary_key
            ),
            OptimisticLockErrorKind::VersionMismatch => write!(
                f,
                "the optimistic lock failed, version {:?} was expected, but is actually {:?}",
                self.expected, self.actual
            ),
        }
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Validation(err)
    }
}

impl From<OptimisticLockError> for Error {
    fn from(err: OptimisticLockError) -> Self {
        Error::OptimisticLock(err)
    }
}

impl From<DriverError> for Error {
    fn from(err: DriverError) -> Self {
        Error::Driver(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

/// Result type alias for unit-of-work operations.
pub type Result<T> = std::result::Result<T, Error>;

//! Core types and traits for the unitwork persistence engine.
//!
//! This crate provides the data model the unit of work operates on:
//!
//! - [`Value`] and [`Row`] for dynamically-typed column data
//! - [`EntityMeta`] and [`MetadataStorage`] for entity descriptions
//! - [`EntityRef`] and [`Collection`] for in-memory entity graphs
//! - [`Driver`] for the persistence backend contract
//! - `Outcome` and `Cx` re-exported from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Budget, Cx, Outcome, RegionId, TaskId};

pub mod driver;
pub mod entity;
pub mod error;
pub mod metadata;
pub mod row;
pub mod value;

pub use driver::{
    CollectionDiff, Condition, Driver, Filter, FindOptions, InsertResult, IsolationLevel,
    LockMode, Payload, Platform, QueryResult, TransactionOptions,
};
pub use entity::{Collection, EntityData, EntityId, EntityRef, SnapshotMember, WeakEntityRef};
pub use error::{
    DriverError, DriverErrorKind, Error, ExceptionConverter, OptimisticLockError,
    OptimisticLockErrorKind, Result, SqlStateConverter, TransactionError, TransactionErrorKind,
    ValidationError, ValidationErrorKind,
};
pub use metadata::{
    Cascade, EntityMeta, EventType, FieldInfo, LifecycleHook, MetadataStorage, RelationInfo,
    RelationKind, ValueGenerator, is_valid_identifier,
};
pub use row::{ColumnInfo, Row};
pub use value::Value;

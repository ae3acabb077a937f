//! Persistence backend contract.
//!
//! The unit of work never builds SQL. It hands the driver an entity type, a
//! payload of column values and a filter, and the driver decides how to
//! turn that into statements for its backend.
//!
//! All operations integrate with asupersync's structured concurrency via `Cx`
//! for cancellation and timeout handling.

use std::collections::BTreeMap;
use std::sync::Arc;

use asupersync::{Cx, Outcome};
use serde::{Deserialize, Serialize};

use crate::error::{ExceptionConverter, SqlStateConverter};
use crate::metadata::EntityMeta;
use crate::row::Row;
use crate::value::Value;

/// Column values keyed by property name.
pub type Payload = BTreeMap<&'static str, Value>;

/// One predicate of a [`Filter`].
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// `field = value`
    Eq(&'static str, Value),
    /// `(fields...) IN ((keys...), ...)`
    KeysIn {
        fields: Vec<&'static str>,
        keys: Vec<Vec<Value>>,
    },
}

/// Conjunction of conditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Match a single row by primary key.
    pub fn primary_key(meta: &EntityMeta, key: &[Value]) -> Self {
        meta.primary_keys
            .iter()
            .zip(key)
            .fold(Self::new(), |filter, (name, value)| {
                filter.eq(name, value.clone())
            })
    }

    #[must_use]
    pub fn eq(mut self, field: &'static str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Eq(field, value.into()));
        self
    }

    #[must_use]
    pub fn keys_in(mut self, fields: Vec<&'static str>, keys: Vec<Vec<Value>>) -> Self {
        self.conditions.push(Condition::KeysIn { fields, keys });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}

/// Result of a single insert.
#[derive(Debug, Clone, Default)]
pub struct InsertResult {
    /// Generated primary key, if the backend produced one
    pub insert_id: Option<Value>,
    /// Server-computed columns (`RETURNING`), if the backend supports it
    pub row: Option<Row>,
}

/// Result of an update or delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryResult {
    pub affected_rows: u64,
}

/// Locking strategy for [`Driver::find_one`] and `UnitOfWork::lock`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    /// Compare the version column, no database lock
    Optimistic,
    /// `FOR SHARE`
    PessimisticRead,
    /// `FOR UPDATE`
    PessimisticWrite,
}

impl LockMode {
    pub const fn is_pessimistic(self) -> bool {
        matches!(self, LockMode::PessimisticRead | LockMode::PessimisticWrite)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FindOptions {
    pub lock_mode: Option<LockMode>,
}

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Transactions can see uncommitted changes from others.
    ReadUncommitted,

    /// Transactions only see committed changes from others.
    #[default]
    ReadCommitted,

    /// Transactions see a consistent snapshot of the database.
    RepeatableRead,

    /// Transactions appear to execute sequentially.
    Serializable,
}

impl IsolationLevel {
    /// Get the SQL syntax for this isolation level.
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionOptions {
    pub isolation: IsolationLevel,
    pub read_only: bool,
}

impl TransactionOptions {
    #[must_use]
    pub const fn isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    #[must_use]
    pub const fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }
}

/// Pivot-table changes of one owning many-to-many collection.
#[derive(Debug, Clone)]
pub struct CollectionDiff {
    pub owner: &'static str,
    pub relation: &'static str,
    pub pivot_table: &'static str,
    pub owner_key: Vec<Value>,
    pub added: Vec<Vec<Value>>,
    pub removed: Vec<Vec<Value>>,
}

impl CollectionDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Backend capabilities the flush plan depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    pub supports_transactions: bool,
    /// Can two statements swap a unique value without an intermediate conflict
    pub allows_unique_batch_updates: bool,
    /// Prefer [`Driver::native_insert_many`] over one call per row
    pub uses_batch_inserts: bool,
}

impl Default for Platform {
    fn default() -> Self {
        Self {
            supports_transactions: true,
            allows_unique_batch_updates: false,
            uses_batch_inserts: true,
        }
    }
}

/// A persistence backend.
///
/// Every operation takes an optional transaction handle; `None` means
/// autocommit. Implementations translate their native errors through
/// [`Driver::exception_converter`] before returning them.
pub trait Driver: Send + Sync {
    /// Handle for an open transaction.
    type Tx: Send + Sync;

    fn platform(&self) -> Platform {
        Platform::default()
    }

    fn exception_converter(&self) -> Arc<dyn ExceptionConverter> {
        Arc::new(SqlStateConverter)
    }

    fn native_insert(
        &self,
        cx: &Cx,
        meta: &EntityMeta,
        data: Payload,
        tx: Option<&Self::Tx>,
    ) -> impl Future<Output = Outcome<InsertResult, crate::Error>> + Send;

    /// Insert several rows of one entity type.
    ///
    /// Results are returned in input order.
    fn native_insert_many(
        &self,
        cx: &Cx,
        meta: &EntityMeta,
        data: Vec<Payload>,
        tx: Option<&Self::Tx>,
    ) -> impl Future<Output = Outcome<Vec<InsertResult>, crate::Error>> + Send {
        async move {
            let mut results = Vec::with_capacity(data.len());
            for row in data {
                match self.native_insert(cx, meta, row, tx).await {
                    Outcome::Ok(r) => results.push(r),
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
            Outcome::Ok(results)
        }
    }

    fn native_update(
        &self,
        cx: &Cx,
        meta: &EntityMeta,
        filter: Filter,
        data: Payload,
        tx: Option<&Self::Tx>,
    ) -> impl Future<Output = Outcome<QueryResult, crate::Error>> + Send;

    fn native_delete(
        &self,
        cx: &Cx,
        meta: &EntityMeta,
        filter: Filter,
        tx: Option<&Self::Tx>,
    ) -> impl Future<Output = Outcome<QueryResult, crate::Error>> + Send;

    fn find_one(
        &self,
        cx: &Cx,
        meta: &EntityMeta,
        filter: Filter,
        options: FindOptions,
        tx: Option<&Self::Tx>,
    ) -> impl Future<Output = Outcome<Option<Row>, crate::Error>> + Send;

    /// Take a database lock on one row.
    fn lock_pessimistic(
        &self,
        cx: &Cx,
        meta: &EntityMeta,
        key: &[Value],
        mode: LockMode,
        tx: &Self::Tx,
    ) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Reconcile pivot rows of an owning many-to-many collection.
    fn sync_collection(
        &self,
        cx: &Cx,
        diff: &CollectionDiff,
        tx: Option<&Self::Tx>,
    ) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    fn begin(
        &self,
        cx: &Cx,
        options: TransactionOptions,
    ) -> impl Future<Output = Outcome<Self::Tx, crate::Error>> + Send;

    fn commit(&self, cx: &Cx, tx: Self::Tx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    fn rollback(
        &self,
        cx: &Cx,
        tx: Self::Tx,
    ) -> impl Future<Output = Outcome<(), crate::Error>> + Send;
}

//! In-memory driver and entity fixtures shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};

use asupersync::runtime::{RuntimeBuilder, yield_now};
use asupersync::{Cx, Outcome};
use unitwork_core::{
    Cascade, CollectionDiff, Condition, Driver, DriverError, DriverErrorKind, EntityMeta, Error,
    ExceptionConverter, FieldInfo, Filter, FindOptions, InsertResult, LockMode, MetadataStorage,
    Payload, Platform, QueryResult, RelationInfo, Row, SqlStateConverter, TransactionOptions, Value,
};

/// Drive a future to completion on a fresh single-threaded runtime.
pub fn run<F: Future>(future: F) -> F::Output {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(future)
}

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn expect_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => panic!("expected error, got {other:?}"),
    }
}

#[derive(Default)]
struct WakeFlag(AtomicBool);

impl Wake for WakeFlag {
    fn wake(self: Arc<Self>) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// A future driven by hand, one poll at a time.
///
/// Each instance has its own waker, so a test can poll only the futures
/// that were woken, the way an executor would.
pub struct Stepped<'a, T> {
    future: Pin<Box<dyn Future<Output = T> + 'a>>,
    flag: Arc<WakeFlag>,
    waker: Waker,
    output: Option<T>,
    done: bool,
}

impl<'a, T> Stepped<'a, T> {
    pub fn new(future: impl Future<Output = T> + 'a) -> Self {
        let flag = Arc::new(WakeFlag::default());
        Self {
            future: Box::pin(future),
            waker: Waker::from(Arc::clone(&flag)),
            flag,
            output: None,
            done: false,
        }
    }

    /// Poll once; `true` when the future has finished.
    pub fn step(&mut self) -> bool {
        if self.done {
            return true;
        }
        let mut context = Context::from_waker(&self.waker);
        if let Poll::Ready(output) = self.future.as_mut().poll(&mut context) {
            self.output = Some(output);
            self.done = true;
        }
        self.done
    }

    /// Was the waker fired since the last call?
    pub fn woken(&self) -> bool {
        self.flag.0.swap(false, Ordering::SeqCst)
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn take_output(&mut self) -> T {
        self.output.take().expect("future has finished")
    }
}

/// One call the unit of work made against the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Insert { table: &'static str, row: Payload },
    Update { table: &'static str, data: Payload },
    Delete { table: &'static str, rows: usize },
    Sync { pivot: &'static str, added: usize, removed: usize },
    Lock { table: &'static str, mode: LockMode },
    Begin,
    Commit,
    Rollback,
}

impl Statement {
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Statement::Insert { .. }
                | Statement::Update { .. }
                | Statement::Delete { .. }
                | Statement::Sync { .. }
        )
    }

    /// Short `op:table` label used in ordering assertions.
    pub fn label(&self) -> String {
        match self {
            Statement::Insert { table, .. } => format!("insert:{table}"),
            Statement::Update { table, .. } => format!("update:{table}"),
            Statement::Delete { table, .. } => format!("delete:{table}"),
            Statement::Sync { pivot, .. } => format!("sync:{pivot}"),
            Statement::Lock { table, .. } => format!("lock:{table}"),
            Statement::Begin => "begin".to_string(),
            Statement::Commit => "commit".to_string(),
            Statement::Rollback => "rollback".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Insert,
    Update,
    Delete,
}

type Tables = HashMap<&'static str, HashMap<String, Payload>>;
type Pivots = HashMap<&'static str, BTreeSet<(String, String)>>;

#[derive(Debug, Default)]
pub struct MemoryState {
    pub tables: Tables,
    pub pivots: Pivots,
    pub statements: Vec<Statement>,
    next_id: i64,
    backup: Option<(Tables, Pivots, i64)>,
    fail_on: Option<(Op, &'static str)>,
    stall_after: Option<usize>,
    yield_on_insert: bool,
}

/// Driver keeping rows in hash maps.
///
/// Enforces unique groups and to-one foreign keys (on write and on delete)
/// so ordering mistakes surface as constraint violations.
#[derive(Debug, Clone)]
pub struct MemoryDriver {
    state: Arc<Mutex<MemoryState>>,
    metadata: Arc<MetadataStorage>,
    platform: Platform,
}

fn key_of(meta: &EntityMeta, row: &Payload) -> String {
    meta.primary_keys
        .iter()
        .map(|pk| row.get(pk).cloned().unwrap_or(Value::Null).key_fragment())
        .collect::<Vec<_>>()
        .join("~~~")
}

fn matches(row: &Payload, filter: &Filter) -> bool {
    filter.conditions.iter().all(|condition| match condition {
        Condition::Eq(field, value) => {
            row.get(field).cloned().unwrap_or(Value::Null).key_fragment() == value.key_fragment()
        }
        Condition::KeysIn { fields, keys } => keys.iter().any(|key| {
            fields.iter().zip(key).all(|(field, value)| {
                row.get(field).cloned().unwrap_or(Value::Null).key_fragment()
                    == value.key_fragment()
            })
        }),
    })
}

fn violation(code: &str, message: String) -> Error {
    Error::Driver(SqlStateConverter.to_error(Some(code), &message))
}

impl MemoryDriver {
    pub fn new(metadata: Arc<MetadataStorage>) -> Self {
        Self::with_platform(metadata, Platform::default())
    }

    pub fn with_platform(metadata: Arc<MetadataStorage>, platform: Platform) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                next_id: 1,
                ..MemoryState::default()
            })),
            metadata,
            platform,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().expect("lock poisoned")
    }

    pub fn statements(&self) -> Vec<Statement> {
        self.lock().statements.clone()
    }

    pub fn writes(&self) -> Vec<Statement> {
        self.statements().into_iter().filter(Statement::is_write).collect()
    }

    pub fn write_labels(&self) -> Vec<String> {
        self.writes().iter().map(Statement::label).collect()
    }

    pub fn clear_log(&self) {
        self.lock().statements.clear();
    }

    pub fn row(&self, table: &str, key: &[Value]) -> Option<Payload> {
        let key = key
            .iter()
            .map(Value::key_fragment)
            .collect::<Vec<_>>()
            .join("~~~");
        self.lock().tables.get(table).and_then(|t| t.get(&key).cloned())
    }

    pub fn count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map_or(0, HashMap::len)
    }

    pub fn pivot_len(&self, pivot: &str) -> usize {
        self.lock().pivots.get(pivot).map_or(0, BTreeSet::len)
    }

    /// Write a row directly, bypassing every check.
    pub fn seed(&self, table: &'static str, entity: &str, row: Payload) {
        let meta = self.metadata.get(entity).expect("seeded entity is registered");
        let key = key_of(&meta, &row);
        self.lock().tables.entry(table).or_default().insert(key, row);
    }

    /// Change one column of a stored row, as a concurrent writer would.
    pub fn tamper(&self, table: &str, key: &[Value], column: &'static str, value: Value) {
        let key = key
            .iter()
            .map(Value::key_fragment)
            .collect::<Vec<_>>()
            .join("~~~");
        if let Some(row) = self.lock().tables.get_mut(table).and_then(|t| t.get_mut(&key)) {
            row.insert(column, value);
        }
    }

    /// Make the next `op` against `table` fail.
    pub fn fail_next(&self, op: Op, table: &'static str) {
        self.lock().fail_on = Some((op, table));
    }

    /// Let `count` more inserts through; later inserts never complete.
    pub fn stall_inserts_after(&self, count: usize) {
        self.lock().stall_after = Some(count);
    }

    pub fn resume_inserts(&self) {
        self.lock().stall_after = None;
    }

    /// Make every insert yield to the scheduler once before it completes.
    pub fn yield_on_insert(&self, enabled: bool) {
        self.lock().yield_on_insert = enabled;
    }

    fn injected(state: &mut MemoryState, op: Op, table: &'static str) -> Result<(), Error> {
        if state.fail_on == Some((op, table)) {
            state.fail_on = None;
            return Err(Error::Driver(DriverError::new(
                DriverErrorKind::Connection,
                format!("injected failure on {table}"),
            )));
        }
        Ok(())
    }

    fn check_row(&self, state: &MemoryState, meta: &EntityMeta, key: &str, row: &Payload) -> Result<(), Error> {
        let table = state.tables.get(meta.table);
        for group in meta.unique_properties() {
            let values: Vec<String> = group
                .iter()
                .map(|p| row.get(p).cloned().unwrap_or(Value::Null))
                .filter(|v| !v.is_null())
                .map(|v| v.key_fragment())
                .collect();
            if values.len() != group.len() {
                continue;
            }
            let taken = table.is_some_and(|rows| {
                rows.iter().any(|(other_key, other)| {
                    other_key != key
                        && group
                            .iter()
                            .map(|p| other.get(p).cloned().unwrap_or(Value::Null).key_fragment())
                            .eq(values.iter().cloned())
                })
            });
            if taken {
                return Err(violation(
                    "23505",
                    format!("duplicate key on {}({})", meta.table, group.join(", ")),
                ));
            }
        }
        for rel in meta.relations.iter().filter(|r| r.is_to_one_owner()) {
            let Some(value) = row.get(rel.name).filter(|v| !v.is_null()) else {
                continue;
            };
            let Some(target) = self.metadata.find(rel.target) else {
                continue;
            };
            let exists = state
                .tables
                .get(target.table)
                .is_some_and(|rows| rows.contains_key(&value.key_fragment()));
            if !exists {
                return Err(violation(
                    "23503",
                    format!("{}.{} references missing {}", meta.table, rel.name, target.table),
                ));
            }
        }
        Ok(())
    }

    fn check_not_referenced(&self, state: &MemoryState, meta: &EntityMeta, key: &str) -> Result<(), Error> {
        for other in self.metadata.iter() {
            for rel in other.relations.iter().filter(|r| r.is_to_one_owner()) {
                if rel.target != meta.name {
                    continue;
                }
                let referenced = state.tables.get(other.table).is_some_and(|rows| {
                    rows.values().any(|row| {
                        row.get(rel.name)
                            .is_some_and(|v| !v.is_null() && v.key_fragment() == key)
                    })
                });
                if referenced {
                    return Err(violation(
                        "23503",
                        format!("{} is still referenced by {}.{}", meta.table, other.table, rel.name),
                    ));
                }
            }
        }
        Ok(())
    }

    fn insert_row(&self, meta: &EntityMeta, mut row: Payload) -> Result<InsertResult, Error> {
        let mut state = self.lock();
        state.statements.push(Statement::Insert {
            table: meta.table,
            row: row.clone(),
        });
        Self::injected(&mut state, Op::Insert, meta.table)?;

        let mut insert_id = None;
        if let Some(pk) = meta.generated_primary_key() {
            if row.get(pk).is_none_or(Value::is_null) {
                let id = Value::BigInt(state.next_id);
                state.next_id += 1;
                row.insert(pk, id.clone());
                insert_id = Some(id);
            }
        }
        let key = key_of(meta, &row);
        if state.tables.get(meta.table).is_some_and(|t| t.contains_key(&key)) {
            return Err(violation("23505", format!("duplicate primary key on {}", meta.table)));
        }
        self.check_row(&state, meta, &key, &row)?;
        state.tables.entry(meta.table).or_default().insert(key, row);
        Ok(InsertResult {
            insert_id,
            row: None,
        })
    }

    fn update_rows(&self, meta: &EntityMeta, filter: &Filter, data: Payload) -> Result<QueryResult, Error> {
        let mut state = self.lock();
        state.statements.push(Statement::Update {
            table: meta.table,
            data: data.clone(),
        });
        Self::injected(&mut state, Op::Update, meta.table)?;

        let keys: Vec<String> = state
            .tables
            .get(meta.table)
            .map(|rows| {
                rows.iter()
                    .filter(|(_, row)| matches(row, filter))
                    .map(|(key, _)| key.clone())
                    .collect()
            })
            .unwrap_or_default();
        for key in &keys {
            let Some(mut row) = state.tables.get(meta.table).and_then(|t| t.get(key)).cloned() else {
                continue;
            };
            row.extend(data.iter().map(|(k, v)| (*k, v.clone())));
            self.check_row(&state, meta, key, &row)?;
            if let Some(rows) = state.tables.get_mut(meta.table) {
                rows.insert(key.clone(), row);
            }
        }
        Ok(QueryResult {
            affected_rows: keys.len() as u64,
        })
    }

    fn delete_rows(&self, meta: &EntityMeta, filter: &Filter) -> Result<QueryResult, Error> {
        let mut state = self.lock();
        Self::injected(&mut state, Op::Delete, meta.table)?;
        let keys: Vec<String> = state
            .tables
            .get(meta.table)
            .map(|rows| {
                rows.iter()
                    .filter(|(_, row)| matches(row, filter))
                    .map(|(key, _)| key.clone())
                    .collect()
            })
            .unwrap_or_default();
        state.statements.push(Statement::Delete {
            table: meta.table,
            rows: keys.len(),
        });
        for key in &keys {
            if let Some(rows) = state.tables.get_mut(meta.table) {
                rows.remove(key);
            }
        }
        for key in &keys {
            self.check_not_referenced(&state, meta, key)?;
        }
        Ok(QueryResult {
            affected_rows: keys.len() as u64,
        })
    }
}

impl Driver for MemoryDriver {
    type Tx = u64;

    fn platform(&self) -> Platform {
        self.platform
    }

    fn native_insert(
        &self,
        _cx: &Cx,
        meta: &EntityMeta,
        data: Payload,
        _tx: Option<&Self::Tx>,
    ) -> impl Future<Output = Outcome<InsertResult, Error>> + Send {
        let (stalled, pause) = {
            let mut state = self.lock();
            let stalled = match state.stall_after.as_mut() {
                Some(0) => true,
                Some(left) => {
                    *left -= 1;
                    false
                }
                None => false,
            };
            (stalled, state.yield_on_insert)
        };
        let result = (!stalled).then(|| self.insert_row(meta, data));
        async move {
            let Some(result) = result else {
                return std::future::pending().await;
            };
            if pause {
                yield_now().await;
            }
            match result {
                Ok(r) => Outcome::Ok(r),
                Err(e) => Outcome::Err(e),
            }
        }
    }

    fn native_update(
        &self,
        _cx: &Cx,
        meta: &EntityMeta,
        filter: Filter,
        data: Payload,
        _tx: Option<&Self::Tx>,
    ) -> impl Future<Output = Outcome<QueryResult, Error>> + Send {
        let result = self.update_rows(meta, &filter, data);
        async move {
            match result {
                Ok(r) => Outcome::Ok(r),
                Err(e) => Outcome::Err(e),
            }
        }
    }

    fn native_delete(
        &self,
        _cx: &Cx,
        meta: &EntityMeta,
        filter: Filter,
        _tx: Option<&Self::Tx>,
    ) -> impl Future<Output = Outcome<QueryResult, Error>> + Send {
        let result = self.delete_rows(meta, &filter);
        async move {
            match result {
                Ok(r) => Outcome::Ok(r),
                Err(e) => Outcome::Err(e),
            }
        }
    }

    fn find_one(
        &self,
        _cx: &Cx,
        meta: &EntityMeta,
        filter: Filter,
        _options: FindOptions,
        _tx: Option<&Self::Tx>,
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send {
        let row = self.lock().tables.get(meta.table).and_then(|rows| {
            rows.values()
                .find(|row| matches(row, &filter))
                .map(|row| Row::from_pairs(row.iter().map(|(k, v)| (*k, v.clone()))))
        });
        async move { Outcome::Ok(row) }
    }

    fn lock_pessimistic(
        &self,
        _cx: &Cx,
        meta: &EntityMeta,
        _key: &[Value],
        mode: LockMode,
        _tx: &Self::Tx,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.lock().statements.push(Statement::Lock {
            table: meta.table,
            mode,
        });
        async { Outcome::Ok(()) }
    }

    fn sync_collection(
        &self,
        _cx: &Cx,
        diff: &CollectionDiff,
        _tx: Option<&Self::Tx>,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let owner = Value::Array(diff.owner_key.clone()).key_fragment();
        let mut state = self.lock();
        state.statements.push(Statement::Sync {
            pivot: diff.pivot_table,
            added: diff.added.len(),
            removed: diff.removed.len(),
        });
        let pivot = state.pivots.entry(diff.pivot_table).or_default();
        for key in &diff.removed {
            pivot.remove(&(owner.clone(), Value::Array(key.clone()).key_fragment()));
        }
        for key in &diff.added {
            pivot.insert((owner.clone(), Value::Array(key.clone()).key_fragment()));
        }
        drop(state);
        async { Outcome::Ok(()) }
    }

    fn begin(
        &self,
        _cx: &Cx,
        _options: TransactionOptions,
    ) -> impl Future<Output = Outcome<Self::Tx, Error>> + Send {
        let mut state = self.lock();
        state.statements.push(Statement::Begin);
        state.backup = Some((state.tables.clone(), state.pivots.clone(), state.next_id));
        let id = state.statements.len() as u64;
        drop(state);
        async move { Outcome::Ok(id) }
    }

    fn commit(&self, _cx: &Cx, _tx: Self::Tx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let mut state = self.lock();
        state.statements.push(Statement::Commit);
        state.backup = None;
        drop(state);
        async { Outcome::Ok(()) }
    }

    fn rollback(&self, _cx: &Cx, _tx: Self::Tx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let mut state = self.lock();
        state.statements.push(Statement::Rollback);
        if let Some((tables, pivots, next_id)) = state.backup.take() {
            state.tables = tables;
            state.pivots = pivots;
            state.next_id = next_id;
        }
        drop(state);
        async { Outcome::Ok(()) }
    }
}

// ============================================================================
// Entity fixtures
// ============================================================================

/// Authors, books, tags and users:
///
/// - `Author.books` is the inverse of `Book.author`, cascading persist and
///   remove with orphan removal
/// - `Book.tags` is an owning many-to-many through `book_tags`
/// - `User.email` is unique, `User.nickname` nullable unique, `User.version`
///   an optimistic-lock column
pub fn library() -> Arc<MetadataStorage> {
    let author = EntityMeta::new("Author")
        .table("authors")
        .field(FieldInfo::new("id").primary_key(true).generated(true))
        .field(FieldInfo::new("name"))
        .relation(
            RelationInfo::one_to_many("books", "Book", "author")
                .cascade(Cascade::PERSIST.union(Cascade::REMOVE))
                .orphan_removal(true),
        );
    let book = EntityMeta::new("Book")
        .table("books")
        .field(FieldInfo::new("id").primary_key(true).generated(true))
        .field(FieldInfo::new("title"))
        .relation(RelationInfo::many_to_one("author", "Author").inversed_by("books"))
        .relation(RelationInfo::many_to_many("tags", "Tag", "book_tags"));
    let tag = EntityMeta::new("Tag")
        .table("tags")
        .field(FieldInfo::new("id").primary_key(true).generated(true))
        .field(FieldInfo::new("label"));
    let user = EntityMeta::new("User")
        .table("users")
        .field(FieldInfo::new("id").primary_key(true).generated(true))
        .field(FieldInfo::new("email").unique(true))
        .field(FieldInfo::new("nickname").unique(true).nullable(true))
        .field(FieldInfo::new("version").version(true));
    Arc::new(MetadataStorage::build([author, book, tag, user]).expect("valid metadata"))
}

/// Two entity types referencing each other: `Employee.manager` is a nullable
/// self-reference and `Department.head`/`Employee.department` form a cycle.
pub fn company() -> Arc<MetadataStorage> {
    let department = EntityMeta::new("Department")
        .table("departments")
        .field(FieldInfo::new("id").primary_key(true).generated(true))
        .field(FieldInfo::new("name"))
        .relation(RelationInfo::many_to_one("head", "Employee").nullable(true));
    let employee = EntityMeta::new("Employee")
        .table("employees")
        .field(FieldInfo::new("id").primary_key(true).generated(true))
        .field(FieldInfo::new("name"))
        .relation(RelationInfo::many_to_one("department", "Department"))
        .relation(RelationInfo::many_to_one("manager", "Employee").nullable(true));
    Arc::new(MetadataStorage::build([department, employee]).expect("valid metadata"))
}

pub fn meta(storage: &MetadataStorage, name: &str) -> Arc<EntityMeta> {
    storage.get(name).expect("registered entity")
}

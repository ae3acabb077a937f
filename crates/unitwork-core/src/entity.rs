//! Entity handles and relation collections.
//!
//! An entity is application-owned state behind an [`EntityRef`]. The unit of
//! work only ever holds [`WeakEntityRef`]s in its identity map, and the inverse
//! side of a bidirectional relation is stored weakly as well, so a parent and
//! its children never own each other.
//!
//! ```ignore
//! let author = EntityRef::new(&author_meta).with("name", "A");
//! let book = EntityRef::new(&book_meta).with("title", "T");
//! book.link_reference("author", Some(&author))?;   // also adds book to author.books
//! assert_eq!(author.collection_items("books").len(), 1);
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Result, ValidationError};
use crate::metadata::{EntityMeta, RelationInfo};
use crate::value::Value;

static NEXT_ENTITY_ID: AtomicU64 = AtomicU64::new(1);
static NULL: Value = Value::Null;

/// Process-unique identity of an in-memory entity instance.
///
/// Stable for the lifetime of the instance, independent of its primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(u64);

impl EntityId {
    fn next() -> Self {
        EntityId(NEXT_ENTITY_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

/// A to-one link. Owning sides hold the target; inverse sides only look it up.
#[derive(Debug, Clone)]
enum Link {
    Owned(EntityRef),
    Inverse(WeakEntityRef),
}

impl Link {
    fn upgrade(&self) -> Option<EntityRef> {
        match self {
            Link::Owned(e) => Some(e.clone()),
            Link::Inverse(w) => w.upgrade(),
        }
    }
}

#[derive(Debug, Clone)]
enum Member {
    Owned(EntityRef),
    Linked(WeakEntityRef),
}

impl Member {
    fn id(&self) -> EntityId {
        match self {
            Member::Owned(e) => e.id(),
            Member::Linked(w) => w.id(),
        }
    }

    fn upgrade(&self) -> Option<EntityRef> {
        match self {
            Member::Owned(e) => Some(e.clone()),
            Member::Linked(w) => w.upgrade(),
        }
    }
}

/// Member recorded in a collection snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotMember {
    pub id: EntityId,
    pub key: Vec<Value>,
}

/// A to-many relation property.
#[derive(Debug, Clone)]
pub struct Collection {
    property: &'static str,
    owning: bool,
    orphan_removal: bool,
    members: Vec<Member>,
    snapshot: Option<Vec<SnapshotMember>>,
    orphans: Vec<EntityRef>,
    initialized: bool,
}

impl Collection {
    fn new(relation: &RelationInfo, initialized: bool) -> Self {
        Self {
            property: relation.name,
            owning: relation.owner,
            orphan_removal: relation.orphan_removal,
            members: Vec::new(),
            snapshot: None,
            orphans: Vec::new(),
            initialized,
        }
    }

    pub fn property(&self) -> &'static str {
        self.property
    }

    /// Owning collections keep their members alive.
    pub fn is_owning(&self) -> bool {
        self.owning
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn set_initialized(&mut self, value: bool) {
        self.initialized = value;
    }

    /// Live members in insertion order.
    pub fn items(&self) -> Vec<EntityRef> {
        self.members.iter().filter_map(Member::upgrade).collect()
    }

    pub fn len(&self) -> usize {
        self.members.iter().filter_map(Member::upgrade).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, item: &EntityRef) -> bool {
        self.members.iter().any(|m| m.id() == item.id())
    }

    fn push(&mut self, item: &EntityRef) -> bool {
        if self.contains(item) {
            return false;
        }
        let member = if self.owning {
            Member::Owned(item.clone())
        } else {
            Member::Linked(item.downgrade())
        };
        self.members.push(member);
        self.orphans.retain(|o| o.id() != item.id());
        true
    }

    fn remove(&mut self, item: &EntityRef, record_orphan: bool) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m.id() != item.id());
        let removed = self.members.len() != before;
        if removed && record_orphan && self.orphan_removal {
            self.orphans.push(item.clone());
        }
        removed
    }

    /// Members added or removed since the last snapshot.
    pub fn is_dirty(&self) -> bool {
        match &self.snapshot {
            None => !self.members.is_empty(),
            Some(snapshot) => {
                let current: HashSet<EntityId> = self.members.iter().map(Member::id).collect();
                let previous: HashSet<EntityId> = snapshot.iter().map(|m| m.id).collect();
                current != previous
            }
        }
    }

    /// Live members not present in the snapshot.
    pub fn added(&self) -> Vec<EntityRef> {
        let previous: HashSet<EntityId> = self
            .snapshot
            .iter()
            .flatten()
            .map(|m| m.id)
            .collect();
        self.items()
            .into_iter()
            .filter(|e| !previous.contains(&e.id()))
            .collect()
    }

    /// Snapshot members no longer present.
    pub fn removed(&self) -> Vec<SnapshotMember> {
        let current: HashSet<EntityId> = self.members.iter().map(Member::id).collect();
        self.snapshot
            .iter()
            .flatten()
            .filter(|m| !current.contains(&m.id))
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Option<&[SnapshotMember]> {
        self.snapshot.as_deref()
    }

    pub fn set_snapshot(&mut self, members: Vec<SnapshotMember>) {
        self.members.retain(|m| m.upgrade().is_some());
        self.snapshot = Some(members);
    }

    /// Drain members removed from an orphan-removal collection.
    pub fn take_orphans(&mut self) -> Vec<EntityRef> {
        std::mem::take(&mut self.orphans)
    }
}

/// Mutable state of one entity.
#[derive(Debug, Clone, Default)]
pub struct EntityData {
    values: BTreeMap<&'static str, Value>,
    links: BTreeMap<&'static str, Link>,
    collections: BTreeMap<&'static str, Collection>,
    schema: Option<String>,
    initialized: bool,
}

impl EntityData {
    /// Field value, `Value::Null` when unset.
    pub fn get(&self, field: &str) -> &Value {
        self.values.get(field).unwrap_or(&NULL)
    }

    pub fn set(&mut self, field: &'static str, value: impl Into<Value>) {
        self.values.insert(field, value.into());
    }

    pub fn values(&self) -> impl Iterator<Item = (&'static str, &Value)> {
        self.values.iter().map(|(k, v)| (*k, v))
    }

    pub fn reference(&self, relation: &str) -> Option<EntityRef> {
        self.links.get(relation).and_then(Link::upgrade)
    }

    pub fn collection(&self, relation: &str) -> Option<&Collection> {
        self.collections.get(relation)
    }

    pub fn collection_mut(&mut self, relation: &str) -> Option<&mut Collection> {
        self.collections.get_mut(relation)
    }

    pub fn collections_mut(&mut self) -> impl Iterator<Item = &mut Collection> {
        self.collections.values_mut()
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn set_schema(&mut self, schema: Option<String>) {
        self.schema = schema;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn set_initialized(&mut self, value: bool) {
        self.initialized = value;
        for collection in self.collections.values_mut() {
            collection.initialized = value;
        }
    }
}

struct EntityCell {
    id: EntityId,
    meta: Arc<EntityMeta>,
    data: RwLock<EntityData>,
}

/// Shared handle to an entity instance.
///
/// Equality and hashing use instance identity, never field values.
#[derive(Clone)]
pub struct EntityRef {
    cell: Arc<EntityCell>,
}

/// Non-owning handle used by the identity map and inverse relation sides.
#[derive(Clone)]
pub struct WeakEntityRef {
    cell: Weak<EntityCell>,
    id: EntityId,
}

impl WeakEntityRef {
    pub fn upgrade(&self) -> Option<EntityRef> {
        self.cell.upgrade().map(|cell| EntityRef { cell })
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.cell.strong_count() > 0
    }
}

impl fmt::Debug for WeakEntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WeakEntityRef({})", self.id.0)
    }
}

impl EntityRef {
    /// Create a new, initialized entity with empty collections.
    pub fn new(meta: &Arc<EntityMeta>) -> Self {
        Self::create(meta, true)
    }

    /// Create an uninitialized reference that only knows its primary key.
    pub fn reference(meta: &Arc<EntityMeta>, primary_key: &[Value]) -> Self {
        let entity = Self::create(meta, false);
        {
            let mut data = entity.write();
            for (name, value) in meta.primary_keys.iter().zip(primary_key) {
                data.set(name, value.clone());
            }
        }
        entity
    }

    fn create(meta: &Arc<EntityMeta>, initialized: bool) -> Self {
        let collections = meta
            .relations
            .iter()
            .filter(|r| r.is_collection())
            .map(|r| (r.name, Collection::new(r, initialized)))
            .collect();
        let data = EntityData {
            values: BTreeMap::new(),
            links: BTreeMap::new(),
            collections,
            schema: meta.schema.map(str::to_string),
            initialized,
        };
        Self {
            cell: Arc::new(EntityCell {
                id: EntityId::next(),
                meta: Arc::clone(meta),
                data: RwLock::new(data),
            }),
        }
    }

    /// Builder-style field assignment.
    pub fn with(self, field: &'static str, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    pub fn id(&self) -> EntityId {
        self.cell.id
    }

    pub fn meta(&self) -> &Arc<EntityMeta> {
        &self.cell.meta
    }

    pub fn name(&self) -> &'static str {
        self.cell.meta.name
    }

    pub fn root(&self) -> &'static str {
        self.cell.meta.root
    }

    pub fn read(&self) -> RwLockReadGuard<'_, EntityData> {
        self.cell.data.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, EntityData> {
        self.cell.data.write()
    }

    pub fn get(&self, field: &str) -> Value {
        self.read().get(field).clone()
    }

    pub fn set(&self, field: &'static str, value: impl Into<Value>) {
        self.write().set(field, value);
    }

    pub fn schema(&self) -> Option<String> {
        self.read().schema.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.read().initialized
    }

    /// Primary key values in declaration order, `None` while any part is unset.
    pub fn primary_key(&self) -> Option<Vec<Value>> {
        let data = self.read();
        let values: Vec<Value> = self
            .cell
            .meta
            .primary_keys
            .iter()
            .map(|pk| data.get(pk).clone())
            .collect();
        if values.is_empty() || values.iter().any(Value::is_null) {
            None
        } else {
            Some(values)
        }
    }

    pub fn has_primary_key(&self) -> bool {
        self.primary_key().is_some()
    }

    /// Primary key as a single value; composite keys become `Value::Array`.
    pub fn primary_key_value(&self) -> Option<Value> {
        let mut pk = self.primary_key()?;
        if pk.len() == 1 {
            pk.pop()
        } else {
            Some(Value::Array(pk))
        }
    }

    /// Strip the primary key (used after the row is deleted).
    pub fn clear_primary_key(&self) {
        let mut data = self.write();
        for pk in &self.cell.meta.primary_keys {
            data.values.insert(pk, Value::Null);
        }
    }

    pub fn get_reference(&self, relation: &str) -> Option<EntityRef> {
        self.read().reference(relation)
    }

    pub fn collection_items(&self, relation: &str) -> Vec<EntityRef> {
        self.read()
            .collection(relation)
            .map(Collection::items)
            .unwrap_or_default()
    }

    pub fn downgrade(&self) -> WeakEntityRef {
        WeakEntityRef {
            cell: Arc::downgrade(&self.cell),
            id: self.cell.id,
        }
    }

    pub fn ptr_eq(&self, other: &EntityRef) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    fn relation(&self, name: &str) -> Result<&RelationInfo> {
        self.cell
            .meta
            .get_relation(name)
            .ok_or_else(|| ValidationError::unknown_property(self.name(), name).into())
    }

    /// Set a to-one link without touching the other side.
    pub fn set_link_raw(&self, relation: &str, target: Option<&EntityRef>) -> Result<()> {
        let rel = *self.relation(relation)?;
        let mut data = self.write();
        match target {
            Some(t) if rel.owner => {
                data.links.insert(rel.name, Link::Owned(t.clone()));
            }
            Some(t) => {
                data.links.insert(rel.name, Link::Inverse(t.downgrade()));
            }
            None => {
                data.links.remove(rel.name);
            }
        }
        Ok(())
    }

    fn push_member(&self, relation: &str, item: &EntityRef) -> bool {
        self.write()
            .collections
            .get_mut(relation)
            .is_some_and(|c| c.push(item))
    }

    /// Remove a collection member without touching the other side.
    pub fn remove_member_raw(&self, relation: &str, item: &EntityRef) -> bool {
        self.write()
            .collections
            .get_mut(relation)
            .is_some_and(|c| c.remove(item, false))
    }

    /// Set a to-one relation and keep the other side of the pair in sync.
    pub fn link_reference(&self, relation: &str, target: Option<&EntityRef>) -> Result<()> {
        let rel = *self.relation(relation)?;
        if !rel.is_to_one() {
            return Err(ValidationError::invalid_metadata(
                self.name(),
                format!("'{}.{}' is not a to-one relation", self.name(), relation),
            )
            .into());
        }
        let previous = self.get_reference(relation);
        if let (Some(p), Some(t)) = (&previous, target) {
            if p.ptr_eq(t) {
                return Ok(());
            }
        }
        self.set_link_raw(relation, target)?;

        let Some(other) = rel.counterpart() else {
            return Ok(());
        };
        if let Some(previous) = previous {
            previous.detach_counterpart(other, self);
        }
        if let Some(target) = target {
            target.attach_counterpart(other, self)?;
        }
        Ok(())
    }

    /// Add to a collection and keep the other side of the pair in sync.
    pub fn add_to_collection(&self, relation: &str, item: &EntityRef) -> Result<()> {
        let rel = *self.relation(relation)?;
        if !rel.is_collection() {
            return Err(ValidationError::invalid_metadata(
                self.name(),
                format!("'{}.{}' is not a collection", self.name(), relation),
            )
            .into());
        }
        if !self.push_member(relation, item) {
            return Ok(());
        }
        if let Some(other) = rel.counterpart() {
            item.attach_counterpart(other, self)?;
        }
        Ok(())
    }

    /// Remove from a collection and keep the other side of the pair in sync.
    ///
    /// Members removed from an orphan-removal collection are retained until
    /// the next flush schedules them for deletion.
    pub fn remove_from_collection(&self, relation: &str, item: &EntityRef) -> Result<()> {
        let rel = *self.relation(relation)?;
        let removed = self
            .write()
            .collections
            .get_mut(relation)
            .is_some_and(|c| c.remove(item, true));
        if removed {
            if let Some(other) = rel.counterpart() {
                item.detach_counterpart(other, self);
            }
        }
        Ok(())
    }

    fn attach_counterpart(&self, property: &str, owner: &EntityRef) -> Result<()> {
        let Some(rel) = self.cell.meta.get_relation(property).copied() else {
            return Ok(());
        };
        if rel.is_collection() {
            self.push_member(property, owner);
            return Ok(());
        }
        let previous = self.get_reference(property);
        if let Some(previous) = previous {
            if previous.ptr_eq(owner) {
                return Ok(());
            }
            // the displaced owner no longer points here
            if let Some(back) = rel.counterpart() {
                previous.detach_counterpart(back, self);
            }
        }
        self.set_link_raw(property, Some(owner))
    }

    fn detach_counterpart(&self, property: &str, owner: &EntityRef) {
        let Some(rel) = self.cell.meta.get_relation(property).copied() else {
            return;
        };
        if rel.is_collection() {
            self.remove_member_raw(property, owner);
        } else if self
            .get_reference(property)
            .is_some_and(|current| current.ptr_eq(owner))
        {
            let _ = self.set_link_raw(property, None);
        }
    }

    /// Copy scalar values and owning links from `source` onto this instance.
    pub fn copy_state_from(&self, source: &EntityRef) {
        if self.ptr_eq(source) {
            return;
        }
        let (values, links, schema) = {
            let src = source.read();
            let links: Vec<(&'static str, EntityRef)> = src
                .links
                .iter()
                .filter_map(|(k, l)| match l {
                    Link::Owned(e) => Some((*k, e.clone())),
                    Link::Inverse(_) => None,
                })
                .collect();
            (src.values.clone(), links, src.schema.clone())
        };
        let mut data = self.write();
        data.values.extend(values);
        for (name, target) in links {
            data.links.insert(name, Link::Owned(target));
        }
        if data.schema.is_none() {
            data.schema = schema;
        }
        data.initialized = true;
    }
}

impl PartialEq for EntityRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for EntityRef {}

impl Hash for EntityRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.cell.id.hash(state);
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pk = self.cell.data.try_read().map(|data| {
            self.cell
                .meta
                .primary_keys
                .iter()
                .map(|pk| data.get(pk).key_fragment())
                .collect::<Vec<_>>()
                .join("~~~")
        });
        match pk {
            Some(pk) => write!(f, "{}#{}({})", self.name(), self.cell.id.0, pk),
            None => write!(f, "{}#{}(<locked>)", self.name(), self.cell.id.0),
        }
    }
}

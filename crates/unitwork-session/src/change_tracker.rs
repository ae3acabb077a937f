//! Snapshot-based change tracking.
//!
//! A snapshot is the comparable state of an entity as of its last load or
//! successful flush: persisted scalar fields, the primary keys of owning
//! to-one targets, and the member keys of inline collections. Diffing the
//! live comparable state against it yields exactly the columns to write.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use unitwork_core::{EntityId, EntityRef, Payload, SnapshotMember, Value};

/// Comparable state of one entity.
pub type EntityState = BTreeMap<&'static str, Value>;

/// Compute the comparable state of an entity from its live data.
///
/// A to-one target without a primary key contributes `Null`; the change-set
/// computer records it as a pending reference instead.
pub fn comparable_state(entity: &EntityRef) -> EntityState {
    let meta = entity.meta();
    let mut state = EntityState::new();
    let (references, inline) = {
        let data = entity.read();
        for field in meta.fields.iter().filter(|f| f.persist) {
            state.insert(field.name, data.get(field.name).clone());
        }
        let references: Vec<(&'static str, Option<EntityRef>)> = meta
            .relations
            .iter()
            .filter(|r| r.is_to_one_owner() && r.persist)
            .map(|r| (r.name, data.reference(r.name)))
            .collect();
        let inline: Vec<(&'static str, Vec<EntityRef>)> = meta
            .relations
            .iter()
            .filter(|r| r.is_inline_collection() && r.persist)
            .map(|r| {
                let items = data.collection(r.name).map(|c| c.items()).unwrap_or_default();
                (r.name, items)
            })
            .collect();
        (references, inline)
    };
    // targets are read after releasing this entity's lock
    for (name, target) in references {
        let value = target
            .and_then(|t| t.primary_key_value())
            .unwrap_or(Value::Null);
        state.insert(name, value);
    }
    for (name, items) in inline {
        let keys = items
            .iter()
            .filter_map(EntityRef::primary_key_value)
            .collect();
        state.insert(name, Value::Array(keys));
    }
    state
}

/// Properties whose value differs between `original` and `current`.
pub fn diff(original: &EntityState, current: &EntityState) -> Payload {
    current
        .iter()
        .filter(|(name, value)| original.get(*name) != Some(*value))
        .map(|(name, value)| (*name, value.clone()))
        .collect()
}

/// Record the current members of every collection as its new baseline.
pub fn snapshot_collections(entity: &EntityRef) {
    let collections: Vec<(&'static str, Vec<EntityRef>)> = {
        let data = entity.read();
        entity
            .meta()
            .relations
            .iter()
            .filter(|r| r.is_collection())
            .filter_map(|r| data.collection(r.name).map(|c| (r.name, c.items())))
            .collect()
    };
    for (name, items) in collections {
        let members = items
            .iter()
            .map(|item| SnapshotMember {
                id: item.id(),
                key: item.primary_key().unwrap_or_default(),
            })
            .collect();
        if let Some(collection) = entity.write().collection_mut(name) {
            collection.set_snapshot(members);
        }
    }
}

/// Snapshot of an entity's state at a point in time.
#[derive(Debug, Clone)]
pub struct Snapshot {
    state: EntityState,
    taken_at: Instant,
}

impl Snapshot {
    pub fn new(state: EntityState) -> Self {
        Self {
            state,
            taken_at: Instant::now(),
        }
    }

    /// Get the snapshot state.
    pub fn state(&self) -> &EntityState {
        &self.state
    }

    /// Get the timestamp when the snapshot was taken.
    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }
}

/// Tracks the last persisted state of managed entities.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    snapshots: HashMap<EntityId, Snapshot>,
}

impl ChangeTracker {
    /// Create a new empty change tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a snapshot of an entity and its collections.
    #[tracing::instrument(level = "trace", skip(self, entity), fields(entity = entity.name()))]
    pub fn snapshot(&mut self, entity: &EntityRef) {
        let state = comparable_state(entity);
        tracing::trace!(fields = state.len(), "Taking entity snapshot");
        self.snapshots.insert(entity.id(), Snapshot::new(state));
        snapshot_collections(entity);
    }

    /// Install an explicit state as the baseline.
    pub fn set(&mut self, id: EntityId, state: EntityState) {
        self.snapshots.insert(id, Snapshot::new(state));
    }

    /// Overwrite one property of an existing snapshot.
    pub fn patch(&mut self, id: EntityId, property: &'static str, value: Value) {
        if let Some(snapshot) = self.snapshots.get_mut(&id) {
            snapshot.state.insert(property, value);
        }
    }

    pub fn get(&self, id: EntityId) -> Option<&Snapshot> {
        self.snapshots.get(&id)
    }

    pub fn has_snapshot(&self, id: EntityId) -> bool {
        self.snapshots.contains_key(&id)
    }

    /// Has the entity changed since its snapshot? No snapshot counts as dirty.
    pub fn is_dirty(&self, entity: &EntityRef) -> bool {
        let Some(snapshot) = self.snapshots.get(&entity.id()) else {
            return true;
        };
        let dirty = comparable_state(entity) != snapshot.state;
        tracing::trace!(entity = entity.name(), dirty, "Dirty check result");
        dirty
    }

    /// Names of properties that differ from the snapshot.
    pub fn changed_fields(&self, entity: &EntityRef) -> Vec<&'static str> {
        let current = comparable_state(entity);
        match self.snapshots.get(&entity.id()) {
            Some(snapshot) => diff(&snapshot.state, &current).into_keys().collect(),
            None => current.into_keys().collect(),
        }
    }

    /// Remove the snapshot for an entity.
    pub fn clear(&mut self, id: EntityId) {
        self.snapshots.remove(&id);
    }

    /// Remove every snapshot.
    pub fn clear_all(&mut self) {
        self.snapshots.clear();
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use unitwork_core::{EntityMeta, FieldInfo, RelationInfo};

    fn metas() -> (Arc<EntityMeta>, Arc<EntityMeta>) {
        let author = Arc::new(
            EntityMeta::new("Author")
                .field(FieldInfo::new("id").primary_key(true))
                .field(FieldInfo::new("name"))
                .field(FieldInfo::new("age"))
                .field(FieldInfo::new("display").persist(false))
                .relation(RelationInfo::one_to_many("books", "Book", "author")),
        );
        let book = Arc::new(
            EntityMeta::new("Book")
                .field(FieldInfo::new("id").primary_key(true))
                .field(FieldInfo::new("title"))
                .relation(RelationInfo::many_to_one("author", "Author").inversed_by("books"))
                .relation(RelationInfo::many_to_many_inline("co_authors", "Author")),
        );
        (author, book)
    }

    #[test]
    fn test_comparable_state_skips_non_persisted_and_inverse() {
        let (am, _) = metas();
        let a = EntityRef::new(&am).with("id", 1).with("name", "A").with("display", "x");
        let state = comparable_state(&a);
        assert_eq!(state.get("name"), Some(&Value::from("A")));
        assert_eq!(state.get("age"), Some(&Value::Null));
        assert!(!state.contains_key("display"));
        assert!(!state.contains_key("books"));
    }

    #[test]
    fn test_comparable_state_uses_target_keys() {
        let (am, bm) = metas();
        let author = EntityRef::new(&am);
        let co = EntityRef::new(&am).with("id", 7);
        let book = EntityRef::new(&bm).with("id", 1);
        book.link_reference("author", Some(&author)).unwrap();
        book.add_to_collection("co_authors", &co).unwrap();

        let state = comparable_state(&book);
        assert_eq!(state.get("author"), Some(&Value::Null));
        assert_eq!(state.get("co_authors"), Some(&Value::Array(vec![Value::Int(7)])));

        author.set("id", 3);
        assert_eq!(comparable_state(&book).get("author"), Some(&Value::Int(3)));
    }

    #[test]
    fn test_is_dirty_and_changed_fields() {
        let (am, _) = metas();
        let a = EntityRef::new(&am).with("id", 1).with("name", "A");
        let mut tracker = ChangeTracker::new();
        assert!(tracker.is_dirty(&a));

        tracker.snapshot(&a);
        assert!(!tracker.is_dirty(&a));
        assert!(tracker.changed_fields(&a).is_empty());

        a.set("name", "B");
        assert!(tracker.is_dirty(&a));
        assert_eq!(tracker.changed_fields(&a), vec!["name"]);

        a.set("display", "ignored");
        assert_eq!(tracker.changed_fields(&a), vec!["name"]);
    }

    #[test]
    fn test_diff_is_minimal() {
        let mut original = EntityState::new();
        original.insert("name", Value::from("A"));
        original.insert("age", Value::Int(30));
        let mut current = original.clone();
        current.insert("age", Value::Int(31));
        let payload = diff(&original, &current);
        assert_eq!(payload.len(), 1);
        assert_eq!(payload.get("age"), Some(&Value::Int(31)));
    }

    #[test]
    fn test_patch_and_clear() {
        let (am, _) = metas();
        let a = EntityRef::new(&am).with("id", 1).with("name", "A");
        let mut tracker = ChangeTracker::new();
        tracker.snapshot(&a);
        a.set("name", "B");
        tracker.patch(a.id(), "name", Value::from("B"));
        assert!(!tracker.is_dirty(&a));

        tracker.clear(a.id());
        assert!(!tracker.has_snapshot(a.id()));
        tracker.snapshot(&a);
        tracker.clear_all();
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_snapshot_resets_collection_dirtiness() {
        let (am, bm) = metas();
        let book = EntityRef::new(&bm).with("id", 1);
        let co = EntityRef::new(&am).with("id", 2);
        book.add_to_collection("co_authors", &co).unwrap();
        assert!(book.read().collection("co_authors").unwrap().is_dirty());

        ChangeTracker::new().snapshot(&book);
        assert!(!book.read().collection("co_authors").unwrap().is_dirty());
    }
}

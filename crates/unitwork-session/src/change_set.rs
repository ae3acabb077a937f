//! Change records produced by a flush.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use unitwork_core::{EntityId, EntityMeta, EntityRef, Payload, Value};

use crate::change_tracker::EntityState;

/// What a change set does to its row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChangeSetKind {
    Create,
    Update,
    Delete,
    /// Update that frees a unique value a same-flush insert reuses
    UpdateEarly,
    /// Delete of a row whose unique value a same-flush insert reuses
    DeleteEarly,
}

impl ChangeSetKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            ChangeSetKind::Create => "create",
            ChangeSetKind::Update => "update",
            ChangeSetKind::Delete => "delete",
            ChangeSetKind::UpdateEarly => "update_early",
            ChangeSetKind::DeleteEarly => "delete_early",
        }
    }

    pub const fn is_delete(self) -> bool {
        matches!(self, ChangeSetKind::Delete | ChangeSetKind::DeleteEarly)
    }

    pub const fn is_update(self) -> bool {
        matches!(self, ChangeSetKind::Update | ChangeSetKind::UpdateEarly)
    }
}

impl fmt::Display for ChangeSetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to an entity that has no primary key yet.
///
/// Resolved by the persister once the target's insert has run.
#[derive(Debug, Clone)]
pub enum PendingRef {
    One(EntityRef),
    Many(Vec<EntityRef>),
}

impl PendingRef {
    /// Foreign-key value if every target now has a primary key.
    pub fn resolve(&self) -> Option<Value> {
        match self {
            PendingRef::One(target) => target.primary_key_value(),
            PendingRef::Many(targets) => targets
                .iter()
                .map(EntityRef::primary_key_value)
                .collect::<Option<Vec<_>>>()
                .map(Value::Array),
        }
    }
}

/// The computed create, update or delete for one entity in one flush.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    pub entity: EntityRef,
    pub meta: Arc<EntityMeta>,
    pub kind: ChangeSetKind,
    /// Columns to write
    pub payload: Payload,
    /// References whose targets are inserted in this flush
    pub pending: BTreeMap<&'static str, PendingRef>,
    /// Snapshot the payload was diffed against
    pub original: Option<EntityState>,
    /// Set once the backend call for this change set succeeded
    pub persisted: bool,
    /// Version held before the persister bumped it
    pub previous_version: Option<Value>,
}

impl ChangeSet {
    pub fn new(entity: EntityRef, kind: ChangeSetKind, payload: Payload) -> Self {
        let meta = Arc::clone(entity.meta());
        Self {
            entity,
            meta,
            kind,
            payload,
            pending: BTreeMap::new(),
            original: None,
            persisted: false,
            previous_version: None,
        }
    }

    #[must_use]
    pub fn with_original(mut self, original: Option<EntityState>) -> Self {
        self.original = original;
        self
    }

    pub fn name(&self) -> &'static str {
        self.meta.name
    }

    pub fn root(&self) -> &'static str {
        self.meta.root
    }

    pub fn id(&self) -> EntityId {
        self.entity.id()
    }

    /// Primary key of the entity, taken from the live instance.
    pub fn primary_key(&self) -> Option<Vec<Value>> {
        self.entity.primary_key()
    }

    /// Value the entity held for `property` before this flush.
    pub fn original_value(&self, property: &str) -> Option<&Value> {
        self.original.as_ref().and_then(|o| o.get(property))
    }
}

/// Deferred write of properties that could not go into the main statement.
#[derive(Debug, Clone)]
pub struct ExtraUpdate {
    pub entity: EntityRef,
    pub properties: Vec<&'static str>,
    /// Payload decided up front; missing properties are read at execution time
    pub values: Payload,
    pub pending: BTreeMap<&'static str, PendingRef>,
}

impl ExtraUpdate {
    pub fn new(entity: EntityRef) -> Self {
        Self {
            entity,
            properties: Vec::new(),
            values: Payload::new(),
            pending: BTreeMap::new(),
        }
    }

    pub fn add_property(&mut self, property: &'static str) {
        if !self.properties.contains(&property) {
            self.properties.push(property);
        }
    }
}

/// Collection registered for pivot synchronization.
#[derive(Debug, Clone)]
pub struct CollectionUpdate {
    pub owner: EntityRef,
    pub relation: &'static str,
}

/// Collections to synchronize in one flush, each at most once.
#[derive(Debug, Clone, Default)]
pub struct CollectionUpdates {
    items: Vec<CollectionUpdate>,
    keys: HashSet<(EntityId, &'static str)>,
}

impl CollectionUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a collection, returning `false` if it already was.
    pub fn register(&mut self, owner: &EntityRef, relation: &'static str) -> bool {
        if !self.keys.insert((owner.id(), relation)) {
            return false;
        }
        self.items.push(CollectionUpdate {
            owner: owner.clone(),
            relation,
        });
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = &CollectionUpdate> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.keys.clear();
    }
}

/// Insertion-ordered set of entities.
#[derive(Debug, Clone, Default)]
pub struct EntitySet {
    items: Vec<EntityRef>,
    ids: HashSet<EntityId>,
}

impl EntitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, returning `false` if already present.
    pub fn insert(&mut self, entity: EntityRef) -> bool {
        if !self.ids.insert(entity.id()) {
            return false;
        }
        self.items.push(entity);
        true
    }

    pub fn remove(&mut self, entity: &EntityRef) -> bool {
        if !self.ids.remove(&entity.id()) {
            return false;
        }
        self.items.retain(|e| e.id() != entity.id());
        true
    }

    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.ids.contains(&entity.id())
    }

    pub fn contains_id(&self, id: EntityId) -> bool {
        self.ids.contains(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityRef> {
        self.items.iter()
    }

    /// Owned copy of the members, for iterating while mutating the owner.
    pub fn to_vec(&self) -> Vec<EntityRef> {
        self.items.clone()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.ids.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unitwork_core::FieldInfo;

    fn meta() -> Arc<EntityMeta> {
        Arc::new(EntityMeta::new("Tag").field(FieldInfo::new("id").primary_key(true)))
    }

    #[test]
    fn test_pending_ref_resolves_when_all_keys_known() {
        let meta = meta();
        let a = EntityRef::new(&meta);
        let b = EntityRef::new(&meta).with("id", 2);
        let pending = PendingRef::Many(vec![a.clone(), b]);
        assert!(pending.resolve().is_none());
        a.set("id", 1);
        assert_eq!(
            pending.resolve(),
            Some(Value::Array(vec![Value::Int(1), Value::Int(2)]))
        );
        assert_eq!(PendingRef::One(a).resolve(), Some(Value::Int(1)));
    }

    #[test]
    fn test_entity_set_keeps_insertion_order() {
        let meta = meta();
        let a = EntityRef::new(&meta);
        let b = EntityRef::new(&meta);
        let mut set = EntitySet::new();
        assert!(set.insert(b.clone()));
        assert!(set.insert(a.clone()));
        assert!(!set.insert(b.clone()));
        assert_eq!(set.to_vec(), vec![b.clone(), a.clone()]);
        assert!(set.remove(&b));
        assert!(!set.contains(&b));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_collection_registered_once() {
        let meta = meta();
        let owner = EntityRef::new(&meta);
        let mut updates = CollectionUpdates::new();
        assert!(updates.register(&owner, "tags"));
        assert!(!updates.register(&owner, "tags"));
        assert!(updates.register(&owner, "labels"));
        assert_eq!(updates.len(), 2);
    }

    #[test]
    fn test_kind_predicates() {
        assert!(ChangeSetKind::DeleteEarly.is_delete());
        assert!(ChangeSetKind::UpdateEarly.is_update());
        assert!(!ChangeSetKind::Create.is_update());
        assert_eq!(ChangeSetKind::UpdateEarly.to_string(), "update_early");
    }
}

//! Diffing live entities against their snapshots.

use std::collections::BTreeMap;

use unitwork_core::{EntityRef, Result, Value};

use crate::change_set::{ChangeSet, ChangeSetKind, CollectionUpdates, PendingRef};
use crate::change_tracker::{ChangeTracker, comparable_state, diff};

/// Computes the change set of one managed entity.
///
/// Entities without a snapshot become creates, the rest become updates
/// carrying only the properties that differ. Owning pivot collections that
/// changed are registered for synchronization.
pub struct ChangeSetComputer<'a> {
    tracker: &'a ChangeTracker,
    collections: &'a mut CollectionUpdates,
}

impl<'a> ChangeSetComputer<'a> {
    pub fn new(tracker: &'a ChangeTracker, collections: &'a mut CollectionUpdates) -> Self {
        Self {
            tracker,
            collections,
        }
    }

    /// Compute the change set for `entity`, or `None` if nothing changed.
    pub fn compute(&mut self, entity: &EntityRef) -> Result<Option<ChangeSet>> {
        let meta = entity.meta();
        let original = self
            .tracker
            .get(entity.id())
            .map(|snapshot| snapshot.state().clone());
        let kind = if original.is_some() {
            ChangeSetKind::Update
        } else {
            ChangeSetKind::Create
        };

        if kind == ChangeSetKind::Update && meta.read_only {
            return Ok(None);
        }
        if kind == ChangeSetKind::Create {
            run_create_generators(entity);
        }

        self.register_collections(entity);

        let current = comparable_state(entity);
        let mut payload = match &original {
            Some(original) => diff(original, &current),
            None => current
                .into_iter()
                .filter(|(_, value)| !value.is_null())
                .collect(),
        };
        if kind == ChangeSetKind::Update {
            if let Some(version) = meta.version_field {
                payload.remove(version);
            }
        }

        let pending = pending_references(entity);
        for name in pending.keys() {
            payload.remove(name);
        }

        if kind == ChangeSetKind::Update {
            let only_generated = payload.keys().all(|name| {
                meta.get_field(name)
                    .is_some_and(|f| f.on_update.is_some())
            });
            if only_generated && pending.is_empty() {
                tracing::trace!(entity = entity.name(), "No changes");
                return Ok(None);
            }
            for (name, value) in run_update_generators(entity) {
                payload.insert(name, value);
            }
        }

        tracing::trace!(
            entity = entity.name(),
            kind = %kind,
            fields = payload.len(),
            pending = pending.len(),
            "Computed change set"
        );
        let mut change_set = ChangeSet::new(entity.clone(), kind, payload).with_original(original);
        change_set.pending = pending;
        Ok(Some(change_set))
    }

    /// Rebuild the payload of an existing change set from the live entity.
    ///
    /// Used after hooks mutated the entity. The kind and the original
    /// snapshot stay as they were; generators do not run again.
    pub fn recompute(change_set: &mut ChangeSet) {
        let current = comparable_state(&change_set.entity);
        let mut payload = match (&change_set.original, change_set.kind) {
            (Some(original), kind) if kind.is_update() => diff(original, &current),
            _ => current
                .into_iter()
                .filter(|(_, value)| !value.is_null())
                .collect(),
        };
        if change_set.kind.is_update() {
            if let Some(version) = change_set.meta.version_field {
                payload.remove(version);
            }
        }
        let pending = pending_references(&change_set.entity);
        for name in pending.keys() {
            payload.remove(name);
        }
        change_set.payload = payload;
        change_set.pending = pending;
    }

    fn register_collections(&mut self, entity: &EntityRef) {
        let dirty: Vec<&'static str> = {
            let data = entity.read();
            entity
                .meta()
                .relations
                .iter()
                .filter(|r| r.is_pivot_collection())
                .filter(|r| data.collection(r.name).is_some_and(|c| c.is_dirty()))
                .map(|r| r.name)
                .collect()
        };
        for name in dirty {
            if self.collections.register(entity, name) {
                tracing::trace!(entity = entity.name(), relation = name, "Collection is dirty");
            }
        }
    }
}

/// Fill null fields that declare an on-create generator.
fn run_create_generators(entity: &EntityRef) {
    let generated: Vec<(&'static str, Value)> = {
        let data = entity.read();
        entity
            .meta()
            .fields
            .iter()
            .filter(|f| data.get(f.name).is_null())
            .filter_map(|f| f.on_create.map(|generator| (f.name, generator(&data))))
            .collect()
    };
    if generated.is_empty() {
        return;
    }
    let mut data = entity.write();
    for (name, value) in generated {
        data.set(name, value);
    }
}

/// Apply on-update generators, returning the values that changed.
fn run_update_generators(entity: &EntityRef) -> Vec<(&'static str, Value)> {
    let generated: Vec<(&'static str, Value)> = {
        let data = entity.read();
        entity
            .meta()
            .fields
            .iter()
            .filter_map(|f| f.on_update.map(|generator| (f.name, generator(&data))))
            .filter(|(name, value)| data.get(name) != value)
            .collect()
    };
    if !generated.is_empty() {
        let mut data = entity.write();
        for (name, value) in &generated {
            data.set(name, value.clone());
        }
    }
    generated
}

/// References to targets that have no primary key yet.
fn pending_references(entity: &EntityRef) -> BTreeMap<&'static str, PendingRef> {
    let meta = entity.meta();
    let (single, many): (Vec<_>, Vec<_>) = {
        let data = entity.read();
        let single: Vec<(&'static str, EntityRef)> = meta
            .relations
            .iter()
            .filter(|r| r.is_to_one_owner() && r.persist)
            .filter_map(|r| data.reference(r.name).map(|t| (r.name, t)))
            .collect();
        let many: Vec<(&'static str, Vec<EntityRef>)> = meta
            .relations
            .iter()
            .filter(|r| r.is_inline_collection() && r.persist)
            .filter_map(|r| data.collection(r.name).map(|c| (r.name, c.items())))
            .collect();
        (single, many)
    };

    let mut pending = BTreeMap::new();
    for (name, target) in single {
        if !target.has_primary_key() {
            pending.insert(name, PendingRef::One(target));
        }
    }
    for (name, items) in many {
        if items.iter().any(|item| !item.has_primary_key()) {
            pending.insert(name, PendingRef::Many(items));
        }
    }
    pending
}

//! The unit of work.
//!
//! A [`UnitOfWork`] collects persist, remove and merge requests, tracks
//! managed entities through the identity map and their snapshots, and on
//! [`commit`](UnitOfWork::commit) writes the minimal set of statements in an
//! order that respects foreign keys.
//!
//! # Flush sequence
//!
//! 1. `before_flush` subscribers run.
//! 2. Change sets are computed: removals cascade, persists cascade and newly
//!    reachable entities are discovered.
//! 3. `on_flush` subscribers run and may add change sets. Deletes and
//!    updates freeing a unique value that a create reuses are moved to the
//!    early phases. Nothing to write ends the flush here.
//! 4. A transaction is opened unless one is already active.
//! 5. Phases run in order: early deletes, early updates, creates, updates,
//!    extra updates, collection synchronization, deletes.
//! 6. On success snapshots are refreshed and pending sets cleared; on
//!    failure the owned transaction is rolled back and the pending sets are
//!    kept so the flush can be retried.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use asupersync::{Cx, Outcome};
use serde::Serialize;
use unitwork_core::{
    Cascade, Driver, EntityId, EntityMeta, EntityRef, Error, EventType, Filter, FindOptions,
    LockMode, MetadataStorage, OptimisticLockError, Payload, RelationInfo, Result, Row,
    TransactionError, TransactionOptions, ValidationError, Value,
};

use crate::change_set::{
    ChangeSet, ChangeSetKind, CollectionUpdates, EntitySet, ExtraUpdate,
};
use crate::change_set_computer::ChangeSetComputer;
use crate::change_set_persister::ChangeSetPersister;
use crate::change_tracker::{ChangeTracker, EntityState, snapshot_collections};
use crate::commit_order::CommitOrderCalculator;
use crate::config::UnitOfWorkConfig;
use crate::events::{EventManager, EventSubscriber, dispatch_flush};
use crate::flush::{FlushPlan, FlushResult};
use crate::identity_map::{IdentityMap, primary_key_hash, unique_hash, unique_hash_of};
use crate::transaction::TransactionContext;

/// Sizes of the pending sets and the identity map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingCounts {
    pub persist: usize,
    pub remove: usize,
    pub orphan_remove: usize,
    pub managed: usize,
}

/// Entities reachable through one relation.
fn related(entity: &EntityRef, rel: &RelationInfo) -> Vec<EntityRef> {
    if rel.is_collection() {
        entity.collection_items(rel.name)
    } else {
        entity.get_reference(rel.name).into_iter().collect()
    }
}

/// Split a stored foreign-key value into primary key parts.
fn key_parts(meta: &EntityMeta, value: Value) -> Vec<Value> {
    match value {
        Value::Array(parts) if meta.is_composite_key() => parts,
        other => vec![other],
    }
}

/// Hash of a unique group as the change set saw it before this flush.
fn original_unique_hash(cs: &ChangeSet, group: &[&'static str]) -> Option<String> {
    let Some(original) = &cs.original else {
        return unique_hash(&cs.entity, group);
    };
    let mut values = Vec::with_capacity(group.len());
    for prop in group {
        match original.get(prop) {
            Some(value) if !value.is_null() => values.push(value.clone()),
            _ => return None,
        }
    }
    Some(unique_hash_of(group, &values))
}

fn original_primary_key_hash(cs: &ChangeSet) -> Option<String> {
    let key = match &cs.original {
        Some(original) => cs
            .meta
            .primary_keys
            .iter()
            .map(|pk| original.get(pk).cloned().unwrap_or(Value::Null))
            .collect::<Vec<_>>(),
        None => cs.primary_key()?,
    };
    if key.iter().any(Value::is_null) {
        return None;
    }
    Some(format!("pk:{}", primary_key_hash(&key)))
}

/// Move non-null values of nullable unique columns into an extra update.
///
/// The main statement writes `NULL` first, so two rows can swap values
/// without an intermediate unique conflict.
fn defer_unique_columns(cs: &mut ChangeSet) -> Option<ExtraUpdate> {
    let columns: Vec<&'static str> = cs
        .payload
        .iter()
        .filter(|(name, value)| !value.is_null() && cs.meta.is_nullable_unique(name))
        .map(|(name, _)| *name)
        .collect();
    if columns.is_empty() {
        return None;
    }
    let mut extra = ExtraUpdate::new(cs.entity.clone());
    for name in columns {
        if let Some(value) = cs.payload.insert(name, Value::Null) {
            extra.values.insert(name, value);
            extra.add_property(name);
        }
    }
    tracing::trace!(
        entity = cs.name(),
        columns = ?extra.properties,
        "Deferring unique columns"
    );
    Some(extra)
}

/// Exclusive access to a unit of work for one flush.
///
/// Dropping the scope clears the in-flight state, also when the commit
/// future is abandoned before it finishes.
struct FlushScope<'a, D: Driver> {
    uow: &'a mut UnitOfWork<D>,
}

impl<D: Driver> Drop for FlushScope<'_, D> {
    fn drop(&mut self) {
        self.uow.working = false;
        self.uow.processing.clear();
        self.uow.collection_updates.clear();
    }
}

/// A flush plan that undoes the keys and versions it assigned unless the
/// flush completed.
struct PlanGuard {
    plan: FlushPlan,
    completed: bool,
}

impl Drop for PlanGuard {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        for cs in self.plan.iter_mut() {
            if let (Some(version), Some(previous)) = (cs.meta.version_field, cs.previous_version.take()) {
                cs.entity.set(version, previous);
            }
            if cs.kind == ChangeSetKind::Create && cs.persisted {
                if let Some(pk) = cs.meta.generated_primary_key() {
                    if !cs.payload.contains_key(pk) {
                        cs.entity.set(pk, Value::Null);
                    }
                }
            }
        }
    }
}

/// Change tracking and commit orchestration for one logical flow.
pub struct UnitOfWork<D: Driver> {
    driver: Arc<D>,
    metadata: Arc<MetadataStorage>,
    config: UnitOfWorkConfig,
    identity_map: IdentityMap,
    tracker: ChangeTracker,
    persist_stack: EntitySet,
    remove_stack: EntitySet,
    orphan_remove_stack: EntitySet,
    change_sets: Vec<ChangeSet>,
    collection_updates: CollectionUpdates,
    /// Entities with a change set in the flush being computed or run
    processing: HashSet<EntityId>,
    events: EventManager<D>,
    transaction: Option<TransactionContext<D::Tx>>,
    working: bool,
}

impl<D: Driver> fmt::Debug for UnitOfWork<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("config", &self.config)
            .field("pending", &self.pending_counts())
            .field("change_sets", &self.change_sets.len())
            .field("events", &self.events)
            .field("in_transaction", &self.transaction.is_some())
            .field("working", &self.working)
            .finish_non_exhaustive()
    }
}

impl<D: Driver> UnitOfWork<D> {
    pub fn new(driver: Arc<D>, metadata: Arc<MetadataStorage>) -> Self {
        Self::with_config(driver, metadata, UnitOfWorkConfig::default())
    }

    pub fn with_config(
        driver: Arc<D>,
        metadata: Arc<MetadataStorage>,
        config: UnitOfWorkConfig,
    ) -> Self {
        Self {
            driver,
            metadata,
            config,
            identity_map: IdentityMap::new(),
            tracker: ChangeTracker::new(),
            persist_stack: EntitySet::new(),
            remove_stack: EntitySet::new(),
            orphan_remove_stack: EntitySet::new(),
            change_sets: Vec::new(),
            collection_updates: CollectionUpdates::new(),
            processing: HashSet::new(),
            events: EventManager::new(),
            transaction: None,
            working: false,
        }
    }

    pub fn config(&self) -> &UnitOfWorkConfig {
        &self.config
    }

    pub fn metadata(&self) -> &Arc<MetadataStorage> {
        &self.metadata
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    pub fn identity_map(&self) -> &IdentityMap {
        &self.identity_map
    }

    pub fn subscribe(&mut self, subscriber: Arc<dyn EventSubscriber<D>>) {
        self.events.register(subscriber);
    }

    /// Is a flush running on this instance?
    pub fn is_working(&self) -> bool {
        self.working
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// Does the entity have a change set in the current flush?
    pub fn is_processing(&self, entity: &EntityRef) -> bool {
        self.processing.contains(&entity.id())
    }

    /// Change sets computed so far in the current flush.
    pub fn change_sets(&self) -> &[ChangeSet] {
        &self.change_sets
    }

    pub fn pending_counts(&self) -> PendingCounts {
        PendingCounts {
            persist: self.persist_stack.len(),
            remove: self.remove_stack.len(),
            orphan_remove: self.orphan_remove_stack.len(),
            managed: self.identity_map.len(),
        }
    }

    fn ensure_registered(&self, entity: &EntityRef) -> Result<()> {
        if self.metadata.contains(entity.name()) {
            Ok(())
        } else {
            Err(ValidationError::unknown_entity(entity.name()).into())
        }
    }

    fn schema_for(&self, meta: &EntityMeta) -> Option<String> {
        meta.schema
            .map(str::to_string)
            .or_else(|| self.config.schema.clone())
    }

    fn stamp_schema(&self, entity: &EntityRef) {
        if entity.schema().is_some() {
            return;
        }
        if let Some(schema) = self.schema_for(entity.meta()) {
            entity.write().set_schema(Some(schema));
        }
    }

    fn index_unique(&mut self, entity: &EntityRef) {
        for group in entity.meta().unique_properties() {
            if let Some(hash) = unique_hash(entity, &group) {
                self.identity_map.store_unique(entity, hash);
            }
        }
    }

    // ========================================================================
    // Persist / Remove / Merge
    // ========================================================================

    /// Schedule an entity, and whatever its relations cascade to, for
    /// insertion or update on the next flush.
    pub fn persist(&mut self, entity: &EntityRef) -> Result<()> {
        self.ensure_registered(entity)?;
        let mut visited = HashSet::new();
        self.cascade(entity, Cascade::PERSIST, &mut visited, false)
    }

    /// Schedule an entity for deletion.
    ///
    /// Removing an entity that was never flushed only un-persists it.
    pub fn remove(&mut self, entity: &EntityRef) -> Result<()> {
        self.ensure_registered(entity)?;
        let mut visited = HashSet::new();
        self.cascade(entity, Cascade::REMOVE, &mut visited, false)
    }

    fn cascade(
        &mut self,
        entity: &EntityRef,
        operation: Cascade,
        visited: &mut HashSet<EntityId>,
        skip_removed: bool,
    ) -> Result<()> {
        if !visited.insert(entity.id()) {
            return Ok(());
        }
        if skip_removed
            && (self.remove_stack.contains(entity) || self.orphan_remove_stack.contains(entity))
        {
            return Ok(());
        }
        if operation == Cascade::REMOVE {
            self.remove_single(entity);
        } else {
            self.persist_single(entity);
        }

        let meta = Arc::clone(entity.meta());
        for rel in &meta.relations {
            let follows = rel.cascade.contains(operation)
                || (operation == Cascade::REMOVE && rel.orphan_removal);
            if !follows {
                continue;
            }
            for target in related(entity, rel) {
                self.ensure_registered(&target)?;
                self.cascade(&target, operation, visited, skip_removed)?;
            }
        }
        Ok(())
    }

    fn persist_single(&mut self, entity: &EntityRef) {
        if self.remove_stack.remove(entity) {
            tracing::trace!(entity = entity.name(), "Persist cancels pending removal");
        }
        self.orphan_remove_stack.remove(entity);
        self.stamp_schema(entity);
        self.persist_stack.insert(entity.clone());
    }

    fn remove_single(&mut self, entity: &EntityRef) {
        self.persist_stack.remove(entity);
        let managed = self.tracker.has_snapshot(entity.id()) || self.identity_map.contains(entity);
        if !managed {
            tracing::trace!(entity = entity.name(), "Removed entity was never flushed");
            return;
        }
        self.remove_stack.insert(entity.clone());
    }

    /// Make the state of `entity` managed and return the managed instance.
    ///
    /// If an instance with the same identity is already managed, the
    /// incoming state is copied onto it and that instance is returned.
    /// Merge always cascades to related entities that have a primary key.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = entity.name()))]
    pub fn merge(&mut self, entity: &EntityRef) -> Result<EntityRef> {
        let mut visited = HashMap::new();
        self.merge_entity(entity, &mut visited)
    }

    fn merge_entity(
        &mut self,
        entity: &EntityRef,
        visited: &mut HashMap<EntityId, EntityRef>,
    ) -> Result<EntityRef> {
        if let Some(managed) = visited.get(&entity.id()) {
            return Ok(managed.clone());
        }
        self.ensure_registered(entity)?;
        if self.remove_stack.contains(entity) {
            return Err(ValidationError::entity_removed(entity.name()).into());
        }
        let meta = Arc::clone(entity.meta());
        let Some(key) = entity.primary_key() else {
            return Err(ValidationError::missing_primary_key(meta.name).into());
        };
        self.stamp_schema(entity);
        let schema = entity.schema();

        let managed = match self.identity_map.get(meta.root, schema.as_deref(), &key) {
            Some(existing) => {
                tracing::debug!("Merging onto managed instance");
                existing.copy_state_from(entity);
                existing
            }
            None => {
                tracing::debug!("Registering merged instance");
                entity.write().set_initialized(true);
                self.identity_map.store(entity)?;
                entity.clone()
            }
        };
        visited.insert(entity.id(), managed.clone());

        for rel in meta.relations.iter().filter(|r| r.is_to_one_owner()) {
            let Some(target) = entity.get_reference(rel.name) else {
                continue;
            };
            if !target.has_primary_key() {
                continue;
            }
            let merged = self.merge_entity(&target, visited)?;
            if !merged.ptr_eq(&target) || !managed.ptr_eq(entity) {
                managed.set_link_raw(rel.name, Some(&merged))?;
            }
        }
        for rel in meta.relations.iter().filter(|r| r.is_collection()) {
            for item in entity.collection_items(rel.name) {
                if !item.has_primary_key() {
                    continue;
                }
                let merged = self.merge_entity(&item, visited)?;
                if !merged.ptr_eq(&item) {
                    managed.remove_member_raw(rel.name, &item);
                }
                managed.add_to_collection(rel.name, &merged)?;
            }
        }

        self.tracker.snapshot(&managed);
        self.index_unique(&managed);
        Ok(managed)
    }

    // ========================================================================
    // Loading and Lookup
    // ========================================================================

    /// Hydrate a managed entity from a backend row.
    ///
    /// A row whose identity is already managed and initialized returns the
    /// managed instance untouched. Foreign keys become uninitialized
    /// references registered in the identity map.
    pub fn register_loaded(&mut self, entity_name: &str, row: &Row) -> Result<EntityRef> {
        let meta = self.metadata.get(entity_name)?;
        let mut key = Vec::with_capacity(meta.primary_keys.len());
        for pk in &meta.primary_keys {
            match row.get_named(pk) {
                Some(value) if !value.is_null() => key.push(value.clone()),
                _ => return Err(ValidationError::missing_primary_key(meta.name).into()),
            }
        }
        let schema = self.schema_for(&meta);

        let entity = match self.identity_map.get(meta.root, schema.as_deref(), &key) {
            Some(existing) if existing.is_initialized() => {
                tracing::trace!(entity = meta.name, "Row already managed");
                return Ok(existing);
            }
            Some(existing) => existing,
            None => {
                let entity = EntityRef::new(&meta);
                entity.write().set_schema(schema);
                entity
            }
        };
        self.hydrate(&entity, row)?;
        self.identity_map.store(&entity)?;
        self.tracker.snapshot(&entity);
        self.index_unique(&entity);
        tracing::trace!(entity = meta.name, pk_hash = %primary_key_hash(&key), "Registered loaded entity");
        Ok(entity)
    }

    fn hydrate(&mut self, entity: &EntityRef, row: &Row) -> Result<()> {
        let meta = Arc::clone(entity.meta());
        {
            let mut data = entity.write();
            for field in &meta.fields {
                if let Some(value) = row.get_named(field.name) {
                    data.set(field.name, value.clone());
                }
            }
            data.set_initialized(true);
        }
        for rel in &meta.relations {
            if !rel.is_to_one_owner() && !rel.is_inline_collection() {
                continue;
            }
            let Some(value) = row.get_named(rel.name).cloned() else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            if rel.is_inline_collection() {
                let Value::Array(keys) = value else {
                    continue;
                };
                for item_key in keys {
                    let item = self.reference_for(rel.target, item_key)?;
                    entity.add_to_collection(rel.name, &item)?;
                }
            } else {
                let target = self.reference_for(rel.target, value)?;
                entity.link_reference(rel.name, Some(&target))?;
            }
        }
        Ok(())
    }

    fn reference_for(&mut self, entity_name: &str, value: Value) -> Result<EntityRef> {
        let meta = self.metadata.get(entity_name)?;
        let key = key_parts(&meta, value);
        self.get_reference(meta.name, &key)
    }

    /// Managed instance for a primary key, or an uninitialized reference
    /// registered in its place.
    pub fn get_reference(&mut self, entity_name: &str, primary_key: &[Value]) -> Result<EntityRef> {
        let meta = self.metadata.get(entity_name)?;
        if primary_key.len() != meta.primary_keys.len() {
            return Err(ValidationError::invalid_composite_key(
                meta.name,
                meta.primary_keys.len(),
                primary_key.len(),
            )
            .into());
        }
        let schema = self.schema_for(&meta);
        if let Some(existing) = self.identity_map.get(meta.root, schema.as_deref(), primary_key) {
            return Ok(existing);
        }
        let reference = EntityRef::reference(&meta, primary_key);
        reference.write().set_schema(schema);
        self.identity_map.store(&reference)?;
        Ok(reference)
    }

    /// Managed entity by primary key, from the identity map only.
    pub fn get_by_id(&self, entity_name: &str, primary_key: &[Value]) -> Result<Option<EntityRef>> {
        let meta = self.metadata.get(entity_name)?;
        if primary_key.len() != meta.primary_keys.len() {
            return Err(ValidationError::invalid_composite_key(
                meta.name,
                meta.primary_keys.len(),
                primary_key.len(),
            )
            .into());
        }
        let schema = self.schema_for(&meta);
        Ok(self.identity_map.get(meta.root, schema.as_deref(), primary_key))
    }

    /// Like [`get_by_id`](Self::get_by_id), treating misuse as a miss.
    pub fn try_get(&self, entity_name: &str, primary_key: &[Value]) -> Option<EntityRef> {
        self.get_by_id(entity_name, primary_key).ok().flatten()
    }

    /// Managed entity by the values of a unique property group.
    pub fn get_by_unique(
        &self,
        entity_name: &str,
        properties: &[&str],
        values: &[Value],
    ) -> Result<Option<EntityRef>> {
        let meta = self.metadata.get(entity_name)?;
        for prop in properties {
            if !meta.has_property(prop) {
                return Err(ValidationError::unknown_property(meta.name, prop).into());
            }
        }
        let schema = self.schema_for(&meta);
        let hash = unique_hash_of(properties, values);
        Ok(self
            .identity_map
            .get_by_unique(meta.root, schema.as_deref(), &hash))
    }

    /// Find an entity by primary key: identity map first, then the driver.
    #[tracing::instrument(level = "debug", skip(self, cx, primary_key))]
    pub async fn find_one(
        &mut self,
        cx: &Cx,
        entity_name: &str,
        primary_key: &[Value],
    ) -> Outcome<Option<EntityRef>, Error> {
        let meta = match self.metadata.get(entity_name) {
            Ok(meta) => meta,
            Err(e) => return Outcome::Err(e),
        };
        match self.get_by_id(entity_name, primary_key) {
            Ok(Some(existing)) if existing.is_initialized() => {
                tracing::debug!("Found in identity map");
                return Outcome::Ok(Some(existing));
            }
            Ok(_) => {}
            Err(e) => return Outcome::Err(e),
        }

        let filter = Filter::primary_key(&meta, primary_key);
        let tx = self.transaction.as_ref().map(TransactionContext::tx);
        let row = match self
            .driver
            .find_one(cx, &meta, filter, FindOptions::default(), tx)
            .await
        {
            Outcome::Ok(row) => row,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let Some(row) = row else {
            tracing::debug!("Row not found");
            return Outcome::Ok(None);
        };
        match self.register_loaded(meta.name, &row) {
            Ok(entity) => Outcome::Ok(Some(entity)),
            Err(e) => Outcome::Err(e),
        }
    }

    /// Is this exact instance managed?
    pub fn is_managed(&self, entity: &EntityRef) -> bool {
        self.identity_map.contains(entity)
    }

    /// Last persisted state of an entity.
    pub fn snapshot_of(&self, entity: &EntityRef) -> Option<EntityState> {
        self.tracker.get(entity.id()).map(|s| s.state().clone())
    }

    // ========================================================================
    // Change Set Computation
    // ========================================================================

    /// Compute and register a change set for one entity.
    ///
    /// Meant for `on_flush` subscribers that create or modify entities
    /// after the regular computation ran.
    pub fn compute_change_set(&mut self, entity: &EntityRef) -> Result<()> {
        self.ensure_registered(entity)?;
        if self.processing.contains(&entity.id()) {
            return self.recompute_single_change_set(entity);
        }
        self.persist_single(entity);
        let mut computer = ChangeSetComputer::new(&self.tracker, &mut self.collection_updates);
        if let Some(cs) = computer.compute(entity)? {
            self.processing.insert(entity.id());
            self.change_sets.push(cs);
        }
        Ok(())
    }

    /// Re-diff an entity whose change set already exists.
    pub fn recompute_single_change_set(&mut self, entity: &EntityRef) -> Result<()> {
        let Some(idx) = self
            .change_sets
            .iter()
            .position(|cs| cs.entity.ptr_eq(entity))
        else {
            return self.compute_change_set(entity);
        };
        let cs = &mut self.change_sets[idx];
        ChangeSetComputer::recompute(cs);
        if cs.kind.is_update() && cs.payload.is_empty() && cs.pending.is_empty() {
            tracing::trace!(entity = entity.name(), "Change set became empty");
            self.change_sets.remove(idx);
            self.processing.remove(&entity.id());
        }
        Ok(())
    }

    fn compute_change_sets(&mut self) -> Result<()> {
        self.change_sets.clear();
        self.collection_updates.clear();
        self.processing.clear();

        self.collect_orphans();
        let removals: Vec<EntityRef> = self
            .remove_stack
            .iter()
            .chain(self.orphan_remove_stack.iter())
            .cloned()
            .collect();
        let mut visited = HashSet::new();
        for entity in &removals {
            self.cascade(entity, Cascade::REMOVE, &mut visited, false)?;
        }

        let mut visited = HashSet::new();
        for entity in self.persist_stack.to_vec() {
            self.cascade(&entity, Cascade::PERSIST, &mut visited, true)?;
        }

        let mut candidates = self.persist_stack.to_vec();
        if !self.config.disable_change_tracking {
            candidates.extend(
                self.identity_map
                    .values()
                    .into_iter()
                    .filter(|e| !self.persist_stack.contains(e)),
            );
        }
        let mut visited = HashSet::new();
        for entity in &candidates {
            self.find_new_entities(entity, &mut visited)?;
        }

        let mut deleted = HashSet::new();
        let removals: Vec<EntityRef> = self
            .remove_stack
            .iter()
            .chain(self.orphan_remove_stack.iter())
            .cloned()
            .collect();
        for entity in removals {
            if !deleted.insert(entity.id()) {
                continue;
            }
            let managed =
                self.tracker.has_snapshot(entity.id()) || self.identity_map.contains(&entity);
            if !managed || !entity.has_primary_key() {
                continue;
            }
            let original = self.tracker.get(entity.id()).map(|s| s.state().clone());
            self.processing.insert(entity.id());
            self.change_sets.push(
                ChangeSet::new(entity, ChangeSetKind::Delete, Payload::new())
                    .with_original(original),
            );
        }

        tracing::debug!(
            change_sets = self.change_sets.len(),
            collections = self.collection_updates.len(),
            "Computed change sets"
        );
        Ok(())
    }

    /// Compute change sets for `entity` and every new entity reachable
    /// from it.
    fn find_new_entities(
        &mut self,
        entity: &EntityRef,
        visited: &mut HashSet<EntityId>,
    ) -> Result<()> {
        if !visited.insert(entity.id()) {
            return Ok(());
        }
        if self.remove_stack.contains(entity) || self.orphan_remove_stack.contains(entity) {
            return Ok(());
        }
        if !entity.is_initialized() {
            return Ok(());
        }
        self.ensure_registered(entity)?;
        self.stamp_schema(entity);

        let meta = Arc::clone(entity.meta());
        for rel in &meta.relations {
            for target in related(entity, rel) {
                let managed =
                    self.tracker.has_snapshot(target.id()) || self.identity_map.contains(&target);
                if !managed {
                    self.find_new_entities(&target, visited)?;
                }
            }
        }

        if self.processing.contains(&entity.id()) {
            return Ok(());
        }
        let mut computer = ChangeSetComputer::new(&self.tracker, &mut self.collection_updates);
        if let Some(cs) = computer.compute(entity)? {
            self.processing.insert(entity.id());
            self.change_sets.push(cs);
        }
        Ok(())
    }

    /// Schedule members dropped from orphan-removal relations.
    fn collect_orphans(&mut self) {
        let mut owners = self.identity_map.values();
        owners.extend(self.persist_stack.iter().cloned());
        let mut seen = HashSet::new();

        for owner in owners {
            if !seen.insert(owner.id()) {
                continue;
            }
            let meta = Arc::clone(owner.meta());

            let drained: Vec<(Option<&'static str>, EntityRef)> = {
                let mut data = owner.write();
                let mut drained = Vec::new();
                for rel in meta.relations.iter().filter(|r| r.is_collection() && r.orphan_removal) {
                    if let Some(collection) = data.collection_mut(rel.name) {
                        for orphan in collection.take_orphans() {
                            drained.push((rel.counterpart(), orphan));
                        }
                    }
                }
                drained
            };
            for (back, orphan) in drained {
                let reparented = back.is_some_and(|back| {
                    orphan.meta().get_relation(back).is_some_and(RelationInfo::is_to_one)
                        && orphan.get_reference(back).is_some()
                });
                if reparented {
                    continue;
                }
                tracing::trace!(entity = orphan.name(), "Scheduling orphan removal");
                self.orphan_remove_stack.insert(orphan);
            }

            let replaced: Vec<(&'static str, Value)> = match self.tracker.get(owner.id()) {
                Some(snapshot) => meta
                    .relations
                    .iter()
                    .filter(|r| r.is_to_one_owner() && r.orphan_removal)
                    .filter_map(|r| {
                        let previous = snapshot.state().get(r.name)?;
                        if previous.is_null() {
                            return None;
                        }
                        let current = owner
                            .get_reference(r.name)
                            .and_then(|t| t.primary_key_value());
                        (current.as_ref() != Some(previous)).then(|| (r.target, previous.clone()))
                    })
                    .collect(),
                None => Vec::new(),
            };
            for (target, previous) in replaced {
                let Some(target_meta) = self.metadata.find(target).cloned() else {
                    continue;
                };
                let schema = self.schema_for(&target_meta);
                let key = key_parts(&target_meta, previous);
                if let Some(orphan) = self.identity_map.get(target_meta.root, schema.as_deref(), &key)
                {
                    tracing::trace!(entity = orphan.name(), "Scheduling replaced reference removal");
                    self.orphan_remove_stack.insert(orphan);
                }
            }
        }
    }

    /// Reclassify deletes and updates that free a unique value reused by a
    /// create in the same flush.
    fn resolve_early_change_sets(&mut self) {
        let mut created: HashSet<(&'static str, String)> = HashSet::new();
        for cs in self
            .change_sets
            .iter()
            .filter(|cs| cs.kind == ChangeSetKind::Create)
        {
            if let Some(key) = cs.primary_key() {
                created.insert((cs.root(), format!("pk:{}", primary_key_hash(&key))));
            }
            for group in cs.meta.unique_properties() {
                if let Some(hash) = unique_hash(&cs.entity, &group) {
                    created.insert((cs.root(), hash));
                }
            }
        }
        if created.is_empty() {
            return;
        }

        for cs in &mut self.change_sets {
            let root = cs.root();
            match cs.kind {
                ChangeSetKind::Delete => {
                    let mut keys: Vec<String> = original_primary_key_hash(cs).into_iter().collect();
                    for group in cs.meta.unique_properties() {
                        keys.extend(original_unique_hash(cs, &group));
                    }
                    if keys.into_iter().any(|k| created.contains(&(root, k))) {
                        tracing::debug!(entity = cs.name(), "Delete runs before conflicting insert");
                        cs.kind = ChangeSetKind::DeleteEarly;
                    }
                }
                ChangeSetKind::Update => {
                    let frees = cs.meta.unique_properties().iter().any(|group| {
                        group.iter().any(|p| cs.payload.contains_key(p))
                            && original_unique_hash(cs, group)
                                .is_some_and(|hash| created.contains(&(root, hash)))
                    });
                    if frees {
                        tracing::debug!(entity = cs.name(), "Update runs before conflicting insert");
                        cs.kind = ChangeSetKind::UpdateEarly;
                    }
                }
                _ => {}
            }
        }
    }

    // ========================================================================
    // Commit
    // ========================================================================

    /// Flush all pending changes.
    ///
    /// Fails with [`ValidationErrorKind::ReentrantCommit`] if a flush is
    /// already running on this instance; use
    /// [`SharedUnitOfWork`](crate::SharedUnitOfWork) to queue commits from
    /// concurrent tasks.
    ///
    /// Dropping the returned future before it completes behaves like a failed
    /// flush and leaves a transaction opened with
    /// [`begin_transaction`](Self::begin_transaction) in place.
    ///
    /// [`ValidationErrorKind::ReentrantCommit`]: unitwork_core::ValidationErrorKind::ReentrantCommit
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        if self.working {
            return Outcome::Err(ValidationError::reentrant_commit().into());
        }
        self.working = true;
        let scope = FlushScope { uow: self };
        let started = Instant::now();
        let outcome = scope.uow.flush(cx).await;
        drop(scope);

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        match &outcome {
            Outcome::Ok(result) => tracing::info!(
                inserted = result.inserted,
                updated = result.updated,
                deleted = result.deleted,
                extra_updates = result.extra_updates,
                collections = result.collections,
                elapsed_ms,
                "Flush complete"
            ),
            Outcome::Err(e) => tracing::warn!(error = %e, elapsed_ms, "Flush failed"),
            Outcome::Cancelled(_) => tracing::warn!(elapsed_ms, "Flush cancelled"),
            Outcome::Panicked(_) => tracing::warn!(elapsed_ms, "Flush panicked"),
        }
        outcome
    }

    async fn flush(&mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        let subscribers = self.events.subscribers();
        if let Err(e) = dispatch_flush(&subscribers, EventType::BeforeFlush, self) {
            return Outcome::Err(e);
        }
        if let Err(e) = self.compute_change_sets() {
            self.processing.clear();
            return Outcome::Err(e);
        }
        if let Err(e) = dispatch_flush(&subscribers, EventType::OnFlush, self) {
            self.processing.clear();
            return Outcome::Err(e);
        }
        // covers change sets added by on_flush subscribers
        self.resolve_early_change_sets();

        if self.change_sets.is_empty() && self.collection_updates.is_empty() {
            tracing::debug!("Nothing to flush");
            self.post_commit_cleanup();
            if let Err(e) = dispatch_flush(&subscribers, EventType::AfterFlush, self) {
                return Outcome::Err(e);
            }
            return Outcome::Ok(FlushResult::new());
        }

        let order = CommitOrderCalculator::from_metadata(&self.metadata).sort();
        let mut plan = PlanGuard {
            plan: FlushPlan::new(std::mem::take(&mut self.change_sets), order),
            completed: false,
        };
        tracing::debug!(
            change_sets = plan.plan.len(),
            creates = plan.plan.count(ChangeSetKind::Create),
            updates = plan.plan.count(ChangeSetKind::Update)
                + plan.plan.count(ChangeSetKind::UpdateEarly),
            deletes = plan.plan.count(ChangeSetKind::Delete)
                + plan.plan.count(ChangeSetKind::DeleteEarly),
            order = ?plan.plan.order(),
            "Flush plan ready"
        );

        let platform = self.driver.platform();
        let ambient = self.transaction.as_ref().map(TransactionContext::tx);
        let owned = if ambient.is_none()
            && self.config.implicit_transactions
            && platform.supports_transactions
        {
            let options = TransactionOptions::default().isolation(self.config.isolation);
            match self.driver.begin(cx, options).await {
                Outcome::Ok(tx) => Some(tx),
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        } else {
            None
        };

        let tx = ambient.or(owned.as_ref());
        let outcome = self.execute_plan(cx, &mut plan.plan, tx).await;

        let outcome = match outcome {
            Outcome::Ok(result) => match owned {
                Some(tx) => match self.driver.commit(cx, tx).await {
                    Outcome::Ok(()) => Outcome::Ok(result),
                    Outcome::Err(e) => Outcome::Err(e),
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                },
                None => Outcome::Ok(result),
            },
            failure => {
                if let Some(tx) = owned {
                    tracing::warn!("Rolling back flush transaction");
                    if let Outcome::Err(e) = self.driver.rollback(cx, tx).await {
                        tracing::warn!(error = %e, "Rollback failed");
                    }
                }
                failure
            }
        };

        match outcome {
            Outcome::Ok(result) => {
                plan.completed = true;
                self.post_commit(&plan.plan);
                if let Err(e) = dispatch_flush(&subscribers, EventType::AfterFlush, self) {
                    return Outcome::Err(e);
                }
                Outcome::Ok(result)
            }
            failure => failure,
        }
    }

    async fn execute_plan(
        &self,
        cx: &Cx,
        plan: &mut FlushPlan,
        tx: Option<&D::Tx>,
    ) -> Outcome<FlushResult, Error> {
        let persister = ChangeSetPersister::new(self.driver.as_ref(), tx, self.config.batch_size);
        let defer_unique = !self.driver.platform().allows_unique_batch_updates;
        let mut result = FlushResult::new();
        let mut extra_updates: Vec<ExtraUpdate> = Vec::new();

        for root in plan.phase_order(ChangeSetKind::DeleteEarly) {
            let Some(group) = plan.group_mut(ChangeSetKind::DeleteEarly, root) else {
                continue;
            };
            match self.run_deletes(cx, &persister, group).await {
                Outcome::Ok(count) => result.deleted += count,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        for root in plan.phase_order(ChangeSetKind::UpdateEarly) {
            let Some(group) = plan.group_mut(ChangeSetKind::UpdateEarly, root) else {
                continue;
            };
            match self.run_updates(cx, &persister, group, false).await {
                Outcome::Ok((issued, extra)) => {
                    result.updated += issued;
                    extra_updates.extend(extra);
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        for root in plan.phase_order(ChangeSetKind::Create) {
            let Some(group) = plan.group_mut(ChangeSetKind::Create, root) else {
                continue;
            };
            match self.run_inserts(cx, &persister, group).await {
                Outcome::Ok(extra) => {
                    result.inserted += group.len();
                    extra_updates.extend(extra);
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        for root in plan.phase_order(ChangeSetKind::Update) {
            let Some(group) = plan.group_mut(ChangeSetKind::Update, root) else {
                continue;
            };
            match self.run_updates(cx, &persister, group, defer_unique).await {
                Outcome::Ok((issued, extra)) => {
                    result.updated += issued;
                    extra_updates.extend(extra);
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        for update in &extra_updates {
            match persister.execute_extra_update(cx, update).await {
                Outcome::Ok(true) => result.extra_updates += 1,
                Outcome::Ok(false) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        for update in self.collection_updates.iter() {
            if self.remove_stack.contains(&update.owner)
                || self.orphan_remove_stack.contains(&update.owner)
            {
                continue;
            }
            match persister.sync_collection(cx, update).await {
                Outcome::Ok(true) => result.collections += 1,
                Outcome::Ok(false) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        for root in plan.phase_order(ChangeSetKind::Delete) {
            let Some(group) = plan.group_mut(ChangeSetKind::Delete, root) else {
                continue;
            };
            match self.run_deletes(cx, &persister, group).await {
                Outcome::Ok(count) => result.deleted += count,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        Outcome::Ok(result)
    }

    /// Fire `event` for each change set, re-diffing when a listener may
    /// have changed the entity.
    fn fire_before(&self, event: EventType, group: &mut [ChangeSet]) -> Result<()> {
        for cs in group.iter_mut() {
            if !self.events.has_listeners(event, &cs.meta) {
                continue;
            }
            self.events.dispatch(event, &cs.entity, Some(&*cs))?;
            if !cs.kind.is_delete() {
                ChangeSetComputer::recompute(cs);
            }
        }
        Ok(())
    }

    fn fire_after(&self, event: EventType, group: &[ChangeSet]) -> Result<()> {
        for cs in group {
            if self.events.has_listeners(event, &cs.meta) {
                self.events.dispatch(event, &cs.entity, Some(cs))?;
            }
        }
        Ok(())
    }

    async fn run_inserts(
        &self,
        cx: &Cx,
        persister: &ChangeSetPersister<'_, D>,
        group: &mut [ChangeSet],
    ) -> Outcome<Vec<ExtraUpdate>, Error> {
        if let Err(e) = self.fire_before(EventType::BeforeCreate, group) {
            return Outcome::Err(e);
        }
        let extra = match persister.execute_inserts(cx, group).await {
            Outcome::Ok(extra) => extra,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        if let Err(e) = self.fire_after(EventType::AfterCreate, group) {
            return Outcome::Err(e);
        }
        Outcome::Ok(extra)
    }

    async fn run_updates(
        &self,
        cx: &Cx,
        persister: &ChangeSetPersister<'_, D>,
        group: &mut [ChangeSet],
        defer_unique: bool,
    ) -> Outcome<(usize, Vec<ExtraUpdate>), Error> {
        if let Err(e) = self.fire_before(EventType::BeforeUpdate, group) {
            return Outcome::Err(e);
        }
        let mut deferred = Vec::new();
        if defer_unique {
            deferred.extend(group.iter_mut().filter_map(defer_unique_columns));
        }
        let (issued, extra) = match persister.execute_updates(cx, group).await {
            Outcome::Ok(done) => done,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        if let Err(e) = self.fire_after(EventType::AfterUpdate, group) {
            return Outcome::Err(e);
        }
        deferred.extend(extra);
        Outcome::Ok((issued, deferred))
    }

    async fn run_deletes(
        &self,
        cx: &Cx,
        persister: &ChangeSetPersister<'_, D>,
        group: &mut [ChangeSet],
    ) -> Outcome<usize, Error> {
        if let Err(e) = self.fire_before(EventType::BeforeDelete, group) {
            return Outcome::Err(e);
        }
        match persister.execute_deletes(cx, group).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        if let Err(e) = self.fire_after(EventType::AfterDelete, group) {
            return Outcome::Err(e);
        }
        Outcome::Ok(group.len())
    }

    /// Refresh identities and snapshots after a successful flush.
    fn post_commit(&mut self, plan: &FlushPlan) {
        for cs in plan.iter().filter(|cs| !cs.kind.is_delete()) {
            if let Err(e) = self.identity_map.store(&cs.entity) {
                tracing::warn!(entity = cs.name(), error = %e, "Persisted entity has no identity");
                continue;
            }
            self.index_unique(&cs.entity);
            self.tracker.snapshot(&cs.entity);
        }
        for update in self.collection_updates.iter() {
            snapshot_collections(&update.owner);
        }
        for cs in plan.iter().filter(|cs| cs.kind.is_delete()) {
            self.unset_identity(&cs.entity);
        }
        self.post_commit_cleanup();
    }

    fn post_commit_cleanup(&mut self) {
        self.persist_stack.clear();
        self.remove_stack.clear();
        self.orphan_remove_stack.clear();
        self.collection_updates.clear();
        self.processing.clear();
    }

    /// Detach a deleted entity from the identity map and from every managed
    /// entity pointing back at it.
    fn unset_identity(&mut self, entity: &EntityRef) {
        self.identity_map.delete(entity);
        self.tracker.clear(entity.id());

        let meta = Arc::clone(entity.meta());
        for rel in &meta.relations {
            let Some(back) = rel.counterpart() else {
                continue;
            };
            for other in related(entity, rel) {
                let Some(back_rel) = other.meta().get_relation(back).copied() else {
                    continue;
                };
                if back_rel.is_collection() {
                    other.remove_member_raw(back, entity);
                    let mut data = other.write();
                    if let Some(collection) = data.collection_mut(back) {
                        if let Some(snapshot) = collection.snapshot() {
                            let members = snapshot
                                .iter()
                                .filter(|m| m.id != entity.id())
                                .cloned()
                                .collect();
                            collection.set_snapshot(members);
                        }
                    }
                } else if other
                    .get_reference(back)
                    .is_some_and(|current| current.ptr_eq(entity))
                {
                    if let Err(e) = other.set_link_raw(back, None) {
                        tracing::trace!(error = %e, "Back-reference already gone");
                    }
                    if back_rel.is_to_one_owner() {
                        self.tracker.patch(other.id(), back, Value::Null);
                    }
                }
            }
        }
        entity.clear_primary_key();
        tracing::trace!(entity = entity.name(), "Identity unset");
    }

    // ========================================================================
    // Locking
    // ========================================================================

    /// Verify or acquire a lock on a managed entity.
    ///
    /// Optimistic mode compares the held version against `expected_version`.
    /// Pessimistic modes take a row lock and need an active transaction.
    pub async fn lock(
        &self,
        cx: &Cx,
        entity: &EntityRef,
        mode: LockMode,
        expected_version: Option<Value>,
    ) -> Outcome<(), Error> {
        let meta = Arc::clone(entity.meta());
        if !self.identity_map.contains(entity) {
            return Outcome::Err(ValidationError::not_managed(meta.name).into());
        }
        let Some(key) = entity.primary_key() else {
            return Outcome::Err(ValidationError::missing_primary_key(meta.name).into());
        };

        if !mode.is_pessimistic() {
            let Some(version) = meta.version_field else {
                return Outcome::Err(
                    ValidationError::invalid_metadata(
                        meta.name,
                        format!("entity '{}' has no version field", meta.name),
                    )
                    .into(),
                );
            };
            let held = entity.get(version);
            if let Some(expected) = expected_version {
                if expected != held {
                    return Outcome::Err(
                        OptimisticLockError::version_mismatch(
                            meta.name,
                            primary_key_hash(&key),
                            expected,
                            held,
                        )
                        .into(),
                    );
                }
            }
            return Outcome::Ok(());
        }

        let Some(ctx) = &self.transaction else {
            return Outcome::Err(ValidationError::transaction_required("pessimistic lock").into());
        };
        tracing::debug!(entity = meta.name, mode = ?mode, "Acquiring pessimistic lock");
        self.driver
            .lock_pessimistic(cx, &meta, &key, mode, ctx.tx())
            .await
    }

    // ========================================================================
    // Transaction Management
    // ========================================================================

    /// Open a transaction that subsequent flushes run inside.
    pub async fn begin_transaction(
        &mut self,
        cx: &Cx,
        options: TransactionOptions,
    ) -> Outcome<(), Error> {
        if self.transaction.is_some() {
            return Outcome::Err(TransactionError::already_active().into());
        }
        match self.driver.begin(cx, options).await {
            Outcome::Ok(tx) => {
                tracing::debug!(isolation = options.isolation.as_sql(), "Transaction started");
                self.transaction = Some(TransactionContext::new(tx, options));
                Outcome::Ok(())
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Flush, then commit the open transaction. A failed flush rolls it back.
    pub async fn commit_transaction(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.transaction.is_none() {
            return Outcome::Err(TransactionError::not_active().into());
        }
        let failure = match self.commit(cx).await {
            Outcome::Ok(_) => None,
            Outcome::Err(e) => Some(Outcome::Err(e)),
            Outcome::Cancelled(r) => Some(Outcome::Cancelled(r)),
            Outcome::Panicked(p) => Some(Outcome::Panicked(p)),
        };
        if let Some(failure) = failure {
            if let Outcome::Err(e) = self.rollback_transaction(cx).await {
                tracing::warn!(error = %e, "Rollback after failed flush failed");
            }
            return failure;
        }

        let Some(ctx) = self.transaction.take() else {
            return Outcome::Err(TransactionError::not_active().into());
        };
        let elapsed_ms = u64::try_from(ctx.elapsed().as_millis()).unwrap_or(u64::MAX);
        match self.driver.commit(cx, ctx.into_inner()).await {
            Outcome::Ok(()) => {
                tracing::debug!(elapsed_ms, "Transaction committed");
                Outcome::Ok(())
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Roll back the open transaction.
    ///
    /// Entities flushed inside it keep their managed state; call
    /// [`clear`](Self::clear) to drop it.
    pub async fn rollback_transaction(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let Some(ctx) = self.transaction.take() else {
            return Outcome::Err(TransactionError::not_active().into());
        };
        tracing::warn!("Rolling back transaction");
        self.driver.rollback(cx, ctx.into_inner()).await
    }

    /// Run `work` inside a transaction.
    ///
    /// Pending changes are flushed and the transaction committed when `work`
    /// succeeds; any other outcome rolls back. Inside an already active
    /// transaction `work` simply joins it.
    pub async fn transactional<T, F>(
        &mut self,
        cx: &Cx,
        options: TransactionOptions,
        work: F,
    ) -> Outcome<T, Error>
    where
        F: AsyncFnOnce(&mut Self) -> Outcome<T, Error>,
    {
        if self.transaction.is_some() {
            return work(&mut *self).await;
        }
        match self.begin_transaction(cx, options).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        let value = match work(&mut *self).await {
            Outcome::Ok(value) => value,
            failure => {
                if let Outcome::Err(e) = self.rollback_transaction(cx).await {
                    tracing::warn!(error = %e, "Rollback failed");
                }
                return failure;
            }
        };
        match self.commit_transaction(cx).await {
            Outcome::Ok(()) => Outcome::Ok(value),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Detach every entity and drop all pending work.
    pub fn clear(&mut self) {
        self.identity_map.clear();
        self.tracker.clear_all();
        self.change_sets.clear();
        self.post_commit_cleanup();
        tracing::debug!("Unit of work cleared");
    }
}

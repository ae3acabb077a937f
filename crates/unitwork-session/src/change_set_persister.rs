//! Executes homogeneous batches of change sets against a driver.
//!
//! Every batch holds change sets of a single entity type and a single kind.
//! The persister maps backend-generated values back onto entities, enforces
//! optimistic locking and turns references it cannot resolve yet into
//! extra updates for a later phase.

use std::time::{SystemTime, UNIX_EPOCH};

use asupersync::{Cx, Outcome};
use unitwork_core::{
    CollectionDiff, Driver, EntityMeta, EntityRef, Error, Filter, InsertResult,
    OptimisticLockError, Payload, Platform, ValidationError, Value,
};

use crate::change_set::{ChangeSet, CollectionUpdate, ExtraUpdate};
use crate::identity_map::primary_key_hash;

/// Current time in microseconds, used for timestamp versions.
pub(crate) fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
}

/// Runs change sets against a driver within one (optional) transaction.
pub struct ChangeSetPersister<'a, D: Driver> {
    driver: &'a D,
    tx: Option<&'a D::Tx>,
    platform: Platform,
    batch_size: usize,
}

impl<'a, D: Driver> ChangeSetPersister<'a, D> {
    pub fn new(driver: &'a D, tx: Option<&'a D::Tx>, batch_size: usize) -> Self {
        Self {
            driver,
            tx,
            platform: driver.platform(),
            batch_size: batch_size.max(1),
        }
    }

    /// Insert a batch of creates.
    ///
    /// References that still point at entities without a primary key are
    /// left out of the row and returned as extra updates.
    #[tracing::instrument(level = "debug", skip_all, fields(count = change_sets.len()))]
    pub async fn execute_inserts(
        &self,
        cx: &Cx,
        change_sets: &mut [ChangeSet],
    ) -> Outcome<Vec<ExtraUpdate>, Error> {
        let Some(meta) = change_sets.first().map(|cs| std::sync::Arc::clone(&cs.meta)) else {
            return Outcome::Ok(Vec::new());
        };

        let mut extra = Vec::new();
        for cs in change_sets.iter_mut() {
            if let Err(e) = validate_insert_key(&meta, &cs.entity) {
                return Outcome::Err(e);
            }
            if let Some(update) = resolve_pending(cs) {
                extra.push(update);
            }
            if let Some(version) = meta.version_field {
                let current = cs.entity.get(version);
                if current.is_null() {
                    match current.next_version(now_micros()) {
                        Ok(v) => {
                            cs.payload.insert(version, v);
                            cs.previous_version = Some(Value::Null);
                        }
                        Err(e) => return Outcome::Err(e),
                    }
                }
            }
        }

        tracing::debug!(entity = meta.name, count = change_sets.len(), "Executing inserts");

        if self.platform.uses_batch_inserts && change_sets.len() > 1 {
            for chunk in change_sets.chunks_mut(self.batch_size) {
                let rows: Vec<Payload> = chunk.iter().map(|cs| cs.payload.clone()).collect();
                let results = match self
                    .driver
                    .native_insert_many(cx, &meta, rows, self.tx)
                    .await
                {
                    Outcome::Ok(results) => results,
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                };
                for (cs, result) in chunk.iter_mut().zip(results) {
                    map_insert_result(cs, result);
                }
            }
        } else {
            for cs in change_sets.iter_mut() {
                let result = match self
                    .driver
                    .native_insert(cx, &meta, cs.payload.clone(), self.tx)
                    .await
                {
                    Outcome::Ok(result) => result,
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                };
                map_insert_result(cs, result);
            }
        }

        Outcome::Ok(extra)
    }

    /// Update a batch of entities, one statement per row.
    ///
    /// Versioned entities are matched on the version they hold; zero affected
    /// rows means someone else changed the row and fails the flush. Returns
    /// the number of statements issued along with the deferred writes; change
    /// sets left without a payload are skipped.
    #[tracing::instrument(level = "debug", skip_all, fields(count = change_sets.len()))]
    pub async fn execute_updates(
        &self,
        cx: &Cx,
        change_sets: &mut [ChangeSet],
    ) -> Outcome<(usize, Vec<ExtraUpdate>), Error> {
        let mut extra = Vec::new();
        let mut issued = 0;
        for cs in change_sets.iter_mut() {
            if let Some(update) = resolve_pending(cs) {
                extra.push(update);
            }
            match self.update_one(cx, cs).await {
                Outcome::Ok(true) => issued += 1,
                Outcome::Ok(false) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok((issued, extra))
    }

    async fn update_one(&self, cx: &Cx, cs: &mut ChangeSet) -> Outcome<bool, Error> {
        let meta = std::sync::Arc::clone(&cs.meta);
        if cs.payload.is_empty() {
            cs.persisted = true;
            return Outcome::Ok(false);
        }
        let key = original_key(cs);
        let Some(key) = key else {
            return Outcome::Err(ValidationError::missing_primary_key(meta.name).into());
        };

        let mut filter = Filter::primary_key(&meta, &key);
        let mut payload = cs.payload.clone();
        let mut version_change = None;
        if let Some(version) = meta.version_field {
            let held = cs.entity.get(version);
            let next = match held.next_version(now_micros()) {
                Ok(v) => v,
                Err(e) => return Outcome::Err(e),
            };
            filter = filter.eq(version, held.clone());
            payload.insert(version, next.clone());
            version_change = Some((version, held, next));
        }

        tracing::debug!(
            entity = meta.name,
            columns = ?payload.keys().collect::<Vec<_>>(),
            "Executing update"
        );
        let result = match self
            .driver
            .native_update(cx, &meta, filter, payload, self.tx)
            .await
        {
            Outcome::Ok(result) => result,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        if let Some((version, held, next)) = version_change {
            if result.affected_rows == 0 {
                tracing::warn!(entity = meta.name, "Optimistic lock failed");
                return Outcome::Err(Error::OptimisticLock(OptimisticLockError::lock_failed(
                    meta.name,
                    primary_key_hash(&key),
                    held,
                )));
            }
            cs.previous_version = Some(held);
            cs.entity.set(version, next);
        }
        cs.persisted = true;
        Outcome::Ok(true)
    }

    /// Delete a batch of entities by primary key set.
    #[tracing::instrument(level = "debug", skip_all, fields(count = change_sets.len()))]
    pub async fn execute_deletes(
        &self,
        cx: &Cx,
        change_sets: &mut [ChangeSet],
    ) -> Outcome<(), Error> {
        let Some(meta) = change_sets.first().map(|cs| std::sync::Arc::clone(&cs.meta)) else {
            return Outcome::Ok(());
        };
        for chunk in change_sets.chunks_mut(self.batch_size) {
            let keys: Vec<Vec<Value>> = chunk.iter().filter_map(original_key).collect();
            if keys.is_empty() {
                continue;
            }
            tracing::debug!(entity = meta.name, count = keys.len(), "Executing deletes");
            let filter = Filter::new().keys_in(meta.primary_keys.clone(), keys);
            match self.driver.native_delete(cx, &meta, filter, self.tx).await {
                Outcome::Ok(_) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
            for cs in chunk.iter_mut() {
                cs.persisted = true;
            }
        }
        Outcome::Ok(())
    }

    /// Write properties deferred from an insert or update.
    ///
    /// Returns `false` when there was nothing to write.
    pub async fn execute_extra_update(
        &self,
        cx: &Cx,
        update: &ExtraUpdate,
    ) -> Outcome<bool, Error> {
        let meta = std::sync::Arc::clone(update.entity.meta());
        let Some(key) = update.entity.primary_key() else {
            return Outcome::Err(ValidationError::missing_primary_key(meta.name).into());
        };

        let mut payload = update.values.clone();
        for (name, pending) in &update.pending {
            if let Some(value) = pending.resolve() {
                payload.insert(*name, value);
            }
        }
        for name in &update.properties {
            if payload.contains_key(name) {
                continue;
            }
            payload.insert(*name, current_value(&update.entity, name));
        }
        if payload.is_empty() {
            return Outcome::Ok(false);
        }

        tracing::debug!(
            entity = meta.name,
            columns = ?payload.keys().collect::<Vec<_>>(),
            "Executing extra update"
        );
        let filter = Filter::primary_key(&meta, &key);
        match self
            .driver
            .native_update(cx, &meta, filter, payload, self.tx)
            .await
        {
            Outcome::Ok(_) => Outcome::Ok(true),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Reconcile the pivot rows of one owning collection.
    ///
    /// Returns `false` when the collection had no net changes.
    pub async fn sync_collection(
        &self,
        cx: &Cx,
        update: &CollectionUpdate,
    ) -> Outcome<bool, Error> {
        let owner = &update.owner;
        let meta = owner.meta();
        let Some(rel) = meta.get_relation(update.relation).copied() else {
            return Outcome::Err(ValidationError::unknown_property(meta.name, update.relation).into());
        };
        let Some(pivot_table) = rel.pivot_table else {
            return Outcome::Ok(false);
        };
        let Some(owner_key) = owner.primary_key() else {
            return Outcome::Err(ValidationError::missing_primary_key(meta.name).into());
        };

        let (added, removed) = {
            let data = owner.read();
            let Some(collection) = data.collection(update.relation) else {
                return Outcome::Ok(false);
            };
            (collection.added(), collection.removed())
        };
        let mut added_keys = Vec::with_capacity(added.len());
        for item in &added {
            match item.primary_key() {
                Some(key) => added_keys.push(key),
                None => {
                    return Outcome::Err(ValidationError::missing_primary_key(item.name()).into());
                }
            }
        }
        let diff = CollectionDiff {
            owner: meta.name,
            relation: update.relation,
            pivot_table,
            owner_key,
            added: added_keys,
            removed: removed.into_iter().map(|m| m.key).collect(),
        };
        if diff.is_empty() {
            return Outcome::Ok(false);
        }

        tracing::debug!(
            entity = meta.name,
            relation = update.relation,
            added = diff.added.len(),
            removed = diff.removed.len(),
            "Synchronizing collection"
        );
        match self.driver.sync_collection(cx, &diff, self.tx).await {
            Outcome::Ok(()) => Outcome::Ok(true),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }
}

/// A primary key must be present unless the backend generates it.
fn validate_insert_key(meta: &EntityMeta, entity: &EntityRef) -> Result<(), Error> {
    if meta.generated_primary_key().is_some() {
        return Ok(());
    }
    let present = meta
        .primary_keys
        .iter()
        .filter(|pk| !entity.get(pk).is_null())
        .count();
    if present == meta.primary_keys.len() {
        Ok(())
    } else if meta.is_composite_key() && present > 0 {
        Err(ValidationError::invalid_composite_key(meta.name, meta.primary_keys.len(), present).into())
    } else {
        Err(ValidationError::missing_primary_key(meta.name).into())
    }
}

/// Move resolvable pending references into the payload.
fn resolve_pending(cs: &mut ChangeSet) -> Option<ExtraUpdate> {
    if cs.pending.is_empty() {
        return None;
    }
    let pending = std::mem::take(&mut cs.pending);
    let mut extra = ExtraUpdate::new(cs.entity.clone());
    for (name, reference) in pending {
        match reference.resolve() {
            Some(value) => {
                cs.payload.insert(name, value);
            }
            None => {
                extra.add_property(name);
                extra.pending.insert(name, reference);
            }
        }
    }
    if extra.properties.is_empty() {
        None
    } else {
        tracing::trace!(
            entity = cs.name(),
            properties = ?extra.properties,
            "Deferring unresolved references"
        );
        Some(extra)
    }
}

/// Primary key the row had before this flush.
fn original_key(cs: &ChangeSet) -> Option<Vec<Value>> {
    let Some(original) = &cs.original else {
        return cs.entity.primary_key();
    };
    let key: Vec<Value> = cs
        .meta
        .primary_keys
        .iter()
        .map(|pk| original.get(pk).cloned().unwrap_or(Value::Null))
        .collect();
    if key.iter().any(Value::is_null) {
        cs.entity.primary_key()
    } else {
        Some(key)
    }
}

/// Column value of a property as it would be written now.
fn current_value(entity: &EntityRef, property: &str) -> Value {
    let Some(rel) = entity.meta().get_relation(property).copied() else {
        return entity.get(property);
    };
    if rel.is_inline_collection() {
        let keys = entity
            .collection_items(property)
            .iter()
            .filter_map(EntityRef::primary_key_value)
            .collect();
        return Value::Array(keys);
    }
    entity
        .get_reference(property)
        .and_then(|t| t.primary_key_value())
        .unwrap_or(Value::Null)
}

fn map_insert_result(cs: &mut ChangeSet, result: InsertResult) {
    let meta = std::sync::Arc::clone(&cs.meta);
    let mut data = cs.entity.write();
    if let (Some(pk), Some(id)) = (meta.generated_primary_key(), result.insert_id) {
        if data.get(pk).is_null() {
            data.set(pk, id);
        }
    }
    if let Some(row) = result.row {
        for (column, value) in row.iter() {
            if let Some(field) = meta.fields.iter().find(|f| f.name == column) {
                data.set(field.name, value.clone());
            }
        }
    }
    if let Some(version) = meta.version_field {
        if let Some(v) = cs.payload.get(version) {
            if data.get(version).is_null() {
                data.set(version, v.clone());
            }
        }
    }
    data.set_initialized(true);
    cs.persisted = true;
}

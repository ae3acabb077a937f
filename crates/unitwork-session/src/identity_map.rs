//! Identity map keyed by schema, inheritance root and primary key hash.
//!
//! The identity map guarantees that each database row corresponds to exactly
//! one managed instance within a unit of work. It holds only weak handles:
//! the application owns its entities, the map only finds them.
//!
//! # Example
//!
//! ```ignore
//! let mut map = IdentityMap::new();
//! map.store(&author)?;
//!
//! let found = map.get("Author", None, &[Value::Int(1)]);
//! assert_eq!(found, Some(author));
//! ```

use std::collections::{BTreeMap, HashMap};

use unitwork_core::{EntityId, EntityRef, Result, ValidationError, Value, WeakEntityRef};

/// Hash a primary key for identity lookups.
///
/// Composite keys are joined in declaration order, so `(1, "a")` and
/// `("a", 1)` never collide.
pub fn primary_key_hash(values: &[Value]) -> String {
    values
        .iter()
        .map(Value::key_fragment)
        .collect::<Vec<_>>()
        .join("~~~")
}

/// Hash the values of a unique property group, `None` if any part is unset.
///
/// To-one properties contribute the target's primary key.
pub fn unique_hash(entity: &EntityRef, properties: &[&'static str]) -> Option<String> {
    let mut parts = Vec::with_capacity(properties.len());
    for prop in properties {
        let value = if entity.meta().get_relation(prop).is_some() {
            entity.get_reference(prop)?.primary_key_value()?
        } else {
            entity.get(prop)
        };
        if value.is_null() {
            return None;
        }
        parts.push(value);
    }
    Some(unique_hash_of(properties, &parts))
}

/// Hash of a unique property group from explicit values.
pub fn unique_hash_of(properties: &[&str], values: &[Value]) -> String {
    format!("{}={}", properties.join("+"), primary_key_hash(values))
}

/// Key of one identity map row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub schema: Option<String>,
    pub root: &'static str,
    pub hash: String,
}

impl IdentityKey {
    pub fn new(root: &'static str, schema: Option<&str>, hash: impl Into<String>) -> Self {
        Self {
            schema: schema.map(str::to_string),
            root,
            hash: hash.into(),
        }
    }

    fn for_entity(entity: &EntityRef, hash: String) -> Self {
        Self {
            schema: entity.schema(),
            root: entity.root(),
            hash,
        }
    }
}

#[derive(Debug)]
struct Registration {
    primary: IdentityKey,
    alternates: Vec<IdentityKey>,
}

/// Identity map for managed entities.
#[derive(Debug, Default)]
pub struct IdentityMap {
    primary: HashMap<IdentityKey, WeakEntityRef>,
    unique: HashMap<IdentityKey, WeakEntityRef>,
    registrations: BTreeMap<EntityId, (WeakEntityRef, Registration)>,
}

impl IdentityMap {
    /// Create a new empty identity map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or overwrite the entry for the entity's current primary key.
    ///
    /// An entity whose primary key changed is re-keyed; an entry that
    /// belonged to a different instance is evicted with its alternates.
    pub fn store(&mut self, entity: &EntityRef) -> Result<()> {
        let Some(pk) = entity.primary_key() else {
            return Err(ValidationError::missing_primary_key(entity.name()).into());
        };
        let key = IdentityKey::for_entity(entity, primary_key_hash(&pk));

        if let Some(previous) = self.primary.get(&key) {
            if previous.id() != entity.id() {
                let evicted = previous.id();
                self.delete_by_id(evicted);
            }
        }
        if let Some((_, reg)) = self.registrations.get_mut(&entity.id()) {
            if reg.primary != key {
                let old = std::mem::replace(&mut reg.primary, key.clone());
                self.primary.remove(&old);
            }
        } else {
            self.registrations.insert(
                entity.id(),
                (
                    entity.downgrade(),
                    Registration {
                        primary: key.clone(),
                        alternates: Vec::new(),
                    },
                ),
            );
        }

        tracing::trace!(
            entity = entity.name(),
            pk_hash = %key.hash,
            "Storing entity in identity map"
        );
        self.primary.insert(key, entity.downgrade());
        Ok(())
    }

    /// Index an entity under an alternate unique key.
    ///
    /// The entity must already be stored under its primary key.
    pub fn store_unique(&mut self, entity: &EntityRef, hash: String) {
        let key = IdentityKey::for_entity(entity, hash);
        let Some((_, reg)) = self.registrations.get_mut(&entity.id()) else {
            return;
        };
        if !reg.alternates.contains(&key) {
            reg.alternates.push(key.clone());
        }
        self.unique.insert(key, entity.downgrade());
    }

    /// Look up a managed entity by primary key hash.
    pub fn get_by_hash(
        &self,
        root: &'static str,
        schema: Option<&str>,
        hash: &str,
    ) -> Option<EntityRef> {
        self.primary
            .get(&IdentityKey::new(root, schema, hash))
            .and_then(WeakEntityRef::upgrade)
    }

    /// Look up a managed entity by primary key values.
    pub fn get(
        &self,
        root: &'static str,
        schema: Option<&str>,
        primary_key: &[Value],
    ) -> Option<EntityRef> {
        self.get_by_hash(root, schema, &primary_key_hash(primary_key))
    }

    /// Look up a managed entity by an alternate unique key hash.
    pub fn get_by_unique(
        &self,
        root: &'static str,
        schema: Option<&str>,
        hash: &str,
    ) -> Option<EntityRef> {
        self.unique
            .get(&IdentityKey::new(root, schema, hash))
            .and_then(WeakEntityRef::upgrade)
    }

    /// Is this exact instance registered?
    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.registrations
            .get(&entity.id())
            .is_some_and(|(weak, _)| weak.is_alive())
    }

    /// Remove the entity's primary entry and every alternate entry.
    pub fn delete(&mut self, entity: &EntityRef) -> bool {
        self.delete_by_id(entity.id())
    }

    fn delete_by_id(&mut self, id: EntityId) -> bool {
        let Some((_, reg)) = self.registrations.remove(&id) else {
            return false;
        };
        if self.primary.get(&reg.primary).is_some_and(|w| w.id() == id) {
            self.primary.remove(&reg.primary);
        }
        for key in &reg.alternates {
            if self.unique.get(key).is_some_and(|w| w.id() == id) {
                self.unique.remove(key);
            }
        }
        true
    }

    /// Live managed entities in registration order.
    pub fn values(&self) -> Vec<EntityRef> {
        self.registrations
            .values()
            .filter_map(|(weak, _)| weak.upgrade())
            .collect()
    }

    /// Live managed entities sharing an inheritance root.
    pub fn entities_of(&self, root: &str) -> Vec<EntityRef> {
        self.registrations
            .values()
            .filter(|(_, reg)| reg.primary.root == root)
            .filter_map(|(weak, _)| weak.upgrade())
            .collect()
    }

    /// Drop entries whose entity no longer exists.
    pub fn prune(&mut self) {
        let dead: Vec<EntityId> = self
            .registrations
            .iter()
            .filter(|(_, (weak, _))| !weak.is_alive())
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            self.delete_by_id(id);
        }
    }

    /// Clear all entries from the identity map.
    pub fn clear(&mut self) {
        self.primary.clear();
        self.unique.clear();
        self.registrations.clear();
    }

    /// Get the number of live entries in the map.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registrations
            .values()
            .filter(|(weak, _)| weak.is_alive())
            .count()
    }

    /// Check if the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

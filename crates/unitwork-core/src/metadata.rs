//! Entity metadata consumed by the unit of work.
//!
//! Metadata is supplied by an external provider (derive macros, schema
//! readers, hand-written tables). The engine only needs enough to compute
//! primary keys, relation cardinalities, cascades, version columns, unique
//! constraints and lifecycle hook registrations.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::entity::EntityData;
use crate::error::{Result, ValidationError};
use crate::value::Value;

/// Generates a value for a field on create or update.
pub type ValueGenerator = fn(&EntityData) -> Value;

/// Entity-level lifecycle hook registered in metadata.
pub type LifecycleHook = fn(&mut EntityData) -> Result<()>;

/// Lifecycle and flush events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    BeforeCreate,
    AfterCreate,
    BeforeUpdate,
    AfterUpdate,
    BeforeDelete,
    AfterDelete,
    BeforeFlush,
    OnFlush,
    AfterFlush,
}

impl EventType {
    /// Flush-level events receive the whole unit of work instead of an entity.
    pub const fn is_flush_event(self) -> bool {
        matches!(
            self,
            EventType::BeforeFlush | EventType::OnFlush | EventType::AfterFlush
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            EventType::BeforeCreate => "beforeCreate",
            EventType::AfterCreate => "afterCreate",
            EventType::BeforeUpdate => "beforeUpdate",
            EventType::AfterUpdate => "afterUpdate",
            EventType::BeforeDelete => "beforeDelete",
            EventType::AfterDelete => "afterDelete",
            EventType::BeforeFlush => "beforeFlush",
            EventType::OnFlush => "onFlush",
            EventType::AfterFlush => "afterFlush",
        }
    }
}

/// Scalar property of an entity.
#[derive(Debug, Clone, Copy)]
pub struct FieldInfo {
    pub name: &'static str,
    pub primary_key: bool,
    /// Primary key generated by the backend (auto-increment, sequence)
    pub generated: bool,
    pub nullable: bool,
    pub unique: bool,
    /// Optimistic-lock version column
    pub version: bool,
    /// `false` for computed properties that are never written
    pub persist: bool,
    pub on_create: Option<ValueGenerator>,
    pub on_update: Option<ValueGenerator>,
}

impl FieldInfo {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            primary_key: false,
            generated: false,
            nullable: false,
            unique: false,
            version: false,
            persist: true,
            on_create: None,
            on_update: None,
        }
    }

    pub const fn primary_key(mut self, value: bool) -> Self {
        self.primary_key = value;
        self
    }

    pub const fn generated(mut self, value: bool) -> Self {
        self.generated = value;
        self
    }

    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    pub const fn unique(mut self, value: bool) -> Self {
        self.unique = value;
        self
    }

    pub const fn version(mut self, value: bool) -> Self {
        self.version = value;
        self
    }

    pub const fn persist(mut self, value: bool) -> Self {
        self.persist = value;
        self
    }

    pub const fn on_create(mut self, generator: ValueGenerator) -> Self {
        self.on_create = Some(generator);
        self
    }

    pub const fn on_update(mut self, generator: ValueGenerator) -> Self {
        self.on_update = Some(generator);
        self
    }
}

/// Cardinality of a relation property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    ManyToOne,
    OneToOne,
    OneToMany,
    ManyToMany,
}

/// Set of cascaded operations.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cascade(u8);

impl Cascade {
    pub const NONE: Cascade = Cascade(0);
    pub const PERSIST: Cascade = Cascade(1);
    pub const MERGE: Cascade = Cascade(1 << 1);
    pub const REMOVE: Cascade = Cascade(1 << 2);
    pub const ALL: Cascade = Cascade(0b111);

    pub const fn union(self, other: Cascade) -> Cascade {
        Cascade(self.0 | other.0)
    }

    pub const fn contains(self, other: Cascade) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl Default for Cascade {
    fn default() -> Self {
        Cascade::PERSIST
    }
}

impl fmt::Debug for Cascade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.contains(Cascade::PERSIST) {
            parts.push("persist");
        }
        if self.contains(Cascade::MERGE) {
            parts.push("merge");
        }
        if self.contains(Cascade::REMOVE) {
            parts.push("remove");
        }
        write!(f, "Cascade[{}]", parts.join(", "))
    }
}

/// Relation property of an entity.
#[derive(Debug, Clone, Copy)]
pub struct RelationInfo {
    pub name: &'static str,
    pub kind: RelationKind,
    /// Target entity name
    pub target: &'static str,
    /// Owning side holds the foreign key (or pivot rows)
    pub owner: bool,
    /// Owning property on the target, set on inverse sides
    pub mapped_by: Option<&'static str>,
    /// Inverse property on the target, set on owning sides
    pub inversed_by: Option<&'static str>,
    pub nullable: bool,
    pub persist: bool,
    pub cascade: Cascade,
    pub orphan_removal: bool,
    /// Pivot table for owning many-to-many; `None` stores members inline
    pub pivot_table: Option<&'static str>,
}

impl RelationInfo {
    const fn base(name: &'static str, kind: RelationKind, target: &'static str) -> Self {
        Self {
            name,
            kind,
            target,
            owner: false,
            mapped_by: None,
            inversed_by: None,
            nullable: false,
            persist: true,
            cascade: Cascade::PERSIST,
            orphan_removal: false,
            pivot_table: None,
        }
    }

    /// Owning to-one holding a foreign key.
    pub const fn many_to_one(name: &'static str, target: &'static str) -> Self {
        let mut rel = Self::base(name, RelationKind::ManyToOne, target);
        rel.owner = true;
        rel
    }

    /// Owning one-to-one; call [`mapped_by`](Self::mapped_by) for the inverse side.
    pub const fn one_to_one(name: &'static str, target: &'static str) -> Self {
        let mut rel = Self::base(name, RelationKind::OneToOne, target);
        rel.owner = true;
        rel
    }

    /// Inverse collection of a many-to-one on `target`.
    pub const fn one_to_many(
        name: &'static str,
        target: &'static str,
        mapped_by: &'static str,
    ) -> Self {
        let mut rel = Self::base(name, RelationKind::OneToMany, target);
        rel.mapped_by = Some(mapped_by);
        rel
    }

    /// Owning many-to-many synchronized through `pivot_table`.
    pub const fn many_to_many(
        name: &'static str,
        target: &'static str,
        pivot_table: &'static str,
    ) -> Self {
        let mut rel = Self::base(name, RelationKind::ManyToMany, target);
        rel.owner = true;
        rel.pivot_table = Some(pivot_table);
        rel
    }

    /// Owning many-to-many stored as an array of member keys on the owner row.
    pub const fn many_to_many_inline(name: &'static str, target: &'static str) -> Self {
        let mut rel = Self::base(name, RelationKind::ManyToMany, target);
        rel.owner = true;
        rel
    }

    /// Turn this relation into the inverse side of `property` on the target.
    pub const fn mapped_by(mut self, property: &'static str) -> Self {
        self.owner = false;
        self.mapped_by = Some(property);
        self.pivot_table = None;
        self
    }

    pub const fn inversed_by(mut self, property: &'static str) -> Self {
        self.inversed_by = Some(property);
        self
    }

    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    pub const fn persist(mut self, value: bool) -> Self {
        self.persist = value;
        self
    }

    pub const fn cascade(mut self, cascade: Cascade) -> Self {
        self.cascade = cascade;
        self
    }

    pub const fn orphan_removal(mut self, value: bool) -> Self {
        self.orphan_removal = value;
        self
    }

    /// Many-to-one, or the owning side of a one-to-one.
    pub const fn is_to_one_owner(&self) -> bool {
        match self.kind {
            RelationKind::ManyToOne => true,
            RelationKind::OneToOne => self.owner,
            _ => false,
        }
    }

    pub const fn is_to_one(&self) -> bool {
        matches!(self.kind, RelationKind::ManyToOne | RelationKind::OneToOne)
    }

    pub const fn is_collection(&self) -> bool {
        matches!(self.kind, RelationKind::OneToMany | RelationKind::ManyToMany)
    }

    /// Owning many-to-many without a pivot table.
    pub const fn is_inline_collection(&self) -> bool {
        matches!(self.kind, RelationKind::ManyToMany) && self.owner && self.pivot_table.is_none()
    }

    /// Owning many-to-many reconciled through a pivot table.
    pub const fn is_pivot_collection(&self) -> bool {
        matches!(self.kind, RelationKind::ManyToMany) && self.owner && self.pivot_table.is_some()
    }

    /// Property on the other side of a bidirectional pair.
    pub const fn counterpart(&self) -> Option<&'static str> {
        if self.owner {
            self.inversed_by
        } else {
            self.mapped_by
        }
    }
}

/// Everything the engine knows about one entity type.
#[derive(Debug, Clone)]
pub struct EntityMeta {
    pub name: &'static str,
    /// Inheritance root; identity and commit order are tracked per root
    pub root: &'static str,
    pub table: &'static str,
    pub schema: Option<&'static str>,
    pub primary_keys: Vec<&'static str>,
    pub fields: Vec<FieldInfo>,
    pub relations: Vec<RelationInfo>,
    /// Composite unique constraints (single-field ones are flagged on the field)
    pub unique_constraints: Vec<Vec<&'static str>>,
    pub version_field: Option<&'static str>,
    pub read_only: bool,
    hooks: HashMap<EventType, Vec<LifecycleHook>>,
}

impl EntityMeta {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            root: name,
            table: name,
            schema: None,
            primary_keys: Vec::new(),
            fields: Vec::new(),
            relations: Vec::new(),
            unique_constraints: Vec::new(),
            version_field: None,
            read_only: false,
            hooks: HashMap::new(),
        }
    }

    pub fn table(mut self, table: &'static str) -> Self {
        self.table = table;
        self
    }

    pub fn schema(mut self, schema: &'static str) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Declare the inheritance root (single-table inheritance).
    pub fn extends(mut self, root: &'static str) -> Self {
        self.root = root;
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn field(mut self, field: FieldInfo) -> Self {
        if field.primary_key {
            self.primary_keys.push(field.name);
        }
        if field.version {
            self.version_field = Some(field.name);
        }
        self.fields.push(field);
        self
    }

    pub fn relation(mut self, relation: RelationInfo) -> Self {
        self.relations.push(relation);
        self
    }

    /// Declare a composite unique constraint.
    pub fn unique(mut self, properties: &[&'static str]) -> Self {
        self.unique_constraints.push(properties.to_vec());
        self
    }

    pub fn hook(mut self, event: EventType, hook: LifecycleHook) -> Self {
        self.hooks.entry(event).or_default().push(hook);
        self
    }

    pub fn get_field(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn get_relation(&self, name: &str) -> Option<&RelationInfo> {
        self.relations.iter().find(|r| r.name == name)
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.get_field(name).is_some() || self.get_relation(name).is_some()
    }

    /// The single generated primary key, if the key is backend-assigned.
    pub fn generated_primary_key(&self) -> Option<&'static str> {
        match self.primary_keys.as_slice() {
            [pk] => self
                .get_field(pk)
                .filter(|f| f.generated)
                .map(|f| f.name),
            _ => None,
        }
    }

    pub fn is_composite_key(&self) -> bool {
        self.primary_keys.len() > 1
    }

    /// All unique property groups: unique fields, owning one-to-ones and
    /// declared composite constraints.
    pub fn unique_properties(&self) -> Vec<Vec<&'static str>> {
        let mut groups: Vec<Vec<&'static str>> = self
            .fields
            .iter()
            .filter(|f| f.unique && !f.primary_key)
            .map(|f| vec![f.name])
            .collect();
        groups.extend(
            self.relations
                .iter()
                .filter(|r| r.kind == RelationKind::OneToOne && r.owner)
                .map(|r| vec![r.name]),
        );
        groups.extend(self.unique_constraints.iter().cloned());
        groups
    }

    /// Is this property unique on its own and nullable?
    pub fn is_nullable_unique(&self, name: &str) -> bool {
        if let Some(field) = self.get_field(name) {
            return field.unique && field.nullable;
        }
        self.get_relation(name).is_some_and(|r| {
            r.kind == RelationKind::OneToOne && r.owner && r.nullable
        })
    }

    /// Hooks registered for `event`, in registration order.
    pub fn hooks_for(&self, event: EventType) -> &[LifecycleHook] {
        self.hooks.get(&event).map_or(&[], Vec::as_slice)
    }

    pub fn has_hooks(&self, event: EventType) -> bool {
        !self.hooks_for(event).is_empty()
    }
}

fn identifier_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok())
        .as_ref()
}

/// Does `name` look like a plain identifier (entity, property, schema)?
pub fn is_valid_identifier(name: &str) -> bool {
    identifier_pattern().is_some_and(|re| re.is_match(name))
}

/// Registry of entity metadata keyed by entity name.
#[derive(Debug, Default)]
pub struct MetadataStorage {
    entities: HashMap<&'static str, Arc<EntityMeta>>,
    order: Vec<&'static str>,
}

impl MetadataStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a batch of entity types and validate cross references.
    pub fn build(metas: impl IntoIterator<Item = EntityMeta>) -> Result<Self> {
        let mut storage = Self::new();
        for meta in metas {
            storage.register(meta)?;
        }
        storage.validate()?;
        Ok(storage)
    }

    /// Register one entity type, checking its own declarations.
    pub fn register(&mut self, meta: EntityMeta) -> Result<Arc<EntityMeta>> {
        let name = meta.name;
        for ident in std::iter::once(name)
            .chain(meta.schema)
            .chain(meta.fields.iter().map(|f| f.name))
            .chain(meta.relations.iter().map(|r| r.name))
        {
            if !is_valid_identifier(ident) {
                return Err(ValidationError::invalid_metadata(
                    name,
                    format!("'{ident}' is not a valid identifier"),
                )
                .into());
            }
        }
        if meta.primary_keys.is_empty() {
            return Err(ValidationError::invalid_metadata(
                name,
                format!("entity '{name}' declares no primary key"),
            )
            .into());
        }
        for group in &meta.unique_constraints {
            if let Some(missing) = group.iter().find(|p| !meta.has_property(p)) {
                return Err(ValidationError::unknown_property(name, missing).into());
            }
        }
        if meta.fields.iter().filter(|f| f.version).count() > 1 {
            return Err(ValidationError::invalid_metadata(
                name,
                format!("entity '{name}' declares more than one version field"),
            )
            .into());
        }

        tracing::trace!(entity = name, root = meta.root, "Registering entity metadata");
        let meta = Arc::new(meta);
        if self.entities.insert(name, Arc::clone(&meta)).is_none() {
            self.order.push(name);
        }
        Ok(meta)
    }

    /// Check that relation targets and counterparts resolve.
    pub fn validate(&self) -> Result<()> {
        for meta in self.entities.values() {
            for rel in &meta.relations {
                let Some(target) = self.entities.get(rel.target) else {
                    return Err(ValidationError::invalid_metadata(
                        meta.name,
                        format!(
                            "relation '{}.{}' targets unknown entity '{}'",
                            meta.name, rel.name, rel.target
                        ),
                    )
                    .into());
                };
                if let Some(other) = rel.counterpart() {
                    if target.get_relation(other).is_none() {
                        return Err(ValidationError::unknown_property(target.name, other).into());
                    }
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<EntityMeta>> {
        self.entities
            .get(name)
            .cloned()
            .ok_or_else(|| ValidationError::unknown_entity(name).into())
    }

    pub fn find(&self, name: &str) -> Option<&Arc<EntityMeta>> {
        self.entities.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    /// Registered entities in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<EntityMeta>> {
        self.order.iter().filter_map(|n| self.entities.get(n))
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

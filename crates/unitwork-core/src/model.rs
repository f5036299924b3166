//! Tracked object model.
//!
//! Domain objects are shared as `ModelRef<M>` (`Arc<RwLock<M>>`). The engine
//! only ever sees the type-erased [`EntityRef`] handle; the allocation behind
//! that handle is the object's identity, so two equal-valued objects are still
//! two distinct entities.

use crate::error::{Error, Result};
use crate::field::ColumnInfo;
use crate::record::Record;
use crate::relationship::RelationInfo;
use regex::Regex;
use std::any::Any;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock, RwLock, Weak};

/// A domain type that can be tracked by a unit of work.
pub trait Model: Send + Sync + Sized + 'static {
    /// Entity (table) name; the key storage maps are registered under.
    const ENTITY_NAME: &'static str;

    /// Relations to other tracked models.
    const RELATIONS: &'static [RelationInfo] = &[];

    /// Column metadata.
    fn fields() -> &'static [ColumnInfo];

    /// Serialize the current field values.
    fn to_record(&self) -> Record;

    /// Load values (possibly a subset of columns) back into the object.
    fn apply_record(&mut self, record: &Record) -> Result<()>;

    /// Objects currently referenced through `relation`.
    fn related(&self, relation: &str) -> Vec<EntityRef> {
        let _ = relation;
        Vec::new()
    }
}

/// Shared, mutable handle to a tracked model.
pub type ModelRef<M> = Arc<RwLock<M>>;

/// Type-erased tracked object.
pub trait Entity: Send + Sync + 'static {
    /// Entity name of the underlying model.
    fn entity_name(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;
}

impl<M: Model> Entity for RwLock<M> {
    fn entity_name(&self) -> &'static str {
        M::ENTITY_NAME
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Strong, type-erased handle to a tracked object.
pub type EntityRef = Arc<dyn Entity>;

/// Non-owning handle; does not keep the object alive.
pub type WeakEntityRef = Weak<dyn Entity>;

/// Wrap a model in a shared handle.
pub fn model_ref<M: Model>(model: M) -> ModelRef<M> {
    Arc::new(RwLock::new(model))
}

/// Erase a model handle, keeping its identity.
pub fn entity_ref<M: Model>(model: &ModelRef<M>) -> EntityRef {
    let erased: EntityRef = model.clone();
    erased
}

/// Identity of an entity: the address of its allocation.
pub fn entity_address(entity: &EntityRef) -> usize {
    Arc::as_ptr(entity).cast::<()>() as usize
}

/// Reference identity (ignores vtable pointers).
pub fn same_entity(a: &EntityRef, b: &EntityRef) -> bool {
    entity_address(a) == entity_address(b)
}

/// Static mapping metadata for one entity type.
#[derive(Debug, Clone, Copy)]
pub struct EntityMapping {
    /// Entity name
    pub name: &'static str,
    /// Columns
    pub columns: &'static [ColumnInfo],
    /// Relations
    pub relations: &'static [RelationInfo],
}

impl EntityMapping {
    pub const fn new(
        name: &'static str,
        columns: &'static [ColumnInfo],
        relations: &'static [RelationInfo],
    ) -> Self {
        Self {
            name,
            columns,
            relations,
        }
    }

    /// Mapping declared by a model type.
    pub fn of<M: Model>() -> Self {
        Self::new(M::ENTITY_NAME, M::fields(), M::RELATIONS)
    }

    /// Primary key column names, in declaration order.
    pub fn primary_key(&self) -> Vec<&'static str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name)
            .collect()
    }

    /// The optimistic-concurrency version column, if any.
    pub fn version_column(&self) -> Option<&'static str> {
        self.columns.iter().find(|c| c.version).map(|c| c.name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Columns that participate in change detection.
    pub fn writable_columns(&self) -> impl Iterator<Item = &ColumnInfo> {
        self.columns.iter().filter(|c| c.is_writable())
    }

    pub fn relation(&self, name: &str) -> Option<&RelationInfo> {
        self.relations.iter().find(|r| r.name == name)
    }

    /// Owned relations.
    pub fn children(&self) -> impl Iterator<Item = &RelationInfo> {
        self.relations.iter().filter(|r| r.is_child())
    }

    /// Referenced relations.
    pub fn parents(&self) -> impl Iterator<Item = &RelationInfo> {
        self.relations.iter().filter(|r| r.is_parent())
    }

    /// Check the metadata for mistakes the engine cannot recover from later.
    ///
    /// - every name is a plain identifier
    /// - at least one primary key column
    /// - at most one version column
    /// - no duplicate column or relation names
    pub fn validate(&self) -> Result<()> {
        let pattern = identifier_pattern()?;
        let fail = |message: String| Err(Error::mapping(self.name, message));

        if !pattern.is_match(self.name) {
            return fail(format!("'{}' is not a valid entity name", self.name));
        }

        let mut seen = HashSet::new();
        for column in self.columns {
            if !pattern.is_match(column.name) {
                return fail(format!("'{}' is not a valid column name", column.name));
            }
            if !seen.insert(column.name) {
                return fail(format!("duplicate column '{}'", column.name));
            }
        }

        if self.primary_key().is_empty() {
            return fail("no primary key column declared".to_string());
        }
        if self.columns.iter().filter(|c| c.version).count() > 1 {
            return fail("more than one version column declared".to_string());
        }

        let mut relations = HashSet::new();
        for relation in self.relations {
            if !pattern.is_match(relation.name) || !pattern.is_match(relation.target) {
                return fail(format!(
                    "relation '{}' -> '{}' is not a valid identifier pair",
                    relation.name, relation.target
                ));
            }
            if !relations.insert(relation.name) {
                return fail(format!("duplicate relation '{}'", relation.name));
            }
        }

        Ok(())
    }
}

fn identifier_pattern() -> Result<&'static Regex> {
    static PATTERN: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$"))
        .as_ref()
        .map_err(|e| Error::Custom(format!("identifier pattern failed to compile: {e}")))
}

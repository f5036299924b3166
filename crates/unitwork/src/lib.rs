//! Unitwork - change tracking and cascade resolution for unit-of-work
//! persistence in Rust.
//!
//! Unitwork keeps track of live domain objects, works out which of them
//! changed, and turns "insert this order" or "delete this customer" into a
//! complete, correctly ordered plan of writes for everything related:
//!
//! - Identity-preserving entity registry that never keeps objects alive
//! - Column-level change detection against the last persisted snapshot
//! - Child/parent cascades driven by mapping metadata
//! - One pending operation per entity, executed in queue order
//! - Optimistic concurrency through version columns
//!
//! The engine does not talk to a database itself. Writes go through a
//! [`CommandGenerator`] supplied by the storage layer; [`MemoryStore`] is an
//! in-memory one for tests and prototyping.
//!
//! # Quick Start
//!
//! ```ignore
//! use unitwork::prelude::*;
//!
//! struct Order {
//!     id: Option<i64>,
//!     lines: Vec<ModelRef<LineItem>>,
//! }
//!
//! impl Model for Order {
//!     const ENTITY_NAME: &'static str = "orders";
//!     const RELATIONS: &'static [RelationInfo] =
//!         &[RelationInfo::child("lines", "line_items")];
//!
//!     fn fields() -> &'static [ColumnInfo] {
//!         static FIELDS: &[ColumnInfo] =
//!             &[ColumnInfo::new("id").primary_key(true).generated(true)];
//!         FIELDS
//!     }
//!
//!     fn to_record(&self) -> Record {
//!         Record::new().with("id", self.id)
//!     }
//!
//!     fn apply_record(&mut self, record: &Record) -> Result<()> {
//!         self.id = record.get("id").and_then(Value::as_i64).or(self.id);
//!         Ok(())
//!     }
//!
//!     fn related(&self, relation: &str) -> Vec<EntityRef> {
//!         match relation {
//!             "lines" => self.lines.iter().map(entity_ref).collect(),
//!             _ => Vec::new(),
//!         }
//!     }
//! }
//!
//! let store = Arc::new(MemoryStore::new());
//! let repository = Repository::new(store.clone());
//! repository.register::<Order>()?;
//! repository.register::<LineItem>()?;
//!
//! let unit = repository.unit_of_work();
//! unit.insert(&entity_ref(&order))?;   // the line items are queued too
//! let changes = unit.commit()?;
//! ```

pub use unitwork_core::{
    ColumnChange, ColumnInfo, Command, CommandGenerator, CommandOutcome, CommandRequest,
    ConcurrencyError, ConflictError, Delta, DependencyMode, Entity, EntityMapping, EntityRef,
    Error, ExecutionError, MappingError, Model, ModelMap, ModelRef, OperationKind, Record,
    RelationInfo, Result, StorageMap, StoreError, Value, WeakEntityRef, entity_address,
    entity_ref, model_ref, same_entity,
};

pub use unitwork_session::{
    ChangeKind, ChangeLogEntry, Dependency, EntityState, ExecutedCommand, FlushResult,
    MemoryStore, Mutation, Operation, OperationState, PendingCounts, Registry, Relations,
    Repository, RepositoryConfig, RepositoryDebugInfo, TrackedEntity, UnitOfWork,
    UnitOfWorkDebugInfo, UnitOfWorkEvent, classify_relations, current_children, detect_changes,
    detect_removed_children, diff_records, has_changes, needs_update,
};

/// Commonly used items, for glob import.
pub mod prelude {
    pub use crate::{
        ChangeKind, ChangeLogEntry, ColumnInfo, CommandGenerator, EntityRef, EntityState, Error,
        FlushResult, MemoryStore, Model, ModelRef, OperationKind, Record, RelationInfo,
        Repository, RepositoryConfig, Result, UnitOfWork, Value, entity_ref, model_ref,
    };
    pub use std::sync::Arc;
}

//! Core types and traits for unitwork.
//!
//! This crate provides the foundational abstractions the session layer builds on:
//!
//! - `Value`, `Record` and `Delta` for column data, snapshots, and changes
//! - `ColumnInfo` / `RelationInfo` / `EntityMapping` for mapping metadata
//! - `Model` and the type-erased `Entity` handle for tracked objects
//! - `StorageMap` for moving data between objects and records
//! - `CommandGenerator` / `Command` for the external persistence layer
//! - `Error` with the unit-of-work error taxonomy

pub mod command;
pub mod error;
pub mod field;
pub mod map;
pub mod model;
pub mod record;
pub mod relationship;
pub mod value;

pub use command::{Command, CommandGenerator, CommandOutcome, CommandRequest, OperationKind};
pub use error::{
    ConcurrencyError, ConflictError, Error, ExecutionError, MappingError, Result, StoreError,
};
pub use field::ColumnInfo;
pub use map::{ModelMap, StorageMap};
pub use model::{
    Entity, EntityMapping, EntityRef, Model, ModelRef, WeakEntityRef, entity_address,
    entity_ref, model_ref, same_entity,
};
pub use record::{ColumnChange, Delta, Record};
pub use relationship::{DependencyMode, RelationInfo};
pub use value::Value;

//! Persistence command contracts.
//!
//! The engine decides *what* must be written and in which order; turning one
//! decision into an executable statement is delegated to a
//! [`CommandGenerator`] supplied by the storage layer.

use crate::error::Result;
use crate::model::EntityMapping;
use crate::record::{Delta, Record};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a pending mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl OperationKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Insert => "INSERT",
            OperationKind::Update => "UPDATE",
            OperationKind::Delete => "DELETE",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a generator needs to build one command.
#[derive(Debug, Clone, Copy)]
pub struct CommandRequest<'a> {
    pub kind: OperationKind,
    pub mapping: &'a EntityMapping,
    /// Current field values of the entity.
    pub record: &'a Record,
    /// Persisted identity taken from the last snapshot; `None` if the entity
    /// has never been persisted.
    pub key: Option<&'a [Value]>,
    /// Changed columns (updates only).
    pub delta: Option<&'a Delta>,
    /// Version captured in the last snapshot, for versioned mappings.
    pub expected_version: Option<&'a Value>,
}

/// Result of executing a command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// Number of rows the store reported as affected.
    Affected(u64),
    /// A row of store-assigned values (generated keys, new version, ...).
    Row(Record),
}

/// An executable persistence command.
pub trait Command: Send {
    /// Run the command against the store.
    fn execute(&mut self) -> Result<CommandOutcome>;

    /// Release resources held by the command. Called exactly once, after
    /// `execute` succeeded or failed.
    fn dispose(&mut self) {}
}

/// Builds persistence commands for tracked entities.
pub trait CommandGenerator: Send + Sync {
    /// Build the command for `request`, or `None` when there is nothing to
    /// persist (no identity to address, or an empty update).
    fn generate(&self, request: &CommandRequest<'_>) -> Result<Option<Box<dyn Command>>>;
}

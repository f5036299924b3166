//! Relationship metadata.
//!
//! Whether a related object is owned (child) or merely referenced (parent) is
//! declared here and never inferred. The session layer uses the mode to decide
//! which related objects are inserted, updated, deleted, or refreshed when the
//! owning entity is persisted.

/// How the lifecycle of a related object is bound to its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependencyMode {
    /// Owned by the entity: deleting the owner deletes it, removing it from
    /// the owner's collection deletes it.
    Child,
    /// Referenced by the entity: must exist before the entity is inserted,
    /// otherwise independent.
    Parent,
}

/// Static information about one relation of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationInfo {
    /// Relation (property) name, passed back to `Model::related`.
    pub name: &'static str,
    /// Entity name of the related model.
    pub target: &'static str,
    /// Child or parent dependency.
    pub mode: DependencyMode,
}

impl RelationInfo {
    /// An owned relation.
    pub const fn child(name: &'static str, target: &'static str) -> Self {
        Self {
            name,
            target,
            mode: DependencyMode::Child,
        }
    }

    /// A referenced relation.
    pub const fn parent(name: &'static str, target: &'static str) -> Self {
        Self {
            name,
            target,
            mode: DependencyMode::Parent,
        }
    }

    pub const fn is_child(&self) -> bool {
        matches!(self.mode, DependencyMode::Child)
    }

    pub const fn is_parent(&self) -> bool {
        matches!(self.mode, DependencyMode::Parent)
    }
}

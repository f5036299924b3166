//! Error types for unit-of-work operations.

use crate::command::OperationKind;
use crate::value::Value;
use std::fmt;

/// The primary error type for all unitwork operations.
#[derive(Debug)]
pub enum Error {
    /// An operation or unit of work was used after teardown.
    Disposed {
        /// What was disposed (e.g. "operation #4").
        what: String,
    },
    /// The entity has no tracking context (dropped object or unit of work).
    Orphan {
        /// Description of the entity.
        entity: String,
    },
    /// The entity already has an incompatible pending operation.
    ConflictingOperation(ConflictError),
    /// No storage map is registered for an entity type.
    NotFound {
        /// Entity type name that could not be resolved.
        entity_type: String,
    },
    /// Optimistic concurrency check failed.
    ConcurrencyConflict(ConcurrencyError),
    /// A value that cannot be tracked by identity was passed to the registry.
    InvalidEntityKind {
        /// Rust type name of the rejected value.
        type_name: &'static str,
    },
    /// The external command layer failed while executing an operation.
    Execution(ExecutionError),
    /// Error raised by a command implementation (store-level failure).
    Store(StoreError),
    /// Invalid mapping metadata.
    Mapping(MappingError),
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConflictError {
    /// Description of the entity.
    pub entity: String,
    /// Kind of the operation already pending.
    pub existing: OperationKind,
    /// Kind of the operation that was refused (None for attach/detach).
    pub requested: Option<OperationKind>,
}

#[derive(Debug)]
pub struct ConcurrencyError {
    /// Description of the entity.
    pub entity: String,
    /// Version column name.
    pub column: String,
    /// Version captured in the last snapshot.
    pub expected: Option<Value>,
    /// Version found at execute time (None when the store matched no row).
    pub actual: Option<Value>,
}

#[derive(Debug)]
pub struct ExecutionError {
    /// Description of the entity.
    pub entity: String,
    /// The operation that was executing.
    pub operation: OperationKind,
    /// The underlying failure.
    pub source: Box<Error>,
}

#[derive(Debug)]
pub struct StoreError {
    pub message: String,
    /// Whether re-running the unit of work may succeed.
    pub retryable: bool,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone)]
pub struct MappingError {
    /// Entity type the metadata belongs to.
    pub entity_type: String,
    pub message: String,
}

impl Error {
    /// Is this an error that a retry of the whole unit of work may resolve?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ConcurrencyConflict(_) => true,
            Error::Store(e) => e.retryable,
            Error::Execution(e) => e.source.is_retryable(),
            _ => false,
        }
    }

    /// The entity this error refers to, if any.
    pub fn entity(&self) -> Option<&str> {
        match self {
            Error::Orphan { entity } => Some(entity),
            Error::ConflictingOperation(e) => Some(&e.entity),
            Error::ConcurrencyConflict(e) => Some(&e.entity),
            Error::Execution(e) => Some(&e.entity),
            _ => None,
        }
    }

    /// Build a store error with the given message.
    pub fn store(message: impl Into<String>) -> Self {
        Error::Store(StoreError {
            message: message.into(),
            retryable: false,
            source: None,
        })
    }

    /// Build a mapping error for an entity type.
    pub fn mapping(entity_type: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Mapping(MappingError {
            entity_type: entity_type.into(),
            message: message.into(),
        })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Disposed { what } => write!(f, "{} has already been disposed", what),
            Error::Orphan { entity } => {
                write!(f, "Entity {} is not attached to a tracking context", entity)
            }
            Error::ConflictingOperation(e) => write!(f, "Conflicting operation: {}", e),
            Error::NotFound { entity_type } => {
                write!(f, "No storage map registered for entity type '{}'", entity_type)
            }
            Error::ConcurrencyConflict(e) => write!(f, "Concurrency conflict: {}", e),
            Error::InvalidEntityKind { type_name } => {
                write!(f, "Values of type {} cannot be tracked by identity", type_name)
            }
            Error::Execution(e) => write!(f, "Execution error: {}", e),
            Error::Store(e) => write!(f, "Store error: {}", e),
            Error::Mapping(e) => write!(f, "Mapping error: {}", e),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Execution(e) => Some(e.source.as_ref()),
            Error::Store(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for ConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.requested {
            Some(requested) => write!(
                f,
                "cannot {} {}: {} already pending",
                requested, self.entity, self.existing
            ),
            None => write!(f, "{} has a pending {}", self.entity, self.existing),
        }
    }
}

impl fmt::Display for ConcurrencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: &Option<Value>| v.as_ref().map_or_else(|| "<none>".to_string(), Value::to_string);
        write!(
            f,
            "{} column '{}' expected {}, found {}",
            self.entity,
            self.column,
            show(&self.expected),
            show(&self.actual)
        )
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {} failed: {}", self.operation, self.entity, self.source)
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.entity_type, self.message)
    }
}

impl From<ConflictError> for Error {
    fn from(err: ConflictError) -> Self {
        Error::ConflictingOperation(err)
    }
}

impl From<ConcurrencyError> for Error {
    fn from(err: ConcurrencyError) -> Self {
        Error::ConcurrencyConflict(err)
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        Error::Store(err)
    }
}

impl From<MappingError> for Error {
    fn from(err: MappingError) -> Self {
        Error::Mapping(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for unitwork operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_flags() {
        let conflict = Error::ConcurrencyConflict(ConcurrencyError {
            entity: "orders:1".to_string(),
            column: "version".to_string(),
            expected: Some(Value::BigInt(1)),
            actual: None,
        });
        assert!(conflict.is_retryable());
        assert_eq!(conflict.entity(), Some("orders:1"));

        let wrapped = Error::Execution(ExecutionError {
            entity: "orders:1".to_string(),
            operation: OperationKind::Update,
            source: Box::new(conflict),
        });
        assert!(wrapped.is_retryable());

        assert!(!Error::store("disk full").is_retryable());
        assert!(
            !Error::NotFound {
                entity_type: "orders".to_string()
            }
            .is_retryable()
        );
    }

    #[test]
    fn execution_error_exposes_source() {
        use std::error::Error as _;

        let err = Error::Execution(ExecutionError {
            entity: "line_items:7".to_string(),
            operation: OperationKind::Delete,
            source: Box::new(Error::store("constraint violated")),
        });
        let message = err.to_string();
        assert!(message.contains("DELETE of line_items:7 failed"));
        assert!(err.source().is_some());
    }

    #[test]
    fn conflict_display_names_both_kinds() {
        let err = Error::from(ConflictError {
            entity: "orders:1".to_string(),
            existing: OperationKind::Insert,
            requested: Some(OperationKind::Delete),
        });
        assert_eq!(
            err.to_string(),
            "Conflicting operation: cannot DELETE orders:1: INSERT already pending"
        );
    }
}

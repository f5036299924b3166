//! Column definitions.

/// Metadata about a mapped column.
///
/// Declared statically per model type:
///
/// ```ignore
/// static FIELDS: &[ColumnInfo] = &[
///     ColumnInfo::new("id").primary_key(true).generated(true),
///     ColumnInfo::new("name"),
///     ColumnInfo::new("version").version(true),
/// ];
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnInfo {
    /// Column name
    pub name: &'static str,
    /// Whether this column is part of the primary key
    pub primary_key: bool,
    /// Whether the store assigns this value (auto-increment, computed)
    pub generated: bool,
    /// Read-only columns are never part of an update delta
    pub read_only: bool,
    /// Optimistic-concurrency version column
    pub version: bool,
    /// Whether this column accepts NULL
    pub nullable: bool,
}

impl ColumnInfo {
    /// Create a plain writable column.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            primary_key: false,
            generated: false,
            read_only: false,
            version: false,
            nullable: false,
        }
    }

    /// Mark as (part of) the primary key.
    pub const fn primary_key(mut self, value: bool) -> Self {
        self.primary_key = value;
        self
    }

    /// Mark as store-generated.
    pub const fn generated(mut self, value: bool) -> Self {
        self.generated = value;
        self
    }

    /// Mark as read-only.
    pub const fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Mark as the row-version column.
    ///
    /// Version columns are maintained by the store and are never written
    /// through an update delta.
    pub const fn version(mut self, value: bool) -> Self {
        self.version = value;
        self
    }

    /// Set nullability.
    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    /// Whether changes to this column belong in an update delta.
    pub const fn is_writable(&self) -> bool {
        !self.read_only && !self.version
    }
}

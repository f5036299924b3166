//! Change tracking and cascading unit of work for unitwork.
//!
//! `unitwork-session` is the **engine layer**. It decides what has to be
//! written, and in which order, for a mutation of one object to leave its
//! related objects consistent; the actual writes are delegated to a
//! [`CommandGenerator`] supplied by the storage layer.
//!
//! # Role In The Architecture
//!
//! - **Entity registry**: one metadata record per live object, keyed by
//!   reference identity and never keeping the object alive.
//! - **Change detection**: column-level deltas against the last snapshot.
//! - **Dependency walking**: child/parent classification from mapping
//!   metadata, with origin-skipping for bidirectional relations.
//! - **Operations and queue**: one pending mutation per entity, cascades
//!   resolved at submit time, execution in queue order at flush.
//!
//! # Example
//!
//! ```ignore
//! let store = Arc::new(MemoryStore::new());
//! let repository = Repository::new(store.clone());
//! repository.register::<Order>()?;
//! repository.register::<LineItem>()?;
//!
//! let unit = repository.unit_of_work();
//! unit.insert(&entity_ref(&order))?;   // line items are queued as well
//! let log = unit.commit()?;
//! ```

pub mod change_tracker;
pub mod dependency;
pub mod flush;
pub mod memory;
pub mod operation;
pub mod registry;
pub mod unit_of_work;

#[cfg(test)]
mod testing;

pub use change_tracker::{detect_changes, diff_records, has_changes, needs_update};
pub use dependency::{
    Dependency, Relations, classify_relations, current_children, detect_removed_children,
};
pub use flush::{ChangeKind, ChangeLogEntry, FlushResult};
pub use memory::{ExecutedCommand, MemoryStore};
pub use operation::{Mutation, Operation, OperationState};
pub use registry::{EntityState, Registry, TrackedEntity};
pub use unit_of_work::{PendingCounts, UnitOfWork, UnitOfWorkDebugInfo, UnitOfWorkEvent};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use unitwork_core::{
    CommandGenerator, ConflictError, EntityRef, Error, Model, ModelMap, Result, StorageMap,
};

// ============================================================================
// Repository Configuration
// ============================================================================

/// Configuration for Repository behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Number of lock stripes in the entity registry.
    pub registry_shards: usize,
    /// Whether update cascades look one level below Ready children when
    /// deciding if they need an update.
    pub cascade_dirty_check: bool,
    /// Whether flushes append Refresh entries to the change log.
    pub log_refreshes: bool,
    /// Whether registered mappings are validated.
    pub validate_mappings: bool,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            registry_shards: 16,
            cascade_dirty_check: true,
            log_refreshes: true,
            validate_mappings: true,
        }
    }
}

impl RepositoryConfig {
    /// Create new default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from JSON; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Set the `registry_shards` option (builder pattern).
    #[must_use]
    pub fn registry_shards(mut self, value: usize) -> Self {
        self.registry_shards = value;
        self
    }

    /// Set the `cascade_dirty_check` option (builder pattern).
    #[must_use]
    pub fn cascade_dirty_check(mut self, value: bool) -> Self {
        self.cascade_dirty_check = value;
        self
    }

    /// Set the `log_refreshes` option (builder pattern).
    #[must_use]
    pub fn log_refreshes(mut self, value: bool) -> Self {
        self.log_refreshes = value;
        self
    }

    /// Set the `validate_mappings` option (builder pattern).
    #[must_use]
    pub fn validate_mappings(mut self, value: bool) -> Self {
        self.validate_mappings = value;
        self
    }
}

// ============================================================================
// Repository
// ============================================================================

/// Sizes of the repository's shared state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositoryDebugInfo {
    /// Registry records, including dead ones not yet pruned.
    pub tracked: usize,
    /// Registry records whose objects are alive.
    pub live: usize,
    /// Registered entity names, sorted.
    pub maps: Vec<&'static str>,
}

struct RepositoryShared {
    config: RepositoryConfig,
    registry: Registry,
    maps: RwLock<HashMap<&'static str, Arc<dyn StorageMap>>>,
    generator: Arc<dyn CommandGenerator>,
    /// Serializes store access: one drain (or inline delete) at a time.
    master: Mutex<()>,
    next_operation: AtomicU64,
}

/// Shared state behind every unit of work: the entity registry, the storage
/// maps, the command generator, and the master lock.
///
/// Cloning is cheap and yields a handle to the same repository.
#[derive(Clone)]
pub struct Repository {
    shared: Arc<RepositoryShared>,
}

impl Repository {
    /// Create a repository with default configuration.
    pub fn new(generator: Arc<dyn CommandGenerator>) -> Self {
        Self::with_config(generator, RepositoryConfig::default())
    }

    /// Create a repository with custom configuration.
    pub fn with_config(generator: Arc<dyn CommandGenerator>, config: RepositoryConfig) -> Self {
        tracing::debug!(
            shards = config.registry_shards,
            cascade_dirty_check = config.cascade_dirty_check,
            "Creating repository"
        );
        Self {
            shared: Arc::new(RepositoryShared {
                registry: Registry::new(config.registry_shards),
                config,
                maps: RwLock::new(HashMap::new()),
                generator,
                master: Mutex::new(()),
                next_operation: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    pub(crate) fn generator(&self) -> &dyn CommandGenerator {
        self.shared.generator.as_ref()
    }

    pub(crate) fn lock_master(&self) -> MutexGuard<'_, ()> {
        self.shared
            .master
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn next_operation_id(&self) -> u64 {
        self.shared.next_operation.fetch_add(1, Ordering::Relaxed)
    }

    /// Register the [`ModelMap`] of a model type.
    pub fn register<M: Model>(&self) -> Result<()> {
        self.register_map(Arc::new(ModelMap::<M>::new()))
    }

    /// Register a storage map under its entity name, replacing any previous
    /// map for that name.
    #[tracing::instrument(level = "debug", skip(self, map), fields(entity = map.mapping().name))]
    pub fn register_map(&self, map: Arc<dyn StorageMap>) -> Result<()> {
        if self.shared.config.validate_mappings {
            map.mapping().validate()?;
        }
        let name = map.mapping().name;
        let previous = self
            .shared
            .maps
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, map);
        if previous.is_some() {
            tracing::warn!(entity = name, "Replaced storage map");
        }
        Ok(())
    }

    /// The storage map registered for an entity name.
    pub fn map_for(&self, entity_name: &str) -> Result<Arc<dyn StorageMap>> {
        self.shared
            .maps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity_name)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                entity_type: entity_name.to_string(),
            })
    }

    /// The tracked record of `entity`, created on first use.
    pub fn locate(&self, entity: &EntityRef) -> Arc<TrackedEntity> {
        self.shared.registry.get_or_create(entity)
    }

    /// The tracked record of `entity`, if it has one.
    pub fn find(&self, entity: &EntityRef) -> Option<Arc<TrackedEntity>> {
        self.shared.registry.get(entity)
    }

    /// Current state of `entity`; untracked objects are `Detached`.
    pub fn state_of(&self, entity: &EntityRef) -> EntityState {
        self.find(entity)
            .map_or(EntityState::Detached, |tracked| tracked.state())
    }

    /// Start tracking an object loaded from the store.
    ///
    /// Captures its current values as the persisted snapshot (state `Ready`)
    /// and records its children so later removals can be detected.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = entity.entity_name()))]
    pub fn attach(&self, entity: &EntityRef) -> Result<Arc<TrackedEntity>> {
        let tracked = self.locate(entity);
        if let Some(existing) = tracked.pending_kind() {
            return Err(Error::ConflictingOperation(ConflictError {
                entity: tracked.describe(),
                existing,
                requested: None,
            }));
        }

        let map = match tracked.map() {
            Some(map) => map,
            None => {
                let map = self.map_for(entity.entity_name())?;
                if tracked.attach_map(Arc::clone(&map)) {
                    map.attach(entity.as_ref())?;
                }
                map
            }
        };

        let snapshot = map.write_record(entity.as_ref())?;
        tracked.set_snapshot(snapshot);
        tracked.record_children(dependency::snapshot_children(map.as_ref(), entity)?);
        tracked.set_completed(true);
        tracing::debug!(entity = %tracked.describe(), "Attached");
        Ok(tracked)
    }

    /// Stop tracking an object: forget its snapshot, children, and map.
    pub fn detach(&self, entity: &EntityRef) -> Result<()> {
        let Some(tracked) = self.find(entity) else {
            return Ok(());
        };
        if let Some(existing) = tracked.pending_kind() {
            return Err(Error::ConflictingOperation(ConflictError {
                entity: tracked.describe(),
                existing,
                requested: None,
            }));
        }
        if let Some(map) = tracked.detach_map() {
            map.detach(entity.as_ref());
            tracing::debug!(entity = entity.entity_name(), serial = tracked.serial(), "Detached");
        }
        Ok(())
    }

    /// Open a new unit of work.
    pub fn unit_of_work(&self) -> Arc<UnitOfWork> {
        UnitOfWork::new(self.clone())
    }

    pub fn debug_info(&self) -> RepositoryDebugInfo {
        let mut maps: Vec<_> = self
            .shared
            .maps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        maps.sort_unstable();
        RepositoryDebugInfo {
            tracked: self.shared.registry.len(),
            live: self.shared.registry.live_count(),
            maps,
        }
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("config", &self.shared.config)
            .field("registry", &self.shared.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Item, LineItem, Order, item, order_with_lines};
    use unitwork_core::{ColumnInfo, Record, entity_ref};

    #[test]
    fn test_config_from_json_keeps_defaults() {
        let config = RepositoryConfig::from_json(r#"{ "log_refreshes": false }"#).unwrap();
        assert!(!config.log_refreshes);
        assert_eq!(config.registry_shards, 16);
        assert!(config.cascade_dirty_check);

        assert!(matches!(
            RepositoryConfig::from_json("{ nope"),
            Err(Error::Serde(_))
        ));
    }

    #[test]
    fn test_register_validates_mappings() {
        struct Bad;
        impl Model for Bad {
            const ENTITY_NAME: &'static str = "bad rows";
            fn fields() -> &'static [ColumnInfo] {
                static FIELDS: &[ColumnInfo] = &[ColumnInfo::new("id").primary_key(true)];
                FIELDS
            }
            fn to_record(&self) -> Record {
                Record::new()
            }
            fn apply_record(&mut self, _record: &Record) -> Result<()> {
                Ok(())
            }
        }

        let repo = Repository::new(Arc::new(MemoryStore::new()));
        assert!(matches!(repo.register::<Bad>(), Err(Error::Mapping(_))));

        let lenient = Repository::with_config(
            Arc::new(MemoryStore::new()),
            RepositoryConfig::new().validate_mappings(false),
        );
        assert!(lenient.register::<Bad>().is_ok());
        assert_eq!(lenient.debug_info().maps, vec!["bad rows"]);
    }

    #[test]
    fn test_attach_and_detach() {
        let repo = Repository::new(Arc::new(MemoryStore::new()));
        repo.register::<Order>().unwrap();
        repo.register::<LineItem>().unwrap();
        let (order, lines) = order_with_lines("o", &["a"]);
        order.write().unwrap().id = Some(5);
        let order_ref = entity_ref(&order);

        let tracked = repo.attach(&order_ref).unwrap();
        assert_eq!(tracked.state(), EntityState::Ready);
        assert_eq!(tracked.identity().as_deref(), Some("orders:5"));
        assert_eq!(tracked.child_dependencies("lines").len(), 1);
        assert!(tracked.is_completed());
        assert_eq!(repo.state_of(&entity_ref(&lines[0])), EntityState::Detached);

        repo.detach(&order_ref).unwrap();
        assert_eq!(repo.state_of(&order_ref), EntityState::Detached);
        assert!(!tracked.is_attached());
    }

    #[test]
    fn test_attach_refuses_pending_entities() {
        let repo = Repository::new(Arc::new(MemoryStore::new()));
        repo.register::<Item>().unwrap();
        let a = entity_ref(&item("a"));
        let unit = repo.unit_of_work();
        unit.insert(&a).unwrap();
        assert!(matches!(
            repo.attach(&a),
            Err(Error::ConflictingOperation(_))
        ));
        assert!(matches!(
            repo.detach(&a),
            Err(Error::ConflictingOperation(_))
        ));
    }

    #[test]
    fn test_debug_info_and_prune() {
        let repo = Repository::new(Arc::new(MemoryStore::new()));
        repo.register::<Item>().unwrap();
        let kept = item("kept");
        repo.locate(&entity_ref(&kept));
        {
            let dropped = item("dropped");
            repo.locate(&entity_ref(&dropped));
        }
        let info = repo.debug_info();
        assert_eq!((info.tracked, info.live), (2, 1));
        assert_eq!(info.maps, vec!["items"]);

        assert_eq!(repo.registry().prune(), 1);
        assert_eq!(repo.debug_info().tracked, 1);
    }
}

//! Entity registry: one metadata record per live tracked object.
//!
//! The registry never owns domain objects. Each [`TrackedEntity`] holds a weak
//! pointer to its object, and the registry is keyed by the object's allocation
//! address. A lookup that finds a record whose object has been dropped treats
//! it exactly like a miss, so an address reused by a new allocation can never
//! inherit stale metadata.
//!
//! Lookups are striped over a fixed number of shards. Lookups of different
//! objects proceed concurrently; creating the record for a given object is
//! serialized by its shard's write lock, so one object never receives two
//! records.

use crate::operation::Operation;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use unitwork_core::{
    ConflictError, EntityRef, Error, OperationKind, Record, Result, StorageMap, WeakEntityRef,
    entity_address, same_entity,
};

/// State of a tracked entity, derived from its pending operation and snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Never persisted, or deleted/detached since.
    Detached,
    /// Persisted and not scheduled for any mutation.
    Ready,
    /// Insert pending.
    PendingInsert,
    /// Update pending.
    PendingUpdate,
    /// Delete pending.
    PendingDelete,
}

impl EntityState {
    /// Derive the state from the kind of the pending operation and whether a
    /// persisted snapshot exists.
    pub const fn derive(pending: Option<OperationKind>, has_snapshot: bool) -> Self {
        match (pending, has_snapshot) {
            (Some(OperationKind::Insert), _) => EntityState::PendingInsert,
            (Some(OperationKind::Update), _) => EntityState::PendingUpdate,
            (Some(OperationKind::Delete), _) => EntityState::PendingDelete,
            (None, true) => EntityState::Ready,
            (None, false) => EntityState::Detached,
        }
    }

    pub const fn is_pending(&self) -> bool {
        matches!(
            self,
            EntityState::PendingInsert | EntityState::PendingUpdate | EntityState::PendingDelete
        )
    }
}

/// Outcome of claiming an entity's pending-operation slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Claim {
    /// The slot was empty and now holds the operation.
    Claimed,
    /// The slot already holds this very operation.
    AlreadyPending,
}

/// Metadata record attached to one tracked object.
pub struct TrackedEntity {
    serial: u64,
    entity_name: &'static str,
    object: WeakEntityRef,
    inner: Mutex<TrackedInner>,
}

#[derive(Default)]
struct TrackedInner {
    snapshot: Option<Record>,
    /// Cached identity string; cleared whenever the snapshot is replaced.
    identity: Option<String>,
    map: Option<Arc<dyn StorageMap>>,
    pending: Option<Arc<Operation>>,
    /// Children recorded at the last persist, per relation. Strong handles so
    /// a child removed from its owner can still be deleted.
    child_dependencies: HashMap<&'static str, Vec<EntityRef>>,
    completed: bool,
}

impl TrackedEntity {
    fn new(serial: u64, entity: &EntityRef) -> Self {
        Self {
            serial,
            entity_name: entity.entity_name(),
            object: Arc::downgrade(entity),
            inner: Mutex::new(TrackedInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackedInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Monotonic serial assigned at creation.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn entity_name(&self) -> &'static str {
        self.entity_name
    }

    /// The tracked object, if it is still alive.
    pub fn object(&self) -> Option<EntityRef> {
        self.object.upgrade()
    }

    pub fn is_alive(&self) -> bool {
        self.object.strong_count() > 0
    }

    /// Whether this record belongs to `entity` (same allocation, still alive).
    pub fn is_for(&self, entity: &EntityRef) -> bool {
        self.object().is_some_and(|own| same_entity(&own, entity))
    }

    /// Last persisted snapshot.
    pub fn snapshot(&self) -> Option<Record> {
        self.lock().snapshot.clone()
    }

    pub fn has_snapshot(&self) -> bool {
        self.lock().snapshot.is_some()
    }

    /// Replace the snapshot. The previous snapshot is dropped and the cached
    /// identity string is invalidated.
    pub fn set_snapshot(&self, snapshot: Record) {
        let mut inner = self.lock();
        inner.snapshot = Some(snapshot);
        inner.identity = None;
    }

    pub fn clear_snapshot(&self) {
        let mut inner = self.lock();
        inner.snapshot = None;
        inner.identity = None;
    }

    /// Cache key derived from the snapshot's primary key columns, e.g.
    /// `orders:42`. `None` while detached or when a key column is unset.
    pub fn identity(&self) -> Option<String> {
        let mut inner = self.lock();
        if inner.identity.is_none() {
            let map = inner.map.clone()?;
            let snapshot = inner.snapshot.as_ref()?;
            let key = map.extract_id(snapshot)?;
            let parts: Vec<String> = key.iter().map(ToString::to_string).collect();
            inner.identity = Some(format!("{}:{}", self.entity_name, parts.join("|")));
        }
        inner.identity.clone()
    }

    /// Human-readable label for logs and errors.
    pub fn describe(&self) -> String {
        self.identity()
            .unwrap_or_else(|| format!("{}#{}", self.entity_name, self.serial))
    }

    /// Storage map the entity is attached to (`None` = detached).
    pub fn map(&self) -> Option<Arc<dyn StorageMap>> {
        self.lock().map.clone()
    }

    pub fn is_attached(&self) -> bool {
        self.lock().map.is_some()
    }

    /// Attach to a map. Returns `false` if it was already attached.
    pub(crate) fn attach_map(&self, map: Arc<dyn StorageMap>) -> bool {
        let mut inner = self.lock();
        if inner.map.is_some() {
            return false;
        }
        inner.map = Some(map);
        inner.identity = None;
        true
    }

    /// Forget the map, snapshot, and recorded children.
    pub(crate) fn detach_map(&self) -> Option<Arc<dyn StorageMap>> {
        let mut inner = self.lock();
        inner.snapshot = None;
        inner.identity = None;
        inner.child_dependencies.clear();
        inner.completed = false;
        inner.map.take()
    }

    /// The open operation on this entity, if any.
    pub fn pending(&self) -> Option<Arc<Operation>> {
        self.lock().pending.clone()
    }

    pub fn pending_kind(&self) -> Option<OperationKind> {
        self.lock().pending.as_ref().map(|op| op.kind())
    }

    /// Current state; a pure function of the pending kind and snapshot.
    pub fn state(&self) -> EntityState {
        let inner = self.lock();
        EntityState::derive(
            inner.pending.as_ref().map(|op| op.kind()),
            inner.snapshot.is_some(),
        )
    }

    /// Register `op` as this entity's pending operation.
    pub(crate) fn claim(&self, op: &Arc<Operation>) -> Result<Claim> {
        let mut inner = self.lock();
        let existing = match &inner.pending {
            Some(existing) if Arc::ptr_eq(existing, op) => return Ok(Claim::AlreadyPending),
            Some(existing) => existing.kind(),
            None => {
                inner.pending = Some(Arc::clone(op));
                return Ok(Claim::Claimed);
            }
        };
        drop(inner);
        Err(Error::ConflictingOperation(ConflictError {
            entity: self.describe(),
            existing,
            requested: Some(op.kind()),
        }))
    }

    /// Clear the pending slot if it still holds `op`.
    pub(crate) fn release(&self, op: &Operation) {
        let mut inner = self.lock();
        if inner
            .pending
            .as_ref()
            .is_some_and(|p| std::ptr::eq(Arc::as_ptr(p), op))
        {
            inner.pending = None;
        }
    }

    /// Children recorded for `relation` at the last persist.
    pub fn child_dependencies(&self, relation: &str) -> Vec<EntityRef> {
        self.lock()
            .child_dependencies
            .get(relation)
            .cloned()
            .unwrap_or_default()
    }

    /// Relations with recorded children.
    pub fn child_relations(&self) -> Vec<&'static str> {
        self.lock().child_dependencies.keys().copied().collect()
    }

    pub(crate) fn record_children(&self, children: HashMap<&'static str, Vec<EntityRef>>) {
        self.lock().child_dependencies = children;
    }

    /// Whether every member has been materialized from the store.
    pub fn is_completed(&self) -> bool {
        self.lock().completed
    }

    pub(crate) fn set_completed(&self, completed: bool) {
        self.lock().completed = completed;
    }
}

impl std::fmt::Debug for TrackedEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedEntity")
            .field("serial", &self.serial)
            .field("entity", &self.entity_name)
            .field("alive", &self.is_alive())
            .field("state", &self.state())
            .finish()
    }
}

type Shard = RwLock<HashMap<usize, Arc<TrackedEntity>>>;

/// Identity-preserving cache of [`TrackedEntity`] records.
pub struct Registry {
    shards: Box<[Shard]>,
    next_serial: AtomicU64,
}

impl Registry {
    /// Create a registry striped over `shards` locks (at least one).
    #[must_use]
    pub fn new(shards: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            next_serial: AtomicU64::new(1),
        }
    }

    fn shard(&self, address: usize) -> &Shard {
        // Allocations are at least pointer-aligned; drop the always-zero bits.
        let slot = (address >> 4) % self.shards.len();
        &self.shards[slot]
    }

    /// Find the record for `entity`, creating it when `create` is set.
    ///
    /// Repeated calls for the same live object return the same record.
    pub fn locate(&self, entity: &EntityRef, create: bool) -> Option<Arc<TrackedEntity>> {
        if create {
            Some(self.get_or_create(entity))
        } else {
            self.get(entity)
        }
    }

    /// The record for `entity`, if one exists and belongs to this object.
    pub fn get(&self, entity: &EntityRef) -> Option<Arc<TrackedEntity>> {
        let address = entity_address(entity);
        let map = self
            .shard(address)
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let tracked = map.get(&address).filter(|t| t.is_for(entity))?;
        tracing::trace!(serial = tracked.serial, "Registry hit");
        Some(Arc::clone(tracked))
    }

    /// The record for `entity`, created (with the next serial) if missing.
    #[tracing::instrument(level = "trace", skip(self, entity), fields(entity = entity.entity_name()))]
    pub fn get_or_create(&self, entity: &EntityRef) -> Arc<TrackedEntity> {
        if let Some(tracked) = self.get(entity) {
            return tracked;
        }

        let address = entity_address(entity);
        let mut map = self
            .shard(address)
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        // Another caller may have created it between the two locks.
        if let Some(tracked) = map.get(&address).filter(|t| t.is_for(entity)) {
            return Arc::clone(tracked);
        }

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let tracked = Arc::new(TrackedEntity::new(serial, entity));
        if map.insert(address, Arc::clone(&tracked)).is_some() {
            tracing::trace!(serial, "Replaced record of a dropped object");
        }
        tracing::trace!(serial, "Created tracked entity");
        tracked
    }

    /// Like [`Registry::locate`], for values whose type is only known
    /// generically. Anything other than an [`EntityRef`] is rejected with
    /// `InvalidEntityKind`.
    pub fn locate_value<T: Any>(
        &self,
        value: &T,
        create: bool,
    ) -> Result<Option<Arc<TrackedEntity>>> {
        let any: &dyn Any = value;
        match any.downcast_ref::<EntityRef>() {
            Some(entity) => Ok(self.locate(entity, create)),
            None => Err(Error::InvalidEntityKind {
                type_name: std::any::type_name::<T>(),
            }),
        }
    }

    /// Drop records whose objects are gone. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut removed = 0;
        for shard in &*self.shards {
            let mut map = shard.write().unwrap_or_else(PoisonError::into_inner);
            let before = map.len();
            map.retain(|_, tracked| tracked.is_alive());
            removed += before - map.len();
        }
        if removed > 0 {
            tracing::debug!(removed, "Pruned dead registry entries");
        }
        removed
    }

    /// Number of records, including ones whose objects have been dropped.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of records whose objects are still alive.
    pub fn live_count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| {
                s.read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .values()
                    .filter(|t| t.is_alive())
                    .count()
            })
            .sum()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(16)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("shards", &self.shards.len())
            .field("records", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Item, item};
    use std::thread;
    use unitwork_core::{ModelMap, entity_ref};

    #[test]
    fn test_locate_returns_same_record_for_same_object() {
        let registry = Registry::new(4);
        let a = item("a");
        let a_ref = entity_ref(&a);

        assert!(registry.locate(&a_ref, false).is_none());
        let first = registry.locate(&a_ref, true).unwrap();
        let second = registry.locate(&entity_ref(&a), true).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_equal_values_get_distinct_records_and_increasing_serials() {
        let registry = Registry::default();
        let a = entity_ref(&item("same"));
        let b = entity_ref(&item("same"));
        let ta = registry.locate(&a, true).unwrap();
        let tb = registry.locate(&b, true).unwrap();
        assert!(!Arc::ptr_eq(&ta, &tb));
        assert!(tb.serial() > ta.serial());
    }

    #[test]
    fn test_dropped_object_is_treated_as_absent() {
        let registry = Registry::new(1);
        let tracked = {
            let a = entity_ref(&item("gone"));
            registry.locate(&a, true).unwrap()
        };
        assert!(!tracked.is_alive());
        assert!(tracked.object().is_none());
        assert_eq!(registry.live_count(), 0);
        assert_eq!(registry.prune(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_non_entity_values_are_rejected() {
        let registry = Registry::default();
        let err = registry.locate_value(&42_u32, true).unwrap_err();
        assert!(matches!(err, Error::InvalidEntityKind { type_name } if type_name == "u32"));

        let a = entity_ref(&item("a"));
        let tracked = registry.locate_value(&a, true).unwrap();
        assert!(tracked.is_some());
    }

    #[test]
    fn test_snapshot_replacement_invalidates_identity() {
        let registry = Registry::default();
        let a = entity_ref(&item("a"));
        let tracked = registry.locate(&a, true).unwrap();
        assert_eq!(tracked.identity(), None);

        tracked.attach_map(Arc::new(ModelMap::<Item>::new()));
        tracked.set_snapshot(Record::new().with("id", 7_i64));
        assert_eq!(tracked.identity().as_deref(), Some("items:7"));

        tracked.set_snapshot(Record::new().with("id", 8_i64));
        assert_eq!(tracked.identity().as_deref(), Some("items:8"));
        assert_eq!(tracked.state(), EntityState::Ready);

        tracked.clear_snapshot();
        assert_eq!(tracked.identity(), None);
        assert_eq!(tracked.state(), EntityState::Detached);
    }

    #[test]
    fn test_state_derivation_is_a_pure_match() {
        assert_eq!(EntityState::derive(None, false), EntityState::Detached);
        assert_eq!(EntityState::derive(None, true), EntityState::Ready);
        assert_eq!(
            EntityState::derive(Some(OperationKind::Delete), true),
            EntityState::PendingDelete
        );
        assert_eq!(
            EntityState::derive(Some(OperationKind::Insert), false),
            EntityState::PendingInsert
        );
        assert!(EntityState::PendingUpdate.is_pending());
        assert!(!EntityState::Ready.is_pending());
    }

    #[test]
    fn test_concurrent_locates_of_one_object_agree() {
        let registry = Arc::new(Registry::new(2));
        let a = entity_ref(&item("shared"));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let a = Arc::clone(&a);
                thread::spawn(move || registry.locate(&a, true).unwrap().serial())
            })
            .collect();

        let serials: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(serials.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(registry.len(), 1);
    }
}

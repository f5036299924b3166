//! Draining the unit-of-work queue against the store.
//!
//! The drain runs with the unit's submit gate closed and the repository's
//! master lock held, so no submit can interleave with it and only one drain
//! per repository touches the store at a time. Operations execute in queue
//! order; the first failure stops the drain, leaving already-executed
//! operations done and the rest queued for the next flush. A completed drain
//! prunes registry records whose objects are gone.

use crate::registry::{EntityState, TrackedEntity};
use crate::unit_of_work::UnitOfWork;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use unitwork_core::{EntityRef, OperationKind, Result, WeakEntityRef};

/// What a change-log entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    /// The entity's data must be reloaded because a related entity changed.
    Refresh,
}

impl From<OperationKind> for ChangeKind {
    fn from(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Insert => ChangeKind::Insert,
            OperationKind::Update => ChangeKind::Update,
            OperationKind::Delete => ChangeKind::Delete,
        }
    }
}

/// One executed change (or refresh request) of a unit of work.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeLogEntry {
    pub kind: ChangeKind,
    /// Entity name, which is also the key of the storage map that wrote it.
    pub entity_name: &'static str,
    /// Serial of the tracked entity.
    pub serial: u64,
    /// Identity string at the time of the change (e.g. `orders:7`).
    pub identity: Option<String>,
    /// Whether the change was scheduled by a cascade.
    pub cascaded: bool,
    #[serde(skip)]
    object: WeakEntityRef,
}

impl ChangeLogEntry {
    pub(crate) fn new(
        kind: ChangeKind,
        tracked: &TrackedEntity,
        object: &EntityRef,
        identity: Option<String>,
        cascaded: bool,
    ) -> Self {
        Self {
            kind,
            entity_name: tracked.entity_name(),
            serial: tracked.serial(),
            identity,
            cascaded,
            object: Arc::downgrade(object),
        }
    }

    fn refresh(tracked: &TrackedEntity, object: &EntityRef) -> Self {
        Self::new(ChangeKind::Refresh, tracked, object, tracked.identity(), true)
    }

    /// The affected object, if it is still alive.
    pub fn object(&self) -> Option<EntityRef> {
        self.object.upgrade()
    }

    /// Identity string, or `entity#serial` when the entity has none.
    pub fn label(&self) -> String {
        self.identity
            .clone()
            .unwrap_or_else(|| format!("{}#{}", self.entity_name, self.serial))
    }
}

/// Counts of what a flush did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushResult {
    /// Number of rows inserted.
    pub inserted: usize,
    /// Number of rows updated.
    pub updated: usize,
    /// Number of rows deleted.
    pub deleted: usize,
    /// Operations dropped because their entity was no longer alive.
    pub skipped: usize,
    /// Entities flagged for reload.
    pub refreshed: usize,
}

impl FlushResult {
    /// Total number of store writes.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }

    fn count(&mut self, kind: ChangeKind) {
        match kind {
            ChangeKind::Insert => self.inserted += 1,
            ChangeKind::Update => self.updated += 1,
            ChangeKind::Delete => self.deleted += 1,
            ChangeKind::Refresh => self.refreshed += 1,
        }
    }
}

/// Execute every queued operation in order. Caller holds the unit's drain
/// gate.
#[tracing::instrument(level = "debug", skip(unit))]
pub(crate) fn drain(unit: &UnitOfWork) -> Result<FlushResult> {
    let _master = unit.repository().lock_master();
    let started = Instant::now();
    let mut result = FlushResult::default();

    while let Some(op) = unit.front() {
        if op.is_disposed() {
            unit.dequeue(&op);
            continue;
        }
        if !op.entity().is_alive() {
            tracing::warn!(
                op = op.id(),
                kind = %op.kind(),
                entity = op.entity().entity_name(),
                serial = op.entity().serial(),
                "Skipping operation on a dropped entity"
            );
            op.cancel();
            unit.dequeue(&op);
            result.skipped += 1;
            continue;
        }
        if let Some(entry) = op.execute_locked(unit)? {
            result.count(entry.kind);
        }
    }

    let log_refreshes = unit.repository().config().log_refreshes;
    for tracked in unit.take_refresh_marks() {
        let Some(object) = tracked.object() else {
            continue;
        };
        if tracked.state() == EntityState::Detached {
            continue;
        }
        result.count(ChangeKind::Refresh);
        if log_refreshes {
            unit.record_change(ChangeLogEntry::refresh(&tracked, &object));
        }
    }

    // Dead records pin their recorded children until removed.
    let pruned = unit.repository().registry().prune();

    tracing::info!(
        inserted = result.inserted,
        updated = result.updated,
        deleted = result.deleted,
        skipped = result.skipped,
        refreshed = result.refreshed,
        pruned,
        elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        "Flush complete"
    );
    Ok(result)
}

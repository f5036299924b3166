//! The unit of work: an ordered queue of pending operations.
//!
//! # Overview
//!
//! The Unit of Work:
//! - Holds at most one pending operation per tracked entity
//! - Keeps operations in execution order (cascades re-order by moving an
//!   operation to the tail)
//! - Collects entities that need a reload after a related write
//! - Records a change log of everything executed
//!
//! # Example
//!
//! ```ignore
//! let unit = repository.unit_of_work();
//!
//! // Insert an order; its detached line items are queued too
//! unit.insert(&entity_ref(&order))?;
//!
//! // Delete a customer; owned rows are deleted right away
//! unit.delete(&entity_ref(&customer))?;
//!
//! // Execute in queue order and collect the change log
//! let log = unit.commit()?;
//! ```
//!
//! # Locking
//!
//! Submits hold the unit's gate for reading, flushes hold it for writing, so
//! several threads may submit on different entities at once but never while a
//! flush is draining. The queue itself sits behind a short-lived mutex.

use crate::Repository;
use crate::flush::{self, ChangeLogEntry, FlushResult};
use crate::operation::{Mutation, Operation};
use crate::registry::{EntityState, TrackedEntity};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};
use unitwork_core::{ConflictError, EntityRef, Error, OperationKind, Result};

/// Callbacks receive no arguments; returning `Err` aborts the surrounding
/// flush or commit.
type UnitEventFn = Box<dyn FnMut() -> Result<()> + Send>;

/// Lifecycle events of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOfWorkEvent {
    /// Fired before the queue is drained. An error aborts the flush.
    BeforeFlush,
    /// Fired after the queue drained successfully.
    AfterFlush,
    /// Fired after commit handed back the change log.
    AfterCommit,
    /// Fired after rollback cancelled the queue.
    AfterRollback,
}

#[derive(Default)]
struct UnitOfWorkEvents {
    before_flush: Vec<UnitEventFn>,
    after_flush: Vec<UnitEventFn>,
    after_commit: Vec<UnitEventFn>,
    after_rollback: Vec<UnitEventFn>,
}

impl UnitOfWorkEvents {
    fn fire(&mut self, event: UnitOfWorkEvent) -> Result<()> {
        let callbacks = match event {
            UnitOfWorkEvent::BeforeFlush => &mut self.before_flush,
            UnitOfWorkEvent::AfterFlush => &mut self.after_flush,
            UnitOfWorkEvent::AfterCommit => &mut self.after_commit,
            UnitOfWorkEvent::AfterRollback => &mut self.after_rollback,
        };
        for cb in callbacks.iter_mut() {
            cb()?;
        }
        Ok(())
    }

    fn register(&mut self, event: UnitOfWorkEvent, f: UnitEventFn) {
        match event {
            UnitOfWorkEvent::BeforeFlush => self.before_flush.push(f),
            UnitOfWorkEvent::AfterFlush => self.after_flush.push(f),
            UnitOfWorkEvent::AfterCommit => self.after_commit.push(f),
            UnitOfWorkEvent::AfterRollback => self.after_rollback.push(f),
        }
    }
}

/// Number of pending operations by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingCounts {
    /// Number of pending inserts.
    pub inserts: usize,
    /// Number of pending updates.
    pub updates: usize,
    /// Number of pending deletes.
    pub deletes: usize,
}

impl PendingCounts {
    /// Total pending operations.
    pub fn total(&self) -> usize {
        self.inserts + self.updates + self.deletes
    }

    /// Check if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Snapshot of a unit of work's internal sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UnitOfWorkDebugInfo {
    pub pending: usize,
    pub refresh_marks: usize,
    pub change_log: usize,
    pub disposed: bool,
}

/// Pending mutations of one logical transaction.
pub struct UnitOfWork {
    repository: Repository,
    this: Weak<UnitOfWork>,
    queue: Mutex<VecDeque<Arc<Operation>>>,
    gate: RwLock<()>,
    refresh: Mutex<Vec<Arc<TrackedEntity>>>,
    change_log: Mutex<Vec<ChangeLogEntry>>,
    events: Mutex<UnitOfWorkEvents>,
    disposed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl UnitOfWork {
    pub(crate) fn new(repository: Repository) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            repository,
            this: this.clone(),
            queue: Mutex::new(VecDeque::new()),
            gate: RwLock::new(()),
            refresh: Mutex::new(Vec::new()),
            change_log: Mutex::new(Vec::new()),
            events: Mutex::new(UnitOfWorkEvents::default()),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    fn handle(&self) -> Result<Arc<Self>> {
        self.this.upgrade().ok_or_else(|| Error::Disposed {
            what: "unit of work".to_string(),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disposed {
                what: "unit of work".to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn enter_submit(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn enter_drain(&self) -> RwLockWriteGuard<'_, ()> {
        self.gate.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether [`UnitOfWork::dispose`] has been called.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub(crate) fn create_operation(
        &self,
        mutation: Mutation,
        tracked: Arc<TrackedEntity>,
        cascaded: bool,
    ) -> Arc<Operation> {
        Arc::new(Operation::new(
            self.repository.next_operation_id(),
            mutation,
            tracked,
            self.this.clone(),
            cascaded,
        ))
    }

    /// Create an operation of `kind` for `entity` without submitting it.
    pub fn operation(&self, kind: OperationKind, entity: &EntityRef) -> Result<Arc<Operation>> {
        self.ensure_open()?;
        let tracked = self.repository.locate(entity);
        Ok(self.create_operation(Mutation::of(kind), tracked, false))
    }

    /// Submit an operation created by this unit of work.
    pub fn submit(&self, op: &Arc<Operation>) -> Result<()> {
        let this = self.handle()?;
        let _gate = self.enter_submit();
        op.submit_in(&this, None)
    }

    fn create_and_submit(&self, kind: OperationKind, entity: &EntityRef) -> Result<Arc<Operation>> {
        let op = self.operation(kind, entity)?;
        self.submit(&op)?;
        Ok(op)
    }

    /// Schedule an insert of `entity` (and whatever its relations require).
    pub fn insert(&self, entity: &EntityRef) -> Result<Arc<Operation>> {
        self.create_and_submit(OperationKind::Insert, entity)
    }

    /// Schedule an update of `entity`.
    pub fn update(&self, entity: &EntityRef) -> Result<Arc<Operation>> {
        self.create_and_submit(OperationKind::Update, entity)
    }

    /// Schedule a delete of `entity`.
    ///
    /// A pending insert of the same entity is cancelled instead, since the
    /// row was never written; `None` is returned in that case.
    pub fn delete(&self, entity: &EntityRef) -> Result<Option<Arc<Operation>>> {
        self.ensure_open()?;
        let tracked = self.repository.locate(entity);
        if tracked.state() == EntityState::PendingInsert {
            if let Some(insert) = tracked.pending() {
                tracing::debug!(
                    entity = %tracked.describe(),
                    op = insert.id(),
                    "Delete supersedes pending insert"
                );
                self.cancel(&insert);
            }
            return Ok(None);
        }
        self.create_and_submit(OperationKind::Delete, entity).map(Some)
    }

    /// Insert when detached, update when persisted, nothing when an insert
    /// or update is already pending.
    pub fn save(&self, entity: &EntityRef) -> Result<Option<Arc<Operation>>> {
        self.ensure_open()?;
        let tracked = self.repository.locate(entity);
        match tracked.state() {
            EntityState::Detached => self.insert(entity).map(Some),
            EntityState::Ready => self.update(entity).map(Some),
            EntityState::PendingInsert | EntityState::PendingUpdate => Ok(None),
            EntityState::PendingDelete => Err(Error::ConflictingOperation(ConflictError {
                entity: tracked.describe(),
                existing: OperationKind::Delete,
                requested: None,
            })),
        }
    }

    /// Cancel a pending operation. Returns `false` if it had already finished.
    pub fn cancel(&self, op: &Operation) -> bool {
        let _gate = self.enter_submit();
        op.cancel()
    }

    /// Pending operations in execution order.
    pub fn pending(&self) -> Vec<Arc<Operation>> {
        lock(&self.queue).iter().cloned().collect()
    }

    pub fn pending_counts(&self) -> PendingCounts {
        let mut counts = PendingCounts::default();
        for op in lock(&self.queue).iter() {
            match op.kind() {
                OperationKind::Insert => counts.inserts += 1,
                OperationKind::Update => counts.updates += 1,
                OperationKind::Delete => counts.deletes += 1,
            }
        }
        counts
    }

    /// Check if nothing is pending.
    pub fn is_empty(&self) -> bool {
        lock(&self.queue).is_empty()
    }

    /// Execute every pending operation in queue order.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn flush(&self) -> Result<FlushResult> {
        self.ensure_open()?;
        self.fire(UnitOfWorkEvent::BeforeFlush)?;

        let result = {
            let _gate = self.enter_drain();
            tracing::info!(pending = lock(&self.queue).len(), "Flushing unit of work");
            flush::drain(self)?
        };

        self.fire(UnitOfWorkEvent::AfterFlush)?;
        Ok(result)
    }

    /// Flush, then hand back and clear the change log.
    pub fn commit(&self) -> Result<Vec<ChangeLogEntry>> {
        self.flush()?;
        let log = self.take_change_log();
        tracing::info!(changes = log.len(), "Unit of work committed");
        self.fire(UnitOfWorkEvent::AfterCommit)?;
        Ok(log)
    }

    /// Cancel every pending operation and forget refresh marks and the
    /// change log. Returns the number of operations cancelled.
    ///
    /// Deletes already executed inline by a delete cascade are not undone.
    pub fn rollback(&self) -> Result<usize> {
        let cancelled = {
            let _gate = self.enter_drain();
            self.cancel_all()
        };
        lock(&self.refresh).clear();
        lock(&self.change_log).clear();
        tracing::info!(cancelled, "Unit of work rolled back");
        self.fire(UnitOfWorkEvent::AfterRollback)?;
        Ok(cancelled)
    }

    fn cancel_all(&self) -> usize {
        let ops: Vec<_> = lock(&self.queue).drain(..).collect();
        ops.iter().filter(|op| op.cancel()).count()
    }

    /// Roll back silently and refuse any further use.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _gate = self.enter_drain();
        let cancelled = self.cancel_all();
        tracing::debug!(cancelled, "Unit of work disposed");
    }

    /// Everything executed so far, oldest first.
    pub fn change_log(&self) -> Vec<ChangeLogEntry> {
        lock(&self.change_log).clone()
    }

    pub fn take_change_log(&self) -> Vec<ChangeLogEntry> {
        std::mem::take(&mut *lock(&self.change_log))
    }

    /// Entities flagged for reload by the next flush.
    pub fn refresh_marks(&self) -> Vec<Arc<TrackedEntity>> {
        lock(&self.refresh).clone()
    }

    pub fn debug_info(&self) -> UnitOfWorkDebugInfo {
        UnitOfWorkDebugInfo {
            pending: lock(&self.queue).len(),
            refresh_marks: lock(&self.refresh).len(),
            change_log: lock(&self.change_log).len(),
            disposed: self.is_disposed(),
        }
    }

    fn fire(&self, event: UnitOfWorkEvent) -> Result<()> {
        lock(&self.events).fire(event)
    }

    fn on(&self, event: UnitOfWorkEvent, f: UnitEventFn) {
        lock(&self.events).register(event, f);
    }

    /// Register a callback run before each flush.
    pub fn on_before_flush(&self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.on(UnitOfWorkEvent::BeforeFlush, Box::new(f));
    }

    /// Register a callback run after each successful flush.
    pub fn on_after_flush(&self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.on(UnitOfWorkEvent::AfterFlush, Box::new(f));
    }

    /// Register a callback run after each commit.
    pub fn on_after_commit(&self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.on(UnitOfWorkEvent::AfterCommit, Box::new(f));
    }

    /// Register a callback run after each rollback.
    pub fn on_after_rollback(&self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.on(UnitOfWorkEvent::AfterRollback, Box::new(f));
    }

    pub(crate) fn enqueue(&self, op: Arc<Operation>) {
        lock(&self.queue).push_back(op);
    }

    pub(crate) fn dequeue(&self, op: &Operation) {
        lock(&self.queue).retain(|queued| !std::ptr::eq(Arc::as_ptr(queued), op));
    }

    pub(crate) fn front(&self) -> Option<Arc<Operation>> {
        lock(&self.queue).front().cloned()
    }

    /// Move `op` to the tail of the queue.
    pub(crate) fn move_to_back(&self, op: &Arc<Operation>) {
        let mut queue = lock(&self.queue);
        if let Some(pos) = queue.iter().position(|queued| Arc::ptr_eq(queued, op)) {
            if pos + 1 != queue.len() {
                if let Some(moved) = queue.remove(pos) {
                    queue.push_back(moved);
                    tracing::debug!(op = op.id(), from = pos, "Moved operation to the tail");
                }
            }
        }
    }

    pub(crate) fn mark_refresh(&self, tracked: &Arc<TrackedEntity>) {
        let mut marks = lock(&self.refresh);
        if !marks.iter().any(|marked| Arc::ptr_eq(marked, tracked)) {
            tracing::debug!(entity = %tracked.describe(), "Marked for refresh");
            marks.push(Arc::clone(tracked));
        }
    }

    pub(crate) fn take_refresh_marks(&self) -> Vec<Arc<TrackedEntity>> {
        std::mem::take(&mut *lock(&self.refresh))
    }

    pub(crate) fn record_change(&self, entry: ChangeLogEntry) {
        lock(&self.change_log).push(entry);
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        let ops: Vec<_> = lock(&self.queue).drain(..).collect();
        for op in ops {
            op.cancel();
        }
    }
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("info", &self.debug_info())
            .finish()
    }
}

//! Pending mutations and their cascade logic.
//!
//! An [`Operation`] is one Insert, Update, or Delete scheduled for one tracked
//! entity. Submitting it claims the entity's pending slot, appends it to the
//! unit of work, and then walks the entity's relations, recursively
//! submitting whatever related entities need for the mutation to stay
//! consistent. By the time `submit` returns, the queue holds the complete
//! plan for that mutation.
//!
//! State machine:
//!
//! ```text
//! Pending ──execute──▶ Executing ──success──▶ Done
//!    │                    │  ▲
//!    │                    └──┘ failure (retried by the next flush)
//!    └──────cancel──────▶ Cancelled ◀──cancel── Executing
//! ```

use crate::change_tracker::{diff_records, has_changes, needs_update};
use crate::dependency::{
    Dependency, classify_relations, detect_removed_children, snapshot_children,
};
use crate::flush::{ChangeKind, ChangeLogEntry};
use crate::registry::{Claim, EntityState, TrackedEntity};
use crate::unit_of_work::UnitOfWork;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use unitwork_core::{
    CommandOutcome, CommandRequest, ConcurrencyError, EntityRef, Error, ExecutionError,
    OperationKind, Result,
};

/// What an operation does, with its per-kind options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    Insert,
    /// `cascade: false` persists the entity alone without walking its
    /// children (used when a parent's pending delete is converted).
    Update { cascade: bool },
    /// `inline: true` marks a delete executed immediately by its owner's
    /// delete cascade instead of waiting for the flush.
    Delete { inline: bool },
}

impl Mutation {
    pub const fn kind(&self) -> OperationKind {
        match self {
            Mutation::Insert => OperationKind::Insert,
            Mutation::Update { .. } => OperationKind::Update,
            Mutation::Delete { .. } => OperationKind::Delete,
        }
    }

    /// Default options for a kind.
    pub const fn of(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Insert => Mutation::Insert,
            OperationKind::Update => Mutation::Update { cascade: true },
            OperationKind::Delete => Mutation::Delete { inline: false },
        }
    }
}

/// Lifecycle state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Pending,
    Executing,
    /// Terminal: executed successfully (or nothing to persist).
    Done,
    /// Terminal: disposed without executing.
    Cancelled,
}

impl OperationState {
    pub const fn is_terminal(&self) -> bool {
        matches!(self, OperationState::Done | OperationState::Cancelled)
    }
}

/// One pending mutation of one entity.
#[derive(Debug)]
pub struct Operation {
    id: u64,
    mutation: Mutation,
    entity: Arc<TrackedEntity>,
    unit: Weak<UnitOfWork>,
    cascaded: bool,
    state: Mutex<OperationState>,
}

impl Operation {
    pub(crate) fn new(
        id: u64,
        mutation: Mutation,
        entity: Arc<TrackedEntity>,
        unit: Weak<UnitOfWork>,
        cascaded: bool,
    ) -> Self {
        Self {
            id,
            mutation,
            entity,
            unit,
            cascaded,
            state: Mutex::new(OperationState::Pending),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, OperationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Repository-unique id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn mutation(&self) -> Mutation {
        self.mutation
    }

    pub fn kind(&self) -> OperationKind {
        self.mutation.kind()
    }

    pub fn state(&self) -> OperationState {
        *self.lock_state()
    }

    /// The tracked entity this operation mutates.
    pub fn entity(&self) -> &Arc<TrackedEntity> {
        &self.entity
    }

    /// Whether the operation was created by another operation's cascade.
    pub fn is_cascaded(&self) -> bool {
        self.cascaded
    }

    /// Done or cancelled.
    pub fn is_disposed(&self) -> bool {
        self.state().is_terminal()
    }

    fn disposed_error(&self) -> Error {
        Error::Disposed {
            what: format!("{} operation #{}", self.kind(), self.id),
        }
    }

    fn orphan_error(&self) -> Error {
        Error::Orphan {
            entity: self.entity.describe(),
        }
    }

    fn unit(&self) -> Result<Arc<UnitOfWork>> {
        self.unit.upgrade().ok_or_else(|| self.orphan_error())
    }

    /// Submit the operation to its unit of work, running its cascade.
    ///
    /// Re-submitting an operation that is already the entity's pending
    /// operation is a no-op.
    pub fn submit(self: &Arc<Self>) -> Result<()> {
        if self.is_disposed() {
            return Err(self.disposed_error());
        }
        let unit = self.unit()?;
        let _gate = unit.enter_submit();
        self.submit_in(&unit, None)
    }

    /// Execute the operation now, outside of a flush.
    pub fn execute(&self) -> Result<Option<ChangeLogEntry>> {
        let unit = self.unit()?;
        let _gate = unit.enter_drain();
        let _master = unit.repository().lock_master();
        self.execute_locked(&unit)
    }

    /// Dispose the operation without executing it: removes it from its queue
    /// and frees the entity's pending slot. Returns `false` if it had already
    /// finished or been cancelled.
    pub fn cancel(&self) -> bool {
        {
            let mut state = self.lock_state();
            if state.is_terminal() {
                return false;
            }
            *state = OperationState::Cancelled;
        }
        self.entity.release(self);
        if let Some(unit) = self.unit.upgrade() {
            unit.dequeue(self);
        }
        tracing::debug!(
            op = self.id,
            kind = %self.kind(),
            entity = %self.entity.describe(),
            "Operation cancelled"
        );
        true
    }

    /// Submit with the unit's submit gate already held.
    #[tracing::instrument(level = "debug", skip(self, unit, origin), fields(op = self.id, kind = %self.kind(), entity = self.entity.entity_name()))]
    pub(crate) fn submit_in(
        self: &Arc<Self>,
        unit: &Arc<UnitOfWork>,
        origin: Option<&EntityRef>,
    ) -> Result<()> {
        if self.is_disposed() {
            return Err(self.disposed_error());
        }
        if unit.is_disposed() {
            return Err(Error::Disposed {
                what: "unit of work".to_string(),
            });
        }
        let object = self.entity.object().ok_or_else(|| self.orphan_error())?;
        let map = match self.entity.map() {
            Some(map) => map,
            None => unit.repository().map_for(self.entity.entity_name())?,
        };

        if self.entity.claim(self)? == Claim::AlreadyPending {
            tracing::trace!("Operation already pending, submit is a no-op");
            return Ok(());
        }

        if self.entity.attach_map(Arc::clone(&map)) {
            if let Err(err) = map.attach(object.as_ref()) {
                self.entity.detach_map();
                self.entity.release(self);
                return Err(err);
            }
        }

        unit.enqueue(Arc::clone(self));
        tracing::debug!(
            entity = %self.entity.describe(),
            cascaded = self.cascaded,
            "Operation submitted"
        );

        match self.mutation {
            Mutation::Insert => self.cascade_insert(unit, &object, origin),
            Mutation::Update { cascade: true } => self.cascade_update(unit, &object, origin),
            Mutation::Update { cascade: false } => Ok(()),
            Mutation::Delete { .. } => self.cascade_delete(unit, &object, origin),
        }
    }

    /// Create and submit an operation for a related entity, with this
    /// entity as the cascade origin.
    fn cascade_to(
        &self,
        unit: &Arc<UnitOfWork>,
        owner: &EntityRef,
        dependency: &Dependency,
        mutation: Mutation,
    ) -> Result<Arc<Operation>> {
        let op = unit.create_operation(mutation, Arc::clone(&dependency.tracked), true);
        tracing::debug!(
            from = %self.entity.describe(),
            to = %dependency.tracked.describe(),
            relation = dependency.relation,
            kind = %op.kind(),
            "Cascading"
        );
        op.submit_in(unit, Some(owner))?;
        Ok(op)
    }

    /// Cancel whatever is pending on a related entity.
    fn cancel_pending(dependency: &Dependency) {
        if let Some(pending) = dependency.tracked.pending() {
            pending.cancel();
        }
    }

    /// A referenced parent must exist for this entity to be written.
    fn resolve_parent(
        &self,
        unit: &Arc<UnitOfWork>,
        owner: &EntityRef,
        parent: &Dependency,
    ) -> Result<()> {
        match parent.tracked.state() {
            EntityState::Detached => {
                self.cascade_to(unit, owner, parent, Mutation::Insert)?;
            }
            EntityState::Ready => {
                if has_changes(&parent.tracked)? {
                    unit.mark_refresh(&parent.tracked);
                }
            }
            EntityState::PendingDelete => {
                tracing::debug!(
                    parent = %parent.tracked.describe(),
                    "Parent is still referenced, converting its delete into an update"
                );
                Self::cancel_pending(parent);
                self.cascade_to(unit, owner, parent, Mutation::Update { cascade: false })?;
            }
            EntityState::PendingInsert | EntityState::PendingUpdate => {}
        }
        Ok(())
    }

    fn cascade_insert(
        self: &Arc<Self>,
        unit: &Arc<UnitOfWork>,
        object: &EntityRef,
        origin: Option<&EntityRef>,
    ) -> Result<()> {
        let repo = unit.repository();
        let relations = classify_relations(repo, &self.entity, origin)?;

        for parent in &relations.parents {
            self.resolve_parent(unit, object, parent)?;
        }

        for child in &relations.children {
            match child.tracked.state() {
                EntityState::Detached => {
                    self.cascade_to(unit, object, child, Mutation::Insert)?;
                }
                EntityState::Ready => {
                    if needs_update(repo, &child.tracked, false)? {
                        self.cascade_to(unit, object, child, Mutation::Update { cascade: true })?;
                    } else {
                        unit.mark_refresh(&child.tracked);
                    }
                }
                EntityState::PendingDelete => {
                    tracing::trace!(child = %child.tracked.describe(), "Child delete already scheduled");
                }
                EntityState::PendingInsert | EntityState::PendingUpdate => {
                    unit.mark_refresh(&child.tracked);
                }
            }
        }

        unit.move_to_back(self);
        Ok(())
    }

    fn cascade_update(
        self: &Arc<Self>,
        unit: &Arc<UnitOfWork>,
        object: &EntityRef,
        origin: Option<&EntityRef>,
    ) -> Result<()> {
        let repo = unit.repository();
        let relations = classify_relations(repo, &self.entity, origin)?;

        for parent in &relations.parents {
            self.resolve_parent(unit, object, parent)?;
        }
        unit.move_to_back(self);

        for removed in detect_removed_children(repo, &self.entity, origin)? {
            match removed.tracked.state() {
                EntityState::Ready => {
                    self.cascade_to(unit, object, &removed, Mutation::Delete { inline: false })?;
                }
                EntityState::PendingInsert => Self::cancel_pending(&removed),
                EntityState::PendingUpdate => {
                    Self::cancel_pending(&removed);
                    self.cascade_to(unit, object, &removed, Mutation::Delete { inline: false })?;
                }
                EntityState::PendingDelete | EntityState::Detached => {}
            }
        }

        let deep = repo.config().cascade_dirty_check;
        for child in &relations.children {
            match child.tracked.state() {
                EntityState::Detached => {
                    self.cascade_to(unit, object, child, Mutation::Insert)?;
                }
                EntityState::Ready => {
                    if needs_update(repo, &child.tracked, deep)? {
                        self.cascade_to(unit, object, child, Mutation::Update { cascade: true })?;
                    }
                }
                EntityState::PendingDelete => {
                    Self::cancel_pending(child);
                    self.cascade_to(unit, object, child, Mutation::Update { cascade: true })?;
                }
                EntityState::PendingInsert | EntityState::PendingUpdate => {
                    unit.mark_refresh(&child.tracked);
                }
            }
        }
        Ok(())
    }

    fn cascade_delete(
        &self,
        unit: &Arc<UnitOfWork>,
        object: &EntityRef,
        origin: Option<&EntityRef>,
    ) -> Result<()> {
        let repo = unit.repository();
        let mut children = detect_removed_children(repo, &self.entity, origin)?;
        let relations = classify_relations(repo, &self.entity, origin)?;
        children.extend(relations.children);

        for child in &children {
            match child.tracked.state() {
                EntityState::PendingDelete | EntityState::Detached => {}
                EntityState::PendingInsert => Self::cancel_pending(child),
                EntityState::PendingUpdate => {
                    Self::cancel_pending(child);
                    self.delete_inline(unit, object, child)?;
                }
                EntityState::Ready => self.delete_inline(unit, object, child)?,
            }
        }

        for parent in &relations.parents {
            unit.mark_refresh(&parent.tracked);
        }
        Ok(())
    }

    /// Submit a child delete and execute it immediately.
    fn delete_inline(
        &self,
        unit: &Arc<UnitOfWork>,
        owner: &EntityRef,
        child: &Dependency,
    ) -> Result<()> {
        let op = self.cascade_to(unit, owner, child, Mutation::Delete { inline: true })?;
        let _master = unit.repository().lock_master();
        op.execute_locked(unit)?;
        Ok(())
    }

    /// Persist the mutation. Caller holds the repository's master lock.
    ///
    /// Returns the change-log entry, or `None` when the command generator had
    /// nothing to persist. On failure the operation stays `Executing` and
    /// keeps its place in the queue.
    #[tracing::instrument(level = "debug", skip(self, unit), fields(op = self.id, kind = %self.kind(), entity = self.entity.entity_name()))]
    pub(crate) fn execute_locked(&self, unit: &UnitOfWork) -> Result<Option<ChangeLogEntry>> {
        {
            let mut state = self.lock_state();
            if state.is_terminal() {
                return Err(self.disposed_error());
            }
            *state = OperationState::Executing;
        }

        let kind = self.kind();
        let object = self.entity.object().ok_or_else(|| self.orphan_error())?;
        let map = self.entity.map().ok_or_else(|| self.orphan_error())?;
        let mapping = *map.mapping();

        let mut record = map.write_record(object.as_ref())?;
        let snapshot = self.entity.snapshot();
        let key = snapshot.as_ref().and_then(|s| map.extract_id(s));
        let delta = match (kind, &snapshot) {
            (OperationKind::Update, Some(snapshot)) => Some(diff_records(&mapping, snapshot, &record)),
            _ => None,
        };
        let version_column = mapping.version_column();
        let expected_version = version_column
            .and_then(|column| snapshot.as_ref()?.get(column).cloned())
            .filter(|v| !v.is_null());

        let request = CommandRequest {
            kind,
            mapping: &mapping,
            record: &record,
            key: key.as_deref(),
            delta: delta.as_ref(),
            expected_version: expected_version.as_ref(),
        };
        let Some(mut command) = unit.repository().generator().generate(&request)? else {
            tracing::debug!(entity = %self.entity.describe(), "Nothing to persist");
            if kind != OperationKind::Delete {
                // Removed children were cascaded at submit; forget them.
                self.entity
                    .record_children(snapshot_children(map.as_ref(), &object)?);
            }
            self.finish(unit);
            return Ok(None);
        };

        if let (OperationKind::Update | OperationKind::Delete, Some(column), Some(expected)) =
            (kind, version_column, expected_version.as_ref())
        {
            let current = record.get(column).filter(|v| !v.is_null());
            if current.is_some_and(|current| !current.same_as(expected)) {
                command.dispose();
                return Err(Error::ConcurrencyConflict(ConcurrencyError {
                    entity: self.entity.describe(),
                    column: column.to_string(),
                    expected: Some(expected.clone()),
                    actual: current.cloned(),
                }));
            }
        }

        let result = command.execute();
        command.dispose();
        let outcome = result.map_err(|source| {
            tracing::warn!(entity = %self.entity.describe(), error = %source, "Command failed");
            Error::Execution(ExecutionError {
                entity: self.entity.describe(),
                operation: kind,
                source: Box::new(source),
            })
        })?;

        if outcome == CommandOutcome::Affected(0) && kind != OperationKind::Insert {
            if let Some(column) = version_column {
                return Err(Error::ConcurrencyConflict(ConcurrencyError {
                    entity: self.entity.describe(),
                    column: column.to_string(),
                    expected: expected_version,
                    actual: None,
                }));
            }
            tracing::warn!(entity = %self.entity.describe(), "Store reported no affected rows");
        }

        let identity = match kind {
            OperationKind::Insert | OperationKind::Update => {
                if let CommandOutcome::Row(returned) = &outcome {
                    record.merge(returned);
                    map.load_entity(returned, object.as_ref())?;
                }
                self.entity.set_snapshot(record);
                self.entity
                    .record_children(snapshot_children(map.as_ref(), &object)?);
                self.entity.set_completed(true);
                self.entity.identity()
            }
            OperationKind::Delete => {
                let identity = self.entity.identity();
                self.entity.detach_map();
                map.detach(object.as_ref());
                identity
            }
        };

        let entry = ChangeLogEntry::new(
            ChangeKind::from(kind),
            &self.entity,
            &object,
            identity,
            self.cascaded,
        );
        tracing::debug!(entity = %entry.label(), "Operation executed");
        unit.record_change(entry.clone());
        self.finish(unit);
        Ok(Some(entry))
    }

    fn finish(&self, unit: &UnitOfWork) {
        *self.lock_state() = OperationState::Done;
        self.entity.release(self);
        unit.dequeue(self);
    }
}

//! In-memory [`CommandGenerator`] for tests and prototyping.
//!
//! Rows live in per-entity tables keyed by primary key. Generated key columns
//! receive auto-increment values, version columns start at 1 and are bumped
//! on every update, and every executed command is recorded so tests can
//! assert on execution order.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use unitwork_core::{
    Command, CommandGenerator, CommandOutcome, CommandRequest, Delta, EntityMapping, Error,
    OperationKind, Record, Result, Value,
};

/// A command the store executed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutedCommand {
    pub kind: OperationKind,
    pub entity: String,
    /// Primary key of the affected row, when it could be determined.
    pub key: Option<Vec<Value>>,
    /// Columns written (empty for deletes).
    pub columns: Vec<String>,
}

#[derive(Default)]
struct StoreState {
    tables: HashMap<String, BTreeMap<String, Record>>,
    sequences: HashMap<String, i64>,
    executed: Vec<ExecutedCommand>,
    /// Successful executions to allow before failing with the message.
    failure: Option<(usize, String)>,
    stale_next: bool,
    disposed: usize,
}

impl StoreState {
    fn take_failure(&mut self) -> Option<String> {
        match self.failure.take() {
            Some((0, message)) => Some(message),
            Some((remaining, message)) => {
                self.failure = Some((remaining - 1, message));
                None
            }
            None => None,
        }
    }

    fn table(&mut self, entity: &str) -> &mut BTreeMap<String, Record> {
        self.tables.entry(entity.to_string()).or_default()
    }

    fn next_id(&mut self, entity: &str) -> i64 {
        let next = self.sequences.entry(entity.to_string()).or_insert(0);
        *next += 1;
        *next
    }

    fn observe_id(&mut self, entity: &str, id: i64) {
        let next = self.sequences.entry(entity.to_string()).or_insert(0);
        *next = (*next).max(id);
    }
}

fn row_key(key: &[Value]) -> String {
    key.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("|")
}

fn lock(state: &Mutex<StoreState>) -> MutexGuard<'_, StoreState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared in-memory store. Clones share the same tables.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands executed so far, in order.
    pub fn executed(&self) -> Vec<ExecutedCommand> {
        lock(&self.state).executed.clone()
    }

    /// All rows of an entity, ordered by key.
    pub fn rows(&self, entity: &str) -> Vec<Record> {
        lock(&self.state)
            .tables
            .get(entity)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row(&self, entity: &str, key: &[Value]) -> Option<Record> {
        lock(&self.state)
            .tables
            .get(entity)
            .and_then(|table| table.get(&row_key(key)))
            .cloned()
    }

    /// Number of rows of an entity.
    pub fn count(&self, entity: &str) -> usize {
        lock(&self.state).tables.get(entity).map_or(0, BTreeMap::len)
    }

    /// Store a row directly, bypassing command execution.
    pub fn seed(&self, mapping: &EntityMapping, record: Record) -> Result<()> {
        let key = record
            .key_values(&mapping.primary_key())
            .ok_or_else(|| Error::store(format!("seeded {} row has no key", mapping.name)))?;
        let mut state = lock(&self.state);
        if let [id] = key.as_slice() {
            if let Some(id) = id.as_i64() {
                state.observe_id(mapping.name, id);
            }
        }
        state.table(mapping.name).insert(row_key(&key), record);
        Ok(())
    }

    /// Fail the next command executed.
    pub fn fail_next(&self, message: impl Into<String>) {
        self.fail_next_after(0, message);
    }

    /// Let `successes` commands execute, then fail the one after.
    pub fn fail_next_after(&self, successes: usize, message: impl Into<String>) {
        lock(&self.state).failure = Some((successes, message.into()));
    }

    /// Make the next command report zero affected rows without touching
    /// any table, as if another writer got there first.
    pub fn report_stale_next(&self) {
        lock(&self.state).stale_next = true;
    }

    /// Number of commands disposed so far.
    pub fn disposed(&self) -> usize {
        lock(&self.state).disposed
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("MemoryStore")
            .field("tables", &state.tables.len())
            .field("executed", &state.executed.len())
            .finish()
    }
}

enum Plan {
    Insert {
        row: Record,
        primary_key: Vec<&'static str>,
        generated: Vec<&'static str>,
    },
    Update {
        key: Vec<Value>,
        changes: Delta,
    },
    Delete {
        key: Vec<Value>,
    },
}

struct MemoryCommand {
    state: Arc<Mutex<StoreState>>,
    entity: &'static str,
    version: Option<&'static str>,
    expected_version: Option<Value>,
    plan: Plan,
    disposed: bool,
}

impl MemoryCommand {
    fn version_matches(&self, row: &Record) -> bool {
        match (self.version, &self.expected_version) {
            (Some(column), Some(expected)) => {
                row.get(column).is_some_and(|v| v.same_as(expected))
            }
            _ => true,
        }
    }

    fn next_version(&self, row: &Record) -> Option<Value> {
        let column = self.version?;
        let current = row.get(column).and_then(Value::as_i64).unwrap_or(0);
        Some(Value::BigInt(current + 1))
    }

    fn insert(
        &self,
        state: &mut StoreState,
        row: &Record,
        primary_key: &[&'static str],
        generated: &[&'static str],
    ) -> Result<(CommandOutcome, ExecutedCommand)> {
        let mut row = row.clone();
        let mut returned = Record::new();
        for column in generated {
            if row.get(column).is_none_or(Value::is_null) {
                let id = Value::BigInt(state.next_id(self.entity));
                row.set(*column, id.clone());
                returned.set(*column, id);
            } else if let Some(id) = row.get(column).and_then(Value::as_i64) {
                state.observe_id(self.entity, id);
            }
        }
        if let Some(column) = self.version {
            row.set(column, 1_i64);
            returned.set(column, 1_i64);
        }

        let key = row.key_values(primary_key).ok_or_else(|| {
            Error::store(format!("insert into {} without a primary key", self.entity))
        })?;
        let table = state.table(self.entity);
        let slot = row_key(&key);
        if table.contains_key(&slot) {
            return Err(Error::store(format!(
                "duplicate key {} in {}",
                slot, self.entity
            )));
        }
        let columns = row.iter().map(|(c, _)| c.to_string()).collect();
        table.insert(slot, row);

        let outcome = if returned.is_empty() {
            CommandOutcome::Affected(1)
        } else {
            CommandOutcome::Row(returned)
        };
        Ok((
            outcome,
            ExecutedCommand {
                kind: OperationKind::Insert,
                entity: self.entity.to_string(),
                key: Some(key),
                columns,
            },
        ))
    }

    fn update(
        &self,
        state: &mut StoreState,
        key: &[Value],
        changes: &Delta,
    ) -> (CommandOutcome, ExecutedCommand) {
        let executed = ExecutedCommand {
            kind: OperationKind::Update,
            entity: self.entity.to_string(),
            key: Some(key.to_vec()),
            columns: changes.columns().into_iter().map(str::to_string).collect(),
        };
        let table = state.table(self.entity);
        let Some(row) = table.get_mut(&row_key(key)) else {
            return (CommandOutcome::Affected(0), executed);
        };
        if !self.version_matches(row) {
            return (CommandOutcome::Affected(0), executed);
        }
        for change in changes.iter() {
            row.set(change.column.as_str(), change.value.clone());
        }
        let outcome = match (self.version, self.next_version(row)) {
            (Some(column), Some(version)) => {
                row.set(column, version.clone());
                CommandOutcome::Row(Record::new().with(column, version))
            }
            _ => CommandOutcome::Affected(1),
        };
        (outcome, executed)
    }

    fn delete(&self, state: &mut StoreState, key: &[Value]) -> (CommandOutcome, ExecutedCommand) {
        let executed = ExecutedCommand {
            kind: OperationKind::Delete,
            entity: self.entity.to_string(),
            key: Some(key.to_vec()),
            columns: Vec::new(),
        };
        let table = state.table(self.entity);
        let slot = row_key(key);
        let matches = table.get(&slot).is_some_and(|row| self.version_matches(row));
        if matches {
            table.remove(&slot);
        }
        (CommandOutcome::Affected(u64::from(matches)), executed)
    }
}

impl Command for MemoryCommand {
    fn execute(&mut self) -> Result<CommandOutcome> {
        let mut state = lock(&self.state);
        if let Some(message) = state.take_failure() {
            tracing::debug!(entity = self.entity, %message, "Injected store failure");
            return Err(Error::store(message));
        }
        if std::mem::take(&mut state.stale_next) {
            tracing::debug!(entity = self.entity, "Injected stale write");
            return Ok(CommandOutcome::Affected(0));
        }

        let (outcome, executed) = match &self.plan {
            Plan::Insert {
                row,
                primary_key,
                generated,
            } => self.insert(&mut state, row, primary_key, generated)?,
            Plan::Update { key, changes } => self.update(&mut state, key, changes),
            Plan::Delete { key } => self.delete(&mut state, key),
        };
        tracing::trace!(entity = self.entity, kind = %executed.kind, "Executed in-memory command");
        state.executed.push(executed);
        Ok(outcome)
    }

    fn dispose(&mut self) {
        if !self.disposed {
            self.disposed = true;
            lock(&self.state).disposed += 1;
        }
    }
}

impl CommandGenerator for MemoryStore {
    fn generate(&self, request: &CommandRequest<'_>) -> Result<Option<Box<dyn Command>>> {
        let mapping = request.mapping;
        let plan = match request.kind {
            OperationKind::Insert => Plan::Insert {
                row: request.record.clone(),
                primary_key: mapping.primary_key(),
                generated: mapping
                    .columns
                    .iter()
                    .filter(|c| c.primary_key && c.generated)
                    .map(|c| c.name)
                    .collect(),
            },
            OperationKind::Update => {
                let (Some(key), Some(delta)) = (request.key, request.delta) else {
                    return Ok(None);
                };
                if delta.is_empty() {
                    return Ok(None);
                }
                Plan::Update {
                    key: key.to_vec(),
                    changes: delta.clone(),
                }
            }
            OperationKind::Delete => {
                let Some(key) = request.key else {
                    return Ok(None);
                };
                Plan::Delete { key: key.to_vec() }
            }
        };

        Ok(Some(Box::new(MemoryCommand {
            state: Arc::clone(&self.state),
            entity: mapping.name,
            version: mapping.version_column(),
            expected_version: request.expected_version.cloned(),
            plan,
            disposed: false,
        })))
    }
}

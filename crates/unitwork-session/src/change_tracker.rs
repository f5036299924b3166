//! Change detection against the last persisted snapshot.
//!
//! Detection is a pure function of the entity's current field values and its
//! stored snapshot: nothing here mutates tracking state, so calling
//! [`detect_changes`] twice without touching the object yields equal deltas.

use crate::Repository;
use crate::dependency;
use crate::registry::TrackedEntity;
use std::sync::Arc;
use unitwork_core::{Delta, EntityMapping, Record, Result, Value};

/// Diff two records column by column.
///
/// Only writable columns are compared; read-only and version columns never
/// appear in a delta. A column absent from `current` is treated as unchanged,
/// so storage maps may write partial records. Integer widths are ignored
/// (see [`Value::same_as`]).
pub fn diff_records(mapping: &EntityMapping, snapshot: &Record, current: &Record) -> Delta {
    let mut delta = Delta::new();
    for column in mapping.writable_columns() {
        let Some(now) = current.get(column.name) else {
            continue;
        };
        let before = snapshot.get(column.name).unwrap_or(&Value::Null);
        if !before.same_as(now) {
            tracing::trace!(
                entity = mapping.name,
                column = column.name,
                "Column changed"
            );
            delta.push(column.name, now.clone());
        }
    }
    delta
}

/// Compute the delta between the entity's current values and its snapshot.
///
/// Returns `None` when there is no snapshot to compare against (detached or
/// never persisted), when the object has been dropped, or when no column
/// differs.
#[tracing::instrument(level = "trace", skip(tracked), fields(entity = tracked.entity_name(), serial = tracked.serial()))]
pub fn detect_changes(tracked: &TrackedEntity) -> Result<Option<Delta>> {
    let Some(snapshot) = tracked.snapshot() else {
        tracing::trace!("No snapshot, nothing to compare");
        return Ok(None);
    };
    let (Some(map), Some(object)) = (tracked.map(), tracked.object()) else {
        return Ok(None);
    };

    let current = map.write_record(object.as_ref())?;
    let delta = diff_records(map.mapping(), &snapshot, &current);
    tracing::trace!(changed = delta.len(), "Change detection result");
    Ok((!delta.is_empty()).then_some(delta))
}

/// Whether [`detect_changes`] would report anything.
pub fn has_changes(tracked: &TrackedEntity) -> Result<bool> {
    Ok(detect_changes(tracked)?.is_some())
}

/// Whether the entity must be written by an Update.
///
/// True when the entity itself changed, when children recorded at the last
/// persist are no longer referenced, or (with `cascade`) when any current
/// child needs an update of its own. The cascade looks exactly one level
/// down.
pub fn needs_update(repo: &Repository, tracked: &Arc<TrackedEntity>, cascade: bool) -> Result<bool> {
    if has_changes(tracked)? {
        return Ok(true);
    }
    if !dependency::detect_removed_children(repo, tracked, None)?.is_empty() {
        tracing::debug!(
            entity = %tracked.describe(),
            "Removed children pending"
        );
        return Ok(true);
    }
    if cascade {
        for child in dependency::current_children(repo, tracked, None)? {
            if needs_update(repo, &child.tracked, false)? {
                tracing::debug!(
                    entity = %tracked.describe(),
                    child = %child.tracked.describe(),
                    "Child needs update"
                );
                return Ok(true);
            }
        }
    }
    Ok(false)
}

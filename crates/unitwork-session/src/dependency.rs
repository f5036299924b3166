//! Dependency walking over related objects.
//!
//! Relations are classified by the mapping metadata, never inferred:
//! children are owned by the entity (their lifecycle follows the owner),
//! parents are merely referenced. Every walk takes an optional `origin`, the
//! entity that triggered the cascade; a related object that is the origin is
//! skipped so bidirectional relations cannot cascade back and forth forever.

use crate::Repository;
use crate::registry::TrackedEntity;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use unitwork_core::{
    DependencyMode, EntityRef, Error, RelationInfo, Result, StorageMap, entity_address,
};

/// A related object reached through one relation.
#[derive(Clone)]
pub struct Dependency {
    /// Relation the object was reached through.
    pub relation: &'static str,
    pub mode: DependencyMode,
    pub entity: EntityRef,
    pub tracked: Arc<TrackedEntity>,
}

impl std::fmt::Debug for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dependency")
            .field("relation", &self.relation)
            .field("mode", &self.mode)
            .field("entity", &self.entity.entity_name())
            .field("tracked", &self.tracked)
            .finish()
    }
}

/// Related objects of one entity, split by dependency mode.
#[derive(Debug, Default)]
pub struct Relations {
    /// Owned objects.
    pub children: Vec<Dependency>,
    /// Referenced objects.
    pub parents: Vec<Dependency>,
}

impl Relations {
    pub fn is_empty(&self) -> bool {
        self.children.is_empty() && self.parents.is_empty()
    }
}

struct Walk<'a> {
    repo: &'a Repository,
    object: EntityRef,
    map: Arc<dyn StorageMap>,
    seen: HashSet<usize>,
}

impl<'a> Walk<'a> {
    fn start(
        repo: &'a Repository,
        tracked: &TrackedEntity,
        origin: Option<&EntityRef>,
    ) -> Result<Self> {
        let object = tracked.object().ok_or_else(|| Error::Orphan {
            entity: tracked.describe(),
        })?;
        let map = match tracked.map() {
            Some(map) => map,
            None => repo.map_for(tracked.entity_name())?,
        };
        let mut seen = HashSet::new();
        seen.insert(entity_address(&object));
        if let Some(origin) = origin {
            seen.insert(entity_address(origin));
        }
        Ok(Self {
            repo,
            object,
            map,
            seen,
        })
    }

    /// Register `entity` as visited; false if it was the origin, the walked
    /// entity itself, or already reported.
    fn visit(&mut self, entity: &EntityRef) -> bool {
        self.seen.insert(entity_address(entity))
    }

    fn dependency(&self, relation: &RelationInfo, entity: EntityRef) -> Dependency {
        Dependency {
            relation: relation.name,
            mode: relation.mode,
            tracked: self.repo.locate(&entity),
            entity,
        }
    }

    fn collect<'r>(
        &mut self,
        relations: impl Iterator<Item = &'r RelationInfo>,
        out: &mut Vec<Dependency>,
    ) -> Result<()> {
        for relation in relations {
            for related in self.map.related(self.object.as_ref(), relation.name)? {
                if !self.visit(&related) {
                    tracing::trace!(relation = relation.name, "Skipping visited or origin object");
                    continue;
                }
                out.push(self.dependency(relation, related));
            }
        }
        Ok(())
    }
}

/// Split the entity's currently referenced objects into children and parents.
#[tracing::instrument(level = "trace", skip(repo, tracked, origin), fields(entity = tracked.entity_name(), serial = tracked.serial()))]
pub fn classify_relations(
    repo: &Repository,
    tracked: &TrackedEntity,
    origin: Option<&EntityRef>,
) -> Result<Relations> {
    let mut walk = Walk::start(repo, tracked, origin)?;
    let mapping = *walk.map.mapping();
    let mut relations = Relations::default();
    walk.collect(mapping.children(), &mut relations.children)?;
    walk.collect(mapping.parents(), &mut relations.parents)?;
    tracing::trace!(
        children = relations.children.len(),
        parents = relations.parents.len(),
        "Classified relations"
    );
    Ok(relations)
}

/// Objects currently referenced through child relations.
pub fn current_children(
    repo: &Repository,
    tracked: &TrackedEntity,
    origin: Option<&EntityRef>,
) -> Result<Vec<Dependency>> {
    let mut walk = Walk::start(repo, tracked, origin)?;
    let mapping = *walk.map.mapping();
    let mut children = Vec::new();
    walk.collect(mapping.children(), &mut children)?;
    Ok(children)
}

/// Children recorded at the last persist that the entity no longer references.
///
/// These must be deleted even though they are unreachable from the owner.
#[tracing::instrument(level = "trace", skip(repo, tracked, origin), fields(entity = tracked.entity_name(), serial = tracked.serial()))]
pub fn detect_removed_children(
    repo: &Repository,
    tracked: &TrackedEntity,
    origin: Option<&EntityRef>,
) -> Result<Vec<Dependency>> {
    let relations = tracked.child_relations();
    if relations.is_empty() {
        return Ok(Vec::new());
    }

    let mut walk = Walk::start(repo, tracked, origin)?;
    let mapping = *walk.map.mapping();
    let mut removed = Vec::new();
    for relation in mapping.children() {
        let previous = tracked.child_dependencies(relation.name);
        if previous.is_empty() {
            continue;
        }
        let current: HashSet<usize> = walk
            .map
            .related(walk.object.as_ref(), relation.name)?
            .iter()
            .map(entity_address)
            .collect();
        for child in previous {
            if current.contains(&entity_address(&child)) || !walk.visit(&child) {
                continue;
            }
            removed.push(walk.dependency(relation, child));
        }
    }

    if !removed.is_empty() {
        tracing::debug!(
            entity = %tracked.describe(),
            removed = removed.len(),
            "Detected removed children"
        );
    }
    Ok(removed)
}

/// Current child sets per relation, to be recorded after a persist.
pub(crate) fn snapshot_children(
    map: &dyn StorageMap,
    object: &EntityRef,
) -> Result<HashMap<&'static str, Vec<EntityRef>>> {
    let mut children = HashMap::new();
    for relation in map.mapping().children() {
        let related = map.related(object.as_ref(), relation.name)?;
        if !related.is_empty() {
            children.insert(relation.name, related);
        }
    }
    Ok(children)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::testing::{Customer, Item, LineItem, Order, customer, order_with_lines};
    use unitwork_core::{entity_ref, same_entity};

    fn repository() -> Repository {
        let repo = Repository::new(Arc::new(MemoryStore::new()));
        repo.register::<Item>().unwrap();
        repo.register::<Customer>().unwrap();
        repo.register::<Order>().unwrap();
        repo.register::<LineItem>().unwrap();
        repo
    }

    #[test]
    fn test_classify_splits_children_and_parents() {
        let repo = repository();
        let (order, lines) = order_with_lines("o", &["a", "b"]);
        let buyer = customer("c");
        order.write().unwrap().customer = Some(buyer.clone());

        let tracked = repo.locate(&entity_ref(&order));
        let relations = classify_relations(&repo, &tracked, None).unwrap();
        assert_eq!(relations.children.len(), 2);
        assert_eq!(relations.parents.len(), 1);
        assert!(same_entity(
            &relations.children[0].entity,
            &entity_ref(&lines[0])
        ));
        assert_eq!(relations.children[1].relation, "lines");
        assert_eq!(relations.parents[0].mode, DependencyMode::Parent);
        assert!(same_entity(&relations.parents[0].entity, &entity_ref(&buyer)));
    }

    #[test]
    fn test_origin_is_skipped() {
        let repo = repository();
        let (order, lines) = order_with_lines("o", &["a"]);
        let line = repo.locate(&entity_ref(&lines[0]));

        let unrestricted = classify_relations(&repo, &line, None).unwrap();
        assert_eq!(unrestricted.parents.len(), 1);

        let from_order = classify_relations(&repo, &line, Some(&entity_ref(&order))).unwrap();
        assert!(from_order.is_empty());
    }

    #[test]
    fn test_duplicate_references_are_reported_once() {
        let repo = repository();
        let (order, lines) = order_with_lines("o", &["a"]);
        order.write().unwrap().lines.push(lines[0].clone());

        let tracked = repo.locate(&entity_ref(&order));
        assert_eq!(current_children(&repo, &tracked, None).unwrap().len(), 1);
    }

    #[test]
    fn test_removed_children_diff_against_recorded_set() {
        let repo = repository();
        let (order, lines) = order_with_lines("o", &["a", "b"]);
        let tracked = repo.locate(&entity_ref(&order));
        assert!(detect_removed_children(&repo, &tracked, None).unwrap().is_empty());

        let map = repo.map_for("orders").unwrap();
        let children = snapshot_children(map.as_ref(), &entity_ref(&order)).unwrap();
        tracked.record_children(children);

        order.write().unwrap().lines.remove(1);
        let removed = detect_removed_children(&repo, &tracked, None).unwrap();
        assert_eq!(removed.len(), 1);
        assert!(same_entity(&removed[0].entity, &entity_ref(&lines[1])));

        let from_origin =
            detect_removed_children(&repo, &tracked, Some(&entity_ref(&lines[1]))).unwrap();
        assert!(from_origin.is_empty());
    }

    #[test]
    fn test_dropped_object_is_an_orphan() {
        let repo = repository();
        let tracked = {
            let (order, _lines) = order_with_lines("o", &[]);
            repo.locate(&entity_ref(&order))
        };
        let err = classify_relations(&repo, &tracked, None).unwrap_err();
        assert!(matches!(err, Error::Orphan { .. }));
    }
}

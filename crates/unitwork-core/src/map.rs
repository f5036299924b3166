//! Storage maps: the bridge between tracked objects and records.

use crate::error::{Error, Result};
use crate::model::{Entity, EntityMapping, EntityRef, Model};
use crate::record::Record;
use crate::value::Value;
use std::marker::PhantomData;
use std::sync::{PoisonError, RwLock};

/// Per-entity-type persistence mapping consumed by the session layer.
pub trait StorageMap: Send + Sync {
    /// Static mapping metadata.
    fn mapping(&self) -> &EntityMapping;

    /// Serialize the entity's current fields into a record.
    fn write_record(&self, entity: &dyn Entity) -> Result<Record>;

    /// Load a record (possibly partial) back into the entity.
    fn load_entity(&self, record: &Record, entity: &dyn Entity) -> Result<()>;

    /// Objects currently referenced by the entity through `relation`.
    fn related(&self, entity: &dyn Entity, relation: &str) -> Result<Vec<EntityRef>>;

    /// Primary key values of a record, or `None` when any key column is unset.
    fn extract_id(&self, record: &Record) -> Option<Vec<Value>> {
        record.key_values(&self.mapping().primary_key())
    }

    /// Called when an entity becomes tracked under this map.
    fn attach(&self, entity: &dyn Entity) -> Result<()> {
        let _ = entity;
        Ok(())
    }

    /// Called when an entity stops being tracked (deleted or detached).
    fn detach(&self, entity: &dyn Entity) {
        let _ = entity;
    }
}

/// [`StorageMap`] for any [`Model`] shared as `ModelRef<M>`.
pub struct ModelMap<M> {
    mapping: EntityMapping,
    _marker: PhantomData<fn() -> M>,
}

impl<M: Model> ModelMap<M> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            mapping: EntityMapping::of::<M>(),
            _marker: PhantomData,
        }
    }

    fn downcast(entity: &dyn Entity) -> Result<&RwLock<M>> {
        entity
            .as_any()
            .downcast_ref::<RwLock<M>>()
            .ok_or(Error::InvalidEntityKind {
                type_name: std::any::type_name::<M>(),
            })
    }
}

impl<M: Model> Default for ModelMap<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Model> std::fmt::Debug for ModelMap<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelMap")
            .field("entity", &self.mapping.name)
            .finish()
    }
}

impl<M: Model> StorageMap for ModelMap<M> {
    fn mapping(&self) -> &EntityMapping {
        &self.mapping
    }

    fn write_record(&self, entity: &dyn Entity) -> Result<Record> {
        let lock = Self::downcast(entity)?;
        let guard = lock.read().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.to_record())
    }

    fn load_entity(&self, record: &Record, entity: &dyn Entity) -> Result<()> {
        let lock = Self::downcast(entity)?;
        tracing::trace!(
            entity = self.mapping.name,
            columns = record.len(),
            "Loading record into entity"
        );
        let mut guard = lock.write().unwrap_or_else(PoisonError::into_inner);
        guard.apply_record(record)
    }

    fn related(&self, entity: &dyn Entity, relation: &str) -> Result<Vec<EntityRef>> {
        if self.mapping.relation(relation).is_none() {
            return Err(Error::mapping(
                self.mapping.name,
                format!("unknown relation '{relation}'"),
            ));
        }
        let lock = Self::downcast(entity)?;
        let guard = lock.read().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.related(relation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::ColumnInfo;
    use crate::model::{entity_ref, model_ref};

    struct Note {
        id: Option<i64>,
        body: String,
    }

    impl Model for Note {
        const ENTITY_NAME: &'static str = "notes";

        fn fields() -> &'static [ColumnInfo] {
            static FIELDS: &[ColumnInfo] = &[
                ColumnInfo::new("id").primary_key(true).generated(true),
                ColumnInfo::new("body"),
            ];
            FIELDS
        }

        fn to_record(&self) -> Record {
            Record::new()
                .with("id", self.id)
                .with("body", self.body.as_str())
        }

        fn apply_record(&mut self, record: &Record) -> Result<()> {
            if let Some(id) = record.get("id").and_then(Value::as_i64) {
                self.id = Some(id);
            }
            if let Some(body) = record.get("body").and_then(Value::as_str) {
                self.body = body.to_string();
            }
            Ok(())
        }
    }

    struct Other;

    impl Model for Other {
        const ENTITY_NAME: &'static str = "others";

        fn fields() -> &'static [ColumnInfo] {
            &[]
        }

        fn to_record(&self) -> Record {
            Record::new()
        }

        fn apply_record(&mut self, _record: &Record) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_and_load_round_trip_through_handle() {
        let map = ModelMap::<Note>::new();
        let note = model_ref(Note {
            id: None,
            body: "draft".into(),
        });
        let entity = entity_ref(&note);

        let record = map.write_record(entity.as_ref()).unwrap();
        assert_eq!(record.get("id"), Some(&Value::Null));
        assert_eq!(map.extract_id(&record), None);

        map.load_entity(&Record::new().with("id", 5_i64), entity.as_ref())
            .unwrap();
        assert_eq!(note.read().unwrap().id, Some(5));
        assert_eq!(note.read().unwrap().body, "draft");

        let record = map.write_record(entity.as_ref()).unwrap();
        assert_eq!(map.extract_id(&record), Some(vec![Value::BigInt(5)]));
    }

    #[test]
    fn wrong_model_type_is_rejected() {
        let map = ModelMap::<Note>::new();
        let other = entity_ref(&model_ref(Other));
        let err = map.write_record(other.as_ref()).unwrap_err();
        assert!(matches!(err, Error::InvalidEntityKind { .. }));
    }

    #[test]
    fn unknown_relation_is_a_mapping_error() {
        let map = ModelMap::<Note>::new();
        let note = entity_ref(&model_ref(Note {
            id: None,
            body: String::new(),
        }));
        assert!(matches!(
            map.related(note.as_ref(), "tags"),
            Err(Error::Mapping(_))
        ));
    }
}

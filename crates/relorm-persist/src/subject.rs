//! Subjects: per-entity unit-of-work records.
//!
//! A [`Subject`] pairs one in-memory entity with its database counterpart
//! and the operation the engine should perform on it. Subjects live in a
//! [`SubjectSet`] arena for the duration of one executor run and reference
//! each other through [`SubjectId`] indices, so a change map can say "set
//! this foreign key to that other subject's eventual id" before the id
//! exists.

use relorm_core::{
    EntityMetadata, EntityRef, ObjectLiteral, PersistenceError, Result, Value, compare_ids,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Index of a subject inside its [`SubjectSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubjectId(pub(crate) usize);

impl SubjectId {
    /// Raw arena index.
    pub fn index(self) -> usize {
        self.0
    }
}

/// The value side of a change map entry.
#[derive(Debug, Clone)]
pub enum ChangeValue {
    /// A plain column value.
    Value(Value),
    /// A related entity whose identifier is readable from its values.
    Entity(EntityRef),
    /// Another subject; resolved once that subject's identifier is known.
    Subject(SubjectId),
    /// Explicit NULL (nullify a join column or clear a relation).
    Null,
}

/// One pending delta on a subject's row.
///
/// Either a column-level change (`column` set) or a relation-level change
/// (`relation` set, resolved through the relation's join columns). The
/// `source_column` is only used for column-level changes whose value comes
/// from another subject.
#[derive(Debug, Clone)]
pub struct ChangeMap {
    /// Database column this change writes, for column-level changes.
    pub column: Option<String>,
    /// Relation name this change writes, for relation-level changes.
    pub relation: Option<String>,
    /// Column to read off the referenced subject, for column-level
    /// changes with a [`ChangeValue::Subject`] value.
    pub source_column: Option<String>,
    /// The new value.
    pub value: ChangeValue,
}

impl ChangeMap {
    /// Column-level change.
    pub fn column(name: impl Into<String>, value: ChangeValue) -> Self {
        Self {
            column: Some(name.into()),
            relation: None,
            source_column: None,
            value,
        }
    }

    /// Relation-level change.
    pub fn relation(name: impl Into<String>, value: ChangeValue) -> Self {
        Self {
            column: None,
            relation: Some(name.into()),
            source_column: None,
            value,
        }
    }

    /// Column-level change deferred to another subject's value.
    pub fn column_from_subject(
        name: impl Into<String>,
        subject: SubjectId,
        source_column: impl Into<String>,
    ) -> Self {
        Self {
            column: Some(name.into()),
            relation: None,
            source_column: Some(source_column.into()),
            value: ChangeValue::Subject(subject),
        }
    }
}

/// A unit-of-work record for one entity.
///
/// Created per entity passed to persist, or synthetically by the relation
/// builders for entities discovered through relations. Consumed and
/// discarded after one executor run.
#[derive(Debug)]
pub struct Subject {
    /// Metadata of the entity type.
    pub metadata: Arc<EntityMetadata>,
    /// The in-memory entity, when one exists (synthetic removal subjects
    /// have none).
    pub entity: Option<EntityRef>,
    /// Snapshot of the row as last loaded from the database.
    pub database_entity: Option<ObjectLiteral>,
    /// Related-entity identifiers as currently stored in the database,
    /// keyed by relation name. Populated by the database loader and
    /// consumed by the relation builders.
    pub database_relations: BTreeMap<String, Vec<ObjectLiteral>>,
    /// Primary-key values, once known.
    pub identifier: Option<ObjectLiteral>,
    /// Subject that caused this one to exist, for cascaded records.
    pub parent_subject: Option<SubjectId>,
    /// The value set actually written by the insert, kept for resolving
    /// later references.
    pub inserted_value_set: Option<ObjectLiteral>,
    /// Values produced during execution (generated keys, seeded special
    /// columns) to be merged back into the live entity afterwards.
    pub generated_map: ObjectLiteral,
    /// Pending deltas still to be written.
    pub change_maps: Vec<ChangeMap>,
    /// The caller allows inserting this entity.
    pub can_be_inserted: bool,
    /// The caller allows updating this entity.
    pub can_be_updated: bool,
    /// This row must be deleted.
    pub must_be_removed: bool,
    /// The caller asked for a soft-remove.
    pub can_be_soft_removed: bool,
    /// The caller asked for a recover.
    pub can_be_recovered: bool,
}

impl Subject {
    /// Create a subject for an entity, deriving the identifier from the
    /// entity's current primary-key values.
    pub fn new(metadata: Arc<EntityMetadata>, entity: Option<EntityRef>) -> Self {
        let identifier = entity.as_ref().and_then(|e| {
            let data = e.lock().expect("entity lock poisoned");
            metadata.entity_id(&data)
        });
        Self {
            metadata,
            entity,
            database_entity: None,
            database_relations: BTreeMap::new(),
            identifier,
            parent_subject: None,
            inserted_value_set: None,
            generated_map: ObjectLiteral::new(),
            change_maps: Vec::new(),
            can_be_inserted: false,
            can_be_updated: false,
            must_be_removed: false,
            can_be_soft_removed: false,
            can_be_recovered: false,
        }
    }

    /// Whether this subject will produce an INSERT.
    pub fn must_be_inserted(&self) -> bool {
        self.can_be_inserted && self.database_entity.is_none() && !self.must_be_removed
    }

    /// Whether this subject will produce an UPDATE.
    ///
    /// Requires a resolved identifier and at least one pending change.
    pub fn must_be_updated(&self) -> bool {
        self.can_be_updated
            && !self.must_be_removed
            && self.identifier.is_some()
            && !self.change_maps.is_empty()
            && !self.must_be_inserted()
    }

    /// Whether this subject will produce a soft-remove UPDATE.
    pub fn must_be_soft_removed(&self) -> bool {
        self.can_be_soft_removed && self.metadata.delete_date_column().is_some()
    }

    /// Whether this subject will produce a recover UPDATE.
    pub fn must_be_recovered(&self) -> bool {
        self.can_be_recovered && self.metadata.delete_date_column().is_some()
    }

    /// Whether this subject produces any operation at all.
    pub fn has_operation(&self) -> bool {
        self.must_be_inserted()
            || self.must_be_updated()
            || self.must_be_removed
            || self.must_be_soft_removed()
            || self.must_be_recovered()
    }

    /// The best currently known value for one of this subject's columns,
    /// looked up across identifier, generated values, the inserted value
    /// set, and the live entity.
    pub fn resolved_value(&self, column: &str) -> Option<Value> {
        if let Some(id) = &self.identifier
            && let Some(v) = id.get(column)
        {
            return Some(v.clone());
        }
        if let Some(v) = self.generated_map.get(column) {
            return Some(v.clone());
        }
        if let Some(set) = &self.inserted_value_set
            && let Some(v) = set.get(column)
            && !matches!(v, Value::Default)
        {
            return Some(v.clone());
        }
        self.entity.as_ref().and_then(|e| {
            let data = e.lock().expect("entity lock poisoned");
            data.get(column).cloned()
        })
    }

    /// Re-derive the identifier from entity values plus generated values.
    pub fn refresh_identifier(&mut self) {
        let mut values = ObjectLiteral::new();
        if let Some(entity) = &self.entity {
            let data = entity.lock().expect("entity lock poisoned");
            values.extend(data.values.clone());
        }
        if let Some(set) = &self.inserted_value_set {
            for (k, v) in set {
                if !matches!(v, Value::Default) {
                    values.insert(k.clone(), v.clone());
                }
            }
        }
        values.extend(self.generated_map.clone());
        if let Some(id) = self.metadata.id_from_values(&values) {
            self.identifier = Some(id);
        }
    }

    /// Identifier or a missing-identifier error for the given operation.
    pub fn require_identifier(&self, operation: &'static str) -> Result<&ObjectLiteral> {
        self.identifier.as_ref().ok_or_else(|| {
            PersistenceError::MissingIdentifier {
                operation,
                table: self.metadata.table_path.clone(),
            }
            .into()
        })
    }
}

/// Arena owning all subjects of one executor run.
///
/// Builders only ever push; subjects are addressed by [`SubjectId`] so
/// cross-references stay valid while the set grows.
#[derive(Debug, Default)]
pub struct SubjectSet {
    subjects: Vec<Subject>,
}

impl SubjectSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subject, returning its id.
    pub fn add(&mut self, subject: Subject) -> SubjectId {
        self.subjects.push(subject);
        SubjectId(self.subjects.len() - 1)
    }

    /// Number of subjects.
    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    /// Borrow a subject.
    pub fn get(&self, id: SubjectId) -> &Subject {
        &self.subjects[id.0]
    }

    /// Mutably borrow a subject.
    pub fn get_mut(&mut self, id: SubjectId) -> &mut Subject {
        &mut self.subjects[id.0]
    }

    /// All ids, in insertion order.
    pub fn ids(&self) -> impl Iterator<Item = SubjectId> {
        (0..self.subjects.len()).map(SubjectId)
    }

    /// All subjects with their ids.
    pub fn iter(&self) -> impl Iterator<Item = (SubjectId, &Subject)> {
        self.subjects
            .iter()
            .enumerate()
            .map(|(i, s)| (SubjectId(i), s))
    }

    /// Find the subject tracking the given entity object (pointer
    /// identity, not value equality).
    pub fn find_by_entity(&self, entity: &EntityRef) -> Option<SubjectId> {
        self.iter()
            .find(|(_, s)| {
                s.entity
                    .as_ref()
                    .is_some_and(|e| Arc::ptr_eq(e, entity))
            })
            .map(|(id, _)| id)
    }

    /// Find a subject of the given entity type by identifier.
    pub fn find_by_identifier(&self, metadata_name: &str, id: &ObjectLiteral) -> Option<SubjectId> {
        self.iter()
            .find(|(_, s)| {
                s.metadata.name == metadata_name
                    && s.identifier.as_ref().is_some_and(|sid| compare_ids(sid, id))
            })
            .map(|(sid, _)| sid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relorm_core::{ColumnMetadata, GenerationStrategy, entity_from_values};

    fn category() -> Arc<EntityMetadata> {
        Arc::new(
            EntityMetadata::new("category", "category")
                .column(
                    ColumnMetadata::new("id")
                        .primary()
                        .generated(GenerationStrategy::Increment),
                )
                .column(ColumnMetadata::new("name")),
        )
    }

    fn entity(pairs: &[(&str, Value)]) -> EntityRef {
        entity_from_values(
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn test_new_subject_derives_identifier() {
        let with_id = Subject::new(category(), Some(entity(&[("id", Value::BigInt(4))])));
        assert!(with_id.identifier.is_some());

        let without_id = Subject::new(category(), Some(entity(&[("name", "a".into())])));
        assert!(without_id.identifier.is_none());
    }

    #[test]
    fn test_must_be_inserted_requires_no_database_entity() {
        let mut subject = Subject::new(category(), Some(entity(&[("name", "a".into())])));
        subject.can_be_inserted = true;
        assert!(subject.must_be_inserted());

        subject.database_entity = Some(ObjectLiteral::new());
        assert!(!subject.must_be_inserted());
    }

    #[test]
    fn test_must_be_updated_requires_identifier_and_changes() {
        let mut subject = Subject::new(category(), Some(entity(&[("id", Value::BigInt(1))])));
        subject.can_be_updated = true;
        subject.database_entity = Some(ObjectLiteral::new());
        assert!(!subject.must_be_updated());

        subject.change_maps.push(ChangeMap::column(
            "name",
            ChangeValue::Value("renamed".into()),
        ));
        assert!(subject.must_be_updated());
    }

    #[test]
    fn test_refresh_identifier_uses_generated_map() {
        let mut subject = Subject::new(category(), Some(entity(&[("name", "a".into())])));
        assert!(subject.identifier.is_none());
        subject.generated_map.insert("id".into(), Value::BigInt(9));
        subject.refresh_identifier();
        assert_eq!(
            subject.identifier.as_ref().and_then(|id| id.get("id")),
            Some(&Value::BigInt(9))
        );
    }

    #[test]
    fn test_require_identifier_error() {
        let subject = Subject::new(category(), Some(entity(&[("name", "a".into())])));
        let err = subject.require_identifier("update").unwrap_err();
        assert!(err.is_persistence_error());
    }

    #[test]
    fn test_find_by_entity_uses_pointer_identity() {
        let mut set = SubjectSet::new();
        let a = entity(&[("id", Value::BigInt(1))]);
        let b = entity(&[("id", Value::BigInt(1))]);
        let id_a = set.add(Subject::new(category(), Some(a.clone())));
        set.add(Subject::new(category(), Some(b)));
        assert_eq!(set.find_by_entity(&a), Some(id_a));
    }

    #[test]
    fn test_find_by_identifier() {
        let mut set = SubjectSet::new();
        let id = set.add(Subject::new(
            category(),
            Some(entity(&[("id", Value::BigInt(7))])),
        ));
        let mut key = ObjectLiteral::new();
        key.insert("id".into(), Value::BigInt(7));
        assert_eq!(set.find_by_identifier("category", &key), Some(id));
        assert_eq!(set.find_by_identifier("post", &key), None);
    }

    #[test]
    fn test_resolved_value_precedence() {
        let mut subject = Subject::new(category(), Some(entity(&[("name", "live".into())])));
        assert_eq!(subject.resolved_value("name"), Some("live".into()));
        subject
            .generated_map
            .insert("name".into(), Value::Text("generated".into()));
        assert_eq!(subject.resolved_value("name"), Some("generated".into()));
    }
}

//! Many-to-many junction reconciliation.
//!
//! A many-to-many relation is persisted as rows of a junction table. The
//! builder compares the owning entity's current related collection with
//! the junction rows the loader found and synthesizes junction-row
//! subjects: inserts for new links, removals for dropped ones. Junction
//! columns referencing not-yet-inserted entities are deferred through
//! subject-valued change maps.

use crate::subject::{ChangeMap, ChangeValue, Subject, SubjectId, SubjectSet};
use relorm_core::{
    MetadataRegistry, ObjectLiteral, RelationMetadata, RelationValue, compare_ids,
};
use std::sync::Arc;
use tracing::debug;

/// Reconciles many-to-many collections into junction-row subjects.
pub struct ManyToManySubjectBuilder;

impl ManyToManySubjectBuilder {
    /// Process every owning many-to-many relation of every subject.
    pub fn build(set: &mut SubjectSet, registry: &MetadataRegistry) {
        for id in set.ids().collect::<Vec<_>>() {
            let subject = set.get(id);
            if subject.entity.is_none() || subject.must_be_removed {
                continue;
            }
            let metadata = Arc::clone(&subject.metadata);
            for relation in &metadata.relations {
                if relation.is_many_to_many_owner()
                    && relation.persistence_enabled
                    && relation.junction.is_some()
                {
                    Self::build_for_relation(set, registry, id, relation);
                }
            }
        }
    }

    fn build_for_relation(
        set: &mut SubjectSet,
        registry: &MetadataRegistry,
        owner: SubjectId,
        relation: &RelationMetadata,
    ) {
        let junction = relation.junction.as_ref().expect("checked by caller");
        let Some(target) = registry.get(&relation.target) else {
            return;
        };

        let subject = set.get(owner);
        let persisted = {
            let entity = subject.entity.as_ref().expect("checked by caller");
            let data = entity.lock().expect("entity lock poisoned");
            match data.relation(&relation.name) {
                None => return,
                Some(RelationValue::Many(list)) => list.clone(),
                Some(RelationValue::One(_)) => return,
            }
        };
        let database_ids = subject
            .database_relations
            .get(&relation.name)
            .cloned()
            .unwrap_or_default();
        let owner_identifier = subject.identifier.clone();

        let mut persisted_ids: Vec<ObjectLiteral> = Vec::new();
        for related in &persisted {
            let related_id = {
                let data = related.lock().expect("entity lock poisoned");
                target.entity_id(&data)
            };
            if let Some(rid) = &related_id {
                persisted_ids.push(rid.clone());
                if database_ids.iter().any(|db| compare_ids(db, rid)) {
                    continue;
                }
            }

            let related_subject = set.find_by_entity(related);
            if related_id.is_none() && related_subject.is_none() {
                // Unsaved related entity with no cascade-created subject:
                // there is no id to link against, skip the row.
                continue;
            }

            let mut link = Subject::new(Arc::clone(&junction.metadata), None);
            link.can_be_inserted = true;
            link.parent_subject = Some(owner);
            for jc in &junction.owner_columns {
                link.change_maps.push(ChangeMap::column_from_subject(
                    jc.name.clone(),
                    owner,
                    jc.referenced_column.clone(),
                ));
            }
            for jc in &junction.inverse_columns {
                match (&related_id, related_subject) {
                    (Some(rid), _) => {
                        if let Some(value) = rid.get(&jc.referenced_column) {
                            link.change_maps.push(ChangeMap::column(
                                jc.name.clone(),
                                ChangeValue::Value(value.clone()),
                            ));
                        }
                    }
                    (None, Some(related_subject)) => {
                        link.change_maps.push(ChangeMap::column_from_subject(
                            jc.name.clone(),
                            related_subject,
                            jc.referenced_column.clone(),
                        ));
                    }
                    (None, None) => unreachable!("filtered above"),
                }
            }
            debug!(junction = %junction.metadata.table_path, "new junction row");
            set.add(link);
        }

        for db_id in &database_ids {
            if persisted_ids.iter().any(|pid| compare_ids(pid, db_id)) {
                continue;
            }
            let mut identifier = ObjectLiteral::new();
            if let Some(owner_id) = &owner_identifier {
                for jc in &junction.owner_columns {
                    if let Some(value) = owner_id.get(&jc.referenced_column) {
                        identifier.insert(jc.name.clone(), value.clone());
                    }
                }
            }
            for jc in &junction.inverse_columns {
                if let Some(value) = db_id.get(&jc.referenced_column) {
                    identifier.insert(jc.name.clone(), value.clone());
                }
            }
            let mut removal = Subject::new(Arc::clone(&junction.metadata), None);
            removal.identifier = Some(identifier);
            removal.must_be_removed = true;
            removal.parent_subject = Some(owner);
            debug!(junction = %junction.metadata.table_path, "dropped junction row");
            set.add(removal);
        }
    }
}

//! One-to-many relation reconciliation.
//!
//! For each subject's one-to-many relation, compare the entity's current
//! related collection against the related ids the database loader found.
//! Newly referenced rows get a change map pointing their foreign key at
//! us; rows that disappeared from the collection are orphans, handled per
//! the relation's orphaned-row action.

use crate::subject::{ChangeMap, ChangeValue, Subject, SubjectId, SubjectSet};
use relorm_core::{
    EntityMetadata, MetadataRegistry, ObjectLiteral, OrphanedRowAction, RelationMetadata,
    RelationValue, compare_ids, format_id,
};
use std::sync::Arc;
use tracing::debug;

/// Reconciles one-to-many collections into subject operations.
pub struct OneToManySubjectBuilder;

impl OneToManySubjectBuilder {
    /// Process every one-to-many relation of every subject in the set.
    pub fn build(set: &mut SubjectSet, registry: &MetadataRegistry) {
        for id in set.ids().collect::<Vec<_>>() {
            let subject = set.get(id);
            if subject.entity.is_none() || subject.must_be_removed {
                continue;
            }
            let metadata = Arc::clone(&subject.metadata);
            for relation in &metadata.relations {
                if relation.is_one_to_many() && relation.persistence_enabled {
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
        let Some(target) = registry.get(&relation.target) else {
            return;
        };
        let Some(inverse_name) = relation.inverse_relation.clone() else {
            return;
        };
        let orphan_action = target
            .find_relation(&inverse_name)
            .map_or(relation.orphaned_row_action, |r| r.orphaned_row_action);

        let subject = set.get(owner);
        let persisted = {
            let entity = subject.entity.as_ref().expect("checked above");
            let data = entity.lock().expect("entity lock poisoned");
            match data.relation(&relation.name) {
                // The collection was not set on the entity at all: nothing
                // to reconcile, leave database state untouched.
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

        let mut persisted_ids: Vec<ObjectLiteral> = Vec::new();
        for related in &persisted {
            let related_id = {
                let data = related.lock().expect("entity lock poisoned");
                target.entity_id(&data)
            };
            if let Some(rid) = &related_id {
                persisted_ids.push(rid.clone());
                if database_ids.iter().any(|db| compare_ids(db, rid)) {
                    // Already linked: no operation at all.
                    continue;
                }
            }
            let child = match set.find_by_entity(related) {
                Some(child) => child,
                None => {
                    let mut subject = Subject::new(Arc::clone(&target), Some(related.clone()));
                    subject.parent_subject = Some(owner);
                    subject.can_be_updated = true;
                    set.add(subject)
                }
            };
            set.get_mut(child).change_maps.push(ChangeMap::relation(
                inverse_name.clone(),
                ChangeValue::Subject(owner),
            ));
        }

        for db_id in &database_ids {
            if persisted_ids.iter().any(|pid| compare_ids(pid, db_id)) {
                continue;
            }
            debug!(
                entity = %target.name,
                id = %format_id(db_id),
                action = ?orphan_action,
                "orphaned one-to-many row"
            );
            let orphan = orphan_subject(
                Arc::clone(&target),
                db_id.clone(),
                orphan_action,
                &inverse_name,
            );
            set.add(orphan);
        }
    }
}

/// Synthesize a subject for a row removed from its parent collection.
pub(crate) fn orphan_subject(
    target: Arc<EntityMetadata>,
    id: ObjectLiteral,
    action: OrphanedRowAction,
    inverse_name: &str,
) -> Subject {
    let mut subject = Subject::new(target, None);
    subject.identifier = Some(id);
    match action {
        OrphanedRowAction::Delete => subject.must_be_removed = true,
        OrphanedRowAction::Nullify => {
            subject.can_be_updated = true;
            subject
                .change_maps
                .push(ChangeMap::relation(inverse_name, ChangeValue::Null));
        }
    }
    subject
}

//! One-to-one inverse-side reconciliation.
//!
//! The inverse side of a one-to-one holds no join columns, so changing it
//! means updating the owning side's row. This mirrors the one-to-many
//! builder for the single-valued shape: a newly referenced owner gets a
//! change map pointing its foreign key at us, a dereferenced owner is an
//! orphan.

use crate::builders::one_to_many::orphan_subject;
use crate::subject::{ChangeMap, ChangeValue, Subject, SubjectId, SubjectSet};
use relorm_core::{MetadataRegistry, RelationMetadata, RelationValue, compare_ids};
use std::sync::Arc;

/// Reconciles inverse one-to-one sides into subject operations.
pub struct OneToOneInverseSideSubjectBuilder;

impl OneToOneInverseSideSubjectBuilder {
    /// Process every inverse one-to-one relation of every subject.
    pub fn build(set: &mut SubjectSet, registry: &MetadataRegistry) {
        for id in set.ids().collect::<Vec<_>>() {
            let subject = set.get(id);
            if subject.entity.is_none() || subject.must_be_removed {
                continue;
            }
            let metadata = Arc::clone(&subject.metadata);
            for relation in &metadata.relations {
                if relation.is_one_to_one_inverse() && relation.persistence_enabled {
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
                None => return,
                Some(RelationValue::One(value)) => value.clone(),
                Some(RelationValue::Many(_)) => return,
            }
        };
        let database_id = subject
            .database_relations
            .get(&relation.name)
            .and_then(|ids| ids.first().cloned());

        let persisted_id = persisted.as_ref().and_then(|related| {
            let data = related.lock().expect("entity lock poisoned");
            target.entity_id(&data)
        });

        if let Some(related) = &persisted {
            let already_linked = match (&persisted_id, &database_id) {
                (Some(pid), Some(db)) => compare_ids(pid, db),
                _ => false,
            };
            if !already_linked {
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
        }

        if let Some(db_id) = database_id {
            let still_linked = persisted_id
                .as_ref()
                .is_some_and(|pid| compare_ids(pid, &db_id));
            if !still_linked {
                let orphan = orphan_subject(target, db_id, orphan_action, &inverse_name);
                set.add(orphan);
            }
        }
    }
}

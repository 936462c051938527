//! Cascade expansion.
//!
//! Walks every subject's relations and pulls referenced entities into the
//! subject set according to the relation's cascade flags, so entities the
//! caller never mentioned still get persisted (or removed) with the graph.
//! Also records the foreign-key change maps for owning relations, since
//! join-column values live on relation values rather than entity columns.

use crate::subject::{ChangeMap, ChangeValue, Subject, SubjectSet};
use relorm_core::{MetadataRegistry, RelationValue};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::trace;

/// Expands the subject set along configured cascades.
pub struct CascadesSubjectBuilder;

impl CascadesSubjectBuilder {
    /// Walk all subjects (including ones created during the walk) and
    /// expand their relations.
    pub fn build(set: &mut SubjectSet, registry: &MetadataRegistry) {
        let mut queue: VecDeque<_> = set.ids().collect();
        let mut processed = HashSet::new();

        while let Some(id) = queue.pop_front() {
            if !processed.insert(id) {
                continue;
            }
            let subject = set.get(id);
            let Some(entity) = subject.entity.clone() else {
                continue;
            };
            let metadata = Arc::clone(&subject.metadata);
            let removing = subject.must_be_removed;

            for relation in &metadata.relations {
                if !relation.persistence_enabled {
                    continue;
                }
                let value = {
                    let data = entity.lock().expect("entity lock poisoned");
                    data.relation(&relation.name).cloned()
                };
                let Some(value) = value else {
                    continue;
                };

                // Owning relations carry their join columns on this row;
                // record where the values will come from.
                if relation.owns_join_columns() && !removing {
                    match &value {
                        RelationValue::One(Some(related)) => {
                            let change = match set.find_by_entity(related) {
                                Some(related_subject) => {
                                    ChangeValue::Subject(related_subject)
                                }
                                None => ChangeValue::Entity(related.clone()),
                            };
                            set.get_mut(id)
                                .change_maps
                                .push(ChangeMap::relation(relation.name.clone(), change));
                        }
                        RelationValue::One(None) => {
                            set.get_mut(id).change_maps.push(ChangeMap::relation(
                                relation.name.clone(),
                                ChangeValue::Null,
                            ));
                        }
                        RelationValue::Many(_) => {}
                    }
                }

                for related in value.entities() {
                    if set.find_by_entity(&related).is_some() {
                        continue;
                    }
                    let Some(target) = registry.get(&relation.target) else {
                        continue;
                    };
                    let has_id = {
                        let data = related.lock().expect("entity lock poisoned");
                        target.entity_id(&data).is_some()
                    };

                    let mut child = Subject::new(Arc::clone(&target), Some(related));
                    child.parent_subject = Some(id);
                    if removing {
                        if !relation.cascade_remove {
                            continue;
                        }
                        child.must_be_removed = true;
                    } else if has_id {
                        if !relation.cascade_update {
                            continue;
                        }
                        child.can_be_updated = true;
                    } else {
                        if !relation.cascade_insert {
                            continue;
                        }
                        child.can_be_inserted = true;
                    }
                    trace!(
                        entity = %target.name,
                        relation = %relation.name,
                        removing,
                        "cascaded subject"
                    );
                    let child_id = set.add(child);
                    queue.push_back(child_id);
                }
            }
        }
    }
}

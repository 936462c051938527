//! Changed-columns computation.
//!
//! For every update candidate (a subject carrying both a live entity and a
//! database snapshot), compute the column-level diff and append the
//! resulting column change maps. Runs once before the insert/update/delete
//! split and again after listeners ran, because listeners may have mutated
//! entities.

use crate::subject::{ChangeMap, ChangeValue, SubjectSet};
use relorm_core::{ColumnMetadata, Value};
use tracing::trace;

/// Computes column-level diffs between entity and database state.
pub struct ChangedColumnsComputer;

impl ChangedColumnsComputer {
    /// Diff all update candidates in the set, appending column change maps.
    pub fn compute(set: &mut SubjectSet) {
        for id in set.ids().collect::<Vec<_>>() {
            let subject = set.get(id);
            let (Some(entity), Some(database)) = (&subject.entity, &subject.database_entity)
            else {
                continue;
            };

            let mut changes = Vec::new();
            {
                let data = entity.lock().expect("entity lock poisoned");
                for column in &subject.metadata.columns {
                    if column.is_primary || column.is_generated || column.is_special() {
                        continue;
                    }
                    let Some(raw) = data.get(&column.database_name) else {
                        continue;
                    };
                    let current = apply_to_transform(column, raw);
                    let changed = match database.get(&column.database_name) {
                        Some(stored) => !current.loosely_equals(stored),
                        None => !current.is_null(),
                    };
                    if changed {
                        trace!(
                            entity = %subject.metadata.name,
                            column = %column.database_name,
                            "column changed"
                        );
                        changes.push(ChangeMap::column(
                            column.database_name.clone(),
                            if current.is_null() {
                                ChangeValue::Null
                            } else {
                                ChangeValue::Value(current)
                            },
                        ));
                    }
                }
            }

            let subject = set.get_mut(id);
            subject.change_maps.extend(changes);
        }
    }

    /// Drop previously computed column change maps and diff again.
    ///
    /// Relation-level change maps are preserved: they were synthesized by
    /// the builders and are not derivable from a column diff.
    pub fn recompute(set: &mut SubjectSet) {
        for id in set.ids().collect::<Vec<_>>() {
            let subject = set.get_mut(id);
            if subject.entity.is_some() && subject.database_entity.is_some() {
                subject.change_maps.retain(|cm| cm.column.is_none());
            }
        }
        Self::compute(set);
    }
}

/// Application-to-database transform for one column value.
pub(crate) fn apply_to_transform(column: &ColumnMetadata, value: &Value) -> Value {
    match &column.transformer {
        Some(t) => (t.to)(value),
        None => value.clone(),
    }
}

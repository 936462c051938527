//! Subject database loader.
//!
//! Before the engine can diff anything it has to know what the database
//! currently holds. The loader fetches row snapshots for every subject
//! that may be updated or removed, and the currently stored related-row
//! identifiers for every relation the reconciling builders care about.

use crate::subject::{SubjectId, SubjectSet};
use relorm_core::{
    Cx, EntityMetadata, Error, MetadataRegistry, ObjectLiteral, Outcome, QueryRunner, Value,
    compare_ids, quote_ident,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Loads database state for subjects needing comparison.
pub struct SubjectDatabaseLoader<'a, R: QueryRunner> {
    runner: &'a R,
    registry: &'a MetadataRegistry,
}

impl<'a, R: QueryRunner> SubjectDatabaseLoader<'a, R> {
    /// Create a loader over the given runner and metadata registry.
    pub fn new(runner: &'a R, registry: &'a MetadataRegistry) -> Self {
        Self { runner, registry }
    }

    /// Load row snapshots and relation ids into the subject set.
    #[tracing::instrument(skip_all, fields(subjects = set.len()))]
    pub async fn load(&self, cx: &Cx, set: &mut SubjectSet) -> Outcome<(), Error> {
        match self.load_snapshots(cx, set).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(c) => return Outcome::Cancelled(c),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        self.load_relation_ids(cx, set).await
    }

    /// Fetch current rows for update/remove candidates and attach them as
    /// `database_entity` snapshots.
    async fn load_snapshots(&self, cx: &Cx, set: &mut SubjectSet) -> Outcome<(), Error> {
        let mut groups: HashMap<String, Vec<(SubjectId, ObjectLiteral)>> = HashMap::new();
        for (id, subject) in set.iter() {
            let comparable = subject.can_be_updated
                || subject.must_be_removed
                || subject.can_be_soft_removed
                || subject.can_be_recovered;
            if !comparable || subject.database_entity.is_some() {
                continue;
            }
            if let Some(identifier) = &subject.identifier {
                groups
                    .entry(subject.metadata.name.clone())
                    .or_default()
                    .push((id, identifier.clone()));
            }
        }

        for (name, members) in groups {
            let Some(metadata) = self.registry.get(&name) else {
                continue;
            };
            let columns: Vec<String> = metadata
                .columns
                .iter()
                .map(|c| c.database_name.clone())
                .collect();
            let conditions: Vec<ObjectLiteral> =
                members.iter().map(|(_, id)| id.clone()).collect();
            let (sql, params) = build_select(&metadata.table_path, &columns, &conditions);
            debug!(entity = %name, rows = members.len(), "loading database snapshots");

            let rows = match self.runner.query(cx, &sql, &params).await {
                Outcome::Ok(rows) => rows,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(c) => return Outcome::Cancelled(c),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };

            for row in rows {
                let snapshot = row.to_object_literal();
                let Some(row_id) = metadata.id_from_values(&snapshot) else {
                    continue;
                };
                for (subject_id, identifier) in &members {
                    if compare_ids(identifier, &row_id) {
                        set.get_mut(*subject_id).database_entity = Some(snapshot.clone());
                        break;
                    }
                }
            }
        }
        Outcome::Ok(())
    }

    /// Fetch related-row identifiers as currently stored, per relation,
    /// for subjects that have a database snapshot.
    async fn load_relation_ids(&self, cx: &Cx, set: &mut SubjectSet) -> Outcome<(), Error> {
        for id in set.ids().collect::<Vec<_>>() {
            let subject = set.get(id);
            if subject.entity.is_none() || subject.database_entity.is_none() {
                continue;
            }
            let Some(identifier) = subject.identifier.clone() else {
                continue;
            };
            let metadata = Arc::clone(&subject.metadata);

            for relation in &metadata.relations {
                if !relation.persistence_enabled {
                    continue;
                }
                let loaded = if relation.is_one_to_many() || relation.is_one_to_one_inverse() {
                    let inverse = self.relation_inverse(relation);
                    match self.load_inverse_ids(cx, inverse, &identifier).await {
                        Outcome::Ok(ids) => ids,
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(c) => return Outcome::Cancelled(c),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    }
                } else if relation.is_many_to_many_owner() {
                    match self.load_junction_ids(cx, relation, &identifier).await {
                        Outcome::Ok(ids) => ids,
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(c) => return Outcome::Cancelled(c),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    }
                } else {
                    continue;
                };
                if let Some(ids) = loaded {
                    set.get_mut(id)
                        .database_relations
                        .insert(relation.name.clone(), ids);
                }
            }
        }
        Outcome::Ok(())
    }

    /// Ids of rows on the inverse side holding a foreign key to us.
    async fn load_inverse_ids(
        &self,
        cx: &Cx,
        inverse: Option<InverseSide>,
        identifier: &ObjectLiteral,
    ) -> Outcome<Option<Vec<ObjectLiteral>>, Error> {
        let Some(inverse) = inverse else {
            return Outcome::Ok(None);
        };
        let mut condition = ObjectLiteral::new();
        for (fk_column, referenced) in &inverse.join {
            let Some(value) = identifier.get(referenced) else {
                return Outcome::Ok(None);
            };
            condition.insert(fk_column.clone(), value.clone());
        }
        let pk_columns: Vec<String> = inverse
            .metadata
            .primary_columns()
            .map(|c| c.database_name.clone())
            .collect();
        let (sql, params) = build_select(&inverse.metadata.table_path, &pk_columns, &[condition]);
        let rows = match self.runner.query(cx, &sql, &params).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(c) => return Outcome::Cancelled(c),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        Outcome::Ok(Some(
            rows.iter().map(relorm_core::Row::to_object_literal).collect(),
        ))
    }

    /// Ids of related rows linked through a junction table.
    async fn load_junction_ids(
        &self,
        cx: &Cx,
        relation: &relorm_core::RelationMetadata,
        identifier: &ObjectLiteral,
    ) -> Outcome<Option<Vec<ObjectLiteral>>, Error> {
        let Some(junction) = &relation.junction else {
            return Outcome::Ok(None);
        };
        let mut condition = ObjectLiteral::new();
        for jc in &junction.owner_columns {
            let Some(value) = identifier.get(&jc.referenced_column) else {
                return Outcome::Ok(None);
            };
            condition.insert(jc.name.clone(), value.clone());
        }
        let columns: Vec<String> = junction
            .inverse_columns
            .iter()
            .map(|jc| jc.name.clone())
            .collect();
        let (sql, params) =
            build_select(&junction.metadata.table_path, &columns, &[condition]);
        let rows = match self.runner.query(cx, &sql, &params).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(c) => return Outcome::Cancelled(c),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let ids = rows
            .iter()
            .map(|row| {
                junction
                    .inverse_columns
                    .iter()
                    .filter_map(|jc| {
                        row.get_by_name(&jc.name)
                            .map(|v| (jc.referenced_column.clone(), v.clone()))
                    })
                    .collect::<ObjectLiteral>()
            })
            .collect();
        Outcome::Ok(Some(ids))
    }
}

impl<R: QueryRunner> SubjectDatabaseLoader<'_, R> {
    /// Resolve the owning side of a collection/inverse relation: the
    /// target metadata and its foreign-key columns pointing back at us.
    fn relation_inverse(&self, relation: &relorm_core::RelationMetadata) -> Option<InverseSide> {
        let target = self.registry.get(&relation.target)?;
        let inverse_name = relation.inverse_relation.as_deref()?;
        let inverse = target.find_relation(inverse_name)?;
        let join = inverse
            .join_columns
            .iter()
            .map(|jc| (jc.name.clone(), jc.referenced_column.clone()))
            .collect();
        Some(InverseSide {
            metadata: target,
            join,
        })
    }
}

/// The inverse side of a relation: target metadata plus the foreign-key
/// column pairing (fk column on target, referenced column on us).
struct InverseSide {
    metadata: Arc<EntityMetadata>,
    join: Vec<(String, String)>,
}

/// Build a `SELECT columns FROM table WHERE ...` for a batch of
/// identifier conditions. Single-column conditions collapse into one
/// `IN (..)`; composite conditions become OR-ed AND groups.
pub(crate) fn build_select(
    table: &str,
    columns: &[String],
    conditions: &[ObjectLiteral],
) -> (String, Vec<Value>) {
    let column_list: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let mut sql = format!("SELECT {} FROM {}", column_list.join(", "), quote_ident(table));
    let mut params: Vec<Value> = Vec::new();

    if conditions.is_empty() {
        return (sql, params);
    }

    let single_key = conditions.iter().all(|c| c.len() == 1);
    if single_key && conditions.len() > 1 {
        let key = conditions[0].keys().next().cloned().unwrap_or_default();
        for condition in conditions {
            if let Some(value) = condition.values().next() {
                params.push(value.clone());
            }
        }
        let placeholders: Vec<String> = (1..=params.len()).map(|i| format!("${i}")).collect();
        sql.push_str(&format!(
            " WHERE {} IN ({})",
            quote_ident(&key),
            placeholders.join(", ")
        ));
        return (sql, params);
    }

    let mut groups = Vec::with_capacity(conditions.len());
    for condition in conditions {
        let mut clauses = Vec::with_capacity(condition.len());
        for (column, value) in condition {
            if value.is_null() {
                clauses.push(format!("{} IS NULL", quote_ident(column)));
            } else {
                params.push(value.clone());
                clauses.push(format!("{} = ${}", quote_ident(column), params.len()));
            }
        }
        groups.push(format!("({})", clauses.join(" AND ")));
    }
    sql.push_str(&format!(" WHERE {}", groups.join(" OR ")));
    (sql, params)
}

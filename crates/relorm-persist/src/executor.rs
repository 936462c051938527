//! Subject executor.
//!
//! Turns a prepared subject set into ordered SQL on one runner. Phases:
//! validation, before-listeners, inserts in dependency order, deferred
//! foreign-key fix-ups and updates, removals in reverse order, soft
//! removals, recoveries, then generated-value propagation back into the
//! live entities and after-listeners.
//!
//! Inserts are grouped into multi-row statements when the driver can
//! return generated values for the whole batch (or none are needed, as
//! for junction rows). Tree entities are never grouped: their bookkeeping
//! brackets the row write.

use crate::broadcaster::{Broadcaster, ListenerEvent};
use crate::diff::{ChangedColumnsComputer, apply_to_transform};
use crate::loader::build_select;
use crate::subject::{ChangeMap, ChangeValue, SubjectId, SubjectSet};
use crate::topology::DependencyGraph;
use crate::tree::{
    ClosureTreeExecutor, MaterializedPathTreeExecutor, NestedSetTreeExecutor, parent_fk_column,
    single_primary_column,
};
use relorm_core::{
    Cx, DeleteStatement, EntityMetadata, Error, GenerationStrategy, InsertStatement,
    MetadataRegistry, ObjectLiteral, Outcome, PersistenceError, QueryRunner, Result, TreeType,
    UpdateStatement, Value,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Knobs for one executor run.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorOptions {
    /// Whether entity listeners are invoked around the run.
    pub listeners: bool,
    /// Whether generated columns are fetched back with a follow-up SELECT
    /// on drivers without RETURNING support.
    pub reload: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            listeners: true,
            reload: true,
        }
    }
}

/// Executes all operations implied by a subject set.
pub struct SubjectExecutor<'a, R: QueryRunner> {
    runner: &'a R,
    registry: &'a MetadataRegistry,
    broadcaster: &'a Broadcaster,
    options: ExecutorOptions,
}

impl<'a, R: QueryRunner> SubjectExecutor<'a, R> {
    /// Create an executor over the given runner, registry, and listeners.
    pub fn new(
        runner: &'a R,
        registry: &'a MetadataRegistry,
        broadcaster: &'a Broadcaster,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            runner,
            registry,
            broadcaster,
            options,
        }
    }

    /// Whether any subject in the set produces an operation.
    pub fn has_executable_operations(set: &SubjectSet) -> bool {
        set.iter().any(|(_, s)| s.has_operation())
    }

    /// Run all phases against the runner.
    #[tracing::instrument(skip_all, fields(subjects = set.len()))]
    pub async fn execute(&self, cx: &Cx, set: &mut SubjectSet) -> Outcome<(), Error> {
        let started = std::time::Instant::now();
        if let Err(e) = Self::validate(set) {
            return Outcome::Err(e);
        }
        if self.options.listeners {
            let ran = self.broadcast(set, true);
            if ran > 0 {
                // Listeners may have mutated entities.
                ChangedColumnsComputer::recompute(set);
            }
        }

        let graph = DependencyGraph::for_subjects(set, self.registry);

        let insert_ids: Vec<SubjectId> = set
            .iter()
            .filter(|(_, s)| s.must_be_inserted())
            .map(|(id, _)| id)
            .collect();
        let insert_ids = graph.insert_order(insert_ids, set);
        match self.execute_inserts(cx, set, &insert_ids).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(c) => return Outcome::Cancelled(c),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        // Ordinary updates, plus fix-ups for inserted rows whose foreign
        // keys were not resolvable at insert time.
        let update_ids: Vec<SubjectId> = set
            .iter()
            .filter(|(_, s)| {
                s.must_be_updated()
                    || (s.must_be_inserted()
                        && !s.change_maps.is_empty()
                        && s.identifier.is_some())
            })
            .map(|(id, _)| id)
            .collect();
        match self.execute_updates(cx, set, &update_ids).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(c) => return Outcome::Cancelled(c),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        let remove_ids: Vec<SubjectId> = set
            .iter()
            .filter(|(_, s)| s.must_be_removed)
            .map(|(id, _)| id)
            .collect();
        let remove_ids = graph.delete_order(remove_ids, set);
        match self.execute_removals(cx, set, &remove_ids).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(c) => return Outcome::Cancelled(c),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        let soft_ids: Vec<SubjectId> = set
            .iter()
            .filter(|(_, s)| s.must_be_soft_removed() && !s.must_be_removed)
            .map(|(id, _)| id)
            .collect();
        match self.execute_soft_removals(cx, set, &soft_ids, false).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(c) => return Outcome::Cancelled(c),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        let recover_ids: Vec<SubjectId> = set
            .iter()
            .filter(|(_, s)| s.must_be_recovered() && !s.must_be_removed)
            .map(|(id, _)| id)
            .collect();
        match self.execute_soft_removals(cx, set, &recover_ids, true).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(c) => return Outcome::Cancelled(c),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        Self::propagate(set);
        if self.options.listeners {
            self.broadcast(set, false);
        }
        info!(
            inserted = insert_ids.len(),
            updated = update_ids.len(),
            removed = remove_ids.len(),
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "subject set executed"
        );
        Outcome::Ok(())
    }

    /// Reject contradictory subjects before any I/O.
    fn validate(set: &SubjectSet) -> Result<()> {
        for (_, subject) in set.iter() {
            if subject.must_be_removed
                && subject.can_be_updated
                && subject.identifier.is_some()
                && !subject.change_maps.is_empty()
            {
                return Err(PersistenceError::UpdateAndRemoveConflict {
                    entity: subject.metadata.name.clone(),
                }
                .into());
            }
        }
        Ok(())
    }

    fn broadcast(&self, set: &SubjectSet, before: bool) -> usize {
        let mut ran = 0;
        for (_, subject) in set.iter() {
            let Some(entity) = &subject.entity else {
                continue;
            };
            let event = if subject.must_be_inserted() {
                if before {
                    ListenerEvent::BeforeInsert
                } else {
                    ListenerEvent::AfterInsert
                }
            } else if subject.must_be_removed {
                if before {
                    ListenerEvent::BeforeRemove
                } else {
                    ListenerEvent::AfterRemove
                }
            } else if subject.must_be_soft_removed() {
                if before {
                    ListenerEvent::BeforeSoftRemove
                } else {
                    ListenerEvent::AfterSoftRemove
                }
            } else if subject.must_be_recovered() {
                if before {
                    ListenerEvent::BeforeRecover
                } else {
                    ListenerEvent::AfterRecover
                }
            } else if subject.must_be_updated() {
                if before {
                    ListenerEvent::BeforeUpdate
                } else {
                    ListenerEvent::AfterUpdate
                }
            } else {
                continue;
            };
            ran += self.broadcaster.broadcast(&subject.metadata.name, event, entity);
        }
        ran
    }

    // ---- insert phase ----

    async fn execute_inserts(
        &self,
        cx: &Cx,
        set: &mut SubjectSet,
        ids: &[SubjectId],
    ) -> Outcome<(), Error> {
        let caps = self.runner.capabilities();

        // Consecutive subjects of one type form a multi-row insert when
        // generated values can come back for the whole batch (RETURNING)
        // or are not needed at all (junction rows).
        let groupable = |m: &EntityMetadata| {
            caps.bulk_insert_supported
                && !m.has_tree()
                && (caps.returning_sql_supported || m.is_junction)
        };
        let mut groups: Vec<(Arc<EntityMetadata>, Vec<SubjectId>)> = Vec::new();
        for &id in ids {
            let metadata = Arc::clone(&set.get(id).metadata);
            match groups.last_mut() {
                Some((m, members)) if m.name == metadata.name && groupable(m) => {
                    members.push(id);
                }
                _ => groups.push((metadata, vec![id])),
            }
        }

        for (metadata, members) in groups {
            // Value sets are built at execution time so earlier inserts
            // of this run are already resolvable.
            let mut parents: Vec<Option<Value>> = Vec::with_capacity(members.len());
            for &id in &members {
                let parent = if metadata.has_tree() {
                    match self.tree_parent_of(set, id) {
                        Ok(p) => p,
                        Err(e) => return Outcome::Err(e),
                    }
                } else {
                    None
                };
                let mut values = match self.build_insert_value_set(set, id) {
                    Ok(v) => v,
                    Err(e) => return Outcome::Err(e),
                };

                // Nested-set bookkeeping opens the gap before the row
                // exists and hands the bounds to the insert itself.
                if let Some(tree) = &metadata.tree
                    && tree.tree_type == TreeType::NestedSet
                {
                    let executor = match NestedSetTreeExecutor::new(self.runner, &metadata) {
                        Ok(e) => e,
                        Err(e) => return Outcome::Err(e),
                    };
                    let bounds = match executor.insert(cx, parent.as_ref()).await {
                        Outcome::Ok(b) => b,
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(c) => return Outcome::Cancelled(c),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    };
                    let (Some(left), Some(right)) = (
                        tree.left_column.clone(),
                        tree.right_column.clone(),
                    ) else {
                        return Outcome::Err(Error::Custom(format!(
                            "nested-set entity \"{}\" is missing its bound columns",
                            metadata.table_path
                        )));
                    };
                    values.insert(left.clone(), Value::BigInt(bounds.left));
                    values.insert(right.clone(), Value::BigInt(bounds.right));
                    let subject = set.get_mut(id);
                    subject.generated_map.insert(left, Value::BigInt(bounds.left));
                    subject
                        .generated_map
                        .insert(right, Value::BigInt(bounds.right));
                }

                set.get_mut(id).inserted_value_set = Some(values);
                parents.push(parent);
            }

            match self.run_insert_group(cx, set, &metadata, &members).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(c) => return Outcome::Cancelled(c),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }

            for &id in &members {
                set.get_mut(id).refresh_identifier();
            }

            match self
                .finish_tree_inserts(cx, set, &metadata, &members, &parents)
                .await
            {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(c) => return Outcome::Cancelled(c),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(())
    }

    /// Execute the grouped INSERT and collect generated values.
    async fn run_insert_group(
        &self,
        cx: &Cx,
        set: &mut SubjectSet,
        metadata: &Arc<EntityMetadata>,
        members: &[SubjectId],
    ) -> Outcome<(), Error> {
        let caps = self.runner.capabilities();

        let mut columns: BTreeSet<String> = BTreeSet::new();
        for &id in members {
            if let Some(values) = &set.get(id).inserted_value_set {
                columns.extend(values.keys().cloned());
            }
        }
        let columns: Vec<String> = columns.into_iter().collect();

        let generated: Vec<String> = metadata
            .generated_columns()
            .map(|c| c.database_name.clone())
            .collect();
        let returning = if caps.returning_sql_supported && !generated.is_empty() {
            generated.clone()
        } else {
            Vec::new()
        };

        let mut statement = InsertStatement::new(&metadata.table_path)
            .columns(columns)
            .returning(returning.clone());
        for &id in members {
            let values = set.get(id).inserted_value_set.clone().unwrap_or_default();
            statement = statement.row_from(&values);
        }
        let (sql, params) = statement.build();
        debug!(entity = %metadata.name, rows = members.len(), "insert");

        if returning.is_empty() {
            let increment_pk = metadata
                .primary_columns()
                .find(|c| {
                    c.is_generated
                        && c.generation_strategy == Some(GenerationStrategy::Increment)
                })
                .map(|c| c.database_name.clone());
            if members.len() == 1 && increment_pk.is_some() {
                let last_id = match self.runner.insert(cx, &sql, &params).await {
                    Outcome::Ok(id) => id,
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(c) => return Outcome::Cancelled(c),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                };
                if let Some(pk) = increment_pk {
                    set.get_mut(members[0])
                        .generated_map
                        .insert(pk, Value::BigInt(last_id));
                }
            } else {
                match self.runner.execute(cx, &sql, &params).await {
                    Outcome::Ok(_) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(c) => return Outcome::Cancelled(c),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
            if !self.options.reload {
                return Outcome::Ok(());
            }
            return self.reload_generated(cx, set, metadata, members).await;
        }

        let rows = match self.runner.query(cx, &sql, &params).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(c) => return Outcome::Cancelled(c),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        for (&id, row) in members.iter().zip(rows.iter()) {
            set.get_mut(id)
                .generated_map
                .extend(row.to_object_literal());
        }
        Outcome::Ok(())
    }

    /// Fetch generated columns that are still unknown after the insert.
    async fn reload_generated(
        &self,
        cx: &Cx,
        set: &mut SubjectSet,
        metadata: &Arc<EntityMetadata>,
        members: &[SubjectId],
    ) -> Outcome<(), Error> {
        let generated: Vec<String> = metadata
            .generated_columns()
            .map(|c| c.database_name.clone())
            .collect();
        if generated.is_empty() {
            return Outcome::Ok(());
        }
        for &id in members {
            set.get_mut(id).refresh_identifier();
            let subject = set.get(id);
            let missing = generated
                .iter()
                .any(|c| subject.resolved_value(c).is_none());
            let Some(identifier) = subject.identifier.clone() else {
                continue;
            };
            if !missing {
                continue;
            }
            let (sql, params) =
                build_select(&metadata.table_path, &generated, &[identifier]);
            let row = match self.runner.query_one(cx, &sql, &params).await {
                Outcome::Ok(row) => row,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(c) => return Outcome::Cancelled(c),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            if let Some(row) = row {
                set.get_mut(id)
                    .generated_map
                    .extend(row.to_object_literal());
            }
        }
        Outcome::Ok(())
    }

    /// Post-insert tree bookkeeping: encodings keyed by the (possibly
    /// database-generated) id of the new row.
    async fn finish_tree_inserts(
        &self,
        cx: &Cx,
        set: &mut SubjectSet,
        metadata: &Arc<EntityMetadata>,
        members: &[SubjectId],
        parents: &[Option<Value>],
    ) -> Outcome<(), Error> {
        let Some(tree) = &metadata.tree else {
            return Outcome::Ok(());
        };
        if tree.tree_type == TreeType::NestedSet {
            return Outcome::Ok(());
        }
        let pk = match single_primary_column(metadata) {
            Ok(pk) => pk,
            Err(e) => return Outcome::Err(e),
        };
        for (&id, parent) in members.iter().zip(parents.iter()) {
            let Some(node_id) = set.get(id).resolved_value(&pk) else {
                return Outcome::Err(Error::Persistence(
                    PersistenceError::MissingIdentifier {
                        operation: "insert",
                        table: metadata.table_path.clone(),
                    },
                ));
            };
            match tree.tree_type {
                TreeType::ClosureTable => {
                    let executor = match ClosureTreeExecutor::new(self.runner, metadata) {
                        Ok(e) => e,
                        Err(e) => return Outcome::Err(e),
                    };
                    match executor.insert(cx, &node_id, parent.as_ref()).await {
                        Outcome::Ok(()) => {}
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(c) => return Outcome::Cancelled(c),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    }
                }
                TreeType::MaterializedPath => {
                    let executor =
                        match MaterializedPathTreeExecutor::new(self.runner, metadata) {
                            Ok(e) => e,
                            Err(e) => return Outcome::Err(e),
                        };
                    let path = match executor.insert(cx, &node_id, parent.as_ref()).await {
                        Outcome::Ok(p) => p,
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(c) => return Outcome::Cancelled(c),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    };
                    if let Some(column) = &tree.path_column {
                        set.get_mut(id).generated_map.insert(column.clone(), path);
                    }
                }
                TreeType::NestedSet => {}
            }
        }
        Outcome::Ok(())
    }

    /// Assemble the column-value map one insert will write.
    ///
    /// Entity values come first, change maps override them (foreign keys
    /// live on relation values, not entity columns), then the engine
    /// seeds special columns. Change maps that cannot be resolved yet are
    /// kept for the fix-up update after all inserts ran.
    fn build_insert_value_set(
        &self,
        set: &mut SubjectSet,
        id: SubjectId,
    ) -> Result<ObjectLiteral> {
        let caps = self.runner.capabilities();
        let metadata = Arc::clone(&set.get(id).metadata);
        let mut values = ObjectLiteral::new();

        if let Some(entity) = set.get(id).entity.clone() {
            let data = entity.lock().expect("entity lock poisoned");
            for column in &metadata.columns {
                if column.is_special() {
                    continue;
                }
                if column.is_generated
                    && column.generation_strategy == Some(GenerationStrategy::Increment)
                {
                    continue;
                }
                if let Some(value) = data.get(&column.database_name) {
                    values.insert(
                        column.database_name.clone(),
                        apply_to_transform(column, value),
                    );
                }
            }
        }

        let change_maps = std::mem::take(&mut set.get_mut(id).change_maps);
        let mut remaining = Vec::new();
        for change in change_maps {
            match resolve_change_map(set, &metadata, &change, false)? {
                Some(pairs) => {
                    for (column, value) in pairs {
                        values.insert(column, value);
                    }
                }
                None => remaining.push(change),
            }
        }

        let mut generated = ObjectLiteral::new();
        let now = now_timestamp();
        if let Some(column) = metadata.create_date_column() {
            values.insert(column.database_name.clone(), now.clone());
            generated.insert(column.database_name.clone(), now.clone());
        }
        if let Some(column) = metadata.update_date_column() {
            values.insert(column.database_name.clone(), now.clone());
            generated.insert(column.database_name.clone(), now.clone());
        }
        if let Some(column) = metadata.version_column() {
            values.insert(column.database_name.clone(), Value::BigInt(1));
            generated.insert(column.database_name.clone(), Value::BigInt(1));
        }
        if !caps.uuid_generation_supported {
            for column in metadata.generated_columns() {
                if column.generation_strategy == Some(GenerationStrategy::Uuid)
                    && !values.contains_key(&column.database_name)
                {
                    let fresh = Value::Uuid(*uuid::Uuid::new_v4().as_bytes());
                    values.insert(column.database_name.clone(), fresh.clone());
                    generated.insert(column.database_name.clone(), fresh);
                }
            }
        }

        let subject = set.get_mut(id);
        subject.change_maps = remaining;
        subject.generated_map.extend(generated);
        Ok(values)
    }

    /// Resolve the parent node id of a tree subject, from the tracked
    /// subject of the parent entity or its live values.
    fn tree_parent_of(&self, set: &SubjectSet, id: SubjectId) -> Result<Option<Value>> {
        let subject = set.get(id);
        let metadata = &subject.metadata;
        let Some(tree) = &metadata.tree else {
            return Ok(None);
        };
        let pk = single_primary_column(metadata)?;

        let Some(entity) = &subject.entity else {
            return Ok(None);
        };
        let relation_value = {
            let data = entity.lock().expect("entity lock poisoned");
            data.relation(&tree.parent_relation).cloned()
        };
        let parent = match relation_value {
            Some(relorm_core::RelationValue::One(parent)) => parent,
            Some(relorm_core::RelationValue::Many(_)) => None,
            None => {
                // No relation slot: fall back to a raw foreign-key value.
                let fk = parent_fk_column(metadata)?;
                let data = entity.lock().expect("entity lock poisoned");
                return Ok(data.get(&fk).filter(|v| !v.is_null()).cloned());
            }
        };
        let Some(parent) = parent else {
            return Ok(None);
        };

        let resolved = match set.find_by_entity(&parent) {
            Some(parent_subject) => set.get(parent_subject).resolved_value(&pk),
            None => {
                let data = parent.lock().expect("entity lock poisoned");
                data.get(&pk).cloned()
            }
        };
        match resolved {
            Some(value) if !value.is_null() => Ok(Some(value)),
            _ => Err(PersistenceError::CannotAttachTreeChildren {
                table: metadata.table_path.clone(),
            }
            .into()),
        }
    }

    // ---- update phase ----

    async fn execute_updates(
        &self,
        cx: &Cx,
        set: &mut SubjectSet,
        ids: &[SubjectId],
    ) -> Outcome<(), Error> {
        for &id in ids {
            let metadata = Arc::clone(&set.get(id).metadata);
            let change_maps = std::mem::take(&mut set.get_mut(id).change_maps);
            let mut assignments = ObjectLiteral::new();
            for change in &change_maps {
                match resolve_change_map(set, &metadata, change, true) {
                    Ok(Some(pairs)) => {
                        for (column, value) in pairs {
                            assignments.insert(column, value);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => return Outcome::Err(e),
                }
            }

            // Drop assignments the database already holds.
            if let Some(database) = &set.get(id).database_entity {
                assignments.retain(|column, value| {
                    database
                        .get(column)
                        .is_none_or(|stored| !value.loosely_equals(stored))
                });
            }
            if assignments.is_empty() {
                continue;
            }

            let identifier = match set.get(id).require_identifier("update") {
                Ok(identifier) => identifier.clone(),
                Err(e) => return Outcome::Err(e),
            };

            // A changed tree parent means the encoding moves too.
            if metadata.has_tree() {
                match self
                    .maybe_move_tree_node(cx, set, id, &metadata, &assignments)
                    .await
                {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(c) => return Outcome::Cancelled(c),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }

            let mut generated = ObjectLiteral::new();
            let now = now_timestamp();
            if let Some(column) = metadata.update_date_column() {
                assignments.insert(column.database_name.clone(), now.clone());
                generated.insert(column.database_name.clone(), now.clone());
            }
            if let Some(column) = metadata.version_column() {
                let previous = set
                    .get(id)
                    .database_entity
                    .as_ref()
                    .and_then(|db| db.get(&column.database_name))
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                let next = Value::BigInt(previous + 1);
                assignments.insert(column.database_name.clone(), next.clone());
                generated.insert(column.database_name.clone(), next);
            }

            let (sql, params) = UpdateStatement::new(&metadata.table_path)
                .set_all(&assignments)
                .filter(identifier)
                .build();
            debug!(entity = %metadata.name, "update");
            match self.runner.execute(cx, &sql, &params).await {
                Outcome::Ok(_) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(c) => return Outcome::Cancelled(c),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
            set.get_mut(id).generated_map.extend(generated);
        }
        Outcome::Ok(())
    }

    async fn maybe_move_tree_node(
        &self,
        cx: &Cx,
        set: &SubjectSet,
        id: SubjectId,
        metadata: &Arc<EntityMetadata>,
        assignments: &ObjectLiteral,
    ) -> Outcome<(), Error> {
        let fk = match parent_fk_column(metadata) {
            Ok(fk) => fk,
            Err(e) => return Outcome::Err(e),
        };
        let Some(new_parent) = assignments.get(&fk) else {
            return Outcome::Ok(());
        };
        let subject = set.get(id);
        let old_parent = subject
            .database_entity
            .as_ref()
            .and_then(|db| db.get(&fk))
            .filter(|v| !v.is_null())
            .cloned();
        let new_parent = if new_parent.is_null() {
            None
        } else {
            Some(new_parent.clone())
        };
        let pk = match single_primary_column(metadata) {
            Ok(pk) => pk,
            Err(e) => return Outcome::Err(e),
        };
        let Some(node_id) = subject
            .identifier
            .as_ref()
            .and_then(|identifier| identifier.get(&pk))
            .cloned()
        else {
            return Outcome::Ok(());
        };

        let tree_type = match &metadata.tree {
            Some(tree) => tree.tree_type,
            None => return Outcome::Ok(()),
        };
        match tree_type {
            TreeType::ClosureTable => {
                let executor = match ClosureTreeExecutor::new(self.runner, metadata) {
                    Ok(e) => e,
                    Err(e) => return Outcome::Err(e),
                };
                executor
                    .update(cx, &node_id, old_parent.as_ref(), new_parent.as_ref())
                    .await
            }
            TreeType::NestedSet => {
                let executor = match NestedSetTreeExecutor::new(self.runner, metadata) {
                    Ok(e) => e,
                    Err(e) => return Outcome::Err(e),
                };
                executor
                    .update(cx, &node_id, old_parent.as_ref(), new_parent.as_ref())
                    .await
            }
            TreeType::MaterializedPath => {
                let executor = match MaterializedPathTreeExecutor::new(self.runner, metadata) {
                    Ok(e) => e,
                    Err(e) => return Outcome::Err(e),
                };
                executor
                    .update(cx, &node_id, old_parent.as_ref(), new_parent.as_ref())
                    .await
            }
        }
    }

    // ---- removal phase ----

    async fn execute_removals(
        &self,
        cx: &Cx,
        set: &mut SubjectSet,
        ids: &[SubjectId],
    ) -> Outcome<(), Error> {
        let caps = self.runner.capabilities();

        // Consecutive subjects of one table share a delete statement.
        let mut groups: Vec<(Arc<EntityMetadata>, Vec<SubjectId>)> = Vec::new();
        for &id in ids {
            let metadata = Arc::clone(&set.get(id).metadata);
            match groups.last_mut() {
                Some((m, members)) if m.name == metadata.name => members.push(id),
                _ => groups.push((metadata, vec![id])),
            }
        }

        for (metadata, members) in groups {
            let mut identifiers = Vec::with_capacity(members.len());
            for &id in &members {
                match set.get(id).require_identifier("delete") {
                    Ok(identifier) => identifiers.push(identifier.clone()),
                    Err(e) => return Outcome::Err(e),
                }
            }

            match self
                .tree_removal_bookkeeping(cx, &metadata, &identifiers)
                .await
            {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(c) => return Outcome::Cancelled(c),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }

            let mut statement = DeleteStatement::new(&metadata.table_path);
            for identifier in identifiers {
                statement = statement.id(identifier);
            }
            debug!(entity = %metadata.name, rows = members.len(), "delete");
            for (sql, params) in statement.build(caps.delete_grouping_supported) {
                match self.runner.execute(cx, &sql, &params).await {
                    Outcome::Ok(_) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(c) => return Outcome::Cancelled(c),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
        }
        Outcome::Ok(())
    }

    async fn tree_removal_bookkeeping(
        &self,
        cx: &Cx,
        metadata: &Arc<EntityMetadata>,
        identifiers: &[ObjectLiteral],
    ) -> Outcome<(), Error> {
        let Some(tree) = &metadata.tree else {
            return Outcome::Ok(());
        };
        let pk = match single_primary_column(metadata) {
            Ok(pk) => pk,
            Err(e) => return Outcome::Err(e),
        };
        let node_ids: Vec<Value> = identifiers
            .iter()
            .filter_map(|identifier| identifier.get(&pk).cloned())
            .collect();
        match tree.tree_type {
            TreeType::ClosureTable => {
                // Drivers with foreign-key cascades clean the junction up
                // themselves.
                if self.runner.capabilities().cascades_junction_on_delete {
                    return Outcome::Ok(());
                }
                let executor = match ClosureTreeExecutor::new(self.runner, metadata) {
                    Ok(e) => e,
                    Err(e) => return Outcome::Err(e),
                };
                executor.remove(cx, &node_ids).await
            }
            TreeType::NestedSet => {
                let executor = match NestedSetTreeExecutor::new(self.runner, metadata) {
                    Ok(e) => e,
                    Err(e) => return Outcome::Err(e),
                };
                executor.remove(cx, &node_ids).await
            }
            TreeType::MaterializedPath => Outcome::Ok(()),
        }
    }

    // ---- soft-remove / recover phase ----

    async fn execute_soft_removals(
        &self,
        cx: &Cx,
        set: &mut SubjectSet,
        ids: &[SubjectId],
        recover: bool,
    ) -> Outcome<(), Error> {
        for &id in ids {
            let metadata = Arc::clone(&set.get(id).metadata);
            let Some(delete_column) = metadata.delete_date_column() else {
                continue;
            };
            let identifier = match set
                .get(id)
                .require_identifier(if recover { "recover" } else { "soft-remove" })
            {
                Ok(identifier) => identifier.clone(),
                Err(e) => return Outcome::Err(e),
            };

            let now = now_timestamp();
            let mut assignments = ObjectLiteral::new();
            let mut generated = ObjectLiteral::new();
            let deleted_at = if recover { Value::Null } else { now.clone() };
            assignments.insert(delete_column.database_name.clone(), deleted_at.clone());
            generated.insert(delete_column.database_name.clone(), deleted_at);
            if let Some(column) = metadata.update_date_column() {
                assignments.insert(column.database_name.clone(), now.clone());
                generated.insert(column.database_name.clone(), now.clone());
            }
            if let Some(column) = metadata.version_column() {
                let previous = set
                    .get(id)
                    .database_entity
                    .as_ref()
                    .and_then(|db| db.get(&column.database_name))
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                let next = Value::BigInt(previous + 1);
                assignments.insert(column.database_name.clone(), next.clone());
                generated.insert(column.database_name.clone(), next);
            }

            let (sql, params) = UpdateStatement::new(&metadata.table_path)
                .set_all(&assignments)
                .filter(identifier)
                .build();
            debug!(entity = %metadata.name, recover, "soft removal state change");
            match self.runner.execute(cx, &sql, &params).await {
                Outcome::Ok(_) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(c) => return Outcome::Cancelled(c),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
            set.get_mut(id).generated_map.extend(generated);
        }
        Outcome::Ok(())
    }

    // ---- propagation ----

    /// Merge generated values back into the live entities; removed
    /// entities lose their primary keys.
    fn propagate(set: &mut SubjectSet) {
        for id in set.ids().collect::<Vec<_>>() {
            let subject = set.get(id);
            let Some(entity) = subject.entity.clone() else {
                continue;
            };
            let mut data = entity.lock().expect("entity lock poisoned");
            if subject.must_be_removed {
                let primaries: Vec<String> = subject
                    .metadata
                    .primary_columns()
                    .map(|c| c.database_name.clone())
                    .collect();
                for column in primaries {
                    data.unset(&column);
                }
                continue;
            }
            for (column, value) in &subject.generated_map {
                let hydrated = match subject
                    .metadata
                    .find_column(column)
                    .and_then(|c| c.transformer.as_ref())
                {
                    Some(transformer) => (transformer.from)(value),
                    None => value.clone(),
                };
                data.set(column.clone(), hydrated);
            }
        }
    }
}

/// Resolve one change map into concrete column assignments.
///
/// In lenient mode (inserts) an unresolvable reference returns `None` and
/// the map is retried later; in strict mode (updates) it is an invariant
/// violation.
fn resolve_change_map(
    set: &SubjectSet,
    metadata: &EntityMetadata,
    change: &ChangeMap,
    strict: bool,
) -> Result<Option<Vec<(String, Value)>>> {
    if let Some(column) = &change.column {
        let source = change.source_column.as_deref().unwrap_or(column);
        let resolved = match &change.value {
            ChangeValue::Value(value) => Some(value.clone()),
            ChangeValue::Null => Some(Value::Null),
            ChangeValue::Subject(subject_id) => set.get(*subject_id).resolved_value(source),
            ChangeValue::Entity(entity) => match set.find_by_entity(entity) {
                Some(subject_id) => set.get(subject_id).resolved_value(source),
                None => {
                    let data = entity.lock().expect("entity lock poisoned");
                    data.get(source).cloned()
                }
            },
        };
        return match resolved {
            Some(value) => Ok(Some(vec![(column.clone(), value)])),
            None => unresolved(strict, &metadata.table_path),
        };
    }

    let Some(name) = &change.relation else {
        return Ok(Some(Vec::new()));
    };
    let Some(relation) = metadata.find_relation(name) else {
        return Ok(Some(Vec::new()));
    };

    match &change.value {
        ChangeValue::Null => Ok(Some(
            relation
                .join_columns
                .iter()
                .map(|jc| (jc.name.clone(), Value::Null))
                .collect(),
        )),
        ChangeValue::Value(value) => Ok(Some(
            relation
                .join_columns
                .first()
                .map(|jc| (jc.name.clone(), value.clone()))
                .into_iter()
                .collect(),
        )),
        ChangeValue::Subject(subject_id) => {
            let related = set.get(*subject_id);
            let mut pairs = Vec::with_capacity(relation.join_columns.len());
            for jc in &relation.join_columns {
                match related.resolved_value(&jc.referenced_column) {
                    Some(value) if !value.is_null() => pairs.push((jc.name.clone(), value)),
                    _ => return unresolved(strict, &related.metadata.table_path),
                }
            }
            Ok(Some(pairs))
        }
        ChangeValue::Entity(entity) => {
            if let Some(subject_id) = set.find_by_entity(entity) {
                let related = set.get(subject_id);
                let mut pairs = Vec::with_capacity(relation.join_columns.len());
                for jc in &relation.join_columns {
                    match related.resolved_value(&jc.referenced_column) {
                        Some(value) if !value.is_null() => {
                            pairs.push((jc.name.clone(), value));
                        }
                        _ => return unresolved(strict, &related.metadata.table_path),
                    }
                }
                return Ok(Some(pairs));
            }
            let data = entity.lock().expect("entity lock poisoned");
            let mut pairs = Vec::with_capacity(relation.join_columns.len());
            for jc in &relation.join_columns {
                match data.get(&jc.referenced_column) {
                    Some(value) if !value.is_null() => {
                        pairs.push((jc.name.clone(), value.clone()));
                    }
                    _ => return unresolved(strict, &metadata.table_path),
                }
            }
            Ok(Some(pairs))
        }
    }
}

fn unresolved(strict: bool, table: &str) -> Result<Option<Vec<(String, Value)>>> {
    if strict {
        Err(PersistenceError::MissingIdentifier {
            operation: "update",
            table: table.to_string(),
        }
        .into())
    } else {
        Ok(None)
    }
}

/// The current instant as a microsecond UTC timestamp value.
fn now_timestamp() -> Value {
    let micros = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
        .unwrap_or(0);
    Value::TimestampTz(micros)
}

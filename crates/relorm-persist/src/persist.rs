//! Top-level persist entry point.
//!
//! `EntityPersistExecutor` turns "save/remove these entities" into one
//! executor run: it builds the subject set through the builders, loads
//! database state, computes changed columns, and hands the set to the
//! [`SubjectExecutor`] inside a transaction it owns unless one is already
//! active, the caller opted out, or the driver's DML is not transactional.

use crate::broadcaster::Broadcaster;
use crate::builders::{
    CascadesSubjectBuilder, ManyToManySubjectBuilder, OneToManySubjectBuilder,
    OneToOneInverseSideSubjectBuilder,
};
use crate::diff::ChangedColumnsComputer;
use crate::executor::{ExecutorOptions, SubjectExecutor};
use crate::loader::SubjectDatabaseLoader;
use crate::subject::{Subject, SubjectSet};
use relorm_core::{
    Cx, EntityMetadata, EntityRef, Error, MetadataRegistry, Outcome, QueryRunner,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// What the caller asked to do with the entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistMode {
    /// Insert new entities, update existing ones.
    Save,
    /// Delete the rows.
    Remove,
    /// Set the soft-delete timestamp.
    SoftRemove,
    /// Clear the soft-delete timestamp.
    Recover,
}

/// Knobs for one persist call.
#[derive(Debug, Clone, Copy)]
pub struct PersistOptions {
    /// Whether entity listeners are invoked.
    pub listeners: bool,
    /// Whether generated columns are fetched back when the driver cannot
    /// return them with the write.
    pub reload: bool,
    /// Split the entities into batches of this size. `0` disables
    /// chunking.
    pub chunk: usize,
    /// Whether the executor may open its own transaction.
    pub transaction: bool,
}

impl Default for PersistOptions {
    fn default() -> Self {
        Self {
            listeners: true,
            reload: true,
            chunk: 0,
            transaction: true,
        }
    }
}

/// Persists a graph of entities on one runner.
pub struct EntityPersistExecutor<'a, R: QueryRunner> {
    runner: &'a R,
    registry: &'a MetadataRegistry,
    broadcaster: Broadcaster,
}

impl<'a, R: QueryRunner> EntityPersistExecutor<'a, R> {
    /// Create an executor over the given runner and metadata registry.
    pub fn new(runner: &'a R, registry: &'a MetadataRegistry) -> Self {
        Self {
            runner,
            registry,
            broadcaster: Broadcaster::new(),
        }
    }

    /// Mutable access to the listener registry.
    pub fn broadcaster_mut(&mut self) -> &mut Broadcaster {
        &mut self.broadcaster
    }

    /// Persist the given entities of one type according to `mode`.
    ///
    /// With chunking enabled, every chunk is built and executed as an
    /// independent unit of work in its own transaction.
    #[tracing::instrument(skip_all, fields(entity = entity_name, entities = entities.len()))]
    pub async fn execute(
        &self,
        cx: &Cx,
        mode: PersistMode,
        entity_name: &str,
        entities: Vec<EntityRef>,
        options: &PersistOptions,
    ) -> Outcome<(), Error> {
        let Some(metadata) = self.registry.get(entity_name) else {
            return Outcome::Err(Error::Custom(format!(
                "no metadata registered for entity \"{entity_name}\""
            )));
        };
        if matches!(mode, PersistMode::SoftRemove | PersistMode::Recover)
            && metadata.delete_date_column().is_none()
        {
            return Outcome::Err(Error::Custom(format!(
                "entity \"{}\" has no soft-delete column",
                metadata.name
            )));
        }

        let chunks: Vec<Vec<EntityRef>> = if options.chunk > 0 && entities.len() > options.chunk {
            entities.chunks(options.chunk).map(<[_]>::to_vec).collect()
        } else {
            vec![entities]
        };

        for chunk in chunks {
            if chunk.is_empty() {
                continue;
            }
            match self
                .execute_chunk(cx, mode, &metadata, chunk, options)
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

    async fn execute_chunk(
        &self,
        cx: &Cx,
        mode: PersistMode,
        metadata: &Arc<EntityMetadata>,
        entities: Vec<EntityRef>,
        options: &PersistOptions,
    ) -> Outcome<(), Error> {
        let mut set = SubjectSet::new();
        for entity in entities {
            let mut subject = Subject::new(Arc::clone(metadata), Some(entity));
            match mode {
                PersistMode::Save => {
                    subject.can_be_inserted = true;
                    subject.can_be_updated = true;
                }
                PersistMode::Remove => subject.must_be_removed = true,
                PersistMode::SoftRemove => subject.can_be_soft_removed = true,
                PersistMode::Recover => subject.can_be_recovered = true,
            }
            set.add(subject);
        }

        CascadesSubjectBuilder::build(&mut set, self.registry);

        let loader = SubjectDatabaseLoader::new(self.runner, self.registry);
        match loader.load(cx, &mut set).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(c) => return Outcome::Cancelled(c),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        OneToManySubjectBuilder::build(&mut set, self.registry);
        OneToOneInverseSideSubjectBuilder::build(&mut set, self.registry);
        ManyToManySubjectBuilder::build(&mut set, self.registry);
        ChangedColumnsComputer::compute(&mut set);

        if !SubjectExecutor::<R>::has_executable_operations(&set) {
            debug!(entity = %metadata.name, "nothing to persist");
            return Outcome::Ok(());
        }

        let caps = self.runner.capabilities();
        let own_transaction = options.transaction
            && caps.transactional_dml
            && !self.runner.is_transaction_active();
        if own_transaction {
            match self.runner.start_transaction(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(c) => return Outcome::Cancelled(c),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        let executor = SubjectExecutor::new(
            self.runner,
            self.registry,
            &self.broadcaster,
            ExecutorOptions {
                listeners: options.listeners,
                reload: options.reload,
            },
        );
        match executor.execute(cx, &mut set).await {
            Outcome::Ok(()) => {
                if own_transaction {
                    match self.runner.commit_transaction(cx).await {
                        Outcome::Ok(()) => {}
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(c) => return Outcome::Cancelled(c),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    }
                }
                Outcome::Ok(())
            }
            Outcome::Err(e) => {
                self.try_rollback(cx, own_transaction).await;
                Outcome::Err(e)
            }
            Outcome::Cancelled(c) => {
                self.try_rollback(cx, own_transaction).await;
                Outcome::Cancelled(c)
            }
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Roll back an owned transaction; a rollback failure is logged and
    /// swallowed so the original error surfaces.
    async fn try_rollback(&self, cx: &Cx, own_transaction: bool) {
        if !own_transaction {
            return;
        }
        if let Outcome::Err(rollback) = self.runner.rollback_transaction(cx).await {
            warn!(error = %rollback, "rollback after failed persist also failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockQueryRunner, run_test, unwrap_outcome};
    use relorm_core::{
        ColumnMetadata, DriverCapabilities, GenerationStrategy, Row, Value, entity_from_values,
    };

    fn registry() -> MetadataRegistry {
        let mut registry = MetadataRegistry::new();
        registry.add(
            EntityMetadata::new("author", "author")
                .column(
                    ColumnMetadata::new("id")
                        .primary()
                        .generated(GenerationStrategy::Increment),
                )
                .column(ColumnMetadata::new("name")),
        );
        registry
    }

    fn entity(pairs: &[(&str, Value)]) -> EntityRef {
        entity_from_values(
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
        )
    }

    fn id_row(id: i64) -> Row {
        Row::new(vec!["id".into()], vec![Value::BigInt(id)])
    }

    #[test]
    fn test_save_inserts_inside_own_transaction() {
        run_test(|cx, runner: MockQueryRunner| async move {
            let registry = registry();
            runner.push_query_result(vec![id_row(1), id_row(2)]);
            let ada = entity(&[("name", "ada".into())]);
            let grace = entity(&[("name", "grace".into())]);

            let persist = EntityPersistExecutor::new(&runner, &registry);
            unwrap_outcome(
                persist
                    .execute(
                        &cx,
                        PersistMode::Save,
                        "author",
                        vec![ada.clone(), grace.clone()],
                        &PersistOptions::default(),
                    )
                    .await,
            );

            assert_eq!(runner.tx_log(), vec!["start", "commit"]);
            assert_eq!(ada.lock().unwrap().get("id"), Some(&Value::BigInt(1)));
            assert_eq!(grace.lock().unwrap().get("id"), Some(&Value::BigInt(2)));
        });
    }

    #[test]
    fn test_failure_mid_batch_rolls_back() {
        run_test(|cx, _default: MockQueryRunner| async move {
            // No RETURNING: every row is a separate insert statement.
            let runner = MockQueryRunner::new().with_capabilities(DriverCapabilities::mysql());
            runner.fail_after_executes(1);
            let registry = registry();

            let persist = EntityPersistExecutor::new(&runner, &registry);
            let outcome = persist
                .execute(
                    &cx,
                    PersistMode::Save,
                    "author",
                    vec![entity(&[("name", "a".into())]), entity(&[("name", "b".into())])],
                    &PersistOptions::default(),
                )
                .await;

            assert!(matches!(outcome, Outcome::Err(_)));
            assert_eq!(runner.tx_log(), vec!["start", "rollback"]);
            assert_eq!(runner.executed().len(), 1);
        });
    }

    #[test]
    fn test_existing_transaction_is_reused() {
        run_test(|cx, runner: MockQueryRunner| async move {
            let registry = registry();
            unwrap_outcome(runner.start_transaction(&cx).await);
            runner.push_query_result(vec![id_row(1)]);

            let persist = EntityPersistExecutor::new(&runner, &registry);
            unwrap_outcome(
                persist
                    .execute(
                        &cx,
                        PersistMode::Save,
                        "author",
                        vec![entity(&[("name", "ada".into())])],
                        &PersistOptions::default(),
                    )
                    .await,
            );

            // Only the caller's start; no commit issued by the executor.
            assert_eq!(runner.tx_log(), vec!["start"]);
            assert!(runner.is_transaction_active());
        });
    }

    #[test]
    fn test_transaction_opt_out() {
        run_test(|cx, runner: MockQueryRunner| async move {
            let registry = registry();
            runner.push_query_result(vec![id_row(1)]);
            let persist = EntityPersistExecutor::new(&runner, &registry);
            unwrap_outcome(
                persist
                    .execute(
                        &cx,
                        PersistMode::Save,
                        "author",
                        vec![entity(&[("name", "ada".into())])],
                        &PersistOptions {
                            transaction: false,
                            ..PersistOptions::default()
                        },
                    )
                    .await,
            );
            assert!(runner.tx_log().is_empty());
        });
    }

    #[test]
    fn test_remove_deletes_and_unsets_ids() {
        run_test(|cx, runner: MockQueryRunner| async move {
            let registry = registry();
            let ada = entity(&[("id", Value::BigInt(1))]);
            let grace = entity(&[("id", Value::BigInt(2))]);

            let persist = EntityPersistExecutor::new(&runner, &registry);
            unwrap_outcome(
                persist
                    .execute(
                        &cx,
                        PersistMode::Remove,
                        "author",
                        vec![ada.clone(), grace.clone()],
                        &PersistOptions::default(),
                    )
                    .await,
            );

            let executed = runner.executed();
            assert_eq!(
                executed.last().map(|(sql, _)| sql.as_str()),
                Some("DELETE FROM \"author\" WHERE \"id\" IN ($1, $2)")
            );
            assert_eq!(runner.tx_log(), vec!["start", "commit"]);
            assert!(ada.lock().unwrap().get("id").is_none());
        });
    }

    #[test]
    fn test_soft_remove_without_column_is_rejected() {
        run_test(|cx, runner: MockQueryRunner| async move {
            let registry = registry();
            let persist = EntityPersistExecutor::new(&runner, &registry);
            let outcome = persist
                .execute(
                    &cx,
                    PersistMode::SoftRemove,
                    "author",
                    vec![entity(&[("id", Value::BigInt(1))])],
                    &PersistOptions::default(),
                )
                .await;
            assert!(matches!(outcome, Outcome::Err(Error::Custom(_))));
            assert!(runner.executed().is_empty());
            assert!(runner.tx_log().is_empty());
        });
    }

    #[test]
    fn test_unknown_entity_is_rejected() {
        run_test(|cx, runner: MockQueryRunner| async move {
            let registry = registry();
            let persist = EntityPersistExecutor::new(&runner, &registry);
            let outcome = persist
                .execute(
                    &cx,
                    PersistMode::Save,
                    "missing",
                    vec![entity(&[])],
                    &PersistOptions::default(),
                )
                .await;
            assert!(matches!(outcome, Outcome::Err(Error::Custom(_))));
        });
    }

    #[test]
    fn test_chunking_runs_separate_units_of_work() {
        run_test(|cx, runner: MockQueryRunner| async move {
            let registry = registry();
            runner.push_query_result(vec![id_row(1)]);
            runner.push_query_result(vec![id_row(2)]);

            let persist = EntityPersistExecutor::new(&runner, &registry);
            unwrap_outcome(
                persist
                    .execute(
                        &cx,
                        PersistMode::Save,
                        "author",
                        vec![entity(&[("name", "a".into())]), entity(&[("name", "b".into())])],
                        &PersistOptions {
                            chunk: 1,
                            ..PersistOptions::default()
                        },
                    )
                    .await,
            );

            assert_eq!(runner.queries().len(), 2);
            assert_eq!(runner.tx_log(), vec!["start", "commit", "start", "commit"]);
        });
    }

    #[test]
    fn test_unchanged_entity_issues_no_statements() {
        run_test(|cx, runner: MockQueryRunner| async move {
            let registry = registry();
            // Loader snapshot matches the live entity exactly.
            runner.push_query_result(vec![Row::new(
                vec!["id".into(), "name".into()],
                vec![Value::BigInt(1), Value::Text("ada".into())],
            )]);

            let persist = EntityPersistExecutor::new(&runner, &registry);
            unwrap_outcome(
                persist
                    .execute(
                        &cx,
                        PersistMode::Save,
                        "author",
                        vec![entity(&[("id", Value::BigInt(1)), ("name", "ada".into())])],
                        &PersistOptions::default(),
                    )
                    .await,
            );

            assert!(runner.executed().is_empty());
            assert!(runner.tx_log().is_empty());
        });
    }

    #[test]
    fn test_listeners_fire_through_persist() {
        run_test(|cx, runner: MockQueryRunner| async move {
            let registry = registry();
            runner.push_query_result(vec![id_row(1)]);
            let ada = entity(&[("name", "ada".into())]);

            let mut persist = EntityPersistExecutor::new(&runner, &registry);
            persist.broadcaster_mut().on(
                "author",
                crate::broadcaster::ListenerEvent::BeforeInsert,
                |entity| {
                    let mut data = entity.lock().expect("entity lock poisoned");
                    data.set("name", Value::Text("renamed".into()));
                },
            );
            unwrap_outcome(
                persist
                    .execute(
                        &cx,
                        PersistMode::Save,
                        "author",
                        vec![ada],
                        &PersistOptions::default(),
                    )
                    .await,
            );

            let queries = runner.queries();
            assert!(queries[0].1.contains(&Value::Text("renamed".into())));
        });
    }
}

//! Closure-table maintenance.
//!
//! The closure junction stores one (ancestor, descendant) row per pair,
//! including a self pair per node, so ancestor and descendant queries need
//! no recursion. Insert and move are expressed as set operations against
//! the junction itself.

use relorm_core::{
    Cx, EntityMetadata, Error, Outcome, QueryRunner, Result, TreeType, Value, quote_ident,
};
use std::sync::Arc;
use tracing::debug;

/// Maintains a closure junction table.
pub struct ClosureTreeExecutor<'a, R: QueryRunner> {
    runner: &'a R,
    table: String,
    ancestor: String,
    descendant: String,
}

impl<'a, R: QueryRunner> ClosureTreeExecutor<'a, R> {
    /// Create an executor for a closure-table entity.
    pub fn new(runner: &'a R, metadata: &Arc<EntityMetadata>) -> Result<Self> {
        let junction = metadata
            .tree
            .as_ref()
            .filter(|t| t.tree_type == TreeType::ClosureTable)
            .and_then(|t| t.closure_junction.as_ref())
            .ok_or_else(|| {
                Error::Custom(format!(
                    "\"{}\" is not a closure-table tree entity",
                    metadata.table_path
                ))
            })?;
        Ok(Self {
            runner,
            table: junction.table.clone(),
            ancestor: junction.ancestor_column.clone(),
            descendant: junction.descendant_column.clone(),
        })
    }

    /// Record a freshly inserted node: its self pair, plus one row per
    /// ancestor of its parent.
    pub async fn insert(
        &self,
        cx: &Cx,
        id: &Value,
        parent_id: Option<&Value>,
    ) -> Outcome<(), Error> {
        let sql = format!(
            "INSERT INTO {} ({}, {}) VALUES ($1, $2)",
            quote_ident(&self.table),
            quote_ident(&self.ancestor),
            quote_ident(&self.descendant)
        );
        match self
            .runner
            .execute(cx, &sql, &[id.clone(), id.clone()])
            .await
        {
            Outcome::Ok(_) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(c) => return Outcome::Cancelled(c),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        let Some(parent_id) = parent_id else {
            return Outcome::Ok(());
        };
        // Every ancestor of my parent (the parent included, through its
        // self pair) becomes my ancestor.
        let sql = format!(
            "INSERT INTO {t} ({a}, {d}) SELECT {a}, $1 FROM {t} WHERE {d} = $2",
            t = quote_ident(&self.table),
            a = quote_ident(&self.ancestor),
            d = quote_ident(&self.descendant)
        );
        debug!(table = %self.table, "closure ancestor expansion");
        match self
            .runner
            .execute(cx, &sql, &[id.clone(), parent_id.clone()])
            .await
        {
            Outcome::Ok(_) => Outcome::Ok(()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(c) => Outcome::Cancelled(c),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Re-parent a node: drop the stale ancestor links of its subtree,
    /// then link the new lineage to every node of the subtree.
    pub async fn update(
        &self,
        cx: &Cx,
        id: &Value,
        old_parent_id: Option<&Value>,
        new_parent_id: Option<&Value>,
    ) -> Outcome<(), Error> {
        let unchanged = match (old_parent_id, new_parent_id) {
            (None, None) => true,
            (Some(a), Some(b)) => a.loosely_equals(b),
            _ => false,
        };
        if unchanged {
            return Outcome::Ok(());
        }

        // Remove links from outside ancestors into the moved subtree.
        // Subtree-internal links (ancestor inside the subtree) survive.
        let sql = format!(
            "DELETE FROM {t} WHERE {d} IN (SELECT {d} FROM {t} WHERE {a} = $1) \
             AND {a} NOT IN (SELECT {d} FROM {t} WHERE {a} = $2)",
            t = quote_ident(&self.table),
            a = quote_ident(&self.ancestor),
            d = quote_ident(&self.descendant)
        );
        match self
            .runner
            .execute(cx, &sql, &[id.clone(), id.clone()])
            .await
        {
            Outcome::Ok(_) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(c) => return Outcome::Cancelled(c),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        let Some(new_parent_id) = new_parent_id else {
            return Outcome::Ok(());
        };
        // Cross product: (ancestors of the new parent, itself included)
        // x (descendants of the moved node, itself included).
        let sql = format!(
            "INSERT INTO {t} ({a}, {d}) \
             SELECT anc.{a}, sub.{d} FROM {t} anc, {t} sub \
             WHERE anc.{d} = $1 AND sub.{a} = $2",
            t = quote_ident(&self.table),
            a = quote_ident(&self.ancestor),
            d = quote_ident(&self.descendant)
        );
        match self
            .runner
            .execute(cx, &sql, &[new_parent_id.clone(), id.clone()])
            .await
        {
            Outcome::Ok(_) => Outcome::Ok(()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(c) => Outcome::Cancelled(c),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Delete all junction rows touching the removed nodes.
    ///
    /// Only needed when the driver does not cascade junction rows through
    /// foreign keys; the caller gates this on capabilities.
    pub async fn remove(&self, cx: &Cx, ids: &[Value]) -> Outcome<(), Error> {
        if ids.is_empty() {
            return Outcome::Ok(());
        }
        let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("${i}")).collect();
        let second: Vec<String> = (ids.len() + 1..=ids.len() * 2)
            .map(|i| format!("${i}"))
            .collect();
        let sql = format!(
            "DELETE FROM {t} WHERE {a} IN ({}) OR {d} IN ({})",
            placeholders.join(", "),
            second.join(", "),
            t = quote_ident(&self.table),
            a = quote_ident(&self.ancestor),
            d = quote_ident(&self.descendant)
        );
        let mut params = ids.to_vec();
        params.extend(ids.iter().cloned());
        match self.runner.execute(cx, &sql, &params).await {
            Outcome::Ok(_) => Outcome::Ok(()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(c) => Outcome::Cancelled(c),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockQueryRunner, run_test, unwrap_outcome};
    use relorm_core::{
        ClosureJunction, ColumnMetadata, JoinColumn, RelationKind, RelationMetadata, TreeMetadata,
    };

    fn metadata() -> Arc<EntityMetadata> {
        Arc::new(
            EntityMetadata::new("category", "category")
                .column(ColumnMetadata::new("id").primary())
                .relation(
                    RelationMetadata::new("parent", RelationKind::ManyToOne, "category")
                        .join_on(vec![JoinColumn::new("parent_id", "id")]),
                )
                .with_tree(TreeMetadata::closure_table(
                    "parent",
                    ClosureJunction {
                        table: "category_closure".into(),
                        ancestor_column: "ancestor".into(),
                        descendant_column: "descendant".into(),
                    },
                )),
        )
    }

    #[test]
    fn test_insert_root_writes_self_pair() {
        run_test(|cx, runner: MockQueryRunner| async move {
            let metadata = metadata();
            let executor = ClosureTreeExecutor::new(&runner, &metadata).unwrap();
            unwrap_outcome(executor.insert(&cx, &Value::BigInt(1), None).await);
            let executed = runner.executed();
            assert_eq!(executed.len(), 1);
            assert_eq!(
                executed[0].0,
                "INSERT INTO \"category_closure\" (\"ancestor\", \"descendant\") VALUES ($1, $2)"
            );
            assert_eq!(executed[0].1, vec![Value::BigInt(1), Value::BigInt(1)]);
        });
    }

    #[test]
    fn test_insert_child_expands_parent_ancestors() {
        run_test(|cx, runner: MockQueryRunner| async move {
            let metadata = metadata();
            let executor = ClosureTreeExecutor::new(&runner, &metadata).unwrap();
            unwrap_outcome(
                executor
                    .insert(&cx, &Value::BigInt(2), Some(&Value::BigInt(1)))
                    .await,
            );
            let executed = runner.executed();
            assert_eq!(executed.len(), 2);
            assert!(executed[1].0.contains("SELECT \"ancestor\", $1"));
            assert_eq!(executed[1].1, vec![Value::BigInt(2), Value::BigInt(1)]);
        });
    }

    /// Three inserts R -> P -> C must leave exactly the six rows
    /// (R,R), (P,P), (R,P), (C,C), (R,C), (P,C).
    #[test]
    fn test_round_trip_six_rows() {
        run_test(|cx, runner: MockQueryRunner| async move {
            runner.simulate_closure_table("category_closure");
            let metadata = metadata();
            let executor = ClosureTreeExecutor::new(&runner, &metadata).unwrap();
            unwrap_outcome(executor.insert(&cx, &Value::BigInt(1), None).await);
            unwrap_outcome(
                executor
                    .insert(&cx, &Value::BigInt(2), Some(&Value::BigInt(1)))
                    .await,
            );
            unwrap_outcome(
                executor
                    .insert(&cx, &Value::BigInt(3), Some(&Value::BigInt(2)))
                    .await,
            );
            let mut rows = runner.closure_rows();
            rows.sort();
            assert_eq!(
                rows,
                vec![(1, 1), (1, 2), (1, 3), (2, 2), (2, 3), (3, 3)]
            );
        });
    }

    #[test]
    fn test_update_same_parent_is_noop() {
        run_test(|cx, runner: MockQueryRunner| async move {
            let metadata = metadata();
            let executor = ClosureTreeExecutor::new(&runner, &metadata).unwrap();
            unwrap_outcome(
                executor
                    .update(
                        &cx,
                        &Value::BigInt(3),
                        Some(&Value::BigInt(1)),
                        Some(&Value::BigInt(1)),
                    )
                    .await,
            );
            assert!(runner.executed().is_empty());
        });
    }

    #[test]
    fn test_update_deletes_stale_links_then_relinks() {
        run_test(|cx, runner: MockQueryRunner| async move {
            let metadata = metadata();
            let executor = ClosureTreeExecutor::new(&runner, &metadata).unwrap();
            unwrap_outcome(
                executor
                    .update(
                        &cx,
                        &Value::BigInt(3),
                        Some(&Value::BigInt(1)),
                        Some(&Value::BigInt(2)),
                    )
                    .await,
            );
            let executed = runner.executed();
            assert_eq!(executed.len(), 2);
            assert!(executed[0].0.starts_with("DELETE FROM \"category_closure\""));
            assert!(executed[0].0.contains("NOT IN"));
            assert!(executed[1].0.contains("anc.\"ancestor\", sub.\"descendant\""));
            assert_eq!(executed[1].1, vec![Value::BigInt(2), Value::BigInt(3)]);
        });
    }

    #[test]
    fn test_remove_matches_both_sides() {
        run_test(|cx, runner: MockQueryRunner| async move {
            let metadata = metadata();
            let executor = ClosureTreeExecutor::new(&runner, &metadata).unwrap();
            unwrap_outcome(executor.remove(&cx, &[Value::BigInt(5)]).await);
            let executed = runner.executed();
            assert_eq!(executed.len(), 1);
            assert_eq!(
                executed[0].0,
                "DELETE FROM \"category_closure\" WHERE \"ancestor\" IN ($1) OR \"descendant\" IN ($2)"
            );
        });
    }
}

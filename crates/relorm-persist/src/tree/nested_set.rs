//! Nested-set maintenance.
//!
//! Every node carries a left/right interval; a node's subtree is exactly
//! the rows whose intervals nest inside its own. Inserting opens a gap of
//! width two at the parent's right bound, removing closes the subtree's
//! gap, and moving shifts the subtree and the displaced region in a single
//! statement so the numbering is never observed half-updated.

use crate::tree::{parent_fk_column, single_primary_column};
use relorm_core::{
    Cx, EntityMetadata, Error, Outcome, PersistenceError, QueryRunner, Result, TreeType, Value,
    quote_ident,
};
use std::sync::Arc;
use tracing::debug;

/// The interval assigned to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NestedSetBounds {
    /// Left bound.
    pub left: i64,
    /// Right bound.
    pub right: i64,
}

/// Maintains left/right interval columns on a nested-set entity.
pub struct NestedSetTreeExecutor<'a, R: QueryRunner> {
    runner: &'a R,
    table: String,
    primary: String,
    parent_fk: String,
    left: String,
    right: String,
}

impl<'a, R: QueryRunner> NestedSetTreeExecutor<'a, R> {
    /// Create an executor for a nested-set entity.
    pub fn new(runner: &'a R, metadata: &Arc<EntityMetadata>) -> Result<Self> {
        let tree = metadata
            .tree
            .as_ref()
            .filter(|t| t.tree_type == TreeType::NestedSet)
            .ok_or_else(|| {
                Error::Custom(format!(
                    "\"{}\" is not a nested-set tree entity",
                    metadata.table_path
                ))
            })?;
        let (Some(left), Some(right)) = (tree.left_column.clone(), tree.right_column.clone())
        else {
            return Err(Error::Custom(format!(
                "nested-set entity \"{}\" is missing its bound columns",
                metadata.table_path
            )));
        };
        Ok(Self {
            runner,
            table: metadata.table_path.clone(),
            primary: single_primary_column(metadata)?,
            parent_fk: parent_fk_column(metadata)?,
            left,
            right,
        })
    }

    /// Open a two-wide gap for a new node and return its interval.
    ///
    /// The caller includes the returned bounds in the row insert, so the
    /// gap is opened before the row exists. A node without a parent is the
    /// tree root; a second root is rejected.
    pub async fn insert(
        &self,
        cx: &Cx,
        parent_id: Option<&Value>,
    ) -> Outcome<NestedSetBounds, Error> {
        let Some(parent_id) = parent_id else {
            let sql = format!(
                "SELECT {p} FROM {t} WHERE {fk} IS NULL",
                t = quote_ident(&self.table),
                p = quote_ident(&self.primary),
                fk = quote_ident(&self.parent_fk)
            );
            match self.runner.query_one(cx, &sql, &[]).await {
                Outcome::Ok(None) => return Outcome::Ok(NestedSetBounds { left: 1, right: 2 }),
                Outcome::Ok(Some(_)) => {
                    return Outcome::Err(Error::Persistence(PersistenceError::MultipleRoots {
                        table: self.table.clone(),
                    }));
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(c) => return Outcome::Cancelled(c),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        };

        let parent_right = match self.bound(cx, parent_id, &self.right).await {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(c) => return Outcome::Cancelled(c),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        // The new node becomes the last child of its parent, taking over
        // the parent's old right bound.
        let sql = format!(
            "UPDATE {t} SET \
             {l} = CASE WHEN {l} > {pr} THEN {l} + 2 ELSE {l} END, \
             {r} = CASE WHEN {r} >= {pr} THEN {r} + 2 ELSE {r} END \
             WHERE {l} > {pr} OR {r} >= {pr}",
            t = quote_ident(&self.table),
            l = quote_ident(&self.left),
            r = quote_ident(&self.right),
            pr = parent_right
        );
        match self.runner.execute(cx, &sql, &[]).await {
            Outcome::Ok(_) => Outcome::Ok(NestedSetBounds {
                left: parent_right,
                right: parent_right + 1,
            }),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(c) => Outcome::Cancelled(c),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Move a node's subtree under a new parent.
    ///
    /// The subtree interval and the region displaced by it are shifted in
    /// one statement. Moving a node to no parent is left alone: the root
    /// cannot be vacated without re-rooting the whole tree.
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
        let Some(new_parent_id) = new_parent_id else {
            debug!(table = %self.table, "nested-set move to root ignored");
            return Outcome::Ok(());
        };

        let (left, right) = match self.bounds(cx, id).await {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(c) => return Outcome::Cancelled(c),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let parent_right = match self.bound(cx, new_parent_id, &self.right).await {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(c) => return Outcome::Cancelled(c),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        if parent_right > left && parent_right < right {
            return Outcome::Err(Error::Custom(format!(
                "cannot move a node of \"{}\" under its own descendant",
                self.table
            )));
        }

        let width = right - left + 1;
        // Shift the subtree by `offset` and close/open the displaced
        // region by the subtree width in the opposite direction.
        let (offset, region_lo, region_hi, region_shift) = if parent_right > right {
            (parent_right - width - left, right + 1, parent_right - 1, -width)
        } else {
            (parent_right - left, parent_right, left - 1, width)
        };
        if offset == 0 {
            return Outcome::Ok(());
        }

        let sql = format!(
            "UPDATE {t} SET \
             {l} = CASE \
             WHEN {l} BETWEEN {left} AND {right} THEN {l} + {offset} \
             WHEN {l} BETWEEN {lo} AND {hi} THEN {l} + {shift} \
             ELSE {l} END, \
             {r} = CASE \
             WHEN {r} BETWEEN {left} AND {right} THEN {r} + {offset} \
             WHEN {r} BETWEEN {lo} AND {hi} THEN {r} + {shift} \
             ELSE {r} END \
             WHERE {l} BETWEEN {span_lo} AND {span_hi} \
             OR {r} BETWEEN {span_lo} AND {span_hi}",
            t = quote_ident(&self.table),
            l = quote_ident(&self.left),
            r = quote_ident(&self.right),
            lo = region_lo,
            hi = region_hi,
            shift = region_shift,
            span_lo = left.min(region_lo),
            span_hi = right.max(region_hi),
        );
        debug!(table = %self.table, offset, width, "nested-set move");
        match self.runner.execute(cx, &sql, &[]).await {
            Outcome::Ok(_) => Outcome::Ok(()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(c) => Outcome::Cancelled(c),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Close the interval gaps left by removed nodes.
    ///
    /// Runs before the row deletes. Intervals are processed right-to-left
    /// so earlier gap closings do not move later intervals.
    pub async fn remove(&self, cx: &Cx, ids: &[Value]) -> Outcome<(), Error> {
        let mut intervals = Vec::with_capacity(ids.len());
        for id in ids {
            match self.bounds(cx, id).await {
                Outcome::Ok(v) => intervals.push(v),
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(c) => return Outcome::Cancelled(c),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        intervals.sort_by_key(|(_, right)| std::cmp::Reverse(*right));

        for (left, right) in intervals {
            let width = right - left + 1;
            let sql = format!(
                "UPDATE {t} SET \
                 {l} = CASE WHEN {l} > {right} THEN {l} - {width} ELSE {l} END, \
                 {r} = CASE WHEN {r} > {right} THEN {r} - {width} ELSE {r} END \
                 WHERE {l} > {right} OR {r} > {right}",
                t = quote_ident(&self.table),
                l = quote_ident(&self.left),
                r = quote_ident(&self.right),
            );
            match self.runner.execute(cx, &sql, &[]).await {
                Outcome::Ok(_) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(c) => return Outcome::Cancelled(c),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(())
    }

    async fn bound(&self, cx: &Cx, id: &Value, column: &str) -> Outcome<i64, Error> {
        let sql = format!(
            "SELECT {c} FROM {t} WHERE {p} = $1",
            t = quote_ident(&self.table),
            c = quote_ident(column),
            p = quote_ident(&self.primary)
        );
        match self.runner.query_one(cx, &sql, &[id.clone()]).await {
            Outcome::Ok(Some(row)) => match row.get(0).and_then(Value::as_i64) {
                Some(v) => Outcome::Ok(v),
                None => Outcome::Err(Error::Custom(format!(
                    "nested-set bound \"{column}\" of \"{}\" is not an integer",
                    self.table
                ))),
            },
            Outcome::Ok(None) => Outcome::Err(Error::Persistence(
                PersistenceError::CannotAttachTreeChildren {
                    table: self.table.clone(),
                },
            )),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(c) => Outcome::Cancelled(c),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    async fn bounds(&self, cx: &Cx, id: &Value) -> Outcome<(i64, i64), Error> {
        let sql = format!(
            "SELECT {l}, {r} FROM {t} WHERE {p} = $1",
            t = quote_ident(&self.table),
            l = quote_ident(&self.left),
            r = quote_ident(&self.right),
            p = quote_ident(&self.primary)
        );
        match self.runner.query_one(cx, &sql, &[id.clone()]).await {
            Outcome::Ok(Some(row)) => {
                let left = row.get(0).and_then(Value::as_i64);
                let right = row.get(1).and_then(Value::as_i64);
                match (left, right) {
                    (Some(l), Some(r)) => Outcome::Ok((l, r)),
                    _ => Outcome::Err(Error::Custom(format!(
                        "nested-set bounds of \"{}\" are not integers",
                        self.table
                    ))),
                }
            }
            Outcome::Ok(None) => Outcome::Err(Error::Persistence(
                PersistenceError::CannotAttachTreeChildren {
                    table: self.table.clone(),
                },
            )),
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
        ColumnMetadata, JoinColumn, RelationKind, RelationMetadata, Row, TreeMetadata,
    };

    fn metadata() -> Arc<EntityMetadata> {
        Arc::new(
            EntityMetadata::new("category", "category")
                .column(ColumnMetadata::new("id").primary())
                .relation(
                    RelationMetadata::new("parent", RelationKind::ManyToOne, "category")
                        .join_on(vec![JoinColumn::new("parent_id", "id")]),
                )
                .with_tree(TreeMetadata::nested_set("parent", "nsleft", "nsright")),
        )
    }

    fn int_row(columns: &[&str], values: &[i64]) -> Row {
        Row::new(
            columns.iter().map(|c| (*c).to_string()).collect(),
            values.iter().map(|v| Value::BigInt(*v)).collect(),
        )
    }

    #[test]
    fn test_first_root_gets_unit_interval() {
        run_test(|cx, runner: MockQueryRunner| async move {
            runner.push_query_result(vec![]);
            let metadata = metadata();
            let executor = NestedSetTreeExecutor::new(&runner, &metadata).unwrap();
            let bounds = unwrap_outcome(executor.insert(&cx, None).await);
            assert_eq!(bounds, NestedSetBounds { left: 1, right: 2 });
            assert!(runner.executed().is_empty());
        });
    }

    #[test]
    fn test_second_root_rejected_before_any_write() {
        run_test(|cx, runner: MockQueryRunner| async move {
            runner.push_query_result(vec![int_row(&["id"], &[1])]);
            let metadata = metadata();
            let executor = NestedSetTreeExecutor::new(&runner, &metadata).unwrap();
            let outcome = executor.insert(&cx, None).await;
            match outcome {
                Outcome::Err(Error::Persistence(PersistenceError::MultipleRoots { table })) => {
                    assert_eq!(table, "category");
                }
                other => panic!("expected MultipleRoots, got {other:?}"),
            }
            assert!(runner.executed().is_empty());
        });
    }

    #[test]
    fn test_child_insert_opens_gap_at_parent_right() {
        run_test(|cx, runner: MockQueryRunner| async move {
            // Parent has interval (1, 4).
            runner.push_query_result(vec![int_row(&["nsright"], &[4])]);
            let metadata = metadata();
            let executor = NestedSetTreeExecutor::new(&runner, &metadata).unwrap();
            let bounds = unwrap_outcome(executor.insert(&cx, Some(&Value::BigInt(1))).await);
            assert_eq!(bounds, NestedSetBounds { left: 4, right: 5 });
            let executed = runner.executed();
            assert_eq!(executed.len(), 1);
            assert!(executed[0].0.contains("\"nsleft\" > 4 THEN \"nsleft\" + 2"));
            assert!(executed[0].0.contains("\"nsright\" >= 4 THEN \"nsright\" + 2"));
        });
    }

    /// Tree root(1,10), A(2,5){a(3,4)}, B(6,9){b(7,8)}; moving A under B
    /// shifts the subtree by +3 and the displaced region [6,8] by -4.
    #[test]
    fn test_move_right_shifts_subtree_and_region() {
        run_test(|cx, runner: MockQueryRunner| async move {
            runner.push_query_result(vec![int_row(&["nsleft", "nsright"], &[2, 5])]);
            runner.push_query_result(vec![int_row(&["nsright"], &[9])]);
            let metadata = metadata();
            let executor = NestedSetTreeExecutor::new(&runner, &metadata).unwrap();
            unwrap_outcome(
                executor
                    .update(
                        &cx,
                        &Value::BigInt(2),
                        Some(&Value::BigInt(1)),
                        Some(&Value::BigInt(3)),
                    )
                    .await,
            );
            let executed = runner.executed();
            assert_eq!(executed.len(), 1);
            let sql = &executed[0].0;
            assert!(sql.contains("BETWEEN 2 AND 5 THEN \"nsleft\" + 3"));
            assert!(sql.contains("BETWEEN 6 AND 8 THEN \"nsleft\" + -4"));
        });
    }

    #[test]
    fn test_move_under_own_descendant_rejected() {
        run_test(|cx, runner: MockQueryRunner| async move {
            runner.push_query_result(vec![int_row(&["nsleft", "nsright"], &[2, 9])]);
            // The target parent's right bound lies inside (2, 9).
            runner.push_query_result(vec![int_row(&["nsright"], &[6])]);
            let metadata = metadata();
            let executor = NestedSetTreeExecutor::new(&runner, &metadata).unwrap();
            let outcome = executor
                .update(
                    &cx,
                    &Value::BigInt(2),
                    Some(&Value::BigInt(1)),
                    Some(&Value::BigInt(4)),
                )
                .await;
            assert!(matches!(outcome, Outcome::Err(Error::Custom(_))));
            assert!(runner.executed().is_empty());
        });
    }

    #[test]
    fn test_move_to_same_position_writes_nothing() {
        run_test(|cx, runner: MockQueryRunner| async move {
            // A(6,9) moved under a parent whose right bound is 6: the
            // subtree already sits exactly there.
            runner.push_query_result(vec![int_row(&["nsleft", "nsright"], &[6, 9])]);
            runner.push_query_result(vec![int_row(&["nsright"], &[6])]);
            let metadata = metadata();
            let executor = NestedSetTreeExecutor::new(&runner, &metadata).unwrap();
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
            assert!(runner.executed().is_empty());
        });
    }

    #[test]
    fn test_same_parent_is_noop_without_queries() {
        run_test(|cx, runner: MockQueryRunner| async move {
            let metadata = metadata();
            let executor = NestedSetTreeExecutor::new(&runner, &metadata).unwrap();
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
            assert!(runner.queries().is_empty());
        });
    }

    #[test]
    fn test_remove_closes_gap() {
        run_test(|cx, runner: MockQueryRunner| async move {
            runner.push_query_result(vec![int_row(&["nsleft", "nsright"], &[3, 4])]);
            let metadata = metadata();
            let executor = NestedSetTreeExecutor::new(&runner, &metadata).unwrap();
            unwrap_outcome(executor.remove(&cx, &[Value::BigInt(2)]).await);
            let executed = runner.executed();
            assert_eq!(executed.len(), 1);
            assert!(executed[0].0.contains("\"nsleft\" > 4 THEN \"nsleft\" - 2"));
            assert!(executed[0].0.contains("\"nsright\" > 4 THEN \"nsright\" - 2"));
        });
    }
}

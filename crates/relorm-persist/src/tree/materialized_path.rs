//! Materialized-path maintenance.
//!
//! Every node stores the dot-terminated id chain from the root down to
//! itself ("1.4.9."). A node's subtree is a prefix match on that column,
//! so moving a subtree is a single prefix rewrite. Removal needs no
//! bookkeeping: paths of surviving rows do not reference removed siblings.

use crate::tree::{parent_fk_column, single_primary_column};
use relorm_core::{
    Cx, EntityMetadata, Error, Outcome, PersistenceError, QueryRunner, Result, TreeType, Value,
    quote_ident,
};
use std::sync::Arc;
use tracing::debug;

/// Maintains the path column on a materialized-path entity.
pub struct MaterializedPathTreeExecutor<'a, R: QueryRunner> {
    runner: &'a R,
    table: String,
    primary: String,
    path: String,
}

impl<'a, R: QueryRunner> MaterializedPathTreeExecutor<'a, R> {
    /// Create an executor for a materialized-path entity.
    pub fn new(runner: &'a R, metadata: &Arc<EntityMetadata>) -> Result<Self> {
        let tree = metadata
            .tree
            .as_ref()
            .filter(|t| t.tree_type == TreeType::MaterializedPath)
            .ok_or_else(|| {
                Error::Custom(format!(
                    "\"{}\" is not a materialized-path tree entity",
                    metadata.table_path
                ))
            })?;
        let path = tree.path_column.clone().ok_or_else(|| {
            Error::Custom(format!(
                "materialized-path entity \"{}\" is missing its path column",
                metadata.table_path
            ))
        })?;
        // The parent relation must exist even though the path itself is
        // keyed by primary ids.
        parent_fk_column(metadata)?;
        Ok(Self {
            runner,
            table: metadata.table_path.clone(),
            primary: single_primary_column(metadata)?,
            path,
        })
    }

    /// Write the path of a freshly inserted node and return it.
    ///
    /// Runs after the row insert, because the path embeds the node's own
    /// (possibly database-generated) id.
    pub async fn insert(
        &self,
        cx: &Cx,
        id: &Value,
        parent_id: Option<&Value>,
    ) -> Outcome<Value, Error> {
        let parent_path = match parent_id {
            None => String::new(),
            Some(parent_id) => match self.path_of(cx, parent_id).await {
                Outcome::Ok(p) => p,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(c) => return Outcome::Cancelled(c),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            },
        };
        let path = format!("{parent_path}{id}.");

        let sql = format!(
            "UPDATE {t} SET {c} = $1 WHERE {p} = $2",
            t = quote_ident(&self.table),
            c = quote_ident(&self.path),
            p = quote_ident(&self.primary)
        );
        match self
            .runner
            .execute(cx, &sql, &[Value::Text(path.clone()), id.clone()])
            .await
        {
            Outcome::Ok(_) => Outcome::Ok(Value::Text(path)),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(c) => Outcome::Cancelled(c),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Rewrite the path prefix of a moved node's subtree.
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

        let old_prefix = match self.path_of(cx, id).await {
            Outcome::Ok(p) => p,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(c) => return Outcome::Cancelled(c),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let parent_path = match new_parent_id {
            None => String::new(),
            Some(parent_id) => match self.path_of(cx, parent_id).await {
                Outcome::Ok(p) => p,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(c) => return Outcome::Cancelled(c),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            },
        };
        let new_prefix = format!("{parent_path}{id}.");
        if new_prefix == old_prefix {
            return Outcome::Ok(());
        }
        if new_prefix.starts_with(&old_prefix) {
            return Outcome::Err(Error::Custom(format!(
                "cannot move a node of \"{}\" under its own descendant",
                self.table
            )));
        }

        // One prefix rewrite covers the node and its whole subtree.
        let sql = format!(
            "UPDATE {t} SET {c} = REPLACE({c}, $1, $2) WHERE {c} LIKE $3",
            t = quote_ident(&self.table),
            c = quote_ident(&self.path)
        );
        debug!(table = %self.table, %old_prefix, %new_prefix, "materialized-path move");
        match self
            .runner
            .execute(
                cx,
                &sql,
                &[
                    Value::Text(old_prefix.clone()),
                    Value::Text(new_prefix),
                    Value::Text(format!("{old_prefix}%")),
                ],
            )
            .await
        {
            Outcome::Ok(_) => Outcome::Ok(()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(c) => Outcome::Cancelled(c),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    async fn path_of(&self, cx: &Cx, id: &Value) -> Outcome<String, Error> {
        let sql = format!(
            "SELECT {c} FROM {t} WHERE {p} = $1",
            t = quote_ident(&self.table),
            c = quote_ident(&self.path),
            p = quote_ident(&self.primary)
        );
        match self.runner.query_one(cx, &sql, &[id.clone()]).await {
            Outcome::Ok(Some(row)) => match row.get(0).and_then(Value::as_str) {
                Some(p) => Outcome::Ok(p.to_string()),
                None => Outcome::Err(Error::Custom(format!(
                    "materialized path of \"{}\" is not text",
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
}

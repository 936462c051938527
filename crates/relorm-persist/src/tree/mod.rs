//! Tree-encoding maintenance.
//!
//! Three strategies, one per [`TreeType`]: closure table, nested set, and
//! materialized path. Each executor owns the hand-written SQL its encoding
//! needs and is driven by the subject executor around the row writes. Tree
//! entities use a single-column primary key.
//!
//! [`TreeType`]: relorm_core::TreeType

pub mod closure;
pub mod materialized_path;
pub mod nested_set;

pub use closure::ClosureTreeExecutor;
pub use materialized_path::MaterializedPathTreeExecutor;
pub use nested_set::{NestedSetBounds, NestedSetTreeExecutor};

use relorm_core::{EntityMetadata, Error, Result};

/// The single primary-key column of a tree entity.
pub(crate) fn single_primary_column(metadata: &EntityMetadata) -> Result<String> {
    let mut primaries = metadata.primary_columns();
    let first = primaries.next().ok_or_else(|| {
        Error::Custom(format!(
            "tree entity \"{}\" has no primary column",
            metadata.table_path
        ))
    })?;
    if primaries.next().is_some() {
        return Err(Error::Custom(format!(
            "tree entity \"{}\" must use a single-column primary key",
            metadata.table_path
        )));
    }
    Ok(first.database_name.clone())
}

/// The foreign-key column of the tree parent relation.
pub(crate) fn parent_fk_column(metadata: &EntityMetadata) -> Result<String> {
    let tree = metadata
        .tree
        .as_ref()
        .ok_or_else(|| Error::Custom(format!("\"{}\" is not a tree entity", metadata.table_path)))?;
    let relation = metadata
        .find_relation(&tree.parent_relation)
        .ok_or_else(|| {
            Error::Custom(format!(
                "tree parent relation \"{}\" not found on \"{}\"",
                tree.parent_relation, metadata.table_path
            ))
        })?;
    relation
        .join_columns
        .first()
        .map(|jc| jc.name.clone())
        .ok_or_else(|| {
            Error::Custom(format!(
                "tree parent relation \"{}\" has no join column",
                tree.parent_relation
            ))
        })
}

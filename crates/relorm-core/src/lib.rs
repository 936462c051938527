//! Core types and traits for the relorm persistence engine.
//!
//! This crate provides the foundational abstractions consumed by
//! `relorm-persist`:
//!
//! - `Value` and `Row` for dynamically-typed SQL data
//! - `EntityMetadata` describing entity types (columns, relations, trees)
//! - `EntityData` / `ObjectLiteral` for in-memory entity objects
//! - `QueryRunner` trait and `DriverCapabilities` for the driver seam
//! - Write-statement builders rendering parameterized SQL
//! - `Outcome`/`Cx` re-exports from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod driver;
pub mod entity;
pub mod error;
pub mod metadata;
pub mod row;
pub mod statement;
pub mod value;

pub use driver::{DriverCapabilities, QueryRunner};
pub use entity::{
    EntityData, EntityRef, ObjectLiteral, RelationValue, compare_ids, entity_from_values,
    format_id,
};
pub use error::{Error, PersistenceError, QueryError, Result, TransactionError};
pub use metadata::{
    ClosureJunction, ColumnMetadata, EntityMetadata, GenerationStrategy, JoinColumn,
    JunctionMetadata, MetadataRegistry, OrphanedRowAction, RelationKind, RelationMetadata,
    TreeMetadata, TreeType, ValueTransformer,
};
pub use row::{ColumnInfo, Row};
pub use statement::{DeleteStatement, InsertStatement, UpdateStatement, quote_ident};
pub use value::Value;

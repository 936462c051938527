//! Persistence and change-computation engine for relorm.
//!
//! `relorm-persist` is the **unit-of-work layer**. Given a graph of entity
//! objects the caller wants to save or remove, it determines the minimal,
//! correctly ordered set of database operations, handles self-referential
//! and cascading relations, and maintains three tree encodings (closure
//! table, nested set, materialized path) transactionally.
//!
//! # Role In The Architecture
//!
//! - **Subjects**: one record per entity pairing in-memory state with its
//!   database counterpart and the operation to perform.
//! - **Subject builders**: expand the subject set with operations implied
//!   by relations (one-to-many reconciliation, junction rows, cascades).
//! - **Ordered execution**: dependency-aware insert/delete ordering, bulk
//!   grouping, and tree bookkeeping, all on one `QueryRunner`.
//!
//! # Design Philosophy
//!
//! - **Explicit over implicit**: intents are booleans on the subject, the
//!   executor derives operations from them, nothing happens as a side
//!   effect of object access.
//! - **Capabilities over driver types**: the engine branches on a
//!   `DriverCapabilities` descriptor, never on a concrete driver.
//! - **Cancel-correct**: all async operations use `Cx` + `Outcome` via
//!   `relorm-core`.
//!
//! # Example
//!
//! ```ignore
//! let persist = EntityPersistExecutor::new(&runner, &registry);
//! persist
//!     .execute(&cx, PersistMode::Save, "post", entities, &PersistOptions::default())
//!     .await?;
//! ```

pub mod broadcaster;
pub mod builders;
pub mod diff;
pub mod executor;
pub mod loader;
pub mod persist;
pub mod subject;
pub mod topology;
pub mod tree;

pub use broadcaster::{Broadcaster, ListenerEvent};
pub use builders::{
    CascadesSubjectBuilder, ManyToManySubjectBuilder, OneToManySubjectBuilder,
    OneToOneInverseSideSubjectBuilder,
};
pub use diff::ChangedColumnsComputer;
pub use executor::{ExecutorOptions, SubjectExecutor};
pub use loader::SubjectDatabaseLoader;
pub use persist::{EntityPersistExecutor, PersistMode, PersistOptions};
pub use subject::{ChangeMap, ChangeValue, Subject, SubjectId, SubjectSet};
pub use topology::DependencyGraph;
pub use tree::{
    ClosureTreeExecutor, MaterializedPathTreeExecutor, NestedSetBounds, NestedSetTreeExecutor,
};

#[cfg(test)]
pub(crate) mod test_support;

//! Driver seam for the persistence engine.
//!
//! The engine never talks to a database directly; it issues SQL through a
//! [`QueryRunner`] and adapts its plans to a [`DriverCapabilities`]
//! descriptor. Capability flags replace driver-type checks: the engine
//! asks "can this driver do X" instead of "is this driver Y".
//!
//! All operations integrate with asupersync's structured concurrency via
//! `Cx` context for proper cancellation and timeout handling.

use crate::error::Error;
use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};
use std::future::Future;

/// What a driver can do, declared up front.
///
/// Every field changes how the engine plans statements; none of them
/// change what the statements mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverCapabilities {
    /// `INSERT .. RETURNING` / `UPDATE .. RETURNING` is available, so
    /// generated columns come back with the write itself.
    pub returning_sql_supported: bool,
    /// The database generates UUID primary keys itself. When false, the
    /// engine generates them client-side before the insert.
    pub uuid_generation_supported: bool,
    /// Multi-row `VALUES` lists are supported for inserts.
    pub bulk_insert_supported: bool,
    /// Deletes against a single-column primary key may be grouped into
    /// one `IN (..)` statement.
    pub delete_grouping_supported: bool,
    /// DML participates in transactions. When false, the engine issues
    /// statements without a surrounding transaction.
    pub transactional_dml: bool,
    /// The database cascades junction-row deletion via foreign keys, so
    /// the engine skips explicit junction cleanups on entity removal.
    pub cascades_junction_on_delete: bool,
}

impl DriverCapabilities {
    /// Capabilities of a PostgreSQL-class driver.
    #[must_use]
    pub const fn postgres() -> Self {
        Self {
            returning_sql_supported: true,
            uuid_generation_supported: true,
            bulk_insert_supported: true,
            delete_grouping_supported: true,
            transactional_dml: true,
            cascades_junction_on_delete: true,
        }
    }

    /// Capabilities of a SQLite-class driver.
    #[must_use]
    pub const fn sqlite() -> Self {
        Self {
            returning_sql_supported: true,
            uuid_generation_supported: false,
            bulk_insert_supported: true,
            delete_grouping_supported: true,
            transactional_dml: true,
            cascades_junction_on_delete: true,
        }
    }

    /// Capabilities of a MySQL-class driver.
    #[must_use]
    pub const fn mysql() -> Self {
        Self {
            returning_sql_supported: false,
            uuid_generation_supported: false,
            bulk_insert_supported: true,
            delete_grouping_supported: true,
            transactional_dml: true,
            cascades_junction_on_delete: true,
        }
    }

    /// Capabilities of a SQL-Server-class driver. Multiple cascade paths
    /// are rejected by the database, so junction rows need explicit
    /// cleanup on removal.
    #[must_use]
    pub const fn sqlserver() -> Self {
        Self {
            returning_sql_supported: true,
            uuid_generation_supported: true,
            bulk_insert_supported: true,
            delete_grouping_supported: true,
            transactional_dml: true,
            cascades_junction_on_delete: false,
        }
    }
}

impl Default for DriverCapabilities {
    fn default() -> Self {
        Self::postgres()
    }
}

/// A single database session the engine runs all its statements on.
///
/// One persistence run uses exactly one runner, so statement ordering is
/// the runner's execution order. Transactions are managed on the runner
/// itself (`start`/`commit`/`rollback`) rather than through a separate
/// transaction value, because the engine must detect and reuse an
/// externally started transaction.
///
/// All operations are async and take a `Cx` context for
/// cancellation/timeout support.
pub trait QueryRunner: Send + Sync {
    /// The capability descriptor of the underlying driver.
    fn capabilities(&self) -> DriverCapabilities;

    /// Whether a transaction is currently active on this runner.
    fn is_transaction_active(&self) -> bool;

    /// Execute a query and return all rows.
    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;

    /// Execute a query and return the first row, if any.
    fn query_one(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send {
        async move {
            match self.query(cx, sql, params).await {
                Outcome::Ok(rows) => Outcome::Ok(rows.into_iter().next()),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(c) => Outcome::Cancelled(c),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            }
        }
    }

    /// Execute a statement (INSERT, UPDATE, DELETE) and return rows affected.
    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Execute an INSERT and return the last inserted row id.
    ///
    /// Used for increment-generated keys on drivers without
    /// `RETURNING` support.
    fn insert(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send;

    /// Start a transaction on this runner.
    fn start_transaction(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Commit the active transaction.
    fn commit_transaction(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Roll back the active transaction.
    fn rollback_transaction(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_postgres() {
        assert_eq!(DriverCapabilities::default(), DriverCapabilities::postgres());
    }

    #[test]
    fn test_mysql_has_no_returning() {
        let caps = DriverCapabilities::mysql();
        assert!(!caps.returning_sql_supported);
        assert!(caps.bulk_insert_supported);
    }

    #[test]
    fn test_sqlite_generates_uuids_client_side() {
        assert!(!DriverCapabilities::sqlite().uuid_generation_supported);
        assert!(DriverCapabilities::postgres().uuid_generation_supported);
    }
}

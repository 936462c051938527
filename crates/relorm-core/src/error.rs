//! Error types for relorm operations.

use std::fmt;

/// Convenience result alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// The primary error type for all relorm operations.
#[derive(Debug)]
pub enum Error {
    /// Query execution errors
    Query(QueryError),
    /// Transaction errors
    Transaction(TransactionError),
    /// Persistence-engine errors (validation and invariant violations)
    Persistence(PersistenceError),
    /// Serialization/deserialization errors
    Serde(String),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

/// Error raised while executing a SQL statement.
#[derive(Debug)]
pub struct QueryError {
    /// The failure category.
    pub kind: QueryErrorKind,
    /// The SQL text, when known.
    pub sql: Option<String>,
    /// Driver-provided message.
    pub message: String,
}

/// Category of a query failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Other database error
    Database,
}

/// Error raised while managing a transaction.
#[derive(Debug)]
pub struct TransactionError {
    /// The failure category.
    pub kind: TransactionErrorKind,
    /// Human-readable message.
    pub message: String,
}

/// Category of a transaction failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// A transaction is already active on this runner
    AlreadyActive,
    /// No transaction is active on this runner
    NotActive,
    /// Commit failed
    CommitFailed,
    /// Rollback failed
    RollbackFailed,
}

/// Errors raised by the persistence/change-computation engine.
///
/// Validation errors are raised before any I/O; `MissingIdentifier` marks
/// an internal invariant violation and indicates a bug in subject
/// preparation rather than bad user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    /// A subject was flagged both for update and for removal.
    UpdateAndRemoveConflict {
        /// The entity name of the conflicting subject.
        entity: String,
    },
    /// A cycle of non-nullable relations makes ordered persistence impossible.
    CircularRelations {
        /// Entity names along the detected cycle.
        path: Vec<String>,
    },
    /// A nested-set tree already has a root and a second one was attached.
    MultipleRoots {
        /// Table path of the tree entity.
        table: String,
    },
    /// A tree child was attached under a parent whose id is not resolvable.
    CannotAttachTreeChildren {
        /// Table path of the tree entity.
        table: String,
    },
    /// An operation that requires a resolved identifier ran without one.
    MissingIdentifier {
        /// The operation that was attempted (insert, update, delete, ...).
        operation: &'static str,
        /// Table path of the affected entity.
        table: String,
    },
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistenceError::UpdateAndRemoveConflict { entity } => write!(
                f,
                "subject for \"{entity}\" is marked both for update and for removal"
            ),
            PersistenceError::CircularRelations { path } => write!(
                f,
                "circular non-nullable relations detected: {}",
                path.join(" -> ")
            ),
            PersistenceError::MultipleRoots { table } => {
                write!(f, "nested-set tree \"{table}\" already has a root row")
            }
            PersistenceError::CannotAttachTreeChildren { table } => write!(
                f,
                "cannot attach tree children in \"{table}\": parent identifier is not resolved"
            ),
            PersistenceError::MissingIdentifier { operation, table } => write!(
                f,
                "cannot {operation} row in \"{table}\": subject identifier is missing"
            ),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Query(e) => {
                write!(f, "query error ({:?}): {}", e.kind, e.message)?;
                if let Some(sql) = &e.sql {
                    write!(f, " [sql: {sql}]")?;
                }
                Ok(())
            }
            Error::Transaction(e) => write!(f, "transaction error ({:?}): {}", e.kind, e.message),
            Error::Persistence(e) => write!(f, "{e}"),
            Error::Serde(msg) => write!(f, "serialization error: {msg}"),
            Error::Cancelled => write!(f, "operation cancelled"),
            Error::Custom(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<PersistenceError> for Error {
    fn from(e: PersistenceError) -> Self {
        Error::Persistence(e)
    }
}

impl Error {
    /// Build a query error with the given kind and message.
    pub fn query(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Error::Query(QueryError {
            kind,
            sql: None,
            message: message.into(),
        })
    }

    /// Build a query error carrying the failing SQL text.
    pub fn query_with_sql(
        kind: QueryErrorKind,
        sql: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Query(QueryError {
            kind,
            sql: Some(sql.into()),
            message: message.into(),
        })
    }

    /// Build a transaction error.
    pub fn transaction(kind: TransactionErrorKind, message: impl Into<String>) -> Self {
        Error::Transaction(TransactionError {
            kind,
            message: message.into(),
        })
    }

    /// Check whether this error is a database constraint violation.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            Error::Query(QueryError {
                kind: QueryErrorKind::Constraint,
                ..
            })
        )
    }

    /// Check whether this error came from the persistence validation layer.
    pub fn is_persistence_error(&self) -> bool {
        matches!(self, Error::Persistence(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistence_error_display() {
        let err = PersistenceError::CircularRelations {
            path: vec!["post".into(), "author".into(), "post".into()],
        };
        assert_eq!(
            err.to_string(),
            "circular non-nullable relations detected: post -> author -> post"
        );
    }

    #[test]
    fn test_missing_identifier_display() {
        let err = PersistenceError::MissingIdentifier {
            operation: "update",
            table: "category".into(),
        };
        assert!(err.to_string().contains("cannot update"));
        assert!(err.to_string().contains("category"));
    }

    #[test]
    fn test_constraint_predicate() {
        let err = Error::query(QueryErrorKind::Constraint, "duplicate key");
        assert!(err.is_constraint_violation());
        assert!(!Error::Cancelled.is_constraint_violation());
    }

    #[test]
    fn test_query_error_display_includes_sql() {
        let err = Error::query_with_sql(QueryErrorKind::Syntax, "SELEC 1", "near SELEC");
        let text = err.to_string();
        assert!(text.contains("SELEC 1"));
        assert!(text.contains("near SELEC"));
    }
}

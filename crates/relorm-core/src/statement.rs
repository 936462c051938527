//! Write-statement builders.
//!
//! Builders assemble parameterized INSERT/UPDATE/DELETE text from column
//! maps. The engine decides what to write; these types only decide how
//! the SQL is spelled. Placeholders are always `$n`.

use crate::entity::ObjectLiteral;
use crate::value::Value;
use std::fmt::Write as _;

/// Quote an identifier for SQL text.
pub fn quote_ident(name: &str) -> String {
    format!("\"{name}\"")
}

/// Builder for an INSERT statement, optionally multi-row.
#[derive(Debug)]
pub struct InsertStatement {
    table: String,
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
    returning: Vec<String>,
}

impl InsertStatement {
    /// Start an insert into the given table.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            rows: Vec::new(),
            returning: Vec::new(),
        }
    }

    /// Set the column list.
    pub fn columns(mut self, columns: Vec<String>) -> Self {
        self.columns = columns;
        self
    }

    /// Append one row of values, aligned with the column list.
    pub fn row(mut self, values: Vec<Value>) -> Self {
        debug_assert_eq!(values.len(), self.columns.len());
        self.rows.push(values);
        self
    }

    /// Append a row taken from a column-value map, in column-list order.
    /// Missing columns insert the SQL DEFAULT.
    pub fn row_from(self, values: &ObjectLiteral) -> Self {
        let row = self
            .columns
            .iter()
            .map(|c| values.get(c).cloned().unwrap_or(Value::Default))
            .collect();
        self.row(row)
    }

    /// Set the RETURNING column list. Only emitted when non-empty; the
    /// caller gates this on driver capabilities.
    pub fn returning(mut self, columns: Vec<String>) -> Self {
        self.returning = columns;
        self
    }

    /// Number of rows queued so far.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Render to SQL text and bound parameters.
    ///
    /// `Value::Default` is spelled inline as the DEFAULT keyword rather
    /// than bound as a parameter.
    pub fn build(&self) -> (String, Vec<Value>) {
        let mut sql = format!("INSERT INTO {}", quote_ident(&self.table));
        let mut params = Vec::new();

        if self.columns.is_empty() {
            sql.push_str(" DEFAULT VALUES");
        } else {
            let cols: Vec<String> = self.columns.iter().map(|c| quote_ident(c)).collect();
            let _ = write!(sql, " ({}) VALUES ", cols.join(", "));

            let mut groups = Vec::with_capacity(self.rows.len());
            for row in &self.rows {
                let mut placeholders = Vec::with_capacity(row.len());
                for value in row {
                    if matches!(value, Value::Default) {
                        placeholders.push("DEFAULT".to_string());
                    } else {
                        params.push(value.clone());
                        placeholders.push(format!("${}", params.len()));
                    }
                }
                groups.push(format!("({})", placeholders.join(", ")));
            }
            sql.push_str(&groups.join(", "));
        }

        if !self.returning.is_empty() {
            let cols: Vec<String> = self.returning.iter().map(|c| quote_ident(c)).collect();
            let _ = write!(sql, " RETURNING {}", cols.join(", "));
        }

        (sql, params)
    }
}

/// Builder for an UPDATE statement against one row.
#[derive(Debug)]
pub struct UpdateStatement {
    table: String,
    assignments: Vec<(String, Value)>,
    condition: ObjectLiteral,
    returning: Vec<String>,
}

impl UpdateStatement {
    /// Start an update against the given table.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            assignments: Vec::new(),
            condition: ObjectLiteral::new(),
            returning: Vec::new(),
        }
    }

    /// Add a SET assignment.
    pub fn set(mut self, column: impl Into<String>, value: Value) -> Self {
        self.assignments.push((column.into(), value));
        self
    }

    /// Add all assignments from a column-value map.
    pub fn set_all(mut self, values: &ObjectLiteral) -> Self {
        for (column, value) in values {
            self.assignments.push((column.clone(), value.clone()));
        }
        self
    }

    /// Set the WHERE condition (all pairs are AND-ed).
    pub fn filter(mut self, condition: ObjectLiteral) -> Self {
        self.condition = condition;
        self
    }

    /// Set the RETURNING column list (capability-gated by the caller).
    pub fn returning(mut self, columns: Vec<String>) -> Self {
        self.returning = columns;
        self
    }

    /// Whether any assignments have been queued.
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Render to SQL text and bound parameters. NULL condition values
    /// are spelled `IS NULL`.
    pub fn build(&self) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let mut sets = Vec::with_capacity(self.assignments.len());
        for (column, value) in &self.assignments {
            if matches!(value, Value::Default) {
                sets.push(format!("{} = DEFAULT", quote_ident(column)));
            } else {
                params.push(value.clone());
                sets.push(format!("{} = ${}", quote_ident(column), params.len()));
            }
        }

        let mut sql = format!(
            "UPDATE {} SET {}",
            quote_ident(&self.table),
            sets.join(", ")
        );

        if !self.condition.is_empty() {
            let mut clauses = Vec::with_capacity(self.condition.len());
            for (column, value) in &self.condition {
                if value.is_null() {
                    clauses.push(format!("{} IS NULL", quote_ident(column)));
                } else {
                    params.push(value.clone());
                    clauses.push(format!("{} = ${}", quote_ident(column), params.len()));
                }
            }
            let _ = write!(sql, " WHERE {}", clauses.join(" AND "));
        }

        if !self.returning.is_empty() {
            let cols: Vec<String> = self.returning.iter().map(|c| quote_ident(c)).collect();
            let _ = write!(sql, " RETURNING {}", cols.join(", "));
        }

        (sql, params)
    }
}

/// Builder for DELETE statements over a batch of identifiers.
#[derive(Debug)]
pub struct DeleteStatement {
    table: String,
    ids: Vec<ObjectLiteral>,
}

impl DeleteStatement {
    /// Start a delete against the given table.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ids: Vec::new(),
        }
    }

    /// Queue one identifier map for deletion.
    pub fn id(mut self, id: ObjectLiteral) -> Self {
        self.ids.push(id);
        self
    }

    /// Whether any identifiers have been queued.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Render to one or more statements.
    ///
    /// Single-column identifiers are grouped into one `IN (..)` delete
    /// when the driver allows it; composite identifiers always produce
    /// one statement per row.
    pub fn build(&self, group_single_key: bool) -> Vec<(String, Vec<Value>)> {
        if self.ids.is_empty() {
            return Vec::new();
        }

        let single_key = self.ids.iter().all(|id| id.len() == 1);
        if group_single_key && single_key && self.ids.len() > 1 {
            let column = self.ids[0].keys().next().cloned().unwrap_or_default();
            let params: Vec<Value> = self
                .ids
                .iter()
                .filter_map(|id| id.values().next().cloned())
                .collect();
            let placeholders: Vec<String> =
                (1..=params.len()).map(|i| format!("${i}")).collect();
            let sql = format!(
                "DELETE FROM {} WHERE {} IN ({})",
                quote_ident(&self.table),
                quote_ident(&column),
                placeholders.join(", ")
            );
            return vec![(sql, params)];
        }

        self.ids
            .iter()
            .map(|id| {
                let mut params = Vec::with_capacity(id.len());
                let mut clauses = Vec::with_capacity(id.len());
                for (column, value) in id {
                    if value.is_null() {
                        clauses.push(format!("{} IS NULL", quote_ident(column)));
                    } else {
                        params.push(value.clone());
                        clauses.push(format!("{} = ${}", quote_ident(column), params.len()));
                    }
                }
                let sql = format!(
                    "DELETE FROM {} WHERE {}",
                    quote_ident(&self.table),
                    clauses.join(" AND ")
                );
                (sql, params)
            })
            .collect()
    }
}

//! Shared test doubles.
//!
//! `MockQueryRunner` records every statement into a shared state so tests
//! can assert on exact SQL and parameter ordering. Query results are
//! scripted in FIFO order; inserts hand out sequential ids the way an
//! increment-keyed table would.

use relorm_core::error::QueryErrorKind;
use relorm_core::{Cx, DriverCapabilities, Error, Outcome, QueryRunner, Row, Value};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub(crate) struct MockState {
    pub executed: Vec<(String, Vec<Value>)>,
    pub queries: Vec<(String, Vec<Value>)>,
    pub scripted_results: VecDeque<Vec<Row>>,
    pub fail_after_executes: Option<usize>,
    pub next_insert_id: i64,
    pub tx_log: Vec<&'static str>,
    pub tx_active: bool,
    pub closure_table: Option<String>,
    pub closure_rows: Vec<(i64, i64)>,
}

#[derive(Debug, Clone)]
pub(crate) struct MockQueryRunner {
    state: Arc<Mutex<MockState>>,
    capabilities: DriverCapabilities,
}

impl MockQueryRunner {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                next_insert_id: 1,
                ..MockState::default()
            })),
            capabilities: DriverCapabilities::postgres(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: DriverCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Script the result of the next `query` call.
    pub fn push_query_result(&self, rows: Vec<Row>) {
        self.lock().scripted_results.push_back(rows);
    }

    /// Fail every `execute` after the first `n` succeeded.
    pub fn fail_after_executes(&self, n: usize) {
        self.lock().fail_after_executes = Some(n);
    }

    /// Apply `INSERT` statements against the named closure junction to an
    /// in-memory pair table, so tests can check the final row set.
    pub fn simulate_closure_table(&self, table: &str) {
        self.lock().closure_table = Some(table.to_string());
    }

    pub fn closure_rows(&self) -> Vec<(i64, i64)> {
        self.lock().closure_rows.clone()
    }

    pub fn executed(&self) -> Vec<(String, Vec<Value>)> {
        self.lock().executed.clone()
    }

    pub fn queries(&self) -> Vec<(String, Vec<Value>)> {
        self.lock().queries.clone()
    }

    pub fn tx_log(&self) -> Vec<&'static str> {
        self.lock().tx_log.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state lock poisoned")
    }

    fn apply_closure_simulation(state: &mut MockState, sql: &str, params: &[Value]) {
        let Some(table) = state.closure_table.clone() else {
            return;
        };
        if !sql.starts_with(&format!("INSERT INTO \"{table}\"")) {
            return;
        }
        let as_pair = |a: &Value, b: &Value| Some((a.as_i64()?, b.as_i64()?));
        if sql.contains("VALUES") {
            // Self pair: params are (ancestor, descendant).
            if let [a, d] = params {
                if let Some(pair) = as_pair(a, d) {
                    state.closure_rows.push(pair);
                }
            }
        } else if sql.contains("SELECT") && !sql.contains("anc.") {
            // Ancestor expansion: params are (new id, parent id).
            if let [id, parent] = params {
                if let Some((id, parent)) = as_pair(id, parent) {
                    let new_rows: Vec<(i64, i64)> = state
                        .closure_rows
                        .iter()
                        .filter(|(_, d)| *d == parent)
                        .map(|(a, _)| (*a, id))
                        .collect();
                    state.closure_rows.extend(new_rows);
                }
            }
        }
    }
}

impl QueryRunner for MockQueryRunner {
    fn capabilities(&self) -> DriverCapabilities {
        self.capabilities
    }

    fn is_transaction_active(&self) -> bool {
        self.lock().tx_active
    }

    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let state = Arc::clone(&self.state);
        let sql = sql.to_string();
        let params = params.to_vec();
        async move {
            let mut guard = state.lock().expect("mock state lock poisoned");
            guard.queries.push((sql, params));
            let rows = guard.scripted_results.pop_front().unwrap_or_default();
            Outcome::Ok(rows)
        }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let state = Arc::clone(&self.state);
        let sql = sql.to_string();
        let params = params.to_vec();
        async move {
            let mut guard = state.lock().expect("mock state lock poisoned");
            if let Some(limit) = guard.fail_after_executes {
                if guard.executed.len() >= limit {
                    return Outcome::Err(Error::query_with_sql(
                        QueryErrorKind::Database,
                        sql,
                        "simulated failure",
                    ));
                }
            }
            Self::apply_closure_simulation(&mut guard, &sql, &params);
            guard.executed.push((sql, params));
            Outcome::Ok(1)
        }
    }

    fn insert(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        let state = Arc::clone(&self.state);
        let sql = sql.to_string();
        let params = params.to_vec();
        async move {
            let mut guard = state.lock().expect("mock state lock poisoned");
            if let Some(limit) = guard.fail_after_executes {
                if guard.executed.len() >= limit {
                    return Outcome::Err(Error::query_with_sql(
                        QueryErrorKind::Database,
                        sql,
                        "simulated failure",
                    ));
                }
            }
            guard.executed.push((sql, params));
            let id = guard.next_insert_id;
            guard.next_insert_id += 1;
            Outcome::Ok(id)
        }
    }

    fn start_transaction(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let state = Arc::clone(&self.state);
        async move {
            let mut guard = state.lock().expect("mock state lock poisoned");
            guard.tx_log.push("start");
            guard.tx_active = true;
            Outcome::Ok(())
        }
    }

    fn commit_transaction(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let state = Arc::clone(&self.state);
        async move {
            let mut guard = state.lock().expect("mock state lock poisoned");
            guard.tx_log.push("commit");
            guard.tx_active = false;
            Outcome::Ok(())
        }
    }

    fn rollback_transaction(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let state = Arc::clone(&self.state);
        async move {
            let mut guard = state.lock().expect("mock state lock poisoned");
            guard.tx_log.push("rollback");
            guard.tx_active = false;
            Outcome::Ok(())
        }
    }
}

/// Unwrap an `Outcome::Ok`, panicking with the full outcome otherwise.
pub(crate) fn unwrap_outcome<T: std::fmt::Debug, E: std::fmt::Debug>(outcome: Outcome<T, E>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
    }
}

/// Run an async test body on a current-thread runtime with a fresh mock.
pub(crate) fn run_test<F, Fut>(body: F)
where
    F: FnOnce(Cx, MockQueryRunner) -> Fut,
    Fut: Future<Output = ()>,
{
    let rt = asupersync::runtime::RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let runner = MockQueryRunner::new();
    rt.block_on(body(cx, runner));
}

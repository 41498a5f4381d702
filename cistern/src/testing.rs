//! An in-process fake [`Driver`], used by this crate's own tests and exposed
//! to downstream integration tests behind the `test-util` feature. Not part
//! of the supported public API.
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;

use crate::{
    config::ConnInfo,
    driver::{ColumnType, Connection, Driver, DriverStatement, ExecResult, ResultSet, Value},
    error::{DriverError, Error, ErrorKind, Result},
    pool::PoolConfig,
};

/// One canned row, read back in column order.
pub type MockRow = Vec<Value>;

#[derive(Default)]
struct Script {
    connect_failures: usize,
    exec_failures: usize,
    rows: Vec<MockRow>,
}

/// A scheme-bound [`Driver`] that never touches the network.
///
/// Every connection it builds shares the driver's current row script and
/// reports back to the driver's connect/statement counters, so a test can
/// assert on how many times the pool actually had to build something versus
/// reuse it.
pub struct MockDriver {
    scheme: &'static str,
    script: Arc<Mutex<Script>>,
    connects: AtomicUsize,
    statements: Arc<AtomicUsize>,
    valid: Arc<std::sync::atomic::AtomicBool>,
}

impl MockDriver {
    pub fn new(scheme: &'static str) -> Self {
        Self {
            scheme,
            script: Arc::new(Mutex::new(Script::default())),
            connects: AtomicUsize::new(0),
            statements: Arc::new(AtomicUsize::new(0)),
            valid: Arc::new(std::sync::atomic::AtomicBool::new(true)),
        }
    }

    /// The next `n` calls to `build_connection` fail with a retryable error.
    pub fn fail_next_connects(&self, n: usize) {
        self.script.lock().expect("mock script poisoned").connect_failures = n;
    }

    /// The next `n` calls to `query`/`exec` on any statement built by this
    /// driver fail with a retryable error, simulating a dropped connection.
    pub fn fail_next_execs(&self, n: usize) {
        self.script.lock().expect("mock script poisoned").exec_failures = n;
    }

    /// Rows every statement built from now on returns from `query`, and the
    /// `rows_affected` every `exec` reports.
    pub fn set_rows(&self, rows: Vec<MockRow>) {
        self.script.lock().expect("mock script poisoned").rows = rows;
    }

    /// Make every connection already handed out, and every one built from
    /// now on, report itself invalid.
    pub fn invalidate_all(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }

    /// Total connections this driver has built.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::Relaxed)
    }

    /// Total statements built across every connection this driver produced.
    pub fn statement_count(&self) -> usize {
        self.statements.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn scheme(&self) -> &'static str {
        self.scheme
    }

    fn connection_pool_options(&self, info: &ConnInfo) -> Result<PoolConfig> {
        let (config, _leftover) = PoolConfig::from_params(&info.params)?;
        Ok(config)
    }

    async fn build_connection(&self, _info: &ConnInfo) -> Result<Box<dyn Connection>> {
        let should_fail = {
            let mut script = self.script.lock().expect("mock script poisoned");
            if script.connect_failures > 0 {
                script.connect_failures -= 1;
                true
            } else {
                false
            }
        };

        if should_fail {
            return Err(Error::from(DriverError::new(self.scheme, "mock connect failure", true)));
        }

        self.connects.fetch_add(1, Ordering::Relaxed);
        let rows = self.script.lock().expect("mock script poisoned").rows.clone();
        Ok(Box::new(MockConnection {
            rows,
            scheme: self.scheme,
            script: self.script.clone(),
            statements: self.statements.clone(),
            valid: self.valid.clone(),
        }))
    }
}

struct MockConnection {
    rows: MockRows,
    scheme: &'static str,
    script: Arc<Mutex<Script>>,
    statements: Arc<AtomicUsize>,
    valid: Arc<std::sync::atomic::AtomicBool>,
}

type MockRows = Vec<MockRow>;

#[async_trait]
impl Connection for MockConnection {
    async fn build_statement(&mut self, query: &str) -> Result<Box<dyn DriverStatement>> {
        self.statements.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MockStatement {
            query: query.to_owned(),
            rows: self.rows.clone(),
            scheme: self.scheme,
            script: self.script.clone(),
        }))
    }

    async fn is_valid(&mut self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

struct MockStatement {
    #[allow(dead_code, reason = "useful in a debugger; not read by any test yet")]
    query: String,
    rows: MockRows,
    scheme: &'static str,
    script: Arc<Mutex<Script>>,
}

impl MockStatement {
    fn take_scripted_failure(&self) -> bool {
        let mut script = self.script.lock().expect("mock script poisoned");
        if script.exec_failures > 0 {
            script.exec_failures -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl DriverStatement for MockStatement {
    async fn query(&mut self, _args: &[Value]) -> Result<Box<dyn ResultSet>> {
        if self.take_scripted_failure() {
            return Err(Error::from(DriverError::new(self.scheme, "mock connection lost", true)));
        }
        Ok(Box::new(MockResultSet {
            rows: self.rows.clone(),
            index: None,
        }))
    }

    async fn exec(&mut self, _args: &[Value]) -> Result<ExecResult> {
        if self.take_scripted_failure() {
            return Err(Error::from(DriverError::new(self.scheme, "mock connection lost", true)));
        }
        Ok(ExecResult {
            rows_affected: self.rows.len() as u64,
            last_insert_id: None,
        })
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

struct MockResultSet {
    rows: MockRows,
    index: Option<usize>,
}

impl MockResultSet {
    fn current_row(&self) -> Option<&MockRow> {
        self.index.and_then(|i| self.rows.get(i))
    }
}

#[async_trait]
impl ResultSet for MockResultSet {
    async fn move_next(&mut self) -> Result<bool> {
        let next = self.index.map_or(0, |i| i + 1);
        self.index = Some(next);
        Ok(next < self.rows.len())
    }

    fn column_count(&self) -> usize {
        self.rows.first().map_or(0, Vec::len)
    }

    fn column_name(&self, _index: usize) -> &str {
        "column"
    }

    fn column_type(&self, index: usize) -> ColumnType {
        match self.current_row().and_then(|r| r.get(index)) {
            Some(Value::Null) | None => ColumnType::Null,
            Some(Value::Bool(_)) => ColumnType::Bool,
            Some(Value::Int(_)) => ColumnType::Int,
            Some(Value::Float(_)) => ColumnType::Float,
            Some(Value::Text(_)) => ColumnType::Text,
            Some(Value::Bytes(_)) => ColumnType::Bytes,
            Some(Value::Time(_)) => ColumnType::Time,
            Some(Value::Other(_)) => ColumnType::Other("mock"),
        }
    }

    fn read_column(&self, index: usize) -> Result<Value> {
        self.current_row().and_then(|r| r.get(index)).cloned().ok_or_else(|| {
            Error::from(ErrorKind::TypeMismatch {
                expected: "column in range",
                found: "out of range",
            })
        })
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

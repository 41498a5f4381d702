//! The top-level facade: a parsed connection URL bound to one driver, its
//! pool, and the statements it has prepared.
use std::{collections::HashMap, future::Future, sync::Arc, sync::Mutex};

use crate::{
    config::ConnInfo,
    driver::{Connection, Driver, ExecResult, Value},
    error::{Error, ErrorKind, Result},
    pool::{BoxFuture, ConnVisitor, Pool, PoolConfig},
    registry,
    statement::{CachedResultSet, PoolStatement},
};

/// An async callback run against every connection a [`Database`] hands out,
/// right after the driver builds it.
///
/// Built this way, rather than as a plain generic, because it has to live
/// behind a `Database`'s shared handle and be called from the pool's actor
/// task without that task becoming generic over the hook's concrete type.
pub type SetupHook = ConnVisitor;

/// A database reachable by URL: a driver, the pool of connections it
/// produces, and the statements prepared against it so far.
#[derive(Clone)]
pub struct Database {
    driver: Arc<dyn Driver>,
    info: ConnInfo,
    pool: Pool,
    statements: Arc<Mutex<HashMap<Arc<str>, Arc<PoolStatement>>>>,
}

/// Parse `url`, look up the driver for its scheme, and open a pool against it.
///
/// ```ignore
/// cistern::registry::register(Arc::new(MyDriver));
/// let db = cistern::database::open("mydriver://localhost/app").await?;
/// ```
pub async fn open(url: &str) -> Result<Database> {
    let info = parse_with_context(url)?;
    let driver = registry::lookup(&info.scheme)?;
    let config = driver.connection_pool_options(&info)?;
    Database::connect(driver, info, config).await
}

/// Like [`open`], but never waits on a connection attempt: the first
/// connection is built lazily on first use.
pub async fn open_lazy(url: &str) -> Result<Database> {
    let info = parse_with_context(url)?;
    let driver = registry::lookup(&info.scheme)?;
    let config = driver.connection_pool_options(&info)?;
    Database::connect_lazy(driver, info, config).await
}

fn parse_with_context(url: &str) -> Result<ConnInfo> {
    ConnInfo::parse(url).map_err(|e| Error::with_context(ErrorKind::Config(e), format!("opening \"{url}\"")))
}

impl Database {
    /// Build a `Database` directly from an already-resolved driver, bypassing
    /// the registry. Useful for drivers built in-process and never registered
    /// under a scheme.
    pub async fn connect(driver: Arc<dyn Driver>, info: ConnInfo, config: PoolConfig) -> Result<Self> {
        let pool = Pool::connect_with(driver.clone(), info.clone(), config).await?;
        Ok(Self {
            driver,
            info,
            pool,
            statements: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Like [`Database::connect`], without eagerly building any connection.
    pub async fn connect_lazy(driver: Arc<dyn Driver>, info: ConnInfo, config: PoolConfig) -> Result<Self> {
        let pool = Pool::connect_lazy_with(driver.clone(), info.clone(), config).await?;
        Ok(Self {
            driver,
            info,
            pool,
            statements: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// The pool backing this database.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// The scheme this database was opened under.
    pub fn scheme(&self) -> &str {
        &self.info.scheme
    }

    /// Apply `visit` once to every currently idle connection. Unlike
    /// [`Database::set_setup_connection`], this is a one-off pass: it is not
    /// remembered and has no effect on connections built afterward.
    pub async fn each_resource<F>(&self, visit: F) -> Result<()>
    where
        F: for<'c> Fn(&'c mut dyn Connection) -> BoxFuture<'c, Result<()>> + Send + Sync + 'static,
    {
        self.pool.each_resource(visit).await
    }

    /// Install `hook` as this database's connection setup callback: run it
    /// once against every connection currently idle, and against every
    /// connection the pool builds from now on. Replaces any previously
    /// installed hook; re-installing the same kind of hook re-applies it to
    /// every currently-available connection exactly once.
    pub async fn set_setup_connection<F>(&self, hook: F) -> Result<()>
    where
        F: for<'c> Fn(&'c mut dyn Connection) -> BoxFuture<'c, Result<()>> + Send + Sync + 'static,
    {
        self.pool.install_setup_hook(Arc::new(hook)).await
    }

    /// Acquire a connection, run `body` against it, and release it
    /// afterwards regardless of whether `body` succeeded, failed, or the
    /// calling task was cancelled mid-flight.
    pub async fn using_connection<F, Fut, T>(&self, body: F) -> Result<T>
    where
        F: FnOnce(&mut dyn Connection) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut conn = self.pool.checkout().await?;
        conn.arm_broken();
        let result = body(conn.as_connection()).await;
        conn.disarm_broken();
        if let Err(e) = &result {
            if e.is_retryable() {
                conn.mark_broken();
            }
        }
        result
    }

    /// Prepare `query`, reusing the cached [`PoolStatement`] for this exact
    /// query text if one already exists.
    pub fn prepare(&self, query: impl Into<Arc<str>>) -> Arc<PoolStatement> {
        let query = query.into();
        let mut statements = self.statements.lock().expect("statement table poisoned");
        statements
            .entry(query.clone())
            .or_insert_with(|| Arc::new(PoolStatement::new(query, self.pool.clone())))
            .clone()
    }

    /// Prepare and run `query` for its side effects.
    pub async fn exec(&self, query: impl Into<Arc<str>>, args: &[Value]) -> Result<ExecResult> {
        self.prepare(query).exec(args).await
    }

    /// Prepare and run `query`, returning its rows.
    pub async fn fetch(&self, query: impl Into<Arc<str>>, args: &[Value]) -> Result<CachedResultSet> {
        self.prepare(query).fetch(args).await
    }

    /// Prepare and run `query`, returning the first column of its first row,
    /// or `None` if it produced no rows.
    pub async fn scalar(&self, query: impl Into<Arc<str>>, args: &[Value]) -> Result<Option<Value>> {
        let mut rows = self.fetch(query, args).await?;
        let value = match rows.move_next().await? {
            true => Some(rows.read_column(0)?),
            false => None,
        };
        rows.close().await?;
        Ok(value)
    }

    /// Run `body`, replaying it while it returns a retryable error, per the
    /// pool's `retry_attempts`/`retry_delay`.
    pub async fn retry<F, Fut, T>(&self, body: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.pool.retry(body).await
    }

    /// Close every cached statement, then the pool itself. Idempotent.
    pub async fn close(&self) {
        let statements: Vec<_> = {
            let mut table = self.statements.lock().expect("statement table poisoned");
            std::mem::take(&mut *table).into_values().collect()
        };
        for stmt in statements {
            stmt.close_all().await;
        }
        self.pool.close().await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::MockDriver;

    async fn database(scheme: &'static str) -> Database {
        let driver = Arc::new(MockDriver::new(scheme));
        let info = ConnInfo::parse(&format!("{scheme}://localhost/app")).unwrap();
        Database::connect(driver, info, PoolConfig::default()).await.unwrap()
    }

    #[tokio::test]
    async fn prepare_returns_the_same_statement_for_the_same_text() {
        let db = database("db-test-a").await;
        let a = db.prepare("select 1");
        let b = db.prepare("select 1");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn exec_and_fetch_round_trip_through_the_mock_driver() {
        let db = database("db-test-b").await;
        let exec = db.exec("insert into t values (1)", &[]).await.unwrap();
        assert_eq!(exec.rows_affected, 0);

        let mut rows = db.fetch("select * from t", &[]).await.unwrap();
        assert!(!rows.move_next().await.unwrap());
        rows.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_tears_down_statements_and_pool() {
        let db = database("db-test-c").await;
        db.exec("select 1", &[]).await.unwrap();
        db.close().await;
        assert!(db.pool().checkout().await.is_err());
    }

    #[tokio::test]
    async fn using_connection_releases_on_every_exit_path() {
        let db = database("db-test-d").await;
        let config = db.pool().config().clone();
        assert_eq!(config.max_pool_size, 1);

        let result: Result<()> = db
            .using_connection(|_conn| async { Err(crate::error::Error::from(crate::error::ErrorKind::PoolClosed)) })
            .await;
        assert!(result.is_err());

        // the one connection must have been released despite the error
        assert!(db.pool().checkout().await.is_ok());
    }

    #[tokio::test]
    async fn scalar_reads_first_column_of_first_row() {
        let driver = Arc::new(MockDriver::new("db-test-e"));
        driver.set_rows(vec![vec![Value::Int(42), Value::Text("ignored".into())]]);
        let info = ConnInfo::parse("db-test-e://localhost/app").unwrap();
        let db = Database::connect(driver, info, PoolConfig::default()).await.unwrap();

        let value = db.scalar("select n, s from t", &[]).await.unwrap();
        assert!(matches!(value, Some(Value::Int(42))));
    }

    #[tokio::test]
    async fn scalar_is_none_for_an_empty_result() {
        let db = database("db-test-f").await;
        let value = db.scalar("select * from t where false", &[]).await.unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn setup_hook_applies_to_idle_connections_and_future_growth() {
        let config = PoolConfig {
            initial_pool_size: 1,
            max_pool_size: 2,
            max_idle_pool_size: 2,
            ..Default::default()
        };
        let driver = Arc::new(MockDriver::new("db-test-g"));
        let info = ConnInfo::parse("db-test-g://localhost/app").unwrap();
        let db = Database::connect(driver, info, config).await.unwrap();

        let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counted = seen.clone();
        db.set_setup_connection(move |_conn: &mut dyn Connection| {
            let counted = counted.clone();
            Box::pin(async move {
                counted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }) as BoxFuture<'_, Result<()>>
        })
        .await
        .unwrap();

        // applied once to the one connection already idle
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 1);

        // and again to a connection the pool grows to satisfy a second checkout
        let _first = db.pool().checkout().await.unwrap();
        let _second = db.pool().checkout().await.unwrap();
        for _ in 0..100 {
            if seen.load(std::sync::atomic::Ordering::SeqCst) == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}

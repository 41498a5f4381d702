//! A statement prepared once per query text and reused across whichever
//! physical connection the pool happens to hand back.
use std::{
    collections::HashMap,
    sync::Arc,
    sync::Mutex,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    driver::{ColumnType, DriverStatement, ExecResult, FromValue, ResultSet, Value},
    error::Result,
    id::ConnId,
    pool::{Pool, PooledConnection},
};

/// A query prepared against a [`Pool`], cached per connection it has run on.
///
/// Every [`PoolStatement::exec`]/[`PoolStatement::fetch`] call first asks the
/// pool for whichever connection last held this query's prepared statement;
/// only on a miss (first use on a connection, or the connection holding the
/// cached entry having since been discarded) is a fresh
/// [`DriverStatement`] built.
pub struct PoolStatement {
    query: Arc<str>,
    pool: Pool,
    cache: Mutex<HashMap<ConnId, Box<dyn DriverStatement>>>,
    builds: AtomicUsize,
    hits: AtomicUsize,
}

impl PoolStatement {
    pub(crate) fn new(query: impl Into<Arc<str>>, pool: Pool) -> Self {
        Self {
            query: query.into(),
            pool,
            cache: Mutex::new(HashMap::new()),
            builds: AtomicUsize::new(0),
            hits: AtomicUsize::new(0),
        }
    }

    /// The query text this statement was prepared from.
    pub fn query_text(&self) -> &str {
        &self.query
    }

    /// How many times a fresh [`DriverStatement`] had to be built, across all
    /// connections this pool has produced.
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::Relaxed)
    }

    /// How many times a cached [`DriverStatement`] was reused without
    /// rebuilding.
    pub fn hit_count(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    /// Run this statement for its side effects.
    pub async fn exec(&self, args: &[Value]) -> Result<ExecResult> {
        self.prune_stale().await;
        let candidates = self.candidate_ids();
        let (mut conn, _reused) = self.pool.checkout_some(&candidates).await?;

        let id = conn.id();
        let mut stmt = self.take_statement(&mut conn).await?;
        conn.arm_broken();
        let result = stmt.exec(args).await;
        conn.disarm_broken();
        if let Err(e) = &result {
            if e.is_retryable() {
                conn.mark_broken();
            }
        }
        self.store_statement(id, stmt);
        result
    }

    /// Run this statement and stream back its rows.
    pub async fn fetch(&self, args: &[Value]) -> Result<CachedResultSet> {
        self.prune_stale().await;
        let candidates = self.candidate_ids();
        let (mut conn, _reused) = self.pool.checkout_some(&candidates).await?;

        let id = conn.id();
        let mut stmt = self.take_statement(&mut conn).await?;
        conn.arm_broken();
        let rows = stmt.query(args).await;
        conn.disarm_broken();
        if let Err(e) = &rows {
            if e.is_retryable() {
                conn.mark_broken();
            }
        }
        self.store_statement(id, stmt);

        Ok(CachedResultSet {
            conn: Some(conn),
            inner: Some(rows?),
        })
    }

    /// Close every cached driver statement, regardless of whether its
    /// connection is still live. Called once by [`crate::database::Database::close`].
    pub(crate) async fn close_all(&self) {
        let entries: Vec<_> = {
            let mut cache = self.cache.lock().expect("statement cache poisoned");
            std::mem::take(&mut *cache).into_iter().collect()
        };
        for (_, stmt) in entries {
            if let Err(e) = stmt.close().await {
                crate::common::error!("error closing cached statement: {e}");
            }
        }
    }

    fn candidate_ids(&self) -> Vec<ConnId> {
        self.cache.lock().expect("statement cache poisoned").keys().copied().collect()
    }

    async fn take_statement(&self, conn: &mut PooledConnection) -> Result<Box<dyn DriverStatement>> {
        let id = conn.id();
        let cached = self.cache.lock().expect("statement cache poisoned").remove(&id);

        match cached {
            Some(stmt) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(stmt)
            }
            None => {
                self.builds.fetch_add(1, Ordering::Relaxed);
                conn.arm_broken();
                let result = conn.as_connection().build_statement(&self.query).await;
                conn.disarm_broken();
                if let Err(e) = &result {
                    if e.is_retryable() {
                        conn.mark_broken();
                    }
                }
                result
            }
        }
    }

    fn store_statement(&self, id: ConnId, stmt: Box<dyn DriverStatement>) {
        self.cache.lock().expect("statement cache poisoned").insert(id, stmt);
    }

    /// Drop cache entries for connections the pool has since discarded.
    async fn prune_stale(&self) {
        let stale: Vec<ConnId> = {
            let cache = self.cache.lock().expect("statement cache poisoned");
            cache.keys().copied().filter(|id| !self.pool.is_live(*id)).collect()
        };

        if stale.is_empty() {
            return;
        }

        let removed: Vec<_> = {
            let mut cache = self.cache.lock().expect("statement cache poisoned");
            stale.into_iter().filter_map(|id| cache.remove(&id).map(|s| (id, s))).collect()
        };

        for (id, stmt) in removed {
            if let Err(e) = stmt.close().await {
                crate::common::error!("error closing stale cached statement for connection {id}: {e}");
            }
        }
    }
}

/// Rows produced by [`PoolStatement::fetch`], holding the connection they
/// came from checked out until dropped or explicitly [`CachedResultSet::close`]d.
pub struct CachedResultSet {
    conn: Option<PooledConnection>,
    inner: Option<Box<dyn ResultSet>>,
}

impl CachedResultSet {
    /// Advance to the next row. `false` means exhausted.
    pub async fn move_next(&mut self) -> Result<bool> {
        let conn = self.conn.as_mut().expect("used after close");
        conn.arm_broken();
        let result = self.inner.as_mut().expect("used after close").move_next().await;
        let conn = self.conn.as_mut().expect("used after close");
        conn.disarm_broken();
        if let Err(e) = &result {
            if e.is_retryable() {
                conn.mark_broken();
            }
        }
        result
    }

    pub fn column_count(&self) -> usize {
        self.inner.as_ref().expect("used after close").column_count()
    }

    pub fn column_name(&self, index: usize) -> &str {
        self.inner.as_ref().expect("used after close").column_name(index)
    }

    pub fn column_type(&self, index: usize) -> ColumnType {
        self.inner.as_ref().expect("used after close").column_type(index)
    }

    pub fn read_column(&self, index: usize) -> Result<Value> {
        self.inner.as_ref().expect("used after close").read_column(index)
    }

    /// Read the value at `index` in the current row, converted to `T`.
    pub fn read<T: FromValue>(&self, index: usize) -> Result<T> {
        T::from_value(self.read_column(index)?)
    }

    /// Release this result set's driver-side cursor and the connection lease
    /// backing it.
    pub async fn close(mut self) -> Result<()> {
        let result = match self.inner.take() {
            Some(rs) => rs.close().await,
            None => Ok(()),
        };
        self.conn.take();
        result
    }
}

impl Drop for CachedResultSet {
    fn drop(&mut self) {
        if self.inner.is_some() {
            crate::common::trace!("result set dropped without an explicit close");
        }
    }
}

//! Generic connection pooling on top of any registered [`crate::driver::Driver`].
use std::{
    collections::HashSet,
    future::Future,
    pin::Pin,
    sync::Arc,
    sync::Mutex,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use tokio::sync::{mpsc, oneshot};

use crate::{
    config::ConnInfo,
    driver::{Connection, Driver},
    error::{Error, ErrorKind, Result},
    id::ConnId,
};

mod config;
mod worker;

pub use config::PoolConfig;

use worker::{WorkerActor, WorkerMessage};

/// A pinned, boxed future, used where a trait object needs to return one.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A callback applied to every idle connection by [`Pool::each_resource`], and
/// (once installed via [`Pool::install_setup_hook`]) to every connection the
/// pool builds afterward.
pub type ConnVisitor =
    Arc<dyn for<'c> Fn(&'c mut dyn Connection) -> BoxFuture<'c, Result<()>> + Send + Sync>;

pub(crate) struct Shared {
    total: AtomicUsize,
    available: AtomicUsize,
    closed: AtomicBool,
    live: Mutex<HashSet<ConnId>>,
    config: PoolConfig,
    setup: Mutex<Option<ConnVisitor>>,
}

/// A pool of connections produced by one [`Driver`].
///
/// Cheap to clone: every clone shares the same actor task and the same
/// counters.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<Shared>,
    send: mpsc::UnboundedSender<WorkerMessage>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("total", &self.total())
            .field("available", &self.available())
            .finish()
    }
}

impl Pool {
    /// Build a pool and eagerly create `config.initial_pool_size` connections
    /// before returning.
    pub async fn connect_with(driver: Arc<dyn Driver>, info: ConnInfo, config: PoolConfig) -> Result<Self> {
        Self::spawn(driver, info, config, false).await
    }

    /// Build a pool without creating any connection; the first one is built
    /// lazily on the first [`Pool::checkout`].
    pub async fn connect_lazy_with(driver: Arc<dyn Driver>, info: ConnInfo, config: PoolConfig) -> Result<Self> {
        Self::spawn(driver, info, config, true).await
    }

    async fn spawn(driver: Arc<dyn Driver>, info: ConnInfo, config: PoolConfig, lazy: bool) -> Result<Self> {
        let shared = Arc::new(Shared {
            total: AtomicUsize::new(0),
            available: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            live: Mutex::new(HashSet::new()),
            config,
            setup: Mutex::new(None),
        });

        let (send, recv) = mpsc::unbounded_channel();
        let actor = WorkerActor::new(driver, info, config, shared.clone(), recv, send.clone(), lazy).await?;
        tokio::spawn(actor.run());

        Ok(Self { shared, send })
    }

    /// Connections currently open, idle or checked out.
    pub fn total(&self) -> usize {
        self.shared.total.load(Ordering::Acquire)
    }

    /// Connections currently idle in the pool.
    pub fn available(&self) -> usize {
        self.shared.available.load(Ordering::Acquire)
    }

    /// Connections currently checked out by some caller.
    pub fn in_use(&self) -> usize {
        self.total().saturating_sub(self.available())
    }

    /// The options this pool was built with.
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Whether `id` still names a connection this pool is tracking (idle or
    /// checked out). Used by the statement cache to prune entries for
    /// connections that have been discarded.
    pub(crate) fn is_live(&self, id: ConnId) -> bool {
        self.shared.live.lock().expect("pool live-set poisoned").contains(&id)
    }

    /// Wait for an available connection, creating one if the pool has spare
    /// capacity, or fail with [`ErrorKind::PoolTimeout`] after
    /// `config().checkout_timeout`.
    pub async fn checkout(&self) -> Result<PooledConnection> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::from(ErrorKind::PoolClosed));
        }

        let (tx, rx) = oneshot::channel();
        self.send
            .send(WorkerMessage::Checkout(tx))
            .map_err(|_| Error::from(ErrorKind::PoolClosed))?;

        match tokio::time::timeout(self.shared.config.checkout_timeout, rx).await {
            Ok(Ok(Ok((id, conn)))) => Ok(PooledConnection::new(self.clone(), id, conn)),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(Error::from(ErrorKind::PoolClosed)),
            Err(_) => Err(Error::from(ErrorKind::PoolTimeout)),
        }
    }

    /// Like [`Pool::checkout`], but first tries to hand back one of
    /// `candidates` if it is still idle. The returned `bool` is `true` when a
    /// candidate was reused.
    ///
    /// The scan over `candidates` and its removal from the idle set happen
    /// inside the pool's single actor task, so a candidate can never be
    /// handed to two callers at once.
    pub(crate) async fn checkout_some(&self, candidates: &[ConnId]) -> Result<(PooledConnection, bool)> {
        if !candidates.is_empty() {
            let (tx, rx) = oneshot::channel();
            self.send
                .send(WorkerMessage::TryTakeIdle {
                    candidates: candidates.to_vec(),
                    reply: tx,
                })
                .map_err(|_| Error::from(ErrorKind::PoolClosed))?;

            if let Ok(Some((id, conn))) = rx.await {
                return Ok((PooledConnection::new(self.clone(), id, conn), true));
            }
        }

        Ok((self.checkout().await?, false))
    }

    pub(crate) fn release(&self, id: ConnId, conn: Box<dyn Connection>, broken: bool) {
        if self.send.send(WorkerMessage::Release { id, conn, broken }).is_err() {
            crate::common::error!("release after pool worker shutdown (id={id})");
        }
    }

    /// Run `visit` against every currently idle connection, stopping at the
    /// first error. Must not be called while this task holds a checkout from
    /// the same pool, or the visitor would deadlock waiting on itself.
    pub async fn each_resource<F>(&self, visit: F) -> Result<()>
    where
        F: for<'c> Fn(&'c mut dyn Connection) -> BoxFuture<'c, Result<()>> + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let visit: ConnVisitor = Arc::new(visit);
        self.send
            .send(WorkerMessage::EachResource { visit, reply: tx })
            .map_err(|_| Error::from(ErrorKind::PoolClosed))?;
        rx.await.map_err(|_| Error::from(ErrorKind::PoolClosed))?
    }

    /// Install `hook` as the connection setup callback: apply it once to
    /// every connection currently idle, and run it against every connection
    /// this pool builds from now on. Replaces any previously installed hook.
    pub async fn install_setup_hook(&self, hook: ConnVisitor) -> Result<()> {
        *self.shared.setup.lock().expect("pool setup-hook poisoned") = Some(hook.clone());
        self.each_resource(move |conn| hook(conn)).await
    }

    /// Run `body`, replaying it while it returns a retryable error, up to
    /// `config().retry_attempts` extra attempts, sleeping `retry_delay`
    /// between attempts.
    pub async fn retry<F, Fut, T>(&self, mut body: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut tries = 0;
        loop {
            match body().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && tries < self.shared.config.retry_attempts => {
                    tries += 1;
                    crate::common::trace!(
                        "retrying after retryable error (attempt {tries}/{})",
                        self.shared.config.retry_attempts
                    );
                    tokio::time::sleep(self.shared.config.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Reject new checkouts, close every idle connection, and close checked
    /// out ones as they are released. Idempotent.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let (tx, rx) = oneshot::channel();
        if self.send.send(WorkerMessage::Close { reply: tx }).is_ok() {
            let _ = rx.await;
        }
    }
}

/// A connection on loan from a [`Pool`], released back to it on drop.
pub struct PooledConnection {
    pool: Pool,
    id: ConnId,
    conn: Option<Box<dyn Connection>>,
    broken: bool,
}

impl PooledConnection {
    fn new(pool: Pool, id: ConnId, conn: Box<dyn Connection>) -> Self {
        Self {
            pool,
            id,
            conn: Some(conn),
            broken: false,
        }
    }

    /// The id of the connection underlying this lease; stable for as long as
    /// the pool keeps the connection alive.
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// The leased connection.
    pub fn as_connection(&mut self) -> &mut dyn Connection {
        self.conn.as_deref_mut().expect("connection taken before drop")
    }

    /// Mark this connection to be discarded instead of returned to the idle
    /// set when it is released.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Assume this lease is broken for the duration of a driver call, and
    /// only clear that assumption once the call has run to completion.
    ///
    /// A task can be cancelled at any `.await` point, including in the
    /// middle of a driver operation. If that happens here, this lease drops
    /// with `broken` still `true`, so the connection is discarded instead of
    /// handed to the next caller with whatever the driver left mid-flight.
    /// Call [`PooledConnection::disarm_broken`] once the call returns
    /// normally, then classify its result as usual.
    pub(crate) fn arm_broken(&mut self) {
        self.broken = true;
    }

    /// Clear the assumption [`PooledConnection::arm_broken`] made, reached
    /// only when the guarded call ran to completion without the task being
    /// cancelled partway through it.
    pub(crate) fn disarm_broken(&mut self) {
        self.broken = false;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(self.id, conn, self.broken);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::MockDriver;

    fn info() -> ConnInfo {
        ConnInfo::parse("mock://localhost/pool-test").unwrap()
    }

    #[tokio::test]
    async fn checkout_creates_up_to_max_pool_size() {
        let driver = Arc::new(MockDriver::new("pool-test-a"));
        let config = PoolConfig {
            initial_pool_size: 0,
            max_pool_size: 2,
            max_idle_pool_size: 2,
            ..Default::default()
        };
        let pool = Pool::connect_with(driver, info(), config).await.unwrap();

        let a = pool.checkout().await.unwrap();
        let b = pool.checkout().await.unwrap();
        assert_eq!(pool.total(), 2);
        assert_eq!(pool.in_use(), 2);

        let config = pool.config();
        let timed_out = tokio::time::timeout(config.checkout_timeout * 2, pool.checkout()).await;
        assert!(matches!(timed_out, Ok(Err(_))));

        drop(a);
        drop(b);
    }

    #[tokio::test]
    async fn release_returns_connection_to_idle() {
        let driver = Arc::new(MockDriver::new("pool-test-b"));
        let config = PoolConfig {
            initial_pool_size: 0,
            max_pool_size: 1,
            max_idle_pool_size: 1,
            ..Default::default()
        };
        let pool = Pool::connect_with(driver, info(), config).await.unwrap();

        let conn = pool.checkout().await.unwrap();
        assert_eq!(pool.available(), 0);
        drop(conn);

        // the release message is async; give the actor a beat to process it
        for _ in 0..100 {
            if pool.available() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.total(), 1);
    }

    #[tokio::test]
    async fn broken_connection_is_discarded_on_release() {
        let driver = Arc::new(MockDriver::new("pool-test-c"));
        let config = PoolConfig {
            initial_pool_size: 0,
            max_pool_size: 1,
            max_idle_pool_size: 1,
            ..Default::default()
        };
        let pool = Pool::connect_with(driver, info(), config).await.unwrap();

        let mut conn = pool.checkout().await.unwrap();
        conn.mark_broken();
        drop(conn);

        for _ in 0..100 {
            if pool.total() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.total(), 0);
        assert_eq!(pool.available(), 0);
    }

    #[tokio::test]
    async fn close_rejects_new_checkouts() {
        let driver = Arc::new(MockDriver::new("pool-test-d"));
        let pool = Pool::connect_with(driver, info(), PoolConfig::default()).await.unwrap();
        pool.close().await;
        assert!(pool.checkout().await.is_err());
    }

    #[tokio::test]
    async fn retry_replays_retryable_errors_up_to_the_limit() {
        let driver = Arc::new(MockDriver::new("pool-test-e"));
        let config = PoolConfig {
            retry_attempts: 2,
            retry_delay: std::time::Duration::from_millis(1),
            ..Default::default()
        };
        let pool = Pool::connect_with(driver, info(), config).await.unwrap();

        let calls = std::sync::atomic::AtomicUsize::new(0);
        let result: Result<()> = pool
            .retry(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::from(ErrorKind::ConnectionLost)) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}

//! The pool's actor task.
//!
//! All mutable pool state (the idle deque, the waiter queue, which
//! connection ids are currently on loan) lives inside this single task.
//! Every other piece of the crate reaches it only through [`super::Pool`]'s
//! channel, so there is no pool-state mutex to poison or deadlock on.
use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
    sync::atomic::Ordering,
};

use tokio::sync::{mpsc, oneshot};

use crate::{
    common::{error, span, trace},
    config::ConnInfo,
    driver::{Connection, Driver},
    error::{Error, ErrorKind, Result},
    id::ConnId,
};

use super::{ConnVisitor, PoolConfig, Shared};

pub(super) enum WorkerMessage {
    Checkout(oneshot::Sender<Result<(ConnId, Box<dyn Connection>)>>),
    TryTakeIdle {
        candidates: Vec<ConnId>,
        reply: oneshot::Sender<Option<(ConnId, Box<dyn Connection>)>>,
    },
    Release {
        id: ConnId,
        conn: Box<dyn Connection>,
        broken: bool,
    },
    Connected(Result<Box<dyn Connection>>),
    EachResource {
        visit: ConnVisitor,
        reply: oneshot::Sender<Result<()>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

struct IdleConn {
    id: ConnId,
    conn: Box<dyn Connection>,
}

pub(super) struct WorkerActor {
    driver: Arc<dyn Driver>,
    info: ConnInfo,
    config: PoolConfig,
    shared: Arc<Shared>,
    total: usize,
    conns: VecDeque<IdleConn>,
    queue: VecDeque<oneshot::Sender<Result<(ConnId, Box<dyn Connection>)>>>,
    loaned: HashSet<ConnId>,
    closed: bool,
    recv: mpsc::UnboundedReceiver<WorkerMessage>,
    self_send: mpsc::UnboundedSender<WorkerMessage>,
}

impl WorkerActor {
    #[allow(clippy::too_many_arguments)]
    pub(super) async fn new(
        driver: Arc<dyn Driver>,
        info: ConnInfo,
        config: PoolConfig,
        shared: Arc<Shared>,
        recv: mpsc::UnboundedReceiver<WorkerMessage>,
        self_send: mpsc::UnboundedSender<WorkerMessage>,
        lazy: bool,
    ) -> Result<Self> {
        let mut conns = VecDeque::new();
        let mut total = 0usize;

        if !lazy {
            for _ in 0..config.initial_pool_size {
                if !config.is_unbounded() && total >= config.max_pool_size {
                    break;
                }
                let conn = driver.build_connection(&info).await?;
                let id = ConnId::next();
                shared.live.lock().expect("pool live-set poisoned").insert(id);
                conns.push_back(IdleConn { id, conn });
                total += 1;
            }
        }

        shared.total.store(total, Ordering::Release);
        shared.available.store(conns.len(), Ordering::Release);

        Ok(Self {
            driver,
            info,
            config,
            shared,
            total,
            conns,
            queue: VecDeque::new(),
            loaned: HashSet::new(),
            closed: false,
            recv,
            self_send,
        })
    }

    pub(super) async fn run(mut self) {
        while let Some(msg) = self.recv.recv().await {
            self.handle(msg).await;
        }
    }

    async fn handle(&mut self, msg: WorkerMessage) {
        span!("pool_worker_message", total = self.total, available = self.conns.len());

        match msg {
            WorkerMessage::Checkout(reply) => self.on_checkout(reply).await,
            WorkerMessage::TryTakeIdle { candidates, reply } => self.on_try_take_idle(candidates, reply).await,
            WorkerMessage::Release { id, conn, broken } => self.on_release(id, conn, broken).await,
            WorkerMessage::Connected(result) => self.on_connected(result),
            WorkerMessage::EachResource { visit, reply } => self.on_each_resource(visit, reply).await,
            WorkerMessage::Close { reply } => self.on_close(reply),
        }
    }

    async fn on_checkout(&mut self, reply: oneshot::Sender<Result<(ConnId, Box<dyn Connection>)>>) {
        if self.closed {
            let _ = reply.send(Err(Error::from(ErrorKind::PoolClosed)));
            return;
        }

        while let Some(mut idle) = self.conns.pop_front() {
            self.shared.available.fetch_sub(1, Ordering::AcqRel);
            if idle.conn.is_valid().await {
                self.loaned.insert(idle.id);
                let _ = reply.send(Ok((idle.id, idle.conn)));
                return;
            }
            self.discard(idle.id, idle.conn);
        }

        if self.can_grow() {
            self.total += 1;
            self.shared.total.fetch_add(1, Ordering::AcqRel);
            self.spawn_connect();
        }
        self.queue.push_back(reply);
    }

    /// Walk `candidates` in order, handing back the first one that is both
    /// still idle and passes its liveness probe. A candidate present in the
    /// idle set but no longer valid is discarded and the walk continues to
    /// the next candidate, rather than giving up and falling back to a plain
    /// `checkout()` (which could then hand out a *later* candidate itself,
    /// making `reused` lie about whether it came from this list).
    async fn on_try_take_idle(
        &mut self,
        candidates: Vec<ConnId>,
        reply: oneshot::Sender<Option<(ConnId, Box<dyn Connection>)>>,
    ) {
        if self.closed {
            let _ = reply.send(None);
            return;
        }

        for cid in candidates {
            let Some(pos) = self.conns.iter().position(|c| c.id == cid) else {
                continue;
            };

            let mut idle = self.conns.remove(pos).expect("position just found");
            self.shared.available.fetch_sub(1, Ordering::AcqRel);

            if idle.conn.is_valid().await {
                self.loaned.insert(idle.id);
                let _ = reply.send(Some((idle.id, idle.conn)));
                return;
            }

            self.discard(idle.id, idle.conn);
        }

        let _ = reply.send(None);
    }

    async fn on_release(&mut self, id: ConnId, mut conn: Box<dyn Connection>, broken: bool) {
        if !self.loaned.remove(&id) {
            error!("release of connection {id} not lent out by this pool");
            debug_assert!(false, "release of connection not lent out by this pool");
            self.close_foreign(conn);
            return;
        }

        if broken || self.closed || !conn.is_valid().await {
            self.discard(id, conn);
        } else {
            self.place(id, conn);
        }
    }

    fn on_connected(&mut self, result: Result<Box<dyn Connection>>) {
        match result {
            Ok(conn) => {
                let id = ConnId::next();
                self.shared.live.lock().expect("pool live-set poisoned").insert(id);
                self.place(id, conn);
            }
            Err(e) => {
                self.total -= 1;
                self.shared.total.fetch_sub(1, Ordering::AcqRel);
                if let Some(waiter) = self.queue.pop_front() {
                    let _ = waiter.send(Err(e));
                } else {
                    error!("connection attempt failed with no waiter to report to: {e}");
                }
            }
        }
    }

    async fn on_each_resource(&mut self, visit: ConnVisitor, reply: oneshot::Sender<Result<()>>) {
        let mut outcome = Ok(());
        for idle in self.conns.iter_mut() {
            if let Err(e) = (visit)(idle.conn.as_mut()).await {
                outcome = Err(e);
                break;
            }
        }
        let _ = reply.send(outcome);
    }

    fn on_close(&mut self, reply: oneshot::Sender<()>) {
        self.closed = true;
        self.shared.closed.store(true, Ordering::Release);

        while let Some(waiter) = self.queue.pop_front() {
            let _ = waiter.send(Err(Error::from(ErrorKind::PoolClosed)));
        }

        while let Some(idle) = self.conns.pop_front() {
            self.discard(idle.id, idle.conn);
        }

        let _ = reply.send(());
    }

    /// Hand `conn` to the oldest waiting checkout, or park it idle.
    fn place(&mut self, mut id: ConnId, mut conn: Box<dyn Connection>) {
        while let Some(waiter) = self.queue.pop_front() {
            match waiter.send(Ok((id, conn))) {
                Ok(()) => {
                    self.loaned.insert(id);
                    return;
                }
                Err(Ok((rid, rconn))) => {
                    id = rid;
                    conn = rconn;
                }
                Err(Err(_)) => unreachable!("place() only ever sends Ok"),
            }
        }

        if self.closed || self.conns.len() >= self.config.max_idle_pool_size {
            self.discard(id, conn);
            return;
        }

        self.conns.push_back(IdleConn { id, conn });
        self.shared.available.fetch_add(1, Ordering::AcqRel);
    }

    fn can_grow(&self) -> bool {
        self.config.is_unbounded() || self.total < self.config.max_pool_size
    }

    fn spawn_connect(&self) {
        let driver = self.driver.clone();
        let info = self.info.clone();
        let send = self.self_send.clone();
        let hook = self.shared.setup.lock().expect("pool setup-hook poisoned").clone();
        tokio::spawn(async move {
            let result = match driver.build_connection(&info).await {
                Ok(mut conn) => match &hook {
                    Some(hook) => hook(conn.as_mut()).await.map(|()| conn),
                    None => Ok(conn),
                },
                Err(e) => Err(e),
            };
            let _ = send.send(WorkerMessage::Connected(result));
        });
    }

    /// Drop an id this actor owns: release its capacity and liveness entry,
    /// then close it in the background.
    fn discard(&mut self, id: ConnId, conn: Box<dyn Connection>) {
        self.total -= 1;
        self.shared.total.fetch_sub(1, Ordering::AcqRel);
        self.shared.live.lock().expect("pool live-set poisoned").remove(&id);
        trace!("discarding connection {id}");
        tokio::spawn(async move {
            if let Err(e) = conn.close().await {
                error!("error closing discarded connection: {e}");
            }
        });
    }

    /// Close a connection this actor never tracked (a misused release); total
    /// and available are left untouched since they never accounted for it.
    fn close_foreign(&self, conn: Box<dyn Connection>) {
        tokio::spawn(async move {
            let _ = conn.close().await;
        });
    }
}

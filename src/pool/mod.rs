//! Connection pooling with route scoped and global capacity limits.
//!
//! `ConnectionPool` owns one event loop's connections and hands out
//! `PooledConn` lease guards. A guard returns its connection on drop: marked
//! reusable it is parked for the next lease (or handed to a waiter), otherwise
//! it is closed and its capacity released.
mod limiter;

use std::{
    cell::UnsafeCell,
    collections::{HashMap, VecDeque},
    ops::{Deref, DerefMut},
    rc::{Rc, Weak},
    time::{Duration, Instant},
};

pub use limiter::CapacityLimiter;
use tokio::sync::OwnedSemaphorePermit;

use crate::{
    connectors::Connector,
    error::{Result, TransportError},
    route::Route,
};

pub trait Poolable {
    fn is_open(&self) -> bool;
}

type SharedPool<IO> = Rc<UnsafeCell<PoolInner<IO>>>;
type WeakPool<IO> = Weak<UnsafeCell<PoolInner<IO>>>;

#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    pub max_per_route: usize,
    pub max_total: usize,
    pub idle_expiry: Duration,
    pub lease_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_route: 2,
            max_total: 20,
            idle_expiry: Duration::from_secs(60),
            lease_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn max_per_route(mut self, max_per_route: usize) -> Self {
        self.max_per_route = max_per_route;
        self
    }

    pub fn max_total(mut self, max_total: usize) -> Self {
        self.max_total = max_total;
        self
    }

    pub fn idle_expiry(mut self, idle_expiry: Duration) -> Self {
        self.idle_expiry = idle_expiry;
        self
    }

    pub fn lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }
}

/// Lease guard over a pooled connection.
///
/// Guards start out non reusable: a connection dropped mid pipeline has
/// indeterminate framing state and must not be parked. Callers mark the guard
/// reusable once the exchange sequence finished cleanly.
pub struct PooledConn<IO: Poolable> {
    conn: Option<IO>,
    permit: Option<OwnedSemaphorePermit>,
    route: Route,
    pool: WeakPool<IO>,
    reusable: bool,
    is_reused: bool,
}

impl<IO: Poolable> std::fmt::Debug for PooledConn<IO> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn")
            .field("route", &self.route)
            .field("reusable", &self.reusable)
            .field("is_reused", &self.is_reused)
            .finish_non_exhaustive()
    }
}

impl<IO: Poolable> PooledConn<IO> {
    fn new(
        conn: IO,
        permit: OwnedSemaphorePermit,
        route: Route,
        pool: WeakPool<IO>,
        is_reused: bool,
    ) -> Self {
        Self {
            conn: Some(conn),
            permit: Some(permit),
            route,
            pool,
            reusable: false,
            is_reused,
        }
    }

    #[inline]
    pub fn set_reusable(&mut self, reusable: bool) {
        self.reusable = reusable;
    }

    #[inline]
    pub fn is_reused(&self) -> bool {
        self.is_reused
    }

    #[inline]
    pub fn route(&self) -> &Route {
        &self.route
    }
}

impl<IO: Poolable> Deref for PooledConn<IO> {
    type Target = IO;

    #[inline]
    fn deref(&self) -> &IO {
        self.conn.as_ref().expect("not dropped")
    }
}

impl<IO: Poolable> DerefMut for PooledConn<IO> {
    #[inline]
    fn deref_mut(&mut self) -> &mut IO {
        self.conn.as_mut().expect("not dropped")
    }
}

impl<IO: Poolable> Drop for PooledConn<IO> {
    fn drop(&mut self) {
        let (Some(conn), Some(permit)) = (self.conn.take(), self.permit.take()) else {
            return;
        };
        let Some(shared) = self.pool.upgrade() else {
            return;
        };
        let inner = unsafe { &mut *shared.get() };
        if self.reusable && conn.is_open() && !inner.closed {
            inner.release(Rc::downgrade(&shared), &self.route, conn, permit);
        } else {
            #[cfg(feature = "logging")]
            tracing::debug!(route = %self.route, "discarding pooled connection");
            drop(conn);
            drop(permit);
            inner.discard(&self.route);
        }
    }
}

enum WaiterMsg<IO: Poolable> {
    Conn(HandoffConn<IO>),
    Retry,
}

struct Waiter<IO: Poolable> {
    id: u64,
    tx: local_sync::oneshot::Sender<WaiterMsg<IO>>,
}

/// Connection in transit between a releasing guard and a waiting lease. If
/// the waiter vanished before claiming it (its lease timed out after the
/// handoff was sent), dropping the message re-parks the connection.
struct HandoffConn<IO: Poolable> {
    pool: WeakPool<IO>,
    route: Route,
    inner: Option<(IO, OwnedSemaphorePermit)>,
}

impl<IO: Poolable> HandoffConn<IO> {
    fn new(pool: WeakPool<IO>, route: Route, conn: IO, permit: OwnedSemaphorePermit) -> Self {
        Self {
            pool,
            route,
            inner: Some((conn, permit)),
        }
    }

    fn claim(mut self) -> (IO, OwnedSemaphorePermit) {
        self.inner.take().expect("present until claimed or dropped")
    }
}

impl<IO: Poolable> Drop for HandoffConn<IO> {
    fn drop(&mut self) {
        let Some((conn, permit)) = self.inner.take() else {
            return;
        };
        let Some(shared) = self.pool.upgrade() else {
            return;
        };
        let inner = unsafe { &mut *shared.get() };
        if !inner.closed && conn.is_open() {
            inner.release(self.pool.clone(), &self.route, conn, permit);
        } else {
            drop(conn);
            drop(permit);
            inner.discard(&self.route);
        }
    }
}

struct IdleConn<IO> {
    conn: IO,
    permit: OwnedSemaphorePermit,
    idle_at: Instant,
}

impl<IO> IdleConn<IO> {
    #[inline]
    fn expired(&self, max_elapsed: Duration) -> bool {
        self.idle_at.elapsed() > max_elapsed
    }
}

struct RouteState<IO: Poolable> {
    idle: VecDeque<IdleConn<IO>>,
    // leased plus idle connections; each holds one capacity permit
    alive: usize,
    waiters: VecDeque<Waiter<IO>>,
}

impl<IO: Poolable> Default for RouteState<IO> {
    fn default() -> Self {
        Self {
            idle: VecDeque::new(),
            alive: 0,
            waiters: VecDeque::new(),
        }
    }
}

impl<IO: Poolable> RouteState<IO> {
    /// Most recently parked connection first; expired or closed entries are
    /// dropped along the way.
    fn pop_ready(&mut self, idle_expiry: Duration) -> Option<IdleConn<IO>> {
        while let Some(idle) = self.idle.pop_back() {
            if idle.expired(idle_expiry) || !idle.conn.is_open() {
                self.alive = self.alive.saturating_sub(1);
                continue;
            }
            return Some(idle);
        }
        None
    }

    fn notify_one_retry(&mut self) {
        while let Some(w) = self.waiters.pop_front() {
            if w.tx.send(WaiterMsg::Retry).is_ok() {
                return;
            }
        }
    }
}

struct PoolInner<IO: Poolable> {
    routes: HashMap<Route, RouteState<IO>>,
    closed: bool,
    waiter_seq: u64,
    _drop: local_sync::oneshot::Receiver<()>,
}

impl<IO: Poolable> PoolInner<IO> {
    fn new_with_dropper() -> (local_sync::oneshot::Sender<()>, Self) {
        let (tx, drop) = local_sync::oneshot::channel();
        (
            tx,
            Self {
                routes: HashMap::new(),
                closed: false,
                waiter_seq: 0,
                _drop: drop,
            },
        )
    }

    fn release(&mut self, weak: WeakPool<IO>, route: &Route, conn: IO, permit: OwnedSemaphorePermit) {
        let state = self.routes.entry(route.clone()).or_default();
        let mut pending = HandoffConn::new(weak, route.clone(), conn, permit);
        while let Some(w) = state.waiters.pop_front() {
            match w.tx.send(WaiterMsg::Conn(pending)) {
                Ok(()) => {
                    #[cfg(feature = "logging")]
                    tracing::debug!(route = %route, "handed released connection to waiter");
                    return;
                }
                Err(msg) => {
                    let WaiterMsg::Conn(h) = msg else { return };
                    pending = h;
                }
            }
        }
        let (conn, permit) = pending.claim();
        state.idle.push_back(IdleConn {
            conn,
            permit,
            idle_at: Instant::now(),
        });
    }

    fn discard(&mut self, route: &Route) {
        if let Some(state) = self.routes.get_mut(route) {
            state.alive = state.alive.saturating_sub(1);
            state.notify_one_retry();
        }
    }

    fn clear_expired(&mut self, dur: Duration) {
        self.routes.retain(|_route, state| {
            let before = state.idle.len();
            state.idle.retain(|idle| !idle.expired(dur));
            state.alive = state.alive.saturating_sub(before - state.idle.len());
            state.alive > 0 || !state.waiters.is_empty()
        });
    }
}

enum LeaseStep<IO: Poolable> {
    Reuse(IdleConn<IO>),
    Connect(OwnedSemaphorePermit),
    Wait {
        rx: local_sync::oneshot::Receiver<WaiterMsg<IO>>,
        id: u64,
        race: bool,
    },
}

/// Single thread pool shard. The `CapacityLimiter` it is built with may be
/// shared with shards on other threads so `max_total` holds process wide.
pub struct ConnectionPool<C, IO: Poolable> {
    connector: Rc<C>,
    shared: SharedPool<IO>,
    limiter: CapacityLimiter,
    config: PoolConfig,
}

impl<C, IO: Poolable> Clone for ConnectionPool<C, IO> {
    fn clone(&self) -> Self {
        Self {
            connector: self.connector.clone(),
            shared: self.shared.clone(),
            limiter: self.limiter.clone(),
            config: self.config,
        }
    }
}

impl<C, IO: Poolable + 'static> ConnectionPool<C, IO> {
    pub fn new(connector: C, config: PoolConfig) -> Self {
        let limiter = CapacityLimiter::new(config.max_total);
        Self::with_limiter(connector, config, limiter)
    }

    pub fn with_limiter(connector: C, config: PoolConfig, limiter: CapacityLimiter) -> Self {
        const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

        let (tx, inner) = PoolInner::new_with_dropper();
        let shared = Rc::new(UnsafeCell::new(inner));
        monoio::spawn(IdleTask {
            tx,
            conns: Rc::downgrade(&shared),
            interval: monoio::time::interval(config.idle_expiry.max(MIN_SWEEP_INTERVAL)),
            idle_dur: config.idle_expiry,
        });

        Self {
            connector: Rc::new(connector),
            shared,
            limiter,
            config,
        }
    }

    /// Close every idle connection and fail pending leases. Leased guards
    /// finish their pipelines but are discarded on drop.
    pub fn shutdown(&self) {
        let inner = unsafe { &mut *self.shared.get() };
        if inner.closed {
            return;
        }
        inner.closed = true;
        for state in inner.routes.values_mut() {
            let drained = state.idle.len();
            state.idle.clear();
            state.alive = state.alive.saturating_sub(drained);
            while let Some(w) = state.waiters.pop_front() {
                let _ = w.tx.send(WaiterMsg::Retry);
            }
        }
        #[cfg(feature = "logging")]
        tracing::debug!("connection pool shut down");
    }

    pub fn idle_connection_count(&self) -> usize {
        let inner = unsafe { &*self.shared.get() };
        inner.routes.values().map(|s| s.idle.len()).sum()
    }

    #[cfg(test)]
    fn route_alive(&self, route: &Route) -> usize {
        let inner = unsafe { &*self.shared.get() };
        inner.routes.get(route).map(|s| s.alive).unwrap_or(0)
    }
}

impl<C, IO> ConnectionPool<C, IO>
where
    C: Connector<Route, Connection = IO, Error = TransportError>,
    IO: Poolable + 'static,
{
    /// Lease a connection for `route`, reusing an idle one when possible and
    /// dialing otherwise. Fails with `PoolTimeout` when neither route nor
    /// global capacity frees up within the configured lease timeout.
    pub async fn lease(&self, route: &Route) -> Result<PooledConn<IO>> {
        match monoio::time::timeout(self.config.lease_timeout, self.lease_inner(route)).await {
            Ok(res) => res,
            Err(_) => Err(TransportError::PoolTimeout),
        }
    }

    async fn lease_inner(&self, route: &Route) -> Result<PooledConn<IO>> {
        loop {
            let step = {
                let inner = unsafe { &mut *self.shared.get() };
                if inner.closed {
                    return Err(TransportError::Closed);
                }
                inner.waiter_seq += 1;
                let id = inner.waiter_seq;
                let state = inner.routes.entry(route.clone()).or_default();

                if let Some(idle) = state.pop_ready(self.config.idle_expiry) {
                    LeaseStep::Reuse(idle)
                } else if state.alive < self.config.max_per_route {
                    match self.limiter.try_acquire() {
                        Some(permit) => {
                            state.alive += 1;
                            LeaseStep::Connect(permit)
                        }
                        None => {
                            let (tx, rx) = local_sync::oneshot::channel();
                            state.waiters.push_back(Waiter { id, tx });
                            LeaseStep::Wait { rx, id, race: true }
                        }
                    }
                } else {
                    let (tx, rx) = local_sync::oneshot::channel();
                    state.waiters.push_back(Waiter { id, tx });
                    LeaseStep::Wait {
                        rx,
                        id,
                        race: false,
                    }
                }
            };

            match step {
                LeaseStep::Reuse(idle) => {
                    #[cfg(feature = "logging")]
                    tracing::debug!(route = %route, "reusing idle connection");
                    return Ok(PooledConn::new(
                        idle.conn,
                        idle.permit,
                        route.clone(),
                        Rc::downgrade(&self.shared),
                        true,
                    ));
                }
                LeaseStep::Connect(permit) => {
                    return self.connect_leased(route, permit).await;
                }
                LeaseStep::Wait { rx, id, race } => {
                    if race {
                        // The route has headroom but the global limit is hit:
                        // take whichever frees first, a released connection on
                        // this route or a capacity permit from any route.
                        let acquire = self.limiter.acquire();
                        futures::pin_mut!(acquire);
                        futures::pin_mut!(rx);
                        match futures::future::select(rx, acquire).await {
                            futures::future::Either::Left((msg, _)) => match msg {
                                Ok(WaiterMsg::Conn(handoff)) => {
                                    let (conn, permit) = handoff.claim();
                                    return Ok(PooledConn::new(
                                        conn,
                                        permit,
                                        route.clone(),
                                        Rc::downgrade(&self.shared),
                                        true,
                                    ));
                                }
                                Ok(WaiterMsg::Retry) | Err(_) => continue,
                            },
                            futures::future::Either::Right((permit, _)) => {
                                self.deregister_waiter(route, id);
                                let permit = permit?;
                                {
                                    let inner = unsafe { &mut *self.shared.get() };
                                    if inner.closed {
                                        return Err(TransportError::Closed);
                                    }
                                    inner.routes.entry(route.clone()).or_default().alive += 1;
                                }
                                return self.connect_leased(route, permit).await;
                            }
                        }
                    } else {
                        match rx.await {
                            Ok(WaiterMsg::Conn(handoff)) => {
                                let (conn, permit) = handoff.claim();
                                return Ok(PooledConn::new(
                                    conn,
                                    permit,
                                    route.clone(),
                                    Rc::downgrade(&self.shared),
                                    true,
                                ));
                            }
                            Ok(WaiterMsg::Retry) | Err(_) => continue,
                        }
                    }
                }
            }
        }
    }

    /// Dial a new connection under an already reserved route slot and global
    /// permit. The reservation is rolled back if the dial fails or the caller
    /// is dropped mid connect.
    async fn connect_leased(
        &self,
        route: &Route,
        permit: OwnedSemaphorePermit,
    ) -> Result<PooledConn<IO>> {
        let reservation = Reservation {
            pool: Rc::downgrade(&self.shared),
            route: route.clone(),
            armed: true,
        };
        match self.connector.connect(route.clone()).await {
            Ok(conn) => {
                #[cfg(feature = "logging")]
                tracing::debug!(route = %route, "dialed new pooled connection");
                reservation.defuse();
                Ok(PooledConn::new(
                    conn,
                    permit,
                    route.clone(),
                    Rc::downgrade(&self.shared),
                    false,
                ))
            }
            Err(e) => {
                drop(permit);
                drop(reservation);
                Err(e)
            }
        }
    }

    fn deregister_waiter(&self, route: &Route, id: u64) {
        let inner = unsafe { &mut *self.shared.get() };
        if let Some(state) = inner.routes.get_mut(route) {
            state.waiters.retain(|w| w.id != id);
        }
    }
}

/// Rolls back an `alive` increment when a dial does not complete.
struct Reservation<IO: Poolable> {
    pool: WeakPool<IO>,
    route: Route,
    armed: bool,
}

impl<IO: Poolable> Reservation<IO> {
    fn defuse(mut self) {
        self.armed = false;
    }
}

impl<IO: Poolable> Drop for Reservation<IO> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(shared) = self.pool.upgrade() {
            let inner = unsafe { &mut *shared.get() };
            inner.discard(&self.route);
        }
    }
}

struct IdleTask<IO: Poolable> {
    tx: local_sync::oneshot::Sender<()>,
    conns: WeakPool<IO>,
    interval: monoio::time::Interval,
    idle_dur: Duration,
}

impl<IO: Poolable> std::future::Future for IdleTask<IO> {
    type Output = ();

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            match this.tx.poll_closed(cx) {
                std::task::Poll::Ready(_) => {
                    #[cfg(feature = "logging")]
                    tracing::debug!("pool rx dropped, idle task exit");
                    return std::task::Poll::Ready(());
                }
                std::task::Poll::Pending => (),
            }

            std::task::ready!(this.interval.poll_tick(cx));
            if let Some(inner) = this.conns.upgrade() {
                let inner_mut = unsafe { &mut *inner.get() };
                inner_mut.clear_expired(this.idle_dur);
                #[cfg(feature = "logging")]
                tracing::debug!("pool clear expired");
                continue;
            }
            #[cfg(feature = "logging")]
            tracing::debug!("pool upgrade failed, idle task exit");
            return std::task::Poll::Ready(());
        }
    }
}

//! Worker thread reactor.
//!
//! Each worker owns a single threaded io_uring/epoll event loop, its own pool
//! shard and every connection it dials. Routes stick to one worker, so a
//! connection is only ever touched by the thread that created it. Workers
//! share one [`CapacityLimiter`] to keep the global connection cap exact.
use std::{
    cell::Cell,
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    rc::Rc,
    time::{Duration, Instant},
};

use monoio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::{
    connectors::TcpConnector,
    error::{Result, TransportError},
    http::{Http1Connection, HttpConnector},
    pool::{CapacityLimiter, ConnectionPool, PoolConfig},
    protocol::ProcessorChain,
    route::Route,
};

#[derive(Clone, Copy, Debug)]
pub struct ReactorConfig {
    pub worker_threads: usize,
    pub connect_timeout: Duration,
    pub socket_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            worker_threads: 1,
            connect_timeout: Duration::from_secs(10),
            socket_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl ReactorConfig {
    pub fn worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn socket_timeout(mut self, socket_timeout: Duration) -> Self {
        self.socket_timeout = socket_timeout;
        self
    }

    pub fn shutdown_grace(mut self, shutdown_grace: Duration) -> Self {
        self.shutdown_grace = shutdown_grace;
        self
    }
}

/// How a reactor shutdown ended: `Clean` when every in flight batch finished
/// inside the grace period, `Forced` when at least one worker abandoned work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownStatus {
    Clean,
    Forced,
}

pub(crate) type WorkerPool = ConnectionPool<HttpConnector<TcpConnector>, Http1Connection<TcpStream>>;

/// Per worker state handed to every job running on that worker's event loop.
pub(crate) struct WorkerShared {
    pub(crate) pool: WorkerPool,
    pub(crate) chain: ProcessorChain,
    pub(crate) socket_timeout: Duration,
    pub(crate) inflight: Cell<usize>,
}

pub(crate) type Job = Box<dyn FnOnce(Rc<WorkerShared>) + Send + 'static>;

fn worker_main(
    mut rx: UnboundedReceiver<Job>,
    chain: ProcessorChain,
    pool_config: PoolConfig,
    limiter: CapacityLimiter,
    config: ReactorConfig,
) -> bool {
    let mut rt = monoio::RuntimeBuilder::<monoio::FusionDriver>::new()
        .enable_timer()
        .build()
        .expect("failed to build worker runtime");
    rt.block_on(async move {
        let connector = HttpConnector::new(
            TcpConnector { no_delay: true },
            config.connect_timeout,
        );
        let pool = ConnectionPool::with_limiter(connector, pool_config, limiter);
        let shared = Rc::new(WorkerShared {
            pool,
            chain,
            socket_timeout: config.socket_timeout,
            inflight: Cell::new(0),
        });

        while let Some(job) = rx.recv().await {
            job(shared.clone());
        }

        // Channel closed: no new work can arrive. Let in flight batches run
        // down, then abandon whatever is left when the grace period lapses.
        let deadline = Instant::now() + config.shutdown_grace;
        let clean = loop {
            if shared.inflight.get() == 0 {
                break true;
            }
            if Instant::now() >= deadline {
                #[cfg(feature = "logging")]
                tracing::warn!(
                    inflight = shared.inflight.get(),
                    "shutdown grace elapsed, abandoning in flight batches"
                );
                break false;
            }
            monoio::time::sleep(Duration::from_millis(10)).await;
        };
        shared.pool.shutdown();
        clean
    })
}

/// Fixed set of worker event loops with route sticky job dispatch.
pub struct IoReactor {
    txs: Vec<UnboundedSender<Job>>,
    handles: Vec<std::thread::JoinHandle<bool>>,
}

impl IoReactor {
    pub fn new(
        config: ReactorConfig,
        pool_config: PoolConfig,
        chain: ProcessorChain,
    ) -> Result<Self> {
        let workers = config.worker_threads.max(1);
        let limiter = CapacityLimiter::new(pool_config.max_total);
        let mut txs = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let (tx, rx) = unbounded_channel();
            let chain = chain.clone();
            let limiter = limiter.clone();
            let handle = std::thread::Builder::new()
                .name(format!("pipeline-worker-{i}"))
                .spawn(move || worker_main(rx, chain, pool_config, limiter, config))
                .map_err(TransportError::Io)?;
            txs.push(tx);
            handles.push(handle);
        }
        Ok(Self { txs, handles })
    }

    /// Dispatch a job to the worker owning this route. All connections to a
    /// route live on one event loop, which is what lets the pool run without
    /// locks.
    pub(crate) fn submit(&self, route: &Route, job: Job) {
        let mut hasher = DefaultHasher::new();
        route.hash(&mut hasher);
        let slot = (hasher.finish() as usize) % self.txs.len();
        // send only fails after shutdown; the dropped job's channels resolve
        // the caller side with Closed
        let _ = self.txs[slot].send(job);
    }

    /// Stop accepting work, wait for every worker to drain and join them.
    pub fn shutdown(mut self) -> Result<ShutdownStatus> {
        self.txs.clear();
        let mut clean = true;
        for handle in self.handles.drain(..) {
            match handle.join() {
                Ok(worker_clean) => clean &= worker_clean,
                Err(_) => {
                    return Err(TransportError::Worker("worker thread panicked".into()));
                }
            }
        }
        Ok(if clean {
            ShutdownStatus::Clean
        } else {
            ShutdownStatus::Forced
        })
    }
}

//! Pipelined exchange coordination.
//!
//! A batch leases exactly one connection, pushes every request through the
//! processor chain before any bytes are written, writes the whole run, then
//! reads responses strictly in submission order. The first error fails the
//! batch as a unit and the connection is never parked afterwards.
use std::{future::Future, io, pin::Pin, task::Poll, time::Duration};

use bytes::Bytes;
use http::{Request, Response, Uri};
use monoio::io::{AsyncReadRent, AsyncWriteRent};
use monoio_http::{
    common::body::HttpBody,
    h1::payload::{fixed_payload_pair, stream_payload_pair, Payload},
};

use crate::{
    connectors::Connector,
    error::{Result, TransportError},
    http::Http1Connection,
    pool::{ConnectionPool, Poolable},
    protocol::{ExchangeContext, ProcessorChain},
    route::Route,
};

/// Request payload for a pipelined exchange. Chunked bodies require
/// HTTP/1.1; fixed bodies are framed with `Content-Length`.
#[derive(Debug, Clone)]
pub enum RequestBody {
    None,
    Fixed(Bytes),
    Chunked(Vec<Bytes>),
}

impl RequestBody {
    pub(crate) fn into_http_body(self) -> HttpBody {
        match self {
            RequestBody::None => HttpBody::H1(Payload::None),
            RequestBody::Fixed(bytes) => {
                let (payload, sender) = fixed_payload_pair();
                sender.feed(Ok(bytes));
                HttpBody::H1(Payload::Fixed(payload))
            }
            RequestBody::Chunked(chunks) => {
                let (payload, mut sender) = stream_payload_pair();
                for chunk in chunks {
                    sender.feed_data(Some(chunk));
                }
                sender.feed_data(None);
                HttpBody::H1(Payload::Stream(payload))
            }
        }
    }
}

pub type PipelinedRequest = Request<RequestBody>;

/// Receives one fully aggregated response. A consumer error fails the whole
/// batch.
pub trait ResponseConsumer {
    type Output;

    fn consume(&mut self, response: Response<Bytes>) -> Result<Self::Output>;
}

/// Consumer that yields the response unchanged.
pub struct FullResponse;

impl ResponseConsumer for FullResponse {
    type Output = Response<Bytes>;

    fn consume(&mut self, response: Response<Bytes>) -> Result<Self::Output> {
        Ok(response)
    }
}

impl<F, T> ResponseConsumer for F
where
    F: FnMut(Response<Bytes>) -> Result<T>,
{
    type Output = T;

    fn consume(&mut self, response: Response<Bytes>) -> Result<T> {
        (self)(response)
    }
}

/// Terminal state of a batch. Exactly one outcome is delivered per batch, and
/// only after the leased connection has been returned to the pool.
#[derive(Debug)]
pub enum BatchOutcome<T> {
    Completed(Vec<T>),
    Failed(TransportError),
    Cancelled,
}

impl<T> BatchOutcome<T> {
    pub fn into_result(self) -> Result<Vec<T>> {
        match self {
            BatchOutcome::Completed(outputs) => Ok(outputs),
            BatchOutcome::Failed(e) => Err(e),
            BatchOutcome::Cancelled => Err(TransportError::Cancelled),
        }
    }
}

/// Caller side of a submitted batch. Awaiting it yields the outcome;
/// [`PipelineHandle::cancel`] requests cooperative cancellation. Dropping the
/// handle detaches the batch, which keeps running to completion.
pub struct PipelineHandle<T> {
    rx: tokio::sync::oneshot::Receiver<BatchOutcome<T>>,
    cancel: Option<tokio::sync::oneshot::Sender<()>>,
}

impl<T> PipelineHandle<T> {
    pub(crate) fn channel() -> (
        Self,
        tokio::sync::oneshot::Sender<BatchOutcome<T>>,
        tokio::sync::oneshot::Receiver<()>,
    ) {
        let (out_tx, out_rx) = tokio::sync::oneshot::channel();
        let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel();
        (
            Self {
                rx: out_rx,
                cancel: Some(cancel_tx),
            },
            out_tx,
            cancel_rx,
        )
    }

    /// Handle that resolves immediately, for batches rejected before
    /// submission.
    pub(crate) fn ready(outcome: BatchOutcome<T>) -> Self {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let _ = tx.send(outcome);
        Self { rx, cancel: None }
    }

    pub fn cancel(&mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
    }

    /// Block the calling thread until the outcome arrives. For callers not
    /// running inside an async runtime.
    pub fn wait(self) -> BatchOutcome<T> {
        match self.rx.blocking_recv() {
            Ok(outcome) => outcome,
            Err(_) => BatchOutcome::Failed(TransportError::Closed),
        }
    }
}

impl<T> Future for PipelineHandle<T> {
    type Output = BatchOutcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(BatchOutcome::Failed(TransportError::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn origin_form(uri: &Uri) -> Uri {
    let pq = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    Uri::builder()
        .path_and_query(pq)
        .build()
        .unwrap_or_else(|_| Uri::from_static("/"))
}

fn step_timeout(what: &str) -> TransportError {
    TransportError::Io(io::Error::new(io::ErrorKind::TimedOut, what.to_string()))
}

/// Run one batch over one leased connection. Runs on the event loop thread
/// owning the pool shard.
pub(crate) async fn drive_batch<C, IO, P>(
    pool: &ConnectionPool<C, Http1Connection<IO>>,
    chain: &ProcessorChain,
    socket_timeout: Duration,
    route: &Route,
    requests: Vec<PipelinedRequest>,
    consumers: Vec<P>,
) -> BatchOutcome<P::Output>
where
    C: Connector<Route, Connection = Http1Connection<IO>, Error = TransportError>,
    IO: AsyncReadRent + AsyncWriteRent + 'static,
    P: ResponseConsumer,
{
    debug_assert_eq!(requests.len(), consumers.len());

    let mut conn = match pool.lease(route).await {
        Ok(conn) => conn,
        Err(e) => return BatchOutcome::Failed(e),
    };

    // Protocol rules run for every exchange before any bytes hit the wire so
    // a rejected head leaves the connection untouched.
    let mut contexts = Vec::with_capacity(requests.len());
    let mut wire_requests = Vec::with_capacity(requests.len());
    for request in requests {
        let (mut head, body) = request.into_parts();
        let mut cx = ExchangeContext::new();
        if let Err(e) = chain.apply_request(&mut head, &body, &mut cx) {
            conn.set_reusable(true);
            drop(conn);
            return BatchOutcome::Failed(e);
        }
        head.uri = origin_form(&head.uri);
        wire_requests.push(Request::from_parts(head, body.into_http_body()));
        contexts.push(cx);
    }

    match monoio::time::timeout(socket_timeout, conn.write_pipeline(wire_requests)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return BatchOutcome::Failed(e),
        Err(_) => {
            conn.poison();
            return BatchOutcome::Failed(step_timeout("pipelined write timed out"));
        }
    }

    let mut outputs = Vec::with_capacity(consumers.len());
    for (mut consumer, cx) in consumers.into_iter().zip(contexts.iter_mut()) {
        let response = match monoio::time::timeout(socket_timeout, conn.read_response()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return BatchOutcome::Failed(e),
            Err(_) => {
                conn.poison();
                return BatchOutcome::Failed(step_timeout("response read timed out"));
            }
        };
        let (head, body) = response.into_parts();
        if let Err(e) = chain.apply_response(&head, cx) {
            return BatchOutcome::Failed(e);
        }
        match consumer.consume(Response::from_parts(head, body)) {
            Ok(output) => outputs.push(output),
            Err(e) => return BatchOutcome::Failed(e),
        }
    }

    if conn.is_open() && contexts.iter().all(|cx| cx.reuse()) {
        conn.set_reusable(true);
    }
    // connection goes back to the pool before the outcome is observable
    drop(conn);
    BatchOutcome::Completed(outputs)
}

/// [`drive_batch`] with cooperative cancellation layered on top. A cancel
/// signal aborts the batch at the next await point and discards the
/// connection; a dropped cancel sender detaches instead.
pub(crate) async fn run_pipelined<C, IO, P>(
    pool: ConnectionPool<C, Http1Connection<IO>>,
    chain: ProcessorChain,
    socket_timeout: Duration,
    route: Route,
    requests: Vec<PipelinedRequest>,
    consumers: Vec<P>,
    cancel: tokio::sync::oneshot::Receiver<()>,
) -> BatchOutcome<P::Output>
where
    C: Connector<Route, Connection = Http1Connection<IO>, Error = TransportError>,
    IO: AsyncReadRent + AsyncWriteRent + 'static,
    P: ResponseConsumer,
{
    let drive = drive_batch(&pool, &chain, socket_timeout, &route, requests, consumers);
    futures::pin_mut!(drive);
    match futures::future::select(drive, cancel).await {
        futures::future::Either::Left((outcome, _)) => outcome,
        futures::future::Either::Right((signal, drive)) => match signal {
            Ok(()) => {
                #[cfg(feature = "logging")]
                tracing::debug!(route = %route, "pipeline batch cancelled");
                BatchOutcome::Cancelled
            }
            Err(_) => drive.await,
        },
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::SocketAddr,
    };

    use http::Method;
    use monoio::net::TcpStream;

    use super::*;
    use crate::pool::PoolConfig;

    struct LoopbackConnector {
        addr: SocketAddr,
    }

    impl Connector<Route> for LoopbackConnector {
        type Connection = Http1Connection<TcpStream>;
        type Error = TransportError;

        async fn connect(&self, _key: Route) -> Result<Self::Connection> {
            TcpStream::connect(self.addr)
                .await
                .map(Http1Connection::new)
                .map_err(TransportError::Connect)
        }
    }

    fn head_count(buf: &[u8]) -> usize {
        buf.windows(4).filter(|w| w == b"\r\n\r\n").count()
    }

    fn spawn_server(
        responses: &'static [u8],
        expected_heads: usize,
    ) -> (SocketAddr, std::thread::JoinHandle<()>) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4096];
            let mut seen = Vec::new();
            while head_count(&seen) < expected_heads {
                let n = sock.read(&mut buf).unwrap();
                assert_ne!(n, 0, "client closed early");
                seen.extend_from_slice(&buf[..n]);
            }
            sock.write_all(responses).unwrap();
        });
        (addr, handle)
    }

    fn get_request(path: &str) -> PipelinedRequest {
        Request::builder()
            .method(Method::GET)
            .uri(format!("http://batch.test{path}"))
            .body(RequestBody::None)
            .unwrap()
    }

    fn test_route() -> Route {
        Route::new(http::uri::Scheme::HTTP, "batch.test", 80)
    }

    fn consumers(n: usize) -> Vec<FullResponse> {
        (0..n).map(|_| FullResponse).collect()
    }

    #[monoio::test(enable_timer = true)]
    async fn batch_completes_in_order_on_one_connection() {
        let (addr, server) = spawn_server(
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nr1\
              HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nr2\
              HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nr3",
            3,
        );
        let pool = ConnectionPool::new(
            LoopbackConnector { addr },
            PoolConfig::default().max_per_route(2).max_total(2),
        );
        let chain = ProcessorChain::client_defaults();
        let route = test_route();

        let outcome = drive_batch(
            &pool,
            &chain,
            Duration::from_secs(5),
            &route,
            vec![get_request("/1"), get_request("/2"), get_request("/3")],
            consumers(3),
        )
        .await;

        let responses = outcome.into_result().unwrap();
        assert_eq!(responses.len(), 3);
        for (i, resp) in responses.iter().enumerate() {
            assert_eq!(resp.status(), 200);
            assert_eq!(resp.body().as_ref(), format!("r{}", i + 1).as_bytes());
        }
        // clean completion parks the single connection for reuse
        assert_eq!(pool.idle_connection_count(), 1);
        server.join().unwrap();
    }

    #[monoio::test(enable_timer = true)]
    async fn malformed_response_fails_batch_and_discards_connection() {
        let (addr, server) = spawn_server(
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nr1NOT AN HTTP STATUS LINE\r\n\r\n",
            2,
        );
        let pool = ConnectionPool::new(LoopbackConnector { addr }, PoolConfig::default());
        let chain = ProcessorChain::client_defaults();
        let route = test_route();

        let outcome = drive_batch(
            &pool,
            &chain,
            Duration::from_secs(5),
            &route,
            vec![get_request("/1"), get_request("/2")],
            consumers(2),
        )
        .await;

        match outcome {
            BatchOutcome::Failed(TransportError::Protocol(_)) => {}
            other => panic!("expected protocol failure, got {other:?}"),
        }
        assert_eq!(pool.idle_connection_count(), 0);
        server.join().unwrap();
    }

    #[monoio::test(enable_timer = true)]
    async fn cancel_aborts_batch_and_discards_connection() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        // reads the requests, never answers
        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4096];
            loop {
                match sock.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        let pool = ConnectionPool::new(LoopbackConnector { addr }, PoolConfig::default());
        let chain = ProcessorChain::client_defaults();
        let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel();

        let driver = monoio::spawn(run_pipelined(
            pool.clone(),
            chain,
            Duration::from_secs(5),
            test_route(),
            vec![get_request("/stalled")],
            consumers(1),
            cancel_rx,
        ));

        monoio::time::sleep(Duration::from_millis(20)).await;
        let _ = cancel_tx.send(());
        let outcome = driver.await;
        assert!(matches!(outcome, BatchOutcome::Cancelled));
        assert_eq!(pool.idle_connection_count(), 0);
        drop(pool);
        server.join().unwrap();
    }

    #[monoio::test(enable_timer = true)]
    async fn rejected_head_leaves_connection_reusable() {
        let (addr, server) = spawn_server(
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
            1,
        );
        let pool = ConnectionPool::new(LoopbackConnector { addr }, PoolConfig::default());
        let chain = ProcessorChain::client_defaults();
        let route = test_route();

        // second request pre-sets a framing header the chain manages
        let bad = Request::builder()
            .method(Method::POST)
            .uri("http://batch.test/bad")
            .header(http::header::CONTENT_LENGTH, "5")
            .body(RequestBody::Fixed(Bytes::from_static(b"hello")))
            .unwrap();

        let outcome = drive_batch(
            &pool,
            &chain,
            Duration::from_secs(5),
            &route,
            vec![get_request("/ok"), bad],
            consumers(2),
        )
        .await;
        match outcome {
            BatchOutcome::Failed(TransportError::Framing(_)) => {}
            other => panic!("expected framing failure, got {other:?}"),
        }
        // nothing was written: the connection is parked, not discarded
        assert_eq!(pool.idle_connection_count(), 1);

        // the parked connection still works
        let outcome = drive_batch(
            &pool,
            &chain,
            Duration::from_secs(5),
            &route,
            vec![get_request("/ok")],
            consumers(1),
        )
        .await;
        let responses = outcome.into_result().unwrap();
        assert_eq!(responses[0].body().as_ref(), b"ok");
        server.join().unwrap();
    }
}

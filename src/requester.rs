//! Public entry point for submitting pipelined batches.
//!
//! `PipeliningRequester` validates a batch on the calling thread, then hands
//! it to the route's worker event loop. The returned [`PipelineHandle`]
//! resolves with exactly one [`BatchOutcome`], delivered only after the
//! leased connection has been returned to the pool.
use std::time::Duration;

use crate::{
    error::TransportError,
    pipeline::{run_pipelined, BatchOutcome, PipelineHandle, PipelinedRequest, ResponseConsumer},
    pool::PoolConfig,
    protocol::ProcessorChain,
    reactor::{IoReactor, ReactorConfig, ShutdownStatus},
    route::Route,
};

pub struct RequesterBuilder {
    reactor_config: ReactorConfig,
    pool_config: PoolConfig,
    chain: Option<ProcessorChain>,
}

impl Default for RequesterBuilder {
    fn default() -> Self {
        Self {
            reactor_config: ReactorConfig::default(),
            pool_config: PoolConfig::default(),
            chain: None,
        }
    }
}

impl RequesterBuilder {
    pub fn worker_threads(mut self, worker_threads: usize) -> Self {
        self.reactor_config = self.reactor_config.worker_threads(worker_threads);
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.reactor_config = self.reactor_config.connect_timeout(connect_timeout);
        self
    }

    pub fn socket_timeout(mut self, socket_timeout: Duration) -> Self {
        self.reactor_config = self.reactor_config.socket_timeout(socket_timeout);
        self
    }

    pub fn shutdown_grace(mut self, shutdown_grace: Duration) -> Self {
        self.reactor_config = self.reactor_config.shutdown_grace(shutdown_grace);
        self
    }

    pub fn pool_config(mut self, pool_config: PoolConfig) -> Self {
        self.pool_config = pool_config;
        self
    }

    /// Replace the default client processor chain.
    pub fn processor_chain(mut self, chain: ProcessorChain) -> Self {
        self.chain = Some(chain);
        self
    }

    pub fn build(self) -> crate::error::Result<PipeliningRequester> {
        let chain = self.chain.unwrap_or_else(ProcessorChain::client_defaults);
        let reactor = IoReactor::new(self.reactor_config, self.pool_config, chain)?;
        Ok(PipeliningRequester { reactor })
    }
}

pub struct PipeliningRequester {
    reactor: IoReactor,
}

impl PipeliningRequester {
    pub fn builder() -> RequesterBuilder {
        RequesterBuilder::default()
    }

    /// Submit a batch of requests to be pipelined over one connection.
    ///
    /// Every request must target the same route and pair up with one
    /// consumer. A batch rejected here resolves the handle immediately
    /// without touching the pool or the network.
    pub fn execute_pipelined<P>(
        &self,
        requests: Vec<PipelinedRequest>,
        consumers: Vec<P>,
    ) -> PipelineHandle<P::Output>
    where
        P: ResponseConsumer + Send + 'static,
        P::Output: Send + 'static,
    {
        if requests.is_empty() {
            return PipelineHandle::ready(BatchOutcome::Failed(TransportError::Validation(
                "pipeline batch is empty".into(),
            )));
        }
        if requests.len() != consumers.len() {
            return PipelineHandle::ready(BatchOutcome::Failed(TransportError::Validation(
                "request and consumer counts differ".into(),
            )));
        }
        let route = match Route::try_from(requests[0].uri()) {
            Ok(route) => route,
            Err(e) => return PipelineHandle::ready(BatchOutcome::Failed(e.into())),
        };
        for request in &requests[1..] {
            match Route::try_from(request.uri()) {
                Ok(r) if r == route => {}
                Ok(_) => {
                    return PipelineHandle::ready(BatchOutcome::Failed(
                        TransportError::Validation(
                            "batch requests target different routes".into(),
                        ),
                    ));
                }
                Err(e) => return PipelineHandle::ready(BatchOutcome::Failed(e.into())),
            }
        }

        let (handle, out_tx, cancel_rx) = PipelineHandle::channel();
        let job_route = route.clone();
        self.reactor.submit(
            &route,
            Box::new(move |shared| {
                shared.inflight.set(shared.inflight.get() + 1);
                monoio::spawn(async move {
                    let outcome = run_pipelined(
                        shared.pool.clone(),
                        shared.chain.clone(),
                        shared.socket_timeout,
                        job_route,
                        requests,
                        consumers,
                        cancel_rx,
                    )
                    .await;
                    let _ = out_tx.send(outcome);
                    shared.inflight.set(shared.inflight.get() - 1);
                });
            }),
        );
        handle
    }

    /// Stop accepting batches and drain the workers. Returns whether every
    /// in flight batch finished within the shutdown grace period.
    pub fn shutdown(self) -> crate::error::Result<ShutdownStatus> {
        self.reactor.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::TcpListener,
        time::Instant,
    };

    use http::{Method, Request};

    use super::*;
    use crate::pipeline::{FullResponse, RequestBody};

    fn get_request(base: &str, path: &str) -> PipelinedRequest {
        Request::builder()
            .method(Method::GET)
            .uri(format!("{base}{path}"))
            .body(RequestBody::None)
            .unwrap()
    }

    fn consumers(n: usize) -> Vec<FullResponse> {
        (0..n).map(|_| FullResponse).collect()
    }

    fn head_count(buf: &[u8]) -> usize {
        buf.windows(4).filter(|w| w == b"\r\n\r\n").count()
    }

    fn read_heads(sock: &mut std::net::TcpStream, n: usize) {
        let mut buf = [0u8; 4096];
        let mut seen = Vec::new();
        while head_count(&seen) < n {
            let read = sock.read(&mut buf).unwrap();
            assert_ne!(read, 0, "client closed early");
            seen.extend_from_slice(&buf[..read]);
        }
    }

    #[test]
    fn empty_batch_is_rejected_without_io() {
        let requester = PipeliningRequester::builder().build().unwrap();
        let outcome = requester
            .execute_pipelined(Vec::new(), consumers(0))
            .wait();
        match outcome {
            BatchOutcome::Failed(TransportError::Validation(msg)) => {
                assert!(msg.contains("empty"));
            }
            other => panic!("expected validation failure, got {other:?}"),
        }
        assert_eq!(requester.shutdown().unwrap(), ShutdownStatus::Clean);
    }

    #[test]
    fn mismatched_consumer_count_is_rejected() {
        let requester = PipeliningRequester::builder().build().unwrap();
        let outcome = requester
            .execute_pipelined(
                vec![get_request("http://mismatch.test", "/only")],
                consumers(2),
            )
            .wait();
        assert!(matches!(
            outcome,
            BatchOutcome::Failed(TransportError::Validation(_))
        ));
        assert_eq!(requester.shutdown().unwrap(), ShutdownStatus::Clean);
    }

    #[test]
    fn mixed_route_batch_is_rejected() {
        let requester = PipeliningRequester::builder().build().unwrap();
        let outcome = requester
            .execute_pipelined(
                vec![
                    get_request("http://one.test", "/a"),
                    get_request("http://two.test", "/b"),
                ],
                consumers(2),
            )
            .wait();
        match outcome {
            BatchOutcome::Failed(TransportError::Validation(msg)) => {
                assert!(msg.contains("different routes"));
            }
            other => panic!("expected validation failure, got {other:?}"),
        }
        assert_eq!(requester.shutdown().unwrap(), ShutdownStatus::Clean);
    }

    #[test]
    fn batches_share_one_reusable_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        // a single accepted socket serves both batches
        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            read_heads(&mut sock, 3);
            sock.write_all(
                b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nr1\
                  HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nr2\
                  HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nr3",
            )
            .unwrap();
            read_heads(&mut sock, 2);
            sock.write_all(
                b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nr4\
                  HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nr5",
            )
            .unwrap();
        });
        let base = format!("http://{addr}");

        let requester = PipeliningRequester::builder().build().unwrap();
        let responses = requester
            .execute_pipelined(
                vec![
                    get_request(&base, "/1"),
                    get_request(&base, "/2"),
                    get_request(&base, "/3"),
                ],
                consumers(3),
            )
            .wait()
            .into_result()
            .unwrap();
        for (i, resp) in responses.iter().enumerate() {
            assert_eq!(resp.status(), 200);
            assert_eq!(resp.body().as_ref(), format!("r{}", i + 1).as_bytes());
        }

        let responses = requester
            .execute_pipelined(
                vec![get_request(&base, "/4"), get_request(&base, "/5")],
                consumers(2),
            )
            .wait()
            .into_result()
            .unwrap();
        assert_eq!(responses[0].body().as_ref(), b"r4");
        assert_eq!(responses[1].body().as_ref(), b"r5");

        server.join().unwrap();
        assert_eq!(requester.shutdown().unwrap(), ShutdownStatus::Clean);
    }

    #[test]
    fn exhausted_pool_fails_with_lease_timeout() {
        let requester = PipeliningRequester::builder()
            .pool_config(
                PoolConfig::default()
                    .max_total(0)
                    .lease_timeout(Duration::from_millis(50)),
            )
            .build()
            .unwrap();

        let start = Instant::now();
        let outcome = requester
            .execute_pipelined(
                vec![get_request("http://starved.test", "/never")],
                consumers(1),
            )
            .wait();
        let elapsed = start.elapsed();

        assert!(matches!(
            outcome,
            BatchOutcome::Failed(TransportError::PoolTimeout)
        ));
        assert!(elapsed >= Duration::from_millis(40), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "elapsed {elapsed:?}");
        assert_eq!(requester.shutdown().unwrap(), ShutdownStatus::Clean);
    }

    #[test]
    fn malformed_response_resolves_exactly_one_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            read_heads(&mut sock, 2);
            sock.write_all(
                b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nr1NOT AN HTTP STATUS LINE\r\n\r\n",
            )
            .unwrap();
        });
        let base = format!("http://{addr}");

        let requester = PipeliningRequester::builder().build().unwrap();
        let outcome = requester
            .execute_pipelined(
                vec![get_request(&base, "/1"), get_request(&base, "/2")],
                consumers(2),
            )
            .wait();
        assert!(matches!(
            outcome,
            BatchOutcome::Failed(TransportError::Protocol(_))
        ));

        server.join().unwrap();
        assert_eq!(requester.shutdown().unwrap(), ShutdownStatus::Clean);
    }

    #[test]
    fn cancel_resolves_handle_with_cancelled() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        // reads the request, never answers
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
        let base = format!("http://{addr}");

        let requester = PipeliningRequester::builder().build().unwrap();
        let mut handle = requester.execute_pipelined(
            vec![get_request(&base, "/stalled")],
            consumers(1),
        );
        std::thread::sleep(Duration::from_millis(20));
        handle.cancel();
        assert!(matches!(handle.wait(), BatchOutcome::Cancelled));

        assert_eq!(requester.shutdown().unwrap(), ShutdownStatus::Clean);
        server.join().unwrap();
    }
}

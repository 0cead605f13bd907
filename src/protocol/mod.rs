//! Message level protocol enforcement.
//!
//! Every request head passes through a `ProcessorChain` before it is written
//! and every response head passes through the same chain after its status
//! line is parsed. Individual rules live in [`interceptors`].
pub mod interceptors;

use std::sync::Arc;

use http::{request, response};

use crate::{error::Result, pipeline::RequestBody};

/// Per exchange scratch state carried from the request side of the chain to
/// the response side. The reuse flag starts optimistic and is cleared by any
/// processor that sees a reason to close the connection.
#[derive(Debug)]
pub struct ExchangeContext {
    reuse: bool,
}

impl ExchangeContext {
    pub fn new() -> Self {
        Self { reuse: true }
    }

    #[inline]
    pub fn set_reuse(&mut self, reuse: bool) {
        self.reuse = reuse;
    }

    #[inline]
    pub fn reuse(&self) -> bool {
        self.reuse
    }
}

impl Default for ExchangeContext {
    fn default() -> Self {
        Self::new()
    }
}

/// One protocol rule, applied symmetrically: outgoing request heads and
/// incoming response heads. Implementations override whichever side they
/// care about.
pub trait HttpProcessor {
    fn process_request(
        &self,
        head: &mut request::Parts,
        body: &RequestBody,
        cx: &mut ExchangeContext,
    ) -> Result<()> {
        let _ = (head, body, cx);
        Ok(())
    }

    fn process_response(&self, head: &response::Parts, cx: &mut ExchangeContext) -> Result<()> {
        let _ = (head, cx);
        Ok(())
    }
}

/// Ordered, shareable list of processors. Cloning is cheap and clones applied
/// on different worker threads see the same rules.
#[derive(Clone)]
pub struct ProcessorChain {
    processors: Arc<[Arc<dyn HttpProcessor + Send + Sync>]>,
}

impl ProcessorChain {
    pub fn builder() -> ProcessorChainBuilder {
        ProcessorChainBuilder {
            processors: Vec::new(),
        }
    }

    /// The standard client side chain: content framing, target host,
    /// connection control and user agent on the way out, connection control
    /// on the way back.
    pub fn client_defaults() -> Self {
        Self::builder()
            .add(interceptors::RequestContent)
            .add(interceptors::RequestTargetHost)
            .add(interceptors::RequestConnControl)
            .add(interceptors::RequestUserAgent::default())
            .add(interceptors::ResponseConnControl)
            .build()
    }

    pub fn apply_request(
        &self,
        head: &mut request::Parts,
        body: &RequestBody,
        cx: &mut ExchangeContext,
    ) -> Result<()> {
        for p in self.processors.iter() {
            p.process_request(head, body, cx)?;
        }
        Ok(())
    }

    pub fn apply_response(&self, head: &response::Parts, cx: &mut ExchangeContext) -> Result<()> {
        for p in self.processors.iter() {
            p.process_response(head, cx)?;
        }
        Ok(())
    }
}

pub struct ProcessorChainBuilder {
    processors: Vec<Arc<dyn HttpProcessor + Send + Sync>>,
}

impl ProcessorChainBuilder {
    pub fn add<P: HttpProcessor + Send + Sync + 'static>(mut self, processor: P) -> Self {
        self.processors.push(Arc::new(processor));
        self
    }

    pub fn build(self) -> ProcessorChain {
        ProcessorChain {
            processors: self.processors.into(),
        }
    }
}

use bytes::{Bytes, BytesMut};
use http::Response;
use monoio::io::{sink::Sink, stream::Stream, AsyncReadRent, AsyncWriteRent, Split};
use monoio_http::{
    common::body::Body,
    common::error::HttpError,
    h1::codec::{
        decoder::{DecodeError, PayloadDecoder},
        ClientCodec,
    },
};

use crate::{
    error::{Result, TransportError},
    pool::Poolable,
};

/// HTTP/1.1 client connection with the send and receive sides decoupled:
/// a pipeline writes every request before the first response is read.
///
/// Any send or decode error marks the connection closed. The framing
/// position after a failure is unknowable, so a poisoned connection never
/// reports itself open again.
pub struct Http1Connection<IO: AsyncWriteRent> {
    framed: ClientCodec<IO>,
    inflight: usize,
    open: bool,
}

impl<IO: AsyncWriteRent + Split> Http1Connection<IO> {
    pub fn new(io: IO) -> Self {
        Self {
            framed: ClientCodec::new(io),
            inflight: 0,
            open: true,
        }
    }
}

impl<IO: AsyncWriteRent> Http1Connection<IO> {
    /// Requests written whose final response has not been read yet.
    #[inline]
    pub fn inflight(&self) -> usize {
        self.inflight
    }

    #[inline]
    pub(crate) fn poison(&mut self) {
        self.open = false;
    }
}

impl<IO: AsyncWriteRent> Poolable for Http1Connection<IO> {
    #[inline]
    fn is_open(&self) -> bool {
        self.open
    }
}

impl<IO: AsyncReadRent + AsyncWriteRent> Http1Connection<IO> {
    /// Write a run of requests back to back and flush once.
    pub async fn write_pipeline<R, E>(&mut self, requests: Vec<R>) -> Result<()>
    where
        ClientCodec<IO>: Sink<R, Error = E>,
        E: std::fmt::Debug + Into<HttpError>,
    {
        for request in requests {
            if let Err(e) = self.framed.send(request).await {
                #[cfg(feature = "logging")]
                tracing::error!("send pipelined request error {:?}", e);
                self.open = false;
                return Err(TransportError::Protocol(e.into()));
            }
            self.inflight += 1;
        }
        if let Err(e) = self.framed.flush().await {
            #[cfg(feature = "logging")]
            tracing::error!("flush pipelined requests error {:?}", e);
            self.open = false;
            return Err(TransportError::Protocol(e.into()));
        }
        Ok(())
    }

    /// Read the next final response head and aggregate its body. Interim
    /// (1xx) responses are skipped without consuming an in flight slot.
    pub async fn read_response(&mut self) -> Result<Response<Bytes>> {
        loop {
            match self.framed.next().await {
                Some(Ok(resp)) => {
                    let (parts, payload_decoder) = resp.into_parts();
                    if parts.status.is_informational() {
                        #[cfg(feature = "logging")]
                        tracing::debug!(status = %parts.status, "skipping interim response");
                        continue;
                    }
                    let body = match payload_decoder {
                        PayloadDecoder::None => Bytes::new(),
                        PayloadDecoder::Fixed(_) => {
                            let mut framed_payload = payload_decoder.with_io(&mut self.framed);
                            match framed_payload.next_data().await {
                                Some(Ok(data)) => data,
                                Some(Err(e)) => {
                                    #[cfg(feature = "logging")]
                                    tracing::error!("decode response payload error {:?}", e);
                                    self.open = false;
                                    return Err(TransportError::Protocol(e));
                                }
                                None => Bytes::new(),
                            }
                        }
                        PayloadDecoder::Streamed(_) => {
                            let mut framed_payload = payload_decoder.with_io(&mut self.framed);
                            let mut buf = BytesMut::new();
                            loop {
                                match framed_payload.next_data().await {
                                    Some(Ok(data)) => buf.extend_from_slice(&data),
                                    Some(Err(e)) => {
                                        #[cfg(feature = "logging")]
                                        tracing::error!(
                                            "decode response payload error {:?}",
                                            e
                                        );
                                        self.open = false;
                                        return Err(TransportError::Protocol(e));
                                    }
                                    None => break,
                                }
                            }
                            buf.freeze()
                        }
                    };
                    self.inflight = self.inflight.saturating_sub(1);
                    return Ok(Response::from_parts(parts, body));
                }
                Some(Err(e)) => {
                    #[cfg(feature = "logging")]
                    tracing::error!("decode response head error {:?}", e);
                    self.open = false;
                    return Err(TransportError::Protocol(e));
                }
                None => {
                    #[cfg(feature = "logging")]
                    tracing::error!("peer closed with responses outstanding");
                    self.open = false;
                    return Err(TransportError::Protocol(DecodeError::UnexpectedEof.into()));
                }
            }
        }
    }
}

use std::{io, time::Duration};

use monoio::io::{AsyncReadRent, AsyncWriteRent, Split};

use super::connection::Http1Connection;
use crate::connectors::{Connector, ConnectorExt};

/// Dials the transport under a bounded connect timeout and wraps the stream
/// in an HTTP/1.1 client connection.
#[derive(Clone)]
pub struct HttpConnector<C> {
    inner_connector: C,
    connect_timeout: Duration,
}

impl<C> HttpConnector<C> {
    pub fn new(inner_connector: C, connect_timeout: Duration) -> Self {
        Self {
            inner_connector,
            connect_timeout,
        }
    }
}

impl<T, C> Connector<T> for HttpConnector<C>
where
    C: Connector<T, Error = io::Error>,
    C::Connection: AsyncReadRent + AsyncWriteRent + Split,
{
    type Connection = Http1Connection<C::Connection>;
    type Error = crate::error::TransportError;

    async fn connect(&self, key: T) -> Result<Self::Connection, Self::Error> {
        match self
            .inner_connector
            .connect_with_timeout(key, self.connect_timeout)
            .await
        {
            Ok(Ok(io)) => Ok(Http1Connection::new(io)),
            Ok(Err(e)) => Err(crate::error::TransportError::Connect(e)),
            Err(_) => Err(crate::error::TransportError::Connect(io::Error::new(
                io::ErrorKind::TimedOut,
                "connect timed out",
            ))),
        }
    }
}

use std::{io, net::ToSocketAddrs};

use monoio::net::TcpStream;

use super::Connector;

#[derive(Default, Clone, Copy, Debug)]
pub struct TcpConnector {
    pub no_delay: bool,
}

impl<T: ToSocketAddrs> Connector<T> for TcpConnector {
    type Connection = TcpStream;
    type Error = io::Error;

    #[inline]
    async fn connect(&self, key: T) -> Result<Self::Connection, Self::Error> {
        TcpStream::connect(key).await.map(|io| {
            if self.no_delay {
                // we will ignore the set nodelay error
                let _ = io.set_nodelay(true);
            }
            io
        })
    }
}

mod connection;
mod connector;

pub use connection::Http1Connection;
pub use connector::HttpConnector;

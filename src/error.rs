use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum TransportError {
    #[error("invalid pipeline batch: {0}")]
    Validation(String),
    #[error("no pooled connection available within the lease timeout")]
    PoolTimeout,
    #[error("connect error: {0}")]
    Connect(#[source] std::io::Error),
    #[error("framing error: {0}")]
    Framing(String),
    #[error("protocol error: {0}")]
    Protocol(#[from] monoio_http::common::error::HttpError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("pipeline cancelled")]
    Cancelled,
    #[error("transport shut down")]
    Closed,
    #[error("reactor worker terminated abnormally: {0}")]
    Worker(String),
    #[error("invalid route: {0}")]
    Route(#[from] RouteError),
}

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(ThisError, Debug)]
pub enum RouteError {
    #[error("scheme not supported")]
    UnsupportedScheme,
    #[error("missing authority in uri")]
    NoAuthority,
}

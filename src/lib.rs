mod error;
pub use error::{Result, RouteError, TransportError};

pub mod connectors;
pub mod http;
pub mod pipeline;
pub mod pool;
pub mod protocol;
pub mod reactor;
mod requester;
pub mod route;

pub use pipeline::{
    BatchOutcome, FullResponse, PipelineHandle, PipelinedRequest, RequestBody, ResponseConsumer,
};
pub use reactor::{IoReactor, ReactorConfig, ShutdownStatus};
pub use requester::{PipeliningRequester, RequesterBuilder};
pub use route::Route;

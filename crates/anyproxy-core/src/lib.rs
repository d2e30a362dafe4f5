pub mod engine;
pub mod error;
pub mod router;
pub mod state;
pub mod stream;
pub mod upstream;

pub use engine::{ChatCall, EngineResponse, ProxyEngine, RawCall};
pub use error::ProxyError;
pub use state::AppState;
pub use upstream::{
    ReqwestUpstreamClient, UpstreamBody, UpstreamClient, UpstreamFailure, UpstreamRequest,
    UpstreamResponse,
};

pub mod engine;
pub mod network;
pub mod protocol;
pub mod service;
pub mod utils;

pub use engine::{Http2Engine, PartialStream, Role, StreamWriter};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, Client, EchoService, EngineConfig,
    Server, Shutdown,
};

pub use app_error::{AppError, AppResult};
pub use client::Client;
pub use config::{
    BufferPoolConfig, EngineConfig, Http2Config, LogConfig, NetworkConfig, SessionExecutorConfig,
    TlsConfig, TlsHostConfig, ENV_PREFIX,
};
pub use echo::EchoService;
pub use server::Server;
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing, TracingGuard};

mod app_error;
mod client;
mod config;
mod echo;
mod server;
mod shutdown;
mod tracing_config;

// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;

use rustls::ClientConfig;
use tokio::net::ToSocketAddrs;
use tracing::debug;

use super::EngineConfig;
use crate::engine::{EngineListenerFactory, Http2Engine, Role};
use crate::network::{BufferPool, Channel, TcpChannel, TlsChannel};
use crate::utils::SessionExecutor;
use crate::AppResult;

/// Opens client connections that share one executor and buffer pool.
#[derive(Clone)]
pub struct Client {
    config: Arc<EngineConfig>,
    executor: SessionExecutor,
    pool: Arc<BufferPool>,
    tls: Option<Arc<ClientConfig>>,
}

impl Client {
    pub fn new(config: Arc<EngineConfig>, executor: SessionExecutor) -> Self {
        let pool = Arc::new(BufferPool::new(&config.buffer_pool));
        Client {
            config,
            executor,
            pool,
            tls: None,
        }
    }

    /// Wrap every connection in TLS using `tls`.
    pub fn with_tls(mut self, tls: Arc<ClientConfig>) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Connect, finish the TLS handshake if configured, and start an engine
    /// in the client role. `server_name` is sent as SNI.
    pub async fn connect<A: ToSocketAddrs>(
        &self,
        addr: A,
        server_name: &str,
        factory: &dyn EngineListenerFactory,
    ) -> AppResult<Http2Engine> {
        let raw: Arc<dyn Channel> = Arc::new(
            TcpChannel::connect(addr, self.pool.clone(), &self.config.network).await?,
        );
        let channel: Arc<dyn Channel> = match &self.tls {
            Some(tls) => Arc::new(
                TlsChannel::connect(raw, tls.clone(), server_name, &self.config.tls).await?,
            ),
            None => raw,
        };
        debug!(
            "client connected to {} ({}) on channel {}",
            channel.remote_addr(),
            server_name,
            channel.channel_id()
        );
        let engine = Http2Engine::new(
            Role::Client,
            channel,
            self.executor.clone(),
            &self.config.http2,
            factory,
        );
        engine.start()?;
        Ok(engine)
    }
}

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

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

use super::{EngineConfig, Shutdown};
use crate::engine::{
    ControlFrame, EngineListener, EngineListenerFactory, Http2Engine, PartialStream, Role,
    StreamWriter,
};
use crate::network::{
    BufferPool, Channel, ConnectionListener, DataListener, HostConfigs, TcpChannel, TlsChannel,
};
use crate::protocol::Http2ErrorCode;
use crate::utils::SessionExecutor;
use crate::{AppError, AppResult};

/// What every accepted connection needs to build its engine.
struct Shared {
    config: Arc<EngineConfig>,
    executor: SessionExecutor,
    factory: Arc<dyn EngineListenerFactory>,
    connections: Arc<DashMap<u64, Http2Engine>>,
}

impl Shared {
    fn create_engine(
        &self,
        channel: Arc<dyn Channel>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Http2Engine {
        let channel_id = channel.channel_id();
        let tracking = TrackingFactory {
            factory: self.factory.clone(),
            connections: self.connections.clone(),
            channel_id,
            permit: Mutex::new(permit),
        };
        let engine = Http2Engine::new(
            Role::Server,
            channel,
            self.executor.clone(),
            &self.config.http2,
            &tracking,
        );
        self.connections.insert(channel_id, engine.clone());
        engine
    }
}

/// Wraps the collaborator's listener so the connection leaves the registry
/// and frees its slot once the engine lets go of it.
struct TrackingFactory {
    factory: Arc<dyn EngineListenerFactory>,
    connections: Arc<DashMap<u64, Http2Engine>>,
    channel_id: u64,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl EngineListenerFactory for TrackingFactory {
    fn create(&self, writer: StreamWriter) -> Arc<dyn EngineListener> {
        Arc::new(TrackedListener {
            inner: self.factory.create(writer),
            connections: self.connections.clone(),
            channel_id: self.channel_id,
            _permit: self.permit.lock().take(),
        })
    }
}

struct TrackedListener {
    inner: Arc<dyn EngineListener>,
    connections: Arc<DashMap<u64, Http2Engine>>,
    channel_id: u64,
    _permit: Option<OwnedSemaphorePermit>,
}

impl EngineListener for TrackedListener {
    fn incoming_payload(&self, payload: PartialStream) {
        self.inner.incoming_payload(payload);
    }

    fn stream_reset(&self, stream_id: u32, error_code: Http2ErrorCode) {
        self.inner.stream_reset(stream_id, error_code);
    }

    fn control_frame(&self, frame: ControlFrame) {
        self.inner.control_frame(frame);
    }

    fn far_end_closed(&self) {
        self.inner.far_end_closed();
    }

    fn failure(&self, error: AppError) {
        self.inner.failure(error);
    }

    fn apply_back_pressure(&self) {
        self.inner.apply_back_pressure();
    }

    fn release_back_pressure(&self) {
        self.inner.release_back_pressure();
    }
}

impl Drop for TrackedListener {
    fn drop(&mut self) {
        self.connections.remove(&self.channel_id);
        debug!("connection {} released", self.channel_id);
    }
}

/// Builds the engine once the TLS handshake of an accepted socket is done.
struct TlsAcceptor {
    shared: Arc<Shared>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl ConnectionListener for TlsAcceptor {
    fn connected(&self, channel: Arc<dyn Channel>) -> Arc<dyn DataListener> {
        let engine = self.shared.create_engine(channel, self.permit.lock().take());
        engine.start_accepted()
    }

    fn failed(&self, remote_addr: SocketAddr, error: AppError) {
        warn!("TLS handshake with {} failed: {}", remote_addr, error);
        self.permit.lock().take();
    }
}

pub struct Server {
    listener: TcpListener,
    limit_connections: Arc<Semaphore>,
    pool: Arc<BufferPool>,
    host_configs: Option<Arc<HostConfigs>>,
    shared: Arc<Shared>,
}

impl Server {
    /// Bind the configured listen address and load TLS material if enabled.
    pub async fn bind(
        config: Arc<EngineConfig>,
        executor: SessionExecutor,
        factory: Arc<dyn EngineListenerFactory>,
    ) -> AppResult<Server> {
        let listen_address = config.listen_address();
        let listener = TcpListener::bind(&listen_address).await.map_err(|e| {
            let message = format!(
                "Failed to bind server to address: {} - Error: {}",
                listen_address, e
            );
            error!(message);
            AppError::IllegalStateError(message)
        })?;
        info!("tcp server binding to {} for listening", listen_address);

        let host_configs = if config.tls.enabled {
            Some(Arc::new(HostConfigs::from_config(&config.tls)?))
        } else {
            None
        };
        Ok(Server {
            listener,
            limit_connections: Arc::new(Semaphore::new(config.network.max_connection)),
            pool: Arc::new(BufferPool::new(&config.buffer_pool)),
            host_configs,
            shared: Arc::new(Shared {
                config,
                executor,
                factory,
                connections: Arc::new(DashMap::new()),
            }),
        })
    }

    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Number of connections with a live engine.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    /// Accept connections until `shutdown` fires, then close every
    /// connection with GOAWAY.
    ///
    /// A connection holds one permit of the connection limit from accept
    /// until its engine lets go of the collaborator's listener.
    pub async fn run(&self, mut shutdown: Shutdown) -> AppResult<()> {
        loop {
            let permit = tokio::select! {
                permit = self.limit_connections.clone().acquire_owned() => {
                    permit.map_err(|e| AppError::IllegalStateError(format!("connection limiter closed: {}", e)))?
                }
                _ = shutdown.recv() => break,
            };
            let socket = tokio::select! {
                socket = self.accept() => socket?,
                _ = shutdown.recv() => break,
            };
            if let Err(e) = self.serve(socket, permit) {
                error!("failed to set up connection: {}", e);
            }
        }
        debug!("accept loop stopped, closing {} connections", self.connection_count());
        self.close_all().await;
        Ok(())
    }

    fn serve(&self, socket: TcpStream, permit: OwnedSemaphorePermit) -> AppResult<()> {
        let raw = Arc::new(TcpChannel::from_stream(
            socket,
            self.pool.clone(),
            &self.shared.config.network,
        )?);
        match &self.host_configs {
            Some(host_configs) => {
                let acceptor = Arc::new(TlsAcceptor {
                    shared: self.shared.clone(),
                    permit: Mutex::new(Some(permit)),
                });
                TlsChannel::accept(
                    raw,
                    host_configs.clone(),
                    acceptor,
                    &self.shared.config.tls,
                )?;
            }
            None => {
                let channel_id = raw.channel_id();
                let engine = self.shared.create_engine(raw, Some(permit));
                if let Err(e) = engine.start() {
                    self.shared.connections.remove(&channel_id);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn accept(&self) -> AppResult<TcpStream> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok((socket, _)) => return Ok(socket),
                Err(err) => {
                    if backoff > 64 {
                        return Err(AppError::Accept(format!(
                            "accept tcp server error: {}",
                            err
                        )));
                    }
                    warn!("accept failed, retrying in {}s: {}", backoff, err);
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }

    async fn close_all(&self) {
        let engines: Vec<Http2Engine> = self
            .shared
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let closing: Vec<_> = engines
            .into_iter()
            .map(|engine| tokio::spawn(async move { engine.close().await }))
            .collect();
        for handle in closing {
            match handle.await {
                Ok(Err(e)) => debug!("closing connection failed: {}", e),
                Err(e) => error!("closing connection panicked: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        debug!("tcp server dropped");
    }
}

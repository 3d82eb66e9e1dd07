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

//! TLS on top of any [`Channel`].
//!
//! Server side sessions start by feeding the first bytes into a
//! [`rustls::server::Acceptor`], which only parses the ClientHello. The SNI
//! host name picks the [`ServerConfig`] before the real session exists.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::{Acceptor, AcceptedAlert};
use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection};
use tokio::sync::oneshot;
use tracing::{debug, error, trace, warn};

use super::channel::{ready, Channel, ChannelFuture, ConnectionListener, DataListener};
use crate::service::TlsConfig;
use crate::{AppError, AppResult};

/// Server configurations keyed by SNI host name.
#[derive(Clone)]
pub struct HostConfigs {
    default_host: String,
    hosts: HashMap<String, Arc<ServerConfig>>,
}

impl std::fmt::Debug for HostConfigs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostConfigs")
            .field("default_host", &self.default_host)
            .field("hosts", &self.hosts.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HostConfigs {
    pub fn new(default_host: &str, default_config: Arc<ServerConfig>) -> Self {
        let default_host = default_host.to_ascii_lowercase();
        let mut hosts = HashMap::new();
        hosts.insert(default_host.clone(), default_config);
        HostConfigs {
            default_host,
            hosts,
        }
    }

    pub fn with_host(mut self, host: &str, config: Arc<ServerConfig>) -> Self {
        self.hosts.insert(host.to_ascii_lowercase(), config);
        self
    }

    /// Load every configured host's certificate chain and key from PEM files.
    pub fn from_config(config: &TlsConfig) -> AppResult<Self> {
        let mut hosts = HashMap::with_capacity(config.hosts.len());
        for host in &config.hosts {
            let server_config = load_server_config(&host.cert_path, &host.key_path)?;
            hosts.insert(host.host.to_ascii_lowercase(), server_config);
        }
        let default_host = config.default_host.to_ascii_lowercase();
        if !hosts.contains_key(&default_host) {
            return Err(AppError::InvalidValue(format!(
                "no certificate configured for default host {}",
                config.default_host
            )));
        }
        Ok(HostConfigs {
            default_host,
            hosts,
        })
    }

    /// Pick the configuration for a ClientHello's SNI value, falling back to
    /// the default host.
    pub fn select(&self, server_name: Option<&str>) -> Option<Arc<ServerConfig>> {
        match server_name {
            Some(name) => match self.hosts.get(&name.to_ascii_lowercase()) {
                Some(config) => return Some(config.clone()),
                None => warn!(
                    "no certificate for SNI host {}, using default host {}",
                    name, self.default_host
                ),
            },
            None => warn!(
                "client sent no SNI host name, using default host {}",
                self.default_host
            ),
        }
        self.hosts.get(&self.default_host).cloned()
    }
}

pub fn load_server_config(cert_path: &str, key_path: &str) -> AppResult<Arc<ServerConfig>> {
    let certs = CertificateDer::pem_file_iter(cert_path)
        .and_then(|certs| certs.collect::<Result<Vec<_>, _>>())
        .map_err(|e| {
            AppError::InvalidValue(format!("certificates in {}: {}", cert_path, e))
        })?;
    if certs.is_empty() {
        return Err(AppError::InvalidValue(format!(
            "no certificate found in {}",
            cert_path
        )));
    }
    let key = PrivateKeyDer::from_pem_file(key_path)
        .map_err(|e| AppError::InvalidValue(format!("private key in {}: {}", key_path, e)))?;
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"h2".to_vec()];
    Ok(Arc::new(config))
}

enum Session {
    Server(ServerConnection),
    Client(ClientConnection),
}

impl Session {
    fn read_tls(&mut self, rd: &mut dyn io::Read) -> io::Result<usize> {
        match self {
            Session::Server(c) => c.read_tls(rd),
            Session::Client(c) => c.read_tls(rd),
        }
    }

    fn write_tls(&mut self, wr: &mut dyn io::Write) -> io::Result<usize> {
        match self {
            Session::Server(c) => c.write_tls(wr),
            Session::Client(c) => c.write_tls(wr),
        }
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            Session::Server(c) => c.process_new_packets(),
            Session::Client(c) => c.process_new_packets(),
        }
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            Session::Server(c) => c.reader(),
            Session::Client(c) => c.reader(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            Session::Server(c) => c.writer(),
            Session::Client(c) => c.writer(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            Session::Server(c) => c.wants_write(),
            Session::Client(c) => c.wants_write(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match self {
            Session::Server(c) => c.is_handshaking(),
            Session::Client(c) => c.is_handshaking(),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            Session::Server(c) => c.send_close_notify(),
            Session::Client(c) => c.send_close_notify(),
        }
    }

    fn server_name(&self) -> Option<&str> {
        match self {
            Session::Server(c) => c.server_name(),
            Session::Client(_) => None,
        }
    }
}

enum TlsState {
    /// server waiting for a complete ClientHello
    Sniffing(Box<Acceptor>),
    Active(Session),
    Failed,
}

/// Plaintext travelling upward, buffered until someone registers for reads.
#[derive(Default)]
struct Upward {
    listener: Option<Arc<dyn DataListener>>,
    buffered: Vec<Bytes>,
    far_end_closed: bool,
    failure: Option<AppError>,
}

#[derive(Default)]
struct ReadOutcome {
    plaintext: Vec<Bytes>,
    handshake_done: bool,
    peer_closed: bool,
}

struct TlsInner {
    raw: Arc<dyn Channel>,
    state: Mutex<TlsState>,
    upward: Mutex<Upward>,
    host_configs: Option<Arc<HostConfigs>>,
    connection_listener: Option<Arc<dyn ConnectionListener>>,
    handshake_tx: Mutex<Option<oneshot::Sender<AppResult<()>>>>,
    close_waiter: Mutex<Option<oneshot::Sender<()>>>,
    server_name: Mutex<Option<String>>,
    closing: AtomicBool,
    peer_closed: AtomicBool,
    failed: AtomicBool,
    close_timeout: Duration,
}

/// A [`Channel`] that encrypts on write and decrypts on read.
#[derive(Clone)]
pub struct TlsChannel {
    inner: Arc<TlsInner>,
}

impl std::fmt::Debug for TlsChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsChannel")
            .field("id", &self.inner.raw.channel_id())
            .field("remote_addr", &self.inner.raw.remote_addr())
            .finish()
    }
}

struct RawListener {
    inner: Arc<TlsInner>,
}

impl DataListener for RawListener {
    fn incoming_data(&self, data: Bytes) {
        TlsInner::on_raw_data(&self.inner, data);
    }

    fn far_end_closed(&self) {
        debug!("channel {} closed underneath TLS", self.inner.raw.channel_id());
        self.inner.on_peer_closed();
    }

    fn failure(&self, _undelivered: Bytes, error: AppError) {
        // undelivered bytes are ciphertext and mean nothing upward
        self.inner.fail(error);
    }

    fn apply_back_pressure(&self) {
        if let Some(listener) = self.inner.upward.lock().listener.clone() {
            listener.apply_back_pressure();
        }
    }

    fn release_back_pressure(&self) {
        if let Some(listener) = self.inner.upward.lock().listener.clone() {
            listener.release_back_pressure();
        }
    }
}

impl TlsChannel {
    fn with_state(
        raw: Arc<dyn Channel>,
        state: TlsState,
        config: &TlsConfig,
        host_configs: Option<Arc<HostConfigs>>,
        connection_listener: Option<Arc<dyn ConnectionListener>>,
        handshake_tx: Option<oneshot::Sender<AppResult<()>>>,
    ) -> Self {
        TlsChannel {
            inner: Arc::new(TlsInner {
                raw,
                state: Mutex::new(state),
                upward: Mutex::new(Upward::default()),
                host_configs,
                connection_listener,
                handshake_tx: Mutex::new(handshake_tx),
                close_waiter: Mutex::new(None),
                server_name: Mutex::new(None),
                closing: AtomicBool::new(false),
                peer_closed: AtomicBool::new(false),
                failed: AtomicBool::new(false),
                close_timeout: Duration::from_millis(config.close_timeout_ms),
            }),
        }
    }

    /// Start the server side of a session on an accepted channel. Once the
    /// handshake completes `connection_listener.connected` is called with the
    /// secured channel.
    pub fn accept(
        raw: Arc<dyn Channel>,
        host_configs: Arc<HostConfigs>,
        connection_listener: Arc<dyn ConnectionListener>,
        config: &TlsConfig,
    ) -> AppResult<TlsChannel> {
        let channel = Self::with_state(
            raw.clone(),
            TlsState::Sniffing(Box::default()),
            config,
            Some(host_configs),
            Some(connection_listener),
            None,
        );
        raw.register_for_reads(Arc::new(RawListener {
            inner: channel.inner.clone(),
        }))?;
        Ok(channel)
    }

    /// Run the client side of a handshake; resolves once it completed.
    pub async fn connect(
        raw: Arc<dyn Channel>,
        client_config: Arc<ClientConfig>,
        server_name: &str,
        config: &TlsConfig,
    ) -> AppResult<TlsChannel> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| AppError::InvalidValue(format!("server name {}: {}", server_name, e)))?;
        let session = ClientConnection::new(client_config, name)?;
        let (tx, rx) = oneshot::channel();
        let channel = Self::with_state(
            raw.clone(),
            TlsState::Active(Session::Client(session)),
            config,
            None,
            None,
            Some(tx),
        );
        raw.register_for_reads(Arc::new(RawListener {
            inner: channel.inner.clone(),
        }))?;
        {
            let mut state = channel.inner.state.lock();
            if let TlsState::Active(session) = &mut *state {
                // ClientHello
                drop(channel.inner.flush(session)?);
            }
        }
        rx.await.map_err(|_| {
            AppError::ChannelClosed("channel dropped during TLS handshake".to_string())
        })??;
        debug!(
            "TLS handshake with {} completed on channel {}",
            server_name,
            raw.channel_id()
        );
        Ok(channel)
    }

    /// SNI host name the client asked for, server side only.
    pub fn server_name(&self) -> Option<String> {
        self.inner.server_name.lock().clone()
    }
}

impl TlsInner {
    fn on_raw_data(inner: &Arc<TlsInner>, data: Bytes) {
        let mut outcome = ReadOutcome::default();
        let result = {
            let mut state = inner.state.lock();
            let result = inner.process(&mut state, &data, &mut outcome);
            if result.is_err() {
                *state = TlsState::Failed;
            }
            result
        };

        if outcome.handshake_done {
            inner.handshake_completed(inner);
        }
        if !outcome.plaintext.is_empty() {
            let mut upward = inner.upward.lock();
            match upward.listener.clone() {
                Some(listener) => {
                    for data in outcome.plaintext {
                        listener.incoming_data(data);
                    }
                }
                None => upward.buffered.extend(outcome.plaintext),
            }
        }
        if outcome.peer_closed {
            inner.on_peer_closed();
        }
        if let Err(error) = result {
            inner.fail(error);
        }
    }

    fn process(
        &self,
        state: &mut TlsState,
        data: &[u8],
        outcome: &mut ReadOutcome,
    ) -> AppResult<()> {
        match std::mem::replace(state, TlsState::Failed) {
            TlsState::Sniffing(mut acceptor) => {
                let mut cursor = data;
                while !cursor.is_empty() {
                    if acceptor.read_tls(&mut cursor)? == 0 {
                        break;
                    }
                }
                let accepted = match acceptor.accept() {
                    Ok(None) => {
                        *state = TlsState::Sniffing(acceptor);
                        return Ok(());
                    }
                    Ok(Some(accepted)) => accepted,
                    Err((e, alert)) => {
                        self.send_alert(alert);
                        return Err(e.into());
                    }
                };
                let sni = accepted.client_hello().server_name().map(str::to_string);
                trace!(
                    "ClientHello on channel {} for SNI {:?}",
                    self.raw.channel_id(),
                    sni
                );
                let config = self
                    .host_configs
                    .as_ref()
                    .and_then(|hosts| hosts.select(sni.as_deref()))
                    .ok_or_else(|| {
                        AppError::IllegalStateError("no TLS host configuration".to_string())
                    })?;
                let mut session = match accepted.into_connection(config) {
                    Ok(connection) => Session::Server(connection),
                    Err((e, alert)) => {
                        self.send_alert(alert);
                        return Err(e.into());
                    }
                };
                *self.server_name.lock() = session.server_name().map(str::to_string);
                let result = self.pump(&mut session, &[], outcome, true);
                *state = TlsState::Active(session);
                result
            }
            TlsState::Active(mut session) => {
                let was_handshaking = session.is_handshaking();
                let result = self.pump(&mut session, data, outcome, was_handshaking);
                *state = TlsState::Active(session);
                result
            }
            TlsState::Failed => Ok(()),
        }
    }

    /// Feed ciphertext into the session and collect whatever plaintext it
    /// yields, then flush the session's own records (handshake, alerts).
    fn pump(
        &self,
        session: &mut Session,
        data: &[u8],
        outcome: &mut ReadOutcome,
        was_handshaking: bool,
    ) -> AppResult<()> {
        let mut cursor = data;
        loop {
            if !cursor.is_empty() && session.read_tls(&mut cursor)? == 0 {
                break;
            }
            let io_state = match session.process_new_packets() {
                Ok(io_state) => io_state,
                Err(e) => {
                    // the session queued an alert describing the failure
                    let _ = self.flush(session);
                    return Err(e.into());
                }
            };
            let readable = io_state.plaintext_bytes_to_read();
            if readable > 0 {
                let mut plaintext = vec![0u8; readable];
                session.reader().read_exact(&mut plaintext)?;
                outcome.plaintext.push(Bytes::from(plaintext));
            }
            if io_state.peer_has_closed() {
                outcome.peer_closed = true;
            }
            if cursor.is_empty() {
                break;
            }
        }
        if was_handshaking && !session.is_handshaking() {
            outcome.handshake_done = true;
        }
        drop(self.flush(session)?);
        Ok(())
    }

    /// Hand every pending TLS record to the raw channel as one write.
    fn flush(&self, session: &mut Session) -> AppResult<ChannelFuture<()>> {
        let mut records = Vec::new();
        while session.wants_write() {
            session.write_tls(&mut records)?;
        }
        if records.is_empty() {
            return Ok(ready(Ok(())));
        }
        Ok(self.raw.write(Bytes::from(records)))
    }

    fn send_alert(&self, mut alert: AcceptedAlert) {
        let mut records = Vec::new();
        if alert.write_all(&mut records).is_ok() && !records.is_empty() {
            drop(self.raw.write(Bytes::from(records)));
        }
    }

    fn handshake_completed(&self, inner: &Arc<TlsInner>) {
        debug!(
            "TLS handshake completed on channel {}",
            self.raw.channel_id()
        );
        if let Some(tx) = self.handshake_tx.lock().take() {
            let _ = tx.send(Ok(()));
        }
        if let Some(connection_listener) = &self.connection_listener {
            let channel: Arc<dyn Channel> = Arc::new(TlsChannel {
                inner: inner.clone(),
            });
            let listener = connection_listener.connected(channel);
            self.attach(listener);
        }
    }

    /// Install the upward listener and replay anything that arrived before.
    fn attach(&self, listener: Arc<dyn DataListener>) {
        let mut upward = self.upward.lock();
        for data in upward.buffered.drain(..) {
            listener.incoming_data(data);
        }
        if let Some(error) = upward.failure.take() {
            listener.failure(Bytes::new(), error);
        } else if upward.far_end_closed {
            listener.far_end_closed();
        }
        upward.listener = Some(listener);
    }

    fn on_peer_closed(&self) {
        if self.peer_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(waiter) = self.close_waiter.lock().take() {
            let _ = waiter.send(());
        }
        if let Some(tx) = self.handshake_tx.lock().take() {
            let _ = tx.send(Err(AppError::ChannelClosed(
                "peer closed during TLS handshake".to_string(),
            )));
        }
        let mut upward = self.upward.lock();
        match upward.listener.clone() {
            Some(listener) => listener.far_end_closed(),
            None => upward.far_end_closed = true,
        }
    }

    /// Report a fatal failure exactly once and drop the raw channel.
    fn fail(&self, error: AppError) {
        if self.failed.swap(true, Ordering::AcqRel) {
            return;
        }
        error!("TLS on channel {} failed: {}", self.raw.channel_id(), error);
        if let Some(waiter) = self.close_waiter.lock().take() {
            let _ = waiter.send(());
        }
        if let Some(tx) = self.handshake_tx.lock().take() {
            let _ = tx.send(Err(error));
            drop(self.raw.close());
            return;
        }
        let mut upward = self.upward.lock();
        match upward.listener.clone() {
            Some(listener) => listener.failure(Bytes::new(), error),
            None => match &self.connection_listener {
                Some(connection_listener) => {
                    connection_listener.failed(self.raw.remote_addr(), error)
                }
                None => upward.failure = Some(error),
            },
        }
        drop(upward);
        drop(self.raw.close());
    }
}

impl Channel for TlsChannel {
    fn channel_id(&self) -> u64 {
        self.inner.raw.channel_id()
    }

    fn remote_addr(&self) -> SocketAddr {
        self.inner.raw.remote_addr()
    }

    fn register_for_reads(&self, listener: Arc<dyn DataListener>) -> AppResult<()> {
        if self.inner.upward.lock().listener.is_some() {
            return Err(AppError::IllegalStateError(format!(
                "TLS channel {} already registered for reads",
                self.channel_id()
            )));
        }
        self.inner.attach(listener);
        Ok(())
    }

    fn write(&self, data: Bytes) -> ChannelFuture<()> {
        if self.inner.closing.load(Ordering::Acquire) {
            return ready(Err(AppError::ChannelClosed(format!(
                "TLS channel {} is closing",
                self.channel_id()
            ))));
        }
        let mut state = self.inner.state.lock();
        let TlsState::Active(session) = &mut *state else {
            return ready(Err(AppError::ChannelClosed(format!(
                "TLS channel {} has no active session",
                self.channel_id()
            ))));
        };
        if let Err(e) = session.writer().write_all(&data) {
            return ready(Err(e.into()));
        }
        // encrypt and enqueue while still holding the session so record
        // order on the wire matches call order
        match self.inner.flush(session) {
            Ok(write) => write,
            Err(e) => ready(Err(e)),
        }
    }

    fn close(&self) -> ChannelFuture<()> {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return ready(Ok(()));
        }
        {
            let mut state = self.inner.state.lock();
            if let TlsState::Active(session) = &mut *state {
                session.send_close_notify();
                if let Ok(write) = self.inner.flush(session) {
                    drop(write);
                }
            }
        }
        let (tx, rx) = oneshot::channel();
        *self.inner.close_waiter.lock() = Some(tx);
        let wait = !self.inner.peer_closed.load(Ordering::Acquire)
            && !self.inner.failed.load(Ordering::Acquire);
        let raw = self.inner.raw.clone();
        let timeout = self.inner.close_timeout;
        Box::pin(async move {
            if wait && tokio::time::timeout(timeout, rx).await.is_err() {
                debug!(
                    "no close_notify from {} within {:?}",
                    raw.remote_addr(),
                    timeout
                );
            }
            raw.close().await
        })
    }

    fn is_closed(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire) || self.inner.raw.is_closed()
    }
}

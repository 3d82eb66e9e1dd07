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

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use super::BufferPool;
use crate::service::NetworkConfig;
use crate::{AppError, AppResult};

/// Completion of an asynchronous channel operation.
pub type ChannelFuture<T> = Pin<Box<dyn Future<Output = AppResult<T>> + Send + 'static>>;

pub(crate) fn ready<T: Send + 'static>(result: AppResult<T>) -> ChannelFuture<T> {
    Box::pin(async move { result })
}

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_channel_id() -> u64 {
    NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed)
}

/// Receives everything that comes up from a channel.
///
/// Callbacks run on the channel's reader task, one at a time and in order.
pub trait DataListener: Send + Sync {
    fn incoming_data(&self, data: Bytes);

    /// The peer closed its side. No more data will follow.
    fn far_end_closed(&self);

    /// The channel broke. `undelivered` holds bytes that were accepted by
    /// `write` but never reached the socket.
    fn failure(&self, undelivered: Bytes, error: AppError);

    /// Writes are queuing up faster than the socket drains them.
    fn apply_back_pressure(&self) {}

    /// The write queue drained below the low watermark again.
    fn release_back_pressure(&self) {}
}

/// Server side hook, called once a channel is ready for application data.
pub trait ConnectionListener: Send + Sync {
    fn connected(&self, channel: Arc<dyn Channel>) -> Arc<dyn DataListener>;

    /// The channel failed before `connected` could be called.
    fn failed(&self, remote_addr: SocketAddr, error: AppError) {
        debug!("connection from {} failed during setup: {}", remote_addr, error);
    }
}

pub trait Channel: Send + Sync {
    fn channel_id(&self) -> u64;

    fn remote_addr(&self) -> SocketAddr;

    /// Start delivering incoming data to `listener`. Can only be called once.
    fn register_for_reads(&self, listener: Arc<dyn DataListener>) -> AppResult<()>;

    /// Queue `data`. The bytes are ordered behind every earlier `write` call
    /// as soon as this returns; the future resolves once they were written.
    fn write(&self, data: Bytes) -> ChannelFuture<()>;

    /// Flush queued writes and close. Idempotent.
    fn close(&self) -> ChannelFuture<()>;

    fn is_closed(&self) -> bool;
}

enum WriteCommand {
    Data(Bytes, oneshot::Sender<AppResult<()>>),
    Close(oneshot::Sender<AppResult<()>>),
}

struct TcpInner {
    id: u64,
    remote_addr: SocketAddr,
    pool: Arc<BufferPool>,
    reader: Mutex<Option<OwnedReadHalf>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    listener: Mutex<Option<Arc<dyn DataListener>>>,
    write_tx: async_channel::Sender<WriteCommand>,
    pending_bytes: AtomicUsize,
    back_pressured: AtomicBool,
    closed: AtomicBool,
    high_watermark: usize,
    low_watermark: usize,
}

impl TcpInner {
    fn listener(&self) -> Option<Arc<dyn DataListener>> {
        self.listener.lock().clone()
    }

    fn queued(&self, len: usize) {
        let pending = self.pending_bytes.fetch_add(len, Ordering::AcqRel) + len;
        if pending > self.high_watermark && !self.back_pressured.swap(true, Ordering::AcqRel) {
            trace!("channel {} applying back pressure at {} bytes", self.id, pending);
            if let Some(listener) = self.listener() {
                listener.apply_back_pressure();
            }
        }
    }

    fn written(&self, len: usize) {
        let pending = self.pending_bytes.fetch_sub(len, Ordering::AcqRel) - len;
        if pending < self.low_watermark && self.back_pressured.swap(false, Ordering::AcqRel) {
            trace!("channel {} releasing back pressure at {} bytes", self.id, pending);
            if let Some(listener) = self.listener() {
                listener.release_back_pressure();
            }
        }
    }
}

/// Plain TCP channel. A writer task owns the write half and drains a FIFO
/// of write commands; a reader task owns the read half once somebody
/// registers for reads.
#[derive(Clone)]
pub struct TcpChannel {
    inner: Arc<TcpInner>,
}

impl std::fmt::Debug for TcpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpChannel")
            .field("id", &self.inner.id)
            .field("remote_addr", &self.inner.remote_addr)
            .finish()
    }
}

impl TcpChannel {
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
        pool: Arc<BufferPool>,
        config: &NetworkConfig,
    ) -> AppResult<TcpChannel> {
        let timeout = Duration::from_millis(config.connect_timeout_ms);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                AppError::DetailedIoError(format!(
                    "connect timed out after {}ms",
                    config.connect_timeout_ms
                ))
            })??;
        Self::from_stream(stream, pool, config)
    }

    /// Wrap an accepted or connected socket. Must be called inside a runtime.
    pub fn from_stream(
        stream: TcpStream,
        pool: Arc<BufferPool>,
        config: &NetworkConfig,
    ) -> AppResult<TcpChannel> {
        let remote_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        let (write_tx, write_rx) = async_channel::unbounded();
        let inner = Arc::new(TcpInner {
            id: next_channel_id(),
            remote_addr,
            pool,
            reader: Mutex::new(Some(read_half)),
            read_task: Mutex::new(None),
            listener: Mutex::new(None),
            write_tx,
            pending_bytes: AtomicUsize::new(0),
            back_pressured: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            high_watermark: config.write_high_watermark,
            low_watermark: config.write_low_watermark,
        });
        tokio::spawn(Self::write_loop(
            Arc::downgrade(&inner),
            write_half,
            write_rx,
        ));
        debug!("channel {} opened to {}", inner.id, remote_addr);
        Ok(TcpChannel { inner })
    }

    async fn write_loop(
        inner: Weak<TcpInner>,
        mut writer: OwnedWriteHalf,
        write_rx: async_channel::Receiver<WriteCommand>,
    ) {
        while let Ok(command) = write_rx.recv().await {
            match command {
                WriteCommand::Data(data, reply) => {
                    let len = data.len();
                    let result = writer.write_all(&data).await;
                    let Some(channel) = inner.upgrade() else {
                        let _ = reply.send(result.map_err(AppError::from));
                        continue;
                    };
                    channel.written(len);
                    if let Err(e) = result {
                        let reason = format!("write to {} failed: {}", channel.remote_addr, e);
                        error!("channel {}: {}", channel.id, reason);
                        let _ = reply.send(Err(AppError::IoError(e)));
                        channel.closed.store(true, Ordering::Release);
                        write_rx.close();
                        let undelivered = Self::drain_undelivered(data, &write_rx);
                        if let Some(listener) = channel.listener.lock().take() {
                            listener.failure(undelivered, AppError::DetailedIoError(reason));
                        }
                        break;
                    }
                    let _ = reply.send(Ok(()));
                }
                WriteCommand::Close(reply) => {
                    let result = writer.shutdown().await.map_err(AppError::from);
                    if let Some(channel) = inner.upgrade() {
                        if let Some(task) = channel.read_task.lock().take() {
                            task.abort();
                        }
                        channel.listener.lock().take();
                        debug!("channel {} closed", channel.id);
                    }
                    let _ = reply.send(result);
                    break;
                }
            }
        }
    }

    /// Collect the bytes of every write still queued behind a failed one and
    /// fail their futures.
    fn drain_undelivered(
        failed: Bytes,
        write_rx: &async_channel::Receiver<WriteCommand>,
    ) -> Bytes {
        let mut undelivered = BytesMut::from(&failed[..]);
        while let Ok(command) = write_rx.try_recv() {
            match command {
                WriteCommand::Data(data, reply) => {
                    undelivered.extend_from_slice(&data);
                    let _ = reply.send(Err(AppError::ChannelClosed(
                        "earlier write failed".to_string(),
                    )));
                }
                WriteCommand::Close(reply) => {
                    let _ = reply.send(Ok(()));
                }
            }
        }
        undelivered.freeze()
    }

    async fn read_loop(
        id: u64,
        mut reader: OwnedReadHalf,
        pool: Arc<BufferPool>,
        listener: Arc<dyn DataListener>,
    ) {
        loop {
            let mut buffer = pool.acquire();
            match reader.read_buf(&mut buffer).await {
                Ok(0) => {
                    pool.release(buffer);
                    debug!("channel {} reached end of stream", id);
                    listener.far_end_closed();
                    break;
                }
                Ok(n) => {
                    let data = buffer.split().freeze();
                    pool.release(buffer);
                    trace!("channel {} read {} bytes", id, n);
                    listener.incoming_data(data);
                }
                Err(e) => {
                    pool.release(buffer);
                    error!("channel {} read failed: {}", id, e);
                    listener.failure(Bytes::new(), AppError::IoError(e));
                    break;
                }
            }
        }
    }
}

impl Channel for TcpChannel {
    fn channel_id(&self) -> u64 {
        self.inner.id
    }

    fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    fn register_for_reads(&self, listener: Arc<dyn DataListener>) -> AppResult<()> {
        let reader = self.inner.reader.lock().take().ok_or_else(|| {
            AppError::IllegalStateError(format!(
                "channel {} already registered for reads",
                self.inner.id
            ))
        })?;
        *self.inner.listener.lock() = Some(listener.clone());
        let task = tokio::spawn(Self::read_loop(
            self.inner.id,
            reader,
            self.inner.pool.clone(),
            listener,
        ));
        *self.inner.read_task.lock() = Some(task);
        Ok(())
    }

    fn write(&self, data: Bytes) -> ChannelFuture<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return ready(Err(AppError::ChannelClosed(format!(
                "channel {} is closed",
                self.inner.id
            ))));
        }
        let len = data.len();
        let (tx, rx) = oneshot::channel();
        // account before enqueueing, the writer may finish before try_send returns
        self.inner.queued(len);
        if self
            .inner
            .write_tx
            .try_send(WriteCommand::Data(data, tx))
            .is_err()
        {
            self.inner.pending_bytes.fetch_sub(len, Ordering::AcqRel);
            return ready(Err(AppError::ChannelClosed(format!(
                "channel {} writer is gone",
                self.inner.id
            ))));
        }
        let id = self.inner.id;
        Box::pin(async move {
            rx.await.map_err(|_| {
                AppError::ChannelClosed(format!("channel {} dropped a pending write", id))
            })?
        })
    }

    fn close(&self) -> ChannelFuture<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return ready(Ok(()));
        }
        let (tx, rx) = oneshot::channel();
        if self.inner.write_tx.try_send(WriteCommand::Close(tx)).is_err() {
            return ready(Ok(()));
        }
        Box::pin(async move { rx.await.unwrap_or(Ok(())) })
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    use super::*;
    use crate::service::BufferPoolConfig;

    #[derive(Debug)]
    enum Event {
        Data(Bytes),
        Closed,
        Failed,
    }

    struct Recorder(mpsc::UnboundedSender<Event>);

    impl DataListener for Recorder {
        fn incoming_data(&self, data: Bytes) {
            let _ = self.0.send(Event::Data(data));
        }

        fn far_end_closed(&self) {
            let _ = self.0.send(Event::Closed);
        }

        fn failure(&self, _undelivered: Bytes, _error: AppError) {
            let _ = self.0.send(Event::Failed);
        }
    }

    fn pool() -> Arc<BufferPool> {
        Arc::new(BufferPool::new(&BufferPoolConfig::default()))
    }

    #[tokio::test]
    async fn test_write_then_far_end_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = NetworkConfig::default();

        let client = TcpChannel::connect(addr, pool(), &config).await.unwrap();
        let (socket, _) = listener.accept().await.unwrap();
        let server = TcpChannel::from_stream(socket, pool(), &config).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        server.register_for_reads(Arc::new(Recorder(tx))).unwrap();

        let first = client.write(Bytes::from_static(b"hello "));
        let second = client.write(Bytes::from_static(b"world"));
        first.await.unwrap();
        second.await.unwrap();
        client.close().await.unwrap();
        assert!(client.is_closed());
        assert!(client.write(Bytes::from_static(b"late")).await.is_err());

        let mut received = BytesMut::new();
        loop {
            match rx.recv().await.unwrap() {
                Event::Data(data) => received.extend_from_slice(&data),
                Event::Closed => break,
                Event::Failed => panic!("unexpected failure"),
            }
        }
        assert_eq!(&received[..], b"hello world");
    }

    #[tokio::test]
    async fn test_register_twice_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpChannel::connect(addr, pool(), &NetworkConfig::default())
            .await
            .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder(tx));
        client.register_for_reads(recorder.clone()).unwrap();
        assert!(matches!(
            client.register_for_reads(recorder),
            Err(AppError::IllegalStateError(_))
        ));
        assert_ne!(client.channel_id(), 0);
    }
}

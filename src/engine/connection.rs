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

//! One multiplexed connection.
//!
//! Every piece of connection state lives in [`ConnectionState`] and is only
//! touched from tasks submitted to the [`SessionExecutor`] under the channel
//! id, so reads, writes and timers of one connection never interleave. The
//! mutex around the state is never contended; it only makes the sharing
//! visible to the compiler. Listener callbacks run after the state lock is
//! released but still inside the connection's task.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, trace};

use super::flow_control::{FlowControlWindow, PendingSend, PendingSends, Progress};
use super::listener::{ControlFrame, EngineListener, EngineListenerFactory};
use super::state_machine::{EventKind, StreamEvent, StreamState};
use super::stream::{PartialStream, Stream};
use crate::network::{ready, Channel, ChannelFuture, DataListener};
use crate::protocol::settings::DEFAULT_INITIAL_WINDOW_SIZE;
use crate::protocol::{
    DataFrame, Frame, GoAwayFrame, Header, HeaderBlockStart, Http2ErrorCode, Http2Parser,
    Http2Settings, HpackDecoder, HpackEncoder, PingFrame, RstStreamFrame, SettingsFrame,
    SettingsParameter, WindowUpdateFrame, CONNECTION_PREFACE,
};
use crate::service::Http2Config;
use crate::utils::SessionExecutor;
use crate::{AppError, AppResult};

const MAX_STREAM_ID: u32 = 0x7fff_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Phase {
    /// server side, the client preface has not been read yet
    AwaitingPreface,
    Open,
    Closed,
}

/// Listener callbacks collected while the state is locked.
pub(super) enum Note {
    Payload(PartialStream),
    Reset(u32, Http2ErrorCode),
    Control(ControlFrame),
    FarEndClosed,
    Failure(AppError),
    CloseChannel,
}

type PingReply = oneshot::Sender<AppResult<Duration>>;

pub(super) struct ConnectionState {
    pub(super) phase: Phase,
    pub(super) leftover: Bytes,
    pub(super) decoder: HpackDecoder,
    pub(super) encoder: HpackEncoder,
    /// binding local settings, the ones the peer acknowledged
    pub(super) local_settings: Http2Settings,
    /// advertised local settings waiting for the peer's ACK, oldest first
    pub(super) pending_local: VecDeque<Http2Settings>,
    pub(super) remote_settings: Http2Settings,
    pub(super) streams: HashMap<u32, Stream>,
    pub(super) send_window: FlowControlWindow,
    pub(super) recv_window: FlowControlWindow,
    pub(super) pending_sends: PendingSends,
    pub(super) next_local_stream_id: u32,
    pub(super) last_peer_stream_id: u32,
    pub(super) goaway_received: Option<u32>,
    pub(super) goaway_sent: bool,
    pub(super) pings: HashMap<u64, (Instant, PingReply)>,
}

impl ConnectionState {
    fn new(role: Role) -> Self {
        ConnectionState {
            phase: match role {
                Role::Client => Phase::Open,
                Role::Server => Phase::AwaitingPreface,
            },
            leftover: Bytes::new(),
            decoder: HpackDecoder::new(),
            encoder: HpackEncoder::new(),
            local_settings: Http2Settings::default(),
            pending_local: VecDeque::new(),
            remote_settings: Http2Settings::default(),
            streams: HashMap::new(),
            send_window: FlowControlWindow::new(0, DEFAULT_INITIAL_WINDOW_SIZE),
            recv_window: FlowControlWindow::new(0, DEFAULT_INITIAL_WINDOW_SIZE),
            pending_sends: PendingSends::default(),
            next_local_stream_id: match role {
                Role::Client => 1,
                Role::Server => 2,
            },
            last_peer_stream_id: 0,
            goaway_received: None,
            goaway_sent: false,
            pings: HashMap::new(),
        }
    }

    /// The newest local settings the peer has been told about.
    pub(super) fn advertised(&self) -> &Http2Settings {
        self.pending_local.back().unwrap_or(&self.local_settings)
    }

    /// Limits for parsing inbound frames. The peer may already use a larger
    /// frame size we advertised before its ACK reaches us.
    pub(super) fn inbound_settings(&self) -> Http2Settings {
        let mut settings = self.local_settings.clone();
        for pending in &self.pending_local {
            settings.max_frame_size = settings.max_frame_size.max(pending.max_frame_size);
        }
        settings
    }

    pub(super) fn new_stream(&self, id: u32) -> Stream {
        Stream::new(
            id,
            self.remote_settings.initial_window_size,
            self.advertised().initial_window_size,
        )
    }
}

pub(super) struct EngineInner {
    pub(super) role: Role,
    pub(super) channel: Arc<dyn Channel>,
    executor: SessionExecutor,
    pub(super) parser: Http2Parser,
    initial_settings: Http2Settings,
    pub(super) state: Mutex<ConnectionState>,
    listener: Mutex<Option<Arc<dyn EngineListener>>>,
    closed: AtomicBool,
}

/// Engine of one connection. Cheap to clone.
#[derive(Clone)]
pub struct Http2Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Http2Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http2Engine")
            .field("role", &self.inner.role)
            .field("channel", &self.inner.channel.channel_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// The collaborator's handle for sending on a connection. It does not keep
/// the connection alive.
#[derive(Clone)]
pub struct StreamWriter {
    engine: Weak<EngineInner>,
}

impl std::fmt::Debug for StreamWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamWriter")
            .field("alive", &(self.engine.strong_count() > 0))
            .finish()
    }
}

/// Adapts channel callbacks into tasks on the connection's executor key.
struct ChannelEvents {
    inner: Arc<EngineInner>,
}

impl DataListener for ChannelEvents {
    fn incoming_data(&self, data: Bytes) {
        let inner = self.inner.clone();
        self.inner
            .executor
            .execute(self.inner.key(), async move { inner.on_data(data) });
    }

    fn far_end_closed(&self) {
        let inner = self.inner.clone();
        self.inner
            .executor
            .execute(self.inner.key(), async move { inner.on_far_end_closed() });
    }

    fn failure(&self, _undelivered: Bytes, error: AppError) {
        let inner = self.inner.clone();
        self.inner
            .executor
            .execute(self.inner.key(), async move { inner.on_channel_failure(error) });
    }

    fn apply_back_pressure(&self) {
        if let Some(listener) = self.inner.listener.lock().clone() {
            listener.apply_back_pressure();
        }
    }

    fn release_back_pressure(&self) {
        if let Some(listener) = self.inner.listener.lock().clone() {
            listener.release_back_pressure();
        }
    }
}

impl Http2Engine {
    pub fn new(
        role: Role,
        channel: Arc<dyn Channel>,
        executor: SessionExecutor,
        config: &Http2Config,
        listener_factory: &dyn EngineListenerFactory,
    ) -> Http2Engine {
        let engine = Http2Engine {
            inner: Arc::new(EngineInner {
                role,
                channel,
                executor,
                parser: Http2Parser::new(config.max_header_block_size),
                initial_settings: config.settings.clone(),
                state: Mutex::new(ConnectionState::new(role)),
                listener: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        };
        let listener = listener_factory.create(engine.writer());
        *engine.inner.listener.lock() = Some(listener);
        engine
    }

    /// Send the preface (client only) and our initial SETTINGS, then start
    /// reading from the channel.
    pub fn start(&self) -> AppResult<()> {
        let events = self.start_accepted();
        self.inner.channel.register_for_reads(events)
    }

    /// Like [`start`](Self::start) for channels whose reads go to whatever
    /// their [`ConnectionListener`](crate::network::ConnectionListener)
    /// returns: the caller registers the returned listener.
    pub fn start_accepted(&self) -> Arc<dyn DataListener> {
        let settings = self.inner.initial_settings.clone();
        let started = self.inner.submit_write(move |inner, state, _| {
            if inner.role == Role::Client {
                drop(inner.channel.write(Bytes::from_static(CONNECTION_PREFACE)));
            }
            let entries = settings.to_entries();
            state.pending_local.push_back(settings);
            Ok(inner.write_frames(&[Frame::Settings(SettingsFrame {
                ack: false,
                settings: entries,
            })]))
        });
        // the write is queued on the connection key before any read task
        drop(started);
        debug!(
            "{:?} engine started on channel {} with {}",
            self.inner.role,
            self.inner.key(),
            self.inner.channel.remote_addr()
        );
        Arc::new(ChannelEvents {
            inner: self.inner.clone(),
        })
    }

    pub fn writer(&self) -> StreamWriter {
        StreamWriter {
            engine: Arc::downgrade(&self.inner),
        }
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn channel_id(&self) -> u64 {
        self.inner.key()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Reserve the next locally initiated stream id. The stream opens with
    /// the first HEADERS sent on it.
    pub fn new_stream(&self) -> ChannelFuture<u32> {
        self.inner.submit(|inner, state, _| {
            if inner.role == Role::Server {
                return Err(AppError::IllegalStateError(
                    "servers only open streams through push_promise".into(),
                ));
            }
            if let Some(last) = state.goaway_received {
                return Err(AppError::IllegalStateError(format!(
                    "peer is going away after stream {}",
                    last
                )));
            }
            let id = inner.allocate_stream_id(state)?;
            let stream = state.new_stream(id);
            state.streams.insert(id, stream);
            trace!("reserved stream {} on channel {}", id, inner.key());
            Ok(id)
        })
    }

    pub fn send(&self, payload: PartialStream) -> ChannelFuture<()> {
        match payload {
            PartialStream::Headers {
                stream_id,
                headers,
                end_stream,
            } => self.send_headers(stream_id, headers, end_stream),
            PartialStream::Data {
                stream_id,
                data,
                end_stream,
            } => self.send_data(stream_id, data, end_stream),
            PartialStream::PushPromise {
                stream_id, headers, ..
            } => {
                let promised = self.push_promise(stream_id, headers);
                Box::pin(async move { promised.await.map(|_| ()) })
            }
        }
    }

    /// Send a header block. Trailers must wait until earlier DATA on the
    /// stream has completed.
    pub fn send_headers(
        &self,
        stream_id: u32,
        headers: Vec<Header>,
        end_stream: bool,
    ) -> ChannelFuture<()> {
        self.inner.submit_write(move |inner, state, notes| {
            if state.pending_sends.has_stream(stream_id) {
                return Err(AppError::IllegalStateError(format!(
                    "stream {} still has DATA held by flow control",
                    stream_id
                )));
            }
            let stream = state
                .streams
                .get_mut(&stream_id)
                .ok_or_else(|| unknown_stream(stream_id))?;
            let mut events = vec![StreamEvent::send(EventKind::Headers)];
            if end_stream {
                events.push(StreamEvent::send(EventKind::EndStreamFlag));
            }
            let next = match stream.transition(&events) {
                Ok(next) => next,
                Err(err) => {
                    error!("illegal HEADERS send, likely a bug: {}", err);
                    inner.reset_stream(state, stream_id, err.wire_code(), notes);
                    return Err(err);
                }
            };
            if next == StreamState::Closed {
                state.streams.remove(&stream_id);
            }
            let frames = inner.parser.create_header_frames(
                &headers,
                HeaderBlockStart::Headers {
                    end_stream,
                    priority: None,
                },
                stream_id,
                &state.remote_settings,
                &mut state.encoder,
            );
            Ok(inner.write_frames(&frames))
        })
    }

    /// Send DATA, split to fit the peer's frame size and both send windows.
    /// Whatever does not fit is held until the peer grants more credit; the
    /// returned future resolves once every byte was written.
    pub fn send_data(&self, stream_id: u32, data: Bytes, end_stream: bool) -> ChannelFuture<()> {
        let (tx, rx) = oneshot::channel();
        let submitted = self.inner.submit(move |inner, state, notes| {
            let stream = state
                .streams
                .get(&stream_id)
                .ok_or_else(|| unknown_stream(stream_id))?;
            if let Err(err) = stream.check(&[StreamEvent::send(EventKind::Data)]) {
                error!("illegal DATA send, likely a bug: {}", err);
                inner.reset_stream(state, stream_id, err.wire_code(), notes);
                return Err(err);
            }
            let mut send = PendingSend {
                stream_id,
                data,
                end_stream,
                writes: vec![],
                completion: tx,
            };
            if state.pending_sends.has_stream(stream_id) {
                state.pending_sends.push(send);
                return Ok(());
            }
            match inner.write_data(state, &mut send) {
                Progress::Done => send.complete(),
                Progress::Blocked => {
                    trace!(
                        "holding {} bytes of stream {} until the peer grants credit",
                        send.data.len(),
                        stream_id
                    );
                    state.pending_sends.push(send);
                }
                Progress::Failed(err) => send.fail(err),
            }
            Ok(())
        });
        Box::pin(async move {
            submitted.await?;
            let writes = rx
                .await
                .map_err(|_| AppError::Cancelled(format!("send on stream {} dropped", stream_id)))??;
            for write in writes {
                write.await?;
            }
            Ok(())
        })
    }

    /// Promise a pushed stream associated with `stream_id`; resolves to the
    /// promised stream id.
    pub fn push_promise(&self, stream_id: u32, headers: Vec<Header>) -> ChannelFuture<u32> {
        let submitted = self.inner.submit(move |inner, state, _| {
            if inner.role != Role::Server {
                return Err(AppError::IllegalStateError(
                    "only servers push streams".into(),
                ));
            }
            if !state.remote_settings.enable_push {
                return Err(AppError::IllegalStateError(
                    "peer disabled server push".into(),
                ));
            }
            let associated = state
                .streams
                .get(&stream_id)
                .ok_or_else(|| unknown_stream(stream_id))?;
            if !matches!(
                associated.state(),
                StreamState::Open | StreamState::HalfClosedRemote
            ) {
                return Err(AppError::IllegalStateError(format!(
                    "cannot push on stream {} in state {:?}",
                    stream_id,
                    associated.state()
                )));
            }
            let promised = inner.allocate_stream_id(state)?;
            let mut stream = state.new_stream(promised);
            stream.transition(&[StreamEvent::send(EventKind::PushPromise)])?;
            state.streams.insert(promised, stream);
            let frames = inner.parser.create_header_frames(
                &headers,
                HeaderBlockStart::PushPromise {
                    promised_stream_id: promised,
                },
                stream_id,
                &state.remote_settings,
                &mut state.encoder,
            );
            Ok((promised, inner.write_frames(&frames)))
        });
        Box::pin(async move {
            let (promised, write) = submitted.await?;
            write.await?;
            Ok(promised)
        })
    }

    pub fn reset(&self, stream_id: u32, error_code: Http2ErrorCode) -> ChannelFuture<()> {
        self.inner.submit_write(move |inner, state, _| {
            let stream = state
                .streams
                .get_mut(&stream_id)
                .ok_or_else(|| unknown_stream(stream_id))?;
            stream.transition(&[StreamEvent::send(EventKind::ResetStream)])?;
            state.streams.remove(&stream_id);
            state
                .pending_sends
                .cancel_stream(stream_id, "stream reset locally");
            debug!("resetting stream {} with {:?}", stream_id, error_code);
            Ok(inner.write_frames(&[Frame::RstStream(RstStreamFrame {
                stream_id,
                error_code,
            })]))
        })
    }

    /// Give back `amount` consumed bytes to both the stream and the
    /// connection receive windows.
    pub fn release_capacity(&self, stream_id: u32, amount: u32) -> ChannelFuture<()> {
        if amount == 0 {
            return ready(Ok(()));
        }
        self.inner.submit_write(move |inner, state, _| {
            state.recv_window.increase(amount)?;
            let mut frames = vec![Frame::WindowUpdate(WindowUpdateFrame {
                stream_id: 0,
                increment: amount,
            })];
            if let Some(stream) = state.streams.get_mut(&stream_id) {
                if stream.can_receive() {
                    stream.recv_window.increase(amount)?;
                    frames.push(Frame::WindowUpdate(WindowUpdateFrame {
                        stream_id,
                        increment: amount,
                    }));
                }
            }
            Ok(inner.write_frames(&frames))
        })
    }

    /// Send a single WINDOW_UPDATE; stream 0 targets the connection. Updates
    /// for streams that can no longer receive are dropped.
    pub fn send_window_update(&self, stream_id: u32, increment: u32) -> ChannelFuture<()> {
        if increment == 0 {
            return ready(Err(AppError::InvalidValue(
                "WINDOW_UPDATE increment must be positive".into(),
            )));
        }
        self.inner.submit_write(move |inner, state, _| {
            if stream_id == 0 {
                state.recv_window.increase(increment)?;
            } else {
                match state.streams.get_mut(&stream_id) {
                    Some(stream) if stream.can_receive() => stream.recv_window.increase(increment)?,
                    _ => {
                        trace!("suppressing WINDOW_UPDATE for closed stream {}", stream_id);
                        return Ok(ready(Ok(())));
                    }
                }
            }
            Ok(inner.write_frames(&[Frame::WindowUpdate(WindowUpdateFrame {
                stream_id,
                increment,
            })]))
        })
    }

    /// Send a PING and resolve with the round trip time once it is acked.
    pub fn ping(&self) -> ChannelFuture<Duration> {
        let (tx, rx) = oneshot::channel();
        let submitted = self.inner.submit_write(move |inner, state, _| {
            let mut opaque_data = rand::random::<u64>();
            while state.pings.contains_key(&opaque_data) {
                opaque_data = rand::random::<u64>();
            }
            state.pings.insert(opaque_data, (Instant::now(), tx));
            Ok(inner.write_frames(&[Frame::Ping(PingFrame {
                ack: false,
                opaque_data,
            })]))
        });
        Box::pin(async move {
            submitted.await?;
            rx.await
                .map_err(|_| AppError::Cancelled("ping dropped".into()))?
        })
    }

    /// Advertise new local settings. They bind once the peer acknowledges
    /// them, receive windows follow immediately.
    pub fn update_settings(&self, entries: Vec<(SettingsParameter, u32)>) -> ChannelFuture<()> {
        self.inner.submit_write(move |inner, state, _| {
            let mut next = state.advertised().clone();
            next.apply(&entries)
                .map_err(|e| AppError::InvalidValue(format!("local settings: {}", e)))?;
            let delta = i64::from(next.initial_window_size)
                - i64::from(state.advertised().initial_window_size);
            if delta != 0 {
                for stream in state.streams.values_mut() {
                    stream.recv_window.adjust(delta)?;
                }
            }
            state.pending_local.push_back(next);
            Ok(inner.write_frames(&[Frame::Settings(SettingsFrame {
                ack: false,
                settings: entries,
            })]))
        })
    }

    /// Tell the peer no further streams will be accepted. Streams it already
    /// opened keep working.
    pub fn go_away(&self, error_code: Http2ErrorCode, debug_data: Bytes) -> ChannelFuture<()> {
        self.inner.submit_write(move |inner, state, _| {
            state.goaway_sent = true;
            debug!(
                "sending GOAWAY({:?}) after stream {} on channel {}",
                error_code,
                state.last_peer_stream_id,
                inner.key()
            );
            Ok(inner.write_frames(&[Frame::GoAway(GoAwayFrame {
                last_stream_id: state.last_peer_stream_id,
                error_code,
                debug_data,
            })]))
        })
    }

    /// GOAWAY(NO_ERROR), cancel whatever is still held, close the channel.
    pub fn close(&self) -> ChannelFuture<()> {
        let goaway = self.go_away(Http2ErrorCode::NoError, Bytes::new());
        let inner = self.inner.clone();
        Box::pin(async move {
            if let Err(e) = goaway.await {
                trace!("GOAWAY on close not sent: {}", e);
            }
            let shutdown = inner.submit(|inner, state, _| {
                inner.shutdown_state(state, "connection closed locally");
                Ok(())
            });
            if let Err(e) = shutdown.await {
                trace!("connection already shut down: {}", e);
            }
            inner.listener.lock().take();
            inner.channel.close().await
        })
    }

    /// Current state of a stream. Ids that were never used read as idle,
    /// used ones that are gone as closed.
    pub fn stream_state(&self, stream_id: u32) -> ChannelFuture<StreamState> {
        self.inner.inspect(move |inner, state| {
            Ok(match state.streams.get(&stream_id) {
                Some(stream) => stream.state(),
                None if inner.is_idle_id(state, stream_id) => StreamState::Idle,
                None => StreamState::Closed,
            })
        })
    }

    pub fn stream_send_window(&self, stream_id: u32) -> ChannelFuture<Option<i64>> {
        self.inner.inspect(move |_, state| {
            Ok(state
                .streams
                .get(&stream_id)
                .map(|stream| stream.send_window.window()))
        })
    }

    pub fn connection_send_window(&self) -> ChannelFuture<i64> {
        self.inner
            .inspect(|_, state| Ok(state.send_window.window()))
    }

    /// Number of DATA sends waiting for flow-control credit.
    pub fn held_sends(&self) -> ChannelFuture<usize> {
        self.inner.inspect(|_, state| Ok(state.pending_sends.len()))
    }
}

impl StreamWriter {
    fn engine(&self) -> AppResult<Http2Engine> {
        self.engine
            .upgrade()
            .map(|inner| Http2Engine { inner })
            .ok_or_else(|| AppError::ChannelClosed("connection is gone".into()))
    }

    pub fn send(&self, payload: PartialStream) -> ChannelFuture<()> {
        match self.engine() {
            Ok(engine) => engine.send(payload),
            Err(e) => ready(Err(e)),
        }
    }

    pub fn send_headers(
        &self,
        stream_id: u32,
        headers: Vec<Header>,
        end_stream: bool,
    ) -> ChannelFuture<()> {
        match self.engine() {
            Ok(engine) => engine.send_headers(stream_id, headers, end_stream),
            Err(e) => ready(Err(e)),
        }
    }

    pub fn send_data(&self, stream_id: u32, data: Bytes, end_stream: bool) -> ChannelFuture<()> {
        match self.engine() {
            Ok(engine) => engine.send_data(stream_id, data, end_stream),
            Err(e) => ready(Err(e)),
        }
    }

    pub fn push_promise(&self, stream_id: u32, headers: Vec<Header>) -> ChannelFuture<u32> {
        match self.engine() {
            Ok(engine) => engine.push_promise(stream_id, headers),
            Err(e) => ready(Err(e)),
        }
    }

    pub fn reset(&self, stream_id: u32, error_code: Http2ErrorCode) -> ChannelFuture<()> {
        match self.engine() {
            Ok(engine) => engine.reset(stream_id, error_code),
            Err(e) => ready(Err(e)),
        }
    }

    pub fn release_capacity(&self, stream_id: u32, amount: u32) -> ChannelFuture<()> {
        match self.engine() {
            Ok(engine) => engine.release_capacity(stream_id, amount),
            Err(e) => ready(Err(e)),
        }
    }

    pub fn new_stream(&self) -> ChannelFuture<u32> {
        match self.engine() {
            Ok(engine) => engine.new_stream(),
            Err(e) => ready(Err(e)),
        }
    }

    pub fn close(&self) -> ChannelFuture<()> {
        match self.engine() {
            Ok(engine) => engine.close(),
            Err(_) => ready(Ok(())),
        }
    }
}

impl EngineInner {
    pub(super) fn key(&self) -> u64 {
        self.channel.channel_id()
    }

    /// Run `op` on the connection's executor key with the state locked.
    fn submit<T, F>(self: &Arc<Self>, op: F) -> ChannelFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(&EngineInner, &mut ConnectionState, &mut Vec<Note>) -> AppResult<T>
            + Send
            + 'static,
    {
        let inner = self.clone();
        Box::pin(
            self.executor
                .execute_async(self.key(), async move { inner.run(op) }),
        )
    }

    fn submit_write<F>(self: &Arc<Self>, op: F) -> ChannelFuture<()>
    where
        F: FnOnce(&EngineInner, &mut ConnectionState, &mut Vec<Note>) -> AppResult<ChannelFuture<()>>
            + Send
            + 'static,
    {
        let submitted = self.submit(op);
        Box::pin(async move { submitted.await?.await })
    }

    /// Read-only access that also works on a closed connection.
    fn inspect<T, F>(self: &Arc<Self>, op: F) -> ChannelFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(&EngineInner, &ConnectionState) -> AppResult<T> + Send + 'static,
    {
        let inner = self.clone();
        Box::pin(self.executor.execute_async(self.key(), async move {
            let state = inner.state.lock();
            op(inner.as_ref(), &*state)
        }))
    }

    fn run<T, F>(&self, op: F) -> AppResult<T>
    where
        F: FnOnce(&EngineInner, &mut ConnectionState, &mut Vec<Note>) -> AppResult<T>,
    {
        let mut notes = vec![];
        let result = {
            let mut state = self.state.lock();
            if state.phase == Phase::Closed {
                Err(AppError::ChannelClosed(format!(
                    "connection on channel {} is closed",
                    self.key()
                )))
            } else {
                op(self, &mut *state, &mut notes)
            }
        };
        self.notify(notes);
        result
    }

    pub(super) fn notify(&self, notes: Vec<Note>) {
        if notes.is_empty() {
            return;
        }
        let listener = self.listener.lock().clone();
        for note in notes {
            match note {
                Note::Payload(payload) => {
                    if let Some(listener) = &listener {
                        listener.incoming_payload(payload);
                    }
                }
                Note::Reset(stream_id, code) => {
                    if let Some(listener) = &listener {
                        listener.stream_reset(stream_id, code);
                    }
                }
                Note::Control(frame) => {
                    if let Some(listener) = &listener {
                        listener.control_frame(frame);
                    }
                }
                Note::FarEndClosed => {
                    let taken = self.listener.lock().take();
                    if let Some(listener) = taken {
                        listener.far_end_closed();
                    }
                }
                Note::Failure(error) => {
                    let taken = self.listener.lock().take();
                    if let Some(listener) = taken {
                        listener.failure(error);
                    }
                }
                Note::CloseChannel => {
                    tokio::spawn(self.channel.close());
                }
            }
        }
    }

    pub(super) fn write_frames(&self, frames: &[Frame]) -> ChannelFuture<()> {
        for frame in frames {
            trace!("channel {} sending {}", self.key(), frame);
        }
        self.channel.write(self.parser.marshal_all(frames))
    }

    /// Whether `stream_id` is one this side opens.
    pub(super) fn is_local_id(&self, stream_id: u32) -> bool {
        is_local(self.role, stream_id)
    }

    /// Whether `stream_id` has not been used by either side yet.
    pub(super) fn is_idle_id(&self, state: &ConnectionState, stream_id: u32) -> bool {
        if self.is_local_id(stream_id) {
            stream_id >= state.next_local_stream_id
        } else {
            stream_id > state.last_peer_stream_id
        }
    }

    fn allocate_stream_id(&self, state: &mut ConnectionState) -> AppResult<u32> {
        let id = state.next_local_stream_id;
        if id > MAX_STREAM_ID {
            return Err(AppError::IllegalStateError(
                "stream ids exhausted on this connection".into(),
            ));
        }
        if let Some(max) = state.remote_settings.max_concurrent_streams {
            let active = state
                .streams
                .keys()
                .filter(|id| self.is_local_id(**id))
                .count();
            if active >= max as usize {
                return Err(AppError::stream_error(
                    Http2ErrorCode::RefusedStream,
                    id,
                    format!("peer allows only {} concurrent streams", max),
                ));
            }
        }
        state.next_local_stream_id += 2;
        Ok(id)
    }

    /// Write as much of `send` as both windows and the peer's frame size
    /// allow.
    pub(super) fn write_data(&self, state: &mut ConnectionState, send: &mut PendingSend) -> Progress {
        let max_frame_size = state.remote_settings.max_frame_size as usize;
        loop {
            let Some(stream) = state.streams.get_mut(&send.stream_id) else {
                return Progress::Failed(AppError::Cancelled(format!(
                    "stream {} closed before its data was sent",
                    send.stream_id
                )));
            };
            let credit = stream
                .send_window
                .available()
                .min(state.send_window.available())
                .min(max_frame_size);
            if credit == 0 && !send.data.is_empty() {
                return Progress::Blocked;
            }
            let chunk = send.data.split_to(credit.min(send.data.len()));
            let last = send.data.is_empty();
            let frame = DataFrame::new(send.stream_id, chunk, last && send.end_stream);
            let mut events = vec![StreamEvent::send(EventKind::Data)];
            if frame.end_stream {
                events.push(StreamEvent::send(EventKind::EndStreamFlag));
            }
            let next = match stream.transition(&events) {
                Ok(next) => next,
                Err(err) => return Progress::Failed(err),
            };
            let len = frame.data.len();
            if let Err(err) = stream
                .send_window
                .consume(len)
                .and_then(|_| state.send_window.consume(len))
            {
                return Progress::Failed(err);
            }
            if next == StreamState::Closed {
                state.streams.remove(&send.stream_id);
            }
            send.writes.push(self.write_frames(&[Frame::Data(frame)]));
            if last {
                return Progress::Done;
            }
        }
    }

    /// Give held sends another chance after credit arrived.
    pub(super) fn retry_pending(&self, state: &mut ConnectionState) {
        if state.pending_sends.is_empty() {
            return;
        }
        let mut pending = std::mem::take(&mut state.pending_sends);
        pending.retry(|send| self.write_data(state, send));
        state.pending_sends = pending;
    }

    /// RST_STREAM `stream_id` and forget it.
    pub(super) fn reset_stream(
        &self,
        state: &mut ConnectionState,
        stream_id: u32,
        error_code: Http2ErrorCode,
        notes: &mut Vec<Note>,
    ) {
        drop(self.write_frames(&[Frame::RstStream(RstStreamFrame {
            stream_id,
            error_code,
        })]));
        state
            .pending_sends
            .cancel_stream(stream_id, "stream reset after an error");
        if state.streams.remove(&stream_id).is_some() {
            notes.push(Note::Reset(stream_id, error_code));
        }
    }

    pub(super) fn handle_stream_error(
        &self,
        state: &mut ConnectionState,
        error: AppError,
        notes: &mut Vec<Note>,
    ) {
        match error.stream_id() {
            Some(stream_id) => {
                debug!("stream {} on channel {} failed: {}", stream_id, self.key(), error);
                self.reset_stream(state, stream_id, error.wire_code(), notes);
            }
            None => error!("channel {} stream error without a stream: {}", self.key(), error),
        }
    }

    /// GOAWAY with the error's code, fail everything, close the channel.
    pub(super) fn terminate(
        &self,
        state: &mut ConnectionState,
        error: AppError,
        notes: &mut Vec<Note>,
    ) {
        if state.phase == Phase::Closed {
            return;
        }
        error!("connection on channel {} failed: {}", self.key(), error);
        drop(self.write_frames(&[Frame::GoAway(GoAwayFrame {
            last_stream_id: state.last_peer_stream_id,
            error_code: error.wire_code(),
            debug_data: Bytes::from(error.to_string()),
        })]));
        state.goaway_sent = true;
        self.shutdown_state(state, "connection failed");
        notes.push(Note::Failure(error));
        notes.push(Note::CloseChannel);
    }

    fn shutdown_state(&self, state: &mut ConnectionState, reason: &str) {
        state.phase = Phase::Closed;
        self.closed.store(true, Ordering::Release);
        state.pending_sends.cancel_all(reason);
        for (_, (_, reply)) in state.pings.drain() {
            let _ = reply.send(Err(AppError::Cancelled(reason.to_string())));
        }
        state.streams.clear();
        state.leftover = Bytes::new();
    }

    fn on_far_end_closed(&self) {
        let mut notes = vec![];
        {
            let mut state = self.state.lock();
            if state.phase != Phase::Closed {
                debug!("peer closed connection on channel {}", self.key());
                self.shutdown_state(&mut state, "peer closed the connection");
                notes.push(Note::FarEndClosed);
                notes.push(Note::CloseChannel);
            }
        }
        self.notify(notes);
    }

    fn on_channel_failure(&self, error: AppError) {
        let mut notes = vec![];
        {
            let mut state = self.state.lock();
            if state.phase != Phase::Closed {
                self.shutdown_state(&mut state, "channel failed");
                notes.push(Note::Failure(error));
            }
        }
        self.notify(notes);
    }
}

/// Clients open odd streams, servers promise even ones.
pub(super) fn is_local(role: Role, stream_id: u32) -> bool {
    match role {
        Role::Client => stream_id % 2 == 1,
        Role::Server => stream_id != 0 && stream_id % 2 == 0,
    }
}

fn unknown_stream(stream_id: u32) -> AppError {
    AppError::stream_error(
        Http2ErrorCode::StreamClosed,
        stream_id,
        format!("stream {} is not open", stream_id),
    )
}

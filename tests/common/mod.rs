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

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use h2wire::engine::{
    ControlFrame, EngineListener, EngineListenerFactory, PartialStream, StreamWriter,
};
use h2wire::protocol::{
    Frame, Header, HeaderBlockStart, Http2ErrorCode, Http2Parser, Http2Settings, HpackDecoder,
    HpackEncoder, ParsedItem, CONNECTION_PREFACE,
};
use h2wire::{setup_local_tracing, AppError, EngineConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = setup_local_tracing();
}

/// Defaults with an ephemeral listen port.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.network.port = 0;
    config
}

#[derive(Debug)]
pub enum Event {
    Payload(PartialStream),
    Reset(u32, Http2ErrorCode),
    Control(ControlFrame),
    FarEndClosed,
    Failure(String),
}

pub struct RecordingFactory {
    events: mpsc::UnboundedSender<Event>,
}

impl RecordingFactory {
    pub fn new() -> (RecordingFactory, mpsc::UnboundedReceiver<Event>) {
        let (events, rx) = mpsc::unbounded_channel();
        (RecordingFactory { events }, rx)
    }
}

impl EngineListenerFactory for RecordingFactory {
    fn create(&self, _writer: StreamWriter) -> Arc<dyn EngineListener> {
        Arc::new(RecordingListener {
            events: self.events.clone(),
        })
    }
}

struct RecordingListener {
    events: mpsc::UnboundedSender<Event>,
}

impl EngineListener for RecordingListener {
    fn incoming_payload(&self, payload: PartialStream) {
        let _ = self.events.send(Event::Payload(payload));
    }

    fn stream_reset(&self, stream_id: u32, error_code: Http2ErrorCode) {
        let _ = self.events.send(Event::Reset(stream_id, error_code));
    }

    fn control_frame(&self, frame: ControlFrame) {
        let _ = self.events.send(Event::Control(frame));
    }

    fn far_end_closed(&self) {
        let _ = self.events.send(Event::FarEndClosed);
    }

    fn failure(&self, error: AppError) {
        let _ = self.events.send(Event::Failure(error.to_string()));
    }
}

/// Next event accepted by `pick`, skipping the others.
pub async fn wait_for<T>(
    events: &mut mpsc::UnboundedReceiver<Event>,
    mut pick: impl FnMut(Event) -> Option<T>,
) -> T {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("listener dropped");
            if let Some(found) = pick(event) {
                return found;
            }
        }
    })
    .await
    .expect("timed out waiting for an engine event")
}

/// The other end of a connection, speaking frames by hand.
pub struct RawPeer {
    socket: TcpStream,
    parser: Http2Parser,
    pub settings: Http2Settings,
    decoder: HpackDecoder,
    encoder: HpackEncoder,
    leftover: Bytes,
    frames: VecDeque<Frame>,
}

impl RawPeer {
    pub fn new(socket: TcpStream) -> RawPeer {
        RawPeer {
            socket,
            parser: Http2Parser::default(),
            settings: Http2Settings::default(),
            decoder: HpackDecoder::new(),
            encoder: HpackEncoder::new(),
            leftover: Bytes::new(),
            frames: VecDeque::new(),
        }
    }

    pub async fn read_preface(&mut self) {
        let mut preface = [0u8; 24];
        timeout(WAIT, self.socket.read_exact(&mut preface))
            .await
            .expect("timed out reading the preface")
            .unwrap();
        assert_eq!(&preface[..], CONNECTION_PREFACE);
    }

    pub async fn write_raw(&mut self, data: &[u8]) {
        self.socket.write_all(data).await.unwrap();
    }

    pub async fn send(&mut self, frames: &[Frame]) {
        let wire = self.parser.marshal_all(frames);
        self.socket.write_all(&wire).await.unwrap();
    }

    pub fn header_frames(&mut self, stream_id: u32, headers: &[Header], end_stream: bool) -> Vec<Frame> {
        self.parser.create_header_frames(
            headers,
            HeaderBlockStart::Headers {
                end_stream,
                priority: None,
            },
            stream_id,
            &Http2Settings::default(),
            &mut self.encoder,
        )
    }

    pub fn push_promise_frames(
        &mut self,
        stream_id: u32,
        promised_stream_id: u32,
        headers: &[Header],
    ) -> Vec<Frame> {
        self.parser.create_header_frames(
            headers,
            HeaderBlockStart::PushPromise { promised_stream_id },
            stream_id,
            &Http2Settings::default(),
            &mut self.encoder,
        )
    }

    /// Next frame off the wire, `None` once the other side closed.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            if let Some(frame) = self.frames.pop_front() {
                return Some(frame);
            }
            let read = timeout(WAIT, self.socket.read(&mut buf))
                .await
                .expect("timed out waiting for a frame")
                .unwrap_or(0);
            if read == 0 {
                return None;
            }
            let result = self
                .parser
                .parse(
                    std::mem::take(&mut self.leftover),
                    Bytes::copy_from_slice(&buf[..read]),
                    &self.settings,
                    &mut self.decoder,
                )
                .unwrap();
            self.leftover = result.leftover;
            self.frames
                .extend(result.items.into_iter().filter_map(|item| match item {
                    ParsedItem::Frame(frame) => Some(frame),
                    ParsedItem::StreamError(err) => panic!("peer received a bad frame: {}", err),
                }));
        }
    }

    /// Next frame accepted by `pick`, skipping the others.
    pub async fn next_where<T>(&mut self, mut pick: impl FnMut(Frame) -> Option<T>) -> T {
        loop {
            let frame = self.next_frame().await.expect("connection closed");
            if let Some(found) = pick(frame) {
                return found;
            }
        }
    }
}

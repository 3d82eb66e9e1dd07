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

//! Frames read from the peer, one handler per frame type.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace, warn};

use super::connection::{is_local, ConnectionState, EngineInner, Note, Phase, Role};
use super::listener::ControlFrame;
use super::state_machine::{EventKind, StreamEvent, StreamState};
use super::stream::PartialStream;
use crate::protocol::{
    DataFrame, Frame, GoAwayFrame, HeadersFrame, Http2ErrorCode, ParsedItem, PingFrame,
    PushPromiseFrame, RstStreamFrame, SettingsFrame, WindowUpdateFrame, CONNECTION_PREFACE,
};
use crate::{AppError, AppResult};

impl EngineInner {
    pub(super) fn on_data(&self, data: Bytes) {
        let mut notes = vec![];
        {
            let mut state = self.state.lock();
            if let Err(error) = self.read_frames(&mut state, data, &mut notes) {
                self.terminate(&mut state, error, &mut notes);
            }
        }
        self.notify(notes);
    }

    fn read_frames(
        &self,
        state: &mut ConnectionState,
        data: Bytes,
        notes: &mut Vec<Note>,
    ) -> AppResult<()> {
        let data = match state.phase {
            Phase::Closed => {
                trace!("dropping {} bytes read after close", data.len());
                return Ok(());
            }
            Phase::AwaitingPreface => match self.strip_preface(state, data)? {
                Some(rest) => rest,
                None => return Ok(()),
            },
            Phase::Open => data,
        };

        let leftover = std::mem::take(&mut state.leftover);
        let inbound = state.inbound_settings();
        let parsed = self
            .parser
            .parse(leftover, data, &inbound, &mut state.decoder)?;
        state.leftover = parsed.leftover;

        for item in parsed.items {
            let frame = match item {
                ParsedItem::Frame(frame) => frame,
                ParsedItem::StreamError(error) => {
                    self.handle_stream_error(state, error, notes);
                    continue;
                }
            };
            trace!("channel {} received {}", self.key(), frame);
            if let Err(error) = self.handle_frame(state, frame, notes) {
                if error.is_connection_level() {
                    return Err(error);
                }
                self.handle_stream_error(state, error, notes);
            }
        }
        Ok(())
    }

    /// Buffer until the client preface is complete and check it. Returns the
    /// bytes that follow it.
    fn strip_preface(&self, state: &mut ConnectionState, data: Bytes) -> AppResult<Option<Bytes>> {
        let mut buffered = BytesMut::with_capacity(state.leftover.len() + data.len());
        buffered.put(std::mem::take(&mut state.leftover));
        buffered.put(data);
        let compared = buffered.len().min(CONNECTION_PREFACE.len());
        if buffered[..compared] != CONNECTION_PREFACE[..compared] {
            return Err(AppError::connection_error(
                Http2ErrorCode::ProtocolError,
                "invalid connection preface",
            ));
        }
        if buffered.len() < CONNECTION_PREFACE.len() {
            state.leftover = buffered.freeze();
            return Ok(None);
        }
        state.phase = Phase::Open;
        let rest = buffered.split_off(CONNECTION_PREFACE.len());
        debug!("client preface received on channel {}", self.key());
        Ok(Some(rest.freeze()))
    }

    fn handle_frame(
        &self,
        state: &mut ConnectionState,
        frame: Frame,
        notes: &mut Vec<Note>,
    ) -> AppResult<()> {
        match frame {
            Frame::Data(frame) => self.on_data_frame(state, frame, notes),
            Frame::Headers(frame) => self.on_headers(state, frame, notes),
            Frame::Priority(frame) => {
                trace!("ignoring priority of stream {}", frame.stream_id);
                Ok(())
            }
            Frame::RstStream(frame) => self.on_rst_stream(state, frame, notes),
            Frame::Settings(frame) => self.on_settings(state, frame, notes),
            Frame::PushPromise(frame) => self.on_push_promise(state, frame, notes),
            Frame::Ping(frame) => self.on_ping(state, frame, notes),
            Frame::GoAway(frame) => self.on_go_away(state, frame, notes),
            Frame::WindowUpdate(frame) => self.on_window_update(state, frame),
            // folded into their header block or skipped by the parser
            Frame::Continuation(_) | Frame::Unknown(_) => Ok(()),
        }
    }

    fn on_data_frame(
        &self,
        state: &mut ConnectionState,
        frame: DataFrame,
        notes: &mut Vec<Note>,
    ) -> AppResult<()> {
        let len = frame.flow_controlled_len();
        state.recv_window.consume(len)?;
        let padding = len - frame.data.len();
        match self.accept_data(state, frame, notes) {
            Ok(()) => {
                if padding > 0 {
                    self.replenish(state, 0, padding as u32);
                }
                Ok(())
            }
            Err(error) => {
                // the stream is gone, nobody will release this credit
                if !error.is_connection_level() {
                    self.replenish(state, 0, len as u32);
                }
                Err(error)
            }
        }
    }

    fn accept_data(
        &self,
        state: &mut ConnectionState,
        frame: DataFrame,
        notes: &mut Vec<Note>,
    ) -> AppResult<()> {
        let stream_id = frame.stream_id;
        if self.is_idle_id(state, stream_id) {
            return Err(AppError::connection_error(
                Http2ErrorCode::ProtocolError,
                format!("DATA on idle stream {}", stream_id),
            ));
        }
        let stream = state.streams.get_mut(&stream_id).ok_or_else(|| {
            AppError::stream_error(
                Http2ErrorCode::StreamClosed,
                stream_id,
                format!("DATA on closed stream {}", stream_id),
            )
        })?;
        let mut events = vec![StreamEvent::receive(EventKind::Data)];
        if frame.end_stream {
            events.push(StreamEvent::receive(EventKind::EndStreamFlag));
        }
        stream.check(&events)?;
        let len = frame.flow_controlled_len();
        stream.recv_window.consume(len)?;
        let next = stream.transition(&events)?;
        if len > frame.data.len() && stream.can_receive() {
            let padding = (len - frame.data.len()) as u32;
            stream.recv_window.increase(padding)?;
            drop(self.write_frames(&[Frame::WindowUpdate(WindowUpdateFrame {
                stream_id,
                increment: padding,
            })]));
        }
        if next == StreamState::Closed {
            state.streams.remove(&stream_id);
        }
        notes.push(Note::Payload(PartialStream::Data {
            stream_id,
            data: frame.data,
            end_stream: frame.end_stream,
        }));
        Ok(())
    }

    /// Hand connection credit straight back to the peer.
    fn replenish(&self, state: &mut ConnectionState, stream_id: u32, amount: u32) {
        if amount == 0 || state.recv_window.increase(amount).is_err() {
            return;
        }
        drop(self.write_frames(&[Frame::WindowUpdate(WindowUpdateFrame {
            stream_id,
            increment: amount,
        })]));
    }

    fn on_headers(
        &self,
        state: &mut ConnectionState,
        frame: HeadersFrame,
        notes: &mut Vec<Note>,
    ) -> AppResult<()> {
        let stream_id = frame.stream_id;
        let mut events = vec![StreamEvent::receive(EventKind::Headers)];
        if frame.end_stream {
            events.push(StreamEvent::receive(EventKind::EndStreamFlag));
        }

        if let Some(stream) = state.streams.get_mut(&stream_id) {
            if stream.transition(&events)? == StreamState::Closed {
                state.streams.remove(&stream_id);
            }
        } else {
            if self.is_local_id(stream_id) || self.role == Role::Client {
                return Err(if self.is_idle_id(state, stream_id) {
                    AppError::connection_error(
                        Http2ErrorCode::ProtocolError,
                        format!("peer opened stream {} it does not own", stream_id),
                    )
                } else {
                    AppError::stream_error(
                        Http2ErrorCode::StreamClosed,
                        stream_id,
                        format!("HEADERS on closed stream {}", stream_id),
                    )
                });
            }
            if !self.is_idle_id(state, stream_id) {
                return Err(AppError::connection_error(
                    Http2ErrorCode::StreamClosed,
                    format!("HEADERS on closed stream {}", stream_id),
                ));
            }
            state.last_peer_stream_id = stream_id;
            if state.goaway_sent {
                trace!("ignoring stream {} opened after GOAWAY", stream_id);
                return Ok(());
            }
            if let Some(max) = state.advertised().max_concurrent_streams {
                let active = state
                    .streams
                    .keys()
                    .filter(|id| !self.is_local_id(**id))
                    .count();
                if active >= max as usize {
                    return Err(AppError::stream_error(
                        Http2ErrorCode::RefusedStream,
                        stream_id,
                        format!("{} concurrent streams already open", active),
                    ));
                }
            }
            let mut stream = state.new_stream(stream_id);
            if stream.transition(&events)? != StreamState::Closed {
                state.streams.insert(stream_id, stream);
            }
            trace!("peer opened stream {}", stream_id);
        }

        notes.push(Note::Payload(PartialStream::Headers {
            stream_id,
            headers: frame.headers,
            end_stream: frame.end_stream,
        }));
        Ok(())
    }

    fn on_rst_stream(
        &self,
        state: &mut ConnectionState,
        frame: RstStreamFrame,
        notes: &mut Vec<Note>,
    ) -> AppResult<()> {
        let stream_id = frame.stream_id;
        let idle = match state.streams.get_mut(&stream_id) {
            Some(stream) => stream
                .transition(&[StreamEvent::receive(EventKind::ResetStream)])
                .is_err(),
            None => self.is_idle_id(state, stream_id),
        };
        if idle {
            return Err(AppError::connection_error(
                Http2ErrorCode::ProtocolError,
                format!("RST_STREAM on idle stream {}", stream_id),
            ));
        }
        debug!("peer reset stream {} with {:?}", stream_id, frame.error_code);
        state
            .pending_sends
            .cancel_stream(stream_id, "stream reset by peer");
        if state.streams.remove(&stream_id).is_some() {
            notes.push(Note::Reset(stream_id, frame.error_code));
        }
        Ok(())
    }

    fn on_settings(
        &self,
        state: &mut ConnectionState,
        frame: SettingsFrame,
        notes: &mut Vec<Note>,
    ) -> AppResult<()> {
        if frame.ack {
            match state.pending_local.pop_front() {
                Some(settings) => {
                    state.local_settings = settings;
                    notes.push(Note::Control(ControlFrame::SettingsAck));
                }
                None => warn!("SETTINGS ACK without outstanding settings"),
            }
            return Ok(());
        }

        let previous_window = state.remote_settings.initial_window_size;
        state.remote_settings.apply(&frame.settings)?;
        let delta =
            i64::from(state.remote_settings.initial_window_size) - i64::from(previous_window);
        if delta != 0 {
            for stream in state.streams.values_mut() {
                stream.send_window.adjust(delta).map_err(|e| {
                    AppError::connection_error(Http2ErrorCode::FlowControlError, e.to_string())
                })?;
            }
        }
        // the encoder keeps its default dynamic table size
        trace!(
            "peer settings on channel {}: {:?}",
            self.key(),
            state.remote_settings
        );
        drop(self.write_frames(&[Frame::Settings(SettingsFrame::ack())]));
        notes.push(Note::Control(ControlFrame::RemoteSettings(
            state.remote_settings.clone(),
        )));
        self.retry_pending(state);
        Ok(())
    }

    fn on_push_promise(
        &self,
        state: &mut ConnectionState,
        frame: PushPromiseFrame,
        notes: &mut Vec<Note>,
    ) -> AppResult<()> {
        if self.role == Role::Server || !state.advertised().enable_push {
            return Err(AppError::connection_error(
                Http2ErrorCode::ProtocolError,
                "PUSH_PROMISE while push is disabled",
            ));
        }
        let associated = state
            .streams
            .get(&frame.stream_id)
            .map(|stream| stream.state());
        if !matches!(
            associated,
            Some(StreamState::Open | StreamState::HalfClosedLocal)
        ) {
            return Err(AppError::connection_error(
                Http2ErrorCode::ProtocolError,
                format!("PUSH_PROMISE on stream {} in state {:?}", frame.stream_id, associated),
            ));
        }
        let promised = frame.promised_stream_id;
        if self.is_local_id(promised) || !self.is_idle_id(state, promised) {
            return Err(AppError::connection_error(
                Http2ErrorCode::ProtocolError,
                format!("invalid promised stream id {}", promised),
            ));
        }
        state.last_peer_stream_id = promised;
        let mut stream = state.new_stream(promised);
        stream.transition(&[StreamEvent::receive(EventKind::PushPromise)])?;
        state.streams.insert(promised, stream);
        notes.push(Note::Payload(PartialStream::PushPromise {
            stream_id: frame.stream_id,
            promised_stream_id: promised,
            headers: frame.headers,
        }));
        Ok(())
    }

    fn on_ping(
        &self,
        state: &mut ConnectionState,
        frame: PingFrame,
        notes: &mut Vec<Note>,
    ) -> AppResult<()> {
        if !frame.ack {
            drop(self.write_frames(&[Frame::Ping(PingFrame {
                ack: true,
                opaque_data: frame.opaque_data,
            })]));
            return Ok(());
        }
        match state.pings.remove(&frame.opaque_data) {
            Some((sent_at, reply)) => {
                let _ = reply.send(Ok(sent_at.elapsed()));
            }
            None => trace!("unsolicited PING ACK {:x}", frame.opaque_data),
        }
        notes.push(Note::Control(ControlFrame::PingAck(frame.opaque_data)));
        Ok(())
    }

    fn on_go_away(
        &self,
        state: &mut ConnectionState,
        frame: GoAwayFrame,
        notes: &mut Vec<Note>,
    ) -> AppResult<()> {
        let last = frame.last_stream_id;
        if frame.error_code == Http2ErrorCode::NoError {
            debug!("peer is going away after stream {}", last);
        } else {
            warn!(
                "peer is going away after stream {} with {:?}: {}",
                last,
                frame.error_code,
                String::from_utf8_lossy(&frame.debug_data)
            );
        }
        state.goaway_received = Some(last);

        let role = self.role;
        let refused = move |id: u32| id > last && is_local(role, id);
        state
            .pending_sends
            .cancel_where(refused, "stream refused by GOAWAY");
        let mut gone: Vec<u32> = state.streams.keys().copied().filter(|id| refused(*id)).collect();
        gone.sort_unstable();
        for stream_id in gone {
            state.streams.remove(&stream_id);
            notes.push(Note::Reset(stream_id, Http2ErrorCode::RefusedStream));
        }
        notes.push(Note::Control(ControlFrame::GoAway {
            last_stream_id: last,
            error_code: frame.error_code,
            debug_data: frame.debug_data,
        }));
        Ok(())
    }

    fn on_window_update(
        &self,
        state: &mut ConnectionState,
        frame: WindowUpdateFrame,
    ) -> AppResult<()> {
        if frame.stream_id == 0 {
            state.send_window.increase(frame.increment)?;
        } else {
            let idle = self.is_idle_id(state, frame.stream_id);
            match state.streams.get_mut(&frame.stream_id) {
                Some(stream) => stream.send_window.increase(frame.increment)?,
                None if idle => {
                    return Err(AppError::connection_error_on(
                        Http2ErrorCode::ProtocolError,
                        frame.stream_id,
                        format!("WINDOW_UPDATE on idle stream {}", frame.stream_id),
                    ));
                }
                None => {
                    trace!("WINDOW_UPDATE for closed stream {}", frame.stream_id);
                    return Ok(());
                }
            }
        }
        self.retry_pending(state);
        Ok(())
    }
}

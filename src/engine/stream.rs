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

use bytes::Bytes;

use super::flow_control::FlowControlWindow;
use super::state_machine::{apply_events, StreamEvent, StreamState};
use crate::protocol::Header;
use crate::AppResult;

/// What the collaborator sends and receives instead of raw frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartialStream {
    Headers {
        stream_id: u32,
        headers: Vec<Header>,
        end_stream: bool,
    },
    Data {
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
    },
    PushPromise {
        stream_id: u32,
        promised_stream_id: u32,
        headers: Vec<Header>,
    },
}

impl PartialStream {
    pub fn stream_id(&self) -> u32 {
        match self {
            PartialStream::Headers { stream_id, .. }
            | PartialStream::Data { stream_id, .. }
            | PartialStream::PushPromise { stream_id, .. } => *stream_id,
        }
    }

    pub fn is_end_stream(&self) -> bool {
        match self {
            PartialStream::Headers { end_stream, .. } | PartialStream::Data { end_stream, .. } => {
                *end_stream
            }
            PartialStream::PushPromise { .. } => false,
        }
    }
}

/// Per-stream bookkeeping owned by a connection.
#[derive(Debug)]
pub struct Stream {
    id: u32,
    state: StreamState,
    pub(crate) send_window: FlowControlWindow,
    pub(crate) recv_window: FlowControlWindow,
}

impl Stream {
    pub fn new(id: u32, send_window: u32, recv_window: u32) -> Self {
        Stream {
            id,
            state: StreamState::Idle,
            send_window: FlowControlWindow::new(id, send_window),
            recv_window: FlowControlWindow::new(id, recv_window),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Odd ids are opened by clients, even ids are promised by servers.
    pub fn is_client_initiated(&self) -> bool {
        self.id % 2 == 1
    }

    /// Move the cursor through `events`. Nothing changes if any of them has
    /// no transition.
    pub fn transition(&mut self, events: &[StreamEvent]) -> AppResult<StreamState> {
        self.state = apply_events(self.id, self.state, events)?;
        Ok(self.state)
    }

    /// Whether a transition would be accepted, without committing it.
    pub fn check(&self, events: &[StreamEvent]) -> AppResult<StreamState> {
        apply_events(self.id, self.state, events)
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    /// Whether the peer may still send DATA on this stream.
    pub fn can_receive(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedLocal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state_machine::EventKind;
    use crate::AppError;

    #[test]
    fn test_send_after_local_end_stream_rejected() {
        let mut stream = Stream::new(1, 65_535, 65_535);
        stream
            .transition(&[StreamEvent::send(EventKind::Headers)])
            .unwrap();
        let state = stream
            .transition(&[
                StreamEvent::send(EventKind::Data),
                StreamEvent::send(EventKind::EndStreamFlag),
            ])
            .unwrap();
        assert_eq!(state, StreamState::HalfClosedLocal);

        let err = stream
            .transition(&[StreamEvent::send(EventKind::Data)])
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::NoTransition {
                stream_id: 1,
                state: StreamState::HalfClosedLocal,
                ..
            }
        ));
        assert_eq!(stream.state(), StreamState::HalfClosedLocal);
    }

    #[test]
    fn test_failed_check_leaves_cursor() {
        let mut stream = Stream::new(3, 100, 100);
        stream
            .transition(&[StreamEvent::receive(EventKind::Headers)])
            .unwrap();
        assert!(stream.can_receive());
        assert!(stream
            .check(&[
                StreamEvent::receive(EventKind::EndStreamFlag),
                StreamEvent::receive(EventKind::Data),
            ])
            .is_err());
        assert_eq!(stream.state(), StreamState::Open);
        assert!(stream.is_client_initiated());
    }

    #[test]
    fn test_partial_stream_accessors() {
        let payload = PartialStream::Data {
            stream_id: 5,
            data: Bytes::from_static(b"x"),
            end_stream: true,
        };
        assert_eq!(payload.stream_id(), 5);
        assert!(payload.is_end_stream());
    }
}

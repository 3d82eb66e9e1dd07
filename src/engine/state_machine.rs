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

//! Stream lifecycle as a static `(state, event) -> state` table.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use once_cell::sync::Lazy;

use crate::protocol::Frame;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    Idle,
    Open,
    ReservedLocal,
    ReservedRemote,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Headers,
    Data,
    PushPromise,
    ResetStream,
    EndStreamFlag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamEvent {
    pub direction: Direction,
    pub kind: EventKind,
}

impl StreamEvent {
    pub const fn send(kind: EventKind) -> Self {
        StreamEvent {
            direction: Direction::Send,
            kind,
        }
    }

    pub const fn receive(kind: EventKind) -> Self {
        StreamEvent {
            direction: Direction::Receive,
            kind,
        }
    }

    /// The events a frame fires against its stream, in order. A frame with
    /// END_STREAM fires its own kind first and then END_STREAM_FLAG. Frames
    /// that do not move the stream lifecycle fire nothing.
    pub fn for_frame(direction: Direction, frame: &Frame) -> Vec<StreamEvent> {
        let kind = match frame {
            Frame::Headers(_) => EventKind::Headers,
            Frame::Data(_) => EventKind::Data,
            Frame::PushPromise(_) => EventKind::PushPromise,
            Frame::RstStream(_) => EventKind::ResetStream,
            _ => return vec![],
        };
        let mut events = vec![StreamEvent { direction, kind }];
        if frame.is_end_stream() {
            events.push(StreamEvent {
                direction,
                kind: EventKind::EndStreamFlag,
            });
        }
        events
    }
}

impl Display for StreamEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let direction = match self.direction {
            Direction::Send => "send",
            Direction::Receive => "receive",
        };
        let kind = match self.kind {
            EventKind::Headers => "HEADERS",
            EventKind::Data => "DATA",
            EventKind::PushPromise => "PUSH_PROMISE",
            EventKind::ResetStream => "RESET_STREAM",
            EventKind::EndStreamFlag => "END_STREAM_FLAG",
        };
        write!(f, "{}({})", direction, kind)
    }
}

use EventKind::*;
use StreamState::*;

const fn snd(kind: EventKind) -> StreamEvent {
    StreamEvent::send(kind)
}

const fn rcv(kind: EventKind) -> StreamEvent {
    StreamEvent::receive(kind)
}

static TRANSITIONS: &[(StreamState, StreamEvent, StreamState)] = &[
    (Idle, snd(Headers), Open),
    (Idle, rcv(Headers), Open),
    (Idle, snd(PushPromise), ReservedLocal),
    (Idle, rcv(PushPromise), ReservedRemote),
    (Open, snd(Headers), Open),
    (Open, rcv(Headers), Open),
    (Open, snd(Data), Open),
    (Open, rcv(Data), Open),
    (Open, snd(EndStreamFlag), HalfClosedLocal),
    (Open, rcv(EndStreamFlag), HalfClosedRemote),
    (Open, snd(ResetStream), Closed),
    (Open, rcv(ResetStream), Closed),
    (ReservedLocal, snd(Headers), HalfClosedRemote),
    (ReservedLocal, snd(ResetStream), Closed),
    (ReservedLocal, rcv(ResetStream), Closed),
    (ReservedRemote, rcv(Headers), HalfClosedLocal),
    (ReservedRemote, snd(ResetStream), Closed),
    (ReservedRemote, rcv(ResetStream), Closed),
    (HalfClosedLocal, rcv(Headers), HalfClosedLocal),
    (HalfClosedLocal, rcv(Data), HalfClosedLocal),
    (HalfClosedLocal, rcv(EndStreamFlag), Closed),
    (HalfClosedLocal, snd(ResetStream), Closed),
    (HalfClosedLocal, rcv(ResetStream), Closed),
    (HalfClosedRemote, snd(Headers), HalfClosedRemote),
    (HalfClosedRemote, snd(Data), HalfClosedRemote),
    (HalfClosedRemote, snd(EndStreamFlag), Closed),
    (HalfClosedRemote, snd(ResetStream), Closed),
    (HalfClosedRemote, rcv(ResetStream), Closed),
];

static TRANSITION_TABLE: Lazy<HashMap<(StreamState, StreamEvent), StreamState>> = Lazy::new(|| {
    let mut table = HashMap::with_capacity(TRANSITIONS.len());
    for (from, event, to) in TRANSITIONS {
        let previous = table.insert((*from, *event), *to);
        assert!(
            previous.is_none(),
            "duplicate stream transition from {:?} on {}",
            from,
            event
        );
    }
    table
});

/// Look up a single transition.
pub fn next_state(stream_id: u32, state: StreamState, event: StreamEvent) -> AppResult<StreamState> {
    TRANSITION_TABLE
        .get(&(state, event))
        .copied()
        .ok_or(AppError::NoTransition {
            stream_id,
            state,
            event,
        })
}

/// Run `events` in order starting from `state`. Every step is checked before
/// the caller commits the returned state, so a failing event leaves the cursor
/// where it was.
pub fn apply_events(
    stream_id: u32,
    state: StreamState,
    events: &[StreamEvent],
) -> AppResult<StreamState> {
    events
        .iter()
        .try_fold(state, |current, event| next_state(stream_id, current, *event))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::protocol::DataFrame;

    #[test]
    fn test_table_has_no_duplicates() {
        assert_eq!(TRANSITION_TABLE.len(), TRANSITIONS.len());
    }

    #[test]
    fn test_send_headers_then_data_with_end_stream() {
        let data = Frame::Data(DataFrame::new(1, Bytes::from_static(b"x"), true));
        let state = next_state(1, Idle, StreamEvent::send(Headers)).unwrap();
        let events = StreamEvent::for_frame(Direction::Send, &data);
        assert_eq!(events.len(), 2);
        let state = apply_events(1, state, &events).unwrap();
        assert_eq!(state, HalfClosedLocal);

        let err = next_state(1, state, StreamEvent::send(Data)).unwrap_err();
        assert!(matches!(
            err,
            AppError::NoTransition {
                stream_id: 1,
                state: HalfClosedLocal,
                ..
            }
        ));
        assert!(err.to_string().contains("send(DATA)"));
    }

    #[test]
    fn test_push_lifecycle() {
        let state = next_state(2, Idle, StreamEvent::receive(PushPromise)).unwrap();
        assert_eq!(state, ReservedRemote);
        let state = next_state(2, state, StreamEvent::receive(Headers)).unwrap();
        assert_eq!(state, HalfClosedLocal);
        let state = next_state(2, state, StreamEvent::receive(EndStreamFlag)).unwrap();
        assert_eq!(state, Closed);
    }

    #[test]
    fn test_failed_event_does_not_partially_apply() {
        // DATA is legal from open but END_STREAM is not legal twice
        let events = [
            StreamEvent::receive(EndStreamFlag),
            StreamEvent::receive(Data),
        ];
        assert!(apply_events(3, Open, &events).is_err());
    }

    #[test]
    fn test_closed_accepts_nothing() {
        for kind in [Headers, Data, PushPromise, ResetStream, EndStreamFlag] {
            assert!(next_state(5, Closed, StreamEvent::send(kind)).is_err());
            assert!(next_state(5, Closed, StreamEvent::receive(kind)).is_err());
        }
    }
}

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

mod common;

use std::sync::Arc;

use bytes::Bytes;
use common::{test_config, wait_for, Event, RawPeer, RecordingFactory};
use h2wire::engine::{ControlFrame, Http2Engine, PartialStream, StreamState};
use h2wire::protocol::{
    DataFrame, Frame, GoAwayFrame, Header, Http2ErrorCode, Http2Parser, PingFrame,
    RstStreamFrame, SettingsFrame, SettingsParameter, WindowUpdateFrame,
};
use h2wire::utils::SessionExecutor;
use h2wire::{AppError, Client};
use rstest::{fixture, rstest};
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedReceiver;

#[fixture]
fn setup() {
    common::init_tracing();
}

fn request() -> Vec<Header> {
    vec![
        Header::new(":method", "POST"),
        Header::new(":scheme", "http"),
        Header::new(":path", "/upload"),
        Header::new(":authority", "localhost"),
    ]
}

/// A client engine talking to a hand driven server that advertised
/// `initial_window_size`.
async fn client_with_peer(
    initial_window_size: u32,
) -> (Http2Engine, RawPeer, UnboundedReceiver<Event>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = Arc::new(test_config());
    let executor = SessionExecutor::new(&config.session_executor, Handle::current());
    let client = Client::new(config, executor);
    let (factory, mut events) = RecordingFactory::new();

    let (engine, accepted) = tokio::join!(
        client.connect(addr, "localhost", &factory),
        listener.accept()
    );
    let engine = engine.unwrap();
    let mut peer = RawPeer::new(accepted.unwrap().0);

    peer.read_preface().await;
    let first = peer.next_frame().await.unwrap();
    assert!(matches!(first, Frame::Settings(SettingsFrame { ack: false, .. })));
    peer.send(&[
        Frame::Settings(SettingsFrame {
            ack: false,
            settings: vec![(SettingsParameter::InitialWindowSize, initial_window_size)],
        }),
        Frame::Settings(SettingsFrame::ack()),
    ])
    .await;

    let remote = wait_for(&mut events, |event| match event {
        Event::Control(ControlFrame::RemoteSettings(settings)) => Some(settings),
        _ => None,
    })
    .await;
    assert_eq!(remote.initial_window_size, initial_window_size);
    (engine, peer, events)
}

async fn open_stream(engine: &Http2Engine) -> u32 {
    let stream_id = engine.new_stream().await.unwrap();
    engine
        .send_headers(stream_id, request(), false)
        .await
        .unwrap();
    stream_id
}

fn data_len(frame: Frame) -> Option<(usize, bool)> {
    match frame {
        Frame::Data(data) => Some((data.data.len(), data.end_stream)),
        _ => None,
    }
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_send_held_until_window_update(#[from(setup)] _setup: ()) {
    let (engine, mut peer, _events) = client_with_peer(1000).await;
    let stream_id = open_stream(&engine).await;
    assert_eq!(stream_id, 1);

    let chunk = Bytes::from(vec![7u8; 400]);
    engine.send_data(stream_id, chunk.clone(), false).await.unwrap();
    engine.send_data(stream_id, chunk.clone(), false).await.unwrap();
    let third = tokio::spawn(engine.send_data(stream_id, chunk, true));

    assert_eq!(engine.held_sends().await.unwrap(), 1);
    assert_eq!(engine.stream_send_window(stream_id).await.unwrap(), Some(0));
    assert!(!third.is_finished());

    peer.send(&[Frame::WindowUpdate(WindowUpdateFrame {
        stream_id,
        increment: 200,
    })])
    .await;
    third.await.unwrap().unwrap();
    assert_eq!(engine.held_sends().await.unwrap(), 0);
    assert_eq!(engine.stream_send_window(stream_id).await.unwrap(), Some(0));
    assert_eq!(
        engine.stream_state(stream_id).await.unwrap(),
        StreamState::HalfClosedLocal
    );

    // nothing was oversent
    let mut received = 0;
    loop {
        let (len, end_stream) = peer.next_where(data_len).await;
        received += len;
        if end_stream {
            break;
        }
    }
    assert_eq!(received, 1200);
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reset_cancels_held_send(#[from(setup)] _setup: ()) {
    let (engine, mut peer, mut events) = client_with_peer(100).await;
    let stream_id = open_stream(&engine).await;

    let held = tokio::spawn(engine.send_data(stream_id, Bytes::from(vec![1u8; 300]), true));
    assert_eq!(engine.held_sends().await.unwrap(), 1);

    peer.send(&[Frame::RstStream(RstStreamFrame {
        stream_id,
        error_code: Http2ErrorCode::Cancel,
    })])
    .await;
    assert!(matches!(held.await.unwrap(), Err(AppError::Cancelled(_))));

    let reset = wait_for(&mut events, |event| match event {
        Event::Reset(id, code) => Some((id, code)),
        _ => None,
    })
    .await;
    assert_eq!(reset, (stream_id, Http2ErrorCode::Cancel));
    assert_eq!(
        engine.stream_state(stream_id).await.unwrap(),
        StreamState::Closed
    );
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bad_frame_after_push_promise_closes_promised_stream(#[from(setup)] _setup: ()) {
    let (engine, mut peer, mut events) = client_with_peer(65_535).await;
    let stream_id = open_stream(&engine).await;

    // a WINDOW_UPDATE with a 3 byte payload right behind the promise, in one write
    let promise = peer.push_promise_frames(
        stream_id,
        2,
        &[
            Header::new(":method", "GET"),
            Header::new(":path", "/style.css"),
        ],
    );
    let mut wire = Http2Parser::default().marshal_all(&promise).to_vec();
    wire.extend_from_slice(&[0, 0, 3, 0x8, 0, 0, 0, 0, 2, 0, 0, 1]);
    peer.write_raw(&wire).await;

    let reset = peer
        .next_where(|frame| match frame {
            Frame::RstStream(rst) => Some(rst),
            _ => None,
        })
        .await;
    assert_eq!(reset.stream_id, 2);
    assert_eq!(reset.error_code, Http2ErrorCode::FrameSizeError);

    let promised = wait_for(&mut events, |event| match event {
        Event::Payload(PartialStream::PushPromise {
            promised_stream_id, ..
        }) => Some(promised_stream_id),
        _ => None,
    })
    .await;
    assert_eq!(promised, 2);
    assert_eq!(engine.stream_state(2).await.unwrap(), StreamState::Closed);
    assert_eq!(
        engine.stream_state(stream_id).await.unwrap(),
        StreamState::Open
    );
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_data_after_end_stream_is_rejected(#[from(setup)] _setup: ()) {
    let (engine, mut peer, _events) = client_with_peer(65_535).await;
    let stream_id = engine.new_stream().await.unwrap();
    engine
        .send_headers(stream_id, request(), true)
        .await
        .unwrap();

    let result = engine
        .send_data(stream_id, Bytes::from_static(b"late"), false)
        .await;
    assert!(matches!(result, Err(AppError::NoTransition { .. })));

    let reset = peer
        .next_where(|frame| match frame {
            Frame::RstStream(rst) => Some(rst),
            Frame::Data(data) => panic!("unexpected DATA on stream {}", data.stream_id),
            _ => None,
        })
        .await;
    assert_eq!(reset.stream_id, stream_id);
    assert_eq!(reset.error_code, Http2ErrorCode::StreamClosed);
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_response_reaches_listener(#[from(setup)] _setup: ()) {
    let (engine, mut peer, mut events) = client_with_peer(65_535).await;
    let stream_id = open_stream(&engine).await;
    engine
        .send_data(stream_id, Bytes::from_static(b"body"), true)
        .await
        .unwrap();

    let mut response = peer.header_frames(stream_id, &[Header::new(":status", "200")], false);
    response.push(Frame::Data(DataFrame::new(
        stream_id,
        Bytes::from_static(b"done"),
        true,
    )));
    peer.send(&response).await;

    let headers = wait_for(&mut events, |event| match event {
        Event::Payload(PartialStream::Headers {
            stream_id: id,
            headers,
            end_stream,
        }) => Some((id, headers, end_stream)),
        _ => None,
    })
    .await;
    assert_eq!(headers, (stream_id, vec![Header::new(":status", "200")], false));

    let data = wait_for(&mut events, |event| match event {
        Event::Payload(PartialStream::Data {
            stream_id: id,
            data,
            end_stream,
        }) => Some((id, data, end_stream)),
        _ => None,
    })
    .await;
    assert_eq!(data, (stream_id, Bytes::from_static(b"done"), true));
    assert_eq!(
        engine.stream_state(stream_id).await.unwrap(),
        StreamState::Closed
    );

    // the collaborator hands the consumed bytes back
    engine.release_capacity(stream_id, 4).await.unwrap();
    let update = peer
        .next_where(|frame| match frame {
            Frame::WindowUpdate(update) => Some(update),
            _ => None,
        })
        .await;
    assert_eq!(update.stream_id, 0);
    assert_eq!(update.increment, 4);
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ping_round_trip(#[from(setup)] _setup: ()) {
    let (engine, mut peer, _events) = client_with_peer(65_535).await;
    let ping = tokio::spawn(engine.ping());

    let opaque_data = peer
        .next_where(|frame| match frame {
            Frame::Ping(PingFrame { ack: false, opaque_data }) => Some(opaque_data),
            _ => None,
        })
        .await;
    peer.send(&[Frame::Ping(PingFrame {
        ack: true,
        opaque_data,
    })])
    .await;
    ping.await.unwrap().unwrap();

    // a ping from the peer is acknowledged with the same payload
    peer.send(&[Frame::Ping(PingFrame {
        ack: false,
        opaque_data: 99,
    })])
    .await;
    let echoed = peer
        .next_where(|frame| match frame {
            Frame::Ping(PingFrame { ack: true, opaque_data }) => Some(opaque_data),
            _ => None,
        })
        .await;
    assert_eq!(echoed, 99);
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_goaway_refuses_later_streams(#[from(setup)] _setup: ()) {
    let (engine, mut peer, mut events) = client_with_peer(65_535).await;
    let first = open_stream(&engine).await;
    let second = open_stream(&engine).await;
    assert_eq!((first, second), (1, 3));

    peer.send(&[Frame::GoAway(GoAwayFrame {
        last_stream_id: first,
        error_code: Http2ErrorCode::NoError,
        debug_data: Bytes::new(),
    })])
    .await;

    let refused = wait_for(&mut events, |event| match event {
        Event::Reset(id, code) => Some((id, code)),
        _ => None,
    })
    .await;
    assert_eq!(refused, (second, Http2ErrorCode::RefusedStream));
    let last = wait_for(&mut events, |event| match event {
        Event::Control(ControlFrame::GoAway { last_stream_id, .. }) => Some(last_stream_id),
        _ => None,
    })
    .await;
    assert_eq!(last, first);

    assert!(engine.new_stream().await.is_err());
    assert_eq!(
        engine.stream_state(first).await.unwrap(),
        StreamState::Open
    );
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connection_error_sends_goaway(#[from(setup)] _setup: ()) {
    let (engine, mut peer, mut events) = client_with_peer(65_535).await;

    // WINDOW_UPDATE on a stream that was never opened
    peer.send(&[Frame::WindowUpdate(WindowUpdateFrame {
        stream_id: 5,
        increment: 10,
    })])
    .await;

    let goaway = peer
        .next_where(|frame| match frame {
            Frame::GoAway(goaway) => Some(goaway),
            _ => None,
        })
        .await;
    assert_eq!(goaway.error_code, Http2ErrorCode::ProtocolError);
    wait_for(&mut events, |event| match event {
        Event::Failure(_) => Some(()),
        _ => None,
    })
    .await;
    assert!(engine.is_closed());
    assert!(engine.new_stream().await.is_err());
}

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

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use common::{test_config, wait_for, Event, RawPeer, RecordingFactory};
use h2wire::engine::{
    ControlFrame, EngineListener, EngineListenerFactory, Http2Engine, PartialStream, StreamWriter,
};
use h2wire::protocol::{
    DataFrame, Frame, Header, Http2ErrorCode, SettingsFrame, CONNECTION_PREFACE,
};
use h2wire::service::{TlsConfig, TlsHostConfig};
use h2wire::utils::SessionExecutor;
use h2wire::{AppError, Client, EchoService, EngineConfig, Server, Shutdown};
use rstest::{fixture, rstest};
use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

#[fixture]
fn setup() {
    common::init_tracing();
}

struct Running {
    server: Arc<Server>,
    addr: SocketAddr,
    notify_shutdown: broadcast::Sender<()>,
    handle: JoinHandle<h2wire::AppResult<()>>,
}

async fn start_server(config: EngineConfig, factory: Arc<dyn EngineListenerFactory>) -> Running {
    let config = Arc::new(config);
    let executor = SessionExecutor::new(&config.session_executor, Handle::current());
    let server = Arc::new(Server::bind(config, executor, factory).await.unwrap());
    let addr = server.local_addr().unwrap();
    let (notify_shutdown, _) = broadcast::channel(1);
    let shutdown = Shutdown::new(notify_shutdown.subscribe());
    let running = server.clone();
    let handle = tokio::spawn(async move { running.run(shutdown).await });
    Running {
        server,
        addr,
        notify_shutdown,
        handle,
    }
}

fn client(config: EngineConfig) -> Client {
    let config = Arc::new(config);
    let executor = SessionExecutor::new(&config.session_executor, Handle::current());
    Client::new(config, executor)
}

fn request_headers() -> Vec<Header> {
    vec![
        Header::new(":method", "POST"),
        Header::new(":scheme", "https"),
        Header::new(":path", "/echo"),
        Header::new(":authority", "localhost"),
    ]
}

async fn send_request(engine: &Http2Engine, body: &'static [u8]) -> u32 {
    let stream_id = engine.new_stream().await.unwrap();
    engine
        .send(PartialStream::Headers {
            stream_id,
            headers: request_headers(),
            end_stream: false,
        })
        .await
        .unwrap();
    engine
        .send(PartialStream::Data {
            stream_id,
            data: Bytes::from_static(body),
            end_stream: true,
        })
        .await
        .unwrap();
    stream_id
}

async fn expect_echo(events: &mut UnboundedReceiver<Event>, stream_id: u32, body: &[u8]) {
    let status = wait_for(events, |event| match event {
        Event::Payload(PartialStream::Headers {
            stream_id: id,
            headers,
            ..
        }) if id == stream_id => Some(headers),
        _ => None,
    })
    .await;
    assert_eq!(status, vec![Header::new(":status", "200")]);

    let mut received = Vec::new();
    loop {
        let (data, end_stream) = wait_for(events, |event| match event {
            Event::Payload(PartialStream::Data {
                stream_id: id,
                data,
                end_stream,
            }) if id == stream_id => Some((data, end_stream)),
            _ => None,
        })
        .await;
        received.extend_from_slice(&data);
        if end_stream {
            break;
        }
    }
    assert_eq!(received, body);
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_echo_over_plain_tcp(#[from(setup)] _setup: ()) {
    let running = start_server(test_config(), Arc::new(EchoService)).await;
    let (factory, mut events) = RecordingFactory::new();
    let engine = client(test_config())
        .connect(running.addr, "localhost", &factory)
        .await
        .unwrap();

    let first = send_request(&engine, b"hello").await;
    let second = send_request(&engine, b"second request").await;
    expect_echo(&mut events, first, b"hello").await;
    expect_echo(&mut events, second, b"second request").await;
    assert_eq!(running.server.connection_count(), 1);

    // shutting the server down says goodbye to every connection
    running.notify_shutdown.send(()).unwrap();
    running.handle.await.unwrap().unwrap();
    let goaway = wait_for(&mut events, |event| match event {
        Event::Control(ControlFrame::GoAway { error_code, .. }) => Some(error_code),
        _ => None,
    })
    .await;
    assert_eq!(goaway, Http2ErrorCode::NoError);
    wait_for(&mut events, |event| match event {
        Event::FarEndClosed | Event::Failure(_) => Some(()),
        _ => None,
    })
    .await;
    assert_eq!(running.server.connection_count(), 0);
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_echo_over_tls_with_sni(#[from(setup)] _setup: ()) {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("localhost.crt");
    let key_path = dir.path().join("localhost.key");
    std::fs::write(&cert_path, certified.cert.pem()).unwrap();
    std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();

    let mut config = test_config();
    config.tls = TlsConfig {
        enabled: true,
        default_host: "localhost".to_string(),
        hosts: vec![TlsHostConfig {
            host: "localhost".to_string(),
            cert_path: cert_path.to_string_lossy().into_owned(),
            key_path: key_path.to_string_lossy().into_owned(),
        }],
        ..TlsConfig::default()
    };
    let running = start_server(config, Arc::new(EchoService)).await;

    let mut roots = RootCertStore::empty();
    roots
        .add(CertificateDer::from(certified.cert.der().to_vec()))
        .unwrap();
    let mut tls = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    tls.alpn_protocols = vec![b"h2".to_vec()];

    let (factory, mut events) = RecordingFactory::new();
    let engine = client(test_config())
        .with_tls(Arc::new(tls))
        .connect(running.addr, "localhost", &factory)
        .await
        .unwrap();
    let stream_id = send_request(&engine, b"over tls").await;
    expect_echo(&mut events, stream_id, b"over tls").await;

    engine.close().await.unwrap();
    assert!(engine.is_closed());
    running.notify_shutdown.send(()).unwrap();
    running.handle.await.unwrap().unwrap();
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bad_preface_is_rejected(#[from(setup)] _setup: ()) {
    let running = start_server(test_config(), Arc::new(EchoService)).await;
    let socket = TcpStream::connect(running.addr).await.unwrap();
    let mut peer = RawPeer::new(socket);
    peer.write_raw(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await;

    let goaway = peer
        .next_where(|frame| match frame {
            Frame::GoAway(goaway) => Some(goaway),
            _ => None,
        })
        .await;
    assert_eq!(goaway.error_code, Http2ErrorCode::ProtocolError);
    assert!(peer.next_frame().await.is_none());

    running.notify_shutdown.send(()).unwrap();
    running.handle.await.unwrap().unwrap();
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_raw_client_request(#[from(setup)] _setup: ()) {
    let running = start_server(test_config(), Arc::new(EchoService)).await;
    let socket = TcpStream::connect(running.addr).await.unwrap();
    let mut peer = RawPeer::new(socket);
    peer.write_raw(CONNECTION_PREFACE).await;
    peer.send(&[Frame::Settings(SettingsFrame {
        ack: false,
        settings: vec![],
    })])
    .await;
    let settings = peer.next_frame().await.unwrap();
    assert!(matches!(settings, Frame::Settings(SettingsFrame { ack: false, .. })));
    peer.send(&[Frame::Settings(SettingsFrame::ack())]).await;

    let mut request = peer.header_frames(1, &[Header::new(":method", "GET")], false);
    request.push(Frame::Data(DataFrame::new(1, Bytes::from_static(b"raw"), true)));
    peer.send(&request).await;

    let response = peer
        .next_where(|frame| match frame {
            Frame::Headers(headers) => Some(headers),
            _ => None,
        })
        .await;
    assert_eq!(response.stream_id, 1);
    assert_eq!(response.headers, vec![Header::new(":status", "200")]);
    assert!(!response.end_stream);
    let body = peer
        .next_where(|frame| match frame {
            Frame::Data(data) => Some(data),
            _ => None,
        })
        .await;
    assert_eq!(body.data, Bytes::from_static(b"raw"));
    assert!(body.end_stream);

    running.notify_shutdown.send(()).unwrap();
    running.handle.await.unwrap().unwrap();
}

/// Pushes a stylesheet before answering each request.
struct PushingService;

impl EngineListenerFactory for PushingService {
    fn create(&self, writer: StreamWriter) -> Arc<dyn EngineListener> {
        Arc::new(PushingListener { writer })
    }
}

struct PushingListener {
    writer: StreamWriter,
}

impl EngineListener for PushingListener {
    fn incoming_payload(&self, payload: PartialStream) {
        if let PartialStream::Headers { stream_id, .. } = payload {
            let writer = self.writer.clone();
            tokio::spawn(async move {
                let promised = writer
                    .push_promise(stream_id, vec![Header::new(":path", "/style.css")])
                    .await?;
                writer
                    .send_headers(promised, vec![Header::new(":status", "200")], false)
                    .await?;
                writer
                    .send_data(promised, Bytes::from_static(b"body{}"), true)
                    .await?;
                writer
                    .send_headers(stream_id, vec![Header::new(":status", "204")], true)
                    .await?;
                Ok::<(), AppError>(())
            });
        }
    }

    fn stream_reset(&self, _stream_id: u32, _error_code: Http2ErrorCode) {}

    fn far_end_closed(&self) {}

    fn failure(&self, _error: AppError) {}
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_server_push(#[from(setup)] _setup: ()) {
    let running = start_server(test_config(), Arc::new(PushingService)).await;
    let (factory, mut events) = RecordingFactory::new();
    let engine = client(test_config())
        .connect(running.addr, "localhost", &factory)
        .await
        .unwrap();
    let stream_id = engine.new_stream().await.unwrap();
    engine
        .send(PartialStream::Headers {
            stream_id,
            headers: request_headers(),
            end_stream: true,
        })
        .await
        .unwrap();

    let (associated, promised, headers) = wait_for(&mut events, |event| match event {
        Event::Payload(PartialStream::PushPromise {
            stream_id,
            promised_stream_id,
            headers,
        }) => Some((stream_id, promised_stream_id, headers)),
        _ => None,
    })
    .await;
    assert_eq!(associated, stream_id);
    assert_eq!(promised, 2);
    assert_eq!(headers, vec![Header::new(":path", "/style.css")]);
    expect_echo(&mut events, promised, b"body{}").await;

    let end_stream = wait_for(&mut events, |event| match event {
        Event::Payload(PartialStream::Headers {
            stream_id: id,
            end_stream,
            ..
        }) if id == stream_id => Some(end_stream),
        _ => None,
    })
    .await;
    assert!(end_stream);

    running.notify_shutdown.send(()).unwrap();
    running.handle.await.unwrap().unwrap();
}

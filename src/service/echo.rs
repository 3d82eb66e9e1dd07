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

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::engine::{EngineListener, EngineListenerFactory, PartialStream, StreamWriter};
use crate::network::ChannelFuture;
use crate::protocol::{Header, Http2ErrorCode};
use crate::AppError;

/// Answers every request stream with `:status 200` and echoes its body.
#[derive(Debug, Default, Clone)]
pub struct EchoService;

impl EngineListenerFactory for EchoService {
    fn create(&self, writer: StreamWriter) -> Arc<dyn EngineListener> {
        Arc::new(EchoListener { writer })
    }
}

struct EchoListener {
    writer: StreamWriter,
}

fn log_failure(what: &'static str, stream_id: u32, sent: ChannelFuture<()>) {
    tokio::spawn(async move {
        if let Err(e) = sent.await {
            debug!("echo {} on stream {} failed: {}", what, stream_id, e);
        }
    });
}

impl EngineListener for EchoListener {
    fn incoming_payload(&self, payload: PartialStream) {
        match payload {
            PartialStream::Headers {
                stream_id,
                headers,
                end_stream,
            } => {
                trace!("echo request on stream {} with {} headers", stream_id, headers.len());
                let response = vec![Header::new(":status", "200")];
                log_failure(
                    "headers",
                    stream_id,
                    self.writer.send_headers(stream_id, response, end_stream),
                );
            }
            PartialStream::Data {
                stream_id,
                data,
                end_stream,
            } => {
                let consumed = data.len() as u32;
                log_failure(
                    "data",
                    stream_id,
                    self.writer.send_data(stream_id, data, end_stream),
                );
                log_failure(
                    "window update",
                    stream_id,
                    self.writer.release_capacity(stream_id, consumed),
                );
            }
            PartialStream::PushPromise { stream_id, .. } => {
                warn!("echo service ignores push promise on stream {}", stream_id);
            }
        }
    }

    fn stream_reset(&self, stream_id: u32, error_code: Http2ErrorCode) {
        debug!("echo stream {} reset with {:?}", stream_id, error_code);
    }

    fn far_end_closed(&self) {
        debug!("echo peer closed the connection");
    }

    fn failure(&self, error: AppError) {
        warn!("echo connection failed: {}", error);
    }
}

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

use bytes::Bytes;

use super::connection::StreamWriter;
use super::stream::PartialStream;
use crate::protocol::{Http2ErrorCode, Http2Settings};
use crate::AppError;

/// Connection-level events surfaced to the collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    GoAway {
        last_stream_id: u32,
        error_code: Http2ErrorCode,
        debug_data: Bytes,
    },
    /// the peer acknowledged our last advertised settings
    SettingsAck,
    /// the peer's settings after applying its latest SETTINGS frame
    RemoteSettings(Http2Settings),
    PingAck(u64),
}

/// Receives everything the engine reads from one connection.
///
/// Calls for one connection never overlap and arrive in wire order. They run
/// on the connection's executor key, so blocking here stalls the connection.
pub trait EngineListener: Send + Sync {
    fn incoming_payload(&self, payload: PartialStream);

    /// The stream was reset by the peer or because of a stream-level error.
    fn stream_reset(&self, stream_id: u32, error_code: Http2ErrorCode);

    fn control_frame(&self, _frame: ControlFrame) {}

    fn far_end_closed(&self);

    fn failure(&self, error: AppError);

    fn apply_back_pressure(&self) {}

    fn release_back_pressure(&self) {}
}

/// Builds the listener of each new connection, handing it the writer for
/// that connection.
pub trait EngineListenerFactory: Send + Sync {
    fn create(&self, writer: StreamWriter) -> Arc<dyn EngineListener>;
}

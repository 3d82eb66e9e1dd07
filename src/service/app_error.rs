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

use crate::engine::{StreamEvent, StreamState};
use crate::protocol::Http2ErrorCode;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Accept error = {0}")]
    Accept(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// marker error, not enough bytes buffered to decode a frame
    #[error("incomplete frame")]
    Incomplete,

    /// frame format and header block sequencing errors
    #[error(
        "protocol error {code:?} on stream {stream_id} (connection level: {connection_level}): {reason}"
    )]
    Protocol {
        code: Http2ErrorCode,
        stream_id: u32,
        connection_level: bool,
        reason: String,
    },

    /// stream state machine violations
    #[error("no transition from state {state:?} on event {event} for stream {stream_id}")]
    NoTransition {
        stream_id: u32,
        state: StreamState,
        event: StreamEvent,
    },

    /// channel and security layer failures
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl AppError {
    pub fn connection_error(code: Http2ErrorCode, reason: impl Into<String>) -> Self {
        AppError::Protocol {
            code,
            stream_id: 0,
            connection_level: true,
            reason: reason.into(),
        }
    }

    /// Connection-level error raised by a frame on `stream_id`.
    pub fn connection_error_on(
        code: Http2ErrorCode,
        stream_id: u32,
        reason: impl Into<String>,
    ) -> Self {
        AppError::Protocol {
            code,
            stream_id,
            connection_level: true,
            reason: reason.into(),
        }
    }

    pub fn stream_error(code: Http2ErrorCode, stream_id: u32, reason: impl Into<String>) -> Self {
        AppError::Protocol {
            code,
            stream_id,
            connection_level: false,
            reason: reason.into(),
        }
    }

    /// Whether this error tears down the whole connection rather than a single stream.
    pub fn is_connection_level(&self) -> bool {
        match self {
            AppError::Protocol {
                connection_level, ..
            } => *connection_level,
            AppError::NoTransition { .. } | AppError::Cancelled(_) => false,
            _ => true,
        }
    }

    /// The stream a stream-level error terminates.
    pub fn stream_id(&self) -> Option<u32> {
        match self {
            AppError::Protocol {
                stream_id,
                connection_level: false,
                ..
            }
            | AppError::NoTransition { stream_id, .. } => Some(*stream_id),
            _ => None,
        }
    }

    /// The protocol error code to put on the wire when this error terminates a stream or connection.
    pub fn wire_code(&self) -> Http2ErrorCode {
        match self {
            AppError::Protocol { code, .. } => *code,
            AppError::NoTransition { .. } => Http2ErrorCode::StreamClosed,
            AppError::Cancelled(_) => Http2ErrorCode::Cancel,
            _ => Http2ErrorCode::InternalError,
        }
    }
}

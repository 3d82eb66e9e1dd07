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

use std::collections::{HashSet, VecDeque};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::network::ChannelFuture;
use crate::protocol::settings::MAX_WINDOW_SIZE;
use crate::protocol::Http2ErrorCode;
use crate::{AppError, AppResult};

/// Credit for one direction of a stream, or of the whole connection when
/// `stream_id` is 0. May go negative after a SETTINGS change shrinks it.
#[derive(Debug, Clone)]
pub struct FlowControlWindow {
    stream_id: u32,
    window: i64,
}

impl FlowControlWindow {
    pub fn new(stream_id: u32, initial: u32) -> Self {
        FlowControlWindow {
            stream_id,
            window: i64::from(initial),
        }
    }

    pub fn window(&self) -> i64 {
        self.window
    }

    /// Bytes that may be sent right now.
    pub fn available(&self) -> usize {
        self.window.max(0) as usize
    }

    /// Debit `amount` bytes. Used for received DATA, where running below zero
    /// means the peer ignored our window.
    pub fn consume(&mut self, amount: usize) -> AppResult<()> {
        let remaining = self.window - amount as i64;
        if remaining < 0 {
            return Err(self.error(format!(
                "peer sent {} bytes with only {} bytes of window",
                amount, self.window
            )));
        }
        self.window = remaining;
        Ok(())
    }

    /// Credit from a WINDOW_UPDATE.
    pub fn increase(&mut self, increment: u32) -> AppResult<()> {
        self.adjust(i64::from(increment))
    }

    /// Shift by the difference between a new and an old INITIAL_WINDOW_SIZE.
    pub fn adjust(&mut self, delta: i64) -> AppResult<()> {
        let updated = self.window + delta;
        if updated > i64::from(MAX_WINDOW_SIZE) {
            return Err(self.error(format!("window of {} exceeds 2^31-1", updated)));
        }
        self.window = updated;
        Ok(())
    }

    fn error(&self, reason: String) -> AppError {
        if self.stream_id == 0 {
            AppError::connection_error(Http2ErrorCode::FlowControlError, reason)
        } else {
            AppError::stream_error(Http2ErrorCode::FlowControlError, self.stream_id, reason)
        }
    }
}

/// Resolves with the write futures of every chunk of a DATA send once the
/// last chunk was handed to the channel.
pub type SendCompletion = oneshot::Sender<AppResult<Vec<ChannelFuture<()>>>>;

/// DATA that did not fit into the send windows when it was submitted.
pub struct PendingSend {
    pub stream_id: u32,
    pub data: Bytes,
    pub end_stream: bool,
    /// writes already issued for earlier chunks of the same send
    pub writes: Vec<ChannelFuture<()>>,
    pub completion: SendCompletion,
}

impl std::fmt::Debug for PendingSend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingSend")
            .field("stream_id", &self.stream_id)
            .field("remaining", &self.data.len())
            .field("end_stream", &self.end_stream)
            .finish()
    }
}

impl PendingSend {
    pub fn complete(self) {
        let _ = self.completion.send(Ok(self.writes));
    }

    pub fn fail(self, error: AppError) {
        let _ = self.completion.send(Err(error));
    }
}

/// What happened to a held send during a retry pass.
pub enum Progress {
    /// everything was written
    Done,
    /// some or none of it went out, the rest waits for more credit
    Blocked,
    /// the send can never complete
    Failed(AppError),
}

/// Held DATA sends in submission order.
#[derive(Debug, Default)]
pub struct PendingSends {
    queue: VecDeque<PendingSend>,
}

impl PendingSends {
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn has_stream(&self, stream_id: u32) -> bool {
        self.queue.iter().any(|p| p.stream_id == stream_id)
    }

    pub fn push(&mut self, pending: PendingSend) {
        self.queue.push_back(pending);
    }

    /// Offer every held send to `write` in order. Once a send of a stream is
    /// blocked, later sends of the same stream are skipped so per-stream order
    /// is kept; other streams may still make progress.
    pub fn retry<F>(&mut self, mut write: F)
    where
        F: FnMut(&mut PendingSend) -> Progress,
    {
        let mut blocked = HashSet::new();
        let mut kept = VecDeque::with_capacity(self.queue.len());
        while let Some(mut pending) = self.queue.pop_front() {
            if blocked.contains(&pending.stream_id) {
                kept.push_back(pending);
                continue;
            }
            match write(&mut pending) {
                Progress::Done => pending.complete(),
                Progress::Blocked => {
                    blocked.insert(pending.stream_id);
                    kept.push_back(pending);
                }
                Progress::Failed(error) => pending.fail(error),
            }
        }
        self.queue = kept;
    }

    /// Fail the held sends of one stream.
    pub fn cancel_stream(&mut self, stream_id: u32, reason: &str) {
        let (cancelled, kept) = self
            .queue
            .drain(..)
            .partition::<VecDeque<_>, _>(|p| p.stream_id == stream_id);
        self.queue = kept;
        for pending in cancelled {
            pending.fail(AppError::Cancelled(reason.to_string()));
        }
    }

    /// Fail held sends whose stream matches `predicate`.
    pub fn cancel_where<P>(&mut self, predicate: P, reason: &str)
    where
        P: Fn(u32) -> bool,
    {
        let (cancelled, kept) = self
            .queue
            .drain(..)
            .partition::<VecDeque<_>, _>(|p| predicate(p.stream_id));
        self.queue = kept;
        for pending in cancelled {
            pending.fail(AppError::Cancelled(reason.to_string()));
        }
    }

    pub fn cancel_all(&mut self, reason: &str) {
        for pending in self.queue.drain(..) {
            pending.fail(AppError::Cancelled(reason.to_string()));
        }
    }
}

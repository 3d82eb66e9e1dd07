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

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use super::frame::{
    decode_payload, ContinuationFrame, Frame, FrameHeader, FrameType, HeadersFrame,
    PriorityDetails, PushPromiseFrame, FRAME_HEADER_SIZE,
};
use super::hpack::{Header, HpackDecoder, HpackEncoder};
use super::settings::{Http2Settings, MAX_ALLOWED_FRAME_SIZE};
use super::Http2ErrorCode;
use crate::AppError::Incomplete;
use crate::{AppError, AppResult};

pub const DEFAULT_MAX_HEADER_BLOCK_SIZE: usize = 256 * 1024;

/// One unit of parser output, kept in the order the frames arrived.
#[derive(Debug)]
pub enum ParsedItem {
    /// a complete frame, header blocks already reassembled and decoded
    Frame(Frame),
    /// a frame that was skipped because of a stream-level error
    StreamError(AppError),
}

/// Outcome of one [`Http2Parser::parse`] call.
#[derive(Debug, Default)]
pub struct ParserResult {
    pub items: Vec<ParsedItem>,
    /// bytes to hand back on the next call
    pub leftover: Bytes,
}

impl ParserResult {
    pub fn frames(&self) -> Vec<&Frame> {
        self.items
            .iter()
            .filter_map(|item| match item {
                ParsedItem::Frame(frame) => Some(frame),
                ParsedItem::StreamError(_) => None,
            })
            .collect()
    }

    pub fn stream_errors(&self) -> Vec<&AppError> {
        self.items
            .iter()
            .filter_map(|item| match item {
                ParsedItem::StreamError(err) => Some(err),
                ParsedItem::Frame(_) => None,
            })
            .collect()
    }
}

/// How an outbound header block starts.
#[derive(Debug, Clone, Copy)]
pub enum HeaderBlockStart {
    Headers {
        end_stream: bool,
        priority: Option<PriorityDetails>,
    },
    PushPromise {
        promised_stream_id: u32,
    },
}

/// Stateless frame codec. All connection-specific state (settings, HPACK
/// tables, unconsumed bytes) is passed in by the caller.
#[derive(Debug, Clone)]
pub struct Http2Parser {
    max_header_block_size: usize,
}

impl Default for Http2Parser {
    fn default() -> Self {
        Http2Parser::new(DEFAULT_MAX_HEADER_BLOCK_SIZE)
    }
}

impl Http2Parser {
    pub fn new(max_header_block_size: usize) -> Self {
        Http2Parser {
            max_header_block_size,
        }
    }

    /// Validate the frame at the front of `buffer` against `max_frame_size`.
    ///
    /// Returns `Err(Incomplete)` if the header or the payload is not fully
    /// buffered yet, and a protocol error if the length is illegal for the
    /// frame type. Length errors are reported as soon as the header is seen.
    pub fn check(buffer: &[u8], max_frame_size: u32) -> AppResult<FrameHeader> {
        let header = FrameHeader::peek(buffer).ok_or(Incomplete)?;
        if let Some(err) = Self::length_violation(&header, max_frame_size) {
            return Err(err);
        }
        if buffer.len() < FRAME_HEADER_SIZE + header.length as usize {
            return Err(Incomplete);
        }
        Ok(header)
    }

    fn length_violation(header: &FrameHeader, max_frame_size: u32) -> Option<AppError> {
        let frame_type = FrameType::from_id(header.frame_type);
        let length = header.length as usize;
        let fixed_mismatch = frame_type
            .and_then(FrameType::fixed_length)
            .is_some_and(|fixed| fixed != length);
        let settings_mismatch = frame_type == Some(FrameType::Settings) && length % 6 != 0;
        if header.length <= max_frame_size && !fixed_mismatch && !settings_mismatch {
            return None;
        }
        let reason = format!(
            "illegal length {} for frame type 0x{:x} (max frame size {})",
            header.length, header.frame_type, max_frame_size
        );
        // header block frames mutate the shared HPACK state, so they can not
        // be skipped without losing the connection
        let connection_level = header.stream_id == 0
            || matches!(
                frame_type,
                Some(FrameType::Settings)
                    | Some(FrameType::Ping)
                    | Some(FrameType::GoAway)
                    | Some(FrameType::Headers)
                    | Some(FrameType::PushPromise)
                    | Some(FrameType::Continuation)
            );
        Some(if connection_level {
            AppError::connection_error_on(
                Http2ErrorCode::FrameSizeError,
                header.stream_id,
                reason,
            )
        } else {
            AppError::stream_error(Http2ErrorCode::FrameSizeError, header.stream_id, reason)
        })
    }

    /// Decode exactly one frame from the front of `data`; trailing bytes are
    /// ignored. Header fragments are returned as they are, undecoded. Only the
    /// per-type length rules are checked, not a max frame size.
    pub fn unmarshal(&self, data: &Bytes) -> AppResult<Frame> {
        let header = FrameHeader::peek(data).ok_or(Incomplete)?;
        if let Some(err) = Self::length_violation(&header, MAX_ALLOWED_FRAME_SIZE) {
            return Err(err);
        }
        let end = FRAME_HEADER_SIZE + header.length as usize;
        if data.len() < end {
            return Err(Incomplete);
        }
        decode_payload(&header, data.slice(FRAME_HEADER_SIZE..end))
    }

    pub fn marshal(&self, frame: &Frame) -> Bytes {
        let mut dst = BytesMut::new();
        frame.encode(&mut dst);
        dst.freeze()
    }

    pub fn marshal_all(&self, frames: &[Frame]) -> Bytes {
        let mut dst = BytesMut::new();
        for frame in frames {
            frame.encode(&mut dst);
        }
        dst.freeze()
    }

    /// Parse as many complete frames as `leftover` followed by `new_data`
    /// holds.
    ///
    /// A header block is only emitted once its END_HEADERS frame arrived; the
    /// decoded header list is attached to the frame that opened the block.
    /// While a block is still open, its bytes stay in the returned leftover and
    /// are parsed again on the next call.
    pub fn parse(
        &self,
        leftover: Bytes,
        new_data: Bytes,
        settings: &Http2Settings,
        decoder: &mut HpackDecoder,
    ) -> AppResult<ParserResult> {
        let mut to_parse = if leftover.is_empty() {
            new_data
        } else if new_data.is_empty() {
            leftover
        } else {
            let mut joined = BytesMut::with_capacity(leftover.len() + new_data.len());
            joined.put(leftover);
            joined.put(new_data);
            joined.freeze()
        };
        let mut result = ParserResult::default();
        let mut to_return = to_parse.clone();
        let mut block: Vec<Frame> = vec![];
        let mut block_size = 0usize;

        loop {
            let header = match FrameHeader::peek(&to_parse) {
                Some(header) => header,
                None => break,
            };
            let violation = match Self::length_violation(&header, settings.max_frame_size) {
                Some(err) if err.is_connection_level() => return Err(err),
                other => other,
            };
            let total = FRAME_HEADER_SIZE + header.length as usize;
            if to_parse.len() < total {
                break;
            }
            let mut frame_bytes = to_parse.split_to(total);

            if let Some(err) = violation {
                if !block.is_empty() {
                    return Err(interleaved(&header));
                }
                trace!("skipping frame of stream {}: {}", header.stream_id, err);
                result.items.push(ParsedItem::StreamError(err));
                to_return = to_parse.clone();
                continue;
            }

            let payload = frame_bytes.split_off(FRAME_HEADER_SIZE);
            let frame = match decode_payload(&header, payload) {
                Ok(frame) => frame,
                Err(err) if !err.is_connection_level() && block.is_empty() => {
                    result.items.push(ParsedItem::StreamError(err));
                    to_return = to_parse.clone();
                    continue;
                }
                Err(err) => return Err(err),
            };

            match frame {
                Frame::Headers(_) | Frame::PushPromise(_) | Frame::Continuation(_) => {
                    let (fragment_len, end_headers) = fragment_info(&frame);
                    match (&frame, block.first()) {
                        (Frame::Continuation(_), None) => {
                            return Err(AppError::connection_error_on(
                                Http2ErrorCode::ProtocolError,
                                header.stream_id,
                                format!(
                                    "CONTINUATION on stream {} without an open header block",
                                    header.stream_id
                                ),
                            ));
                        }
                        (Frame::Continuation(_), Some(first)) => {
                            let expected = block_stream_id(first);
                            if header.stream_id != expected {
                                return Err(AppError::connection_error_on(
                                    Http2ErrorCode::ProtocolError,
                                    header.stream_id,
                                    format!(
                                        "CONTINUATION on stream {} inside header block of stream {}",
                                        header.stream_id, expected
                                    ),
                                ));
                            }
                        }
                        (_, Some(_)) => return Err(interleaved(&header)),
                        (_, None) => {}
                    }
                    block_size += fragment_len;
                    if block_size > self.max_header_block_size {
                        return Err(AppError::connection_error(
                            Http2ErrorCode::EnhanceYourCalm,
                            format!(
                                "header block of {} bytes exceeds limit of {}",
                                block_size, self.max_header_block_size
                            ),
                        ));
                    }
                    block.push(frame);
                    if end_headers {
                        result
                            .items
                            .push(ParsedItem::Frame(self.finish_block(&mut block, decoder)?));
                        block_size = 0;
                        to_return = to_parse.clone();
                    }
                }
                Frame::Unknown(unknown) => {
                    if !block.is_empty() {
                        return Err(interleaved(&header));
                    }
                    trace!(
                        "discarding frame of unknown type 0x{:x} on stream {}",
                        unknown.frame_type,
                        unknown.stream_id
                    );
                    to_return = to_parse.clone();
                }
                other => {
                    if !block.is_empty() {
                        return Err(interleaved(&header));
                    }
                    result.items.push(ParsedItem::Frame(other));
                    to_return = to_parse.clone();
                }
            }
        }

        result.leftover = to_return;
        Ok(result)
    }

    /// Join the fragments of a finished block, decode them once and attach the
    /// header list to the first frame of the block.
    fn finish_block(&self, block: &mut Vec<Frame>, decoder: &mut HpackDecoder) -> AppResult<Frame> {
        let mut frames = block.drain(..);
        let mut first = frames.next().ok_or_else(|| {
            AppError::IllegalStateError("finishing an empty header block".into())
        })?;
        let mut joined = BytesMut::new();
        match &first {
            Frame::Headers(f) => joined.put_slice(&f.header_fragment),
            Frame::PushPromise(f) => joined.put_slice(&f.header_fragment),
            _ => {}
        }
        for frame in frames {
            if let Frame::Continuation(c) = frame {
                joined.put(c.header_fragment);
            }
        }
        let headers = self.deserialize_headers(&joined, decoder)?;
        match &mut first {
            Frame::Headers(f) => {
                f.headers = headers;
                f.end_headers = true;
            }
            Frame::PushPromise(f) => {
                f.headers = headers;
                f.end_headers = true;
            }
            _ => {}
        }
        Ok(first)
    }

    pub fn serialize_headers(&self, headers: &[Header], encoder: &mut HpackEncoder) -> Bytes {
        let lowered: Vec<Header> = headers
            .iter()
            .map(|h| {
                if h.name.iter().any(u8::is_ascii_uppercase) {
                    Header::new(h.name.to_ascii_lowercase(), h.value.clone())
                } else {
                    h.clone()
                }
            })
            .collect();
        encoder.encode(&lowered)
    }

    pub fn deserialize_headers(
        &self,
        block: &[u8],
        decoder: &mut HpackDecoder,
    ) -> AppResult<Vec<Header>> {
        decoder.decode(block)
    }

    /// Encode `headers` once and split the block into a HEADERS or
    /// PUSH_PROMISE frame followed by as many CONTINUATION frames as the
    /// peer's max frame size requires. Only the last frame has END_HEADERS.
    pub fn create_header_frames(
        &self,
        headers: &[Header],
        start: HeaderBlockStart,
        stream_id: u32,
        remote_settings: &Http2Settings,
        encoder: &mut HpackEncoder,
    ) -> Vec<Frame> {
        let mut encoded = self.serialize_headers(headers, encoder);
        let max = remote_settings.max_frame_size as usize;
        let first_overhead = match start {
            HeaderBlockStart::Headers {
                priority: Some(_), ..
            } => 5,
            HeaderBlockStart::Headers { .. } => 0,
            HeaderBlockStart::PushPromise { .. } => 4,
        };
        let first_chunk = encoded.split_to(encoded.len().min(max - first_overhead));
        // CONTINUATION frames of a pushed block ride on the promised stream
        let continuation_stream_id = match start {
            HeaderBlockStart::PushPromise { promised_stream_id } => promised_stream_id,
            HeaderBlockStart::Headers { .. } => stream_id,
        };
        let mut frames = vec![match start {
            HeaderBlockStart::Headers {
                end_stream,
                priority,
            } => Frame::Headers(HeadersFrame {
                stream_id,
                end_stream,
                end_headers: false,
                priority,
                padding: None,
                header_fragment: first_chunk,
                headers: headers.to_vec(),
            }),
            HeaderBlockStart::PushPromise { promised_stream_id } => {
                Frame::PushPromise(PushPromiseFrame {
                    stream_id,
                    promised_stream_id,
                    end_headers: false,
                    padding: None,
                    header_fragment: first_chunk,
                    headers: headers.to_vec(),
                })
            }
        }];
        while !encoded.is_empty() {
            let chunk = encoded.split_to(encoded.len().min(max));
            frames.push(Frame::Continuation(ContinuationFrame {
                stream_id: continuation_stream_id,
                end_headers: false,
                header_fragment: chunk,
            }));
        }
        match frames.last_mut() {
            Some(Frame::Headers(f)) => f.end_headers = true,
            Some(Frame::PushPromise(f)) => f.end_headers = true,
            Some(Frame::Continuation(f)) => f.end_headers = true,
            _ => {}
        }
        frames
    }
}

fn fragment_info(frame: &Frame) -> (usize, bool) {
    match frame {
        Frame::Headers(f) => (f.header_fragment.len(), f.end_headers),
        Frame::PushPromise(f) => (f.header_fragment.len(), f.end_headers),
        Frame::Continuation(f) => (f.header_fragment.len(), f.end_headers),
        _ => (0, true),
    }
}

/// The stream id CONTINUATION frames of a block have to carry.
fn block_stream_id(first: &Frame) -> u32 {
    match first {
        Frame::PushPromise(f) => f.promised_stream_id,
        other => other.stream_id(),
    }
}

fn interleaved(header: &FrameHeader) -> AppError {
    AppError::connection_error(
        Http2ErrorCode::ProtocolError,
        format!(
            "frame type 0x{:x} on stream {} interleaved in an open header block",
            header.frame_type, header.stream_id
        ),
    )
}

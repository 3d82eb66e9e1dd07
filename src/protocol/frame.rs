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

//! Frame types and their payload codecs.
//!
//! Every frame starts with the same 9 byte header:
//! ```text
//! +-----------------------------------------------+
//! |                 Length (24)                   |
//! +---------------+---------------+---------------+
//! |   Type (8)    |   Flags (8)   |
//! +-+-------------+---------------+---------------+
//! |R|                 Stream Identifier (31)      |
//! +-+---------------------------------------------+
//! ```
//! The payload codecs are reached through a dispatch table indexed by the
//! type id, see [`decode_payload`].

use std::fmt::{Display, Formatter};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::hpack::Header;
use super::settings::SettingsParameter;
use super::Http2ErrorCode;
use crate::{AppError, AppResult};

pub const FRAME_HEADER_SIZE: usize = 9;
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
const STREAM_ID_MASK: u32 = 0x7fff_ffff;

pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    RstStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    GoAway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

impl FrameType {
    pub fn from_id(id: u8) -> Option<FrameType> {
        match id {
            0x0 => Some(FrameType::Data),
            0x1 => Some(FrameType::Headers),
            0x2 => Some(FrameType::Priority),
            0x3 => Some(FrameType::RstStream),
            0x4 => Some(FrameType::Settings),
            0x5 => Some(FrameType::PushPromise),
            0x6 => Some(FrameType::Ping),
            0x7 => Some(FrameType::GoAway),
            0x8 => Some(FrameType::WindowUpdate),
            0x9 => Some(FrameType::Continuation),
            _ => None,
        }
    }

    pub fn id(self) -> u8 {
        self as u8
    }

    /// Payload length required by the frame type, if it has a fixed one.
    pub fn fixed_length(self) -> Option<usize> {
        match self {
            FrameType::Priority => Some(5),
            FrameType::RstStream => Some(4),
            FrameType::Ping => Some(8),
            FrameType::WindowUpdate => Some(4),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub frame_type: u8,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    /// Peek a header from the front of `buf` without consuming anything.
    pub fn peek(buf: &[u8]) -> Option<FrameHeader> {
        if buf.len() < FRAME_HEADER_SIZE {
            return None;
        }
        let length = u32::from_be_bytes([0, buf[0], buf[1], buf[2]]);
        let stream_id = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & STREAM_ID_MASK;
        Some(FrameHeader {
            length,
            frame_type: buf[3],
            flags: buf[4],
            stream_id,
        })
    }

    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.put_uint(self.length as u64, 3);
        dst.put_u8(self.frame_type);
        dst.put_u8(self.flags);
        dst.put_u32(self.stream_id & STREAM_ID_MASK);
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag == flag
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityDetails {
    pub exclusive: bool,
    pub stream_dependency: u32,
    pub weight: u8,
}

impl PriorityDetails {
    fn read_from(buf: &mut Bytes) -> PriorityDetails {
        let raw = buf.get_u32();
        PriorityDetails {
            exclusive: raw & !STREAM_ID_MASK != 0,
            stream_dependency: raw & STREAM_ID_MASK,
            weight: buf.get_u8(),
        }
    }

    fn write_to(&self, dst: &mut BytesMut) {
        let mut raw = self.stream_dependency & STREAM_ID_MASK;
        if self.exclusive {
            raw |= !STREAM_ID_MASK;
        }
        dst.put_u32(raw);
        dst.put_u8(self.weight);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub stream_id: u32,
    pub data: Bytes,
    pub end_stream: bool,
    pub padding: Option<Bytes>,
}

impl DataFrame {
    pub fn new(stream_id: u32, data: Bytes, end_stream: bool) -> Self {
        DataFrame {
            stream_id,
            data,
            end_stream,
            padding: None,
        }
    }

    /// Bytes counted against flow control, padding included.
    pub fn flow_controlled_len(&self) -> usize {
        match &self.padding {
            Some(padding) => self.data.len() + padding.len() + 1,
            None => self.data.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadersFrame {
    pub stream_id: u32,
    pub end_stream: bool,
    pub end_headers: bool,
    pub priority: Option<PriorityDetails>,
    pub padding: Option<Bytes>,
    /// raw HPACK fragment carried by this frame
    pub header_fragment: Bytes,
    /// decoded header list, only filled once the whole block is reassembled
    pub headers: Vec<Header>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityFrame {
    pub stream_id: u32,
    pub priority: PriorityDetails,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RstStreamFrame {
    pub stream_id: u32,
    pub error_code: Http2ErrorCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsFrame {
    pub ack: bool,
    pub settings: Vec<(SettingsParameter, u32)>,
}

impl SettingsFrame {
    pub fn ack() -> Self {
        SettingsFrame {
            ack: true,
            settings: vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushPromiseFrame {
    pub stream_id: u32,
    pub promised_stream_id: u32,
    pub end_headers: bool,
    pub padding: Option<Bytes>,
    pub header_fragment: Bytes,
    pub headers: Vec<Header>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingFrame {
    pub ack: bool,
    pub opaque_data: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoAwayFrame {
    pub last_stream_id: u32,
    pub error_code: Http2ErrorCode,
    pub debug_data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowUpdateFrame {
    pub stream_id: u32,
    pub increment: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationFrame {
    pub stream_id: u32,
    pub end_headers: bool,
    pub header_fragment: Bytes,
}

/// A frame whose type id is not defined by the protocol. Kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownFrame {
    pub frame_type: u8,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(DataFrame),
    Headers(HeadersFrame),
    Priority(PriorityFrame),
    RstStream(RstStreamFrame),
    Settings(SettingsFrame),
    PushPromise(PushPromiseFrame),
    Ping(PingFrame),
    GoAway(GoAwayFrame),
    WindowUpdate(WindowUpdateFrame),
    Continuation(ContinuationFrame),
    Unknown(UnknownFrame),
}

impl Frame {
    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Data(f) => f.stream_id,
            Frame::Headers(f) => f.stream_id,
            Frame::Priority(f) => f.stream_id,
            Frame::RstStream(f) => f.stream_id,
            Frame::Settings(_) | Frame::Ping(_) | Frame::GoAway(_) => 0,
            Frame::PushPromise(f) => f.stream_id,
            Frame::WindowUpdate(f) => f.stream_id,
            Frame::Continuation(f) => f.stream_id,
            Frame::Unknown(f) => f.stream_id,
        }
    }

    pub fn type_id(&self) -> u8 {
        match self {
            Frame::Data(_) => FrameType::Data.id(),
            Frame::Headers(_) => FrameType::Headers.id(),
            Frame::Priority(_) => FrameType::Priority.id(),
            Frame::RstStream(_) => FrameType::RstStream.id(),
            Frame::Settings(_) => FrameType::Settings.id(),
            Frame::PushPromise(_) => FrameType::PushPromise.id(),
            Frame::Ping(_) => FrameType::Ping.id(),
            Frame::GoAway(_) => FrameType::GoAway.id(),
            Frame::WindowUpdate(_) => FrameType::WindowUpdate.id(),
            Frame::Continuation(_) => FrameType::Continuation.id(),
            Frame::Unknown(f) => f.frame_type,
        }
    }

    pub fn flags(&self) -> u8 {
        fn set(cond: bool, flag: u8) -> u8 {
            if cond {
                flag
            } else {
                0
            }
        }
        match self {
            Frame::Data(f) => {
                set(f.end_stream, flags::END_STREAM) | set(f.padding.is_some(), flags::PADDED)
            }
            Frame::Headers(f) => {
                set(f.end_stream, flags::END_STREAM)
                    | set(f.end_headers, flags::END_HEADERS)
                    | set(f.padding.is_some(), flags::PADDED)
                    | set(f.priority.is_some(), flags::PRIORITY)
            }
            Frame::Settings(f) => set(f.ack, flags::ACK),
            Frame::PushPromise(f) => {
                set(f.end_headers, flags::END_HEADERS) | set(f.padding.is_some(), flags::PADDED)
            }
            Frame::Ping(f) => set(f.ack, flags::ACK),
            Frame::Continuation(f) => set(f.end_headers, flags::END_HEADERS),
            Frame::Unknown(f) => f.flags,
            Frame::Priority(_) | Frame::RstStream(_) | Frame::GoAway(_) | Frame::WindowUpdate(_) => 0,
        }
    }

    /// Whether this frame carries the END_STREAM flag.
    pub fn is_end_stream(&self) -> bool {
        match self {
            Frame::Data(f) => f.end_stream,
            Frame::Headers(f) => f.end_stream,
            _ => false,
        }
    }

    /// Append the wire form of this frame to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        let start = dst.len();
        FrameHeader {
            length: 0,
            frame_type: self.type_id(),
            flags: self.flags(),
            stream_id: self.stream_id(),
        }
        .write_to(dst);
        let payload_start = dst.len();
        match self {
            Frame::Data(f) => {
                write_padded(dst, &f.padding, |dst| dst.put_slice(&f.data));
            }
            Frame::Headers(f) => {
                write_padded(dst, &f.padding, |dst| {
                    if let Some(priority) = &f.priority {
                        priority.write_to(dst);
                    }
                    dst.put_slice(&f.header_fragment);
                });
            }
            Frame::Priority(f) => f.priority.write_to(dst),
            Frame::RstStream(f) => dst.put_u32(f.error_code.code()),
            Frame::Settings(f) => {
                for (parameter, value) in &f.settings {
                    dst.put_u16(parameter.id());
                    dst.put_u32(*value);
                }
            }
            Frame::PushPromise(f) => {
                write_padded(dst, &f.padding, |dst| {
                    dst.put_u32(f.promised_stream_id & STREAM_ID_MASK);
                    dst.put_slice(&f.header_fragment);
                });
            }
            Frame::Ping(f) => dst.put_u64(f.opaque_data),
            Frame::GoAway(f) => {
                dst.put_u32(f.last_stream_id & STREAM_ID_MASK);
                dst.put_u32(f.error_code.code());
                dst.put_slice(&f.debug_data);
            }
            Frame::WindowUpdate(f) => dst.put_u32(f.increment & STREAM_ID_MASK),
            Frame::Continuation(f) => dst.put_slice(&f.header_fragment),
            Frame::Unknown(f) => dst.put_slice(&f.payload),
        }
        // patch the 24 bit length now that the payload is known
        let length = (dst.len() - payload_start) as u32;
        dst[start..start + 3].copy_from_slice(&length.to_be_bytes()[1..]);
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match FrameType::from_id(self.type_id()) {
            Some(frame_type) => format!("{:?}", frame_type),
            None => format!("Unknown(0x{:x})", self.type_id()),
        };
        write!(
            f,
            "{}[stream={}, flags=0x{:x}]",
            name,
            self.stream_id(),
            self.flags()
        )
    }
}

fn write_padded(dst: &mut BytesMut, padding: &Option<Bytes>, body: impl FnOnce(&mut BytesMut)) {
    match padding {
        Some(padding) => {
            let padding = &padding[..padding.len().min(u8::MAX as usize)];
            dst.put_u8(padding.len() as u8);
            body(dst);
            dst.put_slice(padding);
        }
        None => body(dst),
    }
}

/// Split off the padding of a PADDED frame, returning the remaining body and
/// the pad bytes.
fn strip_padding(header: &FrameHeader, mut payload: Bytes) -> AppResult<(Bytes, Option<Bytes>)> {
    if !header.has_flag(flags::PADDED) {
        return Ok((payload, None));
    }
    if payload.is_empty() {
        return Err(AppError::connection_error_on(
            Http2ErrorCode::FrameSizeError,
            header.stream_id,
            "padded frame without pad length",
        ));
    }
    let pad_length = payload.get_u8() as usize;
    if pad_length > payload.len() {
        return Err(AppError::connection_error_on(
            Http2ErrorCode::ProtocolError,
            header.stream_id,
            format!(
                "pad length {} exceeds payload of {} bytes",
                pad_length,
                payload.len()
            ),
        ));
    }
    let padding = payload.split_off(payload.len() - pad_length);
    Ok((payload, Some(padding)))
}

fn require_stream(header: &FrameHeader, name: &str) -> AppResult<()> {
    if header.stream_id == 0 {
        return Err(AppError::connection_error(
            Http2ErrorCode::ProtocolError,
            format!("{} frame on stream 0", name),
        ));
    }
    Ok(())
}

fn require_connection(header: &FrameHeader, name: &str) -> AppResult<()> {
    if header.stream_id != 0 {
        return Err(AppError::connection_error_on(
            Http2ErrorCode::ProtocolError,
            header.stream_id,
            format!("{} frame on stream {}", name, header.stream_id),
        ));
    }
    Ok(())
}

fn too_short(header: &FrameHeader, name: &str) -> AppError {
    AppError::connection_error_on(
        Http2ErrorCode::FrameSizeError,
        header.stream_id,
        format!("{} frame too short: {} bytes", name, header.length),
    )
}

type PayloadDecoder = fn(&FrameHeader, Bytes) -> AppResult<Frame>;

/// Payload decoders indexed by frame type id.
static PAYLOAD_DECODERS: [PayloadDecoder; 10] = [
    decode_data,
    decode_headers,
    decode_priority,
    decode_rst_stream,
    decode_settings,
    decode_push_promise,
    decode_ping,
    decode_go_away,
    decode_window_update,
    decode_continuation,
];

/// Decode a payload whose header has already been read. The frame size limit
/// is checked by the parser before this point; fixed-size fields are checked
/// here as well so a short payload never reads past its end.
pub fn decode_payload(header: &FrameHeader, payload: Bytes) -> AppResult<Frame> {
    match PAYLOAD_DECODERS.get(header.frame_type as usize) {
        Some(decoder) => decoder(header, payload),
        None => Ok(Frame::Unknown(UnknownFrame {
            frame_type: header.frame_type,
            flags: header.flags,
            stream_id: header.stream_id,
            payload,
        })),
    }
}

fn decode_data(header: &FrameHeader, payload: Bytes) -> AppResult<Frame> {
    require_stream(header, "DATA")?;
    let (data, padding) = strip_padding(header, payload)?;
    Ok(Frame::Data(DataFrame {
        stream_id: header.stream_id,
        data,
        end_stream: header.has_flag(flags::END_STREAM),
        padding,
    }))
}

fn decode_headers(header: &FrameHeader, payload: Bytes) -> AppResult<Frame> {
    require_stream(header, "HEADERS")?;
    let (mut body, padding) = strip_padding(header, payload)?;
    let priority = if header.has_flag(flags::PRIORITY) {
        if body.len() < 5 {
            return Err(too_short(header, "HEADERS"));
        }
        Some(PriorityDetails::read_from(&mut body))
    } else {
        None
    };
    Ok(Frame::Headers(HeadersFrame {
        stream_id: header.stream_id,
        end_stream: header.has_flag(flags::END_STREAM),
        end_headers: header.has_flag(flags::END_HEADERS),
        priority,
        padding,
        header_fragment: body,
        headers: vec![],
    }))
}

fn decode_priority(header: &FrameHeader, mut payload: Bytes) -> AppResult<Frame> {
    require_stream(header, "PRIORITY")?;
    if payload.len() < 5 {
        return Err(too_short(header, "PRIORITY"));
    }
    Ok(Frame::Priority(PriorityFrame {
        stream_id: header.stream_id,
        priority: PriorityDetails::read_from(&mut payload),
    }))
}

fn decode_rst_stream(header: &FrameHeader, mut payload: Bytes) -> AppResult<Frame> {
    require_stream(header, "RST_STREAM")?;
    if payload.len() < 4 {
        return Err(too_short(header, "RST_STREAM"));
    }
    Ok(Frame::RstStream(RstStreamFrame {
        stream_id: header.stream_id,
        error_code: Http2ErrorCode::from_code(payload.get_u32()),
    }))
}

fn decode_settings(header: &FrameHeader, mut payload: Bytes) -> AppResult<Frame> {
    require_connection(header, "SETTINGS")?;
    let ack = header.has_flag(flags::ACK);
    if ack && !payload.is_empty() {
        return Err(AppError::connection_error(
            Http2ErrorCode::FrameSizeError,
            "SETTINGS ack with a payload",
        ));
    }
    let mut settings = Vec::with_capacity(payload.len() / 6);
    while payload.remaining() >= 6 {
        let parameter = SettingsParameter::from_id(payload.get_u16());
        settings.push((parameter, payload.get_u32()));
    }
    Ok(Frame::Settings(SettingsFrame { ack, settings }))
}

fn decode_push_promise(header: &FrameHeader, payload: Bytes) -> AppResult<Frame> {
    require_stream(header, "PUSH_PROMISE")?;
    let (mut body, padding) = strip_padding(header, payload)?;
    if body.len() < 4 {
        return Err(too_short(header, "PUSH_PROMISE"));
    }
    let promised_stream_id = body.get_u32() & STREAM_ID_MASK;
    Ok(Frame::PushPromise(PushPromiseFrame {
        stream_id: header.stream_id,
        promised_stream_id,
        end_headers: header.has_flag(flags::END_HEADERS),
        padding,
        header_fragment: body,
        headers: vec![],
    }))
}

fn decode_ping(header: &FrameHeader, mut payload: Bytes) -> AppResult<Frame> {
    require_connection(header, "PING")?;
    if payload.len() < 8 {
        return Err(too_short(header, "PING"));
    }
    Ok(Frame::Ping(PingFrame {
        ack: header.has_flag(flags::ACK),
        opaque_data: payload.get_u64(),
    }))
}

fn decode_go_away(header: &FrameHeader, mut payload: Bytes) -> AppResult<Frame> {
    require_connection(header, "GOAWAY")?;
    if payload.len() < 8 {
        return Err(too_short(header, "GOAWAY"));
    }
    let last_stream_id = payload.get_u32() & STREAM_ID_MASK;
    let error_code = Http2ErrorCode::from_code(payload.get_u32());
    Ok(Frame::GoAway(GoAwayFrame {
        last_stream_id,
        error_code,
        debug_data: payload,
    }))
}

fn decode_window_update(header: &FrameHeader, mut payload: Bytes) -> AppResult<Frame> {
    if payload.len() < 4 {
        return Err(too_short(header, "WINDOW_UPDATE"));
    }
    let increment = payload.get_u32() & STREAM_ID_MASK;
    if increment == 0 {
        let reason = "WINDOW_UPDATE with zero increment";
        return Err(if header.stream_id == 0 {
            AppError::connection_error(Http2ErrorCode::ProtocolError, reason)
        } else {
            AppError::stream_error(Http2ErrorCode::ProtocolError, header.stream_id, reason)
        });
    }
    Ok(Frame::WindowUpdate(WindowUpdateFrame {
        stream_id: header.stream_id,
        increment,
    }))
}

fn decode_continuation(header: &FrameHeader, payload: Bytes) -> AppResult<Frame> {
    require_stream(header, "CONTINUATION")?;
    Ok(Frame::Continuation(ContinuationFrame {
        stream_id: header.stream_id,
        end_headers: header.has_flag(flags::END_HEADERS),
        header_fragment: payload,
    }))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn decode_one(bytes: &[u8]) -> AppResult<Frame> {
        let header = FrameHeader::peek(bytes).unwrap();
        let payload = Bytes::copy_from_slice(&bytes[FRAME_HEADER_SIZE..]);
        assert_eq!(payload.len(), header.length as usize);
        decode_payload(&header, payload)
    }

    #[rstest]
    #[case::priority(0x2, 1, 4)]
    #[case::rst_stream(0x3, 1, 2)]
    #[case::ping(0x6, 0, 7)]
    #[case::window_update(0x8, 1, 3)]
    fn test_short_fixed_payload_is_frame_size_error(
        #[case] frame_type: u8,
        #[case] stream_id: u32,
        #[case] length: usize,
    ) {
        let header = FrameHeader {
            length: length as u32,
            frame_type,
            flags: 0,
            stream_id,
        };
        let err = decode_payload(&header, Bytes::from(vec![0u8; length])).unwrap_err();
        assert_eq!(err.wire_code(), Http2ErrorCode::FrameSizeError);
    }

    #[test]
    fn test_header_reserved_bit_ignored() {
        let raw = [0, 0, 4, 0x8, 0, 0x80, 0, 0, 3, 0, 0, 0, 10];
        let header = FrameHeader::peek(&raw).unwrap();
        assert_eq!(header.stream_id, 3);
        assert_eq!(header.length, 4);

        let mut dst = BytesMut::new();
        FrameHeader {
            stream_id: 0x8000_0005,
            ..header
        }
        .write_to(&mut dst);
        assert_eq!(&dst[5..9], &[0, 0, 0, 5]);
    }

    #[test]
    fn test_padded_headers_with_priority() {
        let frame = Frame::Headers(HeadersFrame {
            stream_id: 1,
            end_stream: true,
            end_headers: true,
            priority: Some(PriorityDetails {
                exclusive: true,
                stream_dependency: 3,
                weight: 15,
            }),
            padding: Some(Bytes::from_static(&[0, 0, 0])),
            header_fragment: Bytes::from_static(&[0x82, 0x84]),
            headers: vec![],
        });
        let mut dst = BytesMut::new();
        frame.encode(&mut dst);
        // pad length + priority + fragment + padding
        assert_eq!(dst.len(), FRAME_HEADER_SIZE + 1 + 5 + 2 + 3);
        assert_eq!(decode_one(&dst).unwrap(), frame);
    }

    #[test]
    fn test_pad_length_larger_than_payload() {
        // DATA, PADDED, pad length 5 but only 2 bytes follow
        let raw = [0, 0, 3, 0x0, flags::PADDED, 0, 0, 0, 1, 5, b'a', b'b'];
        let err = decode_one(&raw).unwrap_err();
        assert!(err.is_connection_level());
        assert_eq!(err.wire_code(), Http2ErrorCode::ProtocolError);
    }

    #[test]
    fn test_unknown_type_kept_verbatim() {
        let raw = [0, 0, 2, 0xfa, 0x3, 0, 0, 0, 7, 1, 2];
        let frame = decode_one(&raw).unwrap();
        assert_eq!(
            frame,
            Frame::Unknown(UnknownFrame {
                frame_type: 0xfa,
                flags: 0x3,
                stream_id: 7,
                payload: Bytes::from_static(&[1, 2]),
            })
        );
        let mut dst = BytesMut::new();
        frame.encode(&mut dst);
        assert_eq!(&dst[..], &raw[..]);
    }

    #[test]
    fn test_settings_on_stream_is_connection_error() {
        let raw = [0, 0, 0, 0x4, 0, 0, 0, 0, 1];
        let err = decode_one(&raw).unwrap_err();
        assert!(err.is_connection_level());
    }

    #[test]
    fn test_zero_window_increment_on_stream_is_stream_error() {
        let raw = [0, 0, 4, 0x8, 0, 0, 0, 0, 3, 0, 0, 0, 0];
        let err = decode_one(&raw).unwrap_err();
        assert!(!err.is_connection_level());
    }

    #[test]
    fn test_go_away_with_debug_data() {
        let frame = Frame::GoAway(GoAwayFrame {
            last_stream_id: 9,
            error_code: Http2ErrorCode::EnhanceYourCalm,
            debug_data: Bytes::from_static(b"slow down"),
        });
        let mut dst = BytesMut::new();
        frame.encode(&mut dst);
        assert_eq!(decode_one(&dst).unwrap(), frame);
        assert_eq!(frame.to_string(), "GoAway[stream=0, flags=0x0]");
    }
}

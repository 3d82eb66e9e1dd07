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

//! Header compression boundary.
//!
//! Both the encoder and the decoder carry per-connection dynamic table state,
//! so each connection owns exactly one of each and they must see header blocks
//! in wire order.

use std::fmt::{Debug, Formatter};

use bytes::Bytes;

use super::Http2ErrorCode;
use crate::{AppError, AppResult};

/// One header field. Names and values are kept as raw bytes since HPACK does
/// not guarantee valid UTF-8.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Header {
    pub name: Bytes,
    pub value: Bytes,
}

impl Header {
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Header {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn name_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.name)
    }

    pub fn value_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }

    /// Size as counted against SETTINGS_MAX_HEADER_LIST_SIZE.
    pub fn list_size(&self) -> usize {
        self.name.len() + self.value.len() + 32
    }
}

pub struct HpackDecoder {
    inner: fluke_hpack::Decoder<'static>,
}

impl Debug for HpackDecoder {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HpackDecoder").finish()
    }
}

impl Default for HpackDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HpackDecoder {
    pub fn new() -> Self {
        HpackDecoder {
            inner: fluke_hpack::Decoder::new(),
        }
    }

    /// Decode a complete header block. Any failure leaves the dynamic table in
    /// an unknown state, so it is always a connection error.
    pub fn decode(&mut self, block: &[u8]) -> AppResult<Vec<Header>> {
        let pairs = self.inner.decode(block).map_err(|e| {
            AppError::connection_error(
                Http2ErrorCode::CompressionError,
                format!("header block decode failed: {:?}", e),
            )
        })?;
        Ok(pairs
            .into_iter()
            .map(|(name, value)| Header::new(name, value))
            .collect())
    }
}

pub struct HpackEncoder {
    inner: fluke_hpack::Encoder<'static>,
}

impl Debug for HpackEncoder {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HpackEncoder").finish()
    }
}

impl Default for HpackEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HpackEncoder {
    pub fn new() -> Self {
        HpackEncoder {
            inner: fluke_hpack::Encoder::new(),
        }
    }

    pub fn encode(&mut self, headers: &[Header]) -> Bytes {
        let pairs: Vec<(&[u8], &[u8])> = headers
            .iter()
            .map(|h| (h.name.as_ref(), h.value.as_ref()))
            .collect();
        Bytes::from(self.inner.encode(pairs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_static_table_entries() {
        let mut decoder = HpackDecoder::new();
        // :method GET, :scheme http, :path /
        let headers = decoder.decode(&[0x82, 0x86, 0x84]).unwrap();
        assert_eq!(
            headers,
            vec![
                Header::new(":method", "GET"),
                Header::new(":scheme", "http"),
                Header::new(":path", "/"),
            ]
        );
    }

    #[test]
    fn test_dynamic_table_shared_across_blocks() {
        let mut encoder = HpackEncoder::new();
        let mut decoder = HpackDecoder::new();
        let headers = vec![
            Header::new(":status", "200"),
            Header::new("x-request-id", "abc-123"),
        ];
        let first = encoder.encode(&headers);
        let second = encoder.encode(&headers);
        assert!(second.len() <= first.len());
        assert_eq!(decoder.decode(&first).unwrap(), headers);
        assert_eq!(decoder.decode(&second).unwrap(), headers);
    }

    #[test]
    fn test_garbage_is_compression_error() {
        let mut decoder = HpackDecoder::new();
        // indexed field pointing far beyond both tables
        let err = decoder.decode(&[0xff, 0xff, 0xff, 0x7f]).unwrap_err();
        assert!(err.is_connection_level());
        assert_eq!(err.wire_code(), Http2ErrorCode::CompressionError);
    }
}

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

mod error_code;
pub mod frame;
pub mod hpack;
pub mod parser;
pub mod settings;

pub use error_code::Http2ErrorCode;
pub use frame::{
    ContinuationFrame, DataFrame, Frame, FrameHeader, FrameType, GoAwayFrame, HeadersFrame,
    PingFrame, PriorityDetails, PriorityFrame, PushPromiseFrame, RstStreamFrame, SettingsFrame,
    UnknownFrame, WindowUpdateFrame, CONNECTION_PREFACE, FRAME_HEADER_SIZE,
};
pub use hpack::{Header, HpackDecoder, HpackEncoder};
pub use parser::{HeaderBlockStart, Http2Parser, ParsedItem, ParserResult};
pub use settings::{Http2Settings, SettingsParameter};

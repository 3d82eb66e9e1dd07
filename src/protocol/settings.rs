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

use serde::{Deserialize, Serialize};

use super::Http2ErrorCode;
use crate::{AppError, AppResult};

pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
pub const MAX_ALLOWED_FRAME_SIZE: u32 = 16_777_215;
pub const MAX_WINDOW_SIZE: u32 = 0x7fff_ffff;

/// SETTINGS parameter identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingsParameter {
    HeaderTableSize,
    EnablePush,
    MaxConcurrentStreams,
    InitialWindowSize,
    MaxFrameSize,
    MaxHeaderListSize,
    /// unknown identifiers are ignored but survive a decode/encode cycle
    Unknown(u16),
}

impl SettingsParameter {
    pub fn from_id(id: u16) -> Self {
        match id {
            0x1 => SettingsParameter::HeaderTableSize,
            0x2 => SettingsParameter::EnablePush,
            0x3 => SettingsParameter::MaxConcurrentStreams,
            0x4 => SettingsParameter::InitialWindowSize,
            0x5 => SettingsParameter::MaxFrameSize,
            0x6 => SettingsParameter::MaxHeaderListSize,
            other => SettingsParameter::Unknown(other),
        }
    }

    pub fn id(&self) -> u16 {
        match self {
            SettingsParameter::HeaderTableSize => 0x1,
            SettingsParameter::EnablePush => 0x2,
            SettingsParameter::MaxConcurrentStreams => 0x3,
            SettingsParameter::InitialWindowSize => 0x4,
            SettingsParameter::MaxFrameSize => 0x5,
            SettingsParameter::MaxHeaderListSize => 0x6,
            SettingsParameter::Unknown(id) => *id,
        }
    }
}

/// One side's view of the connection parameters.
///
/// The engine keeps one instance for the local endpoint and one for the
/// remote endpoint. Local values only become binding once the peer has
/// acknowledged the SETTINGS frame that advertised them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Http2Settings {
    pub header_table_size: u32,
    pub enable_push: bool,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: Option<u32>,
}

impl Default for Http2Settings {
    fn default() -> Self {
        Self {
            header_table_size: DEFAULT_HEADER_TABLE_SIZE,
            enable_push: true,
            max_concurrent_streams: None,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: None,
        }
    }
}

impl Http2Settings {
    /// Apply the entries of a received SETTINGS frame in order.
    ///
    /// Values are validated before anything is modified, so a rejected frame
    /// leaves the settings untouched.
    pub fn apply(&mut self, entries: &[(SettingsParameter, u32)]) -> AppResult<()> {
        let mut updated = self.clone();
        for (parameter, value) in entries {
            let value = *value;
            match parameter {
                SettingsParameter::HeaderTableSize => updated.header_table_size = value,
                SettingsParameter::EnablePush => {
                    if value > 1 {
                        return Err(AppError::connection_error(
                            Http2ErrorCode::ProtocolError,
                            format!("ENABLE_PUSH must be 0 or 1, got {}", value),
                        ));
                    }
                    updated.enable_push = value == 1;
                }
                SettingsParameter::MaxConcurrentStreams => {
                    updated.max_concurrent_streams = Some(value)
                }
                SettingsParameter::InitialWindowSize => {
                    if value > MAX_WINDOW_SIZE {
                        return Err(AppError::connection_error(
                            Http2ErrorCode::FlowControlError,
                            format!("INITIAL_WINDOW_SIZE {} above 2^31-1", value),
                        ));
                    }
                    updated.initial_window_size = value;
                }
                SettingsParameter::MaxFrameSize => {
                    if !(DEFAULT_MAX_FRAME_SIZE..=MAX_ALLOWED_FRAME_SIZE).contains(&value) {
                        return Err(AppError::connection_error(
                            Http2ErrorCode::ProtocolError,
                            format!("MAX_FRAME_SIZE {} out of range", value),
                        ));
                    }
                    updated.max_frame_size = value;
                }
                SettingsParameter::MaxHeaderListSize => updated.max_header_list_size = Some(value),
                SettingsParameter::Unknown(_) => {}
            }
        }
        *self = updated;
        Ok(())
    }

    /// The entries to advertise for these settings in a SETTINGS frame.
    pub fn to_entries(&self) -> Vec<(SettingsParameter, u32)> {
        let mut entries = vec![
            (SettingsParameter::HeaderTableSize, self.header_table_size),
            (SettingsParameter::EnablePush, u32::from(self.enable_push)),
        ];
        if let Some(max) = self.max_concurrent_streams {
            entries.push((SettingsParameter::MaxConcurrentStreams, max));
        }
        entries.push((SettingsParameter::InitialWindowSize, self.initial_window_size));
        entries.push((SettingsParameter::MaxFrameSize, self.max_frame_size));
        if let Some(max) = self.max_header_list_size {
            entries.push((SettingsParameter::MaxHeaderListSize, max));
        }
        entries
    }

    /// Check values read from configuration with the same rules the wire uses.
    pub fn validate(&self) -> AppResult<()> {
        let mut probe = Http2Settings::default();
        probe.apply(&self.to_entries()).map_err(|e| {
            AppError::InvalidValue(format!("http2 settings: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_entries_round_trip() {
        let settings = Http2Settings::default();
        let mut decoded = Http2Settings {
            header_table_size: 1,
            enable_push: false,
            ..Default::default()
        };
        decoded.apply(&settings.to_entries()).unwrap();
        assert_eq!(decoded, settings);
    }

    #[test]
    fn test_invalid_values_rejected_atomically() {
        let mut settings = Http2Settings::default();
        let result = settings.apply(&[
            (SettingsParameter::InitialWindowSize, 1000),
            (SettingsParameter::MaxFrameSize, 100),
        ]);
        assert!(matches!(
            result,
            Err(AppError::Protocol {
                code: Http2ErrorCode::ProtocolError,
                connection_level: true,
                ..
            })
        ));
        assert_eq!(settings.initial_window_size, DEFAULT_INITIAL_WINDOW_SIZE);
    }

    #[test]
    fn test_window_too_large() {
        let mut settings = Http2Settings::default();
        let result = settings.apply(&[(SettingsParameter::InitialWindowSize, 0x8000_0000)]);
        assert!(matches!(
            result,
            Err(AppError::Protocol {
                code: Http2ErrorCode::FlowControlError,
                ..
            })
        ));
    }

    #[test]
    fn test_unknown_parameter_ignored() {
        let mut settings = Http2Settings::default();
        settings
            .apply(&[(SettingsParameter::from_id(0xff), 42)])
            .unwrap();
        assert_eq!(settings, Http2Settings::default());
        assert_eq!(SettingsParameter::from_id(0xff).id(), 0xff);
    }
}

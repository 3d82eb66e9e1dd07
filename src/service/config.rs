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

extern crate config as _;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::protocol::parser::DEFAULT_MAX_HEADER_BLOCK_SIZE;
use crate::protocol::Http2Settings;
use crate::{AppError, AppResult};

pub const ENV_PREFIX: &str = "H2WIRE";

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    pub max_connection: usize,
    pub connect_timeout_ms: u64,
    /// queued but unwritten bytes above which writers are asked to pause
    pub write_high_watermark: usize,
    /// queued bytes below which paused writers may resume
    pub write_low_watermark: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "127.0.0.1".to_string(),
            port: 8443,
            max_connection: 1024,
            connect_timeout_ms: 5000,
            write_high_watermark: 1024 * 1024,
            write_low_watermark: 256 * 1024,
        }
    }
}

/// Certificate chain and private key for one virtual host.
#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct TlsHostConfig {
    /// SNI host name this entry answers for
    pub host: String,
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    /// host used when the client sends no SNI or an unknown one
    pub default_host: String,
    pub hosts: Vec<TlsHostConfig>,
    /// how long a local close waits for the peer's close_notify
    pub close_timeout_ms: u64,
}

impl Default for TlsConfig {
    fn default() -> Self {
        TlsConfig {
            enabled: false,
            default_host: String::new(),
            hosts: vec![],
            close_timeout_ms: 3000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Http2Config {
    pub max_header_block_size: usize,
    /// settings advertised to the peer right after the connection starts
    pub settings: Http2Settings,
}

impl Default for Http2Config {
    fn default() -> Self {
        Http2Config {
            max_header_block_size: DEFAULT_MAX_HEADER_BLOCK_SIZE,
            settings: Http2Settings::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SessionExecutorConfig {
    pub queue_warn_threshold: usize,
}

impl Default for SessionExecutorConfig {
    fn default() -> Self {
        SessionExecutorConfig {
            queue_warn_threshold: 10_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BufferPoolConfig {
    pub buffer_size: usize,
    pub max_pooled: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        BufferPoolConfig {
            buffer_size: 16 * 1024,
            max_pooled: 1024,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LogConfig {
    pub dir: String,
    /// filter directive used when `RUST_LOG` is not set
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            dir: "./logs".to_string(),
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    pub log: LogConfig,
    pub network: NetworkConfig,
    pub tls: TlsConfig,
    pub http2: Http2Config,
    pub session_executor: SessionExecutorConfig,
    pub buffer_pool: BufferPoolConfig,
}

impl EngineConfig {
    /// Read `path`, then let `H2WIRE__SECTION__KEY` environment variables
    /// override single values, then validate the result.
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<EngineConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let engine_config: EngineConfig = config.try_deserialize()?;
        engine_config.validate()?;
        Ok(engine_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.network.write_low_watermark > self.network.write_high_watermark {
            return Err(AppError::InvalidValue(format!(
                "network.write_low_watermark {} above write_high_watermark {}",
                self.network.write_low_watermark, self.network.write_high_watermark
            )));
        }
        if self.network.max_connection == 0 {
            return Err(AppError::InvalidValue(
                "network.max_connection must be positive".to_string(),
            ));
        }
        if self.buffer_pool.buffer_size == 0 {
            return Err(AppError::InvalidValue(
                "buffer_pool.buffer_size must be positive".to_string(),
            ));
        }
        if self.tls.enabled {
            if self.tls.hosts.is_empty() {
                return Err(AppError::InvalidValue(
                    "tls.enabled requires at least one tls.hosts entry".to_string(),
                ));
            }
            if !self.tls.hosts.iter().any(|h| h.host == self.tls.default_host) {
                return Err(AppError::InvalidValue(format!(
                    "tls.default_host {} has no tls.hosts entry",
                    self.tls.default_host
                )));
            }
        }
        self.http2.settings.validate()
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.network.ip, self.network.port)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let file = write_config(
            r#"
[network]
port = 9443

[http2.settings]
initial_window_size = 1000
max_concurrent_streams = 100
"#,
        );
        let config = EngineConfig::set_up_config(file.path()).unwrap();
        assert_eq!(config.network.port, 9443);
        assert_eq!(config.network.ip, "127.0.0.1");
        assert_eq!(config.http2.settings.initial_window_size, 1000);
        assert_eq!(config.http2.settings.max_concurrent_streams, Some(100));
        assert_eq!(config.http2.settings.max_frame_size, 16384);
        assert_eq!(config.session_executor.queue_warn_threshold, 10_000);
    }

    #[test]
    fn test_invalid_frame_size_rejected() {
        let file = write_config(
            r#"
[http2.settings]
max_frame_size = 100
"#,
        );
        assert!(matches!(
            EngineConfig::set_up_config(file.path()),
            Err(AppError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_tls_requires_default_host() {
        let mut config = EngineConfig::default();
        config.tls.enabled = true;
        config.tls.hosts.push(TlsHostConfig {
            host: "a.example".into(),
            cert_path: "a.pem".into(),
            key_path: "a.key".into(),
        });
        config.tls.default_host = "b.example".into();
        assert!(config.validate().is_err());
        config.tls.default_host = "a.example".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            EngineConfig::set_up_config("/nonexistent/h2wire.toml"),
            Err(AppError::ConfigFileError(_))
        ));
    }
}

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

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::network::TextEncoding;

use super::{AppError, AppResult};

pub const SINGLE_CLIENT_CHUNK_SIZE: usize = 1024;
pub const MULTI_CLIENT_CHUNK_SIZE: usize = 2048;
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

/// Error reporting posture, fixed when a component is constructed.
///
/// Under `Strict` unknown client ids, calls made while offline and malformed
/// frames raise. Under `Lenient` the same conditions yield an empty result
/// (empty bytes, empty string, dropped write).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Posture {
    #[default]
    Strict,
    Lenient,
}

impl Posture {
    /// Raise `err` under `Strict`, swallow it into `T::default()` under `Lenient`.
    pub fn degrade<T: Default>(self, err: AppError) -> AppResult<T> {
        match self {
            Posture::Strict => Err(err),
            Posture::Lenient => {
                warn!("degraded to empty result: {}", err);
                Ok(T::default())
            }
        }
    }
}

/// Per-connection I/O settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    pub send_encoding: TextEncoding,
    pub receive_encoding: TextEncoding,
    pub read_line_terminator: String,
    pub write_line_terminator: String,
    /// upper bound of a single physical read
    pub max_chunk_size: usize,
    /// largest payload, in characters, the framing codec accepts
    pub max_message_len: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::single_client()
    }
}

impl ConnectionOptions {
    pub fn single_client() -> Self {
        ConnectionOptions {
            send_encoding: TextEncoding::Utf8,
            receive_encoding: TextEncoding::Utf8,
            read_line_terminator: "\n".to_string(),
            write_line_terminator: "\n".to_string(),
            max_chunk_size: SINGLE_CLIENT_CHUNK_SIZE,
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
        }
    }

    pub fn multi_client() -> Self {
        ConnectionOptions {
            max_chunk_size: MULTI_CLIENT_CHUNK_SIZE,
            ..Self::single_client()
        }
    }

    pub fn with_encoding(mut self, encoding: TextEncoding) -> Self {
        self.send_encoding = encoding;
        self.receive_encoding = encoding;
        self
    }

    pub fn with_line_terminator(mut self, terminator: impl Into<String>) -> Self {
        let terminator = terminator.into();
        self.read_line_terminator = terminator.clone();
        self.write_line_terminator = terminator;
        self
    }

    pub fn with_max_chunk_size(mut self, max_chunk_size: usize) -> Self {
        self.max_chunk_size = max_chunk_size;
        self
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.max_chunk_size == 0 {
            return Err(AppError::InvalidValue(
                "max_chunk_size must be greater than 0".into(),
            ));
        }
        if self.read_line_terminator.is_empty() || self.write_line_terminator.is_empty() {
            return Err(AppError::InvalidValue(
                "line terminators must not be empty".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "127.0.0.1".to_string(),
            port: 9099,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    pub posture: Posture,
    pub network: NetworkConfig,
    pub connection: ConnectionOptions,
    /// directory for rolling log files, stdout only when absent
    pub log_dir: Option<String>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        SocketConfig {
            posture: Posture::Strict,
            network: NetworkConfig::default(),
            connection: ConnectionOptions::multi_client(),
            log_dir: None,
        }
    }
}

impl SocketConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<SocketConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let socket_config: SocketConfig = config.try_deserialize()?;
        socket_config.connection.validate()?;

        Ok(socket_config)
    }
}

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

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// configuration errors, raised before anything is started
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// transport errors
    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("connection {0} closed by peer")]
    ConnectionClosed(u64),

    /// malformed frame header or oversized frame
    #[error("malformed protocol : {0}")]
    MalformedProtocol(String),

    #[error("unknown client: {0}")]
    UnknownClient(String),

    /// operation invoked while offline, or an internal invariant was broken
    #[error("illegal state: {0}")]
    IllegalStateError(String),
}

/// Coarse classification of [`AppError`], used by callers that only care
/// about which layer failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Transport,
    Protocol,
    Lookup,
    State,
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::InvalidEndpoint(_)
            | AppError::InvalidValue(_)
            | AppError::ConfigFileError(_) => ErrorKind::Configuration,
            AppError::DetailedIoError(_) | AppError::IoError(_) | AppError::ConnectionClosed(_) => {
                ErrorKind::Transport
            }
            AppError::MalformedProtocol(_) => ErrorKind::Protocol,
            AppError::UnknownClient(_) => ErrorKind::Lookup,
            AppError::IllegalStateError(_) => ErrorKind::State,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_error_kind_mapping() {
        let io_err: AppError = io::Error::new(io::ErrorKind::BrokenPipe, "pipe").into();
        assert_eq!(io_err.kind(), ErrorKind::Transport);
        assert_eq!(ErrorKind::Transport, AppError::ConnectionClosed(3).kind());
        assert_eq!(
            ErrorKind::Protocol,
            AppError::MalformedProtocol("abc".into()).kind()
        );
        assert_eq!(ErrorKind::Lookup, AppError::UnknownClient("x".into()).kind());
        assert_eq!(
            ErrorKind::State,
            AppError::IllegalStateError("offline".into()).kind()
        );
        assert_eq!(
            ErrorKind::Configuration,
            AppError::InvalidEndpoint("host".into()).kind()
        );
    }
}

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

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpStream};

use crate::{AppError, AppResult};

/// Any established byte stream a [`Connection`](super::Connection) can own.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedTransport = Box<dyn Transport>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Plain,
    Secure,
}

/// Turns an established TCP stream into a secure transport.
///
/// Certificate loading and the handshake live entirely in the implementor;
/// once upgraded the transport is read and written like a plain one.
pub trait SecureUpgrade: Send + Sync {
    fn upgrade(
        &self,
        stream: TcpStream,
    ) -> Pin<Box<dyn Future<Output = io::Result<BoxedTransport>> + Send + '_>>;
}

pub fn is_valid_port(port: i64) -> bool {
    (1..=65535).contains(&port)
}

/// Host and port of a peer or of a listening socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> AppResult<Self> {
        let host = host.into();
        if host.trim().is_empty() {
            return Err(AppError::InvalidEndpoint("empty host".into()));
        }
        Ok(Endpoint { host, port })
    }

    /// Parses `host:port` or `[v6addr]:port`.
    pub fn parse(value: &str) -> AppResult<Self> {
        let (host, port) = value
            .rsplit_once(':')
            .ok_or_else(|| AppError::InvalidEndpoint(format!("missing port in {}", value)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port: i64 = port
            .parse()
            .map_err(|_| AppError::InvalidEndpoint(format!("invalid port in {}", value)))?;
        // port 0 is accepted here so listeners can ask for an ephemeral port
        if port != 0 && !is_valid_port(port) {
            return Err(AppError::InvalidEndpoint(format!(
                "port {} out of range",
                port
            )));
        }
        Endpoint::new(host, port as u16)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Connecting needs a concrete port.
    pub fn validate_for_connect(&self) -> AppResult<()> {
        if is_valid_port(self.port as i64) {
            Ok(())
        } else {
            Err(AppError::InvalidEndpoint(format!(
                "port {} is not connectable",
                self.port
            )))
        }
    }

    pub async fn resolve(&self) -> AppResult<SocketAddr> {
        let mut addrs = lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| AppError::InvalidEndpoint(format!("resolve {}: {}", self, e)))?;
        addrs
            .next()
            .ok_or_else(|| AppError::InvalidEndpoint(format!("no address for {}", self)))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

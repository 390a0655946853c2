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

use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::network::{
    Augmentation, BoxedTransport, Connection, Endpoint, SecureUpgrade, TransportKind,
};
use crate::{AppError, AppResult, ConnectionOptions, Posture};

/// Outbound TCP connection to a remote endpoint.
pub struct TcpClient {
    endpoint: Endpoint,
    secure: Option<Arc<dyn SecureUpgrade>>,
    connection: Arc<Connection>,
}

impl TcpClient {
    pub fn new(endpoint: Endpoint, options: ConnectionOptions, posture: Posture) -> Self {
        TcpClient {
            endpoint,
            secure: None,
            connection: Arc::new(Connection::detached(options).with_posture(posture)),
        }
    }

    pub fn with_secure_upgrade(mut self, secure: Arc<dyn SecureUpgrade>) -> Self {
        self.secure = Some(secure);
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Connects and brings the connection online.
    ///
    /// Port 0 and an unresolvable host fail here as configuration errors,
    /// before any socket is opened.
    pub async fn start(&self) -> AppResult<()> {
        if self.connection.is_online() {
            return Ok(());
        }
        self.endpoint.validate_for_connect()?;
        self.connection.options().validate()?;
        let address = self.endpoint.resolve().await?;

        let stream = TcpStream::connect(address).await.map_err(|e| {
            AppError::DetailedIoError(format!("failed to connect to {}: {}", self.endpoint, e))
        })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed: {}", e);
        }
        let peer = stream.peer_addr().ok();

        let (transport, kind): (BoxedTransport, TransportKind) = match &self.secure {
            Some(secure) => (
                secure.upgrade(stream).await.map_err(|e| {
                    AppError::DetailedIoError(format!("secure handshake failed: {}", e))
                })?,
                TransportKind::Secure,
            ),
            None => (Box::new(stream), TransportKind::Plain),
        };

        self.connection.attach(transport, kind, peer)?;
        self.connection.start().await?;
        info!("connected to {} ({:?})", self.endpoint, kind);
        Ok(())
    }

    pub async fn graceful_stop(&self) {
        self.connection.graceful_stop().await;
    }

    pub async fn force_stop(&self) {
        self.connection.force_stop().await;
    }

    pub fn install_augmentation(&self, augmentation: Arc<dyn Augmentation>) -> bool {
        self.connection.install_augmentation(augmentation)
    }

    pub fn uninstall_augmentation(&self, augmentation: &Arc<dyn Augmentation>) -> bool {
        self.connection.uninstall_augmentation(augmentation)
    }
}

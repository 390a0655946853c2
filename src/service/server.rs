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

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use crossbeam::atomic::AtomicCell;
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

use crate::network::{
    new_client_id, Augmentation, AugmentationHost, BoxedTransport, ClientId, ClientRecord,
    Connection, ConnectionRegistry, Endpoint, SecureUpgrade, TransportKind,
};
use crate::{AppError, AppResult, ConnectionOptions, Posture};

use super::Shutdown;

pub type ClientCallback = Arc<dyn Fn(&ClientId) + Send + Sync>;
pub type ClientChunkCallback = Arc<dyn Fn(&ClientId, &Bytes) -> AppResult<()> + Send + Sync>;
pub type ClientLineCallback = Arc<dyn Fn(&ClientId, &str) -> AppResult<()> + Send + Sync>;

async fn bind(endpoint: &Endpoint) -> AppResult<TcpListener> {
    let address = endpoint.resolve().await?;
    let listener = TcpListener::bind(address).await.map_err(|e| {
        AppError::DetailedIoError(format!("failed to bind server to {}: {}", endpoint, e))
    })?;
    info!(
        "tcp server binding to {} for listening",
        listener.local_addr()?
    );
    Ok(listener)
}

/// Accepts one stream, retrying transient failures with exponential backoff.
async fn accept(listener: &TcpListener) -> AppResult<(TcpStream, SocketAddr)> {
    let mut backoff = 1;

    loop {
        match listener.accept().await {
            Ok(accepted) => return Ok(accepted),
            Err(err) => {
                if backoff > 64 {
                    return Err(AppError::DetailedIoError(format!(
                        "accept tcp server error: {}",
                        err
                    )));
                }
                warn!("accept failed, retry in {}s: {}", backoff, err);
            }
        }

        time::sleep(Duration::from_secs(backoff)).await;
        backoff *= 2;
    }
}

async fn upgrade(
    secure: Option<&Arc<dyn SecureUpgrade>>,
    stream: TcpStream,
) -> AppResult<(BoxedTransport, TransportKind)> {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay failed: {}", e);
    }
    match secure {
        Some(secure) => {
            let transport = secure.upgrade(stream).await.map_err(|e| {
                AppError::DetailedIoError(format!("secure handshake failed: {}", e))
            })?;
            Ok((transport, TransportKind::Secure))
        }
        None => Ok((Box::new(stream), TransportKind::Plain)),
    }
}

/// Server that accepts exactly one peer and then behaves like its connection.
pub struct TcpServer {
    endpoint: Endpoint,
    secure: Option<Arc<dyn SecureUpgrade>>,
    listener: tokio::sync::Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    connection: Arc<Connection>,
}

impl TcpServer {
    pub fn new(endpoint: Endpoint, options: ConnectionOptions, posture: Posture) -> Self {
        TcpServer {
            endpoint,
            secure: None,
            listener: tokio::sync::Mutex::new(None),
            local_addr: Mutex::new(None),
            connection: Arc::new(Connection::detached(options).with_posture(posture)),
        }
    }

    pub fn with_secure_upgrade(mut self, secure: Arc<dyn SecureUpgrade>) -> Self {
        self.secure = Some(secure);
        self
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Binds the listening socket, returning the address actually bound.
    pub async fn bind(&self) -> AppResult<SocketAddr> {
        let mut listener = self.listener.lock().await;
        if let Some(listener) = listener.as_ref() {
            return Ok(listener.local_addr()?);
        }
        let bound = bind(&self.endpoint).await?;
        let local_addr = bound.local_addr()?;
        *self.local_addr.lock() = Some(local_addr);
        *listener = Some(bound);
        Ok(local_addr)
    }

    /// Waits for the single peer, then starts the connection.
    ///
    /// The listening socket is closed once the peer is accepted.
    pub async fn start(&self) -> AppResult<()> {
        if self.connection.is_online() {
            return Ok(());
        }
        self.bind().await?;
        let listener = self.listener.lock().await.take().ok_or_else(|| {
            AppError::IllegalStateError("tcp server listener already consumed".into())
        })?;
        let (stream, peer) = accept(&listener).await?;
        drop(listener);
        info!("tcp server accepted {}", peer);

        let (transport, kind) = upgrade(self.secure.as_ref(), stream).await?;
        self.connection.attach(transport, kind, Some(peer))?;
        self.connection.start().await
    }

    pub async fn graceful_stop(&self) {
        self.listener.lock().await.take();
        self.connection.graceful_stop().await;
    }

    pub async fn force_stop(&self) {
        self.listener.lock().await.take();
        self.connection.force_stop().await;
    }

    pub fn install_augmentation(&self, augmentation: Arc<dyn Augmentation>) -> bool {
        self.connection
            .augmentations()
            .install(augmentation, AugmentationHost::TcpServer(self))
    }

    pub fn uninstall_augmentation(&self, augmentation: &Arc<dyn Augmentation>) -> bool {
        self.connection
            .augmentations()
            .uninstall(augmentation, AugmentationHost::TcpServer(self))
    }
}

/// Server that keeps accepting clients and addresses them by [`ClientId`].
///
/// The server exclusively owns the connections in its registry. Each
/// connection reaches back only through a `Weak` handle, used to report its
/// disconnect.
pub struct MultiClientServer {
    endpoint: Endpoint,
    options: ConnectionOptions,
    posture: Posture,
    secure: Option<Arc<dyn SecureUpgrade>>,
    registry: ConnectionRegistry,
    augmentations: RwLock<Vec<Arc<dyn Augmentation>>>,
    client_connected: RwLock<Vec<ClientCallback>>,
    client_disconnected: RwLock<Vec<ClientCallback>>,
    chunk_subscribers: RwLock<Vec<ClientChunkCallback>>,
    line_subscribers: RwLock<Vec<ClientLineCallback>>,
    /// serializes propagation of augmentations and subscribers against
    /// registration of new clients
    propagation: Mutex<()>,
    notify_shutdown: broadcast::Sender<()>,
    running: AtomicCell<bool>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl MultiClientServer {
    pub fn new(endpoint: Endpoint, options: ConnectionOptions, posture: Posture) -> Self {
        let (notify_shutdown, _) = broadcast::channel(1);
        MultiClientServer {
            endpoint,
            options,
            posture,
            secure: None,
            registry: ConnectionRegistry::new(),
            augmentations: RwLock::new(Vec::new()),
            client_connected: RwLock::new(Vec::new()),
            client_disconnected: RwLock::new(Vec::new()),
            chunk_subscribers: RwLock::new(Vec::new()),
            line_subscribers: RwLock::new(Vec::new()),
            propagation: Mutex::new(()),
            notify_shutdown,
            running: AtomicCell::new(false),
            local_addr: Mutex::new(None),
        }
    }

    pub fn with_secure_upgrade(mut self, secure: Arc<dyn SecureUpgrade>) -> Self {
        self.secure = Some(secure);
        self
    }

    pub fn options(&self) -> ConnectionOptions {
        self.options.clone()
    }

    pub fn posture(&self) -> Posture {
        self.posture
    }

    pub fn is_running(&self) -> bool {
        self.running.load()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    fn host(&self) -> AugmentationHost<'_> {
        AugmentationHost::MultiClientServer(self)
    }

    /// Binds and spawns the accept loop, returning the bound address.
    #[tracing::instrument(skip(self), fields(endpoint = %self.endpoint))]
    pub async fn start(self: &Arc<Self>) -> AppResult<SocketAddr> {
        self.options.validate()?;
        if self.running.swap(true) {
            return Err(AppError::IllegalStateError(
                "multi-client server already running".into(),
            ));
        }
        let listener = match bind(&self.endpoint).await {
            Ok(listener) => listener,
            Err(e) => {
                self.running.store(false);
                return Err(e);
            }
        };
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(local_addr);

        for augmentation in self.augmentations.read().clone() {
            augmentation.on_start(self.host());
        }

        let shutdown = Shutdown::new(self.notify_shutdown.subscribe());
        tokio::spawn(Self::accept_loop(Arc::downgrade(self), listener, shutdown));
        Ok(local_addr)
    }

    async fn accept_loop(server: Weak<Self>, listener: TcpListener, mut shutdown: Shutdown) {
        loop {
            let accepted = tokio::select! {
                res = accept(&listener) => res,
                _ = shutdown.recv() => {
                    debug!("accept loop received shutdown signal");
                    break;
                }
            };
            let Some(server) = server.upgrade() else {
                break;
            };
            match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(async move {
                        if let Err(e) = server.on_accept(stream, peer).await {
                            warn!("failed to set up client from {}: {}", peer, e);
                        }
                    });
                }
                // a listener closing under a deliberate stop is expected
                Err(_) if !server.is_running() => break,
                Err(e) => {
                    error!("accept loop exits: {}", e);
                    break;
                }
            }
        }
        debug!("accept loop exited");
    }

    async fn on_accept(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) -> AppResult<ClientId> {
        let (transport, kind) = upgrade(self.secure.as_ref(), stream).await?;
        let connection = Arc::new(
            Connection::new(transport, self.options.clone())
                .with_posture(self.posture)
                .with_kind(kind)
                .with_peer_addr(peer),
        );
        let client_id = new_client_id();

        let weak = Arc::downgrade(self);
        let connected_id = client_id.clone();
        // fired by `start` before the read loop runs, so the connected event
        // precedes every data event of the client
        connection.subscribe_connected(move |connection| {
            if let Some(server) = weak.upgrade() {
                server.on_connect(&connected_id, connection);
            }
        });
        let weak = Arc::downgrade(self);
        let disconnected_id = client_id.clone();
        connection.subscribe_disconnected(move |_| {
            if let Some(server) = weak.upgrade() {
                server.on_disconnect(&disconnected_id);
            }
        });

        {
            let _guard = self.propagation.lock();
            if !self.is_running() {
                return Err(AppError::IllegalStateError(format!(
                    "server stopped while client from {} was being set up",
                    peer
                )));
            }
            for augmentation in self.augmentations.read().iter() {
                connection.install_augmentation(augmentation.clone());
            }
            for callback in self.chunk_subscribers.read().iter() {
                Self::attach_chunk(&client_id, &connection, callback.clone());
            }
            for callback in self.line_subscribers.read().iter() {
                Self::attach_line(&client_id, &connection, callback.clone());
            }
            self.registry
                .register(ClientRecord::new(client_id.clone(), connection.clone()));
        }

        if let Err(e) = connection.start().await {
            self.registry.remove(&client_id);
            return Err(e);
        }
        // a stop that ran between registration and start found the
        // connection offline and skipped it
        if !self.is_running() {
            connection.force_stop().await;
            return Err(AppError::IllegalStateError(format!(
                "server stopped while client {} was starting",
                client_id
            )));
        }
        Ok(client_id)
    }

    fn on_connect(&self, client_id: &ClientId, connection: &Connection) {
        info!(
            "client {} connected from {:?} ({} online)",
            client_id,
            connection.peer_addr(),
            self.registry.len()
        );
        let callbacks = self.client_connected.read().clone();
        for callback in callbacks {
            callback(client_id);
        }
    }

    fn on_disconnect(&self, client_id: &ClientId) {
        if self.registry.remove(client_id).is_none() {
            return;
        }
        info!("client {} disconnected", client_id);
        let callbacks = self.client_disconnected.read().clone();
        for callback in callbacks {
            callback(client_id);
        }
    }

    fn attach_chunk(client_id: &ClientId, connection: &Arc<Connection>, callback: ClientChunkCallback) {
        let client_id = client_id.clone();
        connection.subscribe_chunk(move |chunk| callback(&client_id, chunk));
    }

    fn attach_line(client_id: &ClientId, connection: &Arc<Connection>, callback: ClientLineCallback) {
        let client_id = client_id.clone();
        connection.subscribe_line(move |line| callback(&client_id, line));
    }

    fn resolve(&self, client_id: &ClientId) -> Option<Arc<Connection>> {
        self.registry.get(client_id)
    }

    fn unknown(client_id: &ClientId) -> AppError {
        AppError::UnknownClient(client_id.to_string())
    }

    pub fn list_clients(&self) -> Vec<ClientId> {
        self.registry.list()
    }

    pub fn client(&self, client_id: &ClientId) -> Option<Arc<Connection>> {
        self.resolve(client_id)
    }

    pub fn client_record(&self, client_id: &ClientId) -> Option<ClientRecord> {
        self.registry.record(client_id)
    }

    /// Number of clients that have connected and since left.
    pub fn retired_clients(&self) -> u64 {
        self.registry.retired()
    }

    pub async fn direct_read(&self, client_id: &ClientId, max_bytes: usize) -> AppResult<Bytes> {
        match self.resolve(client_id) {
            Some(connection) => connection.direct_read(max_bytes).await,
            None => self.posture.degrade(Self::unknown(client_id)),
        }
    }

    pub async fn read_line(&self, client_id: &ClientId) -> AppResult<String> {
        match self.resolve(client_id) {
            Some(connection) => connection.read_line().await,
            None => self.posture.degrade(Self::unknown(client_id)),
        }
    }

    pub async fn direct_write(&self, client_id: &ClientId, data: &[u8]) -> AppResult<()> {
        match self.resolve(client_id) {
            Some(connection) => connection.direct_write(data).await,
            None => self.posture.degrade(Self::unknown(client_id)),
        }
    }

    pub async fn write_line(&self, client_id: &ClientId, line: &str) -> AppResult<()> {
        match self.resolve(client_id) {
            Some(connection) => connection.write_line(line).await,
            None => self.posture.degrade(Self::unknown(client_id)),
        }
    }

    pub async fn graceful_stop_client(&self, client_id: &ClientId) -> AppResult<()> {
        match self.resolve(client_id) {
            Some(connection) => {
                connection.graceful_stop().await;
                Ok(())
            }
            None => self.posture.degrade(Self::unknown(client_id)),
        }
    }

    pub async fn force_stop_client(&self, client_id: &ClientId) -> AppResult<()> {
        match self.resolve(client_id) {
            Some(connection) => {
                connection.force_stop().await;
                Ok(())
            }
            None => self.posture.degrade(Self::unknown(client_id)),
        }
    }

    /// Chunk events of one client only.
    pub fn subscribe_client_chunk<F>(&self, client_id: &ClientId, callback: F) -> AppResult<()>
    where
        F: Fn(&Bytes) -> AppResult<()> + Send + Sync + 'static,
    {
        match self.resolve(client_id) {
            Some(connection) => {
                connection.subscribe_chunk(callback);
                Ok(())
            }
            None => self.posture.degrade(Self::unknown(client_id)),
        }
    }

    /// Line events of one client only.
    pub fn subscribe_client_line<F>(&self, client_id: &ClientId, callback: F) -> AppResult<()>
    where
        F: Fn(&str) -> AppResult<()> + Send + Sync + 'static,
    {
        match self.resolve(client_id) {
            Some(connection) => {
                connection.subscribe_line(callback);
                Ok(())
            }
            None => self.posture.degrade(Self::unknown(client_id)),
        }
    }

    /// Chunk events of every current and future client.
    pub fn subscribe_chunk<F>(&self, callback: F)
    where
        F: Fn(&ClientId, &Bytes) -> AppResult<()> + Send + Sync + 'static,
    {
        let callback: ClientChunkCallback = Arc::new(callback);
        let _guard = self.propagation.lock();
        self.chunk_subscribers.write().push(callback.clone());
        for record in self.registry.records() {
            Self::attach_chunk(&record.client_id, &record.connection, callback.clone());
        }
    }

    /// Line events of every current and future client.
    pub fn subscribe_line<F>(&self, callback: F)
    where
        F: Fn(&ClientId, &str) -> AppResult<()> + Send + Sync + 'static,
    {
        let callback: ClientLineCallback = Arc::new(callback);
        let _guard = self.propagation.lock();
        self.line_subscribers.write().push(callback.clone());
        for record in self.registry.records() {
            Self::attach_line(&record.client_id, &record.connection, callback.clone());
        }
    }

    pub fn subscribe_client_connected<F>(&self, callback: F)
    where
        F: Fn(&ClientId) + Send + Sync + 'static,
    {
        self.client_connected.write().push(Arc::new(callback));
    }

    pub fn subscribe_client_disconnected<F>(&self, callback: F)
    where
        F: Fn(&ClientId) + Send + Sync + 'static,
    {
        self.client_disconnected.write().push(Arc::new(callback));
    }

    /// Installs on the server, every current client and every future client.
    pub fn install_augmentation(&self, augmentation: Arc<dyn Augmentation>) -> bool {
        let _guard = self.propagation.lock();
        {
            let mut augmentations = self.augmentations.write();
            if augmentations
                .iter()
                .any(|a| std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(&augmentation)))
            {
                return false;
            }
            augmentations.push(augmentation.clone());
        }
        augmentation.on_installed(self.host());
        for record in self.registry.records() {
            record.connection.install_augmentation(augmentation.clone());
        }
        true
    }

    pub fn uninstall_augmentation(&self, augmentation: &Arc<dyn Augmentation>) -> bool {
        let _guard = self.propagation.lock();
        let removed = {
            let mut augmentations = self.augmentations.write();
            let before = augmentations.len();
            augmentations.retain(|a| !std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(augmentation)));
            before != augmentations.len()
        };
        if !removed {
            return false;
        }
        for record in self.registry.records() {
            record.connection.uninstall_augmentation(augmentation);
        }
        augmentation.on_uninstalled(self.host());
        true
    }

    /// Leaves the accept loop, then gracefully stops every client.
    pub async fn graceful_stop(&self) {
        let was_running = {
            let _guard = self.propagation.lock();
            self.running.swap(false)
        };
        if !was_running {
            return;
        }
        let _ = self.notify_shutdown.send(());
        for record in self.registry.records() {
            record.connection.graceful_stop().await;
        }
        for augmentation in self.augmentations.read().clone() {
            augmentation.on_stop(self.host());
        }
        info!("multi-client server stopped");
    }

    pub async fn force_stop(&self) {
        let was_running = {
            let _guard = self.propagation.lock();
            self.running.swap(false)
        };
        if !was_running {
            return;
        }
        let _ = self.notify_shutdown.send(());
        for record in self.registry.records() {
            record.connection.force_stop().await;
        }
        for augmentation in self.augmentations.read().clone() {
            augmentation.on_stop(self.host());
        }
        info!("multi-client server force stopped");
    }
}

impl Drop for MultiClientServer {
    fn drop(&mut self) {
        debug!("multi-client server dropped");
    }
}

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
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use crossbeam::atomic::AtomicCell;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{debug, trace};

use crate::service::Shutdown;
use crate::{AppError, AppResult, ConnectionOptions, Posture};

use super::augmentation::{Augmentation, AugmentationChain, AugmentationHost};
use super::encoding::{TextDecoder, TextEncoding};
use super::read_engine::{ReadMode, ReadState};
use super::transport::{BoxedTransport, TransportKind};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Longest a graceful stop waits for buffered outbound data to drain.
pub const GRACEFUL_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

pub type ChunkCallback = Arc<dyn Fn(&Bytes) -> AppResult<()> + Send + Sync>;
pub type LineCallback = Arc<dyn Fn(&str) -> AppResult<()> + Send + Sync>;
pub type LifecycleCallback = Arc<dyn Fn(&Connection) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Offline,
    Online,
    Closing,
    Closed,
}

/// Ordered subscriber lists, one per event kind.
///
/// Dispatch clones the list first so callbacks may subscribe further without
/// deadlocking.
#[derive(Default)]
pub(super) struct Subscribers {
    chunk: RwLock<Vec<ChunkCallback>>,
    line: RwLock<Vec<LineCallback>>,
    connected: RwLock<Vec<LifecycleCallback>>,
    disconnected: RwLock<Vec<LifecycleCallback>>,
}

impl Subscribers {
    pub(super) fn dispatch_chunk(&self, chunk: &Bytes) -> AppResult<()> {
        let callbacks = self.chunk.read().clone();
        for callback in callbacks {
            callback(chunk)?;
        }
        Ok(())
    }

    pub(super) fn dispatch_line(&self, line: &str) -> AppResult<()> {
        let callbacks = self.line.read().clone();
        for callback in callbacks {
            callback(line)?;
        }
        Ok(())
    }

    fn dispatch_lifecycle(list: &RwLock<Vec<LifecycleCallback>>, connection: &Connection) {
        let callbacks = list.read().clone();
        for callback in callbacks {
            callback(connection);
        }
    }
}

/// Pending text for [`Connection::read_line`].
#[derive(Debug, Default)]
struct LineReader {
    buffer: String,
    decoder: Option<TextDecoder>,
}

impl LineReader {
    fn push(&mut self, chunk: &[u8], encoding: TextEncoding) {
        if self.decoder.as_ref().map(TextDecoder::encoding) != Some(encoding) {
            self.decoder = Some(encoding.decoder());
        }
        let decoder = self.decoder.get_or_insert_with(|| encoding.decoder());
        let text = decoder.decode(chunk);
        self.buffer.push_str(&text);
    }

    fn take_line(&mut self, terminator: &str) -> Option<String> {
        let end = self.buffer.find(terminator)?;
        let line = self.buffer[..end].to_string();
        self.buffer.drain(..end + terminator.len());
        Some(line)
    }
}

/// One live byte-stream endpoint.
///
/// The transport is split into a read half, guarded so that at most one
/// physical read is ever outstanding, and a buffered write half. All sends
/// and receives pass through the connection's [`AugmentationChain`].
pub struct Connection {
    id: u64,
    kind: AtomicCell<TransportKind>,
    posture: Posture,
    options: RwLock<ConnectionOptions>,
    state: AtomicCell<ConnectionState>,
    peer_addr: Mutex<Option<SocketAddr>>,
    /// transport attached but not yet started
    pending_transport: Mutex<Option<BoxedTransport>>,
    reader: tokio::sync::Mutex<Option<ReadHalf<BoxedTransport>>>,
    writer: tokio::sync::Mutex<Option<BufWriter<WriteHalf<BoxedTransport>>>>,
    line_reader: tokio::sync::Mutex<LineReader>,
    notify_stop: broadcast::Sender<()>,
    reads_issued: AtomicU64,
    chain: AugmentationChain,
    pub(super) read_state: Mutex<ReadState>,
    pub(super) subscribers: Subscribers,
}

impl Connection {
    /// Creates an offline connection owning `transport`.
    pub fn new(transport: BoxedTransport, options: ConnectionOptions) -> Connection {
        let connection = Connection::detached(options);
        *connection.pending_transport.lock() = Some(transport);
        connection
    }

    /// Creates an offline connection with no transport yet, see [`Connection::attach`].
    pub fn detached(options: ConnectionOptions) -> Connection {
        let (notify_stop, _) = broadcast::channel(1);
        Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            kind: AtomicCell::new(TransportKind::Plain),
            posture: Posture::Strict,
            options: RwLock::new(options),
            state: AtomicCell::new(ConnectionState::Offline),
            peer_addr: Mutex::new(None),
            pending_transport: Mutex::new(None),
            reader: tokio::sync::Mutex::new(None),
            writer: tokio::sync::Mutex::new(None),
            line_reader: tokio::sync::Mutex::new(LineReader::default()),
            notify_stop,
            reads_issued: AtomicU64::new(0),
            chain: AugmentationChain::new(),
            read_state: Mutex::new(ReadState::default()),
            subscribers: Subscribers::default(),
        }
    }

    pub fn with_posture(mut self, posture: Posture) -> Self {
        self.posture = posture;
        self
    }

    pub fn with_kind(self, kind: TransportKind) -> Self {
        self.kind.store(kind);
        self
    }

    pub fn with_peer_addr(self, peer_addr: SocketAddr) -> Self {
        *self.peer_addr.lock() = Some(peer_addr);
        self
    }

    /// Hands a transport to a connection that has not been started yet.
    pub fn attach(
        &self,
        transport: BoxedTransport,
        kind: TransportKind,
        peer_addr: Option<SocketAddr>,
    ) -> AppResult<()> {
        if self.state.load() != ConnectionState::Offline {
            return Err(AppError::IllegalStateError(format!(
                "connection {} can not take a transport in state {:?}",
                self.id,
                self.state.load()
            )));
        }
        let mut pending = self.pending_transport.lock();
        if pending.is_some() {
            return Err(AppError::IllegalStateError(format!(
                "connection {} already owns a transport",
                self.id
            )));
        }
        *pending = Some(transport);
        self.kind.store(kind);
        *self.peer_addr.lock() = peer_addr;
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind.load()
    }

    pub fn posture(&self) -> Posture {
        self.posture
    }

    pub fn state(&self) -> ConnectionState {
        self.state.load()
    }

    pub fn is_online(&self) -> bool {
        self.state.load() == ConnectionState::Online
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer_addr.lock()
    }

    pub fn options(&self) -> ConnectionOptions {
        self.options.read().clone()
    }

    pub fn set_options(&self, options: ConnectionOptions) -> AppResult<()> {
        options.validate()?;
        *self.options.write() = options;
        Ok(())
    }

    /// Number of physical reads issued so far, by the read loop and direct reads.
    pub fn reads_issued(&self) -> u64 {
        self.reads_issued.load(Ordering::Acquire)
    }

    pub fn augmentations(&self) -> &AugmentationChain {
        &self.chain
    }

    fn host(&self) -> AugmentationHost<'_> {
        AugmentationHost::Connection(self)
    }

    fn offline_error(&self) -> AppError {
        AppError::IllegalStateError(format!(
            "connection {} is {:?}",
            self.id,
            self.state.load()
        ))
    }

    /// Brings the connection online.
    ///
    /// Fires `on_start` on every installed augmentation, then the connected
    /// event, then starts the read loop if a read mode was enabled while the
    /// connection was offline. Starting an online connection is a no-op.
    pub async fn start(self: &Arc<Self>) -> AppResult<()> {
        match self.state.load() {
            ConnectionState::Online => return Ok(()),
            ConnectionState::Closing | ConnectionState::Closed => {
                return Err(self.offline_error());
            }
            ConnectionState::Offline => {}
        }
        let transport = self.pending_transport.lock().take().ok_or_else(|| {
            AppError::IllegalStateError(format!("connection {} has no transport", self.id))
        })?;
        let (reader, writer) = tokio::io::split(transport);
        *self.reader.lock().await = Some(reader);
        *self.writer.lock().await = Some(BufWriter::new(writer));

        if self
            .state
            .compare_exchange(ConnectionState::Offline, ConnectionState::Online)
            .is_err()
        {
            return Err(self.offline_error());
        }
        debug!(
            "connection {} online, peer: {:?}, kind: {:?}",
            self.id,
            self.peer_addr(),
            self.kind()
        );

        self.chain.notify_start(self.host());
        Subscribers::dispatch_lifecycle(&self.subscribers.connected, self);
        self.arm_read_loop();
        Ok(())
    }

    /// Issues exactly one read of at most `max_bytes`.
    ///
    /// Aborts with a transport error when the connection is stopped while
    /// the read is pending. An empty result means the peer closed.
    pub(super) async fn physical_read(&self, max_bytes: usize) -> AppResult<Bytes> {
        let mut shutdown = Shutdown::new(self.notify_stop.subscribe());
        if !self.is_online() {
            return Err(self.offline_error());
        }
        let read = async {
            let mut guard = self.reader.lock().await;
            let reader = guard.as_mut().ok_or_else(|| self.offline_error())?;
            self.reads_issued.fetch_add(1, Ordering::AcqRel);
            let mut buf = BytesMut::zeroed(max_bytes.max(1));
            let n = reader.read(&mut buf[..]).await?;
            buf.truncate(n);
            trace!("connection {} read {} bytes", self.id, n);
            Ok::<_, AppError>(buf.freeze())
        };
        tokio::select! {
            res = read => res,
            _ = shutdown.recv() => Err(AppError::DetailedIoError(format!(
                "connection {} stopped while reading",
                self.id
            ))),
        }
    }

    async fn write_raw(&self, data: &[u8]) -> AppResult<()> {
        let mut shutdown = Shutdown::new(self.notify_stop.subscribe());
        if !self.is_online() {
            return Err(self.offline_error());
        }
        let write = async {
            let mut guard = self.writer.lock().await;
            let writer = guard.as_mut().ok_or_else(|| self.offline_error())?;
            writer.write_all(data).await.map_err(|e| {
                AppError::DetailedIoError(format!("write to connection {}: {}", self.id, e))
            })?;
            writer.flush().await.map_err(|e| {
                AppError::DetailedIoError(format!("flush connection {}: {}", self.id, e))
            })?;
            trace!("connection {} wrote {} bytes", self.id, data.len());
            Ok::<_, AppError>(())
        };
        tokio::select! {
            res = write => res,
            _ = shutdown.recv() => Err(AppError::DetailedIoError(format!(
                "connection {} stopped while writing",
                self.id
            ))),
        }
    }

    /// Reads one chunk of at most `max_bytes`, passed through the inbound chain.
    ///
    /// A closed peer force-stops the connection and yields
    /// [`AppError::ConnectionClosed`].
    pub async fn direct_read(&self, max_bytes: usize) -> AppResult<Bytes> {
        if !self.is_online() {
            return self.posture.degrade(self.offline_error());
        }
        let chunk = self.physical_read(max_bytes).await?;
        if chunk.is_empty() {
            self.force_stop().await;
            return Err(AppError::ConnectionClosed(self.id));
        }
        Ok(self.chain.snapshot().receive_bytes(chunk))
    }

    /// Reads until the read line terminator, returning the line without it.
    ///
    /// Bytes received after the terminator stay buffered for the next call.
    pub async fn read_line(&self) -> AppResult<String> {
        if !self.is_online() {
            return self.posture.degrade(self.offline_error());
        }
        let mut line_reader = self.line_reader.lock().await;
        loop {
            let options = self.options();
            if let Some(line) = line_reader.take_line(&options.read_line_terminator) {
                return Ok(self
                    .chain
                    .snapshot()
                    .receive_line(line, options.receive_encoding));
            }
            let chunk = self.physical_read(options.max_chunk_size).await?;
            if chunk.is_empty() {
                drop(line_reader);
                self.force_stop().await;
                return Err(AppError::ConnectionClosed(self.id));
            }
            let chunk = self.chain.snapshot().receive_bytes(chunk);
            line_reader.push(&chunk, options.receive_encoding);
        }
    }

    pub fn spawn_direct_read(self: &Arc<Self>, max_bytes: usize) -> JoinHandle<AppResult<Bytes>> {
        let connection = self.clone();
        tokio::spawn(async move { connection.direct_read(max_bytes).await })
    }

    pub fn spawn_read_line(self: &Arc<Self>) -> JoinHandle<AppResult<String>> {
        let connection = self.clone();
        tokio::spawn(async move { connection.read_line().await })
    }

    /// Sends `data` through the outbound byte hooks and flushes it.
    pub async fn direct_write(&self, data: &[u8]) -> AppResult<()> {
        if !self.is_online() {
            return self.posture.degrade(self.offline_error());
        }
        let chain = self.chain.snapshot();
        let data = chain.before_send_bytes(Bytes::copy_from_slice(data));
        self.write_raw(&data).await?;
        chain.after_send_bytes(&data);
        Ok(())
    }

    pub async fn direct_write_range(
        &self,
        data: &[u8],
        offset: usize,
        length: usize,
    ) -> AppResult<()> {
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| {
                AppError::InvalidValue(format!(
                    "range {}+{} exceeds buffer of {} bytes",
                    offset,
                    length,
                    data.len()
                ))
            })?;
        self.direct_write(&data[offset..end]).await
    }

    /// Sends `line` through the outbound line hooks, followed by the write
    /// line terminator.
    pub async fn write_line(&self, line: &str) -> AppResult<()> {
        if !self.is_online() {
            return self.posture.degrade(self.offline_error());
        }
        let options = self.options();
        let encoding = options.send_encoding;
        let chain = self.chain.snapshot();
        let line = chain.before_send_line(line.to_string(), encoding);
        let mut payload = String::with_capacity(line.len() + options.write_line_terminator.len());
        payload.push_str(&line);
        payload.push_str(&options.write_line_terminator);
        self.write_raw(&encoding.encode(&payload)).await?;
        chain.after_send_line(&line, encoding);
        Ok(())
    }

    /// Stops writes, flushes and shuts the write side down, then closes.
    ///
    /// Writes still in flight are aborted first. The flush of what is already
    /// buffered is bounded by [`GRACEFUL_FLUSH_TIMEOUT`], so a peer that
    /// stopped reading can not hold the stop up.
    pub async fn graceful_stop(&self) {
        if self
            .state
            .compare_exchange(ConnectionState::Online, ConnectionState::Closing)
            .is_err()
        {
            return;
        }
        let _ = self.notify_stop.send(());
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let flushed = time::timeout(GRACEFUL_FLUSH_TIMEOUT, async {
                writer.flush().await?;
                writer.shutdown().await?;
                Ok::<_, std::io::Error>(())
            })
            .await;
            match flushed {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("connection {} flush on stop failed: {}", self.id, e),
                Err(_) => debug!(
                    "connection {} flush on stop timed out after {:?}",
                    self.id, GRACEFUL_FLUSH_TIMEOUT
                ),
            }
        }
        self.reader.lock().await.take();
        self.finish_stop("graceful");
    }

    /// Closes immediately, dropping unflushed outbound data.
    ///
    /// Also completes a graceful stop that is still flushing.
    pub async fn force_stop(&self) {
        match self
            .state
            .compare_exchange(ConnectionState::Online, ConnectionState::Closing)
        {
            Ok(_) => {}
            Err(ConnectionState::Closing) => {
                debug!("connection {} force stop takes over a closing stop", self.id)
            }
            Err(_) => return,
        }
        let _ = self.notify_stop.send(());
        self.writer.lock().await.take();
        self.reader.lock().await.take();
        self.finish_stop("forced");
    }

    /// Runs the stop notifications once, whichever stop gets here first.
    fn finish_stop(&self, how: &str) {
        if self
            .state
            .compare_exchange(ConnectionState::Closing, ConnectionState::Closed)
            .is_err()
        {
            return;
        }
        debug!("connection {} stopped ({})", self.id, how);
        self.chain.notify_stop(self.host());
        Subscribers::dispatch_lifecycle(&self.subscribers.disconnected, self);
    }

    pub fn install_augmentation(&self, augmentation: Arc<dyn Augmentation>) -> bool {
        self.chain.install(augmentation, self.host())
    }

    pub fn uninstall_augmentation(&self, augmentation: &Arc<dyn Augmentation>) -> bool {
        self.chain.uninstall(augmentation, self.host())
    }

    /// Subscribes to raw chunks, starting or upgrading the read loop.
    pub fn subscribe_chunk<F>(self: &Arc<Self>, callback: F)
    where
        F: Fn(&Bytes) -> AppResult<()> + Send + Sync + 'static,
    {
        self.subscribers.chunk.write().push(Arc::new(callback));
        self.enable_read_mode(ReadMode::RawChunk);
    }

    /// Subscribes to lines, starting or upgrading the read loop.
    pub fn subscribe_line<F>(self: &Arc<Self>, callback: F)
    where
        F: Fn(&str) -> AppResult<()> + Send + Sync + 'static,
    {
        self.subscribers.line.write().push(Arc::new(callback));
        self.enable_read_mode(ReadMode::Line);
    }

    pub fn subscribe_connected<F>(&self, callback: F)
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.subscribers.connected.write().push(Arc::new(callback));
    }

    pub fn subscribe_disconnected<F>(&self, callback: F)
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.subscribers.disconnected.write().push(Arc::new(callback));
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("state", &self.state())
            .field("peer_addr", &self.peer_addr())
            .field("augmentations", &self.chain)
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        trace!("connection {} dropped", self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use rstest::{fixture, rstest};
    use tokio::io::DuplexStream;

    use super::*;
    use crate::service::setup_local_tracing;

    #[fixture]
    #[once]
    fn setup() {
        let _ = setup_local_tracing();
    }

    async fn online_pair(options: ConnectionOptions) -> (Arc<Connection>, DuplexStream) {
        let (local, remote) = tokio::io::duplex(4096);
        let connection = Arc::new(Connection::new(Box::new(local), options));
        connection.start().await.unwrap();
        (connection, remote)
    }

    #[rstest]
    #[tokio::test]
    async fn test_direct_read_and_write(_setup: ()) -> AppResult<()> {
        let (connection, mut remote) = online_pair(ConnectionOptions::single_client()).await;

        connection.direct_write(b"ping").await?;
        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"ping");

        remote.write_all(b"pong").await?;
        let chunk = connection.direct_read(16).await?;
        assert_eq!(&chunk[..], b"pong");

        connection.direct_write_range(b"0123456789", 2, 3).await?;
        let mut buf = [0u8; 3];
        remote.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"234");
        assert!(connection.direct_write_range(b"01", 1, 5).await.is_err());
        Ok(())
    }

    #[rstest]
    #[tokio::test]
    async fn test_read_line_keeps_remainder(_setup: ()) -> AppResult<()> {
        let options = ConnectionOptions::single_client().with_line_terminator("\r\n");
        let (connection, mut remote) = online_pair(options).await;

        remote.write_all(b"first\r\nsec").await?;
        assert_eq!(connection.read_line().await?, "first");
        remote.write_all(b"ond\r\n").await?;
        assert_eq!(connection.read_line().await?, "second");

        connection.write_line("reply").await?;
        let mut buf = [0u8; 7];
        remote.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"reply\r\n");
        Ok(())
    }

    #[rstest]
    #[tokio::test]
    async fn test_offline_calls_follow_posture(_setup: ()) {
        let (local, _remote) = tokio::io::duplex(64);
        let strict = Connection::new(Box::new(local), ConnectionOptions::single_client());
        let err = strict.direct_read(8).await.unwrap_err();
        assert!(matches!(err, AppError::IllegalStateError(_)));
        assert!(strict.direct_write(b"x").await.is_err());

        let (local, _remote) = tokio::io::duplex(64);
        let lenient = Connection::new(Box::new(local), ConnectionOptions::single_client())
            .with_posture(Posture::Lenient);
        assert!(lenient.direct_read(8).await.unwrap().is_empty());
        assert_eq!(lenient.read_line().await.unwrap(), "");
        assert!(lenient.direct_write(b"x").await.is_ok());
        assert!(lenient.write_line("x").await.is_ok());
    }

    #[rstest]
    #[tokio::test]
    async fn test_stop_is_idempotent(_setup: ()) {
        let (connection, _remote) = online_pair(ConnectionOptions::single_client()).await;
        let disconnects = Arc::new(AtomicUsize::new(0));
        let counter = disconnects.clone();
        connection.subscribe_disconnected(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        connection.graceful_stop().await;
        connection.graceful_stop().await;
        connection.force_stop().await;

        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert!(connection.direct_write(b"late").await.is_err());
        assert!(connection.start().await.is_err());
    }

    #[rstest]
    #[tokio::test]
    async fn test_graceful_stop_shuts_down_write_side(_setup: ()) -> AppResult<()> {
        let (connection, mut remote) = online_pair(ConnectionOptions::single_client()).await;
        connection.direct_write(b"bye").await?;
        connection.graceful_stop().await;

        let mut received = Vec::new();
        remote.read_to_end(&mut received).await?;
        assert_eq!(received, b"bye");
        Ok(())
    }

    #[rstest]
    #[tokio::test]
    async fn test_stop_aborts_pending_read(_setup: ()) {
        let (connection, _remote) = online_pair(ConnectionOptions::single_client()).await;
        let pending = connection.spawn_direct_read(16);
        while connection.reads_issued() == 0 {
            tokio::task::yield_now().await;
        }
        connection.force_stop().await;
        let result = pending.await.unwrap();
        assert!(result.is_err());
    }

    fn count_disconnects(connection: &Connection) -> Arc<AtomicUsize> {
        let disconnects = Arc::new(AtomicUsize::new(0));
        let counter = disconnects.clone();
        connection.subscribe_disconnected(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        disconnects
    }

    fn spawn_blocked_write(connection: &Arc<Connection>) -> JoinHandle<AppResult<()>> {
        let connection = connection.clone();
        // far more than the 16 byte pipe holds, with nobody reading the far end
        tokio::spawn(async move { connection.direct_write(&[b'x'; 4096]).await })
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_graceful_stop_with_blocked_write(_setup: ()) {
        let (local, _remote) = tokio::io::duplex(16);
        let connection = Arc::new(Connection::new(
            Box::new(local),
            ConnectionOptions::single_client(),
        ));
        connection.start().await.unwrap();
        let disconnects = count_disconnects(&connection);

        let writing = spawn_blocked_write(&connection);
        time::sleep(Duration::from_millis(50)).await;
        assert!(!writing.is_finished());

        let stopped = time::timeout(
            GRACEFUL_FLUSH_TIMEOUT * 4,
            connection.graceful_stop(),
        )
        .await;
        assert!(stopped.is_ok());
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert!(writing.await.unwrap().is_err());
    }

    #[rstest]
    #[tokio::test]
    async fn test_force_stop_with_blocked_write(_setup: ()) {
        let (local, _remote) = tokio::io::duplex(16);
        let connection = Arc::new(Connection::new(
            Box::new(local),
            ConnectionOptions::single_client(),
        ));
        connection.start().await.unwrap();
        let disconnects = count_disconnects(&connection);

        let writing = spawn_blocked_write(&connection);
        time::sleep(Duration::from_millis(50)).await;
        connection.force_stop().await;

        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        let written = time::timeout(Duration::from_secs(5), writing).await.unwrap();
        assert!(written.unwrap().is_err());
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_force_stop_completes_closing_connection(_setup: ()) {
        let (local, _remote) = tokio::io::duplex(16);
        let connection = Arc::new(Connection::new(
            Box::new(local),
            ConnectionOptions::single_client(),
        ));
        connection.start().await.unwrap();
        let disconnects = count_disconnects(&connection);
        let writing = spawn_blocked_write(&connection);
        time::sleep(Duration::from_millis(50)).await;

        let graceful = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.graceful_stop().await })
        };
        while connection.state() == ConnectionState::Online {
            tokio::task::yield_now().await;
        }
        connection.force_stop().await;
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);

        graceful.await.unwrap();
        assert!(writing.await.unwrap().is_err());
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn test_spawned_reads(_setup: ()) -> AppResult<()> {
        let (connection, mut remote) = online_pair(ConnectionOptions::single_client()).await;

        let line = connection.spawn_read_line();
        remote.write_all(b"spawned\n").await?;
        assert_eq!(line.await.unwrap()?, "spawned");

        let chunk = connection.spawn_direct_read(8);
        remote.write_all(b"raw").await?;
        assert_eq!(&chunk.await.unwrap()?[..], b"raw");
        Ok(())
    }

    #[rstest]
    #[tokio::test]
    async fn test_peer_close_force_stops(_setup: ()) {
        let (connection, remote) = online_pair(ConnectionOptions::single_client()).await;
        drop(remote);
        let err = connection.direct_read(16).await.unwrap_err();
        assert!(matches!(err, AppError::ConnectionClosed(_)));
        assert_eq!(connection.state(), ConnectionState::Closed);
    }
}

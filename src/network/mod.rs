//! Network Module Implementation
//!
//! This module provides the connection I/O engine: the uniform read/write
//! abstraction over a byte-stream transport, the augmentation chain wrapped
//! around every send and receive, the continuous read loop, the
//! length-prefixed message framing and the client registry used by
//! multi-client servers.
//!
//! # Components
//!
//! - `Connection`: owns one plain or secure transport
//! - `AugmentationChain`: ordered interceptors around every send/receive
//! - read engine: raw chunk and line events from one stream
//! - `FrameAssembler` / `MessageChannel`: length-prefixed messages
//! - `ConnectionRegistry`: client id to connection map

pub use augmentation::{Augmentation, AugmentationChain, AugmentationHost, ChainSnapshot, HostKind};
pub use connection::{
    ChunkCallback, Connection, ConnectionState, LifecycleCallback, LineCallback,
    GRACEFUL_FLUSH_TIMEOUT,
};
pub use encoding::{TextDecoder, TextEncoding};
pub use frame::{
    format_message, ClientMessageCallback, FrameAssembler, MessageCallback, MessageChannel,
    ServerMessageChannel, DRAIN_CAP, HEADER_LEN, LENGTH_FIELD_WIDTH, SEPARATOR,
};
pub use read_engine::{ReadEngineState, ReadMode, ReadState};
pub use registry::{new_client_id, ClientId, ClientRecord, ConnectionRegistry};
pub use transport::{is_valid_port, BoxedTransport, Endpoint, SecureUpgrade, Transport, TransportKind};

mod augmentation;
mod connection;
mod encoding;
mod frame;
mod read_engine;
mod registry;
mod transport;

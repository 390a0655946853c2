pub mod network;
pub mod service;

pub use network::{
    format_message, Augmentation, AugmentationHost, ClientId, Connection, ConnectionState,
    Endpoint, FrameAssembler, HostKind, MessageChannel, ReadEngineState, ReadMode,
    SecureUpgrade, ServerMessageChannel, TextEncoding, TransportKind,
};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, ConnectionOptions, ErrorKind,
    MultiClientServer, NetworkConfig, Posture, Shutdown, SocketConfig, TcpClient, TcpServer,
};

pub use app_error::{AppError, AppResult, ErrorKind};
pub use client::TcpClient;
pub use config::{
    ConnectionOptions, NetworkConfig, Posture, SocketConfig, DEFAULT_MAX_MESSAGE_LEN,
    MULTI_CLIENT_CHUNK_SIZE, SINGLE_CLIENT_CHUNK_SIZE,
};
pub use server::{
    ClientCallback, ClientChunkCallback, ClientLineCallback, MultiClientServer, TcpServer,
};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing};

mod app_error;
mod client;
mod config;
mod server;
mod shutdown;
mod tracing_config;

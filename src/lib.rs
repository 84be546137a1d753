/// raklink - backend-agnostic reliable-datagram transport
///
/// Uniform client/server adapters over interchangeable reliable-datagram
/// backends (a tokio UDP backend and an in-process memory backend), with a
/// registry that picks one and falls back when the preferred backend is
/// missing. Every adapter shares the same lifecycle: idempotent connect,
/// timeout-bounded ping, non-blocking close with deferred teardown and no
/// delivery after close.

// Transport primitives
pub mod transport;

// Backends and their adapters
pub mod adapters;
pub mod backend;

// Contract
pub mod protocol;

// Core types
pub mod advertisement;
pub mod connection;
pub mod error;
pub mod event;
#[cfg(feature = "udp")]
pub mod packet;

// Re-export core types
pub use advertisement::Advertisement;
pub use connection::ConnectionHandle;
pub use error::{CloseReason, TransportError};
pub use event::{ClientEvent, ClientHandler, EventChannel, NoopHandler, ServerEvent, ServerHandler};
pub use protocol::{
    select, BackendPair, BackendRegistry, ClientAdapter, GameVersion, ReliabilityClass, ServerAdapter,
};
pub use transport::{ClientState, TransportConfig, TransportConfig as Config};

pub use adapters::{MemoryClient, MemoryServer};
#[cfg(feature = "udp")]
pub use adapters::{UdpClient, UdpServer, WorkerClient};
pub use backend::memory::MemoryNetwork;

// Convenience alias
pub type Result<T> = std::result::Result<T, TransportError>;

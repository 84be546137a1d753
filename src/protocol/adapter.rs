use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::advertisement::Advertisement;
use crate::connection::ConnectionHandle;
use crate::error::TransportError;
use crate::event::{ClientHandler, ServerHandler};
use crate::transport::connection_state::ClientState;

/// Client side of the transport contract.
///
/// Every backend behaves the same through this trait:
/// - `connect` is a no-op while connecting or connected and fails once closed
/// - `send_reliable` silently does nothing unless connected
/// - `close` never blocks; the backend is released once, 40 ms later
/// - no callback fires for data arriving after `close`
#[async_trait]
pub trait ClientAdapter: Send + Sync {
    /// Registry name of the backend
    fn backend(&self) -> &'static str;

    fn set_handler(&self, handler: Arc<dyn ClientHandler>);

    fn state(&self) -> ClientState;

    fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    /// Start the handshake. Returns once the socket is bound; success is
    /// reported through `on_connected`.
    async fn connect(&self) -> Result<(), TransportError>;

    fn send_reliable(&self, payload: Bytes, immediate: bool);

    fn close(&self);

    /// Ping the configured server, by default within 1000 ms.
    ///
    /// `Ok(Some)` carries the server's answer, `Ok(None)` means the backend
    /// reported a failure, `Err` means the deadline passed.
    async fn ping(&self, timeout: Option<Duration>) -> Result<Option<String>, TransportError>;
}

/// Server side of the transport contract
#[async_trait]
pub trait ServerAdapter: Send + Sync {
    fn backend(&self) -> &'static str;

    fn set_handler(&self, handler: Arc<dyn ServerHandler>);

    /// Bind and start accepting. Bind errors are returned here; calling
    /// again while listening does nothing.
    async fn listen(&self) -> Result<(), TransportError>;

    fn local_addr(&self) -> Option<SocketAddr>;

    /// Replace the advertisement wholesale. Connections are untouched.
    /// Fails without changing anything when the rendered advertisement does
    /// not fit in a pong.
    fn update_advertisement(&self, advertisement: Advertisement) -> Result<(), TransportError>;

    fn advertisement(&self) -> Advertisement;

    /// Live connections
    fn connections(&self) -> Vec<Arc<ConnectionHandle>>;

    fn close(&self);
}

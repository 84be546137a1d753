use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::connection::ConnectionHandle;
use crate::error::CloseReason;

/// Client-side consumer callbacks.
///
/// Called from the adapter's dispatch task; implementations must not block.
pub trait ClientHandler: Send + Sync + 'static {
    fn on_connected(&self) {}

    fn on_close_connection(&self, _reason: &CloseReason) {}

    fn on_encapsulated(&self, _buffer: Bytes, _peer: SocketAddr) {}
}

/// Server-side consumer callbacks
pub trait ServerHandler: Send + Sync + 'static {
    fn on_open_connection(&self, _connection: Arc<ConnectionHandle>) {}

    fn on_close_connection(&self, _connection: Arc<ConnectionHandle>, _reason: &CloseReason) {}

    fn on_encapsulated(&self, _buffer: Bytes, _connection: &Arc<ConnectionHandle>) {}

    /// The listening socket stopped
    fn on_close(&self, _reason: &CloseReason) {}
}

/// Handler that ignores everything; installed until the consumer sets one
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl ClientHandler for NoopHandler {}
impl ServerHandler for NoopHandler {}

/// Client callbacks as values
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Encapsulated { buffer: Bytes, peer: SocketAddr },
    Closed { reason: CloseReason },
}

/// Server callbacks as values
#[derive(Debug, Clone)]
pub enum ServerEvent {
    OpenConnection(Arc<ConnectionHandle>),
    Encapsulated { buffer: Bytes, connection: Arc<ConnectionHandle> },
    CloseConnection { connection: Arc<ConnectionHandle>, reason: CloseReason },
    Closed { reason: CloseReason },
}

impl ServerEvent {
    pub fn is_data_event(&self) -> bool {
        matches!(self, ServerEvent::Encapsulated { .. })
    }
}

/// Handler forwarding every callback into an unbounded channel
#[derive(Debug, Clone)]
pub struct EventChannel<E> {
    tx: mpsc::UnboundedSender<E>,
}

impl<E> EventChannel<E> {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<E>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: E) {
        // receiver gone means nobody is listening any more
        let _ = self.tx.send(event);
    }
}

impl ClientHandler for EventChannel<ClientEvent> {
    fn on_connected(&self) {
        self.emit(ClientEvent::Connected);
    }

    fn on_close_connection(&self, reason: &CloseReason) {
        self.emit(ClientEvent::Closed { reason: reason.clone() });
    }

    fn on_encapsulated(&self, buffer: Bytes, peer: SocketAddr) {
        self.emit(ClientEvent::Encapsulated { buffer, peer });
    }
}

impl ServerHandler for EventChannel<ServerEvent> {
    fn on_open_connection(&self, connection: Arc<ConnectionHandle>) {
        self.emit(ServerEvent::OpenConnection(connection));
    }

    fn on_close_connection(&self, connection: Arc<ConnectionHandle>, reason: &CloseReason) {
        self.emit(ServerEvent::CloseConnection { connection, reason: reason.clone() });
    }

    fn on_encapsulated(&self, buffer: Bytes, connection: &Arc<ConnectionHandle>) {
        self.emit(ServerEvent::Encapsulated { buffer, connection: connection.clone() });
    }

    fn on_close(&self, reason: &CloseReason) {
        self.emit(ServerEvent::Closed { reason: reason.clone() });
    }
}

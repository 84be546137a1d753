/// Reliable-datagram backends
///
/// Each backend runs an engine task that owns its socket and reports what
/// happens on it as [`ClientEngineEvent`]/[`ServerEngineEvent`] values. The
/// adapters in [`crate::adapters`] turn those events into handler callbacks.

pub mod memory;
#[cfg(feature = "udp")]
pub mod udp;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::advertisement::Advertisement;
use crate::connection::PeerLink;
use crate::error::CloseReason;
use crate::protocol::reliability::ReliabilityClass;

/// Events raised by a client engine
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEngineEvent {
    /// Handshake accepted
    Connect,
    Encapsulated { buffer: Bytes, address: SocketAddr },
    Disconnect { reason: CloseReason },
}

/// Events raised by a server engine
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEngineEvent {
    OpenConnection { address: SocketAddr },
    Encapsulated { address: SocketAddr, buffer: Bytes },
    CloseConnection { address: SocketAddr, reason: CloseReason },
    /// The socket stopped on its own
    Close { reason: CloseReason },
}

/// A running client-side backend instance
pub trait ClientEngine: Send + 'static {
    fn send(&self, payload: Bytes, class: ReliabilityClass);

    /// Stop the engine and free its socket
    fn shutdown(self);
}

/// A running server-side backend instance
pub trait ServerEngine: Send + 'static {
    fn local_addr(&self) -> SocketAddr;

    /// Link handed to every connection handle of this server
    fn link(&self) -> Arc<dyn PeerLink>;

    /// Stop the engine, disconnecting every peer
    fn shutdown(self);
}

/// Options shared by server engines.
///
/// The advertisement and connection limit are shared with the adapter so an
/// update is visible to the engine without a rebind.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub protocol: u8,
    pub advertisement: Arc<RwLock<Advertisement>>,
    pub max_connections: Arc<AtomicUsize>,
    /// Idle time after which a silent peer is dropped
    pub timeout: Duration,
}

impl ServerOptions {
    pub fn new(protocol: u8, advertisement: Advertisement, max_connections: usize, timeout: Duration) -> Self {
        Self {
            protocol,
            advertisement: Arc::new(RwLock::new(advertisement)),
            max_connections: Arc::new(AtomicUsize::new(max_connections)),
            timeout,
        }
    }

    /// Server guid, always the advertised server id
    pub fn guid(&self) -> u64 {
        self.advertisement.read().server_id
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections.load(Ordering::Acquire)
    }

    /// Rendered advertisement answered to pings
    pub fn advertisement_payload(&self) -> Bytes {
        Bytes::from(self.advertisement.read().to_string())
    }
}

/// Commands from connection handles to a server engine task
#[derive(Debug)]
pub enum PeerCommand {
    Send { peer: SocketAddr, payload: Bytes, class: ReliabilityClass },
    Kick { peer: SocketAddr },
}

/// [`PeerLink`] that forwards to an engine task over a channel
#[derive(Debug, Clone)]
pub struct CommandLink {
    tx: mpsc::UnboundedSender<PeerCommand>,
}

impl CommandLink {
    pub fn new(tx: mpsc::UnboundedSender<PeerCommand>) -> Self {
        Self { tx }
    }
}

impl PeerLink for CommandLink {
    fn send(&self, peer: SocketAddr, payload: Bytes, class: ReliabilityClass) {
        if self.tx.send(PeerCommand::Send { peer, payload, class }).is_err() {
            tracing::trace!("[SEND] engine stopped, dropping payload for {}", peer);
        }
    }

    fn disconnect(&self, peer: SocketAddr) {
        let _ = self.tx.send(PeerCommand::Kick { peer });
    }
}

/// Why a peer was turned away during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    IncompatibleProtocol,
    ServerFull,
}

impl Refusal {
    pub fn message(&self) -> &'static str {
        match self {
            Refusal::IncompatibleProtocol => "incompatible protocol",
            Refusal::ServerFull => "server full",
        }
    }

    pub fn reason(&self) -> CloseReason {
        CloseReason::Refused(self.message().to_string())
    }
}

/// Admission check run by server engines on every connect request
pub fn admit(options: &ServerOptions, protocol: u8, connected: usize) -> Result<(), Refusal> {
    if protocol != options.protocol {
        return Err(Refusal::IncompatibleProtocol);
    }
    if connected >= options.max_connections() {
        return Err(Refusal::ServerFull);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(max: usize) -> ServerOptions {
        ServerOptions::new(11, Advertisement::default(), max, Duration::from_secs(10))
    }

    #[test]
    fn test_admit() {
        let options = options(2);
        assert_eq!(admit(&options, 11, 0), Ok(()));
        assert_eq!(admit(&options, 11, 1), Ok(()));
        assert_eq!(admit(&options, 11, 2), Err(Refusal::ServerFull));
        assert_eq!(admit(&options, 10, 0), Err(Refusal::IncompatibleProtocol));
    }

    #[test]
    fn test_limit_update_visible() {
        let options = options(1);
        let shared = options.clone();
        shared.max_connections.store(5, Ordering::Release);
        assert_eq!(admit(&options, 11, 3), Ok(()));
    }

    #[test]
    fn test_command_link_after_engine_stop() {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = CommandLink::new(tx);
        drop(rx);
        // must not panic
        link.send("127.0.0.1:1".parse().unwrap(), Bytes::from_static(b"x"), ReliabilityClass::Immediate);
        link.disconnect("127.0.0.1:1".parse().unwrap());
    }
}

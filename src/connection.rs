use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::protocol::reliability::ReliabilityClass;

/// Server-side link from a connection handle back to its backend.
///
/// Each server backend implements this with its own native send
/// parameters; the handle only ever speaks [`ReliabilityClass`].
pub trait PeerLink: Send + Sync {
    /// Queue `payload` for `peer`
    fn send(&self, peer: SocketAddr, payload: Bytes, class: ReliabilityClass);

    /// Drop `peer`, notifying it if the backend can
    fn disconnect(&self, peer: SocketAddr);
}

/// Stable connection identifier, `host/port`
pub fn connection_id(address: &SocketAddr) -> String {
    format!("{}/{}", address.ip(), address.port())
}

/// One peer connected to a server adapter
pub struct ConnectionHandle {
    address: SocketAddr,
    id: String,
    connected: AtomicBool,
    connected_at: DateTime<Utc>,
    link: Arc<dyn PeerLink>,
}

impl ConnectionHandle {
    pub(crate) fn new(address: SocketAddr, link: Arc<dyn PeerLink>) -> Self {
        Self {
            address,
            id: connection_id(&address),
            connected: AtomicBool::new(true),
            connected_at: Utc::now(),
            link,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// `host/port` of the peer. Two connections from the same address share it.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Send to this peer. Silently dropped once the connection is closed.
    pub fn send_reliable(&self, payload: impl Into<Bytes>, immediate: bool) {
        if !self.is_connected() {
            tracing::trace!("[SEND] {} is closed, dropping payload", self.id);
            return;
        }
        self.link
            .send(self.address, payload.into(), ReliabilityClass::from_immediate(immediate));
    }

    /// Disconnect this peer from the server side
    pub fn close(&self) {
        if self.mark_closed() {
            tracing::debug!("[CLOSE] disconnecting {}", self.id);
            self.link.disconnect(self.address);
        }
    }

    /// Returns true if this call closed the handle
    pub(crate) fn mark_closed(&self) -> bool {
        self.connected.swap(false, Ordering::AcqRel)
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .field("connected_at", &self.connected_at)
            .finish()
    }
}

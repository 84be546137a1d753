/// In-process datagram backend
///
/// A [`MemoryNetwork`] is a map from socket addresses to flume inboxes.
/// Frames to an address nobody is bound to vanish like a UDP datagram to a
/// silent host. Every backend feature (handshake, refusals, ping,
/// disconnect) is modelled so adapters behave exactly as over a real socket.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{
    admit, ClientEngine, ClientEngineEvent, CommandLink, PeerCommand, ServerEngine, ServerEngineEvent,
    ServerOptions,
};
use crate::connection::PeerLink;
use crate::error::CloseReason;
use crate::protocol::reliability::{MemoryMapper, ReliabilityClass, ReliabilityMapper};

const FIRST_EPHEMERAL_PORT: u16 = 49152;

/// Binary send priority of the memory backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemoryPriority(pub u8);

impl MemoryPriority {
    pub const NORMAL: MemoryPriority = MemoryPriority(0);
    pub const HIGH: MemoryPriority = MemoryPriority(1);
}

#[derive(Debug)]
pub enum MemoryFrame {
    Hello { protocol: u8 },
    Welcome,
    Refused { reason: String },
    Payload { buffer: Bytes, priority: MemoryPriority },
    Goodbye { reason: String },
    /// Unconnected ping, answered through `reply`
    Ping { reply: oneshot::Sender<Bytes> },
}

type Datagram = (SocketAddr, MemoryFrame);

#[derive(Debug)]
struct NetworkInner {
    endpoints: RwLock<HashMap<SocketAddr, flume::Sender<Datagram>>>,
    next_port: AtomicU16,
    releases: AtomicUsize,
    payloads_sent: AtomicUsize,
}

/// Shared in-process network
#[derive(Debug, Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    /// An isolated network
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                endpoints: RwLock::new(HashMap::new()),
                next_port: AtomicU16::new(FIRST_EPHEMERAL_PORT),
                releases: AtomicUsize::new(0),
                payloads_sent: AtomicUsize::new(0),
            }),
        }
    }

    /// Process-wide network used by adapters built without an explicit one
    pub fn global() -> MemoryNetwork {
        static GLOBAL: OnceLock<MemoryNetwork> = OnceLock::new();
        GLOBAL.get_or_init(MemoryNetwork::new).clone()
    }

    /// Bind an endpoint. `None` or port 0 picks a free ephemeral port on loopback.
    pub fn bind(&self, address: Option<SocketAddr>) -> io::Result<MemoryEndpoint> {
        let requested = address.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0));
        let (tx, rx) = flume::unbounded();

        let mut endpoints = self.inner.endpoints.write();
        let local = if requested.port() == 0 {
            self.ephemeral(requested.ip(), &endpoints)?
        } else if endpoints.contains_key(&requested) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("memory address {} already bound", requested),
            ));
        } else {
            requested
        };
        endpoints.insert(local, tx);
        drop(endpoints);

        tracing::debug!("[BIND] memory endpoint {}", local);
        Ok(MemoryEndpoint {
            local,
            network: self.clone(),
            inbox: rx,
            released: AtomicBool::new(false),
        })
    }

    fn ephemeral(
        &self,
        ip: IpAddr,
        endpoints: &HashMap<SocketAddr, flume::Sender<Datagram>>,
    ) -> io::Result<SocketAddr> {
        let span = u16::MAX - FIRST_EPHEMERAL_PORT;
        for _ in 0..span {
            let port = self.inner.next_port.fetch_add(1, Ordering::Relaxed);
            if port < FIRST_EPHEMERAL_PORT {
                // wrapped around
                self.inner.next_port.store(FIRST_EPHEMERAL_PORT, Ordering::Relaxed);
                continue;
            }
            let candidate = SocketAddr::new(ip, port);
            if !endpoints.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(io::Error::new(io::ErrorKind::AddrNotAvailable, "no free memory ports"))
    }

    /// Hand a frame to whoever is bound at `to`. False when nobody is.
    pub fn deliver(&self, from: SocketAddr, to: SocketAddr, frame: MemoryFrame) -> bool {
        if matches!(frame, MemoryFrame::Payload { .. }) {
            self.inner.payloads_sent.fetch_add(1, Ordering::Relaxed);
        }
        match self.inner.endpoints.read().get(&to) {
            Some(inbox) => inbox.send((from, frame)).is_ok(),
            None => {
                tracing::trace!("[SEND] nothing bound at {}, frame lost", to);
                false
            }
        }
    }

    pub fn is_bound(&self, address: &SocketAddr) -> bool {
        self.inner.endpoints.read().contains_key(address)
    }

    /// Number of endpoints released so far
    pub fn releases(&self) -> usize {
        self.inner.releases.load(Ordering::Acquire)
    }

    /// Number of payload frames handed to the network so far
    pub fn payloads_sent(&self) -> usize {
        self.inner.payloads_sent.load(Ordering::Acquire)
    }

    fn unbind(&self, address: &SocketAddr) {
        self.inner.endpoints.write().remove(address);
        self.inner.releases.fetch_add(1, Ordering::AcqRel);
    }
}

/// One bound address on a [`MemoryNetwork`]
#[derive(Debug)]
pub struct MemoryEndpoint {
    local: SocketAddr,
    network: MemoryNetwork,
    inbox: flume::Receiver<Datagram>,
    released: AtomicBool,
}

impl MemoryEndpoint {
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn send_to(&self, to: SocketAddr, frame: MemoryFrame) -> bool {
        if self.is_released() {
            return false;
        }
        self.network.deliver(self.local, to, frame)
    }

    /// Next frame, `None` once the endpoint is released
    pub async fn recv(&self) -> Option<Datagram> {
        self.inbox.recv_async().await.ok()
    }

    /// Unbind the address. Only the first call has an effect.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            tracing::debug!("[TEARDOWN] releasing memory endpoint {}", self.local);
            self.network.unbind(&self.local);
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for MemoryEndpoint {
    fn drop(&mut self) {
        self.release();
    }
}

/// Unconnected ping.
///
/// Resolves to the server's advertisement. Never resolves if nothing is bound
/// at `remote`; callers race it against a deadline.
pub async fn ping(network: &MemoryNetwork, remote: SocketAddr) -> io::Result<Bytes> {
    let (reply, response) = oneshot::channel();
    let from = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
    if !network.deliver(from, remote, MemoryFrame::Ping { reply }) {
        std::future::pending::<()>().await;
    }
    response
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::ConnectionReset, "server went away before answering"))
}

/// Client half of the memory backend
#[derive(Debug)]
pub struct MemoryClientEngine {
    endpoint: Arc<MemoryEndpoint>,
    remote: SocketAddr,
    token: CancellationToken,
}

impl MemoryClientEngine {
    /// Bind an ephemeral endpoint and start the handshake with `remote`
    pub fn connect(
        network: &MemoryNetwork,
        remote: SocketAddr,
        protocol: u8,
        timeout: Duration,
    ) -> io::Result<(Self, mpsc::UnboundedReceiver<ClientEngineEvent>)> {
        let endpoint = Arc::new(network.bind(None)?);
        let token = CancellationToken::new();
        let (events, rx) = mpsc::unbounded_channel();

        tracing::debug!("[CONNECT] {} -> {} (protocol {})", endpoint.local_addr(), remote, protocol);
        endpoint.send_to(remote, MemoryFrame::Hello { protocol });
        tokio::spawn(run_client(endpoint.clone(), remote, timeout, token.clone(), events));

        Ok((Self { endpoint, remote, token }, rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }
}

async fn run_client(
    endpoint: Arc<MemoryEndpoint>,
    remote: SocketAddr,
    timeout: Duration,
    token: CancellationToken,
    events: mpsc::UnboundedSender<ClientEngineEvent>,
) {
    let handshake = tokio::time::sleep(timeout);
    tokio::pin!(handshake);
    let mut connected = false;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = &mut handshake, if !connected => {
                tracing::debug!("[CONNECT] no answer from {} within {:?}", remote, timeout);
                let _ = events.send(ClientEngineEvent::Disconnect { reason: CloseReason::Timeout });
                break;
            }
            datagram = endpoint.recv() => {
                let Some((from, frame)) = datagram else { break };
                if from != remote {
                    tracing::trace!("[RECV] ignoring frame from stranger {}", from);
                    continue;
                }
                match frame {
                    MemoryFrame::Welcome => {
                        if !connected {
                            connected = true;
                            let _ = events.send(ClientEngineEvent::Connect);
                        }
                    }
                    MemoryFrame::Refused { reason } => {
                        tracing::warn!("[CONNECT] {} refused the connection: {}", remote, reason);
                        let _ = events.send(ClientEngineEvent::Disconnect { reason: CloseReason::Refused(reason) });
                        break;
                    }
                    MemoryFrame::Payload { buffer, .. } => {
                        let _ = events.send(ClientEngineEvent::Encapsulated { buffer, address: remote });
                    }
                    MemoryFrame::Goodbye { reason } => {
                        let _ = events.send(ClientEngineEvent::Disconnect { reason: CloseReason::Remote(reason) });
                        break;
                    }
                    MemoryFrame::Hello { .. } | MemoryFrame::Ping { .. } => {
                        tracing::trace!("[RECV] client ignores server-side frame");
                    }
                }
            }
        }
    }
}

impl ClientEngine for MemoryClientEngine {
    fn send(&self, payload: Bytes, class: ReliabilityClass) {
        let priority = MemoryMapper::map(class);
        self.endpoint.send_to(self.remote, MemoryFrame::Payload { buffer: payload, priority });
    }

    fn shutdown(self) {
        drop(self);
    }
}

impl Drop for MemoryClientEngine {
    fn drop(&mut self) {
        self.endpoint.send_to(
            self.remote,
            MemoryFrame::Goodbye { reason: "client disconnect".to_string() },
        );
        self.token.cancel();
        self.endpoint.release();
    }
}

/// Server half of the memory backend
#[derive(Debug)]
pub struct MemoryServerEngine {
    endpoint: Arc<MemoryEndpoint>,
    commands: mpsc::UnboundedSender<PeerCommand>,
    token: CancellationToken,
}

impl MemoryServerEngine {
    pub fn bind(
        network: &MemoryNetwork,
        address: Option<SocketAddr>,
        options: ServerOptions,
    ) -> io::Result<(Self, mpsc::UnboundedReceiver<ServerEngineEvent>)> {
        let endpoint = Arc::new(network.bind(address)?);
        let token = CancellationToken::new();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (events, rx) = mpsc::unbounded_channel();

        tokio::spawn(run_server(endpoint.clone(), options, commands_rx, token.clone(), events));
        Ok((Self { endpoint, commands, token }, rx))
    }
}

async fn run_server(
    endpoint: Arc<MemoryEndpoint>,
    options: ServerOptions,
    mut commands: mpsc::UnboundedReceiver<PeerCommand>,
    token: CancellationToken,
    events: mpsc::UnboundedSender<ServerEngineEvent>,
) {
    let mut peers: HashSet<SocketAddr> = HashSet::new();

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                for peer in peers.drain() {
                    endpoint.send_to(peer, MemoryFrame::Goodbye { reason: "server closed".to_string() });
                }
                endpoint.release();
                break;
            }
            Some(command) = commands.recv() => match command {
                PeerCommand::Send { peer, payload, class } => {
                    if peers.contains(&peer) {
                        let priority = MemoryMapper::map(class);
                        endpoint.send_to(peer, MemoryFrame::Payload { buffer: payload, priority });
                    }
                }
                PeerCommand::Kick { peer } => {
                    if peers.remove(&peer) {
                        endpoint.send_to(peer, MemoryFrame::Goodbye { reason: "kicked".to_string() });
                        let _ = events.send(ServerEngineEvent::CloseConnection { address: peer, reason: CloseReason::Normal });
                    }
                }
            },
            datagram = endpoint.recv() => {
                let Some((from, frame)) = datagram else {
                    let _ = events.send(ServerEngineEvent::Close { reason: CloseReason::Normal });
                    break;
                };
                match frame {
                    MemoryFrame::Ping { reply } => {
                        let _ = reply.send(options.advertisement_payload());
                    }
                    MemoryFrame::Hello { protocol } => {
                        if peers.contains(&from) {
                            endpoint.send_to(from, MemoryFrame::Welcome);
                            continue;
                        }
                        match admit(&options, protocol, peers.len()) {
                            Ok(()) => {
                                peers.insert(from);
                                endpoint.send_to(from, MemoryFrame::Welcome);
                                let _ = events.send(ServerEngineEvent::OpenConnection { address: from });
                            }
                            Err(refusal) => {
                                tracing::warn!("[ACCEPT] refusing {}: {}", from, refusal.message());
                                endpoint.send_to(from, MemoryFrame::Refused { reason: refusal.message().to_string() });
                            }
                        }
                    }
                    MemoryFrame::Payload { buffer, .. } => {
                        if peers.contains(&from) {
                            let _ = events.send(ServerEngineEvent::Encapsulated { address: from, buffer });
                        } else {
                            tracing::trace!("[RECV] payload from unknown peer {}", from);
                        }
                    }
                    MemoryFrame::Goodbye { reason } => {
                        if peers.remove(&from) {
                            let _ = events.send(ServerEngineEvent::CloseConnection { address: from, reason: CloseReason::Remote(reason) });
                        }
                    }
                    MemoryFrame::Welcome | MemoryFrame::Refused { .. } => {
                        tracing::trace!("[RECV] server ignores client-side frame from {}", from);
                    }
                }
            }
        }
    }
}

impl ServerEngine for MemoryServerEngine {
    fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    fn link(&self) -> Arc<dyn PeerLink> {
        Arc::new(CommandLink::new(self.commands.clone()))
    }

    fn shutdown(self) {
        drop(self);
    }
}

impl Drop for MemoryServerEngine {
    fn drop(&mut self) {
        // the engine task says goodbye to its peers, then releases the endpoint
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advertisement::Advertisement;

    fn options(max: usize) -> ServerOptions {
        let ad = Advertisement::new("Memory MOTD", "level").with_server_id(77);
        ServerOptions::new(11, ad, max, Duration::from_secs(5))
    }

    #[test]
    fn test_bind_conflict_and_ephemeral() {
        let network = MemoryNetwork::new();
        let addr: SocketAddr = "127.0.0.1:19132".parse().unwrap();
        let _first = network.bind(Some(addr)).unwrap();
        let err = network.bind(Some(addr)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);

        let a = network.bind(None).unwrap();
        let b = network.bind(None).unwrap();
        assert_ne!(a.local_addr(), b.local_addr());
        assert!(a.local_addr().port() >= FIRST_EPHEMERAL_PORT);
    }

    #[test]
    fn test_release_counts_once() {
        let network = MemoryNetwork::new();
        let endpoint = network.bind(None).unwrap();
        let addr = endpoint.local_addr();

        endpoint.release();
        endpoint.release();
        drop(endpoint);

        assert!(!network.is_bound(&addr));
        assert_eq!(network.releases(), 1);
    }

    #[test]
    fn test_unbound_destination_loses_frame() {
        let network = MemoryNetwork::new();
        let endpoint = network.bind(None).unwrap();
        let nowhere: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert!(!endpoint.send_to(nowhere, MemoryFrame::Welcome));
    }

    #[tokio::test]
    async fn test_ping_returns_advertisement() {
        let network = MemoryNetwork::new();
        let (server, _events) = MemoryServerEngine::bind(&network, None, options(3)).unwrap();

        let payload = ping(&network, server.local_addr()).await.unwrap();
        let text = String::from_utf8(payload.to_vec()).unwrap();
        assert!(text.starts_with("MCPE;Memory MOTD;"));
        assert!(text.contains(";77;"));
    }

    #[tokio::test]
    async fn test_handshake_and_payloads() {
        let network = MemoryNetwork::new();
        let (server, mut server_events) = MemoryServerEngine::bind(&network, None, options(3)).unwrap();
        let (client, mut client_events) =
            MemoryClientEngine::connect(&network, server.local_addr(), 11, Duration::from_secs(1)).unwrap();

        assert_eq!(client_events.recv().await, Some(ClientEngineEvent::Connect));
        assert_eq!(
            server_events.recv().await,
            Some(ServerEngineEvent::OpenConnection { address: client.local_addr() })
        );

        client.send(Bytes::from_static(b"hello"), ReliabilityClass::Immediate);
        assert_eq!(
            server_events.recv().await,
            Some(ServerEngineEvent::Encapsulated { address: client.local_addr(), buffer: Bytes::from_static(b"hello") })
        );

        server
            .link()
            .send(client.local_addr(), Bytes::from_static(b"back"), ReliabilityClass::ReliableOrdered);
        assert_eq!(
            client_events.recv().await,
            Some(ClientEngineEvent::Encapsulated { buffer: Bytes::from_static(b"back"), address: server.local_addr() })
        );
        assert_eq!(network.payloads_sent(), 2);

        let client_addr = client.local_addr();
        client.shutdown();
        assert_eq!(
            server_events.recv().await,
            Some(ServerEngineEvent::CloseConnection {
                address: client_addr,
                reason: CloseReason::Remote("client disconnect".to_string()),
            })
        );
    }

    #[tokio::test]
    async fn test_refusals() {
        let network = MemoryNetwork::new();
        let (server, _events) = MemoryServerEngine::bind(&network, None, options(1)).unwrap();

        let (_first, mut first_events) =
            MemoryClientEngine::connect(&network, server.local_addr(), 11, Duration::from_secs(1)).unwrap();
        assert_eq!(first_events.recv().await, Some(ClientEngineEvent::Connect));

        let (_second, mut second_events) =
            MemoryClientEngine::connect(&network, server.local_addr(), 11, Duration::from_secs(1)).unwrap();
        assert_eq!(
            second_events.recv().await,
            Some(ClientEngineEvent::Disconnect { reason: CloseReason::Refused("server full".to_string()) })
        );

        let (_legacy, mut legacy_events) =
            MemoryClientEngine::connect(&network, server.local_addr(), 10, Duration::from_secs(1)).unwrap();
        assert_eq!(
            legacy_events.recv().await,
            Some(ClientEngineEvent::Disconnect { reason: CloseReason::Refused("incompatible protocol".to_string()) })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let network = MemoryNetwork::new();
        let silent = network.bind(None).unwrap();
        let started = tokio::time::Instant::now();

        let (_client, mut events) =
            MemoryClientEngine::connect(&network, silent.local_addr(), 11, Duration::from_millis(300)).unwrap();
        assert_eq!(
            events.recv().await,
            Some(ClientEngineEvent::Disconnect { reason: CloseReason::Timeout })
        );
        assert!(started.elapsed() >= Duration::from_millis(300));
    }
}

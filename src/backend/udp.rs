/// UDP backend
///
/// Tokio UDP sockets carrying [`Frame`]s. The client retries its handshake
/// until accepted or the configured timeout passes, then keeps the session
/// alive with heartbeats. Immediate sends go out at once; everything else is
/// batched and flushed every few milliseconds, behind any earlier queued data.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{
    admit, ClientEngine, ClientEngineEvent, CommandLink, PeerCommand, Refusal, ServerEngine, ServerEngineEvent,
    ServerOptions,
};
use crate::connection::PeerLink;
use crate::error::{CloseReason, TransportError};
use crate::packet::{Frame, PacketPriority, PacketReliability};
use crate::protocol::reliability::{ReliabilityClass, ReliabilityMapper, UdpMapper};

pub const HANDSHAKE_RETRY: Duration = Duration::from_millis(500);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(10);
pub const PING_RETRY: Duration = Duration::from_millis(250);

const MAX_DATAGRAM: usize = 64 * 1024;

fn unspecified_for(remote: &SocketAddr) -> SocketAddr {
    match remote {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

/// ICMP echoes of earlier datagrams, not a dead socket
fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

async fn send_frame(socket: &UdpSocket, to: SocketAddr, frame: &Bytes) {
    if let Err(e) = socket.send_to(frame, to).await {
        tracing::debug!("[SEND] datagram to {} failed: {}", to, e);
    }
}

fn data_frame(payload: Bytes, priority: PacketPriority, reliability: PacketReliability) -> Bytes {
    Frame::Data { reliability, priority, payload }.encode()
}

#[derive(Debug)]
struct Outbound {
    payload: Bytes,
    priority: PacketPriority,
    reliability: PacketReliability,
}

/// Client half of the UDP backend
#[derive(Debug)]
pub struct UdpClientEngine {
    local: SocketAddr,
    outbound: mpsc::UnboundedSender<Outbound>,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl UdpClientEngine {
    /// Bind an ephemeral socket and start the handshake with `remote`.
    ///
    /// Returns once the socket is bound; the handshake outcome arrives as an event.
    pub async fn connect(
        remote: SocketAddr,
        protocol: u8,
        timeout: Duration,
    ) -> io::Result<(Self, mpsc::UnboundedReceiver<ClientEngineEvent>)> {
        let socket = UdpSocket::bind(unspecified_for(&remote)).await?;
        let local = socket.local_addr()?;
        let token = CancellationToken::new();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events, rx) = mpsc::unbounded_channel();

        tracing::debug!("[CONNECT] {} -> {} (protocol {})", local, remote, protocol);
        let session = ClientSession {
            socket,
            remote,
            protocol,
            timeout,
            events,
        };
        let task = tokio::spawn(session.run(outbound_rx, token.clone()));

        Ok((
            Self {
                local,
                outbound,
                token,
                task: Some(task),
            },
            rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Stop and wait until the disconnect notice has been sent
    pub async fn finish(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl ClientEngine for UdpClientEngine {
    fn send(&self, payload: Bytes, class: ReliabilityClass) {
        let (priority, reliability) = UdpMapper::map(class);
        let _ = self.outbound.send(Outbound { payload, priority, reliability });
    }

    fn shutdown(self) {
        drop(self);
    }
}

impl Drop for UdpClientEngine {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct ClientSession {
    socket: UdpSocket,
    remote: SocketAddr,
    protocol: u8,
    timeout: Duration,
    events: mpsc::UnboundedSender<ClientEngineEvent>,
}

impl ClientSession {
    fn emit(&self, event: ClientEngineEvent) {
        let _ = self.events.send(event);
    }

    async fn flush(&self, queue: &mut VecDeque<Bytes>) {
        while let Some(frame) = queue.pop_front() {
            send_frame(&self.socket, self.remote, &frame).await;
        }
    }

    async fn run(self, mut outbound: mpsc::UnboundedReceiver<Outbound>, token: CancellationToken) {
        let request = Frame::ConnectRequest {
            protocol: self.protocol,
            client_guid: rand::random(),
        }
        .encode();
        let heartbeat_frame = Frame::Heartbeat.encode();

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut queue: VecDeque<Bytes> = VecDeque::new();
        let mut connected = false;
        let started = Instant::now();
        let mut last_seen = Instant::now();

        let mut retry = interval(HANDSHAKE_RETRY);
        let mut heartbeat = interval(HEARTBEAT_INTERVAL);
        let mut flush = interval(FLUSH_INTERVAL);
        for timer in [&mut retry, &mut heartbeat, &mut flush] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    if connected {
                        self.flush(&mut queue).await;
                        send_frame(&self.socket, self.remote, &Frame::Disconnect.encode()).await;
                    }
                    tracing::debug!("[TEARDOWN] udp client socket closed");
                    break;
                }
                _ = retry.tick(), if !connected => {
                    if started.elapsed() >= self.timeout {
                        tracing::debug!("[CONNECT] {} did not accept within {:?}", self.remote, self.timeout);
                        self.emit(ClientEngineEvent::Disconnect { reason: CloseReason::Timeout });
                        break;
                    }
                    send_frame(&self.socket, self.remote, &request).await;
                }
                _ = heartbeat.tick(), if connected => {
                    if last_seen.elapsed() >= self.timeout {
                        tracing::debug!("[HEARTBEAT] {} silent for {:?}", self.remote, self.timeout);
                        self.emit(ClientEngineEvent::Disconnect { reason: CloseReason::Timeout });
                        break;
                    }
                    send_frame(&self.socket, self.remote, &heartbeat_frame).await;
                }
                _ = flush.tick(), if !queue.is_empty() => {
                    self.flush(&mut queue).await;
                }
                Some(out) = outbound.recv() => {
                    let frame = data_frame(out.payload, out.priority, out.reliability);
                    if out.priority == PacketPriority::Immediate {
                        // keep ordering with anything already queued
                        self.flush(&mut queue).await;
                        send_frame(&self.socket, self.remote, &frame).await;
                    } else {
                        queue.push_back(frame);
                    }
                }
                received = self.socket.recv_from(&mut buf) => {
                    let (len, from) = match received {
                        Ok(received) => received,
                        Err(e) if is_transient(&e) => {
                            tracing::trace!("[RECV] transient socket error: {}", e);
                            continue;
                        }
                        Err(e) => {
                            tracing::error!("[RECV] udp client socket failed: {}", e);
                            self.emit(ClientEngineEvent::Disconnect { reason: CloseReason::Error(e.to_string()) });
                            break;
                        }
                    };
                    if from != self.remote {
                        tracing::trace!("[RECV] ignoring datagram from stranger {}", from);
                        continue;
                    }
                    last_seen = Instant::now();

                    match Frame::decode(&buf[..len]) {
                        Ok(Frame::ConnectAccept { server_guid }) => {
                            if !connected {
                                connected = true;
                                tracing::debug!("[CONNECT] accepted by {} (guid {})", self.remote, server_guid);
                                self.emit(ClientEngineEvent::Connect);
                            }
                        }
                        Ok(Frame::IncompatibleProtocol { protocol, .. }) => {
                            tracing::warn!(
                                "[CONNECT] {} speaks protocol {}, we speak {}",
                                self.remote, protocol, self.protocol
                            );
                            self.emit(ClientEngineEvent::Disconnect { reason: Refusal::IncompatibleProtocol.reason() });
                            break;
                        }
                        Ok(Frame::ServerFull) => {
                            tracing::warn!("[CONNECT] {} is full", self.remote);
                            self.emit(ClientEngineEvent::Disconnect { reason: Refusal::ServerFull.reason() });
                            break;
                        }
                        Ok(Frame::Data { payload, .. }) => {
                            if connected {
                                self.emit(ClientEngineEvent::Encapsulated { buffer: payload, address: from });
                            }
                        }
                        Ok(Frame::Disconnect) => {
                            self.emit(ClientEngineEvent::Disconnect {
                                reason: CloseReason::Remote("server closed connection".to_string()),
                            });
                            break;
                        }
                        Ok(Frame::Heartbeat) => {}
                        Ok(other) => tracing::trace!("[RECV] unexpected {:?} from server", other.kind()),
                        Err(e) => tracing::trace!("[RECV] dropping datagram: {}", TransportError::from(e)),
                    }
                }
            }
        }
    }
}

/// Server half of the UDP backend
#[derive(Debug)]
pub struct UdpServerEngine {
    local: SocketAddr,
    commands: mpsc::UnboundedSender<PeerCommand>,
    token: CancellationToken,
}

impl UdpServerEngine {
    /// Bind `address` and start answering pings and handshakes.
    /// Bind errors are returned here, not as events.
    pub async fn bind(
        address: SocketAddr,
        options: ServerOptions,
    ) -> io::Result<(Self, mpsc::UnboundedReceiver<ServerEngineEvent>)> {
        let socket = UdpSocket::bind(address).await?;
        let local = socket.local_addr()?;
        let token = CancellationToken::new();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (events, rx) = mpsc::unbounded_channel();

        tracing::debug!("[LISTEN] udp server bound to {}", local);
        let listener = ServerListener {
            socket,
            options,
            events,
            peers: HashMap::new(),
            queued: Vec::new(),
        };
        tokio::spawn(listener.run(commands_rx, token.clone()));

        Ok((Self { local, commands, token }, rx))
    }
}

impl ServerEngine for UdpServerEngine {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn link(&self) -> Arc<dyn PeerLink> {
        Arc::new(CommandLink::new(self.commands.clone()))
    }

    fn shutdown(self) {
        drop(self);
    }
}

impl Drop for UdpServerEngine {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct ServerListener {
    socket: UdpSocket,
    options: ServerOptions,
    events: mpsc::UnboundedSender<ServerEngineEvent>,
    /// Peer address -> last datagram time
    peers: HashMap<SocketAddr, Instant>,
    queued: Vec<(SocketAddr, Bytes)>,
}

impl ServerListener {
    fn emit(&self, event: ServerEngineEvent) {
        let _ = self.events.send(event);
    }

    async fn flush(&mut self) {
        for (peer, frame) in std::mem::take(&mut self.queued) {
            send_frame(&self.socket, peer, &frame).await;
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<PeerCommand>, token: CancellationToken) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut flush = interval(FLUSH_INTERVAL);
        let mut sweep = interval(HEARTBEAT_INTERVAL);
        flush.set_missed_tick_behavior(MissedTickBehavior::Skip);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    self.flush().await;
                    let goodbye = Frame::Disconnect.encode();
                    for peer in self.peers.keys() {
                        send_frame(&self.socket, *peer, &goodbye).await;
                    }
                    tracing::debug!("[TEARDOWN] udp server socket closed");
                    break;
                }
                _ = flush.tick(), if !self.queued.is_empty() => {
                    self.flush().await;
                }
                _ = sweep.tick() => self.sweep().await,
                Some(command) = commands.recv() => self.command(command).await,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => self.datagram(&buf[..len], from).await,
                    Err(e) if is_transient(&e) => {
                        tracing::trace!("[RECV] transient socket error: {}", e);
                    }
                    Err(e) => {
                        tracing::error!("[RECV] udp server socket failed: {}", e);
                        self.emit(ServerEngineEvent::Close { reason: CloseReason::Error(e.to_string()) });
                        break;
                    }
                },
            }
        }
    }

    /// Drop silent peers, heartbeat the rest
    async fn sweep(&mut self) {
        let timeout = self.options.timeout;
        let expired: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|(_, last_seen)| last_seen.elapsed() >= timeout)
            .map(|(peer, _)| *peer)
            .collect();
        for peer in expired {
            self.peers.remove(&peer);
            tracing::debug!("[HEARTBEAT] {} silent for {:?}, dropping", peer, timeout);
            self.emit(ServerEngineEvent::CloseConnection { address: peer, reason: CloseReason::Timeout });
        }

        let heartbeat = Frame::Heartbeat.encode();
        for peer in self.peers.keys() {
            send_frame(&self.socket, *peer, &heartbeat).await;
        }
    }

    async fn command(&mut self, command: PeerCommand) {
        match command {
            PeerCommand::Send { peer, payload, class } => {
                if !self.peers.contains_key(&peer) {
                    tracing::trace!("[SEND] {} is not connected, dropping payload", peer);
                    return;
                }
                let (priority, reliability) = UdpMapper::map(class);
                let frame = data_frame(payload, priority, reliability);
                if priority == PacketPriority::Immediate {
                    self.flush().await;
                    send_frame(&self.socket, peer, &frame).await;
                } else {
                    self.queued.push((peer, frame));
                }
            }
            PeerCommand::Kick { peer } => {
                if self.peers.remove(&peer).is_some() {
                    send_frame(&self.socket, peer, &Frame::Disconnect.encode()).await;
                    self.emit(ServerEngineEvent::CloseConnection { address: peer, reason: CloseReason::Normal });
                }
            }
        }
    }

    async fn datagram(&mut self, datagram: &[u8], from: SocketAddr) {
        let frame = match Frame::decode(datagram) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::trace!("[RECV] dropping datagram from {}: {}", from, TransportError::from(e));
                return;
            }
        };

        match frame {
            Frame::UnconnectedPing { client_time } => {
                let pong = Frame::UnconnectedPong {
                    client_time,
                    server_guid: self.options.guid(),
                    payload: self.options.advertisement_payload(),
                };
                send_frame(&self.socket, from, &pong.encode()).await;
            }
            Frame::ConnectRequest { protocol, client_guid } => {
                if self.peers.contains_key(&from) {
                    // our accept was lost
                    let accept = Frame::ConnectAccept { server_guid: self.options.guid() };
                    send_frame(&self.socket, from, &accept.encode()).await;
                    return;
                }
                match admit(&self.options, protocol, self.peers.len()) {
                    Ok(()) => {
                        tracing::debug!("[ACCEPT] {} (guid {})", from, client_guid);
                        self.peers.insert(from, Instant::now());
                        let accept = Frame::ConnectAccept { server_guid: self.options.guid() };
                        send_frame(&self.socket, from, &accept.encode()).await;
                        self.emit(ServerEngineEvent::OpenConnection { address: from });
                    }
                    Err(refusal) => {
                        tracing::warn!("[ACCEPT] refusing {}: {}", from, refusal.message());
                        let reply = match refusal {
                            Refusal::IncompatibleProtocol => Frame::IncompatibleProtocol {
                                protocol: self.options.protocol,
                                server_guid: self.options.guid(),
                            },
                            Refusal::ServerFull => Frame::ServerFull,
                        };
                        send_frame(&self.socket, from, &reply.encode()).await;
                    }
                }
            }
            Frame::Data { payload, .. } => match self.peers.get_mut(&from) {
                Some(last_seen) => {
                    *last_seen = Instant::now();
                    self.emit(ServerEngineEvent::Encapsulated { address: from, buffer: payload });
                }
                None => tracing::trace!("[RECV] data from unknown peer {}", from),
            },
            Frame::Heartbeat => {
                if let Some(last_seen) = self.peers.get_mut(&from) {
                    *last_seen = Instant::now();
                }
            }
            Frame::Disconnect => {
                if self.peers.remove(&from).is_some() {
                    self.emit(ServerEngineEvent::CloseConnection {
                        address: from,
                        reason: CloseReason::Remote("client disconnect".to_string()),
                    });
                }
            }
            other => tracing::trace!("[RECV] unexpected {:?} from {}", other.kind(), from),
        }
    }
}

/// Unconnected ping.
///
/// Resends every [`PING_RETRY`] until a pong arrives. Never gives up on its
/// own; a refused port surfaces as an error.
pub async fn ping(remote: SocketAddr) -> io::Result<Bytes> {
    let socket = UdpSocket::bind(unspecified_for(&remote)).await?;
    socket.connect(remote).await?;

    let client_time = chrono::Utc::now().timestamp_millis() as u64;
    let request = Frame::UnconnectedPing { client_time }.encode();
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut retry = interval(PING_RETRY);

    loop {
        tokio::select! {
            _ = retry.tick() => {
                socket.send(&request).await?;
            }
            received = socket.recv(&mut buf) => {
                let len = received?;
                match Frame::decode(&buf[..len]) {
                    Ok(Frame::UnconnectedPong { client_time: echoed, payload, .. }) if echoed == client_time => {
                        return Ok(payload);
                    }
                    Ok(other) => tracing::trace!("[PING] ignoring {:?}", other.kind()),
                    Err(e) => tracing::trace!("[PING] dropping datagram: {}", e),
                }
            }
        }
    }
}

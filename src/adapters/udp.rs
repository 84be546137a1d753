/// UDP backend adapters, running the engine on the caller's runtime

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::{ping_with_deadline, ClientCore, ServerCore};
use crate::advertisement::Advertisement;
use crate::backend::udp::{self, UdpClientEngine, UdpServerEngine};
use crate::backend::{ServerEngine, ServerOptions};
use crate::connection::ConnectionHandle;
use crate::error::TransportError;
use crate::event::{ClientHandler, ServerHandler};
use crate::protocol::adapter::{ClientAdapter, ServerAdapter};
use crate::transport::config::TransportConfig;
use crate::transport::connection_state::ClientState;

pub const BACKEND_NAME: &str = "udp";

/// Ping the server named by `config` over a throwaway socket
pub(crate) async fn ping_config(config: TransportConfig) -> io::Result<Bytes> {
    let remote = config
        .resolve()
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::AddrNotAvailable, e.to_string()))?;
    udp::ping(remote).await
}

pub struct UdpClient {
    config: TransportConfig,
    core: Arc<ClientCore<UdpClientEngine>>,
}

impl UdpClient {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            core: ClientCore::new(BACKEND_NAME),
        }
    }
}

#[async_trait]
impl ClientAdapter for UdpClient {
    fn backend(&self) -> &'static str {
        self.core.backend()
    }

    fn set_handler(&self, handler: Arc<dyn ClientHandler>) {
        self.core.set_handler(handler);
    }

    fn state(&self) -> ClientState {
        self.core.state()
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.config.validate()?;
        if !self.core.begin_connect()? {
            return Ok(());
        }

        let started = async {
            let remote = self.config.resolve().await?;
            let engine =
                UdpClientEngine::connect(remote, self.config.protocol_version(), self.config.timeout).await?;
            Ok::<_, TransportError>(engine)
        }
        .await;

        match started {
            Ok((engine, events)) => {
                self.core.install(engine);
                self.core.dispatch(events);
                Ok(())
            }
            Err(e) => Err(self.core.abort_connect(e)),
        }
    }

    fn send_reliable(&self, payload: Bytes, immediate: bool) {
        self.core.send_reliable(payload, immediate);
    }

    fn close(&self) {
        self.core.close();
    }

    async fn ping(&self, timeout: Option<Duration>) -> Result<Option<String>, TransportError> {
        ping_with_deadline(BACKEND_NAME, timeout, ping_config(self.config.clone())).await
    }
}

pub struct UdpServer {
    config: TransportConfig,
    core: Arc<ServerCore<UdpServerEngine>>,
}

impl UdpServer {
    pub fn new(config: TransportConfig, advertisement: Advertisement) -> Self {
        if config.use_workers {
            tracing::warn!("[CONFIG] udp server runs inline, ignoring use_workers");
        }
        let options = ServerOptions::new(
            config.protocol_version(),
            advertisement,
            config.max_connections,
            config.timeout,
        );
        Self {
            config,
            core: ServerCore::new(BACKEND_NAME, options),
        }
    }
}

#[async_trait]
impl ServerAdapter for UdpServer {
    fn backend(&self) -> &'static str {
        self.core.backend()
    }

    fn set_handler(&self, handler: Arc<dyn ServerHandler>) {
        self.core.set_handler(handler);
    }

    async fn listen(&self) -> Result<(), TransportError> {
        self.config.validate()?;
        if !self.core.begin_listen()? {
            return Ok(());
        }

        let bound = async {
            let address = self.config.resolve().await?;
            let engine = UdpServerEngine::bind(address, self.core.options().clone()).await?;
            Ok::<_, TransportError>(engine)
        }
        .await;

        match bound {
            Ok((engine, events)) => {
                tracing::debug!("[LISTEN] udp server listening on {}", engine.local_addr());
                self.core.install(engine);
                self.core.dispatch(events);
                Ok(())
            }
            Err(e) => Err(self.core.abort_listen(e)),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.core.local_addr()
    }

    fn update_advertisement(&self, advertisement: Advertisement) -> Result<(), TransportError> {
        self.core.update_advertisement(advertisement)
    }

    fn advertisement(&self) -> Advertisement {
        self.core.advertisement()
    }

    fn connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.core.connections()
    }

    fn close(&self) {
        self.core.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ClientEvent, EventChannel, ServerEvent};
    use crate::packet::Frame;
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(3);

    async fn next<E>(rx: &mut mpsc::UnboundedReceiver<E>) -> E {
        tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_loopback_echo() {
        let server = UdpServer::new(
            TransportConfig::new("127.0.0.1", 0),
            Advertisement::new("Loopback", "level"),
        );
        let (handler, mut server_events) = EventChannel::<ServerEvent>::new();
        server.set_handler(Arc::new(handler));
        server.listen().await.unwrap();
        server.listen().await.unwrap();
        let port = server.local_addr().unwrap().port();

        let client = UdpClient::new(TransportConfig::new("127.0.0.1", port));
        let (handler, mut client_events) = EventChannel::<ClientEvent>::new();
        client.set_handler(Arc::new(handler));
        client.connect().await.unwrap();

        assert!(matches!(next(&mut client_events).await, ClientEvent::Connected));
        let connection = match next(&mut server_events).await {
            ServerEvent::OpenConnection(connection) => connection,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(connection.id(), format!("127.0.0.1/{}", connection.address().port()));

        client.send_reliable(Bytes::from_static(b"hello"), false);
        match next(&mut server_events).await {
            ServerEvent::Encapsulated { buffer, connection: from } => {
                assert_eq!(&buffer[..], b"hello");
                from.send_reliable(buffer, true);
            }
            other => panic!("unexpected {:?}", other),
        }
        match next(&mut client_events).await {
            ClientEvent::Encapsulated { buffer, peer } => {
                assert_eq!(&buffer[..], b"hello");
                assert_eq!(peer.port(), port);
            }
            other => panic!("unexpected {:?}", other),
        }

        let answer = client.ping(Some(WAIT)).await.unwrap().unwrap();
        assert!(answer.starts_with("MCPE;Loopback;"));

        client.close();
        server.close();
    }

    #[tokio::test]
    async fn test_advertisement_update_reaches_server_guid() {
        let server = UdpServer::new(
            TransportConfig::new("127.0.0.1", 0),
            Advertisement::new("Guid", "level").with_server_id(111),
        );
        server.listen().await.unwrap();
        let address = server.local_addr().unwrap();
        server
            .update_advertisement(Advertisement::new("Guid", "level").with_server_id(222))
            .unwrap();

        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut buf = vec![0u8; 2048];

        socket
            .send_to(&Frame::UnconnectedPing { client_time: 5 }.encode(), address)
            .await
            .unwrap();
        let (len, _) = tokio::time::timeout(WAIT, socket.recv_from(&mut buf)).await.unwrap().unwrap();
        match Frame::decode(&buf[..len]).unwrap() {
            Frame::UnconnectedPong { client_time, server_guid, payload } => {
                assert_eq!(client_time, 5);
                assert_eq!(server_guid, 222);
                assert!(String::from_utf8_lossy(&payload).contains(";222;"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let request = Frame::ConnectRequest { protocol: TransportConfig::default().protocol_version(), client_guid: 1 };
        socket.send_to(&request.encode(), address).await.unwrap();
        let (len, _) = tokio::time::timeout(WAIT, socket.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(Frame::decode(&buf[..len]).unwrap(), Frame::ConnectAccept { server_guid: 222 });
        server.close();
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let first = UdpServer::new(TransportConfig::new("127.0.0.1", 0), Advertisement::default());
        first.listen().await.unwrap();
        let port = first.local_addr().unwrap().port();

        let second = UdpServer::new(TransportConfig::new("127.0.0.1", port), Advertisement::default());
        assert!(second.listen().await.is_err());
        // a failed bind may be retried
        assert!(second.listen().await.is_err());
    }
}

/// Memory backend adapters
///
/// Always compiled in; the registry falls back to them when no native
/// backend is available.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::{ping_with_deadline, ClientCore, ServerCore};
use crate::advertisement::Advertisement;
use crate::backend::memory::{self, MemoryClientEngine, MemoryNetwork, MemoryServerEngine};
use crate::backend::{ServerEngine, ServerOptions};
use crate::connection::ConnectionHandle;
use crate::error::TransportError;
use crate::event::{ClientHandler, ServerHandler};
use crate::protocol::adapter::{ClientAdapter, ServerAdapter};
use crate::transport::config::TransportConfig;
use crate::transport::connection_state::ClientState;

pub const BACKEND_NAME: &str = "memory";

pub struct MemoryClient {
    config: TransportConfig,
    network: MemoryNetwork,
    core: Arc<ClientCore<MemoryClientEngine>>,
}

impl MemoryClient {
    /// Client on the process-wide network
    pub fn new(config: TransportConfig) -> Self {
        Self::with_network(config, MemoryNetwork::global())
    }

    pub fn with_network(config: TransportConfig, network: MemoryNetwork) -> Self {
        if config.use_workers {
            tracing::warn!("[CONFIG] memory backend runs inline, ignoring use_workers");
        }
        Self {
            config,
            network,
            core: ClientCore::new(BACKEND_NAME),
        }
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

#[async_trait]
impl ClientAdapter for MemoryClient {
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
            let engine = MemoryClientEngine::connect(
                &self.network,
                remote,
                self.config.protocol_version(),
                self.config.timeout,
            )?;
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
        let network = self.network.clone();
        let config = self.config.clone();
        ping_with_deadline(BACKEND_NAME, timeout, async move {
            let remote = config
                .resolve()
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::AddrNotAvailable, e.to_string()))?;
            memory::ping(&network, remote).await
        })
        .await
    }
}

pub struct MemoryServer {
    config: TransportConfig,
    network: MemoryNetwork,
    core: Arc<ServerCore<MemoryServerEngine>>,
}

impl MemoryServer {
    pub fn new(config: TransportConfig, advertisement: Advertisement) -> Self {
        Self::with_network(config, advertisement, MemoryNetwork::global())
    }

    pub fn with_network(config: TransportConfig, advertisement: Advertisement, network: MemoryNetwork) -> Self {
        if config.use_workers {
            tracing::warn!("[CONFIG] memory server runs inline, ignoring use_workers");
        }
        let options = ServerOptions::new(
            config.protocol_version(),
            advertisement,
            config.max_connections,
            config.timeout,
        );
        Self {
            config,
            network,
            core: ServerCore::new(BACKEND_NAME, options),
        }
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

#[async_trait]
impl ServerAdapter for MemoryServer {
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
            let engine = MemoryServerEngine::bind(&self.network, Some(address), self.core.options().clone())?;
            Ok::<_, TransportError>(engine)
        }
        .await;

        match bound {
            Ok((engine, events)) => {
                tracing::debug!("[LISTEN] memory server listening on {}", engine.local_addr());
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
    use crate::error::CloseReason;
    use crate::event::{ClientEvent, EventChannel, ServerEvent};
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(2);

    async fn next<E>(rx: &mut mpsc::UnboundedReceiver<E>) -> E {
        tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    async fn pair(network: &MemoryNetwork) -> (MemoryServer, mpsc::UnboundedReceiver<ServerEvent>, TransportConfig) {
        let server = MemoryServer::with_network(
            TransportConfig::new("127.0.0.1", 0),
            Advertisement::new("Adapter MOTD", "level"),
            network.clone(),
        );
        let (handler, events) = EventChannel::<ServerEvent>::new();
        server.set_handler(Arc::new(handler));
        server.listen().await.unwrap();
        let port = server.local_addr().unwrap().port();
        (server, events, TransportConfig::new("127.0.0.1", port))
    }

    #[tokio::test]
    async fn test_connect_send_close() {
        let network = MemoryNetwork::new();
        let (server, mut server_events, config) = pair(&network).await;

        let client = MemoryClient::with_network(config, network.clone());
        let (handler, mut client_events) = EventChannel::<ClientEvent>::new();
        client.set_handler(Arc::new(handler));
        client.connect().await.unwrap();
        // repeat connect is a no-op
        client.connect().await.unwrap();

        assert!(matches!(next(&mut client_events).await, ClientEvent::Connected));
        assert!(client.is_connected());
        let connection = match next(&mut server_events).await {
            ServerEvent::OpenConnection(connection) => connection,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(server.connections().len(), 1);

        client.send_reliable(Bytes::from_static(b"ping"), true);
        match next(&mut server_events).await {
            ServerEvent::Encapsulated { buffer, connection: from } => {
                assert_eq!(&buffer[..], b"ping");
                assert_eq!(from.id(), connection.id());
            }
            other => panic!("unexpected {:?}", other),
        }

        connection.send_reliable(Bytes::from_static(b"pong"), false);
        match next(&mut client_events).await {
            ClientEvent::Encapsulated { buffer, .. } => assert_eq!(&buffer[..], b"pong"),
            other => panic!("unexpected {:?}", other),
        }

        client.close();
        assert_eq!(client.state(), ClientState::Closed);
        assert!(client.connect().await.is_err());

        match next(&mut server_events).await {
            ServerEvent::CloseConnection { connection: closed, reason } => {
                assert_eq!(closed.id(), connection.id());
                assert_eq!(reason, CloseReason::Remote("client disconnect".to_string()));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!connection.is_connected());
    }

    #[tokio::test]
    async fn test_refused_client_reports_close() {
        let network = MemoryNetwork::new();
        let (_server, _server_events, config) = pair(&network).await;

        let client = MemoryClient::with_network(config.with_version("1.19.20".parse().unwrap()), network);
        let (handler, mut client_events) = EventChannel::<ClientEvent>::new();
        client.set_handler(Arc::new(handler));
        client.connect().await.unwrap();

        match next(&mut client_events).await {
            ClientEvent::Closed { reason } => {
                assert_eq!(reason, CloseReason::Refused("incompatible protocol".to_string()))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(client.state(), ClientState::Closed);
    }

    #[tokio::test]
    async fn test_server_close_fires_callbacks() {
        let network = MemoryNetwork::new();
        let (server, mut server_events, config) = pair(&network).await;

        let client = MemoryClient::with_network(config, network.clone());
        let (handler, mut client_events) = EventChannel::<ClientEvent>::new();
        client.set_handler(Arc::new(handler));
        client.connect().await.unwrap();
        assert!(matches!(next(&mut client_events).await, ClientEvent::Connected));
        assert!(matches!(next(&mut server_events).await, ServerEvent::OpenConnection(_)));

        server.close();
        server.close();
        assert!(matches!(
            next(&mut server_events).await,
            ServerEvent::CloseConnection { reason: CloseReason::Normal, .. }
        ));
        assert!(matches!(next(&mut server_events).await, ServerEvent::Closed { reason: CloseReason::Normal }));
        assert!(matches!(next(&mut client_events).await, ClientEvent::Closed { reason: CloseReason::Remote(_) }));
        assert!(server.listen().await.is_err());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let network = MemoryNetwork::new();
        let (first, _events, config) = pair(&network).await;
        let second = MemoryServer::with_network(config, Advertisement::default(), network);

        let err = second.listen().await.unwrap_err();
        assert!(matches!(err, TransportError::Connection { .. }));
        assert!(err.to_string().contains("operation: listen"));
        assert!(first.local_addr().is_some());
        assert!(second.local_addr().is_none());
    }

    #[derive(Clone, Default)]
    struct CapturedLog(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_use_workers_ignored_with_warning() {
        let log = CapturedLog::default();
        let writer = log.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let config = TransportConfig::new("127.0.0.1", 0).with_workers(true);
            let network = MemoryNetwork::new();
            let _server = MemoryServer::with_network(config.clone(), Advertisement::default(), network.clone());
            let _client = MemoryClient::with_network(config, network);
        });

        let output = String::from_utf8_lossy(&log.0.lock()).into_owned();
        assert!(output.contains("memory server runs inline, ignoring use_workers"));
        assert!(output.contains("memory backend runs inline, ignoring use_workers"));
    }
}

/// UDP client with socket I/O on a worker thread
///
/// Same contract as [`UdpClient`](super::UdpClient); everything crosses the
/// [`WorkerBridge`] as messages. Pong events are matched to the pending ping
/// through a [`PingSlot`].

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::udp::{ping_config, BACKEND_NAME};
use super::{ping_with_deadline, ClientCore};
use crate::backend::ClientEngineEvent;
use crate::error::TransportError;
use crate::event::ClientHandler;
use crate::protocol::adapter::ClientAdapter;
use crate::transport::bridge::{WorkerBridge, WorkerCommand, WorkerEvent, WorkerOptions};
use crate::transport::config::TransportConfig;
use crate::transport::connection_state::ClientState;
use crate::transport::timeout::PingSlot;

pub struct WorkerClient {
    config: TransportConfig,
    core: Arc<ClientCore<WorkerBridge>>,
    pings: Arc<PingSlot>,
}

impl WorkerClient {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            core: ClientCore::new(BACKEND_NAME),
            pings: Arc::new(PingSlot::new()),
        }
    }

    fn pump(&self, events: flume::Receiver<WorkerEvent>) {
        let core = Arc::downgrade(&self.core);
        let pings = self.pings.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv_async().await {
                let Some(core) = core.upgrade() else { break };
                match event {
                    WorkerEvent::Pong { generation, payload } => {
                        pings.complete(generation, payload);
                    }
                    WorkerEvent::Connected => core.handle(ClientEngineEvent::Connect),
                    WorkerEvent::Encapsulated { buffer, address } => {
                        core.handle(ClientEngineEvent::Encapsulated { buffer, address })
                    }
                    WorkerEvent::Disconnect { reason } => core.handle(ClientEngineEvent::Disconnect { reason }),
                }
            }
            tracing::debug!("[WORKER] event pump stopped");
        });
    }
}

#[async_trait]
impl ClientAdapter for WorkerClient {
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

        let options = WorkerOptions {
            protocol: self.config.protocol_version(),
            timeout: self.config.timeout,
        };
        let bridge = match WorkerBridge::spawn(options) {
            Ok(bridge) => bridge,
            Err(e) => return Err(self.core.abort_connect(TransportError::from(e))),
        };

        self.pump(bridge.events());
        bridge.post(WorkerCommand::Connect {
            host: self.config.host.clone(),
            port: self.config.port,
        });
        self.core.install(bridge);
        Ok(())
    }

    fn send_reliable(&self, payload: Bytes, immediate: bool) {
        self.core.send_reliable(payload, immediate);
    }

    fn close(&self) {
        self.core.close();
    }

    async fn ping(&self, timeout: Option<Duration>) -> Result<Option<String>, TransportError> {
        let (generation, pong) = self.pings.arm();
        let posted = self
            .core
            .with_engine(|bridge| bridge.post(WorkerCommand::Ping { generation }))
            .unwrap_or(false);

        if !posted {
            // no worker yet
            self.pings.disarm(generation);
            return ping_with_deadline(BACKEND_NAME, timeout, ping_config(self.config.clone())).await;
        }

        let result = ping_with_deadline(BACKEND_NAME, timeout, async move {
            match pong.await {
                Ok(Some(payload)) => Ok(payload),
                Ok(None) => Err(io::Error::new(io::ErrorKind::Other, "worker ping failed")),
                Err(_) => Err(io::Error::new(io::ErrorKind::Other, "ping replaced by a newer one")),
            }
        })
        .await;

        if result.is_err() {
            // a pong arriving from now on has no waiter
            self.pings.disarm(generation);
        }
        result
    }
}

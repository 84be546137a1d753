/// Worker bridge
///
/// Runs a UDP client engine on its own OS thread with a single-threaded
/// runtime. The owning adapter talks to it only through two flume channels,
/// FIFO per direction with no ordering across directions.

use std::io;
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::backend::udp::{self, UdpClientEngine};
use crate::backend::{ClientEngine, ClientEngineEvent};
use crate::error::CloseReason;
use crate::protocol::reliability::ReliabilityClass;
use crate::transport::config::TransportConfig;

/// Adapter -> worker
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerCommand {
    Connect { host: String, port: u16 },
    Close { reason: String },
    QueueEncapsulated { packet: Bytes, immediate: bool },
    /// Answered by a `Pong` carrying the same generation
    Ping { generation: u64 },
}

/// Worker -> adapter
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Connected,
    Encapsulated { buffer: Bytes, address: SocketAddr },
    /// `payload` is `None` when the ping failed
    Pong { generation: u64, payload: Option<Bytes> },
    Disconnect { reason: CloseReason },
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    pub protocol: u8,
    /// Handshake timeout, also caps a worker-side ping
    pub timeout: Duration,
}

/// Handle to a running worker thread.
///
/// Dropping the bridge closes the command channel, which stops the worker.
#[derive(Debug)]
pub struct WorkerBridge {
    commands: flume::Sender<WorkerCommand>,
    events: flume::Receiver<WorkerEvent>,
}

impl WorkerBridge {
    pub fn spawn(options: WorkerOptions) -> io::Result<Self> {
        let (commands, commands_rx) = flume::unbounded();
        let (events_tx, events) = flume::unbounded();

        thread::Builder::new()
            .name("raklink-worker".to_string())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build();
                match runtime {
                    Ok(runtime) => runtime.block_on(run_worker(options, commands_rx, events_tx)),
                    Err(e) => {
                        tracing::error!("[WORKER] failed to start runtime: {}", e);
                        let _ = events_tx.send(WorkerEvent::Disconnect { reason: CloseReason::Error(e.to_string()) });
                    }
                }
            })?;

        Ok(Self { commands, events })
    }

    /// Post a command. False once the worker has exited.
    pub fn post(&self, command: WorkerCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn events(&self) -> flume::Receiver<WorkerEvent> {
        self.events.clone()
    }
}

impl ClientEngine for WorkerBridge {
    fn send(&self, payload: Bytes, class: ReliabilityClass) {
        self.post(WorkerCommand::QueueEncapsulated {
            packet: payload,
            immediate: class.is_immediate(),
        });
    }

    fn shutdown(self) {
        self.post(WorkerCommand::Close { reason: "client closed".to_string() });
    }
}

async fn next_engine_event(
    events: &mut Option<mpsc::UnboundedReceiver<ClientEngineEvent>>,
) -> Option<ClientEngineEvent> {
    match events.as_mut() {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn run_worker(
    options: WorkerOptions,
    commands: flume::Receiver<WorkerCommand>,
    events: flume::Sender<WorkerEvent>,
) {
    let mut engine: Option<UdpClientEngine> = None;
    let mut engine_events: Option<mpsc::UnboundedReceiver<ClientEngineEvent>> = None;
    let mut remote: Option<SocketAddr> = None;

    tracing::debug!("[WORKER] started");
    loop {
        tokio::select! {
            command = commands.recv_async() => {
                let Ok(command) = command else {
                    tracing::debug!("[WORKER] bridge dropped");
                    break;
                };
                match command {
                    WorkerCommand::Connect { host, port } => {
                        if engine.is_some() {
                            tracing::debug!("[WORKER] already connected, ignoring connect");
                            continue;
                        }
                        let target = match TransportConfig::new(host, port).resolve().await {
                            Ok(target) => target,
                            Err(e) => {
                                let _ = events.send(WorkerEvent::Disconnect { reason: CloseReason::Error(e.to_string()) });
                                continue;
                            }
                        };
                        match UdpClientEngine::connect(target, options.protocol, options.timeout).await {
                            Ok((started, rx)) => {
                                remote = Some(target);
                                engine = Some(started);
                                engine_events = Some(rx);
                            }
                            Err(e) => {
                                tracing::error!("[WORKER] connect to {} failed: {}", target, e);
                                let _ = events.send(WorkerEvent::Disconnect { reason: CloseReason::Error(e.to_string()) });
                            }
                        }
                    }
                    WorkerCommand::QueueEncapsulated { packet, immediate } => match engine.as_ref() {
                        Some(engine) => engine.send(packet, ReliabilityClass::from_immediate(immediate)),
                        None => tracing::trace!("[WORKER] not connected, dropping packet"),
                    },
                    WorkerCommand::Ping { generation } => {
                        let events = events.clone();
                        let timeout = options.timeout;
                        tokio::spawn(async move {
                            let payload = match remote {
                                Some(remote) => tokio::time::timeout(timeout, udp::ping(remote))
                                    .await
                                    .ok()
                                    .and_then(|result| result.ok()),
                                None => None,
                            };
                            let _ = events.send(WorkerEvent::Pong { generation, payload });
                        });
                    }
                    WorkerCommand::Close { reason } => {
                        tracing::debug!("[WORKER] closing: {}", reason);
                        if let Some(engine) = engine.take() {
                            engine.finish().await;
                        }
                        break;
                    }
                }
            }
            event = next_engine_event(&mut engine_events) => match event {
                Some(ClientEngineEvent::Connect) => {
                    let _ = events.send(WorkerEvent::Connected);
                }
                Some(ClientEngineEvent::Encapsulated { buffer, address }) => {
                    let _ = events.send(WorkerEvent::Encapsulated { buffer, address });
                }
                Some(ClientEngineEvent::Disconnect { reason }) => {
                    let _ = events.send(WorkerEvent::Disconnect { reason });
                }
                None => engine_events = None,
            },
        }
    }
    tracing::debug!("[WORKER] stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advertisement::Advertisement;
    use crate::backend::udp::UdpServerEngine;
    use crate::backend::{ServerEngine, ServerEngineEvent, ServerOptions};

    const WAIT: Duration = Duration::from_secs(3);

    fn options() -> WorkerOptions {
        WorkerOptions { protocol: 11, timeout: WAIT }
    }

    async fn next(bridge: &WorkerBridge) -> WorkerEvent {
        tokio::time::timeout(WAIT, bridge.events().recv_async())
            .await
            .expect("worker event in time")
            .expect("worker alive")
    }

    #[tokio::test]
    async fn test_ping_before_connect_is_absent() {
        let bridge = WorkerBridge::spawn(options()).unwrap();
        assert!(bridge.post(WorkerCommand::Ping { generation: 7 }));
        assert_eq!(next(&bridge).await, WorkerEvent::Pong { generation: 7, payload: None });
    }

    #[tokio::test]
    async fn test_round_trip_through_worker() {
        let ad = Advertisement::new("Worker MOTD", "level");
        let (server, mut server_events) =
            UdpServerEngine::bind("127.0.0.1:0".parse().unwrap(), ServerOptions::new(11, ad, 3, WAIT))
                .await
                .unwrap();
        let port = server.local_addr().port();

        let bridge = WorkerBridge::spawn(options()).unwrap();
        bridge.post(WorkerCommand::Connect { host: "127.0.0.1".to_string(), port });
        assert_eq!(next(&bridge).await, WorkerEvent::Connected);

        bridge.send(Bytes::from_static(b"from worker"), ReliabilityClass::Immediate);
        let peer = loop {
            match tokio::time::timeout(WAIT, server_events.recv()).await.unwrap().unwrap() {
                ServerEngineEvent::Encapsulated { address, buffer } => {
                    assert_eq!(&buffer[..], b"from worker");
                    break address;
                }
                ServerEngineEvent::OpenConnection { .. } => continue,
                other => panic!("unexpected {:?}", other),
            }
        };

        server.link().send(peer, Bytes::from_static(b"to worker"), ReliabilityClass::ReliableOrdered);
        match next(&bridge).await {
            WorkerEvent::Encapsulated { buffer, .. } => assert_eq!(&buffer[..], b"to worker"),
            other => panic!("unexpected {:?}", other),
        }

        bridge.post(WorkerCommand::Ping { generation: 1 });
        match next(&bridge).await {
            WorkerEvent::Pong { generation: 1, payload: Some(payload) } => {
                assert!(String::from_utf8_lossy(&payload).starts_with("MCPE;Worker MOTD;"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let events = bridge.events();
        bridge.shutdown();
        // worker exits and drops its event sender
        let closed = tokio::time::timeout(WAIT, async {
            while events.recv_async().await.is_ok() {}
        })
        .await;
        assert!(closed.is_ok());
    }
}

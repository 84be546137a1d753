/// Transport adapters
///
/// One client/server adapter per backend. The lifecycle rules every backend
/// must share (idempotent connect, delivery only while connected, deferred
/// release on close, the ping deadline) live in [`ClientCore`] and
/// [`ServerCore`]; backend modules only start engines and feed events in.

pub mod memory;
#[cfg(feature = "udp")]
pub mod udp;
#[cfg(feature = "udp")]
pub mod worker;

pub use memory::{MemoryClient, MemoryServer};
#[cfg(feature = "udp")]
pub use udp::{UdpClient, UdpServer};
#[cfg(feature = "udp")]
pub use worker::WorkerClient;

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::advertisement::Advertisement;
use crate::backend::{ClientEngine, ClientEngineEvent, ServerEngine, ServerEngineEvent, ServerOptions};
use crate::connection::ConnectionHandle;
use crate::error::{CloseReason, TransportError};
use crate::event::{ClientHandler, NoopHandler, ServerHandler};
use crate::protocol::reliability::ReliabilityClass;
use crate::transport::connection_state::{ClientState, ClientStateCell};
use crate::transport::teardown::{DeferredTeardown, CLOSE_GRACE_PERIOD};
use crate::transport::timeout::{race, DEFAULT_PING_TIMEOUT};

/// Environments known to block outbound UDP
const RESTRICTED_ENV_VARS: [&str; 2] = ["REPL_ID", "REPLIT_ENVIRONMENT"];

/// Race a backend ping against `deadline`.
///
/// A backend failure is an absent result, not an error; only the deadline
/// produces `Err`.
pub(crate) async fn ping_with_deadline<F>(
    backend: &'static str,
    deadline: Option<Duration>,
    ping: F,
) -> Result<Option<String>, TransportError>
where
    F: Future<Output = io::Result<Bytes>>,
{
    let deadline = deadline.unwrap_or(DEFAULT_PING_TIMEOUT);
    match race("ping", deadline, ping).await {
        Ok(Ok(payload)) => Ok(Some(String::from_utf8_lossy(&payload).into_owned())),
        Ok(Err(e)) => {
            tracing::debug!("[PING] {} ping failed: {}", backend, e);
            Ok(None)
        }
        Err(e) => {
            restricted_environment_hint();
            Err(e)
        }
    }
}

fn restricted_environment_hint() {
    static HINT: Once = Once::new();
    if RESTRICTED_ENV_VARS.iter().any(|var| std::env::var_os(var).is_some()) {
        HINT.call_once(|| {
            tracing::warn!("[PING] this environment does not appear to allow outbound UDP; pings will time out");
        });
    }
}

/// Client lifecycle shared by every backend
pub(crate) struct ClientCore<E: ClientEngine> {
    backend: &'static str,
    state: ClientStateCell,
    handler: RwLock<Arc<dyn ClientHandler>>,
    engine: Arc<Mutex<Option<E>>>,
    teardown: DeferredTeardown,
}

impl<E: ClientEngine> ClientCore<E> {
    pub(crate) fn new(backend: &'static str) -> Arc<Self> {
        Arc::new(Self {
            backend,
            state: ClientStateCell::new(),
            handler: RwLock::new(Arc::new(NoopHandler)),
            engine: Arc::new(Mutex::new(None)),
            teardown: DeferredTeardown::new(),
        })
    }

    pub(crate) fn backend(&self) -> &'static str {
        self.backend
    }

    pub(crate) fn state(&self) -> ClientState {
        self.state.get()
    }

    pub(crate) fn set_handler(&self, handler: Arc<dyn ClientHandler>) {
        *self.handler.write() = handler;
    }

    fn handler(&self) -> Arc<dyn ClientHandler> {
        self.handler.read().clone()
    }

    /// See [`ClientStateCell::begin_connect`]
    pub(crate) fn begin_connect(&self) -> Result<bool, TransportError> {
        self.state.begin_connect()
    }

    /// Starting the engine failed; back to `Disconnected`
    pub(crate) fn abort_connect(&self, error: TransportError) -> TransportError {
        let error = error.with_operation("connect");
        tracing::debug!("[CONNECT] {} connect failed: {}", self.backend, error);
        self.state.abort_connect();
        error
    }

    /// Take ownership of a started engine
    pub(crate) fn install(&self, engine: E) {
        if self.state.get() == ClientState::Closed {
            // closed while the engine was starting
            engine.shutdown();
            return;
        }
        *self.engine.lock() = Some(engine);
    }

    /// Run `f` against the installed engine, if any
    pub(crate) fn with_engine<R>(&self, f: impl FnOnce(&E) -> R) -> Option<R> {
        self.engine.lock().as_ref().map(f)
    }

    pub(crate) fn send_reliable(&self, payload: Bytes, immediate: bool) {
        if !self.state.is_connected() {
            tracing::trace!("[SEND] {} client not connected, dropping payload", self.backend);
            return;
        }
        if let Some(engine) = self.engine.lock().as_ref() {
            engine.send(payload, ReliabilityClass::from_immediate(immediate));
        }
    }

    /// Apply one engine event, enforcing the delivery rules
    pub(crate) fn handle(&self, event: ClientEngineEvent) {
        match event {
            ClientEngineEvent::Connect => {
                if self.state.mark_connected() {
                    tracing::debug!("[CONNECT] {} client connected", self.backend);
                    self.handler().on_connected();
                }
            }
            ClientEngineEvent::Encapsulated { buffer, address } => {
                if self.state.is_connected() {
                    self.handler().on_encapsulated(buffer, address);
                } else {
                    tracing::trace!("[RECV] {} client not connected, dropping {} bytes", self.backend, buffer.len());
                }
            }
            ClientEngineEvent::Disconnect { reason } => {
                if self.state.close().is_some() {
                    tracing::debug!("[CLOSE] {} client disconnected: {}", self.backend, reason);
                    self.handler().on_close_connection(&reason);
                    self.schedule_release();
                }
            }
        }
    }

    /// Feed engine events into [`handle`](Self::handle) until the engine stops
    pub(crate) fn dispatch(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<ClientEngineEvent>) {
        let core = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(core) = core.upgrade() else { break };
                core.handle(event);
            }
        });
    }

    /// Returns at once; the engine is released after the grace period
    pub(crate) fn close(&self) {
        if let Some(previous) = self.state.close() {
            tracing::debug!("[CLOSE] {} client closed from {:?}", self.backend, previous);
        }
        self.schedule_release();
    }

    fn schedule_release(&self) {
        let engine = self.engine.clone();
        let backend = self.backend;
        self.teardown.schedule(CLOSE_GRACE_PERIOD, move || {
            if let Some(engine) = engine.lock().take() {
                tracing::debug!("[TEARDOWN] {} client engine released", backend);
                engine.shutdown();
            }
        });
    }
}

/// Dropping is closing; the engine slot is shared with the teardown, which
/// still releases it after the grace period.
impl<E: ClientEngine> Drop for ClientCore<E> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Server lifecycle shared by every backend
pub(crate) struct ServerCore<E: ServerEngine> {
    backend: &'static str,
    options: ServerOptions,
    listening: AtomicBool,
    closed: AtomicBool,
    handler: RwLock<Arc<dyn ServerHandler>>,
    connections: RwLock<HashMap<SocketAddr, Arc<ConnectionHandle>>>,
    engine: Arc<Mutex<Option<E>>>,
    local_addr: RwLock<Option<SocketAddr>>,
    teardown: DeferredTeardown,
}

impl<E: ServerEngine> ServerCore<E> {
    pub(crate) fn new(backend: &'static str, options: ServerOptions) -> Arc<Self> {
        Arc::new(Self {
            backend,
            options,
            listening: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            handler: RwLock::new(Arc::new(NoopHandler)),
            connections: RwLock::new(HashMap::new()),
            engine: Arc::new(Mutex::new(None)),
            local_addr: RwLock::new(None),
            teardown: DeferredTeardown::new(),
        })
    }

    pub(crate) fn backend(&self) -> &'static str {
        self.backend
    }

    pub(crate) fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub(crate) fn set_handler(&self, handler: Arc<dyn ServerHandler>) {
        *self.handler.write() = handler;
    }

    fn handler(&self) -> Arc<dyn ServerHandler> {
        self.handler.read().clone()
    }

    /// Ok(true) when the caller should bind, Ok(false) when already listening
    pub(crate) fn begin_listen(&self) -> Result<bool, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::connection_error("server is closed", false));
        }
        self.options.advertisement.read().validate()?;
        Ok(self
            .listening
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }

    pub(crate) fn abort_listen(&self, error: TransportError) -> TransportError {
        let error = error.with_operation("listen");
        tracing::error!("[LISTEN] {} bind failed: {}", self.backend, error);
        self.listening.store(false, Ordering::Release);
        error
    }

    pub(crate) fn install(&self, engine: E) {
        *self.local_addr.write() = Some(engine.local_addr());
        if self.closed.load(Ordering::Acquire) {
            engine.shutdown();
            return;
        }
        *self.engine.lock() = Some(engine);
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    /// Overwrite the advertisement. One too long for a pong is rejected and
    /// the previous one stays in place.
    pub(crate) fn update_advertisement(&self, advertisement: Advertisement) -> Result<(), TransportError> {
        advertisement.validate()?;
        self.options
            .max_connections
            .store(advertisement.players_max.max(1) as usize, Ordering::Release);
        *self.options.advertisement.write() = advertisement;
        tracing::debug!("[ADVERTISE] {} advertisement updated", self.backend);
        Ok(())
    }

    pub(crate) fn advertisement(&self) -> Advertisement {
        self.options.advertisement.read().clone()
    }

    pub(crate) fn connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections.read().values().cloned().collect()
    }

    pub(crate) fn handle(&self, event: ServerEngineEvent) {
        if self.closed.load(Ordering::Acquire) {
            tracing::trace!("[RECV] {} server closed, dropping {:?}", self.backend, event);
            return;
        }

        match event {
            ServerEngineEvent::OpenConnection { address } => {
                let link = match self.engine.lock().as_ref() {
                    Some(engine) => engine.link(),
                    None => return,
                };
                // engines close a peer before the same address can open again
                let connection = Arc::new(ConnectionHandle::new(address, link));
                self.connections.write().insert(address, connection.clone());
                tracing::debug!("[ACCEPT] {} connection {}", self.backend, connection.id());
                self.handler().on_open_connection(connection);
            }
            ServerEngineEvent::Encapsulated { address, buffer } => {
                let connection = self.connections.read().get(&address).cloned();
                match connection {
                    Some(connection) if connection.is_connected() => {
                        self.handler().on_encapsulated(buffer, &connection);
                    }
                    _ => tracing::trace!("[RECV] no live connection for {}, dropping", address),
                }
            }
            ServerEngineEvent::CloseConnection { address, reason } => {
                let removed = self.connections.write().remove(&address);
                if let Some(connection) = removed {
                    connection.mark_closed();
                    tracing::debug!("[CLOSE] {} connection {} closed: {}", self.backend, connection.id(), reason);
                    self.handler().on_close_connection(connection, &reason);
                }
            }
            ServerEngineEvent::Close { reason } => {
                tracing::warn!("[CLOSE] {} server stopped: {}", self.backend, reason);
                self.closed.store(true, Ordering::Release);
                self.close_connections(&reason);
                self.handler().on_close(&reason);
                self.schedule_release(None);
            }
        }
    }

    pub(crate) fn dispatch(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<ServerEngineEvent>) {
        let core = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(core) = core.upgrade() else { break };
                core.handle(event);
            }
        });
    }

    /// Returns at once. Every live connection gets its close callback now;
    /// `on_close` fires once the engine is released.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("[CLOSE] {} server closing", self.backend);
        self.close_connections(&CloseReason::Normal);
        self.schedule_release(Some(self.handler()));
    }

    fn close_connections(&self, reason: &CloseReason) {
        let drained: Vec<_> = self.connections.write().drain().map(|(_, c)| c).collect();
        let handler = self.handler();
        for connection in drained {
            if connection.mark_closed() {
                handler.on_close_connection(connection, reason);
            }
        }
    }

    /// `notify` gets `on_close` after the release
    fn schedule_release(&self, notify: Option<Arc<dyn ServerHandler>>) {
        let engine = self.engine.clone();
        let backend = self.backend;
        self.teardown.schedule(CLOSE_GRACE_PERIOD, move || {
            if let Some(engine) = engine.lock().take() {
                tracing::debug!("[TEARDOWN] {} server engine released", backend);
                engine.shutdown();
            }
            if let Some(handler) = notify {
                handler.on_close(&CloseReason::Normal);
            }
        });
    }
}

impl<E: ServerEngine> Drop for ServerCore<E> {
    fn drop(&mut self) {
        self.close();
    }
}

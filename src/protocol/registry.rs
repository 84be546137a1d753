/// Backend registry
///
/// Maps a backend name to its client/server factories. Selecting a backend
/// never fails loudly: without a name the preferred native backend is tried
/// first and the pure-software one is used when it is missing.

use std::collections::HashMap;

use crate::adapters::{MemoryClient, MemoryServer};
use crate::advertisement::Advertisement;
use crate::error::{TransportError, TIMEOUT_ERROR_CODE};
use crate::protocol::adapter::{ClientAdapter, ServerAdapter};
use crate::transport::config::TransportConfig;

/// Tried first when no backend is named
pub const PREFERRED_BACKEND: &str = "udp";
/// Always available
pub const FALLBACK_BACKEND: &str = "memory";

pub type ClientFactory = fn(TransportConfig) -> Box<dyn ClientAdapter>;
pub type ServerFactory = fn(TransportConfig, Advertisement) -> Box<dyn ServerAdapter>;

/// Factories of one backend
#[derive(Debug, Clone, Copy)]
pub struct BackendPair {
    pub name: &'static str,
    pub client: ClientFactory,
    pub server: ServerFactory,
    /// `error_code()` of this backend's ping timeout
    pub timeout_code: &'static str,
}

impl BackendPair {
    pub fn create_client(&self, config: TransportConfig) -> Box<dyn ClientAdapter> {
        (self.client)(config)
    }

    pub fn create_server(&self, config: TransportConfig, advertisement: Advertisement) -> Box<dyn ServerAdapter> {
        (self.server)(config, advertisement)
    }

    pub fn is_timeout(&self, error: &TransportError) -> bool {
        error.error_code() == self.timeout_code
    }
}

fn memory_client(config: TransportConfig) -> Box<dyn ClientAdapter> {
    Box::new(MemoryClient::new(config))
}

fn memory_server(config: TransportConfig, advertisement: Advertisement) -> Box<dyn ServerAdapter> {
    Box::new(MemoryServer::new(config, advertisement))
}

fn memory_pair() -> BackendPair {
    BackendPair {
        name: FALLBACK_BACKEND,
        client: memory_client,
        server: memory_server,
        timeout_code: TIMEOUT_ERROR_CODE,
    }
}

/// Worker offload applies to the client only
#[cfg(feature = "udp")]
fn udp_client(config: TransportConfig) -> Box<dyn ClientAdapter> {
    use crate::adapters::{UdpClient, WorkerClient};

    if config.use_workers {
        Box::new(WorkerClient::new(config))
    } else {
        Box::new(UdpClient::new(config))
    }
}

#[cfg(feature = "udp")]
fn udp_server(config: TransportConfig, advertisement: Advertisement) -> Box<dyn ServerAdapter> {
    Box::new(crate::adapters::UdpServer::new(config, advertisement))
}

#[cfg(feature = "udp")]
fn udp_pair() -> BackendPair {
    BackendPair {
        name: PREFERRED_BACKEND,
        client: udp_client,
        server: udp_server,
        timeout_code: TIMEOUT_ERROR_CODE,
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<&'static str, BackendPair>,
}

impl BackendRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every backend compiled into this build
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        #[cfg(feature = "udp")]
        registry.insert(udp_pair());
        registry.insert(memory_pair());
        registry
    }

    fn insert(&mut self, pair: BackendPair) {
        self.backends.insert(pair.name, pair);
    }

    pub fn register(&mut self, pair: BackendPair) -> Result<(), TransportError> {
        if self.backends.contains_key(pair.name) {
            return Err(TransportError::config_error(
                "backend",
                format!("Backend '{}' already registered", pair.name),
            ));
        }
        tracing::debug!("[REGISTRY] registered backend {}", pair.name);
        self.insert(pair);
        Ok(())
    }

    pub fn load(&self, name: &str) -> Result<BackendPair, TransportError> {
        self.backends
            .get(name)
            .copied()
            .ok_or_else(|| TransportError::backend_unavailable(name, "not compiled in or not registered"))
    }

    /// Named backend, or the default when `identifier` is `None`.
    /// An unknown name yields `None`.
    pub fn select(&self, identifier: Option<&str>) -> Option<BackendPair> {
        match identifier {
            Some(name) => match self.load(name) {
                Ok(pair) => Some(pair),
                Err(e) => {
                    tracing::debug!("[REGISTRY] {}", e);
                    None
                }
            },
            None => self.select_or_fallback(PREFERRED_BACKEND),
        }
    }

    /// Like [`select`](Self::select), but falls back to the memory backend
    pub fn select_or_fallback(&self, name: &str) -> Option<BackendPair> {
        match self.load(name) {
            Ok(pair) => Some(pair),
            Err(e) => {
                tracing::warn!("[REGISTRY] {}; falling back to {}", e, FALLBACK_BACKEND);
                self.load(FALLBACK_BACKEND).ok()
            }
        }
    }

    /// Backend named by `config.backend`, default selection otherwise
    pub fn for_config(&self, config: &TransportConfig) -> Option<BackendPair> {
        self.select(config.backend.as_deref())
    }

    pub fn create_client(&self, config: TransportConfig) -> Result<Box<dyn ClientAdapter>, TransportError> {
        let pair = self.for_config(&config).ok_or_else(|| unknown_backend(&config))?;
        Ok(pair.create_client(config))
    }

    pub fn create_server(
        &self,
        config: TransportConfig,
        advertisement: Advertisement,
    ) -> Result<Box<dyn ServerAdapter>, TransportError> {
        let pair = self.for_config(&config).ok_or_else(|| unknown_backend(&config))?;
        Ok(pair.create_server(config, advertisement))
    }

    pub fn available_backends(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.backends.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

fn unknown_backend(config: &TransportConfig) -> TransportError {
    TransportError::config_error(
        "backend",
        format!("unknown backend '{}'", config.backend.as_deref().unwrap_or_default()),
    )
}

/// [`BackendRegistry::select`] over the built-in backends
pub fn select(identifier: Option<&str>) -> Option<BackendPair> {
    BackendRegistry::builtin().select(identifier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_unknown_backend_yields_none() {
        assert!(select(Some("carrier-pigeon")).is_none());
    }

    #[test]
    fn test_explicit_memory() {
        let pair = select(Some("memory")).unwrap();
        assert_eq!(pair.name, "memory");
    }

    #[cfg(feature = "udp")]
    #[test]
    fn test_default_prefers_udp() {
        assert_eq!(select(None).unwrap().name, "udp");
        assert_eq!(BackendRegistry::builtin().available_backends(), vec!["memory", "udp"]);
    }

    #[test]
    fn test_fallback_when_preferred_missing() {
        let mut registry = BackendRegistry::new();
        registry.register(memory_pair()).unwrap();

        assert!(registry.load("udp").unwrap_err().error_code() == "BACKEND_UNAVAILABLE");
        assert_eq!(registry.select(None).unwrap().name, "memory");
        assert_eq!(registry.select_or_fallback("udp").unwrap().name, "memory");
        assert!(registry.select(Some("udp")).is_none());
    }

    #[test]
    fn test_duplicate_registration() {
        let mut registry = BackendRegistry::builtin();
        assert!(registry.register(memory_pair()).is_err());
    }

    #[test]
    fn test_timeout_code() {
        let pair = select(Some("memory")).unwrap();
        assert!(pair.is_timeout(&TransportError::timeout_error("ping", Duration::from_millis(1000))));
        assert!(!pair.is_timeout(&TransportError::connection_error("refused", false)));
    }

    #[tokio::test]
    async fn test_create_client_for_config() {
        let registry = BackendRegistry::builtin();
        let client = registry
            .create_client(TransportConfig::new("127.0.0.1", 19132).with_backend("memory"))
            .unwrap();
        assert_eq!(client.backend(), "memory");
        assert!(registry
            .create_client(TransportConfig::new("127.0.0.1", 19132).with_backend("nope"))
            .is_err());
    }
}

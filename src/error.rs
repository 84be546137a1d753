use std::fmt;
use std::time::Duration;

/// Why a connection (or a listening socket) went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed locally
    Normal,
    /// Handshake or idle deadline elapsed
    Timeout,
    /// The peer announced the disconnect
    Remote(String),
    /// The server refused the handshake (incompatible protocol, server full)
    Refused(String),
    /// Socket or backend failure
    Error(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Normal => write!(f, "closed"),
            CloseReason::Timeout => write!(f, "connection timed out"),
            CloseReason::Remote(reason) => write!(f, "{}", reason),
            CloseReason::Refused(reason) => write!(f, "refused: {}", reason),
            CloseReason::Error(reason) => write!(f, "error: {}", reason),
        }
    }
}

/// Unified transport error
#[derive(Debug, thiserror::Error, Clone)]
pub enum TransportError {
    /// Bind/connect failures, operations on a closed adapter
    #[error("Connection error: {reason} (retryable: {retryable})")]
    Connection {
        reason: String,
        retryable: bool,
    },

    /// Frame-level failures inside a backend
    #[error("Protocol error ({protocol}): {reason}")]
    Protocol {
        protocol: String,
        reason: String,
    },

    #[error("Configuration error in field '{field}': {reason}")]
    Configuration {
        field: String,
        reason: String,
    },

    /// Deadline exceeded. The only failure `ping` surfaces.
    #[error("Operation '{operation}' timeout after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// A backend could not be loaded. Recovered by registry fallback.
    #[error("Backend '{backend}' unavailable: {reason}")]
    BackendUnavailable {
        backend: String,
        reason: String,
    },
}

impl TransportError {
    /// Whether the failed operation may succeed if repeated
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Connection { retryable, .. } => *retryable,
            TransportError::Protocol { .. } => true,
            TransportError::Configuration { .. } => false,
            TransportError::Timeout { .. } => true,
            TransportError::BackendUnavailable { .. } => false,
        }
    }

    /// Stable error code, also used as the registry's timeout kind
    pub fn error_code(&self) -> &'static str {
        match self {
            TransportError::Connection { .. } => "CONNECTION_ERROR",
            TransportError::Protocol { .. } => "PROTOCOL_ERROR",
            TransportError::Configuration { .. } => "CONFIG_ERROR",
            TransportError::Timeout { .. } => TIMEOUT_ERROR_CODE,
            TransportError::BackendUnavailable { .. } => "BACKEND_UNAVAILABLE",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }

    /// Attach the operation name to connection/protocol errors
    pub fn with_operation(mut self, op: &'static str) -> Self {
        match &mut self {
            TransportError::Connection { reason, .. } | TransportError::Protocol { reason, .. } => {
                if !reason.contains("operation:") {
                    *reason = format!("{} (operation: {})", reason, op);
                }
            }
            TransportError::Timeout { operation, .. } => {
                if operation.is_empty() {
                    *operation = op.to_string();
                }
            }
            _ => {}
        }
        self
    }
}

/// Error code carried by [`TransportError::Timeout`]
pub const TIMEOUT_ERROR_CODE: &str = "TIMEOUT_ERROR";

/// Convenience constructors
impl TransportError {
    pub fn connection_error(reason: impl Into<String>, retryable: bool) -> Self {
        Self::Connection {
            reason: reason.into(),
            retryable,
        }
    }

    pub fn protocol_error(protocol: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Protocol {
            protocol: protocol.into(),
            reason: reason.into(),
        }
    }

    pub fn config_error(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout_error(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    pub fn backend_unavailable(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            backend: backend.into(),
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        let retryable = matches!(
            error.kind(),
            std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::AddrInUse
        );

        TransportError::Connection {
            reason: format!("IO error: {}", error),
            retryable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let error: TransportError = refused.into();
        assert!(error.is_retryable());
        assert_eq!(error.error_code(), "CONNECTION_ERROR");

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let error: TransportError = denied.into();
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_timeout_code() {
        let error = TransportError::timeout_error("ping", Duration::from_millis(500));
        assert!(error.is_timeout());
        assert_eq!(error.error_code(), TIMEOUT_ERROR_CODE);
        assert_eq!(error.to_string(), "Operation 'ping' timeout after 500ms");
    }

    #[test]
    fn test_with_operation() {
        let error = TransportError::connection_error("socket gone", false).with_operation("listen");
        assert_eq!(
            error.to_string(),
            "Connection error: socket gone (operation: listen) (retryable: false)"
        );
    }

    #[test]
    fn test_close_reason_display() {
        assert_eq!(CloseReason::Timeout.to_string(), "connection timed out");
        assert_eq!(CloseReason::Refused("server full".into()).to_string(), "refused: server full");
    }
}

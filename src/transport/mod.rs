/// Transport primitives shared by every adapter
///
/// Configuration, client state, deadline racing, deferred teardown and the
/// worker bridge.

#[cfg(feature = "udp")]
pub mod bridge;
pub mod config;
pub mod connection_state;
pub mod teardown;
pub mod timeout;

pub use config::{ConfigError, TransportConfig};
pub use connection_state::ClientState;
pub use teardown::{DeferredTeardown, CLOSE_GRACE_PERIOD};
pub use timeout::{race, PingSlot, DEFAULT_PING_TIMEOUT};

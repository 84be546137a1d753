/// Backend-agnostic contract
///
/// Adapter traits, backend selection, reliability mapping and protocol
/// version gating.

pub mod adapter;
pub mod registry;
pub mod reliability;
pub mod version;

pub use adapter::{ClientAdapter, ServerAdapter};
pub use registry::{select, BackendPair, BackendRegistry, FALLBACK_BACKEND, PREFERRED_BACKEND};
pub use reliability::{ReliabilityClass, ReliabilityMapper};
pub use version::{protocol_version_for, GameVersion, CURRENT_PROTOCOL, LEGACY_PROTOCOL, PROTOCOL_THRESHOLD};

/// Reliability/priority mapping
///
/// Consumers only ever pick between two delivery classes. Each backend
/// translates that choice into its own native enumeration here.

use crate::backend::memory::MemoryPriority;
#[cfg(feature = "udp")]
use crate::packet::{PacketPriority, PacketReliability};

/// Delivery class observable at the adapter boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReliabilityClass {
    /// Reliable, ordered, flushed ahead of the send queue
    Immediate,
    /// Reliable, ordered, batched with the regular send queue
    ReliableOrdered,
}

impl ReliabilityClass {
    /// Map the `immediate` flag of `send_reliable`
    pub fn from_immediate(immediate: bool) -> Self {
        if immediate {
            ReliabilityClass::Immediate
        } else {
            ReliabilityClass::ReliableOrdered
        }
    }

    pub fn is_immediate(&self) -> bool {
        matches!(self, ReliabilityClass::Immediate)
    }
}

/// Translate a [`ReliabilityClass`] into a backend's native send parameters
pub trait ReliabilityMapper {
    type Native: Copy + std::fmt::Debug;

    fn map(class: ReliabilityClass) -> Self::Native;
}

/// UDP backend: RakNet style priority × reliability pair
#[cfg(feature = "udp")]
pub struct UdpMapper;

#[cfg(feature = "udp")]
impl ReliabilityMapper for UdpMapper {
    type Native = (PacketPriority, PacketReliability);

    fn map(class: ReliabilityClass) -> Self::Native {
        let priority = match class {
            ReliabilityClass::Immediate => PacketPriority::Immediate,
            ReliabilityClass::ReliableOrdered => PacketPriority::Medium,
        };
        (priority, PacketReliability::ReliableOrdered)
    }
}

/// Memory backend: binary priority, everything is reliable-ordered
pub struct MemoryMapper;

impl ReliabilityMapper for MemoryMapper {
    type Native = MemoryPriority;

    fn map(class: ReliabilityClass) -> Self::Native {
        match class {
            ReliabilityClass::Immediate => MemoryPriority::HIGH,
            ReliabilityClass::ReliableOrdered => MemoryPriority::NORMAL,
        }
    }
}

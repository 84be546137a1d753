/// UDP backend wire frames
///
/// Offline frames (ping/pong and the handshake) carry an 8 byte magic so
/// stray datagrams on the port are rejected before they reach a session.
/// Connected frames are a kind byte followed by their fields.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Offline message marker
pub const MAGIC: [u8; 8] = [0x00, 0xfe, 0xfd, 0xfc, 0x52, 0x4b, 0x4c, 0x31];

/// Frame kind byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Heartbeat = 0x00,
    UnconnectedPing = 0x01,
    ConnectRequest = 0x05,
    ConnectAccept = 0x06,
    ServerFull = 0x14,
    Disconnect = 0x15,
    IncompatibleProtocol = 0x19,
    UnconnectedPong = 0x1c,
    Data = 0x84,
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => FrameKind::Heartbeat,
            0x01 => FrameKind::UnconnectedPing,
            0x05 => FrameKind::ConnectRequest,
            0x06 => FrameKind::ConnectAccept,
            0x14 => FrameKind::ServerFull,
            0x15 => FrameKind::Disconnect,
            0x19 => FrameKind::IncompatibleProtocol,
            0x1c => FrameKind::UnconnectedPong,
            0x84 => FrameKind::Data,
            other => return Err(FrameError::UnknownKind(other)),
        })
    }
}

/// Native send priority. Lower sends sooner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum PacketPriority {
    /// Bypasses the send queue
    Immediate = 0,
    High = 1,
    Medium = 2,
    Low = 3,
}

impl TryFrom<u8> for PacketPriority {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => PacketPriority::Immediate,
            1 => PacketPriority::High,
            2 => PacketPriority::Medium,
            3 => PacketPriority::Low,
            other => return Err(FrameError::InvalidField { field: "priority", value: other }),
        })
    }
}

/// Native reliability code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketReliability {
    Unreliable = 0,
    UnreliableSequenced = 1,
    Reliable = 2,
    ReliableOrdered = 3,
    ReliableSequenced = 4,
}

impl TryFrom<u8> for PacketReliability {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => PacketReliability::Unreliable,
            1 => PacketReliability::UnreliableSequenced,
            2 => PacketReliability::Reliable,
            3 => PacketReliability::ReliableOrdered,
            4 => PacketReliability::ReliableSequenced,
            other => return Err(FrameError::InvalidField { field: "reliability", value: other }),
        })
    }
}

/// One UDP datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Heartbeat,
    UnconnectedPing { client_time: u64 },
    UnconnectedPong { client_time: u64, server_guid: u64, payload: Bytes },
    ConnectRequest { protocol: u8, client_guid: u64 },
    ConnectAccept { server_guid: u64 },
    IncompatibleProtocol { protocol: u8, server_guid: u64 },
    ServerFull,
    Disconnect,
    Data { reliability: PacketReliability, priority: PacketPriority, payload: Bytes },
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Heartbeat => FrameKind::Heartbeat,
            Frame::UnconnectedPing { .. } => FrameKind::UnconnectedPing,
            Frame::UnconnectedPong { .. } => FrameKind::UnconnectedPong,
            Frame::ConnectRequest { .. } => FrameKind::ConnectRequest,
            Frame::ConnectAccept { .. } => FrameKind::ConnectAccept,
            Frame::IncompatibleProtocol { .. } => FrameKind::IncompatibleProtocol,
            Frame::ServerFull => FrameKind::ServerFull,
            Frame::Disconnect => FrameKind::Disconnect,
            Frame::Data { .. } => FrameKind::Data,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u8(self.kind() as u8);

        match self {
            Frame::Heartbeat | Frame::Disconnect => {}
            Frame::UnconnectedPing { client_time } => {
                buf.put_u64(*client_time);
                buf.put_slice(&MAGIC);
            }
            Frame::UnconnectedPong { client_time, server_guid, payload } => {
                buf.put_u64(*client_time);
                buf.put_u64(*server_guid);
                buf.put_slice(&MAGIC);
                // servers reject advertisements over u16::MAX before they get here
                debug_assert!(payload.len() <= u16::MAX as usize);
                buf.put_u16(payload.len() as u16);
                buf.put_slice(payload);
            }
            Frame::ConnectRequest { protocol, client_guid } => {
                buf.put_slice(&MAGIC);
                buf.put_u8(*protocol);
                buf.put_u64(*client_guid);
            }
            Frame::ConnectAccept { server_guid } => {
                buf.put_slice(&MAGIC);
                buf.put_u64(*server_guid);
            }
            Frame::IncompatibleProtocol { protocol, server_guid } => {
                buf.put_slice(&MAGIC);
                buf.put_u8(*protocol);
                buf.put_u64(*server_guid);
            }
            Frame::ServerFull => {
                buf.put_slice(&MAGIC);
            }
            Frame::Data { reliability, priority, payload } => {
                buf.put_u8(*reliability as u8);
                buf.put_u8(*priority as u8);
                buf.put_slice(payload);
            }
        }

        buf.freeze()
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, FrameError> {
        let mut buf = datagram;
        if !buf.has_remaining() {
            return Err(FrameError::Empty);
        }
        let kind = FrameKind::try_from(buf.get_u8())?;

        let frame = match kind {
            FrameKind::Heartbeat => Frame::Heartbeat,
            FrameKind::Disconnect => Frame::Disconnect,
            FrameKind::UnconnectedPing => {
                need(&buf, 8 + MAGIC.len(), kind)?;
                let client_time = buf.get_u64();
                magic(&mut buf)?;
                Frame::UnconnectedPing { client_time }
            }
            FrameKind::UnconnectedPong => {
                need(&buf, 16 + MAGIC.len() + 2, kind)?;
                let client_time = buf.get_u64();
                let server_guid = buf.get_u64();
                magic(&mut buf)?;
                let len = buf.get_u16() as usize;
                need(&buf, len, kind)?;
                let payload = Bytes::copy_from_slice(&buf[..len]);
                Frame::UnconnectedPong { client_time, server_guid, payload }
            }
            FrameKind::ConnectRequest => {
                need(&buf, MAGIC.len() + 9, kind)?;
                magic(&mut buf)?;
                Frame::ConnectRequest { protocol: buf.get_u8(), client_guid: buf.get_u64() }
            }
            FrameKind::ConnectAccept => {
                need(&buf, MAGIC.len() + 8, kind)?;
                magic(&mut buf)?;
                Frame::ConnectAccept { server_guid: buf.get_u64() }
            }
            FrameKind::IncompatibleProtocol => {
                need(&buf, MAGIC.len() + 9, kind)?;
                magic(&mut buf)?;
                Frame::IncompatibleProtocol { protocol: buf.get_u8(), server_guid: buf.get_u64() }
            }
            FrameKind::ServerFull => {
                need(&buf, MAGIC.len(), kind)?;
                magic(&mut buf)?;
                Frame::ServerFull
            }
            FrameKind::Data => {
                need(&buf, 2, kind)?;
                let reliability = PacketReliability::try_from(buf.get_u8())?;
                let priority = PacketPriority::try_from(buf.get_u8())?;
                Frame::Data { reliability, priority, payload: Bytes::copy_from_slice(buf) }
            }
        };

        Ok(frame)
    }
}

fn need(buf: &&[u8], len: usize, kind: FrameKind) -> Result<(), FrameError> {
    if buf.remaining() < len {
        return Err(FrameError::Truncated { kind, needed: len, available: buf.remaining() });
    }
    Ok(())
}

fn magic(buf: &mut &[u8]) -> Result<(), FrameError> {
    if buf[..MAGIC.len()] != MAGIC {
        return Err(FrameError::BadMagic);
    }
    buf.advance(MAGIC.len());
    Ok(())
}

/// Frame decoding errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Empty datagram")]
    Empty,

    #[error("Unknown frame kind: 0x{0:02x}")]
    UnknownKind(u8),

    #[error("Truncated {kind:?} frame: need {needed} bytes, have {available}")]
    Truncated {
        kind: FrameKind,
        needed: usize,
        available: usize,
    },

    #[error("Offline frame without magic")]
    BadMagic,

    #[error("Invalid {field} value: {value}")]
    InvalidField { field: &'static str, value: u8 },
}

impl From<FrameError> for crate::error::TransportError {
    fn from(error: FrameError) -> Self {
        crate::error::TransportError::protocol_error("udp", error.to_string())
    }
}

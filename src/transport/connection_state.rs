/// Client connection state
///
/// Lock-free state cell shared between the caller and the dispatch task.
/// `Closed` is terminal; delivery is allowed only in `Connected`.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Closed = 3,
}

impl ClientState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ClientState::Disconnected,
            1 => ClientState::Connecting,
            2 => ClientState::Connected,
            _ => ClientState::Closed,
        }
    }
}

#[derive(Debug)]
pub struct ClientStateCell {
    state: AtomicU8,
}

impl Default for ClientStateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientStateCell {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ClientState::Disconnected as u8),
        }
    }

    pub fn get(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.get() == ClientState::Connected
    }

    /// `Disconnected -> Connecting`.
    ///
    /// Ok(true) when the caller should start the handshake, Ok(false) when a
    /// handshake is already running or done, Err once closed.
    pub fn begin_connect(&self) -> Result<bool, TransportError> {
        match self.transition(ClientState::Disconnected, ClientState::Connecting) {
            Ok(()) => Ok(true),
            Err(ClientState::Connecting) | Err(ClientState::Connected) => Ok(false),
            Err(_) => Err(TransportError::connection_error("client is closed", false)),
        }
    }

    /// Roll a failed handshake start back to `Disconnected`
    pub fn abort_connect(&self) {
        let _ = self.transition(ClientState::Connecting, ClientState::Disconnected);
    }

    /// `Connecting -> Connected`. False if the client was closed meanwhile.
    pub fn mark_connected(&self) -> bool {
        self.transition(ClientState::Connecting, ClientState::Connected).is_ok()
    }

    /// Move to `Closed`, returning the state it left.
    /// `None` if it was already closed.
    pub fn close(&self) -> Option<ClientState> {
        let previous = ClientState::from_u8(self.state.swap(ClientState::Closed as u8, Ordering::AcqRel));
        (previous != ClientState::Closed).then_some(previous)
    }

    fn transition(&self, from: ClientState, to: ClientState) -> Result<(), ClientState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(ClientState::from_u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let cell = ClientStateCell::new();
        assert_eq!(cell.get(), ClientState::Disconnected);
        assert!(!cell.is_connected());

        assert!(cell.begin_connect().unwrap());
        assert!(!cell.begin_connect().unwrap());
        assert!(cell.mark_connected());
        assert!(cell.is_connected());
        assert!(!cell.begin_connect().unwrap());

        assert_eq!(cell.close(), Some(ClientState::Connected));
        assert_eq!(cell.close(), None);
        assert!(cell.begin_connect().is_err());
    }

    #[test]
    fn test_close_while_connecting_blocks_connected() {
        let cell = ClientStateCell::new();
        cell.begin_connect().unwrap();
        cell.close();
        assert!(!cell.mark_connected());
        assert_eq!(cell.get(), ClientState::Closed);
    }

    #[test]
    fn test_abort_connect() {
        let cell = ClientStateCell::new();
        cell.begin_connect().unwrap();
        cell.abort_connect();
        assert_eq!(cell.get(), ClientState::Disconnected);
        assert!(cell.begin_connect().unwrap());
    }
}

/// Server advertisement
///
/// Discovery metadata answered to unconnected pings. The server keeps one
/// instance and replaces it wholesale on every update.

use std::fmt;

use crate::error::TransportError;
use crate::transport::config::TransportConfig;

/// Longest rendered advertisement a pong can carry
pub const MAX_ADVERTISEMENT_LEN: usize = u16::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Advertisement {
    pub motd: String,
    pub level_name: String,
    /// Globally unique server id
    pub server_id: u64,
    /// Game protocol number
    pub protocol: u32,
    /// Game version string
    pub version: String,
    pub players_online: u32,
    pub players_max: u32,
    pub game_mode: String,
    pub port_v4: u16,
    pub port_v6: u16,
}

impl Default for Advertisement {
    fn default() -> Self {
        Self {
            motd: "Dedicated Server".to_string(),
            level_name: "world".to_string(),
            server_id: 0,
            protocol: 0,
            version: "1.21.50".to_string(),
            players_online: 0,
            players_max: crate::transport::config::DEFAULT_MAX_CONNECTIONS as u32,
            game_mode: "Survival".to_string(),
            port_v4: 19132,
            port_v6: 19133,
        }
    }
}

impl Advertisement {
    pub fn new(motd: impl Into<String>, level_name: impl Into<String>) -> Self {
        Self {
            motd: motd.into(),
            level_name: level_name.into(),
            ..Self::default()
        }
    }

    /// Seed an advertisement from a server config
    pub fn for_config(config: &TransportConfig) -> Self {
        Self {
            version: config.version.to_string(),
            players_max: config.max_connections as u32,
            port_v4: config.port,
            server_id: rand::random(),
            ..Self::default()
        }
    }

    pub fn with_server_id(mut self, server_id: u64) -> Self {
        self.server_id = server_id;
        self
    }

    pub fn with_players(mut self, online: u32, max: u32) -> Self {
        self.players_online = online;
        self.players_max = max;
        self
    }

    pub fn with_version(mut self, protocol: u32, version: impl Into<String>) -> Self {
        self.protocol = protocol;
        self.version = version.into();
        self
    }

    /// Reject advertisements that would not fit in a pong whole
    pub fn validate(&self) -> Result<(), TransportError> {
        let len = self.to_string().len();
        if len > MAX_ADVERTISEMENT_LEN {
            return Err(TransportError::config_error(
                "advertisement",
                format!("renders to {} bytes, a pong carries at most {}", len, MAX_ADVERTISEMENT_LEN),
            ));
        }
        Ok(())
    }
}

/// `MCPE;motd;protocol;version;online;max;server id;level;game mode;1;port v4;port v6;`
impl fmt::Display for Advertisement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MCPE;{};{};{};{};{};{};{};{};1;{};{};",
            self.motd,
            self.protocol,
            self.version,
            self.players_online,
            self.players_max,
            self.server_id,
            self.level_name,
            self.game_mode,
            self.port_v4,
            self.port_v6,
        )
    }
}

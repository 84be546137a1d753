/// Game version parsing and protocol-version gating
///
/// The transport protocol id depends only on which side of
/// [`PROTOCOL_THRESHOLD`] the consumer's game version falls.

use std::fmt;
use std::str::FromStr;

use crate::transport::config::ConfigError;

/// Protocol id spoken by game versions below the threshold
pub const LEGACY_PROTOCOL: u8 = 10;
/// Protocol id spoken by game versions at or above the threshold
pub const CURRENT_PROTOCOL: u8 = 11;
/// First game version speaking [`CURRENT_PROTOCOL`]
pub const PROTOCOL_THRESHOLD: GameVersion = GameVersion::new(1, 19, 30);

/// `major.minor.patch` game version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GameVersion {
    major: u16,
    minor: u16,
    patch: u16,
}

impl GameVersion {
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self { major, minor, patch }
    }

    pub fn at_least(&self, other: &GameVersion) -> bool {
        self >= other
    }

    /// Transport protocol id for this version
    pub fn protocol_version(&self) -> u8 {
        protocol_version_for(self)
    }
}

impl Default for GameVersion {
    fn default() -> Self {
        Self::new(1, 21, 50)
    }
}

/// Pick the protocol id for a game version
pub fn protocol_version_for(version: &GameVersion) -> u8 {
    if version.at_least(&PROTOCOL_THRESHOLD) {
        CURRENT_PROTOCOL
    } else {
        LEGACY_PROTOCOL
    }
}

impl fmt::Display for GameVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for GameVersion {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidValue {
            field: "version".to_string(),
            value: format!("\"{}\"", s),
            reason: reason.to_string(),
            suggestion: "use a version like '1.21.50'".to_string(),
        };

        let mut parts = [0u16; 3];
        let mut count = 0;
        for part in s.trim().split('.') {
            if count == parts.len() {
                return Err(invalid("too many components"));
            }
            parts[count] = part.parse().map_err(|_| invalid("components must be numbers"))?;
            count += 1;
        }
        // "1.20" is accepted as "1.20.0"
        if count < 2 {
            return Err(invalid("expected at least major.minor"));
        }

        Ok(Self::new(parts[0], parts[1], parts[2]))
    }
}

impl TryFrom<String> for GameVersion {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<GameVersion> for String {
    fn from(version: GameVersion) -> Self {
        version.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_versions() {
        assert_eq!("1.21.50".parse::<GameVersion>().unwrap(), GameVersion::new(1, 21, 50));
        assert_eq!("1.20".parse::<GameVersion>().unwrap(), GameVersion::new(1, 20, 0));
        assert!("1".parse::<GameVersion>().is_err());
        assert!("1.x.0".parse::<GameVersion>().is_err());
        assert!("1.2.3.4".parse::<GameVersion>().is_err());
    }

    #[test]
    fn test_protocol_gate() {
        assert_eq!(protocol_version_for(&GameVersion::new(1, 19, 20)), LEGACY_PROTOCOL);
        assert_eq!(protocol_version_for(&GameVersion::new(1, 19, 29)), LEGACY_PROTOCOL);
        assert_eq!(protocol_version_for(&GameVersion::new(1, 19, 30)), CURRENT_PROTOCOL);
        assert_eq!(protocol_version_for(&GameVersion::new(1, 21, 50)), CURRENT_PROTOCOL);
        // numeric, not lexical
        assert_eq!(protocol_version_for(&GameVersion::new(1, 9, 100)), LEGACY_PROTOCOL);
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&GameVersion::new(1, 19, 30)).unwrap();
        assert_eq!(json, "\"1.19.30\"");
        let back: GameVersion = serde_json::from_str(&json).unwrap();
        assert_eq!(back, PROTOCOL_THRESHOLD);
    }
}

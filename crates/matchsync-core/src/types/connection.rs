//! Connection state types

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Physical interface carrying the current connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Wifi,
    Cellular,
    Wired,
    Other,
}

/// Estimated link quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    Unknown,
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionType::Wifi => "wifi",
            ConnectionType::Cellular => "cellular",
            ConnectionType::Wired => "wired",
            ConnectionType::Other => "other",
        };
        f.write_str(name)
    }
}

impl fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionQuality::Excellent => "excellent",
            ConnectionQuality::Good => "good",
            ConnectionQuality::Fair => "fair",
            ConnectionQuality::Poor => "poor",
            ConnectionQuality::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Process-wide connection state as derived by the connectivity monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub is_connected: bool,
    pub connection_type: ConnectionType,
    pub quality: ConnectionQuality,
    pub last_transition_at: DateTime<Utc>,
}

impl ConnectionState {
    pub fn connected(connection_type: ConnectionType, quality: ConnectionQuality) -> Self {
        Self {
            is_connected: true,
            connection_type,
            quality,
            last_transition_at: Utc::now(),
        }
    }

    pub fn disconnected() -> Self {
        Self {
            is_connected: false,
            connection_type: ConnectionType::Other,
            quality: ConnectionQuality::Unknown,
            last_transition_at: Utc::now(),
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_connected {
            write!(f, "Connected({}, {})", self.connection_type, self.quality)
        } else {
            write!(f, "Disconnected")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_display() {
        let state = ConnectionState::connected(ConnectionType::Wifi, ConnectionQuality::Excellent);
        assert_eq!(state.to_string(), "Connected(wifi, excellent)");
        assert_eq!(ConnectionState::disconnected().to_string(), "Disconnected");
    }
}

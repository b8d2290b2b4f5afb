//! Connection lifecycle states

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a device connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Init,
    Connecting,
    Connected,
    KeyExchange,
    RequestingSessionKey,
    RequestingAuthStatus,
    Authenticating,
    Authenticated,
    Reconnecting,
    Disconnected,
    ErrorTimeout,
    ErrorNotFound,
    ErrorTransport,
    ErrorPacketParse,
    ErrorSendRequest,
    ErrorAuthFailed,
}

impl ConnectionState {
    /// Name used in logs and the history file
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::KeyExchange => "KEY_EXCHANGE",
            Self::RequestingSessionKey => "REQUESTING_SESSION_KEY",
            Self::RequestingAuthStatus => "REQUESTING_AUTH_STATUS",
            Self::Authenticating => "AUTHENTICATING",
            Self::Authenticated => "AUTHENTICATED",
            Self::Reconnecting => "RECONNECTING",
            Self::Disconnected => "DISCONNECTED",
            Self::ErrorTimeout => "ERROR_TIMEOUT",
            Self::ErrorNotFound => "ERROR_NOT_FOUND",
            Self::ErrorTransport => "ERROR_TRANSPORT",
            Self::ErrorPacketParse => "ERROR_PACKET_PARSE",
            Self::ErrorSendRequest => "ERROR_SEND_REQUEST",
            Self::ErrorAuthFailed => "ERROR_AUTH_FAILED",
        }
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        matches!(
            self,
            Self::ErrorTimeout
                | Self::ErrorNotFound
                | Self::ErrorTransport
                | Self::ErrorPacketParse
                | Self::ErrorSendRequest
                | Self::ErrorAuthFailed
        )
    }

    /// Somewhere between transport connect and authentication
    #[must_use]
    pub fn is_establishing(self) -> bool {
        matches!(
            self,
            Self::Connecting
                | Self::Connected
                | Self::KeyExchange
                | Self::RequestingSessionKey
                | Self::RequestingAuthStatus
                | Self::Authenticating
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_names_match_display() {
        for state in [
            ConnectionState::Init,
            ConnectionState::RequestingSessionKey,
            ConnectionState::ErrorAuthFailed,
        ] {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{state}\""));
        }
    }

    #[test]
    fn test_classification() {
        assert!(ConnectionState::ErrorSendRequest.is_error());
        assert!(!ConnectionState::Authenticated.is_error());
        assert!(ConnectionState::KeyExchange.is_establishing());
        assert!(!ConnectionState::Reconnecting.is_establishing());
    }
}

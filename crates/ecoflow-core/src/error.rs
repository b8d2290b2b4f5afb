//! Error types for the connection engine

use crate::state::ConnectionState;
use ecoflow_protocol::{ProtocolError, TransportError};
use std::fmt;
use thiserror::Error;

/// Reason reported by the device when authentication is refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    /// Response carried no payload at all
    Empty,
    /// Single status byte other than success
    Status(u8),
    /// Response longer than the expected single byte
    Malformed(Vec<u8>),
}

impl AuthFailure {
    /// Classify an auth response; `None` means the device accepted us
    #[must_use]
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        match payload {
            [0x00] => None,
            [] => Some(Self::Empty),
            [status] => Some(Self::Status(*status)),
            other => Some(Self::Malformed(other.to_vec())),
        }
    }
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty response"),
            Self::Status(status) => write!(f, "status {status:#04X}"),
            Self::Malformed(payload) => write!(f, "unexpected response {payload:02X?}"),
        }
    }
}

/// Errors surfaced by a connection
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Transport error: {0}")]
    Transport(TransportError),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Authentication failed: {0}")]
    AuthFailed(AuthFailure),

    #[error("Key table is required for ECDH devices")]
    MissingKeyTable,

    #[error("Connection is not established (state {0})")]
    NotConnected(ConnectionState),

    #[error("Connection attempt cancelled by disconnect")]
    Cancelled,

    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<ConnectionError>,
    },
}

impl From<TransportError> for ConnectionError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::NotFound(what) => Self::NotFound(what),
            TransportError::Timeout => Self::Timeout("transport"),
            other => Self::Transport(other),
        }
    }
}

impl ConnectionError {
    /// Whether another establishment attempt can succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(TransportError::Unsupported(_)) => false,
            Self::Protocol(ProtocolError::UnsupportedCurve(_)) => false,
            Self::AuthFailed(_) | Self::MissingKeyTable | Self::Cancelled | Self::Exhausted { .. } => {
                false
            }
            _ => true,
        }
    }

    /// State the connection enters when an attempt fails with this error
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        match self {
            Self::Timeout(_) => ConnectionState::ErrorTimeout,
            Self::NotFound(_) => ConnectionState::ErrorNotFound,
            Self::Protocol(_) | Self::MissingKeyTable => ConnectionState::ErrorPacketParse,
            Self::AuthFailed(_) => ConnectionState::ErrorAuthFailed,
            Self::Cancelled => ConnectionState::Disconnected,
            Self::Exhausted { last, .. } => last.state(),
            Self::Transport(_) | Self::NotConnected(_) => ConnectionState::ErrorTransport,
        }
    }
}

/// Errors decoding a device message into fields
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Record too short for {message}: need {needed} bytes, got {len}")]
    RecordTooShort {
        message: &'static str,
        needed: usize,
        len: usize,
    },

    #[error("Invalid {message} message: {reason}")]
    InvalidMessage {
        message: &'static str,
        reason: String,
    },

    #[error("Packet error: {0}")]
    Packet(#[from] ProtocolError),
}

/// Errors from the device client command path
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Unknown field: {0}")]
    UnknownField(String),

    #[error("Field is read-only: {0}")]
    ReadOnly(String),
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

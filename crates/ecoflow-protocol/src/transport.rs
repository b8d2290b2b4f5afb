//! Transport boundary: one writable and one notifying endpoint

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Capacity of the notification channel handed out by [`Transport::connect`]
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Transport-level failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Transport operation timed out")]
    Timeout,

    #[error("Transport I/O error: {0}")]
    Io(String),

    #[error("Transport disconnected")]
    Disconnected,

    #[error("Unsupported transport capability: {0}")]
    Unsupported(String),
}

/// Events delivered by a connected transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Bytes received on the notify endpoint
    Notification(Vec<u8>),
    /// The link dropped without being asked to
    Disconnected,
}

/// A connected-on-demand link to a single device
///
/// Implementations never have more than one write in flight; the connection
/// layer serializes calls to [`Transport::write`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect and enable notifications
    ///
    /// The returned receiver yields notifications until the link drops.
    async fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>, TransportError>;

    /// Write bytes to the write endpoint
    async fn write(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Tear down the link
    async fn disconnect(&self) -> Result<(), TransportError>;
}

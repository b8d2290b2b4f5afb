//! Common types used throughout the protocol

use thiserror::Error;

/// Protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("CRC mismatch: expected {expected:04X}, got {actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    #[error("Header CRC8 mismatch: expected {expected:02X}, got {actual:02X}")]
    HeaderCrcMismatch { expected: u8, actual: u8 },

    #[error("Frame too short: {0} bytes")]
    FrameTooShort(usize),

    #[error("Missing frame prefix")]
    MissingPrefix,

    #[error("Unsupported packet version: {0:#04X}")]
    UnsupportedVersion(u8),

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Cipher error: {0}")]
    Cipher(String),

    #[error("Session key is not established")]
    NoSession,

    #[error("Unsupported key exchange curve: {0}")]
    UnsupportedCurve(u8),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Key table too short for offset {offset:#06X} (table is {len} bytes)")]
    KeyTableTooShort { offset: usize, len: usize },

    #[error("Unexpected handshake response: {0}")]
    UnexpectedResponse(String),
}

/// Message routing address used in the `src`/`dst` packet fields
pub mod address {
    /// The client application
    pub const APP: u8 = 0x21;
    /// Main controller / IoT module
    pub const IOT: u8 = 0x35;
}

//! EcoFlow BLE wire protocol
//!
//! This crate implements the framing, checksums, encryption and key
//! agreement used to talk to EcoFlow power stations over Bluetooth LE.

#[cfg(feature = "ble")]
pub mod ble;
pub mod commands;
pub mod crc;
pub mod ecdh;
pub mod enc_packet;
pub mod packet;
pub mod reassembler;
pub mod session;
pub mod transport;
pub mod types;

pub use commands::Command;
pub use enc_packet::{EncPacket, FrameType};
pub use packet::Packet;
pub use reassembler::{Candidate, Framing, Reassembler};
pub use session::{EcdhHandshake, KeyStrategy, KeyTable, Padding, Session};
pub use transport::{Transport, TransportError, TransportEvent};
pub use types::*;

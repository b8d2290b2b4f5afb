//! EcoFlow device engine
//!
//! This crate drives connections to EcoFlow devices on top of the
//! wire-level `ecoflow-protocol` crate: handshake and reconnect lifecycle,
//! field decoding with change tracking, and observers.

pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod field;
pub mod persistence;
pub mod registry;
pub mod state;
pub mod tasks;
pub mod throttle;

pub use client::DeviceClient;
pub use config::ConnectionConfig;
pub use connection::{Connection, DeviceIdentity, ProtocolProfile};
pub use device::{Device, DeviceEvent, DeviceTable, ObserverId};
pub use dispatch::{DecoderBinding, MessageBinding, PacketFilter, RecordBinding, Scalar};
pub use error::{AuthFailure, ClientError, ConfigError, ConnectionError, DecodeError};
pub use field::{FieldStore, FieldValue};
pub use registry::DeviceRegistry;
pub use state::ConnectionState;

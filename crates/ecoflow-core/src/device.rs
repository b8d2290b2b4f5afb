//! Device tables and device instances

use crate::connection::ProtocolProfile;
use crate::dispatch::{Applied, DecoderBinding};
use crate::error::{ClientError, DecodeError};
use crate::field::{FieldStore, FieldValue};
use crate::state::ConnectionState;
use crate::throttle::UpdateTracker;
use ecoflow_protocol::{Framing, KeyStrategy, Packet};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Builds the outbound packet that sets a field, `None` when read-only
pub type CommandEncoder = fn(&str, &FieldValue) -> Option<Packet>;

/// Static description of a device type
///
/// Built once and never mutated; instances share it through an `Arc`.
pub struct DeviceTable {
    type_name: &'static str,
    serial_prefixes: Vec<&'static str>,
    profile: ProtocolProfile,
    bindings: Vec<Box<dyn DecoderBinding>>,
    encoder: Option<CommandEncoder>,
}

impl fmt::Debug for DeviceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceTable")
            .field("type_name", &self.type_name)
            .field("serial_prefixes", &self.serial_prefixes)
            .field("profile", &self.profile)
            .field("bindings", &self.bindings.len())
            .finish_non_exhaustive()
    }
}

impl DeviceTable {
    #[must_use]
    pub fn builder(type_name: &'static str) -> DeviceTableBuilder {
        DeviceTableBuilder {
            table: DeviceTable {
                type_name,
                serial_prefixes: Vec::new(),
                profile: ProtocolProfile {
                    framing: Framing::Wrapped,
                    key_strategy: KeyStrategy::Ecdh,
                    xor_payload: false,
                },
                bindings: Vec::new(),
                encoder: None,
            },
        }
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    #[must_use]
    pub fn serial_prefixes(&self) -> &[&'static str] {
        &self.serial_prefixes
    }

    #[must_use]
    pub fn profile(&self) -> ProtocolProfile {
        self.profile
    }

    /// Every declared field, in binding order
    #[must_use]
    pub fn field_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        for name in self.bindings.iter().flat_map(|b| b.field_names()) {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    /// Resolve a field name to its declared static name
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&'static str> {
        self.bindings
            .iter()
            .flat_map(|b| b.field_names())
            .find(|n| *n == name)
    }

    /// Outbound packet that sets `field` to `value`
    pub fn encode_command(&self, field: &str, value: &FieldValue) -> Result<Packet, ClientError> {
        if self.field(field).is_none() {
            return Err(ClientError::UnknownField(field.to_string()));
        }
        self.encoder
            .and_then(|encode| encode(field, value))
            .ok_or_else(|| ClientError::ReadOnly(field.to_string()))
    }

    fn bindings_for<'a>(
        &'a self,
        packet: &'a Packet,
    ) -> impl Iterator<Item = &'a dyn DecoderBinding> + 'a {
        self.bindings
            .iter()
            .map(|b| &**b)
            .filter(move |b| b.filter().matches(packet))
    }
}

/// Builder for [`DeviceTable`]
pub struct DeviceTableBuilder {
    table: DeviceTable,
}

impl DeviceTableBuilder {
    /// Serial numbers starting with `prefix` belong to this type
    #[must_use]
    pub fn serial_prefix(mut self, prefix: &'static str) -> Self {
        self.table.serial_prefixes.push(prefix);
        self
    }

    #[must_use]
    pub fn framing(mut self, framing: Framing) -> Self {
        self.table.profile.framing = framing;
        self
    }

    #[must_use]
    pub fn key_strategy(mut self, key_strategy: KeyStrategy) -> Self {
        self.table.profile.key_strategy = key_strategy;
        self
    }

    #[must_use]
    pub fn xor_payload(mut self, xor: bool) -> Self {
        self.table.profile.xor_payload = xor;
        self
    }

    #[must_use]
    pub fn binding(mut self, binding: impl DecoderBinding + 'static) -> Self {
        self.table.bindings.push(Box::new(binding));
        self
    }

    #[must_use]
    pub fn encoder(mut self, encoder: CommandEncoder) -> Self {
        self.table.encoder = Some(encoder);
        self
    }

    #[must_use]
    pub fn build(self) -> DeviceTable {
        self.table
    }
}

/// Observer handle returned by [`Device::register`]
pub type ObserverId = u64;

/// Field change callback
pub type Observer = Arc<dyn Fn(&'static str, &FieldValue) + Send + Sync>;

/// Events broadcast by a device
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceEvent {
    FieldChanged {
        field: &'static str,
        value: FieldValue,
    },
    StateChanged {
        state: ConnectionState,
    },
}

/// One device instance: current values, throttle state and observers
pub struct Device {
    serial: String,
    table: Arc<DeviceTable>,
    fields: FieldStore,
    tracker: UpdateTracker,
    observers: HashMap<&'static str, Vec<(ObserverId, Observer)>>,
    next_observer: ObserverId,
    event_tx: broadcast::Sender<DeviceEvent>,
}

impl Device {
    #[must_use]
    pub fn new(table: Arc<DeviceTable>, serial: impl Into<String>) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            serial: serial.into(),
            table,
            fields: FieldStore::new(),
            tracker: UpdateTracker::new(),
            observers: HashMap::new(),
            next_observer: 1,
            event_tx,
        }
    }

    #[must_use]
    pub fn serial(&self) -> &str {
        &self.serial
    }

    #[must_use]
    pub fn table(&self) -> &Arc<DeviceTable> {
        &self.table
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    #[must_use]
    pub fn fields(&self) -> HashMap<&'static str, FieldValue> {
        self.fields.snapshot()
    }

    /// Dispatch a packet to every binding registered for its message type
    ///
    /// Returns the fields that changed. Observers and subscribers are
    /// notified for each of them, even when a later binding fails.
    pub fn handle_packet(&mut self, packet: &Packet) -> Result<Vec<&'static str>, DecodeError> {
        let table = Arc::clone(&self.table);
        let mut result = Ok(());
        let mut matched = false;

        for binding in table.bindings_for(packet) {
            matched = true;
            match binding.apply(packet.payload(), &mut self.fields, &mut self.tracker) {
                Ok(Applied::Processed) => {}
                Ok(Applied::Throttled) => {
                    tracing::trace!("{}: {} throttled", self.serial, binding.message_type());
                }
                Err(e) => {
                    tracing::warn!(
                        "{}: failed to decode {}: {}",
                        self.serial,
                        binding.message_type(),
                        e
                    );
                    result = Err(e);
                }
            }
        }
        if !matched {
            tracing::debug!(
                "{}: no binding for cmd_set={:#04X} cmd_id={:#04X}",
                self.serial,
                packet.cmd_set(),
                packet.cmd_id()
            );
        }

        let updated = self.fields.take_updated();
        for &name in &updated {
            if let Some(value) = self.fields.get(name).cloned() {
                self.notify(name, &value);
            }
        }
        result.map(|()| updated)
    }

    fn notify(&self, field: &'static str, value: &FieldValue) {
        if let Some(observers) = self.observers.get(field) {
            for (_, observer) in observers {
                observer(field, value);
            }
        }
        let _ = self.event_tx.send(DeviceEvent::FieldChanged {
            field,
            value: value.clone(),
        });
    }

    /// Publish a connection state change to subscribers
    pub fn publish_state(&self, state: ConnectionState) {
        let _ = self.event_tx.send(DeviceEvent::StateChanged { state });
    }

    /// Call `observer` whenever `field` changes
    pub fn register(&mut self, field: &str, observer: Observer) -> Result<ObserverId, ClientError> {
        let name = self
            .table
            .field(field)
            .ok_or_else(|| ClientError::UnknownField(field.to_string()))?;
        let id = self.next_observer;
        self.next_observer += 1;
        self.observers.entry(name).or_default().push((id, observer));
        Ok(id)
    }

    /// Remove an observer; returns whether it was registered
    pub fn unregister(&mut self, field: &str, id: ObserverId) -> bool {
        let Some(observers) = self.observers.get_mut(field) else {
            return false;
        };
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        before != observers.len()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.event_tx.subscribe()
    }

    /// Reset throttling so the next message of every type is processed
    pub fn allow_next_update(&mut self) {
        self.tracker.allow_next_update();
    }
}

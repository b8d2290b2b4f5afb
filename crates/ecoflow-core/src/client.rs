//! Device client: a connection bound to a device table

use crate::config::ConnectionConfig;
use crate::connection::{Connection, DeviceIdentity};
use crate::device::{Device, DeviceEvent, DeviceTable, ObserverId};
use crate::error::{ClientError, ConnectionError};
use crate::field::FieldValue;
use crate::state::ConnectionState;
use ecoflow_protocol::{KeyTable, Packet, Transport};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// High-level handle to one device
///
/// Decoded packets update the device's fields in the background. Observer
/// callbacks run on that background task while the device is locked, so they
/// must not call back into the client.
pub struct DeviceClient {
    connection: Connection,
    device: Arc<Mutex<Device>>,
    pump: JoinHandle<()>,
}

impl DeviceClient {
    /// Create an idle client; call [`DeviceClient::connect`] to start
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        table: Arc<DeviceTable>,
        identity: DeviceIdentity,
        transport: Arc<dyn Transport>,
        config: ConnectionConfig,
        key_table: Option<Arc<KeyTable>>,
    ) -> Self {
        let device = Arc::new(Mutex::new(Device::new(
            Arc::clone(&table),
            identity.serial.clone(),
        )));
        let connection = Connection::new(transport, table.profile(), identity, config, key_table);

        // Subscribe before anything can be sent
        let packets = connection.subscribe();
        let states = connection.watch_state();
        let pump = tokio::spawn(pump(
            connection.clone(),
            Arc::clone(&device),
            packets,
            states,
        ));

        Self {
            connection,
            device,
            pump,
        }
    }

    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.connection.connect().await
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    /// Wait until the connection reaches `state`
    pub async fn wait_for(
        &self,
        state: ConnectionState,
        limit: Duration,
    ) -> Result<(), ConnectionError> {
        self.connection.wait_for(state, limit).await
    }

    /// Send the command that sets `field`, then accept the next update early
    pub async fn set_field(
        &self,
        field: &str,
        value: impl Into<FieldValue>,
    ) -> Result<(), ClientError> {
        let value = value.into();
        let packet = lock(&self.device)
            .table()
            .encode_command(field, &value)?;
        tracing::info!("{}: set {} = {}", self.connection.serial(), field, value);
        self.connection.send_packet(packet).await?;
        lock(&self.device).allow_next_update();
        Ok(())
    }

    /// Send a raw application packet
    pub async fn send_packet(&self, packet: Packet) -> Result<(), ClientError> {
        Ok(self.connection.send_packet(packet).await?)
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<FieldValue> {
        lock(&self.device).field(name).cloned()
    }

    #[must_use]
    pub fn fields(&self) -> HashMap<&'static str, FieldValue> {
        lock(&self.device).fields()
    }

    /// Call `observer` whenever `field` changes
    pub fn register<F>(&self, field: &str, observer: F) -> Result<ObserverId, ClientError>
    where
        F: Fn(&'static str, &FieldValue) + Send + Sync + 'static,
    {
        lock(&self.device).register(field, Arc::new(observer))
    }

    pub fn unregister(&self, field: &str, id: ObserverId) -> bool {
        lock(&self.device).unregister(field, id)
    }

    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<DeviceEvent> {
        lock(&self.device).subscribe()
    }

    pub fn allow_next_update(&self) {
        lock(&self.device).allow_next_update();
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    #[must_use]
    pub fn serial(&self) -> &str {
        self.connection.serial()
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

impl Drop for DeviceClient {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

fn lock(device: &Mutex<Device>) -> MutexGuard<'_, Device> {
    device.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Feed received packets and state changes into the device
async fn pump(
    connection: Connection,
    device: Arc<Mutex<Device>>,
    mut packets: broadcast::Receiver<Packet>,
    mut states: watch::Receiver<ConnectionState>,
) {
    loop {
        tokio::select! {
            packet = packets.recv() => match packet {
                Ok(packet) => {
                    let result = lock(&device).handle_packet(&packet);
                    if result.is_err() {
                        connection.record_error();
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("{}: dropped {} packets", connection.serial(), skipped);
                }
                Err(RecvError::Closed) => break,
            },
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                let mut device = lock(&device);
                if state == ConnectionState::Authenticated {
                    device.allow_next_update();
                }
                device.publish_state(state);
            }
        }
    }
}

//! Bluetooth LE transport backed by btleplug

use async_trait::async_trait;
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::transport::{Transport, TransportError, TransportEvent, EVENT_CHANNEL_CAPACITY};

/// Write characteristic shared by the device families
pub const WRITE_UUID: Uuid = Uuid::from_u128(0x0000_0002_0000_1000_8000_0080_5f9b_34fb);
/// Notify characteristic shared by the device families
pub const NOTIFY_UUID: Uuid = Uuid::from_u128(0x0000_0003_0000_1000_8000_0080_5f9b_34fb);

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(500);

fn io(e: btleplug::Error) -> TransportError {
    TransportError::Io(e.to_string())
}

/// Get the default Bluetooth adapter
pub async fn get_adapter() -> Result<Adapter, TransportError> {
    let manager = Manager::new().await.map_err(io)?;
    let adapters = manager.adapters().await.map_err(io)?;
    adapters
        .into_iter()
        .next()
        .ok_or_else(|| TransportError::NotFound("no Bluetooth adapter".to_string()))
}

/// A device seen during a scan
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub name: String,
    pub address: String,
    pub rssi: Option<i16>,
}

/// Scan for nearby devices for `duration`
pub async fn scan(duration: Duration) -> Result<Vec<Advertisement>, TransportError> {
    let adapter = get_adapter().await?;
    adapter.start_scan(ScanFilter::default()).await.map_err(io)?;
    tokio::time::sleep(duration).await;

    let mut found = Vec::new();
    for peripheral in adapter.peripherals().await.map_err(io)? {
        if let Some(props) = peripheral.properties().await.map_err(io)? {
            found.push(Advertisement {
                name: props.local_name.unwrap_or_default(),
                address: peripheral.address().to_string(),
                rssi: props.rssi,
            });
        }
    }

    adapter.stop_scan().await.map_err(io)?;
    Ok(found)
}

struct Link {
    peripheral: Peripheral,
    write_char: Characteristic,
    reader: JoinHandle<()>,
}

/// BLE link to one device, addressed by MAC
pub struct BleTransport {
    address: String,
    scan_duration: Duration,
    link: Mutex<Option<Link>>,
}

impl BleTransport {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            scan_duration: Duration::from_secs(10),
            link: Mutex::new(None),
        }
    }

    /// Longest time to wait for the device to advertise
    #[must_use]
    pub fn with_scan_duration(mut self, duration: Duration) -> Self {
        self.scan_duration = duration;
        self
    }

    async fn find_peripheral(&self, adapter: &Adapter) -> Result<Peripheral, TransportError> {
        adapter.start_scan(ScanFilter::default()).await.map_err(io)?;
        let deadline = tokio::time::Instant::now() + self.scan_duration;

        loop {
            for peripheral in adapter.peripherals().await.map_err(io)? {
                if peripheral
                    .address()
                    .to_string()
                    .eq_ignore_ascii_case(&self.address)
                {
                    adapter.stop_scan().await.map_err(io)?;
                    return Ok(peripheral);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(SCAN_POLL_INTERVAL).await;
        }

        adapter.stop_scan().await.map_err(io)?;
        Err(TransportError::NotFound(self.address.clone()))
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        let mut link = self.link.lock().await;
        if let Some(old) = link.take() {
            old.reader.abort();
            let _ = old.peripheral.disconnect().await;
        }

        let adapter = get_adapter().await?;
        let peripheral = self.find_peripheral(&adapter).await?;

        peripheral.connect().await.map_err(io)?;
        peripheral.discover_services().await.map_err(io)?;

        let characteristics = peripheral.characteristics();
        let write_char = characteristics
            .iter()
            .find(|c| c.uuid == WRITE_UUID)
            .cloned()
            .ok_or_else(|| TransportError::Unsupported("write characteristic".to_string()))?;
        let notify_char = characteristics
            .iter()
            .find(|c| c.uuid == NOTIFY_UUID)
            .cloned()
            .ok_or_else(|| TransportError::Unsupported("notify characteristic".to_string()))?;

        let mut notifications = peripheral.notifications().await.map_err(io)?;
        peripheral.subscribe(&notify_char).await.map_err(io)?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let reader = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != NOTIFY_UUID {
                    continue;
                }
                if tx
                    .send(TransportEvent::Notification(notification.value))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            tracing::debug!("Notification stream ended");
            let _ = tx.send(TransportEvent::Disconnected).await;
        });

        tracing::info!("Connected to {}", self.address);
        *link = Some(Link {
            peripheral,
            write_char,
            reader,
        });
        Ok(rx)
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        let link = self.link.lock().await;
        let link = link.as_ref().ok_or(TransportError::Disconnected)?;
        link.peripheral
            .write(&link.write_char, data, WriteType::WithoutResponse)
            .await
            .map_err(io)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let Some(link) = self.link.lock().await.take() else {
            return Ok(());
        };
        link.reader.abort();
        link.peripheral.disconnect().await.map_err(io)?;
        tracing::info!("Disconnected from {}", self.address);
        Ok(())
    }
}

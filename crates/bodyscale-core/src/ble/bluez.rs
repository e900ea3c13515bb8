//! BlueZ transport via `bluer`.
//!
//! Linux only. Talks to `bluetoothd` over D-Bus; the daemon must be running
//! and the adapter must support LE.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, Address, Device, ErrorKind, Session};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{AddressType, BleAdapter, BleError, BleResult, CharacteristicHandle, Indication, ScaleLink};

/// Pause between powering the adapter off and on again.
const RESET_SETTLE: Duration = Duration::from_secs(1);

/// Poll interval while waiting for GATT services to resolve.
const SERVICES_POLL: Duration = Duration::from_millis(100);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sort a BlueZ error into the transport's fault classes.
fn classify(err: bluer::Error) -> BleError {
    match err.kind {
        ErrorKind::ConnectionAttemptFailed
        | ErrorKind::DoesNotExist
        | ErrorKind::Failed
        | ErrorKind::ServicesUnresolved
        | ErrorKind::NotFound
        | ErrorKind::InProgress => BleError::connection(err.to_string()),
        _ => BleError::adapter(err.to_string()),
    }
}

impl From<AddressType> for bluer::AddressType {
    fn from(value: AddressType) -> Self {
        match value {
            AddressType::Public => Self::LePublic,
            AddressType::Random => Self::LeRandom,
        }
    }
}

// =============================================================================
// ADAPTER
// =============================================================================

/// The system's default Bluetooth adapter.
pub struct BluezAdapter {
    _session: Session,
    adapter: Adapter,
}

impl BluezAdapter {
    /// Open a D-Bus session and power on the default adapter.
    ///
    /// # Errors
    ///
    /// Returns [`BleError::AdapterNotFound`] when BlueZ reports no adapter, or
    /// an adapter fault when it cannot be powered on.
    pub async fn open() -> BleResult<Self> {
        let session = Session::new().await.map_err(classify)?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|_| BleError::AdapterNotFound)?;
        adapter.set_powered(true).await.map_err(classify)?;
        info!(adapter = adapter.name(), "Bluetooth adapter powered on");
        Ok(Self {
            _session: session,
            adapter,
        })
    }

    async fn wait_services_resolved(device: &Device) -> bluer::Result<()> {
        while !device.is_services_resolved().await? {
            tokio::time::sleep(SERVICES_POLL).await;
        }
        Ok(())
    }

    async fn open_link(&self, addr: Address, address_type: AddressType) -> bluer::Result<Device> {
        let known = self.adapter.device_addresses().await?.contains(&addr);
        let device = if known {
            let device = self.adapter.device(addr)?;
            if !device.is_connected().await? {
                device.connect().await?;
            }
            device
        } else {
            self.adapter.connect_device(addr, address_type.into()).await?
        };
        Self::wait_services_resolved(&device).await?;
        Ok(device)
    }
}

#[async_trait]
impl BleAdapter for BluezAdapter {
    type Link = BluezLink;

    async fn scan_for(&self, name: &str, window: Duration) -> BleResult<bool> {
        let events = self.adapter.discover_devices().await.map_err(classify)?;
        let mut events = Box::pin(events);

        let search = async {
            while let Some(event) = events.next().await {
                let AdapterEvent::DeviceAdded(address) = event else {
                    continue;
                };
                let device = self.adapter.device(address)?;
                match device.name().await {
                    Ok(Some(found)) if found == name => {
                        debug!(%address, "Matched advertised name");
                        return Ok(true);
                    }
                    Ok(_) => {}
                    Err(err) => debug!(%address, error = %err, "Could not read device name"),
                }
            }
            Ok::<bool, bluer::Error>(false)
        };

        match tokio::time::timeout(window, search).await {
            Ok(found) => found.map_err(classify),
            Err(_) => Ok(false),
        }
    }

    async fn connect(
        &self,
        address: &str,
        address_type: AddressType,
        timeout: Duration,
    ) -> BleResult<BluezLink> {
        let addr: Address = address.parse().map_err(|_| BleError::InvalidAddress {
            address: address.to_string(),
        })?;

        match tokio::time::timeout(timeout, self.open_link(addr, address_type)).await {
            Ok(Ok(device)) => Ok(BluezLink::new(device)),
            Ok(Err(err)) => Err(classify(err)),
            Err(_) => Err(BleError::connection(format!(
                "connection to {address} timed out after {}s",
                timeout.as_secs()
            ))),
        }
    }

    async fn reset(&self) -> BleResult<()> {
        warn!(adapter = self.adapter.name(), "Resetting Bluetooth adapter");
        self.adapter.set_powered(false).await.map_err(classify)?;
        tokio::time::sleep(RESET_SETTLE).await;
        self.adapter.set_powered(true).await.map_err(classify)?;
        Ok(())
    }
}

// =============================================================================
// LINK
// =============================================================================

/// A connected scale.
pub struct BluezLink {
    device: Device,
    next_handle: AtomicU16,
    characteristics: Mutex<HashMap<CharacteristicHandle, Characteristic>>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl BluezLink {
    fn new(device: Device) -> Self {
        Self {
            device,
            next_handle: AtomicU16::new(1),
            characteristics: Mutex::new(HashMap::new()),
            forwarders: Mutex::new(Vec::new()),
        }
    }

    fn characteristic(&self, handle: CharacteristicHandle) -> BleResult<Characteristic> {
        lock(&self.characteristics)
            .get(&handle)
            .cloned()
            .ok_or(BleError::UnknownHandle { handle })
    }

    fn stop_forwarders(&self) {
        for forwarder in lock(&self.forwarders).drain(..) {
            forwarder.abort();
        }
    }
}

impl Drop for BluezLink {
    fn drop(&mut self) {
        self.stop_forwarders();
    }
}

#[async_trait]
impl ScaleLink for BluezLink {
    async fn resolve(&self, uuid: Uuid) -> BleResult<CharacteristicHandle> {
        for service in self.device.services().await.map_err(classify)? {
            for characteristic in service.characteristics().await.map_err(classify)? {
                if characteristic.uuid().await.map_err(classify)? != uuid {
                    continue;
                }
                let handle = CharacteristicHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
                lock(&self.characteristics).insert(handle, characteristic);
                return Ok(handle);
            }
        }
        Err(BleError::CharacteristicNotFound { uuid })
    }

    async fn subscribe(
        &self,
        handle: CharacteristicHandle,
        sink: mpsc::Sender<Indication>,
    ) -> BleResult<()> {
        let characteristic = self.characteristic(handle)?;
        let values = characteristic.notify().await.map_err(classify)?;

        let forwarder = tokio::spawn(async move {
            let mut values = Box::pin(values);
            while let Some(value) = values.next().await {
                if sink.send(Indication { handle, value }).await.is_err() {
                    break;
                }
            }
            debug!(%handle, "Indication stream closed");
        });
        lock(&self.forwarders).push(forwarder);
        Ok(())
    }

    async fn write(
        &self,
        handle: CharacteristicHandle,
        value: &[u8],
        ack_timeout: Duration,
    ) -> BleResult<()> {
        let characteristic = self.characteristic(handle)?;
        match tokio::time::timeout(ack_timeout, characteristic.write(value)).await {
            Ok(result) => result.map_err(classify),
            Err(_) => Err(BleError::NotificationTimeout {
                waited: ack_timeout,
            }),
        }
    }

    async fn disconnect(&self) -> BleResult<()> {
        self.stop_forwarders();
        self.device.disconnect().await.map_err(classify)
    }
}

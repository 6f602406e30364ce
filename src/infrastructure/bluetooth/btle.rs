//! `btleplug` backend for Linux and macOS.

use crate::domain::models::PeripheralHandle;
use crate::infrastructure::bluetooth::transport::{
    BleTransport, CharacteristicId, GattLink, LinkSignal, SignalSender, TransportError,
};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

impl From<btleplug::Error> for TransportError {
    fn from(error: btleplug::Error) -> Self {
        match error {
            btleplug::Error::PermissionDenied => TransportError::PermissionDenied,
            btleplug::Error::DeviceNotFound => {
                TransportError::PeripheralNotFound("unknown device".to_string())
            }
            btleplug::Error::NotConnected => TransportError::Closed,
            other => TransportError::Gatt(other.to_string()),
        }
    }
}

pub(crate) struct BtleplugTransport {
    /// Resolved on first use so a host without Bluetooth can still start
    adapter: OnceCell<Adapter>,
    /// Peripherals seen by the last scans, by handle id
    peripherals: Mutex<HashMap<String, Peripheral>>,
}

impl BtleplugTransport {
    pub fn new() -> Self {
        Self {
            adapter: OnceCell::new(),
            peripherals: Mutex::new(HashMap::new()),
        }
    }

    async fn adapter(&self) -> Result<&Adapter, TransportError> {
        self.adapter
            .get_or_try_init(|| async {
                let manager = Manager::new().await?;
                let adapter = manager
                    .adapters()
                    .await?
                    .into_iter()
                    .next()
                    .ok_or(TransportError::NoAdapter)?;
                match adapter.adapter_info().await {
                    Ok(info) => info!("Using Bluetooth adapter {}", info),
                    Err(e) => debug!("Adapter info unavailable: {}", e),
                }
                Ok(adapter)
            })
            .await
    }

    fn peripherals(&self) -> MutexGuard<'_, HashMap<String, Peripheral>> {
        self.peripherals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    async fn scan(
        &self,
        window: Duration,
        service: Option<Uuid>,
    ) -> Result<Vec<PeripheralHandle>, TransportError> {
        let adapter = self.adapter().await?;
        let filter = ScanFilter {
            services: service.into_iter().collect(),
        };
        adapter.start_scan(filter).await?;
        tokio::time::sleep(window).await;
        let candidates = adapter.peripherals().await?;
        if let Err(e) = adapter.stop_scan().await {
            debug!("Failed to stop scan cleanly: {}", e);
        }

        let mut found = Vec::new();
        let mut seen = HashMap::new();
        for peripheral in candidates {
            let Some(properties) = peripheral.properties().await? else {
                continue;
            };
            // Cached peripherals from earlier scans bypass the adapter filter
            if let Some(service) = service {
                if !properties.services.contains(&service) {
                    continue;
                }
            }

            let id = peripheral.id().to_string();
            debug!("Found device {} ({:?})", id, properties.local_name);
            found.push(PeripheralHandle {
                id: id.clone(),
                name: properties.local_name.unwrap_or_default(),
                signal_strength: properties.rssi,
            });
            seen.insert(id, peripheral);
        }

        self.peripherals().extend(seen);
        Ok(found)
    }

    async fn connect(
        &self,
        handle: &PeripheralHandle,
        signals: SignalSender,
    ) -> Result<Arc<dyn GattLink>, TransportError> {
        let peripheral = self
            .peripherals()
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| TransportError::PeripheralNotFound(handle.id.clone()))?;

        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        peripheral.discover_services().await?;

        let mut events = self.adapter().await?.events().await?;
        let mut notifications = peripheral.notifications().await?;
        let peripheral_id = peripheral.id();
        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    notification = notifications.next() => match notification {
                        Some(notification) => {
                            if signals.send(LinkSignal::Notification(notification.value)).is_err() {
                                return;
                            }
                        }
                        None => break,
                    },
                    event = events.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(id)) if id == peripheral_id => {
                            info!("Device {:?} disconnected", id);
                            break;
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
            let _ = signals.send(LinkSignal::Lost);
        });

        Ok(Arc::new(BtleLink { peripheral, pump }))
    }
}

struct BtleLink {
    peripheral: Peripheral,
    pump: JoinHandle<()>,
}

impl BtleLink {
    fn find(&self, id: &CharacteristicId) -> Result<Characteristic, TransportError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == id.service && c.uuid == id.uuid)
            .ok_or(TransportError::MissingCharacteristic {
                service: id.service,
                characteristic: id.uuid,
            })
    }
}

impl Drop for BtleLink {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[async_trait]
impl GattLink for BtleLink {
    async fn characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<CharacteristicId, TransportError> {
        let gatt_service = self
            .peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service)
            .ok_or(TransportError::MissingService(service))?;

        gatt_service
            .characteristics
            .iter()
            .find(|c| c.uuid == characteristic)
            .map(|c| CharacteristicId {
                service,
                uuid: c.uuid,
            })
            .ok_or(TransportError::MissingCharacteristic {
                service,
                characteristic,
            })
    }

    async fn subscribe(&self, characteristic: &CharacteristicId) -> Result<(), TransportError> {
        let target = self.find(characteristic)?;
        self.peripheral.subscribe(&target).await?;
        Ok(())
    }

    async fn write(
        &self,
        characteristic: &CharacteristicId,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let target = self.find(characteristic)?;
        let write_type = if target.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral.write(&target, payload, write_type).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.pump.abort();
        if let Err(e) = self.peripheral.disconnect().await {
            warn!("btleplug disconnect failed: {}", e);
            return Err(e.into());
        }
        Ok(())
    }
}

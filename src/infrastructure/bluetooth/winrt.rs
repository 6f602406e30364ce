//! WinRT backend for Windows.
//!
//! Discovery runs an advertisement watcher for the scan window. Peripheral
//! ids are the 48-bit Bluetooth address in hex.

use crate::domain::models::PeripheralHandle;
use crate::infrastructure::bluetooth::transport::{
    BleTransport, CharacteristicId, GattLink, LinkSignal, SignalSender, TransportError,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;
use windows::core::GUID;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEAdvertisementWatcherStatus, BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattSession, GattValueChangedEventArgs,
};
use windows::Devices::Bluetooth::{BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter, IBuffer};

/// HRESULT for E_ACCESSDENIED
const ACCESS_DENIED: i32 = 0x8007_0005_u32 as i32;

impl From<windows::core::Error> for TransportError {
    fn from(error: windows::core::Error) -> Self {
        if error.code().0 == ACCESS_DENIED {
            TransportError::PermissionDenied
        } else {
            TransportError::Gatt(error.message().to_string())
        }
    }
}

fn guid(uuid: Uuid) -> GUID {
    GUID::from_u128(uuid.as_u128())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn peripheral_id(address: u64) -> String {
    format!("{:012X}", address)
}

fn parse_address(id: &str) -> Result<u64, TransportError> {
    u64::from_str_radix(id, 16).map_err(|_| TransportError::PeripheralNotFound(id.to_string()))
}

fn read_buffer(buffer: &IBuffer) -> windows::core::Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let mut bytes = vec![0u8; reader.UnconsumedBufferLength()? as usize];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}

pub(crate) struct WinRtTransport;

impl WinRtTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BleTransport for WinRtTransport {
    async fn scan(
        &self,
        window: Duration,
        service: Option<Uuid>,
    ) -> Result<Vec<PeripheralHandle>, TransportError> {
        let watcher = BluetoothLEAdvertisementWatcher::new()?;
        watcher.SetScanningMode(BluetoothLEScanningMode::Active)?;

        let found: Arc<Mutex<Vec<PeripheralHandle>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = found.clone();
        let target = service.map(guid);

        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let adv = args.Advertisement()?;

                    if let Some(target) = target {
                        let service_uuids = adv.ServiceUuids()?;
                        let mut matched = false;
                        for i in 0..service_uuids.Size()? {
                            if service_uuids.GetAt(i)? == target {
                                matched = true;
                                break;
                            }
                        }
                        if !matched {
                            return Ok(());
                        }
                    }

                    let device = PeripheralHandle {
                        id: peripheral_id(args.BluetoothAddress()?),
                        name: adv.LocalName()?.to_string(),
                        signal_strength: Some(args.RawSignalStrengthInDBm()?),
                    };

                    // Advertisements repeat; keep the latest per address
                    let mut found = lock(&sink);
                    match found.iter_mut().find(|d| d.id == device.id) {
                        Some(existing) => {
                            if !device.name.is_empty() {
                                existing.name = device.name;
                            }
                            existing.signal_strength = device.signal_strength;
                        }
                        None => found.push(device),
                    }
                }
                Ok(())
            },
        );

        watcher.Received(&handler)?;
        watcher.Start()?;
        tokio::time::sleep(window).await;
        let status = watcher.Status()?;
        watcher.Stop()?;

        if status == BluetoothLEAdvertisementWatcherStatus::Aborted {
            warn!("Advertisement watcher aborted");
            return Err(TransportError::NoAdapter);
        }

        let devices = lock(&found).clone();
        Ok(devices)
    }

    async fn connect(
        &self,
        handle: &PeripheralHandle,
        signals: SignalSender,
    ) -> Result<Arc<dyn GattLink>, TransportError> {
        let address = parse_address(&handle.id)?;
        info!("Connecting to Bluetooth device: {:#X}", address);
        let device = BluetoothLEDevice::FromBluetoothAddressAsync(address)?.await?;

        // Keep the link up while we hold the session
        let session = match GattSession::FromDeviceIdAsync(&device.BluetoothDeviceId()?)?.await {
            Ok(session) => {
                session.SetMaintainConnection(true)?;
                Some(session)
            }
            Err(e) => {
                warn!("Failed to create GattSession, continuing anyway: {}", e);
                None
            }
        };

        let lost = signals.clone();
        let status_handler =
            TypedEventHandler::new(move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
                if let Some(dev) = dev.as_ref() {
                    if dev.ConnectionStatus()? == BluetoothConnectionStatus::Disconnected {
                        let _ = lost.send(LinkSignal::Lost);
                    }
                }
                Ok(())
            });
        let status_token = device.ConnectionStatusChanged(&status_handler)?;

        Ok(Arc::new(WinRtLink {
            device,
            session,
            status_token,
            signals,
            characteristics: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
        }))
    }
}

struct WinRtLink {
    device: BluetoothLEDevice,
    session: Option<GattSession>,
    status_token: i64,
    signals: SignalSender,
    characteristics: Mutex<HashMap<CharacteristicId, GattCharacteristic>>,
    subscriptions: Mutex<Vec<(GattCharacteristic, i64)>>,
}

impl WinRtLink {
    fn resolved(&self, id: &CharacteristicId) -> Result<GattCharacteristic, TransportError> {
        lock(&self.characteristics)
            .get(id)
            .cloned()
            .ok_or(TransportError::MissingCharacteristic {
                service: id.service,
                characteristic: id.uuid,
            })
    }
}

#[async_trait]
impl GattLink for WinRtLink {
    async fn characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<CharacteristicId, TransportError> {
        let services_result = self
            .device
            .GetGattServicesForUuidAsync(guid(service))?
            .await?;
        if services_result.Status()? != GattCommunicationStatus::Success {
            return Err(TransportError::Gatt(format!(
                "GATT service query returned {:?}",
                services_result.Status()?
            )));
        }
        let services = services_result.Services()?;
        if services.Size()? == 0 {
            return Err(TransportError::MissingService(service));
        }
        let gatt_service = services.GetAt(0)?;

        let chars_result = gatt_service
            .GetCharacteristicsForUuidAsync(guid(characteristic))?
            .await?;
        if chars_result.Status()? != GattCommunicationStatus::Success {
            return Err(TransportError::Gatt(format!(
                "characteristic query returned {:?}",
                chars_result.Status()?
            )));
        }
        let characteristics = chars_result.Characteristics()?;
        if characteristics.Size()? == 0 {
            return Err(TransportError::MissingCharacteristic {
                service,
                characteristic,
            });
        }

        let id = CharacteristicId {
            service,
            uuid: characteristic,
        };
        lock(&self.characteristics).insert(id, characteristics.GetAt(0)?);
        Ok(id)
    }

    async fn subscribe(&self, characteristic: &CharacteristicId) -> Result<(), TransportError> {
        let target = self.resolved(characteristic)?;

        let sender = self.signals.clone();
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let bytes = read_buffer(&args.CharacteristicValue()?)?;
                    let _ = sender.send(LinkSignal::Notification(bytes));
                }
                Ok(())
            },
        );
        let token = target.ValueChanged(&handler)?;

        let status = target
            .WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::Notify,
            )?
            .await?;
        if status != GattCommunicationStatus::Success {
            let _ = target.RemoveValueChanged(token);
            return Err(TransportError::Gatt(format!(
                "notification subscription returned {:?}",
                status
            )));
        }

        debug!("Notifications enabled on {}", characteristic.uuid);
        lock(&self.subscriptions).push((target, token));
        Ok(())
    }

    async fn write(
        &self,
        characteristic: &CharacteristicId,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let target = self.resolved(characteristic)?;

        let writer = DataWriter::new()?;
        writer.WriteBytes(payload)?;
        let buffer = writer.DetachBuffer()?;

        let status = target.WriteValueAsync(&buffer)?.await?;
        if status != GattCommunicationStatus::Success {
            return Err(TransportError::Gatt(format!("write returned {:?}", status)));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let _ = self.device.RemoveConnectionStatusChanged(self.status_token);
        for (target, token) in lock(&self.subscriptions).drain(..) {
            let _ = target.RemoveValueChanged(token);
        }
        lock(&self.characteristics).clear();
        if let Some(session) = &self.session {
            let _ = session.Close();
        }
        self.device.Close()?;
        info!("Disconnected from device");
        Ok(())
    }
}

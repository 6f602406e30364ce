//! In-memory transport for tests and demos.
//!
//! Behaves like a single peripheral exposing the Nordic UART Service. Tests
//! push notifications with [`FakeTransport::notify`] and inspect writes with
//! [`FakeTransport::writes`].

use crate::domain::models::PeripheralHandle;
use crate::infrastructure::bluetooth::protocol::GattProfile;
use crate::infrastructure::bluetooth::transport::{
    BleTransport, CharacteristicId, GattLink, LinkSignal, SignalSender, TransportError,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Default)]
struct FakeState {
    devices: Vec<PeripheralHandle>,
    profile: GattProfile,
    missing: Vec<Uuid>,
    scan_error: Option<TransportError>,
    connect_error: Option<TransportError>,
    reject_subscribe: bool,
    stall_connect: bool,
    stall_writes: bool,
    signals: Option<SignalSender>,
    subscribed: Vec<Uuid>,
    writes: Vec<(Uuid, Vec<u8>)>,
    connects: usize,
    disconnects: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: Vec<PeripheralHandle>) -> Self {
        let fake = Self::new();
        fake.lock().devices = devices;
        fake
    }

    /// One peripheral named "Sensor" with id "00:11:22:33:44:55"
    pub fn with_sample_device() -> Self {
        Self::with_devices(vec![
            PeripheralHandle::new("00:11:22:33:44:55", "Sensor").with_signal_strength(-58)
        ])
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fail_scan(&self, error: TransportError) {
        self.lock().scan_error = Some(error);
    }

    pub fn fail_connect(&self, error: TransportError) {
        self.lock().connect_error = Some(error);
    }

    /// Leave a service or characteristic out of the GATT table
    pub fn remove(&self, uuid: Uuid) {
        self.lock().missing.push(uuid);
    }

    pub fn reject_subscribe(&self) {
        self.lock().reject_subscribe = true;
    }

    /// Make `connect` hang until the caller gives up on it
    pub fn stall_connect(&self) {
        self.lock().stall_connect = true;
    }

    /// Make every write hang until the caller gives up on it
    pub fn stall_writes(&self) {
        self.lock().stall_writes = true;
    }

    /// Deliver a notification on the current link; `false` without one
    pub fn notify(&self, payload: impl AsRef<[u8]>) -> bool {
        let state = self.lock();
        match &state.signals {
            Some(signals) if !state.subscribed.is_empty() => signals
                .send(LinkSignal::Notification(payload.as_ref().to_vec()))
                .is_ok(),
            _ => false,
        }
    }

    /// Simulate the peripheral dropping off the air
    pub fn drop_link(&self) -> bool {
        let mut state = self.lock();
        state.subscribed.clear();
        match state.signals.take() {
            Some(signals) => signals.send(LinkSignal::Lost).is_ok(),
            None => false,
        }
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock()
            .writes
            .iter()
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    pub fn disconnects(&self) -> usize {
        self.lock().disconnects
    }

    pub fn is_subscribed(&self) -> bool {
        !self.lock().subscribed.is_empty()
    }
}

#[async_trait]
impl BleTransport for FakeTransport {
    async fn scan(
        &self,
        _window: Duration,
        _service: Option<Uuid>,
    ) -> Result<Vec<PeripheralHandle>, TransportError> {
        let state = self.lock();
        match &state.scan_error {
            Some(error) => Err(error.clone()),
            None => Ok(state.devices.clone()),
        }
    }

    async fn connect(
        &self,
        peripheral: &PeripheralHandle,
        signals: SignalSender,
    ) -> Result<Arc<dyn GattLink>, TransportError> {
        let stall = {
            let mut state = self.lock();
            if let Some(error) = &state.connect_error {
                return Err(error.clone());
            }
            if !state.devices.iter().any(|d| d.id == peripheral.id) {
                return Err(TransportError::PeripheralNotFound(peripheral.id.clone()));
            }
            state.stall_connect
        };

        if stall {
            std::future::pending::<()>().await;
        }

        let mut state = self.lock();
        state.connects += 1;
        state.subscribed.clear();
        state.signals = Some(signals);
        Ok(Arc::new(FakeLink {
            state: self.state.clone(),
            id: state.connects,
        }))
    }
}

struct FakeLink {
    state: Arc<Mutex<FakeState>>,
    /// Links opened before the latest connect are stale
    id: usize,
}

impl FakeLink {
    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl GattLink for FakeLink {
    async fn characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<CharacteristicId, TransportError> {
        let state = self.lock();
        let profile = state.profile;

        if service != profile.service || state.missing.contains(&service) {
            return Err(TransportError::MissingService(service));
        }
        let known = characteristic == profile.write || characteristic == profile.notify;
        if !known || state.missing.contains(&characteristic) {
            return Err(TransportError::MissingCharacteristic {
                service,
                characteristic,
            });
        }

        Ok(CharacteristicId {
            service,
            uuid: characteristic,
        })
    }

    async fn subscribe(&self, characteristic: &CharacteristicId) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.reject_subscribe {
            return Err(TransportError::Gatt(
                "notification subscription rejected".to_string(),
            ));
        }
        state.subscribed.push(characteristic.uuid);
        Ok(())
    }

    async fn write(
        &self,
        characteristic: &CharacteristicId,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let stall = self.lock().stall_writes;
        if stall {
            std::future::pending::<()>().await;
        }

        let mut state = self.lock();
        if state.connects != self.id || state.signals.is_none() {
            return Err(TransportError::Closed);
        }
        state.writes.push((characteristic.uuid, payload.to_vec()));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.disconnects += 1;
        if state.connects == self.id {
            state.subscribed.clear();
            state.signals = None;
        }
        Ok(())
    }
}

//! Capability interface over the platform BLE stack.
//!
//! Nothing above this module sees a platform type: peripherals are
//! [`PeripheralHandle`]s, characteristics are [`CharacteristicId`]s and
//! everything the peripheral pushes arrives as a [`LinkSignal`].

use crate::domain::models::PeripheralHandle;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no Bluetooth adapter available")]
    NoAdapter,

    #[error("Bluetooth permission denied")]
    PermissionDenied,

    #[error("peripheral not found: {0}")]
    PeripheralNotFound(String),

    #[error("service {0} not found")]
    MissingService(Uuid),

    #[error("characteristic {characteristic} not found in service {service}")]
    MissingCharacteristic { service: Uuid, characteristic: Uuid },

    #[error("GATT operation failed: {0}")]
    Gatt(String),

    #[error("link closed")]
    Closed,
}

/// A characteristic resolved on an open link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicId {
    pub service: Uuid,
    pub uuid: Uuid,
}

/// Pushed from the platform to the core
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSignal {
    /// One notification payload, exactly as delivered
    Notification(Vec<u8>),
    /// The peripheral went away without being asked to
    Lost,
}

pub type SignalSender = mpsc::UnboundedSender<LinkSignal>;

#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Listen for advertisements for `window`. With a `service` filter only
    /// peripherals advertising it are reported.
    async fn scan(
        &self,
        window: Duration,
        service: Option<Uuid>,
    ) -> Result<Vec<PeripheralHandle>, TransportError>;

    /// Open a GATT link. Notifications of later subscriptions and link loss
    /// are reported through `signals`.
    async fn connect(
        &self,
        peripheral: &PeripheralHandle,
        signals: SignalSender,
    ) -> Result<Arc<dyn GattLink>, TransportError>;
}

#[async_trait]
pub trait GattLink: Send + Sync {
    async fn characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<CharacteristicId, TransportError>;

    async fn subscribe(&self, characteristic: &CharacteristicId) -> Result<(), TransportError>;

    async fn write(
        &self,
        characteristic: &CharacteristicId,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}

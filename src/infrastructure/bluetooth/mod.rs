//! Bluetooth Module
//!
//! Host side of a UART-style BLE link to one peripheral.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                      │
//! │  (public API: observable state + operations)             │
//! └───────────┬────────────────────────────┬────────────────┘
//!             │                            │
//!             ▼                            ▼
//! ┌───────────────────────┐      ┌───────────────────┐
//! │  ConnectionManager     │      │ OutboundMessenger │
//! │ - scan / connect       │      │ - single write    │
//! │ - session + forwarder  │      │   per message     │
//! │   ─► TransferController│      └─────────┬─────────┘
//! └───────────┬───────────┘                │
//!             ▼                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │         BleTransport / GattLink (capability traits)      │
//! │    WinRT (Windows) · btleplug (others) · FakeTransport   │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - GATT identifiers and payload encoding
//! - [`transport`] - capability traits implemented by platform backends
//! - [`connection`] - session lifecycle and notification routing
//! - [`messenger`] - outbound text writes
//! - [`service`] - main service coordinator
//! - [`fake`] - scriptable in-memory transport

pub mod connection;
pub mod fake;
pub mod messenger;
pub mod protocol;
pub mod service;
pub mod transport;

#[cfg(not(windows))]
mod btle;
#[cfg(windows)]
mod winrt;

use std::sync::Arc;
use transport::BleTransport;

// Re-export main service for convenience
pub use service::BluetoothService;

/// Transport backed by the host's native Bluetooth stack. Adapter problems
/// surface from the first scan, not from here.
#[cfg(windows)]
pub fn platform_transport() -> Arc<dyn BleTransport> {
    Arc::new(winrt::WinRtTransport::new())
}

/// Transport backed by the host's native Bluetooth stack. Adapter problems
/// surface from the first scan, not from here.
#[cfg(not(windows))]
pub fn platform_transport() -> Arc<dyn BleTransport> {
    Arc::new(btle::BtleplugTransport::new())
}

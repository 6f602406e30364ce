//! UART link protocol
//!
//! The peripheral exposes the Nordic UART Service: one characteristic the
//! host writes commands to, one it subscribes to for notifications. Text
//! travels as raw UTF-8 without framing; the only in-band structure is the
//! CSV end marker.

use crate::domain::settings::BleSettings;
use uuid::Uuid;

pub use crate::domain::reassembler::CSV_END_SENTINEL;

/// Nordic UART Service
pub const NUS_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

/// Write characteristic - host to peripheral
pub const NUS_WRITE_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

/// Notify characteristic - peripheral to host
pub const NUS_NOTIFY_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// Greeting sent when the operator gives no text
pub const DEFAULT_MESSAGE: &str = "hello";

/// The fixed identifier set a peripheral must expose to be reachable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattProfile {
    pub service: Uuid,
    pub write: Uuid,
    pub notify: Uuid,
}

impl Default for GattProfile {
    fn default() -> Self {
        Self {
            service: NUS_SERVICE_UUID,
            write: NUS_WRITE_CHAR_UUID,
            notify: NUS_NOTIFY_CHAR_UUID,
        }
    }
}

impl From<&BleSettings> for GattProfile {
    fn from(settings: &BleSettings) -> Self {
        Self {
            service: settings.service_uuid,
            write: settings.write_char_uuid,
            notify: settings.notify_char_uuid,
        }
    }
}

/// Outbound messages are written as-is, one write per message
pub fn encode_text(text: &str) -> Vec<u8> {
    text.as_bytes().to_vec()
}

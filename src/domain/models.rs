use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A peripheral reported by discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralHandle {
    /// Platform identifier, opaque to everything above the transport
    pub id: String,
    pub name: String,
    pub signal_strength: Option<i16>,
}

impl PeripheralHandle {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            signal_strength: None,
        }
    }

    pub fn with_signal_strength(mut self, rssi: i16) -> Self {
        self.signal_strength = Some(rssi);
        self
    }

    /// Name to show an operator; advertisements without a local name fall back to the id
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    NotConnected,
    Scanning,
    Connecting,
    Connected,
    Disconnected,
    Error(String),
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => f.write_str("Not connected"),
            Self::Scanning => f.write_str("Scanning"),
            Self::Connecting => f.write_str("Connecting"),
            Self::Connected => f.write_str("Connected"),
            Self::Disconnected => f.write_str("Disconnected"),
            Self::Error(message) => write!(f, "Error: {}", message),
        }
    }
}

/// How inbound fragments are interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    /// Every fragment is free-form text
    #[default]
    Idle,
    /// Fragments accumulate until the end-of-stream sentinel
    CapturingCsv,
}

/// Logical message produced from the raw notification stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    TextReceived(String),
    CsvFragmentReceived {
        fragment_len: usize,
        buffered_len: usize,
    },
    CsvComplete(String),
    /// Malformed bytes were replaced with U+FFFD; framing is unaffected
    DecodeAnomaly { replaced: usize },
}

#[derive(Debug, Clone)]
pub enum AppEvent {
    DeviceFound(PeripheralHandle),
    ConnectionStatus(ConnectionStatus),
    Inbound(InboundEvent),
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

/// Tabular result handed back by a CSV sink
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsvTable {
    pub columns: Vec<String>,
    pub rows: Vec<BTreeMap<String, String>>,
}

impl CsvTable {
    /// First `count` records, for a quick look before plotting
    pub fn preview(&self, count: usize) -> &[BTreeMap<String, String>] {
        &self.rows[..self.rows.len().min(count)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_falls_back_to_id() {
        let named = PeripheralHandle::new("AA:BB", "Sensor");
        let anonymous = PeripheralHandle::new("AA:BB", "");
        assert_eq!(named.display_name(), "Sensor");
        assert_eq!(anonymous.display_name(), "AA:BB");
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ConnectionStatus::NotConnected.to_string(), "Not connected");
        assert_eq!(
            ConnectionStatus::Error("adapter off".to_string()).to_string(),
            "Error: adapter off"
        );
    }

    #[test]
    fn test_preview_is_clamped() {
        let table = CsvTable {
            columns: vec!["a".to_string()],
            rows: vec![BTreeMap::new(); 3],
        };
        assert_eq!(table.preview(10).len(), 3);
        assert_eq!(table.preview(2).len(), 2);
    }
}

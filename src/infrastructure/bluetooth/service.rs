//! Bluetooth Service Module
//!
//! Main service that coordinates scanning, connection, outbound writes and
//! CSV capture for one UART peripheral.

use crate::domain::error::LinkError;
use crate::domain::models::{
    AppEvent, ConnectionStatus, CsvTable, MessageSeverity, PeripheralHandle, TransferMode,
};
use crate::domain::settings::Settings;
use crate::domain::transfer::TransferController;
use crate::infrastructure::bluetooth::{
    connection::{ConnectionConfig, ConnectionManager, DisconnectOutcome, LinkShared},
    messenger::OutboundMessenger,
    protocol::{GattProfile, DEFAULT_MESSAGE},
    transport::BleTransport,
};
use crate::infrastructure::csv_sink::{CsvSink, SinkError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// Main Bluetooth service coordinating all BLE operations
pub struct BluetoothService {
    connections: ConnectionManager,
    messenger: OutboundMessenger,
    shared: Arc<LinkShared>,
}

impl BluetoothService {
    /// Create a new Bluetooth service on top of `transport`
    pub fn new(
        transport: Arc<dyn BleTransport>,
        settings: &Settings,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let transfer = TransferController::with_sentinel(settings.sentinel());
        let shared = Arc::new(LinkShared::new(transfer, event_sender));
        let config = ConnectionConfig {
            profile: GattProfile::from(&settings.ble),
            scan_window: Duration::from_millis(settings.ble.scan_duration_ms),
            show_all_devices: settings.ble.show_all_devices,
        };

        Self {
            connections: ConnectionManager::new(transport, config, shared.clone()),
            messenger: OutboundMessenger::new(shared.clone()),
            shared,
        }
    }

    /// Scan for peripherals; results are appended to [`Self::devices`]
    pub async fn scan(&self) -> Result<Vec<PeripheralHandle>, LinkError> {
        self.connections.scan().await
    }

    pub async fn connect(&self, peripheral: &PeripheralHandle) -> Result<(), LinkError> {
        self.connections.connect(peripheral).await
    }

    /// Connect to the discovered device at `index`
    pub async fn connect_index(&self, index: usize) -> Result<(), LinkError> {
        self.connections.connect_index(index).await
    }

    pub async fn disconnect(&self) -> DisconnectOutcome {
        self.connections.disconnect().await
    }

    /// Write `text` to the peripheral; blank text sends the default greeting
    pub async fn send(&self, text: &str) -> Result<(), LinkError> {
        let text = if text.trim().is_empty() {
            DEFAULT_MESSAGE
        } else {
            text
        };
        self.messenger.send(text).await
    }

    /// Begin capturing CSV. Returns `false` if a capture is already running.
    pub fn start_capture(&self) -> bool {
        let started = self.shared.lock().transfer.start_capture();
        if started {
            self.shared
                .log("Waiting for CSV data over Bluetooth...", MessageSeverity::Info);
        } else {
            self.shared
                .log("CSV capture already in progress", MessageSeverity::Warning);
        }
        started
    }

    /// Remove and return the completed CSV, lowering the ready flag
    pub fn take_csv(&self) -> Option<String> {
        self.shared.lock().transfer.take_csv()
    }

    /// Hand the completed CSV to `sink`. It is only consumed when the sink accepts it.
    pub async fn upload_csv(&self, sink: &dyn CsvSink) -> Result<CsvTable, SinkError> {
        let csv = self
            .shared
            .lock()
            .transfer
            .completed_csv()
            .map(str::to_owned);
        let Some(csv) = csv else {
            self.shared
                .log(SinkError::Empty.to_string(), MessageSeverity::Warning);
            return Err(SinkError::Empty);
        };

        match sink.submit(&csv).await {
            Ok(table) => {
                self.shared.lock().transfer.take_csv();
                info!(
                    rows = table.rows.len(),
                    columns = table.columns.len(),
                    "CSV uploaded"
                );
                self.shared.log(
                    format!(
                        "Uploaded CSV: {} row(s), {} column(s)",
                        table.rows.len(),
                        table.columns.len()
                    ),
                    MessageSeverity::Success,
                );
                Ok(table)
            }
            Err(e) => {
                self.shared
                    .log(format!("Upload failed: {}", e), MessageSeverity::Error);
                Err(e)
            }
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connections.status()
    }

    pub fn devices(&self) -> Vec<PeripheralHandle> {
        self.connections.devices()
    }

    pub fn clear_devices(&self) {
        self.connections.clear_devices();
    }

    pub fn text_log(&self) -> String {
        self.shared.lock().transfer.text_log().to_string()
    }

    pub fn clear_text_log(&self) {
        self.shared.lock().transfer.clear_text_log();
    }

    pub fn csv_ready(&self) -> bool {
        self.shared.lock().transfer.csv_ready()
    }

    pub fn transfer_mode(&self) -> TransferMode {
        self.shared.lock().transfer.mode()
    }

    /// Bytes held by the capture in progress
    pub fn buffered_len(&self) -> usize {
        self.shared.lock().transfer.buffered_len()
    }

    pub fn is_connected(&self) -> bool {
        self.connections.is_connected()
    }

    pub fn connected_peripheral(&self) -> Option<PeripheralHandle> {
        self.connections.connected_peripheral()
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }
}

use ble_csv_link::domain::settings::SettingsService;
use ble_csv_link::infrastructure::bluetooth::{platform_transport, BluetoothService};
use ble_csv_link::infrastructure::csv_sink::FileCsvSink;
use ble_csv_link::infrastructure::logging::init_logger;
use ble_csv_link::presentation::console;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new()?;

    let _logging_guard = init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting BLE CSV link");
    if !settings_service.path().exists() {
        if let Err(e) = settings_service.save() {
            warn!("Could not write default settings: {}", e);
        }
    }
    info!("Settings: {}", settings_service.path().display());

    let settings = settings_service.get();
    let transport = platform_transport();

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let service = Arc::new(BluetoothService::new(transport, settings, event_tx));
    let sink = Arc::new(FileCsvSink::new(settings.csv_output_dir.clone()));

    console::run(service, sink, event_rx).await
}

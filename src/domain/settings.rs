use crate::domain::reassembler::CSV_END_SENTINEL;
use crate::infrastructure::bluetooth::protocol;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

/// GATT identifiers and discovery behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BleSettings {
    #[serde(default = "default_service_uuid")]
    pub service_uuid: Uuid,
    /// Host -> peripheral
    #[serde(default = "default_write_uuid")]
    pub write_char_uuid: Uuid,
    /// Peripheral -> host
    #[serde(default = "default_notify_uuid")]
    pub notify_char_uuid: Uuid,
    #[serde(default = "default_scan_duration_ms")]
    pub scan_duration_ms: u64,
    /// List every advertiser instead of only those offering `service_uuid`
    #[serde(default = "default_true")]
    pub show_all_devices: bool,
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            service_uuid: default_service_uuid(),
            write_char_uuid: default_write_uuid(),
            notify_char_uuid: default_notify_uuid(),
            scan_duration_ms: default_scan_duration_ms(),
            show_all_devices: default_true(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub ble: BleSettings,

    #[serde(default = "default_sentinel")]
    pub csv_sentinel: String,
    #[serde(default = "default_csv_output_dir")]
    pub csv_output_dir: PathBuf,

    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ble: BleSettings::default(),
            csv_sentinel: default_sentinel(),
            csv_output_dir: default_csv_output_dir(),
            log_settings: LogSettings::default(),
        }
    }
}

impl Settings {
    /// The configured end-of-stream marker, or the built-in one if it was blanked out
    pub fn sentinel(&self) -> &str {
        if self.csv_sentinel.is_empty() {
            CSV_END_SENTINEL
        } else {
            &self.csv_sentinel
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "ble_csv_link".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}
fn default_service_uuid() -> Uuid {
    protocol::NUS_SERVICE_UUID
}
fn default_write_uuid() -> Uuid {
    protocol::NUS_WRITE_CHAR_UUID
}
fn default_notify_uuid() -> Uuid {
    protocol::NUS_NOTIFY_CHAR_UUID
}
fn default_scan_duration_ms() -> u64 {
    5000
}
fn default_sentinel() -> String {
    CSV_END_SENTINEL.to_string()
}
fn default_csv_output_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("BleCsvLink").join("captures"))
        .unwrap_or_else(|| PathBuf::from("captures"))
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load from an explicit file; a missing or unreadable file yields defaults
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                if settings_path.exists() {
                    warn!(
                        "Ignoring unreadable settings at {}: {}",
                        settings_path.display(),
                        e
                    );
                }
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BleCsvLink");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_use_nordic_uart_service() {
        let settings = Settings::default();
        assert_eq!(
            settings.ble.service_uuid.to_string(),
            "6e400001-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(
            settings.ble.write_char_uuid.to_string(),
            "6e400002-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(
            settings.ble.notify_char_uuid.to_string(),
            "6e400003-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(settings.sentinel(), "__CSV_END__");
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let json = r#"{ "ble": { "scan_duration_ms": 1500 }, "csv_sentinel": "<<END>>" }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.ble.scan_duration_ms, 1500);
        assert_eq!(settings.ble.service_uuid, protocol::NUS_SERVICE_UUID);
        assert_eq!(settings.sentinel(), "<<END>>");
        assert_eq!(settings.log_settings.level, "info");
    }

    #[test]
    fn test_blank_sentinel_falls_back() {
        let settings = Settings {
            csv_sentinel: String::new(),
            ..Default::default()
        };
        assert_eq!(settings.sentinel(), CSV_END_SENTINEL);
    }

    #[test]
    fn test_save_and_reload() {
        let path = std::env::temp_dir()
            .join(format!("ble_csv_link_settings_{}", std::process::id()))
            .join("settings.json");

        let mut service = SettingsService::with_path(path.clone());
        service.get_mut().ble.scan_duration_ms = 1234;
        service.get_mut().ble.show_all_devices = false;
        service.save().unwrap();

        let reloaded = SettingsService::with_path(path.clone());
        assert_eq!(reloaded.get().ble.scan_duration_ms, 1234);
        assert!(!reloaded.get().ble.show_all_devices);

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let path = std::env::temp_dir().join("ble_csv_link_does_not_exist.json");
        let service = SettingsService::with_path(path);
        assert_eq!(service.get().ble, BleSettings::default());
    }
}

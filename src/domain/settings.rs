use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

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

/// Options consulted by the link session and the scanner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSettings {
    /// Resume the previous link when connecting to the same address again
    #[serde(default = "default_false")]
    pub reuse_existing_connection: bool,
    /// Tear down any stale link before opening a new one
    #[serde(default = "default_true")]
    pub force_close_before_new_connection: bool,
    /// Passed straight to the transport's connect call
    #[serde(default = "default_false")]
    pub gatt_auto_connect: bool,
    /// Scan window before the scanner restarts itself (0 = never restart)
    #[serde(default = "default_scan_period_ms")]
    pub scan_period_ms: u64,
    /// Watchdog for a single in-flight GATT operation (0 = wait forever)
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    #[serde(default = "default_uart_service_uuid")]
    pub uart_service_uuid: String,
    #[serde(default = "default_uart_tx_uuid")]
    pub uart_tx_char_uuid: String,
    #[serde(default = "default_uart_rx_uuid")]
    pub uart_rx_char_uuid: String,
    #[serde(default = "default_target_device_name")]
    pub target_device_name: String,
    #[serde(default = "default_false")]
    pub show_all_devices: bool,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            reuse_existing_connection: default_false(),
            force_close_before_new_connection: default_true(),
            gatt_auto_connect: default_false(),
            scan_period_ms: default_scan_period_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
            max_chunk_size: default_max_chunk_size(),
            uart_service_uuid: default_uart_service_uuid(),
            uart_tx_char_uuid: default_uart_tx_uuid(),
            uart_rx_char_uuid: default_uart_rx_uuid(),
            target_device_name: default_target_device_name(),
            show_all_devices: default_false(),
        }
    }
}

impl LinkSettings {
    pub fn scan_period(&self) -> Duration {
        Duration::from_millis(self.scan_period_ms)
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        (self.operation_timeout_ms > 0).then(|| Duration::from_millis(self.operation_timeout_ms))
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
    "neopixel_link".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}
fn default_scan_period_ms() -> u64 {
    20_000
}
fn default_operation_timeout_ms() -> u64 {
    5_000
}
fn default_max_chunk_size() -> usize {
    20
}
fn default_uart_service_uuid() -> String {
    "6e400001-b5a3-f393-e0a9-e50e24dcca9e".to_string()
}
fn default_uart_tx_uuid() -> String {
    "6e400002-b5a3-f393-e0a9-e50e24dcca9e".to_string()
}
fn default_uart_rx_uuid() -> String {
    "6e400003-b5a3-f393-e0a9-e50e24dcca9e".to_string()
}
fn default_target_device_name() -> String {
    "Adafruit Bluefruit LE".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub link: LinkSettings,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    #[serde(default)]
    pub known_addresses: Vec<String>,
    #[serde(default)]
    pub last_connected_address: Option<String>,
}

impl Settings {
    /// Apply a single `key = value` override on top of the loaded settings.
    pub fn set_option(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let value = value.trim();
        let link = &mut self.link;
        match key.trim() {
            "reuse_existing_connection" => link.reuse_existing_connection = parse_value(key, value)?,
            "force_close_before_new_connection" => {
                link.force_close_before_new_connection = parse_value(key, value)?
            }
            "gatt_auto_connect" => link.gatt_auto_connect = parse_value(key, value)?,
            "scan_period_ms" => link.scan_period_ms = parse_value(key, value)?,
            "operation_timeout_ms" => link.operation_timeout_ms = parse_value(key, value)?,
            "max_chunk_size" => {
                let size: usize = parse_value(key, value)?;
                if size == 0 {
                    anyhow::bail!("max_chunk_size must be at least 1");
                }
                link.max_chunk_size = size;
            }
            "uart_service_uuid" => link.uart_service_uuid = value.to_string(),
            "uart_tx_char_uuid" => link.uart_tx_char_uuid = value.to_string(),
            "uart_rx_char_uuid" => link.uart_rx_char_uuid = value.to_string(),
            "target_device_name" => link.target_device_name = value.to_string(),
            "show_all_devices" => link.show_all_devices = parse_value(key, value)?,
            "log_level" => self.log_settings.level = value.to_string(),
            other => anyhow::bail!("Unknown setting: {}", other),
        }
        Ok(())
    }

    /// Parse and apply a `key=value` pair.
    pub fn apply_override(&mut self, pair: &str) -> anyhow::Result<()> {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("Expected key=value, got '{}'", pair))?;
        self.set_option(key, value)
    }
}

fn parse_value<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("Invalid value '{}' for {}", value, key))
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::load_from(settings_path))
    }

    /// Load settings from an explicit path, falling back to defaults when
    /// the file is missing or unreadable.
    pub fn load_from(settings_path: impl Into<PathBuf>) -> Self {
        let settings_path = settings_path.into();
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {:#}",
                    settings_path.display(),
                    e
                );
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
        path.push("NeoPixelLink");
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

    /// Remember a peripheral we managed to connect to.
    pub fn add_known_address(&mut self, address: &str) -> anyhow::Result<()> {
        let known = &mut self.settings.known_addresses;
        if !known.iter().any(|a| a.eq_ignore_ascii_case(address)) {
            known.push(address.to_string());
        }
        self.settings.last_connected_address = Some(address.to_string());
        self.save()
    }
}

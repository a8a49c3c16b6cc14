use crate::domain::models::TargetConfig;
use crate::infrastructure::bluetooth::protocol::{DeviceFamily, DEFAULT_MTU};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
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
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
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
    "ble_link_manager".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Connection timings, all in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingSettings {
    /// Restart a scan session older than this while devices are missing
    #[serde(default = "default_scan_restart_interval_ms")]
    pub scan_restart_interval_ms: u64,
    /// Give up on a connection attempt after this long
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Wait before re-queueing a device that dropped
    #[serde(default = "default_reconnect_cooldown_ms")]
    pub reconnect_cooldown_ms: u64,
    /// Pause between finding the notify characteristic and requesting MTU
    #[serde(default = "default_mtu_grace_delay_ms")]
    pub mtu_grace_delay_ms: u64,
    #[serde(default = "default_disconnect_timeout_ms")]
    pub disconnect_timeout_ms: u64,
    #[serde(default = "default_heartbeat_retry_delay_ms")]
    pub heartbeat_retry_delay_ms: u64,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            scan_restart_interval_ms: default_scan_restart_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_cooldown_ms: default_reconnect_cooldown_ms(),
            mtu_grace_delay_ms: default_mtu_grace_delay_ms(),
            disconnect_timeout_ms: default_disconnect_timeout_ms(),
            heartbeat_retry_delay_ms: default_heartbeat_retry_delay_ms(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

impl TimingSettings {
    pub fn scan_restart_interval(&self) -> Duration {
        Duration::from_millis(self.scan_restart_interval_ms)
    }
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
    pub fn reconnect_cooldown(&self) -> Duration {
        Duration::from_millis(self.reconnect_cooldown_ms)
    }
    pub fn mtu_grace_delay(&self) -> Duration {
        Duration::from_millis(self.mtu_grace_delay_ms)
    }
    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }
    pub fn heartbeat_retry_delay(&self) -> Duration {
        Duration::from_millis(self.heartbeat_retry_delay_ms)
    }
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

fn default_scan_restart_interval_ms() -> u64 {
    10_000
}
fn default_connect_timeout_ms() -> u64 {
    15_000
}
fn default_reconnect_cooldown_ms() -> u64 {
    3_000
}
fn default_mtu_grace_delay_ms() -> u64 {
    100
}
fn default_disconnect_timeout_ms() -> u64 {
    1_000
}
fn default_heartbeat_retry_delay_ms() -> u64 {
    2_000
}
fn default_tick_interval_ms() -> u64 {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    #[serde(default)]
    pub timing: TimingSettings,

    #[serde(default = "default_mtu_size")]
    pub mtu_size: u16,

    /// Devices registered at startup
    #[serde(default = "default_targets")]
    pub targets: Vec<TargetConfig>,

    /// Identifiers used when a heartbeat has to re-register an unknown device
    #[serde(default = "default_heartbeat_fallback")]
    pub heartbeat_fallback: TargetConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            timing: TimingSettings::default(),
            mtu_size: default_mtu_size(),
            targets: default_targets(),
            heartbeat_fallback: default_heartbeat_fallback(),
        }
    }
}

fn default_mtu_size() -> u16 {
    DEFAULT_MTU
}
fn default_targets() -> Vec<TargetConfig> {
    vec![DeviceFamily::BallCamera.target_config()]
}
fn default_heartbeat_fallback() -> TargetConfig {
    DeviceFamily::BallCamera.target_config()
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

    /// Load from an explicit file, falling back to defaults if it is missing
    /// or unreadable.
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BleLinkManager");
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
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    /// Add or replace a startup target and persist
    pub fn upsert_target(&mut self, config: TargetConfig) -> anyhow::Result<()> {
        match self
            .settings
            .targets
            .iter_mut()
            .find(|t| t.name == config.name)
        {
            Some(existing) => *existing = config,
            None => self.settings.targets.push(config),
        }
        self.save()
    }
}

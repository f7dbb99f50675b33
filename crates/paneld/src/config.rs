//! Daemon configuration file parsing and structures.
//!
//! paneld uses TOML for the static parts of its configuration: where the
//! hardware lives, which device model it runs on, logging, and listen
//! addresses. Runtime tunables (broker credentials, brightness, dimming)
//! live in the [`crate::settings::SettingsStore`] instead, because they are
//! edited remotely while the daemon runs.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use tracing_subscriber::filter::LevelFilter;

/// Top-level configuration structure
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub device: DeviceConfig,
    pub mqtt: MqttConfig,
    pub http: HttpConfig,
    pub input: InputConfig,
    pub hardware: HardwareConfig,
    pub sensors: SensorsConfig,

    /// Location of the persisted settings store
    pub settings_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub level: LogLevel,

    /// Per-target levels, e.g. `paneld::input = "debug"`
    #[serde(default)]
    pub overrides: HashMap<String, LogLevel>,
}

/// Which physical device this daemon runs on
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Stable model identifier used to look up calibration data
    pub model: String,

    /// Human-readable device name advertised to the hub
    pub name: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            model: "Stargate".to_string(),
            name: "Wall Display".to_string(),
        }
    }
}

/// Message bus topic layout
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Per-deployment prefix for every device topic
    pub topic_prefix: String,

    /// Discovery prefix watched by the hub (default: "homeassistant")
    pub discovery_prefix: String,

    /// Keep-alive interval negotiated with the broker
    pub keep_alive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "paneld".to_string(),
            discovery_prefix: "homeassistant".to_string(),
            keep_alive_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub listen: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Directory scanned for `event*` input sources
    pub device_dir: PathBuf,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            device_dir: PathBuf::from("/dev/input"),
        }
    }
}

/// Paths of the privileged hardware nodes.
///
/// Each hardware revision exposes relays and the backlight under different
/// sysfs paths, so every capability accepts a list of candidates.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    /// Candidate nodes per relay index; all existing nodes are driven together
    pub relay_paths: Vec<Vec<PathBuf>>,

    /// Backlight nodes, the first existing one is used
    pub brightness_paths: Vec<PathBuf>,

    /// Combined temperature/humidity node
    pub climate_path: PathBuf,

    /// Ambient light node (lux)
    pub light_path: PathBuf,

    /// Proximity node (distance)
    pub proximity_path: PathBuf,

    /// Maximum value the proximity sensor reports
    pub proximity_max_range: f32,

    /// Command run to reboot the device
    pub reboot_command: Vec<String>,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            relay_paths: vec![
                vec![
                    PathBuf::from("/sys/devices/platform/leds/green_enable"),
                    PathBuf::from("/sys/class/strelay/relay1"),
                ],
                vec![
                    PathBuf::from("/sys/devices/platform/leds/red_enable"),
                    PathBuf::from("/sys/class/strelay/relay2"),
                ],
            ],
            brightness_paths: vec![
                PathBuf::from("/sys/devices/platform/leds-mt65xx/leds/lcd-backlight/brightness"),
                PathBuf::from("/sys/devices/platform/sprd_backlight/backlight/sprd_backlight/brightness"),
                PathBuf::from("/sys/devices/platform/backlight/backlight/backlight/brightness"),
            ],
            climate_path: PathBuf::from("/sys/devices/platform/sht3x-user/sht3x_access"),
            light_path: PathBuf::from("/sys/bus/iio/devices/iio:device0/in_illuminance_input"),
            proximity_path: PathBuf::from("/sys/bus/iio/devices/iio:device0/in_proximity_raw"),
            proximity_max_range: 5.0,
            reboot_command: vec!["reboot".to_string()],
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SensorsConfig {
    /// How often the light and proximity nodes are sampled
    pub poll_interval_ms: u64,
}

impl Default for SensorsConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().to_path_buf(), e))?;

        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Load configuration, treating a missing file as "all defaults"
    pub fn from_file_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn settings_path(&self) -> PathBuf {
        self.settings_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("/var/lib/paneld/settings.json"))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

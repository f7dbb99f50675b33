//! Privileged hardware capabilities.
//!
//! Control logic only ever talks to the [`Hardware`] trait. [`SysfsHardware`]
//! drives the sysfs nodes named in the `[hardware]` config section, so a new
//! hardware revision needs new paths, not new code.

use std::path::Path;
use std::path::PathBuf;
use std::process::Command;

use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::HardwareConfig;

#[derive(Debug, thiserror::Error)]
pub enum HardwareError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Capability not available: {0}")]
    Unsupported(String),

    #[error("Unparseable value {value:?} from {path}")]
    Parse { path: PathBuf, value: String },

    #[error("Reboot failed: {0}")]
    Reboot(String),
}

/// Raw reading of the combined humidity/temperature node
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawClimate {
    pub humidity: f64,
    pub temperature: f64,
}

impl RawClimate {
    /// Parse the `"<rawHum>:<rawTemp>"` format
    pub fn parse(contents: &str) -> Option<Self> {
        let (hum, temp) = contents.trim().split_once(':')?;
        Some(Self {
            humidity: hum.trim().parse().ok()?,
            temperature: temp.trim().parse().ok()?,
        })
    }
}

pub trait Hardware: Send + Sync {
    /// Number of relay outputs the hardware exposes
    fn relay_count(&self) -> usize;

    fn relay(&self, num: usize) -> Result<bool, HardwareError>;

    fn set_relay(&self, num: usize, on: bool) -> Result<(), HardwareError>;

    fn brightness(&self) -> Result<u8, HardwareError>;

    fn set_brightness(&self, value: u8) -> Result<(), HardwareError>;

    fn climate(&self) -> Result<RawClimate, HardwareError>;

    /// Ambient light in lux
    fn light_level(&self) -> Result<f32, HardwareError>;

    /// Proximity distance in the sensor's native unit
    fn proximity(&self) -> Result<f32, HardwareError>;

    fn proximity_max_range(&self) -> f32;

    fn reboot(&self) -> Result<(), HardwareError>;
}

fn read_node(path: &Path) -> Result<String, HardwareError> {
    std::fs::read_to_string(path).map_err(|source| HardwareError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn write_node(path: &Path, value: &str) -> Result<(), HardwareError> {
    debug!("Writing {:?} to {}", value, path.display());
    std::fs::write(path, value).map_err(|source| HardwareError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_node<T: std::str::FromStr>(path: &Path) -> Result<T, HardwareError> {
    let value = read_node(path)?;
    value.trim().parse().map_err(|_| HardwareError::Parse {
        path: path.to_path_buf(),
        value,
    })
}

/// Hardware backed by sysfs nodes
pub struct SysfsHardware {
    config: HardwareConfig,
    brightness_path: Option<PathBuf>,
}

impl SysfsHardware {
    pub fn new(config: HardwareConfig) -> Self {
        let brightness_path = config.brightness_paths.iter().find(|p| p.exists()).cloned();
        match &brightness_path {
            Some(path) => info!("Using brightness node {}", path.display()),
            None => warn!("No brightness node found, brightness control disabled"),
        }

        Self {
            config,
            brightness_path,
        }
    }

    fn relay_nodes(&self, num: usize) -> Result<&[PathBuf], HardwareError> {
        self.config
            .relay_paths
            .get(num)
            .map(Vec::as_slice)
            .ok_or_else(|| HardwareError::Unsupported(format!("relay {}", num)))
    }

    fn brightness_node(&self) -> Result<&Path, HardwareError> {
        self.brightness_path
            .as_deref()
            .ok_or_else(|| HardwareError::Unsupported("brightness".to_string()))
    }
}

impl Hardware for SysfsHardware {
    fn relay_count(&self) -> usize {
        self.config.relay_paths.len()
    }

    fn relay(&self, num: usize) -> Result<bool, HardwareError> {
        let mut state = false;
        let mut last_err = None;
        let mut read_any = false;

        // Revisions expose the relay under different nodes; any one reporting on wins
        for path in self.relay_nodes(num)?.iter().filter(|p| p.exists()) {
            match read_node(path) {
                Ok(contents) => {
                    read_any = true;
                    state |= contents.contains('1');
                }
                Err(e) => last_err = Some(e),
            }
        }

        match (read_any, last_err) {
            (true, _) => Ok(state),
            (false, Some(e)) => Err(e),
            (false, None) => Err(HardwareError::Unsupported(format!("relay {}", num))),
        }
    }

    fn set_relay(&self, num: usize, on: bool) -> Result<(), HardwareError> {
        let value = if on { "1" } else { "0" };
        let mut written = false;
        let mut last_err = None;

        for path in self.relay_nodes(num)?.iter().filter(|p| p.exists()) {
            match write_node(path, value) {
                Ok(()) => written = true,
                Err(e) => {
                    warn!("{}", e);
                    last_err = Some(e);
                }
            }
        }

        match (written, last_err) {
            (true, _) => Ok(()),
            (false, Some(e)) => Err(e),
            (false, None) => Err(HardwareError::Unsupported(format!("relay {}", num))),
        }
    }

    fn brightness(&self) -> Result<u8, HardwareError> {
        let path = self.brightness_node()?;
        let raw: u32 = parse_node(path)?;
        Ok(raw.min(255) as u8)
    }

    fn set_brightness(&self, value: u8) -> Result<(), HardwareError> {
        write_node(self.brightness_node()?, &value.to_string())
    }

    fn climate(&self) -> Result<RawClimate, HardwareError> {
        let path = &self.config.climate_path;
        let contents = read_node(path)?;
        RawClimate::parse(&contents).ok_or_else(|| HardwareError::Parse {
            path: path.clone(),
            value: contents,
        })
    }

    fn light_level(&self) -> Result<f32, HardwareError> {
        parse_node(&self.config.light_path)
    }

    fn proximity(&self) -> Result<f32, HardwareError> {
        parse_node(&self.config.proximity_path)
    }

    fn proximity_max_range(&self) -> f32 {
        self.config.proximity_max_range
    }

    fn reboot(&self) -> Result<(), HardwareError> {
        let (program, args) = self
            .config
            .reboot_command
            .split_first()
            .ok_or_else(|| HardwareError::Reboot("no reboot command configured".to_string()))?;

        info!("Rebooting via {:?}", self.config.reboot_command);
        let status = Command::new(program)
            .args(args)
            .status()
            .map_err(|e| HardwareError::Reboot(e.to_string()))?;

        if status.success() {
            Ok(())
        } else {
            Err(HardwareError::Reboot(format!("command exited with {}", status)))
        }
    }
}

/// In-memory hardware for tests
#[cfg(test)]
#[derive(Debug)]
pub struct MemoryHardware {
    pub relays: std::sync::Mutex<Vec<bool>>,
    pub brightness: std::sync::Mutex<u8>,
    pub climate: std::sync::Mutex<Option<RawClimate>>,
    pub lux: std::sync::Mutex<f32>,
    pub distance: std::sync::Mutex<f32>,
    pub reboots: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl Default for MemoryHardware {
    fn default() -> Self {
        Self {
            relays: std::sync::Mutex::new(vec![false]),
            brightness: std::sync::Mutex::new(255),
            climate: std::sync::Mutex::new(Some(RawClimate {
                humidity: 32768.0,
                temperature: 26214.0,
            })),
            lux: std::sync::Mutex::new(100.0),
            distance: std::sync::Mutex::new(5.0),
            reboots: std::sync::atomic::AtomicUsize::new(0),
        }
    }
}

#[cfg(test)]
impl Hardware for MemoryHardware {
    fn relay_count(&self) -> usize {
        self.relays.lock().unwrap().len()
    }

    fn relay(&self, num: usize) -> Result<bool, HardwareError> {
        self.relays
            .lock()
            .unwrap()
            .get(num)
            .copied()
            .ok_or_else(|| HardwareError::Unsupported(format!("relay {}", num)))
    }

    fn set_relay(&self, num: usize, on: bool) -> Result<(), HardwareError> {
        let mut relays = self.relays.lock().unwrap();
        let slot = relays
            .get_mut(num)
            .ok_or_else(|| HardwareError::Unsupported(format!("relay {}", num)))?;
        *slot = on;
        Ok(())
    }

    fn brightness(&self) -> Result<u8, HardwareError> {
        Ok(*self.brightness.lock().unwrap())
    }

    fn set_brightness(&self, value: u8) -> Result<(), HardwareError> {
        *self.brightness.lock().unwrap() = value;
        Ok(())
    }

    fn climate(&self) -> Result<RawClimate, HardwareError> {
        self.climate
            .lock()
            .unwrap()
            .ok_or_else(|| HardwareError::Unsupported("climate".to_string()))
    }

    fn light_level(&self) -> Result<f32, HardwareError> {
        Ok(*self.lux.lock().unwrap())
    }

    fn proximity(&self) -> Result<f32, HardwareError> {
        Ok(*self.distance.lock().unwrap())
    }

    fn proximity_max_range(&self) -> f32 {
        5.0
    }

    fn reboot(&self) -> Result<(), HardwareError> {
        self.reboots
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

mod hardware;
mod model;

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

#[cfg(test)]
pub use hardware::MemoryHardware;
pub use hardware::Hardware;
pub use hardware::HardwareError;
pub use hardware::RawClimate;
pub use hardware::SysfsHardware;
pub use model::DeviceModel;

/// Reboots are refused until the process has been up this long
pub const MIN_UPTIME_BEFORE_REBOOT: Duration = Duration::from_secs(20);

/// Calibrated climate reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Climate {
    /// Degrees Celsius, one decimal place
    pub temperature: f64,
    /// Relative humidity percent, whole number
    pub humidity: f64,
}

impl Climate {
    pub fn from_raw(raw: RawClimate, model: &DeviceModel) -> Self {
        let temperature = raw.temperature * 175.0 / 65535.0 - 45.0 + model.temperature_offset;
        let humidity = raw.humidity * 100.0 / 65535.0 + model.humidity_offset;

        Self {
            temperature: (temperature * 10.0).round() / 10.0,
            humidity: humidity.round(),
        }
    }
}

/// Read and calibrate the climate sensor
pub fn read_climate(hw: &dyn Hardware, model: &DeviceModel) -> Result<Climate, HardwareError> {
    hw.climate().map(|raw| Climate::from_raw(raw, model))
}

#[derive(Debug, thiserror::Error)]
pub enum RebootError {
    #[error("Please wait {remaining} seconds before rebooting")]
    TooSoon { remaining: u64 },

    #[error(transparent)]
    Hardware(#[from] HardwareError),
}

/// Rate limit for remote reboot requests
#[derive(Debug, Clone, Copy)]
pub struct RebootPolicy {
    started: Instant,
}

impl RebootPolicy {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn check(&self) -> Result<(), RebootError> {
        let uptime = self.started.elapsed();
        if uptime >= MIN_UPTIME_BEFORE_REBOOT {
            return Ok(());
        }

        let remaining = (MIN_UPTIME_BEFORE_REBOOT - uptime).as_secs_f64().ceil() as u64;
        Err(RebootError::TooSoon { remaining })
    }

    pub fn reboot(&self, hw: &dyn Hardware) -> Result<(), RebootError> {
        self.check()?;
        hw.reboot()?;
        Ok(())
    }
}

impl Default for RebootPolicy {
    fn default() -> Self {
        Self::new()
    }
}

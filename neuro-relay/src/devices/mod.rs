//! Device implementations

pub mod noise;
pub mod simulated;

use crate::config::DeviceConfig;
use crate::core::device::SourceDevice;
use crate::error::{Error, Result};
use simulated::SimulatedDevice;

/// Create the local device described by the configuration
///
/// Returns `None` for `type = "none"`.
pub fn create_device(config: &DeviceConfig) -> Result<Option<Box<dyn SourceDevice>>> {
    match config.device_type.as_str() {
        "simulated" => {
            let device = SimulatedDevice::start(config)?;
            Ok(Some(Box::new(device)))
        }
        "none" => Ok(None),
        other => Err(Error::Config(format!("unknown device type: {}", other))),
    }
}

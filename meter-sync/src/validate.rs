use crate::config::{DeviceConfig, MeterChannel};
use crate::errors::{Error, Result};
use crate::model::DeviceClass;

const CHANNEL_MIN: u8 = 1;
const CHANNEL_MAX: u8 = 2;

/// Validates a paired device record before the engine is started for it.
pub fn validate(device: &DeviceConfig) -> Result<()> {
    if device.id.trim().is_empty() {
        return Err(Error::Validation("Device ID cannot be empty".to_string()));
    }

    match device.class {
        DeviceClass::Switch if device.monitor_id.is_none() => {
            return Err(Error::Validation(format!(
                "Switch {} has no monitor id",
                device.id
            )));
        }
        DeviceClass::GasWater => {
            if device.gas.is_none() && device.water.is_none() {
                return Err(Error::Validation(format!(
                    "Sensor {} has neither a gas nor a water channel",
                    device.id
                )));
            }
            for channel in device.gas.iter().chain(device.water.iter()) {
                validate_channel(&device.id, channel)?;
            }
        }
        _ => {}
    }

    Ok(())
}

fn validate_channel(id: &str, channel: &MeterChannel) -> Result<()> {
    if channel.channel < CHANNEL_MIN || channel.channel > CHANNEL_MAX {
        return Err(Error::Validation(format!(
            "Sensor {} channel {} out of range [{}, {}]",
            id, channel.channel, CHANNEL_MIN, CHANNEL_MAX
        )));
    }

    // Zero or missing ppu disables the counter, a negative one is a pairing bug.
    if channel.ppu.is_some_and(|ppu| ppu < 0.0 || !ppu.is_finite()) {
        return Err(Error::Validation(format!(
            "Sensor {} channel {} has invalid pulses per unit {:?}",
            id, channel.channel, channel.ppu
        )));
    }

    Ok(())
}

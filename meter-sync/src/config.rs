use crate::errors::{Error, Result};
use crate::model::{capability, CapabilitySet, DeviceClass, DeviceIdentity};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://app1pub.smappee.net/dev/v3";

/// Start of the historical window summed on a device's first sync (2010-01-01 UTC).
pub const HISTORY_EPOCH_MS: i64 = 1_262_304_000_000;

#[derive(Debug, Clone)]
pub struct Config {
    pub api_url: String,
    pub access_token: String,
    pub mqtt: MqttConfig,
    pub hub_id: String,
    pub poll_interval: Duration,
    pub keep_alive: KeepAliveConfig,
    pub http_addr: String,
    pub devices_file: String,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    pub tls: bool,
    pub connect_timeout: Duration,
    pub reconnect_period: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct KeepAliveConfig {
    pub interval: Duration,
    pub delay: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(45),
            delay: Duration::from_millis(1000),
        }
    }
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parsed_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        let hub_id = env::var("HUB_ID").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());

        Self {
            api_url: var_or("METERING_API_URL", DEFAULT_API_URL),
            access_token: var_or("METERING_ACCESS_TOKEN", ""),
            mqtt: MqttConfig {
                broker: var_or("MQTT_BROKER", "mqtt.smappee.net"),
                port: parsed_or("MQTT_PORT", 443),
                tls: parsed_or("MQTT_TLS", true),
                connect_timeout: Duration::from_secs(parsed_or("MQTT_CONNECT_TIMEOUT_SECS", 5)),
                reconnect_period: Duration::from_millis(parsed_or("MQTT_RECONNECT_MS", 3000)),
            },
            hub_id,
            poll_interval: Duration::from_secs(parsed_or("POLL_INTERVAL_SECS", 60)),
            keep_alive: KeepAliveConfig {
                interval: Duration::from_secs(parsed_or("KEEP_ALIVE_SECS", 45)),
                delay: Duration::from_millis(parsed_or("KEEP_ALIVE_DELAY_MS", 1000)),
            },
            http_addr: var_or("HTTP_ADDR", "0.0.0.0:8080"),
            devices_file: var_or("DEVICES_FILE", "devices.json"),
        }
    }
}

/// A gas or water counter wired to one of a sensor's pulse channels.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MeterChannel {
    pub channel: u8,
    #[serde(default)]
    pub ppu: Option<f64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub uom: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// A paired device as stored by the pairing flow.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    pub class: DeviceClass,
    #[serde(default)]
    pub name: Option<String>,
    pub location_id: u64,
    #[serde(default)]
    pub location_uuid: Option<String>,
    #[serde(default)]
    pub monitor_id: Option<String>,
    #[serde(default)]
    pub led_id: Option<String>,
    #[serde(default)]
    pub station_serial: Option<String>,
    #[serde(default)]
    pub position: Option<u32>,
    #[serde(default)]
    pub gas: Option<MeterChannel>,
    #[serde(default)]
    pub water: Option<MeterChannel>,
    #[serde(default)]
    pub capabilities: Option<CapabilitySet>,
}

impl DeviceConfig {
    pub fn new(id: &str, class: DeviceClass, location_id: u64, location_uuid: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            class,
            name: None,
            location_id,
            location_uuid: location_uuid.map(str::to_string),
            monitor_id: None,
            led_id: None,
            station_serial: None,
            position: None,
            gas: None,
            water: None,
            capabilities: None,
        }
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            device_id: self.id.clone(),
            location_id: self.location_id,
            location_uuid: self.location_uuid.clone().filter(|u| !u.is_empty()),
        }
    }

    pub fn declared_capabilities(&self) -> CapabilitySet {
        if let Some(caps) = &self.capabilities {
            return caps.clone();
        }

        let mut caps = self.class.default_capabilities();
        if self.gas.is_some() {
            caps.insert(capability::METER_GAS);
        }
        if self.water.is_some() {
            caps.insert(capability::METER_WATER);
        }
        caps
    }
}

pub fn load_devices(path: impl AsRef<Path>) -> Result<Vec<DeviceConfig>> {
    let raw = std::fs::read_to_string(path.as_ref())?;
    let devices: Vec<DeviceConfig> = serde_json::from_str(&raw)
        .map_err(|e| Error::Config(format!("{}: {}", path.as_ref().display(), e)))?;
    Ok(devices)
}

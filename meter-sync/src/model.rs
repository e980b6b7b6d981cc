use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Capability names understood by the mappers and the pull path.
pub mod capability {
    pub const MEASURE_POWER: &str = "measure_power";
    pub const MEASURE_POWER_ALWAYS_ON: &str = "measure_power.alwayson";
    pub const MEASURE_POWER_PRODUCTION: &str = "measure_power.production";
    pub const METER_POWER: &str = "meter_power";
    pub const METER_POWER_PRODUCTION: &str = "meter_power.production";
    pub const METER_GAS: &str = "meter_gas";
    pub const METER_WATER: &str = "meter_water";
    pub const MEASURE_BATTERY: &str = "measure_battery";
    pub const MEASURE_HUMIDITY: &str = "measure_humidity";
    pub const MEASURE_TEMPERATURE: &str = "measure_temperature";
    pub const ONOFF: &str = "onoff";
    pub const CONNECTION_STATE: &str = "connection_state";
    pub const CABLE_CONNECTED: &str = "cable_connected";
    pub const CHARGING: &str = "charging";
    pub const CHARGING_MODE: &str = "charging_mode";
    pub const LED_BRIGHTNESS: &str = "led_brightness";

    /// Monotonic counters are advanced by the pull path only.
    pub fn is_accumulator(name: &str) -> bool {
        name.starts_with("meter_")
    }
}

/// Immutable identity of a paired device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub location_id: u64,
    pub location_uuid: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceClass {
    Energy,
    Solar,
    Genius,
    Connect,
    Plus,
    Switch,
    Plug,
    GasWater,
    EvWall,
}

impl DeviceClass {
    /// Capabilities declared at pairing when the device file gives none.
    pub fn default_capabilities(&self) -> CapabilitySet {
        use capability::*;
        let names: &[&str] = match self {
            DeviceClass::Energy => &[MEASURE_POWER, MEASURE_POWER_ALWAYS_ON, METER_POWER],
            DeviceClass::Solar => &[MEASURE_POWER_PRODUCTION, METER_POWER_PRODUCTION],
            DeviceClass::Genius | DeviceClass::Connect | DeviceClass::Plus => &[
                MEASURE_POWER,
                MEASURE_POWER_PRODUCTION,
                MEASURE_POWER_ALWAYS_ON,
                METER_POWER,
                METER_POWER_PRODUCTION,
            ],
            DeviceClass::Switch => &[CONNECTION_STATE, MEASURE_POWER, METER_POWER, ONOFF],
            DeviceClass::Plug => &[ONOFF],
            DeviceClass::GasWater => &[MEASURE_BATTERY, MEASURE_HUMIDITY, MEASURE_TEMPERATURE],
            DeviceClass::EvWall => &[
                MEASURE_POWER,
                MEASURE_POWER_ALWAYS_ON,
                CABLE_CONNECTED,
                CHARGING,
                CHARGING_MODE,
                LED_BRIGHTNESS,
            ],
        };
        names.iter().copied().collect()
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceClass::Energy => "energy",
            DeviceClass::Solar => "solar",
            DeviceClass::Genius => "genius",
            DeviceClass::Connect => "connect",
            DeviceClass::Plus => "plus",
            DeviceClass::Switch => "switch",
            DeviceClass::Plug => "plug",
            DeviceClass::GasWater => "gas-water",
            DeviceClass::EvWall => "ev-wall",
        };
        f.write_str(name)
    }
}

/// The set of capabilities a device declares.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<String>);

impl CapabilitySet {
    pub fn has(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    pub fn insert(&mut self, name: impl Into<String>) {
        self.0.insert(name.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<'a> FromIterator<&'a str> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        Self(iter.into_iter().map(str::to_string).collect())
    }
}

/// Aggregation level of a metering window, using the API's numeric codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    FiveMinutes,
    Hourly,
    Daily,
    Monthly,
    Quarterly,
}

impl Granularity {
    pub fn code(&self) -> u8 {
        match self {
            Granularity::FiveMinutes => 1,
            Granularity::Hourly => 2,
            Granularity::Daily => 3,
            Granularity::Monthly => 4,
            Granularity::Quarterly => 5,
        }
    }
}

/// One timestamped record of a metering window. Field names are the vendor's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub timestamp: i64,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl Record {
    pub fn new(timestamp: i64) -> Self {
        Self {
            timestamp,
            fields: serde_json::Map::new(),
        }
    }

    pub fn with(mut self, field: &str, value: f64) -> Self {
        self.fields.insert(field.to_string(), serde_json::json!(value));
        self
    }

    /// Numeric field value; `null` and non-numbers read as absent.
    pub fn number(&self, field: &str) -> Option<f64> {
        self.fields.get(field).and_then(|v| v.as_f64())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CapabilityValue {
    Number(f64),
    Bool(bool),
    Text(String),
}

impl From<f64> for CapabilityValue {
    fn from(v: f64) -> Self {
        CapabilityValue::Number(v)
    }
}

impl From<bool> for CapabilityValue {
    fn from(v: bool) -> Self {
        CapabilityValue::Bool(v)
    }
}

impl From<String> for CapabilityValue {
    fn from(v: String) -> Self {
        CapabilityValue::Text(v)
    }
}

impl From<&str> for CapabilityValue {
    fn from(v: &str) -> Self {
        CapabilityValue::Text(v.to_string())
    }
}

/// A capability value as applied to the device, with its application time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedValue {
    pub value: CapabilityValue,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Subscribed,
    Degraded,
}

//! Per-device-class translation of payloads and records into capability writes.
//!
//! The class is fixed when the device is built; [`DeviceMapper`] is the
//! dispatch table for both the push path ([`DeviceMapper::map_message`]) and
//! the pull path ([`DeviceMapper::pull_profile`]). No mapping ever produces a
//! capability the device does not declare.

use crate::aggregator::{AccumulatorSpec, PointSpec};
use crate::api::MeterSource;
use crate::config::{DeviceConfig, MeterChannel};
use crate::model::capability::*;
use crate::model::{CapabilitySet, CapabilityValue, DeviceClass};
use crate::normalize::Payload;
use serde_json::Value;

/// Five-minute energy (Wh) times twelve is the average power (W) of the window.
const WINDOWS_PER_HOUR: f64 = 12.0;
const WH_PER_KWH: f64 = 1000.0;

#[derive(Debug, Clone, PartialEq)]
pub enum Availability {
    Available,
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum WarningChange {
    Set(String),
    Clear,
}

/// Outcome of mapping one payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mapped {
    pub writes: Vec<(&'static str, CapabilityValue)>,
    /// `None` means the payload said nothing; the session then marks the device available.
    pub availability: Option<Availability>,
    /// `None` means the session clears any outstanding warning.
    pub warning: Option<WarningChange>,
}

impl Mapped {
    fn put(&mut self, declared: &CapabilitySet, name: &'static str, value: impl Into<CapabilityValue>) {
        if declared.has(name) {
            self.writes.push((name, value.into()));
        }
    }
}

/// What one poll cycle reads for a device.
#[derive(Debug, Clone, PartialEq)]
pub struct PullProfile {
    pub source: Option<MeterSource>,
    pub fill_gaps: bool,
    pub accumulators: Vec<AccumulatorSpec>,
    pub points: Vec<PointSpec>,
    pub actuator_id: Option<String>,
    pub led_id: Option<String>,
}

impl PullProfile {
    fn empty() -> Self {
        Self {
            source: None,
            fill_gaps: false,
            accumulators: Vec::new(),
            points: Vec::new(),
            actuator_id: None,
            led_id: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_none() && self.actuator_id.is_none() && self.led_id.is_none()
    }
}

/// IEC 61851 state of a charging connector.
///
/// A = no EV, B = cable connected, C = charging, x1/x2 = supply not ready/ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargingState {
    pub current: Option<String>,
    pub previous: Option<String>,
}

impl ChargingState {
    pub fn from_payload(status: &Value) -> Self {
        let read = |key: &str| status.get(key).and_then(Value::as_str).map(str::to_string);
        Self {
            current: read("current"),
            previous: read("previous"),
        }
    }

    pub fn is_charging(&self) -> bool {
        matches!(self.current.as_deref(), Some("C1") | Some("C2"))
    }

    pub fn is_cable_connected(&self) -> bool {
        matches!(self.current.as_deref(), Some("B1") | Some("B2")) || self.is_charging()
    }
}

#[derive(Debug, Clone)]
pub struct DeviceMapper {
    class: DeviceClass,
    device_id: String,
    declared: CapabilitySet,
}

impl DeviceMapper {
    pub fn new(class: DeviceClass, device_id: &str, declared: CapabilitySet) -> Self {
        Self {
            class,
            device_id: device_id.to_string(),
            declared,
        }
    }

    pub fn class(&self) -> DeviceClass {
        self.class
    }

    pub fn declared(&self) -> &CapabilitySet {
        &self.declared
    }

    /// Subtopic under `servicelocation/{uuid}/`, `None` when the class has no push path.
    pub fn subscribe_topic(&self) -> Option<String> {
        match self.class {
            DeviceClass::Energy
            | DeviceClass::Solar
            | DeviceClass::Genius
            | DeviceClass::Connect
            | DeviceClass::Plus => Some("power".to_string()),
            DeviceClass::Switch | DeviceClass::Plug => Some(format!("plug/{}/#", self.device_id)),
            DeviceClass::EvWall => Some("#".to_string()),
            DeviceClass::GasWater => None,
        }
    }

    /// Whether the broker must be told periodically that this device is observed.
    pub fn needs_keep_alive(&self) -> bool {
        self.class == DeviceClass::EvWall
    }

    /// Structured members the mapper reads; everything else structured is noise.
    pub fn retained_keys(&self) -> &'static [&'static str] {
        match self.class {
            DeviceClass::EvWall => &["iecStatus", "configurationPropertyValues"],
            _ => &[],
        }
    }

    pub fn map_message(&self, topic: &str, payload: &Payload) -> Mapped {
        match self.class {
            DeviceClass::Energy
            | DeviceClass::Solar
            | DeviceClass::Genius
            | DeviceClass::Connect
            | DeviceClass::Plus => self.map_power(payload),
            DeviceClass::Switch | DeviceClass::Plug => self.map_plug(topic, payload),
            DeviceClass::EvWall => self.map_charger(topic, payload),
            DeviceClass::GasWater => Mapped::default(),
        }
    }

    fn map_power(&self, payload: &Payload) -> Mapped {
        let mut mapped = Mapped::default();
        let fields = [
            ("consumptionPower", MEASURE_POWER),
            ("alwaysOn", MEASURE_POWER_ALWAYS_ON),
            ("solarPower", MEASURE_POWER_PRODUCTION),
        ];
        for (field, name) in fields {
            if let Some(v) = payload.get(field).and_then(Value::as_f64) {
                mapped.put(&self.declared, name, v);
            }
        }
        mapped
    }

    fn map_plug(&self, topic: &str, payload: &Payload) -> Mapped {
        let mut mapped = Mapped::default();
        let value = payload.get("value").and_then(Value::as_str);

        if topic.ends_with("connectionState") {
            if let Some(state) = value {
                let state = state.to_lowercase();
                if self.declared.has(CONNECTION_STATE) {
                    mapped.warning = Some(match state.as_str() {
                        "disconnected" => WarningChange::Set("Switch is disconnected".to_string()),
                        "unreachable" => WarningChange::Set("Switch is unreachable".to_string()),
                        _ => WarningChange::Clear,
                    });
                }
                mapped.put(&self.declared, CONNECTION_STATE, state);
            }
        } else if topic.ends_with("state") {
            if let Some(state) = value {
                mapped.put(&self.declared, ONOFF, is_on(state));
            }
        }

        mapped
    }

    fn map_charger(&self, topic: &str, payload: &Payload) -> Mapped {
        let mut mapped = Mapped::default();

        if topic.ends_with("updated") {
            if let Some(brightness) = brightness_from_update(payload) {
                mapped.put(&self.declared, LED_BRIGHTNESS, brightness);
            }
            return mapped;
        }

        if !(topic.ends_with("chargingstate") || topic.ends_with("power")) {
            return mapped;
        }

        if let Some(v) = payload.get("consumptionPower").and_then(Value::as_f64) {
            mapped.put(&self.declared, MEASURE_POWER, v);
        }
        if let Some(v) = payload.get("alwaysOn").and_then(Value::as_f64) {
            mapped.put(&self.declared, MEASURE_POWER_ALWAYS_ON, v);
        }
        if let Some(mode) = payload.get("chargingMode").and_then(Value::as_str) {
            mapped.put(&self.declared, CHARGING_MODE, mode.to_lowercase());
        }

        if let Some(status) = payload.get("iecStatus") {
            let state = ChargingState::from_payload(status);
            mapped.put(&self.declared, CABLE_CONNECTED, state.is_cable_connected());
            mapped.put(&self.declared, CHARGING, state.is_charging());
        } else if let Some(state) = payload.get("chargingState").and_then(Value::as_str) {
            mapped.put(&self.declared, CABLE_CONNECTED, state != "STOPPED");
        }

        if let Some(available) = payload.get("available").and_then(Value::as_bool) {
            mapped.availability = Some(if available {
                Availability::Available
            } else {
                Availability::Unavailable("Charger is unavailable".to_string())
            });
        }

        mapped
    }

    /// Pull-path plan for this device, restricted to declared capabilities.
    pub fn pull_profile(&self, device: &DeviceConfig) -> PullProfile {
        let mut profile = PullProfile::empty();

        match self.class {
            DeviceClass::Energy
            | DeviceClass::Solar
            | DeviceClass::Genius
            | DeviceClass::Connect
            | DeviceClass::Plus => {
                profile.source = Some(MeterSource::ServiceLocation);
                profile.accumulators = vec![
                    AccumulatorSpec::new(METER_POWER, "consumption", Some(WH_PER_KWH)),
                    AccumulatorSpec::new(METER_POWER_PRODUCTION, "solar", Some(WH_PER_KWH)),
                ];
            }
            DeviceClass::Switch => {
                profile.source = device.monitor_id.clone().map(|monitor_id| MeterSource::Switch {
                    monitor_id,
                });
                profile.accumulators =
                    vec![AccumulatorSpec::new(METER_POWER, "active", Some(WH_PER_KWH))];
                profile.points = vec![PointSpec::scaled(MEASURE_POWER, "active", WINDOWS_PER_HOUR)];
                profile.actuator_id = Some(device.id.clone());
            }
            DeviceClass::Plug => {
                profile.actuator_id = Some(device.id.clone());
            }
            DeviceClass::GasWater => {
                profile.source = Some(MeterSource::Sensor {
                    sensor_id: device.id.clone(),
                });
                profile.fill_gaps = true;
                if let Some(gas) = &device.gas {
                    profile.accumulators.push(channel_spec(METER_GAS, gas));
                }
                if let Some(water) = &device.water {
                    profile.accumulators.push(channel_spec(METER_WATER, water));
                }
                profile.points = vec![
                    PointSpec::new(MEASURE_BATTERY, "battery"),
                    PointSpec::new(MEASURE_HUMIDITY, "humidity"),
                    PointSpec::new(MEASURE_TEMPERATURE, "temperature"),
                ];
            }
            DeviceClass::EvWall => {
                profile.led_id = device.led_id.clone().filter(|_| self.declared.has(LED_BRIGHTNESS));
            }
        }

        profile
            .accumulators
            .retain(|spec| self.declared.has(spec.capability));
        profile.points.retain(|spec| self.declared.has(spec.capability));
        if profile.actuator_id.is_some() && !self.declared.has(ONOFF) {
            profile.actuator_id = None;
        }
        if profile.accumulators.is_empty() && profile.points.is_empty() {
            profile.source = None;
        }

        profile
    }
}

fn channel_spec(capability: &'static str, channel: &MeterChannel) -> AccumulatorSpec {
    let ratio = channel.ppu.filter(|_| channel.enabled);
    AccumulatorSpec::new(capability, format!("value{}", channel.channel), ratio)
}

pub fn is_on(state: &str) -> bool {
    state == "ON_ON" || state == "ON"
}

fn brightness_from_update(payload: &Payload) -> Option<f64> {
    payload
        .get("configurationPropertyValues")?
        .as_array()?
        .iter()
        .filter(|c| {
            c.get("propertySpecName")
                .and_then(Value::as_str)
                .is_some_and(|name| name.ends_with("brightness"))
        })
        .last()
        .map(|c| match c.get("value") {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            Some(Value::String(s)) => s.parse().unwrap_or(0.0),
            _ => 0.0,
        })
}

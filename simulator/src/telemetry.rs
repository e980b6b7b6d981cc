use rand::Rng;
use serde::{Deserialize, Serialize};

/// Realtime message on `servicelocation/{uuid}/power`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerMessage {
    pub utc_time_stamp: i64,
    pub consumption_power: f64,
    pub always_on: f64,
    pub solar_power: f64,
    pub channel_powers: Vec<ChannelPower>,
    pub voltages: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelPower {
    pub ct_input: u8,
    pub power: f64,
    pub export_energy: f64,
    pub import_energy: f64,
}

/// Plug `state` and `connectionState` messages both carry a single value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlugMessage {
    pub value: String,
}

impl PowerMessage {
    pub fn random(rng: &mut impl Rng, timestamp: i64, channels: u8) -> Self {
        let always_on = rng.gen_range(30.0..80.0);
        let consumption_power = always_on + rng.gen_range(0.0..3000.0);
        let solar_power = if rng.gen_bool(0.5) {
            rng.gen_range(0.0..2500.0)
        } else {
            0.0
        };

        let channel_powers = (0..channels)
            .map(|ct_input| ChannelPower {
                ct_input,
                power: consumption_power / f64::from(channels.max(1)),
                export_energy: 0.0,
                import_energy: rng.gen_range(0.0..10.0),
            })
            .collect();

        Self {
            utc_time_stamp: timestamp,
            consumption_power,
            always_on,
            solar_power,
            channel_powers,
            voltages: (0..3).map(|_| rng.gen_range(225.0..235.0)).collect(),
        }
    }
}

impl PlugMessage {
    pub fn state(on: bool) -> Self {
        Self {
            value: if on { "ON_ON" } else { "OFF_OFF" }.to_string(),
        }
    }

    pub fn connection(rng: &mut impl Rng) -> Self {
        let value = if rng.gen_bool(0.1) {
            "UNREACHABLE"
        } else {
            "CONNECTED"
        };
        Self {
            value: value.to_string(),
        }
    }
}

//! Request/response access to the metering API.
//!
//! The engine only depends on [`MeteringApi`]; [`HttpMeteringClient`] is the
//! production implementation. Token acquisition and refresh live behind
//! [`TokenSource`].

use crate::errors::{Error, Result};
use crate::model::{Granularity, Record};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Utc};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const LED_BRIGHTNESS_SPEC: &str = "etc.smart.device.type.car.charger.led.config.brightness";

/// Which meter a window of records is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeterSource {
    ServiceLocation,
    Switch { monitor_id: String },
    Sensor { sensor_id: String },
}

impl MeterSource {
    fn uri(&self) -> String {
        match self {
            MeterSource::ServiceLocation => "/consumption".to_string(),
            MeterSource::Switch { monitor_id } => format!("/switch/{}/consumption", monitor_id),
            MeterSource::Sensor { sensor_id } => format!("/sensor/{}/consumption", sensor_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowRequest {
    pub source: MeterSource,
    pub location_id: u64,
    pub from: i64,
    pub to: i64,
    pub granularity: Granularity,
    pub fill_gaps: bool,
}

#[async_trait]
pub trait MeteringApi: Send + Sync {
    /// Records of `[from, to]`, oldest first.
    async fn fetch_window(&self, request: &WindowRequest) -> Result<Vec<Record>>;

    async fn fetch_actuator_state(&self, actuator_id: &str, location_id: u64) -> Result<String>;

    async fn set_actuator_state(
        &self,
        actuator_id: &str,
        location_id: u64,
        state: &str,
        duration: u32,
    ) -> Result<()>;

    async fn set_charging_mode(&self, station_serial: &str, position: u32, mode: &str)
        -> Result<()>;

    async fn fetch_led_brightness(&self, location_id: u64, led_id: &str) -> Result<f64>;

    async fn set_led_brightness(&self, location_id: u64, led_id: &str, brightness: u8)
        -> Result<()>;
}

#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self) -> Result<String>;
}

/// A token handed in from outside, e.g. by an environment variable.
pub struct StaticToken(pub String);

#[async_trait]
impl TokenSource for StaticToken {
    async fn access_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

pub struct HttpMeteringClient {
    base_url: String,
    tokens: Arc<dyn TokenSource>,
    client: reqwest::Client,
}

impl HttpMeteringClient {
    pub fn new(base_url: &str, tokens: Arc<dyn TokenSource>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
            client,
        })
    }

    async fn send(&self, method: reqwest::Method, path: &str, body: Option<Value>) -> Result<Value> {
        debug!("{} {}", method, path);

        let token = self.tokens.access_token().await?;
        let mut request = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if !token.is_empty() {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| {
            error!("Request error: {}", e);
            Error::Http(e)
        })?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }

        let text = response.text().await?;
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));

        if status.is_success() {
            return Ok(body);
        }

        error!("Request not OK: {} {}", status, body);
        Err(Error::from_status(status.as_u16(), &body))
    }

    async fn get(&self, path: &str) -> Result<Value> {
        self.send(reqwest::Method::GET, path, None).await
    }
}

#[async_trait]
impl MeteringApi for HttpMeteringClient {
    async fn fetch_window(&self, request: &WindowRequest) -> Result<Vec<Record>> {
        let mut path = format!(
            "/servicelocation/{}{}?aggregation={}&from={}&to={}",
            request.location_id,
            request.source.uri(),
            request.granularity.code(),
            request.from,
            request.to
        );
        if request.fill_gaps {
            path.push_str("&fillGaps=true");
        }

        let body = self.get(&path).await?;
        let records = parse_records(&body)?;

        Ok(trim_future(records, Utc::now().timestamp_millis()))
    }

    async fn fetch_actuator_state(&self, actuator_id: &str, location_id: u64) -> Result<String> {
        let body = self
            .get(&format!(
                "/servicelocation/{}/actuator/{}/state",
                location_id, actuator_id
            ))
            .await?;

        match &body {
            Value::String(state) => Ok(state.trim_matches('"').to_string()),
            Value::Object(obj) => obj
                .get("value")
                .or_else(|| obj.get("state"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| Error::Payload(format!("unexpected actuator state {}", body))),
            other => Err(Error::Payload(format!("unexpected actuator state {}", other))),
        }
    }

    async fn set_actuator_state(
        &self,
        actuator_id: &str,
        location_id: u64,
        state: &str,
        duration: u32,
    ) -> Result<()> {
        let path = format!(
            "/servicelocation/{}/actuator/{}/{}",
            location_id, actuator_id, state
        );
        self.send(reqwest::Method::POST, &path, Some(json!({ "duration": duration })))
            .await?;
        Ok(())
    }

    async fn set_charging_mode(
        &self,
        station_serial: &str,
        position: u32,
        mode: &str,
    ) -> Result<()> {
        let path = format!(
            "/chargingstations/{}/connectors/{}/mode",
            station_serial, position
        );
        self.send(
            reqwest::Method::PUT,
            &path,
            Some(json!({ "mode": mode.to_uppercase() })),
        )
        .await?;
        Ok(())
    }

    async fn fetch_led_brightness(&self, location_id: u64, led_id: &str) -> Result<f64> {
        let body = self
            .get(&format!(
                "/servicelocation/{}/smartdevices/{}",
                location_id, led_id
            ))
            .await?;

        Ok(led_brightness_from(&body))
    }

    async fn set_led_brightness(&self, location_id: u64, led_id: &str, brightness: u8) -> Result<()> {
        let path = format!("/servicelocation/{}/smartdevices/{}", location_id, led_id);
        let body = json!({
            "configurationProperties": [{
                "value": brightness,
                "spec": { "name": LED_BRIGHTNESS_SPEC },
            }],
        });
        self.send(reqwest::Method::PATCH, &path, Some(body)).await?;
        Ok(())
    }
}

fn parse_records(body: &Value) -> Result<Vec<Record>> {
    let list = body
        .get("records")
        .or_else(|| body.get("consumptions"))
        .cloned()
        .unwrap_or(Value::Array(Vec::new()));

    let mut records: Vec<Record> = serde_json::from_value(list)?;
    records.sort_by_key(|r| r.timestamp);
    Ok(records)
}

/// Gap-filled windows are padded up to the end of the day; drop the future.
fn trim_future(records: Vec<Record>, now: i64) -> Vec<Record> {
    records.into_iter().take_while(|r| r.timestamp <= now).collect()
}

/// Reads the brightness percentage from a smart device's configuration properties.
pub fn led_brightness_from(device: &Value) -> f64 {
    let Some(properties) = device
        .get("configurationProperties")
        .and_then(Value::as_array)
    else {
        return 0.0;
    };

    properties
        .iter()
        .find(|p| {
            p.pointer("/spec/name")
                .and_then(Value::as_str)
                .is_some_and(|name| name.ends_with("brightness"))
        })
        .and_then(|p| p.get("value"))
        .and_then(|v| match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
        .unwrap_or(0.0)
}

fn at_midnight(day: DateTime<Utc>) -> DateTime<Utc> {
    day.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| Utc.from_utc_datetime(&midnight))
        .unwrap_or(day)
}

pub fn start_of_day(now: DateTime<Utc>) -> i64 {
    at_midnight(now).timestamp_millis()
}

pub fn start_of_yesterday(now: DateTime<Utc>) -> i64 {
    start_of_day(now) - ChronoDuration::days(1).num_milliseconds()
}

/// The last coarse (monthly) boundary before `now`.
pub fn start_of_month(now: DateTime<Utc>) -> i64 {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .map(|d| d.timestamp_millis())
        .unwrap_or_else(|| start_of_day(now))
}

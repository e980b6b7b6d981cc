use crate::api::MeteringApi;
use crate::config::{Config, DeviceConfig, HISTORY_EPOCH_MS};
use crate::errors::{Error, Result};
use crate::mapping::DeviceMapper;
use crate::model::{capability, DeviceClass, SessionState};
use crate::scheduler::{CycleOutcome, Poller, TelemetryScheduler};
use crate::session::{SessionSettings, StreamSession};
use crate::sink::{CapabilityStateSink, SinkWriter};
use crate::transport::Transport;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Timed actuator commands are not used; zero means "until changed".
const ACTUATOR_DURATION: u32 = 0;

/// Engine-wide knobs shared by every device.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub poll_interval: Duration,
    pub history_epoch: i64,
    pub session: SessionSettings,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval,
            history_epoch: HISTORY_EPOCH_MS,
            session: SessionSettings {
                hub_id: config.hub_id.clone(),
                connect_timeout: config.mqtt.connect_timeout,
                reconnect_period: config.mqtt.reconnect_period,
                keep_alive: config.keep_alive,
            },
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            history_epoch: HISTORY_EPOCH_MS,
            session: SessionSettings::default(),
        }
    }
}

/// A paired device: its poll timer, its stream session and its commands.
pub struct Device {
    config: DeviceConfig,
    settings: EngineSettings,
    api: Arc<dyn MeteringApi>,
    sink: SinkWriter,
    scheduler: TelemetryScheduler,
    session: StreamSession,
    removed: AtomicBool,
}

impl Device {
    pub fn new(
        config: DeviceConfig,
        settings: EngineSettings,
        api: Arc<dyn MeteringApi>,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn CapabilityStateSink>,
    ) -> Self {
        let sink = SinkWriter::new(&config.id, sink);
        let mapper = DeviceMapper::new(config.class, &config.id, config.declared_capabilities());
        let identity = config.identity();

        let poller = Poller::new(
            &config.id,
            config.location_id,
            mapper.pull_profile(&config),
            api.clone(),
            sink.clone(),
            settings.history_epoch,
        );
        let session = StreamSession::new(
            identity,
            mapper,
            settings.session.clone(),
            transport,
            sink.clone(),
        );

        Self {
            config,
            settings,
            api,
            sink,
            scheduler: TelemetryScheduler::new(Arc::new(poller)),
            session,
            removed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn class(&self) -> DeviceClass {
        self.config.class
    }

    pub async fn init(&self) {
        info!("[{}] {} has been initialized", self.config.id, self.config.class);

        if self.scheduler.poller().profile().is_empty() {
            info!("[Sync] [{}] Nothing to poll", self.config.id);
        } else {
            self.scheduler.start(self.settings.poll_interval);
        }

        if let Err(e) = self.session.connect().await {
            warn!("[MQTT] [{}] Connect failed: {}", self.config.id, e);
            self.sink.set_warning(&e.to_string()).await;
        }
    }

    /// Cancels the poll timer and closes the stream. Safe to call repeatedly.
    pub async fn remove(&self) {
        if !self.removed.swap(true, Ordering::SeqCst) {
            info!("[{}] {} has been deleted", self.config.id, self.config.class);
        }
        self.scheduler.stop();
        self.session.disconnect().await;
    }

    pub async fn sync_now(&self) -> CycleOutcome {
        self.scheduler.poller().run_cycle().await
    }

    pub fn is_polling(&self) -> bool {
        self.scheduler.is_running()
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub async fn publish(&self, path: &str, message: &Value) -> Result<()> {
        self.session.publish(path, message).await
    }

    pub async fn set_on_off(&self, on: bool) -> Result<()> {
        let state = if on { "ON_ON" } else { "OFF_OFF" };
        info!("[{}] Set actuator state {}", self.config.id, state);
        self.api
            .set_actuator_state(&self.config.id, self.config.location_id, state, ACTUATOR_DURATION)
            .await?;
        self.sink.set_value(capability::ONOFF, on).await;
        Ok(())
    }

    pub async fn set_charging_mode(&self, mode: &str) -> Result<()> {
        let (Some(serial), Some(position)) = (&self.config.station_serial, self.config.position)
        else {
            return Err(Error::Validation(
                "charging station serial and position are required".to_string(),
            ));
        };

        let mode = mode.to_lowercase();
        info!("[{}] Set charging mode {}", self.config.id, mode);
        self.api
            .set_charging_mode(serial, position, &mode.to_uppercase())
            .await?;
        self.sink.set_value(capability::CHARGING_MODE, mode).await;
        Ok(())
    }

    pub async fn set_led_brightness(&self, percentage: u8) -> Result<()> {
        let Some(led_id) = &self.config.led_id else {
            return Err(Error::LedUnsupported);
        };

        let percentage = percentage.min(100);
        self.api
            .set_led_brightness(self.config.location_id, led_id, percentage)
            .await?;
        self.sink
            .set_value(capability::LED_BRIGHTNESS, f64::from(percentage))
            .await;
        Ok(())
    }

    /// Meter replacement: counters restart from history on the next cycle.
    pub async fn reset_meters(&self) {
        self.scheduler.poller().reset().await;
    }
}

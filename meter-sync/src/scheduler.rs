use crate::aggregator::{self, SyncState, SyncUpdate};
use crate::api::{start_of_month, start_of_yesterday, MeteringApi, WindowRequest};
use crate::errors::Result;
use crate::mapping::{is_on, PullProfile};
use crate::metrics::{
    SYNC_CYCLES_TOTAL, SYNC_FAILURES_TOTAL, SYNC_LATENCY_SECONDS, SYNC_SKIPPED_TOTAL,
};
use crate::model::{capability, Granularity};
use crate::sink::SinkWriter;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

const MIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed,
    /// Another cycle of the same device was still running.
    Skipped,
    Failed,
}

/// Everything one cycle read, applied only when every fetch succeeded.
#[derive(Debug, Default)]
struct Collected {
    update: Option<SyncUpdate>,
    actuator_state: Option<String>,
    led_brightness: Option<f64>,
}

/// Fetch, aggregate, apply for one device. Owns the device's watermark and
/// accumulators; nothing else mutates them.
pub struct Poller {
    device_id: String,
    location_id: u64,
    profile: PullProfile,
    api: Arc<dyn MeteringApi>,
    sink: SinkWriter,
    state: Mutex<SyncState>,
    history_epoch: i64,
}

impl Poller {
    pub fn new(
        device_id: &str,
        location_id: u64,
        profile: PullProfile,
        api: Arc<dyn MeteringApi>,
        sink: SinkWriter,
        history_epoch: i64,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            location_id,
            profile,
            api,
            sink,
            state: Mutex::new(SyncState::default()),
            history_epoch,
        }
    }

    pub fn profile(&self) -> &PullProfile {
        &self.profile
    }

    pub async fn state(&self) -> SyncState {
        self.state.lock().await.clone()
    }

    /// Zeroes the accumulators and forgets the watermark; the next cycle reseeds.
    pub async fn reset(&self) {
        info!("[Sync] [{}] Resetting meters", self.device_id);
        self.state.lock().await.reset();
    }

    pub async fn run_cycle(&self) -> CycleOutcome {
        let Ok(mut state) = self.state.try_lock() else {
            SYNC_SKIPPED_TOTAL.inc();
            info!("[Sync] [{}] Previous cycle still running, skipping", self.device_id);
            return CycleOutcome::Skipped;
        };

        let timer = SYNC_LATENCY_SECONDS.start_timer();
        debug!("[Sync] [{}] Cycle started, watermark {:?}", self.device_id, state.watermark());

        let result = self.collect(&state, Utc::now()).await;
        let outcome = match result {
            Ok(collected) => {
                if let Some(update) = &collected.update {
                    *state = update.state.clone();
                }
                drop(state);
                self.apply(collected).await;
                SYNC_CYCLES_TOTAL.inc();
                CycleOutcome::Completed
            }
            Err(e) => {
                drop(state);
                SYNC_FAILURES_TOTAL.inc();
                error!("[Sync] [{}] Cycle failed: {}", self.device_id, e);
                self.sink.set_unavailable(&e.to_string()).await;
                CycleOutcome::Failed
            }
        };

        timer.observe_duration();
        outcome
    }

    async fn collect(&self, current: &SyncState, now: DateTime<Utc>) -> Result<Collected> {
        let mut collected = Collected::default();

        if let Some(source) = &self.profile.source {
            let to = now.timestamp_millis();
            let request = |from: i64, granularity: Granularity| WindowRequest {
                source: source.clone(),
                location_id: self.location_id,
                from,
                to,
                granularity,
                fill_gaps: self.profile.fill_gaps,
            };

            let update = match current.watermark() {
                None if !self.profile.accumulators.is_empty() => {
                    let boundary = start_of_month(now);
                    info!("[Sync] [{}] First sync, seeding from history", self.device_id);

                    let coarse = self
                        .api
                        .fetch_window(&request(self.history_epoch, Granularity::Monthly))
                        .await?;
                    let fine = self
                        .api
                        .fetch_window(&request(boundary, Granularity::FiveMinutes))
                        .await?;

                    aggregator::seed(
                        &coarse,
                        &fine,
                        boundary,
                        &self.profile.accumulators,
                        &self.profile.points,
                    )
                }
                watermark => {
                    let from = match watermark {
                        Some(w) if !self.profile.accumulators.is_empty() => w,
                        _ => start_of_yesterday(now),
                    };
                    let records = self
                        .api
                        .fetch_window(&request(from, Granularity::FiveMinutes))
                        .await?;

                    aggregator::advance(
                        current,
                        &records,
                        &self.profile.accumulators,
                        &self.profile.points,
                    )
                }
            };
            collected.update = Some(update);
        }

        if let Some(actuator_id) = &self.profile.actuator_id {
            let state = self
                .api
                .fetch_actuator_state(actuator_id, self.location_id)
                .await?;
            collected.actuator_state = Some(state);
        }

        if let Some(led_id) = &self.profile.led_id {
            let brightness = self.api.fetch_led_brightness(self.location_id, led_id).await?;
            collected.led_brightness = Some(brightness);
        }

        Ok(collected)
    }

    async fn apply(&self, collected: Collected) {
        if let Some(update) = &collected.update {
            for (name, value) in update.accumulator_values() {
                self.sink.set_value(name, value).await;
            }
            for (name, value) in &update.points {
                self.sink.set_value(name, *value).await;
            }
        }

        if let Some(state) = &collected.actuator_state {
            self.sink.set_value(capability::ONOFF, is_on(state)).await;
        }

        if let Some(brightness) = collected.led_brightness {
            self.sink.set_value(capability::LED_BRIGHTNESS, brightness).await;
        }

        self.sink.set_available().await;
    }
}

/// Per-device repeating timer driving [`Poller::run_cycle`].
pub struct TelemetryScheduler {
    poller: Arc<Poller>,
    timer: StdMutex<Option<JoinHandle<()>>>,
}

impl TelemetryScheduler {
    pub fn new(poller: Arc<Poller>) -> Self {
        Self {
            poller,
            timer: StdMutex::new(None),
        }
    }

    pub fn poller(&self) -> &Arc<Poller> {
        &self.poller
    }

    /// Runs one cycle now and then every `every`. A no-op while running.
    pub fn start(&self, every: Duration) {
        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if timer.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let every = every.max(MIN_INTERVAL);
        let poller = self.poller.clone();
        info!("[Timer] [{}] Polling every {:?}", poller.device_id, every);

        *timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                poller.run_cycle().await;
            }
        }));
    }

    pub fn stop(&self) {
        let taken = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(timer) = taken {
            timer.abort();
            info!("[Timer] [{}] Polling stopped", self.poller.device_id);
        }
    }

    pub fn is_running(&self) -> bool {
        self.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }
}

impl Drop for TelemetryScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

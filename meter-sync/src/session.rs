//! One resilient publish/subscribe session per device.
//!
//! State machine: `Disconnected -> Connecting -> Subscribed`,
//! `Subscribed -> Degraded` when the broker reports a problem, back to
//! `Subscribed` on the next connect, and `Disconnected` on explicit teardown.
//! Broker trouble only ever raises advisory warnings; unparseable payloads
//! mark the device unavailable without touching the session.

use crate::config::KeepAliveConfig;
use crate::errors::{Error, Result};
use crate::mapping::{Availability, DeviceMapper, WarningChange};
use crate::metrics::{ACTIVE_SESSIONS, INVALID_MESSAGES_TOTAL, MESSAGES_TOTAL};
use crate::model::{capability, DeviceIdentity, SessionState};
use crate::normalize::normalize;
use crate::sink::SinkWriter;
use crate::transport::{BrokerSession, ConnectOptions, Transport, TransportEvent};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

const TRACKING_PATH: &str = "tracking";

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub hub_id: String,
    pub connect_timeout: Duration,
    pub reconnect_period: Duration,
    pub keep_alive: KeepAliveConfig,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            hub_id: "local".to_string(),
            connect_timeout: Duration::from_secs(5),
            reconnect_period: Duration::from_millis(3000),
            keep_alive: KeepAliveConfig::default(),
        }
    }
}

/// `servicelocation/{uuid}/{subtopic}/{path}`, with any wildcard dropped from the subtopic.
pub fn command_topic(location_uuid: &str, subtopic: &str, path: &str) -> String {
    let base = subtopic.trim_end_matches('#').trim_end_matches('/');
    if base.is_empty() {
        format!("servicelocation/{}/{}", location_uuid, path)
    } else {
        format!("servicelocation/{}/{}/{}", location_uuid, base, path)
    }
}

/// Everything the event and keep-alive tasks share for one open session.
struct SessionContext {
    device_id: String,
    client_id: String,
    topic: String,
    command_base: (String, String),
    client: Arc<dyn BrokerSession>,
    mapper: DeviceMapper,
    sink: SinkWriter,
    state: Arc<watch::Sender<SessionState>>,
    keep_alive_delay: Duration,
    /// Untrack/track sequence started by the latest connect.
    presence: StdMutex<Option<JoinHandle<()>>>,
}

impl SessionContext {
    async fn run(self: Arc<Self>, mut events: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(event).await;
        }
        debug!("[MQTT] [{}] Event stream closed", self.device_id);
    }

    async fn handle(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Connect => self.on_connect().await,
            TransportEvent::Message { topic, payload } => self.on_message(&topic, &payload).await,
            TransportEvent::Disconnect => {
                info!("[MQTT] [{}] onDisconnect()", self.device_id);
                self.degrade();
                self.sink.set_warning("Disconnected from service").await;
            }
            TransportEvent::Error(e) => {
                error!("[MQTT] [{}] {}", self.device_id, e);
                self.degrade();
                self.sink.set_warning("Service error").await;
            }
            TransportEvent::Offline => {
                error!("[MQTT] [{}] onOffline()", self.device_id);
                self.degrade();
                self.sink.set_warning("Service is offline").await;
            }
            TransportEvent::Reconnect => {
                info!("[MQTT] [{}] onReconnect()", self.device_id);
                self.sink.set_warning("Reconnecting to service").await;
            }
        }
    }

    fn degrade(&self) {
        self.state.send_if_modified(|state| {
            if *state == SessionState::Subscribed {
                *state = SessionState::Degraded;
                true
            } else {
                false
            }
        });
    }

    async fn on_connect(self: &Arc<Self>) {
        info!("[MQTT] [{}] onConnect()", self.device_id);
        self.sink.unset_warning().await;

        if let Err(e) = self.client.subscribe(&self.topic).await {
            error!("[MQTT] [{}] Subscribe failed: {}", self.device_id, e);
            self.sink.set_warning("Service error").await;
            return;
        }

        info!("[MQTT] [{}] Subscribed to {}", self.device_id, self.topic);
        self.state.send_replace(SessionState::Subscribed);

        if self.mapper.needs_keep_alive() {
            let ctx = Arc::clone(self);
            let task = tokio::spawn(async move { ctx.assert_presence().await });
            let previous = self
                .presence
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .replace(task);
            if let Some(previous) = previous {
                previous.abort();
            }
        }
    }

    async fn on_message(&self, topic: &str, payload: &[u8]) {
        MESSAGES_TOTAL.inc();

        let payload = match normalize(payload, self.mapper.retained_keys()) {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                self.sink.unset_warning().await;
                return;
            }
            Err(e) => {
                INVALID_MESSAGES_TOTAL.inc();
                warn!("[MQTT] [{}] Dropping message on {}: {}", self.device_id, topic, e);
                self.sink.set_unavailable(&e.to_string()).await;
                return;
            }
        };

        let mapped = self.mapper.map_message(topic, &payload);
        for (name, value) in mapped.writes {
            if capability::is_accumulator(name) {
                debug!("[MQTT] [{}] Ignoring push write to counter {}", self.device_id, name);
                continue;
            }
            self.sink.set_value(name, value).await;
        }

        match mapped.availability.unwrap_or(Availability::Available) {
            Availability::Available => self.sink.set_available().await,
            Availability::Unavailable(reason) => self.sink.set_unavailable(&reason).await,
        }

        match mapped.warning.unwrap_or(WarningChange::Clear) {
            WarningChange::Set(message) => self.sink.set_warning(&message).await,
            WarningChange::Clear => self.sink.unset_warning().await,
        }
    }

    async fn publish(&self, path: &str, message: &Value) -> Result<()> {
        let topic = command_topic(&self.command_base.0, &self.command_base.1, path);
        let data = message.to_string();

        info!("[MQTT] [{}] Publish: {} {}", self.device_id, topic, data);

        if !self.client.is_connected() {
            error!("[MQTT] [{}] Client not connected", self.device_id);
            return Err(Error::Delivery);
        }

        self.client.publish(&topic, data.into_bytes()).await
    }

    /// Untrack, then track again, so the broker refreshes its push session.
    async fn assert_presence(&self) {
        let untrack = json!({ "value": "OFF", "clientId": self.client_id });
        if let Err(e) = self.publish(TRACKING_PATH, &untrack).await {
            debug!("[MQTT] [{}] Keep-alive skipped: {}", self.device_id, e);
            return;
        }

        tokio::time::sleep(self.keep_alive_delay).await;

        let track = json!({ "value": "ON", "clientId": self.client_id });
        if let Err(e) = self.publish(TRACKING_PATH, &track).await {
            debug!("[MQTT] [{}] Keep-alive track failed: {}", self.device_id, e);
        }
    }

    fn abort_presence(&self) {
        let task = self
            .presence
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }

    async fn keep_alive(self: Arc<Self>, every: Duration) {
        let mut ticker = interval_at(Instant::now() + every, every);
        loop {
            ticker.tick().await;
            self.assert_presence().await;
        }
    }
}

struct ActiveSession {
    context: Arc<SessionContext>,
    events: JoinHandle<()>,
    keep_alive: Option<JoinHandle<()>>,
}

pub struct StreamSession {
    identity: DeviceIdentity,
    mapper: DeviceMapper,
    settings: SessionSettings,
    transport: Arc<dyn Transport>,
    sink: SinkWriter,
    state: Arc<watch::Sender<SessionState>>,
    active: Mutex<Option<ActiveSession>>,
}

impl StreamSession {
    pub fn new(
        identity: DeviceIdentity,
        mapper: DeviceMapper,
        settings: SessionSettings,
        transport: Arc<dyn Transport>,
        sink: SinkWriter,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            identity,
            mapper,
            settings,
            transport,
            sink,
            state: Arc::new(state),
            active: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub async fn is_open(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Opens the session. Devices without a location uuid or a push topic
    /// do not stream; that is not an error.
    pub async fn connect(&self) -> Result<()> {
        let device_id = &self.identity.device_id;

        let Some(location_uuid) = self.identity.location_uuid.clone() else {
            debug!("[MQTT] [{}] No service location uuid, streaming not supported", device_id);
            return Ok(());
        };
        let Some(subtopic) = self.mapper.subscribe_topic() else {
            debug!("[MQTT] [{}] Device class has no stream", device_id);
            return Ok(());
        };

        let mut active = self.active.lock().await;
        if active.is_some() {
            return Ok(());
        }

        info!("[MQTT] [{}] Connecting...", device_id);
        self.state.send_replace(SessionState::Connecting);

        let topic = format!("servicelocation/{}/{}", location_uuid, subtopic);
        let client_id = format!("meter-sync-{}-{}", self.settings.hub_id, device_id);
        let options = ConnectOptions {
            client_id: client_id.clone(),
            username: location_uuid.clone(),
            password: location_uuid.clone(),
            connect_timeout: self.settings.connect_timeout,
            reconnect_period: self.settings.reconnect_period,
        };

        let (client, events) = match self.transport.connect(options).await {
            Ok(opened) => opened,
            Err(e) => {
                self.state.send_replace(SessionState::Disconnected);
                return Err(e);
            }
        };

        let context = Arc::new(SessionContext {
            device_id: device_id.clone(),
            client_id,
            topic,
            command_base: (location_uuid, subtopic),
            client,
            mapper: self.mapper.clone(),
            sink: self.sink.clone(),
            state: self.state.clone(),
            keep_alive_delay: self.settings.keep_alive.delay,
            presence: StdMutex::new(None),
        });

        let events = tokio::spawn(context.clone().run(events));
        let keep_alive = if self.mapper.needs_keep_alive() {
            info!("[Timer] [{}] Keep-alive registered", device_id);
            Some(tokio::spawn(
                context.clone().keep_alive(self.settings.keep_alive.interval),
            ))
        } else {
            None
        };

        *active = Some(ActiveSession {
            context,
            events,
            keep_alive,
        });
        ACTIVE_SESSIONS.inc();

        Ok(())
    }

    /// Best-effort unsubscribe and close. Local handles are always released,
    /// so a broken session never blocks teardown.
    pub async fn disconnect(&self) {
        let Some(active) = self.active.lock().await.take() else {
            return;
        };
        let device_id = &self.identity.device_id;
        let context = &active.context;
        let limit = self.settings.connect_timeout;

        info!("[MQTT] [{}] Disconnecting...", device_id);

        match tokio::time::timeout(limit, context.client.unsubscribe(&context.topic)).await {
            Ok(Ok(())) => info!("[MQTT] [{}] Unsubscribed from {}", device_id, context.topic),
            Ok(Err(e)) => error!("[MQTT] [{}] Unsubscribe failed: {}", device_id, e),
            Err(_) => error!("[MQTT] [{}] Unsubscribe timed out", device_id),
        }

        match tokio::time::timeout(limit, context.client.end()).await {
            Ok(Ok(())) => info!("[MQTT] [{}] Disconnected", device_id),
            Ok(Err(e)) => error!("[MQTT] [{}] Close failed: {}", device_id, e),
            Err(_) => error!("[MQTT] [{}] Close timed out", device_id),
        }

        if let Some(keep_alive) = active.keep_alive {
            keep_alive.abort();
            info!("[Timer] [{}] Keep-alive unregistered", device_id);
        }
        context.abort_presence();
        active.events.abort();
        ACTIVE_SESSIONS.dec();
        self.state.send_replace(SessionState::Disconnected);
    }

    /// Publishes under the device's command topic. A no-op without a session;
    /// a delivery error when the session exists but is not connected.
    pub async fn publish(&self, path: &str, message: &Value) -> Result<()> {
        let context = match self.active.lock().await.as_ref() {
            Some(active) => active.context.clone(),
            None => return Ok(()),
        };
        context.publish(path, message).await
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if let Some(active) = self.active.get_mut().take() {
            if let Some(keep_alive) = active.keep_alive {
                keep_alive.abort();
            }
            active.context.abort_presence();
            active.events.abort();
            ACTIVE_SESSIONS.dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CapabilityValue, DeviceClass};
    use crate::sink::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeBroker {
        connected: AtomicBool,
        subscribed: StdMutex<Vec<String>>,
        published: StdMutex<Vec<(String, String)>>,
        fail_close: bool,
        ends: AtomicUsize,
    }

    #[async_trait]
    impl BrokerSession for FakeBroker {
        async fn subscribe(&self, topic: &str) -> Result<()> {
            self.subscribed.lock().unwrap().push(topic.to_string());
            Ok(())
        }
        async fn unsubscribe(&self, topic: &str) -> Result<()> {
            self.subscribed.lock().unwrap().retain(|t| t != topic);
            if self.fail_close {
                return Err(Error::Delivery);
            }
            Ok(())
        }
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), String::from_utf8(payload).unwrap()));
            Ok(())
        }
        async fn end(&self) -> Result<()> {
            self.ends.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                return Err(Error::Delivery);
            }
            Ok(())
        }
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    struct FakeTransport {
        broker: Arc<FakeBroker>,
        events: StdMutex<Option<mpsc::Sender<TransportEvent>>>,
        options: StdMutex<Option<ConnectOptions>>,
        connects: AtomicUsize,
    }

    impl FakeTransport {
        fn new(broker: FakeBroker) -> Arc<Self> {
            Arc::new(Self {
                broker: Arc::new(broker),
                events: StdMutex::new(None),
                options: StdMutex::new(None),
                connects: AtomicUsize::new(0),
            })
        }

        async fn emit(&self, event: TransportEvent) {
            if event == TransportEvent::Connect {
                self.broker.connected.store(true, Ordering::SeqCst);
            }
            let tx = self.events.lock().unwrap().clone().unwrap();
            tx.send(event).await.unwrap();
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn connect(
            &self,
            options: ConnectOptions,
        ) -> Result<(Arc<dyn BrokerSession>, mpsc::Receiver<TransportEvent>)> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(16);
            *self.events.lock().unwrap() = Some(tx);
            *self.options.lock().unwrap() = Some(options);
            Ok((self.broker.clone(), rx))
        }
    }

    fn session(
        class: DeviceClass,
        uuid: Option<&str>,
        transport: Arc<FakeTransport>,
        store: &MemoryStore,
    ) -> StreamSession {
        let identity = DeviceIdentity {
            device_id: "42".to_string(),
            location_id: 1,
            location_uuid: uuid.map(str::to_string),
        };
        let mapper = DeviceMapper::new(class, "42", class.default_capabilities());
        StreamSession::new(
            identity,
            mapper,
            SessionSettings {
                hub_id: "hub".to_string(),
                ..SessionSettings::default()
            },
            transport,
            SinkWriter::new("42", store.sink_for("42")),
        )
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[test]
    fn test_command_topic() {
        assert_eq!(
            command_topic("u", "plug/42/#", "setstate"),
            "servicelocation/u/plug/42/setstate"
        );
        assert_eq!(command_topic("u", "#", "tracking"), "servicelocation/u/tracking");
        assert_eq!(command_topic("u", "power", "x"), "servicelocation/u/power/x");
    }

    #[tokio::test]
    async fn test_missing_location_uuid_does_not_stream() {
        let transport = FakeTransport::new(FakeBroker::default());
        let store = MemoryStore::new();
        let session = session(DeviceClass::Energy, None, transport.clone(), &store);

        session.connect().await.unwrap();

        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(transport.connects.load(Ordering::SeqCst), 0);
        assert!(!session.is_open().await);
    }

    #[tokio::test]
    async fn test_connect_subscribes_and_maps_messages() {
        let transport = FakeTransport::new(FakeBroker::default());
        let store = MemoryStore::new();
        let session = session(DeviceClass::Energy, Some("uuid-1"), transport.clone(), &store);

        session.connect().await.unwrap();
        assert_eq!(session.state(), SessionState::Connecting);

        let options = transport.options.lock().unwrap().clone().unwrap();
        assert_eq!(options.client_id, "meter-sync-hub-42");
        assert_eq!(options.username, "uuid-1");

        transport.emit(TransportEvent::Connect).await;
        transport
            .emit(TransportEvent::Message {
                topic: "servicelocation/uuid-1/power".to_string(),
                payload: br#"{"consumptionPower": 321, "channelPowers": [1, 2]}"#.to_vec(),
            })
            .await;
        settle().await;

        assert_eq!(session.state(), SessionState::Subscribed);
        assert_eq!(
            *transport.broker.subscribed.lock().unwrap(),
            vec!["servicelocation/uuid-1/power".to_string()]
        );
        let snapshot = store.snapshot("42").await.unwrap();
        assert_eq!(
            snapshot.value("measure_power"),
            Some(&CapabilityValue::Number(321.0))
        );
        assert!(snapshot.available);
    }

    #[tokio::test]
    async fn test_broker_trouble_degrades_and_warns() {
        let transport = FakeTransport::new(FakeBroker::default());
        let store = MemoryStore::new();
        let session = session(DeviceClass::Energy, Some("uuid-1"), transport.clone(), &store);

        session.connect().await.unwrap();
        transport.emit(TransportEvent::Connect).await;
        transport.emit(TransportEvent::Offline).await;
        settle().await;

        assert_eq!(session.state(), SessionState::Degraded);
        let snapshot = store.snapshot("42").await.unwrap();
        assert!(snapshot.available);
        assert_eq!(snapshot.warning.as_deref(), Some("Service is offline"));

        transport.emit(TransportEvent::Reconnect).await;
        settle().await;
        assert_eq!(session.state(), SessionState::Degraded);

        transport.emit(TransportEvent::Connect).await;
        settle().await;
        assert_eq!(session.state(), SessionState::Subscribed);
        assert_eq!(store.snapshot("42").await.unwrap().warning, None);
    }

    #[tokio::test]
    async fn test_disconnect_twice_and_failed_close() {
        let transport = FakeTransport::new(FakeBroker {
            fail_close: true,
            ..FakeBroker::default()
        });
        let store = MemoryStore::new();
        let session = session(DeviceClass::Switch, Some("uuid-1"), transport.clone(), &store);

        session.connect().await.unwrap();
        transport.emit(TransportEvent::Connect).await;
        settle().await;

        session.disconnect().await;
        session.disconnect().await;

        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.is_open().await);
        assert_eq!(transport.broker.ends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_publish_without_session_is_noop() {
        let transport = FakeTransport::new(FakeBroker::default());
        let store = MemoryStore::new();
        let session = session(DeviceClass::Switch, Some("uuid-1"), transport.clone(), &store);

        assert!(session.publish("setstate", &json!({"value": "ON"})).await.is_ok());
        assert!(transport.broker.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_on_broken_session_fails() {
        let transport = FakeTransport::new(FakeBroker::default());
        let store = MemoryStore::new();
        let session = session(DeviceClass::Switch, Some("uuid-1"), transport.clone(), &store);

        session.connect().await.unwrap();
        let err = session
            .publish("setstate", &json!({"value": "ON"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Delivery));

        transport.emit(TransportEvent::Connect).await;
        settle().await;
        session
            .publish("setstate", &json!({"value": "ON"}))
            .await
            .unwrap();
        assert_eq!(
            transport.broker.published.lock().unwrap()[0].0,
            "servicelocation/uuid-1/plug/42/setstate"
        );
    }

    #[tokio::test]
    async fn test_charger_asserts_presence_on_connect() {
        let transport = FakeTransport::new(FakeBroker::default());
        let store = MemoryStore::new();
        let mut session = session(DeviceClass::EvWall, Some("uuid-1"), transport.clone(), &store);
        session.settings.keep_alive.delay = Duration::from_millis(5);

        session.connect().await.unwrap();
        transport.emit(TransportEvent::Connect).await;
        settle().await;

        let published = transport.broker.published.lock().unwrap().clone();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].0, "servicelocation/uuid-1/tracking");
        assert!(published[0].1.contains("\"OFF\""));
        assert!(published[1].1.contains("\"ON\""));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_timer_repeats_until_disconnect() {
        let transport = FakeTransport::new(FakeBroker::default());
        let store = MemoryStore::new();
        let mut session = session(DeviceClass::EvWall, Some("uuid-1"), transport.clone(), &store);
        session.settings.keep_alive.delay = Duration::from_millis(5);
        let interval = session.settings.keep_alive.interval;

        session.connect().await.unwrap();
        transport.emit(TransportEvent::Connect).await;
        settle().await;
        assert_eq!(transport.broker.published.lock().unwrap().len(), 2);

        tokio::time::sleep(interval).await;
        settle().await;
        let published = transport.broker.published.lock().unwrap().clone();
        assert_eq!(published.len(), 4);
        assert!(published[2].1.contains("\"OFF\""));
        assert!(published[3].1.contains("\"ON\""));

        tokio::time::sleep(interval).await;
        settle().await;
        assert_eq!(transport.broker.published.lock().unwrap().len(), 6);

        session.disconnect().await;
        tokio::time::sleep(interval * 3).await;
        settle().await;
        assert_eq!(transport.broker.published.lock().unwrap().len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_aborts_presence_in_flight() {
        let transport = FakeTransport::new(FakeBroker::default());
        let store = MemoryStore::new();
        let mut session = session(DeviceClass::EvWall, Some("uuid-1"), transport.clone(), &store);
        session.settings.keep_alive.delay = Duration::from_secs(10);

        session.connect().await.unwrap();
        transport.emit(TransportEvent::Connect).await;
        settle().await;

        // untrack sent, track still waiting on the delay
        let published = transport.broker.published.lock().unwrap().clone();
        assert_eq!(published.len(), 1);
        assert!(published[0].1.contains("\"OFF\""));

        session.disconnect().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        settle().await;

        assert_eq!(transport.broker.published.lock().unwrap().len(), 1);
    }
}

use crate::errors::{Error, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, NetworkOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const REQUEST_CHANNEL_CAPACITY: usize = 100;
const END_GRACE: Duration = Duration::from_secs(1);

/// Connection lifecycle and traffic reported by a broker session.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connect,
    Disconnect,
    Error(String),
    Message { topic: String, payload: Vec<u8> },
    Offline,
    Reconnect,
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub connect_timeout: Duration,
    pub reconnect_period: Duration,
}

/// Handle on one open broker session. Reconnection is the transport's job.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<()>;
    async fn unsubscribe(&self, topic: &str) -> Result<()>;
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
    async fn end(&self) -> Result<()>;
    fn is_connected(&self) -> bool;
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        options: ConnectOptions,
    ) -> Result<(Arc<dyn BrokerSession>, mpsc::Receiver<TransportEvent>)>;
}

/// MQTT over rumqttc.
pub struct MqttTransport {
    broker: String,
    port: u16,
    tls: bool,
}

impl MqttTransport {
    pub fn new(broker: &str, port: u16, tls: bool) -> Self {
        Self {
            broker: broker.to_string(),
            port,
            tls,
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(
        &self,
        options: ConnectOptions,
    ) -> Result<(Arc<dyn BrokerSession>, mpsc::Receiver<TransportEvent>)> {
        info!(
            "Connecting to MQTT broker at {}:{} as {}",
            self.broker, self.port, options.client_id
        );

        let mut mqtt_options = MqttOptions::new(&options.client_id, &self.broker, self.port);
        mqtt_options.set_keep_alive(Duration::from_secs(30));
        mqtt_options.set_clean_session(true);
        mqtt_options.set_credentials(&options.username, &options.password);
        if self.tls {
            mqtt_options.set_transport(rumqttc::Transport::tls_with_default_config());
        }

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);

        let mut network = NetworkOptions::new();
        network.set_connection_timeout(options.connect_timeout.as_secs().max(1));
        eventloop.set_network_options(network);

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));
        let closing = Arc::new(AtomicBool::new(false));

        let driver = tokio::spawn(drive(
            eventloop,
            tx,
            connected.clone(),
            closing.clone(),
            options.reconnect_period,
        ));

        let session = MqttSession {
            client,
            connected,
            closing,
            driver: Mutex::new(Some(driver)),
        };

        Ok((Arc::new(session), rx))
    }
}

/// Polls the event loop and translates its notifications into [`TransportEvent`]s.
async fn drive(
    mut eventloop: EventLoop,
    tx: mpsc::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    reconnect_period: Duration,
) {
    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                connected.store(true, Ordering::SeqCst);
                Some(TransportEvent::Connect)
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(
                    "Received message on topic {}, size: {} bytes",
                    publish.topic,
                    publish.payload.len()
                );
                Some(TransportEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                })
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                connected.store(false, Ordering::SeqCst);
                Some(TransportEvent::Disconnect)
            }
            Ok(_) => None,
            Err(e) => {
                if closing.load(Ordering::SeqCst) {
                    debug!("Event loop stopped after close: {}", e);
                    break;
                }

                error!("MQTT error: {}", e);
                let was_connected = connected.swap(false, Ordering::SeqCst);
                if tx.send(TransportEvent::Error(e.to_string())).await.is_err() {
                    break;
                }
                if was_connected && tx.send(TransportEvent::Offline).await.is_err() {
                    break;
                }

                // rumqttc reconnects on the next poll
                tokio::time::sleep(reconnect_period).await;
                Some(TransportEvent::Reconnect)
            }
        };

        if let Some(event) = event {
            if tx.send(event).await.is_err() {
                warn!("Session dropped its event receiver, stopping event loop");
                break;
            }
        }
    }
}

struct MqttSession {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl MqttSession {
    fn take_driver(&self) -> Option<JoinHandle<()>> {
        match self.driver.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

#[async_trait]
impl BrokerSession for MqttSession {
    async fn subscribe(&self, topic: &str) -> Result<()> {
        self.client.subscribe(topic, QoS::AtLeastOnce).await?;
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.client.unsubscribe(topic).await?;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(Error::Mqtt)
    }

    async fn end(&self) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);

        let result = self.client.disconnect().await.map_err(Error::Mqtt);

        if let Some(mut driver) = self.take_driver() {
            if tokio::time::timeout(END_GRACE, &mut driver).await.is_err() {
                driver.abort();
            }
        }

        result
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        if let Some(driver) = self.take_driver() {
            driver.abort();
        }
    }
}

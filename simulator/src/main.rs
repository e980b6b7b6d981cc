mod telemetry;

use chrono::Utc;
use clap::Parser;
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::Serialize;
use std::time::Duration;
use telemetry::{PlugMessage, PowerMessage};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Publishes fake realtime metering traffic for one service location.
#[derive(Debug, Parser)]
#[command(name = "simulator", version)]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    /// Service location uuid; also used as broker username and password.
    #[arg(long, env = "LOCATION_UUID")]
    location: String,

    /// Power messages per second.
    #[arg(long, env = "RATE", default_value_t = 1)]
    rate: u64,

    /// Plug ids to toggle, comma separated.
    #[arg(long, env = "PLUGS", value_delimiter = ',')]
    plugs: Vec<String>,

    /// Current transformer inputs reported per power message.
    #[arg(long, default_value_t = 6)]
    channels: u8,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    info!("Starting metering simulator");
    info!(
        "Broker: {}:{}, Location: {}, Rate: {} msg/s, Plugs: {:?}",
        args.broker, args.port, args.location, args.rate, args.plugs
    );

    let client_id = format!("sim-{}", uuid::Uuid::new_v4());
    let mut mqtt_options = MqttOptions::new(&client_id, &args.broker, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);
    mqtt_options.set_credentials(&args.location, &args.location);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 1000);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                error!("MQTT eventloop error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(2)).await;
    info!("Connected to MQTT broker, starting to publish");

    let base = format!("servicelocation/{}", args.location);
    let period = Duration::from_millis(1000 / args.rate.max(1));
    let mut ticker = tokio::time::interval(period);
    let mut rng = rand::thread_rng();
    let mut plug_states = vec![false; args.plugs.len()];
    let mut counter = 0u64;

    loop {
        ticker.tick().await;

        let power = PowerMessage::random(&mut rng, Utc::now().timestamp_millis(), args.channels);
        publish(&client, &format!("{}/power", base), &power).await;
        counter += 1;

        // plugs change far less often than power readings
        for (plug, on) in args.plugs.iter().zip(plug_states.iter_mut()) {
            if rng.gen_bool(0.05) {
                *on = !*on;
                publish(&client, &format!("{}/plug/{}/state", base, plug), &PlugMessage::state(*on)).await;
            }
            if rng.gen_bool(0.02) {
                let connection = PlugMessage::connection(&mut rng);
                publish(
                    &client,
                    &format!("{}/plug/{}/connectionState", base, plug),
                    &connection,
                )
                .await;
            }
        }

        if counter % 100 == 0 {
            info!("Published {} power messages", counter);
        }
    }
}

async fn publish(client: &AsyncClient, topic: &str, message: &impl Serialize) {
    let payload = match serde_json::to_string(message) {
        Ok(p) => p,
        Err(e) => {
            error!("Failed to serialize message: {}", e);
            return;
        }
    };

    if let Err(e) = client.publish(topic, QoS::AtLeastOnce, false, payload).await {
        warn!("Failed to publish on {}: {}", topic, e);
    }
}

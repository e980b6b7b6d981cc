use meter_sync::mapping::DeviceMapper;
use meter_sync::model::{capability, CapabilityValue, DeviceClass, DeviceIdentity, SessionState};
use meter_sync::session::{SessionSettings, StreamSession};
use meter_sync::sink::{MemoryStore, SinkWriter};
use meter_sync::transport::MqttTransport;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

const LOCATION: &str = "broker-test-location";

/// Needs a broker on localhost:1883 that accepts any credentials.
#[tokio::test]
#[ignore]
async fn test_power_stream_end_to_end() {
    let store = MemoryStore::new();
    let device_id = "1000099";
    let session = StreamSession::new(
        DeviceIdentity {
            device_id: device_id.to_string(),
            location_id: 1,
            location_uuid: Some(LOCATION.to_string()),
        },
        DeviceMapper::new(
            DeviceClass::Energy,
            device_id,
            DeviceClass::Energy.default_capabilities(),
        ),
        SessionSettings::default(),
        Arc::new(MqttTransport::new("localhost", 1883, false)),
        SinkWriter::new(device_id, store.sink_for(device_id)),
    );

    session.connect().await.unwrap();

    let mut state = session.watch_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == SessionState::Subscribed),
    )
    .await
    .expect("session did not subscribe in time")
    .unwrap();

    let mut options = MqttOptions::new("broker-test-publisher", "localhost", 1883);
    options.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(options, 100);
    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                eprintln!("MQTT error: {}", e);
                break;
            }
        }
    });
    sleep(Duration::from_millis(500)).await;

    let start = Instant::now();
    let total = 100;
    for i in 0..total {
        let payload = json!({
            "consumptionPower": i,
            "alwaysOn": 35,
            "channelPowers": [{"ctInput": 0, "power": i}],
        });
        client
            .publish(
                format!("servicelocation/{}/power", LOCATION),
                QoS::AtLeastOnce,
                false,
                payload.to_string(),
            )
            .await
            .unwrap();
    }

    let last = CapabilityValue::Number(f64::from(total - 1));
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let snapshot = store.snapshot(device_id).await;
        if snapshot.as_ref().and_then(|s| s.value(capability::MEASURE_POWER)) == Some(&last) {
            break;
        }
        assert!(Instant::now() < deadline, "last reading never arrived");
        sleep(Duration::from_millis(50)).await;
    }

    println!("{} readings applied in {:?}", total, start.elapsed());

    session.disconnect().await;
    assert_eq!(session.state(), SessionState::Disconnected);
}

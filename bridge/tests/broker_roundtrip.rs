use chrono::Utc;
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use transport::payload::StatusPayload;
use transport::topics::{
    extract_device_id, report_topic, status_topic, DEVICE_ID_SEGMENT, REGISTER_TOPIC,
};
use transport::{MqttTransport, Transport, TransportConfig};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Report {
    device_id: String,
    timestamp: i64,
    temperature: String,
    humidity: String,
    seq: usize,
}

impl Report {
    fn random(device_id: String, seq: usize) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            device_id,
            timestamp: Utc::now().timestamp_millis(),
            temperature: format!("{:.1}", rng.gen_range(15.0..30.0)),
            humidity: format!("{:.1}", rng.gen_range(40.0..70.0)),
            seq,
        }
    }
}

fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())
}

#[tokio::test]
#[ignore]
async fn test_registration_and_last_will_reach_the_bridge() {
    println!("\n🚀 Registration / last will round trip");

    let bridge = MqttTransport::new(TransportConfig::new("localhost", 1883, unique("bridge-test")));
    let mut registrations = bridge.subscribe(REGISTER_TOPIC, QoS::AtLeastOnce).await.unwrap();
    let mut statuses = bridge.subscribe("device/status/#", QoS::AtLeastOnce).await.unwrap();
    bridge.connect().await.unwrap();

    let device_id = unique("roundtrip-switch");
    let device = MqttTransport::for_device(
        TransportConfig::new("localhost", 1883, unique("sim")),
        device_id.clone(),
    );
    device.connect().await.unwrap();

    let registration = StatusPayload::new(&device_id, "online").with_type("SmartSwitch");
    device
        .publish(REGISTER_TOPIC, registration.to_bytes().unwrap(), QoS::AtLeastOnce, true)
        .await
        .unwrap();

    let received = timeout(Duration::from_secs(5), async {
        loop {
            let message = registrations.recv().await.unwrap();
            if message.payload_str().contains(&device_id) {
                break message;
            }
        }
    })
    .await
    .expect("registration not received");
    let payload: serde_json::Value = serde_json::from_slice(&received.payload).unwrap();
    assert_eq!(payload["deviceType"], "SmartSwitch");

    // An unclean drop must publish the retained offline will.
    drop(device);

    let will = timeout(Duration::from_secs(60), async {
        loop {
            let message = statuses.recv().await.unwrap();
            if message.topic == status_topic(&device_id) {
                break message;
            }
        }
    })
    .await
    .expect("last will not received");
    assert_eq!(extract_device_id(&will.topic, DEVICE_ID_SEGMENT), device_id);
    assert!(will.payload_str().contains("offline"));

    println!("✅ Registration and last will observed");
    bridge.disconnect().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_report_burst_keeps_per_device_order() {
    println!("\n🚀 Report burst: 10 devices x 200 reports");

    let devices = 10;
    let per_device = 200;

    let bridge =
        MqttTransport::new(TransportConfig::new("localhost", 1883, unique("bridge-burst")));
    let mut reports = bridge.subscribe("device/report/#", QoS::AtLeastOnce).await.unwrap();
    bridge.connect().await.unwrap();

    let mut mqtt_options = MqttOptions::new(unique("burst-publisher"), "localhost", 1883);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 20000);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                eprintln!("MQTT error: {}", e);
                break;
            }
        }
    });

    sleep(Duration::from_millis(500)).await;

    let prefix = unique("burst");
    let start = Instant::now();
    for seq in 0..per_device {
        for d in 0..devices {
            let device_id = format!("{}-{}", prefix, d);
            let payload = serde_json::to_string(&Report::random(device_id.clone(), seq)).unwrap();
            client
                .publish(report_topic(&device_id), QoS::AtLeastOnce, false, payload)
                .await
                .unwrap();
        }
    }

    let mut last_seq: HashMap<String, i64> = HashMap::new();
    let mut received = 0;
    timeout(Duration::from_secs(30), async {
        while received < devices * per_device {
            let message = reports.recv().await.unwrap();
            let device_id = extract_device_id(&message.topic, DEVICE_ID_SEGMENT);
            if !device_id.starts_with(&prefix) {
                continue;
            }
            let report: serde_json::Value = serde_json::from_slice(&message.payload).unwrap();
            let seq = report["seq"].as_i64().unwrap();
            let previous = last_seq.insert(device_id.clone(), seq).unwrap_or(-1);
            assert!(seq >= previous, "report {} for {} arrived after {}", seq, device_id, previous);
            received += 1;
        }
    })
    .await
    .expect("not all reports arrived");

    let duration = start.elapsed();
    println!("\n📈 Results:");
    println!("  Received:       {}", received);
    println!("  Duration:       {:.2}s", duration.as_secs_f64());
    println!(
        "  Rate:           {:.2} msg/s",
        received as f64 / duration.as_secs_f64()
    );

    bridge.disconnect().await.unwrap();
}

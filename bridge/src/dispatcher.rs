use crate::broadcaster::Broadcaster;
use crate::errors::{Error, Result};
use crate::metrics::{
    DISPATCH_LATENCY_SECONDS, MALFORMED_MESSAGES_TOTAL, MESSAGES_TOTAL, REGISTRY_FAILURES_TOTAL,
    REGISTRY_UPDATES_TOTAL,
};
use crate::model::{Device, MessageEnvelope};
use crate::registry::DeviceRegistry;
use crate::validate::{parse_registration, parse_status};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use transport::topics::{
    extract_device_id, DEVICE_ID_SEGMENT, REGISTER_TOPIC, REPORT_WILDCARD, STATUS_WILDCARD,
    TEST_TOPIC, UNKNOWN_DEVICE,
};
use transport::{Connectivity, InboundMessage, QoS, Transport};

/// Event name every broker message is pushed under.
pub const MQTT_MESSAGE_EVENT: &str = "mqttMessage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicFamily {
    Test,
    Report,
    Status,
    Registration,
}

impl TopicFamily {
    pub const ALL: [TopicFamily; 4] = [
        TopicFamily::Test,
        TopicFamily::Report,
        TopicFamily::Status,
        TopicFamily::Registration,
    ];

    pub fn pattern(self) -> &'static str {
        match self {
            TopicFamily::Test => TEST_TOPIC,
            TopicFamily::Report => REPORT_WILDCARD,
            TopicFamily::Status => STATUS_WILDCARD,
            TopicFamily::Registration => REGISTER_TOPIC,
        }
    }
}

pub struct Dispatcher {
    registry: Arc<dyn DeviceRegistry>,
    broadcaster: Broadcaster,
    /// Newest lifecycle timestamp applied per device.
    last_applied: Mutex<HashMap<String, i64>>,
}

impl Dispatcher {
    pub fn new(registry: Arc<dyn DeviceRegistry>, broadcaster: Broadcaster) -> Self {
        Self {
            registry,
            broadcaster,
            last_applied: Mutex::new(HashMap::new()),
        }
    }

    /// Keeps the newest timestamp seen for `uid` and returns whether
    /// `timestamp` is at least as new. Untimed messages count as current.
    fn observe(&self, uid: &str, timestamp: Option<i64>) -> bool {
        let Some(timestamp) = timestamp else {
            return true;
        };
        let mut last_applied = match self.last_applied.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let newest = last_applied.entry(uid.to_string()).or_insert(timestamp);
        if *newest > timestamp {
            return false;
        }
        *newest = timestamp;
        true
    }

    /// Pushes the message to live subscribers, then applies any registry
    /// side effect of its family. Never fails; problems are logged.
    pub async fn dispatch(&self, family: TopicFamily, message: &InboundMessage) {
        MESSAGES_TOTAL.inc();
        let timer = DISPATCH_LATENCY_SECONDS.start_timer();

        let device_id = extract_device_id(&message.topic, DEVICE_ID_SEGMENT);
        let envelope = MessageEnvelope::from_inbound(message);
        debug!(
            "Received {:?} message on {} for device {} ({} bytes)",
            family,
            envelope.topic(),
            device_id,
            envelope.payload().len()
        );

        match serde_json::to_string(&envelope) {
            Ok(data) => {
                self.broadcaster.broadcast(MQTT_MESSAGE_EVENT, &data);
            }
            Err(e) => error!("Failed to encode envelope for {}: {}", envelope.topic(), e),
        }

        let outcome = match family {
            TopicFamily::Status => {
                self.apply_status(&device_id, &message.payload).await.map(|_| ())
            }
            TopicFamily::Registration => self.apply_registration(&message.payload).await,
            TopicFamily::Test | TopicFamily::Report => Ok(()),
        };

        match outcome {
            Ok(()) => {}
            Err(e @ (Error::MalformedPayload(_) | Error::Validation(_))) => {
                MALFORMED_MESSAGES_TOTAL.inc();
                warn!("Dropping message on {}: {}", message.topic, e);
            }
            Err(e) => {
                REGISTRY_FAILURES_TOTAL.inc();
                error!("Registry update for {} failed: {}", message.topic, e);
            }
        }

        timer.observe_duration();
    }

    /// Returns whether a registry record changed. A status never creates a
    /// device.
    pub async fn apply_status(&self, device_id: &str, payload: &[u8]) -> Result<bool> {
        if device_id == UNKNOWN_DEVICE {
            debug!("Status message without device id, skipping registry");
            return Ok(false);
        }

        let update = parse_status(payload)?;
        let Some(status) = update.status else {
            debug!("Status message for {} has no status field", device_id);
            return Ok(false);
        };

        // The last will is stamped when the session opens, so an older
        // status is still applied.
        self.observe(device_id, update.timestamp);

        if self.registry.update_status(device_id, &status).await? {
            REGISTRY_UPDATES_TOTAL.inc();
            info!("Device [{}] status is now {}", device_id, status);
            Ok(true)
        } else {
            warn!("Status '{}' for unregistered device [{}] ignored", status, device_id);
            Ok(false)
        }
    }

    pub async fn apply_registration(&self, payload: &[u8]) -> Result<()> {
        let registration = parse_registration(payload)?;
        let uid = registration.device_id.as_str();

        let fresh = self.observe(uid, registration.timestamp);

        match self.registry.find_by_uid(uid).await? {
            Some(_) if !fresh => {
                debug!("Stale registration of [{}] skipped", uid);
            }
            Some(existing) if existing.status.eq_ignore_ascii_case(&registration.status) => {
                debug!("Device [{}] re-registered with unchanged status", uid);
            }
            Some(_) => {
                self.registry.update_status(uid, &registration.status).await?;
                REGISTRY_UPDATES_TOTAL.inc();
                info!("Device [{}] re-registered as {}", uid, registration.status);
            }
            None => {
                let device = self
                    .registry
                    .upsert(Device::new(
                        uid,
                        uid,
                        registration.device_type.as_str(),
                        registration.status.as_str(),
                    ))
                    .await?;
                REGISTRY_UPDATES_TOTAL.inc();
                info!(
                    "Registered new device [{}] of type {} (id {})",
                    device.uid, device.device_type, device.id
                );
            }
        }
        Ok(())
    }
}

/// Drains one subscription in order until the channel closes.
async fn consume(
    family: TopicFamily,
    mut rx: mpsc::Receiver<InboundMessage>,
    dispatcher: Arc<Dispatcher>,
) {
    while let Some(message) = rx.recv().await {
        dispatcher.dispatch(family, &message).await;
    }
    info!("Subscription {} closed", family.pattern());
}

/// Subscribes all topic families and keeps the bridge session up,
/// reconnecting after `backoff` whenever it fails or drops.
pub async fn run_bridge(
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
    backoff: Duration,
) -> Result<()> {
    let mut consumers = JoinSet::new();
    for family in TopicFamily::ALL {
        let rx = transport.subscribe(family.pattern(), QoS::AtLeastOnce).await?;
        consumers.spawn(consume(family, rx, Arc::clone(&dispatcher)));
    }

    let mut connectivity = transport.watch_connectivity();
    loop {
        if transport.connectivity() != Connectivity::Connected {
            match transport.connect().await {
                Ok(()) => info!(
                    "Bridge connected, listening on {} topic families",
                    TopicFamily::ALL.len()
                ),
                Err(e) => {
                    warn!("Bridge connection failed: {}. Retrying in {:?}", e, backoff);
                    tokio::time::sleep(backoff).await;
                    continue;
                }
            }
        }

        if connectivity
            .wait_for(|state| *state == Connectivity::Disconnected)
            .await
            .is_err()
        {
            break;
        }
        warn!("Bridge lost broker connection, reconnecting");
    }

    consumers.abort_all();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InMemoryRegistry;
    use tokio_stream::StreamExt;
    use transport::memory::MemoryTransport;

    fn dispatcher_with(registry: Arc<InMemoryRegistry>) -> (Dispatcher, Broadcaster) {
        let broadcaster = Broadcaster::new(16);
        (Dispatcher::new(registry, broadcaster.clone()), broadcaster)
    }

    fn message(topic: &str, payload: &str) -> InboundMessage {
        InboundMessage {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
        }
    }

    fn registration_at(uid: &str, device_type: &str, timestamp: i64) -> String {
        serde_json::json!({
            "deviceId": uid,
            "deviceType": device_type,
            "status": "online",
            "timestamp": timestamp,
        })
        .to_string()
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_status_updates_only_known_devices() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry
            .upsert(Device::new("d1", "d1", "TempHumSensor", "online"))
            .await
            .unwrap();
        let (dispatcher, _) = dispatcher_with(Arc::clone(&registry));

        dispatcher
            .dispatch(
                TopicFamily::Status,
                &message("device/status/d1", r#"{"deviceId":"d1","status":"offline"}"#),
            )
            .await;
        dispatcher
            .dispatch(
                TopicFamily::Status,
                &message("device/status/d2", r#"{"deviceId":"d2","status":"offline"}"#),
            )
            .await;

        let d1 = registry.find_by_uid("d1").await.unwrap().unwrap();
        assert_eq!(d1.status, "offline");
        assert!(registry.find_by_uid("d2").await.unwrap().is_none());
        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_registration_creates_then_updates_status() {
        let registry = Arc::new(InMemoryRegistry::new());
        let (dispatcher, _) = dispatcher_with(Arc::clone(&registry));

        dispatcher
            .apply_registration(
                br#"{"deviceId":"switch-001","deviceType":"SmartSwitch","status":"online"}"#,
            )
            .await
            .unwrap();
        let created = registry.find_by_uid("switch-001").await.unwrap().unwrap();
        assert_eq!(created.name, "switch-001");
        assert_eq!(created.device_type, "SmartSwitch");

        dispatcher
            .apply_registration(
                br#"{"deviceId":"switch-001","deviceType":"SmartSwitch","status":"OFFLINE"}"#,
            )
            .await
            .unwrap();
        let updated = registry.find_by_uid("switch-001").await.unwrap().unwrap();
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.status, "OFFLINE");
    }

    #[tokio::test]
    async fn test_late_registration_does_not_override_newer_status() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry
            .upsert(Device::new("d1", "d1", "SmartSwitch", "online"))
            .await
            .unwrap();
        let (dispatcher, _) = dispatcher_with(Arc::clone(&registry));

        // The offline will was sent after the registration but is consumed first.
        dispatcher
            .dispatch(
                TopicFamily::Status,
                &message(
                    "device/status/d1",
                    r#"{"deviceId":"d1","status":"offline","timestamp":2000}"#,
                ),
            )
            .await;
        dispatcher
            .dispatch(
                TopicFamily::Registration,
                &message(
                    "device/register",
                    &registration_at("d1", "SmartSwitch", 1000),
                ),
            )
            .await;
        assert_eq!(registry.find_by_uid("d1").await.unwrap().unwrap().status, "offline");

        // A newer registration applies.
        dispatcher
            .apply_registration(registration_at("d1", "SmartSwitch", 3000).as_bytes())
            .await
            .unwrap();
        assert_eq!(registry.find_by_uid("d1").await.unwrap().unwrap().status, "online");

        // A will stamped at session start still marks the device offline.
        assert!(dispatcher
            .apply_status("d1", br#"{"deviceId":"d1","status":"offline","timestamp":2500}"#)
            .await
            .unwrap());
        assert_eq!(registry.find_by_uid("d1").await.unwrap().unwrap().status, "offline");

        // Untimed registrations are never treated as stale.
        dispatcher
            .apply_registration(br#"{"deviceId":"d1","deviceType":"SmartSwitch"}"#)
            .await
            .unwrap();
        assert_eq!(registry.find_by_uid("d1").await.unwrap().unwrap().status, "online");
    }

    #[tokio::test]
    async fn test_stale_registration_still_creates_unknown_device() {
        let registry = Arc::new(InMemoryRegistry::new());
        let (dispatcher, _) = dispatcher_with(Arc::clone(&registry));

        dispatcher
            .apply_status("d7", br#"{"status":"offline","timestamp":5000}"#)
            .await
            .unwrap();
        dispatcher
            .apply_registration(registration_at("d7", "TempHumSensor", 10).as_bytes())
            .await
            .unwrap();

        let created = registry.find_by_uid("d7").await.unwrap().unwrap();
        assert_eq!(created.device_type, "TempHumSensor");
    }

    #[tokio::test]
    async fn test_registration_without_type_is_rejected() {
        let registry = Arc::new(InMemoryRegistry::new());
        let (dispatcher, _) = dispatcher_with(Arc::clone(&registry));

        let result = dispatcher
            .apply_registration(br#"{"deviceId":"sensor-th-009","status":"online"}"#)
            .await;

        assert!(matches!(result, Err(Error::Validation(_))));
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_every_message_is_pushed_even_when_malformed() {
        let registry = Arc::new(InMemoryRegistry::new());
        let (dispatcher, broadcaster) = dispatcher_with(registry);
        let mut subscriber = broadcaster.register_subscriber();
        assert_eq!(subscriber.next().await.unwrap().name, "connection");

        dispatcher
            .dispatch(TopicFamily::Status, &message("device/status/d1", "not json"))
            .await;
        dispatcher
            .dispatch(TopicFamily::Test, &message("test/topic", "hello"))
            .await;

        let first = subscriber.next().await.unwrap();
        assert_eq!(first.name, MQTT_MESSAGE_EVENT);
        let envelope: serde_json::Value = serde_json::from_str(&first.data).unwrap();
        assert_eq!(envelope["topic"], "device/status/d1");
        assert_eq!(envelope["payload"], "not json");
        assert!(envelope["timestamp"].as_i64().unwrap() > 0);

        let second = subscriber.next().await.unwrap();
        assert!(second.data.contains("hello"));
    }

    #[tokio::test]
    async fn test_status_without_device_segment_is_skipped() {
        let registry = Arc::new(InMemoryRegistry::new());
        let (dispatcher, _) = dispatcher_with(registry);

        let changed = dispatcher
            .apply_status(UNKNOWN_DEVICE, br#"{"status":"online"}"#)
            .await
            .unwrap();
        assert!(!changed);
    }

    #[tokio::test]
    async fn test_bridge_retries_and_resubscribes_after_drop() {
        let transport = Arc::new(MemoryTransport::new());
        transport.fail_next_connects(1);
        let registry = Arc::new(InMemoryRegistry::new());
        registry
            .upsert(Device::new("d1", "d1", "SmartSwitch", "online"))
            .await
            .unwrap();
        let (dispatcher, _) = dispatcher_with(Arc::clone(&registry));

        let bridge = tokio::spawn(run_bridge(
            transport.clone(),
            Arc::new(dispatcher),
            Duration::from_millis(20),
        ));

        eventually(|| transport.connectivity() == Connectivity::Connected).await;
        assert_eq!(transport.connect_attempts(), 2);
        assert_eq!(transport.subscription_count(), TopicFamily::ALL.len());

        transport.drop_connection();
        eventually(|| transport.connect_attempts() == 3).await;
        eventually(|| transport.connectivity() == Connectivity::Connected).await;

        transport
            .deliver("device/status/d1", r#"{"deviceId":"d1","status":"offline"}"#)
            .await;
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let device = registry.find_by_uid("d1").await.unwrap().unwrap();
                if device.status == "offline" {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("status not applied");

        bridge.abort();
    }
}

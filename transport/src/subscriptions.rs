use crate::adapter::InboundMessage;
use rumqttc::QoS;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};

struct Subscription {
    pattern: String,
    qos: QoS,
    tx: mpsc::Sender<InboundMessage>,
}

/// Active subscription patterns, each feeding its own bounded channel.
///
/// The lock is only held to copy senders out; sending happens after it is
/// released so the receive path never blocks publishers.
#[derive(Default)]
pub struct Subscriptions {
    entries: Mutex<Vec<Subscription>>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, pattern: &str, qos: QoS, capacity: usize) -> mpsc::Receiver<InboundMessage> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mut entries = self.entries();
        entries.retain(|s| !s.tx.is_closed());
        entries.push(Subscription {
            pattern: pattern.to_string(),
            qos,
            tx,
        });
        rx
    }

    /// Patterns to (re)subscribe after a connect. Subscriptions whose
    /// receiver is gone are dropped here.
    pub fn patterns(&self) -> Vec<(String, QoS)> {
        let mut entries = self.entries();
        entries.retain(|s| !s.tx.is_closed());
        entries.iter().map(|s| (s.pattern.clone(), s.qos)).collect()
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Hands the message to every matching subscription, in arrival order.
    pub async fn route(&self, message: InboundMessage) {
        let targets: Vec<mpsc::Sender<InboundMessage>> = self
            .entries()
            .iter()
            .filter(|s| rumqttc::matches(&message.topic, &s.pattern))
            .map(|s| s.tx.clone())
            .collect();

        if targets.is_empty() {
            debug!("No subscription matches topic {}", message.topic);
            return;
        }

        for tx in targets {
            if tx.send(message.clone()).await.is_err() {
                warn!("Subscriber channel closed, dropping message on {}", message.topic);
            }
        }
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Subscription>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

//! In-process transport for tests. Records publishes and lets the test drive
//! inbound traffic and connection loss.

use crate::adapter::{Connectivity, InboundMessage, Transport};
use crate::errors::{Error, Result};
use crate::subscriptions::Subscriptions;
use async_trait::async_trait;
use rumqttc::QoS;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl PublishedMessage {
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

pub struct MemoryTransport {
    subscriptions: Subscriptions,
    state: watch::Sender<Connectivity>,
    published: Mutex<Vec<PublishedMessage>>,
    failing_connects: AtomicUsize,
    connect_attempts: AtomicUsize,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (state, _) = watch::channel(Connectivity::Disconnected);
        Self {
            subscriptions: Subscriptions::new(),
            state,
            published: Mutex::new(Vec::new()),
            failing_connects: AtomicUsize::new(0),
            connect_attempts: AtomicUsize::new(0),
        }
    }

    /// Makes the next `n` calls to `connect()` fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.failing_connects.store(n, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Simulates an abnormal session loss.
    pub fn drop_connection(&self) {
        self.state.send_replace(Connectivity::Disconnected);
    }

    /// Delivers a message as if the broker had sent it.
    pub async fn deliver(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        self.subscriptions
            .route(InboundMessage {
                topic: topic.to_string(),
                payload: payload.into(),
            })
            .await;
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.published()
            .into_iter()
            .filter(|m| m.topic == topic)
            .collect()
    }

    pub fn clear_published(&self) {
        if let Ok(mut published) = self.published.lock() {
            published.clear();
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<()> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        self.state.send_replace(Connectivity::Connecting);

        let failing = self.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_connects.store(failing - 1, Ordering::SeqCst);
            self.state.send_replace(Connectivity::Disconnected);
            return Err(Error::Connection("broker unreachable".to_string()));
        }

        self.state.send_replace(Connectivity::Connected);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) -> Result<()> {
        if self.connectivity() != Connectivity::Connected {
            return Err(Error::NotConnected(topic.to_string()));
        }

        if let Ok(mut published) = self.published.lock() {
            published.push(PublishedMessage {
                topic: topic.to_string(),
                payload,
                qos,
                retain,
            });
        }
        Ok(())
    }

    async fn subscribe(&self, pattern: &str, qos: QoS) -> Result<mpsc::Receiver<InboundMessage>> {
        Ok(self.subscriptions.add(pattern, qos, 64))
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.send_replace(Connectivity::Disconnected);
        Ok(())
    }

    fn connectivity(&self) -> Connectivity {
        *self.state.borrow()
    }

    fn watch_connectivity(&self) -> watch::Receiver<Connectivity> {
        self.state.subscribe()
    }
}

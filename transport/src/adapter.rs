use crate::errors::{Error, Result};
use crate::payload::StatusPayload;
use crate::subscriptions::Subscriptions;
use crate::topics::status_topic;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Disconnected,
    Connecting,
    Connected,
}

/// One PUBLISH as received from the broker.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// A single pub/sub session owned by one logical role.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens the session and resubscribes every active pattern before
    /// returning.
    async fn connect(&self) -> Result<()>;

    /// Fails with [`Error::NotConnected`] instead of queueing while offline.
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) -> Result<()>;

    /// Registers a pattern for this and every later session. Messages arrive
    /// on the returned channel in broker order.
    async fn subscribe(&self, pattern: &str, qos: QoS) -> Result<mpsc::Receiver<InboundMessage>>;

    async fn disconnect(&self) -> Result<()>;

    fn connectivity(&self) -> Connectivity;

    fn watch_connectivity(&self) -> watch::Receiver<Connectivity>;
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub channel_capacity: usize,
}

impl TransportConfig {
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            keep_alive: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(10),
            channel_capacity: 256,
        }
    }
}

/// `rumqttc` backed transport. Every `connect()` starts a fresh clean
/// session; reconnecting is left to the owner.
pub struct MqttTransport {
    config: TransportConfig,
    last_will_device: Option<String>,
    client: Mutex<Option<AsyncClient>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    subscriptions: Arc<Subscriptions>,
    state: Arc<watch::Sender<Connectivity>>,
}

impl MqttTransport {
    /// Transport without a last will, used by the bridge.
    pub fn new(config: TransportConfig) -> Self {
        let (state, _) = watch::channel(Connectivity::Disconnected);
        Self {
            config,
            last_will_device: None,
            client: Mutex::new(None),
            event_task: Mutex::new(None),
            subscriptions: Arc::new(Subscriptions::new()),
            state: Arc::new(state),
        }
    }

    /// Transport for a device. The broker publishes a retained `offline`
    /// status for it if the session dies without a clean disconnect.
    pub fn for_device(config: TransportConfig, device_id: impl Into<String>) -> Self {
        let mut transport = Self::new(config);
        transport.last_will_device = Some(device_id.into());
        transport
    }

    fn options(&self) -> Result<MqttOptions> {
        let mut options =
            MqttOptions::new(&self.config.client_id, &self.config.host, self.config.port);
        options.set_keep_alive(self.config.keep_alive);
        options.set_clean_session(true);

        if let Some(device_id) = &self.last_will_device {
            let payload = StatusPayload::offline(device_id.as_str()).to_bytes()?;
            options.set_last_will(LastWill::new(
                status_topic(device_id),
                payload,
                QoS::AtLeastOnce,
                true,
            ));
            debug!("Last will registered for device {}", device_id);
        }

        Ok(options)
    }

    async fn establish(&self) -> Result<(AsyncClient, EventLoop)> {
        let (client, mut eventloop) =
            AsyncClient::new(self.options()?, self.config.channel_capacity);

        loop {
            if let Event::Incoming(Packet::ConnAck(_)) = eventloop.poll().await? {
                break;
            }
        }

        let patterns = self.subscriptions.patterns();
        for (pattern, qos) in &patterns {
            client.subscribe(pattern.as_str(), *qos).await?;
        }

        let mut pending = patterns.len();
        while pending > 0 {
            match eventloop.poll().await? {
                Event::Incoming(Packet::SubAck(_)) => pending -= 1,
                Event::Incoming(Packet::Publish(publish)) => {
                    self.subscriptions
                        .route(InboundMessage {
                            topic: publish.topic.clone(),
                            payload: publish.payload.to_vec(),
                        })
                        .await;
                }
                _ => {}
            }
        }

        if !patterns.is_empty() {
            info!(
                "{} resubscribed to {} pattern(s)",
                self.config.client_id,
                patterns.len()
            );
        }

        Ok((client, eventloop))
    }

    fn stop_event_task(&self) {
        if let Some(task) = lock(&self.event_task).take() {
            task.abort();
        }
    }

    fn current_client(&self) -> Option<AsyncClient> {
        lock(&self.client).clone()
    }
}

impl Drop for MqttTransport {
    /// Dropping without `disconnect()` closes the socket uncleanly, so the
    /// broker fires the last will.
    fn drop(&mut self) {
        self.stop_event_task();
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self) -> Result<()> {
        self.stop_event_task();
        lock(&self.client).take();
        self.state.send_replace(Connectivity::Connecting);

        info!(
            "Connecting {} to MQTT broker at {}:{}",
            self.config.client_id, self.config.host, self.config.port
        );

        let (client, eventloop) =
            match tokio::time::timeout(self.config.connect_timeout, self.establish()).await {
                Ok(Ok(session)) => session,
                Ok(Err(e)) => {
                    self.state.send_replace(Connectivity::Disconnected);
                    return Err(e);
                }
                Err(_) => {
                    self.state.send_replace(Connectivity::Disconnected);
                    return Err(Error::Connection(format!(
                        "timed out after {:?}",
                        self.config.connect_timeout
                    )));
                }
            };

        *lock(&self.client) = Some(client);
        // Connected must be visible before the loop can report a loss.
        self.state.send_replace(Connectivity::Connected);
        let task = tokio::spawn(drive_event_loop(
            eventloop,
            self.subscriptions.clone(),
            self.state.clone(),
            self.config.client_id.clone(),
        ));
        *lock(&self.event_task) = Some(task);

        info!("{} connected", self.config.client_id);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) -> Result<()> {
        let client = match self.current_client() {
            Some(client) if self.connectivity() == Connectivity::Connected => client,
            _ => return Err(Error::NotConnected(topic.to_string())),
        };

        client.publish(topic, qos, retain, payload).await?;
        debug!("Published to {} (retain={})", topic, retain);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str, qos: QoS) -> Result<mpsc::Receiver<InboundMessage>> {
        let rx = self
            .subscriptions
            .add(pattern, qos, self.config.channel_capacity);

        if self.connectivity() == Connectivity::Connected {
            if let Some(client) = self.current_client() {
                client.subscribe(pattern, qos).await?;
            }
        }

        info!("Subscribed to {}", pattern);
        Ok(rx)
    }

    async fn disconnect(&self) -> Result<()> {
        let client = lock(&self.client).take();
        let task = lock(&self.event_task).take();

        if let Some(client) = client {
            if let Err(e) = client.disconnect().await {
                warn!("{} disconnect request failed: {}", self.config.client_id, e);
            }
        }

        if let Some(task) = task {
            // Let the event loop flush the DISCONNECT, then make sure it ends.
            let abort = task.abort_handle();
            if tokio::time::timeout(Duration::from_secs(1), task).await.is_err() {
                abort.abort();
            }
        }

        self.state.send_replace(Connectivity::Disconnected);
        info!("{} disconnected", self.config.client_id);
        Ok(())
    }

    fn connectivity(&self) -> Connectivity {
        *self.state.borrow()
    }

    fn watch_connectivity(&self) -> watch::Receiver<Connectivity> {
        self.state.subscribe()
    }
}

async fn drive_event_loop(
    mut eventloop: EventLoop,
    subscriptions: Arc<Subscriptions>,
    state: Arc<watch::Sender<Connectivity>>,
    client_id: String,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(
                    "Received message on topic {}, size: {} bytes",
                    publish.topic,
                    publish.payload.len()
                );
                subscriptions
                    .route(InboundMessage {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                    })
                    .await;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("{} sent DISCONNECT", client_id);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("{} lost MQTT connection: {}", client_id, e);
                break;
            }
        }
    }

    state.send_replace(Connectivity::Disconnected);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

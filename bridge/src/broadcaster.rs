//! Fan-out of broker traffic to live push subscribers.
//!
//! The broadcaster owns the set of subscriber sinks. Every push walks a
//! snapshot of that set, so registration and removal never wait on a slow
//! delivery, and a failing subscriber is evicted without affecting the rest.

use crate::metrics::{ACTIVE_SUBSCRIBERS, PUSH_FAILURES_TOTAL};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Sleep;
use tokio_stream::Stream;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CONNECTION_EVENT: &str = "connection";
pub const CONNECTION_ESTABLISHED: &str = "SSE Connection established";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushEvent {
    pub name: String,
    pub data: String,
}

impl PushEvent {
    pub fn new(name: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The client went away.
    Disconnected,
    /// Anything else, e.g. a consumer too slow to drain its buffer.
    Failed(String),
}

/// Receiving end of one live subscriber.
pub trait EventSink: Send + Sync {
    fn send(&self, event: PushEvent) -> Result<(), SinkError>;

    fn is_closed(&self) -> bool;
}

/// Sink backed by a bounded channel; never blocks the sender.
pub struct ChannelSink {
    tx: mpsc::Sender<PushEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<PushEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn send(&self, event: PushEvent) -> Result<(), SinkError> {
        self.tx.try_send(event).map_err(|e| match e {
            TrySendError::Closed(_) => SinkError::Disconnected,
            TrySendError::Full(_) => SinkError::Failed("subscriber buffer full".to_string()),
        })
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct Inner {
    subscribers: RwLock<HashMap<Uuid, Arc<dyn EventSink>>>,
}

impl Inner {
    fn remove(&self, id: Uuid) -> bool {
        let removed = match self.subscribers.write() {
            Ok(mut subscribers) => subscribers.remove(&id).is_some(),
            Err(poisoned) => poisoned.into_inner().remove(&id).is_some(),
        };
        if removed {
            ACTIVE_SUBSCRIBERS.dec();
        }
        removed
    }
}

#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
    buffer: usize,
}

impl Broadcaster {
    /// `buffer` bounds how many undelivered events one subscriber may hold.
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: RwLock::new(HashMap::new()),
            }),
            buffer: buffer.max(1),
        }
    }

    /// Adds a sink and greets it with the connection event. A sink that
    /// cannot take the greeting is dropped again right away.
    pub fn register(&self, sink: Arc<dyn EventSink>) -> SubscriberLifecycle {
        let id = Uuid::new_v4();
        match self.inner.subscribers.write() {
            Ok(mut subscribers) => subscribers.insert(id, Arc::clone(&sink)),
            Err(poisoned) => poisoned.into_inner().insert(id, Arc::clone(&sink)),
        };
        ACTIVE_SUBSCRIBERS.inc();
        info!("Subscriber {} registered", id);

        let lifecycle = SubscriberLifecycle {
            id,
            inner: Arc::downgrade(&self.inner),
        };

        if let Err(e) = sink.send(PushEvent::new(CONNECTION_EVENT, CONNECTION_ESTABLISHED)) {
            lifecycle.errored(&format!("initial event not delivered: {:?}", e));
        }
        lifecycle
    }

    /// Registers a channel-backed subscriber and returns its event stream.
    pub fn register_subscriber(&self) -> SubscriberStream {
        let (tx, rx) = mpsc::channel(self.buffer);
        let lifecycle = self.register(Arc::new(ChannelSink::new(tx)));
        SubscriberStream {
            events: rx,
            lifecycle,
            deadline: None,
            ended: false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        match self.inner.subscribers.read() {
            Ok(subscribers) => subscribers.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Pushes one event to every current subscriber and returns how many
    /// accepted it.
    pub fn broadcast(&self, name: &str, data: &str) -> usize {
        let snapshot: Vec<(Uuid, Arc<dyn EventSink>)> = {
            let subscribers = match self.inner.subscribers.read() {
                Ok(subscribers) => subscribers,
                Err(poisoned) => poisoned.into_inner(),
            };
            subscribers
                .iter()
                .map(|(id, sink)| (*id, Arc::clone(sink)))
                .collect()
        };

        if snapshot.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        for (id, sink) in snapshot {
            let outcome = if sink.is_closed() {
                Err(SinkError::Disconnected)
            } else {
                sink.send(PushEvent::new(name, data))
            };

            match outcome {
                Ok(()) => delivered += 1,
                Err(SinkError::Disconnected) => {
                    info!("Subscriber {} disconnected, removing", id);
                    self.inner.remove(id);
                }
                Err(SinkError::Failed(reason)) => {
                    warn!("Push of '{}' to subscriber {} failed: {}, removing", name, id, reason);
                    PUSH_FAILURES_TOTAL.inc();
                    self.inner.remove(id);
                }
            }
        }

        debug!("Event '{}' delivered to {} subscriber(s)", name, delivered);
        delivered
    }
}

/// Removal callbacks for one registered subscriber. Each removes it at most
/// once no matter how many fire.
#[derive(Clone)]
pub struct SubscriberLifecycle {
    id: Uuid,
    inner: Weak<Inner>,
}

impl SubscriberLifecycle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn completed(&self) {
        if self.detach() {
            info!("Subscriber {} completed", self.id);
        }
    }

    pub fn timed_out(&self) {
        if self.detach() {
            info!("Subscriber {} timed out", self.id);
        }
    }

    pub fn errored(&self, reason: &str) {
        if self.detach() {
            warn!("Subscriber {} failed: {}", self.id, reason);
            PUSH_FAILURES_TOTAL.inc();
        }
    }

    fn detach(&self) -> bool {
        self.inner
            .upgrade()
            .map(|inner| inner.remove(self.id))
            .unwrap_or(false)
    }
}

/// Events for one subscriber. Dropping the stream counts as completion.
pub struct SubscriberStream {
    events: mpsc::Receiver<PushEvent>,
    lifecycle: SubscriberLifecycle,
    deadline: Option<Pin<Box<Sleep>>>,
    ended: bool,
}

impl SubscriberStream {
    /// Ends the stream and fires the timeout callback after `timeout`.
    pub fn expire_after(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Box::pin(tokio::time::sleep(timeout)));
        self
    }

    pub fn lifecycle(&self) -> &SubscriberLifecycle {
        &self.lifecycle
    }
}

impl Stream for SubscriberStream {
    type Item = PushEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<PushEvent>> {
        let this = self.get_mut();
        if this.ended {
            return Poll::Ready(None);
        }

        if let Some(deadline) = this.deadline.as_mut() {
            if deadline.as_mut().poll(cx).is_ready() {
                this.ended = true;
                this.deadline = None;
                this.lifecycle.timed_out();
                return Poll::Ready(None);
            }
        }

        match this.events.poll_recv(cx) {
            Poll::Ready(None) => {
                // Sink was evicted by the broadcaster.
                this.ended = true;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl Drop for SubscriberStream {
    fn drop(&mut self) {
        if !self.ended {
            self.lifecycle.completed();
        }
    }
}

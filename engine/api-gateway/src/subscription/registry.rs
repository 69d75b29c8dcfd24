//! Registry of live subscribers per topic
//!
//! Every subscriber owns a bounded delivery lane drained by its own task
//! into the connection's bounded outbound channel. A socket that stops
//! reading fills the outbound channel, then the lane, and the subscriber is
//! dropped as lagging on the next publish. Sequence numbers are assigned
//! under the lane lock, so delivery order on a lane always matches the
//! numbering. Lock order is lane before registry; fan-out never holds the
//! registry lock while it touches a lane.

use super::messages::{ServerMessage, WebSocketEvent};
use super::topic::{ModificationType, Topic};
use crate::metrics;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Why a message could not be queued for a subscriber
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Subscriber lane is full")]
    Lagging,

    #[error("Connection closed")]
    Closed,

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DeliveryError {
    pub fn label(&self) -> &'static str {
        match self {
            DeliveryError::Lagging => "lagging",
            DeliveryError::Closed => "closed",
            DeliveryError::Serialization(_) => "serialization",
        }
    }
}

impl From<mpsc::error::TrySendError<String>> for DeliveryError {
    fn from(err: mpsc::error::TrySendError<String>) -> Self {
        match err {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Lagging,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        }
    }
}

impl From<mpsc::error::TrySendError<WsMessage>> for DeliveryError {
    fn from(err: mpsc::error::TrySendError<WsMessage>) -> Self {
        match err {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Lagging,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        }
    }
}

impl From<serde_json::Error> for DeliveryError {
    fn from(err: serde_json::Error) -> Self {
        DeliveryError::Serialization(err.to_string())
    }
}

/// Why a subscription was not registered
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscribeError {
    #[error("Subscriber {subscriber_id} is already subscribed to {topic}")]
    Duplicate { topic: Topic, subscriber_id: String },

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

/// Outbound side of an authenticated WebSocket connection
#[derive(Debug, Clone)]
pub struct Connection {
    id: Uuid,
    outbound: mpsc::Sender<WsMessage>,
}

impl Connection {
    pub fn new(id: Uuid, outbound: mpsc::Sender<WsMessage>) -> Self {
        Self { id, outbound }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queue a text frame outside of any subscriber lane
    pub fn send_text(&self, text: String) -> Result<(), DeliveryError> {
        self.outbound.try_send(WsMessage::Text(text)).map_err(DeliveryError::from)
    }

    /// Drain a lane into this connection until either side goes away.
    ///
    /// Waits while the outbound channel is full, which leaves further
    /// events queued on the lane itself.
    fn spawn_lane(&self, mut lane: mpsc::Receiver<String>) {
        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            while let Some(text) = lane.recv().await {
                if outbound.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
        });
    }
}

struct Lane {
    sequence_number: u64,
    sender: mpsc::Sender<String>,
}

/// One subscription of one connection
pub struct Subscriber {
    topic: Topic,
    parameter: Option<String>,
    subscriber_id: String,
    connection_id: Uuid,
    lane: Mutex<Lane>,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("topic", &self.topic)
            .field("parameter", &self.parameter)
            .field("subscriber_id", &self.subscriber_id)
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

impl Subscriber {
    fn new(
        topic: Topic,
        parameter: Option<String>,
        subscriber_id: String,
        connection: &Connection,
        lane_capacity: usize,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(lane_capacity.max(1));
        connection.spawn_lane(receiver);
        Arc::new(Self {
            topic,
            parameter,
            subscriber_id,
            connection_id: connection.id(),
            lane: Mutex::new(Lane { sequence_number: 0, sender }),
        })
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn parameter(&self) -> Option<&str> {
        self.parameter.as_deref()
    }

    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Last sequence number handed out
    pub fn sequence_number(&self) -> u64 {
        self.lane.lock().sequence_number
    }

    /// A subscriber without a parameter receives every event of its topic
    pub fn matches(&self, parameter: Option<&str>) -> bool {
        match (&self.parameter, parameter) {
            (None, _) | (_, None) => true,
            (Some(own), Some(wanted)) => own == wanted,
        }
    }

    /// Number, serialize and enqueue one event; returns its sequence number.
    ///
    /// The counter only advances when the event was queued.
    pub fn send(&self, payload: &str, modification_type: ModificationType) -> Result<u64, DeliveryError> {
        let mut lane = self.lane.lock();
        let sequence_number = lane.sequence_number + 1;
        let event = ServerMessage::WebSocketEvent(WebSocketEvent {
            topic: self.topic,
            subscriber_id: self.subscriber_id.clone(),
            payload: payload.to_string(),
            modification_type,
            sequence_number,
        });
        let text = serde_json::to_string(&event)?;
        lane.sender.try_send(text)?;
        lane.sequence_number = sequence_number;
        Ok(sequence_number)
    }
}

/// Topic to subscribers map
pub struct SubscriberRegistry {
    subscribers_by_topic: Mutex<HashMap<Topic, Vec<Arc<Subscriber>>>>,
    lane_capacity: usize,
}

impl SubscriberRegistry {
    pub fn new(lane_capacity: usize) -> Self {
        Self { subscribers_by_topic: Mutex::new(HashMap::new()), lane_capacity }
    }

    /// Register a subscriber and queue its first message.
    ///
    /// `first_message` runs after the subscriber is visible to publishers
    /// but before any event can reach its lane, so a snapshot taken there
    /// is always delivered ahead of the events that follow it. A subscriber
    /// id may only be in use once per topic.
    pub fn subscribe<F>(
        &self,
        topic: Topic,
        parameter: Option<String>,
        subscriber_id: String,
        connection: &Connection,
        first_message: F,
    ) -> Result<Arc<Subscriber>, SubscribeError>
    where
        F: FnOnce() -> Result<String, DeliveryError>,
    {
        let subscriber = Subscriber::new(topic, parameter, subscriber_id, connection, self.lane_capacity);

        let lane = subscriber.lane.lock();
        if !self.insert(subscriber.clone()) {
            return Err(SubscribeError::Duplicate { topic, subscriber_id: subscriber.subscriber_id.clone() });
        }
        let queued = first_message().and_then(|text| lane.sender.try_send(text).map_err(DeliveryError::from));
        drop(lane);

        if let Err(e) = queued {
            self.remove_where(|s| std::ptr::eq(s, subscriber.as_ref()));
            return Err(e.into());
        }

        debug!(
            "Connection {} subscribed to {} as {}",
            subscriber.connection_id, topic, subscriber.subscriber_id
        );
        Ok(subscriber)
    }

    /// `false` when the topic already has a subscriber with this id
    fn insert(&self, subscriber: Arc<Subscriber>) -> bool {
        {
            let mut subscribers_by_topic = self.subscribers_by_topic.lock();
            let subscribers = subscribers_by_topic.entry(subscriber.topic).or_default();
            if subscribers.iter().any(|s| s.subscriber_id == subscriber.subscriber_id) {
                return false;
            }
            subscribers.push(subscriber);
        }
        metrics::record_subscribers_added(1);
        true
    }

    /// Remove a connection's subscriber from a topic; drops the topic once empty
    pub fn unsubscribe(&self, topic: Topic, subscriber_id: &str, connection_id: Uuid) -> bool {
        let removed = {
            let mut subscribers_by_topic = self.subscribers_by_topic.lock();
            let Some(subscribers) = subscribers_by_topic.get_mut(&topic) else {
                return false;
            };
            let before = subscribers.len();
            subscribers.retain(|s| s.subscriber_id != subscriber_id || s.connection_id != connection_id);
            let removed = before - subscribers.len();
            if subscribers.is_empty() {
                subscribers_by_topic.remove(&topic);
            }
            removed
        };

        metrics::record_subscribers_removed(removed);
        if removed > 0 {
            debug!("Unsubscribed {} from {}", subscriber_id, topic);
        }
        removed > 0
    }

    /// Remove every subscriber bound to a connection
    pub fn on_connection_closed(&self, connection_id: Uuid) -> usize {
        let removed = self.remove_where(|s| s.connection_id == connection_id);
        if removed > 0 {
            info!("Removed {} subscribers of closed connection {}", removed, connection_id);
        }
        removed
    }

    /// Subscribers of a topic, optionally narrowed to a parameter
    pub fn find_subscribers(&self, topic: Topic, parameter: Option<&str>) -> Vec<Arc<Subscriber>> {
        self.subscribers_by_topic
            .lock()
            .get(&topic)
            .map(|subscribers| subscribers.iter().filter(|s| s.matches(parameter)).cloned().collect())
            .unwrap_or_default()
    }

    /// Fan an event out to the matching subscribers; returns how many got it.
    ///
    /// Subscribers whose lane is full or whose connection is gone are dropped.
    pub fn publish(
        &self,
        topic: Topic,
        parameter: Option<&str>,
        payload: &str,
        modification_type: ModificationType,
    ) -> usize {
        let mut delivered = 0;
        let mut failed: Vec<Arc<Subscriber>> = Vec::new();

        for subscriber in self.find_subscribers(topic, parameter) {
            match subscriber.send(payload, modification_type) {
                Ok(_) => delivered += 1,
                Err(e) => {
                    warn!(
                        "Dropping subscriber {} on {} (connection {}): {}",
                        subscriber.subscriber_id, topic, subscriber.connection_id, e
                    );
                    metrics::record_delivery_failure(e.label());
                    failed.push(subscriber);
                }
            }
        }

        if !failed.is_empty() {
            self.remove_where(|s| failed.iter().any(|f| std::ptr::eq(f.as_ref(), s)));
        }
        metrics::record_event_published(topic);
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers_by_topic.lock().values().map(Vec::len).sum()
    }

    pub fn topic_count(&self) -> usize {
        self.subscribers_by_topic.lock().len()
    }

    pub fn has_topic(&self, topic: Topic) -> bool {
        self.subscribers_by_topic.lock().contains_key(&topic)
    }

    fn remove_where<P>(&self, predicate: P) -> usize
    where
        P: Fn(&Subscriber) -> bool,
    {
        let mut removed = 0;
        {
            let mut subscribers_by_topic = self.subscribers_by_topic.lock();
            subscribers_by_topic.retain(|_, subscribers| {
                let before = subscribers.len();
                subscribers.retain(|s| !predicate(s));
                removed += before - subscribers.len();
                !subscribers.is_empty()
            });
        }
        metrics::record_subscribers_removed(removed);
        removed
    }
}

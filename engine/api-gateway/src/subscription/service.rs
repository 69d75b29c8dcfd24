//! Routes subscription requests arriving on WebSocket connections

use super::messages::{ServerMessage, SubscriptionRequest, SubscriptionResponse};
use super::registry::{Connection, DeliveryError, SubscribeError, SubscriberRegistry};
use super::topic::{ModificationType, Topic};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Domain service that owns the data behind a topic
pub trait SnapshotSource: Send + Sync {
    fn topic(&self) -> Topic;

    /// Current state as a JSON document, narrowed to `parameter` when given
    fn json_payload(&self, parameter: Option<&str>) -> Option<String>;
}

/// Handle a domain service uses to push events for its topic
#[derive(Clone)]
pub struct TopicPublisher {
    topic: Topic,
    registry: Arc<SubscriberRegistry>,
}

impl TopicPublisher {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Push an event to every matching subscriber; returns the delivery count
    pub fn publish(&self, parameter: Option<&str>, payload: &str, modification_type: ModificationType) -> usize {
        self.registry.publish(self.topic, parameter, payload, modification_type)
    }
}

/// Entry point for subscription traffic
pub struct SubscriptionService {
    registry: Arc<SubscriberRegistry>,
    sources: RwLock<HashMap<Topic, Arc<dyn SnapshotSource>>>,
}

impl SubscriptionService {
    pub fn new(lane_capacity: usize) -> Self {
        Self { registry: Arc::new(SubscriberRegistry::new(lane_capacity)), sources: RwLock::new(HashMap::new()) }
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    /// Attach the snapshot source for a topic, replacing any previous one
    pub fn register_source(&self, source: Arc<dyn SnapshotSource>) -> TopicPublisher {
        let topic = source.topic();
        if self.sources.write().insert(topic, source).is_some() {
            warn!("Replaced snapshot source for {}", topic);
        } else {
            info!("Registered snapshot source for {}", topic);
        }
        TopicPublisher { topic, registry: self.registry.clone() }
    }

    /// Handle a text frame; `false` when it is not a subscription request
    pub fn on_message(&self, text: &str, connection: &Connection) -> bool {
        let Some(request) = SubscriptionRequest::parse(text) else {
            debug!("Ignoring non-subscription message on connection {}", connection.id());
            return false;
        };

        let topic = match request.topic.parse::<Topic>() {
            Ok(topic) => topic,
            Err(e) => {
                self.reply_error(connection, &request.request_id, e);
                return true;
            }
        };

        let source = self.sources.read().get(&topic).cloned();
        let Some(source) = source else {
            self.reply_error(connection, &request.request_id, format!("No publisher for topic {topic}"));
            return true;
        };

        let SubscriptionRequest { request_id, parameter, .. } = request;
        let snapshot_parameter = parameter.clone();
        let response_id = request_id.clone();
        let reply_id = request_id.clone();
        let result = self.registry.subscribe(topic, parameter, request_id, connection, move || {
            let response = ServerMessage::SubscriptionResponse(SubscriptionResponse {
                request_id: response_id,
                payload: source.json_payload(snapshot_parameter.as_deref()),
                error_message: None,
            });
            serde_json::to_string(&response).map_err(DeliveryError::from)
        });

        match result {
            Ok(_) => {}
            Err(e @ SubscribeError::Duplicate { .. }) => self.reply_error(connection, &reply_id, e.to_string()),
            Err(e) => warn!("Subscription to {} on connection {} failed: {}", topic, connection.id(), e),
        }
        true
    }

    pub fn unsubscribe(&self, topic: Topic, subscriber_id: &str, connection: &Connection) -> bool {
        self.registry.unsubscribe(topic, subscriber_id, connection.id())
    }

    pub fn on_connection_closed(&self, connection_id: Uuid) -> usize {
        self.registry.on_connection_closed(connection_id)
    }

    fn reply_error(&self, connection: &Connection, request_id: &str, message: String) {
        debug!("Rejecting subscription {}: {}", request_id, message);
        let response = ServerMessage::SubscriptionResponse(SubscriptionResponse {
            request_id: request_id.to_string(),
            payload: None,
            error_message: Some(message),
        });
        let sent = serde_json::to_string(&response)
            .map_err(DeliveryError::from)
            .and_then(|text| connection.send_text(text));
        if let Err(e) = sent {
            warn!("Failed to reply to subscription {}: {}", request_id, e);
        }
    }
}

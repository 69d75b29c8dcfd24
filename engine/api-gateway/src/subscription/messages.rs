//! Wire messages for the subscription protocol

use super::topic::{ModificationType, Topic};
use serde::{Deserialize, Serialize};

/// Client request to subscribe to a topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    /// Correlation id, reused as the subscriber id
    pub request_id: String,

    /// Topic name as sent by the client
    pub topic: String,

    /// Optional filter, e.g. a trade id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
}

impl SubscriptionRequest {
    /// Parse a text frame.
    ///
    /// Only JSON objects carrying both `requestId` and `topic` count as a
    /// subscription request; anything else yields `None`.
    pub fn parse(text: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(text).ok()?;
        let object = value.as_object()?;
        if !object.contains_key("requestId") || !object.contains_key("topic") {
            return None;
        }
        serde_json::from_value(value).ok()
    }
}

/// Reply to a [`SubscriptionRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionResponse {
    pub request_id: String,

    /// Snapshot of the topic at subscription time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Incremental event pushed to one subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketEvent {
    pub topic: Topic,
    pub subscriber_id: String,
    pub payload: String,
    pub modification_type: ModificationType,
    pub sequence_number: u64,
}

/// Messages the server sends, discriminated by `className`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "className")]
pub enum ServerMessage {
    SubscriptionResponse(SubscriptionResponse),
    WebSocketEvent(WebSocketEvent),
}

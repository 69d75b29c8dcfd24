//! Topic subscriptions over authenticated WebSocket connections
//!
//! A client sends a [`SubscriptionRequest`]; it gets a [`SubscriptionResponse`]
//! carrying the current snapshot of the topic, followed by
//! [`WebSocketEvent`]s numbered 1, 2, 3... on its own delivery lane.

pub mod messages;
pub mod registry;
pub mod service;
pub mod topic;

pub use messages::{ServerMessage, SubscriptionRequest, SubscriptionResponse, WebSocketEvent};
pub use registry::{Connection, DeliveryError, SubscribeError, Subscriber, SubscriberRegistry};
pub use service::{SnapshotSource, SubscriptionService, TopicPublisher};
pub use topic::{ModificationType, Topic};

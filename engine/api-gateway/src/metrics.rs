//! Metrics emitted by the ApiGateway
//!
//! Thin wrappers over the `metrics` facade so call sites stay one line and
//! metric names live in one place. Without an installed recorder every call
//! is a no-op.

use crate::auth::AuthMode;
use crate::error::AuthError;
use crate::subscription::Topic;
use ::metrics::{decrement_gauge, increment_counter, increment_gauge};

pub const AUTH_SUCCESS_TOTAL: &str = "api_gateway_auth_success_total";
pub const AUTH_FAILURES_TOTAL: &str = "api_gateway_auth_failures_total";
pub const EVENTS_PUBLISHED_TOTAL: &str = "api_gateway_events_published_total";
pub const DELIVERY_FAILURES_TOTAL: &str = "api_gateway_delivery_failures_total";
pub const CONNECTIONS_TOTAL: &str = "api_gateway_connections_total";
pub const ACTIVE_CONNECTIONS: &str = "api_gateway_active_connections";
pub const SUBSCRIBERS: &str = "api_gateway_subscribers";

pub fn record_auth_success(mode: AuthMode) {
    increment_counter!(AUTH_SUCCESS_TOTAL, "mode" => mode.as_str());
}

pub fn record_auth_failure(mode: AuthMode, error: &AuthError) {
    increment_counter!(
        AUTH_FAILURES_TOTAL,
        "mode" => mode.as_str(),
        "kind" => error.kind().as_str(),
        "reason" => error.label()
    );
}

pub fn record_event_published(topic: Topic) {
    increment_counter!(EVENTS_PUBLISHED_TOTAL, "topic" => topic.as_str());
}

pub fn record_delivery_failure(reason: &'static str) {
    increment_counter!(DELIVERY_FAILURES_TOTAL, "reason" => reason);
}

pub fn record_connection_opened() {
    increment_counter!(CONNECTIONS_TOTAL);
    increment_gauge!(ACTIVE_CONNECTIONS, 1.0);
}

pub fn record_connection_closed() {
    decrement_gauge!(ACTIVE_CONNECTIONS, 1.0);
}

pub fn record_subscribers_added(count: usize) {
    increment_gauge!(SUBSCRIBERS, count as f64);
}

pub fn record_subscribers_removed(count: usize) {
    if count > 0 {
        decrement_gauge!(SUBSCRIBERS, count as f64);
    }
}

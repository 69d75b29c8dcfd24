//! Configuration for the ApiGateway

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Extra retention for nonces beyond the session lifetime
const NONCE_TTL_GRACE: Duration = Duration::from_secs(5 * 60);

/// Main configuration for the ApiGateway
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Server configuration
    pub server: ServerConfig,

    /// Authentication configuration
    pub auth: AuthConfig,

    /// Subscription delivery configuration
    pub subscriptions: SubscriptionConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port for the HTTP API
    pub http_port: u16,

    /// Port for WebSocket connections
    pub websocket_port: u16,

    /// Maximum number of concurrent WebSocket connections
    pub max_connections: usize,

    /// Refuse to bind anything but a loopback address
    pub localhost_only: bool,

    /// When non-empty, only these paths (and paths below them) are served
    pub whitelist_endpoints: Vec<String>,

    /// Paths (and paths below them) that are never served
    pub blacklist_endpoints: Vec<String>,
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Lifetime of a paired session in minutes
    pub session_ttl_minutes: u64,

    /// Maximum accepted distance between client and server clocks
    pub max_clock_skew_ms: u64,

    /// Upper bound on a request body that gets hashed
    pub max_body_bytes: usize,

    /// Send the detailed failure reason in 401 bodies instead of "Unauthorized"
    pub expose_failure_reason: bool,
}

/// Subscription delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// Queued messages per subscriber before it is considered lagging
    pub lane_capacity: usize,

    /// Frames buffered per connection between the lanes and the socket
    pub outbound_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            http_port: 8090,
            websocket_port: 8091,
            max_connections: 1000,
            localhost_only: true,
            whitelist_endpoints: Vec::new(),
            blacklist_endpoints: Vec::new(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_ttl_minutes: 60,
            max_clock_skew_ms: 10 * 60 * 1000,
            max_body_bytes: crate::canonical::MAX_BODY_BYTES,
            expose_failure_reason: false,
        }
    }
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self { lane_capacity: 1024, outbound_capacity: 256 }
    }
}

impl AuthConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_minutes * 60)
    }

    pub fn max_clock_skew(&self) -> Duration {
        Duration::from_millis(self.max_clock_skew_ms)
    }

    /// Nonces must outlive any session that could have signed them
    pub fn nonce_ttl(&self) -> Duration {
        self.session_ttl() + NONCE_TTL_GRACE
    }
}

impl GatewayConfig {
    /// Get the HTTP server address
    pub fn http_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.server.host, self.server.http_port).parse()
    }

    /// Get the WebSocket server address
    pub fn websocket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.server.host, self.server.websocket_port).parse()
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), String> {
        if self.server.localhost_only && !is_loopback_host(&self.server.host) {
            return Err(format!(
                "localhost_only is set but the server host is not a loopback address: {}",
                self.server.host
            ));
        }
        if self.server.http_port == self.server.websocket_port {
            return Err(format!(
                "HTTP and WebSocket servers cannot share port {}",
                self.server.http_port
            ));
        }
        if self.auth.max_body_bytes == 0 {
            return Err("max_body_bytes must be greater than zero".to_string());
        }
        if self.subscriptions.lane_capacity == 0 {
            return Err("lane_capacity must be greater than zero".to_string());
        }
        if self.subscriptions.outbound_capacity == 0 {
            return Err("outbound_capacity must be greater than zero".to_string());
        }
        if let Some(entry) = self
            .server
            .whitelist_endpoints
            .iter()
            .chain(&self.server.blacklist_endpoints)
            .find(|entry| !entry.starts_with('/'))
        {
            return Err(format!("Endpoint entries must be absolute paths: {entry}"));
        }
        Ok(())
    }

    /// Load configuration from file
    pub fn load_from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: GatewayConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

fn is_loopback_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.auth.max_clock_skew(), Duration::from_secs(600));
        assert_eq!(config.auth.nonce_ttl(), Duration::from_secs(65 * 60));
    }

    #[test]
    fn test_localhost_only_rejects_public_host() {
        let mut config = GatewayConfig::default();
        config.server.host = "0.0.0.0".to_string();
        assert!(config.validate().is_err());

        config.server.localhost_only = false;
        assert!(config.validate().is_ok());

        config.server.localhost_only = true;
        config.server.host = "localhost".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_endpoint_lists() {
        let config: GatewayConfig =
            toml::from_str("[server]\nwhitelist_endpoints = [\"/api\", \"/ws\"]\nblacklist_endpoints = [\"/api/admin\"]\n")
                .unwrap();
        assert_eq!(config.server.whitelist_endpoints, vec!["/api", "/ws"]);
        assert_eq!(config.server.blacklist_endpoints, vec!["/api/admin"]);
        assert!(config.validate().is_ok());

        let mut relative = config.clone();
        relative.server.blacklist_endpoints.push("admin".to_string());
        assert!(relative.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        let path = path.to_str().unwrap();

        let mut config = GatewayConfig::default();
        config.auth.session_ttl_minutes = 15;
        config.save_to_file(path).unwrap();

        let loaded = GatewayConfig::load_from_file(path).unwrap();
        assert_eq!(loaded.auth.session_ttl_minutes, 15);
        assert_eq!(loaded.server.websocket_port, 8091);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: GatewayConfig = toml::from_str("[auth]\nexpose_failure_reason = true\n").unwrap();
        assert!(config.auth.expose_failure_reason);
        assert_eq!(config.auth.session_ttl_minutes, 60);
        assert_eq!(config.server.http_port, 8090);
    }
}

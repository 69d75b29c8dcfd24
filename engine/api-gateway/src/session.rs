//! Sessions and paired devices consumed by the authenticators
//!
//! Session issuance and device pairing belong to other services; the
//! gateway only needs to look things up. The in-memory implementations
//! back the standalone service and the tests.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::{debug, info};

/// Session handed out to a paired device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub session_id: String,
    pub device_id: String,
    pub expires_at: DateTime<Utc>,
}

impl SessionToken {
    pub fn is_expired(&self, now_millis: i64) -> bool {
        self.expires_at.timestamp_millis() <= now_millis
    }
}

/// Paired device and its Ed25519 public key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProfile {
    pub device_id: String,
    pub public_key: [u8; 32],
}

/// Session lookup
pub trait SessionService: Send + Sync {
    fn find(&self, session_id: &str) -> Option<SessionToken>;
}

/// Device lookup
pub trait PairingService: Send + Sync {
    fn find_device_profile(&self, device_id: &str) -> Option<DeviceProfile>;
}

/// Process-local session store
#[derive(Debug)]
pub struct InMemorySessionService {
    sessions: DashMap<String, SessionToken>,
    ttl: Duration,
}

impl InMemorySessionService {
    pub fn new(ttl: std::time::Duration) -> Self {
        let ttl = Duration::from_std(ttl).unwrap_or_else(|_| Duration::minutes(60));
        Self { sessions: DashMap::new(), ttl }
    }

    /// Open a new session for a paired device
    pub fn create_session(&self, device_id: &str) -> SessionToken {
        let token = SessionToken {
            session_id: uuid::Uuid::new_v4().to_string(),
            device_id: device_id.to_string(),
            expires_at: Utc::now() + self.ttl,
        };
        info!("Created session {} for device {}", token.session_id, device_id);
        self.sessions.insert(token.session_id.clone(), token.clone());
        token
    }

    /// Store an externally created session
    pub fn insert(&self, token: SessionToken) {
        self.sessions.insert(token.session_id.clone(), token);
    }

    pub fn remove(&self, session_id: &str) -> Option<SessionToken> {
        self.sessions.remove(session_id).map(|(_, token)| token)
    }

    /// Drop sessions that expired at or before `now_millis`
    pub fn purge_expired(&self, now_millis: i64) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, token| !token.is_expired(now_millis));
        let purged = before.saturating_sub(self.sessions.len());
        if purged > 0 {
            debug!("Purged {} expired sessions", purged);
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl SessionService for InMemorySessionService {
    fn find(&self, session_id: &str) -> Option<SessionToken> {
        self.sessions.get(session_id).map(|entry| entry.value().clone())
    }
}

/// Process-local registry of paired devices
#[derive(Debug, Default)]
pub struct InMemoryPairingService {
    devices: DashMap<String, DeviceProfile>,
}

impl InMemoryPairingService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_device(&self, profile: DeviceProfile) {
        info!("Registered device {}", profile.device_id);
        self.devices.insert(profile.device_id.clone(), profile);
    }

    pub fn remove_device(&self, device_id: &str) -> Option<DeviceProfile> {
        self.devices.remove(device_id).map(|(_, profile)| profile)
    }
}

impl PairingService for InMemoryPairingService {
    fn find_device_profile(&self, device_id: &str) -> Option<DeviceProfile> {
        self.devices.get(device_id).map(|entry| entry.value().clone())
    }
}

//! Replay protection store for `(session, nonce)` pairs

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Store of nonces seen inside the retention window.
///
/// `insert_if_absent` must be atomic: of two racing inserts for the same
/// key exactly one returns `true`.
pub trait NonceStore: Send + Sync {
    /// Record `key` observed at `observed_at_millis`; `false` if already present
    fn insert_if_absent(&self, key: &str, observed_at_millis: i64) -> bool;

    /// Remove entries observed before `cutoff_millis`, returning how many went
    fn purge_older_than(&self, cutoff_millis: i64) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Key under which a nonce is stored
pub fn nonce_key(session_id: &str, nonce: &str) -> String {
    format!("{session_id}:{nonce}")
}

/// Sharded concurrent map keyed by `sessionId:nonce`
#[derive(Debug, Default)]
pub struct InMemoryNonceStore {
    timestamp_by_session_nonce: DashMap<String, i64>,
}

impl InMemoryNonceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NonceStore for InMemoryNonceStore {
    fn insert_if_absent(&self, key: &str, observed_at_millis: i64) -> bool {
        match self.timestamp_by_session_nonce.entry(key.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(observed_at_millis);
                true
            }
        }
    }

    // TODO: switch to time-bucketed expiry if paired-device traffic ever makes this full scan show up
    fn purge_older_than(&self, cutoff_millis: i64) -> usize {
        let purged = AtomicUsize::new(0);
        self.timestamp_by_session_nonce.retain(|_, observed_at| {
            let keep = *observed_at >= cutoff_millis;
            if !keep {
                purged.fetch_add(1, Ordering::Relaxed);
            }
            keep
        });
        purged.into_inner()
    }

    fn len(&self) -> usize {
        self.timestamp_by_session_nonce.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn test_insert_if_absent() {
        let store = InMemoryNonceStore::new();
        let key = nonce_key("S1", "n1");
        assert_eq!(key, "S1:n1");

        assert!(store.insert_if_absent(&key, 1_000));
        assert!(!store.insert_if_absent(&key, 2_000));
        assert!(store.insert_if_absent(&nonce_key("S2", "n1"), 2_000));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_purge_older_than() {
        let store = InMemoryNonceStore::new();
        store.insert_if_absent("S1:a", 100);
        store.insert_if_absent("S1:b", 200);
        store.insert_if_absent("S1:c", 300);

        assert_eq!(store.purge_older_than(200), 1);
        assert_eq!(store.len(), 2);
        assert!(store.insert_if_absent("S1:a", 400));
        assert!(!store.insert_if_absent("S1:b", 400));
    }

    #[test]
    fn test_concurrent_insert_single_winner() {
        let store = Arc::new(InMemoryNonceStore::new());
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    store.insert_if_absent("S1:race", 1)
                })
            })
            .collect();

        let winners = handles.into_iter().map(|h| h.join().unwrap()).filter(|won| *won).count();
        assert_eq!(winners, 1);
    }
}

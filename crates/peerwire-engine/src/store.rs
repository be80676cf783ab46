//! Peer store
//!
//! Indexed collection of live peer sessions. Writes happen under the
//! engine control lock; readers take snapshots and never hold the internal
//! lock across await points.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use tracing::debug;

use peerwire_model::{IpPrefix, PeerKey};

use crate::session::SessionHandle;

/// Mapping `PeerKey -> SessionHandle` with at most one session per key.
#[derive(Default)]
pub struct PeerStore {
    sessions: RwLock<HashMap<PeerKey, Arc<SessionHandle>>>,
}

impl PeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session. Idempotent: returns `false` without replacement
    /// when a session for `key` already exists.
    pub fn add(&self, key: PeerKey, session: Arc<SessionHandle>) -> bool {
        let mut sessions = self.sessions.write().expect("store lock poisoned");
        if sessions.contains_key(&key) {
            debug!(peer = %key, "session already present, not replacing");
            return false;
        }
        sessions.insert(key, session);
        true
    }

    pub fn get(&self, key: &PeerKey) -> Option<Arc<SessionHandle>> {
        self.sessions
            .read()
            .expect("store lock poisoned")
            .get(key)
            .cloned()
    }

    pub fn remove(&self, key: &PeerKey) -> Option<Arc<SessionHandle>> {
        self.sessions
            .write()
            .expect("store lock poisoned")
            .remove(key)
    }

    /// Snapshot of all keys; safe to iterate without holding the lock.
    pub fn keys(&self) -> Vec<PeerKey> {
        self.sessions
            .read()
            .expect("store lock poisoned")
            .keys()
            .copied()
            .collect()
    }

    /// Snapshot of all sessions.
    pub fn sessions(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions
            .read()
            .expect("store lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Snapshot of one peer's allowed IPs.
    pub fn allowed_ips(&self, key: &PeerKey) -> Option<Vec<IpPrefix>> {
        self.sessions
            .read()
            .expect("store lock poisoned")
            .get(key)
            .map(|s| s.allowed_ips().to_vec())
    }

    /// Find the peer whose allowed IPs cover `ip`.
    pub fn find_by_ip(&self, ip: IpAddr) -> Option<Arc<SessionHandle>> {
        let sessions = self.sessions.read().expect("store lock poisoned");
        sessions
            .values()
            .find(|s| s.allowed_ips().iter().any(|p| p.contains(ip)))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().expect("store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! Status ledger
//!
//! Authoritative view of what the engine believes about itself and every
//! peer, read by UIs and health probes. Writers are the reconciler, peer
//! sessions, and the health prober; reads return snapshots.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::SystemTime;

use tracing::debug;

use peerwire_model::{OfflinePeer, PeerKey};

use crate::collab::TunnelStats;
use crate::probe::ProbeOutcome;

/// Coarse connection status reported per peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

/// One peer's ledger record.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub key: PeerKey,
    pub fqdn: String,
    pub ip: String,
    pub status: ConnStatus,
    pub last_change: SystemTime,
    pub relayed: bool,
    pub tunnel: TunnelStats,
}

impl PeerRecord {
    fn new(key: PeerKey, fqdn: String, ip: String) -> Self {
        Self {
            key,
            fqdn,
            ip,
            status: ConnStatus::Connecting,
            last_change: SystemTime::now(),
            relayed: false,
            tunnel: TunnelStats::default(),
        }
    }
}

/// This node's own state.
#[derive(Debug, Clone, Default)]
pub struct LocalRecord {
    pub ip: String,
    pub fqdn: String,
    pub public_key: String,
}

/// Full ledger snapshot.
#[derive(Debug, Clone, Default)]
pub struct StatusSnapshot {
    pub local: LocalRecord,
    pub peers: Vec<PeerRecord>,
    pub offline_peers: Vec<OfflinePeer>,
    pub relay_probes: Vec<ProbeOutcome>,
}

#[derive(Default)]
struct Inner {
    local: LocalRecord,
    peers: HashMap<PeerKey, PeerRecord>,
    offline: Vec<OfflinePeer>,
    relay_probes: Vec<ProbeOutcome>,
    generation: u64,
}

/// The ledger itself. Internally synchronized; safe to share via `Arc`.
#[derive(Default)]
pub struct StatusLedger {
    inner: RwLock<Inner>,
}

impl StatusLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peer(&self, key: PeerKey, fqdn: &str, ip: &str) {
        let mut inner = self.inner.write().expect("status lock poisoned");
        inner
            .peers
            .entry(key)
            .or_insert_with(|| PeerRecord::new(key, fqdn.to_string(), ip.to_string()));
    }

    pub fn remove_peer(&self, key: &PeerKey) {
        let mut inner = self.inner.write().expect("status lock poisoned");
        if inner.peers.remove(key).is_none() {
            debug!(peer = %key, "removing unknown peer from status ledger");
        }
    }

    pub fn update_conn_status(&self, key: &PeerKey, status: ConnStatus, relayed: bool) {
        let mut inner = self.inner.write().expect("status lock poisoned");
        if let Some(rec) = inner.peers.get_mut(key) {
            rec.status = status;
            rec.relayed = relayed;
            rec.last_change = SystemTime::now();
        }
    }

    pub fn update_fqdn(&self, key: &PeerKey, fqdn: &str) {
        let mut inner = self.inner.write().expect("status lock poisoned");
        if let Some(rec) = inner.peers.get_mut(key) {
            rec.fqdn = fqdn.to_string();
        }
    }

    pub fn update_tunnel_stats(&self, key: &PeerKey, stats: TunnelStats) {
        let mut inner = self.inner.write().expect("status lock poisoned");
        if let Some(rec) = inner.peers.get_mut(key) {
            rec.tunnel = stats;
        }
    }

    /// Replace the offline set wholesale.
    pub fn replace_offline_peers(&self, offline: Vec<OfflinePeer>) {
        let mut inner = self.inner.write().expect("status lock poisoned");
        inner.offline = offline;
    }

    pub fn update_relay_states(&self, probes: Vec<ProbeOutcome>) {
        let mut inner = self.inner.write().expect("status lock poisoned");
        inner.relay_probes = probes;
    }

    pub fn set_local(&self, local: LocalRecord) {
        let mut inner = self.inner.write().expect("status lock poisoned");
        inner.local = local;
    }

    /// Mark the end of a batch of peer-list modifications.
    pub fn finish_peer_modifications(&self) {
        let mut inner = self.inner.write().expect("status lock poisoned");
        inner.generation += 1;
    }

    pub fn generation(&self) -> u64 {
        self.inner.read().expect("status lock poisoned").generation
    }

    pub fn peer(&self, key: &PeerKey) -> Option<PeerRecord> {
        self.inner
            .read()
            .expect("status lock poisoned")
            .peers
            .get(key)
            .cloned()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let inner = self.inner.read().expect("status lock poisoned");
        StatusSnapshot {
            local: inner.local.clone(),
            peers: inner.peers.values().cloned().collect(),
            offline_peers: inner.offline.clone(),
            relay_probes: inner.relay_probes.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(b: u8) -> PeerKey {
        PeerKey::from_bytes([b; 32])
    }

    #[test]
    fn add_is_idempotent() {
        let ledger = StatusLedger::new();
        ledger.add_peer(key(1), "a.example", "10.0.0.2");
        ledger.update_conn_status(&key(1), ConnStatus::Connected, false);
        // re-adding must not reset the record
        ledger.add_peer(key(1), "a.example", "10.0.0.2");
        assert_eq!(ledger.peer(&key(1)).unwrap().status, ConnStatus::Connected);
    }

    #[test]
    fn offline_set_replaced_wholesale() {
        let ledger = StatusLedger::new();
        ledger.replace_offline_peers(vec![OfflinePeer {
            key: key(2),
            fqdn: "b.example".into(),
            allowed_ips: vec![],
        }]);
        assert_eq!(ledger.snapshot().offline_peers.len(), 1);
        ledger.replace_offline_peers(Vec::new());
        assert!(ledger.snapshot().offline_peers.is_empty());
    }

    #[test]
    fn unknown_peer_updates_are_ignored() {
        let ledger = StatusLedger::new();
        ledger.update_conn_status(&key(3), ConnStatus::Connected, true);
        assert!(ledger.peer(&key(3)).is_none());
    }
}

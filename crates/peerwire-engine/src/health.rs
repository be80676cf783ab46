//! Health probes
//!
//! On-demand reachability checks: control and signal stream health bits,
//! STUN/TURN binding probes, and per-peer tunnel statistics. Stats
//! collection runs under the control lock; the network probes deliberately
//! do not, so a slow STUN server cannot stall reconciliation.

use tracing::{debug, warn};

use crate::engine::Engine;
use crate::probe;

impl Engine {
    /// Probe everything and update the status ledger. Returns the health
    /// aggregate.
    pub async fn run_health_probes(&self) -> bool {
        let (signal_healthy, control_healthy, servers) = {
            let inner = self.inner.lock().await;

            let signal_healthy = inner.collab.signal.is_healthy();
            debug!(healthy = signal_healthy, "signal health check");
            let control_healthy = inner.collab.control.is_healthy();
            debug!(healthy = control_healthy, "control health check");

            match inner.collab.tunnel.stats().await {
                Ok(stats) => {
                    for key in inner.store.keys() {
                        if let Some(peer_stats) = stats.get(&key) {
                            inner.status.update_tunnel_stats(&key, *peer_stats);
                        }
                    }
                }
                Err(e) => {
                    warn!("failed to collect tunnel stats: {}", e);
                    return false;
                }
            }

            let mut servers = inner.stuns.clone();
            servers.extend(inner.turns.iter().cloned());
            (signal_healthy, control_healthy, servers)
        };

        // probes run outside the control lock
        let outcomes = probe::probe_all(&servers).await;
        let relay_healthy = outcomes.iter().all(|o| o.healthy());
        debug!(healthy = relay_healthy, probes = outcomes.len(), "relay health check");
        self.status.update_relay_states(outcomes);

        let all = signal_healthy && control_healthy && relay_healthy;
        debug!(healthy = all, "health checks completed");
        all
    }
}

#[cfg(test)]
mod tests {
    use crate::config::EngineConfig;
    use crate::engine::Engine;
    use crate::testutil::*;
    use peerwire_model::PeerKey;
    use std::sync::Arc;

    fn key(b: u8) -> PeerKey {
        PeerKey::from_bytes([b; 32])
    }

    fn engine_with(signaler: Arc<MockSignaler>) -> Engine {
        let collab = crate::engine::Collaborators {
            tunnel: MockTunnel::new(),
            firewall: None,
            routes: Arc::new(MockRoutes::default()),
            dns: Arc::new(MockDns::default()),
            dns_forwarder: None,
            ingress: None,
            ssh: None,
            key_agreement: None,
            relay: None,
            flow: None,
            control: MockControl::new(),
            signal: signaler,
            network_watcher: None,
            state_store: Arc::new(MemoryStateStore::default()),
            negotiator: Arc::new(InstantNegotiator::direct()),
        };
        let (engine, _reasons) = Engine::new(EngineConfig::default(), key(9), collab).unwrap();
        engine
    }

    #[tokio::test]
    async fn healthy_streams_and_no_servers_aggregate_true() {
        let signaler = MockSignaler::new();
        let engine = engine_with(signaler);
        assert!(engine.run_health_probes().await);
    }

    #[tokio::test]
    async fn unhealthy_signal_fails_aggregate() {
        let signaler = MockSignaler::new();
        signaler.set_healthy(false);
        let engine = engine_with(signaler);
        assert!(!engine.run_health_probes().await);
    }
}

//! Network-map reconciliation
//!
//! Diff-applies successive control-plane snapshots onto the live peer set
//! and the downstream managers. Runs under the engine control lock; a
//! session observes either the pre-update or the post-update world, never
//! a torn mix.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use peerwire_model::{
    classify_routes, compare_allowed_ips, NetworkMap, PeerDescriptor, RelayConfig,
};

use crate::collab::{ForwarderEntry, InfraConfig, SyncEvent};
use crate::engine::{EngineInner, AGENT_VERSION};
use crate::error::{EngineError, EngineResult, ErrorBag};
use crate::session::{spawn_session, SessionConfig, SessionDeps, SessionHandle};
use crate::snapshot::IceServers;
use crate::status::LocalRecord;

impl EngineInner {
    /// Apply one control-plane frame: infrastructure config, posture
    /// checks, then the network map.
    pub(crate) async fn apply_sync(&mut self, event: SyncEvent) -> EngineResult<()> {
        if let Some(infra) = event.infra {
            self.update_infra(infra).await?;
        }
        if let Some(checks) = event.checks {
            self.update_checks(checks).await;
        }
        if let Some(map) = event.map {
            self.update_network_map(map).await?;
        }
        Ok(())
    }

    /// Replace STUN/TURN lists, refresh relay credentials, and publish the
    /// new snapshot for sessions.
    pub(crate) async fn update_infra(&mut self, infra: InfraConfig) -> EngineResult<()> {
        if !infra.stuns.is_empty() {
            debug!(count = infra.stuns.len(), "STUN server list updated");
            self.stuns = infra.stuns;
        }
        if !infra.turns.is_empty() {
            debug!(count = infra.turns.len(), "TURN server list updated");
            self.turns = infra.turns;
        }
        self.publish_ice_servers();

        if let Some(relay_cfg) = infra.relay {
            self.update_relay(&relay_cfg).await?;
        } else if let Some(relay) = &self.collab.relay {
            relay.update_urls(Vec::new()).await;
            self.relay_addr.store(None);
        }

        if let (Some(settings), Some(flow)) = (infra.flow, &self.collab.flow) {
            if let Err(e) = flow.update(settings).await {
                error!("failed to update flow configuration: {}", e);
            }
        }
        Ok(())
    }

    fn publish_ice_servers(&self) {
        self.ice_servers.store(IceServers {
            stuns: self.stuns.clone(),
            turns: self.turns.clone(),
        });
    }

    async fn update_relay(&mut self, cfg: &RelayConfig) -> EngineResult<()> {
        let Some(relay) = &self.collab.relay else {
            return Ok(());
        };

        let had_urls = relay.relay_address().is_some();
        relay
            .update_token(&cfg.token_payload, &cfg.token_signature)
            .await
            .map_err(|e| EngineError::Relay(format!("update relay token: {}", e)))?;
        relay.update_urls(cfg.urls.clone()).await;

        // connect opportunistically once servers appear; reconnect retries
        // are the relay client's own concern
        if !had_urls && !cfg.urls.is_empty() {
            if let Err(e) = relay.serve().await {
                debug!("relay serve failed, leaving retries to the client: {}", e);
            }
        }
        self.relay_addr.store(relay.relay_address());
        Ok(())
    }

    /// Posture checks changed: re-send meta so the control plane sees the
    /// refreshed system info.
    pub(crate) async fn update_checks(&mut self, checks: Vec<String>) {
        if self.checks == checks {
            return;
        }
        self.checks = checks;
        let meta = self.meta();
        if let Err(e) = self.collab.control.send_meta(meta).await {
            error!("could not sync meta: {}", e);
        }
    }

    /// The reconciler proper: spec'd steps in order, serial gate first.
    pub(crate) async fn update_network_map(&mut self, map: NetworkMap) -> EngineResult<()> {
        if map.serial <= self.last_applied {
            debug!(
                serial = map.serial,
                last_applied = self.last_applied,
                "ignoring outdated network map"
            );
            return Ok(());
        }
        let serial = map.serial;
        let mut errors = ErrorBag::new();

        // local peer config
        if let Some(local) = &map.local {
            self.apply_local_config(local).await?;
        }

        // activation policy; flag changes apply at this reconciliation
        let map_lazy = map
            .local
            .as_ref()
            .map(|l| l.lazy_connection_enabled)
            .unwrap_or(false);
        self.conn_mgr
            .set_policy(self.config.lazy_connection_enabled || map_lazy);

        // relay / STUN / TURN carried in the map
        if !map.stuns.is_empty() {
            self.stuns = map.stuns.clone();
        }
        if !map.turns.is_empty() {
            self.turns = map.turns.clone();
        }
        self.publish_ice_servers();
        if let Some(relay_cfg) = &map.relay {
            if let Err(e) = self.update_relay(relay_cfg).await {
                error!("relay update failed: {}", e);
                errors.push(e);
            }
        }

        // firewall legacy toggle happens before routes are applied
        if let Some(firewall) = &self.collab.firewall {
            if let Err(e) = firewall.update_local_ips().await {
                error!("failed to update local IPs: {}", e);
            }
            let legacy = legacy_firewall_mode(&map);
            if let Err(e) = firewall.set_legacy_mode(legacy).await {
                error!("failed to set legacy firewall mode: {}", e);
            }
            if let Err(e) = firewall.apply(&map).await {
                error!("failed to apply firewall rules: {}", e);
                errors.push(e);
            }
        }

        // route plan
        let mut classified = classify_routes(&map.routes, &self.local_key);
        if self.config.disable_server_routes {
            classified.server.clear();
        }
        if self.config.disable_client_routes {
            classified.client.clear();
        }

        // HA groups are announced before routes are applied so lazy
        // activation can resolve membership
        self.conn_mgr.update_ha_groups(&classified.client);
        self.client_routes.store(classified.client_prefixes());

        if let Err(e) = self
            .collab
            .dns
            .update(serial, map.dns.clone())
            .await
        {
            error!("failed to update dns server: {}", e);
        }

        let dns_flag = map
            .local
            .as_ref()
            .map(|l| l.routing_peer_dns_resolution_enabled)
            .unwrap_or(false);
        if let Err(e) = self
            .collab
            .routes
            .update_routes(
                serial,
                classified.server.clone(),
                classified.client.clone(),
                dns_flag,
            )
            .await
        {
            error!("failed to update routes: {}", e);
        }

        if let Some(forwarder) = &self.collab.dns_forwarder {
            let entries = forwarder_entries(&map, &self.local_key);
            if let Err(e) = forwarder.update_entries(entries).await {
                error!("failed to update dns forwarder: {}", e);
            }
        }

        // offline peers replaced wholesale
        self.status.replace_offline_peers(map.offline_peers.clone());

        // peer set diff
        if map.peers_is_empty && map.peers.is_empty() {
            // cleanup request, most likely this peer was deleted upstream
            info!("network map marked empty, removing all peers");
            self.remove_all_peers().await;
            self.status.finish_peer_modifications();
        } else {
            self.diff_peers(&map, &mut errors).await;
        }

        // forwarding rules; translated peers never idle
        if let Some(ingress) = &self.collab.ingress {
            match ingress.update_rules(map.forwarding_rules.clone()).await {
                Ok(applied) => {
                    let excluded: HashSet<_> =
                        applied.iter().map(|r| r.translated_peer).collect();
                    self.conn_mgr.set_exclude(excluded);
                }
                Err(e) => {
                    error!("failed to update forwarding rules: {}", e);
                    errors.push(e);
                }
            }
        }

        // serial advances last so a partial failure retries idempotently
        self.last_applied = serial;

        self.collab.dns.probe_availability().await;

        if !errors.is_empty() {
            warn!(
                count = errors.len(),
                serial, "network map applied with entry-level errors"
            );
        }
        info!(serial, peers = map.peers.len(), "network map applied");
        Ok(())
    }

    async fn apply_local_config(
        &mut self,
        local: &peerwire_model::LocalPeerConfig,
    ) -> EngineResult<()> {
        if !local.address.is_empty() {
            let current = self.collab.tunnel.address().unwrap_or_default();
            if current != local.address {
                info!(from = %current, to = %local.address, "updating local overlay address");
                self.collab.tunnel.update_address(&local.address).await?;
                self.config.wg_addr = local.address.clone();
            }
        }

        self.ssh_enabled = local.ssh_enabled && self.config.ssh_server_permitted();
        if local.ssh_enabled && !self.config.ssh_server_permitted() {
            info!("SSH server requested by the map but disabled by local config");
        }

        self.status.set_local(LocalRecord {
            ip: self.config.wg_addr.clone(),
            fqdn: local.fqdn.clone(),
            public_key: self.local_key.to_base64(),
        });
        Ok(())
    }

    async fn diff_peers(&mut self, map: &NetworkMap, errors: &mut ErrorBag) {
        let desired: HashSet<_> = map.peers.iter().map(|p| p.key).collect();

        // remove peers that left the map
        for key in self.store.keys() {
            if !desired.contains(&key) {
                self.remove_peer(&key).await;
                info!(peer = %key, "removed peer");
            }
        }

        // modified peers are closed and recreated, not mutated in place
        let mut modified = Vec::new();
        for descriptor in &map.peers {
            let Some(existing) = self.store.get(&descriptor.key) else {
                continue;
            };
            if existing.agent_version() != descriptor.agent_version {
                info!(
                    peer = %descriptor.key,
                    from = existing.agent_version(),
                    to = %descriptor.agent_version,
                    "peer agent version changed, recreating session"
                );
                modified.push(descriptor.clone());
                continue;
            }
            let ip_strings: Vec<String> =
                descriptor.allowed_ips.iter().map(|p| p.to_string()).collect();
            if !compare_allowed_ips(existing.allowed_ips(), &ip_strings) {
                modified.push(descriptor.clone());
                continue;
            }
            self.status.update_fqdn(&descriptor.key, &descriptor.fqdn);
        }
        for descriptor in &modified {
            self.remove_peer(&descriptor.key).await;
        }
        for descriptor in &modified {
            if let Err(e) = self.add_new_peer(descriptor).await {
                error!(peer = %descriptor.key, "failed to recreate peer: {}", e);
                errors.push(e);
            }
        }

        // brand new peers
        for descriptor in &map.peers {
            if self.store.get(&descriptor.key).is_none() {
                if let Err(e) = self.add_new_peer(descriptor).await {
                    error!(peer = %descriptor.key, "failed to add peer: {}", e);
                    errors.push(e);
                }
            }
        }

        self.status.finish_peer_modifications();

        // SSH authorized keys for the remaining peers
        if self.ssh_enabled {
            if let Some(ssh) = &self.collab.ssh {
                for descriptor in &map.peers {
                    if let Some(key_material) = &descriptor.ssh_public_key {
                        if let Err(e) = ssh
                            .add_authorized_key(descriptor.key, key_material.clone())
                            .await
                        {
                            warn!(peer = %descriptor.key, "failed to add ssh key: {}", e);
                        }
                    }
                }
            }
        }
    }

    /// Create a session plus its tunnel entry and ledger record. No-op when
    /// the peer already exists.
    pub(crate) async fn add_new_peer(&mut self, descriptor: &PeerDescriptor) -> EngineResult<()> {
        if self.store.get(&descriptor.key).is_some() {
            return Ok(());
        }

        self.collab
            .tunnel
            .add_peer(
                descriptor.key,
                descriptor.allowed_ips.clone(),
                self.config.pre_shared_key,
            )
            .await?;

        let ip = descriptor
            .primary_ip()
            .map(|ip| ip.to_string())
            .unwrap_or_default();
        self.status.add_peer(descriptor.key, &descriptor.fqdn, &ip);

        let handle = Arc::new(self.create_session(descriptor));
        if !self.store.add(descriptor.key, handle.clone()) {
            handle.close(false);
            return Err(EngineError::PeerExists(descriptor.key.to_string()));
        }
        self.conn_mgr.on_peer_added(&handle);
        Ok(())
    }

    fn create_session(&self, descriptor: &PeerDescriptor) -> SessionHandle {
        debug!(peer = %descriptor.key, "creating peer session");
        let cfg = SessionConfig {
            key: descriptor.key,
            local_key: self.local_key,
            allowed_ips: descriptor.allowed_ips.clone(),
            fqdn: descriptor.fqdn.clone(),
            agent_version: descriptor.agent_version.clone(),
            local_agent_version: AGENT_VERSION.to_string(),
            timeout: SessionConfig::random_timeout(),
            wg_listen_port: self.config.wg_port,
            nat_external_ips: self.config.parse_nat_external_mappings(),
            disable_ipv6: self.config.disable_ipv6_discovery,
            udp_mux_port: self.config.udp_mux_port,
            udp_mux_srflx_port: self.config.udp_mux_srflx_port,
        };
        let deps = SessionDeps {
            signaler: self.collab.signal.clone(),
            tunnel: self.collab.tunnel.clone(),
            negotiator: self.collab.negotiator.clone(),
            admission: self.admission.clone(),
            status: self.status.clone(),
            ice_servers: self.ice_servers.clone(),
            relay_addr: self.relay_addr.clone(),
            key_agreement: self.collab.key_agreement.clone(),
        };
        spawn_session(cfg, deps)
    }
}

/// Older control planes cannot send route firewall rules at all. An empty
/// rule list without the explicit empty marker means we talk to one of
/// them and must fall back to permissive legacy behavior.
// TODO: replace with a control-plane capability bit once the protocol
// grows one; inferring age from rule-list shape cannot distinguish "no
// rules configured" on old servers.
fn legacy_firewall_mode(map: &NetworkMap) -> bool {
    map.firewall.route_rules.is_empty() && !map.firewall.route_rules_is_empty
}

/// DNS forwarder entries for domain routes this node serves as gateway.
fn forwarder_entries(map: &NetworkMap, local_key: &peerwire_model::PeerKey) -> Vec<ForwarderEntry> {
    let mut entries = Vec::new();
    for route in &map.routes {
        if route.domains.is_empty() || &route.peer != local_key {
            continue;
        }
        for domain in &route.domains {
            entries.push(ForwarderEntry {
                domain: domain.clone(),
                route_id: route.id.clone(),
            });
        }
    }
    entries
}

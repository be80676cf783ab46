//! Collaborator interfaces
//!
//! The engine drives a set of host-side managers it does not implement
//! itself. Each concern gets one capability trait; the bootstrap picks one
//! implementation per concern and the engine holds it for its lifetime.

use std::collections::HashMap;

use async_trait::async_trait;

use peerwire_model::{
    DnsConfig, FirewallRuleSet, ForwardingRule, IceUri, IpPrefix, NetworkMap, PeerKey, RelayConfig,
    Route, SignalMessage,
};

use crate::error::EngineResult;

/// Per-peer counters read from the tunnel device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub last_handshake_unix: u64,
}

/// The local encrypted tunnel interface.
///
/// The engine owns address changes; peer sessions own their own peer table
/// entries. The device serializes its own mutations.
#[async_trait]
pub trait TunnelInterface: Send + Sync {
    async fn up(&self) -> EngineResult<()>;

    /// Local overlay address. Errors when the device is not initialized.
    fn address(&self) -> EngineResult<String>;

    async fn update_address(&self, addr: &str) -> EngineResult<()>;

    async fn add_peer(
        &self,
        key: PeerKey,
        allowed_ips: Vec<IpPrefix>,
        pre_shared_key: Option<[u8; 32]>,
    ) -> EngineResult<()>;

    async fn update_peer_endpoint(&self, key: PeerKey, endpoint: String) -> EngineResult<()>;

    async fn remove_peer(&self, key: PeerKey) -> EngineResult<()>;

    /// Snapshot of the peer table, for reconciliation checks.
    async fn peer_allowed_ips(&self, key: PeerKey) -> Option<Vec<IpPrefix>>;

    async fn stats(&self) -> EngineResult<HashMap<PeerKey, TunnelStats>>;

    async fn close(&self) -> EngineResult<()>;
}

/// Firewall manager.
#[async_trait]
pub trait FirewallOps: Send + Sync {
    async fn apply(&self, map: &NetworkMap) -> EngineResult<()>;

    /// Compatibility toggle for control planes that predate route rules.
    async fn set_legacy_mode(&self, enabled: bool) -> EngineResult<()>;

    async fn update_local_ips(&self) -> EngineResult<()>;

    async fn close(&self) -> EngineResult<()>;
}

/// Kernel route programming plus client-route bookkeeping.
#[async_trait]
pub trait RouteOps: Send + Sync {
    async fn init(&self) -> EngineResult<()>;

    async fn update_routes(
        &self,
        serial: u64,
        server_routes: Vec<Route>,
        client_routes: Vec<Route>,
        dns_route_flag: bool,
    ) -> EngineResult<()>;

    async fn stop(&self) -> EngineResult<()>;
}

/// Local DNS server manager.
#[async_trait]
pub trait DnsOps: Send + Sync {
    async fn init(&self) -> EngineResult<()>;

    async fn update(&self, serial: u64, config: DnsConfig) -> EngineResult<()>;

    /// Test upstreams for availability right away instead of upon usage.
    async fn probe_availability(&self);

    async fn stop(&self) -> EngineResult<()>;
}

/// One DNS forwarding entry for a domain route we serve as gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwarderEntry {
    pub domain: String,
    pub route_id: String,
}

/// DNS forwarder for domain routes.
#[async_trait]
pub trait DnsForwarderOps: Send + Sync {
    async fn update_entries(&self, entries: Vec<ForwarderEntry>) -> EngineResult<()>;

    async fn stop(&self) -> EngineResult<()>;
}

/// Ingress gateway: port-forwarding rules translated onto peers.
#[async_trait]
pub trait IngressOps: Send + Sync {
    /// Apply the rule set; returns the rules actually in effect.
    async fn update_rules(&self, rules: Vec<ForwardingRule>) -> EngineResult<Vec<ForwardingRule>>;

    async fn close(&self) -> EngineResult<()>;
}

/// Local SSH server authorized-key registry.
#[async_trait]
pub trait SshAuthority: Send + Sync {
    async fn add_authorized_key(&self, peer: PeerKey, key_material: String) -> EngineResult<()>;

    async fn remove_authorized_key(&self, peer: PeerKey);

    async fn stop(&self) -> EngineResult<()>;
}

/// Post-quantum key agreement daemon (e.g. Rosenpass).
#[async_trait]
pub trait KeyAgreement: Send + Sync {
    fn public_key(&self) -> Vec<u8>;

    fn listen_addr(&self) -> String;

    async fn on_connected(
        &self,
        peer: PeerKey,
        remote_key: Vec<u8>,
        remote_addr: String,
    ) -> EngineResult<()>;

    async fn on_disconnected(&self, peer: PeerKey);

    async fn close(&self) -> EngineResult<()>;
}

/// Pre-authenticated relay service client.
#[async_trait]
pub trait RelayOps: Send + Sync {
    async fn update_token(&self, payload: &str, signature: &str) -> EngineResult<()>;

    async fn update_urls(&self, urls: Vec<String>);

    /// Opportunistically establish the relay connection; reconnection is the
    /// implementation's own concern.
    async fn serve(&self) -> EngineResult<()>;

    fn relay_address(&self) -> Option<String>;
}

/// Flow logging manager configuration, forwarded opaquely.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowSettings {
    pub enabled: bool,
    pub interval_secs: u64,
    pub url: String,
    pub counters: bool,
}

#[async_trait]
pub trait FlowOps: Send + Sync {
    async fn update(&self, settings: FlowSettings) -> EngineResult<()>;

    async fn close(&self) -> EngineResult<()>;
}

/// Host network change watcher.
#[async_trait]
pub trait NetworkWatcher: Send + Sync {
    /// Resolves when the host network changed. Cancel-safe.
    async fn wait_for_change(&self);
}

/// Opaque key/value state persisted across engine restarts so subordinate
/// managers can restore host invariants after a crash.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn put(&self, key: &str, value: Vec<u8>) -> EngineResult<()>;

    async fn get(&self, key: &str) -> Option<Vec<u8>>;

    async fn persist(&self) -> EngineResult<()>;
}

/// Meta information sent on control-stream attach and on posture-check change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Meta {
    pub agent_version: String,
    pub hostname: String,
    pub os: String,
    /// Feature flags mirrored from the engine config
    pub flags: Vec<(String, bool)>,
}

/// Infrastructure portion of a control-plane sync frame.
#[derive(Debug, Clone, Default)]
pub struct InfraConfig {
    pub stuns: Vec<IceUri>,
    pub turns: Vec<IceUri>,
    pub relay: Option<RelayConfig>,
    pub flow: Option<FlowSettings>,
}

/// One frame delivered by the control stream.
#[derive(Debug, Clone, Default)]
pub struct SyncEvent {
    pub infra: Option<InfraConfig>,
    pub checks: Option<Vec<String>>,
    pub map: Option<NetworkMap>,
}

/// Long-lived control-plane stream.
#[async_trait]
pub trait ControlStream: Send + Sync {
    async fn send_meta(&self, meta: Meta) -> EngineResult<()>;

    /// Next frame. `Ok(None)` is a clean stream end; `Err` is fatal and
    /// triggers an engine reset.
    async fn next(&self) -> EngineResult<Option<SyncEvent>>;

    fn is_healthy(&self) -> bool;
}

/// Long-lived signaling stream.
#[async_trait]
pub trait SignalStream: Send + Sync {
    async fn send(&self, msg: SignalMessage) -> EngineResult<()>;

    /// Next inbound message. `Ok(None)` is a clean stream end; `Err` is
    /// fatal and triggers an engine reset.
    async fn next(&self) -> EngineResult<Option<SignalMessage>>;

    fn is_healthy(&self) -> bool;
}

//! Network map
//!
//! The authoritative, versioned snapshot delivered by the control plane:
//! who this peer should talk to, over what routes, with what DNS and
//! firewall configuration.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::ice::IceUri;
use crate::key::PeerKey;
use crate::prefix::IpPrefix;
use crate::route::Route;

/// One remote peer as described by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub key: PeerKey,
    /// CIDR prefixes that route through this peer
    pub allowed_ips: Vec<IpPrefix>,
    pub fqdn: String,
    pub agent_version: String,
    #[serde(default)]
    pub ssh_public_key: Option<String>,
    #[serde(default)]
    pub post_quantum_public_key: Option<Vec<u8>>,
}

impl PeerDescriptor {
    /// First allowed IP, conventionally the peer's overlay address
    pub fn primary_ip(&self) -> Option<std::net::IpAddr> {
        self.allowed_ips.first().map(|p| p.addr())
    }
}

/// A peer known to the network but currently unreachable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflinePeer {
    pub key: PeerKey,
    pub fqdn: String,
    pub allowed_ips: Vec<IpPrefix>,
}

/// This node's own configuration as carried in the map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalPeerConfig {
    /// Local overlay address, e.g. "100.64.0.5/16"
    pub address: String,
    pub fqdn: String,
    #[serde(default)]
    pub ssh_enabled: bool,
    /// Control-plane override for the lazy connection policy
    #[serde(default)]
    pub lazy_connection_enabled: bool,
    #[serde(default)]
    pub routing_peer_dns_resolution_enabled: bool,
}

/// DNS configuration subset the engine forwards to its DNS manager.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DnsConfig {
    pub service_enabled: bool,
    #[serde(default)]
    pub custom_zones: Vec<CustomZone>,
    #[serde(default)]
    pub nameserver_groups: Vec<NameServerGroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomZone {
    pub domain: String,
    #[serde(default)]
    pub records: Vec<DnsRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub name: String,
    pub record_type: u16,
    pub class: String,
    pub ttl: u32,
    pub rdata: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameServerGroup {
    pub primary: bool,
    #[serde(default)]
    pub domains: Vec<String>,
    pub nameservers: Vec<String>,
    #[serde(default)]
    pub search_domains_enabled: bool,
}

/// Firewall rules carried in the map. The engine treats rule bodies as
/// opaque and hands them to the firewall manager.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FirewallRuleSet {
    #[serde(default)]
    pub peer_rules: Vec<FirewallRule>,
    #[serde(default)]
    pub route_rules: Vec<FirewallRule>,
    /// Explicit marker distinguishing "no route rules" from "control plane
    /// too old to send route rules". See the reconciler's legacy handling.
    #[serde(default)]
    pub route_rules_is_empty: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirewallRule {
    pub id: String,
    pub body: Vec<u8>,
}

/// Transport protocol for ingress forwarding rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardProtocol {
    Tcp,
    Udp,
}

/// Ingress gateway forwarding rule: traffic arriving on `ingress_port` is
/// translated to `translated_peer` on `translated_port`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardingRule {
    pub protocol: ForwardProtocol,
    pub ingress_port: u16,
    pub translated_peer: PeerKey,
    pub translated_port: u16,
}

/// Relay service configuration announced by the control plane.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    pub urls: Vec<String>,
    pub token_payload: String,
    pub token_signature: String,
}

/// The authoritative network snapshot. `serial` orders snapshots; the
/// engine never applies a map whose serial is not strictly greater than
/// the last applied one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkMap {
    pub serial: u64,
    #[serde(default)]
    pub local: Option<LocalPeerConfig>,
    #[serde(default)]
    pub peers: Vec<PeerDescriptor>,
    /// Cleanup marker: an empty `peers` list is only honored when this is set.
    #[serde(default)]
    pub peers_is_empty: bool,
    #[serde(default)]
    pub offline_peers: Vec<OfflinePeer>,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub firewall: FirewallRuleSet,
    #[serde(default)]
    pub forwarding_rules: Vec<ForwardingRule>,
    #[serde(default)]
    pub relay: Option<RelayConfig>,
    #[serde(default)]
    pub stuns: Vec<IceUri>,
    #[serde(default)]
    pub turns: Vec<IceUri>,
}

impl NetworkMap {
    /// Look up a peer descriptor by key
    pub fn peer(&self, key: &PeerKey) -> Option<&PeerDescriptor> {
        self.peers.iter().find(|p| &p.key == key)
    }
}

/// Compare a set of prefixes against its string rendering, ignoring order
/// and duplicates. Used by the reconciler to decide whether a peer's
/// allowed IPs actually changed.
pub fn compare_allowed_ips(prefixes: &[IpPrefix], strings: &[String]) -> bool {
    let parsed: Option<BTreeSet<IpPrefix>> = strings.iter().map(|s| s.parse().ok()).collect();
    let Some(parsed) = parsed else {
        return false;
    };
    let ours: BTreeSet<IpPrefix> = prefixes.iter().copied().collect();
    ours == parsed
}

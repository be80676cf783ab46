//! Engine configuration

use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{EngineError, EngineResult};

/// Ceiling of the randomized initial connection timeout, in milliseconds.
pub const PEER_CONNECTION_TIMEOUT_MAX_MS: u64 = 45_000;
/// Floor of the randomized initial connection timeout, in milliseconds.
pub const PEER_CONNECTION_TIMEOUT_MIN_MS: u64 = 30_000;
/// Default cap on concurrent initial handshakes.
pub const CONN_INIT_LIMIT: usize = 200;

/// Engine configuration.
///
/// `wg_private_key` must never leave the machine; it is deliberately not
/// serialized.
#[derive(Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Local data-plane port
    pub wg_port: u16,

    /// Tunnel interface name
    pub wg_iface_name: String,

    /// Local overlay address, e.g. "100.64.0.5/16"
    pub wg_addr: String,

    /// Data-plane private key
    #[serde(skip)]
    pub wg_private_key: [u8; 32],

    /// Optional symmetric pre-shared key
    #[serde(skip)]
    pub pre_shared_key: Option<[u8; 32]>,

    /// UDP mux port for ICE host candidates; 0 picks an available port
    #[serde(default)]
    pub udp_mux_port: u16,

    /// UDP mux port for server-reflexive candidates; 0 picks an available port
    #[serde(default)]
    pub udp_mux_srflx_port: u16,

    /// `external[/internal-or-iface]` NAT mappings. Any parse failure voids
    /// the whole list.
    #[serde(default)]
    pub nat_external_ips: Vec<String>,

    /// Interfaces excluded from ICE candidate gathering
    #[serde(default)]
    pub iface_black_list: Vec<String>,

    #[serde(default)]
    pub disable_ipv6_discovery: bool,

    /// Restart the engine on host-network change
    #[serde(default)]
    pub network_monitor: bool,

    #[serde(default)]
    pub rosenpass_enabled: bool,
    #[serde(default)]
    pub rosenpass_permissive: bool,

    #[serde(default)]
    pub server_ssh_allowed: bool,
    #[serde(default)]
    pub block_inbound: bool,

    #[serde(default)]
    pub disable_client_routes: bool,
    #[serde(default)]
    pub disable_server_routes: bool,
    #[serde(default)]
    pub disable_dns: bool,
    #[serde(default)]
    pub disable_firewall: bool,
    #[serde(default)]
    pub block_lan_access: bool,

    /// Default activation policy for the connection manager
    #[serde(default)]
    pub lazy_connection_enabled: bool,

    /// Re-resolution interval for DNS routes
    #[serde(default = "default_dns_route_interval", with = "duration_secs")]
    pub dns_route_interval: Duration,

    /// Concurrent initial handshake ceiling
    #[serde(default = "default_conn_init_limit")]
    pub conn_init_limit: usize,
}

fn default_dns_route_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_conn_init_limit() -> usize {
    CONN_INIT_LIMIT
}

mod duration_secs {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = <u64 as Deserialize>::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            wg_port: 51820,
            wg_iface_name: "pw0".to_string(),
            wg_addr: String::new(),
            wg_private_key: [0u8; 32],
            pre_shared_key: None,
            udp_mux_port: 0,
            udp_mux_srflx_port: 0,
            nat_external_ips: Vec::new(),
            iface_black_list: Vec::new(),
            disable_ipv6_discovery: false,
            network_monitor: false,
            rosenpass_enabled: false,
            rosenpass_permissive: false,
            server_ssh_allowed: false,
            block_inbound: false,
            disable_client_routes: false,
            disable_server_routes: false,
            disable_dns: false,
            disable_firewall: false,
            block_lan_access: false,
            lazy_connection_enabled: false,
            dns_route_interval: default_dns_route_interval(),
            conn_init_limit: CONN_INIT_LIMIT,
        }
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // keys stay out of logs
        f.debug_struct("EngineConfig")
            .field("wg_port", &self.wg_port)
            .field("wg_iface_name", &self.wg_iface_name)
            .field("wg_addr", &self.wg_addr)
            .field("lazy_connection_enabled", &self.lazy_connection_enabled)
            .field("conn_init_limit", &self.conn_init_limit)
            .finish_non_exhaustive()
    }
}

impl EngineConfig {
    /// Reject configurations the engine cannot start with.
    pub fn validate(&self) -> EngineResult<()> {
        if self.wg_iface_name.is_empty() {
            return Err(EngineError::Config("interface name must be set".into()));
        }
        if self.conn_init_limit == 0 {
            return Err(EngineError::Config(
                "connection init limit must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Whether the local SSH server may run at all.
    pub fn ssh_server_permitted(&self) -> bool {
        self.server_ssh_allowed && !self.block_inbound
    }

    /// Parse the `external[/internal-or-iface]` NAT mappings.
    ///
    /// All-or-nothing: a single malformed entry, an entry with more than one
    /// separator, or an internal interface found in the blacklist voids the
    /// entire list.
    pub fn parse_nat_external_mappings(&self) -> Vec<String> {
        let blacklist: HashSet<&str> = self.iface_black_list.iter().map(|s| s.as_str()).collect();
        let mut mapped = Vec::with_capacity(self.nat_external_ips.len());

        for mapping in &self.nat_external_ips {
            let parts: Vec<&str> = mapping.split('/').collect();
            if parts.len() > 2 {
                warn!(mapping, "ignoring invalid external mapping, too many delimiters");
                break;
            }

            let external = parts[0];
            if external.parse::<IpAddr>().is_err() {
                warn!(mapping, external, "invalid external IP, ignoring mapping");
                break;
            }

            let mut entry = external.to_string();
            if parts.len() == 2 {
                let internal = parts[1];
                if internal.parse::<IpAddr>().is_err() {
                    // not an address, treat it as an interface name
                    if blacklist.contains(internal) {
                        warn!(mapping, iface = internal, "internal interface is blacklisted");
                        break;
                    }
                }
                entry.push('/');
                entry.push_str(internal);
            }

            info!(mapping, parsed = %entry, "parsed external IP mapping");
            mapped.push(entry);
        }

        if mapped.len() != self.nat_external_ips.len() {
            warn!("one or more external IP mappings failed to parse, ignoring all mappings");
            return Vec::new();
        }
        mapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_validates() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_admission_limit_rejected() {
        let cfg = EngineConfig {
            conn_init_limit: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn nat_mappings_parse_plain_and_paired() {
        let cfg = EngineConfig {
            nat_external_ips: vec!["203.0.113.1".into(), "203.0.113.2/10.0.0.5".into()],
            ..Default::default()
        };
        let parsed = cfg.parse_nat_external_mappings();
        assert_eq!(parsed, vec!["203.0.113.1", "203.0.113.2/10.0.0.5"]);
    }

    #[test]
    fn nat_mappings_all_or_nothing_on_extra_separator() {
        let cfg = EngineConfig {
            nat_external_ips: vec!["203.0.113.1".into(), "203.0.113.2/eth0/extra".into()],
            ..Default::default()
        };
        assert!(cfg.parse_nat_external_mappings().is_empty());
    }

    #[test]
    fn nat_mappings_all_or_nothing_on_bad_external() {
        let cfg = EngineConfig {
            nat_external_ips: vec!["not-an-ip".into()],
            ..Default::default()
        };
        assert!(cfg.parse_nat_external_mappings().is_empty());
    }

    #[test]
    fn nat_mappings_reject_blacklisted_iface() {
        let cfg = EngineConfig {
            nat_external_ips: vec!["203.0.113.1/eth0".into()],
            iface_black_list: vec!["eth0".into()],
            ..Default::default()
        };
        assert!(cfg.parse_nat_external_mappings().is_empty());
    }

    #[test]
    fn iface_name_mapping_passes_when_not_blacklisted() {
        let cfg = EngineConfig {
            nat_external_ips: vec!["203.0.113.1/eth1".into()],
            iface_black_list: vec!["eth0".into()],
            ..Default::default()
        };
        assert_eq!(cfg.parse_nat_external_mappings(), vec!["203.0.113.1/eth1"]);
    }

    #[test]
    fn ssh_gating() {
        let mut cfg = EngineConfig {
            server_ssh_allowed: true,
            ..Default::default()
        };
        assert!(cfg.ssh_server_permitted());
        cfg.block_inbound = true;
        assert!(!cfg.ssh_server_permitted());
    }
}

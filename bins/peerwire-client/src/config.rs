//! Client configuration

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use peerwire_engine::EngineConfig;
use peerwire_model::PeerKey;

/// Main client configuration, loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub identity: IdentityConfig,
    pub engine: EngineSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Local public key, standard base64
    pub public_key: String,
}

/// Engine options; field names mirror the engine config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_port")]
    pub wg_port: u16,
    #[serde(default = "default_iface")]
    pub wg_iface_name: String,
    #[serde(default)]
    pub wg_addr: String,
    #[serde(default)]
    pub nat_external_ips: Vec<String>,
    #[serde(default)]
    pub iface_black_list: Vec<String>,
    #[serde(default)]
    pub disable_ipv6_discovery: bool,
    #[serde(default)]
    pub network_monitor: bool,
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
    #[serde(default)]
    pub lazy_connection_enabled: bool,
    #[serde(default = "default_dns_route_interval_secs")]
    pub dns_route_interval_secs: u64,
}

fn default_port() -> u16 {
    51820
}

fn default_iface() -> String {
    "pw0".to_string()
}

fn default_dns_route_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    pub fn local_key(&self) -> Result<PeerKey> {
        PeerKey::from_base64(&self.identity.public_key).context("parsing identity.public_key")
    }

    pub fn engine_config(&self) -> EngineConfig {
        let e = &self.engine;
        EngineConfig {
            wg_port: e.wg_port,
            wg_iface_name: e.wg_iface_name.clone(),
            wg_addr: e.wg_addr.clone(),
            nat_external_ips: e.nat_external_ips.clone(),
            iface_black_list: e.iface_black_list.clone(),
            disable_ipv6_discovery: e.disable_ipv6_discovery,
            network_monitor: e.network_monitor,
            server_ssh_allowed: e.server_ssh_allowed,
            block_inbound: e.block_inbound,
            disable_client_routes: e.disable_client_routes,
            disable_server_routes: e.disable_server_routes,
            disable_dns: e.disable_dns,
            disable_firewall: e.disable_firewall,
            block_lan_access: e.block_lan_access,
            lazy_connection_enabled: e.lazy_connection_enabled,
            dns_route_interval: Duration::from_secs(e.dns_route_interval_secs),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses() {
        let raw = r#"
            [identity]
            public_key = "BwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwc="

            [engine]
            wg_addr = "100.64.0.5/16"
            lazy_connection_enabled = true
        "#;
        let config: ClientConfig = toml::from_str(raw).unwrap();
        assert!(config.local_key().is_ok());
        let engine = config.engine_config();
        assert_eq!(engine.wg_port, 51820);
        assert!(engine.lazy_connection_enabled);
        assert_eq!(engine.wg_addr, "100.64.0.5/16");
    }
}

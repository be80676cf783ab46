//! Typed routes
//!
//! Routes arrive in the network map as loosely-typed entries. The engine
//! parses them once, classifies them into server routes (this node is the
//! gateway) and client routes (this node subscribes), and groups client
//! routes that share a network id into high-availability groups.

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};
use crate::key::PeerKey;
use crate::prefix::IpPrefix;

/// Identifier of a high-availability route group. Every client route that
/// shares a `net_id` belongs to the same group; the engine picks one
/// gateway peer of the group as active.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HaGroupId(pub String);

impl HaGroupId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A single route entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    /// Network id shared by all HA members serving the same prefix
    pub net_id: String,
    pub network: IpPrefix,
    /// Gateway peer for this route
    pub peer: PeerKey,
    pub metric: u32,
    #[serde(default)]
    pub masquerade: bool,
    /// Keep the kernel route installed while the gateway is offline
    #[serde(default)]
    pub keep_route: bool,
    /// DNS-routed domains; empty for plain network routes
    #[serde(default)]
    pub domains: Vec<String>,
}

impl Route {
    pub fn ha_group(&self) -> HaGroupId {
        HaGroupId(self.net_id.clone())
    }

    /// Parse the wire form of a route's network field.
    pub fn parse_network(s: &str) -> ModelResult<IpPrefix> {
        s.parse()
            .map_err(|_| ModelError::InvalidRoute(format!("bad network '{}'", s)))
    }
}

/// Routes split by our role, produced by `classify_routes`.
#[derive(Debug, Clone, Default)]
pub struct RouteClassification {
    /// We are the gateway
    pub server: Vec<Route>,
    /// We subscribe to the prefix via some gateway peer
    pub client: Vec<Route>,
}

impl RouteClassification {
    /// Prefixes of all client routes; used to filter ICE candidates that
    /// would loop through the tunnel.
    pub fn client_prefixes(&self) -> Vec<IpPrefix> {
        self.client.iter().map(|r| r.network).collect()
    }
}

/// Split routes into server routes (gateway is `local_key`) and client routes.
pub fn classify_routes(routes: &[Route], local_key: &PeerKey) -> RouteClassification {
    let mut classified = RouteClassification::default();
    for route in routes {
        if &route.peer == local_key {
            classified.server.push(route.clone());
        } else {
            classified.client.push(route.clone());
        }
    }
    classified
}

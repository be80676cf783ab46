//! Connection manager
//!
//! Owns the activation policy for peer sessions. Under the eager policy
//! every session opens on creation; under the lazy policy sessions stay
//! idle until demand appears: an inbound signal, local traffic toward the
//! peer, traffic into a high-availability route group the peer serves, or
//! membership in the exclude list (ingress-forwarding targets are always
//! eager).
//!
//! All methods run under the engine control lock.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, info};

use peerwire_model::{HaGroupId, PeerKey, Route};

use crate::session::SessionHandle;
use crate::store::PeerStore;

pub struct ConnManager {
    store: Arc<PeerStore>,
    lazy: bool,
    exclude: HashSet<PeerKey>,
    ha_groups: HashMap<HaGroupId, Vec<PeerKey>>,
    /// client route prefixes mapped to their HA group
    route_prefixes: Vec<(peerwire_model::IpPrefix, HaGroupId)>,
}

impl ConnManager {
    pub fn new(store: Arc<PeerStore>, lazy: bool) -> Self {
        Self {
            store,
            lazy,
            exclude: HashSet::new(),
            ha_groups: HashMap::new(),
            route_prefixes: Vec::new(),
        }
    }

    pub fn is_lazy(&self) -> bool {
        self.lazy
    }

    /// Apply the feature flag carried in the map. Takes effect immediately:
    /// switching to eager opens idle sessions, switching to lazy quiesces
    /// sessions outside the exclude list.
    pub fn set_policy(&mut self, lazy: bool) {
        if self.lazy == lazy {
            return;
        }
        info!(lazy, "connection policy changed");
        self.lazy = lazy;

        for session in self.store.sessions() {
            if lazy {
                if !self.exclude.contains(&session.key()) {
                    session.deactivate();
                }
            } else {
                session.open();
            }
        }
    }

    /// Session lifecycle entry point: apply the policy to a new session.
    pub fn on_peer_added(&self, session: &SessionHandle) {
        if !self.lazy || self.exclude.contains(&session.key()) {
            session.open();
        } else {
            debug!(peer = %session.key(), "session starts idle under lazy policy");
        }
    }

    /// Wake a session; called by the signal router for any message other
    /// than a go-idle.
    pub fn activate(&self, session: &SessionHandle) {
        session.activate();
    }

    /// Quiesce a session on a remote go-idle request. Excluded peers never
    /// idle.
    pub fn deactivate(&self, session: &SessionHandle) {
        if self.exclude.contains(&session.key()) {
            debug!(peer = %session.key(), "ignoring go-idle for excluded peer");
            return;
        }
        session.deactivate();
    }

    /// Replace the exclude list. Newly excluded peers are opened right away.
    pub fn set_exclude(&mut self, keys: HashSet<PeerKey>) {
        for key in &keys {
            if !self.exclude.contains(key) {
                if let Some(session) = self.store.get(key) {
                    session.open();
                }
            }
        }
        self.exclude = keys;
    }

    /// Announce client HA groups before routes are applied, so traffic-based
    /// activation can resolve group membership.
    pub fn update_ha_groups(&mut self, client_routes: &[Route]) {
        let mut groups: HashMap<HaGroupId, Vec<PeerKey>> = HashMap::new();
        let mut prefixes = Vec::new();
        for route in client_routes {
            let group = route.ha_group();
            groups.entry(group.clone()).or_default().push(route.peer);
            prefixes.push((route.network, group));
        }
        debug!(groups = groups.len(), "updated HA route groups");
        self.ha_groups = groups;
        self.route_prefixes = prefixes;
    }

    /// Local traffic observed toward `ip`: wake the owning peer, or every
    /// member of the HA group whose route covers the address.
    pub fn on_traffic(&self, ip: IpAddr) {
        if !self.lazy {
            return;
        }

        if let Some(session) = self.store.find_by_ip(ip) {
            debug!(peer = %session.key(), %ip, "traffic wake-up");
            session.activate();
            return;
        }

        for (prefix, group) in &self.route_prefixes {
            if prefix.contains(ip) {
                if let Some(members) = self.ha_groups.get(group) {
                    debug!(group = group.as_str(), %ip, "HA group wake-up");
                    for key in members {
                        if let Some(session) = self.store.get(key) {
                            session.activate();
                        }
                    }
                }
                return;
            }
        }
    }
}

//! Loopback collaborators
//!
//! Stand-in implementations that let an operator exercise the engine on a
//! single host without real infrastructure: the control stream replays a
//! network map from a local file, everything else records and no-ops.
//! Production deployments inject real implementations.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use peerwire_engine::{
    ControlStream, DnsOps, EngineError, EngineResult, Meta, RouteOps, SignalStream, StateStore,
    SyncEvent, TunnelInterface, TunnelStats,
};
use peerwire_model::{DnsConfig, IpPrefix, NetworkMap, PeerKey, Route, SignalMessage};

/// Replays one network map from a JSON file, then idles.
pub struct FileControl {
    map: StdMutex<Option<NetworkMap>>,
}

impl FileControl {
    pub fn from_file(path: &PathBuf) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading map file {}", path.display()))?;
        let map: NetworkMap =
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        info!(serial = map.serial, peers = map.peers.len(), "loaded network map");
        Ok(Self {
            map: StdMutex::new(Some(map)),
        })
    }

    pub fn empty() -> Self {
        Self {
            map: StdMutex::new(None),
        }
    }
}

#[async_trait]
impl ControlStream for FileControl {
    async fn send_meta(&self, meta: Meta) -> EngineResult<()> {
        debug!(version = %meta.agent_version, "meta recorded by loopback control");
        Ok(())
    }

    async fn next(&self) -> EngineResult<Option<SyncEvent>> {
        let map = self.map.lock().expect("map lock poisoned").take();
        match map {
            Some(map) => Ok(Some(SyncEvent {
                infra: None,
                checks: None,
                map: Some(map),
            })),
            // long-poll forever; ctrl-c ends the process
            None => {
                std::future::pending::<()>().await;
                Ok(None)
            }
        }
    }

    fn is_healthy(&self) -> bool {
        true
    }
}

/// No remote peers answer on a loopback host; the stream stays silent.
pub struct SilentSignal;

#[async_trait]
impl SignalStream for SilentSignal {
    async fn send(&self, msg: SignalMessage) -> EngineResult<()> {
        debug!(to = %msg.to, kind = msg.body.kind(), "outbound signal dropped by loopback");
        Ok(())
    }

    async fn next(&self) -> EngineResult<Option<SignalMessage>> {
        std::future::pending::<()>().await;
        Ok(None)
    }

    fn is_healthy(&self) -> bool {
        true
    }
}

/// In-memory tunnel table; logs mutations instead of touching a device.
#[derive(Default)]
pub struct LogTunnel {
    address: StdMutex<Option<String>>,
    peers: StdMutex<HashMap<PeerKey, Vec<IpPrefix>>>,
    up: AtomicBool,
}

#[async_trait]
impl TunnelInterface for LogTunnel {
    async fn up(&self) -> EngineResult<()> {
        info!("loopback tunnel up");
        self.up.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn address(&self) -> EngineResult<String> {
        self.address
            .lock()
            .expect("address lock poisoned")
            .clone()
            .ok_or(EngineError::TunnelNotInitialized)
    }

    async fn update_address(&self, addr: &str) -> EngineResult<()> {
        info!(addr, "loopback tunnel address set");
        *self.address.lock().expect("address lock poisoned") = Some(addr.to_string());
        Ok(())
    }

    async fn add_peer(
        &self,
        key: PeerKey,
        allowed_ips: Vec<IpPrefix>,
        _pre_shared_key: Option<[u8; 32]>,
    ) -> EngineResult<()> {
        info!(peer = %key, ips = allowed_ips.len(), "tunnel peer added");
        self.peers
            .lock()
            .expect("peers lock poisoned")
            .insert(key, allowed_ips);
        Ok(())
    }

    async fn update_peer_endpoint(&self, key: PeerKey, endpoint: String) -> EngineResult<()> {
        info!(peer = %key, endpoint, "tunnel peer endpoint set");
        Ok(())
    }

    async fn remove_peer(&self, key: PeerKey) -> EngineResult<()> {
        info!(peer = %key, "tunnel peer removed");
        self.peers.lock().expect("peers lock poisoned").remove(&key);
        Ok(())
    }

    async fn peer_allowed_ips(&self, key: PeerKey) -> Option<Vec<IpPrefix>> {
        self.peers
            .lock()
            .expect("peers lock poisoned")
            .get(&key)
            .cloned()
    }

    async fn stats(&self) -> EngineResult<HashMap<PeerKey, TunnelStats>> {
        Ok(self
            .peers
            .lock()
            .expect("peers lock poisoned")
            .keys()
            .map(|k| (*k, TunnelStats::default()))
            .collect())
    }

    async fn close(&self) -> EngineResult<()> {
        info!("loopback tunnel closed");
        self.up.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct LogRoutes;

#[async_trait]
impl RouteOps for LogRoutes {
    async fn init(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn update_routes(
        &self,
        serial: u64,
        server_routes: Vec<Route>,
        client_routes: Vec<Route>,
        _dns_route_flag: bool,
    ) -> EngineResult<()> {
        info!(
            serial,
            server = server_routes.len(),
            client = client_routes.len(),
            "routes updated"
        );
        Ok(())
    }

    async fn stop(&self) -> EngineResult<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct LogDns;

#[async_trait]
impl DnsOps for LogDns {
    async fn init(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn update(&self, serial: u64, config: DnsConfig) -> EngineResult<()> {
        info!(
            serial,
            zones = config.custom_zones.len(),
            "dns configuration updated"
        );
        Ok(())
    }

    async fn probe_availability(&self) {}

    async fn stop(&self) -> EngineResult<()> {
        Ok(())
    }
}

/// Keeps state in memory; persisting is a no-op on a loopback host.
#[derive(Default)]
pub struct MemoryState {
    values: StdMutex<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl StateStore for MemoryState {
    async fn put(&self, key: &str, value: Vec<u8>) -> EngineResult<()> {
        self.values
            .lock()
            .expect("state lock poisoned")
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.values
            .lock()
            .expect("state lock poisoned")
            .get(key)
            .cloned()
    }

    async fn persist(&self) -> EngineResult<()> {
        Ok(())
    }
}

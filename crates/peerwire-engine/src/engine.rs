//! Engine supervisor
//!
//! Owns the control lock, the subordinate managers, and the long-running
//! reader tasks. Control events (map updates, config changes, lifecycle
//! transitions) are serialized through one mutex; per-peer work runs on
//! session tasks that never touch it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use peerwire_model::{IceUri, PeerKey};

use crate::admission::AdmissionSemaphore;
use crate::collab::{
    ControlStream, DnsForwarderOps, DnsOps, FirewallOps, FlowOps, IngressOps, KeyAgreement, Meta,
    NetworkWatcher, RelayOps, RouteOps, SignalStream, SshAuthority, StateStore, TunnelInterface,
};
use crate::config::EngineConfig;
use crate::conn_mgr::ConnManager;
use crate::error::EngineResult;
use crate::negotiator::TransportNegotiator;
use crate::router;
use crate::session::SessionState;
use crate::snapshot::{ClientPrefixes, IceServers, Snapshot};
use crate::status::{LocalRecord, StatusLedger};
use crate::store::PeerStore;

/// Engine version advertised in offers and control-plane meta.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Drain pause between dropping peer sessions and destroying the tunnel
/// interface; asynchronous tunnel-peer removals settle in this window.
pub(crate) const SHUTDOWN_DRAIN: Duration = Duration::from_millis(500);

/// Why the engine came down. The outer controller matches on this to decide
/// between exiting and rebuilding a fresh engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    GracefulStop,
    ResetByControl,
    ResetBySignal,
    ResetByNetworkChange,
}

/// One implementation per concern, chosen at bootstrap.
pub struct Collaborators {
    pub tunnel: Arc<dyn TunnelInterface>,
    pub firewall: Option<Arc<dyn FirewallOps>>,
    pub routes: Arc<dyn RouteOps>,
    pub dns: Arc<dyn DnsOps>,
    pub dns_forwarder: Option<Arc<dyn DnsForwarderOps>>,
    pub ingress: Option<Arc<dyn IngressOps>>,
    pub ssh: Option<Arc<dyn SshAuthority>>,
    pub key_agreement: Option<Arc<dyn KeyAgreement>>,
    pub relay: Option<Arc<dyn RelayOps>>,
    pub flow: Option<Arc<dyn FlowOps>>,
    pub control: Arc<dyn ControlStream>,
    pub signal: Arc<dyn SignalStream>,
    pub network_watcher: Option<Arc<dyn NetworkWatcher>>,
    pub state_store: Arc<dyn StateStore>,
    pub negotiator: Arc<dyn TransportNegotiator>,
}

/// State guarded by the control lock.
pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) local_key: PeerKey,
    pub(crate) collab: Collaborators,
    pub(crate) store: Arc<PeerStore>,
    pub(crate) conn_mgr: ConnManager,
    pub(crate) status: Arc<StatusLedger>,
    pub(crate) admission: Arc<AdmissionSemaphore>,
    pub(crate) ice_servers: Arc<Snapshot<IceServers>>,
    pub(crate) relay_addr: Arc<Snapshot<Option<String>>>,
    pub(crate) client_routes: Arc<Snapshot<ClientPrefixes>>,
    pub(crate) stuns: Vec<IceUri>,
    pub(crate) turns: Vec<IceUri>,
    pub(crate) last_applied: u64,
    pub(crate) checks: Vec<String>,
    pub(crate) ssh_enabled: bool,
    pub(crate) running: bool,
    /// Bumped on every start; stale reader tasks from a previous run detect
    /// the mismatch and exit instead of double-consuming the streams.
    pub(crate) epoch: u64,
}

impl EngineInner {
    pub(crate) fn meta(&self) -> Meta {
        Meta {
            agent_version: AGENT_VERSION.to_string(),
            hostname: String::new(),
            os: std::env::consts::OS.to_string(),
            flags: vec![
                ("rosenpass".into(), self.config.rosenpass_enabled),
                ("rosenpass_permissive".into(), self.config.rosenpass_permissive),
                ("server_ssh".into(), self.config.server_ssh_allowed),
                ("disable_client_routes".into(), self.config.disable_client_routes),
                ("disable_server_routes".into(), self.config.disable_server_routes),
                ("disable_dns".into(), self.config.disable_dns),
                ("disable_firewall".into(), self.config.disable_firewall),
                ("block_lan_access".into(), self.config.block_lan_access),
                ("block_inbound".into(), self.config.block_inbound),
                ("lazy_connection".into(), self.config.lazy_connection_enabled),
            ],
        }
    }
}

/// The supervisor. Cheap to clone handles out of; the heavy state lives
/// behind the control lock.
pub struct Engine {
    pub(crate) inner: Arc<Mutex<EngineInner>>,
    pub(crate) status: Arc<StatusLedger>,
    shutdown: Arc<Notify>,
    stopping: Arc<AtomicBool>,
    reason_tx: mpsc::UnboundedSender<ShutdownReason>,
}

impl Engine {
    /// Build an engine around a collaborator set. Returns the engine and
    /// the channel on which shutdown reasons are announced.
    pub fn new(
        config: EngineConfig,
        local_key: PeerKey,
        collab: Collaborators,
    ) -> EngineResult<(Self, mpsc::UnboundedReceiver<ShutdownReason>)> {
        config.validate()?;

        let store = Arc::new(PeerStore::new());
        let status = Arc::new(StatusLedger::new());
        let conn_mgr = ConnManager::new(store.clone(), config.lazy_connection_enabled);
        let admission = Arc::new(AdmissionSemaphore::new(config.conn_init_limit));

        let inner = EngineInner {
            local_key,
            store,
            conn_mgr,
            status: status.clone(),
            admission,
            ice_servers: Arc::new(Snapshot::new(IceServers::default())),
            relay_addr: Arc::new(Snapshot::new(None)),
            client_routes: Arc::new(Snapshot::new(Vec::new())),
            stuns: Vec::new(),
            turns: Vec::new(),
            last_applied: 0,
            checks: Vec::new(),
            ssh_enabled: false,
            running: false,
            epoch: 0,
            config,
            collab,
        };

        let (reason_tx, reason_rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                inner: Arc::new(Mutex::new(inner)),
                status,
                shutdown: Arc::new(Notify::new()),
                stopping: Arc::new(AtomicBool::new(false)),
                reason_tx,
            },
            reason_rx,
        ))
    }

    /// Start the engine: bring up the managers in fixed order and attach
    /// the stream readers. Peer connections are established later, once the
    /// control plane delivers a network map.
    pub async fn start(&self) -> EngineResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.running {
            debug!("engine already running");
            return Ok(());
        }
        info!("starting peering engine");
        self.stopping.store(false, Ordering::SeqCst);

        inner.collab.tunnel.up().await?;
        if !inner.config.wg_addr.is_empty() {
            let addr = inner.config.wg_addr.clone();
            inner.collab.tunnel.update_address(&addr).await?;
        }

        if inner.collab.firewall.is_none() || inner.config.disable_firewall {
            info!("firewall is disabled");
        }

        if inner.config.rosenpass_enabled {
            match &inner.collab.key_agreement {
                Some(_) if inner.config.rosenpass_permissive => {
                    info!("key agreement enabled in permissive mode")
                }
                Some(_) => info!("key agreement enabled in strict mode"),
                None => warn!("key agreement enabled in config but no manager was provided"),
            }
        }

        // DNS failure is fatal; a host without working DNS interception is
        // worse than a failed start
        inner.collab.dns.init().await?;

        if let Err(e) = inner.collab.routes.init().await {
            error!("failed to initialize route manager: {}", e);
        }

        inner.status.set_local(LocalRecord {
            ip: inner.config.wg_addr.clone(),
            fqdn: String::new(),
            public_key: inner.local_key.to_base64(),
        });

        inner.running = true;
        inner.epoch += 1;
        let epoch = inner.epoch;
        let watcher = if inner.config.network_monitor {
            inner.collab.network_watcher.clone()
        } else {
            None
        };
        drop(inner);

        self.spawn_watchdog(epoch);
        self.spawn_signal_reader(epoch);
        self.spawn_control_reader(epoch);
        // network monitor starts last to avoid mid-start disruptions
        self.spawn_network_monitor(watcher);

        info!("peering engine started");
        Ok(())
    }

    /// Stop the engine. Idempotent; a second call is a no-op.
    pub async fn stop(&self) -> EngineResult<()> {
        if self.stopping.swap(true, Ordering::SeqCst) {
            debug!("engine already stopping");
            return Ok(());
        }
        self.stop_with_reason(Some(ShutdownReason::GracefulStop)).await
    }

    async fn stop_with_reason(&self, reason: Option<ShutdownReason>) -> EngineResult<()> {
        let mut inner = self.inner.lock().await;
        if !inner.running {
            debug!("engine not running, nothing to stop");
            return Ok(());
        }
        info!(?reason, "stopping peering engine");
        inner.running = false;

        self.shutdown.notify_waiters();

        if let Err(e) = inner.collab.dns.stop().await {
            error!("failed to stop dns server: {}", e);
        }
        if let Some(ingress) = &inner.collab.ingress {
            if let Err(e) = ingress.close().await {
                warn!("failed to cleanup forwarding rules: {}", e);
            }
        }
        if let Err(e) = inner.collab.routes.stop().await {
            error!("failed to stop route manager: {}", e);
        }
        if let Some(fwd) = &inner.collab.dns_forwarder {
            if let Err(e) = fwd.stop().await {
                error!("failed to stop dns forwarder: {}", e);
            }
        }

        inner.status.replace_offline_peers(Vec::new());
        inner.status.update_relay_states(Vec::new());

        let handles = inner.remove_all_peers().await;

        // let asynchronous tunnel-peer removals settle before the interface
        // goes away
        tokio::time::sleep(SHUTDOWN_DRAIN).await;
        for handle in handles {
            handle.abort();
        }

        if let Err(e) = inner.collab.tunnel.close().await {
            error!("failed to close tunnel interface: {}", e);
        }
        if let Some(ssh) = &inner.collab.ssh {
            if let Err(e) = ssh.stop().await {
                warn!("failed to stop ssh authority: {}", e);
            }
        }
        if let Some(firewall) = &inner.collab.firewall {
            if let Err(e) = firewall.close().await {
                warn!("failed to reset firewall: {}", e);
            }
        }
        if let Some(ka) = &inner.collab.key_agreement {
            let _ = ka.close().await;
        }
        if let Some(flow) = &inner.collab.flow {
            if let Err(e) = flow.close().await {
                warn!("failed to close flow manager: {}", e);
            }
        }

        if let Err(e) = inner.collab.state_store.persist().await {
            error!("failed to persist state: {}", e);
        }

        info!("peering engine stopped");
        if let Some(reason) = reason {
            let _ = self.reason_tx.send(reason);
        }
        Ok(())
    }

    /// Tear the engine down and bring it back with a clean slate; used by
    /// the outer controller after a reset-connection condition.
    pub async fn restart_after_reset(&self) -> EngineResult<()> {
        info!("restarting engine after reset");
        self.stopping.store(true, Ordering::SeqCst);
        self.stop_with_reason(None).await?;
        {
            let mut inner = self.inner.lock().await;
            inner.last_applied = 0;
            inner.checks.clear();
        }
        self.start().await
    }

    /// Local traffic observed toward `ip`; wakes lazy sessions.
    pub async fn notify_traffic(&self, ip: std::net::IpAddr) {
        let inner = self.inner.lock().await;
        inner.conn_mgr.on_traffic(ip);
    }

    /// Current serial of the last applied network map.
    pub async fn network_serial(&self) -> u64 {
        self.inner.lock().await.last_applied
    }

    pub fn status(&self) -> Arc<StatusLedger> {
        self.status.clone()
    }

    fn spawn_signal_reader(&self, epoch: u64) {
        let inner = self.inner.clone();
        let shutdown = self.shutdown.clone();
        let reason_tx = self.reason_tx.clone();

        tokio::spawn(async move {
            debug!("signal reader started");
            let signal = inner.lock().await.collab.signal.clone();
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    next = signal.next() => match next {
                        Ok(Some(msg)) => {
                            let guard = inner.lock().await;
                            if !guard.running || guard.epoch != epoch {
                                break;
                            }
                            let routes = guard.client_routes.load();
                            router::dispatch_logged(msg, &guard.store, &guard.conn_mgr, routes);
                        }
                        Ok(None) => {
                            debug!("signal stream ended");
                            break;
                        }
                        Err(e) => {
                            error!("fatal signal stream error: {}", e);
                            let _ = reason_tx.send(ShutdownReason::ResetBySignal);
                            break;
                        }
                    }
                }
            }
            debug!("signal reader stopped");
        });
    }

    fn spawn_control_reader(&self, epoch: u64) {
        let inner = self.inner.clone();
        let shutdown = self.shutdown.clone();
        let reason_tx = self.reason_tx.clone();

        tokio::spawn(async move {
            debug!("control reader started");
            let (control, meta) = {
                let guard = inner.lock().await;
                (guard.collab.control.clone(), guard.meta())
            };
            if let Err(e) = control.send_meta(meta).await {
                error!("failed to send meta on attach: {}", e);
            }

            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    next = control.next() => match next {
                        Ok(Some(event)) => {
                            let mut guard = inner.lock().await;
                            if !guard.running || guard.epoch != epoch {
                                break;
                            }
                            if let Err(e) = guard.apply_sync(event).await {
                                error!("failed to apply control update: {}", e);
                            }
                        }
                        Ok(None) => {
                            debug!("control stream ended");
                            break;
                        }
                        Err(e) => {
                            error!("fatal control stream error: {}", e);
                            let _ = reason_tx.send(ShutdownReason::ResetByControl);
                            break;
                        }
                    }
                }
            }
            debug!("control reader stopped");
        });
    }

    /// Nudges failed sessions when the signal stream recovers; sessions
    /// otherwise self-heal on their own backoff schedule.
    fn spawn_watchdog(&self, epoch: u64) {
        let inner = self.inner.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            debug!("negotiation watchdog started");
            let signal = inner.lock().await.collab.signal.clone();
            let mut was_healthy = signal.is_healthy();
            let mut ticker = interval(Duration::from_secs(10));

            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = ticker.tick() => {
                        let healthy = signal.is_healthy();
                        if healthy && !was_healthy {
                            let guard = inner.lock().await;
                            if !guard.running || guard.epoch != epoch {
                                break;
                            }
                            info!("signal stream recovered, nudging failed sessions");
                            for session in guard.store.sessions() {
                                if matches!(
                                    session.state(),
                                    SessionState::Failed | SessionState::Reconnecting
                                ) {
                                    session.open();
                                }
                            }
                        }
                        was_healthy = healthy;
                    }
                }
            }
            debug!("negotiation watchdog stopped");
        });
    }

    fn spawn_network_monitor(&self, watcher: Option<Arc<dyn NetworkWatcher>>) {
        let Some(watcher) = watcher else {
            return;
        };

        let shutdown = self.shutdown.clone();
        let reason_tx = self.reason_tx.clone();
        tokio::spawn(async move {
            debug!("network monitor started");
            tokio::select! {
                _ = shutdown.notified() => {}
                _ = watcher.wait_for_change() => {
                    info!("host network changed, requesting engine reset");
                    let _ = reason_tx.send(ShutdownReason::ResetByNetworkChange);
                }
            }
            debug!("network monitor stopped");
        });
    }
}

impl EngineInner {
    /// Close and strip every peer session. Returns the handles so the
    /// caller can abort stragglers after the drain.
    pub(crate) async fn remove_all_peers(&mut self) -> Vec<Arc<crate::session::SessionHandle>> {
        debug!("removing all peer sessions");
        let mut handles = Vec::new();
        for key in self.store.keys() {
            if let Some(handle) = self.remove_peer(&key).await {
                handles.push(handle);
            }
        }
        handles
    }

    /// Remove one peer: session, tunnel entry, ledger record, SSH key.
    /// Atomic from the caller's perspective because it runs under the
    /// control lock.
    pub(crate) async fn remove_peer(
        &mut self,
        key: &PeerKey,
    ) -> Option<Arc<crate::session::SessionHandle>> {
        debug!(peer = %key, "removing peer");

        if let Some(ssh) = &self.collab.ssh {
            ssh.remove_authorized_key(*key).await;
        }

        let handle = self.store.remove(key)?;
        handle.close(true);

        if let Err(e) = self.collab.tunnel.remove_peer(*key).await {
            warn!(peer = %key, "failed to remove tunnel peer: {}", e);
        }
        self.status.remove_peer(key);
        Some(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;

    fn key(b: u8) -> PeerKey {
        PeerKey::from_bytes([b; 32])
    }

    pub(crate) fn test_collaborators() -> (
        Collaborators,
        Arc<MockControl>,
        Arc<MockSignaler>,
        Arc<MockTunnel>,
    ) {
        let control = MockControl::new();
        let signaler = MockSignaler::new();
        let tunnel = MockTunnel::new();
        let collab = Collaborators {
            tunnel: tunnel.clone(),
            firewall: Some(Arc::new(MockFirewall::default())),
            routes: Arc::new(MockRoutes::default()),
            dns: Arc::new(MockDns::default()),
            dns_forwarder: None,
            ingress: Some(Arc::new(MockIngress::default())),
            ssh: Some(Arc::new(MockSsh::default())),
            key_agreement: None,
            relay: Some(Arc::new(MockRelay::default())),
            flow: None,
            control: control.clone(),
            signal: signaler.clone(),
            network_watcher: None,
            state_store: Arc::new(MemoryStateStore::default()),
            negotiator: Arc::new(InstantNegotiator::direct()),
        };
        (collab, control, signaler, tunnel)
    }

    #[tokio::test]
    async fn start_then_stop_announces_graceful_reason() {
        let (collab, _control, _signaler, _tunnel) = test_collaborators();
        let (engine, mut reasons) =
            Engine::new(EngineConfig::default(), key(9), collab).unwrap();

        engine.start().await.unwrap();
        engine.stop().await.unwrap();
        assert_eq!(reasons.recv().await, Some(ShutdownReason::GracefulStop));
    }

    #[tokio::test]
    async fn double_stop_is_noop() {
        let (collab, _control, _signaler, _tunnel) = test_collaborators();
        let (engine, mut reasons) =
            Engine::new(EngineConfig::default(), key(9), collab).unwrap();

        engine.start().await.unwrap();
        engine.stop().await.unwrap();
        engine.stop().await.unwrap();
        assert_eq!(reasons.recv().await, Some(ShutdownReason::GracefulStop));
        // only one reason was announced
        assert!(reasons.try_recv().is_err());
    }

    #[tokio::test]
    async fn dns_init_failure_is_fatal() {
        let (mut collab, _control, _signaler, _tunnel) = test_collaborators();
        let dns = Arc::new(MockDns::default());
        dns.fail_init.store(true, Ordering::SeqCst);
        collab.dns = dns;

        let (engine, _reasons) = Engine::new(EngineConfig::default(), key(9), collab).unwrap();
        assert!(engine.start().await.is_err());
    }

    #[tokio::test]
    async fn fatal_signal_error_requests_reset() {
        let (collab, _control, signaler, _tunnel) = test_collaborators();
        let (engine, mut reasons) =
            Engine::new(EngineConfig::default(), key(9), collab).unwrap();

        engine.start().await.unwrap();
        signaler.fail_stream();
        let reason = tokio::time::timeout(Duration::from_secs(2), reasons.recv())
            .await
            .unwrap();
        assert_eq!(reason, Some(ShutdownReason::ResetBySignal));
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn fatal_control_error_requests_reset() {
        let (collab, control, _signaler, _tunnel) = test_collaborators();
        let (engine, mut reasons) =
            Engine::new(EngineConfig::default(), key(9), collab).unwrap();

        engine.start().await.unwrap();
        control.fail_stream();
        let reason = tokio::time::timeout(Duration::from_secs(2), reasons.recv())
            .await
            .unwrap();
        assert_eq!(reason, Some(ShutdownReason::ResetByControl));
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn lazy_peer_wakes_on_inbound_offer_via_stream() {
        let (collab, control, signaler, _tunnel) = test_collaborators();
        let config = EngineConfig {
            lazy_connection_enabled: true,
            ..Default::default()
        };
        // local key 1 loses every tie-break, so inbound offers convert us
        let (engine, _reasons) = Engine::new(config, key(1), collab).unwrap();
        engine.start().await.unwrap();

        let map = peerwire_model::NetworkMap {
            serial: 1,
            peers: vec![
                peer_descriptor(2, "10.0.0.2/32"),
                peer_descriptor(3, "10.0.0.3/32"),
            ],
            ..Default::default()
        };
        control.push_map(map);
        tokio::time::sleep(Duration::from_millis(150)).await;

        {
            let inner = engine.inner.lock().await;
            for session in inner.store.sessions() {
                assert_eq!(session.state(), SessionState::Idle);
            }
        }

        // inbound offer for peer 3 wakes only that session
        signaler.push_inbound(peerwire_model::SignalMessage {
            from: key(3),
            to: key(1),
            body: peerwire_model::SignalBody::Offer(peerwire_model::OfferAnswer {
                credentials: peerwire_model::IceCredentials {
                    ufrag: "u".into(),
                    pwd: "p".into(),
                },
                listen_port: 51820,
                agent_version: "0.3.0".into(),
                post_quantum_key: None,
                post_quantum_addr: None,
                relay_addr: None,
            }),
        });

        let session = {
            let inner = engine.inner.lock().await;
            inner.store.get(&key(3)).unwrap()
        };
        let mut state = session.subscribe();
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if *state.borrow() == SessionState::Connected {
                    break;
                }
                state.changed().await.unwrap();
            }
        })
        .await
        .expect("session 3 should connect after inbound offer");

        let inner = engine.inner.lock().await;
        assert_eq!(inner.store.get(&key(2)).unwrap().state(), SessionState::Idle);
        drop(inner);
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn admission_cap_bounds_concurrent_first_dials() {
        let (mut collab, control, _signaler, _tunnel) = test_collaborators();
        collab.negotiator = Arc::new(BlockingNegotiator::new());
        let config = EngineConfig {
            conn_init_limit: 2,
            ..Default::default()
        };
        let (engine, _reasons) = Engine::new(config, key(200), collab).unwrap();
        engine.start().await.unwrap();

        let map = peerwire_model::NetworkMap {
            serial: 1,
            peers: (1..=5u8)
                .map(|b| peer_descriptor(b, &format!("10.0.0.{}/32", b + 1)))
                .collect(),
            ..Default::default()
        };
        control.push_map(map);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let negotiating = |sessions: &[Arc<crate::session::SessionHandle>]| {
            sessions
                .iter()
                .filter(|s| s.state().is_negotiating())
                .count()
        };

        let victim = {
            let inner = engine.inner.lock().await;
            let sessions = inner.store.sessions();
            assert_eq!(sessions.len(), 5);
            assert_eq!(negotiating(&sessions), 2);
            assert_eq!(inner.admission.available(), 0);
            sessions
                .iter()
                .find(|s| s.state().is_negotiating())
                .unwrap()
                .key()
        };

        // removing one negotiating peer frees a slot; exactly one queued
        // session advances
        {
            let mut inner = engine.inner.lock().await;
            inner.remove_peer(&victim).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        {
            let inner = engine.inner.lock().await;
            let sessions = inner.store.sessions();
            assert_eq!(sessions.len(), 4);
            assert_eq!(negotiating(&sessions), 2);
        }
        engine.stop().await.unwrap();
    }

    fn peer_descriptor(b: u8, prefix: &str) -> peerwire_model::PeerDescriptor {
        peerwire_model::PeerDescriptor {
            key: key(b),
            allowed_ips: vec![prefix.parse().unwrap()],
            fqdn: format!("peer-{}.test", b),
            agent_version: "0.3.0".into(),
            ssh_public_key: None,
            post_quantum_public_key: None,
        }
    }

    #[tokio::test]
    async fn meta_is_sent_on_attach() {
        let (collab, control, _signaler, _tunnel) = test_collaborators();
        let (engine, _reasons) = Engine::new(EngineConfig::default(), key(9), collab).unwrap();

        engine.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let metas = control.metas();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].agent_version, AGENT_VERSION);
        engine.stop().await.unwrap();
    }
}

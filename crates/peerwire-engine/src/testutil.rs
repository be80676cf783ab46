//! Test doubles for the collaborator seams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};

use peerwire_model::{
    CandidateInfo, DnsConfig, ForwardingRule, IpPrefix, NetworkMap, PeerKey, Route, SignalBody,
    SignalMessage,
};

use crate::admission::AdmissionSemaphore;
use crate::collab::*;
use crate::error::{EngineError, EngineResult};
use crate::negotiator::{NegotiationParams, TransportKind, TransportLink, TransportNegotiator};
use crate::session::{SessionConfig, SessionDeps};
use crate::snapshot::{IceServers, Snapshot};
use crate::status::StatusLedger;

// ---------------------------------------------------------------- signaling

pub struct MockSignaler {
    sent: StdMutex<Vec<SignalMessage>>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<SignalMessage>>,
    inbound_tx: mpsc::UnboundedSender<SignalMessage>,
    healthy: AtomicBool,
    fail_stream: AtomicBool,
    block_sends: bool,
}

impl MockSignaler {
    pub fn new() -> Arc<Self> {
        Self::build(false)
    }

    /// A signaler whose `send` never completes; keeps sessions in `Dialing`.
    pub fn blocking() -> Arc<Self> {
        Self::build(true)
    }

    fn build(block_sends: bool) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            sent: StdMutex::new(Vec::new()),
            inbound_rx: Mutex::new(inbound_rx),
            inbound_tx,
            healthy: AtomicBool::new(true),
            fail_stream: AtomicBool::new(false),
            block_sends,
        })
    }

    pub fn push_inbound(&self, msg: SignalMessage) {
        let _ = self.inbound_tx.send(msg);
    }

    pub fn fail_stream(&self) {
        self.fail_stream.store(true, Ordering::SeqCst);
        // wake the reader
        let _ = self.inbound_tx.send(SignalMessage {
            from: PeerKey::from_bytes([0u8; 32]),
            to: PeerKey::from_bytes([0u8; 32]),
            body: SignalBody::Mode,
        });
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SignalMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_offers(&self) -> Vec<SignalMessage> {
        self.sent()
            .into_iter()
            .filter(|m| matches!(m.body, SignalBody::Offer(_)))
            .collect()
    }

    pub fn sent_answers(&self) -> Vec<SignalMessage> {
        self.sent()
            .into_iter()
            .filter(|m| matches!(m.body, SignalBody::Answer(_)))
            .collect()
    }
}

#[async_trait]
impl SignalStream for MockSignaler {
    async fn send(&self, msg: SignalMessage) -> EngineResult<()> {
        if self.block_sends {
            std::future::pending::<()>().await;
        }
        self.sent.lock().unwrap().push(msg);
        Ok(())
    }

    async fn next(&self) -> EngineResult<Option<SignalMessage>> {
        let msg = self.inbound_rx.lock().await.recv().await;
        if self.fail_stream.load(Ordering::SeqCst) {
            return Err(EngineError::Signal("stream broken".into()));
        }
        Ok(msg)
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

// ------------------------------------------------------------------ control

pub struct MockControl {
    rx: Mutex<mpsc::UnboundedReceiver<SyncEvent>>,
    tx: mpsc::UnboundedSender<SyncEvent>,
    metas: StdMutex<Vec<Meta>>,
    healthy: AtomicBool,
    fail_stream: AtomicBool,
}

impl MockControl {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            rx: Mutex::new(rx),
            tx,
            metas: StdMutex::new(Vec::new()),
            healthy: AtomicBool::new(true),
            fail_stream: AtomicBool::new(false),
        })
    }

    pub fn push_map(&self, map: NetworkMap) {
        let _ = self.tx.send(SyncEvent {
            infra: None,
            checks: None,
            map: Some(map),
        });
    }

    pub fn push_event(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }

    pub fn fail_stream(&self) {
        self.fail_stream.store(true, Ordering::SeqCst);
        let _ = self.tx.send(SyncEvent::default());
    }

    pub fn metas(&self) -> Vec<Meta> {
        self.metas.lock().unwrap().clone()
    }
}

#[async_trait]
impl ControlStream for MockControl {
    async fn send_meta(&self, meta: Meta) -> EngineResult<()> {
        self.metas.lock().unwrap().push(meta);
        Ok(())
    }

    async fn next(&self) -> EngineResult<Option<SyncEvent>> {
        let event = self.rx.lock().await.recv().await;
        if self.fail_stream.load(Ordering::SeqCst) {
            return Err(EngineError::Control("stream broken".into()));
        }
        Ok(event)
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

// ------------------------------------------------------------------- tunnel

#[derive(Default)]
struct TunnelPeer {
    allowed_ips: Vec<IpPrefix>,
    endpoint: Option<String>,
}

pub struct MockTunnel {
    address: StdMutex<Option<String>>,
    peers: StdMutex<HashMap<PeerKey, TunnelPeer>>,
    up: AtomicBool,
}

impl MockTunnel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            address: StdMutex::new(None),
            peers: StdMutex::new(HashMap::new()),
            up: AtomicBool::new(false),
        })
    }

    pub fn peer_keys(&self) -> Vec<PeerKey> {
        self.peers.lock().unwrap().keys().copied().collect()
    }

    pub fn peer_endpoint(&self, key: &PeerKey) -> Option<String> {
        self.peers.lock().unwrap().get(key)?.endpoint.clone()
    }
}

/// Alias kept for readability in tests that only need a sink.
pub type NullTunnel = MockTunnel;

#[async_trait]
impl TunnelInterface for MockTunnel {
    async fn up(&self) -> EngineResult<()> {
        self.up.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn address(&self) -> EngineResult<String> {
        self.address
            .lock()
            .unwrap()
            .clone()
            .ok_or(EngineError::TunnelNotInitialized)
    }

    async fn update_address(&self, addr: &str) -> EngineResult<()> {
        *self.address.lock().unwrap() = Some(addr.to_string());
        Ok(())
    }

    async fn add_peer(
        &self,
        key: PeerKey,
        allowed_ips: Vec<IpPrefix>,
        _pre_shared_key: Option<[u8; 32]>,
    ) -> EngineResult<()> {
        self.peers.lock().unwrap().insert(
            key,
            TunnelPeer {
                allowed_ips,
                endpoint: None,
            },
        );
        Ok(())
    }

    async fn update_peer_endpoint(&self, key: PeerKey, endpoint: String) -> EngineResult<()> {
        if let Some(peer) = self.peers.lock().unwrap().get_mut(&key) {
            peer.endpoint = Some(endpoint);
        }
        Ok(())
    }

    async fn remove_peer(&self, key: PeerKey) -> EngineResult<()> {
        self.peers.lock().unwrap().remove(&key);
        Ok(())
    }

    async fn peer_allowed_ips(&self, key: PeerKey) -> Option<Vec<IpPrefix>> {
        self.peers
            .lock()
            .unwrap()
            .get(&key)
            .map(|p| p.allowed_ips.clone())
    }

    async fn stats(&self) -> EngineResult<HashMap<PeerKey, TunnelStats>> {
        Ok(self
            .peers
            .lock()
            .unwrap()
            .keys()
            .map(|k| (*k, TunnelStats::default()))
            .collect())
    }

    async fn close(&self) -> EngineResult<()> {
        self.up.store(false, Ordering::SeqCst);
        Ok(())
    }
}

// -------------------------------------------------------------- negotiators

/// Completes immediately with a configurable outcome.
pub struct InstantNegotiator {
    kind: Option<TransportKind>,
    links: StdMutex<Vec<oneshot::Sender<()>>>,
}

impl InstantNegotiator {
    pub fn direct() -> Self {
        Self {
            kind: Some(TransportKind::Direct),
            links: StdMutex::new(Vec::new()),
        }
    }

    pub fn relay() -> Self {
        Self {
            kind: Some(TransportKind::Relay),
            links: StdMutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            kind: None,
            links: StdMutex::new(Vec::new()),
        }
    }

    /// Kill every link handed out so far; sessions observe a disconnect.
    pub fn drop_links(&self) {
        for tx in self.links.lock().unwrap().drain(..) {
            let _ = tx.send(());
        }
    }
}

#[async_trait]
impl TransportNegotiator for InstantNegotiator {
    async fn connect(
        &self,
        params: NegotiationParams,
        _local_candidates: mpsc::UnboundedSender<CandidateInfo>,
        _remote_candidates: mpsc::UnboundedReceiver<CandidateInfo>,
    ) -> EngineResult<TransportLink> {
        match self.kind {
            Some(kind) => {
                let (tx, rx) = oneshot::channel();
                self.links.lock().unwrap().push(tx);
                Ok(TransportLink {
                    kind,
                    endpoint: format!("203.0.113.1:{}", params.remote_listen_port.max(1)),
                    closed: Some(rx),
                })
            }
            None => Err(EngineError::Negotiation("mock failure".into())),
        }
    }
}

/// Never completes; sessions park in `Connecting` until closed.
pub struct BlockingNegotiator;

impl BlockingNegotiator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportNegotiator for BlockingNegotiator {
    async fn connect(
        &self,
        _params: NegotiationParams,
        _local_candidates: mpsc::UnboundedSender<CandidateInfo>,
        _remote_candidates: mpsc::UnboundedReceiver<CandidateInfo>,
    ) -> EngineResult<TransportLink> {
        std::future::pending::<()>().await;
        unreachable!()
    }
}

// ----------------------------------------------------- recording call sinks

#[derive(Default)]
pub struct CallLog {
    calls: StdMutex<Vec<String>>,
}

impl CallLog {
    pub fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}

#[derive(Default)]
pub struct MockFirewall {
    pub log: CallLog,
}

#[async_trait]
impl FirewallOps for MockFirewall {
    async fn apply(&self, map: &NetworkMap) -> EngineResult<()> {
        self.log.record(format!("apply serial={}", map.serial));
        Ok(())
    }

    async fn set_legacy_mode(&self, enabled: bool) -> EngineResult<()> {
        self.log.record(format!("legacy={}", enabled));
        Ok(())
    }

    async fn update_local_ips(&self) -> EngineResult<()> {
        self.log.record("update_local_ips");
        Ok(())
    }

    async fn close(&self) -> EngineResult<()> {
        self.log.record("close");
        Ok(())
    }
}

#[derive(Default)]
pub struct MockRoutes {
    pub log: CallLog,
}

#[async_trait]
impl RouteOps for MockRoutes {
    async fn init(&self) -> EngineResult<()> {
        self.log.record("init");
        Ok(())
    }

    async fn update_routes(
        &self,
        serial: u64,
        server_routes: Vec<Route>,
        client_routes: Vec<Route>,
        _dns_route_flag: bool,
    ) -> EngineResult<()> {
        self.log.record(format!(
            "update serial={} server={} client={}",
            serial,
            server_routes.len(),
            client_routes.len()
        ));
        Ok(())
    }

    async fn stop(&self) -> EngineResult<()> {
        self.log.record("stop");
        Ok(())
    }
}

#[derive(Default)]
pub struct MockDns {
    pub log: CallLog,
    pub fail_init: AtomicBool,
}

#[async_trait]
impl DnsOps for MockDns {
    async fn init(&self) -> EngineResult<()> {
        if self.fail_init.load(Ordering::SeqCst) {
            return Err(EngineError::Dns("mock init failure".into()));
        }
        self.log.record("init");
        Ok(())
    }

    async fn update(&self, serial: u64, _config: DnsConfig) -> EngineResult<()> {
        self.log.record(format!("update serial={}", serial));
        Ok(())
    }

    async fn probe_availability(&self) {
        self.log.record("probe");
    }

    async fn stop(&self) -> EngineResult<()> {
        self.log.record("stop");
        Ok(())
    }
}

#[derive(Default)]
pub struct MockIngress {
    pub log: CallLog,
}

#[async_trait]
impl IngressOps for MockIngress {
    async fn update_rules(&self, rules: Vec<ForwardingRule>) -> EngineResult<Vec<ForwardingRule>> {
        self.log.record(format!("update rules={}", rules.len()));
        Ok(rules)
    }

    async fn close(&self) -> EngineResult<()> {
        self.log.record("close");
        Ok(())
    }
}

#[derive(Default)]
pub struct MockSsh {
    pub keys: StdMutex<HashMap<PeerKey, String>>,
}

#[async_trait]
impl SshAuthority for MockSsh {
    async fn add_authorized_key(&self, peer: PeerKey, key_material: String) -> EngineResult<()> {
        self.keys.lock().unwrap().insert(peer, key_material);
        Ok(())
    }

    async fn remove_authorized_key(&self, peer: PeerKey) {
        self.keys.lock().unwrap().remove(&peer);
    }

    async fn stop(&self) -> EngineResult<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MockKeyAgreement {
    pub log: CallLog,
}

#[async_trait]
impl KeyAgreement for MockKeyAgreement {
    fn public_key(&self) -> Vec<u8> {
        vec![0xAA; 32]
    }

    fn listen_addr(&self) -> String {
        "127.0.0.1:9999".to_string()
    }

    async fn on_connected(
        &self,
        peer: PeerKey,
        _remote_key: Vec<u8>,
        _remote_addr: String,
    ) -> EngineResult<()> {
        self.log.record(format!("connected {}", peer));
        Ok(())
    }

    async fn on_disconnected(&self, peer: PeerKey) {
        self.log.record(format!("disconnected {}", peer));
    }

    async fn close(&self) -> EngineResult<()> {
        self.log.record("close");
        Ok(())
    }
}

#[derive(Default)]
pub struct MockRelay {
    pub log: CallLog,
    pub address: StdMutex<Option<String>>,
}

#[async_trait]
impl RelayOps for MockRelay {
    async fn update_token(&self, payload: &str, _signature: &str) -> EngineResult<()> {
        self.log.record(format!("token {}", payload));
        Ok(())
    }

    async fn update_urls(&self, urls: Vec<String>) {
        self.log.record(format!("urls {}", urls.len()));
        *self.address.lock().unwrap() = urls.first().cloned();
    }

    async fn serve(&self) -> EngineResult<()> {
        self.log.record("serve");
        Ok(())
    }

    fn relay_address(&self) -> Option<String> {
        self.address.lock().unwrap().clone()
    }
}

#[derive(Default)]
pub struct MemoryStateStore {
    values: StdMutex<HashMap<String, Vec<u8>>>,
    pub persist_count: StdMutex<usize>,
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> EngineResult<()> {
        self.values.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.values.lock().unwrap().get(key).cloned()
    }

    async fn persist(&self) -> EngineResult<()> {
        *self.persist_count.lock().unwrap() += 1;
        Ok(())
    }
}

// --------------------------------------------------------------- assembly

/// Session config with a short timeout and one allowed IP (10.0.0.2/32).
pub fn test_session_config(remote: PeerKey, local: PeerKey) -> SessionConfig {
    SessionConfig {
        key: remote,
        local_key: local,
        allowed_ips: vec!["10.0.0.2/32".parse().unwrap()],
        fqdn: "peer.test".into(),
        agent_version: "0.3.0".into(),
        local_agent_version: "0.3.1".into(),
        timeout: Duration::from_secs(2),
        wg_listen_port: 51820,
        nat_external_ips: Vec::new(),
        disable_ipv6: false,
        udp_mux_port: 0,
        udp_mux_srflx_port: 0,
    }
}

/// Minimal dependency set around a given negotiator.
pub fn test_session_deps(
    negotiator: Arc<dyn TransportNegotiator>,
) -> (SessionDeps, Arc<MockSignaler>) {
    let signaler = MockSignaler::new();
    let deps = SessionDeps {
        signaler: signaler.clone(),
        tunnel: MockTunnel::new(),
        negotiator,
        admission: Arc::new(AdmissionSemaphore::new(CONN_TEST_LIMIT)),
        status: Arc::new(StatusLedger::new()),
        ice_servers: Arc::new(Snapshot::new(IceServers::default())),
        relay_addr: Arc::new(Snapshot::new(None)),
        key_agreement: None,
    };
    (deps, signaler)
}

const CONN_TEST_LIMIT: usize = 16;

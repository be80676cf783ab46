//! Peer session state machine
//!
//! One session per remote peer. The session runs on its own task and is
//! driven entirely through its mailbox; the engine, router, and connection
//! manager never block on it and it never touches the engine control lock.
//! Side effects flow through the collaborator handles and the callback set
//! injected at construction.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use peerwire_model::{
    CandidateInfo, IceCredentials, IpPrefix, OfferAnswer, PeerKey, SignalBody, SignalMessage,
};

use crate::admission::AdmissionSemaphore;
use crate::collab::{KeyAgreement, SignalStream, TunnelInterface};
use crate::config::{PEER_CONNECTION_TIMEOUT_MAX_MS, PEER_CONNECTION_TIMEOUT_MIN_MS};
use crate::negotiator::{
    generate_credentials, NegotiationParams, NegotiationRole, TransportKind, TransportLink,
    TransportNegotiator,
};
use crate::snapshot::{ClientPrefixes, IceServers, Snapshot};
use crate::status::{ConnStatus, StatusLedger};

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Dialing,
    Offered,
    Answered,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
    /// Terminal; reached only through `close`
    Closed,
}

impl SessionState {
    /// States that participate in active negotiation.
    pub fn is_negotiating(&self) -> bool {
        matches!(
            self,
            SessionState::Dialing
                | SessionState::Offered
                | SessionState::Answered
                | SessionState::Connecting
        )
    }
}

/// Immutable per-incarnation configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub key: PeerKey,
    pub local_key: PeerKey,
    pub allowed_ips: Vec<IpPrefix>,
    pub fqdn: String,
    pub agent_version: String,
    pub local_agent_version: String,
    /// Randomized initial connection timeout, chosen per incarnation
    pub timeout: Duration,
    pub wg_listen_port: u16,
    pub nat_external_ips: Vec<String>,
    pub disable_ipv6: bool,
    pub udp_mux_port: u16,
    pub udp_mux_srflx_port: u16,
}

impl SessionConfig {
    /// Uniformly random initial connection timeout. The jitter prevents
    /// synchronized retry storms across the peer fleet.
    pub fn random_timeout() -> Duration {
        let ms = rand::thread_rng()
            .gen_range(PEER_CONNECTION_TIMEOUT_MIN_MS..PEER_CONNECTION_TIMEOUT_MAX_MS);
        Duration::from_millis(ms)
    }
}

/// Services and callbacks handed to a session at construction. Sessions
/// hold no reference back to the engine.
pub struct SessionDeps {
    pub signaler: Arc<dyn SignalStream>,
    pub tunnel: Arc<dyn TunnelInterface>,
    pub negotiator: Arc<dyn TransportNegotiator>,
    pub admission: Arc<AdmissionSemaphore>,
    pub status: Arc<StatusLedger>,
    pub ice_servers: Arc<Snapshot<IceServers>>,
    pub relay_addr: Arc<Snapshot<Option<String>>>,
    pub key_agreement: Option<Arc<dyn KeyAgreement>>,
}

enum SessionCmd {
    Open,
    Activate,
    Deactivate,
    RemoteOffer(OfferAnswer),
    RemoteAnswer(OfferAnswer),
    RemoteCandidate(CandidateInfo, Arc<ClientPrefixes>),
    Close { graceful: bool },
}

/// Handle held by the peer store. All methods are non-blocking sends into
/// the session mailbox.
pub struct SessionHandle {
    key: PeerKey,
    allowed_ips: Vec<IpPrefix>,
    fqdn: String,
    agent_version: String,
    cmd_tx: mpsc::UnboundedSender<SessionCmd>,
    state_rx: watch::Receiver<SessionState>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    pub fn key(&self) -> PeerKey {
        self.key
    }

    pub fn allowed_ips(&self) -> &[IpPrefix] {
        &self.allowed_ips
    }

    pub fn fqdn(&self) -> &str {
        &self.fqdn
    }

    pub fn agent_version(&self) -> &str {
        &self.agent_version
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Watch state transitions; used by the watchdog and by tests.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Begin negotiation. May suspend on the admission gate inside the
    /// session task; this call never blocks.
    pub fn open(&self) {
        let _ = self.cmd_tx.send(SessionCmd::Open);
    }

    pub fn activate(&self) {
        let _ = self.cmd_tx.send(SessionCmd::Activate);
    }

    pub fn deactivate(&self) {
        let _ = self.cmd_tx.send(SessionCmd::Deactivate);
    }

    pub fn on_remote_offer(&self, offer: OfferAnswer) {
        let _ = self.cmd_tx.send(SessionCmd::RemoteOffer(offer));
    }

    pub fn on_remote_answer(&self, answer: OfferAnswer) {
        let _ = self.cmd_tx.send(SessionCmd::RemoteAnswer(answer));
    }

    pub fn on_remote_candidate(&self, candidate: CandidateInfo, client_routes: Arc<ClientPrefixes>) {
        let _ = self
            .cmd_tx
            .send(SessionCmd::RemoteCandidate(candidate, client_routes));
    }

    pub fn close(&self, graceful: bool) {
        let _ = self.cmd_tx.send(SessionCmd::Close { graceful });
    }

    /// Hard-stop the session task; used after the shutdown drain expires.
    pub fn abort(&self) {
        if let Some(task) = self.task.lock().expect("task lock poisoned").take() {
            task.abort();
        }
    }
}

/// Spawn a session task and return its handle.
pub fn spawn_session(cfg: SessionConfig, deps: SessionDeps) -> SessionHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(SessionState::Idle);

    let handle = SessionHandle {
        key: cfg.key,
        allowed_ips: cfg.allowed_ips.clone(),
        fqdn: cfg.fqdn.clone(),
        agent_version: cfg.agent_version.clone(),
        cmd_tx,
        state_rx,
        task: StdMutex::new(None),
    };

    let session = Session {
        cfg,
        deps,
        state_tx,
        cmd_rx,
        permit: None,
        ever_connected: false,
        first_attempt_done: false,
        backoff: Duration::from_secs(1),
        remote_offer: None,
        remote_answer: None,
        pending_candidates: Vec::new(),
    };

    let task = tokio::spawn(session.run());
    *handle.task.lock().expect("task lock poisoned") = Some(task);
    handle
}

struct Session {
    cfg: SessionConfig,
    deps: SessionDeps,
    state_tx: watch::Sender<SessionState>,
    cmd_rx: mpsc::UnboundedReceiver<SessionCmd>,
    permit: Option<OwnedSemaphorePermit>,
    ever_connected: bool,
    first_attempt_done: bool,
    backoff: Duration,
    remote_offer: Option<OfferAnswer>,
    remote_answer: Option<OfferAnswer>,
    pending_candidates: Vec<CandidateInfo>,
}

/// Outcome of one phase; drives the outer loop.
enum Phase {
    Idle,
    Attempt,
    Backoff,
    Closed,
}

impl Session {
    fn set_state(&self, state: SessionState) {
        debug!(peer = %self.cfg.key, ?state, "session state");
        let _ = self.state_tx.send(state);
    }

    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    fn initiator(&self) -> bool {
        self.cfg.local_key.outranks(&self.cfg.key)
    }

    async fn run(mut self) {
        loop {
            let next = match self.state() {
                SessionState::Idle => self.run_idle().await,
                SessionState::Failed | SessionState::Reconnecting => self.run_backoff().await,
                _ => self.run_attempt().await,
            };
            match next {
                Phase::Idle => {
                    self.release_permit();
                    self.set_state(SessionState::Idle);
                    self.deps
                        .status
                        .update_conn_status(&self.cfg.key, ConnStatus::Idle, false);
                }
                Phase::Attempt => {
                    if !self.begin_attempt().await {
                        return;
                    }
                }
                Phase::Backoff => {
                    self.release_permit();
                    self.first_attempt_done = true;
                }
                Phase::Closed => {
                    self.shutdown().await;
                    return;
                }
            }
        }
    }

    /// Wait in `Idle` until something wakes the session.
    async fn run_idle(&mut self) -> Phase {
        loop {
            let Some(cmd) = self.cmd_rx.recv().await else {
                return Phase::Closed;
            };
            match cmd {
                SessionCmd::Open | SessionCmd::Activate => return Phase::Attempt,
                SessionCmd::RemoteOffer(oa) => {
                    // the router activates before dispatching, so this is
                    // rare; treat it as a wake-up
                    self.remote_offer = Some(oa);
                    return Phase::Attempt;
                }
                SessionCmd::RemoteCandidate(cand, routes) => self.buffer_candidate(cand, &routes),
                SessionCmd::Deactivate | SessionCmd::RemoteAnswer(_) => {}
                SessionCmd::Close { .. } => return Phase::Closed,
            }
        }
    }

    /// Exponential backoff after a failure, capped at the randomized
    /// connection timeout. An inbound offer short-circuits the wait.
    async fn run_backoff(&mut self) -> Phase {
        // anything buffered now answers an attempt that already failed
        self.remote_answer = None;
        let wait = self.backoff;
        self.backoff = std::cmp::min(self.backoff * 2, self.cfg.timeout);
        let deadline = Instant::now() + wait;
        debug!(peer = %self.cfg.key, ?wait, "retrying after backoff");

        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return Phase::Attempt,
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        None | Some(SessionCmd::Close { .. }) => return Phase::Closed,
                        Some(SessionCmd::Deactivate) => return Phase::Idle,
                        Some(SessionCmd::RemoteOffer(oa)) => {
                            self.remote_offer = Some(oa);
                            return Phase::Attempt;
                        }
                        Some(SessionCmd::RemoteCandidate(cand, routes)) => {
                            self.buffer_candidate(cand, &routes)
                        }
                        Some(_) => {}
                    }
                }
            }
        }
    }

    /// Acquire admission (first attempt only) and enter `Dialing`.
    /// Returns `false` when the session closed while waiting.
    async fn begin_attempt(&mut self) -> bool {
        if !self.first_attempt_done && !self.ever_connected && self.permit.is_none() {
            let admission = self.deps.admission.clone();
            loop {
                tokio::select! {
                    permit = admission.acquire() => {
                        match permit {
                            Ok(p) => {
                                self.permit = Some(p);
                                break;
                            }
                            Err(_) => return false,
                        }
                    }
                    cmd = self.cmd_rx.recv() => {
                        match cmd {
                            None | Some(SessionCmd::Close { .. }) => {
                                self.shutdown().await;
                                return false;
                            }
                            Some(SessionCmd::Deactivate) => {
                                self.set_state(SessionState::Idle);
                                return true;
                            }
                            Some(SessionCmd::RemoteOffer(oa)) => self.remote_offer = Some(oa),
                            Some(SessionCmd::RemoteAnswer(oa)) => self.remote_answer = Some(oa),
                            Some(SessionCmd::RemoteCandidate(cand, routes)) => {
                                self.buffer_candidate(cand, &routes)
                            }
                            Some(_) => {}
                        }
                    }
                }
            }
        }

        self.set_state(SessionState::Dialing);
        self.deps
            .status
            .update_conn_status(&self.cfg.key, ConnStatus::Connecting, false);
        true
    }

    /// One full negotiation attempt: offer exchange then transport connect.
    async fn run_attempt(&mut self) -> Phase {
        let deadline = Instant::now() + self.cfg.timeout;
        let credentials = generate_credentials();

        if let Err(e) = self.send_offer(&credentials).await {
            warn!(peer = %self.cfg.key, "failed to send offer: {}", e);
            self.set_state(SessionState::Failed);
            return Phase::Backoff;
        }
        self.set_state(SessionState::Offered);

        // an offer or answer may already be buffered from the admission wait
        if let Some(oa) = self.remote_offer.take() {
            if let Some(phase) = self.handle_offer_while_offered(oa, &credentials, deadline).await {
                return phase;
            }
        }
        if self.remote_answer.is_some() {
            return self
                .run_connecting(NegotiationRole::Initiator, credentials, deadline)
                .await;
        }

        loop {
            tokio::select! {
                _ = sleep_until(deadline) => {
                    info!(peer = %self.cfg.key, "connection attempt timed out");
                    self.set_state(SessionState::Failed);
                    return Phase::Backoff;
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        None | Some(SessionCmd::Close { .. }) => return Phase::Closed,
                        Some(SessionCmd::Deactivate) => return Phase::Idle,
                        Some(SessionCmd::RemoteAnswer(oa)) => {
                            self.remote_answer = Some(oa);
                            return self
                                .run_connecting(NegotiationRole::Initiator, credentials, deadline)
                                .await;
                        }
                        Some(SessionCmd::RemoteOffer(oa)) => {
                            if let Some(phase) =
                                self.handle_offer_while_offered(oa, &credentials, deadline).await
                            {
                                return phase;
                            }
                        }
                        Some(SessionCmd::RemoteCandidate(cand, routes)) => {
                            self.buffer_candidate(cand, &routes)
                        }
                        Some(_) => {}
                    }
                }
            }
        }
    }

    /// Simultaneous-offer resolution. The lexicographically greater key is
    /// the initiator; the lesser side converts to responder.
    async fn handle_offer_while_offered(
        &mut self,
        offer: OfferAnswer,
        credentials: &IceCredentials,
        deadline: Instant,
    ) -> Option<Phase> {
        if self.initiator() {
            debug!(peer = %self.cfg.key, "ignoring remote offer, local side wins tie-break");
            return None;
        }
        self.remote_offer = Some(offer);
        self.set_state(SessionState::Answered);
        if let Err(e) = self.send_answer(credentials).await {
            warn!(peer = %self.cfg.key, "failed to send answer: {}", e);
            self.set_state(SessionState::Failed);
            return Some(Phase::Backoff);
        }
        Some(
            self.run_connecting(NegotiationRole::Responder, credentials.clone(), deadline)
                .await,
        )
    }

    /// Drive the transport negotiator until success, failure, or timeout.
    async fn run_connecting(
        &mut self,
        role: NegotiationRole,
        credentials: IceCredentials,
        deadline: Instant,
    ) -> Phase {
        self.set_state(SessionState::Connecting);

        let remote = match role {
            NegotiationRole::Initiator => self.remote_answer.clone(),
            NegotiationRole::Responder => self.remote_offer.clone(),
        };
        let Some(remote) = remote else {
            self.set_state(SessionState::Failed);
            return Phase::Backoff;
        };

        // snapshot once per attempt
        let ice_servers = self.deps.ice_servers.load();
        let local_relay = self.deps.relay_addr.load();

        let params = NegotiationParams {
            local_key: self.cfg.local_key,
            remote_key: self.cfg.key,
            role,
            local_credentials: credentials,
            remote_credentials: remote.credentials.clone(),
            remote_listen_port: remote.listen_port,
            ice_servers,
            remote_relay_addr: remote.relay_addr.clone(),
            local_relay_addr: (*local_relay).clone(),
            nat_external_ips: self.cfg.nat_external_ips.clone(),
            disable_ipv6: self.cfg.disable_ipv6,
            udp_mux_port: self.cfg.udp_mux_port,
            udp_mux_srflx_port: self.cfg.udp_mux_srflx_port,
        };

        let (local_cand_tx, mut local_cand_rx) = mpsc::unbounded_channel();
        let (remote_cand_tx, remote_cand_rx) = mpsc::unbounded_channel();
        for cand in self.pending_candidates.drain(..) {
            let _ = remote_cand_tx.send(cand);
        }

        let negotiator = self.deps.negotiator.clone();
        let connect = negotiator.connect(params, local_cand_tx, remote_cand_rx);
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => {
                    return match result {
                        Ok(link) => self.on_connected(link, &remote).await,
                        Err(e) => {
                            info!(peer = %self.cfg.key, "negotiation failed: {}", e);
                            self.set_state(SessionState::Failed);
                            Phase::Backoff
                        }
                    };
                }
                _ = sleep_until(deadline) => {
                    info!(peer = %self.cfg.key, "connection attempt timed out");
                    self.set_state(SessionState::Failed);
                    return Phase::Backoff;
                }
                Some(cand) = local_cand_rx.recv() => {
                    self.send_candidate(cand).await;
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        None | Some(SessionCmd::Close { .. }) => return Phase::Closed,
                        Some(SessionCmd::Deactivate) => return Phase::Idle,
                        Some(SessionCmd::RemoteCandidate(cand, routes)) => {
                            if !candidate_blocked(&cand, &routes) {
                                let _ = remote_cand_tx.send(cand);
                            }
                        }
                        // late offers and answers cannot redirect a running
                        // attempt; the next attempt picks them up
                        Some(SessionCmd::RemoteOffer(oa)) => self.remote_offer = Some(oa),
                        Some(SessionCmd::RemoteAnswer(oa)) => self.remote_answer = Some(oa),
                        Some(_) => {}
                    }
                }
            }
        }
    }

    async fn on_connected(&mut self, link: TransportLink, remote: &OfferAnswer) -> Phase {
        info!(
            peer = %self.cfg.key,
            kind = ?link.kind,
            endpoint = %link.endpoint,
            "peer connected"
        );

        self.release_permit();
        self.first_attempt_done = true;
        self.ever_connected = true;
        self.backoff = Duration::from_secs(1);

        if let Err(e) = self
            .deps
            .tunnel
            .update_peer_endpoint(self.cfg.key, link.endpoint.clone())
            .await
        {
            warn!(peer = %self.cfg.key, "failed to set tunnel endpoint: {}", e);
        }

        self.set_state(SessionState::Connected);
        let relayed = link.kind != TransportKind::Direct;
        self.deps
            .status
            .update_conn_status(&self.cfg.key, ConnStatus::Connected, relayed);

        if let Some(ka) = &self.deps.key_agreement {
            if let Some(pq_key) = remote.post_quantum_key.clone() {
                let addr = remote.post_quantum_addr.clone().unwrap_or_default();
                if let Err(e) = ka.on_connected(self.cfg.key, pq_key, addr).await {
                    warn!(peer = %self.cfg.key, "key agreement on-connected failed: {}", e);
                }
            }
        }

        self.run_connected(link).await
    }

    /// Hold the link until it drops or the session is told otherwise.
    async fn run_connected(&mut self, link: TransportLink) -> Phase {
        let mut closed = link.closed;
        loop {
            tokio::select! {
                _ = wait_closed(&mut closed) => {
                    info!(peer = %self.cfg.key, "transport link lost, reconnecting");
                    self.on_disconnected().await;
                    self.set_state(SessionState::Reconnecting);
                    self.backoff = Duration::from_secs(1);
                    return Phase::Backoff;
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        None | Some(SessionCmd::Close { .. }) => return Phase::Closed,
                        Some(SessionCmd::Deactivate) => {
                            self.on_disconnected().await;
                            return Phase::Idle;
                        }
                        Some(SessionCmd::RemoteOffer(oa)) => {
                            // remote restarted and renegotiates
                            info!(peer = %self.cfg.key, "remote offer while connected, renegotiating");
                            self.on_disconnected().await;
                            self.remote_offer = Some(oa);
                            self.set_state(SessionState::Reconnecting);
                            return Phase::Attempt;
                        }
                        Some(_) => {}
                    }
                }
            }
        }
    }

    async fn on_disconnected(&mut self) {
        self.deps
            .status
            .update_conn_status(&self.cfg.key, ConnStatus::Disconnected, false);
        if let Some(ka) = &self.deps.key_agreement {
            ka.on_disconnected(self.cfg.key).await;
        }
    }

    async fn shutdown(&mut self) {
        if self.state() == SessionState::Connected {
            self.on_disconnected().await;
        }
        self.release_permit();
        self.set_state(SessionState::Closed);
    }

    fn release_permit(&mut self) {
        self.permit = None;
    }

    fn buffer_candidate(&mut self, cand: CandidateInfo, routes: &ClientPrefixes) {
        if candidate_blocked(&cand, routes) {
            return;
        }
        self.pending_candidates.push(cand);
    }

    fn offer_answer(&self, credentials: &IceCredentials) -> OfferAnswer {
        let (pq_key, pq_addr) = match &self.deps.key_agreement {
            Some(ka) => (Some(ka.public_key()), Some(ka.listen_addr())),
            None => (None, None),
        };
        OfferAnswer {
            credentials: credentials.clone(),
            listen_port: self.cfg.wg_listen_port,
            agent_version: self.cfg.local_agent_version.clone(),
            post_quantum_key: pq_key,
            post_quantum_addr: pq_addr,
            relay_addr: (*self.deps.relay_addr.load()).clone(),
        }
    }

    async fn send_offer(&self, credentials: &IceCredentials) -> crate::error::EngineResult<()> {
        self.deps
            .signaler
            .send(SignalMessage {
                from: self.cfg.local_key,
                to: self.cfg.key,
                body: SignalBody::Offer(self.offer_answer(credentials)),
            })
            .await
    }

    async fn send_answer(&self, credentials: &IceCredentials) -> crate::error::EngineResult<()> {
        self.deps
            .signaler
            .send(SignalMessage {
                from: self.cfg.local_key,
                to: self.cfg.key,
                body: SignalBody::Answer(self.offer_answer(credentials)),
            })
            .await
    }

    async fn send_candidate(&self, cand: CandidateInfo) {
        let msg = SignalMessage {
            from: self.cfg.local_key,
            to: self.cfg.key,
            body: SignalBody::Candidate(cand),
        };
        if let Err(e) = self.deps.signaler.send(msg).await {
            debug!(peer = %self.cfg.key, "failed to signal candidate: {}", e);
        }
    }
}

/// Candidates advertising an address inside a VPN-routed prefix would pull
/// the connectivity check through the tunnel itself; drop them.
fn candidate_blocked(cand: &CandidateInfo, client_routes: &ClientPrefixes) -> bool {
    let ip = cand.addr.ip();
    for prefix in client_routes {
        if prefix.contains(ip) {
            debug!(addr = %cand.addr, %prefix, "discarding candidate inside client route");
            return true;
        }
    }
    false
}

async fn wait_closed(closed: &mut Option<tokio::sync::oneshot::Receiver<()>>) {
    match closed {
        Some(rx) => {
            // either signal or sender drop means the link is gone
            let _ = rx.await;
            *closed = None;
        }
        None => std::future::pending::<()>().await,
    }
}

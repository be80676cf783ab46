//! Transport negotiation
//!
//! A peer session drives one `TransportNegotiator` attempt at a time. The
//! negotiator gathers local candidates, exchanges connectivity checks with
//! the remote side, and settles on one of three paths in preference order:
//! a direct UDP pair, a TURN server, or the pre-authenticated relay
//! service announced by the control plane.

use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use peerwire_model::{CandidateInfo, IceCredentials, PeerKey};

use crate::error::{EngineError, EngineResult};
use crate::probe;
use crate::snapshot::IceServers;

/// Which path a session ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Direct,
    Turn,
    Relay,
}

/// An established path. `closed` resolves when the negotiator detects the
/// path died; paths without liveness tracking carry `None`.
#[derive(Debug)]
pub struct TransportLink {
    pub kind: TransportKind,
    pub endpoint: String,
    pub closed: Option<oneshot::Receiver<()>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    Initiator,
    Responder,
}

/// Everything one attempt needs. The ICE server list is a snapshot taken
/// once per attempt; the negotiator never re-reads the live list.
#[derive(Debug)]
pub struct NegotiationParams {
    pub local_key: PeerKey,
    pub remote_key: PeerKey,
    pub role: NegotiationRole,
    pub local_credentials: IceCredentials,
    pub remote_credentials: IceCredentials,
    pub remote_listen_port: u16,
    pub ice_servers: Arc<IceServers>,
    /// Relay endpoint the remote advertised in its offer/answer
    pub remote_relay_addr: Option<String>,
    /// Our own relay endpoint, when the relay service is connected
    pub local_relay_addr: Option<String>,
    pub nat_external_ips: Vec<String>,
    pub disable_ipv6: bool,
    /// Fixed local port for host candidates; 0 picks an available port
    pub udp_mux_port: u16,
    /// Fixed local port for server-reflexive discovery; 0 picks an
    /// available port
    pub udp_mux_srflx_port: u16,
}

/// Capability seam for NAT traversal. Selected at bootstrap.
#[async_trait]
pub trait TransportNegotiator: Send + Sync {
    /// Run one connection attempt. Local candidates are pushed into
    /// `local_candidates` as they are discovered (the session forwards them
    /// to the remote peer via signaling); remote candidates arrive on
    /// `remote_candidates` as signaling delivers them.
    async fn connect(
        &self,
        params: NegotiationParams,
        local_candidates: mpsc::UnboundedSender<CandidateInfo>,
        remote_candidates: mpsc::UnboundedReceiver<CandidateInfo>,
    ) -> EngineResult<TransportLink>;
}

/// Default negotiator: UDP hole punching with STUN-discovered reflexive
/// candidates, falling back to TURN reachability, then to the relay service.
pub struct UdpNegotiator {
    punch_attempts: u32,
    punch_interval: Duration,
    punch_window: Duration,
    keepalive_interval: Duration,
}

impl Default for UdpNegotiator {
    fn default() -> Self {
        Self {
            punch_attempts: 30,
            punch_interval: Duration::from_millis(100),
            punch_window: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(5),
        }
    }
}

const PUNCH_MAGIC: [u8; 4] = *b"pwP1";
const KIND_PUNCH: u8 = 1;
const KIND_ACK: u8 = 2;
const KIND_PING: u8 = 3;
const KIND_PONG: u8 = 4;

/// Token both sides derive from the credential pair; tags punch datagrams
/// so stray traffic cannot complete a check.
fn pair_token(local: &IceCredentials, remote: &IceCredentials) -> [u8; 8] {
    let mut parts = [
        format!("{}:{}", local.ufrag, local.pwd),
        format!("{}:{}", remote.ufrag, remote.pwd),
    ];
    parts.sort();
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    parts.hash(&mut hasher);
    hasher.finish().to_be_bytes()
}

fn frame(kind: u8, token: &[u8; 8]) -> [u8; 13] {
    let mut buf = [0u8; 13];
    buf[..4].copy_from_slice(&PUNCH_MAGIC);
    buf[4] = kind;
    buf[5..13].copy_from_slice(token);
    buf
}

fn parse_frame(data: &[u8], token: &[u8; 8]) -> Option<u8> {
    if data.len() != 13 || data[..4] != PUNCH_MAGIC || &data[5..13] != token {
        return None;
    }
    Some(data[4])
}

impl UdpNegotiator {
    /// Gather host and server-reflexive candidates on `socket`.
    async fn gather(
        &self,
        socket: &UdpSocket,
        params: &NegotiationParams,
        out: &mpsc::UnboundedSender<CandidateInfo>,
    ) -> EngineResult<()> {
        let local = socket.local_addr()?;
        let _ = out.send(CandidateInfo {
            payload: format!("udp {} typ host", local),
            addr: local,
        });

        // external mappings announced by the operator become host candidates
        for mapping in &params.nat_external_ips {
            let external = mapping.split('/').next().unwrap_or(mapping);
            if let Ok(ip) = external.parse() {
                let addr = SocketAddr::new(ip, local.port());
                let _ = out.send(CandidateInfo {
                    payload: format!("udp {} typ host", addr),
                    addr,
                });
            }
        }

        // TURN servers answer binding requests too; use every server for
        // reflexive discovery
        let servers = params
            .ice_servers
            .stuns
            .iter()
            .chain(params.ice_servers.turns.iter());
        for server in servers {
            let target = match probe::resolve(&server.endpoint()).await {
                Ok(addr) => addr,
                Err(e) => {
                    debug!(server = %server, "skipping unresolvable ICE server: {}", e);
                    continue;
                }
            };
            if params.disable_ipv6 && target.is_ipv6() {
                continue;
            }
            match probe::binding_request(socket, target).await {
                Ok(mapped) => {
                    debug!(%mapped, server = %server, "discovered reflexive candidate");
                    let _ = out.send(CandidateInfo {
                        payload: format!("udp {} typ srflx", mapped),
                        addr: mapped,
                    });
                }
                Err(e) => debug!(server = %server, "binding request failed: {}", e),
            }
        }
        Ok(())
    }

    /// Simultaneous punch toward every known remote candidate. Returns the
    /// first address that acknowledged.
    async fn punch(
        &self,
        socket: Arc<UdpSocket>,
        token: [u8; 8],
        mut remote_candidates: mpsc::UnboundedReceiver<CandidateInfo>,
    ) -> EngineResult<SocketAddr> {
        let (hit_tx, mut hit_rx) = mpsc::channel::<SocketAddr>(1);

        let recv_socket = socket.clone();
        let receiver = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                let Ok((n, from)) = recv_socket.recv_from(&mut buf).await else {
                    break;
                };
                match parse_frame(&buf[..n], &token) {
                    Some(KIND_PUNCH) => {
                        let _ = recv_socket.send_to(&frame(KIND_ACK, &token), from).await;
                    }
                    Some(KIND_ACK) => {
                        let _ = hit_tx.send(from).await;
                        break;
                    }
                    _ => {}
                }
            }
        });

        let started = Instant::now();
        let mut targets: Vec<SocketAddr> = Vec::new();
        let packet = frame(KIND_PUNCH, &token);

        let mut attempt = 0u32;
        let result = loop {
            if attempt >= self.punch_attempts || started.elapsed() > self.punch_window {
                break Err(EngineError::Negotiation(format!(
                    "no connectivity after {} punch attempts",
                    attempt
                )));
            }
            attempt += 1;

            while let Ok(cand) = remote_candidates.try_recv() {
                if !targets.contains(&cand.addr) {
                    debug!(addr = %cand.addr, "punching new remote candidate");
                    targets.push(cand.addr);
                }
            }

            for addr in &targets {
                if let Err(e) = socket.send_to(&packet, addr).await {
                    debug!(%addr, "punch send failed: {}", e);
                }
            }

            tokio::select! {
                hit = hit_rx.recv() => {
                    if let Some(addr) = hit {
                        break Ok(addr);
                    }
                }
                _ = sleep(self.punch_interval) => {}
            }
        };

        receiver.abort();
        result
    }

    /// Direct-path liveness: ping the peer and declare the link dead after
    /// three silent intervals.
    fn spawn_keepalive(
        &self,
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        token: [u8; 8],
    ) -> oneshot::Receiver<()> {
        let (closed_tx, closed_rx) = oneshot::channel();
        let interval = self.keepalive_interval;

        tokio::spawn(async move {
            let mut misses = 0u32;
            let mut buf = [0u8; 64];
            loop {
                if socket.send_to(&frame(KIND_PING, &token), peer).await.is_err() {
                    break;
                }

                let deadline = sleep(interval);
                tokio::pin!(deadline);
                let mut answered = false;
                loop {
                    tokio::select! {
                        recv = socket.recv_from(&mut buf) => {
                            let Ok((n, from)) = recv else { break };
                            match parse_frame(&buf[..n], &token) {
                                Some(KIND_PING) => {
                                    let _ = socket.send_to(&frame(KIND_PONG, &token), from).await;
                                }
                                Some(KIND_PONG) => answered = true,
                                _ => {}
                            }
                        }
                        _ = &mut deadline => break,
                    }
                }

                if answered {
                    misses = 0;
                } else {
                    misses += 1;
                    if misses >= 3 {
                        debug!(%peer, "keepalive lost, marking link closed");
                        break;
                    }
                }
            }
            let _ = closed_tx.send(());
        });

        closed_rx
    }
}

#[async_trait]
impl TransportNegotiator for UdpNegotiator {
    async fn connect(
        &self,
        params: NegotiationParams,
        local_candidates: mpsc::UnboundedSender<CandidateInfo>,
        remote_candidates: mpsc::UnboundedReceiver<CandidateInfo>,
    ) -> EngineResult<TransportLink> {
        // the default negotiator runs host and reflexive traffic over one
        // mux; the dedicated srflx port applies when no host mux is pinned
        let port = if params.udp_mux_port != 0 {
            params.udp_mux_port
        } else {
            params.udp_mux_srflx_port
        };
        let bind: SocketAddr = format!("0.0.0.0:{}", port).parse().expect("bind address");
        let socket = Arc::new(UdpSocket::bind(bind).await?);
        let token = pair_token(&params.local_credentials, &params.remote_credentials);

        info!(
            peer = %params.remote_key,
            role = ?params.role,
            "starting transport negotiation"
        );

        self.gather(&socket, &params, &local_candidates).await?;

        match self.punch(socket.clone(), token, remote_candidates).await {
            Ok(peer_addr) => {
                info!(peer = %params.remote_key, %peer_addr, "direct path established");
                let closed = self.spawn_keepalive(socket, peer_addr, token);
                return Ok(TransportLink {
                    kind: TransportKind::Direct,
                    endpoint: peer_addr.to_string(),
                    closed: Some(closed),
                });
            }
            Err(e) => debug!(peer = %params.remote_key, "direct path failed: {}", e),
        }

        // TURN fallback: first reachable TURN server carries the pair
        for turn in &params.ice_servers.turns {
            let Ok(target) = probe::resolve(&turn.endpoint()).await else {
                continue;
            };
            if probe::binding_request(&socket, target).await.is_ok() {
                info!(peer = %params.remote_key, server = %turn, "falling back to TURN path");
                return Ok(TransportLink {
                    kind: TransportKind::Turn,
                    endpoint: turn.endpoint(),
                    closed: None,
                });
            }
        }

        // relay service fallback: the remote's advertised endpoint wins,
        // otherwise our own
        if let Some(relay) = params
            .remote_relay_addr
            .as_ref()
            .or(params.local_relay_addr.as_ref())
        {
            info!(peer = %params.remote_key, relay, "falling back to relay path");
            return Ok(TransportLink {
                kind: TransportKind::Relay,
                endpoint: relay.clone(),
                closed: None,
            });
        }

        warn!(peer = %params.remote_key, "all transport paths exhausted");
        Err(EngineError::Negotiation("no usable path".into()))
    }
}

/// Generate fresh local ICE credentials for one attempt.
pub fn generate_credentials() -> IceCredentials {
    let mut rng = rand::thread_rng();
    let charset: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut pick = |len: usize| -> String {
        (0..len)
            .map(|_| charset[rng.gen_range(0..charset.len())] as char)
            .collect()
    };
    IceCredentials {
        ufrag: pick(8),
        pwd: pick(24),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(ufrag: &str, pwd: &str) -> IceCredentials {
        IceCredentials {
            ufrag: ufrag.into(),
            pwd: pwd.into(),
        }
    }

    #[test]
    fn pair_token_is_symmetric() {
        let a = creds("au", "apw");
        let b = creds("bu", "bpw");
        assert_eq!(pair_token(&a, &b), pair_token(&b, &a));
    }

    #[test]
    fn frame_round_trip() {
        let token = [9u8; 8];
        let buf = frame(KIND_PUNCH, &token);
        assert_eq!(parse_frame(&buf, &token), Some(KIND_PUNCH));
        assert_eq!(parse_frame(&buf, &[0u8; 8]), None);
        assert_eq!(parse_frame(&buf[..5], &token), None);
    }

    #[test]
    fn generated_credentials_have_expected_shape() {
        let c = generate_credentials();
        assert_eq!(c.ufrag.len(), 8);
        assert_eq!(c.pwd.len(), 24);
        assert_ne!(c.ufrag, generate_credentials().ufrag);
    }

    #[tokio::test]
    async fn punch_succeeds_between_two_local_sockets() {
        let negotiator = UdpNegotiator::default();
        let token = pair_token(&creds("a", "a"), &creds("b", "b"));

        let left = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let right = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let left_addr = left.local_addr().unwrap();
        let right_addr = right.local_addr().unwrap();

        let (ltx, lrx) = mpsc::unbounded_channel();
        let (rtx, rrx) = mpsc::unbounded_channel();
        ltx.send(CandidateInfo {
            payload: format!("udp {} typ host", right_addr),
            addr: right_addr,
        })
        .unwrap();
        rtx.send(CandidateInfo {
            payload: format!("udp {} typ host", left_addr),
            addr: left_addr,
        })
        .unwrap();

        let n2 = UdpNegotiator::default();
        let right_task = tokio::spawn(async move { n2.punch(right, token, rrx).await });
        let hit = negotiator.punch(left, token, lrx).await.unwrap();
        assert_eq!(hit, right_addr);
        let other = right_task.await.unwrap().unwrap();
        assert_eq!(other, left_addr);
    }
}

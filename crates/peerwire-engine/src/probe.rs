//! STUN reachability probes
//!
//! Minimal RFC 5389 binding client used for two things: health probes of
//! the configured STUN/TURN servers and server-reflexive candidate
//! discovery in the default transport negotiator.

use std::net::SocketAddr;
use std::time::Duration;

use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

use peerwire_model::IceUri;

use crate::error::{EngineError, EngineResult};

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;
const BINDING_ERROR: u16 = 0x0111;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const MAGIC_COOKIE: u32 = 0x2112_A442;

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Result of probing one server URI.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub uri: String,
    pub error: Option<String>,
}

impl ProbeOutcome {
    pub fn healthy(&self) -> bool {
        self.error.is_none()
    }
}

/// Send a binding request to `server` and return our reflexive address.
pub async fn binding_request(socket: &UdpSocket, server: SocketAddr) -> EngineResult<SocketAddr> {
    let mut transaction_id = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut transaction_id);

    let request = build_binding_request(&transaction_id);
    socket.send_to(&request, server).await?;
    debug!(%server, "sent STUN binding request");

    let mut buf = [0u8; 576];
    let (len, from) = timeout(PROBE_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .map_err(|_| EngineError::Timeout)??;
    debug!(%from, len, "received STUN response");

    parse_binding_response(&buf[..len], &transaction_id)
}

/// Probe a list of server URIs concurrently; one outcome per URI.
pub async fn probe_all(uris: &[IceUri]) -> Vec<ProbeOutcome> {
    let mut tasks = Vec::with_capacity(uris.len());
    for uri in uris {
        let uri = uri.clone();
        tasks.push(tokio::spawn(async move {
            let error = probe_one(&uri).await.err().map(|e| e.to_string());
            ProbeOutcome {
                uri: uri.to_string(),
                error,
            }
        }));
    }

    let mut outcomes = Vec::with_capacity(tasks.len());
    for task in tasks {
        if let Ok(outcome) = task.await {
            outcomes.push(outcome);
        }
    }
    outcomes
}

async fn probe_one(uri: &IceUri) -> EngineResult<SocketAddr> {
    let server = resolve(&uri.endpoint()).await?;
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    binding_request(&socket, server).await
}

/// Resolve a host:port endpoint, preferring the first answer.
pub async fn resolve(endpoint: &str) -> EngineResult<SocketAddr> {
    if let Ok(addr) = endpoint.parse() {
        return Ok(addr);
    }
    tokio::net::lookup_host(endpoint)
        .await?
        .next()
        .ok_or_else(|| EngineError::Negotiation(format!("no addresses for '{}'", endpoint)))
}

fn build_binding_request(transaction_id: &[u8; 12]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(20);
    packet.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    packet.extend_from_slice(&0u16.to_be_bytes());
    packet.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    packet.extend_from_slice(transaction_id);
    packet
}

fn parse_binding_response(data: &[u8], expected_txn_id: &[u8; 12]) -> EngineResult<SocketAddr> {
    if data.len() < 20 {
        return Err(EngineError::Negotiation("STUN response too short".into()));
    }

    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let magic = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let txn_id = &data[8..20];

    if msg_type == BINDING_ERROR {
        return Err(EngineError::Negotiation("STUN binding error response".into()));
    }
    if msg_type != BINDING_RESPONSE {
        return Err(EngineError::Negotiation(format!(
            "unexpected STUN message type 0x{:04x}",
            msg_type
        )));
    }
    if magic != MAGIC_COOKIE {
        return Err(EngineError::Negotiation("invalid STUN magic cookie".into()));
    }
    if txn_id != expected_txn_id {
        return Err(EngineError::Negotiation("transaction ID mismatch".into()));
    }
    if data.len() < 20 + msg_len {
        return Err(EngineError::Negotiation("STUN message truncated".into()));
    }

    let mut pos = 20;
    while pos + 4 <= 20 + msg_len {
        let attr_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let attr_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        pos += 4;
        if pos + attr_len > data.len() {
            break;
        }

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => {
                if let Some(addr) = parse_address(&data[pos..pos + attr_len], true) {
                    return Ok(addr);
                }
            }
            ATTR_MAPPED_ADDRESS => {
                if let Some(addr) = parse_address(&data[pos..pos + attr_len], false) {
                    return Ok(addr);
                }
            }
            _ => {}
        }

        // attributes are 4-byte aligned
        pos += (attr_len + 3) & !3;
    }

    Err(EngineError::Negotiation(
        "no mapped address in STUN response".into(),
    ))
}

fn parse_address(data: &[u8], xor: bool) -> Option<SocketAddr> {
    if data.len() < 8 {
        return None;
    }
    let family = data[1];
    let mut port = u16::from_be_bytes([data[2], data[3]]);
    let cookie = MAGIC_COOKIE.to_be_bytes();
    if xor {
        port ^= u16::from_be_bytes([cookie[0], cookie[1]]);
    }

    match family {
        0x01 => {
            let mut ip = [data[4], data[5], data[6], data[7]];
            if xor {
                for (b, c) in ip.iter_mut().zip(cookie.iter()) {
                    *b ^= c;
                }
            }
            Some(SocketAddr::new(std::net::Ipv4Addr::from(ip).into(), port))
        }
        0x02 => {
            if data.len() < 20 {
                return None;
            }
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&data[4..20]);
            if xor {
                for (b, c) in ip.iter_mut().zip(cookie.iter()) {
                    *b ^= c;
                }
            }
            Some(SocketAddr::new(std::net::Ipv6Addr::from(ip).into(), port))
        }
        _ => None,
    }
}

//! Signaling messages
//!
//! Per-pair negotiation messages exchanged through the signal service:
//! offers, answers, ICE candidates, and lazy-mode wake/sleep control.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::key::PeerKey;

/// ICE credentials negotiated per connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

/// Payload shared by offers and answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferAnswer {
    pub credentials: IceCredentials,
    /// Local data-plane listen port of the sender
    pub listen_port: u16,
    pub agent_version: String,
    /// Post-quantum public key, when the sender runs a key-agreement daemon
    #[serde(default)]
    pub post_quantum_key: Option<Vec<u8>>,
    #[serde(default)]
    pub post_quantum_addr: Option<String>,
    /// Relay endpoint the sender is reachable on, when it already holds one
    #[serde(default)]
    pub relay_addr: Option<String>,
}

/// A serialized ICE candidate plus the address it advertises.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateInfo {
    /// Opaque candidate line handed to the transport layer
    pub payload: String,
    pub addr: SocketAddr,
}

/// Message body variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SignalBody {
    Offer(OfferAnswer),
    Answer(OfferAnswer),
    Candidate(CandidateInfo),
    /// Transport mode announcement; informational
    Mode,
    /// Lazy-mode quiesce request
    GoIdle,
}

impl SignalBody {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalBody::Offer(_) => "offer",
            SignalBody::Answer(_) => "answer",
            SignalBody::Candidate(_) => "candidate",
            SignalBody::Mode => "mode",
            SignalBody::GoIdle => "go-idle",
        }
    }
}

/// One inbound or outbound signal frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub from: PeerKey,
    pub to: PeerKey,
    pub body: SignalBody,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_kind_names() {
        let oa = OfferAnswer {
            credentials: IceCredentials {
                ufrag: "u".into(),
                pwd: "p".into(),
            },
            listen_port: 51820,
            agent_version: "0.3.0".into(),
            post_quantum_key: None,
            post_quantum_addr: None,
            relay_addr: None,
        };
        assert_eq!(SignalBody::Offer(oa.clone()).kind(), "offer");
        assert_eq!(SignalBody::Answer(oa).kind(), "answer");
        assert_eq!(SignalBody::GoIdle.kind(), "go-idle");
    }
}

//! Peerwire data model
//!
//! Shared types consumed by the peering engine:
//! - Peer identity keys
//! - Versioned network maps delivered by the control plane
//! - Typed routes and high-availability groups
//! - Signaling messages (offer/answer/candidate)
//! - STUN/TURN server URIs

pub mod error;
pub mod ice;
pub mod key;
pub mod map;
pub mod prefix;
pub mod route;
pub mod signal;

pub use error::{ModelError, ModelResult};
pub use ice::{IceUri, IceUriKind};
pub use key::PeerKey;
pub use map::{
    compare_allowed_ips, DnsConfig, FirewallRuleSet, ForwardingRule, LocalPeerConfig, NetworkMap,
    OfflinePeer, PeerDescriptor, RelayConfig,
};
pub use prefix::IpPrefix;
pub use route::{HaGroupId, Route, RouteClassification};
pub use route::classify_routes;
pub use signal::{CandidateInfo, IceCredentials, OfferAnswer, SignalBody, SignalMessage};

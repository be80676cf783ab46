//! Peerwire engine
//!
//! The in-process coordinator of a mesh-VPN client. Consumes the
//! control-plane stream (authoritative network maps) and the signal-plane
//! stream (per-peer negotiation messages), and drives a local tunnel
//! interface plus a dynamic set of per-peer NAT-traversal sessions.
//!
//! - Engine supervisor: lifecycle and serialization of control events
//! - Network-map reconciler: diff-apply of successive snapshots
//! - Peer sessions: per-peer state machines on their own tasks
//! - Signal router: strict-ordered demultiplexing of negotiation messages

pub mod admission;
pub mod collab;
pub mod config;
pub mod conn_mgr;
pub mod engine;
pub mod error;
pub mod health;
pub mod negotiator;
pub mod probe;
pub mod reconcile;
pub mod router;
pub mod session;
pub mod snapshot;
pub mod status;
pub mod store;

#[cfg(test)]
pub(crate) mod testutil;

pub use admission::AdmissionSemaphore;
pub use collab::{
    ControlStream, DnsForwarderOps, DnsOps, FirewallOps, FlowOps, FlowSettings, ForwarderEntry,
    InfraConfig, IngressOps, KeyAgreement, Meta, NetworkWatcher, RelayOps, RouteOps, SignalStream,
    SshAuthority, StateStore, SyncEvent, TunnelInterface, TunnelStats,
};
pub use config::{
    EngineConfig, CONN_INIT_LIMIT, PEER_CONNECTION_TIMEOUT_MAX_MS, PEER_CONNECTION_TIMEOUT_MIN_MS,
};
pub use engine::{Collaborators, Engine, ShutdownReason, AGENT_VERSION};
pub use error::{EngineError, EngineResult};
pub use negotiator::{
    NegotiationParams, NegotiationRole, TransportKind, TransportLink, TransportNegotiator,
    UdpNegotiator,
};
pub use probe::ProbeOutcome;
pub use session::{SessionConfig, SessionHandle, SessionState};
pub use snapshot::{IceServers, Snapshot};
pub use status::{ConnStatus, StatusLedger, StatusSnapshot};
pub use store::PeerStore;

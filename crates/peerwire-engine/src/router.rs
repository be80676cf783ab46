//! Signal router
//!
//! Demultiplexes inbound signaling messages onto peer sessions. Dispatch
//! runs under the engine control lock so that map reconciliation and
//! signaling for the same peer never interleave; candidate handling is the
//! one exception and is handed off to the session task right after lookup
//! to avoid head-of-line blocking behind slow negotiation.

use std::sync::Arc;

use tracing::{debug, warn};

use peerwire_model::{SignalBody, SignalMessage};

use crate::conn_mgr::ConnManager;
use crate::error::{EngineError, EngineResult};
use crate::snapshot::ClientPrefixes;
use crate::store::PeerStore;

/// Dispatch one inbound message. Messages for unknown peers are dropped
/// with an error the caller logs.
pub fn dispatch(
    msg: SignalMessage,
    store: &PeerStore,
    conn_mgr: &ConnManager,
    client_routes: Arc<ClientPrefixes>,
) -> EngineResult<()> {
    let Some(session) = store.get(&msg.from) else {
        return Err(EngineError::UnknownPeer(msg.from.to_string()));
    };

    // lazy-mode peers wake on the first real message
    if !matches!(msg.body, SignalBody::GoIdle) {
        conn_mgr.activate(&session);
    }

    match msg.body {
        SignalBody::Offer(offer) => {
            debug!(peer = %msg.from, "dispatching remote offer");
            session.on_remote_offer(offer);
        }
        SignalBody::Answer(answer) => {
            debug!(peer = %msg.from, "dispatching remote answer");
            session.on_remote_answer(answer);
        }
        SignalBody::Candidate(candidate) => {
            // asynchronous handoff; the session task applies it
            session.on_remote_candidate(candidate, client_routes);
        }
        SignalBody::Mode => {
            debug!(peer = %msg.from, "mode message, no action");
        }
        SignalBody::GoIdle => {
            debug!(peer = %msg.from, "remote requested idle");
            conn_mgr.deactivate(&session);
        }
    }
    Ok(())
}

/// Log-and-continue wrapper used by the engine's signal reader.
pub fn dispatch_logged(
    msg: SignalMessage,
    store: &PeerStore,
    conn_mgr: &ConnManager,
    client_routes: Arc<ClientPrefixes>,
) {
    if let Err(e) = dispatch(msg, store, conn_mgr, client_routes) {
        warn!("dropping signal message: {}", e);
    }
}

//! Engine errors

use thiserror::Error;

use peerwire_model::ModelError;

/// Errors surfaced by the peering engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Tunnel interface queried before initialization
    #[error("tunnel interface is not initialized")]
    TunnelNotInitialized,

    /// Tunnel device operation failed
    #[error("tunnel error: {0}")]
    Tunnel(String),

    /// Firewall backend failure
    #[error("firewall error: {0}")]
    Firewall(String),

    /// DNS manager failure
    #[error("dns error: {0}")]
    Dns(String),

    /// Route manager failure
    #[error("route error: {0}")]
    Route(String),

    /// Signaling failure
    #[error("signal error: {0}")]
    Signal(String),

    /// Control stream failure
    #[error("control error: {0}")]
    Control(String),

    /// Relay service failure
    #[error("relay error: {0}")]
    Relay(String),

    /// Transport negotiation failure
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// Session state machine violation
    #[error("invalid session transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// A peer already exists in the store
    #[error("peer already exists: {0}")]
    PeerExists(String),

    /// Addressed peer is unknown
    #[error("wrongly addressed message for {0}")]
    UnknownPeer(String),

    /// Operation timed out
    #[error("operation timed out")]
    Timeout,

    /// Engine is shutting down
    #[error("engine stopped")]
    Stopped,

    /// Fatal stream error requiring a full engine reset
    #[error("reset connection: {0}")]
    ResetConnection(String),

    /// Configuration rejected
    #[error("config error: {0}")]
    Config(String),

    /// State persistence failure
    #[error("state store error: {0}")]
    StateStore(String),

    /// Model parse failure
    #[error(transparent)]
    Model(#[from] ModelError),

    /// I/O error from probes or the default negotiator
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Collects map-scoped errors so a single bad entry never aborts
/// reconciliation of the rest of the map.
#[derive(Debug, Default)]
pub struct ErrorBag {
    errors: Vec<EngineError>,
}

impl ErrorBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: EngineError) {
        self.errors.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Collapse into a single error, or `Ok(())` when nothing was recorded.
    pub fn into_result(self) -> EngineResult<()> {
        if self.errors.is_empty() {
            return Ok(());
        }
        let joined = self
            .errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        Err(EngineError::Config(format!(
            "{} error(s) applying update: {}",
            self.errors.len(),
            joined
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_bag_is_ok() {
        assert!(ErrorBag::new().into_result().is_ok());
    }

    #[test]
    fn bag_joins_messages() {
        let mut bag = ErrorBag::new();
        bag.push(EngineError::Timeout);
        bag.push(EngineError::TunnelNotInitialized);
        let err = bag.into_result().unwrap_err();
        let text = err.to_string();
        assert!(text.contains("timed out"));
        assert!(text.contains("not initialized"));
    }
}

//! Peer identity keys

use std::cmp::Ordering;
use std::fmt;

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};

/// Opaque 32-byte public identifier of a remote peer.
///
/// Keys are immutable and unique per peer. The byte-wise ordering is
/// meaningful: when two peers attempt to negotiate simultaneously, the one
/// with the greater key acts as the initiator.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerKey(pub [u8; 32]);

impl PeerKey {
    /// Construct from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse from the standard base64 text form
    pub fn from_base64(s: &str) -> ModelResult<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(|e| ModelError::InvalidKey(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(ModelError::InvalidKey(format!(
                "expected 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Base64 text form
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// True if this key wins the initiator tie-break against `other`
    pub fn outranks(&self, other: &PeerKey) -> bool {
        self.0 > other.0
    }
}

impl Ord for PeerKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for PeerKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

impl fmt::Debug for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // short form keeps logs readable
        write!(f, "PeerKey({}…)", &self.to_base64()[..8])
    }
}

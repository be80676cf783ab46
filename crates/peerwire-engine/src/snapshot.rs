//! Atomically swapped snapshots
//!
//! Shared read-mostly state (the STUN/TURN server list, the client route
//! prefixes) is published as an `Arc` swapped under a short write lock.
//! Readers capture one `Arc` per attempt and never observe a torn mix of
//! old and new lists.

use std::sync::{Arc, RwLock};

use peerwire_model::{IceUri, IpPrefix};

/// A swappable snapshot pointer.
#[derive(Debug)]
pub struct Snapshot<T> {
    current: RwLock<Arc<T>>,
}

impl<T> Snapshot<T> {
    pub fn new(value: T) -> Self {
        Self {
            current: RwLock::new(Arc::new(value)),
        }
    }

    /// Capture the current value. Cheap; clones only the pointer.
    pub fn load(&self) -> Arc<T> {
        self.current.read().expect("snapshot lock poisoned").clone()
    }

    /// Publish a new value. Readers holding the old `Arc` are unaffected.
    pub fn store(&self, value: T) {
        *self.current.write().expect("snapshot lock poisoned") = Arc::new(value);
    }
}

impl<T: Default> Default for Snapshot<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// The combined STUN/TURN server list read by peer sessions.
#[derive(Debug, Clone, Default)]
pub struct IceServers {
    pub stuns: Vec<IceUri>,
    pub turns: Vec<IceUri>,
}

impl IceServers {
    pub fn is_empty(&self) -> bool {
        self.stuns.is_empty() && self.turns.is_empty()
    }
}

/// Client route prefixes used to filter tunnel-looping ICE candidates.
pub type ClientPrefixes = Vec<IpPrefix>;

#[cfg(test)]
mod tests {
    use super::*;
    use peerwire_model::IceUri;

    #[test]
    fn load_sees_pre_or_post_swap_value() {
        let snap = Snapshot::new(IceServers::default());
        let before = snap.load();
        assert!(before.is_empty());

        snap.store(IceServers {
            stuns: vec![IceUri::parse_stun("stun:s.example.com:3478").unwrap()],
            turns: Vec::new(),
        });

        // the old snapshot is still intact, the new one is visible
        assert!(before.is_empty());
        assert_eq!(snap.load().stuns.len(), 1);
    }
}

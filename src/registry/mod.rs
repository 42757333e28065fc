//! Publisher registry
//!
//! Maps stream anchors (`vhost/app/stream`) to live publishers. The map
//! is split into 101 independently locked shards selected by
//! FNV-32a(anchor) mod 101, so concurrent publishes and plays on
//! different streams never contend on one lock. Critical sections are a
//! hash-map probe; no lock is held across an await point.
//!
//! Semantics are strict insert-if-absent: a second publisher for a live
//! anchor is refused without disturbing the incumbent, and only the
//! owning publisher removes its entry.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use crate::media::GopCache;
use crate::protocol::constants::REGISTRY_SHARDS;

/// Canonical publisher identity: vhost + app + stream name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamAnchor {
    pub vhost: String,
    pub app: String,
    pub stream: String,
}

impl StreamAnchor {
    pub fn new(
        vhost: impl Into<String>,
        app: impl Into<String>,
        stream: impl Into<String>,
    ) -> Self {
        Self { vhost: vhost.into(), app: app.into(), stream: stream.into() }
    }
}

impl std::fmt::Display for StreamAnchor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.vhost, self.app, self.stream)
    }
}

/// Shared state of one live publisher
pub struct PublisherHandle {
    pub anchor: StreamAnchor,
    /// Session that owns the entry
    pub session_id: u64,
    /// The packet ring players attach to
    pub cache: Arc<GopCache>,
    pub started_at: Instant,
}

type Shard = RwLock<HashMap<String, Arc<PublisherHandle>>>;

/// Sharded anchor → publisher map
pub struct PublisherRegistry {
    shards: Vec<Shard>,
}

impl PublisherRegistry {
    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(REGISTRY_SHARDS);
        for _ in 0..REGISTRY_SHARDS {
            shards.push(RwLock::new(HashMap::new()));
        }
        Self { shards }
    }

    fn shard(&self, anchor: &str) -> &Shard {
        let idx = fnv1a_32(anchor.as_bytes()) as usize % self.shards.len();
        &self.shards[idx]
    }

    /// Look up a live publisher
    pub fn get(&self, anchor: &StreamAnchor) -> Option<Arc<PublisherHandle>> {
        let key = anchor.to_string();
        self.shard(&key).read().unwrap().get(&key).cloned()
    }

    /// Claim an anchor. Returns false (and leaves the incumbent alone) if
    /// a publisher is already live there.
    pub fn insert_if_absent(&self, handle: Arc<PublisherHandle>) -> bool {
        let key = handle.anchor.to_string();
        let mut shard = self.shard(&key).write().unwrap();
        if shard.contains_key(&key) {
            return false;
        }
        shard.insert(key, handle);
        true
    }

    /// Drop an anchor, but only for the session that owns it
    pub fn remove(&self, anchor: &StreamAnchor, session_id: u64) {
        let key = anchor.to_string();
        let mut shard = self.shard(&key).write().unwrap();
        match shard.get(&key) {
            Some(handle) if handle.session_id == session_id => {
                shard.remove(&key);
            }
            Some(handle) => {
                tracing::warn!(
                    anchor = %anchor,
                    owner = handle.session_id,
                    caller = session_id,
                    "Remove refused: caller does not own the anchor"
                );
            }
            None => {}
        }
    }

    /// Number of live publishers across all shards
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().unwrap().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PublisherRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// 32-bit FNV-1a
fn fnv1a_32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811C_9DC5;
    for &b in data {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(anchor: StreamAnchor, session_id: u64) -> Arc<PublisherHandle> {
        Arc::new(PublisherHandle {
            anchor,
            session_id,
            cache: Arc::new(GopCache::new()),
            started_at: Instant::now(),
        })
    }

    #[test]
    fn test_insert_if_absent_then_conflict() {
        let registry = PublisherRegistry::new();
        let anchor = StreamAnchor::new("localhost", "live", "a");

        assert!(registry.insert_if_absent(handle(anchor.clone(), 1)));
        // second publisher is refused, incumbent untouched
        assert!(!registry.insert_if_absent(handle(anchor.clone(), 2)));
        assert_eq!(registry.get(&anchor).unwrap().session_id, 1);

        registry.remove(&anchor, 1);
        assert!(registry.get(&anchor).is_none());

        // free again after removal
        assert!(registry.insert_if_absent(handle(anchor.clone(), 2)));
    }

    #[test]
    fn test_remove_requires_ownership() {
        let registry = PublisherRegistry::new();
        let anchor = StreamAnchor::new("localhost", "live", "a");
        registry.insert_if_absent(handle(anchor.clone(), 1));

        // a stranger cannot evict the publisher
        registry.remove(&anchor, 99);
        assert_eq!(registry.get(&anchor).unwrap().session_id, 1);
    }

    #[test]
    fn test_get_unknown_anchor() {
        let registry = PublisherRegistry::new();
        let anchor = StreamAnchor::new("localhost", "live", "nope");
        assert!(registry.get(&anchor).is_none());
    }

    #[test]
    fn test_anchors_spread_across_shards() {
        let registry = PublisherRegistry::new();
        for i in 0..500 {
            let anchor = StreamAnchor::new("localhost", "live", format!("s{}", i));
            assert!(registry.insert_if_absent(handle(anchor, i)));
        }
        assert_eq!(registry.len(), 500);

        let populated = registry.shards.iter().filter(|s| !s.read().unwrap().is_empty()).count();
        // FNV-32a mod 101 scatters 500 keys over far more than one shard
        assert!(populated > 50, "only {} shards populated", populated);
    }

    #[test]
    fn test_fnv1a_32_vectors() {
        // reference values for the FNV-1a 32-bit function
        assert_eq!(fnv1a_32(b""), 0x811C_9DC5);
        assert_eq!(fnv1a_32(b"a"), 0xE40C_292C);
        assert_eq!(fnv1a_32(b"foobar"), 0xBF9C_F968);
    }

    #[test]
    fn test_anchor_display() {
        let anchor = StreamAnchor::new("cdn.example.com", "live", "talk");
        assert_eq!(anchor.to_string(), "cdn.example.com/live/talk");
    }
}

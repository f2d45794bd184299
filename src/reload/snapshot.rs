//! Immutable configuration snapshots.

use chrono::{DateTime, Utc};

use crate::rules::{BlocklistIndex, KeyRegistry};

/// One consistent view of keys and blocklist.
///
/// Snapshots are never mutated after construction. A reload builds a new one
/// and swaps it in; requests holding the old one keep using it until they finish.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    keys: KeyRegistry,
    blocklist: BlocklistIndex,
    loaded_at: DateTime<Utc>,
    generation: u64,
}

impl ConfigSnapshot {
    /// Bundle a registry and blocklist into a snapshot.
    pub fn new(keys: KeyRegistry, blocklist: BlocklistIndex, generation: u64) -> Self {
        Self {
            keys,
            blocklist,
            loaded_at: Utc::now(),
            generation,
        }
    }

    /// The key registry.
    pub fn keys(&self) -> &KeyRegistry {
        &self.keys
    }

    /// The blocklist.
    pub fn blocklist(&self) -> &BlocklistIndex {
        &self.blocklist
    }

    /// When this snapshot was built.
    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Monotonic publish counter; the initial load is generation 1.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

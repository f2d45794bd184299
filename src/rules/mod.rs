//! Rule sources: API keys, IP blocklists and their signatures.

mod blocklist;
mod keys;
mod signature;

pub use blocklist::{BlockEntry, BlocklistIndex};
pub use keys::{normalize_key, KeyRecord, KeyRegistry, DEFAULT_TIER};
pub use signature::{Artifact, SignatureVerifier, DEV_PLACEHOLDER_SECRET, SIGNATURE_PREFIX};

//! Edgeguard - Edge Admission Control
//!
//! This crate decides whether an inbound request may proceed, given the API
//! key it presents and the address it came from. Keys carry per-window quotas,
//! addresses are checked against an IP/CIDR blocklist, and both rule sets are
//! loaded from optionally signed files that can be reloaded without restarting.

pub mod config;
pub mod error;
pub mod gateway;
pub mod quota;
pub mod reload;
pub mod rules;
pub mod sidecar;

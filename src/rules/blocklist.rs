//! IP and CIDR blocklist parsing and matching.

use ipnet::IpNet;
use std::collections::HashSet;
use std::net::IpAddr;
use std::str::FromStr;
use tracing::{debug, warn};

/// One blocklist line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockEntry {
    /// A single address
    Address(IpAddr),
    /// A CIDR network, host bits cleared
    Network(IpNet),
}

impl FromStr for BlockEntry {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains('/') {
            parse_network(s).map(BlockEntry::Network)
        } else {
            s.parse::<IpAddr>()
                .map(|addr| BlockEntry::Address(addr.to_canonical()))
                .map_err(|e| format!("bad address {s:?}: {e}"))
        }
    }
}

/// Parse a CIDR network, accepting host bits (`10.1.2.3/8` is `10.0.0.0/8`).
///
/// IPv4-mapped IPv6 networks at `/96` or longer become the IPv4 network they cover.
fn parse_network(s: &str) -> Result<IpNet, String> {
    let net = IpNet::from_str(s.trim())
        .map_err(|e| format!("bad network {s:?}: {e}"))?
        .trunc();

    match net {
        IpNet::V6(v6) if v6.prefix_len() >= 96 => match v6.addr().to_ipv4_mapped() {
            Some(v4) => IpNet::new(IpAddr::V4(v4), v6.prefix_len() - 96)
                .map_err(|e| format!("bad network {s:?}: {e}")),
            None => Ok(net),
        },
        _ => Ok(net),
    }
}

/// Immutable set of blocked addresses and networks.
#[derive(Debug, Clone, Default)]
pub struct BlocklistIndex {
    addresses: HashSet<IpAddr>,
    networks: Vec<IpNet>,
    skipped: usize,
}

impl BlocklistIndex {
    /// Parse newline-delimited entries. `#` lines and blank lines are ignored;
    /// malformed lines are skipped with a warning.
    pub fn parse(origin: &str, text: &str) -> Self {
        let mut index = BlocklistIndex::default();

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match line.parse::<BlockEntry>() {
                Ok(entry) => index.insert(entry),
                Err(reason) => {
                    warn!(origin = %origin, line = lineno + 1, reason = %reason, "Skipping malformed blocklist entry");
                    index.skipped += 1;
                }
            }
        }

        index
    }

    /// Build an index from already-parsed entries.
    pub fn from_entries(entries: impl IntoIterator<Item = BlockEntry>) -> Self {
        let mut index = BlocklistIndex::default();
        for entry in entries {
            index.insert(entry);
        }
        index
    }

    fn insert(&mut self, entry: BlockEntry) {
        match entry {
            BlockEntry::Address(addr) => {
                self.addresses.insert(addr);
            }
            BlockEntry::Network(net) => {
                if !self.networks.contains(&net) {
                    self.networks.push(net);
                }
            }
        }
    }

    /// Whether a client-supplied address is blocked.
    ///
    /// Input that does not parse as an IP address is treated as blocked.
    pub fn contains(&self, ip: &str) -> bool {
        match ip.trim().parse::<IpAddr>() {
            Ok(addr) => self.contains_addr(addr),
            Err(_) => {
                debug!(ip = %ip, "Unparseable client address treated as blocked");
                true
            }
        }
    }

    /// Whether a parsed address is blocked.
    pub fn contains_addr(&self, addr: IpAddr) -> bool {
        let addr = addr.to_canonical();
        self.addresses.contains(&addr) || self.networks.iter().any(|net| net.contains(&addr))
    }

    /// Number of exact addresses.
    pub fn address_count(&self) -> usize {
        self.addresses.len()
    }

    /// Number of networks.
    pub fn network_count(&self) -> usize {
        self.networks.len()
    }

    /// Lines skipped as malformed during parsing.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

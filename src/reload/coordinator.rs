//! Building and publishing configuration snapshots.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::snapshot::ConfigSnapshot;
use crate::config::EdgeguardConfig;
use crate::error::{EdgeguardError, Result};
use crate::rules::{Artifact, BlocklistIndex, KeyRegistry, SignatureVerifier};

/// Counts describing a published snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReloadReport {
    /// Generation of the published snapshot
    pub generation: u64,
    /// Keys loaded
    pub keys: usize,
    /// Key records skipped as malformed
    pub skipped_keys: usize,
    /// Exact blocked addresses
    pub blocked_addresses: usize,
    /// Blocked networks
    pub blocked_networks: usize,
    /// Blocklist lines skipped as malformed
    pub skipped_lines: usize,
    /// When the snapshot was built
    pub loaded_at: DateTime<Utc>,
}

impl ReloadReport {
    fn describe(snapshot: &ConfigSnapshot) -> Self {
        Self {
            generation: snapshot.generation(),
            keys: snapshot.keys().len(),
            skipped_keys: snapshot.keys().skipped(),
            blocked_addresses: snapshot.blocklist().address_count(),
            blocked_networks: snapshot.blocklist().network_count(),
            skipped_lines: snapshot.blocklist().skipped(),
            loaded_at: snapshot.loaded_at(),
        }
    }
}

/// The files a snapshot is built from, and how to trust them.
#[derive(Debug, Clone)]
pub struct RuleSources {
    /// API key registry path
    pub keys_path: PathBuf,
    /// Blocklist path
    pub blocklist_path: PathBuf,
    /// Limits for records that name only a tier
    pub tier_limits: HashMap<String, u64>,
    /// Verifier for `# sig=` trailers
    pub verifier: Option<SignatureVerifier>,
    /// Reject sources without a trailer
    pub require_signatures: bool,
}

impl RuleSources {
    /// Derive rule sources from validated process configuration.
    pub fn from_config(config: &EdgeguardConfig) -> Result<Self> {
        let verifier = config
            .signing_secret()
            .map(SignatureVerifier::new)
            .transpose()?;

        Ok(Self {
            keys_path: config.sources.keys_path.clone(),
            blocklist_path: config.sources.blocklist_path.clone(),
            tier_limits: config.rate_limiting.tier_limits.clone(),
            verifier,
            require_signatures: config.signing.require_signatures,
        })
    }

    /// Parse and verify every source into registry and blocklist.
    pub fn load(&self) -> Result<(KeyRegistry, BlocklistIndex)> {
        let origin = self.keys_path.display().to_string();
        let text = read_source(&self.keys_path)?;
        let body = self.open(&origin, &text)?;
        let keys = KeyRegistry::parse(&origin, body, &self.tier_limits)?;

        let origin = self.blocklist_path.display().to_string();
        ensure_exists(&self.blocklist_path)?;
        let text = read_source(&self.blocklist_path)?;
        let body = self.open(&origin, &text)?;
        let blocklist = BlocklistIndex::parse(&origin, body);

        Ok((keys, blocklist))
    }

    fn open<'a>(&self, origin: &str, text: &'a str) -> Result<&'a str> {
        match &self.verifier {
            Some(verifier) => verifier.open(origin, text, self.require_signatures),
            None => match Artifact::parse(text) {
                Artifact::Signed { .. } => Err(EdgeguardError::signature(
                    origin,
                    "source is signed but no signing secret is configured",
                )),
                Artifact::Unsigned(_) if self.require_signatures => {
                    Err(EdgeguardError::signature(origin, "missing signature trailer"))
                }
                Artifact::Unsigned(body) => Ok(body),
            },
        }
    }
}

fn read_source(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| EdgeguardError::config(path.display().to_string(), format!("unreadable: {e}")))
}

fn ensure_exists(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    warn!(path = %path.display(), "Blocklist missing; creating an empty one");
    std::fs::write(path, "")
        .map_err(|e| EdgeguardError::config(path.display().to_string(), format!("cannot create: {e}")))
}

/// Owns the current [`ConfigSnapshot`] and replaces it on reload.
///
/// Readers take a cheap `Arc` clone under a short read lock and never hold
/// the lock while deciding. A failed reload leaves the current snapshot in place.
pub struct ReloadCoordinator {
    sources: RuleSources,
    current: RwLock<Arc<ConfigSnapshot>>,
    /// Serializes reloads so generations are published in order
    reload_lock: Mutex<()>,
}

impl ReloadCoordinator {
    /// Load the initial snapshot. Fails if any source is unusable.
    pub fn load(sources: RuleSources) -> Result<Self> {
        let (keys, blocklist) = sources.load()?;
        let snapshot = ConfigSnapshot::new(keys, blocklist, 1);
        info!(
            keys = snapshot.keys().len(),
            addresses = snapshot.blocklist().address_count(),
            networks = snapshot.blocklist().network_count(),
            "Initial rule snapshot loaded"
        );
        Ok(Self::with_snapshot(sources, snapshot))
    }

    /// Start from an already-built snapshot.
    pub fn with_snapshot(sources: RuleSources, snapshot: ConfigSnapshot) -> Self {
        Self {
            sources,
            current: RwLock::new(Arc::new(snapshot)),
            reload_lock: Mutex::new(()),
        }
    }

    /// The snapshot new requests should use.
    pub fn current(&self) -> Arc<ConfigSnapshot> {
        self.current.read().clone()
    }

    /// Rebuild from sources and publish if every source loads.
    pub fn reload(&self) -> Result<ReloadReport> {
        let _guard = self.reload_lock.lock();

        let (keys, blocklist) = match self.sources.load() {
            Ok(loaded) => loaded,
            Err(e) => {
                error!(
                    error = %e,
                    tampered = e.is_signature(),
                    generation = self.current().generation(),
                    "Reload rejected; keeping current snapshot"
                );
                return Err(e);
            }
        };

        let generation = self.current().generation() + 1;
        let snapshot = Arc::new(ConfigSnapshot::new(keys, blocklist, generation));
        let report = ReloadReport::describe(&snapshot);

        *self.current.write() = snapshot;

        info!(
            generation = report.generation,
            keys = report.keys,
            addresses = report.blocked_addresses,
            networks = report.blocked_networks,
            skipped_keys = report.skipped_keys,
            skipped_lines = report.skipped_lines,
            "Published new rule snapshot"
        );
        Ok(report)
    }

    /// Counts for the snapshot currently published.
    pub fn report(&self) -> ReloadReport {
        ReloadReport::describe(&self.current())
    }
}

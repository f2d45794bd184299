//! The admission decision: key, then blocklist, then quota.

use std::sync::Arc;
use tracing::{debug, error, instrument};

use super::decision::{Decision, ReasonCode, UsageReport};
use crate::config::EdgeguardConfig;
use crate::error::Result;
use crate::quota::{MemoryQuotaStore, QuotaBackend, QuotaCounter, QuotaOutcome, QuotaStore, SystemClock};
use crate::reload::{ConfigSnapshot, ReloadCoordinator, ReloadReport, RuleSources};

/// Composition root that answers admission queries.
///
/// Each call reads the current snapshot exactly once, so a concurrent reload
/// never mixes old keys with a new blocklist.
pub struct Gateway<S: QuotaStore = MemoryQuotaStore> {
    /// Owner of the current rule snapshot
    rules: Arc<ReloadCoordinator>,
    /// Per-key quota accounting
    quota: QuotaCounter<S>,
}

impl Gateway<QuotaBackend> {
    /// Build a gateway from process configuration, opening the configured usage store.
    pub fn from_config(config: &EdgeguardConfig) -> Result<Self> {
        config.validate()?;
        let sources = RuleSources::from_config(config)?;
        let rules = Arc::new(ReloadCoordinator::load(sources)?);
        let quota = QuotaCounter::with_store(
            QuotaBackend::from_config(&config.storage)?,
            Arc::new(SystemClock),
            config.rate_limiting.window,
            config.rate_limiting.retention_windows,
        );
        Ok(Self::new(rules, quota))
    }
}

impl<S: QuotaStore> Gateway<S> {
    /// Create a gateway over an existing coordinator and counter.
    pub fn new(rules: Arc<ReloadCoordinator>, quota: QuotaCounter<S>) -> Self {
        Self { rules, quota }
    }

    /// Decide whether a request from `source_ip` presenting `api_key` may proceed.
    ///
    /// Blocked traffic is refused before any quota is consumed.
    #[instrument(skip(self, api_key, source_ip), fields(ip = %source_ip))]
    pub async fn decide(&self, api_key: &str, source_ip: &str) -> Decision {
        let snapshot = self.rules.current();

        let Some(record) = snapshot.keys().lookup(api_key) else {
            debug!(generation = snapshot.generation(), "Unknown API key");
            return Decision::deny(ReasonCode::InvalidKey);
        };

        if record.limit == 0 {
            debug!(tier = %record.tier, "Tier disabled");
            return Decision::deny(ReasonCode::TierDisabled);
        }

        if snapshot.blocklist().contains(source_ip) {
            debug!(tier = %record.tier, "Source address blocked");
            return Decision::deny(ReasonCode::IpBlocked);
        }

        let decision = match self.quota.check_and_increment(&record.key, record.limit).await {
            Ok(QuotaOutcome::Allowed { remaining, .. }) => Decision::allow(remaining),
            Ok(QuotaOutcome::LimitExceeded { reset_after }) => Decision::quota_exceeded(reset_after),
            Ok(QuotaOutcome::TierDisabled) => Decision::deny(ReasonCode::TierDisabled),
            Err(e) => {
                error!(error = %e, tier = %record.tier, "Usage store failed; refusing request");
                Decision::deny(ReasonCode::StoreUnavailable)
            }
        };

        debug!(
            tier = %record.tier,
            reason = %decision.reason,
            remaining = decision.remaining,
            "Admission decision made"
        );
        decision
    }

    /// Current-window usage for `api_key`, or `None` if the key is unknown.
    ///
    /// Never modifies quota state.
    pub async fn usage(&self, api_key: &str) -> Result<Option<UsageReport>> {
        let snapshot = self.rules.current();
        let Some(record) = snapshot.keys().lookup(api_key) else {
            return Ok(None);
        };
        let used = self.quota.used_in_window(&record.key).await?;

        Ok(Some(UsageReport {
            tier: record.tier.clone(),
            limit: record.limit,
            used,
            remaining: record.limit.saturating_sub(used),
            window_start: self.quota.current_window_start(),
            reset_after_secs: self.quota.reset_after().as_secs(),
        }))
    }

    /// Rebuild rules from their sources; see [`ReloadCoordinator::reload`].
    pub fn reload(&self) -> Result<ReloadReport> {
        self.rules.reload()
    }

    /// The snapshot new requests will see.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.rules.current()
    }

    /// Get the rule coordinator.
    pub fn rules(&self) -> &Arc<ReloadCoordinator> {
        &self.rules
    }

    /// Get the quota counter.
    pub fn quota(&self) -> &QuotaCounter<S> {
        &self.quota
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::{ManualClock, TimeWindow};
    use crate::rules::{BlockEntry, BlocklistIndex, KeyRecord, KeyRegistry};
    use std::collections::HashMap;

    fn record(key: &str, tier: &str, limit: u64) -> KeyRecord {
        KeyRecord {
            key: key.to_string(),
            tier: tier.to_string(),
            limit,
        }
    }

    fn test_gateway() -> Gateway {
        let keys = KeyRegistry::from_records([
            record("good", "pro", 3),
            record("off", "suspended", 0),
        ]);
        let blocklist = BlocklistIndex::from_entries([
            "10.0.0.0/8".parse::<BlockEntry>().unwrap(),
            "203.0.113.9".parse::<BlockEntry>().unwrap(),
        ]);
        let sources = RuleSources {
            keys_path: "unused-keys.yaml".into(),
            blocklist_path: "unused-blocklist.txt".into(),
            tier_limits: HashMap::new(),
            verifier: None,
            require_signatures: false,
        };
        let rules = Arc::new(ReloadCoordinator::with_snapshot(
            sources,
            ConfigSnapshot::new(keys, blocklist, 1),
        ));
        let quota = QuotaCounter::with_store(
            MemoryQuotaStore::new(),
            Arc::new(ManualClock::new(1_200)),
            TimeWindow::Minute,
            2,
        );
        Gateway::new(rules, quota)
    }

    #[tokio::test]
    async fn test_unknown_key_denied() {
        let gateway = test_gateway();

        assert_eq!(gateway.decide("nope", "8.8.8.8").await, Decision::deny(ReasonCode::InvalidKey));
        assert_eq!(gateway.decide("", "8.8.8.8").await.reason, ReasonCode::InvalidKey);
    }

    #[tokio::test]
    async fn test_disabled_tier_denied() {
        let gateway = test_gateway();
        assert_eq!(gateway.decide("off", "8.8.8.8").await.reason, ReasonCode::TierDisabled);
    }

    #[tokio::test]
    async fn test_allowed_requests_count_down() {
        let gateway = test_gateway();

        for expected in [2, 1, 0] {
            let decision = gateway.decide("good", "8.8.8.8").await;
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected);
        }

        let decision = gateway.decide("good", "8.8.8.8").await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason, ReasonCode::QuotaExceeded);
        assert_eq!(decision.retry_after_secs, Some(60));
    }

    #[tokio::test]
    async fn test_blocked_traffic_consumes_no_quota() {
        let gateway = test_gateway();

        assert_eq!(gateway.decide("good", "10.1.2.3").await.reason, ReasonCode::IpBlocked);
        assert_eq!(gateway.decide("good", "203.0.113.9").await.reason, ReasonCode::IpBlocked);
        assert_eq!(gateway.decide("good", "garbage").await.reason, ReasonCode::IpBlocked);

        assert_eq!(gateway.usage("good").await.unwrap().unwrap().used, 0);
    }

    #[tokio::test]
    async fn test_usage_is_read_only() {
        let gateway = test_gateway();
        gateway.decide("good", "8.8.8.8").await;

        let first = gateway.usage("good").await.unwrap().unwrap();
        let second = gateway.usage("good").await.unwrap().unwrap();

        assert_eq!(first, second);
        assert_eq!(first.used, 1);
        assert_eq!(first.remaining, 2);
        assert_eq!(first.limit, 3);
        assert_eq!(first.tier, "pro");
        assert_eq!(first.window_start, 1_200);
    }

    struct UnavailableStore;

    #[async_trait::async_trait]
    impl QuotaStore for UnavailableStore {
        async fn check_and_increment(
            &self,
            _: &str,
            _: u64,
            _: u64,
        ) -> Result<crate::quota::StoreOutcome> {
            Err(std::io::Error::other("disk gone").into())
        }

        async fn current_count(&self, _: &str, _: u64) -> Result<u64> {
            Err(std::io::Error::other("disk gone").into())
        }

        async fn purge_before(&self, _: u64) -> Result<usize> {
            Ok(0)
        }

        async fn windows(&self) -> Result<Vec<crate::quota::UsageWindow>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_store_failure_refuses_request() {
        let gateway = test_gateway();
        let failing = Gateway::new(
            gateway.rules().clone(),
            QuotaCounter::with_store(
                UnavailableStore,
                Arc::new(ManualClock::new(1_200)),
                TimeWindow::Minute,
                2,
            ),
        );

        let decision = failing.decide("good", "8.8.8.8").await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason, ReasonCode::StoreUnavailable);

        // Checks that never reach the store are unaffected.
        assert_eq!(failing.decide("nope", "8.8.8.8").await.reason, ReasonCode::InvalidKey);
        assert!(failing.usage("good").await.is_err());
    }

    #[tokio::test]
    async fn test_usage_unknown_key() {
        assert!(test_gateway().usage("nope").await.unwrap().is_none());
    }
}

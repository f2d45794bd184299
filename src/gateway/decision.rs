//! Admission decisions and usage reports.

use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Why a request was admitted or refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    /// Admitted; one unit of quota consumed
    Allowed,
    /// Missing or unknown API key
    InvalidKey,
    /// The key's tier has a zero limit
    TierDisabled,
    /// The source address is on the blocklist or unparseable
    IpBlocked,
    /// The key's quota for the current window is spent
    QuotaExceeded,
    /// The usage store failed; the request is refused rather than uncounted
    StoreUnavailable,
}

impl ReasonCode {
    /// HTTP status the transport layer should answer with.
    pub fn http_status(self) -> u16 {
        match self {
            ReasonCode::Allowed => 200,
            ReasonCode::InvalidKey => 401,
            ReasonCode::TierDisabled | ReasonCode::IpBlocked => 403,
            ReasonCode::QuotaExceeded => 429,
            ReasonCode::StoreUnavailable => 503,
        }
    }

    /// Whether the same request can succeed later without operator action.
    pub fn is_retryable(self) -> bool {
        matches!(self, ReasonCode::QuotaExceeded | ReasonCode::StoreUnavailable)
    }

    /// Stable snake_case name.
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::Allowed => "allowed",
            ReasonCode::InvalidKey => "invalid_key",
            ReasonCode::TierDisabled => "tier_disabled",
            ReasonCode::IpBlocked => "ip_blocked",
            ReasonCode::QuotaExceeded => "quota_exceeded",
            ReasonCode::StoreUnavailable => "store_unavailable",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The answer to one admission query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Why
    pub reason: ReasonCode,
    /// Units left in the current window; 0 on denials that never reached the quota
    pub remaining: u64,
    /// Seconds until the window resets, on quota denials
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl Decision {
    /// An admitted request.
    pub fn allow(remaining: u64) -> Self {
        Self {
            allowed: true,
            reason: ReasonCode::Allowed,
            remaining,
            retry_after_secs: None,
        }
    }

    /// A refused request that never touched the quota.
    pub fn deny(reason: ReasonCode) -> Self {
        Self {
            allowed: false,
            reason,
            remaining: 0,
            retry_after_secs: None,
        }
    }

    /// A request refused because the window is spent.
    pub fn quota_exceeded(reset_after: Duration) -> Self {
        Self {
            allowed: false,
            reason: ReasonCode::QuotaExceeded,
            remaining: 0,
            // Round up so a client never retries inside the same window.
            retry_after_secs: Some(reset_after.as_secs() + u64::from(reset_after.subsec_nanos() > 0)),
        }
    }
}

/// Read-only view of a key's consumption in the current window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageReport {
    /// Tier label
    pub tier: String,
    /// Requests per window
    pub limit: u64,
    /// Units consumed in the current window
    pub used: u64,
    /// `max(limit - used, 0)`
    pub remaining: u64,
    /// Start of the current window (epoch seconds)
    pub window_start: u64,
    /// Seconds until the window resets
    pub reset_after_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_http_mapping() {
        assert_eq!(ReasonCode::Allowed.http_status(), 200);
        assert_eq!(ReasonCode::InvalidKey.http_status(), 401);
        assert_eq!(ReasonCode::TierDisabled.http_status(), 403);
        assert_eq!(ReasonCode::IpBlocked.http_status(), 403);
        assert_eq!(ReasonCode::QuotaExceeded.http_status(), 429);
        assert_eq!(ReasonCode::StoreUnavailable.http_status(), 503);
    }

    #[test]
    fn test_only_transient_reasons_are_retryable() {
        assert!(ReasonCode::QuotaExceeded.is_retryable());
        assert!(ReasonCode::StoreUnavailable.is_retryable());
        assert!(!ReasonCode::InvalidKey.is_retryable());
        assert!(!ReasonCode::IpBlocked.is_retryable());
        assert!(!ReasonCode::TierDisabled.is_retryable());
    }

    #[test]
    fn test_decision_serialization() {
        let json = serde_json::to_value(Decision::quota_exceeded(Duration::from_secs(12))).unwrap();

        assert_eq!(json["allowed"], false);
        assert_eq!(json["reason"], "quota_exceeded");
        assert_eq!(json["retry_after_secs"], 12);

        let json = serde_json::to_value(Decision::allow(3)).unwrap();
        assert_eq!(json["reason"], "allowed");
        assert!(json.get("retry_after_secs").is_none());
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let decision = Decision::quota_exceeded(Duration::from_millis(1500));
        assert_eq!(decision.retry_after_secs, Some(2));
    }
}

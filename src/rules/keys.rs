//! API key registry parsing and lookup.
//!
//! Two source shapes are accepted, in YAML or JSON:
//!
//! ```yaml
//! # a sequence of records
//! - key: "abc123"
//!   tier: pro
//!   limit: 300
//! ```
//!
//! ```json
//! {"abc123": {"tier": "pro", "owner": "acme"}}
//! ```
//!
//! A record without `limit` takes its tier's limit; an unknown tier gets 0,
//! which disables the key. Malformed records are skipped with a warning.

use serde::Serialize;
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;
use tracing::warn;

use crate::error::{EdgeguardError, Result};

/// Tier assumed when a record does not name one.
pub const DEFAULT_TIER: &str = "free";

/// A single API key and its quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyRecord {
    /// The API key, normalized
    pub key: String,
    /// Tier label
    pub tier: String,
    /// Requests per window; 0 disables the key
    pub limit: u64,
}

/// Immutable key lookup table built from one source.
#[derive(Debug, Clone, Default)]
pub struct KeyRegistry {
    records: HashMap<String, KeyRecord>,
    skipped: usize,
}

impl KeyRegistry {
    /// Parse a registry from YAML or JSON text.
    ///
    /// Fails if the text is not a sequence or mapping, if two records share a
    /// key, or if no record survives validation.
    pub fn parse(origin: &str, text: &str, tier_limits: &HashMap<String, u64>) -> Result<Self> {
        let document: Value = serde_yaml::from_str(text)
            .map_err(|e| EdgeguardError::config(origin, format!("unparseable key source: {e}")))?;

        let candidates: Vec<(usize, std::result::Result<KeyRecord, String>)> = match &document {
            Value::Sequence(items) => items
                .iter()
                .enumerate()
                .map(|(idx, item)| (idx, parse_record(item, None, tier_limits)))
                .collect(),
            Value::Mapping(entries) => entries
                .iter()
                .enumerate()
                .map(|(idx, (name, item))| {
                    let outcome = match name.as_str() {
                        Some(name) => parse_record(item, Some(name), tier_limits),
                        None => Err("mapping key is not a string".to_string()),
                    };
                    (idx, outcome)
                })
                .collect(),
            Value::Null => Vec::new(),
            _ => {
                return Err(EdgeguardError::config(
                    origin,
                    "expected a sequence of key records or a mapping of keys",
                ))
            }
        };

        let mut registry = KeyRegistry::default();
        for (idx, outcome) in candidates {
            match outcome {
                Ok(record) => {
                    if registry.records.contains_key(&record.key) {
                        return Err(EdgeguardError::config(
                            origin,
                            format!("duplicate key at record {idx}"),
                        ));
                    }
                    registry.records.insert(record.key.clone(), record);
                }
                Err(reason) => {
                    warn!(origin = %origin, record = idx, reason = %reason, "Skipping malformed key record");
                    registry.skipped += 1;
                }
            }
        }

        if registry.records.is_empty() {
            return Err(EdgeguardError::config(
                origin,
                format!("no valid key records ({} skipped)", registry.skipped),
            ));
        }

        Ok(registry)
    }

    /// Build a registry directly from records. Later duplicates are ignored.
    pub fn from_records(records: impl IntoIterator<Item = KeyRecord>) -> Self {
        let mut map = HashMap::new();
        for record in records {
            map.entry(record.key.clone()).or_insert(record);
        }
        Self {
            records: map,
            skipped: 0,
        }
    }

    /// Look up a key exactly as presented.
    pub fn lookup(&self, key: &str) -> Option<&KeyRecord> {
        self.records.get(key)
    }

    /// Get the number of loaded keys.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the registry holds no keys.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records skipped as malformed during parsing.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

/// Strip whitespace and one layer of surrounding quotes from a raw key.
pub fn normalize_key(raw: &str) -> &str {
    let trimmed = raw.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = trimmed
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner.trim();
        }
    }
    trimmed
}

fn parse_record(
    item: &Value,
    mapped_key: Option<&str>,
    tier_limits: &HashMap<String, u64>,
) -> std::result::Result<KeyRecord, String> {
    let fields = match item {
        Value::Mapping(fields) => Some(fields),
        // `{"abc": null}` in the mapping shape means a bare key on the default tier.
        Value::Null if mapped_key.is_some() => None,
        _ => return Err("record is not a mapping".to_string()),
    };
    let get = |name: &str| field(fields, name);

    let raw_key = match (mapped_key, get("key")) {
        (_, Some(Value::String(key))) => key.as_str(),
        (Some(key), None) => key,
        (_, Some(_)) => return Err("key is not a string".to_string()),
        (None, None) => return Err("missing key".to_string()),
    };
    let key = normalize_key(raw_key);
    if key.is_empty() {
        return Err("empty key".to_string());
    }

    let tier = match get("tier") {
        None | Some(Value::Null) => DEFAULT_TIER.to_string(),
        Some(Value::String(tier)) => normalize_key(tier).to_string(),
        Some(_) => return Err("tier is not a string".to_string()),
    };

    let limit = match get("limit") {
        None | Some(Value::Null) => tier_limits.get(&tier).copied().unwrap_or(0),
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| format!("limit {n} is not a non-negative integer"))?,
        Some(_) => return Err("limit is not numeric".to_string()),
    };

    Ok(KeyRecord {
        key: key.to_string(),
        tier,
        limit,
    })
}

fn field<'a>(fields: Option<&'a Mapping>, name: &str) -> Option<&'a Value> {
    fields.and_then(|f| f.get(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiers() -> HashMap<String, u64> {
        HashMap::from([("free".to_string(), 30), ("pro".to_string(), 300)])
    }

    #[test]
    fn test_parse_record_sequence() {
        let yaml = r#"
- key: alpha
  tier: pro
  limit: 5
- key: beta
  tier: free
"#;
        let registry = KeyRegistry::parse("keys", yaml, &tiers()).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.lookup("alpha").unwrap().limit, 5);
        assert_eq!(registry.lookup("beta").unwrap().limit, 30);
    }

    #[test]
    fn test_parse_json_mapping() {
        let json = r#"{"k1": {"tier": "pro", "owner": "acme"}, "k2": {"tier": "gold"}}"#;
        let registry = KeyRegistry::parse("keys.json", json, &tiers()).unwrap();

        let k1 = registry.lookup("k1").unwrap();
        assert_eq!(k1.tier, "pro");
        assert_eq!(k1.limit, 300);
        // Unknown tiers are disabled.
        assert_eq!(registry.lookup("k2").unwrap().limit, 0);
    }

    #[test]
    fn test_keys_are_trimmed_of_quotes_and_whitespace() {
        let yaml = r#"
- key: "  'quoted-key'  "
  tier: free
"#;
        let registry = KeyRegistry::parse("keys", yaml, &tiers()).unwrap();
        assert!(registry.lookup("quoted-key").is_some());
    }

    #[test]
    fn test_malformed_records_are_skipped() {
        let yaml = r#"
- key: good
- tier: pro
- key: bad-limit
  limit: lots
- key: negative
  limit: -1
- just-a-string
"#;
        let registry = KeyRegistry::parse("keys", yaml, &tiers()).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.skipped(), 4);
        assert!(registry.lookup("good").is_some());
    }

    #[test]
    fn test_all_malformed_is_an_error() {
        let yaml = "- tier: pro\n- limit: 3\n";
        let err = KeyRegistry::parse("keys", yaml, &tiers()).unwrap_err();
        assert!(matches!(err, EdgeguardError::Config { .. }));
    }

    #[test]
    fn test_empty_source_is_an_error() {
        assert!(KeyRegistry::parse("keys", "", &tiers()).is_err());
    }

    #[test]
    fn test_unparseable_source_is_an_error() {
        assert!(KeyRegistry::parse("keys", "{not: [valid", &tiers()).is_err());
        assert!(KeyRegistry::parse("keys", "42", &tiers()).is_err());
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let yaml = r#"
- key: same
  tier: free
- key: '"same"'
  tier: pro
"#;
        let err = KeyRegistry::parse("keys", yaml, &tiers()).unwrap_err();
        assert!(err.to_string().contains("duplicate key"));
    }

    #[test]
    fn test_lookup_unknown_key() {
        let registry = KeyRegistry::parse("keys", "- key: a\n", &tiers()).unwrap();
        assert!(registry.lookup("b").is_none());
    }

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("  abc "), "abc");
        assert_eq!(normalize_key("\"abc\""), "abc");
        assert_eq!(normalize_key("'abc'"), "abc");
        assert_eq!(normalize_key("\"abc"), "\"abc");
    }
}

//! Line protocol spoken by the sidecar.
//!
//! Requests are single lines of whitespace-separated words:
//!
//! ```text
//! decide <api-key> <source-ip>
//! usage <api-key>
//! reload
//! health
//! ```
//!
//! Every request gets exactly one JSON object on one line in reply.

use serde::Serialize;
use std::str::FromStr;

use crate::error::EdgeguardError;
use crate::gateway::{Decision, UsageReport};
use crate::reload::ReloadReport;

/// A parsed request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Admission query
    Decide {
        /// Presented API key
        api_key: String,
        /// Client address as reported by the transport
        source_ip: String,
    },
    /// Read-only usage query
    Usage {
        /// API key to report on
        api_key: String,
    },
    /// Rebuild rules from their sources
    Reload,
    /// Liveness probe
    Health,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or("empty request")?;

        let command = match verb.to_ascii_lowercase().as_str() {
            "decide" => {
                let api_key = words.next().ok_or("decide requires <api-key> <source-ip>")?;
                let source_ip = words.next().ok_or("decide requires <api-key> <source-ip>")?;
                Command::Decide {
                    api_key: api_key.to_string(),
                    source_ip: source_ip.to_string(),
                }
            }
            "usage" => {
                let api_key = words.next().ok_or("usage requires <api-key>")?;
                Command::Usage {
                    api_key: api_key.to_string(),
                }
            }
            "reload" => Command::Reload,
            "health" => Command::Health,
            other => return Err(format!("unknown command {other:?}")),
        };

        if words.next().is_some() {
            return Err(format!("too many arguments for {verb}"));
        }
        Ok(command)
    }
}

/// One reply line.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Reply {
    /// Answer to `decide`
    Decision(Decision),
    /// Answer to `usage`
    Usage(UsageReport),
    /// Answer to a successful `reload`
    Reloaded(ReloadReport),
    /// Answer to `health`
    Health {
        /// Always "up"
        status: &'static str,
        /// Generation of the current snapshot
        generation: u64,
    },
    /// Any failure
    Error {
        /// Human-readable description
        error: String,
        /// Failure class, when one applies
        #[serde(skip_serializing_if = "Option::is_none")]
        kind: Option<&'static str>,
    },
}

impl Reply {
    /// A failure reply without a class.
    pub fn error(message: impl Into<String>) -> Self {
        Reply::Error {
            error: message.into(),
            kind: None,
        }
    }

    /// Encode as a single JSON line, newline included.
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self)
            .unwrap_or_else(|e| format!("{{\"error\":\"unencodable reply: {e}\"}}"));
        line.push('\n');
        line
    }
}

impl From<EdgeguardError> for Reply {
    fn from(err: EdgeguardError) -> Self {
        let kind = match &err {
            EdgeguardError::Signature { .. } => "signature",
            EdgeguardError::Config { .. } | EdgeguardError::Settings(_) => "config",
            EdgeguardError::Store(_) => "store",
            EdgeguardError::Io(_) => "io",
        };
        Reply::Error {
            error: err.to_string(),
            kind: Some(kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_decide() {
        assert_eq!(
            "decide abc 1.2.3.4".parse::<Command>().unwrap(),
            Command::Decide {
                api_key: "abc".to_string(),
                source_ip: "1.2.3.4".to_string()
            }
        );
        assert_eq!(
            "  DECIDE abc   ::1 ".parse::<Command>().unwrap(),
            Command::Decide {
                api_key: "abc".to_string(),
                source_ip: "::1".to_string()
            }
        );
    }

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!("reload".parse::<Command>().unwrap(), Command::Reload);
        assert_eq!("health".parse::<Command>().unwrap(), Command::Health);
        assert_eq!(
            "usage abc".parse::<Command>().unwrap(),
            Command::Usage {
                api_key: "abc".to_string()
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!("".parse::<Command>().is_err());
        assert!("decide abc".parse::<Command>().is_err());
        assert!("usage".parse::<Command>().is_err());
        assert!("reload now".parse::<Command>().is_err());
        assert!("explode".parse::<Command>().is_err());
    }

    #[test]
    fn test_error_reply_line() {
        let line = Reply::from(EdgeguardError::signature("keys.yaml", "signature mismatch")).to_line();
        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();

        assert!(line.ends_with('\n'));
        assert_eq!(value["kind"], "signature");
        assert!(value["error"].as_str().unwrap().contains("keys.yaml"));
    }

    #[test]
    fn test_health_reply_shape() {
        let line = Reply::Health {
            status: "up",
            generation: 4,
        }
        .to_line();
        assert_eq!(line, "{\"status\":\"up\",\"generation\":4}\n");
    }
}

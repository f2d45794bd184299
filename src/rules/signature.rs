//! HMAC-SHA256 signing for rule and configuration files.
//!
//! A signed artifact is the original content with trailing newlines removed,
//! a newline, then a trailer line `# sig=<hex>`. The MAC covers exactly the
//! bytes before that trailer newline. Because the trailer is a `#` comment it
//! stays inert for both blocklist and YAML parsers.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{EdgeguardError, Result};

/// Prefix of the trailer line carrying the hex signature.
pub const SIGNATURE_PREFIX: &str = "# sig=";

/// Placeholder secret that is only acceptable in development deployments.
pub const DEV_PLACEHOLDER_SECRET: &str = "dev-key-change";

type HmacSha256 = Hmac<Sha256>;

/// A rule artifact split into its body and optional signature trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact<'a> {
    /// Content followed by a `# sig=` trailer.
    Signed {
        /// Content covered by the signature
        body: &'a str,
        /// Hex signature from the trailer
        signature: &'a str,
    },
    /// Content without a trailer.
    Unsigned(&'a str),
}

impl<'a> Artifact<'a> {
    /// Split `text` into body and trailer.
    ///
    /// Only the last non-blank line is considered a trailer.
    pub fn parse(text: &'a str) -> Self {
        let trimmed = text.trim_end_matches('\n');
        let (head, last_line) = match trimmed.rfind('\n') {
            Some(idx) => (&trimmed[..idx], &trimmed[idx + 1..]),
            None => ("", trimmed),
        };

        match last_line.trim_end_matches('\r').strip_prefix(SIGNATURE_PREFIX) {
            Some(signature) => Artifact::Signed {
                body: head.trim_end_matches('\n'),
                signature: signature.trim(),
            },
            None => Artifact::Unsigned(text),
        }
    }

    /// The content with any trailer removed.
    pub fn body(&self) -> &'a str {
        match *self {
            Artifact::Signed { body, .. } => body,
            Artifact::Unsigned(body) => body,
        }
    }
}

/// Produces and checks HMAC-SHA256 signatures under one secret.
#[derive(Clone)]
pub struct SignatureVerifier {
    mac: HmacSha256,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier").finish_non_exhaustive()
    }
}

impl SignatureVerifier {
    /// Create a verifier keyed with `secret`.
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self> {
        let mac = HmacSha256::new_from_slice(secret.as_ref())
            .map_err(|e| EdgeguardError::signature("signing secret", e.to_string()))?;
        Ok(Self { mac })
    }

    /// Hex HMAC over `content` with trailing newlines stripped.
    pub fn sign(&self, content: &[u8]) -> String {
        let mut mac = self.mac.clone();
        mac.update(strip_trailing_newlines(content));
        hex::encode(mac.finalize().into_bytes())
    }

    /// Check `signature_hex` against `content` in constant time.
    pub fn verify(&self, content: &[u8], signature_hex: &str) -> bool {
        let Ok(expected) = hex::decode(signature_hex.trim()) else {
            return false;
        };
        let mut mac = self.mac.clone();
        mac.update(strip_trailing_newlines(content));
        mac.verify_slice(&expected).is_ok()
    }

    /// Produce a signed artifact from `text`, replacing any existing trailer.
    pub fn seal(&self, text: &str) -> String {
        let body = Artifact::parse(text).body().trim_end_matches('\n');
        let signature = self.sign(body.as_bytes());
        format!("{body}\n{SIGNATURE_PREFIX}{signature}\n")
    }

    /// Verify a signed artifact and return its body.
    ///
    /// Unsigned text is returned as-is unless `require` is set.
    pub fn open<'a>(&self, origin: &str, text: &'a str, require: bool) -> Result<&'a str> {
        match Artifact::parse(text) {
            Artifact::Signed { body, signature } => {
                if self.verify(body.as_bytes(), signature) {
                    Ok(body)
                } else {
                    Err(EdgeguardError::signature(origin, "signature mismatch"))
                }
            }
            Artifact::Unsigned(_) if require => {
                Err(EdgeguardError::signature(origin, "missing signature trailer"))
            }
            Artifact::Unsigned(body) => Ok(body),
        }
    }
}

fn strip_trailing_newlines(content: &[u8]) -> &[u8] {
    let end = content
        .iter()
        .rposition(|b| *b != b'\n')
        .map_or(0, |idx| idx + 1);
    &content[..end]
}

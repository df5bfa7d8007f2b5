//! Content fingerprints that bind approvals to exact query text.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Characters of the hex digest shown to the operator.
const SHORT_LEN: usize = 12;

/// SHA-256 of the query text, hex encoded.
///
/// Hashing is byte-exact: no whitespace or case normalization, so any edit at
/// all yields a different fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(text: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Full 64-character hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading characters of the digest, for display.
    pub fn short(&self) -> &str {
        &self.0[..SHORT_LEN.min(self.0.len())]
    }

    pub fn matches(&self, text: &str) -> bool {
        *self == Self::of(text)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.short())
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use sqlflow_core::TaskSnapshot;

/// Bumped whenever the hashed material changes shape, so old shared entries
/// stop matching.
const FINGERPRINT_VERSION: u32 = 1;

/// SHA-256 hex digest identifying one stage invocation.
///
/// Equal inputs give equal fingerprints across processes and runs: the hashed
/// material is canonical JSON (object keys sorted) of the stage name, the
/// stage's bound config and the task snapshot minus the task id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(stage: &str, config: &Value, snapshot: &TaskSnapshot) -> Self {
        let material = json!({
            "v": FINGERPRINT_VERSION,
            "stage": stage,
            "config": config,
            "snapshot": snapshot.cache_material(),
        });
        let digest = Sha256::digest(material.to_string().as_bytes());
        Self(format!("{digest:x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stable numeric spread of the digest, used for shard selection.
    pub fn shard_key(&self) -> u64 {
        self.0
            .get(..16)
            .and_then(|prefix| u64::from_str_radix(prefix, 16).ok())
            .unwrap_or(0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
impl From<&str> for Fingerprint {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

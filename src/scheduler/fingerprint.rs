use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::scheduler::job::SliceParams;

/// Content hash of a model and its slicing parameters; the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// SHA-256 over the model length, the model bytes and the JSON form of
    /// the parameters. The length prefix keeps `(model, params)` pairs from
    /// colliding when one model is a prefix of another.
    pub fn compute(model: &[u8], params: &SliceParams) -> Self {
        let mut hasher = Sha256::new();
        hasher.update((model.len() as u64).to_le_bytes());
        hasher.update(model);
        // SliceParams only holds strings, integers and a BTreeMap
        let canonical = serde_json::to_vec(params).unwrap_or_default();
        hasher.update(&canonical);
        let hash = hasher.finalize();
        Self(format!("{hash:x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        let params = SliceParams::default().with_override("layer_height", "0.2");
        let a = Fingerprint::compute(b"solid cube", &params);
        let b = Fingerprint::compute(b"solid cube", &params);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn params_change_fingerprint() {
        let base = SliceParams::default();
        let other = SliceParams {
            plate: Some(2),
            ..Default::default()
        };
        assert_ne!(
            Fingerprint::compute(b"solid cube", &base),
            Fingerprint::compute(b"solid cube", &other)
        );
    }

    #[test]
    fn model_change_fingerprint() {
        let params = SliceParams::default();
        assert_ne!(
            Fingerprint::compute(b"solid cube", &params),
            Fingerprint::compute(b"solid sphere", &params)
        );
    }
}

//! Stage fingerprints.
//!
//! A [`StageKey`] is a SHA-256 over a canonical, length-prefixed encoding of
//! (scope tag, input content hash, named stage parameters). Parameters are
//! sorted by name before hashing so the order callers add them in does not
//! matter.

use super::CacheScope;
use sha2::{Digest, Sha256};
use std::fmt;

const KEY_DOMAIN: &[u8] = b"gemini-search-mcp/stage-key/v1";

/// Hex-encoded SHA-256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Deterministic identifier of one cacheable unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StageKey {
    scope: CacheScope,
    hex: String,
}

impl StageKey {
    /// Start a key for `scope` over content whose hash is `input_hash`.
    pub fn builder(scope: CacheScope, input_hash: impl Into<String>) -> StageKeyBuilder {
        StageKeyBuilder {
            scope,
            input_hash: input_hash.into(),
            params: Vec::new(),
        }
    }

    pub fn scope(&self) -> CacheScope {
        self.scope
    }

    /// 64-character lowercase hex fingerprint.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Two-character shard directory.
    pub(crate) fn shard(&self) -> &str {
        &self.hex[..2]
    }
}

impl fmt::Display for StageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.hex)
    }
}

#[derive(Debug, Clone)]
pub struct StageKeyBuilder {
    scope: CacheScope,
    input_hash: String,
    params: Vec<(String, String)>,
}

impl StageKeyBuilder {
    pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.push((name.into(), value.to_string()));
        self
    }

    pub fn build(mut self) -> StageKey {
        self.params.sort();

        let mut hasher = Sha256::new();
        write_field(&mut hasher, KEY_DOMAIN);
        write_field(&mut hasher, self.scope.as_str().as_bytes());
        write_field(&mut hasher, self.input_hash.as_bytes());
        for (name, value) in &self.params {
            write_field(&mut hasher, name.as_bytes());
            write_field(&mut hasher, value.as_bytes());
        }

        StageKey {
            scope: self.scope,
            hex: hex::encode(hasher.finalize()),
        }
    }
}

fn write_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_inputs_same_key() {
        let a = StageKey::builder(CacheScope::Caption, content_hash(b"png"))
            .param("model", "gemini-2.5-flash-lite")
            .param("prompt_version", 2)
            .build();
        let b = StageKey::builder(CacheScope::Caption, content_hash(b"png"))
            .param("prompt_version", 2)
            .param("model", "gemini-2.5-flash-lite")
            .build();
        assert_eq!(a, b);
        assert_eq!(a.hex().len(), 64);
    }

    #[test]
    fn parameters_change_the_key() {
        let base = StageKey::builder(CacheScope::Caption, content_hash(b"png"));
        let a = base.clone().param("model", "a").build();
        let b = base.param("model", "b").build();
        assert_ne!(a, b);
    }

    #[test]
    fn scope_changes_the_key() {
        let h = content_hash(b"%PDF-1.7");
        let a = StageKey::builder(CacheScope::Normalize, h.clone()).build();
        let b = StageKey::builder(CacheScope::Extract, h).build();
        assert_ne!(a.hex(), b.hex());
    }

    #[test]
    fn length_prefix_prevents_concatenation_collisions() {
        let a = StageKey::builder(CacheScope::Answer, "x")
            .param("ab", "c")
            .build();
        let b = StageKey::builder(CacheScope::Answer, "x")
            .param("a", "bc")
            .build();
        assert_ne!(a, b);
    }
}

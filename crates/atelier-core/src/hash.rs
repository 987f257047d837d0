//! Prompt fingerprints for cache lookup and in-flight deduplication

use crate::types::AssetType;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A SHA-256 hash over an asset type and its fully-resolved prompt.
///
/// Two requests with the same fingerprint are the same billable
/// generation; the cache and the in-flight table are both keyed by it.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint a prompt for the given asset type.
    ///
    /// Whitespace is collapsed first so cosmetic differences in template
    /// output do not defeat the cache.
    pub fn compute(asset_type: AssetType, prompt: &str) -> Self {
        let resolved = resolve_prompt(prompt);
        let mut hasher = Sha256::new();
        hasher.update(asset_type.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(resolved.as_bytes());
        Self(hasher.finalize().into())
    }

    /// Get the hash as a hex string
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse a 64-character hex string back into a Fingerprint
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 64 {
            return None;
        }
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(hex.get(i * 2..i * 2 + 2)?, 16).ok()?;
        }
        Some(Self(bytes))
    }
}

/// Collapse runs of whitespace and trim the ends.
pub(crate) fn resolve_prompt(prompt: &str) -> String {
    prompt.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consistent_hashing() {
        let h1 = Fingerprint::compute(AssetType::Icon, "Legal Documents icon");
        let h2 = Fingerprint::compute(AssetType::Icon, "Legal Documents icon");
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_asset_type_changes_fingerprint() {
        let icon = Fingerprint::compute(AssetType::Icon, "Legal Documents");
        let cover = Fingerprint::compute(AssetType::Cover, "Legal Documents");
        assert_ne!(icon, cover);
    }

    #[test]
    fn test_whitespace_is_normalized() {
        let a = Fingerprint::compute(AssetType::Icon, "  Legal   Documents\n icon ");
        let b = Fingerprint::compute(AssetType::Icon, "Legal Documents icon");
        assert_eq!(a, b);
    }

    #[test]
    fn test_hex_roundtrip() {
        let h = Fingerprint::compute(AssetType::Cover, "Quarterly planning cover");
        let hex = h.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(Fingerprint::from_hex(&hex), Some(h));
    }

    #[test]
    fn test_from_hex_invalid() {
        assert!(Fingerprint::from_hex("abc").is_none());
        assert!(Fingerprint::from_hex(&"zz".repeat(32)).is_none());
    }
}

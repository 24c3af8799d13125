//! Deterministic cache addressing.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Cache key derived from an operation's semantic content.
///
/// The entity name is kept alongside the content digest so invalidation can
/// match structurally (all keys for an entity) without re-deriving anything.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub entity: String,
    /// Hex-encoded SHA-256 of the canonical operation encoding.
    pub digest: String,
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = &self.digest[..self.digest.len().min(12)];
        write!(f, "{}:{}", self.entity, short)
    }
}

/// Structural pattern for cache invalidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPattern {
    /// Every entry.
    All,
    /// Every entry for one entity.
    Entity(String),
}

impl KeyPattern {
    pub fn matches(&self, key: &CacheKey) -> bool {
        match self {
            KeyPattern::All => true,
            KeyPattern::Entity(entity) => key.entity == *entity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(entity: &str, digest: &str) -> CacheKey {
        CacheKey {
            entity: entity.to_string(),
            digest: digest.to_string(),
        }
    }

    #[test]
    fn test_pattern_matching() {
        let invoice = key("invoice", "abc123");
        let partner = key("partner", "def456");

        assert!(KeyPattern::All.matches(&invoice));
        assert!(KeyPattern::All.matches(&partner));
        assert!(KeyPattern::Entity("invoice".into()).matches(&invoice));
        assert!(!KeyPattern::Entity("invoice".into()).matches(&partner));
    }

    #[test]
    fn test_display_truncates_digest() {
        let k = key("invoice", "0123456789abcdef0123456789abcdef");
        assert_eq!(k.to_string(), "invoice:0123456789ab");
    }
}

//! Keyed result cache shared by the TTS and translation wrappers.

use crate::db::{self, CacheEntry, CacheStats, Database};
use crate::error::{AppError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

/// Cache kind of synthesized audio.
pub const TTS: &str = "tts";

/// Cache kind of translations.
pub const TRANSLATION: &str = "translation";

/// SHA-256 hex over the parts joined with a unit separator.
pub fn cache_key(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parts.join("\u{1f}").as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Typed access to the cache table.
#[derive(Clone)]
pub struct CacheStore {
    db: Database,
}

impl CacheStore {
    /// Create the store.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Cached value, counting the hit. Undecodable payloads count as a miss.
    pub fn get<T: DeserializeOwned>(&self, kind: &str, key: &str) -> Result<Option<T>> {
        let Some(entry) = self.db.cache_get(kind, key)? else {
            return Ok(None);
        };

        match serde_json::from_str(&entry.payload) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(kind, key, error = %e, "Dropping unreadable cache payload");
                Ok(None)
            }
        }
    }

    /// Store a value, replacing any previous one.
    pub fn put<T: Serialize>(&self, kind: &str, key: &str, value: &T) -> Result<()> {
        let payload = serde_json::to_string(value)
            .map_err(|e| AppError::Internal(format!("Failed to encode cache payload: {}", e)))?;
        self.db.cache_put(kind, key, &payload)
    }

    /// Remove entries idle for `days` days; returns what was removed.
    pub fn cleanup(&self, kind: &str, days: u32) -> Result<Vec<CacheEntry>> {
        let cutoff = db::now_timestamp() - i64::from(days) * 86_400;
        let removed = self.db.cache_remove_before(kind, cutoff)?;
        if !removed.is_empty() {
            tracing::info!(kind, count = removed.len(), days, "Cache cleanup");
        }
        Ok(removed)
    }

    /// Entry count, hits and age range.
    pub fn stats(&self, kind: &str) -> Result<CacheStats> {
        self.db.cache_stats(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        text: String,
    }

    #[test]
    fn key_is_sha256_hex() {
        let key = cache_key(&["a", "b"]);
        assert_eq!(key.len(), 64);
        assert_eq!(key, cache_key(&["a", "b"]));
        assert_ne!(key, cache_key(&["ab"]));
        assert_ne!(key, cache_key(&["b", "a"]));
    }

    #[test]
    fn put_get_and_stats() {
        let store = CacheStore::new(Database::open_memory().unwrap());
        let value = Payload { text: "hola".into() };

        assert_eq!(store.get::<Payload>(TRANSLATION, "k").unwrap(), None);
        store.put(TRANSLATION, "k", &value).unwrap();
        assert_eq!(store.get::<Payload>(TRANSLATION, "k").unwrap(), Some(value));
        assert_eq!(store.get::<Payload>(TTS, "k").unwrap(), None);

        let stats = store.stats(TRANSLATION).unwrap();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.total_hits, 1);
    }

    #[test]
    fn unreadable_payload_is_a_miss() {
        let db = Database::open_memory().unwrap();
        db.cache_put(TTS, "k", "not json").unwrap();
        let store = CacheStore::new(db);
        assert_eq!(store.get::<Payload>(TTS, "k").unwrap(), None);
    }

    #[test]
    fn cleanup_keeps_recent_entries() {
        let store = CacheStore::new(Database::open_memory().unwrap());
        store.put(TTS, "k", &Payload { text: "x".into() }).unwrap();
        assert!(store.cleanup(TTS, 1).unwrap().is_empty());
        assert_eq!(store.stats(TTS).unwrap().entries, 1);
    }
}

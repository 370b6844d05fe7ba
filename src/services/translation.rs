//! Translation with a result cache keyed by (text, source, target).

use super::backend::TranslationBackend;
use super::cache::{self, CacheStore, cache_key};
use super::language::{detect_language, normalize_code};
use crate::config::TranslationConfig;
use crate::db::{self, CacheStats, Database, TranslationRecord};
use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Largest batch accepted by [`TranslationService::batch_translate`].
pub const MAX_BATCH: usize = 50;

/// A finished translation.
#[derive(Debug, Clone, Serialize)]
pub struct Translation {
    /// Translated text.
    pub translated_text: String,
    /// Source language (detected when requested as `auto`).
    pub source_language: String,
    /// Target language.
    pub target_language: String,
    /// Estimated quality, 0 - 1.
    pub confidence: f64,
    /// Model that produced it; None when no translation was needed.
    pub model: Option<String>,
    /// True when served from the cache.
    pub from_cache: bool,
    /// History record, when one was written.
    pub record_id: Option<String>,
}

/// Outcome of one batch item.
#[derive(Debug, Clone, Serialize)]
pub struct BatchItem {
    /// Position in the request.
    pub index: usize,
    /// Whether the item was translated.
    pub success: bool,
    /// The translation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Translation>,
    /// Error message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Detected language.
#[derive(Debug, Clone, Serialize)]
pub struct Detection {
    /// Language code.
    pub language: String,
    /// Display name, or the code when unknown.
    pub language_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedTranslation {
    translated_text: String,
    confidence: f64,
    model: String,
}

/// Heuristic quality estimate of a translation.
pub fn estimate_confidence(source: &str, translated: &str) -> f64 {
    let mut confidence: f64 = 0.8;

    let source_len = source.chars().count();
    if source_len > 0 {
        let ratio = translated.chars().count() as f64 / source_len as f64;
        if (0.5..=2.0).contains(&ratio) {
            confidence += 0.1;
        }
    }
    if translated.contains(source.trim()) {
        confidence -= 0.3;
    }
    if translated.trim().chars().count() < 3 {
        confidence -= 0.5;
    }

    (confidence.clamp(0.0, 1.0) * 100.0).round() / 100.0
}

/// Translation wrapper.
#[derive(Clone)]
pub struct TranslationService {
    db: Database,
    cache: CacheStore,
    backend: Arc<dyn TranslationBackend>,
    config: TranslationConfig,
}

impl TranslationService {
    /// Create the service.
    pub fn new(
        db: Database,
        cache: CacheStore,
        backend: Arc<dyn TranslationBackend>,
        config: TranslationConfig,
    ) -> Self {
        Self {
            db,
            cache,
            backend,
            config,
        }
    }

    fn resolve_target(&self, target: Option<&str>) -> Result<String> {
        let target = normalize_code(target.filter(|t| !t.trim().is_empty()).unwrap_or(&self.config.default_target));
        if self.config.languages.contains_key(&target) {
            Ok(target)
        } else {
            Err(AppError::InvalidFormat(format!("Unsupported target language: {}", target)))
        }
    }

    /// Translate `text` into `target` (default from config). `source` may be `auto`.
    pub async fn translate(
        &self,
        user_id: &str,
        text: &str,
        target: Option<&str>,
        source: &str,
    ) -> Result<Translation> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AppError::InvalidFormat("Text is empty".into()));
        }

        let target = self.resolve_target(target)?;
        let source = match source.trim() {
            "" | "auto" => detect_language(text),
            code => normalize_code(code),
        };

        if source == target {
            return Ok(Translation {
                translated_text: text.to_string(),
                source_language: source,
                target_language: target,
                confidence: 1.0,
                model: None,
                from_cache: false,
                record_id: None,
            });
        }

        let key = cache_key(&[text, source.as_str(), target.as_str()]);
        let (cached, from_cache) = match self.cache.get::<CachedTranslation>(cache::TRANSLATION, &key)? {
            Some(cached) => (cached, true),
            None => {
                let translated = self.backend.translate(text, &source, &target).await?;
                let translated = translated.trim().to_string();
                if translated.is_empty() {
                    return Err(AppError::Backend("Backend returned an empty translation".into()));
                }

                let cached = CachedTranslation {
                    confidence: estimate_confidence(text, &translated),
                    translated_text: translated,
                    model: self.backend.model().to_string(),
                };
                self.cache.put(cache::TRANSLATION, &key, &cached)?;
                (cached, false)
            }
        };

        let record = TranslationRecord {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            source_text: text.to_string(),
            translated_text: cached.translated_text.clone(),
            source_language: source.clone(),
            target_language: target.clone(),
            is_favorite: false,
            created_at: db::now_timestamp(),
        };
        self.db.insert_translation(&record)?;

        tracing::debug!(user_id, source = %source, target = %target, from_cache, "Translated");

        Ok(Translation {
            translated_text: cached.translated_text,
            source_language: source,
            target_language: target,
            confidence: cached.confidence,
            model: Some(cached.model),
            from_cache,
            record_id: Some(record.id),
        })
    }

    /// Translate several texts; a failing item does not stop the others.
    pub async fn batch_translate(
        &self,
        user_id: &str,
        texts: &[String],
        target: Option<&str>,
        source: &str,
    ) -> Result<Vec<BatchItem>> {
        if texts.is_empty() {
            return Err(AppError::InvalidFormat("No texts to translate".into()));
        }
        if texts.len() > MAX_BATCH {
            return Err(AppError::InvalidFormat(format!(
                "At most {} texts per batch",
                MAX_BATCH
            )));
        }

        let mut items = Vec::with_capacity(texts.len());
        for (index, text) in texts.iter().enumerate() {
            let item = match self.translate(user_id, text, target, source).await {
                Ok(result) => BatchItem {
                    index,
                    success: true,
                    result: Some(result),
                    error: None,
                },
                Err(e) => BatchItem {
                    index,
                    success: false,
                    result: None,
                    error: Some(e.to_string()),
                },
            };
            items.push(item);
        }
        Ok(items)
    }

    /// Detect the language of non-empty text.
    pub fn detect(&self, text: &str) -> Result<Detection> {
        if text.trim().is_empty() {
            return Err(AppError::InvalidFormat("Text is empty".into()));
        }
        let language = detect_language(text);
        let language_name = self
            .config
            .languages
            .get(&language)
            .cloned()
            .unwrap_or_else(|| language.clone());
        Ok(Detection {
            language,
            language_name,
        })
    }

    /// Supported languages: code to display name.
    pub fn supported_languages(&self) -> &BTreeMap<String, String> {
        &self.config.languages
    }

    /// Latest translations, newest first.
    pub fn history(&self, user_id: &str, favorites_only: bool, limit: usize) -> Result<Vec<TranslationRecord>> {
        self.db.list_translations(user_id, favorites_only, limit)
    }

    /// Flip the favorite flag of a history record; returns the new value.
    pub fn toggle_favorite(&self, user_id: &str, id: &str) -> Result<bool> {
        self.db
            .toggle_translation_favorite(user_id, id)?
            .ok_or_else(|| AppError::NotFound(format!("Translation {}", id)))
    }

    /// Translation cache statistics.
    pub fn cache_stats(&self) -> Result<CacheStats> {
        self.cache.stats(cache::TRANSLATION)
    }

    /// Drop translations not requested for `days` days.
    pub fn cleanup(&self, days: u32) -> Result<usize> {
        Ok(self.cache.cleanup(cache::TRANSLATION, days)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_rewards_plausible_length() {
        assert_eq!(estimate_confidence("Hello world", "Bonjour le monde"), 0.9);
    }

    #[test]
    fn confidence_penalizes_echo_and_short_output() {
        assert_eq!(estimate_confidence("Hello world", "Hello world"), 0.6);
        assert_eq!(estimate_confidence("A long sentence here", "ok"), 0.3);
        assert_eq!(estimate_confidence("Hi", "Hi"), 0.1);
    }

    #[test]
    fn confidence_is_clamped() {
        assert_eq!(estimate_confidence("", ""), 0.0);
    }
}

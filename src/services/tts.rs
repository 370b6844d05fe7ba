//! Text-to-speech with audio cached on disk by content hash.

use super::backend::{SpeechBackend, SpeechRequest};
use super::cache::{self, CacheStore, cache_key};
use super::language::{detect_language, normalize_code};
use crate::config::{TtsConfig, VoiceConfig};
use crate::db::{CacheStats, Database};
use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// URL prefix the audio directory is served under.
pub const MEDIA_PREFIX: &str = "/media/tts";

const SENTENCE_END: &[char] = &['。', '！', '？', '.', '!', '?'];
const CLAUSE_END: &[char] = &['，', ','];
const MIN_SENTENCE_CHARS: usize = 50;

/// A synthesis request.
#[derive(Debug, Clone, Deserialize)]
pub struct SpeechOptions {
    /// Text to speak.
    pub text: String,
    /// Language code; detected when absent.
    #[serde(default)]
    pub language: Option<String>,
    /// Voice ID; taken from the user's preferences or the language when absent.
    #[serde(default)]
    pub voice: Option<String>,
    /// Playback speed, 0.25 - 4.0; defaults to the user's preference.
    #[serde(default)]
    pub speed: Option<f32>,
}

/// Generated (or cached) audio.
#[derive(Debug, Clone, Serialize)]
pub struct SpeechResult {
    /// URL of the first segment.
    pub audio_url: String,
    /// URLs of every segment, in reading order.
    pub segments: Vec<String>,
    /// Language used.
    pub language: String,
    /// Voice used.
    pub voice: String,
    /// Speed used.
    pub speed: f32,
    /// True when every segment was already cached.
    pub from_cache: bool,
}

/// Cache payload for one audio file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedAudio {
    file: String,
    bytes: usize,
    language: String,
    voice: String,
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn hard_split(text: &str, max: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(max).map(|c| c.iter().collect()).collect()
}

/// Join pieces greedily into chunks of at most `max` characters.
fn pack(pieces: impl IntoIterator<Item = String>, max: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut buf = String::new();
    let mut buf_len = 0;

    for piece in pieces {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        let len = char_len(piece);

        let needs_space = |buf: &str| {
            buf.ends_with(|c: char| c.is_ascii()) && piece.starts_with(|c: char| c.is_ascii())
        };
        let mut sep = usize::from(!buf.is_empty() && needs_space(&buf));
        if !buf.is_empty() && buf_len + sep + len > max {
            out.push(std::mem::take(&mut buf));
            buf_len = 0;
            sep = 0;
        }
        if sep == 1 {
            buf.push(' ');
        }
        buf.push_str(piece);
        buf_len += sep + len;
    }

    if !buf.is_empty() {
        out.push(buf);
    }
    out
}

/// Split text into segments of at most `max` characters.
///
/// Cuts at sentence ends once a sentence is longer than 50 characters, then at
/// commas, then anywhere. Short sentences are merged back up to `max`.
pub fn split_segments(text: &str, max: usize) -> Vec<String> {
    let text = text.trim();
    let max = max.max(1);
    if char_len(text) <= max {
        return vec![text.to_string()];
    }

    let mut sentences = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        current.push(c);
        if SENTENCE_END.contains(&c) && char_len(&current) > MIN_SENTENCE_CHARS {
            sentences.push(std::mem::take(&mut current));
        }
    }
    sentences.push(current);

    let pieces = sentences.into_iter().flat_map(|sentence| {
        if char_len(sentence.trim()) <= max {
            return vec![sentence];
        }
        let clauses = sentence
            .split_inclusive(CLAUSE_END)
            .flat_map(|clause| {
                if char_len(clause.trim()) <= max {
                    vec![clause.to_string()]
                } else {
                    hard_split(clause.trim(), max)
                }
            })
            .collect::<Vec<_>>();
        pack(clauses, max)
    });

    pack(pieces, max)
}

/// Text-to-speech wrapper.
#[derive(Clone)]
pub struct TtsService {
    db: Database,
    cache: CacheStore,
    backend: Arc<dyn SpeechBackend>,
    config: TtsConfig,
}

impl TtsService {
    /// Create the service.
    pub fn new(
        db: Database,
        cache: CacheStore,
        backend: Arc<dyn SpeechBackend>,
        config: TtsConfig,
    ) -> Self {
        Self {
            db,
            cache,
            backend,
            config,
        }
    }

    fn audio_path(&self, file: &str) -> PathBuf {
        self.config.cache_dir.join(file)
    }

    /// A voice for the language, of the preferred gender when one exists.
    fn pick_voice(&self, language: &str, gender: Option<&str>) -> String {
        let for_language = || self.config.voices.iter().filter(move |v| v.language == language);
        gender
            .and_then(|g| for_language().find(|v| v.gender == g))
            .or_else(|| for_language().next())
            .map(|v| v.id.clone())
            .unwrap_or_else(|| self.config.default_voice.clone())
    }

    /// Cached audio for a segment whose file is still on disk.
    fn cached(&self, key: &str) -> Result<Option<CachedAudio>> {
        Ok(self
            .cache
            .get::<CachedAudio>(cache::TTS, key)?
            .filter(|audio| self.audio_path(&audio.file).is_file()))
    }

    /// Synthesize `options.text`, reusing cached segments.
    pub async fn generate(&self, user_id: &str, options: SpeechOptions) -> Result<SpeechResult> {
        let text = options.text.trim();
        if text.is_empty() {
            return Err(AppError::InvalidFormat("Text is empty".into()));
        }

        let prefs = self.db.get_preferences(user_id)?;
        let speed = options
            .speed
            .or(prefs.as_ref().map(|p| p.voice_speed))
            .unwrap_or(1.0);
        if !(0.25..=4.0).contains(&speed) {
            return Err(AppError::InvalidFormat(format!("Speed out of range: {}", speed)));
        }

        let language = match options.language.as_deref().map(str::trim) {
            Some(lang) if !lang.is_empty() && lang != "auto" => normalize_code(lang),
            _ => detect_language(text),
        };
        let voice = match options.voice {
            Some(v) if !v.trim().is_empty() => v,
            _ => match prefs.as_ref().and_then(|p| p.voice.clone()) {
                Some(preferred) => preferred,
                None => self.pick_voice(
                    &language,
                    prefs.as_ref().and_then(|p| p.voice_type.as_deref()),
                ),
            },
        };
        let speed_key = format!("{:.2}", speed);

        let segments = split_segments(text, self.config.max_text_length);
        let mut urls = Vec::with_capacity(segments.len());
        let mut hits = 0;

        for segment in &segments {
            let key = cache_key(&[
                segment.as_str(),
                language.as_str(),
                voice.as_str(),
                speed_key.as_str(),
            ]);

            let audio = match self.cached(&key)? {
                Some(audio) => {
                    hits += 1;
                    audio
                }
                None => {
                    let bytes = self
                        .backend
                        .synthesize(&SpeechRequest {
                            text: segment,
                            language: &language,
                            voice: &voice,
                            speed,
                        })
                        .await?;

                    let file = format!("{}.{}", key, self.config.format);
                    tokio::fs::create_dir_all(&self.config.cache_dir).await?;
                    tokio::fs::write(self.audio_path(&file), &bytes).await?;

                    let audio = CachedAudio {
                        file,
                        bytes: bytes.len(),
                        language: language.clone(),
                        voice: voice.clone(),
                    };
                    self.cache.put(cache::TTS, &key, &audio)?;
                    audio
                }
            };
            urls.push(format!("{}/{}", MEDIA_PREFIX, audio.file));
        }

        tracing::info!(
            user_id,
            language = %language,
            voice = %voice,
            segments = segments.len(),
            cached = hits,
            "Speech generated"
        );

        Ok(SpeechResult {
            audio_url: urls.first().cloned().unwrap_or_default(),
            from_cache: hits == segments.len(),
            segments: urls,
            language,
            voice,
            speed,
        })
    }

    /// Configured voices, optionally for one language.
    pub fn voices(&self, language: Option<&str>) -> Vec<VoiceConfig> {
        let language = language.map(normalize_code);
        self.config
            .voices
            .iter()
            .filter(|v| language.as_deref().is_none_or(|l| v.language == l))
            .cloned()
            .collect()
    }

    /// Audio cache statistics.
    pub fn cache_stats(&self) -> Result<CacheStats> {
        self.cache.stats(cache::TTS)
    }

    /// Drop audio not played for `days` days, deleting the files.
    pub fn cleanup(&self, days: u32) -> Result<usize> {
        let removed = self.cache.cleanup(cache::TTS, days)?;

        for entry in &removed {
            let Ok(audio) = serde_json::from_str::<CachedAudio>(&entry.payload) else {
                continue;
            };
            match std::fs::remove_file(self.audio_path(&audio.file)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(file = %audio.file, error = %e, "Failed to delete audio"),
            }
        }

        Ok(removed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_segment() {
        assert_eq!(split_segments("  Hello there.  ", 500), vec!["Hello there."]);
    }

    #[test]
    fn segments_respect_limit() {
        let sentence = "This sentence is long enough to pass the fifty character mark. ";
        let text = sentence.repeat(20);
        let segments = split_segments(&text, 200);
        assert!(segments.len() > 1);
        assert!(segments.iter().all(|s| s.chars().count() <= 200));
        assert!(segments[0].ends_with('.'));
        let words: usize = segments.iter().map(|s| s.split_whitespace().count()).sum();
        assert_eq!(words, text.split_whitespace().count());
    }

    #[test]
    fn long_sentence_splits_at_commas_then_anywhere() {
        let text = format!("{}，{}。", "甲".repeat(30), "乙".repeat(30));
        let segments = split_segments(&text, 40);
        assert_eq!(segments.len(), 2);
        assert!(segments[0].starts_with('甲'));

        let unbroken = "字".repeat(95);
        let segments = split_segments(&unbroken, 40);
        assert_eq!(
            segments.iter().map(|s| s.chars().count()).collect::<Vec<_>>(),
            vec![40, 40, 15]
        );
    }
}

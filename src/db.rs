mod schema;

pub use schema::Database;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// User account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Unique user ID.
    pub id: String,
    /// Username for login.
    pub username: String,
    /// Argon2 password hash.
    #[serde(skip_serializing)]
    pub password_hash: String,
    /// Display name.
    pub display_name: Option<String>,
    /// User role: "admin" or "user".
    pub role: String,
    /// Account creation timestamp.
    pub created_at: i64,
    /// Last login timestamp.
    pub last_login: Option<i64>,
}

/// Authentication session.
#[derive(Debug, Clone)]
pub struct Session {
    /// Session token.
    pub token: String,
    /// User ID.
    pub user_id: String,
    /// Expiration timestamp.
    pub expires_at: i64,
}

/// Uploaded book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredBook {
    /// Book ID.
    pub id: String,
    /// Owner user ID.
    pub user_id: String,
    /// Book title.
    pub title: String,
    /// Author.
    pub author: Option<String>,
    /// Description.
    pub description: Option<String>,
    /// Language code.
    pub language: Option<String>,
    /// Format name ("epub", "pdf", ...).
    pub format: String,
    /// Absolute path of the stored file.
    #[serde(skip_serializing)]
    pub path: String,
    /// File size in bytes.
    pub file_size: i64,
    /// Words across all chapters.
    pub word_count: i64,
    /// Number of parsed chapters.
    pub chapter_count: i64,
    /// "pending", "processing", "completed" or "failed".
    pub processing_status: String,
    /// AI generated summary.
    pub summary: Option<String>,
    /// AI extracted keywords.
    pub keywords: Vec<String>,
    /// Times a reading session was started.
    pub view_count: i64,
    /// Last reading session start.
    pub last_read_at: Option<i64>,
    /// Upload timestamp.
    pub uploaded_at: i64,
    /// Last update timestamp.
    pub updated_at: i64,
}

/// Parsed chapter of a book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredChapter {
    /// Owning book.
    pub book_id: String,
    /// 1-based chapter number.
    pub number: i64,
    /// Chapter title.
    pub title: String,
    /// Chapter text.
    pub content: String,
    /// Word count.
    pub word_count: i64,
}

/// Chapter listing entry (no text).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterInfo {
    /// 1-based chapter number.
    pub number: i64,
    /// Chapter title.
    pub title: String,
    /// Word count.
    pub word_count: i64,
}

/// Reading progress for a book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadingProgress {
    /// User ID.
    pub user_id: String,
    /// Book ID.
    pub book_id: String,
    /// Current chapter number.
    pub current_chapter: i64,
    /// Position inside the chapter (characters).
    pub current_position: i64,
    /// Reading percentage (0.0 - 100.0).
    pub percentage: f64,
    /// Accumulated reading time in seconds.
    pub reading_seconds: i64,
    /// Last update timestamp.
    pub last_read_at: i64,
}

/// A timed reading session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadingSession {
    /// Session ID.
    pub id: String,
    /// User ID.
    pub user_id: String,
    /// Book ID.
    pub book_id: String,
    /// Chapter the session started in.
    pub chapter_number: Option<i64>,
    /// Start timestamp.
    pub started_at: i64,
    /// End timestamp, set when closed.
    pub ended_at: Option<i64>,
    /// Duration in seconds, set when closed.
    pub duration_seconds: i64,
    /// Words read, reported when closed.
    pub words_read: i64,
    /// Whether the session is still open.
    pub is_active: bool,
}

/// Aggregate over closed sessions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionTotals {
    /// Sum of durations.
    pub total_seconds: i64,
    /// Sum of words read.
    pub total_words: i64,
    /// Number of sessions.
    pub session_count: i64,
    /// Distinct books read.
    pub books_count: i64,
}

/// Question answered by the AI assistant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaEntry {
    /// Entry ID.
    pub id: String,
    /// User ID.
    pub user_id: String,
    /// Book ID.
    pub book_id: String,
    /// Question type ("text", "chapter", "book", ...).
    pub question_type: String,
    /// Question text.
    pub question: String,
    /// Selected passage the question refers to.
    pub selected_text: Option<String>,
    /// Chapter the question refers to.
    pub chapter_number: Option<i64>,
    /// Answer text.
    pub answer: String,
    /// Model that produced the answer.
    pub model: String,
    /// Seconds spent waiting for the backend.
    pub processing_time: f64,
    /// Tokens reported by the backend.
    pub tokens_used: i64,
    /// User rating; None until rated.
    pub is_helpful: Option<bool>,
    /// Creation timestamp.
    pub created_at: i64,
}

/// Log line for every AI call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiRequestLog {
    /// Request ID.
    pub id: String,
    /// User ID.
    pub user_id: String,
    /// Related book.
    pub book_id: Option<String>,
    /// "summary", "question", "keywords", "analysis", "chapter_summary".
    pub kind: String,
    /// Input text (question, analyzed text or a description).
    pub input: String,
    /// "completed" or "failed".
    pub status: String,
    /// Error message when failed.
    pub error: Option<String>,
    /// Response text when completed.
    pub response: Option<String>,
    /// Seconds spent.
    pub processing_time: f64,
    /// Tokens used.
    pub tokens_used: i64,
    /// Creation timestamp.
    pub created_at: i64,
}

/// Cached chapter summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterSummary {
    /// Book ID.
    pub book_id: String,
    /// Chapter number.
    pub chapter_number: i64,
    /// "auto", "key_points" or "detailed".
    pub summary_type: String,
    /// Summary text.
    pub summary: String,
    /// Extracted key points.
    pub key_points: Vec<String>,
    /// Summary length over chapter length.
    pub compression_ratio: f64,
    /// Model that produced it.
    pub model: String,
    /// Creation timestamp.
    pub created_at: i64,
}

/// Keyed result stored by a caching wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// "tts" or "translation".
    pub kind: String,
    /// SHA-256 hex of the generating input.
    pub key: String,
    /// JSON payload.
    pub payload: String,
    /// Creation timestamp.
    pub created_at: i64,
    /// Last hit timestamp.
    pub last_accessed: i64,
    /// Number of hits.
    pub hit_count: i64,
}

/// Cache statistics for one kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of entries.
    pub entries: i64,
    /// Sum of hit counts.
    pub total_hits: i64,
    /// Oldest creation timestamp.
    pub oldest: Option<i64>,
    /// Newest creation timestamp.
    pub newest: Option<i64>,
}

/// Translation history record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationRecord {
    /// Record ID.
    pub id: String,
    /// User ID.
    pub user_id: String,
    /// Source text.
    pub source_text: String,
    /// Translated text.
    pub translated_text: String,
    /// Source language.
    pub source_language: String,
    /// Target language.
    pub target_language: String,
    /// Starred by the user.
    pub is_favorite: bool,
    /// Creation timestamp.
    pub created_at: i64,
}

/// Reader note, highlight or bookmark.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    /// Note ID.
    pub id: String,
    /// User ID.
    pub user_id: String,
    /// Book ID.
    pub book_id: String,
    /// Chapter number.
    pub chapter_number: i64,
    /// Start offset in the chapter.
    pub position_start: i64,
    /// End offset in the chapter.
    pub position_end: i64,
    /// Selected passage.
    pub selected_text: String,
    /// User text.
    pub content: String,
    /// "highlight", "note", "bookmark", "question" or "insight".
    pub note_type: String,
    /// Highlight color.
    pub color: String,
    /// Comma-separated tags.
    pub tags: String,
    /// Creation timestamp.
    pub created_at: i64,
    /// Last update timestamp.
    pub updated_at: i64,
}

/// Batch upload record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchUpload {
    /// Batch ID.
    pub id: String,
    /// User ID.
    pub user_id: String,
    /// Batch name.
    pub name: String,
    /// Files in the batch.
    pub total_files: i64,
    /// Files processed so far.
    pub processed_files: i64,
    /// Files imported.
    pub successful_files: i64,
    /// Files rejected.
    pub failed_files: i64,
    /// "pending", "processing", "completed", "failed" or "partial".
    pub status: String,
    /// One line per failure.
    pub error_log: String,
    /// Creation timestamp.
    pub created_at: i64,
    /// Completion timestamp.
    pub completed_at: Option<i64>,
}

impl BatchUpload {
    /// Processed share of the batch, 0 - 100.
    pub fn progress_percentage(&self) -> f64 {
        if self.total_files == 0 {
            return 0.0;
        }
        self.processed_files as f64 / self.total_files as f64 * 100.0
    }
}

/// A user's own LLM provider settings, used instead of the `[ai]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAiConfig {
    /// Owner user ID.
    pub user_id: String,
    /// Provider wire format, as in the `[ai]` section.
    pub provider: String,
    /// Base URL of the API.
    pub api_url: String,
    /// API key; never sent back to clients.
    #[serde(skip_serializing)]
    pub api_key: String,
    /// Model identifier.
    pub model: String,
    /// Maximum tokens per completion.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Request timeout in seconds.
    pub timeout_seconds: u32,
    /// Inactive settings are kept but ignored.
    pub is_active: bool,
    /// Last update timestamp.
    pub updated_at: i64,
}

/// Reader and voice preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPreferences {
    /// Owner user ID.
    pub user_id: String,
    /// "light", "dark" or "auto".
    pub theme: String,
    /// Interface language code.
    pub language: String,
    /// Whether speech controls are shown.
    pub voice_enabled: bool,
    /// Preferred voice ID.
    pub voice: Option<String>,
    /// Preferred voice gender when no voice is named.
    pub voice_type: Option<String>,
    /// Default playback speed.
    pub voice_speed: f32,
    /// Read chapters aloud when they open.
    pub auto_read: bool,
    /// Last update timestamp.
    pub updated_at: i64,
}

impl UserPreferences {
    /// Preferences of a user who never saved any.
    pub fn defaults(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            theme: "light".to_string(),
            language: "en".to_string(),
            voice_enabled: true,
            voice: None,
            voice_type: None,
            voice_speed: 1.0,
            auto_read: false,
            updated_at: 0,
        }
    }
}

/// Timestamp helper.
pub fn now_timestamp() -> i64 {
    Utc::now().timestamp()
}

/// Convert timestamp to DateTime.
pub fn timestamp_to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_else(Utc::now)
}

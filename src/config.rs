use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;

/// E-book reading server with AI assistant, TTS and translation.
#[derive(Parser, Debug, Clone)]
#[command(name = "readify")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file.
    #[arg(short, long, env = "READIFY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the server (default if no command given).
    Serve {
        /// Address to bind the server to.
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },

    /// User management commands.
    User {
        /// User subcommand action.
        #[command(subcommand)]
        action: UserCommand,
    },

    /// Book management commands.
    Book {
        /// Book subcommand action.
        #[command(subcommand)]
        action: BookCommand,
    },

    /// Result cache maintenance.
    Cache {
        /// Cache subcommand action.
        #[command(subcommand)]
        action: CacheCommand,
    },

    /// Initialize database and create default config.
    Init {
        /// Force overwrite existing config.
        #[arg(short, long)]
        force: bool,
    },
}

/// User management subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum UserCommand {
    /// Add a new user.
    Add {
        /// Username.
        username: String,
        /// Password (will prompt if not provided).
        #[arg(short, long)]
        password: Option<String>,
        /// User role (admin or user).
        #[arg(short, long, default_value = "user")]
        role: String,
    },

    /// Delete a user.
    Del {
        /// Username to delete.
        username: String,
    },

    /// List all users.
    List,

    /// Change user password.
    Passwd {
        /// Username.
        username: String,
        /// New password (will prompt if not provided).
        #[arg(short, long)]
        password: Option<String>,
    },
}

/// Book management subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum BookCommand {
    /// Import every supported file under a directory for a user.
    Import {
        /// Directory to walk.
        dir: PathBuf,
        /// Owner username.
        #[arg(short, long)]
        user: String,
        /// Parallel parsing threads.
        #[arg(short, long, default_value_t = 4)]
        workers: usize,
    },

    /// List books owned by a user.
    List {
        /// Owner username.
        #[arg(short, long)]
        user: String,
    },
}

/// Cache maintenance subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum CacheCommand {
    /// Drop TTS and translation entries not accessed recently.
    Cleanup {
        /// Age threshold in days (defaults to `cache.max_age_days`).
        #[arg(short, long)]
        days: Option<u32>,
    },

    /// Show cache statistics.
    Stats,
}

/// Main configuration from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Authentication configuration.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Uploaded file storage.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Chapter splitting.
    #[serde(default)]
    pub reader: ReaderConfig,

    /// LLM backend.
    #[serde(default)]
    pub ai: AiConfig,

    /// Speech backend.
    #[serde(default)]
    pub tts: TtsConfig,

    /// Translation settings.
    #[serde(default)]
    pub translation: TranslationConfig,

    /// Result cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Site title.
    #[serde(default = "default_title")]
    pub title: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            title: default_title(),
        }
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::new(
        std::net::IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0)),
        8080,
    )
}

fn default_title() -> String {
    "Readify".to_string()
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/readify.db")
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Registration mode: "open", "disabled".
    #[serde(default = "default_registration")]
    pub registration: String,

    /// Session token duration in days.
    #[serde(default = "default_session_days")]
    pub session_days: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            registration: default_registration(),
            session_days: default_session_days(),
        }
    }
}

fn default_registration() -> String {
    "open".to_string()
}

fn default_session_days() -> u32 {
    30
}

impl AuthConfig {
    /// Check if registration is enabled.
    pub fn registration_enabled(&self) -> bool {
        self.registration == "open"
    }
}

/// Storage for uploaded book files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory; files land in `<books_dir>/<user_id>/`.
    #[serde(default = "default_books_dir")]
    pub books_dir: PathBuf,

    /// Upload size limit in megabytes.
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            books_dir: default_books_dir(),
            max_upload_mb: default_max_upload_mb(),
        }
    }
}

fn default_books_dir() -> PathBuf {
    PathBuf::from("data/books")
}

fn default_max_upload_mb() -> usize {
    100
}

/// Chapter splitting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Chunk size used when a text has no chapter headings.
    #[serde(default = "default_max_chapter_chars")]
    pub max_chapter_chars: usize,

    /// Text before the first heading shorter than this is dropped.
    #[serde(default = "default_preface_min_chars")]
    pub preface_min_chars: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_chapter_chars: default_max_chapter_chars(),
            preface_min_chars: default_preface_min_chars(),
        }
    }
}

fn default_max_chapter_chars() -> usize {
    20_000
}

fn default_preface_min_chars() -> usize {
    50
}

/// LLM backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    /// Provider wire format: "openai", "azure", "custom", "anthropic", "google".
    #[serde(default = "default_ai_provider")]
    pub provider: String,

    /// Base URL of the API.
    #[serde(default = "default_ai_url")]
    pub api_url: String,

    /// API key (falls back to `READIFY_AI_API_KEY`).
    #[serde(default)]
    pub api_key: String,

    /// Model identifier.
    #[serde(default = "default_ai_model")]
    pub model: String,

    /// Maximum tokens per completion.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            provider: default_ai_provider(),
            api_url: default_ai_url(),
            api_key: String::new(),
            model: default_ai_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_seconds: default_timeout(),
        }
    }
}

fn default_ai_provider() -> String {
    "openai".to_string()
}

fn default_ai_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_ai_model() -> String {
    "gpt-3.5-turbo".to_string()
}

fn default_max_tokens() -> u32 {
    4000
}

fn default_temperature() -> f32 {
    0.7
}

fn default_timeout() -> u64 {
    30
}

/// A voice offered to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// Backend voice id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Primary language code.
    pub language: String,
    /// "male", "female" or "neutral".
    #[serde(default = "default_gender")]
    pub gender: String,
}

fn default_gender() -> String {
    "neutral".to_string()
}

/// Speech backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// Base URL of the speech API.
    #[serde(default = "default_ai_url")]
    pub api_url: String,

    /// API key (falls back to `READIFY_TTS_API_KEY`).
    #[serde(default)]
    pub api_key: String,

    /// Speech model identifier.
    #[serde(default = "default_tts_model")]
    pub model: String,

    /// Voice used when the request names none.
    #[serde(default = "default_voice")]
    pub default_voice: String,

    /// Audio container written to the cache.
    #[serde(default = "default_audio_format")]
    pub format: String,

    /// Longest text sent to the backend in one call.
    #[serde(default = "default_max_text_length")]
    pub max_text_length: usize,

    /// Directory holding cached audio.
    #[serde(default = "default_tts_cache_dir")]
    pub cache_dir: PathBuf,

    /// Request timeout in seconds.
    #[serde(default = "default_tts_timeout")]
    pub timeout_seconds: u64,

    /// Voices listed by the API.
    #[serde(default = "default_voices")]
    pub voices: Vec<VoiceConfig>,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            api_url: default_ai_url(),
            api_key: String::new(),
            model: default_tts_model(),
            default_voice: default_voice(),
            format: default_audio_format(),
            max_text_length: default_max_text_length(),
            cache_dir: default_tts_cache_dir(),
            timeout_seconds: default_tts_timeout(),
            voices: default_voices(),
        }
    }
}

fn default_tts_model() -> String {
    "tts-1".to_string()
}

fn default_voice() -> String {
    "alloy".to_string()
}

fn default_audio_format() -> String {
    "mp3".to_string()
}

fn default_max_text_length() -> usize {
    500
}

fn default_tts_cache_dir() -> PathBuf {
    PathBuf::from("data/tts")
}

fn default_tts_timeout() -> u64 {
    60
}

fn default_voices() -> Vec<VoiceConfig> {
    [
        ("alloy", "Alloy", "en", "neutral"),
        ("nova", "Nova", "en", "female"),
        ("onyx", "Onyx", "en", "male"),
        ("shimmer", "Shimmer", "zh", "female"),
    ]
    .into_iter()
    .map(|(id, name, language, gender)| VoiceConfig {
        id: id.to_string(),
        name: name.to_string(),
        language: language.to_string(),
        gender: gender.to_string(),
    })
    .collect()
}

/// Translation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationConfig {
    /// Target language when the request names none.
    #[serde(default = "default_target_language")]
    pub default_target: String,

    /// Sampling temperature for translation prompts.
    #[serde(default = "default_translation_temperature")]
    pub temperature: f32,

    /// Supported languages: code -> display name.
    #[serde(default = "default_languages")]
    pub languages: BTreeMap<String, String>,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            default_target: default_target_language(),
            temperature: default_translation_temperature(),
            languages: default_languages(),
        }
    }
}

fn default_target_language() -> String {
    "zh".to_string()
}

fn default_translation_temperature() -> f32 {
    0.3
}

fn default_languages() -> BTreeMap<String, String> {
    [
        ("zh", "Chinese"),
        ("en", "English"),
        ("ja", "Japanese"),
        ("ko", "Korean"),
        ("fr", "French"),
        ("de", "German"),
        ("es", "Spanish"),
        ("it", "Italian"),
        ("pt", "Portuguese"),
        ("ru", "Russian"),
        ("ar", "Arabic"),
        ("hi", "Hindi"),
        ("th", "Thai"),
        ("vi", "Vietnamese"),
    ]
    .into_iter()
    .map(|(code, name)| (code.to_string(), name.to_string()))
    .collect()
}

/// Result cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entries idle longer than this are removed by cleanup.
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,

    /// Background cleanup interval in seconds (0 to disable).
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age_days: default_max_age_days(),
            cleanup_interval_seconds: default_cleanup_interval(),
        }
    }
}

fn default_max_age_days() -> u32 {
    30
}

fn default_cleanup_interval() -> u64 {
    86_400
}

impl Config {
    /// Load configuration from file.
    pub fn load(path: &PathBuf) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::error::AppError::Config(format!("Failed to read config file: {}", e))
        })?;

        let mut config: Config = toml::from_str(&content).map_err(|e| {
            crate::error::AppError::Config(format!("Failed to parse config file: {}", e))
        })?;
        config.apply_env();
        Ok(config)
    }

    /// Fill API keys left empty in the file from the environment.
    pub fn apply_env(&mut self) {
        if self.ai.api_key.is_empty()
            && let Ok(key) = std::env::var("READIFY_AI_API_KEY")
        {
            self.ai.api_key = key;
        }
        if self.tts.api_key.is_empty() {
            self.tts.api_key = std::env::var("READIFY_TTS_API_KEY")
                .unwrap_or_else(|_| self.ai.api_key.clone());
        }
    }

    /// Find config file in default locations.
    pub fn find_config_file() -> Option<PathBuf> {
        let candidates = [
            PathBuf::from("config.toml"),
            PathBuf::from("readify.toml"),
            dirs::config_dir()
                .map(|p| p.join("readify").join("config.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/readify/config.toml"),
        ];

        candidates.into_iter().find(|p| p.exists())
    }

    /// Generate default config file content.
    pub fn generate_default() -> String {
        r#"# readify configuration

[server]
bind = "0.0.0.0:8080"
title = "Readify"

[database]
# path = "/var/lib/readify/readify.db"

[auth]
# Registration mode: "open" or "disabled"
registration = "open"
session_days = 30

[storage]
# books_dir = "/var/lib/readify/books"
max_upload_mb = 100

[reader]
max_chapter_chars = 20000

[ai]
# "openai", "azure", "custom", "anthropic" or "google"
provider = "openai"
api_url = "https://api.openai.com/v1"
# api_key = "..."   (or READIFY_AI_API_KEY)
model = "gpt-3.5-turbo"
max_tokens = 4000
temperature = 0.7
timeout_seconds = 30

[tts]
api_url = "https://api.openai.com/v1"
model = "tts-1"
default_voice = "alloy"
format = "mp3"
max_text_length = 500
# cache_dir = "/var/lib/readify/tts"

[translation]
default_target = "zh"
temperature = 0.3

[cache]
max_age_days = 30
# Background cleanup interval in seconds (0 to disable)
cleanup_interval_seconds = 86400
"#
        .to_string()
    }
}

/// Supported book formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookFormat {
    /// EPUB format (Electronic Publication).
    Epub,
    /// PDF format (Portable Document Format).
    Pdf,
    /// MOBI format (Mobipocket eBook).
    Mobi,
    /// Word document.
    Docx,
    /// Plain text format.
    Txt,
    /// HTML format.
    Html,
    /// Markdown format.
    Md,
}

impl BookFormat {
    /// Get the MIME type for this format.
    pub fn mime_type(&self) -> &'static str {
        match self {
            BookFormat::Epub => "application/epub+zip",
            BookFormat::Pdf => "application/pdf",
            BookFormat::Mobi => "application/x-mobipocket-ebook",
            BookFormat::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            BookFormat::Txt => "text/plain",
            BookFormat::Html => "text/html",
            BookFormat::Md => "text/markdown",
        }
    }

    /// Try to detect format from file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "epub" => Some(BookFormat::Epub),
            "pdf" => Some(BookFormat::Pdf),
            "mobi" | "azw" | "azw3" | "prc" => Some(BookFormat::Mobi),
            "docx" => Some(BookFormat::Docx),
            "txt" => Some(BookFormat::Txt),
            "html" | "htm" | "xhtml" => Some(BookFormat::Html),
            "md" | "markdown" => Some(BookFormat::Md),
            _ => None,
        }
    }

    /// Detect format from a file name.
    pub fn from_filename(name: &str) -> Option<Self> {
        std::path::Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }

    /// Canonical lowercase name, also used as the stored file extension.
    pub fn as_str(&self) -> &'static str {
        match self {
            BookFormat::Epub => "epub",
            BookFormat::Pdf => "pdf",
            BookFormat::Mobi => "mobi",
            BookFormat::Docx => "docx",
            BookFormat::Txt => "txt",
            BookFormat::Html => "html",
            BookFormat::Md => "md",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_from_filename() {
        assert_eq!(BookFormat::from_filename("a/b/Dune.EPUB"), Some(BookFormat::Epub));
        assert_eq!(BookFormat::from_filename("x.azw3"), Some(BookFormat::Mobi));
        assert_eq!(BookFormat::from_filename("notes.htm"), Some(BookFormat::Html));
        assert_eq!(BookFormat::from_filename("archive.cbz"), None);
        assert_eq!(BookFormat::from_filename("noext"), None);
    }

    #[test]
    fn default_config_parses() {
        let config: Config = toml::from_str(&Config::generate_default()).unwrap();
        assert_eq!(config.server.bind.port(), 8080);
        assert_eq!(config.ai.provider, "openai");
        assert_eq!(config.tts.max_text_length, 500);
        assert!(config.auth.registration_enabled());
        assert!(config.translation.languages.contains_key("ja"));
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.cache.max_age_days, 30);
        assert_eq!(config.reader.max_chapter_chars, 20_000);
        assert_eq!(config.tts.voices.len(), 4);
    }
}

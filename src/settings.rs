//! Per-user AI settings and reader preferences.

use crate::config::{AiConfig, VoiceConfig};
use crate::db::{self, Database, UserAiConfig, UserPreferences};
use crate::error::{AppError, Result};
use crate::services::backend::Provider;
use serde::{Deserialize, Serialize};

/// Accepted interface themes.
pub const THEMES: &[&str] = &["light", "dark", "auto"];

/// Accepted voice genders.
pub const VOICE_TYPES: &[&str] = &["female", "male", "neutral"];

/// Changes to a user's AI settings; absent fields keep their value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AiConfigUpdate {
    /// Provider wire format.
    pub provider: Option<String>,
    /// Base URL of the API.
    pub api_url: Option<String>,
    /// API key; blank keeps the stored key.
    pub api_key: Option<String>,
    /// Model identifier.
    pub model: Option<String>,
    /// Maximum tokens per completion.
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Request timeout in seconds.
    pub timeout_seconds: Option<u32>,
    /// Use these settings instead of the server defaults.
    pub is_active: Option<bool>,
}

/// Changes to a user's preferences; absent fields keep their value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PreferencesUpdate {
    /// Interface theme.
    pub theme: Option<String>,
    /// Interface language code.
    pub language: Option<String>,
    /// Show speech controls.
    pub voice_enabled: Option<bool>,
    /// Preferred voice ID; blank clears it.
    pub voice: Option<String>,
    /// Preferred voice gender; blank clears it.
    pub voice_type: Option<String>,
    /// Default playback speed.
    pub voice_speed: Option<f32>,
    /// Read chapters aloud when they open.
    pub auto_read: Option<bool>,
}

/// AI settings as shown to their owner.
#[derive(Debug, Clone, Serialize)]
pub struct AiSettingsView {
    /// Stored settings, without the key.
    pub config: Option<UserAiConfig>,
    /// Whether a key is stored.
    pub has_api_key: bool,
    /// Provider used when no active settings exist.
    pub default_provider: String,
    /// Model used when no active settings exist.
    pub default_model: String,
}

impl From<&UserAiConfig> for AiConfig {
    fn from(config: &UserAiConfig) -> Self {
        Self {
            provider: config.provider.clone(),
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            timeout_seconds: u64::from(config.timeout_seconds),
        }
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string())
}

/// User settings service.
#[derive(Clone)]
pub struct SettingsService {
    db: Database,
    ai_defaults: AiConfig,
    voices: Vec<VoiceConfig>,
}

impl SettingsService {
    /// Create the service; `ai_defaults` seeds new AI settings.
    pub fn new(db: Database, ai_defaults: AiConfig, voices: Vec<VoiceConfig>) -> Self {
        Self {
            db,
            ai_defaults,
            voices,
        }
    }

    // ========== AI SETTINGS ==========

    /// The user's AI settings and the server defaults.
    pub fn ai_settings(&self, user_id: &str) -> Result<AiSettingsView> {
        let config = self.db.get_user_ai_config(user_id)?;
        Ok(AiSettingsView {
            has_api_key: config.as_ref().is_some_and(|c| !c.api_key.is_empty()),
            config,
            default_provider: self.ai_defaults.provider.clone(),
            default_model: self.ai_defaults.model.clone(),
        })
    }

    /// Validate and store AI settings.
    pub fn save_ai_config(&self, user_id: &str, update: AiConfigUpdate) -> Result<UserAiConfig> {
        let mut config = self.db.get_user_ai_config(user_id)?.unwrap_or_else(|| UserAiConfig {
            user_id: user_id.to_string(),
            provider: self.ai_defaults.provider.clone(),
            api_url: self.ai_defaults.api_url.clone(),
            api_key: String::new(),
            model: self.ai_defaults.model.clone(),
            max_tokens: self.ai_defaults.max_tokens,
            temperature: self.ai_defaults.temperature,
            timeout_seconds: u32::try_from(self.ai_defaults.timeout_seconds).unwrap_or(u32::MAX),
            is_active: true,
            updated_at: 0,
        });

        if let Some(provider) = trimmed(update.provider) {
            config.provider = provider.to_ascii_lowercase();
        }
        if let Some(url) = trimmed(update.api_url) {
            config.api_url = url;
        }
        if let Some(key) = trimmed(update.api_key).filter(|k| !k.is_empty()) {
            config.api_key = key;
        }
        if let Some(model) = trimmed(update.model) {
            config.model = model;
        }
        config.max_tokens = update.max_tokens.unwrap_or(config.max_tokens);
        config.temperature = update.temperature.unwrap_or(config.temperature);
        config.timeout_seconds = update.timeout_seconds.unwrap_or(config.timeout_seconds);
        config.is_active = update.is_active.unwrap_or(config.is_active);

        Provider::parse(&config.provider)
            .map_err(|_| AppError::InvalidFormat(format!("Unknown AI provider: {}", config.provider)))?;
        if !(config.api_url.starts_with("http://") || config.api_url.starts_with("https://")) {
            return Err(AppError::InvalidFormat(format!("Invalid API URL: {}", config.api_url)));
        }
        if config.api_key.is_empty() {
            return Err(AppError::InvalidFormat("API key is required".into()));
        }
        if config.model.is_empty() {
            return Err(AppError::InvalidFormat("Model is required".into()));
        }
        if !(1..=128_000).contains(&config.max_tokens) {
            return Err(AppError::InvalidFormat(format!("max_tokens out of range: {}", config.max_tokens)));
        }
        if !(0.0..=2.0).contains(&config.temperature) {
            return Err(AppError::InvalidFormat(format!("Temperature out of range: {}", config.temperature)));
        }
        if !(1..=600).contains(&config.timeout_seconds) {
            return Err(AppError::InvalidFormat(format!("Timeout out of range: {}", config.timeout_seconds)));
        }

        config.updated_at = db::now_timestamp();
        self.db.save_user_ai_config(&config)?;
        tracing::info!(
            user_id,
            provider = %config.provider,
            model = %config.model,
            active = config.is_active,
            "AI settings saved"
        );
        Ok(config)
    }

    /// Forget the user's AI settings; the server defaults apply again.
    pub fn delete_ai_config(&self, user_id: &str) -> Result<()> {
        if self.db.delete_user_ai_config(user_id)? {
            Ok(())
        } else {
            Err(AppError::NotFound("AI settings".into()))
        }
    }

    // ========== PREFERENCES ==========

    /// Stored preferences, or the defaults.
    pub fn preferences(&self, user_id: &str) -> Result<UserPreferences> {
        Ok(self
            .db
            .get_preferences(user_id)?
            .unwrap_or_else(|| UserPreferences::defaults(user_id)))
    }

    /// Validate and store preferences.
    pub fn save_preferences(&self, user_id: &str, update: PreferencesUpdate) -> Result<UserPreferences> {
        let mut prefs = self.preferences(user_id)?;

        if let Some(theme) = trimmed(update.theme) {
            if !THEMES.contains(&theme.as_str()) {
                return Err(AppError::InvalidFormat(format!("Unknown theme: {}", theme)));
            }
            prefs.theme = theme;
        }
        if let Some(language) = trimmed(update.language).filter(|l| !l.is_empty()) {
            prefs.language = language.to_ascii_lowercase();
        }
        if let Some(voice) = trimmed(update.voice) {
            if voice.is_empty() {
                prefs.voice = None;
            } else if self.voices.iter().any(|v| v.id == voice) {
                prefs.voice = Some(voice);
            } else {
                return Err(AppError::InvalidFormat(format!("Unknown voice: {}", voice)));
            }
        }
        if let Some(voice_type) = trimmed(update.voice_type) {
            if voice_type.is_empty() {
                prefs.voice_type = None;
            } else if VOICE_TYPES.contains(&voice_type.as_str()) {
                prefs.voice_type = Some(voice_type);
            } else {
                return Err(AppError::InvalidFormat(format!("Unknown voice type: {}", voice_type)));
            }
        }
        if let Some(speed) = update.voice_speed {
            if !(0.25..=4.0).contains(&speed) {
                return Err(AppError::InvalidFormat(format!("Speed out of range: {}", speed)));
            }
            prefs.voice_speed = speed;
        }
        prefs.voice_enabled = update.voice_enabled.unwrap_or(prefs.voice_enabled);
        prefs.auto_read = update.auto_read.unwrap_or(prefs.auto_read);

        prefs.updated_at = db::now_timestamp();
        self.db.save_preferences(&prefs)?;
        Ok(prefs)
    }
}

//! Application state shared across handlers.

use crate::auth::AuthService;
use crate::config::Config;
use crate::db::Database;
use crate::error::Result;
use crate::library::Library;
use crate::library::notes::NoteService;
use crate::reading::ReadingTracker;
use crate::settings::SettingsService;
use crate::services::{
    AiAssistant, CacheStore, HttpLlmBackend, HttpSpeechBackend, LlmBackend, LlmTranslator,
    SpeechBackend, TranslationBackend, TranslationService, TtsService,
};
use std::sync::Arc;
use std::time::Duration;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<Config>,
    /// Database connection.
    pub db: Database,
    /// Authentication service.
    pub auth: Arc<AuthService>,
    /// Uploaded books and chapters.
    pub library: Library,
    /// Notes and highlights.
    pub notes: NoteService,
    /// Reading sessions and progress.
    pub reading: ReadingTracker,
    /// AI reading assistant.
    pub ai: AiAssistant,
    /// Text-to-speech.
    pub tts: TtsService,
    /// Translation.
    pub translation: TranslationService,
    /// Per-user AI settings and preferences.
    pub settings: SettingsService,
}

impl AppState {
    /// State backed by the HTTP implementations of every backend.
    pub fn new(config: Config, db: Database) -> Result<Self> {
        let llm: Arc<dyn LlmBackend> = Arc::new(HttpLlmBackend::new(&config.ai)?);
        let speech: Arc<dyn SpeechBackend> = Arc::new(HttpSpeechBackend::new(&config.tts)?);
        let translator: Arc<dyn TranslationBackend> = Arc::new(LlmTranslator::new(
            llm.clone(),
            config.translation.languages.clone(),
            config.translation.temperature,
        ));
        Ok(Self::with_backends(config, db, llm, speech, translator))
    }

    /// State over the given backends.
    pub fn with_backends(
        config: Config,
        db: Database,
        llm: Arc<dyn LlmBackend>,
        speech: Arc<dyn SpeechBackend>,
        translator: Arc<dyn TranslationBackend>,
    ) -> Self {
        let auth = AuthService::new(
            db.clone(),
            config.auth.session_days,
            config.auth.registration_enabled(),
        );
        let cache = CacheStore::new(db.clone());

        Self {
            library: Library::new(db.clone(), config.storage.clone(), &config.reader),
            notes: NoteService::new(db.clone()),
            reading: ReadingTracker::new(db.clone()),
            ai: AiAssistant::new(db.clone(), llm),
            tts: TtsService::new(db.clone(), cache.clone(), speech, config.tts.clone()),
            translation: TranslationService::new(
                db.clone(),
                cache,
                translator,
                config.translation.clone(),
            ),
            settings: SettingsService::new(
                db.clone(),
                config.ai.clone(),
                config.tts.voices.clone(),
            ),
            auth: Arc::new(auth),
            config: Arc::new(config),
            db,
        }
    }

    /// Remove idle TTS and translation cache entries; returns (tts, translation) counts.
    pub fn cleanup_caches(&self, days: u32) -> Result<(usize, usize)> {
        let tts = self.tts.cleanup(days)?;
        let translation = self.translation.cleanup(days)?;
        Ok((tts, translation))
    }

    /// Periodically clean caches and expired logins (non-blocking).
    pub fn spawn_maintenance(&self) {
        let interval = self.config.cache.cleanup_interval_seconds;
        if interval == 0 {
            return;
        }

        let state = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval));
            ticker.tick().await;
            loop {
                ticker.tick().await;

                let days = state.config.cache.max_age_days;
                let worker = state.clone();
                let outcome = tokio::task::spawn_blocking(move || {
                    let removed = worker.cleanup_caches(days)?;
                    let sessions = worker.db.cleanup_expired_sessions()?;
                    Ok::<_, crate::error::AppError>((removed, sessions))
                })
                .await;

                match outcome {
                    Ok(Ok(((tts, translation), sessions))) => {
                        tracing::info!(tts, translation, sessions, "Maintenance completed");
                    }
                    Ok(Err(e)) => tracing::error!(error = %e, "Maintenance failed"),
                    Err(e) => tracing::error!(error = %e, "Maintenance task panicked"),
                }
            }
        });
    }
}

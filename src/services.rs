//! Wrappers around the external AI, speech and translation backends.

pub mod ai;
pub mod backend;
pub mod cache;
pub mod language;
pub mod tts;
pub mod translation;

pub use ai::AiAssistant;
pub use backend::{
    ChatMessage, Completion, HttpLlmBackend, HttpSpeechBackend, LlmBackend, LlmTranslator, Prompt,
    SpeechBackend, SpeechRequest, TranslationBackend,
};
pub use cache::CacheStore;
pub use tts::TtsService;
pub use translation::TranslationService;

use crate::config::Config;
use crate::db::{Database, User};
use crate::error::{AppError, Result};
use crate::library::notes::{ExportFormat, NewNote};
use crate::library::{BookOverrides, UploadFile};
use crate::reading::{Period, ProgressUpdate};
use crate::server::{AppState, create_router};
use crate::services::ai::Question;
use crate::services::tts::SpeechOptions;
use crate::settings::{AiConfigUpdate, PreferencesUpdate};
use crate::services::{
    Completion, LlmBackend, Prompt, SpeechBackend, SpeechRequest, TranslationBackend,
};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use std::sync::{Arc, Barrier};
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;
use tower::ServiceExt;

const BOOK_TEXT: &str = "Chapter 1\nThe desert planet wakes.\n\nChapter 2\nThe spice must flow.\n";

#[derive(Default)]
struct FakeLlm {
    calls: AtomicUsize,
}

#[async_trait]
impl LlmBackend for FakeLlm {
    async fn complete(&self, _prompt: &Prompt) -> Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Completion {
            content: "Summary: A planet.\n\nKey points:\n1. Sand\n2. Spice".to_string(),
            tokens_used: 12,
        })
    }

    fn model(&self) -> &str {
        "fake-llm"
    }
}

#[derive(Default)]
struct FakeSpeech {
    calls: AtomicUsize,
}

#[async_trait]
impl SpeechBackend for FakeSpeech {
    async fn synthesize(&self, request: &SpeechRequest<'_>) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("audio:{}", request.text).into_bytes())
    }
}

#[derive(Default)]
struct FakeTranslator {
    calls: AtomicUsize,
}

#[async_trait]
impl TranslationBackend for FakeTranslator {
    async fn translate(&self, text: &str, _source: &str, target: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if text.contains("fail") {
            return Err(AppError::Backend("HTTP 500: boom".into()));
        }
        Ok(format!("[{}] {}", target, text))
    }

    fn model(&self) -> &str {
        "fake-translator"
    }
}

struct Fixture {
    _dir: TempDir,
    state: AppState,
    llm: Arc<FakeLlm>,
    speech: Arc<FakeSpeech>,
    translator: Arc<FakeTranslator>,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.storage.books_dir = dir.path().join("books");
    config.tts.cache_dir = dir.path().join("audio");

    let llm = Arc::new(FakeLlm::default());
    let speech = Arc::new(FakeSpeech::default());
    let translator = Arc::new(FakeTranslator::default());

    let state = AppState::with_backends(
        config,
        Database::open_memory().unwrap(),
        llm.clone(),
        speech.clone(),
        translator.clone(),
    );

    Fixture {
        _dir: dir,
        state,
        llm,
        speech,
        translator,
    }
}

fn add_user(state: &AppState, username: &str) -> User {
    state.auth.create_user(username, "secret-pw", "user").unwrap()
}

fn upload_book(state: &AppState, user: &User) -> String {
    let file = UploadFile {
        filename: "dune.txt".to_string(),
        data: BOOK_TEXT.as_bytes().to_vec(),
    };
    let overrides = BookOverrides {
        title: Some("Dune".to_string()),
        ..Default::default()
    };
    state.library.upload(&user.id, &file, &overrides).unwrap().id
}

// ========== Library ==========

#[test]
fn upload_splits_text_into_chapters() {
    let f = fixture();
    let user = add_user(&f.state, "alice");
    let book_id = upload_book(&f.state, &user);

    let book = f.state.library.get_book(&user.id, &book_id).unwrap();
    assert_eq!(book.title, "Dune");
    assert_eq!(book.processing_status, "completed");
    assert_eq!(book.chapter_count, 2);

    let chapters = f.state.library.list_chapters(&user.id, &book_id).unwrap();
    assert_eq!(chapters.len(), 2);

    let second = f.state.library.get_chapter(&user.id, &book_id, 2).unwrap();
    assert_eq!(second.title, "Chapter 2");
    assert_eq!(second.content, "The spice must flow.");

    assert!(matches!(
        f.state.library.get_chapter(&user.id, &book_id, 3),
        Err(AppError::NotFound(_))
    ));
}

#[test]
fn books_are_private_to_their_owner() {
    let f = fixture();
    let alice = add_user(&f.state, "alice");
    let bob = add_user(&f.state, "bob");
    let book_id = upload_book(&f.state, &alice);

    assert!(matches!(
        f.state.library.get_book(&bob.id, &book_id),
        Err(AppError::NotFound(_))
    ));
    assert!(f.state.library.list_books(&bob.id, None).unwrap().is_empty());
}

#[test]
fn rejects_unknown_and_empty_uploads() {
    let f = fixture();
    let user = add_user(&f.state, "alice");
    let overrides = BookOverrides::default();

    let exe = UploadFile {
        filename: "tool.exe".to_string(),
        data: vec![1, 2, 3],
    };
    assert!(matches!(
        f.state.library.upload(&user.id, &exe, &overrides),
        Err(AppError::InvalidFormat(_))
    ));

    let empty = UploadFile {
        filename: "empty.txt".to_string(),
        data: Vec::new(),
    };
    assert!(f.state.library.upload(&user.id, &empty, &overrides).is_err());
}

#[test]
fn blank_book_is_marked_failed() {
    let f = fixture();
    let user = add_user(&f.state, "alice");
    let blank = UploadFile {
        filename: "blank.txt".to_string(),
        data: b"  \n\n\t \n".to_vec(),
    };

    let book = f
        .state
        .library
        .upload(&user.id, &blank, &BookOverrides::default())
        .unwrap();
    assert_eq!(book.processing_status, "failed");
    assert_eq!(book.chapter_count, 0);
    assert!(f.state.library.list_chapters(&user.id, &book.id).unwrap().is_empty());
}

#[test]
fn failed_insert_leaves_no_file_behind() {
    let f = fixture();
    let file = UploadFile {
        filename: "dune.txt".to_string(),
        data: BOOK_TEXT.as_bytes().to_vec(),
    };

    let result = f
        .state
        .library
        .upload("no-such-user", &file, &BookOverrides::default());
    assert!(matches!(result, Err(AppError::Database(_))));

    let user_dir = f.state.config.storage.books_dir.join("no-such-user");
    let leftovers = std::fs::read_dir(&user_dir).map(|d| d.count()).unwrap_or(0);
    assert_eq!(leftovers, 0);
}

#[test]
fn delete_book_removes_file_and_rows() {
    let f = fixture();
    let user = add_user(&f.state, "alice");
    let book_id = upload_book(&f.state, &user);
    let (_, path, _) = f.state.library.book_file(&user.id, &book_id).unwrap();
    assert!(path.is_file());

    f.state.library.delete_book(&user.id, &book_id).unwrap();
    assert!(!path.exists());
    assert!(f.state.library.get_book(&user.id, &book_id).is_err());
}

#[test]
fn batch_processes_every_file() {
    let f = fixture();
    let user = add_user(&f.state, "alice");
    let files = vec![
        UploadFile {
            filename: "one.txt".to_string(),
            data: BOOK_TEXT.as_bytes().to_vec(),
        },
        UploadFile {
            filename: "two.exe".to_string(),
            data: vec![0],
        },
    ];

    let batch = f
        .state
        .library
        .create_batch(&user.id, Some("shelf"), files.len())
        .unwrap();
    let batch = f.state.library.process_batch(batch, files).unwrap();
    assert_eq!(batch.total_files, 2);
    assert_eq!(batch.processed_files, 2);
    assert_eq!(batch.successful_files, 1);
    assert_eq!(batch.failed_files, 1);
    assert_eq!(batch.status, "partial");
    assert!(batch.error_log.contains("two.exe"));
    assert_eq!(batch.progress_percentage(), 100.0);
}

// ========== Reading ==========

#[test]
fn only_one_open_session_per_book() {
    let f = fixture();
    let user = add_user(&f.state, "alice");
    let book_id = upload_book(&f.state, &user);
    let reading = &f.state.reading;

    let first = reading
        .start_session_at(&user.id, &book_id, Some(1), 1_000)
        .unwrap();
    let second = reading
        .start_session_at(&user.id, &book_id, Some(2), 1_600)
        .unwrap();

    assert!(matches!(
        reading.end_session_at(&user.id, &first.id, 10, 1_700),
        Err(AppError::NotFound(_))
    ));

    let summary = reading
        .end_session_at(&user.id, &second.id, 300, 1_720)
        .unwrap();
    assert_eq!(summary.duration_seconds, 120);
    assert_eq!(summary.reading_speed, 150.0);
    assert_eq!(summary.formatted_duration, "2m");

    let stats = reading.book_statistics(&user.id, &book_id).unwrap();
    assert_eq!(stats.session_count, 2);
    assert_eq!(stats.total_reading_seconds, 720);
}

#[test]
fn session_on_missing_chapter_is_not_found() {
    let f = fixture();
    let user = add_user(&f.state, "alice");
    let book_id = upload_book(&f.state, &user);

    assert!(matches!(
        f.state.reading.start_session(&user.id, &book_id, Some(9)),
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        f.state.reading.start_session(&user.id, "missing", None),
        Err(AppError::NotFound(_))
    ));
}

#[test]
fn progress_only_moves_forward_during_a_session() {
    let f = fixture();
    let user = add_user(&f.state, "alice");
    let book_id = upload_book(&f.state, &user);
    let reading = &f.state.reading;

    let update = |chapter, percentage| ProgressUpdate {
        chapter,
        position: 0,
        percentage,
    };

    let fresh = reading.get_progress(&user.id, &book_id).unwrap();
    assert_eq!(fresh.current_chapter, 1);
    assert_eq!(fresh.percentage, 0.0);

    let session = reading.start_session(&user.id, &book_id, Some(1)).unwrap();
    reading.save_progress(&user.id, &book_id, &update(2, 60.0)).unwrap();
    let kept = reading.save_progress(&user.id, &book_id, &update(1, 20.0)).unwrap();
    assert_eq!(kept.percentage, 60.0);
    assert_eq!(kept.current_chapter, 1);

    reading.end_session(&user.id, &session.id, 0).unwrap();
    let reset = reading.save_progress(&user.id, &book_id, &update(1, 20.0)).unwrap();
    assert_eq!(reset.percentage, 20.0);

    let clamped = reading.save_progress(&user.id, &book_id, &update(2, 250.0)).unwrap();
    assert_eq!(clamped.percentage, 100.0);

    assert!(reading.save_progress(&user.id, &book_id, &update(0, 5.0)).is_err());
}

#[test]
fn concurrent_progress_keeps_the_furthest_position() {
    let f = fixture();
    let user = add_user(&f.state, "alice");
    let book_id = upload_book(&f.state, &user);
    f.state.reading.start_session(&user.id, &book_id, Some(1)).unwrap();

    for round in 0..5 {
        let writers = 8;
        let barrier = Arc::new(Barrier::new(writers));
        let handles: Vec<_> = (0..writers)
            .map(|i| {
                let reading = f.state.reading.clone();
                let barrier = barrier.clone();
                let (user_id, book_id) = (user.id.clone(), book_id.clone());
                std::thread::spawn(move || {
                    let update = ProgressUpdate {
                        chapter: 1,
                        position: i as i64,
                        percentage: (round * 10 + ((i * 3) % writers)) as f64,
                    };
                    barrier.wait();
                    reading.save_progress(&user_id, &book_id, &update).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stored = f.state.reading.get_progress(&user.id, &book_id).unwrap();
        assert_eq!(stored.percentage, (round * 10 + writers - 1) as f64);
    }
}

#[test]
fn ending_an_unknown_session_is_not_found() {
    let f = fixture();
    let user = add_user(&f.state, "alice");
    let other = add_user(&f.state, "bob");
    let book_id = upload_book(&f.state, &user);

    assert!(matches!(
        f.state.reading.end_session(&user.id, "never-started", 10),
        Err(AppError::NotFound(_))
    ));

    let session = f.state.reading.start_session(&user.id, &book_id, None).unwrap();
    assert!(matches!(
        f.state.reading.end_session(&other.id, &session.id, 10),
        Err(AppError::NotFound(_))
    ));
}

#[test]
fn period_statistics_count_closed_sessions() {
    let f = fixture();
    let user = add_user(&f.state, "alice");
    let book_id = upload_book(&f.state, &user);
    let reading = &f.state.reading;

    // 2024-05-15 12:00:00 UTC
    let noon = 1_715_774_400;
    let session = reading
        .start_session_at(&user.id, &book_id, None, noon)
        .unwrap();
    reading
        .end_session_at(&user.id, &session.id, 500, noon + 600)
        .unwrap();

    let date = chrono::NaiveDate::from_ymd_opt(2024, 5, 15).unwrap();
    let weekly = reading
        .period_statistics(&user.id, Period::Weekly, date)
        .unwrap();
    assert_eq!(weekly.sessions_count, 1);
    assert_eq!(weekly.total_reading_time, 600);
    assert_eq!(weekly.books_read, 1);
    assert_eq!(weekly.total_words, 500);

    let next_day = date.succ_opt().unwrap();
    let daily = reading
        .period_statistics(&user.id, Period::Daily, next_day)
        .unwrap();
    assert_eq!(daily.sessions_count, 0);
}

// ========== Notes ==========

fn note(chapter: i64, content: &str) -> NewNote {
    NewNote {
        chapter_number: chapter,
        position_start: 0,
        position_end: 4,
        selected_text: "The desert".to_string(),
        content: content.to_string(),
        note_type: "highlight".to_string(),
        color: "yellow".to_string(),
        tags: "arrakis".to_string(),
    }
}

#[test]
fn notes_crud_search_and_export() {
    let f = fixture();
    let user = add_user(&f.state, "alice");
    let book_id = upload_book(&f.state, &user);
    let notes = &f.state.notes;

    let created = notes.create(&user.id, &book_id, note(1, "Fear is the mind-killer")).unwrap();
    notes.create(&user.id, &book_id, note(2, "Water discipline")).unwrap();

    assert!(matches!(
        notes.create(&user.id, &book_id, note(5, "nowhere")),
        Err(AppError::NotFound(_))
    ));

    assert_eq!(notes.list(&user.id, &book_id, None, Some(1)).unwrap().len(), 1);
    assert_eq!(notes.search(&user.id, "mind").unwrap().len(), 1);
    assert_eq!(notes.search(&user.id, "arrakis").unwrap().len(), 2);

    let markdown = notes.export(&user.id, Some(&book_id), ExportFormat::Markdown).unwrap();
    assert!(markdown.contains("## Dune"));
    assert!(markdown.contains("### Chapter 2"));

    let exported: Vec<Value> =
        serde_json::from_str(&notes.export(&user.id, None, ExportFormat::Json).unwrap()).unwrap();
    assert_eq!(exported.len(), 2);

    notes.delete(&user.id, &created.id).unwrap();
    assert!(matches!(
        notes.delete(&user.id, &created.id),
        Err(AppError::NotFound(_))
    ));
}

// ========== AI ==========

#[tokio::test]
async fn chapter_summary_is_generated_once() {
    let f = fixture();
    let user = add_user(&f.state, "alice");
    let book_id = upload_book(&f.state, &user);

    let first = f
        .state
        .ai
        .summarize_chapter(&user.id, &book_id, 1, "auto")
        .await
        .unwrap();
    assert!(!first.from_cache);
    assert_eq!(first.summary.summary, "A planet.");
    assert_eq!(first.summary.key_points, vec!["Sand", "Spice"]);

    let second = f
        .state
        .ai
        .summarize_chapter(&user.id, &book_id, 1, "auto")
        .await
        .unwrap();
    assert!(second.from_cache);
    assert_eq!(f.llm.calls.load(Ordering::SeqCst), 1);

    assert!(matches!(
        f.state.ai.summarize_chapter(&user.id, &book_id, 7, "auto").await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn questions_are_recorded_and_rated() {
    let f = fixture();
    let user = add_user(&f.state, "alice");
    let book_id = upload_book(&f.state, &user);

    let question = Question {
        question: "Who rules the desert?".to_string(),
        question_type: "text".to_string(),
        selected_text: None,
        chapter_number: Some(1),
    };
    let entry = f.state.ai.ask(&user.id, &book_id, question).await.unwrap();
    assert_eq!(entry.model, "fake-llm");
    assert_eq!(entry.tokens_used, 12);

    f.state.ai.rate_answer(&user.id, &entry.id, true).unwrap();
    let stats = f.state.reading.book_statistics(&user.id, &book_id).unwrap();
    assert_eq!(stats.total_questions, 1);
    assert_eq!(stats.helpful_answers, 1);

    let history = f.state.ai.history(&user.id, Some(&book_id), 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(f.state.db.count_ai_logs(&user.id, "completed").unwrap(), 1);

    let blank = Question {
        question: "   ".to_string(),
        question_type: "text".to_string(),
        selected_text: None,
        chapter_number: None,
    };
    assert!(matches!(
        f.state.ai.ask(&user.id, &book_id, blank).await,
        Err(AppError::InvalidFormat(_))
    ));

    assert_eq!(f.state.ai.clear_history(&user.id, 0).unwrap(), 1);
    assert!(f.state.ai.history(&user.id, None, 10).unwrap().is_empty());
}

// ========== TTS ==========

#[tokio::test]
async fn speech_is_cached_by_content() {
    let f = fixture();
    let user = add_user(&f.state, "alice");
    let options = || SpeechOptions {
        text: "Hello there, traveller.".to_string(),
        language: Some("en".to_string()),
        voice: Some("alloy".to_string()),
        speed: Some(1.0),
    };

    let first = f.state.tts.generate(&user.id, options()).await.unwrap();
    assert!(!first.from_cache);
    assert_eq!(first.segments.len(), 1);
    assert!(first.audio_url.starts_with("/media/tts/"));

    let second = f.state.tts.generate(&user.id, options()).await.unwrap();
    assert!(second.from_cache);
    assert_eq!(second.audio_url, first.audio_url);
    assert_eq!(f.speech.calls.load(Ordering::SeqCst), 1);

    let faster = SpeechOptions {
        speed: Some(1.5),
        ..options()
    };
    let third = f.state.tts.generate(&user.id, faster).await.unwrap();
    assert_ne!(third.audio_url, first.audio_url);
    assert_eq!(f.speech.calls.load(Ordering::SeqCst), 2);

    assert_eq!(f.state.tts.cache_stats().unwrap().entries, 2);
}

#[tokio::test]
async fn speech_rejects_bad_input() {
    let f = fixture();
    let blank = SpeechOptions {
        text: "  ".to_string(),
        language: None,
        voice: None,
        speed: None,
    };
    assert!(f.state.tts.generate("u", blank).await.is_err());

    let too_fast = SpeechOptions {
        text: "Hi".to_string(),
        language: None,
        voice: None,
        speed: Some(9.0),
    };
    assert!(matches!(
        f.state.tts.generate("u", too_fast).await,
        Err(AppError::InvalidFormat(_))
    ));
    assert_eq!(f.speech.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn missing_audio_file_is_regenerated() {
    let f = fixture();
    let options = || SpeechOptions {
        text: "Bonjour tout le monde.".to_string(),
        language: Some("fr".to_string()),
        voice: None,
        speed: None,
    };

    let first = f.state.tts.generate("u", options()).await.unwrap();
    let file = first.audio_url.trim_start_matches("/media/tts/");
    std::fs::remove_file(f.state.config.tts.cache_dir.join(file)).unwrap();

    let second = f.state.tts.generate("u", options()).await.unwrap();
    assert!(!second.from_cache);
    assert_eq!(f.speech.calls.load(Ordering::SeqCst), 2);
}

// ========== Translation ==========

#[tokio::test]
async fn translation_is_cached_and_recorded() {
    let f = fixture();
    let user = add_user(&f.state, "alice");
    let translation = &f.state.translation;

    let first = translation
        .translate(&user.id, "Good morning", Some("fr"), "en")
        .await
        .unwrap();
    assert_eq!(first.translated_text, "[fr] Good morning");
    assert!(!first.from_cache);
    assert_eq!(first.model.as_deref(), Some("fake-translator"));

    let second = translation
        .translate(&user.id, "Good morning", Some("fr"), "en")
        .await
        .unwrap();
    assert!(second.from_cache);
    assert_eq!(f.translator.calls.load(Ordering::SeqCst), 1);

    let history = translation.history(&user.id, false, 10).unwrap();
    assert_eq!(history.len(), 2);

    let record = second.record_id.unwrap();
    assert!(translation.toggle_favorite(&user.id, &record).unwrap());
    assert_eq!(translation.history(&user.id, true, 10).unwrap().len(), 1);
}

#[tokio::test]
async fn same_language_translation_is_passthrough() {
    let f = fixture();
    let result = f
        .state
        .translation
        .translate("u", "Hello", Some("en"), "en")
        .await
        .unwrap();
    assert_eq!(result.translated_text, "Hello");
    assert_eq!(result.confidence, 1.0);
    assert!(result.record_id.is_none());
    assert_eq!(f.translator.calls.load(Ordering::SeqCst), 0);

    assert!(matches!(
        f.state.translation.translate("u", "Hello", Some("xx"), "en").await,
        Err(AppError::InvalidFormat(_))
    ));
}

#[tokio::test]
async fn batch_translation_isolates_failures() {
    let f = fixture();
    let texts = vec!["One".to_string(), "please fail".to_string(), "Three".to_string()];
    let items = f
        .state
        .translation
        .batch_translate("u", &texts, Some("de"), "en")
        .await
        .unwrap();

    let ok: Vec<bool> = items.iter().map(|i| i.success).collect();
    assert_eq!(ok, vec![true, false, true]);
    assert!(items[1].error.as_deref().unwrap().contains("boom"));

    let too_many = vec!["x".to_string(); 51];
    assert!(f
        .state
        .translation
        .batch_translate("u", &too_many, Some("de"), "en")
        .await
        .is_err());
}

#[tokio::test]
async fn cache_cleanup_spares_fresh_entries() {
    let f = fixture();
    f.state
        .translation
        .translate("u", "Good night", Some("fr"), "en")
        .await
        .unwrap();

    assert_eq!(f.state.cleanup_caches(30).unwrap(), (0, 0));
    assert_eq!(f.state.translation.cache_stats().unwrap().entries, 1);
}

// ========== Settings ==========

#[test]
fn user_ai_settings_replace_the_default_backend() {
    let f = fixture();
    let user = add_user(&f.state, "alice");
    let settings = &f.state.settings;
    assert_eq!(f.state.ai.backend_for(&user.id).unwrap().model(), "fake-llm");

    let keyless = AiConfigUpdate {
        model: Some("my-model".to_string()),
        ..Default::default()
    };
    assert!(matches!(
        settings.save_ai_config(&user.id, keyless),
        Err(AppError::InvalidFormat(_))
    ));

    let azure = AiConfigUpdate {
        provider: Some("azure".to_string()),
        api_url: Some("https://books.openai.azure.com/openai/deployments/reader".to_string()),
        api_key: Some("az-key".to_string()),
        model: Some("my-model".to_string()),
        ..Default::default()
    };
    let saved = settings.save_ai_config(&user.id, azure).unwrap();
    assert!(saved.is_active);
    assert_eq!(f.state.ai.backend_for(&user.id).unwrap().model(), "my-model");

    let view = serde_json::to_value(settings.ai_settings(&user.id).unwrap()).unwrap();
    assert_eq!(view["has_api_key"], true);
    assert_eq!(view["config"]["provider"], "azure");
    assert!(view["config"].get("api_key").is_none());

    let paused = AiConfigUpdate {
        is_active: Some(false),
        ..Default::default()
    };
    let kept = settings.save_ai_config(&user.id, paused).unwrap();
    assert_eq!(kept.api_key, "az-key");
    assert_eq!(f.state.ai.backend_for(&user.id).unwrap().model(), "fake-llm");

    let unknown = AiConfigUpdate {
        provider: Some("acme".to_string()),
        ..Default::default()
    };
    assert!(matches!(
        settings.save_ai_config(&user.id, unknown),
        Err(AppError::InvalidFormat(_))
    ));

    settings.delete_ai_config(&user.id).unwrap();
    assert!(matches!(
        settings.delete_ai_config(&user.id),
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn speech_follows_user_preferences() {
    let f = fixture();
    let user = add_user(&f.state, "alice");
    let settings = &f.state.settings;
    let options = |voice: Option<&str>| SpeechOptions {
        text: "Hello there, traveller.".to_string(),
        language: Some("en".to_string()),
        voice: voice.map(String::from),
        speed: None,
    };

    let plain = f.state.tts.generate(&user.id, options(None)).await.unwrap();
    assert_eq!(plain.voice, "alloy");
    assert_eq!(plain.speed, 1.0);

    let male = PreferencesUpdate {
        voice_type: Some("male".to_string()),
        voice_speed: Some(1.5),
        ..Default::default()
    };
    settings.save_preferences(&user.id, male).unwrap();
    let preferred = f.state.tts.generate(&user.id, options(None)).await.unwrap();
    assert_eq!(preferred.voice, "onyx");
    assert_eq!(preferred.speed, 1.5);

    let named = PreferencesUpdate {
        voice: Some("shimmer".to_string()),
        ..Default::default()
    };
    settings.save_preferences(&user.id, named).unwrap();
    let result = f.state.tts.generate(&user.id, options(None)).await.unwrap();
    assert_eq!(result.voice, "shimmer");

    let explicit = f.state.tts.generate(&user.id, options(Some("nova"))).await.unwrap();
    assert_eq!(explicit.voice, "nova");

    let bad = PreferencesUpdate {
        voice: Some("robot".to_string()),
        ..Default::default()
    };
    assert!(matches!(
        settings.save_preferences(&user.id, bad),
        Err(AppError::InvalidFormat(_))
    ));
    let slow = PreferencesUpdate {
        voice_speed: Some(0.1),
        ..Default::default()
    };
    assert!(settings.save_preferences(&user.id, slow).is_err());

    let stored = settings.preferences(&user.id).unwrap();
    assert_eq!(stored.voice.as_deref(), Some("shimmer"));
    assert_eq!(stored.voice_type.as_deref(), Some("male"));
    assert_eq!(stored.theme, "light");
}

// ========== HTTP ==========

async fn send(state: &AppState, request: Request<Body>) -> (StatusCode, Value) {
    let response = create_router(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn json_request(method: &str, uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::empty()).unwrap()
}

async fn register(state: &AppState, username: &str) -> String {
    let (status, body) = send(
        state,
        json_request(
            "POST",
            "/api/auth/register",
            None,
            json!({"username": username, "password": "secret-pw"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["token"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_is_public() {
    let f = fixture();
    let (status, body) = send(&f.state, get("/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn api_requires_a_session() {
    let f = fixture();
    let (status, body) = send(&f.state, get("/api/books", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);

    let (status, _) = send(&f.state, get("/api/books", Some("bogus"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn register_then_read_a_book_over_http() {
    let f = fixture();
    let token = register(&f.state, "alice").await;

    let (_, me) = send(&f.state, get("/api/auth/me", Some(&token))).await;
    assert_eq!(me["user"]["username"], "alice");
    let user_id = me["user"]["id"].as_str().unwrap().to_string();

    let user = f.state.db.get_user_by_username("alice").unwrap().unwrap();
    assert_eq!(user.id, user_id);
    let book_id = upload_book(&f.state, &user);

    let (status, body) = send(&f.state, get("/api/books", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["books"].as_array().unwrap().len(), 1);

    let uri = format!("/api/books/{}/chapters/1", book_id);
    let (status, body) = send(&f.state, get(&uri, Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["chapter"]["title"], "Chapter 1");
    assert_eq!(body["total_chapters"], 2);
    assert_eq!(body["has_previous"], false);
    assert_eq!(body["has_next"], true);

    let uri = format!("/api/books/{}/chapters/3", book_id);
    let (status, _) = send(&f.state, get(&uri, Some(&token))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let uri = format!("/api/books/{}/sessions", book_id);
    let (status, body) = send(&f.state, json_request("POST", &uri, Some(&token), json!({"chapter": 1}))).await;
    assert_eq!(status, StatusCode::OK);
    let session_id = body["session"]["id"].as_str().unwrap().to_string();

    let uri = format!("/api/sessions/{}/end", session_id);
    let (status, body) = send(&f.state, json_request("POST", &uri, Some(&token), json!({"words_read": 40}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["session"]["words_read"], 40);

    let (status, _) = send(&f.state, json_request("POST", &uri, Some(&token), json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn translate_over_http() {
    let f = fixture();
    let token = register(&f.state, "alice").await;

    let request = || {
        json_request(
            "POST",
            "/api/translate",
            Some(&token),
            json!({"text": "Good morning", "target_language": "fr", "source_language": "en"}),
        )
    };
    let (status, body) = send(&f.state, request()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["translation"]["translated_text"], "[fr] Good morning");
    assert_eq!(body["translation"]["from_cache"], false);

    let (_, body) = send(&f.state, request()).await;
    assert_eq!(body["translation"]["from_cache"], true);

    let (status, body) = send(&f.state, get("/api/translate/languages", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["languages"]["fr"], "French");
}

#[tokio::test]
async fn cache_cleanup_is_admin_only() {
    let f = fixture();
    let token = register(&f.state, "alice").await;
    let (status, body) = send(
        &f.state,
        json_request("POST", "/api/tts/cache/cleanup", Some(&token), json!({"days": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn malformed_requests_use_the_error_envelope() {
    let f = fixture();
    let token = register(&f.state, "alice").await;

    let (status, body) = send(
        &f.state,
        json_request("POST", "/api/translate", Some(&token), json!({"target_language": "fr"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("text"));

    let (status, body) = send(&f.state, get("/api/books/any/chapters/abc", Some(&token))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);

    let (status, body) = send(
        &f.state,
        json_request("POST", "/api/sessions/never-started/end", Some(&token), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn settings_over_http() {
    let f = fixture();
    let token = register(&f.state, "alice").await;

    let (status, body) = send(&f.state, get("/api/preferences", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["preferences"]["theme"], "light");

    let (status, body) = send(
        &f.state,
        json_request("PUT", "/api/preferences", Some(&token), json!({"theme": "dark", "auto_read": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["preferences"]["theme"], "dark");
    assert_eq!(body["preferences"]["auto_read"], true);

    let (status, body) = send(
        &f.state,
        json_request("PUT", "/api/preferences", Some(&token), json!({"theme": "neon"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);

    let (status, body) = send(
        &f.state,
        json_request(
            "PUT",
            "/api/ai/config",
            Some(&token),
            json!({"provider": "anthropic", "api_url": "https://api.anthropic.com/v1", "api_key": "sk-ant", "model": "claude-x"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["config"]["model"], "claude-x");
    assert!(body["config"].get("api_key").is_none());

    let (_, body) = send(&f.state, get("/api/ai/config", Some(&token))).await;
    assert_eq!(body["settings"]["config"]["provider"], "anthropic");
    assert_eq!(body["settings"]["has_api_key"], true);
    assert_eq!(body["settings"]["default_model"], "gpt-3.5-turbo");

    let delete = Request::builder()
        .method("DELETE")
        .uri("/api/ai/config")
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&f.state, delete).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&f.state, get("/api/ai/config", Some(&token))).await;
    assert!(body["settings"]["config"].is_null());
}

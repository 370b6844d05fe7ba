//! HTTP request handlers.

use crate::auth::SESSION_COOKIE;
use crate::db::User;
use crate::error::{AppError, Result};
use crate::library::book::download_filename;
use crate::library::notes::{ExportFormat, NewNote, NoteUpdate};
use crate::library::{BookOverrides, UploadFile};
use crate::reading::{Period, ProgressUpdate};
use crate::server::AppState;
use crate::server::extract::{AppJson, AppPath, AppQuery};
use crate::services::ai::Question;
use crate::services::tts::SpeechOptions;
use crate::settings::{AiConfigUpdate, PreferencesUpdate};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::io::ReaderStream;

/// Most files accepted in one batch upload.
pub const MAX_BATCH_FILES: usize = 20;

/// `{"success": true, "<key>": value}`.
fn reply<T: Serialize>(key: &str, value: T) -> Result<Json<Value>> {
    let value = serde_json::to_value(value)
        .map_err(|e| AppError::Internal(format!("Failed to encode response: {}", e)))?;
    let mut body = serde_json::Map::new();
    body.insert("success".to_string(), Value::Bool(true));
    body.insert(key.to_string(), value);
    Ok(Json(Value::Object(body)))
}

fn done() -> Json<Value> {
    Json(json!({"success": true}))
}

/// Run blocking work (file parsing) off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::Internal(format!("Background task failed: {}", e)))?
}

/// Liveness probe.
pub async fn health() -> Json<Value> {
    Json(json!({
        "success": true,
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ============================================================================
// AUTH API
// ============================================================================

/// Login or register request.
#[derive(Debug, Deserialize)]
pub struct Credentials {
    username: String,
    password: String,
}

/// Token issued on login.
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    success: bool,
    token: String,
    user: User,
}

fn session_cookie(token: &str, max_age_days: u32) -> String {
    format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        SESSION_COOKIE,
        token,
        u64::from(max_age_days) * 86_400
    )
}

fn login_response(state: &AppState, user: User, token: String) -> Response {
    let cookie = session_cookie(&token, state.config.auth.session_days);
    (
        [(header::SET_COOKIE, cookie)],
        Json(LoginResponse {
            success: true,
            token,
            user,
        }),
    )
        .into_response()
}

/// Auth login.
pub async fn auth_login(
    State(state): State<AppState>,
    AppJson(req): AppJson<Credentials>,
) -> Result<Response> {
    let (user, token) = state.auth.login(&req.username, &req.password)?;
    tracing::info!(username = %user.username, "User logged in");
    Ok(login_response(&state, user, token))
}

/// Auth register; logs the new user in.
pub async fn auth_register(
    State(state): State<AppState>,
    AppJson(req): AppJson<Credentials>,
) -> Result<Response> {
    state.auth.register(&req.username, &req.password)?;
    let (user, token) = state.auth.login(&req.username, &req.password)?;
    Ok(login_response(&state, user, token))
}

/// Auth logout.
pub async fn auth_logout(State(state): State<AppState>, headers: HeaderMap) -> Result<Response> {
    if let Some(token) = extract_token(&headers) {
        state.auth.logout(&token)?;
    }
    let cookie = format!("{}=; Path=/; HttpOnly; Max-Age=0", SESSION_COOKIE);
    Ok(([(header::SET_COOKIE, cookie)], done()).into_response())
}

/// Get current user info.
pub async fn auth_me(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    reply("user", user)
}

// ============================================================================
// BOOKS API
// ============================================================================

/// Book search parameters.
#[derive(Debug, Deserialize)]
pub struct BookQuery {
    search: Option<String>,
}

/// List the user's books.
pub async fn list_books(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppQuery(query): AppQuery<BookQuery>,
) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    let search = query.search.as_deref().filter(|s| !s.trim().is_empty());
    reply("books", state.library.list_books(&user.id, search)?)
}

async fn read_field(field: axum::extract::multipart::Field<'_>) -> Result<Vec<u8>> {
    field
        .bytes()
        .await
        .map(|b| b.to_vec())
        .map_err(|e| AppError::InvalidFormat(format!("Invalid upload: {}", e)))
}

async fn read_text(field: axum::extract::multipart::Field<'_>) -> Result<String> {
    field
        .text()
        .await
        .map_err(|e| AppError::InvalidFormat(format!("Invalid upload: {}", e)))
}

/// Upload one book (multipart: `file`, optional `title`, `author`, `description`).
pub async fn upload_book(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;

    let mut file = None;
    let mut overrides = BookOverrides::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::InvalidFormat(format!("Invalid upload: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let data = read_field(field).await?;
                file = Some(UploadFile { filename, data });
            }
            "title" => overrides.title = Some(read_text(field).await?),
            "author" => overrides.author = Some(read_text(field).await?),
            "description" => overrides.description = Some(read_text(field).await?),
            _ => {}
        }
    }

    let file = file.ok_or_else(|| AppError::InvalidFormat("Missing file field".into()))?;
    let library = state.library.clone();
    let book = blocking(move || library.upload(&user.id, &file, &overrides)).await?;
    reply("book", book)
}

/// Upload several books (multipart: repeated `files`, optional `name`).
///
/// Returns the batch immediately; files are parsed in the background.
pub async fn batch_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;

    let mut files = Vec::new();
    let mut name = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::InvalidFormat(format!("Invalid upload: {}", e)))?
    {
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            "files" | "file" => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let data = read_field(field).await?;
                files.push(UploadFile { filename, data });
            }
            "name" => name = Some(read_text(field).await?),
            _ => {}
        }
    }

    if files.is_empty() {
        return Err(AppError::InvalidFormat("No files uploaded".into()));
    }
    if files.len() > MAX_BATCH_FILES {
        return Err(AppError::InvalidFormat(format!(
            "At most {} files per batch",
            MAX_BATCH_FILES
        )));
    }

    let batch = state
        .library
        .create_batch(&user.id, name.as_deref(), files.len())?;
    state.library.start_batch(batch.clone(), files);
    reply("batch", batch)
}

/// Batch status with its progress percentage.
pub async fn get_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppPath(id): AppPath<String>,
) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    let batch = state.library.get_batch(&user.id, &id)?;
    let progress = batch.progress_percentage();
    Ok(Json(json!({
        "success": true,
        "batch": batch,
        "progress_percentage": progress,
    })))
}

/// Book metadata.
pub async fn get_book(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppPath(id): AppPath<String>,
) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    reply("book", state.library.get_book(&user.id, &id)?)
}

/// Delete a book with its file.
pub async fn delete_book(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppPath(id): AppPath<String>,
) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    state.library.delete_book(&user.id, &id)?;
    Ok(done())
}

/// Book download.
pub async fn download_book(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppPath(id): AppPath<String>,
) -> Result<Response<Body>> {
    let user = get_authenticated_user(&state, &headers)?;
    let (book, path, format) = state.library.book_file(&user.id, &id)?;

    let file = tokio::fs::File::open(&path).await?;
    let body = Body::from_stream(ReaderStream::new(file));

    let filename = download_filename(&book.title, format.as_str());
    let content_disposition = format!(
        "attachment; filename=\"{}.{}\"; filename*=UTF-8''{}",
        book.id,
        format.as_str(),
        urlencoding::encode(&filename)
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, format.mime_type())
        .header(header::CONTENT_DISPOSITION, content_disposition)
        .header(header::CONTENT_LENGTH, book.file_size)
        .body(body)
        .map_err(|e| AppError::Internal(format!("Failed to build response: {}", e)))
}

/// Chapter listing.
pub async fn list_chapters(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppPath(id): AppPath<String>,
) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    reply("chapters", state.library.list_chapters(&user.id, &id)?)
}

/// One chapter with its text.
pub async fn get_chapter(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppPath((id, number)): AppPath<(String, i64)>,
) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    let chapter = state.library.get_chapter(&user.id, &id, number)?;
    let total = state.library.list_chapters(&user.id, &id)?.len() as i64;
    Ok(Json(json!({
        "success": true,
        "chapter": chapter,
        "total_chapters": total,
        "has_previous": number > 1,
        "has_next": number < total,
    })))
}

// ============================================================================
// READING API
// ============================================================================

/// Current reading progress.
pub async fn get_progress(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppPath(id): AppPath<String>,
) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    reply("progress", state.reading.get_progress(&user.id, &id)?)
}

/// Save reading progress.
pub async fn save_progress(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppPath(id): AppPath<String>,
    AppJson(update): AppJson<ProgressUpdate>,
) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    reply("progress", state.reading.save_progress(&user.id, &id, &update)?)
}

/// Session start request.
#[derive(Debug, Default, Deserialize)]
pub struct StartSessionRequest {
    #[serde(default)]
    chapter: Option<i64>,
}

/// Open a reading session.
pub async fn start_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppPath(id): AppPath<String>,
    body: Option<AppJson<StartSessionRequest>>,
) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    let req = body.map(|AppJson(r)| r).unwrap_or_default();
    reply("session", state.reading.start_session(&user.id, &id, req.chapter)?)
}

/// Session end request.
#[derive(Debug, Default, Deserialize)]
pub struct EndSessionRequest {
    #[serde(default)]
    words_read: i64,
}

/// Close a reading session.
pub async fn end_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppPath(id): AppPath<String>,
    body: Option<AppJson<EndSessionRequest>>,
) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    let req = body.map(|AppJson(r)| r).unwrap_or_default();
    reply("session", state.reading.end_session(&user.id, &id, req.words_read)?)
}

/// Reading statistics of a book.
pub async fn book_statistics(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppPath(id): AppPath<String>,
) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    reply("statistics", state.reading.book_statistics(&user.id, &id)?)
}

/// Period statistics parameters.
#[derive(Debug, Deserialize)]
pub struct PeriodQuery {
    period: Option<String>,
    date: Option<String>,
}

/// Reading statistics over a day, week, month or year.
pub async fn period_statistics(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppQuery(query): AppQuery<PeriodQuery>,
) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    let period = Period::parse(query.period.as_deref().unwrap_or("weekly"))?;
    let date = match query.date.as_deref() {
        Some(d) => chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d")
            .map_err(|_| AppError::InvalidFormat(format!("Invalid date: {}", d)))?,
        None => chrono::Utc::now().date_naive(),
    };
    reply("statistics", state.reading.period_statistics(&user.id, period, date)?)
}

// ============================================================================
// NOTES API
// ============================================================================

/// Note filters.
#[derive(Debug, Deserialize)]
pub struct NoteQuery {
    #[serde(rename = "type")]
    note_type: Option<String>,
    chapter: Option<i64>,
}

/// Notes on a book.
pub async fn list_notes(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppPath(id): AppPath<String>,
    AppQuery(query): AppQuery<NoteQuery>,
) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    let notes = state
        .notes
        .list(&user.id, &id, query.note_type.as_deref(), query.chapter)?;
    reply("notes", notes)
}

/// Create a note.
pub async fn create_note(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppPath(id): AppPath<String>,
    AppJson(new): AppJson<NewNote>,
) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    reply("note", state.notes.create(&user.id, &id, new)?)
}

/// Update a note.
pub async fn update_note(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppPath(id): AppPath<String>,
    AppJson(update): AppJson<NoteUpdate>,
) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    reply("note", state.notes.update(&user.id, &id, update)?)
}

/// Delete a note.
pub async fn delete_note(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppPath(id): AppPath<String>,
) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    state.notes.delete(&user.id, &id)?;
    Ok(done())
}

/// Note search parameters.
#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    q: String,
}

/// Full text note search.
pub async fn search_notes(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppQuery(query): AppQuery<SearchQuery>,
) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    reply("notes", state.notes.search(&user.id, &query.q)?)
}

/// Export parameters.
#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    book_id: Option<String>,
    format: Option<String>,
}

/// Download notes as JSON or Markdown.
pub async fn export_notes(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppQuery(query): AppQuery<ExportQuery>,
) -> Result<Response> {
    let user = get_authenticated_user(&state, &headers)?;
    let format = ExportFormat::parse(query.format.as_deref().unwrap_or("json"))?;
    let document = state
        .notes
        .export(&user.id, query.book_id.as_deref(), format)?;

    let extension = match format {
        ExportFormat::Json => "json",
        ExportFormat::Markdown => "md",
    };
    let disposition = format!("attachment; filename=\"reading_notes.{}\"", extension);

    Ok((
        [
            (header::CONTENT_TYPE, format.content_type().to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        document,
    )
        .into_response())
}

// ============================================================================
// AI API
// ============================================================================

/// Question about a book.
#[derive(Debug, Deserialize)]
pub struct AskRequest {
    book_id: String,
    #[serde(flatten)]
    question: Question,
}

/// Ask the reading assistant.
pub async fn ai_ask(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(req): AppJson<AskRequest>,
) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    reply("answer", state.ai.ask(&user.id, &req.book_id, req.question).await?)
}

/// Request naming a book.
#[derive(Debug, Deserialize)]
pub struct BookRequest {
    book_id: String,
}

/// Summarize a book.
pub async fn ai_summary(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(req): AppJson<BookRequest>,
) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    reply("summary", state.ai.summarize_book(&user.id, &req.book_id).await?)
}

fn default_summary_type() -> String {
    "auto".to_string()
}

/// Chapter summary request.
#[derive(Debug, Deserialize)]
pub struct ChapterSummaryRequest {
    book_id: String,
    chapter_number: i64,
    #[serde(default = "default_summary_type")]
    summary_type: String,
}

/// Summarize a chapter.
pub async fn ai_chapter_summary(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(req): AppJson<ChapterSummaryRequest>,
) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    let summary = state
        .ai
        .summarize_chapter(&user.id, &req.book_id, req.chapter_number, &req.summary_type)
        .await?;
    reply("summary", summary)
}

/// Extract book keywords.
pub async fn ai_keywords(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(req): AppJson<BookRequest>,
) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    reply("keywords", state.ai.extract_keywords(&user.id, &req.book_id).await?)
}

fn default_analysis_type() -> String {
    "general".to_string()
}

/// Text analysis request.
#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    text: String,
    #[serde(default = "default_analysis_type")]
    analysis_type: String,
}

/// Analyze a passage.
pub async fn ai_analyze(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(req): AppJson<AnalyzeRequest>,
) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    let analysis = state
        .ai
        .analyze_text(&user.id, &req.text, &req.analysis_type)
        .await?;
    reply("analysis", analysis)
}

/// Check the LLM backend configuration.
pub async fn ai_test(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    reply("result", state.ai.test_backend(&user.id).await?)
}

/// The user's own LLM settings.
pub async fn ai_get_config(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    reply("settings", state.settings.ai_settings(&user.id)?)
}

/// Store the user's LLM settings.
pub async fn ai_save_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(update): AppJson<AiConfigUpdate>,
) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    reply("config", state.settings.save_ai_config(&user.id, update)?)
}

/// Drop the user's LLM settings.
pub async fn ai_delete_config(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    state.settings.delete_ai_config(&user.id)?;
    Ok(done())
}

/// History parameters.
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    book_id: Option<String>,
    limit: Option<usize>,
    #[serde(default)]
    favorites: bool,
}

/// Question history.
pub async fn ai_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppQuery(query): AppQuery<HistoryQuery>,
) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    let limit = query.limit.unwrap_or(20).min(200);
    reply("history", state.ai.history(&user.id, query.book_id.as_deref(), limit)?)
}

/// History clearing request.
#[derive(Debug, Default, Deserialize)]
pub struct ClearHistoryRequest {
    #[serde(default)]
    older_than_days: u32,
}

/// Delete question history.
pub async fn ai_clear_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<AppJson<ClearHistoryRequest>>,
) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    let req = body.map(|AppJson(r)| r).unwrap_or_default();
    reply("deleted", state.ai.clear_history(&user.id, req.older_than_days)?)
}

/// Rating of an answer.
#[derive(Debug, Deserialize)]
pub struct RateRequest {
    helpful: bool,
}

/// Rate an answer.
pub async fn ai_rate(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppPath(id): AppPath<String>,
    AppJson(req): AppJson<RateRequest>,
) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    state.ai.rate_answer(&user.id, &id, req.helpful)?;
    Ok(done())
}

// ============================================================================
// TTS API
// ============================================================================

/// Synthesize speech.
pub async fn tts_generate(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(req): AppJson<SpeechOptions>,
) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    let result = state.tts.generate(&user.id, req).await?;
    Ok(Json(json!({
        "success": true,
        "audio_url": result.audio_url,
        "result": result,
    })))
}

/// Voice filter.
#[derive(Debug, Deserialize)]
pub struct VoiceQuery {
    language: Option<String>,
}

/// Available voices.
pub async fn tts_voices(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppQuery(query): AppQuery<VoiceQuery>,
) -> Result<Json<Value>> {
    get_authenticated_user(&state, &headers)?;
    reply("voices", state.tts.voices(query.language.as_deref()))
}

/// Audio cache statistics.
pub async fn tts_cache_stats(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>> {
    get_authenticated_user(&state, &headers)?;
    reply("stats", state.tts.cache_stats()?)
}

/// Cleanup request.
#[derive(Debug, Default, Deserialize)]
pub struct CleanupRequest {
    days: Option<u32>,
}

/// Drop idle audio.
pub async fn tts_cache_cleanup(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<AppJson<CleanupRequest>>,
) -> Result<Json<Value>> {
    require_admin(&state, &headers)?;
    let days = body
        .and_then(|AppJson(r)| r.days)
        .unwrap_or(state.config.cache.max_age_days);
    let tts = state.tts.clone();
    reply("deleted", blocking(move || tts.cleanup(days)).await?)
}

// ============================================================================
// TRANSLATION API
// ============================================================================

fn default_source() -> String {
    "auto".to_string()
}

/// Translation request.
#[derive(Debug, Deserialize)]
pub struct TranslateRequest {
    text: String,
    target_language: Option<String>,
    #[serde(default = "default_source")]
    source_language: String,
}

/// Translate a passage.
pub async fn translate(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(req): AppJson<TranslateRequest>,
) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    let translation = state
        .translation
        .translate(
            &user.id,
            &req.text,
            req.target_language.as_deref(),
            &req.source_language,
        )
        .await?;
    reply("translation", translation)
}

/// Batch translation request.
#[derive(Debug, Deserialize)]
pub struct BatchTranslateRequest {
    texts: Vec<String>,
    target_language: Option<String>,
    #[serde(default = "default_source")]
    source_language: String,
}

/// Translate several passages.
pub async fn translate_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(req): AppJson<BatchTranslateRequest>,
) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    let items = state
        .translation
        .batch_translate(
            &user.id,
            &req.texts,
            req.target_language.as_deref(),
            &req.source_language,
        )
        .await?;
    let succeeded = items.iter().filter(|i| i.success).count();
    Ok(Json(json!({
        "success": true,
        "results": items,
        "total": req.texts.len(),
        "succeeded": succeeded,
    })))
}

/// Detection request.
#[derive(Debug, Deserialize)]
pub struct DetectRequest {
    text: String,
}

/// Detect the language of a passage.
pub async fn translate_detect(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(req): AppJson<DetectRequest>,
) -> Result<Json<Value>> {
    get_authenticated_user(&state, &headers)?;
    let detection = state.translation.detect(&req.text)?;
    Ok(Json(json!({
        "success": true,
        "detected_language": detection.language,
        "language_name": detection.language_name,
    })))
}

/// Supported languages.
pub async fn translate_languages(State(state): State<AppState>) -> Result<Json<Value>> {
    reply("languages", state.translation.supported_languages())
}

/// Translation history.
pub async fn translate_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppQuery(query): AppQuery<HistoryQuery>,
) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    let limit = query.limit.unwrap_or(20).min(200);
    reply(
        "history",
        state.translation.history(&user.id, query.favorites, limit)?,
    )
}

/// Star or unstar a translation.
pub async fn translate_favorite(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppPath(id): AppPath<String>,
) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    reply("is_favorite", state.translation.toggle_favorite(&user.id, &id)?)
}

/// Translation cache statistics.
pub async fn translate_cache_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    get_authenticated_user(&state, &headers)?;
    reply("stats", state.translation.cache_stats()?)
}

/// Drop idle translations.
pub async fn translate_cache_cleanup(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<AppJson<CleanupRequest>>,
) -> Result<Json<Value>> {
    require_admin(&state, &headers)?;
    let days = body
        .and_then(|AppJson(r)| r.days)
        .unwrap_or(state.config.cache.max_age_days);
    reply("deleted", state.translation.cleanup(days)?)
}

// ============================================================================
// PREFERENCES API
// ============================================================================

/// Reader and voice preferences.
pub async fn get_preferences(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    reply("preferences", state.settings.preferences(&user.id)?)
}

/// Update reader and voice preferences.
pub async fn save_preferences(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(update): AppJson<PreferencesUpdate>,
) -> Result<Json<Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    reply("preferences", state.settings.save_preferences(&user.id, update)?)
}

// ============================================================================
// HELPERS
// ============================================================================

/// Token from the Authorization header, or the session cookie.
fn extract_token(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string());
    if bearer.is_some() {
        return bearer;
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
}

/// Get authenticated user from token.
fn get_authenticated_user(state: &AppState, headers: &HeaderMap) -> Result<User> {
    let token = extract_token(headers)
        .ok_or_else(|| AppError::Unauthorized("Missing credentials".to_string()))?;

    state
        .auth
        .validate_token(&token)?
        .ok_or_else(|| AppError::Unauthorized("Invalid or expired token".to_string()))
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<User> {
    let user = get_authenticated_user(state, headers)?;
    if user.role != "admin" {
        return Err(AppError::Forbidden("Administrator role required".to_string()));
    }
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn token_from_bearer_or_cookie() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_token(&headers), None);

        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; readify_session=abc"),
        );
        assert_eq!(extract_token(&headers).as_deref(), Some("abc"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer xyz"));
        assert_eq!(extract_token(&headers).as_deref(), Some("xyz"));
    }

    #[test]
    fn cookie_carries_lifetime() {
        assert_eq!(
            session_cookie("t", 1),
            "readify_session=t; Path=/; HttpOnly; SameSite=Lax; Max-Age=86400"
        );
    }
}

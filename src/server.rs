//! HTTP server and routes.

mod extract;
mod handlers;
mod state;

pub use handlers::MAX_BATCH_FILES;
pub use state::AppState;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post, put},
};
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};

const MIB: usize = 1024 * 1024;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let upload_limit = state.config.storage.max_upload_mb * MIB + MIB;

    let auth_routes = Router::new()
        .route("/login", post(handlers::auth_login))
        .route("/register", post(handlers::auth_register))
        .route("/logout", post(handlers::auth_logout))
        .route("/me", get(handlers::auth_me));

    let book_routes = Router::new()
        .route(
            "/",
            get(handlers::list_books)
                .post(handlers::upload_book)
                .layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route(
            "/batch",
            post(handlers::batch_upload)
                .layer(DefaultBodyLimit::max(upload_limit * MAX_BATCH_FILES)),
        )
        .route("/{id}", get(handlers::get_book).delete(handlers::delete_book))
        .route("/{id}/download", get(handlers::download_book))
        .route("/{id}/chapters", get(handlers::list_chapters))
        .route("/{id}/chapters/{number}", get(handlers::get_chapter))
        // Reading
        .route(
            "/{id}/progress",
            get(handlers::get_progress).put(handlers::save_progress),
        )
        .route("/{id}/sessions", post(handlers::start_session))
        .route("/{id}/statistics", get(handlers::book_statistics))
        // Notes by book
        .route(
            "/{id}/notes",
            get(handlers::list_notes).post(handlers::create_note),
        );

    let note_routes = Router::new()
        .route("/search", get(handlers::search_notes))
        .route("/export", get(handlers::export_notes))
        .route(
            "/{id}",
            put(handlers::update_note).delete(handlers::delete_note),
        );

    let ai_routes = Router::new()
        .route("/ask", post(handlers::ai_ask))
        .route("/summary", post(handlers::ai_summary))
        .route("/chapter-summary", post(handlers::ai_chapter_summary))
        .route("/keywords", post(handlers::ai_keywords))
        .route("/analyze", post(handlers::ai_analyze))
        .route("/test", post(handlers::ai_test))
        .route(
            "/config",
            get(handlers::ai_get_config)
                .put(handlers::ai_save_config)
                .delete(handlers::ai_delete_config),
        )
        .route("/config/test", post(handlers::ai_test))
        .route("/history", get(handlers::ai_history))
        .route("/history/clear", post(handlers::ai_clear_history))
        .route("/qa/{id}/rate", post(handlers::ai_rate));

    let tts_routes = Router::new()
        .route("/generate", post(handlers::tts_generate))
        .route("/voices", get(handlers::tts_voices))
        .route("/cache/stats", get(handlers::tts_cache_stats))
        .route("/cache/cleanup", post(handlers::tts_cache_cleanup));

    let translate_routes = Router::new()
        .route("/", post(handlers::translate))
        .route("/batch", post(handlers::translate_batch))
        .route("/detect", post(handlers::translate_detect))
        .route("/languages", get(handlers::translate_languages))
        .route("/history", get(handlers::translate_history))
        .route("/history/{id}/favorite", post(handlers::translate_favorite))
        .route("/cache/stats", get(handlers::translate_cache_stats))
        .route("/cache/cleanup", post(handlers::translate_cache_cleanup));

    let api_routes = Router::new()
        .nest("/auth", auth_routes)
        .nest("/books", book_routes)
        .nest("/notes", note_routes)
        .nest("/ai", ai_routes)
        .nest("/tts", tts_routes)
        .nest("/translate", translate_routes)
        .route("/batches/{id}", get(handlers::get_batch))
        .route("/sessions/{id}/end", post(handlers::end_session))
        .route("/statistics", get(handlers::period_statistics))
        .route(
            "/preferences",
            get(handlers::get_preferences).put(handlers::save_preferences),
        );

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api", api_routes)
        .nest_service(
            crate::services::tts::MEDIA_PREFIX,
            ServeDir::new(&state.config.tts.cache_dir),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

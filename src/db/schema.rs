use crate::db::*;
use crate::error::{AppError, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::Arc;

/// Database wrapper for thread-safe access.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

fn db_err(what: &str) -> impl FnOnce(rusqlite::Error) -> AppError + '_ {
    move |e| AppError::Database(format!("Failed to {}: {}", what, e))
}

const USER_COLUMNS: &str =
    "id, username, password_hash, display_name, role, created_at, last_login";

const BOOK_COLUMNS: &str = "id, user_id, title, author, description, language, format, path, \
     file_size, word_count, chapter_count, processing_status, summary, keywords_json, view_count, \
     last_read_at, uploaded_at, updated_at";

const READING_SESSION_COLUMNS: &str = "id, user_id, book_id, chapter_number, started_at, \
     ended_at, duration_seconds, words_read, is_active";

const QA_COLUMNS: &str = "id, user_id, book_id, question_type, question, selected_text, \
     chapter_number, answer, model, processing_time, tokens_used, is_helpful, created_at";

const NOTE_COLUMNS: &str = "id, user_id, book_id, chapter_number, position_start, position_end, \
     selected_text, content, note_type, color, tags, created_at, updated_at";

const AI_CONFIG_COLUMNS: &str = "user_id, provider, api_url, api_key, model, max_tokens, \
     temperature, timeout_seconds, is_active, updated_at";

const PREFERENCE_COLUMNS: &str = "user_id, theme, language, voice_enabled, voice, voice_type, \
     voice_speed, auto_read, updated_at";

const BATCH_COLUMNS: &str = "id, user_id, name, total_files, processed_files, successful_files, \
     failed_files, status, error_log, created_at, completed_at";

fn user_from_row(row: &Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        display_name: row.get(3)?,
        role: row.get(4)?,
        created_at: row.get(5)?,
        last_login: row.get(6)?,
    })
}

fn book_from_row(row: &Row) -> rusqlite::Result<StoredBook> {
    let keywords_json: Option<String> = row.get(13)?;
    Ok(StoredBook {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        author: row.get(3)?,
        description: row.get(4)?,
        language: row.get(5)?,
        format: row.get(6)?,
        path: row.get(7)?,
        file_size: row.get(8)?,
        word_count: row.get(9)?,
        chapter_count: row.get(10)?,
        processing_status: row.get(11)?,
        summary: row.get(12)?,
        keywords: keywords_json
            .and_then(|j| serde_json::from_str(&j).ok())
            .unwrap_or_default(),
        view_count: row.get(14)?,
        last_read_at: row.get(15)?,
        uploaded_at: row.get(16)?,
        updated_at: row.get(17)?,
    })
}

fn reading_session_from_row(row: &Row) -> rusqlite::Result<ReadingSession> {
    Ok(ReadingSession {
        id: row.get(0)?,
        user_id: row.get(1)?,
        book_id: row.get(2)?,
        chapter_number: row.get(3)?,
        started_at: row.get(4)?,
        ended_at: row.get(5)?,
        duration_seconds: row.get(6)?,
        words_read: row.get(7)?,
        is_active: row.get(8)?,
    })
}

fn qa_from_row(row: &Row) -> rusqlite::Result<QaEntry> {
    Ok(QaEntry {
        id: row.get(0)?,
        user_id: row.get(1)?,
        book_id: row.get(2)?,
        question_type: row.get(3)?,
        question: row.get(4)?,
        selected_text: row.get(5)?,
        chapter_number: row.get(6)?,
        answer: row.get(7)?,
        model: row.get(8)?,
        processing_time: row.get(9)?,
        tokens_used: row.get(10)?,
        is_helpful: row.get(11)?,
        created_at: row.get(12)?,
    })
}

fn note_from_row(row: &Row) -> rusqlite::Result<Note> {
    Ok(Note {
        id: row.get(0)?,
        user_id: row.get(1)?,
        book_id: row.get(2)?,
        chapter_number: row.get(3)?,
        position_start: row.get(4)?,
        position_end: row.get(5)?,
        selected_text: row.get(6)?,
        content: row.get(7)?,
        note_type: row.get(8)?,
        color: row.get(9)?,
        tags: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn batch_from_row(row: &Row) -> rusqlite::Result<BatchUpload> {
    Ok(BatchUpload {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        total_files: row.get(3)?,
        processed_files: row.get(4)?,
        successful_files: row.get(5)?,
        failed_files: row.get(6)?,
        status: row.get(7)?,
        error_log: row.get(8)?,
        created_at: row.get(9)?,
        completed_at: row.get(10)?,
    })
}

fn ai_config_from_row(row: &Row) -> rusqlite::Result<UserAiConfig> {
    Ok(UserAiConfig {
        user_id: row.get(0)?,
        provider: row.get(1)?,
        api_url: row.get(2)?,
        api_key: row.get(3)?,
        model: row.get(4)?,
        max_tokens: row.get(5)?,
        temperature: row.get(6)?,
        timeout_seconds: row.get(7)?,
        is_active: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn preferences_from_row(row: &Row) -> rusqlite::Result<UserPreferences> {
    Ok(UserPreferences {
        user_id: row.get(0)?,
        theme: row.get(1)?,
        language: row.get(2)?,
        voice_enabled: row.get(3)?,
        voice: row.get(4)?,
        voice_type: row.get(5)?,
        voice_speed: row.get(6)?,
        auto_read: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn cache_from_row(row: &Row) -> rusqlite::Result<CacheEntry> {
    Ok(CacheEntry {
        kind: row.get(0)?,
        key: row.get(1)?,
        payload: row.get(2)?,
        created_at: row.get(3)?,
        last_accessed: row.get(4)?,
        hit_count: row.get(5)?,
    })
}

fn translation_from_row(row: &Row) -> rusqlite::Result<TranslationRecord> {
    Ok(TranslationRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        source_text: row.get(2)?,
        translated_text: row.get(3)?,
        source_language: row.get(4)?,
        target_language: row.get(5)?,
        is_favorite: row.get(6)?,
        created_at: row.get(7)?,
    })
}

/// Escape `%` and `_` for a LIKE pattern using `\` as escape char.
fn like_pattern(query: &str) -> String {
    let escaped = query
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

impl Database {
    /// Open or create database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).map_err(db_err("open database"))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_schema()?;
        Ok(db)
    }

    /// Open in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("open database"))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_schema()?;
        Ok(db)
    }

    /// Initialize database schema.
    fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            -- Users table
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                display_name TEXT,
                role TEXT NOT NULL DEFAULT 'user',
                created_at INTEGER NOT NULL,
                last_login INTEGER
            );

            -- Auth tokens
            CREATE TABLE IF NOT EXISTS sessions (
                token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );

            -- Uploaded books
            CREATE TABLE IF NOT EXISTS books (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                author TEXT,
                description TEXT,
                language TEXT,
                format TEXT NOT NULL,
                path TEXT NOT NULL,
                file_size INTEGER NOT NULL,
                word_count INTEGER NOT NULL DEFAULT 0,
                chapter_count INTEGER NOT NULL DEFAULT 0,
                processing_status TEXT NOT NULL DEFAULT 'pending',
                summary TEXT,
                keywords_json TEXT,
                view_count INTEGER NOT NULL DEFAULT 0,
                last_read_at INTEGER,
                uploaded_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );

            -- Parsed chapters
            CREATE TABLE IF NOT EXISTS chapters (
                book_id TEXT NOT NULL,
                number INTEGER NOT NULL,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                word_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (book_id, number),
                FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE CASCADE
            );

            -- Reading progress table
            CREATE TABLE IF NOT EXISTS reading_progress (
                user_id TEXT NOT NULL,
                book_id TEXT NOT NULL,
                current_chapter INTEGER NOT NULL DEFAULT 1,
                current_position INTEGER NOT NULL DEFAULT 0,
                percentage REAL NOT NULL DEFAULT 0,
                reading_seconds INTEGER NOT NULL DEFAULT 0,
                last_read_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, book_id),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE CASCADE
            );

            -- Timed reading sessions
            CREATE TABLE IF NOT EXISTS reading_sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                book_id TEXT NOT NULL,
                chapter_number INTEGER,
                started_at INTEGER NOT NULL,
                ended_at INTEGER,
                duration_seconds INTEGER NOT NULL DEFAULT 0,
                words_read INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE CASCADE
            );

            -- AI question history
            CREATE TABLE IF NOT EXISTS qa_entries (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                book_id TEXT NOT NULL,
                question_type TEXT NOT NULL,
                question TEXT NOT NULL,
                selected_text TEXT,
                chapter_number INTEGER,
                answer TEXT NOT NULL,
                model TEXT NOT NULL,
                processing_time REAL NOT NULL DEFAULT 0,
                tokens_used INTEGER NOT NULL DEFAULT 0,
                is_helpful INTEGER,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE CASCADE
            );

            -- AI call log
            CREATE TABLE IF NOT EXISTS ai_requests (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                book_id TEXT,
                kind TEXT NOT NULL,
                input TEXT NOT NULL,
                status TEXT NOT NULL,
                error TEXT,
                response TEXT,
                processing_time REAL NOT NULL DEFAULT 0,
                tokens_used INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE SET NULL
            );

            -- Chapter summaries
            CREATE TABLE IF NOT EXISTS chapter_summaries (
                book_id TEXT NOT NULL,
                chapter_number INTEGER NOT NULL,
                summary_type TEXT NOT NULL,
                summary TEXT NOT NULL,
                key_points_json TEXT NOT NULL,
                compression_ratio REAL NOT NULL DEFAULT 0,
                model TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (book_id, chapter_number, summary_type),
                FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE CASCADE
            );

            -- TTS and translation result cache
            CREATE TABLE IF NOT EXISTS cache_entries (
                kind TEXT NOT NULL,
                key TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_accessed INTEGER NOT NULL,
                hit_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (kind, key)
            );

            -- Translation history
            CREATE TABLE IF NOT EXISTS translations (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                source_text TEXT NOT NULL,
                translated_text TEXT NOT NULL,
                source_language TEXT NOT NULL,
                target_language TEXT NOT NULL,
                is_favorite INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );

            -- Notes, highlights and bookmarks
            CREATE TABLE IF NOT EXISTS notes (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                book_id TEXT NOT NULL,
                chapter_number INTEGER NOT NULL,
                position_start INTEGER NOT NULL DEFAULT 0,
                position_end INTEGER NOT NULL DEFAULT 0,
                selected_text TEXT NOT NULL DEFAULT '',
                content TEXT NOT NULL DEFAULT '',
                note_type TEXT NOT NULL DEFAULT 'note',
                color TEXT NOT NULL DEFAULT 'yellow',
                tags TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE CASCADE
            );

            -- Batch uploads
            CREATE TABLE IF NOT EXISTS batch_uploads (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                total_files INTEGER NOT NULL DEFAULT 0,
                processed_files INTEGER NOT NULL DEFAULT 0,
                successful_files INTEGER NOT NULL DEFAULT 0,
                failed_files INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                error_log TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                completed_at INTEGER,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );

            -- Indexes
            -- Per-user LLM settings
            CREATE TABLE IF NOT EXISTS user_ai_configs (
                user_id TEXT PRIMARY KEY,
                provider TEXT NOT NULL,
                api_url TEXT NOT NULL,
                api_key TEXT NOT NULL,
                model TEXT NOT NULL,
                max_tokens INTEGER NOT NULL,
                temperature REAL NOT NULL,
                timeout_seconds INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                updated_at INTEGER NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );

            -- Reader and voice preferences
            CREATE TABLE IF NOT EXISTS user_preferences (
                user_id TEXT PRIMARY KEY,
                theme TEXT NOT NULL DEFAULT 'light',
                language TEXT NOT NULL DEFAULT 'en',
                voice_enabled INTEGER NOT NULL DEFAULT 1,
                voice TEXT,
                voice_type TEXT,
                voice_speed REAL NOT NULL DEFAULT 1.0,
                auto_read INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_books_user ON books(user_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_expires ON sessions(expires_at);
            CREATE INDEX IF NOT EXISTS idx_reading_sessions_user ON reading_sessions(user_id, started_at);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_reading_sessions_open
                ON reading_sessions(user_id, book_id) WHERE is_active = 1;
            CREATE INDEX IF NOT EXISTS idx_qa_user_book ON qa_entries(user_id, book_id);
            CREATE INDEX IF NOT EXISTS idx_notes_user_book ON notes(user_id, book_id);
            CREATE INDEX IF NOT EXISTS idx_cache_accessed ON cache_entries(kind, last_accessed);
            CREATE INDEX IF NOT EXISTS idx_translations_user ON translations(user_id, created_at);
            "#,
        )
        .map_err(db_err("initialize schema"))?;

        Ok(())
    }

    // ========== USER OPERATIONS ==========

    /// Create a new user.
    pub fn create_user(&self, user: &User) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO users (id, username, password_hash, display_name, role, created_at, last_login)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                user.id,
                user.username,
                user.password_hash,
                user.display_name,
                user.role,
                user.created_at,
                user.last_login,
            ],
        )
        .map_err(|e| {
            if e.to_string().contains("UNIQUE constraint") {
                AppError::InvalidFormat(format!("Username '{}' already exists", user.username))
            } else {
                AppError::Database(format!("Failed to create user: {}", e))
            }
        })?;
        Ok(())
    }

    /// Get user by username.
    pub fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM users WHERE username = ?1", USER_COLUMNS),
            params![username],
            user_from_row,
        )
        .optional()
        .map_err(db_err("get user"))
    }

    /// Get user by ID.
    pub fn get_user_by_id(&self, id: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS),
            params![id],
            user_from_row,
        )
        .optional()
        .map_err(db_err("get user"))
    }

    /// List all users.
    pub fn list_users(&self) -> Result<Vec<User>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM users ORDER BY username",
                USER_COLUMNS
            ))
            .map_err(db_err("prepare query"))?;

        let users = stmt
            .query_map([], user_from_row)
            .map_err(db_err("list users"))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err("collect users"))?;

        Ok(users)
    }

    /// Update user password.
    pub fn update_user_password(&self, username: &str, password_hash: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE users SET password_hash = ?1 WHERE username = ?2",
                params![password_hash, username],
            )
            .map_err(db_err("update password"))?;
        Ok(rows > 0)
    }

    /// Update user last login.
    pub fn update_user_last_login(&self, user_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE users SET last_login = ?1 WHERE id = ?2",
            params![now_timestamp(), user_id],
        )
        .map_err(db_err("update last login"))?;
        Ok(())
    }

    /// Delete user.
    pub fn delete_user(&self, username: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute("DELETE FROM users WHERE username = ?1", params![username])
            .map_err(db_err("delete user"))?;
        Ok(rows > 0)
    }

    // ========== USER SETTINGS OPERATIONS ==========

    /// Insert or replace a user's LLM settings.
    pub fn save_user_ai_config(&self, config: &UserAiConfig) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO user_ai_configs ({}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                AI_CONFIG_COLUMNS
            ),
            params![
                config.user_id,
                config.provider,
                config.api_url,
                config.api_key,
                config.model,
                config.max_tokens,
                config.temperature,
                config.timeout_seconds,
                config.is_active,
                config.updated_at,
            ],
        )
        .map_err(db_err("save AI settings"))?;
        Ok(())
    }

    /// Get a user's LLM settings, active or not.
    pub fn get_user_ai_config(&self, user_id: &str) -> Result<Option<UserAiConfig>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM user_ai_configs WHERE user_id = ?1",
                AI_CONFIG_COLUMNS
            ),
            params![user_id],
            ai_config_from_row,
        )
        .optional()
        .map_err(db_err("get AI settings"))
    }

    /// Delete a user's LLM settings.
    pub fn delete_user_ai_config(&self, user_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "DELETE FROM user_ai_configs WHERE user_id = ?1",
                params![user_id],
            )
            .map_err(db_err("delete AI settings"))?;
        Ok(rows > 0)
    }

    /// Insert or replace a user's preferences.
    pub fn save_preferences(&self, prefs: &UserPreferences) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO user_preferences ({}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                PREFERENCE_COLUMNS
            ),
            params![
                prefs.user_id,
                prefs.theme,
                prefs.language,
                prefs.voice_enabled,
                prefs.voice,
                prefs.voice_type,
                prefs.voice_speed,
                prefs.auto_read,
                prefs.updated_at,
            ],
        )
        .map_err(db_err("save preferences"))?;
        Ok(())
    }

    /// Get a user's stored preferences.
    pub fn get_preferences(&self, user_id: &str) -> Result<Option<UserPreferences>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM user_preferences WHERE user_id = ?1",
                PREFERENCE_COLUMNS
            ),
            params![user_id],
            preferences_from_row,
        )
        .optional()
        .map_err(db_err("get preferences"))
    }

    // ========== AUTH SESSION OPERATIONS ==========

    /// Create session.
    pub fn create_session(&self, session: &Session) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (token, user_id, expires_at) VALUES (?1, ?2, ?3)",
            params![session.token, session.user_id, session.expires_at],
        )
        .map_err(db_err("create session"))?;
        Ok(())
    }

    /// Get session by token.
    pub fn get_session(&self, token: &str) -> Result<Option<Session>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT token, user_id, expires_at FROM sessions WHERE token = ?1",
            params![token],
            |row| {
                Ok(Session {
                    token: row.get(0)?,
                    user_id: row.get(1)?,
                    expires_at: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(db_err("get session"))
    }

    /// Delete session.
    pub fn delete_session(&self, token: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM sessions WHERE token = ?1", params![token])
            .map_err(db_err("delete session"))?;
        Ok(())
    }

    /// Cleanup expired sessions.
    pub fn cleanup_expired_sessions(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "DELETE FROM sessions WHERE expires_at < ?1",
                params![now_timestamp()],
            )
            .map_err(db_err("cleanup sessions"))?;
        Ok(rows)
    }

    // ========== BOOK OPERATIONS ==========

    /// Insert a new book row.
    pub fn insert_book(&self, book: &StoredBook) -> Result<()> {
        let conn = self.conn.lock();
        let keywords_json = serde_json::to_string(&book.keywords).ok();

        conn.execute(
            &format!(
                "INSERT INTO books ({}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                BOOK_COLUMNS
            ),
            params![
                book.id,
                book.user_id,
                book.title,
                book.author,
                book.description,
                book.language,
                book.format,
                book.path,
                book.file_size,
                book.word_count,
                book.chapter_count,
                book.processing_status,
                book.summary,
                keywords_json,
                book.view_count,
                book.last_read_at,
                book.uploaded_at,
                book.updated_at,
            ],
        )
        .map_err(db_err("save book"))?;
        Ok(())
    }

    /// Get book by ID.
    pub fn get_book(&self, id: &str) -> Result<Option<StoredBook>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM books WHERE id = ?1", BOOK_COLUMNS),
            params![id],
            book_from_row,
        )
        .optional()
        .map_err(db_err("get book"))
    }

    /// Get a book only if it belongs to the user.
    pub fn get_user_book(&self, user_id: &str, id: &str) -> Result<Option<StoredBook>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM books WHERE id = ?1 AND user_id = ?2",
                BOOK_COLUMNS
            ),
            params![id, user_id],
            book_from_row,
        )
        .optional()
        .map_err(db_err("get book"))
    }

    /// List a user's books, newest first, optionally filtered by a search term.
    pub fn list_books(&self, user_id: &str, search: Option<&str>) -> Result<Vec<StoredBook>> {
        let conn = self.conn.lock();
        let pattern = search
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(like_pattern);

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM books
                 WHERE user_id = ?1
                   AND (?2 IS NULL
                        OR title LIKE ?2 ESCAPE '\\'
                        OR author LIKE ?2 ESCAPE '\\'
                        OR description LIKE ?2 ESCAPE '\\')
                 ORDER BY uploaded_at DESC, title",
                BOOK_COLUMNS
            ))
            .map_err(db_err("prepare query"))?;

        let books = stmt
            .query_map(params![user_id, pattern], book_from_row)
            .map_err(db_err("list books"))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err("collect books"))?;

        Ok(books)
    }

    /// Record the outcome of text extraction.
    pub fn update_book_processing(
        &self,
        id: &str,
        status: &str,
        word_count: i64,
        chapter_count: i64,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE books SET processing_status = ?1, word_count = ?2, chapter_count = ?3,
                              updated_at = ?4
             WHERE id = ?5",
            params![status, word_count, chapter_count, now_timestamp(), id],
        )
        .map_err(db_err("update book"))?;
        Ok(())
    }

    /// Store the AI summary of a book.
    pub fn set_book_summary(&self, id: &str, summary: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE books SET summary = ?1, updated_at = ?2 WHERE id = ?3",
            params![summary, now_timestamp(), id],
        )
        .map_err(db_err("update book summary"))?;
        Ok(())
    }

    /// Store AI keywords of a book.
    pub fn set_book_keywords(&self, id: &str, keywords: &[String]) -> Result<()> {
        let conn = self.conn.lock();
        let json = serde_json::to_string(keywords)
            .map_err(|e| AppError::Internal(format!("Failed to encode keywords: {}", e)))?;
        conn.execute(
            "UPDATE books SET keywords_json = ?1, updated_at = ?2 WHERE id = ?3",
            params![json, now_timestamp(), id],
        )
        .map_err(db_err("update book keywords"))?;
        Ok(())
    }

    /// Delete book and, by cascade, its chapters and reading data.
    pub fn delete_book(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute("DELETE FROM books WHERE id = ?1", params![id])
            .map_err(db_err("delete book"))?;
        Ok(rows > 0)
    }

    // ========== CHAPTER OPERATIONS ==========

    /// Replace every chapter of a book. Chapters are numbered from 1 in order.
    pub fn replace_chapters(&self, book_id: &str, chapters: &[(String, String, i64)]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err("begin transaction"))?;

        tx.execute("DELETE FROM chapters WHERE book_id = ?1", params![book_id])
            .map_err(db_err("delete chapters"))?;

        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO chapters (book_id, number, title, content, word_count)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .map_err(db_err("prepare query"))?;

            for (i, (title, content, words)) in chapters.iter().enumerate() {
                stmt.execute(params![book_id, i as i64 + 1, title, content, words])
                    .map_err(db_err("save chapter"))?;
            }
        }

        tx.commit().map_err(db_err("commit chapters"))?;
        Ok(())
    }

    /// List chapters of a book without their text.
    pub fn list_chapters(&self, book_id: &str) -> Result<Vec<ChapterInfo>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT number, title, word_count FROM chapters
                 WHERE book_id = ?1 ORDER BY number",
            )
            .map_err(db_err("prepare query"))?;

        let chapters = stmt
            .query_map(params![book_id], |row| {
                Ok(ChapterInfo {
                    number: row.get(0)?,
                    title: row.get(1)?,
                    word_count: row.get(2)?,
                })
            })
            .map_err(db_err("list chapters"))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err("collect chapters"))?;

        Ok(chapters)
    }

    /// Get one chapter with its text.
    pub fn get_chapter(&self, book_id: &str, number: i64) -> Result<Option<StoredChapter>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT book_id, number, title, content, word_count FROM chapters
             WHERE book_id = ?1 AND number = ?2",
            params![book_id, number],
            |row| {
                Ok(StoredChapter {
                    book_id: row.get(0)?,
                    number: row.get(1)?,
                    title: row.get(2)?,
                    content: row.get(3)?,
                    word_count: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(db_err("get chapter"))
    }

    /// First `limit` chapters with text.
    pub fn first_chapters(&self, book_id: &str, limit: usize) -> Result<Vec<StoredChapter>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT book_id, number, title, content, word_count FROM chapters
                 WHERE book_id = ?1 ORDER BY number LIMIT ?2",
            )
            .map_err(db_err("prepare query"))?;

        let chapters = stmt
            .query_map(params![book_id, limit as i64], |row| {
                Ok(StoredChapter {
                    book_id: row.get(0)?,
                    number: row.get(1)?,
                    title: row.get(2)?,
                    content: row.get(3)?,
                    word_count: row.get(4)?,
                })
            })
            .map_err(db_err("list chapters"))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err("collect chapters"))?;

        Ok(chapters)
    }

    // ========== PROGRESS OPERATIONS ==========

    /// Move the reader's position in one statement.
    ///
    /// While the user has an open session on the book the stored percentage
    /// never decreases. Accumulated reading time is left untouched.
    pub fn update_progress(
        &self,
        user_id: &str,
        book_id: &str,
        chapter: i64,
        position: i64,
        percentage: f64,
    ) -> Result<ReadingProgress> {
        let conn = self.conn.lock();
        conn.query_row(
            "INSERT INTO reading_progress
                (user_id, book_id, current_chapter, current_position, percentage,
                 reading_seconds, last_read_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)
             ON CONFLICT (user_id, book_id) DO UPDATE SET
                current_chapter = excluded.current_chapter,
                current_position = excluded.current_position,
                percentage = CASE
                    WHEN EXISTS (SELECT 1 FROM reading_sessions s
                                 WHERE s.user_id = ?1
                                   AND s.book_id = ?2
                                   AND s.is_active = 1)
                    THEN MAX(reading_progress.percentage, excluded.percentage)
                    ELSE excluded.percentage
                END,
                last_read_at = excluded.last_read_at
             RETURNING user_id, book_id, current_chapter, current_position, percentage,
                       reading_seconds, last_read_at",
            params![user_id, book_id, chapter, position, percentage, now_timestamp()],
            |row| {
                Ok(ReadingProgress {
                    user_id: row.get(0)?,
                    book_id: row.get(1)?,
                    current_chapter: row.get(2)?,
                    current_position: row.get(3)?,
                    percentage: row.get(4)?,
                    reading_seconds: row.get(5)?,
                    last_read_at: row.get(6)?,
                })
            },
        )
        .map_err(db_err("update progress"))
    }

    /// Get reading progress.
    pub fn get_progress(&self, user_id: &str, book_id: &str) -> Result<Option<ReadingProgress>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT user_id, book_id, current_chapter, current_position, percentage,
                    reading_seconds, last_read_at
             FROM reading_progress WHERE user_id = ?1 AND book_id = ?2",
            params![user_id, book_id],
            |row| {
                Ok(ReadingProgress {
                    user_id: row.get(0)?,
                    book_id: row.get(1)?,
                    current_chapter: row.get(2)?,
                    current_position: row.get(3)?,
                    percentage: row.get(4)?,
                    reading_seconds: row.get(5)?,
                    last_read_at: row.get(6)?,
                })
            },
        )
        .optional()
        .map_err(db_err("get progress"))
    }

    // ========== READING SESSION OPERATIONS ==========

    /// Close any open session of the user on the book, open `session`,
    /// point progress at its chapter and count a view. Runs as one transaction.
    ///
    /// Returns the number of sessions that were closed.
    pub fn begin_reading_session(&self, session: &ReadingSession) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err("begin transaction"))?;
        let now = session.started_at;

        let closed_seconds: i64 = tx
            .query_row(
                "SELECT COALESCE(SUM(MAX(0, ?1 - started_at)), 0) FROM reading_sessions
                 WHERE user_id = ?2 AND book_id = ?3 AND is_active = 1",
                params![now, session.user_id, session.book_id],
                |row| row.get(0),
            )
            .map_err(db_err("sum open sessions"))?;

        let closed = tx
            .execute(
                "UPDATE reading_sessions
                 SET is_active = 0, ended_at = ?1, duration_seconds = MAX(0, ?1 - started_at)
                 WHERE user_id = ?2 AND book_id = ?3 AND is_active = 1",
                params![now, session.user_id, session.book_id],
            )
            .map_err(db_err("close open sessions"))?;

        tx.execute(
            &format!(
                "INSERT INTO reading_sessions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                READING_SESSION_COLUMNS
            ),
            params![
                session.id,
                session.user_id,
                session.book_id,
                session.chapter_number,
                session.started_at,
                session.ended_at,
                session.duration_seconds,
                session.words_read,
                session.is_active,
            ],
        )
        .map_err(db_err("create reading session"))?;

        tx.execute(
            "INSERT INTO reading_progress
                (user_id, book_id, current_chapter, current_position, percentage,
                 reading_seconds, last_read_at)
             VALUES (?1, ?2, COALESCE(?3, 1), 0, 0, ?4, ?5)
             ON CONFLICT (user_id, book_id) DO UPDATE SET
                current_chapter = COALESCE(?3, current_chapter),
                reading_seconds = reading_seconds + ?4,
                last_read_at = ?5",
            params![
                session.user_id,
                session.book_id,
                session.chapter_number,
                closed_seconds,
                now,
            ],
        )
        .map_err(db_err("update progress"))?;

        tx.execute(
            "UPDATE books SET view_count = view_count + 1, last_read_at = ?1 WHERE id = ?2",
            params![now, session.book_id],
        )
        .map_err(db_err("count book view"))?;

        tx.commit().map_err(db_err("commit reading session"))?;
        Ok(closed)
    }

    /// Get a reading session by ID.
    pub fn get_reading_session(&self, id: &str) -> Result<Option<ReadingSession>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM reading_sessions WHERE id = ?1",
                READING_SESSION_COLUMNS
            ),
            params![id],
            reading_session_from_row,
        )
        .optional()
        .map_err(db_err("get reading session"))
    }

    /// Close an open session and add its duration to progress.
    ///
    /// Returns `None` if the session was not open.
    pub fn end_reading_session(
        &self,
        id: &str,
        ended_at: i64,
        words_read: i64,
    ) -> Result<Option<ReadingSession>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err("begin transaction"))?;

        let rows = tx
            .execute(
                "UPDATE reading_sessions
                 SET is_active = 0, ended_at = ?1, duration_seconds = MAX(0, ?1 - started_at),
                     words_read = ?2
                 WHERE id = ?3 AND is_active = 1",
                params![ended_at, words_read, id],
            )
            .map_err(db_err("close reading session"))?;

        if rows == 0 {
            return Ok(None);
        }

        let session = tx
            .query_row(
                &format!(
                    "SELECT {} FROM reading_sessions WHERE id = ?1",
                    READING_SESSION_COLUMNS
                ),
                params![id],
                reading_session_from_row,
            )
            .map_err(db_err("get reading session"))?;

        tx.execute(
            "INSERT INTO reading_progress
                (user_id, book_id, current_chapter, current_position, percentage,
                 reading_seconds, last_read_at)
             VALUES (?1, ?2, 1, 0, 0, ?3, ?4)
             ON CONFLICT (user_id, book_id) DO UPDATE SET
                reading_seconds = reading_seconds + ?3,
                last_read_at = ?4",
            params![
                session.user_id,
                session.book_id,
                session.duration_seconds,
                ended_at
            ],
        )
        .map_err(db_err("update progress"))?;

        tx.commit().map_err(db_err("commit reading session"))?;
        Ok(Some(session))
    }

    /// Totals over closed sessions of a user on one book.
    pub fn book_session_totals(&self, user_id: &str, book_id: &str) -> Result<SessionTotals> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COALESCE(SUM(duration_seconds), 0), COALESCE(SUM(words_read), 0),
                    COUNT(*), COUNT(DISTINCT book_id)
             FROM reading_sessions
             WHERE user_id = ?1 AND book_id = ?2 AND is_active = 0",
            params![user_id, book_id],
            |row| {
                Ok(SessionTotals {
                    total_seconds: row.get(0)?,
                    total_words: row.get(1)?,
                    session_count: row.get(2)?,
                    books_count: row.get(3)?,
                })
            },
        )
        .map_err(db_err("sum reading sessions"))
    }

    /// Totals over closed sessions of a user started in `[start, end)`.
    pub fn session_totals_between(
        &self,
        user_id: &str,
        start: i64,
        end: i64,
    ) -> Result<SessionTotals> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COALESCE(SUM(duration_seconds), 0), COALESCE(SUM(words_read), 0),
                    COUNT(*), COUNT(DISTINCT book_id)
             FROM reading_sessions
             WHERE user_id = ?1 AND is_active = 0 AND started_at >= ?2 AND started_at < ?3",
            params![user_id, start, end],
            |row| {
                Ok(SessionTotals {
                    total_seconds: row.get(0)?,
                    total_words: row.get(1)?,
                    session_count: row.get(2)?,
                    books_count: row.get(3)?,
                })
            },
        )
        .map_err(db_err("sum reading sessions"))
    }

    // ========== AI OPERATIONS ==========

    /// Record an answered question.
    pub fn insert_qa(&self, entry: &QaEntry) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO qa_entries ({}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                QA_COLUMNS
            ),
            params![
                entry.id,
                entry.user_id,
                entry.book_id,
                entry.question_type,
                entry.question,
                entry.selected_text,
                entry.chapter_number,
                entry.answer,
                entry.model,
                entry.processing_time,
                entry.tokens_used,
                entry.is_helpful,
                entry.created_at,
            ],
        )
        .map_err(db_err("save question"))?;
        Ok(())
    }

    /// Latest questions of a user, optionally restricted to one book.
    pub fn list_qa(&self, user_id: &str, book_id: Option<&str>, limit: usize) -> Result<Vec<QaEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM qa_entries
                 WHERE user_id = ?1 AND (?2 IS NULL OR book_id = ?2)
                 ORDER BY created_at DESC, rowid DESC LIMIT ?3",
                QA_COLUMNS
            ))
            .map_err(db_err("prepare query"))?;

        let entries = stmt
            .query_map(params![user_id, book_id, limit as i64], qa_from_row)
            .map_err(db_err("list questions"))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err("collect questions"))?;

        Ok(entries)
    }

    /// Set the helpfulness rating of a user's answer.
    pub fn rate_qa(&self, user_id: &str, id: &str, helpful: bool) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE qa_entries SET is_helpful = ?1 WHERE id = ?2 AND user_id = ?3",
                params![helpful, id, user_id],
            )
            .map_err(db_err("rate answer"))?;
        Ok(rows > 0)
    }

    /// Delete a user's questions created before `before`.
    pub fn delete_qa_before(&self, user_id: &str, before: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "DELETE FROM qa_entries WHERE user_id = ?1 AND created_at < ?2",
                params![user_id, before],
            )
            .map_err(db_err("clear questions"))?;
        Ok(rows)
    }

    /// (questions asked, answers rated helpful) for a user on a book.
    pub fn qa_counts(&self, user_id: &str, book_id: &str) -> Result<(i64, i64)> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN is_helpful = 1 THEN 1 ELSE 0 END), 0)
             FROM qa_entries WHERE user_id = ?1 AND book_id = ?2",
            params![user_id, book_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(db_err("count questions"))
    }

    /// Log an AI call.
    pub fn insert_ai_log(&self, log: &AiRequestLog) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO ai_requests
                (id, user_id, book_id, kind, input, status, error, response,
                 processing_time, tokens_used, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                log.id,
                log.user_id,
                log.book_id,
                log.kind,
                log.input,
                log.status,
                log.error,
                log.response,
                log.processing_time,
                log.tokens_used,
                log.created_at,
            ],
        )
        .map_err(db_err("log AI request"))?;
        Ok(())
    }

    /// Count logged AI calls of a user by status.
    pub fn count_ai_logs(&self, user_id: &str, status: &str) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM ai_requests WHERE user_id = ?1 AND status = ?2",
            params![user_id, status],
            |row| row.get(0),
        )
        .map_err(db_err("count AI requests"))
    }

    /// Get a cached chapter summary.
    pub fn get_chapter_summary(
        &self,
        book_id: &str,
        chapter_number: i64,
        summary_type: &str,
    ) -> Result<Option<ChapterSummary>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT book_id, chapter_number, summary_type, summary, key_points_json,
                    compression_ratio, model, created_at
             FROM chapter_summaries
             WHERE book_id = ?1 AND chapter_number = ?2 AND summary_type = ?3",
            params![book_id, chapter_number, summary_type],
            |row| {
                let key_points: String = row.get(4)?;
                Ok(ChapterSummary {
                    book_id: row.get(0)?,
                    chapter_number: row.get(1)?,
                    summary_type: row.get(2)?,
                    summary: row.get(3)?,
                    key_points: serde_json::from_str(&key_points).unwrap_or_default(),
                    compression_ratio: row.get(5)?,
                    model: row.get(6)?,
                    created_at: row.get(7)?,
                })
            },
        )
        .optional()
        .map_err(db_err("get chapter summary"))
    }

    /// Save a chapter summary, replacing one of the same type.
    pub fn save_chapter_summary(&self, summary: &ChapterSummary) -> Result<()> {
        let conn = self.conn.lock();
        let key_points = serde_json::to_string(&summary.key_points)
            .map_err(|e| AppError::Internal(format!("Failed to encode key points: {}", e)))?;
        conn.execute(
            "INSERT OR REPLACE INTO chapter_summaries
                (book_id, chapter_number, summary_type, summary, key_points_json,
                 compression_ratio, model, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                summary.book_id,
                summary.chapter_number,
                summary.summary_type,
                summary.summary,
                key_points,
                summary.compression_ratio,
                summary.model,
                summary.created_at,
            ],
        )
        .map_err(db_err("save chapter summary"))?;
        Ok(())
    }

    // ========== CACHE OPERATIONS ==========

    /// Look up a cache entry, counting the hit.
    pub fn cache_get(&self, kind: &str, key: &str) -> Result<Option<CacheEntry>> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE cache_entries SET hit_count = hit_count + 1, last_accessed = ?1
                 WHERE kind = ?2 AND key = ?3",
                params![now_timestamp(), kind, key],
            )
            .map_err(db_err("touch cache entry"))?;

        if rows == 0 {
            return Ok(None);
        }

        conn.query_row(
            "SELECT kind, key, payload, created_at, last_accessed, hit_count
             FROM cache_entries WHERE kind = ?1 AND key = ?2",
            params![kind, key],
            cache_from_row,
        )
        .optional()
        .map_err(db_err("get cache entry"))
    }

    /// Insert or replace a cache entry.
    pub fn cache_put(&self, kind: &str, key: &str, payload: &str) -> Result<()> {
        let conn = self.conn.lock();
        let now = now_timestamp();
        conn.execute(
            "INSERT INTO cache_entries (kind, key, payload, created_at, last_accessed, hit_count)
             VALUES (?1, ?2, ?3, ?4, ?4, 0)
             ON CONFLICT (kind, key) DO UPDATE SET
                payload = excluded.payload,
                created_at = excluded.created_at,
                last_accessed = excluded.last_accessed,
                hit_count = 0",
            params![kind, key, payload, now],
        )
        .map_err(db_err("save cache entry"))?;
        Ok(())
    }

    /// Remove entries of `kind` last accessed before `before`; returns them.
    pub fn cache_remove_before(&self, kind: &str, before: i64) -> Result<Vec<CacheEntry>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err("begin transaction"))?;

        let removed = {
            let mut stmt = tx
                .prepare(
                    "SELECT kind, key, payload, created_at, last_accessed, hit_count
                     FROM cache_entries WHERE kind = ?1 AND last_accessed < ?2",
                )
                .map_err(db_err("prepare query"))?;
            stmt.query_map(params![kind, before], cache_from_row)
                .map_err(db_err("list cache entries"))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err("collect cache entries"))?
        };

        tx.execute(
            "DELETE FROM cache_entries WHERE kind = ?1 AND last_accessed < ?2",
            params![kind, before],
        )
        .map_err(db_err("cleanup cache"))?;

        tx.commit().map_err(db_err("commit cache cleanup"))?;
        Ok(removed)
    }

    /// Statistics for one cache kind.
    pub fn cache_stats(&self, kind: &str) -> Result<CacheStats> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(hit_count), 0), MIN(created_at), MAX(created_at)
             FROM cache_entries WHERE kind = ?1",
            params![kind],
            |row| {
                Ok(CacheStats {
                    entries: row.get(0)?,
                    total_hits: row.get(1)?,
                    oldest: row.get(2)?,
                    newest: row.get(3)?,
                })
            },
        )
        .map_err(db_err("get cache stats"))
    }

    // ========== TRANSLATION HISTORY OPERATIONS ==========

    /// Record a translation.
    pub fn insert_translation(&self, record: &TranslationRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO translations
                (id, user_id, source_text, translated_text, source_language,
                 target_language, is_favorite, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.id,
                record.user_id,
                record.source_text,
                record.translated_text,
                record.source_language,
                record.target_language,
                record.is_favorite,
                record.created_at,
            ],
        )
        .map_err(db_err("save translation"))?;
        Ok(())
    }

    /// Latest translations of a user.
    pub fn list_translations(
        &self,
        user_id: &str,
        favorites_only: bool,
        limit: usize,
    ) -> Result<Vec<TranslationRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, source_text, translated_text, source_language,
                        target_language, is_favorite, created_at
                 FROM translations
                 WHERE user_id = ?1 AND (?2 = 0 OR is_favorite = 1)
                 ORDER BY created_at DESC, rowid DESC LIMIT ?3",
            )
            .map_err(db_err("prepare query"))?;

        let records = stmt
            .query_map(
                params![user_id, favorites_only, limit as i64],
                translation_from_row,
            )
            .map_err(db_err("list translations"))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err("collect translations"))?;

        Ok(records)
    }

    /// Flip the favorite flag; returns the new value, or `None` if not found.
    pub fn toggle_translation_favorite(&self, user_id: &str, id: &str) -> Result<Option<bool>> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE translations SET is_favorite = 1 - is_favorite
                 WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
            )
            .map_err(db_err("update translation"))?;

        if rows == 0 {
            return Ok(None);
        }

        conn.query_row(
            "SELECT is_favorite FROM translations WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err("get translation"))
    }

    // ========== NOTE OPERATIONS ==========

    /// Save a note (insert or full update).
    pub fn save_note(&self, note: &Note) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO notes ({}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT (id) DO UPDATE SET
                    content = excluded.content,
                    note_type = excluded.note_type,
                    color = excluded.color,
                    tags = excluded.tags,
                    updated_at = excluded.updated_at",
                NOTE_COLUMNS
            ),
            params![
                note.id,
                note.user_id,
                note.book_id,
                note.chapter_number,
                note.position_start,
                note.position_end,
                note.selected_text,
                note.content,
                note.note_type,
                note.color,
                note.tags,
                note.created_at,
                note.updated_at,
            ],
        )
        .map_err(db_err("save note"))?;
        Ok(())
    }

    /// Get one of the user's notes.
    pub fn get_note(&self, user_id: &str, id: &str) -> Result<Option<Note>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM notes WHERE id = ?1 AND user_id = ?2",
                NOTE_COLUMNS
            ),
            params![id, user_id],
            note_from_row,
        )
        .optional()
        .map_err(db_err("get note"))
    }

    /// Notes of a user on a book, in reading order.
    pub fn list_notes(
        &self,
        user_id: &str,
        book_id: &str,
        note_type: Option<&str>,
        chapter_number: Option<i64>,
    ) -> Result<Vec<Note>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM notes
                 WHERE user_id = ?1 AND book_id = ?2
                   AND (?3 IS NULL OR note_type = ?3)
                   AND (?4 IS NULL OR chapter_number = ?4)
                 ORDER BY chapter_number, position_start, created_at",
                NOTE_COLUMNS
            ))
            .map_err(db_err("prepare query"))?;

        let notes = stmt
            .query_map(
                params![user_id, book_id, note_type, chapter_number],
                note_from_row,
            )
            .map_err(db_err("list notes"))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err("collect notes"))?;

        Ok(notes)
    }

    /// Notes of a user whose text, selection or tags match `query`.
    pub fn search_notes(&self, user_id: &str, query: &str) -> Result<Vec<Note>> {
        let conn = self.conn.lock();
        let pattern = like_pattern(query.trim());
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM notes
                 WHERE user_id = ?1
                   AND (content LIKE ?2 ESCAPE '\\'
                        OR selected_text LIKE ?2 ESCAPE '\\'
                        OR tags LIKE ?2 ESCAPE '\\')
                 ORDER BY updated_at DESC",
                NOTE_COLUMNS
            ))
            .map_err(db_err("prepare query"))?;

        let notes = stmt
            .query_map(params![user_id, pattern], note_from_row)
            .map_err(db_err("search notes"))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err("collect notes"))?;

        Ok(notes)
    }

    /// Delete one of the user's notes.
    pub fn delete_note(&self, user_id: &str, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "DELETE FROM notes WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
            )
            .map_err(db_err("delete note"))?;
        Ok(rows > 0)
    }

    // ========== BATCH UPLOAD OPERATIONS ==========

    /// Save a batch record (insert or update counters).
    pub fn save_batch(&self, batch: &BatchUpload) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO batch_uploads ({}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT (id) DO UPDATE SET
                    total_files = excluded.total_files,
                    processed_files = excluded.processed_files,
                    successful_files = excluded.successful_files,
                    failed_files = excluded.failed_files,
                    status = excluded.status,
                    error_log = excluded.error_log,
                    completed_at = excluded.completed_at",
                BATCH_COLUMNS
            ),
            params![
                batch.id,
                batch.user_id,
                batch.name,
                batch.total_files,
                batch.processed_files,
                batch.successful_files,
                batch.failed_files,
                batch.status,
                batch.error_log,
                batch.created_at,
                batch.completed_at,
            ],
        )
        .map_err(db_err("save batch"))?;
        Ok(())
    }

    /// Get one of the user's batches.
    pub fn get_batch(&self, user_id: &str, id: &str) -> Result<Option<BatchUpload>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM batch_uploads WHERE id = ?1 AND user_id = ?2",
                BATCH_COLUMNS
            ),
            params![id, user_id],
            batch_from_row,
        )
        .optional()
        .map_err(db_err("get batch"))
    }
}

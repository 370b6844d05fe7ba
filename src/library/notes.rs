//! Reader notes, highlights and bookmarks.

use crate::db::{self, Database, Note, StoredBook};
use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Accepted note types.
pub const NOTE_TYPES: &[&str] = &["highlight", "note", "bookmark", "question", "insight"];

/// Accepted highlight colors.
pub const NOTE_COLORS: &[&str] = &["yellow", "green", "blue", "red", "purple", "orange"];

fn default_note_type() -> String {
    "note".to_string()
}

fn default_color() -> String {
    "yellow".to_string()
}

/// Fields of a new note.
#[derive(Debug, Clone, Deserialize)]
pub struct NewNote {
    /// Chapter the note is attached to.
    pub chapter_number: i64,
    /// Selection start offset.
    #[serde(default)]
    pub position_start: i64,
    /// Selection end offset.
    #[serde(default)]
    pub position_end: i64,
    /// Selected passage.
    #[serde(default)]
    pub selected_text: String,
    /// Note text.
    #[serde(default)]
    pub content: String,
    /// One of [`NOTE_TYPES`].
    #[serde(default = "default_note_type")]
    pub note_type: String,
    /// One of [`NOTE_COLORS`].
    #[serde(default = "default_color")]
    pub color: String,
    /// Comma-separated tags.
    #[serde(default)]
    pub tags: String,
}

/// Changes to an existing note. Absent fields are kept.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NoteUpdate {
    /// New text.
    pub content: Option<String>,
    /// New type.
    pub note_type: Option<String>,
    /// New color.
    pub color: Option<String>,
    /// New tags.
    pub tags: Option<String>,
}

/// Export file layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// JSON array.
    Json,
    /// Markdown document grouped by book and chapter.
    Markdown,
}

impl ExportFormat {
    /// Parse a format name; `md` is accepted for Markdown.
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "markdown" | "md" => Ok(Self::Markdown),
            other => Err(AppError::InvalidFormat(format!("Unknown export format: {}", other))),
        }
    }

    /// Content type of the exported document.
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Markdown => "text/markdown; charset=utf-8",
        }
    }
}

/// One exported note.
#[derive(Debug, Clone, Serialize)]
pub struct ExportedNote {
    /// Title of the book.
    pub book_title: String,
    /// Chapter number.
    pub chapter_number: i64,
    /// Selected passage.
    pub selected_text: String,
    /// Note text.
    pub note_content: String,
    /// Note type.
    pub note_type: String,
    /// Highlight color.
    pub color: String,
    /// Tags.
    pub tags: String,
    /// RFC 3339 creation time.
    pub created_at: String,
}

fn check_type(note_type: &str) -> Result<()> {
    if NOTE_TYPES.contains(&note_type) {
        Ok(())
    } else {
        Err(AppError::InvalidFormat(format!("Unknown note type: {}", note_type)))
    }
}

fn check_color(color: &str) -> Result<()> {
    if NOTE_COLORS.contains(&color) {
        Ok(())
    } else {
        Err(AppError::InvalidFormat(format!("Unknown note color: {}", color)))
    }
}

/// Note service.
#[derive(Clone)]
pub struct NoteService {
    db: Database,
}

impl NoteService {
    /// Create the service.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn owned_book(&self, user_id: &str, book_id: &str) -> Result<StoredBook> {
        self.db
            .get_user_book(user_id, book_id)?
            .ok_or_else(|| AppError::NotFound(format!("Book {}", book_id)))
    }

    /// Attach a note to a chapter of one of the user's books.
    pub fn create(&self, user_id: &str, book_id: &str, new: NewNote) -> Result<Note> {
        let book = self.owned_book(user_id, book_id)?;
        check_type(&new.note_type)?;
        check_color(&new.color)?;

        if self.db.get_chapter(&book.id, new.chapter_number)?.is_none() {
            return Err(AppError::NotFound(format!(
                "Chapter {} of book {}",
                new.chapter_number, book_id
            )));
        }
        if new.position_end < new.position_start {
            return Err(AppError::InvalidFormat(
                "Selection end is before its start".into(),
            ));
        }

        let now = db::now_timestamp();
        let note = Note {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            book_id: book.id,
            chapter_number: new.chapter_number,
            position_start: new.position_start,
            position_end: new.position_end,
            selected_text: new.selected_text,
            content: new.content,
            note_type: new.note_type,
            color: new.color,
            tags: new.tags.trim().to_string(),
            created_at: now,
            updated_at: now,
        };
        self.db.save_note(&note)?;
        Ok(note)
    }

    /// Notes on a book, optionally filtered by type and chapter.
    pub fn list(
        &self,
        user_id: &str,
        book_id: &str,
        note_type: Option<&str>,
        chapter_number: Option<i64>,
    ) -> Result<Vec<Note>> {
        let book = self.owned_book(user_id, book_id)?;
        self.db.list_notes(user_id, &book.id, note_type, chapter_number)
    }

    /// Apply changes to a note.
    pub fn update(&self, user_id: &str, id: &str, update: NoteUpdate) -> Result<Note> {
        let mut note = self
            .db
            .get_note(user_id, id)?
            .ok_or_else(|| AppError::NotFound(format!("Note {}", id)))?;

        if let Some(note_type) = update.note_type {
            check_type(&note_type)?;
            note.note_type = note_type;
        }
        if let Some(color) = update.color {
            check_color(&color)?;
            note.color = color;
        }
        if let Some(content) = update.content {
            note.content = content;
        }
        if let Some(tags) = update.tags {
            note.tags = tags.trim().to_string();
        }
        note.updated_at = db::now_timestamp();

        self.db.save_note(&note)?;
        Ok(note)
    }

    /// Delete a note.
    pub fn delete(&self, user_id: &str, id: &str) -> Result<()> {
        if self.db.delete_note(user_id, id)? {
            Ok(())
        } else {
            Err(AppError::NotFound(format!("Note {}", id)))
        }
    }

    /// Notes whose text, selection or tags contain `query`.
    pub fn search(&self, user_id: &str, query: &str) -> Result<Vec<Note>> {
        if query.trim().is_empty() {
            return Err(AppError::InvalidFormat("Search query is empty".into()));
        }
        self.db.search_notes(user_id, query)
    }

    /// Collect the notes to export: one book, or all of the user's books.
    fn collect(&self, user_id: &str, book_id: Option<&str>) -> Result<Vec<ExportedNote>> {
        let books = match book_id {
            Some(id) => vec![self.owned_book(user_id, id)?],
            None => self.db.list_books(user_id, None)?,
        };

        let mut exported = Vec::new();
        for book in books {
            for note in self.db.list_notes(user_id, &book.id, None, None)? {
                exported.push(ExportedNote {
                    book_title: book.title.clone(),
                    chapter_number: note.chapter_number,
                    selected_text: note.selected_text,
                    note_content: note.content,
                    note_type: note.note_type,
                    color: note.color,
                    tags: note.tags,
                    created_at: db::timestamp_to_datetime(note.created_at).to_rfc3339(),
                });
            }
        }
        Ok(exported)
    }

    /// Render the user's notes as a downloadable document.
    pub fn export(&self, user_id: &str, book_id: Option<&str>, format: ExportFormat) -> Result<String> {
        let notes = self.collect(user_id, book_id)?;

        match format {
            ExportFormat::Json => serde_json::to_string_pretty(&notes)
                .map_err(|e| AppError::Internal(format!("Failed to encode notes: {}", e))),
            ExportFormat::Markdown => Ok(render_markdown(&notes)),
        }
    }
}

/// Markdown grouped by book, then chapter.
fn render_markdown(notes: &[ExportedNote]) -> String {
    let mut out = String::from("# Reading Notes\n");
    let mut book: Option<&str> = None;
    let mut chapter: Option<i64> = None;

    for note in notes {
        if book != Some(note.book_title.as_str()) {
            let _ = write!(out, "\n## {}\n", note.book_title);
            book = Some(note.book_title.as_str());
            chapter = None;
        }
        if chapter != Some(note.chapter_number) {
            let _ = write!(out, "\n### Chapter {}\n", note.chapter_number);
            chapter = Some(note.chapter_number);
        }

        out.push('\n');
        if !note.selected_text.is_empty() {
            for line in note.selected_text.lines() {
                let _ = writeln!(out, "> {}", line);
            }
            out.push('\n');
        }
        if !note.note_content.is_empty() {
            let _ = writeln!(out, "{}", note.note_content);
            out.push('\n');
        }
        let _ = write!(out, "*{}, {}*", note.note_type, note.created_at);
        if !note.tags.is_empty() {
            let _ = write!(out, " · tags: {}", note.tags);
        }
        out.push('\n');
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exported(book: &str, chapter: i64, text: &str) -> ExportedNote {
        ExportedNote {
            book_title: book.to_string(),
            chapter_number: chapter,
            selected_text: "quoted".to_string(),
            note_content: text.to_string(),
            note_type: "note".to_string(),
            color: "yellow".to_string(),
            tags: String::new(),
            created_at: "2024-01-01T00:00:00+00:00".to_string(),
        }
    }

    #[test]
    fn markdown_groups_by_book_and_chapter() {
        let md = render_markdown(&[
            exported("Dune", 1, "first"),
            exported("Dune", 1, "second"),
            exported("Dune", 2, "third"),
        ]);
        assert_eq!(md.matches("## Dune").count(), 1);
        assert_eq!(md.matches("### Chapter 1").count(), 1);
        assert!(md.contains("### Chapter 2"));
        assert!(md.contains("> quoted\n\nfirst\n"));
    }

    #[test]
    fn export_format_names() {
        assert_eq!(ExportFormat::parse("JSON").unwrap(), ExportFormat::Json);
        assert_eq!(ExportFormat::parse("md").unwrap(), ExportFormat::Markdown);
        assert!(ExportFormat::parse("pdf").is_err());
    }

    #[test]
    fn validates_type_and_color() {
        assert!(check_type("insight").is_ok());
        assert!(check_type("doodle").is_err());
        assert!(check_color("purple").is_ok());
        assert!(check_color("black").is_err());
    }
}

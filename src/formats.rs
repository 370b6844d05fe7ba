mod docx;
mod epub;
mod mobi;
mod pdf;
pub mod text;

pub use docx::DocxHandler;
pub use epub::EpubHandler;
pub use mobi::MobiHandler;
pub use pdf::PdfHandler;
pub use text::{TextHandler, TextKind};

use crate::config::BookFormat;
use crate::error::Result;
use crate::library::book::BookMetadata;
use std::path::Path;

/// A titled or untitled piece of a book (an EPUB spine document, a PDF page run).
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    /// Title declared by the file, if any.
    pub title: Option<String>,
    /// Plain text.
    pub text: String,
}

/// Text content of a book.
#[derive(Debug, Clone, PartialEq)]
pub enum BookText {
    /// One continuous text; chapters are found by heading detection.
    Flat(String),
    /// Pre-segmented documents; each non-empty one becomes a chapter.
    Sections(Vec<Section>),
}

impl BookText {
    /// Whether there is no visible text at all.
    pub fn is_blank(&self) -> bool {
        match self {
            BookText::Flat(text) => text.trim().is_empty(),
            BookText::Sections(sections) => sections.iter().all(|s| s.text.trim().is_empty()),
        }
    }
}

/// Result of reading a book file.
#[derive(Debug, Clone)]
pub struct Extracted {
    /// Metadata declared by the file.
    pub metadata: BookMetadata,
    /// Text content.
    pub text: BookText,
}

/// Trait for format-specific book handlers.
pub trait FormatHandler: Send + Sync {
    /// Read metadata and text from a book file.
    fn extract(&self, path: &Path) -> Result<Extracted>;
}

/// Get the appropriate handler for a book format.
pub fn get_handler(format: BookFormat) -> Box<dyn FormatHandler> {
    match format {
        BookFormat::Epub => Box::new(EpubHandler),
        BookFormat::Pdf => Box::new(PdfHandler),
        BookFormat::Mobi => Box::new(MobiHandler),
        BookFormat::Docx => Box::new(DocxHandler),
        BookFormat::Txt => Box::new(TextHandler::new(TextKind::Plain)),
        BookFormat::Html => Box::new(TextHandler::new(TextKind::Html)),
        BookFormat::Md => Box::new(TextHandler::new(TextKind::Markdown)),
    }
}

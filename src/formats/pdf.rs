use crate::error::{AppError, Result};
use crate::formats::text::normalize_whitespace;
use crate::formats::{BookText, Extracted, FormatHandler};
use crate::library::book::BookMetadata;
use lopdf::{Dictionary, Document, Object};
use std::path::Path;

/// Handler for PDF files.
pub struct PdfHandler;

impl PdfHandler {
    /// Decode a PDF info dictionary string.
    fn info_string(obj: &Object) -> Option<String> {
        let text = match obj {
            Object::String(bytes, _) => {
                // UTF-16BE when it starts with a BOM
                if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
                    let utf16: Vec<u16> = rest
                        .chunks(2)
                        .map(|chunk| u16::from_be_bytes([chunk[0], chunk.get(1).copied().unwrap_or(0)]))
                        .collect();
                    String::from_utf16(&utf16).ok()?
                } else {
                    String::from_utf8(bytes.clone())
                        .unwrap_or_else(|_| bytes.iter().map(|&b| b as char).collect())
                }
            }
            Object::Name(name) => String::from_utf8(name.clone()).ok()?,
            _ => return None,
        };

        let trimmed = text.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }

    fn info_dictionary(doc: &Document) -> Option<&Dictionary> {
        let reference = doc.trailer.get(b"Info").ok()?.as_reference().ok()?;
        doc.get_dictionary(reference).ok()
    }

    /// Title, author and subject from the document info dictionary.
    fn read_metadata(doc: &Document) -> BookMetadata {
        let mut metadata = BookMetadata::default();
        let Some(info) = Self::info_dictionary(doc) else {
            return metadata;
        };

        if let Ok(title) = info.get(b"Title")
            && let Some(text) = Self::info_string(title)
        {
            metadata.set_title(&text);
        }

        if let Ok(author) = info.get(b"Author")
            && let Some(text) = Self::info_string(author)
        {
            metadata.authors = vec![text];
        }

        if let Ok(subject) = info.get(b"Subject")
            && let Some(text) = Self::info_string(subject)
        {
            metadata.description = Some(text);
        }

        metadata
    }
}

impl FormatHandler for PdfHandler {
    fn extract(&self, path: &Path) -> Result<Extracted> {
        let doc = Document::load(path).map_err(|e| AppError::Pdf(e.to_string()))?;
        let metadata = Self::read_metadata(&doc);

        let mut pages_text = Vec::new();
        for page_number in doc.get_pages().keys() {
            match doc.extract_text(&[*page_number]) {
                Ok(text) => pages_text.push(text),
                Err(e) => {
                    tracing::debug!(path = %path.display(), page = page_number, error = %e, "Failed to extract page text");
                }
            }
        }

        if pages_text.is_empty() {
            return Err(AppError::Pdf("No extractable text".to_string()));
        }

        Ok(Extracted {
            metadata,
            text: BookText::Flat(normalize_whitespace(&pages_text.join("\n\n"))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_utf16_info_strings() {
        let obj = Object::String(
            vec![0xFE, 0xFF, 0x00, b'H', 0x00, b'i'],
            lopdf::StringFormat::Literal,
        );
        assert_eq!(PdfHandler::info_string(&obj).as_deref(), Some("Hi"));
    }

    #[test]
    fn blank_info_strings_are_ignored() {
        let obj = Object::String(b"   ".to_vec(), lopdf::StringFormat::Literal);
        assert_eq!(PdfHandler::info_string(&obj), None);
        assert_eq!(PdfHandler::info_string(&Object::Integer(3)), None);
    }

    #[test]
    fn rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.pdf");
        std::fs::write(&path, b"not a pdf").unwrap();
        assert!(PdfHandler.extract(&path).is_err());
    }
}

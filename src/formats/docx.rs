use crate::error::{AppError, Result};
use crate::formats::{BookText, Extracted, FormatHandler, Section};
use crate::library::book::BookMetadata;
use roxmltree::{Document, Node};
use std::io::{Read, Seek};
use std::path::Path;
use zip::ZipArchive;

const WORD_NS: &str = "http://schemas.openxmlformats.org/wordprocessingml/2006/main";

/// Handler for Word (.docx) documents.
pub struct DocxHandler;

/// One body paragraph with its heading level, if styled as a heading.
struct Paragraph {
    text: String,
    heading: Option<u8>,
}

impl DocxHandler {
    fn read_entry<R: Read + Seek>(archive: &mut ZipArchive<R>, name: &str) -> Result<Option<String>> {
        let mut file = match archive.by_name(name) {
            Ok(file) => file,
            Err(zip::result::ZipError::FileNotFound) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut content = String::new();
        file.read_to_string(&mut content)?;
        Ok(Some(content))
    }

    /// Heading level from a paragraph style id such as `Heading1` or `Title`.
    fn heading_level(style: &str) -> Option<u8> {
        let lower = style.to_ascii_lowercase();
        if lower == "title" {
            return Some(0);
        }
        lower
            .strip_prefix("heading")
            .and_then(|n| n.trim().parse::<u8>().ok())
    }

    fn paragraph(node: Node) -> Paragraph {
        let mut text = String::new();
        let mut heading = None;

        for child in node.descendants() {
            match child.tag_name().name() {
                "pStyle" => {
                    heading = child
                        .attribute((WORD_NS, "val"))
                        .and_then(Self::heading_level);
                }
                "t" => text.push_str(child.text().unwrap_or("")),
                "tab" => text.push('\t'),
                "br" | "cr" => text.push('\n'),
                _ => {}
            }
        }

        Paragraph {
            text: text.trim().to_string(),
            heading,
        }
    }

    /// Parse `word/document.xml` into sections split at top-level headings.
    fn parse_document(content: &str) -> Result<BookText> {
        let doc = Document::parse(content)?;
        let paragraphs: Vec<Paragraph> = doc
            .descendants()
            .filter(|n| n.has_tag_name((WORD_NS, "p")))
            .map(Self::paragraph)
            .filter(|p| !p.text.is_empty())
            .collect();

        let top_level = paragraphs.iter().any(|p| p.heading == Some(1));
        if !top_level {
            let text = paragraphs
                .iter()
                .map(|p| p.text.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");
            return Ok(BookText::Flat(text));
        }

        let mut sections: Vec<Section> = Vec::new();
        let mut current = Section {
            title: None,
            text: String::new(),
        };

        for p in paragraphs {
            if p.heading == Some(1) {
                if !current.text.is_empty() {
                    sections.push(current);
                }
                current = Section {
                    title: Some(p.text.clone()),
                    text: String::new(),
                };
            }
            if !current.text.is_empty() {
                current.text.push_str("\n\n");
            }
            current.text.push_str(&p.text);
        }
        if !current.text.is_empty() {
            sections.push(current);
        }

        Ok(BookText::Sections(sections))
    }

    /// Title, creator, description and language from `docProps/core.xml`.
    fn parse_core(content: &str) -> Result<BookMetadata> {
        let doc = Document::parse(content)?;
        let mut metadata = BookMetadata::default();

        for node in doc.descendants() {
            let Some(text) = node.text() else {
                continue;
            };
            match node.tag_name().name() {
                "title" => metadata.set_title(text),
                "creator" if !text.trim().is_empty() => {
                    metadata.authors.push(text.trim().to_string())
                }
                "description" if !text.trim().is_empty() => {
                    metadata.description = Some(text.trim().to_string())
                }
                "language" if !text.trim().is_empty() => {
                    metadata.language = Some(text.trim().to_string())
                }
                _ => {}
            }
        }

        Ok(metadata)
    }

    /// Read a DOCX from any seekable source.
    pub fn extract_from<R: Read + Seek>(reader: R) -> Result<Extracted> {
        let mut archive = ZipArchive::new(reader)?;

        let document = Self::read_entry(&mut archive, "word/document.xml")?
            .ok_or_else(|| AppError::InvalidFormat("DOCX has no word/document.xml".into()))?;
        let text = Self::parse_document(&document)?;

        let metadata = match Self::read_entry(&mut archive, "docProps/core.xml")? {
            Some(core) => Self::parse_core(&core).unwrap_or_else(|e| {
                tracing::debug!(error = %e, "Ignoring unreadable DOCX core properties");
                BookMetadata::default()
            }),
            None => BookMetadata::default(),
        };

        Ok(Extracted { metadata, text })
    }
}

impl FormatHandler for DocxHandler {
    fn extract(&self, path: &Path) -> Result<Extracted> {
        let file = std::fs::File::open(path)?;
        Self::extract_from(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;

    fn paragraph(style: Option<&str>, text: &str) -> String {
        let props = style
            .map(|s| format!(r#"<w:pPr><w:pStyle w:val="{s}"/></w:pPr>"#))
            .unwrap_or_default();
        format!("<w:p>{props}<w:r><w:t>{text}</w:t></w:r></w:p>")
    }

    fn build_docx(body: &str, core: Option<&str>) -> Vec<u8> {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();

        zip.start_file("word/document.xml", options).unwrap();
        write!(
            zip,
            r#"<?xml version="1.0"?><w:document xmlns:w="{WORD_NS}"><w:body>{body}</w:body></w:document>"#
        )
        .unwrap();

        if let Some(core) = core {
            zip.start_file("docProps/core.xml", options).unwrap();
            zip.write_all(core.as_bytes()).unwrap();
        }

        zip.finish().unwrap().into_inner()
    }

    #[test]
    fn flat_text_without_headings() {
        let body = [paragraph(None, "One"), paragraph(None, " "), paragraph(None, "Two")].concat();
        let extracted = DocxHandler::extract_from(Cursor::new(build_docx(&body, None))).unwrap();
        assert_eq!(extracted.text, BookText::Flat("One\n\nTwo".to_string()));
        assert!(extracted.metadata.title.is_none());
    }

    #[test]
    fn splits_at_heading1() {
        let body = [
            paragraph(Some("Title"), "My Book"),
            paragraph(Some("Heading1"), "Start"),
            paragraph(None, "Alpha"),
            paragraph(Some("Heading2"), "Sub"),
            paragraph(Some("Heading1"), "End"),
            paragraph(None, "Omega"),
        ]
        .concat();
        let core = r#"<?xml version="1.0"?>
<cp:coreProperties xmlns:cp="http://schemas.openxmlformats.org/package/2006/metadata/core-properties"
    xmlns:dc="http://purl.org/dc/elements/1.1/">
  <dc:title>Core Title</dc:title><dc:creator>Ann Author</dc:creator>
</cp:coreProperties>"#;

        let extracted = DocxHandler::extract_from(Cursor::new(build_docx(&body, Some(core)))).unwrap();
        assert_eq!(extracted.metadata.title.as_deref(), Some("Core Title"));
        assert_eq!(extracted.metadata.author().as_deref(), Some("Ann Author"));

        let BookText::Sections(sections) = extracted.text else {
            panic!("expected sections");
        };
        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0].title, None);
        assert_eq!(sections[0].text, "My Book");
        assert_eq!(sections[1].title.as_deref(), Some("Start"));
        assert_eq!(sections[1].text, "Start\n\nAlpha\n\nSub");
        assert_eq!(sections[2].text, "End\n\nOmega");
    }

    #[test]
    fn missing_document_is_invalid() {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        zip.start_file("other.xml", SimpleFileOptions::default()).unwrap();
        zip.write_all(b"<x/>").unwrap();
        let bytes = zip.finish().unwrap().into_inner();
        assert!(matches!(
            DocxHandler::extract_from(Cursor::new(bytes)),
            Err(AppError::InvalidFormat(_))
        ));
    }
}

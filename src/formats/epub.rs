//! EPUB format handler.

use crate::error::{AppError, Result};
use crate::formats::text::{decode_text, html_title, html_to_text};
use crate::formats::{BookText, Extracted, FormatHandler, Section};
use crate::library::book::BookMetadata;
use roxmltree::Document;
use std::collections::HashMap;
use std::io::{Read, Seek};
use std::path::Path;
use zip::ZipArchive;

/// Handler for EPUB files.
pub struct EpubHandler;

/// Parsed package document.
#[derive(Debug, Default)]
struct Package {
    metadata: BookMetadata,
    /// Archive paths of the spine documents, in reading order.
    spine: Vec<String>,
}

impl EpubHandler {
    /// Find the OPF file path from container.xml.
    fn find_opf_path<R: Read + Seek>(archive: &mut ZipArchive<R>) -> Result<String> {
        let mut container = archive.by_name("META-INF/container.xml")?;
        let mut content = String::new();
        container.read_to_string(&mut content)?;

        let doc = Document::parse(&content)?;

        doc.descendants()
            .find(|n| n.has_tag_name("rootfile"))
            .and_then(|n| n.attribute("full-path"))
            .map(String::from)
            .ok_or_else(|| AppError::InvalidFormat("No rootfile in container.xml".into()))
    }

    /// Resolve a manifest href against the OPF directory.
    fn resolve_href(opf_dir: &str, href: &str) -> String {
        let href = href.split('#').next().unwrap_or(href);
        let href = urlencoding::decode(href)
            .map(|h| h.into_owned())
            .unwrap_or_else(|_| href.to_string());

        let mut parts: Vec<&str> = if opf_dir.is_empty() {
            Vec::new()
        } else {
            opf_dir.split('/').collect()
        };

        for segment in href.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                s => parts.push(s),
            }
        }

        parts.join("/")
    }

    /// Parse the OPF file: metadata, manifest and spine.
    fn parse_opf(content: &str, opf_dir: &str) -> Result<Package> {
        let doc = Document::parse(content)?;
        let mut package = Package::default();

        for node in doc.descendants() {
            let Some(text) = node.text() else {
                continue;
            };
            match node.tag_name().name() {
                "title" if package.metadata.title.is_none() => package.metadata.set_title(text),
                "creator" => {
                    let trimmed = text.trim();
                    if !trimmed.is_empty() {
                        package.metadata.authors.push(trimmed.to_string());
                    }
                }
                "description" => {
                    let trimmed = html_to_text(text);
                    if !trimmed.is_empty() {
                        package.metadata.description = Some(trimmed);
                    }
                }
                "language" => package.metadata.language = Some(text.trim().to_string()),
                _ => {}
            }
        }

        let manifest: HashMap<&str, &str> = doc
            .descendants()
            .filter(|n| n.has_tag_name("item"))
            .filter(|n| {
                n.attribute("media-type")
                    .is_none_or(|t| t.contains("html") || t.contains("xml"))
            })
            .filter_map(|n| Some((n.attribute("id")?, n.attribute("href")?)))
            .collect();

        package.spine = doc
            .descendants()
            .filter(|n| n.has_tag_name("itemref"))
            .filter(|n| n.attribute("linear") != Some("no"))
            .filter_map(|n| n.attribute("idref"))
            .filter_map(|idref| manifest.get(idref))
            .map(|href| Self::resolve_href(opf_dir, href))
            .collect();

        Ok(package)
    }

    /// Read an EPUB from any seekable source.
    pub fn extract_from<R: Read + Seek>(reader: R) -> Result<Extracted> {
        let mut archive = ZipArchive::new(reader)?;

        let opf_path = Self::find_opf_path(&mut archive)?;
        let opf_dir = opf_path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");

        let mut opf_content = String::new();
        archive
            .by_name(&opf_path)?
            .read_to_string(&mut opf_content)?;

        let package = Self::parse_opf(&opf_content, opf_dir)?;
        if package.spine.is_empty() {
            return Err(AppError::InvalidFormat("EPUB spine is empty".into()));
        }

        let mut sections = Vec::with_capacity(package.spine.len());
        for path in &package.spine {
            let mut bytes = Vec::new();
            match archive.by_name(path) {
                Ok(mut file) => {
                    file.read_to_end(&mut bytes)?;
                }
                Err(e) => {
                    tracing::debug!(path = %path, error = %e, "Spine document missing from archive");
                    continue;
                }
            }

            let html = decode_text(&bytes);
            let text = html_to_text(&html);
            if text.is_empty() {
                continue;
            }
            sections.push(Section {
                title: html_title(&html),
                text,
            });
        }

        Ok(Extracted {
            metadata: package.metadata,
            text: BookText::Sections(sections),
        })
    }
}

impl FormatHandler for EpubHandler {
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

    /// Build a small EPUB with the given (title, body) chapters.
    fn build_epub(title: &str, chapters: &[(&str, &str)]) -> Vec<u8> {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();

        zip.start_file("mimetype", options).unwrap();
        zip.write_all(b"application/epub+zip").unwrap();

        zip.start_file("META-INF/container.xml", options).unwrap();
        zip.write_all(
            br#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles><rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/></rootfiles>
</container>"#,
        )
        .unwrap();

        let mut manifest = String::new();
        let mut spine = String::new();
        for (i, (heading, body)) in chapters.iter().enumerate() {
            manifest.push_str(&format!(
                r#"<item id="c{i}" href="text/ch%20{i}.xhtml" media-type="application/xhtml+xml"/>"#
            ));
            spine.push_str(&format!(r#"<itemref idref="c{i}"/>"#));

            zip.start_file(format!("OEBPS/text/ch {i}.xhtml"), options)
                .unwrap();
            zip.write_all(
                format!(
                    "<html><head><title>x</title></head><body><h2>{heading}</h2><p>{body}</p></body></html>"
                )
                .as_bytes(),
            )
            .unwrap();
        }

        zip.start_file("OEBPS/content.opf", options).unwrap();
        zip.write_all(
            format!(
                r#"<?xml version="1.0"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:title>{title}</dc:title>
    <dc:creator>Jane Doe</dc:creator>
    <dc:language>en</dc:language>
  </metadata>
  <manifest>{manifest}</manifest>
  <spine>{spine}</spine>
</package>"#
            )
            .as_bytes(),
        )
        .unwrap();

        zip.finish().unwrap().into_inner()
    }

    #[test]
    fn reads_spine_in_order() {
        let bytes = build_epub("Test Book", &[("Opening", "First text"), ("Ending", "Last text")]);
        let extracted = EpubHandler::extract_from(Cursor::new(bytes)).unwrap();

        assert_eq!(extracted.metadata.title.as_deref(), Some("Test Book"));
        assert_eq!(extracted.metadata.author().as_deref(), Some("Jane Doe"));
        assert_eq!(extracted.metadata.language.as_deref(), Some("en"));

        let BookText::Sections(sections) = extracted.text else {
            panic!("expected sections");
        };
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].title.as_deref(), Some("Opening"));
        assert_eq!(sections[0].text, "Opening\n\nFirst text");
        assert_eq!(sections[1].title.as_deref(), Some("Ending"));
    }

    #[test]
    fn resolves_relative_hrefs() {
        assert_eq!(EpubHandler::resolve_href("OEBPS", "text/a.xhtml"), "OEBPS/text/a.xhtml");
        assert_eq!(EpubHandler::resolve_href("OEBPS/text", "../b.xhtml#x"), "OEBPS/b.xhtml");
        assert_eq!(EpubHandler::resolve_href("", "c%20d.xhtml"), "c d.xhtml");
    }

    #[test]
    fn rejects_non_zip() {
        assert!(EpubHandler::extract_from(Cursor::new(b"not a zip".to_vec())).is_err());
    }
}

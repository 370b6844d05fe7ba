//! Plain text, HTML and Markdown handlers, plus shared text helpers.

use crate::error::Result;
use crate::formats::{BookText, Extracted, FormatHandler};
use crate::library::book::BookMetadata;
use encoding_rs::{Encoding, GBK, UTF_8};
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

static SCRIPT_STYLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style|head|title)\b[^>]*>.*?</(script|style|head|title)\s*>")
        .expect("valid regex")
});

static BLOCK_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)</?(p|div|br|h[1-6]|li|tr|blockquote|section|article|pre)\b[^>]*>")
        .expect("valid regex")
});

static HEADING_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<h[1-3]\b[^>]*>(.*?)</h[1-3]\s*>").expect("valid regex")
});

static TITLE_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<title\b[^>]*>(.*?)</title\s*>").expect("valid regex")
});

static ANY_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<[^>]*>").expect("valid regex")
});

static MD_MARKUP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\*\*|__|`|!\[[^\]]*\]\([^)]*\))").expect("valid regex")
});

/// Decode bytes as UTF-8 (BOM aware), falling back to GBK.
pub fn decode_text(bytes: &[u8]) -> String {
    if let Some((encoding, _)) = Encoding::for_bom(bytes) {
        let (text, _, _) = encoding.decode(bytes);
        return text.into_owned();
    }

    if let Ok(text) = std::str::from_utf8(bytes) {
        return text.to_string();
    }

    let (text, _, had_errors) = GBK.decode(bytes);
    if had_errors {
        tracing::debug!("Text is neither valid UTF-8 nor GBK, decoding lossily");
        return UTF_8.decode(bytes).0.into_owned();
    }
    text.into_owned()
}

/// Collapse runs of blank lines and trim each line.
pub fn normalize_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            blank_run += 1;
            if blank_run == 1 && !out.is_empty() {
                out.push('\n');
            }
            continue;
        }
        blank_run = 0;
        out.push_str(line);
        out.push('\n');
    }

    out.trim_end().to_string()
}

/// Convert an HTML document to plain text, one block element per paragraph.
pub fn html_to_text(html: &str) -> String {
    let without_scripts = SCRIPT_STYLE.replace_all(html, "");
    let with_breaks = BLOCK_TAG.replace_all(&without_scripts, "\n\n");
    let stripped = ANY_TAG.replace_all(&with_breaks, "");
    let decoded = html_escape::decode_html_entities(&stripped);
    normalize_whitespace(&decoded.replace('\u{a0}', " "))
}

/// First `<h1>`-`<h3>` heading text, or the `<title>` of an HTML document.
pub fn html_title(html: &str) -> Option<String> {
    let clean = |raw: &str| {
        let text = ANY_TAG.replace_all(raw, "");
        let text = html_escape::decode_html_entities(&text);
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    };

    HEADING_TAG
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| clean(m.as_str()))
        .filter(|t| !t.is_empty())
        .or_else(|| {
            TITLE_TAG
                .captures(html)
                .and_then(|c| c.get(1))
                .map(|m| clean(m.as_str()))
                .filter(|t| !t.is_empty())
        })
}

/// Drop inline Markdown markup, keeping headings for chapter detection.
pub fn markdown_to_text(markdown: &str) -> String {
    let mut out = String::with_capacity(markdown.len());
    let mut in_fence = false;

    for line in markdown.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            out.push_str(line);
        } else {
            out.push_str(&MD_MARKUP.replace_all(line, ""));
        }
        out.push('\n');
    }

    normalize_whitespace(&out)
}

/// Kind of text document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextKind {
    /// Plain text.
    Plain,
    /// HTML page.
    Html,
    /// Markdown source.
    Markdown,
}

/// Handler for text-based formats.
pub struct TextHandler {
    kind: TextKind,
}

impl TextHandler {
    /// Create a handler for one text kind.
    pub fn new(kind: TextKind) -> Self {
        Self { kind }
    }

    /// Extract from in-memory bytes.
    pub fn extract_bytes(&self, bytes: &[u8]) -> Extracted {
        let raw = decode_text(bytes);
        let mut metadata = BookMetadata::default();

        let text = match self.kind {
            TextKind::Plain => normalize_whitespace(&raw),
            TextKind::Html => {
                if let Some(title) = TITLE_TAG
                    .captures(&raw)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string())
                {
                    metadata.set_title(&html_escape::decode_html_entities(&title));
                }
                html_to_text(&raw)
            }
            TextKind::Markdown => markdown_to_text(&raw),
        };

        Extracted {
            metadata,
            text: BookText::Flat(text),
        }
    }
}

impl FormatHandler for TextHandler {
    fn extract(&self, path: &Path) -> Result<Extracted> {
        let bytes = std::fs::read(path)?;
        Ok(self.extract_bytes(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_gbk_fallback() {
        let (gbk, _, _) = GBK.encode("第一章 你好");
        assert_eq!(decode_text(&gbk), "第一章 你好");
        assert_eq!(decode_text("plain".as_bytes()), "plain");
        assert_eq!(decode_text(b"\xEF\xBB\xBFbom"), "bom");
    }

    #[test]
    fn html_is_flattened() {
        let html = "<html><head><title>T</title><style>p{}</style></head>\
                    <body><h1>Chapter 1</h1><p>Tom &amp; Jerry</p><p>Line<br>two</p></body></html>";
        assert_eq!(html_to_text(html), "Chapter 1\n\nTom & Jerry\n\nLine\n\ntwo");
        assert_eq!(html_title(html).as_deref(), Some("Chapter 1"));
    }

    #[test]
    fn html_title_falls_back_to_title_tag() {
        assert_eq!(
            html_title("<head><title> The  Book </title></head><p>x</p>").as_deref(),
            Some("The Book")
        );
        assert_eq!(html_title("<p>none</p>"), None);
    }

    #[test]
    fn markdown_keeps_headings() {
        let md = "# One\n\nSome **bold** and `code`.\n\n```\n**raw**\n```\n";
        assert_eq!(markdown_to_text(md), "# One\n\nSome bold and code.\n\n**raw**");
    }

    #[test]
    fn html_handler_reads_title() {
        let handler = TextHandler::new(TextKind::Html);
        let extracted = handler.extract_bytes(b"<title>My Page</title><p>Body</p>");
        assert_eq!(extracted.metadata.title.as_deref(), Some("My Page"));
        assert_eq!(extracted.text, BookText::Flat("Body".to_string()));
    }
}

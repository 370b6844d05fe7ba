//! Book metadata and naming helpers.

use serde::{Deserialize, Serialize};

/// Metadata read from a book file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookMetadata {
    /// Title as declared by the file.
    pub title: Option<String>,

    /// Authors (may be empty).
    pub authors: Vec<String>,

    /// Book description or summary.
    pub description: Option<String>,

    /// Language code (e.g., "en", "zh").
    pub language: Option<String>,
}

impl BookMetadata {
    /// First listed author.
    pub fn author(&self) -> Option<String> {
        self.authors.first().cloned()
    }

    /// Set `title` if `value` is non-blank.
    pub fn set_title(&mut self, value: &str) {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            self.title = Some(trimmed.to_string());
        }
    }
}

/// Words stripped from file names when deriving a title.
const TITLE_NOISE: &[&str] = &["电子书", "完整版", "高清版", "ebook", "eBook", "EBOOK", "PDF", "pdf"];

/// Derive a display title from an uploaded file name.
///
/// `The_Great-Gatsby_ebook.epub` becomes `The Great Gatsby`.
pub fn title_from_filename(filename: &str) -> String {
    let stem = std::path::Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename);

    let mut title = stem.replace(['_', '-'], " ");
    for noise in TITLE_NOISE {
        title = title.replace(noise, "");
    }

    let title = title.split_whitespace().collect::<Vec<_>>().join(" ");
    if title.is_empty() {
        stem.to_string()
    } else {
        title
    }
}

/// Whether a character belongs to a script written without spaces.
pub fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF      // CJK unified ideographs
        | 0x3400..=0x4DBF    // extension A
        | 0x3040..=0x30FF    // hiragana, katakana
        | 0xAC00..=0xD7AF    // hangul syllables
        | 0xF900..=0xFAFF)
}

/// Count words: every CJK character counts as one, other text splits on whitespace.
pub fn count_words(text: &str) -> i64 {
    let mut count = 0i64;
    let mut in_word = false;

    for c in text.chars() {
        if is_cjk(c) {
            count += 1;
            in_word = false;
        } else if c.is_alphanumeric() {
            if !in_word {
                count += 1;
                in_word = true;
            }
        } else if c.is_whitespace() || !matches!(c, '\'' | '’' | '-') {
            in_word = false;
        }
    }

    count
}

/// File name offered on download.
pub fn download_filename(title: &str, extension: &str) -> String {
    let safe: String = title
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect();
    format!("{}.{}", safe.trim(), extension)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_cleanup() {
        assert_eq!(title_from_filename("The_Great-Gatsby_ebook.epub"), "The Great Gatsby");
        assert_eq!(title_from_filename("三体_完整版.txt"), "三体");
        assert_eq!(title_from_filename("ebook.pdf"), "ebook");
    }

    #[test]
    fn word_counts() {
        assert_eq!(count_words("Hello, world! It's fine."), 4);
        assert_eq!(count_words("你好世界"), 4);
        assert_eq!(count_words("Rust 语言"), 3);
        assert_eq!(count_words(""), 0);
    }

    #[test]
    fn download_name_is_safe() {
        assert_eq!(download_filename("A/B: C?", "epub"), "A_B_ C_.epub");
    }
}

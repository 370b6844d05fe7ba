//! Splitting extracted text into chapters.

use crate::config::ReaderConfig;
use crate::formats::{BookText, Section};
use crate::library::book::count_words;
use regex::Regex;
use std::sync::LazyLock;

/// Longest line still considered a heading.
const MAX_HEADING_CHARS: usize = 60;

static HEADING_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // 第1章 / 第一章 / 第十二回 / 第3节 ...
        r"^第\s*[零〇一二三四五六七八九十百千万两\d]+\s*[章节回话卷集部篇]",
        r"^卷\s*[零〇一二三四五六七八九十百千万\d]+",
        r"^(序章|序言|楔子|引子|尾声|后记|番外)",
        r"(?i)^(chapter|chap\.)\s*(\d+|[ivxlcdm]+|one|two|three|four|five|six|seven|eight|nine|ten|eleven|twelve|thirteen|fourteen|fifteen|sixteen|seventeen|eighteen|nineteen|twenty)\b",
        r"(?i)^(part|section|book)\s+(\d+\b|[ivxlcdm]+\b\s*([:.\-]|$))",
        r"(?i)^(prologue|epilogue|preface|introduction)\s*$",
        r"^#{1,2}\s+\S",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// A chapter ready to be stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Chapter {
    /// Chapter title.
    pub title: String,
    /// Chapter text.
    pub content: String,
}

impl Chapter {
    /// Word count of the content.
    pub fn word_count(&self) -> i64 {
        count_words(&self.content)
    }
}

/// Whether a line looks like a chapter heading.
pub fn is_heading(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.chars().count() > MAX_HEADING_CHARS {
        return false;
    }
    HEADING_PATTERNS.iter().any(|re| re.is_match(trimmed))
}

fn heading_title(line: &str) -> String {
    line.trim().trim_start_matches('#').trim().to_string()
}

/// Splits book text into chapters.
#[derive(Debug, Clone)]
pub struct ChapterSplitter {
    max_chapter_chars: usize,
    preface_min_chars: usize,
}

impl ChapterSplitter {
    /// Create a splitter from reader settings.
    pub fn new(config: &ReaderConfig) -> Self {
        Self {
            max_chapter_chars: config.max_chapter_chars.max(1),
            preface_min_chars: config.preface_min_chars,
        }
    }

    /// Turn extracted text into chapters.
    pub fn split_book(&self, text: &BookText) -> Vec<Chapter> {
        match text {
            BookText::Flat(text) => self.split(text),
            BookText::Sections(sections) => self.from_sections(sections),
        }
    }

    /// One chapter per non-empty section. A single section is split like flat text.
    fn from_sections(&self, sections: &[Section]) -> Vec<Chapter> {
        let non_empty: Vec<&Section> = sections
            .iter()
            .filter(|s| !s.text.trim().is_empty())
            .collect();

        if non_empty.len() == 1 && non_empty[0].title.is_none() {
            return self.split(&non_empty[0].text);
        }

        non_empty
            .into_iter()
            .enumerate()
            .map(|(i, section)| {
                let title = section
                    .title
                    .clone()
                    .or_else(|| {
                        section
                            .text
                            .lines()
                            .map(str::trim)
                            .find(|l| !l.is_empty())
                            .filter(|l| is_heading(l))
                            .map(heading_title)
                    })
                    .unwrap_or_else(|| format!("Chapter {}", i + 1));
                Chapter {
                    title,
                    content: section.text.trim().to_string(),
                }
            })
            .collect()
    }

    /// Split flat text at heading lines, falling back to fixed-size chunks.
    pub fn split(&self, text: &str) -> Vec<Chapter> {
        let text = text.replace("\r\n", "\n").replace('\r', "\n");
        if text.trim().is_empty() {
            return Vec::new();
        }

        let mut chapters = Vec::new();
        let mut preface = String::new();
        let mut current: Option<(String, String)> = None;

        for line in text.lines() {
            if is_heading(line) {
                if let Some((title, body)) = current.take() {
                    if !body.trim().is_empty() {
                        chapters.push(Chapter {
                            title,
                            content: body.trim().to_string(),
                        });
                    }
                }
                current = Some((heading_title(line), String::new()));
                continue;
            }

            let target = match current.as_mut() {
                Some((_, body)) => body,
                None => &mut preface,
            };
            target.push_str(line);
            target.push('\n');
        }

        if let Some((title, body)) = current
            && !body.trim().is_empty()
        {
            chapters.push(Chapter {
                title,
                content: body.trim().to_string(),
            });
        }

        if chapters.is_empty() {
            return self.chunk(&text);
        }

        let preface = preface.trim();
        if preface.chars().count() >= self.preface_min_chars && !preface.is_empty() {
            chapters.insert(
                0,
                Chapter {
                    title: "Preface".to_string(),
                    content: preface.to_string(),
                },
            );
        }

        chapters
    }

    /// Cut headingless text into chunks of at most `max_chapter_chars`
    /// characters, breaking at paragraph boundaries.
    fn chunk(&self, text: &str) -> Vec<Chapter> {
        let max = self.max_chapter_chars;
        let mut chunks: Vec<String> = Vec::new();
        let mut current = String::new();
        let mut current_len = 0usize;

        for paragraph in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
            let len = paragraph.chars().count();

            if current_len > 0 && current_len + 2 + len > max {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }

            if len > max {
                // Paragraph alone is too long: hard split by characters.
                let chars: Vec<char> = paragraph.chars().collect();
                for piece in chars.chunks(max) {
                    chunks.push(piece.iter().collect());
                }
                continue;
            }

            if current_len > 0 {
                current.push_str("\n\n");
                current_len += 2;
            }
            current.push_str(paragraph);
            current_len += len;
        }

        if !current.is_empty() {
            chunks.push(current);
        }

        let single = chunks.len() == 1;
        chunks
            .into_iter()
            .enumerate()
            .map(|(i, content)| Chapter {
                title: if single {
                    "Full Text".to_string()
                } else {
                    format!("Part {}", i + 1)
                },
                content,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn splitter(max: usize) -> ChapterSplitter {
        ChapterSplitter::new(&ReaderConfig {
            max_chapter_chars: max,
            preface_min_chars: 10,
        })
    }

    #[test]
    fn detects_headings() {
        assert!(is_heading("第一章 风起"));
        assert!(is_heading("第 12 回"));
        assert!(is_heading("Chapter 3: The Road"));
        assert!(is_heading("CHAPTER IV"));
        assert!(is_heading("## Getting started"));
        assert!(!is_heading("He read chapter after chapter until dawn broke over the quiet hills."));
        assert!(!is_heading("Plain sentence."));
        assert!(!is_heading("Part of the problem"));
        assert!(is_heading("Part II: Winter"));
    }

    #[test]
    fn splits_on_headings_with_preface() {
        let text = "A long enough preface paragraph.\n\nChapter 1\nIt begins.\n\nChapter 2\nIt ends.\n";
        let chapters = splitter(1000).split(text);

        let titles: Vec<&str> = chapters.iter().map(|c| c.title.as_str()).collect();
        assert_eq!(titles, vec!["Preface", "Chapter 1", "Chapter 2"]);
        assert_eq!(chapters[1].content, "It begins.");
        assert_eq!(chapters[2].content, "It ends.");
    }

    #[test]
    fn short_preface_dropped_and_empty_headings_skipped() {
        let text = "Hi\n第一章\n第二章 开始\n正文内容\n";
        let chapters = splitter(1000).split(text);
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].title, "第二章 开始");
        assert_eq!(chapters[0].content, "正文内容");
    }

    #[test]
    fn chunks_headingless_text() {
        let text = "aaaa\n\nbbbb\n\ncccc";
        let chapters = splitter(10).split(text);
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].title, "Part 1");
        assert_eq!(chapters[0].content, "aaaa\n\nbbbb");
        assert_eq!(chapters[1].content, "cccc");

        let single = splitter(100).split(text);
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].title, "Full Text");
    }

    #[test]
    fn oversized_paragraph_is_cut() {
        let chapters = splitter(4).split("abcdefghij");
        let contents: Vec<&str> = chapters.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn sections_become_chapters() {
        let sections = vec![
            Section {
                title: None,
                text: "Chapter 1\nFirst".to_string(),
            },
            Section {
                title: None,
                text: "   ".to_string(),
            },
            Section {
                title: None,
                text: "no heading here".to_string(),
            },
        ];
        let chapters = splitter(1000).split_book(&BookText::Sections(sections));
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].title, "Chapter 1");
        assert_eq!(chapters[1].title, "Chapter 2");
    }

    #[test]
    fn empty_text_has_no_chapters() {
        assert!(splitter(100).split("  \n ").is_empty());
    }
}

//! Reading assistant: questions, summaries, keywords and text analysis.

use super::backend::{ChatMessage, Completion, HttpLlmBackend, LlmBackend, Prompt};
use crate::config::AiConfig;
use crate::db::{self, AiRequestLog, ChapterSummary, Database, QaEntry, StoredBook};
use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Accepted question types.
pub const QUESTION_TYPES: &[&str] = &["text", "paragraph", "chapter", "book", "concept", "summary"];

/// Accepted chapter summary types.
pub const SUMMARY_TYPES: &[&str] = &["auto", "key_points", "detailed"];

/// Accepted analysis types.
pub const ANALYSIS_TYPES: &[&str] = &["general", "sentiment", "structure", "style"];

const CHAPTER_CONTEXT_CHARS: usize = 2000;
const BOOK_CONTENT_CHARS: usize = 8000;
const BOOK_SUMMARY_CHAPTERS: usize = 5;
const HISTORY_TURNS: usize = 3;

fn default_question_type() -> String {
    "text".to_string()
}

/// A question about a book.
#[derive(Debug, Clone, Deserialize)]
pub struct Question {
    /// Question text.
    pub question: String,
    /// One of [`QUESTION_TYPES`].
    #[serde(default = "default_question_type")]
    pub question_type: String,
    /// Passage the question refers to.
    #[serde(default)]
    pub selected_text: Option<String>,
    /// Chapter the question refers to.
    #[serde(default)]
    pub chapter_number: Option<i64>,
}

/// Chapter summary and whether it came from the summary table.
#[derive(Debug, Clone, Serialize)]
pub struct ChapterSummaryResult {
    /// The summary.
    #[serde(flatten)]
    pub summary: ChapterSummary,
    /// True when no backend call was made.
    pub from_cache: bool,
}

/// Result of a text analysis.
#[derive(Debug, Clone, Serialize)]
pub struct Analysis {
    /// Analysis type actually used.
    pub analysis_type: String,
    /// Backend answer.
    pub analysis: String,
    /// Tokens reported by the backend.
    pub tokens_used: i64,
    /// Seconds spent waiting.
    pub processing_time: f64,
}

/// Outcome of a connectivity probe.
#[derive(Debug, Clone, Serialize)]
pub struct BackendCheck {
    /// Configured model.
    pub model: String,
    /// Backend reply.
    pub reply: String,
    /// Seconds spent waiting.
    pub processing_time: f64,
}

/// A completed backend call.
struct Reply {
    completion: Completion,
    elapsed: f64,
    model: String,
}

/// Truncate to `max` characters, marking the cut with "...".
fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

fn question_instruction(question_type: &str) -> &'static str {
    match question_type {
        "text" => {
            "Answer based on the selected text. If the text is not enough to \
             answer, say what more information is needed."
        }
        "paragraph" => "Analyze this paragraph and give a detailed explanation.",
        "chapter" => {
            "Answer based on the whole chapter. You may quote specific passages \
             or sentences."
        }
        "book" => "Answer based on the whole book. You may analyze and summarize across chapters.",
        "concept" => {
            "Explain this concept in detail, including its definition, \
             characteristics and applications."
        }
        "summary" => "Summarize the given content, highlighting the key points.",
        _ => "Answer the following question.",
    }
}

fn summary_instruction(summary_type: &str) -> &'static str {
    match summary_type {
        "key_points" => "Extract the key points of the following chapter as a list.",
        "detailed" => {
            "Write a detailed summary and analysis of the following chapter, \
             covering its main ideas, its reasoning and its conclusions."
        }
        _ => "Write a concise summary of the following chapter, highlighting its main ideas.",
    }
}

fn analysis_prompt(analysis_type: &str, text: &str) -> String {
    match analysis_type {
        "sentiment" => format!(
            "Analyze the sentiment of the following text (positive, negative or \
             neutral) and explain your reasoning in detail:\n\n{}",
            text
        ),
        "structure" => format!(
            "Analyze the structure and organization of the following text:\n\n{}",
            text
        ),
        "style" => format!(
            "Analyze the writing style and distinctive features of the following text:\n\n{}",
            text
        ),
        _ => format!(
            "Give a complete analysis of the following text, including its \
             themes, structure and style:\n\n{}",
            text
        ),
    }
}

const SUMMARY_MARKERS: &[&str] = &["summary:", "总结：", "总结:"];
const KEY_POINT_MARKERS: &[&str] = &["key points:", "关键要点：", "关键要点:"];

fn strip_marker<'a>(line: &'a str, markers: &[&str]) -> Option<&'a str> {
    markers.iter().find_map(|m| {
        line.get(..m.len())
            .filter(|prefix| prefix.eq_ignore_ascii_case(m))
            .map(|_| line[m.len()..].trim())
    })
}

/// Split a summary answer into the summary text and its key points.
///
/// Text outside both sections is ignored; an answer without a summary
/// section is used whole as the summary.
pub fn parse_summary(response: &str) -> (String, Vec<String>) {
    #[derive(PartialEq)]
    enum Section {
        None,
        Summary,
        Points,
    }

    let mut section = Section::None;
    let mut summary = String::new();
    let mut points = Vec::new();

    for line in response.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(rest) = strip_marker(line, SUMMARY_MARKERS) {
            section = Section::Summary;
            summary.push_str(rest);
            continue;
        }
        if let Some(rest) = strip_marker(line, KEY_POINT_MARKERS) {
            section = Section::Points;
            if !rest.is_empty() {
                points.push(rest.to_string());
            }
            continue;
        }

        match section {
            Section::Summary => {
                if !summary.is_empty() {
                    summary.push(' ');
                }
                summary.push_str(line);
            }
            Section::Points => {
                if line.starts_with(|c: char| c.is_ascii_digit() || matches!(c, '-' | '•' | '*')) {
                    let point = line
                        .trim_start_matches(|c: char| {
                            c.is_ascii_digit() || matches!(c, '.' | '-' | '•' | '*' | ')' | '、')
                        })
                        .trim();
                    if !point.is_empty() {
                        points.push(point.to_string());
                    }
                }
            }
            Section::None => {}
        }
    }

    if summary.is_empty() && section != Section::Points {
        summary = response.trim().to_string();
    }
    (summary, points)
}

/// Keywords from a JSON array answer or a comma separated list.
pub fn parse_keywords(response: &str) -> Vec<String> {
    if let Ok(list) = serde_json::from_str::<Vec<String>>(response.trim()) {
        return list
            .into_iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
    }

    response
        .split([',', '，', '、', '\n'])
        .map(|k| k.trim().trim_matches(|c: char| c == '"' || c == '\'').trim().to_string())
        .filter(|k| !k.is_empty())
        .collect()
}

/// AI reading assistant.
#[derive(Clone)]
pub struct AiAssistant {
    db: Database,
    llm: Arc<dyn LlmBackend>,
}

impl AiAssistant {
    /// Create the assistant over an LLM backend.
    pub fn new(db: Database, llm: Arc<dyn LlmBackend>) -> Self {
        Self { db, llm }
    }

    fn owned_book(&self, user_id: &str, book_id: &str) -> Result<StoredBook> {
        self.db
            .get_user_book(user_id, book_id)?
            .ok_or_else(|| AppError::NotFound(format!("Book {}", book_id)))
    }

    /// Backend for a user: their active settings, else the server default.
    pub fn backend_for(&self, user_id: &str) -> Result<Arc<dyn LlmBackend>> {
        match self.db.get_user_ai_config(user_id)? {
            Some(config) if config.is_active => {
                Ok(Arc::new(HttpLlmBackend::new(&AiConfig::from(&config))?))
            }
            _ => Ok(self.llm.clone()),
        }
    }

    /// Call the backend and log the request whatever the outcome.
    async fn call(
        &self,
        user_id: &str,
        book_id: Option<&str>,
        kind: &str,
        input: &str,
        prompt: &Prompt,
    ) -> Result<Reply> {
        let llm = self.backend_for(user_id)?;
        let start = Instant::now();
        let result = llm.complete(prompt).await;
        let elapsed = start.elapsed().as_secs_f64();

        let mut log = AiRequestLog {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            book_id: book_id.map(String::from),
            kind: kind.to_string(),
            input: truncate(input, 1000),
            status: "completed".to_string(),
            error: None,
            response: None,
            processing_time: elapsed,
            tokens_used: 0,
            created_at: db::now_timestamp(),
        };

        match &result {
            Ok(completion) => {
                log.response = Some(completion.content.clone());
                log.tokens_used = completion.tokens_used;
            }
            Err(e) => {
                tracing::warn!(kind, user_id, model = llm.model(), error = %e, "AI request failed");
                log.status = "failed".to_string();
                log.error = Some(e.to_string());
            }
        }

        if let Err(e) = self.db.insert_ai_log(&log) {
            tracing::error!(error = %e, "Failed to record AI request");
        }

        result.map(|completion| Reply {
            completion,
            elapsed,
            model: llm.model().to_string(),
        })
    }

    fn question_context(&self, user_id: &str, book: &StoredBook, question: &Question) -> Result<String> {
        let mut parts = vec![format!("Title: {}", book.title)];
        if let Some(author) = &book.author {
            parts.push(format!("Author: {}", author));
        }

        match question.question_type.as_str() {
            "chapter" | "summary" => {
                if let Some(number) = question.chapter_number {
                    let chapter = self
                        .db
                        .get_chapter(&book.id, number)?
                        .ok_or_else(|| AppError::NotFound(format!("Chapter {} of book {}", number, book.id)))?;
                    parts.push(format!(
                        "Chapter {} content:\n{}",
                        number,
                        truncate(&chapter.content, CHAPTER_CONTEXT_CHARS)
                    ));
                }
            }
            "book" => {
                if let Some(summary) = &book.summary {
                    parts.push(format!("Book summary:\n{}", summary));
                }
            }
            _ => {}
        }

        if let Some(selected) = question.selected_text.as_deref().filter(|s| !s.trim().is_empty()) {
            parts.push(format!("Selected text:\n{}", selected));
        }

        let mut recent = self.db.list_qa(user_id, Some(&book.id), HISTORY_TURNS)?;
        if !recent.is_empty() {
            recent.reverse();
            parts.push("Recent conversation:".to_string());
            for entry in recent {
                parts.push(format!("Q: {}", truncate(&entry.question, 100)));
                parts.push(format!("A: {}", truncate(&entry.answer, 200)));
            }
        }

        Ok(parts.join("\n\n"))
    }

    /// Answer a question about one of the user's books and record it.
    pub async fn ask(&self, user_id: &str, book_id: &str, question: Question) -> Result<QaEntry> {
        if question.question.trim().is_empty() {
            return Err(AppError::InvalidFormat("Question is empty".into()));
        }
        if !QUESTION_TYPES.contains(&question.question_type.as_str()) {
            return Err(AppError::InvalidFormat(format!(
                "Unknown question type: {}",
                question.question_type
            )));
        }

        let book = self.owned_book(user_id, book_id)?;
        let context = self.question_context(user_id, &book, &question)?;

        let user_message = format!(
            "Context:\n{}\n\n{}\n\nQuestion: {}\n\nAnswer accurately, clearly and in \
             an organized way. If you cannot determine the answer, say so honestly.",
            context,
            question_instruction(&question.question_type),
            question.question
        );
        let prompt = Prompt::new(user_message).with_system(format!(
            "You are a reading assistant helping the user understand the book \"{}\".",
            book.title
        ));

        let reply = self
            .call(user_id, Some(&book.id), "question", &question.question, &prompt)
            .await?;

        let entry = QaEntry {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            book_id: book.id,
            question_type: question.question_type,
            question: question.question,
            selected_text: question.selected_text,
            chapter_number: question.chapter_number,
            answer: reply.completion.content,
            model: reply.model,
            processing_time: reply.elapsed,
            tokens_used: reply.completion.tokens_used,
            is_helpful: None,
            created_at: db::now_timestamp(),
        };
        self.db.insert_qa(&entry)?;
        Ok(entry)
    }

    /// Summary of a chapter, generated once per summary type.
    pub async fn summarize_chapter(
        &self,
        user_id: &str,
        book_id: &str,
        chapter_number: i64,
        summary_type: &str,
    ) -> Result<ChapterSummaryResult> {
        if !SUMMARY_TYPES.contains(&summary_type) {
            return Err(AppError::InvalidFormat(format!("Unknown summary type: {}", summary_type)));
        }

        let book = self.owned_book(user_id, book_id)?;
        if let Some(summary) = self.db.get_chapter_summary(&book.id, chapter_number, summary_type)? {
            return Ok(ChapterSummaryResult {
                summary,
                from_cache: true,
            });
        }

        let chapter = self
            .db
            .get_chapter(&book.id, chapter_number)?
            .ok_or_else(|| AppError::NotFound(format!("Chapter {} of book {}", chapter_number, book.id)))?;

        let user_message = format!(
            "{}\n\nChapter title: {}\n\nChapter text:\n{}\n\n\
             Answer in this format:\n\
             Summary: <chapter summary>\n\n\
             Key points:\n1. <point>\n2. <point>\n3. <point>",
            summary_instruction(summary_type),
            chapter.title,
            truncate(&chapter.content, BOOK_CONTENT_CHARS)
        );
        let prompt = Prompt::new(user_message)
            .with_system("You summarize book chapters accurately and concisely.");

        let input = format!("chapter {} ({})", chapter_number, summary_type);
        let reply = self
            .call(user_id, Some(&book.id), "chapter_summary", &input, &prompt)
            .await?;

        let (text, key_points) = parse_summary(&reply.completion.content);
        let content_chars = chapter.content.chars().count();
        let compression_ratio = if content_chars == 0 {
            0.0
        } else {
            text.chars().count() as f64 / content_chars as f64
        };

        let summary = ChapterSummary {
            book_id: book.id,
            chapter_number,
            summary_type: summary_type.to_string(),
            summary: text,
            key_points,
            compression_ratio,
            model: reply.model,
            created_at: db::now_timestamp(),
        };
        self.db.save_chapter_summary(&summary)?;

        Ok(ChapterSummaryResult {
            summary,
            from_cache: false,
        })
    }

    /// Opening chapters of a book, joined and truncated.
    fn book_excerpt(&self, book: &StoredBook) -> Result<String> {
        let chapters = self.db.first_chapters(&book.id, BOOK_SUMMARY_CHAPTERS)?;
        if chapters.is_empty() {
            return Err(AppError::InvalidFormat(format!("Book {} has no chapters", book.id)));
        }

        let joined = chapters
            .iter()
            .map(|c| format!("{}\n{}", c.title, c.content))
            .collect::<Vec<_>>()
            .join("\n\n");
        Ok(truncate(&joined, BOOK_CONTENT_CHARS))
    }

    /// Summarize a book from its opening chapters and store the summary.
    pub async fn summarize_book(&self, user_id: &str, book_id: &str) -> Result<String> {
        let book = self.owned_book(user_id, book_id)?;
        let excerpt = self.book_excerpt(&book)?;

        let user_message = format!(
            "Write a summary of the book \"{}\"{} from the opening chapters below. \
             Cover its main themes, key characters or concepts, its structure and its \
             central message, in 300 to 500 words.\n\n{}",
            book.title,
            book.author.as_deref().map(|a| format!(" by {}", a)).unwrap_or_default(),
            excerpt
        );
        let prompt = Prompt::new(user_message).with_system(
            "You are a text summarization assistant who extracts the core content of a \
             text and writes clear, concise summaries.",
        );

        let summary = self
            .call(user_id, Some(&book.id), "summary", &book.title, &prompt)
            .await?
            .completion
            .content;

        self.db.set_book_summary(&book.id, &summary)?;
        tracing::info!(book_id = %book.id, "Book summary stored");
        Ok(summary)
    }

    /// Extract keywords from the book summary (or its opening chapters).
    pub async fn extract_keywords(&self, user_id: &str, book_id: &str) -> Result<Vec<String>> {
        let book = self.owned_book(user_id, book_id)?;
        let source = match &book.summary {
            Some(summary) if !summary.trim().is_empty() => summary.clone(),
            _ => self.book_excerpt(&book)?,
        };

        let prompt = Prompt::new(format!(
            "Extract the 10 to 15 most important keywords of the following text. \
             Return them as a JSON array of strings.\n\n{}",
            source
        ))
        .with_system("You identify the core concepts and important terms of a text.")
        .with_temperature(0.3);

        let reply = self
            .call(user_id, Some(&book.id), "keywords", &book.title, &prompt)
            .await?;

        let keywords = parse_keywords(&reply.completion.content);
        self.db.set_book_keywords(&book.id, &keywords)?;
        Ok(keywords)
    }

    /// Analyze arbitrary text. Unknown types fall back to a general analysis.
    pub async fn analyze_text(&self, user_id: &str, text: &str, analysis_type: &str) -> Result<Analysis> {
        if text.trim().is_empty() {
            return Err(AppError::InvalidFormat("Text is empty".into()));
        }
        let analysis_type = if ANALYSIS_TYPES.contains(&analysis_type) {
            analysis_type
        } else {
            "general"
        };

        let prompt = Prompt::new(analysis_prompt(analysis_type, text))
            .with_system("You are a text analyst who examines writing from several angles.");
        let reply = self.call(user_id, None, "analysis", text, &prompt).await?;

        Ok(Analysis {
            analysis_type: analysis_type.to_string(),
            analysis: reply.completion.content,
            tokens_used: reply.completion.tokens_used,
            processing_time: reply.elapsed,
        })
    }

    /// Rate an answer as helpful or not.
    pub fn rate_answer(&self, user_id: &str, qa_id: &str, helpful: bool) -> Result<()> {
        if self.db.rate_qa(user_id, qa_id, helpful)? {
            Ok(())
        } else {
            Err(AppError::NotFound(format!("Answer {}", qa_id)))
        }
    }

    /// Latest questions, newest first.
    pub fn history(&self, user_id: &str, book_id: Option<&str>, limit: usize) -> Result<Vec<QaEntry>> {
        self.db.list_qa(user_id, book_id, limit)
    }

    /// Delete questions older than `older_than_days`; 0 deletes all.
    pub fn clear_history(&self, user_id: &str, older_than_days: u32) -> Result<usize> {
        let before = if older_than_days == 0 {
            i64::MAX
        } else {
            db::now_timestamp() - i64::from(older_than_days) * 86_400
        };
        self.db.delete_qa_before(user_id, before)
    }

    /// Send a trivial prompt to check the backend configuration.
    pub async fn test_backend(&self, user_id: &str) -> Result<BackendCheck> {
        let prompt = Prompt {
            system: None,
            messages: vec![ChatMessage::user("Reply with the single word OK.")],
            temperature: Some(0.0),
        };
        let reply = self.call(user_id, None, "test", "connectivity check", &prompt).await?;
        Ok(BackendCheck {
            model: reply.model,
            reply: reply.completion.content,
            processing_time: reply.elapsed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_summary_sections() {
        let response = "Summary: The hero leaves home.\nHe meets a guide.\n\n\
                        Key points:\n1. Departure\n2) The guide\n- A storm\nnot a point";
        let (summary, points) = parse_summary(response);
        assert_eq!(summary, "The hero leaves home. He meets a guide.");
        assert_eq!(points, vec!["Departure", "The guide", "A storm"]);
    }

    #[test]
    fn parses_chinese_markers() {
        let (summary, points) = parse_summary("总结：主角离开家乡。\n关键要点：\n1. 离开\n2. 相遇");
        assert_eq!(summary, "主角离开家乡。");
        assert_eq!(points, vec!["离开", "相遇"]);
    }

    #[test]
    fn unstructured_summary_is_used_whole() {
        let (summary, points) = parse_summary("  Just a plain answer.  ");
        assert_eq!(summary, "Just a plain answer.");
        assert!(points.is_empty());
    }

    #[test]
    fn keywords_from_json_or_list() {
        assert_eq!(parse_keywords(r#"["war", " peace "]"#), vec!["war", "peace"]);
        assert_eq!(parse_keywords("\"war\", peace，love"), vec!["war", "peace", "love"]);
    }

    #[test]
    fn truncates_on_char_boundary() {
        assert_eq!(truncate("héllo", 2), "hé...");
        assert_eq!(truncate("abc", 3), "abc");
    }
}

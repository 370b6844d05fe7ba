//! readify: an e-book reading server with an AI reading assistant.
//!
//! Users upload books, which are parsed into chapters and read through a
//! JSON API. Reading sessions and progress are tracked per user, notes and
//! highlights are stored alongside, and AI questions, summaries, speech and
//! translation are delegated to external backends with cached results.
//!
//! # Features
//!
//! - EPUB, PDF, MOBI, DOCX, TXT, HTML and Markdown import
//! - Chapter detection for English and Chinese headings
//! - Reading sessions, progress and statistics
//! - Notes, highlights and bookmarks with JSON and Markdown export
//! - Batch uploads processed in the background
//! - AI questions and summaries (OpenAI, Anthropic and Google APIs)
//! - Text-to-speech and translation with content-hash caches
//! - Per-user AI provider settings and voice preferences

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Authentication and user management.
pub mod auth;
/// Configuration and CLI.
pub mod config;
/// Database operations.
pub mod db;
/// Error types.
pub mod error;
/// Book format handlers.
pub mod formats;
/// Book storage, chapters and notes.
pub mod library;
/// Reading sessions, progress and statistics.
pub mod reading;
/// HTTP server.
pub mod server;
/// AI, speech and translation wrappers.
pub mod services;
/// Per-user AI settings and preferences.
pub mod settings;

#[cfg(test)]
mod tests;

pub use config::{Cli, Command, Config};
pub use db::Database;
pub use error::{AppError, Result};
pub use server::AppState;

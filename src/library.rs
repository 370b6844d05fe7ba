//! Uploaded books: storage, text extraction and chapter access.

pub mod book;
pub mod chapters;
pub mod notes;

use crate::config::{BookFormat, ReaderConfig, StorageConfig};
use crate::db::{self, BatchUpload, ChapterInfo, Database, StoredBook, StoredChapter};
use crate::error::{AppError, Result};
use crate::formats;
use book::title_from_filename;
use chapters::ChapterSplitter;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

/// A file received for import.
#[derive(Debug, Clone)]
pub struct UploadFile {
    /// Client file name; its extension selects the format.
    pub filename: String,
    /// File content.
    pub data: Vec<u8>,
}

/// Metadata supplied with an upload, overriding what the file declares.
#[derive(Debug, Clone, Default)]
pub struct BookOverrides {
    /// Title.
    pub title: Option<String>,
    /// Author.
    pub author: Option<String>,
    /// Description.
    pub description: Option<String>,
}

/// Outcome of a directory import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    /// Books whose text was extracted.
    pub imported: usize,
    /// Files that could not be stored or read.
    pub failed: usize,
}

/// Book storage service.
#[derive(Clone)]
pub struct Library {
    db: Database,
    storage: StorageConfig,
    splitter: ChapterSplitter,
}

/// Remove a stored book file; a file that is already gone is fine.
fn remove_book_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove book file");
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

impl Library {
    /// Create the service.
    pub fn new(db: Database, storage: StorageConfig, reader: &ReaderConfig) -> Self {
        Self {
            db,
            storage,
            splitter: ChapterSplitter::new(reader),
        }
    }

    /// Directory holding a user's files.
    fn user_dir(&self, user_id: &str) -> PathBuf {
        self.storage.books_dir.join(user_id)
    }

    /// Store a file, parse it into chapters and record the book.
    ///
    /// A file that cannot be parsed still yields a book row, with status
    /// `failed` and no chapters.
    pub fn upload(
        &self,
        user_id: &str,
        file: &UploadFile,
        overrides: &BookOverrides,
    ) -> Result<StoredBook> {
        let format = BookFormat::from_filename(&file.filename).ok_or_else(|| {
            AppError::InvalidFormat(format!("Unsupported file type: {}", file.filename))
        })?;

        if file.data.is_empty() {
            return Err(AppError::InvalidFormat("Uploaded file is empty".into()));
        }
        let limit = self.storage.max_upload_mb * 1024 * 1024;
        if file.data.len() > limit {
            return Err(AppError::InvalidFormat(format!(
                "File exceeds the {} MB upload limit",
                self.storage.max_upload_mb
            )));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let dir = self.user_dir(user_id);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.{}", id, format.as_str()));
        std::fs::write(&path, &file.data)?;

        let extracted = formats::get_handler(format).extract(&path);
        let metadata = extracted
            .as_ref()
            .map(|e| e.metadata.clone())
            .unwrap_or_default();

        let now = db::now_timestamp();
        let mut book = StoredBook {
            id,
            user_id: user_id.to_string(),
            title: non_blank(overrides.title.as_deref())
                .or(metadata.title.clone())
                .unwrap_or_else(|| title_from_filename(&file.filename)),
            author: non_blank(overrides.author.as_deref()).or_else(|| metadata.author()),
            description: non_blank(overrides.description.as_deref()).or(metadata.description),
            language: metadata.language,
            format: format.as_str().to_string(),
            path: path.to_string_lossy().to_string(),
            file_size: file.data.len() as i64,
            word_count: 0,
            chapter_count: 0,
            processing_status: "processing".to_string(),
            summary: None,
            keywords: Vec::new(),
            view_count: 0,
            last_read_at: None,
            uploaded_at: now,
            updated_at: now,
        };
        if let Err(e) = self.db.insert_book(&book) {
            remove_book_file(&path);
            return Err(e);
        }

        let chapters = match extracted {
            Ok(extracted) if extracted.text.is_blank() => {
                tracing::warn!(file = %file.filename, "Book contains no text");
                Vec::new()
            }
            Ok(extracted) => self.splitter.split_book(&extracted.text),
            Err(e) => {
                tracing::warn!(file = %file.filename, error = %e, "Failed to extract book text");
                Vec::new()
            }
        };

        if chapters.is_empty() {
            self.db.update_book_processing(&book.id, "failed", 0, 0)?;
            book.processing_status = "failed".to_string();
            return Ok(book);
        }

        let rows: Vec<(String, String, i64)> = chapters
            .into_iter()
            .map(|c| {
                let words = c.word_count();
                (c.title, c.content, words)
            })
            .collect();
        let word_count: i64 = rows.iter().map(|(_, _, w)| w).sum();
        let chapter_count = rows.len() as i64;

        let stored = self.db.replace_chapters(&book.id, &rows).and_then(|()| {
            self.db
                .update_book_processing(&book.id, "completed", word_count, chapter_count)
        });
        if let Err(e) = stored {
            tracing::warn!(book = %book.id, error = %e, "Failed to store chapters");
            remove_book_file(&path);
            self.db.delete_book(&book.id)?;
            return Err(e);
        }

        book.processing_status = "completed".to_string();
        book.word_count = word_count;
        book.chapter_count = chapter_count;

        tracing::info!(
            book = %book.id,
            title = %book.title,
            format = %book.format,
            chapters = chapter_count,
            words = word_count,
            "Book imported"
        );
        Ok(book)
    }

    /// Record a new batch; files are processed by [`Library::process_batch`].
    pub fn create_batch(&self, user_id: &str, name: Option<&str>, total: usize) -> Result<BatchUpload> {
        let batch = BatchUpload {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            name: non_blank(name).unwrap_or_else(|| {
                format!("batch_{}", chrono::Local::now().format("%Y%m%d_%H%M%S"))
            }),
            total_files: total as i64,
            processed_files: 0,
            successful_files: 0,
            failed_files: 0,
            status: "pending".to_string(),
            error_log: String::new(),
            created_at: db::now_timestamp(),
            completed_at: None,
        };
        self.db.save_batch(&batch)?;
        Ok(batch)
    }

    /// Import every file of a batch, saving counters after each one.
    pub fn process_batch(&self, mut batch: BatchUpload, files: Vec<UploadFile>) -> Result<BatchUpload> {
        batch.status = "processing".to_string();
        self.db.save_batch(&batch)?;

        for file in &files {
            match self.upload(&batch.user_id, file, &BookOverrides::default()) {
                Ok(book) if book.processing_status == "completed" => batch.successful_files += 1,
                Ok(_) => {
                    batch.failed_files += 1;
                    batch
                        .error_log
                        .push_str(&format!("{}: no readable text\n", file.filename));
                }
                Err(e) => {
                    batch.failed_files += 1;
                    batch.error_log.push_str(&format!("{}: {}\n", file.filename, e));
                }
            }
            batch.processed_files += 1;
            self.db.save_batch(&batch)?;
        }

        batch.status = if batch.failed_files == 0 {
            "completed"
        } else if batch.successful_files == 0 {
            "failed"
        } else {
            "partial"
        }
        .to_string();
        batch.completed_at = Some(db::now_timestamp());
        self.db.save_batch(&batch)?;

        tracing::info!(
            batch = %batch.id,
            succeeded = batch.successful_files,
            failed = batch.failed_files,
            "Batch upload finished"
        );
        Ok(batch)
    }

    /// Start processing a batch in the background (non-blocking).
    pub fn start_batch(&self, batch: BatchUpload, files: Vec<UploadFile>) {
        let library = self.clone();
        tokio::task::spawn_blocking(move || {
            let id = batch.id.clone();
            if let Err(e) = library.process_batch(batch, files) {
                tracing::error!(batch = %id, error = %e, "Batch upload failed");
            }
        });
    }

    /// Get one of the user's batches.
    pub fn get_batch(&self, user_id: &str, id: &str) -> Result<BatchUpload> {
        self.db
            .get_batch(user_id, id)?
            .ok_or_else(|| AppError::NotFound(format!("Batch {}", id)))
    }

    /// Import every supported file under `dir`, parsing with `workers` threads.
    pub fn import_dir(&self, user_id: &str, dir: &Path, workers: usize) -> Result<ImportSummary> {
        let files: Vec<PathBuf> = walkdir::WalkDir::new(dir)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .filter(|e| {
                e.file_name()
                    .to_str()
                    .and_then(BookFormat::from_filename)
                    .is_some()
            })
            .map(|e| e.path().to_path_buf())
            .collect();

        let total = files.len();
        tracing::info!(files = total, workers = workers, "Found files to import");
        if total == 0 {
            return Ok(ImportSummary::default());
        }

        let imported = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);
        let processed = AtomicUsize::new(0);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build thread pool: {}", e)))?;

        pool.install(|| {
            files.par_iter().for_each(|path| {
                let result = std::fs::read(path).map_err(AppError::from).and_then(|data| {
                    let filename = path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default();
                    self.upload(user_id, &UploadFile { filename, data }, &BookOverrides::default())
                });

                match result {
                    Ok(book) if book.processing_status == "completed" => {
                        imported.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(_) => {
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Import failed");
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                }

                let done = processed.fetch_add(1, Ordering::Relaxed) + 1;
                if done.is_multiple_of(50) || done == total {
                    tracing::info!("Importing... {}/{} ({}%)", done, total, done * 100 / total);
                }
            });
        });

        Ok(ImportSummary {
            imported: imported.load(Ordering::Relaxed),
            failed: failed.load(Ordering::Relaxed),
        })
    }

    /// The user's books, newest first.
    pub fn list_books(&self, user_id: &str, search: Option<&str>) -> Result<Vec<StoredBook>> {
        self.db.list_books(user_id, search)
    }

    /// One of the user's books.
    pub fn get_book(&self, user_id: &str, id: &str) -> Result<StoredBook> {
        self.db
            .get_user_book(user_id, id)?
            .ok_or_else(|| AppError::NotFound(format!("Book {}", id)))
    }

    /// Delete a book, its stored file and everything attached to it.
    pub fn delete_book(&self, user_id: &str, id: &str) -> Result<()> {
        let book = self.get_book(user_id, id)?;

        remove_book_file(Path::new(&book.path));
        self.db.delete_book(&book.id)?;
        tracing::info!(book = %book.id, title = %book.title, "Book deleted");
        Ok(())
    }

    /// Path and format of a book for download.
    pub fn book_file(&self, user_id: &str, id: &str) -> Result<(StoredBook, PathBuf, BookFormat)> {
        let book = self.get_book(user_id, id)?;
        let format = BookFormat::from_extension(&book.format)
            .ok_or_else(|| AppError::Internal(format!("Unknown stored format {}", book.format)))?;
        let path = PathBuf::from(&book.path);
        if !path.exists() {
            return Err(AppError::NotFound(format!("File of book {}", id)));
        }
        Ok((book, path, format))
    }

    /// Chapter list of one of the user's books.
    pub fn list_chapters(&self, user_id: &str, book_id: &str) -> Result<Vec<ChapterInfo>> {
        let book = self.get_book(user_id, book_id)?;
        self.db.list_chapters(&book.id)
    }

    /// One chapter of one of the user's books.
    pub fn get_chapter(&self, user_id: &str, book_id: &str, number: i64) -> Result<StoredChapter> {
        let book = self.get_book(user_id, book_id)?;
        self.db
            .get_chapter(&book.id, number)?
            .ok_or_else(|| AppError::NotFound(format!("Chapter {} of book {}", number, book_id)))
    }
}

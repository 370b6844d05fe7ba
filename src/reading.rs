//! Reading sessions, progress and statistics.

use crate::db::{self, Database, ReadingProgress, ReadingSession, StoredBook};
use crate::error::{AppError, Result};
use chrono::{Datelike, Days, Months, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

/// Human readable duration: `45s`, `12m`, `2h 5m`.
pub fn format_duration(seconds: i64) -> String {
    let seconds = seconds.max(0);
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m", seconds / 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

/// Words per minute, rounded to two decimals; 0 for an empty duration.
pub fn reading_speed(words: i64, seconds: i64) -> f64 {
    if seconds <= 0 {
        return 0.0;
    }
    let wpm = words as f64 / (seconds as f64 / 60.0);
    (wpm * 100.0).round() / 100.0
}

/// Statistics period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    /// One day.
    Daily,
    /// Monday to Sunday.
    Weekly,
    /// Calendar month.
    Monthly,
    /// Calendar year.
    Yearly,
}

impl Period {
    /// Parse a period name.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            "yearly" => Ok(Self::Yearly),
            other => Err(AppError::InvalidFormat(format!("Unknown period: {}", other))),
        }
    }

    /// First and last day (inclusive) of the period containing `date`.
    pub fn range(&self, date: NaiveDate) -> (NaiveDate, NaiveDate) {
        match self {
            Self::Daily => (date, date),
            Self::Weekly => {
                let offset = date.weekday().num_days_from_monday() as u64;
                let start = date.checked_sub_days(Days::new(offset)).unwrap_or(date);
                let end = start.checked_add_days(Days::new(6)).unwrap_or(start);
                (start, end)
            }
            Self::Monthly => {
                let start = date.with_day(1).unwrap_or(date);
                let end = start
                    .checked_add_months(Months::new(1))
                    .and_then(|d| d.pred_opt())
                    .unwrap_or(start);
                (start, end)
            }
            Self::Yearly => {
                let start = NaiveDate::from_ymd_opt(date.year(), 1, 1).unwrap_or(date);
                let end = NaiveDate::from_ymd_opt(date.year(), 12, 31).unwrap_or(date);
                (start, end)
            }
        }
    }
}

/// Result of closing a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    /// Session ID.
    pub session_id: String,
    /// Seconds between start and end.
    pub duration_seconds: i64,
    /// Words reported by the client.
    pub words_read: i64,
    /// Words per minute.
    pub reading_speed: f64,
    /// Duration for display.
    pub formatted_duration: String,
}

/// Progress reported by the reader.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressUpdate {
    /// Chapter being read.
    pub chapter: i64,
    /// Offset inside the chapter.
    #[serde(default)]
    pub position: i64,
    /// Overall percentage, clamped to 0-100.
    pub percentage: f64,
}

/// Reading statistics of one book.
#[derive(Debug, Clone, Serialize)]
pub struct BookStatistics {
    /// Book ID.
    pub book_id: String,
    /// Accumulated reading time.
    pub total_reading_seconds: i64,
    /// Reading time for display.
    pub formatted_time: String,
    /// Words read over closed sessions.
    pub total_words_read: i64,
    /// Closed sessions.
    pub session_count: i64,
    /// Words per minute over closed sessions.
    pub average_speed: f64,
    /// Chapter in progress.
    pub current_chapter: i64,
    /// Progress percentage.
    pub percentage: f64,
    /// Questions asked about the book.
    pub total_questions: i64,
    /// Answers rated helpful.
    pub helpful_answers: i64,
}

/// Reading time over a period.
#[derive(Debug, Clone, Serialize)]
pub struct PeriodStatistics {
    /// Period kind.
    pub period: Period,
    /// First day.
    pub start_date: NaiveDate,
    /// Last day (inclusive).
    pub end_date: NaiveDate,
    /// Seconds read.
    pub total_reading_time: i64,
    /// Distinct books read.
    pub books_read: i64,
    /// Closed sessions started in the period.
    pub sessions_count: i64,
    /// Mean session length in seconds.
    pub average_session_time: i64,
    /// Words read.
    pub total_words: i64,
    /// Total time for display.
    pub formatted_time: String,
}

fn day_start(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp()
}

/// Tracks reading sessions and progress.
#[derive(Clone)]
pub struct ReadingTracker {
    db: Database,
}

impl ReadingTracker {
    /// Create the tracker.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn owned_book(&self, user_id: &str, book_id: &str) -> Result<StoredBook> {
        self.db
            .get_user_book(user_id, book_id)?
            .ok_or_else(|| AppError::NotFound(format!("Book {}", book_id)))
    }

    /// Open a session, closing any open one on the same book.
    pub fn start_session(
        &self,
        user_id: &str,
        book_id: &str,
        chapter: Option<i64>,
    ) -> Result<ReadingSession> {
        self.start_session_at(user_id, book_id, chapter, db::now_timestamp())
    }

    /// [`ReadingTracker::start_session`] with an explicit clock.
    pub fn start_session_at(
        &self,
        user_id: &str,
        book_id: &str,
        chapter: Option<i64>,
        now: i64,
    ) -> Result<ReadingSession> {
        let book = self.owned_book(user_id, book_id)?;
        if let Some(number) = chapter
            && self.db.get_chapter(&book.id, number)?.is_none()
        {
            return Err(AppError::NotFound(format!(
                "Chapter {} of book {}",
                number, book_id
            )));
        }

        let session = ReadingSession {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            book_id: book.id,
            chapter_number: chapter,
            started_at: now,
            ended_at: None,
            duration_seconds: 0,
            words_read: 0,
            is_active: true,
        };

        let closed = self.db.begin_reading_session(&session)?;
        tracing::debug!(
            session = %session.id,
            book = %session.book_id,
            closed = closed,
            "Reading session started"
        );
        Ok(session)
    }

    /// Close one of the user's open sessions.
    pub fn end_session(&self, user_id: &str, session_id: &str, words_read: i64) -> Result<SessionSummary> {
        self.end_session_at(user_id, session_id, words_read, db::now_timestamp())
    }

    /// [`ReadingTracker::end_session`] with an explicit clock.
    pub fn end_session_at(
        &self,
        user_id: &str,
        session_id: &str,
        words_read: i64,
        now: i64,
    ) -> Result<SessionSummary> {
        let not_open = || AppError::NotFound(format!("No open reading session {}", session_id));

        let session = self
            .db
            .get_reading_session(session_id)?
            .filter(|s| s.user_id == user_id && s.is_active)
            .ok_or_else(not_open)?;

        let ended = self
            .db
            .end_reading_session(&session.id, now, words_read.max(0))?
            .ok_or_else(not_open)?;

        tracing::debug!(
            session = %ended.id,
            duration = ended.duration_seconds,
            words = ended.words_read,
            "Reading session ended"
        );

        Ok(SessionSummary {
            session_id: ended.id,
            duration_seconds: ended.duration_seconds,
            words_read: ended.words_read,
            reading_speed: reading_speed(ended.words_read, ended.duration_seconds),
            formatted_duration: format_duration(ended.duration_seconds),
        })
    }

    /// Current progress, or the start of the book when none was saved.
    pub fn get_progress(&self, user_id: &str, book_id: &str) -> Result<ReadingProgress> {
        let book = self.owned_book(user_id, book_id)?;
        Ok(self
            .db
            .get_progress(user_id, &book.id)?
            .unwrap_or_else(|| ReadingProgress {
                user_id: user_id.to_string(),
                book_id: book.id,
                current_chapter: 1,
                current_position: 0,
                percentage: 0.0,
                reading_seconds: 0,
                last_read_at: 0,
            }))
    }

    /// Store the reader's position.
    ///
    /// While a session is open the percentage only moves forward; without one
    /// the value is stored as given.
    pub fn save_progress(
        &self,
        user_id: &str,
        book_id: &str,
        update: &ProgressUpdate,
    ) -> Result<ReadingProgress> {
        let book = self.owned_book(user_id, book_id)?;
        if update.chapter < 1 {
            return Err(AppError::InvalidFormat("Chapter numbers start at 1".into()));
        }

        let percentage = if update.percentage.is_finite() {
            update.percentage.clamp(0.0, 100.0)
        } else {
            0.0
        };

        let progress = self.db.update_progress(
            user_id,
            &book.id,
            update.chapter,
            update.position.max(0),
            percentage,
        )?;
        Ok(progress)
    }

    /// Reading totals, progress and Q&A counts for one book.
    pub fn book_statistics(&self, user_id: &str, book_id: &str) -> Result<BookStatistics> {
        let progress = self.get_progress(user_id, book_id)?;
        let totals = self.db.book_session_totals(user_id, &progress.book_id)?;
        let (total_questions, helpful_answers) = self.db.qa_counts(user_id, &progress.book_id)?;

        Ok(BookStatistics {
            book_id: progress.book_id,
            total_reading_seconds: progress.reading_seconds,
            formatted_time: format_duration(progress.reading_seconds),
            total_words_read: totals.total_words,
            session_count: totals.session_count,
            average_speed: reading_speed(totals.total_words, totals.total_seconds),
            current_chapter: progress.current_chapter,
            percentage: progress.percentage,
            total_questions,
            helpful_answers,
        })
    }

    /// Totals over closed sessions started in the period containing `date`.
    pub fn period_statistics(
        &self,
        user_id: &str,
        period: Period,
        date: NaiveDate,
    ) -> Result<PeriodStatistics> {
        let (start_date, end_date) = period.range(date);
        let end_exclusive = end_date.succ_opt().map(day_start).unwrap_or(i64::MAX);
        let totals = self
            .db
            .session_totals_between(user_id, day_start(start_date), end_exclusive)?;

        let average_session_time = if totals.session_count > 0 {
            totals.total_seconds / totals.session_count
        } else {
            0
        };

        Ok(PeriodStatistics {
            period,
            start_date,
            end_date,
            total_reading_time: totals.total_seconds,
            books_read: totals.books_count,
            sessions_count: totals.session_count,
            average_session_time,
            total_words: totals.total_words,
            formatted_time: format_duration(totals.total_seconds),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn durations() {
        assert_eq!(format_duration(45), "45s");
        assert_eq!(format_duration(12 * 60 + 30), "12m");
        assert_eq!(format_duration(2 * 3600 + 5 * 60 + 9), "2h 5m");
        assert_eq!(format_duration(-3), "0s");
    }

    #[test]
    fn speed() {
        assert_eq!(reading_speed(300, 120), 150.0);
        assert_eq!(reading_speed(100, 0), 0.0);
        assert_eq!(reading_speed(10, 7), 85.71);
    }

    #[test]
    fn period_ranges() {
        // 2024-05-15 is a Wednesday.
        let wed = date(2024, 5, 15);
        assert_eq!(Period::Daily.range(wed), (wed, wed));
        assert_eq!(Period::Weekly.range(wed), (date(2024, 5, 13), date(2024, 5, 19)));
        assert_eq!(Period::Monthly.range(wed), (date(2024, 5, 1), date(2024, 5, 31)));
        assert_eq!(Period::Monthly.range(date(2024, 2, 10)).1, date(2024, 2, 29));
        assert_eq!(Period::Monthly.range(date(2023, 12, 3)).1, date(2023, 12, 31));
        assert_eq!(Period::Yearly.range(wed), (date(2024, 1, 1), date(2024, 12, 31)));
        assert_eq!(Period::Weekly.range(date(2024, 5, 13)).0, date(2024, 5, 13));
    }

    #[test]
    fn period_names() {
        assert_eq!(Period::parse("weekly").unwrap(), Period::Weekly);
        assert!(Period::parse("hourly").is_err());
    }
}

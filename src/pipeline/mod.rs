//! Pipeline stages and their shared plumbing
//!
//! Each stage reads prior artifacts from the store, fans out LLM calls via
//! `parallel_map`, and persists its results before the next stage begins.
//! Stage progress maps into a pre-assigned band of the book's 0–100 range so
//! a poller always observes monotone progress.

mod chapters;
mod claims;
pub mod prompts;

pub use chapters::run_chapters_pipeline;
pub use claims::run_claims_pipeline;

use crate::llm::{LlmError, StructuredClient};
use crate::model::{BookId, BookStatus};
use crate::store::{DocumentStore, StoreError};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors surfaced by pipeline stages.
///
/// Per-item LLM failures never reach this level; they are recorded and
/// skipped inside the stage. These are the stage-fatal conditions.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A required precondition yields no data. Fatal: the orchestrator marks
    /// the book failed with this message.
    #[error("{0}")]
    Empty(String),

    /// The book record disappeared mid-run (concurrent delete). Fatal but
    /// silent: the orchestrator logs and exits without touching the record.
    #[error("book record vanished mid-run")]
    BookVanished,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Llm(#[from] LlmError),
}

/// Progress band within the book's 0–100 range.
pub type Band = (u8, u8);

pub(crate) const BAND_EXTRACT_CLAIMS: Band = (5, 20);
pub(crate) const BAND_FILTER_CLAIMS: Band = (20, 40);
pub(crate) const BAND_CLUSTER_IDEAS: Band = (40, 70);
pub(crate) const BAND_RECONSTRUCT: Band = (70, 100);
pub(crate) const BAND_COMPRESS_CHAPTERS: Band = (5, 70);
pub(crate) const BAND_ASSEMBLE: Band = (75, 95);

/// Per-stage fan-out widths. Defaults follow the shipped configuration;
/// stricter rate limits lower them through `Config`.
#[derive(Debug, Clone)]
pub struct StageConcurrency {
    pub chunks: usize,
    pub filter_batches: usize,
    pub chapters: usize,
}

impl Default for StageConcurrency {
    fn default() -> Self {
        Self {
            chunks: 5,
            filter_batches: 5,
            chapters: 3,
        }
    }
}

/// Everything a stage needs: the store, the structured client, the book id,
/// and the progress reporter.
#[derive(Clone)]
pub struct StageContext {
    pub store: Arc<dyn DocumentStore>,
    pub llm: StructuredClient,
    pub book_id: BookId,
    pub concurrency: StageConcurrency,
    pub reporter: Arc<ProgressReporter>,
}

/// Writes status, step, and progress checkpoints on the book record.
///
/// Progress is clamped monotone: a later write never lowers the stored
/// value. Every write is check-and-write — when the book row is gone the
/// reporter flips its `vanished` flag instead of erroring, and the pipeline
/// exits silently at the next stage boundary.
pub struct ProgressReporter {
    store: Arc<dyn DocumentStore>,
    book_id: BookId,
    last_progress: AtomicU8,
    vanished: AtomicBool,
}

impl ProgressReporter {
    pub fn new(store: Arc<dyn DocumentStore>, book_id: BookId) -> Self {
        Self {
            store,
            book_id,
            last_progress: AtomicU8::new(0),
            vanished: AtomicBool::new(false),
        }
    }

    /// True once a write observed the book missing.
    pub fn book_vanished(&self) -> bool {
        self.vanished.load(Ordering::Acquire)
    }

    /// Enter a stage: set status, derive the human step phrase, jump progress
    /// to the band floor.
    pub fn enter_stage(&self, status: BookStatus, band: Band) -> Result<(), PipelineError> {
        self.write(|book| {
            book.status = status;
            book.current_step = Some(status.step_phrase());
        });
        self.set_progress(band.0);
        self.ensure_alive()
    }

    /// Override the human-readable step without changing status.
    pub fn set_step(&self, step: &str) {
        self.write(|book| {
            book.current_step = Some(step.to_string());
        });
    }

    /// Map stage-internal completion onto the band and persist it.
    pub fn report_within(&self, band: Band, completed: usize, total: usize) {
        if total == 0 {
            return;
        }
        let span = (band.1 - band.0) as usize;
        let progress = band.0 + (span * completed.min(total) / total) as u8;
        self.set_progress(progress);
    }

    /// Fail the stage immediately when the book is gone.
    pub fn ensure_alive(&self) -> Result<(), PipelineError> {
        if self.book_vanished() {
            Err(PipelineError::BookVanished)
        } else {
            Ok(())
        }
    }

    fn set_progress(&self, progress: u8) {
        let last = self.last_progress.load(Ordering::Acquire);
        if progress <= last {
            return;
        }
        self.last_progress.store(progress, Ordering::Release);
        self.write(|book| {
            if book.progress < progress {
                book.progress = progress;
            }
        });
    }

    fn write(&self, mutate: impl FnOnce(&mut crate::model::Book)) {
        if self.book_vanished() {
            return;
        }
        match self.store.get_book(&self.book_id) {
            Ok(Some(mut book)) => {
                mutate(&mut book);
                match self.store.update_book(&book) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(book = %self.book_id, "book deleted mid-run, stopping writes");
                        self.vanished.store(true, Ordering::Release);
                    }
                    Err(e) => warn!(book = %self.book_id, error = %e, "progress write failed"),
                }
            }
            Ok(None) => {
                debug!(book = %self.book_id, "book deleted mid-run, stopping writes");
                self.vanished.store(true, Ordering::Release);
            }
            Err(e) => warn!(book = %self.book_id, error = %e, "progress read failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Book, PipelineVariant, User};
    use crate::store::{OpenStore, SqliteStore};

    fn setup() -> (Arc<dyn DocumentStore>, Book) {
        let store: Arc<dyn DocumentStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let user = User::new("r@example.com", "R");
        store.insert_user(&user).unwrap();
        let book = Book::new(user.id.clone(), "T", "t.pdf", PipelineVariant::Claims);
        store.insert_book(&book).unwrap();
        (store, book)
    }

    #[test]
    fn enter_stage_sets_status_step_and_band_floor() {
        let (store, book) = setup();
        let reporter = ProgressReporter::new(store.clone(), book.id.clone());
        reporter
            .enter_stage(BookStatus::ExtractingClaims, BAND_EXTRACT_CLAIMS)
            .unwrap();

        let loaded = store.get_book(&book.id).unwrap().unwrap();
        assert_eq!(loaded.status, BookStatus::ExtractingClaims);
        assert_eq!(loaded.current_step.as_deref(), Some("extracting claims"));
        assert_eq!(loaded.progress, 5);
    }

    #[test]
    fn progress_is_monotone_within_band() {
        let (store, book) = setup();
        let reporter = ProgressReporter::new(store.clone(), book.id.clone());
        reporter
            .enter_stage(BookStatus::FilteringClaims, BAND_FILTER_CLAIMS)
            .unwrap();

        reporter.report_within(BAND_FILTER_CLAIMS, 5, 10);
        let mid = store.get_book(&book.id).unwrap().unwrap().progress;
        assert_eq!(mid, 30);

        // A stale lower report does not move progress backwards.
        reporter.report_within(BAND_FILTER_CLAIMS, 2, 10);
        assert_eq!(store.get_book(&book.id).unwrap().unwrap().progress, 30);

        reporter.report_within(BAND_FILTER_CLAIMS, 10, 10);
        assert_eq!(store.get_book(&book.id).unwrap().unwrap().progress, 40);
    }

    #[test]
    fn vanished_book_flips_flag_instead_of_failing() {
        let (store, book) = setup();
        let reporter = ProgressReporter::new(store.clone(), book.id.clone());
        store.delete_book(&book.id).unwrap();

        reporter.report_within(BAND_FILTER_CLAIMS, 1, 2);
        assert!(reporter.book_vanished());
        assert!(matches!(
            reporter.ensure_alive(),
            Err(PipelineError::BookVanished)
        ));
    }
}

//! Job orchestrator
//!
//! Owns the book's status state machine. A trigger is accepted only from
//! `uploaded` or `failed`; the pipeline then runs in a detached task, so the
//! caller returns immediately and client disconnects never cancel work. Any
//! stage error lands the book in `failed` with the message captured; a book
//! deleted mid-run is left untouched.

use crate::llm::StructuredClient;
use crate::model::{BookId, BookStatus, PipelineVariant};
use crate::pipeline::{
    run_chapters_pipeline, run_claims_pipeline, PipelineError, ProgressReporter, StageConcurrency,
    StageContext,
};
use crate::store::{DocumentStore, StoreError};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Errors from the trigger path. The transport layer maps `NotFound` to 404
/// and `AlreadyProcessing` to 400.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("book not found")]
    NotFound,

    #[error("book is already being processed")]
    AlreadyProcessing,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Drives pipelines to completion, one detached task per book.
pub struct JobRunner {
    store: Arc<dyn DocumentStore>,
    llm: StructuredClient,
    concurrency: StageConcurrency,
    /// Books with an in-flight job. Guards against re-triggering a book
    /// whose previous run has not finished writing yet.
    active: DashMap<BookId, ()>,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        llm: StructuredClient,
        concurrency: StageConcurrency,
    ) -> Self {
        Self {
            store,
            llm,
            concurrency,
            active: DashMap::new(),
        }
    }

    /// Trigger processing. Accepted iff the book is `uploaded` or `failed`
    /// and no job is in flight; returns immediately, the pipeline runs
    /// detached.
    pub fn trigger(self: &Arc<Self>, book_id: &BookId) -> Result<(), TriggerError> {
        let mut book = self
            .store
            .get_book(book_id)?
            .ok_or(TriggerError::NotFound)?;

        if !matches!(book.status, BookStatus::Uploaded | BookStatus::Failed) {
            return Err(TriggerError::AlreadyProcessing);
        }
        if self.active.insert(book_id.clone(), ()).is_some() {
            return Err(TriggerError::AlreadyProcessing);
        }

        // Fresh run: clear the previous outcome, restart the progress clock.
        // Status returns to `uploaded` so a poller between trigger and the
        // first stage never sees a stale terminal state.
        book.status = BookStatus::Uploaded;
        book.current_step = None;
        book.processing_started_at = Some(Utc::now());
        book.processing_completed_at = None;
        book.error = None;
        book.progress = 0;
        let updated = match self.store.update_book(&book) {
            Ok(updated) => updated,
            Err(e) => {
                self.active.remove(book_id);
                return Err(e.into());
            }
        };
        if !updated {
            self.active.remove(book_id);
            return Err(TriggerError::NotFound);
        }

        let runner = Arc::clone(self);
        let book_id = book_id.clone();
        let variant = book.variant;
        tokio::spawn(async move {
            runner.run(book_id.clone(), variant).await;
            runner.active.remove(&book_id);
        });
        Ok(())
    }

    /// True while a job for the book is in flight.
    pub fn is_active(&self, book_id: &BookId) -> bool {
        self.active.contains_key(book_id)
    }

    async fn run(&self, book_id: BookId, variant: PipelineVariant) {
        info!(book = %book_id, variant = variant.as_str(), "pipeline started");
        let ctx = StageContext {
            store: self.store.clone(),
            llm: self.llm.clone(),
            book_id: book_id.clone(),
            concurrency: self.concurrency.clone(),
            reporter: Arc::new(ProgressReporter::new(self.store.clone(), book_id.clone())),
        };

        let result = match variant {
            PipelineVariant::Claims => run_claims_pipeline(&ctx).await,
            PipelineVariant::Chapters => run_chapters_pipeline(&ctx).await,
        };

        match result {
            Ok(()) => self.finish(&book_id, None),
            Err(PipelineError::BookVanished) => {
                info!(book = %book_id, "book deleted mid-run, exiting quietly");
            }
            Err(e) => {
                error!(book = %book_id, error = %e, "pipeline failed");
                self.finish(&book_id, Some(e.to_string()));
            }
        }
    }

    /// Terminal write: `completed` with progress 100, or `failed` with the
    /// captured message. A missing row means a concurrent delete won; leave
    /// no trace.
    fn finish(&self, book_id: &BookId, failure: Option<String>) {
        let book = match self.store.get_book(book_id) {
            Ok(Some(book)) => book,
            Ok(None) => {
                info!(book = %book_id, "book deleted before terminal write");
                return;
            }
            Err(e) => {
                warn!(book = %book_id, error = %e, "terminal read failed");
                return;
            }
        };

        let mut book = book;
        match failure {
            None => {
                book.status = BookStatus::Completed;
                book.progress = 100;
                book.current_step = Some(BookStatus::Completed.step_phrase());
                book.error = None;
            }
            Some(message) => {
                book.status = BookStatus::Failed;
                book.current_step = Some(BookStatus::Failed.step_phrase());
                book.error = Some(message);
            }
        }
        book.processing_completed_at = Some(Utc::now());

        match self.store.update_book(&book) {
            Ok(true) => info!(book = %book_id, status = book.status.as_str(), "pipeline finished"),
            Ok(false) => info!(book = %book_id, "book deleted before terminal write"),
            Err(e) => warn!(book = %book_id, error = %e, "terminal write failed"),
        }
    }
}

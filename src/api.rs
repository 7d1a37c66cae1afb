//! Transport-independent API layer.
//!
//! `AlembicApi` is the single entry point for all consumer-facing
//! operations. Transports (REST, SSE, direct embedding) call these methods —
//! they never reach into the `Ingestor`, `JobRunner`, or store directly.

use std::sync::Arc;

use crate::config::Config;
use crate::ingest::{IngestError, Ingestor, ParsedDocument};
use crate::job::{JobRunner, TriggerError};
use crate::llm::{ChatClient, HttpChatClient, StructuredClient};
use crate::model::{Book, BookId, BookStatus, FinalOutput, PipelineVariant, RecordId, User};
use crate::progress::{ProgressSender, UploadEvent};
use crate::store::{DocumentStore, StoreError};

/// Single entry point for all consumer-facing operations.
#[derive(Clone)]
pub struct AlembicApi {
    store: Arc<dyn DocumentStore>,
    ingestor: Arc<Ingestor>,
    jobs: Arc<JobRunner>,
}

impl AlembicApi {
    /// Wire the API from its parts. Most callers use [`AlembicApi::from_config`].
    pub fn new(store: Arc<dyn DocumentStore>, llm: StructuredClient, config: &Config) -> Self {
        let ingestor = Arc::new(Ingestor::new(store.clone(), llm.clone()));
        let jobs = Arc::new(JobRunner::new(
            store.clone(),
            llm,
            config.concurrency.clone(),
        ));
        Self {
            store,
            ingestor,
            jobs,
        }
    }

    /// Wire the API against the configured HTTP chat endpoint and store.
    pub fn from_config(store: Arc<dyn DocumentStore>, config: &Config) -> Self {
        let client: Arc<dyn ChatClient> = Arc::new(HttpChatClient::new(
            config.api_base_url.clone(),
            config.api_key.clone(),
        ));
        let llm = StructuredClient::new(client, config.models.clone());
        Self::new(store, llm, config)
    }

    // --- Upload ---

    /// Run upload preprocessing for a parsed document, streaming progress
    /// events and ending the stream with a terminal result event. Returns
    /// the created book on success.
    pub async fn upload(
        &self,
        user_id: &RecordId,
        document: ParsedDocument,
        variant: PipelineVariant,
        progress: &ProgressSender,
    ) -> Result<Book, IngestError> {
        match self
            .ingestor
            .preprocess(user_id, document, variant, progress)
            .await
        {
            Ok(book) => {
                progress.send(UploadEvent::result(serde_json::json!({
                    "book_id": book.id,
                    "title": book.title,
                    "total_chunks": book.total_chunks,
                    "total_chapters": book.total_chapters,
                })));
                Ok(book)
            }
            Err(e) => {
                progress.send(UploadEvent::failure(e.to_string()));
                Err(e)
            }
        }
    }

    // --- Processing ---

    /// Trigger the book's pipeline. Returns immediately; progress is polled
    /// through [`AlembicApi::get_book`].
    pub fn process(&self, book_id: &BookId) -> Result<(), TriggerError> {
        self.jobs.trigger(book_id)
    }

    // --- Reads ---

    /// Fetch a book record (polling endpoint).
    pub fn get_book(&self, book_id: &BookId) -> Result<Option<Book>, StoreError> {
        self.store.get_book(book_id)
    }

    /// Fetch the final output. None until the book is `completed` — the
    /// transport maps that to 404.
    pub fn get_output(&self, book_id: &BookId) -> Result<Option<FinalOutput>, StoreError> {
        match self.store.get_book(book_id)? {
            Some(book) if book.status == BookStatus::Completed => {
                self.store.get_final_output(book_id)
            }
            _ => Ok(None),
        }
    }

    /// List a user's books, newest first.
    pub fn list_books(&self, user_id: &RecordId) -> Result<Vec<Book>, StoreError> {
        self.store.list_books_for_user(user_id)
    }

    // --- Mutations ---

    /// Delete a book and every child record. The only cancellation signal a
    /// running job observes.
    pub fn delete_book(&self, book_id: &BookId) -> Result<bool, StoreError> {
        self.store.delete_book(book_id)
    }

    // --- Users ---

    /// Create a user record. Credential handling lives outside this crate.
    pub fn create_user(
        &self,
        email: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Result<User, StoreError> {
        let user = User::new(email, display_name);
        self.store.insert_user(&user)?;
        Ok(user)
    }

    /// Find a user by email.
    pub fn find_user(&self, email: &str) -> Result<Option<User>, StoreError> {
        self.store.find_user_by_email(email)
    }
}

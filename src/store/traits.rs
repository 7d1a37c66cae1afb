//! Document store trait definitions
//!
//! The store is the single shared mutable resource of the system: a mapping
//! from entity id to typed record. Each pipeline stage is the sole writer for
//! its record class during its window; the Book record is written by the
//! orchestrator only.

use crate::model::{
    Book, BookId, Chapter, Chunk, Claim, ClaimLabel, FinalOutput, Idea, RecordId, User,
};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Date parsing error: {0}")]
    DateParse(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Trait for document store backends
///
/// Implementations must be thread-safe (Send + Sync): multiple detached
/// pipeline jobs read and write concurrently.
///
/// Update operations return `false` when no row was affected. Callers use
/// this to detect a book that was deleted mid-run and exit without writing
/// further (delete is the only cross-cutting cancellation signal).
pub trait DocumentStore: Send + Sync {
    // === Users ===

    /// Insert a user. Email is unique.
    fn insert_user(&self, user: &User) -> StoreResult<()>;

    /// Load a user by id.
    fn get_user(&self, id: &RecordId) -> StoreResult<Option<User>>;

    /// Load a user by email.
    fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>>;

    // === Books ===

    /// Insert a book record.
    fn insert_book(&self, book: &Book) -> StoreResult<()>;

    /// Load a book by id.
    fn get_book(&self, id: &BookId) -> StoreResult<Option<Book>>;

    /// List a user's books, newest first.
    fn list_books_for_user(&self, user_id: &RecordId) -> StoreResult<Vec<Book>>;

    /// Full-record update. Returns false if the book no longer exists.
    fn update_book(&self, book: &Book) -> StoreResult<bool>;

    /// Delete a book and cascade to all child records. Returns false if the
    /// book did not exist.
    fn delete_book(&self, id: &BookId) -> StoreResult<bool>;

    // === Chunks ===

    /// Bulk-insert chunks (appended once by preprocessing).
    fn insert_chunks(&self, chunks: &[Chunk]) -> StoreResult<()>;

    /// List chunks for a book ordered by their order index.
    fn list_chunks(&self, book_id: &BookId) -> StoreResult<Vec<Chunk>>;

    // === Chapters ===

    /// Bulk-insert chapters (appended once by preprocessing).
    fn insert_chapters(&self, chapters: &[Chapter]) -> StoreResult<()>;

    /// List chapters for a book ordered by their order index.
    fn list_chapters(&self, book_id: &BookId) -> StoreResult<Vec<Chapter>>;

    /// Write a chapter's compression results in place.
    fn update_chapter_compression(
        &self,
        id: &RecordId,
        compressed_content: &str,
        key_insights: &[String],
        compressed_token_count: u32,
    ) -> StoreResult<bool>;

    // === Claims ===

    /// Bulk-insert claims (single insert after the extraction stage).
    fn insert_claims(&self, claims: &[Claim]) -> StoreResult<()>;

    /// Count all claims for a book (any label state).
    fn count_claims(&self, book_id: &BookId) -> StoreResult<u64>;

    /// Claims not yet labeled by the filtering stage.
    fn list_unlabeled_claims(&self, book_id: &BookId) -> StoreResult<Vec<Claim>>;

    /// Kept claims (core or supporting insight), sorted by score descending.
    fn list_kept_claims(&self, book_id: &BookId) -> StoreResult<Vec<Claim>>;

    /// Write a claim's filter evaluation in place.
    fn update_claim_evaluation(
        &self,
        id: &RecordId,
        label: ClaimLabel,
        score: f64,
        reason: &str,
    ) -> StoreResult<bool>;

    // === Ideas ===

    /// Delete all ideas for a book. Returns the number deleted.
    fn delete_ideas(&self, book_id: &BookId) -> StoreResult<u64>;

    /// Bulk-insert ideas.
    fn insert_ideas(&self, ideas: &[Idea]) -> StoreResult<()>;

    /// List ideas for a book ordered by their order index.
    fn list_ideas(&self, book_id: &BookId) -> StoreResult<Vec<Idea>>;

    // === Final output ===

    /// Insert or replace the single final output for a book.
    fn upsert_final_output(&self, output: &FinalOutput) -> StoreResult<()>;

    /// Load the final output, if the book has one.
    fn get_final_output(&self, book_id: &BookId) -> StoreResult<Option<FinalOutput>>;
}

/// Extension trait for opening stores from paths
pub trait OpenStore: DocumentStore + Sized {
    /// Open or create a store at the given path
    fn open(path: impl AsRef<Path>) -> StoreResult<Self>;

    /// Create an in-memory store (useful for testing)
    fn open_in_memory() -> StoreResult<Self>;
}

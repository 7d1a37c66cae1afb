//! Shared harness for pipeline end-to-end tests
//!
//! Builds in-memory stores seeded with books and children, and structured
//! clients over the scripted mock chat client, so full pipeline runs are
//! deterministic and offline.

use alembic::{
    Book, BookId, BookStatus, Chapter, Chunk, DocumentStore, JobRunner, MockChatClient, OpenStore,
    PipelineVariant, RecordId, SqliteStore, StageConcurrency, StructuredClient, TierModels, User,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub fn memory_store() -> Arc<dyn DocumentStore> {
    Arc::new(SqliteStore::open_in_memory().expect("in-memory store"))
}

pub fn runner(store: Arc<dyn DocumentStore>, mock: MockChatClient) -> Arc<JobRunner> {
    runner_with_client(store, Arc::new(mock))
}

/// Like [`runner`], but keeps the caller's handle on the mock so tests can
/// assert call counts afterwards.
pub fn runner_with_client(
    store: Arc<dyn DocumentStore>,
    client: Arc<MockChatClient>,
) -> Arc<JobRunner> {
    let llm = StructuredClient::new(client, TierModels::default());
    Arc::new(JobRunner::new(store, llm, StageConcurrency::default()))
}

pub fn seed_user(store: &Arc<dyn DocumentStore>) -> RecordId {
    let user = User::new("reader@example.com", "Reader");
    store.insert_user(&user).expect("insert user");
    user.id
}

/// A claims-variant book with one chunk per text, original word count 100.
pub fn seed_claims_book(store: &Arc<dyn DocumentStore>, chunk_texts: &[&str]) -> Book {
    let user_id = seed_user(store);
    let mut book = Book::new(user_id, "Deep Work", "deep-work.pdf", PipelineVariant::Claims);
    book.original_word_count = Some(100);
    book.total_chunks = Some(chunk_texts.len() as u32);
    store.insert_book(&book).expect("insert book");

    let chunks: Vec<Chunk> = chunk_texts
        .iter()
        .enumerate()
        .map(|(i, text)| Chunk::new(book.id.clone(), i as u32, *text, 10))
        .collect();
    store.insert_chunks(&chunks).expect("insert chunks");
    book
}

/// A chapters-variant book with one chapter per (title, content) pair.
pub fn seed_chapters_book(store: &Arc<dyn DocumentStore>, chapters: &[(&str, &str)]) -> Book {
    let user_id = seed_user(store);
    let mut book = Book::new(user_id, "Deep Work", "deep-work.pdf", PipelineVariant::Chapters);
    book.original_word_count = Some(100);
    book.total_chapters = Some(chapters.len() as u32);
    book.recommended_compression = Some(0.35);
    store.insert_book(&book).expect("insert book");

    let records: Vec<Chapter> = chapters
        .iter()
        .enumerate()
        .map(|(i, (title, content))| {
            Chapter::new(
                book.id.clone(),
                i as u32,
                *title,
                1,
                *content,
                alembic::segment::estimate_tokens(content),
            )
        })
        .collect();
    store.insert_chapters(&records).expect("insert chapters");
    book
}

/// Poll until the book reaches a terminal status, recording every observed
/// (status, progress) sample along the way.
pub async fn wait_terminal(
    store: &Arc<dyn DocumentStore>,
    book_id: &BookId,
) -> (Book, Vec<(BookStatus, u8)>) {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut samples: Vec<(BookStatus, u8)> = Vec::new();
    loop {
        let book = store
            .get_book(book_id)
            .expect("poll read")
            .expect("book exists while polling");
        if samples.last() != Some(&(book.status, book.progress)) {
            samples.push((book.status, book.progress));
        }
        if book.status.is_terminal() {
            return (book, samples);
        }
        assert!(Instant::now() < deadline, "pipeline did not finish in time");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Assert a polled sample sequence is monotone: status ranks never decrease,
/// and progress never decreases within one status.
pub fn assert_monotone(samples: &[(BookStatus, u8)]) {
    for pair in samples.windows(2) {
        let (prev_status, prev_progress) = pair[0];
        let (next_status, next_progress) = pair[1];
        assert!(
            next_status.rank() >= prev_status.rank(),
            "status went backwards: {:?} -> {:?}",
            prev_status,
            next_status
        );
        if next_status == prev_status {
            assert!(
                next_progress >= prev_progress,
                "progress went backwards within {:?}: {} -> {}",
                prev_status,
                prev_progress,
                next_progress
            );
        }
    }
}

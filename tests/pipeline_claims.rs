//! End-to-end scenarios for the claims pipeline
//!
//! Full runs over an in-memory store with scripted LLM replies: the tiny
//! happy path, empty-claims failure, per-item isolation, progress
//! monotonicity under polling, and restart-after-failure idempotency.

mod common;

use alembic::{BookStatus, MockChatClient};
use common::*;
use std::sync::Arc;

const EXTRACTION_REPLY: &str = r#"{"claims": [{"claim": "a", "type": "principle"}]}"#;
const FILTER_REPLY: &str =
    r#"{"evaluations": [{"claim": "a", "label": "core_insight", "score": 0.9, "reason": "r"}]}"#;
const CLUSTER_REPLY: &str =
    r#"{"ideas": [{"idea_title": "T", "merged_claims": ["a"], "summary": "s"}]}"#;
const EXPAND_REPLY: &str = r#"{"principle": "P", "behavior_delta": "D"}"#;
const RECONSTRUCT_REPLY: &str = "# X\nA reconstructed document body.";

fn happy_path_mock() -> MockChatClient {
    MockChatClient::new()
        .reply("atomic claim", EXTRACTION_REPLY)
        .reply("Evaluate each claim", FILTER_REPLY)
        .reply("Cluster these claims", CLUSTER_REPLY)
        .reply("behavior delta:", EXPAND_REPLY)
        .reply("Reconstruct", RECONSTRUCT_REPLY)
}

// === Scenario: Tiny claims run ends completed with one idea ===
#[tokio::test]
async fn tiny_claims_run() {
    let store = memory_store();
    let book = seed_claims_book(&store, &["Paragraph A.\n\nParagraph B."]);
    let runner = runner(store.clone(), happy_path_mock());

    runner.trigger(&book.id).unwrap();
    let (done, samples) = wait_terminal(&store, &book.id).await;

    assert_eq!(done.status, BookStatus::Completed);
    assert_eq!(done.progress, 100);
    assert!(done.error.is_none());
    assert!(done.processing_started_at.is_some());
    assert!(done.processing_completed_at.is_some());
    assert_monotone(&samples);

    let output = store.get_final_output(&book.id).unwrap().unwrap();
    assert_eq!(output.unit_count, 1);
    assert_eq!(output.markdown, RECONSTRUCT_REPLY);
    assert!(output.compression_ratio.is_some());

    let ideas = store.list_ideas(&book.id).unwrap();
    assert_eq!(ideas.len(), 1);
    assert_eq!(ideas[0].title, "T");
    assert_eq!(ideas[0].principle.as_deref(), Some("P"));
    assert_eq!(ideas[0].behavior_delta.as_deref(), Some("D"));
}

// === Scenario: No valuable claims fails the book with a readable reason ===
#[tokio::test]
async fn empty_claims_marks_book_failed() {
    let store = memory_store();
    let book = seed_claims_book(&store, &["Some anecdotal filler text."]);
    // Extraction finds nothing; filtering then has nothing; clustering fails.
    let mock = MockChatClient::new().reply("atomic claim", r#"{"claims": []}"#);
    let runner = runner(store.clone(), mock);

    runner.trigger(&book.id).unwrap();
    let (done, _) = wait_terminal(&store, &book.id).await;

    assert_eq!(done.status, BookStatus::Failed);
    assert!(done.error.unwrap().contains("No valuable claims"));
    assert!(done.processing_completed_at.is_some());
}

// === Scenario: One chunk's transport error is isolated ===
#[tokio::test]
async fn per_item_isolation_persists_other_chunks() {
    let store = memory_store();
    let texts: Vec<String> = (0..10)
        .map(|i| {
            if i == 7 {
                format!("chunk {} poisoned content", i)
            } else {
                format!("chunk {} useful content", i)
            }
        })
        .collect();
    let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
    let book = seed_claims_book(&store, &refs);

    let mock = MockChatClient::new()
        .fail("poisoned", "llm endpoint unreachable")
        .reply("atomic claim", EXTRACTION_REPLY)
        .reply("Evaluate each claim", FILTER_REPLY)
        .reply("Cluster these claims", CLUSTER_REPLY)
        .reply("behavior delta:", EXPAND_REPLY)
        .reply("Reconstruct", RECONSTRUCT_REPLY);
    let runner = runner(store.clone(), mock);

    runner.trigger(&book.id).unwrap();
    let (done, _) = wait_terminal(&store, &book.id).await;

    // Nine chunks contributed claims; the stage and the run still succeeded.
    assert_eq!(done.status, BookStatus::Completed);
    assert_eq!(store.count_claims(&book.id).unwrap(), 9);
}

// === Scenario: Polled progress is monotone and lands on exactly 100 ===
#[tokio::test]
async fn progress_poll_is_monotone() {
    let store = memory_store();
    let texts: Vec<String> = (0..25).map(|i| format!("chunk number {}", i)).collect();
    let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
    let book = seed_claims_book(&store, &refs);
    let runner = runner(store.clone(), happy_path_mock());

    let mut samples = vec![(book.status, book.progress)];
    assert_eq!(samples[0], (BookStatus::Uploaded, 0));

    runner.trigger(&book.id).unwrap();
    let (done, observed) = wait_terminal(&store, &book.id).await;
    samples.extend(observed);

    assert_monotone(&samples);
    assert_eq!(samples.last().unwrap(), &(BookStatus::Completed, 100));
}

// === Scenario: Retry after a reconstruct failure replays to completion ===
#[tokio::test]
async fn retry_after_failure_reaches_completed_without_duplicates() {
    let store = memory_store();
    let book = seed_claims_book(&store, &["Paragraph A.\n\nParagraph B."]);

    let mock = Arc::new(
        MockChatClient::new()
            .reply("atomic claim", EXTRACTION_REPLY)
            .reply("Evaluate each claim", FILTER_REPLY)
            .reply("Cluster these claims", CLUSTER_REPLY)
            .reply("behavior delta:", EXPAND_REPLY)
            .fail("Reconstruct", "llm endpoint unreachable")
            .reply("Reconstruct", RECONSTRUCT_REPLY),
    );
    let runner = runner_with_client(store.clone(), mock.clone());

    runner.trigger(&book.id).unwrap();
    let (failed, _) = wait_terminal(&store, &book.id).await;
    assert_eq!(failed.status, BookStatus::Failed);
    assert!(failed.error.unwrap().contains("unreachable"));

    // Re-trigger from failed: S1 skips (claims exist), S2 skips (all
    // labeled), S3/S4 recreate ideas, S5 upserts.
    runner.trigger(&book.id).unwrap();
    let (done, samples) = wait_terminal(&store, &book.id).await;

    assert_eq!(done.status, BookStatus::Completed);
    assert_eq!(done.progress, 100);
    assert_monotone(&samples);

    // Extraction ran once across both runs; clustering left exactly one idea
    // per title.
    assert_eq!(mock.calls_matching("atomic claim"), 1);
    let ideas = store.list_ideas(&book.id).unwrap();
    assert_eq!(ideas.len(), 1);
    assert_eq!(ideas[0].title, "T");

    let output = store.get_final_output(&book.id).unwrap().unwrap();
    assert_eq!(output.unit_count, 1);
}

// === Scenario: Deleting the book mid-run leaves no failed ghost ===
#[tokio::test]
async fn delete_mid_run_exits_silently() {
    let store = memory_store();
    let texts: Vec<String> = (0..50).map(|i| format!("chunk number {}", i)).collect();
    let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
    let book = seed_claims_book(&store, &refs);
    let runner = runner(store.clone(), happy_path_mock());

    runner.trigger(&book.id).unwrap();
    store.delete_book(&book.id).unwrap();

    // Give the detached job time to notice and exit.
    for _ in 0..200 {
        if !runner.is_active(&book.id) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert!(!runner.is_active(&book.id));
    assert!(store.get_book(&book.id).unwrap().is_none());
}

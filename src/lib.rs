//! Alembic: Idea-Centered Book Distillation Engine
//!
//! Distills long non-fiction books into dense, idea-centered condensed
//! versions by orchestrating staged, checkpointed, concurrency-bounded LLM
//! pipelines over a document store.
//!
//! # Core Concepts
//!
//! - **Books**: distillation job records with a monotone status/progress lifecycle
//! - **Pipelines**: claims (chunks → claims → ideas → markdown) and chapters
//!   (chapters → compression → assembly), selected per book
//! - **Structured calls**: every LLM reply is coerced and validated against a
//!   declared schema before a stage trusts it
//!
//! # Example
//!
//! ```
//! use alembic::{AlembicApi, Config, SqliteStore, OpenStore};
//! use std::sync::Arc;
//!
//! let store = Arc::new(SqliteStore::open_in_memory().unwrap());
//! let api = AlembicApi::from_config(store, &Config::from_env());
//! // api is ready to accept uploads and triggers
//! ```

pub mod analysis;
pub mod api;
pub mod config;
pub mod ingest;
pub mod job;
pub mod llm;
pub mod model;
pub mod parallel;
pub mod pipeline;
pub mod progress;
pub mod segment;
pub mod store;

pub use analysis::{
    DensityAnalysis, DensityAnalyzer, TocConfidence, TocDetection, TocDetector, TocEntry,
};
pub use api::AlembicApi;
pub use config::Config;
pub use ingest::{IngestError, Ingestor, ParsedDocument};
pub use job::{JobRunner, TriggerError};
pub use llm::{
    ChatClient, HttpChatClient, LlmError, MockChatClient, ModelTier, StructuredClient, TierModels,
};
pub use model::{
    word_count, Book, BookId, BookStatus, Chapter, Chunk, Claim, ClaimLabel, ClaimType,
    ExampleReason, ExtractionMethod, FinalOutput, Idea, IdeaExample, PipelineVariant, RecordId,
    User,
};
pub use parallel::{parallel_batch, parallel_map, ItemError, ParallelOptions};
pub use pipeline::{PipelineError, ProgressReporter, StageConcurrency, StageContext};
pub use progress::{ProgressSender, UploadEvent};
pub use segment::{chunk_text, ChapterExtractor, ChunkerConfig, ExtractedChapters, TextChunk};
pub use store::{DocumentStore, OpenStore, SqliteStore, StoreError, StoreResult};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

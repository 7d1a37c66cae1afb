//! Upload preprocessing
//!
//! Consumes the external PDF parser's output (cleaned text plus per-page
//! text) and produces a Book in `uploaded` with its children already
//! populated: chunks for the claims pipeline, chapters (with TOC detection
//! and density analysis) for the chapters pipeline. Emits progress events
//! for the upload stream along the way.

use crate::analysis::{DensityAnalyzer, TocDetector};
use crate::llm::StructuredClient;
use crate::model::{word_count, Book, Chapter, Chunk, PipelineVariant, RecordId};
use crate::progress::{ProgressSender, UploadEvent};
use crate::segment::{chunk_text, ChapterExtractor, ChunkerConfig};
use crate::store::{DocumentStore, StoreError};
use std::sync::Arc;
use tracing::{info, warn};

/// Parsed document handed over by the (external) PDF parser.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub title: String,
    pub author: Option<String>,
    pub filename: String,
    pub cleaned_text: String,
    pub pages: Vec<String>,
}

/// Errors from upload preprocessing.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("document contains no usable text")]
    EmptyDocument,

    #[error("document produced no {0}")]
    NoSegments(&'static str),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Upload preprocessor.
pub struct Ingestor {
    store: Arc<dyn DocumentStore>,
    llm: StructuredClient,
    chunker: ChunkerConfig,
}

impl Ingestor {
    pub fn new(store: Arc<dyn DocumentStore>, llm: StructuredClient) -> Self {
        Self {
            store,
            llm,
            chunker: ChunkerConfig::default(),
        }
    }

    /// Override the chunker budget.
    pub fn with_chunker_config(mut self, config: ChunkerConfig) -> Self {
        self.chunker = config;
        self
    }

    /// Run preprocessing for one uploaded document. On success the returned
    /// Book is in `uploaded` with children persisted; the caller triggers
    /// the pipeline separately.
    pub async fn preprocess(
        &self,
        user_id: &RecordId,
        document: ParsedDocument,
        variant: PipelineVariant,
        progress: &ProgressSender,
    ) -> Result<Book, IngestError> {
        progress.send(UploadEvent::progress("extracting", 10, "Reading document text"));
        if document.cleaned_text.trim().is_empty() {
            return Err(IngestError::EmptyDocument);
        }

        let mut book = Book::new(
            user_id.clone(),
            document.title.clone(),
            document.filename.clone(),
            variant,
        );
        book.author = document.author.clone();
        book.page_count = Some(document.pages.len() as u32);
        book.original_word_count = Some(word_count(&document.cleaned_text));

        match variant {
            PipelineVariant::Claims => self.prepare_chunks(&mut book, &document, progress)?,
            PipelineVariant::Chapters => {
                self.prepare_chapters(&mut book, &document, progress).await?
            }
        }

        progress.send(UploadEvent::progress("saved", 95, "Book saved"));
        Ok(book)
    }

    fn prepare_chunks(
        &self,
        book: &mut Book,
        document: &ParsedDocument,
        progress: &ProgressSender,
    ) -> Result<(), IngestError> {
        progress.send(UploadEvent::progress(
            "chunking",
            40,
            "Splitting text into token-budgeted chunks",
        ));
        let chunks = chunk_text(&document.cleaned_text, &self.chunker);
        if chunks.is_empty() {
            return Err(IngestError::NoSegments("chunks"));
        }
        book.total_chunks = Some(chunks.len() as u32);

        self.store.insert_book(book)?;
        let records: Vec<Chunk> = chunks
            .into_iter()
            .enumerate()
            .map(|(i, c)| Chunk::new(book.id.clone(), i as u32, c.text, c.token_count))
            .collect();
        self.store.insert_chunks(&records)?;
        info!(book = %book.id, chunks = records.len(), "chunks persisted");
        Ok(())
    }

    async fn prepare_chapters(
        &self,
        book: &mut Book,
        document: &ParsedDocument,
        progress: &ProgressSender,
    ) -> Result<(), IngestError> {
        progress.send(UploadEvent::progress(
            "detecting_chapters",
            30,
            "Detecting table of contents",
        ));
        let toc = match TocDetector::new(self.llm.clone())
            .detect(&document.pages)
            .await
        {
            Ok(detection) => Some(detection),
            Err(e) => {
                warn!(error = %e, "TOC detection failed, extracting without it");
                None
            }
        };

        progress.send(UploadEvent::progress(
            "detecting_chapters",
            50,
            "Extracting chapters",
        ));
        let extracted = ChapterExtractor::extract(&document.cleaned_text, toc.as_ref());
        if extracted.chapters.is_empty() {
            return Err(IngestError::NoSegments("chapters"));
        }

        progress.send(UploadEvent::progress(
            "analyzing_density",
            70,
            "Analyzing content density",
        ));
        let contents: Vec<&str> = extracted
            .chapters
            .iter()
            .map(|c| c.content.as_str())
            .collect();
        let density = DensityAnalyzer::new(self.llm.clone()).analyze(&contents).await;

        book.total_chapters = Some(extracted.chapters.len() as u32);
        book.extraction_method = Some(extracted.method);
        book.density_score = Some(density.density_score);
        book.recommended_compression = Some(density.recommended_compression);

        self.store.insert_book(book)?;
        let records: Vec<Chapter> = extracted
            .chapters
            .into_iter()
            .enumerate()
            .map(|(i, c)| {
                Chapter::new(
                    book.id.clone(),
                    i as u32,
                    c.title,
                    c.level,
                    c.content,
                    c.token_count,
                )
            })
            .collect();
        self.store.insert_chapters(&records)?;
        info!(
            book = %book.id,
            chapters = records.len(),
            method = extracted.method.as_str(),
            "chapters persisted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockChatClient, TierModels};
    use crate::model::{BookStatus, User};
    use crate::store::{OpenStore, SqliteStore};

    fn setup(mock: MockChatClient) -> (Ingestor, Arc<dyn DocumentStore>, User) {
        let store: Arc<dyn DocumentStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let user = User::new("r@example.com", "R");
        store.insert_user(&user).unwrap();
        let llm = StructuredClient::new(Arc::new(mock), TierModels::default());
        let ingestor = Ingestor::new(store.clone(), llm).with_chunker_config(ChunkerConfig {
            min_tokens: 20,
            max_tokens: 60,
        });
        (ingestor, store, user)
    }

    fn doc(text: &str) -> ParsedDocument {
        ParsedDocument {
            title: "Deep Work".into(),
            author: Some("Cal Newport".into()),
            filename: "deep-work.pdf".into(),
            cleaned_text: text.into(),
            pages: vec![text.into()],
        }
    }

    #[tokio::test]
    async fn claims_upload_creates_book_with_chunks() {
        let (ingestor, store, user) = setup(MockChatClient::new());
        let text = "Paragraph one with enough words to count. ".repeat(20);
        let book = ingestor
            .preprocess(&user.id, doc(&text), PipelineVariant::Claims, &ProgressSender::sink())
            .await
            .unwrap();

        assert_eq!(book.status, BookStatus::Uploaded);
        assert!(book.total_chunks.unwrap() > 0);
        assert_eq!(book.original_word_count, Some(140));
        let chunks = store.list_chunks(&book.id).unwrap();
        assert_eq!(chunks.len() as u32, book.total_chunks.unwrap());
        // Dense, unique order indices.
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.order, i as u32);
        }
    }

    #[tokio::test]
    async fn empty_document_is_rejected() {
        let (ingestor, _store, user) = setup(MockChatClient::new());
        let err = ingestor
            .preprocess(
                &user.id,
                doc("   \n\n  "),
                PipelineVariant::Claims,
                &ProgressSender::sink(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::EmptyDocument));
    }

    #[tokio::test]
    async fn chapters_upload_records_method_and_density() {
        // TOC detection fails (no scripted reply matches), density falls back
        // to defaults; regex extraction still finds the chapter headings.
        let body = "The argument develops across many pages of detailed reasoning here. "
            .repeat(30);
        let text = format!(
            "Chapter 1: Focus\n{}\nChapter 2: Rest\n{}\nChapter 3: Depth\n{}",
            body, body, body
        );
        let (ingestor, store, user) = setup(MockChatClient::new());
        let (sender, mut rx) = ProgressSender::channel();

        let book = ingestor
            .preprocess(&user.id, doc(&text), PipelineVariant::Chapters, &sender)
            .await
            .unwrap();

        assert_eq!(book.status, BookStatus::Uploaded);
        assert_eq!(
            book.extraction_method,
            Some(crate::model::ExtractionMethod::Regex)
        );
        assert_eq!(book.density_score, Some(5.0));
        assert_eq!(book.recommended_compression, Some(0.35));
        let chapters = store.list_chapters(&book.id).unwrap();
        assert_eq!(chapters.len() as u32, book.total_chapters.unwrap());
        assert!(chapters.iter().any(|c| c.title == "Focus"));

        // The stream saw the preprocessing steps in order.
        let mut steps = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let UploadEvent::Progress { step, .. } = event {
                steps.push(step);
            }
        }
        assert_eq!(steps[0], "extracting");
        assert!(steps.contains(&"detecting_chapters".to_string()));
        assert!(steps.contains(&"analyzing_density".to_string()));
    }
}

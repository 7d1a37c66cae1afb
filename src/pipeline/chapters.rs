//! Chapters pipeline: per-chapter compression, then single-call assembly
//!
//! Compression fans out with a low bound (strong-tier calls are slow and
//! rate-limited); oversized chapters are re-split and compressed part by
//! part inside their item. Assembly never rewrites chapter bodies.

use super::prompts;
use super::{PipelineError, StageContext, BAND_ASSEMBLE, BAND_COMPRESS_CHAPTERS};
use crate::llm::{LlmError, ModelTier, StructuredClient};
use crate::model::{BookStatus, Chapter, FinalOutput};
use crate::parallel::{parallel_map, ParallelOptions};
use crate::segment::{estimate_tokens, split_large_chapter, RawChapter, MAX_CHAPTER_TOKENS};
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::{info, warn};

/// Compressed chapters keep at most this many deduplicated insights.
const MAX_KEY_INSIGHTS: usize = 5;

#[derive(Debug, Deserialize, JsonSchema)]
struct ChapterCompression {
    compressed_content: String,
    #[serde(default)]
    key_insights: Vec<String>,
    #[allow(dead_code)]
    compression_notes: Option<String>,
}

/// Run the full chapters pipeline for the context's book.
pub async fn run_chapters_pipeline(ctx: &StageContext) -> Result<(), PipelineError> {
    compress_chapters(ctx).await?;
    assemble_book(ctx).await?;
    Ok(())
}

/// C1 — compress every chapter that doesn't yet have compressed content.
async fn compress_chapters(ctx: &StageContext) -> Result<(), PipelineError> {
    ctx.reporter
        .enter_stage(BookStatus::CompressingChapters, BAND_COMPRESS_CHAPTERS)?;

    let chapters = ctx.store.list_chapters(&ctx.book_id)?;
    if chapters.is_empty() {
        return Err(PipelineError::Empty(
            "No chapters found for this book".into(),
        ));
    }
    let book = ctx
        .store
        .get_book(&ctx.book_id)?
        .ok_or(PipelineError::BookVanished)?;

    // Restart safety: already-compressed chapters are left alone.
    let pending: Vec<Chapter> = chapters
        .into_iter()
        .filter(|c| c.compressed_content.is_none())
        .collect();
    if pending.is_empty() {
        info!(book = %ctx.book_id, "all chapters already compressed, skipping");
        ctx.reporter
            .report_within(BAND_COMPRESS_CHAPTERS, 1, 1);
        return Ok(());
    }

    let llm = ctx.llm.clone();
    let store = ctx.store.clone();
    let book_title = book.title.clone();
    let ratio = book.recommended_compression;
    let results = parallel_map(
        pending,
        move |chapter: Chapter, _| {
            let llm = llm.clone();
            let store = store.clone();
            let book_title = book_title.clone();
            async move {
                let compression =
                    compress_one_chapter(&llm, &book_title, &chapter, ratio).await?;
                let token_count = estimate_tokens(&compression.compressed_content);
                store
                    .update_chapter_compression(
                        &chapter.id,
                        &compression.compressed_content,
                        &compression.key_insights,
                        token_count,
                    )
                    .map_err(PipelineError::from)?;
                Ok::<_, PipelineError>(())
            }
        },
        ParallelOptions::with_concurrency(ctx.concurrency.chapters),
        |completed, total| {
            ctx.reporter
                .report_within(BAND_COMPRESS_CHAPTERS, completed, total)
        },
    )
    .await;

    let skipped = results.iter().filter(|r| r.is_err()).count();
    for (index, result) in results.iter().enumerate() {
        if let Err(e) = result {
            warn!(book = %ctx.book_id, chapter = index, error = %e, "chapter compression skipped");
        }
    }
    info!(
        book = %ctx.book_id,
        compressed = results.len() - skipped,
        skipped,
        "chapters compressed"
    );
    ctx.reporter.ensure_alive()
}

/// Compress one chapter, re-splitting it when it exceeds the per-call token
/// budget: parts are compressed in sequence, bodies concatenated, and up to
/// five deduplicated insights kept across parts.
async fn compress_one_chapter(
    llm: &StructuredClient,
    book_title: &str,
    chapter: &Chapter,
    ratio: Option<f64>,
) -> Result<ChapterCompression, LlmError> {
    let is_first = chapter.order == 0;

    if chapter.original_token_count <= MAX_CHAPTER_TOKENS {
        let prompt = prompts::compress_chapter(
            book_title,
            &chapter.title,
            is_first,
            ratio,
            &chapter.original_content,
        );
        let mut compression: ChapterCompression =
            llm.invoke(&prompt, ModelTier::Reasoning, None).await?;
        compression.key_insights = dedup_insights(compression.key_insights);
        return Ok(compression);
    }

    let parts = split_large_chapter(
        RawChapter {
            title: chapter.title.clone(),
            level: chapter.level,
            content: chapter.original_content.clone(),
            token_count: chapter.original_token_count,
        },
        MAX_CHAPTER_TOKENS,
    );

    let mut bodies: Vec<String> = Vec::new();
    let mut insights: Vec<String> = Vec::new();
    for (i, part) in parts.iter().enumerate() {
        let prompt = prompts::compress_chapter(
            book_title,
            &part.title,
            is_first && i == 0,
            ratio,
            &part.content,
        );
        let compression: ChapterCompression =
            llm.invoke(&prompt, ModelTier::Reasoning, None).await?;
        bodies.push(compression.compressed_content);
        insights.extend(compression.key_insights);
    }

    Ok(ChapterCompression {
        compressed_content: bodies.join("\n\n"),
        key_insights: dedup_insights(insights),
        compression_notes: None,
    })
}

fn dedup_insights(insights: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    insights
        .into_iter()
        .filter(|i| seen.insert(i.trim().to_lowercase()))
        .take(MAX_KEY_INSIGHTS)
        .collect()
}

/// C2 — one text call assembling the compressed chapters, then the final
/// output upsert.
async fn assemble_book(ctx: &StageContext) -> Result<(), PipelineError> {
    ctx.reporter
        .enter_stage(BookStatus::Assembling, BAND_ASSEMBLE)?;

    let chapters = ctx.store.list_chapters(&ctx.book_id)?;
    let compressed: Vec<(String, String)> = chapters
        .iter()
        .filter_map(|c| {
            c.compressed_content
                .clone()
                .map(|body| (c.title.clone(), body))
        })
        .collect();
    if compressed.is_empty() {
        return Err(PipelineError::Empty(
            "No compressed chapters available to assemble".into(),
        ));
    }
    let book = ctx
        .store
        .get_book(&ctx.book_id)?
        .ok_or(PipelineError::BookVanished)?;

    let markdown = ctx
        .llm
        .invoke_text(
            &prompts::assemble_book(&book.title, &compressed),
            ModelTier::Reasoning,
            None,
        )
        .await?;

    let output = FinalOutput::new(ctx.book_id.clone(), markdown, compressed.len() as u32)
        .with_compression_against(book.original_word_count);
    ctx.store.upsert_final_output(&output)?;
    info!(
        book = %ctx.book_id,
        words = output.word_count,
        chapters = output.unit_count,
        compression = ?output.compression_ratio,
        "book assembled"
    );
    ctx.reporter.report_within(BAND_ASSEMBLE, 1, 1);
    ctx.reporter.ensure_alive()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insights_dedup_case_insensitively_and_cap_at_five() {
        let insights = vec![
            "Focus compounds".to_string(),
            "focus compounds".to_string(),
            "Rest is productive".to_string(),
            "Batch shallow work".to_string(),
            "Say no by default".to_string(),
            "Measure lead inputs".to_string(),
            "One more".to_string(),
        ];
        let deduped = dedup_insights(insights);
        assert_eq!(deduped.len(), 5);
        assert_eq!(deduped[0], "Focus compounds");
        assert!(!deduped.contains(&"One more".to_string()));
    }
}

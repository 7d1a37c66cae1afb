//! Claims pipeline: chunks → claims → filtered claims → idea clusters →
//! expanded ideas → reconstructed markdown
//!
//! Five stages, each persisting its results before the next begins, so a
//! restart after failure replays cheaply: extraction skips when claims
//! already exist, filtering only touches unlabeled claims, clustering
//! deletes and recreates ideas, reconstruction upserts the final output.

use super::prompts;
use super::{
    PipelineError, StageContext, BAND_CLUSTER_IDEAS, BAND_EXTRACT_CLAIMS, BAND_FILTER_CLAIMS,
    BAND_RECONSTRUCT,
};
use crate::llm::ModelTier;
use crate::model::{BookStatus, Chunk, Claim, ClaimLabel, ClaimType, FinalOutput, Idea};
use crate::parallel::{parallel_batch, parallel_map, ParallelOptions};
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::{info, warn};

/// Claims are filtered in groups of this size.
const FILTER_BATCH_SIZE: usize = 20;

#[derive(Debug, Deserialize, JsonSchema)]
struct ClaimExtraction {
    claims: Vec<ExtractedClaim>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ExtractedClaim {
    claim: String,
    #[serde(rename = "type")]
    claim_type: ClaimType,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct FilterResponse {
    evaluations: Vec<ClaimEvaluation>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
struct ClaimEvaluation {
    claim: String,
    label: ClaimLabel,
    /// In [0, 1].
    score: f64,
    reason: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ClusterResponse {
    ideas: Vec<IdeaCluster>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
struct IdeaCluster {
    idea_title: String,
    merged_claims: Vec<String>,
    #[allow(dead_code)]
    summary: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct IdeaExpansion {
    principle: String,
    behavior_delta: String,
}

/// Run the full claims pipeline for the context's book.
pub async fn run_claims_pipeline(ctx: &StageContext) -> Result<(), PipelineError> {
    extract_claims(ctx).await?;
    filter_claims(ctx).await?;
    let clusters = cluster_ideas(ctx).await?;
    expand_ideas(ctx, clusters).await?;
    reconstruct(ctx).await?;
    Ok(())
}

/// S1 — one extraction call per chunk, then a single bulk insert.
async fn extract_claims(ctx: &StageContext) -> Result<(), PipelineError> {
    ctx.reporter
        .enter_stage(BookStatus::ExtractingClaims, BAND_EXTRACT_CLAIMS)?;

    if ctx.store.count_claims(&ctx.book_id)? > 0 {
        info!(book = %ctx.book_id, "claims already extracted, skipping");
        ctx.reporter.report_within(BAND_EXTRACT_CLAIMS, 1, 1);
        return Ok(());
    }

    let chunks = ctx.store.list_chunks(&ctx.book_id)?;
    if chunks.is_empty() {
        return Err(PipelineError::Empty(
            "No chunks found for this book".into(),
        ));
    }
    let total_chunks = chunks.len();

    let llm = ctx.llm.clone();
    let results = parallel_map(
        chunks,
        move |chunk: Chunk, _| {
            let llm = llm.clone();
            async move {
                let response: ClaimExtraction = llm
                    .invoke(
                        &prompts::claim_extraction(&chunk.text),
                        ModelTier::Extraction,
                        None,
                    )
                    .await?;
                let claims: Vec<Claim> = response
                    .claims
                    .into_iter()
                    .map(|c| {
                        Claim::new(
                            chunk.book_id.clone(),
                            chunk.id.clone(),
                            c.claim,
                            c.claim_type,
                        )
                    })
                    .collect();
                Ok::<_, crate::llm::LlmError>(claims)
            }
        },
        ParallelOptions::with_concurrency(ctx.concurrency.chunks),
        |completed, total| {
            ctx.reporter
                .report_within(BAND_EXTRACT_CLAIMS, completed, total)
        },
    )
    .await;

    let mut extracted: Vec<Claim> = Vec::new();
    let mut skipped = 0usize;
    for (index, result) in results.into_iter().enumerate() {
        match result {
            Ok(claims) => extracted.extend(claims),
            Err(e) => {
                skipped += 1;
                warn!(book = %ctx.book_id, chunk = index, error = %e, "chunk skipped");
            }
        }
    }

    ctx.store.insert_claims(&extracted)?;
    info!(
        book = %ctx.book_id,
        claims = extracted.len(),
        chunks = total_chunks,
        skipped_chunks = skipped,
        "claims extracted"
    );
    ctx.reporter.set_step("Claims extracted");
    ctx.reporter.ensure_alive()
}

/// S2 — filter unlabeled claims in batches, mapping evaluations back to
/// records by text equality within the batch.
async fn filter_claims(ctx: &StageContext) -> Result<(), PipelineError> {
    ctx.reporter
        .enter_stage(BookStatus::FilteringClaims, BAND_FILTER_CLAIMS)?;

    let unlabeled = ctx.store.list_unlabeled_claims(&ctx.book_id)?;
    if unlabeled.is_empty() {
        info!(book = %ctx.book_id, "no unlabeled claims, skipping filter");
        ctx.reporter.report_within(BAND_FILTER_CLAIMS, 1, 1);
        return Ok(());
    }

    let llm = ctx.llm.clone();
    let store = ctx.store.clone();
    let results = parallel_batch(
        unlabeled,
        FILTER_BATCH_SIZE,
        move |batch: Vec<Claim>, batch_index| {
            let llm = llm.clone();
            let store = store.clone();
            async move {
                let response: FilterResponse = llm
                    .invoke(&prompts::claim_filter(&batch), ModelTier::Filtering, None)
                    .await
                    .map_err(PipelineError::from)?;

                // TODO: claims sharing identical text within one batch make
                // this text-equality back-mapping ambiguous. Either dedupe
                // each batch before sending or echo an opaque per-claim id
                // through the prompt and response.
                let mut kept = 0usize;
                let mut discarded = 0usize;
                for evaluation in response.evaluations {
                    let Some(claim) = batch.iter().find(|c| c.text == evaluation.claim) else {
                        warn!(
                            batch = batch_index,
                            claim = %evaluation.claim,
                            "evaluation does not match any claim in its batch"
                        );
                        continue;
                    };
                    let score = evaluation.score.clamp(0.0, 1.0);
                    store
                        .update_claim_evaluation(
                            &claim.id,
                            evaluation.label,
                            score,
                            &evaluation.reason,
                        )
                        .map_err(PipelineError::from)?;
                    if evaluation.label.is_kept() {
                        kept += 1;
                    } else {
                        discarded += 1;
                    }
                }
                Ok::<_, PipelineError>((kept, discarded))
            }
        },
        ParallelOptions::with_concurrency(ctx.concurrency.filter_batches),
        |completed, total| {
            ctx.reporter
                .report_within(BAND_FILTER_CLAIMS, completed, total)
        },
    )
    .await;

    let mut kept = 0usize;
    let mut discarded = 0usize;
    for (index, result) in results.into_iter().enumerate() {
        match result {
            Ok((k, d)) => {
                kept += k;
                discarded += d;
            }
            Err(e) => warn!(book = %ctx.book_id, batch = index, error = %e, "filter batch skipped"),
        }
    }
    info!(book = %ctx.book_id, kept, discarded, "claims filtered");
    ctx.reporter.set_step("Claims filtered");
    ctx.reporter.ensure_alive()
}

/// S3 — single reasoning call clustering kept claims into ideas.
async fn cluster_ideas(ctx: &StageContext) -> Result<Vec<IdeaCluster>, PipelineError> {
    ctx.reporter
        .enter_stage(BookStatus::ClusteringIdeas, BAND_CLUSTER_IDEAS)?;

    let kept = ctx.store.list_kept_claims(&ctx.book_id)?;
    if kept.is_empty() {
        return Err(PipelineError::Empty(
            "No valuable claims found in this book".into(),
        ));
    }

    let response: ClusterResponse = ctx
        .llm
        .invoke(&prompts::cluster_ideas(&kept), ModelTier::Reasoning, None)
        .await?;
    if response.ideas.is_empty() {
        return Err(PipelineError::Empty(
            "Clustering produced no ideas for this book".into(),
        ));
    }

    info!(book = %ctx.book_id, clusters = response.ideas.len(), "ideas clustered");
    ctx.reporter.report_within(BAND_CLUSTER_IDEAS, 1, 3);
    Ok(response.ideas)
}

/// S4 — expand each cluster into principle + behavior delta, then replace
/// the book's ideas wholesale (delete before insert keeps restarts free of
/// duplicates).
async fn expand_ideas(ctx: &StageContext, clusters: Vec<IdeaCluster>) -> Result<(), PipelineError> {
    let total = clusters.len();
    let llm = ctx.llm.clone();
    let book_id = ctx.book_id.clone();
    let results = parallel_map(
        clusters,
        move |cluster: IdeaCluster, index| {
            let llm = llm.clone();
            let book_id = book_id.clone();
            async move {
                let expansion = match llm
                    .invoke::<IdeaExpansion>(
                        &prompts::expand_idea(&cluster.idea_title, &cluster.merged_claims),
                        ModelTier::Reasoning,
                        None,
                    )
                    .await
                {
                    Ok(expansion) => Some(expansion),
                    Err(e) => {
                        warn!(book = %book_id, cluster = index, error = %e,
                            "idea expansion failed, keeping bare cluster");
                        None
                    }
                };
                Ok::<_, std::convert::Infallible>((cluster, expansion))
            }
        },
        ParallelOptions::with_concurrency(ctx.concurrency.filter_batches),
        |completed, _| {
            // Expansion occupies the back two thirds of the clustering band.
            ctx.reporter
                .report_within(BAND_CLUSTER_IDEAS, 1 + 2 * completed / total.max(1), 3)
        },
    )
    .await;

    // A failed expansion keeps its idea (title + merged claims, no prose);
    // the order index stays dense either way.
    let mut ideas: Vec<Idea> = Vec::new();
    for (cluster, expansion) in results.into_iter().flatten() {
        let mut idea = Idea::new(
            ctx.book_id.clone(),
            ideas.len() as u32,
            cluster.idea_title,
            cluster.merged_claims,
        );
        if let Some(expansion) = expansion {
            idea.principle = Some(expansion.principle);
            idea.behavior_delta = Some(expansion.behavior_delta);
        }
        ideas.push(idea);
    }
    if ideas.is_empty() {
        return Err(PipelineError::Empty(
            "No ideas survived expansion for this book".into(),
        ));
    }

    ctx.store.delete_ideas(&ctx.book_id)?;
    ctx.store.insert_ideas(&ideas)?;
    info!(book = %ctx.book_id, ideas = ideas.len(), "ideas expanded");
    ctx.reporter.report_within(BAND_CLUSTER_IDEAS, 3, 3);
    ctx.reporter.ensure_alive()
}

/// S5 — single text call producing the final markdown; upserted so retries
/// overwrite.
async fn reconstruct(ctx: &StageContext) -> Result<(), PipelineError> {
    ctx.reporter
        .enter_stage(BookStatus::Reconstructing, BAND_RECONSTRUCT)?;

    let ideas = ctx.store.list_ideas(&ctx.book_id)?;
    if ideas.is_empty() {
        return Err(PipelineError::Empty(
            "No ideas available to reconstruct".into(),
        ));
    }
    let book = ctx
        .store
        .get_book(&ctx.book_id)?
        .ok_or(PipelineError::BookVanished)?;

    let markdown = ctx
        .llm
        .invoke_text(
            &prompts::reconstruct(&book.title, &ideas),
            ModelTier::Reasoning,
            None,
        )
        .await?;

    let output = FinalOutput::new(ctx.book_id.clone(), markdown, ideas.len() as u32)
        .with_compression_against(book.original_word_count);
    ctx.store.upsert_final_output(&output)?;
    info!(
        book = %ctx.book_id,
        words = output.word_count,
        ideas = output.unit_count,
        compression = ?output.compression_ratio,
        "final output reconstructed"
    );
    ctx.reporter.report_within(BAND_RECONSTRUCT, 99, 100);
    ctx.reporter.ensure_alive()
}

//! Content density analysis
//!
//! Scores how much signal the book carries per unit length and recommends a
//! compression ratio for the chapters pipeline. The sample is drawn from the
//! opening chapter, the middle, and the three-quarter point so front-loaded
//! books don't skew the estimate.

use crate::llm::{ModelTier, StructuredClient};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Character budget for the stitched sample sent to the model.
const SAMPLE_TARGET_CHARS: usize = 6000;

/// Samples below this size get the default analysis without a call.
const MIN_SAMPLE_CHARS: usize = 500;

/// Structured density analysis result.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DensityAnalysis {
    /// 1–10; higher means more decision-relevant signal per page.
    pub density_score: f64,
    #[serde(default)]
    pub characteristics: Vec<String>,
    /// Target output/input word ratio, within [0.15, 0.60].
    pub recommended_compression: f64,
    /// Suggested context window (words) for compression prompts, [100, 350].
    pub recommended_context_size: u32,
    pub analysis_notes: Option<String>,
}

impl DensityAnalysis {
    fn fallback(reason: &str) -> Self {
        Self {
            density_score: 5.0,
            characteristics: vec![reason.to_string()],
            recommended_compression: 0.35,
            recommended_context_size: 180,
            analysis_notes: None,
        }
    }

    /// Clamp fields into their contractual ranges, and the compression ratio
    /// into the band the density score implies.
    fn normalized(mut self) -> Self {
        self.density_score = self.density_score.clamp(1.0, 10.0);
        let (band_lo, band_hi) = if self.density_score <= 3.0 {
            (0.20, 0.30)
        } else if self.density_score <= 6.0 {
            (0.30, 0.40)
        } else {
            (0.40, 0.55)
        };
        self.recommended_compression = self.recommended_compression.clamp(band_lo, band_hi);
        self.recommended_context_size = self.recommended_context_size.clamp(100, 350);
        self
    }
}

/// Density analyzer over extracted chapter contents.
pub struct DensityAnalyzer {
    llm: StructuredClient,
}

impl DensityAnalyzer {
    pub fn new(llm: StructuredClient) -> Self {
        Self { llm }
    }

    /// Analyze content density from chapter bodies. Never fails: analysis
    /// problems degrade to the default recommendation.
    pub async fn analyze(&self, chapter_contents: &[&str]) -> DensityAnalysis {
        let sample = build_sample(chapter_contents);
        if sample.len() < MIN_SAMPLE_CHARS {
            return DensityAnalysis::fallback("insufficient_sample");
        }

        let prompt = format!(
            "Rate the content density of this non-fiction book sample on a 1-10 scale: \
             how much decision-relevant signal does it carry per page? List its notable \
             characteristics (e.g. anecdote-heavy, framework-driven, repetitive). \
             Recommend a compression ratio between 0.15 and 0.60 (output words over \
             input words) and a context size between 100 and 350 words.\n\n{}",
            sample
        );

        match self
            .llm
            .invoke::<DensityAnalysis>(&prompt, ModelTier::Extraction, None)
            .await
        {
            Ok(analysis) => analysis.normalized(),
            Err(e) => {
                warn!(error = %e, "density analysis failed, using defaults");
                DensityAnalysis::fallback("analysis_failed")
            }
        }
    }
}

/// Stitch a sample: up to 40% of the budget from the first chapter, up to 30%
/// from the middle one, the remainder from the chapter at the 75% position.
fn build_sample(chapter_contents: &[&str]) -> String {
    if chapter_contents.is_empty() {
        return String::new();
    }
    let first = chapter_contents[0];
    let middle = chapter_contents[chapter_contents.len() / 2];
    let late = chapter_contents[(chapter_contents.len() * 3) / 4];

    let mut parts = Vec::new();
    let mut used = 0usize;
    for (content, share) in [(first, 0.40), (middle, 0.30), (late, 1.0)] {
        let budget = if share < 1.0 {
            (SAMPLE_TARGET_CHARS as f64 * share) as usize
        } else {
            SAMPLE_TARGET_CHARS.saturating_sub(used)
        };
        let slice = truncate_chars(content, budget);
        if !slice.is_empty() {
            used += slice.len();
            parts.push(slice);
        }
    }
    parts.join("\n\n---\n\n")
}

fn truncate_chars(text: &str, budget: usize) -> String {
    text.chars().take(budget).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockChatClient, TierModels};
    use std::sync::Arc;

    fn analyzer(mock: MockChatClient) -> DensityAnalyzer {
        DensityAnalyzer::new(StructuredClient::new(Arc::new(mock), TierModels::default()))
    }

    #[tokio::test]
    async fn short_sample_returns_insufficient_default() {
        let analysis = analyzer(MockChatClient::new()).analyze(&["tiny"]).await;
        assert_eq!(analysis.density_score, 5.0);
        assert_eq!(analysis.recommended_compression, 0.35);
        assert_eq!(analysis.recommended_context_size, 180);
        assert_eq!(analysis.characteristics, vec!["insufficient_sample"]);
    }

    #[tokio::test]
    async fn failed_call_returns_failure_default() {
        let long = "signal ".repeat(200);
        let mock = MockChatClient::new().fail("content density", "endpoint down");
        let analysis = analyzer(mock).analyze(&[&long]).await;
        assert_eq!(analysis.characteristics, vec!["analysis_failed"]);
        assert_eq!(analysis.recommended_compression, 0.35);
    }

    #[tokio::test]
    async fn compression_clamps_into_score_band() {
        let long = "signal ".repeat(200);
        // Dense book, but the model recommends an implausibly low ratio.
        let mock = MockChatClient::new().reply(
            "content density",
            r#"{"density_score": 9, "characteristics": ["framework-driven"],
                "recommended_compression": 0.18, "recommended_context_size": 500}"#,
        );
        let analysis = analyzer(mock).analyze(&[&long]).await;
        assert_eq!(analysis.recommended_compression, 0.40);
        assert_eq!(analysis.recommended_context_size, 350);
    }

    #[tokio::test]
    async fn sparse_book_band() {
        let long = "story ".repeat(200);
        let mock = MockChatClient::new().reply(
            "content density",
            r#"{"density_score": 2, "characteristics": ["anecdote-heavy"],
                "recommended_compression": 0.55, "recommended_context_size": 150}"#,
        );
        let analysis = analyzer(mock).analyze(&[&long]).await;
        assert_eq!(analysis.recommended_compression, 0.30);
    }

    #[test]
    fn sample_draws_from_three_positions() {
        let chapters: Vec<String> = (0..8).map(|i| format!("chapter {} ", i).repeat(400)).collect();
        let refs: Vec<&str> = chapters.iter().map(String::as_str).collect();
        let sample = build_sample(&refs);
        assert!(sample.contains("chapter 0"));
        assert!(sample.contains("chapter 4"));
        assert!(sample.contains("chapter 6"));
        assert!(sample.contains("\n\n---\n\n"));
        assert!(sample.len() <= SAMPLE_TARGET_CHARS + 20);
    }
}

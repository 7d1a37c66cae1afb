//! Table-of-contents detection
//!
//! One extraction-tier structured call over the book's opening pages. The
//! result is only trusted when it clears the reliability bar; otherwise the
//! chapter extractor falls through to its regex and artificial methods.

use crate::llm::{LlmError, ModelTier, StructuredClient};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// How many opening pages are scanned for a TOC.
const TOC_SCAN_PAGES: usize = 15;

/// Inputs shorter than this skip the call entirely.
const MIN_SCAN_CHARS: usize = 200;

/// Detector confidence, as reported by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TocConfidence {
    High,
    Medium,
    Low,
}

/// One table-of-contents entry.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TocEntry {
    /// Title as printed in the TOC.
    pub title: String,
    /// Title normalized for matching back into body text.
    pub normalized_title: String,
    pub page_number: Option<u32>,
    /// 1–3; level ≤ 2 entries become chapters.
    pub level: u8,
}

/// Structured TOC detection result.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TocDetection {
    pub has_toc: bool,
    #[serde(default)]
    pub entries: Vec<TocEntry>,
    pub toc_start_page: Option<u32>,
    pub toc_end_page: Option<u32>,
    pub confidence: TocConfidence,
}

impl TocDetection {
    /// Negative result used when the input is too short to bother the model.
    pub fn absent() -> Self {
        Self {
            has_toc: false,
            entries: Vec::new(),
            toc_start_page: None,
            toc_end_page: None,
            confidence: TocConfidence::Low,
        }
    }

    /// Whether the detection is trustworthy enough to guide chapter
    /// extraction: a TOC with at least 3 entries, non-low confidence, and at
    /// least 2 chapter-level (level-2) entries.
    pub fn is_reliable(&self) -> bool {
        self.has_toc
            && self.entries.len() >= 3
            && self.confidence != TocConfidence::Low
            && self.entries.iter().filter(|e| e.level == 2).count() >= 2
    }
}

/// TOC detector over the first pages of a parsed book.
pub struct TocDetector {
    llm: StructuredClient,
}

impl TocDetector {
    pub fn new(llm: StructuredClient) -> Self {
        Self { llm }
    }

    /// Detect a table of contents from per-page text.
    pub async fn detect(&self, pages: &[String]) -> Result<TocDetection, LlmError> {
        let sample = pages
            .iter()
            .take(TOC_SCAN_PAGES)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n\n--- page break ---\n\n");

        if sample.len() < MIN_SCAN_CHARS {
            debug!(chars = sample.len(), "input too short for TOC detection");
            return Ok(TocDetection::absent());
        }

        let prompt = format!(
            "Below are the opening pages of a book, separated by page-break markers. \
             Determine whether they contain a table of contents. If they do, list every \
             entry with its printed title, a normalized title (casing and numbering \
             stripped, suitable for locating the heading in body text), its page number \
             when printed, and its level: 1 for parts, 2 for chapters, 3 for sections. \
             Report which pages the table of contents spans and your confidence.\n\n{}",
            sample
        );

        self.llm
            .invoke::<TocDetection>(&prompt, ModelTier::Extraction, None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockChatClient, TierModels};
    use std::sync::Arc;

    fn detector(mock: MockChatClient) -> TocDetector {
        TocDetector::new(StructuredClient::new(Arc::new(mock), TierModels::default()))
    }

    fn entry(title: &str, level: u8) -> TocEntry {
        TocEntry {
            title: title.to_string(),
            normalized_title: title.to_lowercase(),
            page_number: None,
            level,
        }
    }

    #[test]
    fn reliability_requires_enough_chapter_entries() {
        let mut detection = TocDetection {
            has_toc: true,
            entries: vec![entry("Part One", 1), entry("Alpha", 2), entry("Beta", 2)],
            toc_start_page: Some(3),
            toc_end_page: Some(4),
            confidence: TocConfidence::High,
        };
        assert!(detection.is_reliable());

        detection.confidence = TocConfidence::Low;
        assert!(!detection.is_reliable());

        detection.confidence = TocConfidence::Medium;
        detection.entries = vec![entry("Part One", 1), entry("Part Two", 1), entry("Alpha", 2)];
        assert!(!detection.is_reliable());

        detection.entries = vec![entry("Alpha", 2), entry("Beta", 2)];
        assert!(!detection.is_reliable());
    }

    #[tokio::test]
    async fn short_input_skips_the_call() {
        let mock = MockChatClient::new(); // no scripted replies: a call would fail
        let detection = detector(mock)
            .detect(&["tiny".to_string()])
            .await
            .unwrap();
        assert!(!detection.has_toc);
        assert_eq!(detection.confidence, TocConfidence::Low);
    }

    #[tokio::test]
    async fn parses_detection_reply() {
        let page = "Contents\nChapter 1 Alpha .... 5\nChapter 2 Beta .... 20\n".repeat(4);
        let mock = MockChatClient::new().reply(
            "table of contents",
            r#"{"has_toc": true, "confidence": "high", "toc_start_page": 1, "toc_end_page": 1,
                "entries": [
                  {"title": "Chapter 1 Alpha", "normalized_title": "alpha", "page_number": 5, "level": 2},
                  {"title": "Chapter 2 Beta", "normalized_title": "beta", "page_number": 20, "level": 2},
                  {"title": "Chapter 3 Gamma", "normalized_title": "gamma", "page_number": 41, "level": 2}
                ]}"#,
        );
        let detection = detector(mock).detect(&[page]).await.unwrap();
        assert!(detection.has_toc);
        assert!(detection.is_reliable());
        assert_eq!(detection.entries.len(), 3);
        assert_eq!(detection.entries[0].normalized_title, "alpha");
    }
}

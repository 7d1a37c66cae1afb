//! Record types owned by the document store
//!
//! Every entity except `User` and `FinalOutput` belongs to exactly one Book.
//! Order indices are dense and unique within a book. Records are appended
//! once by upload preprocessing and then updated in place by their stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a book (distillation job)
///
/// Serializes as a plain string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookId(String);

impl BookId {
    /// Create a new random BookId
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create a BookId from a string
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for BookId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BookId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BookId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for any child record (chunk, chapter, claim, idea)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which end-to-end pipeline processes a book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineVariant {
    /// text → chunks → claims → ideas → reconstructed markdown
    Claims,
    /// text → chapters → per-chapter compression → assembled markdown
    Chapters,
}

impl PipelineVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineVariant::Claims => "claims",
            PipelineVariant::Chapters => "chapters",
        }
    }
}

impl FromStr for PipelineVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claims" => Ok(PipelineVariant::Claims),
            "chapters" => Ok(PipelineVariant::Chapters),
            _ => Err(format!("unknown pipeline variant: {}", s)),
        }
    }
}

/// Processing status of a book.
///
/// The numeric rank orders statuses for the monotonicity guarantee a poller
/// observes: later stages always rank higher, `Failed` is terminal from any
/// non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookStatus {
    Uploaded,
    // Preprocessing states reported by the upload path
    Extracting,
    DetectingChapters,
    // Claims pipeline
    ExtractingClaims,
    FilteringClaims,
    ClusteringIdeas,
    Reconstructing,
    // Chapters pipeline
    CompressingChapters,
    Assembling,
    // Terminal
    Completed,
    Failed,
}

impl BookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookStatus::Uploaded => "uploaded",
            BookStatus::Extracting => "extracting",
            BookStatus::DetectingChapters => "detecting_chapters",
            BookStatus::ExtractingClaims => "extracting_claims",
            BookStatus::FilteringClaims => "filtering_claims",
            BookStatus::ClusteringIdeas => "clustering_ideas",
            BookStatus::Reconstructing => "reconstructing",
            BookStatus::CompressingChapters => "compressing_chapters",
            BookStatus::Assembling => "assembling",
            BookStatus::Completed => "completed",
            BookStatus::Failed => "failed",
        }
    }

    /// Human-readable phrase shown as the current step (underscores → spaces).
    pub fn step_phrase(&self) -> String {
        self.as_str().replace('_', " ")
    }

    /// True for `Completed` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BookStatus::Completed | BookStatus::Failed)
    }

    /// Ordering rank within one pipeline run. `Failed` ranks above everything
    /// except `Completed` so a poller never sees status move "backwards".
    pub fn rank(&self) -> u8 {
        match self {
            BookStatus::Uploaded => 0,
            BookStatus::Extracting => 1,
            BookStatus::DetectingChapters => 2,
            BookStatus::ExtractingClaims => 3,
            BookStatus::FilteringClaims => 4,
            BookStatus::ClusteringIdeas => 5,
            BookStatus::Reconstructing => 6,
            BookStatus::CompressingChapters => 3,
            BookStatus::Assembling => 4,
            BookStatus::Completed => 10,
            BookStatus::Failed => 9,
        }
    }
}

impl FromStr for BookStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploaded" => Ok(BookStatus::Uploaded),
            "extracting" => Ok(BookStatus::Extracting),
            "detecting_chapters" => Ok(BookStatus::DetectingChapters),
            "extracting_claims" => Ok(BookStatus::ExtractingClaims),
            "filtering_claims" => Ok(BookStatus::FilteringClaims),
            "clustering_ideas" => Ok(BookStatus::ClusteringIdeas),
            "reconstructing" => Ok(BookStatus::Reconstructing),
            "compressing_chapters" => Ok(BookStatus::CompressingChapters),
            "assembling" => Ok(BookStatus::Assembling),
            "completed" => Ok(BookStatus::Completed),
            "failed" => Ok(BookStatus::Failed),
            _ => Err(format!("unknown book status: {}", s)),
        }
    }
}

/// How chapter boundaries were found for a book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    Toc,
    Regex,
    Artificial,
}

impl ExtractionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionMethod::Toc => "toc",
            ExtractionMethod::Regex => "regex",
            ExtractionMethod::Artificial => "artificial",
        }
    }
}

impl FromStr for ExtractionMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "toc" => Ok(ExtractionMethod::Toc),
            "regex" => Ok(ExtractionMethod::Regex),
            "artificial" => Ok(ExtractionMethod::Artificial),
            _ => Err(format!("unknown extraction method: {}", s)),
        }
    }
}

/// Identity record. Credential hashing and session issuance live outside
/// this crate; the store only owns the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: RecordId,
    pub email: String,
    pub display_name: String,
    pub credential_hash: Option<String>,
    pub external_identity: Option<String>,
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(email: impl Into<String>, display_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: RecordId::new(),
            email: email.into(),
            display_name: display_name.into(),
            credential_hash: None,
            external_identity: None,
            avatar_url: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The distillation job record. Mutated only by the orchestrator once
/// preprocessing has created it in `Uploaded`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Book {
    pub id: BookId,
    pub user_id: RecordId,
    pub title: String,
    pub author: Option<String>,
    pub original_filename: String,
    pub page_count: Option<u32>,
    pub original_word_count: Option<u64>,
    pub variant: PipelineVariant,
    pub status: BookStatus,
    pub current_step: Option<String>,
    /// Integer percentage in [0, 100], monotone within one run.
    pub progress: u8,
    pub error: Option<String>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
    /// Claims pipeline counter.
    pub total_chunks: Option<u32>,
    /// Chapters pipeline counter.
    pub total_chapters: Option<u32>,
    pub density_score: Option<f64>,
    pub recommended_compression: Option<f64>,
    pub extraction_method: Option<ExtractionMethod>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Book {
    pub fn new(
        user_id: RecordId,
        title: impl Into<String>,
        original_filename: impl Into<String>,
        variant: PipelineVariant,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: BookId::new(),
            user_id,
            title: title.into(),
            author: None,
            original_filename: original_filename.into(),
            page_count: None,
            original_word_count: None,
            variant,
            status: BookStatus::Uploaded,
            current_step: None,
            progress: 0,
            error: None,
            processing_started_at: None,
            processing_completed_at: None,
            total_chunks: None,
            total_chapters: None,
            density_score: None,
            recommended_compression: None,
            extraction_method: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A contiguous text segment of a book (claims pipeline).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: RecordId,
    pub book_id: BookId,
    /// Dense, unique per book.
    pub order: u32,
    pub text: String,
    pub token_count: u32,
    pub created_at: DateTime<Utc>,
}

impl Chunk {
    pub fn new(book_id: BookId, order: u32, text: impl Into<String>, token_count: u32) -> Self {
        Self {
            id: RecordId::new(),
            book_id,
            order,
            text: text.into(),
            token_count,
            created_at: Utc::now(),
        }
    }
}

/// A detected structural unit of a book (chapters pipeline).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    pub id: RecordId,
    pub book_id: BookId,
    pub order: u32,
    pub title: String,
    /// Heading level, 1–3.
    pub level: u8,
    pub original_content: String,
    pub original_token_count: u32,
    pub compressed_content: Option<String>,
    pub key_insights: Option<Vec<String>>,
    pub compressed_token_count: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chapter {
    pub fn new(
        book_id: BookId,
        order: u32,
        title: impl Into<String>,
        level: u8,
        original_content: impl Into<String>,
        original_token_count: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RecordId::new(),
            book_id,
            order,
            title: title.into(),
            level,
            original_content: original_content.into(),
            original_token_count,
            compressed_content: None,
            key_insights: None,
            compressed_token_count: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Category of an extracted claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ClaimType {
    Principle,
    Rule,
    Recommendation,
    Constraint,
    Causal,
}

impl ClaimType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimType::Principle => "principle",
            ClaimType::Rule => "rule",
            ClaimType::Recommendation => "recommendation",
            ClaimType::Constraint => "constraint",
            ClaimType::Causal => "causal",
        }
    }
}

impl FromStr for ClaimType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "principle" => Ok(ClaimType::Principle),
            "rule" => Ok(ClaimType::Rule),
            "recommendation" => Ok(ClaimType::Recommendation),
            "constraint" => Ok(ClaimType::Constraint),
            "causal" => Ok(ClaimType::Causal),
            _ => Err(format!("unknown claim type: {}", s)),
        }
    }
}

/// Value label assigned by the filtering stage. A claim is *kept* iff the
/// label is `CoreInsight` or `SupportingInsight`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ClaimLabel {
    CoreInsight,
    SupportingInsight,
    Redundant,
    Filler,
}

impl ClaimLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimLabel::CoreInsight => "core_insight",
            ClaimLabel::SupportingInsight => "supporting_insight",
            ClaimLabel::Redundant => "redundant",
            ClaimLabel::Filler => "filler",
        }
    }

    pub fn is_kept(&self) -> bool {
        matches!(self, ClaimLabel::CoreInsight | ClaimLabel::SupportingInsight)
    }
}

impl FromStr for ClaimLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "core_insight" => Ok(ClaimLabel::CoreInsight),
            "supporting_insight" => Ok(ClaimLabel::SupportingInsight),
            "redundant" => Ok(ClaimLabel::Redundant),
            "filler" => Ok(ClaimLabel::Filler),
            _ => Err(format!("unknown claim label: {}", s)),
        }
    }
}

/// An atomic assertion extracted from a chunk.
///
/// Invariant: a claim with a label also has a score and a reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub id: RecordId,
    pub book_id: BookId,
    pub chunk_id: RecordId,
    pub text: String,
    pub claim_type: ClaimType,
    pub label: Option<ClaimLabel>,
    /// In [0, 1] once filtered.
    pub score: Option<f64>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Claim {
    pub fn new(
        book_id: BookId,
        chunk_id: RecordId,
        text: impl Into<String>,
        claim_type: ClaimType,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RecordId::new(),
            book_id,
            chunk_id,
            text: text.into(),
            claim_type,
            label: None,
            score: None,
            reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True once the filtering stage has assigned a label.
    pub fn is_filtered(&self) -> bool {
        self.label.is_some()
    }

    pub fn is_kept(&self) -> bool {
        self.label.map(|l| l.is_kept()).unwrap_or(false)
    }
}

/// Why an example was attached to an idea.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExampleReason {
    ClarifiesApplication,
    RemovesAmbiguity,
}

/// A concrete example attached to an idea.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdeaExample {
    pub text: String,
    pub reason: ExampleReason,
}

/// A cluster of claims representing one decision-changing insight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Idea {
    pub id: RecordId,
    pub book_id: BookId,
    pub order: u32,
    pub title: String,
    pub merged_claims: Vec<String>,
    pub principle: Option<String>,
    pub behavior_delta: Option<String>,
    pub examples: Option<Vec<IdeaExample>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Idea {
    pub fn new(
        book_id: BookId,
        order: u32,
        title: impl Into<String>,
        merged_claims: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RecordId::new(),
            book_id,
            order,
            title: title.into(),
            merged_claims,
            principle: None,
            behavior_delta: None,
            examples: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The reconstructed markdown. At most one per book (upserted).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalOutput {
    pub book_id: BookId,
    pub markdown: String,
    pub word_count: u64,
    /// Idea count for the claims pipeline, chapter count for chapters.
    pub unit_count: u32,
    /// output_words / original_words, when the original count is known.
    pub compression_ratio: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FinalOutput {
    pub fn new(book_id: BookId, markdown: impl Into<String>, unit_count: u32) -> Self {
        let markdown = markdown.into();
        let word_count = word_count(&markdown);
        let now = Utc::now();
        Self {
            book_id,
            markdown,
            word_count,
            unit_count,
            compression_ratio: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_compression_against(mut self, original_word_count: Option<u64>) -> Self {
        if let Some(original) = original_word_count {
            if original > 0 {
                self.compression_ratio = Some(self.word_count as f64 / original as f64);
            }
        }
        self
    }
}

/// Word count as used everywhere in the system: whitespace split.
pub fn word_count(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrips_through_strings() {
        for status in [
            BookStatus::Uploaded,
            BookStatus::ExtractingClaims,
            BookStatus::FilteringClaims,
            BookStatus::ClusteringIdeas,
            BookStatus::Reconstructing,
            BookStatus::CompressingChapters,
            BookStatus::Assembling,
            BookStatus::Completed,
            BookStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<BookStatus>().unwrap(), status);
        }
    }

    #[test]
    fn step_phrase_replaces_underscores() {
        assert_eq!(
            BookStatus::ExtractingClaims.step_phrase(),
            "extracting claims"
        );
        assert_eq!(
            BookStatus::CompressingChapters.step_phrase(),
            "compressing chapters"
        );
    }

    #[test]
    fn claims_pipeline_ranks_are_strictly_increasing() {
        let run = [
            BookStatus::Uploaded,
            BookStatus::ExtractingClaims,
            BookStatus::FilteringClaims,
            BookStatus::ClusteringIdeas,
            BookStatus::Reconstructing,
            BookStatus::Completed,
        ];
        for pair in run.windows(2) {
            assert!(pair[0].rank() < pair[1].rank());
        }
    }

    #[test]
    fn kept_labels() {
        assert!(ClaimLabel::CoreInsight.is_kept());
        assert!(ClaimLabel::SupportingInsight.is_kept());
        assert!(!ClaimLabel::Redundant.is_kept());
        assert!(!ClaimLabel::Filler.is_kept());
    }

    #[test]
    fn claim_filtered_iff_labeled() {
        let mut claim = Claim::new(
            BookId::new(),
            RecordId::new(),
            "deep work compounds",
            ClaimType::Principle,
        );
        assert!(!claim.is_filtered());
        claim.label = Some(ClaimLabel::Filler);
        assert!(claim.is_filtered());
        assert!(!claim.is_kept());
    }

    #[test]
    fn word_count_is_whitespace_split() {
        assert_eq!(word_count("one  two\nthree\t four"), 4);
        assert_eq!(word_count(""), 0);
        assert_eq!(word_count("   "), 0);
    }

    #[test]
    fn final_output_compression_ratio() {
        let output = FinalOutput::new(BookId::new(), "five words of final text", 3)
            .with_compression_against(Some(50));
        assert_eq!(output.word_count, 5);
        assert_eq!(output.compression_ratio, Some(0.1));
        let no_original = FinalOutput::new(BookId::new(), "x", 1).with_compression_against(None);
        assert_eq!(no_original.compression_ratio, None);
    }
}

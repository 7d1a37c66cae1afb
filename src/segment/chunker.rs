//! Token-budgeted chunker for the claims pipeline
//!
//! Accumulates paragraphs into chunks of `min_tokens..max_tokens`, sentence-
//! splitting paragraphs that alone exceed the budget, emitting early on
//! natural break phrases, and merging an undersized trailing chunk back into
//! its predecessor when the combined size stays within 1.2 × max.

use super::estimate_tokens;
use regex::Regex;
use std::sync::OnceLock;

/// Chunker budget, in estimated tokens.
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    pub min_tokens: u32,
    pub max_tokens: u32,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_tokens: 800,
            max_tokens: 1500,
        }
    }
}

/// One emitted chunk; order is the position in the returned list.
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    pub text: String,
    pub token_count: u32,
}

/// Phrases that mark a natural break; a chunk inside the acceptable window
/// ends early when its latest paragraph contains one.
const BREAK_PHRASES: &[&str] = &[
    "in conclusion",
    "to summarize",
    "to sum up",
    "in summary",
    "the key takeaway",
    "moving on",
];

fn paragraph_splitter() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n{2,}").expect("paragraph splitter regex"))
}

/// Sentence boundary: sentence-ending punctuation (with optional closing
/// quotes/brackets), whitespace, then an uppercase letter. English-biased;
/// other languages just produce larger or smaller chunks.
fn sentence_boundary() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"[.!?]["')\]]*\s+[A-Z]"#).expect("sentence boundary regex"))
}

/// Split cleaned book text into token-budgeted chunks.
pub fn chunk_text(text: &str, config: &ChunkerConfig) -> Vec<TextChunk> {
    let units = segmentation_units(text, config.max_tokens);

    let mut chunks: Vec<TextChunk> = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_tokens: u32 = 0;

    for unit in units {
        let unit_tokens = estimate_tokens(unit);

        if !current.is_empty()
            && current_tokens + unit_tokens > config.max_tokens
            && current_tokens >= config.min_tokens
        {
            chunks.push(emit(&current, current_tokens));
            current.clear();
            current_tokens = 0;
        }

        current.push(unit);
        current_tokens += unit_tokens;

        if current_tokens >= config.min_tokens
            && current_tokens <= config.max_tokens
            && has_break_phrase(unit)
        {
            chunks.push(emit(&current, current_tokens));
            current.clear();
            current_tokens = 0;
        }
    }

    if !current.is_empty() {
        chunks.push(emit(&current, current_tokens));
    }

    merge_short_tail(&mut chunks, config);
    chunks
}

/// Paragraphs, with any paragraph alone exceeding the budget replaced by its
/// sentences.
fn segmentation_units<'a>(text: &'a str, max_tokens: u32) -> Vec<&'a str> {
    let mut units = Vec::new();
    for paragraph in paragraph_splitter().split(text) {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }
        if estimate_tokens(paragraph) > max_tokens {
            units.extend(split_sentences(paragraph));
        } else {
            units.push(paragraph);
        }
    }
    units
}

/// Split a paragraph at sentence boundaries. The boundary match ends on the
/// first letter of the next sentence, so the split point is just before it.
fn split_sentences(paragraph: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    for m in sentence_boundary().find_iter(paragraph) {
        // Last byte of the match is the uppercase letter starting the next
        // sentence (ASCII, one byte).
        let split_at = m.end() - 1;
        let sentence = paragraph[start..split_at].trim();
        if !sentence.is_empty() {
            sentences.push(sentence);
        }
        start = split_at;
    }
    let tail = paragraph[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

fn has_break_phrase(unit: &str) -> bool {
    let lowered = unit.to_lowercase();
    BREAK_PHRASES.iter().any(|phrase| lowered.contains(phrase))
}

fn emit(units: &[&str], token_count: u32) -> TextChunk {
    TextChunk {
        text: units.join("\n\n"),
        token_count,
    }
}

/// Merge an undersized trailing chunk into the previous one when the merged
/// size stays within 1.2 × max.
fn merge_short_tail(chunks: &mut Vec<TextChunk>, config: &ChunkerConfig) {
    if chunks.len() < 2 {
        return;
    }
    let last = &chunks[chunks.len() - 1];
    let previous = &chunks[chunks.len() - 2];
    if last.token_count < config.min_tokens
        && (previous.token_count + last.token_count) as f64 <= 1.2 * config.max_tokens as f64
    {
        let last = chunks.pop().expect("len checked above");
        let previous = chunks.last_mut().expect("len checked above");
        previous.text.push_str("\n\n");
        previous.text.push_str(&last.text);
        previous.token_count += last.token_count;
    }
}

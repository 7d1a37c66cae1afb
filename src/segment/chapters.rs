//! Chapter extraction for the chapters pipeline
//!
//! Three methods, tried in priority order:
//!
//! 1. TOC-guided — fuzzy-match detected TOC titles back into body text
//! 2. Regex — heading pattern families over a line scan
//! 3. Artificial — greedy packing into fixed-size sections
//!
//! Oversized chapters are split into "(Part k)" sub-chapters after any
//! method, so downstream compression calls stay within budget.

use super::estimate_tokens;
use crate::analysis::{TocDetection, TocEntry};
use crate::model::ExtractionMethod;
use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, info};

/// Chapters above this estimated token count are split before compression.
pub const MAX_CHAPTER_TOKENS: u32 = 6000;

/// Target size for artificially packed sections.
const ARTIFICIAL_CHAPTER_TOKENS: u32 = 3000;

/// Minimum body length for a TOC-matched chapter to count.
const MIN_TOC_BODY_CHARS: usize = 100;

/// A chapter before persistence: title, level, and the body slice.
#[derive(Debug, Clone)]
pub struct RawChapter {
    pub title: String,
    /// 1–3.
    pub level: u8,
    pub content: String,
    pub token_count: u32,
}

impl RawChapter {
    fn new(title: impl Into<String>, level: u8, content: impl Into<String>) -> Self {
        let content = content.into();
        let token_count = estimate_tokens(&content);
        Self {
            title: title.into(),
            level,
            content,
            token_count,
        }
    }
}

/// Extraction outcome.
#[derive(Debug)]
pub struct ExtractedChapters {
    pub chapters: Vec<RawChapter>,
    pub has_detected_structure: bool,
    pub method: ExtractionMethod,
}

/// Chapter extractor over cleaned book text.
pub struct ChapterExtractor;

impl ChapterExtractor {
    /// Extract chapters, preferring TOC guidance when the detection is
    /// reliable, then heading regexes, then artificial packing.
    pub fn extract(text: &str, toc: Option<&TocDetection>) -> ExtractedChapters {
        if let Some(toc) = toc.filter(|t| t.is_reliable()) {
            if let Some(chapters) = extract_by_toc(text, &toc.entries) {
                info!(chapters = chapters.len(), "chapters extracted via TOC");
                return finish(chapters, true, ExtractionMethod::Toc);
            }
            debug!("TOC detection unreliable against body text, falling through");
        }

        if let Some(chapters) = extract_by_regex(text) {
            info!(chapters = chapters.len(), "chapters extracted via heading patterns");
            return finish(chapters, true, ExtractionMethod::Regex);
        }

        let chapters = extract_artificial(text);
        info!(chapters = chapters.len(), "no structure detected, packed artificially");
        finish(chapters, false, ExtractionMethod::Artificial)
    }
}

fn finish(
    chapters: Vec<RawChapter>,
    has_detected_structure: bool,
    method: ExtractionMethod,
) -> ExtractedChapters {
    let chapters = chapters
        .into_iter()
        .flat_map(|c| split_large_chapter(c, MAX_CHAPTER_TOKENS))
        .collect();
    ExtractedChapters {
        chapters,
        has_detected_structure,
        method,
    }
}

// ---------------------------------------------------------------------------
// Method 1: TOC-guided
// ---------------------------------------------------------------------------

/// Match each level ≤ 2 TOC entry forward into the text and slice bodies
/// between consecutive matches. Returns None when fewer than half the
/// entries match or fewer than 3 chapters resolve.
fn extract_by_toc(text: &str, entries: &[TocEntry]) -> Option<Vec<RawChapter>> {
    let chapter_entries: Vec<&TocEntry> = entries.iter().filter(|e| e.level <= 2).collect();
    if chapter_entries.is_empty() {
        return None;
    }

    let mut matches: Vec<(usize, &TocEntry)> = Vec::new();
    let mut search_from = 0usize;
    for entry in &chapter_entries {
        if let Some(offset) = fuzzy_match_title(text, &entry.normalized_title, search_from) {
            matches.push((offset, entry));
            // Advance past the matched line's first character (UTF-8 safe).
            let step = text[offset..].chars().next().map(char::len_utf8).unwrap_or(1);
            search_from = offset + step;
        }
    }

    let match_rate = matches.len() as f64 / chapter_entries.len() as f64;
    if match_rate < 0.5 {
        return None;
    }

    let mut chapters = Vec::new();
    for (i, (offset, entry)) in matches.iter().enumerate() {
        let end = matches
            .get(i + 1)
            .map(|(next, _)| *next)
            .unwrap_or(text.len());
        let body = text[*offset..end].trim();
        if body.len() > MIN_TOC_BODY_CHARS {
            let title = if entry.title.trim().is_empty() {
                entry.normalized_title.clone()
            } else {
                entry.title.clone()
            };
            chapters.push(RawChapter::new(title, entry.level, body));
        }
    }

    if chapters.len() < 3 {
        return None;
    }
    Some(chapters)
}

/// Find a TOC title in body text, searching forward from `start_from`.
///
/// Escalates: exact normalized line match → prefix-augmented match
/// ("chapter N:", "part N:", "N.") → word-overlap heuristic (≥ 70% of the
/// title's tokens longer than 3 chars present in one line under 150 chars).
/// Returns the byte offset of the matched line.
pub fn fuzzy_match_title(text: &str, normalized_title: &str, start_from: usize) -> Option<usize> {
    let target = normalize_title(normalized_title);
    if target.is_empty() || start_from >= text.len() {
        return None;
    }
    let mut start_from = start_from;
    while start_from < text.len() && !text.is_char_boundary(start_from) {
        start_from += 1;
    }
    let region = &text[start_from..];

    // Pass 1: exact normalized match.
    for (offset, line) in lines_with_offsets(region) {
        if normalize_title(line) == target {
            return Some(start_from + offset);
        }
    }

    // Pass 2: the line is the title behind a chapter/part/section prefix.
    for (offset, line) in lines_with_offsets(region) {
        if let Some(rest) = strip_heading_prefix(line) {
            if normalize_title(rest) == target {
                return Some(start_from + offset);
            }
        }
    }

    // Pass 3: word overlap.
    let title_words: Vec<&str> = target.split_whitespace().filter(|w| w.len() > 3).collect();
    if title_words.is_empty() {
        return None;
    }
    for (offset, line) in lines_with_offsets(region) {
        if line.len() >= 150 {
            continue;
        }
        let line_norm = normalize_title(line);
        let present = title_words
            .iter()
            .filter(|w| line_norm.contains(*w))
            .count();
        if present as f64 / title_words.len() as f64 >= 0.7 {
            return Some(start_from + offset);
        }
    }
    None
}

fn lines_with_offsets(text: &str) -> impl Iterator<Item = (usize, &str)> {
    let mut offset = 0;
    text.lines().map(move |line| {
        let this_offset = offset;
        offset += line.len() + 1;
        (this_offset, line.trim())
    })
}

fn normalize_title(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn heading_prefix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(?:(?:chapter|part|section)\s+(?:\d+|[ivxlc]+)|\d{1,3})\s*[:.\-]?\s*")
            .expect("heading prefix regex")
    })
}

fn strip_heading_prefix(line: &str) -> Option<&str> {
    let m = heading_prefix().find(line.trim())?;
    if m.start() != 0 || m.end() == 0 {
        return None;
    }
    Some(&line.trim()[m.end()..])
}

// ---------------------------------------------------------------------------
// Method 2: regex heading families
// ---------------------------------------------------------------------------

fn chapter_heading() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(?:chapter|part|section)\s+(?:\d+|[ivxlc]+)\s*[:.\-]?\s*(.*)$|^(\d{1,3})\.\s+(\S.*)$")
            .expect("chapter heading regex")
    })
}

fn all_caps_heading() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z][A-Z0-9 ,:'\-]{2,79}$").expect("all caps regex"))
}

fn title_case_heading() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:[A-Z][a-zA-Z'\-]*)(?:\s+(?:[A-Z][a-zA-Z'\-]*|of|the|and|in|to|a|an|for)){1,9}$")
            .expect("title case regex")
    })
}

#[derive(Debug, PartialEq)]
enum HeadingKind {
    Chapter, // level 1
    Caps,    // level 2
    Title,   // level 3, inlined
}

fn classify_line(line: &str) -> Option<(HeadingKind, String)> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.len() > 120 {
        return None;
    }
    if let Some(captures) = chapter_heading().captures(trimmed) {
        let title = captures
            .get(1)
            .or_else(|| captures.get(3))
            .map(|m| m.as_str().trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| trimmed.to_string());
        return Some((HeadingKind::Chapter, title));
    }
    if all_caps_heading().is_match(trimmed) && trimmed.chars().any(|c| c.is_alphabetic()) {
        return Some((HeadingKind::Caps, trimmed.to_string()));
    }
    if title_case_heading().is_match(trimmed) {
        return Some((HeadingKind::Title, trimmed.to_string()));
    }
    None
}

/// Line-by-line scan. Chapter and ALL-CAPS headings start new chapters;
/// Title-Case headings become inline `###` markers. Requires at least 3
/// chapter-starting headings to succeed.
fn extract_by_regex(text: &str) -> Option<Vec<RawChapter>> {
    let mut chapters: Vec<(String, u8, Vec<String>)> = Vec::new();
    let mut preamble: Vec<&str> = Vec::new();
    let mut heading_count = 0usize;

    for line in text.lines() {
        match classify_line(line) {
            Some((HeadingKind::Chapter, title)) => {
                heading_count += 1;
                chapters.push((title, 1, Vec::new()));
            }
            Some((HeadingKind::Caps, title)) => {
                heading_count += 1;
                chapters.push((title, 2, Vec::new()));
            }
            Some((HeadingKind::Title, title)) if !chapters.is_empty() => {
                if let Some(current) = chapters.last_mut() {
                    current.2.push(format!("### {}", title));
                }
            }
            _ => match chapters.last_mut() {
                Some(current) => current.2.push(line.to_string()),
                None => preamble.push(line),
            },
        }
    }

    if heading_count < 3 {
        return None;
    }

    let mut raw: Vec<RawChapter> = Vec::new();
    let preamble_text = preamble.join("\n");
    if preamble_text.trim().len() > MIN_TOC_BODY_CHARS {
        raw.push(RawChapter::new("Introduction", 1, preamble_text.trim()));
    }
    for (title, level, lines) in chapters {
        let body = lines.join("\n");
        let body = body.trim();
        if !body.is_empty() {
            raw.push(RawChapter::new(title, level, body));
        }
    }

    if raw.len() < 3 {
        return None;
    }
    Some(raw)
}

// ---------------------------------------------------------------------------
// Method 3: artificial packing
// ---------------------------------------------------------------------------

/// Greedy-pack paragraphs into sections of roughly 3000 tokens.
fn extract_artificial(text: &str) -> Vec<RawChapter> {
    let mut chapters = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_tokens = 0u32;

    for paragraph in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        let tokens = estimate_tokens(paragraph);
        if !current.is_empty() && current_tokens + tokens > ARTIFICIAL_CHAPTER_TOKENS {
            chapters.push((chapters.len() + 1, current.join("\n\n")));
            current = Vec::new();
            current_tokens = 0;
        }
        current.push(paragraph);
        current_tokens += tokens;
    }
    if !current.is_empty() {
        chapters.push((chapters.len() + 1, current.join("\n\n")));
    }

    chapters
        .into_iter()
        .map(|(n, body)| RawChapter::new(format!("Section {}", n), 1, body))
        .collect()
}

// ---------------------------------------------------------------------------
// Oversize splitting
// ---------------------------------------------------------------------------

/// Split a chapter exceeding `max_tokens` into "(Part k)" sub-chapters, each
/// within the budget. Chapters within budget pass through unchanged.
pub fn split_large_chapter(chapter: RawChapter, max_tokens: u32) -> Vec<RawChapter> {
    if chapter.token_count <= max_tokens {
        return vec![chapter];
    }

    // Paragraph units; a paragraph alone exceeding the budget is hard-split
    // on character boundaries so every part honors the cap.
    let max_chars = max_tokens as usize * 4;
    let mut units: Vec<String> = Vec::new();
    for paragraph in chapter
        .content
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
    {
        if estimate_tokens(paragraph) > max_tokens {
            let chars: Vec<char> = paragraph.chars().collect();
            for piece in chars.chunks(max_chars) {
                units.push(piece.iter().collect());
            }
        } else {
            units.push(paragraph.to_string());
        }
    }

    let mut parts: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_tokens = 0u32;
    for unit in units {
        let tokens = estimate_tokens(&unit);
        if !current.is_empty() && current_tokens + tokens > max_tokens {
            parts.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(&unit);
        current_tokens += tokens;
    }
    if !current.is_empty() {
        parts.push(current);
    }

    parts
        .into_iter()
        .enumerate()
        .map(|(i, body)| {
            RawChapter::new(
                format!("{} (Part {})", chapter.title, i + 1),
                chapter.level,
                body,
            )
        })
        .collect()
}

//! Prompt builders for every LLM call site
//!
//! Kept in one place so the wording that drives extraction quality can be
//! tuned without touching stage logic. Structured calls get their JSON-shape
//! hint appended by the client; these builders only produce the task text.

use crate::model::{Claim, Idea};

/// S1 — extract atomic claims from one chunk.
pub fn claim_extraction(chunk_text: &str) -> String {
    format!(
        "Extract every atomic claim from this book excerpt. A claim is a single, \
         context-free assertion a reader could act on: a principle, a rule, a \
         recommendation, a constraint, or a causal statement. Do not extract \
         anecdotes, examples, or transitions. Type each claim.\n\n{}",
        chunk_text
    )
}

/// S2 — evaluate one batch of claims.
pub fn claim_filter(batch: &[Claim]) -> String {
    let listed = batch
        .iter()
        .map(|c| format!("- {}", c.text))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Evaluate each claim below for decision-changing value. Label it \
         core_insight (changes decisions or introduces a real constraint), \
         supporting_insight (sharpens a core insight), redundant (repeats \
         another claim), or filler (no decision value). Score 0-1 and give a \
         one-line reason. Echo each claim text exactly as given.\n\n{}",
        listed
    )
}

/// S3 — cluster kept claims into ideas.
pub fn cluster_ideas(kept: &[Claim]) -> String {
    let listed = kept
        .iter()
        .map(|c| format!("- {}", c.text))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Cluster these claims into the smallest set of distinct, \
         decision-changing ideas. Merge claims that express the same \
         underlying decision rule. Aim for 7-12 final ideas at most; if the \
         material is thin, collapse further rather than padding. For each \
         idea give a title, the merged claim texts, and a one-line summary.\n\n{}",
        listed
    )
}

/// S4 — expand one idea cluster into principle + behavior delta.
pub fn expand_idea(title: &str, merged_claims: &[String]) -> String {
    let listed = merged_claims
        .iter()
        .map(|c| format!("- {}", c))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Idea: {}\n\nClaims in this cluster:\n{}\n\nWrite the idea's core \
         principle (2-4 sentences, assertive, no hedging) and its behavior \
         delta: how it should change the reader's decisions, prioritization, \
         and scheduling, concretely.",
        title, listed
    )
}

/// S5 — reconstruct the final document from expanded ideas.
pub fn reconstruct(book_title: &str, ideas: &[Idea]) -> String {
    let mut sections = String::new();
    for (i, idea) in ideas.iter().enumerate() {
        sections.push_str(&format!("Idea {}: {}\n", i + 1, idea.title));
        if let Some(ref principle) = idea.principle {
            sections.push_str(&format!("Principle: {}\n", principle));
        }
        if let Some(ref delta) = idea.behavior_delta {
            sections.push_str(&format!("Behavior delta: {}\n", delta));
        }
        for claim in &idea.merged_claims {
            sections.push_str(&format!("- {}\n", claim));
        }
        sections.push('\n');
    }
    format!(
        "Reconstruct \"{}\" as a dense idea-centered document from the \
         expanded ideas below. Structure, exactly:\n\
         - a 2-3 sentence introduction\n\
         - for each idea, in order: \"## Idea N: <Title>\" with subsections \
         \"### Core Principle\" and \"### What This Changes\", plus \
         \"### Best Example\" only when a concrete example genuinely \
         clarifies application\n\
         - a horizontal rule (---) between ideas\n\
         Write in markdown. No front matter, no preamble about the task.\n\n{}",
        book_title, sections
    )
}

/// C1 — compress one chapter.
pub fn compress_chapter(
    book_title: &str,
    chapter_title: &str,
    is_first: bool,
    recommended_compression: Option<f64>,
    content: &str,
) -> String {
    let ratio_line = match recommended_compression {
        Some(ratio) => format!(
            "Target roughly {:.0}% of the original length.",
            ratio * 100.0
        ),
        None => "Target roughly a third of the original length.".to_string(),
    };
    let hook_line = if is_first {
        "This is the opening chapter: keep the hook that frames the whole book."
    } else {
        "Open directly with the chapter's substance; no re-introduction of the book."
    };
    format!(
        "Compress this chapter of \"{}\" titled \"{}\". Preserve every \
         argument, framework, and actionable insight; drop anecdotes that \
         only restate a point already made. {} {}\nAlso list the chapter's \
         key insights.\n\n{}",
        book_title, chapter_title, ratio_line, hook_line, content
    )
}

/// C2 — assemble compressed chapters into the final document.
pub fn assemble_book(book_title: &str, chapters: &[(String, String)]) -> String {
    let mut listed = String::new();
    for (title, compressed) in chapters {
        listed.push_str(&format!("## {}\n\n{}\n\n", title, compressed));
    }
    format!(
        "Assemble the final condensed edition of \"{}\". Begin with a short \
         overview of the book's arc, then include each chapter below verbatim \
         — do not rewrite, reorder, or re-compress chapter bodies — and end \
         with a \"Key Takeaways\" section synthesizing the most \
         decision-relevant insights across chapters. Write in markdown.\n\n{}",
        book_title, listed
    )
}

//! LLM-backed document analysis
//!
//! Small structured calls that inform segmentation and compression: TOC
//! detection over the opening pages, and density scoring over a
//! representative sample.

mod density;
mod toc;

pub use density::{DensityAnalysis, DensityAnalyzer};
pub use toc::{TocConfidence, TocDetection, TocDetector, TocEntry};

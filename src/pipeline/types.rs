//! Shared types for the content pipeline.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ── Processed content ───────────────────────────────────────────────

/// Result of processing one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedContent {
    pub title: String,
    /// Markdown, or the raw input when `fallback` is set.
    pub converted_content: String,
    /// Size of the raw input in bytes.
    pub size: usize,
    /// Absolute, de-duplicated http(s) links found in the page.
    pub links: Vec<String>,
    pub metadata: ContentMetadata,
    pub duration: Duration,
    /// Conversion failed and `converted_content` holds the raw input.
    pub fallback: bool,
    pub fallback_reason: Option<String>,
}

/// Page metadata gathered during processing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentMetadata {
    pub description: Option<String>,
    pub keywords: Vec<String>,
    pub language: Option<String>,
    pub author: Option<String>,
    pub canonical_url: Option<String>,
    /// `og:*` properties.
    pub open_graph: BTreeMap<String, String>,
    /// `twitter:*` properties.
    pub twitter_card: BTreeMap<String, String>,
    pub text_length: usize,
    pub word_count: usize,
    pub heading_count: usize,
    pub paragraph_count: usize,
    pub link_count: usize,
    pub image_count: usize,
}

// ── Link filtering ──────────────────────────────────────────────────

/// Outcome of filtering discovered links.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkFilterResult {
    /// Links that passed, in input order, without duplicates.
    pub filtered: Vec<String>,
    /// Links given to the filter.
    pub found: usize,
    pub filtered_count: usize,
    pub excluded_count: usize,
    /// One entry per excluded link.
    pub reasons: Vec<String>,
    /// Kept links that matched an include pattern.
    pub include_matches: usize,
    /// Links rejected by an exclude pattern.
    pub exclude_matches: usize,
    pub duplicates_removed: usize,
}

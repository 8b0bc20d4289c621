//! Content pipeline.
//!
//! Every fetched page flows through:
//! 1. `process_content()`: HTML → title, Markdown, metadata and links
//! 2. `LinkFilter::filter()`: include/exclude regexes on discovered links
//!
//! Both are pure functions: malformed input degrades to a fallback result,
//! it never panics or errors.

pub mod links;
pub mod processor;
pub mod rules;
pub mod types;

pub use links::{extract_links, normalize_link};
pub use processor::process_content;
pub use rules::{LinkFilter, filter_links};
pub use types::{ContentMetadata, LinkFilterResult, ProcessedContent};

//! Include/exclude link rules.
//!
//! A link passes iff it matches at least one include pattern (or there are
//! none) and no exclude pattern. Exclude patterns are checked first so the
//! recorded reason names the rule that actually rejected the link.

use std::collections::HashSet;

use regex::Regex;
use tracing::debug;

use crate::error::PipelineError;
use crate::pipeline::types::LinkFilterResult;

/// A compiled pattern and its source text.
#[derive(Debug, Clone)]
struct LinkRule {
    pattern: String,
    regex: Regex,
}

impl LinkRule {
    fn compile(pattern: &str) -> Result<Self, PipelineError> {
        let regex = Regex::new(pattern).map_err(|e| PipelineError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }
}

/// Compiled link filter.
#[derive(Debug, Clone)]
pub struct LinkFilter {
    include: Vec<LinkRule>,
    exclude: Vec<LinkRule>,
}

impl LinkFilter {
    /// Compile include and exclude regexes. Blank patterns are ignored.
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self, PipelineError> {
        let compile = |patterns: &[String]| -> Result<Vec<LinkRule>, PipelineError> {
            patterns
                .iter()
                .map(|p| p.trim())
                .filter(|p| !p.is_empty())
                .map(LinkRule::compile)
                .collect()
        };
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    /// Filter that accepts everything.
    pub fn allow_all() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }

    /// `Ok(matched_include)` when the link passes, otherwise the reason.
    fn check(&self, link: &str) -> Result<bool, (String, bool)> {
        if let Some(rule) = self.exclude.iter().find(|r| r.regex.is_match(link)) {
            return Err((format!("excluded by pattern '{}': {link}", rule.pattern), true));
        }
        if self.include.is_empty() {
            return Ok(false);
        }
        if self.include.iter().any(|r| r.regex.is_match(link)) {
            Ok(true)
        } else {
            Err((format!("no include pattern matched: {link}"), false))
        }
    }

    /// Whether a single link passes.
    pub fn allows(&self, link: &str) -> bool {
        self.check(link).is_ok()
    }

    /// Filter a batch of links. Applying the filter to its own output
    /// returns the same output.
    pub fn filter(&self, links: &[String]) -> LinkFilterResult {
        let mut result = LinkFilterResult {
            found: links.len(),
            ..Default::default()
        };
        let mut seen = HashSet::new();

        for link in links {
            if !seen.insert(link.as_str()) {
                result.duplicates_removed += 1;
                continue;
            }
            match self.check(link) {
                Ok(matched_include) => {
                    if matched_include {
                        result.include_matches += 1;
                    }
                    result.filtered.push(link.clone());
                }
                Err((reason, by_exclude)) => {
                    if by_exclude {
                        result.exclude_matches += 1;
                    }
                    result.excluded_count += 1;
                    result.reasons.push(reason);
                }
            }
        }
        result.filtered_count = result.filtered.len();

        debug!(
            found = result.found,
            kept = result.filtered_count,
            excluded = result.excluded_count,
            duplicates = result.duplicates_removed,
            "Links filtered"
        );
        result
    }
}

/// Compile and apply a filter in one step.
pub fn filter_links(
    links: &[String],
    include: &[String],
    exclude: &[String],
) -> Result<LinkFilterResult, PipelineError> {
    Ok(LinkFilter::new(include, exclude)?.filter(links))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn links(urls: &[&str]) -> Vec<String> {
        urls.iter().map(|s| s.to_string()).collect()
    }

    fn patterns(p: &[&str]) -> Vec<String> {
        p.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_include_set_accepts_everything_not_excluded() {
        let result = filter_links(
            &links(&["https://a.com/x", "https://a.com/admin/y"]),
            &[],
            &patterns(&["/admin/"]),
        )
        .unwrap();
        assert_eq!(result.filtered, vec!["https://a.com/x"]);
        assert_eq!(result.excluded_count, 1);
        assert_eq!(result.exclude_matches, 1);
        assert_eq!(result.include_matches, 0);
        assert!(result.reasons[0].contains("/admin/"));
    }

    #[test]
    fn include_requires_a_match() {
        let result = filter_links(
            &links(&[
                "https://a.com/docs/1",
                "https://a.com/blog/2",
                "https://a.com/docs/3",
            ]),
            &patterns(&["/docs/"]),
            &[],
        )
        .unwrap();
        assert_eq!(result.found, 3);
        assert_eq!(result.filtered_count, 2);
        assert_eq!(result.include_matches, 2);
        assert_eq!(result.excluded_count, 1);
        assert!(result.reasons[0].starts_with("no include pattern matched"));
    }

    #[test]
    fn exclude_wins_over_include() {
        let filter = LinkFilter::new(&patterns(&["docs"]), &patterns(&[r"\.pdf$"])).unwrap();
        assert!(filter.allows("https://a.com/docs/page"));
        assert!(!filter.allows("https://a.com/docs/manual.pdf"));
    }

    #[test]
    fn filtering_is_idempotent() {
        let filter = LinkFilter::new(&patterns(&["example"]), &patterns(&["private"])).unwrap();
        let input = links(&[
            "https://example.com/a",
            "https://example.com/private/b",
            "https://other.com/c",
            "https://example.com/a",
            "https://example.com/d",
        ]);

        let once = filter.filter(&input);
        let twice = filter.filter(&once.filtered);
        assert_eq!(once.filtered, twice.filtered);
        assert_eq!(twice.excluded_count, 0);
        assert_eq!(once.duplicates_removed, 1);
    }

    #[test]
    fn invalid_pattern_is_reported() {
        let err = LinkFilter::new(&patterns(&["("]), &[]).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidPattern { pattern, .. } if pattern == "("));
    }

    #[test]
    fn blank_patterns_are_ignored() {
        let filter = LinkFilter::new(&patterns(&["  "]), &patterns(&[""])).unwrap();
        assert!(filter.allows("https://anything.example"));
        assert!(LinkFilter::allow_all().allows("https://x.y"));
    }
}

//! HTML → Markdown content processor.
//!
//! Flow:
//! 1. Parse the document (html5ever never rejects input)
//! 2. Metadata + title from `<head>` and the first heading
//! 3. Main content selection, then Markdown rendering of that subtree
//! 4. Link extraction against the page URL
//!
//! An empty conversion result falls back to the raw input with
//! `fallback` set, so callers always get something to persist.

use std::collections::BTreeMap;
use std::time::Instant;

use scraper::{ElementRef, Html, Node, Selector};
use tracing::debug;
use url::Url;

use crate::pipeline::links::extract_links;
use crate::pipeline::types::{ContentMetadata, ProcessedContent};

/// Candidate containers for the main content, highest priority first.
const MAIN_CONTENT_SELECTORS: &[&str] = &[
    "main",
    "article",
    ".content",
    ".main-content",
    "#content",
    "#main",
    "body",
];

/// Elements whose subtree never contributes to the converted content.
const SKIPPED_TAGS: &[&str] = &[
    "script", "style", "nav", "footer", "aside", "noscript", "head", "template", "iframe", "svg",
];

/// Containers rendered as their own block.
const BLOCK_TAGS: &[&str] = &[
    "div", "section", "article", "main", "header", "figure", "figcaption", "form", "details",
    "summary", "dl", "dt", "dd", "address",
];

const UNTITLED: &str = "Untitled";

/// Elements nested deeper than this are flattened to plain text.
const MAX_RENDER_DEPTH: usize = 128;

/// Convert one fetched page into title, Markdown, metadata and links.
///
/// `source_ref` is the page URL; relative links are resolved against it
/// (or against `<link rel="canonical">` when it is missing).
pub fn process_content(raw: &str, source_ref: Option<&str>) -> ProcessedContent {
    let started = Instant::now();
    let document = Html::parse_document(raw);

    let mut metadata = extract_metadata(&document);
    let title = extract_title(&document);

    let base = source_ref
        .and_then(|s| Url::parse(s).ok())
        .or_else(|| metadata.canonical_url.as_deref().and_then(|s| Url::parse(s).ok()));
    let links = extract_links(&document, base.as_ref());

    let main = select_main_content(&document);
    let converted = main.map(|el| render_markdown(el, 0)).unwrap_or_default();

    if let Some(main) = main {
        metadata.heading_count = count(main, "h1, h2, h3, h4, h5, h6");
        metadata.paragraph_count = count(main, "p");
        metadata.link_count = count(main, "a[href]");
        metadata.image_count = count(main, "img");
    }

    let (converted_content, fallback_reason) = if raw.trim().is_empty() {
        (raw.to_string(), Some("empty input".to_string()))
    } else if converted.is_empty() {
        (raw.to_string(), Some("no readable content".to_string()))
    } else {
        (converted, None)
    };

    metadata.text_length = converted_content.chars().count();
    metadata.word_count = converted_content.split_whitespace().count();

    if let Some(reason) = &fallback_reason {
        debug!(source = source_ref.unwrap_or("-"), reason = %reason, "Content conversion fell back to raw input");
    }

    ProcessedContent {
        title,
        converted_content,
        size: raw.len(),
        links,
        metadata,
        duration: started.elapsed(),
        fallback: fallback_reason.is_some(),
        fallback_reason,
    }
}

// ── Metadata ────────────────────────────────────────────────────────

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

fn count(root: ElementRef<'_>, css: &str) -> usize {
    selector(css).map_or(0, |sel| root.select(&sel).count())
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn first_text(document: &Html, css: &str) -> Option<String> {
    let sel = selector(css)?;
    document
        .select(&sel)
        .map(|el| collapse_whitespace(&el.text().collect::<String>()))
        .find(|text| !text.is_empty())
}

fn extract_metadata(document: &Html) -> ContentMetadata {
    let mut meta = ContentMetadata {
        language: document
            .root_element()
            .value()
            .attr("lang")
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from),
        ..Default::default()
    };

    if let Some(sel) = selector("meta[content]") {
        let mut open_graph = BTreeMap::new();
        let mut twitter_card = BTreeMap::new();

        for el in document.select(&sel) {
            let attrs = el.value();
            let Some(key) = attrs.attr("property").or_else(|| attrs.attr("name")) else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let content = attrs.attr("content").unwrap_or_default().trim().to_string();
            if content.is_empty() {
                continue;
            }

            if let Some(og) = key.strip_prefix("og:") {
                open_graph.entry(og.to_string()).or_insert(content);
            } else if let Some(tw) = key.strip_prefix("twitter:") {
                twitter_card.entry(tw.to_string()).or_insert(content);
            } else {
                match key.as_str() {
                    "description" if meta.description.is_none() => meta.description = Some(content),
                    "author" if meta.author.is_none() => meta.author = Some(content),
                    "keywords" if meta.keywords.is_empty() => {
                        meta.keywords = content
                            .split(',')
                            .map(str::trim)
                            .filter(|k| !k.is_empty())
                            .map(String::from)
                            .collect();
                    }
                    _ => {}
                }
            }
        }

        meta.open_graph = open_graph;
        meta.twitter_card = twitter_card;
    }

    if let Some(sel) = selector(r#"link[rel="canonical"][href]"#) {
        meta.canonical_url = document
            .select(&sel)
            .filter_map(|el| el.value().attr("href"))
            .map(str::trim)
            .find(|href| !href.is_empty())
            .map(String::from);
    }

    meta
}

/// `<title>` → `og:title` → first `<h1>` → `twitter:title` → "Untitled".
fn extract_title(document: &Html) -> String {
    let meta_content = |css: &str| {
        selector(css).and_then(|sel| {
            document
                .select(&sel)
                .filter_map(|el| el.value().attr("content"))
                .map(collapse_whitespace)
                .find(|c| !c.is_empty())
        })
    };

    first_text(document, "title")
        .or_else(|| meta_content(r#"meta[property="og:title"]"#))
        .or_else(|| first_text(document, "h1"))
        .or_else(|| meta_content(r#"meta[name="twitter:title"]"#))
        .unwrap_or_else(|| UNTITLED.to_string())
}

fn select_main_content(document: &Html) -> Option<ElementRef<'_>> {
    for css in MAIN_CONTENT_SELECTORS {
        let Some(sel) = selector(css) else { continue };
        let found = document
            .select(&sel)
            .find(|el| el.text().any(|t| !t.trim().is_empty()));
        if found.is_some() {
            return found;
        }
    }
    None
}

// ── Markdown rendering ──────────────────────────────────────────────

/// Render a subtree to trimmed Markdown. `depth` is the nesting level of
/// `el` within the top-level render.
fn render_markdown(el: ElementRef<'_>, depth: usize) -> String {
    let mut writer = MarkdownWriter {
        out: String::new(),
        depth,
    };
    writer.children(el);
    tidy(&writer.out)
}

struct MarkdownWriter {
    out: String,
    depth: usize,
}

impl MarkdownWriter {
    fn children(&mut self, el: ElementRef<'_>) {
        for child in el.children() {
            match child.value() {
                Node::Text(text) => self.text(text),
                Node::Element(_) => {
                    if let Some(child) = ElementRef::wrap(child) {
                        self.element(child);
                    }
                }
                _ => {}
            }
        }
    }

    fn text(&mut self, text: &str) {
        let collapsed = collapse_whitespace(text);
        let leading = text.starts_with(char::is_whitespace);
        let trailing = text.ends_with(char::is_whitespace);

        if collapsed.is_empty() {
            if leading || trailing {
                self.space();
            }
            return;
        }
        if leading {
            self.space();
        }
        self.out.push_str(&collapsed);
        if trailing {
            self.space();
        }
    }

    fn space(&mut self) {
        if !self.out.is_empty() && !self.out.ends_with([' ', '\n']) {
            self.out.push(' ');
        }
    }

    fn block(&mut self) {
        let trimmed = self.out.trim_end_matches(' ').len();
        self.out.truncate(trimmed);
        if self.out.is_empty() || self.out.ends_with("\n\n") {
            return;
        }
        if self.out.ends_with('\n') {
            self.out.push('\n');
        } else {
            self.out.push_str("\n\n");
        }
    }

    fn push_block(&mut self, content: &str) {
        if content.is_empty() {
            return;
        }
        self.block();
        self.out.push_str(content);
        self.block();
    }

    fn element(&mut self, el: ElementRef<'_>) {
        let name = el.value().name();
        if SKIPPED_TAGS.contains(&name) {
            return;
        }
        if self.depth >= MAX_RENDER_DEPTH {
            // Text iteration walks the tree without recursing.
            let text: String = el.text().collect();
            self.text(&text);
            return;
        }

        self.depth += 1;
        self.markup(el, name);
        self.depth -= 1;
    }

    fn markup(&mut self, el: ElementRef<'_>, name: &str) {
        match name {
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                let level = usize::from(name.as_bytes()[1] - b'0');
                let text = render_markdown(el, self.depth).replace('\n', " ");
                if !text.is_empty() {
                    self.push_block(&format!("{} {text}", "#".repeat(level)));
                }
            }
            "p" => {
                let text = render_markdown(el, self.depth);
                self.push_block(&text);
            }
            "br" => {
                let trimmed = self.out.trim_end_matches(' ').len();
                self.out.truncate(trimmed);
                self.out.push('\n');
            }
            "hr" => self.push_block("---"),
            "strong" | "b" => self.wrap_inline(el, "**"),
            "em" | "i" => self.wrap_inline(el, "*"),
            "code" => {
                let code = collapse_whitespace(&el.text().collect::<String>());
                if !code.is_empty() {
                    self.out.push('`');
                    self.out.push_str(&code);
                    self.out.push('`');
                }
            }
            "pre" => {
                let code: String = el.text().collect();
                let code = code.trim_matches('\n').trim_end();
                if !code.is_empty() {
                    self.push_block(&format!("```\n{code}\n```"));
                }
            }
            "blockquote" => {
                let inner = render_markdown(el, self.depth);
                if !inner.is_empty() {
                    let quoted = inner
                        .lines()
                        .map(|line| if line.is_empty() { ">".to_string() } else { format!("> {line}") })
                        .collect::<Vec<_>>()
                        .join("\n");
                    self.push_block(&quoted);
                }
            }
            "ul" | "ol" => self.list(el, name == "ol"),
            "a" => {
                let text = render_markdown(el, self.depth).replace('\n', " ");
                match el.value().attr("href").map(str::trim).filter(|h| !h.is_empty()) {
                    Some(href) if !text.is_empty() => {
                        self.out.push_str(&format!("[{text}]({href})"));
                    }
                    _ => self.out.push_str(&text),
                }
            }
            "img" => {
                if let Some(src) = el.value().attr("src").map(str::trim).filter(|s| !s.is_empty()) {
                    let alt = el.value().attr("alt").map(collapse_whitespace).unwrap_or_default();
                    self.out.push_str(&format!("![{alt}]({src})"));
                }
            }
            "table" => self.table(el),
            _ if BLOCK_TAGS.contains(&name) => {
                self.block();
                self.children(el);
                self.block();
            }
            _ => self.children(el),
        }
    }

    fn wrap_inline(&mut self, el: ElementRef<'_>, marker: &str) {
        let text = render_markdown(el, self.depth).replace('\n', " ");
        if text.is_empty() {
            return;
        }
        self.out.push_str(marker);
        self.out.push_str(&text);
        self.out.push_str(marker);
    }

    fn list(&mut self, el: ElementRef<'_>, ordered: bool) {
        let mut lines = Vec::new();
        let mut index = 1;
        for item in el.children().filter_map(ElementRef::wrap) {
            if item.value().name() != "li" {
                continue;
            }
            let body = render_markdown(item, self.depth);
            if body.is_empty() {
                continue;
            }
            let bullet = if ordered { format!("{index}.") } else { "-".to_string() };
            index += 1;

            let mut body_lines = body.lines().filter(|l| !l.trim().is_empty());
            if let Some(first) = body_lines.next() {
                lines.push(format!("{bullet} {first}"));
            }
            for rest in body_lines {
                lines.push(format!("  {rest}"));
            }
        }
        if !lines.is_empty() {
            self.push_block(&lines.join("\n"));
        }
    }

    fn table(&mut self, el: ElementRef<'_>) {
        let (Some(row_sel), Some(cell_sel)) = (selector("tr"), selector("th, td")) else {
            return;
        };

        let rows: Vec<Vec<String>> = el
            .select(&row_sel)
            .map(|row| {
                row.select(&cell_sel)
                    .map(|cell| render_markdown(cell, self.depth).replace('\n', " ").replace('|', "\\|"))
                    .collect::<Vec<_>>()
            })
            .filter(|cells| !cells.is_empty())
            .collect();
        let Some(width) = rows.iter().map(Vec::len).max() else {
            return;
        };

        let format_row = |cells: &[String]| {
            let mut padded: Vec<&str> = cells.iter().map(String::as_str).collect();
            padded.resize(width, "");
            format!("| {} |", padded.join(" | "))
        };

        let mut lines = vec![format_row(rows[0].as_slice())];
        lines.push(format!("|{}", " --- |".repeat(width)));
        lines.extend(rows[1..].iter().map(|r| format_row(r.as_slice())));
        self.push_block(&lines.join("\n"));
    }
}

/// Strip trailing spaces per line, collapse runs of blank lines, trim.
fn tidy(markdown: &str) -> String {
    let mut out = String::with_capacity(markdown.len());
    let mut blank_run = 0;
    for line in markdown.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <title> Getting   Started </title>
  <meta name="description" content="How to begin">
  <meta name="keywords" content="rust, crawl , ,docs">
  <meta name="author" content="Docs Team">
  <meta property="og:title" content="OG Title">
  <meta property="og:image" content="https://example.com/og.png">
  <meta name="twitter:card" content="summary">
  <link rel="canonical" href="https://example.com/start">
  <style>body { color: red; }</style>
</head>
<body>
  <nav><a href="/nav-only">Nav</a></nav>
  <main>
    <h1>Welcome</h1>
    <p>Read the <a href="/guide#install">guide</a> and <strong>enjoy</strong>.</p>
    <ul><li>One</li><li>Two</li></ul>
    <pre><code>cargo run</code></pre>
    <img src="/logo.png" alt="Logo">
    <script>alert('x')</script>
  </main>
  <footer>Footer text</footer>
</body>
</html>"#;

    #[test]
    fn converts_main_content_to_markdown() {
        let result = process_content(PAGE, Some("https://example.com/docs/start"));
        assert!(!result.fallback);
        assert_eq!(result.title, "Getting Started");
        assert_eq!(result.size, PAGE.len());

        let md = &result.converted_content;
        assert!(md.starts_with("# Welcome"), "{md}");
        assert!(md.contains("Read the [guide](/guide#install) and **enjoy**."), "{md}");
        assert!(md.contains("- One\n- Two"), "{md}");
        assert!(md.contains("```\ncargo run\n```"), "{md}");
        assert!(md.contains("![Logo](/logo.png)"), "{md}");
        assert!(!md.contains("alert"));
        assert!(!md.contains("Footer text"));
        assert!(!md.contains("Nav"));
        assert!(!md.contains("\n\n\n"));
    }

    #[test]
    fn collects_metadata() {
        let result = process_content(PAGE, Some("https://example.com/docs/start"));
        let meta = &result.metadata;
        assert_eq!(meta.description.as_deref(), Some("How to begin"));
        assert_eq!(meta.keywords, vec!["rust", "crawl", "docs"]);
        assert_eq!(meta.language.as_deref(), Some("en"));
        assert_eq!(meta.author.as_deref(), Some("Docs Team"));
        assert_eq!(meta.canonical_url.as_deref(), Some("https://example.com/start"));
        assert_eq!(meta.open_graph.get("title").map(String::as_str), Some("OG Title"));
        assert_eq!(meta.twitter_card.get("card").map(String::as_str), Some("summary"));
        assert_eq!(meta.heading_count, 1);
        assert_eq!(meta.paragraph_count, 1);
        assert_eq!(meta.link_count, 1);
        assert_eq!(meta.image_count, 1);
        assert!(meta.word_count > 5);
        assert_eq!(meta.text_length, result.converted_content.chars().count());
    }

    #[test]
    fn links_are_absolute_and_include_navigation() {
        let result = process_content(PAGE, Some("https://example.com/docs/start"));
        assert_eq!(
            result.links,
            vec!["https://example.com/nav-only", "https://example.com/guide"]
        );
    }

    #[test]
    fn title_fallback_chain() {
        let og = r#"<html><head><meta property="og:title" content="From OG"></head><body><h1>H</h1></body></html>"#;
        assert_eq!(process_content(og, None).title, "From OG");

        let h1 = "<html><body><h1>  Heading  Title </h1><p>x</p></body></html>";
        assert_eq!(process_content(h1, None).title, "Heading Title");

        let tw = r#"<html><head><meta name="twitter:title" content="Tweet"></head><body><p>x</p></body></html>"#;
        assert_eq!(process_content(tw, None).title, "Tweet");

        assert_eq!(process_content("<p>plain</p>", None).title, "Untitled");
    }

    #[test]
    fn prefers_article_over_body() {
        let html = "<html><body><div>Sidebar junk</div><article><p>Story</p></article></body></html>";
        let result = process_content(html, None);
        assert_eq!(result.converted_content, "Story");
    }

    #[test]
    fn empty_or_unreadable_input_falls_back_to_raw() {
        let empty = process_content("   ", None);
        assert!(empty.fallback);
        assert_eq!(empty.converted_content, "   ");
        assert_eq!(empty.fallback_reason.as_deref(), Some("empty input"));

        let scripts_only = "<html><body><script>var x = 1;</script></body></html>";
        let result = process_content(scripts_only, None);
        assert!(result.fallback);
        assert_eq!(result.converted_content, scripts_only);
        assert_eq!(result.title, "Untitled");
    }

    #[test]
    fn malformed_markup_does_not_panic() {
        for input in [
            "<html><body><p>unclosed <b>bold <i>both",
            "</div></div><<<>>>",
            "<table><tr><td>a<td>b</table><ul><li>",
            "\u{0}\u{fffd}<h7>odd</h7>",
        ] {
            let result = process_content(input, Some("not a url"));
            assert_eq!(result.size, input.len());
        }
    }

    #[test]
    fn renders_tables_and_quotes() {
        let html = "<main><table><tr><th>Name</th><th>Age</th></tr><tr><td>Ann</td><td>3</td></tr></table>\
                    <blockquote><p>Quoted</p></blockquote><hr><p>a<br>b</p></main>";
        let md = process_content(html, None).converted_content;
        assert!(md.contains("| Name | Age |\n| --- | --- |\n| Ann | 3 |"), "{md}");
        assert!(md.contains("> Quoted"), "{md}");
        assert!(md.contains("---"), "{md}");
        assert!(md.contains("a\nb"), "{md}");
    }

    #[test]
    fn deeply_nested_markup_is_flattened_not_overflowed() {
        let depth = 100_000;
        let html = format!(
            "<html><head><title>Deep</title></head><body><main><p>top</p>{}bottom text{}</main></body></html>",
            "<span>".repeat(depth),
            "</span>".repeat(depth)
        );
        let result = process_content(&html, Some("https://example.com/deep"));
        assert!(!result.fallback);
        assert_eq!(result.title, "Deep");
        assert!(result.converted_content.contains("top"));
        assert!(result.converted_content.contains("bottom text"));
    }

    #[test]
    fn text_below_render_depth_is_kept() {
        let depth = MAX_RENDER_DEPTH * 2;
        let html = format!(
            "<main>{}<a href=\"/x\">deep link</a>{}</main>",
            "<blockquote>".repeat(depth),
            "</blockquote>".repeat(depth)
        );
        let result = process_content(&html, Some("https://example.com/"));
        assert!(result.converted_content.contains("deep link"), "{}", result.converted_content);
        assert_eq!(result.links, vec!["https://example.com/x".to_string()]);
    }
}

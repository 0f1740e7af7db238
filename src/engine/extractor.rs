use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::OnceLock;
use url::Url;

use crate::engine::urls::normalize;

/// Elements that never carry reading content.
const STRIP_SELECTOR: &str =
    "script, style, noscript, iframe, svg, nav, header, footer, aside, form, button";

/// Containers tried first when selecting the main content.
const CANDIDATE_SELECTORS: &[&str] = &[
    "article",
    "main",
    "[role=\"main\"]",
    "#content",
    ".content",
    ".post",
    ".article",
];

/// Minimum character mass for the primary selection to be trusted.
const MIN_CONTENT_CHARS: usize = 100;

/// At most this many tables are rendered and appended after the content.
const MAX_TABLES: usize = 3;

fn chrome_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(
            r"(?i)(nav|navbar|menu|sidebar|footer|header|cookie|banner|popup|modal|\bad\b|advertisement)",
        )
        .expect("valid regex")
    })
}

fn ws_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"\s+").expect("valid regex"))
}

fn sel(s: &str) -> Selector {
    Selector::parse(s).expect("valid static selector")
}

// --- Links ---

#[derive(Debug, Clone, Default)]
pub struct ExtractedLinks {
    pub internal: Vec<String>,
    pub external: Vec<String>,
}

/// Enumerate `<a href>` targets, normalized and partitioned by host equality
/// with the base. Fragment-only, mailto:, tel:, javascript: and data: targets
/// are skipped. Results are deduplicated and sorted.
pub fn extract_links(raw_html: &str, base_url: &str) -> ExtractedLinks {
    let base_norm = match normalize(base_url, None) {
        Some(n) => n,
        None => return ExtractedLinks::default(),
    };
    let base = match Url::parse(&base_norm) {
        Ok(u) => u,
        Err(_) => return ExtractedLinks::default(),
    };
    let base_host = base.host_str().map(|h| h.to_string());

    let doc = Html::parse_document(raw_html);
    let a_sel = sel("a[href]");

    let mut internal: BTreeSet<String> = BTreeSet::new();
    let mut external: BTreeSet<String> = BTreeSet::new();

    for el in doc.select(&a_sel) {
        let href = match el.value().attr("href") {
            Some(h) => h.trim(),
            None => continue,
        };
        if href.is_empty() || href.starts_with('#') {
            continue;
        }
        let lower = href.to_lowercase();
        if lower.starts_with("mailto:")
            || lower.starts_with("tel:")
            || lower.starts_with("javascript:")
            || lower.starts_with("data:")
        {
            continue;
        }

        let normalized = match normalize(href, Some(&base)) {
            Some(n) => n,
            None => continue,
        };
        let host = Url::parse(&normalized)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()));

        match (&host, &base_host) {
            (Some(h), Some(b)) if h == b => {
                internal.insert(normalized);
            }
            _ => {
                external.insert(normalized);
            }
        }
    }

    ExtractedLinks {
        internal: internal.into_iter().collect(),
        external: external.into_iter().collect(),
    }
}

// --- Metadata ---

#[derive(Debug, Clone, Default)]
pub struct PageMeta {
    pub title: Option<String>,
    pub description: Option<String>,
    pub og_image: Option<String>,
    pub author: Option<String>,
    pub published_at: Option<String>,
    pub site_name: Option<String>,
    pub language: Option<String>,
    pub favicon_url: Option<String>,
    pub canonical_url: Option<String>,
}

/// Parse page metadata from `<title>`, `<meta>`, JSON-LD and `<link>` tags.
/// Title precedence: og:title, then `<title>`, then the first `<h1>`.
pub fn extract_metadata(raw_html: &str, page_url: &str) -> PageMeta {
    let doc = Html::parse_document(raw_html);

    let title = meta_content(&doc, "meta[property=\"og:title\"]")
        .or_else(|| first_text(&doc, "title"))
        .or_else(|| first_text(&doc, "h1"));

    let description = meta_content(&doc, "meta[name=\"description\"]")
        .or_else(|| meta_content(&doc, "meta[property=\"og:description\"]"));

    let og_image = meta_content(&doc, "meta[property=\"og:image\"]");
    let site_name = meta_content(&doc, "meta[property=\"og:site_name\"]");

    let json_ld = parse_json_ld(&doc);
    let author = meta_content(&doc, "meta[name=\"author\"]")
        .or_else(|| json_ld.as_ref().and_then(json_ld_author));

    let published_at = published_at_meta(&doc).or_else(|| {
        json_ld
            .as_ref()
            .and_then(|v| v.get("datePublished"))
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
    });

    let language = doc
        .select(&sel("html"))
        .next()
        .and_then(|el| el.value().attr("lang"))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let base = Url::parse(page_url).ok();

    let canonical_url = doc
        .select(&sel("link[rel=\"canonical\"]"))
        .next()
        .and_then(|el| el.value().attr("href"))
        .and_then(|href| resolve(&base, href));

    let favicon_url = doc
        .select(&sel("link[rel~=\"icon\"]"))
        .next()
        .and_then(|el| el.value().attr("href"))
        .and_then(|href| resolve(&base, href))
        .or_else(|| {
            base.as_ref().and_then(|b| {
                b.host_str()
                    .map(|h| format!("{}://{}/favicon.ico", b.scheme(), h))
            })
        });

    PageMeta {
        title,
        description,
        og_image,
        author,
        published_at,
        site_name,
        language,
        favicon_url,
        canonical_url,
    }
}

fn resolve(base: &Option<Url>, href: &str) -> Option<String> {
    match base {
        Some(b) => b.join(href).ok().map(|u| u.to_string()),
        None => Url::parse(href).ok().map(|u| u.to_string()),
    }
}

fn meta_content(doc: &Html, selector: &str) -> Option<String> {
    doc.select(&sel(selector))
        .next()
        .and_then(|el| el.value().attr("content"))
        .map(collapse_ws)
        .filter(|s| !s.is_empty())
}

fn first_text(doc: &Html, selector: &str) -> Option<String> {
    doc.select(&sel(selector))
        .next()
        .map(|el| collapse_ws(&el.text().collect::<String>()))
        .filter(|s| !s.is_empty())
}

fn collapse_ws(s: &str) -> String {
    ws_re().replace_all(s.trim(), " ").into_owned()
}

fn published_at_meta(doc: &Html) -> Option<String> {
    const TAGS: &[&str] = &[
        "article:published_time",
        "og:published_time",
        "publication_date",
        "datePublished",
    ];
    for tag in TAGS {
        let selector = format!("meta[property=\"{tag}\"], meta[name=\"{tag}\"]");
        if let Some(v) = meta_content(doc, &selector) {
            return Some(v);
        }
    }
    None
}

fn parse_json_ld(doc: &Html) -> Option<Value> {
    for el in doc.select(&sel("script[type=\"application/ld+json\"]")) {
        let raw = el.text().collect::<String>();
        if let Ok(value) = serde_json::from_str::<Value>(&raw) {
            if value.is_object() {
                return Some(value);
            }
            if let Some(first) = value.as_array().and_then(|a| a.first()) {
                if first.is_object() {
                    return Some(first.clone());
                }
            }
        }
    }
    None
}

fn json_ld_author(value: &Value) -> Option<String> {
    match value.get("author")? {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Object(map) => map
            .get("name")
            .and_then(|n| n.as_str())
            .map(|s| s.trim().to_string()),
        Value::Array(items) => items.first().and_then(json_ld_author_item),
        _ => None,
    }
}

fn json_ld_author_item(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Object(map) => map
            .get("name")
            .and_then(|n| n.as_str())
            .map(|s| s.trim().to_string()),
        _ => None,
    }
}

// --- Cleaning & content selection ---

/// Drop non-content elements and boilerplate chrome, returning the serialized
/// remainder.
pub fn clean_html(raw_html: &str) -> String {
    let mut doc = Html::parse_document(raw_html);

    let mut doomed: Vec<_> = doc.select(&sel(STRIP_SELECTOR)).map(|el| el.id()).collect();

    let attr_sel = sel("[class], [id]");
    for el in doc.select(&attr_sel) {
        let joined = format!(
            "{} {}",
            el.value().attr("class").unwrap_or(""),
            el.value().attr("id").unwrap_or("")
        );
        if chrome_re().is_match(&joined) {
            doomed.push(el.id());
        }
    }

    for id in doomed {
        if let Some(mut node) = doc.tree.get_mut(id) {
            node.detach();
        }
    }

    doc.root_element().html()
}

#[derive(Debug, Clone)]
pub struct ContentExtraction {
    pub main_html: String,
    pub tables: Vec<String>,
    pub used_fallback: bool,
}

/// Select the main content of a cleaned document.
///
/// Primary pass: the densest of the usual content containers. When that
/// yields too little text, a readability-style pass scores block containers
/// by paragraph mass with a link-density penalty.
pub fn extract_content(cleaned_html: &str) -> ContentExtraction {
    let doc = Html::parse_document(cleaned_html);

    let mut best: Option<(usize, String)> = None;
    for sel_str in CANDIDATE_SELECTORS {
        for el in doc.select(&sel(sel_str)) {
            let text_len = element_text_len(&el);
            if best.as_ref().is_none_or(|(len, _)| text_len > *len) {
                best = Some((text_len, el.inner_html()));
            }
        }
    }

    let (main_html, used_fallback) = match best {
        Some((len, html)) if len >= MIN_CONTENT_CHARS => (html, false),
        _ => (readability_fallback(&doc), true),
    };

    ContentExtraction {
        main_html,
        tables: extract_tables(&doc),
        used_fallback,
    }
}

fn element_text_len(el: &ElementRef) -> usize {
    el.text().map(|t| t.trim().len()).sum()
}

/// Paragraph-scoring fallback: prefer the block with the most paragraph text
/// that is not mostly links.
fn readability_fallback(doc: &Html) -> String {
    let block_sel = sel("div, section, article, main, td");
    let p_sel = sel("p");
    let a_sel = sel("a");

    let mut best: Option<(f64, String)> = None;
    for el in doc.select(&block_sel) {
        let p_text: String = el.select(&p_sel).flat_map(|p| p.text()).collect();
        let p_len = p_text.trim().len() as f64;
        if p_len < 25.0 {
            continue;
        }

        let link_len: f64 = el
            .select(&a_sel)
            .flat_map(|a| a.text())
            .collect::<String>()
            .len() as f64;
        let total_len = el.text().collect::<String>().len() as f64;
        let link_density = if total_len > 0.0 {
            link_len / total_len
        } else {
            0.0
        };
        let score = p_len * (1.0 - link_density);

        if best.as_ref().is_none_or(|(s, _)| score > *s) {
            best = Some((score, el.inner_html()));
        }
    }

    best.map(|(_, html)| html).unwrap_or_else(|| {
        doc.select(&sel("body"))
            .next()
            .map(|b| b.inner_html())
            .unwrap_or_else(|| doc.root_element().inner_html())
    })
}

/// Render up to the first three tables as Markdown pipe tables.
fn extract_tables(doc: &Html) -> Vec<String> {
    let tr_sel = sel("tr");
    let cell_sel = sel("th, td");

    doc.select(&sel("table"))
        .take(MAX_TABLES)
        .filter_map(|table| {
            let rows: Vec<Vec<String>> = table
                .select(&tr_sel)
                .map(|tr| {
                    tr.select(&cell_sel)
                        .map(|cell| collapse_ws(&cell.text().collect::<String>()))
                        .collect()
                })
                .filter(|cells: &Vec<String>| !cells.is_empty())
                .collect();

            if rows.is_empty() {
                return None;
            }

            let mut out = String::new();
            for (i, cells) in rows.iter().enumerate() {
                out.push_str("| ");
                out.push_str(&cells.join(" | "));
                out.push_str(" |\n");
                if i == 0 {
                    out.push_str("| ");
                    out.push_str(&vec!["---"; cells.len()].join(" | "));
                    out.push_str(" |\n");
                }
            }
            Some(out.trim_end().to_string())
        })
        .collect()
}

// --- Markdown ---

/// Convert selected content HTML to Markdown and post-process it.
pub fn html_to_markdown(content_html: &str) -> String {
    use htmd::options::{BulletListMarker, HeadingStyle, Options};

    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(vec!["script", "style", "nav", "footer", "header"])
        .options(Options {
            heading_style: HeadingStyle::Atx,
            bullet_list_marker: BulletListMarker::Dash,
            ..Default::default()
        })
        .build();

    let markdown = converter.convert(content_html).unwrap_or_default();
    postprocess_markdown(&markdown)
}

fn symbol_only_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^[\W_]+$").expect("valid regex"))
}

fn cookie_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"(?i)(cookie|consent|gdpr|accept all|privacy policy)")
            .expect("valid regex")
    })
}

fn breadcrumb_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"^[^>\n]+(\s*>\s*[^>\n]+){2,}$").expect("valid regex")
    })
}

/// Markdown cleanup: collapse blank runs, drop noise lines, suppress heavy
/// repetition, and keep headings separated by blank lines.
pub fn postprocess_markdown(markdown: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut repeat: (String, usize) = (String::new(), 0);

    for raw in markdown.lines() {
        let line = raw.trim();

        if !line.is_empty() {
            if symbol_only_re().is_match(line) {
                continue;
            }
            if line.len() < 100 && cookie_re().is_match(line) {
                continue;
            }
            if line.len() < 100 && breadcrumb_re().is_match(line) {
                continue;
            }

            if line == repeat.0 {
                repeat.1 += 1;
                if repeat.1 >= 3 {
                    continue;
                }
            } else {
                repeat = (line.to_string(), 1);
            }
        }

        lines.push(line.to_string());
    }

    // Blank lines around headings.
    let mut spaced: Vec<String> = Vec::new();
    for line in lines {
        if line.starts_with('#') {
            if spaced.last().is_some_and(|prev| !prev.is_empty()) {
                spaced.push(String::new());
            }
            spaced.push(line);
            spaced.push(String::new());
        } else {
            spaced.push(line);
        }
    }

    // Collapse runs of blank lines to at most one separator (two newlines).
    let mut out: Vec<String> = Vec::new();
    let mut blanks = 0usize;
    for line in spaced {
        if line.is_empty() {
            blanks += 1;
            if blanks > 1 {
                continue;
            }
        } else {
            blanks = 0;
        }
        out.push(line);
    }

    out.join("\n").trim().to_string()
}

/// Word count of the final Markdown: whitespace-separated tokens of the body
/// text, excluding heading lines and tokens that are pure markup.
pub fn word_count(markdown: &str) -> u32 {
    markdown
        .lines()
        .filter(|l| !l.trim_start().starts_with('#'))
        .flat_map(str::split_whitespace)
        .filter(|t| t.chars().any(char::is_alphanumeric))
        .count() as u32
}

pub fn read_time_minutes(words: u32) -> u32 {
    ((words as f64) / 200.0).round() as u32
}

// --- PDF ---

#[derive(Debug, Clone, Default)]
pub struct PdfMeta {
    pub title: Option<String>,
}

/// Extract text from PDF bytes. The title is a best-effort guess from the
/// first non-empty line.
pub fn extract_pdf(bytes: &[u8]) -> Result<(String, PdfMeta), String> {
    let text = pdf_extract::extract_text_from_mem(bytes).map_err(|e| e.to_string())?;

    let cleaned = postprocess_markdown(&text);
    let title = cleaned
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(|l| l.chars().take(120).collect::<String>());

    Ok((cleaned, PdfMeta { title }))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARTICLE: &str = r#"
<html lang="en">
<head>
  <title>The  Title</title>
  <meta name="description" content="A description">
  <meta property="og:image" content="https://cdn.example.com/img.png">
  <meta property="og:site_name" content="Example Site">
  <meta name="author" content="Jane Roe">
  <meta property="article:published_time" content="2024-01-02T03:04:05Z">
  <link rel="canonical" href="/canonical-path">
  <link rel="icon" href="/static/fav.png">
</head>
<body>
  <nav><a href="/nav">Nav link</a></nav>
  <article>
    <h1>Heading</h1>
    <p>First paragraph with enough words to count as meaningful body content
    for the selection pass of the extractor, padded a little further so it is
    comfortably past the minimum threshold used by the primary selector.</p>
    <p>Second paragraph.</p>
  </article>
  <footer>footer text</footer>
</body>
</html>"#;

    #[test]
    fn test_extract_metadata_fields() {
        let meta = extract_metadata(ARTICLE, "https://example.com/post");
        assert_eq!(meta.title.as_deref(), Some("The Title"));
        assert_eq!(meta.description.as_deref(), Some("A description"));
        assert_eq!(
            meta.og_image.as_deref(),
            Some("https://cdn.example.com/img.png")
        );
        assert_eq!(meta.site_name.as_deref(), Some("Example Site"));
        assert_eq!(meta.author.as_deref(), Some("Jane Roe"));
        assert_eq!(meta.published_at.as_deref(), Some("2024-01-02T03:04:05Z"));
        assert_eq!(meta.language.as_deref(), Some("en"));
        assert_eq!(
            meta.canonical_url.as_deref(),
            Some("https://example.com/canonical-path")
        );
        assert_eq!(
            meta.favicon_url.as_deref(),
            Some("https://example.com/static/fav.png")
        );
    }

    #[test]
    fn test_title_precedence() {
        let html = r#"<html><head>
            <meta property="og:title" content="OG Title">
            <title>Doc Title</title>
            </head><body><h1>H1 Title</h1></body></html>"#;
        let meta = extract_metadata(html, "https://example.com/");
        assert_eq!(meta.title.as_deref(), Some("OG Title"));

        let html = r#"<html><head><title>Doc Title</title></head>
            <body><h1>H1 Title</h1></body></html>"#;
        let meta = extract_metadata(html, "https://example.com/");
        assert_eq!(meta.title.as_deref(), Some("Doc Title"));

        let html = r#"<html><body><h1>H1 Title</h1></body></html>"#;
        let meta = extract_metadata(html, "https://example.com/");
        assert_eq!(meta.title.as_deref(), Some("H1 Title"));
    }

    #[test]
    fn test_favicon_defaults_to_root() {
        let meta = extract_metadata("<html></html>", "https://example.com/deep/page");
        assert_eq!(
            meta.favicon_url.as_deref(),
            Some("https://example.com/favicon.ico")
        );
    }

    #[test]
    fn test_json_ld_author() {
        let html = r#"<html><head><script type="application/ld+json">
            {"@type":"Article","author":{"name":"John Smith"},"datePublished":"2023-05-01"}
            </script></head><body></body></html>"#;
        let meta = extract_metadata(html, "https://example.com/");
        assert_eq!(meta.author.as_deref(), Some("John Smith"));
        assert_eq!(meta.published_at.as_deref(), Some("2023-05-01"));
    }

    #[test]
    fn test_extract_links_partition() {
        let html = r##"<body>
            <a href="/about">About</a>
            <a href="https://example.com/contact/">Contact</a>
            <a href="https://other.org/page?utm_source=x">Other</a>
            <a href="#section">Anchor</a>
            <a href="mailto:x@example.com">Mail</a>
            <a href="tel:+123">Call</a>
            <a href="javascript:void(0)">JS</a>
            <a href="data:text/plain,hi">Data</a>
        </body>"##;
        let links = extract_links(html, "https://example.com/base");
        assert_eq!(
            links.internal,
            vec![
                "https://example.com/about".to_string(),
                "https://example.com/contact".to_string(),
            ]
        );
        assert_eq!(links.external, vec!["https://other.org/page".to_string()]);
    }

    #[test]
    fn test_extract_links_www_is_same_host() {
        let html = r#"<a href="https://www.example.com/x">X</a>"#;
        let links = extract_links(html, "https://example.com/");
        assert_eq!(links.internal, vec!["https://example.com/x".to_string()]);
        assert!(links.external.is_empty());
    }

    #[test]
    fn test_extract_links_dedup_sorted() {
        let html = r#"
            <a href="/b">B</a>
            <a href="/a">A</a>
            <a href="/b#frag">B again</a>
        "#;
        let links = extract_links(html, "https://example.com/");
        assert_eq!(
            links.internal,
            vec![
                "https://example.com/a".to_string(),
                "https://example.com/b".to_string()
            ]
        );
    }

    #[test]
    fn test_clean_html_strips_chrome() {
        let cleaned = clean_html(ARTICLE);
        assert!(!cleaned.contains("<nav>"));
        assert!(!cleaned.contains("footer text"));
        assert!(cleaned.contains("First paragraph"));
    }

    #[test]
    fn test_clean_html_strips_by_class() {
        let html = r#"<body>
            <div class="cookie-banner">Accept cookies</div>
            <div id="sidebar-widget">widget</div>
            <div class="story">Real content here</div>
        </body>"#;
        let cleaned = clean_html(html);
        assert!(!cleaned.contains("Accept cookies"));
        assert!(!cleaned.contains("widget"));
        assert!(cleaned.contains("Real content here"));
    }

    #[test]
    fn test_extract_content_prefers_article() {
        let cleaned = clean_html(ARTICLE);
        let content = extract_content(&cleaned);
        assert!(!content.used_fallback);
        assert!(content.main_html.contains("First paragraph"));
    }

    #[test]
    fn test_extract_content_fallback_on_thin_primary() {
        let html = r#"<body>
            <article>tiny</article>
            <div>
              <p>This paragraph carries the actual readable content of the page
              and is long enough for the readability fallback to score it as the
              main block of the document.</p>
              <p>And a second paragraph to add more mass to the block.</p>
            </div>
        </body>"#;
        let content = extract_content(html);
        assert!(content.used_fallback);
        assert!(content.main_html.contains("actual readable content"));
    }

    #[test]
    fn test_extract_tables_limit_and_shape() {
        let html = r#"<body>
            <table><tr><th>A</th><th>B</th></tr><tr><td>1</td><td>2</td></tr></table>
            <table><tr><td>x</td></tr></table>
            <table><tr><td>y</td></tr></table>
            <table><tr><td>never included</td></tr></table>
        </body>"#;
        let content = extract_content(html);
        assert_eq!(content.tables.len(), 3);
        assert!(content.tables[0].starts_with("| A | B |"));
        assert!(content.tables[0].contains("| --- | --- |"));
        assert!(content.tables[0].contains("| 1 | 2 |"));
    }

    #[test]
    fn test_markdown_conversion_atx_and_bullets() {
        let md = html_to_markdown("<h1>H</h1><p>word1 word2</p><ul><li>one</li><li>two</li></ul>");
        assert!(md.contains("# H"));
        assert!(md.contains("word1 word2"));
        assert!(md.contains("- one"));
        assert!(md.contains("- two"));
    }

    #[test]
    fn test_postprocess_collapses_blank_runs() {
        let md = "a\n\n\n\n\nb";
        assert_eq!(postprocess_markdown(md), "a\n\nb");
    }

    #[test]
    fn test_postprocess_drops_symbol_only_lines() {
        let md = "keep\n***\n---___\nalso keep";
        let out = postprocess_markdown(md);
        assert!(out.contains("keep"));
        assert!(!out.contains("***"));
        assert!(!out.contains("---___"));
    }

    #[test]
    fn test_postprocess_drops_cookie_and_breadcrumb_lines() {
        let md = "Body text\nWe use cookies to improve your experience\nHome > Blog > Post\nMore body";
        let out = postprocess_markdown(md);
        assert!(!out.contains("cookies"));
        assert!(!out.contains("Home > Blog > Post"));
        assert!(out.contains("Body text"));
        assert!(out.contains("More body"));
    }

    #[test]
    fn test_postprocess_keeps_long_cookie_mention() {
        let long = format!(
            "A long paragraph that happens to mention a cookie recipe {}",
            "and keeps going ".repeat(5)
        );
        let out = postprocess_markdown(&long);
        assert!(out.contains("cookie recipe"));
    }

    #[test]
    fn test_postprocess_suppresses_repeated_lines() {
        let md = "dup\ndup\ndup\ndup\nend";
        let out = postprocess_markdown(md);
        let dups = out.lines().filter(|l| *l == "dup").count();
        assert_eq!(dups, 2);
        assert!(out.contains("end"));
    }

    #[test]
    fn test_postprocess_heading_separation() {
        let md = "before\n# Heading\nafter";
        let out = postprocess_markdown(md);
        assert_eq!(out, "before\n\n# Heading\n\nafter");
    }

    #[test]
    fn test_word_count_and_read_time() {
        assert_eq!(word_count("word1 word2"), 2);
        assert_eq!(word_count("# Heading\n\nword1 word2"), 2);
        assert_eq!(word_count("- item one\n- item two"), 4);
        assert_eq!(read_time_minutes(2), 0);
        assert_eq!(read_time_minutes(100), 1);
        assert_eq!(read_time_minutes(1000), 5);
    }

    #[test]
    fn test_spec_scenario_minimal_page() {
        let html = "<html><head><title>T</title></head><body><h1>H</h1><p>word1 word2</p></body></html>";
        let meta = extract_metadata(html, "https://example.com/");
        assert_eq!(meta.title.as_deref(), Some("T"));

        let cleaned = clean_html(html);
        let content = extract_content(&cleaned);
        let md = html_to_markdown(&content.main_html);
        assert!(md.contains("# H"));
        assert!(md.contains("word1 word2"));
        assert_eq!(word_count(&md), 2);
        assert_eq!(read_time_minutes(word_count(&md)), 0);
    }
}

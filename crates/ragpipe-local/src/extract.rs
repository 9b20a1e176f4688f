//! Content extraction as an ordered fallback chain.
//!
//! Each strategy is tried only when everything before it produced less than
//! the acceptance threshold; strategies self-gate on content kind, so the
//! same chain serves HTML articles and academic PDFs. Output text is always
//! whitespace-normalized. The page title is extracted independently so a
//! body-extraction failure still yields something citable.

use crate::textnorm;
use std::io::Cursor;

/// Body text below this many chars counts as a failed extraction.
pub const MIN_CONTENT_CHARS: usize = 150;
/// Secondary tier: the DOM walk may accept shorter text (flagged `_short`).
pub const SHORT_CONTENT_CHARS: usize = 50;

const SCORER_MAX_ELEMS: usize = 20_000;
const MIN_BLOCK_CHARS: usize = 15;
const FALLBACK_PARAGRAPH_CHARS: usize = 20;

/// Raw fetched body plus what we know about it.
#[derive(Debug, Clone)]
pub struct RawPage<'a> {
    pub bytes: &'a [u8],
    pub content_type: Option<&'a str>,
    pub url: &'a str,
}

impl RawPage<'_> {
    fn content_type_lc(&self) -> String {
        self.content_type.unwrap_or("").trim().to_ascii_lowercase()
    }

    pub fn is_pdf_like(&self) -> bool {
        self.content_type_lc().contains("pdf") || bytes_look_like_pdf(self.bytes)
    }

    pub fn is_html_like(&self) -> bool {
        let ct = self.content_type_lc();
        if ct.contains("html") || ct.contains("xhtml") {
            return true;
        }
        // Servers lie; sniff when the header is missing or generic.
        (ct.is_empty() || ct.contains("octet-stream")) && bytes_look_like_html(self.bytes)
    }

    fn html(&self) -> Option<String> {
        if !self.is_html_like() {
            return None;
        }
        Some(String::from_utf8_lossy(self.bytes).to_string())
    }
}

/// Best-effort sniff for PDF bytes (magic header).
pub fn bytes_look_like_pdf(bytes: &[u8]) -> bool {
    bytes.starts_with(b"%PDF-")
}

/// Best-effort guess for whether bytes are HTML-ish.
pub fn bytes_look_like_html(bytes: &[u8]) -> bool {
    let mut i = 0usize;
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    if i >= bytes.len() {
        return false;
    }
    let rest = &bytes[i..];
    rest.starts_with(b"<!doctype")
        || rest.starts_with(b"<!DOCTYPE")
        || rest.starts_with(b"<html")
        || rest.starts_with(b"<HTML")
        || rest.starts_with(b"<head")
        || rest.starts_with(b"<body")
}

/// Convert HTML to readable plain text.
///
/// Intentionally "good enough" and deterministic, not a full readability
/// engine; the chain layers smarter strategies in front of it.
pub fn html_to_text(html: &str, width: usize) -> String {
    html2text::from_read(Cursor::new(html.as_bytes()), width).unwrap_or_else(|_| html.to_string())
}

/// Extract text from a PDF body (in-memory bytes), pages concatenated.
pub fn pdf_to_text(bytes: &[u8]) -> Result<String, String> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| e.to_string())
}

/// One rung of the fallback ladder. Returns raw candidate text (not yet
/// length-checked); `None` means "not applicable / found nothing".
pub trait ExtractStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    /// Strategies that may accept the short tier (`SHORT_CONTENT_CHARS`).
    fn short_ok(&self) -> bool {
        false
    }
    fn try_extract(&self, raw: &RawPage<'_>) -> Option<String>;
}

#[derive(Debug, Clone)]
pub struct Extraction {
    pub text: Option<String>,
    pub method: Option<String>,
    pub title: Option<String>,
}

fn norm_join(parts: &[String]) -> String {
    textnorm::normalize_whitespace(&parts.join("\n\n"))
}

fn class_or_id_lc(el: &html_scraper::ElementRef) -> String {
    let mut out = String::new();
    if let Some(c) = el.value().attr("class") {
        out.push_str(c);
        out.push(' ');
    }
    if let Some(i) = el.value().attr("id") {
        out.push_str(i);
    }
    out.to_ascii_lowercase()
}

/// Structural UI words only; never site-specific.
const NOISE_WORDS: &[&str] = &[
    "nav",
    "navbar",
    "menu",
    "sidebar",
    "footer",
    "header",
    "banner",
    "cookie",
    "consent",
    "ads",
    "advert",
    "promo",
    "subscribe",
    "newsletter",
    "comment",
    "related",
    "pagination",
    "breadcrumb",
    "social",
    "share",
    "widget",
];

fn is_noise_container(el: &html_scraper::ElementRef) -> bool {
    let s = class_or_id_lc(el);
    if s.is_empty() {
        return false;
    }
    NOISE_WORDS.iter().any(|w| s.contains(w))
}

const NOISE_ANCESTOR_TAGS: &[&str] = &["nav", "header", "footer", "aside", "form"];

fn has_noise_ancestry(el: &html_scraper::ElementRef) -> bool {
    for node in el.ancestors() {
        let Some(parent) = html_scraper::ElementRef::wrap(node) else {
            continue;
        };
        let tag = parent.value().name();
        if NOISE_ANCESTOR_TAGS.iter().any(|t| tag == *t) {
            return true;
        }
        if is_noise_container(&parent) {
            return true;
        }
    }
    false
}

fn element_text_chars(el: &html_scraper::ElementRef) -> usize {
    el.text().map(|t| t.chars().count()).sum()
}

fn element_link_text_chars(el: &html_scraper::ElementRef) -> usize {
    let Ok(sel) = html_scraper::Selector::parse("a") else {
        return 0;
    };
    el.select(&sel)
        .map(|a| a.text().map(|t| t.chars().count()).sum::<usize>())
        .sum()
}

const BLOCK_TAGS: &str = "p, h1, h2, h3, h4, h5, h6, li, blockquote, pre, dd, dt";

fn blocks_within(el: &html_scraper::ElementRef, min_chars: usize) -> Vec<String> {
    let Ok(sel) = html_scraper::Selector::parse(BLOCK_TAGS) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for b in el.select(&sel) {
        let t = b.text().collect::<Vec<_>>().join(" ");
        let t = textnorm::normalize_whitespace(&t);
        if t.chars().count() >= min_chars {
            out.push(t);
        }
    }
    out
}

/// Strategy 1: score candidate containers and keep the densest non-link one.
///
/// Link text is usually navigation / TOCs / tag clouds, so it is penalized
/// twice; `article`/`main` tags get flat bonuses.
pub struct ArticleScorer;

impl ExtractStrategy for ArticleScorer {
    fn name(&self) -> &'static str {
        "article_scorer"
    }

    fn try_extract(&self, raw: &RawPage<'_>) -> Option<String> {
        let html = raw.html()?;
        let doc = html_scraper::Html::parse_document(&html);
        let sel = html_scraper::Selector::parse("article, main, section, div").ok()?;

        let mut seen = 0usize;
        let mut best_score: i64 = 0;
        let mut best: Option<html_scraper::ElementRef> = None;
        for el in doc.select(&sel) {
            seen += 1;
            if seen > SCORER_MAX_ELEMS {
                break;
            }
            if is_noise_container(&el) {
                continue;
            }
            let txt = element_text_chars(&el);
            if txt < 20 {
                continue;
            }
            let link_txt = element_link_text_chars(&el);
            let mut score = txt as i64 - 2 * (link_txt as i64);
            let tag = el.value().name();
            if tag == "article" {
                score += 500;
            } else if tag == "main" {
                score += 300;
            }
            if link_txt > txt / 2 {
                score -= 500;
            }
            if score > best_score {
                best_score = score;
                best = Some(el);
            }
        }

        let el = best?;
        let blocks = blocks_within(&el, MIN_BLOCK_CHARS);
        let text = if blocks.is_empty() {
            let t = el.text().collect::<Vec<_>>().join(" ");
            textnorm::normalize_whitespace(&t)
        } else {
            norm_join(&blocks)
        };
        (!text.is_empty()).then_some(text)
    }
}

/// Strategy 2: whole-document rendering via html2text, with the reference
/// footnote lines (`[1]: https://...`) it emits filtered back out.
pub struct DocumentText {
    pub width: usize,
}

impl Default for DocumentText {
    fn default() -> Self {
        Self { width: 100 }
    }
}

fn is_footnote_link_line(line: &str) -> bool {
    let t = line.trim_start();
    let Some(rest) = t.strip_prefix('[') else {
        return false;
    };
    let Some(close) = rest.find(']') else {
        return false;
    };
    rest[..close].chars().all(|c| c.is_ascii_digit())
        && rest[close..].trim_start_matches(']').trim_start().starts_with(':')
}

impl ExtractStrategy for DocumentText {
    fn name(&self) -> &'static str {
        "document_text"
    }

    fn try_extract(&self, raw: &RawPage<'_>) -> Option<String> {
        let html = raw.html()?;
        let text = html_to_text(&html, self.width);
        let kept: Vec<String> = text
            .lines()
            .filter(|l| !is_footnote_link_line(l))
            .map(|l| l.to_string())
            .collect();
        let out = textnorm::normalize_whitespace(&kept.join("\n"));
        (!out.is_empty()).then_some(out)
    }
}

/// Named, ordered main-content selectors; first match wins.
const CONTENT_SELECTORS: &[&str] = &[
    "main",
    "article",
    "[role=\"main\"]",
    ".content",
    ".entry-content",
    ".post-content",
    ".article-body",
    ".main-content",
    "#content",
    "#main",
];

/// Strategy 3: manual DOM walk. Finds a main-content container from the
/// selector list, collects block-level text skipping nav/ad ancestry, and
/// falls back to bare paragraph harvesting when no container matches.
pub struct DomWalk;

impl ExtractStrategy for DomWalk {
    fn name(&self) -> &'static str {
        "dom_walk"
    }

    fn short_ok(&self) -> bool {
        true
    }

    fn try_extract(&self, raw: &RawPage<'_>) -> Option<String> {
        let html = raw.html()?;
        let doc = html_scraper::Html::parse_document(&html);

        for css in CONTENT_SELECTORS {
            let Ok(sel) = html_scraper::Selector::parse(css) else {
                continue;
            };
            let Some(container) = doc.select(&sel).next() else {
                continue;
            };
            let mut blocks = Vec::new();
            let Ok(block_sel) = html_scraper::Selector::parse(BLOCK_TAGS) else {
                continue;
            };
            for b in container.select(&block_sel) {
                if has_noise_ancestry(&b) {
                    continue;
                }
                let t = b.text().collect::<Vec<_>>().join(" ");
                let t = textnorm::normalize_whitespace(&t);
                if t.chars().count() >= MIN_BLOCK_CHARS {
                    blocks.push(t);
                }
            }
            if !blocks.is_empty() {
                return Some(norm_join(&blocks));
            }
        }

        // No recognizable container: harvest standalone paragraphs.
        let sel = html_scraper::Selector::parse("p").ok()?;
        let mut paras = Vec::new();
        for p in doc.select(&sel) {
            if has_noise_ancestry(&p) {
                continue;
            }
            let t = p.text().collect::<Vec<_>>().join(" ");
            let t = textnorm::normalize_whitespace(&t);
            if t.chars().count() > FALLBACK_PARAGRAPH_CHARS {
                paras.push(t);
            }
        }
        (!paras.is_empty()).then(|| norm_join(&paras))
    }
}

/// Strategy 4: PDF text layer.
pub struct PdfText;

impl ExtractStrategy for PdfText {
    fn name(&self) -> &'static str {
        "pdf_text"
    }

    fn try_extract(&self, raw: &RawPage<'_>) -> Option<String> {
        if !raw.is_pdf_like() {
            return None;
        }
        let text = pdf_to_text(raw.bytes).ok()?;
        let out = textnorm::normalize_whitespace(&text);
        (!out.is_empty()).then_some(out)
    }
}

/// Page title, independent of body extraction: `<title>` unless missing or
/// generic, then the first `<h1>`.
pub fn extract_title(raw: &RawPage<'_>) -> Option<String> {
    let html = raw.html()?;
    let doc = html_scraper::Html::parse_document(&html);

    let from_title = html_scraper::Selector::parse("title")
        .ok()
        .and_then(|sel| doc.select(&sel).next())
        .map(|el| textnorm::normalize_whitespace(&el.text().collect::<Vec<_>>().join(" ")))
        .filter(|t| !textnorm::looks_generic_title(t));
    if from_title.is_some() {
        return from_title;
    }

    html_scraper::Selector::parse("h1")
        .ok()
        .and_then(|sel| doc.select(&sel).next())
        .map(|el| textnorm::normalize_whitespace(&el.text().collect::<Vec<_>>().join(" ")))
        .filter(|t| !t.is_empty())
}

/// Run strategies in order until one yields enough text. Later strategies
/// are never invoked once a rung accepts.
pub fn run_chain(
    strategies: &[&dyn ExtractStrategy],
    raw: &RawPage<'_>,
    min_chars: usize,
    short_chars: usize,
) -> Extraction {
    let title = extract_title(raw);
    for s in strategies {
        let Some(text) = s.try_extract(raw) else {
            continue;
        };
        let n = text.chars().count();
        if n >= min_chars {
            return Extraction {
                text: Some(text),
                method: Some(s.name().to_string()),
                title,
            };
        }
        if s.short_ok() && n >= short_chars {
            return Extraction {
                text: Some(text),
                method: Some(format!("{}_short", s.name())),
                title,
            };
        }
    }
    Extraction {
        text: None,
        method: None,
        title,
    }
}

/// The default ladder used by the pipeline.
pub struct ExtractChain {
    pub min_chars: usize,
    pub short_chars: usize,
}

impl Default for ExtractChain {
    fn default() -> Self {
        Self {
            min_chars: MIN_CONTENT_CHARS,
            short_chars: SHORT_CONTENT_CHARS,
        }
    }
}

impl ExtractChain {
    pub fn extract(&self, raw: &RawPage<'_>) -> Extraction {
        let scorer = ArticleScorer;
        let doc_text = DocumentText::default();
        let dom = DomWalk;
        let pdf = PdfText;
        let ladder: [&dyn ExtractStrategy; 4] = [&scorer, &doc_text, &dom, &pdf];
        run_chain(&ladder, raw, self.min_chars, self.short_chars)
    }
}

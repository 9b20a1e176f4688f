//! Pure URL admission predicate for web search candidates.
//!
//! This is intentionally:
//! - **total**: malformed input returns `false`, never panics
//! - **data-driven**: the exclusion rules are flat const tables, so adding a
//!   rule never touches control flow
//!
//! Academic candidates bypass this (their PDF location comes from the paper
//! index, not from a search result page).

/// File extensions that are never worth fetching as article candidates.
/// PDFs are excluded here on purpose: web search hits ending in `.pdf` are
/// mostly scans/slides, while academic PDFs arrive through the paper index.
const EXCLUDED_EXTENSIONS: &[&str] = &[
    ".pdf", ".doc", ".docx", ".ppt", ".pptx", ".xls", ".xlsx", ".odt", ".rtf", ".zip", ".rar",
    ".7z", ".tar", ".gz", ".bz2", ".jpg", ".jpeg", ".png", ".gif", ".bmp", ".svg", ".webp",
    ".ico", ".mp3", ".wav", ".ogg", ".mp4", ".avi", ".mov", ".wmv", ".flv", ".mkv", ".webm",
    ".exe", ".dmg", ".iso", ".apk", ".css", ".js", ".mjs", ".xml", ".json", ".rss", ".atom",
    ".woff", ".woff2", ".ttf", ".eot",
];

/// Substring-matched against the lowercased host. Trailing-dot entries
/// (`"amazon."`) catch every TLD of that brand.
const EXCLUDED_DOMAINS: &[&str] = &[
    // social / video / image hosts: no stable article bodies
    "facebook.com",
    "twitter.com",
    "x.com",
    "instagram.com",
    "youtube.com",
    "youtu.be",
    "tiktok.com",
    "pinterest.",
    "linkedin.com",
    "t.me",
    "vk.com",
    // wiki/Q&A/forums: excluded per product policy, not quality
    "wikipedia.org",
    "wikihow.com",
    "quora.com",
    "reddit.com",
    "stackexchange.com",
    "stackoverflow.com",
    // e-commerce
    "amazon.",
    "ebay.",
    "aliexpress.",
    // search engines themselves
    "google.",
    "yandex.",
    "bing.com",
    "duckduckgo.com",
    "baidu.com",
    // document sharing / code hosts
    "slideshare.net",
    "scribd.com",
    "academia.edu",
    "researchgate.net",
    "github.com",
    "gitlab.com",
    "codepen.io",
    "jsfiddle.net",
    "replit.com",
    "archive.org",
    // shorteners (destination unknown)
    "goo.gl",
    "bit.ly",
    "t.co",
    "tinyurl.com",
    // big-vendor download/app-store surfaces
    "microsoft.com",
    "apple.com",
    "adobe.com",
    "play.google.com",
];

/// Substring-matched against the lowercased path.
const EXCLUDED_PATH_SEGMENTS: &[&str] = &[
    "/search", "/find", "/query", "/login", "/register", "/signin", "/signup", "/cart",
    "/checkout", "/tag/", "/category/", "/author/",
];

/// Query parameter names that mark a search/sort/filter results page.
/// Bare pagination (`page=2`) is fine; pagination plus any of these is a
/// results listing, which these names already reject on their own.
const SEARCHY_PARAMS: &[&str] = &[
    "q", "query", "search", "keyword", "term", "text", "s", "find", "sort", "filter", "order",
];

/// More params than this smells like a tracking/session URL.
const MAX_QUERY_PARAMS: usize = 7;

pub fn is_worth_fetching(url: &str) -> bool {
    let Ok(u) = url::Url::parse(url.trim()) else {
        return false;
    };

    if !matches!(u.scheme(), "http" | "https") {
        return false;
    }
    let Some(host) = u.host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();
    if EXCLUDED_DOMAINS.iter().any(|d| host.contains(d)) {
        return false;
    }

    let path = u.path().to_ascii_lowercase();
    if EXCLUDED_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
        return false;
    }
    if EXCLUDED_PATH_SEGMENTS.iter().any(|p| path.contains(p)) {
        return false;
    }

    let mut param_count = 0usize;
    for (name, _) in u.query_pairs() {
        param_count += 1;
        if param_count > MAX_QUERY_PARAMS {
            return false;
        }
        let name = name.to_lowercase();
        if SEARCHY_PARAMS.iter().any(|p| name == *p) {
            return false;
        }
    }

    true
}

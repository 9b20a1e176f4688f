//! Minimal, deterministic text normalization helpers.
//!
//! Everything here is pure and allocation-cheap; extraction and section
//! rendering both go through these before text leaves the crate.

/// Collapse horizontal whitespace runs to single spaces, trim line ends,
/// and collapse 3+ consecutive newlines down to one blank line.
pub fn normalize_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut pending_newlines = 0usize;
    let mut pending_space = false;
    let mut line_has_content = false;

    for ch in s.chars() {
        match ch {
            '\n' => {
                pending_newlines += 1;
                pending_space = false;
                line_has_content = false;
            }
            '\r' | '\t' | '\u{0b}' | '\u{0c}' | ' ' => {
                if line_has_content {
                    pending_space = true;
                }
            }
            _ => {
                if pending_newlines > 0 {
                    if !out.is_empty() {
                        out.push('\n');
                        if pending_newlines > 1 {
                            out.push('\n');
                        }
                    }
                    pending_newlines = 0;
                }
                if pending_space {
                    out.push(' ');
                    pending_space = false;
                }
                out.push(ch);
                line_has_content = true;
            }
        }
    }
    out
}

/// Char-boundary-safe truncation. Returns (text, chars_kept, truncated).
pub fn truncate_chars(s: &str, max_chars: usize) -> (String, usize, bool) {
    let mut out = String::new();
    let mut n = 0usize;
    for ch in s.chars() {
        if n >= max_chars {
            return (out, n, true);
        }
        out.push(ch);
        n += 1;
    }
    (out, n, false)
}

/// Lowercased host of a URL, for per-host limits and citation fallbacks.
pub fn host_of(url: &str) -> Option<String> {
    let u = url::Url::parse(url).ok()?;
    u.host_str().map(|h| h.to_ascii_lowercase())
}

/// FNV-1a over the input bytes. Stable across runs and platforms (unlike
/// `HashMap`'s RandomState), so ids derived from it are reproducible.
pub fn stable_hash64(s: &str) -> u64 {
    let mut h: u64 = 1469598103934665603;
    for b in s.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(1099511628211);
    }
    h
}

const GENERIC_TITLES: &[&str] = &[
    "home",
    "index",
    "blog",
    "article",
    "untitled document",
    "search results",
    "error",
];

/// Titles that say nothing about the page; callers fall back to the first
/// `<h1>` (or the host) instead.
pub fn looks_generic_title(title: &str) -> bool {
    let t = title.trim().to_lowercase();
    t.is_empty() || GENERIC_TITLES.iter().any(|g| t == *g)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_runs_and_blank_lines() {
        let s = "a\t\tb   c\r\n\n\n\n\nd  ";
        assert_eq!(normalize_whitespace(s), "a b c\n\nd");
    }

    #[test]
    fn normalize_drops_leading_and_trailing_whitespace() {
        assert_eq!(normalize_whitespace("  \n\n  hello \n"), "hello");
        assert_eq!(normalize_whitespace(""), "");
        assert_eq!(normalize_whitespace(" \t \n "), "");
    }

    #[test]
    fn truncate_is_char_boundary_safe() {
        let (t, n, clipped) = truncate_chars("héllo", 2);
        assert_eq!(t, "hé");
        assert_eq!(n, 2);
        assert!(clipped);

        let (t, n, clipped) = truncate_chars("ok", 10);
        assert_eq!(t, "ok");
        assert_eq!(n, 2);
        assert!(!clipped);
    }

    #[test]
    fn host_of_lowercases_and_rejects_garbage() {
        assert_eq!(host_of("https://Example.COM/a"), Some("example.com".to_string()));
        assert_eq!(host_of("not a url"), None);
    }

    #[test]
    fn stable_hash_matches_known_fnv1a_vectors() {
        assert_eq!(stable_hash64(""), 0xcbf29ce484222325);
        assert_eq!(stable_hash64("a"), 0xaf63dc4c8601ec8c);
        assert_eq!(stable_hash64("foobar"), 0x85944171f73967e8);
    }

    #[test]
    fn generic_titles_are_flagged() {
        assert!(looks_generic_title("  Home "));
        assert!(looks_generic_title("Untitled Document"));
        assert!(looks_generic_title(""));
        assert!(!looks_generic_title("Rust borrow checker internals"));
    }
}

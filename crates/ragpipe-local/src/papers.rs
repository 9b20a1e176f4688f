//! Academic paper discovery over a Semantic Scholar style Graph API.
//!
//! Boundedness:
//! - Every request carries a `limit` clamp and an explicit timeout.
//! - Calls are spaced through a [`Pacer`]; the public pool tolerates roughly
//!   one request per second with an API key and much less without one.
//! - 429 responses get a small number of retries with doubling delay, then
//!   surface as `Error::Search`.
//!
//! Open-access policy lives in the caller: this module returns every paper
//! with its `is_open_access`/`pdf_url` metadata and lets the aggregator
//! decide what becomes a fetch candidate.

use ragpipe_core::{Error, Result};
use serde::Deserialize;
use std::time::{Duration, Instant};

const DEFAULT_ENDPOINT: &str = "https://api.semanticscholar.org/graph/v1/paper/search";
const FIELDS: &str = "title,abstract,year,authors,isOpenAccess,openAccessPdf,url,externalIds";
const PACE_WITH_KEY_MS: u64 = 1_100;
const PACE_KEYLESS_MS: u64 = 3_100;
const RATE_LIMIT_RETRIES: u32 = 2;
const RATE_LIMIT_BACKOFF_MS: u64 = 1_000;

fn squash_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn api_key_from_env() -> Option<String> {
    std::env::var("RAGPIPE_S2_API_KEY")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| {
            std::env::var("SEMANTIC_SCHOLAR_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
        })
}

fn endpoint_from_env() -> Option<String> {
    std::env::var("RAGPIPE_S2_ENDPOINT")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Spaces calls to a rate-limited API. `wait()` returns once at least
/// `min_interval` has passed since the previous permit; concurrent callers
/// queue on the internal lock.
pub struct Pacer {
    min_interval: Duration,
    last: tokio::sync::Mutex<Option<Instant>>,
}

impl Pacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Paper {
    pub title: String,
    pub year: Option<u32>,
    pub authors: Vec<String>,
    /// Landing page; what dedup and citations key on.
    pub url: Option<String>,
    pub is_open_access: bool,
    /// Direct PDF location when the paper is readable without a paywall.
    pub pdf_url: Option<String>,
    pub doi: Option<String>,
    pub arxiv_id: Option<String>,
    pub abstract_text: Option<String>,
}

pub struct PaperIndex {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    pacer: Pacer,
}

impl PaperIndex {
    pub fn new(
        client: reqwest::Client,
        endpoint: String,
        api_key: Option<String>,
        min_interval: Duration,
    ) -> Self {
        Self {
            client,
            endpoint,
            api_key,
            pacer: Pacer::new(min_interval),
        }
    }

    /// Keyless operation is legitimate (public pool), just slower.
    pub fn from_env(client: reqwest::Client) -> Self {
        let api_key = api_key_from_env();
        let pace_ms = if api_key.is_some() {
            PACE_WITH_KEY_MS
        } else {
            PACE_KEYLESS_MS
        };
        Self::new(
            client,
            endpoint_from_env().unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            api_key,
            Duration::from_millis(pace_ms),
        )
    }

    pub async fn search(&self, query: &str, limit: usize, timeout_ms: u64) -> Result<Vec<Paper>> {
        let q = query.trim();
        if q.is_empty() {
            return Err(Error::Search("paper query must be non-empty".to_string()));
        }
        let limit = limit.clamp(1, 50);
        let timeout_ms = timeout_ms.clamp(1_000, 60_000);

        let mut url =
            reqwest::Url::parse(&self.endpoint).map_err(|e| Error::Search(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("query", q)
            .append_pair("limit", &limit.to_string())
            .append_pair("fields", FIELDS);

        let mut attempt = 0u32;
        loop {
            self.pacer.wait().await;
            let mut req = self
                .client
                .get(url.clone())
                .timeout(Duration::from_millis(timeout_ms));
            if let Some(k) = &self.api_key {
                req = req.header("x-api-key", k);
            }
            let resp = req.send().await.map_err(|e| Error::Search(e.to_string()))?;
            let status = resp.status();
            if status.as_u16() == 429 && attempt < RATE_LIMIT_RETRIES {
                attempt += 1;
                let delay = RATE_LIMIT_BACKOFF_MS.saturating_mul(1 << (attempt - 1));
                tokio::time::sleep(Duration::from_millis(delay)).await;
                continue;
            }
            if !status.is_success() {
                return Err(Error::Search(format!("paper search HTTP {status}")));
            }
            let parsed: SearchResp = resp.json().await.map_err(|e| Error::Search(e.to_string()))?;
            return Ok(parsed
                .data
                .unwrap_or_default()
                .into_iter()
                .filter_map(collect_paper)
                .collect());
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResp {
    data: Option<Vec<Item>>,
}

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    #[serde(rename = "abstract")]
    abstract_text: Option<String>,
    year: Option<u32>,
    authors: Option<Vec<Author>>,
    url: Option<String>,
    #[serde(rename = "isOpenAccess")]
    is_open_access: Option<bool>,
    #[serde(rename = "openAccessPdf")]
    open_access_pdf: Option<OpenAccessPdf>,
    #[serde(rename = "externalIds")]
    external_ids: Option<ExternalIds>,
}

#[derive(Debug, Deserialize)]
struct Author {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAccessPdf {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExternalIds {
    #[serde(rename = "DOI")]
    doi: Option<String>,
    #[serde(rename = "ArXiv")]
    arxiv: Option<String>,
}

fn arxiv_pdf_url(id: &str) -> String {
    format!("https://arxiv.org/pdf/{}.pdf", id.trim())
}

fn collect_paper(it: Item) -> Option<Paper> {
    let title = squash_ws(&it.title.unwrap_or_default());
    if title.is_empty() {
        return None;
    }
    let authors = it
        .authors
        .unwrap_or_default()
        .into_iter()
        .filter_map(|a| a.name)
        .map(|s| squash_ws(&s))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();
    let (doi, arxiv_id) = it
        .external_ids
        .map(|x| (x.doi, x.arxiv))
        .unwrap_or((None, None));
    // Index responses sometimes omit openAccessPdf for arXiv entries even
    // though every arXiv paper has one; synthesize it from the id.
    let pdf_url = it
        .open_access_pdf
        .and_then(|p| p.url)
        .or_else(|| arxiv_id.as_deref().map(arxiv_pdf_url));
    let is_open_access = it.is_open_access.unwrap_or(false) || pdf_url.is_some();
    Some(Paper {
        title,
        year: it.year,
        authors,
        url: it.url,
        is_open_access,
        pdf_url,
        doi,
        arxiv_id,
        abstract_text: it
            .abstract_text
            .map(|s| squash_ws(&s))
            .filter(|s| !s.is_empty()),
    })
}

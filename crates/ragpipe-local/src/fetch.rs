//! Page fetching: a single-attempt `PageFetcher` over reqwest, plus the
//! `FetchPool` that layers per-host concurrency ceilings, bounded retry of
//! transient failures, and failure classification on top of it.

use ragpipe_core::{DocStatus, Error, PageFetcher, PageRequest, PageResponse, Result, SourceKind};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::extract;
use crate::textnorm;

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("ragpipe-local/0.1")
            .redirect(reqwest::redirect::Policy::limited(10))
            // Safety defaults: avoid "hang forever" on DNS/TLS/body stalls.
            // Per-request timeouts (PageRequest.timeout_ms) can still override.
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Fetch(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn map_send_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Fetch(e.to_string())
    }
}

#[async_trait::async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, req: &PageRequest) -> Result<PageResponse> {
        let mut timings_ms = BTreeMap::new();
        let t_req = std::time::Instant::now();
        let url = url::Url::parse(&req.url).map_err(|e| Error::InvalidUrl(e.to_string()))?;

        let mut rb = self.client.get(url);
        if let Some(to) = req.timeout() {
            rb = rb.timeout(to);
        }
        let resp = rb.send().await.map_err(map_send_error)?;
        let final_url = resp.url().to_string();
        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let max_bytes = req.max_bytes.unwrap_or(u64::MAX) as usize;
        let mut truncated = false;
        let mut bytes = Vec::new();
        let mut stream = resp.bytes_stream();
        use futures_util::StreamExt;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_send_error)?;
            if bytes.len().saturating_add(chunk.len()) > max_bytes {
                let can_take = max_bytes.saturating_sub(bytes.len());
                bytes.extend_from_slice(&chunk[..can_take]);
                truncated = true;
                break;
            }
            bytes.extend_from_slice(&chunk);
        }

        timings_ms.insert("network_fetch".to_string(), t_req.elapsed().as_millis());
        Ok(PageResponse {
            url: req.url.clone(),
            final_url,
            status,
            content_type,
            bytes,
            truncated,
            timings_ms,
        })
    }
}

/// What one pooled fetch produced: a usable page, or a classified failure
/// (already final; retries happened inside).
#[derive(Debug)]
pub enum FetchOutcome {
    Page(PageResponse),
    Failed { status: DocStatus, reason: String },
}

fn is_transient_status(code: u16) -> bool {
    code == 408 || code == 429 || code >= 500
}

#[derive(Debug, Clone)]
pub struct FetchPolicy {
    /// Extra attempts after the first, for transient failures only.
    pub retries: u32,
    /// First retry delay; doubles per attempt.
    pub backoff_ms: u64,
    /// Simultaneous requests per host.
    pub per_host_limit: usize,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            backoff_ms: 500,
            per_host_limit: 2,
        }
    }
}

/// Shared across the fetch worker pool; hosts get their semaphores lazily.
pub struct FetchPool {
    policy: FetchPolicy,
    per_host: Mutex<BTreeMap<String, Arc<Semaphore>>>,
}

impl FetchPool {
    pub fn new(policy: FetchPolicy) -> Self {
        let policy = FetchPolicy {
            retries: policy.retries.min(5),
            backoff_ms: policy.backoff_ms.clamp(10, 10_000),
            per_host_limit: policy.per_host_limit.clamp(1, 2),
        };
        Self {
            policy,
            per_host: Mutex::new(BTreeMap::new()),
        }
    }

    fn host_gate(&self, host: &str) -> Arc<Semaphore> {
        let mut map = self.per_host.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.policy.per_host_limit)))
            .clone()
    }

    /// Fetch with per-host politeness, transient-failure retry, and content
    /// kind classification. Web candidates must come back HTML-ish;
    /// academic candidates must come back as PDF bytes.
    pub async fn run(
        &self,
        fetcher: &dyn PageFetcher,
        req: &PageRequest,
        kind: SourceKind,
    ) -> FetchOutcome {
        let Some(host) = textnorm::host_of(&req.url) else {
            return FetchOutcome::Failed {
                status: DocStatus::FetchFailed,
                reason: format!("unparseable url: {}", req.url),
            };
        };
        let gate = self.host_gate(&host);
        let _permit = match gate.acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                return FetchOutcome::Failed {
                    status: DocStatus::FetchFailed,
                    reason: "host gate closed".to_string(),
                }
            }
        };

        let mut last: Option<FetchOutcome> = None;
        for attempt in 0..=self.policy.retries {
            if attempt > 0 {
                let delay = self.policy.backoff_ms.saturating_mul(1 << (attempt - 1));
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            match fetcher.fetch(req).await {
                Ok(resp) if (200..300).contains(&resp.status) => {
                    return classify_body(resp, kind);
                }
                Ok(resp) => {
                    let code = resp.status;
                    let out = FetchOutcome::Failed {
                        status: DocStatus::HttpError { code },
                        reason: format!("http status {code}"),
                    };
                    if !is_transient_status(code) {
                        return out;
                    }
                    last = Some(out);
                }
                Err(Error::Timeout(m)) => {
                    last = Some(FetchOutcome::Failed {
                        status: DocStatus::Timeout,
                        reason: m,
                    });
                }
                Err(Error::InvalidUrl(m)) => {
                    return FetchOutcome::Failed {
                        status: DocStatus::FetchFailed,
                        reason: m,
                    };
                }
                Err(e) => {
                    last = Some(FetchOutcome::Failed {
                        status: DocStatus::FetchFailed,
                        reason: e.to_string(),
                    });
                }
            }
        }
        last.unwrap_or(FetchOutcome::Failed {
            status: DocStatus::FetchFailed,
            reason: "no attempt made".to_string(),
        })
    }
}

/// Post-fetch content kind check. Not retryable: the server answered, it
/// just answered with something we do not index.
fn classify_body(resp: PageResponse, kind: SourceKind) -> FetchOutcome {
    let raw = extract::RawPage {
        bytes: &resp.bytes,
        content_type: resp.content_type.as_deref(),
        url: &resp.final_url,
    };
    match kind {
        SourceKind::Web => {
            if raw.is_html_like() {
                FetchOutcome::Page(resp)
            } else {
                FetchOutcome::Failed {
                    status: DocStatus::NonHtml,
                    reason: format!(
                        "content type {} is not html",
                        resp.content_type.as_deref().unwrap_or("unknown")
                    ),
                }
            }
        }
        SourceKind::Academic => {
            // Headers lie about PDFs often enough that the magic bytes win.
            if raw.is_pdf_like() {
                FetchOutcome::Page(resp)
            } else {
                FetchOutcome::Failed {
                    status: DocStatus::NonHtml,
                    reason: format!(
                        "expected pdf, got {}",
                        resp.content_type.as_deref().unwrap_or("unknown")
                    ),
                }
            }
        }
    }
}

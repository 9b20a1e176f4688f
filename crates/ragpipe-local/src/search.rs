use ragpipe_core::{Error, Result, SearchBackend, SearchHit, SearchQuery, SearchResponse};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Instant;

use crate::textnorm;

fn timeout_ms_from_query(q: &SearchQuery) -> u64 {
    // Provider requests can hang indefinitely without an explicit timeout.
    // Keep a conservative cap even if callers pass something huge.
    q.timeout_ms.unwrap_or(20_000).clamp(1_000, 60_000)
}

fn brave_api_key_from_env() -> Option<String> {
    std::env::var("RAGPIPE_BRAVE_API_KEY")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| {
            std::env::var("BRAVE_SEARCH_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
        })
}

fn brave_endpoint_from_env() -> Option<String> {
    std::env::var("RAGPIPE_BRAVE_ENDPOINT")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn searxng_endpoints_from_env() -> Vec<String> {
    let mut out: Vec<String> = Vec::new();

    // Allow a comma/whitespace-separated list of endpoints for simple load spreading.
    if let Ok(v) = std::env::var("RAGPIPE_SEARXNG_ENDPOINTS") {
        for raw in v.split(|c: char| c == ',' || c.is_whitespace()) {
            let s = raw.trim();
            if s.is_empty() {
                continue;
            }
            let s = s.to_string();
            if !out.contains(&s) {
                out.push(s);
            }
        }
    }

    // Back-compat: single endpoint.
    if let Ok(v) = std::env::var("RAGPIPE_SEARXNG_ENDPOINT") {
        let s = v.trim().to_string();
        if !s.is_empty() && !out.contains(&s) {
            out.push(s);
        }
    }

    out
}

#[derive(Debug, Clone)]
pub struct BraveSearch {
    client: reqwest::Client,
    api_key: String,
}

#[derive(Debug, Clone)]
pub struct SearxngSearch {
    client: reqwest::Client,
    endpoints: Vec<String>,
}

impl BraveSearch {
    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        let api_key = brave_api_key_from_env().ok_or_else(|| {
            Error::NotConfigured(
                "missing RAGPIPE_BRAVE_API_KEY (or BRAVE_SEARCH_API_KEY)".to_string(),
            )
        })?;
        Ok(Self { client, api_key })
    }

    fn endpoint() -> String {
        // Docs: https://api.search.brave.com/res/v1/web/search
        brave_endpoint_from_env()
            .unwrap_or_else(|| "https://api.search.brave.com/res/v1/web/search".to_string())
    }
}

impl SearxngSearch {
    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        let endpoints = searxng_endpoints_from_env();
        if endpoints.is_empty() {
            return Err(Error::NotConfigured(
                "missing RAGPIPE_SEARXNG_ENDPOINT (or RAGPIPE_SEARXNG_ENDPOINTS)".to_string(),
            ));
        }
        Ok(Self { client, endpoints })
    }

    fn endpoint_search_for(base_endpoint: &str) -> String {
        // Accept either a base URL (…/), or a full /search endpoint.
        let mut base = base_endpoint.trim().trim_end_matches('/').to_string();
        if !base.ends_with("/search") {
            base.push_str("/search");
        }
        base
    }

    fn pick_endpoint_index(&self, q: &SearchQuery) -> usize {
        if self.endpoints.is_empty() {
            return 0;
        }
        // Deterministic sharding: same query always lands on the same instance.
        (textnorm::stable_hash64(&q.query) as usize) % self.endpoints.len()
    }
}

#[derive(Debug, Deserialize)]
struct BraveWebSearchResponse {
    web: Option<BraveWeb>,
}

#[derive(Debug, Deserialize)]
struct BraveWeb {
    results: Option<Vec<BraveWebResult>>,
}

#[derive(Debug, Deserialize)]
struct BraveWebResult {
    url: String,
    title: Option<String>,
    description: Option<String>,
}

#[async_trait::async_trait]
impl SearchBackend for BraveSearch {
    fn name(&self) -> &'static str {
        "brave"
    }

    async fn search(&self, q: &SearchQuery) -> Result<SearchResponse> {
        let t0 = Instant::now();
        let timeout_ms = timeout_ms_from_query(q);

        let mut req = self
            .client
            .get(Self::endpoint())
            .header("X-Subscription-Token", &self.api_key)
            .query(&[("q", q.query.as_str())]);

        if let Some(n) = q.max_results {
            // Brave uses `count` for result count.
            req = req.query(&[("count", n.to_string())]);
        }

        let resp = req
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .send()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Search(format!("brave search HTTP {status}")));
        }

        let parsed: BraveWebSearchResponse = resp
            .json()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;
        let mut out = Vec::new();
        if let Some(web) = parsed.web {
            if let Some(results) = web.results {
                for r in results {
                    out.push(SearchHit {
                        url: r.url,
                        title: r.title,
                        snippet: r.description,
                    });
                }
            }
        }

        let mut timings_ms = BTreeMap::new();
        timings_ms.insert("search".to_string(), t0.elapsed().as_millis());

        Ok(SearchResponse {
            results: out,
            provider: "brave".to_string(),
            timings_ms,
        })
    }
}

#[derive(Debug, Deserialize)]
struct SearxngSearchResponse {
    results: Option<Vec<SearxngResult>>,
}

#[derive(Debug, Deserialize)]
struct SearxngResult {
    url: Option<String>,
    title: Option<String>,
    // SearXNG uses `content` for snippets in JSON format.
    content: Option<String>,
}

#[async_trait::async_trait]
impl SearchBackend for SearxngSearch {
    fn name(&self) -> &'static str {
        "searxng"
    }

    async fn search(&self, q: &SearchQuery) -> Result<SearchResponse> {
        let t0 = Instant::now();
        let max_results = q.max_results.unwrap_or(10).min(20);
        let timeout_ms = timeout_ms_from_query(q);

        let idx = self.pick_endpoint_index(q);
        let base_endpoint = self.endpoints.get(idx).map(|s| s.as_str()).unwrap_or("");
        let endpoint_search = Self::endpoint_search_for(base_endpoint);

        let resp = self
            .client
            .get(endpoint_search)
            .query(&[("q", q.query.as_str()), ("format", "json")])
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .send()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Search(format!("searxng search HTTP {status}")));
        }

        let parsed: SearxngSearchResponse = resp
            .json()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;

        let mut out = Vec::new();
        if let Some(rs) = parsed.results {
            for r in rs.into_iter().take(max_results) {
                let Some(url) = r.url else { continue };
                out.push(SearchHit {
                    url,
                    title: r.title,
                    snippet: r.content,
                });
            }
        }

        let mut timings_ms = BTreeMap::new();
        timings_ms.insert("search".to_string(), t0.elapsed().as_millis());

        Ok(SearchResponse {
            results: out,
            provider: "searxng".to_string(),
            timings_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Json, Router};
    use std::net::SocketAddr;

    struct EnvGuard {
        k: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(k: &'static str, v: &str) -> Self {
            let prev = std::env::var(k).ok();
            std::env::set_var(k, v);
            Self { k, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(v) = self.prev.take() {
                std::env::set_var(self.k, v);
            } else {
                std::env::remove_var(self.k);
            }
        }
    }

    async fn serve(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[test]
    fn empty_api_keys_are_treated_as_missing() {
        let _g1 = EnvGuard::set("RAGPIPE_BRAVE_API_KEY", "");
        let _g2 = EnvGuard::set("BRAVE_SEARCH_API_KEY", "   ");
        // These should behave the same as "unset".
        assert!(brave_api_key_from_env().is_none());
    }

    #[test]
    fn parses_minimal_brave_shape() {
        let js = r#"
        {
          "web": {
            "results": [
              {"url":"https://example.com","title":"Example","description":"Hello"}
            ]
          }
        }
        "#;
        let parsed: BraveWebSearchResponse = serde_json::from_str(js).unwrap();
        let web = parsed.web.unwrap();
        let rs = web.results.unwrap();
        assert_eq!(rs.len(), 1);
        assert_eq!(rs[0].url, "https://example.com");
        assert_eq!(rs[0].title.as_deref(), Some("Example"));
        assert_eq!(rs[0].description.as_deref(), Some("Hello"));
    }

    #[test]
    fn parses_minimal_searxng_shape() {
        let js = r#"
        {
          "results": [
            {"url":"https://example.com","title":"Example","content":"Hello"}
          ]
        }
        "#;
        let parsed: SearxngSearchResponse = serde_json::from_str(js).unwrap();
        assert_eq!(parsed.results.unwrap().len(), 1);
    }

    #[test]
    fn searxng_endpoints_from_env_accepts_list_and_dedups() {
        let _g1 = EnvGuard::set("RAGPIPE_SEARXNG_ENDPOINTS", "http://a, http://b http://a");
        let _g2 = EnvGuard::set("RAGPIPE_SEARXNG_ENDPOINT", "http://b");
        let eps = searxng_endpoints_from_env();
        assert_eq!(eps, vec!["http://a".to_string(), "http://b".to_string()]);
    }

    #[test]
    fn searxng_endpoint_sharding_is_deterministic_for_same_query() {
        let p = SearxngSearch {
            client: reqwest::Client::new(),
            endpoints: vec!["http://a".to_string(), "http://b".to_string()],
        };
        let q = SearchQuery {
            query: "hello world".to_string(),
            max_results: None,
            timeout_ms: None,
        };
        let i1 = p.pick_endpoint_index(&q);
        let i2 = p.pick_endpoint_index(&q);
        assert_eq!(i1, i2);
        assert!(i1 < 2);
    }

    #[tokio::test]
    async fn searxng_search_round_trips_against_local_instance() {
        let app = Router::new().route(
            "/search",
            get(|| async {
                Json(serde_json::json!({
                    "results": [
                        {"url": "https://example.com/a", "title": "A", "content": "first"},
                        {"title": "no url, skipped"},
                        {"url": "https://example.com/b", "title": "B", "content": "second"}
                    ]
                }))
            }),
        );
        let addr = serve(app).await;

        let p = SearxngSearch {
            client: reqwest::Client::new(),
            endpoints: vec![format!("http://{addr}")],
        };
        let resp = p
            .search(&SearchQuery {
                query: "anything".to_string(),
                max_results: Some(10),
                timeout_ms: Some(2_000),
            })
            .await
            .unwrap();
        assert_eq!(resp.provider, "searxng");
        assert_eq!(resp.results.len(), 2, "entries without a url are dropped");
        assert_eq!(resp.results[0].url, "https://example.com/a");
        assert!(resp.timings_ms.contains_key("search"));
    }

    #[tokio::test]
    async fn brave_search_sends_subscription_token() {
        use axum::http::HeaderMap;
        let app = Router::new().route(
            "/res/v1/web/search",
            get(|headers: HeaderMap| async move {
                assert_eq!(
                    headers
                        .get("X-Subscription-Token")
                        .and_then(|v| v.to_str().ok()),
                    Some("test-key")
                );
                Json(serde_json::json!({
                    "web": {"results": [{"url": "https://example.com", "title": "E"}]}
                }))
            }),
        );
        let addr = serve(app).await;
        let _g = EnvGuard::set(
            "RAGPIPE_BRAVE_ENDPOINT",
            &format!("http://{addr}/res/v1/web/search"),
        );

        let p = BraveSearch {
            client: reqwest::Client::new(),
            api_key: "test-key".to_string(),
        };
        let resp = p
            .search(&SearchQuery {
                query: "rust".to_string(),
                max_results: Some(3),
                timeout_ms: Some(2_000),
            })
            .await
            .unwrap();
        assert_eq!(resp.results.len(), 1);
        assert_eq!(resp.results[0].url, "https://example.com");
    }
}

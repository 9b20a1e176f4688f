use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("search failed: {0}")]
    Search(String),
    #[error("llm failed: {0}")]
    Llm(String),
    #[error("embedding failed: {0}")]
    Embedding(String),
    #[error("vector store error: {0}")]
    Store(String),
    #[error("plan generation failed: {0}")]
    Plan(String),
    #[error("not configured: {0}")]
    NotConfigured(String),
    #[error("not supported: {0}")]
    NotSupported(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// One (plan item, search query) unit of work. Immutable provenance carried
/// through search, fetch, extraction and indexing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub query: String,
    pub plan_item_id: String,
    pub plan_item: String,
    pub query_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Web,
    Academic,
}

/// A validated (url, title) pair accepted for fetching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub url: String,
    pub title: Option<String>,
    pub source: SourceKind,
    /// Academic candidates: open-access PDF location the body is fetched
    /// from. `url` stays the landing page and is what dedup/citations use.
    pub pdf_url: Option<String>,
    pub task: Task,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DocStatus {
    Success,
    FetchFailed,
    ExtractionFailed,
    NonHtml,
    HttpError { code: u16 },
    Timeout,
}

impl DocStatus {
    /// Flat label for summary counting (`http_error_404` style).
    pub fn label(&self) -> String {
        match self {
            DocStatus::Success => "success".to_string(),
            DocStatus::FetchFailed => "fetch_failed".to_string(),
            DocStatus::ExtractionFailed => "extraction_failed".to_string(),
            DocStatus::NonHtml => "non_html".to_string(),
            DocStatus::HttpError { code } => format!("http_error_{code}"),
            DocStatus::Timeout => "timeout".to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DocStatus::Success)
    }
}

/// Outcome for one candidate URL, success or classified failure. Failures
/// are retained (with `failure_reason`), never dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionRecord {
    pub url: String,
    pub final_url: String,
    pub title: Option<String>,
    pub text: Option<String>,
    pub method: Option<String>,
    pub status: DocStatus,
    pub failure_reason: Option<String>,
    pub task: Task,
}

impl ExtractionRecord {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkMetadata {
    pub url: String,
    pub title: String,
    pub plan_item: String,
    pub plan_item_id: String,
    pub source_query: String,
    pub chunk_index: usize,
    /// First ~120 chars of the chunk, for diagnostics.
    pub preview: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryMatch {
    pub id: String,
    pub document: String,
    pub metadata: ChunkMetadata,
    /// Stores are allowed to omit distances; callers fall back to result
    /// order.
    pub distance: Option<f32>,
}

/// A source actually cited by a generated section. Deduplicated by URL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsedSource {
    pub url: String,
    pub title: String,
    pub plan_item: String,
    pub plan_item_id: String,
    pub source_query: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SectionRole {
    Introduction,
    Body,
    Conclusion,
    References,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanItem {
    pub title: String,
    pub role: SectionRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub index: usize,
    pub title: String,
    pub role: SectionRole,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRequest {
    pub url: String,
    /// Timeout for the operation (network + body streaming).
    pub timeout_ms: Option<u64>,
    /// Hard cap on bytes read from the response body.
    pub max_bytes: Option<u64>,
}

impl PageRequest {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResponse {
    pub url: String,
    pub final_url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
    pub truncated: bool,
    pub timings_ms: BTreeMap<String, u128>,
}

impl PageResponse {
    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).to_string()
    }
}

/// Single-attempt page fetch. Non-2xx responses are `Ok` and carry `status`;
/// `Err` means the request never produced a response (timeout, transport,
/// bad url). Retry/classification policy lives above this trait.
#[async_trait::async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, req: &PageRequest) -> Result<PageResponse>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    pub query: String,
    pub max_results: Option<usize>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    pub title: Option<String>,
    pub snippet: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    pub provider: String,
    pub timings_ms: BTreeMap<String, u128>,
}

#[async_trait::async_trait]
pub trait SearchBackend: Send + Sync {
    fn name(&self) -> &'static str;
    async fn search(&self, q: &SearchQuery) -> Result<SearchResponse>;
}

/// Text-generation service. An empty/whitespace completion is an
/// `Error::Llm`, so callers can treat every `Ok` as usable prose.
#[async_trait::async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, system: &str, prompt: &str, timeout_ms: u64) -> Result<String>;
}

#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str, timeout_ms: u64) -> Result<Vec<f32>>;
}

/// Vector store contract. Collections are created implicitly on first
/// insert and torn down per run via `delete_collection`.
#[async_trait::async_trait]
pub trait VectorStore: Send + Sync {
    async fn insert(
        &self,
        collection: &str,
        id: &str,
        vector: &[f32],
        document: &str,
        metadata: &ChunkMetadata,
    ) -> Result<()>;

    async fn query(&self, collection: &str, vector: &[f32], k: usize) -> Result<Vec<QueryMatch>>;

    async fn delete_collection(&self, collection: &str) -> Result<()>;
}

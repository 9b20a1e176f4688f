//! The composed run: plan, queries, acquisition, indexing, generation,
//! assembly, teardown.
//!
//! `ResearchPipeline` owns nothing but trait objects, so the whole run is
//! drivable from tests with stub backends. The only run-fatal step is
//! outline generation; every later phase records its trouble on the
//! summary and the warning list and the run carries on to a report.

use crate::index::Indexer;
use crate::orchestrate::{self, AggregateOptions, FetchOptions, RunLedger, RunSummary};
use crate::plan;
use crate::section::{SectionOutput, SectionWriter};
use ragpipe_core::{
    Embedder, Error, PageFetcher, Result, SearchBackend, Section, TextGenerator, UsedSource,
    VectorStore,
};
use ragpipe_local::extract::ExtractChain;
use ragpipe_local::fetch::{FetchPolicy, FetchPool, HttpFetcher};
use ragpipe_local::ollama::OllamaClient;
use ragpipe_local::papers::PaperIndex;
use ragpipe_local::render::RenderSession;
use ragpipe_local::search::{BraveSearch, SearxngSearch};
use ragpipe_local::store::MemoryVectorStore;
use ragpipe_local::textnorm;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

fn env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_usize(name: &str) -> Option<usize> {
    env(name).and_then(|v| v.parse().ok())
}

fn env_u64(name: &str) -> Option<u64> {
    env(name).and_then(|v| v.parse().ok())
}

/// Pipeline tunables. `Default` is sized for a polite local run;
/// `from_env` layers `RAGPIPE_*` overrides on top, clamped to the same
/// ranges the phases enforce themselves.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Candidates each task may dispatch for fetching.
    pub per_task_target: usize,
    /// Search queries generated per body section.
    pub queries_per_section: usize,
    /// Over-request multiplier for search calls.
    pub buffer_factor: usize,
    pub max_backend_results: usize,
    pub papers_per_task: usize,
    /// Concurrent fetches.
    pub workers: usize,
    /// Simultaneous requests per host.
    pub per_host_limit: usize,
    pub page_timeout_ms: u64,
    pub pdf_timeout_ms: u64,
    pub max_page_bytes: u64,
    pub max_pdf_bytes: u64,
    pub search_timeout_ms: u64,
    pub llm_timeout_ms: u64,
    pub embed_timeout_ms: u64,
    /// Chunks requested per retrieval query.
    pub retrieve_k: usize,
    pub chunk_chars: usize,
    pub chunk_overlap: usize,
    pub search_retries: u32,
    pub search_backoff_ms: u64,
    pub fetch_retries: u32,
    pub fetch_backoff_ms: u64,
    /// Minimum interval between calls to the same web search backend.
    pub web_pace_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            per_task_target: 3,
            queries_per_section: 1,
            buffer_factor: 2,
            max_backend_results: 20,
            papers_per_task: 6,
            workers: 8,
            per_host_limit: 2,
            page_timeout_ms: 15_000,
            pdf_timeout_ms: 30_000,
            max_page_bytes: 4_000_000,
            max_pdf_bytes: 25_000_000,
            search_timeout_ms: 20_000,
            llm_timeout_ms: 180_000,
            embed_timeout_ms: 60_000,
            retrieve_k: crate::retrieve::TOP_K,
            chunk_chars: crate::index::CHUNK_CHARS,
            chunk_overlap: crate::index::CHUNK_OVERLAP,
            search_retries: 2,
            search_backoff_ms: 500,
            fetch_retries: 2,
            fetch_backoff_ms: 500,
            web_pace_ms: 1_000,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            per_task_target: env_usize("RAGPIPE_TARGET_PER_TASK")
                .unwrap_or(d.per_task_target)
                .clamp(1, 20),
            queries_per_section: env_usize("RAGPIPE_QUERIES_PER_SECTION")
                .unwrap_or(d.queries_per_section)
                .clamp(1, 5),
            papers_per_task: env_usize("RAGPIPE_PAPERS_PER_TASK")
                .unwrap_or(d.papers_per_task)
                .clamp(1, 20),
            workers: env_usize("RAGPIPE_WORKERS").unwrap_or(d.workers).clamp(4, 16),
            page_timeout_ms: env_u64("RAGPIPE_PAGE_TIMEOUT_MS")
                .unwrap_or(d.page_timeout_ms)
                .clamp(1_000, 60_000),
            pdf_timeout_ms: env_u64("RAGPIPE_PDF_TIMEOUT_MS")
                .unwrap_or(d.pdf_timeout_ms)
                .clamp(1_000, 120_000),
            llm_timeout_ms: env_u64("RAGPIPE_LLM_TIMEOUT_MS")
                .unwrap_or(d.llm_timeout_ms)
                .clamp(1_000, 600_000),
            embed_timeout_ms: env_u64("RAGPIPE_EMBED_TIMEOUT_MS")
                .unwrap_or(d.embed_timeout_ms)
                .clamp(1_000, 600_000),
            retrieve_k: env_usize("RAGPIPE_RETRIEVE_K").unwrap_or(d.retrieve_k).clamp(1, 50),
            chunk_chars: env_usize("RAGPIPE_CHUNK_CHARS")
                .unwrap_or(d.chunk_chars)
                .clamp(500, 100_000),
            chunk_overlap: env_usize("RAGPIPE_CHUNK_OVERLAP")
                .unwrap_or(d.chunk_overlap)
                .min(10_000),
            ..d
        }
    }
}

/// Everything `run` produces. `markdown` is the assembled report; the
/// rest is provenance and run health for callers that want more than the
/// text.
#[derive(Debug, Clone, Serialize)]
pub struct ResearchReport {
    pub topic: String,
    pub markdown: String,
    pub sections: Vec<Section>,
    pub used_sources: Vec<UsedSource>,
    pub summary: RunSummary,
    pub warnings: Vec<&'static str>,
    pub timings_ms: BTreeMap<String, u128>,
}

/// The pluggable parts a pipeline runs over. `from_env` wires the local
/// stack; tests wire stubs.
pub struct PipelineParts {
    pub generator: Arc<dyn TextGenerator>,
    pub embedder: Arc<dyn Embedder>,
    pub store: Arc<dyn VectorStore>,
    pub fetcher: Arc<dyn PageFetcher>,
    pub web_backends: Vec<Arc<dyn SearchBackend>>,
    pub papers: Option<PaperIndex>,
    pub render: Option<RenderSession>,
}

pub struct ResearchPipeline {
    parts: PipelineParts,
    config: PipelineConfig,
}

impl ResearchPipeline {
    pub fn new(parts: PipelineParts, config: PipelineConfig) -> Self {
        Self { parts, config }
    }

    /// Wire the local stack from the environment. Ollama is required for
    /// generation and embeddings; each search backend joins when its
    /// variables are set, and the browser renderer only when enabled.
    pub fn from_env() -> Result<Self> {
        let client = ragpipe_local::default_http_client()?;
        let ollama = Arc::new(OllamaClient::from_env(client.clone())?);

        let mut web_backends: Vec<Arc<dyn SearchBackend>> = Vec::new();
        if let Ok(brave) = BraveSearch::from_env(client.clone()) {
            web_backends.push(Arc::new(brave));
        }
        if let Ok(searx) = SearxngSearch::from_env(client.clone()) {
            web_backends.push(Arc::new(searx));
        }

        let parts = PipelineParts {
            generator: ollama.clone(),
            embedder: ollama,
            store: Arc::new(MemoryVectorStore::new()),
            fetcher: Arc::new(HttpFetcher::new()?),
            web_backends,
            papers: Some(PaperIndex::from_env(client)),
            render: RenderSession::from_env().ok(),
        };
        Ok(Self::new(parts, PipelineConfig::from_env()))
    }

    /// Run the full research loop for one topic.
    pub async fn run(&self, topic: &str) -> Result<ResearchReport> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(Error::Plan("empty topic".to_string()));
        }
        let config = &self.config;
        let parts = &self.parts;
        let mut warnings: Vec<&'static str> = Vec::new();
        let mut timings_ms: BTreeMap<String, u128> = BTreeMap::new();

        // Same-topic reruns leave a stale collection behind in stores that
        // outlive the run, so reset before indexing anything.
        let collection = collection_name(topic);
        if parts.store.delete_collection(&collection).await.is_err() {
            warnings.push("collection_reset_failed");
        }

        let phase = Instant::now();
        let plan =
            plan::research_plan(parts.generator.as_ref(), topic, config.llm_timeout_ms).await?;
        timings_ms.insert("plan".to_string(), phase.elapsed().as_millis());

        let phase = Instant::now();
        let tasks = plan::build_tasks(
            parts.generator.as_ref(),
            topic,
            &plan,
            config.queries_per_section,
            config.llm_timeout_ms,
        )
        .await;
        timings_ms.insert("queries".to_string(), phase.elapsed().as_millis());
        if tasks.is_empty() {
            warnings.push("no_search_tasks");
        }

        let phase = Instant::now();
        let ledger = RunLedger::new();
        let batch = orchestrate::gather_candidates(
            &parts.web_backends,
            parts.papers.as_ref(),
            &tasks,
            &ledger,
            &self.aggregate_options(),
        )
        .await;
        let stats = batch.stats.clone();
        let pool = FetchPool::new(FetchPolicy {
            retries: config.fetch_retries,
            backoff_ms: config.fetch_backoff_ms,
            per_host_limit: config.per_host_limit,
        });
        let chain = ExtractChain::default();
        let records = orchestrate::fetch_and_extract(
            batch.candidates,
            parts.fetcher.as_ref(),
            &pool,
            &chain,
            parts.render.as_ref(),
            &self.fetch_options(),
        )
        .await;
        timings_ms.insert("acquisition".to_string(), phase.elapsed().as_millis());

        let phase = Instant::now();
        let mut indexer = Indexer::new(parts.embedder.as_ref(), parts.store.as_ref(), &collection)
            .with_chunking(config.chunk_chars, config.chunk_overlap)
            .with_embed_timeout(config.embed_timeout_ms);
        let index_outcome = indexer.index_batch(&records).await;
        timings_ms.insert("indexing".to_string(), phase.elapsed().as_millis());
        if index_outcome.chunks == 0 && !tasks.is_empty() {
            warnings.push("no_chunks_indexed");
        }

        let phase = Instant::now();
        let writer = SectionWriter {
            generator: parts.generator.as_ref(),
            embedder: parts.embedder.as_ref(),
            store: parts.store.as_ref(),
            collection: &collection,
            topic,
            plan: &plan,
            retrieve_k: config.retrieve_k,
            llm_timeout_ms: config.llm_timeout_ms,
            embed_timeout_ms: config.embed_timeout_ms,
        };
        let SectionOutput { sections, used_sources, generation_failures } =
            writer.write_all().await;
        timings_ms.insert("generation".to_string(), phase.elapsed().as_millis());

        let mut summary = orchestrate::summarize_run(&ledger, &tasks, &records, &stats);
        summary.documents_indexed = index_outcome.documents;
        summary.chunks_indexed = index_outcome.chunks;
        summary.embedding_errors = index_outcome.embedding_errors;
        summary.vector_store_errors = index_outcome.store_errors;
        summary.generation_failures = generation_failures;
        if stats.backend_errors > 0 {
            warnings.push("search_backend_error");
        }
        if index_outcome.embedding_errors > 0 || index_outcome.store_errors > 0 {
            warnings.push("partial_indexing");
        }
        if generation_failures > 0 {
            warnings.push("section_generation_failed");
        }

        // The collection is scoped to the run; leave nothing behind.
        if parts.store.delete_collection(&collection).await.is_err() {
            warnings.push("collection_teardown_failed");
        }
        if let Some(render) = &parts.render {
            render.shutdown().await;
        }

        let markdown = render_markdown(topic, &sections);
        Ok(ResearchReport {
            topic: topic.to_string(),
            markdown,
            sections,
            used_sources,
            summary,
            warnings,
            timings_ms,
        })
    }

    fn aggregate_options(&self) -> AggregateOptions {
        let c = &self.config;
        AggregateOptions {
            per_task_target: c.per_task_target,
            buffer_factor: c.buffer_factor,
            max_backend_results: c.max_backend_results,
            papers_per_task: c.papers_per_task,
            search_timeout_ms: c.search_timeout_ms,
            retries: c.search_retries,
            backoff_ms: c.search_backoff_ms,
            web_pace_ms: c.web_pace_ms,
        }
    }

    fn fetch_options(&self) -> FetchOptions {
        let c = &self.config;
        FetchOptions {
            workers: c.workers,
            page_timeout_ms: c.page_timeout_ms,
            pdf_timeout_ms: c.pdf_timeout_ms,
            max_page_bytes: c.max_page_bytes,
            max_pdf_bytes: c.max_pdf_bytes,
        }
    }
}

/// One collection per topic, reproducible across runs.
pub fn collection_name(topic: &str) -> String {
    format!("research_{:016x}", textnorm::stable_hash64(topic))
}

/// `# Research: {topic}`, then one `## {title}` block per section.
pub fn render_markdown(topic: &str, sections: &[Section]) -> String {
    let mut out = format!("# Research: {topic}\n");
    for section in sections {
        out.push_str("\n## ");
        out.push_str(&section.title);
        out.push_str("\n\n");
        out.push_str(&section.text);
        out.push('\n');
    }
    out
}

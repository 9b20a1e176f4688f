//! Full pipeline run against local fixtures: a scripted generator, a stub
//! search backend, and an axum server standing in for the web.

use ragpipe_core::{
    Embedder, Result, SearchBackend, SearchHit, SearchQuery, SearchResponse, TextGenerator,
};
use ragpipe_local::fetch::HttpFetcher;
use ragpipe_local::store::MemoryVectorStore;
use ragpipe_report::pipeline::collection_name;
use ragpipe_report::{PipelineConfig, PipelineParts, ResearchPipeline};
use std::collections::BTreeMap;
use std::sync::Arc;

async fn serve(app: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// Dispatches on the prompts the pipeline is known to send.
struct ScriptedGen;

#[async_trait::async_trait]
impl TextGenerator for ScriptedGen {
    async fn generate(&self, system: &str, prompt: &str, _timeout_ms: u64) -> Result<String> {
        if prompt.contains("outline for a research report") {
            return Ok("1. Introduction\n2. Forage ecology\n3. Conclusion\n4. References"
                .to_string());
        }
        if system.contains("search queries") {
            return Ok("honeybee forage ecology".to_string());
        }
        Ok(format!("Prose for: {prompt}"))
    }
}

struct FixedEmbed(Vec<f32>);

#[async_trait::async_trait]
impl Embedder for FixedEmbed {
    async fn embed(&self, _text: &str, _timeout_ms: u64) -> Result<Vec<f32>> {
        Ok(self.0.clone())
    }
}

struct StubSearch {
    hits: Vec<String>,
}

#[async_trait::async_trait]
impl SearchBackend for StubSearch {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn search(&self, _query: &SearchQuery) -> Result<SearchResponse> {
        Ok(SearchResponse {
            results: self
                .hits
                .iter()
                .map(|u| SearchHit {
                    url: u.clone(),
                    title: Some("Forage study".to_string()),
                    snippet: None,
                })
                .collect(),
            provider: "stub".to_string(),
            timings_ms: BTreeMap::new(),
        })
    }
}

fn quick_config() -> PipelineConfig {
    PipelineConfig {
        per_task_target: 2,
        web_pace_ms: 1,
        search_backoff_ms: 10,
        fetch_backoff_ms: 10,
        ..PipelineConfig::default()
    }
}

fn parts(
    store: Arc<MemoryVectorStore>,
    hits: Vec<String>,
) -> PipelineParts {
    let web_backends: Vec<Arc<dyn SearchBackend>> = vec![Arc::new(StubSearch { hits })];
    PipelineParts {
        generator: Arc::new(ScriptedGen),
        embedder: Arc::new(FixedEmbed(vec![1.0, 0.0])),
        store,
        fetcher: Arc::new(HttpFetcher::new().unwrap()),
        web_backends,
        papers: None,
        render: None,
    }
}

#[tokio::test]
async fn pipeline_produces_a_grounded_report() {
    let article = "Honeybee foraging ranges span several kilometers, and the seasonal \
                   availability of forage shapes colony growth in ways that are well \
                   documented across climates and landscapes. "
        .repeat(4);
    let page = format!(
        "<html><head><title>Forage study</title></head><body><article><p>{article}</p></article></body></html>"
    );
    let app = axum::Router::new().route(
        "/articles/forage",
        axum::routing::get(move || {
            let page = page.clone();
            async move { axum::response::Html(page) }
        }),
    );
    let base = serve(app).await;
    let article_url = format!("{base}/articles/forage");

    let store = Arc::new(MemoryVectorStore::new());
    let pipeline = ResearchPipeline::new(
        parts(store.clone(), vec![article_url.clone()]),
        quick_config(),
    );
    let report = pipeline.run("honeybee foraging").await.unwrap();

    assert!(report.markdown.starts_with("# Research: honeybee foraging\n"));
    assert_eq!(report.sections.len(), 4);
    assert_eq!(report.sections[0].title, "Introduction");
    assert_eq!(report.sections[1].title, "Forage ecology");
    assert_eq!(report.sections[3].title, "References");

    assert_eq!(report.used_sources.len(), 1);
    assert_eq!(report.used_sources[0].url, article_url);
    assert!(
        report.sections[3].text.contains(&article_url),
        "references must cite the fetched page: {}",
        report.sections[3].text
    );

    assert_eq!(report.summary.documents_indexed, 1);
    assert_eq!(report.summary.chunks_indexed, 1);
    assert_eq!(report.summary.status_counts["success"], 1);
    assert_eq!(report.summary.generation_failures, 0);
    for task in &report.summary.tasks {
        assert!(task.yielded <= task.target);
    }
    for key in ["plan", "queries", "acquisition", "indexing", "generation"] {
        assert!(report.timings_ms.contains_key(key), "missing timing {key}");
    }

    // The per-topic collection is torn down at the end of the run.
    assert_eq!(store.count(&collection_name("honeybee foraging")), 0);
}

#[tokio::test]
async fn topic_whitespace_is_trimmed_in_the_header() {
    let store = Arc::new(MemoryVectorStore::new());
    let pipeline = ResearchPipeline::new(parts(store, Vec::new()), quick_config());
    let report = pipeline.run("  honeybee foraging  ").await.unwrap();
    assert_eq!(report.topic, "honeybee foraging");
    assert!(report.markdown.starts_with("# Research: honeybee foraging\n"));
}

#[tokio::test]
async fn an_empty_topic_fails_before_doing_any_work() {
    let store = Arc::new(MemoryVectorStore::new());
    let pipeline = ResearchPipeline::new(parts(store, Vec::new()), quick_config());
    let err = pipeline.run("   ").await.unwrap_err();
    assert!(matches!(err, ragpipe_core::Error::Plan(_)), "got: {err:?}");
}

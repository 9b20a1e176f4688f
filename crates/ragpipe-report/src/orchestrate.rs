//! Candidate acquisition: paced search fan-out, then bounded concurrent
//! fetch and extraction.
//!
//! All cross-task state lives in one `RunLedger` behind one lock, so the
//! two invariants that matter here are easy to audit: a URL is dispatched
//! at most once per run, and a task never yields more candidates than its
//! target. Everything that goes wrong below the run level is recorded as
//! data (a classified `ExtractionRecord`, a counter on the stats), never
//! surfaced as an `Err`.

use futures::stream::{self, StreamExt};
use ragpipe_core::{
    Candidate, DocStatus, Error, ExtractionRecord, PageFetcher, PageRequest, Result,
    SearchBackend, SearchQuery, SearchResponse, SourceKind, Task,
};
use ragpipe_local::extract::{ExtractChain, Extraction, RawPage};
use ragpipe_local::fetch::{FetchOutcome, FetchPool};
use ragpipe_local::papers::{Pacer, Paper, PaperIndex};
use ragpipe_local::render::RenderSession;
use ragpipe_local::validate;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Per-task quota progress.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TaskProgress {
    /// Candidates this task may dispatch for fetching.
    pub target: usize,
    /// Candidates actually dispatched (claimed).
    pub yielded: usize,
    /// Raw results the backends returned, before validation and dedup.
    pub found: usize,
}

#[derive(Default)]
struct LedgerState {
    seen: BTreeSet<String>,
    tasks: BTreeMap<String, TaskProgress>,
}

/// One lock over all cross-task acquisition state. The search phase is
/// sequential today, but claims stay atomic so the phase can be fanned
/// out without touching the accounting.
pub struct RunLedger {
    inner: Mutex<LedgerState>,
}

impl RunLedger {
    pub fn new() -> Self {
        Self { inner: Mutex::new(LedgerState::default()) }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register_task(&self, query_id: &str, target: usize) {
        let mut s = self.lock();
        s.tasks.entry(query_id.to_string()).or_default().target = target;
    }

    /// Count raw backend results against a task.
    pub fn note_found(&self, query_id: &str, n: usize) {
        let mut s = self.lock();
        if let Some(t) = s.tasks.get_mut(query_id) {
            t.found += n;
        }
    }

    /// Atomically claim a URL for a task. Refused when the URL was already
    /// dispatched this run, the task is unknown, or the task has met its
    /// target; on success the URL and the yielded count move together.
    pub fn try_claim(&self, query_id: &str, url: &str) -> bool {
        let mut s = self.lock();
        if s.seen.contains(url) {
            return false;
        }
        let Some(t) = s.tasks.get_mut(query_id) else {
            return false;
        };
        if t.yielded >= t.target {
            return false;
        }
        t.yielded += 1;
        s.seen.insert(url.to_string());
        true
    }

    /// Mark a URL dispatched without charging any task's quota, e.g. the
    /// PDF location behind an academic landing page.
    pub fn mark_seen(&self, url: &str) {
        self.lock().seen.insert(url.to_string());
    }

    pub fn remaining(&self, query_id: &str) -> usize {
        let s = self.lock();
        s.tasks
            .get(query_id)
            .map(|t| t.target.saturating_sub(t.yielded))
            .unwrap_or(0)
    }

    pub fn progress(&self) -> BTreeMap<String, TaskProgress> {
        self.lock().tasks.clone()
    }
}

impl Default for RunLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// Knobs for the search phase.
#[derive(Debug, Clone)]
pub struct AggregateOptions {
    /// Candidates each task may dispatch for fetching.
    pub per_task_target: usize,
    /// Over-request multiplier to absorb validator rejections and dedup.
    pub buffer_factor: usize,
    /// Hard cap on results requested from one backend call.
    pub max_backend_results: usize,
    /// Papers requested per task from the academic index.
    pub papers_per_task: usize,
    pub search_timeout_ms: u64,
    /// Extra attempts per backend call after the first.
    pub retries: u32,
    /// First retry delay; doubles per attempt.
    pub backoff_ms: u64,
    /// Minimum interval between calls to the same web backend.
    pub web_pace_ms: u64,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self {
            per_task_target: 3,
            buffer_factor: 2,
            max_backend_results: 20,
            papers_per_task: 6,
            search_timeout_ms: 20_000,
            retries: 2,
            backoff_ms: 500,
            web_pace_ms: 1_000,
        }
    }
}

/// What the search phase produced besides the candidates themselves.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchStats {
    /// Tasks that ended the phase with zero dispatched candidates.
    pub zero_url_tasks: Vec<String>,
    /// Papers dropped because no open-access PDF was available.
    pub papers_skipped_closed_access: usize,
    /// Backend calls that still failed after retries.
    pub backend_errors: usize,
}

#[derive(Debug, Default)]
pub struct CandidateBatch {
    pub candidates: Vec<Candidate>,
    pub stats: BatchStats,
}

/// Sequential, paced search fan-out. Web backends run in priority order
/// first; the academic index only sees tasks that still have quota left
/// after the web pass. Backend failures are counted and skipped, never
/// fatal: a task with nothing to show is listed in `zero_url_tasks` and
/// the run moves on.
pub async fn gather_candidates(
    web: &[Arc<dyn SearchBackend>],
    papers: Option<&PaperIndex>,
    tasks: &[Task],
    ledger: &RunLedger,
    opts: &AggregateOptions,
) -> CandidateBatch {
    let mut batch = CandidateBatch::default();
    let pacers: Vec<Pacer> = web
        .iter()
        .map(|_| Pacer::new(Duration::from_millis(opts.web_pace_ms)))
        .collect();

    for task in tasks {
        ledger.register_task(&task.query_id, opts.per_task_target);
        let mut dispatched = 0usize;

        for (backend, pacer) in web.iter().zip(&pacers) {
            let remaining = ledger.remaining(&task.query_id);
            if remaining == 0 {
                break;
            }
            let want = remaining
                .saturating_mul(opts.buffer_factor.max(1))
                .clamp(1, opts.max_backend_results.max(1));
            let query = SearchQuery {
                query: task.query.clone(),
                max_results: Some(want),
                timeout_ms: Some(opts.search_timeout_ms),
            };
            let Some(resp) = search_with_retry(backend.as_ref(), &query, pacer, opts).await else {
                batch.stats.backend_errors += 1;
                continue;
            };
            ledger.note_found(&task.query_id, resp.results.len());
            for hit in resp.results {
                if ledger.remaining(&task.query_id) == 0 {
                    break;
                }
                if !validate::is_worth_fetching(&hit.url) {
                    continue;
                }
                if !ledger.try_claim(&task.query_id, &hit.url) {
                    continue;
                }
                batch.candidates.push(Candidate {
                    url: hit.url,
                    title: hit.title,
                    source: SourceKind::Web,
                    pdf_url: None,
                    task: task.clone(),
                });
                dispatched += 1;
            }
        }

        if let Some(index) = papers {
            if ledger.remaining(&task.query_id) > 0 {
                match papers_with_retry(index, &task.query, opts).await {
                    Ok(found) => {
                        ledger.note_found(&task.query_id, found.len());
                        for paper in found {
                            if ledger.remaining(&task.query_id) == 0 {
                                break;
                            }
                            dispatched += admit_paper(paper, task, ledger, &mut batch);
                        }
                    }
                    Err(_) => batch.stats.backend_errors += 1,
                }
            }
        }

        if dispatched == 0 {
            batch.stats.zero_url_tasks.push(task.query_id.clone());
        }
    }
    batch
}

/// Open-access papers with a reachable PDF become candidates, keyed by
/// their landing URL with the PDF as the fetch target; both URLs count as
/// dispatched so neither is fetched twice. Closed papers are counted and
/// dropped. Returns how many candidates were admitted (0 or 1).
fn admit_paper(paper: Paper, task: &Task, ledger: &RunLedger, batch: &mut CandidateBatch) -> usize {
    let Paper { title, url, is_open_access, pdf_url, .. } = paper;
    let Some(pdf_url) = pdf_url.filter(|_| is_open_access) else {
        batch.stats.papers_skipped_closed_access += 1;
        return 0;
    };
    let url = url.unwrap_or_else(|| pdf_url.clone());
    if !ledger.try_claim(&task.query_id, &url) {
        return 0;
    }
    ledger.mark_seen(&pdf_url);
    batch.candidates.push(Candidate {
        url,
        title: Some(title),
        source: SourceKind::Academic,
        pdf_url: Some(pdf_url),
        task: task.clone(),
    });
    1
}

async fn search_with_retry(
    backend: &dyn SearchBackend,
    query: &SearchQuery,
    pacer: &Pacer,
    opts: &AggregateOptions,
) -> Option<SearchResponse> {
    for attempt in 0..=opts.retries {
        if attempt > 0 {
            let delay = opts.backoff_ms.saturating_mul(1u64 << (attempt - 1).min(16));
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        pacer.wait().await;
        if let Ok(resp) = backend.search(query).await {
            return Some(resp);
        }
    }
    None
}

async fn papers_with_retry(
    index: &PaperIndex,
    query: &str,
    opts: &AggregateOptions,
) -> Result<Vec<Paper>> {
    let mut last = Err(Error::Search("no attempt made".to_string()));
    for attempt in 0..=opts.retries {
        if attempt > 0 {
            let delay = opts.backoff_ms.saturating_mul(1u64 << (attempt - 1).min(16));
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        last = index.search(query, opts.papers_per_task, opts.search_timeout_ms).await;
        if last.is_ok() {
            return last;
        }
    }
    last
}

/// Knobs for the fetch/extract phase.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Concurrent fetches; clamped to 4..=16 at use.
    pub workers: usize,
    pub page_timeout_ms: u64,
    pub pdf_timeout_ms: u64,
    pub max_page_bytes: u64,
    pub max_pdf_bytes: u64,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            workers: 8,
            page_timeout_ms: 15_000,
            pdf_timeout_ms: 30_000,
            max_page_bytes: 4_000_000,
            max_pdf_bytes: 25_000_000,
        }
    }
}

/// Fetch and extract every candidate through a bounded worker pool. One
/// `ExtractionRecord` comes back per candidate whatever happens to it,
/// sorted by `(query_id, url)` so downstream stages see a stable order
/// regardless of completion order.
pub async fn fetch_and_extract(
    candidates: Vec<Candidate>,
    fetcher: &dyn PageFetcher,
    pool: &FetchPool,
    chain: &ExtractChain,
    render: Option<&RenderSession>,
    opts: &FetchOptions,
) -> Vec<ExtractionRecord> {
    let workers = opts.workers.clamp(4, 16);
    let mut records: Vec<ExtractionRecord> = stream::iter(
        candidates
            .into_iter()
            .map(|c| process_candidate(c, fetcher, pool, chain, render, opts)),
    )
    .buffer_unordered(workers)
    .collect()
    .await;
    records.sort_by(|a, b| {
        a.task
            .query_id
            .cmp(&b.task.query_id)
            .then_with(|| a.url.cmp(&b.url))
    });
    records
}

async fn process_candidate(
    candidate: Candidate,
    fetcher: &dyn PageFetcher,
    pool: &FetchPool,
    chain: &ExtractChain,
    render: Option<&RenderSession>,
    opts: &FetchOptions,
) -> ExtractionRecord {
    // Academic candidates are fetched at their PDF location but recorded
    // under the landing URL, which is what a reference list should cite.
    let fetch_url = candidate.pdf_url.as_deref().unwrap_or(&candidate.url).to_string();
    let (timeout_ms, max_bytes) = match candidate.source {
        SourceKind::Web => (opts.page_timeout_ms, opts.max_page_bytes),
        SourceKind::Academic => (opts.pdf_timeout_ms, opts.max_pdf_bytes),
    };
    let request = PageRequest {
        url: fetch_url.clone(),
        timeout_ms: Some(timeout_ms),
        max_bytes: Some(max_bytes),
    };

    let page = match pool.run(fetcher, &request, candidate.source).await {
        FetchOutcome::Page(page) => page,
        FetchOutcome::Failed { status, reason } => {
            return ExtractionRecord {
                url: candidate.url,
                final_url: fetch_url,
                title: candidate.title,
                text: None,
                method: None,
                status,
                failure_reason: Some(reason),
                task: candidate.task,
            };
        }
    };

    let raw = RawPage {
        bytes: &page.bytes,
        content_type: page.content_type.as_deref(),
        url: &page.final_url,
    };
    let mut extraction = chain.extract(&raw);

    // Static extraction came up dry: push web pages through the browser
    // once and re-run the chain on the rendered DOM.
    if extraction.text.is_none() && candidate.source == SourceKind::Web {
        if let Some(session) = render {
            if let Ok(rendered) = session.render(&page.final_url, timeout_ms).await {
                let raw = RawPage {
                    bytes: rendered.html.as_bytes(),
                    content_type: Some("text/html"),
                    url: &rendered.final_url,
                };
                let second = chain.extract(&raw);
                if second.text.is_some() {
                    extraction = Extraction {
                        text: second.text,
                        method: second.method.map(|m| format!("{m}-rendered")),
                        title: second.title.or(extraction.title),
                    };
                }
            }
        }
    }

    let title = extraction.title.or(candidate.title);
    match extraction.text {
        Some(text) => ExtractionRecord {
            url: candidate.url,
            final_url: page.final_url,
            title,
            text: Some(text),
            method: extraction.method,
            status: DocStatus::Success,
            failure_reason: None,
            task: candidate.task,
        },
        None => ExtractionRecord {
            url: candidate.url,
            final_url: page.final_url,
            title,
            text: None,
            method: None,
            status: DocStatus::ExtractionFailed,
            failure_reason: Some("no extraction strategy produced enough text".to_string()),
            task: candidate.task,
        },
    }
}

/// Per-task acquisition accounting for the run summary.
#[derive(Debug, Clone, Serialize)]
pub struct TaskCounts {
    pub query_id: String,
    pub query: String,
    pub found: usize,
    pub yielded: usize,
    pub target: usize,
}

/// The run's health, as data. Serialized alongside the report so a caller
/// can see how much of the text stands on retrieved sources.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub tasks: Vec<TaskCounts>,
    pub zero_url_tasks: Vec<String>,
    pub below_target_tasks: usize,
    pub met_target_tasks: usize,
    /// Extraction outcome labels (`success`, `http_error_404`, ...) to counts.
    pub status_counts: BTreeMap<String, usize>,
    pub papers_skipped_closed_access: usize,
    pub backend_errors: usize,
    pub documents_indexed: usize,
    pub chunks_indexed: usize,
    pub embedding_errors: usize,
    pub vector_store_errors: usize,
    pub generation_failures: usize,
}

/// Fold ledger state, batch stats and extraction outcomes into a summary.
/// Indexing and generation counters are filled in by the pipeline once
/// those phases have run.
pub fn summarize_run(
    ledger: &RunLedger,
    tasks: &[Task],
    records: &[ExtractionRecord],
    stats: &BatchStats,
) -> RunSummary {
    let progress = ledger.progress();
    let mut out = RunSummary {
        zero_url_tasks: stats.zero_url_tasks.clone(),
        papers_skipped_closed_access: stats.papers_skipped_closed_access,
        backend_errors: stats.backend_errors,
        ..RunSummary::default()
    };
    for task in tasks {
        let p = progress.get(&task.query_id).copied().unwrap_or_default();
        if p.target > 0 && p.yielded >= p.target {
            out.met_target_tasks += 1;
        } else {
            out.below_target_tasks += 1;
        }
        out.tasks.push(TaskCounts {
            query_id: task.query_id.clone(),
            query: task.query.clone(),
            found: p.found,
            yielded: p.yielded,
            target: p.target,
        });
    }
    for record in records {
        *out.status_counts.entry(record.status.label()).or_insert(0) += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;
    use proptest::prelude::*;
    use ragpipe_local::fetch::{FetchPolicy, HttpFetcher};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn task(query_id: &str, query: &str) -> Task {
        Task {
            query: query.to_string(),
            plan_item_id: "plan_1".to_string(),
            plan_item: "Body".to_string(),
            query_id: query_id.to_string(),
        }
    }

    #[test]
    fn claims_are_refused_for_duplicates_and_met_targets() {
        let ledger = RunLedger::new();
        ledger.register_task("q_1_0", 2);
        assert!(ledger.try_claim("q_1_0", "https://a.example/1"));
        assert!(!ledger.try_claim("q_1_0", "https://a.example/1"), "duplicate url");
        assert!(ledger.try_claim("q_1_0", "https://a.example/2"));
        assert!(!ledger.try_claim("q_1_0", "https://a.example/3"), "target met");
        assert_eq!(ledger.remaining("q_1_0"), 0);
    }

    #[test]
    fn claims_for_unknown_tasks_are_refused() {
        let ledger = RunLedger::new();
        assert!(!ledger.try_claim("q_9_9", "https://a.example/1"));
    }

    #[test]
    fn marked_urls_cannot_be_claimed_later() {
        let ledger = RunLedger::new();
        ledger.register_task("q_1_0", 3);
        ledger.mark_seen("https://a.example/paper.pdf");
        assert!(!ledger.try_claim("q_1_0", "https://a.example/paper.pdf"));
        assert_eq!(ledger.remaining("q_1_0"), 3, "refused claims cost no quota");
    }

    proptest! {
        #[test]
        fn ledger_never_over_dispatches(
            ops in proptest::collection::vec((0usize..3, 0usize..6), 0..60)
        ) {
            let ledger = RunLedger::new();
            for t in 0..3 {
                ledger.register_task(&format!("q_{t}"), 2);
            }
            let mut dispatched: Vec<String> = Vec::new();
            for (t, u) in ops {
                let url = format!("https://example.com/{u}");
                if ledger.try_claim(&format!("q_{t}"), &url) {
                    dispatched.push(url);
                }
            }
            let unique: BTreeSet<&String> = dispatched.iter().collect();
            prop_assert_eq!(unique.len(), dispatched.len(), "a url was dispatched twice");
            for (query_id, p) in ledger.progress() {
                prop_assert!(p.yielded <= p.target, "{} over target", query_id);
            }
        }
    }

    struct StubSearch {
        hits: Vec<String>,
        calls: AtomicUsize,
        fail_first: usize,
    }

    impl StubSearch {
        fn ok(hits: &[&str]) -> Self {
            Self {
                hits: hits.iter().map(|s| s.to_string()).collect(),
                calls: AtomicUsize::new(0),
                fail_first: 0,
            }
        }
    }

    #[async_trait::async_trait]
    impl SearchBackend for StubSearch {
        fn name(&self) -> &'static str {
            "stub"
        }

        async fn search(&self, _query: &SearchQuery) -> Result<SearchResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(Error::Search("stub outage".to_string()));
            }
            Ok(SearchResponse {
                results: self
                    .hits
                    .iter()
                    .map(|u| ragpipe_core::SearchHit {
                        url: u.clone(),
                        title: Some("Stub result".to_string()),
                        snippet: None,
                    })
                    .collect(),
                provider: "stub".to_string(),
                timings_ms: BTreeMap::new(),
            })
        }
    }

    fn quick_opts() -> AggregateOptions {
        AggregateOptions {
            per_task_target: 3,
            web_pace_ms: 1,
            backoff_ms: 1,
            ..AggregateOptions::default()
        }
    }

    #[tokio::test]
    async fn quota_caps_candidates_per_task() {
        let urls: Vec<String> = (0..10).map(|i| format!("https://site{i}.example/a")).collect();
        let refs: Vec<&str> = urls.iter().map(String::as_str).collect();
        let backend: Arc<dyn SearchBackend> = Arc::new(StubSearch::ok(&refs));
        let ledger = RunLedger::new();
        let tasks = vec![task("q_1_0", "bees")];

        let batch = gather_candidates(&[backend], None, &tasks, &ledger, &quick_opts()).await;

        assert_eq!(batch.candidates.len(), 3);
        let p = ledger.progress();
        assert_eq!(p["q_1_0"].yielded, 3);
        assert_eq!(p["q_1_0"].found, 10);
        assert!(batch.stats.zero_url_tasks.is_empty());
    }

    #[tokio::test]
    async fn unfetchable_urls_never_become_candidates() {
        let backend: Arc<dyn SearchBackend> = Arc::new(StubSearch::ok(&[
            "not a url",
            "https://en.wikipedia.org/wiki/Bee",
            "https://site.example/good",
        ]));
        let ledger = RunLedger::new();
        let tasks = vec![task("q_1_0", "bees")];

        let batch = gather_candidates(&[backend], None, &tasks, &ledger, &quick_opts()).await;

        assert_eq!(batch.candidates.len(), 1);
        assert_eq!(batch.candidates[0].url, "https://site.example/good");
    }

    #[tokio::test]
    async fn urls_are_dispatched_once_across_tasks() {
        let backend: Arc<dyn SearchBackend> =
            Arc::new(StubSearch::ok(&["https://site.example/shared"]));
        let ledger = RunLedger::new();
        let tasks = vec![task("q_1_0", "bees"), task("q_2_0", "wasps")];

        let batch = gather_candidates(&[backend], None, &tasks, &ledger, &quick_opts()).await;

        assert_eq!(batch.candidates.len(), 1);
        assert_eq!(batch.candidates[0].task.query_id, "q_1_0");
        assert_eq!(batch.stats.zero_url_tasks, vec!["q_2_0".to_string()]);
    }

    #[tokio::test]
    async fn backend_errors_are_retried_then_counted() {
        let flaky = StubSearch {
            hits: vec!["https://site.example/a".to_string()],
            calls: AtomicUsize::new(0),
            fail_first: 1,
        };
        let backend: Arc<dyn SearchBackend> = Arc::new(flaky);
        let ledger = RunLedger::new();
        let tasks = vec![task("q_1_0", "bees")];

        let batch = gather_candidates(&[backend], None, &tasks, &ledger, &quick_opts()).await;

        assert_eq!(batch.candidates.len(), 1, "retry should have recovered");
        assert_eq!(batch.stats.backend_errors, 0);
    }

    #[tokio::test]
    async fn exhausted_retries_count_one_backend_error() {
        let dead = StubSearch {
            hits: vec![],
            calls: AtomicUsize::new(0),
            fail_first: usize::MAX,
        };
        let backend: Arc<dyn SearchBackend> = Arc::new(dead);
        let ledger = RunLedger::new();
        let tasks = vec![task("q_1_0", "bees")];
        let opts = AggregateOptions { retries: 1, ..quick_opts() };

        let batch = gather_candidates(&[backend], None, &tasks, &ledger, &opts).await;

        assert!(batch.candidates.is_empty());
        assert_eq!(batch.stats.backend_errors, 1);
        assert_eq!(batch.stats.zero_url_tasks, vec!["q_1_0".to_string()]);
    }

    #[tokio::test]
    async fn open_access_papers_become_academic_candidates() {
        let body = serde_json::json!({
            "data": [
                {
                    "title": "Open paper",
                    "url": "https://journal.example/p1",
                    "isOpenAccess": true,
                    "openAccessPdf": { "url": "https://journal.example/p1.pdf" }
                },
                {
                    "title": "Closed paper",
                    "url": "https://journal.example/p2",
                    "isOpenAccess": false
                },
                {
                    "title": "Flagged open, no pdf",
                    "url": "https://journal.example/p3",
                    "isOpenAccess": true
                }
            ]
        });
        let app = Router::new().route(
            "/graph/v1/paper/search",
            get(move || {
                let body = body.clone();
                async move { axum::Json(body) }
            }),
        );
        let addr = serve(app).await;
        let client = ragpipe_local::default_http_client().unwrap();
        let index = PaperIndex::new(
            client,
            format!("http://{addr}/graph/v1/paper/search"),
            None,
            Duration::from_millis(1),
        );
        let ledger = RunLedger::new();
        let tasks = vec![task("q_1_0", "bees")];

        let batch = gather_candidates(&[], Some(&index), &tasks, &ledger, &quick_opts()).await;

        assert_eq!(batch.candidates.len(), 1);
        let c = &batch.candidates[0];
        assert_eq!(c.source, SourceKind::Academic);
        assert_eq!(c.url, "https://journal.example/p1");
        assert_eq!(c.pdf_url.as_deref(), Some("https://journal.example/p1.pdf"));
        assert_eq!(batch.stats.papers_skipped_closed_access, 2);
        // The pdf location is reserved too, so no later task re-fetches it.
        assert!(!ledger.try_claim("q_1_0", "https://journal.example/p1.pdf"));
    }

    async fn serve(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn candidate(url: &str, query_id: &str) -> Candidate {
        Candidate {
            url: url.to_string(),
            title: None,
            source: SourceKind::Web,
            pdf_url: None,
            task: task(query_id, "bees"),
        }
    }

    #[tokio::test]
    async fn every_candidate_gets_a_classified_record() {
        let article = "Honeybees forage across several kilometers and their colonies respond \
                       to the seasonal availability of nectar and pollen in measurable ways. "
            .repeat(3);
        let page = format!(
            "<html><head><title>Forage</title></head><body><article><p>{article}</p></article></body></html>"
        );
        let app = Router::new()
            .route(
                "/good",
                get(move || {
                    let page = page.clone();
                    async move { axum::response::Html(page) }
                }),
            )
            .route(
                "/missing",
                get(|| async { (axum::http::StatusCode::NOT_FOUND, "gone") }),
            );
        let addr = serve(app).await;

        let fetcher = HttpFetcher::new().unwrap();
        let pool = FetchPool::new(FetchPolicy { retries: 0, backoff_ms: 1, per_host_limit: 2 });
        let chain = ExtractChain::default();
        let candidates = vec![
            candidate(&format!("http://{addr}/good"), "q_1_0"),
            candidate(&format!("http://{addr}/missing"), "q_1_1"),
        ];

        let records = fetch_and_extract(
            candidates,
            &fetcher,
            &pool,
            &chain,
            None,
            &FetchOptions::default(),
        )
        .await;

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].task.query_id, "q_1_0", "sorted by query id");
        assert!(records[0].status.is_success());
        assert_eq!(records[0].title.as_deref(), Some("Forage"));
        assert!(records[0].method.is_some());
        assert_eq!(records[1].status, DocStatus::HttpError { code: 404 });
        assert!(records[1].text.is_none());
        assert!(records[1].failure_reason.is_some());
    }

    #[tokio::test]
    async fn summary_counts_targets_and_statuses() {
        let ledger = RunLedger::new();
        ledger.register_task("q_1_0", 2);
        ledger.register_task("q_2_0", 2);
        ledger.note_found("q_1_0", 5);
        assert!(ledger.try_claim("q_1_0", "https://a.example/1"));
        assert!(ledger.try_claim("q_1_0", "https://a.example/2"));

        let tasks = vec![task("q_1_0", "bees"), task("q_2_0", "wasps")];
        let records = vec![ExtractionRecord {
            url: "https://a.example/1".to_string(),
            final_url: "https://a.example/1".to_string(),
            title: None,
            text: Some("text".to_string()),
            method: Some("article_scorer".to_string()),
            status: DocStatus::Success,
            failure_reason: None,
            task: tasks[0].clone(),
        }];
        let stats = BatchStats {
            zero_url_tasks: vec!["q_2_0".to_string()],
            papers_skipped_closed_access: 1,
            backend_errors: 0,
        };

        let summary = summarize_run(&ledger, &tasks, &records, &stats);

        assert_eq!(summary.met_target_tasks, 1);
        assert_eq!(summary.below_target_tasks, 1);
        assert_eq!(summary.tasks[0].found, 5);
        assert_eq!(summary.tasks[0].yielded, 2);
        assert_eq!(summary.status_counts["success"], 1);
        assert_eq!(summary.papers_skipped_closed_access, 1);
        assert_eq!(summary.zero_url_tasks, vec!["q_2_0".to_string()]);
    }
}

//! Chunking and embedding of successful extractions into the vector store.
//!
//! Chunk ids derive from the document URL hash plus the chunk index, so
//! indexing the same page again lands on the same ids instead of piling
//! up duplicates. A URL only counts as indexed once at least one of its
//! chunks made it into the store; a document whose every chunk failed can
//! be retried by a later batch.

use ragpipe_core::{ChunkMetadata, Embedder, ExtractionRecord, VectorStore};
use ragpipe_local::textnorm;
use std::collections::BTreeSet;

/// Window size for chunking, in chars.
pub const CHUNK_CHARS: usize = 10_000;
/// Overlap between consecutive windows, in chars.
pub const CHUNK_OVERLAP: usize = 1_500;
/// Documents shorter than this carry too little substance to index.
pub const MIN_INDEX_CHARS: usize = 150;
const PREVIEW_CHARS: usize = 120;

/// Split text into overlapping char windows, boundary-safe for multibyte
/// input. The final window may be shorter; empty input yields no chunks.
/// Overlap is capped at half the window so the loop always advances.
pub fn chunk_text(text: &str, chunk_chars: usize, overlap: usize) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() || chunk_chars == 0 {
        return Vec::new();
    }
    let overlap = overlap.min(chunk_chars / 2);
    let step = chunk_chars.saturating_sub(overlap).max(1);
    let bounds: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    let total = bounds.len();

    let mut out = Vec::new();
    let mut start = 0usize;
    while start < total {
        let end = (start + chunk_chars).min(total);
        let from = bounds[start];
        let to = if end == total { text.len() } else { bounds[end] };
        let piece = text[from..to].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        if end == total {
            break;
        }
        start += step;
    }
    out
}

fn preview_of(chunk: &str) -> String {
    let (preview, _, _) = textnorm::truncate_chars(chunk, PREVIEW_CHARS);
    preview.replace('\n', " ")
}

/// Accumulated outcome of an indexing batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexOutcome {
    /// Documents that contributed at least one chunk.
    pub documents: usize,
    pub chunks: usize,
    pub embedding_errors: usize,
    pub store_errors: usize,
}

/// Feeds successful extractions into the store, one embed plus insert per
/// chunk. Failures skip the chunk and are counted, never propagated.
pub struct Indexer<'a> {
    embedder: &'a dyn Embedder,
    store: &'a dyn VectorStore,
    collection: String,
    chunk_chars: usize,
    chunk_overlap: usize,
    embed_timeout_ms: u64,
    indexed_urls: BTreeSet<String>,
    outcome: IndexOutcome,
}

impl<'a> Indexer<'a> {
    pub fn new(embedder: &'a dyn Embedder, store: &'a dyn VectorStore, collection: &str) -> Self {
        Self {
            embedder,
            store,
            collection: collection.to_string(),
            chunk_chars: CHUNK_CHARS,
            chunk_overlap: CHUNK_OVERLAP,
            embed_timeout_ms: 60_000,
            indexed_urls: BTreeSet::new(),
            outcome: IndexOutcome::default(),
        }
    }

    pub fn with_chunking(mut self, chunk_chars: usize, chunk_overlap: usize) -> Self {
        self.chunk_chars = chunk_chars.max(1);
        self.chunk_overlap = chunk_overlap;
        self
    }

    pub fn with_embed_timeout(mut self, timeout_ms: u64) -> Self {
        self.embed_timeout_ms = timeout_ms;
        self
    }

    pub fn outcome(&self) -> IndexOutcome {
        self.outcome
    }

    /// Index one record. Returns the number of chunks added: 0 for failed
    /// extractions, text under [`MIN_INDEX_CHARS`], or a URL this indexer
    /// already got chunks from.
    pub async fn index_record(&mut self, record: &ExtractionRecord) -> usize {
        if !record.status.is_success() {
            return 0;
        }
        let Some(text) = record.text.as_deref() else {
            return 0;
        };
        if text.chars().count() < MIN_INDEX_CHARS {
            return 0;
        }
        if self.indexed_urls.contains(&record.url) {
            return 0;
        }

        let doc_hash = textnorm::stable_hash64(&record.url);
        let chunks = chunk_text(text, self.chunk_chars, self.chunk_overlap);
        let mut added = 0usize;
        for (i, chunk) in chunks.iter().enumerate() {
            let vector = match self.embedder.embed(chunk, self.embed_timeout_ms).await {
                Ok(v) => v,
                Err(_) => {
                    self.outcome.embedding_errors += 1;
                    continue;
                }
            };
            let id = format!("chunk_{doc_hash}_{i}");
            let metadata = ChunkMetadata {
                url: record.url.clone(),
                title: record.title.clone().unwrap_or_default(),
                plan_item: record.task.plan_item.clone(),
                plan_item_id: record.task.plan_item_id.clone(),
                source_query: record.task.query.clone(),
                chunk_index: i,
                preview: preview_of(chunk),
            };
            if self
                .store
                .insert(&self.collection, &id, &vector, chunk, &metadata)
                .await
                .is_err()
            {
                self.outcome.store_errors += 1;
                continue;
            }
            added += 1;
        }

        if added > 0 {
            self.indexed_urls.insert(record.url.clone());
            self.outcome.documents += 1;
            self.outcome.chunks += added;
        }
        added
    }

    /// Index a whole acquisition batch in order.
    pub async fn index_batch(&mut self, records: &[ExtractionRecord]) -> IndexOutcome {
        for record in records {
            self.index_record(record).await;
        }
        self.outcome
    }
}

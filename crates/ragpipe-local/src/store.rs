//! In-memory `VectorStore`. Holds one run's working set; collections are
//! created on first insert and dropped whole in teardown. Distances are
//! cosine, reported as `1 - similarity` so lower is closer.

use ragpipe_core::{ChunkMetadata, Error, QueryMatch, Result, VectorStore};
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug, Clone)]
struct StoredDoc {
    id: String,
    vector: Vec<f32>,
    document: String,
    metadata: ChunkMetadata,
}

#[derive(Default)]
pub struct MemoryVectorStore {
    collections: Mutex<BTreeMap<String, Vec<StoredDoc>>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, collection: &str) -> usize {
        let map = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        map.get(collection).map(|v| v.len()).unwrap_or(0)
    }
}

/// `None` when the vectors are incomparable (dimension mismatch or zero
/// norm); callers rank those after every real distance.
fn cosine_distance(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }
    let mut dot = 0f32;
    let mut na = 0f32;
    let mut nb = 0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    let (na, nb) = (na.sqrt(), nb.sqrt());
    if na == 0.0 || nb == 0.0 {
        return None;
    }
    Some(1.0 - dot / (na * nb))
}

#[async_trait::async_trait]
impl VectorStore for MemoryVectorStore {
    async fn insert(
        &self,
        collection: &str,
        id: &str,
        vector: &[f32],
        document: &str,
        metadata: &ChunkMetadata,
    ) -> Result<()> {
        if vector.is_empty() {
            return Err(Error::Store("refusing to insert an empty vector".to_string()));
        }
        let mut map = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        let docs = map.entry(collection.to_string()).or_default();
        let doc = StoredDoc {
            id: id.to_string(),
            vector: vector.to_vec(),
            document: document.to_string(),
            metadata: metadata.clone(),
        };
        // Same id overwrites, so re-runs of the same insert are idempotent.
        if let Some(existing) = docs.iter_mut().find(|d| d.id == id) {
            *existing = doc;
        } else {
            docs.push(doc);
        }
        Ok(())
    }

    async fn query(&self, collection: &str, vector: &[f32], k: usize) -> Result<Vec<QueryMatch>> {
        let map = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        let Some(docs) = map.get(collection) else {
            return Ok(Vec::new());
        };
        let mut scored: Vec<QueryMatch> = docs
            .iter()
            .map(|d| QueryMatch {
                id: d.id.clone(),
                document: d.document.clone(),
                metadata: d.metadata.clone(),
                distance: cosine_distance(vector, &d.vector),
            })
            .collect();
        scored.sort_by(|a, b| match (a.distance, b.distance) {
            (Some(x), Some(y)) => x.total_cmp(&y).then_with(|| a.id.cmp(&b.id)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.id.cmp(&b.id),
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn delete_collection(&self, collection: &str) -> Result<()> {
        let mut map = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(collection);
        Ok(())
    }
}

//! Best-chunk retrieval for section grounding.

use ragpipe_core::{ChunkMetadata, Embedder, QueryMatch, VectorStore};

/// Chunks requested from the store per retrieval query.
pub const TOP_K: usize = 10;

/// Embed the query and return the best-matching chunk's text and
/// metadata. Every failure mode (embed error, store error, empty
/// collection) collapses to `None`, and the caller degrades to
/// ungrounded generation.
pub async fn retrieve(
    embedder: &dyn Embedder,
    store: &dyn VectorStore,
    collection: &str,
    query_text: &str,
    k: usize,
    timeout_ms: u64,
) -> Option<(String, ChunkMetadata)> {
    let vector = embedder.embed(query_text, timeout_ms).await.ok()?;
    let matches = store.query(collection, &vector, k.max(1)).await.ok()?;
    let best = best_match(&matches)?;
    Some((best.document.clone(), best.metadata.clone()))
}

/// Lowest scored distance wins, first match breaking ties. Matches without
/// a distance only win when nothing carries one; then input order decides.
fn best_match(matches: &[QueryMatch]) -> Option<&QueryMatch> {
    let mut best: Option<(&QueryMatch, f32)> = None;
    for m in matches {
        if let Some(d) = m.distance {
            let better = match best {
                Some((_, current)) => d < current,
                None => true,
            };
            if better {
                best = Some((m, d));
            }
        }
    }
    best.map(|(m, _)| m).or_else(|| matches.first())
}

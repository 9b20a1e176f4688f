//! Concrete, local implementations of the `ragpipe` service traits:
//! reqwest-backed fetching with per-host limits, web and academic search
//! providers, the HTML/PDF extraction chain, a persistent headless-browser
//! render session, an Ollama client for generation and embeddings, and an
//! in-memory vector store.
//!
//! This is intentionally:
//! - **Env-configured**: every provider has a `from_env` constructor that
//!   fails with `NotConfigured` naming the missing variable.
//! - **Bounded**: every network call carries a timeout; bodies and result
//!   counts are capped.
//! - **Deterministic where it can be**: stable hashing, ordered maps, and
//!   stable sorts, so identical inputs produce identical outputs.

pub mod extract;
pub mod fetch;
pub mod ollama;
pub mod papers;
pub mod render;
pub mod search;
pub mod store;
pub mod textnorm;
pub mod validate;

use ragpipe_core::{Error, Result};
use std::time::Duration;

/// Shared client for the API providers (search, papers, Ollama). Page
/// fetching uses its own client with redirect and streaming policy, see
/// [`fetch::HttpFetcher`].
pub fn default_http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent("ragpipe/0.1")
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| Error::Fetch(e.to_string()))
}

//! Topic-to-report research pipeline.
//!
//! Composes the `ragpipe-local` backends into the full loop: outline the
//! topic, derive search queries per body section, gather and extract
//! candidate documents from the web and the academic index, chunk and
//! embed them into a per-topic vector collection, then write each section
//! grounded in its best-matching chunk.
//!
//! The composition is intentionally:
//! - **Bounded**: every external call carries a timeout, fetches run
//!   through a capped worker pool with per-host ceilings, and backends
//!   are paced between calls.
//! - **Degradable**: only outline generation can fail a run. Everything
//!   downstream turns into classified records, counts and warnings on
//!   the result instead of errors.
//! - **Deterministic where it can be**: stable task ids and chunk ids,
//!   ordered collections, one vector collection per topic.

pub mod index;
pub mod orchestrate;
pub mod pipeline;
pub mod plan;
pub mod retrieve;
pub mod section;

pub use orchestrate::{RunLedger, RunSummary};
pub use pipeline::{PipelineConfig, PipelineParts, ResearchPipeline, ResearchReport};

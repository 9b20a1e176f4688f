//! Section text generation over the retrieval layer, plus reference
//! rendering.
//!
//! Sections are written strictly in plan order, which is what lets the
//! references section simply render whatever the body sections recorded:
//! by plan shape it is always last. A body section records its source the
//! moment retrieval hands one over, before generation runs, so a section
//! whose text later fails still shows where its material came from.

use crate::retrieve;
use ragpipe_core::{
    Embedder, PlanItem, Section, SectionRole, TextGenerator, UsedSource, VectorStore,
};
use ragpipe_local::textnorm;
use std::collections::BTreeSet;

const NO_SOURCES_TEXT: &str = "No external sources were consulted for this report.";

/// Everything section generation needs, borrowed for one run.
pub struct SectionWriter<'a> {
    pub generator: &'a dyn TextGenerator,
    pub embedder: &'a dyn Embedder,
    pub store: &'a dyn VectorStore,
    pub collection: &'a str,
    pub topic: &'a str,
    pub plan: &'a [PlanItem],
    pub retrieve_k: usize,
    pub llm_timeout_ms: u64,
    pub embed_timeout_ms: u64,
}

/// Sections plus the provenance gathered while writing them.
#[derive(Debug)]
pub struct SectionOutput {
    pub sections: Vec<Section>,
    pub used_sources: Vec<UsedSource>,
    /// Sections that ended as bracketed placeholders.
    pub generation_failures: usize,
}

impl SectionWriter<'_> {
    /// Write every section in plan order. A section whose every generation
    /// attempt failed becomes a bracketed placeholder so the report keeps
    /// its shape.
    pub async fn write_all(&self) -> SectionOutput {
        let mut used_sources: Vec<UsedSource> = Vec::new();
        let mut sections = Vec::new();
        let mut generation_failures = 0usize;
        for (index, item) in self.plan.iter().enumerate() {
            let text = match item.role {
                SectionRole::Introduction => self.introduction().await,
                SectionRole::Conclusion => self.conclusion().await,
                SectionRole::References => Some(render_references(&used_sources)),
                SectionRole::Body => self.body(&item.title, &mut used_sources).await,
            };
            let text = match text {
                Some(t) => t,
                None => {
                    generation_failures += 1;
                    placeholder(&item.title)
                }
            };
            sections.push(Section { index, title: item.title.clone(), role: item.role, text });
        }
        SectionOutput { sections, used_sources, generation_failures }
    }

    fn outline_numbered(&self) -> String {
        self.plan
            .iter()
            .enumerate()
            .map(|(i, p)| format!("{}. {}", i + 1, p.title))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn base_system(&self) -> String {
        format!(
            "You are helping write a structured research report.\nTopic: '{}'.\nFull outline:\n{}\n",
            self.topic,
            self.outline_numbered()
        )
    }

    async fn introduction(&self) -> Option<String> {
        let system = format!(
            "{}\nWrite the INTRODUCTION for this report. Explain why the topic matters, state \
             what the report sets out to establish, and preview the structure the outline lays \
             out.",
            self.base_system()
        );
        let prompt = format!(
            "Write the introduction for a research report on '{}', following the outline.",
            self.topic
        );
        self.generator.generate(&system, &prompt, self.llm_timeout_ms).await.ok()
    }

    async fn conclusion(&self) -> Option<String> {
        let system = format!(
            "{}\nWrite the CONCLUSION for this report. Sum up the main findings of each body \
             section, draw the overall conclusions, and note what further work the topic \
             invites.",
            self.base_system()
        );
        let prompt = format!(
            "Write the conclusion for a research report on '{}', summing up its sections.",
            self.topic
        );
        self.generator.generate(&system, &prompt, self.llm_timeout_ms).await.ok()
    }

    async fn body(&self, title: &str, used_sources: &mut Vec<UsedSource>) -> Option<String> {
        let hit = retrieve::retrieve(
            self.embedder,
            self.store,
            self.collection,
            title,
            self.retrieve_k,
            self.embed_timeout_ms,
        )
        .await;

        let Some((context, meta)) = hit else {
            return self.ungrounded_body(title).await;
        };

        if !meta.url.is_empty() && !used_sources.iter().any(|s| s.url == meta.url) {
            used_sources.push(UsedSource {
                url: meta.url.clone(),
                title: meta.title.clone(),
                plan_item: meta.plan_item.clone(),
                plan_item_id: meta.plan_item_id.clone(),
                source_query: meta.source_query.clone(),
            });
        }

        let system = format!(
            "{base}\nWrite the text for the section '{title}'. Build it on the material below, \
             gathered from {url}. Weigh the material critically and synthesize it; do not copy \
             it verbatim, and never mention the material or where it came from.\n\n\
             MATERIAL:\n---\n{context}\n---",
            base = self.base_system(),
            url = meta.url,
        );
        let prompt =
            format!("Write the section '{title}' of the report, drawing on the supplied material.");
        match self.generator.generate(&system, &prompt, self.llm_timeout_ms).await {
            Ok(text) => Some(text),
            // The grounded call failed even though material exists; one
            // ungrounded try before the section is given up.
            Err(_) => self.ungrounded_body(title).await,
        }
    }

    async fn ungrounded_body(&self, title: &str) -> Option<String> {
        let system = format!(
            "{base}\nWrite the text for the section '{title}'. No source material was retrieved \
             for it, so rely on general knowledge of '{topic}'. Keep to what the section title \
             names and mind its place in the outline. Never say that sources or context are \
             missing.",
            base = self.base_system(),
            topic = self.topic,
        );
        let prompt = format!("Write the section '{title}' of the report.");
        self.generator.generate(&system, &prompt, self.llm_timeout_ms).await.ok()
    }
}

fn placeholder(title: &str) -> String {
    format!("[text generation failed for section: {title}]")
}

/// Render the references section from the recorded sources: deduplicated
/// by URL, ordered by `(plan_item_id, url)`, one markdown list item per
/// source with the URL host standing in for a missing title.
pub fn render_references(used_sources: &[UsedSource]) -> String {
    let mut sorted: Vec<&UsedSource> = used_sources.iter().collect();
    sorted.sort_by(|a, b| a.plan_item_id.cmp(&b.plan_item_id).then_with(|| a.url.cmp(&b.url)));

    let mut seen = BTreeSet::new();
    let mut lines = Vec::new();
    for source in sorted {
        if source.url.is_empty() || !seen.insert(source.url.as_str()) {
            continue;
        }
        let title = textnorm::normalize_whitespace(&source.title);
        let title = if title.is_empty() {
            textnorm::host_of(&source.url).unwrap_or_else(|| source.url.clone())
        } else {
            title
        };
        lines.push(format!("- [{title}]({})", source.url));
    }
    if lines.is_empty() {
        return NO_SOURCES_TEXT.to_string();
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::repair_outline;
    use ragpipe_core::{ChunkMetadata, Error, Result};
    use ragpipe_local::store::MemoryVectorStore;
    use std::sync::Mutex;

    fn source(url: &str, title: &str, plan_item_id: &str) -> UsedSource {
        UsedSource {
            url: url.to_string(),
            title: title.to_string(),
            plan_item: "Habitat".to_string(),
            plan_item_id: plan_item_id.to_string(),
            source_query: "bees".to_string(),
        }
    }

    #[test]
    fn no_sources_renders_the_empty_message() {
        assert_eq!(render_references(&[]), NO_SOURCES_TEXT);
    }

    #[test]
    fn references_dedup_and_sort_by_section_then_url() {
        let sources = vec![
            source("https://b.example/2", "Second", "plan_3"),
            source("https://a.example/1", "First", "plan_1"),
            source("https://b.example/2", "Second again", "plan_4"),
        ];
        let text = render_references(&sources);
        assert_eq!(
            text,
            "- [First](https://a.example/1)\n- [Second](https://b.example/2)"
        );
    }

    #[test]
    fn missing_titles_fall_back_to_the_url_host() {
        let sources = vec![source("https://journal.example/x", "  ", "plan_1")];
        assert_eq!(render_references(&sources), "- [journal.example](https://journal.example/x)");
    }

    struct RecordingGen {
        calls: Mutex<Vec<(String, String)>>,
        reply: &'static str,
    }

    impl RecordingGen {
        fn new(reply: &'static str) -> Self {
            Self { calls: Mutex::new(Vec::new()), reply }
        }

        fn systems(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|(s, _)| s.clone()).collect()
        }
    }

    #[async_trait::async_trait]
    impl TextGenerator for RecordingGen {
        async fn generate(&self, system: &str, prompt: &str, _timeout_ms: u64) -> Result<String> {
            self.calls.lock().unwrap().push((system.to_string(), prompt.to_string()));
            Ok(self.reply.to_string())
        }
    }

    struct FailGen;

    #[async_trait::async_trait]
    impl TextGenerator for FailGen {
        async fn generate(&self, _system: &str, _prompt: &str, _timeout_ms: u64) -> Result<String> {
            Err(Error::Llm("model offline".to_string()))
        }
    }

    struct FixedEmbed;

    #[async_trait::async_trait]
    impl Embedder for FixedEmbed {
        async fn embed(&self, _text: &str, _timeout_ms: u64) -> Result<Vec<f32>> {
            Ok(vec![1.0, 0.0])
        }
    }

    fn meta(url: &str) -> ChunkMetadata {
        ChunkMetadata {
            url: url.to_string(),
            title: "Forage study".to_string(),
            plan_item: "Habitat".to_string(),
            plan_item_id: "plan_1".to_string(),
            source_query: "bees habitat".to_string(),
            chunk_index: 0,
            preview: String::new(),
        }
    }

    fn writer<'a>(
        generator: &'a dyn TextGenerator,
        store: &'a dyn VectorStore,
        plan: &'a [PlanItem],
    ) -> SectionWriter<'a> {
        SectionWriter {
            generator,
            embedder: &FixedEmbed,
            store,
            collection: "c",
            topic: "bees",
            plan,
            retrieve_k: 10,
            llm_timeout_ms: 1_000,
            embed_timeout_ms: 1_000,
        }
    }

    #[tokio::test]
    async fn empty_store_degrades_every_body_to_ungrounded() {
        let gen = RecordingGen::new("Prose.");
        let store = MemoryVectorStore::new();
        let plan = repair_outline(vec!["Habitat".into(), "Diet".into()]);
        let out = writer(&gen, &store, &plan).write_all().await;

        assert_eq!(out.sections.len(), 5);
        assert!(out.used_sources.is_empty());
        assert_eq!(out.generation_failures, 0);
        assert_eq!(out.sections[4].text, NO_SOURCES_TEXT);

        let systems = gen.systems();
        assert_eq!(systems.len(), 4, "references takes no generation call");
        assert!(systems[0].contains("INTRODUCTION"));
        assert!(systems[1].contains("No source material was retrieved"));
        assert!(systems[3].contains("CONCLUSION"));
        assert!(systems.iter().all(|s| s.contains("1. Introduction")));
    }

    #[tokio::test]
    async fn grounded_bodies_record_each_source_once() {
        let gen = RecordingGen::new("Grounded prose.");
        let store = MemoryVectorStore::new();
        store
            .insert("c", "chunk_0", &[1.0, 0.0], "colonies forage widely", &meta("https://a.example/1"))
            .await
            .unwrap();
        let plan = repair_outline(vec!["Habitat".into(), "Diet".into()]);
        let out = writer(&gen, &store, &plan).write_all().await;

        assert_eq!(out.used_sources.len(), 1, "same chunk grounds both bodies");
        assert_eq!(out.used_sources[0].url, "https://a.example/1");
        assert_eq!(out.sections[1].text, "Grounded prose.");

        let systems = gen.systems();
        let body_systems: Vec<&String> =
            systems.iter().filter(|s| s.contains("MATERIAL")).collect();
        assert_eq!(body_systems.len(), 2);
        assert!(body_systems[0].contains("colonies forage widely"));
        assert!(body_systems[0].contains("never mention the material"));
        assert!(out.sections[4].text.contains("https://a.example/1"));
    }

    #[tokio::test]
    async fn total_generation_failure_leaves_placeholders_and_counts() {
        let store = MemoryVectorStore::new();
        let plan = repair_outline(vec!["Habitat".into()]);
        let out = writer(&FailGen, &store, &plan).write_all().await;

        assert_eq!(out.sections.len(), 4);
        assert_eq!(out.generation_failures, 3, "intro, one body, conclusion");
        for section in &out.sections[..3] {
            assert!(
                section.text.starts_with("[text generation failed for section:"),
                "unexpected text: {}",
                section.text
            );
        }
        assert_eq!(out.sections[3].text, NO_SOURCES_TEXT);
    }

    #[tokio::test]
    async fn sections_keep_plan_order_and_indices() {
        let gen = RecordingGen::new("Prose.");
        let store = MemoryVectorStore::new();
        let plan = repair_outline(vec!["Habitat".into(), "Diet".into(), "Threats".into()]);
        let out = writer(&gen, &store, &plan).write_all().await;

        assert_eq!(out.sections.len(), 6);
        for (i, section) in out.sections.iter().enumerate() {
            assert_eq!(section.index, i);
            assert_eq!(section.title, plan[i].title);
            assert_eq!(section.role, plan[i].role);
        }
    }
}

//! Outline and search-query generation.
//!
//! One generation call produces the section outline. The parser is
//! deliberately forgiving (models decorate lists in many ways) and the
//! repair step guarantees the structural shape every later stage relies
//! on: item 0 is the introduction, the last item is the references list,
//! the one before it the conclusion, everything in between a body
//! section. Query generation runs per body section and is never fatal; a
//! failed call degrades to the literal `"{topic} {section}"` query.

use ragpipe_core::{Error, PlanItem, Result, SectionRole, Task, TextGenerator};

const PLAN_SYSTEM: &str = "You are a research assistant. Produce a detailed, logically ordered \
     outline for a thorough report on the given topic. Include an introduction, at least three \
     substantive body sections, a conclusion, and a references section. Output ONLY a numbered \
     list of section titles, one per line, with nothing before or after the list.";

fn introduction_like(title: &str) -> bool {
    title.to_lowercase().contains("introduc")
}

fn conclusion_like(title: &str) -> bool {
    let t = title.to_lowercase();
    t.contains("conclus") || t.contains("summary") || t.contains("closing")
}

fn references_like(title: &str) -> bool {
    let t = title.to_lowercase();
    t.contains("reference")
        || t.contains("bibliograph")
        || t.contains("works cited")
        || t.trim() == "sources"
}

/// Strip a leading list marker (`1.`, `2)`, `-`, `*`, `#`) from a line.
/// Returns `None` when the line carries no marker at all.
fn strip_list_marker(line: &str) -> Option<&str> {
    let t = line.trim_start();
    let end = t
        .find(|c: char| !(c.is_ascii_digit() || matches!(c, '*' | '-' | '.' | ')' | '#')))
        .unwrap_or(t.len());
    if end == 0 {
        return None;
    }
    Some(t[end..].trim())
}

/// Pull section titles out of a model response. Marker-prefixed lines win,
/// which drops any prose the model wrapped around the list; if no line
/// carries a marker the response is taken line by line as-is.
pub fn parse_outline(response: &str) -> Vec<String> {
    let mut items: Vec<String> = response
        .lines()
        .filter_map(strip_list_marker)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    if items.is_empty() {
        items = response
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
    }
    items
}

/// Enforce the structural shape: introduction first, references last,
/// conclusion just before it, everything else body. Items the model put
/// elsewhere are moved rather than duplicated; missing ones are
/// synthesized, so the result always has at least three items.
pub fn repair_outline(titles: Vec<String>) -> Vec<PlanItem> {
    let mut rest = titles;
    let references =
        take_first(&mut rest, references_like).unwrap_or_else(|| "References".to_string());
    let conclusion =
        take_first(&mut rest, conclusion_like).unwrap_or_else(|| "Conclusion".to_string());
    let introduction =
        take_first(&mut rest, introduction_like).unwrap_or_else(|| "Introduction".to_string());

    let mut plan = Vec::with_capacity(rest.len() + 3);
    plan.push(PlanItem { title: introduction, role: SectionRole::Introduction });
    for title in rest {
        plan.push(PlanItem { title, role: SectionRole::Body });
    }
    plan.push(PlanItem { title: conclusion, role: SectionRole::Conclusion });
    plan.push(PlanItem { title: references, role: SectionRole::References });
    plan
}

fn take_first(items: &mut Vec<String>, pred: impl Fn(&str) -> bool) -> Option<String> {
    let i = items.iter().position(|t| pred(t))?;
    Some(items.remove(i))
}

/// One generation call, parsed and repaired into the final plan. This is
/// the only run-fatal call in the pipeline: without an outline there is
/// nothing to research.
pub async fn research_plan(
    generator: &dyn TextGenerator,
    topic: &str,
    timeout_ms: u64,
) -> Result<Vec<PlanItem>> {
    let prompt = format!("Write the outline for a research report on: \"{topic}\".");
    let response = generator
        .generate(PLAN_SYSTEM, &prompt, timeout_ms)
        .await
        .map_err(|e| Error::Plan(format!("outline call failed: {e}")))?;
    let items = parse_outline(&response);
    if items.is_empty() {
        return Err(Error::Plan("outline response had no usable lines".to_string()));
    }
    Ok(repair_outline(items))
}

/// Search queries for one body section. Never fails: a bad call or an
/// empty response degrades to a query built from the topic and title.
/// Double quotes are stripped so a decorated query cannot turn into an
/// accidental exact-phrase search.
pub async fn section_queries(
    generator: &dyn TextGenerator,
    topic: &str,
    plan: &[PlanItem],
    section_title: &str,
    max_queries: usize,
    timeout_ms: u64,
) -> Vec<String> {
    let outline = plan
        .iter()
        .map(|p| format!("- {}", p.title))
        .collect::<Vec<_>>()
        .join("\n");
    let system = format!(
        "You are a research assistant. The report topic is '{topic}'.\nFull outline:\n{outline}\n\n\
         Write up to {max} focused web search queries for gathering material for the section \
         named below. The queries must target that section specifically while staying within \
         the topic. Output ONLY the queries, one per line, with no numbering or markers.",
        max = max_queries.max(1),
    );
    let prompt = format!("Write search queries for the outline section: \"{section_title}\".");
    let fallback = || vec![format!("{topic} {section_title}")];

    let response = match generator.generate(&system, &prompt, timeout_ms).await {
        Ok(r) => r,
        Err(_) => return fallback(),
    };
    let queries: Vec<String> = response
        .lines()
        .map(|l| strip_list_marker(l).unwrap_or_else(|| l.trim()))
        .map(|l| l.replace('"', ""))
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .take(max_queries.max(1))
        .collect();
    if queries.is_empty() {
        fallback()
    } else {
        queries
    }
}

/// Expand the plan into search tasks, one per (body section, query).
/// Structural sections never get tasks. Ids are stable across reruns of
/// the same plan: `plan_{section}` and `q_{section}_{query}`.
pub async fn build_tasks(
    generator: &dyn TextGenerator,
    topic: &str,
    plan: &[PlanItem],
    queries_per_section: usize,
    timeout_ms: u64,
) -> Vec<Task> {
    let mut tasks = Vec::new();
    for (i, item) in plan.iter().enumerate() {
        if item.role != SectionRole::Body {
            continue;
        }
        let queries =
            section_queries(generator, topic, plan, &item.title, queries_per_section, timeout_ms)
                .await;
        for (j, query) in queries.into_iter().enumerate() {
            tasks.push(Task {
                query,
                plan_item_id: format!("plan_{i}"),
                plan_item: item.title.clone(),
                query_id: format!("q_{i}_{j}"),
            });
        }
    }
    tasks
}

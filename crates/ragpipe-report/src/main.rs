//! CLI entry: one topic in, one markdown report out.

use anyhow::Context;
use clap::Parser;
use ragpipe_report::ResearchPipeline;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "ragpipe-report",
    version,
    about = "Write a source-grounded research report for a topic."
)]
struct Args {
    /// Research topic; multiple words are joined.
    #[arg(required = true)]
    topic: Vec<String>,

    /// Write the report markdown here instead of stdout.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print the run summary as JSON to stderr when done.
    #[arg(long)]
    summary: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let topic = args.topic.join(" ");

    let pipeline = ResearchPipeline::from_env().context("wiring the pipeline")?;
    let report = pipeline.run(&topic).await.context("research run")?;

    match &args.output {
        Some(path) => std::fs::write(path, &report.markdown)
            .with_context(|| format!("writing {}", path.display()))?,
        None => println!("{}", report.markdown),
    }
    if args.summary {
        eprintln!("{}", serde_json::to_string_pretty(&report.summary)?);
    }
    if !report.warnings.is_empty() {
        eprintln!("warnings: {}", report.warnings.join(", "));
    }
    Ok(())
}

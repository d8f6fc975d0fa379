use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::ingest::IngestReport;
use crate::pipeline::{ConversationTurn, PipelineOrchestrator, PipelineResponse};
use crate::store::Metadata;

/// Totals over a set of ingested files
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KnowledgeSummary {
    pub files: usize,
    pub chunks: usize,
    pub failed: Vec<PathBuf>,
}

/// Load configuration and build a pipeline with its embedding mode resolved
#[inline]
pub async fn build_pipeline(config: &Config) -> Result<PipelineOrchestrator> {
    let pipeline =
        PipelineOrchestrator::from_config(config).context("Failed to build pipeline")?;
    let mode = pipeline.embeddings().initialize().await;
    info!("Embedding mode: {}", mode);
    Ok(pipeline)
}

/// Chunk and embed files into the pipeline's knowledge collection
#[inline]
pub async fn load_knowledge(
    pipeline: &PipelineOrchestrator,
    files: &[PathBuf],
) -> Result<KnowledgeSummary> {
    let bar = if console::user_attended_stderr() {
        ProgressBar::new(files.len() as u64).with_style(
            ProgressStyle::with_template("{bar:30} [{pos}/{len}] Ingesting {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        )
    } else {
        ProgressBar::hidden()
    };

    let mut summary = KnowledgeSummary::default();
    for file in files {
        bar.set_message(file.display().to_string());

        match ingest_file(pipeline, file).await {
            Ok(report) => {
                summary.files += 1;
                summary.chunks += report.chunk_count;
            }
            Err(e) => {
                warn!("Skipping {}: {:#}", file.display(), e);
                summary.failed.push(file.clone());
            }
        }
        bar.inc(1);
    }
    bar.finish_and_clear();

    Ok(summary)
}

async fn ingest_file(pipeline: &PipelineOrchestrator, file: &Path) -> Result<IngestReport> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let mut metadata = Metadata::new();
    metadata.insert("source".to_string(), json!(file.display().to_string()));

    let report = pipeline
        .add_content(&content, metadata)
        .await
        .with_context(|| format!("Failed to ingest {}", file.display()))?;
    Ok(report)
}

/// Ingest files and print what the store now holds
#[inline]
pub async fn ingest_files(
    mut config: Config,
    files: &[PathBuf],
    collection: Option<String>,
) -> Result<()> {
    if let Some(collection) = collection {
        config.retrieval.collection = collection;
    }

    let pipeline = build_pipeline(&config).await?;
    let summary = load_knowledge(&pipeline, files).await?;

    println!(
        "Ingested {} of {} files ({} chunks)",
        summary.files,
        files.len(),
        summary.chunks
    );
    for failed in &summary.failed {
        println!("  {} {}", style("✗").red(), failed.display());
    }

    let stats = pipeline.store().stats().context("Failed to read store stats")?;
    println!();
    println!("Collections:");
    for collection in &stats.collections {
        println!(
            "  📚 {} ({} records, dimension {})",
            collection.name, collection.records, collection.dimension
        );
    }
    println!(
        "Embedding mode: {}",
        style(pipeline.embeddings().mode()).cyan()
    );

    Ok(())
}

/// Run a single turn
#[inline]
pub async fn ask(config: &Config, message: &str, knowledge: &[PathBuf], json: bool) -> Result<()> {
    let pipeline = build_pipeline(config).await?;
    if !knowledge.is_empty() {
        load_knowledge(&pipeline, knowledge).await?;
    }

    let session_id = Uuid::new_v4().to_string();
    let response = pipeline.retrieve_and_verify(message, &[], &session_id).await;

    if json {
        let output =
            serde_json::to_string_pretty(&response).context("Failed to serialize response")?;
        println!("{}", output);
    } else {
        print!("{}", render_response(&response));
    }

    Ok(())
}

/// Read turns from stdin until EOF or `exit`, keeping the conversation history
#[inline]
pub async fn chat(config: &Config, knowledge: &[PathBuf]) -> Result<()> {
    let pipeline = build_pipeline(config).await?;
    if !knowledge.is_empty() {
        let summary = load_knowledge(&pipeline, knowledge).await?;
        eprintln!(
            "Loaded {} chunks from {} files",
            summary.chunks, summary.files
        );
    }

    let session_id = Uuid::new_v4().to_string();
    let mut history: Vec<ConversationTurn> = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    eprintln!("{}", style("Type a message, or 'exit' to quit.").dim());
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let message = line.trim();
        if message.is_empty() {
            continue;
        }
        if message == "exit" || message == "quit" {
            break;
        }

        let response = pipeline
            .retrieve_and_verify(message, &history, &session_id)
            .await;
        print!("{}", render_response(&response));

        history.push(ConversationTurn::user(message));
        history.push(ConversationTurn::assistant(response.text));
    }

    pipeline.forget_session(&session_id);
    Ok(())
}

/// Probe every stage and print the result
#[inline]
pub async fn show_health(config: &Config) -> Result<()> {
    let pipeline = build_pipeline(config).await?;
    let report = pipeline.health_check().await;

    let overall = if report.healthy {
        style("healthy").green()
    } else {
        style("degraded").red()
    };
    println!("Pipeline: {}", overall);
    println!("Embedding mode: {}", style(report.embedding_mode).cyan());
    for (stage, ok) in &report.per_stage {
        let mark = if *ok { style("✓").green() } else { style("✗").red() };
        println!("  {} {}", mark, stage);
    }
    if let Some(error) = pipeline.embeddings().last_error() {
        println!("Last embedding error: {}", error);
    }

    Ok(())
}

/// Human readable form of one reply
fn render_response(response: &PipelineResponse) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", response.text);
    let _ = writeln!(out, "  confidence: {:.2}", response.confidence);

    if response.short_circuited {
        out.push_str("  safety: crisis support response\n");
    }
    for flag in &response.flags {
        let _ = writeln!(
            out,
            "  flag: {} ({}, {:.2})",
            flag.kind, flag.severity, flag.confidence
        );
    }
    if !response.sources.is_empty() {
        let _ = writeln!(out, "  sources: {}", response.sources.join(", "));
    }
    let _ = writeln!(out, "  audit: {}", response.audit.join(" > "));
    out
}

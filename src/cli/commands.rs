//! CLI command definitions and handlers

use clap::Subcommand;
use std::path::PathBuf;

use crate::core::models::{ChunkStrategy, ProbeKind, ReplyMode, SchedulingStrategy};

/// Commands for the batch translation scheduler
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Translate a text file as one scheduled batch
    Run {
        /// Input file (required)
        #[arg(short, long)]
        file: PathBuf,

        /// Output file (default: <input>_translated)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Model id to translate with
        #[arg(short, long)]
        model: String,

        /// Maximum concurrent provider calls
        #[arg(short, long, default_value_t = 4)]
        concurrency: usize,

        /// Chunking strategy: line or token
        #[arg(long, default_value = "line")]
        chunk_strategy: String,

        /// Lines (or approximate tokens) per chunk
        #[arg(long, default_value_t = 20)]
        chunk_size: usize,

        /// Dispatch strategy: event or timed
        #[arg(long, default_value = "event")]
        strategy: String,

        /// Timed-strategy interval in seconds (clamped to 1-10)
        #[arg(long, default_value_t = 2)]
        interval: u64,

        /// Reply-size prediction: predicted, equivalent or regression
        #[arg(long, default_value = "regression")]
        reply_mode: String,

        /// Fixed reply-size guess for --reply-mode predicted
        #[arg(long, default_value_t = 512)]
        predicted_tokens: u64,

        /// Disable streaming responses
        #[arg(long)]
        no_stream: bool,
    },

    /// Send a single probe to check provider availability
    Probe {
        /// Probe kind: quick or api
        #[arg(short, long, default_value = "quick")]
        kind: String,

        /// Model id used by the api probe
        #[arg(short, long)]
        model: String,
    },

    /// Fit the reply-size regression from a samples JSON file
    Estimate {
        /// JSON file with an array of regression samples
        #[arg(short, long)]
        samples: PathBuf,

        /// Model id to fit
        #[arg(short, long)]
        model: String,

        /// Optional input length to predict for
        #[arg(short, long)]
        input_length: Option<u64>,
    },
}

fn parse_chunk_strategy(s: &str) -> anyhow::Result<ChunkStrategy> {
    match s {
        "line" => Ok(ChunkStrategy::Line),
        "token" => Ok(ChunkStrategy::Token),
        other => anyhow::bail!("Unknown chunk strategy: {}", other),
    }
}

fn parse_scheduling_strategy(s: &str) -> anyhow::Result<SchedulingStrategy> {
    match s {
        "event" => Ok(SchedulingStrategy::Event),
        "timed" => Ok(SchedulingStrategy::Timed),
        other => anyhow::bail!("Unknown scheduling strategy: {}", other),
    }
}

fn parse_reply_mode(s: &str) -> anyhow::Result<ReplyMode> {
    match s {
        "predicted" => Ok(ReplyMode::Predicted),
        "equivalent" => Ok(ReplyMode::Equivalent),
        "regression" => Ok(ReplyMode::Regression),
        other => anyhow::bail!("Unknown reply mode: {}", other),
    }
}

fn parse_probe_kind(s: &str) -> anyhow::Result<ProbeKind> {
    match s {
        "quick" => Ok(ProbeKind::Quick),
        "api" => Ok(ProbeKind::Api),
        other => anyhow::bail!("Unknown probe kind: {}", other),
    }
}

/// Handle the run command
#[allow(clippy::too_many_arguments)]
pub async fn handle_run(
    file: PathBuf,
    output: Option<PathBuf>,
    model: String,
    concurrency: usize,
    chunk_strategy: String,
    chunk_size: usize,
    strategy: String,
    interval: u64,
    reply_mode: String,
    predicted_tokens: u64,
    no_stream: bool,
) -> anyhow::Result<()> {
    use crate::core::client::{HttpTranslationClient, ProbeTarget};
    use crate::core::models::{BatchConfig, TaskStatus};
    use crate::engine::TranslationEngine;
    use crate::scheduler::batch::SchedulerEvent;
    use crate::scheduler::state::TaskEvent;
    use crate::storage::MemoryTaskStore;
    use indicatif::{ProgressBar, ProgressStyle};
    use std::sync::Arc;
    use std::time::Instant;
    use tracing::info;

    let start_time = Instant::now();

    let output = output.unwrap_or_else(|| {
        let mut out = file.clone();
        let mut filename = file.file_name().unwrap_or_default().to_os_string();
        filename.push("_translated");
        out.set_file_name(filename);
        out
    });

    info!("Starting batch translation");
    info!("Input: {}", file.display());
    info!("Output: {}", output.display());
    info!("Model: {}", model);
    info!("Concurrency: {}", concurrency);

    let content = tokio::fs::read_to_string(&file).await?;

    let config = BatchConfig {
        model_id: model,
        chunk_strategy: parse_chunk_strategy(&chunk_strategy)?,
        chunk_size,
        concurrency,
        reply_mode: parse_reply_mode(&reply_mode)?,
        predicted_tokens,
        scheduling_strategy: parse_scheduling_strategy(&strategy)?,
        timed_interval_secs: interval,
        stream: !no_stream,
        ..Default::default()
    };

    let client = Arc::new(HttpTranslationClient::from_env()?);
    let store = Arc::new(MemoryTaskStore::new());
    let probe_target: Arc<dyn ProbeTarget> = client.clone();
    let engine = TranslationEngine::new(client, Some(probe_target), store.clone());

    let batch_name = file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "batch".to_string());
    let batch_id = engine.create_batch(&batch_name, &content, config).await?;
    let batch = engine
        .batch(&batch_id)
        .await
        .ok_or_else(|| anyhow::anyhow!("Batch vanished after creation"))?;
    let total = batch.task_ids.len() as u64;

    let pb = ProgressBar::new(total);
    pb.set_style(ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .unwrap()
        .progress_chars("=>-"));

    // Subscribe before submitting so no terminal event is missed
    let mut task_events = engine.task_events();
    engine.submit_all(&batch_id).await?;
    let mut scheduler_events = engine
        .scheduler_events(&batch_id)
        .await
        .ok_or_else(|| anyhow::anyhow!("No scheduler for batch"))?;

    let mut completed = 0usize;
    let mut failed = 0usize;
    loop {
        tokio::select! {
            event = task_events.recv() => {
                match event {
                    Ok(TaskEvent::Completed { batch_id: b, .. }) if b == batch_id => {
                        completed += 1;
                        pb.inc(1);
                    }
                    Ok(TaskEvent::Failed { batch_id: b, message, .. }) if b == batch_id => {
                        failed += 1;
                        pb.inc(1);
                        pb.set_message(format!("Failed: {}", message));
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
                if (completed + failed) as u64 >= total {
                    break;
                }
            }
            event = scheduler_events.recv() => {
                match event {
                    Ok(SchedulerEvent::Throttled { resume_in }) => {
                        pb.set_message(format!("Throttled, resuming within {:?}", resume_in));
                    }
                    Ok(SchedulerEvent::Recovered) => pb.set_message("Recovered"),
                    Ok(SchedulerEvent::Completed { .. }) => break,
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        }
    }
    pb.finish_with_message("Completed");

    // Stitch translated chunks in creation order, falling back to the
    // source text for tasks that did not complete
    let mut translated = Vec::with_capacity(batch.task_ids.len());
    for id in &batch.task_ids {
        let row = store.row(id).await;
        match row {
            Some(row) if row.status == Some(TaskStatus::Completed) => {
                translated.push(row.translation);
            }
            _ => {
                if let Some(task) = engine.task(id).await {
                    translated.push(task.content);
                }
            }
        }
    }
    tokio::fs::write(&output, translated.join("\n")).await?;

    let duration = start_time.elapsed();
    info!(
        "Completed: {} translated, {} failed in {:?}",
        completed, failed, duration
    );

    println!("\n✅ Translation completed!");
    println!("   Translated: {}", completed);
    println!("   Failed: {}", failed);
    println!("   Output: {}", output.display());
    println!("   Time: {:?}", duration);

    Ok(())
}

/// Handle the probe command
pub async fn handle_probe(kind: String, model: String) -> anyhow::Result<()> {
    use crate::core::client::{HttpTranslationClient, ProbeTarget};

    let kind = parse_probe_kind(&kind)?;
    let client = HttpTranslationClient::from_env()?;

    match client.probe(kind, &model).await {
        Ok(()) => {
            println!("✅ Provider reachable");
            Ok(())
        }
        Err(e) => {
            println!("⚠️  Probe failed: {}", e);
            Err(e.into())
        }
    }
}

/// Handle the estimate command
pub async fn handle_estimate(
    samples: PathBuf,
    model: String,
    input_length: Option<u64>,
) -> anyhow::Result<()> {
    use crate::scheduler::estimator::{RegressionSample, TokenEstimator};

    let content = tokio::fs::read_to_string(&samples).await?;
    let samples: Vec<RegressionSample> = serde_json::from_str(&content)?;

    let mut estimator = TokenEstimator::new();
    let mut fed = 0usize;
    for sample in samples {
        if sample.model_id == model {
            estimator.add_sample(sample);
            fed += 1;
        }
    }

    println!("Samples for {}: {}", model, fed);
    match estimator.coefficients(&model) {
        Some(c) => {
            println!("   slope: {:.4}", c.slope);
            println!("   intercept: {:.2}", c.intercept);
            println!("   R²: {:.4}", c.r_squared);
            if let Some(x) = input_length {
                match estimator.estimate(x, &model) {
                    Some(y) => println!("   predicted output for {} chars: {} tokens", x, y),
                    None => println!("   prediction unavailable"),
                }
            }
        }
        None => println!("   Not enough samples to fit (need at least 3)"),
    }

    Ok(())
}

//! Main entry point for the batch translation scheduler CLI

#![forbid(unsafe_code)]

use clap::Parser;
use dotenvy::dotenv;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;
mod core;
mod engine;
mod scheduler;
mod storage;

use cli::commands::Commands;

/// Batch translation scheduling engine
#[derive(Parser, Debug)]
#[command(name = "translation-scheduler", version, about, long_about = None)]
struct Args {
    /// API key for the provider (optional, defaults to ARK_API_KEY env var)
    #[arg(long)]
    api_key: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    let log_level = if std::env::var("RUST_LOG").is_ok() {
        std::env::var("RUST_LOG").unwrap()
    } else {
        "info".to_string()
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}={}", env!("CARGO_PKG_NAME"), log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    // Override config with CLI args if provided
    if let Some(api_key) = args.api_key {
        std::env::set_var("ARK_API_KEY", api_key);
    }

    if args.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }

    // Execute command
    match args.command {
        Some(Commands::Run {
            file,
            output,
            model,
            concurrency,
            chunk_strategy,
            chunk_size,
            strategy,
            interval,
            reply_mode,
            predicted_tokens,
            no_stream,
        }) => {
            cli::commands::handle_run(
                file,
                output,
                model,
                concurrency,
                chunk_strategy,
                chunk_size,
                strategy,
                interval,
                reply_mode,
                predicted_tokens,
                no_stream,
            )
            .await?;
        }
        Some(Commands::Probe { kind, model }) => {
            cli::commands::handle_probe(kind, model).await?;
        }
        Some(Commands::Estimate {
            samples,
            model,
            input_length,
        }) => {
            cli::commands::handle_estimate(samples, model, input_length).await?;
        }
        None => {
            println!("Please specify a command. Use --help for more information.");
        }
    }

    Ok(())
}

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use kwatch_core::NormalizationMode;
use kwatch_storage::{SeenTweetStore, StoreConfig};
use kwatch_sync::{format_run_line, load_keywords, serve_scheduler, PollPipeline, SyncConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "kwatch-cli")]
#[command(about = "Poll keyword searches and report tweets not seen before")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one poll over the given keywords (or keywords.yaml).
    Poll(PollArgs),
    /// Poll on the configured cron schedule until interrupted.
    Schedule,
    /// Create the seen-tweet table if needed.
    InitDb,
}

#[derive(Debug, Args, Default)]
struct PollArgs {
    /// Keyword(s) to search for. Defaults to keywords.yaml.
    #[arg(value_name = "KEYWORD")]
    keywords: Vec<String>,
    /// Max number of tweets to retrieve per keyword (10-100).
    #[arg(short, long)]
    limit: Option<u32>,
    /// Log new tweets instead of posting them to Slack.
    #[arg(long)]
    no_notify: bool,
    /// Replay saved search responses from this directory.
    #[arg(long, value_name = "DIR")]
    fixtures: Option<PathBuf>,
    /// Canonicalization strictness: basic or aggressive.
    #[arg(long)]
    normalization: Option<NormalizationMode>,
    /// Print the new tweets by keyword as JSON.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("kwatch=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    config.log_redacted();

    match cli.command.unwrap_or(Commands::Poll(PollArgs::default())) {
        Commands::Poll(args) => poll(config, args).await?,
        Commands::Schedule => {
            let mut config = config;
            config.scheduler_enabled = true;
            let pipeline = Arc::new(PollPipeline::from_config(config).await?);
            serve_scheduler(pipeline).await?;
        }
        Commands::InitDb => {
            let store = SeenTweetStore::open(&config.database_url, StoreConfig::default())
                .await
                .context("initializing seen-tweet store")?;
            println!(
                "seen-tweet store ready: target={} records={}",
                store.target(),
                store.count().await?
            );
        }
    }

    Ok(())
}

async fn poll(mut config: SyncConfig, args: PollArgs) -> Result<()> {
    if let Some(limit) = args.limit {
        config.page_size = limit;
    }
    if let Some(mode) = args.normalization {
        config.normalization = mode;
    }
    if args.fixtures.is_some() {
        config.fixtures_dir = args.fixtures;
    }
    config.notify = !args.no_notify;

    let keywords = if args.keywords.is_empty() {
        load_keywords(config.keywords_path()).await?
    } else {
        args.keywords
    };
    anyhow::ensure!(!keywords.is_empty(), "no keywords given");

    let pipeline = PollPipeline::from_config(config).await?;
    let outcome = pipeline.run_once(&keywords).await?;
    info!(run_id = %outcome.summary.run_id, "run finished");

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&outcome.matches).context("serializing matches")?
        );
    }
    println!("{}", format_run_line(&outcome.summary));
    Ok(())
}

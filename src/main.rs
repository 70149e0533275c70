use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use auction_ingest::config::Settings;
use auction_ingest::db::Database;
use auction_ingest::download::HttpDownloader;
use auction_ingest::fetch::HttpFetcher;
use auction_ingest::link_extractor::LinkExtractor;
use auction_ingest::llm::{ChatModel, OpenAiChat};
use auction_ingest::normalize::RowNormalizer;
use auction_ingest::spreadsheet::ZipWorkbookExtractor;
use auction_ingest::{Pipeline, RunReport, Stages};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "auction_ingest", about = "Guarantee of Origin auction results ingester")]
struct Cli {
    /// Config file (default: ./auction_ingest.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and seed sources from the config file
    Init,
    /// Manage the source catalog
    Sources {
        #[command(subcommand)]
        command: SourceCommands,
    },
    /// Run the pipeline once over every source
    Refresh,
    /// Refresh on a fixed interval until Ctrl-C
    Watch {
        /// Seconds between runs (default: refresh_interval_secs)
        #[arg(short, long)]
        interval: Option<u64>,
    },
    /// Show the most recent run events
    Logs {
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },
    /// Show storage statistics
    Stats,
    /// Delete stored results and processed markers
    Purge,
}

#[derive(Subcommand)]
enum SourceCommands {
    /// Add a page to ingest
    Add {
        url: String,
        #[arg(short, long)]
        comment: Option<String>,
    },
    /// List configured pages
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    let result = match cli.command {
        Commands::Init => {
            let db = open_db(&settings)?;
            let seeded = db.seed_sources(&seed_list(&settings))?;
            println!(
                "Database ready at {} ({} new sources from config)",
                settings.database_path.display(),
                seeded
            );
            Ok(())
        }
        Commands::Sources { command } => {
            let db = open_db(&settings)?;
            match command {
                SourceCommands::Add { url, comment } => {
                    if db.add_source(&url, comment.as_deref())? {
                        println!("Added {}", url.trim());
                    } else {
                        println!("Already present: {}", url.trim());
                    }
                }
                SourceCommands::List => {
                    let sources = db.sources()?;
                    if sources.is_empty() {
                        println!("No sources. Add one with 'sources add <url>'.");
                        return Ok(());
                    }
                    for s in &sources {
                        println!("{:>3} | {} | {}", s.id, s.url, s.comment.as_deref().unwrap_or("-"));
                    }
                }
            }
            Ok(())
        }
        Commands::Refresh => {
            let db = Arc::new(open_db(&settings)?);
            db.seed_sources(&seed_list(&settings))?;
            let pipeline = build_pipeline(&settings, db)?;

            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());

            let pb = ProgressBar::new_spinner();
            pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?);
            pb.set_message("refreshing sources...");
            pb.enable_steady_tick(Duration::from_millis(120));

            let outcome = pipeline.refresh(cancel).await;
            pb.finish_and_clear();

            let report = outcome.context("refresh failed")?;
            print_report(&report);
            Ok(())
        }
        Commands::Watch { interval } => {
            let db = Arc::new(open_db(&settings)?);
            db.seed_sources(&seed_list(&settings))?;
            let pipeline = build_pipeline(&settings, db)?;
            let every = Duration::from_secs(interval.unwrap_or(settings.refresh_interval_secs).max(1));

            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());
            println!("Refreshing every {}s, Ctrl-C to stop.", every.as_secs());

            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match pipeline.refresh(cancel.child_token()).await {
                    Ok(report) => print_report(&report),
                    Err(e) => warn!(error = %e, "scheduled refresh failed"),
                }
            }
            info!("watch stopped");
            Ok(())
        }
        Commands::Logs { limit } => {
            let db = open_db(&settings)?;
            let events = db.recent_events(limit)?;
            if events.is_empty() {
                println!("No run events yet.");
                return Ok(());
            }
            for e in &events {
                println!(
                    "{} | {:<8} | {:<16} | {:<7} | {}",
                    e.datetime.format("%Y-%m-%d %H:%M:%S"),
                    truncate(e.run_id.as_deref().unwrap_or("-"), 8),
                    e.stage,
                    e.outcome,
                    e.message.as_deref().unwrap_or("")
                );
            }
            Ok(())
        }
        Commands::Stats => {
            let db = open_db(&settings)?;
            let s = db.stats()?;
            println!("Sources:         {}", s.sources);
            println!("Result rows:     {}", s.results);
            println!("Processed files: {}", s.processed_files);
            println!("Run events:      {} ({} failed)", s.events, s.failed_events);
            println!("Last run:        {}", s.last_run.as_deref().unwrap_or("-"));
            Ok(())
        }
        Commands::Purge => {
            let db = open_db(&settings)?;
            let (results, processed) = db.delete_results()?;
            println!("Deleted {} result rows and {} processed markers.", results, processed);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn open_db(settings: &Settings) -> anyhow::Result<Database> {
    Database::open(&settings.database_path)
        .with_context(|| format!("open database {}", settings.database_path.display()))
}

fn seed_list(settings: &Settings) -> Vec<(String, Option<String>)> {
    settings
        .sources
        .iter()
        .map(|s| (s.url.clone(), s.comment.clone()))
        .collect()
}

fn build_pipeline(settings: &Settings, db: Arc<Database>) -> anyhow::Result<Pipeline> {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(settings.http_timeout_secs))
        .build()
        .context("build http client")?;
    let model: Arc<dyn ChatModel> = Arc::new(
        OpenAiChat::new(settings.api_key()?, http.clone())
            .with_base_url(&settings.openai_base_url)
            .with_model(&settings.model),
    );

    Ok(Pipeline::new(Stages {
        catalog: db.clone(),
        fetcher: Arc::new(HttpFetcher::new(http.clone())),
        link_extractor: LinkExtractor::new(model.clone()).with_attempts(settings.llm_attempts),
        downloader: Arc::new(HttpDownloader::new(http)),
        workbooks: Arc::new(ZipWorkbookExtractor),
        normalizer: RowNormalizer::new(model)
            .with_attempts(settings.llm_attempts)
            .with_batching(settings.max_rows_per_batch, settings.token_budget)
            .with_mode(settings.year_month),
        store: db.clone(),
        dedup: db.clone(),
        audit: db,
    }))
}

fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, cancelling");
            cancel.cancel();
        }
    });
}

fn print_report(report: &RunReport) {
    println!(
        "Run {}: {} sources, {} files stored, {} already processed, {} rows.",
        report.run_id, report.sources, report.files_processed, report.files_skipped, report.rows_stored
    );
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

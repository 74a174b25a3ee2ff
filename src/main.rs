mod config;
mod db;
mod error;
mod extract;
mod fetcher;
mod index;
mod normalize;
mod pipeline;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::warn;
use url::Url;

use config::Settings;
use extract::assistant::AssistantClient;
use fetcher::{DocumentSource, DocumentStore, Fetcher, HttpSource};

#[derive(Parser)]
#[command(name = "policy_ingest", about = "Payer policy PDF metadata ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scrape the index page and list documents per effective date
    Discover {
        /// Earliest effective date to keep (YYYY-MM-DD)
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Latest effective date to keep (YYYY-MM-DD)
        #[arg(long)]
        to: Option<NaiveDate>,
    },
    /// Download every discovered document into the date-bucketed store
    Fetch {
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
    },
    /// Discover, fetch, extract, normalize and load (each document end to end)
    Run {
        /// Max documents to process
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
    },
    /// Extract one local file and print the normalized record
    Extract {
        file: PathBuf,
        /// Source URL to attach as provenance
        #[arg(long)]
        url: Option<String>,
        /// Also insert the record into the database
        #[arg(long)]
        load: bool,
    },
    /// Show ingestion statistics
    Stats,
    /// Stored policies overview table
    Overview {
        /// Filter by payer (e.g. "Cigna")
        #[arg(short, long)]
        payer: Option<String>,
        /// Max rows to display
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },
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
    let settings = Arc::new(Settings::load()?);

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted; finishing in-flight documents");
                stop.store(true, Ordering::Release);
            }
        });
    }

    let result = match cli.command {
        Commands::Discover { from, to } => {
            let source = HttpSource::new(settings.http_timeout())?;
            let by_date = discover(&settings, &source, from, to).await?;
            if by_date.is_empty() {
                println!("No documents found.");
                return Ok(());
            }
            for (date, urls) in &by_date {
                println!("{}  {} documents", date, urls.len());
                for url in urls {
                    println!("    {}", url);
                }
            }
            let unique = index::plan_work(&by_date).len();
            println!("\n{} dates, {} unique documents", by_date.len(), unique);
            Ok(())
        }
        Commands::Fetch { from, to } => {
            let source: Arc<dyn DocumentSource> = Arc::new(HttpSource::new(settings.http_timeout())?);
            let by_date = discover(&settings, source.as_ref(), from, to).await?;
            let links = index::flatten(&by_date);
            if links.is_empty() {
                println!("No documents found.");
                return Ok(());
            }
            let base = Url::parse(&settings.base_url).context("Invalid base_url")?;
            let fetcher = Arc::new(Fetcher::new(base, source, DocumentStore::new(settings.store_dir.clone())));
            println!("Fetching {} documents into {:?}...", links.len(), settings.store_dir);
            let stats = fetcher.mirror(links, settings.concurrency).await;
            println!(
                "Done: {} documents ({} downloaded, {} already stored, {} errors).",
                stats.total, stats.downloaded, stats.cached, stats.errors
            );
            Ok(())
        }
        Commands::Run { limit, from, to } => {
            let credentials = settings.assistant_credentials()?;
            let extractor: Arc<dyn extract::ExtractionService> =
                Arc::new(AssistantClient::new(&settings, credentials, Arc::clone(&stop))?);
            let source: Arc<dyn DocumentSource> = Arc::new(HttpSource::new(settings.http_timeout())?);

            let by_date = discover(&settings, source.as_ref(), from, to).await?;
            let conn = db::connect(&settings.db_path)?;
            db::init_schema(&conn)?;

            let pipeline = pipeline::Pipeline::new(Arc::clone(&settings), source, extractor, Arc::clone(&stop))?;
            let items = pipeline.plan(&conn, index::plan_work(&by_date), limit)?;
            if items.is_empty() {
                println!("Nothing to do: no new documents in range.");
                return Ok(());
            }

            println!("Pipeline: {} documents (fetch → extract → load)...", items.len());
            let summary = pipeline.run(&conn, items).await;
            summary.print();
            Ok(())
        }
        Commands::Extract { file, url, load } => {
            let credentials = settings.assistant_credentials()?;
            let client = AssistantClient::new(&settings, credentials, Arc::clone(&stop))?;
            let normalized = pipeline::extract_local(&settings, &client, &file, url)
                .await
                .with_context(|| format!("Failed to extract {:?}", file))?;
            for warning in &normalized.warnings {
                warn!("{}", warning);
            }
            println!("{}", serde_json::to_string_pretty(&normalized.record)?);

            if load {
                let conn = db::connect(&settings.db_path)?;
                db::init_schema(&conn)?;
                match pipeline::load_record(&conn, &settings, &normalized.record)? {
                    db::LoadOutcome::Inserted => println!("Inserted policy {}.", normalized.record.policy_id),
                    db::LoadOutcome::Skipped => {
                        println!("Skipped: policy {} already exists.", normalized.record.policy_id)
                    }
                }
            }
            Ok(())
        }
        Commands::Overview { payer, limit } => {
            let conn = db::connect(&settings.db_path)?;
            db::init_schema(&conn)?;
            let rows = db::fetch_overview(&conn, payer.as_deref(), limit)?;
            if rows.is_empty() {
                println!("No policies found.");
                return Ok(());
            }

            println!(
                "{:>3} | {:<16} | {:<10} | {:<14} | {:<14} | {:<10} | {:>3} | {:<24}",
                "#", "Policy", "Payer", "Type", "Update", "Effective", "Urg", "Keywords"
            );
            println!("{}", "-".repeat(113));

            for (i, r) in rows.iter().enumerate() {
                println!(
                    "{:>3} | {:<16} | {:<10} | {:<14} | {:<14} | {:<10} | {:>3} | {:<24}",
                    i + 1,
                    truncate(&r.policy_id, 16),
                    truncate(&r.payer, 10),
                    truncate(&r.policy_type, 14),
                    truncate(&r.update_type, 14),
                    r.effective_date,
                    r.urgency_level,
                    truncate(&r.topic_keywords, 24)
                );
            }

            println!("\n{} policies", rows.len());
            Ok(())
        }
        Commands::Stats => {
            let conn = db::connect(&settings.db_path)?;
            db::init_schema(&conn)?;
            let s = db::get_stats(&conn)?;
            println!("Policies:     {}", s.policies);
            println!("With source:  {}", s.with_source);
            println!("Skipped URLs: {}", s.skipped_urls);
            println!("Unknown IDs:  {}", s.unknown_ids);
            println!("Runs:         {}", s.runs);
            println!("Failures:     {}", s.failures);
            println!("Failed URLs:  {}", s.failed_urls);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

/// Index page → date buckets, narrowed to the CLI range or the configured one.
async fn discover(
    settings: &Settings,
    source: &dyn DocumentSource,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> anyhow::Result<std::collections::BTreeMap<NaiveDate, Vec<String>>> {
    let html = index::fetch_index(source, &settings.index_url).await?;
    let base = Url::parse(&settings.base_url).context("Invalid base_url")?;
    let mut by_date = index::discover_links(&html, &base, &settings.extension);
    index::filter_range(&mut by_date, from.or(settings.date_from), to.or(settings.date_to));
    Ok(by_date)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDate, TimeDelta, Utc};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use harvest_client::{FieldNormalizer, ReqwestFetcher, ReqwestRobotsSource, RuleExtractorFactory};
use harvest_core::crawl::{CrawlOutcome, CrawlRequest, crawl};
use harvest_core::job::CrawlConfig;
use harvest_core::models::{EXIT_FAILED, EXIT_OK};
use harvest_core::quality::{SchemaSet, reason_histogram};
use harvest_core::registry::{SourceRegistry, validate_sources};
use harvest_core::scheduler::{Scheduler, SchedulerConfig};
use harvest_core::traits::{CheckpointStore, PartitionWriter, QuarantineSink};
use harvest_core::{Pipeline, SourceKind};
use harvest_store::{FsStore, StoreConfig};

type FsPipeline =
    Pipeline<ReqwestFetcher, ReqwestRobotsSource, RuleExtractorFactory, FieldNormalizer, FsStore>;

#[derive(Parser)]
#[command(name = "harvest", version, about = "Scheduled event crawler with a bronze/silver/gold store")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Where sources are registered and where data lands.
#[derive(clap::Args, Debug)]
struct Paths {
    /// Source registry CSV
    #[arg(long, env = "HARVEST_REGISTRY", default_value = "config/sources.csv")]
    registry: PathBuf,

    /// Root of the data directory
    #[arg(long, env = "HARVEST_DATA_ROOT", default_value = "data")]
    data_root: PathBuf,

    /// Directory with per-type JSON Schema overrides
    #[arg(long, env = "HARVEST_SCHEMA_DIR")]
    schema_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl the selected sources once and seal the run
    Crawl {
        #[command(flatten)]
        paths: Paths,

        /// Only sources of this type (events, festivals, sports)
        #[arg(short = 't', long = "type")]
        kind: Option<SourceKind>,

        /// Only this source
        #[arg(short, long)]
        source_id: Option<String>,

        /// Crawl at most this many sources
        #[arg(short, long)]
        limit: Option<usize>,

        /// Cap every source's requests per second
        #[arg(long, env = "HARVEST_QPS")]
        qps: Option<f64>,

        /// Per-request fetch timeout in seconds
        #[arg(long, env = "HARVEST_FETCH_TIMEOUT", default_value_t = 30)]
        timeout: u64,

        /// Keep only listings starting on or after this date
        #[arg(long)]
        since: Option<NaiveDate>,

        /// Keep only listings starting on or before this date
        #[arg(long)]
        until: Option<NaiveDate>,

        /// Partition date for gold output (defaults to today, UTC)
        #[arg(long)]
        date: Option<NaiveDate>,

        /// Print the jobs that would run and exit without fetching
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },

    /// Run the recurring scheduler
    Schedule {
        #[command(flatten)]
        paths: Paths,

        /// Stop after this many ticks (runs forever when omitted)
        #[arg(long)]
        ticks: Option<u64>,

        /// Seconds between ticks
        #[arg(long, env = "HARVEST_TICK_INTERVAL", default_value_t = 60)]
        interval: u64,

        /// Per-request fetch timeout in seconds
        #[arg(long, env = "HARVEST_FETCH_TIMEOUT", default_value_t = 30)]
        timeout: u64,

        /// Crawl this source immediately instead of ticking
        #[arg(long)]
        run_now: Option<String>,
    },

    /// Show recent runs, pending checkpoints and unsealed runs
    Status {
        /// Root of the data directory
        #[arg(long, env = "HARVEST_DATA_ROOT", default_value = "data")]
        data_root: PathBuf,

        /// Number of manifests to show
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },

    /// Count quarantine reason codes over recent rejects
    InspectRejects {
        /// Root of the data directory
        #[arg(long, env = "HARVEST_DATA_ROOT", default_value = "data")]
        data_root: PathBuf,

        /// Only rejects from this source
        #[arg(short, long)]
        source_id: Option<String>,

        /// Look back this many days
        #[arg(long, default_value_t = 7)]
        last: u32,
    },

    /// Show which source would crawl a URL, and how
    Explain {
        /// Page URL to look up
        url: String,

        /// Source registry CSV
        #[arg(long, env = "HARVEST_REGISTRY", default_value = "config/sources.csv")]
        registry: PathBuf,
    },

    /// Check every registry row and report problems
    ValidateSources {
        /// Source registry CSV
        #[arg(long, env = "HARVEST_REGISTRY", default_value = "config/sources.csv")]
        registry: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("harvest=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Crawl {
            paths,
            kind,
            source_id,
            limit,
            qps,
            timeout,
            since,
            until,
            date,
            dry_run,
        } => {
            let request = CrawlRequest {
                kind,
                source_id,
                limit,
                qps,
                execution_date: date,
                since,
                until,
                dry_run,
            };
            cmd_crawl(&paths, request, Duration::from_secs(timeout)).await?
        }
        Commands::Schedule {
            paths,
            ticks,
            interval,
            timeout,
            run_now,
        } => {
            let mut config = SchedulerConfig::default().with_tick_interval(Duration::from_secs(interval));
            if let Some(ticks) = ticks {
                config = config.with_max_ticks(ticks);
            }
            cmd_schedule(&paths, config, Duration::from_secs(timeout), run_now.as_deref()).await?
        }
        Commands::Status { data_root, limit } => cmd_status(&data_root, limit).await?,
        Commands::InspectRejects {
            data_root,
            source_id,
            last,
        } => cmd_inspect_rejects(&data_root, source_id.as_deref(), last).await?,
        Commands::Explain { url, registry } => cmd_explain(&registry, &url)?,
        Commands::ValidateSources { registry } => cmd_validate_sources(&registry)?,
    };

    std::process::exit(code);
}

/// Token cancelled on the first Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping after in-flight pages");
            trigger.cancel();
        }
    });
    token
}

fn build_pipeline(paths: &Paths, timeout: Duration) -> Result<FsPipeline> {
    let fetcher = ReqwestFetcher::with_timeout(timeout).map_err(|e| anyhow::anyhow!(e))?;
    let robots = ReqwestRobotsSource::from_fetcher(&fetcher);
    let normalizer = FieldNormalizer::new().map_err(|e| anyhow::anyhow!(e))?;
    let store = FsStore::from_config(&StoreConfig::new(&paths.data_root));

    let schemas = match &paths.schema_dir {
        Some(dir) => SchemaSet::load_dir(dir).map_err(|e| anyhow::anyhow!(e))?,
        None => SchemaSet::builtin(),
    };

    Ok(Pipeline::new(fetcher, robots, RuleExtractorFactory::new(), normalizer, store)
        .with_config(CrawlConfig::default().with_fetch_timeout(timeout))
        .with_schemas(schemas))
}

fn load_registry(path: &Path) -> Result<SourceRegistry> {
    SourceRegistry::load(path)
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("Failed to load source registry {}", path.display()))
}

async fn cmd_crawl(paths: &Paths, request: CrawlRequest, timeout: Duration) -> Result<i32> {
    let registry = load_registry(&paths.registry)?;
    let pipeline = build_pipeline(paths, timeout)?;

    tracing::info!(
        sources = registry.len(),
        dry_run = request.dry_run,
        "Starting crawl"
    );

    let outcome = crawl(&pipeline, &registry, &request, shutdown_token())
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    match &outcome {
        CrawlOutcome::Planned(jobs) => {
            println!("{}", serde_json::to_string_pretty(jobs)?);
        }
        CrawlOutcome::Finished {
            manifest,
            recovered,
            ..
        } => {
            for earlier in recovered {
                tracing::warn!(run_id = %earlier.run_id, "Recovered unsealed run");
            }
            println!("{}", serde_json::to_string_pretty(manifest)?);
        }
    }

    Ok(outcome.exit_code())
}

async fn cmd_schedule(
    paths: &Paths,
    config: SchedulerConfig,
    timeout: Duration,
    run_now: Option<&str>,
) -> Result<i32> {
    let registry = load_registry(&paths.registry)?;
    let pipeline = build_pipeline(paths, timeout)?;
    let scheduler = Scheduler::new(pipeline, registry, config);
    let cancel = shutdown_token();

    if let Some(source_id) = run_now {
        let manifest = scheduler
            .run_source_now(source_id, cancel)
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        println!("{}", serde_json::to_string_pretty(&manifest)?);
        return Ok(manifest.exit_code);
    }

    let report = scheduler.run(cancel).await.map_err(|e| anyhow::anyhow!(e))?;
    tracing::info!(
        ticks = report.ticks,
        runs = report.manifests.len(),
        recovered = report.recovered.len(),
        "Scheduler stopped"
    );
    Ok(report.exit_code())
}

async fn cmd_status(data_root: &Path, limit: usize) -> Result<i32> {
    let store = FsStore::from_config(&StoreConfig::new(data_root));

    let manifests = store.list_manifests().await.map_err(|e| anyhow::anyhow!(e))?;
    let checkpoints = store.list_checkpoints().await.map_err(|e| anyhow::anyhow!(e))?;
    let unsealed = store.unsealed_runs().await.map_err(|e| anyhow::anyhow!(e))?;
    let quarantined = store
        .list_quarantined()
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    if manifests.is_empty() {
        println!("No runs recorded under {}", data_root.display());
    } else {
        println!("Recent runs:\n");
        for manifest in manifests.iter().take(limit) {
            let jobs_failed = manifest
                .jobs
                .iter()
                .filter(|job| job.state != "completed")
                .count();
            println!(
                "  [exit {}] {} date={} jobs={} not_completed={} ended={}",
                manifest.exit_code,
                manifest.run_id,
                manifest.execution_date,
                manifest.jobs.len(),
                jobs_failed,
                manifest.ended_at.format("%Y-%m-%d %H:%M:%S UTC"),
            );
        }
    }

    if !checkpoints.is_empty() {
        println!("\nResumable checkpoints:\n");
        for checkpoint in &checkpoints {
            println!(
                "  {} page={} url={} (run {}, {})",
                checkpoint.source_id,
                checkpoint.cursor.page_index,
                checkpoint.cursor.url,
                checkpoint.run_id,
                checkpoint.updated_at.format("%Y-%m-%d %H:%M:%S UTC"),
            );
        }
    }

    if !unsealed.is_empty() {
        println!("\nUnsealed runs (recovered on next crawl):\n");
        for run in &unsealed {
            println!("  {} date={}", run.run_id, run.execution_date);
        }
    }

    println!(
        "\nTotal: {} runs, {} checkpoints, {} quarantined records",
        manifests.len(),
        checkpoints.len(),
        quarantined.len()
    );

    Ok(EXIT_OK)
}

/// Reason code counts for rejects of the last `days` days.
async fn reject_summary(
    data_root: &Path,
    source_id: Option<&str>,
    days: u32,
) -> Result<BTreeMap<String, usize>> {
    let store = FsStore::from_config(&StoreConfig::new(data_root));
    let records = store
        .list_quarantined()
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    let since = Utc::now() - TimeDelta::days(i64::from(days));
    Ok(reason_histogram(&records, source_id, since))
}

async fn cmd_inspect_rejects(data_root: &Path, source_id: Option<&str>, days: u32) -> Result<i32> {
    let reasons = reject_summary(data_root, source_id, days).await?;
    tracing::info!(
        reasons = reasons.len(),
        rejects = reasons.values().sum::<usize>(),
        days,
        "Quarantine summary"
    );
    println!("{}", serde_json::to_string_pretty(&reasons)?);
    Ok(EXIT_OK)
}

fn explain(registry: &SourceRegistry, url: &str) -> serde_json::Value {
    match registry.match_url(url) {
        Some(source) => serde_json::json!({
            "url": url,
            "matched": true,
            "source_id": source.source_id,
            "type": source.kind,
            "qps_limit": source.qps_limit,
            "concurrency_limit": source.concurrency_limit,
            "interval_secs": source.interval.as_secs(),
            "rules_path": source.rules_path,
            "max_pages": source.max_pages,
        }),
        None => serde_json::json!({"url": url, "matched": false}),
    }
}

fn cmd_explain(registry_path: &Path, url: &str) -> Result<i32> {
    let registry = load_registry(registry_path)?;
    let explanation = explain(&registry, url);
    println!("{}", serde_json::to_string_pretty(&explanation)?);
    if explanation["matched"] == true {
        Ok(EXIT_OK)
    } else {
        Ok(EXIT_FAILED)
    }
}

fn cmd_validate_sources(path: &Path) -> Result<i32> {
    let reports = validate_sources(path)
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("Failed to read source registry {}", path.display()))?;

    for report in &reports {
        let row = serde_json::json!({
            "line": report.line,
            "source_id": report.source_id,
            "enabled": report.enabled,
            "valid": report.is_valid(),
            "status": report.status(),
        });
        println!("{row}");
    }

    let invalid = reports.iter().filter(|r| !r.is_valid()).count();
    if invalid > 0 {
        tracing::warn!(invalid, rows = reports.len(), "Registry has invalid rows");
        Ok(EXIT_FAILED)
    } else {
        tracing::info!(rows = reports.len(), "Registry is valid");
        Ok(EXIT_OK)
    }
}

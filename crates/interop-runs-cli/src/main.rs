use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use interop_runs_cache::{DayCache, RunCache};
use interop_runs_core::{format_day, parse_day, FetchConfig, QuerySignature, RevisionGroup};
use interop_runs_fetch::{
    FetchOrchestrator, FetchedRuns, FreshnessPolicy, HttpRunSource, SourceConfig,
    DEFAULT_RUNS_URL, DEFAULT_TIMEOUT_SECS,
};
use serde_json::Value;
use time::{Date, OffsetDateTime};
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "interop-runs")]
#[command(about = "Fetch test runs from the results catalog and group them by revision")]
struct Cli {
    #[arg(long, default_value = ".")]
    cache_dir: PathBuf,

    /// Used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch a day range and print every revision group.
    Fetch(FetchArgs),
    /// Print the runs of the most recent aligned revision.
    Latest(LatestArgs),
    /// Show what the cache holds for a query.
    Cache(QueryArgs),
}

#[derive(Debug, Args)]
struct QueryArgs {
    #[arg(long = "product", required = true)]
    products: Vec<String>,
    #[arg(long, default_value = "experimental")]
    channel: String,
    /// Ask the catalog for runs of every product, not only aligned ones.
    #[arg(long, default_value_t = false)]
    unaligned: bool,
    #[arg(long)]
    max_per_day: Option<u32>,
}

impl QueryArgs {
    fn signature(&self) -> QuerySignature {
        QuerySignature {
            products: self.products.clone(),
            channel: self.channel.clone(),
            aligned: !self.unaligned,
            max_per_day: self.max_per_day,
        }
    }
}

#[derive(Debug, Args)]
struct SourceArgs {
    #[arg(long, default_value = DEFAULT_RUNS_URL)]
    base_url: String,
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout_secs: u64,
    #[arg(long)]
    deadline_secs: Option<u64>,
}

#[derive(Debug, Args)]
struct FetchArgs {
    #[command(flatten)]
    query: QueryArgs,
    #[command(flatten)]
    source: SourceArgs,
    /// First day, inclusive (YYYY-MM-DD). Defaults to January 1.
    #[arg(long)]
    from: Option<String>,
    /// Last day, exclusive (YYYY-MM-DD). Defaults to today.
    #[arg(long)]
    to: Option<String>,
    /// Keep only these full revisions.
    #[arg(long = "revision")]
    revisions: Vec<String>,
    /// Keep only revisions with a run for every product.
    #[arg(long, default_value_t = false)]
    aligned_only: bool,
    #[arg(long, default_value_t = false)]
    by_date: bool,
}

#[derive(Debug, Args)]
struct LatestArgs {
    #[command(flatten)]
    query: QueryArgs,
    #[command(flatten)]
    source: SourceArgs,
    #[arg(long, default_value_t = 7)]
    days: u16,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    let today = OffsetDateTime::now_utc().date();
    match cli.command {
        Command::Fetch(args) => run_fetch(&args, &cli.cache_dir, today),
        Command::Latest(args) => run_latest(&args, &cli.cache_dir, today),
        Command::Cache(args) => run_cache(&args, &cli.cache_dir),
    }
}

fn parse_optional_day(value: Option<&str>, flag: &str) -> Result<Option<Date>> {
    value.map(parse_day).transpose().with_context(|| format!("invalid --{flag}"))
}

fn fetch_range(
    config: &FetchConfig,
    source_args: &SourceArgs,
    cache_dir: &Path,
) -> Result<(FetchedRuns, RunCache)> {
    let source = HttpRunSource::new(&SourceConfig {
        base_url: source_args.base_url.clone(),
        timeout_secs: source_args.timeout_secs,
    });
    let mut orchestrator = FetchOrchestrator::new(&source, FreshnessPolicy::now());
    if let Some(secs) = source_args.deadline_secs {
        orchestrator = orchestrator.with_deadline(Duration::from_secs(secs));
    }
    let store = RunCache::new(cache_dir, &config.signature);
    let fetched = orchestrator
        .fetch_with_cache(config, &store)
        .with_context(|| format!("failed to fetch runs for {}", config.signature))?;
    Ok((fetched, store))
}

fn run_fetch(args: &FetchArgs, cache_dir: &Path, today: Date) -> Result<()> {
    let from = parse_optional_day(args.from.as_deref(), "from")?;
    let to = parse_optional_day(args.to.as_deref(), "to")?;
    let query = args.query.signature();
    let config = FetchConfig::new(
        query.products,
        query.channel,
        from,
        to,
        query.aligned,
        query.max_per_day,
        today,
    )?;

    let (fetched, store) = fetch_range(&config, &args.source, cache_dir)?;
    let mut index = fetched.index;
    if !args.revisions.is_empty() {
        let wanted = args.revisions.iter().cloned().collect::<BTreeSet<_>>();
        index = index.filter_by_revisions(&wanted);
    }
    let groups: Vec<&RevisionGroup> = if args.aligned_only {
        index.aligned(config.products()).collect()
    } else {
        index.iter().collect()
    };

    let mut output = serde_json::json!({
        "command": "fetch",
        "from": format_day(config.from),
        "to": format_day(config.to),
        "cache_path": store.path().display().to_string(),
        "stats": fetched.stats,
        "revision_count": groups.len(),
        "revisions": groups,
    });
    if args.by_date {
        let by_date = index
            .group_by_date()
            .into_iter()
            .map(|(day, groups)| {
                let revisions = groups.iter().map(|group| group.revision()).collect::<Vec<_>>();
                (day, serde_json::json!(revisions))
            })
            .collect::<serde_json::Map<_, _>>();
        output["by_date"] = Value::Object(by_date);
    }
    emit_json(output)
}

fn run_latest(args: &LatestArgs, cache_dir: &Path, today: Date) -> Result<()> {
    let to = today.next_day().context("no day follows today")?;
    let from = today - time::Duration::days(i64::from(args.days));
    let query = args.query.signature();
    let config = FetchConfig::new(
        query.products,
        query.channel,
        Some(from),
        Some(to),
        query.aligned,
        query.max_per_day,
        today,
    )?;

    let (fetched, _) = fetch_range(&config, &args.source, cache_dir)?;
    let Some(group) = fetched.index.latest_aligned(config.products()) else {
        tracing::info!(from = %format_day(from), "no aligned revision in range");
        return emit_json(serde_json::json!({
            "command": "latest",
            "revision": Value::Null,
        }));
    };

    let runs = group
        .runs_by_product(config.products())
        .context("aligned revision is missing a product run")?;
    let mut by_product = serde_json::Map::new();
    for run in runs {
        let value = serde_json::to_value(run).context("failed to serialize run")?;
        by_product.insert(run.product.clone(), value);
    }
    emit_json(serde_json::json!({
        "command": "latest",
        "revision": group.revision(),
        "earliest_start_day": format_day(group.earliest_start().date()),
        "runs": by_product,
    }))
}

fn run_cache(args: &QueryArgs, cache_dir: &Path) -> Result<()> {
    let signature = args.signature();
    signature.validate()?;
    let store = RunCache::new(cache_dir, &signature);
    let cache = DayCache::load(store.path());
    let days = cache
        .day_counts()
        .map(|(day, count)| (day.to_string(), serde_json::json!(count)))
        .collect::<serde_json::Map<_, _>>();
    emit_json(serde_json::json!({
        "command": "cache",
        "signature": signature.to_string(),
        "cache_path": store.path().display().to_string(),
        "exists": store.path().exists(),
        "day_count": cache.len(),
        "days": days,
    }))
}

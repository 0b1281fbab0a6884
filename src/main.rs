//! Reya Leaderboard Harvester
//!
//! Usage:
//!   reya-leaderboard [fetch] [--config harvest.toml] [--output out.json]
//!   reya-leaderboard verify reya_complete_leaderboard.json
//!   reya-leaderboard inspect [--base-url URL]
//!
//! Environment (also read from .env):
//!   LEADERBOARD_BASE_URL, LEADERBOARD_MAX_PAGES,
//!   LEADERBOARD_REQUEST_TIMEOUT_MS, LEADERBOARD_INTER_REQUEST_DELAY_MS,
//!   LEADERBOARD_MAX_CONSECUTIVE_STALE, LEADERBOARD_MAX_NETWORK_RETRIES,
//!   LEADERBOARD_RETRY_BACKOFF_MS
//!   RUST_LOG overrides --log-level

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use reya_leaderboard::artifact::{load_artifact, verify_artifact, write_artifact};
use reya_leaderboard::driver::sample_shapes;
use reya_leaderboard::{
    collect_leaderboard, CancelHandle, FinalDataset, HarvestConfig, HttpPageFetcher,
};

const DEFAULT_OUTPUT: &str = "reya_complete_leaderboard.json";
const WALLET_PREVIEW_CHARS: usize = 10;

#[derive(Parser, Debug)]
#[command(name = "reya-leaderboard")]
#[command(about = "Harvest the complete Reya incentives leaderboard")]
struct Cli {
    /// Log level when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    fetch: FetchArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch every page, finalize and write the artifact (default)
    Fetch(FetchArgs),

    /// Check an existing artifact
    Verify {
        /// Artifact path
        #[arg(default_value = DEFAULT_OUTPUT)]
        path: PathBuf,
    },

    /// Send one request per pagination shape and show what each returns
    Inspect(ConfigArgs),
}

#[derive(Args, Debug, Clone)]
struct FetchArgs {
    #[command(flatten)]
    settings: ConfigArgs,

    /// Artifact output path
    #[arg(long, short, default_value = DEFAULT_OUTPUT)]
    output: PathBuf,
}

#[derive(Args, Debug, Clone)]
struct ConfigArgs {
    /// TOML config file
    #[arg(long, env = "LEADERBOARD_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    base_url: Option<String>,

    #[arg(long)]
    max_pages: Option<u32>,

    /// Per-request timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Pause between requests in milliseconds
    #[arg(long)]
    delay_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Some(Commands::Verify { path }) => run_verify(&path),
        Some(Commands::Fetch(args)) => run_fetch(args).await,
        Some(Commands::Inspect(args)) => run_inspect(args).await,
        None => run_fetch(cli.fetch).await,
    }
}

fn init_tracing(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("reya_leaderboard={}", level).into()),
        )
        .init();
}

/// Config file and environment first, then explicit flags.
fn resolve_config(args: ConfigArgs) -> Result<HarvestConfig> {
    let mut config = HarvestConfig::load(args.config.as_deref())?;
    if let Some(url) = args.base_url {
        config.base_url = url;
    }
    if let Some(n) = args.max_pages {
        config.max_pages = n;
    }
    if let Some(ms) = args.timeout_ms {
        config.request_timeout_ms = ms;
    }
    if let Some(ms) = args.delay_ms {
        config.inter_request_delay_ms = ms;
    }
    config.validate()?;
    Ok(config)
}

async fn run_fetch(args: FetchArgs) -> Result<()> {
    let config = resolve_config(args.settings)?;

    info!("Starting Reya leaderboard harvest");
    info!("  Endpoint: {}", config.base_url);
    info!("  Max pages: {}", config.max_pages);
    info!("  Delay: {}ms", config.inter_request_delay_ms);
    info!("  Output: {}", args.output.display());

    let fetcher = HttpPageFetcher::new(
        &config.base_url,
        config.request_timeout(),
        &config.user_agent,
    )?;

    let (cancel, signal) = CancelHandle::new();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Interrupt received, finishing with what has been fetched");
                cancel.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C; run is not interruptible"),
        }
    });

    let run = collect_leaderboard(&fetcher, &config, signal).await?;
    write_artifact(&args.output, &run.dataset)?;

    print_summary(&run.dataset);
    if run.termination.is_clean() {
        eprintln!("Run finished: {} after {} request(s)", run.termination, run.pages);
    } else {
        eprintln!(
            "Run cut short ({}) after {} request(s); artifact holds partial results",
            run.termination, run.pages
        );
    }
    eprintln!("Saved to {}", args.output.display());
    Ok(())
}

fn run_verify(path: &Path) -> Result<()> {
    let dataset = load_artifact(path)?;
    eprintln!("Artifact:  {}", path.display());
    eprintln!("Entries:   {}", dataset.total_entries);
    eprintln!("Timestamp: {}", dataset.generated_at.format("%Y-%m-%dT%H:%M:%SZ"));
    eprintln!("Source:    {}", dataset.source);

    let diag = &dataset.diagnostics;
    eprintln!(
        "Records:   {} (declared {})",
        dataset.records.len(),
        dataset.total_entries
    );
    match (diag.min_rank, diag.max_rank) {
        (Some(lo), Some(hi)) => eprintln!("Ranks:     {} - {}", lo, hi),
        _ => eprintln!("Ranks:     (none)"),
    }
    eprintln!("Rank gaps: {}", diag.rank_gaps);
    eprintln!("Inconsistent totals: {}", diag.inconsistent_totals);

    let problems = verify_artifact(&dataset);
    if problems.is_empty() {
        eprintln!("OK");
        return Ok(());
    }
    for p in &problems {
        eprintln!("  - {}", p);
    }
    bail!("artifact failed {} check(s)", problems.len())
}

async fn run_inspect(args: ConfigArgs) -> Result<()> {
    let config = resolve_config(args)?;
    let fetcher = HttpPageFetcher::new(
        &config.base_url,
        config.request_timeout(),
        &config.user_agent,
    )?;

    eprintln!("Sampling pagination shapes against {}", config.base_url);
    for sample in sample_shapes(&fetcher, &config).await {
        let params: Vec<String> = sample
            .params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        let label = format!("{} [{}]", sample.shape, params.join("&"));
        match sample.result {
            Ok(page) => eprintln!(
                "  {:<24} {:>4} records, ranks {:?}..{:?}, after={:?} hasMore={:?}",
                label,
                page.records,
                page.first_rank,
                page.last_rank,
                page.hints.after,
                page.hints.has_more
            ),
            Err(e) => eprintln!("  {:<24} failed: {}", label, e),
        }
    }
    Ok(())
}

fn print_summary(dataset: &FinalDataset) {
    eprintln!("\n{}", "=".repeat(60));
    eprintln!("REYA LEADERBOARD SUMMARY");
    eprintln!("{}", "=".repeat(60));
    eprintln!("Total entries:   {}", dataset.total_entries);
    eprintln!(
        "Points range:    {:.2} - {:.2}",
        dataset.min_points, dataset.max_points
    );
    eprintln!("Average points:  {:.2}", dataset.avg_points);

    let diag = &dataset.diagnostics;
    if diag.rank_gaps > 0 || diag.inconsistent_totals > 0 {
        eprintln!(
            "Diagnostics:     {} rank gap(s), {} inconsistent total(s)",
            diag.rank_gaps, diag.inconsistent_totals
        );
    }

    eprintln!("\nPoints distribution:");
    let total = dataset.histogram.total().max(1) as f64;
    for (label, count) in dataset.histogram.non_empty() {
        eprintln!(
            "  {:>10}: {:>7} ({:>5.1}%)",
            label,
            count,
            count as f64 * 100.0 / total
        );
    }

    eprintln!("\nTop 3:");
    for r in dataset.records.iter().take(3) {
        print_entry(r.rank, &r.wallet_address, r.total_points);
    }

    if dataset.records.len() > 3 {
        eprintln!("\nLast 3:");
        let tail = &dataset.records[dataset.records.len() - 3..];
        for r in tail {
            print_entry(r.rank, &r.wallet_address, r.total_points);
        }
    }
    eprintln!("{}", "=".repeat(60));
}

fn print_entry(rank: u64, wallet: &str, points: f64) {
    let short: String = wallet.chars().take(WALLET_PREVIEW_CHARS).collect();
    eprintln!("  #{:<6} {}... {:.2}", rank, short, points);
}

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use feature_bank::call_log::JsonlCallLog;
use feature_bank::config::{builtin_registry, RuntimeConfig};
use feature_bank::executor::ErrorPolicy;
use feature_bank::gateway::{HttpTransport, ReplayPolicy};
use feature_bank::progress::{FanoutProgress, JsonlProgressSink, OutcomeTally, TracingProgress};
use feature_bank::runtime::Runtime;

#[derive(Parser)]
#[command(name = "feature-bank", version, about = "Feature bank processing CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process every bank in the input directory
    Run {
        /// JSON runtime config; flags override its values
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        in_dir: Option<PathBuf>,
        #[arg(long)]
        out_dir: Option<PathBuf>,
        /// LIVE, REPLAY_ONLY or REPLAY_THEN_LIVE
        #[arg(long)]
        replay_policy: Option<ReplayPolicy>,
        #[arg(long)]
        feature_parallelism: Option<usize>,
        #[arg(long)]
        feature_concurrency: Option<usize>,
        /// FAIL or SKIP_ITEM
        #[arg(long)]
        error_policy: Option<ErrorPolicy>,
        /// Write item progress events as JSON lines
        #[arg(long)]
        progress_jsonl: Option<PathBuf>,
    },
    /// List registered providers
    Providers,
    /// Rewrite a call log keeping one line per key
    LogCompact {
        #[arg(long)]
        log: PathBuf,
    },
    /// Print line and key counts of a call log
    LogStats {
        #[arg(long)]
        log: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            in_dir,
            out_dir,
            replay_policy,
            feature_parallelism,
            feature_concurrency,
            error_policy,
            progress_jsonl,
        } => {
            let mut config = match config {
                Some(path) => RuntimeConfig::load(path)?,
                None => RuntimeConfig::default(),
            };
            if let Some(dir) = in_dir {
                config.paths.in_dir = dir;
            }
            if let Some(dir) = out_dir {
                config.paths.out_dir = dir;
            }
            if let Some(policy) = replay_policy {
                config.defaults.replay_policy = policy;
            }
            if feature_parallelism.is_some() {
                config.defaults.feature_parallelism = feature_parallelism;
            }
            if feature_concurrency.is_some() {
                config.defaults.feature_concurrency = feature_concurrency;
            }
            if let Some(policy) = error_policy {
                config.defaults.error_policy = policy;
            }

            let tally = Arc::new(OutcomeTally::new());
            let mut observer = FanoutProgress::new()
                .with(Arc::new(TracingProgress))
                .with(tally.clone());
            let mut worker = None;
            if let Some(path) = progress_jsonl {
                let (sink, progress_worker) = JsonlProgressSink::new(path)?;
                observer = observer.with(Arc::new(sink));
                worker = Some(progress_worker);
            }

            let runtime = Runtime::new(config, builtin_registry(), Arc::new(HttpTransport::new()?))
                .with_observer(Arc::new(observer));
            let summary = runtime.run().await?;
            // Drops the last sink so the writer thread can finish.
            drop(runtime);
            if let Some(worker) = worker {
                worker.join()?;
            }

            for (feature_id, feature) in tally.snapshot() {
                let counts: Vec<String> = feature
                    .counts
                    .iter()
                    .map(|(outcome, n)| format!("{outcome}={n}"))
                    .collect();
                println!("{feature_id} ({}): {}", feature.plugin_name, counts.join(" "));
            }
            for report in &summary.succeeded {
                println!("[{}] Done: {}", report.bank_id, report.output_path.display());
            }
            for failure in &summary.failed {
                eprintln!("[{}] Failed: {}", failure.bank_id, failure.error);
            }
            if !summary.is_success() {
                return Err(format!("{} bank(s) failed", summary.failed.len()).into());
            }
        }
        Commands::Providers => {
            for plugin in builtin_registry().plugins() {
                println!("{}\t{}\t{}", plugin.provider(), plugin.kind(), plugin.version());
            }
        }
        Commands::LogCompact { log } => {
            let log = open_existing_log(log)?;
            let _lock = log.lock_exclusive()?;
            let stats = log.compact().await?;
            println!(
                "compacted {} lines to {}",
                stats.lines_before, stats.lines_after
            );
        }
        Commands::LogStats { log } => {
            let log = open_existing_log(log)?;
            let stats = log.stats()?;
            println!("{} lines; {} keys", stats.lines, stats.keys);
        }
    }

    Ok(())
}

fn open_existing_log(path: PathBuf) -> Result<JsonlCallLog, Box<dyn std::error::Error>> {
    if !path.is_file() {
        return Err(format!("call log not found: {}", path.display()).into());
    }
    Ok(JsonlCallLog::open(path)?)
}

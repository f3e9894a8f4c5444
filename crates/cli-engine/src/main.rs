use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use engine::{
    artifacts, ffprobe,
    planner::BitratePlanner,
    Engine, EngineConfig, FfmpegBackend, FileJobStore, JobObserver, NullObserver, Outcome, ProgressUpdate, Provider,
    TargetBudget,
};
use humansize::{format_size, DECIMAL};
use log::{error, info, warn, LevelFilter};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Compress videos to fit email attachment limits
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print what ffprobe reports about a file
    Probe { input: PathBuf },
    /// Show the encode plan for a file without encoding
    Plan {
        input: PathBuf,
        #[arg(short, long, default_value = "gmail")]
        provider: Provider,
    },
    /// Compress a file to fit the provider's attachment limit
    Compress {
        input: PathBuf,
        #[arg(short, long, default_value = "gmail")]
        provider: Provider,
        /// Copy the result here and drop the work-dir copy
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List jobs in the state directory
    Jobs,
    /// Delete work-dir artifacts no job owns
    Sweep,
}

/// Logs progress in 5% steps and hands terminal outcomes to `main`
struct CliObserver {
    last_logged: Mutex<f64>,
    done_tx: mpsc::UnboundedSender<(Uuid, Outcome)>,
}

impl JobObserver for CliObserver {
    fn on_progress(&self, job_id: Uuid, update: &ProgressUpdate) {
        let mut last = match self.last_logged.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if update.percent >= *last + 5.0 || update.percent >= 100.0 {
            info!("Job {}: {:5.1}% {}", job_id, update.percent, update.message);
            *last = update.percent;
        }
    }

    fn on_terminal(&self, job_id: Uuid, outcome: &Outcome) {
        let _ = self.done_tx.send((job_id, outcome.clone()));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logger - use RUST_LOG env var or default to info level
    let mut logger = env_logger::Builder::from_default_env();
    logger.format_timestamp_secs();
    if args.verbose {
        logger.filter_level(LevelFilter::Debug);
    } else if std::env::var_os("RUST_LOG").is_none() {
        logger.filter_level(LevelFilter::Info);
    }
    logger.init();

    // Load configuration
    let cfg = EngineConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    info!("MailSized engine starting");
    info!("  ffmpeg: {}", cfg.ffmpeg_bin.display());
    info!("  ffprobe: {}", cfg.ffprobe_bin.display());
    info!("  Work dir: {}", cfg.work_dir.display());
    info!(
        "  Tolerance: {:.0}%, up to {} attempt(s)",
        cfg.enforcement.tolerance * 100.0,
        cfg.enforcement.max_attempts
    );

    match args.command {
        Command::Probe { input } => {
            let media = ffprobe::probe(&cfg, &input)
                .await
                .with_context(|| format!("Failed to probe: {}", input.display()))?;
            println!("{}", serde_json::to_string_pretty(&media)?);
        }
        Command::Plan { input, provider } => {
            let media = ffprobe::probe(&cfg, &input)
                .await
                .with_context(|| format!("Failed to probe: {}", input.display()))?;
            let budget = TargetBudget::for_provider(provider);
            let plan = BitratePlanner::new(cfg.planner.clone()).plan(&media, &budget);
            println!("{}", serde_json::to_string_pretty(&plan)?);
            println!(
                "{} ({}) -> {} cap {}",
                input.display(),
                format_size(media.size_bytes, DECIMAL),
                provider,
                format_size(budget.cap_bytes, DECIMAL)
            );
        }
        Command::Compress { input, provider, output } => {
            compress(cfg, &input, provider, output.as_deref()).await?;
        }
        Command::Jobs => {
            let store = open_store(&cfg).await?;
            let backend = Arc::new(FfmpegBackend::new(&cfg));
            let engine = Engine::new(cfg, store, backend, Arc::new(NullObserver));
            for job in engine.jobs().await? {
                println!(
                    "{}  {:<11} {:5.1}%  {}  {}",
                    job.id,
                    format!("{:?}", job.status),
                    job.progress_percent,
                    job.budget.provider,
                    job.source.path.display()
                );
            }
        }
        Command::Sweep => {
            let store = open_store(&cfg).await?;
            let backend = Arc::new(FfmpegBackend::new(&cfg));
            let engine = Engine::new(cfg, store, backend, Arc::new(NullObserver));
            let recovered = engine
                .recover_interrupted()
                .await
                .context("Failed to recover interrupted jobs")?;
            if recovered > 0 {
                println!("Marked {} interrupted job(s) as failed", recovered);
            }
            let removed = engine.sweep_orphans().await.context("Failed to sweep work dir")?;
            println!("Removed {} orphaned artifact(s)", removed);
        }
    }

    Ok(())
}

async fn open_store(cfg: &EngineConfig) -> Result<Arc<FileJobStore>> {
    let dir = cfg.work_dir.join("jobs");
    let store = FileJobStore::open(&dir)
        .await
        .with_context(|| format!("Failed to open job state dir: {}", dir.display()))?;
    Ok(Arc::new(store))
}

async fn compress(cfg: EngineConfig, input: &Path, provider: Provider, output: Option<&Path>) -> Result<()> {
    let backend = FfmpegBackend::new(&cfg);
    backend.verify(&cfg).await.context("FFmpeg is not usable")?;

    let store = open_store(&cfg).await?;
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let observer = CliObserver {
        last_logged: Mutex::new(f64::NEG_INFINITY),
        done_tx,
    };
    let engine = Engine::new(cfg, store, Arc::new(backend), Arc::new(observer));

    // Recovery on startup: fail jobs an earlier run left mid-encode, then
    // clear leftovers nobody owns
    match engine.recover_interrupted().await {
        Ok(0) => {}
        Ok(n) => warn!("Recovered {} interrupted job(s)", n),
        Err(e) => warn!("Interrupted job recovery failed: {}", e),
    }
    info!("🔄 Checking for orphaned artifacts...");
    match engine.sweep_orphans().await {
        Ok(0) => info!("✅ No orphaned artifacts found"),
        Ok(n) => info!("✅ Removed {} orphaned artifact(s)", n),
        Err(e) => warn!("Orphan sweep failed: {}", e),
    }

    let job = engine
        .probe_and_admit(input, provider)
        .await
        .with_context(|| format!("Failed to admit: {}", input.display()))?;
    info!("Created job {} for: {} (tier {})", job.id, input.display(), job.tier);

    engine.start(job.id).await.context("Failed to start job")?;

    // Recovered jobs report here too; wait for ours
    let (job_id, outcome) = loop {
        let (id, outcome) = done_rx
            .recv()
            .await
            .ok_or_else(|| anyhow!("Engine stopped before the job finished"))?;
        if id == job.id {
            break (id, outcome);
        }
    };

    let result = match outcome {
        Outcome::Done { output_path, size_bytes, attempts, download_expiry } => {
            let saved = job.source.size_bytes.saturating_sub(size_bytes);
            info!(
                "✅ Job {} complete: {} -> {} (saved {}, {} attempt(s))",
                job_id,
                format_size(job.source.size_bytes, DECIMAL),
                format_size(size_bytes, DECIMAL),
                format_size(saved, DECIMAL),
                attempts
            );

            match output {
                Some(dest) => {
                    tokio::fs::copy(&output_path, dest)
                        .await
                        .with_context(|| format!("Failed to copy result to: {}", dest.display()))?;
                    engine.cleanup(job_id).await.context("Failed to clean up job")?;
                    println!("{}", dest.display());
                }
                None => {
                    println!("{}", output_path.display());
                    if let Some(expiry) = download_expiry {
                        let left = artifacts::delay_until(expiry, chrono::Utc::now());
                        info!("Available for {} min (until {})", left.as_secs() / 60, expiry.to_rfc3339());
                    }
                }
            }
            Ok(())
        }
        Outcome::Error { category, message } => {
            error!("❌ Job {} failed ({}): {}", job_id, category, message);
            Err(anyhow!("compression failed: {}", message))
        }
    };

    engine.shutdown().await;
    result
}

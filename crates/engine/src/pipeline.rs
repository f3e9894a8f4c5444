//! Job orchestration: admission, one task per started job, progress
//! forwarding into the store and observer, and artifact cleanup.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use chrono::{DateTime, Utc};
use humansize::{format_size, DECIMAL};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use uuid::Uuid;
use crate::admission;
use crate::artifacts;
use crate::budget::{Provider, TargetBudget};
use crate::config::EngineConfig;
use crate::encoder::EncoderBackend;
use crate::enforce::SizeEnforcer;
use crate::error::{EngineError, EngineResult};
use crate::ffprobe::{self, SourceMedia};
use crate::job::{EncodeJob, JobStatus};
use crate::planner::{BitratePlanner, EncodePlan};
use crate::progress::{ProgressSink, ProgressUpdate};
use crate::store::JobStore;

/// Failure category for jobs a previous process left mid-encode
pub const INTERRUPTED: &str = "interrupted";

/// How a job ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    Done {
        output_path: PathBuf,
        size_bytes: u64,
        attempts: u32,
        download_expiry: Option<DateTime<Utc>>,
    },
    Error {
        /// Terse category, e.g. "budget_unmet"
        category: String,
        message: String,
    },
}

/// Receives job updates. `on_terminal` is called exactly once per started job.
pub trait JobObserver: Send + Sync {
    fn on_progress(&self, job_id: Uuid, update: &ProgressUpdate);
    fn on_terminal(&self, job_id: Uuid, outcome: &Outcome);
}

pub struct NullObserver;

impl JobObserver for NullObserver {
    fn on_progress(&self, _job_id: Uuid, _update: &ProgressUpdate) {}
    fn on_terminal(&self, _job_id: Uuid, _outcome: &Outcome) {}
}

enum JobEvent {
    Progress(ProgressUpdate),
    Attempt(u32, EncodePlan),
}

/// Bridges the synchronous progress callback onto the job's event channel
struct ChannelSink {
    tx: mpsc::UnboundedSender<JobEvent>,
}

impl ProgressSink for ChannelSink {
    fn report(&self, percent: f64, message: &str) {
        // The forwarder only goes away once the job task is done with us
        let _ = self.tx.send(JobEvent::Progress(ProgressUpdate {
            percent,
            message: message.to_string(),
        }));
    }
}

struct Shared {
    cfg: EngineConfig,
    planner: BitratePlanner,
    store: Arc<dyn JobStore>,
    backend: Arc<dyn EncoderBackend>,
    observer: Arc<dyn JobObserver>,
    /// Jobs with a live task in `Engine::tasks`
    running: Mutex<HashSet<Uuid>>,
    cleanups: Mutex<JoinSet<()>>,
}

pub struct Engine {
    shared: Arc<Shared>,
    accepting: AtomicBool,
    tasks: Mutex<JoinSet<()>>,
}

impl Engine {
    pub fn new(
        cfg: EngineConfig,
        store: Arc<dyn JobStore>,
        backend: Arc<dyn EncoderBackend>,
        observer: Arc<dyn JobObserver>,
    ) -> Self {
        let planner = BitratePlanner::new(cfg.planner.clone());
        Self {
            shared: Arc::new(Shared {
                cfg,
                planner,
                store,
                backend,
                observer,
                running: Mutex::new(HashSet::new()),
                cleanups: Mutex::new(JoinSet::new()),
            }),
            accepting: AtomicBool::new(true),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.cfg
    }

    fn ensure_accepting(&self) -> EngineResult<()> {
        if self.accepting.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::Rejected("Service is shutting down".to_string()))
        }
    }

    /// Validate a probed upload and store it as a Queued job
    pub async fn admit(&self, source: SourceMedia, budget: TargetBudget) -> EngineResult<EncodeJob> {
        self.ensure_accepting()?;
        let tier = admission::admit(&source, &self.shared.cfg.admission)?;
        let job = EncodeJob::new(source, budget, tier, self.shared.cfg.enforcement.max_attempts);
        self.shared.store.put(&job).await?;
        info!(
            "Job {}: queued {} ({}, {:.1}s, tier {}) for {} ({} cap)",
            job.id,
            job.source.path.display(),
            format_size(job.source.size_bytes, DECIMAL),
            job.source.duration_seconds,
            job.tier,
            job.budget.provider,
            format_size(job.budget.cap_bytes, DECIMAL)
        );
        Ok(job)
    }

    /// Probe `path` then admit it against the provider's attachment limit
    pub async fn probe_and_admit(&self, path: &Path, provider: Provider) -> EngineResult<EncodeJob> {
        self.ensure_accepting()?;
        admission::check_extension(path, &self.shared.cfg.admission)?;
        let source = ffprobe::probe(&self.shared.cfg, path).await?;
        self.admit(source, TargetBudget::for_provider(provider)).await
    }

    /// Payment confirmed: move the job to Processing and run it in the background
    pub async fn start(&self, job_id: Uuid) -> EngineResult<()> {
        self.ensure_accepting()?;
        // Held from the status check to the spawn so one job never gets two tasks
        let mut tasks = self.tasks.lock().await;
        let mut job = self
            .shared
            .store
            .get(job_id)
            .await?
            .ok_or(EngineError::JobNotFound(job_id))?;
        job.begin_processing()?;
        self.shared.store.put(&job).await?;

        // Reap finished jobs so the set does not grow without bound
        while let Some(res) = tasks.try_join_next() {
            if let Err(e) = res {
                error!("Job task ended abnormally: {}", e);
            }
        }
        self.shared.running.lock().await.insert(job_id);
        tasks.spawn(supervise(self.shared.clone(), job));
        Ok(())
    }

    pub async fn fetch(&self, job_id: Uuid) -> EngineResult<Option<EncodeJob>> {
        self.shared.store.get(job_id).await
    }

    pub async fn jobs(&self) -> EngineResult<Vec<EncodeJob>> {
        self.shared.store.list().await
    }

    /// Delete a job's artifacts and forget it. Running jobs are refused.
    pub async fn cleanup(&self, job_id: Uuid) -> EngineResult<()> {
        let _tasks = self.tasks.lock().await;
        let job = self
            .shared
            .store
            .get(job_id)
            .await?
            .ok_or(EngineError::JobNotFound(job_id))?;
        if matches!(
            job.status,
            JobStatus::Processing | JobStatus::Compressing | JobStatus::Finalizing
        ) {
            return Err(EngineError::Rejected(format!("Job {} is still processing", job_id)));
        }
        cleanup_job(&self.shared, job_id).await?;
        Ok(())
    }

    /// Fail jobs stored mid-run that have no task in this engine, such as
    /// those of a killed process, and delete their partial outputs.
    /// Returns how many jobs were recovered.
    pub async fn recover_interrupted(&self) -> EngineResult<usize> {
        let _tasks = self.tasks.lock().await;
        let running = self.shared.running.lock().await.clone();

        let mut recovered = 0;
        for mut job in self.shared.store.list().await? {
            let stuck_in = job.status;
            if !matches!(stuck_in, JobStatus::Processing | JobStatus::Compressing | JobStatus::Finalizing)
                || running.contains(&job.id)
            {
                continue;
            }

            warn!("🔄 Job {} was left in {:?}, marking it interrupted", job.id, stuck_in);
            job.fail(INTERRUPTED)?;
            self.shared.store.put(&job).await?;
            let removed = artifacts::remove_encode_artifacts(&self.shared.cfg.work_dir, job.id).await?;
            info!("Job {}: recovered, {} partial file(s) removed", job.id, removed);

            self.shared.observer.on_terminal(
                job.id,
                &Outcome::Error {
                    category: INTERRUPTED.to_string(),
                    message: format!("job was interrupted while {:?}", stuck_in),
                },
            );
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Remove work-dir artifacts that no stored job owns
    pub async fn sweep_orphans(&self) -> EngineResult<usize> {
        let live: HashSet<Uuid> = self.shared.store.list().await?.iter().map(|j| j.id).collect();
        artifacts::sweep_orphans(&self.shared.cfg.work_dir, &live).await
    }

    /// Stop admitting, wait for running jobs, drop pending expiry cleanups
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);

        let mut tasks = self.tasks.lock().await;
        let running = tasks.len();
        if running > 0 {
            info!("Waiting for {} job task(s) to finish", running);
        }
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!("Job task ended abnormally: {}", e);
            }
        }

        self.shared.cleanups.lock().await.shutdown().await;
        info!("Engine stopped");
    }
}

/// Runs the job on its own task so a panic still ends it in Error
async fn supervise(shared: Arc<Shared>, job: EncodeJob) {
    let job_id = job.id;
    if let Err(e) = tokio::spawn(run_job(shared.clone(), job)).await {
        error!("Job {}: task ended abnormally: {}", job_id, e);
        fail_abandoned(&shared, job_id, e.to_string()).await;
    }
    shared.running.lock().await.remove(&job_id);
}

async fn fail_abandoned(shared: &Shared, job_id: Uuid, message: String) {
    let mut job = match shared.store.get(job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => return,
        Err(e) => {
            error!("Job {}: cannot load abandoned job: {}", job_id, e);
            return;
        }
    };
    if job.is_terminal() {
        return;
    }
    let err = EngineError::Internal(message);
    let category = err.category();
    if let Err(e) = job.fail(category) {
        warn!("Job {}: could not record failure: {}", job_id, e);
        return;
    }
    if let Err(e) = shared.store.put(&job).await {
        error!("Job {}: failed to save final state: {}", job_id, e);
    }
    shared.observer.on_terminal(
        job_id,
        &Outcome::Error {
            category: category.to_string(),
            message: err.to_string(),
        },
    );
}

async fn run_job(shared: Arc<Shared>, mut job: EncodeJob) {
    let job_id = job.id;
    info!("Job {}: processing {}", job_id, job.source.path.display());

    let outcome = match drive(&shared, &mut job).await {
        Ok(()) => Outcome::Done {
            output_path: job.output_path.clone().unwrap_or_default(),
            size_bytes: job.output_bytes.unwrap_or(0),
            attempts: job.attempt_count,
            download_expiry: job.download_expiry,
        },
        Err(e) => {
            error!("❌ Job {} failed: {}", job_id, e);
            if !job.is_terminal() {
                if let Err(te) = job.fail(e.category()) {
                    warn!("Job {}: could not record failure: {}", job_id, te);
                }
            }
            if let Err(ce) = artifacts::remove_encode_artifacts(&shared.cfg.work_dir, job_id).await {
                warn!("Job {}: {}", job_id, ce);
            }
            Outcome::Error {
                category: job
                    .last_error
                    .clone()
                    .unwrap_or_else(|| e.category().to_string()),
                message: e.to_string(),
            }
        }
    };

    if let Err(e) = shared.store.put(&job).await {
        error!("Job {}: failed to save final state: {}", job_id, e);
    }
    shared.observer.on_terminal(job_id, &outcome);

    if let (true, Some(expiry)) = (shared.cfg.auto_cleanup, job.download_expiry) {
        if job.status == JobStatus::Done {
            schedule_cleanup(&shared, job_id, expiry).await;
        }
    }
}

/// Processing through Done; errors leave the job for `run_job` to fail
async fn drive(shared: &Arc<Shared>, job: &mut EncodeJob) -> EngineResult<()> {
    let cfg = &shared.cfg;

    let plan = shared.planner.plan(&job.source, &job.budget);
    job.begin_compressing(plan)?;
    shared.store.put(job).await?;

    tokio::fs::create_dir_all(&cfg.work_dir)
        .await
        .map_err(|e| EngineError::resource(format!("failed to create work dir {}", cfg.work_dir.display()), e))?;
    let output_path = artifacts::output_path_for(&cfg.work_dir, job.id);

    let (tx, rx) = mpsc::unbounded_channel();
    let forwarder = tokio::spawn(forward_events(shared.clone(), job.clone(), rx));

    // Its own task, so an encoder panic drops the senders and surfaces here
    let enforcement = tokio::spawn({
        let shared = shared.clone();
        let source = job.source.clone();
        let budget = job.budget;
        async move {
            let sink = ChannelSink { tx: tx.clone() };
            let hook = move |attempt: u32, plan: &EncodePlan| {
                let _ = tx.send(JobEvent::Attempt(attempt, *plan));
            };
            SizeEnforcer::new(&shared.cfg, &shared.planner, shared.backend.as_ref())
                .with_attempt_hook(&hook)
                .enforce(plan, &source, &budget, &output_path, &sink)
                .await
        }
    });
    let result = enforcement
        .await
        .map_err(|e| EngineError::Internal(format!("encode task failed: {}", e)));

    // Both senders are gone, so the forwarder drains and hands the job back
    *job = forwarder.await.map_err(|e| {
        EngineError::resource("progress forwarder failed", std::io::Error::other(e))
    })?;
    let done = result??;

    job.begin_finalizing(cfg.download_ttl_secs)?;
    shared.store.put(job).await?;

    info!(
        "✅ Job {} done: {} -> {} ({} attempt(s), {:?} at {} kbps)",
        job.id,
        format_size(job.source.size_bytes, DECIMAL),
        format_size(done.size_bytes, DECIMAL),
        done.attempts,
        done.plan.strategy,
        done.plan.video_bitrate_bps / 1000
    );
    job.complete(done.output_path, done.size_bytes)?;
    Ok(())
}

async fn forward_events(
    shared: Arc<Shared>,
    mut job: EncodeJob,
    mut rx: mpsc::UnboundedReceiver<JobEvent>,
) -> EncodeJob {
    while let Some(event) = rx.recv().await {
        match event {
            JobEvent::Progress(update) => {
                let Some(percent) = job.report_progress(update.percent) else {
                    continue;
                };
                if let Err(e) = shared.store.put(&job).await {
                    warn!("Job {}: failed to save progress: {}", job.id, e);
                }
                shared.observer.on_progress(
                    job.id,
                    &ProgressUpdate {
                        percent,
                        message: update.message,
                    },
                );
            }
            JobEvent::Attempt(attempt, plan) => {
                debug!("Job {}: attempt {} at {} kbps", job.id, attempt, plan.video_bitrate_bps / 1000);
                if let Err(e) = job.record_attempt(attempt, plan) {
                    warn!("Job {}: {}", job.id, e);
                    continue;
                }
                if let Err(e) = shared.store.put(&job).await {
                    warn!("Job {}: failed to save attempt: {}", job.id, e);
                }
            }
        }
    }
    job
}

async fn schedule_cleanup(shared: &Arc<Shared>, job_id: Uuid, expiry: DateTime<Utc>) {
    let delay = artifacts::delay_until(expiry, Utc::now());
    debug!("Job {}: cleanup scheduled in {}s", job_id, delay.as_secs());

    let task_shared = shared.clone();
    let mut cleanups = shared.cleanups.lock().await;
    while let Some(res) = cleanups.try_join_next() {
        if let Err(e) = res {
            error!("Cleanup task ended abnormally: {}", e);
        }
    }
    cleanups.spawn(async move {
        tokio::time::sleep(delay).await;
        if let Err(e) = cleanup_job(&task_shared, job_id).await {
            warn!("Job {}: expiry cleanup failed: {}", job_id, e);
        }
    });
}

async fn cleanup_job(shared: &Shared, job_id: Uuid) -> EngineResult<bool> {
    let Some(job) = shared.store.get(job_id).await? else {
        return Ok(false);
    };
    let removed = artifacts::remove_job_artifacts(&job, &shared.cfg.work_dir).await?;
    shared.store.delete(job_id).await?;
    info!("Job {}: cleaned up ({} file(s) removed)", job_id, removed);
    Ok(true)
}

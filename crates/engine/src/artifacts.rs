use std::collections::HashSet;
use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use humansize::{format_size, DECIMAL};
use log::{debug, info, warn};
use uuid::Uuid;
use crate::error::{EngineError, EngineResult};
use crate::job::EncodeJob;

const OUTPUT_PREFIX: &str = "compressed_";

/// Where a job's compressed output lives
pub fn output_path_for(work_dir: &Path, job_id: Uuid) -> PathBuf {
    work_dir.join(format!("{}{}.mp4", OUTPUT_PREFIX, job_id))
}

/// Time left until `expiry`, zero if already passed
pub fn delay_until(expiry: DateTime<Utc>, now: DateTime<Utc>) -> std::time::Duration {
    (expiry - now).to_std().unwrap_or_default()
}

async fn remove_if_present(path: &Path) -> EngineResult<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(EngineError::resource(format!("failed to delete {}", path.display()), e)),
    }
}

/// Delete a job's output, and its source when the upload was staged in
/// `work_dir`. Sources elsewhere belong to the caller and are left alone.
pub async fn remove_job_artifacts(job: &EncodeJob, work_dir: &Path) -> EngineResult<usize> {
    let mut removed = 0;

    let output = job
        .output_path
        .clone()
        .unwrap_or_else(|| output_path_for(work_dir, job.id));
    if remove_if_present(&output).await? {
        debug!("Job {}: deleted output {}", job.id, output.display());
        removed += 1;
    }

    if job.source.path.starts_with(work_dir) && remove_if_present(&job.source.path).await? {
        debug!("Job {}: deleted staged upload {}", job.id, job.source.path.display());
        removed += 1;
    }

    Ok(removed)
}

/// Job id embedded in an artifact name, if any
fn owner_of(file_name: &str) -> Option<Uuid> {
    let rest = file_name.strip_prefix(OUTPUT_PREFIX)?;
    let id = rest.get(..36)?;
    Uuid::parse_str(id).ok()
}

fn is_artifact(file_name: &str) -> bool {
    file_name.starts_with(OUTPUT_PREFIX) || file_name.contains(".passlog")
}

/// Artifact files directly under `work_dir`: path, owning job, size
async fn scan_artifacts(work_dir: &Path) -> EngineResult<Vec<(PathBuf, Option<Uuid>, u64)>> {
    if !work_dir.exists() {
        return Ok(Vec::new());
    }

    tokio::task::spawn_blocking({
        let root = work_dir.to_path_buf();
        move || {
            let mut found = Vec::new();
            for entry in walkdir::WalkDir::new(&root)
                .max_depth(1)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                if let Some(name) = entry.file_name().to_str() {
                    if is_artifact(name) {
                        found.push((entry.path().to_path_buf(), owner_of(name), entry.metadata().map(|m| m.len()).unwrap_or(0)));
                    }
                }
            }
            found
        }
    })
    .await
    .map_err(|e| EngineError::resource("artifact scan task failed", std::io::Error::other(e)))
}

/// Delete the output and pass logs of one job, keeping its source.
/// Returns the number of files removed.
pub async fn remove_encode_artifacts(work_dir: &Path, job_id: Uuid) -> EngineResult<usize> {
    let mut removed = 0;
    for (path, owner, _) in scan_artifacts(work_dir).await? {
        if owner == Some(job_id) && remove_if_present(&path).await? {
            debug!("Job {}: deleted {}", job_id, path.display());
            removed += 1;
        }
    }
    Ok(removed)
}

/// Delete outputs and pass logs in `work_dir` that no known job owns.
/// Returns the number of files removed.
pub async fn sweep_orphans(work_dir: &Path, live_jobs: &HashSet<Uuid>) -> EngineResult<usize> {
    let mut removed = 0;
    let mut reclaimed = 0u64;
    for (path, owner, len) in scan_artifacts(work_dir).await? {
        if owner.map(|id| live_jobs.contains(&id)).unwrap_or(false) {
            continue;
        }
        match remove_if_present(&path).await {
            Ok(true) => {
                info!("🗑️  Deleted orphaned artifact: {}", path.display());
                removed += 1;
                reclaimed += len;
            }
            Ok(false) => {}
            Err(e) => warn!("{}", e),
        }
    }

    if removed > 0 {
        info!("Cleaned up {} orphaned artifact(s), {} reclaimed", removed, format_size(reclaimed, DECIMAL));
    } else {
        debug!("No orphaned artifacts in {}", work_dir.display());
    }
    Ok(removed)
}

use std::path::PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::budget::TargetBudget;
use crate::error::{EngineError, EngineResult};
use crate::ffprobe::SourceMedia;
use crate::planner::EncodePlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Admitted, waiting for payment confirmation
    Queued,
    Processing,
    Compressing,
    Finalizing,
    Done,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }

    fn can_move_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Queued, Processing)
            | (Processing, Compressing)
            | (Compressing, Finalizing)
            | (Finalizing, Done) => true,
            (from, Error) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// One upload moving through compression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodeJob {
    pub id: Uuid,
    pub source: SourceMedia,
    pub budget: TargetBudget,
    /// Upload tier 1-3 assigned at admission
    pub tier: u8,
    pub current_plan: Option<EncodePlan>,
    pub status: JobStatus,
    pub progress_percent: f64,
    pub output_path: Option<PathBuf>,
    pub output_bytes: Option<u64>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub download_expiry: Option<DateTime<Utc>>,
}

impl EncodeJob {
    pub fn new(source: SourceMedia, budget: TargetBudget, tier: u8, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            source,
            budget,
            tier,
            current_plan: None,
            status: JobStatus::Queued,
            progress_percent: 0.0,
            output_path: None,
            output_bytes: None,
            attempt_count: 0,
            max_attempts,
            last_error: None,
            created_at: now,
            updated_at: now,
            download_expiry: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn transition(&mut self, next: JobStatus) -> EngineResult<()> {
        if !self.status.can_move_to(next) {
            return Err(EngineError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Payment confirmed
    pub fn begin_processing(&mut self) -> EngineResult<()> {
        self.transition(JobStatus::Processing)
    }

    pub fn begin_compressing(&mut self, plan: EncodePlan) -> EngineResult<()> {
        self.transition(JobStatus::Compressing)?;
        self.current_plan = Some(plan);
        Ok(())
    }

    /// Output verified; the download window opens now
    pub fn begin_finalizing(&mut self, download_ttl_secs: u64) -> EngineResult<()> {
        let expiry = i64::try_from(download_ttl_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .ok_or(EngineError::ExpiryOutOfRange { ttl_secs: download_ttl_secs })?;
        self.transition(JobStatus::Finalizing)?;
        self.download_expiry = Some(expiry);
        Ok(())
    }

    pub fn complete(&mut self, output_path: PathBuf, output_bytes: u64) -> EngineResult<()> {
        self.transition(JobStatus::Done)?;
        self.output_path = Some(output_path);
        self.output_bytes = Some(output_bytes);
        self.progress_percent = 100.0;
        Ok(())
    }

    /// Record a failure category; the output path never survives into Error
    pub fn fail(&mut self, category: &str) -> EngineResult<()> {
        self.transition(JobStatus::Error)?;
        self.last_error = Some(category.to_string());
        self.output_path = None;
        self.output_bytes = None;
        Ok(())
    }

    /// Start of enforcement attempt `attempt` (1-based) with `plan`
    pub fn record_attempt(&mut self, attempt: u32, plan: EncodePlan) -> EngineResult<()> {
        if attempt > self.max_attempts {
            self.fail("budget_unmet")?;
            return Err(EngineError::BudgetUnmet {
                attempts: self.attempt_count,
                last_size: 0,
                cap: self.budget.cap_bytes,
            });
        }
        self.attempt_count = attempt;
        self.current_plan = Some(plan);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Apply a progress value; returns the stored value if it changed.
    /// Values are clamped to [0, 100] and never move backwards.
    pub fn report_progress(&mut self, percent: f64) -> Option<f64> {
        if self.is_terminal() || !percent.is_finite() {
            return None;
        }
        let value = percent.clamp(0.0, 100.0);
        if value <= self.progress_percent {
            return None;
        }
        self.progress_percent = value;
        self.updated_at = Utc::now();
        Some(value)
    }

    /// True while a Done job's download window is open
    pub fn download_available(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Done
            && self.output_path.is_some()
            && self.download_expiry.map(|expiry| now < expiry).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::Provider;
    use crate::planner::Strategy;
    use proptest::prelude::*;

    fn job() -> EncodeJob {
        let source = SourceMedia {
            path: PathBuf::from("/tmp/upload_1.mp4"),
            size_bytes: 1_500_000_000,
            duration_seconds: 600.0,
            width: 1920,
            height: 1080,
        };
        EncodeJob::new(source, TargetBudget::for_provider(Provider::Gmail), 2, 3)
    }

    fn plan() -> EncodePlan {
        EncodePlan {
            video_bitrate_bps: 233_000,
            audio_bitrate_bps: 80_000,
            output_width: 852,
            output_height: 480,
            strategy: Strategy::TwoPass,
        }
    }

    #[test]
    fn test_happy_path() {
        let mut j = job();
        assert_eq!(j.status, JobStatus::Queued);

        j.begin_processing().unwrap();
        j.begin_compressing(plan()).unwrap();
        j.record_attempt(1, plan()).unwrap();
        j.begin_finalizing(30 * 60).unwrap();
        assert!(j.output_path.is_none());

        j.complete(PathBuf::from("/work/compressed.mp4"), 24_000_000).unwrap();
        assert_eq!(j.status, JobStatus::Done);
        assert_eq!(j.progress_percent, 100.0);
        assert_eq!(j.attempt_count, 1);
        assert!(j.download_available(Utc::now()));
        assert!(!j.download_available(Utc::now() + chrono::Duration::minutes(31)));
    }

    #[test]
    fn test_unrepresentable_expiry_leaves_job_failable() {
        let mut j = job();
        j.begin_processing().unwrap();
        j.begin_compressing(plan()).unwrap();
        let err = j.begin_finalizing(u64::MAX).unwrap_err();
        assert!(matches!(err, EngineError::ExpiryOutOfRange { ttl_secs: u64::MAX }));
        assert_eq!(err.category(), "internal_error");
        let err = j.begin_finalizing(i64::MAX as u64).unwrap_err();
        assert!(matches!(err, EngineError::ExpiryOutOfRange { .. }));
        assert_eq!(j.status, JobStatus::Compressing);
        assert!(j.download_expiry.is_none());

        j.fail(err.category()).unwrap();
        assert_eq!(j.status, JobStatus::Error);
    }

    #[test]
    fn test_illegal_transitions() {
        let mut j = job();
        let err = j.begin_compressing(plan()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition { from: JobStatus::Queued, to: JobStatus::Compressing }
        ));

        let err = j.complete(PathBuf::from("/x.mp4"), 1).unwrap_err();
        assert_eq!(err.category(), "internal_error");

        j.fail("probe_failed").unwrap();
        assert!(j.begin_processing().is_err());
        assert!(j.fail("encode_failed").is_err());
        assert_eq!(j.last_error.as_deref(), Some("probe_failed"));
    }

    #[test]
    fn test_error_from_any_live_state() {
        for steps in 0..4 {
            let mut j = job();
            if steps > 0 { j.begin_processing().unwrap(); }
            if steps > 1 { j.begin_compressing(plan()).unwrap(); }
            if steps > 2 { j.begin_finalizing(30 * 60).unwrap(); }
            j.fail("resource_error").unwrap();
            assert_eq!(j.status, JobStatus::Error);
            assert!(j.output_path.is_none());
            assert!(!j.download_available(Utc::now()));
        }
    }

    #[test]
    fn test_attempt_limit() {
        let mut j = job();
        j.begin_processing().unwrap();
        j.begin_compressing(plan()).unwrap();
        for attempt in 1..=3 {
            j.record_attempt(attempt, plan()).unwrap();
        }
        let err = j.record_attempt(4, plan()).unwrap_err();
        assert_eq!(err.category(), "budget_unmet");
        assert_eq!(j.status, JobStatus::Error);
        assert_eq!(j.attempt_count, 3);
    }

    #[test]
    fn test_serde_roundtrip_keeps_status() {
        let mut j = job();
        j.begin_processing().unwrap();
        let json = serde_json::to_string(&j).unwrap();
        let back: EncodeJob = serde_json::from_str(&json).unwrap();
        assert_eq!(back, j);
    }

    proptest! {
        #[test]
        fn test_progress_never_regresses(values in prop::collection::vec(-20.0f64..140.0, 1..64)) {
            let mut j = job();
            let mut last = j.progress_percent;
            for v in values {
                j.report_progress(v);
                prop_assert!(j.progress_percent >= last);
                prop_assert!((0.0..=100.0).contains(&j.progress_percent));
                last = j.progress_percent;
            }
        }
    }
}

//! Size enforcement: encode, measure, and retry at a lower bitrate until the
//! output fits the budget or the attempt limit is reached.

use std::path::{Path, PathBuf};
use std::time::Duration;
use log::{info, warn};
use crate::budget::TargetBudget;
use crate::config::EngineConfig;
use crate::encoder::EncoderBackend;
use crate::error::{EngineError, EngineResult};
use crate::ffprobe::SourceMedia;
use crate::planner::{BitratePlanner, EncodePlan, Strategy};
use crate::progress::{MonotonicSink, PassWindow, ProgressSink, WindowedSink};
use crate::session::{EncodeSession, SESSION_PROGRESS_CEILING};

/// Share of the progress range given to the first attempt
const FIRST_ATTEMPT_END: f64 = 90.0;

/// Verified output of the enforcement loop
#[derive(Debug, Clone, PartialEq)]
pub struct FinalResult {
    pub output_path: PathBuf,
    pub size_bytes: u64,
    pub attempts: u32,
    pub plan: EncodePlan,
}

/// Called before each attempt with its 1-based number and plan
pub type AttemptHook<'a> = &'a (dyn Fn(u32, &EncodePlan) + Send + Sync);

pub struct SizeEnforcer<'a> {
    cfg: &'a EngineConfig,
    planner: &'a BitratePlanner,
    backend: &'a dyn EncoderBackend,
    on_attempt: Option<AttemptHook<'a>>,
}

impl<'a> SizeEnforcer<'a> {
    pub fn new(cfg: &'a EngineConfig, planner: &'a BitratePlanner, backend: &'a dyn EncoderBackend) -> Self {
        Self {
            cfg,
            planner,
            backend,
            on_attempt: None,
        }
    }

    pub fn with_attempt_hook(mut self, hook: AttemptHook<'a>) -> Self {
        self.on_attempt = Some(hook);
        self
    }

    /// Encode until the output is within `cap * (1 + tolerance)`.
    ///
    /// Reports progress to `sink`; 100 is only reported once the size has
    /// been verified. An encoder failure ends the loop immediately.
    pub async fn enforce(
        &self,
        initial: EncodePlan,
        media: &SourceMedia,
        budget: &TargetBudget,
        output_path: &Path,
        sink: &dyn ProgressSink,
    ) -> EngineResult<FinalResult> {
        let enforcement = &self.cfg.enforcement;
        let accepted = budget.accepted_bytes(enforcement.tolerance);
        let max_attempts = enforcement.max_attempts.max(1);
        let overall = MonotonicSink::new(sink, SESSION_PROGRESS_CEILING);

        let mut plan = initial;
        let mut window = PassWindow::new(0.0, FIRST_ATTEMPT_END);
        let mut last_size = 0;

        for attempt in 1..=max_attempts {
            if let Some(hook) = self.on_attempt {
                hook(attempt, &plan);
            }
            info!(
                "Attempt {}/{}: {:?} at {} kbps, {}x{} (accepting up to {} bytes)",
                attempt,
                max_attempts,
                plan.strategy,
                plan.video_bitrate_bps / 1000,
                plan.output_width,
                plan.output_height,
                accepted
            );

            let attempt_sink = WindowedSink::new(&overall, window);
            let mut session = EncodeSession::new(self.cfg, self.backend);
            let result = session.run(&plan, media, output_path, &attempt_sink).await?;

            if result.size_bytes <= accepted {
                sink.report(100.0, "Size verified");
                info!(
                    "Output {} fits: {} bytes <= {} bytes after {} attempt(s)",
                    output_path.display(),
                    result.size_bytes,
                    accepted,
                    attempt
                );
                return Ok(FinalResult {
                    output_path: result.output_path,
                    size_bytes: result.size_bytes,
                    attempts: attempt,
                    plan,
                });
            }

            last_size = result.size_bytes;
            warn!(
                "Attempt {} overshot: {} bytes vs {} accepted ({:+.1}%)",
                attempt,
                result.size_bytes,
                accepted,
                (result.size_bytes as f64 / budget.cap_bytes as f64 - 1.0) * 100.0
            );
            remove_output(output_path).await?;

            if attempt == max_attempts {
                break;
            }

            plan = self.next_plan(&plan, media, budget);
            window = PassWindow::new(window.end, window.end + (SESSION_PROGRESS_CEILING - window.end) / 2.0);
            overall.report(window.start, "Retrying at a lower bitrate");

            if enforcement.retry_backoff_ms > 0 {
                tokio::time::sleep(Duration::from_millis(enforcement.retry_backoff_ms)).await;
            }
        }

        Err(EngineError::BudgetUnmet {
            attempts: max_attempts,
            last_size,
            cap: budget.cap_bytes,
        })
    }

    /// Plan for the next attempt: a remux that overshot becomes a full
    /// re-encode, anything else drops its video bitrate by the reduction factor
    pub fn next_plan(&self, previous: &EncodePlan, media: &SourceMedia, budget: &TargetBudget) -> EncodePlan {
        match previous.strategy {
            Strategy::Copy => self.planner.reencode_plan(media, budget),
            Strategy::SinglePass | Strategy::TwoPass => {
                let reduced = (previous.video_bitrate_bps as f64 * self.cfg.enforcement.reduction_factor).floor() as u64;
                self.planner
                    .plan_with_video_bitrate(media, reduced, previous.audio_bitrate_bps)
            }
        }
    }
}

async fn remove_output(path: &Path) -> EngineResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(EngineError::resource(
            format!("failed to remove oversized output {}", path.display()),
            e,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::Strategy;
    use std::sync::Mutex;
    use proptest::prelude::*;
    use crate::budget::Provider;
    use crate::progress::RecordingSink;
    use crate::testing::{media, ScriptedEncoder};

    fn test_config() -> EngineConfig {
        let mut cfg = EngineConfig::default_config();
        cfg.enforcement.retry_backoff_ms = 0;
        cfg
    }

    fn gmail() -> TargetBudget {
        TargetBudget::for_provider(Provider::Gmail)
    }

    #[tokio::test]
    async fn test_first_attempt_fits() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config();
        let planner = BitratePlanner::new(cfg.planner.clone());
        let m = media(dir.path(), 600.0, 1_500_000_000, 1920, 1080);
        let backend = ScriptedEncoder::new(600.0).with_output_sizes(vec![24_100_000]);
        let output = dir.path().join("compressed_1.mp4");
        let record = RecordingSink::new();

        let plan = planner.plan(&m, &gmail());
        let result = SizeEnforcer::new(&cfg, &planner, &backend)
            .enforce(plan, &m, &gmail(), &output, &record)
            .await
            .unwrap();

        assert_eq!(result.attempts, 1);
        assert_eq!(result.size_bytes, 24_100_000);
        assert_eq!(result.plan.video_bitrate_bps, 233_000);
        assert!(output.exists());

        let percents = record.percents();
        assert_eq!(percents.last(), Some(&100.0));
        assert!(percents[..percents.len() - 1].iter().all(|p| *p < FIRST_ATTEMPT_END + 1e-9));
    }

    #[tokio::test]
    async fn test_overshoot_retries_at_reduced_bitrate() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config();
        let planner = BitratePlanner::new(cfg.planner.clone());
        let m = media(dir.path(), 600.0, 1_500_000_000, 1920, 1080);
        // 8% over on the first try
        let backend = ScriptedEncoder::new(600.0).with_output_sizes(vec![27_000_000, 24_800_000]);
        let output = dir.path().join("compressed_2.mp4");
        let record = RecordingSink::new();

        let seen = Mutex::new(Vec::new());
        let hook = |attempt: u32, plan: &EncodePlan| seen.lock().unwrap().push((attempt, plan.video_bitrate_bps));

        let plan = planner.plan(&m, &gmail());
        let result = SizeEnforcer::new(&cfg, &planner, &backend)
            .with_attempt_hook(&hook)
            .enforce(plan, &m, &gmail(), &output, &record)
            .await
            .unwrap();

        assert_eq!(result.attempts, 2);
        assert_eq!(result.size_bytes, 24_800_000);
        assert_eq!(backend.video_bitrates(), vec![233_000, 214_000]);
        assert_eq!(*seen.lock().unwrap(), vec![(1, 233_000), (2, 214_000)]);

        let percents = record.percents();
        for pair in percents.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        assert_eq!(percents.iter().filter(|p| **p == 100.0).count(), 1);
    }

    #[tokio::test]
    async fn test_budget_unmet_after_max_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config();
        let planner = BitratePlanner::new(cfg.planner.clone());
        let m = media(dir.path(), 600.0, 1_500_000_000, 1920, 1080);
        let backend = ScriptedEncoder::new(600.0).with_output_sizes(vec![30_000_000]);
        let output = dir.path().join("compressed_3.mp4");
        let record = RecordingSink::new();

        let plan = planner.plan(&m, &gmail());
        let err = SizeEnforcer::new(&cfg, &planner, &backend)
            .enforce(plan, &m, &gmail(), &output, &record)
            .await
            .unwrap_err();

        match &err {
            EngineError::BudgetUnmet { attempts, last_size, cap } => {
                assert_eq!(*attempts, 3);
                assert_eq!(*last_size, 30_000_000);
                assert_eq!(*cap, 25_000_000);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.category(), "budget_unmet");
        assert!(!output.exists());
        assert!(record.percents().iter().all(|p| *p < 100.0));
        assert_eq!(backend.video_bitrates().len(), 3);
    }

    #[tokio::test]
    async fn test_copy_overshoot_falls_back_to_reencode() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config();
        let planner = BitratePlanner::new(cfg.planner.clone());
        let m = media(dir.path(), 30.0, 24_000_000, 1920, 1080);
        let backend = ScriptedEncoder::new(30.0).with_output_sizes(vec![26_000_000, 20_000_000]);
        let output = dir.path().join("compressed_4.mp4");

        let plan = planner.plan(&m, &gmail());
        assert_eq!(plan.strategy, Strategy::Copy);

        let result = SizeEnforcer::new(&cfg, &planner, &backend)
            .enforce(plan, &m, &gmail(), &output, &RecordingSink::new())
            .await
            .unwrap();

        assert_eq!(result.attempts, 2);
        assert_ne!(result.plan.strategy, Strategy::Copy);
        let labels: Vec<String> = backend.invocations().into_iter().map(|i| i.label).collect();
        assert_eq!(labels[0], "remux");
    }

    #[tokio::test]
    async fn test_encoder_failure_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config();
        let planner = BitratePlanner::new(cfg.planner.clone());
        let m = media(dir.path(), 60.0, 200_000_000, 1920, 1080);
        let backend = ScriptedEncoder::new(60.0).failing(Some(1));
        let output = dir.path().join("compressed_5.mp4");

        let plan = planner.plan(&m, &gmail());
        let err = SizeEnforcer::new(&cfg, &planner, &backend)
            .enforce(plan, &m, &gmail(), &output, &RecordingSink::new())
            .await
            .unwrap_err();

        assert_eq!(err.category(), "encode_failed");
        assert_eq!(backend.invocations().len(), 1);
    }

    #[test]
    fn test_reduction_respects_floor() {
        let cfg = test_config();
        let planner = BitratePlanner::new(cfg.planner.clone());
        let backend = ScriptedEncoder::new(1.0);
        let enforcer = SizeEnforcer::new(&cfg, &planner, &backend);
        let m = media(std::path::Path::new("/tmp"), 1200.0, 1_000_000_000, 1920, 1080);
        let floor_plan = planner.plan_with_video_bitrate(&m, 120_000, 64_000);

        let next = enforcer.next_plan(&floor_plan, &m, &gmail());
        assert_eq!(next.video_bitrate_bps, cfg.planner.video_floor_bps);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn test_fits_or_fails_bounded(sizes in prop::collection::vec(20_000_000u64..32_000_000, 1..5)) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let outcome = rt.block_on(async {
                let dir = tempfile::tempdir().unwrap();
                let cfg = test_config();
                let planner = BitratePlanner::new(cfg.planner.clone());
                let m = media(dir.path(), 600.0, 1_500_000_000, 1920, 1080);
                let backend = ScriptedEncoder::new(600.0).with_output_sizes(sizes.clone());
                let output = dir.path().join("compressed_p.mp4");
                let plan = planner.plan(&m, &gmail());
                let res = SizeEnforcer::new(&cfg, &planner, &backend)
                    .enforce(plan, &m, &gmail(), &output, &RecordingSink::new())
                    .await;
                let bitrates = backend.video_bitrates();
                (res, bitrates, output.exists())
            });

            let (res, bitrates, exists) = outcome;
            let accepted = gmail().accepted_bytes(0.03);
            prop_assert!(bitrates.len() <= 3);
            for pair in bitrates.windows(2) {
                prop_assert!(pair[1] <= pair[0]);
            }
            match res {
                Ok(done) => {
                    prop_assert!(done.size_bytes <= accepted);
                    prop_assert!(exists);
                }
                Err(EngineError::BudgetUnmet { attempts, .. }) => {
                    prop_assert_eq!(attempts, 3);
                    prop_assert!(!exists);
                }
                Err(other) => prop_assert!(false, "unexpected error: {}", other),
            }
        }
    }
}

use log::{debug, info};
use serde::{Deserialize, Serialize};
use crate::budget::TargetBudget;
use crate::config::PlannerConfig;
use crate::ffprobe::SourceMedia;
use crate::ladder;

/// How the encoder is driven for one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    /// Remux only, streams untouched
    Copy,
    SinglePass,
    TwoPass,
}

/// Encoding parameters for one attempt. A retry builds a new plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodePlan {
    pub video_bitrate_bps: u64,
    pub audio_bitrate_bps: u64,
    pub output_width: u32,
    pub output_height: u32,
    pub strategy: Strategy,
}

impl EncodePlan {
    /// Remux plan: bitrates are zero and never read
    pub fn copy(media: &SourceMedia) -> Self {
        Self {
            video_bitrate_bps: 0,
            audio_bitrate_bps: 0,
            output_width: media.width,
            output_height: media.height,
            strategy: Strategy::Copy,
        }
    }

    pub fn needs_scaling(&self, media: &SourceMedia) -> bool {
        self.strategy != Strategy::Copy
            && (self.output_width, self.output_height) != (media.width, media.height)
    }
}

/// Round a bitrate down to whole kbps
pub fn floor_kbps(bps: u64) -> u64 {
    bps / 1000 * 1000
}

/// Bitrate planner: maps a source and a byte budget to an encode plan
#[derive(Debug, Clone)]
pub struct BitratePlanner {
    cfg: PlannerConfig,
}

impl BitratePlanner {
    pub fn new(cfg: PlannerConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.cfg
    }

    /// Choose copy when the source already fits, otherwise a re-encode plan
    pub fn plan(&self, media: &SourceMedia, budget: &TargetBudget) -> EncodePlan {
        let copy_limit = budget.cap_bytes as f64 * self.cfg.copy_threshold;
        if media.size_bytes as f64 <= copy_limit {
            info!(
                "Plan: copy ({} bytes <= {:.0} bytes, {:.0}% of {} cap)",
                media.size_bytes,
                copy_limit,
                self.cfg.copy_threshold * 100.0,
                budget.provider
            );
            return EncodePlan::copy(media);
        }
        self.reencode_plan(media, budget)
    }

    /// Re-encode plan ignoring the copy shortcut
    pub fn reencode_plan(&self, media: &SourceMedia, budget: &TargetBudget) -> EncodePlan {
        let duration = media.duration_seconds.max(1.0);
        let audio_bitrate_bps = self.audio_bitrate_for(duration);

        let usable_bits = budget.cap_bytes as f64 * 8.0 * (1.0 - self.cfg.container_overhead);
        let total_bps = usable_bits / duration;
        let raw_video = (total_bps - audio_bitrate_bps as f64).max(0.0).floor() as u64;
        let video_bitrate_bps = self.clamp_video(floor_kbps(raw_video));

        debug!(
            "Plan math: usable {:.0} bits over {:.2}s -> total {:.0} bps, audio {} bps, raw video {} bps",
            usable_bits, duration, total_bps, audio_bitrate_bps, raw_video
        );

        let plan = self.plan_with_video_bitrate(media, video_bitrate_bps, audio_bitrate_bps);
        info!(
            "Plan: {:?} at {} kbps video / {} kbps audio, {}x{} (source {}x{}, {:.1}s)",
            plan.strategy,
            plan.video_bitrate_bps / 1000,
            plan.audio_bitrate_bps / 1000,
            plan.output_width,
            plan.output_height,
            media.width,
            media.height,
            media.duration_seconds
        );
        plan
    }

    /// Build a plan around a fixed video bitrate (clamped), recomputing
    /// resolution and strategy
    pub fn plan_with_video_bitrate(
        &self,
        media: &SourceMedia,
        video_bitrate_bps: u64,
        audio_bitrate_bps: u64,
    ) -> EncodePlan {
        let video_bitrate_bps = self.clamp_video(floor_kbps(video_bitrate_bps));
        let (output_width, output_height) = ladder::scale(media.width, media.height, video_bitrate_bps);
        EncodePlan {
            video_bitrate_bps,
            audio_bitrate_bps,
            output_width,
            output_height,
            strategy: self.strategy_for(media.duration_seconds, video_bitrate_bps),
        }
    }

    /// Two passes for long clips or tight budgets
    pub fn strategy_for(&self, duration_seconds: f64, video_bitrate_bps: u64) -> Strategy {
        if duration_seconds > self.cfg.two_pass_duration_secs
            || video_bitrate_bps < self.cfg.tight_budget_bps
        {
            Strategy::TwoPass
        } else {
            Strategy::SinglePass
        }
    }

    fn audio_bitrate_for(&self, duration_seconds: f64) -> u64 {
        let bps = if duration_seconds > self.cfg.long_audio_threshold_secs {
            self.cfg.long_audio_bitrate_bps
        } else {
            self.cfg.audio_bitrate_bps
        };
        floor_kbps(bps)
    }

    fn clamp_video(&self, bps: u64) -> u64 {
        bps.clamp(self.cfg.video_floor_bps, self.cfg.video_ceiling_bps)
    }
}

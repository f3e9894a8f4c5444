use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use log::{debug, warn};

/// Longest download window a config may ask for
pub const MAX_DOWNLOAD_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Tunables for the bitrate planner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Sources at or below this fraction of the cap are remuxed, not re-encoded
    pub copy_threshold: f64,
    /// Fraction of the byte budget reserved for container overhead
    pub container_overhead: f64,
    /// AAC bitrate for normal-length clips
    pub audio_bitrate_bps: u64,
    /// Clips longer than this get `long_audio_bitrate_bps`
    pub long_audio_threshold_secs: f64,
    pub long_audio_bitrate_bps: u64,
    pub video_floor_bps: u64,
    pub video_ceiling_bps: u64,
    /// Clips longer than this always use two passes
    pub two_pass_duration_secs: f64,
    /// Video bitrates below this always use two passes
    pub tight_budget_bps: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            copy_threshold: 0.98,
            container_overhead: 0.06,
            audio_bitrate_bps: 80_000,
            long_audio_threshold_secs: 900.0,
            long_audio_bitrate_bps: 64_000,
            video_floor_bps: 120_000,
            video_ceiling_bps: 4_000_000,
            two_pass_duration_secs: 120.0,
            tight_budget_bps: 1_300_000,
        }
    }
}

/// Tunables for the size-enforcement loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnforcementConfig {
    /// Accepted overshoot above the cap (0.03 = 3%)
    pub tolerance: f64,
    /// Multiplier applied to the video bitrate after an overshoot
    pub reduction_factor: f64,
    /// Total attempts including the first
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            tolerance: 0.03,
            reduction_factor: 0.92,
            max_attempts: 3,
            retry_backoff_ms: 250,
        }
    }
}

/// Upload limits enforced at admission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub allowed_extensions: Vec<String>,
    pub max_size_bytes: u64,
    pub max_duration_secs: f64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            allowed_extensions: ["mp4", "mov", "mkv", "avi"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_size_bytes: 2 * 1024 * 1024 * 1024, // 2GB
            max_duration_secs: 20.0 * 60.0,
        }
    }
}

/// Configuration for the compression engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Path to ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Path to ffprobe binary
    pub ffprobe_bin: PathBuf,
    /// Directory holding compressed outputs and pass logs
    pub work_dir: PathBuf,
    /// Video encoder passed to `-c:v`
    pub video_codec: String,
    /// Encoder preset passed to `-preset`
    pub video_preset: String,
    /// Audio encoder passed to `-c:a`
    pub audio_codec: String,
    /// Wall-clock bound for a single encoder invocation
    pub encode_timeout_secs: u64,
    /// Duration assumed when ffprobe cannot report one
    pub duration_fallback_secs: f64,
    /// How long a finished download stays available
    pub download_ttl_secs: u64,
    /// Delete artifacts and forget the job once the download expires
    pub auto_cleanup: bool,
    pub planner: PlannerConfig,
    pub enforcement: EnforcementConfig,
    pub admission: AdmissionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl EngineConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            work_dir: PathBuf::from("/tmp/mailsized"),
            video_codec: "libx264".to_string(),
            video_preset: "medium".to_string(),
            audio_codec: "aac".to_string(),
            encode_timeout_secs: 2 * 60 * 60,
            duration_fallback_secs: 60.0,
            download_ttl_secs: 30 * 60,
            auto_cleanup: true,
            planner: PlannerConfig::default(),
            enforcement: EnforcementConfig::default(),
            admission: AdmissionConfig::default(),
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist.
    /// Environment overrides are applied last.
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            } else {
                warn!("Config file {} not found, using defaults", config_path.display());
            }
        }

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bin) = lookup("MAILSIZED_FFMPEG") {
            self.ffmpeg_bin = PathBuf::from(bin);
        }
        if let Some(bin) = lookup("MAILSIZED_FFPROBE") {
            self.ffprobe_bin = PathBuf::from(bin);
        }
        if let Some(dir) = lookup("MAILSIZED_WORK_DIR") {
            self.work_dir = PathBuf::from(dir);
        }
        if let Some(ttl) = lookup("DOWNLOAD_TTL_MIN") {
            let minutes: f64 = ttl
                .trim()
                .parse()
                .with_context(|| format!("DOWNLOAD_TTL_MIN is not a number: {}", ttl))?;
            if !minutes.is_finite() {
                anyhow::bail!("DOWNLOAD_TTL_MIN must be finite, got {}", ttl);
            }
            self.download_ttl_secs = (minutes.max(0.0) * 60.0) as u64;
        }
        if let Some(flag) = lookup("MAILSIZED_AUTO_CLEANUP") {
            self.auto_cleanup = env_flag(Some(&flag));
        }
        debug!("Effective config after env overrides: {:?}", self);
        Ok(())
    }

    /// Reject tunables that would break the planner or the enforcement loop
    pub fn validate(&self) -> Result<()> {
        let p = &self.planner;
        if !(0.0..1.0).contains(&p.container_overhead) {
            anyhow::bail!("planner.container_overhead must be in [0, 1), got {}", p.container_overhead);
        }
        if p.video_floor_bps == 0 || p.video_floor_bps > p.video_ceiling_bps {
            anyhow::bail!(
                "planner video floor {} must be non-zero and not above ceiling {}",
                p.video_floor_bps, p.video_ceiling_bps
            );
        }
        let e = &self.enforcement;
        if e.max_attempts == 0 {
            anyhow::bail!("enforcement.max_attempts must be at least 1");
        }
        if !(e.reduction_factor > 0.0 && e.reduction_factor < 1.0) {
            anyhow::bail!("enforcement.reduction_factor must be in (0, 1), got {}", e.reduction_factor);
        }
        if e.tolerance < 0.0 {
            anyhow::bail!("enforcement.tolerance must not be negative");
        }
        if self.duration_fallback_secs <= 0.0 {
            anyhow::bail!("duration_fallback_secs must be positive");
        }
        if self.download_ttl_secs > MAX_DOWNLOAD_TTL_SECS {
            anyhow::bail!(
                "download_ttl_secs must be at most {} (7 days), got {}",
                MAX_DOWNLOAD_TTL_SECS, self.download_ttl_secs
            );
        }
        Ok(())
    }
}

/// Interpret an environment value as a boolean flag (1/true/yes/on)
pub fn env_flag(value: Option<&str>) -> bool {
    match value {
        Some(v) => matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => false,
    }
}

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::ffprobe::SourceMedia;
use crate::planner::{EncodePlan, Strategy};

/// Number of stderr lines kept for error reports
const DIAGNOSTIC_TAIL_LINES: usize = 20;

/// One encoder run
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderInvocation {
    /// Human-readable step name, e.g. "pass 1/2"
    pub label: String,
    pub args: Vec<String>,
    /// File the invocation writes, None for an analysis-only pass
    pub output: Option<PathBuf>,
    pub timeout: Duration,
}

/// Source of encoder progress lines.
///
/// Implementations run one invocation to completion, calling `on_line` for
/// every machine-readable progress line, and fail with
/// [`EngineError::Encode`] on a non-zero exit or timeout.
#[async_trait]
pub trait EncoderBackend: Send + Sync {
    async fn run(
        &self,
        invocation: &EncoderInvocation,
        on_line: &mut (dyn for<'l> FnMut(&'l str) + Send),
    ) -> EngineResult<()>;
}

/// FFmpeg version information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FFmpegVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FFmpegVersion {
    /// Parse version from FFmpeg version string
    /// Example: "ffmpeg version 6.1.1" -> FFmpegVersion { major: 6, minor: 1, patch: 1 }
    pub fn parse(version_str: &str) -> Option<Self> {
        let version_part = version_str
            .split_whitespace()
            .find(|s| s.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false))?;

        // Distro builds append suffixes like "6.1.1-3ubuntu5"
        let numeric: String = version_part
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        let mut parts = numeric.split('.').filter(|p| !p.is_empty());

        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        Some(FFmpegVersion { major, minor, patch })
    }
}

/// Runs the real ffmpeg binary
#[derive(Debug, Clone)]
pub struct FfmpegBackend {
    pub ffmpeg_bin: PathBuf,
}

impl FfmpegBackend {
    pub fn new(cfg: &EngineConfig) -> Self {
        Self {
            ffmpeg_bin: cfg.ffmpeg_bin.clone(),
        }
    }

    /// Check the binary runs and offers the configured encoders
    pub async fn verify(&self, cfg: &EngineConfig) -> anyhow::Result<FFmpegVersion> {
        use anyhow::{anyhow, Context};

        let output = Command::new(&self.ffmpeg_bin)
            .arg("-version")
            .output()
            .await
            .with_context(|| format!("Failed to execute FFmpeg at: {}", self.ffmpeg_bin.display()))?;
        if !output.status.success() {
            return Err(anyhow!("FFmpeg version check failed"));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let first_line = stdout
            .lines()
            .next()
            .ok_or_else(|| anyhow!("Empty output from FFmpeg -version"))?;
        let version = FFmpegVersion::parse(first_line)
            .ok_or_else(|| anyhow!("No version number found in: {}", first_line))?;

        let output = Command::new(&self.ffmpeg_bin)
            .arg("-hide_banner")
            .arg("-encoders")
            .output()
            .await
            .with_context(|| format!("Failed to query FFmpeg encoders at: {}", self.ffmpeg_bin.display()))?;
        let encoders = String::from_utf8_lossy(&output.stdout);
        for wanted in [&cfg.video_codec, &cfg.audio_codec] {
            if !encoders.split_whitespace().any(|tok| tok == wanted.as_str()) {
                return Err(anyhow!("FFmpeg build has no '{}' encoder", wanted));
            }
        }

        info!(
            "FFmpeg {}.{}.{} ready (video: {}, audio: {})",
            version.major, version.minor, version.patch, cfg.video_codec, cfg.audio_codec
        );
        Ok(version)
    }
}

#[async_trait]
impl EncoderBackend for FfmpegBackend {
    async fn run(
        &self,
        invocation: &EncoderInvocation,
        on_line: &mut (dyn for<'l> FnMut(&'l str) + Send),
    ) -> EngineResult<()> {
        debug!(
            "Executing FFmpeg ({}): {} {}",
            invocation.label,
            self.ffmpeg_bin.display(),
            invocation.args.join(" ")
        );

        let mut child = Command::new(&self.ffmpeg_bin)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Encode {
                exit_code: None,
                diagnostic_tail: format!("failed to spawn {}: {}", self.ffmpeg_bin.display(), e),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| EngineError::Encode {
            exit_code: None,
            diagnostic_tail: "failed to capture FFmpeg stdout".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| EngineError::Encode {
            exit_code: None,
            diagnostic_tail: "failed to capture FFmpeg stderr".to_string(),
        })?;

        // Keep only the tail of stderr for diagnostics
        let stderr_handle = tokio::spawn(async move {
            let mut tail = VecDeque::with_capacity(DIAGNOSTIC_TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tail.len() == DIAGNOSTIC_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail.into_iter().collect::<Vec<_>>().join("\n")
        });

        let run = async {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                on_line(&line);
            }
            child.wait().await
        };
        let outcome = tokio::time::timeout(invocation.timeout, run).await;

        let status = match outcome {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(EngineError::Encode {
                    exit_code: None,
                    diagnostic_tail: format!("failed to wait for FFmpeg: {}", e),
                });
            }
            Err(_) => {
                warn!(
                    "FFmpeg ({}) timed out after {}s, killing it",
                    invocation.label,
                    invocation.timeout.as_secs()
                );
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill stuck FFmpeg process: {}", e);
                }
                return Err(EngineError::Encode {
                    exit_code: None,
                    diagnostic_tail: format!(
                        "timed out after {} seconds",
                        invocation.timeout.as_secs()
                    ),
                });
            }
        };

        let diagnostic_tail = stderr_handle.await.unwrap_or_default();

        if !status.success() {
            return Err(EngineError::Encode {
                exit_code: status.code(),
                diagnostic_tail,
            });
        }

        debug!("FFmpeg ({}) completed successfully", invocation.label);
        Ok(())
    }
}

/// Command builder for generating FFmpeg command lines from a plan
pub struct CommandBuilder<'a> {
    cfg: &'a EngineConfig,
}

impl<'a> CommandBuilder<'a> {
    pub fn new(cfg: &'a EngineConfig) -> Self {
        CommandBuilder { cfg }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.cfg.encode_timeout_secs)
    }

    /// Flags shared by every invocation: quiet, overwrite, progress on stdout
    fn base_args(&self, input: &Path) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-nostdin".into(),
            "-y".into(),
            "-loglevel".into(),
            "error".into(),
            "-progress".into(),
            "pipe:1".into(),
            "-nostats".into(),
        ];
        args.push("-i".into());
        args.push(input.to_string_lossy().to_string());
        args
    }

    fn video_args(&self, plan: &EncodePlan, media: &SourceMedia) -> Vec<String> {
        let kbps = plan.video_bitrate_bps / 1000;
        let mut args: Vec<String> = vec!["-map".into(), "0:v:0".into()];

        // Scale filter must come before the encoder
        if plan.needs_scaling(media) {
            args.push("-vf".into());
            args.push(format!("scale={}:{}", plan.output_width, plan.output_height));
        }

        args.extend([
            "-c:v".into(),
            self.cfg.video_codec.clone(),
            "-preset".into(),
            self.cfg.video_preset.clone(),
            "-b:v".into(),
            format!("{}k", kbps),
            "-maxrate".into(),
            format!("{}k", kbps),
            "-bufsize".into(),
            format!("{}k", kbps * 2),
            "-pix_fmt".into(),
            "yuv420p".into(),
        ]);
        args
    }

    fn audio_args(&self, plan: &EncodePlan) -> Vec<String> {
        vec![
            "-map".into(),
            "0:a:0?".into(),
            "-c:a".into(),
            self.cfg.audio_codec.clone(),
            "-b:a".into(),
            format!("{}k", plan.audio_bitrate_bps / 1000),
        ]
    }

    fn faststart(args: &mut Vec<String>, output: &Path) {
        args.push("-movflags".into());
        args.push("+faststart".into());
        args.push(output.to_string_lossy().to_string());
    }

    /// Remux without re-encoding
    pub fn copy(&self, media: &SourceMedia, output: &Path) -> EncoderInvocation {
        let mut args = self.base_args(&media.path);
        args.extend([
            "-map".into(),
            "0:v:0".into(),
            "-map".into(),
            "0:a:0?".into(),
            "-c".into(),
            "copy".into(),
        ]);
        Self::faststart(&mut args, output);
        EncoderInvocation {
            label: "remux".to_string(),
            args,
            output: Some(output.to_path_buf()),
            timeout: self.timeout(),
        }
    }

    pub fn single_pass(&self, plan: &EncodePlan, media: &SourceMedia, output: &Path) -> EncodeInvocationSet {
        let mut args = self.base_args(&media.path);
        args.extend(self.video_args(plan, media));
        args.extend(self.audio_args(plan));
        Self::faststart(&mut args, output);
        vec![EncoderInvocation {
            label: "single pass".to_string(),
            args,
            output: Some(output.to_path_buf()),
            timeout: self.timeout(),
        }]
    }

    /// Analysis pass writing only the pass log, then the real encode
    pub fn two_pass(
        &self,
        plan: &EncodePlan,
        media: &SourceMedia,
        output: &Path,
        passlog_prefix: &Path,
    ) -> EncodeInvocationSet {
        let passlog = passlog_prefix.to_string_lossy().to_string();

        let mut first = self.base_args(&media.path);
        first.extend(self.video_args(plan, media));
        first.extend([
            "-pass".into(),
            "1".into(),
            "-passlogfile".into(),
            passlog.clone(),
            "-an".into(),
            "-f".into(),
            "null".into(),
            null_sink().into(),
        ]);

        let mut second = self.base_args(&media.path);
        second.extend(self.video_args(plan, media));
        second.extend([
            "-pass".into(),
            "2".into(),
            "-passlogfile".into(),
            passlog,
        ]);
        second.extend(self.audio_args(plan));
        Self::faststart(&mut second, output);

        vec![
            EncoderInvocation {
                label: "pass 1/2".to_string(),
                args: first,
                output: None,
                timeout: self.timeout(),
            },
            EncoderInvocation {
                label: "pass 2/2".to_string(),
                args: second,
                output: Some(output.to_path_buf()),
                timeout: self.timeout(),
            },
        ]
    }

    /// Invocations for a plan in execution order
    pub fn build(
        &self,
        plan: &EncodePlan,
        media: &SourceMedia,
        output: &Path,
        passlog_prefix: &Path,
    ) -> EncodeInvocationSet {
        match plan.strategy {
            Strategy::Copy => vec![self.copy(media, output)],
            Strategy::SinglePass => self.single_pass(plan, media, output),
            Strategy::TwoPass => self.two_pass(plan, media, output, passlog_prefix),
        }
    }
}

pub type EncodeInvocationSet = Vec<EncoderInvocation>;

fn null_sink() -> &'static str {
    if cfg!(windows) {
        "NUL"
    } else {
        "/dev/null"
    }
}

/// Value following `flag` in an argument list
pub fn arg_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::Strategy;
    use proptest::prelude::*;

    fn media(width: u32, height: u32) -> SourceMedia {
        SourceMedia {
            path: PathBuf::from("/uploads/upload_1.mov"),
            size_bytes: 1_500_000_000,
            duration_seconds: 600.0,
            width,
            height,
        }
    }

    fn plan(strategy: Strategy, video: u64, w: u32, h: u32) -> EncodePlan {
        EncodePlan {
            video_bitrate_bps: video,
            audio_bitrate_bps: 80_000,
            output_width: w,
            output_height: h,
            strategy,
        }
    }

    #[test]
    fn test_version_parsing() {
        let v = FFmpegVersion::parse("ffmpeg version 6.1.1-3ubuntu5 Copyright (c) 2000-2023").unwrap();
        assert_eq!((v.major, v.minor, v.patch), (6, 1, 1));

        let v = FFmpegVersion::parse("ffmpeg version 7.0 Copyright").unwrap();
        assert_eq!((v.major, v.minor, v.patch), (7, 0, 0));

        assert!(FFmpegVersion::parse("ffmpeg version N/A").is_none());
    }

    #[test]
    fn test_copy_command() {
        let cfg = EngineConfig::default_config();
        let builder = CommandBuilder::new(&cfg);
        let m = media(1920, 1080);
        let invocations = builder.build(&EncodePlan::copy(&m), &m, Path::new("/work/out.mp4"), Path::new("/work/log"));

        assert_eq!(invocations.len(), 1);
        let args = &invocations[0].args;
        assert_eq!(arg_value(args, "-c"), Some("copy"));
        assert_eq!(arg_value(args, "-b:v"), None);
        assert_eq!(arg_value(args, "-movflags"), Some("+faststart"));
        assert_eq!(args.last().map(String::as_str), Some("/work/out.mp4"));
    }

    #[test]
    fn test_two_pass_commands() {
        let cfg = EngineConfig::default_config();
        let builder = CommandBuilder::new(&cfg);
        let m = media(1920, 1080);
        let p = plan(Strategy::TwoPass, 233_000, 852, 480);
        let invocations = builder.build(&p, &m, Path::new("/work/out.mp4"), Path::new("/work/out.a1.passlog"));

        assert_eq!(invocations.len(), 2);
        let first = &invocations[0];
        let second = &invocations[1];

        assert_eq!(arg_value(&first.args, "-pass"), Some("1"));
        assert_eq!(arg_value(&first.args, "-f"), Some("null"));
        assert!(first.args.contains(&"-an".to_string()));
        assert!(first.output.is_none());

        assert_eq!(arg_value(&second.args, "-pass"), Some("2"));
        assert_eq!(arg_value(&second.args, "-passlogfile"), Some("/work/out.a1.passlog"));
        assert_eq!(arg_value(&second.args, "-b:v"), Some("233k"));
        assert_eq!(arg_value(&second.args, "-bufsize"), Some("466k"));
        assert_eq!(arg_value(&second.args, "-b:a"), Some("80k"));
        assert_eq!(arg_value(&second.args, "-vf"), Some("scale=852:480"));
        assert_eq!(second.output.as_deref(), Some(Path::new("/work/out.mp4")));
    }

    #[test]
    fn test_no_scale_filter_when_resolution_kept() {
        let cfg = EngineConfig::default_config();
        let builder = CommandBuilder::new(&cfg);
        let m = media(1280, 720);
        let p = plan(Strategy::SinglePass, 3_000_000, 1280, 720);
        let invocations = builder.build(&p, &m, Path::new("/work/out.mp4"), Path::new("/work/log"));

        assert_eq!(invocations.len(), 1);
        assert_eq!(arg_value(&invocations[0].args, "-vf"), None);
        assert_eq!(arg_value(&invocations[0].args, "-c:v"), Some("libx264"));
    }

    #[test]
    fn test_progress_flags_present() {
        let cfg = EngineConfig::default_config();
        let builder = CommandBuilder::new(&cfg);
        let m = media(1920, 1080);
        for inv in builder.build(&plan(Strategy::TwoPass, 500_000, 960, 540), &m, Path::new("/o.mp4"), Path::new("/l")) {
            assert_eq!(arg_value(&inv.args, "-progress"), Some("pipe:1"));
            assert!(inv.args.contains(&"-nostdin".to_string()));
            assert_eq!(inv.timeout, Duration::from_secs(cfg.encode_timeout_secs));
        }
    }

    proptest! {
        #[test]
        fn test_filter_before_encoder(
            video in 120u64..4000,
            w in 2u32..2000,
            h in 2u32..2000,
        ) {
            let cfg = EngineConfig::default_config();
            let builder = CommandBuilder::new(&cfg);
            let m = media(3840, 2160);
            let p = plan(Strategy::SinglePass, video * 1000, w & !1, h & !1);
            let args = &builder.build(&p, &m, Path::new("/o.mp4"), Path::new("/l"))[0].args;

            let vf = args.iter().position(|a| a == "-vf");
            let cv = args.iter().position(|a| a == "-c:v");
            prop_assert!(vf.is_some() && cv.is_some());
            prop_assert!(vf < cv);
            let expected_bitrate = format!("{}k", video);
            prop_assert_eq!(arg_value(args, "-b:v"), Some(expected_bitrate.as_str()));
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_reports_tail() {
        // `sh -c` stands in for ffmpeg: prints progress, complains, exits 1
        let backend = FfmpegBackend { ffmpeg_bin: PathBuf::from("sh") };
        let invocation = EncoderInvocation {
            label: "fake".to_string(),
            args: vec![
                "-c".to_string(),
                "echo out_time_us=1000000; echo progress=continue; echo 'Conversion failed!' >&2; exit 3".to_string(),
            ],
            output: None,
            timeout: Duration::from_secs(10),
        };

        let mut lines = Vec::new();
        let err = backend
            .run(&invocation, &mut |l: &str| lines.push(l.to_string()))
            .await
            .unwrap_err();

        assert_eq!(lines, vec!["out_time_us=1000000", "progress=continue"]);
        match err {
            EngineError::Encode { exit_code, diagnostic_tail } => {
                assert_eq!(exit_code, Some(3));
                assert!(diagnostic_tail.contains("Conversion failed!"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_process() {
        let backend = FfmpegBackend { ffmpeg_bin: PathBuf::from("sh") };
        let invocation = EncoderInvocation {
            label: "hang".to_string(),
            args: vec!["-c".to_string(), "sleep 30".to_string()],
            output: None,
            timeout: Duration::from_millis(200),
        };

        let err = backend.run(&invocation, &mut |_l: &str| {}).await.unwrap_err();
        match err {
            EngineError::Encode { exit_code, diagnostic_tail } => {
                assert_eq!(exit_code, None);
                assert!(diagnostic_tail.contains("timed out"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}

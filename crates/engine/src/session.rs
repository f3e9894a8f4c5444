use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use log::{debug, info, warn};
use crate::config::EngineConfig;
use crate::encoder::{CommandBuilder, EncoderBackend};
use crate::error::{EngineError, EngineResult};
use crate::ffprobe::SourceMedia;
use crate::planner::{EncodePlan, Strategy};
use crate::progress::{fraction_done, MonotonicSink, PassWindow, ProgressParser, ProgressSink};

/// Highest value a session reports; 100 is reserved for the verified result
pub const SESSION_PROGRESS_CEILING: f64 = 99.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Pass1Running,
    Pass2Running,
    Completed,
    Failed,
}

/// Output of one finished session
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeResult {
    pub output_path: PathBuf,
    pub size_bytes: u64,
    pub elapsed: Duration,
}

/// Removes the two-pass statistics files when dropped, on every exit path
pub struct PassLogGuard {
    prefix: PathBuf,
}

impl PassLogGuard {
    pub fn new(prefix: PathBuf) -> Self {
        Self { prefix }
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }
}

/// Files libx264 writes for a `-passlogfile` prefix
const PASS_LOG_SUFFIXES: [&str; 4] = ["-0.log", "-0.log.temp", "-0.log.mbtree", "-0.log.mbtree.temp"];

/// Exact pass log paths for `prefix`
pub fn pass_log_files(prefix: &Path) -> Vec<PathBuf> {
    let base = prefix.as_os_str();
    PASS_LOG_SUFFIXES
        .iter()
        .map(|suffix| {
            let mut name = base.to_os_string();
            name.push(suffix);
            PathBuf::from(name)
        })
        .collect()
}

impl Drop for PassLogGuard {
    // Blocking, but bounded to four unlink calls with no directory scan
    fn drop(&mut self) {
        for path in pass_log_files(&self.prefix) {
            match fs::remove_file(&path) {
                Ok(()) => debug!("Removed pass log {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove pass log {}: {}", path.display(), e),
            }
        }
    }
}

/// Runs one plan to completion
pub struct EncodeSession<'a> {
    cfg: &'a EngineConfig,
    backend: &'a dyn EncoderBackend,
    state: SessionState,
}

impl<'a> EncodeSession<'a> {
    pub fn new(cfg: &'a EngineConfig, backend: &'a dyn EncoderBackend) -> Self {
        Self {
            cfg,
            backend,
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Encode `media` into `output_path` according to `plan`.
    ///
    /// Progress goes to `sink` in [0, 99] and never decreases. On failure the
    /// partial output is removed.
    pub async fn run(
        &mut self,
        plan: &EncodePlan,
        media: &SourceMedia,
        output_path: &Path,
        sink: &dyn ProgressSink,
    ) -> EngineResult<EncodeResult> {
        let started = Instant::now();
        let sink = MonotonicSink::new(sink, SESSION_PROGRESS_CEILING);
        let passlog = PassLogGuard::new(passlog_prefix(output_path));

        let invocations = CommandBuilder::new(self.cfg).build(plan, media, output_path, passlog.prefix());
        let count = invocations.len();
        sink.report(0.0, "Starting encoder");

        for (index, invocation) in invocations.iter().enumerate() {
            self.state = match (plan.strategy, index) {
                (Strategy::TwoPass, 0) => SessionState::Pass1Running,
                (Strategy::TwoPass, _) => SessionState::Pass2Running,
                _ => SessionState::Running,
            };
            let window = PassWindow::FULL.split(index, count);
            let message = match plan.strategy {
                Strategy::Copy => "Remuxing".to_string(),
                Strategy::SinglePass => "Compressing".to_string(),
                Strategy::TwoPass if index == 0 => format!("Analyzing ({})", invocation.label),
                Strategy::TwoPass => format!("Compressing ({})", invocation.label),
            };
            info!("Encoder {} started for {}", invocation.label, media.path.display());

            let mut parser = ProgressParser::new();
            let duration = media.duration_seconds;
            let sink_ref = &sink;
            let message_ref = message.as_str();
            let mut on_line = move |line: &str| {
                if let Some(marker) = parser.feed(line) {
                    let fraction = if marker.finished {
                        1.0
                    } else {
                        fraction_done(marker.encoded_seconds, duration)
                    };
                    sink_ref.report(window.map(fraction), message_ref);
                }
            };

            if let Err(e) = self.backend.run(invocation, &mut on_line).await {
                self.state = SessionState::Failed;
                remove_partial(output_path).await;
                return Err(e);
            }
        }

        let size_bytes = match tokio::fs::metadata(output_path).await {
            Ok(meta) if meta.len() > 0 => meta.len(),
            Ok(_) | Err(_) => {
                self.state = SessionState::Failed;
                remove_partial(output_path).await;
                return Err(EngineError::Encode {
                    exit_code: Some(0),
                    diagnostic_tail: format!("encoder produced no output at {}", output_path.display()),
                });
            }
        };

        self.state = SessionState::Completed;
        let elapsed = started.elapsed();
        info!(
            "Encoded {} -> {} ({} bytes, {:?}, {:.1}s)",
            media.path.display(),
            output_path.display(),
            size_bytes,
            plan.strategy,
            elapsed.as_secs_f64()
        );

        Ok(EncodeResult {
            output_path: output_path.to_path_buf(),
            size_bytes,
            elapsed,
        })
    }
}

/// Pass log prefix next to the output, unique per output file
pub fn passlog_prefix(output_path: &Path) -> PathBuf {
    let stem = output_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "encode".to_string());
    output_path.with_file_name(format!("{}.passlog", stem))
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed partial output {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial output {}: {}", path.display(), e),
    }
}

use std::path::{Path, PathBuf};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};

/// Complete ffprobe output structure
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeData {
    #[serde(default)]
    pub streams: Vec<FFProbeStream>,
    pub format: FFProbeFormat,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeFormat {
    pub format_name: Option<String>,
    pub duration: Option<String>,
    pub size: Option<String>,
    pub bit_rate: Option<String>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeStream {
    pub index: i32,
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub duration: Option<String>,
}

/// Probed facts about an uploaded clip. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMedia {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub duration_seconds: f64,
    pub width: u32,
    pub height: u32,
}

impl FFProbeData {
    pub fn first_video_stream(&self) -> Option<&FFProbeStream> {
        self.streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
    }

    /// Container duration, falling back to the first video stream's duration
    pub fn duration_seconds(&self) -> Option<f64> {
        let from_format = self.format.duration.as_deref().and_then(parse_positive);
        from_format.or_else(|| {
            self.first_video_stream()
                .and_then(|s| s.duration.as_deref())
                .and_then(parse_positive)
        })
    }

    /// Build a SourceMedia, substituting `fallback_duration` when none is known
    pub fn to_source_media(&self, path: &Path, size_bytes: u64, fallback_duration: f64) -> SourceMedia {
        let duration_seconds = match self.duration_seconds() {
            Some(d) => d,
            None => {
                warn!(
                    "No usable duration for {}, assuming {:.0}s",
                    path.display(),
                    fallback_duration
                );
                fallback_duration
            }
        };

        let (width, height) = self
            .first_video_stream()
            .map(|s| {
                (
                    s.width.unwrap_or(0).max(0) as u32,
                    s.height.unwrap_or(0).max(0) as u32,
                )
            })
            .unwrap_or((0, 0));

        SourceMedia {
            path: path.to_path_buf(),
            size_bytes,
            duration_seconds,
            width,
            height,
        }
    }
}

fn parse_positive(value: &str) -> Option<f64> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|d| d.is_finite() && *d > 0.0)
}

/// Run ffprobe and parse the JSON output
pub async fn probe_file(cfg: &EngineConfig, file_path: &Path) -> EngineResult<FFProbeData> {
    let probe_err = |reason: String| EngineError::Probe {
        path: file_path.to_path_buf(),
        reason,
    };

    // Verify file exists before trying to probe
    if !file_path.exists() {
        return Err(probe_err("file does not exist".to_string()));
    }

    debug!("ffprobe: probing {}", file_path.display());

    let output = Command::new(&cfg.ffprobe_bin)
        .arg("-v")
        .arg("error")
        .arg("-print_format")
        .arg("json")
        .arg("-show_streams")
        .arg("-show_format")
        .arg(file_path)
        .output()
        .await
        .map_err(|e| probe_err(format!("failed to execute {}: {}", cfg.ffprobe_bin.display(), e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);
        return Err(probe_err(format!(
            "ffprobe exit code {}: {}",
            exit_code,
            stderr.trim()
        )));
    }

    parse_probe_json(&output.stdout).map_err(probe_err)
}

/// Parse raw ffprobe JSON
pub fn parse_probe_json(raw: &[u8]) -> Result<FFProbeData, String> {
    let json_str = std::str::from_utf8(raw).map_err(|_| "ffprobe output is not valid UTF-8".to_string())?;
    serde_json::from_str(json_str).map_err(|e| format!("unrecognised ffprobe JSON: {}", e))
}

/// Probe a file into a SourceMedia
pub async fn probe(cfg: &EngineConfig, file_path: &Path) -> EngineResult<SourceMedia> {
    let data = probe_file(cfg, file_path).await?;

    let size_bytes = tokio::fs::metadata(file_path)
        .await
        .map_err(|e| EngineError::Probe {
            path: file_path.to_path_buf(),
            reason: format!("cannot stat file: {}", e),
        })?
        .len();

    let media = data.to_source_media(file_path, size_bytes, cfg.duration_fallback_secs);
    debug!(
        "Probed {}: {:.2}s, {}x{}, {} bytes",
        file_path.display(),
        media.duration_seconds,
        media.width,
        media.height,
        media.size_bytes
    );
    Ok(media)
}

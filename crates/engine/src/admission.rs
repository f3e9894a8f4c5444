use std::path::Path;
use log::debug;
use crate::config::AdmissionConfig;
use crate::error::{EngineError, EngineResult};
use crate::ffprobe::SourceMedia;

const MIB: u64 = 1024 * 1024;

/// Upload tier limits. A clip lands in the first tier it fits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadTier {
    pub tier: u8,
    pub max_minutes: u64,
    pub max_bytes: u64,
}

pub const UPLOAD_TIERS: &[UploadTier] = &[
    UploadTier { tier: 1, max_minutes: 5, max_bytes: 500 * MIB },
    UploadTier { tier: 2, max_minutes: 10, max_bytes: 1024 * MIB },
    UploadTier { tier: 3, max_minutes: 20, max_bytes: 2048 * MIB },
];

/// Reject files whose extension is not an allowed container
pub fn check_extension(path: &Path, cfg: &AdmissionConfig) -> EngineResult<()> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    if cfg.allowed_extensions.iter().any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(&ext)) {
        Ok(())
    } else {
        debug!("Rejected {}: extension '{}' not allowed", path.display(), ext);
        Err(EngineError::Rejected("Unsupported file type".to_string()))
    }
}

/// Tier for a clip, by duration and size
pub fn tier_for(duration_seconds: f64, size_bytes: u64) -> Option<UploadTier> {
    UPLOAD_TIERS
        .iter()
        .copied()
        .find(|t| duration_seconds <= (t.max_minutes * 60) as f64 && size_bytes <= t.max_bytes)
}

/// Full admission check on a probed source; returns the tier number
pub fn admit(media: &SourceMedia, cfg: &AdmissionConfig) -> EngineResult<u8> {
    check_extension(&media.path, cfg)?;

    if media.size_bytes > cfg.max_size_bytes {
        return Err(EngineError::Rejected("File exceeds 2GB limit".to_string()));
    }
    if media.duration_seconds > cfg.max_duration_secs {
        return Err(EngineError::Rejected("Video exceeds 20 minute limit".to_string()));
    }

    let tier = tier_for(media.duration_seconds, media.size_bytes).ok_or_else(|| {
        EngineError::Rejected("Video exceeds allowed limits for all tiers".to_string())
    })?;
    debug!(
        "Admitted {} as tier {} ({:.1}s, {} bytes)",
        media.path.display(),
        tier.tier,
        media.duration_seconds,
        media.size_bytes
    );
    Ok(tier.tier)
}

use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

use crate::job::JobStatus;

/// Errors surfaced by the transcoding engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Source is unreadable or not a recognised container. Never retried.
    #[error("failed to probe {}: {reason}", path.display())]
    Probe { path: PathBuf, reason: String },

    /// Encoder exited non-zero or timed out. `exit_code` is None on timeout or signal.
    #[error("encoder failed (exit code {}): {diagnostic_tail}", exit_code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string()))]
    Encode {
        exit_code: Option<i32>,
        diagnostic_tail: String,
    },

    /// Output still exceeds the cap after every allowed attempt
    #[error("cannot meet target: output is {last_size} bytes against a cap of {cap} bytes after {attempts} attempts; try a shorter clip")]
    BudgetUnmet { attempts: u32, last_size: u64, cap: u64 },

    /// Temp file or disk failure
    #[error("{context}: {source}")]
    Resource {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Upload violates admission limits
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("illegal job transition {from:?} -> {to:?}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("job {0} not found")]
    JobNotFound(Uuid),

    /// A job's worker task died without producing a result
    #[error("internal error: {0}")]
    Internal(String),

    /// Download expiry does not fit in a timestamp
    #[error("download window of {ttl_secs}s is out of range")]
    ExpiryOutOfRange { ttl_secs: u64 },
}

impl EngineError {
    pub fn resource(context: impl Into<String>, source: std::io::Error) -> Self {
        EngineError::Resource {
            context: context.into(),
            source,
        }
    }

    /// Terse category stored on the job and shown to end users
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::Probe { .. } => "probe_failed",
            EngineError::Encode { .. } => "encode_failed",
            EngineError::BudgetUnmet { .. } => "budget_unmet",
            EngineError::Resource { .. } => "resource_error",
            EngineError::Rejected(_) => "rejected",
            EngineError::InvalidTransition { .. }
            | EngineError::JobNotFound(_)
            | EngineError::Internal(_)
            | EngineError::ExpiryOutOfRange { .. } => "internal_error",
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

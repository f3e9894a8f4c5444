pub mod admission;
pub mod artifacts;
pub mod budget;
pub mod config;
pub mod encoder;
pub mod enforce;
pub mod error;
pub mod ffprobe;
pub mod job;
pub mod ladder;
pub mod pipeline;
pub mod planner;
pub mod progress;
pub mod session;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use budget::{Provider, TargetBudget};
pub use config::EngineConfig;
pub use encoder::{EncoderBackend, EncoderInvocation, FfmpegBackend};
pub use enforce::{FinalResult, SizeEnforcer};
pub use error::{EngineError, EngineResult};
pub use ffprobe::{FFProbeData, FFProbeFormat, FFProbeStream, SourceMedia};
pub use job::{EncodeJob, JobStatus};
pub use pipeline::{Engine, JobObserver, NullObserver, Outcome};
pub use planner::{BitratePlanner, EncodePlan, Strategy};
pub use progress::{ProgressSink, ProgressUpdate};
pub use store::{FileJobStore, JobStore, MemoryJobStore};

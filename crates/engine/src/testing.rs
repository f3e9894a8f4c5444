//! In-process encoder double for tests.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use async_trait::async_trait;
use crate::encoder::{arg_value, EncoderBackend, EncoderInvocation};
use crate::error::{EngineError, EngineResult};
use crate::ffprobe::SourceMedia;

/// Emits synthetic progress blocks and writes sparse output files of
/// scripted sizes, one per output-producing invocation
pub struct ScriptedEncoder {
    duration_seconds: f64,
    sizes: Vec<u64>,
    fail_with: Option<Option<i32>>,
    crash: bool,
    delay: Duration,
    invocations: Mutex<Vec<EncoderInvocation>>,
    outputs_written: Mutex<usize>,
}

impl ScriptedEncoder {
    pub fn new(duration_seconds: f64) -> Self {
        Self {
            duration_seconds,
            sizes: Vec::new(),
            fail_with: None,
            crash: false,
            delay: Duration::ZERO,
            invocations: Mutex::new(Vec::new()),
            outputs_written: Mutex::new(0),
        }
    }

    /// Output sizes in order; the last one repeats
    pub fn with_output_sizes(mut self, sizes: Vec<u64>) -> Self {
        self.sizes = sizes;
        self
    }

    /// Every invocation fails with this exit code after emitting progress
    pub fn failing(mut self, exit_code: Option<i32>) -> Self {
        self.fail_with = Some(exit_code);
        self
    }

    /// Every invocation panics mid-encode
    pub fn crashing(mut self) -> Self {
        self.crash = true;
        self
    }

    /// Sleep this long at the start of every invocation
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn invocations(&self) -> Vec<EncoderInvocation> {
        self.invocations.lock().unwrap().clone()
    }

    /// `-b:v` of every output-producing invocation, in bps
    pub fn video_bitrates(&self) -> Vec<u64> {
        self.invocations()
            .iter()
            .filter(|inv| inv.output.is_some())
            .filter_map(|inv| arg_value(&inv.args, "-b:v"))
            .filter_map(|v| v.trim_end_matches('k').parse::<u64>().ok())
            .map(|k| k * 1000)
            .collect()
    }

    fn next_size(&self) -> u64 {
        let mut written = self.outputs_written.lock().unwrap();
        let size = self
            .sizes
            .get(*written)
            .or_else(|| self.sizes.last())
            .copied()
            .unwrap_or(1_000);
        *written += 1;
        size
    }
}

#[async_trait]
impl EncoderBackend for ScriptedEncoder {
    async fn run(
        &self,
        invocation: &EncoderInvocation,
        on_line: &mut (dyn for<'l> FnMut(&'l str) + Send),
    ) -> EngineResult<()> {
        self.invocations.lock().unwrap().push(invocation.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        for step in 1..=4 {
            let us = (self.duration_seconds * step as f64 / 4.0 * 1_000_000.0) as i64;
            on_line("frame=10");
            on_line(&format!("out_time_us={}", us));
            on_line("progress=continue");
        }

        if self.crash {
            panic!("scripted encoder crashed during {}", invocation.label);
        }

        if let Some(exit_code) = self.fail_with {
            return Err(EngineError::Encode {
                exit_code,
                diagnostic_tail: "Conversion failed!".to_string(),
            });
        }

        on_line("progress=end");

        if let Some(output) = &invocation.output {
            let size = self.next_size();
            let file = tokio::fs::File::create(output)
                .await
                .map_err(|e| EngineError::resource("scripted output", e))?;
            file.set_len(size)
                .await
                .map_err(|e| EngineError::resource("scripted output", e))?;
        }
        Ok(())
    }
}

pub fn media(dir: &std::path::Path, duration: f64, size: u64, width: u32, height: u32) -> SourceMedia {
    SourceMedia {
        path: PathBuf::from(dir).join("upload_clip.mov"),
        size_bytes: size,
        duration_seconds: duration,
        width,
        height,
    }
}

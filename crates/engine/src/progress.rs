//! Progress plumbing between the encoder and the job.
//!
//! ffmpeg is run with `-progress pipe:1`, which prints `key=value` blocks
//! terminated by `progress=continue` or `progress=end`. [`ProgressParser`]
//! turns those lines into encoded-time markers; [`PassWindow`] maps a pass
//! fraction onto the slice of the 0-100 range the caller owns.

use std::sync::Mutex;
use serde::{Deserialize, Serialize};

/// Payload handed to progress consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub percent: f64,
    pub message: String,
}

/// Receives progress values in [0, 100]
pub trait ProgressSink: Send + Sync {
    fn report(&self, percent: f64, message: &str);
}

/// Sink that drops everything
pub struct NullSink;

impl ProgressSink for NullSink {
    fn report(&self, _percent: f64, _message: &str) {}
}

/// Sink that keeps every update, for tests and the CLI summary
#[derive(Default)]
pub struct RecordingSink {
    updates: Mutex<Vec<ProgressUpdate>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<ProgressUpdate> {
        lock(&self.updates).clone()
    }

    pub fn percents(&self) -> Vec<f64> {
        lock(&self.updates).iter().map(|u| u.percent).collect()
    }
}

impl ProgressSink for RecordingSink {
    fn report(&self, percent: f64, message: &str) {
        lock(&self.updates).push(ProgressUpdate {
            percent,
            message: message.to_string(),
        });
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Marker parsed from one progress block
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressMarker {
    /// Seconds of output encoded so far
    pub encoded_seconds: f64,
    /// `progress=end` was seen
    pub finished: bool,
}

/// Incremental parser for ffmpeg `-progress` output
#[derive(Debug, Default)]
pub struct ProgressParser {
    encoded_seconds: Option<f64>,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line; returns a marker at the end of each block
    pub fn feed(&mut self, line: &str) -> Option<ProgressMarker> {
        let line = line.trim();
        let (key, value) = line.split_once('=')?;
        let value = value.trim();

        match key.trim() {
            // Both are microseconds despite the name of the second
            "out_time_us" | "out_time_ms" => {
                if let Ok(us) = value.parse::<i64>() {
                    self.encoded_seconds = Some(us.max(0) as f64 / 1_000_000.0);
                }
                None
            }
            "out_time" => {
                if let Some(secs) = parse_clock(value) {
                    self.encoded_seconds = Some(secs);
                }
                None
            }
            "progress" => {
                let finished = value == "end";
                match self.encoded_seconds {
                    Some(encoded_seconds) => Some(ProgressMarker { encoded_seconds, finished }),
                    None if finished => Some(ProgressMarker { encoded_seconds: 0.0, finished }),
                    None => None,
                }
            }
            _ => None,
        }
    }
}

/// Parse `HH:MM:SS.micro`; ffmpeg prints `N/A` before the first frame
pub fn parse_clock(value: &str) -> Option<f64> {
    let value = value.trim();
    let negative = value.starts_with('-');
    let mut parts = value.trim_start_matches('-').split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    if negative {
        return Some(0.0);
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Fraction of the source encoded, clamped to [0, 1]
pub fn fraction_done(encoded_seconds: f64, source_duration: f64) -> f64 {
    if source_duration <= 0.0 {
        return 0.0;
    }
    (encoded_seconds / source_duration).clamp(0.0, 1.0)
}

/// A slice `[start, end)` of the visible percentage range
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassWindow {
    pub start: f64,
    pub end: f64,
}

impl PassWindow {
    pub const FULL: PassWindow = PassWindow { start: 0.0, end: 100.0 };

    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end: end.max(start) }
    }

    /// Map a fraction in [0, 1] into the window
    pub fn map(&self, fraction: f64) -> f64 {
        self.start + (self.end - self.start) * fraction.clamp(0.0, 1.0)
    }

    /// Sub-window `index` of `count` equal parts
    pub fn split(&self, index: usize, count: usize) -> PassWindow {
        let count = count.max(1) as f64;
        let width = (self.end - self.start) / count;
        PassWindow::new(self.start + width * index as f64, self.start + width * (index as f64 + 1.0))
    }
}

/// Rescales a full 0-100 range into a window of another sink
pub struct WindowedSink<'a> {
    inner: &'a dyn ProgressSink,
    window: PassWindow,
}

impl<'a> WindowedSink<'a> {
    pub fn new(inner: &'a dyn ProgressSink, window: PassWindow) -> Self {
        Self { inner, window }
    }
}

impl ProgressSink for WindowedSink<'_> {
    fn report(&self, percent: f64, message: &str) {
        self.inner.report(self.window.map(percent / 100.0), message);
    }
}

/// Wraps a sink so it never sees a smaller value than before, and never
/// more than `ceiling`
pub struct MonotonicSink<'a> {
    inner: &'a dyn ProgressSink,
    ceiling: f64,
    last: Mutex<f64>,
}

impl<'a> MonotonicSink<'a> {
    pub fn new(inner: &'a dyn ProgressSink, ceiling: f64) -> Self {
        Self {
            inner,
            ceiling,
            last: Mutex::new(f64::NEG_INFINITY),
        }
    }
}

impl ProgressSink for MonotonicSink<'_> {
    fn report(&self, percent: f64, message: &str) {
        if !percent.is_finite() {
            return;
        }
        let mut last = lock(&self.last);
        let value = percent.min(self.ceiling).max(*last).max(0.0);
        *last = value;
        self.inner.report(value, message);
    }
}

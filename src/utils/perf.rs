//! Latency tracking for the voice pipeline
//!
//! Each pipeline stage reports its duration into a sliding-window
//! [`TimingTracker`]; [`PipelineTimings`] groups the four trackers the
//! orchestrator keeps and summarises them.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default number of samples kept per tracker
pub const TIMING_WINDOW: usize = 100;

/// Tracks timing metrics over a sliding window
#[derive(Debug, Clone)]
pub struct TimingTracker {
    samples: VecDeque<Duration>,
    max_samples: usize,
}

impl TimingTracker {
    /// Create a new timing tracker with the given window size
    pub fn new(max_samples: usize) -> Self {
        let max_samples = max_samples.max(1);
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples,
        }
    }

    /// Record a new timing sample
    pub fn record(&mut self, duration: Duration) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(duration);
    }

    pub fn average(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.samples.iter().sum();
        total / self.samples.len() as u32
    }

    pub fn min(&self) -> Duration {
        self.samples.iter().min().copied().unwrap_or(Duration::ZERO)
    }

    pub fn max(&self) -> Duration {
        self.samples.iter().max().copied().unwrap_or(Duration::ZERO)
    }

    /// 95th percentile of the window
    pub fn percentile_95(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let mut sorted: Vec<_> = self.samples.iter().copied().collect();
        sorted.sort();
        let idx = (sorted.len() as f32 * 0.95) as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn stats(&self) -> TimingStats {
        TimingStats {
            count: self.count(),
            average_ms: self.average().as_millis() as u64,
            min_ms: self.min().as_millis() as u64,
            max_ms: self.max().as_millis() as u64,
            p95_ms: self.percentile_95().as_millis() as u64,
        }
    }
}

impl Default for TimingTracker {
    fn default() -> Self {
        Self::new(TIMING_WINDOW)
    }
}

/// Summary of one tracker, in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TimingStats {
    pub count: usize,
    pub average_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub p95_ms: u64,
}

/// A simple stopwatch for measuring elapsed time
#[derive(Debug)]
pub struct Stopwatch {
    start: Instant,
    splits: Vec<(&'static str, Duration)>,
}

impl Stopwatch {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
            splits: Vec::new(),
        }
    }

    /// Record the time since the previous split (or start) under `label`
    /// and return it
    pub fn split(&mut self, label: &'static str) -> Duration {
        let now = self.start.elapsed();
        let previous: Duration = self.splits.iter().map(|(_, d)| *d).sum();
        let lap = now.saturating_sub(previous);
        self.splits.push((label, lap));
        lap
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn splits(&self) -> &[(&'static str, Duration)] {
        &self.splits
    }
}

/// Per-stage latency trackers for the voice pipeline
#[derive(Debug, Clone, Default)]
pub struct PipelineTimings {
    pub recognition: TimingTracker,
    pub backend: TimingTracker,
    pub synthesis: TimingTracker,
    /// End of capture to start of speech
    pub total: TimingTracker,
}

impl PipelineTimings {
    pub fn new(window: usize) -> Self {
        Self {
            recognition: TimingTracker::new(window),
            backend: TimingTracker::new(window),
            synthesis: TimingTracker::new(window),
            total: TimingTracker::new(window),
        }
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            recognition: self.recognition.stats(),
            backend: self.backend.stats(),
            synthesis: self.synthesis.stats(),
            total: self.total.stats(),
        }
    }

    pub fn clear(&mut self) {
        self.recognition.clear();
        self.backend.clear();
        self.synthesis.clear();
        self.total.clear();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub recognition: TimingStats,
    pub backend: TimingStats,
    pub synthesis: TimingStats,
    pub total: TimingStats,
}

impl PipelineStats {
    /// One-line summary for logs
    pub fn summary(&self) -> String {
        format!(
            "STT: {}ms | LLM: {}ms | TTS: {}ms | Total: {}ms (p95 {}ms, n={})",
            self.recognition.average_ms,
            self.backend.average_ms,
            self.synthesis.average_ms,
            self.total.average_ms,
            self.total.p95_ms,
            self.total.count
        )
    }
}

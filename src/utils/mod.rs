pub mod perf;

pub use perf::{PipelineStats, PipelineTimings, Stopwatch, TimingStats, TimingTracker, TIMING_WINDOW};

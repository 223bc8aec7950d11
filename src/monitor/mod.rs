//! Periodic system telemetry
//!
//! [`PerformanceMonitor`] samples a [`MetricsProbe`] on its own thread at a
//! fixed interval, whatever the voice pipeline is doing, and publishes every
//! sample as a `PerformanceUpdate`. Slow subscribers lose the oldest unread
//! samples (see [`EventBus`]); sampling itself never waits on anyone.

pub mod probe;

pub use probe::SystemProbe;

use crate::events::{ErrorKind, EventBus, OutboundEvent};
use crate::utils::PipelineStats;
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, select, tick, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Backend latency above which a faster model is suggested
pub const BACKEND_LATENCY_LIMIT: Duration = Duration::from_secs(2);
/// Average memory use (percent) above which a smaller model is suggested
pub const MEMORY_LIMIT_PERCENT: f32 = 85.0;
/// Average CPU use (percent) above which fewer threads are suggested
pub const CPU_LIMIT_PERCENT: f32 = 80.0;

#[derive(Error, Debug, Clone)]
pub enum MonitorError {
    #[error("metrics unavailable: {0}")]
    Unavailable(String),

    #[error("failed to start monitor: {0}")]
    Spawn(String),
}

impl From<MonitorError> for crate::ParleyError {
    fn from(e: MonitorError) -> Self {
        crate::ParleyError::Monitor(e.to_string())
    }
}

/// One reading of host load
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub gpu_percent: Option<f32>,
    /// Hottest sensor, degrees Celsius
    pub temperature_c: Option<f32>,
    pub timestamp: DateTime<Utc>,
}

impl PerformanceSample {
    pub fn new(cpu_percent: f32, memory_percent: f32) -> Self {
        Self {
            cpu_percent,
            memory_percent,
            gpu_percent: None,
            temperature_c: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_gpu(mut self, gpu_percent: Option<f32>) -> Self {
        self.gpu_percent = gpu_percent;
        self
    }

    pub fn with_temperature(mut self, temperature_c: Option<f32>) -> Self {
        self.temperature_c = temperature_c;
        self
    }
}

/// Source of performance samples
pub trait MetricsProbe: Send {
    fn sample(&mut self) -> Result<PerformanceSample, MonitorError>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Sampling interval in milliseconds
    pub interval_ms: u64,

    /// Samples kept for statistics
    pub history: usize,

    /// Poll nvidia-smi for GPU utilisation
    pub gpu: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            history: 100,
            gpu: true,
        }
    }
}

impl MonitorConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Averages and peaks over the kept history
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ResourceStats {
    pub samples: usize,
    pub average_cpu: f32,
    pub peak_cpu: f32,
    pub average_memory: f32,
    pub peak_memory: f32,
}

/// Shared view of what the monitor has seen so far
#[derive(Clone)]
pub struct MonitorReadings {
    latest: Arc<RwLock<Option<PerformanceSample>>>,
    history: Arc<Mutex<VecDeque<PerformanceSample>>>,
    capacity: usize,
}

impl MonitorReadings {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            latest: Arc::new(RwLock::new(None)),
            history: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    fn record(&self, sample: PerformanceSample) {
        {
            let mut history = self.history.lock();
            if history.len() == self.capacity {
                history.pop_front();
            }
            history.push_back(sample.clone());
        }
        *self.latest.write() = Some(sample);
    }

    pub fn latest(&self) -> Option<PerformanceSample> {
        self.latest.read().clone()
    }

    pub fn history(&self) -> Vec<PerformanceSample> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn stats(&self) -> ResourceStats {
        let history = self.history.lock();
        if history.is_empty() {
            return ResourceStats::default();
        }
        let n = history.len() as f32;
        ResourceStats {
            samples: history.len(),
            average_cpu: history.iter().map(|s| s.cpu_percent).sum::<f32>() / n,
            peak_cpu: history.iter().map(|s| s.cpu_percent).fold(0.0, f32::max),
            average_memory: history.iter().map(|s| s.memory_percent).sum::<f32>() / n,
            peak_memory: history.iter().map(|s| s.memory_percent).fold(0.0, f32::max),
        }
    }
}

/// Background sampler; stops when dropped
pub struct PerformanceMonitor {
    readings: MonitorReadings,
    stop_tx: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl PerformanceMonitor {
    pub fn start(
        config: &MonitorConfig,
        mut probe: Box<dyn MetricsProbe>,
        bus: EventBus,
    ) -> Result<Self, MonitorError> {
        if config.interval_ms == 0 {
            return Err(MonitorError::Spawn("sampling interval must be positive".into()));
        }
        let readings = MonitorReadings::new(config.history);
        let interval = config.interval();
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let shared = readings.clone();
        let worker = thread::Builder::new()
            .name("perf-monitor".into())
            .spawn(move || {
                info!("Performance monitor started ({:?} interval)", interval);
                // Ticks keep the cadence fixed however long a sample takes
                let ticker = tick(interval);
                let mut failing = false;
                loop {
                    match probe.sample() {
                        Ok(sample) => {
                            failing = false;
                            shared.record(sample.clone());
                            bus.publish(OutboundEvent::PerformanceUpdate(sample));
                        }
                        Err(e) if !failing => {
                            warn!("Metrics sample failed: {}", e);
                            failing = true;
                            bus.publish(OutboundEvent::error(ErrorKind::Monitor, e.to_string()));
                        }
                        Err(e) => debug!("Metrics sample failed again: {}", e),
                    }

                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => {}
                    }
                }
                info!("Performance monitor stopped");
            })
            .map_err(|e| MonitorError::Spawn(e.to_string()))?;

        Ok(Self {
            readings,
            stop_tx: Some(stop_tx),
            worker: Some(worker),
        })
    }

    pub fn readings(&self) -> MonitorReadings {
        self.readings.clone()
    }

    pub fn latest(&self) -> Option<PerformanceSample> {
        self.readings.latest()
    }

    pub fn stats(&self) -> ResourceStats {
        self.readings.stats()
    }

    pub fn stop(&mut self) {
        // Dropping the sender also wakes the sampler
        self.stop_tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for PerformanceMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Tuning advice from pipeline latencies and host load
pub fn recommendations(pipeline: &PipelineStats, resources: &ResourceStats) -> Vec<String> {
    let mut tips = Vec::new();

    if pipeline.backend.count > 0
        && Duration::from_millis(pipeline.backend.average_ms) > BACKEND_LATENCY_LIMIT
    {
        tips.push(format!(
            "Backend replies average {}ms; consider a smaller or faster model",
            pipeline.backend.average_ms
        ));
    }
    if resources.samples > 0 && resources.average_memory > MEMORY_LIMIT_PERCENT {
        tips.push(format!(
            "Memory use averages {:.0}%; consider a smaller model or a shorter context",
            resources.average_memory
        ));
    }
    if resources.samples > 0 && resources.average_cpu > CPU_LIMIT_PERCENT {
        tips.push(format!(
            "CPU use averages {:.0}%; consider fewer inference threads",
            resources.average_cpu
        ));
    }
    tips
}

//! Host metrics via sysinfo and nvidia-smi

use super::{MetricsProbe, MonitorError, PerformanceSample};
use std::process::{Command, Stdio};
use sysinfo::{Components, System};
use tracing::{debug, info};

/// Reads CPU, memory, temperature and (when present) NVIDIA GPU usage
pub struct SystemProbe {
    sys: System,
    components: Components,
    gpu: bool,
}

impl SystemProbe {
    pub fn new(gpu: bool) -> Self {
        let mut sys = System::new();
        // First CPU reading is always 0; prime it
        sys.refresh_cpu();
        sys.refresh_memory();
        let components = Components::new_with_refreshed_list();
        info!(
            "System probe ready: {} CPUs, {} sensors, GPU polling {}",
            sys.cpus().len(),
            components.iter().count(),
            if gpu { "on" } else { "off" }
        );
        Self { sys, components, gpu }
    }

    fn temperature(&mut self) -> Option<f32> {
        self.components.refresh();
        self.components
            .iter()
            .map(|c| c.temperature())
            .filter(|t| t.is_finite() && *t > 0.0)
            .reduce(f32::max)
    }

    fn gpu_utilization(&mut self) -> Option<f32> {
        if !self.gpu {
            return None;
        }
        match query_nvidia_smi() {
            Some(usage) => Some(usage),
            None => {
                debug!("nvidia-smi unavailable; GPU polling disabled");
                self.gpu = false;
                None
            }
        }
    }
}

impl MetricsProbe for SystemProbe {
    fn sample(&mut self) -> Result<PerformanceSample, MonitorError> {
        self.sys.refresh_cpu();
        self.sys.refresh_memory();

        let total = self.sys.total_memory();
        if total == 0 {
            return Err(MonitorError::Unavailable("total memory reported as zero".into()));
        }
        let cpu = self.sys.global_cpu_info().cpu_usage();
        let memory = self.sys.used_memory() as f64 / total as f64 * 100.0;

        Ok(PerformanceSample::new(cpu, memory as f32)
            .with_gpu(self.gpu_utilization())
            .with_temperature(self.temperature()))
    }
}

fn query_nvidia_smi() -> Option<f32> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=utilization.gpu", "--format=csv,noheader,nounits"])
        .stderr(Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_gpu_utilization(&String::from_utf8_lossy(&output.stdout))
}

/// First GPU's utilisation from nvidia-smi CSV output
fn parse_gpu_utilization(csv: &str) -> Option<f32> {
    csv.lines().next()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gpu_utilization() {
        assert_eq!(parse_gpu_utilization("37\n12\n"), Some(37.0));
        assert_eq!(parse_gpu_utilization(""), None);
        assert_eq!(parse_gpu_utilization("[N/A]"), None);
    }

    #[test]
    fn test_system_probe_sample_in_range() {
        let mut probe = SystemProbe::new(false);
        let sample = probe.sample().unwrap();
        assert!((0.0..=100.0).contains(&sample.memory_percent));
        assert!(sample.cpu_percent >= 0.0);
        assert!(sample.gpu_percent.is_none());
    }
}

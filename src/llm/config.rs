//! AI backend configuration and host-based tuning

use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::time::Duration;
use sysinfo::System;
use tracing::{debug, info};

/// Configuration for the conversation backend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LLMConfig {
    /// Base URL of the Ollama server
    pub endpoint: String,

    /// Model name as known to the server
    pub model: String,

    /// Temperature for sampling (0.0 = deterministic, 1.0+ = creative)
    pub temperature: f32,

    /// Top-p (nucleus) sampling parameter
    pub top_p: f32,

    /// Top-k sampling parameter (0 = disabled)
    pub top_k: usize,

    /// Maximum tokens to generate per response
    pub max_tokens: usize,

    /// Repetition penalty (1.0 = no penalty)
    pub repeat_penalty: f32,

    /// Context window size in tokens
    pub context_size: usize,

    /// Number of CPU threads (None = server decides)
    pub n_threads: Option<usize>,

    /// Turns of dialogue kept as context
    pub memory_window: usize,

    /// Hard limit on one backend query
    pub timeout_ms: u64,

    /// How long the server keeps the model loaded between queries
    pub keep_alive: String,

    /// Name the assistant answers to
    pub assistant_name: String,

    /// Overrides the built-in system prompt
    pub system_prompt: Option<String>,

    /// Host-based tuning applied when the engine starts
    pub preset: TuningPreset,
}

/// Which host-derived settings to apply on top of the configured ones
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TuningPreset {
    /// Use the configured numbers as they are
    #[default]
    None,
    /// Threads, context and length from the host profile
    Auto,
    /// Short, focused replies
    Speed,
    /// Longer, broader replies
    Quality,
}

impl fmt::Display for TuningPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TuningPreset::None => "none",
            TuningPreset::Auto => "auto",
            TuningPreset::Speed => "speed",
            TuningPreset::Quality => "quality",
        };
        f.write_str(name)
    }
}

impl FromStr for TuningPreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(TuningPreset::None),
            "auto" => Ok(TuningPreset::Auto),
            "speed" => Ok(TuningPreset::Speed),
            "quality" => Ok(TuningPreset::Quality),
            other => Err(format!("unknown preset '{}' (none, auto, speed, quality)", other)),
        }
    }
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434".to_string(),
            model: "deepseek-r1".to_string(),
            temperature: 0.5,
            top_p: 0.9,
            top_k: 40,
            max_tokens: 256,
            repeat_penalty: 1.1,
            context_size: 2048,
            n_threads: None,
            memory_window: 2,
            timeout_ms: 30_000,
            keep_alive: "5m".to_string(),
            assistant_name: "Jarvis".to_string(),
            system_prompt: None,
            preset: TuningPreset::None,
        }
    }
}

impl LLMConfig {
    /// Create a configuration for the given model
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_memory_window(mut self, turns: usize) -> Self {
        self.memory_window = turns;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_preset(mut self, preset: TuningPreset) -> Self {
        self.preset = preset;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Apply the configured preset, inspecting the host only when one is set
    pub fn with_host_tuning(self) -> Self {
        if self.preset == TuningPreset::None {
            return self;
        }
        let profile = SystemProfile::detect();
        for tip in profile.tips() {
            info!("Hardware tip: {}", tip);
        }
        self.preset_for(&profile)
    }

    /// Apply the configured preset for a known host
    pub fn preset_for(self, profile: &SystemProfile) -> Self {
        match self.preset {
            TuningPreset::None => self,
            TuningPreset::Auto => self.tuned_for(profile),
            TuningPreset::Speed => self.for_speed(profile),
            TuningPreset::Quality => self.for_quality(profile),
        }
    }

    /// Derive thread, context and length settings from the host
    pub fn tuned_for(mut self, profile: &SystemProfile) -> Self {
        let cpus = profile.cpu_count;
        self.n_threads = Some(if cpus >= 16 {
            8.min(cpus - 2)
        } else if cpus >= 8 {
            6.min(cpus - 2)
        } else {
            2.max(cpus.saturating_sub(1))
        });

        let (context, predict) = match profile.memory_gb {
            m if m >= 32.0 => (8192, 1024),
            m if m >= 16.0 => (4096, 512),
            m if m >= 8.0 => (2048, 256),
            _ => (1024, 128),
        };
        self.context_size = context;
        self.max_tokens = predict;
        self.repeat_penalty = 1.1;

        if profile.has_gpu {
            self.temperature = 0.4;
            self.top_k = 40;
        } else {
            self.temperature = 0.5;
            self.top_k = 20;
        }

        debug!(
            "Tuned backend for {} CPUs / {:.1} GB / gpu={}: ctx={} predict={}",
            cpus, profile.memory_gb, profile.has_gpu, self.context_size, self.max_tokens
        );
        self
    }

    /// Short, focused replies
    pub fn for_speed(self, profile: &SystemProfile) -> Self {
        let mut config = self.tuned_for(profile);
        config.temperature = 0.3;
        config.top_k = 20;
        config.top_p = 0.8;
        config.max_tokens = 128;
        config.repeat_penalty = 1.05;
        if profile.memory_gb < 16.0 {
            config.context_size = config.context_size.min(1024);
        }
        config
    }

    /// Longer, broader replies
    pub fn for_quality(self, profile: &SystemProfile) -> Self {
        let mut config = self.tuned_for(profile);
        config.temperature = 0.6;
        config.top_k = 60;
        config.top_p = 0.95;
        config.max_tokens = 512;
        config.repeat_penalty = 1.15;
        if profile.memory_gb >= 16.0 {
            config.context_size = (config.context_size * 2).min(8192);
        }
        config
    }
}

/// Hardware summary used to pick backend presets
#[derive(Clone, Debug, PartialEq)]
pub struct SystemProfile {
    pub cpu_count: usize,
    pub memory_gb: f64,
    pub has_gpu: bool,
}

impl SystemProfile {
    /// Inspect the current host
    pub fn detect() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu();

        let cpu_count = sys.cpus().len().max(1);
        let memory_gb = sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0);
        let has_gpu = detect_gpu();

        info!(
            "System detected: {} CPU cores, {:.1}GB RAM, GPU: {}",
            cpu_count, memory_gb, has_gpu
        );

        Self {
            cpu_count,
            memory_gb,
            has_gpu,
        }
    }

    /// Advice derived from the hardware alone
    pub fn tips(&self) -> Vec<String> {
        let mut tips = Vec::new();
        if self.cpu_count < 4 {
            tips.push("Consider a CPU with 8+ cores for faster inference".to_string());
        }
        if self.memory_gb < 8.0 {
            tips.push("Consider adding more RAM (16GB+ recommended)".to_string());
        }
        if !self.has_gpu {
            tips.push("A GPU gives 3-10x faster inference".to_string());
        }
        tips
    }
}

fn detect_gpu() -> bool {
    let nvidia = Command::new("nvidia-smi")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    if nvidia {
        return true;
    }
    std::env::var("CUDA_VISIBLE_DEVICES")
        .map(|v| !v.is_empty() && v != "-1")
        .unwrap_or(false)
}

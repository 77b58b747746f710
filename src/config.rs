use std::env;
use std::path::Path;

use serde::Deserialize;

use crate::error::CrucibleError;

/// Inference backend endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    /// Base URL without port, e.g. "http://localhost".
    pub url: String,
    /// Default inference port when GPU routing is disabled.
    pub port: u16,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost".to_string(),
            port: 11434,
        }
    }
}

/// Device topology and model-placement configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    /// Enable two-device routing (pinned + swap).
    pub dual_gpu: bool,
    pub pinned_port: u16,
    pub swap_port: u16,
    /// The always-resident model used as last-resort fallback.
    pub primary_model: String,
    /// Device capacities in GB.
    pub pinned_gpu_vram: f64,
    pub swap_gpu_vram: f64,
    /// Sum of pinned-model sizes reserved on the pinned device, in GB.
    pub pinned_models_vram: f64,
    /// When false, the selector always returns the primary model.
    pub use_smart_model_selection: bool,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            dual_gpu: false,
            pinned_port: 11434,
            swap_port: 11435,
            primary_model: "qwen2.5-coder:14b".to_string(),
            pinned_gpu_vram: 24.0,
            swap_gpu_vram: 24.0,
            pinned_models_vram: 0.0,
            use_smart_model_selection: true,
        }
    }
}

/// Container warmup configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub enable_warmup: bool,
    pub warmup_images: Vec<String>,
    pub image_pull_timeout_minutes: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            enable_warmup: false,
            warmup_images: Vec::new(),
            image_pull_timeout_minutes: 10,
        }
    }
}

/// Memory-service endpoint. `None` runs the engine in degraded mode with
/// the no-op capability.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MemoryAgentConfig {
    pub base_url: Option<String>,
}

/// Engine limits and policy knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub min_acceptance_score: f64,
    pub max_iterations: u32,
    /// Idle timeout since last body chunk on a generate call, in seconds.
    pub idle_chunk_timeout_secs: u64,
    /// Per-iteration wall-clock budget; job timeout = this x max_iterations.
    pub per_iteration_budget_secs: u64,
    /// Concurrent job admission cap.
    pub concurrency: usize,
    /// Hours a terminal job stays queryable before the sweeper removes it.
    pub job_ttl_hours: u64,
    /// Expose model names in user-visible error messages.
    pub verbose_errors: bool,
    /// Forbid compiled-in prompt fallbacks (strict deployments).
    pub strict_prompts: bool,
    /// Ensemble strategy tag: single | sequential | parallel | specialized |
    /// pessimistic | optimistic | adaptive.
    pub ensemble_strategy: String,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            min_acceptance_score: 8.0,
            max_iterations: 50,
            idle_chunk_timeout_secs: 60,
            per_iteration_budget_secs: 144,
            concurrency: 4,
            job_ttl_hours: 24,
            verbose_errors: false,
            strict_prompts: false,
            ensemble_strategy: "adaptive".to_string(),
        }
    }
}

/// Sandbox policy.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Treat sandbox build failures as terminal instead of demoting to issues.
    pub strict: bool,
}

/// HTTP surface binding.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ollama: OllamaConfig,
    pub gpu: GpuConfig,
    pub docker: DockerConfig,
    pub memory_agent: MemoryAgentConfig,
    pub limits: LimitsConfig,
    pub sandbox: SandboxConfig,
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration: compiled defaults, then the optional TOML file
    /// (path from CRUCIBLE_CONFIG, else ./crucible.toml), then environment
    /// overrides. A present-but-malformed file is the only fatal case.
    pub fn load() -> Result<Self, CrucibleError> {
        let path = env::var("CRUCIBLE_CONFIG").unwrap_or_else(|_| "crucible.toml".to_string());
        let mut config = Self::from_file(Path::new(&path))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, CrucibleError> {
        match std::fs::read_to_string(path) {
            Ok(text) => toml::from_str(&text).map_err(|e| {
                CrucibleError::Configuration(format!("{}: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file at {} — using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(CrucibleError::Configuration(format!(
                "{}: {e}",
                path.display()
            ))),
        }
    }

    fn apply_env(&mut self) {
        if let Ok(url) = env::var("OLLAMA_URL") {
            self.ollama.url = url;
        }
        if let Ok(port) = env::var("OLLAMA_PORT")
            && let Ok(port) = port.parse()
        {
            self.ollama.port = port;
        }
        if let Ok(v) = env::var("GPU_DUAL_GPU") {
            self.gpu.dual_gpu = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Ok(url) = env::var("MEMORY_AGENT_URL") {
            self.memory_agent.base_url = Some(url);
        }
        if let Ok(addr) = env::var("CRUCIBLE_LISTEN") {
            self.server.listen = addr;
        }
    }

    fn validate(&self) -> Result<(), CrucibleError> {
        if self.limits.max_iterations == 0 {
            return Err(CrucibleError::Configuration(
                "limits.max_iterations must be >= 1".to_string(),
            ));
        }
        if !(0.0..=10.0).contains(&self.limits.min_acceptance_score) {
            return Err(CrucibleError::Configuration(
                "limits.min_acceptance_score must be in 0..=10".to_string(),
            ));
        }
        if self.gpu.pinned_gpu_vram <= 1.0 || (self.gpu.dual_gpu && self.gpu.swap_gpu_vram <= 1.0)
        {
            return Err(CrucibleError::Configuration(
                "device capacity must exceed the 1 GB reservation".to_string(),
            ));
        }
        Ok(())
    }

    /// Base URL for a specific backend port.
    pub fn backend_url(&self, port: u16) -> String {
        format!("{}:{port}", self.ollama.url.trim_end_matches('/'))
    }
}

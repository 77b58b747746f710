pub mod ollama;

use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::CrucibleError;

/// A model the backend reports as installed on one device port.
#[derive(Debug, Clone)]
pub struct DiscoveredModel {
    pub name: String,
    pub size_gb: f64,
}

/// A model currently resident in device memory.
#[derive(Debug, Clone)]
pub struct ResidentModel {
    pub name: String,
    pub resident_gb: f64,
}

/// Internal request type for a single generate call.
pub struct GenerateRequest {
    pub model: String,
    /// Device port the call is routed to.
    pub port: u16,
    pub prompt: String,
    pub system: Option<String>,
    pub num_ctx: Option<u32>,
    /// Absolute wall-clock ceiling for the whole call.
    pub deadline: Instant,
    /// Max silence between body chunks before the call times out.
    pub idle_timeout: std::time::Duration,
    /// Cooperative cancellation from the owning job.
    pub cancellation_token: Option<CancellationToken>,
}

/// Result of a generate call.
#[derive(Debug)]
pub struct GenerateOutcome {
    pub response: String,
    pub total_duration_ms: u64,
    pub prompt_eval_count: u64,
    pub eval_count: u64,
}

/// The inference-backend capability. One implementation speaks to a live
/// Ollama-compatible server; tests script their own.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Installed models on the given device port.
    async fn list_models(&self, port: u16) -> Result<Vec<DiscoveredModel>, CrucibleError>;

    /// Models currently resident in VRAM on the given device port.
    async fn list_running(&self, port: u16) -> Result<Vec<ResidentModel>, CrucibleError>;

    /// Run one generation. Must be cancellable and must enforce an idle
    /// timeout per body chunk rather than a single wall-clock timeout.
    async fn generate(&self, req: &GenerateRequest) -> Result<GenerateOutcome, CrucibleError>;
}

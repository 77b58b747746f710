use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrucibleError {
    #[error("inference backend unreachable on all configured ports")]
    RegistryUnavailable,

    #[error("no candidate model for purpose {purpose}")]
    NoCandidate { purpose: String },

    #[error("all candidate models exhausted")]
    ModelsExhausted,

    #[error("backend timed out after {0}ms")]
    BackendTimeout(u64),

    #[error("backend returned malformed payload: {0}")]
    BackendMalformed(String),

    #[error("no parseable file blocks in model response")]
    ParseFailed,

    #[error("validation failed with score {score:.1}")]
    ValidationFailed { score: f64 },

    #[error("generated imports are invalid: {0}")]
    ImportInvalid(String),

    #[error("sandbox failed: {0}")]
    SandboxFailed(String),

    #[error("cancelled after {0}ms")]
    Cancelled(u64),

    #[error("task plan unavailable")]
    TaskPlanMissing,

    #[error("memory service unavailable: {0}")]
    MemoryServiceUnavailable(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl CrucibleError {
    /// Stable taxonomy tag used in attempt records and the status endpoint.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RegistryUnavailable => "registry_unavailable",
            Self::NoCandidate { .. } => "no_candidate",
            Self::ModelsExhausted => "models_exhausted",
            Self::BackendTimeout(_) => "backend_timeout",
            Self::BackendMalformed(_) => "backend_malformed",
            Self::ParseFailed => "parse_failed",
            Self::ValidationFailed { .. } => "validation_failed",
            Self::ImportInvalid(_) => "import_invalid",
            Self::SandboxFailed(_) => "sandbox_failed",
            Self::Cancelled(_) => "cancelled",
            Self::TaskPlanMissing => "task_plan_missing",
            Self::MemoryServiceUnavailable(_) => "memory_service_unavailable",
            Self::Configuration(_) => "configuration",
        }
    }

    /// Produce a sanitized single-sentence message safe for the HTTP surface.
    /// Does not leak URLs, prompt content, or upstream error bodies.
    pub fn user_message(&self) -> String {
        match self {
            Self::RegistryUnavailable => "inference backend is unreachable".to_string(),
            Self::NoCandidate { purpose } => format!("no model available for {purpose}"),
            Self::ModelsExhausted => "every candidate model was tried and failed".to_string(),
            Self::BackendTimeout(ms) => format!("inference backend timed out after {ms}ms"),
            Self::BackendMalformed(_) => {
                "inference backend returned an unusable response".to_string()
            }
            Self::ParseFailed => "model output contained no usable files".to_string(),
            Self::ValidationFailed { score } => {
                format!("generated code scored {score:.1}, below the acceptance bar")
            }
            Self::ImportInvalid(_) => "generated code references unknown imports".to_string(),
            Self::SandboxFailed(_) => "sandbox check failed".to_string(),
            Self::Cancelled(_) => "job was cancelled".to_string(),
            Self::TaskPlanMissing => "no task plan could be produced".to_string(),
            Self::MemoryServiceUnavailable(_) => "memory service is unavailable".to_string(),
            Self::Configuration(msg) => format!("configuration error: {msg}"),
        }
    }

    /// True for errors that terminate a job outright rather than counting
    /// against the iteration budget.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ModelsExhausted | Self::Cancelled(_) | Self::Configuration(_)
        )
    }
}

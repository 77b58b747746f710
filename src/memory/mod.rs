pub mod rpc;

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CrucibleError;
use crate::job::GeneratedFile;

/// Context gathered for one generate attempt. Every field degrades to
/// empty when the memory service is unreachable.
#[derive(Debug, Clone, Default)]
pub struct TaskContext {
    pub similar_tasks: Vec<String>,
    pub lessons: Vec<String>,
    pub symbols: Vec<String>,
    pub design: Option<String>,
}

/// One step of a task plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub description: String,
    #[serde(default)]
    pub completed: bool,
}

/// Ranked per-model statistic from the learning store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelStat {
    pub model: String,
    pub success_rate: f64,
    pub avg_score: f64,
    pub samples: u64,
    /// Failures caused by timeouts or cutoffs, a subset of the failed
    /// samples. Drives the selection exploration slot.
    #[serde(default)]
    pub timing_failures: u64,
}

/// Per-attempt outcome forwarded to the learning store.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceRecord {
    pub model: String,
    pub task_type: String,
    pub language: String,
    pub complexity: u32,
    pub outcome: String,
    pub score: f64,
    pub duration_ms: u64,
    pub iterations: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    pub keywords: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Success pattern stored after a completed job.
#[derive(Debug, Clone, Serialize)]
pub struct SuccessPattern {
    pub keywords: Vec<String>,
    pub approach: String,
    pub language: String,
    pub files: Vec<String>,
}

/// Failure record stored for a terminally failed job.
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub keywords: Vec<String>,
    pub language: String,
    pub error_kind: String,
    pub iterations: u32,
}

/// The memory-service capability: prompts, context, plans, symbols,
/// lessons and model statistics. All methods are best-effort from the
/// engine's point of view; callers decide whether a failure degrades or
/// propagates.
#[async_trait]
pub trait MemoryService: Send + Sync {
    async fn get_context(&self, task: &str, language: &str) -> Result<TaskContext, CrucibleError>;

    /// Fetch a system prompt by name. `Ok(None)` means the service is up
    /// but has no prompt under that name.
    async fn get_prompt(&self, name: &str) -> Result<Option<String>, CrucibleError>;

    async fn generate_task_plan(
        &self,
        task: &str,
        language: &str,
    ) -> Result<Vec<PlanStep>, CrucibleError>;

    async fn update_plan_status(
        &self,
        job_id: &str,
        step: usize,
        completed: bool,
    ) -> Result<(), CrucibleError>;

    async fn index_file(&self, file: &GeneratedFile) -> Result<(), CrucibleError>;

    async fn get_project_symbols(&self, workspace: &str) -> Result<Vec<String>, CrucibleError>;

    /// Returns the invalid imports found across the file set; empty means
    /// all imports resolve.
    async fn validate_imports(
        &self,
        files: &[GeneratedFile],
        workspace: Option<&str>,
    ) -> Result<Vec<String>, CrucibleError>;

    /// Record a task/result pair for retrieval-augmented prompts.
    async fn store_qa(&self, question: &str, answer: &str) -> Result<(), CrucibleError>;

    async fn store_model_performance(&self, record: &PerformanceRecord)
    -> Result<(), CrucibleError>;

    async fn store_successful_task(&self, pattern: &SuccessPattern) -> Result<(), CrucibleError>;

    async fn store_task_failure(&self, record: &FailureRecord) -> Result<(), CrucibleError>;

    async fn get_model_stats(
        &self,
        language: &str,
        task_type: &str,
    ) -> Result<Vec<ModelStat>, CrucibleError>;

    /// Optional delegated model selection: given the task, historical
    /// stats and candidate names, recommend one. The default capability
    /// recommends nothing.
    async fn suggest_model(
        &self,
        task: &str,
        stats: &[ModelStat],
        candidates: &[String],
    ) -> Result<Option<String>, CrucibleError>;
}

/// No-op capability used when no memory service is configured. Returns
/// empty data and logs degraded mode once.
#[derive(Default)]
pub struct NoopMemory {
    warned: AtomicBool,
}

impl NoopMemory {
    fn degraded(&self) {
        if !self.warned.swap(true, Ordering::Relaxed) {
            tracing::warn!("no memory service configured — learning and context are disabled");
        }
    }
}

#[async_trait]
impl MemoryService for NoopMemory {
    async fn get_context(&self, _task: &str, _language: &str) -> Result<TaskContext, CrucibleError> {
        self.degraded();
        Ok(TaskContext::default())
    }

    async fn get_prompt(&self, _name: &str) -> Result<Option<String>, CrucibleError> {
        self.degraded();
        Ok(None)
    }

    async fn generate_task_plan(
        &self,
        _task: &str,
        _language: &str,
    ) -> Result<Vec<PlanStep>, CrucibleError> {
        self.degraded();
        Err(CrucibleError::TaskPlanMissing)
    }

    async fn update_plan_status(
        &self,
        _job_id: &str,
        _step: usize,
        _completed: bool,
    ) -> Result<(), CrucibleError> {
        Ok(())
    }

    async fn index_file(&self, _file: &GeneratedFile) -> Result<(), CrucibleError> {
        Ok(())
    }

    async fn get_project_symbols(&self, _workspace: &str) -> Result<Vec<String>, CrucibleError> {
        Ok(Vec::new())
    }

    async fn validate_imports(
        &self,
        _files: &[GeneratedFile],
        _workspace: Option<&str>,
    ) -> Result<Vec<String>, CrucibleError> {
        Ok(Vec::new())
    }

    async fn store_qa(&self, _question: &str, _answer: &str) -> Result<(), CrucibleError> {
        Ok(())
    }

    async fn store_model_performance(
        &self,
        _record: &PerformanceRecord,
    ) -> Result<(), CrucibleError> {
        Ok(())
    }

    async fn store_successful_task(&self, _pattern: &SuccessPattern) -> Result<(), CrucibleError> {
        Ok(())
    }

    async fn store_task_failure(&self, _record: &FailureRecord) -> Result<(), CrucibleError> {
        Ok(())
    }

    async fn get_model_stats(
        &self,
        _language: &str,
        _task_type: &str,
    ) -> Result<Vec<ModelStat>, CrucibleError> {
        Ok(Vec::new())
    }

    async fn suggest_model(
        &self,
        _task: &str,
        _stats: &[ModelStat],
        _candidates: &[String],
    ) -> Result<Option<String>, CrucibleError> {
        Ok(None)
    }
}

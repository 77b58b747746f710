//! Learning-recorder queue discipline: bounded, drop-oldest, never
//! blocking, degrading to empty stats when the service is down.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use common::*;
use crucible::error::CrucibleError;
use crucible::job::GeneratedFile;
use crucible::learning::{LearningRecorder, QUEUE_CAPACITY};
use crucible::memory::{
    FailureRecord, MemoryService, ModelStat, PerformanceRecord, PlanStep, SuccessPattern,
    TaskContext,
};

fn record(n: u32) -> PerformanceRecord {
    PerformanceRecord {
        model: format!("model-{n}"),
        task_type: "code_generation".to_string(),
        language: "go".to_string(),
        complexity: 1,
        outcome: "success".to_string(),
        score: 8.0,
        duration_ms: 10,
        iterations: n,
        error_type: None,
        keywords: vec![],
        context: None,
    }
}

#[tokio::test]
async fn worker_forwards_records_in_order() {
    let memory = Arc::new(ScriptedMemory::default());
    let recorder = LearningRecorder::spawn(memory.clone());

    recorder.record_attempt(record(1));
    recorder.record_attempt(record(2));
    recorder.record_attempt(record(3));

    // The worker drains once this task yields.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(
        memory.performance_models(),
        vec!["model-1", "model-2", "model-3"]
    );
    assert_eq!(recorder.dropped(), 0);
    assert_eq!(recorder.backlog(), 0);
}

#[tokio::test]
async fn overflow_drops_oldest_and_counts() {
    let memory = Arc::new(ScriptedMemory::default());
    let recorder = LearningRecorder::spawn(memory.clone());

    // Synchronous pushes give the worker no chance to drain, so the queue
    // bound applies deterministically.
    let total = QUEUE_CAPACITY + 44;
    for n in 0..total {
        recorder.record_attempt(record(n as u32));
    }
    assert_eq!(recorder.dropped(), 44);
    assert_eq!(recorder.backlog(), QUEUE_CAPACITY);

    // The oldest records are the ones that went missing.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let models = memory.performance_models();
    assert_eq!(models.len(), QUEUE_CAPACITY);
    assert_eq!(models.first().map(String::as_str), Some("model-44"));
}

/// Memory service that fails every call.
struct DownMemory;

#[async_trait]
impl MemoryService for DownMemory {
    async fn get_context(&self, _: &str, _: &str) -> Result<TaskContext, CrucibleError> {
        Err(CrucibleError::MemoryServiceUnavailable("down".into()))
    }
    async fn get_prompt(&self, _: &str) -> Result<Option<String>, CrucibleError> {
        Err(CrucibleError::MemoryServiceUnavailable("down".into()))
    }
    async fn generate_task_plan(&self, _: &str, _: &str) -> Result<Vec<PlanStep>, CrucibleError> {
        Err(CrucibleError::MemoryServiceUnavailable("down".into()))
    }
    async fn update_plan_status(&self, _: &str, _: usize, _: bool) -> Result<(), CrucibleError> {
        Err(CrucibleError::MemoryServiceUnavailable("down".into()))
    }
    async fn index_file(&self, _: &GeneratedFile) -> Result<(), CrucibleError> {
        Err(CrucibleError::MemoryServiceUnavailable("down".into()))
    }
    async fn get_project_symbols(&self, _: &str) -> Result<Vec<String>, CrucibleError> {
        Err(CrucibleError::MemoryServiceUnavailable("down".into()))
    }
    async fn validate_imports(
        &self,
        _: &[GeneratedFile],
        _: Option<&str>,
    ) -> Result<Vec<String>, CrucibleError> {
        Err(CrucibleError::MemoryServiceUnavailable("down".into()))
    }
    async fn store_qa(&self, _: &str, _: &str) -> Result<(), CrucibleError> {
        Err(CrucibleError::MemoryServiceUnavailable("down".into()))
    }
    async fn store_model_performance(&self, _: &PerformanceRecord) -> Result<(), CrucibleError> {
        Err(CrucibleError::MemoryServiceUnavailable("down".into()))
    }
    async fn store_successful_task(&self, _: &SuccessPattern) -> Result<(), CrucibleError> {
        Err(CrucibleError::MemoryServiceUnavailable("down".into()))
    }
    async fn store_task_failure(&self, _: &FailureRecord) -> Result<(), CrucibleError> {
        Err(CrucibleError::MemoryServiceUnavailable("down".into()))
    }
    async fn get_model_stats(&self, _: &str, _: &str) -> Result<Vec<ModelStat>, CrucibleError> {
        Err(CrucibleError::MemoryServiceUnavailable("down".into()))
    }
    async fn suggest_model(
        &self,
        _: &str,
        _: &[ModelStat],
        _: &[String],
    ) -> Result<Option<String>, CrucibleError> {
        Err(CrucibleError::MemoryServiceUnavailable("down".into()))
    }
}

#[tokio::test]
async fn unreachable_service_degrades_to_empty_stats() {
    let recorder = LearningRecorder::spawn(Arc::new(DownMemory));
    assert!(recorder.stats("go", "code_generation").await.is_empty());

    // Failed writes are logged and swallowed; the recorder stays usable.
    recorder.record_attempt(record(1));
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(recorder.backlog(), 0);
}

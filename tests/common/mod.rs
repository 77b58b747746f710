//! Scripted capabilities shared by the integration tests. The engine is
//! exercised end to end against these; no live backend is involved.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crucible::backend::{
    DiscoveredModel, GenerateOutcome, GenerateRequest, InferenceBackend, ResidentModel,
};
use crucible::config::{Config, GpuConfig, LimitsConfig};
use crucible::engine::EngineDeps;
use crucible::error::CrucibleError;
use crucible::job::GeneratedFile;
use crucible::manager::{JobManager, JobSnapshot};
use crucible::memory::{
    FailureRecord, MemoryService, ModelStat, PerformanceRecord, PlanStep, SuccessPattern,
    TaskContext,
};
use crucible::sandbox::NoopSandbox;

/// One scripted backend response.
pub enum Reply {
    /// Plain response text (file blocks or a verdict JSON).
    Text(String),
    Timeout,
    Malformed,
    /// Block until the request's cancellation token fires.
    Hang,
}

#[derive(Default)]
pub struct ScriptedBackend {
    /// When set, discovery endpoints fail as if every port were down.
    pub fail_lists: std::sync::atomic::AtomicBool,
    models: Vec<(String, f64)>,
    resident: Mutex<Vec<(String, f64)>>,
    /// Keyed scripts matched against the request prompt, checked first.
    keyed: Mutex<Vec<(String, VecDeque<Reply>)>>,
    /// Global FIFO fallback.
    replies: Mutex<VecDeque<Reply>>,
    /// Model names of every generate call, in order.
    calls: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn with_models(models: &[(&str, f64)]) -> Arc<Self> {
        Arc::new(Self {
            models: models
                .iter()
                .map(|(name, size)| (name.to_string(), *size))
                .collect(),
            ..Self::default()
        })
    }

    pub fn push_reply(&self, reply: Reply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    /// Queue replies consumed only by requests whose prompt contains `key`.
    pub fn script_for(&self, key: &str, replies: Vec<Reply>) {
        self.keyed
            .lock()
            .unwrap()
            .push((key.to_string(), replies.into()));
    }

    pub fn set_resident(&self, resident: &[(&str, f64)]) {
        *self.resident.lock().unwrap() = resident
            .iter()
            .map(|(name, size)| (name.to_string(), *size))
            .collect();
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn next_reply(&self, prompt: &str) -> Option<Reply> {
        let mut keyed = self.keyed.lock().unwrap();
        for (key, queue) in keyed.iter_mut() {
            if prompt.contains(key.as_str())
                && let Some(reply) = queue.pop_front()
            {
                return Some(reply);
            }
        }
        drop(keyed);
        self.replies.lock().unwrap().pop_front()
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    async fn list_models(&self, _port: u16) -> Result<Vec<DiscoveredModel>, CrucibleError> {
        if self.fail_lists.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(CrucibleError::RegistryUnavailable);
        }
        Ok(self
            .models
            .iter()
            .map(|(name, size)| DiscoveredModel {
                name: name.clone(),
                size_gb: *size,
            })
            .collect())
    }

    async fn list_running(&self, _port: u16) -> Result<Vec<ResidentModel>, CrucibleError> {
        if self.fail_lists.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(CrucibleError::RegistryUnavailable);
        }
        Ok(self
            .resident
            .lock()
            .unwrap()
            .iter()
            .map(|(name, size)| ResidentModel {
                name: name.clone(),
                resident_gb: *size,
            })
            .collect())
    }

    async fn generate(&self, req: &GenerateRequest) -> Result<GenerateOutcome, CrucibleError> {
        self.calls.lock().unwrap().push(req.model.clone());
        match self.next_reply(&req.prompt) {
            Some(Reply::Text(response)) => Ok(GenerateOutcome {
                response,
                total_duration_ms: 5,
                prompt_eval_count: 10,
                eval_count: 20,
            }),
            Some(Reply::Timeout) => Err(CrucibleError::BackendTimeout(1)),
            Some(Reply::Malformed) => Err(CrucibleError::BackendMalformed("scripted".into())),
            Some(Reply::Hang) => match &req.cancellation_token {
                Some(token) => {
                    token.cancelled().await;
                    Err(CrucibleError::Cancelled(1))
                }
                None => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Err(CrucibleError::BackendTimeout(60_000))
                }
            },
            None => Err(CrucibleError::BackendMalformed("script exhausted".into())),
        }
    }
}

/// Memory capability that records learning writes and serves canned stats.
#[derive(Default)]
pub struct ScriptedMemory {
    pub stats: Vec<ModelStat>,
    pub suggestion: Option<String>,
    pub performance: Mutex<Vec<PerformanceRecord>>,
    pub successes: Mutex<Vec<SuccessPattern>>,
    pub failures: Mutex<Vec<FailureRecord>>,
}

impl ScriptedMemory {
    pub fn performance_models(&self) -> Vec<String> {
        self.performance
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.model.clone())
            .collect()
    }

    pub fn performance_count(&self) -> usize {
        self.performance.lock().unwrap().len()
    }
}

#[async_trait]
impl MemoryService for ScriptedMemory {
    async fn get_context(&self, _task: &str, _language: &str) -> Result<TaskContext, CrucibleError> {
        Ok(TaskContext::default())
    }

    async fn get_prompt(&self, _name: &str) -> Result<Option<String>, CrucibleError> {
        Ok(None)
    }

    async fn generate_task_plan(
        &self,
        _task: &str,
        _language: &str,
    ) -> Result<Vec<PlanStep>, CrucibleError> {
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
        record: &PerformanceRecord,
    ) -> Result<(), CrucibleError> {
        self.performance.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn store_successful_task(&self, pattern: &SuccessPattern) -> Result<(), CrucibleError> {
        self.successes.lock().unwrap().push(pattern.clone());
        Ok(())
    }

    async fn store_task_failure(&self, record: &FailureRecord) -> Result<(), CrucibleError> {
        self.failures.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn get_model_stats(
        &self,
        _language: &str,
        _task_type: &str,
    ) -> Result<Vec<ModelStat>, CrucibleError> {
        Ok(self.stats.clone())
    }

    async fn suggest_model(
        &self,
        _task: &str,
        _stats: &[ModelStat],
        _candidates: &[String],
    ) -> Result<Option<String>, CrucibleError> {
        Ok(self.suggestion.clone())
    }
}

/// Model fixture shared by the scenario tests. Priorities put
/// deepseek-coder first among code generators, phi4 first among
/// validators.
pub fn fixture_models() -> Vec<(&'static str, f64)> {
    vec![
        ("deepseek-coder:16b", 16.0),
        ("qwen2.5-coder:14b", 9.0),
        ("phi4:14b", 9.0),
        ("qwen2.5:7b", 5.0),
    ]
}

/// Test configuration: single strategy, tight budgets, a real temp
/// workspace for persistence.
pub fn test_config(max_iterations: u32, pinned_vram: f64) -> Config {
    Config {
        gpu: GpuConfig {
            primary_model: "qwen2.5-coder:14b".to_string(),
            pinned_gpu_vram: pinned_vram,
            ..GpuConfig::default()
        },
        limits: LimitsConfig {
            max_iterations,
            ensemble_strategy: "single".to_string(),
            per_iteration_budget_secs: 30,
            concurrency: 4,
            ..LimitsConfig::default()
        },
        ..Config::default()
    }
}

pub fn make_deps(
    config: Config,
    backend: Arc<ScriptedBackend>,
    memory: Arc<ScriptedMemory>,
) -> Arc<EngineDeps> {
    EngineDeps::new(config, backend, memory, Arc::new(NoopSandbox))
}

/// A parseable generate response for a go factorial task.
pub fn go_factorial_reply() -> Reply {
    Reply::Text(
        "Here you go.\n\nFILE: factorial.go\n```go\npackage main\n\nfunc Factorial(n int) int {\n\tif n <= 1 {\n\t\treturn 1\n\t}\n\treturn n * Factorial(n-1)\n}\n```\n".to_string(),
    )
}

/// A generate response carrying an unguarded dereference the rule layer
/// flags.
pub fn flawed_endpoint_reply() -> Reply {
    Reply::Text(
        "FILE: users.ts\n```typescript\nexport function listUsers(req, res) {\n\tconst name = req.user!.name;\n\tres.json([name]);\n}\n```\n".to_string(),
    )
}

/// A clean fix for the flawed endpoint.
pub fn fixed_endpoint_reply() -> Reply {
    Reply::Text(
        "FILE: users.ts\n```typescript\nexport function listUsers(req, res) {\n\tif (req.user === undefined) {\n\t\treturn res.status(401).end();\n\t}\n\tres.json([req.user.name]);\n}\n```\n".to_string(),
    )
}

/// A validation verdict reply.
pub fn verdict_reply(score: f64, issues: &str, feedback: &str) -> Reply {
    Reply::Text(format!(
        "{{\"score\": {score}, \"issues\": [{issues}], \"feedback\": \"{feedback}\"}}"
    ))
}

/// Poll until the job reaches a terminal status or the deadline passes.
pub async fn wait_terminal(manager: &JobManager, id: &str, deadline: Duration) -> JobSnapshot {
    let start = std::time::Instant::now();
    loop {
        let snapshot = manager.status(id).await.expect("job exists");
        if snapshot.status.is_terminal() {
            return snapshot;
        }
        assert!(
            start.elapsed() < deadline,
            "job {id} did not reach a terminal status in {deadline:?}: {:?}",
            snapshot.status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Poll until a predicate over the snapshot holds.
pub async fn wait_until(
    manager: &JobManager,
    id: &str,
    deadline: Duration,
    predicate: impl Fn(&JobSnapshot) -> bool,
) -> JobSnapshot {
    let start = std::time::Instant::now();
    loop {
        let snapshot = manager.status(id).await.expect("job exists");
        if predicate(&snapshot) {
            return snapshot;
        }
        assert!(
            start.elapsed() < deadline,
            "condition not reached in {deadline:?} for job {id}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

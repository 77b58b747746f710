use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};

use crate::error::CrucibleError;
use crate::job::GeneratedFile;
use crate::memory::{
    FailureRecord, MemoryService, ModelStat, PerformanceRecord, PlanStep, SuccessPattern,
    TaskContext,
};

/// Per-call ceiling on memory-service round trips. The memory service is
/// never on a job's critical path for longer than this.
const CALL_TIMEOUT: Duration = Duration::from_secs(15);

/// JSON-RPC 2.0 adapter for the memory service. The wire format is a
/// dual-layer envelope: a `tools/call` request whose result carries the
/// real payload as JSON embedded in a text field. That envelope is a
/// transport detail; it never leaks past this module; the rest of the
/// engine exchanges typed records.
pub struct MemoryRpcClient {
    client: Client,
    base_url: String,
    next_id: AtomicU64,
}

impl MemoryRpcClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(CALL_TIMEOUT)
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            base_url: base_url.into(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Issue one `tools/call` and unwrap the dual-layer envelope down to
    /// the embedded payload. Non-JSON text payloads come back as a JSON
    /// string value.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, CrucibleError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": { "name": name, "arguments": arguments },
        });

        let url = format!("{}/call", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CrucibleError::MemoryServiceUnavailable(format!("{e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CrucibleError::MemoryServiceUnavailable(format!(
                "{name}: {status}"
            )));
        }

        let envelope: Value = response
            .json()
            .await
            .map_err(|e| CrucibleError::MemoryServiceUnavailable(format!("{name}: {e}")))?;

        if let Some(error) = envelope.get("error") {
            return Err(CrucibleError::MemoryServiceUnavailable(format!(
                "{name}: rpc error {error}"
            )));
        }

        // Envelope layer one: result.content[0].text
        let text = envelope
            .pointer("/result/content/0/text")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                CrucibleError::MemoryServiceUnavailable(format!("{name}: envelope missing text"))
            })?;

        // Envelope layer two: the text field holds the real JSON payload.
        Ok(serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())))
    }

    fn strings_at(payload: &Value, key: &str) -> Vec<String> {
        payload
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl MemoryService for MemoryRpcClient {
    async fn get_context(&self, task: &str, language: &str) -> Result<TaskContext, CrucibleError> {
        let payload = self
            .call_tool("get_context", json!({ "task": task, "language": language }))
            .await?;

        let mut context = TaskContext {
            similar_tasks: Self::strings_at(&payload, "similar_tasks"),
            lessons: Self::strings_at(&payload, "lessons"),
            symbols: Self::strings_at(&payload, "symbols"),
            design: payload
                .get("design")
                .and_then(Value::as_str)
                .map(str::to_string),
        };

        // Older service revisions expose these under separate tools.
        if context.similar_tasks.is_empty()
            && let Ok(extra) = self
                .call_tool("query_similar_tasks", json!({ "task": task }))
                .await
        {
            context.similar_tasks = Self::strings_at(&extra, "tasks");
        }
        if context.lessons.is_empty()
            && let Ok(extra) = self
                .call_tool("query_task_lessons", json!({ "task": task }))
                .await
        {
            context.lessons = Self::strings_at(&extra, "lessons");
        }
        if context.design.is_none()
            && let Ok(extra) = self.call_tool("design_get_brand", json!({})).await
        {
            context.design = extra
                .get("brand")
                .and_then(Value::as_str)
                .map(str::to_string);
        }

        Ok(context)
    }

    async fn get_prompt(&self, name: &str) -> Result<Option<String>, CrucibleError> {
        let payload = self
            .call_tool("manage_prompts", json!({ "action": "get", "name": name }))
            .await?;
        Ok(match payload {
            Value::String(text) if !text.is_empty() => Some(text),
            other => other
                .get("prompt")
                .and_then(Value::as_str)
                .filter(|p| !p.is_empty())
                .map(str::to_string),
        })
    }

    async fn generate_task_plan(
        &self,
        task: &str,
        language: &str,
    ) -> Result<Vec<PlanStep>, CrucibleError> {
        let payload = self
            .call_tool(
                "generate_task_plan",
                json!({ "task": task, "language": language }),
            )
            .await?;
        let steps: Vec<PlanStep> = payload
            .get("steps")
            .cloned()
            .and_then(|steps| serde_json::from_value(steps).ok())
            .unwrap_or_default();
        if steps.is_empty() {
            return Err(CrucibleError::TaskPlanMissing);
        }
        Ok(steps)
    }

    async fn update_plan_status(
        &self,
        job_id: &str,
        step: usize,
        completed: bool,
    ) -> Result<(), CrucibleError> {
        self.call_tool(
            "update_plan_status",
            json!({ "job_id": job_id, "step": step, "completed": completed }),
        )
        .await
        .map(|_| ())
    }

    async fn index_file(&self, file: &GeneratedFile) -> Result<(), CrucibleError> {
        self.call_tool(
            "index",
            json!({
                "path": file.path,
                "content": file.content,
                "language": file.language,
            }),
        )
        .await
        .map(|_| ())
    }

    async fn get_project_symbols(&self, workspace: &str) -> Result<Vec<String>, CrucibleError> {
        let payload = self
            .call_tool("get_project_symbols", json!({ "workspace": workspace }))
            .await?;
        Ok(Self::strings_at(&payload, "symbols"))
    }

    async fn validate_imports(
        &self,
        files: &[GeneratedFile],
        workspace: Option<&str>,
    ) -> Result<Vec<String>, CrucibleError> {
        let file_payload: Vec<Value> = files
            .iter()
            .map(|f| json!({ "path": f.path, "content": f.content, "language": f.language }))
            .collect();
        let payload = self
            .call_tool(
                "validate_imports",
                json!({ "files": file_payload, "workspace": workspace }),
            )
            .await?;
        Ok(Self::strings_at(&payload, "invalid"))
    }

    async fn store_qa(&self, question: &str, answer: &str) -> Result<(), CrucibleError> {
        self.call_tool("store_qa", json!({ "question": question, "answer": answer }))
            .await
            .map(|_| ())
    }

    async fn store_model_performance(
        &self,
        record: &PerformanceRecord,
    ) -> Result<(), CrucibleError> {
        self.call_tool(
            "store_model_performance",
            serde_json::to_value(record)
                .map_err(|e| CrucibleError::MemoryServiceUnavailable(format!("{e}")))?,
        )
        .await
        .map(|_| ())
    }

    async fn store_successful_task(&self, pattern: &SuccessPattern) -> Result<(), CrucibleError> {
        self.call_tool(
            "store_successful_task",
            serde_json::to_value(pattern)
                .map_err(|e| CrucibleError::MemoryServiceUnavailable(format!("{e}")))?,
        )
        .await
        .map(|_| ())
    }

    async fn store_task_failure(&self, record: &FailureRecord) -> Result<(), CrucibleError> {
        self.call_tool(
            "store_task_failure",
            serde_json::to_value(record)
                .map_err(|e| CrucibleError::MemoryServiceUnavailable(format!("{e}")))?,
        )
        .await
        .map(|_| ())
    }

    async fn get_model_stats(
        &self,
        language: &str,
        task_type: &str,
    ) -> Result<Vec<ModelStat>, CrucibleError> {
        let payload = self
            .call_tool(
                "get_model_stats",
                json!({ "language": language, "task_type": task_type }),
            )
            .await?;
        let mut stats: Vec<ModelStat> = payload
            .get("stats")
            .cloned()
            .and_then(|stats| serde_json::from_value(stats).ok())
            .unwrap_or_default();
        stats.sort_by(|a, b| {
            b.success_rate
                .partial_cmp(&a.success_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(stats)
    }

    async fn suggest_model(
        &self,
        task: &str,
        stats: &[ModelStat],
        candidates: &[String],
    ) -> Result<Option<String>, CrucibleError> {
        let payload = self
            .call_tool(
                "feedback",
                json!({
                    "action": "suggest_model",
                    "task": task,
                    "stats": stats,
                    "candidates": candidates,
                }),
            )
            .await?;
        Ok(payload
            .get("model")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .map(str::to_string))
    }
}

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::backend::{GenerateRequest, InferenceBackend};
use crate::error::CrucibleError;
use crate::job::{
    AttemptOutcome, AttemptPhase, AttemptRecord, GeneratedFile, IssueKind, JobInput, Severity,
    ValidationIssue,
};
use crate::memory::{MemoryService, TaskContext};
use crate::parse::parse_generated_files;
use crate::prompts::{FIX_PROMPT, GENERATE_PROMPT, PromptRegistry};
use crate::registry::ModelPurpose;
use crate::selector::{ModelSelector, SelectionRole};

/// Ceiling on fire-and-forget indexing of one attempt's files.
const INDEX_DEADLINE: Duration = Duration::from_secs(30);

/// A failed attempt, with the responsible model when one was selected
/// before the failure. The loop uses the attribution to grow the
/// exclusion set.
pub struct GenerationFailure {
    pub error: CrucibleError,
    pub model: Option<String>,
}

impl GenerationFailure {
    fn unselected(error: CrucibleError) -> Self {
        Self { error, model: None }
    }
}

/// Result of one successful generate attempt.
pub struct GenerationResult {
    pub files: Vec<GeneratedFile>,
    pub model: String,
    /// True when the selector fell back to the primary model because every
    /// candidate was excluded.
    pub selection_fallback: bool,
    /// Import problems surfaced as validation issues, severity high.
    pub import_issues: Vec<ValidationIssue>,
    pub record: AttemptRecord,
}

/// One generate (or fix) attempt: gather context, pick a model, compose
/// the prompt, call the backend, parse the file set, check imports and
/// index the result.
pub struct Generator {
    backend: Arc<dyn InferenceBackend>,
    selector: Arc<ModelSelector>,
    memory: Arc<dyn MemoryService>,
    prompts: Arc<PromptRegistry>,
    idle_timeout: Duration,
}

impl Generator {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        selector: Arc<ModelSelector>,
        memory: Arc<dyn MemoryService>,
        prompts: Arc<PromptRegistry>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            selector,
            memory,
            prompts,
            idle_timeout,
        }
    }

    pub async fn generate(
        &self,
        input: &JobInput,
        iteration: u32,
        feedback: Option<&str>,
        excluded: &HashSet<String>,
        deadline: Instant,
        cancel: CancellationToken,
    ) -> Result<GenerationResult, GenerationFailure> {
        let started_at = Utc::now();

        // Context is strictly additive; a dead memory service costs
        // recall, never the attempt.
        let context = match self.memory.get_context(&input.task, &input.language).await {
            Ok(context) => context,
            Err(e) => {
                tracing::warn!(job_id = %input.id, "context fetch failed: {e}");
                TaskContext::default()
            }
        };

        let selection = self
            .selector
            .select(
                ModelPurpose::CodeGeneration,
                &input.task,
                &input.language,
                excluded,
                &input.fingerprint,
                SelectionRole::Primary,
            )
            .await
            .map_err(GenerationFailure::unselected)?;
        let model_name = selection.model.name.clone();
        let attributed = |error: CrucibleError| GenerationFailure {
            error,
            model: Some(model_name.clone()),
        };

        let prompt_name = if feedback.is_some() {
            FIX_PROMPT
        } else {
            GENERATE_PROMPT
        };
        let system = self
            .prompts
            .fetch(prompt_name)
            .await
            .map_err(GenerationFailure::unselected)?;
        let prompt = compose_prompt(input, &context, feedback);

        let request = GenerateRequest {
            model: selection.model.name.clone(),
            port: selection.port,
            prompt,
            system: Some(system),
            num_ctx: Some(8192),
            deadline,
            idle_timeout: self.idle_timeout,
            cancellation_token: Some(cancel),
        };

        let outcome = self.backend.generate(&request).await.map_err(&attributed)?;
        let files = parse_generated_files(&outcome.response, &input.language, iteration)
            .map_err(&attributed)?;

        let import_issues = self.check_imports(input, &files).await;

        // Indexing is fire-and-forget, bounded so a wedged memory service
        // cannot pin the task alive past the job.
        for file in &files {
            let memory = self.memory.clone();
            let file = file.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    tokio::time::timeout(INDEX_DEADLINE, memory.index_file(&file)).await
                {
                    tracing::debug!(path = %file.path, "file indexing timed out: {e}");
                }
            });
        }

        let record = AttemptRecord {
            job_id: input.id.clone(),
            iteration,
            phase: if feedback.is_some() {
                AttemptPhase::Fix
            } else {
                AttemptPhase::Generate
            },
            models: vec![selection.model.name.clone()],
            started_at,
            finished_at: Utc::now(),
            outcome: AttemptOutcome::Success,
            score: 0.0,
            error_kind: None,
            language: input.language.clone(),
            fingerprint: input.fingerprint.clone(),
        };

        Ok(GenerationResult {
            files,
            model: selection.model.name,
            selection_fallback: selection.fallback,
            import_issues,
            record,
        })
    }

    async fn check_imports(
        &self,
        input: &JobInput,
        files: &[GeneratedFile],
    ) -> Vec<ValidationIssue> {
        match self
            .memory
            .validate_imports(files, input.workspace.as_deref())
            .await
        {
            Ok(invalid) => invalid
                .into_iter()
                .map(|import| ValidationIssue {
                    severity: Severity::High,
                    kind: IssueKind::Import,
                    message: format!("unresolved import: {import}"),
                    file: None,
                    line: None,
                    suggested_fix: Some(
                        "import only symbols that exist in the project".to_string(),
                    ),
                })
                .collect(),
            Err(e) => {
                tracing::warn!(job_id = %input.id, "import validation unavailable: {e}");
                Vec::new()
            }
        }
    }
}

fn compose_prompt(input: &JobInput, context: &TaskContext, feedback: Option<&str>) -> String {
    let mut prompt = format!(
        "Task: {}\nTarget language: {}\n",
        input.task, input.language
    );

    if !context.similar_tasks.is_empty() {
        prompt.push_str("\nSimilar prior tasks:\n");
        for task in &context.similar_tasks {
            prompt.push_str(&format!("- {task}\n"));
        }
    }
    if !context.lessons.is_empty() {
        prompt.push_str("\nLessons learned:\n");
        for lesson in &context.lessons {
            prompt.push_str(&format!("- {lesson}\n"));
        }
    }
    if !context.symbols.is_empty() {
        prompt.push_str("\nProject symbols available for import:\n");
        for symbol in context.symbols.iter().take(100) {
            prompt.push_str(&format!("- {symbol}\n"));
        }
    }
    if let Some(ref design) = context.design {
        prompt.push_str(&format!("\nDesign context:\n{design}\n"));
    }
    if let Some(feedback) = feedback {
        prompt.push_str(&format!(
            "\nPrevious attempt feedback — fix every point below and re-emit all files:\n{feedback}\n"
        ));
    }

    prompt
}

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::engine::EngineDeps;
use crate::ensemble::{EnsembleContext, EnsembleStrategy};
use crate::error::CrucibleError;
use crate::generator::GenerationResult;
use crate::job::{
    AttemptOutcome, AttemptPhase, ChangeType, GeneratedFile, IssueKind, JobInput, Phase, Severity,
    ValidationIssue,
};
use crate::manager::JobUpdater;
use crate::memory::{FailureRecord, PerformanceRecord, SuccessPattern};
use crate::registry::ModelPurpose;
use crate::sandbox::image_for_language;
use crate::validator::{self, ValidationReport};

/// Ceiling on one sandbox build check.
const SANDBOX_TIMEOUT: Duration = Duration::from_secs(120);

/// Minimum ensemble confidence required to accept.
const MIN_CONFIDENCE: f64 = 0.7;

/// Drive one job through the generate -> validate -> fix state machine
/// until acceptance, cancellation, or budget exhaustion. All job state
/// flows through the updater; after the job's token fires every write is
/// refused there, so this function simply returns on cancellation.
pub async fn run_job(
    deps: Arc<EngineDeps>,
    input: JobInput,
    updater: JobUpdater,
    cancel: CancellationToken,
) {
    let per_iteration = Duration::from_secs(deps.config.limits.per_iteration_budget_secs.max(1));
    let job_deadline = Instant::now() + per_iteration * input.max_iterations;

    let strategy = EnsembleStrategy::parse(&deps.config.limits.ensemble_strategy)
        .unwrap_or(EnsembleStrategy::Adaptive);

    updater.set_running().await;

    // Planning. A missing plan is recovered with a single-step default.
    updater.begin_phase(Phase::Planning, None).await;
    updater
        .set_progress(0, "planning – building task plan".to_string(), 0)
        .await;
    let plan_len = match deps
        .memory
        .generate_task_plan(&input.task, &input.language)
        .await
    {
        Ok(steps) => steps.len(),
        Err(e) => {
            updater
                .push_warning(format!(
                    "task plan unavailable ({}) — using a single-step plan",
                    e.kind()
                ))
                .await;
            1
        }
    };
    tracing::debug!(job_id = %input.id, steps = plan_len, "plan ready");
    updater.close_phase(None, None).await;

    let mut excluded: HashSet<String> = HashSet::new();
    let mut reset_used = false;
    let mut feedback: Option<String> = None;
    let mut previous_paths: HashSet<String> = HashSet::new();
    let mut last_failure: Option<(String, String)> = None;
    let mut iteration: u32 = 1;

    while iteration <= input.max_iterations {
        if cancel.is_cancelled() {
            return;
        }

        let progress = ((100 * iteration) / input.max_iterations).min(99) as u8;
        let fixing = feedback.is_some();
        let gen_phase = if fixing { Phase::Fixing } else { Phase::Generating };
        let phase_word = if fixing { "fixing" } else { "generating" };

        // Exhaustion check: when every candidate is excluded, the set
        // resets exactly once and this attempt runs on the primary model
        // (the selector's fallback; the attempt still spends an iteration).
        // A second exhaustion is terminal.
        let mut pending_reset = false;
        if let Ok(candidates) = deps.registry.list(ModelPurpose::CodeGeneration).await
            && !candidates.is_empty()
            && candidates.iter().all(|c| excluded.contains(&c.name))
        {
            if reset_used {
                record_job_failure(&deps, &input, iteration, "models_exhausted", &cancel);
                updater
                    .fail(
                        "models_exhausted",
                        CrucibleError::ModelsExhausted.user_message(),
                    )
                    .await;
                return;
            }
            reset_used = true;
            pending_reset = true;
            updater
                .push_warning(format!(
                    "iteration {iteration}: all candidates excluded — exclusion set reset, retrying with the primary model"
                ))
                .await;
        }

        updater.begin_phase(gen_phase, None).await;
        updater
            .set_progress(
                progress,
                format!(
                    "{phase_word} – iteration {iteration}/{}",
                    input.max_iterations
                ),
                iteration,
            )
            .await;

        let attempt_deadline = (Instant::now() + per_iteration).min(job_deadline);

        let generated = deps
            .generator
            .generate(
                &input,
                iteration,
                feedback.as_deref(),
                &excluded,
                attempt_deadline,
                cancel.child_token(),
            )
            .await;

        // The reset takes effect after the fallback attempt, so the next
        // iteration selects from the full candidate pool again.
        if pending_reset {
            excluded.clear();
        }

        let mut result = match generated {
            Ok(result) => result,
            Err(failure) => {
                if cancel.is_cancelled() || matches!(failure.error, CrucibleError::Cancelled(_)) {
                    return;
                }
                record_failed_attempt(
                    &deps,
                    &input,
                    iteration,
                    fixing,
                    failure.model.clone(),
                    &failure.error,
                    &cancel,
                );
                updater.close_phase(failure.model.clone(), None).await;

                if failure.error.is_terminal()
                    || matches!(failure.error, CrucibleError::NoCandidate { .. })
                {
                    let kind = failure.error.kind();
                    record_job_failure(&deps, &input, iteration, kind, &cancel);
                    updater.fail(kind, failure.error.user_message()).await;
                    return;
                }

                // Retryable: exclude the responsible model and spend an
                // iteration.
                if let Some(model) = failure.model {
                    excluded.insert(model);
                }
                last_failure = Some((
                    failure.error.kind().to_string(),
                    failure.error.user_message(),
                ));
                iteration += 1;
                continue;
            }
        };

        // Fix attempts re-emit files; anything seen before is a modification.
        for file in &mut result.files {
            if previous_paths.contains(&file.path) {
                file.change_type = ChangeType::Modified;
            }
        }
        previous_paths.extend(result.files.iter().map(|f| f.path.clone()));

        record_attempt(&deps, &result.record, &cancel);
        updater
            .close_phase(Some(result.model.clone()), None)
            .await;

        if cancel.is_cancelled() {
            return;
        }

        // Validating.
        updater
            .begin_phase(Phase::Validating, Some(result.model.clone()))
            .await;
        updater
            .set_progress(
                progress,
                format!("validating – iteration {iteration}/{}", input.max_iterations),
                iteration,
            )
            .await;

        let report = match validate(
            &deps,
            &input,
            &result,
            strategy,
            iteration,
            &excluded,
            attempt_deadline,
            &cancel,
            &updater,
        )
        .await
        {
            Ok(report) => report,
            Err(e) => {
                if cancel.is_cancelled() || matches!(e, CrucibleError::Cancelled(_)) {
                    return;
                }
                record_failed_attempt(&deps, &input, iteration, fixing, None, &e, &cancel);
                updater.close_phase(None, None).await;

                if deps.config.sandbox.strict && matches!(e, CrucibleError::SandboxFailed(_)) {
                    record_job_failure(&deps, &input, iteration, e.kind(), &cancel);
                    updater.fail(e.kind(), e.user_message()).await;
                    return;
                }

                updater
                    .push_warning(format!(
                        "iteration {iteration}: validation unavailable ({})",
                        e.kind()
                    ))
                    .await;
                last_failure = Some((e.kind().to_string(), e.user_message()));
                iteration += 1;
                continue;
            }
        };

        record_validation_attempt(&deps, &input, iteration, &report, &cancel);
        updater
            .close_phase(Some(report.models.join("+")), Some(report.score))
            .await;

        if cancel.is_cancelled() {
            return;
        }

        if report.passed {
            accept(&deps, &input, &result, &report, &updater, iteration, &cancel).await;
            return;
        }

        // Fixing: carry the feedback forward; from the midpoint of the
        // budget the just-used generator model is also excluded so the
        // next attempt diversifies.
        feedback = Some(render_feedback(&report));
        if iteration * 2 >= input.max_iterations {
            excluded.insert(result.model.clone());
        }
        last_failure = Some((
            "validation_failed".to_string(),
            CrucibleError::ValidationFailed {
                score: report.score,
            }
            .user_message(),
        ));
        iteration += 1;
    }

    // Budget exhausted.
    let (kind, message) = last_failure.unwrap_or_else(|| {
        (
            "validation_failed".to_string(),
            "iteration budget exhausted".to_string(),
        )
    });
    record_job_failure(&deps, &input, input.max_iterations, &kind, &cancel);
    updater.fail(&kind, message).await;
}

/// Rule layer, ensemble LLM layer, import issues and the optional sandbox
/// check, folded into one report.
#[allow(clippy::too_many_arguments)]
async fn validate(
    deps: &Arc<EngineDeps>,
    input: &JobInput,
    result: &GenerationResult,
    strategy: EnsembleStrategy,
    iteration: u32,
    excluded: &HashSet<String>,
    deadline: Instant,
    cancel: &CancellationToken,
    updater: &JobUpdater,
) -> Result<ValidationReport, CrucibleError> {
    let rule_issues = validator::scan(&result.files);
    let rule_score = validator::score_issues(&rule_issues);

    let ctx = EnsembleContext {
        task: &input.task,
        language: &input.language,
        iteration,
        max_iterations: input.max_iterations,
        excluded,
        keywords: &input.fingerprint,
        deadline,
        cancel: cancel.child_token(),
    };
    let outcome = deps.ensemble.validate(strategy, &result.files, &ctx).await?;
    for warning in &outcome.warnings {
        updater.push_warning(format!("iteration {iteration}: {warning}")).await;
    }

    let resolved = match strategy {
        EnsembleStrategy::Adaptive => {
            EnsembleStrategy::resolve_adaptive(iteration, input.max_iterations)
        }
        other => other,
    };
    let optimistic = resolved == EnsembleStrategy::Optimistic;
    let score = validator::merge_scores(optimistic, rule_score, outcome.score);

    let mut issues = rule_issues;
    issues.extend(outcome.issues);
    issues.extend(result.import_issues.clone());

    // Optional sandbox build check. Failures demote to issues unless the
    // deployment runs strict.
    if let Some(issue) = sandbox_check(deps, input, &result.files).await {
        if deps.config.sandbox.strict && issue.severity == Severity::Critical {
            return Err(CrucibleError::SandboxFailed(issue.message));
        }
        issues.push(issue);
    }

    let has_critical = issues.iter().any(|i| i.severity == Severity::Critical);
    let passed = score >= input.min_score && outcome.confidence >= MIN_CONFIDENCE && !has_critical;

    let feedback = outcome.feedback;
    Ok(ValidationReport {
        score,
        confidence: outcome.confidence,
        issues,
        feedback,
        models: outcome.members.iter().map(|m| m.model.clone()).collect(),
        passed,
    })
}

/// Materialize the attempt into a scratch directory inside the workspace
/// and run the container build check. Absent workspace or unsupported
/// language skips the check entirely.
async fn sandbox_check(
    deps: &Arc<EngineDeps>,
    input: &JobInput,
    files: &[GeneratedFile],
) -> Option<ValidationIssue> {
    let workspace = input.workspace.as_ref()?;
    image_for_language(&input.language)?;

    let scratch = PathBuf::from(workspace)
        .join(".crucible")
        .join(format!("check-{}", input.id));
    for file in files {
        let path = scratch.join(&file.path);
        if let Some(parent) = path.parent()
            && tokio::fs::create_dir_all(parent).await.is_err()
        {
            return None;
        }
        if tokio::fs::write(&path, file.content.as_bytes()).await.is_err() {
            return None;
        }
    }

    let check = deps
        .sandbox
        .check_build(&scratch, &input.language, SANDBOX_TIMEOUT)
        .await;
    let _ = tokio::fs::remove_dir_all(&scratch).await;

    match check {
        Ok(check) if check.ok => None,
        Ok(check) => Some(ValidationIssue {
            severity: Severity::Critical,
            kind: IssueKind::DockerBuild,
            message: format!("build check failed: {}", check.detail),
            file: None,
            line: None,
            suggested_fix: Some("make the generated files compile".to_string()),
        }),
        Err(e) => Some(ValidationIssue {
            severity: Severity::Medium,
            kind: IssueKind::DockerRun,
            message: format!("sandbox unavailable: {}", e.user_message()),
            file: None,
            line: None,
            suggested_fix: None,
        }),
    }
}

async fn accept(
    deps: &Arc<EngineDeps>,
    input: &JobInput,
    result: &GenerationResult,
    report: &ValidationReport,
    updater: &JobUpdater,
    iteration: u32,
    cancel: &CancellationToken,
) {
    let base = input
        .workspace
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    // Persistence failure never loses the in-memory result.
    let output_dir = match crate::output::persist_files(&base, &input.task, &result.files).await {
        Ok(dir) => Some(dir.display().to_string()),
        Err(e) => {
            tracing::warn!(job_id = %input.id, "result persistence failed: {e}");
            updater
                .push_warning(format!("result persistence failed: {e}"))
                .await;
            None
        }
    };

    if !cancel.is_cancelled() {
        deps.learning.record_success(SuccessPattern {
            keywords: input.fingerprint.clone(),
            approach: format!(
                "accepted at iteration {iteration} with score {:.1} from {}",
                report.score, result.model
            ),
            language: input.language.clone(),
            files: result.files.iter().map(|f| f.path.clone()).collect(),
        });
        // Plan and Q/A bookkeeping are best-effort.
        let memory = deps.memory.clone();
        let job_id = input.id.clone();
        let task = input.task.clone();
        let answer = result
            .files
            .iter()
            .map(|f| f.path.clone())
            .collect::<Vec<_>>()
            .join(", ");
        tokio::spawn(async move {
            let _ = memory.update_plan_status(&job_id, 0, true).await;
            let _ = memory.store_qa(&task, &answer).await;
        });
    }

    updater
        .complete(result.files.clone(), output_dir, report.score)
        .await;
}

fn render_feedback(report: &ValidationReport) -> String {
    let mut feedback = format!("score {:.1}\n", report.score);
    if !report.feedback.is_empty() {
        feedback.push_str(&report.feedback);
        feedback.push('\n');
    }
    for issue in report.issues.iter().take(20) {
        let location = match (&issue.file, issue.line) {
            (Some(file), Some(line)) => format!(" ({file}:{line})"),
            (Some(file), None) => format!(" ({file})"),
            _ => String::new(),
        };
        feedback.push_str(&format!(
            "- [{:?}] {}{location}\n",
            issue.severity, issue.message
        ));
        if let Some(ref fix) = issue.suggested_fix {
            feedback.push_str(&format!("  fix: {fix}\n"));
        }
    }
    feedback
}

fn record_attempt(
    deps: &Arc<EngineDeps>,
    record: &crate::job::AttemptRecord,
    cancel: &CancellationToken,
) {
    // A cancelled job never produces a new attempt record.
    if cancel.is_cancelled() {
        return;
    }
    let duration_ms = (record.finished_at - record.started_at)
        .num_milliseconds()
        .max(0) as u64;
    deps.learning.record_attempt(PerformanceRecord {
        model: record.models.first().cloned().unwrap_or_default(),
        task_type: "code_generation".to_string(),
        language: record.language.clone(),
        complexity: record.fingerprint.len() as u32,
        outcome: outcome_tag(record.outcome).to_string(),
        score: record.score,
        duration_ms,
        iterations: record.iteration,
        error_type: record.error_kind.clone(),
        keywords: record.fingerprint.clone(),
        context: None,
    });
}

fn record_failed_attempt(
    deps: &Arc<EngineDeps>,
    input: &JobInput,
    iteration: u32,
    fixing: bool,
    model: Option<String>,
    error: &CrucibleError,
    cancel: &CancellationToken,
) {
    if cancel.is_cancelled() {
        return;
    }
    let phase = if fixing {
        AttemptPhase::Fix
    } else {
        AttemptPhase::Generate
    };
    tracing::warn!(
        job_id = %input.id,
        iteration,
        phase = ?phase,
        "attempt failed: {error}"
    );
    deps.learning.record_attempt(PerformanceRecord {
        model: model.unwrap_or_default(),
        task_type: "code_generation".to_string(),
        language: input.language.clone(),
        complexity: input.fingerprint.len() as u32,
        outcome: "failure".to_string(),
        score: 0.0,
        duration_ms: 0,
        iterations: iteration,
        error_type: Some(error.kind().to_string()),
        keywords: input.fingerprint.clone(),
        context: None,
    });
}

fn record_validation_attempt(
    deps: &Arc<EngineDeps>,
    input: &JobInput,
    iteration: u32,
    report: &ValidationReport,
    cancel: &CancellationToken,
) {
    if cancel.is_cancelled() {
        return;
    }
    deps.learning.record_attempt(PerformanceRecord {
        model: report.models.join("+"),
        task_type: "validation".to_string(),
        language: input.language.clone(),
        complexity: input.fingerprint.len() as u32,
        outcome: outcome_tag(if report.passed {
            AttemptOutcome::Success
        } else {
            AttemptOutcome::Partial
        })
        .to_string(),
        score: report.score,
        duration_ms: 0,
        iterations: iteration,
        error_type: None,
        keywords: input.fingerprint.clone(),
        context: None,
    });
}

fn record_job_failure(
    deps: &Arc<EngineDeps>,
    input: &JobInput,
    iterations: u32,
    kind: &str,
    cancel: &CancellationToken,
) {
    if cancel.is_cancelled() {
        return;
    }
    deps.learning.record_failure(FailureRecord {
        keywords: input.fingerprint.clone(),
        language: input.language.clone(),
        error_kind: kind.to_string(),
        iterations,
    });
}

fn outcome_tag(outcome: AttemptOutcome) -> &'static str {
    match outcome {
        AttemptOutcome::Success => "success",
        AttemptOutcome::Partial => "partial",
        AttemptOutcome::Failure => "failure",
    }
}

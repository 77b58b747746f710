use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tokio::task::{Id as TaskId, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::backend::InferenceBackend;
use crate::error::CrucibleError;
use crate::job::{GeneratedFile, IssueKind, ValidationIssue};
use crate::registry::ModelPurpose;
use crate::selector::{ModelSelector, Selection, SelectionRole};
use crate::validator::{LlmVerdict, Validator};
use crate::vram::VramBudget;

/// Validation strategy tags. `Adaptive` resolves to one of the concrete
/// strategies from the iteration position before any model is selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsembleStrategy {
    Single,
    Sequential,
    Parallel,
    Specialized,
    Pessimistic,
    Optimistic,
    Adaptive,
}

impl EnsembleStrategy {
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "single" => Some(Self::Single),
            "sequential" => Some(Self::Sequential),
            "parallel" => Some(Self::Parallel),
            "specialized" => Some(Self::Specialized),
            "pessimistic" => Some(Self::Pessimistic),
            "optimistic" => Some(Self::Optimistic),
            "adaptive" => Some(Self::Adaptive),
            _ => None,
        }
    }

    /// Adaptive schedule: cheap early, thorough late, exhaustive at the
    /// final iteration.
    pub fn resolve_adaptive(iteration: u32, max_iterations: u32) -> Self {
        if f64::from(iteration) <= 0.7 * f64::from(max_iterations) {
            Self::Single
        } else if iteration < max_iterations {
            Self::Sequential
        } else {
            Self::Parallel
        }
    }
}

/// Member agreement: 1 - stddev(scores)/5, clamped to [0,1]. A single
/// member measures no disagreement and scores 1.0.
pub fn confidence_from_scores(scores: &[f64]) -> f64 {
    if scores.len() <= 1 {
        return 1.0;
    }
    let n = scores.len() as f64;
    let mean = scores.iter().sum::<f64>() / n;
    let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
    (1.0 - variance.sqrt() / 5.0).clamp(0.0, 1.0)
}

type IssueKey = (IssueKind, Option<String>, Option<u32>);

#[derive(Debug, Clone)]
pub struct MemberReport {
    pub model: String,
    pub score: f64,
    pub issue_count: usize,
    pub duration_ms: u64,
    pub warm: bool,
}

#[derive(Debug, Clone)]
pub struct EnsembleOutcome {
    pub members: Vec<MemberReport>,
    pub score: f64,
    pub confidence: f64,
    pub issues: Vec<ValidationIssue>,
    pub feedback: String,
    /// Degradation and member-failure events, surfaced on the job.
    pub warnings: Vec<String>,
}

/// Inputs shared by every strategy.
pub struct EnsembleContext<'a> {
    pub task: &'a str,
    pub language: &'a str,
    pub iteration: u32,
    pub max_iterations: u32,
    pub excluded: &'a HashSet<String>,
    pub keywords: &'a [String],
    pub deadline: Instant,
    pub cancel: CancellationToken,
}

/// Runs multi-model validations under one of seven strategies and folds
/// the member verdicts into a score plus a confidence.
pub struct EnsembleCoordinator {
    selector: Arc<ModelSelector>,
    validator: Arc<Validator>,
    backend: Arc<dyn InferenceBackend>,
    vram: Arc<VramBudget>,
}

impl EnsembleCoordinator {
    pub fn new(
        selector: Arc<ModelSelector>,
        validator: Arc<Validator>,
        backend: Arc<dyn InferenceBackend>,
        vram: Arc<VramBudget>,
    ) -> Self {
        Self {
            selector,
            validator,
            backend,
            vram,
        }
    }

    pub async fn validate(
        &self,
        strategy: EnsembleStrategy,
        files: &[GeneratedFile],
        ctx: &EnsembleContext<'_>,
    ) -> Result<EnsembleOutcome, CrucibleError> {
        let strategy = match strategy {
            EnsembleStrategy::Adaptive => {
                EnsembleStrategy::resolve_adaptive(ctx.iteration, ctx.max_iterations)
            }
            other => other,
        };

        let mut warnings = Vec::new();
        let warm = self.resident_models().await;

        // Stats hard gate over the validation pool: gated models are
        // withheld from every member set and the events land on the job.
        let gate = self
            .selector
            .hard_gate(ModelPurpose::Validation, ctx.language)
            .await;
        warnings.extend(gate.events.iter().cloned());
        let mut blocked: HashSet<String> = ctx.excluded.clone();
        blocked.extend(gate.blocked.iter().cloned());

        match strategy {
            EnsembleStrategy::Single => self.run_single(files, ctx, &blocked, &warm, warnings).await,
            EnsembleStrategy::Sequential => {
                self.run_sequential(files, ctx, &blocked, &warm, warnings).await
            }
            EnsembleStrategy::Parallel => {
                let members = self.pick_members(ctx, &blocked, 3).await;
                if members.len() < 3 {
                    warnings.push(format!(
                        "parallel ensemble degraded to sequential: only {} disjoint validators",
                        members.len()
                    ));
                    return self.run_sequential(files, ctx, &blocked, &warm, warnings).await;
                }
                self.run_parallel(files, ctx, members, &warm, warnings).await
            }
            EnsembleStrategy::Specialized => {
                self.run_specialized(files, ctx, &blocked, &warm, warnings).await
            }
            EnsembleStrategy::Pessimistic | EnsembleStrategy::Optimistic => {
                let members = self.pick_members(ctx, &blocked, 2).await;
                if members.len() < 2 {
                    warnings.push(
                        "two-model ensemble degraded to single: no disjoint second model"
                            .to_string(),
                    );
                    return self.run_single(files, ctx, &blocked, &warm, warnings).await;
                }
                let pessimistic = strategy == EnsembleStrategy::Pessimistic;
                self.run_two_model(files, ctx, members, pessimistic, &warm, warnings)
                    .await
            }
            EnsembleStrategy::Adaptive => unreachable!("adaptive resolved above"),
        }
    }

    async fn run_single(
        &self,
        files: &[GeneratedFile],
        ctx: &EnsembleContext<'_>,
        blocked: &HashSet<String>,
        warm: &HashSet<String>,
        warnings: Vec<String>,
    ) -> Result<EnsembleOutcome, CrucibleError> {
        let selection = self
            .select_member(ctx, blocked, SelectionRole::Primary)
            .await
            .ok_or_else(|| CrucibleError::NoCandidate {
                purpose: "validation".to_string(),
            })?;
        let (report, verdict) = self.run_member(files, &selection, ctx, warm).await?;
        Ok(EnsembleOutcome {
            score: verdict.score,
            confidence: 1.0,
            issues: verdict.issues,
            feedback: verdict.feedback,
            members: vec![report],
            warnings,
        })
    }

    /// Fast model first; borderline scores buy a second opinion from a
    /// different tier; strong disagreement buys a tiebreaker and the
    /// median wins.
    async fn run_sequential(
        &self,
        files: &[GeneratedFile],
        ctx: &EnsembleContext<'_>,
        blocked: &HashSet<String>,
        warm: &HashSet<String>,
        mut warnings: Vec<String>,
    ) -> Result<EnsembleOutcome, CrucibleError> {
        let mut used: HashSet<String> = blocked.clone();

        let first = self
            .select_member(ctx, &used, SelectionRole::Primary)
            .await
            .ok_or_else(|| CrucibleError::NoCandidate {
                purpose: "validation".to_string(),
            })?;
        used.insert(first.model.name.clone());
        let (report1, verdict1) = self.run_member(files, &first, ctx, warm).await?;

        if !(4.0..=8.0).contains(&verdict1.score) {
            return Ok(EnsembleOutcome {
                score: verdict1.score,
                confidence: 1.0,
                issues: verdict1.issues,
                feedback: verdict1.feedback,
                members: vec![report1],
                warnings,
            });
        }

        let Some(second) = self
            .select_member(ctx, &used, SelectionRole::SecondOpinion)
            .await
        else {
            warnings.push("borderline score but no disjoint second opinion".to_string());
            return Ok(EnsembleOutcome {
                score: verdict1.score,
                confidence: 1.0,
                issues: verdict1.issues,
                feedback: verdict1.feedback,
                members: vec![report1],
                warnings,
            });
        };
        used.insert(second.model.name.clone());
        let (report2, verdict2) = self.run_member(files, &second, ctx, warm).await?;

        let mut members = vec![report1, report2];
        let mut issues = verdict1.issues;
        issues.extend(verdict2.issues);
        let feedback = join_feedback(&[verdict1.feedback.as_str(), verdict2.feedback.as_str()]);

        let score = if (verdict1.score - verdict2.score).abs() > 2.0 {
            match self.select_member(ctx, &used, SelectionRole::Primary).await {
                Some(tiebreaker) => {
                    let (report3, verdict3) = self.run_member(files, &tiebreaker, ctx, warm).await?;
                    members.push(report3);
                    issues.extend(verdict3.issues);
                    median(&[verdict1.score, verdict2.score, verdict3.score])
                }
                None => {
                    warnings.push("no tiebreaker available — using the mean".to_string());
                    (verdict1.score + verdict2.score) / 2.0
                }
            }
        } else {
            (verdict1.score + verdict2.score) / 2.0
        };

        let scores: Vec<f64> = members.iter().map(|m| m.score).collect();
        Ok(EnsembleOutcome {
            score,
            confidence: confidence_from_scores(&scores),
            issues,
            feedback,
            members,
            warnings,
        })
    }

    /// Three disjoint members in parallel tasks under one cancellation
    /// token: mean score, quorum-filtered issues.
    async fn run_parallel(
        &self,
        files: &[GeneratedFile],
        ctx: &EnsembleContext<'_>,
        members: Vec<Selection>,
        warm: &HashSet<String>,
        mut warnings: Vec<String>,
    ) -> Result<EnsembleOutcome, CrucibleError> {
        let shared_files: Arc<Vec<GeneratedFile>> = Arc::new(files.to_vec());
        let member_cancel = ctx.cancel.child_token();

        let mut set = JoinSet::new();
        let mut task_models: HashMap<TaskId, String> = HashMap::new();

        for selection in members {
            let validator = self.validator.clone();
            let files = shared_files.clone();
            let cancel = member_cancel.clone();
            let deadline = ctx.deadline;
            let model = selection.model.name.clone();
            let port = selection.port;
            let warm_bit = warm.contains(&model);

            let handle = set.spawn(async move {
                let start = Instant::now();
                let result = validator
                    .llm_validate(&files, &model, port, deadline, cancel)
                    .await;
                let duration_ms = start.elapsed().as_millis() as u64;
                (model, result, duration_ms, warm_bit)
            });
            task_models.insert(handle.id(), selection.model.name.clone());
        }

        let mut reports = Vec::new();
        let mut verdicts: Vec<LlmVerdict> = Vec::new();
        let mut first_error: Option<CrucibleError> = None;

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((model, Ok(verdict), duration_ms, warm_bit)) => {
                    reports.push(MemberReport {
                        model,
                        score: verdict.score,
                        issue_count: verdict.issues.len(),
                        duration_ms,
                        warm: warm_bit,
                    });
                    verdicts.push(verdict);
                }
                Ok((model, Err(e), _, _)) => {
                    if matches!(e, CrucibleError::Cancelled(_)) {
                        member_cancel.cancel();
                    }
                    warnings.push(format!("ensemble member {model} failed: {}", e.kind()));
                    first_error.get_or_insert(e);
                }
                // Attribute panics to the owning model via the task id.
                Err(join_err) if join_err.is_panic() => {
                    let model = task_models
                        .get(&join_err.id())
                        .cloned()
                        .unwrap_or_else(|| "unknown".to_string());
                    tracing::error!(model = %model, "ensemble member task panicked: {join_err}");
                    warnings.push(format!("ensemble member {model} panicked"));
                }
                Err(_) => {}
            }
        }

        if ctx.cancel.is_cancelled() {
            return Err(CrucibleError::Cancelled(0));
        }
        if reports.is_empty() {
            return Err(first_error.unwrap_or(CrucibleError::NoCandidate {
                purpose: "validation".to_string(),
            }));
        }

        let scores: Vec<f64> = reports.iter().map(|m| m.score).collect();
        let score = scores.iter().sum::<f64>() / scores.len() as f64;

        // Quorum filter: an issue survives only when at least two members
        // report the same (kind, file, line) triple.
        let mut counts: HashMap<IssueKey, (usize, ValidationIssue)> = HashMap::new();
        for verdict in &verdicts {
            let mut seen_here = HashSet::new();
            for issue in &verdict.issues {
                let key = (issue.kind, issue.file.clone(), issue.line);
                if !seen_here.insert(key.clone()) {
                    continue;
                }
                counts
                    .entry(key)
                    .and_modify(|(n, _)| *n += 1)
                    .or_insert((1, issue.clone()));
            }
        }
        let issues: Vec<ValidationIssue> = counts
            .into_values()
            .filter(|(n, _)| *n >= 2)
            .map(|(_, issue)| issue)
            .collect();

        let feedback_parts: Vec<&str> = verdicts.iter().map(|v| v.feedback.as_str()).collect();

        Ok(EnsembleOutcome {
            score,
            confidence: confidence_from_scores(&scores),
            issues,
            feedback: join_feedback(&feedback_parts),
            members: reports,
            warnings,
        })
    }

    /// Issue categories map to experts: security checks go to the highest
    /// priority validator, architecture to the largest code-generation
    /// model, everything else to the fastest validator.
    async fn run_specialized(
        &self,
        files: &[GeneratedFile],
        ctx: &EnsembleContext<'_>,
        blocked: &HashSet<String>,
        warm: &HashSet<String>,
        mut warnings: Vec<String>,
    ) -> Result<EnsembleOutcome, CrucibleError> {
        let mut used: HashSet<String> = blocked.clone();
        let mut experts: Vec<Selection> = Vec::new();

        // Security expert: the selector's first validation pick is the
        // highest-priority candidate.
        if let Some(expert) = self.select_member(ctx, &used, SelectionRole::Primary).await {
            used.insert(expert.model.name.clone());
            experts.push(expert);
        }
        // Architecture expert: the largest code-generation model, wanted
        // only for multi-file results.
        if files.len() > 1
            && let Some(expert) = self.largest_code_model(&used).await
        {
            used.insert(expert.model.name.clone());
            experts.push(expert);
        }
        // General expert: the fastest remaining validator.
        if let Some(expert) = self
            .select_member(ctx, &used, SelectionRole::Primary)
            .await
        {
            used.insert(expert.model.name.clone());
            experts.push(expert);
        }

        if experts.is_empty() {
            return Err(CrucibleError::NoCandidate {
                purpose: "validation".to_string(),
            });
        }
        if experts.len() == 1 {
            warnings.push("specialized ensemble degraded to single expert".to_string());
        }

        self.run_parallel(files, ctx, experts, warm, warnings).await
    }

    async fn run_two_model(
        &self,
        files: &[GeneratedFile],
        ctx: &EnsembleContext<'_>,
        members: Vec<Selection>,
        pessimistic: bool,
        warm: &HashSet<String>,
        warnings: Vec<String>,
    ) -> Result<EnsembleOutcome, CrucibleError> {
        let mut outcome = self.run_parallel(files, ctx, members, warm, warnings).await?;
        let scores: Vec<f64> = outcome.members.iter().map(|m| m.score).collect();
        outcome.score = if pessimistic {
            scores.iter().cloned().fold(f64::INFINITY, f64::min)
        } else {
            scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
        };
        Ok(outcome)
    }

    /// Pick up to `count` disjoint members from the non-blocked pool
    /// (caller exclusions plus the stats hard gate). A primary-fallback
    /// selection means the candidate pool is spent; the same model must
    /// never appear twice in one member set.
    async fn pick_members(
        &self,
        ctx: &EnsembleContext<'_>,
        blocked: &HashSet<String>,
        count: usize,
    ) -> Vec<Selection> {
        let mut used: HashSet<String> = blocked.clone();
        let mut members = Vec::new();
        for index in 0..count {
            let role = if index == 0 {
                SelectionRole::Primary
            } else {
                SelectionRole::SecondOpinion
            };
            let Some(selection) = self.select_member(ctx, &used, role).await else {
                break;
            };
            used.insert(selection.model.name.clone());
            members.push(selection);
        }
        members
    }

    async fn select_member(
        &self,
        ctx: &EnsembleContext<'_>,
        excluded: &HashSet<String>,
        role: SelectionRole,
    ) -> Option<Selection> {
        match self
            .selector
            .select(
                ModelPurpose::Validation,
                ctx.task,
                ctx.language,
                excluded,
                ctx.keywords,
                role,
            )
            .await
        {
            Ok(selection) if !selection.fallback => Some(selection),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!("member selection failed: {e}");
                None
            }
        }
    }

    async fn largest_code_model(&self, excluded: &HashSet<String>) -> Option<Selection> {
        let candidates = self
            .selector
            .registry()
            .list(ModelPurpose::CodeGeneration)
            .await
            .ok()?;
        let mut candidates: Vec<_> = candidates
            .into_iter()
            .filter(|c| !excluded.contains(&c.name))
            .collect();
        candidates.sort_by(|a, b| {
            b.size_gb
                .partial_cmp(&a.size_gb)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for model in candidates {
            if let Some(device) = self.vram.placement_for(model.size_gb).await {
                let port = self.vram.port_of(device)?;
                return Some(Selection {
                    model,
                    device,
                    port,
                    fallback: false,
                });
            }
        }
        None
    }

    async fn run_member(
        &self,
        files: &[GeneratedFile],
        selection: &Selection,
        ctx: &EnsembleContext<'_>,
        warm: &HashSet<String>,
    ) -> Result<(MemberReport, LlmVerdict), CrucibleError> {
        let start = Instant::now();
        let verdict = self
            .validator
            .llm_validate(
                files,
                &selection.model.name,
                selection.port,
                ctx.deadline,
                ctx.cancel.child_token(),
            )
            .await?;
        let report = MemberReport {
            model: selection.model.name.clone(),
            score: verdict.score,
            issue_count: verdict.issues.len(),
            duration_ms: start.elapsed().as_millis() as u64,
            warm: warm.contains(&selection.model.name),
        };
        Ok((report, verdict))
    }

    async fn resident_models(&self) -> HashSet<String> {
        let mut resident = HashSet::new();
        for device in self.vram.devices() {
            if let Ok(models) = self.backend.list_running(device.port).await {
                resident.extend(models.into_iter().map(|m| m.name));
            }
        }
        resident
    }
}

fn median(scores: &[f64]) -> f64 {
    let mut sorted = scores.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    sorted[sorted.len() / 2]
}

fn join_feedback(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|p| !p.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join("\n---\n")
}

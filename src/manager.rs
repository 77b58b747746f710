use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::engine::EngineDeps;
use crate::error::CrucibleError;
use crate::iteration;
use crate::job::{
    GeneratedFile, Job, JobId, JobInput, JobStatus, Phase, PhaseEntry, task_fingerprint,
};

/// Language assumed when a submission names none.
const DEFAULT_LANGUAGE: &str = "python";

/// Submissions larger than this are rejected up front.
const MAX_TASK_BYTES: usize = 2 * 1024 * 1024;

/// Sweep cadence for expired terminal jobs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(600);

/// Point-in-time copy of a job for the query API. Reads are linearizable
/// per job: a snapshot reflects every transition completed before the
/// read returned, and two reads between mutations are identical.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub id: JobId,
    pub task: String,
    pub language: String,
    pub status: JobStatus,
    pub status_line: String,
    pub progress: u8,
    pub iteration: u32,
    pub max_iterations: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub timeline: Vec<PhaseEntry>,
    pub warnings: Vec<String>,
    pub result: Option<Vec<GeneratedFile>>,
    pub error: Option<(String, String)>,
    pub output_dir: Option<String>,
}

struct ManagerInner {
    jobs: RwLock<HashMap<JobId, Job>>,
    deps: Arc<EngineDeps>,
    admission: Arc<Semaphore>,
    ttl: Duration,
}

/// In-process registry of live jobs. Owns every `Job` exclusively; the
/// iteration loop mutates only through a `JobUpdater`, which refuses
/// writes once the job's token has fired or a terminal status is set.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<ManagerInner>,
}

impl JobManager {
    pub fn new(deps: Arc<EngineDeps>) -> Self {
        let ttl = Duration::from_secs(deps.config.limits.job_ttl_hours * 3600);
        let inner = Arc::new(ManagerInner {
            jobs: RwLock::new(HashMap::new()),
            admission: Arc::new(Semaphore::new(deps.config.limits.concurrency.max(1))),
            deps,
            ttl,
        });

        let sweeper = inner.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                sweep_expired(&sweeper).await;
            }
        });

        Self { inner }
    }

    /// Admit a job and return its id immediately; the iteration loop runs
    /// on a background task gated by the admission semaphore.
    pub async fn start(
        &self,
        task: String,
        language: Option<String>,
        max_iterations: Option<u32>,
        workspace: Option<String>,
    ) -> Result<JobId, CrucibleError> {
        let task = task.trim().to_string();
        if task.is_empty() {
            return Err(CrucibleError::Configuration("task must not be empty".to_string()));
        }
        if task.len() > MAX_TASK_BYTES {
            return Err(CrucibleError::Configuration(format!(
                "task exceeds {MAX_TASK_BYTES} bytes"
            )));
        }

        let limits = &self.inner.deps.config.limits;
        let max_iterations = max_iterations
            .unwrap_or(limits.max_iterations)
            .clamp(1, limits.max_iterations.max(1));
        let language = language
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string())
            .to_lowercase();

        let id = uuid::Uuid::new_v4().simple().to_string();
        let now = Utc::now();
        let cancel = CancellationToken::new();

        let job = Job {
            id: id.clone(),
            task: task.clone(),
            language: language.clone(),
            workspace: workspace.clone(),
            max_iterations,
            min_score: limits.min_acceptance_score,
            created_at: now,
            started_at: now,
            finished_at: None,
            status: JobStatus::Queued,
            status_line: "queued – waiting for a slot".to_string(),
            progress: 0,
            iteration: 0,
            timeline: Vec::new(),
            warnings: Vec::new(),
            result: None,
            error: None,
            output_dir: None,
            cancel: cancel.clone(),
        };
        self.inner.jobs.write().await.insert(id.clone(), job);

        let input = JobInput {
            id: id.clone(),
            fingerprint: task_fingerprint(&task),
            task,
            language,
            workspace,
            max_iterations,
            min_score: limits.min_acceptance_score,
        };
        let updater = JobUpdater {
            id: id.clone(),
            inner: self.inner.clone(),
            cancel: cancel.clone(),
        };
        let deps = self.inner.deps.clone();
        let admission = self.inner.admission.clone();

        tokio::spawn(async move {
            let Ok(_permit) = admission.acquire_owned().await else {
                return;
            };
            if cancel.is_cancelled() {
                return;
            }
            iteration::run_job(deps, input, updater, cancel).await;
        });

        Ok(id)
    }

    pub async fn status(&self, id: &str) -> Option<JobSnapshot> {
        self.inner.jobs.read().await.get(id).map(snapshot)
    }

    pub async fn list(&self) -> Vec<JobSnapshot> {
        let jobs = self.inner.jobs.read().await;
        let mut all: Vec<JobSnapshot> = jobs.values().map(snapshot).collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    /// Idempotent cancel. The terminal mutation happens before the token
    /// fires, under the same write lock; once the token is observable no
    /// further state change on the job is possible.
    pub async fn cancel(&self, id: &str) -> Option<JobStatus> {
        let mut jobs = self.inner.jobs.write().await;
        let job = jobs.get_mut(id)?;
        if job.status.is_terminal() {
            return Some(job.status);
        }

        job.status = JobStatus::Cancelled;
        job.status_line = "cancelled – stopped by request".to_string();
        job.finished_at = Some(Utc::now());
        close_open_phase(&mut job.timeline, None, None);
        job.timeline.push(PhaseEntry {
            phase: Phase::Cancelled,
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            model: None,
            score: None,
        });
        job.cancel.cancel();
        Some(JobStatus::Cancelled)
    }
}

fn snapshot(job: &Job) -> JobSnapshot {
    JobSnapshot {
        id: job.id.clone(),
        task: job.task.clone(),
        language: job.language.clone(),
        status: job.status,
        status_line: job.status_line.clone(),
        progress: job.progress,
        iteration: job.iteration,
        max_iterations: job.max_iterations,
        created_at: job.created_at,
        started_at: job.started_at,
        finished_at: job.finished_at,
        timeline: job.timeline.clone(),
        warnings: job.warnings.clone(),
        result: job.result.clone(),
        error: job.error.clone(),
        output_dir: job.output_dir.clone(),
    }
}

async fn sweep_expired(inner: &ManagerInner) {
    let cutoff = Utc::now()
        - chrono::Duration::from_std(inner.ttl).unwrap_or_else(|_| chrono::Duration::hours(24));
    let mut jobs = inner.jobs.write().await;
    let before = jobs.len();
    jobs.retain(|_, job| {
        !(job.status.is_terminal() && job.finished_at.is_some_and(|at| at < cutoff))
    });
    let removed = before - jobs.len();
    if removed > 0 {
        tracing::info!(removed, "swept expired terminal jobs");
    }
}

fn close_open_phase(
    timeline: &mut [PhaseEntry],
    model: Option<String>,
    score: Option<f64>,
) {
    if let Some(last) = timeline.last_mut()
        && last.finished_at.is_none()
    {
        last.finished_at = Some(Utc::now());
        if model.is_some() {
            last.model = model;
        }
        if score.is_some() {
            last.score = score;
        }
    }
}

/// Write handle the iteration loop mutates its job through. Every method
/// is a no-op once the job's token has fired or the job is terminal.
pub struct JobUpdater {
    id: JobId,
    inner: Arc<ManagerInner>,
    cancel: CancellationToken,
}

impl JobUpdater {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn with_job(&self, mutate: impl FnOnce(&mut Job)) {
        if self.cancel.is_cancelled() {
            return;
        }
        let mut jobs = self.inner.jobs.write().await;
        if let Some(job) = jobs.get_mut(&self.id) {
            // Re-check under the lock: cancel() mutates before firing.
            if job.cancel.is_cancelled() || job.status.is_terminal() {
                return;
            }
            mutate(job);
        }
    }

    pub async fn set_running(&self) {
        self.with_job(|job| {
            if job.status.can_transition_to(JobStatus::Running) {
                job.status = JobStatus::Running;
            }
        })
        .await;
    }

    pub async fn begin_phase(&self, phase: Phase, model: Option<String>) {
        self.with_job(|job| {
            close_open_phase(&mut job.timeline, None, None);
            job.timeline.push(PhaseEntry {
                phase,
                started_at: Utc::now(),
                finished_at: None,
                model,
                score: None,
            });
        })
        .await;
    }

    pub async fn close_phase(&self, model: Option<String>, score: Option<f64>) {
        self.with_job(|job| close_open_phase(&mut job.timeline, model, score))
            .await;
    }

    pub async fn set_progress(&self, progress: u8, status_line: String, iteration: u32) {
        self.with_job(|job| {
            job.progress = progress.min(99);
            job.status_line = status_line;
            job.iteration = iteration;
        })
        .await;
    }

    pub async fn push_warning(&self, warning: String) {
        self.with_job(|job| job.warnings.push(warning)).await;
    }

    pub async fn complete(
        &self,
        files: Vec<GeneratedFile>,
        output_dir: Option<String>,
        score: f64,
    ) {
        self.with_job(|job| {
            if !job.status.can_transition_to(JobStatus::Completed) {
                return;
            }
            job.status = JobStatus::Completed;
            job.status_line = "completed – accepted".to_string();
            job.progress = 100;
            job.finished_at = Some(Utc::now());
            job.result = Some(files);
            job.output_dir = output_dir;
            close_open_phase(&mut job.timeline, None, None);
            job.timeline.push(PhaseEntry {
                phase: Phase::Accept,
                started_at: Utc::now(),
                finished_at: Some(Utc::now()),
                model: None,
                score: Some(score),
            });
        })
        .await;
    }

    pub async fn fail(&self, kind: &str, message: String) {
        self.with_job(|job| {
            if !job.status.can_transition_to(JobStatus::Failed) {
                return;
            }
            job.status = JobStatus::Failed;
            job.status_line = format!("failed – {kind}");
            job.finished_at = Some(Utc::now());
            job.error = Some((kind.to_string(), message));
            close_open_phase(&mut job.timeline, None, None);
            job.timeline.push(PhaseEntry {
                phase: Phase::Failed,
                started_at: Utc::now(),
                finished_at: Some(Utc::now()),
                model: None,
                score: None,
            });
        })
        .await;
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Opaque job identifier, 8-32 chars.
pub type JobId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Statuses only move forward; terminal statuses are immutable.
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Queued => matches!(next, Self::Running | Self::Failed | Self::Cancelled),
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

/// Phase tags for the append-only job timeline. The last entry of a
/// terminal job is always one of Accept, Cancelled, Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Generating,
    Validating,
    Fixing,
    Accept,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseEntry {
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptPhase {
    Generate,
    Validate,
    Fix,
    Ensemble,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Success,
    Partial,
    Failure,
}

/// One pass of generate or validate within an iteration. Append-only;
/// forwarded to the learning recorder and discarded when the job ends.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub job_id: JobId,
    /// 1-based iteration number.
    pub iteration: u32,
    pub phase: AttemptPhase,
    pub models: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    /// Score in [0, 10].
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    pub language: String,
    /// Normalized task keywords.
    pub fingerprint: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Created,
    Modified,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeneratedFile {
    /// Relative path, unique within a job's final result.
    pub path: String,
    pub content: String,
    pub language: String,
    pub change_type: ChangeType,
    /// Iteration that produced this file.
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    NullCheck,
    ErrorHandling,
    Async,
    Disposal,
    SqlInjection,
    Secret,
    Style,
    Design,
    Import,
    DockerBuild,
    DockerRun,
    Other,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub kind: IssueKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
}

/// A live job. Owned exclusively by the manager; every other component
/// works from an input snapshot and reports back through the updater.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub task: String,
    pub language: String,
    pub workspace: Option<String>,
    pub max_iterations: u32,
    pub min_score: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    /// "<phase> – <activity>" string parsed by external monitors.
    pub status_line: String,
    /// 0-100, clamped to 99 until accept.
    pub progress: u8,
    pub iteration: u32,
    pub timeline: Vec<PhaseEntry>,
    pub warnings: Vec<String>,
    pub result: Option<Vec<GeneratedFile>>,
    /// (taxonomy kind, sanitized message).
    pub error: Option<(String, String)>,
    /// Where the accepted result was persisted, when persistence succeeded.
    pub output_dir: Option<String>,
    pub cancel: CancellationToken,
}

/// Immutable inputs the iteration loop works from.
#[derive(Debug, Clone)]
pub struct JobInput {
    pub id: JobId,
    pub task: String,
    pub language: String,
    pub workspace: Option<String>,
    pub max_iterations: u32,
    pub min_score: f64,
    pub fingerprint: Vec<String>,
}

/// Normalize a task description into fingerprint keywords: lowercase
/// alphanumeric words of length >= 3, order-preserving, deduplicated,
/// capped at 16.
pub fn task_fingerprint(task: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut keywords = Vec::new();
    for word in task
        .to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
    {
        if word.len() < 3 || STOPWORDS.contains(&word) {
            continue;
        }
        if seen.insert(word.to_string()) {
            keywords.push(word.to_string());
        }
        if keywords.len() == 16 {
            break;
        }
    }
    keywords
}

const STOPWORDS: &[&str] = &[
    "the", "that", "and", "for", "with", "this", "from", "into", "which", "should", "would",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_only_move_forward() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Cancelled.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Queued));
    }

    #[test]
    fn fingerprint_normalizes_and_dedupes() {
        let fp = task_fingerprint("Write a function that returns the factorial of N in go");
        assert!(fp.contains(&"function".to_string()));
        assert!(fp.contains(&"factorial".to_string()));
        assert!(!fp.contains(&"the".to_string()));
        assert!(!fp.contains(&"a".to_string()));

        let fp = task_fingerprint("REST endpoint endpoint ENDPOINT");
        assert_eq!(fp.iter().filter(|k| *k == "endpoint").count(), 1);
    }
}

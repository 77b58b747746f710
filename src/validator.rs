use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::backend::{GenerateRequest, InferenceBackend};
use crate::error::CrucibleError;
use crate::job::{GeneratedFile, IssueKind, Severity, ValidationIssue};
use crate::prompts::{PromptRegistry, VALIDATE_PROMPT};

/// A seeded validation rule. Deterministic and independent of model
/// availability; the rule layer runs even when every backend is down.
pub struct Rule {
    pub name: &'static str,
    pub kind: IssueKind,
    pub severity: Severity,
    pub message: &'static str,
    pub suggested_fix: &'static str,
    hit: fn(&str) -> bool,
}

/// The seeded rule list. Checks are line-level substring heuristics: cheap,
/// deterministic, and language-tolerant.
pub fn seeded_rules() -> &'static [Rule] {
    const RULES: &[Rule] = &[
        Rule {
            name: "null-check",
            kind: IssueKind::NullCheck,
            severity: Severity::High,
            message: "possible unguarded dereference",
            suggested_fix: "guard the dereference behind a null/None check",
            hit: |line| {
                line.contains("!.")
                    || line.contains(".Value.")
                    || line.contains(".get().")
                    || line.contains(".unwrap().")
            },
        },
        Rule {
            name: "error-handling",
            kind: IssueKind::ErrorHandling,
            severity: Severity::High,
            message: "error swallowed or crash on failure",
            suggested_fix: "handle or propagate the error instead of ignoring it",
            hit: |line| {
                let compact: String = line.split_whitespace().collect();
                (compact.contains("catch{}") || compact.contains("catch(Exception){}"))
                    || compact.contains("except:pass")
                    || line.trim_end().ends_with(".unwrap();")
            },
        },
        Rule {
            name: "async-pattern",
            kind: IssueKind::Async,
            severity: Severity::Medium,
            message: "blocking or fire-and-forget async usage",
            suggested_fix: "await the operation and propagate its result",
            hit: |line| {
                line.contains("async void") || line.contains(".Result;") || line.contains(".Wait()")
            },
        },
        Rule {
            name: "resource-disposal",
            kind: IssueKind::Disposal,
            severity: Severity::Medium,
            message: "resource opened without a scoped disposal",
            suggested_fix: "wrap the resource in using/with/defer so it is released",
            hit: |line| {
                (line.contains("new FileStream") && !line.contains("using"))
                    || (line.contains("File.Open(") && !line.contains("using"))
                    || (line.trim_start().starts_with("open(") && !line.contains("with "))
            },
        },
        Rule {
            name: "security-sql",
            kind: IssueKind::SqlInjection,
            severity: Severity::Critical,
            message: "SQL assembled from interpolated input",
            suggested_fix: "use a parameterized query",
            hit: |line| {
                let upper = line.to_uppercase();
                let sql = ["SELECT ", "INSERT ", "UPDATE ", "DELETE "]
                    .iter()
                    .any(|kw| upper.contains(kw));
                sql && (line.contains("\" +")
                    || line.contains("+ \"")
                    || line.contains("${")
                    || line.contains("format!(")
                    || line.contains("f\"")
                    || line.contains("string.Format"))
            },
        },
        Rule {
            name: "security-secrets",
            kind: IssueKind::Secret,
            severity: Severity::Critical,
            message: "credential committed as a literal",
            suggested_fix: "read the credential from configuration or environment",
            hit: |line| {
                if line.contains("AKIA") {
                    return true;
                }
                let lower = line.to_lowercase();
                let named = ["password", "api_key", "apikey", "secret_key", "auth_token"]
                    .iter()
                    .any(|n| lower.contains(n));
                named
                    && lower.contains('=')
                    && (lower.contains("=\"") || lower.contains("= \"") || lower.contains("='"))
            },
        },
    ];
    RULES
}

/// Run the seeded rule layer over a file set.
pub fn scan(files: &[GeneratedFile]) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    for file in files {
        for (index, line) in file.content.lines().enumerate() {
            for rule in seeded_rules() {
                if (rule.hit)(line) {
                    issues.push(ValidationIssue {
                        severity: rule.severity,
                        kind: rule.kind,
                        message: rule.message.to_string(),
                        file: Some(file.path.clone()),
                        line: Some(index as u32 + 1),
                        suggested_fix: Some(rule.suggested_fix.to_string()),
                    });
                }
            }
        }
    }
    issues
}

/// Score a set of issues: start at 10, deduct by severity, clamp to [0,10].
pub fn score_issues(issues: &[ValidationIssue]) -> f64 {
    let deduction: f64 = issues
        .iter()
        .map(|issue| match issue.severity {
            Severity::Critical => 3.0,
            Severity::High => 2.0,
            Severity::Medium => 1.0,
            Severity::Low => 0.5,
        })
        .sum();
    (10.0 - deduction).clamp(0.0, 10.0)
}

/// Merge the rule score and the model score. Optimistic strategies take
/// the best view; everything else takes the worst.
pub fn merge_scores(optimistic: bool, rule_score: f64, llm_score: f64) -> f64 {
    if optimistic {
        rule_score.max(llm_score)
    } else {
        rule_score.min(llm_score)
    }
}

/// One model's validation verdict.
#[derive(Debug, Clone)]
pub struct LlmVerdict {
    pub score: f64,
    pub issues: Vec<ValidationIssue>,
    pub feedback: String,
}

/// The combined validation result an iteration decides on.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub score: f64,
    pub confidence: f64,
    pub issues: Vec<ValidationIssue>,
    pub feedback: String,
    pub models: Vec<String>,
    pub passed: bool,
}

/// The LLM validation layer: renders the file set plus the rule catalog
/// into a prompt and parses the scored verdict back out.
pub struct Validator {
    backend: Arc<dyn InferenceBackend>,
    prompts: Arc<PromptRegistry>,
    idle_timeout: std::time::Duration,
}

impl Validator {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        prompts: Arc<PromptRegistry>,
        idle_timeout: std::time::Duration,
    ) -> Self {
        Self {
            backend,
            prompts,
            idle_timeout,
        }
    }

    pub async fn llm_validate(
        &self,
        files: &[GeneratedFile],
        model: &str,
        port: u16,
        deadline: Instant,
        cancel: CancellationToken,
    ) -> Result<LlmVerdict, CrucibleError> {
        let system = self.prompts.fetch(VALIDATE_PROMPT).await?;
        let prompt = render_validation_prompt(files);

        let request = GenerateRequest {
            model: model.to_string(),
            port,
            prompt,
            system: Some(system),
            num_ctx: Some(16384),
            deadline,
            idle_timeout: self.idle_timeout,
            cancellation_token: Some(cancel),
        };

        let outcome = self.backend.generate(&request).await?;
        match parse_verdict(&outcome.response) {
            Some(verdict) => Ok(verdict),
            None => {
                // One retry on an unparseable verdict, then it counts as
                // a failure.
                tracing::warn!(model, "unparseable validation verdict, retrying once");
                let outcome = self.backend.generate(&request).await?;
                parse_verdict(&outcome.response).ok_or_else(|| {
                    CrucibleError::BackendMalformed("validation verdict".to_string())
                })
            }
        }
    }
}

fn render_validation_prompt(files: &[GeneratedFile]) -> String {
    let mut prompt = String::from("Review the following files.\n\nRule catalog:\n");
    for rule in seeded_rules() {
        prompt.push_str(&format!(
            "- {} ({:?}): {}\n",
            rule.name, rule.severity, rule.message
        ));
    }
    for file in files {
        prompt.push_str(&format!("\nFILE: {}\n```{}\n", file.path, file.language));
        prompt.push_str(&file.content);
        prompt.push_str("```\n");
    }
    prompt
}

/// Extract the first JSON object from the response and read the verdict
/// out of it, tolerating unknown severities and kinds.
pub fn parse_verdict(response: &str) -> Option<LlmVerdict> {
    let start = response.find('{')?;
    let end = response.rfind('}')?;
    if end <= start {
        return None;
    }
    let payload: Value = serde_json::from_str(&response[start..=end]).ok()?;

    let score = payload.get("score")?.as_f64()?.clamp(0.0, 10.0);
    let feedback = payload
        .get("feedback")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let issues = payload
        .get("issues")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(parse_issue).collect())
        .unwrap_or_default();

    Some(LlmVerdict {
        score,
        issues,
        feedback,
    })
}

fn parse_issue(value: &Value) -> Option<ValidationIssue> {
    let message = value.get("message").and_then(Value::as_str)?.to_string();
    Some(ValidationIssue {
        severity: parse_severity(value.get("severity").and_then(Value::as_str).unwrap_or("")),
        kind: parse_kind(value.get("kind").and_then(Value::as_str).unwrap_or("")),
        message,
        file: value
            .get("file")
            .and_then(Value::as_str)
            .map(str::to_string),
        line: value
            .get("line")
            .and_then(Value::as_u64)
            .map(|line| line as u32),
        suggested_fix: value
            .get("suggestion")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

fn parse_severity(tag: &str) -> Severity {
    match tag.to_lowercase().as_str() {
        "critical" => Severity::Critical,
        "high" => Severity::High,
        "low" => Severity::Low,
        _ => Severity::Medium,
    }
}

fn parse_kind(tag: &str) -> IssueKind {
    match tag.to_lowercase().replace('-', "_").as_str() {
        "null_check" => IssueKind::NullCheck,
        "error_handling" => IssueKind::ErrorHandling,
        "async" | "async_pattern" => IssueKind::Async,
        "disposal" | "resource_disposal" => IssueKind::Disposal,
        "sql_injection" | "security_sql" => IssueKind::SqlInjection,
        "secret" | "security_secrets" => IssueKind::Secret,
        "style" => IssueKind::Style,
        "design" => IssueKind::Design,
        "import" => IssueKind::Import,
        _ => IssueKind::Other,
    }
}

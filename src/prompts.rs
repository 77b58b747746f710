use std::sync::Arc;

use crate::error::CrucibleError;
use crate::memory::MemoryService;

/// Prompt names recognized by the registry. Prompts are always fetched by
/// name from the memory service; the compiled table below exists only as
/// a deterministic fallback.
pub const GENERATE_PROMPT: &str = "code_generation_system";
pub const FIX_PROMPT: &str = "code_fix_system";
pub const VALIDATE_PROMPT: &str = "code_validation_system";

const FALLBACKS: &[(&str, &str)] = &[
    (
        GENERATE_PROMPT,
        "You are a senior software engineer. Produce complete, working source \
         files for the requested task. Emit every file as a block starting with \
         a line `FILE: <relative/path>` followed by a fenced code block. Do not \
         emit prose outside file blocks.",
    ),
    (
        FIX_PROMPT,
        "You are a senior software engineer fixing review findings. Apply the \
         feedback to the previous files and re-emit every file in full, each as \
         a `FILE: <relative/path>` header followed by a fenced code block.",
    ),
    (
        VALIDATE_PROMPT,
        "You are a strict code reviewer. Score the submitted files 0-10 and \
         list concrete issues. Respond with a single JSON object: \
         {\"score\": <number>, \"issues\": [{\"severity\", \"kind\", \
         \"message\", \"file\", \"line\", \"suggestion\"}], \"feedback\": <string>}.",
    ),
];

/// Named prompt registry: memory service first, compiled fallback second.
/// Strict deployments forbid fallbacks entirely.
pub struct PromptRegistry {
    memory: Arc<dyn MemoryService>,
    strict: bool,
}

impl PromptRegistry {
    pub fn new(memory: Arc<dyn MemoryService>, strict: bool) -> Self {
        Self { memory, strict }
    }

    pub async fn fetch(&self, name: &str) -> Result<String, CrucibleError> {
        match self.memory.get_prompt(name).await {
            Ok(Some(prompt)) => return Ok(prompt),
            Ok(None) => {
                tracing::debug!(name, "memory service has no prompt under this name");
            }
            Err(e) => {
                if self.strict {
                    return Err(e);
                }
                tracing::warn!(name, "prompt fetch failed, using fallback: {e}");
            }
        }

        if self.strict {
            return Err(CrucibleError::Configuration(format!(
                "strict prompts enabled and no served prompt named {name}"
            )));
        }

        fallback(name).map(str::to_string).ok_or_else(|| {
            CrucibleError::Configuration(format!("no fallback prompt named {name}"))
        })
    }
}

/// Compile-time fallback lookup, exposed for tests.
pub fn fallback(name: &str) -> Option<&'static str> {
    FALLBACKS
        .iter()
        .find(|(key, _)| *key == name)
        .map(|(_, prompt)| *prompt)
}

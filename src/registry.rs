use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::backend::InferenceBackend;
use crate::error::CrucibleError;
use crate::vram::{Device, DeviceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelPurpose {
    CodeGeneration,
    Validation,
    General,
    /// Excluded from inference selection.
    Embedding,
}

impl ModelPurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CodeGeneration => "code_generation",
            Self::Validation => "validation",
            Self::General => "general",
            Self::Embedding => "embedding",
        }
    }
}

/// Categorize a model by name substring. Rules apply in order; the first
/// hit wins.
pub fn categorize(name: &str) -> ModelPurpose {
    let name = name.to_lowercase();
    const CODE_NAMES: &[&str] = &[
        "coder",
        "codellama",
        "starcoder",
        "codestral",
        "wizardcoder",
        "deepseek-coder",
    ];
    if CODE_NAMES.iter().any(|n| name.contains(n)) {
        return ModelPurpose::CodeGeneration;
    }
    if name.contains("phi") || (name.contains("qwen") && !name.contains("coder")) {
        return ModelPurpose::Validation;
    }
    if name.contains("embed") {
        return ModelPurpose::Embedding;
    }
    if name.contains("deepseek-v2") || name.contains("deepseek:") {
        return ModelPurpose::CodeGeneration;
    }
    ModelPurpose::General
}

/// Derive a model's priority from its name and size. Smaller is preferred;
/// the result is floored at 1. Priorities are derived, never configured;
/// keeping this a pure function makes the heuristics inspectable.
pub fn priority_for(name: &str, size_gb: f64) -> u32 {
    let name = name.to_lowercase();
    let mut priority: i64 = 50;

    if size_gb > 15.0 {
        priority -= 20;
    } else if size_gb > 8.0 {
        priority -= 10;
    } else if size_gb > 4.0 {
        priority -= 5;
    }

    if name.contains("deepseek") {
        priority -= 15;
    }
    if name.contains("qwen2.5") {
        priority -= 10;
    }
    if name.contains("codellama") {
        priority -= 5;
    }
    if name.contains("phi4") {
        priority -= 8;
    }
    if name.contains("instruct") || name.contains("chat") {
        priority -= 3;
    }

    if name.contains("uncensored") {
        priority += 20;
    }
    if name.contains("llama2") {
        priority += 10;
    }

    priority.max(1) as u32
}

#[derive(Debug, Clone)]
pub struct ModelDescriptor {
    pub name: String,
    pub size_gb: f64,
    pub purpose: ModelPurpose,
    /// Smaller is preferred, >= 1.
    pub priority: u32,
    pub device: DeviceId,
    pub loaded: bool,
}

/// Process-scoped model table, discovered from the backend and rebuilt on
/// demand. Read-many, write-rarely: all rebuilds run under one guard.
pub struct ModelRegistry {
    backend: Arc<dyn InferenceBackend>,
    devices: Vec<Device>,
    table: Mutex<Option<Vec<ModelDescriptor>>>,
}

impl ModelRegistry {
    pub fn new(backend: Arc<dyn InferenceBackend>, devices: Vec<Device>) -> Self {
        Self {
            backend,
            devices,
            table: Mutex::new(None),
        }
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Drop the cached table; the next read rediscovers.
    pub async fn refresh(&self) {
        *self.table.lock().await = None;
    }

    /// Ordered candidates for a purpose, priority ascending; equal
    /// priorities prefer the smaller model.
    pub async fn list(&self, purpose: ModelPurpose) -> Result<Vec<ModelDescriptor>, CrucibleError> {
        let table = self.ensure_loaded().await?;
        let mut candidates: Vec<ModelDescriptor> = table
            .into_iter()
            .filter(|m| m.purpose == purpose)
            .collect();
        candidates.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.size_gb.partial_cmp(&b.size_gb).unwrap_or(std::cmp::Ordering::Equal))
        });
        Ok(candidates)
    }

    pub async fn get(&self, name: &str) -> Result<Option<ModelDescriptor>, CrucibleError> {
        let table = self.ensure_loaded().await?;
        Ok(table.into_iter().find(|m| m.name == name))
    }

    /// All inference-eligible descriptors (embedding models excluded).
    pub async fn selectable(&self) -> Result<Vec<ModelDescriptor>, CrucibleError> {
        let table = self.ensure_loaded().await?;
        Ok(table
            .into_iter()
            .filter(|m| m.purpose != ModelPurpose::Embedding)
            .collect())
    }

    async fn ensure_loaded(&self) -> Result<Vec<ModelDescriptor>, CrucibleError> {
        let mut guard = self.table.lock().await;
        if let Some(ref table) = *guard {
            return Ok(table.clone());
        }

        let mut table = Vec::new();
        let mut reachable = false;

        for device in &self.devices {
            let discovered = match self.backend.list_models(device.port).await {
                Ok(models) => models,
                Err(e) => {
                    tracing::warn!(port = device.port, "model discovery failed: {e}");
                    continue;
                }
            };
            reachable = true;

            // Loaded bit is best-effort; a failed /running probe leaves it unset.
            let resident: Vec<String> = self
                .backend
                .list_running(device.port)
                .await
                .map(|models| models.into_iter().map(|m| m.name).collect())
                .unwrap_or_default();

            for model in discovered {
                table.push(ModelDescriptor {
                    purpose: categorize(&model.name),
                    priority: priority_for(&model.name, model.size_gb),
                    device: device.id,
                    loaded: resident.contains(&model.name),
                    name: model.name,
                    size_gb: model.size_gb,
                });
            }
        }

        if !reachable {
            return Err(CrucibleError::RegistryUnavailable);
        }

        tracing::info!(models = table.len(), "model registry loaded");
        *guard = Some(table.clone());
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categorize_by_name_substring() {
        assert_eq!(categorize("deepseek-coder:33b"), ModelPurpose::CodeGeneration);
        assert_eq!(categorize("starcoder2:7b"), ModelPurpose::CodeGeneration);
        assert_eq!(categorize("codestral:22b"), ModelPurpose::CodeGeneration);
        assert_eq!(categorize("phi4:14b"), ModelPurpose::Validation);
        assert_eq!(categorize("qwen2.5:14b"), ModelPurpose::Validation);
        // qwen + coder lands in code generation via the coder rule
        assert_eq!(categorize("qwen2.5-coder:14b"), ModelPurpose::CodeGeneration);
        assert_eq!(categorize("nomic-embed-text"), ModelPurpose::Embedding);
        assert_eq!(categorize("deepseek-v2:16b"), ModelPurpose::CodeGeneration);
        assert_eq!(categorize("deepseek:67b"), ModelPurpose::CodeGeneration);
        assert_eq!(categorize("llama3:8b"), ModelPurpose::General);
    }

    #[test]
    fn priority_tiers_are_exclusive() {
        // 16GB deepseek-coder: 50 - 20 (size) - 15 (deepseek) = 15
        assert_eq!(priority_for("deepseek-coder:33b", 16.0), 15);
        // 9GB: only the >8 tier applies
        assert_eq!(priority_for("llama3:8b-q8", 9.0), 40);
        // 5GB: only the >4 tier applies
        assert_eq!(priority_for("llama3:8b", 5.0), 45);
    }

    #[test]
    fn priority_penalties_and_floor() {
        // llama2-uncensored: 50 + 20 + 10 = 80
        assert_eq!(priority_for("llama2-uncensored:7b", 3.0), 80);
        // instruct shaves 3
        assert_eq!(priority_for("mistral-instruct", 3.0), 47);
        // stacked deductions floor at 1
        assert_eq!(priority_for("deepseek-qwen2.5-codellama-phi4-instruct", 16.0), 1);
    }
}

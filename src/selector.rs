use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::CrucibleError;
use crate::learning::LearningRecorder;
use crate::memory::{MemoryService, ModelStat};
use crate::registry::{ModelDescriptor, ModelPurpose, ModelRegistry};
use crate::vram::{DeviceId, PINNED_DEVICE, SWAP_DEVICE, VramBudget};

/// Minimum success rate for a model to pass the hard gate (70%).
pub const MIN_SUCCESS_RATE: f64 = 0.70;

/// Minimum sample count before the hard gate applies.
/// Models with fewer samples pass through (insufficient data to judge).
pub const MIN_GATE_SAMPLES: u64 = 5;

/// Result of the stats hard gate over a candidate pool.
#[derive(Debug, Default)]
pub struct HardGate {
    /// Models withheld from selection for this call.
    pub blocked: HashSet<String>,
    /// Human-readable gate events for the caller's warnings channel.
    pub events: Vec<String>,
}

impl HardGate {
    pub fn allows(&self, model: &str) -> bool {
        !self.blocked.contains(model)
    }
}

/// Exclude candidates below 70% success with at least 5 samples. Models
/// the stats do not know pass through. If every candidate would be gated
/// the original pool is restored (never select from zero). One gated
/// model whose failures are mostly timing-related is re-added as an
/// exploration slot: a model that keeps timing out looks like a
/// configuration problem, not a quality problem.
pub fn apply_hard_gate(candidates: &[ModelDescriptor], stats: &[ModelStat]) -> HardGate {
    let mut gate = HardGate::default();
    let by_model: HashMap<&str, &ModelStat> =
        stats.iter().map(|s| (s.model.as_str(), s)).collect();

    let mut gated_details: Vec<String> = Vec::new();
    for candidate in candidates {
        if let Some(stat) = by_model.get(candidate.name.as_str())
            && stat.samples >= MIN_GATE_SAMPLES
            && stat.success_rate < MIN_SUCCESS_RATE
        {
            gated_details.push(format!(
                "{}: {:.1}% success ({} samples)",
                candidate.name,
                stat.success_rate * 100.0,
                stat.samples
            ));
            gate.blocked.insert(candidate.name.clone());
        }
    }

    if gate.blocked.is_empty() {
        return gate;
    }

    gate.events.push(format!(
        "models excluded by hard gate (<{:.0}% success, >={} samples): {}",
        MIN_SUCCESS_RATE * 100.0,
        MIN_GATE_SAMPLES,
        gated_details.join("; ")
    ));

    // Never dispatch to zero: a gate that empties the pool restores the
    // original list.
    if gate.blocked.len() == candidates.len() {
        gate.events.push(
            "all candidates below success threshold — proceeding with the original pool"
                .to_string(),
        );
        gate.blocked.clear();
        return gate;
    }

    // Exploration slot: re-add the best gated model when more than half of
    // its failures are timing-related.
    let explore = gate
        .blocked
        .iter()
        .filter_map(|name| by_model.get(name.as_str()).copied())
        .filter(|stat| {
            let successes = (stat.success_rate * stat.samples as f64).round() as u64;
            let failures = stat.samples.saturating_sub(successes);
            failures > 0 && stat.timing_failures * 2 > failures
        })
        .max_by(|a, b| {
            a.success_rate
                .partial_cmp(&b.success_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|stat| stat.model.clone());
    if let Some(model) = explore {
        if let Some(stat) = by_model.get(model.as_str()) {
            gate.events.push(format!(
                "exploration slot: re-adding {model} ({:.1}% success, {} of {} samples timed out — likely a config issue)",
                stat.success_rate * 100.0,
                stat.timing_failures,
                stat.samples
            ));
        }
        gate.blocked.remove(&model);
    }

    gate
}

/// What the chosen model will be used for. Second opinions prefer a large
/// model on the swap device so they disagree with the first pass for a
/// reason other than shared weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionRole {
    Primary,
    SecondOpinion,
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub model: ModelDescriptor,
    pub device: DeviceId,
    pub port: u16,
    /// True when this is the primary-model fallback after every candidate
    /// was excluded. The loop records the subsequent exclusion reset.
    pub fallback: bool,
}

/// Map a purpose to the task-type key used by the learning store.
pub fn task_type_for(purpose: ModelPurpose) -> &'static str {
    match purpose {
        ModelPurpose::CodeGeneration => "code_generation",
        ModelPurpose::Validation => "validation",
        _ => "general",
    }
}

/// Chooses the next model for a call: historical stats, the optional
/// delegated selector, the exclusion set and live VRAM fit, in that order,
/// with early exit on the first hit.
pub struct ModelSelector {
    registry: Arc<ModelRegistry>,
    vram: Arc<VramBudget>,
    learning: LearningRecorder,
    memory: Arc<dyn MemoryService>,
    smart: bool,
    primary_model: String,
}

impl ModelSelector {
    pub fn new(
        registry: Arc<ModelRegistry>,
        vram: Arc<VramBudget>,
        learning: LearningRecorder,
        memory: Arc<dyn MemoryService>,
        smart: bool,
        primary_model: String,
    ) -> Self {
        Self {
            registry,
            vram,
            learning,
            memory,
            smart,
            primary_model,
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub async fn select(
        &self,
        purpose: ModelPurpose,
        task: &str,
        language: &str,
        excluded: &HashSet<String>,
        keywords: &[String],
        role: SelectionRole,
    ) -> Result<Selection, CrucibleError> {
        // 1. Smart selection off: the primary pinned model, unconditionally.
        if !self.smart {
            return self.primary(false).await;
        }

        let candidates = self.registry.list(purpose).await?;
        if candidates.is_empty() {
            return Err(CrucibleError::NoCandidate {
                purpose: purpose.as_str().to_string(),
            });
        }

        // 2. Everything known is excluded: fall back to the primary model so
        // single-GPU deployments still make progress.
        if candidates.iter().all(|c| excluded.contains(&c.name)) {
            tracing::warn!(
                purpose = purpose.as_str(),
                "all candidates excluded — falling back to primary model"
            );
            return self.primary(true).await;
        }

        let task_type = task_type_for(purpose);
        let stats = self.learning.stats(language, task_type).await;

        // Stats hard gate over the pool. Gate events are also surfaced by
        // callers with a warnings channel via `hard_gate`.
        let gate = if stats.is_empty() {
            HardGate::default()
        } else {
            apply_hard_gate(&candidates, &stats)
        };
        for event in &gate.events {
            tracing::warn!("{event}");
        }

        if !stats.is_empty() {
            // 3. Delegated selector, when available. Its answer is honored
            // only if it names a known, fitting, non-excluded model.
            let names: Vec<String> = candidates
                .iter()
                .filter(|c| !excluded.contains(&c.name) && gate.allows(&c.name))
                .map(|c| c.name.clone())
                .collect();
            let summary = if keywords.is_empty() {
                task.to_string()
            } else {
                format!("{task} [{}]", keywords.join(" "))
            };
            if let Ok(Some(pick)) = self.memory.suggest_model(&summary, &stats, &names).await
                && let Some(model) = candidates.iter().find(|c| c.name == pick)
                && !excluded.contains(&model.name)
                && gate.allows(&model.name)
                && let Some(device) = self.vram.placement_for(model.size_gb).await
            {
                tracing::debug!(model = %model.name, "delegated selector pick");
                return self.selection(model.clone(), device, false);
            }

            // 4. Highest success rate that fits and is not excluded. Equal
            // rates prefer the larger model.
            let mut ranked: Vec<(&ModelStat, &ModelDescriptor)> = stats
                .iter()
                .filter_map(|s| {
                    candidates
                        .iter()
                        .find(|c| c.name == s.model)
                        .map(|c| (s, c))
                })
                .filter(|(_, c)| !excluded.contains(&c.name) && gate.allows(&c.name))
                .collect();
            ranked.sort_by(|a, b| {
                b.0.success_rate
                    .partial_cmp(&a.0.success_rate)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(
                        b.1.size_gb
                            .partial_cmp(&a.1.size_gb)
                            .unwrap_or(std::cmp::Ordering::Equal),
                    )
            });
            for (stat, model) in ranked {
                if let Some(device) = self.vram.placement_for(model.size_gb).await {
                    tracing::debug!(
                        model = %model.name,
                        success_rate = stat.success_rate,
                        samples = stat.samples,
                        "stats-ranked pick"
                    );
                    return self.selection(model.clone(), device, false);
                }
            }
        }

        // 5. Priority order within the purpose. Second opinions first try a
        // large model on the swap device; otherwise the smallest fitting
        // candidate wins (the registry already orders priority, then size).
        let pool: Vec<&ModelDescriptor> = candidates
            .iter()
            .filter(|c| !excluded.contains(&c.name) && gate.allows(&c.name))
            .collect();

        if role == SelectionRole::SecondOpinion && self.vram.devices().len() > 1 {
            for model in pool.iter().filter(|c| c.size_gb > 10.0) {
                if self.vram.fits_on(model.size_gb, SWAP_DEVICE).await {
                    return self.selection((*model).clone(), SWAP_DEVICE, false);
                }
            }
        }

        for model in pool {
            if let Some(device) = self.vram.placement_for(model.size_gb).await {
                return self.selection(model.clone(), device, false);
            }
        }

        Err(CrucibleError::NoCandidate {
            purpose: purpose.as_str().to_string(),
        })
    }

    /// Compute the stats hard gate for a purpose without selecting.
    /// The ensemble uses this to withhold gated models from its member
    /// pools and to surface the events on the job; `select` applies the
    /// same gate internally.
    pub async fn hard_gate(&self, purpose: ModelPurpose, language: &str) -> HardGate {
        if !self.smart {
            return HardGate::default();
        }
        let Ok(candidates) = self.registry.list(purpose).await else {
            return HardGate::default();
        };
        let stats = self
            .learning
            .stats(language, task_type_for(purpose))
            .await;
        if stats.is_empty() {
            return HardGate::default();
        }
        apply_hard_gate(&candidates, &stats)
    }

    async fn primary(&self, fallback: bool) -> Result<Selection, CrucibleError> {
        let model = self
            .registry
            .get(&self.primary_model)
            .await?
            .ok_or_else(|| CrucibleError::NoCandidate {
                purpose: "primary".to_string(),
            })?;
        // The primary model is always resident on the pinned device; no
        // placement probe needed.
        self.selection(model, PINNED_DEVICE, fallback)
    }

    fn selection(
        &self,
        model: ModelDescriptor,
        device: DeviceId,
        fallback: bool,
    ) -> Result<Selection, CrucibleError> {
        let port = self
            .vram
            .port_of(device)
            .ok_or_else(|| CrucibleError::Configuration(format!("unknown device {device}")))?;
        Ok(Selection {
            model,
            device,
            port,
            fallback,
        })
    }
}

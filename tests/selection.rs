//! Selector and VRAM-routing behavior against a scripted backend.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::*;
use crucible::config::GpuConfig;
use crucible::learning::LearningRecorder;
use crucible::memory::ModelStat;
use crucible::registry::{ModelPurpose, ModelRegistry};
use crucible::selector::{ModelSelector, SelectionRole};
use crucible::vram::{self, PINNED_DEVICE, SWAP_DEVICE, VramBudget, devices_from_config};

fn gpu_config(pinned_vram: f64, dual: bool) -> GpuConfig {
    GpuConfig {
        primary_model: "qwen2.5-coder:14b".to_string(),
        pinned_gpu_vram: pinned_vram,
        swap_gpu_vram: 24.0,
        dual_gpu: dual,
        ..GpuConfig::default()
    }
}

fn build_selector(
    backend: Arc<ScriptedBackend>,
    memory: Arc<ScriptedMemory>,
    gpu: &GpuConfig,
    smart: bool,
) -> ModelSelector {
    let devices = devices_from_config(gpu);
    let registry = Arc::new(ModelRegistry::new(backend.clone(), devices.clone()));
    let vram = Arc::new(VramBudget::new(backend, devices));
    let learning = LearningRecorder::spawn(memory.clone());
    ModelSelector::new(
        registry,
        vram,
        learning,
        memory,
        smart,
        gpu.primary_model.clone(),
    )
}

#[tokio::test]
async fn smart_flag_off_always_returns_primary() {
    let backend = ScriptedBackend::with_models(&fixture_models());
    let memory = Arc::new(ScriptedMemory::default());
    let selector = build_selector(backend, memory, &gpu_config(24.0, false), false);

    let selection = selector
        .select(
            ModelPurpose::CodeGeneration,
            "task",
            "go",
            &HashSet::new(),
            &[],
            SelectionRole::Primary,
        )
        .await
        .unwrap();
    assert_eq!(selection.model.name, "qwen2.5-coder:14b");
    assert_eq!(selection.device, PINNED_DEVICE);
}

#[tokio::test]
async fn priority_order_wins_without_stats() {
    let backend = ScriptedBackend::with_models(&fixture_models());
    let memory = Arc::new(ScriptedMemory::default());
    let selector = build_selector(backend, memory, &gpu_config(24.0, false), true);

    // deepseek-coder has the lowest derived priority among generators.
    let selection = selector
        .select(
            ModelPurpose::CodeGeneration,
            "task",
            "go",
            &HashSet::new(),
            &[],
            SelectionRole::Primary,
        )
        .await
        .unwrap();
    assert_eq!(selection.model.name, "deepseek-coder:16b");
    assert!(!selection.fallback);
}

#[tokio::test]
async fn exclusion_set_is_honored() {
    let backend = ScriptedBackend::with_models(&fixture_models());
    let memory = Arc::new(ScriptedMemory::default());
    let selector = build_selector(backend, memory, &gpu_config(24.0, false), true);

    let excluded: HashSet<String> = ["deepseek-coder:16b".to_string()].into();
    let selection = selector
        .select(
            ModelPurpose::CodeGeneration,
            "task",
            "go",
            &excluded,
            &[],
            SelectionRole::Primary,
        )
        .await
        .unwrap();
    assert_eq!(selection.model.name, "qwen2.5-coder:14b");
}

#[tokio::test]
async fn stats_outrank_priority() {
    let backend = ScriptedBackend::with_models(&fixture_models());
    let memory = Arc::new(ScriptedMemory {
        stats: vec![
            ModelStat {
                model: "qwen2.5-coder:14b".to_string(),
                success_rate: 0.92,
                avg_score: 8.7,
                samples: 40,
                timing_failures: 0,
            },
            ModelStat {
                model: "deepseek-coder:16b".to_string(),
                success_rate: 0.48,
                avg_score: 6.1,
                samples: 31,
                timing_failures: 0,
            },
        ],
        ..ScriptedMemory::default()
    });
    let selector = build_selector(backend, memory, &gpu_config(24.0, false), true);

    let selection = selector
        .select(
            ModelPurpose::CodeGeneration,
            "task",
            "go",
            &HashSet::new(),
            &[],
            SelectionRole::Primary,
        )
        .await
        .unwrap();
    assert_eq!(selection.model.name, "qwen2.5-coder:14b");
}

#[tokio::test]
async fn delegated_suggestion_beats_stats_ranking() {
    let backend = ScriptedBackend::with_models(&fixture_models());
    let memory = Arc::new(ScriptedMemory {
        stats: vec![ModelStat {
            model: "deepseek-coder:16b".to_string(),
            success_rate: 0.9,
            avg_score: 8.0,
            samples: 25,
            timing_failures: 0,
        }],
        suggestion: Some("qwen2.5-coder:14b".to_string()),
        ..ScriptedMemory::default()
    });
    let selector = build_selector(backend, memory, &gpu_config(24.0, false), true);

    let selection = selector
        .select(
            ModelPurpose::CodeGeneration,
            "task",
            "go",
            &HashSet::new(),
            &[],
            SelectionRole::Primary,
        )
        .await
        .unwrap();
    assert_eq!(selection.model.name, "qwen2.5-coder:14b");
}

#[tokio::test]
async fn unknown_suggestion_falls_through() {
    let backend = ScriptedBackend::with_models(&fixture_models());
    let memory = Arc::new(ScriptedMemory {
        stats: vec![ModelStat {
            model: "deepseek-coder:16b".to_string(),
            success_rate: 0.9,
            avg_score: 8.0,
            samples: 25,
            timing_failures: 0,
        }],
        suggestion: Some("gpt-900".to_string()),
        ..ScriptedMemory::default()
    });
    let selector = build_selector(backend, memory, &gpu_config(24.0, false), true);

    let selection = selector
        .select(
            ModelPurpose::CodeGeneration,
            "task",
            "go",
            &HashSet::new(),
            &[],
            SelectionRole::Primary,
        )
        .await
        .unwrap();
    // Falls through to the best stat, which fits.
    assert_eq!(selection.model.name, "deepseek-coder:16b");
}

#[tokio::test]
async fn all_excluded_falls_back_to_primary() {
    let backend = ScriptedBackend::with_models(&fixture_models());
    let memory = Arc::new(ScriptedMemory::default());
    let selector = build_selector(backend, memory, &gpu_config(24.0, false), true);

    let excluded: HashSet<String> = ["deepseek-coder:16b".to_string(), "qwen2.5-coder:14b".to_string()].into();
    let selection = selector
        .select(
            ModelPurpose::CodeGeneration,
            "task",
            "go",
            &excluded,
            &[],
            SelectionRole::Primary,
        )
        .await
        .unwrap();
    assert_eq!(selection.model.name, "qwen2.5-coder:14b");
    assert!(selection.fallback);
}

#[tokio::test]
async fn oversized_models_are_skipped() {
    // 12 GB device: available = 12 - 1 - 1 = 10, so the 16 GB model
    // cannot place and the 9 GB one wins despite worse priority.
    let backend = ScriptedBackend::with_models(&fixture_models());
    let memory = Arc::new(ScriptedMemory::default());
    let selector = build_selector(backend, memory, &gpu_config(12.0, false), true);

    let selection = selector
        .select(
            ModelPurpose::CodeGeneration,
            "task",
            "go",
            &HashSet::new(),
            &[],
            SelectionRole::Primary,
        )
        .await
        .unwrap();
    assert_eq!(selection.model.name, "qwen2.5-coder:14b");
}

#[tokio::test]
async fn resident_models_shrink_availability() {
    let backend = ScriptedBackend::with_models(&fixture_models());
    // 14 GB already resident on the 24 GB device: available = 24-1-14-1 = 8.
    backend.set_resident(&[("qwen2.5-coder:14b", 14.0)]);

    let gpu = gpu_config(24.0, false);
    let devices = devices_from_config(&gpu);
    let vram = VramBudget::new(backend, devices);

    let available = vram.available_on(PINNED_DEVICE).await;
    assert!((available - 8.0).abs() < 1e-9);
    assert!(vram::fits(8.0, available));
    assert!(!vram::fits(8.5, available));
}

#[tokio::test]
async fn dual_gpu_routing_prefers_swap_for_large_models() {
    let backend = ScriptedBackend::with_models(&fixture_models());
    let gpu = gpu_config(24.0, true);
    let devices = devices_from_config(&gpu);
    let vram = VramBudget::new(backend, devices);

    assert_eq!(vram.placement_for(16.0).await, Some(SWAP_DEVICE));
    assert_eq!(vram.placement_for(9.0).await, Some(PINNED_DEVICE));
    // Nothing fits a model larger than both devices.
    assert_eq!(vram.placement_for(40.0).await, None);
}

#[tokio::test]
async fn registry_unreachable_on_all_ports_errors() {
    let backend = ScriptedBackend::with_models(&fixture_models());
    backend
        .fail_lists
        .store(true, std::sync::atomic::Ordering::Relaxed);
    let memory = Arc::new(ScriptedMemory::default());
    let selector = build_selector(backend, memory, &gpu_config(24.0, false), true);

    let result = selector
        .select(
            ModelPurpose::CodeGeneration,
            "task",
            "go",
            &HashSet::new(),
            &[],
            SelectionRole::Primary,
        )
        .await;
    assert!(matches!(
        result,
        Err(crucible::error::CrucibleError::RegistryUnavailable)
    ));
}

#[tokio::test]
async fn registry_orders_by_priority_then_size_and_drops_embeddings() {
    let backend = ScriptedBackend::with_models(&[
        ("deepseek-coder:16b", 16.0),
        ("qwen2.5-coder:14b", 9.0),
        ("starcoder2:7b", 4.0),
        ("nomic-embed-text", 0.5),
    ]);
    let gpu = gpu_config(24.0, false);
    let registry = ModelRegistry::new(backend, devices_from_config(&gpu));

    let generators = registry.list(ModelPurpose::CodeGeneration).await.unwrap();
    let names: Vec<&str> = generators.iter().map(|m| m.name.as_str()).collect();
    // priorities: deepseek 15, qwen2.5-coder 30, starcoder 50
    assert_eq!(
        names,
        vec!["deepseek-coder:16b", "qwen2.5-coder:14b", "starcoder2:7b"]
    );

    let selectable = registry.selectable().await.unwrap();
    assert!(selectable.iter().all(|m| m.name != "nomic-embed-text"));
}

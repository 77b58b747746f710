use std::sync::Arc;
use std::time::Duration;

use crate::backend::InferenceBackend;
use crate::config::Config;
use crate::ensemble::EnsembleCoordinator;
use crate::generator::Generator;
use crate::learning::LearningRecorder;
use crate::memory::MemoryService;
use crate::prompts::PromptRegistry;
use crate::registry::ModelRegistry;
use crate::sandbox::Sandbox;
use crate::selector::ModelSelector;
use crate::validator::Validator;
use crate::vram::{VramBudget, devices_from_config};

/// Everything a running job needs, wired once at startup and shared by
/// every component through Arcs.
pub struct EngineDeps {
    pub config: Config,
    pub backend: Arc<dyn InferenceBackend>,
    pub memory: Arc<dyn MemoryService>,
    pub sandbox: Arc<dyn Sandbox>,
    pub registry: Arc<ModelRegistry>,
    pub vram: Arc<VramBudget>,
    pub selector: Arc<ModelSelector>,
    pub validator: Arc<Validator>,
    pub ensemble: Arc<EnsembleCoordinator>,
    pub generator: Arc<Generator>,
    pub learning: LearningRecorder,
    pub prompts: Arc<PromptRegistry>,
}

impl EngineDeps {
    pub fn new(
        config: Config,
        backend: Arc<dyn InferenceBackend>,
        memory: Arc<dyn MemoryService>,
        sandbox: Arc<dyn Sandbox>,
    ) -> Arc<Self> {
        let devices = devices_from_config(&config.gpu);
        let idle_timeout = Duration::from_secs(config.limits.idle_chunk_timeout_secs);

        let registry = Arc::new(ModelRegistry::new(backend.clone(), devices.clone()));
        let vram = Arc::new(VramBudget::new(backend.clone(), devices));
        let learning = LearningRecorder::spawn(memory.clone());
        let prompts = Arc::new(PromptRegistry::new(
            memory.clone(),
            config.limits.strict_prompts,
        ));
        let selector = Arc::new(ModelSelector::new(
            registry.clone(),
            vram.clone(),
            learning.clone(),
            memory.clone(),
            config.gpu.use_smart_model_selection,
            config.gpu.primary_model.clone(),
        ));
        let validator = Arc::new(Validator::new(backend.clone(), prompts.clone(), idle_timeout));
        let ensemble = Arc::new(EnsembleCoordinator::new(
            selector.clone(),
            validator.clone(),
            backend.clone(),
            vram.clone(),
        ));
        let generator = Arc::new(Generator::new(
            backend.clone(),
            selector.clone(),
            memory.clone(),
            prompts.clone(),
            idle_timeout,
        ));

        Arc::new(Self {
            config,
            backend,
            memory,
            sandbox,
            registry,
            vram,
            selector,
            validator,
            ensemble,
            generator,
            learning,
            prompts,
        })
    }
}

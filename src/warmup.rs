use std::sync::Arc;
use std::time::Duration;

use crate::config::DockerConfig;
use crate::sandbox::Sandbox;

/// One-shot startup task that primes the sandbox image cache. Every
/// failure is logged and swallowed; warmup never aborts startup.
pub struct WarmupSupervisor;

impl WarmupSupervisor {
    /// Spawn the warmup pass in the background. Returns immediately; the
    /// handle is only useful to tests that want to await completion.
    pub fn spawn(sandbox: Arc<dyn Sandbox>, config: DockerConfig) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if !config.enable_warmup {
                tracing::debug!("image warmup disabled");
                return;
            }
            let timeout = Duration::from_secs(config.image_pull_timeout_minutes * 60);
            for image in &config.warmup_images {
                match sandbox.image_present(image).await {
                    Ok(true) => {
                        tracing::debug!(image = %image, "warmup image already present");
                        continue;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(image = %image, "warmup presence check failed: {e}");
                        continue;
                    }
                }
                tracing::info!(image = %image, "pulling warmup image");
                if let Err(e) = sandbox.pull_image(image, timeout).await {
                    tracing::warn!(image = %image, "warmup pull failed: {e}");
                }
            }
            tracing::info!(images = config.warmup_images.len(), "image warmup finished");
        })
    }
}

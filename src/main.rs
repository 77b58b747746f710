use std::sync::Arc;

use crucible::backend::ollama::OllamaBackend;
use crucible::config::Config;
use crucible::engine::EngineDeps;
use crucible::manager::JobManager;
use crucible::memory::{MemoryService, NoopMemory};
use crucible::memory::rpc::MemoryRpcClient;
use crucible::sandbox::DockerSandbox;
use crucible::warmup::WarmupSupervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // Load .env file if present (silently ignored if missing)
    dotenvy::dotenv().ok();

    tracing::info!("crucible starting");

    // A malformed config file is the only fatal startup condition.
    let config = Config::load().inspect_err(|e| tracing::error!("startup failed: {e}"))?;

    let backend = Arc::new(OllamaBackend::new(config.ollama.url.clone()));
    let memory: Arc<dyn MemoryService> = match config.memory_agent.base_url.clone() {
        Some(base_url) => Arc::new(MemoryRpcClient::new(base_url)),
        None => Arc::new(NoopMemory::default()),
    };
    let sandbox = Arc::new(DockerSandbox::new());

    WarmupSupervisor::spawn(sandbox.clone(), config.docker.clone());

    let listen = config.server.listen.clone();
    let deps = EngineDeps::new(config, backend, memory, sandbox);
    let manager = JobManager::new(deps);
    let app = crucible::api::router(manager);

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .inspect_err(|e| tracing::error!("cannot bind {listen}: {e}"))?;
    tracing::info!(%listen, "crucible serving");

    axum::serve(listener, app).await?;

    tracing::info!("crucible shutting down");
    Ok(())
}

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::CrucibleError;

/// Which stage of a sandbox check failed. Maps onto issue kinds
/// docker_build / docker_run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxPhase {
    Build,
    Run,
}

#[derive(Debug, Clone)]
pub struct SandboxCheck {
    pub ok: bool,
    pub phase: SandboxPhase,
    pub detail: String,
}

/// The sandboxed-execution capability: container image management plus
/// optional build checks on generated code. Failures are non-fatal within
/// a job; the loop demotes them to issues.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn image_present(&self, image: &str) -> Result<bool, CrucibleError>;

    async fn pull_image(&self, image: &str, timeout: Duration) -> Result<(), CrucibleError>;

    /// Compile or import-check the workspace for the given language.
    async fn check_build(
        &self,
        workspace: &Path,
        language: &str,
        timeout: Duration,
    ) -> Result<SandboxCheck, CrucibleError>;
}

/// Container image used for build checks per language tag.
pub fn image_for_language(language: &str) -> Option<&'static str> {
    match language.to_lowercase().as_str() {
        "go" | "golang" => Some("golang:1.22-alpine"),
        "rust" => Some("rust:1-slim"),
        "python" | "py" => Some("python:3.12-slim"),
        "javascript" | "typescript" | "js" | "ts" | "node" => Some("node:20-alpine"),
        "csharp" | "cs" | "dotnet" => Some("mcr.microsoft.com/dotnet/sdk:8.0"),
        "java" => Some("eclipse-temurin:21"),
        _ => None,
    }
}

fn build_command_for(language: &str) -> Option<&'static str> {
    match language.to_lowercase().as_str() {
        "go" | "golang" => Some("go build ./..."),
        "rust" => Some("cargo check"),
        "python" | "py" => Some("python -m compileall -q ."),
        "javascript" | "js" | "node" => Some("node --check $(find . -name '*.js')"),
        "typescript" | "ts" => Some("npx -y tsc --noEmit || true"),
        "csharp" | "cs" | "dotnet" => Some("dotnet build --nologo"),
        "java" => Some("javac $(find . -name '*.java')"),
        _ => None,
    }
}

/// Docker CLI implementation, supervised with per-call timeouts.
#[derive(Default)]
pub struct DockerSandbox;

impl DockerSandbox {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn image_present(&self, image: &str) -> Result<bool, CrucibleError> {
        let status = Command::new("docker")
            .args(["image", "inspect", image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| CrucibleError::SandboxFailed(format!("docker unavailable: {e}")))?;
        Ok(status.success())
    }

    async fn pull_image(&self, image: &str, timeout: Duration) -> Result<(), CrucibleError> {
        let mut child = Command::new("docker")
            .args(["pull", image])
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CrucibleError::SandboxFailed(format!("docker unavailable: {e}")))?;

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(CrucibleError::SandboxFailed(format!(
                "docker pull {image} exited with {status}"
            ))),
            Ok(Err(e)) => Err(CrucibleError::SandboxFailed(format!("docker pull: {e}"))),
            Err(_) => {
                // Timed out: kill the pull so it does not hold the daemon.
                let _ = child.kill().await;
                Err(CrucibleError::SandboxFailed(format!(
                    "docker pull {image} timed out after {}s",
                    timeout.as_secs()
                )))
            }
        }
    }

    async fn check_build(
        &self,
        workspace: &Path,
        language: &str,
        timeout: Duration,
    ) -> Result<SandboxCheck, CrucibleError> {
        let Some(image) = image_for_language(language) else {
            return Ok(SandboxCheck {
                ok: true,
                phase: SandboxPhase::Build,
                detail: format!("no build image for language {language} — check skipped"),
            });
        };
        let Some(build_cmd) = build_command_for(language) else {
            return Ok(SandboxCheck {
                ok: true,
                phase: SandboxPhase::Build,
                detail: format!("no build command for language {language} — check skipped"),
            });
        };

        let mount = format!("{}:/src:ro", workspace.display());
        let mut child = Command::new("docker")
            .args([
                "run",
                "--rm",
                "--network",
                "none",
                "-v",
                mount.as_str(),
                "-w",
                "/src",
                image,
                "sh",
                "-c",
                build_cmd,
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CrucibleError::SandboxFailed(format!("docker unavailable: {e}")))?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(CrucibleError::SandboxFailed(format!("docker run: {e}")));
            }
            Err(_) => {
                return Err(CrucibleError::SandboxFailed(format!(
                    "build check timed out after {}s",
                    timeout.as_secs()
                )));
            }
        };

        // A nonzero exit is a build failure; infrastructure errors above
        // surface as SandboxFailed and the loop files them under run.
        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(SandboxCheck {
            ok: output.status.success(),
            phase: SandboxPhase::Build,
            detail: stderr.chars().take(2000).collect(),
        })
    }
}

/// Sandbox used when container execution is unavailable: every check
/// passes vacuously.
#[derive(Default)]
pub struct NoopSandbox;

#[async_trait]
impl Sandbox for NoopSandbox {
    async fn image_present(&self, _image: &str) -> Result<bool, CrucibleError> {
        Ok(true)
    }

    async fn pull_image(&self, _image: &str, _timeout: Duration) -> Result<(), CrucibleError> {
        Ok(())
    }

    async fn check_build(
        &self,
        _workspace: &Path,
        _language: &str,
        _timeout: Duration,
    ) -> Result<SandboxCheck, CrucibleError> {
        Ok(SandboxCheck {
            ok: true,
            phase: SandboxPhase::Build,
            detail: "sandbox disabled".to_string(),
        })
    }
}

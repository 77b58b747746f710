use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;

use crate::backend::{
    DiscoveredModel, GenerateOutcome, GenerateRequest, InferenceBackend, ResidentModel,
};
use crate::error::CrucibleError;

/// Cap on an accumulated generate response body.
pub const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024; // 2MB

/// Maximum time to wait for response headers after sending a request.
pub const HEADERS_TIMEOUT: Duration = Duration::from_secs(60);

/// Overall generate ceiling: idle x 3 or 20 minutes, whichever is larger.
pub fn overall_timeout(idle: Duration) -> Duration {
    (idle * 3).max(Duration::from_secs(20 * 60))
}

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Ollama-compatible HTTP adapter. Base URL carries no port; every call
/// names the device port it is routed to.
pub struct OllamaBackend {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct TagsPayload {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
    #[serde(default)]
    size: u64,
}

#[derive(Deserialize)]
struct PsPayload {
    #[serde(default)]
    models: Vec<PsEntry>,
}

#[derive(Deserialize)]
struct PsEntry {
    name: String,
    #[serde(default)]
    size_vram: u64,
    #[serde(default)]
    size: u64,
}

#[derive(Deserialize)]
struct GeneratePayload {
    response: String,
    #[serde(default)]
    total_duration: u64,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
}

impl OllamaBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .build()
            .expect("failed to build HTTP client");

        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn url(&self, port: u16, path: &str) -> String {
        format!("{}:{port}{path}", self.base_url.trim_end_matches('/'))
    }

    /// GET a JSON endpoint with one retry on transient failure
    /// (connect error, 5xx).
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<T, CrucibleError> {
        let mut last_transient = None;
        for attempt in 0..2 {
            if attempt > 0 {
                tracing::debug!(url, "retrying transient backend error");
            }
            let response = match self.client.get(url).send().await {
                Ok(r) => r,
                Err(e) => {
                    last_transient = Some(format!("{e}"));
                    continue;
                }
            };
            let status = response.status();
            if status.is_server_error() {
                last_transient = Some(format!("{status}"));
                continue;
            }
            if !status.is_success() {
                return Err(CrucibleError::BackendMalformed(format!("{status}")));
            }
            return response
                .json::<T>()
                .await
                .map_err(|e| CrucibleError::BackendMalformed(format!("{e}")));
        }
        if let Some(detail) = last_transient {
            tracing::warn!(url, detail = %detail, "backend unreachable after retry");
        }
        Err(CrucibleError::RegistryUnavailable)
    }

    /// Read the response body chunk-by-chunk, enforcing the idle timeout
    /// since the last chunk, the overall generation deadline, and the
    /// job's cancellation token. Cancellation and deadline abort the call
    /// outright; a half-read generate body is never usable.
    async fn read_body(
        response: reqwest::Response,
        req: &GenerateRequest,
        start: Instant,
    ) -> Result<Vec<u8>, CrucibleError> {
        let mut stream = response.bytes_stream();
        let mut body: Vec<u8> = Vec::new();

        let remaining = req
            .deadline
            .checked_duration_since(Instant::now())
            .unwrap_or(Duration::ZERO);
        let generation_deadline = tokio::time::Instant::now() + remaining;

        let idle = req.idle_timeout.min(remaining.max(Duration::from_millis(1)));

        // Cancel future: resolves on cooperative cancel, pends forever if None.
        let cancel = req.cancellation_token.clone();
        let cancel_fut = async {
            match &cancel {
                Some(t) => t.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(cancel_fut);

        let mut last_chunk_at = tokio::time::Instant::now();

        // Pin the sleep outside the loop; reset() reuses the timer entry
        // instead of allocating a new Sleep future every iteration.
        let deadline_sleep = tokio::time::sleep_until(generation_deadline.min(last_chunk_at + idle));
        tokio::pin!(deadline_sleep);

        loop {
            deadline_sleep
                .as_mut()
                .reset(generation_deadline.min(last_chunk_at + idle));

            tokio::select! {
                _ = &mut cancel_fut => {
                    return Err(CrucibleError::Cancelled(start.elapsed().as_millis() as u64));
                }
                _ = &mut deadline_sleep => {
                    return Err(CrucibleError::BackendTimeout(start.elapsed().as_millis() as u64));
                }
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        last_chunk_at = tokio::time::Instant::now();
                        if body.len() + bytes.len() > MAX_RESPONSE_BYTES {
                            return Err(CrucibleError::BackendMalformed(format!(
                                "generate response too large: >{MAX_RESPONSE_BYTES}B"
                            )));
                        }
                        body.extend_from_slice(&bytes);
                    }
                    Some(Err(e)) => {
                        return Err(CrucibleError::BackendMalformed(format!("body read: {e}")));
                    }
                    None => break,
                },
            }
        }

        Ok(body)
    }

    async fn generate_once(&self, req: &GenerateRequest) -> Result<GenerateOutcome, CrucibleError> {
        let start = Instant::now();

        let remaining = req
            .deadline
            .checked_duration_since(Instant::now())
            .filter(|d| *d > Duration::from_millis(100))
            .ok_or(CrucibleError::BackendTimeout(0))?;

        let mut body = serde_json::json!({
            "model": req.model,
            "prompt": req.prompt,
            "stream": false,
            "keep_alive": -1,
        });
        if let Some(ref system) = req.system {
            body["system"] = serde_json::json!(system);
        }
        if let Some(num_ctx) = req.num_ctx {
            body["options"] = serde_json::json!({ "num_ctx": num_ctx });
        }

        // Scoped timeout around send() only: connect_timeout covers TCP/TLS,
        // this covers the gap between connection and first response header.
        // The cancel token is honored here too; a job cancel must reach an
        // in-flight call even while it waits on headers.
        let headers_timeout = remaining.min(HEADERS_TIMEOUT);
        let send_future = self
            .client
            .post(self.url(req.port, "/api/generate"))
            .json(&body)
            .send();

        let cancel = req.cancellation_token.clone();
        let cancel_fut = async {
            match &cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        let send_result = tokio::select! {
            _ = cancel_fut => {
                return Err(CrucibleError::Cancelled(start.elapsed().as_millis() as u64));
            }
            result = tokio::time::timeout(headers_timeout, send_future) => result,
        };
        let response = send_result
            .map_err(|_| CrucibleError::BackendTimeout(start.elapsed().as_millis() as u64))?
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    CrucibleError::BackendTimeout(start.elapsed().as_millis() as u64)
                } else {
                    CrucibleError::BackendMalformed(format!("{e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CrucibleError::BackendMalformed(format!("{status}")));
        }

        let raw = Self::read_body(response, req, start).await?;
        let payload: GeneratePayload = serde_json::from_slice(&raw)
            .map_err(|e| CrucibleError::BackendMalformed(format!("generate payload: {e}")))?;

        Ok(GenerateOutcome {
            response: payload.response,
            total_duration_ms: payload.total_duration / 1_000_000,
            prompt_eval_count: payload.prompt_eval_count,
            eval_count: payload.eval_count,
        })
    }
}

#[async_trait::async_trait]
impl InferenceBackend for OllamaBackend {
    async fn list_models(&self, port: u16) -> Result<Vec<DiscoveredModel>, CrucibleError> {
        let payload: TagsPayload = self.get_json(&self.url(port, "/api/tags")).await?;
        Ok(payload
            .models
            .into_iter()
            .map(|m| DiscoveredModel {
                name: m.name,
                size_gb: m.size as f64 / BYTES_PER_GB,
            })
            .collect())
    }

    async fn list_running(&self, port: u16) -> Result<Vec<ResidentModel>, CrucibleError> {
        let payload: PsPayload = self.get_json(&self.url(port, "/api/ps")).await?;
        Ok(payload
            .models
            .into_iter()
            .map(|m| {
                let bytes = if m.size_vram > 0 { m.size_vram } else { m.size };
                ResidentModel {
                    name: m.name,
                    resident_gb: bytes as f64 / BYTES_PER_GB,
                }
            })
            .collect())
    }

    async fn generate(&self, req: &GenerateRequest) -> Result<GenerateOutcome, CrucibleError> {
        // One retry on a malformed payload; timeouts and cancellation
        // propagate immediately.
        match self.generate_once(req).await {
            Err(CrucibleError::BackendMalformed(detail)) => {
                tracing::warn!(model = %req.model, detail = %detail, "malformed generate payload, retrying once");
                self.generate_once(req).await
            }
            other => other,
        }
    }
}

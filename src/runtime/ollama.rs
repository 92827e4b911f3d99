//! Ollama backend adapter.
//!
//! Speaks the Ollama HTTP API: `/api/pull` to load, `/api/generate` for
//! completions (newline-delimited JSON when streaming), `/api/tags` as the
//! health probe.

use super::{
    http_client, map_http_error, AbortRegistry, CallHandle, CapacityReport, ChunkStream,
    RuntimeAdapter, RuntimeHealth,
};
use crate::config::{ModelSpec, RuntimeKind, RuntimeSpec};
use crate::{GenerationParams, InferenceResponse, OrchestratorError, StreamChunk};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<GenerateOptions>,
}

#[derive(Serialize)]
struct GenerateOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
}

impl GenerateOptions {
    fn from_params(params: &GenerationParams) -> Option<Self> {
        if params == &GenerationParams::default() {
            return None;
        }
        Some(Self {
            temperature: params.temperature,
            top_p: params.top_p,
            num_predict: params.max_tokens,
            stop: params.stop.clone(),
        })
    }
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Serialize)]
struct PullRequest<'a> {
    name: &'a str,
    stream: bool,
}

/// Adapter for an Ollama server.
pub struct OllamaRuntime {
    endpoint: String,
    client: reqwest::Client,
    timeout: Duration,
    loaded: DashMap<String, u64>,
    aborts: std::sync::Arc<AbortRegistry>,
}

impl OllamaRuntime {
    /// Build an adapter for the configured Ollama endpoint.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Config`] when the HTTP client cannot be built.
    pub fn new(spec: &RuntimeSpec) -> Result<Self, OrchestratorError> {
        Ok(Self {
            endpoint: spec.endpoint.trim_end_matches('/').to_string(),
            client: http_client(spec)?,
            timeout: Duration::from_millis(spec.timeout_ms),
            loaded: DashMap::new(),
            aborts: std::sync::Arc::new(AbortRegistry::default()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.endpoint)
    }
}

#[async_trait]
impl RuntimeAdapter for OllamaRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Ollama
    }

    async fn load(&self, model: &ModelSpec) -> Result<(), OrchestratorError> {
        if self.loaded.contains_key(&model.id) {
            return Ok(());
        }
        debug!(model = %model.id, "pulling model into ollama");
        let resp = self
            .client
            .post(self.url("/api/pull"))
            .json(&PullRequest {
                name: &model.id,
                stream: false,
            })
            .send()
            .await
            .map_err(|e| map_http_error(e, self.timeout))?;
        if !resp.status().is_success() {
            return Err(OrchestratorError::Inference(format!(
                "ollama pull failed for '{}': HTTP {}",
                model.id,
                resp.status()
            )));
        }
        self.loaded.insert(model.id.clone(), model.memory_bytes);
        Ok(())
    }

    async fn unload(&self, model_id: &str) -> Result<(), OrchestratorError> {
        // Ollama manages its own cache; dropping our record is enough to
        // stop routing to the instance.
        self.loaded.remove(model_id);
        Ok(())
    }

    async fn infer(
        &self,
        handle: CallHandle,
        model_id: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<InferenceResponse, OrchestratorError> {
        let aborted = self.aborts.register(handle);
        let request = self
            .client
            .post(self.url("/api/generate"))
            .json(&GenerateRequest {
                model: model_id,
                prompt,
                stream: false,
                options: GenerateOptions::from_params(params),
            })
            .send();

        let result = tokio::select! {
            resp = request => {
                match resp {
                    Ok(resp) if resp.status().is_success() => resp
                        .json::<GenerateResponse>()
                        .await
                        .map_err(|e| OrchestratorError::Inference(format!("ollama response parse: {e}")))
                        .map(|body| InferenceResponse {
                            tokens: body.eval_count.unwrap_or(0),
                            text: body.response,
                        }),
                    Ok(resp) => Err(OrchestratorError::Inference(format!(
                        "ollama generate failed: HTTP {}",
                        resp.status()
                    ))),
                    Err(e) => Err(map_http_error(e, self.timeout)),
                }
            }
            _ = aborted.notified() => Err(OrchestratorError::Inference("call aborted".into())),
        };
        self.aborts.complete(handle);
        result
    }

    async fn infer_stream(
        &self,
        handle: CallHandle,
        model_id: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<ChunkStream, OrchestratorError> {
        let aborted = self.aborts.register(handle);
        let resp = match self
            .client
            .post(self.url("/api/generate"))
            .json(&GenerateRequest {
                model: model_id,
                prompt,
                stream: true,
                options: GenerateOptions::from_params(params),
            })
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                self.aborts.complete(handle);
                return Err(map_http_error(e, self.timeout));
            }
        };
        if !resp.status().is_success() {
            self.aborts.complete(handle);
            return Err(OrchestratorError::Inference(format!(
                "ollama generate failed: HTTP {}",
                resp.status()
            )));
        }

        let (tx, rx) = mpsc::channel(16);
        let mut body = resp.bytes_stream();
        let aborts = self.aborts.clone();
        tokio::spawn(async move {
            let _cleanup = super::CompleteOnDrop::new(aborts, handle);
            let mut buf = Vec::new();
            loop {
                let bytes = tokio::select! {
                    next = body.next() => next,
                    _ = aborted.notified() => break,
                };
                let bytes = match bytes {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => {
                        let _ = tx
                            .send(Err(OrchestratorError::RuntimeConnection(
                                e.without_url().to_string(),
                            )))
                            .await;
                        return;
                    }
                    None => break,
                };
                buf.extend_from_slice(&bytes);
                // Ollama streams one JSON object per line.
                while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<GenerateResponse>(line) {
                        Ok(part) => {
                            if !part.response.is_empty()
                                && tx.send(Ok(StreamChunk::text(&part.response))).await.is_err()
                            {
                                return;
                            }
                            if part.done {
                                let _ = tx.send(Ok(StreamChunk::terminal())).await;
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "skipping malformed ollama stream line");
                        }
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn abort(&self, handle: CallHandle) {
        self.aborts.abort(handle);
    }

    async fn health(&self) -> RuntimeHealth {
        match self.client.get(self.url("/api/tags")).send().await {
            Ok(resp) if resp.status().is_success() => RuntimeHealth::Up,
            Ok(_) => RuntimeHealth::Degraded,
            Err(_) => RuntimeHealth::Down,
        }
    }

    async fn capacity(&self) -> CapacityReport {
        CapacityReport {
            used_bytes: self.loaded.iter().map(|e| *e.value()).sum(),
            total_bytes: 0,
        }
    }
}

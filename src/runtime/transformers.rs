//! Transformers backend adapter (text-generation-inference protocol).
//!
//! Covers HuggingFace model servers that expose the TGI HTTP surface:
//! `POST /generate` and `POST /generate_stream` (SSE), `GET /health` as the
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
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

#[derive(Serialize)]
struct GenerateRequest<'a> {
    inputs: &'a str,
    parameters: GenerateParameters,
}

#[derive(Serialize)]
struct GenerateParameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_new_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
}

impl From<&GenerationParams> for GenerateParameters {
    fn from(params: &GenerationParams) -> Self {
        Self {
            max_new_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            stop: params.stop.clone(),
        }
    }
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    generated_text: String,
}

#[derive(Deserialize)]
struct StreamToken {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct StreamEvent {
    token: Option<StreamToken>,
    /// Present only on the final event.
    generated_text: Option<String>,
}

/// Adapter for a TGI-style transformers server.
pub struct TransformersRuntime {
    endpoint: String,
    client: reqwest::Client,
    timeout: Duration,
    loaded: DashMap<String, u64>,
    aborts: Arc<AbortRegistry>,
}

impl TransformersRuntime {
    /// Build an adapter for the configured server endpoint.
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
            aborts: Arc::new(AbortRegistry::default()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.endpoint)
    }
}

#[async_trait]
impl RuntimeAdapter for TransformersRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Transformers
    }

    async fn load(&self, model: &ModelSpec) -> Result<(), OrchestratorError> {
        // The server hosts one model fixed at startup; confirm liveness.
        if self.health().await == RuntimeHealth::Down {
            return Err(OrchestratorError::RuntimeConnection(
                "transformers server unreachable".into(),
            ));
        }
        self.loaded.insert(model.id.clone(), model.memory_bytes);
        Ok(())
    }

    async fn unload(&self, model_id: &str) -> Result<(), OrchestratorError> {
        self.loaded.remove(model_id);
        Ok(())
    }

    async fn infer(
        &self,
        handle: CallHandle,
        _model_id: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<InferenceResponse, OrchestratorError> {
        let aborted = self.aborts.register(handle);
        let request = self
            .client
            .post(self.url("/generate"))
            .json(&GenerateRequest {
                inputs: prompt,
                parameters: params.into(),
            })
            .send();

        let result = tokio::select! {
            resp = request => {
                match resp {
                    Ok(resp) if resp.status().is_success() => {
                        match resp.json::<GenerateResponse>().await {
                            Ok(body) => {
                                let tokens = body.generated_text.split_whitespace().count() as u32;
                                Ok(InferenceResponse {
                                    text: body.generated_text,
                                    tokens,
                                })
                            }
                            Err(e) => Err(OrchestratorError::Inference(format!(
                                "transformers response parse: {e}"
                            ))),
                        }
                    }
                    Ok(resp) => Err(OrchestratorError::Inference(format!(
                        "transformers generate failed: HTTP {}",
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
        _model_id: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<ChunkStream, OrchestratorError> {
        let aborted = self.aborts.register(handle);
        let resp = match self
            .client
            .post(self.url("/generate_stream"))
            .json(&GenerateRequest {
                inputs: prompt,
                parameters: params.into(),
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
                "transformers generate failed: HTTP {}",
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
                while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);
                    let line = line.trim();
                    let Some(payload) = line.strip_prefix("data:") else {
                        continue;
                    };
                    match serde_json::from_str::<StreamEvent>(payload.trim()) {
                        Ok(event) => {
                            let text = event.token.map(|t| t.text).unwrap_or_default();
                            if !text.is_empty()
                                && tx.send(Ok(StreamChunk::text(text))).await.is_err()
                            {
                                return;
                            }
                            if event.generated_text.is_some() {
                                let _ = tx.send(Ok(StreamChunk::terminal())).await;
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "skipping malformed transformers stream event");
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
        match self.client.get(self.url("/health")).send().await {
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

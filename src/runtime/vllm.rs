//! vLLM backend adapter.
//!
//! Speaks the OpenAI-compatible completions API vLLM exposes:
//! `POST /v1/completions`, server-sent events when streaming, `GET /health`
//! as the health probe. vLLM serves the models it was launched with, so
//! `load` verifies the model is present rather than pulling anything.

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
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct CompletionUsage {
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

/// Adapter for a vLLM server.
pub struct VllmRuntime {
    endpoint: String,
    client: reqwest::Client,
    timeout: Duration,
    loaded: DashMap<String, u64>,
    aborts: Arc<AbortRegistry>,
}

impl VllmRuntime {
    /// Build an adapter for the configured vLLM endpoint.
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

    fn completion_body<'a>(
        model: &'a str,
        prompt: &'a str,
        params: &GenerationParams,
        stream: bool,
    ) -> CompletionRequest<'a> {
        CompletionRequest {
            model,
            prompt,
            stream,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            stop: params.stop.clone(),
        }
    }
}

#[async_trait]
impl RuntimeAdapter for VllmRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Vllm
    }

    async fn load(&self, model: &ModelSpec) -> Result<(), OrchestratorError> {
        if self.loaded.contains_key(&model.id) {
            return Ok(());
        }
        // vLLM cannot load models at runtime; confirm it is already served.
        let resp = self
            .client
            .get(self.url("/v1/models"))
            .send()
            .await
            .map_err(|e| map_http_error(e, self.timeout))?;
        if !resp.status().is_success() {
            return Err(OrchestratorError::Inference(format!(
                "vllm model list failed: HTTP {}",
                resp.status()
            )));
        }
        let list: ModelList = resp
            .json()
            .await
            .map_err(|e| OrchestratorError::Inference(format!("vllm model list parse: {e}")))?;
        if !list.data.iter().any(|m| m.id == model.id) {
            return Err(OrchestratorError::Inference(format!(
                "model '{}' is not served by this vllm instance",
                model.id
            )));
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
        model_id: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<InferenceResponse, OrchestratorError> {
        let aborted = self.aborts.register(handle);
        let request = self
            .client
            .post(self.url("/v1/completions"))
            .json(&Self::completion_body(model_id, prompt, params, false))
            .send();

        let result = tokio::select! {
            resp = request => {
                match resp {
                    Ok(resp) if resp.status().is_success() => {
                        match resp.json::<CompletionResponse>().await {
                            Ok(body) => {
                                let tokens =
                                    body.usage.as_ref().map(|u| u.completion_tokens).unwrap_or(0);
                                match body.choices.into_iter().next() {
                                    Some(choice) => Ok(InferenceResponse {
                                        text: choice.text,
                                        tokens,
                                    }),
                                    None => Err(OrchestratorError::Inference(
                                        "vllm returned no choices".into(),
                                    )),
                                }
                            }
                            Err(e) => Err(OrchestratorError::Inference(format!(
                                "vllm response parse: {e}"
                            ))),
                        }
                    }
                    Ok(resp) => Err(OrchestratorError::Inference(format!(
                        "vllm completion failed: HTTP {}",
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
            .post(self.url("/v1/completions"))
            .json(&Self::completion_body(model_id, prompt, params, true))
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
                "vllm completion failed: HTTP {}",
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
                // SSE framing: "data: {json}\n", terminated by "data: [DONE]".
                while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);
                    let line = line.trim();
                    let Some(payload) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let payload = payload.trim();
                    if payload == "[DONE]" {
                        let _ = tx.send(Ok(StreamChunk::terminal())).await;
                        return;
                    }
                    match serde_json::from_str::<CompletionResponse>(payload) {
                        Ok(part) => {
                            let text = part
                                .choices
                                .into_iter()
                                .next()
                                .map(|c| c.text)
                                .unwrap_or_default();
                            if !text.is_empty()
                                && tx.send(Ok(StreamChunk::text(text))).await.is_err()
                            {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "skipping malformed vllm stream event");
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

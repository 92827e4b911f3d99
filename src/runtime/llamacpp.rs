//! llama.cpp server adapter.
//!
//! Speaks the llama.cpp HTTP server API: `POST /completion` (SSE when
//! streaming), `GET /health` as the health probe. A llama.cpp server hosts
//! exactly the model it was started with, so `load` just records the model
//! against this instance.

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
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    n_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    content: String,
    #[serde(default)]
    stop: bool,
    #[serde(default)]
    tokens_predicted: Option<u32>,
}

/// Adapter for a llama.cpp server instance.
pub struct LlamaCppRuntime {
    endpoint: String,
    client: reqwest::Client,
    timeout: Duration,
    loaded: DashMap<String, u64>,
    aborts: Arc<AbortRegistry>,
}

impl LlamaCppRuntime {
    /// Build an adapter for the configured llama.cpp endpoint.
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
        prompt: &'a str,
        params: &GenerationParams,
        stream: bool,
    ) -> CompletionRequest<'a> {
        CompletionRequest {
            prompt,
            stream,
            n_predict: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            stop: params.stop.clone(),
        }
    }
}

#[async_trait]
impl RuntimeAdapter for LlamaCppRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::LlamaCpp
    }

    async fn load(&self, model: &ModelSpec) -> Result<(), OrchestratorError> {
        // The server is single-model; verify it is alive before accepting
        // the binding.
        if self.health().await == RuntimeHealth::Down {
            return Err(OrchestratorError::RuntimeConnection(
                "llama.cpp server unreachable".into(),
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
            .post(self.url("/completion"))
            .json(&Self::completion_body(prompt, params, false))
            .send();

        let result = tokio::select! {
            resp = request => {
                match resp {
                    Ok(resp) if resp.status().is_success() => {
                        match resp.json::<CompletionResponse>().await {
                            Ok(body) => Ok(InferenceResponse {
                                tokens: body.tokens_predicted.unwrap_or(0),
                                text: body.content,
                            }),
                            Err(e) => Err(OrchestratorError::Inference(format!(
                                "llama.cpp response parse: {e}"
                            ))),
                        }
                    }
                    Ok(resp) => Err(OrchestratorError::Inference(format!(
                        "llama.cpp completion failed: HTTP {}",
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
            .post(self.url("/completion"))
            .json(&Self::completion_body(prompt, params, true))
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
                "llama.cpp completion failed: HTTP {}",
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
                    match serde_json::from_str::<CompletionResponse>(payload.trim()) {
                        Ok(part) => {
                            if !part.content.is_empty()
                                && tx.send(Ok(StreamChunk::text(&part.content))).await.is_err()
                            {
                                return;
                            }
                            if part.stop {
                                let _ = tx.send(Ok(StreamChunk::terminal())).await;
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "skipping malformed llama.cpp stream event");
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
            // The server answers 503 while the model is still loading.
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_body_maps_max_tokens_to_n_predict() {
        let params = GenerationParams {
            max_tokens: Some(64),
            ..GenerationParams::default()
        };
        let body = LlamaCppRuntime::completion_body("hi", &params, false);
        let json = serde_json::to_value(&body).expect("test: serialize");
        assert_eq!(json["n_predict"], 64);
        assert!(json.get("temperature").is_none());
    }

    #[test]
    fn test_parse_completion_with_stop_flag() {
        let resp: CompletionResponse =
            serde_json::from_str(r#"{"content":"done","stop":true,"tokens_predicted":12}"#)
                .expect("test: parse");
        assert!(resp.stop);
        assert_eq!(resp.tokens_predicted, Some(12));
    }
}

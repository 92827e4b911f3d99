//! Runtime adapters: the uniform interface over inference backends.
//!
//! Each backend (Ollama, vLLM, llama.cpp server, a TGI-style transformers
//! server, and an in-process mock) implements [`RuntimeAdapter`]. The
//! orchestrator never speaks a backend's wire protocol directly.

mod llamacpp;
mod mock;
mod ollama;
mod transformers;
mod vllm;

pub use llamacpp::LlamaCppRuntime;
pub use mock::MockRuntime;
pub use ollama::OllamaRuntime;
pub use transformers::TransformersRuntime;
pub use vllm::VllmRuntime;

use crate::config::{ModelSpec, RuntimeKind, RuntimeSpec};
use crate::{GenerationParams, InferenceResponse, OrchestratorError, StreamChunk};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::BoxStream;
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

/// Stream of output chunks from a backend call.
pub type ChunkStream = BoxStream<'static, Result<StreamChunk, OrchestratorError>>;

/// Identifies one in-flight backend call, so it can be aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallHandle(Uuid);

impl CallHandle {
    /// Mint a fresh handle.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Backend health as observed by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeHealth {
    /// Reachable and serving.
    Up,
    /// Reachable but impaired; still routable.
    Degraded,
    /// Unreachable; excluded from routing.
    Down,
}

/// Memory picture an adapter reports for its backend.
#[derive(Debug, Clone, Copy)]
pub struct CapacityReport {
    /// Bytes the adapter believes are in use by loaded models.
    pub used_bytes: u64,
    /// Declared capacity of the backend.
    pub total_bytes: u64,
}

/// Uniform async interface to one inference backend instance.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    /// Which backend protocol this adapter speaks.
    fn kind(&self) -> RuntimeKind;

    /// Load a model onto the backend. Idempotent: loading an already
    /// loaded model succeeds without side effects.
    async fn load(&self, model: &ModelSpec) -> Result<(), OrchestratorError>;

    /// Unload a model. Unloading a model that is not loaded is a no-op.
    async fn unload(&self, model_id: &str) -> Result<(), OrchestratorError>;

    /// Run one non-streaming completion.
    async fn infer(
        &self,
        handle: CallHandle,
        model_id: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<InferenceResponse, OrchestratorError>;

    /// Run one streaming completion. The stream ends with a chunk whose
    /// `done` flag is set, or with an `Err` on mid-stream failure.
    async fn infer_stream(
        &self,
        handle: CallHandle,
        model_id: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<ChunkStream, OrchestratorError>;

    /// Abort an in-flight call. Aborting an unknown or finished call is a
    /// no-op.
    async fn abort(&self, handle: CallHandle);

    /// Probe backend health.
    async fn health(&self) -> RuntimeHealth;

    /// Report the backend's memory picture.
    async fn capacity(&self) -> CapacityReport;
}

/// Tracks abort signals for in-flight calls. HTTP adapters register a
/// handle before dispatching and race the request against the notify.
#[derive(Debug, Default)]
pub(crate) struct AbortRegistry {
    inner: DashMap<CallHandle, Arc<Notify>>,
}

impl AbortRegistry {
    pub(crate) fn register(&self, handle: CallHandle) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.inner.insert(handle, notify.clone());
        notify
    }

    pub(crate) fn complete(&self, handle: CallHandle) {
        self.inner.remove(&handle);
    }

    pub(crate) fn abort(&self, handle: CallHandle) {
        if let Some((_, notify)) = self.inner.remove(&handle) {
            notify.notify_waiters();
        }
    }
}

/// Drops the abort-registry entry for a call when the owning stream task
/// exits, whatever the exit path.
pub(crate) struct CompleteOnDrop {
    registry: Arc<AbortRegistry>,
    handle: CallHandle,
}

impl CompleteOnDrop {
    pub(crate) fn new(registry: Arc<AbortRegistry>, handle: CallHandle) -> Self {
        Self { registry, handle }
    }
}

impl Drop for CompleteOnDrop {
    fn drop(&mut self) {
        self.registry.complete(self.handle);
    }
}

/// Construct the adapter for a configured runtime.
///
/// # Errors
///
/// [`OrchestratorError::Config`] when the HTTP client cannot be built.
pub fn build_adapter(spec: &RuntimeSpec) -> Result<Arc<dyn RuntimeAdapter>, OrchestratorError> {
    Ok(match spec.kind {
        RuntimeKind::Ollama => Arc::new(OllamaRuntime::new(spec)?),
        RuntimeKind::Vllm => Arc::new(VllmRuntime::new(spec)?),
        RuntimeKind::LlamaCpp => Arc::new(LlamaCppRuntime::new(spec)?),
        RuntimeKind::Transformers => Arc::new(TransformersRuntime::new(spec)?),
        RuntimeKind::Mock => Arc::new(MockRuntime::new()),
    })
}

/// Build the shared HTTP client the adapters use.
pub(crate) fn http_client(spec: &RuntimeSpec) -> Result<reqwest::Client, OrchestratorError> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_millis(spec.timeout_ms))
        .build()
        .map_err(|e| OrchestratorError::Config(format!("http client: {e}")))
}

/// Map a reqwest error onto the orchestrator's error taxonomy. The URL is
/// stripped so error payloads never carry backend endpoints.
pub(crate) fn map_http_error(err: reqwest::Error, timeout: std::time::Duration) -> OrchestratorError {
    let err = err.without_url();
    if err.is_timeout() {
        OrchestratorError::RuntimeTimeout(timeout)
    } else if err.is_connect() {
        OrchestratorError::RuntimeConnection(err.to_string())
    } else {
        OrchestratorError::Inference(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_handles_unique() {
        assert_ne!(CallHandle::new(), CallHandle::new());
    }

    #[tokio::test]
    async fn test_abort_registry_notifies_registered() {
        let reg = AbortRegistry::default();
        let handle = CallHandle::new();
        let notify = reg.register(handle);
        let waiter = {
            let notify = notify.clone();
            tokio::spawn(async move { notify.notified().await })
        };
        tokio::task::yield_now().await;
        reg.abort(handle);
        waiter.await.expect("test: waiter");
    }

    #[test]
    fn test_abort_unknown_handle_is_noop() {
        let reg = AbortRegistry::default();
        reg.abort(CallHandle::new());
    }
}

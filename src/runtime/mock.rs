//! In-process mock backend for tests and local development.
//!
//! Behavior is scripted through the builder methods: injected failures,
//! artificial latency, canned stream chunks, mid-stream errors, and forced
//! health states. Call counters let tests assert which backends were
//! actually contacted.

use super::{AbortRegistry, CallHandle, CapacityReport, ChunkStream, RuntimeAdapter, RuntimeHealth};
use crate::config::{ModelSpec, RuntimeKind};
use crate::{GenerationParams, InferenceResponse, OrchestratorError, StreamChunk};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Scripted in-process runtime backend.
#[derive(Debug, Default)]
pub struct MockRuntime {
    delay: RwLock<Duration>,
    response_text: RwLock<String>,
    stream_chunks: RwLock<Vec<String>>,
    stream_fail_after: RwLock<Option<usize>>,
    fail_infers: AtomicU32,
    fail_loads: AtomicU32,
    health: RwLock<Option<RuntimeHealth>>,
    loaded: DashMap<String, u64>,
    infer_calls: AtomicU64,
    load_calls: AtomicU64,
    abort_calls: AtomicU64,
    aborts: Arc<AbortRegistry>,
}

impl MockRuntime {
    /// Mock that answers instantly with a fixed response.
    pub fn new() -> Self {
        Self {
            response_text: RwLock::new("mock response".to_string()),
            stream_chunks: RwLock::new(vec!["mock ".to_string(), "response".to_string()]),
            ..Self::default()
        }
    }

    /// Add artificial latency to every call.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.write() = delay;
        self
    }

    /// Set the non-streaming response text.
    pub fn with_response(self, text: &str) -> Self {
        *self.response_text.write() = text.to_string();
        self
    }

    /// Set the chunks emitted by streaming calls.
    pub fn with_stream_chunks(self, chunks: &[&str]) -> Self {
        *self.stream_chunks.write() = chunks.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Make streaming calls fail after emitting `n` chunks.
    pub fn with_stream_failure_after(self, n: usize) -> Self {
        *self.stream_fail_after.write() = Some(n);
        self
    }

    /// Fail the next `n` inference calls.
    pub fn fail_next_infers(self, n: u32) -> Self {
        self.fail_infers.store(n, Ordering::SeqCst);
        self
    }

    /// Fail the next `n` load calls.
    pub fn fail_next_loads(self, n: u32) -> Self {
        self.fail_loads.store(n, Ordering::SeqCst);
        self
    }

    /// Force the reported health state.
    pub fn with_health(self, health: RuntimeHealth) -> Self {
        *self.health.write() = Some(health);
        self
    }

    /// How many inference calls (streaming or not) reached this backend.
    pub fn infer_calls(&self) -> u64 {
        self.infer_calls.load(Ordering::SeqCst)
    }

    /// How many load calls reached this backend.
    pub fn load_calls(&self) -> u64 {
        self.load_calls.load(Ordering::SeqCst)
    }

    /// How many abort calls reached this backend.
    pub fn abort_calls(&self) -> u64 {
        self.abort_calls.load(Ordering::SeqCst)
    }

    /// Whether a model is currently loaded.
    pub fn is_loaded(&self, model_id: &str) -> bool {
        self.loaded.contains_key(model_id)
    }

    fn take_injected_failure(&self, counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl RuntimeAdapter for MockRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Mock
    }

    async fn load(&self, model: &ModelSpec) -> Result<(), OrchestratorError> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        if self.take_injected_failure(&self.fail_loads) {
            return Err(OrchestratorError::Inference("injected load failure".into()));
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
        _prompt: &str,
        _params: &GenerationParams,
    ) -> Result<InferenceResponse, OrchestratorError> {
        self.infer_calls.fetch_add(1, Ordering::SeqCst);
        if self.take_injected_failure(&self.fail_infers) {
            return Err(OrchestratorError::Inference(
                "injected inference failure".into(),
            ));
        }
        let delay = *self.delay.read();
        let aborted = self.aborts.register(handle);
        let result = tokio::select! {
            _ = tokio::time::sleep(delay) => {
                let text = self.response_text.read().clone();
                let tokens = text.split_whitespace().count() as u32;
                Ok(InferenceResponse { text, tokens })
            }
            _ = aborted.notified() => {
                Err(OrchestratorError::Inference("call aborted".into()))
            }
        };
        self.aborts.complete(handle);
        result
    }

    async fn infer_stream(
        &self,
        handle: CallHandle,
        _model_id: &str,
        _prompt: &str,
        _params: &GenerationParams,
    ) -> Result<ChunkStream, OrchestratorError> {
        self.infer_calls.fetch_add(1, Ordering::SeqCst);
        if self.take_injected_failure(&self.fail_infers) {
            return Err(OrchestratorError::Inference(
                "injected inference failure".into(),
            ));
        }
        let chunks = self.stream_chunks.read().clone();
        let fail_after = *self.stream_fail_after.read();
        let delay = *self.delay.read();
        let aborted = self.aborts.register(handle);
        let aborts = self.aborts.clone();
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            let _cleanup = super::CompleteOnDrop::new(aborts, handle);
            for (i, text) in chunks.into_iter().enumerate() {
                if fail_after == Some(i) {
                    let _ = tx
                        .send(Err(OrchestratorError::Inference(
                            "injected mid-stream failure".into(),
                        )))
                        .await;
                    return;
                }
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = aborted.notified() => return,
                }
                if tx.send(Ok(StreamChunk::text(&text))).await.is_err() {
                    return;
                }
            }
            if fail_after.is_some() {
                // Failure point past the last chunk: fail in place of the
                // terminal chunk.
                let _ = tx
                    .send(Err(OrchestratorError::Inference(
                        "injected mid-stream failure".into(),
                    )))
                    .await;
                return;
            }
            let _ = tx.send(Ok(StreamChunk::terminal())).await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn abort(&self, handle: CallHandle) {
        self.abort_calls.fetch_add(1, Ordering::SeqCst);
        self.aborts.abort(handle);
    }

    async fn health(&self) -> RuntimeHealth {
        self.health.read().unwrap_or(RuntimeHealth::Up)
    }

    async fn capacity(&self) -> CapacityReport {
        let used = self.loaded.iter().map(|e| *e.value()).sum();
        CapacityReport {
            used_bytes: used,
            total_bytes: u64::MAX,
        }
    }
}

//! # inference-orchestrator
//!
//! A multi-backend inference orchestrator over Tokio.
//!
//! Given a text-generation request (prompt, task type, parameters), the
//! orchestrator selects a model from the registry, binds it to a live
//! backend runtime, dispatches the request, and returns or streams the
//! result — tracking per-runtime capacity, circuit-breaking unhealthy
//! backends, retrying against fallback candidates, and supporting in-flight
//! migration of not-yet-streaming tasks.
//!
//! ## Architecture
//!
//! ```text
//! submit → Planner → Router → ResourceManager → RuntimeAdapter
//!             │          │            │               │
//!          Registry   Breakers    eviction      Ollama/vLLM/…
//! ```
//!
//! The HTTP layer, authentication, and prompt construction live outside
//! this crate; they consume the [`orchestrator::Orchestrator`] API.

// ── Lint policy (aerospace-grade) ─────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod breaker;
pub mod config;
pub mod metrics;
pub mod orchestrator;
pub mod planner;
pub mod registry;
pub mod resources;
pub mod router;
pub mod runtime;
pub mod task;

// Re-exports for convenience
pub use orchestrator::Orchestrator;
pub use runtime::{MockRuntime, RuntimeAdapter};
pub use task::{AttemptOutcome, AttemptRecord, TaskSnapshot, TaskStatus};

use task::AttemptRecord as Attempt;

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"` — structured JSON output for production log aggregators
/// - anything else (including unset) — human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`OrchestratorError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
pub fn init_tracing() -> Result<(), OrchestratorError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| OrchestratorError::Other(format!("tracing init failed: {e}")))
}

/// Top-level orchestrator errors.
///
/// Transient per-(model, runtime) failures (`CircuitOpen`, `RuntimeTimeout`,
/// `RuntimeConnection`, `ResourceExhausted`, `NoHealthyRuntime`) are
/// recovered internally by advancing to the next candidate; they only reach
/// the caller inside [`OrchestratorError::AllCandidatesExhausted`] once every
/// candidate has been tried. Structural errors (`ModelNotFound`,
/// `InvalidTaskState`, `Config`) are surfaced immediately without retry.
///
/// Error payloads never contain runtime endpoints or credentials.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// The requested model id (or alias) is unknown or disabled.
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// Every eligible runtime for a model was down, open-circuited, out of
    /// capacity, or failed to load the model.
    #[error("no healthy runtime for model '{0}'")]
    NoHealthyRuntime(String),

    /// A reservation could not be satisfied even after LRU eviction.
    #[error("resource exhausted on runtime '{runtime}': need {needed} bytes, {free} free")]
    ResourceExhausted {
        /// Runtime whose capacity was exhausted.
        runtime: String,
        /// Bytes the reservation asked for.
        needed: u64,
        /// Bytes currently free on the runtime.
        free: u64,
    },

    /// The circuit breaker for a (model, runtime) pair is open.
    #[error("circuit open for model '{model}' on runtime '{runtime}'")]
    CircuitOpen {
        /// Model half of the breaker key.
        model: String,
        /// Runtime half of the breaker key.
        runtime: String,
    },

    /// A runtime call exceeded its deadline.
    #[error("runtime call timed out after {0:?}")]
    RuntimeTimeout(Duration),

    /// A runtime backend could not be reached or dropped the connection.
    #[error("runtime connection failed: {0}")]
    RuntimeConnection(String),

    /// An operation was attempted in a state that forbids it (e.g. migrating
    /// a task after streaming started, or a double-cancel race).
    #[error("invalid task state: {0}")]
    InvalidTaskState(String),

    /// Terminal task failure: every planned candidate was attempted.
    /// Carries the full attempt history for observability.
    #[error("all candidates exhausted after {} attempt(s)", .attempts.len())]
    AllCandidatesExhausted {
        /// Ordered history of every (model, runtime, outcome) attempted.
        attempts: Vec<Attempt>,
    },

    /// A configuration value is missing or invalid.
    ///
    /// Returned at load/validation time so misconfiguration surfaces before
    /// the first request, never during dispatch.
    #[error("configuration error: {0}")]
    Config(String),

    /// An inference call failed at the backend (API error, parse error).
    #[error("inference failed: {0}")]
    Inference(String),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

impl OrchestratorError {
    /// Whether this error is transient for a single (model, runtime) pair,
    /// i.e. the orchestrator should advance to the next candidate rather
    /// than fail the task.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NoHealthyRuntime(_)
                | Self::ResourceExhausted { .. }
                | Self::CircuitOpen { .. }
                | Self::RuntimeTimeout(_)
                | Self::RuntimeConnection(_)
                | Self::Inference(_)
        )
    }
}

/// Generation parameters for an inference call.
///
/// All fields are optional; unset fields fall back to the task-type policy
/// defaults, then to the backend defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct GenerationParams {
    /// Maximum tokens to generate.
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Nucleus sampling parameter.
    pub top_p: Option<f32>,
    /// Stop sequences.
    pub stop: Option<Vec<String>>,
}

impl GenerationParams {
    /// Overlay `self` on top of `base`: fields set here win, unset fields
    /// fall through to `base`.
    pub fn overlay(&self, base: &GenerationParams) -> GenerationParams {
        GenerationParams {
            max_tokens: self.max_tokens.or(base.max_tokens),
            temperature: self.temperature.or(base.temperature),
            top_p: self.top_p.or(base.top_p),
            stop: self.stop.clone().or_else(|| base.stop.clone()),
        }
    }
}

/// An inference request submitted to the orchestrator.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    /// The raw prompt text to send to the model.
    pub prompt: String,
    /// Task type used for policy lookup (e.g. `"code_generation"`, `"chat"`).
    pub task_type: String,
    /// Explicit model override. When set, planning uses exactly this model
    /// with no fallback substitution.
    pub model: Option<String>,
    /// Explicit runtime override, honoured when binding the model.
    pub runtime: Option<String>,
    /// Request-level generation parameters (overlaid on policy defaults).
    pub params: GenerationParams,
    /// Request deadline. `None` uses the policy-wide default.
    pub timeout: Option<Duration>,
}

impl InferenceRequest {
    /// Create a request with a prompt and task type, everything else default.
    pub fn new(prompt: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            task_type: task_type.into(),
            model: None,
            runtime: None,
            params: GenerationParams::default(),
            timeout: None,
        }
    }

    /// Pin the request to an explicit model (disables fallback).
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Pin the request to an explicit runtime.
    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = Some(runtime.into());
        self
    }

    /// Set request-level generation parameters.
    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    /// Set the request deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Final response from a unary inference call.
#[derive(Debug, Clone, Serialize)]
pub struct InferenceResponse {
    /// Generated text.
    pub text: String,
    /// Token count reported (or estimated) by the backend.
    pub tokens: u32,
}

/// One chunk of a streaming response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamChunk {
    /// Text fragment produced by the backend.
    pub text: String,
    /// Whether this is the terminal chunk of the stream.
    pub done: bool,
}

impl StreamChunk {
    /// A non-terminal text chunk.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            done: false,
        }
    }

    /// The terminal chunk closing a stream.
    pub fn terminal() -> Self {
        Self {
            text: String::new(),
            done: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_overlay_request_wins() {
        let policy = GenerationParams {
            max_tokens: Some(2048),
            temperature: Some(0.2),
            top_p: Some(0.9),
            stop: None,
        };
        let request = GenerationParams {
            temperature: Some(0.9),
            ..GenerationParams::default()
        };
        let effective = request.overlay(&policy);
        assert_eq!(effective.temperature, Some(0.9));
        assert_eq!(effective.max_tokens, Some(2048));
        assert_eq!(effective.top_p, Some(0.9));
    }

    #[test]
    fn test_params_overlay_empty_request_keeps_policy() {
        let policy = GenerationParams {
            max_tokens: Some(512),
            ..GenerationParams::default()
        };
        let effective = GenerationParams::default().overlay(&policy);
        assert_eq!(effective, policy);
    }

    #[test]
    fn test_request_builder_sets_overrides() {
        let req = InferenceRequest::new("hello", "chat")
            .with_model("mistral")
            .with_runtime("ollama-main")
            .with_timeout(Duration::from_secs(5));
        assert_eq!(req.model.as_deref(), Some("mistral"));
        assert_eq!(req.runtime.as_deref(), Some("ollama-main"));
        assert_eq!(req.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_transient_classification() {
        assert!(OrchestratorError::RuntimeConnection("refused".into()).is_transient());
        assert!(OrchestratorError::CircuitOpen {
            model: "m".into(),
            runtime: "r".into()
        }
        .is_transient());
        assert!(!OrchestratorError::ModelNotFound("m".into()).is_transient());
        assert!(!OrchestratorError::InvalidTaskState("x".into()).is_transient());
    }

    #[test]
    fn test_exhausted_error_counts_attempts() {
        let err = OrchestratorError::AllCandidatesExhausted {
            attempts: vec![
                AttemptRecord {
                    model: "a".into(),
                    runtime: "r1".into(),
                    outcome: AttemptOutcome::Failed("connection refused".into()),
                },
                AttemptRecord {
                    model: "b".into(),
                    runtime: "r2".into(),
                    outcome: AttemptOutcome::Failed("timeout".into()),
                },
            ],
        };
        assert!(err.to_string().contains("2 attempt(s)"));
    }

    #[test]
    fn test_error_payload_contains_no_endpoint() {
        let err = OrchestratorError::CircuitOpen {
            model: "mistral".into(),
            runtime: "ollama-main".into(),
        };
        assert!(!err.to_string().contains("http"));
    }

    #[test]
    fn test_stream_chunk_constructors() {
        assert!(!StreamChunk::text("hi").done);
        assert!(StreamChunk::terminal().done);
    }

    #[test]
    fn test_init_tracing_second_call_returns_err() {
        // First call may succeed or fail depending on test execution order
        // (another test may have already installed a subscriber).
        let _ = init_tracing();
        // Second call must not panic — it should return Err.
        let result = init_tracing();
        assert!(result.is_err(), "double init must return Err, not panic");
    }
}

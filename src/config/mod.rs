//! # Stage: Declarative Orchestrator Configuration
//!
//! ## Responsibility
//! Parse and validate the TOML configuration that drives the orchestrator:
//! the model catalog, the runtime catalog, and the routing policy.
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same
//!   [`OrchestratorConfig`]
//! - Validated: all semantic constraints are checked before a config is
//!   accepted
//! - Type-safe: invalid field combinations are caught at parse time via serde
//! - Hot-swappable: a reloaded config replaces the previous one atomically;
//!   in-flight tasks keep the snapshot captured at planning time
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Producing the config file (that belongs to the external config loader)
//! - Runtime selection (that belongs to `router`)
//! - Model bookkeeping (that belongs to `registry`)

pub mod loader;

use crate::GenerationParams;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ── Default value functions ──────────────────────────────────────────────

/// Default maximum dispatch attempts per task.
fn default_max_attempts() -> u32 {
    3
}

/// Default request deadline: 120 000 ms.
fn default_request_timeout_ms() -> u64 {
    120_000
}

/// Default per-runtime concurrency slots.
fn default_concurrency_slots() -> u32 {
    4
}

/// Default per-runtime call timeout: 60 000 ms.
fn default_runtime_timeout_ms() -> u64 {
    60_000
}

/// Default breaker failure threshold.
fn default_failure_threshold() -> u32 {
    5
}

/// Default breaker sliding window: 60 s.
fn default_window_s() -> u64 {
    60
}

/// Default breaker cooldown before the first half-open probe: 30 s.
fn default_cooldown_s() -> u64 {
    30
}

/// Default breaker cooldown cap: 240 s (8× base).
fn default_cooldown_cap_s() -> u64 {
    240
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for an orchestrator instance.
///
/// Deserialized from a TOML file and validated before use. Treated as an
/// immutable snapshot after load; reload swaps the whole snapshot at once.
///
/// # Example
///
/// ```toml
/// [[models]]
/// id = "mistral"
/// family = "mistral"
/// memory_bytes = 6_000_000_000
/// recommended_runtimes = ["ollama", "llama_cpp"]
///
/// [[runtimes]]
/// id = "ollama-main"
/// kind = "ollama"
/// endpoint = "http://localhost:11434"
/// memory_bytes = 16_000_000_000
///
/// [policy]
/// default_models = ["mistral"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct OrchestratorConfig {
    /// Model catalog: every model the orchestrator may plan for.
    pub models: Vec<ModelSpec>,
    /// Alias → canonical model id mapping.
    #[serde(default)]
    pub aliases: HashMap<String, String>,
    /// Runtime catalog: every backend runtime instance.
    pub runtimes: Vec<RuntimeSpec>,
    /// Routing policy: candidate lists, limits, breaker settings.
    pub policy: RoutingPolicy,
}

// ── Model catalog ────────────────────────────────────────────────────────

/// Declared metadata for one model.
///
/// Immutable after load; the registry may mark a model disabled on refresh
/// but never mutates its spec.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ModelSpec {
    /// Canonical model id (e.g. "deepseek-coder").
    pub id: String,
    /// Model family (e.g. "qwen", "llama").
    pub family: String,
    /// Size class (e.g. "7b", "3.8b"). Informational.
    #[serde(default)]
    pub size: String,
    /// Maximum context length in tokens.
    #[serde(default)]
    pub context_length: u32,
    /// Capability tags (e.g. "code", "fast", "reasoning").
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Memory required to load this model, in bytes.
    pub memory_bytes: u64,
    /// Runtime kinds this model runs on, in preference order.
    pub recommended_runtimes: Vec<RuntimeKind>,
}

// ── Runtime catalog ──────────────────────────────────────────────────────

/// Supported backend runtime kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    /// Ollama server (`/api/generate`).
    Ollama,
    /// vLLM OpenAI-compatible server (`/v1/completions`).
    Vllm,
    /// llama.cpp HTTP server (`/completion`).
    LlamaCpp,
    /// Transformers text-generation server (`/generate`).
    Transformers,
    /// In-process mock runtime for tests and demos.
    Mock,
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RuntimeKind::Ollama => "ollama",
            RuntimeKind::Vllm => "vllm",
            RuntimeKind::LlamaCpp => "llama_cpp",
            RuntimeKind::Transformers => "transformers",
            RuntimeKind::Mock => "mock",
        };
        f.write_str(s)
    }
}

/// Declared metadata for one runtime instance.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RuntimeSpec {
    /// Unique runtime id (e.g. "ollama-main", "vllm-a100-0").
    pub id: String,
    /// Which adapter implementation serves this runtime.
    pub kind: RuntimeKind,
    /// Network endpoint of the backend (ignored by the mock kind).
    #[serde(default)]
    pub endpoint: String,
    /// Total memory capacity available for loaded models, in bytes.
    pub memory_bytes: u64,
    /// Concurrent request slots this runtime can serve.
    #[serde(default = "default_concurrency_slots")]
    pub concurrency_slots: u32,
    /// Per-call timeout for this runtime, in milliseconds.
    #[serde(default = "default_runtime_timeout_ms")]
    pub timeout_ms: u64,
}

// ── Routing policy ───────────────────────────────────────────────────────

/// Routing policy: which models serve which task types, and the limits the
/// dispatch loop operates under.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RoutingPolicy {
    /// Per task-type candidate lists and parameter defaults.
    #[serde(default)]
    pub by_task_type: HashMap<String, TaskPolicy>,
    /// Global fallback candidate list for unmapped task types.
    pub default_models: Vec<String>,
    /// Maximum dispatch attempts before a task fails with the aggregated
    /// attempt history.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Default request deadline in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Circuit breaker settings applied to every (model, runtime) pair.
    #[serde(default)]
    pub breaker: BreakerPolicy,
}

/// Candidate models and parameter defaults for one task type.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct TaskPolicy {
    /// Candidate model ids in priority order.
    pub models: Vec<String>,
    /// Default generation parameters for this task type.
    #[serde(default)]
    pub params: GenerationParams,
}

/// Circuit breaker tuning, shared by all (model, runtime) pairs.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BreakerPolicy {
    /// Consecutive failures within the window that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Sliding window (seconds) over which failures are counted.
    #[serde(default = "default_window_s")]
    pub window_s: u64,
    /// Cooldown (seconds) before the first half-open probe is allowed.
    #[serde(default = "default_cooldown_s")]
    pub cooldown_s: u64,
    /// Cap (seconds) on the exponentially growing cooldown.
    #[serde(default = "default_cooldown_cap_s")]
    pub cooldown_cap_s: u64,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            window_s: default_window_s(),
            cooldown_s: default_cooldown_s(),
            cooldown_cap_s: default_cooldown_cap_s(),
        }
    }
}

/// Export the JSON Schema for [`OrchestratorConfig`].
///
/// Enables IDE autocomplete when editing TOML config files.
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(OrchestratorConfig);
    serde_json::to_string_pretty(&schema)
}

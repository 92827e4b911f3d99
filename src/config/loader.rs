//! Configuration file loading and validation.
//!
//! ## Responsibility
//! Read a TOML file from disk, parse it into an [`OrchestratorConfig`], and
//! run semantic validation before returning. This is the entry point for
//! loading configuration at startup and on explicit refresh.
//!
//! ## Guarantees
//! - A successfully loaded config is always validated
//! - Validation collects *all* errors before returning (no short-circuit)
//! - File path is included in every error message

use std::collections::HashSet;
use std::path::Path;

use super::OrchestratorConfig;
use crate::OrchestratorError;

/// Load an [`OrchestratorConfig`] from a TOML file.
///
/// # Errors
///
/// Returns [`OrchestratorError::Config`] if the file cannot be read, the
/// TOML is malformed, or semantic validation fails.
pub fn load_from_file(path: &Path) -> Result<OrchestratorConfig, OrchestratorError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        OrchestratorError::Config(format!("cannot read {}: {e}", path.display()))
    })?;

    load_from_str(&content, &path.display().to_string())
}

/// Load an [`OrchestratorConfig`] from a TOML string.
///
/// Useful for testing or embedding configs without file I/O.
///
/// # Errors
///
/// Returns [`OrchestratorError::Config`] on parse or validation failure.
pub fn load_from_str(
    content: &str,
    source_name: &str,
) -> Result<OrchestratorConfig, OrchestratorError> {
    let config: OrchestratorConfig = toml::from_str(content)
        .map_err(|e| OrchestratorError::Config(format!("parse error in {source_name}: {e}")))?;

    validate(&config)
        .map_err(|errors| OrchestratorError::Config(errors.join("; ")))?;

    Ok(config)
}

/// Validate all semantic constraints on an [`OrchestratorConfig`].
///
/// Collects every violation before returning so the caller sees the full
/// scope of issues at once.
///
/// # Errors
///
/// Returns every violation found, one message per rule.
pub fn validate(config: &OrchestratorConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    let model_ids: HashSet<&str> = config.models.iter().map(|m| m.id.as_str()).collect();
    if model_ids.len() != config.models.len() {
        errors.push("models: duplicate model ids".to_string());
    }
    for model in &config.models {
        if model.memory_bytes == 0 {
            errors.push(format!("models.{}: memory_bytes must be > 0", model.id));
        }
        if model.recommended_runtimes.is_empty() {
            errors.push(format!(
                "models.{}: recommended_runtimes must not be empty",
                model.id
            ));
        }
    }

    let runtime_ids: HashSet<&str> = config.runtimes.iter().map(|r| r.id.as_str()).collect();
    if runtime_ids.len() != config.runtimes.len() {
        errors.push("runtimes: duplicate runtime ids".to_string());
    }
    if config.runtimes.is_empty() {
        errors.push("runtimes: at least one runtime is required".to_string());
    }
    for runtime in &config.runtimes {
        if runtime.memory_bytes == 0 {
            errors.push(format!("runtimes.{}: memory_bytes must be > 0", runtime.id));
        }
        if runtime.concurrency_slots == 0 {
            errors.push(format!(
                "runtimes.{}: concurrency_slots must be > 0",
                runtime.id
            ));
        }
        if runtime.kind != super::RuntimeKind::Mock && runtime.endpoint.is_empty() {
            errors.push(format!("runtimes.{}: endpoint is required", runtime.id));
        }
    }

    for (alias, target) in &config.aliases {
        if !model_ids.contains(target.as_str()) {
            errors.push(format!("aliases.{alias}: unknown target model '{target}'"));
        }
    }

    if config.policy.default_models.is_empty() {
        errors.push("policy.default_models must not be empty".to_string());
    }
    if config.policy.max_attempts == 0 {
        errors.push("policy.max_attempts must be > 0".to_string());
    }
    for id in &config.policy.default_models {
        if !model_ids.contains(id.as_str()) {
            errors.push(format!("policy.default_models: unknown model '{id}'"));
        }
    }
    for (task_type, task_policy) in &config.policy.by_task_type {
        if task_policy.models.is_empty() {
            errors.push(format!(
                "policy.by_task_type.{task_type}: models must not be empty"
            ));
        }
        for id in &task_policy.models {
            if !model_ids.contains(id.as_str()) {
                errors.push(format!(
                    "policy.by_task_type.{task_type}: unknown model '{id}'"
                ));
            }
        }
    }

    let breaker = &config.policy.breaker;
    if breaker.failure_threshold == 0 {
        errors.push("policy.breaker.failure_threshold must be > 0".to_string());
    }
    if breaker.cooldown_cap_s < breaker.cooldown_s {
        errors.push(format!(
            "policy.breaker.cooldown_cap_s ({}) must be >= cooldown_s ({})",
            breaker.cooldown_cap_s, breaker.cooldown_s
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

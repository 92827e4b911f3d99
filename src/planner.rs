//! Planner: maps an incoming task to an ordered list of candidate models.
//!
//! The planner is a pure function of the request, the policy snapshot, and
//! the registry — no I/O, no locking beyond a read of the current catalog.
//! Determinism matters: the same inputs always yield the same candidate
//! order, which the dispatch loop then walks front to back.

use crate::config::RoutingPolicy;
use crate::registry::ModelRegistry;
use crate::{GenerationParams, InferenceRequest, OrchestratorError};
use tracing::debug;

/// The planned execution for one task: candidates in priority order plus
/// the effective generation parameters.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Candidate model ids, highest priority first. Already filtered to
    /// registry-enabled models.
    pub candidates: Vec<String>,
    /// Policy defaults overlaid with request-level parameters.
    pub params: GenerationParams,
}

/// Produce the candidate list for a request.
///
/// - An explicit model override yields a single-candidate plan with no
///   fallback substitution; an unknown or disabled explicit model is an
///   immediate [`OrchestratorError::ModelNotFound`].
/// - Otherwise candidates come from the task-type policy (the global
///   default list when the task type is unmapped), filtered to enabled
///   models in policy-declared order. Models whose capability tags match
///   the task type are appended after the policy list, in ascending id
///   order so equal-priority additions are deterministic.
///
/// # Errors
///
/// [`OrchestratorError::ModelNotFound`] when an explicit model is unknown
/// or disabled.
pub fn plan(
    request: &InferenceRequest,
    policy: &RoutingPolicy,
    registry: &ModelRegistry,
) -> Result<Plan, OrchestratorError> {
    let task_policy = policy.by_task_type.get(&request.task_type);
    let policy_params = task_policy
        .map(|t| t.params.clone())
        .unwrap_or_default();
    let params = request.params.overlay(&policy_params);

    // Explicit choice is never silently overridden: one candidate, no
    // fallback, and an unknown/disabled model fails right here.
    if let Some(explicit) = &request.model {
        let spec = registry.get(explicit)?;
        return Ok(Plan {
            candidates: vec![spec.id.clone()],
            params,
        });
    }

    let declared = task_policy
        .map(|t| t.models.as_slice())
        .unwrap_or(policy.default_models.as_slice());

    let mut candidates: Vec<String> = Vec::new();
    for id in declared {
        let id = registry.resolve(id);
        if registry.is_enabled(&id) && !candidates.contains(&id) {
            candidates.push(id);
        }
    }

    // Capability-tagged models have no declared priority among themselves;
    // ascending id keeps the order reproducible.
    for id in registry.ids_with_capability(&request.task_type) {
        if !candidates.contains(&id) {
            candidates.push(id);
        }
    }

    debug!(
        task_type = %request.task_type,
        candidates = ?candidates,
        "planned candidates"
    );

    Ok(Plan { candidates, params })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelSpec, RuntimeKind, TaskPolicy};
    use std::collections::HashMap;

    fn spec(id: &str, caps: &[&str]) -> ModelSpec {
        ModelSpec {
            id: id.into(),
            family: id.into(),
            size: String::new(),
            context_length: 8192,
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
            memory_bytes: 1_000,
            recommended_runtimes: vec![RuntimeKind::Mock],
        }
    }

    fn policy() -> RoutingPolicy {
        RoutingPolicy {
            by_task_type: HashMap::from([(
                "code_generation".to_string(),
                TaskPolicy {
                    models: vec!["deepseek-coder".into(), "mistral".into()],
                    params: GenerationParams {
                        temperature: Some(0.2),
                        ..GenerationParams::default()
                    },
                },
            )]),
            default_models: vec!["mistral".into()],
            max_attempts: 3,
            request_timeout_ms: 120_000,
            breaker: crate::config::BreakerPolicy::default(),
        }
    }

    fn registry() -> ModelRegistry {
        ModelRegistry::new(
            &[
                spec("mistral", &["general"]),
                spec("deepseek-coder", &["code"]),
            ],
            HashMap::new(),
        )
    }

    #[test]
    fn test_task_type_candidates_in_policy_order() {
        let request = InferenceRequest::new("p", "code_generation");
        let plan = plan(&request, &policy(), &registry()).expect("test: plan");
        assert_eq!(plan.candidates, vec!["deepseek-coder", "mistral"]);
    }

    #[test]
    fn test_unmapped_task_type_falls_back_to_default_list() {
        let request = InferenceRequest::new("p", "creative_writing");
        let plan = plan(&request, &policy(), &registry()).expect("test: plan");
        assert_eq!(plan.candidates, vec!["mistral"]);
    }

    #[test]
    fn test_explicit_model_is_single_candidate() {
        let request = InferenceRequest::new("p", "code_generation").with_model("mistral");
        let plan = plan(&request, &policy(), &registry()).expect("test: plan");
        assert_eq!(plan.candidates, vec!["mistral"]);
    }

    #[test]
    fn test_explicit_unknown_model_fails_immediately() {
        let request = InferenceRequest::new("p", "chat").with_model("ghost");
        let err = plan(&request, &policy(), &registry()).expect_err("test: unknown model");
        assert!(matches!(err, OrchestratorError::ModelNotFound(_)));
    }

    #[test]
    fn test_explicit_disabled_model_fails_immediately() {
        let reg = registry();
        // Refresh without deepseek-coder: it becomes disabled.
        reg.refresh(&[spec("mistral", &["general"])], HashMap::new());
        let request = InferenceRequest::new("p", "chat").with_model("deepseek-coder");
        let err = plan(&request, &policy(), &reg).expect_err("test: disabled model");
        assert!(matches!(err, OrchestratorError::ModelNotFound(_)));
    }

    #[test]
    fn test_disabled_models_filtered_from_candidates() {
        let reg = registry();
        reg.refresh(&[spec("mistral", &["general"])], HashMap::new());
        let request = InferenceRequest::new("p", "code_generation");
        let plan = plan(&request, &policy(), &reg).expect("test: plan");
        assert_eq!(plan.candidates, vec!["mistral"]);
    }

    #[test]
    fn test_capability_matches_appended_ascending() {
        let reg = ModelRegistry::new(
            &[
                spec("mistral", &["general"]),
                spec("zeta-chat", &["chat"]),
                spec("alpha-chat", &["chat"]),
            ],
            HashMap::new(),
        );
        let request = InferenceRequest::new("p", "chat");
        let plan = plan(&request, &policy(), &reg).expect("test: plan");
        // Default list first, then capability matches in ascending id order.
        assert_eq!(plan.candidates, vec!["mistral", "alpha-chat", "zeta-chat"]);
    }

    #[test]
    fn test_params_overlay_policy_then_request() {
        let request = InferenceRequest::new("p", "code_generation").with_params(GenerationParams {
            max_tokens: Some(1024),
            ..GenerationParams::default()
        });
        let plan = plan(&request, &policy(), &registry()).expect("test: plan");
        assert_eq!(plan.params.temperature, Some(0.2)); // from policy
        assert_eq!(plan.params.max_tokens, Some(1024)); // from request
    }

    #[test]
    fn test_duplicate_candidates_collapse_to_first_position() {
        let mut p = policy();
        p.by_task_type.insert(
            "chat".into(),
            TaskPolicy {
                models: vec!["mistral".into(), "mistral".into()],
                params: GenerationParams::default(),
            },
        );
        let request = InferenceRequest::new("p", "chat");
        let plan = plan(&request, &p, &registry()).expect("test: plan");
        assert_eq!(plan.candidates, vec!["mistral"]);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let request = InferenceRequest::new("p", "code_generation");
        let reg = registry();
        let pol = policy();
        let a = plan(&request, &pol, &reg).expect("test: plan a");
        let b = plan(&request, &pol, &reg).expect("test: plan b");
        assert_eq!(a.candidates, b.candidates);
    }
}

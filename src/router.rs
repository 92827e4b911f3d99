//! Router: binds a chosen model to a live runtime.
//!
//! Eligibility follows the model's `recommended_runtimes` preference order,
//! filtered by backend health and circuit-breaker state. Among eligible
//! runtimes one with the model already loaded wins (lowest in-flight count,
//! round-robin on ties); otherwise the one with the most free memory is
//! tried, loading the model there and evicting an idle instance if needed.

use crate::breaker::{Breaker, BreakerRegistry, CallPermit};
use crate::config::{ModelSpec, RuntimeSpec};
use crate::registry::ModelRegistry;
use crate::resources::{ActiveGuard, ResourceManager};
use crate::runtime::{RuntimeAdapter, RuntimeHealth};
use crate::OrchestratorError;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// A model bound to a runtime, ready for one dispatch. Dropping the binding
/// releases the instance's in-flight pin.
pub struct Binding {
    /// The bound model.
    pub model: Arc<ModelSpec>,
    /// Runtime the call will run on.
    pub runtime_id: String,
    /// Adapter for that runtime.
    pub adapter: Arc<dyn RuntimeAdapter>,
    /// Breaker for this (model, runtime) pair; the dispatcher reports the
    /// call result to it.
    pub breaker: Arc<Breaker>,
    /// Permit acquired through the breaker.
    pub permit: CallPermit,
    /// Held for its release-on-drop effect.
    _guard: ActiveGuard,
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("model", &self.model)
            .field("runtime_id", &self.runtime_id)
            .field("breaker", &self.breaker)
            .field("permit", &self.permit)
            .finish_non_exhaustive()
    }
}

struct RuntimeHandle {
    spec: RuntimeSpec,
    adapter: Arc<dyn RuntimeAdapter>,
}

/// Binds models to runtimes.
pub struct Router {
    registry: Arc<ModelRegistry>,
    resources: Arc<ResourceManager>,
    breakers: Arc<BreakerRegistry>,
    runtimes: HashMap<String, RuntimeHandle>,
    /// Per-model rotation counter for breaking ties between equally loaded
    /// runtimes.
    rotation: DashMap<String, AtomicUsize>,
}

impl Router {
    /// Build a router over the given runtimes and their adapters.
    pub fn new(
        registry: Arc<ModelRegistry>,
        resources: Arc<ResourceManager>,
        breakers: Arc<BreakerRegistry>,
        runtimes: Vec<(RuntimeSpec, Arc<dyn RuntimeAdapter>)>,
    ) -> Self {
        Self {
            registry,
            resources,
            breakers,
            runtimes: runtimes
                .into_iter()
                .map(|(spec, adapter)| (spec.id.clone(), RuntimeHandle { spec, adapter }))
                .collect(),
            rotation: DashMap::new(),
        }
    }

    /// Adapter for a runtime id, if registered.
    pub fn adapter(&self, runtime_id: &str) -> Option<Arc<dyn RuntimeAdapter>> {
        self.runtimes.get(runtime_id).map(|h| h.adapter.clone())
    }

    /// All registered runtime ids, sorted.
    pub fn runtime_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.runtimes.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Runtime ids eligible for `model`, in preference order: the model's
    /// recommended kinds first, id order within a kind. Health and breaker
    /// state are not consulted here.
    fn candidate_runtimes(&self, model: &ModelSpec) -> Vec<String> {
        let mut out = Vec::new();
        for kind in &model.recommended_runtimes {
            let mut ids: Vec<&String> = self
                .runtimes
                .iter()
                .filter(|(_, h)| h.spec.kind == *kind)
                .map(|(id, _)| id)
                .collect();
            ids.sort();
            out.extend(ids.into_iter().cloned());
        }
        out
    }

    async fn eligible_runtimes(&self, model: &ModelSpec) -> Vec<String> {
        let now = Instant::now();
        let mut eligible = Vec::new();
        for id in self.candidate_runtimes(model) {
            let Some(handle) = self.runtimes.get(&id) else {
                continue;
            };
            if !self.breakers.get(&model.id, &id).status_allows(now) {
                debug!(model = %model.id, runtime = %id, "skipping runtime: breaker open");
                continue;
            }
            if handle.adapter.health().await == RuntimeHealth::Down {
                debug!(model = %model.id, runtime = %id, "skipping runtime: down");
                continue;
            }
            eligible.push(id);
        }
        eligible
    }

    /// Bind `model_id` to the best eligible runtime.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::ModelNotFound`] for unknown or disabled models,
    /// [`OrchestratorError::NoHealthyRuntime`] when every eligible runtime
    /// was rejected or failed the load.
    pub async fn bind(&self, model_id: &str) -> Result<Binding, OrchestratorError> {
        let model = self.registry.get(model_id)?;
        let eligible = self.eligible_runtimes(&model).await;
        if eligible.is_empty() {
            return Err(OrchestratorError::NoHealthyRuntime(model.id.clone()));
        }

        // Runtimes that already have the model loaded, cheapest first.
        let mut ready: Vec<(String, u32)> = Vec::new();
        for id in &eligible {
            if let Some(active) = self.resources.active_calls(id, &model.id).await {
                ready.push((id.clone(), active));
            }
        }
        let mut ordered: Vec<String> = Vec::new();
        if !ready.is_empty() {
            let min_active = ready.iter().map(|(_, a)| *a).min().unwrap_or(0);
            let mut tied: Vec<String> = ready
                .iter()
                .filter(|(_, a)| *a == min_active)
                .map(|(id, _)| id.clone())
                .collect();
            if tied.len() > 1 {
                let counter = self
                    .rotation
                    .entry(model.id.clone())
                    .or_insert_with(|| AtomicUsize::new(0));
                let start = counter.fetch_add(1, Ordering::Relaxed) % tied.len();
                tied.rotate_left(start);
            }
            ordered.extend(tied);
            ordered.extend(
                ready
                    .iter()
                    .filter(|(_, a)| *a != min_active)
                    .map(|(id, _)| id.clone()),
            );
        }
        // Cold runtimes next, most free memory first.
        let mut cold: Vec<(String, u64)> = Vec::new();
        for id in &eligible {
            if !ordered.contains(id) {
                cold.push((id.clone(), self.resources.free_bytes(id).await));
            }
        }
        cold.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ordered.extend(cold.into_iter().map(|(id, _)| id));

        for runtime_id in ordered {
            match self.try_bind(&model, &runtime_id).await {
                Ok(binding) => return Ok(binding),
                Err(e) => {
                    debug!(model = %model.id, runtime = %runtime_id, error = %e, "bind attempt failed");
                }
            }
        }
        Err(OrchestratorError::NoHealthyRuntime(model.id.clone()))
    }

    /// Bind `model_id` to an explicitly named runtime, used for pinned
    /// requests and migration targets.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::NoHealthyRuntime`] when the runtime is unknown
    /// or down, plus everything [`Router::bind`] can return per attempt.
    pub async fn bind_to(
        &self,
        model_id: &str,
        runtime_id: &str,
    ) -> Result<Binding, OrchestratorError> {
        let model = self.registry.get(model_id)?;
        let handle = self
            .runtimes
            .get(runtime_id)
            .ok_or_else(|| OrchestratorError::NoHealthyRuntime(model.id.clone()))?;
        if handle.adapter.health().await == RuntimeHealth::Down {
            return Err(OrchestratorError::NoHealthyRuntime(model.id.clone()));
        }
        self.try_bind(&model, runtime_id).await
    }

    /// One bind attempt against one runtime: breaker permit, reservation
    /// (with eviction), backend load, instance pin.
    async fn try_bind(
        &self,
        model: &Arc<ModelSpec>,
        runtime_id: &str,
    ) -> Result<Binding, OrchestratorError> {
        let handle = self
            .runtimes
            .get(runtime_id)
            .ok_or_else(|| OrchestratorError::NoHealthyRuntime(model.id.clone()))?;
        let breaker = self.breakers.get(&model.id, runtime_id);
        let permit = breaker.try_acquire(Instant::now())?;
        // Capacity exits between acquire and dispatch hand a probe slot
        // back; only a backend fault counts as a breaker failure.
        let give_back = || {
            if permit == CallPermit::Probe {
                breaker.release_probe();
            }
        };

        if !self.resources.is_ready(runtime_id, &model.id).await {
            let reservation = match self.resources.reserve(runtime_id, model).await {
                Ok(reservation) => reservation,
                Err(e) => {
                    give_back();
                    return Err(e);
                }
            };
            if let Some(victim) = reservation.evicted {
                // Best effort: the accounting already dropped the victim.
                if let Err(e) = handle.adapter.unload(&victim).await {
                    warn!(runtime = %runtime_id, model = %victim, error = %e, "evicted model unload failed");
                }
            }
            if let Err(e) = handle.adapter.load(model).await {
                // record_failure resolves the probe, so no release here.
                breaker.record_failure(Instant::now());
                self.resources.release(runtime_id, &model.id).await?;
                return Err(e);
            }
            if let Err(e) = self.resources.mark_ready(runtime_id, &model.id).await {
                give_back();
                return Err(e);
            }
        }

        let guard = match self.resources.acquire_active(runtime_id, &model.id).await {
            Some(guard) => guard,
            None => {
                give_back();
                return Err(OrchestratorError::NoHealthyRuntime(model.id.clone()));
            }
        };

        debug!(model = %model.id, runtime = %runtime_id, "bound model to runtime");
        Ok(Binding {
            model: model.clone(),
            runtime_id: runtime_id.to_string(),
            adapter: handle.adapter.clone(),
            breaker,
            permit,
            _guard: guard,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerPolicy, RuntimeKind};
    use crate::runtime::MockRuntime;
    use std::collections::HashMap as StdHashMap;

    fn model_spec(id: &str, bytes: u64) -> ModelSpec {
        ModelSpec {
            id: id.into(),
            family: id.into(),
            size: String::new(),
            context_length: 8192,
            capabilities: vec![],
            memory_bytes: bytes,
            recommended_runtimes: vec![RuntimeKind::Mock],
        }
    }

    fn runtime_spec(id: &str, bytes: u64) -> RuntimeSpec {
        RuntimeSpec {
            id: id.into(),
            kind: RuntimeKind::Mock,
            endpoint: String::new(),
            memory_bytes: bytes,
            concurrency_slots: 4,
            timeout_ms: 60_000,
        }
    }

    fn router_with(
        models: &[ModelSpec],
        runtimes: Vec<(RuntimeSpec, Arc<MockRuntime>)>,
    ) -> Router {
        let registry = Arc::new(ModelRegistry::new(models, StdHashMap::new()));
        let specs: Vec<RuntimeSpec> = runtimes.iter().map(|(s, _)| s.clone()).collect();
        let resources = Arc::new(ResourceManager::new(&specs));
        let breakers = Arc::new(BreakerRegistry::new(BreakerPolicy::default()));
        Router::new(
            registry,
            resources,
            breakers,
            runtimes
                .into_iter()
                .map(|(s, a)| (s, a as Arc<dyn RuntimeAdapter>))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_bind_loads_model_on_cold_runtime() {
        let mock = Arc::new(MockRuntime::new());
        let router = router_with(
            &[model_spec("m", 50)],
            vec![(runtime_spec("r0", 100), mock.clone())],
        );
        let binding = router.bind("m").await.expect("test: bind");
        assert_eq!(binding.runtime_id, "r0");
        assert_eq!(mock.load_calls(), 1);
        assert!(mock.is_loaded("m"));
    }

    #[tokio::test]
    async fn test_bind_prefers_runtime_with_model_loaded() {
        let warm = Arc::new(MockRuntime::new());
        let cold = Arc::new(MockRuntime::new());
        let router = router_with(
            &[model_spec("m", 50)],
            vec![
                (runtime_spec("r-cold", 1_000), cold.clone()),
                (runtime_spec("r-warm", 100), warm.clone()),
            ],
        );
        // Warm up r-warm.
        router
            .bind_to("m", "r-warm")
            .await
            .expect("test: warm bind");
        let binding = router.bind("m").await.expect("test: bind");
        assert_eq!(binding.runtime_id, "r-warm");
        assert_eq!(cold.load_calls(), 0);
    }

    #[tokio::test]
    async fn test_bind_skips_down_runtime() {
        let down = Arc::new(MockRuntime::new().with_health(RuntimeHealth::Down));
        let up = Arc::new(MockRuntime::new());
        let router = router_with(
            &[model_spec("m", 50)],
            vec![
                (runtime_spec("r0", 100), down.clone()),
                (runtime_spec("r1", 100), up),
            ],
        );
        let binding = router.bind("m").await.expect("test: bind");
        assert_eq!(binding.runtime_id, "r1");
        assert_eq!(down.load_calls(), 0);
    }

    #[tokio::test]
    async fn test_bind_fails_when_all_runtimes_down() {
        let down = Arc::new(MockRuntime::new().with_health(RuntimeHealth::Down));
        let router = router_with(&[model_spec("m", 50)], vec![(runtime_spec("r0", 100), down)]);
        let err = router.bind("m").await.expect_err("test: no runtime");
        assert!(matches!(err, OrchestratorError::NoHealthyRuntime(_)));
    }

    #[tokio::test]
    async fn test_load_failure_falls_through_to_next_runtime() {
        let failing = Arc::new(MockRuntime::new().fail_next_loads(1));
        let healthy = Arc::new(MockRuntime::new());
        let router = router_with(
            &[model_spec("m", 50)],
            vec![
                // Larger free pool makes r0 the first cold choice.
                (runtime_spec("r0", 1_000), failing.clone()),
                (runtime_spec("r1", 100), healthy.clone()),
            ],
        );
        let binding = router.bind("m").await.expect("test: bind");
        assert_eq!(binding.runtime_id, "r1");
        assert_eq!(failing.load_calls(), 1);
        assert_eq!(healthy.load_calls(), 1);
    }

    #[tokio::test]
    async fn test_bind_evicts_idle_model_when_full() {
        let mock = Arc::new(MockRuntime::new());
        let router = router_with(
            &[model_spec("old", 60), model_spec("new", 60)],
            vec![(runtime_spec("r0", 100), mock.clone())],
        );
        drop(router.bind("old").await.expect("test: first bind"));
        let binding = router.bind("new").await.expect("test: second bind");
        assert_eq!(binding.runtime_id, "r0");
        assert!(!mock.is_loaded("old"));
        assert!(mock.is_loaded("new"));
    }

    #[tokio::test]
    async fn test_open_breaker_blocks_binding() {
        let mock = Arc::new(MockRuntime::new());
        let registry = Arc::new(ModelRegistry::new(&[model_spec("m", 50)], StdHashMap::new()));
        let specs = vec![runtime_spec("r0", 100)];
        let resources = Arc::new(ResourceManager::new(&specs));
        let breakers = Arc::new(BreakerRegistry::new(BreakerPolicy::default()));
        let breaker = breakers.get("m", "r0");
        let now = Instant::now();
        for _ in 0..BreakerPolicy::default().failure_threshold {
            breaker.record_failure(now);
        }
        let router = Router::new(
            registry,
            resources,
            breakers,
            vec![(specs[0].clone(), mock.clone() as Arc<dyn RuntimeAdapter>)],
        );
        let err = router.bind("m").await.expect_err("test: breaker open");
        assert!(matches!(err, OrchestratorError::NoHealthyRuntime(_)));
        assert_eq!(mock.load_calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_bind_releases_probe_permit() {
        let mock = Arc::new(MockRuntime::new());
        let registry = Arc::new(ModelRegistry::new(
            &[model_spec("m", 60), model_spec("hog", 60)],
            StdHashMap::new(),
        ));
        let specs = vec![runtime_spec("r0", 100)];
        let resources = Arc::new(ResourceManager::new(&specs));
        let breakers = Arc::new(BreakerRegistry::new(BreakerPolicy {
            failure_threshold: 1,
            window_s: 60,
            cooldown_s: 0,
            cooldown_cap_s: 240,
        }));
        breakers.get("m", "r0").record_failure(Instant::now());
        let router = Router::new(
            registry,
            resources.clone(),
            breakers,
            vec![(specs[0].clone(), mock as Arc<dyn RuntimeAdapter>)],
        );

        // A pinned instance fills the runtime so the probe's reservation
        // fails after the permit is taken.
        let hog = model_spec("hog", 60);
        resources.reserve("r0", &hog).await.expect("test: reserve hog");
        resources.mark_ready("r0", "hog").await.expect("test: ready hog");
        let pin = resources
            .acquire_active("r0", "hog")
            .await
            .expect("test: pin hog");
        router.bind("m").await.expect_err("test: capacity exhausted");

        // Once capacity frees up the next caller must be admitted as the
        // probe instead of finding the slot still taken.
        drop(pin);
        resources.release("r0", "hog").await.expect("test: release hog");
        let binding = router.bind("m").await.expect("test: probe admitted");
        assert_eq!(binding.runtime_id, "r0");
    }

    #[tokio::test]
    async fn test_bind_unknown_model_fails() {
        let router = router_with(
            &[model_spec("m", 50)],
            vec![(runtime_spec("r0", 100), Arc::new(MockRuntime::new()))],
        );
        let err = router.bind("ghost").await.expect_err("test: unknown");
        assert!(matches!(err, OrchestratorError::ModelNotFound(_)));
    }
}

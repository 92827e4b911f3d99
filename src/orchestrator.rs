//! The orchestrator: public API tying planner, router, resources, breakers,
//! and task state together.
//!
//! Each submitted task runs on its own Tokio task (the driver). The driver
//! walks the planned candidate list, binding and dispatching one candidate
//! at a time, and reacts to cancel, migrate, and deadline signals between
//! and during dispatches. Callers observe tasks through snapshots, the
//! status watch ([`Orchestrator::wait`]), and the chunk stream
//! ([`Orchestrator::subscribe`]).

use crate::breaker::{BreakerRegistry, BreakerStatus};
use crate::config::{loader, OrchestratorConfig, RoutingPolicy};
use crate::planner;
use crate::registry::{ModelFilter, ModelInfo, ModelRegistry};
use crate::resources::{ResourceManager, RuntimeUtilization};
use crate::router::{Binding, Router};
use crate::runtime::{build_adapter, CallHandle, RuntimeAdapter, RuntimeHealth};
use crate::task::{AttemptOutcome, AttemptRecord, TaskEntry, TaskSnapshot, TaskStatus};
use crate::{metrics, InferenceRequest, InferenceResponse, OrchestratorError, StreamChunk};
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Terminal tasks kept for late `status`/`result` lookups. Beyond this the
/// oldest finished tasks are reaped at the next submit.
const FINISHED_TASK_RETENTION: usize = 1024;

/// Overall service health.
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Seconds since the orchestrator was built.
    pub uptime_s: u64,
    /// Per-runtime health and memory picture.
    pub runtimes: Vec<RuntimeReport>,
}

/// Health of one runtime.
#[derive(Debug, Clone)]
pub struct RuntimeReport {
    /// Runtime id.
    pub runtime: String,
    /// Adapter-observed health.
    pub health: RuntimeHealth,
    /// Memory accounting for the runtime.
    pub utilization: RuntimeUtilization,
}

/// Point-in-time operational counters.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Tasks currently in a non-terminal state.
    pub active_tasks: usize,
    /// Completed task count.
    pub completed: usize,
    /// Failed task count.
    pub failed: usize,
    /// Cancelled task count.
    pub cancelled: usize,
    /// Breaker status per (model, runtime).
    pub breakers: Vec<(String, String, BreakerStatus)>,
    /// Memory utilization per runtime.
    pub utilization: Vec<RuntimeUtilization>,
}

/// Builder for [`Orchestrator`], allowing adapter injection.
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    adapters: HashMap<String, Arc<dyn RuntimeAdapter>>,
}

impl OrchestratorBuilder {
    /// Inject an adapter for a runtime id instead of constructing one from
    /// the runtime's configured kind and endpoint.
    pub fn adapter(mut self, runtime_id: &str, adapter: Arc<dyn RuntimeAdapter>) -> Self {
        self.adapters.insert(runtime_id.to_string(), adapter);
        self
    }

    /// Validate the configuration and assemble the orchestrator.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Config`] listing every validation violation, or
    /// an adapter construction failure.
    pub fn build(self) -> Result<Orchestrator, OrchestratorError> {
        if let Err(violations) = loader::validate(&self.config) {
            return Err(OrchestratorError::Config(violations.join("; ")));
        }

        let registry = Arc::new(ModelRegistry::new(
            &self.config.models,
            self.config.aliases.clone(),
        ));
        let resources = Arc::new(ResourceManager::new(&self.config.runtimes));
        let breakers = Arc::new(BreakerRegistry::new(self.config.policy.breaker.clone()));

        let mut runtimes = Vec::new();
        for spec in &self.config.runtimes {
            let adapter = match self.adapters.get(&spec.id) {
                Some(adapter) => adapter.clone(),
                None => build_adapter(spec)?,
            };
            runtimes.push((spec.clone(), adapter));
        }
        let router = Arc::new(Router::new(
            registry.clone(),
            resources.clone(),
            breakers.clone(),
            runtimes,
        ));

        info!(
            models = self.config.models.len(),
            runtimes = self.config.runtimes.len(),
            "orchestrator ready"
        );
        Ok(Orchestrator {
            policy: RwLock::new(Arc::new(self.config.policy)),
            registry,
            resources,
            breakers,
            router,
            tasks: Arc::new(DashMap::new()),
            started_at: Instant::now(),
            shutting_down: AtomicBool::new(false),
        })
    }
}

/// Multi-backend inference orchestrator.
pub struct Orchestrator {
    policy: RwLock<Arc<RoutingPolicy>>,
    registry: Arc<ModelRegistry>,
    resources: Arc<ResourceManager>,
    breakers: Arc<BreakerRegistry>,
    router: Arc<Router>,
    tasks: Arc<DashMap<Uuid, Arc<TaskEntry>>>,
    started_at: Instant,
    shutting_down: AtomicBool,
}

impl Orchestrator {
    /// Start building an orchestrator from a validated configuration.
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            adapters: HashMap::new(),
        }
    }

    /// Build an orchestrator with adapters constructed from configuration.
    ///
    /// # Errors
    ///
    /// See [`OrchestratorBuilder::build`].
    pub fn new(config: OrchestratorConfig) -> Result<Self, OrchestratorError> {
        Self::builder(config).build()
    }

    fn policy(&self) -> Arc<RoutingPolicy> {
        self.policy.read().clone()
    }

    fn entry(&self, task_id: Uuid) -> Result<Arc<TaskEntry>, OrchestratorError> {
        self.tasks
            .get(&task_id)
            .map(|e| e.clone())
            .ok_or_else(|| OrchestratorError::Other(format!("unknown task: {task_id}")))
    }

    /// Drop the oldest terminal tasks once the table exceeds `retention`.
    /// Active tasks are never reaped.
    fn reap_finished(&self, retention: usize) {
        let excess = self.tasks.len().saturating_sub(retention);
        if excess == 0 {
            return;
        }
        let mut finished: Vec<(Instant, Uuid)> = self
            .tasks
            .iter()
            .filter(|e| e.value().status().is_terminal())
            .map(|e| (e.value().created_at, *e.key()))
            .collect();
        finished.sort_by_key(|(created, _)| *created);
        for (_, id) in finished.into_iter().take(excess) {
            self.tasks.remove(&id);
            debug!(task = %id, "reaped finished task");
        }
    }

    /// Submit a unary task. Returns immediately with the task id; the
    /// result is available through [`Orchestrator::wait`] once terminal.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::ModelNotFound`] when an explicit model is
    /// unknown or disabled; [`OrchestratorError::Other`] for unknown
    /// explicit runtimes or during shutdown.
    pub fn submit(&self, request: InferenceRequest) -> Result<Uuid, OrchestratorError> {
        self.submit_inner(request, false)
    }

    /// Submit a streaming task. Chunks are consumed through
    /// [`Orchestrator::subscribe`].
    ///
    /// # Errors
    ///
    /// Same as [`Orchestrator::submit`].
    pub fn submit_streaming(
        &self,
        request: InferenceRequest,
    ) -> Result<Uuid, OrchestratorError> {
        self.submit_inner(request, true)
    }

    fn submit_inner(
        &self,
        request: InferenceRequest,
        streaming: bool,
    ) -> Result<Uuid, OrchestratorError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Other("orchestrator is shutting down".into()));
        }
        // Explicit pins fail fast, before a task ever exists.
        if let Some(model) = &request.model {
            self.registry.get(model)?;
        }
        if let Some(runtime) = &request.runtime {
            if self.router.adapter(runtime).is_none() {
                return Err(OrchestratorError::Other(format!(
                    "unknown runtime: {runtime}"
                )));
            }
        }

        self.reap_finished(FINISHED_TASK_RETENTION);

        let entry = Arc::new(TaskEntry::new());
        let chunk_tx = if streaming {
            let (tx, rx) = mpsc::channel(32);
            entry.install_chunks(rx);
            Some(tx)
        } else {
            None
        };
        self.tasks.insert(entry.id, entry.clone());
        metrics::record_submitted(&request.task_type);
        debug!(task = %entry.id, task_type = %request.task_type, streaming, "task submitted");

        let driver = Driver {
            router: self.router.clone(),
            registry: self.registry.clone(),
            policy: self.policy(),
            entry: entry.clone(),
            request,
            streaming,
            chunk_tx,
        };
        tokio::spawn(driver.run());
        Ok(entry.id)
    }

    /// Current snapshot of a task.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Other`] for unknown task ids.
    pub fn status(&self, task_id: Uuid) -> Result<TaskSnapshot, OrchestratorError> {
        Ok(self.entry(task_id)?.snapshot())
    }

    /// Await a task's terminal state and return its final snapshot.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Other`] for unknown task ids.
    pub async fn wait(&self, task_id: Uuid) -> Result<TaskSnapshot, OrchestratorError> {
        let entry = self.entry(task_id)?;
        let mut rx = entry.watch_status();
        while !rx.borrow_and_update().is_terminal() {
            rx.changed()
                .await
                .map_err(|_| OrchestratorError::Other("task state lost".into()))?;
        }
        Ok(entry.snapshot())
    }

    /// Final response of a completed task, if any.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Other`] for unknown task ids.
    pub fn result(&self, task_id: Uuid) -> Result<Option<InferenceResponse>, OrchestratorError> {
        Ok(self.entry(task_id)?.output())
    }

    /// Take the chunk stream of a streaming task. Only the first subscriber
    /// receives chunks; later calls get an already-closed stream.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Other`] for unknown task ids.
    pub fn subscribe(
        &self,
        task_id: Uuid,
    ) -> Result<ReceiverStream<Result<StreamChunk, OrchestratorError>>, OrchestratorError> {
        let entry = self.entry(task_id)?;
        match entry.take_chunks() {
            Some(rx) => Ok(ReceiverStream::new(rx)),
            None => {
                let (_, rx) = mpsc::channel(1);
                Ok(ReceiverStream::new(rx))
            }
        }
    }

    /// Request cancellation. The first call wins and returns `true`; any
    /// later call (or a cancel of an already-terminal task) is a no-op
    /// returning `false`.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Other`] for unknown task ids.
    pub fn cancel(&self, task_id: Uuid, reason: &str) -> Result<bool, OrchestratorError> {
        let entry = self.entry(task_id)?;
        if entry.status().is_terminal() {
            return Ok(false);
        }
        Ok(entry.request_cancel(reason))
    }

    /// Request migration of a task to another model and/or runtime (`None`
    /// keeps the current model / re-plans the placement). Only allowed
    /// before the task has produced output.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::InvalidTaskState`] once output has started or
    /// the task is terminal; [`OrchestratorError::ModelNotFound`] for
    /// unknown target models; [`OrchestratorError::Other`] for unknown task
    /// ids and unknown target runtimes.
    pub fn migrate(
        &self,
        task_id: Uuid,
        target_model: Option<&str>,
        target_runtime: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        let entry = self.entry(task_id)?;
        if entry.status().is_terminal() {
            return Err(OrchestratorError::InvalidTaskState(format!(
                "task {task_id} is already {}",
                entry.status()
            )));
        }
        if entry.has_output_started() {
            return Err(OrchestratorError::InvalidTaskState(format!(
                "task {task_id} has started streaming output"
            )));
        }
        // Invalid targets are structural errors, surfaced without retry.
        let target_model = match target_model {
            Some(model) => Some(self.registry.get(model)?.id.clone()),
            None => None,
        };
        if let Some(runtime) = target_runtime {
            if self.router.adapter(runtime).is_none() {
                return Err(OrchestratorError::Other(format!(
                    "unknown runtime: {runtime}"
                )));
            }
        }
        entry.request_migrate(target_model, target_runtime.map(|s| s.to_string()));
        Ok(())
    }

    /// Preload a model onto a runtime, evicting an idle instance if needed.
    ///
    /// # Errors
    ///
    /// Everything binding can fail with: unknown model, unknown or down
    /// runtime, exhausted capacity, open breaker, backend load failure.
    pub async fn load_model(
        &self,
        model: &str,
        runtime: &str,
    ) -> Result<(), OrchestratorError> {
        let binding = self.router.bind_to(model, runtime).await?;
        binding.breaker.record_success();
        drop(binding);
        Ok(())
    }

    /// Unload a model instance from a runtime and release its reservation.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Other`] for unknown runtimes or backend unload
    /// failures.
    pub async fn unload_model(
        &self,
        model: &str,
        runtime: &str,
    ) -> Result<(), OrchestratorError> {
        let adapter = self
            .router
            .adapter(runtime)
            .ok_or_else(|| OrchestratorError::Other(format!("unknown runtime: {runtime}")))?;
        let model_id = self.registry.resolve(model);
        adapter.unload(&model_id).await?;
        self.resources.release(runtime, &model_id).await?;
        Ok(())
    }

    /// List models, optionally filtered, sorted by id.
    pub fn list_models(&self, filter: Option<&ModelFilter>) -> Vec<ModelInfo> {
        self.registry.list(filter)
    }

    /// Detail for one model (alias-resolving, includes disabled models).
    pub fn model_info(&self, name: &str) -> Option<ModelInfo> {
        self.registry.info(name)
    }

    /// Probe every runtime and report health plus memory utilization.
    pub async fn health(&self) -> HealthReport {
        let mut utilization: HashMap<String, RuntimeUtilization> = self
            .resources
            .utilization()
            .await
            .into_iter()
            .map(|u| (u.runtime.clone(), u))
            .collect();
        let mut runtimes = Vec::new();
        for id in self.router.runtime_ids() {
            let health = match self.router.adapter(&id) {
                Some(adapter) => adapter.health().await,
                None => RuntimeHealth::Down,
            };
            let util = utilization.remove(&id).unwrap_or(RuntimeUtilization {
                runtime: id.clone(),
                reserved_bytes: 0,
                total_bytes: 0,
                loaded_models: vec![],
            });
            metrics::set_reserved_bytes(&id, util.reserved_bytes);
            runtimes.push(RuntimeReport {
                runtime: id,
                health,
                utilization: util,
            });
        }
        HealthReport {
            uptime_s: self.started_at.elapsed().as_secs(),
            runtimes,
        }
    }

    /// Operational counters: task totals, breaker states, memory picture.
    pub async fn metrics(&self) -> MetricsSnapshot {
        let mut active = 0;
        let mut completed = 0;
        let mut failed = 0;
        let mut cancelled = 0;
        for entry in self.tasks.iter() {
            match entry.value().status() {
                TaskStatus::Completed => completed += 1,
                TaskStatus::Failed => failed += 1,
                TaskStatus::Cancelled => cancelled += 1,
                _ => active += 1,
            }
        }
        let breakers = self.breakers.snapshot_all(Instant::now());
        for (model, runtime, status) in &breakers {
            let state = match status {
                BreakerStatus::Closed => 0,
                BreakerStatus::HalfOpen => 1,
                BreakerStatus::Open => 2,
            };
            metrics::set_breaker_state(model, runtime, state);
        }
        MetricsSnapshot {
            active_tasks: active,
            completed,
            failed,
            cancelled,
            breakers,
            utilization: self.resources.utilization().await,
        }
    }

    /// Replace the model catalog, aliases, and routing policy from a new
    /// configuration. Models removed from the catalog are disabled, not
    /// dropped. The runtime set is fixed at construction; runtime changes
    /// in the new configuration are ignored with a warning.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Config`] when the new configuration is invalid;
    /// the running configuration is left untouched.
    pub fn refresh(&self, config: OrchestratorConfig) -> Result<(), OrchestratorError> {
        if let Err(violations) = loader::validate(&config) {
            return Err(OrchestratorError::Config(violations.join("; ")));
        }
        let current_ids = self.router.runtime_ids();
        let new_ids: Vec<String> = {
            let mut ids: Vec<String> = config.runtimes.iter().map(|r| r.id.clone()).collect();
            ids.sort();
            ids
        };
        if current_ids != new_ids {
            warn!("runtime set changes in refreshed configuration are ignored");
        }
        self.registry.refresh(&config.models, config.aliases);
        *self.policy.write() = Arc::new(config.policy);
        info!("configuration refreshed");
        Ok(())
    }

    /// Stop accepting new tasks and cancel every non-terminal task, then
    /// wait for them to reach a terminal state.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let ids: Vec<Uuid> = self.tasks.iter().map(|e| *e.key()).collect();
        for id in &ids {
            if let Some(entry) = self.tasks.get(id) {
                if !entry.status().is_terminal() {
                    entry.request_cancel("orchestrator shutdown");
                }
            }
        }
        for id in ids {
            let _ = self.wait(id).await;
        }
        info!("orchestrator shut down");
    }
}

enum DispatchOutcome {
    Completed(InferenceResponse),
    Failed(OrchestratorError),
    Cancelled,
    TimedOut,
    Migrate {
        model: Option<String>,
        runtime: Option<String>,
    },
}

/// Resolves once the cancel flag is raised. The watch borrow is dropped
/// before every await so the future stays `Send` inside `tokio::spawn`.
async fn cancel_requested(cancel_rx: &mut watch::Receiver<bool>) {
    loop {
        let cancelled = *cancel_rx.borrow_and_update();
        if cancelled {
            return;
        }
        if cancel_rx.changed().await.is_err() {
            // The sender lives in the task entry, which outlives the driver;
            // a closed channel means no cancel can ever arrive.
            std::future::pending::<()>().await;
        }
    }
}

struct Driver {
    router: Arc<Router>,
    registry: Arc<ModelRegistry>,
    policy: Arc<RoutingPolicy>,
    entry: Arc<TaskEntry>,
    request: InferenceRequest,
    streaming: bool,
    chunk_tx: Option<mpsc::Sender<Result<StreamChunk, OrchestratorError>>>,
}

impl Driver {
    async fn run(self) {
        self.entry.set_status(TaskStatus::Planning);
        let plan = match planner::plan(&self.request, &self.policy, &self.registry) {
            Ok(plan) => plan,
            Err(e) => {
                self.finish_failed(&e);
                return;
            }
        };
        let timeout = self
            .request
            .timeout
            .unwrap_or(Duration::from_millis(self.policy.request_timeout_ms));
        let deadline = tokio::time::Instant::from_std(self.entry.created_at + timeout);

        let mut queue: VecDeque<(String, Option<String>)> = plan
            .candidates
            .iter()
            .map(|c| (c.clone(), self.request.runtime.clone()))
            .collect();
        if queue.is_empty() {
            self.finish_failed(&OrchestratorError::AllCandidatesExhausted { attempts: vec![] });
            return;
        }

        let mut cancel_rx = self.entry.watch_cancel();
        let mut migrate_rx = self.entry.watch_migrate();

        while let Some((model_id, pinned)) = queue.pop_front() {
            if self.entry.cancel_requested() {
                self.finish_cancelled();
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                self.entry.request_cancel("deadline exceeded");
                self.finish_cancelled();
                return;
            }
            if self.entry.attempt_count() >= self.policy.max_attempts as usize {
                break;
            }
            // A migrate raised between dispatches retargets this candidate.
            let (model_id, pinned) = match self.entry.take_migrate_request() {
                Some(req) => (req.target_model.unwrap_or(model_id), req.target_runtime),
                None => (model_id, pinned),
            };
            migrate_rx.borrow_and_update();

            let bound = match &pinned {
                Some(runtime) => self.router.bind_to(&model_id, runtime).await,
                None => self.router.bind(&model_id).await,
            };
            let binding = match bound {
                Ok(binding) => binding,
                Err(e) => {
                    debug!(task = %self.entry.id, model = %model_id, error = %e, "binding failed");
                    self.entry.push_attempt(AttemptRecord {
                        model: model_id.clone(),
                        runtime: pinned.unwrap_or_else(|| "none".to_string()),
                        outcome: AttemptOutcome::Failed(e.to_string()),
                    });
                    metrics::record_dispatch(&model_id, "none", "bind_failed");
                    continue;
                }
            };

            self.entry.set_binding(&binding.model.id, &binding.runtime_id);
            self.entry.set_status(TaskStatus::Dispatched);
            self.entry.set_status(TaskStatus::Running);
            let handle = CallHandle::new();

            let outcome = if self.streaming {
                self.dispatch_streaming(
                    &binding,
                    handle,
                    &plan.params,
                    deadline,
                    &mut cancel_rx,
                    &mut migrate_rx,
                )
                .await
            } else {
                self.dispatch_unary(
                    &binding,
                    handle,
                    &plan.params,
                    deadline,
                    &mut cancel_rx,
                    &mut migrate_rx,
                )
                .await
            };

            match outcome {
                DispatchOutcome::Completed(response) => {
                    binding.breaker.record_success();
                    metrics::record_dispatch(&binding.model.id, &binding.runtime_id, "completed");
                    self.entry.push_attempt(AttemptRecord {
                        model: binding.model.id.clone(),
                        runtime: binding.runtime_id.clone(),
                        outcome: AttemptOutcome::Completed,
                    });
                    self.entry.set_output(response);
                    self.entry.set_status(TaskStatus::Completed);
                    self.record_finished("completed");
                    return;
                }
                DispatchOutcome::Failed(e) => {
                    binding.breaker.record_failure(Instant::now());
                    metrics::record_dispatch(&binding.model.id, &binding.runtime_id, "failed");
                    self.entry.push_attempt(AttemptRecord {
                        model: binding.model.id.clone(),
                        runtime: binding.runtime_id.clone(),
                        outcome: AttemptOutcome::Failed(e.to_string()),
                    });
                    if self.entry.has_output_started() {
                        // Output already reached the caller; substituting a
                        // different model mid-answer is not acceptable.
                        self.finish_failed(&e);
                        return;
                    }
                    if !e.is_transient() {
                        self.finish_failed(&e);
                        return;
                    }
                    self.entry.clear_binding();
                    self.entry.set_status(TaskStatus::Planning);
                    continue;
                }
                DispatchOutcome::Cancelled => {
                    binding.adapter.abort(handle).await;
                    self.release_probe(&binding);
                    self.finish_cancelled();
                    return;
                }
                DispatchOutcome::TimedOut => {
                    binding.adapter.abort(handle).await;
                    self.release_probe(&binding);
                    self.entry.request_cancel("deadline exceeded");
                    self.finish_cancelled();
                    return;
                }
                DispatchOutcome::Migrate { model, runtime } => {
                    binding.adapter.abort(handle).await;
                    self.release_probe(&binding);
                    self.entry.push_attempt(AttemptRecord {
                        model: binding.model.id.clone(),
                        runtime: binding.runtime_id.clone(),
                        outcome: AttemptOutcome::Migrated,
                    });
                    metrics::record_dispatch(&binding.model.id, &binding.runtime_id, "migrated");
                    self.entry.set_status(TaskStatus::Migrating);
                    info!(
                        task = %self.entry.id,
                        model = %binding.model.id,
                        from = %binding.runtime_id,
                        to_model = model.as_deref().unwrap_or("(same)"),
                        to_runtime = runtime.as_deref().unwrap_or("(replan)"),
                        "migrating task"
                    );
                    queue.push_front((model.unwrap_or(model_id), runtime));
                    continue;
                }
            }
        }

        self.finish_failed(&OrchestratorError::AllCandidatesExhausted {
            attempts: self.entry.attempts(),
        });
    }

    async fn dispatch_unary(
        &self,
        binding: &Binding,
        handle: CallHandle,
        params: &crate::GenerationParams,
        deadline: tokio::time::Instant,
        cancel_rx: &mut watch::Receiver<bool>,
        migrate_rx: &mut watch::Receiver<u64>,
    ) -> DispatchOutcome {
        tokio::select! {
            biased;
            _ = cancel_requested(cancel_rx) => DispatchOutcome::Cancelled,
            _ = migrate_rx.changed() => {
                match self.entry.take_migrate_request() {
                    Some(req) => DispatchOutcome::Migrate {
                        model: req.target_model,
                        runtime: req.target_runtime,
                    },
                    None => DispatchOutcome::Migrate { model: None, runtime: None },
                }
            }
            _ = tokio::time::sleep_until(deadline) => DispatchOutcome::TimedOut,
            result = binding.adapter.infer(
                handle,
                &binding.model.id,
                &self.request.prompt,
                params,
            ) => match result {
                Ok(response) => DispatchOutcome::Completed(response),
                Err(e) => DispatchOutcome::Failed(e),
            },
        }
    }

    async fn dispatch_streaming(
        &self,
        binding: &Binding,
        handle: CallHandle,
        params: &crate::GenerationParams,
        deadline: tokio::time::Instant,
        cancel_rx: &mut watch::Receiver<bool>,
        migrate_rx: &mut watch::Receiver<u64>,
    ) -> DispatchOutcome {
        let mut stream = match binding
            .adapter
            .infer_stream(handle, &binding.model.id, &self.request.prompt, params)
            .await
        {
            Ok(stream) => stream,
            Err(e) => return DispatchOutcome::Failed(e),
        };

        let mut collected = String::new();
        loop {
            tokio::select! {
                biased;
                _ = cancel_requested(cancel_rx) => return DispatchOutcome::Cancelled,
                _ = migrate_rx.changed(), if !self.entry.has_output_started() => {
                    return match self.entry.take_migrate_request() {
                        Some(req) => DispatchOutcome::Migrate {
                            model: req.target_model,
                            runtime: req.target_runtime,
                        },
                        None => DispatchOutcome::Migrate { model: None, runtime: None },
                    };
                }
                _ = tokio::time::sleep_until(deadline) => return DispatchOutcome::TimedOut,
                chunk = stream.next() => match chunk {
                    Some(Ok(chunk)) => {
                        if chunk.done {
                            self.forward_chunk(Ok(chunk)).await;
                            let tokens = collected.split_whitespace().count() as u32;
                            return DispatchOutcome::Completed(InferenceResponse {
                                text: collected,
                                tokens,
                            });
                        }
                        if !self.entry.has_output_started() {
                            self.entry.mark_first_output();
                            self.entry.set_status(TaskStatus::Streaming);
                        }
                        collected.push_str(&chunk.text);
                        self.forward_chunk(Ok(chunk)).await;
                    }
                    Some(Err(e)) => return DispatchOutcome::Failed(e),
                    None => {
                        return DispatchOutcome::Failed(OrchestratorError::Inference(
                            "stream ended without terminal chunk".into(),
                        ));
                    }
                },
            }
        }
    }

    fn release_probe(&self, binding: &Binding) {
        if binding.permit == crate::breaker::CallPermit::Probe {
            binding.breaker.release_probe();
        }
    }

    async fn forward_chunk(&self, chunk: Result<StreamChunk, OrchestratorError>) {
        if let Some(tx) = &self.chunk_tx {
            // A dropped subscriber must not stall or fail the task.
            let _ = tx.send(chunk).await;
        }
    }

    fn finish_failed(&self, error: &OrchestratorError) {
        self.entry.clear_binding();
        self.entry.set_error(&error.to_string());
        self.entry.set_status(TaskStatus::Failed);
        self.record_finished("failed");
        debug!(task = %self.entry.id, error = %error, "task failed");
    }

    fn finish_cancelled(&self) {
        self.entry.clear_binding();
        if let Some(reason) = self.entry.cancel_reason() {
            self.entry.set_error(&reason);
        }
        self.entry.set_status(TaskStatus::Cancelled);
        self.record_finished("cancelled");
        debug!(task = %self.entry.id, "task cancelled");
    }

    fn record_finished(&self, status: &str) {
        metrics::record_finished(status, self.entry.created_at.elapsed().as_secs_f64());
    }
}

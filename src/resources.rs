//! Memory accounting and LRU eviction across runtimes.
//!
//! Each runtime gets an account with a fixed byte capacity. Loading a model
//! reserves its declared footprint up front and the reservation is held for
//! the instance's whole lifetime, so the invariant `reserved <= total` can
//! never be violated by concurrent loads. All mutation of one runtime's
//! accounting goes through a single async mutex; cross-runtime operations
//! never hold two accounts at once.

use crate::config::{ModelSpec, RuntimeSpec};
use crate::OrchestratorError;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Lifecycle of one model instance on one runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Reservation held, backend load in progress.
    Loading,
    /// Loaded and serving.
    Ready,
}

#[derive(Debug)]
struct Instance {
    state: InstanceState,
    reserved_bytes: u64,
    last_used: Instant,
    /// In-flight calls pinning this instance against eviction.
    active: Arc<AtomicU32>,
}

#[derive(Debug, Default)]
struct Accounting {
    reserved_bytes: u64,
    instances: HashMap<String, Instance>,
}

#[derive(Debug)]
struct RuntimeAccount {
    total_bytes: u64,
    state: Mutex<Accounting>,
}

/// Outcome of a successful reservation.
#[derive(Debug)]
pub struct Reservation {
    /// Model evicted to make room, if any. The caller must tell the
    /// runtime adapter to unload it.
    pub evicted: Option<String>,
}

/// RAII pin on a loaded instance. While held, the instance cannot be
/// selected as an eviction victim.
#[derive(Debug)]
pub struct ActiveGuard {
    active: Arc<AtomicU32>,
}

impl ActiveGuard {
    fn new(active: Arc<AtomicU32>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self { active }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Per-runtime memory utilization, for health reporting.
#[derive(Debug, Clone)]
pub struct RuntimeUtilization {
    /// Runtime id.
    pub runtime: String,
    /// Bytes currently reserved by instances.
    pub reserved_bytes: u64,
    /// Configured capacity.
    pub total_bytes: u64,
    /// Model ids with a Ready instance.
    pub loaded_models: Vec<String>,
}

/// Tracks reservations and instances for every registered runtime.
#[derive(Debug, Default)]
pub struct ResourceManager {
    runtimes: DashMap<String, Arc<RuntimeAccount>>,
}

impl ResourceManager {
    /// Build accounts for the configured runtimes.
    pub fn new(runtimes: &[RuntimeSpec]) -> Self {
        let manager = Self {
            runtimes: DashMap::new(),
        };
        for spec in runtimes {
            manager.runtimes.insert(
                spec.id.clone(),
                Arc::new(RuntimeAccount {
                    total_bytes: spec.memory_bytes,
                    state: Mutex::new(Accounting::default()),
                }),
            );
        }
        manager
    }

    fn account(&self, runtime: &str) -> Result<Arc<RuntimeAccount>, OrchestratorError> {
        self.runtimes
            .get(runtime)
            .map(|a| a.clone())
            .ok_or_else(|| OrchestratorError::Other(format!("unknown runtime: {runtime}")))
    }

    /// Reserve memory for `model` on `runtime`, evicting at most one idle
    /// Ready instance (least recently used) if the free pool is short. The
    /// instance starts in [`InstanceState::Loading`]; call
    /// [`ResourceManager::mark_ready`] once the backend load succeeds or
    /// [`ResourceManager::release`] if it fails.
    ///
    /// Reserving a model that already has an instance is a no-op with no
    /// eviction.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::ResourceExhausted`] when the footprint does not
    /// fit even after eviction.
    pub async fn reserve(
        &self,
        runtime: &str,
        model: &ModelSpec,
    ) -> Result<Reservation, OrchestratorError> {
        let account = self.account(runtime)?;
        let mut acc = account.state.lock().await;

        if acc.instances.contains_key(&model.id) {
            return Ok(Reservation { evicted: None });
        }

        let needed = model.memory_bytes;
        if needed > account.total_bytes {
            return Err(OrchestratorError::ResourceExhausted {
                runtime: runtime.to_string(),
                needed,
                free: account.total_bytes.saturating_sub(acc.reserved_bytes),
            });
        }

        let mut evicted = None;
        if acc.reserved_bytes + needed > account.total_bytes {
            // LRU victim: oldest last_used among Ready instances with no
            // in-flight calls.
            let victim = acc
                .instances
                .iter()
                .filter(|(_, inst)| {
                    inst.state == InstanceState::Ready && inst.active.load(Ordering::SeqCst) == 0
                })
                .min_by_key(|(_, inst)| inst.last_used)
                .map(|(id, _)| id.clone());

            if let Some(victim_id) = victim {
                if let Some(inst) = acc.instances.remove(&victim_id) {
                    acc.reserved_bytes -= inst.reserved_bytes;
                    info!(runtime, model = %victim_id, "evicted idle model to free memory");
                    evicted = Some(victim_id);
                }
            }

            if acc.reserved_bytes + needed > account.total_bytes {
                // Roll nothing back: the eviction already happened and the
                // freed memory stays freed.
                return Err(OrchestratorError::ResourceExhausted {
                    runtime: runtime.to_string(),
                    needed,
                    free: account.total_bytes - acc.reserved_bytes,
                });
            }
        }

        acc.reserved_bytes += needed;
        acc.instances.insert(
            model.id.clone(),
            Instance {
                state: InstanceState::Loading,
                reserved_bytes: needed,
                last_used: Instant::now(),
                active: Arc::new(AtomicU32::new(0)),
            },
        );
        debug!(
            runtime,
            model = %model.id,
            reserved = acc.reserved_bytes,
            total = account.total_bytes,
            "reserved model footprint"
        );
        Ok(Reservation { evicted })
    }

    /// Transition an instance from Loading to Ready.
    pub async fn mark_ready(&self, runtime: &str, model: &str) -> Result<(), OrchestratorError> {
        let account = self.account(runtime)?;
        let mut acc = account.state.lock().await;
        if let Some(inst) = acc.instances.get_mut(model) {
            inst.state = InstanceState::Ready;
            inst.last_used = Instant::now();
        }
        Ok(())
    }

    /// Release an instance and its reservation. Used on load failure and
    /// for explicit unloads.
    pub async fn release(&self, runtime: &str, model: &str) -> Result<(), OrchestratorError> {
        let account = self.account(runtime)?;
        let mut acc = account.state.lock().await;
        if let Some(inst) = acc.instances.remove(model) {
            acc.reserved_bytes -= inst.reserved_bytes;
            debug!(runtime, model, "released model reservation");
        }
        Ok(())
    }

    /// Pin a Ready instance for the duration of a call and refresh its LRU
    /// timestamp. Returns `None` when the model has no Ready instance here.
    pub async fn acquire_active(&self, runtime: &str, model: &str) -> Option<ActiveGuard> {
        let account = self.runtimes.get(runtime)?.clone();
        let mut acc = account.state.lock().await;
        let inst = acc.instances.get_mut(model)?;
        if inst.state != InstanceState::Ready {
            return None;
        }
        inst.last_used = Instant::now();
        Some(ActiveGuard::new(inst.active.clone()))
    }

    /// Whether `model` has a Ready instance on `runtime`.
    pub async fn is_ready(&self, runtime: &str, model: &str) -> bool {
        let Some(account) = self.runtimes.get(runtime).map(|a| a.clone()) else {
            return false;
        };
        let acc = account.state.lock().await;
        acc.instances
            .get(model)
            .map(|i| i.state == InstanceState::Ready)
            .unwrap_or(false)
    }

    /// In-flight call count for a Ready instance, used to rank runtimes.
    pub async fn active_calls(&self, runtime: &str, model: &str) -> Option<u32> {
        let account = self.runtimes.get(runtime)?.clone();
        let acc = account.state.lock().await;
        let inst = acc.instances.get(model)?;
        if inst.state != InstanceState::Ready {
            return None;
        }
        Some(inst.active.load(Ordering::SeqCst))
    }

    /// Unreserved bytes on a runtime.
    pub async fn free_bytes(&self, runtime: &str) -> u64 {
        let Some(account) = self.runtimes.get(runtime).map(|a| a.clone()) else {
            return 0;
        };
        let acc = account.state.lock().await;
        account.total_bytes.saturating_sub(acc.reserved_bytes)
    }

    /// Utilization for every runtime, sorted by runtime id.
    pub async fn utilization(&self) -> Vec<RuntimeUtilization> {
        let mut out = Vec::new();
        let accounts: Vec<(String, Arc<RuntimeAccount>)> = self
            .runtimes
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (runtime, account) in accounts {
            let acc = account.state.lock().await;
            let mut loaded: Vec<String> = acc
                .instances
                .iter()
                .filter(|(_, i)| i.state == InstanceState::Ready)
                .map(|(id, _)| id.clone())
                .collect();
            loaded.sort();
            out.push(RuntimeUtilization {
                runtime,
                reserved_bytes: acc.reserved_bytes,
                total_bytes: account.total_bytes,
                loaded_models: loaded,
            });
        }
        out.sort_by(|a, b| a.runtime.cmp(&b.runtime));
        out
    }
}

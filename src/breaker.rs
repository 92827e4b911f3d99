//! Per (model, runtime) circuit breakers.
//!
//! A breaker tracks recent failures for one model on one runtime. After
//! `failure_threshold` failures inside the rolling window it opens and the
//! pair is skipped during routing. When the cooldown elapses a single probe
//! call is admitted; success closes the breaker and resets the cooldown to
//! its base value, failure re-opens it with the cooldown doubled, capped at
//! the configured ceiling.

use crate::config::BreakerPolicy;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerStatus {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected until the cooldown elapses.
    Open,
    /// Cooldown elapsed; one probe call may test the pair.
    HalfOpen,
}

impl std::fmt::Display for BreakerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerStatus::Closed => write!(f, "closed"),
            BreakerStatus::Open => write!(f, "open"),
            BreakerStatus::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Permit returned by [`Breaker::try_acquire`]. The holder must report the
/// call result via `record_success` or `record_failure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPermit {
    /// Ordinary call through a closed breaker.
    Normal,
    /// The single probe admitted out of the half-open state.
    Probe,
}

#[derive(Debug)]
struct BreakerInner {
    status: BreakerStatus,
    /// Failure timestamps inside the rolling window (closed state only).
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    cooldown: Duration,
    /// True while the half-open probe is outstanding; further callers are
    /// rejected until it resolves.
    probe_in_flight: bool,
}

/// Circuit breaker for a single (model, runtime) pair.
#[derive(Debug)]
pub struct Breaker {
    model: String,
    runtime: String,
    policy: BreakerPolicy,
    inner: Mutex<BreakerInner>,
}

impl Breaker {
    fn new(model: &str, runtime: &str, policy: BreakerPolicy) -> Self {
        let cooldown = Duration::from_secs(policy.cooldown_s);
        Self {
            model: model.to_string(),
            runtime: runtime.to_string(),
            policy,
            inner: Mutex::new(BreakerInner {
                status: BreakerStatus::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                cooldown,
                probe_in_flight: false,
            }),
        }
    }

    fn base_cooldown(&self) -> Duration {
        Duration::from_secs(self.policy.cooldown_s)
    }

    fn cooldown_cap(&self) -> Duration {
        Duration::from_secs(self.policy.cooldown_cap_s)
    }

    /// Non-mutating eligibility peek used while ranking candidates. An open
    /// breaker whose cooldown has elapsed reports [`BreakerStatus::HalfOpen`]
    /// but the transition itself happens in [`Breaker::try_acquire`].
    pub fn status_allows(&self, now: Instant) -> bool {
        let inner = self.inner.lock();
        match inner.status {
            BreakerStatus::Closed => true,
            BreakerStatus::HalfOpen => !inner.probe_in_flight,
            BreakerStatus::Open => match inner.opened_at {
                Some(at) => now.duration_since(at) >= inner.cooldown,
                None => true,
            },
        }
    }

    /// Current status, advancing Open to HalfOpen for display when the
    /// cooldown has elapsed.
    pub fn status(&self, now: Instant) -> BreakerStatus {
        let inner = self.inner.lock();
        match inner.status {
            BreakerStatus::Open => match inner.opened_at {
                Some(at) if now.duration_since(at) >= inner.cooldown => BreakerStatus::HalfOpen,
                _ => BreakerStatus::Open,
            },
            other => other,
        }
    }

    /// Acquire permission to call through this breaker, performing the
    /// Open -> HalfOpen transition when the cooldown has elapsed. At most
    /// one probe is outstanding at a time.
    ///
    /// # Errors
    ///
    /// [`crate::OrchestratorError::CircuitOpen`] when the breaker rejects
    /// the call.
    pub fn try_acquire(&self, now: Instant) -> Result<CallPermit, crate::OrchestratorError> {
        let mut inner = self.inner.lock();
        match inner.status {
            BreakerStatus::Closed => Ok(CallPermit::Normal),
            BreakerStatus::HalfOpen => {
                if inner.probe_in_flight {
                    Err(self.open_error())
                } else {
                    inner.probe_in_flight = true;
                    Ok(CallPermit::Probe)
                }
            }
            BreakerStatus::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| now.duration_since(at) >= inner.cooldown)
                    .unwrap_or(true);
                if elapsed {
                    inner.status = BreakerStatus::HalfOpen;
                    inner.probe_in_flight = true;
                    debug!(
                        model = %self.model,
                        runtime = %self.runtime,
                        "breaker half-open, admitting probe"
                    );
                    Ok(CallPermit::Probe)
                } else {
                    Err(self.open_error())
                }
            }
        }
    }

    fn open_error(&self) -> crate::OrchestratorError {
        crate::OrchestratorError::CircuitOpen {
            model: self.model.clone(),
            runtime: self.runtime.clone(),
        }
    }

    /// Report a successful call. A probe success closes the breaker and
    /// resets the cooldown to its base value; a closed-state success clears
    /// the failure window.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.status {
            BreakerStatus::HalfOpen => {
                inner.status = BreakerStatus::Closed;
                inner.failures.clear();
                inner.opened_at = None;
                inner.probe_in_flight = false;
                inner.cooldown = self.base_cooldown();
                info!(
                    model = %self.model,
                    runtime = %self.runtime,
                    "breaker closed after successful probe"
                );
            }
            BreakerStatus::Closed => {
                inner.failures.clear();
            }
            BreakerStatus::Open => {}
        }
    }

    /// Give back an unresolved probe permit (the call was cancelled or
    /// migrated away rather than finishing). The breaker stays half-open
    /// and the next caller may probe.
    pub fn release_probe(&self) {
        let mut inner = self.inner.lock();
        if inner.status == BreakerStatus::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    /// Report a failed call at `now`. A probe failure re-opens with the
    /// cooldown doubled (capped); a closed-state failure counts toward the
    /// rolling window and may trip the breaker.
    pub fn record_failure(&self, now: Instant) {
        let mut inner = self.inner.lock();
        match inner.status {
            BreakerStatus::HalfOpen => {
                let doubled = (inner.cooldown * 2).min(self.cooldown_cap());
                inner.status = BreakerStatus::Open;
                inner.opened_at = Some(now);
                inner.cooldown = doubled;
                inner.probe_in_flight = false;
                warn!(
                    model = %self.model,
                    runtime = %self.runtime,
                    cooldown_s = doubled.as_secs(),
                    "probe failed, breaker re-opened with doubled cooldown"
                );
            }
            BreakerStatus::Closed => {
                let window = Duration::from_secs(self.policy.window_s);
                inner.failures.push_back(now);
                while let Some(&front) = inner.failures.front() {
                    if now.duration_since(front) > window {
                        inner.failures.pop_front();
                    } else {
                        break;
                    }
                }
                if inner.failures.len() as u32 >= self.policy.failure_threshold {
                    inner.status = BreakerStatus::Open;
                    inner.opened_at = Some(now);
                    inner.cooldown = self.base_cooldown();
                    inner.failures.clear();
                    warn!(
                        model = %self.model,
                        runtime = %self.runtime,
                        threshold = self.policy.failure_threshold,
                        "failure threshold reached, breaker opened"
                    );
                }
            }
            BreakerStatus::Open => {}
        }
    }
}

/// Lazily-created breakers keyed by (model, runtime).
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    policy: BreakerPolicy,
    breakers: DashMap<(String, String), Arc<Breaker>>,
}

impl BreakerRegistry {
    /// Create a registry that stamps out breakers with `policy`.
    pub fn new(policy: BreakerPolicy) -> Self {
        Self {
            policy,
            breakers: DashMap::new(),
        }
    }

    /// Fetch or create the breaker for a (model, runtime) pair.
    pub fn get(&self, model: &str, runtime: &str) -> Arc<Breaker> {
        self.breakers
            .entry((model.to_string(), runtime.to_string()))
            .or_insert_with(|| Arc::new(Breaker::new(model, runtime, self.policy.clone())))
            .clone()
    }

    /// Snapshot every breaker's status, for health and metrics reporting.
    pub fn snapshot_all(&self, now: Instant) -> Vec<(String, String, BreakerStatus)> {
        let mut out: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| {
                let (model, runtime) = entry.key().clone();
                (model, runtime, entry.value().status(now))
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BreakerPolicy {
        BreakerPolicy {
            failure_threshold: 3,
            window_s: 60,
            cooldown_s: 30,
            cooldown_cap_s: 240,
        }
    }

    fn breaker() -> Breaker {
        Breaker::new("mistral", "ollama-0", policy())
    }

    #[test]
    fn test_closed_allows_calls() {
        let b = breaker();
        let now = Instant::now();
        assert!(b.status_allows(now));
        assert_eq!(b.try_acquire(now).expect("test: acquire"), CallPermit::Normal);
    }

    #[test]
    fn test_opens_at_threshold() {
        let b = breaker();
        let now = Instant::now();
        b.record_failure(now);
        b.record_failure(now);
        assert_eq!(b.status(now), BreakerStatus::Closed);
        b.record_failure(now);
        assert_eq!(b.status(now), BreakerStatus::Open);
        assert!(!b.status_allows(now));
        assert!(b.try_acquire(now).is_err());
    }

    #[test]
    fn test_failures_outside_window_do_not_count() {
        let b = breaker();
        let start = Instant::now();
        b.record_failure(start);
        b.record_failure(start);
        // Third failure lands after the first two have aged out.
        let later = start + Duration::from_secs(120);
        b.record_failure(later);
        assert_eq!(b.status(later), BreakerStatus::Closed);
    }

    #[test]
    fn test_success_clears_failure_window() {
        let b = breaker();
        let now = Instant::now();
        b.record_failure(now);
        b.record_failure(now);
        b.record_success();
        b.record_failure(now);
        b.record_failure(now);
        assert_eq!(b.status(now), BreakerStatus::Closed);
    }

    #[test]
    fn test_single_probe_after_cooldown() {
        let b = breaker();
        let now = Instant::now();
        for _ in 0..3 {
            b.record_failure(now);
        }
        let after = now + Duration::from_secs(31);
        assert!(b.status_allows(after));
        assert_eq!(
            b.try_acquire(after).expect("test: probe"),
            CallPermit::Probe
        );
        // Second caller is rejected while the probe is outstanding.
        assert!(b.try_acquire(after).is_err());
        assert!(!b.status_allows(after));
    }

    #[test]
    fn test_probe_success_closes_and_resets_cooldown() {
        let b = breaker();
        let now = Instant::now();
        for _ in 0..3 {
            b.record_failure(now);
        }
        let after = now + Duration::from_secs(31);
        b.try_acquire(after).expect("test: probe");
        b.record_success();
        assert_eq!(b.status(after), BreakerStatus::Closed);
        // Trip again: cooldown is back to the base 30s, not doubled.
        for _ in 0..3 {
            b.record_failure(after);
        }
        assert!(!b.status_allows(after + Duration::from_secs(29)));
        assert!(b.status_allows(after + Duration::from_secs(31)));
    }

    #[test]
    fn test_probe_failure_doubles_cooldown_capped() {
        let b = breaker();
        let mut now = Instant::now();
        for _ in 0..3 {
            b.record_failure(now);
        }
        // Cooldown progression: base 30s, then 60, 120, 240, capped at 240.
        for (current, next) in [(30u64, 60u64), (60, 120), (120, 240), (240, 240)] {
            now += Duration::from_secs(current + 1);
            b.try_acquire(now).expect("test: probe admitted");
            b.record_failure(now);
            assert!(!b.status_allows(now + Duration::from_secs(next - 1)));
            assert!(b.status_allows(now + Duration::from_secs(next + 1)));
        }
    }

    #[test]
    fn test_released_probe_can_be_reacquired() {
        let b = breaker();
        let now = Instant::now();
        for _ in 0..3 {
            b.record_failure(now);
        }
        let after = now + Duration::from_secs(31);
        b.try_acquire(after).expect("test: first probe");
        assert!(b.try_acquire(after).is_err());
        b.release_probe();
        assert_eq!(
            b.try_acquire(after).expect("test: second probe"),
            CallPermit::Probe
        );
    }

    #[test]
    fn test_registry_returns_same_breaker_per_pair() {
        let reg = BreakerRegistry::new(policy());
        let a = reg.get("mistral", "ollama-0");
        let b = reg.get("mistral", "ollama-0");
        assert!(Arc::ptr_eq(&a, &b));
        let c = reg.get("mistral", "vllm-0");
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_snapshot_all_sorted_by_model_then_runtime() {
        let reg = BreakerRegistry::new(policy());
        reg.get("zeta", "r1");
        reg.get("alpha", "r2");
        reg.get("alpha", "r1");
        let snap = reg.snapshot_all(Instant::now());
        let keys: Vec<(&str, &str)> = snap
            .iter()
            .map(|(m, r, _)| (m.as_str(), r.as_str()))
            .collect();
        assert_eq!(keys, vec![("alpha", "r1"), ("alpha", "r2"), ("zeta", "r1")]);
    }
}

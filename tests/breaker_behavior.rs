//! Circuit breaker behavior observed through the orchestrator API.

use inference_orchestrator::breaker::BreakerStatus;
use inference_orchestrator::config::{
    BreakerPolicy, ModelSpec, OrchestratorConfig, RoutingPolicy, RuntimeKind, RuntimeSpec,
    TaskPolicy,
};
use inference_orchestrator::runtime::RuntimeAdapter;
use inference_orchestrator::{
    InferenceRequest, MockRuntime, Orchestrator, OrchestratorError, TaskStatus,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn config(threshold: u32) -> OrchestratorConfig {
    OrchestratorConfig {
        models: vec![ModelSpec {
            id: "m1".into(),
            family: "m1".into(),
            size: String::new(),
            context_length: 8192,
            capabilities: vec![],
            memory_bytes: 50,
            recommended_runtimes: vec![RuntimeKind::Mock],
        }],
        aliases: HashMap::new(),
        runtimes: vec![RuntimeSpec {
            id: "r0".into(),
            kind: RuntimeKind::Mock,
            endpoint: String::new(),
            memory_bytes: 1_000,
            concurrency_slots: 4,
            timeout_ms: 60_000,
        }],
        policy: RoutingPolicy {
            by_task_type: HashMap::from([(
                "chat".to_string(),
                TaskPolicy {
                    models: vec!["m1".into()],
                    params: Default::default(),
                },
            )]),
            default_models: vec!["m1".into()],
            max_attempts: 1,
            request_timeout_ms: 10_000,
            breaker: BreakerPolicy {
                failure_threshold: threshold,
                window_s: 60,
                cooldown_s: 30,
                cooldown_cap_s: 240,
            },
        },
    }
}

async fn fail_once(orch: &Orchestrator) {
    let id = orch
        .submit(InferenceRequest::new("p", "chat"))
        .expect("submit");
    let snapshot = orch.wait(id).await.expect("wait");
    assert_eq!(snapshot.status, TaskStatus::Failed);
}

#[tokio::test]
async fn test_breaker_opens_after_threshold_and_stops_backend_calls() {
    let mock = Arc::new(MockRuntime::new().fail_next_infers(100));
    let orch = Orchestrator::builder(config(2))
        .adapter("r0", mock.clone() as Arc<dyn RuntimeAdapter>)
        .build()
        .expect("build");

    // Two failing tasks trip the breaker for (m1, r0).
    fail_once(&orch).await;
    fail_once(&orch).await;
    assert_eq!(mock.infer_calls(), 2);

    let metrics = orch.metrics().await;
    assert_eq!(
        metrics.breakers,
        vec![("m1".to_string(), "r0".to_string(), BreakerStatus::Open)]
    );

    // Further tasks fail without ever contacting the backend.
    fail_once(&orch).await;
    assert_eq!(mock.infer_calls(), 2);
}

#[tokio::test]
async fn test_open_breaker_failure_mentions_no_healthy_runtime() {
    let mock = Arc::new(MockRuntime::new().fail_next_infers(100));
    let orch = Orchestrator::builder(config(1))
        .adapter("r0", mock as Arc<dyn RuntimeAdapter>)
        .build()
        .expect("build");

    fail_once(&orch).await;

    let id = orch
        .submit(InferenceRequest::new("p", "chat"))
        .expect("submit");
    let snapshot = orch.wait(id).await.expect("wait");
    assert_eq!(snapshot.status, TaskStatus::Failed);
    // The bind failure is recorded against the attempt history.
    assert!(snapshot.attempts.iter().any(|a| {
        matches!(&a.outcome, inference_orchestrator::AttemptOutcome::Failed(reason)
            if reason.contains("no healthy runtime"))
    }));
}

#[tokio::test]
async fn test_breaker_isolated_per_model() {
    let mock = Arc::new(MockRuntime::new().fail_next_infers(1));
    let mut cfg = config(1);
    cfg.models.push(ModelSpec {
        id: "m2".into(),
        family: "m2".into(),
        size: String::new(),
        context_length: 8192,
        capabilities: vec![],
        memory_bytes: 50,
        recommended_runtimes: vec![RuntimeKind::Mock],
    });
    let orch = Orchestrator::builder(cfg)
        .adapter("r0", mock as Arc<dyn RuntimeAdapter>)
        .build()
        .expect("build");

    // Trip (m1, r0).
    fail_once(&orch).await;

    // m2 on the same runtime is unaffected.
    let id = orch
        .submit(InferenceRequest::new("p", "chat").with_model("m2"))
        .expect("submit");
    let snapshot = orch.wait(id).await.expect("wait");
    assert_eq!(snapshot.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_preload_through_open_breaker_is_rejected() {
    let mock = Arc::new(MockRuntime::new().fail_next_infers(1));
    let orch = Orchestrator::builder(config(1))
        .adapter("r0", mock as Arc<dyn RuntimeAdapter>)
        .build()
        .expect("build");

    fail_once(&orch).await;

    let err = orch
        .load_model("m1", "r0")
        .await
        .expect_err("load through open breaker");
    assert!(matches!(err, OrchestratorError::CircuitOpen { .. }));
}

async fn wait_for_status(orch: &Orchestrator, id: uuid::Uuid, status: TaskStatus) {
    for _ in 0..200 {
        if orch.status(id).expect("status").status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task never reached {status}");
}

#[tokio::test]
async fn test_half_open_admits_exactly_one_probe() {
    let mock = Arc::new(
        MockRuntime::new()
            .fail_next_infers(1)
            .with_delay(Duration::from_millis(150)),
    );
    let mut cfg = config(1);
    cfg.policy.breaker.cooldown_s = 0;
    let orch = Orchestrator::builder(cfg)
        .adapter("r0", mock.clone() as Arc<dyn RuntimeAdapter>)
        .build()
        .expect("build");

    fail_once(&orch).await;
    assert_eq!(mock.infer_calls(), 1);

    // Zero cooldown: the next task goes through as the lone probe.
    let probe = orch
        .submit(InferenceRequest::new("p", "chat"))
        .expect("submit probe");
    wait_for_status(&orch, probe, TaskStatus::Running).await;

    // A second task arriving while the probe is in flight never reaches
    // the backend.
    let blocked = orch
        .submit(InferenceRequest::new("p", "chat"))
        .expect("submit blocked");
    let snapshot = orch.wait(blocked).await.expect("wait blocked");
    assert_eq!(snapshot.status, TaskStatus::Failed);
    assert_eq!(mock.infer_calls(), 2);

    let snapshot = orch.wait(probe).await.expect("wait probe");
    assert_eq!(snapshot.status, TaskStatus::Completed);
    let metrics = orch.metrics().await;
    assert_eq!(
        metrics.breakers,
        vec![("m1".to_string(), "r0".to_string(), BreakerStatus::Closed)]
    );
}

#[tokio::test]
async fn test_probe_blocked_by_capacity_does_not_wedge_pair() {
    let mock = Arc::new(
        MockRuntime::new()
            .fail_next_infers(1)
            .with_delay(Duration::from_millis(300)),
    );
    let mut cfg = config(1);
    cfg.policy.breaker.cooldown_s = 0;
    // Room for one loaded model at a time.
    cfg.runtimes[0].memory_bytes = 80;
    cfg.models.push(ModelSpec {
        id: "hog".into(),
        family: "hog".into(),
        size: String::new(),
        context_length: 8192,
        capabilities: vec![],
        memory_bytes: 50,
        recommended_runtimes: vec![RuntimeKind::Mock],
    });
    let orch = Orchestrator::builder(cfg)
        .adapter("r0", mock.clone() as Arc<dyn RuntimeAdapter>)
        .build()
        .expect("build");

    fail_once(&orch).await;

    // An in-flight call on the other model pins all memory.
    let hog = orch
        .submit(InferenceRequest::new("p", "chat").with_model("hog"))
        .expect("submit hog");
    wait_for_status(&orch, hog, TaskStatus::Running).await;

    // The probe gets its permit but cannot reserve memory; it must hand
    // the permit back instead of leaving the pair stuck half-open.
    let starved = orch
        .submit(InferenceRequest::new("p", "chat"))
        .expect("submit starved");
    let snapshot = orch.wait(starved).await.expect("wait starved");
    assert_eq!(snapshot.status, TaskStatus::Failed);
    assert_eq!(mock.infer_calls(), 2);

    let snapshot = orch.wait(hog).await.expect("wait hog");
    assert_eq!(snapshot.status, TaskStatus::Completed);

    // With capacity free again the next probe is admitted and closes the
    // breaker.
    let retry = orch
        .submit(InferenceRequest::new("p", "chat"))
        .expect("submit retry");
    let snapshot = orch.wait(retry).await.expect("wait retry");
    assert_eq!(snapshot.status, TaskStatus::Completed);
    assert_eq!(mock.infer_calls(), 3);
    let metrics = orch.metrics().await;
    assert!(metrics
        .breakers
        .contains(&("m1".to_string(), "r0".to_string(), BreakerStatus::Closed)));
}

//! Job lifecycle driven through the client protocol.

use biomapper::prelude::*;
use biomapper::testing::{fast_config, CountingProbe, FailingAction, HangingAction, ScriptedAction};
use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn params(value: serde_json::Value) -> JsonMap {
    match value {
        serde_json::Value::Object(map) => map,
        _ => JsonMap::new(),
    }
}

fn manager(actions: ActionRegistry) -> JobManager {
    let resources = Arc::new(ResourceManager::new(Arc::new(ProbeRegistry::new())));
    JobManager::new(Arc::new(actions), resources).with_config(fast_config())
}

fn fast_wait() -> WaitOptions {
    WaitOptions::new(Duration::from_millis(5), Duration::from_secs(10))
}

#[tokio::test]
async fn zero_step_job_completes_with_empty_result() {
    let manager = manager(ActionRegistry::new());
    let handle = manager
        .submit(StrategyDefinition::new("empty").into(), JsonMap::new())
        .unwrap();
    let mut events = manager.subscribe(&handle.job_id).unwrap();

    let payload = wait_for_job(&manager, &handle.job_id, &fast_wait()).await.unwrap();

    assert!(payload["outcome"]["matched"].as_array().unwrap().is_empty());
    assert!(payload["outcome"]["unmapped"].as_array().unwrap().is_empty());

    let mut statuses = Vec::new();
    while let Some(event) = events.recv().await {
        statuses.push(event.status);
    }
    assert_eq!(statuses, vec![JobStatus::Pending, JobStatus::Running, JobStatus::Completed]);

    let report = manager.status(&handle.job_id).unwrap();
    assert!((report.progress - 100.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn strategy_with_two_stages_resolves_through_the_waterfall() {
    let actions = ActionRegistry::new()
        .with_action(Arc::new(ScriptedAction::new("exact_match").with_match("A", "P1", 0.99)))
        .with_action(Arc::new(
            ScriptedAction::new("fuzzy_match")
                .with_match("B", "P2", 0.4)
                .with_match("C", "P3", 0.85),
        ));
    let manager = manager(actions);
    let strategy = StrategyDefinition::new("proteins")
        .with_parameter("fuzzy_threshold", json!(0.8))
        .with_step(StepDescriptor::new("exact", "exact_match").with_param("confidence_threshold", json!(0.9)))
        .with_step(
            StepDescriptor::new("fuzzy", "fuzzy_match")
                .with_param("confidence_threshold", json!("${parameters.fuzzy_threshold}")),
        );

    let payload = submit_and_wait(
        &manager,
        strategy.into(),
        params(json!({"entities": ["A", "B", "C"]})),
        &fast_wait(),
    )
    .await
    .unwrap();

    let matched: Vec<(&str, &str)> = payload["outcome"]["matched"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| (m["entity"]["id"].as_str().unwrap(), m["stage_id"].as_str().unwrap()))
        .collect();
    assert_eq!(matched, vec![("A", "exact"), ("C", "fuzzy")]);
    assert_eq!(payload["outcome"]["unmapped"][0]["id"], "B");
    assert_eq!(payload["context"]["datasets"]["matched"].as_array().map(Vec::len), Some(2));
}

#[tokio::test(start_paused = true)]
async fn hanging_stage_fails_with_timeout_kind() {
    let hanging = Arc::new(HangingAction::new("llm_validate"));
    let manager = manager(ActionRegistry::new().with_action(Arc::clone(&hanging) as Arc<dyn Action>));
    let strategy = StrategyDefinition::new("slow").with_step(StepDescriptor::new("llm", "llm_validate"));

    let err = submit_and_wait(
        &manager,
        strategy.into(),
        params(json!({"entities": ["A"], "timeout_seconds": 1.0})),
        &WaitOptions::new(Duration::from_millis(100), Duration::from_secs(30)),
    )
    .await
    .unwrap_err();

    assert!(hanging.was_started());
    match err {
        ClientError::JobFailed { kind, .. } => assert_eq!(kind, ErrorKind::Timeout),
        other => panic!("expected a failed job, got {other}"),
    }
}

#[tokio::test]
async fn client_tells_failed_jobs_from_its_own_timeout() {
    let manager = manager(
        ActionRegistry::new()
            .with_action(Arc::new(FailingAction::new("api_resolve")))
            .with_action(Arc::new(HangingAction::new("llm_validate"))),
    );

    let failed = submit_and_wait(
        &manager,
        StrategyDefinition::new("broken")
            .with_step(StepDescriptor::new("api", "api_resolve"))
            .into(),
        params(json!({"entities": ["A"]})),
        &fast_wait(),
    )
    .await
    .unwrap_err();
    assert!(failed.is_job_failure());
    assert!(!failed.is_timeout());

    let slow = submit_and_wait(
        &manager,
        StrategyDefinition::new("slow")
            .with_step(StepDescriptor::new("llm", "llm_validate"))
            .into(),
        params(json!({"entities": ["A"]})),
        &WaitOptions::new(Duration::from_millis(5), Duration::from_millis(50)),
    )
    .await
    .unwrap_err();
    assert!(slow.is_timeout());
    assert!(!slow.is_job_failure());
}

#[tokio::test]
async fn progress_stream_ends_with_terminal_event() {
    let actions = ActionRegistry::new()
        .with_action(Arc::new(ScriptedAction::new("exact_match").matching_all(1.0)));
    let manager = manager(actions);
    let strategy = StrategyDefinition::new("s").with_step(StepDescriptor::new("exact", "exact_match"));
    let handle = manager
        .submit(strategy.into(), params(json!({"entities": ["A", "B"]})))
        .unwrap();

    let events: Vec<_> = stream_progress(&manager, &handle.job_id, Duration::from_millis(2))
        .collect()
        .await;

    let last = events.last().unwrap().as_ref().unwrap();
    assert_eq!(last.status, JobStatus::Completed);
    assert!(last.is_final());
    assert!(events.iter().all(Result::is_ok));
    let progress: Vec<f64> = events.iter().map(|e| e.as_ref().unwrap().progress).collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn unavailable_required_resource_fails_the_job_before_any_stage() {
    let probes = ProbeRegistry::new();
    probes.register("metadata_store", Arc::new(CountingProbe::always_unavailable()));
    let resources = Arc::new(ResourceManager::new(Arc::new(probes)));
    resources
        .register_resource(ResourceConfig::new("metadata_store", ResourceType::Database).required())
        .unwrap();
    let exact = Arc::new(ScriptedAction::new("exact_match").matching_all(1.0));
    let actions = ActionRegistry::new().with_action(Arc::clone(&exact) as Arc<dyn Action>);
    let manager = JobManager::new(Arc::new(actions), resources).with_config(fast_config());

    let err = submit_and_wait(
        &manager,
        StrategyDefinition::new("s")
            .with_step(StepDescriptor::new("exact", "exact_match"))
            .into(),
        params(json!({"entities": ["A"]})),
        &fast_wait(),
    )
    .await
    .unwrap_err();

    match err {
        ClientError::JobFailed { kind, message, .. } => {
            assert_eq!(kind, ErrorKind::ResourcePrerequisite);
            assert!(message.contains("metadata_store"));
        }
        other => panic!("expected a failed job, got {other}"),
    }
    assert_eq!(exact.call_count(), 0);
}

#[tokio::test]
async fn cancelled_job_reports_cancellation() {
    let hanging = Arc::new(HangingAction::new("llm_validate"));
    let manager = manager(ActionRegistry::new().with_action(Arc::clone(&hanging) as Arc<dyn Action>));
    let handle = manager
        .submit(
            StrategyDefinition::new("slow")
                .with_step(StepDescriptor::new("llm", "llm_validate"))
                .into(),
            params(json!({"entities": ["A"]})),
        )
        .unwrap();

    assert!(JobApi::cancel(&manager, &handle.job_id).await.unwrap());
    manager.shutdown().await;

    let err = wait_for_job(&manager, &handle.job_id, &fast_wait()).await.unwrap_err();
    assert!(matches!(err, ClientError::JobCancelled { .. }));
    assert!(!JobApi::cancel(&manager, &handle.job_id).await.unwrap());
}

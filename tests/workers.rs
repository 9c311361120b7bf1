//! Worker marketplace: definition loading, witness enforcement, journey
//! isolation, and the void/execute gating tool interface.

use std::sync::Arc;

use stepgraph::workers::{
    builtin_witness_registry, execute_in_worker, get_worker_state, kill_worker, spawn_worker,
    Audit, ConstraintSpec, FeedbackChannel, Identity, IsolationBackend, ProcessBackend,
    RuntimeSpec, ToolExecuteOutcome, TrustLevel, WorkerDefinition, WorkerFactory,
    WorkerFactoryError,
};

fn file_size_worker(workspace_template: &str) -> WorkerDefinition {
    WorkerDefinition {
        worker_id: "writer".to_string(),
        identity: Identity {
            name: "Writer".to_string(),
            system_prompt: "write files under the workspace".to_string(),
            onboarding_steps: Vec::new(),
        },
        constraints: vec![ConstraintSpec {
            constraint_id: "max_file_size".to_string(),
            witness: "file_size".to_string(),
            value: "1000000".to_string(),
            feedback: FeedbackChannel::Log,
        }],
        runtime: RuntimeSpec {
            container: None,
            workspace_template: workspace_template.to_string(),
            tools: vec![],
            session_persistence: false,
        },
        trust_level: TrustLevel::Sandboxed,
        audit: Audit::default(),
    }
}

#[tokio::test]
async fn void_then_execute_gating_refuses_oversized_write() {
    let dir = tempfile::tempdir().unwrap();
    let template = dir.path().join("{journey_id}").display().to_string();
    let factory = WorkerFactory::new(builtin_witness_registry());
    let isolation: Arc<dyn IsolationBackend> = Arc::new(ProcessBackend::new());

    spawn_worker(&factory, file_size_worker(&template).into(), "journey-gate", isolation)
        .await
        .unwrap();

    let oversized = serde_json::json!({ "type": "write", "path": "out.txt", "content": "x".repeat(2_000_000) });
    let outcome = execute_in_worker(&factory, "journey-gate", &oversized).await.unwrap();
    match outcome {
        ToolExecuteOutcome::ConstraintViolation { warnings } => {
            assert_eq!(warnings.len(), 1);
            assert!(warnings[0].contains("2000000"));
            assert!(warnings[0].contains("1000000"));
        }
        ToolExecuteOutcome::Executed(_) => panic!("expected a constraint violation, not execution"),
    }

    assert!(
        !dir.path().join("journey-gate").join("out.txt").exists(),
        "refused execute must not touch the workspace"
    );

    let clean = serde_json::json!({ "type": "write", "path": "ok.txt", "content": "fits" });
    let outcome = execute_in_worker(&factory, "journey-gate", &clean).await.unwrap();
    assert!(matches!(outcome, ToolExecuteOutcome::Executed(_)));

    kill_worker(&factory, "journey-gate").await.unwrap();
}

#[tokio::test]
async fn spawning_twice_on_the_same_journey_collides_then_succeeds_after_kill() {
    let dir = tempfile::tempdir().unwrap();
    let template = dir.path().join("{journey_id}").display().to_string();
    let factory = WorkerFactory::new(builtin_witness_registry());

    spawn_worker(
        &factory,
        file_size_worker(&template).into(),
        "journey-once",
        Arc::new(ProcessBackend::new()),
    )
    .await
    .unwrap();

    let err = spawn_worker(
        &factory,
        file_size_worker(&template).into(),
        "journey-once",
        Arc::new(ProcessBackend::new()),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, WorkerFactoryError::JourneyCollision { .. }));

    kill_worker(&factory, "journey-once").await.unwrap();

    spawn_worker(
        &factory,
        file_size_worker(&template).into(),
        "journey-once",
        Arc::new(ProcessBackend::new()),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn unknown_journey_operations_error() {
    let factory = WorkerFactory::new(builtin_witness_registry());
    let err = get_worker_state(&factory, "never-spawned").await.unwrap_err();
    assert!(matches!(err, WorkerFactoryError::UnknownJourney { .. }));
}

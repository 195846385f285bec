use super::*;
use crate::models::execution::ConditionKind;
use crate::models::resources::Namespace;
use crate::models::setting::PipelineSetting;
use crate::models::{ObjectMeta, PROJECT_ID_ANNOTATION};
use crate::testutil::{
    harness, sample_execution, sample_pipeline, CountingDeployer, FailingDeployer, StubEngine,
};
use pretty_assertions::assert_eq;
use std::sync::atomic::Ordering;

fn lifecycle_with(
    repository: Arc<crate::repository::memory::MemoryRepository>,
    engine: Arc<StubEngine>,
    deployer: Arc<dyn InfraDeployer>,
) -> Lifecycle {
    Lifecycle::new(repository, engine, deployer)
}

fn quota_setting(project: &str, value: &str) -> PipelineSetting {
    PipelineSetting {
        meta: ObjectMeta::new(project, SETTING_EXECUTOR_QUOTA),
        default: String::new(),
        value: value.to_string(),
    }
}

#[tokio::test]
async fn admission_deploys_and_records_last_run() {
    let (repository, _bus) = harness();
    let pipeline = repository.insert_pipeline(&sample_pipeline("p-demo", "web")).unwrap();
    let execution = repository
        .create_execution(&sample_execution(&pipeline))
        .await
        .unwrap();

    let deployer = Arc::new(CountingDeployer::default());
    let lifecycle = lifecycle_with(
        repository.clone(),
        Arc::new(StubEngine::default()),
        deployer.clone(),
    );

    lifecycle.reconcile(&execution).await.unwrap();

    let stored = repository.get_execution("p-demo", "web-0").await.unwrap();
    assert_eq!(stored.finish(), Finish::Running);
    assert_eq!(
        stored.condition_status(ConditionKind::Initialized),
        Some(crate::models::execution::ConditionStatus::Unknown)
    );
    assert_eq!(deployer.calls.load(Ordering::SeqCst), 1);

    let pipeline = repository.get_pipeline("p-demo", "web").await.unwrap();
    assert_eq!(pipeline.status.next_run, 1);
    assert_eq!(pipeline.status.last_execution_id, "p-demo:web-0");
    assert_eq!(pipeline.status.last_run_state, Some(State::Waiting));
    assert_eq!(pipeline.status.last_started, stored.status.started);
}

#[tokio::test]
async fn admission_does_not_repeat_on_redelivery() {
    let (repository, _bus) = harness();
    let pipeline = repository.insert_pipeline(&sample_pipeline("p-demo", "web")).unwrap();
    let execution = repository
        .create_execution(&sample_execution(&pipeline))
        .await
        .unwrap();

    let deployer = Arc::new(CountingDeployer::default());
    let lifecycle = lifecycle_with(
        repository.clone(),
        Arc::new(StubEngine::default()),
        deployer.clone(),
    );

    lifecycle.reconcile(&execution).await.unwrap();
    let after_first = repository.get_execution("p-demo", "web-0").await.unwrap();
    lifecycle.reconcile(&after_first).await.unwrap();

    let after_second = repository.get_execution("p-demo", "web-0").await.unwrap();
    assert_eq!(after_first, after_second, "redelivery must be a no-op");
    assert_eq!(deployer.calls.load(Ordering::SeqCst), 1);

    let pipeline = repository.get_pipeline("p-demo", "web").await.unwrap();
    assert_eq!(pipeline.status.next_run, 1, "next_run must only advance once");
}

#[tokio::test]
async fn quota_queues_excess_executions_without_deploying() {
    let (repository, _bus) = harness();
    repository.insert_setting(&quota_setting("p-demo", "1")).unwrap();
    let mut pipeline = repository.insert_pipeline(&sample_pipeline("p-demo", "web")).unwrap();

    let deployer = Arc::new(CountingDeployer::default());
    let lifecycle = lifecycle_with(
        repository.clone(),
        Arc::new(StubEngine::default()),
        deployer.clone(),
    );

    let first = repository
        .create_execution(&sample_execution(&pipeline))
        .await
        .unwrap();
    lifecycle.reconcile(&first).await.unwrap();
    pipeline = repository.get_pipeline("p-demo", "web").await.unwrap();

    let second = repository
        .create_execution(&sample_execution(&pipeline))
        .await
        .unwrap();
    lifecycle.reconcile(&second).await.unwrap();

    let stored = repository.get_execution("p-demo", "web-1").await.unwrap();
    assert_eq!(stored.status.execution_state, State::Queueing);
    assert_eq!(stored.finish(), Finish::Queued);
    assert!(
        stored.condition(ConditionKind::Initialized).is_none(),
        "queued executions must not be admitted"
    );
    assert_eq!(
        deployer.calls.load(Ordering::SeqCst),
        1,
        "no infrastructure may be deployed for a queued execution"
    );
}

#[tokio::test]
async fn finishing_promotes_the_queued_execution() {
    let (repository, _bus) = harness();
    repository.insert_setting(&quota_setting("p-demo", "1")).unwrap();
    let mut pipeline = repository.insert_pipeline(&sample_pipeline("p-demo", "web")).unwrap();

    let lifecycle = lifecycle_with(
        repository.clone(),
        Arc::new(StubEngine::default()),
        Arc::new(CountingDeployer::default()),
    );

    let first = repository
        .create_execution(&sample_execution(&pipeline))
        .await
        .unwrap();
    lifecycle.reconcile(&first).await.unwrap();
    pipeline = repository.get_pipeline("p-demo", "web").await.unwrap();

    let second = repository
        .create_execution(&sample_execution(&pipeline))
        .await
        .unwrap();
    lifecycle.reconcile(&second).await.unwrap();

    // The first execution finishes; its reconcile promotes the queued one.
    let mut finished = repository.get_execution("p-demo", "web-0").await.unwrap();
    finished.set_finish(Finish::Terminal);
    finished.status.execution_state = State::Success;
    let finished = repository.update_execution(&finished).await.unwrap();
    lifecycle.reconcile(&finished).await.unwrap();

    let promoted = repository.get_execution("p-demo", "web-1").await.unwrap();
    assert_eq!(promoted.status.execution_state, State::Waiting);
    assert_eq!(promoted.finish(), Finish::Queued, "admission flips the label, not promotion");

    // The promotion update redelivers; admission now lets it run.
    lifecycle.reconcile(&promoted).await.unwrap();
    let admitted = repository.get_execution("p-demo", "web-1").await.unwrap();
    assert_eq!(admitted.finish(), Finish::Running);
}

#[tokio::test]
async fn queue_promotion_is_fifo_by_creation_time() {
    let (repository, _bus) = harness();
    repository.insert_setting(&quota_setting("p-demo", "1")).unwrap();
    let mut pipeline = repository.insert_pipeline(&sample_pipeline("p-demo", "web")).unwrap();

    let lifecycle = lifecycle_with(
        repository.clone(),
        Arc::new(StubEngine::default()),
        Arc::new(CountingDeployer::default()),
    );

    // One running execution fills the quota.
    let running = repository
        .create_execution(&sample_execution(&pipeline))
        .await
        .unwrap();
    lifecycle.reconcile(&running).await.unwrap();

    // Three queued executions with strictly increasing creation timestamps,
    // created deliberately out of name order.
    for (index, created) in [(3u64, "2026-01-01T00:00:03Z"), (1, "2026-01-01T00:00:01Z"), (2, "2026-01-01T00:00:02Z")] {
        pipeline = repository.get_pipeline("p-demo", "web").await.unwrap();
        pipeline.status.next_run = index;
        let mut execution = sample_execution(&pipeline);
        execution.meta.created = created.to_string();
        let execution = repository.create_execution(&execution).await.unwrap();
        lifecycle.reconcile(&execution).await.unwrap();
    }

    let mut promoted_order = vec![];
    let mut current = repository.get_execution("p-demo", "web-0").await.unwrap();
    for _ in 0..3 {
        // Finish the running execution; the oldest queued one gets promoted.
        current.set_finish(Finish::Terminal);
        current.status.execution_state = State::Success;
        let finished = repository.update_execution(&current).await.unwrap();
        lifecycle.reconcile(&finished).await.unwrap();

        let queued = repository
            .list_executions(Some("p-demo"), &Selector::new().eq(FINISH_LABEL, ""))
            .await
            .unwrap();
        let promoted = queued
            .into_iter()
            .find(|execution| execution.status.execution_state == State::Waiting)
            .expect("one queued execution should have been promoted");
        promoted_order.push(promoted.meta.name.clone());

        // Admit it so the next round can finish it.
        lifecycle.reconcile(&promoted).await.unwrap();
        current = repository
            .get_execution("p-demo", &promoted.meta.name)
            .await
            .unwrap();
    }

    assert_eq!(promoted_order, vec!["web-1", "web-2", "web-3"]);
}

#[tokio::test]
async fn abort_folds_into_stage_and_step_state() {
    let (repository, _bus) = harness();
    let mut pipeline = repository.insert_pipeline(&sample_pipeline("p-demo", "web")).unwrap();

    let engine = Arc::new(StubEngine::default());
    let lifecycle = lifecycle_with(
        repository.clone(),
        engine.clone(),
        Arc::new(CountingDeployer::default()),
    );

    let execution = repository
        .create_execution(&sample_execution(&pipeline))
        .await
        .unwrap();
    lifecycle.reconcile(&execution).await.unwrap();

    // Mid-build: engine picked it up, step 0/0 building, then the user aborts.
    let mut aborted = repository.get_execution("p-demo", "web-0").await.unwrap();
    aborted.set_condition(
        ConditionKind::Initialized,
        crate::models::execution::ConditionStatus::True,
        "",
    );
    aborted.status.execution_state = State::Aborted;
    aborted.status.stages[0].state = State::Building;
    aborted.status.stages[0].steps[0].state = State::Building;
    let aborted = repository.update_execution(&aborted).await.unwrap();

    lifecycle.reconcile(&aborted).await.unwrap();

    let stored = repository.get_execution("p-demo", "web-0").await.unwrap();
    assert_eq!(stored.status.stages[0].state, State::Aborted);
    assert_eq!(stored.status.stages[0].steps[0].state, State::Aborted);
    assert_eq!(
        stored.condition(ConditionKind::Built).unwrap().message,
        "aborted by user"
    );
    assert!(engine.stop_calls.load(Ordering::SeqCst) >= 1);

    pipeline = repository.get_pipeline("p-demo", "web").await.unwrap();
    assert_eq!(pipeline.status.last_run_state, Some(State::Aborted));
}

#[tokio::test]
async fn deploy_failure_reaches_terminal_state() {
    let (repository, _bus) = harness();
    repository.insert_pipeline(&sample_pipeline("p-demo", "web")).unwrap();
    let pipeline = repository.get_pipeline("p-demo", "web").await.unwrap();
    let execution = repository
        .create_execution(&sample_execution(&pipeline))
        .await
        .unwrap();

    let lifecycle = lifecycle_with(
        repository.clone(),
        Arc::new(StubEngine::default()),
        Arc::new(FailingDeployer),
    );
    lifecycle.reconcile(&execution).await.unwrap();

    let stored = repository.get_execution("p-demo", "web-0").await.unwrap();
    assert_eq!(stored.status.execution_state, State::Failed);
    assert_eq!(stored.finish(), Finish::Terminal);
    assert!(!stored.status.ended.is_empty());
    let condition = stored.condition(ConditionKind::Initialized).unwrap();
    assert_eq!(
        condition.status,
        crate::models::execution::ConditionStatus::False
    );
    assert!(condition.message.contains("secret provisioning rejected"));
}

#[tokio::test]
async fn terminal_redelivery_changes_nothing() {
    let (repository, _bus) = harness();
    let pipeline = repository.insert_pipeline(&sample_pipeline("p-demo", "web")).unwrap();

    let mut execution = sample_execution(&pipeline);
    execution.set_finish(Finish::Terminal);
    execution.status.execution_state = State::Success;
    let execution = repository.create_execution(&execution).await.unwrap();

    let lifecycle = lifecycle_with(
        repository.clone(),
        Arc::new(StubEngine::default()),
        Arc::new(CountingDeployer::default()),
    );
    lifecycle.reconcile(&execution).await.unwrap();
    lifecycle.reconcile(&execution).await.unwrap();

    let stored = repository.get_execution("p-demo", "web-0").await.unwrap();
    assert_eq!(
        stored.meta.resource_version, execution.meta.resource_version,
        "terminal redelivery must not write"
    );
}

#[tokio::test]
async fn role_bindings_follow_project_membership() {
    let (repository, _bus) = harness();
    let pipeline = repository.insert_pipeline(&sample_pipeline("p-demo", "web")).unwrap();

    let mut member = Namespace {
        meta: ObjectMeta::new("", "web-prod"),
    };
    member.meta.annotations.insert(
        PROJECT_ID_ANNOTATION.to_string(),
        "c-local:p-demo".to_string(),
    );
    repository.insert_namespace(&member).unwrap();

    let mut stranger = Namespace {
        meta: ObjectMeta::new("", "other-team"),
    };
    stranger.meta.annotations.insert(
        PROJECT_ID_ANNOTATION.to_string(),
        "c-local:p-other".to_string(),
    );
    repository.insert_namespace(&stranger).unwrap();

    // A leftover binding in the namespace that left the project.
    repository
        .create_role_binding(&crate::models::resources::RoleBinding::for_project_namespace(
            "other-team",
            "p-demo-pipeline",
        ))
        .await
        .unwrap();

    let lifecycle = lifecycle_with(
        repository.clone(),
        Arc::new(StubEngine::default()),
        Arc::new(CountingDeployer::default()),
    );
    let execution = repository
        .create_execution(&sample_execution(&pipeline))
        .await
        .unwrap();
    lifecycle.reconcile(&execution).await.unwrap();

    assert_eq!(
        repository.role_binding_names(),
        vec!["web-prod/p-demo-pipeline".to_string()]
    );
}

#[tokio::test]
async fn last_run_bookkeeping_is_safe_to_repeat() {
    let (repository, _bus) = harness();
    let pipeline = repository.insert_pipeline(&sample_pipeline("p-demo", "web")).unwrap();
    let execution = repository
        .create_execution(&sample_execution(&pipeline))
        .await
        .unwrap();

    update_pipeline_last_run(repository.as_ref(), &execution)
        .await
        .unwrap();
    update_pipeline_last_run(repository.as_ref(), &execution)
        .await
        .unwrap();

    let pipeline = repository.get_pipeline("p-demo", "web").await.unwrap();
    assert_eq!(pipeline.status.next_run, 1);
    assert_eq!(pipeline.status.last_execution_id, "p-demo:web-0");
}

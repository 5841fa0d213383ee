//! Scheduling and workflow behaviour through the assembled orchestrator.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use switchyard_orchestrator::agents::{AgentRegistration, NewTask, TaskOutcome, TaskStatus};
use switchyard_orchestrator::context::{ContextType, NewContext};
use switchyard_orchestrator::workflow::{
    ExecutionStatus, STEP_RESULTS_KEY, StepStatus, WorkflowDefinition, WorkflowStep,
};
use switchyard_orchestrator::{Orchestrator, OrchestratorConfig};

fn orchestrator() -> Orchestrator {
    Orchestrator::new(OrchestratorConfig::default()).unwrap()
}

#[tokio::test]
async fn test_dependent_step_unblocks_after_completion() {
    let orchestrator = orchestrator();
    let coordinator = orchestrator.coordinator();
    let engine = orchestrator.workflows();
    coordinator
        .register_agent(AgentRegistration::new("writer", "content").with_id("w1").with_max_concurrency(2))
        .await
        .unwrap();
    let context = orchestrator.contexts().create(NewContext::new(ContextType::LearningSession)).await;

    let workflow = engine
        .create_workflow(WorkflowDefinition::new(
            "course-outline",
            vec![
                WorkflowStep::new("A", "content", "draft"),
                WorkflowStep::new("B", "content", "review").depends_on(["A"]),
            ],
        ))
        .await
        .unwrap();
    let started = engine.execute_workflow(&workflow.id, Some(context.id.clone())).await.unwrap();
    assert_eq!(started.task_ids.len(), 2);

    let first = coordinator.assign_pending().await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].task_id, started.task_ids[0]);

    let task_b = coordinator.get_task(&started.task_ids[1]).await.unwrap();
    assert_eq!(task_b.status, TaskStatus::Pending);
    assert!(task_b.agent_id.is_none());

    coordinator
        .complete_task(&started.task_ids[0], TaskOutcome::Succeeded(Some(json!({"chapters": 4}))))
        .await
        .unwrap();
    engine.tick().await;

    let second = coordinator.assign_pending().await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].task_id, started.task_ids[1]);

    coordinator.complete_task(&started.task_ids[1], TaskOutcome::Succeeded(None)).await.unwrap();
    engine.tick().await;

    let execution = engine.get_execution(&started.execution_id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert!(execution.steps.values().all(|s| s.status == StepStatus::Completed));

    let context = orchestrator.contexts().get(&context.id).await.unwrap();
    assert_eq!(context.data[STEP_RESULTS_KEY]["A"]["chapters"], 4);
}

#[tokio::test]
async fn test_concurrent_creation_respects_agent_capacity() {
    let orchestrator = orchestrator();
    let coordinator = orchestrator.coordinator();
    coordinator
        .register_agent(AgentRegistration::new("grader", "grading").with_id("g1").with_max_concurrency(3))
        .await
        .unwrap();
    coordinator
        .register_agent(AgentRegistration::new("grader", "grading").with_id("g2").with_max_concurrency(1))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..20 {
        let coordinator = Arc::clone(&coordinator);
        handles.push(tokio::spawn(async move {
            coordinator.create_task(NewTask::new("grading", "grade", json!({ "submission": i }))).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    coordinator.assign_pending().await.unwrap();

    let g1 = coordinator.get_agent("g1").await.unwrap();
    let g2 = coordinator.get_agent("g2").await.unwrap();
    assert_eq!(g1.active_tasks, 3);
    assert_eq!(g2.active_tasks, 1);
    assert_eq!(coordinator.list_tasks(Some(TaskStatus::Running)).await.len(), 4);
    assert_eq!(coordinator.queue_snapshot().await.len(), 16);
}

#[tokio::test]
async fn test_cancelled_pending_task_never_assigned() {
    let orchestrator = orchestrator();
    let coordinator = orchestrator.coordinator();

    let doomed = coordinator.create_task(NewTask::new("tutor", "explain", json!({}))).await.unwrap();
    let kept = coordinator.create_task(NewTask::new("tutor", "explain", json!({}))).await.unwrap();
    coordinator.cancel_task(&doomed.id).await.unwrap();

    coordinator.register_agent(AgentRegistration::new("tutor", "tutor").with_max_concurrency(5)).await.unwrap();
    let assignments = coordinator.assign_pending().await.unwrap();

    assert_eq!(assignments.len(), 1);
    assert_eq!(assignments[0].task_id, kept.id);
    assert_eq!(coordinator.get_task(&doomed.id).await.unwrap().status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn test_zero_ttl_context_is_never_readable() {
    let orchestrator = orchestrator();
    let contexts = orchestrator.contexts();

    let context = contexts
        .create(NewContext::new(ContextType::AiInteraction).with_ttl(Duration::ZERO))
        .await;
    let err = contexts.get(&context.id).await.unwrap_err();
    assert_eq!(err.code(), "CONTEXT_NOT_FOUND");
    assert_eq!(contexts.stored_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_background_jobs_drive_workflow() {
    let mut config = OrchestratorConfig::default();
    config.scheduler.tick_interval_ms = 20;
    config.workflow.poll_interval_ms = 20;
    let orchestrator = Orchestrator::new(config).unwrap();
    let coordinator = orchestrator.coordinator();
    let engine = orchestrator.workflows();
    coordinator.register_agent(AgentRegistration::new("bot", "bot").with_id("b1")).await.unwrap();

    let workflow = engine
        .create_workflow(WorkflowDefinition::new(
            "pipeline",
            vec![WorkflowStep::new("A", "bot", "one"), WorkflowStep::new("B", "bot", "two").depends_on(["A"])],
        ))
        .await
        .unwrap();
    let started = engine.execute_workflow(&workflow.id, None).await.unwrap();
    orchestrator.start().await.unwrap();

    for task_id in &started.task_ids {
        let mut waited = 0;
        while coordinator.get_task(task_id).await.unwrap().status != TaskStatus::Running {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += 1;
            assert!(waited < 100, "task {task_id} was never assigned");
        }
        coordinator.complete_task(task_id, TaskOutcome::Succeeded(None)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let execution = engine.get_execution(&started.execution_id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    orchestrator.shutdown().await;
}

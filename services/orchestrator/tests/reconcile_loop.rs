//! Reconciler integration tests: agent reports against live entity state.

mod common;

use common::*;

use fleet_id::{MachineId, TaskId};
use fleet_lifecycle::{ErrorCode, NodeState, NodeTaskState, TaskState};
use fleet_orchestrator::ops;
use fleet_orchestrator::queue::{node_command_queue, WorkQueue};
use fleet_orchestrator::scheduler::Scheduler;
use fleet_orchestrator::store::EntityStore;

/// Assign the seeded task to the node via a scheduling pass.
async fn assign(state: &fleet_orchestrator::state::AppState) {
    let scheduler = Scheduler::new(
        state.store().clone(),
        state.queue().clone(),
        state.capacity().clone(),
    );
    let stats = scheduler.tick().await.unwrap();
    assert_eq!(stats.tasks_assigned, 1);
}

#[tokio::test]
async fn worker_running_applies_all_four_writes() {
    let state = test_state();
    let (_job_id, task_id) = seed_pool_job_task(&state).await;
    let machine_id = ready_node(&state).await;
    assign(&state).await;

    report_running(&state, machine_id, task_id).await;

    // Task → Running, Node → Busy, assignment → Running, audit appended.
    let task = state.store().get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.value.state, TaskState::Running);

    let node = state.store().get_node(machine_id).await.unwrap().unwrap();
    assert_eq!(node.value.state, NodeState::Busy);

    let node_tasks = state.store().list_node_tasks_by_task(task_id).await.unwrap();
    assert_eq!(node_tasks.len(), 1);
    assert_eq!(node_tasks[0].state, NodeTaskState::Running);
    assert_eq!(node_tasks[0].machine_id, machine_id);

    let events = state.store().list_task_events(task_id).await.unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn successful_done_stops_task_without_error() {
    let state = test_state();
    let (_job_id, task_id) = seed_pool_job_task(&state).await;
    let machine_id = ready_node(&state).await;
    assign(&state).await;
    report_running(&state, machine_id, task_id).await;

    report_done(&state, machine_id, task_id, true, "").await;

    let task = state.store().get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.value.state, TaskState::Stopping);
    assert!(task.value.error.is_none());

    // The task has left the node.
    assert!(state
        .store()
        .list_node_tasks_by_task(task_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn unsuccessful_done_records_task_failed() {
    let state = test_state();
    let (_job_id, task_id) = seed_pool_job_task(&state).await;
    let machine_id = ready_node(&state).await;
    assign(&state).await;
    report_running(&state, machine_id, task_id).await;

    report_done(&state, machine_id, task_id, false, "segfault at 0x0").await;

    let task = state.store().get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.value.state, TaskState::Stopping);
    let error = task.value.error.unwrap();
    assert_eq!(error.code, ErrorCode::TaskFailed);
    assert!(error.errors.iter().any(|m| m.contains("segfault")));
}

#[tokio::test]
async fn done_before_running_is_always_failure() {
    let state = test_state();
    let (_job_id, task_id) = seed_pool_job_task(&state).await;
    let machine_id = ready_node(&state).await;
    assign(&state).await;

    // The worker died during setup; the agent still reports success.
    report_done(&state, machine_id, task_id, true, "").await;

    let task = state.store().get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.value.state, TaskState::Stopping);
    assert_eq!(task.value.error.unwrap().code, ErrorCode::TaskFailed);
}

#[tokio::test]
async fn duplicate_done_is_idempotent() {
    let state = test_state();
    let (_job_id, task_id) = seed_pool_job_task(&state).await;
    let machine_id = ready_node(&state).await;
    assign(&state).await;
    report_running(&state, machine_id, task_id).await;

    report_done(&state, machine_id, task_id, true, "").await;
    let first = state.store().get_task(task_id).await.unwrap().unwrap();

    // At-least-once delivery: the same report lands again.
    report_done(&state, machine_id, task_id, true, "").await;
    let second = state.store().get_task(task_id).await.unwrap().unwrap();

    assert_eq!(first.value.state, second.value.state);
    assert_eq!(second.value.state, TaskState::Stopping);
    assert!(second.value.error.is_none());

    // Both deliveries are in the audit trail.
    let events = state.store().list_task_events(task_id).await.unwrap();
    assert_eq!(events.len(), 3);
}

#[tokio::test]
async fn out_of_order_running_after_done_is_ignored() {
    let state = test_state();
    let (_job_id, task_id) = seed_pool_job_task(&state).await;
    let machine_id = ready_node(&state).await;
    assign(&state).await;
    report_running(&state, machine_id, task_id).await;
    report_done(&state, machine_id, task_id, true, "").await;

    // The queue reordered an old running report past the done report.
    report_running(&state, machine_id, task_id).await;

    let task = state.store().get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.value.state, TaskState::Stopping);
    // The stale report must not have recreated the assignment.
    assert!(state
        .store()
        .list_node_tasks_by_task(task_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn unknown_machine_is_accepted_without_mutation() {
    let state = test_state();
    let (_job_id, task_id) = seed_pool_job_task(&state).await;

    let payload = serde_json::json!({
        "machine_id": MachineId::new(),
        "event": { "running": { "task_id": task_id } },
    });
    ops::events::submit(&state, payload).await.unwrap();

    let task = state.store().get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.value.state, TaskState::Scheduled);
    assert!(state.store().list_task_events(task_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn worker_event_for_unknown_task_is_unable_to_find() {
    let state = test_state();
    seed_pool_job_task(&state).await;
    let machine_id = ready_node(&state).await;

    let payload = serde_json::json!({
        "machine_id": machine_id,
        "event": { "running": { "task_id": TaskId::new() } },
    });
    let err = ops::events::submit(&state, payload).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::UnableToFind);
}

#[tokio::test]
async fn idle_report_with_reimage_holds_state_and_sends_one_stop() {
    let state = test_state();
    let (_job_id, task_id) = seed_pool_job_task(&state).await;
    let machine_id = ready_node(&state).await;
    assign(&state).await;
    report_running(&state, machine_id, task_id).await;

    // Reimage requested while the node is busy: nothing happens yet.
    ops::nodes::request_reimage(&state, machine_id).await.unwrap();
    let queue_name = node_command_queue(machine_id);
    let before = state.queue().pending(&queue_name).await.unwrap();

    // The agent finishes its work and reports idle.
    report_state(&state, machine_id, NodeState::Free).await;

    // Recorded state unchanged, exactly one stop command queued.
    let node = state.store().get_node(machine_id).await.unwrap().unwrap();
    assert_eq!(node.value.state, NodeState::Busy);
    assert!(node.value.reimage_requested);
    assert_eq!(state.queue().pending(&queue_name).await.unwrap(), before + 1);
}

#[tokio::test]
async fn node_cycles_back_to_ready_after_work() {
    let state = test_state();
    let (_job_id, task_id) = seed_pool_job_task(&state).await;
    let machine_id = ready_node(&state).await;
    assign(&state).await;
    report_running(&state, machine_id, task_id).await;
    report_done(&state, machine_id, task_id, true, "").await;

    report_state(&state, machine_id, NodeState::Ready).await;

    let node = state.store().get_node(machine_id).await.unwrap().unwrap();
    assert_eq!(node.value.state, NodeState::Ready);

    // An impossible report (ready → init) is discarded.
    report_state(&state, machine_id, NodeState::Init).await;
    let node = state.store().get_node(machine_id).await.unwrap().unwrap();
    assert_eq!(node.value.state, NodeState::Ready);
}

#[tokio::test]
async fn failure_propagates_to_dependent_tasks() {
    let state = test_state();
    let (job_id, fuzz_task) = seed_pool_job_task(&state).await;
    let machine_id = ready_node(&state).await;

    // A crash-report task gated on the fuzz task.
    let mut dependent_config = task_config();
    dependent_config.task_type = fleet_orchestrator::model::TaskType::CrashReport;
    dependent_config.prereq_tasks = vec![fuzz_task];
    let dependent = ops::tasks::create_task(&state, job_id, dependent_config)
        .await
        .unwrap();

    assign(&state).await;
    report_running(&state, machine_id, fuzz_task).await;
    report_done(&state, machine_id, fuzz_task, false, "oom").await;

    let dependent = state
        .store()
        .get_task(dependent.value.task_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dependent.value.state, TaskState::Stopping);
    let error = dependent.value.error.unwrap();
    assert_eq!(error.code, ErrorCode::TaskFailed);
    assert!(error.errors.iter().any(|m| m.contains("prerequisite")));
}

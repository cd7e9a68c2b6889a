//! Shared harness for orchestrator integration tests.
//!
//! Everything runs against the in-memory store and queue, with the noop
//! capacity backend; the flows under test are exactly the ones the real
//! deployment drives against Postgres and a broker.

// Each test binary uses its own slice of the harness.
#![allow(dead_code)]

use std::sync::Arc;

use fleet_id::{JobId, MachineId, TaskId};
use fleet_lifecycle::NodeState;
use fleet_orchestrator::capacity::NoopBackend;
use fleet_orchestrator::model::{JobConfig, Os, TaskConfig, TaskType};
use fleet_orchestrator::ops;
use fleet_orchestrator::queue::MemoryQueue;
use fleet_orchestrator::state::AppState;
use fleet_orchestrator::store::MemoryStore;

pub const POOL: &str = "linux-fuzzing";

pub fn test_state() -> AppState {
    AppState::new(
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryQueue::new()),
        Arc::new(NoopBackend),
    )
}

pub fn job_config() -> JobConfig {
    JobConfig {
        project: "example".into(),
        name: "fuzzing".into(),
        build: "build-1".into(),
        duration_hours: 24,
    }
}

pub fn task_config() -> TaskConfig {
    TaskConfig {
        task_type: TaskType::Fuzz,
        pool_name: POOL.into(),
        target_exe: "setup/fuzz.exe".into(),
        target_options: vec![],
        containers: vec!["corpus".into(), "crashes".into()],
        task_timeout_secs: None,
        check_retry_count: 0,
        prereq_tasks: vec![],
    }
}

/// Create the pool plus one job and one queued task.
pub async fn seed_pool_job_task(state: &AppState) -> (JobId, TaskId) {
    ops::pools::create_pool(state, POOL, Os::Linux, true)
        .await
        .unwrap();
    let job = ops::jobs::create_job(state, job_config()).await.unwrap();
    let task = ops::tasks::create_task(state, job.value.job_id, task_config())
        .await
        .unwrap();
    (job.value.job_id, task.value.task_id)
}

/// Register a node and walk it to `Ready` through agent reports.
pub async fn ready_node(state: &AppState) -> MachineId {
    let machine_id = MachineId::new();
    ops::nodes::register_node(state, machine_id, POOL, None)
        .await
        .unwrap();
    report_state(state, machine_id, NodeState::SettingUp).await;
    report_state(state, machine_id, NodeState::Ready).await;
    machine_id
}

/// Submit an agent node-state report.
pub async fn report_state(state: &AppState, machine_id: MachineId, node_state: NodeState) {
    let payload = serde_json::json!({
        "machine_id": machine_id,
        "event": { "state": node_state },
    });
    ops::events::submit(state, payload).await.unwrap();
}

/// Submit a worker "running" report.
pub async fn report_running(state: &AppState, machine_id: MachineId, task_id: TaskId) {
    let payload = serde_json::json!({
        "machine_id": machine_id,
        "event": { "running": { "task_id": task_id } },
    });
    ops::events::submit(state, payload).await.unwrap();
}

/// Submit a worker "done" report.
pub async fn report_done(
    state: &AppState,
    machine_id: MachineId,
    task_id: TaskId,
    success: bool,
    stderr: &str,
) {
    let payload = done_payload(machine_id, task_id, success, stderr);
    ops::events::submit(state, payload).await.unwrap();
}

pub fn done_payload(
    machine_id: MachineId,
    task_id: TaskId,
    success: bool,
    stderr: &str,
) -> serde_json::Value {
    serde_json::json!({
        "machine_id": machine_id,
        "event": {
            "done": {
                "task_id": task_id,
                "exit_status": { "code": if success { 0 } else { 1 }, "success": success },
                "stderr": stderr,
                "stdout": "",
            }
        }
    })
}

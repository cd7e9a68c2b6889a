//! Node operations.

use fleet_events::NodeCommand;
use fleet_id::{MachineId, ScalesetId};
use fleet_lifecycle::NodeState;
use tracing::info;

use crate::error::ApiError;
use crate::model::Node;
use crate::queue::{enqueue_message, node_command_queue};
use crate::state::AppState;
use crate::store::Versioned;

/// Register (or re-register) a node's agent.
///
/// Agents self-register on boot. A machine that reappears after a reimage
/// gets its record reset to a blank slate rather than inheriting stale
/// state or teardown flags.
pub async fn register_node(
    state: &AppState,
    machine_id: MachineId,
    pool_name: &str,
    scaleset_id: Option<ScalesetId>,
) -> Result<Versioned<Node>, ApiError> {
    let store = state.store();

    if store.get_pool(pool_name).await?.is_none() {
        return Err(ApiError::unable_to_find(format!("pool {pool_name}")));
    }

    let mut node = Node::new(machine_id, pool_name);
    node.scaleset_id = scaleset_id;

    let stored = match store.get_node(machine_id).await? {
        Some(existing) => store.update_node(existing.with_value(node)).await?,
        None => store.insert_node(node).await?,
    };

    info!(machine_id = %machine_id, pool = %pool_name, "Registered node");
    Ok(stored)
}

pub async fn get_node(state: &AppState, machine_id: MachineId) -> Result<Versioned<Node>, ApiError> {
    state
        .store()
        .get_node(machine_id)
        .await?
        .ok_or_else(|| ApiError::unable_to_find(format!("node {machine_id}")))
}

/// Request a reimage. The flag is deferred: it executes the next time the
/// node is idle. An already-idle node is told to stop right away.
pub async fn request_reimage(state: &AppState, machine_id: MachineId) -> Result<(), ApiError> {
    set_teardown_flag(state, machine_id, TeardownFlag::Reimage).await
}

/// Request deletion. Same deferred semantics as reimage.
pub async fn request_delete(state: &AppState, machine_id: MachineId) -> Result<(), ApiError> {
    set_teardown_flag(state, machine_id, TeardownFlag::Delete).await
}

enum TeardownFlag {
    Reimage,
    Delete,
}

async fn set_teardown_flag(
    state: &AppState,
    machine_id: MachineId,
    flag: TeardownFlag,
) -> Result<(), ApiError> {
    let node = get_node(state, machine_id).await?;

    let was_idle = node.value.state.is_idle();
    let mut flagged = node.value.clone();
    match flag {
        TeardownFlag::Reimage => flagged.reimage_requested = true,
        TeardownFlag::Delete => flagged.delete_requested = true,
    }

    state.store().update_node(node.with_value(flagged)).await?;

    if was_idle {
        enqueue_message(
            state.queue().as_ref(),
            &node_command_queue(machine_id),
            &NodeCommand::stop_node(),
        )
        .await?;
    }

    info!(machine_id = %machine_id, "Requested node teardown");
    Ok(())
}

/// Nodes currently idle and schedulable within a pool.
pub async fn list_ready_nodes(
    state: &AppState,
    pool_name: &str,
) -> Result<Vec<Versioned<Node>>, ApiError> {
    Ok(state
        .store()
        .list_nodes_by_state(Some(pool_name), &[NodeState::Ready])
        .await?)
}

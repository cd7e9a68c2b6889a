//! Scaleset operations.

use fleet_events::NodeCommand;
use fleet_id::ScalesetId;
use fleet_lifecycle::{NodeState, ScalesetState};
use tracing::info;

use crate::error::ApiError;
use crate::model::Scaleset;
use crate::queue::{enqueue_message, node_command_queue};
use crate::state::AppState;
use crate::store::Versioned;

pub async fn create_scaleset(
    state: &AppState,
    pool_name: &str,
    size: u64,
    image: &str,
    region: &str,
) -> Result<Versioned<Scaleset>, ApiError> {
    if state.store().get_pool(pool_name).await?.is_none() {
        return Err(ApiError::unable_to_find(format!("pool {pool_name}")));
    }

    let scaleset = Scaleset::new(pool_name, size, image, region);
    let stored = state.store().insert_scaleset(scaleset).await?;

    // Hand the target to the backend; provisioning happens out of band and
    // nodes register themselves as they come up.
    state
        .capacity()
        .set_capacity(stored.value.scaleset_id, size)
        .await?;

    let mut setting_up = stored.value.clone();
    setting_up.state = ScalesetState::Setup;
    let stored = state
        .store()
        .update_scaleset(stored.with_value(setting_up))
        .await?;

    info!(
        scaleset_id = %stored.value.scaleset_id,
        pool = %pool_name,
        size,
        "Created scaleset"
    );
    Ok(stored)
}

pub async fn get_scaleset(
    state: &AppState,
    scaleset_id: ScalesetId,
) -> Result<Versioned<Scaleset>, ApiError> {
    state
        .store()
        .get_scaleset(scaleset_id)
        .await?
        .ok_or_else(|| ApiError::unable_to_find(format!("scaleset {scaleset_id}")))
}

pub async fn list_scalesets(
    state: &AppState,
    pool_name: &str,
) -> Result<Vec<Versioned<Scaleset>>, ApiError> {
    Ok(state.store().list_scalesets_by_pool(pool_name).await?)
}

/// Drain and halt a scaleset. Its nodes are flagged for deletion; the
/// janitor reclaims each one once its agent confirms shutdown.
pub async fn stop_scaleset(state: &AppState, scaleset_id: ScalesetId) -> Result<(), ApiError> {
    let scaleset = get_scaleset(state, scaleset_id).await?;
    if !scaleset.value.state.can_transition_to(ScalesetState::Shutdown) {
        return Ok(()); // already on its way out
    }

    let pool_name = scaleset.value.pool_name.clone();
    let mut draining = scaleset.value.clone();
    draining.state = ScalesetState::Shutdown;
    match state.store().update_scaleset(scaleset.with_value(draining)).await {
        Ok(_) => {}
        Err(e) if e.is_conflict() => return Ok(()),
        Err(e) => return Err(e.into()),
    }

    let nodes = state
        .store()
        .list_nodes_by_state(
            Some(&pool_name),
            &[
                NodeState::Init,
                NodeState::SettingUp,
                NodeState::Ready,
                NodeState::Busy,
                NodeState::Free,
            ],
        )
        .await?;
    for node in nodes {
        if node.value.scaleset_id != Some(scaleset_id) || node.value.delete_requested {
            continue;
        }
        let machine_id = node.value.machine_id;
        let was_idle = node.value.state.is_idle();
        let mut flagged = node.value.clone();
        flagged.delete_requested = true;
        match state.store().update_node(node.with_value(flagged)).await {
            Ok(_) => {
                if was_idle {
                    enqueue_message(
                        state.queue().as_ref(),
                        &node_command_queue(machine_id),
                        &NodeCommand::stop_node(),
                    )
                    .await?;
                }
            }
            Err(e) if e.is_conflict() => continue,
            Err(e) => return Err(e.into()),
        }
    }

    info!(scaleset_id = %scaleset_id, "Stopping scaleset");
    Ok(())
}

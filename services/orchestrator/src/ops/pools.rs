//! Pool operations.

use fleet_lifecycle::ScalesetState;
use tracing::info;

use crate::error::ApiError;
use crate::model::{Os, Pool};
use crate::state::AppState;
use crate::store::{StoreError, Versioned};

use super::scalesets;

pub async fn create_pool(
    state: &AppState,
    name: &str,
    os: Os,
    managed: bool,
) -> Result<Versioned<Pool>, ApiError> {
    if name.is_empty() {
        return Err(ApiError::invalid_request("pool name must be non-empty"));
    }

    let pool = Pool::new(name, os, managed);
    let stored = match state.store().insert_pool(pool).await {
        Ok(stored) => stored,
        Err(StoreError::AlreadyExists { .. }) => {
            // Name + OS is unique and immutable after creation.
            return Err(ApiError::invalid_request(format!(
                "pool {name} already exists"
            )));
        }
        Err(e) => return Err(e.into()),
    };

    info!(pool = %name, os = %os, managed, "Created pool");
    Ok(stored)
}

pub async fn get_pool(state: &AppState, name: &str) -> Result<Versioned<Pool>, ApiError> {
    state
        .store()
        .get_pool(name)
        .await?
        .ok_or_else(|| ApiError::unable_to_find(format!("pool {name}")))
}

pub async fn list_pools(state: &AppState) -> Result<Vec<Versioned<Pool>>, ApiError> {
    Ok(state.store().list_pools().await?)
}

/// Shut a pool down: every backing scaleset drains and halts.
pub async fn stop_pool(state: &AppState, name: &str) -> Result<(), ApiError> {
    let pool = get_pool(state, name).await?;

    let backing = state.store().list_scalesets_by_pool(&pool.value.name).await?;
    for scaleset in backing {
        if scaleset.value.state == ScalesetState::Halt {
            continue;
        }
        scalesets::stop_scaleset(state, scaleset.value.scaleset_id).await?;
    }

    info!(pool = %name, "Stopping pool");
    Ok(())
}

//! Shared application state.

use std::sync::Arc;

use crate::capacity::CapacityBackend;
use crate::queue::WorkQueue;
use crate::store::EntityStore;

/// Shared handles to the orchestrator's collaborators.
///
/// Cloned freely; all workers and the operations surface hang off this.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    store: Arc<dyn EntityStore>,
    queue: Arc<dyn WorkQueue>,
    capacity: Arc<dyn CapacityBackend>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn EntityStore>,
        queue: Arc<dyn WorkQueue>,
        capacity: Arc<dyn CapacityBackend>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                store,
                queue,
                capacity,
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.inner.store
    }

    pub fn queue(&self) -> &Arc<dyn WorkQueue> {
        &self.inner.queue
    }

    pub fn capacity(&self) -> &Arc<dyn CapacityBackend> {
        &self.inner.capacity
    }
}

//! Shared service handles injected into request handlers.

use std::sync::Arc;

use chronos_engine::Worker;
use chronos_store::JobStore;

/// Everything a handler can reach.
///
/// The worker handle is optional: with `DISABLE_WORKER` the same binary
/// only serves the API while separate worker processes poll the store.
pub struct AppServices {
    pub store: Arc<dyn JobStore>,
    pub worker: Option<Arc<Worker>>,
}

impl AppServices {
    pub fn new(store: Arc<dyn JobStore>, worker: Option<Arc<Worker>>) -> Self {
        Self { store, worker }
    }
}

use std::sync::Arc;

use troupe_core::ChatDispatcher;
use troupe_memory::Store;

/// Shared application state accessible from all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<ChatDispatcher>,
    pub store: Arc<Store>,
}

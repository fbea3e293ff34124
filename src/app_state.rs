use std::sync::Arc;

use crate::services::scheduler::Scheduler;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
}

impl AppState {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }
}

use std::time::Duration;

use crate::application::Db;

/// Shared state of the CRUD router.
#[derive(Clone)]
pub struct HttpState {
    pub db: Db,
    /// Deadline applied to every request's context; `None` disables it.
    pub request_timeout: Option<Duration>,
}

impl HttpState {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            request_timeout: None,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }
}

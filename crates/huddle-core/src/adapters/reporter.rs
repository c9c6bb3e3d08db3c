//! [`ErrorReporter`] adapters.

use std::sync::Mutex;

use tracing::{error, warn};

use crate::application::lock;
use crate::application::ports::ErrorReporter;
use crate::domain::error::{ErrorClass, SyncError};

/// Reports through `tracing`. Device and degradation failures need the user
/// to act and are logged as errors; the rest as warnings.
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, err: &SyncError, context: &str) {
        match err.class() {
            ErrorClass::Device | ErrorClass::Degradation => {
                error!(context, class = ?err.class(), "{err}")
            }
            ErrorClass::Transient | ErrorClass::Lifecycle => {
                warn!(context, class = ?err.class(), "{err}")
            }
        }
    }
}

/// Keeps every report in memory.
#[derive(Default)]
pub struct CollectingReporter {
    reports: Mutex<Vec<(SyncError, String)>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<(SyncError, String)> {
        lock(&self.reports).clone()
    }

    pub fn contexts(&self) -> Vec<String> {
        lock(&self.reports).iter().map(|(_, c)| c.clone()).collect()
    }
}

impl ErrorReporter for CollectingReporter {
    fn report(&self, err: &SyncError, context: &str) {
        lock(&self.reports).push((err.clone(), context.to_string()));
    }
}

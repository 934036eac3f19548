//! Worker pool
//!
//! Asynchronous call processing and sponsor renewal callbacks run here,
//! never on the thread that initiated them.

use std::any::Any;

use tokio::runtime::Handle;
use tracing::trace;

use crate::error::{RemotingError, Result};

/// Blocking-work pool backed by a tokio runtime
#[derive(Clone, Debug)]
pub struct WorkerPool {
    handle: Handle,
}

impl WorkerPool {
    /// Create a pool on the given runtime
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Create a pool on the runtime the caller is running in
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| RemotingError::NoRuntime(e.to_string()))
    }

    /// Runtime handle, for spawning async tasks
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Run `work` on a pool thread
    pub fn execute<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        trace!("queueing work item");
        // Detached: completion is reported by the work item itself.
        drop(self.handle.spawn_blocking(work));
    }
}

/// Text of a caught panic payload
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

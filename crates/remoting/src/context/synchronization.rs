//! Synchronization property
//!
//! Serializes every call entering a context. The lock is reentrant, so a
//! call that re-enters the context on the same thread (a callback into an
//! object of the same context) does not deadlock.

use std::sync::Arc;

use parking_lot::ReentrantMutex;
use tracing::trace;

use super::{ContextProperty, SinkKind};
use crate::message::Message;
use crate::sink::{deliver, CallControl, MessageControl, MessageSink};
use crate::worker::WorkerPool;

/// Name the property is registered under
pub const SYNCHRONIZATION_PROPERTY: &str = "Synchronization";

/// Context property that serializes incoming calls
pub struct SynchronizationProperty {
    lock: Arc<ReentrantMutex<()>>,
    pool: WorkerPool,
}

impl SynchronizationProperty {
    pub fn new(pool: WorkerPool) -> Arc<Self> {
        Arc::new(Self {
            lock: Arc::new(ReentrantMutex::new(())),
            pool,
        })
    }

    /// Whether some call currently holds the context
    pub fn is_busy(&self) -> bool {
        self.lock.is_locked()
    }
}

impl ContextProperty for SynchronizationProperty {
    fn name(&self) -> &str {
        SYNCHRONIZATION_PROPERTY
    }

    fn contributes(&self, kind: SinkKind) -> bool {
        kind == SinkKind::Server
    }

    fn create_sink(&self, _kind: SinkKind, next: Arc<dyn MessageSink>) -> Arc<dyn MessageSink> {
        Arc::new(SynchronizedSink {
            lock: self.lock.clone(),
            pool: self.pool.clone(),
            next,
        })
    }
}

/// Server-side sink holding the context lock for the duration of a call
pub struct SynchronizedSink {
    lock: Arc<ReentrantMutex<()>>,
    pool: WorkerPool,
    next: Arc<dyn MessageSink>,
}

impl MessageSink for SynchronizedSink {
    fn sync_process_message(&self, msg: Message) -> Message {
        let _guard = self.lock.lock();
        trace!("entered synchronized context");
        self.next.sync_process_message(msg)
    }

    fn async_process_message(
        &self,
        msg: Message,
        reply_sink: Option<Arc<dyn MessageSink>>,
    ) -> Option<Arc<dyn MessageControl>> {
        // The whole call runs under the lock, so it is driven synchronously
        // from a worker.
        let control = CallControl::new();
        let task_control = control.clone();
        let lock = self.lock.clone();
        let next = self.next.clone();
        self.pool.execute(move || {
            if !task_control.begin() {
                return;
            }
            let reply = {
                let _guard = lock.lock();
                next.sync_process_message(msg)
            };
            deliver(reply_sink.as_ref(), reply);
        });
        Some(control)
    }

    fn next_sink(&self) -> Option<Arc<dyn MessageSink>> {
        Some(self.next.clone())
    }

    fn name(&self) -> &'static str {
        "SynchronizedSink"
    }
}

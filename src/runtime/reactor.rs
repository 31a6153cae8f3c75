//! The shared reactor.
//!
//! Every asynchronous operation (accept, read, write, timer) is submitted
//! here. Any worker thread may run its completion. The reactor keeps a table
//! of in-flight operations so shutdown can wait until nothing is pending.

use crate::runtime::token::{OpType, TokenAllocator};
use crate::shutdown::Lifecycle;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::trace;

/// Initial capacity of the in-flight operation table.
const INITIAL_OPS: usize = 1024;

/// Shared event loop handle.
pub struct Reactor {
    handle: Handle,
    ops: Mutex<TokenAllocator>,
    idle: Notify,
    lifecycle: Lifecycle,
}

impl Reactor {
    /// Create a reactor that spawns onto `handle`.
    pub fn new(handle: Handle) -> Arc<Self> {
        Arc::new(Self {
            handle,
            ops: Mutex::new(TokenAllocator::new(INITIAL_OPS)),
            idle: Notify::new(),
            lifecycle: Lifecycle::new(),
        })
    }

    /// Create a reactor on the runtime of the calling task.
    ///
    /// # Panics
    /// Panics if called outside a tokio runtime.
    #[cfg(test)]
    pub fn current() -> Arc<Self> {
        Self::new(Handle::current())
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Submit an operation. Its token stays allocated until `op` finishes.
    ///
    /// Completion handlers run inside `op`, so an operation issued from a
    /// completion is registered before the current one is released.
    pub fn submit<F>(self: &Arc<Self>, op: OpType, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.lock_ops().alloc(op);
        let in_flight = InFlight {
            reactor: Arc::clone(self),
            token,
        };
        self.handle.spawn(async move {
            fut.await;
            drop(in_flight);
        });
    }

    /// Number of operations currently in flight.
    pub fn pending(&self) -> usize {
        self.lock_ops().len()
    }

    /// Number of in-flight operations matching `pred`.
    pub fn pending_matching(&self, pred: impl Fn(&OpType) -> bool) -> usize {
        self.lock_ops().count(pred)
    }

    /// Resolves once no operation is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn complete(&self, token: u64) {
        let mut ops = self.lock_ops();
        let op = ops.free(token);
        trace!(
            token,
            ?op,
            conn_id = ?op.and_then(|op| op.conn_id()),
            "Operation complete"
        );
        if ops.is_empty() {
            drop(ops);
            self.idle.notify_waiters();
        }
    }

    fn lock_ops(&self) -> MutexGuard<'_, TokenAllocator> {
        self.ops.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases an operation token when the operation ends, including by panic.
struct InFlight {
    reactor: Arc<Reactor>,
    token: u64,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.reactor.complete(self.token);
    }
}

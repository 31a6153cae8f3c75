//! Worker pool: N threads all driving the same reactor.
//!
//! Any worker may pick up the next ready completion, so nothing running on
//! the reactor may assume thread affinity.

use crate::runtime::reactor::Reactor;
use crate::runtime::token::OpType;
use crate::shutdown::Phase;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tracing::{info, warn};

/// Grace period for runtime threads after the reactor went idle.
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

pub struct WorkerPool {
    runtime: Runtime,
    reactor: Arc<Reactor>,
    threads: usize,
}

impl WorkerPool {
    /// Start `threads` workers. Zero means one per available CPU.
    pub fn new(threads: usize) -> io::Result<Self> {
        let threads = if threads == 0 { num_cpus() } else { threads };

        let next_id = AtomicUsize::new(0);
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name_fn(move || format!("worker-{}", next_id.fetch_add(1, Ordering::Relaxed)))
            .enable_all()
            .build()?;
        let reactor = Reactor::new(runtime.handle().clone());

        info!(threads, "Worker pool started");

        Ok(Self {
            runtime,
            reactor,
            threads,
        })
    }

    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    #[cfg(test)]
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Block the calling thread on `fut`.
    pub fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }

    /// Wait until the reactor has no pending work, then stop the workers.
    ///
    /// Returns false if `drain_timeout` elapsed first; the runtime is shut
    /// down regardless.
    pub fn join(self, drain_timeout: Duration) -> bool {
        let reactor = Arc::clone(&self.reactor);
        let drained = self
            .runtime
            .block_on(async { tokio::time::timeout(drain_timeout, reactor.wait_idle()).await })
            .is_ok();

        if drained {
            reactor.lifecycle().advance(Phase::Idle);
        } else {
            warn!(
                pending = reactor.pending(),
                reads = reactor.pending_matching(|op| matches!(op, OpType::Read { .. })),
                writes = reactor.pending_matching(|op| matches!(op, OpType::Write { .. })),
                timers = reactor.pending_matching(|op| matches!(op, OpType::Timer { .. })),
                timeout_secs = drain_timeout.as_secs(),
                "Drain timed out, forcing shutdown"
            );
        }

        self.runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
        info!(threads = self.threads, "Worker pool stopped");
        drained
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[test]
    fn test_zero_threads_uses_cpu_count() {
        let pool = WorkerPool::new(0).unwrap();
        assert_eq!(pool.threads(), num_cpus());
        assert!(pool.join(Duration::from_secs(1)));
    }

    #[test]
    fn test_completions_run_on_several_workers() {
        let pool = WorkerPool::new(4).unwrap();
        let names = Arc::new(Mutex::new(HashSet::new()));

        for i in 0..64 {
            let names = Arc::clone(&names);
            pool.reactor().submit(OpType::Timer { conn_id: i }, async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                let name = std::thread::current().name().map(str::to_string);
                names.lock().unwrap().insert(name);
            });
        }

        let reactor = Arc::clone(pool.reactor());
        assert!(pool.join(Duration::from_secs(5)));
        assert_eq!(reactor.lifecycle().phase(), Phase::Idle);

        let names = names.lock().unwrap();
        assert!(names.iter().all(|n| n.as_deref().is_some_and(|n| n.starts_with("worker-"))));
    }

    #[test]
    fn test_join_times_out_on_stuck_work() {
        let pool = WorkerPool::new(1).unwrap();
        pool.reactor().submit(OpType::Accept, std::future::pending());

        let reactor = Arc::clone(pool.reactor());
        assert!(!pool.join(Duration::from_millis(50)));
        assert_ne!(reactor.lifecycle().phase(), Phase::Idle);
    }
}

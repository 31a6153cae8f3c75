//! Periodic health-check reaper.
//!
//! Every tracked connection has one recurring timer. On each tick, under the
//! registry guard, the timer either lapses (server stopped), reaps a
//! connection that reached a terminal state, or re-arms itself. Connections
//! never notify the registry themselves; this is the single point where the
//! registry shrinks while the server runs.

use crate::runtime::{ConnStatus, Connection, ConnectionRegistry, OpType, Reactor};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Default interval between health checks.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// What the owner of a health timer exposes to it.
///
/// A pending timer holds a strong reference to its owner.
pub trait Monitored: Send + Sync + 'static {
    fn reactor(&self) -> &Arc<Reactor>;
    fn registry(&self) -> &ConnectionRegistry;
    fn is_stopped(&self) -> bool;
}

/// Outcome of one health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Server stopped or connection no longer tracked: do not re-arm.
    Lapse,
    /// Connection was in the given terminal state and has been removed.
    Reaped(ConnStatus),
    /// Connection is healthy: check again later.
    Rearm,
}

/// Inspect one connection of `owner`.
///
/// The stop flag and the connection status are both read under the
/// registry guard.
pub fn inspect<S: Monitored + ?Sized>(owner: &S, conn: &Arc<Connection>) -> Verdict {
    let mut entries = owner.registry().lock();
    if owner.is_stopped() || !entries.contains(conn) {
        return Verdict::Lapse;
    }
    match conn.status() {
        ConnStatus::Error => {
            conn.close();
            entries.remove(conn);
            Verdict::Reaped(ConnStatus::Error)
        }
        ConnStatus::Closed => {
            entries.remove(conn);
            Verdict::Reaped(ConnStatus::Closed)
        }
        ConnStatus::Connected => Verdict::Rearm,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HealthMonitor {
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Arm the recurring timer for `conn`.
    pub fn arm<S: Monitored>(&self, owner: Arc<S>, conn: Arc<Connection>) {
        let monitor = *self;
        let reactor = Arc::clone(owner.reactor());
        reactor.submit(OpType::Timer { conn_id: conn.id() }, async move {
            tokio::time::sleep(monitor.interval).await;
            match inspect(&*owner, &conn) {
                Verdict::Rearm => monitor.arm(owner, conn),
                Verdict::Reaped(status) => {
                    debug!(conn_id = conn.id(), ?status, "Reaped connection");
                }
                Verdict::Lapse => {
                    trace!(conn_id = conn.id(), "Health check lapsed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;
    use tokio::io::{duplex, DuplexStream};

    struct Owner {
        reactor: Arc<Reactor>,
        registry: ConnectionRegistry,
        stopped: AtomicBool,
    }

    impl Monitored for Owner {
        fn reactor(&self) -> &Arc<Reactor> {
            &self.reactor
        }

        fn registry(&self) -> &ConnectionRegistry {
            &self.registry
        }

        fn is_stopped(&self) -> bool {
            self.stopped.load(Ordering::Acquire)
        }
    }

    fn owner() -> Arc<Owner> {
        Arc::new(Owner {
            reactor: Reactor::current(),
            registry: ConnectionRegistry::new(64),
            stopped: AtomicBool::new(false),
        })
    }

    fn track(owner: &Owner) -> (Arc<Connection>, DuplexStream) {
        let mut peer = None;
        let conn = owner
            .registry
            .insert_with(|id| {
                let (client, server) = duplex(1024);
                peer = Some(client);
                let (reader, writer) = tokio::io::split(server);
                Connection::new(id, Arc::clone(&owner.reactor), reader, writer, None)
            })
            .unwrap();
        conn.start();
        (conn, peer.unwrap())
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_inspect_verdicts() {
        let owner = owner();

        let (healthy, _peer) = track(&owner);
        assert_eq!(inspect(&*owner, &healthy), Verdict::Rearm);

        let (broken, peer) = track(&owner);
        drop(peer);
        wait_for(|| broken.status() == ConnStatus::Error).await;
        assert_eq!(inspect(&*owner, &broken), Verdict::Reaped(ConnStatus::Error));
        assert_eq!(broken.status(), ConnStatus::Closed);
        assert_eq!(broken.stats().close_actions, 1);
        assert!(!owner.registry.contains(&broken));

        let (closed, _peer) = track(&owner);
        closed.close();
        assert_eq!(inspect(&*owner, &closed), Verdict::Reaped(ConnStatus::Closed));
        assert_eq!(closed.stats().close_actions, 1);

        // Already gone
        assert_eq!(inspect(&*owner, &closed), Verdict::Lapse);

        // Stopped: leave the registry alone
        owner.stopped.store(true, Ordering::Release);
        assert_eq!(inspect(&*owner, &healthy), Verdict::Lapse);
        assert!(owner.registry.contains(&healthy));
        assert_eq!(owner.registry.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_errored_connection_reaped_within_interval() {
        let owner = owner();
        let interval = Duration::from_millis(50);
        let monitor = HealthMonitor::new(interval);

        let (conn, peer) = track(&owner);
        monitor.arm(Arc::clone(&owner), Arc::clone(&conn));
        assert_eq!(owner.registry.len(), 1);

        drop(peer);
        // Closed only ever follows Error here, set by the reaper itself.
        wait_for(|| conn.status() != ConnStatus::Connected).await;
        let failed_at = Instant::now();

        wait_for(|| owner.registry.is_empty()).await;
        let elapsed = failed_at.elapsed();
        assert!(
            elapsed <= interval * 2 + Duration::from_millis(50),
            "reaped after {:?} with a {:?} interval",
            elapsed,
            interval
        );
        assert_eq!(conn.status(), ConnStatus::Closed);

        tokio::time::timeout(Duration::from_secs(5), owner.reactor.wait_idle())
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timer_lapses_after_stop() {
        let owner = owner();
        let monitor = HealthMonitor::new(Duration::from_millis(10));

        let (conn, _peer) = track(&owner);
        monitor.arm(Arc::clone(&owner), Arc::clone(&conn));
        owner.stopped.store(true, Ordering::Release);

        let timers = || {
            owner
                .reactor
                .pending_matching(|op| matches!(op, OpType::Timer { .. }))
        };
        wait_for(|| timers() == 0).await;

        // Only the timer let go; the connection is drained elsewhere.
        assert!(owner.registry.contains(&conn));
        assert_eq!(conn.status(), ConnStatus::Connected);
        assert_eq!(Arc::strong_count(&owner), 1);
    }
}

//! TCP echo server.
//!
//! Composes the acceptor, the connection registry, and the health monitor on
//! top of a shared reactor. The server state is reference counted: the
//! pending accept and every health timer hold it, so it is torn down (and
//! every remaining connection closed) only after `stop` and the release of
//! the last of those references.

use crate::health::{HealthMonitor, Monitored};
use crate::runtime::{
    Acceptor, Completion, Connection, ConnectionRegistry, Reactor, StartError,
};
use crate::shutdown::Phase;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, error, info, trace, warn};

/// Tunables for a server instance.
#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    /// Maximum number of tracked connections.
    pub max_connections: usize,
    /// Interval between health checks of each connection.
    pub health_interval: Duration,
}

/// External handle to a running server.
pub struct Server {
    shared: Arc<Shared>,
}

struct Shared {
    reactor: Arc<Reactor>,
    registry: Arc<ConnectionRegistry>,
    acceptor: Acceptor,
    health: HealthMonitor,
    stopped: AtomicBool,
}

impl Server {
    /// Bind `host:port` and issue the first accept.
    ///
    /// `host` must be an IP literal. Failure here is fatal for the caller.
    pub fn start(
        reactor: &Arc<Reactor>,
        options: ServerOptions,
        host: &str,
        port: u16,
    ) -> Result<Self, StartError> {
        let acceptor = {
            let _enter = reactor.handle().enter();
            Acceptor::open(host, port)?
        };

        let shared = Arc::new(Shared {
            reactor: Arc::clone(reactor),
            registry: Arc::new(ConnectionRegistry::new(options.max_connections)),
            acceptor,
            health: HealthMonitor::new(options.health_interval),
            stopped: AtomicBool::new(false),
        });
        shared.issue_accept();

        info!(
            addr = %shared.acceptor.local_addr(),
            max_connections = options.max_connections,
            health_interval_ms = options.health_interval.as_millis() as u64,
            "Server started"
        );

        Ok(Self { shared })
    }

    /// Close the listener. No connection is accepted afterwards.
    ///
    /// Remaining connections are closed once the last reference to the
    /// server state is released.
    pub fn stop(&self) {
        self.shared.acceptor.close(&self.shared.stopped);
        self.shared.reactor.lifecycle().advance(Phase::Stopping);
    }

    #[cfg(test)]
    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopped()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.acceptor.local_addr()
    }

    /// Number of currently tracked connections.
    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// The registry outlives the server handle, which lets callers observe
    /// the drain.
    #[cfg(test)]
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.shared.registry)
    }

    #[cfg(test)]
    pub fn phase(&self) -> Phase {
        self.shared.reactor.lifecycle().phase()
    }
}

impl Shared {
    fn issue_accept(self: &Arc<Self>) {
        let shared = Arc::clone(self);
        self.acceptor
            .arm(&self.reactor, move |outcome| shared.on_accept(outcome));
    }

    fn on_accept(self: Arc<Self>, outcome: Completion<(TcpStream, SocketAddr)>) {
        match outcome {
            Completion::Cancelled => {
                trace!("Accept canceled");
                return;
            }
            Completion::Done((stream, peer)) => self.admit(stream, peer),
            // Transient accept errors must not end the accept chain.
            Completion::Failed(e) => error!(error = %e, "Accept error"),
        }
        self.issue_accept();
    }

    fn admit(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if self.is_stopped() {
            debug!(peer = %peer, "Server stopped, dropping accepted socket");
            return;
        }

        let reactor = Arc::clone(&self.reactor);
        let conn = self
            .registry
            .insert_with(|id| Connection::from_tcp(id, reactor, stream));

        match conn {
            Some(conn) => {
                info!(conn_id = conn.id(), peer = %peer, "Accepted connection");
                conn.start();
                self.health.arm(Arc::clone(self), conn);
            }
            None => {
                warn!(
                    peer = %peer,
                    max_connections = self.registry.capacity(),
                    "Connection limit reached, rejecting"
                );
            }
        }
    }
}

impl Monitored for Shared {
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

impl Drop for Shared {
    fn drop(&mut self) {
        self.reactor.lifecycle().advance(Phase::Draining);
        let closed = self.registry.close_all();
        info!(closed, "Server drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ConnStatus, WorkerPool};
    use std::io::{ErrorKind, Read, Write};
    use std::net::TcpStream as StdTcpStream;
    use std::thread;
    use std::time::Instant;

    fn options() -> ServerOptions {
        ServerOptions {
            max_connections: 64,
            health_interval: Duration::from_millis(50),
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn connect(addr: SocketAddr) -> StdTcpStream {
        let stream = StdTcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    fn round_trip(stream: &mut StdTcpStream, msg: &[u8]) -> Vec<u8> {
        stream.write_all(msg).unwrap();
        let mut buf = vec![0u8; msg.len()];
        stream.read_exact(&mut buf).unwrap();
        buf
    }

    /// True once the peer has closed: EOF or reset.
    fn peer_closed(stream: &mut StdTcpStream) -> bool {
        let mut buf = [0u8; 16];
        match stream.read(&mut buf) {
            Ok(0) => true,
            Ok(_) => false,
            Err(e) => matches!(
                e.kind(),
                ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe
            ),
        }
    }

    fn shutdown(pool: WorkerPool, server: Server) {
        server.stop();
        drop(server);
        assert!(pool.join(Duration::from_secs(5)));
    }

    #[test]
    fn test_hello_round_trip() {
        let pool = WorkerPool::new(4).unwrap();
        let server = Server::start(pool.reactor(), options(), "127.0.0.1", 0).unwrap();
        assert_eq!(server.phase(), Phase::Running);

        let mut client = connect(server.local_addr());
        assert_eq!(round_trip(&mut client, b"hello"), b"hello");
        assert_eq!(round_trip(&mut client, b"world"), b"world");

        shutdown(pool, server);
    }

    #[test]
    fn test_large_payload_is_echoed_in_order() {
        let pool = WorkerPool::new(4).unwrap();
        let server = Server::start(pool.reactor(), options(), "127.0.0.1", 0).unwrap();
        let registry = server.registry();

        let payload: Vec<u8> = (0..20 * 1024).map(|i| (i % 253) as u8).collect();
        let mut client = connect(server.local_addr());
        assert_eq!(round_trip(&mut client, &payload), payload);

        let conns = registry.snapshot();
        assert_eq!(conns.len(), 1);
        let stats = conns[0].stats();
        assert!(stats.reads >= 2, "16 KiB buffer forces at least two reads");
        assert_eq!(stats.bytes_read, payload.len() as u64);
        assert!(stats.peak_reads_in_flight <= 1);
        assert!(stats.peak_writes_in_flight <= 1);

        shutdown(pool, server);
    }

    #[test]
    fn test_stop_drains_all_clients() {
        const CLIENTS: usize = 8;

        let pool = WorkerPool::new(4).unwrap();
        let reactor = Arc::clone(pool.reactor());
        let server = Server::start(&reactor, options(), "127.0.0.1", 0).unwrap();
        let addr = server.local_addr();
        let registry = server.registry();

        let mut clients: Vec<_> = (0..CLIENTS)
            .map(|i| {
                let mut client = connect(addr);
                let msg = format!("client-{i}");
                assert_eq!(round_trip(&mut client, msg.as_bytes()), msg.as_bytes());
                client
            })
            .collect();
        assert_eq!(server.connection_count(), CLIENTS);
        let conns = registry.snapshot();

        server.stop();
        server.stop();
        assert!(server.is_stopped());
        assert_eq!(server.phase(), Phase::Stopping);

        // The listener goes away as soon as the pending accept lets go.
        wait_until(|| StdTcpStream::connect(addr).is_err());

        drop(server);
        assert!(pool.join(Duration::from_secs(5)));
        assert_eq!(reactor.lifecycle().phase(), Phase::Idle);

        assert!(registry.is_empty());
        for conn in &conns {
            assert_eq!(conn.status(), ConnStatus::Closed);
            assert_eq!(conn.stats().close_actions, 1);
        }
        for client in &mut clients {
            assert!(peer_closed(client));
        }
        assert!(StdTcpStream::connect(addr).is_err());
    }

    #[test]
    fn test_disconnected_client_is_reaped() {
        let pool = WorkerPool::new(2).unwrap();
        let server = Server::start(pool.reactor(), options(), "127.0.0.1", 0).unwrap();

        let mut keep = connect(server.local_addr());
        round_trip(&mut keep, b"stay");

        let mut leave = connect(server.local_addr());
        round_trip(&mut leave, b"bye");
        assert_eq!(server.connection_count(), 2);

        drop(leave);
        wait_until(|| server.connection_count() == 1);
        assert_eq!(round_trip(&mut keep, b"still here"), b"still here");

        shutdown(pool, server);
    }

    #[test]
    fn test_connection_limit_rejects_extra_clients() {
        let pool = WorkerPool::new(2).unwrap();
        let opts = ServerOptions {
            max_connections: 1,
            ..options()
        };
        let server = Server::start(pool.reactor(), opts, "127.0.0.1", 0).unwrap();

        let mut first = connect(server.local_addr());
        round_trip(&mut first, b"first");

        let mut second = connect(server.local_addr());
        assert!(peer_closed(&mut second));
        assert_eq!(server.connection_count(), 1);
        assert_eq!(round_trip(&mut first, b"again"), b"again");

        shutdown(pool, server);
    }

    #[test]
    fn test_start_failures() {
        let pool = WorkerPool::new(1).unwrap();

        match Server::start(pool.reactor(), options(), "localhost-ish", 0) {
            Err(StartError::InvalidAddress(host)) => assert_eq!(host, "localhost-ish"),
            other => panic!("unexpected: {:?}", other.err()),
        }

        let server = Server::start(pool.reactor(), options(), "127.0.0.1", 0).unwrap();
        let port = server.local_addr().port();
        assert!(matches!(
            Server::start(pool.reactor(), options(), "127.0.0.1", port),
            Err(StartError::Listen(..))
        ));

        shutdown(pool, server);
    }
}

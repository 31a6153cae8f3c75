//! Listening socket and the accept chain.
//!
//! Re-arming an accept and closing the listener both happen under the same
//! guard, so once the listener is closed no new accept can be issued.

use crate::runtime::connection::Completion;
use crate::runtime::reactor::Reactor;
use crate::runtime::token::OpType;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, trace};

/// Listen backlog.
pub const BACKLOG: i32 = 1024;

/// Errors that prevent the server from starting.
#[derive(Debug)]
pub enum StartError {
    /// The host is not an IP address literal.
    InvalidAddress(String),
    /// Opening, binding, or listening on the socket failed.
    Listen(SocketAddr, io::Error),
}

impl fmt::Display for StartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartError::InvalidAddress(host) => write!(f, "Invalid listen address '{}'", host),
            StartError::Listen(addr, e) => write!(f, "Failed to listen on {}: {}", addr, e),
        }
    }
}

impl std::error::Error for StartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StartError::InvalidAddress(_) => None,
            StartError::Listen(_, e) => Some(e),
        }
    }
}

/// Parse `host` as an IP literal and combine it with `port`.
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr, StartError> {
    host.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, port))
        .map_err(|_| StartError::InvalidAddress(host.to_string()))
}

/// Open a non-blocking listener with SO_REUSEADDR.
///
/// The socket is closed again if any step fails.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

/// The server's listening handle.
pub struct Acceptor {
    listener: Mutex<Option<Arc<TcpListener>>>,
    cancel: CancellationToken,
    local_addr: SocketAddr,
}

impl Acceptor {
    /// Bind and listen on `host:port`.
    ///
    /// Must be called from within the reactor's runtime context.
    pub fn open(host: &str, port: u16) -> Result<Self, StartError> {
        let addr = resolve(host, port)?;
        let listener = create_listener(addr)
            .and_then(TcpListener::from_std)
            .map_err(|e| StartError::Listen(addr, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| StartError::Listen(addr, e))?;

        info!(addr = %local_addr, backlog = BACKLOG, "Listening");

        Ok(Self {
            listener: Mutex::new(Some(Arc::new(listener))),
            cancel: CancellationToken::new(),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    /// Issue the next accept unless the listener has been closed.
    ///
    /// `on_accept` runs on whichever worker completes the accept.
    pub fn arm<F>(&self, reactor: &Arc<Reactor>, on_accept: F) -> bool
    where
        F: FnOnce(Completion<(TcpStream, SocketAddr)>) + Send + 'static,
    {
        let slot = self.lock();
        let Some(listener) = slot.as_ref().map(Arc::clone) else {
            trace!("Acceptor closed, not re-arming");
            return false;
        };
        let cancel = self.cancel.clone();
        reactor.submit(OpType::Accept, async move {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Completion::Cancelled,
                res = listener.accept() => Completion::from(res),
            };
            // Release the listener before the handler runs so a closed
            // acceptor's socket goes away with its last accept.
            drop(listener);
            on_accept(outcome);
        });
        true
    }

    /// Close the listener and raise `stopped`, both under the guard.
    ///
    /// A pending accept completes as cancelled. Repeated calls are harmless.
    pub fn close(&self, stopped: &AtomicBool) {
        let mut slot = self.lock();
        self.cancel.cancel();
        if slot.take().is_some() {
            info!(addr = %self.local_addr, "Acceptor closed");
        }
        stopped.store(true, Ordering::Release);
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<TcpListener>>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_resolve() {
        let addr = resolve("127.0.0.1", 7000).unwrap();
        assert_eq!(addr, "127.0.0.1:7000".parse().unwrap());

        let addr = resolve("::1", 7000).unwrap();
        assert!(addr.is_ipv6());

        assert!(matches!(
            resolve("not-an-ip", 7000),
            Err(StartError::InvalidAddress(_))
        ));
        assert!(matches!(resolve("", 7000), Err(StartError::InvalidAddress(_))));
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let first = Acceptor::open("127.0.0.1", 0).unwrap();
        let port = first.local_addr().port();

        match Acceptor::open("127.0.0.1", port) {
            Err(StartError::Listen(addr, _)) => assert_eq!(addr.port(), port),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("second bind on a listening port should fail"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_cancels_pending_accept() {
        let reactor = Reactor::current();
        let acceptor = Acceptor::open("127.0.0.1", 0).unwrap();
        let stopped = AtomicBool::new(false);
        let (tx, rx) = tokio::sync::oneshot::channel();

        assert!(acceptor.arm(&reactor, move |outcome| {
            let _ = tx.send(matches!(outcome, Completion::Cancelled));
        }));

        acceptor.close(&stopped);
        acceptor.close(&stopped);

        let cancelled = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(cancelled);
        assert!(stopped.load(Ordering::Acquire));
        assert!(!acceptor.is_open());
        assert!(!acceptor.arm(&reactor, |_| {}));

        tokio::time::timeout(Duration::from_secs(5), reactor.wait_idle())
            .await
            .unwrap();
    }
}

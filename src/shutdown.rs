//! Shutdown coordination.
//!
//! ```text
//! Running ──stop()──▶ Stopping ──last server ref released──▶ Draining
//!                                                               │
//!                               reactor has no pending work ◀───┘
//!                                          │
//!                                          ▼
//!                                        Idle
//! ```
//!
//! The phase only moves forward. The control thread blocks on a
//! [`StopSignal`] instead of polling a flag.

use std::sync::atomic::{AtomicU8, Ordering};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Server lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Phase {
    /// Accepting and serving connections.
    Running = 0,
    /// Acceptor closed, no new connections.
    Stopping = 1,
    /// Every tracked connection has been closed.
    Draining = 2,
    /// The reactor has no pending operations left.
    Idle = 3,
}

impl Phase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Phase::Running,
            1 => Phase::Stopping,
            2 => Phase::Draining,
            _ => Phase::Idle,
        }
    }
}

/// Monotonic phase tracker shared by the server and the worker pool.
#[derive(Debug)]
pub struct Lifecycle {
    phase: AtomicU8,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(Phase::Running as u8),
        }
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Move to `to` if it is ahead of the current phase.
    ///
    /// Returns true if this call performed the transition.
    pub fn advance(&self, to: Phase) -> bool {
        let prev = self.phase.fetch_max(to as u8, Ordering::AcqRel);
        if prev < to as u8 {
            info!(from = ?Phase::from_u8(prev), to = ?to, "Lifecycle transition");
            true
        } else {
            false
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// The "stop requested" flag, delivered by OS signals or programmatically.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    token: CancellationToken,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop. Idempotent.
    pub fn request(&self) {
        self.token.cancel();
    }

    #[cfg(test)]
    pub fn is_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once a stop has been requested.
    pub async fn requested(&self) {
        self.token.cancelled().await
    }
}

/// Wait for SIGINT, SIGTERM, or an explicit [`StopSignal::request`].
///
/// Marks `stop` as requested before returning.
pub async fn wait_for_signal(stop: &StopSignal) {
    let interrupt = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT"),
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGINT");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("Received SIGTERM");
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
        _ = stop.requested() => info!("Stop requested"),
    }

    stop.request();
}

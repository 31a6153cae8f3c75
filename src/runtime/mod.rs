//! Shared-reactor runtime for the echo server.
//!
//! Building blocks, leaves first:
//! - `Token`: in-flight operation tracking
//! - `Reactor`: the shared event loop every operation is submitted to
//! - `Connection`: per-socket read/echo/write state machine
//! - `ConnectionRegistry`: the set of tracked connections
//! - `Acceptor`: listening socket and accept chain
//! - `WorkerPool`: threads driving the reactor

mod acceptor;
mod connection;
mod pool;
mod reactor;
mod token;

pub use acceptor::{Acceptor, StartError};
pub(crate) use connection::Completion;
pub use connection::{ConnStatus, Connection, ConnectionRegistry};
pub use pool::WorkerPool;
pub use reactor::Reactor;
pub use token::OpType;
